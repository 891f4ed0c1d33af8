//! Error taxonomy for the render path. Severity decides what the end-frame
//! hook does: drop the frame, tear down the session, or abort the process.

use thiserror::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Current frame dropped; the compositor continues.
    Transient,
    /// Compositor torn down; reinitialises on the next session.
    SessionFatal,
    /// Abort with diagnostic; there is no safe way to continue.
    ProcessFatal,
}

#[derive(Debug, Error)]
pub enum CompositorError {
    #[error("no frame has been published")]
    NoFrame,
    #[error("producer session changed mid-map")]
    StaleSession,
    #[error("seqlock retry limit exceeded")]
    SeqlockRetryExceeded,
    #[error("swapchain image unavailable: {0:?}")]
    SwapchainImageUnavailable(openxr_sys::Result),
    #[error("backend command failed: {0}")]
    BackendCommandFailed(String),

    #[error("swapchain creation failed: {0:?}")]
    SwapchainCreateFailed(openxr_sys::Result),
    #[error("graphics device lost: {0}")]
    DeviceLost(String),

    #[error("API layer registration failed: {0}")]
    ManifestRegistrationFailed(String),
    #[error("on-wire layout invalid: {0}")]
    InvalidOnWireLayout(String),
    #[error("unrecoverable fence state: {0}")]
    UnrecoverableFenceState(String),
}

impl CompositorError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::NoFrame
            | Self::StaleSession
            | Self::SeqlockRetryExceeded
            | Self::SwapchainImageUnavailable(_)
            | Self::BackendCommandFailed(_) => Severity::Transient,
            Self::SwapchainCreateFailed(_) | Self::DeviceLost(_) => Severity::SessionFatal,
            Self::ManifestRegistrationFailed(_)
            | Self::InvalidOnWireLayout(_)
            | Self::UnrecoverableFenceState(_) => Severity::ProcessFatal,
        }
    }
}

impl From<crate::sprite::Error> for CompositorError {
    fn from(e: crate::sprite::Error) -> Self {
        Self::BackendCommandFailed(e.to_string())
    }
}

impl From<crate::shm::Error> for CompositorError {
    fn from(e: crate::shm::Error) -> Self {
        use crate::shm::Error as Shm;
        match e {
            Shm::NoFrame => Self::NoFrame,
            Shm::StaleSession => Self::StaleSession,
            Shm::SeqlockRetryExceeded => Self::SeqlockRetryExceeded,
            Shm::FenceNotReady { committed, proposed } => Self::UnrecoverableFenceState(format!(
                "fence regressed from {committed} to {proposed}"
            )),
            Shm::InvalidOnWireLayout(detail) => Self::InvalidOnWireLayout(detail),
            Shm::VersionMismatch { found, expected } => {
                Self::InvalidOnWireLayout(format!("wire version {found}, expected {expected}"))
            }
            Shm::ShmNotAvailable(e) => Self::BackendCommandFailed(format!("shm: {e}")),
            Shm::TooManyLayers { count, max } => {
                Self::InvalidOnWireLayout(format!("{count} layers > {max}"))
            }
        }
    }
}

/// Log and abort, with a debugger break first in debug builds.
pub fn fatal(message: &str) -> ! {
    log::error!("fatal: {message}");
    #[cfg(debug_assertions)]
    {
        // Equivalent of a debug break: make the failure stop a debugger
        // before the abort tears the process down.
        debug_assert!(false, "fatal: {message}");
    }
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_classes() {
        assert_eq!(CompositorError::NoFrame.severity(), Severity::Transient);
        assert_eq!(
            CompositorError::SwapchainCreateFailed(openxr_sys::Result::ERROR_RUNTIME_FAILURE)
                .severity(),
            Severity::SessionFatal
        );
        assert_eq!(
            CompositorError::UnrecoverableFenceState("regressed".into()).severity(),
            Severity::ProcessFatal
        );
    }

    #[test]
    fn shm_errors_map_to_render_severities() {
        let e: CompositorError = crate::shm::Error::SeqlockRetryExceeded.into();
        assert_eq!(e.severity(), Severity::Transient);

        let e: CompositorError = crate::shm::Error::FenceNotReady {
            committed: 2,
            proposed: 1,
        }
        .into();
        assert_eq!(e.severity(), Severity::ProcessFatal);
    }
}
