//! Named shared-memory mappings. Windows uses session-local named file
//! mappings plus a named mutex for the writer lock; POSIX uses `shm_open`
//! with `flock` on the object's descriptor.

use super::Error;
use std::ptr::NonNull;

pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    platform: Platform,
}

// The mapping is plain shared memory; all concurrent access goes through
// atomics or seqlock-copied snapshots.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Create (or re-attach to) the mapping as the producer.
    pub fn create(name: &str, len: usize) -> Result<Self, Error> {
        Platform::create(name, len).map(|(ptr, platform)| Self { ptr, len, platform })
    }

    /// Attach to an existing producer's mapping.
    pub fn open(name: &str, len: usize) -> Result<Self, Error> {
        Platform::open(name, len).map(|(ptr, platform)| Self { ptr, len, platform })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Block until the cross-process writer lock is held. The producer takes
    /// this once and holds it for its lifetime; pairs with
    /// [`Mapping::unlock_writer`].
    pub fn lock_writer(&self) -> Result<(), Error> {
        self.platform.lock_writer()
    }

    pub fn unlock_writer(&self) {
        self.platform.unlock_writer()
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        self.platform.unmap(self.ptr.as_ptr(), self.len);
    }
}

#[cfg(unix)]
use posix::Platform;

#[cfg(unix)]
mod posix {
    use super::*;
    use std::ffi::CString;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    // The object name is never unlinked: consumers that outlive a producer
    // re-see the same region when the next producer attaches, matching the
    // lifetime of a Windows named mapping.
    pub struct Platform {
        fd: OwnedFd,
    }

    fn last_error() -> Error {
        Error::ShmNotAvailable(std::io::Error::last_os_error())
    }

    impl Platform {
        pub fn create(name: &str, len: usize) -> Result<(NonNull<u8>, Self), Error> {
            let c_name = CString::new(name).expect("mapping name contains NUL");
            let fd = unsafe {
                libc::shm_open(
                    c_name.as_ptr(),
                    libc::O_CREAT | libc::O_RDWR,
                    libc::S_IRUSR | libc::S_IWUSR,
                )
            };
            if fd < 0 {
                return Err(last_error());
            }
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
                return Err(last_error());
            }
            let ptr = Self::map(&fd, len)?;
            Ok((ptr, Self { fd }))
        }

        pub fn open(name: &str, len: usize) -> Result<(NonNull<u8>, Self), Error> {
            let c_name = CString::new(name).expect("mapping name contains NUL");
            let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
            if fd < 0 {
                return Err(last_error());
            }
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            let ptr = Self::map(&fd, len)?;
            Ok((ptr, Self { fd }))
        }

        fn map(fd: &OwnedFd, len: usize) -> Result<NonNull<u8>, Error> {
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd.as_raw_fd(),
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(last_error());
            }
            NonNull::new(ptr.cast()).ok_or_else(last_error)
        }

        pub fn lock_writer(&self) -> Result<(), Error> {
            if unsafe { libc::flock(self.fd.as_raw_fd(), libc::LOCK_EX) } != 0 {
                return Err(last_error());
            }
            Ok(())
        }

        pub fn unlock_writer(&self) {
            unsafe { libc::flock(self.fd.as_raw_fd(), libc::LOCK_UN) };
        }

        pub fn unmap(&self, ptr: *mut u8, len: usize) {
            unsafe { libc::munmap(ptr.cast(), len) };
        }
    }
}

#[cfg(windows)]
use win32::Platform;

#[cfg(windows)]
mod win32 {
    use super::*;
    use windows::core::HSTRING;
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::System::Memory::{
        CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
        PAGE_READWRITE,
    };
    use windows::Win32::System::Threading::{
        CreateMutexW, ReleaseMutex, WaitForSingleObject, INFINITE,
    };

    pub struct Platform {
        mapping: HANDLE,
        mutex: HANDLE,
    }

    unsafe impl Send for Platform {}
    unsafe impl Sync for Platform {}

    fn last_error() -> Error {
        Error::ShmNotAvailable(std::io::Error::last_os_error())
    }

    impl Platform {
        pub fn create(name: &str, len: usize) -> Result<(NonNull<u8>, Self), Error> {
            let mapping = unsafe {
                CreateFileMappingW(
                    HANDLE(usize::MAX as _), // backed by the page file
                    None,
                    PAGE_READWRITE,
                    (len as u64 >> 32) as u32,
                    len as u32,
                    &HSTRING::from(name),
                )
            }
            .map_err(|e| Error::ShmNotAvailable(std::io::Error::from_raw_os_error(e.code().0)))?;
            Self::finish(mapping, name, len)
        }

        pub fn open(name: &str, len: usize) -> Result<(NonNull<u8>, Self), Error> {
            let mapping =
                unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS.0, false, &HSTRING::from(name)) }
                    .map_err(|e| {
                        Error::ShmNotAvailable(std::io::Error::from_raw_os_error(e.code().0))
                    })?;
            Self::finish(mapping, name, len)
        }

        fn finish(mapping: HANDLE, name: &str, len: usize) -> Result<(NonNull<u8>, Self), Error> {
            let view = unsafe { MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, len) };
            let Some(ptr) = NonNull::new(view.Value.cast::<u8>()) else {
                unsafe { CloseHandle(mapping).ok() };
                return Err(last_error());
            };
            let mutex =
                unsafe { CreateMutexW(None, false, &HSTRING::from(format!("{name}.mutex"))) }
                    .map_err(|e| {
                        Error::ShmNotAvailable(std::io::Error::from_raw_os_error(e.code().0))
                    })?;
            Ok((ptr, Self { mapping, mutex }))
        }

        pub fn lock_writer(&self) -> Result<(), Error> {
            unsafe { WaitForSingleObject(self.mutex, INFINITE) };
            Ok(())
        }

        pub fn unlock_writer(&self) {
            unsafe { ReleaseMutex(self.mutex).ok() };
        }

        pub fn unmap(&self, ptr: *mut u8, _len: usize) {
            unsafe {
                UnmapViewOfFile(windows::Win32::System::Memory::MEMORY_MAPPED_VIEW_ADDRESS {
                    Value: ptr.cast(),
                })
                .ok();
                CloseHandle(self.mapping).ok();
                CloseHandle(self.mutex).ok();
            }
        }
    }
}
