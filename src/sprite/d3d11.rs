//! D3D11 sprite batch. The caller is responsible for wrapping draws in a
//! device-context state save/restore when sharing the host application's
//! immediate context (see `compositor::d3d11`).

use super::geometry::{build_draw_data, SpriteConstants, Vertex};
use super::{BatchRecorder, Error, SpriteInfo, MAX_SPRITES_PER_BATCH};
use crate::geometry::{Color, Rect, Size};
use windows::core::s;
use windows::Win32::Graphics::Direct3D::Fxc::D3DCompile;
use windows::Win32::Graphics::Direct3D::{ID3DBlob, D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST};
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT_R32G32B32A32_FLOAT, DXGI_FORMAT_R32G32_FLOAT, DXGI_FORMAT_R32_UINT,
};

const VERTEX_CAPACITY: usize = MAX_SPRITES_PER_BATCH * super::VERTICES_PER_SPRITE;

fn win_err(context: &str, e: windows::core::Error) -> Error {
    Error::Backend(format!("{context}: {e}"))
}

pub(crate) fn compile_shader(entry_point: &str, target: &str) -> Result<Vec<u8>, Error> {
    let source = super::SPRITE_HLSL;
    let entry = std::ffi::CString::new(entry_point).expect("entry point contains NUL");
    let target = std::ffi::CString::new(target).expect("target contains NUL");
    let mut code: Option<ID3DBlob> = None;
    let mut errors: Option<ID3DBlob> = None;
    let result = unsafe {
        D3DCompile(
            source.as_ptr().cast(),
            source.len(),
            s!("sprite.hlsl"),
            None,
            None,
            windows::core::PCSTR(entry.as_ptr().cast()),
            windows::core::PCSTR(target.as_ptr().cast()),
            0,
            0,
            &mut code,
            Some(&mut errors),
        )
    };
    if let Err(e) = result {
        let detail = errors
            .map(|blob| unsafe {
                let bytes = std::slice::from_raw_parts(
                    blob.GetBufferPointer().cast::<u8>(),
                    blob.GetBufferSize(),
                );
                String::from_utf8_lossy(bytes).into_owned()
            })
            .unwrap_or_default();
        return Err(Error::Backend(format!(
            "D3DCompile({entry_point}) failed: {e}: {detail}"
        )));
    }
    let code = code.expect("D3DCompile succeeded without bytecode");
    Ok(unsafe {
        std::slice::from_raw_parts(code.GetBufferPointer().cast::<u8>(), code.GetBufferSize())
    }
    .to_vec())
}

struct ActiveTarget {
    context: ID3D11DeviceContext1,
    rtv: ID3D11RenderTargetView,
}

pub struct SpriteBatch {
    vertex_shader: ID3D11VertexShader,
    pixel_shader: ID3D11PixelShader,
    input_layout: ID3D11InputLayout,
    blend_state: ID3D11BlendState,
    sampler: ID3D11SamplerState,
    vertex_buffer: ID3D11Buffer,
    constant_buffer: ID3D11Buffer,
    recorder: BatchRecorder,
    sources: Vec<Option<ID3D11ShaderResourceView>>,
    target: Option<ActiveTarget>,
}

impl SpriteBatch {
    pub fn new(device: &ID3D11Device1) -> Result<Self, Error> {
        let vs_bytecode = compile_shader("SpriteVertexShader", "vs_5_0")?;
        let ps_bytecode = compile_shader("SpritePixelShader", "ps_5_0")?;

        let mut vertex_shader = None;
        unsafe { device.CreateVertexShader(&vs_bytecode, None, Some(&mut vertex_shader)) }
            .map_err(|e| win_err("CreateVertexShader", e))?;
        let mut pixel_shader = None;
        unsafe { device.CreatePixelShader(&ps_bytecode, None, Some(&mut pixel_shader)) }
            .map_err(|e| win_err("CreatePixelShader", e))?;

        let input_elements = [
            D3D11_INPUT_ELEMENT_DESC {
                SemanticName: s!("SV_Position"),
                SemanticIndex: 0,
                Format: DXGI_FORMAT_R32G32_FLOAT,
                InputSlot: 0,
                AlignedByteOffset: std::mem::offset_of!(Vertex, position) as u32,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            },
            D3D11_INPUT_ELEMENT_DESC {
                SemanticName: s!("COLOR"),
                SemanticIndex: 0,
                Format: DXGI_FORMAT_R32G32B32A32_FLOAT,
                InputSlot: 0,
                AlignedByteOffset: std::mem::offset_of!(Vertex, color) as u32,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            },
            D3D11_INPUT_ELEMENT_DESC {
                SemanticName: s!("TEXCOORD"),
                SemanticIndex: 0,
                Format: DXGI_FORMAT_R32G32_FLOAT,
                InputSlot: 0,
                AlignedByteOffset: std::mem::offset_of!(Vertex, tex_coord) as u32,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            },
            D3D11_INPUT_ELEMENT_DESC {
                SemanticName: s!("TEXTURE_INDEX"),
                SemanticIndex: 0,
                Format: DXGI_FORMAT_R32_UINT,
                InputSlot: 0,
                AlignedByteOffset: std::mem::offset_of!(Vertex, texture_index) as u32,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            },
        ];
        let mut input_layout = None;
        unsafe { device.CreateInputLayout(&input_elements, &vs_bytecode, Some(&mut input_layout)) }
            .map_err(|e| win_err("CreateInputLayout", e))?;

        let mut blend_desc = D3D11_BLEND_DESC::default();
        blend_desc.RenderTarget[0] = D3D11_RENDER_TARGET_BLEND_DESC {
            BlendEnable: true.into(),
            SrcBlend: D3D11_BLEND_ONE,
            DestBlend: D3D11_BLEND_INV_SRC_ALPHA,
            BlendOp: D3D11_BLEND_OP_ADD,
            SrcBlendAlpha: D3D11_BLEND_ONE,
            DestBlendAlpha: D3D11_BLEND_INV_SRC_ALPHA,
            BlendOpAlpha: D3D11_BLEND_OP_ADD,
            RenderTargetWriteMask: D3D11_COLOR_WRITE_ENABLE_ALL.0 as u8,
        };
        let mut blend_state = None;
        unsafe { device.CreateBlendState(&blend_desc, Some(&mut blend_state)) }
            .map_err(|e| win_err("CreateBlendState", e))?;

        let sampler_desc = D3D11_SAMPLER_DESC {
            Filter: D3D11_FILTER_MIN_MAG_LINEAR_MIP_POINT,
            AddressU: D3D11_TEXTURE_ADDRESS_CLAMP,
            AddressV: D3D11_TEXTURE_ADDRESS_CLAMP,
            AddressW: D3D11_TEXTURE_ADDRESS_CLAMP,
            ComparisonFunc: D3D11_COMPARISON_NEVER,
            MaxLOD: f32::MAX,
            ..Default::default()
        };
        let mut sampler = None;
        unsafe { device.CreateSamplerState(&sampler_desc, Some(&mut sampler)) }
            .map_err(|e| win_err("CreateSamplerState", e))?;

        let vertex_buffer_desc = D3D11_BUFFER_DESC {
            ByteWidth: (VERTEX_CAPACITY * std::mem::size_of::<Vertex>()) as u32,
            Usage: D3D11_USAGE_DYNAMIC,
            BindFlags: D3D11_BIND_VERTEX_BUFFER.0 as u32,
            CPUAccessFlags: D3D11_CPU_ACCESS_WRITE.0 as u32,
            ..Default::default()
        };
        let mut vertex_buffer = None;
        unsafe { device.CreateBuffer(&vertex_buffer_desc, None, Some(&mut vertex_buffer)) }
            .map_err(|e| win_err("CreateBuffer(vertices)", e))?;

        let constant_buffer_desc = D3D11_BUFFER_DESC {
            ByteWidth: std::mem::size_of::<SpriteConstants>() as u32,
            Usage: D3D11_USAGE_DYNAMIC,
            BindFlags: D3D11_BIND_CONSTANT_BUFFER.0 as u32,
            CPUAccessFlags: D3D11_CPU_ACCESS_WRITE.0 as u32,
            ..Default::default()
        };
        let mut constant_buffer = None;
        unsafe { device.CreateBuffer(&constant_buffer_desc, None, Some(&mut constant_buffer)) }
            .map_err(|e| win_err("CreateBuffer(constants)", e))?;

        Ok(Self {
            vertex_shader: vertex_shader.expect("shader created"),
            pixel_shader: pixel_shader.expect("shader created"),
            input_layout: input_layout.expect("layout created"),
            blend_state: blend_state.expect("blend state created"),
            sampler: sampler.expect("sampler created"),
            vertex_buffer: vertex_buffer.expect("buffer created"),
            constant_buffer: constant_buffer.expect("buffer created"),
            recorder: BatchRecorder::default(),
            sources: Vec::with_capacity(MAX_SPRITES_PER_BATCH),
            target: None,
        })
    }

    pub fn begin(
        &mut self,
        context: &ID3D11DeviceContext1,
        rtv: &ID3D11RenderTargetView,
        dest_size: Size<u32>,
    ) -> Result<(), Error> {
        self.recorder.begin(dest_size)?;
        self.sources.clear();
        self.target = Some(ActiveTarget {
            context: context.clone(),
            rtv: rtv.clone(),
        });
        Ok(())
    }

    pub fn clear(&mut self, color: Color) -> Result<(), Error> {
        self.recorder.clear(color)
    }

    pub fn draw(
        &mut self,
        source: &ID3D11ShaderResourceView,
        source_size: Size<u32>,
        source_rect: Rect<u32>,
        dest_rect: Rect<u32>,
        tint: Color,
    ) -> Result<(), Error> {
        self.recorder.draw(SpriteInfo {
            source_size,
            source_rect,
            dest_rect,
            tint,
        })?;
        self.sources.push(Some(source.clone()));
        Ok(())
    }

    pub fn end(&mut self) -> Result<(), Error> {
        let batch = self.recorder.end()?;
        let target = self.target.take().expect("recorder open implies target");
        let data = build_draw_data(&batch);
        let ctx = &target.context;

        self.upload(ctx, &self.vertex_buffer, bytemuck::cast_slice(&data.vertices))?;
        self.upload(ctx, &self.constant_buffer, bytemuck::bytes_of(&data.constants))?;

        if let Some(color) = batch.clear_color {
            unsafe { ctx.ClearRenderTargetView(&target.rtv, &color.to_array()) };
        }

        let viewport = D3D11_VIEWPORT {
            TopLeftX: 0.0,
            TopLeftY: 0.0,
            Width: batch.dest_size.width as f32,
            Height: batch.dest_size.height as f32,
            MinDepth: 0.0,
            MaxDepth: 1.0,
        };
        let mut srvs = self.sources.clone();
        srvs.resize(MAX_SPRITES_PER_BATCH, None);

        unsafe {
            ctx.IASetInputLayout(&self.input_layout);
            ctx.IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            ctx.IASetVertexBuffers(
                0,
                1,
                Some(&Some(self.vertex_buffer.clone())),
                Some(&(std::mem::size_of::<Vertex>() as u32)),
                Some(&0),
            );
            ctx.VSSetShader(&self.vertex_shader, None);
            ctx.VSSetConstantBuffers(0, Some(&[Some(self.constant_buffer.clone())]));
            ctx.PSSetShader(&self.pixel_shader, None);
            ctx.PSSetConstantBuffers(0, Some(&[Some(self.constant_buffer.clone())]));
            ctx.PSSetShaderResources(0, Some(&srvs));
            ctx.PSSetSamplers(0, Some(&[Some(self.sampler.clone())]));
            ctx.RSSetViewports(Some(&[viewport]));
            ctx.OMSetRenderTargets(Some(&[Some(target.rtv.clone())]), None);
            ctx.OMSetBlendState(&self.blend_state, None, u32::MAX);
            ctx.Draw(data.vertices.len() as u32, 0);
        }
        Ok(())
    }

    fn upload(
        &self,
        ctx: &ID3D11DeviceContext1,
        buffer: &ID3D11Buffer,
        bytes: &[u8],
    ) -> Result<(), Error> {
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe {
            ctx.Map(buffer, 0, D3D11_MAP_WRITE_DISCARD, 0, Some(&mut mapped))
                .map_err(|e| win_err("Map", e))?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), mapped.pData.cast::<u8>(), bytes.len());
            ctx.Unmap(buffer, 0);
        }
        Ok(())
    }
}
