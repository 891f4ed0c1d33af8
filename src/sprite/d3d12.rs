//! D3D12 sprite batch. Descriptors are allocated from a shader-visible heap
//! in round-robin windows of `MAX_SPRITES_PER_BATCH`, so a window is never
//! rewritten while the GPU may still be reading it.

use super::geometry::{build_draw_data, SpriteConstants, Vertex};
use super::{BatchRecorder, Error, SpriteInfo, MAX_INFLIGHT_FRAMES, MAX_SPRITES_PER_BATCH};
use crate::geometry::{Color, Rect, Size};
use windows::Win32::Foundation::RECT;
use windows::Win32::Graphics::Direct3D::{ID3DBlob, D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT, DXGI_FORMAT_R32G32B32A32_FLOAT, DXGI_FORMAT_R32G32_FLOAT, DXGI_FORMAT_R32_UINT,
    DXGI_SAMPLE_DESC,
};

const VERTEX_CAPACITY: usize = MAX_SPRITES_PER_BATCH * super::VERTICES_PER_SPRITE;
// CBVs must sit on a 256-byte boundary; vertices follow the constants.
const VERTICES_OFFSET: usize = 1024;
const UPLOAD_LEN: usize = VERTICES_OFFSET + VERTEX_CAPACITY * std::mem::size_of::<Vertex>();

fn win_err(context: &str, e: windows::core::Error) -> Error {
    Error::Backend(format!("{context}: {e}"))
}

struct UploadBuffer {
    resource: ID3D12Resource,
    mapped: *mut u8,
}

struct ActiveTarget {
    list: ID3D12GraphicsCommandList,
    rtv: D3D12_CPU_DESCRIPTOR_HANDLE,
}

pub struct SpriteBatch {
    device: ID3D12Device,
    root_signature: ID3D12RootSignature,
    pipeline: ID3D12PipelineState,
    srv_heap: ID3D12DescriptorHeap,
    srv_descriptor_size: u32,
    uploads: Vec<UploadBuffer>,
    draw_count: usize,
    recorder: BatchRecorder,
    sources: Vec<ID3D12Resource>,
    target: Option<ActiveTarget>,
}

// Raw mapped pointers; writes only happen between begin()/end() on the
// render thread.
unsafe impl Send for SpriteBatch {}

impl SpriteBatch {
    pub fn new(device: &ID3D12Device, format: DXGI_FORMAT) -> Result<Self, Error> {
        let root_signature = create_root_signature(device)?;
        let pipeline = create_pipeline(device, &root_signature, format)?;

        let heap_desc = D3D12_DESCRIPTOR_HEAP_DESC {
            Type: D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
            NumDescriptors: (MAX_SPRITES_PER_BATCH * MAX_INFLIGHT_FRAMES) as u32,
            Flags: D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE,
            NodeMask: 0,
        };
        let srv_heap: ID3D12DescriptorHeap = unsafe { device.CreateDescriptorHeap(&heap_desc) }
            .map_err(|e| win_err("CreateDescriptorHeap", e))?;
        let srv_descriptor_size =
            unsafe { device.GetDescriptorHandleIncrementSize(D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV) };

        let uploads = (0..MAX_INFLIGHT_FRAMES)
            .map(|_| UploadBuffer::new(device))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            device: device.clone(),
            root_signature,
            pipeline,
            srv_heap,
            srv_descriptor_size,
            uploads,
            draw_count: 0,
            recorder: BatchRecorder::default(),
            sources: Vec::with_capacity(MAX_SPRITES_PER_BATCH),
            target: None,
        })
    }

    pub fn begin(
        &mut self,
        list: &ID3D12GraphicsCommandList,
        rtv: D3D12_CPU_DESCRIPTOR_HANDLE,
        dest_size: Size<u32>,
    ) -> Result<(), Error> {
        self.recorder.begin(dest_size)?;
        self.sources.clear();

        let viewport = D3D12_VIEWPORT {
            TopLeftX: 0.0,
            TopLeftY: 0.0,
            Width: dest_size.width as f32,
            Height: dest_size.height as f32,
            MinDepth: 0.0,
            MaxDepth: 1.0,
        };
        let scissor = RECT {
            left: 0,
            top: 0,
            right: dest_size.width as i32,
            bottom: dest_size.height as i32,
        };
        unsafe {
            list.SetGraphicsRootSignature(&self.root_signature);
            list.SetPipelineState(&self.pipeline);
            list.RSSetViewports(&[viewport]);
            list.RSSetScissorRects(&[scissor]);
            list.OMSetRenderTargets(1, Some(&rtv), false, None);
        }
        self.target = Some(ActiveTarget {
            list: list.clone(),
            rtv,
        });
        Ok(())
    }

    pub fn clear(&mut self, color: Color) -> Result<(), Error> {
        self.recorder.clear(color)
    }

    pub fn draw(
        &mut self,
        source: &ID3D12Resource,
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
        self.sources.push(source.clone());
        Ok(())
    }

    pub fn end(&mut self) -> Result<(), Error> {
        let batch = self.recorder.end()?;
        let target = self.target.take().expect("recorder open implies target");
        let data = build_draw_data(&batch);
        let list = &target.list;

        let window = self.draw_count % MAX_INFLIGHT_FRAMES;
        self.draw_count += 1;
        let heap_offset = (window * MAX_SPRITES_PER_BATCH) as u32;

        let heap_start_cpu = unsafe { self.srv_heap.GetCPUDescriptorHandleForHeapStart() };
        for (i, source) in self.sources.iter().enumerate() {
            let handle = D3D12_CPU_DESCRIPTOR_HANDLE {
                ptr: heap_start_cpu.ptr
                    + (heap_offset as usize + i) * self.srv_descriptor_size as usize,
            };
            unsafe { self.device.CreateShaderResourceView(source, None, handle) };
        }

        let upload = &self.uploads[window];
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&data.vertices);
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytemuck::bytes_of(&data.constants).as_ptr(),
                upload.mapped,
                std::mem::size_of::<SpriteConstants>(),
            );
            std::ptr::copy_nonoverlapping(
                vertex_bytes.as_ptr(),
                upload.mapped.add(VERTICES_OFFSET),
                vertex_bytes.len(),
            );
        }

        if let Some(color) = batch.clear_color {
            unsafe { list.ClearRenderTargetView(target.rtv, &color.to_array(), None) };
        }

        let buffer_va = unsafe { upload.resource.GetGPUVirtualAddress() };
        let vbv = D3D12_VERTEX_BUFFER_VIEW {
            BufferLocation: buffer_va + VERTICES_OFFSET as u64,
            SizeInBytes: vertex_bytes.len() as u32,
            StrideInBytes: std::mem::size_of::<Vertex>() as u32,
        };
        let heap_start_gpu = unsafe { self.srv_heap.GetGPUDescriptorHandleForHeapStart() };
        let table = D3D12_GPU_DESCRIPTOR_HANDLE {
            ptr: heap_start_gpu.ptr + (heap_offset * self.srv_descriptor_size) as u64,
        };

        unsafe {
            list.IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            list.SetGraphicsRootConstantBufferView(0, buffer_va);
            list.SetDescriptorHeaps(&[Some(self.srv_heap.clone())]);
            list.SetGraphicsRootDescriptorTable(1, table);
            list.IASetVertexBuffers(0, Some(&[vbv]));
            list.DrawInstanced(data.vertices.len() as u32, 1, 0, 0);
        }
        Ok(())
    }
}

impl UploadBuffer {
    fn new(device: &ID3D12Device) -> Result<Self, Error> {
        let heap_props = D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_UPLOAD,
            ..Default::default()
        };
        let desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Width: UPLOAD_LEN as u64,
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            ..Default::default()
        };
        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            device.CreateCommittedResource(
                &heap_props,
                D3D12_HEAP_FLAG_NONE,
                &desc,
                D3D12_RESOURCE_STATE_GENERIC_READ,
                None,
                &mut resource,
            )
        }
        .map_err(|e| win_err("CreateCommittedResource", e))?;
        let resource = resource.expect("committed resource created");

        let mut mapped = std::ptr::null_mut();
        unsafe { resource.Map(0, None, Some(&mut mapped)) }.map_err(|e| win_err("Map", e))?;
        Ok(Self {
            resource,
            mapped: mapped.cast(),
        })
    }
}

fn create_root_signature(device: &ID3D12Device) -> Result<ID3D12RootSignature, Error> {
    let srv_range = D3D12_DESCRIPTOR_RANGE1 {
        RangeType: D3D12_DESCRIPTOR_RANGE_TYPE_SRV,
        NumDescriptors: MAX_SPRITES_PER_BATCH as u32,
        BaseShaderRegister: 0,
        RegisterSpace: 0,
        Flags: D3D12_DESCRIPTOR_RANGE_FLAG_DESCRIPTORS_VOLATILE,
        OffsetInDescriptorsFromTableStart: 0,
    };
    let parameters = [
        D3D12_ROOT_PARAMETER1 {
            ParameterType: D3D12_ROOT_PARAMETER_TYPE_CBV,
            Anonymous: D3D12_ROOT_PARAMETER1_0 {
                Descriptor: D3D12_ROOT_DESCRIPTOR1 {
                    ShaderRegister: 0,
                    RegisterSpace: 0,
                    Flags: D3D12_ROOT_DESCRIPTOR_FLAG_DATA_STATIC,
                },
            },
            ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
        },
        D3D12_ROOT_PARAMETER1 {
            ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
            Anonymous: D3D12_ROOT_PARAMETER1_0 {
                DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE1 {
                    NumDescriptorRanges: 1,
                    pDescriptorRanges: &srv_range,
                },
            },
            ShaderVisibility: D3D12_SHADER_VISIBILITY_PIXEL,
        },
    ];
    // linear min/mag, point mip, clamp on all axes
    let sampler = D3D12_STATIC_SAMPLER_DESC {
        Filter: D3D12_FILTER_MIN_MAG_LINEAR_MIP_POINT,
        AddressU: D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
        AddressV: D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
        AddressW: D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
        ComparisonFunc: D3D12_COMPARISON_FUNC_NEVER,
        MaxLOD: f32::MAX,
        ShaderRegister: 0,
        RegisterSpace: 0,
        ShaderVisibility: D3D12_SHADER_VISIBILITY_PIXEL,
        ..Default::default()
    };
    let desc = D3D12_VERSIONED_ROOT_SIGNATURE_DESC {
        Version: D3D_ROOT_SIGNATURE_VERSION_1_1,
        Anonymous: D3D12_VERSIONED_ROOT_SIGNATURE_DESC_0 {
            Desc_1_1: D3D12_ROOT_SIGNATURE_DESC1 {
                NumParameters: parameters.len() as u32,
                pParameters: parameters.as_ptr(),
                NumStaticSamplers: 1,
                pStaticSamplers: &sampler,
                Flags: D3D12_ROOT_SIGNATURE_FLAG_ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT
                    | D3D12_ROOT_SIGNATURE_FLAG_DENY_DOMAIN_SHADER_ROOT_ACCESS
                    | D3D12_ROOT_SIGNATURE_FLAG_DENY_GEOMETRY_SHADER_ROOT_ACCESS
                    | D3D12_ROOT_SIGNATURE_FLAG_DENY_HULL_SHADER_ROOT_ACCESS,
            },
        },
    };

    let mut signature: Option<ID3DBlob> = None;
    let mut error: Option<ID3DBlob> = None;
    unsafe { D3D12SerializeVersionedRootSignature(&desc, &mut signature, Some(&mut error)) }
        .map_err(|e| {
            let detail = error
                .map(|blob| unsafe {
                    let bytes = std::slice::from_raw_parts(
                        blob.GetBufferPointer().cast::<u8>(),
                        blob.GetBufferSize(),
                    );
                    String::from_utf8_lossy(bytes).into_owned()
                })
                .unwrap_or_default();
            Error::Backend(format!("D3D12SerializeVersionedRootSignature: {e}: {detail}"))
        })?;
    let signature = signature.expect("serialized root signature");
    let bytes = unsafe {
        std::slice::from_raw_parts(
            signature.GetBufferPointer().cast::<u8>(),
            signature.GetBufferSize(),
        )
    };
    unsafe { device.CreateRootSignature(0, bytes) }.map_err(|e| win_err("CreateRootSignature", e))
}

fn create_pipeline(
    device: &ID3D12Device,
    root_signature: &ID3D12RootSignature,
    format: DXGI_FORMAT,
) -> Result<ID3D12PipelineState, Error> {
    let vs = super::d3d11::compile_shader("SpriteVertexShader", "vs_5_0")?;
    let ps = super::d3d11::compile_shader("SpritePixelShader", "ps_5_0")?;

    let input_elements = [
        D3D12_INPUT_ELEMENT_DESC {
            SemanticName: windows::core::s!("SV_Position"),
            SemanticIndex: 0,
            Format: DXGI_FORMAT_R32G32_FLOAT,
            InputSlot: 0,
            AlignedByteOffset: std::mem::offset_of!(Vertex, position) as u32,
            InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
            InstanceDataStepRate: 0,
        },
        D3D12_INPUT_ELEMENT_DESC {
            SemanticName: windows::core::s!("COLOR"),
            SemanticIndex: 0,
            Format: DXGI_FORMAT_R32G32B32A32_FLOAT,
            InputSlot: 0,
            AlignedByteOffset: std::mem::offset_of!(Vertex, color) as u32,
            InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
            InstanceDataStepRate: 0,
        },
        D3D12_INPUT_ELEMENT_DESC {
            SemanticName: windows::core::s!("TEXCOORD"),
            SemanticIndex: 0,
            Format: DXGI_FORMAT_R32G32_FLOAT,
            InputSlot: 0,
            AlignedByteOffset: std::mem::offset_of!(Vertex, tex_coord) as u32,
            InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
            InstanceDataStepRate: 0,
        },
        D3D12_INPUT_ELEMENT_DESC {
            SemanticName: windows::core::s!("TEXTURE_INDEX"),
            SemanticIndex: 0,
            Format: DXGI_FORMAT_R32_UINT,
            InputSlot: 0,
            AlignedByteOffset: std::mem::offset_of!(Vertex, texture_index) as u32,
            InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
            InstanceDataStepRate: 0,
        },
    ];

    let blend_target = D3D12_RENDER_TARGET_BLEND_DESC {
        BlendEnable: true.into(),
        LogicOpEnable: false.into(),
        SrcBlend: D3D12_BLEND_ONE,
        DestBlend: D3D12_BLEND_INV_SRC_ALPHA,
        BlendOp: D3D12_BLEND_OP_ADD,
        SrcBlendAlpha: D3D12_BLEND_ONE,
        DestBlendAlpha: D3D12_BLEND_INV_SRC_ALPHA,
        BlendOpAlpha: D3D12_BLEND_OP_ADD,
        LogicOp: D3D12_LOGIC_OP_NOOP,
        RenderTargetWriteMask: D3D12_COLOR_WRITE_ENABLE_ALL.0 as u8,
    };

    let mut desc = D3D12_GRAPHICS_PIPELINE_STATE_DESC {
        pRootSignature: unsafe { std::mem::transmute_copy(root_signature) },
        VS: D3D12_SHADER_BYTECODE {
            pShaderBytecode: vs.as_ptr().cast(),
            BytecodeLength: vs.len(),
        },
        PS: D3D12_SHADER_BYTECODE {
            pShaderBytecode: ps.as_ptr().cast(),
            BytecodeLength: ps.len(),
        },
        BlendState: D3D12_BLEND_DESC {
            RenderTarget: [blend_target; 8],
            ..Default::default()
        },
        SampleMask: u32::MAX,
        RasterizerState: D3D12_RASTERIZER_DESC {
            FillMode: D3D12_FILL_MODE_SOLID,
            CullMode: D3D12_CULL_MODE_BACK,
            ..Default::default()
        },
        InputLayout: D3D12_INPUT_LAYOUT_DESC {
            pInputElementDescs: input_elements.as_ptr(),
            NumElements: input_elements.len() as u32,
        },
        PrimitiveTopologyType: D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE,
        NumRenderTargets: 1,
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: 1,
            Quality: 0,
        },
        ..Default::default()
    };
    desc.RTVFormats[0] = format;

    unsafe { device.CreateGraphicsPipelineState(&desc) }
        .map_err(|e| win_err("CreateGraphicsPipelineState", e))
}
