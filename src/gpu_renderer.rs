use crate::colormap::{COLORMAP_SIZE, Colormap};
use crate::raymarch::{RayMarchSettings, RenderUniforms};
use crate::volume::VolumeData;

use glam::{Mat4, Vec3};
use half::f16;
use log::{debug, info};
use std::borrow::Cow;
use thiserror::Error;
use wgpu::{PollType, util::DeviceExt};

/// Colour format of offscreen frames produced by [`VolumeRenderer::render_to_rgba`].
pub const OFFSCREEN_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no compatible graphics adapter")]
    AdapterUnavailable,

    #[error("failed to create graphics device: {0}")]
    DeviceCreation(#[from] wgpu::RequestDeviceError),

    #[error("volume shader failed to compile: {0}")]
    ShaderCompilation(String),

    #[error("frame readback failed: {0}")]
    Readback(String),

    #[error("frame size {0}x{1} is empty")]
    EmptyFrame(u32, u32),

    #[error("cannot create a {0:?} volume texture, the device allows {1} texels per axis")]
    TextureCreation((usize, usize, usize), u32),
}

/// Triangles of the unit cube, wound counter-clockwise seen from outside.
const CUBE_VERTICES: [[f32; 3]; 36] = [
    // -x
    [0.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 1.0],
    [0.0, 0.0, 0.0], [0.0, 1.0, 1.0], [0.0, 1.0, 0.0],
    // +x
    [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [1.0, 1.0, 1.0],
    [1.0, 0.0, 0.0], [1.0, 1.0, 1.0], [1.0, 0.0, 1.0],
    // -y
    [0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 0.0, 1.0],
    [0.0, 0.0, 0.0], [1.0, 0.0, 1.0], [0.0, 0.0, 1.0],
    // +y
    [0.0, 1.0, 0.0], [0.0, 1.0, 1.0], [1.0, 1.0, 1.0],
    [0.0, 1.0, 0.0], [1.0, 1.0, 1.0], [1.0, 1.0, 0.0],
    // -z
    [0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 1.0, 0.0],
    [0.0, 0.0, 0.0], [1.0, 1.0, 0.0], [1.0, 0.0, 0.0],
    // +z
    [0.0, 0.0, 1.0], [1.0, 0.0, 1.0], [1.0, 1.0, 1.0],
    [0.0, 0.0, 1.0], [1.0, 1.0, 1.0], [0.0, 1.0, 1.0],
];

/// Layout must match WGSL `VolumeUniforms` exactly.
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct GpuUniforms {
    model_view: [[f32; 4]; 4],
    model_view_inverse: [[f32; 4]; 4],
    projection: [[f32; 4]; 4],
    size: [f32; 3],
    renderthreshold: f32,
    clim: [f32; 2],
    opacity: f32,
    _padding: f32,
}

impl GpuUniforms {
    fn new(uniforms: &RenderUniforms, camera: &Camera) -> Self {
        Self {
            model_view: camera.model_view.to_cols_array_2d(),
            model_view_inverse: camera.model_view.inverse().to_cols_array_2d(),
            projection: camera.projection.to_cols_array_2d(),
            size: uniforms.size,
            renderthreshold: uniforms.renderthreshold,
            clim: uniforms.clim,
            opacity: uniforms.opacity,
            _padding: 0.0,
        }
    }
}

/// Device and queue the renderer draws with.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Requests a device without a surface, enabling filtered 32-bit float
    /// textures when the adapter offers them.
    ///
    /// # Errors
    ///
    /// Fails when no adapter is available or the device cannot be created.
    pub async fn headless() -> Result<Self, RenderError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await
            .map_err(|_| RenderError::AdapterUnavailable)?;
        info!("using adapter {:?}", adapter.get_info().name);

        let required_features = adapter.features() & wgpu::Features::FLOAT32_FILTERABLE;
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Volume Device"),
                required_features,
                ..Default::default()
            })
            .await?;

        Ok(Self { device, queue })
    }
}

/// View and projection for one frame, in the volume's voxel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub model_view: Mat4,
    pub projection: Mat4,
}

impl Camera {
    /// Orbit the volume's centre at the given yaw and pitch (radians).
    ///
    /// Voxels are scaled by the volume spacing so the box keeps its physical
    /// proportions.
    pub fn orbit(volume: &VolumeData, yaw: f32, pitch: f32, aspect: f32) -> Self {
        let (nx, ny, nz) = volume.dims();
        let size = Vec3::new(nx as f32, ny as f32, nz as f32);
        let extent = Vec3::from(volume.extent());

        let model = Mat4::from_scale(extent / size)
            * Mat4::from_translation(-(size - Vec3::ONE) / 2.0);

        let radius = extent.length() * 1.5;
        let eye = Vec3::new(
            radius * pitch.cos() * yaw.sin(),
            radius * pitch.sin(),
            radius * pitch.cos() * yaw.cos(),
        );
        let view = Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y);
        let projection =
            Mat4::perspective_rh(45_f32.to_radians(), aspect, radius * 0.01, radius * 4.0);

        Self {
            model_view: view * model,
            projection,
        }
    }
}

/// The normalized volume and its colormap, resident on the GPU.
pub struct VolumeTexture {
    volume_texture: wgpu::Texture,
    volume_view: wgpu::TextureView,
    colormap_texture: wgpu::Texture,
    colormap_view: wgpu::TextureView,
    sampler: wgpu::Sampler,
    dimensions: (u32, u32, u32), // (width, height, depth)
}

impl VolumeTexture {
    /// # Errors
    ///
    /// Returns [`RenderError::TextureCreation`] when an axis is longer than
    /// the device's 3D texture limit.
    pub fn new(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        volume: &VolumeData,
        colormap: &Colormap,
    ) -> Result<Self, RenderError> {
        let (width, height, depth) = Self::texture_extent(volume.dims(), &device.limits())?;

        let float32_filterable = device
            .features()
            .contains(wgpu::Features::FLOAT32_FILTERABLE);
        let format = if float32_filterable {
            wgpu::TextureFormat::R32Float
        } else {
            wgpu::TextureFormat::R16Float
        };

        let texture_size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: depth,
        };

        let volume_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Volume 3D Texture"),
            size: texture_size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D3,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let values: Cow<'_, [f32]> = match volume.data().as_slice() {
            Some(values) => Cow::Borrowed(values),
            None => Cow::Owned(volume.data().iter().copied().collect()),
        };
        let half_values: Vec<f16>;
        let (bytes, bytes_per_texel): (&[u8], u32) = if float32_filterable {
            (bytemuck::cast_slice(&values[..]), 4)
        } else {
            half_values = values.iter().map(|&v| f16::from_f32(v)).collect();
            (bytemuck::cast_slice(&half_values), 2)
        };

        queue.write_texture(
            wgpu::TexelCopyTextureInfoBase {
                texture: &volume_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_texel * width),
                rows_per_image: Some(height),
            },
            texture_size,
        );

        let volume_view = volume_texture.create_view(&wgpu::TextureViewDescriptor::default());

        let colormap_size = wgpu::Extent3d {
            width: COLORMAP_SIZE as u32,
            height: 1,
            depth_or_array_layers: 1,
        };
        let colormap_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Colormap Texture"),
            size: colormap_size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        queue.write_texture(
            wgpu::TexelCopyTextureInfoBase {
                texture: &colormap_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            colormap.as_bytes(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * COLORMAP_SIZE as u32),
                rows_per_image: Some(1),
            },
            colormap_size,
        );
        let colormap_view = colormap_texture.create_view(&wgpu::TextureViewDescriptor::default());

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Volume Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        debug!("uploaded {width}x{height}x{depth} volume as {format:?}");

        Ok(Self {
            volume_texture,
            volume_view,
            colormap_texture,
            colormap_view,
            sampler,
            dimensions: (width, height, depth),
        })
    }

    fn texture_extent(
        dims: (usize, usize, usize),
        limits: &wgpu::Limits,
    ) -> Result<(u32, u32, u32), RenderError> {
        let limit = limits.max_texture_dimension_3d;
        let axis = |n: usize| {
            u32::try_from(n)
                .ok()
                .filter(|&n| n <= limit)
                .ok_or(RenderError::TextureCreation(dims, limit))
        };
        Ok((axis(dims.0)?, axis(dims.1)?, axis(dims.2)?))
    }

    /// (width, height, depth) in texels.
    pub fn dimensions(&self) -> (u32, u32, u32) {
        self.dimensions
    }

    /// Releases the GPU memory now rather than when the handles drop.
    pub fn destroy(self) {
        self.volume_texture.destroy();
        self.colormap_texture.destroy();
    }
}

/// Compiled ray-march pipeline for one colour target format.
pub struct VolumePipeline {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    cube_buffer: wgpu::Buffer,
}

impl VolumePipeline {
    /// # Errors
    ///
    /// Returns [`RenderError::ShaderCompilation`] when the shader or the
    /// pipeline fails validation.
    pub async fn new(
        device: &wgpu::Device,
        target_format: wgpu::TextureFormat,
        settings: &RayMarchSettings,
    ) -> Result<Self, RenderError> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let source = format!(
            "{}\n{}",
            settings.wgsl_prelude(),
            include_str!("shaders/volume_mip.wgsl")
        );
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Volume MIP Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(source)),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Volume MIP Bind Group Layout"),
            entries: &[
                // Uniforms
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // 3D volume
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D3,
                        multisampled: false,
                    },
                    count: None,
                },
                // Colormap
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                // Sampler
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Volume MIP Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        const CUBE_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Float32x3];

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Volume MIP Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: std::mem::size_of::<[f32; 3]>() as wgpu::BufferAddress,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &CUBE_ATTRIBUTES,
                }],
            },
            // Only back faces are rasterized; the fragment stage marches
            // from the entry point back to them.
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: Some(wgpu::Face::Front),
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: target_format,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            multiview: None,
            cache: None,
        });

        if let Some(error) = device.pop_error_scope().await {
            return Err(RenderError::ShaderCompilation(error.to_string()));
        }

        let cube_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Volume Cube Vertices"),
            contents: bytemuck::cast_slice(&CUBE_VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });

        Ok(Self {
            pipeline,
            bind_group_layout,
            cube_buffer,
        })
    }
}

/// Everything one volume draw needs, passed explicitly.
pub struct VolumeRenderPass<'a> {
    pub texture: &'a VolumeTexture,
    pub uniforms: RenderUniforms,
    pub camera: Camera,
}

impl VolumeRenderPass<'_> {
    /// Records the draw into `encoder`, clearing `target` first when
    /// `clear` is set.
    pub fn draw(
        &self,
        device: &wgpu::Device,
        pipeline: &VolumePipeline,
        encoder: &mut wgpu::CommandEncoder,
        target: &wgpu::TextureView,
        clear: Option<wgpu::Color>,
    ) {
        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Volume Uniform Buffer"),
            contents: bytemuck::bytes_of(&GpuUniforms::new(&self.uniforms, &self.camera)),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Volume MIP Bind Group"),
            layout: &pipeline.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&self.texture.volume_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&self.texture.colormap_view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(&self.texture.sampler),
                },
            ],
        });

        let load = clear.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear);
        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Volume MIP Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        render_pass.set_pipeline(&pipeline.pipeline);
        render_pass.set_bind_group(0, &bind_group, &[]);
        render_pass.set_vertex_buffer(0, pipeline.cube_buffer.slice(..));
        render_pass.draw(0..CUBE_VERTICES.len() as u32, 0..1);
    }
}

/// Owns the pipeline and the texture of the volume currently on display.
pub struct VolumeRenderer {
    context: GpuContext,
    pipeline: VolumePipeline,
    colormap: Colormap,
    texture: Option<VolumeTexture>,
}

impl VolumeRenderer {
    /// # Errors
    ///
    /// Fails if the shader does not compile for this device.
    pub async fn new(
        context: GpuContext,
        target_format: wgpu::TextureFormat,
        settings: &RayMarchSettings,
    ) -> Result<Self, RenderError> {
        let pipeline = VolumePipeline::new(&context.device, target_format, settings).await?;
        Ok(Self {
            context,
            pipeline,
            colormap: Colormap::greyscale(),
            texture: None,
        })
    }

    /// Renderer for [`OFFSCREEN_FORMAT`] frames on a headless device.
    ///
    /// # Errors
    ///
    /// Fails when no device is available or the shader does not compile.
    pub async fn headless(settings: &RayMarchSettings) -> Result<Self, RenderError> {
        let context = GpuContext::headless().await?;
        Self::new(context, OFFSCREEN_FORMAT, settings).await
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    /// Replaces the displayed volume. The previous texture is destroyed
    /// before the new one is allocated, so on error nothing is displayed.
    ///
    /// # Errors
    ///
    /// Fails when the volume does not fit in a texture on this device.
    pub fn set_volume(&mut self, volume: &VolumeData) -> Result<(), RenderError> {
        self.clear_volume();
        self.texture = Some(VolumeTexture::new(
            &self.context.device,
            &self.context.queue,
            volume,
            &self.colormap,
        )?);
        Ok(())
    }

    pub fn clear_volume(&mut self) {
        if let Some(texture) = self.texture.take() {
            texture.destroy();
        }
    }

    pub fn texture(&self) -> Option<&VolumeTexture> {
        self.texture.as_ref()
    }

    /// Draw description for the current volume, if any.
    pub fn render_pass(
        &self,
        uniforms: RenderUniforms,
        camera: Camera,
    ) -> Option<VolumeRenderPass<'_>> {
        self.texture.as_ref().map(|texture| VolumeRenderPass {
            texture,
            uniforms,
            camera,
        })
    }

    /// Renders one frame offscreen and returns tightly packed RGBA8 pixels.
    /// Without a volume the frame is just the background.
    ///
    /// # Errors
    ///
    /// Fails on an empty frame size or when the readback cannot be mapped.
    pub async fn render_to_rgba(
        &self,
        uniforms: RenderUniforms,
        camera: Camera,
        width: u32,
        height: u32,
        background: wgpu::Color,
    ) -> Result<Vec<u8>, RenderError> {
        if width == 0 || height == 0 {
            return Err(RenderError::EmptyFrame(width, height));
        }
        let GpuContext { device, queue } = &self.context;

        let frame_size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let frame = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Offscreen Frame"),
            size: frame_size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: OFFSCREEN_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let frame_view = frame.create_view(&wgpu::TextureViewDescriptor::default());

        let unpadded_bytes_per_row = 4 * width;
        let padded_bytes_per_row = unpadded_bytes_per_row
            .div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let staging_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Frame Staging Buffer"),
            size: u64::from(padded_bytes_per_row) * u64::from(height),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Volume Frame Encoder"),
        });
        match self.render_pass(uniforms, camera) {
            Some(pass) => pass.draw(
                device,
                &self.pipeline,
                &mut encoder,
                &frame_view,
                Some(background),
            ),
            None => {
                encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("Background Pass"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &frame_view,
                        depth_slice: None,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(background),
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
            }
        }
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfoBase {
                texture: &frame,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging_buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            frame_size,
        );
        queue.submit(Some(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        device
            .poll(PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| RenderError::Readback(e.to_string()))?;
        receiver
            .await
            .map_err(|_| RenderError::Readback("map callback dropped".to_owned()))?
            .map_err(|e| RenderError::Readback(e.to_string()))?;

        let data = buffer_slice.get_mapped_range();
        let mut pixels = Vec::with_capacity((unpadded_bytes_per_row * height) as usize);
        for row in data.chunks_exact(padded_bytes_per_row as usize) {
            pixels.extend_from_slice(&row[..unpadded_bytes_per_row as usize]);
        }

        drop(data);
        staging_buffer.unmap();
        frame.destroy();
        Ok(pixels)
    }
}
