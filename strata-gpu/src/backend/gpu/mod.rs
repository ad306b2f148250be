//! wgpu implementation of [`Backend`].
//!
//! Scene passes are recorded between `begin_scene` and `end_scene` and
//! encoded as one render pass, switching pipelines per state set when extra
//! shaders are registered. Screen passes and clears are encoded and submitted
//! immediately. Occlusion queries live in one query set and are resolved
//! into mappable buffers after each scene pass.

mod program;
mod readback;

use std::collections::HashMap;

use tracing::{debug, warn};
use wgpu::util::DeviceExt;

use crate::backend::{
    Backend, Blend, PassUniforms, QueryBackend, QueryLedger, ScenePass, ScreenPass, ShaderSet,
    TextureDesc, TextureFormat, Viewport,
};
use crate::constants::MAX_COLOR_TARGETS;
use crate::draw_list::StateSetId;
use crate::error::StrataError;
use crate::handle::Handle;
use crate::types::SceneVertex;

use program::PassProgram;
use readback::QueryReadback;

/// Bytes one fragment may write across all targets: eight RGBA32F outputs.
const REQUIRED_COLOR_BYTES_PER_SAMPLE: u32 = (MAX_COLOR_TARGETS * 16) as u32;

/// Formats the engine blends into with 32-bit float channels.
const FLOAT32_TARGETS: [wgpu::TextureFormat; 3] = [
    wgpu::TextureFormat::R32Float,
    wgpu::TextureFormat::Rg32Float,
    wgpu::TextureFormat::Rgba32Float,
];

/// Blendability of 32-bit float formats is adapter specific in wgpu and only
/// usable on devices created with this feature.
const REQUIRED_FEATURES: wgpu::Features = wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES;

/// First float target format that `features_of` does not report as
/// blendable.
fn missing_float32_blending(
    features_of: impl Fn(wgpu::TextureFormat) -> wgpu::TextureFormatFeatures,
) -> Option<wgpu::TextureFormat> {
    FLOAT32_TARGETS.into_iter().find(|format| {
        !features_of(*format)
            .flags
            .contains(wgpu::TextureFormatFeatureFlags::BLENDABLE)
    })
}

const VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 3] =
    wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3, 2 => Float32x4];

/// A render target owned by a [`WgpuBackend`].
pub struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: TextureFormat,
}

impl GpuTexture {
    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }
}

pub type WgpuTexture = Handle<GpuTexture>;

/// Vertex buffer of a recorded draw.
pub struct WgpuGeometry {
    buffer: Option<wgpu::Buffer>,
    vertex_count: u32,
}

impl WgpuGeometry {
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct PassUniformData {
    projection: [[f32; 4]; 4],
    depth: [f32; 4],
    viewport: [f32; 4],
    settings: [f32; 4],
    quantiles: [[f32; 4]; 2],
}

impl PassUniformData {
    fn new(uniforms: &PassUniforms, program: &PassProgram) -> Self {
        let depth = uniforms.depth;
        let viewport = uniforms.viewport;
        Self {
            projection: uniforms.projection.to_cols_array_2d(),
            depth: [
                depth.proj33,
                depth.proj34,
                f32::from(u8::from(depth.orthographic)),
                f32::from(u8::from(depth.unproject)),
            ],
            viewport: [
                viewport.x as f32,
                viewport.y as f32,
                viewport.width as f32,
                viewport.height as f32,
            ],
            settings: program.settings,
            quantiles: [
                [
                    program.quantiles[0],
                    program.quantiles[1],
                    program.quantiles[2],
                    program.quantiles[3],
                ],
                [
                    program.quantiles[4],
                    program.quantiles[5],
                    program.quantiles[6],
                    program.quantiles[7],
                ],
            ],
        }
    }
}

enum SceneCommand {
    Draw {
        buffer: wgpu::Buffer,
        vertex_count: u32,
        state: StateSetId,
    },
    BeginQuery { query: u32, generation: u64 },
    EndQuery,
}

/// A scene pass being recorded.
struct RecordedScene {
    program: PassProgram,
    bind_group: wgpu::BindGroup,
    viewport: Viewport,
    commands: Vec<SceneCommand>,
    active_query: Option<u32>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    source: String,
    targets: Vec<(wgpu::TextureFormat, Blend)>,
}

pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    textures: HashMap<u64, GpuTexture>,
    layouts: HashMap<usize, wgpu::BindGroupLayout>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    extra_shaders: HashMap<StateSetId, ShaderSet>,
    query_set: wgpu::QuerySet,
    queries: QueryLedger,
    readbacks: Vec<QueryReadback>,
    scene: Option<RecordedScene>,
}

impl WgpuBackend {
    /// Opens the default adapter.
    pub fn new() -> Result<Self, StrataError> {
        pollster::block_on(Self::new_async())
    }

    pub async fn new_async() -> Result<Self, StrataError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::from_env_or_default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                ..Default::default()
            })
            .await?;
        debug!("Using adapter {:?}", adapter.get_info());

        if !adapter.features().contains(REQUIRED_FEATURES) {
            return Err(StrataError::UnsupportedFeature(
                "adapter specific texture format features".to_string(),
            ));
        }
        if let Some(format) =
            missing_float32_blending(|format| adapter.get_texture_format_features(format))
        {
            return Err(StrataError::UnsupportedFeature(format!(
                "blending on {format:?} targets"
            )));
        }
        let limits = adapter.limits();
        if (limits.max_color_attachments as usize) < MAX_COLOR_TARGETS
            || limits.max_color_attachment_bytes_per_sample < REQUIRED_COLOR_BYTES_PER_SAMPLE
        {
            return Err(StrataError::UnsupportedFeature(format!(
                "{} RGBA32F color targets per pass",
                MAX_COLOR_TARGETS
            )));
        }

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Strata Device"),
                required_features: REQUIRED_FEATURES,
                required_limits: limits,
                ..Default::default()
            })
            .await?;
        Self::from_device(device, queue)
    }

    /// Wraps a device created by the host. It must have
    /// `TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES` enabled on an adapter that
    /// blends 32-bit float targets.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Result<Self, StrataError> {
        if !device.features().contains(REQUIRED_FEATURES) {
            return Err(StrataError::UnsupportedFeature(
                "adapter specific texture format features".to_string(),
            ));
        }
        let query_set = device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("Occlusion Queries"),
            ty: wgpu::QueryType::Occlusion,
            count: wgpu::QUERY_SET_MAX_QUERIES,
        });
        Ok(Self {
            device,
            queue,
            textures: HashMap::new(),
            layouts: HashMap::new(),
            pipelines: HashMap::new(),
            extra_shaders: HashMap::new(),
            query_set,
            queries: QueryLedger::new(wgpu::QUERY_SET_MAX_QUERIES),
            readbacks: Vec::new(),
            scene: None,
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// The wgpu texture behind a handle, e.g. to present an output target.
    pub fn gpu_texture(&self, texture: &WgpuTexture) -> Option<&GpuTexture> {
        self.textures.get(&texture.id)
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    fn entry(&self, texture: &WgpuTexture) -> Result<&GpuTexture, StrataError> {
        self.textures
            .get(&texture.id)
            .ok_or(StrataError::UnknownTexture(texture.id))
    }

    fn layout(&mut self, inputs: usize) -> wgpu::BindGroupLayout {
        let device = &self.device;
        self.layouts
            .entry(inputs)
            .or_insert_with(|| {
                let mut entries = vec![wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }];
                entries.extend((0..inputs).map(|i| wgpu::BindGroupLayoutEntry {
                    binding: i as u32 + 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                }));
                device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("Pass Layout"),
                    entries: &entries,
                })
            })
            .clone()
    }

    fn bind_group(
        &mut self,
        program: &PassProgram,
        uniforms: &PassUniforms,
    ) -> Result<wgpu::BindGroup, StrataError> {
        let layout = self.layout(program.input_count());
        let data = PassUniformData::new(uniforms, program);
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Pass Uniforms"),
                contents: bytemuck::bytes_of(&data),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let views = program
            .input_textures()
            .map(|t| self.entry(t).map(|entry| entry.view.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: buffer.as_entire_binding(),
        }];
        entries.extend(views.iter().enumerate().map(|(i, view)| wgpu::BindGroupEntry {
            binding: i as u32 + 1,
            resource: wgpu::BindingResource::TextureView(view),
        }));
        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(program.name),
            layout: &layout,
            entries: &entries,
        }))
    }

    /// Pipeline of `program`, built on first use.
    fn pipeline(
        &mut self,
        program: &PassProgram,
        extra: Option<&ShaderSet>,
    ) -> Result<wgpu::RenderPipeline, StrataError> {
        let targets = program
            .targets
            .iter()
            .map(|(t, blend)| self.entry(t).map(|entry| (entry.format.to_wgpu(), *blend)))
            .collect::<Result<Vec<_>, _>>()?;
        let key = PipelineKey {
            source: program.source(extra),
            targets,
        };
        if let Some(pipeline) = self.pipelines.get(&key) {
            return Ok(pipeline.clone());
        }

        debug!("Building {} pipeline", program.name);
        let layout = self.layout(program.input_count());
        let device = &self.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(program.name),
            source: wgpu::ShaderSource::Wgsl(key.source.as_str().into()),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(program.name),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let vertex_buffers = [wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<SceneVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &VERTEX_ATTRIBUTES,
        }];
        let buffers: &[wgpu::VertexBufferLayout<'_>] = if program.is_scene() {
            &vertex_buffers
        } else {
            &[]
        };
        let color_targets: Vec<Option<wgpu::ColorTargetState>> = key
            .targets
            .iter()
            .map(|(format, blend)| {
                Some(wgpu::ColorTargetState {
                    format: *format,
                    blend: blend.to_wgpu(),
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(program.name),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: Some("vs_main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers,
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: None,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &module,
                entry_point: Some("fs_main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &color_targets,
            }),
            multiview: None,
            cache: None,
        });
        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(StrataError::ShaderError(format!("{}: {}", program.name, error)));
        }
        self.pipelines.insert(key, pipeline.clone());
        Ok(pipeline)
    }

    fn color_attachments(
        &self,
        program: &PassProgram,
    ) -> Result<(Vec<wgpu::TextureView>, (u32, u32)), StrataError> {
        let mut size = None;
        let views = program
            .targets
            .iter()
            .map(|(t, _)| {
                let entry = self.entry(t)?;
                size.get_or_insert((entry.texture.width(), entry.texture.height()));
                Ok(entry.view.clone())
            })
            .collect::<Result<Vec<_>, StrataError>>()?;
        Ok((views, size.unwrap_or((0, 0))))
    }

    /// Encodes one full-viewport draw of `program`.
    fn run_screen_program(
        &mut self,
        program: &PassProgram,
        uniforms: &PassUniforms,
    ) -> Result<(), StrataError> {
        let (views, (width, height)) = self.color_attachments(program)?;
        let area = uniforms.viewport.clipped(width, height);
        if area.is_empty() {
            return Ok(());
        }
        let pipeline = self.pipeline(program, None)?;
        let bind_group = self.bind_group(program, uniforms)?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(program.name),
            });
        {
            let attachments = load_attachments(&views);
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(program.name),
                color_attachments: &attachments,
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            set_area(&mut pass, area);
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn encode_scene(&mut self, scene: RecordedScene) -> Result<(), StrataError> {
        let RecordedScene {
            program,
            bind_group,
            viewport,
            commands,
            ..
        } = scene;
        let (views, (width, height)) = self.color_attachments(&program)?;
        let area = viewport.clipped(width, height);
        let queries: Vec<(u32, u64)> = commands
            .iter()
            .filter_map(|command| match command {
                SceneCommand::BeginQuery { query, generation } => Some((*query, *generation)),
                _ => None,
            })
            .collect();
        if area.is_empty() {
            for (query, generation) in queries {
                self.queries.accept(query, generation, 0);
            }
            return Ok(());
        }

        let mut pipelines: HashMap<StateSetId, wgpu::RenderPipeline> = HashMap::new();
        for command in &commands {
            if let SceneCommand::Draw { state, .. } = command {
                if !pipelines.contains_key(state) {
                    let extra = self.extra_shaders.get(state).cloned();
                    let pipeline = self.pipeline(&program, extra.as_ref())?;
                    pipelines.insert(*state, pipeline);
                }
            }
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(program.name),
            });
        {
            let attachments = load_attachments(&views);
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(program.name),
                color_attachments: &attachments,
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: (!queries.is_empty()).then_some(&self.query_set),
            });
            set_area(&mut pass, area);
            pass.set_bind_group(0, &bind_group, &[]);
            let mut bound = None;
            for command in &commands {
                match command {
                    SceneCommand::Draw {
                        buffer,
                        vertex_count,
                        state,
                    } => {
                        if bound != Some(*state) {
                            if let Some(pipeline) = pipelines.get(state) {
                                pass.set_pipeline(pipeline);
                            }
                            bound = Some(*state);
                        }
                        pass.set_vertex_buffer(0, buffer.slice(..));
                        pass.draw(0..*vertex_count, 0..1);
                    }
                    SceneCommand::BeginQuery { query, .. } => pass.begin_occlusion_query(*query),
                    SceneCommand::EndQuery => pass.end_occlusion_query(),
                }
            }
        }

        let recording = (!queries.is_empty()).then(|| {
            QueryReadback::record(&self.device, &mut encoder, &self.query_set, queries)
        });
        self.queue.submit(Some(encoder.finish()));
        if let Some(recording) = recording {
            self.readbacks.push(recording.submitted());
        }
        Ok(())
    }

    fn store_results(&mut self, results: Vec<(u32, u64, u64)>) {
        for (query, generation, samples) in results {
            self.queries.accept(query, generation, samples);
        }
    }

    /// Moves finished readbacks into the ledger without blocking.
    fn poll_readbacks(&mut self) -> Result<(), StrataError> {
        self.device.poll(wgpu::PollType::Poll)?;
        let mut index = 0;
        while index < self.readbacks.len() {
            match self.readbacks[index].try_take()? {
                Some(results) => {
                    self.readbacks.swap_remove(index);
                    self.store_results(results);
                }
                None => index += 1,
            }
        }
        Ok(())
    }

    fn upload(&self, vertices: &[SceneVertex]) -> Option<wgpu::Buffer> {
        (!vertices.is_empty()).then(|| {
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("Scene Vertices"),
                    contents: bytemuck::cast_slice(vertices),
                    usage: wgpu::BufferUsages::VERTEX,
                })
        })
    }

    fn record_draw(&mut self, buffer: wgpu::Buffer, vertex_count: u32, state: StateSetId) {
        match self.scene.as_mut() {
            Some(scene) => scene.commands.push(SceneCommand::Draw {
                buffer,
                vertex_count,
                state,
            }),
            None => debug!("Draw outside of a scene pass ignored"),
        }
    }
}

fn load_attachments(views: &[wgpu::TextureView]) -> Vec<Option<wgpu::RenderPassColorAttachment<'_>>> {
    views
        .iter()
        .map(|view| {
            Some(wgpu::RenderPassColorAttachment {
                view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })
        })
        .collect()
}

fn set_area(pass: &mut wgpu::RenderPass<'_>, area: Viewport) {
    pass.set_viewport(
        area.x as f32,
        area.y as f32,
        area.width as f32,
        area.height as f32,
        0.0,
        1.0,
    );
    pass.set_scissor_rect(area.x, area.y, area.width, area.height);
}

impl QueryBackend for WgpuBackend {
    type Query = u32;

    fn create_query(&mut self) -> Result<u32, StrataError> {
        self.queries.allocate()
    }

    fn release_query(&mut self, query: u32) {
        self.queries.release(query);
    }

    fn begin_query(&mut self, query: u32, any_samples: bool) {
        let Some(scene) = self.scene.as_mut() else {
            debug!("Query {} begun outside of a scene pass ignored", query);
            return;
        };
        if scene.active_query.take().is_some() {
            scene.commands.push(SceneCommand::EndQuery);
        }
        let generation = self.queries.issue(query, any_samples);
        scene
            .commands
            .push(SceneCommand::BeginQuery { query, generation });
        scene.active_query = Some(query);
    }

    fn end_query(&mut self) {
        if let Some(scene) = self.scene.as_mut() {
            if scene.active_query.take().is_some() {
                scene.commands.push(SceneCommand::EndQuery);
            }
        }
    }

    fn query_available(&mut self, query: u32) -> bool {
        if let Err(error) = self.poll_readbacks() {
            warn!("Reading occlusion queries failed: {}", error);
        }
        self.queries.result(query).is_some()
    }

    fn query_result(&mut self, query: u32) -> Result<u64, StrataError> {
        self.poll_readbacks()?;
        if let Some(samples) = self.queries.result(query) {
            return Ok(samples);
        }
        let generation = self.queries.generation(query);
        let pending = generation.and_then(|generation| {
            self.readbacks
                .iter()
                .position(|r| r.contains(query, generation))
        });
        if let Some(index) = pending {
            let readback = self.readbacks.swap_remove(index);
            let results = readback.wait(&self.device)?;
            self.store_results(results);
        }
        Ok(self.queries.result(query).unwrap_or(0))
    }
}

impl Backend for WgpuBackend {
    type Texture = WgpuTexture;
    type Geometry = WgpuGeometry;

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<WgpuTexture, StrataError> {
        debug!(
            "Creating {} {}x{} {:?}",
            desc.label, desc.width, desc.height, desc.format
        );
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&desc.label),
            size: wgpu::Extent3d {
                width: desc.width.max(1),
                height: desc.height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: desc.format.to_wgpu(),
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let handle = WgpuTexture::next();
        self.textures.insert(
            handle.id,
            GpuTexture {
                texture,
                view,
                format: desc.format,
            },
        );
        Ok(handle)
    }

    fn release_texture(&mut self, texture: WgpuTexture) {
        if let Some(entry) = self.textures.remove(&texture.id) {
            entry.texture.destroy();
        }
    }

    fn texture_size(&self, texture: &WgpuTexture) -> (u32, u32) {
        self.textures
            .get(&texture.id)
            .map(|entry| (entry.texture.width(), entry.texture.height()))
            .unwrap_or((0, 0))
    }

    fn texture_format(&self, texture: &WgpuTexture) -> TextureFormat {
        self.textures
            .get(&texture.id)
            .map(|entry| entry.format)
            .unwrap_or(TextureFormat::Rgba32Float)
    }

    fn read_texture(&mut self, texture: &WgpuTexture) -> Result<Vec<[f32; 4]>, StrataError> {
        let entry = self.entry(texture)?;
        readback::read_texture(&self.device, &self.queue, &entry.texture, entry.format)
    }

    fn create_geometry(&mut self, vertices: &[SceneVertex]) -> WgpuGeometry {
        WgpuGeometry {
            buffer: self.upload(vertices),
            vertex_count: vertices.len() as u32,
        }
    }

    fn set_extra_shaders(&mut self, state: StateSetId, shaders: &ShaderSet) {
        if self.extra_shaders.get(&state) != Some(shaders) {
            debug!("State {:?} extra shaders updated", state);
            self.extra_shaders.insert(state, shaders.clone());
        }
    }

    fn clear(&mut self, targets: &[WgpuTexture], value: [f32; 4], viewport: Viewport) {
        for target in targets {
            let (width, height) = self.texture_size(target);
            let area = viewport.clipped(width, height);
            if area.is_empty() {
                continue;
            }
            let result = if area == Viewport::sized(width, height) {
                self.clear_whole(target, value)
            } else {
                let program = PassProgram::clear(target, value);
                let uniforms = PassUniforms {
                    projection: glam::Mat4::IDENTITY,
                    depth: crate::kernels::DepthSpace::from_projection(&glam::Mat4::IDENTITY, false),
                    viewport: area,
                };
                self.run_screen_program(&program, &uniforms)
            };
            if let Err(error) = result {
                warn!("Clearing {:?} failed: {}", target, error);
            }
        }
    }

    fn begin_scene(
        &mut self,
        pass: &ScenePass<'_, WgpuTexture>,
        uniforms: &PassUniforms,
    ) -> Result<(), StrataError> {
        if self.scene.is_some() {
            warn!("Scene pass begun before the previous one ended");
            self.end_scene()?;
        }
        let program = PassProgram::scene(pass);
        let bind_group = self.bind_group(&program, uniforms)?;
        self.scene = Some(RecordedScene {
            program,
            bind_group,
            viewport: uniforms.viewport,
            commands: Vec::new(),
            active_query: None,
        });
        Ok(())
    }

    fn draw(&mut self, geometry: &WgpuGeometry, state: StateSetId) {
        if let Some(buffer) = &geometry.buffer {
            self.record_draw(buffer.clone(), geometry.vertex_count, state);
        }
    }

    fn draw_vertices(&mut self, vertices: &[SceneVertex], state: StateSetId) {
        if let Some(buffer) = self.upload(vertices) {
            self.record_draw(buffer, vertices.len() as u32, state);
        }
    }

    fn end_scene(&mut self) -> Result<(), StrataError> {
        self.end_query();
        match self.scene.take() {
            Some(scene) => self.encode_scene(scene),
            None => Ok(()),
        }
    }

    fn screen_pass(
        &mut self,
        pass: &ScreenPass<'_, WgpuTexture>,
        uniforms: &PassUniforms,
    ) -> Result<(), StrataError> {
        for program in PassProgram::screen(pass) {
            self.run_screen_program(&program, uniforms)?;
        }
        Ok(())
    }
}

impl WgpuBackend {
    fn clear_whole(&mut self, target: &WgpuTexture, value: [f32; 4]) -> Result<(), StrataError> {
        let view = self.entry(target)?.view.clone();
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Clear"),
            });
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Clear"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color {
                        r: f64::from(value[0]),
                        g: f64::from(value[1]),
                        b: f64::from(value[2]),
                        a: f64::from(value[3]),
                    }),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::DepthSpace;
    use crate::types::quad;
    use glam::{Mat4, Vec4};

    fn backend() -> Option<WgpuBackend> {
        match WgpuBackend::new() {
            Ok(backend) => Some(backend),
            Err(error) => {
                eprintln!("Skipping GPU test: {}", error);
                None
            }
        }
    }

    fn uniforms(width: u32, height: u32) -> PassUniforms {
        let projection = Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, 0.5, 10.5);
        PassUniforms {
            projection,
            depth: DepthSpace::from_projection(&projection, false),
            viewport: Viewport::sized(width, height),
        }
    }

    fn format_features(blendable: bool) -> wgpu::TextureFormatFeatures {
        let mut flags = wgpu::TextureFormatFeatureFlags::FILTERABLE;
        flags.set(wgpu::TextureFormatFeatureFlags::BLENDABLE, blendable);
        wgpu::TextureFormatFeatures {
            allowed_usages: wgpu::TextureUsages::RENDER_ATTACHMENT,
            flags,
        }
    }

    #[test]
    fn test_float32_blending_checks_every_target_format() {
        assert_eq!(missing_float32_blending(|_| format_features(true)), None);
        let single_channel = missing_float32_blending(|format| {
            format_features(format != wgpu::TextureFormat::R32Float)
        });
        assert_eq!(single_channel, Some(wgpu::TextureFormat::R32Float));
        // The formats wgpu guarantees are not enough.
        let guaranteed = missing_float32_blending(|format| {
            format.guaranteed_format_features(wgpu::Features::empty())
        });
        assert!(guaranteed.is_some());
    }

    #[test]
    fn test_gpu_depth_complexity_and_query() {
        let Some(mut backend) = backend() else {
            return;
        };
        let counts = backend
            .create_texture(&TextureDesc::new("counts", 4, 4, TextureFormat::R32Float))
            .unwrap();
        backend.clear(&[counts], [0.0; 4], Viewport::sized(4, 4));
        let geometry = backend.create_geometry(&quad([-1.0, -1.0], [1.0, 1.0], 2.0, Vec4::ONE));
        let query = backend.create_query().unwrap();

        backend
            .begin_scene(&ScenePass::DepthComplexity { counts: &counts }, &uniforms(4, 4))
            .unwrap();
        backend.begin_query(query, false);
        backend.draw(&geometry, StateSetId(0));
        backend.draw(&geometry, StateSetId(0));
        backend.end_query();
        backend.end_scene().unwrap();

        let texels = backend.read_texture(&counts).unwrap();
        assert!(texels.iter().all(|t| t[0] == 2.0));
        assert_eq!(backend.query_result(query).unwrap(), 32);
    }

    #[test]
    fn test_gpu_partial_clear_and_resolve() {
        let Some(mut backend) = backend() else {
            return;
        };
        let source = backend
            .create_texture(&TextureDesc::new("source", 4, 4, TextureFormat::Rgba16Float))
            .unwrap();
        let output = backend
            .create_texture(&TextureDesc::new("output", 4, 4, TextureFormat::Rgba8Unorm))
            .unwrap();
        backend.clear(&[source, output], [0.0; 4], Viewport::sized(4, 4));
        backend.clear(&[source], [0.0, 0.0, 1.0, 1.0], Viewport::new(2, 0, 2, 4));
        backend
            .screen_pass(
                &ScreenPass::Resolve {
                    source: &source,
                    output: &output,
                },
                &uniforms(4, 4),
            )
            .unwrap();
        let texels = backend.read_texture(&output).unwrap();
        assert_eq!(texels[0], [0.0; 4]);
        assert_eq!(texels[3], [0.0, 0.0, 1.0, 1.0]);
    }
}
