//! Multi-layer dual depth peeling over one viewport.
//!
//! Every pass peels the nearest and the farthest remaining fragment of each
//! depth slice. Peeled fronts accumulate front to back, peeled backs back to
//! front, and the slices are composited in order once the occlusion queries
//! report that nothing is left to peel.

use tracing::{debug, info, warn};

use crate::backend::{Backend, PassUniforms, ScenePass, ScreenPass, TextureDesc, TextureFormat, Viewport};
use crate::config::Parameters;
use crate::constants::{DEPTH_CLEAR, MAX_NUM_RETRIES};
use crate::draw_list::{Camera, RenderInfo};
use crate::error::StrataError;
use crate::kernels::DepthSpace;
use crate::occlusion_query::{OcclusionQueryGroup, PassSamples};
use crate::partitioner::{packed_textures, Partitioner};
use crate::render_bin::{BinRenderer, SceneRenderer};

/// Work done by one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Peeling passes, the first depth pass included.
    pub peel_passes: u32,
    /// Scene renders issued by the partitioner.
    pub partition_passes: u32,
    /// Scene renders issued by diagnostics.
    pub diagnostic_passes: u32,
}

impl FrameStats {
    /// Total number of times the draw list was replayed.
    pub fn scene_renders(&self) -> u32 {
        self.peel_passes + self.partition_passes + self.diagnostic_passes
    }
}

/// Decides when a peel loop is done from resolved pass samples.
#[derive(Debug, Clone, Default)]
pub struct Termination {
    last_samples: Option<u64>,
    retries: u32,
    finished: bool,
}

impl Termination {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feeds the latest resolved pass. `passes` is the number of passes
    /// rendered so far.
    pub fn update(
        &mut self,
        resolved: Option<PassSamples>,
        passes: u32,
        parameters: &Parameters,
    ) -> bool {
        if passes == 0 {
            return false;
        }
        if let Some(PassSamples { pass, samples }) = resolved {
            debug!("Pass {} resolved with {} samples", pass, samples);
            if samples <= parameters.samples_cutoff {
                self.finished = true;
            }
            if !parameters.any_samples_queries {
                if self.last_samples == Some(samples) {
                    self.retries += 1;
                }
                self.last_samples = Some(samples);
            }
        }
        if !self.finished && self.retries >= MAX_NUM_RETRIES {
            warn!("Possible infinite loop peeling, finishing");
            self.finished = true;
        }
        if parameters.maximum_passes != 0 && passes >= parameters.maximum_passes {
            self.finished = true;
        }
        self.finished
    }
}

/// Viewport of `camera` with a projection and depth mapping for engine
/// passes.
pub fn pass_uniforms(camera: &Camera, parameters: &Parameters) -> PassUniforms {
    PassUniforms {
        projection: camera.projection,
        depth: DepthSpace::from_projection(&camera.projection, parameters.unproject_depths),
        viewport: camera.viewport,
    }
}

pub struct Canvas<B: Backend> {
    camera_id: u64,
    size: (u32, u32),
    slices: usize,
    queries: OcclusionQueryGroup<B::Query>,
    partitioner: Partitioner<B::Texture>,
    /// Ping-pong depth sets, `(-front, back)` per slice.
    depth_sets: [Vec<B::Texture>; 2],
    /// Packed front and back colors of every slice.
    colors: Vec<B::Texture>,
    fronts: Vec<B::Texture>,
    backs: Vec<B::Texture>,
    complexity: Option<B::Texture>,
    pass: u32,
    ping: usize,
    termination: Termination,
    stats: FrameStats,
    max_depth_complexity: Option<f32>,
    slice_profile: Option<Vec<f64>>,
}

impl<B: Backend> Canvas<B> {
    /// Allocates a canvas for `camera` whose textures cover `size`.
    pub fn new(
        backend: &mut B,
        parameters: &Parameters,
        camera: &Camera,
        size: (u32, u32),
    ) -> Result<Self, StrataError> {
        let (width, height) = (size.0.max(1), size.1.max(1));
        let slices = parameters.num_slices();
        debug!("Allocating {} slice canvas {}x{}", slices, width, height);

        let mut create = |label: &str, format: TextureFormat, count: usize| {
            (0..count)
                .map(|i| {
                    backend.create_texture(&TextureDesc::new(
                        format!("{label}_{i}"),
                        width,
                        height,
                        format,
                    ))
                })
                .collect::<Result<Vec<_>, _>>()
        };
        let depth_sets = [
            create("canvas_depths_a", TextureFormat::Rgba32Float, slices.div_ceil(2))?,
            create("canvas_depths_b", TextureFormat::Rgba32Float, slices.div_ceil(2))?,
        ];
        let colors = create(
            "canvas_colors",
            TextureFormat::Rgba32Float,
            packed_textures(2 * slices),
        )?;
        let fronts = create("canvas_fronts", TextureFormat::Rgba16Float, slices)?;
        let backs = create("canvas_backs", TextureFormat::Rgba16Float, slices)?;

        Ok(Self {
            camera_id: camera.id,
            size: (width, height),
            slices,
            queries: OcclusionQueryGroup::new(),
            partitioner: Partitioner::for_parameters(parameters),
            depth_sets,
            colors,
            fronts,
            backs,
            complexity: None,
            pass: 0,
            ping: 0,
            termination: Termination::default(),
            stats: FrameStats::default(),
            max_depth_complexity: None,
            slice_profile: None,
        })
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn pass(&self) -> u32 {
        self.pass
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn max_depth_complexity(&self) -> Option<f32> {
        self.max_depth_complexity
    }

    pub fn slice_profile(&self) -> Option<&[f64]> {
        self.slice_profile.as_deref()
    }

    /// Whether the canvas can render `camera` without reallocating.
    pub fn is_valid_for(&self, camera: &Camera) -> bool {
        let viewport = camera.viewport;
        camera.id == self.camera_id
            && viewport.x + viewport.width <= self.size.0
            && viewport.y + viewport.height <= self.size.1
    }

    /// Runs a whole frame over `target`.
    pub fn draw(
        &mut self,
        backend: &mut B,
        info: &mut RenderInfo<B::Geometry>,
        parameters: &Parameters,
        target: &B::Texture,
    ) -> Result<FrameStats, StrataError> {
        let uniforms = pass_uniforms(&info.camera, parameters);
        let mut renderer = BinRenderer::new(info, parameters);
        self.start_frame(backend, &mut renderer, parameters, &uniforms)?;
        loop {
            self.peel(backend, &mut renderer, parameters, &uniforms)?;
            self.blend(backend, &uniforms)?;
            if self.check_finished(backend, parameters)? {
                break;
            }
        }
        self.finish_frame(backend, target, &uniforms)?;
        Ok(self.stats)
    }

    /// Resets the frame state, runs the enabled diagnostics and partitions
    /// the scene.
    pub fn start_frame<R: SceneRenderer<B>>(
        &mut self,
        backend: &mut B,
        renderer: &mut R,
        parameters: &Parameters,
        uniforms: &PassUniforms,
    ) -> Result<(), StrataError> {
        self.pass = 0;
        self.ping = 0;
        self.termination.reset();
        self.stats = FrameStats::default();
        self.queries.reset();

        if parameters.diagnostics.compute_max_depth_complexity {
            self.max_depth_complexity =
                Some(self.compute_max_depth_complexity(backend, renderer, uniforms)?);
        }

        if let Partitioner::Iterative(partitioner) = &mut self.partitioner {
            partitioner.compute(backend, renderer, parameters, uniforms, &mut self.stats)?;
            if parameters.diagnostics.profile_depth_partition {
                self.slice_profile = Some(partitioner.profile(
                    backend,
                    renderer,
                    parameters,
                    uniforms,
                    &mut self.stats,
                )?);
            }
            if let Some([x, y]) = parameters.diagnostics.debug_pixel {
                let points = partitioner.points_at(backend, parameters, x, y)?;
                info!("Split points at ({}, {}): {:?}", x, y, points);
            }
        }

        backend.clear(&self.fronts, [0.0; 4], uniforms.viewport);
        backend.clear(&self.backs, [0.0; 4], uniforms.viewport);
        Ok(())
    }

    fn compute_max_depth_complexity<R: SceneRenderer<B>>(
        &mut self,
        backend: &mut B,
        renderer: &mut R,
        uniforms: &PassUniforms,
    ) -> Result<f32, StrataError> {
        let counts = match self.complexity.take() {
            Some(counts) => counts,
            None => backend.create_texture(&TextureDesc::new(
                "canvas_depth_complexity",
                self.size.0,
                self.size.1,
                TextureFormat::R32Float,
            ))?,
        };
        backend.clear(
            std::slice::from_ref(&counts),
            [0.0; 4],
            Viewport::sized(self.size.0, self.size.1),
        );
        let rendered = renderer.render(
            backend,
            &ScenePass::DepthComplexity { counts: &counts },
            uniforms,
            None,
        );
        let texels = rendered.and_then(|()| backend.read_texture(&counts));
        self.complexity = Some(counts);
        self.stats.diagnostic_passes += 1;
        let max = texels?.iter().fold(0.0f32, |max, texel| max.max(texel[0]));
        info!("Max depth complexity: {}", max);
        Ok(max)
    }

    /// Renders one peeling pass.
    pub fn peel<R: SceneRenderer<B>>(
        &mut self,
        backend: &mut B,
        renderer: &mut R,
        parameters: &Parameters,
        uniforms: &PassUniforms,
    ) -> Result<(), StrataError> {
        let slices = self.slices;
        let viewport = uniforms.viewport;
        self.queries.begin_pass();
        let partition = self.partitioner.partition();

        if self.pass == 0 {
            backend.clear(&self.depth_sets[0], [DEPTH_CLEAR; 4], viewport);
            let pass = ScenePass::LayerFirst {
                partition,
                depths: &self.depth_sets[0],
                slices,
            };
            renderer.render(backend, &pass, uniforms, Some(&mut self.queries))?;
            self.ping = 0;
        } else {
            let next = 1 - self.ping;
            backend.clear(&self.depth_sets[next], [DEPTH_CLEAR; 4], viewport);
            backend.clear(&self.colors, [DEPTH_CLEAR; 4], viewport);
            let alpha_aware = parameters.alpha_aware_partition && slices > 1;
            let points = if slices > 1 {
                parameters.adjusted_num_points()
            } else {
                0
            };
            let pass = ScenePass::LayerPeel {
                partition,
                previous: &self.depth_sets[self.ping],
                accumulated: &self.fronts,
                depths: &self.depth_sets[next],
                colors: &self.colors,
                slices,
                points,
                opacity_threshold: parameters.opacity_threshold,
                alpha_aware,
            };
            renderer.render(backend, &pass, uniforms, Some(&mut self.queries))?;
            self.ping = next;
        }
        self.pass += 1;
        self.stats.peel_passes += 1;
        debug!("Peel pass {} rendered", self.pass);
        Ok(())
    }

    /// Accumulates the colors peeled by the last pass. Nothing is peeled by
    /// the first pass.
    pub fn blend(&mut self, backend: &mut B, uniforms: &PassUniforms) -> Result<(), StrataError> {
        if self.pass <= 1 {
            return Ok(());
        }
        backend.screen_pass(
            &ScreenPass::LayerBlend {
                colors: &self.colors,
                fronts: &self.fronts,
                backs: &self.backs,
                slices: self.slices,
            },
            uniforms,
        )
    }

    /// Whether peeling can stop after the passes rendered so far.
    pub fn check_finished(
        &mut self,
        backend: &mut B,
        parameters: &Parameters,
    ) -> Result<bool, StrataError> {
        if self.pass == 0 {
            return Ok(false);
        }
        let resolved = self
            .queries
            .check_queries(backend, parameters.query_latency)?;
        Ok(self.termination.update(resolved, self.pass, parameters))
    }

    /// Composites the slices front to back over `target`.
    pub fn finish_frame(
        &mut self,
        backend: &mut B,
        target: &B::Texture,
        uniforms: &PassUniforms,
    ) -> Result<(), StrataError> {
        backend.screen_pass(
            &ScreenPass::LayerComposite {
                fronts: &self.fronts,
                backs: &self.backs,
                output: target,
                slices: self.slices,
            },
            uniforms,
        )?;
        debug!(
            "Frame done: {} peel passes, {} partition passes",
            self.stats.peel_passes, self.stats.partition_passes
        );
        Ok(())
    }

    pub fn release(&mut self, backend: &mut B) {
        self.queries.release(backend);
        self.partitioner.release(backend);
        let [a, b] = &mut self.depth_sets;
        let textures = a
            .drain(..)
            .chain(b.drain(..))
            .chain(self.colors.drain(..))
            .chain(self.fronts.drain(..))
            .chain(self.backs.drain(..))
            .chain(self.complexity.take())
            .collect::<Vec<_>>();
        for texture in textures {
            backend.release_texture(texture);
        }
        self.size = (0, 0);
    }
}
