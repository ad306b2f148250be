//! Entry point the host calls once per frame with its transparent draw list.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::backend::{Backend, PassUniforms, ScenePass, ShaderSet};
use crate::canvas::FrameStats;
use crate::config::Parameters;
use crate::context::{Context, ContextRegistry, ContextToken};
use crate::draw_list::{RenderInfo, StateSetId};
use crate::error::StrataError;
use crate::occlusion_query::OcclusionQueryGroup;

/// Replays the scene for one engine pass.
pub trait SceneRenderer<B: Backend> {
    /// Draws every leaf with the program of `pass`, counting samples into
    /// `queries` when given.
    fn render(
        &mut self,
        backend: &mut B,
        pass: &ScenePass<'_, B::Texture>,
        uniforms: &PassUniforms,
        queries: Option<&mut OcclusionQueryGroup<B::Query>>,
    ) -> Result<(), StrataError>;

    /// Draws the bounding box of every leaf instead of its geometry.
    fn render_bounds(
        &mut self,
        backend: &mut B,
        pass: &ScenePass<'_, B::Texture>,
        uniforms: &PassUniforms,
    ) -> Result<(), StrataError>;
}

/// [`SceneRenderer`] over a host draw list.
pub struct BinRenderer<'a, G> {
    info: &'a mut RenderInfo<G>,
    single_query_per_pass: bool,
    any_samples: bool,
}

impl<'a, G> BinRenderer<'a, G> {
    pub fn new(info: &'a mut RenderInfo<G>, parameters: &Parameters) -> Self {
        Self {
            info,
            single_query_per_pass: parameters.single_query_per_pass,
            any_samples: parameters.any_samples_queries,
        }
    }

    pub fn info(&self) -> &RenderInfo<G> {
        self.info
    }

    /// Visits the state graphs with their state sets pushed onto the host
    /// stack, leaving the stack as found.
    fn for_each_graph<F>(&mut self, mut visit: F) -> Result<(), StrataError>
    where
        F: FnMut(StateSetId, usize, &crate::draw_list::StateGraph<G>) -> Result<(), StrataError>,
    {
        let RenderInfo {
            state_graphs, host, ..
        } = &mut *self.info;
        let saved = host.stack.len();
        #[cfg(debug_assertions)]
        let snapshot = host.stack.clone();

        let mut first_leaf = 0;
        let mut result = Ok(());
        for graph in state_graphs.iter() {
            for &ancestor in &graph.ancestors {
                host.stack.push(ancestor);
            }
            host.stack.push(graph.state);
            result = visit(graph.state, first_leaf, graph);
            host.stack.pop_to(saved);
            if result.is_err() {
                break;
            }
            first_leaf += graph.leaves.len();
        }

        #[cfg(debug_assertions)]
        debug_assert_eq!(snapshot, host.stack, "state stack modified by render");
        result
    }
}

impl<B: Backend> SceneRenderer<B> for BinRenderer<'_, B::Geometry> {
    fn render(
        &mut self,
        backend: &mut B,
        pass: &ScenePass<'_, B::Texture>,
        uniforms: &PassUniforms,
        mut queries: Option<&mut OcclusionQueryGroup<B::Query>>,
    ) -> Result<(), StrataError> {
        backend.begin_scene(pass, uniforms)?;
        let single_query = self.single_query_per_pass;
        let any_samples = self.any_samples;

        if single_query {
            if let Some(group) = queries.as_deref_mut() {
                group.begin_query(backend, 0, any_samples)?;
            }
        }
        let drawn = self.for_each_graph(|state, first_leaf, graph| {
            for (offset, leaf) in graph.leaves.iter().enumerate() {
                let index = first_leaf + offset;
                match queries.as_deref_mut() {
                    Some(group) if !single_query => {
                        if group.latest_samples_passed(index) == Some(0) {
                            continue;
                        }
                        group.begin_query(backend, index, any_samples)?;
                        backend.draw(&leaf.geometry, state);
                        group.end_query(backend);
                    }
                    _ => backend.draw(&leaf.geometry, state),
                }
            }
            Ok(())
        });
        if single_query {
            if let Some(group) = queries.as_deref_mut() {
                group.end_query(backend);
            }
        }
        let ended = backend.end_scene();
        drawn.and(ended)
    }

    fn render_bounds(
        &mut self,
        backend: &mut B,
        pass: &ScenePass<'_, B::Texture>,
        uniforms: &PassUniforms,
    ) -> Result<(), StrataError> {
        backend.begin_scene(pass, uniforms)?;
        let drawn = self.for_each_graph(|state, _, graph| {
            for leaf in &graph.leaves {
                match &leaf.bounds {
                    Some(bounds) => backend.draw_vertices(&bounds.triangles(), state),
                    None => backend.draw(&leaf.geometry, state),
                }
            }
            Ok(())
        });
        let ended = backend.end_scene();
        drawn.and(ended)
    }
}

/// How a [`RenderBin`] peels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeelMode {
    /// Multi-layer dual peeling over depth slices.
    MultiLayer,
    /// Single-layer peeling over a grid of screen tiles.
    Tiled { rows: u32, columns: u32 },
}

/// Per-frame entry point for transparent draws.
pub struct RenderBin<B: Backend> {
    parameters: Parameters,
    mode: PeelMode,
    contexts: ContextRegistry<B>,
    extra_shaders: Mutex<HashMap<StateSetId, ShaderSet>>,
}

impl<B: Backend> RenderBin<B> {
    pub fn new(parameters: Parameters) -> Result<Self, StrataError> {
        Self::with_mode(parameters, PeelMode::MultiLayer)
    }

    pub fn with_mode(parameters: Parameters, mode: PeelMode) -> Result<Self, StrataError> {
        parameters.validate()?;
        if let PeelMode::Tiled { rows, columns } = mode {
            if rows == 0 || columns == 0 {
                return Err(StrataError::InvalidParameters(format!(
                    "tile grid {rows}x{columns} is empty"
                )));
            }
        }
        info!(
            "Render bin with {} slices, {:?}",
            parameters.num_slices(),
            mode
        );
        Ok(Self {
            parameters,
            mode,
            contexts: ContextRegistry::new(),
            extra_shaders: Mutex::new(HashMap::new()),
        })
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn mode(&self) -> PeelMode {
        self.mode
    }

    /// Replaces the parameters. Returns false when a field that shapes
    /// shaders or textures changed, in which case every context session was
    /// discarded.
    pub fn set_parameters(
        &mut self,
        backend: &mut B,
        parameters: Parameters,
    ) -> Result<bool, StrataError> {
        parameters.validate()?;
        if self.parameters.update(&parameters) {
            debug!("Parameters updated in place");
            return Ok(true);
        }
        info!("Parameters changed incompatibly, discarding sessions");
        self.contexts.clear(backend);
        self.parameters = parameters;
        Ok(false)
    }

    /// Attaches WGSL snippets to a state set. A missing stage keeps the
    /// default shading.
    pub fn add_extra_shaders_for_state(
        &self,
        backend: &mut B,
        state: StateSetId,
        vertex: Option<&str>,
        fragment: Option<&str>,
    ) {
        if vertex.is_none() {
            debug!("State {:?} has no vertex snippet, using default", state);
        }
        if fragment.is_none() {
            debug!("State {:?} has no fragment snippet, using default", state);
        }
        let shaders = ShaderSet {
            vertex: vertex.map(str::to_owned),
            fragment: fragment.map(str::to_owned),
        };
        backend.set_extra_shaders(state, &shaders);
        if let Ok(mut extra) = self.extra_shaders.lock() {
            extra.insert(state, shaders);
        }
    }

    pub fn extra_shaders(&self, state: StateSetId) -> Option<ShaderSet> {
        self.extra_shaders
            .lock()
            .ok()
            .and_then(|extra| extra.get(&state).cloned())
    }

    /// Renders one frame of transparent draws over `target`.
    pub fn draw(
        &self,
        backend: &mut B,
        info: &mut RenderInfo<B::Geometry>,
        target: &B::Texture,
    ) -> Result<FrameStats, StrataError> {
        let parameters = &self.parameters;
        let mode = self.mode;
        self.contexts.with_context(info.context, |context| {
            context.draw_frame(backend, info, parameters, mode, target)
        })
    }

    /// Replays the draw list with `pass` and `uniforms`.
    pub fn render(
        &self,
        backend: &mut B,
        info: &mut RenderInfo<B::Geometry>,
        pass: &ScenePass<'_, B::Texture>,
        uniforms: &PassUniforms,
        queries: Option<&mut OcclusionQueryGroup<B::Query>>,
    ) -> Result<(), StrataError> {
        BinRenderer::new(info, &self.parameters).render(backend, pass, uniforms, queries)
    }

    /// Replays the draw list's bounding boxes with `pass`.
    pub fn render_bounds(
        &self,
        backend: &mut B,
        info: &mut RenderInfo<B::Geometry>,
        pass: &ScenePass<'_, B::Texture>,
        uniforms: &PassUniforms,
    ) -> Result<(), StrataError> {
        BinRenderer::new(info, &self.parameters).render_bounds(backend, pass, uniforms)
    }

    /// Forgets everything cached for a destroyed GPU context.
    pub fn on_context_destroyed(&self, token: ContextToken) -> bool {
        let removed = self.contexts.remove(token);
        if !removed {
            warn!("Destroyed context {:?} was never used", token);
        }
        removed
    }

    /// Number of contexts holding a session.
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Runs `f` on the session of `token`, if any.
    pub fn inspect_context<R>(
        &self,
        token: ContextToken,
        f: impl FnOnce(&Context<B>) -> R,
    ) -> Option<R> {
        self.contexts.inspect(token, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SoftwareBackend, SoftwareGeometry, TextureDesc, TextureFormat, Viewport};
    use crate::draw_list::{Camera, Leaf, StateGraph};
    use crate::kernels::DepthSpace;
    use crate::types::{Aabb, quad};
    use glam::{Mat4, Vec3, Vec4};

    fn scene(backend: &mut SoftwareBackend) -> RenderInfo<SoftwareGeometry> {
        let projection = Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, 0.5, 10.5);
        let camera = Camera::new(7, projection, Viewport::sized(4, 4));
        let near = quad([-1.0, -1.0], [1.0, 1.0], 2.0, Vec4::ONE);
        let far = quad([-1.0, -1.0], [0.0, 0.0], 4.0, Vec4::ONE);
        let mut info = RenderInfo::new(ContextToken(3), camera)
            .with_state_graph(
                StateGraph::new(StateSetId(1))
                    .with_ancestors(vec![StateSetId(10)])
                    .with_leaf(Leaf::new(backend.create_geometry(&near))),
            )
            .with_state_graph(
                StateGraph::new(StateSetId(2)).with_leaf(
                    Leaf::new(backend.create_geometry(&far)).with_bounds(Aabb::new(
                        Vec3::new(-1.0, -1.0, -6.0),
                        Vec3::new(1.0, 1.0, -3.0),
                    )),
                ),
            );
        info.host.stack.push(StateSetId(99));
        info
    }

    fn uniforms(info: &RenderInfo<SoftwareGeometry>) -> PassUniforms {
        PassUniforms {
            projection: info.camera.projection,
            depth: DepthSpace::from_projection(&info.camera.projection, false),
            viewport: info.camera.viewport,
        }
    }

    #[test]
    fn test_render_leaves_state_stack_untouched() {
        let mut backend = SoftwareBackend::new();
        let mut info = scene(&mut backend);
        let counts = backend
            .create_texture(&TextureDesc::new("counts", 4, 4, TextureFormat::R32Float))
            .unwrap();
        let uniforms = uniforms(&info);
        let parameters = Parameters::new();
        let mut queries = OcclusionQueryGroup::new();
        queries.begin_pass();
        BinRenderer::new(&mut info, &parameters)
            .render(
                &mut backend,
                &ScenePass::DepthComplexity { counts: &counts },
                &uniforms,
                Some(&mut queries),
            )
            .unwrap();
        assert_eq!(info.host.stack.len(), 1);
        assert_eq!(info.host.stack.top(), Some(StateSetId(99)));

        let resolved = queries.check_queries(&mut backend, 0).unwrap().unwrap();
        assert_eq!(resolved.samples, 16 + 4);
        assert_eq!(queries.latest_samples_passed(0), Some(16));
        assert_eq!(queries.latest_samples_passed(1), Some(4));
    }

    #[test]
    fn test_render_skips_leaves_without_samples() {
        let mut backend = SoftwareBackend::new();
        let mut info = scene(&mut backend);
        // Beyond the far plane, so it never produces a sample.
        let hidden = quad([-1.0, -1.0], [1.0, 1.0], 20.0, Vec4::ONE);
        info.state_graphs.push(
            StateGraph::new(StateSetId(3)).with_leaf(Leaf::new(backend.create_geometry(&hidden))),
        );
        let counts = backend
            .create_texture(&TextureDesc::new("counts", 4, 4, TextureFormat::R32Float))
            .unwrap();
        let uniforms = uniforms(&info);
        let parameters = Parameters::new();
        let mut queries = OcclusionQueryGroup::new();
        let pass = ScenePass::DepthComplexity { counts: &counts };
        for _ in 0..2 {
            queries.begin_pass();
            BinRenderer::new(&mut info, &parameters)
                .render(&mut backend, &pass, &uniforms, Some(&mut queries))
                .unwrap();
            queries.check_queries(&mut backend, 0).unwrap();
        }
        assert_eq!(queries.latest_samples_passed(2), Some(0));
        assert_eq!(backend.stats().draws, 5);
    }

    #[test]
    fn test_single_query_per_pass_sums_all_leaves() {
        let mut backend = SoftwareBackend::new();
        let mut info = scene(&mut backend);
        let counts = backend
            .create_texture(&TextureDesc::new("counts", 4, 4, TextureFormat::R32Float))
            .unwrap();
        let uniforms = uniforms(&info);
        let parameters = Parameters::new().with_single_query_per_pass(true);
        let mut queries = OcclusionQueryGroup::new();
        queries.begin_pass();
        BinRenderer::new(&mut info, &parameters)
            .render(
                &mut backend,
                &ScenePass::DepthComplexity { counts: &counts },
                &uniforms,
                Some(&mut queries),
            )
            .unwrap();
        let resolved = queries.check_queries(&mut backend, 0).unwrap().unwrap();
        assert_eq!(resolved.samples, 20);
        assert_eq!(queries.latest_samples_passed(1), None);
    }

    #[test]
    fn test_render_bounds_draws_boxes() {
        let mut backend = SoftwareBackend::new();
        let mut info = scene(&mut backend);
        let bounds = backend
            .create_texture(&TextureDesc::new("bounds", 4, 4, TextureFormat::Rg32Float))
            .unwrap();
        backend.clear(&[bounds], [-1e9; 4], Viewport::sized(4, 4));
        let uniforms = uniforms(&info);
        let bin = RenderBin::<SoftwareBackend>::new(Parameters::new()).unwrap();
        bin.render_bounds(
            &mut backend,
            &mut info,
            &ScenePass::DepthBounds { bounds: &bounds },
            &uniforms,
        )
        .unwrap();
        // The near quad is drawn as is, the box reaches eye depth 6.
        let texel = backend.texel(&bounds, 3, 3);
        assert!((-texel.x - 2.0).abs() < 1e-4);
        assert!((texel.y - 6.0).abs() < 1e-4);
    }

    #[test]
    fn test_incompatible_parameters_discard_sessions() {
        let mut backend = SoftwareBackend::new();
        let mut info = scene(&mut backend);
        let target = backend
            .create_texture(&TextureDesc::new("target", 4, 4, TextureFormat::Rgba8Unorm))
            .unwrap();
        let mut bin = RenderBin::new(Parameters::new().with_slices(2)).unwrap();
        bin.draw(&mut backend, &mut info, &target).unwrap();
        assert_eq!(bin.context_count(), 1);

        let compatible = Parameters::new()
            .with_slices(2)
            .with_maximum_passes(3)
            .with_quantiles(vec![0.4]);
        assert!(bin.set_parameters(&mut backend, compatible).unwrap());
        assert_eq!(bin.context_count(), 1);
        assert_eq!(bin.parameters().maximum_passes, 3);

        let incompatible = Parameters::new().with_slices(3);
        assert!(!bin.set_parameters(&mut backend, incompatible).unwrap());
        assert_eq!(bin.context_count(), 0);
        assert_eq!(bin.parameters().num_slices(), 3);
    }

    #[test]
    fn test_context_destroyed_drops_session() {
        let mut backend = SoftwareBackend::new();
        let mut info = scene(&mut backend);
        let target = backend
            .create_texture(&TextureDesc::new("target", 4, 4, TextureFormat::Rgba8Unorm))
            .unwrap();
        let bin = RenderBin::new(Parameters::new()).unwrap();
        bin.draw(&mut backend, &mut info, &target).unwrap();
        assert!(bin.on_context_destroyed(ContextToken(3)));
        assert!(!bin.on_context_destroyed(ContextToken(3)));
        assert_eq!(bin.context_count(), 0);
    }

    #[test]
    fn test_extra_shaders_are_forwarded() {
        let mut backend = SoftwareBackend::new();
        let bin = RenderBin::<SoftwareBackend>::new(Parameters::new()).unwrap();
        bin.add_extra_shaders_for_state(
            &mut backend,
            StateSetId(4),
            None,
            Some("fn shade_fragment(in: FragmentInput) -> vec4<f32> { return in.color; }"),
        );
        let shaders = bin.extra_shaders(StateSetId(4)).unwrap();
        assert!(shaders.vertex.is_none());
        assert_eq!(backend.extra_shaders(StateSetId(4)), Some(&shaders));
    }
}
