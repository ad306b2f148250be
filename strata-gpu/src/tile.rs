//! Single-layer depth peeling over a grid of screen tiles.
//!
//! Tiles borrow their render targets from a per-context pool, so only as many
//! tiles as the pool can serve are peeled at once. The others wait for a later
//! round.

use std::collections::VecDeque;

use glam::{Mat4, Vec4};
use tracing::{debug, warn};

use crate::backend::{
    Backend, PassUniforms, ScenePass, ScreenPass, TextureDesc, TextureFormat, Viewport,
};
use crate::canvas::{FrameStats, Termination};
use crate::config::Parameters;
use crate::constants::{
    DEPTH_CLEAR, POOL_COLOR_TEXTURES, POOL_DEPTH_TEXTURES, TILE_COLOR_TEXTURES,
    TILE_DEPTH_TEXTURES,
};
use crate::draw_list::{Camera, RenderInfo};
use crate::error::StrataError;
use crate::kernels::DepthSpace;
use crate::occlusion_query::OcclusionQueryGroup;
use crate::render_bin::{BinRenderer, SceneRenderer};
use crate::resource_pool::ResourcePool;

const DEPTH_FORMAT: TextureFormat = TextureFormat::R32Float;
const COLOR_FORMAT: TextureFormat = TextureFormat::Rgba32Float;

/// Projection that maps the pixel rectangle `region` of `viewport` onto the
/// whole clip space.
pub fn sub_frustum(projection: &Mat4, viewport: Viewport, region: Viewport) -> Mat4 {
    let to_ndc_x = |x: u32| 2.0 * (x - viewport.x) as f32 / viewport.width as f32 - 1.0;
    let to_ndc_y = |y: u32| 1.0 - 2.0 * (y - viewport.y) as f32 / viewport.height as f32;
    let (left, right) = (to_ndc_x(region.x), to_ndc_x(region.x + region.width));
    let (top, bottom) = (to_ndc_y(region.y), to_ndc_y(region.y + region.height));
    let sx = 2.0 / (right - left);
    let sy = 2.0 / (top - bottom);
    let scale = Mat4::from_cols(
        Vec4::new(sx, 0.0, 0.0, 0.0),
        Vec4::new(0.0, sy, 0.0, 0.0),
        Vec4::Z,
        Vec4::new(-(right + left) * 0.5 * sx, -(top + bottom) * 0.5 * sy, 0.0, 1.0),
    );
    scale * *projection
}

/// One screen region peeled layer by layer.
pub struct Tile<B: Backend> {
    /// Pixels covered on screen.
    region: Viewport,
    uniforms: PassUniforms,
    depths: Vec<B::Texture>,
    color: Option<B::Texture>,
    queries: OcclusionQueryGroup<B::Query>,
    termination: Termination,
    passes: u32,
    ping: usize,
}

impl<B: Backend> Tile<B> {
    pub fn new(camera: &Camera, region: Viewport, parameters: &Parameters) -> Self {
        let projection = sub_frustum(&camera.projection, camera.viewport, region);
        Self {
            region,
            uniforms: PassUniforms {
                projection,
                depth: DepthSpace::from_projection(&projection, parameters.unproject_depths),
                viewport: Viewport::sized(region.width, region.height),
            },
            depths: Vec::new(),
            color: None,
            queries: OcclusionQueryGroup::new(),
            termination: Termination::default(),
            passes: 0,
            ping: 0,
        }
    }

    pub fn region(&self) -> Viewport {
        self.region
    }

    pub fn passes(&self) -> u32 {
        self.passes
    }

    /// Whether the tile holds its render targets.
    pub fn is_issued(&self) -> bool {
        self.color.is_some()
    }

    /// Takes render targets from `pool`. Fails, keeping nothing, when the
    /// pool cannot serve the whole set.
    pub fn init(&mut self, backend: &mut B, pool: &mut ResourcePool<B::Texture>) -> bool {
        let (width, height) = (self.region.width, self.region.height);
        let Some(depths) = pool.extract(backend, DEPTH_FORMAT, TILE_DEPTH_TEXTURES, width, height)
        else {
            return false;
        };
        let Some(mut colors) =
            pool.extract(backend, COLOR_FORMAT, TILE_COLOR_TEXTURES, width, height)
        else {
            pool.give_back(DEPTH_FORMAT, depths);
            return false;
        };
        self.depths = depths;
        self.color = colors.pop();
        self.passes = 0;
        self.ping = 0;
        self.termination.reset();
        self.queries.reset();
        true
    }

    /// Returns the render targets to `pool`.
    pub fn finish(&mut self, pool: &mut ResourcePool<B::Texture>) {
        pool.give_back(DEPTH_FORMAT, self.depths.drain(..));
        pool.give_back(COLOR_FORMAT, self.color.take());
    }

    /// Returns the render targets to `pool` and the queries to `backend`.
    pub fn release(&mut self, backend: &mut B, pool: &mut ResourcePool<B::Texture>) {
        self.finish(pool);
        self.queries.release(backend);
    }

    /// Renders the next layer. The first pass only finds the nearest depth.
    pub fn peel<R: SceneRenderer<B>>(
        &mut self,
        backend: &mut B,
        renderer: &mut R,
    ) -> Result<(), StrataError> {
        let (Some(color), [first, second]) = (&self.color, self.depths.as_slice()) else {
            return Ok(());
        };
        let depths = [first, second];
        let viewport = self.uniforms.viewport;
        self.queries.begin_pass();
        if self.passes == 0 {
            backend.clear(std::slice::from_ref(depths[0]), [DEPTH_CLEAR; 4], viewport);
            let pass = ScenePass::SingleFirst { depth: depths[0] };
            renderer.render(backend, &pass, &self.uniforms, Some(&mut self.queries))?;
            self.ping = 0;
        } else {
            let next = 1 - self.ping;
            backend.clear(std::slice::from_ref(depths[next]), [DEPTH_CLEAR; 4], viewport);
            backend.clear(std::slice::from_ref(color), [0.0; 4], viewport);
            let pass = ScenePass::SinglePeel {
                previous: depths[self.ping],
                depth: depths[next],
                color,
            };
            renderer.render(backend, &pass, &self.uniforms, Some(&mut self.queries))?;
            self.ping = next;
        }
        self.passes += 1;
        Ok(())
    }

    /// Blends the layer shaded by the last pass under `accumulator`.
    pub fn blend(&mut self, backend: &mut B, accumulator: &B::Texture) -> Result<(), StrataError> {
        let Some(color) = &self.color else {
            return Ok(());
        };
        if self.passes <= 1 {
            return Ok(());
        }
        let uniforms = PassUniforms {
            viewport: self.region,
            ..self.uniforms
        };
        backend.screen_pass(
            &ScreenPass::TileBlend {
                color,
                target: accumulator,
                origin: [self.region.x, self.region.y],
            },
            &uniforms,
        )
    }

    pub fn check_finished(
        &mut self,
        backend: &mut B,
        parameters: &Parameters,
    ) -> Result<bool, StrataError> {
        let resolved = self
            .queries
            .check_queries(backend, parameters.query_latency)?;
        Ok(self.termination.update(resolved, self.passes, parameters))
    }
}

/// The tile grid of one context with its texture pool and accumulator.
pub struct Screen<B: Backend> {
    rows: u32,
    columns: u32,
    tiles: Vec<Tile<B>>,
    grid: Option<(u64, Viewport, Mat4)>,
    pool: ResourcePool<B::Texture>,
    accumulator: Option<B::Texture>,
    size: (u32, u32),
}

impl<B: Backend> Screen<B> {
    pub fn new(rows: u32, columns: u32) -> Self {
        Self {
            rows: rows.max(1),
            columns: columns.max(1),
            tiles: Vec::new(),
            grid: None,
            pool: ResourcePool::new(),
            accumulator: None,
            size: (0, 0),
        }
    }

    pub fn tiles(&self) -> &[Tile<B>] {
        &self.tiles
    }

    pub fn pool(&self) -> &ResourcePool<B::Texture> {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut ResourcePool<B::Texture> {
        &mut self.pool
    }

    /// Pixel size of every tile of `viewport`.
    pub fn tile_size(&self, viewport: Viewport) -> (u32, u32) {
        (
            viewport.width.div_ceil(self.columns).max(1),
            viewport.height.div_ceil(self.rows).max(1),
        )
    }

    fn layout(&mut self, backend: &mut B, camera: &Camera, parameters: &Parameters) {
        let key = (camera.id, camera.viewport, camera.projection);
        if self.grid == Some(key) {
            return;
        }
        let viewport = camera.viewport;
        let (tile_width, tile_height) = self.tile_size(viewport);
        for mut tile in self.tiles.drain(..) {
            tile.release(backend, &mut self.pool);
        }
        for row in 0..self.rows {
            for column in 0..self.columns {
                let x = column * tile_width;
                let y = row * tile_height;
                if x >= viewport.width || y >= viewport.height {
                    continue;
                }
                let region = Viewport::new(
                    viewport.x + x,
                    viewport.y + y,
                    tile_width.min(viewport.width - x),
                    tile_height.min(viewport.height - y),
                );
                self.tiles.push(Tile::new(camera, region, parameters));
            }
        }
        debug!("Laid out {} tiles of {}x{}", self.tiles.len(), tile_width, tile_height);
        self.grid = Some(key);
    }

    fn accumulator(&mut self, backend: &mut B, viewport: Viewport) -> Result<B::Texture, StrataError> {
        let needed = (viewport.x + viewport.width, viewport.y + viewport.height);
        if let Some(accumulator) = &self.accumulator {
            if self.size.0 >= needed.0 && self.size.1 >= needed.1 {
                return Ok(accumulator.clone());
            }
        }
        if let Some(old) = self.accumulator.take() {
            backend.release_texture(old);
        }
        let accumulator = backend.create_texture(&TextureDesc::new(
            "screen_accumulator",
            needed.0.max(1),
            needed.1.max(1),
            TextureFormat::Rgba16Float,
        ))?;
        self.size = needed;
        self.accumulator = Some(accumulator.clone());
        Ok(accumulator)
    }

    /// Peels every tile and composites the result over `target`.
    pub fn draw(
        &mut self,
        backend: &mut B,
        info: &mut RenderInfo<B::Geometry>,
        parameters: &Parameters,
        target: &B::Texture,
    ) -> Result<FrameStats, StrataError> {
        let camera = info.camera;
        self.layout(backend, &camera, parameters);
        let accumulator = self.accumulator(backend, camera.viewport)?;
        backend.clear(std::slice::from_ref(&accumulator), [0.0; 4], camera.viewport);

        let (tile_width, tile_height) = self.tile_size(camera.viewport);
        self.pool
            .top_up(backend, DEPTH_FORMAT, POOL_DEPTH_TEXTURES, tile_width, tile_height)?;
        self.pool
            .top_up(backend, COLOR_FORMAT, POOL_COLOR_TEXTURES, tile_width, tile_height)?;

        let mut renderer = BinRenderer::new(info, parameters);
        let mut waiting: VecDeque<usize> = (0..self.tiles.len()).collect();
        let mut active: VecDeque<usize> = VecDeque::new();
        let mut stats = FrameStats::default();

        loop {
            while let Some(&index) = waiting.front() {
                if !self.tiles[index].init(backend, &mut self.pool) {
                    break;
                }
                waiting.pop_front();
                active.push_back(index);
            }
            if active.is_empty() {
                if !waiting.is_empty() {
                    warn!(
                        "No render targets for {} waiting tiles, skipping them",
                        waiting.len()
                    );
                }
                break;
            }

            for _ in 0..active.len() {
                let Some(index) = active.pop_front() else {
                    break;
                };
                let tile = &mut self.tiles[index];
                tile.blend(backend, &accumulator)?;
                tile.peel(backend, &mut renderer)?;
                stats.peel_passes += 1;
                if tile.check_finished(backend, parameters)? {
                    // The layer shaded by the final pass still needs blending.
                    tile.blend(backend, &accumulator)?;
                    debug!("Tile {:?} done after {} passes", tile.region(), tile.passes());
                    tile.finish(&mut self.pool);
                } else {
                    active.push_back(index);
                }
            }
        }

        backend.screen_pass(
            &ScreenPass::Resolve {
                source: &accumulator,
                output: target,
            },
            &PassUniforms {
                projection: camera.projection,
                depth: DepthSpace::from_projection(&camera.projection, parameters.unproject_depths),
                viewport: camera.viewport,
            },
        )?;
        Ok(stats)
    }

    pub fn release(&mut self, backend: &mut B) {
        for tile in &mut self.tiles {
            tile.release(backend, &mut self.pool);
        }
        self.pool.clear(backend);
        if let Some(accumulator) = self.accumulator.take() {
            backend.release_texture(accumulator);
        }
        self.tiles.clear();
        self.grid = None;
        self.size = (0, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::lagging::LaggingBackend;
    use crate::backend::{SoftwareBackend, SoftwareGeometry};
    use crate::context::ContextToken;
    use crate::draw_list::{Leaf, StateGraph, StateSetId};
    use crate::kernels;
    use crate::types::quad;

    fn colors() -> [Vec4; 3] {
        [
            Vec4::new(1.0, 0.0, 0.0, 0.5),
            Vec4::new(0.0, 1.0, 0.0, 0.5),
            Vec4::new(0.0, 0.0, 1.0, 0.5),
        ]
    }

    fn scene(backend: &mut SoftwareBackend) -> RenderInfo<SoftwareGeometry> {
        let projection = Mat4::perspective_rh(1.2, 1.0, 0.5, 50.0);
        let camera = Camera::new(1, projection, Viewport::sized(6, 6));
        let mut graph = StateGraph::new(StateSetId(1));
        for (i, color) in colors().iter().enumerate().rev() {
            let distance = 1.0 + i as f32;
            let vertices = quad(
                [-2.0 * distance, -2.0 * distance],
                [2.0 * distance, 2.0 * distance],
                distance,
                *color,
            );
            graph = graph.with_leaf(Leaf::new(backend.create_geometry(&vertices)));
        }
        RenderInfo::new(ContextToken(1), camera).with_state_graph(graph)
    }

    fn reference() -> Vec4 {
        colors().iter().fold(Vec4::ZERO, |acc, &color| {
            let color = kernels::unpack_color(kernels::pack_color(color));
            kernels::blend_under(acc, kernels::premultiply(color))
        })
    }

    #[test]
    fn test_sub_frustum_maps_region_to_clip_space() {
        let projection = Mat4::perspective_rh(1.0, 1.0, 0.5, 10.0);
        let viewport = Viewport::sized(4, 4);
        let region = Viewport::new(2, 0, 2, 2);
        let sub = sub_frustum(&projection, viewport, region);

        // The top right corner of the screen is the top right of the region.
        let t = 0.5f32.tan();
        let eye = glam::Vec3::new(2.0 * t, 2.0 * t, -2.0);
        let full = projection.project_point3(eye);
        let local = sub.project_point3(eye);
        assert!((full.x - 1.0).abs() < 1e-4 && (full.y - 1.0).abs() < 1e-4);
        assert!((local.x - 1.0).abs() < 1e-4 && (local.y - 1.0).abs() < 1e-4);
        assert!((local.z - full.z).abs() < 1e-6);
    }

    #[test]
    fn test_tile_init_fails_on_empty_pool() {
        let mut backend = SoftwareBackend::new();
        let mut info = scene(&mut backend);
        let parameters = Parameters::new().with_slices(1);
        let mut pool = ResourcePool::new();
        let mut tile = Tile::<SoftwareBackend>::new(&info.camera, Viewport::sized(3, 3), &parameters);
        assert!(!tile.init(&mut backend, &mut pool));
        assert!(!tile.is_issued());

        pool.top_up(&mut backend, DEPTH_FORMAT, 2, 3, 3).unwrap();
        assert!(!tile.init(&mut backend, &mut pool));
        assert_eq!(pool.available(DEPTH_FORMAT), 2);

        pool.top_up(&mut backend, COLOR_FORMAT, 1, 3, 3).unwrap();
        assert!(tile.init(&mut backend, &mut pool));
        let mut renderer = BinRenderer::new(&mut info, &parameters);
        tile.peel(&mut backend, &mut renderer).unwrap();
        assert_eq!(tile.passes(), 1);
        tile.finish(&mut pool);
        assert_eq!(pool.available(DEPTH_FORMAT), 2);
        assert_eq!(pool.available(COLOR_FORMAT), 1);
    }

    #[test]
    fn test_tiled_screen_matches_reference() {
        let mut backend = SoftwareBackend::new();
        let mut info = scene(&mut backend);
        let target = backend
            .create_texture(&TextureDesc::new("target", 6, 6, TextureFormat::Rgba32Float))
            .unwrap();
        let parameters = Parameters::new().with_slices(1);
        let mut screen = Screen::new(2, 2);
        let stats = screen
            .draw(&mut backend, &mut info, &parameters, &target)
            .unwrap();

        assert_eq!(screen.tiles().len(), 4);
        assert!(screen.tiles().iter().all(|tile| !tile.is_issued()));
        // Per tile: a depth-only first pass and one pass per layer, then an
        // empty pass whose zero-sample query ends the loop.
        assert_eq!(stats.peel_passes, 4 * 5);
        for (x, y) in [(0, 0), (5, 0), (2, 4), (5, 5)] {
            let pixel = backend.texel(&target, x, y);
            assert!((pixel - reference()).abs().max_element() < 0.02, "{pixel} at ({x}, {y})");
        }
        assert_eq!(screen.pool().available(DEPTH_FORMAT), POOL_DEPTH_TEXTURES);
        assert_eq!(screen.pool().available(COLOR_FORMAT), POOL_COLOR_TEXTURES);
    }

    #[test]
    fn test_tiles_with_late_query_results() {
        let latency = 2;
        let mut backend = LaggingBackend::new(2);
        let mut info = scene(backend.inner_mut());
        let target = backend
            .create_texture(&TextureDesc::new("target", 6, 6, TextureFormat::Rgba32Float))
            .unwrap();
        let parameters = Parameters::new()
            .with_slices(1)
            .with_query_latency(latency);
        let mut screen = Screen::new(2, 2);
        for _ in 0..2 {
            let stats = screen
                .draw(&mut backend, &mut info, &parameters, &target)
                .unwrap();
            assert!(
                (4 * 5..=4 * (5 + latency as u32)).contains(&stats.peel_passes),
                "{} passes",
                stats.peel_passes
            );
            for (x, y) in [(0, 0), (5, 0), (2, 4), (5, 5)] {
                let pixel = backend.inner().texel(&target, x, y);
                assert!((pixel - reference()).abs().max_element() < 0.02, "{pixel} at ({x}, {y})");
            }
        }

        screen.release(&mut backend);
        assert_eq!(backend.live_queries(), 0);
    }

    #[test]
    fn test_uneven_grid_clips_last_tiles() {
        let mut screen = Screen::<SoftwareBackend>::new(2, 4);
        let camera = Camera::new(
            1,
            Mat4::perspective_rh(1.0, 1.0, 0.5, 10.0),
            Viewport::sized(10, 5),
        );
        screen.layout(&mut SoftwareBackend::new(), &camera, &Parameters::new());
        assert_eq!(screen.tile_size(camera.viewport), (3, 3));
        let last = screen.tiles().last().unwrap().region();
        assert_eq!(last, Viewport::new(9, 3, 1, 2));
    }
}
