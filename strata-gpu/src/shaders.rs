//! Shader source code embedded at compile time.
//!
//! Pass programs are assembled from these pieces: a generated header
//! (constants, texture bindings, output struct), the prelude, the slice
//! helpers when the pass reads a partition, the scene or screen entry points
//! and finally the pass body defining `run_pass`.

/// Uniform block and per-pixel arithmetic mirrored from `kernels`.
pub const PRELUDE: &str = include_str!("../shaders/prelude.wgsl");

/// `slice_of` over the bound partition textures.
pub const SLICES: &str = include_str!("../shaders/slices.wgsl");

/// Entry points of passes replaying the draw list.
pub const SCENE: &str = include_str!("../shaders/scene.wgsl");

/// Default `shade_vertex`, replaced by a state set's vertex snippet.
pub const SCENE_VERTEX: &str = include_str!("../shaders/scene_vertex.wgsl");

/// Default `shade_fragment`, `fragment_alpha` and `fragment_depth`, replaced
/// by a state set's fragment snippet.
pub const SCENE_FRAGMENT: &str = include_str!("../shaders/scene_fragment.wgsl");

/// Entry points of full-viewport passes.
pub const SCREEN: &str = include_str!("../shaders/screen.wgsl");

pub const DEPTH_COMPLEXITY: &str = include_str!("../shaders/depth_complexity.wgsl");
pub const DEPTH_BOUNDS: &str = include_str!("../shaders/depth_bounds.wgsl");
pub const FIRST_COUNT: &str = include_str!("../shaders/first_count.wgsl");
pub const REFINE_COUNT: &str = include_str!("../shaders/refine_count.wgsl");
pub const SLICE_COUNT: &str = include_str!("../shaders/slice_count.wgsl");
pub const LAYER_FIRST: &str = include_str!("../shaders/layer_first.wgsl");
pub const LAYER_PEEL: &str = include_str!("../shaders/layer_peel.wgsl");
pub const SINGLE_FIRST: &str = include_str!("../shaders/single_first.wgsl");
pub const SINGLE_PEEL: &str = include_str!("../shaders/single_peel.wgsl");

pub const FIRST_SEARCH: &str = include_str!("../shaders/first_search.wgsl");
pub const REFINE_SEARCH: &str = include_str!("../shaders/refine_search.wgsl");
pub const REPROJECT: &str = include_str!("../shaders/reproject.wgsl");
pub const LAYER_BLEND: &str = include_str!("../shaders/layer_blend.wgsl");
pub const LAYER_COMPOSITE: &str = include_str!("../shaders/layer_composite.wgsl");
pub const TILE_BLEND: &str = include_str!("../shaders/tile_blend.wgsl");
pub const RESOLVE: &str = include_str!("../shaders/resolve.wgsl");

/// Fills every target with the clear value carried in the uniforms.
pub const CLEAR: &str = include_str!("../shaders/clear.wgsl");
