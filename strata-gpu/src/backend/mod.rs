//! GPU abstraction the peeling engine drives.
//!
//! Every pass the engine issues is named by a [`ScenePass`] (the draw list
//! replayed with an engine fragment program) or a [`ScreenPass`] (one
//! full-viewport triangle). Blend equations and target layouts are implied by
//! the variant, so backends only map variants onto their own pipelines.

pub mod software;
pub mod gpu;
pub mod queries;
#[cfg(test)]
pub(crate) mod lagging;

use std::fmt;

use glam::{Mat4, Vec4};

use crate::draw_list::StateSetId;
use crate::error::StrataError;
use crate::kernels::{self, DepthSpace};
use crate::types::SceneVertex;

pub use software::{SoftwareBackend, SoftwareGeometry, SoftwareTexture};
pub use gpu::{WgpuBackend, WgpuGeometry, WgpuTexture};
pub use queries::QueryLedger;

/// Pixel formats of engine render targets and host output targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TextureFormat {
    R32Float,
    Rg32Float,
    Rgba32Float,
    R16Float,
    Rg16Float,
    Rgba16Float,
    Rgba8Unorm,
}

impl TextureFormat {
    pub fn channels(self) -> usize {
        match self {
            TextureFormat::R32Float | TextureFormat::R16Float => 1,
            TextureFormat::Rg32Float | TextureFormat::Rg16Float => 2,
            TextureFormat::Rgba32Float | TextureFormat::Rgba16Float | TextureFormat::Rgba8Unorm => 4,
        }
    }

    pub fn to_wgpu(self) -> wgpu::TextureFormat {
        match self {
            TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
            TextureFormat::Rg32Float => wgpu::TextureFormat::Rg32Float,
            TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            TextureFormat::R16Float => wgpu::TextureFormat::R16Float,
            TextureFormat::Rg16Float => wgpu::TextureFormat::Rg16Float,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        }
    }
}

/// Description of a render target texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl TextureDesc {
    pub fn new(label: impl Into<String>, width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            format,
        }
    }
}

/// Pixel rectangle, origin at the top left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn sized(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.width && y < self.y + self.height
    }

    /// Intersection with a `width` x `height` texture.
    pub fn clipped(&self, width: u32, height: u32) -> Viewport {
        let x = self.x.min(width);
        let y = self.y.min(height);
        Viewport::new(
            x,
            y,
            (self.x + self.width).min(width) - x,
            (self.y + self.height).min(height) - y,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Per-pass uniforms shared by scene and screen passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassUniforms {
    pub projection: Mat4,
    pub depth: DepthSpace,
    pub viewport: Viewport,
}

/// Scene passes: the draw list replayed with an engine fragment program.
#[derive(Debug, Clone)]
pub enum ScenePass<'a, T> {
    /// Additive fragment count into an R32F target.
    DepthComplexity { counts: &'a T },
    /// `(-linear, linear)` into an RG32F target with max blending.
    DepthBounds { bounds: &'a T },
    /// First depth histogram into eight RGBA16F targets.
    FirstCount {
        bounds: &'a T,
        counts: &'a [T],
        alpha_aware: bool,
    },
    /// Sub-bin histogram of the intervals selected so far, one target per
    /// split point.
    RefineCount {
        bounds: &'a T,
        codes: &'a [T],
        counts: &'a [T],
        points: usize,
        levels: u32,
        alpha_aware: bool,
    },
    /// Per-slice fragment counts, four slices per RGBA32F target.
    SliceCount {
        partition: &'a [T],
        counts: &'a [T],
        slices: usize,
    },
    /// Depth bounds of every slice into the first depth set.
    LayerFirst {
        partition: &'a [T],
        depths: &'a [T],
        slices: usize,
    },
    /// Peels the front and back fragment of every slice.
    LayerPeel {
        partition: &'a [T],
        previous: &'a [T],
        accumulated: &'a [T],
        depths: &'a [T],
        colors: &'a [T],
        slices: usize,
        points: usize,
        opacity_threshold: f32,
        alpha_aware: bool,
    },
    /// Nearest fragment depth, negated, with max blending.
    SingleFirst { depth: &'a T },
    /// Shades the layer at the previous depth and finds the next one.
    SinglePeel {
        previous: &'a T,
        depth: &'a T,
        color: &'a T,
    },
}

impl<T> ScenePass<'_, T> {
    pub fn name(&self) -> &'static str {
        match self {
            ScenePass::DepthComplexity { .. } => "depth_complexity",
            ScenePass::DepthBounds { .. } => "depth_bounds",
            ScenePass::FirstCount { .. } => "first_count",
            ScenePass::RefineCount { .. } => "refine_count",
            ScenePass::SliceCount { .. } => "slice_count",
            ScenePass::LayerFirst { .. } => "layer_first",
            ScenePass::LayerPeel { .. } => "layer_peel",
            ScenePass::SingleFirst { .. } => "single_first",
            ScenePass::SinglePeel { .. } => "single_peel",
        }
    }
}

/// Full-viewport passes.
#[derive(Debug, Clone)]
pub enum ScreenPass<'a, T> {
    /// Locates the first-pass bin of every quantile.
    FirstSearch {
        counts: &'a [T],
        total: &'a T,
        codes: &'a [T],
        lefts: &'a [T],
        quantiles: &'a [f32],
        alpha_aware: bool,
        opacity_threshold: f32,
    },
    /// Narrows every quantile interval by one refinement level.
    RefineSearch {
        counts: &'a [T],
        total: &'a T,
        codes_in: &'a [T],
        lefts_in: &'a [T],
        codes_out: &'a [T],
        lefts_out: &'a [T],
        quantiles: &'a [f32],
        levels: u32,
    },
    /// Turns interval codes into split point depths.
    Reproject {
        bounds: &'a T,
        total: &'a T,
        codes: &'a [T],
        lefts: &'a [T],
        counts: &'a [T],
        partition: &'a [T],
        quantiles: &'a [f32],
        levels: u32,
        alpha_aware: bool,
    },
    /// Front colors under, back colors over the per-slice accumulators.
    LayerBlend {
        colors: &'a [T],
        fronts: &'a [T],
        backs: &'a [T],
        slices: usize,
    },
    /// Composites the slices front to back over `output`.
    LayerComposite {
        fronts: &'a [T],
        backs: &'a [T],
        output: &'a T,
        slices: usize,
    },
    /// Blends a tile's peeled layer under the screen accumulator.
    TileBlend {
        color: &'a T,
        target: &'a T,
        origin: [u32; 2],
    },
    /// Composites a premultiplied accumulator over `output`.
    Resolve { source: &'a T, output: &'a T },
}

impl<T> ScreenPass<'_, T> {
    pub fn name(&self) -> &'static str {
        match self {
            ScreenPass::FirstSearch { .. } => "first_search",
            ScreenPass::RefineSearch { .. } => "refine_search",
            ScreenPass::Reproject { .. } => "reproject",
            ScreenPass::LayerBlend { .. } => "layer_blend",
            ScreenPass::LayerComposite { .. } => "layer_composite",
            ScreenPass::TileBlend { .. } => "tile_blend",
            ScreenPass::Resolve { .. } => "resolve",
        }
    }
}


/// Blend equation of one pass target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Blend {
    Replace,
    Add,
    Max,
    /// `(1 - dst.a, 1)`: the source lies behind the destination.
    Under,
    /// `(1, 1 - src.a)`: the source lies in front of the destination.
    Over,
    /// Additive color, alpha accumulated as opacity.
    AddOpacity,
}

impl Blend {
    pub fn apply(self, dst: Vec4, src: Vec4) -> Vec4 {
        match self {
            Blend::Replace => src,
            Blend::Add => dst + src,
            Blend::Max => dst.max(src),
            Blend::Under => kernels::blend_under(dst, src),
            Blend::Over => kernels::blend_over(dst, src),
            Blend::AddOpacity => (dst.truncate() + src.truncate())
                .extend(src.w + dst.w * (1.0 - src.w)),
        }
    }

    pub fn to_wgpu(self) -> Option<wgpu::BlendState> {
        use wgpu::{BlendComponent, BlendFactor, BlendOperation, BlendState};

        let component = |src_factor, dst_factor, operation| BlendComponent {
            src_factor,
            dst_factor,
            operation,
        };
        let add = component(BlendFactor::One, BlendFactor::One, BlendOperation::Add);
        match self {
            Blend::Replace => None,
            Blend::Add => Some(BlendState {
                color: add,
                alpha: add,
            }),
            Blend::Max => {
                let max = component(BlendFactor::One, BlendFactor::One, BlendOperation::Max);
                Some(BlendState {
                    color: max,
                    alpha: max,
                })
            }
            Blend::Under => {
                let under = component(
                    BlendFactor::OneMinusDstAlpha,
                    BlendFactor::One,
                    BlendOperation::Add,
                );
                Some(BlendState {
                    color: under,
                    alpha: under,
                })
            }
            Blend::Over => Some(BlendState::PREMULTIPLIED_ALPHA_BLENDING),
            Blend::AddOpacity => Some(BlendState {
                color: add,
                alpha: component(
                    BlendFactor::One,
                    BlendFactor::OneMinusSrcAlpha,
                    BlendOperation::Add,
                ),
            }),
        }
    }
}

impl<'a, T> ScenePass<'a, T> {
    /// Render targets of the pass in fragment output order.
    pub fn targets(&self) -> Vec<(&'a T, Blend)> {
        fn all<T>(textures: &[T], blend: Blend) -> impl Iterator<Item = (&T, Blend)> {
            textures.iter().map(move |t| (t, blend))
        }
        match *self {
            ScenePass::DepthComplexity { counts } => vec![(counts, Blend::Add)],
            ScenePass::DepthBounds { bounds } => vec![(bounds, Blend::Max)],
            ScenePass::FirstCount {
                counts,
                alpha_aware,
                ..
            } => {
                let blend = if alpha_aware {
                    Blend::AddOpacity
                } else {
                    Blend::Add
                };
                all(counts, blend).collect()
            }
            ScenePass::RefineCount { counts, points, .. } => {
                all(&counts[..points], Blend::Add).collect()
            }
            ScenePass::SliceCount { counts, .. } => all(counts, Blend::Add).collect(),
            ScenePass::LayerFirst { depths, .. } => all(depths, Blend::Max).collect(),
            ScenePass::LayerPeel { depths, colors, .. } => all(depths, Blend::Max)
                .chain(all(colors, Blend::Max))
                .collect(),
            ScenePass::SingleFirst { depth } => vec![(depth, Blend::Max)],
            ScenePass::SinglePeel { depth, color, .. } => {
                vec![(depth, Blend::Max), (color, Blend::Max)]
            }
        }
    }
}

impl<'a, T> ScreenPass<'a, T> {
    /// Render targets of the pass in fragment output order.
    pub fn targets(&self) -> Vec<(&'a T, Blend)> {
        fn all<T>(textures: &[T], blend: Blend) -> impl Iterator<Item = (&T, Blend)> {
            textures.iter().map(move |t| (t, blend))
        }
        match *self {
            ScreenPass::FirstSearch {
                total,
                codes,
                lefts,
                ..
            } => std::iter::once((total, Blend::Replace))
                .chain(all(codes, Blend::Replace))
                .chain(all(lefts, Blend::Replace))
                .collect(),
            ScreenPass::RefineSearch {
                codes_out,
                lefts_out,
                ..
            } => all(codes_out, Blend::Replace)
                .chain(all(lefts_out, Blend::Replace))
                .collect(),
            ScreenPass::Reproject { partition, .. } => all(partition, Blend::Replace).collect(),
            ScreenPass::LayerBlend { fronts, backs, .. } => all(fronts, Blend::Under)
                .chain(all(backs, Blend::Over))
                .collect(),
            ScreenPass::LayerComposite { output, .. } => vec![(output, Blend::Over)],
            ScreenPass::TileBlend { target, .. } => vec![(target, Blend::Under)],
            ScreenPass::Resolve { output, .. } => vec![(output, Blend::Over)],
        }
    }
}

/// WGSL snippets a state set contributes to engine programs.
///
/// The vertex snippet defines `shade_vertex`, the fragment snippet defines
/// `shade_fragment`, `fragment_alpha` and `fragment_depth`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderSet {
    pub vertex: Option<String>,
    pub fragment: Option<String>,
}

/// Occlusion query half of a backend.
pub trait QueryBackend {
    type Query: Copy + Eq + fmt::Debug;

    fn create_query(&mut self) -> Result<Self::Query, StrataError>;

    /// Gives a query back. Its pending result, if any, is discarded.
    fn release_query(&mut self, query: Self::Query);

    /// Starts counting samples of the following draws. A result still
    /// pending from an earlier use of `query` is discarded.
    fn begin_query(&mut self, query: Self::Query, any_samples: bool);

    fn end_query(&mut self);

    /// Whether the result of `query` can be read without stalling.
    fn query_available(&mut self, query: Self::Query) -> bool;

    /// Samples that passed during `query`, waiting for the GPU if needed.
    fn query_result(&mut self, query: Self::Query) -> Result<u64, StrataError>;
}

/// Operations the peeling engine needs from a GPU.
pub trait Backend: QueryBackend {
    type Texture: Clone + fmt::Debug;
    type Geometry;

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<Self::Texture, StrataError>;

    /// Frees a texture. The handle must not be used afterwards.
    fn release_texture(&mut self, texture: Self::Texture);

    fn texture_size(&self, texture: &Self::Texture) -> (u32, u32);

    fn texture_format(&self, texture: &Self::Texture) -> TextureFormat;

    /// Reads a whole texture back, row-major from the top left.
    fn read_texture(&mut self, texture: &Self::Texture) -> Result<Vec<[f32; 4]>, StrataError>;

    fn create_geometry(&mut self, vertices: &[SceneVertex]) -> Self::Geometry;

    /// Registers or replaces the extra shaders of a state set.
    fn set_extra_shaders(&mut self, state: StateSetId, shaders: &ShaderSet);

    /// Clears `targets` inside `viewport`.
    fn clear(&mut self, targets: &[Self::Texture], value: [f32; 4], viewport: Viewport);

    fn begin_scene(
        &mut self,
        pass: &ScenePass<'_, Self::Texture>,
        uniforms: &PassUniforms,
    ) -> Result<(), StrataError>;

    fn draw(&mut self, geometry: &Self::Geometry, state: StateSetId);

    /// Draws vertices that only live for the current pass.
    fn draw_vertices(&mut self, vertices: &[SceneVertex], state: StateSetId);

    fn end_scene(&mut self) -> Result<(), StrataError>;

    fn screen_pass(
        &mut self,
        pass: &ScreenPass<'_, Self::Texture>,
        uniforms: &PassUniforms,
    ) -> Result<(), StrataError>;
}
