//! CPU reference backend.
//!
//! Rasterizes the draw list at pixel centers and runs the engine's pass
//! programs through [`crate::kernels`]. Occlusion queries resolve as soon as
//! they end. Extra WGSL shaders are recorded but every draw uses the default
//! shading model.

use std::collections::HashMap;

use glam::{DVec2, Vec3, Vec4};
use tracing::debug;

use crate::backend::{
    Backend, Blend, PassUniforms, QueryBackend, ScenePass, ScreenPass, ShaderSet, TextureDesc,
    TextureFormat, Viewport,
};
use crate::constants::{DEPTH_CLEAR, NO_SPLIT};
use crate::draw_list::StateSetId;
use crate::error::StrataError;
use crate::handle::Handle;
use crate::kernels::{self, DepthSpace};
use crate::types::SceneVertex;

/// Texels of a software render target.
pub struct TexelBuffer {
    width: u32,
    height: u32,
    format: TextureFormat,
    texels: Vec<Vec4>,
}

pub type SoftwareTexture = Handle<TexelBuffer>;

/// Triangle list in eye space.
#[derive(Debug, Clone)]
pub struct SoftwareGeometry {
    vertices: Vec<SceneVertex>,
}

impl SoftwareGeometry {
    pub fn vertices(&self) -> &[SceneVertex] {
        &self.vertices
    }
}

/// Counters of the work a [`SoftwareBackend`] executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftwareStats {
    pub scene_passes: u64,
    pub screen_passes: u64,
    pub draws: u64,
    pub fragments: u64,
}

struct Fragment {
    x: u32,
    y: u32,
    /// Window depth in [0, 1].
    z: f32,
    /// Shaded straight alpha color.
    color: Vec4,
}

struct Texels<'a> {
    textures: &'a HashMap<u64, TexelBuffer>,
}

impl Texels<'_> {
    fn load(&self, texture: &SoftwareTexture, x: u32, y: u32) -> Vec4 {
        self.textures
            .get(&texture.id)
            .filter(|t| x < t.width && y < t.height)
            .map(|t| t.texels[(y * t.width + x) as usize])
            .unwrap_or(Vec4::ZERO)
    }

    /// Channel `index % 4` of texture `index / 4`.
    fn packed(&self, textures: &[SoftwareTexture], index: usize, x: u32, y: u32) -> f32 {
        self.load(&textures[index / 4], x, y)[index % 4]
    }

    fn points(&self, partition: &[SoftwareTexture], count: usize, x: u32, y: u32) -> Vec<f32> {
        (0..count).map(|i| self.packed(partition, i, x, y)).collect()
    }
}

type Shader = Box<dyn Fn(&Fragment, &Texels<'_>) -> Option<Vec<Vec4>>>;

fn program_fn(
    shader: impl Fn(&Fragment, &Texels<'_>) -> Option<Vec<Vec4>> + 'static,
) -> Shader {
    Box::new(shader)
}

/// A pass program: targets in output order and the per-fragment function.
struct Program {
    targets: Vec<(SoftwareTexture, Blend)>,
    shader: Shader,
}

struct ActiveQuery {
    index: usize,
    samples: u64,
    any_samples: bool,
}

/// Deterministic CPU implementation of [`Backend`].
#[derive(Default)]
pub struct SoftwareBackend {
    textures: HashMap<u64, TexelBuffer>,
    queries: Vec<Option<u64>>,
    free_queries: Vec<usize>,
    active_query: Option<ActiveQuery>,
    scene: Option<(Program, PassUniforms)>,
    extra_shaders: HashMap<StateSetId, ShaderSet>,
    stats: SoftwareStats,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> SoftwareStats {
        self.stats
    }

    pub fn extra_shaders(&self, state: StateSetId) -> Option<&ShaderSet> {
        self.extra_shaders.get(&state)
    }

    /// Number of live textures.
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// Number of queries created and not released.
    pub fn query_count(&self) -> usize {
        self.queries.len() - self.free_queries.len()
    }

    pub fn texel(&self, texture: &SoftwareTexture, x: u32, y: u32) -> Vec4 {
        Texels {
            textures: &self.textures,
        }
        .load(texture, x, y)
    }

    fn rasterize(&mut self, vertices: &[SceneVertex]) {
        let Self {
            textures,
            scene,
            active_query,
            stats,
            ..
        } = self;
        let Some((program, uniforms)) = scene.as_ref() else {
            debug!("Draw outside of a scene pass ignored");
            return;
        };
        let (width, height) = program
            .targets
            .first()
            .and_then(|(t, _)| textures.get(&t.id))
            .map(|t| (t.width, t.height))
            .unwrap_or((0, 0));
        let clip = uniforms.viewport.clipped(width, height);
        stats.draws += 1;

        let mut fragments = Vec::new();
        for triangle in vertices.chunks_exact(3) {
            rasterize_triangle(triangle, uniforms, clip, &mut fragments);
        }
        for fragment in fragments {
            let outputs = (program.shader)(&fragment, &Texels { textures });
            let Some(outputs) = outputs else {
                continue;
            };
            stats.fragments += 1;
            if let Some(query) = active_query.as_mut() {
                query.samples += 1;
            }
            write_outputs(textures, &program.targets, &outputs, fragment.x, fragment.y);
        }
    }
}

fn write_outputs(
    textures: &mut HashMap<u64, TexelBuffer>,
    targets: &[(SoftwareTexture, Blend)],
    outputs: &[Vec4],
    x: u32,
    y: u32,
) {
    for ((texture, blend), &value) in targets.iter().zip(outputs) {
        if let Some(buffer) = textures.get_mut(&texture.id) {
            if x < buffer.width && y < buffer.height {
                let texel = &mut buffer.texels[(y * buffer.width + x) as usize];
                *texel = blend.apply(*texel, value);
            }
        }
    }
}

/// Edge function with exact antisymmetry under swapping `a` and `b`, so
/// shared edges are owned by exactly one triangle.
fn edge(a: DVec2, b: DVec2, p: DVec2) -> f64 {
    let raw = |a: DVec2, b: DVec2| (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    if (a.x, a.y) <= (b.x, b.y) {
        raw(a, b)
    } else {
        -raw(b, a)
    }
}

fn owns_edge(a: DVec2, b: DVec2) -> bool {
    let d = b - a;
    d.y > 0.0 || (d.y == 0.0 && d.x < 0.0)
}

fn rasterize_triangle(
    triangle: &[SceneVertex],
    uniforms: &PassUniforms,
    clip: Viewport,
    fragments: &mut Vec<Fragment>,
) {
    let viewport = uniforms.viewport;
    let mut screen = [DVec2::ZERO; 3];
    let mut depth = [0.0f64; 3];
    let mut inv_w = [0.0f64; 3];
    for (i, vertex) in triangle.iter().enumerate() {
        let clip_pos = uniforms.projection * vertex.position().extend(1.0);
        if clip_pos.w <= 0.0 {
            return;
        }
        let ndc = clip_pos.truncate() / clip_pos.w;
        screen[i] = DVec2::new(
            viewport.x as f64 + (ndc.x as f64 * 0.5 + 0.5) * viewport.width as f64,
            viewport.y as f64 + (0.5 - ndc.y as f64 * 0.5) * viewport.height as f64,
        );
        depth[i] = ndc.z as f64;
        inv_w[i] = 1.0 / clip_pos.w as f64;
    }
    let mut order = [0usize, 1, 2];
    let mut area = edge(screen[0], screen[1], screen[2]);
    if area == 0.0 {
        return;
    }
    if area < 0.0 {
        order = [0, 2, 1];
        area = -area;
    }
    let [i0, i1, i2] = order;
    let (p0, p1, p2) = (screen[i0], screen[i1], screen[i2]);

    let min = p0.min(p1).min(p2);
    let max = p0.max(p1).max(p2);
    let x_start = (min.x.floor().max(clip.x as f64)) as u32;
    let y_start = (min.y.floor().max(clip.y as f64)) as u32;
    let x_end = (max.x.ceil().min((clip.x + clip.width) as f64)).max(0.0) as u32;
    let y_end = (max.y.ceil().min((clip.y + clip.height) as f64)).max(0.0) as u32;

    let inside = |w: f64, a: DVec2, b: DVec2| w > 0.0 || (w == 0.0 && owns_edge(a, b));
    for y in y_start..y_end {
        for x in x_start..x_end {
            let p = DVec2::new(x as f64 + 0.5, y as f64 + 0.5);
            let w0 = edge(p1, p2, p);
            let w1 = edge(p2, p0, p);
            let w2 = edge(p0, p1, p);
            if !(inside(w0, p1, p2) && inside(w1, p2, p0) && inside(w2, p0, p1)) {
                continue;
            }
            let l = [w0 / area, w1 / area, w2 / area];
            let z = l[0] * depth[i0] + l[1] * depth[i1] + l[2] * depth[i2];
            if !(0.0..=1.0).contains(&z) {
                continue;
            }
            let weights = [l[0] * inv_w[i0], l[1] * inv_w[i1], l[2] * inv_w[i2]];
            let norm = weights.iter().sum::<f64>();
            let mut normal = Vec3::ZERO;
            let mut color = Vec4::ZERO;
            for (k, &i) in order.iter().enumerate() {
                let weight = (weights[k] / norm) as f32;
                normal += triangle[i].normal() * weight;
                color += triangle[i].color() * weight;
            }
            fragments.push(Fragment {
                x,
                y,
                z: z as f32,
                color: kernels::shade_lambert(normal, color),
            });
        }
    }
}

fn one_hot(channel: usize) -> Vec4 {
    let mut v = Vec4::ZERO;
    v[channel] = 1.0;
    v
}

fn set_packed(outputs: &mut [Vec4], index: usize, value: f32) {
    outputs[index / 4][index % 4] = value;
}

fn owned(textures: &[SoftwareTexture]) -> Vec<SoftwareTexture> {
    textures.to_vec()
}

fn scene_program(pass: &ScenePass<'_, SoftwareTexture>, depth: DepthSpace) -> Program {
    let targets = pass
        .targets()
        .into_iter()
        .map(|(t, blend)| (*t, blend))
        .collect();
    let shader: Shader = match *pass {
        ScenePass::DepthComplexity { .. } => program_fn(|_, _| Some(vec![Vec4::X])),
        ScenePass::DepthBounds { .. } => program_fn(move |f, _| {
            let linear = depth.linearize(f.z);
            Some(vec![Vec4::new(-linear, linear, 0.0, 0.0)])
        }),
        ScenePass::FirstCount {
            bounds,
            counts,
            alpha_aware,
        } => {
            let bounds = *bounds;
            let count_targets = counts.len();
            let bins = kernels::first_pass_bins(alpha_aware);
            program_fn(move |f, t| {
                let b = t.load(&bounds, f.x, f.y);
                let u = kernels::normalized_depth(depth.linearize(f.z), -b.x, b.y);
                let bin = kernels::cell_code(u, bins, 0) as usize;
                let mut out = vec![Vec4::ZERO; count_targets];
                if alpha_aware {
                    out[bin / 3] = one_hot(bin % 3);
                    out[bin / 3].w = f.color.w;
                } else {
                    out[bin / 4] = one_hot(bin % 4);
                }
                Some(out)
            })
        }
        ScenePass::RefineCount {
            bounds,
            codes,
            points,
            levels,
            alpha_aware,
            ..
        } => {
            let bounds = *bounds;
            let codes = owned(codes);
            let bins = kernels::first_pass_bins(alpha_aware);
            program_fn(move |f, t| {
                let b = t.load(&bounds, f.x, f.y);
                let u = kernels::normalized_depth(depth.linearize(f.z), -b.x, b.y);
                let cell = kernels::cell_code(u, bins, levels + 1);
                let mut out = vec![Vec4::ZERO; points];
                for (p, slot) in out.iter_mut().enumerate() {
                    let code = t.packed(&codes, p, f.x, f.y).round() as u32;
                    if cell & kernels::code_mask(levels) == code {
                        *slot = one_hot(kernels::code_sub_bin(cell, levels) as usize);
                    }
                }
                Some(out)
            })
        }
        ScenePass::SliceCount {
            partition,
            counts,
            slices,
        } => {
            let partition = owned(partition);
            let count_targets = counts.len();
            program_fn(move |f, t| {
                let points = t.points(&partition, slices - 1, f.x, f.y);
                let slice = kernels::slice_of(depth.peel_depth(f.z), &points);
                let mut out = vec![Vec4::ZERO; count_targets];
                set_packed(&mut out, slice, 1.0);
                Some(out)
            })
        }
        ScenePass::LayerFirst {
            partition,
            depths,
            slices,
        } => {
            let partition = owned(partition);
            let depth_targets = depths.len();
            program_fn(move |f, t| {
                let z = depth.peel_depth(f.z);
                let points = t.points(&partition, slices - 1, f.x, f.y);
                let slice = kernels::slice_of(z, &points);
                let mut out = vec![Vec4::splat(DEPTH_CLEAR); depth_targets];
                set_packed(&mut out, 2 * slice, -z);
                set_packed(&mut out, 2 * slice + 1, z);
                Some(out)
            })
        }
        ScenePass::LayerPeel {
            partition,
            previous,
            accumulated,
            depths,
            colors,
            slices,
            points,
            opacity_threshold,
            alpha_aware,
        } => {
            let partition = owned(partition);
            let previous = owned(previous);
            let accumulated = owned(accumulated);
            let depth_targets = depths.len();
            let outputs = depths.len() + colors.len();
            program_fn(move |f, t| {
                let z = depth.peel_depth(f.z);
                let split = t.points(&partition, points, f.x, f.y);
                let slice = kernels::slice_of(z, &split[..slices - 1]);
                let front = -t.packed(&previous, 2 * slice, f.x, f.y);
                let back = t.packed(&previous, 2 * slice + 1, f.x, f.y);
                if z < front || z > back {
                    return None;
                }
                if t.load(&accumulated[slice], f.x, f.y).w >= opacity_threshold {
                    return None;
                }
                if alpha_aware && z >= split[points - 1] {
                    return None;
                }
                let mut out = vec![Vec4::splat(DEPTH_CLEAR); outputs];
                if z == front {
                    set_packed(&mut out[depth_targets..], 2 * slice, kernels::pack_color(f.color));
                } else if z == back {
                    set_packed(
                        &mut out[depth_targets..],
                        2 * slice + 1,
                        kernels::pack_color(f.color),
                    );
                } else {
                    set_packed(&mut out, 2 * slice, -z);
                    set_packed(&mut out, 2 * slice + 1, z);
                }
                Some(out)
            })
        }
        ScenePass::SingleFirst { .. } => program_fn(move |f, _| {
            Some(vec![Vec4::new(-depth.peel_depth(f.z), 0.0, 0.0, 0.0)])
        }),
        ScenePass::SinglePeel { previous, .. } => {
            let previous = *previous;
            program_fn(move |f, t| {
                let z = depth.peel_depth(f.z);
                let layer = -t.load(&previous, f.x, f.y).x;
                if z < layer {
                    None
                } else if z == layer {
                    Some(vec![
                        Vec4::splat(DEPTH_CLEAR),
                        Vec4::new(kernels::pack_color(f.color), 0.0, 0.0, 0.0),
                    ])
                } else {
                    Some(vec![Vec4::new(-z, 0.0, 0.0, 0.0), Vec4::splat(DEPTH_CLEAR)])
                }
            })
        }
    };
    Program { targets, shader }
}

fn first_bin_count(
    t: &Texels<'_>,
    counts: &[SoftwareTexture],
    bin: usize,
    alpha_aware: bool,
    x: u32,
    y: u32,
) -> f32 {
    if alpha_aware {
        t.load(&counts[bin / 3], x, y)[bin % 3]
    } else {
        t.packed(counts, bin, x, y)
    }
}

fn screen_program(pass: &ScreenPass<'_, SoftwareTexture>, depth: DepthSpace) -> Program {
    let targets = pass
        .targets()
        .into_iter()
        .map(|(t, blend)| (*t, blend))
        .collect();
    let shader: Shader = match *pass {
        ScreenPass::FirstSearch {
            counts,
            codes,
            lefts,
            quantiles,
            alpha_aware,
            opacity_threshold,
            ..
        } => {
            let counts = owned(counts);
            let quantiles = quantiles.to_vec();
            let (code_targets, left_targets) = (codes.len(), lefts.len());
            program_fn(move |f, t| {
                let texels: Vec<Vec4> = counts.iter().map(|c| t.load(c, f.x, f.y)).collect();
                let (bins, total, saturation) = if alpha_aware {
                    let groups: Vec<([f32; 3], f32)> =
                        texels.iter().map(|c| ([c.x, c.y, c.z], c.w)).collect();
                    let saturation = kernels::find_saturation(&groups, opacity_threshold);
                    let bins: Vec<f32> = texels.iter().flat_map(|c| [c.x, c.y, c.z]).collect();
                    (bins, saturation.effective_total, saturation.bin_end)
                } else {
                    let bins: Vec<f32> = texels.iter().flat_map(|c| c.to_array()).collect();
                    let total = bins.iter().sum();
                    (bins, total, NO_SPLIT)
                };
                let mut coded = vec![Vec4::ZERO; code_targets];
                let mut left = vec![Vec4::ZERO; left_targets];
                for (p, q) in quantiles.iter().enumerate() {
                    let (bin, count) = kernels::search_bins(&bins, q * total);
                    set_packed(&mut coded, p, bin as f32);
                    set_packed(&mut left, p, count);
                }
                let mut out = vec![Vec4::new(total, saturation, 0.0, 0.0)];
                out.extend(coded);
                out.extend(left);
                Some(out)
            })
        }
        ScreenPass::RefineSearch {
            counts,
            total,
            codes_in,
            lefts_in,
            codes_out,
            lefts_out,
            quantiles,
            levels,
        } => {
            let counts = owned(counts);
            let total = *total;
            let codes_in = owned(codes_in);
            let lefts_in = owned(lefts_in);
            let quantiles = quantiles.to_vec();
            let (code_targets, left_targets) = (codes_out.len(), lefts_out.len());
            program_fn(move |f, t| {
                let total = t.load(&total, f.x, f.y).x;
                let mut coded = vec![Vec4::ZERO; code_targets];
                let mut left = vec![Vec4::ZERO; left_targets];
                for (p, q) in quantiles.iter().enumerate() {
                    let code = t.packed(&codes_in, p, f.x, f.y).round() as u32;
                    let before = t.packed(&lefts_in, p, f.x, f.y);
                    let sub_bins = t.load(&counts[p], f.x, f.y).to_array();
                    let (sub, count) = kernels::search_bins(&sub_bins, q * total - before);
                    set_packed(&mut coded, p, kernels::refine_code(code, sub, levels) as f32);
                    set_packed(&mut left, p, before + count);
                }
                let mut out = coded;
                out.extend(left);
                Some(out)
            })
        }
        ScreenPass::Reproject {
            bounds,
            total,
            codes,
            lefts,
            counts,
            partition,
            quantiles,
            levels,
            alpha_aware,
        } => {
            let (bounds, total) = (*bounds, *total);
            let codes = owned(codes);
            let lefts = owned(lefts);
            let counts = owned(counts);
            let quantiles = quantiles.to_vec();
            let partition_targets = partition.len();
            let bins = kernels::first_pass_bins(alpha_aware);
            program_fn(move |f, t| {
                let mut out = vec![Vec4::splat(NO_SPLIT); partition_targets];
                let b = t.load(&bounds, f.x, f.y);
                let (min, max) = (-b.x, b.y);
                if max < min {
                    return Some(out);
                }
                let totals = t.load(&total, f.x, f.y);
                for (p, q) in quantiles.iter().enumerate() {
                    let code = t.packed(&codes, p, f.x, f.y).round() as u32;
                    let remaining = q * totals.x - t.packed(&lefts, p, f.x, f.y);
                    let count = if levels == 0 {
                        let bin = (code & kernels::code_mask(0)) as usize;
                        first_bin_count(t, &counts, bin, alpha_aware, f.x, f.y)
                    } else {
                        let sub = kernels::code_sub_bin(code, levels - 1) as usize;
                        t.load(&counts[p], f.x, f.y)[sub]
                    };
                    let interval = kernels::decode_interval(code, bins, levels);
                    let linear = kernels::interpolate_split(min, max, interval, remaining, count);
                    set_packed(&mut out, p, depth.peel_depth_from_linear(linear));
                }
                if alpha_aware && totals.y < NO_SPLIT {
                    let linear = min + totals.y / bins as f32 * (max - min);
                    set_packed(&mut out, quantiles.len(), depth.peel_depth_from_linear(linear));
                }
                Some(out)
            })
        }
        ScreenPass::LayerBlend { colors, slices, .. } => {
            let colors = owned(colors);
            program_fn(move |f, t| {
                let layer = |slot: usize| {
                    kernels::premultiply(kernels::unpack_color(t.packed(&colors, slot, f.x, f.y)))
                };
                let fronts = (0..slices).map(|s| layer(2 * s));
                let backs = (0..slices).map(|s| layer(2 * s + 1));
                Some(fronts.chain(backs).collect())
            })
        }
        ScreenPass::LayerComposite {
            fronts,
            backs,
            slices,
            ..
        } => {
            let fronts = owned(fronts);
            let backs = owned(backs);
            program_fn(move |f, t| {
                let composite = (0..slices).fold(Vec4::ZERO, |acc, s| {
                    let front = t.load(&fronts[s], f.x, f.y);
                    let back = t.load(&backs[s], f.x, f.y);
                    kernels::blend_under(acc, kernels::blend_over(back, front))
                });
                Some(vec![composite])
            })
        }
        ScreenPass::TileBlend { color, origin, .. } => {
            let color = *color;
            program_fn(move |f, t| {
                let x = f.x.wrapping_sub(origin[0]);
                let packed = t.load(&color, x, f.y.wrapping_sub(origin[1])).x;
                Some(vec![kernels::premultiply(kernels::unpack_color(packed))])
            })
        }
        ScreenPass::Resolve { source, .. } => {
            let source = *source;
            program_fn(move |f, t| Some(vec![t.load(&source, f.x, f.y)]))
        }
    };
    Program { targets, shader }
}

impl QueryBackend for SoftwareBackend {
    type Query = usize;

    fn create_query(&mut self) -> Result<usize, StrataError> {
        if let Some(query) = self.free_queries.pop() {
            return Ok(query);
        }
        self.queries.push(None);
        Ok(self.queries.len() - 1)
    }

    fn release_query(&mut self, query: usize) {
        if let Some(slot) = self.queries.get_mut(query) {
            *slot = None;
            if !self.free_queries.contains(&query) {
                self.free_queries.push(query);
            }
        }
    }

    fn begin_query(&mut self, query: usize, any_samples: bool) {
        if let Some(slot) = self.queries.get_mut(query) {
            *slot = None;
        }
        self.active_query = Some(ActiveQuery {
            index: query,
            samples: 0,
            any_samples,
        });
    }

    fn end_query(&mut self) {
        if let Some(query) = self.active_query.take() {
            let samples = if query.any_samples {
                u64::from(query.samples > 0)
            } else {
                query.samples
            };
            if let Some(slot) = self.queries.get_mut(query.index) {
                *slot = Some(samples);
            }
        }
    }

    fn query_available(&mut self, query: usize) -> bool {
        matches!(self.queries.get(query), Some(Some(_)))
    }

    fn query_result(&mut self, query: usize) -> Result<u64, StrataError> {
        Ok(self.queries.get(query).copied().flatten().unwrap_or(0))
    }
}

impl Backend for SoftwareBackend {
    type Texture = SoftwareTexture;
    type Geometry = SoftwareGeometry;

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<SoftwareTexture, StrataError> {
        let handle = SoftwareTexture::next();
        debug!(
            "Creating {} {}x{} {:?}",
            desc.label, desc.width, desc.height, desc.format
        );
        self.textures.insert(
            handle.id,
            TexelBuffer {
                width: desc.width,
                height: desc.height,
                format: desc.format,
                texels: vec![Vec4::ZERO; (desc.width * desc.height) as usize],
            },
        );
        Ok(handle)
    }

    fn release_texture(&mut self, texture: SoftwareTexture) {
        self.textures.remove(&texture.id);
    }

    fn texture_size(&self, texture: &SoftwareTexture) -> (u32, u32) {
        self.textures
            .get(&texture.id)
            .map(|t| (t.width, t.height))
            .unwrap_or((0, 0))
    }

    fn texture_format(&self, texture: &SoftwareTexture) -> TextureFormat {
        self.textures
            .get(&texture.id)
            .map(|t| t.format)
            .unwrap_or(TextureFormat::Rgba32Float)
    }

    fn read_texture(&mut self, texture: &SoftwareTexture) -> Result<Vec<[f32; 4]>, StrataError> {
        let buffer = self
            .textures
            .get(&texture.id)
            .ok_or(StrataError::UnknownTexture(texture.id))?;
        Ok(buffer.texels.iter().map(|t| t.to_array()).collect())
    }

    fn create_geometry(&mut self, vertices: &[SceneVertex]) -> SoftwareGeometry {
        SoftwareGeometry {
            vertices: vertices.to_vec(),
        }
    }

    fn set_extra_shaders(&mut self, state: StateSetId, shaders: &ShaderSet) {
        if self.extra_shaders.get(&state) != Some(shaders) {
            debug!(
                "State {:?} extra shaders recorded, software passes use default shading",
                state
            );
            self.extra_shaders.insert(state, shaders.clone());
        }
    }

    fn clear(&mut self, targets: &[SoftwareTexture], value: [f32; 4], viewport: Viewport) {
        let value = Vec4::from_array(value);
        for target in targets {
            if let Some(buffer) = self.textures.get_mut(&target.id) {
                let area = viewport.clipped(buffer.width, buffer.height);
                for y in area.y..area.y + area.height {
                    let row = (y * buffer.width) as usize;
                    buffer.texels[row + area.x as usize..row + (area.x + area.width) as usize]
                        .fill(value);
                }
            }
        }
    }

    fn begin_scene(
        &mut self,
        pass: &ScenePass<'_, SoftwareTexture>,
        uniforms: &PassUniforms,
    ) -> Result<(), StrataError> {
        self.stats.scene_passes += 1;
        self.scene = Some((scene_program(pass, uniforms.depth), *uniforms));
        Ok(())
    }

    fn draw(&mut self, geometry: &SoftwareGeometry, _state: StateSetId) {
        self.rasterize(&geometry.vertices);
    }

    fn draw_vertices(&mut self, vertices: &[SceneVertex], _state: StateSetId) {
        self.rasterize(vertices);
    }

    fn end_scene(&mut self) -> Result<(), StrataError> {
        self.end_query();
        self.scene = None;
        Ok(())
    }

    fn screen_pass(
        &mut self,
        pass: &ScreenPass<'_, SoftwareTexture>,
        uniforms: &PassUniforms,
    ) -> Result<(), StrataError> {
        self.stats.screen_passes += 1;
        let program = screen_program(pass, uniforms.depth);
        let Some((first, _)) = program.targets.first() else {
            return Ok(());
        };
        let (width, height) = self.texture_size(first);
        let area = uniforms.viewport.clipped(width, height);
        for y in area.y..area.y + area.height {
            for x in area.x..area.x + area.width {
                let fragment = Fragment {
                    x,
                    y,
                    z: 0.0,
                    color: Vec4::ZERO,
                };
                let outputs = (program.shader)(
                    &fragment,
                    &Texels {
                        textures: &self.textures,
                    },
                );
                if let Some(outputs) = outputs {
                    write_outputs(&mut self.textures, &program.targets, &outputs, x, y);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::quad;
    use glam::Mat4;

    fn uniforms(width: u32, height: u32) -> PassUniforms {
        let projection = Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, 0.5, 10.5);
        PassUniforms {
            projection,
            depth: DepthSpace::from_projection(&projection, false),
            viewport: Viewport::sized(width, height),
        }
    }

    fn target(backend: &mut SoftwareBackend, format: TextureFormat) -> SoftwareTexture {
        backend
            .create_texture(&TextureDesc::new("test", 4, 4, format))
            .unwrap()
    }

    #[test]
    fn test_full_screen_quad_covers_each_pixel_once() {
        let mut backend = SoftwareBackend::new();
        let counts = target(&mut backend, TextureFormat::R32Float);
        let geometry = backend.create_geometry(&quad([-1.0, -1.0], [1.0, 1.0], 2.0, Vec4::ONE));
        let query = backend.create_query().unwrap();

        backend
            .begin_scene(&ScenePass::DepthComplexity { counts: &counts }, &uniforms(4, 4))
            .unwrap();
        backend.begin_query(query, false);
        backend.draw(&geometry, StateSetId(0));
        backend.end_query();
        backend.end_scene().unwrap();

        let texels = backend.read_texture(&counts).unwrap();
        assert!(texels.iter().all(|t| t[0] == 1.0));
        assert!(backend.query_available(query));
        assert_eq!(backend.query_result(query).unwrap(), 16);
    }

    #[test]
    fn test_any_samples_query_reports_boolean() {
        let mut backend = SoftwareBackend::new();
        let counts = target(&mut backend, TextureFormat::R32Float);
        let geometry = backend.create_geometry(&quad([-1.0, -1.0], [1.0, 1.0], 2.0, Vec4::ONE));
        let query = backend.create_query().unwrap();
        backend
            .begin_scene(&ScenePass::DepthComplexity { counts: &counts }, &uniforms(4, 4))
            .unwrap();
        backend.begin_query(query, true);
        backend.draw(&geometry, StateSetId(0));
        backend.end_scene().unwrap();
        assert_eq!(backend.query_result(query).unwrap(), 1);
    }

    #[test]
    fn test_released_query_is_reused() {
        let mut backend = SoftwareBackend::new();
        let first = backend.create_query().unwrap();
        let second = backend.create_query().unwrap();
        backend.release_query(first);
        assert_eq!(backend.query_count(), 1);
        assert!(!backend.query_available(first));
        assert_eq!(backend.create_query().unwrap(), first);
        assert_ne!(first, second);
        assert_eq!(backend.query_count(), 2);
    }

    #[test]
    fn test_viewport_limits_rasterization() {
        let mut backend = SoftwareBackend::new();
        let counts = target(&mut backend, TextureFormat::R32Float);
        let geometry = backend.create_geometry(&quad([-1.0, -1.0], [1.0, 1.0], 2.0, Vec4::ONE));
        backend
            .begin_scene(&ScenePass::DepthComplexity { counts: &counts }, &uniforms(2, 2))
            .unwrap();
        backend.draw(&geometry, StateSetId(0));
        backend.end_scene().unwrap();
        let covered = backend
            .read_texture(&counts)
            .unwrap()
            .iter()
            .filter(|t| t[0] == 1.0)
            .count();
        assert_eq!(covered, 4);
        assert_eq!(backend.texel(&counts, 1, 1).x, 1.0);
        assert_eq!(backend.texel(&counts, 2, 2).x, 0.0);
    }

    #[test]
    fn test_depth_bounds_keep_nearest_and_farthest() {
        let mut backend = SoftwareBackend::new();
        let bounds = target(&mut backend, TextureFormat::Rg32Float);
        backend.clear(&[bounds], [-1e9; 4], Viewport::sized(4, 4));
        let near = backend.create_geometry(&quad([-1.0, -1.0], [1.0, 1.0], 2.0, Vec4::ONE));
        let far = backend.create_geometry(&quad([-1.0, -1.0], [1.0, 1.0], 6.0, Vec4::ONE));
        backend
            .begin_scene(&ScenePass::DepthBounds { bounds: &bounds }, &uniforms(4, 4))
            .unwrap();
        backend.draw(&far, StateSetId(0));
        backend.draw(&near, StateSetId(0));
        backend.end_scene().unwrap();
        let b = backend.texel(&bounds, 3, 0);
        assert!((-b.x - 2.0).abs() < 1e-4);
        assert!((b.y - 6.0).abs() < 1e-4);
    }

    #[test]
    fn test_clear_respects_viewport() {
        let mut backend = SoftwareBackend::new();
        let texture = target(&mut backend, TextureFormat::Rgba16Float);
        backend.clear(&[texture], [1.0; 4], Viewport::new(2, 2, 8, 8));
        assert_eq!(backend.texel(&texture, 1, 1), Vec4::ZERO);
        assert_eq!(backend.texel(&texture, 3, 3), Vec4::ONE);
    }
}
