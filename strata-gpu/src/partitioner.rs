//! Per-pixel depth quantiles from GPU histograms.
//!
//! The partitioner renders the scene into a coarse depth histogram, locates
//! the bin of every requested quantile, refines the located intervals a few
//! times and finally interpolates split depths inside them. Nothing is read
//! back to the CPU unless a diagnostic asks for it.

use tracing::{debug, info};

use crate::backend::{Backend, PassUniforms, ScenePass, ScreenPass, TextureDesc, TextureFormat};
use crate::canvas::FrameStats;
use crate::config::Parameters;
use crate::constants::{
    FIRST_PASS_COUNT_TEXTURES, HALF_FLOAT_CODE_ITERATIONS, MINMAX_CLEAR, NO_SPLIT,
};
use crate::error::StrataError;
use crate::render_bin::SceneRenderer;

/// Partitioning strategy, picked once per session.
pub enum Partitioner<T> {
    /// Single slice: every fragment belongs to slice 0.
    None,
    Iterative(IterativePartitioner<T>),
}

impl<T: Clone> Partitioner<T> {
    pub fn for_parameters(parameters: &Parameters) -> Self {
        if parameters.num_slices() > 1 {
            Partitioner::Iterative(IterativePartitioner::new())
        } else {
            Partitioner::None
        }
    }

    /// Split point textures of the last partition, empty for a single slice.
    pub fn partition(&self) -> &[T] {
        match self {
            Partitioner::None => &[],
            Partitioner::Iterative(partitioner) => &partitioner.partition,
        }
    }

    pub fn release<B>(&mut self, backend: &mut B)
    where
        B: Backend<Texture = T>,
    {
        if let Partitioner::Iterative(partitioner) = self {
            partitioner.release(backend);
        }
    }
}

/// Number of RGBA textures needed to hold `values` packed four per texel.
pub fn packed_textures(values: usize) -> usize {
    values.div_ceil(4)
}

pub struct IterativePartitioner<T> {
    size: (u32, u32),
    bounds: Option<T>,
    first_counts: Vec<T>,
    total: Option<T>,
    codes: [Vec<T>; 2],
    lefts: [Vec<T>; 2],
    refine_counts: Vec<T>,
    partition: Vec<T>,
    slice_counts: Vec<T>,
}

impl<T: Clone> Default for IterativePartitioner<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> IterativePartitioner<T> {
    pub fn new() -> Self {
        Self {
            size: (0, 0),
            bounds: None,
            first_counts: Vec::new(),
            total: None,
            codes: [Vec::new(), Vec::new()],
            lefts: [Vec::new(), Vec::new()],
            refine_counts: Vec::new(),
            partition: Vec::new(),
            slice_counts: Vec::new(),
        }
    }

    fn release<B>(&mut self, backend: &mut B)
    where
        B: Backend<Texture = T>,
    {
        let [codes_a, codes_b] = &mut self.codes;
        let [lefts_a, lefts_b] = &mut self.lefts;
        let textures = self
            .bounds
            .take()
            .into_iter()
            .chain(self.total.take())
            .chain(self.first_counts.drain(..))
            .chain(codes_a.drain(..))
            .chain(codes_b.drain(..))
            .chain(lefts_a.drain(..))
            .chain(lefts_b.drain(..))
            .chain(self.refine_counts.drain(..))
            .chain(self.partition.drain(..))
            .chain(self.slice_counts.drain(..));
        for texture in textures.collect::<Vec<_>>() {
            backend.release_texture(texture);
        }
        self.size = (0, 0);
    }

    /// Makes sure every texture covers `width` x `height`.
    fn allocate<B>(
        &mut self,
        backend: &mut B,
        parameters: &Parameters,
        width: u32,
        height: u32,
    ) -> Result<(), StrataError>
    where
        B: Backend<Texture = T>,
    {
        if self.bounds.is_some() && self.size.0 >= width && self.size.1 >= height {
            return Ok(());
        }
        self.release(backend);
        let (width, height) = (width.max(1), height.max(1));
        debug!("Allocating partition textures {}x{}", width, height);

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
        let points = parameters.split_point_quantiles.len();
        let code_format = if parameters.partition_iterations <= HALF_FLOAT_CODE_ITERATIONS {
            TextureFormat::Rgba16Float
        } else {
            TextureFormat::Rgba32Float
        };

        self.bounds = create("partition_bounds", TextureFormat::Rg32Float, 1)?.pop();
        self.total = create("partition_total", TextureFormat::Rg32Float, 1)?.pop();
        self.first_counts = create(
            "partition_first_counts",
            TextureFormat::Rgba16Float,
            FIRST_PASS_COUNT_TEXTURES,
        )?;
        for i in 0..2 {
            self.codes[i] = create("partition_codes", code_format, packed_textures(points))?;
            self.lefts[i] = create(
                "partition_lefts",
                TextureFormat::Rgba32Float,
                packed_textures(points),
            )?;
        }
        self.refine_counts = create("partition_refine_counts", TextureFormat::Rgba16Float, points)?;
        self.partition = create(
            "partition_points",
            TextureFormat::Rgba32Float,
            packed_textures(parameters.adjusted_num_points()),
        )?;
        self.slice_counts = create(
            "partition_slice_counts",
            TextureFormat::Rgba32Float,
            packed_textures(parameters.num_slices()),
        )?;
        self.size = (width, height);
        Ok(())
    }

    /// Computes the split points of the current frame into the partition
    /// textures.
    pub fn compute<B, R>(
        &mut self,
        backend: &mut B,
        renderer: &mut R,
        parameters: &Parameters,
        uniforms: &PassUniforms,
        stats: &mut FrameStats,
    ) -> Result<(), StrataError>
    where
        B: Backend<Texture = T>,
        R: SceneRenderer<B>,
    {
        let viewport = uniforms.viewport;
        self.allocate(
            backend,
            parameters,
            viewport.x + viewport.width,
            viewport.y + viewport.height,
        )?;
        let (Some(bounds), Some(total)) = (self.bounds.clone(), self.total.clone()) else {
            return Ok(());
        };
        let quantiles = parameters.split_point_quantiles.as_slice();
        let points = quantiles.len();
        let alpha_aware = parameters.alpha_aware_partition;

        backend.clear(std::slice::from_ref(&bounds), [MINMAX_CLEAR; 4], viewport);
        let bounds_pass = ScenePass::DepthBounds { bounds: &bounds };
        if parameters.accurate_min_max {
            renderer.render(backend, &bounds_pass, uniforms, None)?;
        } else {
            renderer.render_bounds(backend, &bounds_pass, uniforms)?;
        }
        stats.partition_passes += 1;

        backend.clear(&self.first_counts, [0.0; 4], viewport);
        let first_count = ScenePass::FirstCount {
            bounds: &bounds,
            counts: &self.first_counts,
            alpha_aware,
        };
        renderer.render(backend, &first_count, uniforms, None)?;
        stats.partition_passes += 1;

        backend.screen_pass(
            &ScreenPass::FirstSearch {
                counts: &self.first_counts,
                total: &total,
                codes: &self.codes[0],
                lefts: &self.lefts[0],
                quantiles,
                alpha_aware,
                opacity_threshold: parameters.opacity_threshold,
            },
            uniforms,
        )?;

        let mut current = 0;
        for level in 0..parameters.partition_iterations {
            let next = 1 - current;
            backend.clear(&self.refine_counts, [0.0; 4], viewport);
            let refine = ScenePass::RefineCount {
                bounds: &bounds,
                codes: &self.codes[current],
                counts: &self.refine_counts,
                points,
                levels: level,
                alpha_aware,
            };
            renderer.render(backend, &refine, uniforms, None)?;
            stats.partition_passes += 1;

            backend.screen_pass(
                &ScreenPass::RefineSearch {
                    counts: &self.refine_counts,
                    total: &total,
                    codes_in: &self.codes[current],
                    lefts_in: &self.lefts[current],
                    codes_out: &self.codes[next],
                    lefts_out: &self.lefts[next],
                    quantiles,
                    levels: level,
                },
                uniforms,
            )?;
            current = next;
        }

        let counts = if parameters.partition_iterations == 0 {
            &self.first_counts
        } else {
            &self.refine_counts
        };
        backend.screen_pass(
            &ScreenPass::Reproject {
                bounds: &bounds,
                total: &total,
                codes: &self.codes[current],
                lefts: &self.lefts[current],
                counts,
                partition: &self.partition,
                quantiles,
                levels: parameters.partition_iterations,
                alpha_aware,
            },
            uniforms,
        )?;
        debug!(
            "Partitioned {} points with {} refinements",
            parameters.adjusted_num_points(),
            parameters.partition_iterations
        );
        Ok(())
    }

    /// Fragments per slice summed over the viewport.
    pub fn profile<B, R>(
        &mut self,
        backend: &mut B,
        renderer: &mut R,
        parameters: &Parameters,
        uniforms: &PassUniforms,
        stats: &mut FrameStats,
    ) -> Result<Vec<f64>, StrataError>
    where
        B: Backend<Texture = T>,
        R: SceneRenderer<B>,
    {
        let slices = parameters.num_slices();
        backend.clear(&self.slice_counts, [0.0; 4], uniforms.viewport);
        let pass = ScenePass::SliceCount {
            partition: &self.partition,
            counts: &self.slice_counts,
            slices,
        };
        renderer.render(backend, &pass, uniforms, None)?;
        stats.partition_passes += 1;

        let mut sums = vec![0.0f64; slices];
        for (t, texture) in self.slice_counts.iter().enumerate() {
            for texel in backend.read_texture(texture)? {
                for (c, value) in texel.iter().enumerate() {
                    if let Some(sum) = sums.get_mut(4 * t + c) {
                        *sum += f64::from(*value);
                    }
                }
            }
        }
        let total: f64 = sums.iter().sum();
        for (slice, count) in sums.iter().enumerate() {
            let share = if total > 0.0 { count / total } else { 0.0 };
            info!(
                "Slice {}: {} fragments ({:.1}%)",
                slice,
                count,
                100.0 * share
            );
        }
        Ok(sums)
    }

    /// Split points at one pixel, `NO_SPLIT` entries included.
    pub fn points_at<B>(
        &self,
        backend: &mut B,
        parameters: &Parameters,
        x: u32,
        y: u32,
    ) -> Result<Vec<f32>, StrataError>
    where
        B: Backend<Texture = T>,
    {
        let mut points = Vec::with_capacity(parameters.adjusted_num_points());
        for texture in &self.partition {
            let (width, height) = backend.texture_size(texture);
            if x >= width || y >= height {
                return Ok(Vec::new());
            }
            let texels = backend.read_texture(texture)?;
            points.extend_from_slice(&texels[(y * width + x) as usize]);
        }
        points.truncate(parameters.adjusted_num_points());
        Ok(points)
    }
}

/// Whether a split point value marks an actual split.
pub fn is_split(point: f32) -> bool {
    point < NO_SPLIT
}
