//! Per-pixel arithmetic shared by every pass.
//!
//! The CPU backend runs these functions directly and the WGSL prelude mirrors
//! them line for line, so both backends agree on bin boundaries, interval
//! codes and packed colors.

use glam::{Mat4, Vec4};

use crate::constants::{
    ALPHA_AWARE_FIRST_PASS_BINS, FIRST_BIN_CODE_BITS, FIRST_PASS_BINS, NO_SPLIT,
    PACKED_ALPHA_LEVELS, REFINEMENT_SUB_BINS,
};

/// Maps window depth to the depth used by peeling and partitioning.
///
/// Histograms are always built over linear eye depth. Peeling compares
/// window depth unless `unproject` is set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthSpace {
    /// Third row, third column of the projection matrix.
    pub proj33: f32,
    /// Third row, fourth column of the projection matrix.
    pub proj34: f32,
    pub orthographic: bool,
    pub unproject: bool,
}

impl DepthSpace {
    pub fn from_projection(projection: &Mat4, unproject: bool) -> Self {
        Self {
            proj33: projection.z_axis.z,
            proj34: projection.w_axis.z,
            orthographic: projection.w_axis.w == 1.0,
            unproject,
        }
    }

    /// Linear eye depth of a window depth.
    pub fn linearize(&self, window_z: f32) -> f32 {
        if self.orthographic {
            (self.proj34 - window_z) / self.proj33
        } else {
            self.proj34 / (window_z + self.proj33)
        }
    }

    /// Window depth of a linear eye depth.
    pub fn project(&self, linear: f32) -> f32 {
        if self.orthographic {
            self.proj34 - linear * self.proj33
        } else {
            self.proj34 / linear - self.proj33
        }
    }

    /// Depth compared by peeling passes.
    pub fn peel_depth(&self, window_z: f32) -> f32 {
        if self.unproject {
            self.linearize(window_z)
        } else {
            window_z
        }
    }

    /// Peeling depth of a linear depth found by the partitioner.
    pub fn peel_depth_from_linear(&self, linear: f32) -> f32 {
        if self.unproject {
            linear
        } else {
            self.project(linear)
        }
    }
}

/// First pass bins for a partition.
pub fn first_pass_bins(alpha_aware: bool) -> u32 {
    if alpha_aware {
        ALPHA_AWARE_FIRST_PASS_BINS
    } else {
        FIRST_PASS_BINS
    }
}

/// Position of `linear` inside `[min, max]`, in [0, 1].
pub fn normalized_depth(linear: f32, min: f32, max: f32) -> f32 {
    if max > min {
        ((linear - min) / (max - min)).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Bit offset of the sub-bin chosen at refinement `level`.
pub fn level_shift(level: u32) -> u32 {
    FIRST_BIN_CODE_BITS + 2 * level
}

/// Appends the sub-bin chosen at refinement `level` to `code`.
pub fn refine_code(code: u32, sub: u32, level: u32) -> u32 {
    code | (sub << level_shift(level))
}

/// Mask selecting the bits of a code refined `levels` times.
pub fn code_mask(levels: u32) -> u32 {
    (1u32 << level_shift(levels)) - 1
}

/// Code of the histogram cell holding normalized depth `t` after `levels`
/// refinements.
pub fn cell_code(t: f32, bins: u32, levels: u32) -> u32 {
    let scaled = t * bins as f32;
    let bin = (scaled.floor().max(0.0) as u32).min(bins - 1);
    let mut code = bin;
    let mut u = (scaled - bin as f32).clamp(0.0, 1.0);
    for level in 0..levels {
        let sub = ((u * REFINEMENT_SUB_BINS as f32).floor() as u32).min(REFINEMENT_SUB_BINS - 1);
        code |= sub << level_shift(level);
        u = (u * REFINEMENT_SUB_BINS as f32 - sub as f32).clamp(0.0, 1.0);
    }
    code
}

/// Sub-bin chosen at refinement `level` of `code`.
pub fn code_sub_bin(code: u32, level: u32) -> u32 {
    (code >> level_shift(level)) & (REFINEMENT_SUB_BINS - 1)
}

/// Normalized `(start, width)` of the interval a code refined `levels` times
/// denotes.
pub fn decode_interval(code: u32, bins: u32, levels: u32) -> (f32, f32) {
    let mut width = 1.0 / bins as f32;
    let mut start = (code & code_mask(0)) as f32 * width;
    for level in 0..levels {
        width /= REFINEMENT_SUB_BINS as f32;
        start += code_sub_bin(code, level) as f32 * width;
    }
    (start, width)
}

/// First bin whose cumulative count reaches `rank`, with the count to its
/// left. Falls back to the last bin.
pub fn search_bins(counts: &[f32], rank: f32) -> (u32, f32) {
    let mut left = 0.0;
    for (i, &count) in counts.iter().enumerate() {
        if left + count >= rank {
            return (i as u32, left);
        }
        if i + 1 == counts.len() {
            return (i as u32, left);
        }
        left += count;
    }
    (0, 0.0)
}

/// Linear depth of a quantile inside its final interval.
pub fn interpolate_split(
    min: f32,
    max: f32,
    interval: (f32, f32),
    remaining: f32,
    count: f32,
) -> f32 {
    let fraction = if count > 0.0 {
        (remaining / count).clamp(0.0, 1.0)
    } else {
        0.5
    };
    let t = interval.0 + interval.1 * fraction;
    min + t * (max - min)
}

/// Result of scanning alpha-aware histogram groups for opacity saturation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Saturation {
    /// Fragments up to and including the saturating group.
    pub effective_total: f32,
    /// Bin boundary past which fragments are hidden, or `NO_SPLIT`.
    pub bin_end: f32,
}

/// Scans per-group counts and opacities front to back.
///
/// `groups[g]` holds the bin counts of group `g` and its accumulated opacity.
pub fn find_saturation(groups: &[([f32; 3], f32)], threshold: f32) -> Saturation {
    let mut transparency = 1.0;
    let mut total = 0.0;
    for (g, (counts, opacity)) in groups.iter().enumerate() {
        total += counts.iter().sum::<f32>();
        transparency *= 1.0 - opacity;
        if 1.0 - transparency >= threshold {
            let bin_end = if g + 1 < groups.len() {
                (3 * (g + 1)) as f32
            } else {
                NO_SPLIT
            };
            return Saturation {
                effective_total: total,
                bin_end,
            };
        }
    }
    Saturation {
        effective_total: total,
        bin_end: NO_SPLIT,
    }
}

/// Slice of a fragment: the number of split points at or below its depth.
pub fn slice_of(depth: f32, points: &[f32]) -> usize {
    points.iter().filter(|&&p| p <= depth).count()
}

/// Packs a straight alpha color into a positive float whose ordering follows
/// alpha first.
pub fn pack_color(color: Vec4) -> f32 {
    let c = color.clamp(Vec4::ZERO, Vec4::ONE);
    let alpha = 1 + (c.w * PACKED_ALPHA_LEVELS).round() as u32;
    let r = (c.x * 255.0).round() as u32;
    let g = (c.y * 255.0).round() as u32;
    let b = (c.z * 255.0).round() as u32;
    f32::from_bits((alpha << 24) | (r << 16) | (g << 8) | b)
}

/// Inverse of [`pack_color`]. Non-positive values are transparent black.
pub fn unpack_color(packed: f32) -> Vec4 {
    if !(packed > 0.0) || !packed.is_finite() {
        return Vec4::ZERO;
    }
    let bits = packed.to_bits();
    Vec4::new(
        ((bits >> 16) & 0xff) as f32 / 255.0,
        ((bits >> 8) & 0xff) as f32 / 255.0,
        (bits & 0xff) as f32 / 255.0,
        (bits >> 24).saturating_sub(1) as f32 / PACKED_ALPHA_LEVELS,
    )
}

pub fn premultiply(color: Vec4) -> Vec4 {
    (color.truncate() * color.w).extend(color.w)
}

/// Front-to-back accumulation: `src` lies behind everything in `dst`.
pub fn blend_under(dst: Vec4, src: Vec4) -> Vec4 {
    dst + src * (1.0 - dst.w)
}

/// Back-to-front accumulation: `src` lies in front of everything in `dst`.
pub fn blend_over(dst: Vec4, src: Vec4) -> Vec4 {
    src + dst * (1.0 - src.w)
}

/// Default shading: Lambert with the light at the eye, `|n·l|`.
pub fn shade_lambert(normal: glam::Vec3, color: Vec4) -> Vec4 {
    let n = normal.normalize_or_zero();
    let lambert = n.dot(glam::Vec3::Z).abs();
    (color.truncate() * lambert).extend(color.w)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_space_perspective_round_trip() {
        let projection = Mat4::perspective_rh(1.0, 1.0, 0.5, 50.0);
        let space = DepthSpace::from_projection(&projection, false);
        assert!(!space.orthographic);
        for linear in [0.5f32, 1.0, 3.0, 10.0, 49.0] {
            let clip = projection * glam::Vec4::new(0.0, 0.0, -linear, 1.0);
            let window = clip.z / clip.w;
            assert!((space.project(linear) - window).abs() < 1e-5);
            assert!((space.linearize(window) - linear).abs() / linear < 1e-4);
        }
    }

    #[test]
    fn test_depth_space_orthographic_round_trip() {
        let projection = Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, 1.0, 9.0);
        let space = DepthSpace::from_projection(&projection, true);
        assert!(space.orthographic);
        for linear in [1.0f32, 2.5, 9.0] {
            let window = space.project(linear);
            assert!((space.linearize(window) - linear).abs() < 1e-5);
        }
        assert_eq!(space.peel_depth(space.project(2.5)), space.linearize(space.project(2.5)));
    }

    #[test]
    fn test_cell_code_refines_first_bin() {
        let t = 0.5 + 0.3 / 32.0;
        let code = cell_code(t, 32, 2);
        assert_eq!(code & code_mask(0), 16);
        assert_eq!(code_sub_bin(code, 0), 1);
        let (start, width) = decode_interval(code, 32, 2);
        assert!(start <= t && t < start + width);
        assert!((width - 1.0 / (32.0 * 16.0)).abs() < 1e-9);
    }

    #[test]
    fn test_cell_code_clamps_far_end() {
        let code = cell_code(1.0, 32, 3);
        assert_eq!(code & code_mask(0), 31);
        for level in 0..3 {
            assert_eq!(code_sub_bin(code, level), 3);
        }
    }

    #[test]
    fn test_search_bins_finds_rank() {
        let counts = [1.0, 0.0, 2.0, 0.0, 2.0];
        assert_eq!(search_bins(&counts, 0.5), (0, 0.0));
        assert_eq!(search_bins(&counts, 2.5), (2, 1.0));
        assert_eq!(search_bins(&counts, 3.0), (2, 1.0));
        assert_eq!(search_bins(&counts, 4.5), (4, 3.0));
        assert_eq!(search_bins(&counts, 9.0), (4, 3.0));
    }

    #[test]
    fn test_interpolate_split_stays_in_interval() {
        let split = interpolate_split(1.0, 5.0, (0.5, 0.25), 1.0, 2.0);
        assert!((split - (1.0 + 4.0 * 0.625)).abs() < 1e-6);
        let clamped = interpolate_split(1.0, 5.0, (0.5, 0.25), 7.0, 2.0);
        assert!((clamped - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_find_saturation_stops_at_threshold() {
        let groups = [
            ([1.0, 0.0, 0.0], 0.5),
            ([0.0, 2.0, 0.0], 0.75),
            ([0.0, 0.0, 4.0], 0.9),
        ];
        let saturation = find_saturation(&groups, 0.8);
        assert_eq!(saturation.effective_total, 3.0);
        assert_eq!(saturation.bin_end, 6.0);

        let open = find_saturation(&groups[..1], 0.8);
        assert_eq!(open.effective_total, 1.0);
        assert_eq!(open.bin_end, NO_SPLIT);
    }

    #[test]
    fn test_slice_of_counts_points_at_or_below() {
        let points = [0.3, 0.6];
        assert_eq!(slice_of(0.1, &points), 0);
        assert_eq!(slice_of(0.3, &points), 1);
        assert_eq!(slice_of(0.9, &points), 2);
    }

    #[test]
    fn test_packed_colors_order_by_alpha_and_keep_exact_values() {
        let faint = Vec4::new(1.0, 1.0, 1.0, 0.2);
        let strong = Vec4::new(0.0, 0.0, 0.0, 0.4);
        assert!(pack_color(strong) > pack_color(faint));

        let color = Vec4::new(51.0 / 255.0, 102.0 / 255.0, 1.0, 0.6);
        let unpacked = unpack_color(pack_color(color));
        assert!((unpacked - color).abs().max_element() < 1e-6);
        assert_eq!(unpack_color(f32::NEG_INFINITY), Vec4::ZERO);
        assert_eq!(unpack_color(0.0), Vec4::ZERO);
    }

    #[test]
    fn test_under_and_over_agree_on_two_layers() {
        let near = premultiply(Vec4::new(1.0, 0.0, 0.0, 0.4));
        let far = premultiply(Vec4::new(0.0, 0.0, 1.0, 0.6));
        let front_to_back = blend_under(blend_under(Vec4::ZERO, near), far);
        let back_to_front = blend_over(blend_over(Vec4::ZERO, far), near);
        assert!((front_to_back - back_to_front).abs().max_element() < 1e-6);
    }
}
