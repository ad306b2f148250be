//! Session configuration for the peeling engine.
//!
//! [`Parameters`] is split in two classes of fields. Const-class fields shape
//! shaders and texture layouts; changing one of them invalidates every
//! per-context session. The remaining fields can be swapped between frames
//! through [`Parameters::update`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::constants::{MAX_PARTITION_ITERATIONS, MAX_QUERY_LATENCY, MAX_SLICES};
use crate::error::StrataError;

/// Developer diagnostics. None of them change the composited image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Diagnostics {
    /// Count fragments per pixel at frame start and log the maximum.
    pub compute_max_depth_complexity: bool,
    /// Count fragments per slice after partitioning and log the balance.
    pub profile_depth_partition: bool,
    /// Pixel (column, row) whose split points are logged after partitioning.
    pub debug_pixel: Option<[u32; 2]>,
}

/// Configuration of a multi-layer depth peeling session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    /// Quantiles of the split points, strictly ascending in (0, 1).
    pub split_point_quantiles: Vec<f32>,
    /// Accumulated slice opacity above which fragments are discarded.
    pub opacity_threshold: f32,
    /// Upper bound on peel passes per frame, 0 for unbounded.
    pub maximum_passes: u32,
    /// Peeling stops once a pass lets at most this many samples through.
    pub samples_cutoff: u64,
    /// Texture bindings left to extra shaders before the engine's own.
    pub reserved_texture_units: u32,
    /// Use one occlusion query per pass instead of one per draw.
    pub single_query_per_pass: bool,
    /// Peel in linear eye depth instead of window depth.
    pub unproject_depths: bool,
    /// Add a split point past which accumulated opacity saturates.
    pub alpha_aware_partition: bool,
    /// Refinement iterations of the quantile search.
    pub partition_iterations: u32,
    /// Per-pixel min/max from fragments; bounding boxes when false.
    pub accurate_min_max: bool,
    /// Passes a query may stay pending before it is force-read.
    pub query_latency: usize,
    /// Ask the backend for boolean occlusion queries.
    pub any_samples_queries: bool,
    pub diagnostics: Diagnostics,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            split_point_quantiles: vec![0.5],
            opacity_threshold: 0.99,
            maximum_passes: 100,
            samples_cutoff: 0,
            reserved_texture_units: 4,
            single_query_per_pass: false,
            unproject_depths: false,
            alpha_aware_partition: false,
            partition_iterations: 1,
            accurate_min_max: true,
            query_latency: 1,
            any_samples_queries: false,
            diagnostics: Diagnostics::default(),
        }
    }
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameters with `slices` equally populated slices.
    ///
    /// Out of range slice counts fall back to the default quantiles.
    pub fn with_slices(mut self, slices: usize) -> Self {
        if slices == 0 || slices > MAX_SLICES {
            warn!(
                "Unsupported slice count {}, using default split points",
                slices
            );
            self.split_point_quantiles = Self::default().split_point_quantiles;
            return self;
        }
        self.split_point_quantiles = (1..slices)
            .map(|i| i as f32 / slices as f32)
            .collect();
        self
    }

    pub fn with_quantiles(mut self, quantiles: Vec<f32>) -> Self {
        self.split_point_quantiles = quantiles;
        self
    }

    pub fn with_opacity_threshold(mut self, threshold: f32) -> Self {
        self.opacity_threshold = threshold;
        self
    }

    pub fn with_maximum_passes(mut self, passes: u32) -> Self {
        self.maximum_passes = passes;
        self
    }

    pub fn with_samples_cutoff(mut self, samples: u64) -> Self {
        self.samples_cutoff = samples;
        self
    }

    pub fn with_single_query_per_pass(mut self, single: bool) -> Self {
        self.single_query_per_pass = single;
        self
    }

    pub fn with_unproject_depths(mut self, unproject: bool) -> Self {
        self.unproject_depths = unproject;
        self
    }

    pub fn with_alpha_aware_partition(mut self, alpha_aware: bool) -> Self {
        self.alpha_aware_partition = alpha_aware;
        self
    }

    pub fn with_partition_iterations(mut self, iterations: u32) -> Self {
        self.partition_iterations = iterations;
        self
    }

    pub fn with_accurate_min_max(mut self, accurate: bool) -> Self {
        self.accurate_min_max = accurate;
        self
    }

    pub fn with_query_latency(mut self, latency: usize) -> Self {
        self.query_latency = latency;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn num_slices(&self) -> usize {
        self.split_point_quantiles.len() + 1
    }

    /// Split points computed by the partitioner, including the opacity
    /// saturation point of alpha-aware partitions.
    pub fn adjusted_num_points(&self) -> usize {
        self.split_point_quantiles.len() + usize::from(self.alpha_aware_partition)
    }

    /// Checks the invariants the shaders and texture layouts rely on.
    pub fn validate(&self) -> Result<(), StrataError> {
        if self.num_slices() > MAX_SLICES {
            return Err(StrataError::InvalidParameters(format!(
                "{} slices requested, at most {} supported",
                self.num_slices(),
                MAX_SLICES
            )));
        }
        let mut previous = 0.0;
        for &q in &self.split_point_quantiles {
            if !(q > previous && q < 1.0) {
                return Err(StrataError::InvalidParameters(format!(
                    "split point quantiles must be strictly ascending in (0, 1): {:?}",
                    self.split_point_quantiles
                )));
            }
            previous = q;
        }
        if !(self.opacity_threshold > 0.0 && self.opacity_threshold <= 1.0) {
            return Err(StrataError::InvalidParameters(format!(
                "opacity threshold {} outside (0, 1]",
                self.opacity_threshold
            )));
        }
        if self.partition_iterations > MAX_PARTITION_ITERATIONS {
            return Err(StrataError::InvalidParameters(format!(
                "{} partition iterations requested, at most {} supported",
                self.partition_iterations, MAX_PARTITION_ITERATIONS
            )));
        }
        if self.query_latency > MAX_QUERY_LATENCY {
            return Err(StrataError::InvalidParameters(format!(
                "query latency {} above {}",
                self.query_latency, MAX_QUERY_LATENCY
            )));
        }
        Ok(())
    }

    /// Whether `other` can replace these parameters without rebuilding
    /// shaders and textures.
    pub fn is_compatible(&self, other: &Parameters) -> bool {
        self.split_point_quantiles.len() == other.split_point_quantiles.len()
            && self.alpha_aware_partition == other.alpha_aware_partition
            && self.unproject_depths == other.unproject_depths
            && self.opacity_threshold == other.opacity_threshold
            && self.reserved_texture_units == other.reserved_texture_units
            && self.partition_iterations == other.partition_iterations
            && self.accurate_min_max == other.accurate_min_max
    }

    /// Takes the mutable fields of `other` when it is compatible.
    ///
    /// Returns false, leaving `self` untouched, when a const-class field
    /// differs. The owner must then discard every session built from `self`.
    pub fn update(&mut self, other: &Parameters) -> bool {
        if !self.is_compatible(other) {
            return false;
        }
        self.maximum_passes = other.maximum_passes;
        self.samples_cutoff = other.samples_cutoff;
        self.split_point_quantiles
            .clone_from(&other.split_point_quantiles);
        self.single_query_per_pass = other.single_query_per_pass;
        self.query_latency = other.query_latency;
        self.any_samples_queries = other.any_samples_queries;
        self.diagnostics = other.diagnostics.clone();
        true
    }

    pub fn from_json_str(json: &str) -> Result<Self, StrataError> {
        let parameters: Parameters = serde_json::from_str(json)?;
        parameters.validate()?;
        Ok(parameters)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, StrataError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Applies developer overrides from `STRATA_*` environment variables.
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides looked up through `lookup`. A value that does not
    /// parse is logged and leaves the field unchanged.
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = lookup("STRATA_SPLIT_QUANTILES") {
            match parse_quantiles(&value) {
                Some(quantiles) => self.split_point_quantiles = quantiles,
                None => error!(
                    "Invalid STRATA_SPLIT_QUANTILES '{}', keeping {:?}",
                    value, self.split_point_quantiles
                ),
            }
        }
        if let Some(value) = lookup("STRATA_OPACITY_THRESHOLD") {
            match value.trim().parse::<f32>() {
                Ok(threshold) if threshold > 0.0 && threshold <= 1.0 => {
                    self.opacity_threshold = threshold
                }
                _ => error!("Invalid STRATA_OPACITY_THRESHOLD '{}'", value),
            }
        }
        if let Some(value) = lookup("STRATA_PARTITION_ITERATIONS") {
            match value.trim().parse::<u32>() {
                Ok(iterations) => {
                    self.partition_iterations = iterations.min(MAX_PARTITION_ITERATIONS)
                }
                Err(_) => error!("Invalid STRATA_PARTITION_ITERATIONS '{}'", value),
            }
        }
        if let Some(value) = lookup("STRATA_QUERY_LATENCY") {
            match value.trim().parse::<usize>() {
                Ok(latency) => self.query_latency = latency.min(MAX_QUERY_LATENCY),
                Err(_) => error!("Invalid STRATA_QUERY_LATENCY '{}'", value),
            }
        }
        if let Some(value) = lookup("STRATA_ANY_SAMPLES") {
            self.any_samples_queries = parse_flag(&value);
        }
        if let Some(value) = lookup("STRATA_COMPUTE_DEPTH_COMPLEXITY") {
            self.diagnostics.compute_max_depth_complexity = parse_flag(&value);
        }
        if let Some(value) = lookup("STRATA_PROFILE_PARTITION") {
            self.diagnostics.profile_depth_partition = parse_flag(&value);
        }
        if let Some(value) = lookup("STRATA_DEBUG_PIXEL") {
            match parse_pixel(&value) {
                Some(pixel) => self.diagnostics.debug_pixel = Some(pixel),
                None => error!("Invalid STRATA_DEBUG_PIXEL '{}', expected 'column,row'", value),
            }
        }
        self
    }
}

fn parse_flag(value: &str) -> bool {
    !matches!(value.trim(), "" | "0" | "false" | "off")
}

/// Comma or colon separated ascending quantiles.
fn parse_quantiles(value: &str) -> Option<Vec<f32>> {
    let quantiles = value
        .split([',', ':'])
        .map(|s| s.trim().parse::<f32>().ok())
        .collect::<Option<Vec<f32>>>()?;
    let ascending = quantiles.windows(2).all(|w| w[0] < w[1]);
    let in_range = quantiles.iter().all(|&q| q > 0.0 && q < 1.0);
    (ascending && in_range && quantiles.len() < MAX_SLICES).then_some(quantiles)
}

fn parse_pixel(value: &str) -> Option<[u32; 2]> {
    let mut parts = value.split(',').map(|s| s.trim().parse::<u32>());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(column)), Some(Ok(row)), None) => Some([column, row]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_with_slices_spreads_quantiles_evenly() {
        let parameters = Parameters::new().with_slices(4);
        assert_eq!(parameters.split_point_quantiles, vec![0.25, 0.5, 0.75]);
        assert_eq!(parameters.num_slices(), 4);
        assert!(parameters.validate().is_ok());

        let single = Parameters::new().with_slices(1);
        assert!(single.split_point_quantiles.is_empty());
        assert_eq!(single.num_slices(), 1);
    }

    #[test]
    fn test_with_slices_out_of_range_uses_default() {
        let parameters = Parameters::new().with_slices(9);
        assert_eq!(parameters.split_point_quantiles, vec![0.5]);
    }

    #[test]
    fn test_adjusted_points_count_saturation_point() {
        let parameters = Parameters::new()
            .with_slices(3)
            .with_alpha_aware_partition(true);
        assert_eq!(parameters.adjusted_num_points(), 3);
    }

    #[test]
    fn test_validate_rejects_unordered_quantiles() {
        let parameters = Parameters::new().with_quantiles(vec![0.5, 0.4]);
        assert!(matches!(
            parameters.validate(),
            Err(StrataError::InvalidParameters(_))
        ));
        let repeated = Parameters::new().with_quantiles(vec![0.3, 0.3]);
        assert!(repeated.validate().is_err());
        let edge = Parameters::new().with_quantiles(vec![0.0, 0.5]);
        assert!(edge.validate().is_err());
    }

    #[test]
    fn test_update_compatible_copies_mutable_fields() {
        let mut current = Parameters::new().with_slices(3);
        let other = Parameters::new()
            .with_quantiles(vec![0.2, 0.9])
            .with_maximum_passes(7)
            .with_samples_cutoff(12)
            .with_single_query_per_pass(true);

        assert!(current.update(&other));
        assert_eq!(current.maximum_passes, 7);
        assert_eq!(current.samples_cutoff, 12);
        assert_eq!(current.split_point_quantiles, vec![0.2, 0.9]);
        assert!(current.single_query_per_pass);
        assert_eq!(current, other);
    }

    #[test]
    fn test_update_incompatible_leaves_parameters_untouched() {
        let original = Parameters::new().with_slices(3);
        let changes: Vec<Parameters> = vec![
            Parameters::new().with_slices(4),
            original.clone().with_alpha_aware_partition(true),
            original.clone().with_unproject_depths(true),
            original.clone().with_opacity_threshold(0.5),
            original.clone().with_partition_iterations(2),
            original.clone().with_accurate_min_max(false),
            Parameters {
                reserved_texture_units: 0,
                ..original.clone()
            },
        ];
        for other in changes {
            let mut current = original.clone().with_maximum_passes(3);
            let before = current.clone();
            assert!(!current.update(&other.clone().with_maximum_passes(50)));
            assert_eq!(current, before);
        }
    }

    #[test]
    fn test_json_round_trip_with_defaults() {
        let parameters =
            Parameters::from_json_str(r#"{ "split_point_quantiles": [0.3, 0.6], "maximum_passes": 12 }"#)
                .unwrap();
        assert_eq!(parameters.split_point_quantiles, vec![0.3, 0.6]);
        assert_eq!(parameters.maximum_passes, 12);
        assert_eq!(parameters.opacity_threshold, 0.99);
        assert_eq!(parameters.partition_iterations, 1);
    }

    #[test]
    fn test_json_rejects_invalid_quantiles() {
        let result = Parameters::from_json_str(r#"{ "split_point_quantiles": [0.7, 0.3] }"#);
        assert!(matches!(result, Err(StrataError::InvalidParameters(_))));
    }

    #[test]
    fn test_overrides_apply_and_ignore_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("STRATA_SPLIT_QUANTILES", "0.25,0.5,0.75"),
            ("STRATA_PARTITION_ITERATIONS", "20"),
            ("STRATA_QUERY_LATENCY", "soon"),
            ("STRATA_DEBUG_PIXEL", "3,4"),
            ("STRATA_PROFILE_PARTITION", "1"),
        ]);
        let parameters = Parameters::new()
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(parameters.split_point_quantiles, vec![0.25, 0.5, 0.75]);
        assert_eq!(parameters.partition_iterations, MAX_PARTITION_ITERATIONS);
        assert_eq!(parameters.query_latency, 1);
        assert_eq!(parameters.diagnostics.debug_pixel, Some([3, 4]));
        assert!(parameters.diagnostics.profile_depth_partition);
    }

    #[test]
    fn test_overrides_keep_default_on_descending_quantiles() {
        let parameters = Parameters::new().apply_overrides(|name| {
            (name == "STRATA_SPLIT_QUANTILES").then(|| "0.8,0.2".to_string())
        });
        assert_eq!(parameters.split_point_quantiles, vec![0.5]);
    }
}
