//! Constants used throughout the peeling engine.

/// Largest number of depth slices a multi-layer pass can handle.
pub const MAX_SLICES: usize = 8;

/// Number of passes an occlusion query may stay pending before it is
/// force-read.
pub const MAX_QUERY_LATENCY: usize = 5;

/// Identical sample counts tolerated before a peel loop is declared stuck.
pub const MAX_NUM_RETRIES: u32 = 5;

/// Upper bound for `Parameters::partition_iterations`.
pub const MAX_PARTITION_ITERATIONS: u32 = 8;

/// Iteration count above which coded intervals no longer fit a half float.
pub const HALF_FLOAT_CODE_ITERATIONS: u32 = 3;

/// Bins of the first depth histogram.
pub const FIRST_PASS_BINS: u32 = 32;

/// Bins of the first depth histogram when the alpha channel carries opacity.
pub const ALPHA_AWARE_FIRST_PASS_BINS: u32 = 24;

/// Textures holding the first depth histogram.
pub const FIRST_PASS_COUNT_TEXTURES: usize = 8;

/// Sub-bins each refinement iteration splits an interval into.
pub const REFINEMENT_SUB_BINS: u32 = 4;

/// Bits taken by the first-pass bin in a coded interval.
pub const FIRST_BIN_CODE_BITS: u32 = 5;

/// Clear value of min/max depth targets.
pub const MINMAX_CLEAR: f32 = -1e9;

/// Clear value of ping-pong depth targets.
pub const DEPTH_CLEAR: f32 = -1e30;

/// Split point value meaning "no split" (beyond any fragment).
pub const NO_SPLIT: f32 = 1e30;

/// Largest value a packed color alpha field holds.
pub const PACKED_ALPHA_LEVELS: f32 = 125.0;

/// Textures of each format a context pool keeps around for tiles.
pub const POOL_DEPTH_TEXTURES: usize = 2;
pub const POOL_COLOR_TEXTURES: usize = 2;

/// Textures a single-layer tile extracts per format.
pub const TILE_DEPTH_TEXTURES: usize = 2;
pub const TILE_COLOR_TEXTURES: usize = 1;

/// Maximum color attachments of any pass.
pub const MAX_COLOR_TARGETS: usize = 8;
