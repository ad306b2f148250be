//! Strata GPU
//!
//! Order-independent transparency by depth peeling. A [`RenderBin`] takes the
//! host's transparent draw list once per frame and peels it either several
//! layers per pass, across per-pixel depth slices found by an iterative
//! histogram partition, or one layer per pass over a grid of screen tiles.
//!
//! The engine drives any [`Backend`]: [`WgpuBackend`] renders with wgpu,
//! [`SoftwareBackend`] is a deterministic CPU reference.

pub mod backend;
pub mod canvas;
pub mod config;
pub mod constants;
pub mod context;
pub mod draw_list;
pub mod error;
pub mod handle;
pub mod kernels;
pub mod logging;
pub mod occlusion_query;
pub mod partitioner;
pub mod render_bin;
pub mod resource_pool;
pub mod shaders;
pub mod tile;
pub mod types;

pub use backend::{
    Backend, PassUniforms, QueryBackend, ShaderSet, SoftwareBackend, TextureDesc, TextureFormat,
    Viewport, WgpuBackend,
};
pub use canvas::FrameStats;
pub use config::{Diagnostics, Parameters};
pub use context::ContextToken;
pub use draw_list::{Camera, HostState, Leaf, RenderInfo, StateGraph, StateSetId};
pub use error::StrataError;
pub use logging::{LoggingConfig, init_logging};
pub use render_bin::{PeelMode, RenderBin};
pub use types::{Aabb, SceneVertex};
