//! Error types shared by the peeling engine and its backends.

use thiserror::Error;

use crate::backend::TextureFormat;

/// Errors surfaced by session setup, configuration and GPU backends.
///
/// Conditions the engine recovers from locally (pool exhaustion, overlapping
/// queries, stagnating peel loops) are logged instead of returned.
#[derive(Debug, Error)]
pub enum StrataError {
    #[error("Request Adapter Error: {0}")]
    RequestAdapterError(#[from] wgpu::RequestAdapterError),

    #[error("Request Device Error: {0}")]
    RequestDeviceError(#[from] wgpu::RequestDeviceError),

    #[error("Buffer map error: {0}")]
    BufferMapError(#[from] wgpu::BufferAsyncError),

    #[error("Device poll error: {0}")]
    PollError(#[from] wgpu::PollError),

    #[error("Unsupported GPU feature: {0}")]
    UnsupportedFeature(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Parameters parse error: {0}")]
    ParametersParseError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Unknown texture {0}")]
    UnknownTexture(u64),

    #[error("Texture format {0:?} cannot be read back")]
    UnreadableFormat(TextureFormat),

    #[error("Occlusion query capacity of {0} exhausted")]
    QueryCapacityExhausted(u32),

    #[error("Timeout waiting for {0}")]
    Timeout(&'static str),

    #[error("Shader assembly error: {0}")]
    ShaderError(String),
}
