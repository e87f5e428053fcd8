//! Error kinds surfaced by the library
//!
//! The CLI and demos wrap these in `anyhow`; library callers can match on
//! the variant to tell a lookup failure from an uninitialized decoder.

use thiserror::Error;

/// Errors returned by `sae_onnx` operations.
#[derive(Debug, Error)]
pub enum SaeError {
    /// A named submodule does not exist on the host model.
    #[error("Submodule '{0}' not found")]
    SubmoduleNotFound(String),

    /// A required weight was never loaded (e.g. decoder skipped at load time).
    #[error("{0} was not initialized")]
    Uninitialized(&'static str),

    /// The exported graph failed the structural check.
    #[error("ONNX validation failed: {0}")]
    Validation(String),

    /// The replay runtime met an operator it does not evaluate.
    #[error("Unsupported ONNX operator '{0}'")]
    UnsupportedOp(String),

    /// No unique list of layers could be identified on the host model.
    #[error("Could not find the list of layers: {0}")]
    LayerList(String),

    /// Inconsistent configuration or tensor shapes.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A forward hook could not read the observed output.
    #[error("Hook on '{module}' failed: {reason}")]
    Hook { module: String, reason: String },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("Failed to decode ONNX protobuf: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error(transparent)]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("HuggingFace hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),
}

/// Result type for `sae_onnx` operations.
pub type Result<T> = std::result::Result<T, SaeError>;
