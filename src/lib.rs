// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 for ONNX dims
#![allow(clippy::cast_sign_loss)] // i64→usize when value is known positive
#![allow(clippy::many_single_char_names)] // x, w, b, k standard in math
#![allow(clippy::similar_names)] // related variables like `w_dec`/`b_dec`
#![allow(clippy::module_name_repetitions)] // SaeConfig in sae.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! sae-onnx: top-k sparse autoencoders for transformer activations
//!
//! Decodes top-k activation records, probes host models for the widths of
//! their submodules, and exports the SAE inference path to ONNX.
//!
//! ## Architecture
//!
//! - `decode`: Eager and fused sparse decode behind one strategy trait
//! - `widths`: Forward-hook based submodule width discovery and layer list lookup
//! - `sae`: Top-k SAE model, hub/disk loading, and the ONNX forward variant
//! - `onnx`: Graph export, structural checker, and a candle replay runtime
//! - `error`: Library error kinds

pub mod decode;
pub mod error;
pub mod onnx;
pub mod sae;
pub mod widths;

pub use decode::{
    decode, default_strategy, eager_decode, DecodeStrategy, DecoderConfig, SparseDecode,
    DISABLE_FUSED_ENV, LEGACY_DISABLE_ENV,
};
#[cfg(feature = "fused-decode")]
pub use decode::fused_decode;
pub use error::{Result, SaeError};
pub use onnx::{check_model, export_sae, ExportOptions, ExportedModel, OnnxSession};
pub use sae::{select_device, EncoderOutput, ForwardOutput, Sae, SaeConfig, SaeOnnxWrapper};
pub use widths::{
    layer_list, resolve_widths, resolve_widths_along, ForwardHook, HookGuard, HookHandle,
    HookRegistry, HookableModel, ModuleOutput,
};
