//! ONNX export, validation and replay for the SAE inference path
//!
//! - [`export`]: builds the graph for [`Sae::forward_onnx`](crate::Sae::forward_onnx)
//!   and writes it, optionally with weights in a side file
//! - [`checker`]: structural validation of a written model
//! - [`runtime`]: a small candle interpreter for the exported op set, used to
//!   compare the artifact against the in-process model
//! - [`proto`]: the protobuf messages

pub mod checker;
pub mod export;
pub mod proto;
pub mod runtime;

pub use checker::{check_model, check_model_proto};
pub use export::{build_model_proto, export_sae, ExportOptions, ExportedModel};
pub use runtime::OnnxSession;

/// Operator set version the exporter targets.
pub const OPSET_VERSION: i64 = 15;

/// IR version written into exported models.
pub const IR_VERSION: i64 = 8;

/// Name of the graph input.
pub const INPUT_NAME: &str = "input";

/// Name of the graph output.
pub const OUTPUT_NAME: &str = "sae_out";

/// Symbolic name of the dynamic leading dimension.
pub const BATCH_DIM: &str = "batch_size";
