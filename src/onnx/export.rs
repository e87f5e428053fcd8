//! SAE → ONNX graph
//!
//! The graph mirrors `Sae::forward_onnx` node for node:
//!
//! ```text
//! sae_in      = Sub(input, b_dec)
//! enc         = Add(MatMul(sae_in, encoder.weight_t), encoder.bias)
//! pre_acts    = Relu(enc)
//! top_acts,
//! top_indices = TopK(pre_acts, k, axis=-1)
//! zeros       = ConstantOfShape(Shape(pre_acts), value=0.0)
//! latents     = ScatterElements(zeros, top_indices, top_acts, axis=-1)
//! sae_out     = Add(MatMul(latents, W_dec), b_dec)
//! ```
//!
//! All parameters are stored as F32 initializers. With external data
//! enabled, initializers of at least `size_threshold` bytes are appended to
//! `<file_name>.data` next to the model and referenced by offset.

use std::io::Write;
use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use prost::Message;
use tracing::{debug, info};

use super::proto::{
    attribute_proto::AttributeType,
    tensor_proto::{DataLocation, DataType},
    tensor_shape_proto::{dimension, Dimension},
    type_proto, AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto,
    StringStringEntryProto, TensorProto, TensorShapeProto, TypeProto, ValueInfoProto,
};
use super::{BATCH_DIM, INPUT_NAME, IR_VERSION, OPSET_VERSION, OUTPUT_NAME};
use crate::error::{Result, SaeError};
use crate::sae::Sae;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// How [`export_sae`] lays out files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    /// Model file name inside the output directory
    pub file_name: String,
    /// Move large initializers into `<file_name>.data`
    pub external_data: bool,
    /// Minimum initializer size in bytes to move out (when `external_data`)
    pub size_threshold: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            file_name: "sae.onnx".to_string(),
            external_data: true,
            size_threshold: 1024,
        }
    }
}

impl ExportOptions {
    pub fn data_file_name(&self) -> String {
        format!("{}.data", self.file_name)
    }
}

/// Files written by an export.
#[derive(Debug, Clone)]
pub struct ExportedModel {
    pub model_path: PathBuf,
    /// Present when at least one initializer went to the side file
    pub data_path: Option<PathBuf>,
    pub num_initializers: usize,
    pub num_external: usize,
}

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

/// Build the in-memory model with every parameter embedded in `raw_data`.
///
/// Requires the decoder weight.
pub fn build_model_proto(sae: &Sae) -> Result<ModelProto> {
    let w_dec = sae
        .w_dec()
        .ok_or(SaeError::Uninitialized("Decoder weight"))?;
    let encoder_bias = sae
        .encoder_bias()
        .ok_or(SaeError::Uninitialized("Encoder bias"))?;
    let d_in = sae.d_in();

    let initializer = vec![
        f32_initializer("b_dec", sae.b_dec())?,
        f32_initializer("encoder.weight_t", &sae.encoder_weight().t()?)?,
        f32_initializer("encoder.bias", encoder_bias)?,
        f32_initializer("W_dec", w_dec)?,
        TensorProto {
            name: "k".to_string(),
            dims: vec![1],
            data_type: DataType::Int64 as i32,
            raw_data: (sae.k() as i64).to_le_bytes().to_vec(),
            ..Default::default()
        },
    ];

    let node = vec![
        node("Sub", &[INPUT_NAME, "b_dec"], &["sae_in"], vec![]),
        node("MatMul", &["sae_in", "encoder.weight_t"], &["enc_mm"], vec![]),
        node("Add", &["enc_mm", "encoder.bias"], &["enc"], vec![]),
        node("Relu", &["enc"], &["pre_acts"], vec![]),
        node(
            "TopK",
            &["pre_acts", "k"],
            &["top_acts", "top_indices"],
            vec![
                int_attr("axis", -1),
                int_attr("largest", 1),
                int_attr("sorted", 1),
            ],
        ),
        node("Shape", &["pre_acts"], &["latent_shape"], vec![]),
        node(
            "ConstantOfShape",
            &["latent_shape"],
            &["zeros"],
            vec![tensor_attr(
                "value",
                TensorProto {
                    dims: vec![1],
                    data_type: DataType::Float as i32,
                    raw_data: 0f32.to_le_bytes().to_vec(),
                    ..Default::default()
                },
            )],
        ),
        node(
            "ScatterElements",
            &["zeros", "top_indices", "top_acts"],
            &["latents"],
            vec![int_attr("axis", -1)],
        ),
        node("MatMul", &["latents", "W_dec"], &["dec_mm"], vec![]),
        node("Add", &["dec_mm", "b_dec"], &[OUTPUT_NAME], vec![]),
    ];

    let graph = GraphProto {
        name: "sae".to_string(),
        node,
        initializer,
        input: vec![batch_value_info(INPUT_NAME, d_in)],
        output: vec![batch_value_info(OUTPUT_NAME, d_in)],
        ..Default::default()
    };

    Ok(ModelProto {
        ir_version: IR_VERSION,
        producer_name: env!("CARGO_PKG_NAME").to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        model_version: 1,
        graph: Some(graph),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: OPSET_VERSION,
        }],
        metadata_props: vec![
            entry("d_in", &d_in.to_string()),
            entry("num_latents", &sae.num_latents().to_string()),
            entry("k", &sae.k().to_string()),
        ],
        ..Default::default()
    })
}

/// Write `sae` to `output_dir` according to `options`.
pub fn export_sae(sae: &Sae, output_dir: &Path, options: &ExportOptions) -> Result<ExportedModel> {
    let mut model = build_model_proto(sae)?;
    std::fs::create_dir_all(output_dir)?;

    let model_path = output_dir.join(&options.file_name);
    let data_name = options.data_file_name();
    let data_path = output_dir.join(&data_name);

    let graph = model
        .graph
        .as_mut()
        .ok_or_else(|| SaeError::Validation("model has no graph".into()))?;
    let num_initializers = graph.initializer.len();

    let mut num_external = 0;
    if options.external_data {
        let mut data = std::io::BufWriter::new(std::fs::File::create(&data_path)?);
        let mut offset = 0usize;
        for tensor in graph
            .initializer
            .iter_mut()
            .filter(|t| t.raw_data.len() >= options.size_threshold)
        {
            let bytes = std::mem::take(&mut tensor.raw_data);
            data.write_all(&bytes)?;
            debug!(
                "external initializer {} at offset {offset} ({} bytes)",
                tensor.name,
                bytes.len()
            );
            tensor.data_location = DataLocation::External as i32;
            tensor.external_data = vec![
                entry("location", &data_name),
                entry("offset", &offset.to_string()),
                entry("length", &bytes.len().to_string()),
            ];
            offset += bytes.len();
            num_external += 1;
        }
        data.flush()?;
        if num_external == 0 {
            drop(data);
            std::fs::remove_file(&data_path)?;
        }
    }

    std::fs::write(&model_path, model.encode_to_vec())?;
    info!(
        "Exported SAE to {} ({num_initializers} initializers, {num_external} external)",
        model_path.display()
    );

    Ok(ExportedModel {
        model_path,
        data_path: (num_external > 0).then_some(data_path),
        num_initializers,
        num_external,
    })
}

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

/// F32 initializer with little-endian `raw_data`.
fn f32_initializer(name: &str, tensor: &Tensor) -> Result<TensorProto> {
    let dims = tensor.dims().iter().map(|&d| d as i64).collect();
    let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let raw_data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    Ok(TensorProto {
        name: name.to_string(),
        dims,
        data_type: DataType::Float as i32,
        raw_data,
        ..Default::default()
    })
}

fn node(op_type: &str, inputs: &[&str], outputs: &[&str], attribute: Vec<AttributeProto>) -> NodeProto {
    NodeProto {
        name: format!("{op_type}_{}", outputs[0]),
        op_type: op_type.to_string(),
        input: inputs.iter().map(|s| s.to_string()).collect(),
        output: outputs.iter().map(|s| s.to_string()).collect(),
        attribute,
        ..Default::default()
    }
}

fn int_attr(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Int as i32,
        i: value,
        ..Default::default()
    }
}

fn tensor_attr(name: &str, value: TensorProto) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Tensor as i32,
        t: Some(value),
        ..Default::default()
    }
}

/// `[batch_size, width]` F32 value.
fn batch_value_info(name: &str, width: usize) -> ValueInfoProto {
    let dim = vec![
        Dimension {
            value: Some(dimension::Value::DimParam(BATCH_DIM.to_string())),
            ..Default::default()
        },
        Dimension {
            value: Some(dimension::Value::DimValue(width as i64)),
            ..Default::default()
        },
    ];
    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: DataType::Float as i32,
                shape: Some(TensorShapeProto { dim }),
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn entry(key: &str, value: &str) -> StringStringEntryProto {
    StringStringEntryProto {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sae::SaeConfig;
    use candle_core::Device;

    fn small_sae(decoder: bool) -> Sae {
        let config = SaeConfig {
            expansion_factor: 4,
            k: 4,
            ..Default::default()
        };
        Sae::new(16, config, &Device::Cpu, DType::F32, decoder).unwrap()
    }

    #[test]
    fn test_graph_layout() {
        let model = build_model_proto(&small_sae(true)).unwrap();
        assert_eq!(model.ir_version, IR_VERSION);
        assert_eq!(model.opset_import[0].version, 15);

        let graph = model.graph.unwrap();
        let ops: Vec<&str> = graph.node.iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(
            ops,
            vec![
                "Sub",
                "MatMul",
                "Add",
                "Relu",
                "TopK",
                "Shape",
                "ConstantOfShape",
                "ScatterElements",
                "MatMul",
                "Add"
            ]
        );
        assert_eq!(graph.input[0].name, "input");
        assert_eq!(graph.output[0].name, "sae_out");
        assert_eq!(graph.node.last().unwrap().output, vec!["sae_out".to_string()]);

        let w_t = graph
            .initializer
            .iter()
            .find(|t| t.name == "encoder.weight_t")
            .unwrap();
        assert_eq!(w_t.dims, vec![16, 64]);
        assert_eq!(w_t.raw_data.len(), 16 * 64 * 4);
    }

    #[test]
    fn test_batch_dimension_is_symbolic() {
        let model = build_model_proto(&small_sae(true)).unwrap();
        let graph = model.graph.unwrap();
        for vi in graph.input.iter().chain(&graph.output) {
            let Some(type_proto::Value::TensorType(t)) = vi.r#type.as_ref().unwrap().value.as_ref()
            else {
                panic!("expected tensor type");
            };
            let dims = &t.shape.as_ref().unwrap().dim;
            assert_eq!(
                dims[0].value,
                Some(dimension::Value::DimParam("batch_size".into()))
            );
            assert_eq!(dims[1].value, Some(dimension::Value::DimValue(16)));
        }
    }

    #[test]
    fn test_export_requires_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let err = export_sae(&small_sae(false), dir.path(), &ExportOptions::default());
        assert!(matches!(err, Err(SaeError::Uninitialized(_))));
    }

    #[test]
    fn test_external_data_split() {
        let dir = tempfile::tempdir().unwrap();
        let exported = export_sae(&small_sae(true), dir.path(), &ExportOptions::default()).unwrap();
        assert_eq!(exported.num_initializers, 5);
        // encoder.weight_t and W_dec are 4 KiB each; biases and k stay inline
        assert_eq!(exported.num_external, 2);
        let data_len = std::fs::metadata(exported.data_path.unwrap()).unwrap().len();
        assert_eq!(data_len, 2 * 16 * 64 * 4);
    }

    #[test]
    fn test_inline_export_has_no_side_file() {
        let dir = tempfile::tempdir().unwrap();
        let options = ExportOptions {
            external_data: false,
            ..Default::default()
        };
        let exported = export_sae(&small_sae(true), dir.path(), &options).unwrap();
        assert_eq!(exported.num_external, 0);
        assert!(exported.data_path.is_none());
        assert!(!dir.path().join("sae.onnx.data").exists());
    }
}
