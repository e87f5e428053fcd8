//! Replay runtime for exported SAE graphs
//!
//! Evaluates a checked model node by node with candle. Only the operators
//! the exporter emits are implemented; anything else fails with
//! [`SaeError::UnsupportedOp`]. Indices flow as I64 tensors as in ONNX.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use prost::Message;
use tracing::{debug, info};

use super::checker::check_model_proto;
use super::proto::{tensor_proto::DataType, GraphProto, ModelProto, NodeProto, TensorProto};
use super::{INPUT_NAME, OUTPUT_NAME};
use crate::error::{Result, SaeError};

/// A loaded model ready to run.
pub struct OnnxSession {
    graph: GraphProto,
    initializers: HashMap<String, Tensor>,
    device: Device,
}

impl OnnxSession {
    /// Load, check and materialize the model at `path` on the CPU.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_on(path, &Device::Cpu)
    }

    pub fn load_on(path: &Path, device: &Device) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let model = ModelProto::decode(bytes.as_slice())?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        check_model_proto(&model, Some(&base_dir))?;
        let graph = model
            .graph
            .ok_or_else(|| SaeError::Validation("model has no graph".into()))?;

        let mut initializers = HashMap::with_capacity(graph.initializer.len());
        for proto in &graph.initializer {
            let tensor = tensor_from_proto(proto, &base_dir, device)?;
            initializers.insert(proto.name.clone(), tensor);
        }
        info!(
            "Loaded {} ({} nodes, {} initializers)",
            path.display(),
            graph.node.len(),
            initializers.len()
        );

        Ok(Self {
            graph,
            initializers,
            device: device.clone(),
        })
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.graph.input.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.graph.output.iter().map(|v| v.name.as_str()).collect()
    }

    /// Run the graph on named inputs and return every graph output.
    pub fn run(&self, feeds: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
        let mut values: HashMap<String, Tensor> = self.initializers.clone();
        for input in &self.graph.input {
            match feeds.get(&input.name) {
                Some(t) => {
                    values.insert(input.name.clone(), t.to_device(&self.device)?);
                }
                None if values.contains_key(&input.name) => {}
                None => {
                    return Err(SaeError::InvalidConfig(format!(
                        "missing graph input '{}'",
                        input.name
                    )))
                }
            }
        }

        for node in &self.graph.node {
            let inputs = node
                .input
                .iter()
                .map(|name| {
                    values.get(name).ok_or_else(|| {
                        SaeError::Validation(format!("value '{name}' is undefined"))
                    })
                })
                .collect::<Result<Vec<&Tensor>>>()?;
            let outputs = eval_node(node, &inputs)?;
            debug!("{} -> {:?}", node.name, outputs.iter().map(|t| t.dims().to_vec()).collect::<Vec<_>>());
            for (name, tensor) in node.output.iter().zip(outputs) {
                values.insert(name.clone(), tensor);
            }
        }

        self.graph
            .output
            .iter()
            .map(|o| {
                values
                    .remove(&o.name)
                    .map(|t| (o.name.clone(), t))
                    .ok_or_else(|| SaeError::Validation(format!("output '{}' not produced", o.name)))
            })
            .collect()
    }

    /// Feed `input` to the single SAE input and return `sae_out`.
    pub fn run_sae(&self, input: &Tensor) -> Result<Tensor> {
        let feeds = HashMap::from([(INPUT_NAME.to_string(), input.to_dtype(DType::F32)?)]);
        let mut outputs = self.run(feeds)?;
        outputs
            .remove(OUTPUT_NAME)
            .ok_or_else(|| SaeError::Validation(format!("graph has no '{OUTPUT_NAME}' output")))
    }
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

fn eval_node(node: &NodeProto, inputs: &[&Tensor]) -> Result<Vec<Tensor>> {
    let arity = |n: usize| -> Result<()> {
        if inputs.len() < n {
            Err(SaeError::Validation(format!(
                "{} '{}' needs {n} inputs, got {}",
                node.op_type,
                node.name,
                inputs.len()
            )))
        } else {
            Ok(())
        }
    };

    let out = match node.op_type.as_str() {
        "Sub" => {
            arity(2)?;
            inputs[0].broadcast_sub(inputs[1])?
        }
        "Add" => {
            arity(2)?;
            inputs[0].broadcast_add(inputs[1])?
        }
        "MatMul" => {
            arity(2)?;
            inputs[0].broadcast_matmul(inputs[1])?
        }
        "Relu" => {
            arity(1)?;
            inputs[0].relu()?
        }
        "TopK" => {
            arity(2)?;
            return top_k(node, inputs[0], inputs[1]);
        }
        "Shape" => {
            arity(1)?;
            let dims: Vec<i64> = inputs[0].dims().iter().map(|&d| d as i64).collect();
            Tensor::new(dims.as_slice(), inputs[0].device())?
        }
        "ConstantOfShape" => {
            arity(1)?;
            constant_of_shape(node, inputs[0])?
        }
        "ScatterElements" => {
            arity(3)?;
            scatter_elements(node, inputs[0], inputs[1], inputs[2])?
        }
        other => return Err(SaeError::UnsupportedOp(other.to_string())),
    };
    Ok(vec![out])
}

fn top_k(node: &NodeProto, x: &Tensor, k: &Tensor) -> Result<Vec<Tensor>> {
    let axis = normalize_axis(node.attr_int("axis", -1), x.rank())?;
    if axis + 1 != x.rank() {
        return Err(SaeError::UnsupportedOp(format!("TopK(axis={axis})")));
    }
    if node.attr_int("largest", 1) != 1 {
        return Err(SaeError::UnsupportedOp("TopK(largest=0)".into()));
    }
    let k = k.flatten_all()?.to_vec1::<i64>()?;
    let k = match k.as_slice() {
        [k] if *k >= 0 => *k as usize,
        _ => {
            return Err(SaeError::Validation(format!(
                "TopK '{}' expects a single non-negative k",
                node.name
            )))
        }
    };
    let (values, indices) = crate::sae::top_k_last_dim(x, k)?;
    Ok(vec![values, indices.to_dtype(DType::I64)?])
}

fn constant_of_shape(node: &NodeProto, shape: &Tensor) -> Result<Tensor> {
    let dims: Vec<usize> = shape
        .to_vec1::<i64>()?
        .into_iter()
        .map(|d| usize::try_from(d).map_err(|_| SaeError::Validation(format!("negative dim {d}"))))
        .collect::<Result<_>>()?;

    let (dtype, value) = match node.attr("value").and_then(|a| a.t.as_ref()) {
        None => (DType::F32, 0.0),
        Some(t) => {
            let v = tensor_from_proto(t, Path::new(""), &Device::Cpu)?
                .flatten_all()?
                .to_dtype(DType::F64)?
                .to_vec1::<f64>()?;
            let dtype = candle_dtype(t.data_type, &t.name)?;
            (dtype, v.first().copied().unwrap_or(0.0))
        }
    };
    let zeros = Tensor::zeros(dims, dtype, shape.device())?;
    if value == 0.0 {
        Ok(zeros)
    } else {
        Ok(((zeros.ones_like()? * value)?).to_dtype(dtype)?)
    }
}

/// Overwrite semantics (no `reduction`). Indices repeated along `axis` are
/// rejected since the gather/scatter_add evaluation is only exact for unique ones.
fn scatter_elements(
    node: &NodeProto,
    data: &Tensor,
    indices: &Tensor,
    updates: &Tensor,
) -> Result<Tensor> {
    if let Some(r) = node.attr("reduction") {
        if !r.s.is_empty() && r.s != b"none" {
            return Err(SaeError::UnsupportedOp(format!(
                "ScatterElements(reduction={})",
                String::from_utf8_lossy(&r.s)
            )));
        }
    }
    let axis = normalize_axis(node.attr_int("axis", 0), data.rank())?;
    let indices = indices.to_dtype(DType::I64)?.contiguous()?;
    check_unique_along(&indices, axis, &node.name)?;
    let updates = updates.to_dtype(data.dtype())?.contiguous()?;
    let data = data.contiguous()?;
    let current = data.gather(&indices, axis)?;
    Ok(data.scatter_add(&indices, &(updates - current)?, axis)?)
}

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

fn check_unique_along(indices: &Tensor, axis: usize, node_name: &str) -> Result<()> {
    let last = indices.rank() - 1;
    let rows = if axis == last {
        indices.clone()
    } else {
        indices.transpose(axis, last)?.contiguous()?
    };
    let width = rows.dim(last)?;
    if width == 0 {
        return Ok(());
    }
    let n_rows = rows.elem_count() / width;
    let rows = rows.reshape((n_rows, width))?.to_vec2::<i64>()?;
    for row in &rows {
        let mut seen = HashSet::with_capacity(row.len());
        if let Some(dup) = row.iter().find(|&&i| !seen.insert(i)) {
            return Err(SaeError::UnsupportedOp(format!(
                "ScatterElements '{node_name}' with duplicate index {dup}"
            )));
        }
    }
    Ok(())
}

fn normalize_axis(axis: i64, rank: usize) -> Result<usize> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    if (0..rank as i64).contains(&resolved) {
        Ok(resolved as usize)
    } else {
        Err(SaeError::Validation(format!(
            "axis {axis} out of range for rank {rank}"
        )))
    }
}

fn candle_dtype(raw: i32, name: &str) -> Result<DType> {
    match DataType::try_from(raw) {
        Ok(DataType::Float) => Ok(DType::F32),
        Ok(DataType::Double) => Ok(DType::F64),
        Ok(DataType::Float16) => Ok(DType::F16),
        Ok(DataType::Bfloat16) => Ok(DType::BF16),
        Ok(DataType::Int64) | Ok(DataType::Int32) => Ok(DType::I64),
        Ok(DataType::Uint8) | Ok(DataType::Bool) => Ok(DType::U8),
        Ok(DataType::Uint32) => Ok(DType::U32),
        _ => Err(SaeError::UnsupportedOp(format!(
            "element type {raw} of '{name}'"
        ))),
    }
}

/// Materialize an initializer, reading external data relative to `base_dir`.
fn tensor_from_proto(proto: &TensorProto, base_dir: &Path, device: &Device) -> Result<Tensor> {
    let dtype = candle_dtype(proto.data_type, &proto.name)?;
    let shape: Vec<usize> = proto.dims.iter().map(|&d| d as usize).collect();
    let onnx_type = DataType::try_from(proto.data_type).unwrap_or(DataType::Undefined);

    let raw = if proto.is_external() {
        Some(read_external(proto, base_dir)?)
    } else if !proto.raw_data.is_empty() {
        Some(proto.raw_data.clone())
    } else {
        None
    };

    match (raw, onnx_type) {
        // INT32 payloads are widened to I64
        (Some(bytes), DataType::Int32) => {
            let values: Vec<i64> = bytes
                .chunks_exact(4)
                .map(|c| i64::from(i32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                .collect();
            Ok(Tensor::from_vec(values, shape, device)?)
        }
        (Some(bytes), _) => Ok(Tensor::from_raw_buffer(&bytes, dtype, &shape, device)?),
        (None, DataType::Float) => Ok(Tensor::from_vec(proto.float_data.clone(), shape, device)?),
        (None, DataType::Double) => {
            Ok(Tensor::from_vec(proto.double_data.clone(), shape, device)?)
        }
        (None, DataType::Int64) => Ok(Tensor::from_vec(proto.int64_data.clone(), shape, device)?),
        (None, DataType::Int32) => {
            let values: Vec<i64> = proto.int32_data.iter().map(|&v| i64::from(v)).collect();
            Ok(Tensor::from_vec(values, shape, device)?)
        }
        (None, other) => Err(SaeError::UnsupportedOp(format!(
            "typed payload {other:?} of '{}'",
            proto.name
        ))),
    }
}

fn read_external(proto: &TensorProto, base_dir: &Path) -> Result<Vec<u8>> {
    use std::io::{Read, Seek, SeekFrom};

    let location = proto
        .external_entry("location")
        .ok_or_else(|| SaeError::Validation(format!("'{}' has no location", proto.name)))?;
    let offset: u64 = proto
        .external_entry("offset")
        .map_or(Ok(0), str::parse)
        .map_err(|_| SaeError::Validation(format!("'{}' has a bad offset", proto.name)))?;
    let length: usize = match proto.external_entry("length") {
        Some(v) => v
            .parse()
            .map_err(|_| SaeError::Validation(format!("'{}' has a bad length", proto.name)))?,
        None => {
            let width = DataType::try_from(proto.data_type)
                .ok()
                .and_then(DataType::byte_width)
                .unwrap_or(0);
            proto.num_elements().unwrap_or(0) * width
        }
    };

    let path: PathBuf = base_dir.join(location);
    let mut file = std::fs::File::open(&path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; length];
    file.read_exact(&mut buf)?;
    Ok(buf)
}
