//! Structural validation of ONNX models
//!
//! Covers what the exporter can get wrong and what a consumer would reject
//! on load: versions, SSA ordering, dangling outputs, element types, payload
//! sizes, and external-data references (relative, inside the model
//! directory, within the data file's bounds). Operator semantics and shape
//! inference are out of scope.

use std::collections::HashSet;
use std::path::{Component, Path};

use prost::Message;
use tracing::debug;

use super::proto::{tensor_proto::DataType, type_proto, GraphProto, ModelProto, TensorProto};
use crate::error::{Result, SaeError};

/// Decode and check the model at `path`; external data resolves against its directory.
pub fn check_model(path: &Path) -> Result<ModelProto> {
    let bytes = std::fs::read(path)?;
    let model = ModelProto::decode(bytes.as_slice())?;
    check_model_proto(&model, path.parent())?;
    Ok(model)
}

/// Check an in-memory model. External-data bounds are verified only when
/// `base_dir` is given.
pub fn check_model_proto(model: &ModelProto, base_dir: Option<&Path>) -> Result<()> {
    if model.ir_version < 3 {
        return invalid(format!("ir_version {} is not supported", model.ir_version));
    }
    let default_opset = model
        .opset_import
        .iter()
        .find(|o| o.domain.is_empty() || o.domain == "ai.onnx");
    match default_opset {
        Some(o) if o.version >= 1 => {}
        Some(o) => return invalid(format!("invalid opset version {}", o.version)),
        None => return invalid("model does not import the default operator set"),
    }

    let graph = match &model.graph {
        Some(g) => g,
        None => return invalid("model has no graph"),
    };
    check_graph(graph, base_dir)?;
    debug!(
        "Model OK: graph '{}', {} nodes, {} initializers",
        graph.name,
        graph.node.len(),
        graph.initializer.len()
    );
    Ok(())
}

fn check_graph(graph: &GraphProto, base_dir: Option<&Path>) -> Result<()> {
    if graph.name.is_empty() {
        return invalid("graph name is empty");
    }

    let mut defined: HashSet<&str> = HashSet::new();

    for tensor in &graph.initializer {
        if tensor.name.is_empty() {
            return invalid("initializer without a name");
        }
        if !defined.insert(tensor.name.as_str()) {
            return invalid(format!("duplicate initializer '{}'", tensor.name));
        }
        check_tensor(tensor, base_dir)?;
    }

    for input in &graph.input {
        check_value_type(&input.name, input.r#type.as_ref())?;
        // Inputs may repeat an initializer name (overridable default)
        defined.insert(input.name.as_str());
    }

    for (i, node) in graph.node.iter().enumerate() {
        if node.op_type.is_empty() {
            return invalid(format!("node {i} has no op_type"));
        }
        if !(node.domain.is_empty() || node.domain == "ai.onnx") {
            return invalid(format!(
                "node '{}' uses unknown domain '{}'",
                node.name, node.domain
            ));
        }
        // Empty names mark omitted optional inputs
        for input in node.input.iter().filter(|s| !s.is_empty()) {
            if !defined.contains(input.as_str()) {
                return invalid(format!(
                    "node '{}' ({}) input '{input}' is not produced by an earlier node, \
                     an initializer, or a graph input",
                    node.name, node.op_type
                ));
            }
        }
        for output in node.output.iter().filter(|s| !s.is_empty()) {
            if !defined.insert(output.as_str()) {
                return invalid(format!(
                    "'{output}' is assigned more than once (node '{}')",
                    node.name
                ));
            }
        }
        for attr in &node.attribute {
            if let Some(t) = &attr.t {
                check_tensor(t, base_dir)?;
            }
        }
    }

    if graph.output.is_empty() {
        return invalid("graph has no outputs");
    }
    for output in &graph.output {
        check_value_type(&output.name, output.r#type.as_ref())?;
        if !defined.contains(output.name.as_str()) {
            return invalid(format!("graph output '{}' is never produced", output.name));
        }
    }
    Ok(())
}

fn check_value_type(name: &str, ty: Option<&super::proto::TypeProto>) -> Result<()> {
    if name.is_empty() {
        return invalid("graph input or output without a name");
    }
    let Some(type_proto::Value::TensorType(t)) = ty.and_then(|t| t.value.as_ref()) else {
        return invalid(format!("'{name}' has no tensor type"));
    };
    element_type(t.elem_type, name)?;
    Ok(())
}

fn element_type(raw: i32, name: &str) -> Result<DataType> {
    match DataType::try_from(raw) {
        Ok(DataType::Undefined) | Err(_) => {
            invalid(format!("'{name}' has unknown element type {raw}"))
        }
        Ok(dt) => Ok(dt),
    }
}

fn check_tensor(tensor: &TensorProto, base_dir: Option<&Path>) -> Result<()> {
    let name = if tensor.name.is_empty() {
        "<attribute tensor>"
    } else {
        tensor.name.as_str()
    };
    let dtype = element_type(tensor.data_type, name)?;
    let Some(numel) = tensor.num_elements() else {
        return invalid(format!("'{name}' has invalid dims {:?}", tensor.dims));
    };

    if tensor.is_external() {
        let Some(width) = dtype.byte_width() else {
            return invalid(format!("'{name}': external data needs a fixed-width type"));
        };
        return check_external(tensor, name, numel * width, base_dir);
    }

    if !tensor.raw_data.is_empty() {
        let Some(width) = dtype.byte_width() else {
            return invalid(format!("'{name}': raw_data needs a fixed-width type"));
        };
        if tensor.raw_data.len() != numel * width {
            return invalid(format!(
                "'{name}' raw_data has {} bytes, expected {}",
                tensor.raw_data.len(),
                numel * width
            ));
        }
        return Ok(());
    }

    let typed_len = match dtype {
        DataType::Float | DataType::Complex64 => tensor.float_data.len(),
        DataType::Double | DataType::Complex128 => tensor.double_data.len(),
        DataType::Int64 => tensor.int64_data.len(),
        DataType::Uint32 | DataType::Uint64 => tensor.uint64_data.len(),
        DataType::String => tensor.string_data.len(),
        _ => tensor.int32_data.len(),
    };
    let expected = match dtype {
        DataType::Complex64 | DataType::Complex128 => numel * 2,
        _ => numel,
    };
    if typed_len != expected {
        return invalid(format!(
            "'{name}' holds {typed_len} values, dims {:?} need {expected}",
            tensor.dims
        ));
    }
    Ok(())
}

fn check_external(
    tensor: &TensorProto,
    name: &str,
    expected_len: usize,
    base_dir: Option<&Path>,
) -> Result<()> {
    let Some(location) = tensor.external_entry("location") else {
        return invalid(format!("'{name}' is external but has no location"));
    };
    let rel = Path::new(location);
    if location.is_empty()
        || rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return invalid(format!(
            "'{name}' external location '{location}' must be a relative path inside the model directory"
        ));
    }

    let offset = parse_entry(tensor, name, "offset")?.unwrap_or(0);
    let length = parse_entry(tensor, name, "length")?.unwrap_or(expected_len as u64);
    if length != expected_len as u64 {
        return invalid(format!(
            "'{name}' external length {length} does not match {expected_len} bytes implied by dims"
        ));
    }

    if let Some(base) = base_dir {
        let path = base.join(rel);
        let file_len = match std::fs::metadata(&path) {
            Ok(m) => m.len(),
            Err(_) => {
                return invalid(format!(
                    "'{name}' external data file {} does not exist",
                    path.display()
                ))
            }
        };
        match offset.checked_add(length) {
            Some(end) if end <= file_len => {}
            _ => {
                return invalid(format!(
                    "'{name}' external range {offset}..{} exceeds {} ({file_len} bytes)",
                    offset.saturating_add(length),
                    path.display()
                ))
            }
        }
    }
    Ok(())
}

fn parse_entry(tensor: &TensorProto, name: &str, key: &str) -> Result<Option<u64>> {
    match tensor.external_entry(key) {
        None => Ok(None),
        Some(v) => v.parse().map(Some).map_err(|_| {
            SaeError::Validation(format!("'{name}' external {key} '{v}' is not an integer"))
        }),
    }
}

fn invalid<T>(msg: impl Into<String>) -> Result<T> {
    Err(SaeError::Validation(msg.into()))
}
