//! ONNX graph handling without a runtime: decode, inspect, inline external
//! weights and overwrite the weight slot of a named layer.

use std::path::Path;

use anyhow::{bail, Context, Result};
use prost::Message;
use serde::Serialize;

use crate::error::StartupError;

/// ONNX protobuf messages. Field tags follow `onnx.proto` (IR version 10).
///
/// Every field of the schema is declared so a decode/encode cycle keeps the
/// whole model. Messages this crate never looks into (functions, training
/// info, sparse tensors, non-tensor types...) are held as their encoded
/// bytes, which is wire-identical to the nested message.
pub mod proto {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ModelProto {
        #[prost(int64, tag = "1")]
        pub ir_version: i64,
        #[prost(message, repeated, tag = "8")]
        pub opset_import: Vec<OperatorSetIdProto>,
        #[prost(string, tag = "2")]
        pub producer_name: String,
        #[prost(string, tag = "3")]
        pub producer_version: String,
        #[prost(string, tag = "4")]
        pub domain: String,
        #[prost(int64, tag = "5")]
        pub model_version: i64,
        #[prost(string, tag = "6")]
        pub doc_string: String,
        #[prost(message, optional, tag = "7")]
        pub graph: Option<GraphProto>,
        #[prost(message, repeated, tag = "14")]
        pub metadata_props: Vec<StringStringEntryProto>,
        /// `TrainingInfoProto`
        #[prost(bytes = "vec", repeated, tag = "20")]
        pub training_info: Vec<Vec<u8>>,
        /// `FunctionProto`
        #[prost(bytes = "vec", repeated, tag = "25")]
        pub functions: Vec<Vec<u8>>,
        /// `DeviceConfigurationProto`
        #[prost(bytes = "vec", repeated, tag = "26")]
        pub configuration: Vec<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct OperatorSetIdProto {
        #[prost(string, tag = "1")]
        pub domain: String,
        #[prost(int64, tag = "2")]
        pub version: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StringStringEntryProto {
        #[prost(string, tag = "1")]
        pub key: String,
        #[prost(string, tag = "2")]
        pub value: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GraphProto {
        #[prost(message, repeated, tag = "1")]
        pub node: Vec<NodeProto>,
        #[prost(string, tag = "2")]
        pub name: String,
        #[prost(message, repeated, tag = "5")]
        pub initializer: Vec<TensorProto>,
        /// `SparseTensorProto`
        #[prost(bytes = "vec", repeated, tag = "15")]
        pub sparse_initializer: Vec<Vec<u8>>,
        #[prost(string, tag = "10")]
        pub doc_string: String,
        #[prost(message, repeated, tag = "11")]
        pub input: Vec<ValueInfoProto>,
        #[prost(message, repeated, tag = "12")]
        pub output: Vec<ValueInfoProto>,
        #[prost(message, repeated, tag = "13")]
        pub value_info: Vec<ValueInfoProto>,
        /// `TensorAnnotation`
        #[prost(bytes = "vec", repeated, tag = "14")]
        pub quantization_annotation: Vec<Vec<u8>>,
        #[prost(message, repeated, tag = "16")]
        pub metadata_props: Vec<StringStringEntryProto>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct NodeProto {
        #[prost(string, repeated, tag = "1")]
        pub input: Vec<String>,
        #[prost(string, repeated, tag = "2")]
        pub output: Vec<String>,
        #[prost(string, tag = "3")]
        pub name: String,
        #[prost(string, tag = "4")]
        pub op_type: String,
        #[prost(string, tag = "7")]
        pub domain: String,
        #[prost(string, tag = "8")]
        pub overload: String,
        #[prost(message, repeated, tag = "5")]
        pub attribute: Vec<AttributeProto>,
        #[prost(string, tag = "6")]
        pub doc_string: String,
        #[prost(message, repeated, tag = "9")]
        pub metadata_props: Vec<StringStringEntryProto>,
        /// `NodeDeviceConfigurationProto`
        #[prost(bytes = "vec", repeated, tag = "10")]
        pub device_configurations: Vec<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AttributeProto {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "21")]
        pub ref_attr_name: String,
        #[prost(string, tag = "13")]
        pub doc_string: String,
        #[prost(int32, tag = "20")]
        pub r#type: i32,
        #[prost(float, tag = "2")]
        pub f: f32,
        #[prost(int64, tag = "3")]
        pub i: i64,
        #[prost(bytes = "vec", tag = "4")]
        pub s: Vec<u8>,
        #[prost(message, optional, tag = "5")]
        pub t: Option<TensorProto>,
        #[prost(message, optional, boxed, tag = "6")]
        pub g: Option<Box<GraphProto>>,
        /// `SparseTensorProto`
        #[prost(bytes = "vec", optional, tag = "22")]
        pub sparse_tensor: Option<Vec<u8>>,
        /// `TypeProto`
        #[prost(bytes = "vec", optional, tag = "14")]
        pub tp: Option<Vec<u8>>,
        #[prost(float, repeated, tag = "7")]
        pub floats: Vec<f32>,
        #[prost(int64, repeated, tag = "8")]
        pub ints: Vec<i64>,
        #[prost(bytes = "vec", repeated, tag = "9")]
        pub strings: Vec<Vec<u8>>,
        #[prost(message, repeated, tag = "10")]
        pub tensors: Vec<TensorProto>,
        #[prost(message, repeated, tag = "11")]
        pub graphs: Vec<GraphProto>,
        /// `SparseTensorProto`
        #[prost(bytes = "vec", repeated, tag = "23")]
        pub sparse_tensors: Vec<Vec<u8>>,
        /// `TypeProto`
        #[prost(bytes = "vec", repeated, tag = "15")]
        pub type_protos: Vec<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TensorProto {
        #[prost(int64, repeated, tag = "1")]
        pub dims: Vec<i64>,
        #[prost(int32, tag = "2")]
        pub data_type: i32,
        /// `TensorProto.Segment`
        #[prost(bytes = "vec", optional, tag = "3")]
        pub segment: Option<Vec<u8>>,
        #[prost(float, repeated, tag = "4")]
        pub float_data: Vec<f32>,
        #[prost(int32, repeated, tag = "5")]
        pub int32_data: Vec<i32>,
        #[prost(bytes = "vec", repeated, tag = "6")]
        pub string_data: Vec<Vec<u8>>,
        #[prost(int64, repeated, tag = "7")]
        pub int64_data: Vec<i64>,
        #[prost(string, tag = "8")]
        pub name: String,
        #[prost(string, tag = "12")]
        pub doc_string: String,
        #[prost(bytes = "vec", tag = "9")]
        pub raw_data: Vec<u8>,
        #[prost(message, repeated, tag = "13")]
        pub external_data: Vec<StringStringEntryProto>,
        #[prost(int32, tag = "14")]
        pub data_location: i32,
        #[prost(double, repeated, tag = "10")]
        pub double_data: Vec<f64>,
        #[prost(uint64, repeated, tag = "11")]
        pub uint64_data: Vec<u64>,
        #[prost(message, repeated, tag = "16")]
        pub metadata_props: Vec<StringStringEntryProto>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ValueInfoProto {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(message, optional, tag = "2")]
        pub r#type: Option<TypeProto>,
        #[prost(string, tag = "3")]
        pub doc_string: String,
        #[prost(message, repeated, tag = "4")]
        pub metadata_props: Vec<StringStringEntryProto>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TypeProto {
        #[prost(oneof = "type_proto::Value", tags = "1, 4, 5, 8, 9")]
        pub value: Option<type_proto::Value>,
        #[prost(string, tag = "6")]
        pub denotation: String,
    }

    pub mod type_proto {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Tensor {
            #[prost(int32, tag = "1")]
            pub elem_type: i32,
            #[prost(message, optional, tag = "2")]
            pub shape: Option<super::TensorShapeProto>,
        }

        /// Only tensor types are decoded; the rest stay encoded.
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Value {
            #[prost(message, tag = "1")]
            TensorType(Tensor),
            #[prost(bytes, tag = "4")]
            SequenceType(Vec<u8>),
            #[prost(bytes, tag = "5")]
            MapType(Vec<u8>),
            #[prost(bytes, tag = "8")]
            SparseTensorType(Vec<u8>),
            #[prost(bytes, tag = "9")]
            OptionalType(Vec<u8>),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TensorShapeProto {
        #[prost(message, repeated, tag = "1")]
        pub dim: Vec<tensor_shape_proto::Dimension>,
    }

    pub mod tensor_shape_proto {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Dimension {
            #[prost(oneof = "dimension::Value", tags = "1, 2")]
            pub value: Option<dimension::Value>,
            #[prost(string, tag = "3")]
            pub denotation: String,
        }

        pub mod dimension {
            #[derive(Clone, PartialEq, ::prost::Oneof)]
            pub enum Value {
                #[prost(int64, tag = "1")]
                DimValue(i64),
                #[prost(string, tag = "2")]
                DimParam(String),
            }
        }
    }
}

use proto::{GraphProto, ModelProto, TensorProto, ValueInfoProto};

/// `TensorProto.DataType.FLOAT`
pub const DATA_TYPE_FLOAT: i32 = 1;
/// `TensorProto.DataLocation.EXTERNAL`
pub const DATA_LOCATION_EXTERNAL: i32 = 1;
const DATA_LOCATION_DEFAULT: i32 = 0;

#[derive(Debug, Clone, Serialize)]
pub struct TensorInfo {
    pub name: String,
    pub data_type: String,
    /// `-1` marks a symbolic dimension.
    pub shape: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub op_type: String,
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInspection {
    pub ir_version: i64,
    pub opset_version: i64,
    pub producer_name: String,
    pub graph_name: String,
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
    pub nodes: Vec<GraphNode>,
    /// Initializers whose payload lives in a separate weight file.
    pub external_initializers: usize,
    pub param_count: u64,
    pub op_count: usize,
}

/// Where a patched weight ended up in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchedSlot {
    pub layer: String,
    pub initializer: String,
    pub dims: Vec<i64>,
    /// Parameter inputs past the weight slot (bias) that were unwired.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dropped_inputs: Vec<String>,
}

fn data_type_name(dt: i32) -> String {
    match dt {
        1 => "float32".into(),
        2 => "uint8".into(),
        3 => "int8".into(),
        6 => "int32".into(),
        7 => "int64".into(),
        9 => "bool".into(),
        10 => "float16".into(),
        11 => "float64".into(),
        16 => "bfloat16".into(),
        _ => format!("unknown({dt})"),
    }
}

fn value_info_to_tensor(vi: &ValueInfoProto) -> TensorInfo {
    use proto::tensor_shape_proto::dimension::Value as Dim;
    use proto::type_proto::Value;

    let (data_type, shape) = match vi.r#type.as_ref().and_then(|tp| tp.value.as_ref()) {
        Some(Value::TensorType(t)) => {
            let dims = t
                .shape
                .as_ref()
                .map(|s| {
                    s.dim
                        .iter()
                        .map(|d| match d.value {
                            Some(Dim::DimValue(v)) => v,
                            _ => -1,
                        })
                        .collect()
                })
                .unwrap_or_default();
            (data_type_name(t.elem_type), dims)
        }
        Some(Value::SequenceType(_)) => ("sequence".into(), vec![]),
        Some(Value::MapType(_)) => ("map".into(), vec![]),
        Some(Value::SparseTensorType(_)) => ("sparse_tensor".into(), vec![]),
        Some(Value::OptionalType(_)) => ("optional".into(), vec![]),
        None => ("unknown".into(), vec![]),
    };

    TensorInfo {
        name: vi.name.clone(),
        data_type,
        shape,
    }
}

fn element_count(dims: &[i64]) -> u64 {
    dims.iter().map(|&d| d.max(0) as u64).product()
}

pub fn decode_model(bytes: &[u8]) -> Result<ModelProto> {
    ModelProto::decode(bytes).context("failed to decode ONNX protobuf")
}

pub fn encode_model(model: &ModelProto) -> Vec<u8> {
    model.encode_to_vec()
}

/// Inspect an ONNX file on disk. Does not touch the inference runtime.
pub fn inspect_onnx(path: &Path) -> Result<ModelInspection> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read ONNX file: {}", path.display()))?;
    inspect_model(&decode_model(&bytes)?)
}

pub fn inspect_model(model: &ModelProto) -> Result<ModelInspection> {
    let opset_version = model
        .opset_import
        .iter()
        .filter(|op| op.domain.is_empty())
        .map(|op| op.version)
        .max()
        .unwrap_or(0);

    let graph = model.graph.as_ref().context("ONNX model has no graph")?;

    Ok(ModelInspection {
        ir_version: model.ir_version,
        opset_version,
        producer_name: model.producer_name.clone(),
        graph_name: graph.name.clone(),
        inputs: graph.input.iter().map(value_info_to_tensor).collect(),
        outputs: graph.output.iter().map(value_info_to_tensor).collect(),
        nodes: graph
            .node
            .iter()
            .map(|n| GraphNode {
                op_type: n.op_type.clone(),
                name: n.name.clone(),
                inputs: n.input.clone(),
                outputs: n.output.clone(),
            })
            .collect(),
        external_initializers: graph
            .initializer
            .iter()
            .filter(|t| t.data_location == DATA_LOCATION_EXTERNAL)
            .count(),
        param_count: graph.initializer.iter().map(|t| element_count(&t.dims)).sum(),
        op_count: graph.node.len(),
    })
}

fn external_entry<'a>(tensor: &'a TensorProto, key: &str) -> Option<&'a str> {
    tensor
        .external_data
        .iter()
        .find(|entry| entry.key == key)
        .map(|entry| entry.value.as_str())
}

/// Copy every externally stored initializer out of `blob` into `raw_data`.
///
/// Returns the number of initializers that were inlined. All external
/// references resolve against the single weight blob.
pub fn inline_external_data(model: &mut ModelProto, blob: &[u8]) -> Result<usize> {
    let graph = model.graph.as_mut().context("ONNX model has no graph")?;
    let mut inlined = 0;

    for tensor in graph
        .initializer
        .iter_mut()
        .filter(|t| t.data_location == DATA_LOCATION_EXTERNAL)
    {
        let offset = match external_entry(tensor, "offset") {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("initializer '{}': bad offset '{raw}'", tensor.name))?,
            None => 0,
        };
        let length = match external_entry(tensor, "length") {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("initializer '{}': bad length '{raw}'", tensor.name))?,
            None => blob.len().saturating_sub(offset),
        };

        let end = offset
            .checked_add(length)
            .filter(|end| *end <= blob.len());
        let Some(end) = end else {
            bail!(
                "initializer '{}' references bytes {offset}..{} but the weight file holds {} bytes",
                tensor.name,
                offset.saturating_add(length),
                blob.len()
            );
        };

        tensor.raw_data = blob[offset..end].to_vec();
        tensor.external_data.clear();
        tensor.data_location = DATA_LOCATION_DEFAULT;
        inlined += 1;
    }

    Ok(inlined)
}

pub fn float_tensor(name: &str, dims: &[i64], values: &[f32]) -> TensorProto {
    TensorProto {
        dims: dims.to_vec(),
        data_type: DATA_TYPE_FLOAT,
        name: name.to_string(),
        raw_data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ..Default::default()
    }
}

/// Read back an f32 tensor stored either as `raw_data` or `float_data`.
pub fn float_values(tensor: &TensorProto) -> Option<Vec<f32>> {
    if tensor.data_type != DATA_TYPE_FLOAT {
        return None;
    }
    if !tensor.float_data.is_empty() {
        return Some(tensor.float_data.clone());
    }
    if tensor.raw_data.len() % 4 != 0 {
        return None;
    }
    Some(
        tensor
            .raw_data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

/// Make `values` the only parameter of node `layer`.
///
/// The weight slot (second input) is overwritten and any later parameter
/// input such as a bias is unwired, so the node computes with `values`
/// alone. Unwired initializers no other node reads are removed.
///
/// An existing initializer keeps its dims but must hold exactly
/// `values.len()` elements. A slot without an initializer receives one
/// shaped `fallback_dims`; a node with only a data input gets a new
/// `{layer}_W` slot appended.
pub fn patch_layer_weights(
    graph: &mut GraphProto,
    layer: &str,
    values: &[f32],
    fallback_dims: &[i64],
) -> Result<PatchedSlot, StartupError> {
    let incompatible = |reason: String| StartupError::Incompatible {
        layer: layer.to_string(),
        reason,
    };

    let node = graph
        .node
        .iter_mut()
        .find(|n| n.name == layer)
        .ok_or_else(|| StartupError::MissingLayer(layer.to_string()))?;

    let slot = match node.input.get(1) {
        Some(name) if !name.is_empty() => name.clone(),
        _ => {
            if node.input.is_empty() {
                return Err(incompatible("node has no data input".to_string()));
            }
            let name = format!("{layer}_W");
            node.input.truncate(1);
            node.input.push(name.clone());
            name
        }
    };

    let dropped_inputs: Vec<String> = if node.input.len() > 2 {
        node.input
            .split_off(2)
            .into_iter()
            .filter(|name| !name.is_empty())
            .collect()
    } else {
        Vec::new()
    };
    for name in &dropped_inputs {
        let still_read = graph
            .node
            .iter()
            .any(|n| n.input.iter().any(|input| input == name));
        if !still_read {
            graph.initializer.retain(|t| &t.name != name);
            graph.input.retain(|vi| &vi.name != name);
        }
    }

    let existing = graph.initializer.iter().position(|t| t.name == slot);
    let dims = match existing {
        Some(index) => {
            let current = &graph.initializer[index];
            if current.data_type != DATA_TYPE_FLOAT {
                return Err(incompatible(format!(
                    "weight '{slot}' has data type {}, expected float32",
                    data_type_name(current.data_type)
                )));
            }
            current.dims.clone()
        }
        None => fallback_dims.to_vec(),
    };

    let count = element_count(&dims);
    if count != values.len() as u64 {
        return Err(incompatible(format!(
            "weight '{slot}' with dims {dims:?} holds {count} values, got {}",
            values.len()
        )));
    }

    let tensor = float_tensor(&slot, &dims, values);
    match existing {
        Some(index) => graph.initializer[index] = tensor,
        None => graph.initializer.push(tensor),
    }
    graph.input.retain(|vi| vi.name != slot);

    Ok(PatchedSlot {
        layer: layer.to_string(),
        initializer: slot,
        dims,
        dropped_inputs,
    })
}
