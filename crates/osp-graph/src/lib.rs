#![forbid(unsafe_code)]

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use core::fmt::{self, Write as _};
use osp_dtype::Dtype;
use osp_ndarray::{ShapeError, broadcast_shapes, element_count};
use osp_prims::{
    BinaryKernel, Operand, PrimError, TensorValue, UnaryKernel, binary_elementwise, cast,
    clamp_elementwise, isnan_elementwise, select_elementwise, transpose, unary_elementwise,
};
use osp_refs::{LOGIT_EPS_UNSET, RefError, RefKernel, ReferenceOperator};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

pub const GRAPH_MAGIC_PREFIX: [u8; 9] =
    [0x93, b'O', b'S', b'P', b'G', b'R', b'A', b'P', b'H'];

pub const MIN_FORMAT_VERSION: u32 = 9;
pub const MAX_FORMAT_VERSION: u32 = 17;
/// First format version at which bf16 values may flow through Sqrt nodes.
pub const BF16_SQRT_MIN_VERSION: u32 = 13;

pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
pub const PRODUCER_TAG: &str = "osp-graph";

pub const GRAPH_REASON_CODES: [&str; 15] = [
    "graph_magic_invalid",
    "graph_envelope_contract_violation",
    "graph_body_codec_invalid",
    "graph_model_contract_violation",
    "graph_dtype_descriptor_invalid",
    "graph_dtype_not_encodable",
    "graph_format_version_unsupported",
    "graph_operator_unsupported",
    "graph_dtype_unsupported_at_version",
    "graph_backend_kernel_missing",
    "graph_input_contract_violation",
    "graph_checksum_mismatch",
    "graph_result_dtype_mismatch",
    "graph_result_shape_mismatch",
    "graph_numeric_mismatch",
];

#[derive(Debug, Clone, PartialEq)]
pub enum GraphError {
    Ref(RefError),
    Prim(PrimError),
    Shape(ShapeError),
    MagicInvalid,
    EnvelopeContractViolation(&'static str),
    BodyCodecInvalid(String),
    MalformedModel(&'static str),
    UnknownDtype(String),
    DtypeNotEncodable(Dtype),
    UnsupportedFormatVersion(u32),
    UnsupportedOperator { op: String },
    UnsupportedAtVersion { op_type: String, dtype: Dtype, version: u32 },
    BackendUnsupported { op_type: String, dtype: Dtype },
    InputContractViolation(&'static str),
    ChecksumMismatch { declared: String, computed: String },
    DtypeMismatch { expected: Dtype, actual: Dtype },
    ShapeMismatch { expected: Vec<usize>, actual: Vec<usize> },
    NumericMismatch { index: usize, expected: f64, actual: f64 },
}

impl GraphError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Ref(err) => err.reason_code(),
            Self::Prim(err) => err.reason_code(),
            Self::Shape(err) => err.reason_code(),
            Self::MagicInvalid => "graph_magic_invalid",
            Self::EnvelopeContractViolation(_) => "graph_envelope_contract_violation",
            Self::BodyCodecInvalid(_) => "graph_body_codec_invalid",
            Self::MalformedModel(_) => "graph_model_contract_violation",
            Self::UnknownDtype(_) => "graph_dtype_descriptor_invalid",
            Self::DtypeNotEncodable(_) => "graph_dtype_not_encodable",
            Self::UnsupportedFormatVersion(_) => "graph_format_version_unsupported",
            Self::UnsupportedOperator { .. } => "graph_operator_unsupported",
            Self::UnsupportedAtVersion { .. } => "graph_dtype_unsupported_at_version",
            Self::BackendUnsupported { .. } => "graph_backend_kernel_missing",
            Self::InputContractViolation(_) => "graph_input_contract_violation",
            Self::ChecksumMismatch { .. } => "graph_checksum_mismatch",
            Self::DtypeMismatch { .. } => "graph_result_dtype_mismatch",
            Self::ShapeMismatch { .. } => "graph_result_shape_mismatch",
            Self::NumericMismatch { .. } => "graph_numeric_mismatch",
        }
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ref(err) => write!(f, "{err}"),
            Self::Prim(err) => write!(f, "{err}"),
            Self::Shape(err) => write!(f, "{err}"),
            Self::MagicInvalid => write!(f, "invalid or unsupported graph magic/version"),
            Self::EnvelopeContractViolation(msg) => write!(f, "{msg}"),
            Self::BodyCodecInvalid(msg) => write!(f, "body codec failure: {msg}"),
            Self::MalformedModel(msg) => write!(f, "{msg}"),
            Self::UnknownDtype(name) => write!(f, "dtype descriptor '{name}' is not recognized"),
            Self::DtypeNotEncodable(dtype) => {
                write!(f, "{dtype} values cannot be encoded in the graph format")
            }
            Self::UnsupportedFormatVersion(version) => {
                write!(
                    f,
                    "format version {version} is outside the supported \
                     {MIN_FORMAT_VERSION}..={MAX_FORMAT_VERSION} window"
                )
            }
            Self::UnsupportedOperator { op } => {
                write!(f, "operator '{op}' has no serialized graph form")
            }
            Self::UnsupportedAtVersion {
                op_type,
                dtype,
                version,
            } => {
                write!(
                    f,
                    "{op_type} does not accept {dtype} at format version {version}"
                )
            }
            Self::BackendUnsupported { op_type, dtype } => {
                write!(f, "no backend kernel for {op_type} over {dtype}")
            }
            Self::InputContractViolation(msg) => write!(f, "{msg}"),
            Self::ChecksumMismatch { declared, computed } => {
                write!(
                    f,
                    "content digest mismatch: declared {declared}, computed {computed}"
                )
            }
            Self::DtypeMismatch { expected, actual } => {
                write!(f, "result dtype {actual} does not match reference {expected}")
            }
            Self::ShapeMismatch { expected, actual } => {
                write!(
                    f,
                    "result shape {actual:?} does not match reference {expected:?}"
                )
            }
            Self::NumericMismatch {
                index,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "element {index} diverges: reference {expected}, backend {actual}"
                )
            }
        }
    }
}

impl std::error::Error for GraphError {}

// ── serialized model ────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphModel {
    pub format_version: u32,
    pub producer: String,
    pub content_digest: String,
    pub graph: GraphBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphBody {
    pub name: String,
    pub inputs: Vec<ValueInfo>,
    pub outputs: Vec<ValueInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initializers: Vec<TensorPayload>,
    pub nodes: Vec<NodeDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValueInfo {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<usize>,
}

/// Constant tensor stored inline. Payloads are base64 little-endian f64
/// planes regardless of the declared tag; the tag governs interpretation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TensorPayload {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<usize>,
    pub data_base64: String,
}

impl TensorPayload {
    pub fn from_tensor(name: &str, value: &TensorValue) -> Result<Self, GraphError> {
        let dtype = value.dtype();
        if dtype.is_complex() || dtype.is_quantized() {
            return Err(GraphError::DtypeNotEncodable(dtype));
        }
        let bytes: Vec<u8> = value
            .values()
            .iter()
            .copied()
            .flat_map(f64::to_le_bytes)
            .collect();
        Ok(Self {
            name: name.to_string(),
            dtype: dtype.name().to_string(),
            shape: value.shape().to_vec(),
            data_base64: BASE64.encode(bytes),
        })
    }

    pub fn to_tensor(&self) -> Result<TensorValue, GraphError> {
        let dtype = parse_dtype(&self.dtype)?;
        if dtype.is_complex() || dtype.is_quantized() {
            return Err(GraphError::DtypeNotEncodable(dtype));
        }
        let bytes = BASE64.decode(&self.data_base64).map_err(|_| {
            GraphError::MalformedModel("initializer payload is not valid base64")
        })?;
        if !bytes.len().is_multiple_of(8) {
            return Err(GraphError::MalformedModel(
                "initializer payload bytes must align to 8-byte elements",
            ));
        }
        let expected = element_count(&self.shape).map_err(GraphError::Shape)?;
        if bytes.len() / 8 != expected {
            return Err(GraphError::MalformedModel(
                "initializer payload length does not match declared shape",
            ));
        }
        let values: Vec<f64> = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect();
        TensorValue::new(self.shape.clone(), values, dtype).map_err(GraphError::Prim)
    }
}

fn parse_dtype(name: &str) -> Result<Dtype, GraphError> {
    Dtype::parse(name).ok_or_else(|| GraphError::UnknownDtype(name.to_string()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

/// Digest over the canonical JSON encoding of the graph body. Field order
/// is fixed by the struct layout and attribute maps are sorted, so equal
/// bodies always digest equally.
pub fn graph_digest(graph: &GraphBody) -> Result<String, GraphError> {
    let bytes =
        serde_json::to_vec(graph).map_err(|err| GraphError::BodyCodecInvalid(err.to_string()))?;
    Ok(sha256_hex(&bytes))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    F64(f64),
    I64(i64),
    Str(String),
    Ints(Vec<i64>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDef {
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttrValue>,
}

// ── envelope ────────

fn validate_envelope_version(version: (u8, u8)) -> Result<(), GraphError> {
    if version == (1, 0) || version == (2, 0) {
        Ok(())
    } else {
        Err(GraphError::MagicInvalid)
    }
}

fn envelope_length_field_size(version: (u8, u8)) -> Result<usize, GraphError> {
    match version {
        (1, 0) => Ok(2),
        (2, 0) => Ok(4),
        _ => Err(GraphError::MagicInvalid),
    }
}

pub fn validate_magic_version(payload: &[u8]) -> Result<(u8, u8), GraphError> {
    if payload.len() < GRAPH_MAGIC_PREFIX.len() + 2 {
        return Err(GraphError::MagicInvalid);
    }
    if payload[..GRAPH_MAGIC_PREFIX.len()] != GRAPH_MAGIC_PREFIX {
        return Err(GraphError::MagicInvalid);
    }
    let version = (
        payload[GRAPH_MAGIC_PREFIX.len()],
        payload[GRAPH_MAGIC_PREFIX.len() + 1],
    );
    validate_envelope_version(version)?;
    Ok(version)
}

fn write_envelope_preamble(
    buffer: &mut Vec<u8>,
    version: (u8, u8),
    body_len: usize,
) -> Result<(), GraphError> {
    buffer.extend_from_slice(&GRAPH_MAGIC_PREFIX);
    buffer.push(version.0);
    buffer.push(version.1);
    match version {
        (1, 0) => {
            let body_len = u16::try_from(body_len).map_err(|_| {
                GraphError::EnvelopeContractViolation(
                    "version 1.0 body length exceeds u16 boundary",
                )
            })?;
            buffer.extend_from_slice(&body_len.to_le_bytes());
        }
        (2, 0) => {
            let body_len = u32::try_from(body_len).map_err(|_| {
                GraphError::EnvelopeContractViolation("body length exceeds u32 boundary")
            })?;
            buffer.extend_from_slice(&body_len.to_le_bytes());
        }
        _ => return Err(GraphError::MagicInvalid),
    }
    Ok(())
}

fn read_body_span(payload: &[u8], version: (u8, u8)) -> Result<(usize, usize), GraphError> {
    let length_field_size = envelope_length_field_size(version)?;
    let offset = GRAPH_MAGIC_PREFIX.len() + 2 + length_field_size;
    let body_len = match version {
        (1, 0) => {
            if payload.len() < offset {
                return Err(GraphError::EnvelopeContractViolation(
                    "payload truncated before v1 body length field",
                ));
            }
            usize::from(u16::from_le_bytes([payload[11], payload[12]]))
        }
        (2, 0) => {
            if payload.len() < offset {
                return Err(GraphError::EnvelopeContractViolation(
                    "payload truncated before v2 body length field",
                ));
            }
            let raw = u32::from_le_bytes([payload[11], payload[12], payload[13], payload[14]]);
            usize::try_from(raw).map_err(|_| {
                GraphError::EnvelopeContractViolation(
                    "body length exceeds platform usize boundary",
                )
            })?
        }
        _ => return Err(GraphError::MagicInvalid),
    };

    if body_len == 0 || body_len > MAX_BODY_BYTES {
        return Err(GraphError::EnvelopeContractViolation(
            "body bytes must be within bounded budget",
        ));
    }
    let end = offset
        .checked_add(body_len)
        .ok_or(GraphError::EnvelopeContractViolation(
            "body offset/length overflowed",
        ))?;
    if payload.len() < end {
        return Err(GraphError::EnvelopeContractViolation(
            "payload truncated before declared body bytes",
        ));
    }
    Ok((offset, body_len))
}

/// Serializes a model into the framed envelope. Bodies that fit a u16
/// length use envelope version 1.0; larger bodies are framed as 2.0.
pub fn encode_envelope(model: &GraphModel) -> Result<Vec<u8>, GraphError> {
    let body =
        serde_json::to_vec(model).map_err(|err| GraphError::BodyCodecInvalid(err.to_string()))?;
    if body.len() > MAX_BODY_BYTES {
        return Err(GraphError::EnvelopeContractViolation(
            "body bytes must be within bounded budget",
        ));
    }
    let version = if body.len() <= usize::from(u16::MAX) {
        (1, 0)
    } else {
        (2, 0)
    };
    let mut encoded = Vec::with_capacity(
        GRAPH_MAGIC_PREFIX.len() + 2 + envelope_length_field_size(version)? + body.len(),
    );
    write_envelope_preamble(&mut encoded, version, body.len())?;
    encoded.extend_from_slice(&body);
    Ok(encoded)
}

pub fn decode_envelope(payload: &[u8]) -> Result<GraphModel, GraphError> {
    let version = validate_magic_version(payload)?;
    let (offset, body_len) = read_body_span(payload, version)?;
    let end = offset + body_len;
    if payload.len() != end {
        return Err(GraphError::EnvelopeContractViolation(
            "payload carries bytes beyond the declared body",
        ));
    }
    serde_json::from_slice(&payload[offset..end])
        .map_err(|err| GraphError::BodyCodecInvalid(err.to_string()))
}

// ── capability tables ────────

/// Whether the serialized format accepts `dtype` flowing through a node of
/// `op_type` at `version`. This is the checker-side table: refusals here
/// surface at export or validation time, before anything executes.
pub fn format_node_support(
    op_type: &str,
    dtype: Dtype,
    version: u32,
) -> Result<(), GraphError> {
    if dtype.is_complex() || dtype.is_quantized() {
        return Err(GraphError::DtypeNotEncodable(dtype));
    }
    let accepted = match op_type {
        "Sqrt" => match dtype {
            Dtype::F16 | Dtype::F32 | Dtype::F64 => true,
            Dtype::BF16 => version >= BF16_SQRT_MIN_VERSION,
            _ => false,
        },
        "Ceil" | "Log" | "Log1p" | "Clip" | "Mul" | "Div" | "Sub" | "IsNaN" => {
            matches!(dtype, Dtype::F16 | Dtype::F32 | Dtype::F64)
        }
        "Equal" | "Where" => {
            dtype.is_integer() || matches!(dtype, Dtype::F16 | Dtype::F32 | Dtype::F64)
        }
        "Transpose" | "Cast" => {
            dtype.is_boolean()
                || dtype.is_integer()
                || matches!(dtype, Dtype::F16 | Dtype::F32 | Dtype::F64)
        }
        _ => {
            return Err(GraphError::UnsupportedOperator {
                op: op_type.to_string(),
            });
        }
    };
    if accepted {
        Ok(())
    } else {
        Err(GraphError::UnsupportedAtVersion {
            op_type: op_type.to_string(),
            dtype,
            version,
        })
    }
}

/// Whether the CPU backend carries an execution kernel for `op_type` over
/// `dtype`. Narrower than the format table: a model can serialize and
/// validate yet still have no kernel to run on.
pub fn backend_node_support(op_type: &str, dtype: Dtype) -> Result<(), GraphError> {
    let accepted = match op_type {
        "Ceil" => matches!(dtype, Dtype::F16 | Dtype::F32),
        "Sqrt" | "Log" | "Log1p" | "Clip" | "Mul" | "Div" | "Sub" | "IsNaN" => {
            matches!(dtype, Dtype::F16 | Dtype::F32 | Dtype::F64)
        }
        "Equal" | "Where" => {
            dtype.is_integer() || matches!(dtype, Dtype::F16 | Dtype::F32 | Dtype::F64)
        }
        "Transpose" | "Cast" => {
            dtype.is_boolean()
                || dtype.is_integer()
                || matches!(dtype, Dtype::F16 | Dtype::F32 | Dtype::F64)
        }
        _ => {
            return Err(GraphError::UnsupportedOperator {
                op: op_type.to_string(),
            });
        }
    };
    if accepted {
        Ok(())
    } else {
        Err(GraphError::BackendUnsupported {
            op_type: op_type.to_string(),
            dtype,
        })
    }
}

fn node_arity(op_type: &str) -> Option<usize> {
    match op_type {
        "Ceil" | "Sqrt" | "Log" | "Log1p" | "IsNaN" | "Transpose" | "Cast" => Some(1),
        "Mul" | "Div" | "Sub" | "Equal" => Some(2),
        "Clip" | "Where" => Some(3),
        _ => None,
    }
}

// ── export ────────

/// Binds one reference operator plus fixed keyword arguments, mirroring a
/// single-operator forward pass. The same binding drives both the eager
/// reference path and graph export.
#[derive(Debug, Clone)]
pub struct WrapperModel<'a> {
    op: &'a ReferenceOperator,
    kwargs: Vec<(String, f64)>,
}

impl<'a> WrapperModel<'a> {
    #[must_use]
    pub fn new(op: &'a ReferenceOperator, kwargs: &[(&str, f64)]) -> Self {
        Self {
            op,
            kwargs: kwargs
                .iter()
                .map(|(key, value)| ((*key).to_string(), *value))
                .collect(),
        }
    }

    #[must_use]
    pub fn op(&self) -> &ReferenceOperator {
        self.op
    }

    pub fn forward(&self, args: &[Operand]) -> Result<TensorValue, RefError> {
        let kwargs: Vec<(&str, f64)> = self
            .kwargs
            .iter()
            .map(|(key, value)| (key.as_str(), *value))
            .collect();
        self.op.call(args, &kwargs)
    }

    pub fn export(&self, args: &[Operand], version: u32) -> Result<Vec<u8>, GraphError> {
        export_wrapper(self, args, version)
    }
}

struct GraphBuilder {
    inputs: Vec<ValueInfo>,
    initializers: Vec<TensorPayload>,
    nodes: Vec<NodeDef>,
    counter: usize,
}

impl GraphBuilder {
    fn new() -> Self {
        Self {
            inputs: Vec::new(),
            initializers: Vec::new(),
            nodes: Vec::new(),
            counter: 0,
        }
    }

    fn add_input(&mut self, name: &str, dtype: Dtype, shape: &[usize]) {
        self.inputs.push(ValueInfo {
            name: name.to_string(),
            dtype: dtype.name().to_string(),
            shape: shape.to_vec(),
        });
    }

    /// Initializers are also declared as graph inputs, so a validator sees
    /// every value name in one place.
    fn add_initializer(&mut self, name: &str, value: &TensorValue) -> Result<String, GraphError> {
        self.initializers.push(TensorPayload::from_tensor(name, value)?);
        self.add_input(name, value.dtype(), value.shape());
        Ok(name.to_string())
    }

    fn fresh(&mut self, stem: &str) -> String {
        self.counter += 1;
        format!("{stem}_{}", self.counter)
    }

    fn emit(
        &mut self,
        op_type: &str,
        inputs: Vec<String>,
        output: String,
        attributes: BTreeMap<String, AttrValue>,
    ) {
        self.nodes.push(NodeDef {
            op_type: op_type.to_string(),
            inputs,
            outputs: vec![output],
            attributes,
        });
    }

    fn finish(self, name: String, output: ValueInfo) -> GraphBody {
        GraphBody {
            name,
            inputs: self.inputs,
            outputs: vec![output],
            initializers: self.initializers,
            nodes: self.nodes,
        }
    }
}

const fn unary_node_type(kernel: UnaryKernel) -> Option<&'static str> {
    match kernel {
        UnaryKernel::Log => Some("Log"),
        UnaryKernel::Log1p => Some("Log1p"),
        UnaryKernel::Ceil => Some("Ceil"),
        UnaryKernel::Sqrt => Some("Sqrt"),
        UnaryKernel::IsNan => Some("IsNaN"),
        UnaryKernel::I0e | UnaryKernel::I1 | UnaryKernel::I1e => None,
    }
}

const fn binary_node_type(kernel: BinaryKernel) -> Option<&'static str> {
    match kernel {
        BinaryKernel::Mul => Some("Mul"),
        BinaryKernel::Div => Some("Div"),
        BinaryKernel::Sub => Some("Sub"),
        BinaryKernel::Eq => Some("Equal"),
        BinaryKernel::Zeta => None,
    }
}

fn scalar_payload(value: f64, dtype: Dtype) -> TensorValue {
    TensorValue::scalar(value, dtype)
}

fn lookup_export_kwarg(
    wrapper: &WrapperModel<'_>,
    expected: Option<&str>,
) -> Result<Option<f64>, GraphError> {
    let mut found = None;
    for (key, value) in &wrapper.kwargs {
        if expected == Some(key.as_str()) {
            found = Some(*value);
        } else {
            return Err(GraphError::Ref(RefError::InvalidArgument {
                op: wrapper.op.qualified_name(),
                detail: format!("unexpected keyword argument '{key}'"),
            }));
        }
    }
    Ok(found)
}

fn export_wrapper(
    wrapper: &WrapperModel<'_>,
    args: &[Operand],
    version: u32,
) -> Result<Vec<u8>, GraphError> {
    if !(MIN_FORMAT_VERSION..=MAX_FORMAT_VERSION).contains(&version) {
        return Err(GraphError::UnsupportedFormatVersion(version));
    }
    let op = wrapper.op;
    if args.len() != op.kernel().arity() {
        return Err(GraphError::Ref(RefError::ArityMismatch {
            op: op.qualified_name(),
            expected: op.kernel().arity(),
            actual: args.len(),
        }));
    }
    let result_dtype = op.result_dtype(args).map_err(GraphError::Ref)?;
    let template_dtype = args
        .iter()
        .find_map(Operand::as_tensor)
        .map(TensorValue::dtype)
        .unwrap_or(result_dtype);

    let mut builder = GraphBuilder::new();

    // Bind operands: tensors as free inputs, bare scalars as initializers
    // tagged like the structured side.
    let mut bound: Vec<(String, Dtype, Vec<usize>)> = Vec::new();
    for (idx, arg) in args.iter().enumerate() {
        match arg {
            Operand::Tensor(tensor) => {
                let name = format!("input_{idx}");
                builder.add_input(&name, tensor.dtype(), tensor.shape());
                bound.push((name, tensor.dtype(), tensor.shape().to_vec()));
            }
            Operand::Scalar(value) => {
                let name = format!("scalar_{idx}");
                let payload = scalar_payload(*value, template_dtype);
                builder.add_initializer(&name, &payload)?;
                bound.push((name, template_dtype, Vec::new()));
            }
        }
    }

    // Promotion casts precede the operator nodes.
    let mut staged: Vec<(String, Vec<usize>)> = Vec::new();
    for (name, dtype, shape) in &bound {
        if *dtype == result_dtype {
            staged.push((name.clone(), shape.clone()));
            continue;
        }
        format_node_support("Cast", *dtype, version)?;
        format_node_support("Cast", result_dtype, version)?;
        let cast_name = builder.fresh("cast");
        let mut attributes = BTreeMap::new();
        attributes.insert(
            "to".to_string(),
            AttrValue::Str(result_dtype.name().to_string()),
        );
        builder.emit("Cast", vec![name.clone()], cast_name.clone(), attributes);
        staged.push((cast_name, shape.clone()));
    }

    let output_name = "output_0".to_string();
    let staged_shapes: Vec<&[usize]> = staged.iter().map(|(_, shape)| shape.as_slice()).collect();
    let output_shape = match op.kernel() {
        RefKernel::Unary(_) | RefKernel::Logit => staged_shapes[0].to_vec(),
        RefKernel::Binary(_) | RefKernel::Xlog1py => {
            broadcast_shapes(&staged_shapes).map_err(GraphError::Shape)?
        }
        RefKernel::Transpose => staged_shapes[0].iter().rev().copied().collect(),
    };

    match op.kernel() {
        RefKernel::Unary(kernel) => {
            lookup_export_kwarg(wrapper, None)?;
            let op_type =
                unary_node_type(kernel).ok_or_else(|| GraphError::UnsupportedOperator {
                    op: op.qualified_name(),
                })?;
            format_node_support(op_type, result_dtype, version)?;
            builder.emit(
                op_type,
                vec![staged[0].0.clone()],
                output_name.clone(),
                BTreeMap::new(),
            );
        }
        RefKernel::Binary(kernel) => {
            lookup_export_kwarg(wrapper, None)?;
            let op_type =
                binary_node_type(kernel).ok_or_else(|| GraphError::UnsupportedOperator {
                    op: op.qualified_name(),
                })?;
            format_node_support(op_type, result_dtype, version)?;
            builder.emit(
                op_type,
                vec![staged[0].0.clone(), staged[1].0.clone()],
                output_name.clone(),
                BTreeMap::new(),
            );
        }
        RefKernel::Transpose => {
            lookup_export_kwarg(wrapper, None)?;
            format_node_support("Transpose", result_dtype, version)?;
            let mut attributes = BTreeMap::new();
            if staged_shapes[0].len() == 2 {
                attributes.insert("perm".to_string(), AttrValue::Ints(vec![1, 0]));
            }
            builder.emit(
                "Transpose",
                vec![staged[0].0.clone()],
                output_name.clone(),
                attributes,
            );
        }
        RefKernel::Logit => {
            let eps = lookup_export_kwarg(wrapper, Some("eps"))?.unwrap_or(LOGIT_EPS_UNSET);
            lower_logit(&mut builder, &staged[0].0, eps, result_dtype, version, &output_name)?;
        }
        RefKernel::Xlog1py => {
            lookup_export_kwarg(wrapper, None)?;
            lower_xlog1py(
                &mut builder,
                &staged[0].0,
                &staged[1].0,
                result_dtype,
                version,
                &output_name,
            )?;
        }
    }

    let graph = builder.finish(
        format!("{}_v{version}", op.qualified_name()),
        ValueInfo {
            name: output_name,
            dtype: result_dtype.name().to_string(),
            shape: output_shape,
        },
    );
    let model = GraphModel {
        format_version: version,
        producer: format!("{PRODUCER_TAG} {}", env!("CARGO_PKG_VERSION")),
        content_digest: graph_digest(&graph)?,
        graph,
    };
    encode_envelope(&model)
}

/// logit lowering: Clip into `[eps, 1 - eps]`, then `Log(x' / (1 - x'))`
/// through Sub and Div nodes. The clamp bounds ride along as initializers.
fn lower_logit(
    builder: &mut GraphBuilder,
    input: &str,
    eps: f64,
    dtype: Dtype,
    version: u32,
    output_name: &str,
) -> Result<(), GraphError> {
    for op_type in ["Clip", "Sub", "Div", "Log"] {
        format_node_support(op_type, dtype, version)?;
    }
    let lo = builder.add_initializer("clip_lo", &scalar_payload(eps, dtype))?;
    let hi = builder.add_initializer("clip_hi", &scalar_payload(1.0 - eps, dtype))?;
    let one = builder.add_initializer("one", &scalar_payload(1.0, dtype))?;

    let clipped = builder.fresh("clipped");
    builder.emit(
        "Clip",
        vec![input.to_string(), lo, hi],
        clipped.clone(),
        BTreeMap::new(),
    );
    let complement = builder.fresh("complement");
    builder.emit(
        "Sub",
        vec![one, clipped.clone()],
        complement.clone(),
        BTreeMap::new(),
    );
    let ratio = builder.fresh("ratio");
    builder.emit(
        "Div",
        vec![clipped, complement],
        ratio.clone(),
        BTreeMap::new(),
    );
    builder.emit(
        "Log",
        vec![ratio],
        output_name.to_string(),
        BTreeMap::new(),
    );
    Ok(())
}

/// xlog1py lowering: the zero guard and NaN override become a Where chain
/// over Equal, Log1p, Mul, and IsNaN nodes.
fn lower_xlog1py(
    builder: &mut GraphBuilder,
    lhs: &str,
    rhs: &str,
    dtype: Dtype,
    version: u32,
    output_name: &str,
) -> Result<(), GraphError> {
    for op_type in ["Equal", "Log1p", "Mul", "Where", "IsNaN"] {
        format_node_support(op_type, dtype, version)?;
    }
    let zero = builder.add_initializer("zero", &scalar_payload(0.0, dtype))?;
    let nan_fill = builder.add_initializer("nan_fill", &scalar_payload(f64::NAN, dtype))?;

    let zero_mask = builder.fresh("zero_mask");
    builder.emit(
        "Equal",
        vec![lhs.to_string(), zero.clone()],
        zero_mask.clone(),
        BTreeMap::new(),
    );
    let log1p = builder.fresh("log1p");
    builder.emit(
        "Log1p",
        vec![rhs.to_string()],
        log1p.clone(),
        BTreeMap::new(),
    );
    let product = builder.fresh("product");
    builder.emit(
        "Mul",
        vec![lhs.to_string(), log1p],
        product.clone(),
        BTreeMap::new(),
    );
    let guarded = builder.fresh("guarded");
    builder.emit(
        "Where",
        vec![zero_mask, zero, product],
        guarded.clone(),
        BTreeMap::new(),
    );
    let nan_mask = builder.fresh("nan_mask");
    builder.emit(
        "IsNaN",
        vec![rhs.to_string()],
        nan_mask.clone(),
        BTreeMap::new(),
    );
    builder.emit(
        "Where",
        vec![nan_mask, nan_fill, guarded],
        output_name.to_string(),
        BTreeMap::new(),
    );
    Ok(())
}

// ── validation ────────

#[derive(Debug, Clone, PartialEq)]
struct ValueMeta {
    dtype: Dtype,
    shape: Vec<usize>,
}

fn expect_attrs(node: &NodeDef, allowed: &[&str]) -> Result<(), GraphError> {
    for key in node.attributes.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(GraphError::MalformedModel(
                "node carries an unrecognized attribute",
            ));
        }
    }
    Ok(())
}

fn uniform_dtype(inputs: &[&ValueMeta]) -> Result<Dtype, GraphError> {
    let first = inputs[0].dtype;
    if inputs.iter().any(|meta| meta.dtype != first) {
        return Err(GraphError::MalformedModel(
            "node operands must share one dtype tag",
        ));
    }
    Ok(first)
}

fn broadcast_meta_shapes(inputs: &[&ValueMeta]) -> Result<Vec<usize>, GraphError> {
    let shapes: Vec<&[usize]> = inputs.iter().map(|meta| meta.shape.as_slice()).collect();
    broadcast_shapes(&shapes).map_err(GraphError::Shape)
}

fn infer_node_output(
    node: &NodeDef,
    inputs: &[&ValueMeta],
    version: u32,
) -> Result<ValueMeta, GraphError> {
    match node.op_type.as_str() {
        "Ceil" | "Sqrt" | "Log" | "Log1p" => {
            expect_attrs(node, &[])?;
            format_node_support(&node.op_type, inputs[0].dtype, version)?;
            Ok(ValueMeta {
                dtype: inputs[0].dtype,
                shape: inputs[0].shape.clone(),
            })
        }
        "IsNaN" => {
            expect_attrs(node, &[])?;
            format_node_support("IsNaN", inputs[0].dtype, version)?;
            Ok(ValueMeta {
                dtype: Dtype::Bool,
                shape: inputs[0].shape.clone(),
            })
        }
        "Equal" => {
            expect_attrs(node, &[])?;
            let dtype = uniform_dtype(inputs)?;
            format_node_support("Equal", dtype, version)?;
            Ok(ValueMeta {
                dtype: Dtype::Bool,
                shape: broadcast_meta_shapes(inputs)?,
            })
        }
        "Mul" | "Div" | "Sub" => {
            expect_attrs(node, &[])?;
            let dtype = uniform_dtype(inputs)?;
            format_node_support(&node.op_type, dtype, version)?;
            Ok(ValueMeta {
                dtype,
                shape: broadcast_meta_shapes(inputs)?,
            })
        }
        "Clip" => {
            expect_attrs(node, &[])?;
            let dtype = uniform_dtype(inputs)?;
            format_node_support("Clip", dtype, version)?;
            Ok(ValueMeta {
                dtype,
                shape: broadcast_meta_shapes(inputs)?,
            })
        }
        "Where" => {
            expect_attrs(node, &[])?;
            if inputs[0].dtype != Dtype::Bool {
                return Err(GraphError::MalformedModel(
                    "where condition must be bool-tagged",
                ));
            }
            let dtype = uniform_dtype(&inputs[1..])?;
            format_node_support("Where", dtype, version)?;
            Ok(ValueMeta {
                dtype,
                shape: broadcast_meta_shapes(inputs)?,
            })
        }
        "Cast" => {
            expect_attrs(node, &["to"])?;
            let Some(AttrValue::Str(target)) = node.attributes.get("to") else {
                return Err(GraphError::MalformedModel(
                    "cast node requires a string 'to' attribute",
                ));
            };
            let target = parse_dtype(target)?;
            format_node_support("Cast", inputs[0].dtype, version)?;
            format_node_support("Cast", target, version)?;
            Ok(ValueMeta {
                dtype: target,
                shape: inputs[0].shape.clone(),
            })
        }
        "Transpose" => {
            expect_attrs(node, &["perm"])?;
            let rank = inputs[0].shape.len();
            if rank > 2 {
                return Err(GraphError::MalformedModel(
                    "transpose is bounded to rank 2",
                ));
            }
            if let Some(perm) = node.attributes.get("perm") {
                let AttrValue::Ints(perm) = perm else {
                    return Err(GraphError::MalformedModel(
                        "transpose perm attribute must be an int list",
                    ));
                };
                if rank != 2 || perm.as_slice() != [1, 0] {
                    return Err(GraphError::MalformedModel(
                        "transpose perm must reverse both axes of a rank-2 value",
                    ));
                }
            }
            format_node_support("Transpose", inputs[0].dtype, version)?;
            Ok(ValueMeta {
                dtype: inputs[0].dtype,
                shape: inputs[0].shape.iter().rev().copied().collect(),
            })
        }
        _ => Err(GraphError::UnsupportedOperator {
            op: node.op_type.clone(),
        }),
    }
}

/// Structural validation. With `full`, the content digest is recomputed
/// and compared against the declared one.
pub fn check_model(model: &GraphModel, full: bool) -> Result<(), GraphError> {
    if !(MIN_FORMAT_VERSION..=MAX_FORMAT_VERSION).contains(&model.format_version) {
        return Err(GraphError::UnsupportedFormatVersion(model.format_version));
    }
    let graph = &model.graph;
    if graph.name.trim().is_empty() {
        return Err(GraphError::MalformedModel("graph name must not be empty"));
    }
    if graph.outputs.is_empty() {
        return Err(GraphError::MalformedModel(
            "graph must declare at least one output",
        ));
    }

    let mut values: BTreeMap<&str, ValueMeta> = BTreeMap::new();
    for input in &graph.inputs {
        let dtype = parse_dtype(&input.dtype)?;
        if dtype.is_complex() || dtype.is_quantized() {
            return Err(GraphError::DtypeNotEncodable(dtype));
        }
        let meta = ValueMeta {
            dtype,
            shape: input.shape.clone(),
        };
        if values.insert(input.name.as_str(), meta).is_some() {
            return Err(GraphError::MalformedModel("value name is declared twice"));
        }
    }

    let mut initializer_names: BTreeSet<&str> = BTreeSet::new();
    for initializer in &graph.initializers {
        let tensor = initializer.to_tensor()?;
        if !initializer_names.insert(initializer.name.as_str()) {
            return Err(GraphError::MalformedModel(
                "initializer name is declared twice",
            ));
        }
        let Some(meta) = values.get(initializer.name.as_str()) else {
            return Err(GraphError::MalformedModel(
                "initializer must also be declared as a graph input",
            ));
        };
        if meta.dtype != tensor.dtype() || meta.shape != tensor.shape() {
            return Err(GraphError::MalformedModel(
                "initializer disagrees with its graph input declaration",
            ));
        }
    }

    for node in &graph.nodes {
        let Some(arity) = node_arity(&node.op_type) else {
            return Err(GraphError::UnsupportedOperator {
                op: node.op_type.clone(),
            });
        };
        if node.inputs.len() != arity {
            return Err(GraphError::MalformedModel(
                "node arity does not match its operator",
            ));
        }
        if node.outputs.len() != 1 {
            return Err(GraphError::MalformedModel(
                "node must produce exactly one output",
            ));
        }
        let mut input_metas = Vec::with_capacity(node.inputs.len());
        for name in &node.inputs {
            let meta = values.get(name.as_str()).ok_or(GraphError::MalformedModel(
                "node consumes an undefined value",
            ))?;
            input_metas.push(meta);
        }
        let out_meta = infer_node_output(node, &input_metas, model.format_version)?;
        if values.insert(node.outputs[0].as_str(), out_meta).is_some() {
            return Err(GraphError::MalformedModel("value name is declared twice"));
        }
    }

    for output in &graph.outputs {
        let declared = parse_dtype(&output.dtype)?;
        let meta = values.get(output.name.as_str()).ok_or(GraphError::MalformedModel(
            "declared output is never produced",
        ))?;
        if meta.dtype != declared {
            return Err(GraphError::MalformedModel(
                "declared output dtype disagrees with the graph",
            ));
        }
        if meta.shape != output.shape {
            return Err(GraphError::MalformedModel(
                "declared output shape disagrees with the graph",
            ));
        }
    }

    if full {
        let computed = graph_digest(graph)?;
        if computed != model.content_digest {
            return Err(GraphError::ChecksumMismatch {
                declared: model.content_digest.clone(),
                computed,
            });
        }
    }
    Ok(())
}

pub fn check_bytes(payload: &[u8], full: bool) -> Result<GraphModel, GraphError> {
    let model = decode_envelope(payload)?;
    check_model(&model, full)?;
    Ok(model)
}

// ── execution ────────

fn eval_node(node: &NodeDef, inputs: &[&TensorValue]) -> Result<TensorValue, GraphError> {
    let data_dtype = match node.op_type.as_str() {
        "Where" => inputs[1].dtype(),
        _ => inputs[0].dtype(),
    };
    backend_node_support(&node.op_type, data_dtype)?;

    match node.op_type.as_str() {
        "Ceil" => unary_elementwise(UnaryKernel::Ceil, inputs[0], inputs[0].dtype()),
        "Sqrt" => unary_elementwise(UnaryKernel::Sqrt, inputs[0], inputs[0].dtype()),
        "Log" => unary_elementwise(UnaryKernel::Log, inputs[0], inputs[0].dtype()),
        "Log1p" => unary_elementwise(UnaryKernel::Log1p, inputs[0], inputs[0].dtype()),
        "IsNaN" => isnan_elementwise(inputs[0]),
        "Equal" => binary_elementwise(BinaryKernel::Eq, inputs[0], inputs[1], Dtype::Bool),
        "Mul" => binary_elementwise(BinaryKernel::Mul, inputs[0], inputs[1], inputs[0].dtype()),
        "Div" => binary_elementwise(BinaryKernel::Div, inputs[0], inputs[1], inputs[0].dtype()),
        "Sub" => binary_elementwise(BinaryKernel::Sub, inputs[0], inputs[1], inputs[0].dtype()),
        "Clip" => clamp_elementwise(inputs[0], inputs[1], inputs[2]),
        "Where" => select_elementwise(inputs[0], inputs[1], inputs[2], inputs[1].dtype()),
        "Transpose" => transpose(inputs[0]),
        "Cast" => {
            let Some(AttrValue::Str(target)) = node.attributes.get("to") else {
                return Err(GraphError::MalformedModel(
                    "cast node requires a string 'to' attribute",
                ));
            };
            let target = parse_dtype(target)?;
            backend_node_support("Cast", target)?;
            cast(inputs[0], target)
        }
        _ => {
            return Err(GraphError::UnsupportedOperator {
                op: node.op_type.clone(),
            });
        }
    }
    .map_err(GraphError::Prim)
}

/// Executes a validated model on the CPU backend. `inputs` bind to the
/// free graph inputs (those without an initializer) in declaration order.
pub fn run_model(model: &GraphModel, inputs: &[TensorValue]) -> Result<Vec<TensorValue>, GraphError> {
    check_model(model, false)?;
    let graph = &model.graph;

    let initializer_names: BTreeSet<&str> = graph
        .initializers
        .iter()
        .map(|initializer| initializer.name.as_str())
        .collect();

    let mut env: BTreeMap<&str, TensorValue> = BTreeMap::new();
    for initializer in &graph.initializers {
        env.insert(initializer.name.as_str(), initializer.to_tensor()?);
    }

    let free_inputs: Vec<&ValueInfo> = graph
        .inputs
        .iter()
        .filter(|input| !initializer_names.contains(input.name.as_str()))
        .collect();
    if free_inputs.len() != inputs.len() {
        return Err(GraphError::InputContractViolation(
            "bound input count does not match free graph inputs",
        ));
    }
    for (info, tensor) in free_inputs.iter().zip(inputs) {
        let declared = parse_dtype(&info.dtype)?;
        if tensor.dtype() != declared {
            return Err(GraphError::InputContractViolation(
                "bound input dtype does not match its declaration",
            ));
        }
        if tensor.shape() != info.shape {
            return Err(GraphError::InputContractViolation(
                "bound input shape does not match its declaration",
            ));
        }
        env.insert(info.name.as_str(), tensor.clone());
    }

    for node in &graph.nodes {
        let mut gathered = Vec::with_capacity(node.inputs.len());
        for name in &node.inputs {
            let tensor = env.get(name.as_str()).ok_or(GraphError::MalformedModel(
                "node consumes an undefined value",
            ))?;
            gathered.push(tensor);
        }
        let result = eval_node(node, &gathered)?;
        env.insert(node.outputs[0].as_str(), result);
    }

    graph
        .outputs
        .iter()
        .map(|output| {
            env.get(output.name.as_str())
                .cloned()
                .ok_or(GraphError::MalformedModel("declared output is never produced"))
        })
        .collect()
}

pub fn run_bytes(payload: &[u8], inputs: &[TensorValue]) -> Result<Vec<TensorValue>, GraphError> {
    let model = check_bytes(payload, false)?;
    run_model(&model, inputs)
}

// ── verification ────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub rtol: f64,
    pub atol: f64,
}

#[must_use]
pub fn tolerances_for(dtype: Dtype) -> Tolerance {
    match dtype {
        Dtype::F64 => Tolerance {
            rtol: 1e-7,
            atol: 1e-7,
        },
        Dtype::F32 => Tolerance {
            rtol: 1.3e-6,
            atol: 1e-5,
        },
        Dtype::F16 => Tolerance {
            rtol: 1e-3,
            atol: 1e-5,
        },
        Dtype::BF16 => Tolerance {
            rtol: 1.6e-2,
            atol: 1e-5,
        },
        _ => Tolerance {
            rtol: 0.0,
            atol: 0.0,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyOptions {
    pub check_shape: bool,
    pub check_dtype: bool,
    pub flatten: bool,
    pub recompute_digest: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            check_shape: true,
            check_dtype: true,
            flatten: true,
            recompute_digest: false,
        }
    }
}

/// Elementwise comparison under the per-dtype tolerance envelope. NaN on
/// both sides counts as agreement, as do equal infinities.
pub fn compare_tensors(
    expected: &TensorValue,
    actual: &TensorValue,
    options: &VerifyOptions,
) -> Result<(), GraphError> {
    if options.check_dtype && expected.dtype() != actual.dtype() {
        return Err(GraphError::DtypeMismatch {
            expected: expected.dtype(),
            actual: actual.dtype(),
        });
    }
    if (options.check_shape || !options.flatten) && expected.shape() != actual.shape() {
        return Err(GraphError::ShapeMismatch {
            expected: expected.shape().to_vec(),
            actual: actual.shape().to_vec(),
        });
    }
    if expected.element_count() != actual.element_count() {
        return Err(GraphError::ShapeMismatch {
            expected: expected.shape().to_vec(),
            actual: actual.shape().to_vec(),
        });
    }

    let tolerance = tolerances_for(expected.dtype());
    for (index, (&reference, &candidate)) in
        expected.values().iter().zip(actual.values()).enumerate()
    {
        if reference == candidate || (reference.is_nan() && candidate.is_nan()) {
            continue;
        }
        // Non-finite values must agree exactly. The tolerance envelope
        // applies to finite pairs only.
        if !reference.is_finite() || !candidate.is_finite() {
            return Err(GraphError::NumericMismatch {
                index,
                expected: reference,
                actual: candidate,
            });
        }
        let bound = tolerance.atol + tolerance.rtol * reference.abs();
        if (reference - candidate).abs() > bound {
            return Err(GraphError::NumericMismatch {
                index,
                expected: reference,
                actual: candidate,
            });
        }
    }
    Ok(())
}

/// End-to-end agreement check: evaluate the reference, export at
/// `version`, validate, execute on the CPU backend, and compare. Returns
/// the backend output on success.
pub fn verify(
    wrapper: &WrapperModel<'_>,
    args: &[Operand],
    version: u32,
    options: &VerifyOptions,
) -> Result<TensorValue, GraphError> {
    let reference = wrapper.forward(args).map_err(GraphError::Ref)?;
    let encoded = wrapper.export(args, version)?;
    let model = check_bytes(&encoded, options.recompute_digest)?;
    let bound: Vec<TensorValue> = args
        .iter()
        .filter_map(|arg| arg.as_tensor().cloned())
        .collect();
    let outputs = run_model(&model, &bound)?;
    let [output] = outputs.as_slice() else {
        return Err(GraphError::MalformedModel(
            "wrapper graphs produce exactly one output",
        ));
    };
    compare_tensors(&reference, output, options)?;
    Ok(output.clone())
}
