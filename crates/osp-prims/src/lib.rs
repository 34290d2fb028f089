#![forbid(unsafe_code)]

pub mod special;

use osp_dtype::Dtype;
use osp_ndarray::{ShapeError, broadcast_shapes, element_count};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda,
}

impl Device {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PrimError {
    Shape(ShapeError),
    InvalidInputLength { expected: usize, actual: usize },
    UnsupportedDtype { op: &'static str, dtype: Dtype },
    DeviceMismatch { lhs: Device, rhs: Device },
}

impl PrimError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Shape(_) => "prim_shape_contract_violation",
            Self::InvalidInputLength { .. } => "prim_invalid_input_length",
            Self::UnsupportedDtype { .. } => "prim_unsupported_dtype",
            Self::DeviceMismatch { .. } => "prim_device_mismatch",
        }
    }
}

impl std::fmt::Display for PrimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shape(err) => write!(f, "shape error: {err}"),
            Self::InvalidInputLength { expected, actual } => {
                write!(f, "invalid input length expected={expected} actual={actual}")
            }
            Self::UnsupportedDtype { op, dtype } => {
                write!(f, "primitive '{op}' has no kernel for dtype {dtype}")
            }
            Self::DeviceMismatch { lhs, rhs } => {
                write!(f, "operands live on different devices: {lhs} vs {rhs}")
            }
        }
    }
}

impl std::error::Error for PrimError {}

/// Dense tensor value: dtype-tagged f64 storage in row-major order, with a
/// second component plane when the tag is complex.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorValue {
    shape: Vec<usize>,
    values: Vec<f64>,
    imag: Option<Vec<f64>>,
    dtype: Dtype,
    device: Device,
}

impl TensorValue {
    pub fn new(shape: Vec<usize>, values: Vec<f64>, dtype: Dtype) -> Result<Self, PrimError> {
        Self::with_device(shape, values, dtype, Device::Cpu)
    }

    pub fn with_device(
        shape: Vec<usize>,
        values: Vec<f64>,
        dtype: Dtype,
        device: Device,
    ) -> Result<Self, PrimError> {
        let expected = element_count(&shape).map_err(PrimError::Shape)?;
        if values.len() != expected {
            return Err(PrimError::InvalidInputLength {
                expected,
                actual: values.len(),
            });
        }
        let imag = dtype.is_complex().then(|| vec![0.0; expected]);
        Ok(Self {
            shape,
            values,
            imag,
            dtype,
            device,
        })
    }

    /// Builds a complex-tagged value from explicit component planes.
    pub fn new_complex(
        shape: Vec<usize>,
        real: Vec<f64>,
        imag: Vec<f64>,
        dtype: Dtype,
    ) -> Result<Self, PrimError> {
        if !dtype.is_complex() {
            return Err(PrimError::UnsupportedDtype {
                op: "new_complex",
                dtype,
            });
        }
        if imag.len() != real.len() {
            return Err(PrimError::InvalidInputLength {
                expected: real.len(),
                actual: imag.len(),
            });
        }
        let mut out = Self::new(shape, real, dtype)?;
        out.imag = Some(imag);
        Ok(out)
    }

    #[must_use]
    pub fn scalar(value: f64, dtype: Dtype) -> Self {
        let imag = dtype.is_complex().then(|| vec![0.0]);
        Self {
            shape: Vec::new(),
            values: vec![value],
            imag,
            dtype,
            device: Device::Cpu,
        }
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[must_use]
    pub fn imag(&self) -> Option<&[f64]> {
        self.imag.as_deref()
    }

    #[must_use]
    pub const fn dtype(&self) -> Dtype {
        self.dtype
    }

    #[must_use]
    pub const fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn element_count(&self) -> usize {
        self.values.len()
    }
}

/// Operand of a reference operator: a structured value or a bare scalar.
/// Bare scalars carry no dtype or device of their own.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Tensor(TensorValue),
    Scalar(f64),
}

impl Operand {
    #[must_use]
    pub const fn is_bare_scalar(&self) -> bool {
        matches!(self, Self::Scalar(_))
    }

    #[must_use]
    pub const fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            Self::Tensor(t) => Some(t),
            Self::Scalar(_) => None,
        }
    }
}

impl From<TensorValue> for Operand {
    fn from(value: TensorValue) -> Self {
        Self::Tensor(value)
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

/// Elementwise unary kernels. The numerically nontrivial entries delegate
/// to [`special`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryKernel {
    Log,
    Log1p,
    Ceil,
    Sqrt,
    IsNan,
    I0e,
    I1,
    I1e,
}

impl UnaryKernel {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Log1p => "log1p",
            Self::Ceil => "ceil",
            Self::Sqrt => "sqrt",
            Self::IsNan => "isnan",
            Self::I0e => "i0e",
            Self::I1 => "i1",
            Self::I1e => "i1e",
        }
    }

    #[must_use]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Self::Log => x.ln(),
            Self::Log1p => x.ln_1p(),
            Self::Ceil => x.ceil(),
            Self::Sqrt => x.sqrt(),
            Self::IsNan => f64::from(x.is_nan()),
            Self::I0e => special::bessel_i0e(x),
            Self::I1 => special::bessel_i1(x),
            Self::I1e => special::bessel_i1e(x),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryKernel {
    Mul,
    Div,
    Sub,
    Eq,
    Zeta,
}

impl BinaryKernel {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Sub => "sub",
            Self::Eq => "eq",
            Self::Zeta => "zeta",
        }
    }

    #[must_use]
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            Self::Mul => lhs * rhs,
            Self::Div => lhs / rhs,
            Self::Sub => lhs - rhs,
            Self::Eq => f64::from(lhs == rhs),
            Self::Zeta => special::zeta(lhs, rhs),
        }
    }
}

fn reject_uncomputable(op: &'static str, sources: &[&TensorValue]) -> Result<(), PrimError> {
    for source in sources {
        let dtype = source.dtype();
        if dtype.is_complex() || dtype.is_quantized() {
            return Err(PrimError::UnsupportedDtype { op, dtype });
        }
    }
    Ok(())
}

fn common_device(sources: &[&TensorValue]) -> Result<Device, PrimError> {
    let mut iter = sources.iter();
    let Some(first) = iter.next() else {
        return Ok(Device::Cpu);
    };
    for source in iter {
        if source.device() != first.device() {
            return Err(PrimError::DeviceMismatch {
                lhs: first.device(),
                rhs: source.device(),
            });
        }
    }
    Ok(first.device())
}

/// Row-major strides in element units, with broadcast axes zeroed after
/// trailing alignment against the output rank.
fn aligned_axis_steps(out_ndim: usize, src_shape: &[usize]) -> Vec<usize> {
    let mut steps = vec![0usize; out_ndim];
    if src_shape.is_empty() {
        return steps;
    }

    let mut stride = 1usize;
    let offset = out_ndim - src_shape.len();
    for (idx, &dim) in src_shape.iter().enumerate().rev() {
        steps[offset + idx] = if dim == 1 { 0 } else { stride };
        stride = stride.saturating_mul(dim);
    }
    steps
}

/// Broadcast odometer over one or more sources. The output index advances
/// as an odometer while each source's flat index is adjusted incrementally
/// along zeroed or live axis steps.
fn broadcast_eval<F>(
    sources: &[&TensorValue],
    out_dtype: Dtype,
    mut emit: F,
) -> Result<TensorValue, PrimError>
where
    F: FnMut(&[f64]) -> f64,
{
    let device = common_device(sources)?;
    let shapes: Vec<&[usize]> = sources.iter().map(|s| s.shape()).collect();
    let out_shape = broadcast_shapes(&shapes).map_err(PrimError::Shape)?;
    let out_count = element_count(&out_shape).map_err(PrimError::Shape)?;

    let steps: Vec<Vec<usize>> = sources
        .iter()
        .map(|s| aligned_axis_steps(out_shape.len(), s.shape()))
        .collect();
    let mut flats = vec![0usize; sources.len()];
    let mut multi = vec![0usize; out_shape.len()];
    let mut scratch = vec![0.0f64; sources.len()];
    let mut out_values = Vec::with_capacity(out_count);

    for flat in 0..out_count {
        for ((slot, source), &src_flat) in scratch.iter_mut().zip(sources).zip(&flats) {
            *slot = source.values()[src_flat];
        }
        out_values.push(emit(&scratch));

        if flat + 1 == out_count || out_shape.is_empty() {
            continue;
        }
        for axis in (0..out_shape.len()).rev() {
            multi[axis] += 1;
            for (src_flat, src_steps) in flats.iter_mut().zip(&steps) {
                *src_flat += src_steps[axis];
            }
            if multi[axis] < out_shape[axis] {
                break;
            }
            multi[axis] = 0;
            for (src_flat, src_steps) in flats.iter_mut().zip(&steps) {
                *src_flat -= src_steps[axis] * out_shape[axis];
            }
        }
    }

    TensorValue::with_device(out_shape, out_values, out_dtype, device)
}

pub fn unary_elementwise(
    kernel: UnaryKernel,
    input: &TensorValue,
    out_dtype: Dtype,
) -> Result<TensorValue, PrimError> {
    reject_uncomputable(kernel.name(), &[input])?;
    let values = input.values().iter().map(|&v| kernel.apply(v)).collect();
    TensorValue::with_device(input.shape().to_vec(), values, out_dtype, input.device())
}

pub fn binary_elementwise(
    kernel: BinaryKernel,
    lhs: &TensorValue,
    rhs: &TensorValue,
    out_dtype: Dtype,
) -> Result<TensorValue, PrimError> {
    reject_uncomputable(kernel.name(), &[lhs, rhs])?;
    broadcast_eval(&[lhs, rhs], out_dtype, |vals| kernel.apply(vals[0], vals[1]))
}

/// `where(cond, a, b)`: nonzero condition elements select from `a`.
pub fn select_elementwise(
    cond: &TensorValue,
    on_true: &TensorValue,
    on_false: &TensorValue,
    out_dtype: Dtype,
) -> Result<TensorValue, PrimError> {
    reject_uncomputable("where", &[on_true, on_false])?;
    broadcast_eval(&[cond, on_true, on_false], out_dtype, |vals| {
        if vals[0] != 0.0 { vals[1] } else { vals[2] }
    })
}

/// `clamp(x, lo, hi)` with per-call bounds; keeps the input dtype.
pub fn clamp_elementwise(
    input: &TensorValue,
    lo: &TensorValue,
    hi: &TensorValue,
) -> Result<TensorValue, PrimError> {
    reject_uncomputable("clamp", &[input, lo, hi])?;
    broadcast_eval(&[input, lo, hi], input.dtype(), |vals| {
        let (x, lo, hi) = (vals[0], vals[1], vals[2]);
        if x < lo {
            lo
        } else if x > hi {
            hi
        } else {
            x
        }
    })
}

pub fn isnan_elementwise(input: &TensorValue) -> Result<TensorValue, PrimError> {
    unary_elementwise(UnaryKernel::IsNan, input, Dtype::Bool)
}

/// Reverses the two axes of a rank-2 value; identity on rank 0 and 1.
/// Complex tags transpose both component planes.
pub fn transpose(input: &TensorValue) -> Result<TensorValue, PrimError> {
    if input.rank() > 2 {
        return Err(PrimError::Shape(ShapeError::RankTooHigh {
            rank: input.rank(),
            max: 2,
        }));
    }
    if input.rank() < 2 {
        return Ok(input.clone());
    }

    let (rows, cols) = (input.shape()[0], input.shape()[1]);
    let swap_plane = |plane: &[f64]| {
        let mut out = Vec::with_capacity(plane.len());
        for c in 0..cols {
            for r in 0..rows {
                out.push(plane[r * cols + c]);
            }
        }
        out
    };

    let mut out = input.clone();
    out.shape = vec![cols, rows];
    out.values = swap_plane(input.values());
    out.imag = input.imag().map(swap_plane);
    Ok(out)
}

/// Retags a value, adjusting stored numbers to the target tag's semantics:
/// Bool targets collapse to 0/1, integer targets truncate toward zero,
/// real targets take the real component of complex sources.
pub fn cast(input: &TensorValue, to: Dtype) -> Result<TensorValue, PrimError> {
    if to.is_quantized() || input.dtype().is_quantized() {
        return Err(PrimError::UnsupportedDtype {
            op: "cast",
            dtype: if to.is_quantized() { to } else { input.dtype() },
        });
    }

    let convert = |v: f64| -> f64 {
        if to.is_boolean() {
            f64::from(v != 0.0)
        } else if to.is_integer() {
            v.trunc()
        } else {
            v
        }
    };

    let values: Vec<f64> = input.values().iter().map(|&v| convert(v)).collect();
    if to.is_complex() {
        let imag = match input.imag() {
            Some(plane) => plane.to_vec(),
            None => vec![0.0; values.len()],
        };
        let mut out = TensorValue::new_complex(input.shape().to_vec(), values, imag, to)?;
        out.device = input.device();
        Ok(out)
    } else {
        TensorValue::with_device(input.shape().to_vec(), values, to, input.device())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        BinaryKernel, Device, Operand, PrimError, TensorValue, UnaryKernel, binary_elementwise,
        cast, clamp_elementwise, isnan_elementwise, select_elementwise, transpose,
        unary_elementwise,
    };
    use osp_dtype::Dtype;

    fn tensor(shape: &[usize], values: &[f64], dtype: Dtype) -> TensorValue {
        TensorValue::new(shape.to_vec(), values.to_vec(), dtype).expect("tensor should build")
    }

    #[test]
    fn new_validates_element_count() {
        let err = TensorValue::new(vec![2, 2], vec![1.0, 2.0, 3.0], Dtype::F32)
            .expect_err("length mismatch");
        assert!(matches!(err, PrimError::InvalidInputLength { .. }));
        assert_eq!(err.reason_code(), "prim_invalid_input_length");
    }

    #[test]
    fn complex_construction_gets_a_zero_imaginary_plane() {
        let t = tensor(&[2], &[1.0, 2.0], Dtype::Complex64);
        assert_eq!(t.imag(), Some([0.0, 0.0].as_slice()));
    }

    #[test]
    fn log1p_stays_accurate_near_zero() {
        let x = 1e-10;
        let t = tensor(&[1], &[x], Dtype::F64);
        let out = unary_elementwise(UnaryKernel::Log1p, &t, Dtype::F64).expect("log1p");
        let naive = (1.0f64 + x).ln();
        let exact = x - x * x / 2.0;
        assert!((out.values()[0] - exact).abs() < 1e-25);
        assert!((naive - exact).abs() > (out.values()[0] - exact).abs());
    }

    #[test]
    fn binary_broadcast_matches_odometer_walk() {
        let lhs = tensor(&[2, 1], &[1.0, 2.0], Dtype::F64);
        let rhs = tensor(&[3], &[10.0, 20.0, 30.0], Dtype::F64);
        let out = binary_elementwise(BinaryKernel::Mul, &lhs, &rhs, Dtype::F64).expect("mul");
        assert_eq!(out.shape(), &[2, 3]);
        assert_eq!(out.values(), &[10.0, 20.0, 30.0, 20.0, 40.0, 60.0]);
    }

    #[test]
    fn scalar_tensor_broadcasts_against_matrix() {
        let lhs = tensor(&[2, 2], &[1.0, 2.0, 3.0, 4.0], Dtype::F32);
        let rhs = TensorValue::scalar(2.0, Dtype::F32);
        let out = binary_elementwise(BinaryKernel::Sub, &lhs, &rhs, Dtype::F32).expect("sub");
        assert_eq!(out.values(), &[-1.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn eq_produces_zero_one_values() {
        let lhs = tensor(&[3], &[1.0, 2.0, f64::NAN], Dtype::F64);
        let rhs = tensor(&[3], &[1.0, 3.0, f64::NAN], Dtype::F64);
        let out = binary_elementwise(BinaryKernel::Eq, &lhs, &rhs, Dtype::Bool).expect("eq");
        assert_eq!(out.values(), &[1.0, 0.0, 0.0]);
        assert_eq!(out.dtype(), Dtype::Bool);
    }

    #[test]
    fn where_selects_by_nonzero_condition() {
        let cond = tensor(&[3], &[1.0, 0.0, 1.0], Dtype::Bool);
        let a = tensor(&[3], &[10.0, 11.0, 12.0], Dtype::F32);
        let b = tensor(&[3], &[20.0, 21.0, 22.0], Dtype::F32);
        let out = select_elementwise(&cond, &a, &b, Dtype::F32).expect("where");
        assert_eq!(out.values(), &[10.0, 21.0, 12.0]);
    }

    #[test]
    fn clamp_respects_per_call_bounds() {
        let x = tensor(&[5], &[-1.0, 0.0, 0.5, 1.0, 2.0], Dtype::F64);
        let lo = TensorValue::scalar(0.25, Dtype::F64);
        let hi = TensorValue::scalar(0.75, Dtype::F64);
        let out = clamp_elementwise(&x, &lo, &hi).expect("clamp");
        assert_eq!(out.values(), &[0.25, 0.25, 0.5, 0.75, 0.75]);
        assert_eq!(out.dtype(), Dtype::F64);
    }

    #[test]
    fn isnan_flags_only_nans() {
        let x = tensor(&[3], &[f64::NAN, 1.0, f64::INFINITY], Dtype::F64);
        let out = isnan_elementwise(&x).expect("isnan");
        assert_eq!(out.values(), &[1.0, 0.0, 0.0]);
        assert_eq!(out.dtype(), Dtype::Bool);
    }

    #[test]
    fn complex_inputs_are_rejected_by_compute_kernels() {
        let x = tensor(&[1], &[1.0], Dtype::Complex64);
        let err = unary_elementwise(UnaryKernel::Sqrt, &x, Dtype::Complex64)
            .expect_err("no complex kernel");
        assert_eq!(err.reason_code(), "prim_unsupported_dtype");
    }

    #[test]
    fn mixed_devices_are_rejected() {
        let lhs = TensorValue::with_device(vec![1], vec![1.0], Dtype::F32, Device::Cpu)
            .expect("cpu tensor");
        let rhs = TensorValue::with_device(vec![1], vec![1.0], Dtype::F32, Device::Cuda)
            .expect("cuda tensor");
        let err =
            binary_elementwise(BinaryKernel::Mul, &lhs, &rhs, Dtype::F32).expect_err("devices");
        assert!(matches!(err, PrimError::DeviceMismatch { .. }));
    }

    #[test]
    fn transpose_swaps_matrix_axes() {
        let x = tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], Dtype::I32);
        let out = transpose(&x).expect("transpose");
        assert_eq!(out.shape(), &[3, 2]);
        assert_eq!(out.values(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn transpose_is_identity_below_rank_two() {
        let x = tensor(&[3], &[1.0, 2.0, 3.0], Dtype::Bool);
        assert_eq!(transpose(&x).expect("rank 1"), x);
        let s = TensorValue::scalar(7.0, Dtype::F64);
        assert_eq!(transpose(&s).expect("rank 0"), s);
    }

    #[test]
    fn transpose_rejects_higher_ranks() {
        let x = tensor(&[1, 1, 1], &[1.0], Dtype::F32);
        let err = transpose(&x).expect_err("rank 3");
        assert_eq!(err.reason_code(), "prim_shape_contract_violation");
    }

    #[test]
    fn transpose_moves_both_complex_planes() {
        let x = TensorValue::new_complex(
            vec![2, 2],
            vec![1.0, 2.0, 3.0, 4.0],
            vec![10.0, 20.0, 30.0, 40.0],
            Dtype::Complex128,
        )
        .expect("complex tensor");
        let out = transpose(&x).expect("transpose");
        assert_eq!(out.values(), &[1.0, 3.0, 2.0, 4.0]);
        assert_eq!(out.imag(), Some([10.0, 30.0, 20.0, 40.0].as_slice()));
    }

    #[test]
    fn cast_to_integer_truncates_toward_zero() {
        let x = tensor(&[4], &[1.9, -1.9, 0.2, -0.2], Dtype::F64);
        let out = cast(&x, Dtype::I64).expect("cast");
        assert_eq!(out.values(), &[1.0, -1.0, 0.0, -0.0]);
        assert_eq!(out.dtype(), Dtype::I64);
    }

    #[test]
    fn cast_to_bool_collapses_to_zero_one() {
        let x = tensor(&[3], &[0.0, -3.5, 2.0], Dtype::F32);
        let out = cast(&x, Dtype::Bool).expect("cast");
        assert_eq!(out.values(), &[0.0, 1.0, 1.0]);
    }

    #[test]
    fn cast_rejects_quantized_tags() {
        let x = tensor(&[1], &[1.0], Dtype::F32);
        let err = cast(&x, Dtype::QInt8).expect_err("quantized");
        assert_eq!(err.reason_code(), "prim_unsupported_dtype");
    }

    #[test]
    fn operands_report_bare_scalars() {
        let scalar = Operand::from(2.5);
        let wrapped = Operand::from(TensorValue::scalar(1.0, Dtype::F32));
        assert!(scalar.is_bare_scalar());
        assert!(!wrapped.is_bare_scalar());
        assert!(wrapped.as_tensor().is_some());
    }
}
