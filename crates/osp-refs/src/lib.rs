#![forbid(unsafe_code)]

use osp_dtype::{Dtype, PromotionError, PromotionKind, promote};
use osp_prims::{
    BinaryKernel, Device, Operand, PrimError, TensorValue, UnaryKernel, binary_elementwise,
    clamp_elementwise, isnan_elementwise, select_elementwise, transpose, unary_elementwise,
};
use std::collections::{BTreeMap, BTreeSet};

/// Sentinel for an unset `logit` eps. A negative eps never clamps: the
/// bounds `lo = eps` and `hi = 1 - eps` bracket the whole unit interval.
pub const LOGIT_EPS_UNSET: f64 = -1.0;

#[derive(Debug, Clone, PartialEq)]
pub enum RefError {
    Promotion(PromotionError),
    Prim(PrimError),
    InvalidArgument { op: String, detail: String },
    ArityMismatch { op: String, expected: usize, actual: usize },
    OutputMismatch {
        expected_dtype: Dtype,
        expected_shape: Vec<usize>,
        actual_dtype: Dtype,
        actual_shape: Vec<usize>,
    },
    UnknownOperator { name: String },
}

impl RefError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Promotion(err) => err.reason_code(),
            Self::Prim(err) => err.reason_code(),
            Self::InvalidArgument { .. } => "ref_invalid_argument",
            Self::ArityMismatch { .. } => "ref_arity_mismatch",
            Self::OutputMismatch { .. } => "ref_output_mismatch",
            Self::UnknownOperator { .. } => "ref_unknown_operator",
        }
    }
}

impl std::fmt::Display for RefError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Promotion(err) => write!(f, "promotion failed: {err}"),
            Self::Prim(err) => write!(f, "primitive failed: {err}"),
            Self::InvalidArgument { op, detail } => {
                write!(f, "invalid argument to '{op}': {detail}")
            }
            Self::ArityMismatch {
                op,
                expected,
                actual,
            } => {
                write!(f, "'{op}' expects {expected} operands, got {actual}")
            }
            Self::OutputMismatch {
                expected_dtype,
                expected_shape,
                actual_dtype,
                actual_shape,
            } => {
                write!(
                    f,
                    "out buffer {actual_dtype}{actual_shape:?} incompatible with result \
                     {expected_dtype}{expected_shape:?}"
                )
            }
            Self::UnknownOperator { name } => write!(f, "unknown operator '{name}'"),
        }
    }
}

impl std::error::Error for RefError {}

/// Computation attached to a reference operator. Unary/Binary entries are
/// single primitive kernels; the rest are composites expressed through the
/// primitive set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKernel {
    Unary(UnaryKernel),
    Binary(BinaryKernel),
    Transpose,
    Logit,
    Xlog1py,
}

impl RefKernel {
    #[must_use]
    pub const fn arity(self) -> usize {
        match self {
            Self::Unary(_) | Self::Transpose | Self::Logit => 1,
            Self::Binary(_) | Self::Xlog1py => 2,
        }
    }
}

/// A named reference operator. Built once at registry construction and
/// immutable afterwards; `call` is per-invocation.
#[derive(Debug, Clone)]
pub struct ReferenceOperator {
    name: &'static str,
    variant: &'static str,
    canonical: &'static str,
    kernel: RefKernel,
    promotion: PromotionKind,
    supported_dtypes: BTreeSet<Dtype>,
}

impl ReferenceOperator {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn variant(&self) -> &'static str {
        self.variant
    }

    /// Canonical operator identity this reference decomposes.
    #[must_use]
    pub const fn canonical(&self) -> &'static str {
        self.canonical
    }

    #[must_use]
    pub const fn kernel(&self) -> RefKernel {
        self.kernel
    }

    #[must_use]
    pub const fn promotion(&self) -> PromotionKind {
        self.promotion
    }

    #[must_use]
    pub fn supported_dtypes(&self) -> &BTreeSet<Dtype> {
        &self.supported_dtypes
    }

    #[must_use]
    pub fn supports(&self, dtype: Dtype) -> bool {
        self.supported_dtypes.contains(&dtype)
    }

    #[must_use]
    pub fn qualified_name(&self) -> String {
        if self.variant.is_empty() {
            self.name.to_string()
        } else {
            format!("{}.{}", self.name, self.variant)
        }
    }

    /// Result dtype this call will produce, per the operator's promotion
    /// kind over the structured operands.
    pub fn result_dtype(&self, args: &[Operand]) -> Result<Dtype, RefError> {
        let dtypes: Vec<Dtype> = args
            .iter()
            .filter_map(|arg| arg.as_tensor().map(TensorValue::dtype))
            .collect();
        if dtypes.is_empty() {
            return Err(RefError::InvalidArgument {
                op: self.qualified_name(),
                detail: "at least one operand must be a structured value".to_string(),
            });
        }
        promote(self.promotion, &dtypes).map_err(RefError::Promotion)
    }

    pub fn call(&self, args: &[Operand], kwargs: &[(&str, f64)]) -> Result<TensorValue, RefError> {
        if args.len() != self.kernel.arity() {
            return Err(RefError::ArityMismatch {
                op: self.qualified_name(),
                expected: self.kernel.arity(),
                actual: args.len(),
            });
        }
        let result_dtype = self.result_dtype(args)?;
        let tensors = self.materialize_operands(args)?;

        match self.kernel {
            RefKernel::Unary(kernel) => {
                expect_no_kwargs(self, kwargs)?;
                unary_elementwise(kernel, &tensors[0], result_dtype).map_err(RefError::Prim)
            }
            RefKernel::Binary(kernel) => {
                expect_no_kwargs(self, kwargs)?;
                binary_elementwise(kernel, &tensors[0], &tensors[1], result_dtype)
                    .map_err(RefError::Prim)
            }
            RefKernel::Transpose => {
                expect_no_kwargs(self, kwargs)?;
                transpose(&tensors[0]).map_err(RefError::Prim)
            }
            RefKernel::Logit => {
                let eps = lookup_kwarg(self, kwargs, "eps")?.unwrap_or(LOGIT_EPS_UNSET);
                logit_composite(&tensors[0], eps, result_dtype)
            }
            RefKernel::Xlog1py => {
                expect_no_kwargs(self, kwargs)?;
                xlog1py_composite(&tensors[0], &tensors[1], result_dtype)
            }
        }
    }

    /// `call` writing into a caller-supplied buffer. The buffer's dtype and
    /// shape must match the computed result exactly.
    pub fn call_into(
        &self,
        args: &[Operand],
        kwargs: &[(&str, f64)],
        out: &mut TensorValue,
    ) -> Result<(), RefError> {
        let result = self.call(args, kwargs)?;
        if out.dtype() != result.dtype() || out.shape() != result.shape() {
            return Err(RefError::OutputMismatch {
                expected_dtype: result.dtype(),
                expected_shape: result.shape().to_vec(),
                actual_dtype: out.dtype(),
                actual_shape: out.shape().to_vec(),
            });
        }
        *out = result;
        Ok(())
    }

    /// Bare scalars take the dtype and device of the structured side.
    fn materialize_operands(&self, args: &[Operand]) -> Result<Vec<TensorValue>, RefError> {
        let template = args
            .iter()
            .find_map(Operand::as_tensor)
            .map(|t| (t.dtype(), t.device()));
        let Some((dtype, device)) = template else {
            return Err(RefError::InvalidArgument {
                op: self.qualified_name(),
                detail: "at least one operand must be a structured value".to_string(),
            });
        };

        args.iter()
            .map(|arg| match arg {
                Operand::Tensor(t) => Ok(t.clone()),
                Operand::Scalar(v) => scalar_like(*v, dtype, device).map_err(RefError::Prim),
            })
            .collect()
    }
}

fn scalar_like(value: f64, dtype: Dtype, device: Device) -> Result<TensorValue, PrimError> {
    TensorValue::with_device(Vec::new(), vec![value], dtype, device)
}

fn expect_no_kwargs(op: &ReferenceOperator, kwargs: &[(&str, f64)]) -> Result<(), RefError> {
    match kwargs.first() {
        None => Ok(()),
        Some((key, _)) => Err(RefError::InvalidArgument {
            op: op.qualified_name(),
            detail: format!("unexpected keyword argument '{key}'"),
        }),
    }
}

fn lookup_kwarg(
    op: &ReferenceOperator,
    kwargs: &[(&str, f64)],
    expected: &str,
) -> Result<Option<f64>, RefError> {
    let mut found = None;
    for (key, value) in kwargs {
        if *key == expected {
            found = Some(*value);
        } else {
            return Err(RefError::InvalidArgument {
                op: op.qualified_name(),
                detail: format!("unexpected keyword argument '{key}'"),
            });
        }
    }
    Ok(found)
}

/// `logit(x, eps)`: clamp to `[eps, 1 - eps]`, then `log(x' / (1 - x'))`.
fn logit_composite(x: &TensorValue, eps: f64, result_dtype: Dtype) -> Result<TensorValue, RefError> {
    let device = x.device();
    let lo = scalar_like(eps, x.dtype(), device).map_err(RefError::Prim)?;
    let hi = scalar_like(1.0 - eps, x.dtype(), device).map_err(RefError::Prim)?;
    let clamped = clamp_elementwise(x, &lo, &hi).map_err(RefError::Prim)?;

    let one = scalar_like(1.0, result_dtype, device).map_err(RefError::Prim)?;
    let complement =
        binary_elementwise(BinaryKernel::Sub, &one, &clamped, result_dtype).map_err(RefError::Prim)?;
    let ratio = binary_elementwise(BinaryKernel::Div, &clamped, &complement, result_dtype)
        .map_err(RefError::Prim)?;
    unary_elementwise(UnaryKernel::Log, &ratio, result_dtype).map_err(RefError::Prim)
}

/// `xlog1py(a, b) = where(isnan(b), nan, where(a == 0, 0, a * log1p(b)))`.
/// The NaN propagation from `b` overrides the zero guard on `a`.
fn xlog1py_composite(
    a: &TensorValue,
    b: &TensorValue,
    result_dtype: Dtype,
) -> Result<TensorValue, RefError> {
    let device = a.device();
    let zero_input = scalar_like(0.0, a.dtype(), device).map_err(RefError::Prim)?;
    let a_is_zero =
        binary_elementwise(BinaryKernel::Eq, a, &zero_input, Dtype::Bool).map_err(RefError::Prim)?;

    let log1p_b = unary_elementwise(UnaryKernel::Log1p, b, result_dtype).map_err(RefError::Prim)?;
    let product =
        binary_elementwise(BinaryKernel::Mul, a, &log1p_b, result_dtype).map_err(RefError::Prim)?;

    let zero_result = scalar_like(0.0, result_dtype, device).map_err(RefError::Prim)?;
    let guarded = select_elementwise(&a_is_zero, &zero_result, &product, result_dtype)
        .map_err(RefError::Prim)?;

    let b_is_nan = isnan_elementwise(b).map_err(RefError::Prim)?;
    let nan = scalar_like(f64::NAN, result_dtype, device).map_err(RefError::Prim)?;
    select_elementwise(&b_is_nan, &nan, &guarded, result_dtype).map_err(RefError::Prim)
}

/// Immutable operator registry: constructed once, then only read.
#[derive(Debug, Clone)]
pub struct OpRegistry {
    ops: BTreeMap<String, ReferenceOperator>,
    decompositions: BTreeMap<&'static str, String>,
}

impl OpRegistry {
    /// The full registry of reference operators this crate defines.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self {
            ops: BTreeMap::new(),
            decompositions: BTreeMap::new(),
        };

        let int_float = int_float_dtypes();
        let bool_int_float = bool_int_float_dtypes();
        let with_wide_complex = {
            let mut set = bool_int_float_dtypes();
            set.insert(Dtype::Complex64);
            set.insert(Dtype::Complex128);
            set
        };

        registry.register(ReferenceOperator {
            name: "ceil",
            variant: "",
            canonical: "ops.ceil",
            kernel: RefKernel::Unary(UnaryKernel::Ceil),
            promotion: PromotionKind::NoPromotion,
            supported_dtypes: int_float.clone(),
        });
        registry.register(ReferenceOperator {
            name: "sqrt",
            variant: "",
            canonical: "ops.sqrt",
            kernel: RefKernel::Unary(UnaryKernel::Sqrt),
            promotion: PromotionKind::IntToFloat,
            supported_dtypes: with_wide_complex.clone(),
        });
        registry.register(ReferenceOperator {
            name: "t",
            variant: "",
            canonical: "ops.t",
            kernel: RefKernel::Transpose,
            promotion: PromotionKind::NoPromotion,
            supported_dtypes: with_wide_complex,
        });
        registry.register(ReferenceOperator {
            name: "log",
            variant: "",
            canonical: "ops.log",
            kernel: RefKernel::Unary(UnaryKernel::Log),
            promotion: PromotionKind::IntToFloat,
            supported_dtypes: bool_int_float.clone(),
        });
        registry.register(ReferenceOperator {
            name: "log1p",
            variant: "",
            canonical: "ops.log1p",
            kernel: RefKernel::Unary(UnaryKernel::Log1p),
            promotion: PromotionKind::IntToFloat,
            supported_dtypes: bool_int_float.clone(),
        });
        registry.register(ReferenceOperator {
            name: "logit",
            variant: "",
            canonical: "ops.logit",
            kernel: RefKernel::Logit,
            promotion: PromotionKind::IntToFloat,
            supported_dtypes: bool_int_float.clone(),
        });
        registry.register(ReferenceOperator {
            name: "xlog1py",
            variant: "",
            canonical: "special.xlog1py",
            kernel: RefKernel::Xlog1py,
            promotion: PromotionKind::IntToFloat,
            supported_dtypes: bool_int_float.clone(),
        });
        registry.register(ReferenceOperator {
            name: "zeta",
            variant: "",
            canonical: "special.zeta",
            kernel: RefKernel::Binary(BinaryKernel::Zeta),
            promotion: PromotionKind::IntToFloat,
            supported_dtypes: bool_int_float.clone(),
        });
        registry.register(ReferenceOperator {
            name: "i0e",
            variant: "",
            canonical: "special.i0e",
            kernel: RefKernel::Unary(UnaryKernel::I0e),
            promotion: PromotionKind::IntToFloat,
            supported_dtypes: bool_int_float.clone(),
        });
        registry.register(ReferenceOperator {
            name: "i1",
            variant: "",
            canonical: "special.i1",
            kernel: RefKernel::Unary(UnaryKernel::I1),
            promotion: PromotionKind::IntToFloat,
            supported_dtypes: bool_int_float.clone(),
        });
        registry.register(ReferenceOperator {
            name: "i1e",
            variant: "",
            canonical: "special.i1e",
            kernel: RefKernel::Unary(UnaryKernel::I1e),
            promotion: PromotionKind::IntToFloat,
            supported_dtypes: bool_int_float,
        });

        registry
    }

    fn register(&mut self, op: ReferenceOperator) {
        self.decompositions
            .insert(op.canonical, op.qualified_name());
        self.ops.insert(op.qualified_name(), op);
    }

    #[must_use]
    pub fn get(&self, name: &str, variant: &str) -> Option<&ReferenceOperator> {
        let key = if variant.is_empty() {
            name.to_string()
        } else {
            format!("{name}.{variant}")
        };
        self.ops.get(&key)
    }

    /// Looks up by reference-operator name first, then by canonical
    /// identity through the decomposition index.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<&ReferenceOperator> {
        if let Some(op) = self.ops.get(name) {
            return Some(op);
        }
        self.decomposition_of(name)
    }

    #[must_use]
    pub fn decomposition_of(&self, canonical: &str) -> Option<&ReferenceOperator> {
        let key = self.decompositions.get(canonical)?;
        self.ops.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReferenceOperator> {
        self.ops.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

fn int_float_dtypes() -> BTreeSet<Dtype> {
    [
        Dtype::U8,
        Dtype::I8,
        Dtype::I16,
        Dtype::I32,
        Dtype::I64,
        Dtype::F16,
        Dtype::F32,
        Dtype::F64,
        Dtype::BF16,
    ]
    .into_iter()
    .collect()
}

fn bool_int_float_dtypes() -> BTreeSet<Dtype> {
    let mut set = int_float_dtypes();
    set.insert(Dtype::Bool);
    set
}
