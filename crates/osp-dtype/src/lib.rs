#![forbid(unsafe_code)]

/// Semantic dtype tags for tensor values and graph tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dtype {
    Bool,
    U8,
    I8,
    I16,
    I32,
    I64,
    F16,
    F32,
    F64,
    BF16,
    QInt8,
    QUInt8,
    Complex32,
    Complex64,
    Complex128,
}

impl Dtype {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::U8 => "u8",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F16 => "f16",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::BF16 => "bf16",
            Self::QInt8 => "qint8",
            Self::QUInt8 => "quint8",
            Self::Complex32 => "c32",
            Self::Complex64 => "c64",
            Self::Complex128 => "c128",
        }
    }

    #[must_use]
    pub const fn item_size(self) -> usize {
        match self {
            Self::Bool | Self::U8 | Self::I8 | Self::QInt8 | Self::QUInt8 => 1,
            Self::I16 | Self::F16 | Self::BF16 => 2,
            Self::I32 | Self::F32 | Self::Complex32 => 4,
            Self::I64 | Self::F64 | Self::Complex64 => 8,
            Self::Complex128 => 16,
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "bool" => Some(Self::Bool),
            "u8" | "uint8" => Some(Self::U8),
            "i8" | "int8" => Some(Self::I8),
            "i16" | "int16" => Some(Self::I16),
            "i32" | "int32" => Some(Self::I32),
            "i64" | "int64" => Some(Self::I64),
            "f16" | "float16" | "half" => Some(Self::F16),
            "f32" | "float32" => Some(Self::F32),
            "f64" | "float64" | "double" => Some(Self::F64),
            "bf16" | "bfloat16" => Some(Self::BF16),
            "qint8" => Some(Self::QInt8),
            "quint8" => Some(Self::QUInt8),
            "c32" | "complex32" => Some(Self::Complex32),
            "c64" | "complex64" => Some(Self::Complex64),
            "c128" | "complex128" => Some(Self::Complex128),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_boolean(self) -> bool {
        matches!(self, Self::Bool)
    }

    /// Returns `true` for signed or unsigned integer tags (not Bool, not quantized).
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(self, Self::U8 | Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F16 | Self::F32 | Self::F64 | Self::BF16)
    }

    #[must_use]
    pub const fn is_complex(self) -> bool {
        matches!(self, Self::Complex32 | Self::Complex64 | Self::Complex128)
    }

    #[must_use]
    pub const fn is_quantized(self) -> bool {
        matches!(self, Self::QInt8 | Self::QUInt8)
    }

    /// The two 16-bit floating formats that verification backends commonly
    /// restrict or refuse.
    #[must_use]
    pub const fn is_reduced_precision_float(self) -> bool {
        matches!(self, Self::F16 | Self::BF16)
    }

    /// The real dtype carrying one component of a complex value.
    /// Non-complex tags map to themselves.
    #[must_use]
    pub const fn corresponding_real_dtype(self) -> Self {
        match self {
            Self::Complex32 => Self::F16,
            Self::Complex64 => Self::F32,
            Self::Complex128 => Self::F64,
            other => other,
        }
    }

    /// The complex dtype whose component width absorbs this floating tag.
    /// BF16 has no 16-bit complex counterpart and widens to Complex64.
    #[must_use]
    pub const fn corresponding_complex_dtype(self) -> Self {
        match self {
            Self::F16 => Self::Complex32,
            Self::F32 | Self::BF16 => Self::Complex64,
            Self::F64 => Self::Complex128,
            other => other,
        }
    }

    /// The framework-default floating dtype used when integers widen.
    #[must_use]
    pub const fn default_float() -> Self {
        Self::F32
    }
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Promotion policy attached to each reference operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromotionKind {
    /// Result is the common dtype of the operands.
    NoPromotion,
    /// Boolean/integer inputs widen to the default float; floating inputs
    /// keep their common floating dtype.
    IntToFloat,
    /// Complex inputs contribute their component dtype.
    ComplexToRealPart,
    /// Result is always Bool (comparisons, predicates).
    AlwaysBool,
}

impl PromotionKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NoPromotion => "no_promotion",
            Self::IntToFloat => "int_to_float",
            Self::ComplexToRealPart => "complex_to_real_part",
            Self::AlwaysBool => "always_bool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionError {
    TypeMismatch { lhs: Dtype, rhs: Dtype },
    UnsupportedDtype { kind: PromotionKind, dtype: Option<Dtype> },
}

impl PromotionError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::UnsupportedDtype { .. } => "unsupported_dtype",
        }
    }
}

impl std::fmt::Display for PromotionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TypeMismatch { lhs, rhs } => {
                write!(f, "dtypes {lhs} and {rhs} have no common dtype")
            }
            Self::UnsupportedDtype {
                kind,
                dtype: Some(dtype),
            } => {
                write!(f, "no {} rule covers dtype {dtype}", kind.name())
            }
            Self::UnsupportedDtype { kind, dtype: None } => {
                write!(f, "{} requires at least one operand dtype", kind.name())
            }
        }
    }
}

impl std::error::Error for PromotionError {}

/// Deterministic two-operand promotion lattice.
///
/// Category order is Bool < integer < floating < complex; the highest
/// category present wins and widths join within it. Cross-category joins
/// keep the higher category's width (`i64 + f16 -> f16`). The two 16-bit
/// floating formats have no common 16-bit dtype and join to F32.
/// Quantized tags only join with themselves.
pub const fn common_dtype(lhs: Dtype, rhs: Dtype) -> Result<Dtype, PromotionError> {
    use Dtype::*;

    let joined = match (lhs, rhs) {
        (a, b) if a as u8 == b as u8 => a,
        (QInt8 | QUInt8, _) | (_, QInt8 | QUInt8) => {
            return Err(PromotionError::TypeMismatch { lhs, rhs });
        }
        (Bool, x) | (x, Bool) => x,

        // Integer joins. U8 is the only unsigned width; mixing it with a
        // signed tag needs the next signed width that covers 0..=255.
        (U8, I8) | (I8, U8) | (U8, I16) | (I16, U8) => I16,
        (U8, I32) | (I32, U8) => I32,
        (U8, I64) | (I64, U8) => I64,
        (I8, I16) | (I16, I8) => I16,
        (I8 | I16, I32) | (I32, I8 | I16) => I32,
        (I8 | I16 | I32, I64) | (I64, I8 | I16 | I32) => I64,

        // Floating joins. F16 and BF16 widen past each other to F32.
        (F16, BF16) | (BF16, F16) => F32,
        (F16 | BF16, F32) | (F32, F16 | BF16) => F32,
        (F16 | BF16 | F32, F64) | (F64, F16 | BF16 | F32) => F64,

        // Integer + floating keeps the floating width.
        (f, i) | (i, f) if f.is_float() && i.is_integer() => f,

        // Complex joins widen within the complex widths.
        (Complex32, Complex64) | (Complex64, Complex32) => Complex64,
        (Complex32 | Complex64, Complex128) | (Complex128, Complex32 | Complex64) => Complex128,

        // Complex + floating joins the wider of the complex tag and the
        // float's complex counterpart; complex + integer keeps the complex.
        (c, o) | (o, c) if c.is_complex() && o.is_float() => {
            match common_dtype(c, o.corresponding_complex_dtype()) {
                Ok(joined) => joined,
                Err(err) => return Err(err),
            }
        }
        (c, o) | (o, c) if c.is_complex() && o.is_integer() => c,

        _ => return Err(PromotionError::TypeMismatch { lhs, rhs }),
    };

    Ok(joined)
}

/// Computes the result dtype for an operator's promotion kind over its
/// operand dtypes. Pure; the same inputs always yield the same answer.
pub fn promote(kind: PromotionKind, operands: &[Dtype]) -> Result<Dtype, PromotionError> {
    let Some((&first, rest)) = operands.split_first() else {
        return Err(PromotionError::UnsupportedDtype { kind, dtype: None });
    };

    if let Some(&quantized) = operands.iter().find(|d| d.is_quantized()) {
        // Quantized tags never participate in promotion; identical
        // operands under NoPromotion are the only lawful case.
        let uniform = operands.iter().all(|&d| d == quantized);
        if matches!(kind, PromotionKind::NoPromotion) && uniform {
            return Ok(quantized);
        }
        return Err(PromotionError::UnsupportedDtype {
            kind,
            dtype: Some(quantized),
        });
    }

    match kind {
        PromotionKind::NoPromotion => rest.iter().try_fold(first, |acc, &d| common_dtype(acc, d)),
        PromotionKind::IntToFloat => {
            let common = rest.iter().try_fold(first, |acc, &d| common_dtype(acc, d))?;
            if common.is_boolean() || common.is_integer() {
                Ok(Dtype::default_float())
            } else {
                Ok(common)
            }
        }
        PromotionKind::ComplexToRealPart => {
            let first = first.corresponding_real_dtype();
            rest.iter()
                .try_fold(first, |acc, &d| common_dtype(acc, d.corresponding_real_dtype()))
        }
        PromotionKind::AlwaysBool => Ok(Dtype::Bool),
    }
}

#[cfg(test)]
mod tests {
    use super::{Dtype, PromotionError, PromotionKind, common_dtype, promote};

    #[test]
    fn names_parse_back_to_the_same_tag() {
        let all = [
            Dtype::Bool,
            Dtype::U8,
            Dtype::I8,
            Dtype::I16,
            Dtype::I32,
            Dtype::I64,
            Dtype::F16,
            Dtype::F32,
            Dtype::F64,
            Dtype::BF16,
            Dtype::QInt8,
            Dtype::QUInt8,
            Dtype::Complex32,
            Dtype::Complex64,
            Dtype::Complex128,
        ];
        for dtype in all {
            assert_eq!(Dtype::parse(dtype.name()), Some(dtype), "{dtype}");
        }
        assert_eq!(Dtype::parse("bfloat16"), Some(Dtype::BF16));
        assert_eq!(Dtype::parse("void"), None);
    }

    #[test]
    fn item_sizes_match_component_widths() {
        assert_eq!(Dtype::BF16.item_size(), 2);
        assert_eq!(Dtype::Complex32.item_size(), 4);
        assert_eq!(Dtype::Complex128.item_size(), 16);
    }

    #[test]
    fn bool_is_the_weakest_tag() {
        assert_eq!(common_dtype(Dtype::Bool, Dtype::I16), Ok(Dtype::I16));
        assert_eq!(common_dtype(Dtype::BF16, Dtype::Bool), Ok(Dtype::BF16));
        assert_eq!(common_dtype(Dtype::Bool, Dtype::Bool), Ok(Dtype::Bool));
    }

    #[test]
    fn unsigned_signed_joins_need_a_covering_width() {
        assert_eq!(common_dtype(Dtype::U8, Dtype::I8), Ok(Dtype::I16));
        assert_eq!(common_dtype(Dtype::U8, Dtype::I64), Ok(Dtype::I64));
        assert_eq!(common_dtype(Dtype::I16, Dtype::I32), Ok(Dtype::I32));
    }

    #[test]
    fn mixed_sixteen_bit_floats_join_to_f32() {
        assert_eq!(common_dtype(Dtype::F16, Dtype::BF16), Ok(Dtype::F32));
        assert_eq!(common_dtype(Dtype::BF16, Dtype::BF16), Ok(Dtype::BF16));
    }

    #[test]
    fn integer_float_joins_keep_the_float_width() {
        assert_eq!(common_dtype(Dtype::I64, Dtype::F16), Ok(Dtype::F16));
        assert_eq!(common_dtype(Dtype::U8, Dtype::F64), Ok(Dtype::F64));
    }

    #[test]
    fn complex_absorbs_floats_by_component_width() {
        assert_eq!(
            common_dtype(Dtype::Complex64, Dtype::F64),
            Ok(Dtype::Complex128)
        );
        assert_eq!(
            common_dtype(Dtype::Complex64, Dtype::BF16),
            Ok(Dtype::Complex64)
        );
        assert_eq!(
            common_dtype(Dtype::Complex32, Dtype::I64),
            Ok(Dtype::Complex32)
        );
    }

    #[test]
    fn quantized_tags_do_not_join_other_tags() {
        let err = common_dtype(Dtype::QInt8, Dtype::F32).expect_err("should mismatch");
        assert!(matches!(err, PromotionError::TypeMismatch { .. }));
        assert_eq!(err.reason_code(), "type_mismatch");
        assert_eq!(common_dtype(Dtype::QInt8, Dtype::QInt8), Ok(Dtype::QInt8));
    }

    #[test]
    fn int_to_float_widens_integer_only_inputs_to_the_default_float() {
        for dtype in [Dtype::Bool, Dtype::U8, Dtype::I8, Dtype::I32, Dtype::I64] {
            assert_eq!(
                promote(PromotionKind::IntToFloat, &[dtype]),
                Ok(Dtype::default_float()),
                "{dtype}"
            );
        }
    }

    #[test]
    fn int_to_float_keeps_the_widest_float_when_present() {
        assert_eq!(
            promote(PromotionKind::IntToFloat, &[Dtype::I64, Dtype::F16]),
            Ok(Dtype::F16)
        );
        assert_eq!(
            promote(PromotionKind::IntToFloat, &[Dtype::F32, Dtype::Complex64]),
            Ok(Dtype::Complex64)
        );
    }

    #[test]
    fn complex_to_real_part_maps_components() {
        assert_eq!(
            promote(PromotionKind::ComplexToRealPart, &[Dtype::Complex128]),
            Ok(Dtype::F64)
        );
        assert_eq!(
            promote(
                PromotionKind::ComplexToRealPart,
                &[Dtype::Complex64, Dtype::F64]
            ),
            Ok(Dtype::F64)
        );
    }

    #[test]
    fn always_bool_ignores_operand_widths() {
        assert_eq!(
            promote(PromotionKind::AlwaysBool, &[Dtype::F64, Dtype::I8]),
            Ok(Dtype::Bool)
        );
    }

    #[test]
    fn empty_operand_lists_are_rejected() {
        let err = promote(PromotionKind::NoPromotion, &[]).expect_err("should reject");
        assert_eq!(err.reason_code(), "unsupported_dtype");
    }

    #[test]
    fn quantized_operands_are_rejected_outside_identity() {
        let err =
            promote(PromotionKind::IntToFloat, &[Dtype::QUInt8]).expect_err("should reject");
        assert!(matches!(err, PromotionError::UnsupportedDtype { .. }));
        assert_eq!(
            promote(PromotionKind::NoPromotion, &[Dtype::QUInt8, Dtype::QUInt8]),
            Ok(Dtype::QUInt8)
        );
    }

    #[test]
    fn promotion_is_symmetric_over_operand_order() {
        let pairs = [
            (Dtype::U8, Dtype::I8),
            (Dtype::F16, Dtype::BF16),
            (Dtype::I64, Dtype::Complex64),
            (Dtype::F64, Dtype::Complex64),
        ];
        for (a, b) in pairs {
            assert_eq!(common_dtype(a, b), common_dtype(b, a), "{a} vs {b}");
        }
    }
}
