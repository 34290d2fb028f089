#![forbid(unsafe_code)]

use core::fmt;
use osp_dtype::Dtype;
use osp_graph::{MAX_FORMAT_VERSION, MIN_FORMAT_VERSION};
use osp_prims::Device;
use osp_refs::OpRegistry;
use std::collections::BTreeSet;
use std::ops::RangeInclusive;

pub const BOOL_DTYPES: [Dtype; 1] = [Dtype::Bool];

pub const INT_DTYPES: [Dtype; 5] = [
    Dtype::I8,
    Dtype::I16,
    Dtype::I32,
    Dtype::I64,
    Dtype::U8,
];

pub const QINT_DTYPES: [Dtype; 2] = [Dtype::QInt8, Dtype::QUInt8];

pub const FLOAT_DTYPES: [Dtype; 4] = [Dtype::F16, Dtype::F32, Dtype::F64, Dtype::BF16];

pub const COMPLEX_DTYPES: [Dtype; 3] = [
    Dtype::Complex32,
    Dtype::Complex64,
    Dtype::Complex128,
];

/// Format versions the consistency sweep covers, matching the window the
/// graph format itself accepts.
#[must_use]
pub fn tested_versions() -> RangeInclusive<u32> {
    MIN_FORMAT_VERSION..=MAX_FORMAT_VERSION
}

/// Operators under active cross-version consistency testing. Registry
/// operators outside this set are planned as skips, never as failures.
#[must_use]
pub fn allowlist() -> BTreeSet<&'static str> {
    ["ceil", "sqrt", "t"].into_iter().collect()
}

/// Coarse failure classification, compared by tag instead of by error
/// type identity. `Other` absorbs codes no tag claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    FormatRefusal,
    NotEncodable,
    BackendMissing,
    Divergence,
    Structural,
    Other,
}

impl ErrorKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::FormatRefusal => "format_refusal",
            Self::NotEncodable => "not_encodable",
            Self::BackendMissing => "backend_missing",
            Self::Divergence => "divergence",
            Self::Structural => "structural",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn classify(reason_code: &str) -> Self {
        match reason_code {
            "graph_dtype_unsupported_at_version" => Self::FormatRefusal,
            "graph_dtype_not_encodable" => Self::NotEncodable,
            "graph_backend_kernel_missing" => Self::BackendMissing,
            "graph_numeric_mismatch"
            | "graph_result_dtype_mismatch"
            | "graph_result_shape_mismatch" => Self::Divergence,
            "graph_magic_invalid"
            | "graph_envelope_contract_violation"
            | "graph_body_codec_invalid"
            | "graph_model_contract_violation"
            | "graph_checksum_mismatch" => Self::Structural,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleEffect {
    Skip,
    Xfail,
}

impl RuleEffect {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Xfail => "xfail",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionPredicate {
    Exact(u32),
    Before(u32),
    After(u32),
}

impl VersionPredicate {
    #[must_use]
    pub const fn matches(self, version: u32) -> bool {
        match self {
            Self::Exact(pinned) => version == pinned,
            Self::Before(bound) => version < bound,
            Self::After(bound) => version > bound,
        }
    }
}

impl fmt::Display for VersionPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(pinned) => write!(f, "version {pinned}"),
            Self::Before(bound) => write!(f, "versions before {bound}"),
            Self::After(bound) => write!(f, "versions after {bound}"),
        }
    }
}

/// Unconditional per-dtype decoration: skip the row entirely, or run it
/// expecting every sub-test to fail. `None` filters match everything.
#[derive(Debug, Clone)]
pub struct DecorateRule {
    pub op: &'static str,
    pub variant: &'static str,
    pub effect: RuleEffect,
    pub devices: Option<Vec<Device>>,
    pub dtypes: Option<Vec<Dtype>>,
    pub reason: &'static str,
}

impl DecorateRule {
    #[must_use]
    pub fn applies(&self, op: &str, variant: &str, device: Device, dtype: Dtype) -> bool {
        if self.op != op || self.variant != variant {
            return false;
        }
        let device_hit = self
            .devices
            .as_ref()
            .map_or(true, |devices| devices.contains(&device));
        let dtype_hit = self
            .dtypes
            .as_ref()
            .map_or(true, |dtypes| dtypes.contains(&dtype));
        device_hit && dtype_hit
    }
}

/// Version-conditional expectation: a scenario whose (version, dtype)
/// matches must fail, with the declared kind when one is given.
#[derive(Debug, Clone)]
pub struct OpsetFailRule {
    pub op: &'static str,
    pub variant: &'static str,
    pub predicates: Vec<VersionPredicate>,
    pub dtypes: Option<Vec<Dtype>>,
    pub expected_kind: Option<ErrorKind>,
    pub reason: &'static str,
}

impl OpsetFailRule {
    #[must_use]
    pub fn should_fail(&self, version: u32, dtype: Dtype) -> bool {
        self.dtype_applies(dtype)
            && self
                .predicates
                .iter()
                .any(|predicate| predicate.matches(version))
    }

    fn dtype_applies(&self, dtype: Dtype) -> bool {
        self.dtypes
            .as_ref()
            .map_or(true, |dtypes| dtypes.contains(&dtype))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    UnknownOperator { op: String, variant: String },
    OverlappingPredicates { op: String, version: u32 },
}

impl ConfigurationError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::UnknownOperator { .. } => "matrix_unknown_operator",
            Self::OverlappingPredicates { .. } => "matrix_overlapping_predicates",
        }
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOperator { op, variant } => {
                if variant.is_empty() {
                    write!(f, "rule references unknown operator '{op}'")
                } else {
                    write!(f, "rule references unknown operator '{op}.{variant}'")
                }
            }
            Self::OverlappingPredicates { op, version } => {
                write!(
                    f,
                    "opset rules for '{op}' overlap at format version {version}"
                )
            }
        }
    }
}

impl std::error::Error for ConfigurationError {}

/// The resolved skip/xfail/version-conditional table. Constructed once
/// against a registry and read-only afterwards.
#[derive(Debug, Clone)]
pub struct ConsistencyMatrix {
    decorate_rules: Vec<DecorateRule>,
    opset_rules: Vec<OpsetFailRule>,
}

impl ConsistencyMatrix {
    /// Validates every rule against the registry before anything runs.
    /// A rule naming an absent operator aborts construction, and opset
    /// predicates must agree on a single verdict per (dtype, version).
    pub fn resolve(
        registry: &OpRegistry,
        decorate_rules: Vec<DecorateRule>,
        opset_rules: Vec<OpsetFailRule>,
    ) -> Result<Self, ConfigurationError> {
        for rule in &decorate_rules {
            if registry.get(rule.op, rule.variant).is_none() {
                return Err(ConfigurationError::UnknownOperator {
                    op: rule.op.to_string(),
                    variant: rule.variant.to_string(),
                });
            }
        }
        for rule in &opset_rules {
            if registry.get(rule.op, rule.variant).is_none() {
                return Err(ConfigurationError::UnknownOperator {
                    op: rule.op.to_string(),
                    variant: rule.variant.to_string(),
                });
            }
            for version in tested_versions() {
                let hits = rule
                    .predicates
                    .iter()
                    .filter(|predicate| predicate.matches(version))
                    .count();
                if hits > 1 {
                    return Err(ConfigurationError::OverlappingPredicates {
                        op: rule.op.to_string(),
                        version,
                    });
                }
            }
        }

        // Two rules for the same operator must not both claim a
        // (dtype, version) pair.
        for (index, rule) in opset_rules.iter().enumerate() {
            for other in opset_rules.iter().skip(index + 1) {
                if rule.op != other.op || rule.variant != other.variant {
                    continue;
                }
                for version in tested_versions() {
                    let collision = all_dtypes().into_iter().any(|dtype| {
                        rule.should_fail(version, dtype) && other.should_fail(version, dtype)
                    });
                    if collision {
                        return Err(ConfigurationError::OverlappingPredicates {
                            op: rule.op.to_string(),
                            version,
                        });
                    }
                }
            }
        }

        Ok(Self {
            decorate_rules,
            opset_rules,
        })
    }

    /// The standard rule tables resolved against `registry`.
    pub fn standard(registry: &OpRegistry) -> Result<Self, ConfigurationError> {
        Self::resolve(registry, expected_decorate_rules(), expected_opset_rules())
    }

    /// First declared rule matching the row, in declaration order.
    #[must_use]
    pub fn decoration_for(
        &self,
        op: &str,
        variant: &str,
        device: Device,
        dtype: Dtype,
    ) -> Option<&DecorateRule> {
        self.decorate_rules
            .iter()
            .find(|rule| rule.applies(op, variant, device, dtype))
    }

    #[must_use]
    pub fn opset_rule_for(
        &self,
        op: &str,
        variant: &str,
        version: u32,
        dtype: Dtype,
    ) -> Option<&OpsetFailRule> {
        self.opset_rules.iter().find(|rule| {
            rule.op == op && rule.variant == variant && rule.should_fail(version, dtype)
        })
    }

    #[must_use]
    pub fn decorate_rules(&self) -> &[DecorateRule] {
        &self.decorate_rules
    }

    #[must_use]
    pub fn opset_rules(&self) -> &[OpsetFailRule] {
        &self.opset_rules
    }
}

fn all_dtypes() -> Vec<Dtype> {
    let mut dtypes = Vec::new();
    dtypes.extend(BOOL_DTYPES);
    dtypes.extend(INT_DTYPES);
    dtypes.extend(FLOAT_DTYPES);
    dtypes.extend(QINT_DTYPES);
    dtypes.extend(COMPLEX_DTYPES);
    dtypes
}

fn unsupported_row_dtypes(groups: &[&[Dtype]]) -> Vec<Dtype> {
    groups.iter().flat_map(|group| group.iter().copied()).collect()
}

/// The standing skip/xfail table for the allowlisted operators.
#[must_use]
pub fn expected_decorate_rules() -> Vec<DecorateRule> {
    vec![
        DecorateRule {
            op: "ceil",
            variant: "",
            effect: RuleEffect::Xfail,
            devices: None,
            dtypes: Some(vec![Dtype::BF16, Dtype::F64]),
            reason: "ceil is not implemented for f64 and bf16 on the execution backend",
        },
        DecorateRule {
            op: "ceil",
            variant: "",
            effect: RuleEffect::Skip,
            devices: None,
            dtypes: Some(unsupported_row_dtypes(&[
                &BOOL_DTYPES,
                &INT_DTYPES,
                &QINT_DTYPES,
                &COMPLEX_DTYPES,
            ])),
            reason: "not supported by the graph backend",
        },
        DecorateRule {
            op: "sqrt",
            variant: "",
            effect: RuleEffect::Skip,
            devices: None,
            dtypes: Some(unsupported_row_dtypes(&[
                &BOOL_DTYPES,
                &QINT_DTYPES,
                &COMPLEX_DTYPES,
            ])),
            reason: "not supported by the graph backend",
        },
        DecorateRule {
            op: "t",
            variant: "",
            effect: RuleEffect::Xfail,
            devices: None,
            dtypes: Some(unsupported_row_dtypes(&[&[Dtype::BF16], &COMPLEX_DTYPES])),
            reason: "transpose is not implemented for bf16 and complex tags in the graph format",
        },
    ]
}

/// Version-conditional expectations for the allowlisted operators.
#[must_use]
pub fn expected_opset_rules() -> Vec<OpsetFailRule> {
    vec![OpsetFailRule {
        op: "sqrt",
        variant: "",
        predicates: vec![VersionPredicate::Before(13)],
        dtypes: Some(vec![Dtype::BF16]),
        expected_kind: Some(ErrorKind::FormatRefusal),
        reason: "sqrt is not defined for bf16 before format version 13",
    }]
}

#[cfg(test)]
mod tests {
    use super::{
        COMPLEX_DTYPES, ConfigurationError, ConsistencyMatrix, DecorateRule, ErrorKind,
        FLOAT_DTYPES, INT_DTYPES, OpsetFailRule, RuleEffect, VersionPredicate, all_dtypes,
        allowlist, expected_decorate_rules, expected_opset_rules, tested_versions,
    };
    use osp_dtype::Dtype;
    use osp_prims::Device;
    use osp_refs::OpRegistry;
    use proptest::prelude::*;

    #[test]
    fn standard_tables_resolve_against_the_registry() {
        let registry = OpRegistry::standard();
        let matrix = ConsistencyMatrix::standard(&registry).expect("standard matrix");
        assert_eq!(matrix.decorate_rules().len(), 4);
        assert_eq!(matrix.opset_rules().len(), 1);
    }

    #[test]
    fn rules_naming_absent_operators_abort_construction() {
        let registry = OpRegistry::standard();
        let rule = DecorateRule {
            op: "softmax",
            variant: "",
            effect: RuleEffect::Skip,
            devices: None,
            dtypes: None,
            reason: "unused",
        };
        let err = ConsistencyMatrix::resolve(&registry, vec![rule], Vec::new())
            .expect_err("unknown operator");
        assert_eq!(err.reason_code(), "matrix_unknown_operator");
        assert!(matches!(err, ConfigurationError::UnknownOperator { .. }));
    }

    #[test]
    fn overlapping_predicates_within_one_rule_are_rejected() {
        let registry = OpRegistry::standard();
        let rule = OpsetFailRule {
            op: "sqrt",
            variant: "",
            predicates: vec![VersionPredicate::Before(13), VersionPredicate::Exact(10)],
            dtypes: Some(vec![Dtype::BF16]),
            expected_kind: None,
            reason: "unused",
        };
        let err = ConsistencyMatrix::resolve(&registry, Vec::new(), vec![rule])
            .expect_err("overlap");
        assert_eq!(err.reason_code(), "matrix_overlapping_predicates");
    }

    #[test]
    fn overlapping_rules_across_declarations_are_rejected() {
        let registry = OpRegistry::standard();
        let first = OpsetFailRule {
            op: "sqrt",
            variant: "",
            predicates: vec![VersionPredicate::Before(13)],
            dtypes: Some(vec![Dtype::BF16]),
            expected_kind: None,
            reason: "unused",
        };
        let second = OpsetFailRule {
            op: "sqrt",
            variant: "",
            predicates: vec![VersionPredicate::Exact(11)],
            dtypes: None,
            expected_kind: None,
            reason: "unused",
        };
        let err = ConsistencyMatrix::resolve(&registry, Vec::new(), vec![first, second])
            .expect_err("cross-rule overlap");
        assert_eq!(
            err,
            ConfigurationError::OverlappingPredicates {
                op: "sqrt".to_string(),
                version: 11,
            }
        );
    }

    #[test]
    fn the_bf16_sqrt_rule_fails_exactly_below_thirteen() {
        let rules = expected_opset_rules();
        let rule = &rules[0];
        for version in tested_versions() {
            assert_eq!(rule.should_fail(version, Dtype::BF16), version < 13);
            assert!(!rule.should_fail(version, Dtype::F32));
        }
    }

    #[test]
    fn at_most_one_decoration_applies_per_row() {
        let rules = expected_decorate_rules();
        for op in allowlist() {
            for dtype in all_dtypes() {
                let hits = rules
                    .iter()
                    .filter(|rule| rule.applies(op, "", Device::Cpu, dtype))
                    .count();
                assert!(hits <= 1, "{op} {dtype} matched {hits} rules");
            }
        }
    }

    #[test]
    fn device_filters_narrow_rule_application() {
        let rule = DecorateRule {
            op: "sqrt",
            variant: "",
            effect: RuleEffect::Skip,
            devices: Some(vec![Device::Cuda]),
            dtypes: None,
            reason: "unused",
        };
        assert!(rule.applies("sqrt", "", Device::Cuda, Dtype::F32));
        assert!(!rule.applies("sqrt", "", Device::Cpu, Dtype::F32));
    }

    #[test]
    fn version_predicates_partition_as_declared() {
        assert!(VersionPredicate::Exact(11).matches(11));
        assert!(!VersionPredicate::Exact(11).matches(12));
        assert!(VersionPredicate::Before(13).matches(12));
        assert!(!VersionPredicate::Before(13).matches(13));
        assert!(VersionPredicate::After(15).matches(16));
        assert!(!VersionPredicate::After(15).matches(15));
    }

    #[test]
    fn classification_tags_cover_the_graph_reason_codes() {
        assert_eq!(
            ErrorKind::classify("graph_dtype_unsupported_at_version"),
            ErrorKind::FormatRefusal
        );
        assert_eq!(
            ErrorKind::classify("graph_dtype_not_encodable"),
            ErrorKind::NotEncodable
        );
        assert_eq!(
            ErrorKind::classify("graph_backend_kernel_missing"),
            ErrorKind::BackendMissing
        );
        assert_eq!(
            ErrorKind::classify("graph_numeric_mismatch"),
            ErrorKind::Divergence
        );
        assert_eq!(
            ErrorKind::classify("graph_checksum_mismatch"),
            ErrorKind::Structural
        );
        assert_eq!(ErrorKind::classify("ref_arity_mismatch"), ErrorKind::Other);
    }

    #[test]
    fn dtype_groups_hold_the_documented_tags() {
        assert_eq!(INT_DTYPES.len(), 5);
        assert_eq!(FLOAT_DTYPES.len(), 4);
        assert_eq!(COMPLEX_DTYPES.len(), 3);
        assert!(INT_DTYPES.contains(&Dtype::U8));
        assert!(FLOAT_DTYPES.contains(&Dtype::BF16));
        assert_eq!(allowlist().len(), 3);
        assert!(allowlist().contains("t"));
    }

    proptest! {
        #[test]
        fn prop_should_fail_is_deterministic_and_windowed(version in 0u32..40) {
            let rules = expected_opset_rules();
            let rule = &rules[0];
            let first = rule.should_fail(version, Dtype::BF16);
            let second = rule.should_fail(version, Dtype::BF16);
            prop_assert_eq!(first, second);
            prop_assert_eq!(first, version < 13);
            prop_assert!(!rule.should_fail(version, Dtype::F64));
        }
    }
}
