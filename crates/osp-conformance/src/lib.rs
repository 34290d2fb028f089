#![forbid(unsafe_code)]

pub mod matrix;
pub mod runner;

use crate::matrix::tested_versions;
use osp_dtype::{Dtype, PromotionKind, promote};
use osp_graph::{
    AttrValue, VerifyOptions, WrapperModel, check_bytes, decode_envelope, encode_envelope, verify,
};
use osp_prims::{Operand, TensorValue};
use osp_refs::{OpRegistry, RefKernel, ReferenceOperator};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub report_root: PathBuf,
    pub strict_mode: bool,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            report_root: repo_root.join("artifacts/logs"),
            strict_mode: true,
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteReport {
    pub suite: &'static str,
    pub case_count: usize,
    pub pass_count: usize,
    pub skip_count: usize,
    pub failures: Vec<String>,
}

impl SuiteReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.case_count == self.pass_count + self.skip_count && self.failures.is_empty()
    }
}

pub(crate) fn normalize_reason_code(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        "unspecified".to_string()
    } else {
        trimmed.to_string()
    }
}

fn verify_options(config: &HarnessConfig) -> VerifyOptions {
    VerifyOptions {
        recompute_digest: config.strict_mode,
        ..VerifyOptions::default()
    }
}

// ── dtype promotion suite ────────

#[derive(Debug, Clone, Deserialize)]
struct PromotionFixtureCase {
    id: String,
    kind: String,
    operands: Vec<String>,
    #[serde(default)]
    expected_dtype: String,
    #[serde(default)]
    expected_reason_code: String,
}

fn parse_promotion_kind(raw: &str) -> Option<PromotionKind> {
    match raw {
        "no_promotion" => Some(PromotionKind::NoPromotion),
        "int_to_float" => Some(PromotionKind::IntToFloat),
        "complex_to_real_part" => Some(PromotionKind::ComplexToRealPart),
        "always_bool" => Some(PromotionKind::AlwaysBool),
        _ => None,
    }
}

pub fn run_promotion_suite(config: &HarnessConfig) -> Result<SuiteReport, String> {
    let path = config.fixture_root.join("promotion_cases.json");
    let raw = fs::read_to_string(&path)
        .map_err(|err| format!("failed reading {}: {err}", path.display()))?;
    let cases: Vec<PromotionFixtureCase> =
        serde_json::from_str(&raw).map_err(|err| format!("invalid json: {err}"))?;

    let mut report = SuiteReport {
        suite: "dtype_promotion",
        case_count: cases.len(),
        pass_count: 0,
        skip_count: 0,
        failures: Vec::new(),
    };

    for case in cases {
        let kind = parse_promotion_kind(&case.kind)
            .ok_or_else(|| format!("{}: unknown promotion kind '{}'", case.id, case.kind))?;
        let mut operands = Vec::with_capacity(case.operands.len());
        for name in &case.operands {
            operands.push(
                Dtype::parse(name)
                    .ok_or_else(|| format!("{}: unknown operand dtype '{name}'", case.id))?,
            );
        }
        let expects_dtype = !case.expected_dtype.is_empty();
        if expects_dtype == !case.expected_reason_code.is_empty() {
            return Err(format!(
                "{}: exactly one of expected_dtype and expected_reason_code must be set",
                case.id
            ));
        }

        match (promote(kind, &operands), expects_dtype) {
            (Ok(actual), true) => {
                let expected = Dtype::parse(&case.expected_dtype).ok_or_else(|| {
                    format!("{}: unknown expected dtype '{}'", case.id, case.expected_dtype)
                })?;
                if actual == expected {
                    report.pass_count += 1;
                } else {
                    report.failures.push(format!(
                        "{}: promotion mismatch expected={} actual={}",
                        case.id,
                        expected.name(),
                        actual.name()
                    ));
                }
            }
            (Ok(actual), false) => {
                report.failures.push(format!(
                    "{}: expected rejection '{}' but promotion produced {}",
                    case.id,
                    case.expected_reason_code,
                    actual.name()
                ));
            }
            (Err(err), true) => {
                report.failures.push(format!(
                    "{}: unexpected rejection [{}]: {err}",
                    case.id,
                    err.reason_code()
                ));
            }
            (Err(err), false) => {
                if err.reason_code() == case.expected_reason_code {
                    report.pass_count += 1;
                } else {
                    report.failures.push(format!(
                        "{}: rejection code mismatch expected={} actual={}",
                        case.id,
                        case.expected_reason_code,
                        err.reason_code()
                    ));
                }
            }
        }
    }

    Ok(report)
}

// ── reference operator suite ────────

#[derive(Debug, Clone, Deserialize)]
struct OperandSpec {
    #[serde(default)]
    scalar: Option<f64>,
    #[serde(default)]
    shape: Vec<usize>,
    #[serde(default)]
    values: Vec<f64>,
    #[serde(default)]
    dtype: String,
}

impl OperandSpec {
    fn build(&self, case_id: &str) -> Result<Operand, String> {
        if let Some(value) = self.scalar {
            return Ok(Operand::Scalar(value));
        }
        let dtype = Dtype::parse(&self.dtype)
            .ok_or_else(|| format!("{case_id}: unknown input dtype '{}'", self.dtype))?;
        let tensor = TensorValue::new(self.shape.clone(), self.values.clone(), dtype)
            .map_err(|err| format!("{case_id}: input construction failed: {err}"))?;
        Ok(Operand::Tensor(tensor))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ReferenceOpCase {
    id: String,
    op: String,
    #[serde(default)]
    variant: String,
    inputs: Vec<OperandSpec>,
    #[serde(default)]
    kwargs: BTreeMap<String, f64>,
    #[serde(default)]
    expected_dtype: String,
    #[serde(default)]
    expected_shape: Vec<usize>,
    #[serde(default)]
    expected_values: Vec<f64>,
    #[serde(default)]
    tolerance: f64,
    #[serde(default)]
    expected_reason_code: String,
}

fn evaluate_reference_case(registry: &OpRegistry, case: &ReferenceOpCase) -> Result<(), String> {
    let op = registry
        .get(&case.op, &case.variant)
        .ok_or_else(|| format!("unknown operator '{}'", case.op))?;
    let mut args = Vec::with_capacity(case.inputs.len());
    for spec in &case.inputs {
        args.push(spec.build(&case.id)?);
    }
    let kwargs: Vec<(&str, f64)> = case
        .kwargs
        .iter()
        .map(|(key, value)| (key.as_str(), *value))
        .collect();

    match op.call(&args, &kwargs) {
        Ok(result) => {
            if !case.expected_reason_code.is_empty() {
                return Err(format!(
                    "expected rejection '{}' but the call succeeded",
                    case.expected_reason_code
                ));
            }
            let expected_dtype = Dtype::parse(&case.expected_dtype)
                .ok_or_else(|| format!("unknown expected dtype '{}'", case.expected_dtype))?;
            if result.dtype() != expected_dtype {
                return Err(format!(
                    "result dtype {} does not match expected {expected_dtype}",
                    result.dtype()
                ));
            }
            if result.shape() != case.expected_shape.as_slice() {
                return Err(format!(
                    "result shape {:?} does not match expected {:?}",
                    result.shape(),
                    case.expected_shape
                ));
            }
            if result.values().len() != case.expected_values.len() {
                return Err(format!(
                    "result carries {} values, expected {}",
                    result.values().len(),
                    case.expected_values.len()
                ));
            }
            for (index, (&actual, &expected)) in
                result.values().iter().zip(&case.expected_values).enumerate()
            {
                let scale = expected.abs().max(1.0);
                if (actual - expected).abs() > case.tolerance * scale {
                    return Err(format!(
                        "element {index} diverges: expected {expected}, got {actual}"
                    ));
                }
            }
            Ok(())
        }
        Err(err) => {
            if case.expected_reason_code.is_empty() {
                return Err(format!(
                    "unexpected rejection [{}]: {err}",
                    err.reason_code()
                ));
            }
            if err.reason_code() == case.expected_reason_code {
                Ok(())
            } else {
                Err(format!(
                    "rejection code mismatch expected={} actual={}",
                    case.expected_reason_code,
                    err.reason_code()
                ))
            }
        }
    }
}

pub fn run_reference_op_suite(config: &HarnessConfig) -> Result<SuiteReport, String> {
    let path = config.fixture_root.join("reference_op_cases.json");
    let raw = fs::read_to_string(&path)
        .map_err(|err| format!("failed reading {}: {err}", path.display()))?;
    let cases: Vec<ReferenceOpCase> =
        serde_json::from_str(&raw).map_err(|err| format!("invalid json: {err}"))?;

    let registry = OpRegistry::standard();
    let mut report = SuiteReport {
        suite: "reference_ops",
        case_count: cases.len(),
        pass_count: 0,
        skip_count: 0,
        failures: Vec::new(),
    };

    for case in &cases {
        match evaluate_reference_case(&registry, case) {
            Ok(()) => report.pass_count += 1,
            Err(message) => report.failures.push(format!("{}: {message}", case.id)),
        }
    }

    Ok(report)
}

// ── export/verify scenario suite ────────

#[derive(Debug, Clone, Deserialize)]
struct ExportScenarioCase {
    id: String,
    op: String,
    #[serde(default)]
    variant: String,
    dtype: String,
    version: u32,
    #[serde(default)]
    kwargs: BTreeMap<String, f64>,
    check: String,
    #[serde(default)]
    expected_node_types: Vec<String>,
    #[serde(default)]
    expected_reason_code: String,
}

fn export_case_inputs(op: &ReferenceOperator, dtype: Dtype) -> Result<Vec<Operand>, String> {
    let build = |shape: &[usize], values: &[f64]| -> Result<Operand, String> {
        if dtype.is_complex() {
            let imag: Vec<f64> = values.iter().map(|value| -value).collect();
            TensorValue::new_complex(shape.to_vec(), values.to_vec(), imag, dtype)
        } else {
            TensorValue::new(shape.to_vec(), values.to_vec(), dtype)
        }
        .map(Operand::Tensor)
        .map_err(|err| format!("input construction failed: {err}"))
    };

    if op.kernel().arity() == 2 {
        return Ok(vec![
            build(&[3], &[0.0, 2.0, 3.0])?,
            build(&[3], &[5.0, 1.0, 0.5])?,
        ]);
    }
    match op.kernel() {
        RefKernel::Transpose => Ok(vec![build(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?]),
        RefKernel::Logit => Ok(vec![build(&[3], &[0.25, 0.5, 0.75])?]),
        _ if dtype.is_integer() => Ok(vec![build(&[3], &[1.0, 4.0, 9.0])?]),
        _ => Ok(vec![build(&[3], &[0.25, 1.0, 2.25])?]),
    }
}

fn evaluate_export_scenario(
    registry: &OpRegistry,
    case: &ExportScenarioCase,
    config: &HarnessConfig,
) -> Result<(), String> {
    let op = registry
        .get(&case.op, &case.variant)
        .ok_or_else(|| format!("unknown operator '{}'", case.op))?;
    let dtype = Dtype::parse(&case.dtype)
        .ok_or_else(|| format!("unknown dtype '{}'", case.dtype))?;
    let kwargs: Vec<(&str, f64)> = case
        .kwargs
        .iter()
        .map(|(key, value)| (key.as_str(), *value))
        .collect();
    let wrapper = WrapperModel::new(op, &kwargs);
    let args = export_case_inputs(op, dtype)?;
    let export = |version: u32| {
        wrapper
            .export(&args, version)
            .map_err(|err| format!("export failed [{}]: {err}", err.reason_code()))
    };

    match case.check.as_str() {
        "roundtrip" => {
            let payload = export(case.version)?;
            let model = decode_envelope(&payload)
                .map_err(|err| format!("decode failed [{}]: {err}", err.reason_code()))?;
            if model.format_version != case.version {
                return Err(format!(
                    "decoded format version {} does not match {}",
                    model.format_version, case.version
                ));
            }
            let reencoded = encode_envelope(&model)
                .map_err(|err| format!("re-encode failed [{}]: {err}", err.reason_code()))?;
            if reencoded != payload {
                return Err("re-encoded payload differs from the original bytes".to_string());
            }
            Ok(())
        }
        "digest_deterministic" => {
            let first = export(case.version)?;
            let second = export(case.version)?;
            if first != second {
                return Err("two exports of the same wrapper differ".to_string());
            }
            let model = decode_envelope(&first)
                .map_err(|err| format!("decode failed [{}]: {err}", err.reason_code()))?;
            if model.content_digest.len() != 64 {
                return Err(format!(
                    "content digest '{}' is not a sha-256 hex string",
                    model.content_digest
                ));
            }
            Ok(())
        }
        "node_types" => {
            let payload = export(case.version)?;
            let model = decode_envelope(&payload)
                .map_err(|err| format!("decode failed [{}]: {err}", err.reason_code()))?;
            let observed: Vec<&str> = model
                .graph
                .nodes
                .iter()
                .map(|node| node.op_type.as_str())
                .collect();
            let expected: Vec<&str> = case
                .expected_node_types
                .iter()
                .map(String::as_str)
                .collect();
            if observed != expected {
                return Err(format!(
                    "node chain {observed:?} does not match expected {expected:?}"
                ));
            }
            Ok(())
        }
        "verify" => verify(&wrapper, &args, case.version, &verify_options(config))
            .map(|_| ())
            .map_err(|err| format!("verification failed [{}]: {err}", err.reason_code())),
        "verify_all_versions" => {
            for version in tested_versions() {
                verify(&wrapper, &args, version, &verify_options(config)).map_err(|err| {
                    format!(
                        "verification failed at version {version} [{}]: {err}",
                        err.reason_code()
                    )
                })?;
            }
            Ok(())
        }
        "initializers_declared" => {
            let payload = export(case.version)?;
            let model = decode_envelope(&payload)
                .map_err(|err| format!("decode failed [{}]: {err}", err.reason_code()))?;
            if model.graph.initializers.is_empty() {
                return Err("expected at least one initializer".to_string());
            }
            let input_names: BTreeSet<&str> = model
                .graph
                .inputs
                .iter()
                .map(|info| info.name.as_str())
                .collect();
            for initializer in &model.graph.initializers {
                if !input_names.contains(initializer.name.as_str()) {
                    return Err(format!(
                        "initializer '{}' is not declared as a graph input",
                        initializer.name
                    ));
                }
            }
            Ok(())
        }
        "tamper_digest" => {
            let payload = export(case.version)?;
            let mut model = decode_envelope(&payload)
                .map_err(|err| format!("decode failed [{}]: {err}", err.reason_code()))?;
            let replacement = if model.content_digest.starts_with('0') {
                "1"
            } else {
                "0"
            };
            model.content_digest.replace_range(0..1, replacement);
            let tampered = encode_envelope(&model)
                .map_err(|err| format!("re-encode failed [{}]: {err}", err.reason_code()))?;
            match check_bytes(&tampered, true) {
                Ok(_) => Err("tampered digest was accepted".to_string()),
                Err(err) if err.reason_code() == case.expected_reason_code => Ok(()),
                Err(err) => Err(format!(
                    "rejection code mismatch expected={} actual={}",
                    case.expected_reason_code,
                    err.reason_code()
                )),
            }
        }
        "transpose_perm" => {
            let payload = export(case.version)?;
            let model = decode_envelope(&payload)
                .map_err(|err| format!("decode failed [{}]: {err}", err.reason_code()))?;
            let node = model
                .graph
                .nodes
                .iter()
                .find(|node| node.op_type == "Transpose")
                .ok_or_else(|| "no Transpose node in the exported graph".to_string())?;
            match node.attributes.get("perm") {
                Some(AttrValue::Ints(perm)) if perm.as_slice() == &[1, 0][..] => Ok(()),
                other => Err(format!("perm attribute mismatch: {other:?}")),
            }
        }
        "export_err" => match wrapper.export(&args, case.version) {
            Ok(_) => Err(format!(
                "expected rejection '{}' but export succeeded",
                case.expected_reason_code
            )),
            Err(err) if err.reason_code() == case.expected_reason_code => Ok(()),
            Err(err) => Err(format!(
                "rejection code mismatch expected={} actual={}",
                case.expected_reason_code,
                err.reason_code()
            )),
        },
        "export_check" => {
            let payload = export(case.version)?;
            check_bytes(&payload, true)
                .map(|_| ())
                .map_err(|err| format!("structural check failed [{}]: {err}", err.reason_code()))
        }
        other => Err(format!("unknown check '{other}'")),
    }
}

pub fn run_export_roundtrip_suite(config: &HarnessConfig) -> Result<SuiteReport, String> {
    let path = config.fixture_root.join("export_scenarios.json");
    let raw = fs::read_to_string(&path)
        .map_err(|err| format!("failed reading {}: {err}", path.display()))?;
    let cases: Vec<ExportScenarioCase> =
        serde_json::from_str(&raw).map_err(|err| format!("invalid json: {err}"))?;

    let registry = OpRegistry::standard();
    let mut report = SuiteReport {
        suite: "export_roundtrip",
        case_count: cases.len(),
        pass_count: 0,
        skip_count: 0,
        failures: Vec::new(),
    };

    for case in &cases {
        match evaluate_export_scenario(&registry, case, config) {
            Ok(()) => report.pass_count += 1,
            Err(message) => report.failures.push(format!("{}: {message}", case.id)),
        }
    }

    Ok(report)
}

pub fn run_all_core_suites(config: &HarnessConfig) -> Result<Vec<SuiteReport>, String> {
    Ok(vec![
        run_promotion_suite(config)?,
        run_reference_op_suite(config)?,
        run_export_roundtrip_suite(config)?,
        runner::run_consistency_suite(config)?,
    ])
}

#[cfg(test)]
mod tests {
    use super::{
        HarnessConfig, SuiteReport, normalize_reason_code, run_all_core_suites,
        run_export_roundtrip_suite, run_promotion_suite, run_reference_op_suite,
    };
    use osp_dtype::{Dtype, PromotionKind, promote};
    use osp_prims::{Operand, TensorValue, clamp_elementwise};
    use osp_refs::OpRegistry;
    use proptest::prelude::*;

    #[test]
    fn promotion_suite_passes_on_the_shipped_fixtures() {
        let report = run_promotion_suite(&HarnessConfig::default_paths()).expect("suite");
        assert!(report.all_passed(), "{:?}", report.failures);
        assert_eq!(report.case_count, 21);
    }

    #[test]
    fn reference_op_suite_passes_on_the_shipped_fixtures() {
        let report = run_reference_op_suite(&HarnessConfig::default_paths()).expect("suite");
        assert!(report.all_passed(), "{:?}", report.failures);
        assert_eq!(report.case_count, 19);
    }

    #[test]
    fn export_suite_passes_on_the_shipped_fixtures() {
        let report = run_export_roundtrip_suite(&HarnessConfig::default_paths()).expect("suite");
        assert!(report.all_passed(), "{:?}", report.failures);
        assert_eq!(report.case_count, 16);
    }

    #[test]
    fn core_suites_report_distinct_names() {
        let reports = run_all_core_suites(&HarnessConfig::default_paths()).expect("suites");
        let names: Vec<&str> = reports.iter().map(|report| report.suite).collect();
        assert_eq!(
            names,
            [
                "dtype_promotion",
                "reference_ops",
                "export_roundtrip",
                "consistency_matrix"
            ]
        );
    }

    #[test]
    fn all_passed_requires_full_accounting() {
        let mut report = SuiteReport {
            suite: "unit",
            case_count: 3,
            pass_count: 2,
            skip_count: 1,
            failures: Vec::new(),
        };
        assert!(report.all_passed());
        report.failures.push("broken".to_string());
        assert!(!report.all_passed());
        report.failures.clear();
        report.pass_count = 1;
        assert!(!report.all_passed());
    }

    #[test]
    fn nan_in_the_rhs_overrides_the_zero_guard() {
        let registry = OpRegistry::standard();
        let op = registry.get("xlog1py", "").expect("xlog1py");
        let a = Operand::Tensor(
            TensorValue::new(vec![1], vec![0.0], Dtype::F64).expect("tensor"),
        );
        let b = Operand::Tensor(
            TensorValue::new(vec![1], vec![f64::NAN], Dtype::F64).expect("tensor"),
        );
        let result = op.call(&[a, b], &[]).expect("call");
        assert!(result.values()[0].is_nan());
    }

    #[test]
    fn sqrt_of_negative_values_is_nan() {
        let registry = OpRegistry::standard();
        let op = registry.get("sqrt", "").expect("sqrt");
        let args = [Operand::Tensor(
            TensorValue::new(vec![1], vec![-4.0], Dtype::F64).expect("tensor"),
        )];
        let result = op.call(&args, &[]).expect("call");
        assert!(result.values()[0].is_nan());
    }

    #[test]
    fn call_into_requires_matching_output_buffers() {
        let registry = OpRegistry::standard();
        let op = registry.get("sqrt", "").expect("sqrt");
        let args = [Operand::Tensor(
            TensorValue::new(vec![2], vec![1.0, 4.0], Dtype::F32).expect("tensor"),
        )];
        let mut out = TensorValue::new(vec![2], vec![0.0, 0.0], Dtype::F32).expect("buffer");
        op.call_into(&args, &[], &mut out).expect("fill");
        assert_eq!(out.values(), &[1.0, 2.0]);

        let mut bad = TensorValue::new(vec![2], vec![0.0, 0.0], Dtype::F64).expect("buffer");
        let err = op
            .call_into(&args, &[], &mut bad)
            .expect_err("dtype mismatch");
        assert_eq!(err.reason_code(), "ref_output_mismatch");
    }

    #[test]
    fn namespace_paths_resolve_to_registered_operators() {
        let registry = OpRegistry::standard();
        assert_eq!(registry.len(), 11);
        let sqrt = registry.resolve("ops.sqrt").expect("ops.sqrt");
        assert_eq!(sqrt.name(), "sqrt");
        let zeta = registry.decomposition_of("special.zeta").expect("special.zeta");
        assert_eq!(zeta.name(), "zeta");
        assert!(registry.resolve("ops.banana").is_none());
    }

    #[test]
    fn empty_reason_codes_normalize_to_unspecified() {
        assert_eq!(normalize_reason_code(""), "unspecified");
        assert_eq!(normalize_reason_code("  "), "unspecified");
        assert_eq!(normalize_reason_code(" graph_magic_invalid "), "graph_magic_invalid");
    }

    proptest! {
        #[test]
        fn prop_bool_and_integers_collapse_to_default_float(index in 0usize..6) {
            let dtypes = [
                Dtype::Bool,
                Dtype::U8,
                Dtype::I8,
                Dtype::I16,
                Dtype::I32,
                Dtype::I64,
            ];
            prop_assert_eq!(
                promote(PromotionKind::IntToFloat, &[dtypes[index]]),
                Ok(Dtype::F32)
            );
        }

        #[test]
        fn prop_logit_default_matches_the_unset_sentinel(
            values in proptest::collection::vec(0.001f64..0.999, 1..8)
        ) {
            let registry = OpRegistry::standard();
            let op = registry.get("logit", "").expect("logit");
            let tensor = TensorValue::new(vec![values.len()], values, Dtype::F64)
                .expect("tensor");
            let args = [Operand::Tensor(tensor)];
            let plain = op.call(&args, &[]).expect("default call");
            let pinned = op.call(&args, &[("eps", -1.0)]).expect("pinned call");
            prop_assert_eq!(plain.values(), pinned.values());
        }

        #[test]
        fn prop_zero_lhs_always_yields_zero(
            values in proptest::collection::vec(-0.9f64..1.0e6, 1..8)
        ) {
            let registry = OpRegistry::standard();
            let op = registry.get("xlog1py", "").expect("xlog1py");
            let b = TensorValue::new(vec![values.len()], values, Dtype::F64).expect("tensor");
            let args = [Operand::Scalar(0.0), Operand::Tensor(b)];
            let result = op.call(&args, &[]).expect("call");
            prop_assert!(result.values().iter().all(|&v| v == 0.0));
        }

        #[test]
        fn prop_clamp_respects_its_bounds(
            x in -1.0e6f64..1.0e6,
            a in -1.0e6f64..1.0e6,
            b in -1.0e6f64..1.0e6
        ) {
            let lo_value = a.min(b);
            let hi_value = a.max(b);
            let input = TensorValue::scalar(x, Dtype::F64);
            let lo = TensorValue::scalar(lo_value, Dtype::F64);
            let hi = TensorValue::scalar(hi_value, Dtype::F64);
            let clamped = clamp_elementwise(&input, &lo, &hi).expect("clamp");
            let out = clamped.values()[0];
            prop_assert!(out >= lo_value && out <= hi_value);
            if x >= lo_value && x <= hi_value {
                prop_assert_eq!(out, x);
            }
        }
    }
}
