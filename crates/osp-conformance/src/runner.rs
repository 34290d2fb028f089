#![forbid(unsafe_code)]

use crate::matrix::{ConsistencyMatrix, ErrorKind, RuleEffect, allowlist, tested_versions};
use crate::{HarnessConfig, SuiteReport};
use osp_dtype::Dtype;
use osp_graph::{GraphError, VerifyOptions, WrapperModel, check_bytes, verify};
use osp_prims::{Device, Operand, PrimError, TensorValue};
use osp_refs::{OpRegistry, RefError, RefKernel, ReferenceOperator};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

static CONSISTENCY_LOG_PATH: OnceLock<Mutex<Option<PathBuf>>> = OnceLock::new();

pub fn set_consistency_log_path(path: Option<PathBuf>) {
    let cell = CONSISTENCY_LOG_PATH.get_or_init(|| Mutex::new(None));
    if let Ok(mut slot) = cell.lock() {
        *slot = path;
    }
}

fn resolve_consistency_log_path() -> Option<PathBuf> {
    let configured = CONSISTENCY_LOG_PATH
        .get()
        .and_then(|cell| cell.lock().ok())
        .and_then(|slot| slot.clone());
    let from_env = std::env::var_os("OSP_CONSISTENCY_LOG_PATH").map(PathBuf::from);
    configured.or(from_env)
}

#[derive(Debug, Clone, Serialize)]
struct ConsistencyLogEntry {
    suite: &'static str,
    scenario_id: String,
    op: String,
    device: String,
    dtype: String,
    version: Option<u32>,
    mode: String,
    expected: String,
    actual: String,
    reason_code: String,
    passed: bool,
    detail: String,
}

fn maybe_append_consistency_log(entry: &ConsistencyLogEntry) -> Result<(), String> {
    let Some(path) = resolve_consistency_log_path() else {
        return Ok(());
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("failed creating {}: {err}", parent.display()))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|err| format!("failed opening {}: {err}", path.display()))?;
    let line = serde_json::to_string(entry)
        .map_err(|err| format!("failed serializing consistency log entry: {err}"))?;
    let mut payload = line.into_bytes();
    payload.push(b'\n');
    file.write_all(&payload)
        .map_err(|err| format!("failed appending consistency log {}: {err}", path.display()))
}

/// One deterministic input to a scenario. Kwargs ride along so decorated
/// variants can pin operator arguments without a separate table.
#[derive(Debug, Clone)]
pub struct SampleInput {
    pub label: &'static str,
    pub tensor: TensorValue,
    pub kwargs: Vec<(&'static str, f64)>,
}

fn grid_values(dtype: Dtype) -> Vec<f64> {
    if dtype.is_boolean() {
        vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0]
    } else if dtype == Dtype::U8 {
        vec![2.0, 1.0, 0.0, 1.0, 3.0, 9.0]
    } else if dtype.is_integer() {
        vec![-2.0, -1.0, 0.0, 1.0, 3.0, 9.0]
    } else {
        vec![-2.75, -0.5, 0.0, 1.25, 3.5, 9.0]
    }
}

fn line_values(dtype: Dtype) -> Vec<f64> {
    if dtype.is_boolean() {
        vec![1.0, 0.0, 1.0, 1.0, 0.0]
    } else if dtype == Dtype::U8 {
        vec![0.0, 1.0, 2.0, 6.0, 16.0]
    } else if dtype.is_integer() {
        vec![-3.0, 1.0, 2.0, 6.0, 16.0]
    } else {
        vec![0.25, 1.0, 2.0, 6.25, 16.0]
    }
}

fn build_sample_tensor(shape: &[usize], values: Vec<f64>, dtype: Dtype) -> Result<TensorValue, PrimError> {
    if dtype.is_complex() {
        let imag: Vec<f64> = values.iter().rev().copied().collect();
        TensorValue::new_complex(shape.to_vec(), values, imag, dtype)
    } else {
        TensorValue::new(shape.to_vec(), values, dtype)
    }
}

/// Deterministic sample set for one (operator, dtype) row. Transposable
/// operators additionally get a rank-0 sample.
pub fn sample_inputs(op: &ReferenceOperator, dtype: Dtype) -> Result<Vec<SampleInput>, PrimError> {
    let mut samples = vec![
        SampleInput {
            label: "grid2x3",
            tensor: build_sample_tensor(&[2, 3], grid_values(dtype), dtype)?,
            kwargs: Vec::new(),
        },
        SampleInput {
            label: "line5",
            tensor: build_sample_tensor(&[5], line_values(dtype), dtype)?,
            kwargs: Vec::new(),
        },
    ];
    if matches!(op.kernel(), RefKernel::Transpose) {
        let value = if dtype.is_boolean() { 1.0 } else { 2.0 };
        samples.push(SampleInput {
            label: "rank0",
            tensor: TensorValue::scalar(value, dtype),
            kwargs: Vec::new(),
        });
    }
    Ok(samples)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowDisposition {
    Skip { reason: &'static str },
    Xfail { reason: &'static str },
    Run,
}

/// One (operator, device, dtype) row of the sweep, after allowlist and
/// decoration resolution but before sample/version expansion.
#[derive(Debug, Clone)]
pub struct RowPlan {
    pub op: &'static str,
    pub variant: &'static str,
    pub device: Device,
    pub dtype: Dtype,
    pub disposition: RowDisposition,
}

impl RowPlan {
    #[must_use]
    pub fn qualified_op(&self) -> String {
        if self.variant.is_empty() {
            self.op.to_string()
        } else {
            format!("{}.{}", self.op, self.variant)
        }
    }
}

/// Expands the registry against the matrix into per-dtype rows. The
/// allowlist gates first: rows outside it are skips regardless of rules.
#[must_use]
pub fn plan_rows(registry: &OpRegistry, matrix: &ConsistencyMatrix) -> Vec<RowPlan> {
    let allow = allowlist();
    let mut rows = Vec::new();
    for op in registry.iter() {
        for &dtype in op.supported_dtypes() {
            let disposition = if !allow.contains(op.name()) {
                RowDisposition::Skip {
                    reason: "operator is outside the consistency allowlist",
                }
            } else if let Some(rule) =
                matrix.decoration_for(op.name(), op.variant(), Device::Cpu, dtype)
            {
                match rule.effect {
                    RuleEffect::Skip => RowDisposition::Skip { reason: rule.reason },
                    RuleEffect::Xfail => RowDisposition::Xfail { reason: rule.reason },
                }
            } else {
                RowDisposition::Run
            };
            rows.push(RowPlan {
                op: op.name(),
                variant: op.variant(),
                device: Device::Cpu,
                dtype,
                disposition,
            });
        }
    }
    rows
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    Pass,
    Fail {
        kind: Option<ErrorKind>,
        reason: &'static str,
    },
}

impl Expectation {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail { .. } => "fail",
        }
    }
}

/// Fully bound sub-test: one sample of one row at one format version.
#[derive(Debug, Clone)]
pub struct ScenarioRecord {
    pub id: String,
    pub op: &'static str,
    pub variant: &'static str,
    pub device: Device,
    pub dtype: Dtype,
    pub sample: SampleInput,
    pub version: u32,
    pub expectation: Expectation,
}

/// Expands a planned row into scenario records across samples and the
/// tested version window. Skip rows expand to nothing.
pub fn expand_row(
    op: &ReferenceOperator,
    row: &RowPlan,
    matrix: &ConsistencyMatrix,
) -> Result<Vec<ScenarioRecord>, String> {
    if matches!(row.disposition, RowDisposition::Skip { .. }) {
        return Ok(Vec::new());
    }
    let samples = sample_inputs(op, row.dtype)
        .map_err(|err| format!("sample construction failed for {}: {err}", row.qualified_op()))?;
    let mut records = Vec::new();
    for (index, sample) in samples.into_iter().enumerate() {
        for version in tested_versions() {
            let expectation = match &row.disposition {
                RowDisposition::Skip { .. } => unreachable!("skip rows are filtered above"),
                RowDisposition::Xfail { reason } => Expectation::Fail {
                    kind: None,
                    reason,
                },
                RowDisposition::Run => {
                    match matrix.opset_rule_for(row.op, row.variant, version, row.dtype) {
                        Some(rule) => Expectation::Fail {
                            kind: rule.expected_kind,
                            reason: rule.reason,
                        },
                        None => Expectation::Pass,
                    }
                }
            };
            records.push(ScenarioRecord {
                id: format!(
                    "{}/{}/{}/s{index}/v{version}",
                    row.qualified_op(),
                    row.device.as_str(),
                    row.dtype.name(),
                ),
                op: row.op,
                variant: row.variant,
                device: row.device,
                dtype: row.dtype,
                sample: sample.clone(),
                version,
                expectation,
            });
        }
    }
    Ok(records)
}

/// Runs one scenario end to end. bf16 rows stop after export plus a full
/// structural check; the backend never sees bf16 values. Everything else
/// goes through the reference/export/execute/compare pipeline.
pub fn execute_scenario(
    registry: &OpRegistry,
    record: &ScenarioRecord,
    strict_mode: bool,
) -> Result<(), GraphError> {
    let Some(op) = registry.get(record.op, record.variant) else {
        return Err(GraphError::Ref(RefError::UnknownOperator {
            name: record.op.to_string(),
        }));
    };
    let kwargs: Vec<(&str, f64)> = record
        .sample
        .kwargs
        .iter()
        .map(|(key, value)| (*key, *value))
        .collect();
    let wrapper = WrapperModel::new(op, &kwargs);
    let args = [Operand::Tensor(record.sample.tensor.clone())];

    if record.dtype == Dtype::BF16 {
        let encoded = wrapper.export(&args, record.version)?;
        check_bytes(&encoded, true)?;
        return Ok(());
    }

    let options = VerifyOptions {
        recompute_digest: strict_mode,
        ..VerifyOptions::default()
    };
    verify(&wrapper, &args, record.version, &options)?;
    Ok(())
}

/// Judges an observed result against the record's expectation. `Ok`
/// carries the outcome tag for the log; `Err` carries the failure text
/// for the suite report. An expected failure that passes is a failure.
pub fn evaluate_scenario(
    record: &ScenarioRecord,
    result: &Result<(), GraphError>,
) -> Result<&'static str, String> {
    match (&record.expectation, result) {
        (Expectation::Pass, Ok(())) => Ok("pass"),
        (Expectation::Pass, Err(err)) => Err(format!(
            "{}: unexpected failure [{}]: {err}",
            record.id,
            err.reason_code()
        )),
        (Expectation::Fail { kind, .. }, Err(err)) => match kind {
            None => Ok("expected_failure"),
            Some(expected) => {
                let observed = ErrorKind::classify(err.reason_code());
                if observed == *expected {
                    Ok("expected_failure")
                } else {
                    Err(format!(
                        "{}: failure kind mismatch, expected {} observed {} [{}]",
                        record.id,
                        expected.name(),
                        observed.name(),
                        err.reason_code()
                    ))
                }
            }
        },
        (Expectation::Fail { reason, .. }, Ok(())) => Err(format!(
            "{}: expected failure ({reason}) but the scenario passed",
            record.id
        )),
    }
}

/// Sweeps every registry row through the consistency matrix. Skips are
/// counted without execution; everything else runs one sub-test per
/// (sample, version) pair.
pub fn run_consistency_suite(config: &HarnessConfig) -> Result<SuiteReport, String> {
    let registry = OpRegistry::standard();
    let matrix = ConsistencyMatrix::standard(&registry)
        .map_err(|err| format!("consistency matrix rejected: {err}"))?;
    let rows = plan_rows(&registry, &matrix);
    let mode = if config.strict_mode { "strict" } else { "hardened" };

    let mut report = SuiteReport {
        suite: "consistency_matrix",
        case_count: 0,
        pass_count: 0,
        skip_count: 0,
        failures: Vec::new(),
    };

    for row in &rows {
        if let RowDisposition::Skip { reason } = &row.disposition {
            report.case_count += 1;
            report.skip_count += 1;
            let entry = ConsistencyLogEntry {
                suite: report.suite,
                scenario_id: format!(
                    "{}/{}/{}",
                    row.qualified_op(),
                    row.device.as_str(),
                    row.dtype.name()
                ),
                op: row.op.to_string(),
                device: row.device.as_str().to_string(),
                dtype: row.dtype.name().to_string(),
                version: None,
                mode: mode.to_string(),
                expected: "skip".to_string(),
                actual: "skip".to_string(),
                reason_code: crate::normalize_reason_code(""),
                passed: true,
                detail: (*reason).to_string(),
            };
            maybe_append_consistency_log(&entry)?;
            continue;
        }

        let op = registry
            .get(row.op, row.variant)
            .ok_or_else(|| format!("planned row references unknown operator {}", row.qualified_op()))?;
        for record in expand_row(op, row, &matrix)? {
            report.case_count += 1;
            let result = execute_scenario(&registry, &record, config.strict_mode);
            let reason_code = match &result {
                Ok(()) => crate::normalize_reason_code(""),
                Err(err) => crate::normalize_reason_code(err.reason_code()),
            };
            let (actual, passed, detail) = match evaluate_scenario(&record, &result) {
                Ok(outcome) => {
                    report.pass_count += 1;
                    (outcome, true, String::new())
                }
                Err(message) => {
                    report.failures.push(message.clone());
                    ("failure", false, message)
                }
            };
            let entry = ConsistencyLogEntry {
                suite: report.suite,
                scenario_id: record.id.clone(),
                op: record.op.to_string(),
                device: record.device.as_str().to_string(),
                dtype: record.dtype.name().to_string(),
                version: Some(record.version),
                mode: mode.to_string(),
                expected: record.expectation.label().to_string(),
                actual: actual.to_string(),
                reason_code,
                passed,
                detail,
            };
            maybe_append_consistency_log(&entry)?;
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::{
        Expectation, RowDisposition, RowPlan, evaluate_scenario, execute_scenario, expand_row,
        plan_rows, run_consistency_suite, sample_inputs,
    };
    use crate::HarnessConfig;
    use crate::matrix::{ConsistencyMatrix, ErrorKind, allowlist};
    use osp_dtype::Dtype;
    use osp_refs::OpRegistry;

    fn standard_fixture() -> (OpRegistry, ConsistencyMatrix) {
        let registry = OpRegistry::standard();
        let matrix = ConsistencyMatrix::standard(&registry).expect("standard matrix");
        (registry, matrix)
    }

    fn find_row<'a>(rows: &'a [RowPlan], op: &str, dtype: Dtype) -> &'a RowPlan {
        rows.iter()
            .find(|row| row.op == op && row.dtype == dtype)
            .expect("planned row")
    }

    #[test]
    fn operators_outside_the_allowlist_are_planned_as_skips() {
        let (registry, matrix) = standard_fixture();
        let allow = allowlist();
        let rows = plan_rows(&registry, &matrix);
        let mut outside = 0;
        for row in &rows {
            if !allow.contains(row.op) {
                outside += 1;
                assert!(
                    matches!(row.disposition, RowDisposition::Skip { .. }),
                    "{} {} should be skipped",
                    row.op,
                    row.dtype
                );
            }
        }
        assert!(outside > 0);
    }

    #[test]
    fn every_ceil_f64_scenario_expects_failure_and_fails() {
        let (registry, matrix) = standard_fixture();
        let rows = plan_rows(&registry, &matrix);
        let row = find_row(&rows, "ceil", Dtype::F64);
        assert!(matches!(row.disposition, RowDisposition::Xfail { .. }));

        let op = registry.get("ceil", "").expect("ceil");
        let records = expand_row(op, row, &matrix).expect("expansion");
        assert_eq!(records.len(), 18);
        for record in &records {
            assert!(matches!(record.expectation, Expectation::Fail { .. }));
            let result = execute_scenario(&registry, record, true);
            let err = result.expect_err("ceil f64 must not execute");
            assert_eq!(err.reason_code(), "graph_backend_kernel_missing");
            assert_eq!(
                evaluate_scenario(record, &Err(err)),
                Ok("expected_failure")
            );
        }
    }

    #[test]
    fn sqrt_bf16_flips_expectation_at_version_thirteen() {
        let (registry, matrix) = standard_fixture();
        let rows = plan_rows(&registry, &matrix);
        let row = find_row(&rows, "sqrt", Dtype::BF16);
        assert_eq!(row.disposition, RowDisposition::Run);

        let op = registry.get("sqrt", "").expect("sqrt");
        let records = expand_row(op, row, &matrix).expect("expansion");
        for record in &records {
            let expected_fail = record.version < 13;
            match &record.expectation {
                Expectation::Fail { kind, .. } => {
                    assert!(expected_fail, "{} should expect a pass", record.id);
                    assert_eq!(*kind, Some(ErrorKind::FormatRefusal));
                }
                Expectation::Pass => {
                    assert!(!expected_fail, "{} should expect a failure", record.id);
                }
            }
            let result = execute_scenario(&registry, record, true);
            assert_eq!(result.is_err(), expected_fail, "{}", record.id);
            assert!(evaluate_scenario(record, &result).is_ok(), "{}", record.id);
        }
    }

    #[test]
    fn transpose_bool_rows_execute_and_match() {
        let (registry, matrix) = standard_fixture();
        let rows = plan_rows(&registry, &matrix);
        let row = find_row(&rows, "t", Dtype::Bool);
        assert_eq!(row.disposition, RowDisposition::Run);

        let op = registry.get("t", "").expect("t");
        let records = expand_row(op, row, &matrix).expect("expansion");
        assert_eq!(records.len(), 27);
        for record in &records {
            assert_eq!(record.expectation, Expectation::Pass);
            let result = execute_scenario(&registry, record, true);
            assert!(result.is_ok(), "{}: {result:?}", record.id);
        }
    }

    #[test]
    fn unsigned_samples_never_go_negative() {
        let registry = OpRegistry::standard();
        let op = registry.get("sqrt", "").expect("sqrt");
        for sample in sample_inputs(op, Dtype::U8).expect("samples") {
            assert!(sample.tensor.values().iter().all(|&v| v >= 0.0));
        }
        for sample in sample_inputs(op, Dtype::Bool).expect("samples") {
            assert!(sample.tensor.values().iter().all(|&v| v == 0.0 || v == 1.0));
        }
        for sample in sample_inputs(op, Dtype::I32).expect("samples") {
            assert!(sample.tensor.values().iter().all(|&v| v.fract() == 0.0));
        }
    }

    #[test]
    fn scenario_identifiers_spell_out_the_full_coordinate() {
        let (registry, matrix) = standard_fixture();
        let rows = plan_rows(&registry, &matrix);
        let row = find_row(&rows, "sqrt", Dtype::F32);
        let op = registry.get("sqrt", "").expect("sqrt");
        let records = expand_row(op, row, &matrix).expect("expansion");
        assert_eq!(records[0].id, "sqrt/cpu/f32/s0/v9");
        let last = records.last().expect("records");
        assert_eq!(last.id, "sqrt/cpu/f32/s1/v17");
    }

    #[test]
    fn expected_failures_that_pass_are_reported_as_failures() {
        let (registry, matrix) = standard_fixture();
        let rows = plan_rows(&registry, &matrix);
        let row = find_row(&rows, "sqrt", Dtype::F32);
        let op = registry.get("sqrt", "").expect("sqrt");
        let mut record = expand_row(op, row, &matrix).expect("expansion").remove(0);
        record.expectation = Expectation::Fail {
            kind: None,
            reason: "forced for the test",
        };
        let message = evaluate_scenario(&record, &Ok(()))
            .expect_err("passing xfail must fail");
        assert!(message.contains("expected failure"), "{message}");
    }

    #[test]
    fn the_full_sweep_passes_in_both_modes() {
        for strict_mode in [true, false] {
            let config = HarnessConfig {
                strict_mode,
                ..HarnessConfig::default_paths()
            };
            let report = run_consistency_suite(&config).expect("suite");
            assert!(
                report.all_passed(),
                "mode strict={strict_mode}: {:?}",
                report.failures
            );
            assert_eq!(
                report.case_count,
                report.pass_count + report.skip_count
            );
            assert!(report.skip_count > 0);
            assert!(report.pass_count > report.skip_count);
        }
    }
}
