#![forbid(unsafe_code)]

use osp_conformance::runner::set_consistency_log_path;
use osp_conformance::{HarnessConfig, SuiteReport, run_all_core_suites};
use osp_graph::sha256_hex;
use serde::Serialize;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Serialize)]
struct SuiteSummary {
    suite: String,
    case_count: usize,
    pass_count: usize,
    skip_count: usize,
    failures: Vec<String>,
}

#[derive(Debug, Serialize)]
struct GateSummary {
    status: &'static str,
    mode: &'static str,
    consistency_log: String,
    report_digest: String,
    suites: Vec<SuiteSummary>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("run_consistency_matrix failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut log_path: Option<PathBuf> = None;
    let mut strict_mode = true;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--log-path" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--log-path requires a value".to_string())?;
                log_path = Some(PathBuf::from(value));
            }
            "--hardened" => {
                strict_mode = false;
            }
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p osp-conformance --bin run_consistency_matrix -- [--log-path <path>] [--hardened]"
                );
                return Ok(());
            }
            unknown => return Err(format!("unknown argument: {unknown}")),
        }
    }

    let config = HarnessConfig {
        strict_mode,
        ..HarnessConfig::default_paths()
    };

    let ts_millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis());
    let log_path = log_path.unwrap_or_else(|| {
        config
            .report_root
            .join(format!("consistency_matrix_{ts_millis}.jsonl"))
    });
    set_consistency_log_path(Some(log_path.clone()));

    let reports = run_all_core_suites(&config)?;
    let status = if reports.iter().all(SuiteReport::all_passed) {
        "pass"
    } else {
        "fail"
    };
    let suites: Vec<SuiteSummary> = reports.into_iter().map(summarize_suite).collect();
    let digest_payload = serde_json::to_vec(&suites)
        .map_err(|err| format!("failed serializing suite summaries: {err}"))?;
    let summary = GateSummary {
        status,
        mode: if strict_mode { "strict" } else { "hardened" },
        consistency_log: log_path.display().to_string(),
        report_digest: sha256_hex(&digest_payload),
        suites,
    };

    let summary_json = serde_json::to_string_pretty(&summary)
        .map_err(|err| format!("failed serializing summary: {err}"))?;
    println!("{summary_json}");

    if status == "fail" {
        std::process::exit(2);
    }
    Ok(())
}

fn summarize_suite(report: SuiteReport) -> SuiteSummary {
    SuiteSummary {
        suite: report.suite.to_string(),
        case_count: report.case_count,
        pass_count: report.pass_count,
        skip_count: report.skip_count,
        failures: report.failures,
    }
}
