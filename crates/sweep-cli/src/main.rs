use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use sweep_analysis::reconcile::{CLASSIFICATION_FILE, INPUTS_FILE, TIMING_FILE};
use sweep_analysis::{
    reconcile, reconcile_batch, summarize, BatchSummary, ClassificationRecord, InputRecord,
    TimingRecord,
};
use sweep_core::config::CONFIG_FILE_NAME;
use sweep_core::{read_jsonl, BatchLayout, FsJobStore, SweepConfig};
use sweep_runner::{run_batch, JobRunStatus, RunOptions, RunReport};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "sweep", version = "0.3.0", about = "Parameter sweep batch runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover pending jobs and run them on a worker pool.
    Run {
        root: PathBuf,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long = "batch")]
        batch: Option<usize>,
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(long)]
        executable: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List the pending jobs a run would pick up.
    Discover {
        root: PathBuf,
        #[arg(long = "batch")]
        batch: Option<usize>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Classify terminal jobs and write the analysis tables.
    Parse {
        root: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Summarize outcomes of a batch.
    Check {
        root: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Write a default sweep.yaml into a batch root.
    ConfigInit {
        root: PathBuf,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            root,
            workers,
            batch,
            timeout_secs,
            executable,
            config,
            json,
        } => {
            let mut cfg = SweepConfig::resolve(&root, config.as_deref())?;
            if let Some(secs) = timeout_secs {
                cfg.execution.timeout_secs = secs;
            }
            if let Some(exe) = executable {
                cfg.execution.executable = exe;
            }
            let options = RunOptions {
                workers,
                batch_limit: batch,
            };
            let result = run_batch(&root, &cfg, &options)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run": run_report_to_json(&result.report),
                    "report_path": result.report_path.display().to_string(),
                    "timeout_secs": cfg.execution.timeout_secs
                })));
            }
            print_run_report(&result.report);
            println!("report_path: {}", result.report_path.display());
        }
        Commands::Discover {
            root,
            batch,
            config,
            json,
        } => {
            let cfg = SweepConfig::resolve(&root, config.as_deref())?;
            let layout = BatchLayout::new(&root, &cfg)?;
            let store = FsJobStore::new(layout, cfg.files.input.clone());
            let jobs = sweep_runner::discover(&store, batch)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "discover",
                    "jobs": jobs,
                    "count": jobs.len()
                })));
            }
            println!("pending_jobs: {}", jobs.len());
            for job in &jobs {
                println!("  {}", job);
            }
        }
        Commands::Parse { root, config, json } => {
            let cfg = SweepConfig::resolve(&root, config.as_deref())?;
            let result = reconcile_batch(&root, &cfg)?;
            let rec = &result.reconciliation;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "parse",
                    "output_dir": result.output_dir.display().to_string(),
                    "warnings": rec.warnings,
                    "classified": rec.classification.len(),
                    "emission_rows": rec.results.emission.len(),
                    "continuum_rows": rec.results.continuum.len(),
                    "skipped_extractions": rec.results.skipped.len(),
                    "summary": rec.summary
                })));
            }
            for warning in &rec.warnings {
                println!("warning: {}", warning);
            }
            println!("output_dir: {}", result.output_dir.display());
            println!("emission_rows: {}", rec.results.emission.len());
            println!("continuum_rows: {}", rec.results.continuum.len());
            println!("skipped_extractions: {}", rec.results.skipped.len());
            print_summary(&rec.summary);
        }
        Commands::Check { root, config, json } => {
            let cfg = SweepConfig::resolve(&root, config.as_deref())?;
            let (summary, source) = load_summary(&root, &cfg)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "check",
                    "source": source,
                    "summary": summary
                })));
            }
            println!("source: {}", source);
            print_summary(&summary);
        }
        Commands::ConfigInit { root, force, json } => {
            let path = write_default_config(&root, force)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "config-init",
                    "path": path.display().to_string()
                })));
            }
            println!("config: {}", path.display());
        }
    }
    Ok(None)
}

/// Summary from the persisted analysis tables when present, otherwise from
/// an in-memory reconciliation that writes nothing.
fn load_summary(root: &Path, cfg: &SweepConfig) -> Result<(BatchSummary, &'static str)> {
    let layout = BatchLayout::new(root, cfg)?;
    let classification_path = layout.analysis.join(CLASSIFICATION_FILE);
    if classification_path.is_file() {
        let classification: Vec<ClassificationRecord> = read_jsonl(&classification_path)?;
        let timing_path = layout.analysis.join(TIMING_FILE);
        let timing: Vec<TimingRecord> = if timing_path.is_file() {
            read_jsonl(&timing_path)?
        } else {
            Vec::new()
        };
        let inputs_path = layout.analysis.join(INPUTS_FILE);
        let total = if inputs_path.is_file() {
            let inputs: Vec<InputRecord> = read_jsonl(&inputs_path)?;
            (!inputs.is_empty()).then(|| inputs.len())
        } else {
            None
        };
        return Ok((summarize(&classification, &timing, total), "analysis"));
    }
    let rec = reconcile(&layout, cfg)?;
    Ok((rec.summary, "terminal"))
}

fn write_default_config(root: &Path, force: bool) -> Result<PathBuf> {
    if !root.is_dir() {
        return Err(anyhow!("batch root is not a directory: {}", root.display()));
    }
    let path = root.join(CONFIG_FILE_NAME);
    if path.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    std::fs::write(&path, SweepConfig::default().to_yaml()?)?;
    Ok(path)
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Discover { json, .. }
        | Commands::Parse { json, .. }
        | Commands::Check { json, .. }
        | Commands::ConfigInit { json, .. } => *json,
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn run_report_to_json(report: &RunReport) -> Value {
    json!({
        "run_id": report.run_id,
        "started_at": report.started_at.to_rfc3339(),
        "finished_at": report.finished_at.to_rfc3339(),
        "workers": report.workers,
        "jobs": report.jobs.len(),
        "completed": report.count(|s| matches!(s, JobRunStatus::Completed { .. })),
        "timed_out": report.count(|s| matches!(s, JobRunStatus::TimedOut)),
        "failed": report.count(|s| matches!(s, JobRunStatus::Failed { .. })),
        "terminal": report.terminal_count()
    })
}

fn print_run_report(report: &RunReport) {
    println!("run_id: {}", report.run_id);
    println!("workers: {}", report.workers);
    println!("jobs: {}", report.jobs.len());
    println!(
        "completed: {}",
        report.count(|s| matches!(s, JobRunStatus::Completed { .. }))
    );
    println!(
        "timed_out: {}",
        report.count(|s| matches!(s, JobRunStatus::TimedOut))
    );
    println!(
        "failed: {}",
        report.count(|s| matches!(s, JobRunStatus::Failed { .. }))
    );
    println!("terminal: {}", report.terminal_count());
    for job in &report.jobs {
        if let JobRunStatus::Failed { error } = &job.status {
            println!("  {}: {}", job.job, error);
        }
    }
}

fn print_summary(summary: &BatchSummary) {
    match summary.total {
        Some(total) => println!("processed: {} / {}", summary.processed, total),
        None => println!("processed: {}", summary.processed),
    }
    for s in &summary.statuses {
        println!(
            "{:>11} ({}): {:>6} {:>6.2}%",
            s.label, s.code, s.count, s.percent
        );
    }
    match &summary.success_duration {
        Some(d) => println!(
            "success_duration_secs: mean {:.1} min {:.1} max {:.1} (n={})",
            d.mean_secs, d.min_secs, d.max_secs, d.count
        ),
        None => println!("success_duration_secs: none"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sweep_core::{ensure_dir, scratch_dir};

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "sweep", "run", "/data/batch", "--workers", "8", "--batch", "100", "--timeout-secs", "60", "--json",
        ])
        .expect("parse");
        match cli.command {
            Commands::Run {
                workers,
                batch,
                timeout_secs,
                json,
                ..
            } => {
                assert_eq!(workers, Some(8));
                assert_eq!(batch, Some(100));
                assert_eq!(timeout_secs, Some(60));
                assert!(json);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn config_init_refuses_to_overwrite() {
        let root = scratch_dir("cli_config_init");
        ensure_dir(&root).expect("root");
        let path = write_default_config(&root, false).expect("first write");
        let loaded = SweepConfig::load(&path).expect("reload");
        assert_eq!(loaded, SweepConfig::default());
        assert!(write_default_config(&root, false).is_err());
        assert!(write_default_config(&root, true).is_ok());
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn check_reconciles_in_memory_when_tables_are_absent() {
        let root = scratch_dir("cli_check");
        let job = root.join("terminal").join("0");
        ensure_dir(&job).expect("job");
        ensure_dir(&root.join("pending")).expect("pending");
        std::fs::write(job.join("model.out"), " Cloudy exited OK ExecTime(s) 3.0\n").expect("log");
        let cfg = SweepConfig::default();
        let (summary, source) = load_summary(&root, &cfg).expect("summary");
        assert_eq!(source, "terminal");
        assert_eq!(summary.processed, 1);
        assert!(!root.join("analysis").exists());
        let _ = std::fs::remove_dir_all(root);
    }
}
