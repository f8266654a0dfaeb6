//! Reconciliation of a finished batch.
//!
//! Each stage takes the previous stage's table as an argument:
//! `resolve_identities` -> `classify_terminal` -> `extract_results`.

use crate::classify::{classify_job_dir, ExitStatus};
use crate::extract::{emergent_row, parse_continuum_table, parse_emission_table, ExtractError};
use crate::summary::{summarize, BatchSummary};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use sweep_core::{
    acquire_batch_lock, atomic_write_json_pretty, write_jsonl, BatchLayout, FsJobStore, HashId,
    JobIndex, JobState, JobStore, ParameterMatrix, SweepConfig,
};
use tracing::{debug, info, warn};

pub const INPUTS_FILE: &str = "inputs.jsonl";
pub const CLASSIFICATION_FILE: &str = "classification.jsonl";
pub const TIMING_FILE: &str = "timing.jsonl";
pub const EMISSION_FILE: &str = "emission.jsonl";
pub const CONTINUUM_FILE: &str = "continuum.jsonl";
pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRecord {
    pub index: JobIndex,
    pub hash_id: HashId,
    pub parameters: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub index: JobIndex,
    pub hash_id: Option<HashId>,
    pub status: ExitStatus,
    pub code: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingRecord {
    pub index: JobIndex,
    pub hash_id: Option<HashId>,
    pub exec_time_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionRecord {
    pub index: JobIndex,
    pub hash_id: Option<HashId>,
    pub lines: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuumRecord {
    pub index: JobIndex,
    pub hash_id: Option<HashId>,
    pub row: usize,
    pub values: BTreeMap<String, f64>,
}

/// Index -> hash ID table built from the parameter matrix.
#[derive(Debug, Clone, Default)]
pub struct IdentityTable {
    inputs: Vec<InputRecord>,
}

impl IdentityTable {
    pub fn hash_of(&self, index: JobIndex) -> Option<&HashId> {
        self.inputs.get(index.0).map(|r| &r.hash_id)
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn inputs(&self) -> &[InputRecord] {
        &self.inputs
    }
}

#[derive(Debug, Clone, Default)]
pub struct StructuredResults {
    pub emission: Vec<EmissionRecord>,
    pub continuum: Vec<ContinuumRecord>,
    /// Jobs whose artifacts could not be parsed, with the reason.
    pub skipped: Vec<(JobIndex, String)>,
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub warnings: Vec<String>,
    pub identities: IdentityTable,
    pub classification: Vec<ClassificationRecord>,
    pub timing: Vec<TimingRecord>,
    pub results: StructuredResults,
    pub summary: BatchSummary,
}

pub struct ReconcileResult {
    pub reconciliation: Reconciliation,
    pub output_dir: PathBuf,
}

fn structural_warning(warnings: &mut Vec<String>, message: String) {
    warn!("{}", message);
    warnings.push(message);
}

pub fn resolve_identities(matrix: &ParameterMatrix, config: &SweepConfig) -> IdentityTable {
    let names = config.parameters.names_for_width(matrix.width());
    let inputs = matrix
        .rows()
        .zip(matrix.hash_ids(config.identity.algorithm))
        .enumerate()
        .map(|(i, (row, hash_id))| InputRecord {
            index: JobIndex(i),
            hash_id,
            parameters: names.iter().cloned().zip(row.iter().copied()).collect(),
        })
        .collect();
    IdentityTable { inputs }
}

/// Classifies every terminal job folder. Folders whose name is not an index
/// are reported and skipped.
pub fn classify_terminal(
    store: &dyn JobStore,
    identities: &IdentityTable,
    config: &SweepConfig,
    warnings: &mut Vec<String>,
) -> Result<(Vec<ClassificationRecord>, Vec<TimingRecord>)> {
    let mut classification = Vec::new();
    let mut timing = Vec::new();
    for job in store.list(JobState::Terminal)? {
        let Some(index) = JobIndex::parse(&job) else {
            structural_warning(warnings, format!("terminal folder {} is not a job index, skipped", job));
            continue;
        };
        let dir = store.locate(&job)?.path;
        let verdict = classify_job_dir(&dir, &config.files.output_log, &config.markers);
        let hash_id = identities.hash_of(index).cloned();
        if hash_id.is_none() && !identities.is_empty() {
            structural_warning(
                warnings,
                format!("job {} has no row in the parameter matrix", index),
            );
        }
        debug!(
            job = %index,
            hash_id = hash_id.as_ref().map(|h| h.as_str()).unwrap_or("-"),
            status = %verdict.status,
            "classified"
        );
        classification.push(ClassificationRecord {
            index,
            hash_id: hash_id.clone(),
            status: verdict.status,
            code: verdict.status.code(),
        });
        timing.push(TimingRecord {
            index,
            hash_id,
            exec_time_secs: verdict.exec_time_secs,
        });
    }
    classification.sort_by_key(|r| r.index);
    timing.sort_by_key(|r| r.index);
    Ok((classification, timing))
}

/// Parses the emission and continuum artifacts of successful jobs. A parse
/// failure drops only that job's structured rows.
pub fn extract_results(
    store: &dyn JobStore,
    classification: &[ClassificationRecord],
    config: &SweepConfig,
) -> StructuredResults {
    let mut results = StructuredResults::default();
    for record in classification
        .iter()
        .filter(|r| r.status == ExitStatus::Success)
    {
        let dir = match store.locate(&record.index.to_string()) {
            Ok(located) => located.path,
            Err(err) => {
                results.skipped.push((record.index, err.to_string()));
                continue;
            }
        };
        match extract_job(&dir, record, config) {
            Ok((emission, continuum)) => {
                if let Some(e) = emission {
                    results.emission.push(e);
                }
                results.continuum.extend(continuum);
            }
            Err(err) => {
                warn!(job = %record.index, error = %err, "skipping structured extraction");
                results.skipped.push((record.index, err));
            }
        }
    }
    results
}

fn extract_job(
    dir: &Path,
    record: &ClassificationRecord,
    config: &SweepConfig,
) -> std::result::Result<(Option<EmissionRecord>, Vec<ContinuumRecord>), String> {
    let read = |name: &str| -> std::result::Result<Option<String>, String> {
        let path = dir.join(name);
        if !path.is_file() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .map_err(|e| format!("{}: {}", path.display(), e))
    };
    let tag = |name: &str, err: ExtractError| format!("{}: {}", name, err);

    let emission = match read(&config.files.emission)? {
        Some(text) => {
            let table = parse_emission_table(&text).map_err(|e| tag(&config.files.emission, e))?;
            let lines = emergent_row(&table).map_err(|e| tag(&config.files.emission, e))?;
            Some(EmissionRecord {
                index: record.index,
                hash_id: record.hash_id.clone(),
                lines,
            })
        }
        None => {
            debug!(job = %record.index, "no emission artifact");
            None
        }
    };

    let continuum = match read(&config.files.continuum)? {
        Some(text) => {
            let table = parse_continuum_table(&text, &config.continuum)
                .map_err(|e| tag(&config.files.continuum, e))?;
            (0..table.rows.len())
                .filter_map(|row| {
                    table.row_map(row).map(|values| ContinuumRecord {
                        index: record.index,
                        hash_id: record.hash_id.clone(),
                        row,
                        values,
                    })
                })
                .collect()
        }
        None => Vec::new(),
    };
    Ok((emission, continuum))
}

/// Runs every stage over a batch without writing anything. Missing
/// substructure becomes a warning; only an unusable root is an error.
pub fn reconcile(layout: &BatchLayout, config: &SweepConfig) -> Result<Reconciliation> {
    let mut warnings = Vec::new();
    let store = FsJobStore::new(layout.clone(), config.files.input.clone());

    if !layout.pending.is_dir() {
        structural_warning(
            &mut warnings,
            format!("pending directory {} not found", layout.pending.display()),
        );
    } else {
        let waiting = store.list(JobState::Pending)?.len();
        if waiting > 0 {
            structural_warning(
                &mut warnings,
                format!("batch incomplete: {} jobs still pending", waiting),
            );
        }
    }
    if let Some(working) = &layout.working {
        if working.is_dir() && !layout.running_is_terminal() {
            let stuck = store.list(JobState::Running)?.len();
            if stuck > 0 {
                structural_warning(
                    &mut warnings,
                    format!("{} jobs left in working directory {}", stuck, working.display()),
                );
            }
        }
    }
    if !layout.terminal.is_dir() {
        structural_warning(
            &mut warnings,
            format!("terminal directory {} not found", layout.terminal.display()),
        );
    }

    let identities = match layout.parameter_matrix() {
        Some(path) => match ParameterMatrix::load(&path) {
            Ok(matrix) => {
                info!(rows = matrix.len(), path = %path.display(), "loaded parameter matrix");
                resolve_identities(&matrix, config)
            }
            Err(err) => {
                structural_warning(&mut warnings, format!("parameter matrix unusable: {}", err));
                IdentityTable::default()
            }
        },
        None => {
            structural_warning(
                &mut warnings,
                format!("no parameter matrix found in {}", layout.root.display()),
            );
            IdentityTable::default()
        }
    };

    let (classification, timing) = classify_terminal(&store, &identities, config, &mut warnings)?;
    info!(jobs = classification.len(), "classified terminal jobs");
    let results = extract_results(&store, &classification, config);
    info!(
        emission = results.emission.len(),
        continuum_rows = results.continuum.len(),
        skipped = results.skipped.len(),
        "extracted structured results"
    );
    let total = (!identities.is_empty()).then(|| identities.len());
    let summary = summarize(&classification, &timing, total);

    Ok(Reconciliation {
        warnings,
        identities,
        classification,
        timing,
        results,
        summary,
    })
}

pub fn write_reconciliation(dir: &Path, rec: &Reconciliation) -> Result<()> {
    write_jsonl(&dir.join(INPUTS_FILE), rec.identities.inputs())?;
    write_jsonl(&dir.join(CLASSIFICATION_FILE), &rec.classification)?;
    write_jsonl(&dir.join(TIMING_FILE), &rec.timing)?;
    write_jsonl(&dir.join(EMISSION_FILE), &rec.results.emission)?;
    write_jsonl(&dir.join(CONTINUUM_FILE), &rec.results.continuum)?;
    let mut summary = serde_json::to_value(&rec.summary)?;
    if let Some(obj) = summary.as_object_mut() {
        obj.insert("schema_version".to_string(), "batch_summary_v1".into());
        obj.insert("warnings".to_string(), serde_json::to_value(&rec.warnings)?);
        obj.insert(
            "skipped_extractions".to_string(),
            serde_json::to_value(
                rec.results
                    .skipped
                    .iter()
                    .map(|(i, reason)| serde_json::json!({ "index": i, "reason": reason }))
                    .collect::<Vec<_>>(),
            )?,
        );
    }
    atomic_write_json_pretty(&dir.join(SUMMARY_FILE), &summary)?;
    Ok(())
}

/// Locks the root, reconciles it and persists every table under the
/// analysis directory.
pub fn reconcile_batch(root: &Path, config: &SweepConfig) -> Result<ReconcileResult> {
    let layout = BatchLayout::new(root, config)?;
    let _lock = acquire_batch_lock(&layout.root, "parse")?;
    let reconciliation = reconcile(&layout, config)?;
    write_reconciliation(&layout.analysis, &reconciliation)?;
    info!(dir = %layout.analysis.display(), "wrote reconciliation tables");
    Ok(ReconcileResult {
        reconciliation,
        output_dir: layout.analysis.clone(),
    })
}
