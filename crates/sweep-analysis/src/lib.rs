//! Output reconciliation for finished sweep batches: outcome classification,
//! timing, structured artifact extraction and the hash-keyed join back to the
//! parameter matrix.

pub mod classify;
pub mod extract;
pub mod reconcile;
pub mod summary;
pub mod tail;

pub use classify::{classify_job_dir, classify_tail, parse_exec_time, ExitStatus, LogVerdict};
pub use extract::{
    emergent_row, parse_continuum_table, parse_emission_table, regroup_emission_header,
    ExtractError, Table,
};
pub use reconcile::{
    classify_terminal, extract_results, reconcile, reconcile_batch, resolve_identities,
    write_reconciliation, ClassificationRecord, ContinuumRecord, EmissionRecord, IdentityTable,
    InputRecord, ReconcileResult, Reconciliation, StructuredResults, TimingRecord,
};
pub use summary::{summarize, BatchSummary, DurationStats, StatusCount};
pub use tail::read_tail_lines;
