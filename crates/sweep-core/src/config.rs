//! Batch configuration, read from YAML.
//!
//! Every field has a default so an absent `sweep.yaml` is a valid
//! configuration for a standard photoionization sweep.

use crate::identity::HashAlgorithm;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "sweep.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfig {
    pub layout: LayoutConfig,
    pub files: FileNames,
    pub execution: ExecutionConfig,
    pub markers: MarkerVocabulary,
    pub parameters: ParameterConfig,
    pub identity: IdentityConfig,
    pub continuum: ContinuumConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayoutConfig {
    pub pending_dir: String,
    /// Where jobs sit while their process runs; `None` moves them straight
    /// into the terminal directory.
    pub working_dir: Option<String>,
    pub terminal_dir: String,
    pub parameter_matrix: Option<String>,
    pub analysis_dir: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            pending_dir: "pending".to_string(),
            working_dir: None,
            terminal_dir: "terminal".to_string(),
            parameter_matrix: None,
            analysis_dir: "analysis".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileNames {
    pub input: String,
    pub output_log: String,
    pub emission: String,
    pub continuum: String,
}

impl Default for FileNames {
    fn default() -> Self {
        Self {
            input: "model.in".to_string(),
            output_log: "model.out".to_string(),
            emission: "model.emis".to_string(),
            continuum: "model.cont".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    pub executable: PathBuf,
    pub timeout_secs: u64,
    /// Write the child's stdout into the output log file.
    pub capture_stdout: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("cloudy.exe"),
            timeout_secs: 7200,
            capture_stdout: false,
        }
    }
}

/// Literal phrases the simulation prints, keyed by the outcome they signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarkerVocabulary {
    pub success: Vec<String>,
    pub aborted: Vec<String>,
    pub wrong: Vec<String>,
    pub unphysical: Vec<String>,
    pub did_not_converge: Vec<String>,
    pub exec_time_label: String,
    pub tail_lines: usize,
}

impl Default for MarkerVocabulary {
    fn default() -> Self {
        Self {
            success: vec!["Cloudy exited OK".to_string()],
            aborted: vec!["ABORT".to_string()],
            wrong: vec!["something went wrong".to_string()],
            unphysical: vec![
                "unphysical".to_string(),
                "negative population".to_string(),
            ],
            did_not_converge: vec!["did not converge".to_string()],
            exec_time_label: "ExecTime(s)".to_string(),
            tail_lines: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParameterConfig {
    pub names: Vec<String>,
}

impl Default for ParameterConfig {
    fn default() -> Self {
        Self {
            names: [
                "gas_density",
                "gas_phase_metallicity",
                "redshift",
                "cr_ionization_factor",
                "ionization_parameter",
                "stellar_metallicity",
                "stellar_age",
                "dtm",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl ParameterConfig {
    /// Column names for a matrix of `width` columns. Falls back to
    /// positional names when the configured list does not fit.
    pub fn names_for_width(&self, width: usize) -> Vec<String> {
        if self.names.len() == width {
            self.names.clone()
        } else {
            if width > 0 {
                tracing::warn!(
                    configured = self.names.len(),
                    width,
                    "parameter names do not match matrix width, using positional names"
                );
            }
            (0..width).map(|i| format!("p{}", i)).collect()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentityConfig {
    pub algorithm: HashAlgorithm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContinuumConfig {
    pub rename: BTreeMap<String, String>,
    pub drop: Vec<String>,
}

impl Default for ContinuumConfig {
    fn default() -> Self {
        let mut rename = BTreeMap::new();
        rename.insert("#Cont  nu".to_string(), "nu".to_string());
        rename.insert("#Cont nu".to_string(), "nu".to_string());
        rename.insert("net trans".to_string(), "net_trans".to_string());
        Self {
            rename,
            drop: vec!["lineID".to_string(), "cont".to_string(), "nLine".to_string()],
        }
    }
}

impl ContinuumConfig {
    /// Target name of a raw header, or `None` when the column is dropped.
    pub fn column_name(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        if self.drop.iter().any(|d| d == raw) {
            return None;
        }
        if let Some(renamed) = self.rename.get(raw) {
            return Some(renamed.clone());
        }
        Some(
            raw.trim_start_matches('#')
                .split_whitespace()
                .collect::<Vec<_>>()
                .join("_")
                .to_lowercase(),
        )
    }
}

impl SweepConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: SweepConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read config {}: {}", path.display(), e))?;
        Self::from_yaml_str(&raw)
            .map_err(|e| anyhow!("invalid config {}: {}", path.display(), e))
    }

    /// Explicit path wins; otherwise `<root>/sweep.yaml` if present;
    /// otherwise defaults.
    pub fn resolve(root: &Path, explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let candidate = root.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            Self::load(&candidate)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.layout.pending_dir.trim().is_empty() {
            missing.push("layout.pending_dir");
        }
        if self.layout.terminal_dir.trim().is_empty() {
            missing.push("layout.terminal_dir");
        }
        if self.files.input.trim().is_empty() {
            missing.push("files.input");
        }
        if self.files.output_log.trim().is_empty() {
            missing.push("files.output_log");
        }
        if self.markers.success.is_empty() {
            missing.push("markers.success");
        }
        if !missing.is_empty() {
            return Err(anyhow!("missing or empty fields: {}", missing.join(", ")));
        }
        if self.layout.pending_dir == self.layout.terminal_dir {
            return Err(anyhow!(
                "layout.pending_dir and layout.terminal_dir must differ"
            ));
        }
        if self.markers.tail_lines == 0 {
            return Err(anyhow!("markers.tail_lines must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_yields_defaults() {
        let config = SweepConfig::from_yaml_str("").expect("defaults");
        assert_eq!(config, SweepConfig::default());
        assert_eq!(config.files.input, "model.in");
        assert_eq!(config.markers.tail_lines, 5);
        assert_eq!(config.identity.algorithm, HashAlgorithm::Md5);
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let raw = "\
layout:
  pending_dir: todo
  terminal_dir: done
execution:
  executable: /opt/c17.03/source/cloudy.exe
  timeout_secs: 60
identity:
  algorithm: sha256
";
        let config = SweepConfig::from_yaml_str(raw).expect("parse");
        assert_eq!(config.layout.pending_dir, "todo");
        assert_eq!(config.layout.terminal_dir, "done");
        assert_eq!(config.layout.analysis_dir, "analysis");
        assert_eq!(config.execution.timeout_secs, 60);
        assert!(!config.execution.capture_stdout);
        assert_eq!(config.identity.algorithm, HashAlgorithm::Sha256);
        assert_eq!(config.markers, MarkerVocabulary::default());
    }

    #[test]
    fn unknown_and_conflicting_fields_are_rejected() {
        assert!(SweepConfig::from_yaml_str("layout:\n  pendng_dir: x\n").is_err());
        let err = SweepConfig::from_yaml_str("layout:\n  pending_dir: same\n  terminal_dir: same\n")
            .expect_err("same dirs");
        assert!(err.to_string().contains("must differ"), "{}", err);
        let err = SweepConfig::from_yaml_str("markers:\n  success: []\n").expect_err("no success");
        assert!(err.to_string().contains("markers.success"), "{}", err);
    }

    #[test]
    fn continuum_columns_are_renamed_or_dropped() {
        let c = ContinuumConfig::default();
        assert_eq!(c.column_name("#Cont  nu").as_deref(), Some("nu"));
        assert_eq!(c.column_name("net trans").as_deref(), Some("net_trans"));
        assert_eq!(c.column_name("DiffOut").as_deref(), Some("diffout"));
        assert_eq!(c.column_name("lineID"), None);
        assert_eq!(c.column_name("nLine"), None);
    }

    #[test]
    fn parameter_names_fall_back_to_positional() {
        let p = ParameterConfig::default();
        assert_eq!(p.names_for_width(8)[0], "gas_density");
        assert_eq!(p.names_for_width(3), vec!["p0", "p1", "p2"]);
    }

    #[test]
    fn yaml_round_trip_of_defaults() {
        let yaml = SweepConfig::default().to_yaml().expect("yaml");
        assert_eq!(SweepConfig::from_yaml_str(&yaml).expect("parse"), SweepConfig::default());
    }
}
