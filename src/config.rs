use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::FlowError;

/// 全局配置
///
/// Tool locations live here and are handed to the handlers explicitly; nothing
/// in the library reads the process environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub zeopp: ZeoppSettings,
    pub relax: RelaxSettings,
    pub gcmc: GcmcSettings,
    pub queue: QueueSettings,
}

impl Settings {
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.engine.max_concurrency == 0 {
            return Err(FlowError::Config("engine.max_concurrency must be at least 1".into()));
        }
        if self.zeopp.nproc == 0 {
            return Err(FlowError::Config("zeopp.nproc must be at least 1".into()));
        }
        if self.zeopp.sorbates.is_empty() {
            return Err(FlowError::Config("zeopp.sorbates must not be empty".into()));
        }
        for sorbate in &self.zeopp.sorbates {
            crate::actions::zeopp::probe_radius(sorbate)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Maximum number of nested replacement rounds below the submitted flow.
    pub max_replacement_depth: usize,
    /// Upper bound on handlers running at the same time.
    pub max_concurrency: usize,
    pub job_timeout_secs: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_replacement_depth: 8,
            max_concurrency: 4,
            job_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ZeoppSettings {
    /// zeo++ `network` executable.
    pub binary: Option<PathBuf>,
    pub nproc: usize,
    pub sorbates: Vec<String>,
    /// Monte Carlo samples for the accessible-volume pass.
    pub samples: u64,
    pub working_dir: Option<PathBuf>,
}

impl Default for ZeoppSettings {
    fn default() -> Self {
        Self {
            binary: None,
            nproc: 1,
            sorbates: vec!["N2".into(), "CO2".into(), "H2O".into()],
            samples: 50_000,
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelaxSettings {
    /// Relaxation driver executable.
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub method: String,
    pub working_dir: Option<PathBuf>,
}

impl Default for RelaxSettings {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            method: "MACE".into(),
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GcmcSettings {
    pub program: Option<PathBuf>,
    pub forcefield_cutoff: f64,
    pub working_dir: Option<PathBuf>,
}

impl Default for GcmcSettings {
    fn default() -> Self {
        Self {
            program: None,
            forcefield_cutoff: 9.0,
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueSettings {
    pub redis_url: String,
    pub queue_key: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".into(),
            queue_key: "mofflow:submissions".into(),
        }
    }
}
