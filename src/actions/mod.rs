use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result, anyhow};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tempfile::TempDir;

use crate::config::Settings;
use crate::error::FlowError;
use crate::runtime::context::Context;
use crate::runtime::engine::Engine;
use crate::runtime::response::Response;

pub mod builtin;
pub mod discovery;
pub mod gcmc;
pub mod pipelines;
pub mod relax;
pub mod zeopp;

/// 插件接口：所有作业函数必须实现此 Trait
///
/// `params` is a JSON object holding the job's resolved inputs by name.
#[async_trait]
pub trait FunctionHandler: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, params: Value, ctx: &Context) -> Result<Response>;
}

/// Reads a required input.
pub fn input<T: DeserializeOwned>(params: &Value, key: &str) -> Result<T> {
    let raw = params
        .get(key)
        .ok_or_else(|| anyhow!("missing input '{}'", key))?;
    serde_json::from_value(raw.clone()).with_context(|| format!("invalid input '{}'", key))
}

/// Reads an optional input; `null` counts as absent.
pub fn optional_input<T: DeserializeOwned>(params: &Value, key: &str) -> Result<Option<T>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => serde_json::from_value(raw.clone())
            .map(Some)
            .with_context(|| format!("invalid input '{}'", key)),
    }
}

/// Private scratch directory under `root`, removed when dropped.
///
/// Every tool call gets its own, so structures that share a `data_` block name
/// never see each other's files.
pub fn scratch_dir(root: &Path, prefix: &str) -> Result<TempDir> {
    std::fs::create_dir_all(root).with_context(|| format!("failed to create {}", root.display()))?;
    let prefix: String = prefix
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    tempfile::Builder::new()
        .prefix(&format!("{}.", prefix))
        .tempdir_in(root)
        .with_context(|| format!("failed to create a scratch directory in {}", root.display()))
}

/// Registers every handler whose tool is configured.
///
/// Pore analysis is mandatory; relaxation and adsorption are registered only
/// when their programs are set, so a job that needs a missing tool fails with
/// an unknown-function diagnostic.
pub fn register_standard_functions(engine: &mut Engine, settings: &Settings) -> Result<(), FlowError> {
    settings.validate()?;

    let binary = settings
        .zeopp
        .binary
        .clone()
        .ok_or_else(|| FlowError::Config("zeopp.binary is not set".into()))?;
    let working_dir = settings
        .zeopp
        .working_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    let analyzer: Arc<dyn zeopp::PoreAnalyzer> =
        Arc::new(zeopp::ZeoppCli::new(binary, settings.zeopp.samples, working_dir));

    engine.register_function(Arc::new(zeopp::PoreAssessment::new(
        analyzer.clone(),
        settings.zeopp.sorbates.clone(),
        settings.zeopp.nproc,
    )?));
    engine.register_function(Arc::new(discovery::MofScreening::new(
        analyzer,
        settings.zeopp.sorbates.clone(),
        settings.zeopp.nproc,
        &settings.relax.method,
    )?));

    if let Some(program) = &settings.relax.program {
        let relaxer = relax::ExternalRelaxer::new(
            program.clone(),
            settings.relax.args.clone(),
            settings
                .relax
                .working_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
        );
        engine.register_function(Arc::new(relax::Relax::new(
            Arc::new(relaxer),
            &settings.relax.method,
        )));
    }

    if let Some(program) = &settings.gcmc.program {
        let simulator = gcmc::ExternalSimulator::new(
            program.clone(),
            settings
                .gcmc
                .working_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
        );
        engine.register_function(Arc::new(gcmc::GcmcAdsorption::new(
            Arc::new(simulator),
            settings.gcmc.forcefield_cutoff,
        )));
    }

    Ok(())
}
