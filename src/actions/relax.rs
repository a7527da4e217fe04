use std::fmt::Debug;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::actions::{FunctionHandler, input, optional_input, scratch_dir};
use crate::error::ToolError;
use crate::runtime::context::Context;
use crate::runtime::response::Response;
use crate::structure::Structure;

/// Relaxed structure plus convergence flag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelaxOutcome {
    pub structure: Structure,
    pub force_converged: bool,
    #[serde(default)]
    pub energy: Option<f64>,
}

/// 结构弛豫协作者
#[async_trait]
pub trait Relaxer: Send + Sync + Debug {
    /// `method` names the level of theory (`MACE`, `GFN-xTB`, `r2SCAN-D4`, ...).
    /// `static_run` asks for a single-point calculation after the relaxation.
    async fn relax(&self, structure: &Structure, method: &str, static_run: bool) -> Result<RelaxOutcome>;
}

/// Line printed on stdout by the relaxation driver.
#[derive(Debug, Deserialize)]
struct DriverReport {
    force_converged: bool,
    #[serde(default)]
    energy: Option<f64>,
}

/// External relaxation driver.
///
/// Invoked as `program [args..] --method M [--static] --input in.cif --output out.cif`.
/// The last stdout line must be a JSON object with `force_converged` and
/// optionally `energy`.
#[derive(Debug, Clone)]
pub struct ExternalRelaxer {
    program: PathBuf,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl ExternalRelaxer {
    pub fn new(program: PathBuf, args: Vec<String>, working_dir: PathBuf) -> Self {
        Self {
            program,
            args,
            working_dir,
        }
    }
}

#[async_trait]
impl Relaxer for ExternalRelaxer {
    async fn relax(&self, structure: &Structure, method: &str, static_run: bool) -> Result<RelaxOutcome> {
        let stem = format!("{}_{}", structure.name, method);
        let scratch = scratch_dir(&self.working_dir, &stem)?;
        let input_cif = structure
            .write_cif(scratch.path(), &format!("{}_in.cif", stem))
            .with_context(|| format!("failed to write CIF into {}", scratch.path().display()))?;
        let output_cif = scratch.path().join(format!("{}_out.cif", stem));

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg("--method").arg(method);
        if static_run {
            cmd.arg("--static");
        }
        cmd.arg("--input")
            .arg(&input_cif)
            .arg("--output")
            .arg(&output_cif)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!(program = %self.program.display(), method, static_run, "Running relaxation");
        let out = cmd
            .output()
            .await
            .with_context(|| format!("failed to launch {}", self.program.display()))?;

        let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
        if !out.status.success() {
            return Err(ToolError {
                tool: self.program.display().to_string(),
                exit_code: out.status.code(),
                stdout,
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            }
            .into());
        }

        let report: DriverReport = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(serde_json::from_str::<DriverReport>)
            .transpose()?
            .with_context(|| format!("{} printed no report", self.program.display()))?;

        let text = tokio::fs::read_to_string(&output_cif)
            .await
            .with_context(|| format!("failed to read {}", output_cif.display()))?;
        let relaxed = Structure::from_cif_str(&structure.name, &text)
            .map_err(|reason| anyhow::anyhow!("relaxed structure is unreadable: {}", reason))?;

        Ok(RelaxOutcome {
            structure: relaxed,
            force_converged: report.force_converged,
            energy: report.energy,
        })
    }
}

/// Handler `relax`: inputs `structure`, optional `method` and `static`.
///
/// Output: `{structure, force_converged, energy, method}`.
#[derive(Debug)]
pub struct Relax {
    relaxer: Arc<dyn Relaxer>,
    default_method: String,
}

impl Relax {
    pub fn new(relaxer: Arc<dyn Relaxer>, default_method: &str) -> Self {
        Self {
            relaxer,
            default_method: default_method.to_string(),
        }
    }
}

#[async_trait]
impl FunctionHandler for Relax {
    fn name(&self) -> &str {
        "relax"
    }

    async fn execute(&self, params: Value, ctx: &Context) -> Result<Response> {
        let structure: Structure = input(&params, "structure")?;
        let method = optional_input::<String>(&params, "method")?.unwrap_or_else(|| self.default_method.clone());
        let static_run = optional_input::<bool>(&params, "static")?.unwrap_or(false);

        let outcome = self.relaxer.relax(&structure, &method, static_run).await?;
        debug!(job = %ctx.job_id, method = %method, force_converged = outcome.force_converged, "Relaxation finished");

        let mut output = serde_json::to_value(&outcome)?;
        if let Value::Object(map) = &mut output {
            map.insert("method".into(), Value::String(method));
        }
        Ok(Response::Done(output))
    }
}
