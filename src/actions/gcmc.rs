use std::fmt::Debug;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::actions::zeopp::validate_sorbates;
use crate::actions::{FunctionHandler, input, optional_input, scratch_dir};
use crate::error::ToolError;
use crate::runtime::context::Context;
use crate::runtime::response::Response;
use crate::structure::{Lattice, Structure};

/// Unit-cell repetitions per axis so that every perpendicular width is at
/// least twice the force-field cutoff.
pub fn calculate_unit_cells(lattice: &Lattice, forcefield_cutoff: f64) -> [u32; 3] {
    let lengths = lattice.lengths();
    let angles = lattice.angles();
    let mut cells = [1u32; 3];
    for i in 0..3 {
        let perpendicular = lengths[i] * (angles[i] - 90.0).to_radians().cos().abs();
        if !perpendicular.is_finite() || perpendicular <= 0.0 {
            continue;
        }
        // smallest n with n * perpendicular >= 2 * cutoff; degenerate cells saturate
        let needed = (2.0 * forcefield_cutoff / perpendicular).ceil();
        cells[i] = needed.clamp(1.0, f64::from(u32::MAX)) as u32;
    }
    cells
}

pub fn normalize_fractions(fractions: &[f64]) -> Result<Vec<f64>> {
    let total: f64 = fractions.iter().sum();
    if fractions.iter().any(|f| *f < 0.0) || total <= 0.0 {
        bail!("mole fractions must be non-negative with a positive sum, got {:?}", fractions);
    }
    Ok(fractions.iter().map(|f| f / total).collect())
}

/// Everything the simulator needs besides the framework.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdsorptionConditions {
    pub sorbates: Vec<String>,
    pub mole_fractions: Vec<f64>,
    /// K
    pub temperature: f64,
    /// Pa
    pub pressure: f64,
    pub unit_cells: [u32; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdsorptionResult {
    /// mol/kg framework
    pub loading: f64,
    /// kcal/mol
    pub heat_of_adsorption: f64,
}

/// 吸附模拟协作者
#[async_trait]
pub trait AdsorptionSimulator: Send + Sync + Debug {
    async fn simulate(&self, structure: &Structure, conditions: &AdsorptionConditions) -> Result<AdsorptionResult>;
}

/// External GCMC driver: `program --conditions conditions.json --framework in.cif`.
/// Prints an [`AdsorptionResult`] as JSON on its last stdout line.
#[derive(Debug, Clone)]
pub struct ExternalSimulator {
    program: PathBuf,
    working_dir: PathBuf,
}

impl ExternalSimulator {
    pub fn new(program: PathBuf, working_dir: PathBuf) -> Self {
        Self { program, working_dir }
    }
}

#[async_trait]
impl AdsorptionSimulator for ExternalSimulator {
    async fn simulate(&self, structure: &Structure, conditions: &AdsorptionConditions) -> Result<AdsorptionResult> {
        let scratch = scratch_dir(&self.working_dir, &format!("{}_gcmc", structure.name))?;
        let framework = structure.write_cif(scratch.path(), &format!("{}_gcmc.cif", structure.name))?;
        let conditions_path = scratch.path().join("conditions.json");
        tokio::fs::write(&conditions_path, serde_json::to_vec_pretty(conditions)?).await?;

        let out = Command::new(&self.program)
            .arg("--conditions")
            .arg(&conditions_path)
            .arg("--framework")
            .arg(&framework)
            .stdin(Stdio::null())
            .kill_on_drop(true)
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

        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .with_context(|| format!("{} printed no result", self.program.display()))?;
        Ok(serde_json::from_str(line)?)
    }
}

/// Handler `gcmc_adsorption`.
///
/// Inputs: `structure`, optional `sorbates` (`["CO2"]`), `mole_fractions`
/// (`[1]`), `temperature` (298 K), `pressure` (101325 Pa).
#[derive(Debug)]
pub struct GcmcAdsorption {
    simulator: Arc<dyn AdsorptionSimulator>,
    forcefield_cutoff: f64,
}

impl GcmcAdsorption {
    pub fn new(simulator: Arc<dyn AdsorptionSimulator>, forcefield_cutoff: f64) -> Self {
        Self {
            simulator,
            forcefield_cutoff,
        }
    }

    fn conditions(&self, params: &Value, structure: &Structure) -> Result<AdsorptionConditions> {
        let sorbates = optional_input::<Vec<String>>(params, "sorbates")?.unwrap_or_else(|| vec!["CO2".into()]);
        validate_sorbates(&sorbates)?;
        let fractions = optional_input::<Vec<f64>>(params, "mole_fractions")?.unwrap_or_else(|| vec![1.0]);
        if fractions.len() != sorbates.len() {
            bail!(
                "{} mole fractions given for {} sorbates",
                fractions.len(),
                sorbates.len()
            );
        }

        Ok(AdsorptionConditions {
            sorbates,
            mole_fractions: normalize_fractions(&fractions)?,
            temperature: optional_input(params, "temperature")?.unwrap_or(298.0),
            pressure: optional_input(params, "pressure")?.unwrap_or(101_325.0),
            unit_cells: calculate_unit_cells(&structure.lattice, self.forcefield_cutoff),
        })
    }
}

#[async_trait]
impl FunctionHandler for GcmcAdsorption {
    fn name(&self) -> &str {
        "gcmc_adsorption"
    }

    async fn execute(&self, params: Value, ctx: &Context) -> Result<Response> {
        let structure: Structure = input(&params, "structure")?;
        let conditions = self.conditions(&params, &structure)?;
        debug!(job = %ctx.job_id, unit_cells = ?conditions.unit_cells, "Running adsorption simulation");

        let result = self.simulator.simulate(&structure, &conditions).await?;
        Ok(Response::Done(serde_json::json!({
            "loading": result.loading,
            "heat_of_adsorption": result.heat_of_adsorption,
            "conditions": conditions,
        })))
    }
}
