use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::actions::zeopp::{PoreAnalyzer, assess, validate_sorbates};
use crate::actions::{FunctionHandler, input, optional_input};
use crate::dsl::builder::FlowBuilder;
use crate::dsl::{Flow, Job};
use crate::error::FlowError;
use crate::runtime::context::Context;
use crate::runtime::response::Response;
use crate::structure::{Structure, StructureSource};

pub const SCREENING: &str = "mof_screening";
pub const RELAX: &str = "relax";

/// 累加器：随替换轮次逐步填充
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Assessment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_mof: Option<bool>,
    #[serde(
        rename = "MACE_force_converged",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub force_converged: Option<bool>,
}

/// Where the discovery pipeline stands for a given accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Nothing known yet: run the pore analysis.
    Screening,
    /// Not a MOF. Terminal.
    Rejected,
    /// A MOF that has not been relaxed: emit relaxation + re-analysis.
    Relaxation,
    /// Relaxed and re-analysed. Terminal.
    FinalAssessment,
}

impl Assessment {
    pub fn stage(&self) -> Stage {
        match (self.is_mof, self.force_converged) {
            (None, _) => Stage::Screening,
            (Some(false), _) => Stage::Rejected,
            (Some(true), None) => Stage::Relaxation,
            (Some(true), Some(_)) => Stage::FinalAssessment,
        }
    }

    /// Folds a fresh classification (and, after a relaxation, its
    /// convergence flag) into the accumulator.
    pub fn fold(&self, is_mof: bool, force_converged: Option<bool>) -> Assessment {
        Assessment {
            is_mof: Some(is_mof),
            force_converged: force_converged.or(self.force_converged),
        }
    }
}

/// Builds the relaxation stage that replaces a positive screening job:
/// `mace_relax` followed by `zeopp_final`, whose output is the stage output.
pub fn relaxation_stage(structure: &Structure, acc: &Assessment, method: &str) -> Result<Flow, FlowError> {
    let relax = Job::new("mace_relax", RELAX)
        .with_input("structure", serde_json::to_value(structure)?)
        .with_input("method", method);
    let screening = Job::new("zeopp_final", SCREENING)
        .with_input("structure", relax.output().field("structure"))
        .with_input("force_converged", relax.output().field("force_converged"))
        .with_input("assessment", serde_json::to_value(acc)?);

    Ok(FlowBuilder::new("relaxation and re-assessment")
        .job(relax)
        .job(screening)
        .output_last()
        .build())
}

/// Handler `mof_screening`: one round of the discovery pipeline.
///
/// Inputs: `structure`, optional `assessment` (accumulator) and
/// `force_converged` (set when the structure comes out of a relaxation).
#[derive(Debug)]
pub struct MofScreening {
    analyzer: Arc<dyn PoreAnalyzer>,
    sorbates: Vec<String>,
    nproc: usize,
    relax_method: String,
}

impl MofScreening {
    pub fn new(
        analyzer: Arc<dyn PoreAnalyzer>,
        sorbates: Vec<String>,
        nproc: usize,
        relax_method: &str,
    ) -> Result<Self, FlowError> {
        validate_sorbates(&sorbates)?;
        Ok(Self {
            analyzer,
            sorbates,
            nproc,
            relax_method: relax_method.to_string(),
        })
    }
}

#[async_trait]
impl FunctionHandler for MofScreening {
    fn name(&self) -> &str {
        SCREENING
    }

    async fn execute(&self, params: Value, ctx: &Context) -> Result<Response> {
        let structure: Structure = input(&params, "structure")?;
        let acc = optional_input::<Assessment>(&params, "assessment")?.unwrap_or_default();
        let force_converged = optional_input::<bool>(&params, "force_converged")?;

        let raw = assess(self.analyzer.clone(), &structure, &self.sorbates, self.nproc).await?;
        let is_mof = raw.get("is_mof").and_then(Value::as_bool).unwrap_or(false);
        let acc = acc.fold(is_mof, force_converged);
        let stage = acc.stage();
        info!(job = %ctx.job_id, structure = %structure.name, ?stage, depth = ctx.depth, "Screening decided");

        match stage {
            Stage::Rejected | Stage::FinalAssessment => Ok(Response::Done(raw)),
            Stage::Relaxation => Ok(Response::Replace(relaxation_stage(
                &structure,
                &acc,
                &self.relax_method,
            )?)),
            Stage::Screening => bail!("accumulator still unclassified after pore analysis"),
        }
    }
}

/// Builds the discovery flow for one structure.
#[derive(Debug, Clone)]
pub struct MofDiscovery {
    pub name: String,
}

impl Default for MofDiscovery {
    fn default() -> Self {
        Self {
            name: "MOF discovery".to_string(),
        }
    }
}

impl MofDiscovery {
    /// One screening job; everything after it is decided at run time. Fails
    /// before anything is scheduled if the structure cannot be read.
    pub fn make(&self, source: impl Into<StructureSource>) -> Result<Flow, FlowError> {
        let structure = source.into().load()?;
        let screening = Job::new("zeopp_initial", SCREENING)
            .with_input("structure", serde_json::to_value(&structure)?)
            .with_input("assessment", serde_json::to_value(Assessment::default())?);

        Ok(FlowBuilder::new(&self.name).job(screening).output_last().build())
    }
}
