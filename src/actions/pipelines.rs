use serde_json::Value;

use crate::actions::discovery::RELAX;
use crate::actions::zeopp::validate_sorbates;
use crate::compiler::core::Compiler;
use crate::dsl::builder::FlowBuilder;
use crate::dsl::{Flow, Input, Job, Metadata};
use crate::error::FlowError;
use crate::runtime::blueprint::Submission;
use crate::structure::Structure;

/// Optional adsorption step at the end of the relaxation chain.
#[derive(Debug, Clone)]
pub struct AdsorptionRequest {
    pub sorbates: Vec<String>,
    pub mole_fractions: Vec<f64>,
    pub temperature: f64,
    pub pressure: f64,
}

impl Default for AdsorptionRequest {
    fn default() -> Self {
        Self {
            sorbates: vec!["CO2".into()],
            mole_fractions: vec![1.0],
            temperature: 298.0,
            pressure: 101_325.0,
        }
    }
}

/// `{"job_type": .., **extra}`: caller metadata wins over the job type.
fn tagged(job_type: &str, extra: &Metadata) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert("job_type".into(), Value::from(job_type));
    for (k, v) in extra {
        meta.insert(k.clone(), v.clone());
    }
    meta
}

/// 线性扩展：力场弛豫 -> 紧束缚弛豫 -> 可选 GCMC
pub fn relaxation_chain(
    structure: &Structure,
    adsorption: Option<&AdsorptionRequest>,
    job_meta: &Metadata,
) -> Result<Flow, FlowError> {
    let mut mace = Job::new("MACE relax", RELAX)
        .with_input("structure", serde_json::to_value(structure)?)
        .with_input("method", "MACE");
    mace.metadata = tagged("mace-relax", job_meta);

    let mut tb = Job::new("GFN-xTB relax", RELAX)
        .with_input("structure", mace.output().field("structure"))
        .with_input("method", "GFN-xTB");
    tb.metadata = tagged("gfn-xtb-relax", job_meta);

    let mut builder = FlowBuilder::new("MOF relaxation chain");
    builder = builder.job(mace);
    let tb_structure = tb.output().field("structure");
    builder = builder.job(tb);

    if let Some(request) = adsorption {
        validate_sorbates(&request.sorbates)?;
        let mut gcmc = Job::new("GCMC adsorption", "gcmc_adsorption")
            .with_input("structure", tb_structure)
            .with_input("sorbates", serde_json::to_value(&request.sorbates)?)
            .with_input("mole_fractions", serde_json::to_value(&request.mole_fractions)?)
            .with_input("temperature", request.temperature)
            .with_input("pressure", request.pressure);
        gcmc.metadata = tagged("gcmc", job_meta);
        builder = builder.job(gcmc);
    }

    Ok(builder.output_last().build())
}

/// DFT follow-up: optional force-field pre-relaxation, then a DFT relaxation
/// with a final static calculation.
pub fn dft_follow_up(structure: &Structure, pre_relax_method: Option<&str>) -> Result<Flow, FlowError> {
    let mut builder = FlowBuilder::new("DFT relax and static");

    let dft_input: Input = match pre_relax_method {
        Some(method) => {
            let pre = Job::new(&format!("{} pre-relax", method), RELAX)
                .with_input("structure", serde_json::to_value(structure)?)
                .with_input("method", method);
            let reference = pre.output().field("structure");
            builder = builder.job(pre);
            reference.into()
        }
        None => serde_json::to_value(structure)?.into(),
    };

    let dft = Job::new("r2SCAN-D4 relax and static", RELAX)
        .with_input("structure", dft_input)
        .with_input("method", "r2SCAN-D4")
        .with_input("static", true);

    Ok(builder.job(dft).output_last().build())
}

/// Tags attached to every unit sent to the queue.
///
/// Smaller cells get a higher priority: `max(1, ceil(512 / n_sites))`.
pub fn submission_metadata(mof_id: &str, structure: &Structure, job_info: &str, extras: &Metadata) -> Metadata {
    let sites = structure.num_sites.max(1) as f64;
    let priority = (512.0 / sites).ceil().max(1.0) as i64;

    let mut meta = Metadata::new();
    meta.insert("_priority".into(), Value::from(priority));
    meta.insert("job_info".into(), Value::from(job_info));
    meta.insert("mof_id".into(), Value::from(mof_id));
    meta.insert("attempt".into(), Value::from(1));
    for (k, v) in extras {
        meta.insert(k.clone(), v.clone());
    }
    meta
}

/// Tags `flow` with `metadata`, prefixes every name with `"{mof_id} "` and
/// packs it for the queue.
pub fn prepare_submission(mut flow: Flow, mof_id: &str, metadata: Metadata) -> Result<Submission, FlowError> {
    flow.update_metadata(&metadata);
    flow.append_name(&format!("{} ", mof_id), true);
    let blueprint = Compiler::new().compile(flow)?;
    Ok(Submission::new(blueprint, metadata))
}
