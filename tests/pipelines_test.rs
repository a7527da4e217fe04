use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use mofflow::actions::gcmc::{AdsorptionConditions, AdsorptionResult, AdsorptionSimulator, GcmcAdsorption};
use mofflow::actions::pipelines::{
    AdsorptionRequest, dft_follow_up, prepare_submission, relaxation_chain, submission_metadata,
};
use mofflow::actions::relax::{Relax, RelaxOutcome, Relaxer};
use mofflow::config::EngineSettings;
use mofflow::dsl::{Input, Metadata};
use mofflow::error::{FlowError, JobError};
use mofflow::runtime::engine::Engine;
use mofflow::structure::{Lattice, Structure};
use serde_json::json;

fn structure(num_sites: usize) -> Structure {
    Structure {
        name: "UiO-66".into(),
        lattice: Lattice {
            a: 20.7,
            b: 20.7,
            c: 20.7,
            alpha: 90.0,
            beta: 90.0,
            gamma: 90.0,
        },
        num_sites,
        cif: "data_UiO-66\n".into(),
    }
}

#[test]
fn test_relaxation_chain_tags_every_job() {
    let mut extra = Metadata::new();
    extra.insert("mof_id".into(), json!("UiO-66"));
    extra.insert("job_type".into(), json!("override"));

    let flow = relaxation_chain(&structure(114), None, &Metadata::new()).unwrap();
    let jobs: Vec<_> = flow.iter_jobs().collect();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].name, "MACE relax");
    assert_eq!(jobs[0].metadata["job_type"], json!("mace-relax"));
    assert_eq!(jobs[1].name, "GFN-xTB relax");
    assert_eq!(jobs[1].metadata["job_type"], json!("gfn-xtb-relax"));
    let feed = jobs[1].inputs["structure"].reference().unwrap();
    assert_eq!(feed.job_id, jobs[0].id);
    assert_eq!(feed.path, vec!["structure"]);
    assert_eq!(
        flow.output.as_ref().and_then(Input::reference).map(|r| r.job_id),
        Some(jobs[1].id)
    );

    // caller metadata wins over the job type
    let flow = relaxation_chain(&structure(114), None, &extra).unwrap();
    for job in flow.iter_jobs() {
        assert_eq!(job.metadata["job_type"], json!("override"));
        assert_eq!(job.metadata["mof_id"], json!("UiO-66"));
    }
}

#[test]
fn test_relaxation_chain_with_adsorption() {
    let request = AdsorptionRequest {
        sorbates: vec!["CO2".into(), "N2".into()],
        mole_fractions: vec![0.15, 0.85],
        ..AdsorptionRequest::default()
    };
    let flow = relaxation_chain(&structure(114), Some(&request), &Metadata::new()).unwrap();
    let jobs: Vec<_> = flow.iter_jobs().collect();

    assert_eq!(jobs.len(), 3);
    let gcmc = jobs[2];
    assert_eq!(gcmc.function, "gcmc_adsorption");
    assert_eq!(gcmc.metadata["job_type"], json!("gcmc"));
    assert_eq!(gcmc.inputs["sorbates"], Input::Value(json!(["CO2", "N2"])));
    assert_eq!(gcmc.inputs["temperature"], Input::Value(json!(298.0)));
    assert_eq!(gcmc.inputs["structure"].reference().map(|r| r.job_id), Some(jobs[1].id));

    let bad = AdsorptionRequest {
        sorbates: vec!["Mithril".into()],
        ..AdsorptionRequest::default()
    };
    assert!(matches!(
        relaxation_chain(&structure(114), Some(&bad), &Metadata::new()),
        Err(FlowError::UnknownSorbate(_))
    ));
}

#[test]
fn test_dft_follow_up() {
    let flow = dft_follow_up(&structure(114), Some("MACE")).unwrap();
    let jobs: Vec<_> = flow.iter_jobs().collect();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].name, "MACE pre-relax");
    assert_eq!(jobs[1].name, "r2SCAN-D4 relax and static");
    assert_eq!(jobs[1].inputs["static"], Input::Value(json!(true)));
    assert_eq!(jobs[1].inputs["structure"].reference().map(|r| r.job_id), Some(jobs[0].id));

    let flow = dft_follow_up(&structure(114), None).unwrap();
    let jobs: Vec<_> = flow.iter_jobs().collect();
    assert_eq!(jobs.len(), 1);
    assert!(matches!(jobs[0].inputs["structure"], Input::Value(_)));
}

#[test]
fn test_submission_priority_favours_small_cells() {
    let empty = Metadata::new();
    let priority = |sites| submission_metadata("x", &structure(sites), "mof discovery", &empty)["_priority"].clone();

    assert_eq!(priority(114), json!(5));
    assert_eq!(priority(512), json!(1));
    assert_eq!(priority(4000), json!(1));
    assert_eq!(priority(1), json!(512));
    assert_eq!(priority(0), json!(512));

    let mut extras = Metadata::new();
    extras.insert("attempt".into(), json!(2));
    let meta = submission_metadata("UiO-66", &structure(114), "relax chain", &extras);
    assert_eq!(meta["mof_id"], json!("UiO-66"));
    assert_eq!(meta["job_info"], json!("relax chain"));
    assert_eq!(meta["attempt"], json!(2));
}

#[test]
fn test_prepare_submission_names_and_tags() {
    let s = structure(114);
    let meta = submission_metadata("UiO-66", &s, "relax chain", &Metadata::new());
    let flow = relaxation_chain(&s, None, &Metadata::new()).unwrap();
    let ids = flow.job_ids();

    let submission = prepare_submission(flow, "UiO-66", meta.clone()).unwrap();

    assert_eq!(submission.name, "UiO-66 MOF relaxation chain");
    assert_eq!(submission.metadata, meta);
    assert_eq!(submission.priority(), Some(5));
    let jobs = &submission.blueprint.jobs;
    assert_eq!(jobs.iter().map(|j| j.id).collect::<Vec<_>>(), ids);
    assert_eq!(jobs[0].name, "UiO-66 MACE relax");
    for job in jobs {
        assert_eq!(job.metadata["mof_id"], json!("UiO-66"));
        assert_eq!(job.metadata["_priority"], json!(5));
    }

    // the queue unit survives the wire
    let text = serde_json::to_string(&submission).unwrap();
    assert_eq!(serde_json::from_str::<mofflow::runtime::blueprint::Submission>(&text).unwrap(), submission);
}

/// Tags the structure name with every method it went through.
#[derive(Debug, Default)]
struct TaggingRelaxer {
    calls: Mutex<Vec<(String, String, bool)>>,
    fail_on: Option<&'static str>,
}

#[async_trait]
impl Relaxer for TaggingRelaxer {
    async fn relax(&self, structure: &Structure, method: &str, static_run: bool) -> Result<RelaxOutcome> {
        self.calls
            .lock()
            .unwrap()
            .push((structure.name.clone(), method.to_string(), static_run));
        if self.fail_on == Some(method) {
            bail!("{} did not converge", method);
        }
        let mut relaxed = structure.clone();
        relaxed.name = format!("{}@{}", structure.name, method);
        Ok(RelaxOutcome {
            structure: relaxed,
            force_converged: true,
            energy: Some(-1.0),
        })
    }
}

#[derive(Debug, Default)]
struct RecordingSimulator {
    frameworks: Mutex<Vec<(String, AdsorptionConditions)>>,
}

#[async_trait]
impl AdsorptionSimulator for RecordingSimulator {
    async fn simulate(&self, structure: &Structure, conditions: &AdsorptionConditions) -> Result<AdsorptionResult> {
        self.frameworks
            .lock()
            .unwrap()
            .push((structure.name.clone(), conditions.clone()));
        Ok(AdsorptionResult {
            loading: 3.2,
            heat_of_adsorption: -6.4,
        })
    }
}

fn pipeline_engine(relaxer: Arc<TaggingRelaxer>, simulator: Arc<RecordingSimulator>) -> Engine {
    let mut engine = Engine::new(EngineSettings::default());
    engine.register_function(Arc::new(Relax::new(relaxer, "MACE")));
    engine.register_function(Arc::new(GcmcAdsorption::new(simulator, 9.0)));
    engine
}

#[tokio::test]
async fn test_relaxation_chain_hands_the_structure_down() {
    let relaxer = Arc::new(TaggingRelaxer::default());
    let simulator = Arc::new(RecordingSimulator::default());
    let engine = pipeline_engine(relaxer.clone(), simulator.clone());

    let flow = relaxation_chain(&structure(114), Some(&AdsorptionRequest::default()), &Metadata::new()).unwrap();
    let execution = engine.run(flow).await.unwrap();

    assert!(execution.is_success());
    assert_eq!(
        relaxer.calls.lock().unwrap().clone(),
        vec![
            ("UiO-66".to_string(), "MACE".to_string(), false),
            ("UiO-66@MACE".to_string(), "GFN-xTB".to_string(), false),
        ]
    );
    let frameworks = simulator.frameworks.lock().unwrap().clone();
    assert_eq!(frameworks.len(), 1);
    assert_eq!(frameworks[0].0, "UiO-66@MACE@GFN-xTB");
    assert_eq!(frameworks[0].1.sorbates, vec!["CO2".to_string()]);
    assert_eq!(frameworks[0].1.unit_cells, [1, 1, 1]);

    let output = execution.output.unwrap();
    assert_eq!(output["loading"], json!(3.2));
    assert_eq!(output["conditions"]["temperature"], json!(298.0));
}

#[tokio::test]
async fn test_relaxation_chain_failure_keeps_job_types() {
    let relaxer = Arc::new(TaggingRelaxer {
        fail_on: Some("GFN-xTB"),
        ..TaggingRelaxer::default()
    });
    let simulator = Arc::new(RecordingSimulator::default());
    let engine = pipeline_engine(relaxer, simulator.clone());

    let mut meta = Metadata::new();
    meta.insert("mof_id".into(), json!("UiO-66"));
    let flow = relaxation_chain(&structure(114), Some(&AdsorptionRequest::default()), &meta).unwrap();
    let mace_id = flow.iter_jobs().next().unwrap().id;
    let execution = engine.run(flow).await.unwrap();

    assert!(!execution.is_success());
    assert!(execution.outputs.contains_key(&mace_id));
    assert!(simulator.frameworks.lock().unwrap().is_empty());

    assert_eq!(execution.failures.len(), 2);
    let tb = &execution.failures[0];
    assert_eq!(tb.name, "GFN-xTB relax");
    assert_eq!(tb.metadata["job_type"], json!("gfn-xtb-relax"));
    assert_eq!(tb.metadata["mof_id"], json!("UiO-66"));
    assert_eq!(tb.error, JobError::Handler("GFN-xTB did not converge".into()));

    let gcmc = &execution.failures[1];
    assert_eq!(gcmc.metadata["job_type"], json!("gcmc"));
    assert_eq!(gcmc.error, JobError::Upstream(tb.job_id));
}

#[tokio::test]
async fn test_dft_follow_up_runs_static_after_pre_relax() {
    let relaxer = Arc::new(TaggingRelaxer::default());
    let engine = pipeline_engine(relaxer.clone(), Arc::new(RecordingSimulator::default()));

    let execution = engine.run(dft_follow_up(&structure(114), Some("MACE")).unwrap()).await.unwrap();

    assert!(execution.is_success());
    assert_eq!(
        relaxer.calls.lock().unwrap().clone(),
        vec![
            ("UiO-66".to_string(), "MACE".to_string(), false),
            ("UiO-66@MACE".to_string(), "r2SCAN-D4".to_string(), true),
        ]
    );
    let output = execution.output.unwrap();
    assert_eq!(output["method"], json!("r2SCAN-D4"));
    assert_eq!(output["structure"]["name"], json!("UiO-66@MACE@r2SCAN-D4"));
}
