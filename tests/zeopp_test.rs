use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use mofflow::actions::zeopp::{
    AssessmentFailure, PoreAnalyzer, PoreAssessment, assess, is_mof, parse_res, parse_volpo, probe_radius,
    validate_sorbates,
};
use mofflow::config::EngineSettings;
use mofflow::dsl::Job;
use mofflow::dsl::builder::FlowBuilder;
use mofflow::error::{FlowError, JobError, ToolError};
use mofflow::runtime::engine::Engine;
use mofflow::structure::Structure;
use serde_json::{Map, Value, json};

const CIF: &str = "data_EDI
_cell_length_a 6.926(1)
_cell_length_b 6.926(1)
_cell_length_c 6.410(2)
_cell_angle_alpha 90
_cell_angle_beta 90
_cell_angle_gamma 90
loop_
_atom_site_label
_atom_site_fract_x
_atom_site_fract_y
_atom_site_fract_z
Si1 0.0 0.0 0.0
O1 0.5 0.0 0.2
";

const VOLPO: &str = "@ EDI.volpo Unitcell_volume: 307.484 Density: 1.48739 POAV_A^3: 131.284 POAV_Volume_fraction: 0.42696 POAV_cm^3/g: 0.287047 PONAV_A^3: 0 PONAV_Volume_fraction: 0 PONAV_cm^3/g: 0
Number_of_channels: 1 Channel_volume_A^3: 131.284
PROBE_OCCUPIABLE_VOLUME: 999 Fraction: 9.9
";

fn structure() -> Structure {
    Structure::from_cif_str("EDI", CIF).unwrap()
}

fn n2(pld: f64, poav: f64, ponav: f64, poav_frac: f64, ponav_frac: f64) -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("PLD".into(), json!(pld));
    m.insert("POAV_A^3".into(), json!(poav));
    m.insert("PONAV_A^3".into(), json!(ponav));
    m.insert("POAV_Volume_fraction".into(), json!(poav_frac));
    m.insert("PONAV_Volume_fraction".into(), json!(ponav_frac));
    m
}

#[test]
fn test_probe_radius_is_half_the_kinetic_diameter() {
    assert_eq!(probe_radius("N2").unwrap(), 1.86);
    assert_eq!(probe_radius("CO2").unwrap(), 1.65);
    assert!(matches!(probe_radius("Vibranium"), Err(FlowError::UnknownSorbate(_))));
    assert!(validate_sorbates(&[]).is_err());
    assert!(validate_sorbates(&["N2".into(), "H2O".into()]).is_ok());
}

#[test]
fn test_parse_volpo() {
    let metrics = parse_volpo(VOLPO);
    assert_eq!(metrics["Unitcell_volume"], json!(307.484));
    assert_eq!(metrics["POAV_Volume_fraction"], json!(0.42696));
    assert_eq!(metrics["PONAV_A^3"], json!(0.0));
    assert_eq!(metrics["POAV_cm^3/g"], json!(0.287047));
    assert_eq!(metrics["Number_of_channels"], json!(1.0));
    // PROBE_OCCUPIABLE lines are skipped
    assert!(!metrics.contains_key("Fraction"));
}

#[test]
fn test_parse_res() {
    let metrics = parse_res("EDI.res    4.89082 3.03868  4.81969\n").unwrap();
    assert_eq!(metrics["LCD"], json!(4.89082));
    assert_eq!(metrics["PLD"], json!(3.03868));

    assert!(parse_res("EDI.res").is_err());
    assert!(parse_res("EDI.res abc 1.0").is_err());
}

#[test]
fn test_is_mof_needs_all_four_conditions() {
    assert!(is_mof(Some(&n2(3.0, 100.0, 10.0, 0.5, 0.05))));
    // PLD too small
    assert!(!is_mof(Some(&n2(2.5, 100.0, 10.0, 0.5, 0.05))));
    // not porous enough
    assert!(!is_mof(Some(&n2(3.0, 100.0, 10.0, 0.3, 0.05))));
    // non-accessible volume dominates
    assert!(!is_mof(Some(&n2(3.0, 10.0, 100.0, 0.5, 0.05))));
    assert!(!is_mof(Some(&n2(3.0, 100.0, 10.0, 0.5, 0.6))));

    let mut partial = n2(3.0, 100.0, 10.0, 0.5, 0.05);
    partial.remove("PONAV_A^3");
    assert!(!is_mof(Some(&partial)));
    assert!(!is_mof(None));
}

#[derive(Debug, Default)]
struct RecordingAnalyzer {
    concurrent: AtomicUsize,
    peak: AtomicUsize,
    fail_on: Option<&'static str>,
}

#[async_trait]
impl PoreAnalyzer for RecordingAnalyzer {
    async fn analyze(&self, _structure: &Structure, sorbate: &str, radius: f64) -> Result<Map<String, Value>> {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.concurrent.fetch_sub(1, Ordering::SeqCst);

        if self.fail_on == Some(sorbate) {
            bail!("probe {} crashed", sorbate);
        }
        let mut metrics = if sorbate == "N2" {
            n2(4.0, 500.0, 5.0, 0.55, 0.01)
        } else {
            Map::new()
        };
        metrics.insert("radius".into(), json!(radius));
        Ok(metrics)
    }
}

#[tokio::test]
async fn test_assess_fans_out_and_merges_after_the_barrier() {
    let analyzer = Arc::new(RecordingAnalyzer::default());
    let sorbates: Vec<String> = ["N2", "CO2", "H2O"].iter().map(|s| s.to_string()).collect();

    let output = assess(analyzer.clone(), &structure(), &sorbates, 2).await.unwrap();

    for s in &sorbates {
        let radius = output[s.as_str()]["radius"].as_f64().unwrap();
        assert_eq!(radius, probe_radius(s).unwrap());
    }
    assert_eq!(output["is_mof"], json!(true));
    assert_eq!(output["structure"]["name"], json!("EDI"));
    let peak = analyzer.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak concurrency {}", peak);
}

#[tokio::test]
async fn test_assess_single_worker_is_sequential() {
    let analyzer = Arc::new(RecordingAnalyzer::default());
    let sorbates = vec!["N2".to_string(), "CH4".to_string()];

    let output = assess(analyzer.clone(), &structure(), &sorbates, 1).await.unwrap();

    assert_eq!(analyzer.peak.load(Ordering::SeqCst), 1);
    assert!(output.get("CH4").is_some());
}

#[tokio::test]
async fn test_assess_reports_a_failing_probe() {
    let analyzer = Arc::new(RecordingAnalyzer {
        fail_on: Some("CO2"),
        ..RecordingAnalyzer::default()
    });
    let sorbates = vec!["N2".to_string(), "CO2".to_string(), "H2O".to_string()];

    let err = assess(analyzer, &structure(), &sorbates, 3).await.unwrap_err();
    assert!(err.to_string().contains("probe CO2 crashed"));

    // the siblings' metrics survive the failure
    let failure = err.downcast_ref::<AssessmentFailure>().expect("partial assessment");
    assert_eq!(failure.failed, vec!["CO2".to_string()]);
    assert_eq!(failure.completed.len(), 2);
    assert_eq!(failure.completed["N2"]["PLD"], json!(4.0));
    assert_eq!(failure.completed["N2"]["radius"], json!(1.86));
    assert_eq!(failure.completed["H2O"]["radius"], json!(probe_radius("H2O").unwrap()));
}

#[tokio::test]
async fn test_assess_keeps_going_after_a_failure_in_the_same_batch() {
    let analyzer = Arc::new(RecordingAnalyzer {
        fail_on: Some("N2"),
        ..RecordingAnalyzer::default()
    });
    let sorbates = vec!["N2".to_string(), "CO2".to_string(), "H2O".to_string()];

    let err = assess(analyzer, &structure(), &sorbates, 1).await.unwrap_err();
    let failure = err.downcast_ref::<AssessmentFailure>().expect("partial assessment");
    assert_eq!(failure.failed, vec!["N2".to_string()]);
    assert!(failure.completed.contains_key("CO2"));
    assert!(failure.completed.contains_key("H2O"));
}

#[derive(Debug)]
struct BrokenBinary;

#[async_trait]
impl PoreAnalyzer for BrokenBinary {
    async fn analyze(&self, _structure: &Structure, sorbate: &str, _radius: f64) -> Result<Map<String, Value>> {
        if sorbate == "CO2" {
            return Err(ToolError {
                tool: "network".into(),
                exit_code: Some(11),
                stdout: String::new(),
                stderr: "segmentation fault".into(),
            }
            .into());
        }
        Ok(Map::new())
    }
}

#[tokio::test]
async fn test_tool_diagnostics_survive_a_partial_assessment() {
    let mut engine = Engine::new(EngineSettings::default());
    engine.register_function(Arc::new(
        PoreAssessment::new(Arc::new(BrokenBinary), vec!["N2".into(), "CO2".into()], 2).unwrap(),
    ));
    let job = Job::new("pores", "zeopp_assessment").with_input("structure", serde_json::to_value(structure()).unwrap());
    let execution = engine.run(FlowBuilder::new("pore").job(job).build()).await.unwrap();

    match &execution.failures[0].error {
        JobError::Tool(tool) => {
            assert_eq!(tool.exit_code, Some(11));
            assert_eq!(tool.stderr, "segmentation fault");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_pore_assessment_rejects_unknown_sorbate_input() {
    let analyzer = Arc::new(RecordingAnalyzer::default());
    let mut engine = Engine::new(EngineSettings::default());
    engine.register_function(Arc::new(
        PoreAssessment::new(analyzer.clone(), vec!["N2".into()], 1).unwrap(),
    ));

    let good = Job::new("probe", "zeopp_assessment")
        .with_input("structure", serde_json::to_value(structure()).unwrap())
        .with_input("sorbates", json!(["N2", "Ar"]));
    let good_id = good.id;
    let bad = Job::new("bad probe", "zeopp_assessment")
        .with_input("structure", serde_json::to_value(structure()).unwrap())
        .with_input("sorbates", json!(["Kryptonite"]));

    // rejected while building the run, nothing is analyzed
    let flow = FlowBuilder::new("pore").job(good.clone()).job(bad).build();
    match engine.run(flow).await.unwrap_err() {
        FlowError::UnknownSorbate(name) => assert_eq!(name, "Kryptonite"),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(analyzer.peak.load(Ordering::SeqCst), 0);

    let execution = engine.run(FlowBuilder::new("pore").job(good).build()).await.unwrap();
    assert!(execution.outputs[&good_id].get("Ar").is_some());
}

#[cfg(unix)]
mod cli {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    use mofflow::actions::zeopp::{PoreAnalyzer, ZeoppCli};
    use mofflow::error::ToolError;
    use mofflow::structure::Structure;
    use serde_json::json;

    use super::{CIF, VOLPO, structure};

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("network");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_zeopp_cli_runs_both_passes() {
        let dir = tempfile::tempdir().unwrap();
        let volpo = dir.path().join("fixture.volpo");
        std::fs::write(&volpo, VOLPO).unwrap();
        // -ha -volpo r r samples OUT CIF / -ha -res OUT CIF
        let body = format!(
            "case \"$2\" in\n  -volpo) cp {} \"$6\" ;;\n  -res) echo \"$4 4.89 3.04 4.82\" > \"$3\" ;;\nesac",
            volpo.display()
        );
        let binary = script(dir.path(), &body);
        let work = dir.path().join("work");

        let cli = ZeoppCli::new(binary, 1000, work.clone());
        let metrics = cli.analyze(&structure(), "N2", 1.86).await.unwrap();

        assert_eq!(metrics["PLD"], json!(3.04));
        assert_eq!(metrics["LCD"], json!(4.89));
        assert_eq!(metrics["POAV_A^3"], json!(131.284));
        // scratch files go away with the call
        assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);
    }

    fn with_cell_a(a: f64) -> Structure {
        let text = CIF.replace("_cell_length_a 6.926(1)", &format!("_cell_length_a {}", a));
        Structure::from_cif_str("x", &text).unwrap()
    }

    #[tokio::test]
    async fn test_same_name_structures_do_not_share_files() {
        let dir = tempfile::tempdir().unwrap();
        // reads the cell back from its own CIF after a pause
        let body = "case \"$2\" in\n  -volpo) sleep 0.3; A=$(awk '/_cell_length_a/ {print $2}' \"$7\"); echo \"@ x.volpo Unitcell_volume: $A\" > \"$6\" ;;\n  -res) echo \"$4 4.89 3.04 4.82\" > \"$3\" ;;\nesac";
        let binary = script(dir.path(), body);
        let cli = ZeoppCli::new(binary, 1000, dir.path().join("work"));

        let (first, second) = (with_cell_a(11.0), with_cell_a(22.0));
        assert_eq!(first.name, second.name);
        let (a, b) = tokio::join!(cli.analyze(&first, "N2", 1.86), cli.analyze(&second, "N2", 1.86));

        assert_eq!(a.unwrap()["Unitcell_volume"], json!(11.0));
        assert_eq!(b.unwrap()["Unitcell_volume"], json!(22.0));
    }

    #[tokio::test]
    async fn test_zeopp_cli_failure_keeps_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(dir.path(), "echo 'reading cif'\necho 'bad cell' >&2\nexit 3");

        let cli = ZeoppCli::new(binary, 1000, dir.path().join("work"));
        let err = cli.analyze(&structure(), "N2", 1.86).await.unwrap_err();

        let tool = err.downcast_ref::<ToolError>().expect("tool error");
        assert_eq!(tool.exit_code, Some(3));
        assert_eq!(tool.stdout.trim(), "reading cif");
        assert_eq!(tool.stderr.trim(), "bad cell");
    }
}
