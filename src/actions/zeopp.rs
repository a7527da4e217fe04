use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::actions::{FunctionHandler, input, optional_input, scratch_dir};
use crate::error::{FlowError, ToolError};
use crate::runtime::context::Context;
use crate::runtime::response::Response;
use crate::structure::Structure;

/// Sorbate kinetic diameters in Å (doi:10.1039/B802426J).
pub const KINETIC_DIAMETERS: &[(&str, f64)] = &[
    // noble gases
    ("He", 2.551),
    ("Ne", 2.82),
    ("Ar", 3.542),
    ("Kr", 3.655),
    ("Xe", 4.047),
    // diatomic gases
    ("H2", 2.8585),
    ("D2", 2.8585),
    ("N2", 3.72),
    ("O2", 3.467),
    ("Cl2", 4.217),
    ("Br2", 4.296),
    // oxides
    ("CO", 3.69),
    ("CO2", 3.3),
    ("NO", 3.492),
    ("N2O", 3.838),
    ("SO2", 4.112),
    ("COS", 4.130),
    // others
    ("H2O", 2.641),
    ("CH4", 3.758),
    ("NH3", 3.62),
    ("H2S", 3.623),
];

/// Probe radius for a sorbate: half its kinetic diameter.
pub fn probe_radius(sorbate: &str) -> Result<f64, FlowError> {
    KINETIC_DIAMETERS
        .iter()
        .find(|(name, _)| *name == sorbate)
        .map(|(_, d)| d * 0.5)
        .ok_or_else(|| FlowError::UnknownSorbate(sorbate.to_string()))
}

pub fn validate_sorbates(sorbates: &[String]) -> Result<(), FlowError> {
    if sorbates.is_empty() {
        return Err(FlowError::Config("at least one sorbate is required".into()));
    }
    for s in sorbates {
        probe_radius(s)?;
    }
    Ok(())
}

/// 孔结构分析协作者
///
/// One call covers one probe: accessible volume and pore diameters.
#[async_trait]
pub trait PoreAnalyzer: Send + Sync + Debug {
    async fn analyze(&self, structure: &Structure, sorbate: &str, radius: f64) -> Result<Map<String, Value>>;
}

/// zeo++ `network` binary driven as a subprocess.
#[derive(Debug, Clone)]
pub struct ZeoppCli {
    binary: PathBuf,
    samples: u64,
    working_dir: PathBuf,
}

impl ZeoppCli {
    pub fn new(binary: PathBuf, samples: u64, working_dir: PathBuf) -> Self {
        Self {
            binary,
            samples,
            working_dir,
        }
    }

    async fn invoke(&self, args: &[String], output: &Path, cif: &Path) -> Result<()> {
        debug!(binary = %self.binary.display(), ?args, output = %output.display(), "Running zeo++");
        let out = Command::new(&self.binary)
            .args(args)
            .arg(output)
            .arg(cif)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to launch {}", self.binary.display()))?;

        if !out.status.success() {
            return Err(ToolError {
                tool: self.binary.display().to_string(),
                exit_code: out.status.code(),
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl PoreAnalyzer for ZeoppCli {
    async fn analyze(&self, structure: &Structure, sorbate: &str, radius: f64) -> Result<Map<String, Value>> {
        let stem = format!("{}_{}", structure.name, sorbate);
        let scratch = scratch_dir(&self.working_dir, &stem)?;
        let cif = structure
            .write_cif(scratch.path(), &format!("{}.cif", stem))
            .with_context(|| format!("failed to write CIF into {}", scratch.path().display()))?;
        let r = radius.to_string();
        let samples = self.samples.to_string();

        let volpo = scratch.path().join(format!("{}.volpo", stem));
        let args = ["-ha", "-volpo", r.as_str(), r.as_str(), samples.as_str()].map(String::from);
        self.invoke(&args, &volpo, &cif).await?;
        let mut metrics = parse_volpo(&tokio::fs::read_to_string(&volpo).await?);

        let res = scratch.path().join(format!("{}.res", stem));
        let args = ["-ha", "-res"].map(String::from);
        self.invoke(&args, &res, &cif).await?;
        metrics.extend(parse_res(&tokio::fs::read_to_string(&res).await?)?);

        Ok(metrics)
    }
}

/// Parses a `.volpo` report: every `key:` token is followed by its value.
/// `PROBE_OCCUPIABLE` lines only repeat earlier numbers and are skipped.
pub fn parse_volpo(text: &str) -> Map<String, Value> {
    let mut output = Map::new();
    for line in text.lines() {
        if line.contains("PROBE_OCCUPIABLE") {
            continue;
        }
        let mut key: Option<&str> = None;
        for token in line.split_whitespace() {
            if let Some((k, _)) = token.split_once(':') {
                key = Some(k);
            } else if let Some(k) = key.take() {
                let value = match token.parse::<f64>() {
                    Ok(n) => Value::from(n),
                    Err(_) => Value::String(token.to_string()),
                };
                output.insert(k.to_string(), value);
            }
        }
    }
    output
}

/// Parses a `.res` report: `<file> <LCD> <PLD> ...`.
pub fn parse_res(text: &str) -> Result<Map<String, Value>> {
    let data: Vec<&str> = text.split_whitespace().collect();
    let field = |idx: usize, label: &str| -> Result<f64> {
        data.get(idx)
            .ok_or_else(|| anyhow!("res output has no {} column", label))?
            .parse::<f64>()
            .with_context(|| format!("res output has a non-numeric {}", label))
    };

    let mut output = Map::new();
    output.insert("LCD".into(), Value::from(field(1, "LCD")?));
    output.insert("PLD".into(), Value::from(field(2, "PLD")?));
    Ok(output)
}

/// MOF classification from the N2 probe. All five metrics must be present.
pub fn is_mof(n2: Option<&Map<String, Value>>) -> bool {
    let Some(n2) = n2 else {
        return false;
    };
    let get = |k: &str| n2.get(k).and_then(Value::as_f64);
    match (
        get("PLD"),
        get("POAV_A^3"),
        get("PONAV_A^3"),
        get("POAV_Volume_fraction"),
        get("PONAV_Volume_fraction"),
    ) {
        (Some(pld), Some(poav), Some(ponav), Some(poav_frac), Some(ponav_frac)) => {
            pld > 2.5 && poav_frac > 0.3 && poav > ponav && poav_frac > ponav_frac
        }
        _ => false,
    }
}

/// Raised by [`assess`] when at least one probe failed.
#[derive(Debug)]
pub struct AssessmentFailure {
    /// Sorbates whose probe did not finish, in request order.
    pub failed: Vec<String>,
    /// Metrics of every probe that finished, keyed by sorbate.
    pub completed: Map<String, Value>,
    pub error: anyhow::Error,
}

impl fmt::Display for AssessmentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pore analysis failed for {} ({} probe(s) finished): {:#}",
            self.failed.join(", "),
            self.completed.len(),
            self.error
        )
    }
}

impl std::error::Error for AssessmentFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let inner: &(dyn std::error::Error + 'static) = self.error.as_ref();
        Some(inner)
    }
}

/// Runs every probe and classifies the structure.
///
/// Probes are dealt round-robin to `min(nproc, sorbates)` workers. Each
/// worker fills its own map; the maps are merged only after every worker
/// joined. A failing probe does not stop the others: the error is a
/// [`AssessmentFailure`] that still carries every finished probe's metrics.
pub async fn assess(
    analyzer: Arc<dyn PoreAnalyzer>,
    structure: &Structure,
    sorbates: &[String],
    nproc: usize,
) -> Result<Value> {
    if sorbates.is_empty() {
        bail!("no sorbates requested");
    }
    let workers = nproc.clamp(1, sorbates.len());
    let mut batches: Vec<Vec<String>> = vec![Vec::new(); workers];
    for (i, sorbate) in sorbates.iter().enumerate() {
        batches[i % workers].push(sorbate.clone());
    }

    let shared = Arc::new(structure.clone());
    let mut set = JoinSet::new();
    let mut assigned = HashMap::new();
    for batch in batches {
        let analyzer = analyzer.clone();
        let structure = shared.clone();
        let owned = batch.clone();
        let handle = set.spawn(async move {
            let mut slot = Map::new();
            let mut errors = Vec::new();
            for sorbate in batch {
                let metrics = match probe_radius(&sorbate) {
                    Ok(radius) => analyzer.analyze(&structure, &sorbate, radius).await,
                    Err(e) => Err(e.into()),
                };
                match metrics {
                    Ok(metrics) => {
                        slot.insert(sorbate, Value::Object(metrics));
                    }
                    Err(e) => errors.push((sorbate, e)),
                }
            }
            (slot, errors)
        });
        assigned.insert(handle.id(), owned);
    }

    // barrier
    let mut merged = Map::new();
    let mut errors: Vec<(String, anyhow::Error)> = Vec::new();
    while let Some(joined) = set.join_next_with_id().await {
        match joined {
            Ok((_, (slot, failed))) => {
                merged.extend(slot);
                errors.extend(failed);
            }
            Err(e) => {
                let batch = assigned.remove(&e.id()).unwrap_or_default();
                for sorbate in batch.into_iter().filter(|s| !merged.contains_key(s)) {
                    errors.push((sorbate, anyhow!("probe worker panicked: {}", e)));
                }
            }
        }
    }
    if !errors.is_empty() {
        let failed: Vec<String> = sorbates
            .iter()
            .filter(|s| errors.iter().any(|(f, _)| f == *s))
            .cloned()
            .collect();
        let first = failed.first().and_then(|name| errors.iter().position(|(f, _)| f == name)).unwrap_or(0);
        let (_, error) = errors.swap_remove(first);
        warn!(failed = ?failed, finished = merged.len(), "Pore analysis incomplete");
        return Err(AssessmentFailure {
            failed,
            completed: merged,
            error,
        }
        .into());
    }

    let mut output = Map::new();
    for sorbate in sorbates {
        let metrics = merged.remove(sorbate).unwrap_or_else(|| Value::Object(Map::new()));
        output.insert(sorbate.clone(), metrics);
    }
    let classified = is_mof(output.get("N2").and_then(Value::as_object));
    output.insert("is_mof".into(), Value::Bool(classified));
    output.insert("structure".into(), serde_json::to_value(structure)?);
    Ok(Value::Object(output))
}

/// Handler `zeopp_assessment`: inputs `structure`, optional `sorbates`.
#[derive(Debug)]
pub struct PoreAssessment {
    analyzer: Arc<dyn PoreAnalyzer>,
    sorbates: Vec<String>,
    nproc: usize,
}

impl PoreAssessment {
    pub fn new(analyzer: Arc<dyn PoreAnalyzer>, sorbates: Vec<String>, nproc: usize) -> Result<Self, FlowError> {
        validate_sorbates(&sorbates)?;
        Ok(Self {
            analyzer,
            sorbates,
            nproc,
        })
    }
}

#[async_trait]
impl FunctionHandler for PoreAssessment {
    fn name(&self) -> &str {
        "zeopp_assessment"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        if let Some(sorbates) = optional_input::<Vec<String>>(params, "sorbates")? {
            validate_sorbates(&sorbates)?;
        }
        Ok(())
    }

    async fn execute(&self, params: Value, _ctx: &Context) -> Result<Response> {
        let structure: Structure = input(&params, "structure")?;
        let sorbates = optional_input::<Vec<String>>(&params, "sorbates")?.unwrap_or_else(|| self.sorbates.clone());
        let output = assess(self.analyzer.clone(), &structure, &sorbates, self.nproc).await?;
        Ok(Response::Done(output))
    }
}
