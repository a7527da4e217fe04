use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::{error, info, warn};

use mofflow::actions::discovery::MofDiscovery;
use mofflow::actions::pipelines::{
    AdsorptionRequest, dft_follow_up, prepare_submission, relaxation_chain, submission_metadata,
};
use mofflow::actions::register_standard_functions;
use mofflow::compiler::loader::{load_flow_from_yaml, load_settings_from_yaml};
use mofflow::config::Settings;
use mofflow::dsl::{Flow, Metadata};
use mofflow::runtime::engine::{Engine, Execution};
use mofflow::runtime::redis_storage::{RedisStateStore, RedisTaskQueue};
use mofflow::runtime::storage::TaskQueue;
use mofflow::runtime::trace::named_report;
use mofflow::structure::Structure;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (YAML)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// zeo++ `network` binary
    #[arg(long, env = "ZEO_PATH", global = true)]
    zeo_path: Option<PathBuf>,

    /// Relaxation driver program
    #[arg(long, env = "MOFFLOW_RELAX_PROGRAM", global = true)]
    relax_program: Option<PathBuf>,

    /// GCMC driver program
    #[arg(long, env = "MOFFLOW_GCMC_PROGRAM", global = true)]
    gcmc_program: Option<PathBuf>,

    /// Probe workers per pore analysis
    #[arg(long, global = true)]
    nproc: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Pipeline {
    /// Pore screening with conditional relaxation
    Discovery,
    /// Force-field relax, tight-binding relax
    RelaxChain,
    /// Relaxation chain followed by a CO2 adsorption simulation
    Adsorption,
    /// Force-field pre-relax, then DFT relax and static
    Dft,
}

#[derive(Subcommand)]
enum Commands {
    /// Run locally: a CIF file, a directory of CIFs, or a flow YAML file
    Run {
        path: PathBuf,

        #[arg(long, value_enum, default_value = "discovery")]
        pipeline: Pipeline,
    },

    /// Submit one unit per CIF to the Redis queue
    Submit {
        path: PathBuf,

        #[arg(long, value_enum, default_value = "discovery")]
        pipeline: Pipeline,

        #[arg(long, env = "MOFFLOW_REDIS")]
        redis: Option<String>,

        #[arg(long, default_value = "mof discovery")]
        job_info: String,

        /// Extra metadata (key=value), attached to every unit
        #[arg(long, short = 'M', value_parser = parse_key_val)]
        meta: Vec<(String, Value)>,
    },

    /// Pop submissions from the Redis queue and run them
    Worker {
        #[arg(long, env = "MOFFLOW_REDIS")]
        redis: Option<String>,

        /// Worker name (for logging)
        #[arg(long, default_value = "worker")]
        name: String,
    },
}

fn parse_key_val(s: &str) -> Result<(String, Value), String> {
    let (key, val_str) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    // JSON if it parses, plain string otherwise
    let val = serde_json::from_str(val_str).unwrap_or_else(|_| Value::String(val_str.to_string()));
    Ok((key.to_string(), val))
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => load_settings_from_yaml(path)?,
        None => Settings::default(),
    };
    if let Some(p) = &cli.zeo_path {
        settings.zeopp.binary = Some(p.clone());
    }
    if let Some(p) = &cli.relax_program {
        settings.relax.program = Some(p.clone());
    }
    if let Some(p) = &cli.gcmc_program {
        settings.gcmc.program = Some(p.clone());
    }
    if let Some(n) = cli.nproc {
        settings.zeopp.nproc = n;
    }
    settings.validate()?;
    Ok(settings)
}

fn collect_cifs(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut cifs: Vec<PathBuf> = fs::read_dir(path)
        .with_context(|| format!("Failed to list {}", path.display()))?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("cif"))
        .collect();
    cifs.sort();
    if cifs.is_empty() {
        bail!("no .cif files in {}", path.display());
    }
    Ok(cifs)
}

fn mof_id(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("structure")
        .to_string()
}

fn build_flow(pipeline: Pipeline, structure: Structure) -> Result<Flow> {
    let flow = match pipeline {
        Pipeline::Discovery => MofDiscovery::default().make(structure)?,
        Pipeline::RelaxChain => relaxation_chain(&structure, None, &Metadata::new())?,
        Pipeline::Adsorption => {
            relaxation_chain(&structure, Some(&AdsorptionRequest::default()), &Metadata::new())?
        }
        Pipeline::Dft => dft_follow_up(&structure, Some("MACE"))?,
    };
    Ok(flow)
}

fn summarize(value: &Value) -> String {
    let mut parts = Vec::new();
    for key in ["is_mof", "force_converged", "method", "energy", "loading", "heat_of_adsorption"] {
        if let Some(v) = value.get(key) {
            parts.push(format!("{}={}", key, v));
        }
    }
    if let Some(n2) = value.get("N2") {
        for key in ["PLD", "LCD", "POAV_Volume_fraction"] {
            if let Some(v) = n2.get(key) {
                parts.push(format!("N2.{}={}", key, v));
            }
        }
    }
    if parts.is_empty() {
        "(no summary fields)".to_string()
    } else {
        parts.join(" ")
    }
}

fn print_summary(label: &str, flow: &Flow, execution: &Execution) {
    println!("== {} [{:?}] {} job(s)", label, execution.status, execution.job_count());
    for (name, value) in named_report(flow, &execution.trace, &execution.outputs) {
        println!("  {:<32} {}", name, summarize(&value));
    }
    for failure in &execution.failures {
        println!("  {:<32} FAILED: {}", failure.name, failure.error);
    }
}

fn spawn_ctrl_c(engine: &Engine) {
    let token = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, no new jobs will be scheduled");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;

    match &cli.command {
        Commands::Run { path, pipeline } => {
            info!("Running in Standalone Memory Mode");
            let mut engine = Engine::new(settings.engine.clone());
            register_standard_functions(&mut engine, &settings)?;
            spawn_ctrl_c(&engine);

            let is_yaml = matches!(
                path.extension().and_then(|s| s.to_str()),
                Some("yaml") | Some("yml")
            );
            if is_yaml {
                let flow = load_flow_from_yaml(path)?;
                let execution = engine.run(flow.clone()).await?;
                print_summary(&flow.name, &flow, &execution);
                return Ok(());
            }

            let token = engine.cancellation_token();
            for cif in collect_cifs(path)? {
                if token.is_cancelled() {
                    break;
                }
                let id = mof_id(&cif);
                let structure = Structure::from_file(&cif)?;
                let mut flow = build_flow(*pipeline, structure)?;
                flow.append_name(&format!("{} ", id), true);

                let execution = engine.run(flow.clone()).await?;
                print_summary(&id, &flow, &execution);
            }
        }

        Commands::Submit {
            path,
            pipeline,
            redis,
            job_info,
            meta,
        } => {
            let url = redis.clone().unwrap_or_else(|| settings.queue.redis_url.clone());
            info!("Submitting to Redis: {}", url);
            let client = redis::Client::open(url).context("Invalid Redis URL")?;
            let queue = RedisTaskQueue::new(client, settings.queue.queue_key.clone());

            let extras: Metadata = meta.iter().cloned().collect();
            for cif in collect_cifs(path)? {
                let id = mof_id(&cif);
                let structure = Structure::from_file(&cif)?;
                let metadata = submission_metadata(&id, &structure, job_info, &extras);
                let flow = build_flow(*pipeline, structure)?;
                let submission = prepare_submission(flow, &id, metadata)?;
                let submission_id = submission.id;
                queue.push(submission).await?;
                info!(submission = %submission_id, mof_id = %id, "Submitted");
            }
        }

        Commands::Worker { redis, name } => {
            let url = redis.clone().unwrap_or_else(|| settings.queue.redis_url.clone());
            info!("[{}] Starting Worker... Redis: {}", name, url);
            let client = redis::Client::open(url).context("Invalid Redis URL")?;
            let store = Arc::new(RedisStateStore::new(client.clone()));
            let queue = RedisTaskQueue::new(client, settings.queue.queue_key.clone());

            let mut engine = Engine::new_with_storage(settings.engine.clone(), store);
            register_standard_functions(&mut engine, &settings)?;
            spawn_ctrl_c(&engine);
            let token = engine.cancellation_token();

            info!("[{}] Worker ready.", name);
            while !token.is_cancelled() {
                let submission = match queue.pop().await {
                    Ok(Some(s)) => s,
                    Ok(None) => continue,
                    Err(e) => {
                        error!(worker = %name, error = %e, "Failed to pop submission");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                let label = submission.name.clone();
                let flow = submission.blueprint.clone().into_flow();
                info!(worker = %name, submission = %submission.id, name = %label, "Running submission");
                match engine.run_submission(submission).await {
                    Ok(execution) => print_summary(&label, &flow, &execution),
                    Err(e) => error!(worker = %name, error = %e, "Submission rejected"),
                }
            }
            info!("[{}] Worker stopped.", name);
        }
    }

    Ok(())
}
