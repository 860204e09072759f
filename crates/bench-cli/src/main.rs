use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bench", version, about = "Microservice topology benchmark orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        experiment: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Describe {
        experiment: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Init {
        #[arg(long)]
        force: bool,
    },
    Clean {
        #[arg(long)]
        init: bool,
        #[arg(long)]
        runs: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string()));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Describe { json, .. } => *json,
        _ => false,
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run { experiment, json } => {
            let summary = bench_runner::describe_experiment(&experiment)?;
            let result = bench_runner::run_experiment(&experiment)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "summary": summary_to_json(&summary),
                    "run": {
                        "run_id": result.run_id,
                        "run_dir": result.run_dir.display().to_string(),
                        "total": result.total,
                        "completed": result.completed,
                        "degraded_trials": result.degraded_trials,
                        "failed_trials": result.failed_trials,
                    },
                })));
            }
            print_summary(&summary);
            println!("run_id: {}", result.run_id);
            println!("run_dir: {}", result.run_dir.display());
            println!(
                "trials: {} completed, {} degraded, {} failed",
                result.completed, result.degraded_trials, result.failed_trials
            );
        }
        Commands::Describe { experiment, json } => {
            let summary = bench_runner::describe_experiment(&experiment)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&summary),
                })));
            }
            print_summary(&summary);
        }
        Commands::Init { force } => {
            let path = std::env::current_dir()?.join("experiment.yaml");
            if !force && path.exists() {
                return Err(anyhow::anyhow!(format!(
                    "init file already exists (use --force): {}",
                    path.display()
                )));
            }
            std::fs::write(&path, EXPERIMENT_TEMPLATE)?;
            println!("wrote: {}", path.display());
            println!("next: edit experiment.yaml and fill in all fields marked REQUIRED");
            println!("next: bench describe experiment.yaml");
        }
        Commands::Clean { init, runs } => {
            let root = std::env::current_dir()?;
            if init {
                let path = root.join("experiment.yaml");
                if path.exists() {
                    let _ = std::fs::remove_file(&path);
                    println!("removed: {}", path.display());
                }
            }
            if runs {
                let runs_dir = root.join("experiments");
                if runs_dir.exists() {
                    std::fs::remove_dir_all(&runs_dir)?;
                    println!("removed: {}", runs_dir.display());
                }
            }
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn summary_to_json(summary: &bench_runner::ExperimentSummary) -> Value {
    json!({
        "experiment": summary.exp_id,
        "name": summary.name,
        "factors": summary.factors.iter().map(|(name, levels)| json!({
            "name": name,
            "levels": levels,
        })).collect::<Vec<_>>(),
        "repetitions": summary.repetitions,
        "excluded_combinations": summary.excluded_combinations,
        "total_trials": summary.total_trials,
        "shuffle": summary.shuffle,
        "random_seed": summary.random_seed,
        "cooldown_seconds": summary.cooldown_seconds,
        "remote_host": summary.remote_host,
        "suite_dir": summary.suite_dir.display().to_string(),
        "gateway": summary.gateway_url,
        "metric_store": summary.metric_store_url,
        "output_dir": summary.output_dir.display().to_string(),
    })
}

fn print_summary(summary: &bench_runner::ExperimentSummary) {
    println!("experiment: {}", summary.exp_id);
    if !summary.name.is_empty() {
        println!("name: {}", summary.name);
    }
    for (name, levels) in &summary.factors {
        println!("factor: {} ({} levels)", name, levels);
    }
    println!("repetitions: {}", summary.repetitions);
    println!("excluded_combinations: {}", summary.excluded_combinations);
    println!("total_trials: {}", summary.total_trials);
    println!("shuffle: {}", summary.shuffle);
    if let Some(seed) = summary.random_seed {
        println!("random_seed: {}", seed);
    }
    println!("cooldown_seconds: {}", summary.cooldown_seconds);
    println!("remote_host: {}", summary.remote_host);
    println!("suite_dir: {}", summary.suite_dir.display());
    println!("gateway: {}", summary.gateway_url);
    println!("metric_store: {}", summary.metric_store_url);
    println!("output_dir: {}", summary.output_dir.display());
}

const EXPERIMENT_TEMPLATE: &str = "\
experiment:
  id: ''                              # REQUIRED
  name: ''
  output_dir: experiments
design:
  factors:                            # REQUIRED
    - name: topology
      levels:
        - sequential_fanout
        - parallel_fanout
        - chain_with_branching
        - hierarchical_tree
        - probabilistic_tree
        - complex_mesh
    - name: system_size
      levels: [5, 10, 20]
  repetitions: 10                     # REQUIRED: set > 0
  shuffle: true
  random_seed: 1337
  exclude: []
  cooldown_seconds: 60
remote:
  host: ''                            # REQUIRED: ssh alias of the cluster host
  deployer_dir: '~/muBench'           # REQUIRED: remote suite checkout
  deployer_command: python3 Deployers/K8sDeployer/RunK8sDeployer.py
  deploy_timeout_seconds: 300
suite:
  dir: ''                             # REQUIRED: local suite checkout
  params_template: Configs/K8sParameters.json
  workmodel_dir: Examples
  namespace_prefix: bench
  deployments:                        # REQUIRED: (topology, size) -> workmodel
    - { topology: sequential_fanout, size: 5, workmodel: workmodel-serial-5services.json }
    - { topology: sequential_fanout, size: 10, workmodel: workmodel-serial-10services.json }
    - { topology: sequential_fanout, size: 20, workmodel: workmodel-serial-20services.json }
    - { topology: parallel_fanout, size: 5, workmodel: workmodel-parallel-5services.json }
    - { topology: parallel_fanout, size: 10, workmodel: workmodel-parallel-10services.json }
    - { topology: parallel_fanout, size: 20, workmodel: workmodel-parallel-20services.json }
    - { topology: chain_with_branching, size: 5, workmodel: workmodelA-5services.json }
    - { topology: chain_with_branching, size: 10, workmodel: workmodelA-10services.json }
    - { topology: chain_with_branching, size: 20, workmodel: workmodelA.json }
    - { topology: hierarchical_tree, size: 5, workmodel: workmodelC-5services.json }
    - { topology: hierarchical_tree, size: 10, workmodel: workmodelC-10services.json }
    - { topology: hierarchical_tree, size: 20, workmodel: workmodelC.json }
    - { topology: probabilistic_tree, size: 5, workmodel: workmodelC-multi-5services.json }
    - { topology: probabilistic_tree, size: 10, workmodel: workmodelC-multi-10services.json }
    - { topology: probabilistic_tree, size: 20, workmodel: workmodelC-multi.json }
    - { topology: complex_mesh, size: 5, workmodel: workmodelD-5services.json }
    - { topology: complex_mesh, size: 10, workmodel: workmodelD-10services.json }
    - { topology: complex_mesh, size: 20, workmodel: workmodelD.json }
gateway:
  url: http://localhost:9090
  probe_path: /s0
  service: gw-nginx
  service_port: 80
  local_port: 9090
metric_store:
  url: http://localhost:30000
load:
  executable: venv/bin/locust
  script: Benchmarks/Locust/locustfile.py
  users: 100
  spawn_rate: 50
  duration: 10m
  timeout_seconds: 900
  user_class: StochasticBenchmarkUser
sampler:
  command: energibridge
  grace_seconds: 3
  scratch_prefix: /tmp/energy_
";
