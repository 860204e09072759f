use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

pub mod cluster;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod matrix;
pub mod metrics;
pub mod probe;
pub mod process;
pub mod prometheus;
pub mod sampler;
pub mod trial;

pub use cluster::ClusterEnv;
pub use config::{load_config, parse_config, ExperimentConfig};
pub use error::OrchestratorError;
pub use matrix::{RunMatrix, TrialSpec};
pub use metrics::ResultRow;
pub use prometheus::MetricStore;
pub use sampler::EnergySampler;
pub use trial::{TrialCoordinator, TrialReport};

use fsutil::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir, sha256_hex};
use process::{run_with_timeout, ssh_command};

const PREFLIGHT_SSH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RunResult {
    pub run_dir: PathBuf,
    pub run_id: String,
    pub total: usize,
    pub completed: usize,
    pub degraded_trials: usize,
    pub failed_trials: usize,
}

#[derive(Debug, Clone)]
pub struct ExperimentSummary {
    pub exp_id: String,
    pub name: String,
    pub factors: Vec<(String, usize)>,
    pub repetitions: u32,
    pub excluded_combinations: usize,
    pub total_trials: usize,
    pub shuffle: bool,
    pub random_seed: Option<u64>,
    pub cooldown_seconds: u64,
    pub remote_host: String,
    pub suite_dir: PathBuf,
    pub gateway_url: String,
    pub metric_store_url: String,
    pub output_dir: PathBuf,
}

fn write_run_control(
    run_dir: &Path,
    run_id: &str,
    status: &str,
    active_trial_id: Option<&str>,
) -> Result<()> {
    let payload = json!({
        "schema_version": "run_control_v1",
        "run_id": run_id,
        "status": status,
        "active_trial_id": active_trial_id,
        "updated_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&run_dir.join("run_control.json"), &payload)
}

fn write_trial_state(
    trial_dir: &Path,
    trial_id: &str,
    status: &str,
    degraded: &[&str],
    exit_reason: Option<&str>,
) -> Result<()> {
    let payload = json!({
        "schema_version": "trial_state_v1",
        "trial_id": trial_id,
        "status": status,
        "degraded": degraded,
        "exit_reason": exit_reason,
        "updated_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&trial_dir.join("trial_state.json"), &payload)
}

struct RunControlGuard {
    run_dir: PathBuf,
    run_id: String,
    done: bool,
}

impl RunControlGuard {
    fn new(run_dir: &Path, run_id: &str) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            run_id: run_id.to_string(),
            done: false,
        }
    }

    fn complete(&mut self, status: &str) -> Result<()> {
        write_run_control(&self.run_dir, &self.run_id, status, None)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RunControlGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = write_run_control(&self.run_dir, &self.run_id, "failed", None);
        }
    }
}

struct TrialStateGuard {
    trial_dir: PathBuf,
    trial_id: String,
    done: bool,
}

impl TrialStateGuard {
    fn new(trial_dir: &Path, trial_id: &str) -> Self {
        Self {
            trial_dir: trial_dir.to_path_buf(),
            trial_id: trial_id.to_string(),
            done: false,
        }
    }

    fn complete(&mut self, status: &str, degraded: &[&str], exit_reason: Option<&str>) -> Result<()> {
        write_trial_state(&self.trial_dir, &self.trial_id, status, degraded, exit_reason)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for TrialStateGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = write_trial_state(
                &self.trial_dir,
                &self.trial_id,
                "failed",
                &[],
                Some("aborted"),
            );
        }
    }
}

fn preflight(cfg: &ExperimentConfig, store: &MetricStore) -> Result<()> {
    if !cfg.suite.dir.is_dir() {
        return Err(OrchestratorError::Configuration(format!(
            "suite directory not found: {}",
            cfg.suite.dir.display()
        ))
        .into());
    }
    let script = cfg.suite.dir.join(&cfg.load.script);
    if !script.is_file() {
        return Err(OrchestratorError::Configuration(format!(
            "load generator script not found: {}",
            script.display()
        ))
        .into());
    }
    let template = cfg.suite.dir.join(&cfg.suite.params_template);
    if !template.is_file() {
        return Err(OrchestratorError::Configuration(format!(
            "deployer params template not found: {}",
            template.display()
        ))
        .into());
    }

    if store.healthy() {
        info!(url = %cfg.metric_store.url, "metric store reachable");
    } else {
        warn!(url = %cfg.metric_store.url, "metric store not reachable; resource metrics will degrade");
    }

    let which = ssh_command(
        &cfg.remote.host,
        &format!("which {}", cfg.sampler.command),
    );
    match run_with_timeout(which, PREFLIGHT_SSH_TIMEOUT) {
        Ok(out) if out.success() => {
            info!(path = %out.stdout_text().trim(), "energy sampler found on remote host")
        }
        Ok(_) => warn!(
            command = %cfg.sampler.command,
            "energy sampler not found on remote host; energy metrics will degrade"
        ),
        Err(e) => warn!(error = %e, "could not check remote host; is ssh configured?"),
    }
    Ok(())
}

pub fn describe_experiment(path: &Path) -> Result<ExperimentSummary> {
    let cfg = load_config(path)?;
    let matrix = RunMatrix::generate(
        &cfg.design.factors,
        cfg.design.repetitions,
        &cfg.design.exclude,
        false,
        None,
    );
    Ok(ExperimentSummary {
        exp_id: cfg.experiment.id.clone(),
        name: cfg.experiment.name.clone(),
        factors: cfg
            .design
            .factors
            .iter()
            .map(|f| (f.name.clone(), f.levels.len()))
            .collect(),
        repetitions: cfg.design.repetitions,
        excluded_combinations: cfg.design.exclude.len(),
        total_trials: matrix.total(),
        shuffle: cfg.design.shuffle,
        random_seed: cfg.design.random_seed,
        cooldown_seconds: cfg.design.cooldown_seconds,
        remote_host: cfg.remote.host.clone(),
        suite_dir: cfg.suite.dir.clone(),
        gateway_url: cfg.gateway.url.clone(),
        metric_store_url: cfg.metric_store.url.clone(),
        output_dir: cfg.experiment.output_dir.clone(),
    })
}

pub fn run_experiment(path: &Path) -> Result<RunResult> {
    let cfg = load_config(path)?;

    let run_id = format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    let run_dir = cfg
        .experiment
        .output_dir
        .join(&cfg.experiment.id)
        .join(&run_id);
    ensure_dir(&run_dir)?;
    write_run_control(&run_dir, &run_id, "running", None)?;
    let mut run_guard = RunControlGuard::new(&run_dir, &run_id);

    let resolved = serde_json::to_value(&cfg)?;
    atomic_write_json_pretty(&run_dir.join("resolved_experiment.json"), &resolved)?;
    let digest = sha256_hex(&serde_json::to_vec(&resolved)?);
    atomic_write_bytes(&run_dir.join("resolved_experiment.digest"), digest.as_bytes())?;
    let manifest = json!({
        "schema_version": "run_manifest_v1",
        "run_id": run_id,
        "runner_version": env!("CARGO_PKG_VERSION"),
        "created_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&run_dir.join("manifest.json"), &manifest)?;

    let store = MetricStore::new(&cfg.metric_store.url)?;
    preflight(&cfg, &store)?;

    let cluster = ClusterEnv::new(&cfg);
    let sampler = EnergySampler::new(&cfg.sampler, &cfg.remote.host);
    let coordinator = TrialCoordinator::new(&cfg, &cluster, &store, &sampler)?;

    let mut matrix = RunMatrix::generate(
        &cfg.design.factors,
        cfg.design.repetitions,
        &cfg.design.exclude,
        cfg.design.shuffle,
        cfg.design.random_seed,
    );
    let total = matrix.total();
    info!(run_id = %run_id, total, "run plan generated");

    let trials_dir = run_dir.join("trials");
    ensure_dir(&trials_dir)?;

    let cooldown = Duration::from_secs(cfg.design.cooldown_seconds);
    let mut index = 0usize;
    let mut degraded_trials = 0usize;
    let mut failed_trials = 0usize;
    while let Some(spec) = matrix.next_spec() {
        index += 1;
        let trial_id = format!("trial_{}", index);
        let trial_dir = trials_dir.join(&trial_id);
        ensure_dir(&trial_dir)?;
        write_trial_state(&trial_dir, &trial_id, "running", &[], None)?;
        let mut trial_guard = TrialStateGuard::new(&trial_dir, &trial_id);
        atomic_write_json_pretty(
            &trial_dir.join("trial_spec.json"),
            &json!({
                "id": spec.id(),
                "factors": spec.factors(),
                "repetition": spec.repetition(),
            }),
        )?;
        write_run_control(&run_dir, &run_id, "running", Some(&trial_id))?;

        info!(run_id = %run_id, trial = spec.id(), index, total, "starting trial");
        let report = coordinator.run_trial(&spec, &trial_dir);
        match &report.fatal {
            Some(e) => {
                failed_trials += 1;
                trial_guard.complete("failed", &report.degraded, Some(e.kind()))?;
            }
            None => {
                if !report.degraded.is_empty() {
                    degraded_trials += 1;
                }
                trial_guard.complete("completed", &report.degraded, None)?;
            }
        }

        matrix.record_result(&spec, report.row);
        matrix.write_results_csv(&run_dir.join("run_table.csv"))?;
        atomic_write_json_pretty(&run_dir.join("results.json"), &matrix.results_json())?;
        write_run_control(&run_dir, &run_id, "running", None)?;

        // Let transient remote-host load settle before the next trial.
        if index < total && !cooldown.is_zero() {
            info!(seconds = cooldown.as_secs(), "cooldown before next trial");
            thread::sleep(cooldown);
        }
    }

    run_guard.complete("completed")?;
    info!(
        run_id = %run_id,
        completed = matrix.completed(),
        degraded = degraded_trials,
        failed = failed_trials,
        "run finished"
    );
    Ok(RunResult {
        run_dir,
        run_id,
        total,
        completed: matrix.completed(),
        degraded_trials,
        failed_trials,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "bench_lib_test_{}_{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    #[test]
    fn describe_counts_the_full_matrix() {
        let dir = temp_dir("describe");
        let path = dir.join("experiment.yaml");
        fs::write(&path, config::TEST_CONFIG_YAML).expect("config file");
        let summary = describe_experiment(&path).expect("summary");
        assert_eq!(summary.exp_id, "topo-bench");
        assert_eq!(summary.total_trials, 8);
        assert_eq!(summary.factors, vec![("topology".to_string(), 2), ("system_size".to_string(), 2)]);
        assert_eq!(summary.remote_host, "gl3");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn abandoned_trial_guard_records_failure() {
        let dir = temp_dir("guard");
        {
            let _guard = TrialStateGuard::new(&dir, "trial_1");
        }
        let state: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.join("trial_state.json")).expect("state"))
                .expect("json");
        assert_eq!(state["status"], "failed");
        assert_eq!(state["exit_reason"], "aborted");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn completed_trial_guard_keeps_final_status() {
        let dir = temp_dir("guard_ok");
        {
            let mut guard = TrialStateGuard::new(&dir, "trial_1");
            guard
                .complete("completed", &["pods_ready"], None)
                .expect("complete");
        }
        let state: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.join("trial_state.json")).expect("state"))
                .expect("json");
        assert_eq!(state["status"], "completed");
        assert_eq!(state["degraded"][0], "pods_ready");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn run_control_guard_marks_abandoned_runs_failed() {
        let dir = temp_dir("run_control");
        {
            let _guard = RunControlGuard::new(&dir, "run_x");
        }
        let state: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.join("run_control.json")).expect("state"))
                .expect("json");
        assert_eq!(state["status"], "failed");
        assert_eq!(state["run_id"], "run_x");
        let _ = fs::remove_dir_all(dir);
    }
}
