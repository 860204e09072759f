use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::cluster::ClusterEnv;
use crate::config::ExperimentConfig;
use crate::error::{OpResult, OrchestratorError};
use crate::fsutil::{atomic_write_json_pretty, ensure_dir};
use crate::matrix::TrialSpec;
use crate::metrics::{self, ResultRow};
use crate::probe::{probe, ProbePolicy};
use crate::process::run_redirected;
use crate::prometheus::MetricStore;
use crate::sampler::{EnergySampler, SamplerHandle, SAMPLE_FILE};

const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Deploy,
    AwaitReady,
    MeasureStart,
    Interact,
    MeasureStop,
    Teardown,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Deploy => "deploy",
            Phase::AwaitReady => "await_ready",
            Phase::MeasureStart => "measure_start",
            Phase::Interact => "interact",
            Phase::MeasureStop => "measure_stop",
            Phase::Teardown => "teardown",
            Phase::Done => "done",
        }
    }
}

// All per-trial mutable state lives here, owned by the coordinator for
// exactly one trial.
pub struct TrialContext {
    pub trial_dir: PathBuf,
    pub namespace: Option<String>,
    pub sampler: Option<SamplerHandle>,
    pub forward: Option<Child>,
    pub measure_start: Option<f64>,
    pub measure_end: Option<f64>,
}

impl TrialContext {
    fn new(trial_dir: &Path) -> Self {
        Self {
            trial_dir: trial_dir.to_path_buf(),
            namespace: None,
            sampler: None,
            forward: None,
            measure_start: None,
            measure_end: None,
        }
    }
}

pub struct TrialReport {
    pub row: ResultRow,
    pub degraded: Vec<&'static str>,
    pub fatal: Option<OrchestratorError>,
}

struct SizeBudgets {
    pod_wait: Duration,
    post_ready_settle: Duration,
    stabilization: Duration,
}

impl SizeBudgets {
    fn for_size(size: u64) -> Self {
        let (pod_wait, post_ready_settle) = match size {
            s if s >= 20 => (600, 10),
            s if s >= 10 => (400, 5),
            _ => (300, 3),
        };
        let stabilization = if size >= 20 { 5 } else { 3 };
        Self {
            pod_wait: Duration::from_secs(pod_wait),
            post_ready_settle: Duration::from_secs(post_ready_settle),
            stabilization: Duration::from_secs(stabilization),
        }
    }
}

fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

pub struct TrialCoordinator<'a> {
    cfg: &'a ExperimentConfig,
    cluster: &'a ClusterEnv,
    store: &'a MetricStore,
    sampler: &'a EnergySampler,
    probe_client: reqwest::blocking::Client,
}

impl<'a> TrialCoordinator<'a> {
    pub fn new(
        cfg: &'a ExperimentConfig,
        cluster: &'a ClusterEnv,
        store: &'a MetricStore,
        sampler: &'a EnergySampler,
    ) -> anyhow::Result<Self> {
        let probe_client = reqwest::blocking::Client::builder()
            .timeout(PROBE_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            cfg,
            cluster,
            store,
            sampler,
            probe_client,
        })
    }

    // Exactly one ResultRow comes out of every invocation, however the trial
    // went; teardown is reachable from every phase.
    pub fn run_trial(&self, spec: &TrialSpec, trial_dir: &Path) -> TrialReport {
        let mut ctx = TrialContext::new(trial_dir);
        let mut degraded = Vec::new();
        let fatal = match self.drive(spec, &mut ctx, &mut degraded) {
            Ok(()) => None,
            Err(e) => {
                warn!(trial = spec.id(), error = %e, "trial aborted; jumping to teardown");
                Some(e)
            }
        };

        info!(trial = spec.id(), phase = Phase::Teardown.as_str(), "entering phase");
        self.teardown(&mut ctx, &mut degraded);

        info!(trial = spec.id(), phase = Phase::Done.as_str(), "entering phase");
        let row = metrics::normalize_trial(trial_dir);
        if let Err(e) = atomic_write_json_pretty(
            &trial_dir.join("result.json"),
            &serde_json::to_value(&row).unwrap_or_else(|_| json!({})),
        ) {
            warn!(trial = spec.id(), error = %e, "failed to persist trial result");
        }

        if degraded.is_empty() && fatal.is_none() {
            info!(trial = spec.id(), "trial completed with full metric coverage");
        } else {
            info!(
                trial = spec.id(),
                degraded = degraded.join(","),
                fatal = fatal.as_ref().map(|e| e.kind()).unwrap_or("none"),
                "trial completed with degraded coverage"
            );
        }

        TrialReport {
            row,
            degraded,
            fatal,
        }
    }

    fn drive(
        &self,
        spec: &TrialSpec,
        ctx: &mut TrialContext,
        degraded: &mut Vec<&'static str>,
    ) -> OpResult<()> {
        let topology = spec.level_str("topology").ok_or_else(|| {
            OrchestratorError::Configuration("trial spec has no 'topology' factor".to_string())
        })?;
        let size = spec.level_u64("system_size").ok_or_else(|| {
            OrchestratorError::Configuration(
                "trial spec has no numeric 'system_size' factor".to_string(),
            )
        })?;
        let budgets = SizeBudgets::for_size(size);

        // SETUP: everything here is fatal to the trial.
        info!(trial = spec.id(), phase = Phase::Setup.as_str(), "entering phase");
        let descriptor = self.cluster.resolve_deployment(&topology, size)?;
        let namespace = self
            .cluster
            .ensure_clean_namespace(&topology, size, spec.repetition())?;
        fs::write(ctx.trial_dir.join("namespace.txt"), &namespace).map_err(|e| {
            OrchestratorError::Environment(format!("cannot persist namespace artifact: {}", e))
        })?;
        ctx.namespace = Some(namespace.clone());

        // DEPLOY: fatal, one attempt per trial.
        info!(trial = spec.id(), phase = Phase::Deploy.as_str(), "entering phase");
        self.cluster.deploy(&descriptor, &namespace)?;

        // AWAIT_READY: degraded progress is allowed from here on.
        info!(trial = spec.id(), phase = Phase::AwaitReady.as_str(), "entering phase");
        match self.cluster.await_pods_ready(&namespace, budgets.pod_wait) {
            Ok(true) => info!(namespace = %namespace, "all pods ready"),
            Ok(false) => {
                warn!(namespace = %namespace, "pods not ready within budget; continuing");
                degraded.push("pods_ready");
            }
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "pod readiness check failed; continuing");
                degraded.push("pods_ready");
            }
        }
        thread::sleep(budgets.post_ready_settle);
        match self.cluster.expose_ingress(&namespace, &self.cfg.gateway) {
            Ok(child) => ctx.forward = Some(child),
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "ingress forward failed; probing will degrade");
                degraded.push("ingress");
            }
        }

        // MEASURE_START: sampler start strictly precedes load generation.
        info!(trial = spec.id(), phase = Phase::MeasureStart.as_str(), "entering phase");
        ctx.measure_start = Some(unix_now());
        if let Err(e) = fs::write(
            ctx.trial_dir.join("measurement_start.txt"),
            format!("{:.6}", ctx.measure_start.unwrap_or_default()),
        ) {
            warn!(error = %e, "failed to persist measurement start timestamp");
        }
        match self.sampler.start(&namespace) {
            Some(handle) => ctx.sampler = Some(handle),
            None => degraded.push("sampler_start"),
        }

        // INTERACT: readiness streak, then load generation.
        info!(trial = spec.id(), phase = Phase::Interact.as_str(), "entering phase");
        let probe_url = format!(
            "{}{}",
            self.cfg.gateway.url.trim_end_matches('/'),
            self.cfg.gateway.probe_path
        );
        let policy = ProbePolicy::for_size(size);
        if probe(&self.probe_client, &probe_url, policy) {
            info!(url = %probe_url, "gateway ready; letting connections stabilize");
            thread::sleep(budgets.stabilization);
        } else {
            warn!(url = %probe_url, "gateway not ready after probe budget; proceeding anyway");
            degraded.push("readiness");
        }
        if !self.run_load(&ctx.trial_dir) {
            degraded.push("load_generator");
        }

        // MEASURE_STOP: each collection step is independently best-effort.
        info!(trial = spec.id(), phase = Phase::MeasureStop.as_str(), "entering phase");
        ctx.measure_end = Some(unix_now());
        if let Err(e) = fs::write(
            ctx.trial_dir.join("measurement_end.txt"),
            format!("{:.6}", ctx.measure_end.unwrap_or_default()),
        ) {
            warn!(error = %e, "failed to persist measurement end timestamp");
        }
        if let Some(handle) = ctx.sampler.take() {
            if !self
                .sampler
                .stop(&handle, &ctx.trial_dir.join(SAMPLE_FILE))
            {
                degraded.push("sampler_stop");
            }
        }
        self.query_metrics(&namespace, &ctx.trial_dir, degraded);

        Ok(())
    }

    fn query_metrics(&self, namespace: &str, trial_dir: &Path, degraded: &mut Vec<&'static str>) {
        match self.store.cpu_usage_avg(namespace) {
            Ok(Some(v)) => {
                if let Err(e) = fs::write(trial_dir.join("metric_cpu.txt"), v.to_string()) {
                    warn!(error = %e, "failed to persist cpu metric");
                    degraded.push("cpu_query");
                }
            }
            Ok(None) => {
                warn!(namespace, "cpu query returned no series");
                degraded.push("cpu_query");
            }
            Err(e) => {
                warn!(namespace, error = %e, "cpu query failed");
                degraded.push("cpu_query");
            }
        }
        match self.store.memory_usage_avg(namespace) {
            Ok(Some(v)) => {
                if let Err(e) = fs::write(trial_dir.join("metric_memory.txt"), v.to_string()) {
                    warn!(error = %e, "failed to persist memory metric");
                    degraded.push("memory_query");
                }
            }
            Ok(None) => {
                warn!(namespace, "memory query returned no series");
                degraded.push("memory_query");
            }
            Err(e) => {
                warn!(namespace, error = %e, "memory query failed");
                degraded.push("memory_query");
            }
        }
    }

    fn run_load(&self, trial_dir: &Path) -> bool {
        let load = &self.cfg.load;
        let out_dir = trial_dir.join("loadgen");
        if let Err(e) = ensure_dir(&out_dir) {
            warn!(error = %e, "cannot create load generator output dir");
            return false;
        }
        let executable = self.cfg.suite.dir.join(&load.executable);
        let script = self.cfg.suite.dir.join(&load.script);
        info!(
            users = load.users,
            spawn_rate = load.spawn_rate,
            duration = %load.duration,
            "running load generator"
        );
        let mut cmd = Command::new(executable);
        cmd.arg("-f")
            .arg(script)
            .arg("--headless")
            .arg("-u")
            .arg(load.users.to_string())
            .arg("-r")
            .arg(load.spawn_rate.to_string())
            .arg("-t")
            .arg(&load.duration)
            .arg("--host")
            .arg(&self.cfg.gateway.url)
            .arg("--csv")
            .arg(out_dir.join("results"))
            .arg("--html")
            .arg(out_dir.join("results.html"));
        if let Some(class) = &load.user_class {
            cmd.arg(class);
        }
        cmd.current_dir(&self.cfg.suite.dir);
        match run_redirected(
            cmd,
            &out_dir.join("loadgen_output.txt"),
            Duration::from_secs(load.timeout_seconds),
        ) {
            Ok(Some(0)) => {
                info!("load generator completed");
                true
            }
            Ok(code) => {
                warn!(?code, "load generator exited abnormally");
                false
            }
            Err(e) => {
                warn!(error = %e, "load generator failed");
                false
            }
        }
    }

    fn teardown(&self, ctx: &mut TrialContext, degraded: &mut Vec<&'static str>) {
        if let Some(mut forward) = ctx.forward.take() {
            let _ = forward.kill();
            let _ = forward.wait();
        }
        // Only reached with a live handle when stop never ran (fatal path).
        if let Some(handle) = ctx.sampler.take() {
            self.sampler.abort(&handle);
        }
        if let Some(namespace) = ctx.namespace.as_deref() {
            if !self.cluster.teardown(namespace) {
                degraded.push("teardown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_have_stable_names() {
        let order = [
            Phase::Setup,
            Phase::Deploy,
            Phase::AwaitReady,
            Phase::MeasureStart,
            Phase::Interact,
            Phase::MeasureStop,
            Phase::Teardown,
            Phase::Done,
        ];
        let names: Vec<&str> = order.iter().map(|p| p.as_str()).collect();
        assert_eq!(
            names,
            [
                "setup",
                "deploy",
                "await_ready",
                "measure_start",
                "interact",
                "measure_stop",
                "teardown",
                "done"
            ]
        );
    }

    #[test]
    fn budgets_scale_with_system_size() {
        let small = SizeBudgets::for_size(5);
        let medium = SizeBudgets::for_size(10);
        let large = SizeBudgets::for_size(20);
        assert_eq!(small.pod_wait, Duration::from_secs(300));
        assert_eq!(medium.pod_wait, Duration::from_secs(400));
        assert_eq!(large.pod_wait, Duration::from_secs(600));
        assert!(small.post_ready_settle < large.post_ready_settle);
        assert_eq!(large.stabilization, Duration::from_secs(5));
        assert_eq!(small.stabilization, Duration::from_secs(3));
    }

    #[test]
    fn unix_timestamp_is_plausible() {
        let now = unix_now();
        // After 2020-01-01 and before 2100.
        assert!(now > 1_577_836_800.0);
        assert!(now < 4_102_444_800.0);
    }
}
