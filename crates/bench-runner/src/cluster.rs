use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::{DeploymentEntry, ExperimentConfig, GatewaySection};
use crate::error::{OpResult, OrchestratorError};
use crate::process::{run_with_timeout, ssh_command, ProcessError};

const SHORT_OP_TIMEOUT: Duration = Duration::from_secs(10);
const DELETE_TIMEOUT: Duration = Duration::from_secs(120);
const PKILL_TIMEOUT: Duration = Duration::from_secs(5);
const NAMESPACE_SETTLE: Duration = Duration::from_secs(5);
const SERVICE_RECHECK_SETTLE: Duration = Duration::from_secs(5);
const FORWARD_SETTLE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DeploymentDescriptor {
    pub topology: String,
    pub size: u64,
    pub workmodel_local: PathBuf,
    pub workmodel_remote: String,
}

pub struct ClusterEnv {
    host: String,
    deployer_dir: String,
    deployer_command: String,
    deploy_timeout: Duration,
    suite_dir: PathBuf,
    params_template: PathBuf,
    workmodel_dir: PathBuf,
    namespace_prefix: String,
    deployments: Vec<DeploymentEntry>,
}

pub fn namespace_name(prefix: &str, topology: &str, size: u64, repetition: u32) -> String {
    format!(
        "{}-{}-{}-{}",
        prefix,
        topology.replace('_', "-"),
        size,
        repetition
    )
}

// Namespaces from a differently-numbered trial of the same shape accumulate
// across a long run; they match the pattern but carry a different repetition
// suffix.
fn stale_siblings(names: &[String], pattern: &str, repetition: u32) -> Vec<String> {
    let current = repetition.to_string();
    names
        .iter()
        .filter(|name| {
            name.strip_prefix(pattern)
                .map(|rest| rest != current)
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

impl ClusterEnv {
    pub fn new(cfg: &ExperimentConfig) -> Self {
        Self {
            host: cfg.remote.host.clone(),
            deployer_dir: cfg.remote.deployer_dir.clone(),
            deployer_command: cfg.remote.deployer_command.clone(),
            deploy_timeout: Duration::from_secs(cfg.remote.deploy_timeout_seconds),
            suite_dir: cfg.suite.dir.clone(),
            params_template: cfg.suite.dir.join(&cfg.suite.params_template),
            workmodel_dir: cfg.suite.workmodel_dir.clone(),
            namespace_prefix: cfg.suite.namespace_prefix.clone(),
            deployments: cfg.suite.deployments.clone(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn namespace_for(&self, topology: &str, size: u64, repetition: u32) -> String {
        namespace_name(&self.namespace_prefix, topology, size, repetition)
    }

    fn cleanup_pattern(&self, topology: &str, size: u64) -> String {
        format!(
            "{}-{}-{}-",
            self.namespace_prefix,
            topology.replace('_', "-"),
            size
        )
    }

    // Validated before any cluster-side side effect.
    pub fn resolve_deployment(&self, topology: &str, size: u64) -> OpResult<DeploymentDescriptor> {
        let entry = self
            .deployments
            .iter()
            .find(|d| d.topology == topology && d.size == size)
            .ok_or_else(|| {
                OrchestratorError::Configuration(format!(
                    "no deployment mapping for topology '{}' size {}",
                    topology, size
                ))
            })?;
        let workmodel_local = self
            .suite_dir
            .join(&self.workmodel_dir)
            .join(&entry.workmodel);
        if !workmodel_local.is_file() {
            return Err(OrchestratorError::Configuration(format!(
                "workmodel file not found: {}",
                workmodel_local.display()
            )));
        }
        let workmodel_remote = format!(
            "{}/{}",
            self.workmodel_dir.display(),
            entry.workmodel
        );
        Ok(DeploymentDescriptor {
            topology: topology.to_string(),
            size,
            workmodel_local,
            workmodel_remote,
        })
    }

    fn namespace_exists(&self, namespace: &str) -> OpResult<bool> {
        let cmd = ssh_command(&self.host, &format!("kubectl get namespace {}", namespace));
        let out = run_with_timeout(cmd, SHORT_OP_TIMEOUT)
            .map_err(|e| OrchestratorError::TransientRemote(e.to_string()))?;
        Ok(out.success())
    }

    // Deleting a namespace that does not exist is a no-op, not an error.
    pub fn delete_namespace(&self, namespace: &str) -> OpResult<()> {
        if !self.namespace_exists(namespace)? {
            return Ok(());
        }
        info!(namespace, "deleting namespace");
        let cmd = ssh_command(
            &self.host,
            &format!("kubectl delete namespace {}", namespace),
        );
        let out = run_with_timeout(cmd, DELETE_TIMEOUT)
            .map_err(|e| OrchestratorError::TransientRemote(e.to_string()))?;
        if out.success() {
            Ok(())
        } else {
            Err(OrchestratorError::TransientRemote(format!(
                "failed to delete namespace {}: {}",
                namespace,
                out.stderr_tail()
            )))
        }
    }

    fn list_namespaces(&self) -> OpResult<Vec<String>> {
        let cmd = ssh_command(&self.host, "kubectl get namespaces -o name");
        let out = run_with_timeout(cmd, SHORT_OP_TIMEOUT)
            .map_err(|e| OrchestratorError::TransientRemote(e.to_string()))?;
        if !out.success() {
            return Err(OrchestratorError::TransientRemote(format!(
                "failed to list namespaces: {}",
                out.stderr_tail()
            )));
        }
        Ok(out
            .stdout_text()
            .lines()
            .map(|l| l.trim().trim_start_matches("namespace/").to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    pub fn ensure_clean_namespace(
        &self,
        topology: &str,
        size: u64,
        repetition: u32,
    ) -> OpResult<String> {
        let namespace = self.namespace_for(topology, size, repetition);
        let pattern = self.cleanup_pattern(topology, size);

        match self.list_namespaces() {
            Ok(names) => {
                for stale in stale_siblings(&names, &pattern, repetition) {
                    info!(namespace = %stale, "removing stale sibling namespace");
                    if let Err(e) = self.delete_namespace(&stale) {
                        warn!(namespace = %stale, error = %e, "stale namespace cleanup failed");
                    }
                }
            }
            Err(e) => warn!(error = %e, "namespace listing failed; skipping sibling cleanup"),
        }

        match self.namespace_exists(&namespace) {
            Ok(true) => {
                info!(namespace = %namespace, "deleting previous instance for a fresh deployment");
                if let Err(e) = self.delete_namespace(&namespace) {
                    warn!(namespace = %namespace, error = %e, "stale namespace deletion failed");
                }
                thread::sleep(NAMESPACE_SETTLE);
            }
            Ok(false) => {}
            Err(e) => warn!(namespace = %namespace, error = %e, "namespace existence check failed"),
        }

        let cmd = ssh_command(
            &self.host,
            &format!("kubectl create namespace {}", namespace),
        );
        match run_with_timeout(cmd, SHORT_OP_TIMEOUT) {
            Ok(out) if out.success() => {
                info!(namespace = %namespace, "namespace created");
                Ok(namespace)
            }
            Ok(out) => Err(OrchestratorError::Environment(format!(
                "failed to create namespace {}: {}",
                namespace,
                out.stderr_tail()
            ))),
            Err(e) => Err(OrchestratorError::Environment(format!(
                "failed to create namespace {}: {}",
                namespace, e
            ))),
        }
    }

    // One attempt per trial; repeated deployment failures of the same shape
    // indicate a systemic problem, not transient noise.
    pub fn deploy(&self, descriptor: &DeploymentDescriptor, namespace: &str) -> OpResult<()> {
        let raw = std::fs::read_to_string(&self.params_template).map_err(|e| {
            OrchestratorError::Configuration(format!(
                "cannot read deployer params template {}: {}",
                self.params_template.display(),
                e
            ))
        })?;
        let mut params: Value = serde_json::from_str(&raw).map_err(|e| {
            OrchestratorError::Configuration(format!(
                "invalid deployer params template {}: {}",
                self.params_template.display(),
                e
            ))
        })?;
        let k8s = params
            .get_mut("K8sParameters")
            .and_then(|v| v.as_object_mut())
            .ok_or_else(|| {
                OrchestratorError::Configuration(
                    "deployer params template missing K8sParameters object".to_string(),
                )
            })?;
        k8s.insert("namespace".to_string(), json!(namespace));
        params["WorkModelPath"] = json!(descriptor.workmodel_remote);
        params["OutputPath"] = json!(format!("SimulationWorkspace/{}", namespace));

        let remote_trial_dir = format!("{}/experiments/{}", self.deployer_dir, namespace);
        let mkdir = ssh_command(&self.host, &format!("mkdir -p {}", remote_trial_dir));
        match run_with_timeout(mkdir, SHORT_OP_TIMEOUT) {
            Ok(out) if out.success() => {}
            Ok(out) => {
                return Err(OrchestratorError::Deployment(format!(
                    "failed to prepare remote deploy dir: {}",
                    out.stderr_tail()
                )))
            }
            Err(e) => {
                return Err(OrchestratorError::Deployment(format!(
                    "failed to prepare remote deploy dir: {}",
                    e
                )))
            }
        }

        // Ship the rendered config through base64 to survive shell quoting.
        let rendered = serde_json::to_string_pretty(&params)
            .map_err(|e| OrchestratorError::Deployment(format!("render params: {}", e)))?;
        let encoded = BASE64.encode(rendered.as_bytes());
        let remote_params = format!("{}/deploy_params.json", remote_trial_dir);
        let write_cmd = format!("echo '{}' | base64 -d > {}", encoded, remote_params);
        match run_with_timeout(ssh_command(&self.host, &write_cmd), SHORT_OP_TIMEOUT) {
            Ok(out) if out.success() => {}
            Ok(out) => {
                return Err(OrchestratorError::Deployment(format!(
                    "failed to write deployer params: {}",
                    out.stderr_tail()
                )))
            }
            Err(e) => {
                return Err(OrchestratorError::Deployment(format!(
                    "failed to write deployer params: {}",
                    e
                )))
            }
        }

        info!(namespace, workmodel = %descriptor.workmodel_remote, "submitting deployment");
        let deploy_cmd = format!(
            "cd {} && echo 'y' | {} -c experiments/{}/deploy_params.json",
            self.deployer_dir, self.deployer_command, namespace
        );
        match run_with_timeout(ssh_command(&self.host, &deploy_cmd), self.deploy_timeout) {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(OrchestratorError::Deployment(format!(
                "deployer exited with {:?}: {}",
                out.status,
                out.stderr_tail()
            ))),
            Err(ProcessError::TimedOut(t)) => Err(OrchestratorError::Deployment(format!(
                "deployer timed out after {:?}",
                t
            ))),
            Err(e) => Err(OrchestratorError::Deployment(e.to_string())),
        }
    }

    // Partial readiness is still observable; a timeout here never aborts the
    // trial.
    pub fn await_pods_ready(&self, namespace: &str, timeout: Duration) -> OpResult<bool> {
        let secs = timeout.as_secs();
        let cmd = ssh_command(
            &self.host,
            &format!(
                "kubectl wait --for=condition=ready pod --all -n {} --timeout={}s",
                namespace, secs
            ),
        );
        match run_with_timeout(cmd, timeout + Duration::from_secs(20)) {
            Ok(out) => Ok(out.success()),
            Err(ProcessError::TimedOut(_)) => Ok(false),
            Err(e) => Err(OrchestratorError::TransientRemote(e.to_string())),
        }
    }

    pub fn expose_ingress(
        &self,
        namespace: &str,
        gateway: &GatewaySection,
    ) -> OpResult<Child> {
        let check = format!("kubectl get svc {} -n {}", gateway.service, namespace);
        let mut found = run_with_timeout(ssh_command(&self.host, &check), SHORT_OP_TIMEOUT)
            .map(|out| out.success())
            .unwrap_or(false);
        if !found {
            thread::sleep(SERVICE_RECHECK_SETTLE);
            found = run_with_timeout(ssh_command(&self.host, &check), SHORT_OP_TIMEOUT)
                .map(|out| out.success())
                .unwrap_or(false);
        }
        if !found {
            return Err(OrchestratorError::TransientRemote(format!(
                "gateway service '{}' not found in {}",
                gateway.service, namespace
            )));
        }

        let pkill = ssh_command(
            &self.host,
            &format!("pkill -f \"kubectl port-forward.*{}\"", gateway.service),
        );
        let _ = run_with_timeout(pkill, PKILL_TIMEOUT);
        thread::sleep(Duration::from_secs(1));

        let mut cmd = Command::new("ssh");
        cmd.arg(&self.host)
            .arg(format!(
                "kubectl port-forward svc/{} {}:{} -n {}",
                gateway.service, gateway.local_port, gateway.service_port, namespace
            ))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let child = cmd
            .spawn()
            .map_err(|e| OrchestratorError::TransientRemote(format!("port-forward: {}", e)))?;
        thread::sleep(FORWARD_SETTLE);
        info!(namespace, service = %gateway.service, port = gateway.local_port, "ingress forward started");
        Ok(child)
    }

    // A failed teardown is recorded for operator follow-up; the next trial's
    // cleanup pass will retry it.
    pub fn teardown(&self, namespace: &str) -> bool {
        match self.delete_namespace(namespace) {
            Ok(()) => true,
            Err(e) => {
                warn!(namespace, error = %e, "namespace teardown failed; will be retried by the next cleanup pass");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use std::fs;

    #[test]
    fn namespace_name_is_derived_from_spec_identity() {
        assert_eq!(
            namespace_name("bench", "sequential_fanout", 5, 3),
            "bench-sequential-fanout-5-3"
        );
        assert_eq!(
            namespace_name("bench", "complex_mesh", 20, 10),
            "bench-complex-mesh-20-10"
        );
    }

    #[test]
    fn sibling_cleanup_matches_suffix_not_substring() {
        let names = vec![
            "bench-sequential-fanout-5-1".to_string(),
            "bench-sequential-fanout-5-10".to_string(),
            "bench-sequential-fanout-5-2".to_string(),
            "bench-sequential-fanout-50-1".to_string(),
            "kube-system".to_string(),
        ];
        let stale = stale_siblings(&names, "bench-sequential-fanout-5-", 1);
        assert_eq!(
            stale,
            vec![
                "bench-sequential-fanout-5-10".to_string(),
                "bench-sequential-fanout-5-2".to_string(),
            ]
        );
    }

    #[test]
    fn resolve_deployment_requires_mapping_and_file() {
        let suite_dir = std::env::temp_dir().join(format!(
            "bench_cluster_test_{}",
            std::process::id()
        ));
        let workmodels = suite_dir.join("Examples");
        fs::create_dir_all(&workmodels).expect("workmodel dir");
        fs::write(workmodels.join("workmodel-serial-5services.json"), "{}").expect("workmodel");

        let yaml = format!(
            "\
experiment:
  id: topo-bench
design:
  factors:
    - name: topology
      levels: [sequential_fanout]
    - name: system_size
      levels: [5]
  repetitions: 1
remote:
  host: gl3
  deployer_dir: '~/muBench'
suite:
  dir: {}
  deployments:
    - {{ topology: sequential_fanout, size: 5, workmodel: workmodel-serial-5services.json }}
    - {{ topology: sequential_fanout, size: 10, workmodel: missing.json }}
",
            suite_dir.display()
        );
        let cfg = parse_config(&yaml).expect("config");
        let cluster = ClusterEnv::new(&cfg);

        let descriptor = cluster
            .resolve_deployment("sequential_fanout", 5)
            .expect("resolved");
        assert_eq!(
            descriptor.workmodel_remote,
            "Examples/workmodel-serial-5services.json"
        );

        let err = cluster
            .resolve_deployment("parallel_fanout", 5)
            .expect_err("unknown topology");
        assert!(matches!(err, OrchestratorError::Configuration(_)));

        let err = cluster
            .resolve_deployment("sequential_fanout", 10)
            .expect_err("missing workmodel file");
        assert!(matches!(err, OrchestratorError::Configuration(_)));
        assert!(err.is_fatal());

        let _ = fs::remove_dir_all(suite_dir);
    }
}
