use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OpResult, OrchestratorError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub experiment: ExperimentSection,
    pub design: DesignSection,
    pub remote: RemoteSection,
    pub suite: SuiteSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub metric_store: MetricStoreSection,
    #[serde(default)]
    pub load: LoadSection,
    #[serde(default)]
    pub sampler: SamplerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSection {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignSection {
    pub factors: Vec<Factor>,
    pub repetitions: u32,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    #[serde(default)]
    pub random_seed: Option<u64>,
    #[serde(default)]
    pub exclude: Vec<BTreeMap<String, Value>>,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Factor {
    pub name: String,
    pub levels: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSection {
    pub host: String,
    pub deployer_dir: String,
    #[serde(default = "default_deployer_command")]
    pub deployer_command: String,
    #[serde(default = "default_deploy_timeout_seconds")]
    pub deploy_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteSection {
    pub dir: PathBuf,
    #[serde(default = "default_params_template")]
    pub params_template: PathBuf,
    #[serde(default = "default_workmodel_dir")]
    pub workmodel_dir: PathBuf,
    pub deployments: Vec<DeploymentEntry>,
    #[serde(default = "default_namespace_prefix")]
    pub namespace_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentEntry {
    pub topology: String,
    pub size: u64,
    pub workmodel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub url: String,
    pub probe_path: String,
    pub service: String,
    pub service_port: u16,
    pub local_port: u16,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            url: "http://localhost:9090".to_string(),
            probe_path: "/s0".to_string(),
            service: "gw-nginx".to_string(),
            service_port: 80,
            local_port: 9090,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricStoreSection {
    pub url: String,
}

impl Default for MetricStoreSection {
    fn default() -> Self {
        Self {
            url: "http://localhost:30000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadSection {
    pub executable: PathBuf,
    pub script: PathBuf,
    pub users: u32,
    pub spawn_rate: u32,
    pub duration: String,
    pub timeout_seconds: u64,
    pub user_class: Option<String>,
}

impl Default for LoadSection {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("venv/bin/locust"),
            script: PathBuf::from("Benchmarks/Locust/locustfile.py"),
            users: 100,
            spawn_rate: 50,
            duration: "10m".to_string(),
            timeout_seconds: 900,
            user_class: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerSection {
    pub command: String,
    pub grace_seconds: u64,
    pub scratch_prefix: String,
}

impl Default for SamplerSection {
    fn default() -> Self {
        Self {
            command: "energibridge".to_string(),
            grace_seconds: 3,
            scratch_prefix: "/tmp/energy_".to_string(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("experiments")
}

fn default_true() -> bool {
    true
}

fn default_cooldown_seconds() -> u64 {
    60
}

fn default_deployer_command() -> String {
    "python3 Deployers/K8sDeployer/RunK8sDeployer.py".to_string()
}

fn default_deploy_timeout_seconds() -> u64 {
    300
}

fn default_params_template() -> PathBuf {
    PathBuf::from("Configs/K8sParameters.json")
}

fn default_workmodel_dir() -> PathBuf {
    PathBuf::from("Examples")
}

fn default_namespace_prefix() -> String {
    "bench".to_string()
}

fn validate_required_fields(json_value: &Value) -> OpResult<()> {
    let required: &[&str] = &[
        "/experiment/id",
        "/design/factors",
        "/design/repetitions",
        "/remote/host",
        "/remote/deployer_dir",
        "/suite/dir",
        "/suite/deployments",
    ];
    let mut missing = Vec::new();
    for pointer in required {
        let value = json_value.pointer(pointer);
        let is_missing = match value {
            None => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Number(n)) => {
                n.as_u64() == Some(0) && *pointer == "/design/repetitions"
            }
            Some(Value::Array(a)) => a.is_empty(),
            _ => false,
        };
        if is_missing {
            missing.push(*pointer);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(OrchestratorError::Configuration(format!(
            "experiment config missing required fields:\n{}",
            missing
                .iter()
                .map(|p| format!("  - {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        )))
    }
}

pub fn parse_config(raw: &str) -> OpResult<ExperimentConfig> {
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(raw)
        .map_err(|e| OrchestratorError::Configuration(format!("invalid YAML: {}", e)))?;
    let json_value: Value = serde_json::to_value(yaml_value)
        .map_err(|e| OrchestratorError::Configuration(format!("invalid config structure: {}", e)))?;
    validate_required_fields(&json_value)?;
    serde_json::from_value(json_value)
        .map_err(|e| OrchestratorError::Configuration(format!("invalid config: {}", e)))
}

pub fn load_config(path: &Path) -> OpResult<ExperimentConfig> {
    let raw = fs::read_to_string(path).map_err(|e| {
        OrchestratorError::Configuration(format!("cannot read {}: {}", path.display(), e))
    })?;
    parse_config(&raw)
}

#[cfg(test)]
pub(crate) const TEST_CONFIG_YAML: &str = "\
experiment:
  id: topo-bench
design:
  factors:
    - name: topology
      levels: [sequential_fanout, parallel_fanout]
    - name: system_size
      levels: [5, 10]
  repetitions: 2
  shuffle: false
  cooldown_seconds: 0
remote:
  host: gl3
  deployer_dir: '~/muBench'
suite:
  dir: /tmp/bench-suite
  deployments:
    - { topology: sequential_fanout, size: 5, workmodel: workmodel-serial-5services.json }
    - { topology: sequential_fanout, size: 10, workmodel: workmodel-serial-10services.json }
    - { topology: parallel_fanout, size: 5, workmodel: workmodel-parallel-5services.json }
    - { topology: parallel_fanout, size: 10, workmodel: workmodel-parallel-10services.json }
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg = parse_config(TEST_CONFIG_YAML).expect("config should parse");
        assert_eq!(cfg.experiment.id, "topo-bench");
        assert_eq!(cfg.design.factors.len(), 2);
        assert_eq!(cfg.design.repetitions, 2);
        assert_eq!(cfg.remote.deploy_timeout_seconds, 300);
        assert_eq!(cfg.gateway.service, "gw-nginx");
        assert_eq!(cfg.metric_store.url, "http://localhost:30000");
        assert_eq!(cfg.load.users, 100);
        assert_eq!(cfg.sampler.command, "energibridge");
        assert_eq!(cfg.suite.namespace_prefix, "bench");
    }

    #[test]
    fn reports_all_missing_fields_at_once() {
        let raw = "\
experiment:
  id: ''
design:
  repetitions: 0
remote:
  host: gl3
suite:
  deployments: []
";
        let err = parse_config(raw).expect_err("should fail");
        let msg = err.to_string();
        assert!(msg.contains("/experiment/id"), "{}", msg);
        assert!(msg.contains("/design/factors"), "{}", msg);
        assert!(msg.contains("/design/repetitions"), "{}", msg);
        assert!(msg.contains("/remote/deployer_dir"), "{}", msg);
        assert!(msg.contains("/suite/dir"), "{}", msg);
        assert!(msg.contains("/suite/deployments"), "{}", msg);
        assert!(!msg.contains("/remote/host"), "{}", msg);
    }

    #[test]
    fn rejects_malformed_yaml_as_configuration_error() {
        let err = parse_config(": not yaml").expect_err("should fail");
        assert!(matches!(err, OrchestratorError::Configuration(_)));
    }
}
