use std::collections::BTreeMap;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::{json, Value};

use crate::config::Factor;
use crate::error::{OpResult, OrchestratorError};
use crate::metrics::ResultRow;

#[derive(Debug, Clone, PartialEq)]
pub struct TrialSpec {
    factors: BTreeMap<String, Value>,
    repetition: u32,
    id: String,
}

impl TrialSpec {
    fn new(factor_order: &[String], factors: BTreeMap<String, Value>, repetition: u32) -> Self {
        let mut parts = Vec::with_capacity(factor_order.len() + 1);
        for name in factor_order {
            let level = factors.get(name).cloned().unwrap_or(Value::Null);
            parts.push(level_display(&level));
        }
        parts.push(format!("r{}", repetition));
        let id = parts.join("-");
        Self {
            factors,
            repetition,
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn repetition(&self) -> u32 {
        self.repetition
    }

    pub fn factors(&self) -> &BTreeMap<String, Value> {
        &self.factors
    }

    pub fn level_str(&self, name: &str) -> Option<String> {
        self.factors.get(name).map(level_display)
    }

    pub fn level_u64(&self, name: &str) -> Option<u64> {
        self.factors.get(name).and_then(|v| v.as_u64())
    }
}

pub fn level_display(level: &Value) -> String {
    match level {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct RecordedTrial {
    spec: TrialSpec,
    row: ResultRow,
}

pub struct RunMatrix {
    factor_names: Vec<String>,
    order: Vec<TrialSpec>,
    cursor: usize,
    results: BTreeMap<String, RecordedTrial>,
}

impl RunMatrix {
    pub fn generate(
        factors: &[Factor],
        repetitions: u32,
        exclude: &[BTreeMap<String, Value>],
        shuffle: bool,
        seed: Option<u64>,
    ) -> Self {
        let factor_names: Vec<String> = factors.iter().map(|f| f.name.clone()).collect();

        let mut combos: Vec<BTreeMap<String, Value>> = vec![BTreeMap::new()];
        for factor in factors {
            let mut next = Vec::with_capacity(combos.len() * factor.levels.len().max(1));
            for combo in &combos {
                for level in &factor.levels {
                    let mut c = combo.clone();
                    c.insert(factor.name.clone(), level.clone());
                    next.push(c);
                }
            }
            combos = next;
        }

        let mut order = Vec::with_capacity(combos.len() * repetitions as usize);
        for combo in combos {
            if is_excluded(&combo, exclude) {
                continue;
            }
            for rep in 1..=repetitions {
                order.push(TrialSpec::new(&factor_names, combo.clone(), rep));
            }
        }

        if shuffle {
            match seed {
                Some(seed) => order.shuffle(&mut StdRng::seed_from_u64(seed)),
                None => order.shuffle(&mut rand::thread_rng()),
            }
        }

        Self {
            factor_names,
            order,
            cursor: 0,
            results: BTreeMap::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.order.len()
    }

    pub fn completed(&self) -> usize {
        self.results.len()
    }

    pub fn specs(&self) -> &[TrialSpec] {
        &self.order
    }

    pub fn next_spec(&mut self) -> Option<TrialSpec> {
        let spec = self.order.get(self.cursor).cloned();
        if spec.is_some() {
            self.cursor += 1;
        }
        spec
    }

    // Duplicate recordings for the same spec overwrite, never duplicate.
    pub fn record_result(&mut self, spec: &TrialSpec, row: ResultRow) {
        self.results.insert(
            spec.id().to_string(),
            RecordedTrial {
                spec: spec.clone(),
                row,
            },
        );
    }

    pub fn result_for(&self, spec: &TrialSpec) -> Option<&ResultRow> {
        self.results.get(spec.id()).map(|r| &r.row)
    }

    pub fn write_results_csv(&self, path: &Path) -> OpResult<()> {
        let mut writer = csv::Writer::from_path(path)
            .map_err(|e| OrchestratorError::Environment(format!("cannot write results: {}", e)))?;
        let mut header: Vec<String> = self.factor_names.clone();
        header.push("repetition".to_string());
        header.extend(ResultRow::COLUMNS.iter().map(|c| c.to_string()));
        writer
            .write_record(&header)
            .map_err(|e| OrchestratorError::Environment(e.to_string()))?;
        for recorded in self.results.values() {
            let mut record: Vec<String> = self
                .factor_names
                .iter()
                .map(|name| recorded.spec.level_str(name).unwrap_or_default())
                .collect();
            record.push(recorded.spec.repetition().to_string());
            record.extend(recorded.row.values().iter().map(|v| v.to_string()));
            writer
                .write_record(&record)
                .map_err(|e| OrchestratorError::Environment(e.to_string()))?;
        }
        writer
            .flush()
            .map_err(|e| OrchestratorError::Environment(e.to_string()))?;
        Ok(())
    }

    pub fn results_json(&self) -> Value {
        let mut out = serde_json::Map::new();
        for (id, recorded) in &self.results {
            out.insert(
                id.clone(),
                json!({
                    "factors": recorded.spec.factors(),
                    "repetition": recorded.spec.repetition(),
                    "metrics": &recorded.row,
                }),
            );
        }
        Value::Object(out)
    }
}

fn is_excluded(combo: &BTreeMap<String, Value>, exclude: &[BTreeMap<String, Value>]) -> bool {
    exclude.iter().any(|entry| {
        !entry.is_empty()
            && entry
                .iter()
                .all(|(name, level)| combo.get(name) == Some(level))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factor(name: &str, levels: &[Value]) -> Factor {
        Factor {
            name: name.to_string(),
            levels: levels.to_vec(),
        }
    }

    fn six_by_three() -> Vec<Factor> {
        vec![
            factor(
                "topology",
                &[
                    json!("sequential_fanout"),
                    json!("parallel_fanout"),
                    json!("chain_with_branching"),
                    json!("hierarchical_tree"),
                    json!("probabilistic_tree"),
                    json!("complex_mesh"),
                ],
            ),
            factor("system_size", &[json!(5), json!(10), json!(20)]),
        ]
    }

    #[test]
    fn full_design_yields_180_unique_specs() {
        let matrix = RunMatrix::generate(&six_by_three(), 10, &[], false, None);
        assert_eq!(matrix.total(), 180);
        let mut ids: Vec<&str> = matrix.specs().iter().map(|s| s.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 180);
    }

    #[test]
    fn exclusions_remove_matching_combinations() {
        let mut exclude = BTreeMap::new();
        exclude.insert("topology".to_string(), json!("complex_mesh"));
        exclude.insert("system_size".to_string(), json!(20));
        let matrix = RunMatrix::generate(&six_by_three(), 10, &[exclude], false, None);
        assert_eq!(matrix.total(), 170);
        assert!(!matrix
            .specs()
            .iter()
            .any(|s| s.id().starts_with("complex_mesh-20-")));
    }

    #[test]
    fn seeded_shuffle_is_deterministic_and_complete() {
        let a = RunMatrix::generate(&six_by_three(), 10, &[], true, Some(1337));
        let b = RunMatrix::generate(&six_by_three(), 10, &[], true, Some(1337));
        let ids_a: Vec<&str> = a.specs().iter().map(|s| s.id()).collect();
        let ids_b: Vec<&str> = b.specs().iter().map(|s| s.id()).collect();
        assert_eq!(ids_a, ids_b);
        let unshuffled = RunMatrix::generate(&six_by_three(), 10, &[], false, None);
        let mut sorted_a = ids_a.clone();
        sorted_a.sort_unstable();
        let mut sorted_plain: Vec<&str> = unshuffled.specs().iter().map(|s| s.id()).collect();
        sorted_plain.sort_unstable();
        assert_eq!(sorted_a, sorted_plain);
    }

    #[test]
    fn next_spec_walks_generated_order_once() {
        let mut matrix = RunMatrix::generate(&six_by_three(), 1, &[], false, None);
        let mut seen = 0;
        while matrix.next_spec().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 18);
        assert!(matrix.next_spec().is_none());
    }

    #[test]
    fn recording_is_idempotent_per_spec() {
        let mut matrix = RunMatrix::generate(&six_by_three(), 2, &[], false, None);
        let spec = matrix.next_spec().expect("spec");
        let mut row = ResultRow::default();
        row.throughput_rps = 1.0;
        matrix.record_result(&spec, row.clone());
        row.throughput_rps = 2.0;
        matrix.record_result(&spec, row);
        assert_eq!(matrix.completed(), 1);
        assert_eq!(
            matrix.result_for(&spec).map(|r| r.throughput_rps),
            Some(2.0)
        );
    }

    #[test]
    fn csv_export_is_keyed_and_stable() {
        let dir = std::env::temp_dir().join(format!("bench_matrix_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        let mut matrix = RunMatrix::generate(&six_by_three(), 1, &[], false, None);
        let first = matrix.next_spec().expect("spec");
        let second = matrix.next_spec().expect("spec");
        // Record out of execution order; stored table must not depend on it.
        matrix.record_result(&second, ResultRow::default());
        matrix.record_result(&first, ResultRow::default());
        let path = dir.join("run_table.csv");
        matrix.write_results_csv(&path).expect("write csv");
        let content = std::fs::read_to_string(&path).expect("read csv");
        let mut lines = content.lines();
        let header = lines.next().expect("header");
        assert!(header.starts_with("topology,system_size,repetition,throughput_rps"));
        assert_eq!(lines.count(), 2);
        let _ = std::fs::remove_dir_all(dir);
    }
}
