use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

// Intel RAPL counters wrap at 2^18 J; a single wrap per trial is assumed.
pub const ENERGY_COUNTER_MAX_JOULES: f64 = 262144.0;

const MIN_ENERGY_SAMPLES: usize = 2;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultRow {
    pub throughput_rps: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub failure_rate: f64,
    pub request_count: u64,
    pub cpu_usage_avg: f64,
    pub memory_usage_avg: f64,
    pub energy: f64,
    pub dram_energy: f64,
    pub cpu_usage_eb_avg: f64,
    pub cpu_freq_avg: f64,
    pub memory_used_avg: f64,
    pub memory_total: f64,
}

impl ResultRow {
    pub const COLUMNS: [&'static str; 13] = [
        "throughput_rps",
        "avg_latency_ms",
        "p95_latency_ms",
        "failure_rate",
        "request_count",
        "cpu_usage_avg",
        "memory_usage_avg",
        "energy",
        "dram_energy",
        "cpu_usage_eb_avg",
        "cpu_freq_avg",
        "memory_used_avg",
        "memory_total",
    ];

    pub fn values(&self) -> [f64; 13] {
        [
            self.throughput_rps,
            self.avg_latency_ms,
            self.p95_latency_ms,
            self.failure_rate,
            self.request_count as f64,
            self.cpu_usage_avg,
            self.memory_usage_avg,
            self.energy,
            self.dram_energy,
            self.cpu_usage_eb_avg,
            self.cpu_freq_avg,
            self.memory_used_avg,
            self.memory_total,
        ]
    }
}

pub fn failure_rate(failures: u64, requests: u64) -> f64 {
    if requests == 0 {
        0.0
    } else {
        failures as f64 / requests as f64
    }
}

pub fn corrected_delta(first: f64, last: f64, max: f64) -> f64 {
    if last >= first {
        last - first
    } else {
        (max - first) + last
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadSummary {
    pub throughput_rps: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub request_count: u64,
    pub failure_count: u64,
}

// Every missing or unparseable field degrades to zero instead of failing
// the trial.
pub fn normalize_trial(trial_dir: &Path) -> ResultRow {
    let mut row = ResultRow::default();
    apply_load_summary(
        &mut row,
        &trial_dir.join("loadgen").join("results_stats.csv"),
    );
    row.cpu_usage_avg = read_scalar(&trial_dir.join("metric_cpu.txt"));
    row.memory_usage_avg = read_scalar(&trial_dir.join("metric_memory.txt"));
    apply_energy_samples(&mut row, &trial_dir.join("energy_samples.csv"));
    row
}

fn apply_load_summary(row: &mut ResultRow, path: &Path) {
    if !path.exists() {
        warn!(path = %path.display(), "load summary missing; load metrics default to zero");
        return;
    }
    match parse_load_summary(path) {
        Ok(Some(summary)) => {
            row.throughput_rps = summary.throughput_rps;
            row.avg_latency_ms = summary.avg_latency_ms;
            row.p95_latency_ms = summary.p95_latency_ms;
            row.request_count = summary.request_count;
            row.failure_rate = failure_rate(summary.failure_count, summary.request_count);
        }
        Ok(None) => {
            warn!(path = %path.display(), "no aggregated row in load summary");
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse load summary");
        }
    }
}

pub fn parse_load_summary(path: &Path) -> Result<Option<LoadSummary>, csv::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let col = |name: &str| headers.iter().position(|h| h == name);
    let name_col = col("Name");
    let rps_col = col("Requests/s");
    let avg_col = col("Average Response Time");
    let p95_col = col("95%");
    let requests_col = col("Request Count");
    let failures_col = col("Failure Count");

    for record in reader.records() {
        let record = record?;
        let name = name_col.and_then(|i| record.get(i)).unwrap_or("");
        if name != "Aggregated" {
            continue;
        }
        let field_f64 = |i: Option<usize>| {
            i.and_then(|i| record.get(i))
                .and_then(|v| v.trim().parse::<f64>().ok())
                .unwrap_or(0.0)
        };
        let field_u64 = |i: Option<usize>| {
            i.and_then(|i| record.get(i))
                .and_then(|v| v.trim().parse::<f64>().ok())
                .map(|v| v as u64)
                .unwrap_or(0)
        };
        return Ok(Some(LoadSummary {
            throughput_rps: field_f64(rps_col),
            avg_latency_ms: field_f64(avg_col),
            p95_latency_ms: field_f64(p95_col),
            request_count: field_u64(requests_col),
            failure_count: field_u64(failures_col),
        }));
    }
    Ok(None)
}

fn read_scalar(path: &Path) -> f64 {
    match std::fs::read_to_string(path) {
        Ok(raw) => match raw.trim().parse::<f64>() {
            Ok(v) => v,
            Err(_) => {
                warn!(path = %path.display(), "unparseable metric scalar; defaulting to zero");
                0.0
            }
        },
        Err(_) => {
            warn!(path = %path.display(), "metric scalar missing; defaulting to zero");
            0.0
        }
    }
}

struct Accumulator {
    sum: f64,
    count: usize,
}

impl Accumulator {
    fn new() -> Self {
        Self { sum: 0.0, count: 0 }
    }

    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

fn apply_energy_samples(row: &mut ResultRow, path: &Path) {
    if !path.exists() {
        warn!(path = %path.display(), "energy samples missing; energy metrics default to zero");
        return;
    }
    match parse_energy_samples(path) {
        Ok(Some(summary)) => {
            row.energy = summary.energy;
            row.dram_energy = summary.dram_energy;
            row.cpu_usage_eb_avg = summary.cpu_usage_avg;
            row.cpu_freq_avg = summary.cpu_freq_avg;
            row.memory_used_avg = summary.memory_used_avg;
            row.memory_total = summary.memory_total;
        }
        Ok(None) => {
            warn!(path = %path.display(), "too few energy samples; energy metrics default to zero");
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse energy samples");
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnergySummary {
    pub energy: f64,
    pub dram_energy: f64,
    pub cpu_usage_avg: f64,
    pub cpu_freq_avg: f64,
    pub memory_used_avg: f64,
    pub memory_total: f64,
}

pub fn parse_energy_samples(path: &Path) -> Result<Option<EnergySummary>, csv::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let col = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| headers.iter().position(|h| h == *name))
    };
    let package_col = col(&["PACKAGE_ENERGY (J)", "PACKAGE_ENERGY"]);
    let dram_col = col(&["DRAM_ENERGY (J)", "DRAM_ENERGY"]);
    let used_mem_col = col(&["USED_MEMORY (Bytes)", "USED_MEMORY"]);
    let total_mem_col = col(&["TOTAL_MEMORY (Bytes)", "TOTAL_MEMORY"]);
    let usage_cols: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| h.starts_with("CPU_USAGE_"))
        .map(|(i, _)| i)
        .collect();
    let freq_cols: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| h.starts_with("CPU_FREQUENCY_"))
        .map(|(i, _)| i)
        .collect();

    let cell = |record: &csv::StringRecord, i: usize| {
        record
            .get(i)
            .and_then(|v| v.trim().parse::<f64>().ok())
    };

    let mut samples = 0usize;
    let mut package_first = None;
    let mut package_last = None;
    let mut dram_first = None;
    let mut dram_last = None;
    let mut memory_total = None;
    let mut usage = Accumulator::new();
    let mut freq = Accumulator::new();
    let mut used_mem = Accumulator::new();

    for record in reader.records() {
        let record = record?;
        samples += 1;
        if let Some(i) = package_col {
            if let Some(v) = cell(&record, i) {
                package_first.get_or_insert(v);
                package_last = Some(v);
            }
        }
        if let Some(i) = dram_col {
            if let Some(v) = cell(&record, i) {
                dram_first.get_or_insert(v);
                dram_last = Some(v);
            }
        }
        if let Some(i) = total_mem_col {
            if memory_total.is_none() {
                memory_total = cell(&record, i);
            }
        }
        if let Some(i) = used_mem_col {
            if let Some(v) = cell(&record, i) {
                used_mem.push(v);
            }
        }
        for &i in &usage_cols {
            if let Some(v) = cell(&record, i) {
                usage.push(v);
            }
        }
        for &i in &freq_cols {
            if let Some(v) = cell(&record, i) {
                freq.push(v);
            }
        }
    }

    if samples < MIN_ENERGY_SAMPLES {
        return Ok(None);
    }

    let delta = |first: Option<f64>, last: Option<f64>| match (first, last) {
        (Some(first), Some(last)) => {
            round_to(corrected_delta(first, last, ENERGY_COUNTER_MAX_JOULES), 3)
        }
        _ => 0.0,
    };

    Ok(Some(EnergySummary {
        energy: delta(package_first, package_last),
        dram_energy: delta(dram_first, dram_last),
        cpu_usage_avg: round_to(usage.mean(), 2),
        cpu_freq_avg: round_to(freq.mean(), 2),
        memory_used_avg: round_to(used_mem.mean(), 0),
        memory_total: memory_total.unwrap_or(0.0),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn temp_trial_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "bench_metrics_test_{}_{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    #[test]
    fn overflow_correction_single_wrap() {
        assert_eq!(corrected_delta(200000.0, 50000.0, 262144.0), 112144.0);
        assert_eq!(corrected_delta(100.0, 500.0, 262144.0), 400.0);
    }

    #[test]
    fn failure_rate_guards_zero_requests() {
        assert_eq!(failure_rate(0, 0), 0.0);
        assert_eq!(failure_rate(5, 100), 0.05);
    }

    #[test]
    fn absent_artifacts_yield_defaulted_row() {
        let dir = temp_trial_dir("absent");
        let row = normalize_trial(&dir);
        assert_eq!(row, ResultRow::default());
        assert_eq!(row.values().len(), ResultRow::COLUMNS.len());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn extracts_aggregated_load_row() {
        let dir = temp_trial_dir("load");
        let loadgen = dir.join("loadgen");
        fs::create_dir_all(&loadgen).expect("loadgen dir");
        fs::write(
            loadgen.join("results_stats.csv"),
            "Type,Name,Request Count,Failure Count,Average Response Time,Requests/s,95%\n\
             GET,/s0,90,5,11.0,9.1,30.0\n\
             ,Aggregated,100,5,12.5,10.2,33.0\n",
        )
        .expect("stats file");
        let row = normalize_trial(&dir);
        assert_eq!(row.throughput_rps, 10.2);
        assert_eq!(row.avg_latency_ms, 12.5);
        assert_eq!(row.p95_latency_ms, 33.0);
        assert_eq!(row.request_count, 100);
        assert_eq!(row.failure_rate, 0.05);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_aggregated_row_defaults_to_zero() {
        let dir = temp_trial_dir("noagg");
        let loadgen = dir.join("loadgen");
        fs::create_dir_all(&loadgen).expect("loadgen dir");
        fs::write(
            loadgen.join("results_stats.csv"),
            "Type,Name,Request Count,Failure Count,Average Response Time,Requests/s,95%\n\
             GET,/s0,90,5,11.0,9.1,30.0\n",
        )
        .expect("stats file");
        let row = normalize_trial(&dir);
        assert_eq!(row.throughput_rps, 0.0);
        assert_eq!(row.request_count, 0);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn reads_metric_scalars() {
        let dir = temp_trial_dir("scalars");
        fs::write(dir.join("metric_cpu.txt"), "0.375\n").expect("cpu");
        fs::write(dir.join("metric_memory.txt"), "1048576\n").expect("mem");
        let row = normalize_trial(&dir);
        assert_eq!(row.cpu_usage_avg, 0.375);
        assert_eq!(row.memory_usage_avg, 1048576.0);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn energy_samples_with_wrap_and_averages() {
        let dir = temp_trial_dir("energy");
        fs::write(
            dir.join("energy_samples.csv"),
            "Time,PACKAGE_ENERGY (J),DRAM_ENERGY (J),CPU_USAGE_0,CPU_USAGE_1,CPU_FREQUENCY_0,CPU_FREQUENCY_1,USED_MEMORY,TOTAL_MEMORY\n\
             1,200000,100,10,20,1000,2000,400,1000\n\
             2,250000,200,30,40,3000,4000,600,1000\n\
             3,50000,500,50,60,5000,6000,800,1000\n",
        )
        .expect("energy file");
        let row = normalize_trial(&dir);
        assert_eq!(row.energy, 112144.0);
        assert_eq!(row.dram_energy, 400.0);
        assert_eq!(row.cpu_usage_eb_avg, 35.0);
        assert_eq!(row.cpu_freq_avg, 3500.0);
        assert_eq!(row.memory_used_avg, 600.0);
        assert_eq!(row.memory_total, 1000.0);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn single_energy_sample_is_not_enough() {
        let dir = temp_trial_dir("single");
        fs::write(
            dir.join("energy_samples.csv"),
            "Time,PACKAGE_ENERGY (J)\n1,100\n",
        )
        .expect("energy file");
        let row = normalize_trial(&dir);
        assert_eq!(row.energy, 0.0);
        let _ = fs::remove_dir_all(dir);
    }
}
