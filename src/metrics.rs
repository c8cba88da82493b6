//! Prometheus-style metrics for task/batch/queue observability.
//!
//! Generic counter/gauge/histogram registry lifted from the teacher's
//! `MetricsRegistry` (same storage shape, same Prometheus text exposition),
//! with the domain-specific tracking methods replaced: instead of search and
//! indexing-job metrics this tracks tasks created/completed/failed, batch
//! durations, and queue depth, per §10's metrics list.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

pub struct MetricsRegistry {
    counters: Arc<RwLock<HashMap<String, Counter>>>,
    gauges: Arc<RwLock<HashMap<String, Gauge>>>,
    histograms: Arc<RwLock<HashMap<String, Histogram>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(RwLock::new(HashMap::new())),
            gauges: Arc::new(RwLock::new(HashMap::new())),
            histograms: Arc::new(RwLock::new(HashMap::new())),
            start_time: Instant::now(),
        }
    }

    pub async fn increment_counter(&self, name: &str, labels: HashMap<String, String>) {
        let mut counters = self.counters.write().await;
        let key = Self::metric_key(name, &labels);
        counters.entry(key).or_insert_with(|| Counter::new(name.to_string(), labels)).increment();
    }

    pub async fn set_gauge(&self, name: &str, value: f64, labels: HashMap<String, String>) {
        let mut gauges = self.gauges.write().await;
        let key = Self::metric_key(name, &labels);
        gauges.entry(key).or_insert_with(|| Gauge::new(name.to_string(), labels)).set(value);
    }

    pub async fn observe_histogram(&self, name: &str, value: f64, labels: HashMap<String, String>) {
        let mut histograms = self.histograms.write().await;
        let key = Self::metric_key(name, &labels);
        histograms.entry(key).or_insert_with(|| Histogram::new(name.to_string(), labels)).observe(value);
    }

    /// Record a task reaching a terminal or near-terminal state.
    pub async fn record_task_created(&self, strategy: &str) {
        let mut labels = HashMap::new();
        labels.insert("strategy".to_string(), strategy.to_string());
        self.increment_counter("review_tasks_created_total", labels).await;
    }

    pub async fn record_task_completed(&self, strategy: &str) {
        let mut labels = HashMap::new();
        labels.insert("strategy".to_string(), strategy.to_string());
        self.increment_counter("review_tasks_completed_total", labels).await;
    }

    pub async fn record_task_failed(&self, strategy: &str, reason_kind: &str) {
        let mut labels = HashMap::new();
        labels.insert("strategy".to_string(), strategy.to_string());
        labels.insert("reason".to_string(), reason_kind.to_string());
        self.increment_counter("review_tasks_failed_total", labels).await;
    }

    /// Record one batch's wall-clock duration against the assistant.
    pub async fn observe_batch_duration(&self, outcome: &str, duration_ms: f64) {
        let mut labels = HashMap::new();
        labels.insert("outcome".to_string(), outcome.to_string());
        self.observe_histogram("review_batch_duration_ms", duration_ms, labels).await;
    }

    /// Current depth of the scheduler's admission channel.
    pub async fn set_queue_depth(&self, depth: usize) {
        self.set_gauge("review_queue_depth", depth as f64, HashMap::new()).await;
    }

    pub async fn record_webhook_delivery(&self, platform: &str, outcome: &str) {
        let mut labels = HashMap::new();
        labels.insert("platform".to_string(), platform.to_string());
        labels.insert("outcome".to_string(), outcome.to_string());
        self.increment_counter("review_webhook_deliveries_total", labels).await;
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub async fn export_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!(
            "# HELP process_uptime_seconds Time since server started\n\
             # TYPE process_uptime_seconds gauge\n\
             process_uptime_seconds {}\n\n",
            self.uptime_seconds()
        ));

        for counter in self.counters.read().await.values() {
            output.push_str(&counter.export_prometheus());
        }
        for gauge in self.gauges.read().await.values() {
            output.push_str(&gauge.export_prometheus());
        }
        for histogram in self.histograms.read().await.values() {
            output.push_str(&histogram.export_prometheus());
        }
        output
    }

    pub async fn get_stats(&self) -> MetricsStats {
        MetricsStats {
            total_counters: self.counters.read().await.len(),
            total_gauges: self.gauges.read().await.len(),
            total_histograms: self.histograms.read().await.len(),
            uptime_seconds: self.uptime_seconds(),
        }
    }

    fn metric_key(name: &str, labels: &HashMap<String, String>) -> String {
        let mut pairs: Vec<_> = labels.iter().collect();
        pairs.sort_by_key(|(k, _)| *k);
        let label_str = pairs.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect::<Vec<_>>().join(",");
        format!("{name}:{label_str}")
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
struct Counter {
    name: String,
    labels: HashMap<String, String>,
    value: u64,
}

impl Counter {
    fn new(name: String, labels: HashMap<String, String>) -> Self {
        Self { name, labels, value: 0 }
    }

    fn increment(&mut self) {
        self.value += 1;
    }

    fn export_prometheus(&self) -> String {
        format!("# TYPE {} counter\n{}{} {}\n\n", self.name, self.name, format_labels(&self.labels), self.value)
    }
}

#[derive(Debug, Clone, Serialize)]
struct Gauge {
    name: String,
    labels: HashMap<String, String>,
    value: f64,
}

impl Gauge {
    fn new(name: String, labels: HashMap<String, String>) -> Self {
        Self { name, labels, value: 0.0 }
    }

    fn set(&mut self, value: f64) {
        self.value = value;
    }

    fn export_prometheus(&self) -> String {
        format!("# TYPE {} gauge\n{}{} {}\n\n", self.name, self.name, format_labels(&self.labels), self.value)
    }
}

#[derive(Debug, Clone)]
struct Histogram {
    name: String,
    labels: HashMap<String, String>,
    values: Vec<f64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(name: String, labels: HashMap<String, String>) -> Self {
        Self { name, labels, values: Vec::new(), sum: 0.0, count: 0 }
    }

    fn observe(&mut self, value: f64) {
        self.values.push(value);
        self.sum += value;
        self.count += 1;
    }

    fn quantile(&self, q: f64) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mut sorted = self.values.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let index = ((sorted.len() - 1) as f64 * q).round() as usize;
        sorted[index]
    }

    fn export_prometheus(&self) -> String {
        let labels = format_labels(&self.labels);
        let mut output = format!("# TYPE {} histogram\n", self.name);
        for q in &[0.5, 0.9, 0.95, 0.99] {
            let mut quantile_labels = self.labels.clone();
            quantile_labels.insert("quantile".to_string(), q.to_string());
            output.push_str(&format!("{}{} {}\n", self.name, format_labels(&quantile_labels), self.quantile(*q)));
        }
        output.push_str(&format!("{}_sum{} {}\n", self.name, labels, self.sum));
        output.push_str(&format!("{}_count{} {}\n\n", self.name, labels, self.count));
        output
    }
}

fn format_labels(labels: &HashMap<String, String>) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<_> = labels.iter().collect();
    pairs.sort_by_key(|(k, _)| *k);
    let formatted = pairs.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect::<Vec<_>>().join(",");
    format!("{{{formatted}}}")
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsStats {
    pub total_counters: usize,
    pub total_gauges: usize,
    pub total_histograms: usize,
    pub uptime_seconds: f64,
}

use once_cell::sync::Lazy;

static GLOBAL_REGISTRY: Lazy<Arc<MetricsRegistry>> = Lazy::new(|| Arc::new(MetricsRegistry::new()));

pub fn global_registry() -> Arc<MetricsRegistry> {
    Arc::clone(&GLOBAL_REGISTRY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counter_accumulates_across_calls() {
        let registry = MetricsRegistry::new();
        registry.record_task_created("commit").await;
        registry.record_task_created("commit").await;

        let export = registry.export_prometheus().await;
        assert!(export.contains("review_tasks_created_total"));
        assert!(export.contains('2'));
    }

    #[tokio::test]
    async fn gauge_reports_latest_value() {
        let registry = MetricsRegistry::new();
        registry.set_queue_depth(3).await;
        registry.set_queue_depth(7).await;

        let export = registry.export_prometheus().await;
        assert!(export.contains("review_queue_depth"));
        assert!(export.contains(" 7"));
    }

    #[tokio::test]
    async fn histogram_exports_sum_and_count() {
        let registry = MetricsRegistry::new();
        registry.observe_batch_duration("success", 10.0).await;
        registry.observe_batch_duration("success", 20.0).await;

        let export = registry.export_prometheus().await;
        assert!(export.contains("review_batch_duration_ms"));
        assert!(export.contains("_sum"));
        assert!(export.contains("_count"));
    }

    #[test]
    fn histogram_quantiles_are_ordered() {
        let mut histogram = Histogram::new("t".to_string(), HashMap::new());
        for i in 1..=100 {
            histogram.observe(i as f64);
        }
        assert_eq!(histogram.quantile(0.5), 50.0);
        assert!(histogram.quantile(0.9) >= 90.0);
    }

    #[tokio::test]
    async fn stats_reflect_distinct_metric_families() {
        let registry = MetricsRegistry::new();
        registry.record_task_created("commit").await;
        registry.set_queue_depth(1).await;

        let stats = registry.get_stats().await;
        assert_eq!(stats.total_counters, 1);
        assert_eq!(stats.total_gauges, 1);
    }
}
