// Metrics module - the process-wide metric registry
//
// This module owns every exported series. Instance collectors push decoded
// device documents into it; the scrape endpoint renders it.
//
// # Architecture
// - A fixed descriptor table maps document fields to exported series
// - Counters advance only through the delta tracker
// - Histogram buckets are converted to cumulative form before tracking
// - One mutex guards tracker state and the matching series update

use chrono::{DateTime, Utc};
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;

pub mod bucket;
pub mod delta;
pub mod extract;

use bucket::{cumulative_buckets, format_bound};
use delta::DeltaTracker;
use extract::extract;

/// Label carried by every exported series
pub const INSTANCE_LABEL: &str = "vplc_instance";

/// Boundary label carried by histogram bucket series
pub const BOUND_LABEL: &str = "le";

/// Object in the cyclic-backup document holding all scalar fields
const PERFORMANCE_SECTION: &str = "performanceMetrics";

/// Errors raised while updating or rendering the registry
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Document has no '{0}' object")]
    MissingSection(&'static str),

    #[error("Prometheus registry error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Rendered metrics are not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// How an extracted value is exported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Accumulated through the delta tracker
    Counter,
    /// Set directly to the latest reading
    Gauge,
}

/// Static description of one scalar metric
#[derive(Debug)]
pub struct MetricDescriptor {
    /// Path of the field below `performanceMetrics`
    pub path: &'static str,
    /// Exported series name
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricKind,
}

/// Scalar metrics exported per device (edit here if the device API changes)
pub static DESCRIPTORS: &[MetricDescriptor] = &[
    MetricDescriptor {
        path: "writeSuccesses",
        name: "crb_successful_cycle_count",
        help: "Total number of successful cycles",
        kind: MetricKind::Counter,
    },
    MetricDescriptor {
        path: "writeAttempts",
        name: "crb_total_cycle_count",
        help: "Total number of cycles",
        kind: MetricKind::Counter,
    },
    MetricDescriptor {
        path: "cycleDelay/totalNs",
        name: "crb_sum_cycle_extension_duration",
        help: "Sum of cycle extension durations",
        kind: MetricKind::Counter,
    },
    MetricDescriptor {
        path: "cycleDelay/minNs",
        name: "crb_min_cycle_extension_duration",
        help: "Minimum cycle extension duration",
        kind: MetricKind::Gauge,
    },
    MetricDescriptor {
        path: "cycleDelay/maxNs",
        name: "crb_max_cycle_extension_duration",
        help: "Maximum cycle extension duration",
        kind: MetricKind::Gauge,
    },
    MetricDescriptor {
        path: "writeDuration/minNs",
        name: "crb_min_write_duration",
        help: "Minimum write duration",
        kind: MetricKind::Gauge,
    },
    MetricDescriptor {
        path: "writeDuration/maxNs",
        name: "crb_max_write_duration",
        help: "Maximum write duration",
        kind: MetricKind::Gauge,
    },
    MetricDescriptor {
        path: "writeDuration/totalNs",
        name: "crb_sum_write_duration",
        help: "Sum of write durations",
        kind: MetricKind::Counter,
    },
];

/// The two duration histograms a device reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistogramKind {
    CycleExtension,
    WriteDuration,
}

impl HistogramKind {
    pub const ALL: [HistogramKind; 2] = [HistogramKind::CycleExtension, HistogramKind::WriteDuration];

    pub fn metric_name(&self) -> &'static str {
        match self {
            HistogramKind::CycleExtension => "cycle_extension_bucket",
            HistogramKind::WriteDuration => "write_duration_bucket",
        }
    }

    fn help(&self) -> &'static str {
        match self {
            HistogramKind::CycleExtension => "Cycle extension histogram buckets (cumulative)",
            HistogramKind::WriteDuration => "Write duration histogram buckets (cumulative)",
        }
    }
}

/// Histogram document returned by `/retain/cyclic-backup/histogram`
///
/// # Example
/// ```json
/// {
///   "timestampNs": 1718000000000000000,
///   "cycleDelayHistogram": { "0.0-1.0ms": 12, "20.0+ms": 1 },
///   "writeDurationHistogram": { "0.0-1.0ms": 40 }
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistogramDocument {
    #[serde(rename = "timestampNs", default)]
    pub timestamp_ns: i64,

    #[serde(rename = "cycleDelayHistogram", default)]
    pub cycle_extension: HashMap<String, f64>,

    #[serde(rename = "writeDurationHistogram", default)]
    pub write_duration: HashMap<String, f64>,
}

impl HistogramDocument {
    pub fn buckets(&self, kind: HistogramKind) -> &HashMap<String, f64> {
        match kind {
            HistogramKind::CycleExtension => &self.cycle_extension,
            HistogramKind::WriteDuration => &self.write_duration,
        }
    }

    /// Device-side capture time, if the timestamp is set
    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        if self.timestamp_ns <= 0 {
            return None;
        }
        Some(DateTime::from_timestamp_nanos(self.timestamp_ns))
    }
}

enum ScalarSeries {
    Counter(CounterVec),
    Gauge(GaugeVec),
}

/// Raw-value bookkeeping behind the exported counters
#[derive(Default)]
struct TrackerState {
    /// (series name, instance) -> last raw reading
    counters: DeltaTracker<(&'static str, String)>,
    /// (histogram, instance, le) -> last cumulative count
    buckets: DeltaTracker<(HistogramKind, String, String)>,
    /// (histogram, instance) pairs whose baseline document has been seen
    baselined: HashSet<(HistogramKind, String)>,
}

/// Process-wide metric registry
///
/// Shared behind an `Arc` between every instance collector and the scrape
/// endpoint. Updates lock only for a single descriptor or a single histogram,
/// never across network calls; rendering takes the same lock so a scrape
/// never observes a half-applied histogram.
pub struct MetricRegistry {
    registry: Registry,
    scalars: Vec<(&'static MetricDescriptor, ScalarSeries)>,
    histograms: Vec<(HistogramKind, CounterVec)>,
    state: Mutex<TrackerState>,
}

impl MetricRegistry {
    /// Creates the registry and registers every series
    pub fn new() -> Result<Self, RegistryError> {
        let registry = Registry::new();

        let mut scalars = Vec::with_capacity(DESCRIPTORS.len());
        for desc in DESCRIPTORS {
            let opts = Opts::new(desc.name, desc.help);
            let series = match desc.kind {
                MetricKind::Counter => {
                    let vec = CounterVec::new(opts, &[INSTANCE_LABEL])?;
                    registry.register(Box::new(vec.clone()))?;
                    ScalarSeries::Counter(vec)
                }
                MetricKind::Gauge => {
                    let vec = GaugeVec::new(opts, &[INSTANCE_LABEL])?;
                    registry.register(Box::new(vec.clone()))?;
                    ScalarSeries::Gauge(vec)
                }
            };
            scalars.push((desc, series));
        }

        let mut histograms = Vec::with_capacity(HistogramKind::ALL.len());
        for kind in HistogramKind::ALL {
            let vec = CounterVec::new(
                Opts::new(kind.metric_name(), kind.help()),
                &[INSTANCE_LABEL, BOUND_LABEL],
            )?;
            registry.register(Box::new(vec.clone()))?;
            histograms.push((kind, vec));
        }

        Ok(MetricRegistry {
            registry,
            scalars,
            histograms,
            state: Mutex::new(TrackerState::default()),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, TrackerState> {
        // Every update is applied whole while the lock is held, so state
        // behind a poisoned lock is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a cyclic-backup document for one instance
    ///
    /// Fields that are absent or non-numeric are skipped individually.
    ///
    /// # Returns
    /// * `Ok(usize)` - Number of descriptors that were updated
    /// * `Err(RegistryError::MissingSection)` - No `performanceMetrics` object;
    ///   nothing was touched
    pub fn update_performance(&self, instance: &str, document: &Value) -> Result<usize, RegistryError> {
        let section = document
            .get(PERFORMANCE_SECTION)
            .filter(|v| v.is_object())
            .ok_or(RegistryError::MissingSection(PERFORMANCE_SECTION))?;

        let mut applied = 0;
        for (desc, series) in &self.scalars {
            let Some(value) = extract(section, desc.path) else {
                debug!(instance, metric = desc.name, "Field '{}' absent, skipping", desc.path);
                continue;
            };

            let mut state = self.lock_state();
            match series {
                ScalarSeries::Counter(vec) => {
                    let increment = state.counters.apply((desc.name, instance.to_string()), value);
                    let counter = vec.with_label_values(&[instance]);
                    if increment > 0.0 {
                        counter.inc_by(increment);
                    }
                }
                ScalarSeries::Gauge(vec) => {
                    vec.with_label_values(&[instance]).set(value);
                }
            }
            applied += 1;
        }

        Ok(applied)
    }

    /// Applies a histogram document for one instance
    ///
    /// The first document seen for a (histogram, instance) pair is the
    /// baseline for all of its buckets. A bucket that only shows up in a later
    /// document counts from zero, which keeps the exported counts
    /// non-decreasing in `le`.
    ///
    /// # Returns
    /// Number of bucket boundaries that were updated across both histograms
    pub fn update_histograms(&self, instance: &str, document: &HistogramDocument) -> usize {
        let mut applied = 0;

        for (kind, vec) in &self.histograms {
            let cumulative = cumulative_buckets(document.buckets(*kind));

            let mut state = self.lock_state();
            let baseline = state.baselined.insert((*kind, instance.to_string()));

            for (bound, count) in cumulative {
                let le = format_bound(bound);
                let key = (*kind, instance.to_string(), le.clone());

                // Baseline documents only record; later ones advance the series
                let increment = if baseline {
                    state.buckets.apply(key, count)
                } else {
                    state.buckets.apply_from_zero(key, count)
                };
                let counter = vec.with_label_values(&[instance, le.as_str()]);
                if increment > 0.0 {
                    counter.inc_by(increment);
                }
                applied += 1;
            }
        }

        applied
    }

    /// Renders every series in the text exposition format
    pub fn render(&self) -> Result<String, RegistryError> {
        let families = {
            let _state = self.lock_state();
            self.registry.gather()
        };

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Current value of one series, if it has been observed
    #[cfg(test)]
    pub fn sample(&self, name: &str, instance: &str, le: Option<&str>) -> Option<f64> {
        use prometheus::proto::MetricType;

        let family = self
            .registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == name)?;

        let metric = family.get_metric().iter().find(|metric| {
            let labels = metric.get_label();
            let label = |key: &str| {
                labels
                    .iter()
                    .find(|pair| pair.get_name() == key)
                    .map(|pair| pair.get_value())
            };
            label(INSTANCE_LABEL) == Some(instance) && label(BOUND_LABEL) == le
        })?;

        match family.get_field_type() {
            MetricType::COUNTER => Some(metric.get_counter().get_value()),
            MetricType::GAUGE => Some(metric.get_gauge().get_value()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn performance(successes: f64, attempts: f64, min_ns: f64) -> Value {
        json!({
            "performanceMetrics": {
                "writeSuccesses": successes,
                "writeAttempts": attempts,
                "cycleDelay": { "totalNs": 1000, "minNs": min_ns, "maxNs": 900 },
                "writeDuration": { "minNs": 5, "maxNs": 50, "totalNs": 2000 }
            }
        })
    }

    fn histogram(cycle: &[(&str, f64)], write: &[(&str, f64)]) -> HistogramDocument {
        let to_map = |pairs: &[(&str, f64)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<HashMap<_, _>>()
        };
        HistogramDocument {
            timestamp_ns: 0,
            cycle_extension: to_map(cycle),
            write_duration: to_map(write),
        }
    }

    #[test]
    fn test_counters_start_at_baseline() {
        let registry = MetricRegistry::new().unwrap();

        assert_eq!(registry.update_performance("a", &performance(100.0, 120.0, 7.0)).unwrap(), 8);
        assert_eq!(registry.sample("crb_successful_cycle_count", "a", None), Some(0.0));
        assert_eq!(registry.sample("crb_min_cycle_extension_duration", "a", None), Some(7.0));

        registry.update_performance("a", &performance(130.0, 150.0, 3.0)).unwrap();
        assert_eq!(registry.sample("crb_successful_cycle_count", "a", None), Some(30.0));
        assert_eq!(registry.sample("crb_total_cycle_count", "a", None), Some(30.0));
        assert_eq!(registry.sample("crb_min_cycle_extension_duration", "a", None), Some(3.0));
    }

    #[test]
    fn test_counter_reset_never_decreases_export() {
        let registry = MetricRegistry::new().unwrap();

        for successes in [10.0, 25.0, 4.0, 9.0] {
            registry.update_performance("a", &performance(successes, 0.0, 0.0)).unwrap();
        }

        // 15 before the reset, 5 after it
        assert_eq!(registry.sample("crb_successful_cycle_count", "a", None), Some(20.0));
    }

    #[test]
    fn test_missing_section_leaves_state_untouched() {
        let registry = MetricRegistry::new().unwrap();
        registry.update_performance("a", &performance(10.0, 10.0, 1.0)).unwrap();
        registry.update_performance("a", &performance(15.0, 10.0, 1.0)).unwrap();

        let result = registry.update_performance("a", &json!({ "unexpected": true }));
        assert!(matches!(result, Err(RegistryError::MissingSection(_))));
        assert_eq!(registry.sample("crb_successful_cycle_count", "a", None), Some(5.0));
        assert_eq!(registry.sample("crb_min_cycle_extension_duration", "a", None), Some(1.0));
    }

    #[test]
    fn test_absent_fields_are_skipped() {
        let registry = MetricRegistry::new().unwrap();
        let doc = json!({ "performanceMetrics": { "writeSuccesses": 1, "writeAttempts": "n/a" } });

        assert_eq!(registry.update_performance("a", &doc).unwrap(), 1);
        assert_eq!(registry.sample("crb_successful_cycle_count", "a", None), Some(0.0));
        assert_eq!(registry.sample("crb_total_cycle_count", "a", None), None);
    }

    #[test]
    fn test_instances_are_isolated() {
        let registry = MetricRegistry::new().unwrap();
        registry.update_performance("a", &performance(1.0, 1.0, 0.0)).unwrap();
        registry.update_performance("b", &performance(500.0, 500.0, 0.0)).unwrap();
        registry.update_performance("a", &performance(4.0, 4.0, 0.0)).unwrap();

        assert_eq!(registry.sample("crb_successful_cycle_count", "a", None), Some(3.0));
        assert_eq!(registry.sample("crb_successful_cycle_count", "b", None), Some(0.0));
    }

    #[test]
    fn test_histogram_buckets_accumulate() {
        let registry = MetricRegistry::new().unwrap();

        let first = histogram(&[("0-1ms", 3.0), ("1-5ms", 2.0), ("5+ms", 1.0)], &[]);
        assert_eq!(registry.update_histograms("a", &first), 3);
        assert_eq!(registry.sample("cycle_extension_bucket", "a", Some("5")), Some(0.0));

        let second = histogram(&[("0-1ms", 4.0), ("1-5ms", 2.0), ("5+ms", 3.0)], &[("0-1ms", 1.0)]);
        registry.update_histograms("a", &second);

        assert_eq!(registry.sample("cycle_extension_bucket", "a", Some("1")), Some(1.0));
        assert_eq!(registry.sample("cycle_extension_bucket", "a", Some("5")), Some(1.0));
        assert_eq!(
            registry.sample("cycle_extension_bucket", "a", Some("1000000000")),
            Some(3.0)
        );
        // the write histogram was baselined empty, so its first bucket counts in full
        assert_eq!(registry.sample("write_duration_bucket", "a", Some("1")), Some(1.0));
    }

    #[test]
    fn test_late_bucket_keeps_cumulative_order() {
        let registry = MetricRegistry::new().unwrap();

        registry.update_histograms("a", &histogram(&[("0-1ms", 3.0), ("1-5ms", 2.0)], &[]));
        registry.update_histograms(
            "a",
            &histogram(&[("0-1ms", 4.0), ("1-5ms", 2.0), ("5+ms", 1.0)], &[]),
        );

        let le1 = registry.sample("cycle_extension_bucket", "a", Some("1")).unwrap();
        let le5 = registry.sample("cycle_extension_bucket", "a", Some("5")).unwrap();
        let open = registry
            .sample("cycle_extension_bucket", "a", Some("1000000000"))
            .unwrap();

        assert_eq!((le1, le5, open), (1.0, 1.0, 2.0));
        assert!(le1 <= le5 && le5 <= open);

        // a second instance still takes its own baseline
        registry.update_histograms("b", &histogram(&[("0-1ms", 9.0)], &[]));
        assert_eq!(registry.sample("cycle_extension_bucket", "b", Some("1")), Some(0.0));
    }

    #[test]
    fn test_render_exposition() {
        let registry = MetricRegistry::new().unwrap();
        registry.update_performance("plc-1", &performance(1.0, 1.0, 2.0)).unwrap();
        registry.update_histograms("plc-1", &histogram(&[("0.0-1.0ms", 1.0)], &[]));

        let text = registry.render().unwrap();
        assert!(text.contains("# TYPE crb_successful_cycle_count counter"));

        let value_of = |prefix: &str, labels: &[&str]| {
            text.lines()
                .find(|line| line.starts_with(prefix) && labels.iter().all(|l| line.contains(l)))
                .and_then(|line| line.rsplit(' ').next())
                .and_then(|v| v.parse::<f64>().ok())
        };
        assert_eq!(
            value_of("crb_min_cycle_extension_duration{", &["vplc_instance=\"plc-1\""]),
            Some(2.0)
        );
        assert_eq!(
            value_of("cycle_extension_bucket{", &["le=\"1\"", "vplc_instance=\"plc-1\""]),
            Some(0.0)
        );
    }

    #[test]
    fn test_histogram_timestamp() {
        let doc: HistogramDocument =
            serde_json::from_str(r#"{"timestampNs": 1000000000, "cycleDelayHistogram": {"0-1ms": 2}}"#)
                .unwrap();
        assert_eq!(doc.captured_at().map(|t| t.timestamp()), Some(1));
        assert_eq!(doc.cycle_extension.len(), 1);
        assert!(doc.write_duration.is_empty());
        assert!(HistogramDocument::default().captured_at().is_none());
    }
}
