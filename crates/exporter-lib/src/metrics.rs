//! Prometheus exposition for compute-unit metrics
//!
//! Metric names are fixed for downstream dashboard compatibility. Every
//! sample carries `manager`, `hostname`, and `uuid` labels; per-device
//! groups add `device`. Gauge vectors are reset at the start of each
//! scrape so the label set tracks the live unit set exactly.

use crate::collector::{CgroupMetric, StatsFlags};
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, IntCounter, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Histogram buckets for scrape latency (seconds); a busy node walks a few
/// thousand cgroups per pass.
const SCRAPE_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

const UNIT_LABELS: &[&str] = &["manager", "hostname", "uuid"];
const DEVICE_LABELS: &[&str] = &["manager", "hostname", "uuid", "device"];

pub struct ExporterMetrics {
    registry: Registry,
    manager: String,
    hostname: String,

    units: IntGaugeVec,
    cpu_user: GaugeVec,
    cpu_system: GaugeVec,
    cpus: IntGaugeVec,
    cpu_psi: Option<GaugeVec>,

    memory_rss: GaugeVec,
    memory_cache: GaugeVec,
    memory_used: GaugeVec,
    memory_total: GaugeVec,
    memory_fail: IntGaugeVec,
    memory_psi: Option<GaugeVec>,

    memsw_used: Option<GaugeVec>,
    memsw_total: Option<GaugeVec>,
    memsw_fail: Option<IntGaugeVec>,

    blkio_read_bytes: Option<GaugeVec>,
    blkio_write_bytes: Option<GaugeVec>,
    blkio_read_requests: Option<GaugeVec>,
    blkio_write_requests: Option<GaugeVec>,
    blkio_psi: Option<GaugeVec>,

    rdma_handles: IntGaugeVec,
    rdma_objects: IntGaugeVec,

    collect_error: IntGaugeVec,

    scrape_duration: Histogram,
    discovery_errors: IntCounter,
}

impl ExporterMetrics {
    pub fn new(
        manager: impl Into<String>,
        hostname: impl Into<String>,
        flags: StatsFlags,
    ) -> prometheus::Result<Self> {
        let registry = Registry::new();

        let units = int_gauge_vec(
            &registry,
            "compute_units",
            "Number of compute units discovered on the host",
            &["manager", "hostname"],
        )?;
        let cpu_user = gauge_vec(
            &registry,
            "compute_unit_cpu_user_seconds_total",
            "Cumulative CPU user time of the unit in seconds",
            UNIT_LABELS,
        )?;
        let cpu_system = gauge_vec(
            &registry,
            "compute_unit_cpu_system_seconds_total",
            "Cumulative CPU system time of the unit in seconds",
            UNIT_LABELS,
        )?;
        let cpus = int_gauge_vec(
            &registry,
            "compute_unit_cpus",
            "Number of CPUs available to the unit",
            UNIT_LABELS,
        )?;
        let memory_rss = gauge_vec(
            &registry,
            "compute_unit_memory_rss_bytes",
            "Resident memory of the unit in bytes",
            UNIT_LABELS,
        )?;
        let memory_cache = gauge_vec(
            &registry,
            "compute_unit_memory_cache_bytes",
            "Page cache memory of the unit in bytes",
            UNIT_LABELS,
        )?;
        let memory_used = gauge_vec(
            &registry,
            "compute_unit_memory_used_bytes",
            "Memory in use by the unit in bytes",
            UNIT_LABELS,
        )?;
        let memory_total = gauge_vec(
            &registry,
            "compute_unit_memory_total_bytes",
            "Memory limit of the unit in bytes",
            UNIT_LABELS,
        )?;
        let memory_fail = int_gauge_vec(
            &registry,
            "compute_unit_memory_fail_count",
            "Memory failure count of the unit",
            UNIT_LABELS,
        )?;
        let rdma_handles = int_gauge_vec(
            &registry,
            "compute_unit_rdma_hca_handles",
            "Active RDMA HCA handles of the unit",
            DEVICE_LABELS,
        )?;
        let rdma_objects = int_gauge_vec(
            &registry,
            "compute_unit_rdma_hca_objects",
            "Active RDMA HCA objects of the unit",
            DEVICE_LABELS,
        )?;
        let collect_error = int_gauge_vec(
            &registry,
            "compute_collect_error",
            "1 when the unit's stats read partially failed",
            UNIT_LABELS,
        )?;

        let (cpu_psi, memory_psi, blkio_psi) = if flags.psi {
            (
                Some(gauge_vec(
                    &registry,
                    "compute_unit_cpu_psi_seconds",
                    "Total time the unit spent fully stalled on CPU in seconds",
                    UNIT_LABELS,
                )?),
                Some(gauge_vec(
                    &registry,
                    "compute_unit_memory_psi_seconds",
                    "Total time the unit spent fully stalled on memory in seconds",
                    UNIT_LABELS,
                )?),
                Some(gauge_vec(
                    &registry,
                    "compute_unit_blkio_psi_seconds",
                    "Total time the unit spent fully stalled on block IO in seconds",
                    UNIT_LABELS,
                )?),
            )
        } else {
            (None, None, None)
        };

        let (memsw_used, memsw_total, memsw_fail) = if flags.swap {
            (
                Some(gauge_vec(
                    &registry,
                    "compute_unit_memsw_used_bytes",
                    "Swap in use by the unit in bytes",
                    UNIT_LABELS,
                )?),
                Some(gauge_vec(
                    &registry,
                    "compute_unit_memsw_total_bytes",
                    "Swap limit of the unit in bytes",
                    UNIT_LABELS,
                )?),
                Some(int_gauge_vec(
                    &registry,
                    "compute_unit_memsw_fail_count",
                    "Swap failure count of the unit",
                    UNIT_LABELS,
                )?),
            )
        } else {
            (None, None, None)
        };

        let (blkio_read_bytes, blkio_write_bytes, blkio_read_requests, blkio_write_requests) =
            if flags.blkio {
                (
                    Some(gauge_vec(
                        &registry,
                        "compute_unit_blkio_read_total_bytes",
                        "Bytes read by the unit per block device",
                        DEVICE_LABELS,
                    )?),
                    Some(gauge_vec(
                        &registry,
                        "compute_unit_blkio_write_total_bytes",
                        "Bytes written by the unit per block device",
                        DEVICE_LABELS,
                    )?),
                    Some(gauge_vec(
                        &registry,
                        "compute_unit_blkio_read_total_requests",
                        "Read requests issued by the unit per block device",
                        DEVICE_LABELS,
                    )?),
                    Some(gauge_vec(
                        &registry,
                        "compute_unit_blkio_write_total_requests",
                        "Write requests issued by the unit per block device",
                        DEVICE_LABELS,
                    )?),
                )
            } else {
                (None, None, None, None)
            };

        let scrape_duration = Histogram::with_opts(
            HistogramOpts::new(
                "compute_exporter_scrape_duration_seconds",
                "Time spent discovering units and reading their stats",
            )
            .buckets(SCRAPE_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(scrape_duration.clone()))?;

        let discovery_errors = IntCounter::with_opts(Opts::new(
            "compute_exporter_discovery_errors_total",
            "Number of discovery passes that failed outright",
        ))?;
        registry.register(Box::new(discovery_errors.clone()))?;

        Ok(Self {
            registry,
            manager: manager.into(),
            hostname: hostname.into(),
            units,
            cpu_user,
            cpu_system,
            cpus,
            cpu_psi,
            memory_rss,
            memory_cache,
            memory_used,
            memory_total,
            memory_fail,
            memory_psi,
            memsw_used,
            memsw_total,
            memsw_fail,
            blkio_read_bytes,
            blkio_write_bytes,
            blkio_read_requests,
            blkio_write_requests,
            blkio_psi,
            rdma_handles,
            rdma_objects,
            collect_error,
            scrape_duration,
            discovery_errors,
        })
    }

    /// Replace the previous scrape's samples with this scrape's.
    pub fn record(&self, metrics: &[CgroupMetric]) {
        self.reset();

        self.units
            .with_label_values(&[&self.manager, &self.hostname])
            .set(metrics.len() as i64);

        for metric in metrics {
            let labels = [&self.manager, &self.hostname, &metric.uuid];
            let labels: Vec<&str> = labels.iter().map(|s| s.as_str()).collect();

            self.cpu_user
                .with_label_values(&labels)
                .set(metric.cpu_user_secs);
            self.cpu_system
                .with_label_values(&labels)
                .set(metric.cpu_system_secs);
            self.cpus
                .with_label_values(&labels)
                .set(metric.cpus as i64);
            if let Some(vec) = &self.cpu_psi {
                vec.with_label_values(&labels).set(metric.cpu_psi_secs);
            }

            self.memory_rss
                .with_label_values(&labels)
                .set(metric.memory_rss_bytes as f64);
            self.memory_cache
                .with_label_values(&labels)
                .set(metric.memory_cache_bytes as f64);
            self.memory_used
                .with_label_values(&labels)
                .set(metric.memory_used_bytes as f64);
            self.memory_total
                .with_label_values(&labels)
                .set(metric.memory_total_bytes as f64);
            self.memory_fail
                .with_label_values(&labels)
                .set(metric.memory_fail_count as i64);
            if let Some(vec) = &self.memory_psi {
                vec.with_label_values(&labels).set(metric.memory_psi_secs);
            }

            if let Some(vec) = &self.memsw_used {
                vec.with_label_values(&labels)
                    .set(metric.memsw_used_bytes as f64);
            }
            if let Some(vec) = &self.memsw_total {
                vec.with_label_values(&labels)
                    .set(metric.memsw_total_bytes as f64);
            }
            if let Some(vec) = &self.memsw_fail {
                vec.with_label_values(&labels)
                    .set(metric.memsw_fail_count as i64);
            }

            for (device, stat) in &metric.blkio {
                let device_labels = [&self.manager, &self.hostname, &metric.uuid, device];
                let device_labels: Vec<&str> =
                    device_labels.iter().map(|s| s.as_str()).collect();
                if let Some(vec) = &self.blkio_read_bytes {
                    vec.with_label_values(&device_labels)
                        .set(stat.read_bytes as f64);
                }
                if let Some(vec) = &self.blkio_write_bytes {
                    vec.with_label_values(&device_labels)
                        .set(stat.write_bytes as f64);
                }
                if let Some(vec) = &self.blkio_read_requests {
                    vec.with_label_values(&device_labels)
                        .set(stat.read_requests as f64);
                }
                if let Some(vec) = &self.blkio_write_requests {
                    vec.with_label_values(&device_labels)
                        .set(stat.write_requests as f64);
                }
            }
            if let Some(vec) = &self.blkio_psi {
                vec.with_label_values(&labels).set(metric.blkio_psi_secs);
            }

            for (device, stat) in &metric.rdma {
                let device_labels = [&self.manager, &self.hostname, &metric.uuid, device];
                let device_labels: Vec<&str> =
                    device_labels.iter().map(|s| s.as_str()).collect();
                self.rdma_handles
                    .with_label_values(&device_labels)
                    .set(stat.hca_handles as i64);
                self.rdma_objects
                    .with_label_values(&device_labels)
                    .set(stat.hca_objects as i64);
            }

            self.collect_error
                .with_label_values(&labels)
                .set(if metric.err { 1 } else { 0 });
        }
    }

    fn reset(&self) {
        self.units.reset();
        self.cpu_user.reset();
        self.cpu_system.reset();
        self.cpus.reset();
        self.memory_rss.reset();
        self.memory_cache.reset();
        self.memory_used.reset();
        self.memory_total.reset();
        self.memory_fail.reset();
        self.rdma_handles.reset();
        self.rdma_objects.reset();
        self.collect_error.reset();
        for vec in [
            &self.cpu_psi,
            &self.memory_psi,
            &self.blkio_psi,
            &self.memsw_used,
            &self.memsw_total,
            &self.blkio_read_bytes,
            &self.blkio_write_bytes,
            &self.blkio_read_requests,
            &self.blkio_write_requests,
        ]
        .into_iter()
        .flatten()
        {
            vec.reset();
        }
        if let Some(vec) = &self.memsw_fail {
            vec.reset();
        }
    }

    pub fn observe_scrape_duration(&self, seconds: f64) {
        self.scrape_duration.observe(seconds);
    }

    pub fn inc_discovery_errors(&self) {
        self.discovery_errors.inc();
    }

    /// Encode the registry in the text exposition format.
    pub fn encode(&self) -> prometheus::Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

fn gauge_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<GaugeVec> {
    let vec = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

fn int_gauge_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<IntGaugeVec> {
    let vec = IntGaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{BlkioDevice, RdmaDevice};

    fn sample_metric(uuid: &str) -> CgroupMetric {
        let mut metric = CgroupMetric::new(format!("/sys/fs/cgroup/job_{uuid}"), uuid);
        metric.cpu_user_secs = 3.0;
        metric.cpu_system_secs = 2.0;
        metric.cpu_total_secs = 5.0;
        metric.cpus = 4;
        metric.memory_used_bytes = 1048576;
        metric.memory_total_bytes = 2097152;
        metric.blkio.insert(
            "sda".to_string(),
            BlkioDevice {
                read_bytes: 100,
                write_bytes: 200,
                read_requests: 3,
                write_requests: 4,
            },
        );
        metric.rdma.insert(
            "mlx5_0".to_string(),
            RdmaDevice {
                hca_handles: 2,
                hca_objects: 2000,
            },
        );
        metric
    }

    #[test]
    fn test_exposition_contains_fixed_names() {
        let metrics = ExporterMetrics::new("slurm", "node0", StatsFlags::default()).unwrap();
        metrics.record(&[sample_metric("42")]);

        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains("compute_units{hostname=\"node0\",manager=\"slurm\"} 1"));
        assert!(text.contains(
            "compute_unit_cpu_user_seconds_total{hostname=\"node0\",manager=\"slurm\",uuid=\"42\"} 3"
        ));
        assert!(text.contains("compute_unit_cpus{hostname=\"node0\",manager=\"slurm\",uuid=\"42\"} 4"));
        assert!(text.contains(
            "compute_unit_blkio_read_total_bytes{device=\"sda\",hostname=\"node0\",manager=\"slurm\",uuid=\"42\"} 100"
        ));
        assert!(text.contains(
            "compute_unit_rdma_hca_objects{device=\"mlx5_0\",hostname=\"node0\",manager=\"slurm\",uuid=\"42\"} 2000"
        ));
        assert!(text.contains(
            "compute_collect_error{hostname=\"node0\",manager=\"slurm\",uuid=\"42\"} 0"
        ));
    }

    #[test]
    fn test_collect_error_flag() {
        let metrics = ExporterMetrics::new("slurm", "node0", StatsFlags::default()).unwrap();
        let mut bad = sample_metric("9");
        bad.err = true;
        metrics.record(&[bad]);

        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains(
            "compute_collect_error{hostname=\"node0\",manager=\"slurm\",uuid=\"9\"} 1"
        ));
    }

    #[test]
    fn test_disabled_groups_are_not_registered() {
        let flags = StatsFlags {
            swap: false,
            blkio: false,
            psi: false,
        };
        let metrics = ExporterMetrics::new("slurm", "node0", flags).unwrap();
        metrics.record(&[sample_metric("42")]);

        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(!text.contains("compute_unit_memsw_used_bytes"));
        assert!(!text.contains("compute_unit_blkio_read_total_bytes"));
        assert!(!text.contains("compute_unit_cpu_psi_seconds"));
        // Core groups are unaffected.
        assert!(text.contains("compute_unit_memory_used_bytes"));
    }

    #[test]
    fn test_stale_units_dropped_between_scrapes() {
        let metrics = ExporterMetrics::new("slurm", "node0", StatsFlags::default()).unwrap();
        metrics.record(&[sample_metric("42"), sample_metric("43")]);
        metrics.record(&[sample_metric("43")]);

        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(!text.contains("uuid=\"42\""));
        assert!(text.contains("uuid=\"43\""));
    }

    #[test]
    fn test_identical_label_sets_across_unchanged_scrapes() {
        let metrics = ExporterMetrics::new("slurm", "node0", StatsFlags::default()).unwrap();
        metrics.record(&[sample_metric("42")]);
        let first = String::from_utf8(metrics.encode().unwrap()).unwrap();
        metrics.record(&[sample_metric("42")]);
        let second = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert_eq!(first, second);
    }
}
