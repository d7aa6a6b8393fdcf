use crate::Result;
use prometheus::{
    core::{AtomicI64, AtomicU64, GenericCounter, GenericGauge},
    histogram_opts, opts, Encoder, Histogram, HistogramVec, IntCounterVec, IntGaugeVec, Registry,
    TextEncoder,
};

pub const NAMESPACE: &str = "calsync";

/// Container for sync metrics.
#[derive(Clone)]
pub struct SyncMetrics {
    events_total: IntCounterVec,
    latest_sync_timestamp_seconds: IntGaugeVec,
    sync_duration_seconds: HistogramVec,
    syncs_total: IntCounterVec,
    active_configurations: GenericGauge<AtomicI64>,
}

impl SyncMetrics {
    /// Creates new SyncMetrics.
    pub fn new() -> Result<SyncMetrics> {
        let events_total = IntCounterVec::new(
            opts!(
                "events_total",
                "Total number of source events handled, by outcome"
            )
            .namespace(NAMESPACE),
            &["outcome"],
        )?;

        let latest_sync_timestamp_seconds = IntGaugeVec::new(
            opts!(
                "latest_sync_timestamp_seconds",
                "UNIX timestamp seconds of the latest configuration sync"
            )
            .namespace(NAMESPACE),
            &["status"],
        )?;

        let sync_duration_seconds = HistogramVec::new(
            histogram_opts!(
                "sync_duration_seconds",
                "Duration of a configuration sync in seconds"
            )
            .namespace(NAMESPACE),
            &["status"],
        )?;

        let syncs_total = IntCounterVec::new(
            opts!(
                "syncs_total",
                "Total number of configuration syncs performed"
            )
            .namespace(NAMESPACE),
            &["status"],
        )?;

        let active_configurations = GenericGauge::with_opts(
            opts!(
                "active_configurations",
                "Number of active sync configurations seen by the latest batch"
            )
            .namespace(NAMESPACE),
        )?;

        Ok(SyncMetrics {
            events_total,
            latest_sync_timestamp_seconds,
            sync_duration_seconds,
            syncs_total,
            active_configurations,
        })
    }

    /// Registers the metrics in a prometheus registry.
    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.events_total.clone()))?;
        registry.register(Box::new(self.latest_sync_timestamp_seconds.clone()))?;
        registry.register(Box::new(self.sync_duration_seconds.clone()))?;
        registry.register(Box::new(self.syncs_total.clone()))?;
        registry.register(Box::new(self.active_configurations.clone()))?;
        Ok(())
    }

    /// Provides access to the handled events counter.
    pub fn events_total(&self, outcome: EventOutcome) -> GenericCounter<AtomicU64> {
        self.events_total.with_label_values(&[outcome.as_str()])
    }

    /// Provides access to the latest sync UNIX timestamp gauge.
    pub fn latest_sync_timestamp_seconds(&self, status: SyncStatus) -> GenericGauge<AtomicI64> {
        self.latest_sync_timestamp_seconds
            .with_label_values(&[status.as_str()])
    }

    /// Provides access to the sync duration seconds histogram.
    pub fn sync_duration_seconds(&self, status: SyncStatus) -> Histogram {
        self.sync_duration_seconds
            .with_label_values(&[status.as_str()])
    }

    /// Provides access to the syncs counter.
    pub fn syncs_total(&self, status: SyncStatus) -> GenericCounter<AtomicU64> {
        self.syncs_total.with_label_values(&[status.as_str()])
    }

    pub fn active_configurations(&self) -> GenericGauge<AtomicI64> {
        self.active_configurations.clone()
    }
}

/// Renders all metrics of a registry in the prometheus text exposition format.
pub fn render(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Status of a configuration sync.
#[derive(Debug, Copy, Clone)]
pub enum SyncStatus {
    /// Sync was successful.
    Success,
    /// An error occurred while syncing.
    Error,
}

impl SyncStatus {
    /// Returns the status as a &str.
    pub fn as_str(&self) -> &str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
        }
    }
}

/// What happened to a source event during reconciliation.
#[derive(Debug, Copy, Clone)]
pub enum EventOutcome {
    /// A mirror was created.
    Created,
    /// The event already had a mirror.
    Existing,
    /// The event is one of our own mirrors.
    Echo,
    /// A mirror was created but another run had already recorded one.
    Duplicate,
}

impl EventOutcome {
    pub fn as_str(&self) -> &str {
        match self {
            EventOutcome::Created => "created",
            EventOutcome::Existing => "existing",
            EventOutcome::Echo => "echo",
            EventOutcome::Duplicate => "duplicate",
        }
    }
}
