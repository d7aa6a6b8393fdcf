//! The sync engine mirrors busy time between the two calendars of every active configuration.

use crate::identity::CalendarType;
use crate::metrics::{EventOutcome, SyncMetrics, SyncStatus};
use crate::provider::{NewEvent, Providers, Window};
use crate::store::{NewMirror, RunStatus, Store, SyncConfiguration, SyncCounts, SyncDirection};
use crate::{AppConfig, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Engine settings taken from the application configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Length of the sync window starting now.
    pub max_sync_range_days: u32,
    /// Prepended to the subject of every mirror event.
    pub subject_prefix: String,
}

impl SyncSettings {
    pub fn from_config(config: &AppConfig) -> SyncSettings {
        SyncSettings {
            max_sync_range_days: config.max_sync_range_days,
            subject_prefix: config.sync_subject_prefix.clone(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            max_sync_range_days: 30,
            subject_prefix: "[SYNC] ".to_owned(),
        }
    }
}

/// Outcome of a `sync_all` batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct SyncEngine {
    store: Store,
    providers: Providers,
    settings: Arc<SyncSettings>,
    metrics: SyncMetrics,
}

impl SyncEngine {
    pub fn new(store: Store, providers: Providers, settings: SyncSettings) -> Result<SyncEngine> {
        Ok(SyncEngine {
            store,
            providers,
            settings: Arc::new(settings),
            metrics: SyncMetrics::new()?,
        })
    }

    /// Replaces the engine's metrics, e.g. with ones already registered for `/metrics`.
    pub fn with_metrics(mut self, metrics: SyncMetrics) -> SyncEngine {
        self.metrics = metrics;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The window `[now, now + max_sync_range_days)`.
    pub fn window_at(&self, now: DateTime<Utc>) -> Window {
        now..now + TimeDelta::days(i64::from(self.settings.max_sync_range_days))
    }

    /// Syncs every active configuration in sequence.
    ///
    /// Failures of a single configuration are logged and recorded in its run log. Persistence
    /// failures abort the batch.
    pub async fn sync_all(&self) -> Result<SyncSummary> {
        log::info!("starting sync of all active configurations");

        let configurations = self.store.configurations.active().await?;
        self.metrics
            .active_configurations()
            .set(configurations.len() as i64);

        let mut summary = SyncSummary::default();

        for configuration in &configurations {
            match self.sync_configuration(configuration).await {
                Ok(_) => summary.succeeded += 1,
                Err(err) if err.is_fatal() => {
                    log::error!(
                        "aborting sync batch at configuration {}: {err}",
                        configuration.id
                    );
                    return Err(err);
                }
                Err(err) => {
                    log::error!("sync failed for configuration {}: {err}", configuration.id);
                    summary.failed += 1;
                }
            }
        }

        log::info!(
            "sync of {} configurations completed: {} succeeded, {} failed",
            configurations.len(),
            summary.succeeded,
            summary.failed
        );

        Ok(summary)
    }

    /// Runs one sync of a configuration and records it in the run log.
    ///
    /// On failure the run is closed as `error` with zero counts and the error is returned.
    pub async fn sync_configuration(&self, configuration: &SyncConfiguration) -> Result<SyncCounts> {
        log::info!(
            "starting sync for configuration {}: {} -> {} ({})",
            configuration.id,
            configuration.source_email,
            configuration.target_email,
            configuration.sync_direction
        );

        let started = Instant::now();
        let run_id = self.store.runs.open(configuration.id).await?;
        let window = self.window_at(Utc::now());

        let mut counts = SyncCounts::default();
        let result = match self.run_passes(configuration, &window, &mut counts).await {
            Ok(()) => {
                self.store
                    .configurations
                    .touch_last_sync(configuration.id, Utc::now())
                    .await
            }
            Err(err) => Err(err),
        };

        let status = if result.is_ok() {
            SyncStatus::Success
        } else {
            SyncStatus::Error
        };
        self.metrics
            .sync_duration_seconds(status)
            .observe(started.elapsed().as_secs_f64());
        self.metrics.syncs_total(status).inc();
        self.metrics
            .latest_sync_timestamp_seconds(status)
            .set(Utc::now().timestamp());

        match result {
            Ok(()) => {
                self.store
                    .runs
                    .close(run_id, RunStatus::Success, &counts, None)
                    .await?;

                log::info!(
                    "sync completed for configuration {}: {counts}",
                    configuration.id
                );

                Ok(counts)
            }
            Err(err) => {
                log::error!(
                    "sync error for configuration {} after {counts}: {err}",
                    configuration.id
                );

                self.store
                    .runs
                    .close(
                        run_id,
                        RunStatus::Error,
                        &SyncCounts::default(),
                        Some(&err.to_string()),
                    )
                    .await?;

                Err(err)
            }
        }
    }

    async fn run_passes(
        &self,
        configuration: &SyncConfiguration,
        window: &Window,
        counts: &mut SyncCounts,
    ) -> Result<()> {
        let source_type = classify(
            configuration.id,
            &configuration.source_email,
            configuration.source_type,
        );
        let target_type = classify(
            configuration.id,
            &configuration.target_email,
            configuration.target_type,
        );

        // Both adapters must be available before any provider is called.
        self.providers.get(source_type)?;
        self.providers.get(target_type)?;

        for &pass in configuration.sync_direction.passes() {
            *counts += self
                .reconcile(configuration, pass, window, source_type, target_type)
                .await?;
        }

        Ok(())
    }

    /// Mirrors the events of one side of a configuration onto the other side.
    ///
    /// Every event found on the scanned side is counted as processed. Events that already have a
    /// ledger row count as updated; their changes are not propagated. All other events get a busy
    /// mirror on the opposite side and a ledger row. Our own mirrors are skipped without being
    /// counted. A bidirectional `direction` runs both one-way passes.
    pub async fn reconcile(
        &self,
        configuration: &SyncConfiguration,
        direction: SyncDirection,
        window: &Window,
        source_type: CalendarType,
        target_type: CalendarType,
    ) -> Result<SyncCounts> {
        let mut counts = SyncCounts::default();

        for &pass in direction.passes() {
            let (from, from_type, to, to_type) = match pass {
                SyncDirection::TargetToSource => (
                    &configuration.target_email,
                    target_type,
                    &configuration.source_email,
                    source_type,
                ),
                _ => (
                    &configuration.source_email,
                    source_type,
                    &configuration.target_email,
                    target_type,
                ),
            };

            let origin = self.providers.get(from_type)?;
            let destination = self.providers.get(to_type)?;

            log::info!("syncing from {from} ({from_type}) to {to} ({to_type})");

            let events = origin.list_events(from, window).await?;

            for event in &events {
                if self.store.ledger.is_mirror(&event.id, configuration.id).await? {
                    log::debug!("skipping {event}, it is a mirror of configuration {}", configuration.id);
                    self.metrics.events_total(EventOutcome::Echo).inc();
                    continue;
                }

                counts.processed += 1;

                if let Some(mirror) = self
                    .store
                    .ledger
                    .find(&event.id, configuration.id, pass)
                    .await?
                {
                    log::info!(
                        "would update mirror {} of {event} in {to}, updates are not propagated",
                        mirror.mirror_event_id
                    );
                    counts.updated += 1;
                    counts.updates_skipped += 1;
                    self.metrics.events_total(EventOutcome::Existing).inc();
                    continue;
                }

                let new_event = NewEvent {
                    subject: format!("{}{}", self.settings.subject_prefix, event.subject),
                    start: event.start,
                    end: event.end,
                    all_day: event.all_day,
                };

                let mirror_id = destination.create_event(to, &new_event).await?;

                let recorded = self
                    .store
                    .ledger
                    .record(&NewMirror {
                        sync_config_id: configuration.id,
                        origin_event_id: &event.id,
                        mirror_event_id: &mirror_id,
                        subject: &event.subject,
                        start_time: event.start,
                        end_time: event.end,
                        is_all_day: event.all_day,
                        show_as: event.busy_state.as_str(),
                        source_email: from,
                        target_email: to,
                        sync_direction: pass,
                    })
                    .await?;

                counts.created += 1;

                if recorded {
                    log::debug!("mirrored {event} to {to} as {mirror_id}");
                    self.metrics.events_total(EventOutcome::Created).inc();
                } else {
                    log::warn!(
                        "{event} was mirrored concurrently, mirror {mirror_id} in {to} is a duplicate"
                    );
                    self.metrics.events_total(EventOutcome::Duplicate).inc();
                }
            }
        }

        Ok(counts)
    }

    /// Periodically syncs all configurations every `period` until a message is received via
    /// `stop`.
    async fn start_sync(&self, period: Duration, mut stop: Receiver<()>) {
        log::info!("synchronizing calendars every {:?}", period);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.sync_all().await {
                        log::error!("failed to sync calendars: {err}");
                    }
                }
                _ = &mut stop => {
                    log::info!("stopping calendar sync");
                    return;
                }
            }
        }
    }

    /// Starts a background task running `sync_all` every `period`. Returns a `SyncTaskHandle` to
    /// stop it.
    pub fn spawn_sync_task(&self, period: Duration) -> SyncTaskHandle {
        let engine = self.clone();
        let (stop_tx, stop_rx) = oneshot::channel();

        let join_handle = tokio::spawn(async move {
            engine.start_sync(period, stop_rx).await;
        });

        SyncTaskHandle {
            join_handle,
            stop_tx,
        }
    }
}

/// Classifies an endpoint, warning if the stored type disagrees.
fn classify(configuration_id: i64, identity: &str, stored: CalendarType) -> CalendarType {
    let kind = CalendarType::classify(identity);

    if kind != stored {
        log::warn!(
            "configuration {configuration_id}: {identity} is stored as {stored} but is a {kind} calendar"
        );
    }

    kind
}

/// A handle for stopping a sync task.
pub struct SyncTaskHandle {
    join_handle: JoinHandle<()>,
    stop_tx: Sender<()>,
}

impl SyncTaskHandle {
    /// Stops the sync task. Waits for a running batch to finish.
    pub async fn stop(self) -> io::Result<()> {
        if self.stop_tx.send(()).is_ok() {
            self.join_handle.await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{BusyState, CalendarEvent, CalendarProvider, EventPage, ProviderError};
    use crate::store::NewConfiguration;
    use crate::Error;
    use prometheus::Registry;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// An in-memory calendar service. Created events show up in later listings.
    struct FakeCalendar {
        kind: CalendarType,
        events: Mutex<HashMap<String, Vec<CalendarEvent>>>,
        created: Mutex<Vec<(String, NewEvent)>>,
        failing: Mutex<HashSet<String>>,
        list_calls: AtomicUsize,
    }

    impl FakeCalendar {
        fn new(kind: CalendarType) -> Arc<FakeCalendar> {
            Arc::new(FakeCalendar {
                kind,
                events: Mutex::new(HashMap::new()),
                created: Mutex::new(Vec::new()),
                failing: Mutex::new(HashSet::new()),
                list_calls: AtomicUsize::new(0),
            })
        }

        fn add(&self, identity: &str, id: &str, subject: &str) {
            let start = Utc::now() + TimeDelta::days(1);
            self.events
                .lock()
                .unwrap()
                .entry(identity.to_owned())
                .or_default()
                .push(CalendarEvent {
                    id: id.to_owned(),
                    subject: subject.to_owned(),
                    start,
                    end: start + TimeDelta::minutes(30),
                    all_day: false,
                    busy_state: BusyState::Busy,
                });
        }

        fn fail(&self, identity: &str) {
            self.failing.lock().unwrap().insert(identity.to_owned());
        }

        fn created(&self) -> Vec<(String, NewEvent)> {
            self.created.lock().unwrap().clone()
        }

        fn list_calls(&self) -> usize {
            self.list_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CalendarProvider for FakeCalendar {
        fn kind(&self) -> CalendarType {
            self.kind
        }

        async fn list_events_page(
            &self,
            identity: &str,
            _window: &Window,
            _page_token: Option<&str>,
        ) -> Result<EventPage, ProviderError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);

            if self.failing.lock().unwrap().contains(identity) {
                return Err(ProviderError::Api {
                    provider: self.kind,
                    status: 503,
                    message: "service unavailable".into(),
                });
            }

            let events = self
                .events
                .lock()
                .unwrap()
                .get(identity)
                .cloned()
                .unwrap_or_default();

            Ok(EventPage {
                events,
                next_page_token: None,
            })
        }

        async fn create_event(
            &self,
            identity: &str,
            event: &NewEvent,
        ) -> Result<String, ProviderError> {
            let mut created = self.created.lock().unwrap();
            created.push((identity.to_owned(), event.clone()));
            let id = format!("{}-mirror-{}", self.kind, created.len());

            self.events
                .lock()
                .unwrap()
                .entry(identity.to_owned())
                .or_default()
                .push(CalendarEvent {
                    id: id.clone(),
                    subject: event.subject.clone(),
                    start: event.start,
                    end: event.end,
                    all_day: event.all_day,
                    busy_state: BusyState::Busy,
                });

            Ok(id)
        }

        async fn delete_event(&self, _identity: &str, _event_id: &str) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    struct Fixture {
        engine: SyncEngine,
        microsoft: Arc<FakeCalendar>,
        google: Arc<FakeCalendar>,
        user_id: i64,
    }

    impl Fixture {
        async fn new() -> Fixture {
            Fixture::with_providers(true).await
        }

        async fn with_providers(google_available: bool) -> Fixture {
            let store = Store::open_in_memory().await.unwrap();
            let user = store.users.add("a@company.com", "A").await.unwrap();

            let microsoft = FakeCalendar::new(CalendarType::Microsoft);
            let google = FakeCalendar::new(CalendarType::Google);

            let mut providers = Providers::new().with(microsoft.clone());
            if google_available {
                providers = providers.with(google.clone());
            }

            let engine = SyncEngine::new(store, providers, SyncSettings::default()).unwrap();

            Fixture {
                engine,
                microsoft,
                google,
                user_id: user.id,
            }
        }

        async fn configuration(
            &self,
            source: &str,
            target: &str,
            direction: SyncDirection,
        ) -> SyncConfiguration {
            self.engine
                .store()
                .configurations
                .add(&NewConfiguration::new(
                    self.user_id,
                    source,
                    target,
                    direction,
                ))
                .await
                .unwrap()
        }

        async fn runs(&self, configuration: &SyncConfiguration) -> Vec<crate::store::SyncRun> {
            self.engine
                .store()
                .runs
                .for_configuration(configuration.id)
                .await
                .unwrap()
        }
    }

    const MICROSOFT: &str = "a@company.com";
    const GOOGLE: &str = "team@gmail.com";

    #[actix_rt::test]
    async fn mirrors_new_event_to_target() {
        let fixture = Fixture::new().await;
        fixture.microsoft.add(MICROSOFT, "evt1", "Standup");
        let configuration = fixture
            .configuration(MICROSOFT, GOOGLE, SyncDirection::SourceToTarget)
            .await;

        let counts = fixture
            .engine
            .sync_configuration(&configuration)
            .await
            .unwrap();

        assert_eq!(
            counts,
            SyncCounts {
                processed: 1,
                created: 1,
                ..SyncCounts::default()
            }
        );

        let created = fixture.google.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, GOOGLE);
        assert_eq!(created[0].1.subject, "[SYNC] Standup");

        let ledger_row = fixture
            .engine
            .store()
            .ledger
            .find("evt1", configuration.id, SyncDirection::SourceToTarget)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ledger_row.mirror_event_id, "google-mirror-1");
        assert_eq!(ledger_row.subject, "Standup");
        assert_eq!(ledger_row.source_email, MICROSOFT);
        assert_eq!(ledger_row.target_email, GOOGLE);

        let runs = fixture.runs(&configuration).await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].counts, counts);
        assert!(runs[0].completed_at.is_some());

        let configuration = fixture
            .engine
            .store()
            .configurations
            .get(configuration.id)
            .await
            .unwrap()
            .unwrap();
        assert!(configuration.last_sync_at.is_some());
    }

    #[actix_rt::test]
    async fn second_run_does_not_duplicate() {
        let fixture = Fixture::new().await;
        fixture.microsoft.add(MICROSOFT, "evt1", "Standup");
        let configuration = fixture
            .configuration(MICROSOFT, GOOGLE, SyncDirection::SourceToTarget)
            .await;

        fixture
            .engine
            .sync_configuration(&configuration)
            .await
            .unwrap();
        let counts = fixture
            .engine
            .sync_configuration(&configuration)
            .await
            .unwrap();

        assert_eq!(
            counts,
            SyncCounts {
                processed: 1,
                created: 0,
                updated: 1,
                deleted: 0,
                updates_skipped: 1,
            }
        );
        assert_eq!(fixture.google.created().len(), 1);
        assert_eq!(
            fixture
                .engine
                .store()
                .ledger
                .count(configuration.id)
                .await
                .unwrap(),
            1
        );
    }

    #[actix_rt::test]
    async fn processed_is_created_plus_updated() {
        let fixture = Fixture::new().await;
        fixture.microsoft.add(MICROSOFT, "evt1", "Standup");
        fixture.microsoft.add(MICROSOFT, "evt2", "Review");
        let configuration = fixture
            .configuration(MICROSOFT, GOOGLE, SyncDirection::SourceToTarget)
            .await;

        fixture
            .engine
            .sync_configuration(&configuration)
            .await
            .unwrap();
        fixture.microsoft.add(MICROSOFT, "evt3", "Planning");

        let counts = fixture
            .engine
            .sync_configuration(&configuration)
            .await
            .unwrap();

        assert_eq!(counts.processed, 3);
        assert_eq!(counts.created, 1);
        assert_eq!(counts.updated, 2);
        assert_eq!(counts.processed, counts.created + counts.updated);
        assert_eq!(counts.deleted, 0);
    }

    #[actix_rt::test]
    async fn unavailable_target_fails_run_without_provider_calls() {
        let fixture = Fixture::with_providers(false).await;
        fixture.microsoft.add(MICROSOFT, "evt1", "Standup");
        let configuration = fixture
            .configuration(MICROSOFT, GOOGLE, SyncDirection::SourceToTarget)
            .await;

        let err = fixture
            .engine
            .sync_configuration(&configuration)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::ProviderUnavailable(CalendarType::Google)
        ));
        assert_eq!(fixture.microsoft.list_calls(), 0);

        let runs = fixture.runs(&configuration).await;
        assert_eq!(runs[0].status, RunStatus::Error);
        assert_eq!(runs[0].counts, SyncCounts::default());
        assert_eq!(
            runs[0].error_message.as_deref(),
            Some("no google calendar provider is configured")
        );
    }

    #[actix_rt::test]
    async fn sync_all_continues_after_unavailable_provider() {
        let fixture = Fixture::with_providers(false).await;
        fixture.microsoft.add(MICROSOFT, "evt1", "Standup");
        let broken = fixture
            .configuration(MICROSOFT, GOOGLE, SyncDirection::SourceToTarget)
            .await;
        let working = fixture
            .configuration(MICROSOFT, "b@company.com", SyncDirection::SourceToTarget)
            .await;

        let summary = fixture.engine.sync_all().await.unwrap();

        assert_eq!(
            summary,
            SyncSummary {
                succeeded: 1,
                failed: 1
            }
        );
        assert_eq!(fixture.runs(&broken).await[0].status, RunStatus::Error);
        assert_eq!(fixture.runs(&working).await[0].status, RunStatus::Success);
        assert_eq!(fixture.microsoft.created().len(), 1);
        assert_eq!(fixture.microsoft.created()[0].0, "b@company.com");
    }

    #[actix_rt::test]
    async fn sync_all_records_failing_configuration_with_zero_counts() {
        let fixture = Fixture::new().await;
        fixture.microsoft.add(MICROSOFT, "evt1", "Standup");
        fixture.microsoft.fail("broken@company.com");

        let failing = fixture
            .configuration("broken@company.com", GOOGLE, SyncDirection::SourceToTarget)
            .await;
        let healthy = fixture
            .configuration(MICROSOFT, GOOGLE, SyncDirection::SourceToTarget)
            .await;

        let summary = fixture.engine.sync_all().await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);

        let failed_runs = fixture.runs(&failing).await;
        assert_eq!(failed_runs.len(), 1);
        assert_eq!(failed_runs[0].status, RunStatus::Error);
        assert_eq!(failed_runs[0].counts, SyncCounts::default());
        assert!(failed_runs[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("503"));

        let healthy_runs = fixture.runs(&healthy).await;
        assert_eq!(healthy_runs[0].status, RunStatus::Success);
        assert_eq!(healthy_runs[0].counts.created, 1);
    }

    #[actix_rt::test]
    async fn bidirectional_sync_skips_own_mirrors() {
        let fixture = Fixture::new().await;
        fixture.microsoft.add(MICROSOFT, "ms1", "Standup");
        fixture.google.add("primary", "g1", "Dentist");
        let configuration = fixture
            .configuration(MICROSOFT, "primary", SyncDirection::Bidirectional)
            .await;

        let first = fixture
            .engine
            .sync_configuration(&configuration)
            .await
            .unwrap();

        // The mirror of ms1 shows up in the second pass and is not mirrored back.
        assert_eq!(
            first,
            SyncCounts {
                processed: 2,
                created: 2,
                ..SyncCounts::default()
            }
        );
        assert_eq!(fixture.google.created()[0].1.subject, "[SYNC] Standup");
        assert_eq!(fixture.microsoft.created()[0].1.subject, "[SYNC] Dentist");

        let second = fixture
            .engine
            .sync_configuration(&configuration)
            .await
            .unwrap();

        assert_eq!(
            second,
            SyncCounts {
                processed: 2,
                updated: 2,
                updates_skipped: 2,
                ..SyncCounts::default()
            }
        );
        assert_eq!(fixture.google.created().len(), 1);
        assert_eq!(fixture.microsoft.created().len(), 1);
    }

    #[actix_rt::test]
    async fn failed_second_pass_records_zero_counts() {
        let fixture = Fixture::new().await;
        fixture.microsoft.add(MICROSOFT, "ms1", "Standup");
        fixture.google.fail("primary");
        let configuration = fixture
            .configuration(MICROSOFT, "primary", SyncDirection::Bidirectional)
            .await;

        let err = fixture
            .engine
            .sync_configuration(&configuration)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(ProviderError::Api { .. })));

        // The first pass completed before listing the target failed.
        assert_eq!(fixture.google.created().len(), 1);

        let runs = fixture.runs(&configuration).await;
        assert_eq!(runs[0].status, RunStatus::Error);
        assert_eq!(runs[0].counts, SyncCounts::default());
    }

    #[actix_rt::test]
    async fn target_to_source_mirrors_onto_source() {
        let fixture = Fixture::new().await;
        fixture.google.add(GOOGLE, "g1", "Dentist");
        fixture.microsoft.add(MICROSOFT, "ms1", "Standup");
        let configuration = fixture
            .configuration(MICROSOFT, GOOGLE, SyncDirection::TargetToSource)
            .await;

        let counts = fixture
            .engine
            .sync_configuration(&configuration)
            .await
            .unwrap();

        assert_eq!(
            counts,
            SyncCounts {
                processed: 1,
                created: 1,
                ..SyncCounts::default()
            }
        );
        assert!(fixture.google.created().is_empty());

        let created = fixture.microsoft.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, MICROSOFT);
        assert_eq!(created[0].1.subject, "[SYNC] Dentist");

        let ledger = &fixture.engine.store().ledger;
        let row = ledger
            .find("g1", configuration.id, SyncDirection::TargetToSource)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.mirror_event_id, "microsoft-mirror-1");
        assert_eq!(row.source_email, GOOGLE);
        assert_eq!(row.target_email, MICROSOFT);
        assert_eq!(row.sync_direction, SyncDirection::TargetToSource);
        assert!(ledger
            .find("g1", configuration.id, SyncDirection::SourceToTarget)
            .await
            .unwrap()
            .is_none());

        let second = fixture
            .engine
            .sync_configuration(&configuration)
            .await
            .unwrap();

        assert_eq!(
            second,
            SyncCounts {
                processed: 1,
                updated: 1,
                updates_skipped: 1,
                ..SyncCounts::default()
            }
        );
        assert_eq!(fixture.microsoft.created().len(), 1);
        assert_eq!(ledger.count(configuration.id).await.unwrap(), 1);
    }

    /// Records a ledger row for `evt1` while its mirror is being created, like a second process
    /// syncing the same configuration.
    struct RacingCalendar {
        inner: Arc<FakeCalendar>,
        store: Store,
        configuration_id: i64,
    }

    #[async_trait]
    impl CalendarProvider for RacingCalendar {
        fn kind(&self) -> CalendarType {
            self.inner.kind()
        }

        async fn list_events_page(
            &self,
            identity: &str,
            window: &Window,
            page_token: Option<&str>,
        ) -> Result<EventPage, ProviderError> {
            self.inner
                .list_events_page(identity, window, page_token)
                .await
        }

        async fn create_event(
            &self,
            identity: &str,
            event: &NewEvent,
        ) -> Result<String, ProviderError> {
            let id = self.inner.create_event(identity, event).await?;

            self.store
                .ledger
                .record(&NewMirror {
                    sync_config_id: self.configuration_id,
                    origin_event_id: "evt1",
                    mirror_event_id: "other-mirror",
                    subject: "Standup",
                    start_time: event.start,
                    end_time: event.end,
                    is_all_day: false,
                    show_as: "busy",
                    source_email: MICROSOFT,
                    target_email: identity,
                    sync_direction: SyncDirection::SourceToTarget,
                })
                .await
                .unwrap();

            Ok(id)
        }

        async fn delete_event(&self, _identity: &str, _event_id: &str) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    #[actix_rt::test]
    async fn concurrent_mirror_is_counted_as_duplicate() {
        let store = Store::open_in_memory().await.unwrap();
        let user = store.users.add("a@company.com", "A").await.unwrap();
        let configuration = store
            .configurations
            .add(&NewConfiguration::new(
                user.id,
                MICROSOFT,
                GOOGLE,
                SyncDirection::SourceToTarget,
            ))
            .await
            .unwrap();

        let microsoft = FakeCalendar::new(CalendarType::Microsoft);
        microsoft.add(MICROSOFT, "evt1", "Standup");
        let google = RacingCalendar {
            inner: FakeCalendar::new(CalendarType::Google),
            store: store.clone(),
            configuration_id: configuration.id,
        };
        let engine = SyncEngine::new(
            store,
            Providers::new().with(microsoft).with(google),
            SyncSettings::default(),
        )
        .unwrap();

        let counts = engine.sync_configuration(&configuration).await.unwrap();

        assert_eq!(counts.created, 1);
        assert_eq!(engine.metrics.events_total(EventOutcome::Duplicate).get(), 1);
        assert_eq!(engine.metrics.events_total(EventOutcome::Created).get(), 0);

        let row = engine
            .store()
            .ledger
            .find("evt1", configuration.id, SyncDirection::SourceToTarget)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.mirror_event_id, "other-mirror");
    }

    #[actix_rt::test]
    async fn failing_bookkeeping_closes_run_as_error() {
        let fixture = Fixture::new().await;
        fixture.microsoft.add(MICROSOFT, "evt1", "Standup");
        let configuration = fixture
            .configuration(MICROSOFT, GOOGLE, SyncDirection::SourceToTarget)
            .await;

        sqlx::raw_sql(
            "\
CREATE TRIGGER last_sync_read_only BEFORE UPDATE OF last_sync_at ON sync_configurations
BEGIN
    SELECT RAISE(ABORT, 'last_sync_at is read only');
END;
",
        )
        .execute(fixture.engine.store().pool())
        .await
        .unwrap();

        let err = fixture
            .engine
            .sync_configuration(&configuration)
            .await
            .unwrap_err();
        assert!(err.is_fatal());

        let runs = fixture.runs(&configuration).await;
        assert_eq!(runs[0].status, RunStatus::Error);
        assert_eq!(runs[0].counts, SyncCounts::default());
        assert!(runs[0].completed_at.is_some());
        assert!(runs[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("last_sync_at is read only"));
    }

    #[actix_rt::test]
    async fn endpoints_are_reclassified() {
        let fixture = Fixture::new().await;
        fixture.microsoft.add(MICROSOFT, "evt1", "Standup");

        let mut new = NewConfiguration::new(
            fixture.user_id,
            MICROSOFT,
            "primary",
            SyncDirection::SourceToTarget,
        );
        new.target_type = Some(CalendarType::Microsoft);
        let configuration = fixture
            .engine
            .store()
            .configurations
            .add(&new)
            .await
            .unwrap();

        fixture
            .engine
            .sync_configuration(&configuration)
            .await
            .unwrap();

        assert_eq!(fixture.google.created().len(), 1);
        assert!(fixture.microsoft.created().is_empty());
    }

    #[actix_rt::test]
    async fn inactive_configurations_are_skipped() {
        let fixture = Fixture::new().await;
        fixture.microsoft.add(MICROSOFT, "evt1", "Standup");
        let configuration = fixture
            .configuration(MICROSOFT, GOOGLE, SyncDirection::SourceToTarget)
            .await;
        fixture
            .engine
            .store()
            .configurations
            .set_active(configuration.id, false)
            .await
            .unwrap();

        let summary = fixture.engine.sync_all().await.unwrap();

        assert_eq!(summary, SyncSummary::default());
        assert!(fixture.runs(&configuration).await.is_empty());
    }

    #[actix_rt::test]
    async fn persistence_failure_aborts_batch() {
        let fixture = Fixture::new().await;
        fixture
            .configuration(MICROSOFT, GOOGLE, SyncDirection::SourceToTarget)
            .await;

        fixture.engine.store().close().await;

        let err = fixture.engine.sync_all().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[actix_rt::test]
    async fn sync_metrics_are_recorded() {
        let fixture = Fixture::with_providers(false).await;
        fixture.microsoft.add(MICROSOFT, "evt1", "Standup");
        fixture
            .configuration(MICROSOFT, GOOGLE, SyncDirection::SourceToTarget)
            .await;
        fixture
            .configuration(MICROSOFT, "b@company.com", SyncDirection::SourceToTarget)
            .await;

        fixture.engine.sync_all().await.unwrap();

        let metrics = &fixture.engine.metrics;
        assert_eq!(metrics.syncs_total(SyncStatus::Success).get(), 1);
        assert_eq!(metrics.syncs_total(SyncStatus::Error).get(), 1);
        assert_eq!(metrics.events_total(EventOutcome::Created).get(), 1);
        assert_eq!(metrics.active_configurations().get(), 2);
    }

    #[actix_rt::test]
    async fn shared_metrics_end_up_in_registry() {
        let fixture = Fixture::new().await;
        fixture.microsoft.add(MICROSOFT, "evt1", "Standup");
        fixture
            .configuration(MICROSOFT, GOOGLE, SyncDirection::SourceToTarget)
            .await;

        let registry = Registry::new();
        let metrics = SyncMetrics::new().unwrap();
        metrics.register(&registry).unwrap();
        let engine = fixture.engine.clone().with_metrics(metrics);

        engine.sync_all().await.unwrap();

        let text = crate::metrics::render(&registry).unwrap();
        assert!(text.contains(r#"calsync_syncs_total{status="success"} 1"#));
        assert!(text.contains(r#"calsync_events_total{outcome="created"} 1"#));
    }

    #[actix_rt::test]
    async fn window_starts_now() {
        let fixture = Fixture::new().await;
        let now = Utc::now();

        let window = fixture.engine.window_at(now);

        assert_eq!(window.start, now);
        assert_eq!(window.end - window.start, TimeDelta::days(30));
    }

    #[actix_rt::test]
    async fn sync_task_runs_until_stopped() {
        let fixture = Fixture::new().await;
        fixture
            .configuration(MICROSOFT, GOOGLE, SyncDirection::SourceToTarget)
            .await;

        let sync_task_handle = fixture.engine.spawn_sync_task(Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(50)).await;

        // Stop the sync again.
        sync_task_handle.stop().await.unwrap();

        let calls = fixture.microsoft.list_calls();
        assert!(calls >= 1);

        tokio::time::sleep(Duration::from_millis(30)).await;

        // Since sync is stopped, no further listings happen.
        assert_eq!(fixture.microsoft.list_calls(), calls);
    }
}
