// Per-source update cycle: fetch → normalize → store, under a single-flight
// guard.
//
// Every scheduler owns its own SchedulerState; nothing is process-wide, so
// several instances (one per source, or many under test) never share flags.
// A failed stage aborts the cycle, records the error, and returns the
// scheduler to Idle. The next tick retries on its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use sentinela_common::FeedSource;
use sentinela_sources::{normalize_batch, SourceClient};

use crate::error::CycleError;
use crate::traits::{CycleHook, RecordStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Fetching,
    Normalizing,
    Storing,
}

/// Counts from one completed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub fetched: usize,
    pub normalized: usize,
    pub timestamp_fallbacks: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub source: FeedSource,
    pub is_updating: bool,
    pub phase: Phase,
    pub last_update_time: Option<DateTime<Utc>>,
    pub last_successful_update: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub last_report: Option<CycleReport>,
}

/// Answer to a manual trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateTrigger {
    Accepted,
    Busy,
}

#[derive(Debug, Clone)]
struct SchedulerState {
    phase: Phase,
    last_update_time: Option<DateTime<Utc>>,
    last_successful_update: Option<DateTime<Utc>>,
    error: Option<String>,
    last_report: Option<CycleReport>,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            last_update_time: None,
            last_successful_update: None,
            error: None,
            last_report: None,
        }
    }
}

struct Shared {
    updating: AtomicBool,
    state: Mutex<SchedulerState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_phase(&self, phase: Phase) {
        self.state().phase = phase;
    }
}

/// Held for the duration of one cycle. Dropping it (including on panic or
/// an early return) puts the scheduler back to Idle and releases the flag.
struct CycleGuard {
    shared: Arc<Shared>,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.shared.set_phase(Phase::Idle);
        self.shared.updating.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct UpdateScheduler {
    client: Arc<dyn SourceClient>,
    store: Arc<dyn RecordStore>,
    hook: Option<Arc<dyn CycleHook>>,
    interval: Duration,
    shared: Arc<Shared>,
}

impl UpdateScheduler {
    pub fn new(client: Arc<dyn SourceClient>, store: Arc<dyn RecordStore>, interval: Duration) -> Self {
        Self {
            client,
            store,
            hook: None,
            interval,
            shared: Arc::new(Shared {
                updating: AtomicBool::new(false),
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    /// Run `hook` after every successful store stage.
    pub fn with_hook(mut self, hook: Arc<dyn CycleHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn source(&self) -> FeedSource {
        self.client.source()
    }

    pub fn is_updating(&self) -> bool {
        self.shared.updating.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.shared.state().clone();
        SchedulerStatus {
            source: self.source(),
            is_updating: self.is_updating(),
            phase: state.phase,
            last_update_time: state.last_update_time,
            last_successful_update: state.last_successful_update,
            error: state.error,
            last_report: state.last_report,
        }
    }

    /// Run one cycle to completion on the caller's task.
    /// Returns `CycleError::Busy` without fetching when a cycle is running.
    pub async fn update_now(&self) -> Result<CycleReport, CycleError> {
        let guard = self.try_begin().ok_or(CycleError::Busy)?;
        self.run_cycle(guard).await
    }

    /// Start a cycle in the background. The guard is taken before this
    /// returns, so an immediate second call already sees `Busy`.
    pub fn force_update_now(&self) -> UpdateTrigger {
        let Some(guard) = self.try_begin() else {
            info!(source = %self.source(), "Update requested while busy");
            return UpdateTrigger::Busy;
        };
        let scheduler = self.clone();
        tokio::spawn(async move {
            let _ = scheduler.run_cycle(guard).await;
        });
        UpdateTrigger::Accepted
    }

    /// Run a cycle now, then every interval. Ticks that land on a running
    /// cycle are skipped, not queued.
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        info!(
            source = %self.source(),
            interval_secs = self.interval.as_secs(),
            "Starting update scheduler"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                // Any other outcome is already recorded in status by run_cycle.
                if let Err(CycleError::Busy) = scheduler.update_now().await {
                    debug!(source = %scheduler.source(), "Tick skipped, cycle in flight");
                }
            }
        })
    }

    fn try_begin(&self) -> Option<CycleGuard> {
        self.shared
            .updating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| CycleGuard {
                shared: self.shared.clone(),
            })
    }

    async fn run_cycle(&self, _guard: CycleGuard) -> Result<CycleReport, CycleError> {
        let source = self.source();
        info!(source = %source, "Update cycle started");

        let result = self.execute(source).await;
        let finished = Utc::now();

        let mut state = self.shared.state();
        state.last_update_time = Some(finished);
        match &result {
            Ok(report) => {
                state.last_successful_update = Some(finished);
                state.error = None;
                state.last_report = Some(*report);
                info!(
                    source = %source,
                    fetched = report.fetched,
                    normalized = report.normalized,
                    inserted = report.inserted,
                    updated = report.updated,
                    failed = report.failed,
                    "Update cycle complete"
                );
            }
            Err(e) => {
                state.error = Some(e.to_string());
                error!(source = %source, error = %e, "Update cycle failed");
            }
        }
        drop(state);

        result
    }

    async fn execute(&self, source: FeedSource) -> Result<CycleReport, CycleError> {
        self.shared.set_phase(Phase::Fetching);
        let raw = self.client.fetch().await?;
        let fetched = raw.len();

        self.shared.set_phase(Phase::Normalizing);
        let normalized = normalize_batch(raw, Utc::now());
        if normalized.report.skipped > 0 || normalized.report.timestamp_fallbacks > 0 {
            warn!(
                source = %source,
                skipped = normalized.report.skipped,
                timestamp_fallbacks = normalized.report.timestamp_fallbacks,
                coordinate_rejections = normalized.report.coordinate_rejections,
                "Records normalized with fallbacks"
            );
        }

        self.shared.set_phase(Phase::Storing);
        let upsert = self
            .store
            .upsert(source, &normalized.records)
            .await
            .map_err(|e| CycleError::Store(format!("{e:#}")))?;

        if let Some(hook) = &self.hook {
            hook.after_store().await;
        }

        Ok(CycleReport {
            fetched,
            normalized: normalized.report.normalized,
            timestamp_fallbacks: normalized.report.timestamp_fallbacks,
            inserted: upsert.inserted,
            updated: upsert.updated,
            failed: upsert.failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fire_row, MemoryStore, ScriptedClient};
    use chrono::TimeZone;
    use sentinela_sources::{FetchError, RawRecord};
    use tokio::sync::Semaphore;

    const HOUR: Duration = Duration::from_secs(3600);

    fn fire_rows() -> Vec<RawRecord> {
        vec![
            RawRecord::Fire(fire_row("2026-101", "18/10/2026 03:45:12 p.m.", "AV. LIMA 123 - LIMA")),
            RawRecord::Fire(fire_row("2026-102", "18/10/2026 04:00:00 p.m.", "JR. UNION 5 - BREÑA")),
        ]
    }

    async fn wait_until_idle(scheduler: &UpdateScheduler) {
        for _ in 0..200 {
            if !scheduler.is_updating() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("scheduler never went idle");
    }

    #[tokio::test]
    async fn successful_cycle_records_report_and_status() {
        let client = Arc::new(ScriptedClient::new(FeedSource::FireIncidents).then(Ok(fire_rows())));
        let store = Arc::new(MemoryStore::new());
        let scheduler = UpdateScheduler::new(client, store.clone(), HOUR);

        let report = scheduler.update_now().await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.normalized, 2);
        assert_eq!(report.inserted, 2);
        assert_eq!(store.count(FeedSource::FireIncidents), 2);

        let status = scheduler.status();
        assert!(!status.is_updating);
        assert_eq!(status.phase, Phase::Idle);
        assert_eq!(status.error, None);
        assert!(status.last_successful_update.is_some());
        assert_eq!(status.last_update_time, status.last_successful_update);
        assert_eq!(status.last_report, Some(report));
    }

    #[tokio::test]
    async fn parsed_fire_time_corrects_an_earlier_fallback() {
        let client = Arc::new(
            ScriptedClient::new(FeedSource::FireIncidents)
                .then(Ok(vec![RawRecord::Fire(fire_row("2026-300", "sin fecha", "AV. LIMA 123 - LIMA"))]))
                .then(Ok(vec![RawRecord::Fire(fire_row("2026-300", "sin fecha", "AV. LIMA 123 - LIMA"))]))
                .then(Ok(vec![RawRecord::Fire(fire_row(
                    "2026-300",
                    "18/10/2026 03:45:12 p.m.",
                    "AV. LIMA 123 - LIMA",
                ))])),
        );
        let store = Arc::new(MemoryStore::new());
        let scheduler = UpdateScheduler::new(client, store.clone(), HOUR);
        let occurred_at = || store.records(FeedSource::FireIncidents)[0].record.occurred_at;

        let report = scheduler.update_now().await.unwrap();
        assert_eq!(report.timestamp_fallbacks, 1);
        let estimated = occurred_at();

        scheduler.update_now().await.unwrap();
        assert_eq!(occurred_at(), estimated);

        scheduler.update_now().await.unwrap();
        assert_eq!(
            occurred_at(),
            Utc.with_ymd_and_hms(2026, 10, 18, 20, 45, 12).unwrap()
        );
    }

    #[tokio::test]
    async fn force_update_is_busy_while_a_cycle_runs() {
        let gate = Arc::new(Semaphore::new(0));
        let client = Arc::new(
            ScriptedClient::new(FeedSource::FireIncidents)
                .gated(gate.clone())
                .then(Ok(fire_rows())),
        );
        let scheduler = UpdateScheduler::new(client.clone(), Arc::new(MemoryStore::new()), HOUR);

        assert_eq!(scheduler.force_update_now(), UpdateTrigger::Accepted);
        assert!(scheduler.is_updating());
        assert_eq!(scheduler.force_update_now(), UpdateTrigger::Busy);
        assert!(matches!(scheduler.update_now().await, Err(CycleError::Busy)));

        gate.add_permits(1);
        wait_until_idle(&scheduler).await;
        assert_eq!(client.fetch_calls(), 1);

        gate.add_permits(1);
        assert_eq!(scheduler.force_update_now(), UpdateTrigger::Accepted);
        wait_until_idle(&scheduler).await;
        assert_eq!(client.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn fetch_failure_is_recorded_and_next_cycle_recovers() {
        let client = Arc::new(
            ScriptedClient::new(FeedSource::FireIncidents)
                .then(Err(FetchError::Exhausted {
                    attempts: 5,
                    last: "connection reset".into(),
                }))
                .then(Ok(fire_rows())),
        );
        let scheduler = UpdateScheduler::new(client, Arc::new(MemoryStore::new()), HOUR);

        let err = scheduler.update_now().await.unwrap_err();
        assert!(matches!(err, CycleError::Fetch(FetchError::Exhausted { .. })));
        let status = scheduler.status();
        assert!(status.error.as_deref().unwrap().contains("5 attempts"));
        assert!(status.last_update_time.is_some());
        assert_eq!(status.last_successful_update, None);
        assert_eq!(status.phase, Phase::Idle);
        assert!(!status.is_updating);

        scheduler.update_now().await.unwrap();
        let status = scheduler.status();
        assert_eq!(status.error, None);
        assert!(status.last_successful_update.is_some());
    }

    #[tokio::test]
    async fn store_outage_aborts_cycle() {
        let client = Arc::new(ScriptedClient::new(FeedSource::FireIncidents).then(Ok(fire_rows())));
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let scheduler = UpdateScheduler::new(client, store.clone(), HOUR);

        assert!(matches!(scheduler.update_now().await, Err(CycleError::Store(_))));
        assert!(scheduler.status().error.unwrap().starts_with("Store stage failed"));
        assert_eq!(store.count(FeedSource::FireIncidents), 0);
    }

    #[tokio::test]
    async fn schedulers_do_not_share_state() {
        let failing = UpdateScheduler::new(
            Arc::new(ScriptedClient::new(FeedSource::Earthquakes).then(Err(FetchError::Parse("bad".into())))),
            Arc::new(MemoryStore::new()),
            HOUR,
        );
        let healthy = UpdateScheduler::new(
            Arc::new(ScriptedClient::new(FeedSource::FireIncidents).then(Ok(fire_rows()))),
            Arc::new(MemoryStore::new()),
            HOUR,
        );

        let _ = failing.update_now().await;
        healthy.update_now().await.unwrap();

        assert!(failing.status().error.is_some());
        assert_eq!(healthy.status().error, None);
    }

    #[tokio::test]
    async fn hook_runs_after_store() {
        use std::sync::atomic::AtomicUsize;

        struct Counting(AtomicUsize);

        #[async_trait::async_trait]
        impl CycleHook for Counting {
            async fn after_store(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let hook = Arc::new(Counting(AtomicUsize::new(0)));
        let client = Arc::new(
            ScriptedClient::new(FeedSource::FireIncidents)
                .then(Err(FetchError::Parse("bad".into())))
                .then(Ok(fire_rows())),
        );
        let scheduler =
            UpdateScheduler::new(client, Arc::new(MemoryStore::new()), HOUR).with_hook(hook.clone());

        let _ = scheduler.update_now().await;
        assert_eq!(hook.0.load(Ordering::SeqCst), 0);
        scheduler.update_now().await.unwrap();
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);
    }
}
