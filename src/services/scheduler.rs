//! Background scheduler for daily umbrella notifications.
//!
//! Wakes every `poll_interval`, converts the clock to the configured civil
//! time zone and, the first time it sees a new minute, pushes to every user
//! whose schedule equals that (hour, minute).
//!
//! Architecture:
//! - `tokio::time::interval` drives ticks; a `watch` channel stops the loop
//! - The last fired minute is remembered so repeated polls within one minute
//!   never notify twice
//! - Matching users are snapshotted from the registry, then the lock is
//!   released before any forecast fetch or push
//! - A push failure is logged and counted; the rest of the scan carries on
//! - State is in-memory (`Arc<RwLock<SchedulerState>>`), served by the status
//!   endpoint

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use utoipa::ToSchema;

use crate::services::line::PushSink;
use crate::services::registry::UserRegistry;
use crate::services::responder::{IntentResponder, ReplyStatus, UMBRELLA_QUERY};
use crate::store::models::{Schedule, UserSetting};

/// Pushed when a scheduled user has no location yet.
const LOCATION_PROMPT: &str =
    "通知の時間ですが、位置情報が設定されていません。位置情報を送信してください。";

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of the current instant; swapped for a fake in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ---------------------------------------------------------------------------
// Scheduler state (in-memory, shared via Arc<RwLock<>>)
// ---------------------------------------------------------------------------

/// Scheduler status, exposed via the status endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SchedulerState {
    pub active: bool,
    /// IANA zone used to evaluate schedules
    pub timezone: String,
    pub poll_interval_secs: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    /// Local minute of the last scan, e.g. "2026-10-19 07:00"
    pub last_fired_minute: Option<String>,
    pub total_ticks: u64,
    pub total_scans: u64,
    pub last_scan_matched: usize,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
}

impl SchedulerState {
    pub fn new(timezone: Tz, poll_interval: Duration) -> Self {
        Self {
            active: false,
            timezone: timezone.name().to_string(),
            poll_interval_secs: poll_interval.as_secs(),
            last_tick_at: None,
            last_fired_minute: None,
            total_ticks: 0,
            total_scans: 0,
            last_scan_matched: 0,
            notifications_sent: 0,
            notifications_failed: 0,
        }
    }
}

/// Shared scheduler state handle.
pub type SharedSchedulerState = Arc<RwLock<SchedulerState>>;

// ---------------------------------------------------------------------------
// Tick results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Same local minute as the previous scan.
    AlreadyFired,
    Scanned {
        matched: usize,
        pushed: usize,
        failed: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NotifyOutcome {
    Pushed,
    Silent,
    Failed,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct NotificationScheduler {
    registry: UserRegistry,
    responder: Arc<IntentResponder>,
    sink: Arc<dyn PushSink>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
    poll_interval: Duration,
    notify_when_clear: bool,
    last_fired: Option<NaiveDateTime>,
    state: SharedSchedulerState,
}

impl NotificationScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: UserRegistry,
        responder: Arc<IntentResponder>,
        sink: Arc<dyn PushSink>,
        clock: Arc<dyn Clock>,
        timezone: Tz,
        poll_interval: Duration,
        notify_when_clear: bool,
        state: SharedSchedulerState,
    ) -> Self {
        Self {
            registry,
            responder,
            sink,
            clock,
            timezone,
            poll_interval,
            notify_when_clear,
            last_fired: None,
            state,
        }
    }

    /// Start `run` on its own task.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown, rx) = watch::channel(false);
        SchedulerHandle {
            task: tokio::spawn(self.run(rx)),
            shutdown,
        }
    }

    /// Run until `shutdown` flips to true or its sender is dropped.
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "Notification scheduler started (every {}s, zone {})",
            self.poll_interval.as_secs(),
            self.timezone
        );
        self.state.write().await.active = true;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.state.write().await.active = false;
        tracing::info!("Notification scheduler stopped");
    }

    /// One wake-up: scan the registry unless this local minute already fired.
    pub async fn tick(&mut self) -> TickOutcome {
        let now = self.clock.now();
        let local = now.with_timezone(&self.timezone);
        let minute = local
            .naive_local()
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or_else(|| local.naive_local());

        {
            let mut s = self.state.write().await;
            s.last_tick_at = Some(now);
            s.total_ticks += 1;
        }

        if self.last_fired == Some(minute) {
            return TickOutcome::AlreadyFired;
        }
        self.last_fired = Some(minute);

        // Hour and minute are always in range here
        let Some(schedule) = Schedule::new(local.hour(), local.minute()) else {
            return TickOutcome::AlreadyFired;
        };

        let users = self.registry.scheduled_at(schedule).await;
        let matched = users.len();
        if matched > 0 {
            tracing::info!("Scheduler: {} user(s) scheduled at {}", matched, schedule);
        } else {
            tracing::debug!("Scheduler: nobody scheduled at {}", schedule);
        }

        let outcomes = futures::future::join_all(
            users
                .iter()
                .map(|(user_id, setting)| self.notify(user_id, setting)),
        )
        .await;

        let pushed = outcomes
            .iter()
            .filter(|o| **o == NotifyOutcome::Pushed)
            .count();
        let failed = outcomes
            .iter()
            .filter(|o| **o == NotifyOutcome::Failed)
            .count();

        {
            let mut s = self.state.write().await;
            s.last_fired_minute = Some(minute.format("%Y-%m-%d %H:%M").to_string());
            s.total_scans += 1;
            s.last_scan_matched = matched;
            s.notifications_sent += pushed as u64;
            s.notifications_failed += failed as u64;
        }

        TickOutcome::Scanned {
            matched,
            pushed,
            failed,
        }
    }

    /// Ask the responder on the user's behalf and push the answer if it
    /// warrants a notification.
    async fn notify(&self, user_id: &str, setting: &UserSetting) -> NotifyOutcome {
        let reply = self
            .responder
            .respond(UMBRELLA_QUERY, setting.location)
            .await;

        let text = match reply.status {
            ReplyStatus::NeedUmbrella(_) => reply.text,
            ReplyStatus::MissingLocation => LOCATION_PROMPT.to_string(),
            ReplyStatus::NoUmbrella(_) if self.notify_when_clear => reply.text,
            status => {
                tracing::debug!("Scheduler: nothing to push to {} ({:?})", user_id, status);
                return NotifyOutcome::Silent;
            }
        };

        match self.sink.push(user_id, &text).await {
            Ok(()) => {
                tracing::info!("Scheduler: notified {} ({:?})", user_id, reply.status);
                NotifyOutcome::Pushed
            }
            Err(e) => {
                tracing::warn!("Scheduler: push to {} failed: {}", user_id, e);
                NotifyOutcome::Failed
            }
        }
    }
}

/// Running scheduler task and its shutdown switch.
pub struct SchedulerHandle {
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl SchedulerHandle {
    /// Signal shutdown and wait up to `grace` for the current tick to finish.
    /// A tick still running after that is aborted, abandoning its pushes.
    /// Returns true when the loop exited on its own.
    pub async fn stop(mut self, grace: Duration) -> bool {
        let _ = self.shutdown.send(true);
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!("Scheduler task ended abnormally: {}", e);
                false
            }
            Err(_) => {
                tracing::warn!(
                    "Scheduler still busy after {:?}, abandoning in-flight notifications",
                    grace
                );
                self.task.abort();
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use crate::services::forecast::RainThresholds;
    use crate::services::responder::tests::{FakeSource, TOKYO};
    use crate::store::models::SettingUpdate;
    use crate::store::settings_file::SettingsFile;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeClock(Mutex<DateTime<Utc>>);

    impl FakeClock {
        fn at(rfc3339: &str) -> Arc<Self> {
            Arc::new(Self(Mutex::new(rfc3339.parse().unwrap())))
        }

        fn set(&self, rfc3339: &str) {
            *self.0.lock().unwrap() = rfc3339.parse().unwrap();
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    /// Records pushes; fails for user ids listed in `failing`.
    #[derive(Default)]
    struct FakeSink {
        pushed: Mutex<Vec<(String, String)>>,
        failing: Vec<String>,
    }

    #[async_trait]
    impl PushSink for FakeSink {
        async fn push(&self, user_id: &str, text: &str) -> Result<(), AppError> {
            if self.failing.iter().any(|f| f == user_id) {
                return Err(AppError::MessagingError("push rejected".to_string()));
            }
            self.pushed
                .lock()
                .unwrap()
                .push((user_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    impl FakeSink {
        fn users(&self) -> Vec<String> {
            let mut users: Vec<String> = self
                .pushed
                .lock()
                .unwrap()
                .iter()
                .map(|(u, _)| u.clone())
                .collect();
            users.sort();
            users
        }
    }

    struct Harness {
        scheduler: NotificationScheduler,
        registry: UserRegistry,
        clock: Arc<FakeClock>,
        sink: Arc<FakeSink>,
        state: SharedSchedulerState,
        _dir: tempfile::TempDir,
    }

    fn harness(pops: &[i64], sink: FakeSink, notify_when_clear: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let registry = UserRegistry::new(SettingsFile::new(dir.path().join("usersettings.json")));
        let responder = Arc::new(IntentResponder::new(
            FakeSource::ok(7, pops),
            RainThresholds::default(),
            12,
        ));
        let sink = Arc::new(sink);
        // 22:00 UTC is 07:00 in Tokyo
        let clock = FakeClock::at("2026-10-18T22:00:05Z");
        let state = Arc::new(RwLock::new(SchedulerState::new(
            chrono_tz::Asia::Tokyo,
            Duration::from_secs(30),
        )));
        let scheduler = NotificationScheduler::new(
            registry.clone(),
            responder,
            sink.clone(),
            clock.clone(),
            chrono_tz::Asia::Tokyo,
            Duration::from_secs(30),
            notify_when_clear,
            state.clone(),
        );
        Harness {
            scheduler,
            registry,
            clock,
            sink,
            state,
            _dir: dir,
        }
    }

    async fn subscribe(registry: &UserRegistry, user_id: &str, hour: u32, minute: u32, located: bool) {
        registry
            .upsert(
                user_id,
                SettingUpdate {
                    location: located.then_some(TOKYO),
                    schedule: Schedule::new(hour, minute),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fires_once_per_minute() {
        let mut h = harness(&[5, 20, 60, 5], FakeSink::default(), false);
        subscribe(&h.registry, "U1", 7, 0, true).await;

        assert_eq!(
            h.scheduler.tick().await,
            TickOutcome::Scanned {
                matched: 1,
                pushed: 1,
                failed: 0
            }
        );
        h.clock.set("2026-10-18T22:00:35Z");
        assert_eq!(h.scheduler.tick().await, TickOutcome::AlreadyFired);
        assert_eq!(h.scheduler.tick().await, TickOutcome::AlreadyFired);

        assert_eq!(h.sink.users(), vec!["U1".to_string()]);
        let state = h.state.read().await;
        assert_eq!(state.total_ticks, 3);
        assert_eq!(state.total_scans, 1);
        assert_eq!(state.notifications_sent, 1);
        assert_eq!(state.last_fired_minute.as_deref(), Some("2026-10-19 07:00"));
    }

    #[tokio::test]
    async fn test_next_minute_scans_again() {
        let mut h = harness(&[5, 20, 60, 5], FakeSink::default(), false);
        subscribe(&h.registry, "U1", 7, 0, true).await;
        subscribe(&h.registry, "U2", 7, 1, true).await;

        h.scheduler.tick().await;
        h.clock.set("2026-10-18T22:01:02Z");
        assert_eq!(
            h.scheduler.tick().await,
            TickOutcome::Scanned {
                matched: 1,
                pushed: 1,
                failed: 0
            }
        );
        assert_eq!(h.sink.users(), vec!["U1".to_string(), "U2".to_string()]);
    }

    #[tokio::test]
    async fn test_same_clock_minute_next_day_fires() {
        let mut h = harness(&[5, 20, 60, 5], FakeSink::default(), false);
        subscribe(&h.registry, "U1", 7, 0, true).await;

        h.scheduler.tick().await;
        h.clock.set("2026-10-19T22:00:05Z");
        h.scheduler.tick().await;
        assert_eq!(h.sink.pushed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_schedule_uses_configured_zone() {
        let mut h = harness(&[5, 20, 60, 5], FakeSink::default(), false);
        // 22:00 in UTC terms must not match; the clock reads 07:00 Tokyo time
        subscribe(&h.registry, "U1", 22, 0, true).await;
        assert_eq!(
            h.scheduler.tick().await,
            TickOutcome::Scanned {
                matched: 0,
                pushed: 0,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_silent_when_no_umbrella_needed() {
        let mut h = harness(&[0, 5, 0], FakeSink::default(), false);
        subscribe(&h.registry, "U1", 7, 0, true).await;
        assert_eq!(
            h.scheduler.tick().await,
            TickOutcome::Scanned {
                matched: 1,
                pushed: 0,
                failed: 0
            }
        );
        assert!(h.sink.users().is_empty());
    }

    #[tokio::test]
    async fn test_notify_when_clear_pushes_negative_answer() {
        let mut h = harness(&[0, 5, 0], FakeSink::default(), true);
        subscribe(&h.registry, "U1", 7, 0, true).await;
        h.scheduler.tick().await;
        let pushed = h.sink.pushed.lock().unwrap().clone();
        assert_eq!(pushed.len(), 1);
        assert!(pushed[0].1.contains("必要ありません"));
    }

    #[tokio::test]
    async fn test_missing_location_gets_prompt() {
        let mut h = harness(&[5, 20, 60, 5], FakeSink::default(), false);
        subscribe(&h.registry, "U1", 7, 0, false).await;
        h.scheduler.tick().await;
        let pushed = h.sink.pushed.lock().unwrap().clone();
        assert_eq!(pushed, vec![("U1".to_string(), LOCATION_PROMPT.to_string())]);
    }

    #[tokio::test]
    async fn test_push_failure_does_not_abort_scan() {
        let sink = FakeSink {
            failing: vec!["U1".to_string()],
            ..FakeSink::default()
        };
        let mut h = harness(&[5, 20, 60, 5], sink, false);
        subscribe(&h.registry, "U1", 7, 0, true).await;
        subscribe(&h.registry, "U2", 7, 0, true).await;
        subscribe(&h.registry, "U3", 7, 0, true).await;

        assert_eq!(
            h.scheduler.tick().await,
            TickOutcome::Scanned {
                matched: 3,
                pushed: 2,
                failed: 1
            }
        );
        assert_eq!(h.sink.users(), vec!["U2".to_string(), "U3".to_string()]);
        assert_eq!(h.state.read().await.notifications_failed, 1);
    }

    #[tokio::test]
    async fn test_provider_error_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = UserRegistry::new(SettingsFile::new(dir.path().join("usersettings.json")));
        subscribe(&registry, "U1", 7, 0, true).await;
        let responder = Arc::new(IntentResponder::new(
            FakeSource::with(Err("timeout".to_string())),
            RainThresholds::default(),
            12,
        ));
        let sink = Arc::new(FakeSink::default());
        let state = Arc::new(RwLock::new(SchedulerState::new(
            chrono_tz::Asia::Tokyo,
            Duration::from_secs(30),
        )));
        let mut scheduler = NotificationScheduler::new(
            registry,
            responder,
            sink.clone(),
            FakeClock::at("2026-10-18T22:00:05Z"),
            chrono_tz::Asia::Tokyo,
            Duration::from_secs(30),
            false,
            state,
        );

        scheduler.tick().await;
        assert!(sink.users().is_empty());
    }

    /// Parks every push until released.
    #[derive(Default)]
    struct GatedSink {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl PushSink for GatedSink {
        async fn push(&self, _user_id: &str, _text: &str) -> Result<(), AppError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    /// Scheduler whose pushes go to a `GatedSink`, with U1 due at 07:00 Tokyo.
    async fn gated_scheduler(
        dir: &tempfile::TempDir,
    ) -> (NotificationScheduler, UserRegistry, Arc<GatedSink>) {
        let registry = UserRegistry::new(SettingsFile::new(dir.path().join("usersettings.json")));
        subscribe(&registry, "U1", 7, 0, true).await;
        let sink = Arc::new(GatedSink::default());
        let scheduler = NotificationScheduler::new(
            registry.clone(),
            Arc::new(IntentResponder::new(
                FakeSource::ok(7, &[5, 20, 60, 5]),
                RainThresholds::default(),
                12,
            )),
            sink.clone(),
            FakeClock::at("2026-10-18T22:00:05Z"),
            chrono_tz::Asia::Tokyo,
            Duration::from_secs(30),
            false,
            Arc::new(RwLock::new(SchedulerState::new(
                chrono_tz::Asia::Tokyo,
                Duration::from_secs(30),
            ))),
        );
        (scheduler, registry, sink)
    }

    #[tokio::test]
    async fn test_registry_usable_while_push_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, registry, sink) = gated_scheduler(&dir).await;

        let tick = tokio::spawn(async move { scheduler.tick().await });
        sink.entered.notified().await;

        // The tick is parked inside the push; reads and writes must not wait on it
        let limit = Duration::from_secs(1);
        tokio::time::timeout(limit, subscribe(&registry, "U2", 8, 0, true))
            .await
            .expect("upsert blocked by an in-flight push");
        let setting = tokio::time::timeout(limit, registry.get("U1"))
            .await
            .expect("get blocked by an in-flight push");
        assert!(setting.is_some());

        sink.release.notify_one();
        assert_eq!(
            tick.await.unwrap(),
            TickOutcome::Scanned {
                matched: 1,
                pushed: 1,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(&[5, 20, 60, 5], FakeSink::default(), false);
        subscribe(&h.registry, "U1", 7, 0, true).await;

        let mut scheduler = h.scheduler;
        scheduler.poll_interval = Duration::from_millis(10);
        let handle = scheduler.spawn();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.state.read().await.active);
        assert!(handle.stop(Duration::from_secs(1)).await);

        let state = h.state.read().await;
        assert!(!state.active);
        assert!(state.total_ticks > 1, "ticks: {}", state.total_ticks);
        // The fake clock never leaves 07:00, so only one scan happened
        assert_eq!(state.total_scans, 1);
        assert_eq!(h.sink.users(), vec!["U1".to_string()]);
    }

    #[tokio::test]
    async fn test_stop_abandons_stuck_tick() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, registry, sink) = gated_scheduler(&dir).await;

        let handle = scheduler.spawn();
        // The first tick fires at once and parks in a push that is never released
        sink.entered.notified().await;

        let started = std::time::Instant::now();
        assert!(!handle.stop(Duration::from_millis(100)).await);
        assert!(started.elapsed() < Duration::from_secs(2));

        // Flushing afterwards is not held up by the abandoned push
        tokio::time::timeout(Duration::from_secs(1), registry.save_all())
            .await
            .unwrap()
            .unwrap();
    }
}
