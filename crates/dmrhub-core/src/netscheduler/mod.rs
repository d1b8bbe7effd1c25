// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! NetScheduler (C9): cron-like jobs that auto-open Nets on talkgroups,
//! elected across replicas via a KV `SetNX` lock, with per-net auto-close
//! timers and a periodic reaper (spec section 4.7).
//!
//! No cron crate is pulled in here: the recurrence the reference
//! implementation needs is "at HH:MM on one day of the week", which a
//! dozen-line matcher covers completely and more legibly than adopting an
//! external scheduling DSL for.

use crate::kv::KvStore;
use crate::pubsub::Bus;
use crate::repository::{Net, Repository, ScheduledNet};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Lock TTL for the scheduled-net fire election (spec sections 4.7, 6.3).
pub const ELECTION_LOCK_TTL: Duration = Duration::from_secs(30);

/// How often the reaper sweeps for Nets past their auto-close window (spec
/// section 9: "run such a reaper every minute").
pub const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Cap on a single auto-close timer, matching the reference's `MaxSafe`
/// guard against pathologically long `DurationMinutes` values overflowing
/// a platform timer.
const MAX_AUTO_CLOSE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum NetEvent {
    #[serde(rename = "started")]
    Started { net_id: u32, talkgroup_id: u32 },
    #[serde(rename = "stopped")]
    Stopped { net_id: u32, talkgroup_id: u32 },
}

fn lock_key(scheduled_net_id: u32) -> String {
    format!("dmrhub:netscheduler:lock:{}", scheduled_net_id)
}

/// Minute-granularity wall-clock reading a job is matched against. The
/// daemon supplies this every tick; tests supply fixed values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockReading {
    pub day_of_week: u8, // 0 = Sunday
    pub hour: u8,
    pub minute: u8,
    pub unix_ms: i64,
}

impl ScheduledNet {
    /// Whether this job fires at `clock` (spec section 4.7: `TimeOfDay =
    /// HH:MM` on `DayOfWeek`).
    fn fires_at(&self, clock: ClockReading) -> bool {
        self.enabled
            && self.day_of_week == clock.day_of_week
            && self.time_of_day_hh_mm == (clock.hour, clock.minute)
    }
}

/// Handle returned by `NetScheduler::spawn`; dropping or calling `stop`
/// cancels every job and every auto-close timer (spec section 4.7: "Stopping
/// the scheduler MUST stop all jobs, cancel all auto-close timers").
pub struct NetSchedulerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl NetSchedulerHandle {
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Auto-close timer handles keyed by Net ID, so cancelling a schedule does
/// not touch timers belonging to Nets it already created (spec section 4.7:
/// "Cancelling a schedule removes the job... auto-close timers survive
/// schedule removal").
type AutoCloseTimers = Arc<AsyncMutex<HashMap<u32, oneshot::Sender<()>>>>;

pub struct NetScheduler<R: Repository, K: KvStore> {
    repository: Arc<R>,
    kv: Arc<K>,
    bus: Arc<dyn Bus>,
    jobs: Arc<AsyncMutex<HashMap<u32, ScheduledNet>>>,
    auto_close_timers: AutoCloseTimers,
}

impl<R: Repository + 'static, K: KvStore + 'static> NetScheduler<R, K> {
    pub fn new(repository: Arc<R>, kv: Arc<K>, bus: Arc<dyn Bus>) -> Self {
        Self {
            repository,
            kv,
            bus,
            jobs: Arc::new(AsyncMutex::new(HashMap::new())),
            auto_close_timers: Arc::new(AsyncMutex::new(HashMap::new())),
        }
    }

    /// Register a job. Idempotent on `sn.id`.
    pub async fn add_job(&self, sn: ScheduledNet) {
        self.jobs.lock().await.insert(sn.id, sn);
    }

    /// Remove a job. Any auto-close timer it already armed keeps running
    /// (spec section 4.7).
    pub async fn remove_job(&self, scheduled_net_id: u32) {
        self.jobs.lock().await.remove(&scheduled_net_id);
    }

    /// Evaluate every job against `clock`, firing the ones that match. This
    /// is the unit tested core of the scheduler; `spawn` wraps it in a
    /// minute-granularity ticker.
    pub async fn tick(self: &Arc<Self>, clock: ClockReading) {
        let due: Vec<ScheduledNet> = self
            .jobs
            .lock()
            .await
            .values()
            .filter(|sn| sn.fires_at(clock))
            .cloned()
            .collect();

        for sn in due {
            self.fire(sn, clock.unix_ms).await;
        }
    }

    /// One job firing (spec section 4.7 steps 1-4).
    async fn fire(self: &Arc<Self>, sn: ScheduledNet, now_unix_ms: i64) {
        let acquired = match self
            .kv
            .set_nx(&lock_key(sn.id), b"1".to_vec(), ELECTION_LOCK_TTL)
            .await
        {
            Ok(acquired) => acquired,
            Err(err) => {
                warn!(scheduled_net_id = sn.id, %err, "lock acquisition failed");
                return;
            }
        };
        if !acquired {
            return; // another replica won the election; idempotent no-op
        }

        match self
            .repository
            .find_active_net_for_talkgroup(sn.talkgroup_id)
            .await
        {
            Ok(Some(_)) => return, // already an active Net; idempotence
            Ok(None) => {}
            Err(err) => {
                warn!(scheduled_net_id = sn.id, %err, "active-net lookup failed");
                return;
            }
        }

        let net = Net {
            id: 0,
            talkgroup_id: sn.talkgroup_id,
            scheduled_net_id: Some(sn.id),
            start_time_unix_ms: now_unix_ms,
            end_time_unix_ms: None,
            duration_minutes: Some(sn.duration_minutes),
            active: true,
            showcase: false,
            started_by_user_id: None,
        };

        let created = match self.repository.create_net(net).await {
            Ok(created) => created,
            Err(err) => {
                warn!(scheduled_net_id = sn.id, %err, "net creation failed");
                return;
            }
        };

        info!(net_id = created.id, talkgroup_id = sn.talkgroup_id, "net started");
        self.publish_event(NetEvent::Started {
            net_id: created.id,
            talkgroup_id: sn.talkgroup_id,
        })
        .await;

        if sn.duration_minutes > 0 {
            self.arm_auto_close(created.id, sn.talkgroup_id, sn.duration_minutes)
                .await;
        }
    }

    /// Arm a single-shot local timer that closes `net_id` after
    /// `duration_minutes` (spec section 4.7 step 4, section 9: "auto-close
    /// is a local timer, not an election").
    async fn arm_auto_close(self: &Arc<Self>, net_id: u32, talkgroup_id: u32, duration_minutes: u32) {
        let (tx, mut rx) = oneshot::channel();
        self.auto_close_timers.lock().await.insert(net_id, tx);

        let duration = Duration::from_secs(duration_minutes as u64 * 60).min(MAX_AUTO_CLOSE);
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = &mut rx => return, // cancelled
                _ = tokio::time::sleep(duration) => {}
            }
            scheduler.auto_close_timers.lock().await.remove(&net_id);
            scheduler.auto_close_net(net_id, talkgroup_id).await;
        });
    }

    async fn auto_close_net(&self, net_id: u32, talkgroup_id: u32) {
        let now_unix_ms = crate::now_unix_ms();
        if let Err(err) = self.repository.end_net(net_id, now_unix_ms).await {
            warn!(net_id, %err, "auto-close failed to persist");
            return;
        }
        info!(net_id, "net auto-closed");
        self.publish_event(NetEvent::Stopped {
            net_id,
            talkgroup_id,
        })
        .await;
    }

    async fn publish_event(&self, event: NetEvent) {
        let (net_id, talkgroup_id) = match &event {
            NetEvent::Started { net_id, talkgroup_id } | NetEvent::Stopped { net_id, talkgroup_id } => {
                (*net_id, *talkgroup_id)
            }
        };
        let payload = match serde_json::to_vec(&event) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(net_id, %err, "failed to encode WSNetEventResponse");
                return;
            }
        };
        let _ = self
            .bus
            .publish(&format!("net:events:{}", talkgroup_id), payload.clone())
            .await;
        let _ = self.bus.publish("net:events", payload).await;
    }

    /// Periodic sweep reaping Nets whose auto-close window has elapsed
    /// without a local timer surviving to close them -- e.g. the replica
    /// that armed the timer crashed (spec section 9).
    pub async fn reap(&self, now_unix_ms: i64) {
        let overdue = match self.repository.find_active_nets_past_duration(now_unix_ms).await {
            Ok(nets) => nets,
            Err(err) => {
                warn!(%err, "reaper lookup failed");
                return;
            }
        };
        for net in overdue {
            if let Err(err) = self.repository.end_net(net.id, now_unix_ms).await {
                warn!(net_id = net.id, %err, "reaper failed to close net");
                continue;
            }
            info!(net_id = net.id, "net reaped past its duration window");
            self.publish_event(NetEvent::Stopped {
                net_id: net.id,
                talkgroup_id: net.talkgroup_id,
            })
            .await;
        }
    }

    /// Start the minute-granularity ticker plus the once-a-minute reaper.
    /// `clock_fn` supplies the current reading; real callers pass a
    /// wall-clock reader, tests pass a fixed sequence.
    pub fn spawn(
        self: Arc<Self>,
        mut clock_fn: impl FnMut() -> ClockReading + Send + 'static,
    ) -> NetSchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let scheduler = self;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut reap_ticker = tokio::time::interval(REAPER_INTERVAL);
            reap_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        let timers = scheduler.auto_close_timers.lock().await.drain().collect::<Vec<_>>();
                        for (net_id, tx) in timers {
                            // Signal the armed auto-close task to return
                            // without firing; a send error just means it
                            // already fired on its own.
                            if tx.send(()).is_err() {
                                debug!(net_id, "auto-close timer already fired before shutdown");
                            }
                        }
                        return;
                    }
                    _ = ticker.tick() => {
                        let clock = clock_fn();
                        scheduler.tick(clock).await;
                    }
                    _ = reap_ticker.tick() => {
                        scheduler.reap(crate::now_unix_ms()).await;
                    }
                }
            }
        });

        NetSchedulerHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;
    use crate::pubsub::InMemoryBus;
    use crate::repository::{Call, CallDestinationKind, RepositoryError, User};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    struct FakeRepository {
        next_net_id: AtomicU32,
        active_nets: Mutex<HashMap<u32, Net>>,
    }

    impl FakeRepository {
        fn new() -> Self {
            Self {
                next_net_id: AtomicU32::new(1),
                active_nets: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl Repository for FakeRepository {
        async fn find_repeater_by_id(
            &self,
            _id: u32,
        ) -> Result<crate::repository::Repeater, RepositoryError> {
            Err(RepositoryError::NotFound)
        }
        async fn repeater_id_exists(&self, _id: u32) -> Result<bool, RepositoryError> {
            Ok(true)
        }
        async fn get_user_repeaters(
            &self,
            _user_id: u32,
        ) -> Result<Vec<crate::repository::Repeater>, RepositoryError> {
            Ok(vec![])
        }
        async fn find_user_by_id(&self, id: u32) -> Result<User, RepositoryError> {
            Ok(User {
                id,
                callsign: "TEST".into(),
            })
        }
        async fn talkgroup_id_exists(&self, _id: u32) -> Result<bool, RepositoryError> {
            Ok(true)
        }
        async fn find_active_net_for_talkgroup(
            &self,
            talkgroup_id: u32,
        ) -> Result<Option<Net>, RepositoryError> {
            Ok(self
                .active_nets
                .lock()
                .await
                .values()
                .find(|n| n.talkgroup_id == talkgroup_id && n.active)
                .cloned())
        }
        async fn find_talkgroup_calls_in_time_range(
            &self,
            _talkgroup_id: u32,
            _start_unix_ms: i64,
            _end_unix_ms: i64,
        ) -> Result<Vec<Call>, RepositoryError> {
            Ok(vec![])
        }
        async fn create_net(&self, mut net: Net) -> Result<Net, RepositoryError> {
            let id = self.next_net_id.fetch_add(1, Ordering::SeqCst);
            net.id = id;
            self.active_nets.lock().await.insert(id, net.clone());
            Ok(net)
        }
        async fn end_net(&self, net_id: u32, end_time_unix_ms: i64) -> Result<(), RepositoryError> {
            if let Some(net) = self.active_nets.lock().await.get_mut(&net_id) {
                net.active = false;
                net.end_time_unix_ms = Some(end_time_unix_ms);
            }
            Ok(())
        }
        async fn update_scheduled_net(&self, _sn: ScheduledNet) -> Result<(), RepositoryError> {
            Ok(())
        }
        async fn update_net_showcase(
            &self,
            _net_id: u32,
            _showcase: bool,
        ) -> Result<(), RepositoryError> {
            Ok(())
        }
        async fn find_active_nets_past_duration(
            &self,
            _now_unix_ms: i64,
        ) -> Result<Vec<Net>, RepositoryError> {
            Ok(vec![])
        }
        async fn upsert_call(&self, _call: Call) -> Result<(), RepositoryError> {
            Ok(())
        }
        async fn delete_talkgroup_cascade(&self, _talkgroup_id: u32) -> Result<Vec<u32>, RepositoryError> {
            Ok(vec![])
        }
    }

    fn job(id: u32, talkgroup_id: u32) -> ScheduledNet {
        ScheduledNet {
            id,
            talkgroup_id,
            time_of_day_hh_mm: (20, 0),
            day_of_week: 2,
            timezone: "UTC".into(),
            duration_minutes: 0,
            enabled: true,
            next_run_unix_ms: None,
        }
    }

    fn clock(day_of_week: u8, hour: u8, minute: u8) -> ClockReading {
        ClockReading {
            day_of_week,
            hour,
            minute,
            unix_ms: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn test_fires_and_creates_net() {
        let repository = Arc::new(FakeRepository::new());
        let kv = Arc::new(InMemoryKvStore::new());
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let mut events = bus.subscribe("net:events").await;

        let scheduler = Arc::new(NetScheduler::new(repository.clone(), kv, bus));
        scheduler.add_job(job(1, 3100)).await;
        scheduler.tick(clock(2, 20, 0)).await;

        assert_eq!(repository.active_nets.lock().await.len(), 1);
        let msg = events.receiver.recv().await.unwrap();
        let event: serde_json::Value = serde_json::from_slice(&msg).unwrap();
        assert_eq!(event["event"], "started");
    }

    #[tokio::test]
    async fn test_does_not_fire_off_schedule() {
        let repository = Arc::new(FakeRepository::new());
        let kv = Arc::new(InMemoryKvStore::new());
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let scheduler = Arc::new(NetScheduler::new(repository.clone(), kv, bus));
        scheduler.add_job(job(1, 3100)).await;
        scheduler.tick(clock(3, 20, 0)).await;
        assert_eq!(repository.active_nets.lock().await.len(), 0);
    }

    #[tokio::test]
    async fn test_idempotent_when_active_net_already_exists() {
        let repository = Arc::new(FakeRepository::new());
        let kv = Arc::new(InMemoryKvStore::new());
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let scheduler = Arc::new(NetScheduler::new(repository.clone(), kv, bus));
        scheduler.add_job(job(1, 3100)).await;
        scheduler.tick(clock(2, 20, 0)).await;
        scheduler.tick(clock(2, 20, 0)).await;
        assert_eq!(repository.active_nets.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_election_loss_is_not_an_error() {
        // Two "replicas" sharing one KV store; only one should create a Net.
        let repository_a = Arc::new(FakeRepository::new());
        let kv = Arc::new(InMemoryKvStore::new());
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());

        let scheduler_a = Arc::new(NetScheduler::new(repository_a.clone(), kv.clone(), bus.clone()));
        scheduler_a.add_job(job(1, 3100)).await;

        let repository_b = Arc::new(FakeRepository::new());
        let scheduler_b = Arc::new(NetScheduler::new(repository_b.clone(), kv, bus));
        scheduler_b.add_job(job(1, 3100)).await;

        scheduler_a.tick(clock(2, 20, 0)).await;
        scheduler_b.tick(clock(2, 20, 0)).await;

        let total = repository_a.active_nets.lock().await.len()
            + repository_b.active_nets.lock().await.len();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_remove_job_stops_future_fires() {
        let repository = Arc::new(FakeRepository::new());
        let kv = Arc::new(InMemoryKvStore::new());
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let scheduler = Arc::new(NetScheduler::new(repository.clone(), kv, bus));
        scheduler.add_job(job(1, 3100)).await;
        scheduler.remove_job(1).await;
        scheduler.tick(clock(2, 20, 0)).await;
        assert_eq!(repository.active_nets.lock().await.len(), 0);
    }

    #[test]
    fn test_cron_expression_ignored_in_favor_of_direct_match() {
        // fires_at compares day/time directly; cron_expression is a
        // presentation-layer artifact only (spec section 4.7).
        let sn = job(1, 3100);
        assert_eq!(sn.cron_expression().unwrap(), "0 0 20 * * 2");
        assert!(sn.fires_at(clock(2, 20, 0)));
        assert!(!sn.fires_at(clock(2, 20, 1)));
    }
}
