//! Live snapshot composition.
//!
//! Five independent loops (actuators, health, local uptime, auxiliary sensor,
//! derived cycles-per-minute) each own one slice of the snapshot. The fast
//! loop never waits on history; it reads the last cached cpm only. Every tick re-checks the liveness flag
//! after its network call and discards the result once the composer has been
//! shut down. A new `Arc<Snapshot>` is published whenever a slice changes.

use chrono::Utc;
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use twin_core::snapshot::same_actuators;
use twin_core::{
    ActuatorSnapshot, AuxReading, LatchTable, LatchTiming, LiveStateResponse, Observation,
    Snapshot, SystemView, OFFLINE_STATUS,
};

use crate::cpm::cycles_per_minute;
use crate::metric_cache::RateLimitedCache;
use crate::source::{LiveSource, SourceError};

pub const HEALTH_UNREACHABLE: &str = "unreachable";
const ONLINE_STATUS: &str = "online";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComposerConfig {
    pub fast_interval: Duration,
    pub slow_interval: Duration,
    pub uptime_interval: Duration,
    pub aux_interval: Duration,
    pub cpm_interval: Duration,
    pub cpm_min_interval: Duration,
    pub latch: LatchTiming,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_millis(400),
            slow_interval: Duration::from_secs(5),
            uptime_interval: Duration::from_secs(1),
            aux_interval: Duration::from_secs(1),
            cpm_interval: Duration::from_secs(1),
            cpm_min_interval: Duration::from_secs(10),
            latch: LatchTiming::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopStats {
    pub ticks: u64,
    pub failures: u64,
    pub published: u64,
    pub skipped_identical: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComposerStats {
    pub fast: LoopStats,
    pub slow: LoopStats,
    pub uptime: LoopStats,
    pub aux: LoopStats,
    pub cpm: LoopStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    Fast,
    Slow,
    Uptime,
    Aux,
    Cpm,
}

impl LoopKind {
    fn as_str(self) -> &'static str {
        match self {
            LoopKind::Fast => "fast",
            LoopKind::Slow => "slow",
            LoopKind::Uptime => "uptime",
            LoopKind::Aux => "aux",
            LoopKind::Cpm => "cpm",
        }
    }
}

impl ComposerStats {
    fn loop_mut(&mut self, kind: LoopKind) -> &mut LoopStats {
        match kind {
            LoopKind::Fast => &mut self.fast,
            LoopKind::Slow => &mut self.slow,
            LoopKind::Uptime => &mut self.uptime,
            LoopKind::Aux => &mut self.aux,
            LoopKind::Cpm => &mut self.cpm,
        }
    }
}

pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[derive(Default)]
struct Fragments {
    system: SystemView,
    actuators: Vec<ActuatorSnapshot>,
    aux_id: Option<String>,
    aux: Option<AuxReading>,
    selected: Option<String>,
    /// Actuators the backend reports without a cpm value.
    cpm_pending: Vec<String>,
}

struct ComposerState {
    alive: bool,
    fragments: Fragments,
    latches: LatchTable,
    stats: ComposerStats,
}

pub struct LiveComposer {
    config: ComposerConfig,
    source: Arc<dyn LiveSource>,
    clock: Arc<dyn Clock>,
    cpm_cache: RateLimitedCache<f64>,
    state: Mutex<ComposerState>,
    publisher: watch::Sender<Arc<Snapshot>>,
}

impl LiveComposer {
    pub fn new(
        source: Arc<dyn LiveSource>,
        clock: Arc<dyn Clock>,
        config: ComposerConfig,
    ) -> Arc<Self> {
        let (publisher, _) = watch::channel(Arc::new(Snapshot::default()));
        Arc::new(Self {
            config,
            source,
            clock,
            cpm_cache: RateLimitedCache::new(),
            state: Mutex::new(ComposerState {
                alive: true,
                fragments: Fragments::default(),
                latches: LatchTable::new(config.latch),
                stats: ComposerStats::default(),
            }),
            publisher,
        })
    }

    /// Spawns the five polling loops on the current runtime.
    pub fn start(self: &Arc<Self>) -> ComposerHandle {
        let config = self.config;
        info!(
            "composer_started: fast_ms={} slow_ms={} aux_ms={} cpm_ms={}",
            config.fast_interval.as_millis(),
            config.slow_interval.as_millis(),
            config.aux_interval.as_millis(),
            config.cpm_interval.as_millis()
        );
        let tasks = vec![
            spawn_loop(self.clone(), LoopKind::Fast, config.fast_interval, |c| async move {
                c.fast_tick().await
            }),
            spawn_loop(self.clone(), LoopKind::Slow, config.slow_interval, |c| async move {
                c.slow_tick().await
            }),
            spawn_loop(
                self.clone(),
                LoopKind::Uptime,
                config.uptime_interval,
                |c| async move { c.uptime_tick() },
            ),
            spawn_loop(self.clone(), LoopKind::Aux, config.aux_interval, |c| async move {
                c.aux_tick().await
            }),
            spawn_loop(self.clone(), LoopKind::Cpm, config.cpm_interval, |c| async move {
                c.cpm_tick().await
            }),
        ];
        ComposerHandle {
            composer: self.clone(),
            tasks,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ComposerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.publisher.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.publisher.subscribe()
    }

    pub fn stats(&self) -> ComposerStats {
        self.lock().stats
    }

    pub fn is_alive(&self) -> bool {
        self.lock().alive
    }

    /// Marks the composer inert. Results of fetches still in flight are dropped.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if state.alive {
            state.alive = false;
            info!("composer_stopped");
        }
    }

    pub fn select(&self, actuator_id: Option<String>) {
        let mut state = self.lock();
        if !state.alive || state.fragments.selected == actuator_id {
            return;
        }
        state.fragments.selected = actuator_id;
        self.publish(&state);
    }

    fn publish(&self, state: &ComposerState) {
        let fragments = &state.fragments;
        self.publisher.send_replace(Arc::new(Snapshot {
            system: fragments.system.clone(),
            actuators: fragments.actuators.clone(),
            aux_sensor: fragments.aux.clone(),
            selected_actuator: fragments.selected.clone(),
        }));
    }

    fn settle(&self, state: &mut ComposerState, kind: LoopKind, changed: bool) {
        let stats = state.stats.loop_mut(kind);
        if changed {
            stats.published += 1;
            self.publish(state);
        } else {
            stats.skipped_identical += 1;
        }
    }

    fn record_failure(&self, kind: LoopKind, err: &SourceError) {
        let mut state = self.lock();
        if !state.alive {
            return;
        }
        let stats = state.stats.loop_mut(kind);
        stats.ticks += 1;
        stats.failures += 1;
        warn!("{}_fetch_error: {err}", kind.as_str());
    }

    /// Actuator array and system status. The only await is the live fetch.
    pub async fn fast_tick(&self) {
        let result = self.source.live_state().await;
        let now_ms = self.clock.now_ms();

        let mut state = self.lock();
        if !state.alive {
            return;
        }
        state.stats.fast.ticks += 1;
        let changed = match result {
            Ok(live) => {
                let pending: Vec<String> = live
                    .actuators
                    .iter()
                    .filter(|actuator| actuator.cpm.is_none())
                    .map(|actuator| actuator.id.clone())
                    .collect();
                self.forget_settled_cpm(&state.fragments.cpm_pending, &pending);
                let cached: HashMap<String, f64> = pending
                    .iter()
                    .filter_map(|id| self.cpm_cache.peek(id).map(|cpm| (id.clone(), cpm)))
                    .collect();
                let actuators = compose_actuators(&mut state.latches, &live, &cached, now_ms);
                let status = match live.system.status.trim() {
                    "" => ONLINE_STATUS.to_string(),
                    status => status.to_string(),
                };
                let fragments = &mut state.fragments;
                fragments.system.timestamp_ms = live.ts.unwrap_or(now_ms);
                fragments.cpm_pending = pending;
                let changed = fragments.system.status != status
                    || !same_actuators(&fragments.actuators, &actuators);
                fragments.system.status = status;
                fragments.actuators = actuators;
                changed
            }
            Err(err) => {
                warn!("live_fetch_error: {err}");
                state.stats.fast.failures += 1;
                let fragments = &mut state.fragments;
                let changed =
                    fragments.system.status != OFFLINE_STATUS || !fragments.actuators.is_empty();
                fragments.system.status = OFFLINE_STATUS.to_string();
                fragments.system.timestamp_ms = now_ms;
                fragments.actuators.clear();
                changed
            }
        };
        self.settle(&mut state, LoopKind::Fast, changed);
    }

    /// Drops cached cpm for actuators that left the set or now report their own.
    fn forget_settled_cpm(&self, before: &[String], after: &[String]) {
        let still_pending: HashSet<&str> = after.iter().map(String::as_str).collect();
        for id in before.iter().filter(|id| !still_pending.contains(id.as_str())) {
            debug!("cpm_cache_invalidated: id={id}");
            self.cpm_cache.invalidate(id);
        }
    }

    /// Derives cpm from history for actuators the backend leaves without one.
    /// Lookups for different actuators run concurrently and go through the
    /// rate-limited cache, so a slow history endpoint only delays this loop.
    pub async fn cpm_tick(&self) {
        let pending = {
            let mut state = self.lock();
            if !state.alive {
                return;
            }
            if state.fragments.cpm_pending.is_empty() {
                state.stats.cpm.ticks += 1;
                state.stats.cpm.skipped_identical += 1;
                return;
            }
            state.fragments.cpm_pending.clone()
        };
        let now_ms = self.clock.now_ms();
        let source = self.source.as_ref();
        let min_interval = self.config.cpm_min_interval;
        let results = join_all(pending.iter().map(|id| async move {
            let result = self
                .cpm_cache
                .get_or_compute(id, min_interval, || cycles_per_minute(source, id, now_ms))
                .await;
            (id, result)
        }))
        .await;

        let mut state = self.lock();
        if !state.alive {
            return;
        }
        state.stats.cpm.ticks += 1;
        let mut failed = false;
        let mut changed = false;
        for (id, result) in results {
            let cpm = match result {
                Ok(cpm) => cpm,
                Err(err) => {
                    debug!("cpm_derive_error: id={id} {err}");
                    failed = true;
                    continue;
                }
            };
            if !state.fragments.cpm_pending.contains(id) {
                continue;
            }
            for actuator in state.fragments.actuators.iter_mut().filter(|a| &a.id == id) {
                if actuator.cpm != Some(cpm) {
                    actuator.cpm = Some(cpm);
                    changed = true;
                }
            }
        }
        if failed {
            state.stats.cpm.failures += 1;
        }
        self.settle(&mut state, LoopKind::Cpm, changed);
    }

    /// Health text and process start time.
    pub async fn slow_tick(&self) {
        let result = self.source.health().await;
        let now_ms = self.clock.now_ms();

        let mut state = self.lock();
        if !state.alive {
            return;
        }
        state.stats.slow.ticks += 1;
        let before = state.fragments.system.clone();
        match result {
            Ok(health) => {
                let system = &mut state.fragments.system;
                system.health = Some(health.status.clone());
                if let Some(started_at_ms) = health.started_at_ms() {
                    system.started_at_ms = Some(started_at_ms);
                }
            }
            Err(err) => {
                warn!("health_fetch_error: {err}");
                state.stats.slow.failures += 1;
                state.fragments.system.health = Some(HEALTH_UNREACHABLE.to_string());
            }
        }
        let system = &mut state.fragments.system;
        system.uptime_ms = system
            .started_at_ms
            .map(|started_at_ms| (now_ms - started_at_ms).max(0));
        let changed = *system != before;
        self.settle(&mut state, LoopKind::Slow, changed);
    }

    /// Recomputes uptime locally; no network call.
    pub fn uptime_tick(&self) {
        let now_ms = self.clock.now_ms();
        let mut state = self.lock();
        if !state.alive {
            return;
        }
        state.stats.uptime.ticks += 1;
        let Some(started_at_ms) = state.fragments.system.started_at_ms else {
            return;
        };
        let uptime = Some((now_ms - started_at_ms).max(0));
        let changed = state.fragments.system.uptime_ms != uptime;
        state.fragments.system.uptime_ms = uptime;
        self.settle(&mut state, LoopKind::Uptime, changed);
    }

    /// Secondary sensor feed. The first listed id is kept for the session.
    pub async fn aux_tick(&self) {
        let cached = self.lock().fragments.aux_id.clone();
        let id = match cached {
            Some(id) => id,
            None => {
                let ids = match self.source.aux_sensor_ids().await {
                    Ok(ids) => ids,
                    Err(err) => {
                        self.record_failure(LoopKind::Aux, &err);
                        return;
                    }
                };
                let Some(first) = ids.into_iter().next() else {
                    debug!("aux_ids_empty");
                    return;
                };
                let mut state = self.lock();
                if !state.alive {
                    return;
                }
                let chosen = state.fragments.aux_id.get_or_insert(first).clone();
                info!("aux_sensor_selected: id={chosen}");
                chosen
            }
        };

        let result = self.source.aux_latest(&id).await;
        let mut state = self.lock();
        if !state.alive {
            return;
        }
        state.stats.aux.ticks += 1;
        let changed = match result {
            Ok(reading) => {
                let changed = state.fragments.aux.as_ref() != Some(&reading);
                state.fragments.aux = Some(reading);
                changed
            }
            Err(err) => {
                warn!("aux_fetch_error: id={id} {err}");
                state.stats.aux.failures += 1;
                false
            }
        };
        self.settle(&mut state, LoopKind::Aux, changed);
    }
}

fn compose_actuators(
    latches: &mut LatchTable,
    live: &LiveStateResponse,
    derived_cpm: &HashMap<String, f64>,
    now_ms: i64,
) -> Vec<ActuatorSnapshot> {
    let reading_ts = live.ts.unwrap_or(now_ms);
    live.actuators
        .iter()
        .map(|actuator| {
            let reading = actuator.to_reading(reading_ts);
            let observation = Observation::from_reading(&reading);
            let label = latches.observe_with(&reading.id, &observation, now_ms);
            ActuatorSnapshot {
                cpm: actuator
                    .cpm
                    .or_else(|| derived_cpm.get(&reading.id).copied()),
                cycles: actuator.cycles,
                facets: reading.facets,
                state: observation.decoded.state,
                label,
                pending: reading.pending_command,
                fault: reading.fault_flag,
                id: reading.id,
            }
        })
        .collect()
}

fn spawn_loop<F, Fut>(
    composer: Arc<LiveComposer>,
    kind: LoopKind,
    period: Duration,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<LiveComposer>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !composer.is_alive() {
                break;
            }
            tick(composer.clone()).await;
        }
        debug!("composer_loop_exit: loop={}", kind.as_str());
    })
}

/// Owner handle for a started composer. Dropping it stops every loop.
pub struct ComposerHandle {
    composer: Arc<LiveComposer>,
    tasks: Vec<JoinHandle<()>>,
}

impl ComposerHandle {
    pub fn composer(&self) -> &Arc<LiveComposer> {
        &self.composer
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.composer.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.composer.subscribe()
    }

    pub fn select(&self, actuator_id: Option<String>) {
        self.composer.select(actuator_id);
    }

    pub fn stats(&self) -> ComposerStats {
        self.composer.stats()
    }

    /// Idempotent.
    pub fn shutdown(&self) {
        self.composer.shutdown();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for ComposerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
