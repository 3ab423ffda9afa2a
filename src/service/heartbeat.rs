use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::docker::{ContainerRuntime, DockerError};
use crate::skydns::ServiceDescriptor;

use super::registration::{RegistrationService, RenewOutcome};
use super::{ServiceKey, SyncError};

/// Consecutive failed beats after which a loop gives up.
pub const ERROR_BUDGET: u32 = 10;

/// Beats at least this long are logged at info level.
const QUIET_BEAT: Duration = Duration::from_secs(30);

/// Renew a quarter of the TTL before it expires.
pub fn default_beat(ttl_seconds: u32) -> Duration {
    let ttl = u64::from(ttl_seconds);
    Duration::from_secs((ttl - ttl / 4).max(1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatExit {
    /// The container stopped or was removed, its entry was deregistered.
    Stopped,
    /// The registry no longer knows the key.
    Vanished,
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("Giving up on {key} after {failures} consecutive failures, last: {last}")]
    ErrorBudgetExhausted {
        key: ServiceKey,
        failures: u32,
        #[source]
        last: SyncError,
    },
}

/// A live renewal loop as seen from the [`RunningSet`].
struct LoopEntry {
    generation: u64,
    /// Set when a start for the key arrived while this loop ran.
    restarted: bool,
}

#[derive(Default)]
struct Loops {
    next_generation: u64,
    entries: HashMap<ServiceKey, LoopEntry>,
}

/// Keys with a live renewal loop.
#[derive(Default)]
struct RunningSet {
    loops: Mutex<Loops>,
}

impl RunningSet {
    fn lock(&self) -> MutexGuard<'_, Loops> {
        // The map stays consistent even if a holder panicked
        self.loops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn contains(&self, key: &ServiceKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    fn len(&self) -> usize {
        self.lock().entries.len()
    }
}

/// Membership of one key in the [`RunningSet`], released on drop.
///
/// The guard moves into the loop's task, so the key leaves the set on every
/// exit path, including cancellation and the task being aborted. It only ever
/// removes the entry of its own generation.
struct RunningGuard {
    running: Arc<RunningSet>,
    key: ServiceKey,
    generation: u64,
}

impl RunningGuard {
    /// Inserts `key` unless a loop already owns it, in which case that loop is
    /// told about the new start.
    fn acquire(running: &Arc<RunningSet>, key: ServiceKey) -> Option<Self> {
        let mut loops = running.lock();
        if let Some(entry) = loops.entries.get_mut(&key) {
            entry.restarted = true;
            return None;
        }
        let generation = loops.next_generation;
        loops.next_generation += 1;
        loops.entries.insert(
            key.clone(),
            LoopEntry {
                generation,
                restarted: false,
            },
        );
        Some(Self {
            running: Arc::clone(running),
            key,
            generation,
        })
    }

    fn clear_restart(&self) {
        let mut loops = self.running.lock();
        if let Some(entry) = loops
            .entries
            .get_mut(&self.key)
            .filter(|entry| entry.generation == self.generation)
        {
            entry.restarted = false;
        }
    }

    /// Leaves the set unless a start arrived meanwhile.
    ///
    /// Returns false, and keeps the entry, when the loop has to carry on.
    /// Checking and removing under one lock means a later start always finds
    /// either this loop still owning the key or an empty slot.
    fn release(&self) -> bool {
        let mut loops = self.running.lock();
        match loops.entries.get_mut(&self.key) {
            Some(entry) if entry.generation == self.generation => {
                if entry.restarted {
                    entry.restarted = false;
                    return false;
                }
                loops.entries.remove(&self.key);
                true
            }
            _ => true,
        }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut loops = self.running.lock();
        if loops
            .entries
            .get(&self.key)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            loops.entries.remove(&self.key);
        }
    }
}

/// Owns the renewal loops, at most one per key.
pub struct HeartbeatManager {
    runtime: Arc<dyn ContainerRuntime>,
    registration: Arc<RegistrationService>,
    running: Arc<RunningSet>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl HeartbeatManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registration: Arc<RegistrationService>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            registration,
            running: Arc::default(),
            shutdown,
            tracker: TaskTracker::new(),
        }
    }

    /// Spawns a renewal loop for `key` unless one is already running.
    ///
    /// Returns whether a loop was started. A loop already running for `key`
    /// is marked as restarted instead, so it re-registers rather than exits
    /// if it was just removing the entry. Nothing starts once shutdown began.
    pub fn start(
        &self,
        key: ServiceKey,
        descriptor: &ServiceDescriptor,
        ttl_seconds: u32,
        beat: Duration,
    ) -> bool {
        if self.shutdown.is_cancelled() {
            log::debug!("Not starting a heartbeat for {key} during shutdown");
            return false;
        }

        let cancel = self.shutdown.child_token();
        let Some(membership) = RunningGuard::acquire(&self.running, key.clone()) else {
            log::debug!("Heartbeat for {key} is already running");
            return false;
        };

        let renewal = Renewal {
            key,
            descriptor: descriptor.clone(),
            ttl_seconds,
            beat,
            runtime: Arc::clone(&self.runtime),
            registration: Arc::clone(&self.registration),
            membership,
        };

        log::debug!(
            "Starting heartbeat for {} ({}) every {:?}",
            renewal.key,
            renewal.descriptor.name,
            beat
        );

        self.tracker.spawn(async move {
            match renewal.run(cancel).await {
                Ok(HeartbeatExit::Cancelled) => {
                    log::debug!("Heartbeat for {} cancelled", renewal.key)
                }
                Ok(exit) => log::info!("Heartbeat for {} finished: {exit:?}", renewal.key),
                Err(e) => log::error!("{e}"),
            }
        });

        true
    }

    #[cfg(test)]
    pub fn is_running(&self, key: &ServiceKey) -> bool {
        self.running.contains(key)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Cancels every loop and waits for all of them to exit.
    ///
    /// Cancelled loops leave their entries registered.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        log::info!("All heartbeats stopped");
    }
}

struct Renewal {
    key: ServiceKey,
    descriptor: ServiceDescriptor,
    ttl_seconds: u32,
    beat: Duration,
    runtime: Arc<dyn ContainerRuntime>,
    registration: Arc<RegistrationService>,
    membership: RunningGuard,
}

impl Renewal {
    async fn run(&self, cancel: CancellationToken) -> Result<HeartbeatExit, HeartbeatError> {
        let mut ticker = time::interval_at(Instant::now() + self.beat, self.beat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(HeartbeatExit::Cancelled),
                _ = ticker.tick() => {}
            }

            // Only starts seen during this beat count
            self.membership.clear_restart();

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(HeartbeatExit::Cancelled),
                result = self.beat() => result,
            };

            let exit = match result {
                Ok(Some(exit)) => Ok(exit),
                Ok(None) => {
                    failures = 0;
                    continue;
                }
                Err(last) => {
                    failures += 1;
                    log::warn!(
                        "Heartbeat for {} failed ({failures}/{ERROR_BUDGET}): {last}",
                        self.key
                    );
                    if failures < ERROR_BUDGET {
                        continue;
                    }
                    Err(HeartbeatError::ErrorBudgetExhausted {
                        key: self.key.clone(),
                        failures,
                        last,
                    })
                }
            };

            if self.membership.release() {
                return exit;
            }

            log::info!("{} ({}) was started again, resuming", self.key, self.descriptor.name);
            failures = 0;
            if let Err(e) = self.resume().await {
                log::warn!("Unable to resume the heartbeat for {}: {e}", self.key);
            }
        }
    }

    /// One tick. `Some` ends the loop.
    async fn beat(&self) -> Result<Option<HeartbeatExit>, SyncError> {
        if !self.is_running().await? {
            log::info!("{} ({}) is no longer running", self.key, self.descriptor.name);
            if let Err(e) = self.registration.deregister(&self.key).await {
                log::error!("Failed to remove {} from the registry: {e}", self.key);
            }
            return Ok(Some(HeartbeatExit::Stopped));
        }

        match self.registration.renew(&self.key, self.ttl_seconds).await? {
            RenewOutcome::Renewed => {
                let name = &self.descriptor.name;
                if self.beat >= QUIET_BEAT {
                    log::info!("Renewed {} ({name}) for {}s", self.key, self.ttl_seconds);
                } else {
                    log::debug!("Renewed {} ({name}) for {}s", self.key, self.ttl_seconds);
                }
                Ok(None)
            }
            RenewOutcome::NotFound => {
                log::warn!("{} ({}) vanished from the registry", self.key, self.descriptor.name);
                Ok(Some(HeartbeatExit::Vanished))
            }
        }
    }

    async fn is_running(&self) -> Result<bool, SyncError> {
        match self.runtime.fetch_container(self.key.as_str(), "").await {
            Ok(snapshot) => Ok(snapshot.running),
            Err(DockerError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Puts the entry back after a start raced with this loop's exit.
    ///
    /// A container that stopped again is left for the next beat.
    async fn resume(&self) -> Result<(), SyncError> {
        if self.is_running().await? {
            self.registration
                .register(&self.key, &self.descriptor)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRegistry, FakeRuntime, redis_snapshot};
    use std::sync::atomic::Ordering;
    use tokio::sync::Barrier;
    use tokio::task::JoinSet;

    const BEAT: Duration = Duration::from_secs(10);

    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor {
            name: "redis".to_string(),
            instance: "redis1".to_string(),
            host: "192.168.1.10".to_string(),
            environment: "production".to_string(),
            ttl_seconds: 30,
            port: 80,
        }
    }

    fn key() -> ServiceKey {
        ServiceKey::from_container_id("abcdef0123456789")
    }

    struct Fixture {
        runtime: Arc<FakeRuntime>,
        registry: Arc<FakeRegistry>,
        manager: HeartbeatManager,
    }

    fn fixture() -> Fixture {
        let runtime = Arc::new(FakeRuntime::with([redis_snapshot()]));
        let registry = Arc::new(FakeRegistry::default());
        registry.insert("abcdef0123", descriptor());
        let registration = Arc::new(RegistrationService::new(registry.clone(), "skydns.local"));
        let manager =
            HeartbeatManager::new(runtime.clone(), registration, CancellationToken::new());
        Fixture {
            runtime,
            registry,
            manager,
        }
    }

    #[test]
    fn test_default_beat() {
        assert_eq!(default_beat(60), Duration::from_secs(45));
        assert_eq!(default_beat(30), Duration::from_secs(23));
        assert_eq!(default_beat(1), Duration::from_secs(1));
        assert_eq!(default_beat(0), Duration::from_secs(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_run_one_loop() {
        const CALLERS: usize = 64;
        let f = fixture();
        let manager = Arc::new(f.manager);
        let barrier = Arc::new(Barrier::new(CALLERS));

        let mut callers = JoinSet::new();
        for _ in 0..CALLERS {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            callers.spawn(async move {
                barrier.wait().await;
                manager.start(key(), &descriptor(), 30, BEAT)
            });
        }
        let mut started = 0;
        while let Some(result) = callers.join_next().await {
            if result.expect("caller panicked") {
                started += 1;
            }
        }

        assert_eq!(started, 1);
        assert_eq!(manager.running_count(), 1);
        manager.shutdown().await;
        assert_eq!(manager.running_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_starts_keep_renewing() {
        let f = fixture();

        let started = (0..5)
            .filter(|_| f.manager.start(key(), &descriptor(), 30, BEAT))
            .count();
        assert_eq!(started, 1);

        time::sleep(BEAT * 3 + Duration::from_secs(5)).await;
        assert_eq!(f.registry.updates(), 3);
        assert!(f.manager.is_running(&key()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_during_slow_deregister_resumes_loop() {
        let f = fixture();
        f.manager.start(key(), &descriptor(), 30, BEAT);
        f.runtime.set_running("abcdef0123456789", false);
        f.registry.slow_deletes(Duration::from_secs(3));

        // The first beat is now removing the entry
        time::sleep(BEAT + Duration::from_secs(1)).await;
        f.runtime.set_running("abcdef0123456789", true);
        assert!(!f.manager.start(key(), &descriptor(), 30, BEAT));

        time::sleep(Duration::from_secs(5)).await;
        assert!(f.manager.is_running(&key()));
        assert_eq!(f.registry.get("abcdef0123"), Some(descriptor()));

        time::sleep(BEAT).await;
        assert_eq!(f.registry.updates(), 1);
        assert!(f.manager.is_running(&key()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_deregister_without_restart_exits() {
        let f = fixture();
        f.manager.start(key(), &descriptor(), 30, BEAT);
        f.runtime.set_running("abcdef0123456789", false);
        f.registry.slow_deletes(Duration::from_secs(3));

        time::sleep(BEAT + Duration::from_secs(5)).await;

        assert!(!f.manager.is_running(&key()));
        assert!(f.registry.get("abcdef0123").is_none());
    }

    #[test]
    fn test_stale_guard_keeps_newer_entry() {
        let running = Arc::new(RunningSet::default());
        let old = RunningGuard::acquire(&running, key()).expect("first loop");
        assert!(old.release());

        let new = RunningGuard::acquire(&running, key()).expect("second loop");
        drop(old);
        assert!(running.contains(&key()));

        drop(new);
        assert_eq!(running.len(), 0);
    }

    #[test]
    fn test_release_defers_to_a_pending_start() {
        let running = Arc::new(RunningSet::default());
        let guard = RunningGuard::acquire(&running, key()).expect("first loop");
        assert!(RunningGuard::acquire(&running, key()).is_none());

        assert!(!guard.release());
        assert!(running.contains(&key()));
        assert!(guard.release());
        assert!(!running.contains(&key()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_beat_fires_after_one_interval() {
        let f = fixture();
        f.manager.start(key(), &descriptor(), 30, BEAT);

        time::sleep(BEAT - Duration::from_secs(1)).await;
        assert_eq!(f.registry.updates(), 0);

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.registry.updates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exits_after_exactly_ten_failures() {
        let f = fixture();
        f.registry.fail_updates(true);
        f.manager.start(key(), &descriptor(), 30, BEAT);

        time::sleep(BEAT * (ERROR_BUDGET - 1) + Duration::from_secs(5)).await;
        assert!(f.manager.is_running(&key()));

        time::sleep(BEAT).await;
        assert!(!f.manager.is_running(&key()));
        assert_eq!(f.registry.updates(), ERROR_BUDGET as usize);

        time::sleep(BEAT * 5).await;
        assert_eq!(f.registry.updates(), ERROR_BUDGET as usize);
        // Giving up does not deregister
        assert!(f.registry.get("abcdef0123").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let f = fixture();
        f.registry.fail_updates(true);
        f.manager.start(key(), &descriptor(), 30, BEAT);

        time::sleep(BEAT * 5 + Duration::from_secs(5)).await;
        f.registry.fail_updates(false);
        time::sleep(BEAT).await;
        f.registry.fail_updates(true);
        time::sleep(BEAT * 9).await;

        assert!(f.manager.is_running(&key()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failures_count_against_budget() {
        let f = fixture();
        f.runtime.fail_fetches(true);
        f.manager.start(key(), &descriptor(), 30, BEAT);

        time::sleep(BEAT * ERROR_BUDGET + Duration::from_secs(5)).await;

        assert!(!f.manager.is_running(&key()));
        assert_eq!(f.runtime.fetches.load(Ordering::SeqCst), ERROR_BUDGET as usize);
        assert_eq!(f.registry.updates(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_container_is_deregistered() {
        let f = fixture();
        f.manager.start(key(), &descriptor(), 30, BEAT);
        f.runtime.set_running("abcdef0123456789", false);

        time::sleep(BEAT + Duration::from_secs(1)).await;

        assert!(f.registry.get("abcdef0123").is_none());
        assert!(!f.manager.is_running(&key()));
        assert_eq!(f.registry.updates(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_container_is_deregistered() {
        let f = fixture();
        f.manager.start(key(), &descriptor(), 30, BEAT);
        f.runtime.remove("abcdef0123456789");

        time::sleep(BEAT + Duration::from_secs(1)).await;

        assert!(f.registry.get("abcdef0123").is_none());
        assert!(!f.manager.is_running(&key()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_entry_stops_renewing() {
        let f = fixture();
        f.manager.start(key(), &descriptor(), 30, BEAT);
        f.registry.evict("abcdef0123");

        time::sleep(BEAT + Duration::from_secs(1)).await;
        assert!(!f.manager.is_running(&key()));
        assert_eq!(f.registry.deletes.load(Ordering::SeqCst), 0);

        time::sleep(BEAT * 3).await;
        assert_eq!(f.registry.updates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_without_deregistering() {
        let f = fixture();
        f.manager.start(key(), &descriptor(), 30, BEAT);

        f.manager.shutdown().await;

        assert_eq!(f.manager.running_count(), 0);
        assert!(f.registry.get("abcdef0123").is_some());
        assert_eq!(f.registry.deletes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_start_after_shutdown() {
        let f = fixture();
        f.manager.shutdown().await;

        assert!(!f.manager.start(key(), &descriptor(), 30, BEAT));
        assert_eq!(f.manager.running_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_can_restart_after_loop_exits() {
        let f = fixture();
        f.registry.evict("abcdef0123");
        f.manager.start(key(), &descriptor(), 30, BEAT);
        time::sleep(BEAT + Duration::from_secs(1)).await;
        assert!(!f.manager.is_running(&key()));

        f.registry.insert("abcdef0123", descriptor());
        assert!(f.manager.start(key(), &descriptor(), 30, BEAT));
        assert!(f.manager.is_running(&key()));
    }
}
