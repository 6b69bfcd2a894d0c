//! Shutdown coordination
//!
//! One authoritative answer to "should I stop?". Workers poll a lock-free
//! flag; signal handlers use a dedicated lock-free request path and never
//! touch the coordinator lock. Graceful shutdown runs cleanup callbacks in
//! registration order, stops components, then joins registered threads with
//! a bounded per-thread timeout.

use crate::core::clock::now_s;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// How many heartbeats the ring buffer retains.
const BEAT_BUFFER: usize = 200;

/// Poll granularity for `wait_for_shutdown`; sub-second so signals are
/// honored promptly.
const WAIT_POLL: Duration = Duration::from_millis(100);

/// A shutdown request. The first request wins; later ones are counted and
/// ignored.
#[derive(Debug, Clone)]
pub struct ShutdownRequest {
    pub reason: String,
    pub initiator: String,
    pub message: Option<String>,
    pub emergency: bool,
}

impl ShutdownRequest {
    pub fn graceful(reason: impl Into<String>, initiator: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            initiator: initiator.into(),
            message: None,
            emergency: false,
        }
    }

    pub fn emergency(reason: impl Into<String>, initiator: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            initiator: initiator.into(),
            message: None,
            emergency: true,
        }
    }
}

/// Anything the coordinator can ask to stop during graceful shutdown.
/// Implementations must be idempotent.
pub trait Stoppable: Send + Sync {
    fn stop(&self);
}

#[derive(Debug, Clone)]
pub struct Beat {
    pub label: String,
    pub thread: String,
    pub at: Instant,
    pub epoch_s: i64,
}

#[derive(Debug, Clone)]
pub struct ShutdownStatus {
    pub requested: bool,
    pub emergency: bool,
    pub reason: Option<String>,
    pub components: Vec<String>,
    pub threads: Vec<String>,
    pub recent_beats: Vec<String>,
    pub duplicate_requests: u64,
}

type Callback = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct CoordinatorState {
    components: Vec<(String, Arc<dyn Stoppable>)>,
    threads: Vec<(String, JoinHandle<()>)>,
    callbacks: Vec<Callback>,
    request: Option<ShutdownRequest>,
    beats: VecDeque<Beat>,
}

#[derive(Debug, Clone)]
pub struct JoinConfig {
    /// Extra settle time after the flag is set, before joins begin
    pub join_grace: Duration,
    /// Per-thread join timeout
    pub join_timeout: Duration,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            join_grace: Duration::ZERO,
            join_timeout: Duration::from_secs(3),
        }
    }
}

struct CoordinatorInner {
    flag: AtomicBool,
    emergency: AtomicBool,
    duplicate_requests: AtomicU64,
    // Reentrant so a cleanup callback may call a read accessor without
    // deadlocking against the executing shutdown.
    state: ReentrantMutex<RefCell<CoordinatorState>>,
    join_config: JoinConfig,
}

/// Cloneable handle to the process-wide coordinator.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(JoinConfig::default())
    }
}

impl ShutdownCoordinator {
    pub fn new(join_config: JoinConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                flag: AtomicBool::new(false),
                emergency: AtomicBool::new(false),
                duplicate_requests: AtomicU64::new(0),
                state: ReentrantMutex::new(RefCell::new(CoordinatorState::default())),
                join_config,
            }),
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    pub fn register_component(&self, name: impl Into<String>, component: Arc<dyn Stoppable>) {
        let guard = self.inner.state.lock();
        guard.borrow_mut().components.push((name.into(), component));
    }

    pub fn register_thread(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        let guard = self.inner.state.lock();
        guard.borrow_mut().threads.push((name.into(), handle));
    }

    /// Callbacks run FIFO during graceful shutdown. They must be idempotent
    /// and must not request shutdown themselves.
    pub fn add_cleanup_callback(&self, callback: impl FnMut() + Send + 'static) {
        let guard = self.inner.state.lock();
        guard.borrow_mut().callbacks.push(Box::new(callback));
    }

    /// Best-effort SIGINT/SIGTERM hookup. On platforms where installation
    /// fails the coordinator degrades to the polled flag.
    pub fn install_signal_handlers(&self) {
        let coordinator = self.clone();
        let result = ctrlc::set_handler(move || {
            coordinator.signal_shutdown();
        });
        if let Err(e) = result {
            warn!(error = %e, "signal handler installation failed, polled flag only");
        }
    }

    // ========================================================================
    // Requests and flag
    // ========================================================================

    /// Lock-free request path for signal handlers. Only flips atomics.
    pub fn signal_shutdown(&self) {
        if self.inner.flag.swap(true, Ordering::SeqCst) {
            self.inner.duplicate_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// File a shutdown request. Returns true when this request won.
    pub fn request_shutdown(&self, request: ShutdownRequest) -> bool {
        let guard = self.inner.state.lock();
        let mut state = guard.borrow_mut();
        if self.inner.flag.load(Ordering::SeqCst) || state.request.is_some() {
            self.inner.duplicate_requests.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        info!(
            reason = %request.reason,
            initiator = %request.initiator,
            emergency = request.emergency,
            "shutdown requested"
        );
        if request.emergency {
            self.inner.emergency.store(true, Ordering::SeqCst);
        }
        state.request = Some(request);
        self.inner.flag.store(true, Ordering::SeqCst);
        true
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.inner.flag.load(Ordering::Relaxed)
    }

    /// Block until shutdown or timeout; true when shutdown was requested.
    pub fn wait_for_shutdown(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.is_shutdown_requested() {
                return true;
            }
            if let Some(d) = deadline {
                let now = Instant::now();
                if now >= d {
                    return false;
                }
                std::thread::sleep(WAIT_POLL.min(d - now));
            } else {
                std::thread::sleep(WAIT_POLL);
            }
        }
    }

    // ========================================================================
    // Heartbeats
    // ========================================================================

    /// Record a liveness beat for the calling thread.
    pub fn beat(&self, label: &str) {
        let thread = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        let guard = self.inner.state.lock();
        let mut state = guard.borrow_mut();
        if state.beats.len() >= BEAT_BUFFER {
            state.beats.pop_front();
        }
        state.beats.push_back(Beat {
            label: label.to_string(),
            thread,
            at: Instant::now(),
            epoch_s: now_s(),
        });
    }

    pub fn last_beat(&self) -> Option<Beat> {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        state.beats.back().cloned()
    }

    /// Background watcher: warns `HEARTBEAT_LATE` when no beat arrived within
    /// `timeout_threshold`; with `auto_shutdown` it then files a request.
    pub fn spawn_heartbeat_monitor(
        &self,
        check_interval: Duration,
        timeout_threshold: Duration,
        auto_shutdown: bool,
    ) -> JoinHandle<()> {
        let coordinator = self.clone();
        std::thread::Builder::new()
            .name("heartbeat-monitor".to_string())
            .spawn(move || {
                while !coordinator.wait_for_shutdown(Some(check_interval)) {
                    let last = coordinator.last_beat();
                    match last {
                        Some(beat) if beat.at.elapsed() > timeout_threshold => {
                            warn!(
                                last_label = %beat.label,
                                last_thread = %beat.thread,
                                age_s = beat.at.elapsed().as_secs(),
                                "HEARTBEAT_LATE"
                            );
                            if auto_shutdown {
                                coordinator.request_shutdown(ShutdownRequest::graceful(
                                    "HEARTBEAT_TIMEOUT",
                                    "heartbeat-monitor",
                                ));
                            }
                        }
                        _ => {}
                    }
                }
            })
            .expect("heartbeat monitor thread spawn")
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run the graceful sequence: callbacks (FIFO) -> component stops ->
    /// thread joins. Emergency shutdown skips callbacks and stops.
    /// Returns true when every registered thread joined in time.
    pub fn execute_graceful_shutdown(&self) -> bool {
        self.inner.flag.store(true, Ordering::SeqCst);
        let emergency = self.inner.emergency.load(Ordering::SeqCst);

        let (callbacks, components, threads) = {
            let guard = self.inner.state.lock();
            let mut state = guard.borrow_mut();
            (
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.components),
                std::mem::take(&mut state.threads),
            )
        };

        if emergency {
            warn!("emergency shutdown: skipping callbacks and component stops");
        } else {
            for (idx, mut callback) in callbacks.into_iter().enumerate() {
                info!(idx, "running cleanup callback");
                callback();
            }
            for (name, component) in &components {
                info!(component = %name, "stopping component");
                component.stop();
            }
        }

        if !self.inner.join_config.join_grace.is_zero() {
            std::thread::sleep(self.inner.join_config.join_grace);
        }

        let mut all_joined = true;
        for (name, handle) in threads {
            let deadline = Instant::now() + self.inner.join_config.join_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!(thread = %name, "thread panicked before join");
                }
            } else {
                // Never raises; the thread is abandoned and the process exit
                // reaps it.
                warn!(thread = %name, "SHUTDOWN_FORCE: join timeout");
                all_joined = false;
            }
        }
        info!(all_joined, "graceful shutdown complete");
        all_joined
    }

    pub fn status(&self) -> ShutdownStatus {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        ShutdownStatus {
            requested: self.is_shutdown_requested(),
            emergency: self.inner.emergency.load(Ordering::SeqCst),
            reason: state.request.as_ref().map(|r| r.reason.clone()),
            components: state.components.iter().map(|(n, _)| n.clone()).collect(),
            threads: state.threads.iter().map(|(n, _)| n.clone()).collect(),
            recent_beats: state
                .beats
                .iter()
                .rev()
                .take(10)
                .map(|b| format!("{}@{} ({})", b.label, b.epoch_s, b.thread))
                .collect(),
            duplicate_requests: self.inner.duplicate_requests.load(Ordering::Relaxed),
        }
    }

}

/// A standalone `Arc<AtomicBool>` kept in sync with the coordinator flag by
/// construction: callers that only need fail-fast semantics (the exchange
/// retry decorator) receive this instead of the full coordinator.
pub fn watch_flag(coordinator: &ShutdownCoordinator) -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(coordinator.is_shutdown_requested()));
    let mirror = flag.clone();
    let coordinator = coordinator.clone();
    std::thread::Builder::new()
        .name("shutdown-flag-mirror".to_string())
        .spawn(move || {
            coordinator.wait_for_shutdown(None);
            mirror.store(true, Ordering::SeqCst);
        })
        .expect("flag mirror thread spawn");
    flag
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingComponent {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Stoppable for RecordingComponent {
        fn stop(&self) {
            self.log.lock().push(format!("stop:{}", self.name));
        }
    }

    #[test]
    fn test_first_request_wins_duplicates_counted() {
        let coord = ShutdownCoordinator::default();
        assert!(coord.request_shutdown(ShutdownRequest::graceful("A", "test")));
        assert!(!coord.request_shutdown(ShutdownRequest::graceful("B", "test")));
        assert!(!coord.request_shutdown(ShutdownRequest::graceful("C", "test")));

        let status = coord.status();
        assert_eq!(status.reason.as_deref(), Some("A"));
        assert_eq!(status.duplicate_requests, 2);
        assert!(coord.is_shutdown_requested());
    }

    #[test]
    fn test_graceful_ordering_callbacks_then_components() {
        let coord = ShutdownCoordinator::default();
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        for name in ["A", "B", "C"] {
            let log = log.clone();
            coord.add_cleanup_callback(move || log.lock().push(format!("cb:{name}")));
        }
        coord.register_component(
            "X",
            Arc::new(RecordingComponent {
                name: "X",
                log: log.clone(),
            }),
        );
        coord.register_component(
            "Y",
            Arc::new(RecordingComponent {
                name: "Y",
                log: log.clone(),
            }),
        );

        coord.request_shutdown(ShutdownRequest::graceful("done", "test"));
        assert!(coord.execute_graceful_shutdown());

        let entries = log.lock().clone();
        assert_eq!(
            entries,
            vec!["cb:A", "cb:B", "cb:C", "stop:X", "stop:Y"]
        );
    }

    #[test]
    fn test_emergency_skips_callbacks_and_stops() {
        let coord = ShutdownCoordinator::default();
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let log = log.clone();
            coord.add_cleanup_callback(move || log.lock().push("cb".to_string()));
        }
        coord.register_component(
            "X",
            Arc::new(RecordingComponent {
                name: "X",
                log: log.clone(),
            }),
        );

        coord.request_shutdown(ShutdownRequest::emergency("panic", "test"));
        coord.execute_graceful_shutdown();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_thread_join_within_timeout() {
        let coord = ShutdownCoordinator::new(JoinConfig {
            join_grace: Duration::ZERO,
            join_timeout: Duration::from_secs(2),
        });
        let worker = {
            let coord = coord.clone();
            std::thread::Builder::new()
                .name("worker".to_string())
                .spawn(move || {
                    coord.wait_for_shutdown(None);
                })
                .unwrap()
        };
        coord.register_thread("worker", worker);
        coord.request_shutdown(ShutdownRequest::graceful("bye", "test"));
        assert!(coord.execute_graceful_shutdown());
    }

    #[test]
    fn test_join_timeout_does_not_raise() {
        let coord = ShutdownCoordinator::new(JoinConfig {
            join_grace: Duration::ZERO,
            join_timeout: Duration::from_millis(50),
        });
        let stubborn = std::thread::Builder::new()
            .name("stubborn".to_string())
            .spawn(|| std::thread::sleep(Duration::from_secs(5)))
            .unwrap();
        coord.register_thread("stubborn", stubborn);
        coord.request_shutdown(ShutdownRequest::graceful("bye", "test"));
        assert!(!coord.execute_graceful_shutdown());
    }

    #[test]
    fn test_wait_for_shutdown_timeout() {
        let coord = ShutdownCoordinator::default();
        let start = Instant::now();
        assert!(!coord.wait_for_shutdown(Some(Duration::from_millis(150))));
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_beats_are_ring_buffered() {
        let coord = ShutdownCoordinator::default();
        for i in 0..250 {
            coord.beat(&format!("b{i}"));
        }
        let last = coord.last_beat().unwrap();
        assert_eq!(last.label, "b249");
        let guard = coord.inner.state.lock();
        assert_eq!(guard.borrow().beats.len(), BEAT_BUFFER);
    }

    #[test]
    fn test_signal_path_sets_flag_lock_free() {
        let coord = ShutdownCoordinator::default();
        coord.signal_shutdown();
        assert!(coord.is_shutdown_requested());
        coord.signal_shutdown();
        assert_eq!(coord.status().duplicate_requests, 1);
    }

    #[test]
    fn test_watch_flag_mirrors() {
        let coord = ShutdownCoordinator::default();
        let flag = watch_flag(&coord);
        assert!(!flag.load(Ordering::SeqCst));
        coord.signal_shutdown();
        // Mirror thread wakes within the poll interval
        let deadline = Instant::now() + Duration::from_secs(2);
        while !flag.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(flag.load(Ordering::SeqCst));
    }
}
