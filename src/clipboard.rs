use anyhow::Result;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Platform clipboard access. The monitor only ever needs plain text.
pub trait ClipboardBackend: Send + 'static {
    fn get_text(&mut self) -> Result<String>;
    fn set_text(&mut self, text: &str) -> Result<()>;
}

pub struct ArboardBackend {
    clipboard: arboard::Clipboard,
}

impl ArboardBackend {
    pub fn new() -> Result<Self> {
        Ok(Self {
            clipboard: arboard::Clipboard::new()?,
        })
    }
}

impl ClipboardBackend for ArboardBackend {
    fn get_text(&mut self) -> Result<String> {
        match self.clipboard.get_text() {
            Ok(text) => Ok(text),
            // Non-text or empty clipboard reads as empty rather than failing
            // the whole observation cycle.
            Err(arboard::Error::ContentNotAvailable) => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn set_text(&mut self, text: &str) -> Result<()> {
        self.clipboard.set_text(text)?;
        Ok(())
    }
}

/// Trailing newlines are insignificant to change detection; everything else
/// is preserved.
fn normalize(raw: &str) -> &str {
    raw.trim_end_matches(['\r', '\n'])
}

/// De-duplication baseline plus the one-shot suppression flag armed by
/// [`Monitor::write`].
#[derive(Debug, Default)]
struct WatchState {
    last_observed: String,
    suppress_next: bool,
}

impl WatchState {
    fn arm_write(&mut self, written: &str) {
        self.last_observed = normalize(written).to_string();
        self.suppress_next = true;
    }

    /// One observation cycle. Returns the text to report when the cycle is a
    /// genuine external change.
    ///
    /// Self-inflicted writes are filtered by the baseline comparison; the
    /// suppression flag is one-shot and cleared on every cycle. A foreign
    /// change landing inside the suppression window still fires. That window
    /// is a best-effort loop breaker, not a guarantee: clipboard backends
    /// give no way to tag the origin of a write.
    fn observe(&mut self, raw: &str) -> Option<String> {
        let normalized = normalize(raw);
        let was_suppressed = self.suppress_next;
        self.suppress_next = false;

        if normalized == self.last_observed {
            return None;
        }
        self.last_observed = normalized.to_string();
        if normalized.is_empty() {
            return None;
        }
        if was_suppressed {
            debug!("external clipboard change landed inside the suppression window");
        }
        Some(normalized.to_string())
    }
}

/// Polls the platform clipboard and reports genuine external changes on the
/// channel handed out by [`Monitor::new`], without echoing back the writes it
/// performed itself.
#[derive(Clone)]
pub struct Monitor {
    backend: Arc<Mutex<Box<dyn ClipboardBackend>>>,
    state: Arc<Mutex<WatchState>>,
    // Shutdown handle for the currently running observation loop, if any.
    // Each start() gets a fresh channel, so a stop/start cycle can never
    // signal the wrong loop generation.
    shutdown: Arc<StdMutex<Option<watch::Sender<bool>>>>,
    changes: mpsc::UnboundedSender<String>,
    poll_interval: Duration,
}

impl Monitor {
    /// The receiver is the change subscription; keep it for as long as the
    /// monitor runs.
    pub fn new(
        backend: Box<dyn ClipboardBackend>,
        poll_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (changes, changes_rx) = mpsc::unbounded_channel();
        let monitor = Self {
            backend: Arc::new(Mutex::new(backend)),
            state: Arc::new(Mutex::new(WatchState::default())),
            shutdown: Arc::new(StdMutex::new(None)),
            changes,
            poll_interval,
        };
        (monitor, changes_rx)
    }

    /// Launch the observation loop. No-op when already running; returns
    /// immediately.
    pub fn start(&self) {
        {
            let Ok(mut guard) = self.shutdown.lock() else {
                return;
            };
            if guard.is_some() {
                return;
            }
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            *guard = Some(shutdown_tx);
            drop(guard);
            self.spawn_observation_loop(shutdown_rx);
        }
        info!("clipboard monitor started");
    }

    fn spawn_observation_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let backend = self.backend.clone();
        let state = self.state.clone();
        let changes = self.changes.clone();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            // Prime the baseline so whatever is already on the clipboard is
            // not reported as a change.
            {
                let initial = backend.lock().await.get_text().unwrap_or_default();
                state.lock().await.last_observed = normalize(&initial).to_string();
            }

            let mut interval = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }

                let text = match backend.lock().await.get_text() {
                    Ok(text) => text,
                    Err(e) => {
                        debug!(error = %e, "clipboard read failed, skipping cycle");
                        continue;
                    }
                };

                if let Some(changed) = state.lock().await.observe(&text) {
                    debug!(len = changed.len(), "clipboard change detected");
                    if changes.send(changed).is_err() {
                        break;
                    }
                }
            }
            debug!("clipboard observation loop ended");
        });
    }

    /// Signal the observation loop to end. Idempotent; the loop terminates
    /// within one poll interval. Only the loop launched by the matching
    /// [`Monitor::start`] is signaled, so a stop/start cycle cannot leave a
    /// stray loop behind.
    pub fn stop(&self) {
        let shutdown = self.shutdown.lock().ok().and_then(|mut guard| guard.take());
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
            info!("clipboard monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Current clipboard content straight from the backend; no effect on the
    /// monitor's state.
    pub async fn read(&self) -> Result<String> {
        self.backend.lock().await.get_text()
    }

    /// Write to the clipboard and arm the suppression window before
    /// returning, so the very next observation cycle does not reinterpret
    /// this write as an external change.
    pub async fn write(&self, text: &str) -> Result<()> {
        self.backend.lock().await.set_text(text)?;
        self.state.lock().await.arm_write(text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    #[derive(Clone, Default)]
    struct MemoryBackend {
        content: Arc<StdMutex<String>>,
        reads: Arc<AtomicUsize>,
    }

    impl MemoryBackend {
        fn put(&self, text: &str) {
            *self.content.lock().unwrap() = text.to_string();
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    impl ClipboardBackend for MemoryBackend {
        fn get_text(&mut self) -> Result<String> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.content.lock().unwrap().clone())
        }

        fn set_text(&mut self, text: &str) -> Result<()> {
            *self.content.lock().unwrap() = text.to_string();
            Ok(())
        }
    }

    #[test]
    fn test_genuine_change_fires_exactly_once() {
        let mut state = WatchState::default();
        assert_eq!(state.observe("hello"), Some("hello".to_string()));
        assert_eq!(state.observe("hello"), None);
    }

    #[test]
    fn test_trailing_newlines_are_insignificant() {
        let mut state = WatchState::default();
        assert_eq!(state.observe("hello\n"), Some("hello".to_string()));
        assert_eq!(state.observe("hello\r\n"), None);
        assert_eq!(state.observe("hello"), None);
        // interior whitespace is preserved
        assert_eq!(state.observe("  a \n b\n"), Some("  a \n b".to_string()));
    }

    #[test]
    fn test_self_write_is_suppressed_for_one_cycle() {
        let mut state = WatchState::default();
        assert_eq!(state.observe("before"), Some("before".to_string()));

        state.arm_write("written\n");
        assert_eq!(state.observe("written\n"), None);
        assert!(!state.suppress_next);

        // a later genuine change still fires
        assert_eq!(state.observe("after"), Some("after".to_string()));
    }

    #[test]
    fn test_external_change_in_suppression_window_still_fires() {
        let mut state = WatchState::default();
        state.arm_write("written");
        assert_eq!(state.observe("external"), Some("external".to_string()));
        assert!(!state.suppress_next);
    }

    #[test]
    fn test_empty_content_never_fires() {
        let mut state = WatchState::default();
        assert_eq!(state.observe(""), None);
        assert_eq!(state.observe("x"), Some("x".to_string()));
        assert_eq!(state.observe("\r\n"), None);
        assert_eq!(state.observe(""), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_reports_external_change_and_skips_own_write() {
        let backend = MemoryBackend::default();
        let (monitor, mut changes) =
            Monitor::new(Box::new(backend.clone()), DEFAULT_POLL_INTERVAL);
        monitor.start();
        monitor.start(); // idempotent
        // let the observation loop prime its baseline first
        tokio::time::sleep(Duration::from_millis(50)).await;

        backend.put("copied elsewhere\n");
        let reported = timeout(Duration::from_secs(5), changes.recv())
            .await
            .expect("change should be reported")
            .unwrap();
        assert_eq!(reported, "copied elsewhere");

        monitor.write("from the network").await.unwrap();
        assert_eq!(monitor.read().await.unwrap(), "from the network");
        // nothing may be reported for our own write
        assert!(timeout(Duration::from_secs(2), changes.recv())
            .await
            .is_err());

        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_does_not_leak_the_previous_observation_loop() {
        let backend = MemoryBackend::default();
        let (monitor, _changes) =
            Monitor::new(Box::new(backend.clone()), DEFAULT_POLL_INTERVAL);
        monitor.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop();
        monitor.start();
        assert!(monitor.is_running());
        // let the old loop wind down and the new one prime its baseline
        tokio::time::sleep(Duration::from_millis(50)).await;

        let before = backend.reads();
        tokio::time::sleep(Duration::from_secs(5)).await;
        let polls = backend.reads() - before;
        // one loop polls ~10 times in 5 s at the default interval; a leaked
        // pre-restart loop would double that
        assert!(
            polls <= 11,
            "observed {polls} polls in 5s, more than one loop is alive"
        );
        assert!(
            polls >= 9,
            "observed {polls} polls in 5s, the restarted loop is not polling"
        );

        monitor.stop();
        assert!(!monitor.is_running());
    }
}
