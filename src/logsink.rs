//! Process-wide log sink registry.
//!
//! Host applications embedding the crate can register a [`LogSink`] to
//! receive the same formatted lines the proxy writes through `tracing`.
//! Emission never blocks a connection task: lines go through a bounded
//! queue and are dropped on overflow.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::{OnceLock, RwLock};
use std::thread;

use tracing::{info, warn};

/// Queue capacity between emitters and the consumer thread. Lines beyond
/// this are dropped rather than backpressuring connection tasks.
const SINK_QUEUE_CAPACITY: usize = 512;

/// Consumer of formatted log lines.
pub trait LogSink: Send + Sync {
    /// Receives one formatted line, without a trailing newline.
    fn on_log(&self, line: &str);
}

static SINK: RwLock<Option<Box<dyn LogSink>>> = RwLock::new(None);
static QUEUE: OnceLock<SyncSender<String>> = OnceLock::new();

/// Register `sink` as the process-wide log consumer, replacing any
/// previous one. The delivery thread is started on first registration and
/// runs until process exit. Panics raised by the sink are swallowed.
pub fn set_log_sink(sink: impl LogSink + 'static) {
    let mut guard = SINK.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = Some(Box::new(sink));
    drop(guard);

    QUEUE.get_or_init(|| {
        let (tx, rx) = sync_channel::<String>(SINK_QUEUE_CAPACITY);
        thread::spawn(move || {
            for line in rx {
                let guard = SINK.read().unwrap_or_else(|poisoned| poisoned.into_inner());
                if let Some(sink) = guard.as_ref() {
                    let _ = catch_unwind(AssertUnwindSafe(|| sink.on_log(&line)));
                }
            }
        });
        tx
    });
}

/// Non-blocking hand-off to the registered sink, if any.
fn forward_to_sink(line: &str) {
    let registered = SINK
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .is_some();
    if !registered {
        return;
    }
    if let Some(tx) = QUEUE.get() {
        match tx.try_send(line.to_string()) {
            Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Connection-event reporter shared by both roles.
///
/// Every line goes to `tracing` and is mirrored to the registered sink.
/// `detail` lines cover per-connection chatter and are suppressed in quiet
/// mode; `report`/`error` lines are always emitted.
pub(crate) struct EventLog {
    quiet: bool,
}

impl EventLog {
    pub(crate) fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    pub(crate) fn report(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        info!("{line}");
        forward_to_sink(line);
    }

    pub(crate) fn error(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        warn!("{line}");
        forward_to_sink(line);
    }

    pub(crate) fn detail(&self, line: impl AsRef<str>) {
        if self.quiet {
            return;
        }
        let line = line.as_ref();
        info!("{line}");
        forward_to_sink(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct Collector {
        lines: Arc<Mutex<Vec<String>>>,
    }

    impl LogSink for Collector {
        fn on_log(&self, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }
    }

    fn wait_for(lines: &Arc<Mutex<Vec<String>>>, marker: &str) -> Vec<String> {
        for _ in 0..100 {
            let seen = lines.lock().unwrap().clone();
            if seen.iter().any(|l| l == marker) {
                return seen;
            }
            thread::sleep(Duration::from_millis(10));
        }
        lines.lock().unwrap().clone()
    }

    // The sink registry is process-wide, so quiet-mode behavior is checked
    // in the same test rather than racing two registrations.
    #[test]
    fn sink_receives_emitted_lines() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        set_log_sink(Collector {
            lines: lines.clone(),
        });

        let events = EventLog::new(false);
        events.report("startup line");
        events.detail("connection line");

        let seen = wait_for(&lines, "connection line");
        assert!(seen.iter().any(|l| l == "startup line"));
        assert!(seen.iter().any(|l| l == "connection line"));

        let quiet = EventLog::new(true);
        quiet.detail("should not appear");
        quiet.report("quiet marker");

        let seen = wait_for(&lines, "quiet marker");
        assert!(seen.iter().any(|l| l == "quiet marker"));
        assert!(!seen.iter().any(|l| l == "should not appear"));
    }
}
