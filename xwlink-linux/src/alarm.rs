//! The one OS-level alarm behind the scheduler, as a tokio task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use xwlink_core::scheduler::{AlarmSink, Clock};
use xwlink_core::Scheduler;

/// Holds the armed epoch-ms fire time (None when cancelled).
pub struct TokioAlarm {
    tx: watch::Sender<Option<u64>>,
}

impl TokioAlarm {
    pub fn new() -> (Self, watch::Receiver<Option<u64>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }
}

impl AlarmSink for TokioAlarm {
    fn arm(&self, at_ms: u64) {
        self.tx.send_replace(Some(at_ms));
    }

    fn cancel(&self) {
        self.tx.send_replace(None);
    }
}

/// Sleep until the armed time, then tick the scheduler. Exits when the alarm is dropped.
pub async fn run_alarm(
    scheduler: Arc<Scheduler>,
    clock: Arc<dyn Clock>,
    mut rx: watch::Receiver<Option<u64>>,
) {
    let mut target = *rx.borrow_and_update();
    loop {
        match target {
            None => {
                if rx.changed().await.is_err() {
                    return;
                }
                target = *rx.borrow_and_update();
            }
            Some(at) => {
                let wait = at.saturating_sub(clock.now_ms());
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(wait)) => {
                        // Consumed; on_alarm re-arms through the watch if anything is left.
                        target = None;
                        scheduler.on_alarm();
                    }
                    r = rx.changed() => {
                        if r.is_err() {
                            return;
                        }
                        target = *rx.borrow_and_update();
                    }
                }
            }
        }
    }
}
