use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
struct NoteState {
    count: u64,
    closed: bool,
}

/// Wakes waiters when a new item lands in an append-only stream, or when
/// the stream closes for good. The `(count, closed)` pair is read
/// atomically, so a waiter can decide whether to block without racing a
/// late append.
#[derive(Debug)]
pub struct ChangeNotifier {
    state: watch::Sender<NoteState>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self {
            state: watch::channel(NoteState {
                count: 0,
                closed: false,
            })
            .0,
        }
    }

    /// Record one more item.
    pub fn notify(&self) {
        self.state.send_modify(|s| s.count += 1);
    }

    /// Mark the stream finished. Idempotent.
    pub fn close(&self) {
        self.state.send_modify(|s| s.closed = true);
    }

    pub fn closed(&self) -> bool {
        self.state.borrow().closed
    }

    pub fn count(&self) -> u64 {
        self.state.borrow().count
    }

    /// Wait until the stream holds more than `last_seen` items. Returns
    /// true iff it does; false when the stream closed or the wait was
    /// cancelled before anything new arrived.
    pub async fn wait(&self, last_seen: u64, cancel: Option<&CancellationToken>) -> bool {
        let mut rx = self.state.subscribe();
        let outcome = async {
            match rx.wait_for(|s| s.count > last_seen || s.closed).await {
                Ok(state) => state.count > last_seen,
                Err(_) => false,
            }
        };
        match cancel {
            Some(cancel) => tokio::select! {
                hit = outcome => hit,
                _ = cancel.cancelled() => false,
            },
            None => outcome.await,
        }
    }

    /// Wait until the stream is closed (or the wait is cancelled).
    pub async fn wait_close(&self, cancel: Option<&CancellationToken>) {
        let mut rx = self.state.subscribe();
        let closed = async {
            let _ = rx.wait_for(|s| s.closed).await;
        };
        match cancel {
            Some(cancel) => tokio::select! {
                _ = closed => {}
                _ = cancel.cancelled() => {}
            },
            None => closed.await,
        }
    }
}
