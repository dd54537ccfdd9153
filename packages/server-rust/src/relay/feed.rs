//! Continuous consumer feeding a bounded in-process buffer.
//!
//! A background task keeps one subscription open, pushes each decoded
//! payload onto a bounded mpsc channel and acknowledges the delivery once the
//! push succeeds. A full buffer applies backpressure: deliveries stay
//! unacknowledged on the broker until `snapshot()` makes room.

use std::sync::Arc;
use std::time::Duration;

use courier_core::BrokerError;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::consumer::{decode, release, subscribe, Decoded};
use crate::broker::ChannelPool;
use crate::telemetry;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// MessageFeed
// ---------------------------------------------------------------------------

/// Handle on the background consumer.
///
/// The task runs until the cancellation token fires or [`MessageFeed::stop`]
/// is called. Transport failures make it back off and resubscribe.
pub struct MessageFeed {
    rx: Mutex<mpsc::Receiver<String>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MessageFeed {
    /// Spawns the consumer task on the current runtime.
    #[must_use]
    pub fn start(
        pool: Arc<ChannelPool>,
        queue: impl Into<String>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        let queue = queue.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            info!(queue = %queue, "message feed started");
            run(&pool, &queue, &tx, &task_cancel).await;
            info!(queue = %queue, "message feed stopped");
        });

        Self {
            rx: Mutex::new(rx),
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Takes everything currently buffered without waiting.
    ///
    /// Payloads are returned in receipt order and removed from the buffer.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        let mut rx = self.rx.lock();
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// Whether the background task is still consuming.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Cancels the task and waits for it to close its channel.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(error = %e, "feed task panicked");
                }
            }
        }
    }
}

impl std::fmt::Debug for MessageFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageFeed")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Consumer loop
// ---------------------------------------------------------------------------

async fn run(
    pool: &ChannelPool,
    queue: &str,
    tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;
    while !cancel.is_cancelled() {
        match consume(pool, queue, tx, cancel, &mut backoff).await {
            Ok(()) => break,
            Err(e) => {
                warn!(queue, error = %e, backoff_ms = backoff.as_millis(), "feed consumer failed; resubscribing");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// Consumes until cancelled (`Ok`) or the channel fails (`Err`).
async fn consume(
    pool: &ChannelPool,
    queue: &str,
    tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
    backoff: &mut Duration,
) -> Result<(), BrokerError> {
    let mut lease = subscribe(pool, queue, "feed").await?;
    *backoff = INITIAL_BACKOFF;
    debug!(queue, "feed subscribed");

    let outcome = loop {
        let delivery = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            next = lease.next_delivery() => match next {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break Err(BrokerError::ChannelClosed),
                Err(e) => break Err(e),
            },
        };

        match decode(queue, &delivery) {
            Decoded::Text(text) => {
                let sent = tokio::select! {
                    () = cancel.cancelled() => break Ok(()),
                    sent = tx.send(text) => sent,
                };
                if sent.is_err() {
                    // Every receiver is gone; nobody will read further payloads.
                    break Ok(());
                }
                if let Err(e) = lease.ack(delivery.tag).await {
                    break Err(e);
                }
                telemetry::record_drained(queue);
            }
            Decoded::Poison => {
                if let Err(e) = lease.reject(delivery.tag, false).await {
                    break Err(e);
                }
            }
        }
    };

    release(lease, queue).await;
    outcome
}
