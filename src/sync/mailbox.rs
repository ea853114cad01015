//! mailbox.rs
//! Single-slot connection prefetch.
//!
//! Two capacity-1 channels carry the discipline:
//! - `empty`: one token, held by whoever may create the next item
//! - `full`: the item itself
//!
//! The producer takes the token before connecting and the consumer hands it
//! back only after taking the item, so at most one unconsumed connection
//! exists at any time and the consumer never waits on a connect call.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};
use log::{debug, info, warn};

use crate::error::{Result, SitlError};

/// Handoff counters shared by both halves.
#[derive(Debug, Default)]
pub struct MailboxCounters {
    delivered: AtomicU64,
    taken: AtomicU64,
}

impl MailboxCounters {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    pub fn taken(&self) -> u64 {
        self.taken.load(Ordering::Acquire)
    }

    /// True while a delivered item waits in the slot.
    pub fn occupied(&self) -> bool {
        self.delivered() > self.taken()
    }
}

pub struct MailboxProducer<T> {
    full_tx: Sender<T>,
    empty_rx: Receiver<()>,
    counters: Arc<MailboxCounters>,
}

pub struct MailboxConsumer<T> {
    full_rx: Receiver<T>,
    empty_tx: Sender<()>,
    counters: Arc<MailboxCounters>,
}

/// Create a connected producer/consumer pair with the slot empty.
pub fn mailbox<T>() -> (MailboxProducer<T>, MailboxConsumer<T>) {
    let (full_tx, full_rx) = bounded(1);
    let (empty_tx, empty_rx) = bounded(1);
    // seed: the slot starts empty
    let _ = empty_tx.try_send(());
    let counters = Arc::new(MailboxCounters::default());
    (
        MailboxProducer {
            full_tx,
            empty_rx,
            counters: counters.clone(),
        },
        MailboxConsumer {
            full_rx,
            empty_tx,
            counters,
        },
    )
}

impl<T> MailboxProducer<T> {
    /// Block until the slot is empty. False once the consumer is gone.
    pub fn wait_empty(&self) -> bool {
        self.empty_rx.recv().is_ok()
    }

    /// Place an item in the slot. Only valid after `wait_empty` returned true.
    pub fn put(&self, item: T) -> bool {
        // counted first so a consumer that wakes on the item sees it delivered
        self.counters.delivered.fetch_add(1, Ordering::AcqRel);
        if self.full_tx.send(item).is_err() {
            self.counters.delivered.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    pub fn counters(&self) -> Arc<MailboxCounters> {
        self.counters.clone()
    }
}

impl<T> MailboxConsumer<T> {
    /// Take the waiting item and release the producer for the next one.
    pub fn take_timeout(&self, timeout: Duration) -> Result<T> {
        let item = self.full_rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => SitlError::Timeout("mailbox"),
            RecvTimeoutError::Disconnected => SitlError::Disconnected,
        })?;
        self.counters.taken.fetch_add(1, Ordering::AcqRel);
        // capacity 1 and the token is only ever out with the producer
        let _ = self.empty_tx.try_send(());
        Ok(item)
    }

    pub fn take(&self) -> Result<T> {
        let item = self.full_rx.recv().map_err(|_| SitlError::Disconnected)?;
        self.counters.taken.fetch_add(1, Ordering::AcqRel);
        let _ = self.empty_tx.try_send(());
        Ok(item)
    }

    pub fn counters(&self) -> Arc<MailboxCounters> {
        self.counters.clone()
    }
}

/// Run the producer side on its own thread.
///
/// `connect` is retried every `backoff` until it succeeds; the thread exits
/// when the consumer half is dropped.
pub fn spawn_prefetcher<T, F>(
    name: &str,
    producer: MailboxProducer<T>,
    mut connect: F,
    backoff: Duration,
) -> std::io::Result<JoinHandle<()>>
where
    T: Send + 'static,
    F: FnMut() -> Result<T> + Send + 'static,
{
    let label = name.to_string();
    thread::Builder::new().name(label.clone()).spawn(move || {
        debug!("[Prefetch] {} started", label);
        let mut failures: u64 = 0;
        loop {
            if !producer.wait_empty() {
                break;
            }
            let item = loop {
                match connect() {
                    Ok(item) => {
                        if failures > 0 {
                            info!("[Prefetch] {} connected after {} failures", label, failures);
                            failures = 0;
                        }
                        break item;
                    }
                    Err(e) => {
                        if failures == 0 {
                            warn!("[Prefetch] {} connect failed: {}", label, e);
                        } else {
                            debug!("[Prefetch] {} retry {}: {}", label, failures, e);
                        }
                        failures += 1;
                        thread::sleep(backoff);
                    }
                }
            };
            if !producer.put(item) {
                break;
            }
        }
        debug!("[Prefetch] {} stopped", label);
    })
}
