//! Per-pipeline output observers.
//!
//! Every observer is called on the pipeline task. Channel observers never
//! block it: a full queue drops the packet for that subscriber only.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use pulse_core::Packet;

pub type SubscriberId = u64;

#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("subscriber queue is full")]
    Full,

    #[error("subscriber is gone")]
    Disconnected,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

pub trait PacketObserver: Send + Sync {
    fn on_packet(&self, packet: &Packet) -> Result<(), ObserverError>;
}

impl<F> PacketObserver for F
where
    F: Fn(&Packet) -> anyhow::Result<()> + Send + Sync,
{
    fn on_packet(&self, packet: &Packet) -> Result<(), ObserverError> {
        self(packet).map_err(ObserverError::Failed)
    }
}

/// Forwards packets into a bounded queue.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::Sender<Packet>,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl PacketObserver for ChannelObserver {
    fn on_packet(&self, packet: &Packet) -> Result<(), ObserverError> {
        self.tx.try_send(packet.clone()).map_err(|e| match e {
            TrySendError::Full(_) => ObserverError::Full,
            TrySendError::Closed(_) => ObserverError::Disconnected,
        })
    }
}

/// What happened to one packet's fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Skipped because the subscriber's queue was full.
    pub dropped: usize,
    /// The subscriber returned an error or panicked.
    pub failed: usize,
    /// Subscribers removed because their receiving end is gone.
    pub removed: usize,
}

type Entry = (SubscriberId, Arc<dyn PacketObserver>);

#[derive(Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    observers: RwLock<HashMap<String, Vec<Entry>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, pipeline_id: &str, observer: Arc<dyn PacketObserver>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(pipeline_id.to_string())
            .or_default()
            .push((id, observer));
        debug!(pipeline = %pipeline_id, subscriber = id, "subscriber added");
        id
    }

    pub fn unsubscribe(&self, pipeline_id: &str, subscriber: SubscriberId) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = observers.get_mut(pipeline_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != subscriber);
        let removed = list.len() != before;
        if list.is_empty() {
            observers.remove(pipeline_id);
        }
        removed
    }

    pub fn remove_pipeline(&self, pipeline_id: &str) -> usize {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(pipeline_id)
            .map_or(0, |list| list.len())
    }

    pub fn count(&self, pipeline_id: &str) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pipeline_id)
            .map_or(0, Vec::len)
    }

    /// Hand `packet` to every observer of `pipeline_id`. One observer
    /// failing, panicking or lagging does not affect the others.
    pub fn notify(&self, pipeline_id: &str, packet: &Packet) -> Delivery {
        let snapshot: Vec<Entry> = match self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pipeline_id)
        {
            Some(list) => list.clone(),
            None => return Delivery::default(),
        };

        let mut delivery = Delivery::default();
        let mut gone = Vec::new();
        for (id, observer) in snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| observer.on_packet(packet)))
                .unwrap_or_else(|_| {
                    Err(ObserverError::Failed(anyhow::anyhow!("subscriber panicked")))
                });
            match result {
                Ok(()) => delivery.delivered += 1,
                Err(ObserverError::Full) => {
                    delivery.dropped += 1;
                    warn!(
                        pipeline = %pipeline_id,
                        subscriber = id,
                        "subscriber queue full, packet dropped"
                    );
                }
                Err(ObserverError::Disconnected) => gone.push(id),
                Err(ObserverError::Failed(err)) => {
                    delivery.failed += 1;
                    warn!(
                        pipeline = %pipeline_id,
                        subscriber = id,
                        error = %err,
                        "subscriber failed"
                    );
                }
            }
        }

        for id in gone {
            if self.unsubscribe(pipeline_id, id) {
                delivery.removed += 1;
                debug!(pipeline = %pipeline_id, subscriber = id, "disconnected subscriber removed");
            }
        }
        delivery
    }
}
