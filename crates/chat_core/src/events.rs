use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use futures::StreamExt;
use shared::protocol::{ChannelEvent, ChannelEventKind, ServiceEvent, ServiceEventKind};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::warn;

pub type ChannelListener = Arc<dyn Fn(ChannelEvent) + Send + Sync>;
pub type ServiceListener = Arc<dyn Fn(ServiceEvent) + Send + Sync>;

/// Forwarding tasks of every live subscription, so teardown can stop them all.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl SubscriptionRegistry {
    fn tasks(&self) -> MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(self: &Arc<Self>, task: JoinHandle<()>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.tasks().insert(id, task);
        Subscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) {
        if let Some(task) = self.tasks().remove(&id) {
            task.abort();
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.tasks().values().filter(|task| !task.is_finished()).count()
    }

    pub(crate) fn clear(&self) {
        for (_, task) in self.tasks().drain() {
            task.abort();
        }
    }

    pub(crate) fn forward_channel_events(
        self: &Arc<Self>,
        receiver: broadcast::Receiver<ChannelEvent>,
        kind: ChannelEventKind,
        listener: ChannelListener,
    ) -> Subscription {
        let mut events = BroadcastStream::new(receiver);
        let task = tokio::spawn(async move {
            while let Some(item) = events.next().await {
                match item {
                    Ok(event) if event.kind() == kind => listener(event),
                    Ok(_) => {}
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(?kind, skipped, "chat: channel listener lagged");
                    }
                }
            }
        });
        self.register(task)
    }

    pub(crate) fn forward_service_events(
        self: &Arc<Self>,
        receiver: broadcast::Receiver<ServiceEvent>,
        kind: ServiceEventKind,
        listener: ServiceListener,
    ) -> Subscription {
        let mut events = BroadcastStream::new(receiver);
        let task = tokio::spawn(async move {
            while let Some(item) = events.next().await {
                match item {
                    Ok(event) if event.kind() == kind => listener(event),
                    Ok(_) => {}
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(?kind, skipped, "chat: service listener lagged");
                    }
                }
            }
        });
        self.register(task)
    }
}

/// Handle returned by every `*_event_on`. Unsubscribing twice, or after the
/// session is gone, does nothing.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    registry: Weak<SubscriptionRegistry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}
