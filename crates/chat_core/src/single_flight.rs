use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};

pub type SharedTask<T> = Shared<BoxFuture<'static, T>>;

struct InFlight<T> {
    id: u64,
    task: SharedTask<T>,
}

struct Slot<T> {
    current: Mutex<Option<InFlight<T>>>,
    next_id: AtomicU64,
}

impl<T> Slot<T> {
    fn current(&self) -> MutexGuard<'_, Option<InFlight<T>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Collapses concurrent runs of the same operation into one shared future.
///
/// The slot empties itself when the shared future settles, so the next call
/// after completion starts a fresh run.
pub struct SingleFlight<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(Slot {
                current: Mutex::new(None),
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the run in progress, or starts one with `start` when idle.
    pub fn run<F, Fut>(&self, start: F) -> SharedTask<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut current = self.slot.current();
        if let Some(in_flight) = current.as_ref() {
            return in_flight.task.clone();
        }

        let id = self.slot.next_id.fetch_add(1, Ordering::SeqCst);
        let slot = Arc::clone(&self.slot);
        let work = start();
        let task = async move {
            let output = work.await;
            let mut current = slot.current();
            if current.as_ref().is_some_and(|in_flight| in_flight.id == id) {
                *current = None;
            }
            output
        }
        .boxed()
        .shared();

        *current = Some(InFlight {
            id,
            task: task.clone(),
        });
        task
    }

    pub fn in_flight(&self) -> Option<SharedTask<T>> {
        self.slot
            .current()
            .as_ref()
            .map(|in_flight| in_flight.task.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test]
    async fn concurrent_runs_share_one_execution() {
        let flight = SingleFlight::<usize>::new();
        let starts = Arc::new(AtomicUsize::new(0));

        let runs = (0..5).map(|_| {
            let starts = Arc::clone(&starts);
            flight.run(move || async move {
                tokio::task::yield_now().await;
                starts.fetch_add(1, Ordering::SeqCst) + 1
            })
        });
        let outputs = futures::future::join_all(runs).await;

        assert_eq!(outputs, vec![1; 5]);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(flight.in_flight().is_none());
    }

    #[tokio::test]
    async fn settled_run_is_not_reused() {
        let flight = SingleFlight::<u32>::new();
        assert_eq!(flight.run(|| async { 1 }).await, 1);
        assert_eq!(flight.run(|| async { 2 }).await, 2);
    }

    #[tokio::test]
    async fn in_flight_exposes_pending_run() {
        let flight = SingleFlight::<&'static str>::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = flight.run(move || async move {
            let _ = rx.await;
            "done"
        });

        let pending = flight.in_flight().expect("in flight");
        let _ = tx.send(());
        assert_eq!(pending.await, "done");
        assert_eq!(task.await, "done");
        assert!(flight.in_flight().is_none());
    }
}
