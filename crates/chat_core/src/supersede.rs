use std::{
    future::Future,
    sync::{Mutex, PoisonError},
};

use tokio_util::sync::CancellationToken;

/// Latest-wins gate: starting a run cancels the one before it.
#[derive(Default)]
pub struct Supersede {
    current: Mutex<Option<CancellationToken>>,
}

impl Supersede {
    /// Resolves to `None` if a newer run started, or [`Supersede::cancel`] was
    /// called, before `work` finished.
    pub async fn run<T>(&self, work: impl Future<Output = T>) -> Option<T> {
        let token = CancellationToken::new();
        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            output = work => Some(output),
        }
    }

    pub fn cancel(&self) {
        if let Some(token) = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }
}
