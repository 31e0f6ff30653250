//! # Timer Handles
//!
//! Every background loop in the core (heartbeat, health check, search
//! countdown, grace delays, outbox resync, polls) runs as a task tied to a
//! [`TimerHandle`]. The handle is stored by whichever state started the loop,
//! and dropping it cancels the loop. Clearing a timer therefore never depends
//! on a caller remembering to do it: it happens when the owner goes away.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[must_use = "dropping a TimerHandle cancels its task"]
pub struct TimerHandle {
    name: &'static str,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Spawns `body` on the runtime. The body stops at its next suspension
    /// point once the handle is cancelled or dropped.
    pub fn spawn<F>(name: &'static str, body: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                // Cancellation wins over a body that is ready at the same time.
                biased;
                _ = child.cancelled() => {
                    tracing::trace!(timer = name, "timer cancelled");
                }
                _ = body => {}
            }
        });
        Self { name, token, task }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True once the task has run to completion or observed cancellation.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("name", &self.name)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_stops_the_loop() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let handle = TimerHandle::spawn("test", async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        drop(handle);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_body_reports_finished() {
        let handle = TimerHandle::spawn("once", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_finished());
        assert!(!handle.is_cancelled());
    }
}
