//! Bounded fan-out: `k` lanes pull from one shared cursor.
//!
//! Each lane claims the next unclaimed item, optionally pauses if it already
//! dispatched something, then runs the dispatch to completion. At most `k` dispatches are ever in
//! flight, and every item is handled by exactly one lane.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Fan-out settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanePool {
    lanes: usize,
    pause: Option<Duration>,
}

impl LanePool {
    /// `lanes` concurrent dispatch loops (at least one).
    pub fn new(lanes: usize) -> Self {
        Self {
            lanes: lanes.max(1),
            pause: None,
        }
    }

    /// Sleep this long inside a lane between two of its dispatches.
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = (!pause.is_zero()).then_some(pause);
        self
    }

    pub fn lanes(&self) -> usize {
        self.lanes
    }

    /// Run `dispatch` once per item. Results come back in item order.
    pub async fn run<T, R, F, Fut>(&self, items: &[T], dispatch: F) -> Vec<R>
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = R>,
    {
        let cursor = AtomicUsize::new(0);
        let lane_count = self.lanes.min(items.len());
        tracing::debug!("🛣️ Fan-out: {} items over {} lanes", items.len(), lane_count);

        let lanes = (0..lane_count).map(|_| {
            let cursor = &cursor;
            let dispatch = &dispatch;
            async move {
                let mut out: Vec<(usize, R)> = Vec::new();
                loop {
                    let idx = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(item) = items.get(idx) else { break };
                    if let (Some(pause), false) = (self.pause, out.is_empty()) {
                        tokio::time::sleep(pause).await;
                    }
                    out.push((idx, dispatch(item.clone()).await));
                }
                out
            }
        });

        let mut results: Vec<(usize, R)> = futures::future::join_all(lanes)
            .await
            .into_iter()
            .flatten()
            .collect();
        results.sort_by_key(|(idx, _)| *idx);
        results.into_iter().map(|(_, r)| r).collect()
    }
}
