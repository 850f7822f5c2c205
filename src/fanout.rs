//! Bounded fan-out with a completion barrier.
//!
//! [`fan_out`] spawns one task per item on a [`JoinSet`], limits how many
//! run at once with a [`Semaphore`], and waits for every task to reach a
//! terminal [`TaskOutcome`] before returning. Each task races the
//! cancellation token, so cancelling the token settles all in-flight and
//! queued tasks as [`TaskOutcome::Cancelled`].

use std::future::Future;
use std::sync::Arc;

use code_analyzer_core::adapters::AdapterError;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Terminal state of one fan-out task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<T> {
    Completed(T),
    /// Excluded from results without counting as a failure.
    Skipped(String),
    Failed(AdapterError),
    Cancelled,
}

/// Run `task` for every item with at most `limit` tasks in flight.
///
/// Outcomes are returned in dispatch order regardless of completion order.
/// A panicking task is reported as [`TaskOutcome::Failed`]. `on_settled` is
/// called with `(settled, total)` each time a task finishes.
pub async fn fan_out<I, T, F, Fut>(
    items: Vec<I>,
    limit: usize,
    cancel: &CancellationToken,
    task: F,
    mut on_settled: impl FnMut(usize, usize),
) -> Vec<TaskOutcome<T>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = TaskOutcome<T>> + Send + 'static,
{
    let total = items.len();
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut set = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let work = task(item);
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        set.spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => TaskOutcome::Cancelled,
                outcome = async {
                    match semaphore.acquire_owned().await {
                        Ok(_permit) => work.await,
                        Err(_) => TaskOutcome::Cancelled,
                    }
                } => outcome,
            };
            (index, outcome)
        });
    }

    let mut slots: Vec<Option<TaskOutcome<T>>> = (0..total).map(|_| None).collect();
    let mut settled = 0usize;
    while let Some(joined) = set.join_next().await {
        settled += 1;
        match joined {
            Ok((index, outcome)) => slots[index] = Some(outcome),
            Err(err) => tracing::error!(error = %err, "fan-out task panicked"),
        }
        on_settled(settled, total);
    }

    slots
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| TaskOutcome::Failed(AdapterError::permanent("task panicked")))
        })
        .collect()
}

/// Fan-in summary of a batch of outcomes.
#[derive(Debug)]
pub struct FanIn<T> {
    pub completed: Vec<T>,
    pub skipped: usize,
    pub failures: Vec<AdapterError>,
    pub cancelled: usize,
    pub total: usize,
}

impl<T> FanIn<T> {
    pub fn collect(outcomes: Vec<TaskOutcome<T>>) -> Self {
        let total = outcomes.len();
        let mut fan_in = FanIn {
            completed: Vec::new(),
            skipped: 0,
            failures: Vec::new(),
            cancelled: 0,
            total,
        };
        for outcome in outcomes {
            match outcome {
                TaskOutcome::Completed(value) => fan_in.completed.push(value),
                TaskOutcome::Skipped(_) => fan_in.skipped += 1,
                TaskOutcome::Failed(err) => fan_in.failures.push(err),
                TaskOutcome::Cancelled => fan_in.cancelled += 1,
            }
        }
        fan_in
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_outcomes_keep_dispatch_order() {
        let outcomes = fan_out(
            vec![30u64, 10, 20],
            3,
            &CancellationToken::new(),
            |delay| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                TaskOutcome::Completed(delay)
            },
            |_, _| {},
        )
        .await;
        assert_eq!(
            outcomes,
            vec![
                TaskOutcome::Completed(30),
                TaskOutcome::Completed(10),
                TaskOutcome::Completed(20)
            ]
        );
    }

    #[tokio::test]
    async fn test_limit_bounds_in_flight_tasks() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (flight, high) = (in_flight.clone(), peak.clone());
        let outcomes = fan_out(
            (0..20).collect::<Vec<u32>>(),
            4,
            &CancellationToken::new(),
            move |n| {
                let (flight, high) = (flight.clone(), high.clone());
                async move {
                    let now = flight.fetch_add(1, Ordering::SeqCst) + 1;
                    high.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    flight.fetch_sub(1, Ordering::SeqCst);
                    TaskOutcome::Completed(n)
                }
            },
            |_, _| {},
        )
        .await;
        assert_eq!(outcomes.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_failure_waits_for_siblings() {
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();
        let outcomes = fan_out(
            vec![0u32, 1, 2, 3],
            4,
            &CancellationToken::new(),
            move |n| {
                let done = done.clone();
                async move {
                    if n == 0 {
                        return TaskOutcome::Failed(AdapterError::permanent("boom"));
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    TaskOutcome::Completed(n)
                }
            },
            |_, _| {},
        )
        .await;
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        let fan_in = FanIn::collect(outcomes);
        assert_eq!(fan_in.failures.len(), 1);
        assert_eq!(fan_in.completed, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cancel_settles_every_task() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let mut last = (0, 0);
        let outcomes = fan_out(
            vec![(); 8],
            2,
            &cancel,
            |_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                TaskOutcome::Completed(())
            },
            |settled, total| last = (settled, total),
        )
        .await;
        assert_eq!(last, (8, 8));
        assert!(outcomes.iter().all(|o| *o == TaskOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_panicking_task_is_a_failure() {
        let outcomes = fan_out(
            vec![true, false],
            2,
            &CancellationToken::new(),
            |explode| async move {
                if explode {
                    panic!("adapter bug");
                }
                TaskOutcome::Completed(())
            },
            |_, _| {},
        )
        .await;
        assert!(matches!(outcomes[0], TaskOutcome::Failed(_)));
        assert_eq!(outcomes[1], TaskOutcome::Completed(()));
    }
}
