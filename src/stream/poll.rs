//! Interval-paced predicate polling

use futures::{Stream, StreamExt, ready};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::trace;

pin_project! {
    /// A stream that checks a predicate once per interval tick.
    ///
    /// Yields the number of checks made when the predicate first holds, then
    /// ends. The first check happens immediately.
    pub struct IntervalPoll<F> {
        interval: Interval,
        predicate: F,
        attempts: u32,
        done: bool,
    }
}

impl<F> IntervalPoll<F>
where
    F: FnMut() -> bool,
{
    pub fn new(period: Duration, predicate: F) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self { interval, predicate, attempts: 0, done: false }
    }
}

impl<F> Stream for IntervalPoll<F>
where
    F: FnMut() -> bool,
{
    type Item = u32;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }

        loop {
            ready!(this.interval.poll_tick(cx));
            *this.attempts += 1;
            if (this.predicate)() {
                *this.done = true;
                return Poll::Ready(Some(*this.attempts));
            }
        }
    }
}

/// How a [`poll_until`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The predicate held after this many checks
    Ready(u32),
    TimedOut,
    Cancelled,
}

/// Check `predicate` every `period` until it holds, `timeout` elapses or
/// `cancel` fires. A `None` timeout waits indefinitely.
pub async fn poll_until<F>(
    period: Duration,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    predicate: F,
) -> PollOutcome
where
    F: FnMut() -> bool,
{
    let mut poll = IntervalPoll::new(period, predicate);
    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending::<()>().await,
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => PollOutcome::Cancelled,
        attempts = poll.next() => match attempts {
            Some(attempts) => PollOutcome::Ready(attempts),
            None => PollOutcome::Cancelled,
        },
        _ = deadline => PollOutcome::TimedOut,
    };
    trace!(?outcome, "Poll finished");
    outcome
}
