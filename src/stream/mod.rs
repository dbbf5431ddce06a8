//! Stream utilities

pub mod poll;

pub use poll::{IntervalPoll, PollOutcome, poll_until};
