// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};

/// Outcome of the send made after the buffer was drained at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalFlush {
    /// Nothing was left to send.
    #[default]
    Empty,
    Delivered,
    Failed,
    /// The run failed before shutdown.
    Skipped,
}

/// Totals reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub channels: Vec<String>,
    pub events_generated: u64,
    pub events_accepted: u64,
    pub events_rejected: u64,
    /// Events in batches dropped after a non-retryable refusal.
    pub events_dropped: u64,
    /// Events still buffered or in flight when the run ended.
    pub events_unsent: u64,
    pub reopen_count: u32,
    pub batches_sent: u64,
    #[serde(serialize_with = "as_secs_f64")]
    pub duration: Duration,
    pub final_flush: FinalFlush,
    /// Local cursor offset. After [`RunSummary::merge`] this is the sum
    /// over every channel in `channels`.
    pub final_offset: u64,
    /// Committed offset reported by the endpoint, when verified. Summed
    /// over the verified channels after a merge.
    pub committed_offset: Option<u64>,
}

impl RunSummary {
    /// Folds the summary of another channel into this one.
    ///
    /// Counters add up; `duration` is the longest of the two since channels
    /// run concurrently.
    pub fn merge(&mut self, other: RunSummary) {
        self.channels.extend(other.channels);
        self.events_generated += other.events_generated;
        self.events_accepted += other.events_accepted;
        self.events_rejected += other.events_rejected;
        self.events_dropped += other.events_dropped;
        self.events_unsent += other.events_unsent;
        self.reopen_count += other.reopen_count;
        self.batches_sent += other.batches_sent;
        self.duration = self.duration.max(other.duration);
        self.final_flush = match (self.final_flush, other.final_flush) {
            (FinalFlush::Failed, _) | (_, FinalFlush::Failed) => FinalFlush::Failed,
            (FinalFlush::Skipped, _) | (_, FinalFlush::Skipped) => FinalFlush::Skipped,
            (FinalFlush::Delivered, _) | (_, FinalFlush::Delivered) => FinalFlush::Delivered,
            _ => FinalFlush::Empty,
        };
        self.final_offset += other.final_offset;
        self.committed_offset = match (self.committed_offset, other.committed_offset) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
    }

    /// Events the endpoint has either accepted or explicitly rejected.
    pub fn events_settled(&self) -> u64 {
        self.events_accepted + self.events_rejected
    }

    pub fn events_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.events_accepted as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "generated={} accepted={} rejected={} dropped={} unsent={} batches={} reopens={} duration={:.1}s rate={:.1}/s",
            self.events_generated,
            self.events_accepted,
            self.events_rejected,
            self.events_dropped,
            self.events_unsent,
            self.batches_sent,
            self.reopen_count,
            self.duration.as_secs_f64(),
            self.events_per_second(),
        )
    }
}

fn as_secs_f64<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}
