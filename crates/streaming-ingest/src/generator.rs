// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Paced synthetic badge traffic.
//!
//! [`EventSynthesizer`] produces field values from a seeded RNG so runs are
//! reproducible. [`EventGenerator`] drives it on a fixed inter-arrival
//! schedule and pushes events into a bounded channel, blocking when the
//! sender falls behind.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::IngestError;
use crate::event::{BadgeEvent, Direction, EventError, ScanFields};

/// Bound applied when neither a duration nor continuous mode is configured.
pub const DEFAULT_DURATION: Duration = Duration::from_secs(60);

/// Upper bound on how long a reader takes to report a scan.
const MAX_READER_LAG_MS: i64 = 50;

/// Zones and how many readers each one has.
const ZONES: [(&str, u8); 6] = [
    ("LOBBY", 2),
    ("CAFETERIA", 1),
    ("ENGINEERING", 3),
    ("LAB", 2),
    ("SERVER_ROOM", 1),
    ("PARKING", 2),
];

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorConfig {
    pub rate_per_second: f64,
    /// Stop after this long. Ignored in continuous mode.
    pub duration: Option<Duration>,
    /// Run until cancelled.
    pub continuous: bool,
    pub seed: Option<u64>,
    /// Size of the badge holder population.
    pub badge_count: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            rate_per_second: 10.0,
            duration: None,
            continuous: false,
            seed: None,
            badge_count: 500,
        }
    }
}

impl GeneratorConfig {
    /// How long generation runs, or `None` when unbounded.
    pub fn bound(&self) -> Option<Duration> {
        if self.continuous {
            None
        } else {
            Some(self.duration.unwrap_or(DEFAULT_DURATION))
        }
    }

    /// Time between two events, or an error when the rate cannot be paced.
    pub fn interval(&self) -> Result<Duration, IngestError> {
        let rate = self.rate_per_second;
        if !(rate.is_finite() && rate > 0.0) {
            return Err(IngestError::InvalidConfig(format!(
                "event rate must be a positive number, got {rate}"
            )));
        }
        Duration::try_from_secs_f64(1.0 / rate).map_err(|err| {
            IngestError::InvalidConfig(format!("event rate {rate}/s cannot be paced: {err}"))
        })
    }
}

/// Seeded field synthesis with monotonic timestamps.
#[derive(Debug)]
pub struct EventSynthesizer {
    rng: StdRng,
    badge_count: u32,
    last_timestamp: Option<DateTime<Utc>>,
}

impl EventSynthesizer {
    pub fn new(seed: Option<u64>, badge_count: u32) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            badge_count: badge_count.max(1),
            last_timestamp: None,
        }
    }

    /// Synthesizes the next scan generated at `now`.
    ///
    /// The scan is stamped slightly before `now` to model reader latency,
    /// never earlier than the previous scan. Returns `None` while the wall
    /// clock is behind the previous scan, so timestamps never decrease and
    /// never exceed the time they were generated at.
    pub fn next_event(&mut self, now: DateTime<Utc>) -> Result<Option<BadgeEvent>, EventError> {
        if let Some(last) = self.last_timestamp {
            if last > now {
                return Ok(None);
            }
        }

        let lag = chrono::Duration::milliseconds(self.rng.gen_range(0..=MAX_READER_LAG_MS));
        let observed_at = match self.last_timestamp {
            Some(last) if now - lag < last => last,
            _ => now - lag,
        };

        let holder = self.rng.gen_range(0..self.badge_count);
        let (zone, readers) = ZONES[self.rng.gen_range(0..ZONES.len())];
        let reader = self.rng.gen_range(1..=readers);
        let signal_strength = self.rng.gen_range(-85..=-30);
        let direction = if self.rng.gen_bool(0.5) {
            Direction::Entry
        } else {
            Direction::Exit
        };

        let fields = ScanFields {
            badge_id: format!("BADGE-{holder:05}"),
            user_id: format!("USR-{holder:05}"),
            zone_id: zone.to_string(),
            reader_id: format!("RDR-{zone}-{reader:02}"),
            signal_strength,
            direction,
        };
        let event = BadgeEvent::new(fields, observed_at, now)?;
        self.last_timestamp = Some(observed_at);
        Ok(Some(event))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    DurationElapsed,
    Cancelled,
    ReceiverClosed,
    InvalidEvent,
    /// The configured rate could not be turned into an interval.
    InvalidRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorReport {
    pub emitted: u64,
    pub stop: StopReason,
}

/// Emits badge events at a fixed rate into a bounded buffer.
#[derive(Debug)]
pub struct EventGenerator {
    config: GeneratorConfig,
    synthesizer: EventSynthesizer,
}

impl EventGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        let synthesizer = EventSynthesizer::new(config.seed, config.badge_count);
        Self {
            config,
            synthesizer,
        }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Produces events until the bound elapses, `cancel` fires or `tx` closes.
    ///
    /// Each event is due at `anchor + n * interval`, so sleep overshoot does
    /// not accumulate. If backpressure holds generation back by more than a
    /// second the schedule is re-anchored instead of bursting to catch up.
    /// Cancellation is observed while waiting for the next tick and while
    /// waiting for buffer space; an event that was not handed to `tx` is
    /// discarded whole.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<BadgeEvent>,
        cancel: CancellationToken,
    ) -> GeneratorReport {
        let interval = match self.config.interval() {
            Ok(interval) => interval,
            Err(err) => {
                error!("not generating events: {err}");
                return GeneratorReport {
                    emitted: 0,
                    stop: StopReason::InvalidRate,
                };
            }
        };
        let max_lag = Duration::from_secs(1).max(interval * 10);
        let origin = Instant::now();
        let end = self.config.bound().map(|bound| origin + bound);
        let mut anchor = origin;
        let mut ticks: u64 = 0;
        let mut emitted: u64 = 0;

        info!(
            rate_per_second = self.config.rate_per_second,
            bound = ?self.config.bound(),
            "event generation started"
        );

        let stop = loop {
            let mut due = due_at(anchor, interval, ticks);
            let now = Instant::now();
            if now > due + max_lag {
                debug!(lag = ?(now - due), "generator fell behind, re-anchoring schedule");
                anchor = now;
                ticks = 0;
                due = now;
            }
            if let Some(end) = end {
                if due >= end {
                    break StopReason::DurationElapsed;
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break StopReason::Cancelled,
                _ = tokio::time::sleep_until(due) => {}
            }

            let event = match self.synthesizer.next_event(Utc::now()) {
                Ok(Some(event)) => event,
                Ok(None) => {
                    debug!("wall clock is behind the last event, holding this tick");
                    ticks = ticks.saturating_add(1);
                    continue;
                }
                Err(err) => {
                    error!("synthesized an invalid event, stopping generation: {err}");
                    break StopReason::InvalidEvent;
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break StopReason::Cancelled,
                sent = tx.send(event) => {
                    if sent.is_err() {
                        break StopReason::ReceiverClosed;
                    }
                }
            }

            emitted += 1;
            ticks = ticks.saturating_add(1);
        };

        info!(emitted, stop = ?stop, "event generation finished");
        GeneratorReport { emitted, stop }
    }
}

/// Instant of the `ticks`-th event after `anchor`.
fn due_at(anchor: Instant, interval: Duration, ticks: u64) -> Instant {
    anchor + interval.mul_f64(ticks as f64)
}
