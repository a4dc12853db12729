// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Badge scan events as serialized onto the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Weakest signal a reader reports before a scan is considered noise.
pub const MIN_SIGNAL_DBM: i16 = -120;
/// Strongest signal a reader can physically report.
pub const MAX_SIGNAL_DBM: i16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Entry,
    Exit,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("signal strength {0} dBm is outside [-120, 0]")]
    SignalOutOfRange(i16),

    #[error("event timestamp {timestamp} is after generation time {generated_at}")]
    FutureTimestamp {
        timestamp: DateTime<Utc>,
        generated_at: DateTime<Utc>,
    },
}

/// Untimed scan fields, validated when turned into a [`BadgeEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFields {
    pub badge_id: String,
    pub user_id: String,
    pub zone_id: String,
    pub reader_id: String,
    pub signal_strength: i16,
    pub direction: Direction,
}

/// One RFID badge scan. Immutable once built.
///
/// Downstream dedup keys on `(user_id, event_timestamp)`; the client itself
/// never dedups or reorders. Only [`BadgeEvent::new`] builds one, so the
/// type serializes into rows but is never read back from them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BadgeEvent {
    badge_id: String,
    user_id: String,
    zone_id: String,
    reader_id: String,
    event_timestamp: DateTime<Utc>,
    signal_strength: i16,
    direction: Direction,
}

impl BadgeEvent {
    /// Builds an event, rejecting blank identifiers, impossible signal values
    /// and timestamps later than `generated_at`.
    pub fn new(
        fields: ScanFields,
        event_timestamp: DateTime<Utc>,
        generated_at: DateTime<Utc>,
    ) -> Result<Self, EventError> {
        for (name, value) in [
            ("badge_id", &fields.badge_id),
            ("user_id", &fields.user_id),
            ("zone_id", &fields.zone_id),
            ("reader_id", &fields.reader_id),
        ] {
            if value.trim().is_empty() {
                return Err(EventError::EmptyField(name));
            }
        }
        if !(MIN_SIGNAL_DBM..=MAX_SIGNAL_DBM).contains(&fields.signal_strength) {
            return Err(EventError::SignalOutOfRange(fields.signal_strength));
        }
        if event_timestamp > generated_at {
            return Err(EventError::FutureTimestamp {
                timestamp: event_timestamp,
                generated_at,
            });
        }

        Ok(Self {
            badge_id: fields.badge_id,
            user_id: fields.user_id,
            zone_id: fields.zone_id,
            reader_id: fields.reader_id,
            event_timestamp,
            signal_strength: fields.signal_strength,
            direction: fields.direction,
        })
    }

    pub fn badge_id(&self) -> &str {
        &self.badge_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }

    pub fn reader_id(&self) -> &str {
        &self.reader_id
    }

    pub fn event_timestamp(&self) -> DateTime<Utc> {
        self.event_timestamp
    }

    pub fn signal_strength(&self) -> i16 {
        self.signal_strength
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Key downstream consumers dedup on.
    pub fn dedup_key(&self) -> (&str, DateTime<Utc>) {
        (&self.user_id, self.event_timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> ScanFields {
        ScanFields {
            badge_id: "BADGE-00042".to_string(),
            user_id: "USR-00042".to_string(),
            zone_id: "LOBBY".to_string(),
            reader_id: "RDR-LOBBY-01".to_string(),
            signal_strength: -55,
            direction: Direction::Entry,
        }
    }

    #[test]
    fn builds_valid_event() {
        let now = Utc::now();
        let event = BadgeEvent::new(fields(), now, now).expect("valid event");
        assert_eq!(event.badge_id(), "BADGE-00042");
        assert_eq!(event.dedup_key(), ("USR-00042", now));
        assert_eq!(event.direction(), Direction::Entry);
    }

    #[test]
    fn rejects_blank_identifiers() {
        let now = Utc::now();
        let mut blank = fields();
        blank.reader_id = "  ".to_string();
        assert_eq!(
            BadgeEvent::new(blank, now, now),
            Err(EventError::EmptyField("reader_id"))
        );
    }

    #[test]
    fn rejects_impossible_signal() {
        let now = Utc::now();
        let mut loud = fields();
        loud.signal_strength = 10;
        assert_eq!(
            BadgeEvent::new(loud, now, now),
            Err(EventError::SignalOutOfRange(10))
        );
    }

    #[test]
    fn rejects_future_timestamp() {
        let now = Utc::now();
        let later = now + chrono::Duration::milliseconds(1);
        assert!(matches!(
            BadgeEvent::new(fields(), later, now),
            Err(EventError::FutureTimestamp { .. })
        ));
    }

    #[test]
    fn serializes_row_fields() {
        let ts = DateTime::parse_from_rfc3339("2025-03-01T08:30:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        let event = BadgeEvent::new(fields(), ts, ts).expect("valid event");
        let row = serde_json::to_value(&event).expect("serializes");
        assert_eq!(row["badge_id"], "BADGE-00042");
        assert_eq!(row["user_id"], "USR-00042");
        assert_eq!(row["zone_id"], "LOBBY");
        assert_eq!(row["reader_id"], "RDR-LOBBY-01");
        assert_eq!(row["signal_strength"], -55);
        assert_eq!(row["direction"], "ENTRY");
        assert_eq!(row["event_timestamp"], "2025-03-01T08:30:00Z");
    }
}
