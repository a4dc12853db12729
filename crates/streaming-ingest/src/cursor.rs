// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tracing::{debug, trace};

/// Acknowledgment returned by the endpoint for one accepted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Continuation token to echo on the next send.
    pub continuation_token: String,
    /// Offset of the last row covered by the acknowledged batch.
    pub offset: u64,
}

/// Point-in-time copy of the cursor used to build one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorSnapshot {
    pub continuation_token: String,
    pub offset: u64,
}

/// Continuation token plus monotonic offset for one channel.
///
/// Owned by the single sender of its channel; it only moves forward when the
/// endpoint acknowledges a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    continuation_token: String,
    offset: u64,
    advances: u64,
}

impl Cursor {
    pub fn new(continuation_token: impl Into<String>, offset: u64) -> Self {
        Self {
            continuation_token: continuation_token.into(),
            offset,
            advances: 0,
        }
    }

    /// Applies `ack`, returning `true` when the cursor moved.
    ///
    /// Backward or repeated acks leave the cursor untouched.
    pub fn advance(&mut self, ack: &Ack) -> bool {
        if ack.offset <= self.offset {
            trace!(
                current = self.offset,
                acked = ack.offset,
                "ignoring stale acknowledgment"
            );
            return false;
        }
        debug!(from = self.offset, to = ack.offset, "cursor advanced");
        self.offset = ack.offset;
        self.continuation_token.clone_from(&ack.continuation_token);
        self.advances += 1;
        true
    }

    pub fn snapshot(&self) -> CursorSnapshot {
        CursorSnapshot {
            continuation_token: self.continuation_token.clone(),
            offset: self.offset,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// How many times the cursor actually moved.
    pub fn advances(&self) -> u64 {
        self.advances
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(token: &str, offset: u64) -> Ack {
        Ack {
            continuation_token: token.to_string(),
            offset,
        }
    }

    #[test]
    fn advance_moves_offset_forward() {
        let mut cursor = Cursor::new("ct-0", 0);
        assert!(cursor.advance(&ack("ct-1", 100)));
        let snapshot = cursor.snapshot();
        assert_eq!(snapshot.offset, 100);
        assert_eq!(snapshot.continuation_token, "ct-1");
    }

    #[test]
    fn advance_is_idempotent() {
        let mut once = Cursor::new("ct-0", 0);
        once.advance(&ack("ct-1", 100));

        let mut twice = Cursor::new("ct-0", 0);
        twice.advance(&ack("ct-1", 100));
        assert!(!twice.advance(&ack("ct-1", 100)));

        assert_eq!(once.snapshot(), twice.snapshot());
        assert_eq!(twice.advances(), 1);
    }

    #[test]
    fn backward_ack_is_ignored() {
        let mut cursor = Cursor::new("ct-5", 500);
        assert!(!cursor.advance(&ack("ct-stale", 200)));
        assert_eq!(cursor.offset(), 500);
        assert_eq!(cursor.snapshot().continuation_token, "ct-5");
    }

    #[test]
    fn successive_acks_are_strictly_increasing() {
        let mut cursor = Cursor::new("ct", 0);
        let mut previous = cursor.offset();
        for step in 1..=10u64 {
            cursor.advance(&ack(&format!("ct-{step}"), step * 100));
            assert!(cursor.offset() > previous);
            previous = cursor.offset();
        }
        assert_eq!(cursor.advances(), 10);
    }
}
