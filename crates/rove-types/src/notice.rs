//! Link diagnostics: anomalies that are reported but never propagated as
//! errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::EventKind;

/// Something noteworthy happened on the link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum LinkNotice {
    /// CRC mismatch; the frame was dropped.
    CorruptFrame { expected: u8, actual: u8 },
    /// The transport delivered a notification that is not 20 bytes long.
    WrongFrameLength { len: usize },
    /// No table entry for the pair; the frame was ignored.
    UnknownEvent { device: u8, command: u8 },
    /// Gap in the device's event counter. Lost frames are not recoverable.
    LostEvents { count: u8, event_id: u8 },
    /// A response arrived that matches no pending request.
    UnexpectedResponse { kind: EventKind, sequence_id: u8 },
    /// A write was rejected as busy and re-queued ahead of newer requests.
    Postponed { device: u8, command: u8, attempts: u32 },
}

/// A [`LinkNotice`] stamped with the host time it was observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub notice: LinkNotice,
}

impl Diagnostic {
    pub fn now(notice: LinkNotice) -> Self {
        Self {
            timestamp: Utc::now(),
            notice,
        }
    }
}
