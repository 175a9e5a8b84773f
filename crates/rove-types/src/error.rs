use thiserror::Error;

/// Error taxonomy shared by the codec, the connection and the behaviors.
///
/// Unknown events and event-id gaps are not errors; they surface as
/// [`LinkNotice`][crate::notice::LinkNotice] values instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoveError {
    #[error("corrupt frame: trailer {actual:#04x}, computed crc {expected:#04x}")]
    CorruptFrame { expected: u8, actual: u8 },

    #[error("frame must be 20 bytes, got {0}")]
    WrongFrameLength(usize),

    #[error("payload of {0} bytes exceeds the 16-byte frame payload")]
    PayloadTooLarge(usize),

    #[error("transport busy")]
    TransportBusy,

    #[error("transport failure: {0}")]
    TransportFatal(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("{field} = {value} is outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("event thresholds did not read back after {0} attempts")]
    ThresholdsNotConverged(u32),

    #[error("all 256 sequence ids are in flight")]
    SequenceExhausted,
}

impl RoveError {
    /// `true` when the link can no longer carry traffic.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoveError::ConnectionClosed | RoveError::TransportFatal(_))
    }
}

/// Check `value` against an inclusive range before it is written to a frame.
pub fn check_range(field: &'static str, value: i64, min: i64, max: i64) -> Result<(), RoveError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(RoveError::OutOfRange { field, value, min, max })
    }
}
