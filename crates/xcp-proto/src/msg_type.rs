//! Message type identifiers.
//!
//! The `msg_type` header field splits the u16 space: `0x0000–0x00FF` is
//! control, everything from [`MsgType::DATA_MIN`] up is application data.
//! Control values not listed here are reserved and rejected.

/// Message type carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// Client-initiated capability advertisement.
    Hello,
    /// Positive delivery acknowledgement.
    Ack,
    /// Negative acknowledgement with an error code.
    Nack,
    /// Liveness probe carrying a nonce.
    Ping,
    /// Liveness reply echoing the nonce.
    Pong,
    /// Request for clarification of a prior message.
    ClarifyReq,
    /// Clarification response; `in_reply_to` is set.
    ClarifyRes,
    /// Server capability advertisement (response to Hello).
    Caps,
    /// Graceful close with a reason.
    Goodbye,
    /// Application data message (`value >= 0x0100`).
    Data(u16),
}

impl MsgType {
    /// First msg_type value in the data range.
    pub const DATA_MIN: u16 = 0x0100;

    /// Numeric wire value.
    #[must_use]
    pub fn to_u16(self) -> u16 {
        match self {
            Self::Hello => 0x0000,
            Self::Ack => 0x0001,
            Self::Nack => 0x0002,
            Self::Ping => 0x0003,
            Self::Pong => 0x0004,
            Self::ClarifyReq => 0x0005,
            Self::ClarifyRes => 0x0006,
            Self::Caps => 0x0007,
            Self::Goodbye => 0x0008,
            Self::Data(value) => value,
        }
    }

    /// Parse a wire value. `None` for reserved control values.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::Hello),
            0x0001 => Some(Self::Ack),
            0x0002 => Some(Self::Nack),
            0x0003 => Some(Self::Ping),
            0x0004 => Some(Self::Pong),
            0x0005 => Some(Self::ClarifyReq),
            0x0006 => Some(Self::ClarifyRes),
            0x0007 => Some(Self::Caps),
            0x0008 => Some(Self::Goodbye),
            v if v >= Self::DATA_MIN => Some(Self::Data(v)),
            _ => None,
        }
    }

    /// True for the control range (`< 0x0100`).
    #[must_use]
    pub fn is_control(self) -> bool {
        self.to_u16() < Self::DATA_MIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_round_trip() {
        for value in 0x0000..=0x0008 {
            let parsed = MsgType::from_u16(value).unwrap();
            assert_eq!(parsed.to_u16(), value);
            assert!(parsed.is_control());
        }
    }

    #[test]
    fn reserved_control_rejected() {
        assert_eq!(MsgType::from_u16(0x0009), None);
        assert_eq!(MsgType::from_u16(0x00FF), None);
    }

    #[test]
    fn data_range() {
        let data = MsgType::from_u16(0x0100).unwrap();
        assert_eq!(data, MsgType::Data(0x0100));
        assert!(!data.is_control());
        assert_eq!(MsgType::from_u16(0xFFFF), Some(MsgType::Data(0xFFFF)));
    }
}
