//! Shared wire constants for the drift datagram protocol

use thiserror::Error;

// Protocol header constants
pub const PROTO_VERSION: i32 = 1;

/// Maximum payload carried by a single datagram. Anything larger is
/// truncated to this size and sent with the FRAGMENT bit set.
pub const MAX_PAYLOAD: usize = 512;

/// Maximum on-the-wire datagram: fixed header plus a full payload.
pub const MAX_DGRAM: usize = crate::pdu::PDU_SIZE + MAX_PAYLOAD;

// Message-type bitfield. FRAGMENT is a modifier orthogonal to the base
// type; ERROR is never composed.
pub mod mtype {
    pub const INI: i32 = 0;
    pub const ACK: i32 = 1;
    pub const SND: i32 = 2;
    pub const CONNECT: i32 = 4;
    pub const CLOSE: i32 = 8;
    pub const NACK: i32 = 16;
    pub const FRAGMENT: i32 = 32;
    pub const ERROR: i32 = 64;

    pub const SNDACK: i32 = SND | ACK;
    pub const CNTACK: i32 = CONNECT | ACK;
    pub const CLOSEACK: i32 = CLOSE | ACK;
    pub const SENDFRAGMENT: i32 = FRAGMENT | SND;
    pub const SENDFRAGMENTACK: i32 = FRAGMENT | SND | ACK;
}

/// Stable short names for diagnostics.
pub fn mtype_str(mtype: i32) -> &'static str {
    match mtype {
        self::mtype::ACK => "ACK",
        self::mtype::SND => "SEND",
        self::mtype::CONNECT => "CONNECT",
        self::mtype::CLOSE => "CLOSE",
        self::mtype::NACK => "NACK",
        self::mtype::ERROR => "ERROR",
        self::mtype::SNDACK => "SEND/ACK",
        self::mtype::CNTACK => "CONNECT/ACK",
        self::mtype::CLOSEACK => "CLOSE/ACK",
        self::mtype::SENDFRAGMENT => "SEND FRAGMENT",
        self::mtype::SENDFRAGMENTACK => "SEND FRAGMENT/ACK",
        _ => "***UNKNOWN***",
    }
}

// Negative error codes carried in the err_num header field.
pub mod err_code {
    pub const NO_ERROR: i32 = 0;
    pub const GENERAL: i32 = -1;
    pub const PROTOCOL: i32 = -2;
    pub const BUFF_UNDERSIZED: i32 = -4;
    pub const BUFF_OVERSIZED: i32 = -8;
    pub const CONNECTION_CLOSED: i32 = -16;
    pub const BAD_DGRAM: i32 = -32;
}

/// Failures on the protocol surface. Each maps to the wire code placed in
/// an outbound ERROR reply's err_num field.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("general transport failure: {0}")]
    General(&'static str),
    #[error("protocol violation")]
    Protocol,
    #[error("receive buffer smaller than the inbound payload")]
    BuffUndersized,
    #[error("receive buffer larger than the maximum datagram")]
    BuffOversized,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("malformed datagram")]
    BadDgram,
}

impl ProtoError {
    pub fn code(&self) -> i32 {
        match self {
            ProtoError::Io(_) | ProtoError::General(_) => err_code::GENERAL,
            ProtoError::Protocol => err_code::PROTOCOL,
            ProtoError::BuffUndersized => err_code::BUFF_UNDERSIZED,
            ProtoError::BuffOversized => err_code::BUFF_OVERSIZED,
            ProtoError::ConnectionClosed => err_code::CONNECTION_CLOSED,
            ProtoError::BadDgram => err_code::BAD_DGRAM,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composites_are_bitwise_or() {
        assert_eq!(mtype::SNDACK, mtype::SND | mtype::ACK);
        assert_eq!(mtype::CNTACK, mtype::CONNECT | mtype::ACK);
        assert_eq!(mtype::CLOSEACK, mtype::CLOSE | mtype::ACK);
        assert_eq!(mtype::SENDFRAGMENT, mtype::FRAGMENT | mtype::SND);
        assert_eq!(mtype::SENDFRAGMENTACK, mtype::FRAGMENT | mtype::SND | mtype::ACK);
    }

    #[test]
    fn test_mtype_strings() {
        assert_eq!(mtype_str(mtype::SND), "SEND");
        assert_eq!(mtype_str(mtype::SNDACK), "SEND/ACK");
        assert_eq!(mtype_str(mtype::SENDFRAGMENT), "SEND FRAGMENT");
        assert_eq!(mtype_str(mtype::SENDFRAGMENTACK), "SEND FRAGMENT/ACK");
        assert_eq!(mtype_str(1234), "***UNKNOWN***");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ProtoError::Protocol.code(), err_code::PROTOCOL);
        assert_eq!(ProtoError::BuffUndersized.code(), err_code::BUFF_UNDERSIZED);
        assert_eq!(ProtoError::BuffOversized.code(), err_code::BUFF_OVERSIZED);
        assert_eq!(ProtoError::ConnectionClosed.code(), err_code::CONNECTION_CLOSED);
        assert_eq!(ProtoError::BadDgram.code(), err_code::BAD_DGRAM);
        assert_eq!(ProtoError::General("x").code(), err_code::GENERAL);
    }

    #[test]
    fn test_max_dgram_is_header_plus_payload() {
        assert_eq!(MAX_DGRAM, crate::pdu::PDU_SIZE + MAX_PAYLOAD);
    }
}
