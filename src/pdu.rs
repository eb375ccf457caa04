//! Fixed-header codec for the datagram prefix
//!
//! Every datagram starts with five host-order i32 fields: protocol
//! version, message type, sequence number, payload size, error number.
//! The payload, if any, immediately follows in the same datagram.

use std::fmt;

use anyhow::{bail, Result};

use crate::protocol::{mtype, mtype_str, PROTO_VERSION};

/// Encoded header size in bytes.
pub const PDU_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pdu {
    pub proto_ver: i32,
    pub mtype: i32,
    pub seqnum: i32,
    pub dgram_sz: i32,
    pub err_num: i32,
}

impl Pdu {
    pub fn new(mtype: i32, seqnum: i32, dgram_sz: i32) -> Self {
        Pdu {
            proto_ver: PROTO_VERSION,
            mtype,
            seqnum,
            dgram_sz,
            err_num: 0,
        }
    }

    pub fn encode(&self) -> [u8; PDU_SIZE] {
        let mut buf = [0u8; PDU_SIZE];
        buf[0..4].copy_from_slice(&self.proto_ver.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.mtype.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.seqnum.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.dgram_sz.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.err_num.to_ne_bytes());
        buf
    }

    /// Decode the leading header bytes of a datagram.
    pub fn decode(buf: &[u8]) -> Result<Pdu> {
        if buf.len() < PDU_SIZE {
            bail!("datagram too short for header: {} bytes", buf.len());
        }
        Ok(Pdu {
            proto_ver: read_i32(&buf[0..4]),
            mtype: read_i32(&buf[4..8]),
            seqnum: read_i32(&buf[8..12]),
            dgram_sz: read_i32(&buf[12..16]),
            err_num: read_i32(&buf[16..20]),
        })
    }

    pub fn is_fragment(&self) -> bool {
        self.mtype & mtype::FRAGMENT == mtype::FRAGMENT
    }
}

fn read_i32(b: &[u8]) -> i32 {
    i32::from_ne_bytes([b[0], b[1], b[2], b[3]])
}

impl fmt::Display for Pdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ver={} type={} seq={} sz={} err={}",
            self.proto_ver,
            mtype_str(self.mtype),
            self.seqnum,
            self.dgram_sz,
            self.err_num
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let pdu = Pdu::new(mtype::SND, 42, 512);
        let bytes = pdu.encode();
        let back = Pdu::decode(&bytes).unwrap();
        assert_eq!(back, pdu);
        assert_eq!(back.proto_ver, PROTO_VERSION);
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        let bytes = [0u8; PDU_SIZE - 1];
        assert!(Pdu::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_ignores_trailing_payload() {
        let pdu = Pdu::new(mtype::SENDFRAGMENT, 7, 512);
        let mut dgram = Vec::from(pdu.encode());
        dgram.extend_from_slice(&[0xAB; 512]);
        let back = Pdu::decode(&dgram).unwrap();
        assert_eq!(back, pdu);
        assert!(back.is_fragment());
    }

    #[test]
    fn test_fragment_bit_detection() {
        assert!(Pdu::new(mtype::SENDFRAGMENT, 0, 512).is_fragment());
        assert!(Pdu::new(mtype::SENDFRAGMENTACK, 0, 0).is_fragment());
        assert!(!Pdu::new(mtype::SND, 0, 100).is_fragment());
        assert!(!Pdu::new(mtype::CLOSE, 0, 0).is_fragment());
    }

    #[test]
    fn test_negative_error_codes_survive() {
        let mut pdu = Pdu::new(mtype::ERROR, 3, 0);
        pdu.err_num = crate::protocol::err_code::BUFF_UNDERSIZED;
        let back = Pdu::decode(&pdu.encode()).unwrap();
        assert_eq!(back.err_num, -4);
    }
}
