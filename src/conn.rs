//! Per-peer datagram protocol engine
//!
//! Owns one UDP socket and one peer. Layers connect/close negotiation,
//! per-datagram acknowledgement, fragmentation and sequence accounting on
//! top of the connectionless transport. There is no retransmission: the
//! sequence numbers are advisory and the ack exchange is lockstep.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use crate::pdu::{Pdu, PDU_SIZE};
use crate::protocol::{err_code, mtype, mtype_str, ProtoError, MAX_DGRAM, MAX_PAYLOAD};

pub struct Connection {
    sock: UdpSocket,
    peer: SocketAddr,
    seq: u32,
    connected: bool,
    closed: bool,
    debug: bool,
}

impl Connection {
    /// Unbound client socket aimed at the given peer.
    pub fn open<A: ToSocketAddrs>(peer: A, debug: bool) -> Result<Connection, ProtoError> {
        let peer = peer
            .to_socket_addrs()?
            .next()
            .ok_or(ProtoError::General("peer address did not resolve"))?;
        let sock = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Connection {
            sock,
            peer,
            seq: 0,
            connected: false,
            closed: false,
            debug,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProtoError> {
        Ok(self.sock.local_addr()?)
    }

    /// CONNECT/CNTACK handshake. On success the sequence advances by one
    /// and the engine is open for datagrams.
    pub fn connect(&mut self) -> Result<(), ProtoError> {
        let pdu = Pdu::new(mtype::CONNECT, self.seq as i32, 0);
        self.send_header(&pdu)?;
        let reply = self.recv_header()?;
        if reply.mtype != mtype::CNTACK {
            return Err(ProtoError::Protocol);
        }
        self.seq = self.seq.wrapping_add(1);
        self.connected = true;
        Ok(())
    }

    /// CLOSE/CLOSEACK exchange. The engine is terminal afterwards: every
    /// further operation fails with the connection-closed error.
    pub fn disconnect(&mut self) -> Result<(), ProtoError> {
        let pdu = Pdu::new(mtype::CLOSE, self.seq as i32, 0);
        self.send_header(&pdu)?;
        let reply = self.recv_header()?;
        if reply.mtype != mtype::CLOSEACK {
            return Err(ProtoError::General("expected CLOSE/ACK reply"));
        }
        self.connected = false;
        self.closed = true;
        Ok(())
    }

    /// Frame and transmit one datagram. Payloads over the cap are cut to
    /// the cap and flagged FRAGMENT; the stream-level send relies on the
    /// returned consumption to advance. The trailing ack read is advisory:
    /// a mismatch is diagnosed, not fatal.
    pub fn send_dgram(&mut self, payload: &[u8]) -> Result<usize, ProtoError> {
        if self.closed {
            return Err(ProtoError::ConnectionClosed);
        }
        let take = payload.len().min(MAX_PAYLOAD);
        let mt = if payload.len() > MAX_PAYLOAD {
            mtype::SENDFRAGMENT
        } else {
            mtype::SND
        };
        let pdu = Pdu::new(mt, self.seq as i32, take as i32);
        let mut dgram = [0u8; MAX_DGRAM];
        dgram[..PDU_SIZE].copy_from_slice(&pdu.encode());
        dgram[PDU_SIZE..PDU_SIZE + take].copy_from_slice(&payload[..take]);
        let total = PDU_SIZE + take;
        let sent = self.send_raw(&dgram[..total])?;
        if sent != total {
            eprintln!("warning: sent {} of {} datagram bytes", sent, total);
        }
        self.account(take as i32);

        let mut ack_buf = [0u8; PDU_SIZE];
        let n = self.recv_raw(&mut ack_buf)?;
        match Pdu::decode(&ack_buf[..n]) {
            Ok(ack) if ack.mtype == mtype::SNDACK || ack.mtype == mtype::SENDFRAGMENTACK => {}
            Ok(ack) => eprintln!(
                "warning: expected SEND/ACK but got {}",
                mtype_str(ack.mtype)
            ),
            Err(_) => eprintln!("warning: short SEND/ACK reply: {} bytes", n),
        }
        Ok(take)
    }

    /// Stream-level send: loops datagrams until the whole buffer is
    /// consumed, advancing by each datagram's reported consumption.
    pub fn send(&mut self, buf: &[u8]) -> Result<usize, ProtoError> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.send_dgram(&buf[total..])?;
            if n == 0 {
                return Err(ProtoError::General("datagram made no progress"));
            }
            total += n;
        }
        Ok(total)
    }

    /// Receive one datagram, validate it, account the sequence, and reply
    /// with the matching ack (or an ERROR carrying the code). Returns the
    /// raw byte count, header included.
    pub fn recv_dgram(&mut self, buf: &mut [u8]) -> Result<usize, ProtoError> {
        if self.closed {
            return Err(ProtoError::ConnectionClosed);
        }
        if buf.len() > MAX_DGRAM {
            return Err(ProtoError::BuffOversized);
        }
        let bytes_in = self.recv_raw(buf)?;

        let mut failure: Option<ProtoError> = None;
        let mut in_pdu: Option<Pdu> = None;
        match Pdu::decode(&buf[..bytes_in]) {
            Ok(pdu) if pdu.dgram_sz < 0 || pdu.dgram_sz as usize > buf.len() => {
                failure = Some(ProtoError::BuffUndersized);
            }
            Ok(pdu) => in_pdu = Some(pdu),
            Err(_) => failure = Some(ProtoError::BadDgram),
        }

        match &in_pdu {
            Some(pdu) if failure.is_none() => self.account(pdu.dgram_sz),
            _ => self.account(0),
        }

        let mut reply = Pdu::new(mtype::INI, self.seq as i32, 0);
        if let Some(err) = failure {
            reply.mtype = mtype::ERROR;
            reply.err_num = err.code();
            self.send_header(&reply).map_err(|_| ProtoError::Protocol)?;
            return Err(err);
        }
        let pdu = in_pdu.ok_or(ProtoError::BadDgram)?;

        // The FRAGMENT bit is acked before the base type is considered.
        if pdu.is_fragment() {
            reply.mtype = mtype::SENDFRAGMENTACK;
            self.send_header(&reply).map_err(|_| ProtoError::Protocol)?;
            return Ok(bytes_in);
        }
        match pdu.mtype {
            mtype::SND => {
                reply.mtype = mtype::SNDACK;
                self.send_header(&reply).map_err(|_| ProtoError::Protocol)?;
                Ok(bytes_in)
            }
            mtype::CLOSE => {
                reply.mtype = mtype::CLOSEACK;
                self.send_header(&reply).map_err(|_| ProtoError::Protocol)?;
                self.connected = false;
                self.closed = true;
                Err(ProtoError::ConnectionClosed)
            }
            other => {
                eprintln!("unexpected mtype {} in header", mtype_str(other));
                reply.mtype = mtype::ERROR;
                reply.err_num = err_code::PROTOCOL;
                self.send_header(&reply).map_err(|_| ProtoError::Protocol)?;
                Err(ProtoError::Protocol)
            }
        }
    }

    /// Stream-level receive: concatenates datagram payloads until a
    /// non-fragment arrives or the output buffer fills.
    pub fn recv(&mut self, out: &mut [u8]) -> Result<usize, ProtoError> {
        let mut staging = [0u8; MAX_DGRAM];
        let mut total = 0;
        loop {
            let n = self.recv_dgram(&mut staging)?;
            let payload = n.saturating_sub(PDU_SIZE);
            let copied = payload.min(out.len() - total);
            out[total..total + copied].copy_from_slice(&staging[PDU_SIZE..PDU_SIZE + copied]);
            total += copied;
            let pdu = Pdu::decode(&staging[..PDU_SIZE]).map_err(|_| ProtoError::BadDgram)?;
            if !pdu.is_fragment() || total == out.len() {
                break;
            }
        }
        Ok(total)
    }

    // seq += payload size, or += 1 for empty or erroneous datagrams.
    fn account(&mut self, dgram_sz: i32) {
        self.seq = self.seq.wrapping_add(if dgram_sz > 0 { dgram_sz as u32 } else { 1 });
    }

    fn send_header(&mut self, pdu: &Pdu) -> Result<(), ProtoError> {
        let n = self.send_raw(&pdu.encode())?;
        if n != PDU_SIZE {
            return Err(ProtoError::General("short header write"));
        }
        Ok(())
    }

    fn recv_header(&mut self) -> Result<Pdu, ProtoError> {
        let mut buf = [0u8; PDU_SIZE];
        let n = self.recv_raw(&mut buf)?;
        if n != PDU_SIZE {
            return Err(ProtoError::General("short header read"));
        }
        Pdu::decode(&buf).map_err(|_| ProtoError::BadDgram)
    }

    fn send_raw(&mut self, buf: &[u8]) -> Result<usize, ProtoError> {
        if self.closed {
            return Err(ProtoError::ConnectionClosed);
        }
        let n = self.sock.send_to(buf, self.peer)?;
        if self.debug {
            if let Ok(pdu) = Pdu::decode(buf) {
                println!("PDU [out] {}", pdu);
            }
        }
        Ok(n)
    }

    fn recv_raw(&mut self, buf: &mut [u8]) -> Result<usize, ProtoError> {
        if self.closed {
            return Err(ProtoError::ConnectionClosed);
        }
        let (n, from) = self.sock.recv_from(buf)?;
        // Replies go back to the most recent source.
        self.peer = from;
        if self.debug {
            if let Ok(pdu) = Pdu::decode(&buf[..n]) {
                println!("PDU [in] {}", pdu);
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // Raw-socket stand-in for the far side of the exchange.
    struct FakePeer {
        sock: UdpSocket,
        client: Option<SocketAddr>,
    }

    impl FakePeer {
        fn bind() -> Self {
            let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
            sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            FakePeer { sock, client: None }
        }

        fn addr(&self) -> SocketAddr {
            self.sock.local_addr().unwrap()
        }

        fn recv(&mut self) -> (Pdu, Vec<u8>) {
            let mut buf = [0u8; MAX_DGRAM];
            let (n, from) = self.sock.recv_from(&mut buf).unwrap();
            self.client = Some(from);
            let pdu = Pdu::decode(&buf[..n]).unwrap();
            (pdu, buf[PDU_SIZE..n].to_vec())
        }

        fn send(&self, pdu: &Pdu) {
            self.sock.send_to(&pdu.encode(), self.client.unwrap()).unwrap();
        }

        fn send_to(&self, pdu: &Pdu, payload: &[u8], dest: SocketAddr) {
            let mut dgram = Vec::from(pdu.encode());
            dgram.extend_from_slice(payload);
            self.sock.send_to(&dgram, dest).unwrap();
        }

        fn ack(&mut self, ack_type: i32, seq: i32) {
            let pdu = Pdu::new(ack_type, seq, 0);
            self.send(&pdu);
        }
    }

    #[test]
    fn test_connect_handshake() {
        let mut peer = FakePeer::bind();
        let addr = peer.addr();
        let driver = std::thread::spawn(move || {
            let mut conn = Connection::open(addr, false).unwrap();
            conn.connect().unwrap();
            assert!(conn.is_connected());
            assert_eq!(conn.seq(), 1);
        });
        let (pdu, payload) = peer.recv();
        assert_eq!(pdu.mtype, mtype::CONNECT);
        assert_eq!(pdu.seqnum, 0);
        assert_eq!(pdu.dgram_sz, 0);
        assert!(payload.is_empty());
        peer.ack(mtype::CNTACK, 1);
        driver.join().unwrap();
    }

    #[test]
    fn test_connect_rejects_wrong_reply() {
        let mut peer = FakePeer::bind();
        let addr = peer.addr();
        let driver = std::thread::spawn(move || {
            let mut conn = Connection::open(addr, false).unwrap();
            assert!(matches!(conn.connect(), Err(ProtoError::Protocol)));
            assert!(!conn.is_connected());
        });
        let _ = peer.recv();
        peer.ack(mtype::SNDACK, 1);
        driver.join().unwrap();
    }

    #[test]
    fn test_send_dgram_truncates_oversized_payloads() {
        let mut peer = FakePeer::bind();
        let addr = peer.addr();
        let driver = std::thread::spawn(move || {
            let mut conn = Connection::open(addr, false).unwrap();
            let payload = vec![7u8; 700];
            let consumed = conn.send_dgram(&payload).unwrap();
            assert_eq!(consumed, MAX_PAYLOAD);
            let consumed = conn.send_dgram(&payload[consumed..]).unwrap();
            assert_eq!(consumed, 188);
        });
        let (pdu, payload) = peer.recv();
        assert_eq!(pdu.mtype, mtype::SENDFRAGMENT);
        assert_eq!(pdu.dgram_sz, MAX_PAYLOAD as i32);
        assert_eq!(payload.len(), MAX_PAYLOAD);
        peer.ack(mtype::SENDFRAGMENTACK, pdu.seqnum + pdu.dgram_sz);
        let (pdu, payload) = peer.recv();
        assert_eq!(pdu.mtype, mtype::SND);
        assert_eq!(pdu.dgram_sz, 188);
        assert_eq!(payload.len(), 188);
        peer.ack(mtype::SNDACK, pdu.seqnum + pdu.dgram_sz);
        driver.join().unwrap();
    }

    #[test]
    fn test_outbound_sequence_is_sum_of_prior_payloads() {
        let mut peer = FakePeer::bind();
        let addr = peer.addr();
        let driver = std::thread::spawn(move || {
            let mut conn = Connection::open(addr, false).unwrap();
            conn.connect().unwrap();
            let buf = vec![1u8; 1200];
            let sent = conn.send(&buf).unwrap();
            assert_eq!(sent, 1200);
            // connect counted one, then 512 + 512 + 176.
            assert_eq!(conn.seq(), 1 + 1200);
        });
        let (pdu, _) = peer.recv();
        assert_eq!(pdu.seqnum, 0);
        peer.ack(mtype::CNTACK, 1);
        let mut expected_seq = 1i32;
        for expected_sz in [512, 512, 176] {
            let (pdu, _) = peer.recv();
            assert_eq!(pdu.seqnum, expected_seq);
            assert_eq!(pdu.dgram_sz, expected_sz);
            expected_seq += expected_sz;
            let ack = if pdu.is_fragment() {
                mtype::SENDFRAGMENTACK
            } else {
                mtype::SNDACK
            };
            peer.ack(ack, expected_seq);
        }
        driver.join().unwrap();
    }

    #[test]
    fn test_recv_dgram_rejects_oversized_receive_buffer() {
        let peer = FakePeer::bind();
        let mut conn = Connection::open(peer.addr(), false).unwrap();
        let mut buf = [0u8; MAX_DGRAM + 1];
        assert!(matches!(
            conn.recv_dgram(&mut buf),
            Err(ProtoError::BuffOversized)
        ));
    }

    #[test]
    fn test_undersized_buffer_elicits_error_reply() {
        let mut peer = FakePeer::bind();
        let addr = peer.addr();
        let (tx, rx) = std::sync::mpsc::channel();
        let driver = std::thread::spawn(move || {
            let mut conn = Connection::open(addr, false).unwrap();
            tx.send(conn.local_addr().unwrap()).unwrap();
            let mut buf = [0u8; 300];
            assert!(matches!(
                conn.recv_dgram(&mut buf),
                Err(ProtoError::BuffUndersized)
            ));
        });
        let dest = rx.recv().unwrap();
        // Claims 400 payload bytes against a 300-byte receive buffer.
        let lying = Pdu::new(mtype::SND, 0, 400);
        peer.send_to(&lying, &[0u8; 100], dest);
        let (reply, _) = peer.recv();
        assert_eq!(reply.mtype, mtype::ERROR);
        assert_eq!(reply.err_num, err_code::BUFF_UNDERSIZED);
        driver.join().unwrap();
    }

    #[test]
    fn test_close_exchange_is_terminal() {
        let mut peer = FakePeer::bind();
        let addr = peer.addr();
        let (tx, rx) = std::sync::mpsc::channel();
        let driver = std::thread::spawn(move || {
            let mut conn = Connection::open(addr, false).unwrap();
            tx.send(conn.local_addr().unwrap()).unwrap();
            let mut buf = [0u8; MAX_DGRAM];
            assert!(matches!(
                conn.recv_dgram(&mut buf),
                Err(ProtoError::ConnectionClosed)
            ));
            // Terminal: both directions now refuse.
            assert!(matches!(
                conn.send_dgram(b"late"),
                Err(ProtoError::ConnectionClosed)
            ));
            assert!(matches!(
                conn.recv_dgram(&mut buf),
                Err(ProtoError::ConnectionClosed)
            ));
        });
        let dest = rx.recv().unwrap();
        peer.send_to(&Pdu::new(mtype::CLOSE, 0, 0), &[], dest);
        let (reply, _) = peer.recv();
        assert_eq!(reply.mtype, mtype::CLOSEACK);
        driver.join().unwrap();
    }

    #[test]
    fn test_disconnect_closes_engine() {
        let mut peer = FakePeer::bind();
        let addr = peer.addr();
        let driver = std::thread::spawn(move || {
            let mut conn = Connection::open(addr, false).unwrap();
            conn.connect().unwrap();
            conn.disconnect().unwrap();
            assert!(!conn.is_connected());
            assert!(matches!(
                conn.send_dgram(b"x"),
                Err(ProtoError::ConnectionClosed)
            ));
        });
        let (pdu, _) = peer.recv();
        assert_eq!(pdu.mtype, mtype::CONNECT);
        peer.ack(mtype::CNTACK, 1);
        let (pdu, _) = peer.recv();
        assert_eq!(pdu.mtype, mtype::CLOSE);
        peer.ack(mtype::CLOSEACK, pdu.seqnum);
        driver.join().unwrap();
    }

    #[test]
    fn test_recv_reassembles_fragments() {
        let mut peer = FakePeer::bind();
        let addr = peer.addr();
        let (tx, rx) = std::sync::mpsc::channel();
        let driver = std::thread::spawn(move || {
            let mut conn = Connection::open(addr, false).unwrap();
            tx.send(conn.local_addr().unwrap()).unwrap();
            let mut out = vec![0u8; 2048];
            let n = conn.recv(&mut out).unwrap();
            assert_eq!(n, 700);
            assert!(out[..512].iter().all(|&b| b == 0xAA));
            assert!(out[512..700].iter().all(|&b| b == 0xBB));
        });
        let dest = rx.recv().unwrap();
        peer.send_to(
            &Pdu::new(mtype::SENDFRAGMENT, 0, 512),
            &[0xAA; 512],
            dest,
        );
        let (reply, _) = peer.recv();
        assert_eq!(reply.mtype, mtype::SENDFRAGMENTACK);
        peer.send_to(&Pdu::new(mtype::SND, 512, 188), &[0xBB; 188], dest);
        let (reply, _) = peer.recv();
        assert_eq!(reply.mtype, mtype::SNDACK);
        driver.join().unwrap();
    }
}
