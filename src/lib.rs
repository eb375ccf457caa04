//! drift library
//!
//! Concurrent file transfer over UDP: a lockstep datagram protocol with
//! per-datagram acks and fragmentation, a multi-peer receiver built on a
//! work-stealing pool, and the Go-style channels that couple them.

pub mod channel;
pub mod client;
pub mod conn;
pub mod ftp;
pub mod logger;
pub mod pdu;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod translog;
