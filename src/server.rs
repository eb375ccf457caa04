//! Receiver dispatch and per-peer file ingest
//!
//! One UDP socket serves every sender. The dispatch loop classifies each
//! datagram by peer address: the first datagram from a new peer must be a
//! bare CONNECT header, which registers the peer and spawns its ingest
//! task on the pool; later datagrams are validated, acked and pushed into
//! the peer's bounded channel. The ingest task drains that channel and
//! writes records to disk, then removes itself from the registry.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};

use crate::channel::{make_channel, Channel, ChannelError};
use crate::ftp::{FtpHeader, Status, FTP_HEADER_SIZE};
use crate::logger::Logger;
use crate::pdu::{Pdu, PDU_SIZE};
use crate::pool::ThreadPool;
use crate::protocol::{err_code, mtype, mtype_str, MAX_DGRAM};
use crate::translog::{TransferLog, TransferLogEntry, TransferStatus};

/// Depth of each peer's ingest queue.
const INGEST_QUEUE_DEPTH: usize = 20;

type Registry = Arc<Mutex<HashMap<String, Arc<FileWriter>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-peer ingest: consumes record buffers from the dispatch loop and
/// materializes them on disk.
struct FileWriter {
    peer: String,
    chan: Arc<dyn Channel<Vec<u8>>>,
}

impl FileWriter {
    fn new(peer: String) -> Self {
        FileWriter {
            peer,
            chan: make_channel(INGEST_QUEUE_DEPTH),
        }
    }

    fn push(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.chan.send(payload)
    }

    fn close_channel(&self) {
        self.chan.close();
    }

    /// Ingest loop. Exits when the channel is closed and drained. Open
    /// file handles are cached by name across records; a NEW record
    /// always re-truncates.
    fn run(&self, root: &Path, journal: &TransferLog, logger: &dyn Logger) {
        let mut open_files: HashMap<String, File> = HashMap::new();
        // name -> (bytes written, write error seen)
        let mut progress: HashMap<String, (u64, bool)> = HashMap::new();
        loop {
            let buf = match self.chan.receive() {
                Ok(b) => b,
                Err(_) => break,
            };
            let hdr = match FtpHeader::decode(&buf) {
                Ok(h) => h,
                Err(e) => {
                    eprintln!("peer {}: dropping record: {}", self.peer, e);
                    logger.error("ingest", &format!("{}", e));
                    continue;
                }
            };
            if hdr.file_name.contains(['/', '\\']) || hdr.file_name == ".." {
                eprintln!(
                    "peer {}: dropping record: unsafe file name {:?}",
                    self.peer, hdr.file_name
                );
                logger.error("ingest", "unsafe file name");
                continue;
            }
            let data = &buf[FTP_HEADER_SIZE..];
            let stats = progress.entry(hdr.file_name.clone()).or_insert((0, false));
            if hdr.status == Status::New || !open_files.contains_key(&hdr.file_name) {
                let path = root.join(&hdr.file_name);
                let opened = if hdr.status == Status::New {
                    OpenOptions::new().write(true).create(true).truncate(true).open(&path)
                } else {
                    OpenOptions::new().append(true).create(true).open(&path)
                };
                match opened {
                    Ok(f) => {
                        open_files.insert(hdr.file_name.clone(), f);
                    }
                    Err(e) => {
                        eprintln!("peer {}: cannot open {}: {}", self.peer, hdr.file_name, e);
                        logger.error("ingest", &format!("open {}: {}", hdr.file_name, e));
                        stats.1 = true;
                        continue;
                    }
                }
            }
            if let Some(file) = open_files.get_mut(&hdr.file_name) {
                match file.write_all(data) {
                    Ok(()) => stats.0 += data.len() as u64,
                    Err(e) => {
                        eprintln!("peer {}: write {}: {}", self.peer, hdr.file_name, e);
                        logger.error("ingest", &format!("write {}: {}", hdr.file_name, e));
                        stats.1 = true;
                    }
                }
            }
        }
        let mut total = 0u64;
        for (name, (bytes, errored)) in &progress {
            let status = if *errored {
                TransferStatus::Interrupted
            } else {
                TransferStatus::Completed
            };
            if let Err(e) = journal.add_entry(TransferLogEntry::new(&self.peer, name, *bytes, status)) {
                eprintln!("peer {}: journal: {}", self.peer, e);
            }
            logger.file_written(name, *bytes);
            total += bytes;
        }
        logger.done(progress.len() as u64, total, 0.0);
    }
}

pub struct Server {
    sock: UdpSocket,
    root: PathBuf,
    debug: bool,
    logger: Arc<dyn Logger>,
}

impl Server {
    /// Bind the dispatch socket on all interfaces with address reuse.
    pub fn bind(port: u16, root: &Path, debug: bool, logger: Arc<dyn Logger>) -> Result<Server> {
        let sock = bind_reuseaddr(port).with_context(|| format!("bind udp port {}", port))?;
        Ok(Server {
            sock,
            root: root.to_path_buf(),
            debug,
            logger,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    /// Dispatch loop. Runs until the socket fails.
    pub fn run(self) -> Result<()> {
        let pool = ThreadPool::new();
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let journal = Arc::new(TransferLog::new(&self.root));
        let mut seqs: HashMap<String, u32> = HashMap::new();
        let mut buf = [0u8; MAX_DGRAM];
        let result = loop {
            let (n, peer) = match self.sock.recv_from(&mut buf) {
                Ok(x) => x,
                Err(e) => break Err(e).context("receive on dispatch socket"),
            };
            let key = peer.to_string();
            let writer = lock(&registry).get(&key).cloned();
            let outcome = match writer {
                None => self.admit(&pool, &registry, &journal, &mut seqs, &buf[..n], peer),
                Some(w) => self.ingest(&mut seqs, &w, &buf[..n], peer),
            };
            if let Err(e) = outcome {
                eprintln!("dispatch error for {}: {}", key, e);
            }
        };
        // Let parked ingest tasks drain out before the pool joins.
        for writer in lock(&registry).values() {
            writer.close_channel();
        }
        result
    }

    /// First contact: must be exactly one bare CONNECT header. Registers
    /// the peer, acks with sequence 1, and spawns the ingest task with a
    /// direct writer handle plus a deregister closure.
    fn admit(
        &self,
        pool: &ThreadPool,
        registry: &Registry,
        journal: &Arc<TransferLog>,
        seqs: &mut HashMap<String, u32>,
        dgram: &[u8],
        peer: SocketAddr,
    ) -> Result<()> {
        let key = peer.to_string();
        let connect = if dgram.len() == PDU_SIZE {
            Pdu::decode(dgram).ok().filter(|p| p.mtype == mtype::CONNECT)
        } else {
            None
        };
        let Some(pdu) = connect else {
            let code = if dgram.len() < PDU_SIZE {
                err_code::BAD_DGRAM
            } else {
                err_code::PROTOCOL
            };
            let mut reply = Pdu::new(mtype::ERROR, 0, 0);
            reply.err_num = code;
            self.send_pdu(&reply, peer)?;
            eprintln!("dropping {}: first datagram is not a connect", key);
            return Ok(());
        };
        if self.debug {
            println!("PDU [in] {}", pdu);
        }
        seqs.insert(key.clone(), 1);
        let reply = Pdu::new(mtype::CNTACK, 1, 0);
        self.send_pdu(&reply, peer)?;

        let writer = Arc::new(FileWriter::new(key.clone()));
        lock(registry).insert(key.clone(), writer.clone());
        let root = self.root.clone();
        let journal = journal.clone();
        let logger = self.logger.clone();
        let deregister = {
            let registry = registry.clone();
            let key = key.clone();
            move || {
                lock(&registry).remove(&key);
            }
        };
        pool.submit(move || {
            writer.run(&root, &journal, logger.as_ref());
            deregister();
        });
        self.logger.connect(&key);
        eprintln!("connection established from {}", key);
        Ok(())
    }

    /// Known peer: validate, account the sequence, reply, and hand the
    /// payload to the peer's ingest channel. Erroneous datagrams get an
    /// ERROR reply and are not written.
    fn ingest(
        &self,
        seqs: &mut HashMap<String, u32>,
        writer: &FileWriter,
        dgram: &[u8],
        peer: SocketAddr,
    ) -> Result<()> {
        let key = peer.to_string();
        let mut failure_code = err_code::NO_ERROR;
        let mut in_pdu: Option<Pdu> = None;
        match Pdu::decode(dgram) {
            Ok(p) if p.dgram_sz < 0 || p.dgram_sz as usize > MAX_DGRAM => {
                failure_code = err_code::BUFF_UNDERSIZED;
            }
            Ok(p) => in_pdu = Some(p),
            Err(_) => failure_code = err_code::BAD_DGRAM,
        }
        if self.debug {
            if let Some(p) = &in_pdu {
                println!("PDU [in] {}", p);
            }
        }
        let seq = seqs.entry(key.clone()).or_insert(1);
        match &in_pdu {
            Some(p) if failure_code == err_code::NO_ERROR => {
                *seq = seq.wrapping_add(if p.dgram_sz > 0 { p.dgram_sz as u32 } else { 1 });
            }
            _ => *seq = seq.wrapping_add(1),
        }
        let mut reply = Pdu::new(mtype::INI, *seq as i32, 0);

        if failure_code != err_code::NO_ERROR {
            reply.mtype = mtype::ERROR;
            reply.err_num = failure_code;
            self.send_pdu(&reply, peer)?;
            return Ok(());
        }
        let pdu = in_pdu.ok_or_else(|| anyhow::anyhow!("header vanished"))?;

        // FRAGMENT is acked before the base type is considered.
        if pdu.is_fragment() {
            reply.mtype = mtype::SENDFRAGMENTACK;
            self.send_pdu(&reply, peer)?;
            self.push_payload(writer, &dgram[PDU_SIZE..], &key);
            return Ok(());
        }
        match pdu.mtype {
            mtype::SND => {
                reply.mtype = mtype::SNDACK;
                self.send_pdu(&reply, peer)?;
                self.push_payload(writer, &dgram[PDU_SIZE..], &key);
            }
            mtype::CLOSE => {
                reply.mtype = mtype::CLOSEACK;
                self.send_pdu(&reply, peer)?;
                writer.close_channel();
                seqs.remove(&key);
                self.logger.disconnect(&key);
                eprintln!("peer {} closed", key);
            }
            other => {
                eprintln!("peer {}: unexpected mtype {} in header", key, mtype_str(other));
                reply.mtype = mtype::ERROR;
                reply.err_num = err_code::PROTOCOL;
                self.send_pdu(&reply, peer)?;
            }
        }
        Ok(())
    }

    fn push_payload(&self, writer: &FileWriter, payload: &[u8], key: &str) {
        if payload.is_empty() {
            return;
        }
        if let Err(e) = writer.push(payload.to_vec()) {
            eprintln!("peer {}: ingest channel refused payload: {}", key, e);
        }
    }

    fn send_pdu(&self, pdu: &Pdu, peer: SocketAddr) -> Result<()> {
        if self.debug {
            println!("PDU [out] {}", pdu);
        }
        let n = self.sock.send_to(&pdu.encode(), peer)?;
        if n != PDU_SIZE {
            anyhow::bail!("short header write: {} bytes", n);
        }
        Ok(())
    }
}

#[cfg(unix)]
fn bind_reuseaddr(port: u16) -> Result<UdpSocket> {
    use std::os::fd::FromRawFd;
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error()).context("socket creation failed");
        }
        let one: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) != 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err).context("setsockopt(SO_REUSEADDR) failed");
        }
        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = libc::INADDR_ANY;
        if libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) != 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err).context("bind failed");
        }
        Ok(UdpSocket::from_raw_fd(fd))
    }
}

#[cfg(not(unix))]
fn bind_reuseaddr(port: u16) -> Result<UdpSocket> {
    Ok(UdpSocket::bind(("0.0.0.0", port))?)
}
