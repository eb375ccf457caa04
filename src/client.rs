//! Sender driver: reads a local file and streams it as framed records

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::conn::Connection;
use crate::ftp::{FtpHeader, Status, FTP_HEADER_SIZE};
use crate::logger::Logger;

/// File bytes staged per read; with the record header the first datagram
/// of a full chunk always exceeds the payload cap and goes out as a
/// fragment, the remainder as a plain send.
const CHUNK: usize = 500;

/// Connect, stream the file, disconnect. Returns the payload bytes sent,
/// record headers included.
pub fn send_file(
    path: &Path,
    addr: &str,
    port: u16,
    debug: bool,
    logger: &dyn Logger,
) -> Result<u64> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("{} has no file name", path.display()))?;

    let mut conn = Connection::open((addr, port), debug)
        .with_context(|| format!("resolve {}:{}", addr, port))?;
    conn.connect().context("establishing connection")?;
    logger.connect(&format!("{}:{}", addr, port));

    let mut header = FtpHeader::new(&name);
    let mut staging = vec![0u8; FTP_HEADER_SIZE + CHUNK];
    let mut total = 0u64;
    let mut sent_any = false;

    loop {
        let bytes = file
            .read(&mut staging[FTP_HEADER_SIZE..])
            .with_context(|| format!("read {}", path.display()))?;
        if bytes == 0 {
            break;
        }
        sent_any = true;
        let mut remaining = bytes;
        while remaining > 0 {
            header.encode_into(&mut staging[..FTP_HEADER_SIZE]);
            let send_size = FTP_HEADER_SIZE + remaining;
            let consumed = conn
                .send_dgram(&staging[..send_size])
                .context("sending record datagram")?;
            if consumed < FTP_HEADER_SIZE {
                bail!("datagram write consumed less than the record header");
            }
            let data_sent = consumed - FTP_HEADER_SIZE;
            remaining -= data_sent;
            total += consumed as u64;
            if remaining > 0 {
                // Resume from the unsent tail; later records must not
                // truncate what the receiver already holds.
                header.status = Status::Append;
                staging.copy_within(
                    FTP_HEADER_SIZE + data_sent..FTP_HEADER_SIZE + data_sent + remaining,
                    FTP_HEADER_SIZE,
                );
            }
        }
        // Every chunk after the first extends the receiver's file.
        header.status = Status::Append;
    }

    if !sent_any {
        // Zero-length file: one record of header only, so the receiver
        // still creates the (empty) file.
        header.encode_into(&mut staging[..FTP_HEADER_SIZE]);
        let consumed = conn
            .send_dgram(&staging[..FTP_HEADER_SIZE])
            .context("sending empty-file record")?;
        total += consumed as u64;
    }

    conn.disconnect().context("closing connection")?;
    logger.disconnect(&format!("{}:{}", addr, port));
    Ok(total)
}
