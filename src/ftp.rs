//! Application-level record header prepended to every file payload
//!
//! Layout: a 100-byte NUL-padded file-name field, a u32 protocol version,
//! an i32 status (new vs. append) and an i32 error code, all host order.

use anyhow::{bail, Result};

/// Width of the fixed file-name field.
pub const FILE_NAME_LEN: usize = 100;

/// Encoded record-header size in bytes.
pub const FTP_HEADER_SIZE: usize = FILE_NAME_LEN + 4 + 4 + 4;

pub const FTP_VERSION: u32 = 1;

/// Whether a record opens the target file fresh or extends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    New = 0,
    Append = 1,
}

/// FTP-level error codes carried in the record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtpError {
    AccessDenied = -2,
    FileNotFound = -1,
    None = 0,
    Unknown = 99,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpHeader {
    pub file_name: String,
    pub status: Status,
    pub err: FtpError,
}

impl FtpHeader {
    pub fn new(file_name: &str) -> Self {
        FtpHeader {
            file_name: file_name.to_string(),
            status: Status::New,
            err: FtpError::None,
        }
    }

    pub fn encode(&self) -> [u8; FTP_HEADER_SIZE] {
        let mut buf = [0u8; FTP_HEADER_SIZE];
        // Name is NUL-padded; over-long names are cut to leave a terminator.
        let name = self.file_name.as_bytes();
        let n = name.len().min(FILE_NAME_LEN - 1);
        buf[..n].copy_from_slice(&name[..n]);
        buf[100..104].copy_from_slice(&FTP_VERSION.to_ne_bytes());
        buf[104..108].copy_from_slice(&(self.status as i32).to_ne_bytes());
        buf[108..112].copy_from_slice(&(self.err as i32).to_ne_bytes());
        buf
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[..FTP_HEADER_SIZE].copy_from_slice(&self.encode());
    }

    /// Decode the record header off the front of a payload.
    pub fn decode(buf: &[u8]) -> Result<FtpHeader> {
        if buf.len() < FTP_HEADER_SIZE {
            bail!("record too short for ftp header: {} bytes", buf.len());
        }
        let name_field = &buf[..FILE_NAME_LEN];
        let end = name_field.iter().position(|&b| b == 0).unwrap_or(FILE_NAME_LEN);
        let file_name = String::from_utf8_lossy(&name_field[..end]).into_owned();
        if file_name.is_empty() {
            bail!("record carries an empty file name");
        }
        let status = match read_i32(&buf[104..108]) {
            0 => Status::New,
            1 => Status::Append,
            other => bail!("unknown record status {}", other),
        };
        let err = match read_i32(&buf[108..112]) {
            -2 => FtpError::AccessDenied,
            -1 => FtpError::FileNotFound,
            0 => FtpError::None,
            _ => FtpError::Unknown,
        };
        Ok(FtpHeader { file_name, status, err })
    }
}

fn read_i32(b: &[u8]) -> i32 {
    i32::from_ne_bytes([b[0], b[1], b[2], b[3]])
}
