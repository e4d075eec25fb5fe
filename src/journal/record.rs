//! Self-delimiting, corruption-tolerant record framing.
//!
//! Each record is `[u32 length][bincode payload][u32 crc32]`. The length
//! prefix makes records self-delimiting (a reader knows exactly how many
//! bytes to consume without looking ahead); the CRC32 trailer detects
//! corruption independent of truncation.

use std::io::{self, Read, Write};

use serde::{de::DeserializeOwned, Serialize};

use crate::task::{Task, Transaction};

/// Read exactly `buf.len()` bytes unless EOF is hit first; returns the
/// number of bytes actually read so the caller can distinguish a clean
/// end-of-stream (0 bytes read) from a truncated record (partial read).
fn read_fully<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match r.read(&mut buf[total..])? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}

fn write_record<W: Write>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = payload.len() as u32;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(payload)?;
    let crc = crc32fast::hash(payload);
    w.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Reads one record's raw payload bytes.
///
/// Returns `Ok(None)` on a clean end of stream (no bytes read at all before
/// EOF). Returns `Err(UnexpectedEof)` if EOF was hit partway through a
/// record (truncated length prefix, payload, or CRC trailer) — this is the
/// case the one-trailing-partial-record recovery tolerance applies to.
/// Returns `Err(InvalidData)` on a CRC mismatch, which is never tolerated.
fn read_record<R: Read>(r: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let n = read_fully(r, &mut len_buf)?;
    if n == 0 {
        return Ok(None);
    }
    if n < 4 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated record length"));
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    let n = read_fully(r, &mut payload)?;
    if n < len {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated record payload"));
    }

    let mut crc_buf = [0u8; 4];
    let n = read_fully(r, &mut crc_buf)?;
    if n < 4 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated record crc"));
    }
    let expected = u32::from_le_bytes(crc_buf);
    let actual = crc32fast::hash(&payload);
    if actual != expected {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "record crc mismatch"));
    }

    Ok(Some(payload))
}

fn encode<T: Serialize>(value: &T) -> io::Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> io::Result<T> {
    bincode::deserialize(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub fn write_task<W: Write>(w: &mut W, task: &Task) -> io::Result<()> {
    write_record(w, &encode(task)?)
}

pub fn read_task<R: Read>(r: &mut R) -> io::Result<Option<Task>> {
    match read_record(r)? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

pub fn write_transaction<W: Write>(w: &mut W, txn: &Transaction) -> io::Result<()> {
    write_record(w, &encode(txn)?)
}

pub fn read_transaction<R: Read>(r: &mut R) -> io::Result<Option<Transaction>> {
    match read_record(r)? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}
