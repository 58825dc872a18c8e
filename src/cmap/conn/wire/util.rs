use std::{
    io::{Read, Write},
    sync::atomic::{AtomicI32, Ordering},
};

use crate::error::{Error, Result};

/// Closure to obtain a new, unique request ID.
pub(crate) fn next_request_id() -> i32 {
    static REQUEST_ID: AtomicI32 = AtomicI32::new(0);

    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

pub(super) struct SyncCountReader<R> {
    reader: R,
    bytes_read: usize,
}

impl<R: Read> SyncCountReader<R> {
    /// Constructs a new CountReader that wraps `reader`.
    pub(super) fn new(reader: R) -> Self {
        SyncCountReader {
            reader,
            bytes_read: 0,
        }
    }

    /// Gets the number of bytes read so far.
    pub(super) fn bytes_read(&self) -> usize {
        self.bytes_read
    }
}

impl<R: Read> Read for SyncCountReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes = self.reader.read(buf)?;
        self.bytes_read += bytes;
        Ok(bytes)
    }
}

/// Little-endian reads over an in-memory message body.
pub(super) trait SyncLittleEndianRead: Read {
    fn read_u8_sync(&mut self) -> Result<u8> {
        let mut buf = [0; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_i32_sync(&mut self) -> Result<i32> {
        let mut buf = [0; 4];
        self.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn read_u32_sync(&mut self) -> Result<u32> {
        let mut buf = [0; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i64_sync(&mut self) -> Result<i64> {
        let mut buf = [0; 8];
        self.read_exact(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    /// Reads a null-terminated string, returning it along with the number of bytes consumed.
    fn read_cstring_sync(&mut self) -> Result<(String, usize)> {
        let mut bytes = Vec::new();
        loop {
            match self.read_u8_sync()? {
                0 => break,
                b => bytes.push(b),
            }
        }
        let consumed = bytes.len() + 1;
        let string = String::from_utf8(bytes)
            .map_err(|e| Error::invalid_response(format!("invalid cstring: {e}")))?;
        Ok((string, consumed))
    }
}

impl<R: Read + ?Sized> SyncLittleEndianRead for R {}

/// Read a document's raw BSON bytes from the provided reader.
pub(super) fn read_document_bytes<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    let length = reader.read_i32_sync()?;
    let body_length = u64::try_from(length)
        .ok()
        .and_then(|l| l.checked_sub(4))
        .ok_or_else(|| Error::invalid_response(format!("invalid document length {length}")))?;

    let mut bytes = Vec::with_capacity(length as usize);
    bytes.write_all(&length.to_le_bytes())?;

    reader.take(body_length).read_to_end(&mut bytes)?;

    Ok(bytes)
}
