use std::io::{self, prelude::*};

use crc32fast::Hasher;

/// Counts bytes and maintains a running CRC32 of everything written through
/// it. The writer's bookkeeping (record offsets, the data-section CRC, and
/// chunk CRCs) all hangs off this, which is what lets it avoid seeking.
pub struct CountingCrcWriter<W> {
    inner: W,
    hasher: Hasher,
    count: u64,
}

impl<W: Write> CountingCrcWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
            count: 0,
        }
    }

    /// Total bytes written so far.
    pub fn position(&self) -> u64 {
        self.count
    }

    /// The CRC of everything written so far, without consuming the writer.
    pub fn crc(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingCrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res = self.inner.write(buf)?;
        self.count += res as u64;
        self.hasher.update(&buf[..res]);
        Ok(res)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
