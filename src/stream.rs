//! Read records from a forward-only source of bytes.
//!
//! [`StreamReader`] pulls bytes on demand from a [`ByteSource`], buffers
//! them until a whole record is available, and yields decoded
//! [`Record`]s. It never seeks, so it works on pipes, sockets, and files
//! that are still being written. For seekable files with a summary
//! section, [`IndexedReader`](crate::IndexedReader) is usually the better
//! tool.

use std::io;

use enumset::{EnumSet, EnumSetType};
use log::warn;

use crate::{
    chunk::{expand_chunk, record_at},
    compression::CompressionRegistry,
    records::{op, parse_record, Record, FRAMING_LEN},
    McapError, McapResult, LEGACY_VERSION, MAGIC,
};

/// A forward-only supplier of bytes.
///
/// Every [`std::io::Read`] implements this. The reader calls
/// [`pull`](ByteSource::pull) whenever it needs more data; a source that
/// has temporarily run dry (e.g. a file still being written) can block, or
/// return 0 to end the stream.
pub trait ByteSource {
    /// Append some bytes to `buf`, returning how many were added. Zero
    /// means end of stream.
    fn pull(&mut self, buf: &mut Vec<u8>) -> io::Result<usize>;
}

const PULL_SIZE: usize = 8 * 1024;

impl<R: io::Read> ByteSource for R {
    fn pull(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        let start = buf.len();
        buf.resize(start + PULL_SIZE, 0);
        match self.read(&mut buf[start..]) {
            Ok(n) => {
                buf.truncate(start + n);
                Ok(n)
            }
            Err(err) => {
                buf.truncate(start);
                Err(err)
            }
        }
    }
}

/// What to do when the stream reaches a Chunk record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ChunkHandling {
    /// Decompress the chunk and yield the records inside it, in place of
    /// the chunk itself.
    #[default]
    Expand,
    /// Yield the Chunk record as-is, compressed bytes and all.
    Raw,
}

/// Leniency switches for reading damaged or truncated files.
#[derive(EnumSetType, Debug)]
pub enum ReadFlag {
    /// Don't require the closing magic after the footer record.
    IgnoreEndMagic,
}

/// Configuration for a [`StreamReader`].
#[derive(Clone, Default)]
pub struct StreamOptions {
    chunk_handling: ChunkHandling,
    flags: EnumSet<ReadFlag>,
    record_length_limit: Option<usize>,
    registry: Option<CompressionRegistry>,
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk_handling(mut self, chunk_handling: ChunkHandling) -> Self {
        self.chunk_handling = chunk_handling;
        self
    }

    pub fn flags(mut self, flags: EnumSet<ReadFlag>) -> Self {
        self.flags = flags;
        self
    }

    /// Refuse records longer than `limit` bytes. By default any length
    /// that fits in memory is accepted.
    pub fn record_length_limit(mut self, limit: usize) -> Self {
        self.record_length_limit = Some(limit);
        self
    }

    /// The codecs used to expand compressed chunks.
    pub fn compression_registry(mut self, registry: CompressionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }
}

enum State {
    StartMagic,
    Records,
    Done,
}

struct ChunkCursor {
    records: Vec<u8>,
    pos: usize,
}

/// Decodes a finite, non-restartable sequence of records from a
/// [`ByteSource`].
///
/// ```no_run
/// # fn main() -> mcapio::McapResult<()> {
/// let file = std::fs::File::open("in.mcap")?;
/// for record in mcapio::StreamReader::new(file) {
///     println!("{:?}", record?.opcode());
/// }
/// # Ok(())
/// # }
/// ```
pub struct StreamReader<S> {
    source: S,
    buf: Vec<u8>,
    pos: usize,
    state: State,
    chunk: Option<ChunkCursor>,
    chunk_handling: ChunkHandling,
    flags: EnumSet<ReadFlag>,
    record_length_limit: Option<usize>,
    registry: CompressionRegistry,
}

impl<S: ByteSource> StreamReader<S> {
    pub fn new(source: S) -> Self {
        Self::new_with_options(source, StreamOptions::default())
    }

    pub fn new_with_options(source: S, options: StreamOptions) -> Self {
        Self {
            source,
            buf: Vec::new(),
            pos: 0,
            state: State::StartMagic,
            chunk: None,
            chunk_handling: options.chunk_handling,
            flags: options.flags,
            record_length_limit: options.record_length_limit,
            registry: options.registry.unwrap_or_default(),
        }
    }

    /// Buffer at least `want` unread bytes if the source can provide them,
    /// returning how many are actually available.
    fn buffered(&mut self, want: usize) -> McapResult<usize> {
        // Reclaim consumed space once it dominates the buffer.
        if self.pos > 4096 && self.pos > self.buf.len() - self.pos {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        while self.buf.len() - self.pos < want {
            if self.source.pull(&mut self.buf)? == 0 {
                break;
            }
        }
        Ok(self.buf.len() - self.pos)
    }

    fn check_start_magic(&mut self) -> McapResult<()> {
        if self.buffered(MAGIC.len())? < MAGIC.len() {
            return Err(McapError::UnexpectedEof);
        }
        let magic = &self.buf[self.pos..self.pos + MAGIC.len()];
        let legacy = magic[5] == LEGACY_VERSION
            && magic[..5] == MAGIC[..5]
            && magic[6..] == MAGIC[6..];
        if legacy {
            warn!("file uses the pre-release MCAP version byte; continuing anyway");
        } else if magic != MAGIC {
            return Err(McapError::BadMagic);
        }
        self.pos += MAGIC.len();
        Ok(())
    }

    fn check_end_magic(&mut self) -> McapResult<()> {
        if self.flags.contains(ReadFlag::IgnoreEndMagic) {
            return Ok(());
        }
        if self.buffered(MAGIC.len())? < MAGIC.len() {
            return Err(McapError::UnexpectedEof);
        }
        if &self.buf[self.pos..self.pos + MAGIC.len()] != MAGIC {
            return Err(McapError::BadMagic);
        }
        self.pos += MAGIC.len();
        Ok(())
    }

    fn advance(&mut self) -> McapResult<Option<Record>> {
        loop {
            // Drain the current chunk before touching the outer stream.
            if let Some(chunk) = self.chunk.as_mut() {
                if chunk.pos >= chunk.records.len() {
                    self.chunk = None;
                    continue;
                }
                let raw = record_at(&chunk.records, chunk.pos)?;
                if !matches!(raw.opcode, op::SCHEMA | op::CHANNEL | op::MESSAGE) {
                    return Err(McapError::UnexpectedChunkRecord(raw.opcode));
                }
                let record = parse_record(raw.opcode, raw.body)?;
                chunk.pos += FRAMING_LEN + raw.body.len();
                return Ok(Some(record));
            }

            match self.state {
                State::StartMagic => {
                    self.check_start_magic()?;
                    self.state = State::Records;
                }
                State::Records => {
                    let available = self.buffered(FRAMING_LEN)?;
                    if available == 0 {
                        // Clean end of an unterminated stream.
                        self.state = State::Done;
                        return Ok(None);
                    }
                    if available < FRAMING_LEN {
                        return Err(McapError::UnexpectedEof);
                    }
                    let opcode = self.buf[self.pos];
                    let len = u64::from_le_bytes(
                        self.buf[self.pos + 1..self.pos + FRAMING_LEN]
                            .try_into()
                            .expect("sliced 8 bytes"),
                    );
                    let len: usize = len.try_into().map_err(|_| McapError::TooLong(len))?;
                    if matches!(self.record_length_limit, Some(limit) if len > limit) {
                        return Err(McapError::TooLong(len as u64));
                    }
                    if self.buffered(FRAMING_LEN + len)? < FRAMING_LEN + len {
                        return Err(McapError::UnexpectedEof);
                    }
                    let body = &self.buf[self.pos + FRAMING_LEN..self.pos + FRAMING_LEN + len];
                    let record = parse_record(opcode, body)?;
                    self.pos += FRAMING_LEN + len;

                    match record {
                        Record::Chunk { header, data }
                            if self.chunk_handling == ChunkHandling::Expand =>
                        {
                            let records = expand_chunk(&header, &data, &self.registry)?;
                            self.chunk = Some(ChunkCursor { records, pos: 0 });
                        }
                        Record::Footer(footer) => {
                            self.check_end_magic()?;
                            self.state = State::Done;
                            return Ok(Some(Record::Footer(footer)));
                        }
                        record => return Ok(Some(record)),
                    }
                }
                State::Done => return Ok(None),
            }
        }
    }
}

impl<S: ByteSource> Iterator for StreamReader<S> {
    type Item = McapResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(record) => record.map(Ok),
            Err(err) => {
                // An error ends the sequence; don't try to resynchronize.
                self.state = State::Done;
                self.chunk = None;
                Some(Err(err))
            }
        }
    }
}
