#![doc = include_str!("../README.md")]

use std::{borrow::Cow, collections::BTreeMap, sync::Arc};

use thiserror::Error;

mod chunk;
pub mod compression;
mod heap;
pub mod indexed;
mod io_utils;
pub mod records;
pub mod stream;
pub mod write;

pub use compression::{CompressionCodec, CompressionRegistry};
pub use indexed::{IndexedReader, IndexedReaderOptions, MessageQuery, Messages, RandomAccess};
pub use stream::{ByteSource, ChunkHandling, ReadFlag, StreamOptions, StreamReader};
pub use write::{WriteOptions, Writer};

/// Magic bytes that open and close every MCAP file.
///
/// The sixth byte (`'0'`) is the format version.
pub const MAGIC: &[u8] = &[0x89, b'M', b'C', b'A', b'P', 0x30, b'\r', b'\n'];

/// Version byte used by pre-release MCAP files, accepted by the
/// [`StreamReader`] only.
pub(crate) const LEGACY_VERSION: u8 = 0x01;

/// The order in which messages are yielded from an indexed query.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ReadOrder {
    /// Ascending `(chunk offset, offset in chunk)` - the order messages
    /// appear in the file.
    File,
    /// Ascending log time. Ties are broken by file position, earliest first.
    #[default]
    LogTimeAsc,
    /// Descending log time. Ties are broken by file position, latest first.
    LogTimeDesc,
}

/// Errors from reading or writing MCAP data.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum McapError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("couldn't parse record: {0}")]
    Parse(#[from] binrw::Error),
    #[error("file doesn't start or end with MCAP magic")]
    BadMagic,
    #[error("expected a footer record at the end of the file")]
    BadFooter,
    #[error("source ended in the middle of a record")]
    UnexpectedEof,
    #[error("chunk ended in the middle of a record")]
    UnexpectedEoc,
    #[error("record length ({0}) is larger than this system can address")]
    TooLong(u64),
    #[error("schema data ({header} bytes) doesn't fit the record ({available} bytes left)")]
    BadSchemaLength { header: u32, available: u32 },
    #[error("chunk data ({header} bytes) doesn't fit the record ({available} bytes left)")]
    BadChunkLength { header: u64, available: u64 },
    #[error("attachment data ({header} bytes) doesn't fit the record ({available} bytes left)")]
    BadAttachmentLength { header: u64, available: u64 },
    #[error("attachment CRC failed: saved {saved:08x}, calculated {calculated:08x}")]
    BadAttachmentCrc { saved: u32, calculated: u32 },
    #[error("chunk CRC failed: saved {saved:08x}, calculated {calculated:08x}")]
    BadChunkCrc { saved: u32, calculated: u32 },
    #[error("summary section CRC failed: saved {saved:08x}, calculated {calculated:08x}")]
    BadSummaryCrc { saved: u32, calculated: u32 },
    #[error("chunk decompressed to {actual} bytes, expected {expected}")]
    BadUncompressedSize { expected: u64, actual: u64 },
    #[error("no compression codec registered for {0:?}")]
    UnsupportedCompression(String),
    #[error("decompression failed: {0}")]
    Decompression(String),
    #[error("message {0} referenced channel {1} before its Channel record")]
    UnknownChannel(u32, u16),
    #[error("channel {0} referenced schema {1} before its Schema record")]
    UnknownSchema(String, u16),
    #[error("schema ID 0 is reserved for schemaless channels")]
    InvalidSchemaId,
    #[error("a schema with ID {0} was already added with different content")]
    ConflictingSchemas(u16),
    #[error("a channel with ID {0} was already added with different content")]
    ConflictingChannels(u16),
    #[error("all schema IDs are in use")]
    TooManySchemas,
    #[error("all channel IDs are in use")]
    TooManyChannels,
    #[error("record with opcode {0:#04x} isn't allowed inside a chunk")]
    UnexpectedChunkRecord(u8),
    #[error("file has no summary section; indexed queries are unavailable")]
    NoIndex,
    #[error("index entry doesn't point at the record it claims to")]
    BadIndex,
    #[error("the writer was already finished")]
    FinishedWriter,
    #[error("the writer failed previously and can't continue")]
    FailedWriter,
    #[error("internal invariant broken: {0}")]
    InternalInvariant(&'static str),
}

pub type McapResult<T> = Result<T, McapError>;

/// Describes a schema used by one or more [`Channel`]s in an MCAP file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Schema {
    /// An identifier for the schema, e.g. a type name.
    pub name: String,
    /// Format of [`Schema::data`], e.g. "jsonschema", "protobuf".
    pub encoding: String,
    /// The serialized schema itself.
    pub data: Cow<'static, [u8]>,
}

/// Describes a channel (a logical stream of messages on a topic) in an
/// MCAP file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// The topic messages on this channel are published to.
    pub topic: String,
    /// The schema describing messages on this channel, if any.
    pub schema: Option<Arc<Schema>>,
    /// Encoding of every [`Message::data`] on this channel.
    pub message_encoding: String,
    /// User-defined metadata.
    pub metadata: BTreeMap<String, String>,
}

/// A message read from an MCAP file, joined with its [`Channel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: Arc<Channel>,
    pub sequence: u32,
    /// Nanosecond timestamp when the message was recorded.
    pub log_time: u64,
    /// Nanosecond timestamp when the message was published.
    pub publish_time: u64,
    pub data: Cow<'static, [u8]>,
}

/// An arbitrary file attached to an MCAP file, e.g. calibration data
/// or a core dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Nanosecond timestamp the attachment pertains to.
    pub log_time: u64,
    /// Nanosecond timestamp when the attachment was created.
    pub create_time: u64,
    pub name: String,
    /// RFC 2046 media type, e.g. "application/octet-stream".
    pub media_type: String,
    pub data: Cow<'static, [u8]>,
}
