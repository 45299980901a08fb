//! Raw records, one per MCAP opcode, and their binary codecs.
//!
//! Everything in an MCAP file after the leading magic is a sequence of
//! records framed as `opcode:u8 | length:u64le | body`. This module defines
//! the body layout of each record kind and a pure [`parse_record`] that both
//! the streaming and indexed readers are built on.
//!
//! Decoders here tolerate (and discard) extra trailing bytes in a record
//! body, which the format reserves for future fields.

use std::{collections::BTreeMap, io::Cursor};

use binrw::prelude::*;
use byteorder::{ReadBytesExt, LE};
use crc32fast::hash as crc32;

use crate::{McapError, McapResult};

/// Opcodes identifying each record kind.
///
/// Opcodes 0x01-0x7F are reserved by the format; 0x80-0xFF are available for
/// application extensions. Readers skip unrecognized opcodes by length.
pub mod op {
    pub const HEADER: u8 = 0x01;
    pub const FOOTER: u8 = 0x02;
    pub const SCHEMA: u8 = 0x03;
    pub const CHANNEL: u8 = 0x04;
    pub const MESSAGE: u8 = 0x05;
    pub const CHUNK: u8 = 0x06;
    pub const MESSAGE_INDEX: u8 = 0x07;
    pub const CHUNK_INDEX: u8 = 0x08;
    pub const ATTACHMENT: u8 = 0x09;
    pub const ATTACHMENT_INDEX: u8 = 0x0A;
    pub const STATISTICS: u8 = 0x0B;
    pub const METADATA: u8 = 0x0C;
    pub const METADATA_INDEX: u8 = 0x0D;
    pub const SUMMARY_OFFSET: u8 = 0x0E;
    pub const DATA_END: u8 = 0x0F;
}

/// Bytes taken by the `opcode | length` framing in front of every record body.
pub(crate) const FRAMING_LEN: usize = 1 + 8;

// Strings are `len:u32 | utf-8 bytes`.
#[binrw::parser(reader, endian)]
fn read_string() -> BinResult<String> {
    let pos = reader.stream_position()?;
    let len: u32 = BinRead::read_options(reader, endian, ())?;
    let mut raw = vec![0u8; len as usize];
    reader.read_exact(&mut raw)?;
    String::from_utf8(raw).map_err(|err| binrw::Error::Custom {
        pos,
        err: Box::new(err),
    })
}

#[binrw::writer(writer, endian)]
fn write_string(s: &String) -> BinResult<()> {
    (s.len() as u32).write_options(writer, endian, ())?;
    s.as_bytes().write_options(writer, endian, ())?;
    Ok(())
}

// Maps and arrays are prefixed with their length in *bytes*, not entries.
#[binrw::parser(reader, endian)]
fn read_string_map() -> BinResult<BTreeMap<String, String>> {
    let byte_len: u32 = BinRead::read_options(reader, endian, ())?;
    let pos = reader.stream_position()?;

    let mut entries = BTreeMap::new();
    while reader.stream_position()? - pos < byte_len as u64 {
        let k = read_string(reader, endian, ())?;
        let v = read_string(reader, endian, ())?;
        if entries.insert(k, v).is_some() {
            return Err(binrw::Error::Custom {
                pos,
                err: Box::new("duplicate keys in map"),
            });
        }
    }
    Ok(entries)
}

#[binrw::writer(writer, endian)]
fn write_string_map(entries: &BTreeMap<String, String>) -> BinResult<()> {
    let byte_len: usize = entries
        .iter()
        .map(|(k, v)| 4 + k.len() + 4 + v.len())
        .sum();
    (byte_len as u32).write_options(writer, endian, ())?;
    for (k, v) in entries {
        write_string(k, writer, endian, ())?;
        write_string(v, writer, endian, ())?;
    }
    Ok(())
}

// Channel ID -> u64 maps (message index offsets, per-channel counts).
// Each entry is a fixed 10 bytes.
#[binrw::parser(reader, endian)]
fn read_id_map() -> BinResult<BTreeMap<u16, u64>> {
    let byte_len: u32 = BinRead::read_options(reader, endian, ())?;
    let pos = reader.stream_position()?;

    let mut entries = BTreeMap::new();
    while reader.stream_position()? - pos < byte_len as u64 {
        let k: u16 = BinRead::read_options(reader, endian, ())?;
        let v: u64 = BinRead::read_options(reader, endian, ())?;
        if entries.insert(k, v).is_some() {
            return Err(binrw::Error::Custom {
                pos,
                err: Box::new("duplicate keys in map"),
            });
        }
    }
    Ok(entries)
}

#[binrw::writer(writer, endian)]
fn write_id_map(entries: &BTreeMap<u16, u64>) -> BinResult<()> {
    ((entries.len() * 10) as u32).write_options(writer, endian, ())?;
    for (k, v) in entries {
        k.write_options(writer, endian, ())?;
        v.write_options(writer, endian, ())?;
    }
    Ok(())
}

#[binrw::parser(reader, endian)]
fn read_index_entries() -> BinResult<Vec<MessageIndexEntry>> {
    let byte_len: u32 = BinRead::read_options(reader, endian, ())?;
    let pos = reader.stream_position()?;

    let mut entries = Vec::with_capacity(byte_len as usize / 16);
    while reader.stream_position()? - pos < byte_len as u64 {
        entries.push(MessageIndexEntry::read_options(reader, endian, ())?);
    }
    Ok(entries)
}

#[binrw::writer(writer, endian)]
fn write_index_entries(entries: &Vec<MessageIndexEntry>) -> BinResult<()> {
    ((entries.len() * 16) as u32).write_options(writer, endian, ())?;
    for e in entries {
        e.write_options(writer, endian, ())?;
    }
    Ok(())
}

/// First record in the file, identifying the profile and writing library.
#[derive(Debug, Default, Clone, Eq, PartialEq, BinRead, BinWrite)]
pub struct Header {
    #[br(parse_with = read_string)]
    #[bw(write_with = write_string)]
    pub profile: String,

    #[br(parse_with = read_string)]
    #[bw(write_with = write_string)]
    pub library: String,
}

/// Last record in the file, locating the summary section.
///
/// `summary_start == 0` means the file has no summary. `summary_crc == 0`
/// means the CRC was not computed.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub struct Footer {
    pub summary_start: u64,
    pub summary_offset_start: u64,
    pub summary_crc: u32,
}

/// The fixed-size fields of a Schema record; the schema bytes follow.
#[derive(Debug, Clone, Eq, PartialEq, BinRead, BinWrite)]
pub struct SchemaHeader {
    /// Schema ID. Zero is reserved to mean "no schema".
    pub id: u16,

    #[br(parse_with = read_string)]
    #[bw(write_with = write_string)]
    pub name: String,

    #[br(parse_with = read_string)]
    #[bw(write_with = write_string)]
    pub encoding: String,
}

#[derive(Debug, Clone, Eq, PartialEq, BinRead, BinWrite)]
pub struct Channel {
    pub id: u16,
    pub schema_id: u16,

    #[br(parse_with = read_string)]
    #[bw(write_with = write_string)]
    pub topic: String,

    #[br(parse_with = read_string)]
    #[bw(write_with = write_string)]
    pub message_encoding: String,

    #[br(parse_with = read_string_map)]
    #[bw(write_with = write_string_map)]
    pub metadata: BTreeMap<String, String>,
}

/// The fixed-size fields of a Message record; the payload runs to the end
/// of the record body.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub struct MessageHeader {
    pub channel_id: u16,
    pub sequence: u32,
    pub log_time: u64,
    pub publish_time: u64,
}

impl MessageHeader {
    /// Bytes this header occupies at the front of a Message record body.
    pub(crate) const LEN: usize = 2 + 4 + 8 + 8;
}

/// The fixed-size fields of a Chunk record; `compressed_size` bytes of
/// (possibly compressed) inner records follow.
#[derive(Debug, Clone, Eq, PartialEq, BinRead, BinWrite)]
pub struct ChunkHeader {
    /// Earliest message log time in the chunk, or 0 if it has no messages.
    pub message_start_time: u64,
    /// Latest message log time in the chunk, or 0 if it has no messages.
    pub message_end_time: u64,
    pub uncompressed_size: u64,
    /// CRC-32 of the uncompressed inner records, or 0 if not computed.
    pub uncompressed_crc: u32,

    #[br(parse_with = read_string)]
    #[bw(write_with = write_string)]
    pub compression: String,

    pub compressed_size: u64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub struct MessageIndexEntry {
    pub log_time: u64,
    /// Offset of the message record within the chunk's *uncompressed* records.
    pub offset: u64,
}

/// Per-(chunk, channel) table of message log times and offsets, written
/// immediately after its chunk.
#[derive(Debug, Clone, Eq, PartialEq, BinRead, BinWrite)]
pub struct MessageIndex {
    pub channel_id: u16,

    #[br(parse_with = read_index_entries)]
    #[bw(write_with = write_index_entries)]
    pub records: Vec<MessageIndexEntry>,
}

/// Summary-section record locating one chunk and its message indexes.
#[derive(Debug, Clone, Eq, PartialEq, BinRead, BinWrite)]
pub struct ChunkIndex {
    pub message_start_time: u64,
    pub message_end_time: u64,
    /// File offset of the chunk record's opcode byte.
    pub chunk_start_offset: u64,
    /// Length of the chunk record including its opcode and length fields.
    pub chunk_length: u64,

    #[br(parse_with = read_id_map)]
    #[bw(write_with = write_id_map)]
    pub message_index_offsets: BTreeMap<u16, u64>,

    pub message_index_length: u64,

    #[br(parse_with = read_string)]
    #[bw(write_with = write_string)]
    pub compression: String,

    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

impl ChunkIndex {
    /// File offset of the first byte of the chunk's compressed records.
    pub fn compressed_data_offset(&self) -> McapResult<u64> {
        let header_len = 8 + 8 + 8 + 4 + 4 + self.compression.len() as u64 + 8;
        self.chunk_start_offset
            .checked_add(FRAMING_LEN as u64 + header_len)
            .ok_or(McapError::BadIndex)
    }
}

/// The fixed-size fields of an Attachment record; `data_len:u64`, the data,
/// and a CRC follow.
#[derive(Debug, Clone, Eq, PartialEq, BinRead, BinWrite)]
pub struct AttachmentHeader {
    pub log_time: u64,
    pub create_time: u64,

    #[br(parse_with = read_string)]
    #[bw(write_with = write_string)]
    pub name: String,

    #[br(parse_with = read_string)]
    #[bw(write_with = write_string)]
    pub media_type: String,
}

#[derive(Debug, Clone, Eq, PartialEq, BinRead, BinWrite)]
pub struct AttachmentIndex {
    /// File offset of the attachment record's opcode byte.
    pub offset: u64,
    /// Length of the attachment record including its opcode and length fields.
    pub length: u64,
    pub log_time: u64,
    pub create_time: u64,
    pub data_size: u64,

    #[br(parse_with = read_string)]
    #[bw(write_with = write_string)]
    pub name: String,

    #[br(parse_with = read_string)]
    #[bw(write_with = write_string)]
    pub media_type: String,
}

#[derive(Debug, Default, Clone, Eq, PartialEq, BinRead, BinWrite)]
pub struct Statistics {
    pub message_count: u64,
    pub schema_count: u16,
    pub channel_count: u32,
    pub attachment_count: u32,
    pub metadata_count: u32,
    pub chunk_count: u32,
    pub message_start_time: u64,
    pub message_end_time: u64,

    #[br(parse_with = read_id_map)]
    #[bw(write_with = write_id_map)]
    pub channel_message_counts: BTreeMap<u16, u64>,
}

#[derive(Debug, Default, Clone, Eq, PartialEq, BinRead, BinWrite)]
pub struct Metadata {
    #[br(parse_with = read_string)]
    #[bw(write_with = write_string)]
    pub name: String,

    #[br(parse_with = read_string_map)]
    #[bw(write_with = write_string_map)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Eq, PartialEq, BinRead, BinWrite)]
pub struct MetadataIndex {
    pub offset: u64,
    pub length: u64,

    #[br(parse_with = read_string)]
    #[bw(write_with = write_string)]
    pub name: String,
}

/// Points at one contiguous run of same-opcode records in the summary.
#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub struct SummaryOffset {
    pub group_opcode: u8,
    pub group_start: u64,
    pub group_length: u64,
}

/// Marks the end of the data section.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub struct DataEnd {
    /// CRC-32 of the file from its first byte through the byte before this
    /// record's opcode, or 0 if not computed.
    pub data_section_crc: u32,
}

/// A fully decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Header(Header),
    Footer(Footer),
    Schema { header: SchemaHeader, data: Vec<u8> },
    Channel(Channel),
    Message { header: MessageHeader, data: Vec<u8> },
    Chunk { header: ChunkHeader, data: Vec<u8> },
    MessageIndex(MessageIndex),
    ChunkIndex(ChunkIndex),
    Attachment { header: AttachmentHeader, data: Vec<u8>, crc: u32 },
    AttachmentIndex(AttachmentIndex),
    Statistics(Statistics),
    Metadata(Metadata),
    MetadataIndex(MetadataIndex),
    SummaryOffset(SummaryOffset),
    DataEnd(DataEnd),
    /// A record with an opcode this version doesn't recognize.
    Unknown { opcode: u8, data: Vec<u8> },
}

impl Record {
    pub fn opcode(&self) -> u8 {
        match self {
            Record::Header(_) => op::HEADER,
            Record::Footer(_) => op::FOOTER,
            Record::Schema { .. } => op::SCHEMA,
            Record::Channel(_) => op::CHANNEL,
            Record::Message { .. } => op::MESSAGE,
            Record::Chunk { .. } => op::CHUNK,
            Record::MessageIndex(_) => op::MESSAGE_INDEX,
            Record::ChunkIndex(_) => op::CHUNK_INDEX,
            Record::Attachment { .. } => op::ATTACHMENT,
            Record::AttachmentIndex(_) => op::ATTACHMENT_INDEX,
            Record::Statistics(_) => op::STATISTICS,
            Record::Metadata(_) => op::METADATA,
            Record::MetadataIndex(_) => op::METADATA_INDEX,
            Record::SummaryOffset(_) => op::SUMMARY_OFFSET,
            Record::DataEnd(_) => op::DATA_END,
            Record::Unknown { opcode, .. } => *opcode,
        }
    }
}

/// Decode one record body into a [`Record`].
///
/// This is a pure function of `(opcode, body)` so that the pull-based and
/// seek-based readers can share it. Trailing bytes past the fields we know
/// about are ignored.
pub fn parse_record(opcode: u8, body: &[u8]) -> McapResult<Record> {
    macro_rules! record {
        ($b:ident) => {{
            let mut cur = Cursor::new($b);
            cur.read_le()?
        }};
    }

    Ok(match opcode {
        op::HEADER => Record::Header(record!(body)),
        op::FOOTER => Record::Footer(record!(body)),
        op::SCHEMA => {
            let mut cur = Cursor::new(body);
            let header: SchemaHeader = cur.read_le()?;
            let data_len = cur.read_u32::<LE>()?;
            let rest = &body[cur.position() as usize..];
            if data_len as usize > rest.len() {
                return Err(McapError::BadSchemaLength {
                    header: data_len,
                    available: rest.len() as u32,
                });
            }
            Record::Schema {
                header,
                data: rest[..data_len as usize].to_vec(),
            }
        }
        op::CHANNEL => Record::Channel(record!(body)),
        op::MESSAGE => {
            let mut cur = Cursor::new(body);
            let header: MessageHeader = cur.read_le()?;
            Record::Message {
                header,
                data: body[cur.position() as usize..].to_vec(),
            }
        }
        op::CHUNK => {
            let mut cur = Cursor::new(body);
            let header: ChunkHeader = cur.read_le()?;
            let rest = &body[cur.position() as usize..];
            if header.compressed_size > rest.len() as u64 {
                return Err(McapError::BadChunkLength {
                    header: header.compressed_size,
                    available: rest.len() as u64,
                });
            }
            let data = rest[..header.compressed_size as usize].to_vec();
            Record::Chunk { header, data }
        }
        op::MESSAGE_INDEX => Record::MessageIndex(record!(body)),
        op::CHUNK_INDEX => Record::ChunkIndex(record!(body)),
        op::ATTACHMENT => {
            let mut cur = Cursor::new(body);
            let header: AttachmentHeader = cur.read_le()?;
            let data_len = cur.read_u64::<LE>()?;
            let data_start = cur.position() as usize;
            // data_len bytes of data, then a 4-byte CRC.
            let available = body.len().saturating_sub(data_start + 4) as u64;
            if data_len > available {
                return Err(McapError::BadAttachmentLength {
                    header: data_len,
                    available,
                });
            }
            let data_end = data_start + data_len as usize;
            let mut cur = Cursor::new(&body[data_end..]);
            let crc = cur.read_u32::<LE>()?;
            // The CRC covers the entire body up to itself, including the
            // serialized header, so it's checked here rather than by callers.
            if crc != 0 {
                let calculated = crc32(&body[..data_end]);
                if crc != calculated {
                    return Err(McapError::BadAttachmentCrc {
                        saved: crc,
                        calculated,
                    });
                }
            }
            Record::Attachment {
                header,
                data: body[data_start..data_end].to_vec(),
                crc,
            }
        }
        op::ATTACHMENT_INDEX => Record::AttachmentIndex(record!(body)),
        op::STATISTICS => Record::Statistics(record!(body)),
        op::METADATA => Record::Metadata(record!(body)),
        op::METADATA_INDEX => Record::MetadataIndex(record!(body)),
        op::SUMMARY_OFFSET => Record::SummaryOffset(record!(body)),
        op::DATA_END => Record::DataEnd(record!(body)),
        opcode => Record::Unknown {
            opcode,
            data: body.to_vec(),
        },
    })
}
