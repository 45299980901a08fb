//! Write MCAP files.
//!
//! The [`Writer`] makes a single forward pass: records stream out as they
//! are added, while the summary (indexes, statistics, and offsets) is
//! accumulated in memory and emitted by [`finish()`](Writer::finish). The
//! only buffered payload is the currently open chunk, so the sink can be a
//! pipe or socket - the writer never seeks.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io::{Cursor, Write},
    sync::Arc,
};

use binrw::prelude::*;
use byteorder::{WriteBytesExt, LE};
use crc32fast::{hash as crc32, Hasher};
use log::debug;

use crate::{
    compression::{CompressionCodec, CompressionRegistry},
    io_utils::CountingCrcWriter,
    records::{self, op, MessageHeader, Record},
    Attachment, McapError, McapResult, Message, MAGIC,
};

fn put_framing(out: &mut Vec<u8>, opcode: u8, len: usize) {
    out.push(opcode);
    out.extend_from_slice(&(len as u64).to_le_bytes());
}

/// Append a framed record to `out`, padded with `padding` trailing zeros.
///
/// Message records are never padded: their payload runs to the end of the
/// record body, so extra bytes would become part of the message.
fn put_record(out: &mut Vec<u8>, record: &Record, padding: usize) -> McapResult<()> {
    let padding = match record {
        Record::Message { .. } => 0,
        _ => padding,
    };

    macro_rules! framed {
        ($op:expr, $value:expr) => {{
            let mut body = Vec::new();
            Cursor::new(&mut body).write_le($value)?;
            put_framing(out, $op, body.len() + padding);
            out.extend_from_slice(&body);
        }};
    }

    match record {
        Record::Header(h) => framed!(op::HEADER, h),
        Record::Schema { header, data } => {
            let mut body = Vec::new();
            Cursor::new(&mut body).write_le(header)?;
            body.write_u32::<LE>(data.len() as u32)?;
            put_framing(out, op::SCHEMA, body.len() + data.len() + padding);
            out.extend_from_slice(&body);
            out.extend_from_slice(data);
        }
        Record::Channel(c) => framed!(op::CHANNEL, c),
        Record::Message { header, data } => {
            let mut body = Vec::new();
            Cursor::new(&mut body).write_le(header)?;
            put_framing(out, op::MESSAGE, body.len() + data.len());
            out.extend_from_slice(&body);
            out.extend_from_slice(data);
        }
        Record::MessageIndex(mi) => framed!(op::MESSAGE_INDEX, mi),
        Record::ChunkIndex(ci) => framed!(op::CHUNK_INDEX, ci),
        Record::AttachmentIndex(ai) => framed!(op::ATTACHMENT_INDEX, ai),
        Record::Statistics(s) => framed!(op::STATISTICS, s),
        Record::Metadata(m) => framed!(op::METADATA, m),
        Record::MetadataIndex(mi) => framed!(op::METADATA_INDEX, mi),
        Record::SummaryOffset(so) => framed!(op::SUMMARY_OFFSET, so),
        Record::DataEnd(de) => framed!(op::DATA_END, de),
        Record::Footer(_) => {
            unreachable!("the footer is framed by finish() because its CRC is self-referencing")
        }
        Record::Chunk { .. } => unreachable!("chunks are framed by flush_chunk()"),
        Record::Attachment { .. } => {
            unreachable!("attachments are framed by add_attachment() for their CRC")
        }
        Record::Unknown { opcode, data } => {
            put_framing(out, *opcode, data.len() + padding);
            out.extend_from_slice(data);
        }
    }

    out.resize(out.len() + padding, 0);
    Ok(())
}

/// Configuration for a [`Writer`], built up fluently.
///
/// ```
/// let options = mcapio::WriteOptions::new()
///     .profile("x-custom")
///     .compression("")
///     .chunk_size(256 * 1024);
/// ```
#[derive(Clone)]
pub struct WriteOptions {
    profile: String,
    library: String,
    compression: String,
    chunk_size: u64,
    use_chunks: bool,
    use_chunk_crc: bool,
    use_message_index: bool,
    use_chunk_index: bool,
    use_statistics: bool,
    use_attachment_index: bool,
    use_metadata_index: bool,
    use_summary_offsets: bool,
    use_repeated_schemas: bool,
    use_repeated_channels: bool,
    use_data_section_crc: bool,
    use_summary_crc: bool,
    padding: usize,
    registry: CompressionRegistry,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            profile: String::new(),
            library: String::new(),
            compression: String::new(),
            chunk_size: 1024 * 1024,
            use_chunks: true,
            use_chunk_crc: true,
            use_message_index: true,
            use_chunk_index: true,
            use_statistics: true,
            use_attachment_index: true,
            use_metadata_index: true,
            use_summary_offsets: true,
            use_repeated_schemas: false,
            use_repeated_channels: false,
            use_data_section_crc: true,
            use_summary_crc: true,
            padding: 0,
            registry: CompressionRegistry::default(),
        }
    }
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The profile written to the header record, e.g. "ros2".
    pub fn profile<S: Into<String>>(mut self, profile: S) -> Self {
        self.profile = profile.into();
        self
    }

    /// The library name written to the header record.
    pub fn library<S: Into<String>>(mut self, library: S) -> Self {
        self.library = library.into();
        self
    }

    /// Compression applied to chunks, by registry name. The default, `""`,
    /// stores chunk records verbatim.
    pub fn compression<S: Into<String>>(mut self, compression: S) -> Self {
        self.compression = compression.into();
        self
    }

    /// The codecs available for [`WriteOptions::compression`] to name.
    pub fn compression_registry(mut self, registry: CompressionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Soft limit on the uncompressed size of a chunk. Once the open chunk
    /// reaches it, the chunk is finished and a new one started.
    pub fn chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Whether messages are grouped into chunks at all. Without chunks
    /// there is nothing to compress or index, but a small system can write
    /// messages straight through.
    pub fn use_chunks(mut self, use_chunks: bool) -> Self {
        self.use_chunks = use_chunks;
        self
    }

    /// Whether each chunk carries a CRC of its uncompressed records.
    pub fn use_chunk_crc(mut self, use_chunk_crc: bool) -> Self {
        self.use_chunk_crc = use_chunk_crc;
        self
    }

    /// Whether message index records follow each chunk.
    pub fn use_message_index(mut self, use_message_index: bool) -> Self {
        self.use_message_index = use_message_index;
        self
    }

    /// Whether the summary includes a chunk index.
    pub fn use_chunk_index(mut self, use_chunk_index: bool) -> Self {
        self.use_chunk_index = use_chunk_index;
        self
    }

    /// Whether the summary includes a statistics record.
    pub fn use_statistics(mut self, use_statistics: bool) -> Self {
        self.use_statistics = use_statistics;
        self
    }

    /// Whether the summary includes attachment index records.
    pub fn use_attachment_index(mut self, use_attachment_index: bool) -> Self {
        self.use_attachment_index = use_attachment_index;
        self
    }

    /// Whether the summary includes metadata index records.
    pub fn use_metadata_index(mut self, use_metadata_index: bool) -> Self {
        self.use_metadata_index = use_metadata_index;
        self
    }

    /// Whether summary offset records are written for each summary group.
    pub fn use_summary_offsets(mut self, use_summary_offsets: bool) -> Self {
        self.use_summary_offsets = use_summary_offsets;
        self
    }

    /// Whether every chunk repeats the schema records its messages
    /// reference, making each chunk self-contained.
    pub fn use_repeated_schemas(mut self, use_repeated_schemas: bool) -> Self {
        self.use_repeated_schemas = use_repeated_schemas;
        self
    }

    /// Whether every chunk repeats the channel records its messages
    /// reference, making each chunk self-contained.
    pub fn use_repeated_channels(mut self, use_repeated_channels: bool) -> Self {
        self.use_repeated_channels = use_repeated_channels;
        self
    }

    /// Whether the DataEnd record carries a CRC of the data section.
    pub fn use_data_section_crc(mut self, use_data_section_crc: bool) -> Self {
        self.use_data_section_crc = use_data_section_crc;
        self
    }

    /// Whether the footer carries a CRC of the summary section.
    pub fn use_summary_crc(mut self, use_summary_crc: bool) -> Self {
        self.use_summary_crc = use_summary_crc;
        self
    }

    /// Zero bytes appended to each record body, exercising readers'
    /// tolerance for future fields. Message records are never padded.
    pub fn padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    /// Create a [`Writer`] which writes to `sink` using these options.
    pub fn create<W: Write>(self, sink: W) -> McapResult<Writer<W>> {
        Writer::with_options(sink, self)
    }
}

#[derive(Hash, PartialEq, Eq)]
struct SchemaContent {
    name: String,
    encoding: String,
    data: Vec<u8>,
}

#[derive(Hash, PartialEq, Eq)]
struct ChannelContent {
    schema_id: u16,
    topic: String,
    message_encoding: String,
    metadata: BTreeMap<String, String>,
}

/// Writes an MCAP file to the given sink.
///
/// Call [`finish()`](Self::finish) when done to emit the summary section
/// and footer; an unfinished writer finishes itself on drop.
pub struct Writer<W: Write> {
    sink: Option<CountingCrcWriter<W>>,
    options: WriteOptions,
    codec: Arc<dyn CompressionCodec>,
    chunk: Option<ChunkBuilder>,
    schemas: BTreeMap<u16, (records::SchemaHeader, Vec<u8>)>,
    schema_ids: HashMap<SchemaContent, u16>,
    channels: BTreeMap<u16, records::Channel>,
    channel_ids: HashMap<ChannelContent, u16>,
    next_schema_id: u32,
    next_channel_id: u32,
    chunk_indexes: Vec<records::ChunkIndex>,
    attachment_indexes: Vec<records::AttachmentIndex>,
    metadata_indexes: Vec<records::MetadataIndex>,
    chunk_count: u32,
    message_bounds: Option<(u64, u64)>,
    channel_message_counts: BTreeMap<u16, u64>,
    finished: bool,
    failed: bool,
}

impl<W: Write> Writer<W> {
    pub fn new(sink: W) -> McapResult<Self> {
        Self::with_options(sink, WriteOptions::default())
    }

    fn with_options(sink: W, options: WriteOptions) -> McapResult<Self> {
        // Catch a missing codec now rather than at the first chunk flush.
        let codec = options.registry.get(&options.compression)?.clone();

        let mut sink = CountingCrcWriter::new(sink);
        sink.write_all(MAGIC)?;

        let mut scratch = Vec::new();
        put_record(
            &mut scratch,
            &Record::Header(records::Header {
                profile: options.profile.clone(),
                library: options.library.clone(),
            }),
            options.padding,
        )?;
        sink.write_all(&scratch)?;

        Ok(Self {
            sink: Some(sink),
            options,
            codec,
            chunk: None,
            schemas: BTreeMap::new(),
            schema_ids: HashMap::new(),
            channels: BTreeMap::new(),
            channel_ids: HashMap::new(),
            next_schema_id: 1,
            next_channel_id: 0,
            chunk_indexes: Vec::new(),
            attachment_indexes: Vec::new(),
            metadata_indexes: Vec::new(),
            chunk_count: 0,
            message_bounds: None,
            channel_message_counts: BTreeMap::new(),
            finished: false,
            failed: false,
        })
    }

    fn check_active(&self) -> McapResult<()> {
        if self.finished {
            Err(McapError::FinishedWriter)
        } else if self.failed {
            Err(McapError::FailedWriter)
        } else {
            Ok(())
        }
    }

    fn sink(&mut self) -> &mut CountingCrcWriter<W> {
        self.sink
            .as_mut()
            .expect("sink is only taken by into_inner()")
    }

    /// Run a fallible write step; any error poisons the writer so later
    /// calls fail fast instead of producing a torn file.
    fn guarded<T>(&mut self, step: impl FnOnce(&mut Self) -> McapResult<T>) -> McapResult<T> {
        self.check_active()?;
        let result = step(self);
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn write_sink_record(&mut self, record: &Record) -> McapResult<()> {
        let mut scratch = Vec::new();
        put_record(&mut scratch, record, self.options.padding)?;
        self.sink().write_all(&scratch)?;
        Ok(())
    }

    /// Register a schema, returning its ID.
    ///
    /// IDs start at 1 and are assigned in registration order. Registering
    /// identical content again returns the same ID. An empty `name` with no
    /// `data` returns the reserved ID 0, which channels use to mean "no
    /// schema"; no record is written for it.
    pub fn register_schema(&mut self, name: &str, encoding: &str, data: &[u8]) -> McapResult<u16> {
        self.check_active()?;
        if name.is_empty() && data.is_empty() {
            return Ok(0);
        }
        let content = SchemaContent {
            name: name.into(),
            encoding: encoding.into(),
            data: data.into(),
        };
        if let Some(&id) = self.schema_ids.get(&content) {
            return Ok(id);
        }
        if self.next_schema_id > u16::MAX as u32 {
            return Err(McapError::TooManySchemas);
        }
        let id = self.next_schema_id as u16;

        let header = records::SchemaHeader {
            id,
            name: name.into(),
            encoding: encoding.into(),
        };
        self.guarded(|w| {
            let record = Record::Schema {
                header: header.clone(),
                data: data.to_vec(),
            };
            if w.options.use_chunks {
                let chunk = w.open_chunk();
                chunk.put(&record)?;
                chunk.schemas_seen.insert(id);
                Ok(())
            } else {
                w.write_sink_record(&record)
            }
        })?;

        self.next_schema_id += 1;
        self.schema_ids.insert(content, id);
        self.schemas.insert(id, (header, data.to_vec()));
        Ok(id)
    }

    /// Register a channel, returning its ID.
    ///
    /// `schema_id` must be 0 (schemaless) or an ID from
    /// [`register_schema`](Self::register_schema). IDs start at 0 and are
    /// assigned in registration order; registering identical content again
    /// returns the same ID.
    pub fn register_channel(
        &mut self,
        schema_id: u16,
        topic: &str,
        message_encoding: &str,
        metadata: &BTreeMap<String, String>,
    ) -> McapResult<u16> {
        self.check_active()?;
        if schema_id != 0 && !self.schemas.contains_key(&schema_id) {
            return Err(McapError::UnknownSchema(topic.into(), schema_id));
        }
        let content = ChannelContent {
            schema_id,
            topic: topic.into(),
            message_encoding: message_encoding.into(),
            metadata: metadata.clone(),
        };
        if let Some(&id) = self.channel_ids.get(&content) {
            return Ok(id);
        }
        if self.next_channel_id > u16::MAX as u32 {
            return Err(McapError::TooManyChannels);
        }
        let id = self.next_channel_id as u16;

        let channel = records::Channel {
            id,
            schema_id,
            topic: topic.into(),
            message_encoding: message_encoding.into(),
            metadata: metadata.clone(),
        };
        self.guarded(|w| {
            let record = Record::Channel(channel.clone());
            if w.options.use_chunks {
                let chunk = w.open_chunk();
                chunk.put(&record)?;
                chunk.channels_seen.insert(id);
                Ok(())
            } else {
                w.write_sink_record(&record)
            }
        })?;

        self.next_channel_id += 1;
        self.channel_ids.insert(content, id);
        self.channels.insert(id, channel);
        Ok(id)
    }

    /// Write a message to a previously registered channel.
    pub fn add_message(&mut self, header: &MessageHeader, data: &[u8]) -> McapResult<()> {
        self.check_active()?;
        if !self.channels.contains_key(&header.channel_id) {
            return Err(McapError::UnknownChannel(header.sequence, header.channel_id));
        }
        self.guarded(|w| w.add_message_inner(header, data))
    }

    fn add_message_inner(&mut self, header: &MessageHeader, data: &[u8]) -> McapResult<()> {
        self.message_bounds = Some(match self.message_bounds {
            None => (header.log_time, header.log_time),
            Some((start, end)) => (start.min(header.log_time), end.max(header.log_time)),
        });
        *self
            .channel_message_counts
            .entry(header.channel_id)
            .or_insert(0) += 1;

        if !self.options.use_chunks {
            return self.write_sink_record(&Record::Message {
                header: *header,
                data: data.to_vec(),
            });
        }

        self.repeat_channel_records(header.channel_id)?;

        let use_message_index = self.options.use_message_index;
        self.open_chunk().put_message(header, data, use_message_index)?;

        if self.chunk.as_ref().map(|c| c.buf.len() as u64) >= Some(self.options.chunk_size) {
            self.flush_chunk()?;
        }
        Ok(())
    }

    /// Re-emit the schema and channel records a message depends on into the
    /// open chunk, for self-contained chunks.
    fn repeat_channel_records(&mut self, channel_id: u16) -> McapResult<()> {
        if !self.options.use_repeated_schemas && !self.options.use_repeated_channels {
            return Ok(());
        }
        let channel = self.channels[&channel_id].clone();

        if self.options.use_repeated_schemas && channel.schema_id != 0 {
            let (schema_header, schema_data) = self.schemas[&channel.schema_id].clone();
            let chunk = self.open_chunk();
            if !chunk.schemas_seen.contains(&channel.schema_id) {
                chunk.put(&Record::Schema {
                    header: schema_header,
                    data: schema_data,
                })?;
                chunk.schemas_seen.insert(channel.schema_id);
            }
        }

        if self.options.use_repeated_channels {
            let chunk = self.open_chunk();
            if !chunk.channels_seen.contains(&channel_id) {
                chunk.put(&Record::Channel(channel))?;
                chunk.channels_seen.insert(channel_id);
            }
        }
        Ok(())
    }

    /// Write an attachment. Any open chunk is finished first.
    pub fn add_attachment(&mut self, attachment: &Attachment) -> McapResult<()> {
        self.guarded(|w| w.add_attachment_inner(attachment))
    }

    fn add_attachment_inner(&mut self, attachment: &Attachment) -> McapResult<()> {
        self.flush_chunk()?;

        let header = records::AttachmentHeader {
            log_time: attachment.log_time,
            create_time: attachment.create_time,
            name: attachment.name.clone(),
            media_type: attachment.media_type.clone(),
        };
        let mut head = Vec::new();
        Cursor::new(&mut head).write_le(&header)?;
        head.write_u64::<LE>(attachment.data.len() as u64)?;

        // The CRC covers the body through the end of the data.
        let mut hasher = Hasher::new();
        hasher.update(&head);
        hasher.update(&attachment.data);
        let crc = hasher.finalize();

        let offset = self.sink().position();
        let mut framed = Vec::new();
        put_framing(
            &mut framed,
            op::ATTACHMENT,
            head.len() + attachment.data.len() + 4 + self.options.padding,
        );
        framed.extend_from_slice(&head);
        let sink = self.sink();
        sink.write_all(&framed)?;
        sink.write_all(&attachment.data)?;
        sink.write_u32::<LE>(crc)?;
        let padding = vec![0; self.options.padding];
        let sink = self.sink();
        sink.write_all(&padding)?;
        let length = sink.position() - offset;

        self.attachment_indexes.push(records::AttachmentIndex {
            offset,
            length,
            log_time: attachment.log_time,
            create_time: attachment.create_time,
            data_size: attachment.data.len() as u64,
            name: attachment.name.clone(),
            media_type: attachment.media_type.clone(),
        });
        Ok(())
    }

    /// Write a metadata record. Any open chunk is finished first.
    pub fn add_metadata(
        &mut self,
        name: &str,
        metadata: &BTreeMap<String, String>,
    ) -> McapResult<()> {
        self.guarded(|w| w.add_metadata_inner(name, metadata))
    }

    fn add_metadata_inner(
        &mut self,
        name: &str,
        metadata: &BTreeMap<String, String>,
    ) -> McapResult<()> {
        self.flush_chunk()?;

        let offset = self.sink().position();
        self.write_sink_record(&Record::Metadata(records::Metadata {
            name: name.into(),
            metadata: metadata.clone(),
        }))?;
        let length = self.sink().position() - offset;

        self.metadata_indexes.push(records::MetadataIndex {
            offset,
            length,
            name: name.into(),
        });
        Ok(())
    }

    /// Write a message along with its channel and schema, registering them
    /// (by content) the first time they appear.
    ///
    /// This is a convenience for copying messages between files; the IDs in
    /// the resulting file are assigned by this writer.
    pub fn add(&mut self, message: &Message) -> McapResult<()> {
        let schema_id = match message.channel.schema.as_deref() {
            None => 0,
            Some(schema) => self.register_schema(&schema.name, &schema.encoding, &schema.data)?,
        };
        let channel_id = self.register_channel(
            schema_id,
            &message.channel.topic,
            &message.channel.message_encoding,
            &message.channel.metadata,
        )?;
        self.add_message(
            &MessageHeader {
                channel_id,
                sequence: message.sequence,
                log_time: message.log_time,
                publish_time: message.publish_time,
            },
            &message.data,
        )
    }

    /// Finish the open chunk and flush the sink, guaranteeing the file is
    /// streamable up to this point.
    pub fn flush(&mut self) -> McapResult<()> {
        self.guarded(|w| {
            w.flush_chunk()?;
            w.sink().flush()?;
            Ok(())
        })
    }

    fn open_chunk(&mut self) -> &mut ChunkBuilder {
        self.chunk.get_or_insert_with(|| ChunkBuilder {
            buf: Vec::new(),
            message_bounds: None,
            indexes: BTreeMap::new(),
            schemas_seen: HashSet::new(),
            channels_seen: HashSet::new(),
            padding: self.options.padding,
        })
    }

    /// Seal and write the open chunk, its message indexes, and the
    /// bookkeeping rows for the summary. A chunk with no records at all is
    /// silently discarded.
    fn flush_chunk(&mut self) -> McapResult<()> {
        let Some(chunk) = self.chunk.take() else {
            return Ok(());
        };
        if chunk.buf.is_empty() {
            return Ok(());
        }

        let uncompressed_size = chunk.buf.len() as u64;
        let uncompressed_crc = if self.options.use_chunk_crc {
            crc32(&chunk.buf)
        } else {
            0
        };
        let compressed = if self.options.compression.is_empty() {
            chunk.buf
        } else {
            self.codec.compress(&chunk.buf)?
        };

        let header = records::ChunkHeader {
            message_start_time: chunk.message_bounds.map(|b| b.0).unwrap_or(0),
            message_end_time: chunk.message_bounds.map(|b| b.1).unwrap_or(0),
            uncompressed_size,
            uncompressed_crc,
            compression: self.options.compression.clone(),
            compressed_size: compressed.len() as u64,
        };
        let mut head = Vec::new();
        Cursor::new(&mut head).write_le(&header)?;

        let padding = self.options.padding;
        let chunk_start_offset = self.sink().position();
        let mut framed = Vec::new();
        put_framing(
            &mut framed,
            op::CHUNK,
            head.len() + compressed.len() + padding,
        );
        framed.extend_from_slice(&head);
        let sink = self.sink();
        sink.write_all(&framed)?;
        sink.write_all(&compressed)?;
        let pad = vec![0; padding];
        sink.write_all(&pad)?;
        let chunk_end = sink.position();
        let chunk_length = chunk_end - chunk_start_offset;

        let mut message_index_offsets = BTreeMap::new();
        if self.options.use_message_index {
            for (channel_id, entries) in &chunk.indexes {
                message_index_offsets.insert(*channel_id, self.sink().position());
                self.write_sink_record(&Record::MessageIndex(records::MessageIndex {
                    channel_id: *channel_id,
                    records: entries.clone(),
                }))?;
            }
        }
        let message_index_length = self.sink().position() - chunk_end;

        debug!(
            "finished chunk at {chunk_start_offset}: {uncompressed_size} bytes -> {} bytes",
            header.compressed_size
        );

        if self.options.use_chunk_index {
            self.chunk_indexes.push(records::ChunkIndex {
                message_start_time: header.message_start_time,
                message_end_time: header.message_end_time,
                chunk_start_offset,
                chunk_length,
                message_index_offsets,
                message_index_length,
                compression: header.compression,
                compressed_size: header.compressed_size,
                uncompressed_size,
            });
        }
        self.chunk_count += 1;
        Ok(())
    }

    /// Finish the file: flush the open chunk, then write the DataEnd
    /// record, the summary section, the footer, and the closing magic.
    ///
    /// Finishing an already finished writer is a no-op.
    pub fn finish(&mut self) -> McapResult<()> {
        if self.finished {
            return Ok(());
        }
        self.check_active()?;
        let result = self.finish_inner();
        match &result {
            Ok(()) => self.finished = true,
            Err(_) => self.failed = true,
        }
        result
    }

    fn finish_inner(&mut self) -> McapResult<()> {
        self.flush_chunk()?;

        // The data-section CRC covers everything up to (not including) the
        // DataEnd record, so grab it before framing that record.
        let data_section_crc = if self.options.use_data_section_crc {
            self.sink().crc()
        } else {
            0
        };
        self.write_sink_record(&Record::DataEnd(records::DataEnd { data_section_crc }))?;

        let summary_start = self.sink().position();
        let mut hasher = Hasher::new();
        let mut offsets = Vec::new();
        let mut scratch = Vec::new();

        macro_rules! summary_group {
            ($opcode:expr, $records:expr) => {{
                let group_start = self.sink().position();
                for record in $records {
                    scratch.clear();
                    put_record(&mut scratch, &record, self.options.padding)?;
                    hasher.update(&scratch);
                    self.sink().write_all(&scratch)?;
                }
                let group_length = self.sink().position() - group_start;
                if group_length > 0 {
                    offsets.push(records::SummaryOffset {
                        group_opcode: $opcode,
                        group_start,
                        group_length,
                    });
                }
            }};
        }

        summary_group!(
            op::SCHEMA,
            self.schemas
                .values()
                .map(|(header, data)| Record::Schema {
                    header: header.clone(),
                    data: data.clone(),
                })
                .collect::<Vec<_>>()
        );
        summary_group!(
            op::CHANNEL,
            self.channels
                .values()
                .cloned()
                .map(Record::Channel)
                .collect::<Vec<_>>()
        );
        if self.options.use_statistics {
            let bounds = self.message_bounds.unwrap_or((0, 0));
            let stats = records::Statistics {
                message_count: self.channel_message_counts.values().sum(),
                schema_count: self.schemas.len() as u16,
                channel_count: self.channels.len() as u32,
                attachment_count: self.attachment_indexes.len() as u32,
                metadata_count: self.metadata_indexes.len() as u32,
                chunk_count: self.chunk_count,
                message_start_time: bounds.0,
                message_end_time: bounds.1,
                channel_message_counts: self.channel_message_counts.clone(),
            };
            summary_group!(op::STATISTICS, [Record::Statistics(stats)]);
        }
        if self.options.use_chunk_index {
            let indexes = std::mem::take(&mut self.chunk_indexes);
            summary_group!(
                op::CHUNK_INDEX,
                indexes.into_iter().map(Record::ChunkIndex).collect::<Vec<_>>()
            );
        }
        if self.options.use_attachment_index {
            let indexes = std::mem::take(&mut self.attachment_indexes);
            summary_group!(
                op::ATTACHMENT_INDEX,
                indexes
                    .into_iter()
                    .map(Record::AttachmentIndex)
                    .collect::<Vec<_>>()
            );
        }
        if self.options.use_metadata_index {
            let indexes = std::mem::take(&mut self.metadata_indexes);
            summary_group!(
                op::METADATA_INDEX,
                indexes
                    .into_iter()
                    .map(Record::MetadataIndex)
                    .collect::<Vec<_>>()
            );
        }

        let mut summary_offset_start = 0;
        if self.options.use_summary_offsets && !offsets.is_empty() {
            summary_offset_start = self.sink().position();
            for offset in std::mem::take(&mut offsets) {
                scratch.clear();
                put_record(&mut scratch, &Record::SummaryOffset(offset), self.options.padding)?;
                hasher.update(&scratch);
                self.sink().write_all(&scratch)?;
            }
        }

        let summary_end = self.sink().position();
        let footer = if summary_end == summary_start {
            // Nothing in the summary: the footer is all zeroes.
            records::Footer::default()
        } else {
            // The summary CRC also covers the footer itself, up through its
            // summary_offset_start field.
            let mut prefix = Vec::new();
            put_framing(&mut prefix, op::FOOTER, 20);
            prefix.write_u64::<LE>(summary_start)?;
            prefix.write_u64::<LE>(summary_offset_start)?;
            hasher.update(&prefix);
            records::Footer {
                summary_start,
                summary_offset_start,
                summary_crc: if self.options.use_summary_crc {
                    hasher.finalize()
                } else {
                    0
                },
            }
        };

        let mut tail = Vec::new();
        put_framing(&mut tail, op::FOOTER, 20);
        tail.write_u64::<LE>(footer.summary_start)?;
        tail.write_u64::<LE>(footer.summary_offset_start)?;
        tail.write_u32::<LE>(footer.summary_crc)?;
        tail.extend_from_slice(MAGIC);
        let sink = self.sink();
        sink.write_all(&tail)?;
        sink.flush()?;
        Ok(())
    }

    /// Finish the file (if needed) and return the underlying sink.
    pub fn into_inner(mut self) -> McapResult<W> {
        self.finish()?;
        let sink = self.sink.take().expect("into_inner() can only run once");
        Ok(sink.into_inner())
    }
}

impl<W: Write> Drop for Writer<W> {
    fn drop(&mut self) {
        if !self.finished && !self.failed && self.sink.is_some() {
            self.finish().expect("failed to finish MCAP file");
        }
    }
}

struct ChunkBuilder {
    /// The chunk's uncompressed record stream.
    buf: Vec<u8>,
    message_bounds: Option<(u64, u64)>,
    indexes: BTreeMap<u16, Vec<records::MessageIndexEntry>>,
    schemas_seen: HashSet<u16>,
    channels_seen: HashSet<u16>,
    padding: usize,
}

impl ChunkBuilder {
    fn put(&mut self, record: &Record) -> McapResult<()> {
        put_record(&mut self.buf, record, self.padding)
    }

    fn put_message(
        &mut self,
        header: &MessageHeader,
        data: &[u8],
        index: bool,
    ) -> McapResult<()> {
        self.message_bounds = Some(match self.message_bounds {
            None => (header.log_time, header.log_time),
            Some((start, end)) => (start.min(header.log_time), end.max(header.log_time)),
        });
        if index {
            self.indexes
                .entry(header.channel_id)
                .or_default()
                .push(records::MessageIndexEntry {
                    log_time: header.log_time,
                    offset: self.buf.len() as u64,
                });
        }
        let mut head = [0u8; MessageHeader::LEN];
        Cursor::new(&mut head[..]).write_le(header)?;
        put_framing(&mut self.buf, op::MESSAGE, head.len() + data.len());
        self.buf.extend_from_slice(&head);
        self.buf.extend_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer() -> Writer<Cursor<Vec<u8>>> {
        Writer::new(Cursor::new(Vec::new())).expect("failed to construct writer")
    }

    #[test]
    fn identical_registrations_share_an_id() {
        let mut w = writer();
        let s1 = w.register_schema("S", "c", &[1]).unwrap();
        let s2 = w.register_schema("S", "c", &[1]).unwrap();
        assert_eq!(s1, s2);
        let s3 = w.register_schema("S", "c", &[2]).unwrap();
        assert_ne!(s1, s3);

        let c1 = w.register_channel(s1, "t", "raw", &BTreeMap::new()).unwrap();
        let c2 = w.register_channel(s1, "t", "raw", &BTreeMap::new()).unwrap();
        assert_eq!(c1, c2);
        let c3 = w.register_channel(s3, "t", "raw", &BTreeMap::new()).unwrap();
        assert_ne!(c1, c3);
    }

    #[test]
    fn schemaless_registration_returns_the_reserved_id() {
        let mut w = writer();
        assert_eq!(w.register_schema("", "", &[]).unwrap(), 0);
        // And doesn't consume a real ID.
        assert_eq!(w.register_schema("S", "c", &[]).unwrap(), 1);
    }

    #[test]
    fn channels_must_reference_known_schemas() {
        let mut w = writer();
        assert!(matches!(
            w.register_channel(3, "t", "raw", &BTreeMap::new()),
            Err(McapError::UnknownSchema(topic, 3)) if topic == "t"
        ));
        // Schema 0 is always available.
        assert!(w.register_channel(0, "t", "raw", &BTreeMap::new()).is_ok());
    }

    #[test]
    fn messages_must_reference_known_channels() {
        let mut w = writer();
        let err = w.add_message(&MessageHeader::default(), &[]);
        assert!(matches!(err, Err(McapError::UnknownChannel(0, 0))));
    }

    #[test]
    fn finish_is_idempotent_but_other_calls_fail() {
        let mut w = writer();
        w.finish().unwrap();
        w.finish().unwrap();
        assert!(matches!(
            w.register_schema("S", "c", &[]),
            Err(McapError::FinishedWriter)
        ));
    }

    #[test]
    fn write_failures_poison_the_writer() {
        struct FailingSink(usize);
        impl Write for FailingSink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                if self.0 < buf.len() {
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, "sink full"));
                }
                self.0 -= buf.len();
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        // Room for the magic, header, and channel record, but nothing more.
        let mut w = WriteOptions::new()
            .use_chunks(false)
            .create(FailingSink(64))
            .unwrap();
        let channel = w.register_channel(0, "t", "raw", &BTreeMap::new()).unwrap();
        let header = MessageHeader {
            channel_id: channel,
            ..Default::default()
        };
        assert!(matches!(
            w.add_message(&header, &[0; 128]),
            Err(McapError::Io(_))
        ));
        assert!(matches!(
            w.add_message(&header, &[]),
            Err(McapError::FailedWriter)
        ));
        assert!(matches!(w.finish(), Err(McapError::FailedWriter)));
    }

    #[test]
    fn unknown_compression_fails_at_creation() {
        let result = WriteOptions::new()
            .compression("snappy")
            .create(Cursor::new(Vec::new()));
        assert!(matches!(
            result,
            Err(McapError::UnsupportedCompression(name)) if name == "snappy"
        ));
    }
}
