//! Random-access message reads driven by the summary section.
//!
//! [`IndexedReader`] parses the footer and summary of a finished MCAP file,
//! then answers [queries](MessageQuery) by walking the chunk index: chunks
//! overlapping the query are visited one at a time, decompressed, and
//! merged through a [heap](crate::heap) so that messages come out in file
//! order or ascending/descending log-time order, whatever the chunks'
//! layout on disk.

use std::{
    borrow::Cow,
    collections::{BTreeSet, HashMap},
    io::{self, Cursor, Read, Seek, SeekFrom},
    sync::Arc,
};

use binrw::BinReaderExt;
use crc32fast::Hasher;
use log::warn;

use crate::{
    chunk::{expand_chunk, record_at, RawRecords},
    compression::CompressionRegistry,
    heap::{Entry, RangeIndexHeap},
    records::{self, op, parse_record, MessageHeader, Record, FRAMING_LEN},
    stream::{StreamOptions, StreamReader},
    Attachment, Channel, McapError, McapResult, Message, ReadOrder, Schema, MAGIC,
};

const FOOTER_BODY_LEN: usize = 8 // summary start
    + 8 // summary offset start
    + 4; // summary CRC
const FOOTER_RECORD_LEN: usize = FRAMING_LEN + FOOTER_BODY_LEN;

/// A source of bytes that can be read at arbitrary offsets.
///
/// Implemented for anything [`Read`] + [`Seek`] (files, cursors over
/// buffers). Reads must fill the whole buffer or fail.
pub trait RandomAccess {
    fn size(&mut self) -> io::Result<u64>;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

impl<R: Read + Seek> RandomAccess for R {
    fn size(&mut self) -> io::Result<u64> {
        self.seek(SeekFrom::End(0))
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }
}

/// Adapts a [`RandomAccess`] source into sequential reads for the
/// data-section scan.
struct ScanSource<'a, S> {
    source: &'a mut S,
    pos: u64,
    size: u64,
}

impl<S: RandomAccess> Read for ScanSource<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (buf.len() as u64).min(self.size - self.pos) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.source.read_at(self.pos, &mut buf[..n])?;
        self.pos += n as u64;
        Ok(n)
    }
}

/// Configuration for an [`IndexedReader`].
#[derive(Clone, Default)]
pub struct IndexedReaderOptions {
    registry: Option<CompressionRegistry>,
    allow_unindexed_fallback: bool,
}

impl IndexedReaderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The codecs used to expand compressed chunks.
    pub fn compression_registry(mut self, registry: CompressionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// On a summary CRC mismatch, degrade to scanning the data section for
    /// schemas and channels (refusing indexed queries) instead of failing.
    pub fn allow_unindexed_fallback(mut self, allow: bool) -> Self {
        self.allow_unindexed_fallback = allow;
        self
    }
}

/// Selects and orders the messages returned by
/// [`IndexedReader::messages`].
///
/// Time bounds are inclusive at both ends. Topics are matched against the
/// channels known when the query starts; channels that only appear inside
/// later chunks are not considered.
#[derive(Clone, Default)]
pub struct MessageQuery {
    start_time: Option<u64>,
    end_time: Option<u64>,
    topics: Option<Vec<String>>,
    order: ReadOrder,
}

impl MessageQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only messages with `log_time >= start_time`.
    pub fn start_time(mut self, start_time: u64) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// Only messages with `log_time <= end_time`.
    pub fn end_time(mut self, end_time: u64) -> Self {
        self.end_time = Some(end_time);
        self
    }

    /// Only messages on channels with one of these topics.
    pub fn topics<T: IntoIterator<Item = impl Into<String>>>(mut self, topics: T) -> Self {
        self.topics = Some(topics.into_iter().map(Into::into).collect());
        self
    }

    pub fn order(mut self, order: ReadOrder) -> Self {
        self.order = order;
        self
    }
}

/// Reads messages, attachments, and metadata from a finished MCAP file
/// through its summary section.
pub struct IndexedReader<S> {
    source: S,
    size: u64,
    registry: CompressionRegistry,
    schemas: HashMap<u16, Arc<Schema>>,
    channels: HashMap<u16, Arc<Channel>>,
    statistics: Option<records::Statistics>,
    chunk_indexes: Vec<records::ChunkIndex>,
    attachment_indexes: Vec<records::AttachmentIndex>,
    metadata_indexes: Vec<records::MetadataIndex>,
    indexed: bool,
}

impl<S: RandomAccess> IndexedReader<S> {
    pub fn new(source: S) -> McapResult<Self> {
        Self::new_with_options(source, IndexedReaderOptions::default())
    }

    pub fn new_with_options(mut source: S, options: IndexedReaderOptions) -> McapResult<Self> {
        let size = source.size()?;
        if size < (2 * MAGIC.len() + FOOTER_RECORD_LEN) as u64 {
            return Err(McapError::UnexpectedEof);
        }

        let mut start_magic = [0u8; 8];
        source.read_at(0, &mut start_magic)?;
        if start_magic != MAGIC {
            return Err(McapError::BadMagic);
        }

        let mut tail = [0u8; FOOTER_RECORD_LEN + 8];
        source.read_at(size - tail.len() as u64, &mut tail)?;
        if &tail[FOOTER_RECORD_LEN..] != MAGIC {
            return Err(McapError::BadMagic);
        }
        if tail[0] != op::FOOTER {
            return Err(McapError::BadFooter);
        }
        let footer: records::Footer =
            Cursor::new(&tail[FRAMING_LEN..FOOTER_RECORD_LEN]).read_le()?;

        let mut reader = Self {
            source,
            size,
            registry: options.registry.unwrap_or_default(),
            schemas: HashMap::new(),
            channels: HashMap::new(),
            statistics: None,
            chunk_indexes: Vec::new(),
            attachment_indexes: Vec::new(),
            metadata_indexes: Vec::new(),
            indexed: false,
        };

        if footer.summary_start == 0 {
            // No summary at all. The channel table can still be recovered
            // from the data section, but indexed queries are off the table.
            reader.scan_data_section()?;
            return Ok(reader);
        }

        let footer_record_start = size - (FOOTER_RECORD_LEN + MAGIC.len()) as u64;
        if footer.summary_start >= footer_record_start {
            return Err(McapError::BadFooter);
        }
        let region_len: usize = (footer_record_start - footer.summary_start)
            .try_into()
            .map_err(|_| McapError::TooLong(footer_record_start - footer.summary_start))?;
        let mut region = vec![0u8; region_len];
        reader.source.read_at(footer.summary_start, &mut region)?;

        if footer.summary_crc != 0 {
            // The CRC runs from the start of the summary through the
            // footer's summary_offset_start field.
            let mut hasher = Hasher::new();
            hasher.update(&region);
            hasher.update(&tail[..FRAMING_LEN + 16]);
            let calculated = hasher.finalize();
            if calculated != footer.summary_crc {
                if !options.allow_unindexed_fallback {
                    return Err(McapError::BadSummaryCrc {
                        saved: footer.summary_crc,
                        calculated,
                    });
                }
                warn!("summary section CRC mismatch; degrading to a data-section scan");
                reader.scan_data_section()?;
                return Ok(reader);
            }
        }

        reader.load_summary(&region)?;
        reader.indexed = true;
        Ok(reader)
    }

    fn load_summary(&mut self, region: &[u8]) -> McapResult<()> {
        for raw in RawRecords::new(region) {
            let raw = raw?;
            match raw.opcode {
                op::SCHEMA => {
                    let Record::Schema { header, data } = parse_record(raw.opcode, raw.body)?
                    else {
                        unreachable!("schema opcode parses to a schema");
                    };
                    add_schema(&mut self.schemas, header, data)?;
                }
                op::CHANNEL => {
                    let channel = Cursor::new(raw.body).read_le()?;
                    add_channel(&self.schemas, &mut self.channels, channel)?;
                }
                op::STATISTICS => self.statistics = Some(Cursor::new(raw.body).read_le()?),
                op::CHUNK_INDEX => self.chunk_indexes.push(Cursor::new(raw.body).read_le()?),
                op::ATTACHMENT_INDEX => {
                    self.attachment_indexes.push(Cursor::new(raw.body).read_le()?)
                }
                op::METADATA_INDEX => self.metadata_indexes.push(Cursor::new(raw.body).read_le()?),
                op::SUMMARY_OFFSET => {}
                opcode => warn!("skipping unknown summary record (opcode {opcode:#04x})"),
            }
        }
        Ok(())
    }

    /// Recover schemas and channels by replaying the data section through
    /// the streaming reader, expanding chunks along the way.
    fn scan_data_section(&mut self) -> McapResult<()> {
        let scan = ScanSource {
            source: &mut self.source,
            pos: 0,
            size: self.size,
        };
        let stream = StreamReader::new_with_options(
            scan,
            StreamOptions::new().compression_registry(self.registry.clone()),
        );

        let mut schemas = HashMap::new();
        let mut channels = HashMap::new();
        for record in stream {
            match record? {
                Record::Schema { header, data } => add_schema(&mut schemas, header, data)?,
                Record::Channel(channel) => add_channel(&schemas, &mut channels, channel)?,
                Record::DataEnd(_) => break,
                Record::Unknown { opcode, .. } => {
                    warn!("skipping unknown record (opcode {opcode:#04x})")
                }
                _ => {}
            }
        }
        self.schemas = schemas;
        self.channels = channels;
        Ok(())
    }

    /// Whether the file had a usable summary. When false (or after a CRC
    /// fallback), [`messages`](Self::messages) returns
    /// [`McapError::NoIndex`].
    pub fn has_index(&self) -> bool {
        self.indexed
    }

    pub fn schemas(&self) -> &HashMap<u16, Arc<Schema>> {
        &self.schemas
    }

    pub fn channels(&self) -> &HashMap<u16, Arc<Channel>> {
        &self.channels
    }

    pub fn statistics(&self) -> Option<&records::Statistics> {
        self.statistics.as_ref()
    }

    pub fn chunk_indexes(&self) -> &[records::ChunkIndex] {
        &self.chunk_indexes
    }

    pub fn attachment_indexes(&self) -> &[records::AttachmentIndex] {
        &self.attachment_indexes
    }

    pub fn metadata_indexes(&self) -> &[records::MetadataIndex] {
        &self.metadata_indexes
    }

    /// Query messages by time range, topic, and order.
    ///
    /// Chunks are loaded and decompressed lazily as the returned iterator
    /// advances; dropping it mid-way releases any chunk buffers it holds.
    pub fn messages(&mut self, query: MessageQuery) -> McapResult<Messages<'_, S>> {
        if !self.indexed {
            return Err(McapError::NoIndex);
        }

        // Topic filtering is resolved to channel IDs up front.
        let channel_ids = query.topics.as_ref().map(|topics| {
            self.channels
                .iter()
                .filter(|(_, channel)| topics.iter().any(|t| *t == channel.topic))
                .map(|(&id, _)| id)
                .collect::<BTreeSet<u16>>()
        });

        let selected: Vec<records::ChunkIndex> = self
            .chunk_indexes
            .iter()
            .filter(|ci| {
                if matches!(query.start_time, Some(start) if ci.message_end_time < start) {
                    return false;
                }
                if matches!(query.end_time, Some(end) if ci.message_start_time > end) {
                    return false;
                }
                match &channel_ids {
                    // Without message indexes the chunk's channels are
                    // unknown, so it can't be ruled out.
                    Some(ids) if !ci.message_index_offsets.is_empty() => {
                        ci.message_index_offsets.keys().any(|id| ids.contains(id))
                    }
                    _ => true,
                }
            })
            .cloned()
            .collect();

        for ci in &selected {
            if ci.compressed_size > usize::MAX as u64 || ci.uncompressed_size > usize::MAX as u64 {
                return Err(McapError::TooLong(ci.uncompressed_size));
            }
        }

        let mut heap = RangeIndexHeap::new(query.order);
        for (seq, ci) in selected.iter().enumerate() {
            heap.push_chunk(seq, ci);
        }

        Ok(Messages {
            reader: self,
            selected,
            heap,
            start_time: query.start_time,
            end_time: query.end_time,
            channel_ids,
            done: false,
        })
    }

    /// Fetch the attachment a summary [`records::AttachmentIndex`] points at.
    pub fn attachment(&mut self, index: &records::AttachmentIndex) -> McapResult<Attachment> {
        let record = self.fetch_record(index.offset, index.length)?;
        let Record::Attachment { header, data, .. } = record else {
            return Err(McapError::BadIndex);
        };
        Ok(Attachment {
            log_time: header.log_time,
            create_time: header.create_time,
            name: header.name,
            media_type: header.media_type,
            data: Cow::Owned(data),
        })
    }

    /// Fetch the metadata record a summary [`records::MetadataIndex`] points at.
    pub fn metadata(&mut self, index: &records::MetadataIndex) -> McapResult<records::Metadata> {
        let record = self.fetch_record(index.offset, index.length)?;
        let Record::Metadata(metadata) = record else {
            return Err(McapError::BadIndex);
        };
        Ok(metadata)
    }

    fn fetch_record(&mut self, offset: u64, length: u64) -> McapResult<Record> {
        if offset.checked_add(length).map_or(true, |end| end > self.size) {
            return Err(McapError::BadIndex);
        }
        let length: usize = length.try_into().map_err(|_| McapError::TooLong(length))?;
        let mut buf = vec![0u8; length];
        self.source.read_at(offset, &mut buf)?;
        let raw = record_at(&buf, 0)?;
        parse_record(raw.opcode, raw.body)
    }
}

fn add_schema(
    schemas: &mut HashMap<u16, Arc<Schema>>,
    header: records::SchemaHeader,
    data: Vec<u8>,
) -> McapResult<()> {
    if header.id == 0 {
        return Err(McapError::InvalidSchemaId);
    }
    let schema = Schema {
        name: header.name,
        encoding: header.encoding,
        data: Cow::Owned(data),
    };
    if let Some(existing) = schemas.get(&header.id) {
        if **existing != schema {
            return Err(McapError::ConflictingSchemas(header.id));
        }
        return Ok(());
    }
    schemas.insert(header.id, Arc::new(schema));
    Ok(())
}

fn add_channel(
    schemas: &HashMap<u16, Arc<Schema>>,
    channels: &mut HashMap<u16, Arc<Channel>>,
    record: records::Channel,
) -> McapResult<()> {
    let schema = if record.schema_id == 0 {
        None
    } else {
        match schemas.get(&record.schema_id) {
            Some(schema) => Some(schema.clone()),
            None => return Err(McapError::UnknownSchema(record.topic, record.schema_id)),
        }
    };
    let channel = Channel {
        topic: record.topic,
        schema,
        message_encoding: record.message_encoding,
        metadata: record.metadata,
    };
    if let Some(existing) = channels.get(&record.id) {
        if **existing != channel {
            return Err(McapError::ConflictingChannels(record.id));
        }
        return Ok(());
    }
    channels.insert(record.id, Arc::new(channel));
    Ok(())
}

/// Lazy message sequence returned by [`IndexedReader::messages`].
pub struct Messages<'a, S> {
    reader: &'a mut IndexedReader<S>,
    /// The chunk indexes this query covers, in summary order; heap entries
    /// refer to them by position.
    selected: Vec<records::ChunkIndex>,
    heap: RangeIndexHeap,
    start_time: Option<u64>,
    end_time: Option<u64>,
    channel_ids: Option<BTreeSet<u16>>,
    done: bool,
}

impl<S: RandomAccess> Messages<'_, S> {
    fn channel_matches(&self, id: u16) -> bool {
        match &self.channel_ids {
            None => true,
            Some(ids) => ids.contains(&id),
        }
    }

    /// Load, expand, and index the chunk behind a popped chunk entry,
    /// pushing one message entry per message passing the filters.
    fn expand_chunk_entry(&mut self, seq: usize) -> McapResult<()> {
        let ci = self.selected[seq].clone();
        let length: usize = ci
            .chunk_length
            .try_into()
            .map_err(|_| McapError::TooLong(ci.chunk_length))?;
        if ci
            .chunk_start_offset
            .checked_add(ci.chunk_length)
            .map_or(true, |end| end > self.reader.size)
        {
            return Err(McapError::BadIndex);
        }
        let mut chunk_bytes = vec![0u8; length];
        self.reader.source.read_at(ci.chunk_start_offset, &mut chunk_bytes)?;
        let raw = record_at(&chunk_bytes, 0)?;
        if raw.opcode != op::CHUNK {
            return Err(McapError::BadIndex);
        }
        let Record::Chunk { header, data } = parse_record(raw.opcode, raw.body)? else {
            unreachable!("chunk opcode parses to a chunk");
        };
        let buffer = Arc::new(expand_chunk(&header, &data, &self.reader.registry)?);

        self.heap.mark_expanded(seq);
        for (log_time, offset) in self.index_entries(&ci, &buffer)? {
            if matches!(self.start_time, Some(start) if log_time < start) {
                continue;
            }
            if matches!(self.end_time, Some(end) if log_time > end) {
                continue;
            }
            self.heap.push_message(seq, &ci, log_time, offset, buffer.clone());
        }
        Ok(())
    }

    /// The (log_time, offset) pairs for a chunk's messages on matching
    /// channels, from its on-disk message indexes when it has them, else by
    /// scanning the expanded chunk.
    fn index_entries(
        &mut self,
        ci: &records::ChunkIndex,
        buffer: &Arc<Vec<u8>>,
    ) -> McapResult<Vec<(u64, u64)>> {
        let mut entries = Vec::new();
        if ci.message_index_offsets.is_empty() || ci.message_index_length == 0 {
            for raw in RawRecords::new(buffer) {
                let raw = raw?;
                if raw.opcode != op::MESSAGE {
                    continue;
                }
                let header: MessageHeader = Cursor::new(raw.body).read_le()?;
                if self.channel_matches(header.channel_id) {
                    entries.push((header.log_time, raw.offset as u64));
                }
            }
            return Ok(entries);
        }

        // Message index records sit in one run right after the chunk.
        let region_start = ci
            .chunk_start_offset
            .checked_add(ci.chunk_length)
            .ok_or(McapError::BadIndex)?;
        let region_len: usize = ci
            .message_index_length
            .try_into()
            .map_err(|_| McapError::TooLong(ci.message_index_length))?;
        if region_start
            .checked_add(ci.message_index_length)
            .map_or(true, |end| end > self.reader.size)
        {
            return Err(McapError::BadIndex);
        }
        let mut region = vec![0u8; region_len];
        self.reader.source.read_at(region_start, &mut region)?;

        for (&channel_id, &offset) in &ci.message_index_offsets {
            if !self.channel_matches(channel_id) {
                continue;
            }
            let relative: usize = offset
                .checked_sub(region_start)
                .ok_or(McapError::BadIndex)?
                .try_into()
                .map_err(|_| McapError::TooLong(offset))?;
            let raw = record_at(&region, relative)?;
            if raw.opcode != op::MESSAGE_INDEX {
                return Err(McapError::BadIndex);
            }
            let index: records::MessageIndex = Cursor::new(raw.body).read_le()?;
            if index.channel_id != channel_id {
                return Err(McapError::BadIndex);
            }
            entries.extend(index.records.iter().map(|e| (e.log_time, e.offset)));
        }
        Ok(entries)
    }

    fn advance(&mut self) -> McapResult<Option<Message>> {
        loop {
            match self.heap.pop()? {
                None => return Ok(None),
                Some(Entry::Chunk { seq }) => self.expand_chunk_entry(seq)?,
                Some(Entry::Message { buffer, offset }) => {
                    let raw = record_at(&buffer, offset)?;
                    if raw.opcode != op::MESSAGE {
                        return Err(McapError::BadIndex);
                    }
                    let header: MessageHeader = Cursor::new(raw.body).read_le()?;
                    let channel = self
                        .reader
                        .channels
                        .get(&header.channel_id)
                        .cloned()
                        .ok_or(McapError::UnknownChannel(header.sequence, header.channel_id))?;
                    return Ok(Some(Message {
                        channel,
                        sequence: header.sequence,
                        log_time: header.log_time,
                        publish_time: header.publish_time,
                        data: Cow::Owned(raw.body[MessageHeader::LEN..].to_vec()),
                    }));
                }
            }
        }
    }
}

impl<S: RandomAccess> Iterator for Messages<'_, S> {
    type Item = McapResult<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
