//! Framing helpers for Chunk records: expanding a chunk into its inner
//! record stream and walking `opcode | length | body` sequences in memory.

use crc32fast::hash as crc32;

use crate::{
    compression::CompressionRegistry,
    records::{ChunkHeader, FRAMING_LEN},
    McapError, McapResult,
};

/// Decompress a chunk's `records` field and validate it against the header.
///
/// The header's `uncompressed_size` must match exactly, and a nonzero
/// `uncompressed_crc` must match a CRC of the expanded bytes.
pub(crate) fn expand_chunk(
    header: &ChunkHeader,
    data: &[u8],
    registry: &CompressionRegistry,
) -> McapResult<Vec<u8>> {
    let codec = registry.get(&header.compression)?;
    let records = codec.decompress(data, header.uncompressed_size)?;
    if header.uncompressed_crc != 0 {
        let calculated = crc32(&records);
        if calculated != header.uncompressed_crc {
            return Err(McapError::BadChunkCrc {
                saved: header.uncompressed_crc,
                calculated,
            });
        }
    }
    Ok(records)
}

/// Walks a record sequence held in memory (a decompressed chunk, the summary
/// region, or a run of message indexes), yielding each record's opcode,
/// offset, and body without decoding it.
pub(crate) struct RawRecords<'a> {
    buf: &'a [u8],
    pos: usize,
}

/// One record framing in a [`RawRecords`] walk.
pub(crate) struct RawRecord<'a> {
    pub opcode: u8,
    /// Offset of the opcode byte from the start of the walked buffer.
    pub offset: usize,
    pub body: &'a [u8],
}

impl<'a> RawRecords<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl<'a> Iterator for RawRecords<'a> {
    type Item = McapResult<RawRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        match record_at(self.buf, self.pos) {
            Ok(raw) => {
                self.pos += FRAMING_LEN + raw.body.len();
                Some(Ok(raw))
            }
            Err(err) => {
                // Don't loop on a malformed buffer.
                self.pos = self.buf.len();
                Some(Err(err))
            }
        }
    }
}

/// Slice the record whose opcode byte sits at `offset` in `buf`.
pub(crate) fn record_at(buf: &[u8], offset: usize) -> McapResult<RawRecord<'_>> {
    let remaining = buf.get(offset..).unwrap_or_default();
    if remaining.len() < FRAMING_LEN {
        return Err(McapError::UnexpectedEoc);
    }
    let opcode = remaining[0];
    let len = u64::from_le_bytes(remaining[1..FRAMING_LEN].try_into().expect("sliced 8 bytes"));
    let len: usize = len.try_into().map_err(|_| McapError::TooLong(len))?;
    let body = &remaining[FRAMING_LEN..];
    if len > body.len() {
        return Err(McapError::UnexpectedEoc);
    }
    Ok(RawRecord {
        opcode,
        offset,
        body: &body[..len],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::op;

    fn frame(opcode: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![opcode];
        out.extend_from_slice(&(body.len() as u64).to_le_bytes());
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn walks_consecutive_records() {
        let mut buf = frame(op::CHANNEL, b"one");
        let second_offset = buf.len();
        buf.extend(frame(op::MESSAGE, b"two!"));

        let records: Vec<_> = RawRecords::new(&buf).map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].opcode, op::CHANNEL);
        assert_eq!(records[0].offset, 0);
        assert_eq!(records[0].body, b"one");
        assert_eq!(records[1].opcode, op::MESSAGE);
        assert_eq!(records[1].offset, second_offset);
        assert_eq!(records[1].body, b"two!");
    }

    #[test]
    fn truncated_tail_is_an_error() {
        let mut buf = frame(op::MESSAGE, b"whole");
        buf.extend(frame(op::MESSAGE, b"cut"));
        buf.pop();

        let mut records = RawRecords::new(&buf);
        assert!(records.next().unwrap().is_ok());
        assert!(matches!(records.next(), Some(Err(McapError::UnexpectedEoc))));
        assert!(records.next().is_none());
    }

    #[test]
    fn expansion_checks_size_and_crc() {
        let records = frame(op::MESSAGE, b"payload");
        let registry = CompressionRegistry::bare();
        let mut header = ChunkHeader {
            message_start_time: 0,
            message_end_time: 0,
            uncompressed_size: records.len() as u64,
            uncompressed_crc: crc32fast::hash(&records),
            compression: String::new(),
            compressed_size: records.len() as u64,
        };

        assert_eq!(expand_chunk(&header, &records, &registry).unwrap(), records);

        header.uncompressed_crc ^= 1;
        assert!(matches!(
            expand_chunk(&header, &records, &registry),
            Err(McapError::BadChunkCrc { .. })
        ));

        header.uncompressed_crc = 0; // opted out, any content passes
        assert!(expand_chunk(&header, &records, &registry).is_ok());

        header.uncompressed_size += 1;
        assert!(matches!(
            expand_chunk(&header, &records, &registry),
            Err(McapError::BadUncompressedSize { .. })
        ));
    }
}
