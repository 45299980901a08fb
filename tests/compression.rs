mod common;

use common::*;

use std::io::Cursor;

use anyhow::Result;
use mcapio::{
    CompressionRegistry, IndexedReader, IndexedReaderOptions, McapError, MessageQuery, ReadOrder,
    WriteOptions,
};

fn round_trip(compression: &str) -> Result<()> {
    let mcap = write_demo(WriteOptions::new().compression(compression))?;
    let times = query_times(&mcap, MessageQuery::new().order(ReadOrder::File))?;
    assert_eq!(times, DEMO_TIMES);
    Ok(())
}

macro_rules! compression_round_trips {
    ($($name:ident => $scheme:literal),* $(,)?) => {
        paste::paste! {
            $(
                #[test]
                fn [<$name _round_trip>]() -> Result<()> {
                    round_trip($scheme)
                }
            )*
        }
    };
}

compression_round_trips! { uncompressed => "" }

#[cfg(feature = "lz4")]
compression_round_trips! { lz4 => "lz4" }

#[cfg(feature = "zstd")]
compression_round_trips! { zstd => "zstd" }

#[cfg(feature = "zstd")]
#[test]
fn chunks_are_actually_compressed() -> Result<()> {
    let mcap = write_demo(WriteOptions::new().compression("zstd"))?;
    let reader = IndexedReader::new(Cursor::new(&mcap))?;
    for ci in reader.chunk_indexes() {
        assert_eq!(ci.compression, "zstd");
        assert_ne!(ci.compressed_size, ci.uncompressed_size);
    }
    Ok(())
}

/// A reader without the file's codec fails on the first chunk access, not
/// at open (the summary itself is never compressed).
#[cfg(feature = "zstd")]
#[test]
fn missing_codec_fails_on_first_chunk_access() -> Result<()> {
    let mcap = write_demo(WriteOptions::new().compression("zstd"))?;

    let mut reader = IndexedReader::new_with_options(
        Cursor::new(&mcap),
        IndexedReaderOptions::new().compression_registry(CompressionRegistry::bare()),
    )?;
    assert_eq!(reader.channels().len(), 2);

    let mut messages = reader.messages(MessageQuery::new())?;
    assert!(matches!(
        messages.next(),
        Some(Err(McapError::UnsupportedCompression(name))) if name == "zstd"
    ));
    assert!(messages.next().is_none());
    Ok(())
}

#[test]
fn corrupted_chunk_bytes_fail_the_crc() -> Result<()> {
    let mcap = write_demo(WriteOptions::new())?;

    // Find the first chunk's records through its index, then flip one byte.
    let first_data_offset = {
        let reader = IndexedReader::new(Cursor::new(&mcap))?;
        reader.chunk_indexes()[0].compressed_data_offset()?
    };
    let mut corrupted = mcap.clone();
    corrupted[first_data_offset as usize + 12] ^= 1;

    let mut reader = IndexedReader::new(Cursor::new(&corrupted))?;
    let result: Result<Vec<_>, _> = reader.messages(MessageQuery::new())?.collect();
    assert!(matches!(result, Err(McapError::BadChunkCrc { .. })));
    Ok(())
}

#[test]
fn chunk_crc_can_be_opted_out() -> Result<()> {
    let mcap = write_demo(WriteOptions::new().use_chunk_crc(false))?;
    let times = query_times(&mcap, MessageQuery::new().order(ReadOrder::File))?;
    assert_eq!(times, DEMO_TIMES);
    Ok(())
}

#[test]
fn corrupted_summary_bytes_fail_the_crc() -> Result<()> {
    let mcap = write_demo(WriteOptions::new())?;

    // The footer's 20-byte body sits just before the end magic.
    let footer_body = mcap.len() - 8 - 20;
    let summary_start =
        u64::from_le_bytes(mcap[footer_body..footer_body + 8].try_into().unwrap()) as usize;
    assert_ne!(summary_start, 0);
    let mut corrupted = mcap.clone();
    corrupted[summary_start + 1] ^= 1;

    assert!(matches!(
        IndexedReader::new(Cursor::new(&corrupted)),
        Err(McapError::BadSummaryCrc { .. })
    ));

    // With the fallback enabled the reader degrades to a data-section scan.
    let reader = IndexedReader::new_with_options(
        Cursor::new(&corrupted),
        IndexedReaderOptions::new().allow_unindexed_fallback(true),
    )?;
    assert!(!reader.has_index());
    assert_eq!(reader.channels().len(), 2);
    Ok(())
}
