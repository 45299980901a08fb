mod common;

use common::*;

use std::{collections::BTreeMap, io::Cursor};

use anyhow::Result;
use mcapio::{
    records::{MessageHeader, Record},
    ChunkHandling, IndexedReader, MessageQuery, ReadOrder, StreamOptions, StreamReader,
    WriteOptions,
};

/// A tiny chunk size makes the writer cut a chunk per message.
#[test]
fn chunks_auto_cut_at_the_size_threshold() -> Result<()> {
    let mcap = write_demo(WriteOptions::new().chunk_size(1))?;

    let reader = IndexedReader::new(Cursor::new(&mcap))?;
    assert_eq!(
        reader.statistics().expect("stats are on by default").chunk_count,
        10
    );

    let times = query_times(&mcap, MessageQuery::new().order(ReadOrder::File))?;
    assert_eq!(times, DEMO_TIMES);
    Ok(())
}

#[test]
fn unchunked_files_stream_and_scan() -> Result<()> {
    let mcap = write_demo(WriteOptions::new().use_chunks(false))?;

    // No chunk records anywhere.
    let records: Vec<Record> = StreamReader::new_with_options(
        &mcap[..],
        StreamOptions::new().chunk_handling(ChunkHandling::Raw),
    )
    .collect::<mcapio::McapResult<_>>()?;
    assert!(!records.iter().any(|r| matches!(r, Record::Chunk { .. })));
    let message_count = records
        .iter()
        .filter(|r| matches!(r, Record::Message { .. }))
        .count();
    assert_eq!(message_count, 10);

    // The summary still has schemas, channels, and statistics, but no
    // chunk index to answer message queries with.
    let reader = IndexedReader::new(Cursor::new(&mcap))?;
    assert_eq!(reader.channels().len(), 2);
    assert!(reader.chunk_indexes().is_empty());
    assert_eq!(
        reader.statistics().expect("stats are on by default").message_count,
        10
    );
    Ok(())
}

/// With self-contained chunks on, every chunk re-states the schema and
/// channel records its messages use.
#[test]
fn repeated_schemas_and_channels_make_chunks_self_contained() -> Result<()> {
    let mcap = write_demo(
        WriteOptions::new()
            .use_repeated_schemas(true)
            .use_repeated_channels(true),
    )?;

    let mut raw = StreamReader::new_with_options(
        &mcap[..],
        StreamOptions::new().chunk_handling(ChunkHandling::Raw),
    );
    let chunk_count = raw
        .by_ref()
        .filter(|r| matches!(r, Ok(Record::Chunk { .. })))
        .count();
    assert_eq!(chunk_count, 3);

    // Expanded, both channels appear in each of the three chunks: once at
    // registration, then restated on first reference in the later chunks.
    let mut channel_records = 0;
    for record in StreamReader::new(&mcap[..]) {
        match record? {
            Record::Channel(_) => channel_records += 1,
            Record::DataEnd(_) => break,
            _ => {}
        }
    }
    assert_eq!(channel_records, 6);

    let times = query_times(&mcap, MessageQuery::new().order(ReadOrder::File))?;
    assert_eq!(times, DEMO_TIMES);
    Ok(())
}

/// Unreferenced channels aren't repeated into chunks that never use them.
#[test]
fn repeated_records_only_cover_referenced_channels() -> Result<()> {
    let mut writer = WriteOptions::new()
        .use_repeated_channels(true)
        .create(Cursor::new(Vec::new()))?;
    let used = writer.register_channel(0, "used", "raw", &BTreeMap::new())?;
    let _unused = writer.register_channel(0, "unused", "raw", &BTreeMap::new())?;
    writer.flush()?;

    // A fresh chunk: only the referenced channel should be restated.
    writer.add_message(
        &MessageHeader {
            channel_id: used,
            sequence: 0,
            log_time: 1,
            publish_time: 1,
        },
        &[],
    )?;
    let mcap = writer.into_inner()?.into_inner();

    let mut channel_records = 0;
    for record in StreamReader::new(&mcap[..]) {
        match record? {
            Record::Channel(_) => channel_records += 1,
            Record::DataEnd(_) => break,
            _ => {}
        }
    }
    // Two from registration, one restated in the second chunk.
    assert_eq!(channel_records, 3);
    Ok(())
}
