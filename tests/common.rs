// Not every suite uses every helper.
#![allow(dead_code)]

use std::{collections::BTreeMap, io::Cursor};

use mcapio::{records::MessageHeader, IndexedReader, McapResult, MessageQuery, WriteOptions};

/// Log times of the demo file, in write order. Ten messages alternating
/// between two channels, split across three chunks, with out-of-order
/// times and one duplicate to exercise tie-breaking.
pub const DEMO_TIMES: [u64; 10] = [0, 2, 1, 3, 3, 5, 4, 7, 8, 9];

/// Write the shared demo file: a schema'd "pose" channel, a schemaless
/// "gps" channel, and [`DEMO_TIMES`] interleaved across three chunks.
pub fn write_demo(options: WriteOptions) -> McapResult<Vec<u8>> {
    let mut writer = options.create(Cursor::new(Vec::new()))?;
    let schema = writer.register_schema("Example", "c", &[4, 5, 6])?;
    let pose = writer.register_channel(schema, "pose", "cdr", &BTreeMap::new())?;
    let gps = writer.register_channel(0, "gps", "json", &BTreeMap::new())?;

    let chunks: [&[usize]; 3] = [&[0, 1, 2], &[3, 4, 5], &[6, 7, 8, 9]];
    for chunk in chunks {
        for &i in chunk {
            let channel_id = if i % 2 == 0 { pose } else { gps };
            let log_time = DEMO_TIMES[i];
            writer.add_message(
                &MessageHeader {
                    channel_id,
                    sequence: i as u32,
                    log_time,
                    publish_time: log_time,
                },
                &log_time.to_le_bytes(),
            )?;
        }
        writer.flush()?;
    }
    writer.into_inner().map(Cursor::into_inner)
}

/// The log times an indexed query yields, in yield order.
pub fn query_times(mcap: &[u8], query: MessageQuery) -> McapResult<Vec<u64>> {
    let mut reader = IndexedReader::new(Cursor::new(mcap))?;
    let mut times = Vec::new();
    for message in reader.messages(query)? {
        times.push(message?.log_time);
    }
    Ok(times)
}
