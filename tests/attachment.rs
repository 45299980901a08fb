use std::{borrow::Cow, io::Cursor};

use anyhow::Result;
use mcapio::{records::op, Attachment, IndexedReader, McapError, WriteOptions};

fn my_file() -> Attachment {
    Attachment {
        log_time: 2,
        create_time: 1,
        name: "myFile".into(),
        media_type: "application/octet-stream".into(),
        data: Cow::Borrowed(&[1, 2, 3]),
    }
}

fn write_one() -> Result<Vec<u8>> {
    let mut writer = WriteOptions::new().create(Cursor::new(Vec::new()))?;
    writer.add_attachment(&my_file())?;
    Ok(writer.into_inner()?.into_inner())
}

#[test]
fn attachments_round_trip_through_their_index() -> Result<()> {
    let mcap = write_one()?;
    let mut reader = IndexedReader::new(Cursor::new(&mcap))?;

    let indexes = reader.attachment_indexes().to_vec();
    assert_eq!(indexes.len(), 1);
    let index = &indexes[0];
    assert_eq!(index.name, "myFile");
    assert_eq!(index.media_type, "application/octet-stream");
    assert_eq!(index.log_time, 2);
    assert_eq!(index.create_time, 1);
    assert_eq!(index.data_size, 3);

    // The index points at the attachment record's opcode byte.
    assert_eq!(mcap[index.offset as usize], op::ATTACHMENT);

    assert_eq!(reader.attachment(index)?, my_file());

    let stats = reader.statistics().expect("statistics are on by default");
    assert_eq!(stats.attachment_count, 1);
    Ok(())
}

#[test]
fn corrupted_attachment_data_fails_the_crc() -> Result<()> {
    let mcap = write_one()?;
    let mut reader = IndexedReader::new(Cursor::new(&mcap))?;
    let index = reader.attachment_indexes()[0].clone();

    // The data's last byte sits just before the trailing CRC.
    let record_end = (index.offset + index.length) as usize;
    let mut corrupted = mcap.clone();
    corrupted[record_end - 5] ^= 1;

    let mut reader = IndexedReader::new(Cursor::new(&corrupted))?;
    assert!(matches!(
        reader.attachment(&index),
        Err(McapError::BadAttachmentCrc { .. })
    ));
    Ok(())
}

#[test]
fn attachments_interleave_with_chunked_messages() -> Result<()> {
    use mcapio::{records::MessageHeader, MessageQuery};
    use std::collections::BTreeMap;

    let mut writer = WriteOptions::new().create(Cursor::new(Vec::new()))?;
    let channel = writer.register_channel(0, "t", "raw", &BTreeMap::new())?;
    writer.add_message(
        &MessageHeader {
            channel_id: channel,
            sequence: 0,
            log_time: 1,
            publish_time: 1,
        },
        &[0xaa],
    )?;
    // This closes the open chunk before the attachment is written.
    writer.add_attachment(&my_file())?;
    writer.add_message(
        &MessageHeader {
            channel_id: channel,
            sequence: 1,
            log_time: 3,
            publish_time: 3,
        },
        &[0xbb],
    )?;
    let mcap = writer.into_inner()?.into_inner();

    let mut reader = IndexedReader::new(Cursor::new(&mcap))?;
    assert_eq!(reader.chunk_indexes().len(), 2);
    assert_eq!(reader.attachment_indexes().len(), 1);
    let times: Vec<u64> = reader
        .messages(MessageQuery::new())?
        .map(|m| m.map(|m| m.log_time))
        .collect::<mcapio::McapResult<_>>()?;
    assert_eq!(times, [1, 3]);
    Ok(())
}
