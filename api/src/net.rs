//! Wire codec
//!
//! Everything that leaves a peer is encoded big-endian with `binrw`.
//! Variable-size fields are prefixed with a `u32` length (or element count).
use std::io;

use binrw::io::{Cursor, Read, Seek, Write};
use binrw::{BinRead, BinResult, BinWrite, Endian};
use convi::{CastFrom, ExpectFrom};
use thiserror::Error;

use crate::rpc::ModifyBatch;
use crate::{ConfChange, Message, MessageType, Modify, Snapshot};

#[derive(Error, Debug)]
pub enum WireError {
    #[error("local message {0:?} can not be sent over the wire")]
    LocalMessage(MessageType),
    #[error("data decoding error: {0}")]
    Decoding(#[from] binrw::Error),
}

pub type WireResult<T> = std::result::Result<T, WireError>;

/// Encode a message to be handed to the transport
///
/// Fails for the purely local message kinds, which must never
/// be put on the wire.
pub fn encode_message(msg: &Message) -> WireResult<Vec<u8>> {
    if msg.msg_type.is_local() {
        return Err(WireError::LocalMessage(msg.msg_type));
    }
    let mut cursor = Cursor::new(vec![]);
    msg.write(&mut cursor)?;
    Ok(cursor.into_inner())
}

pub fn decode_message(bytes: &[u8]) -> WireResult<Message> {
    let msg = Message::read(&mut Cursor::new(bytes))?;
    if msg.msg_type.is_local() {
        return Err(WireError::LocalMessage(msg.msg_type));
    }
    Ok(msg)
}

/// Encode a batch of modifications as a payload of a normal log entry
pub fn encode_batch(modifies: Vec<Modify>) -> WireResult<Vec<u8>> {
    let mut cursor = Cursor::new(vec![]);
    ModifyBatch { modifies }.write(&mut cursor)?;
    Ok(cursor.into_inner())
}

pub fn decode_batch(bytes: &[u8]) -> WireResult<Vec<Modify>> {
    Ok(ModifyBatch::read(&mut Cursor::new(bytes))?.modifies)
}

/// Encode a membership change as a payload of a conf change log entry
pub fn encode_conf_change(cc: &ConfChange) -> WireResult<Vec<u8>> {
    let mut cursor = Cursor::new(vec![]);
    cc.write(&mut cursor)?;
    Ok(cursor.into_inner())
}

pub fn decode_conf_change(bytes: &[u8]) -> WireResult<ConfChange> {
    Ok(ConfChange::read(&mut Cursor::new(bytes))?)
}

pub(crate) fn parse_bytes<R: Read + Seek>(
    reader: &mut R,
    endian: Endian,
    _: (),
) -> BinResult<Vec<u8>> {
    let len = u32::read_options(reader, endian, ())?;
    // the length is untrusted, so the buffer only grows with what is actually read
    let mut bytes = vec![];
    reader.by_ref().take(u64::from(len)).read_to_end(&mut bytes)?;
    if bytes.len() != usize::cast_from(len) {
        return Err(binrw::Error::Io(io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(bytes)
}

#[allow(clippy::ptr_arg)]
pub(crate) fn write_bytes<W: Write + Seek>(
    bytes: &Vec<u8>,
    writer: &mut W,
    endian: Endian,
    _: (),
) -> BinResult<()> {
    u32::expect_from(bytes.len()).write_options(writer, endian, ())?;
    writer.write_all(bytes)?;
    Ok(())
}

pub(crate) fn parse_string<R: Read + Seek>(
    reader: &mut R,
    endian: Endian,
    args: (),
) -> BinResult<String> {
    let pos = reader.stream_position()?;
    let bytes = parse_bytes(reader, endian, args)?;
    String::from_utf8(bytes).map_err(|e| binrw::Error::AssertFail {
        pos,
        message: format!("invalid utf8 string: {e}"),
    })
}

#[allow(clippy::ptr_arg)]
pub(crate) fn write_string<W: Write + Seek>(
    s: &String,
    writer: &mut W,
    endian: Endian,
    _: (),
) -> BinResult<()> {
    u32::expect_from(s.len()).write_options(writer, endian, ())?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

pub(crate) fn parse_vec<T, R>(reader: &mut R, endian: Endian, _: ()) -> BinResult<Vec<T>>
where
    T: for<'a> BinRead<Args<'a> = ()>,
    R: Read + Seek,
{
    let count = u32::read_options(reader, endian, ())?;
    (0..count)
        .map(|_| T::read_options(reader, endian, ()))
        .collect()
}

#[allow(clippy::ptr_arg)]
pub(crate) fn write_vec<T, W>(items: &Vec<T>, writer: &mut W, endian: Endian, _: ()) -> BinResult<()>
where
    T: for<'a> BinWrite<Args<'a> = ()>,
    W: Write + Seek,
{
    u32::expect_from(items.len()).write_options(writer, endian, ())?;
    for item in items {
        item.write_options(writer, endian, ())?;
    }
    Ok(())
}

pub(crate) fn parse_snapshot_opt<R: Read + Seek>(
    reader: &mut R,
    endian: Endian,
    _: (),
) -> BinResult<Option<Snapshot>> {
    let pos = reader.stream_position()?;
    match u8::read_options(reader, endian, ())? {
        0 => Ok(None),
        1 => Ok(Some(Snapshot::read_options(reader, endian, ())?)),
        marker => Err(binrw::Error::AssertFail {
            pos,
            message: format!("invalid snapshot marker: {marker}"),
        }),
    }
}

pub(crate) fn write_snapshot_opt<W: Write + Seek>(
    snapshot: &Option<Snapshot>,
    writer: &mut W,
    endian: Endian,
    _: (),
) -> BinResult<()> {
    match snapshot {
        None => 0u8.write_options(writer, endian, ()),
        Some(snapshot) => {
            1u8.write_options(writer, endian, ())?;
            snapshot.write_options(writer, endian, ())
        }
    }
}

#[test]
fn local_messages_never_hit_the_wire() {
    use crate::{NodeId, TermId};

    for msg_type in [MessageType::Hup, MessageType::Beat] {
        let msg = Message {
            msg_type,
            from: NodeId(1),
            to: NodeId(1),
            ..Default::default()
        };
        assert!(matches!(
            encode_message(&msg),
            Err(WireError::LocalMessage(t)) if t == msg_type
        ));
    }

    // forwarded proposals carry no term, but are not local-only
    let msg = Message {
        msg_type: MessageType::Propose,
        from: NodeId(2),
        to: NodeId(1),
        term: TermId::LOCAL,
        ..Default::default()
    };
    assert!(encode_message(&msg).is_ok());
}

#[test]
fn message_wire_format() {
    use crate::{ConfState, Entry, EntryType, NodeId, SnapshotMetadata, TermId};

    let msg = Message {
        msg_type: MessageType::Append,
        to: NodeId(2),
        from: NodeId(1),
        term: TermId(3),
        log_term: TermId(2),
        index: 7,
        entries: vec![
            Entry {
                entry_type: EntryType::Normal,
                term: TermId(3),
                index: 8,
                data: b"foo".to_vec(),
            },
            Entry {
                entry_type: EntryType::ConfChange,
                term: TermId(3),
                index: 9,
                data: vec![],
            },
        ],
        commit: 6,
        snapshot: Some(Snapshot {
            data: vec![1, 2, 3],
            metadata: SnapshotMetadata {
                conf_state: ConfState {
                    nodes: vec![NodeId(1), NodeId(2)],
                },
                index: 5,
                term: TermId(2),
            },
        }),
        reject: true,
        reject_hint: 4,
    };

    let bytes = encode_message(&msg).expect("not local");
    assert_eq!(decode_message(&bytes).expect("valid"), msg);
    assert!(decode_message(&bytes[..bytes.len() - 1]).is_err());
}

#[test]
fn oversized_length_prefix_is_rejected() {
    // claims 4GiB of bytes, carries three
    let bytes = [0xff, 0xff, 0xff, 0xff, 1, 2, 3];
    let res = parse_bytes(&mut Cursor::new(bytes), Endian::Big, ());
    assert!(matches!(res, Err(binrw::Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof));

    // one put, with a column family name "of 4GiB"
    assert!(decode_batch(&[0, 0, 0, 1, 0, 0xff, 0xff, 0xff, 0xff, b'x']).is_err());
    // billions of modifications
    assert!(decode_batch(&[0xff, 0xff, 0xff, 0xff, 0]).is_err());

    let bytes = [0, 0, 0, 3, 1, 2, 3];
    let res = parse_bytes(&mut Cursor::new(bytes), Endian::Big, ());
    assert_eq!(res.expect("complete"), vec![1, 2, 3]);
}
