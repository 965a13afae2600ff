//! Bit-exact codec for the three record kinds a log file contains: appends,
//! pollards, and the sealing dictionary. All integers are little-endian.
//!
//! Every append and pollard record starts with a stream reference: the first
//! record naming a stream carries the name inline (NUL-terminated) together
//! with the stream's base offset, and assigns the stream the next 16-bit
//! ordinal; later records reference the ordinal instead.
//!
//! ```text
//! first mention:  [flag|WITH_NAME:1][baseOffset:u64][name...][0x00]
//! back-reference: [flag:1][ordinal:u16]
//! append:         <stream ref> [dataLen:u32] [data...]
//! pollard:        <stream ref> [pollardPos:u64]
//! ```

use std::io::BufRead;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::{errcorrupt, errinput, Error};

/// Payload-layer end-of-record marker. Carried through the log untouched;
/// the log itself never sets or interprets it.
pub const END_OF_RECORD: u8 = 1 << 0;
/// The record introduces its stream by inline name instead of ordinal.
pub const WITH_NAME: u8 = 1 << 1;
/// Isolates the record kind from the flag byte.
pub const KIND_MASK: u8 = 0xfc;
pub const KIND_APPEND: u8 = 4;
pub const KIND_POLLARD: u8 = 8;
pub const KIND_DICT: u8 = 12;

/// A committed mutation of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Extends a stream with payload bytes. `offset` is the stream offset of
    /// the first appended byte; the log stores it only at the stream's first
    /// mention, where it fixes the stream's base offset.
    Append {
        stream: Vec<u8>,
        offset: u64,
        data: Vec<u8>,
    },
    /// Drops the stream prefix below `pollard_pos`. `offset` mirrors the
    /// stream end at submission time and is write-only on disk.
    Pollard {
        stream: Vec<u8>,
        offset: u64,
        pollard_pos: u64,
    },
}

impl Action {
    pub fn stream(&self) -> &[u8] {
        match self {
            Action::Append { stream, .. } => stream,
            Action::Pollard { stream, .. } => stream,
        }
    }

    pub fn offset(&self) -> u64 {
        match self {
            Action::Append { offset, .. } => *offset,
            Action::Pollard { offset, .. } => *offset,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            Action::Append { .. } => KIND_APPEND,
            Action::Pollard { .. } => KIND_POLLARD,
        }
    }
}

/// A record serialized against the log's current stream table, before any
/// in-memory state is touched.
pub(crate) struct EncodedRecord {
    pub bytes: Vec<u8>,
    /// Byte count of the record prefix: everything before an append's
    /// payload (the whole record for a pollard). The payload therefore lands
    /// at file position `log size + prefix_len`.
    pub prefix_len: usize,
}

/// Serializes `action` into record bytes. `known` carries the stream's
/// ordinal when the log has seen it before; `None` emits the inline-name
/// form. Pure: the caller applies the matching state mutations only after
/// the bytes are durable.
pub(crate) fn encode(action: &Action, known: Option<u16>) -> Result<EncodedRecord> {
    let stream = action.stream();
    if stream.is_empty() || stream.contains(&0) {
        return errinput!("stream name must be non-empty and free of zero bytes");
    }

    let mut buf = Vec::with_capacity(16 + stream.len());
    match known {
        Some(number) => {
            buf.write_u8(action.kind())?;
            buf.write_u16::<LittleEndian>(number)?;
        }
        None => {
            buf.write_u8(action.kind() | WITH_NAME)?;
            buf.write_u64::<LittleEndian>(action.offset())?;
            buf.extend_from_slice(stream);
            buf.write_u8(0)?;
        }
    }

    match action {
        Action::Append { data, .. } => {
            let len = u32::try_from(data.len())
                .map_err(|_| Error::InvalidInput("append payload exceeds 4 GiB".into()))?;
            buf.write_u32::<LittleEndian>(len)?;
            let prefix_len = buf.len();
            buf.extend_from_slice(data);
            Ok(EncodedRecord {
                bytes: buf,
                prefix_len,
            })
        }
        Action::Pollard { pollard_pos, .. } => {
            buf.write_u64::<LittleEndian>(*pollard_pos)?;
            let prefix_len = buf.len();
            Ok(EncodedRecord {
                bytes: buf,
                prefix_len,
            })
        }
    }
}

/// A record decoded during recovery.
pub(crate) struct DecodedRecord {
    pub action: Action,
    /// Whether the record carried its stream name inline.
    pub with_name: bool,
    /// Total encoded byte count.
    pub len: usize,
    /// Bytes preceding an append payload; equals `len` for pollards.
    pub prefix_len: usize,
}

/// Streaming record decoder. Tracks the ordinal table so back-references
/// resolve to names in the writer's assignment order.
pub(crate) struct Decoder<R: BufRead> {
    reader: R,
    names: Vec<Vec<u8>>,
}

impl<R: BufRead> Decoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            names: Vec::new(),
        }
    }

    /// Returns the next flag byte without consuming it, or None at EOF.
    pub fn peek_flag(&mut self) -> Result<Option<u8>> {
        Ok(self.reader.fill_buf()?.first().copied())
    }

    /// Decodes one append or pollard record. `remaining` bounds the record
    /// against the unread file tail so a torn length field cannot demand
    /// more bytes than the file holds.
    pub fn read_record(&mut self, remaining: u64) -> Result<DecodedRecord> {
        let flag = self.reader.read_u8()?;
        let mut n = 1usize;

        let with_name = flag & WITH_NAME != 0;
        let (stream, offset) = if with_name {
            let offset = self.reader.read_u64::<LittleEndian>()?;
            n += 8;
            let mut name = Vec::new();
            let read = self.reader.read_until(0, &mut name)?;
            if read == 0 || name.last() != Some(&0) {
                return errcorrupt!("unterminated stream name");
            }
            name.pop();
            if name.is_empty() {
                return errcorrupt!("empty stream name");
            }
            n += read;
            self.names.push(name.clone());
            (name, offset)
        } else {
            let number = self.reader.read_u16::<LittleEndian>()?;
            n += 2;
            let name = self
                .names
                .get(number as usize)
                .ok_or_else(|| Error::Corruption(format!("stream ordinal {number} out of range")))?
                .clone();
            (name, 0)
        };

        match flag & KIND_MASK {
            KIND_APPEND => {
                let len = self.reader.read_u32::<LittleEndian>()? as usize;
                n += 4;
                let prefix_len = n;
                if n as u64 + len as u64 > remaining {
                    return errcorrupt!("append record overruns the file tail");
                }
                let mut data = vec![0u8; len];
                self.reader.read_exact(&mut data)?;
                n += len;
                Ok(DecodedRecord {
                    action: Action::Append {
                        stream,
                        offset,
                        data,
                    },
                    with_name,
                    len: n,
                    prefix_len,
                })
            }
            KIND_POLLARD => {
                let pollard_pos = self.reader.read_u64::<LittleEndian>()?;
                n += 8;
                Ok(DecodedRecord {
                    action: Action::Pollard {
                        stream,
                        offset,
                        pollard_pos,
                    },
                    with_name,
                    len: n,
                    prefix_len: n,
                })
            }
            kind => errcorrupt!("unexpected record kind {kind:#04x}"),
        }
    }
}
