//! Sealing dictionary: a flat binary search tree serialized at the tail of
//! a finalized log, followed by a fixed 16-byte trailer.
//!
//! Nodes are laid out at their byte position within the dictionary body:
//!
//! ```text
//! [leftChild:u32] [rightChild:u32]   0 = no child
//! [streamName...] [0x00]
//! [keepOffset:u64] [endOffset:u64]
//! [pieceCount:u16] pieceCount x { [pos:u32] [length:u32] }
//! ```
//!
//! Child offsets are relative to the dictionary's leading flag byte, which
//! is itself part of the body: the root node sits at offset 1 and the
//! trailer's byte count includes the flag. The trailer closes with magic
//! bytes so a reader can discover the dictionary by seeking from the end.

use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::Result;
use crate::{errinput, Error};

use super::action::KIND_DICT;
use super::fat::{Fat, StreamLog};

/// Anchors the trailer for reverse-seek discovery.
pub(crate) const MAGIC: [u8; 8] = [42, 0, 42, 0, 42, 0xff, 42, 0xff];
/// Trailer byte count: u64 dictionary length plus the magic.
pub(crate) const TRAILER_LEN: usize = 16;

/// Serializes the dictionary for all streams: flag byte, tree, trailer.
pub(crate) fn encode(streams: &HashMap<Vec<u8>, StreamLog>, fat: &Fat) -> Result<Vec<u8>> {
    let mut entries: Vec<(&Vec<u8>, &StreamLog)> = streams.iter().collect();
    entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

    let mut buf = vec![KIND_DICT];
    write_subtree(&mut buf, &entries, fat)?;

    let body_len = buf.len() as u64;
    buf.write_u64::<LittleEndian>(body_len)?;
    buf.extend_from_slice(&MAGIC);
    Ok(buf)
}

/// Emits the subtree covering `entries` (sorted by name) by recursive median
/// split and returns the byte offset of its root node. Child offsets are
/// back-patched once each subtree has landed.
fn write_subtree(buf: &mut Vec<u8>, entries: &[(&Vec<u8>, &StreamLog)], fat: &Fat) -> Result<u32> {
    if entries.is_empty() {
        return Ok(0);
    }
    let middle = entries.len() / 2;
    let (name, stream) = entries[middle];

    let pos = buf.len();
    if pos > u32::MAX as usize {
        return errinput!("log too large to seal: dictionary offsets exceed 4 GiB");
    }
    buf.extend_from_slice(&[0u8; 8]);
    buf.extend_from_slice(name);
    buf.push(0);

    let pieces = fat.live_pieces(stream);
    buf.write_u64::<LittleEndian>(stream.keep_offset)?;
    buf.write_u64::<LittleEndian>(stream.end_offset())?;
    buf.write_u16::<LittleEndian>(pieces.len() as u16)?;
    for &(piece_pos, length) in &pieces {
        let piece_pos = u32::try_from(piece_pos).map_err(|_| {
            Error::InvalidInput("log too large to seal: extent position exceeds 4 GiB".into())
        })?;
        buf.write_u32::<LittleEndian>(piece_pos)?;
        buf.write_u32::<LittleEndian>(length)?;
    }

    if middle > 0 {
        let left = write_subtree(buf, &entries[..middle], fat)?;
        LittleEndian::write_u32(&mut buf[pos..pos + 4], left);
    }
    if middle + 1 != entries.len() {
        let right = write_subtree(buf, &entries[middle + 1..], fat)?;
        LittleEndian::write_u32(&mut buf[pos + 4..pos + 8], right);
    }
    Ok(pos as u32)
}
