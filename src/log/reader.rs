//! Read-only access to sealed log files. The reader loads the dictionary
//! trailer into memory once and serves every lookup by walking the flat
//! binary search tree directly in those bytes; stream payloads stay on disk
//! and are fetched with positioned reads.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Result;
use crate::span::Span;
use crate::{errcorrupt, errinput, Error};

use super::action::KIND_DICT;
use super::dict::{MAGIC, TRAILER_LEN};
use super::read_exact_at;

/// One live extent of a sealed stream: file position and byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    pub pos: u32,
    pub length: u32,
}

/// A stream's dictionary entry: its live range and the pieces holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictEntry {
    pub span: Span,
    pub pieces: Vec<Piece>,
}

/// A sealed log file. Construction is cheap; `open` performs the trailer
/// discovery and dictionary load.
pub struct LogReader {
    path: PathBuf,
    file: Option<File>,
    dict: Vec<u8>,
}

impl std::fmt::Debug for LogReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogReader")
            .field("path", &self.path)
            .field("open", &self.file.is_some())
            .finish()
    }
}

impl LogReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            dict: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Verifies the trailer magic and loads the dictionary into memory.
    pub fn open(&mut self) -> Result<()> {
        let mut file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        if len < TRAILER_LEN as u64 {
            return errcorrupt!("file too short for a dictionary trailer");
        }

        file.seek(SeekFrom::End(-(TRAILER_LEN as i64)))?;
        let mut trailer = [0u8; TRAILER_LEN];
        file.read_exact(&mut trailer)?;
        if trailer[8..] != MAGIC {
            return errcorrupt!("dictionary trailer magic mismatch");
        }

        let body_len = LittleEndian::read_u64(&trailer[..8]);
        if body_len == 0 || body_len + TRAILER_LEN as u64 > len {
            return errcorrupt!("dictionary length {body_len} does not fit file of {len} bytes");
        }

        file.seek(SeekFrom::End(-((TRAILER_LEN as u64 + body_len) as i64)))?;
        let mut dict = vec![0u8; body_len as usize];
        file.read_exact(&mut dict)?;
        if dict[0] != KIND_DICT {
            return errcorrupt!("dictionary does not start with the dict record flag");
        }

        self.dict = dict;
        self.file = Some(file);
        Ok(())
    }

    pub fn close(&mut self) {
        self.file = None;
        self.dict.clear();
    }

    /// Looks up a stream in the dictionary, walking the flat binary search
    /// tree with unsigned byte comparisons.
    pub fn search(&self, stream: &[u8]) -> Result<DictEntry> {
        if self.file.is_none() {
            return errinput!("log reader is not open");
        }
        let dict = self.dict.as_slice();
        if dict.len() <= 1 {
            // A sealed log with no streams carries only the flag byte.
            return Err(Error::NotFound);
        }

        let mut pos: usize = 1;
        let mut steps = 0usize;
        let entry_pos = loop {
            // Each node is at least a header long; more hops than bytes
            // means the child offsets form a cycle.
            steps += 1;
            if steps > dict.len() {
                return errcorrupt!("dictionary child offsets form a cycle");
            }

            let name_start = pos + 8;
            let mut next = None;
            let mut matched = true;
            for (i, &want) in stream.iter().enumerate() {
                let have = byte_at(dict, name_start + i)?;
                if have < want {
                    next = Some(read_u32(dict, pos + 4)?); // right subtree
                    matched = false;
                    break;
                } else if have > want {
                    next = Some(read_u32(dict, pos)?); // left subtree
                    matched = false;
                    break;
                }
            }
            if matched {
                if byte_at(dict, name_start + stream.len())? == 0 {
                    break name_start + stream.len() + 1;
                }
                // The node's name extends past ours, so ours sorts first.
                next = Some(read_u32(dict, pos)?);
            }
            match next {
                None | Some(0) => return Err(Error::NotFound),
                Some(p) => pos = p as usize,
            }
        };

        let keep = read_u64(dict, entry_pos)?;
        let end = read_u64(dict, entry_pos + 8)?;
        let count = read_u16(dict, entry_pos + 16)? as usize;

        let mut pos = entry_pos + 18;
        let mut pieces = Vec::with_capacity(count);
        for _ in 0..count {
            pieces.push(Piece {
                pos: read_u32(dict, pos)?,
                length: read_u32(dict, pos + 4)?,
            });
            pos += 8;
        }

        Ok(DictEntry {
            span: Span::new(keep, end),
            pieces,
        })
    }

    /// Fills `buf` with stream bytes starting at `offset`, which must lie
    /// within the entry's span together with the full requested range.
    pub fn read(&self, entry: &DictEntry, offset: u64, buf: &mut [u8]) -> Result<()> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| Error::InvalidInput("log reader is not open".into()))?;
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| Error::InvalidInput("read range overflows".into()))?;
        if offset < entry.span.from || end > entry.span.to {
            return errinput!(
                "read [{offset}, {end}) outside span [{}, {})",
                entry.span.from,
                entry.span.to
            );
        }
        if buf.is_empty() {
            return Ok(());
        }

        let mut eoffset = entry.span.from;
        let mut index = 0;
        loop {
            let piece = piece_at(entry, index)?;
            if offset < eoffset + piece.length as u64 {
                break;
            }
            eoffset += piece.length as u64;
            index += 1;
        }

        let mut offset = offset;
        let mut done = 0;
        while done < buf.len() {
            let piece = piece_at(entry, index)?;
            let pos_offset = offset - eoffset;
            let avail = piece.length as u64 - pos_offset;
            let count = avail.min((buf.len() - done) as u64) as usize;
            read_exact_at(
                file,
                &mut buf[done..done + count],
                piece.pos as u64 + pos_offset,
            )?;
            done += count;
            offset += count as u64;
            eoffset += piece.length as u64;
            index += 1;
        }
        Ok(())
    }
}

fn byte_at(dict: &[u8], pos: usize) -> Result<u8> {
    dict.get(pos)
        .copied()
        .ok_or_else(|| Error::Corruption(format!("dictionary offset {pos} out of range")))
}

fn read_u16(dict: &[u8], pos: usize) -> Result<u16> {
    dict.get(pos..pos + 2)
        .map(LittleEndian::read_u16)
        .ok_or_else(|| Error::Corruption(format!("dictionary offset {pos} out of range")))
}

fn read_u32(dict: &[u8], pos: usize) -> Result<u32> {
    dict.get(pos..pos + 4)
        .map(LittleEndian::read_u32)
        .ok_or_else(|| Error::Corruption(format!("dictionary offset {pos} out of range")))
}

fn read_u64(dict: &[u8], pos: usize) -> Result<u64> {
    dict.get(pos..pos + 8)
        .map(LittleEndian::read_u64)
        .ok_or_else(|| Error::Corruption(format!("dictionary offset {pos} out of range")))
}

fn piece_at(entry: &DictEntry, index: usize) -> Result<Piece> {
    entry.pieces.get(index).copied().ok_or_else(|| {
        Error::Corruption("piece list exhausted before covering the span".into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::action::Action;
    use crate::log::CommitLog;
    use tempfile::TempDir;

    fn append(stream: &[u8], offset: u64, data: &[u8]) -> Action {
        Action::Append {
            stream: stream.to_vec(),
            offset,
            data: data.to_vec(),
        }
    }

    fn pollard(stream: &[u8], offset: u64, pollard_pos: u64) -> Action {
        Action::Pollard {
            stream: stream.to_vec(),
            offset,
            pollard_pos,
        }
    }

    #[test]
    fn test_sealed_roundtrip_with_pollard() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("commit_0000.log");

        let mut log = CommitLog::create(&path).expect("create failed");
        log.commit(&append(b"s1", 0, b"Hello World")).expect("commit failed");
        log.commit(&append(b"s1", 11, b"!Great!")).expect("commit failed");
        log.commit(&pollard(b"s1", 18, 6)).expect("commit failed");
        log.finalize().expect("finalize failed");

        let mut reader = LogReader::new(&path);
        reader.open().expect("open failed");

        let entry = reader.search(b"s1").expect("search failed");
        assert_eq!(entry.span, Span::new(6, 18));

        let mut buf = [0u8; 6];
        reader.read(&entry, 7, &mut buf).expect("read failed");
        assert_eq!(&buf, b"orld!G");

        let mut buf = [0u8; 12];
        reader.read(&entry, 6, &mut buf).expect("read failed");
        assert_eq!(&buf, b"World!Great!");
    }

    #[test]
    fn test_search_finds_all_streams() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("commit_0000.log");

        let mut log = CommitLog::create(&path).expect("create failed");
        log.commit(&append(b"s1", 0, b"Hello World")).expect("commit failed");
        log.commit(&append(b"a1", 0, b"This is A")).expect("commit failed");
        log.commit(&append(b"b1", 0, b"This is B")).expect("commit failed");
        log.commit(&pollard(b"s1", 11, 6)).expect("commit failed");
        log.finalize().expect("finalize failed");

        let mut reader = LogReader::new(&path);
        reader.open().expect("open failed");

        // The pollarded stream's first piece starts at the adjusted position.
        let entry = reader.search(b"s1").expect("search failed");
        assert_eq!(entry.span, Span::new(6, 11));
        assert_eq!(entry.pieces.len(), 1);
        let mut buf = [0u8; 5];
        reader.read(&entry, 6, &mut buf).expect("read failed");
        assert_eq!(&buf, b"World");

        // The untouched streams read back in full.
        for (name, want) in [(b"a1", b"This is A"), (b"b1", b"This is B")] {
            let entry = reader.search(name).expect("search failed");
            assert_eq!(entry.span, Span::new(0, 9));
            let mut buf = [0u8; 9];
            reader.read(&entry, 0, &mut buf).expect("read failed");
            assert_eq!(&buf, want);
        }

        assert_eq!(reader.search(b"c1"), Err(Error::NotFound));
        assert_eq!(reader.search(b"s"), Err(Error::NotFound));
        assert_eq!(reader.search(b"s11"), Err(Error::NotFound));
    }

    #[test]
    fn test_search_many_streams() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("commit_0000.log");

        let mut log = CommitLog::create(&path).expect("create failed");
        for i in 0..100u32 {
            let name = format!("stream_{i:03}");
            let data = format!("payload {i}");
            log.commit(&append(name.as_bytes(), 0, data.as_bytes()))
                .expect("commit failed");
        }
        log.finalize().expect("finalize failed");

        let mut reader = LogReader::new(&path);
        reader.open().expect("open failed");

        for i in 0..100u32 {
            let name = format!("stream_{i:03}");
            let want = format!("payload {i}");
            let entry = reader.search(name.as_bytes()).expect("search failed");
            assert_eq!(entry.span, Span::new(0, want.len() as u64));
            let mut buf = vec![0u8; want.len()];
            reader.read(&entry, 0, &mut buf).expect("read failed");
            assert_eq!(buf, want.as_bytes());
        }
    }

    #[test]
    fn test_empty_sealed_log() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("commit_0000.log");

        let mut log = CommitLog::create(&path).expect("create failed");
        log.finalize().expect("finalize failed");

        let mut reader = LogReader::new(&path);
        reader.open().expect("open failed");
        assert_eq!(reader.search(b"s1"), Err(Error::NotFound));
    }

    #[test]
    #[cfg(unix)]
    fn test_open_rejects_bad_magic() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("commit_0000.log");

        let mut log = CommitLog::create(&path).expect("create failed");
        log.commit(&append(b"s1", 0, b"Hello")).expect("commit failed");
        log.finalize().expect("finalize failed");

        // Flip one magic byte.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = File::options().write(true).open(&path).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            file.write_at(&[0x00], len - 1).unwrap();
        }
        drop(file);

        let mut reader = LogReader::new(&path);
        assert!(matches!(reader.open(), Err(Error::Corruption(_))));
        assert!(!reader.is_open());
    }

    #[test]
    fn test_open_rejects_unsealed_log() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("commit_0000.log");

        let mut log = CommitLog::create(&path).expect("create failed");
        log.commit(&append(b"s1", 0, b"Hello World and more bytes"))
            .expect("commit failed");
        log.close().expect("close failed");

        let mut reader = LogReader::new(&path);
        assert!(matches!(reader.open(), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_read_outside_span_is_rejected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("commit_0000.log");

        let mut log = CommitLog::create(&path).expect("create failed");
        log.commit(&append(b"s1", 0, b"Hello")).expect("commit failed");
        log.commit(&pollard(b"s1", 5, 2)).expect("commit failed");
        log.finalize().expect("finalize failed");

        let mut reader = LogReader::new(&path);
        reader.open().expect("open failed");
        let entry = reader.search(b"s1").expect("search failed");

        let mut buf = [0u8; 1];
        assert!(matches!(
            reader.read(&entry, 0, &mut buf),
            Err(Error::InvalidInput(_))
        ));
        let mut buf = [0u8; 4];
        assert!(matches!(
            reader.read(&entry, 2, &mut buf),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_unopened_reader_rejects_use() {
        let reader = LogReader::new("/nonexistent/commit_0000.log");
        assert!(matches!(reader.search(b"s1"), Err(Error::InvalidInput(_))));
    }
}
