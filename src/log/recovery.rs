//! Recovery of unsealed log files: replays the record sequence, rebuilding
//! the stream table and FAT exactly as the writer built them, and truncates
//! everything from the first short or garbage record onward. Because commits
//! fsync after every record, at most the final record can be torn, and
//! truncation removes exactly that suffix.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::Result;
use crate::Error;

use super::action::{Action, Decoder, DecodedRecord, KIND_APPEND, KIND_DICT, KIND_MASK, KIND_POLLARD};
use super::CommitLog;

pub(crate) fn recover(path: &Path) -> Result<CommitLog> {
    let file_size = std::fs::metadata(path)?.len();
    let file = File::options().read(true).write(true).open(path)?;
    let mut log = CommitLog::attach(file, path, 0)?;

    let mut records = 0u64;
    {
        let mut decoder = Decoder::new(BufReader::new(log.file.try_clone()?));
        while log.size < file_size {
            let flag = match decoder.peek_flag()? {
                Some(flag) => flag,
                None => break,
            };
            match flag & KIND_MASK {
                KIND_APPEND | KIND_POLLARD => {
                    let record = match decoder.read_record(file_size - log.size) {
                        Ok(record) => record,
                        Err(_) => break,
                    };
                    if !admissible(&log, &record) {
                        break;
                    }
                    log.apply(&record.action, record.prefix_len);
                    log.size += record.len as u64;
                    records += 1;
                }
                KIND_DICT => {
                    debug!(path = %path.display(), records, "log is sealed");
                    return Err(Error::Finalized);
                }
                _ => break,
            }
        }
    }

    if log.size < file_size {
        warn!(
            path = %path.display(),
            good = log.size,
            dropped = file_size - log.size,
            "discarding torn log tail"
        );
        log.file.set_len(log.size)?;
    }
    // The decoder read ahead through a shared handle; put the append cursor
    // back at the end of the good records.
    log.writer.get_mut().seek(SeekFrom::Start(log.size))?;
    debug!(path = %path.display(), records, size = log.size, "recovered log");
    Ok(log)
}

/// A record the writer could never have produced stops replay: an inline
/// name for a known stream, or a pollard position that would disorder the
/// stream's offsets.
fn admissible(log: &CommitLog, record: &DecodedRecord) -> bool {
    if record.with_name && log.streams.contains_key(record.action.stream()) {
        return false;
    }
    if let Action::Pollard { pollard_pos, .. } = &record.action {
        return match log.streams.get(record.action.stream()) {
            Some(s) => *pollard_pos >= s.keep_offset && *pollard_pos <= s.end_offset(),
            None => *pollard_pos == record.action.offset(),
        };
    }
    true
}
