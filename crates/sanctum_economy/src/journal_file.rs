//! # Journal File
//!
//! Durable sink for committed journal entries.
//!
//! ## Format
//!
//! ```text
//! [4 bytes: magic "SJNL"]
//! [4 bytes: version]
//!
//! Record format:
//! [8 bytes: entry id]
//! [4 bytes: payload length]
//! [N bytes: payload (JSON-encoded JournalEntry)]
//! [4 bytes: CRC32 of above]
//! ```
//!
//! ## Recovery
//!
//! Opening replays every intact record. Replay stops at the first torn or
//! corrupt record and the file is truncated there, so later appends never
//! land behind garbage.
//!
//! A failed append is rolled back the same way: buffered bytes are dropped
//! and the file is cut back to the last synced length.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{EconomyError, EconomyResult};
use crate::journal::JournalEntry;

/// Magic bytes identifying a journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"SJNL";

/// Current format version.
const JOURNAL_VERSION: u32 = 1;

const HEADER_LEN: usize = 8;

fn storage(context: &str, e: impl std::fmt::Display) -> EconomyError {
    EconomyError::Storage(format!("{context}: {e}"))
}

/// Append-only journal file.
pub struct JournalFile {
    path: PathBuf,
    /// `None` after a rollback that could not reopen the file.
    writer: Option<BufWriter<File>>,
    /// Length of the synced prefix.
    synced_len: u64,
}

impl JournalFile {
    /// Opens or creates a journal file and replays its intact records.
    ///
    /// # Errors
    ///
    /// `Storage` on I/O failure, bad magic or unsupported version.
    pub fn open(path: impl AsRef<Path>) -> EconomyResult<(Self, Vec<JournalEntry>)> {
        let path = path.as_ref().to_path_buf();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(storage("failed to read journal", e)),
        };

        let (entries, good_len) = if bytes.is_empty() {
            (Vec::new(), 0)
        } else {
            Self::replay(&bytes)?
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| storage("failed to open journal", e))?;

        if good_len < bytes.len() {
            warn!(
                path = %path.display(),
                dropped_bytes = bytes.len() - good_len,
                "journal ends in a torn or corrupt record; truncating"
            );
            file.set_len(good_len as u64)
                .map_err(|e| storage("failed to truncate journal", e))?;
        }

        let mut writer = BufWriter::new(file);
        if good_len == 0 {
            writer
                .write_all(JOURNAL_MAGIC)
                .and_then(|()| writer.write_all(&JOURNAL_VERSION.to_le_bytes()))
                .and_then(|()| writer.flush())
                .map_err(|e| storage("failed to write journal header", e))?;
        }

        let synced_len = good_len.max(HEADER_LEN) as u64;
        debug!(path = %path.display(), replayed = entries.len(), "journal file opened");
        Ok((
            Self {
                path,
                writer: Some(writer),
                synced_len,
            },
            entries,
        ))
    }

    /// Parses the header and records. Returns the entries and the length of
    /// the intact prefix.
    fn replay(bytes: &[u8]) -> EconomyResult<(Vec<JournalEntry>, usize)> {
        if bytes.len() < HEADER_LEN {
            // Torn header: start over.
            return Ok((Vec::new(), 0));
        }
        if &bytes[0..4] != JOURNAL_MAGIC {
            return Err(EconomyError::Storage("invalid journal magic".to_string()));
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != JOURNAL_VERSION {
            return Err(EconomyError::Storage(format!(
                "unsupported journal version: {version}"
            )));
        }

        let mut entries = Vec::new();
        let mut offset = HEADER_LEN;
        while let Some((entry, next)) = Self::read_record(bytes, offset) {
            entries.push(entry);
            offset = next;
        }
        Ok((entries, offset))
    }

    fn read_record(bytes: &[u8], offset: usize) -> Option<(JournalEntry, usize)> {
        let id_bytes: [u8; 8] = bytes.get(offset..offset + 8)?.try_into().ok()?;
        let len_bytes: [u8; 4] = bytes.get(offset + 8..offset + 12)?.try_into().ok()?;
        let payload_len = u32::from_le_bytes(len_bytes) as usize;
        let payload_start = offset + 12;
        let payload = bytes.get(payload_start..payload_start + payload_len)?;
        let crc_start = payload_start + payload_len;
        let crc_bytes: [u8; 4] = bytes.get(crc_start..crc_start + 4)?.try_into().ok()?;

        let stored_crc = u32::from_le_bytes(crc_bytes);
        if stored_crc != crc32fast::hash(&bytes[offset..crc_start]) {
            return None;
        }

        let entry: JournalEntry = serde_json::from_slice(payload).ok()?;
        if entry.id.0 != u64::from_le_bytes(id_bytes) {
            return None;
        }
        Some((entry, crc_start + 4))
    }

    fn encode(entry: &JournalEntry) -> EconomyResult<Vec<u8>> {
        let payload = serde_json::to_vec(entry).map_err(|e| storage("failed to encode entry", e))?;
        let payload_len =
            u32::try_from(payload.len()).map_err(|_| EconomyError::Storage("entry too large".to_string()))?;

        let mut record = Vec::with_capacity(8 + 4 + payload.len() + 4);
        record.extend_from_slice(&entry.id.0.to_le_bytes());
        record.extend_from_slice(&payload_len.to_le_bytes());
        record.extend_from_slice(&payload);
        let crc = crc32fast::hash(&record);
        record.extend_from_slice(&crc.to_le_bytes());
        Ok(record)
    }

    /// Appends entries and syncs them to disk.
    ///
    /// Either every record is synced or the file is left exactly as it was.
    ///
    /// # Errors
    ///
    /// `Storage` on encode or I/O failure.
    pub fn append(&mut self, entries: &[JournalEntry]) -> EconomyResult<()> {
        let mut batch = Vec::new();
        for entry in entries {
            batch.extend_from_slice(&Self::encode(entry)?);
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| EconomyError::Storage("journal closed after a failed rollback".to_string()))?;

        match Self::write_synced(writer, &batch) {
            Ok(()) => {
                self.synced_len += batch.len() as u64;
                Ok(())
            }
            Err(err) => {
                self.discard_unsynced()?;
                Err(err)
            }
        }
    }

    fn write_synced(writer: &mut BufWriter<File>, bytes: &[u8]) -> EconomyResult<()> {
        writer
            .write_all(bytes)
            .map_err(|e| storage("journal write failed", e))?;
        writer.flush().map_err(|e| storage("journal flush failed", e))?;
        writer
            .get_ref()
            .sync_data()
            .map_err(|e| storage("journal sync failed", e))
    }

    /// Drops buffered bytes and truncates the file to the synced prefix.
    fn discard_unsynced(&mut self) -> EconomyResult<()> {
        if let Some(stale) = self.writer.take() {
            // into_parts hands back the unflushed buffer instead of writing it.
            let (_file, _rejected) = stale.into_parts();
        }
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .and_then(|file| file.set_len(self.synced_len).map(|()| file))
            .map_err(|e| storage("journal rollback failed", e))?;
        warn!(path = %self.path.display(), synced_len = self.synced_len, "journal append rolled back");
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    /// Rewrites the file so it holds exactly `entries`.
    ///
    /// Writes a sibling temp file and renames it over the journal.
    ///
    /// # Errors
    ///
    /// `Storage` on I/O failure. The old file is left intact on failure.
    pub fn compact(&mut self, entries: &[JournalEntry]) -> EconomyResult<()> {
        let tmp = self.path.with_extension("compact");
        let mut compacted_len = HEADER_LEN as u64;
        {
            let file = File::create(&tmp).map_err(|e| storage("failed to create compact file", e))?;
            let mut out = BufWriter::new(file);
            out.write_all(JOURNAL_MAGIC)
                .and_then(|()| out.write_all(&JOURNAL_VERSION.to_le_bytes()))
                .map_err(|e| storage("compact write failed", e))?;
            for entry in entries {
                let record = Self::encode(entry)?;
                out.write_all(&record)
                    .map_err(|e| storage("compact write failed", e))?;
                compacted_len += record.len() as u64;
            }
            out.flush().map_err(|e| storage("compact flush failed", e))?;
            out.get_ref()
                .sync_all()
                .map_err(|e| storage("compact sync failed", e))?;
        }

        fs::rename(&tmp, &self.path).map_err(|e| storage("failed to replace journal", e))?;
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| storage("failed to reopen journal", e))?;
        self.writer = Some(BufWriter::new(file));
        self.synced_len = compacted_len;
        debug!(path = %self.path.display(), kept = entries.len(), "journal compacted");
        Ok(())
    }

    /// Path on disk.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::PlayerId;
    use crate::journal::{EntryId, JournalKind};
    use std::collections::BTreeMap;
    use std::time::SystemTime;

    fn temp_journal_path() -> PathBuf {
        let id = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("test_journal_{id}.sjnl"))
    }

    fn entry(id: u64) -> JournalEntry {
        JournalEntry {
            id: EntryId(id),
            player: PlayerId(1),
            kind: JournalKind::Grant,
            deltas: BTreeMap::new(),
            context: serde_json::json!({ "n": id }),
            created_at: SystemTime::now(),
        }
    }

    #[test]
    fn test_reopen_replays_entries() {
        let path = temp_journal_path();
        {
            let (mut file, replayed) = JournalFile::open(&path).unwrap();
            assert!(replayed.is_empty());
            file.append(&[entry(1), entry(2)]).unwrap();
        }
        {
            let (_file, replayed) = JournalFile::open(&path).unwrap();
            let ids: Vec<u64> = replayed.iter().map(|e| e.id.0).collect();
            assert_eq!(ids, vec![1, 2]);
        }
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let path = temp_journal_path();
        {
            let (mut file, _) = JournalFile::open(&path).unwrap();
            file.append(&[entry(1), entry(2)]).unwrap();
        }
        // Chop the last record in half.
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 6)
            .unwrap();

        {
            let (mut file, replayed) = JournalFile::open(&path).unwrap();
            assert_eq!(replayed.len(), 1);
            file.append(&[entry(3)]).unwrap();
        }
        let (_file, replayed) = JournalFile::open(&path).unwrap();
        let ids: Vec<u64> = replayed.iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![1, 3]);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_compact_keeps_only_given_entries() {
        let path = temp_journal_path();
        let (mut file, _) = JournalFile::open(&path).unwrap();
        file.append(&[entry(1), entry(2), entry(3)]).unwrap();
        file.compact(&[entry(3)]).unwrap();
        file.append(&[entry(4)]).unwrap();
        drop(file);

        let (_file, replayed) = JournalFile::open(&path).unwrap();
        let ids: Vec<u64> = replayed.iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![3, 4]);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_failed_append_leaves_no_trace() {
        let path = temp_journal_path();
        let (mut file, _) = JournalFile::open(&path).unwrap();
        file.append(&[entry(1)]).unwrap();
        let synced = fs::metadata(&path).unwrap().len();
        let mut rejected = entry(2);
        rejected.context = serde_json::json!({ "rolled_back": true });

        // Half a record already reached the disk before the failure.
        OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(&JournalFile::encode(&rejected).unwrap()[..10])
            .unwrap();
        // A read-only handle makes the flush fail with the record still buffered.
        file.writer = Some(BufWriter::new(File::open(&path).unwrap()));
        let err = file.append(&[rejected]).unwrap_err();
        assert!(matches!(err, EconomyError::Storage(_)));
        assert_eq!(fs::metadata(&path).unwrap().len(), synced);

        // The id is reused by the next commit; replay must see it once.
        file.append(&[entry(2)]).unwrap();
        drop(file);
        let (_file, replayed) = JournalFile::open(&path).unwrap();
        let ids: Vec<u64> = replayed.iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(replayed[1].context, serde_json::json!({ "n": 2 }));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_bad_magic_rejected() {
        let path = temp_journal_path();
        fs::write(&path, b"NOPE\x01\x00\x00\x00").unwrap();
        assert!(matches!(JournalFile::open(&path), Err(EconomyError::Storage(_))));
        fs::remove_file(&path).ok();
    }
}
