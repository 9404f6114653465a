//! Single-file durable journal.
//!
//! Append-only batches, one per transaction: `[len][crc32c][body]` where
//! the body holds the whole commit. A torn tail (crash mid-write) is
//! detected by length/checksum and truncated away on open, so a commit is
//! either fully durable or gone. fsync after every commit.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::{Buf, BufMut, Bytes};

use crate::core::{Fingerprint, HybridTimestamp, Layout, decode_frame_header};

use super::{
    EntityKind, EntryFilter, Journal, JournalEntry, JournalError, JournalTx, gate_append,
    seed_fingerprint,
};

const MAGIC: &[u8; 4] = b"EVJR";
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 8;
const BATCH_PREFIX_LEN: usize = 8;

#[derive(Debug)]
struct FileState {
    file: File,
    good_len: u64,
    entries: Vec<JournalEntry>,
    introduced: HashSet<Fingerprint>,
    announced: HashSet<Fingerprint>,
    max_at: Option<HybridTimestamp>,
}

/// Durable journal backed by one append-only file.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    inner: Mutex<FileState>,
}

impl FileJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();

        if len == 0 {
            file.write_all(MAGIC)?;
            file.write_all(&VERSION.to_be_bytes())?;
            file.sync_all()?;
        } else {
            if len < HEADER_LEN {
                return Err(JournalError::Corrupt {
                    reason: "file shorter than header".into(),
                });
            }
            let mut header = [0u8; 8];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            if &header[..4] != MAGIC {
                return Err(JournalError::Corrupt {
                    reason: "bad magic".into(),
                });
            }
            let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
            if version != VERSION {
                return Err(JournalError::VersionMismatch {
                    expected: VERSION,
                    got: version,
                });
            }
        }

        let mut introduced = HashSet::new();
        introduced.insert(seed_fingerprint());
        let mut state = FileState {
            file,
            good_len: HEADER_LEN,
            entries: Vec::new(),
            introduced,
            announced: HashSet::new(),
            max_at: None,
        };
        Self::replay(&mut state, &path)?;

        Ok(Self {
            path,
            inner: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replay(state: &mut FileState, path: &Path) -> Result<(), JournalError> {
        let data = fs::read(path)?;
        let mut offset = HEADER_LEN as usize;
        while offset < data.len() {
            let rest = &data[offset..];
            let Some(batch) = parse_batch(rest) else {
                let dropped = data.len() - offset;
                tracing::warn!(
                    path = %path.display(),
                    offset,
                    dropped_bytes = dropped,
                    "truncating torn journal tail"
                );
                state.file.set_len(offset as u64)?;
                state.file.sync_all()?;
                break;
            };
            let (entries, consumed) = batch;
            for entry in entries {
                apply_entry(state, entry);
            }
            offset += consumed;
        }
        state.good_len = offset as u64;
        Ok(())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FileState) -> T) -> T {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

fn apply_entry(state: &mut FileState, entry: JournalEntry) {
    if let Some(intro) = entry.introduced_layout() {
        state.introduced.insert(intro.fingerprint);
    }
    if state.max_at.as_ref().is_none_or(|max| entry.at > *max) {
        state.max_at = Some(entry.at.clone());
    }
    state.entries.push(entry);
}

/// Parse one batch from the head of `data`. `None` on a torn or corrupt
/// frame; `Some((entries, bytes_consumed))` on success.
fn parse_batch(data: &[u8]) -> Option<(Vec<JournalEntry>, usize)> {
    if data.len() < BATCH_PREFIX_LEN {
        return None;
    }
    let body_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let crc = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let total = BATCH_PREFIX_LEN.checked_add(body_len)?;
    if data.len() < total {
        return None;
    }
    let body = &data[BATCH_PREFIX_LEN..total];
    if crc32c::crc32c(body) != crc {
        return None;
    }

    let mut buf = body;
    if buf.remaining() < 4 {
        return None;
    }
    let count = buf.get_u32() as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.remaining() < 2 {
            return None;
        }
        let kind = match buf.get_u8() {
            0 => EntityKind::Command,
            1 => EntityKind::Event,
            _ => return None,
        };
        let cause = match buf.get_u8() {
            0 => None,
            1 => {
                if buf.remaining() < 16 {
                    return None;
                }
                let mut raw = [0u8; 16];
                buf.copy_to_slice(&mut raw);
                Some(crate::core::EntityId::from_bytes(raw))
            }
            _ => return None,
        };
        if buf.remaining() < 4 {
            return None;
        }
        let frame_len = buf.get_u32() as usize;
        if buf.remaining() < frame_len {
            return None;
        }
        let frame = Bytes::copy_from_slice(&buf[..frame_len]);
        buf.advance(frame_len);
        let (fingerprint, at, id) = decode_frame_header(&frame).ok()?;
        entries.push(JournalEntry {
            kind,
            fingerprint,
            id,
            at,
            cause,
            bytes: frame,
        });
    }
    if buf.has_remaining() {
        return None;
    }
    Some((entries, total))
}

fn serialize_batch(staged: &[JournalEntry]) -> Vec<u8> {
    let mut body = Vec::new();
    body.put_u32(staged.len() as u32);
    for entry in staged {
        body.put_u8(match entry.kind {
            EntityKind::Command => 0,
            EntityKind::Event => 1,
        });
        match &entry.cause {
            Some(cause) => {
                body.put_u8(1);
                body.put_slice(cause.as_bytes());
            }
            None => body.put_u8(0),
        }
        body.put_u32(entry.bytes.len() as u32);
        body.put_slice(&entry.bytes);
    }
    let mut out = Vec::with_capacity(BATCH_PREFIX_LEN + body.len());
    out.put_u32(body.len() as u32);
    out.put_u32(crc32c::crc32c(&body));
    out.extend_from_slice(&body);
    out
}

struct FileTx<'a> {
    journal: &'a FileJournal,
    staged: Vec<JournalEntry>,
    pending_intros: HashSet<Fingerprint>,
}

impl FileTx<'_> {
    fn stage(&mut self, kind: EntityKind, entry: JournalEntry) -> Result<(), JournalError> {
        debug_assert_eq!(entry.kind, kind);
        self.journal.with_state(|state| {
            gate_append(&state.introduced, &mut self.pending_intros, &entry)
        })?;
        self.staged.push(entry);
        Ok(())
    }
}

impl JournalTx for FileTx<'_> {
    fn append_command(&mut self, entry: JournalEntry) -> Result<(), JournalError> {
        self.stage(EntityKind::Command, entry)
    }

    fn append_event(&mut self, entry: JournalEntry) -> Result<(), JournalError> {
        self.stage(EntityKind::Event, entry)
    }

    fn commit(self: Box<Self>) -> Result<(), JournalError> {
        let FileTx {
            journal, staged, ..
        } = *self;
        if staged.is_empty() {
            return Ok(());
        }
        let batch = serialize_batch(&staged);
        journal.with_state(|state| {
            let good_len = state.good_len;
            let write = (|| -> std::io::Result<()> {
                state.file.seek(SeekFrom::Start(good_len))?;
                state.file.write_all(&batch)?;
                state.file.sync_all()?;
                Ok(())
            })();
            if let Err(err) = write {
                // Drop any partial write so the on-disk tail stays parseable.
                let _ = state.file.set_len(good_len);
                let _ = state.file.sync_all();
                return Err(JournalError::Io(err));
            }
            state.good_len += batch.len() as u64;
            for entry in staged {
                apply_entry(state, entry);
            }
            Ok(())
        })
    }

    fn abort(self: Box<Self>) {}
}

impl Journal for FileJournal {
    fn begin(&self) -> Result<Box<dyn JournalTx + '_>, JournalError> {
        Ok(Box::new(FileTx {
            journal: self,
            staged: Vec::new(),
            pending_intros: HashSet::new(),
        }))
    }

    fn on_commands_added(&self, layouts: &[std::sync::Arc<Layout>]) -> Result<(), JournalError> {
        self.with_state(|state| {
            state
                .announced
                .extend(layouts.iter().map(|l| l.fingerprint()));
        });
        Ok(())
    }

    fn on_events_added(&self, layouts: &[std::sync::Arc<Layout>]) -> Result<(), JournalError> {
        self.on_commands_added(layouts)
    }

    fn iter_entries(
        &self,
        filter: &EntryFilter,
    ) -> Result<Box<dyn Iterator<Item = JournalEntry> + Send>, JournalError> {
        let filter = filter.clone();
        let snapshot: Vec<JournalEntry> = self.with_state(|state| {
            state
                .entries
                .iter()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect()
        });
        Ok(Box::new(snapshot.into_iter()))
    }

    fn introduced_fingerprints(&self) -> Result<HashSet<Fingerprint>, JournalError> {
        Ok(self.with_state(|state| state.introduced.clone()))
    }

    fn latest_timestamp(&self) -> Result<Option<HybridTimestamp>, JournalError> {
        Ok(self.with_state(|state| state.max_at.clone()))
    }

    fn entry_count(&self) -> Result<usize, JournalError> {
        Ok(self.with_state(|state| state.entries.len()))
    }
}
