//! Record store: per-peer, append-only JSON-lines history with size rotation.
//!
//! Layout under the store root:
//!
//! ```text
//! AA_BB_CC_DD_EE_FF/
//!     peer.json            last known display name (display cache only)
//!     records-1.jsonl      one record per line, bounded by the ceiling
//!     records-2.jsonl
//!     files/               payloads of sent and received files
//! ```

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use lanchat_core::PeerKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;

const PEER_META_FILE: &str = "peer.json";
const RECORD_PREFIX: &str = "records-";
const RECORD_EXT: &str = ".jsonl";
const FILES_DIR: &str = "files";

/// One durable history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Unix millis.
    pub timestamp: u64,
    pub sent: bool,
    /// Display name of the author when the record was written.
    pub sender_name: String,
    #[serde(flatten)]
    pub body: RecordBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordBody {
    Text { content: String },
    File { filename: String, path: PathBuf },
}

#[derive(Debug, Serialize, Deserialize)]
struct PeerMeta {
    mac: PeerKey,
    last_known_name: String,
}

/// Who and when, for one append.
#[derive(Debug, Clone, Copy)]
pub struct RecordContext<'a> {
    pub peer: &'a PeerKey,
    /// Peer's current display name, cached in `peer.json`.
    pub peer_name: &'a str,
    pub sender_name: &'a str,
    pub sent: bool,
    pub timestamp: u64,
}

/// Counts returned by [`RecordStore::purge_older_than`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub records_removed: usize,
    pub files_removed: usize,
}

pub struct RecordStore {
    root: PathBuf,
    ceiling: u64,
    write_lock: Mutex<()>,
}

impl RecordStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, ceiling: u64) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!(path = %root.display(), ceiling, "record store opened");
        Ok(Self {
            root,
            ceiling,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn peer_dir(&self, peer: &PeerKey) -> PathBuf {
        self.root.join(peer.dir_name())
    }

    pub fn append_message(&self, ctx: &RecordContext<'_>, text: &str) -> Result<Record, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = self.prepare_peer_dir(ctx.peer, ctx.peer_name)?;
        let record = Record {
            timestamp: ctx.timestamp,
            sent: ctx.sent,
            sender_name: ctx.sender_name.to_string(),
            body: RecordBody::Text {
                content: text.to_string(),
            },
        };
        self.append_record(&dir, &record)?;
        Ok(record)
    }

    /// Store the payload under the peer's files directory, then append a record pointing at it.
    /// Name collisions get a counter before the extension (`x.bin`, `x_1.bin`, ...).
    pub fn append_file(
        &self,
        ctx: &RecordContext<'_>,
        filename: &str,
        bytes: &[u8],
    ) -> Result<Record, StoreError> {
        let filename = sanitize_filename(filename)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = self.prepare_peer_dir(ctx.peer, ctx.peer_name)?;
        let files_dir = dir.join(FILES_DIR);
        fs::create_dir_all(&files_dir)?;
        let path = unique_path(&files_dir, &filename);
        fs::write(&path, bytes)?;
        let stored_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(filename);
        let record = Record {
            timestamp: ctx.timestamp,
            sent: ctx.sent,
            sender_name: ctx.sender_name.to_string(),
            body: RecordBody::File {
                filename: stored_name,
                path,
            },
        };
        self.append_record(&dir, &record)?;
        Ok(record)
    }

    /// Full history of a peer, oldest file first. Malformed lines are skipped.
    pub fn load_history(&self, peer: &PeerKey) -> Result<Vec<Record>, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = self.peer_dir(peer);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for (_, path) in record_files(&dir)? {
            let content = fs::read(&path)?;
            for (lineno, line) in record_lines(&content).enumerate() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<Record>(line) {
                    Ok(r) => out.push(r),
                    Err(e) => warn!(
                        file = %path.display(),
                        line = lineno + 1,
                        error = %e,
                        "skipping malformed record"
                    ),
                }
            }
        }
        Ok(out)
    }

    /// Cached display name of a peer, if any record was ever written for it.
    pub fn last_known_name(&self, peer: &PeerKey) -> Option<String> {
        let data = fs::read(self.peer_dir(peer).join(PEER_META_FILE)).ok()?;
        serde_json::from_slice::<PeerMeta>(&data)
            .ok()
            .map(|m| m.last_known_name)
    }

    /// Drop every record older than `threshold_ms` across all peers, deleting the
    /// payloads of purged file records. Malformed lines are left in place.
    pub fn purge_older_than(&self, threshold_ms: u64) -> Result<PurgeReport, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut report = PurgeReport::default();
        for entry in fs::read_dir(&self.root)? {
            let dir = entry?.path();
            if !dir.is_dir() {
                continue;
            }
            for (_, path) in record_files(&dir)? {
                purge_file(&path, threshold_ms, &mut report)?;
            }
        }
        debug!(
            threshold_ms,
            records = report.records_removed,
            files = report.files_removed,
            "history purged"
        );
        Ok(report)
    }

    fn prepare_peer_dir(&self, peer: &PeerKey, peer_name: &str) -> Result<PathBuf, StoreError> {
        let dir = self.peer_dir(peer);
        fs::create_dir_all(&dir)?;
        let meta = PeerMeta {
            mac: peer.clone(),
            last_known_name: peer_name.to_string(),
        };
        fs::write(dir.join(PEER_META_FILE), serde_json::to_vec(&meta)?)?;
        Ok(dir)
    }

    fn append_record(&self, dir: &Path, record: &Record) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let path = current_record_file(dir, self.ceiling, line.len() as u64)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// Record file the next append of `next_len` bytes goes to: the highest-numbered
/// file while it stays within the ceiling, else the next number. An empty file
/// always takes the append so one oversized record never loops.
pub fn current_record_file(dir: &Path, ceiling: u64, next_len: u64) -> io::Result<PathBuf> {
    let files = record_files(dir)?;
    let Some((last_num, last_path)) = files.last() else {
        return Ok(record_path(dir, 1));
    };
    let size = fs::metadata(last_path)?.len();
    if size == 0 || size.saturating_add(next_len) <= ceiling {
        Ok(last_path.clone())
    } else {
        Ok(record_path(dir, last_num + 1))
    }
}

fn record_path(dir: &Path, n: u64) -> PathBuf {
    dir.join(format!("{RECORD_PREFIX}{n}{RECORD_EXT}"))
}

/// Numbered record files in `dir`, ascending by number (not by name).
fn record_files(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let number = name
            .strip_prefix(RECORD_PREFIX)
            .and_then(|rest| rest.strip_suffix(RECORD_EXT))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(n) = number {
            out.push((n, path));
        }
    }
    out.sort_by_key(|(n, _)| *n);
    Ok(out)
}

/// Lines of a record file as raw bytes. A torn write may leave invalid UTF-8 on one line.
fn record_lines(content: &[u8]) -> impl Iterator<Item = &[u8]> {
    content
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
}

fn purge_file(path: &Path, threshold_ms: u64, report: &mut PurgeReport) -> Result<(), StoreError> {
    let content = fs::read(path)?;
    let mut kept = Vec::with_capacity(content.len());
    let mut removed = 0usize;
    for line in record_lines(&content) {
        match serde_json::from_slice::<Record>(line) {
            Ok(r) if r.timestamp < threshold_ms => {
                removed += 1;
                if let RecordBody::File { path: payload, .. } = &r.body {
                    match fs::remove_file(payload) {
                        Ok(()) => report.files_removed += 1,
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => warn!(file = %payload.display(), error = %e, "cannot delete purged file"),
                    }
                }
            }
            _ => {
                kept.extend_from_slice(line);
                kept.push(b'\n');
            }
        }
    }
    if removed > 0 {
        let tmp = path.with_extension("jsonl.tmp");
        fs::write(&tmp, kept)?;
        fs::rename(&tmp, path)?;
        report.records_removed += removed;
    }
    Ok(())
}

/// Keep only the final path component of a peer-supplied name.
fn sanitize_filename(name: &str) -> Result<String, StoreError> {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::trim)
        .unwrap_or("");
    if base.is_empty() || base == "." || base == ".." {
        return Err(StoreError::InvalidFileName(name.to_string()));
    }
    Ok(base.to_string())
}

fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match filename.rfind('.') {
        Some(i) if i > 0 => (&filename[..i], &filename[i..]),
        _ => (filename, ""),
    };
    let mut counter = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}_{counter}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}
