//! An mbox file coupled to its persisted summary.
//!
//! [`MboxFolder`] opens the summary stored next to the mbox (or in the cache
//! directory when that is not writable), brings it up to date with the file
//! and then serves raw messages by uid through an LRU cache. Expunging
//! rewrites the mbox without the deleted messages.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::{self, Config};
use crate::error::{Result, SummaryError};
use crate::model::flags::MessageFlags;
use crate::model::message_info::SharedMessageInfo;
use crate::parser::header::header_end;
use crate::parser::mbox::{is_mbox_separator, MboxParser};
use crate::summary::locks;
use crate::summary::mbox::{stat, status_headers};
use crate::summary::{
    InfoRef, MboxBackend, MboxSummary, SummaryContext, SummaryCounts, SyncReport, WordIndex,
};

/// Primary summary path: hidden file next to the mbox.
///
/// Example: `/data/mail.mbox` → `/data/.mail.mbox.summary`
pub fn summary_path_for(mbox_path: &Path) -> PathBuf {
    let filename = mbox_path.file_name().unwrap_or_default().to_string_lossy();
    mbox_path.with_file_name(format!(".{filename}.summary"))
}

/// Fallback summary path inside `cache_dir`, keyed by the SHA-256 of the
/// mbox path.
///
/// Example: `~/.cache/mailsummary/<sha256_of_path>.summary`
pub fn cache_summary_path_for(mbox_path: &Path, cache_dir: &Path) -> PathBuf {
    let absolute = fs::canonicalize(mbox_path).unwrap_or_else(|_| mbox_path.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(absolute.to_string_lossy().as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    cache_dir.join(format!("{hash}.summary"))
}

/// Where the summary of `mbox_path` lives: an existing file wins, then the
/// spot next to the mbox when its directory is writable, then the cache.
pub fn summary_location(mbox_path: &Path, cache_dir: &Path) -> PathBuf {
    let primary = summary_path_for(mbox_path);
    if primary.exists() {
        return primary;
    }
    let cached = cache_summary_path_for(mbox_path, cache_dir);
    if cached.exists() || !can_create(&primary) {
        debug!(path = %cached.display(), "Using summary in cache dir");
        return cached;
    }
    primary
}

/// Whether a file can be created beside `path`.
fn can_create(path: &Path) -> bool {
    let mut marker = path.as_os_str().to_owned();
    marker.push(".writable");
    let marker = PathBuf::from(marker);
    match OpenOptions::new().write(true).create_new(true).open(&marker) {
        Ok(file) => {
            drop(file);
            fs::remove_file(&marker).is_ok()
        }
        Err(_) => false,
    }
}

/// What an expunge did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpungeReport {
    /// Messages removed from the mbox.
    pub expunged: usize,
    /// Messages written back.
    pub kept: usize,
    /// Size of the mbox afterwards.
    pub new_size: u64,
}

/// An mbox file and its summary.
pub struct MboxFolder {
    mbox_path: PathBuf,
    summary: MboxSummary,
    cache: LruCache<Arc<str>, Arc<[u8]>>,
    read_buffer_size: usize,
    max_message_size: usize,
    index: Option<Arc<WordIndex>>,
    last_sync: SyncReport,
}

impl std::fmt::Debug for MboxFolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MboxFolder")
            .field("mbox_path", &self.mbox_path)
            .field("summary", &self.summary)
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl MboxFolder {
    /// Open the mbox at `path`, load its summary and sync it with the file.
    pub fn open(path: impl AsRef<Path>, config: &Config, context: Arc<SummaryContext>) -> Result<Self> {
        Self::open_with(path, config, context, false, None)
    }

    /// Like [`MboxFolder::open`]. With `rebuild` the stored summary is
    /// ignored and every message is parsed again.
    pub fn open_with(
        path: impl AsRef<Path>,
        config: &Config,
        context: Arc<SummaryContext>,
        rebuild: bool,
        progress: Option<&dyn Fn(u64, u64)>,
    ) -> Result<Self> {
        let mbox_path = path.as_ref().to_path_buf();
        if !mbox_path.is_file() {
            return Err(SummaryError::FileNotFound(mbox_path));
        }
        let name = mbox_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SummaryError::InvalidPath(mbox_path.display().to_string()))?;

        let summary_path = summary_location(&mbox_path, &config::cache_dir(config));
        if let Some(parent) = summary_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| SummaryError::io(parent, e))?;
        }
        let index = config.summary.index_bodies.then(|| Arc::new(WordIndex::new()));
        let options = config.summary.options(index.as_ref());
        let summary = MboxSummary::with_name(&name, summary_path, MboxBackend, context, options);

        if !rebuild {
            if let Err(e) = summary.load() {
                warn!(
                    mbox = %mbox_path.display(),
                    error = %e,
                    "Summary unusable, rebuilding"
                );
            }
        }

        let cache_size = NonZeroUsize::new(config.store.lru_cache_size).unwrap_or(NonZeroUsize::MIN);
        let mut folder = Self {
            mbox_path,
            summary,
            cache: LruCache::new(cache_size),
            read_buffer_size: config.store.read_buffer_size,
            max_message_size: config.store.max_message_size,
            index,
            last_sync: SyncReport::default(),
        };
        folder.sync(progress)?;
        if let Err(e) = folder.summary.save() {
            warn!(error = %e, "Could not write summary file; continuing without persistence");
        }
        Ok(folder)
    }

    pub fn path(&self) -> &Path {
        &self.mbox_path
    }

    pub fn summary(&self) -> &MboxSummary {
        &self.summary
    }

    pub fn counts(&self) -> SummaryCounts {
        self.summary.counts()
    }

    /// Uids of messages whose body contains `word`. Empty unless body
    /// indexing is enabled; only messages parsed since opening are indexed.
    pub fn search(&self, word: &str) -> Vec<String> {
        self.index
            .as_ref()
            .map(|index| index.search(word))
            .unwrap_or_default()
    }

    /// What the most recent sync did.
    pub fn last_sync(&self) -> SyncReport {
        self.last_sync
    }

    /// Bring the summary up to date with the mbox.
    pub fn sync(&mut self, progress: Option<&dyn Fn(u64, u64)>) -> Result<SyncReport> {
        let parser = MboxParser::new(&self.mbox_path)?
            .with_buffer_size(self.read_buffer_size)
            .with_max_message_size(self.max_message_size);
        let report = self.summary.sync_with_parser(&parser, progress)?;
        if report.full || report.removed > 0 {
            self.cache.clear();
        }
        self.last_sync = report;
        Ok(report)
    }

    /// Write the summary if it changed.
    pub fn save(&self) -> Result<bool> {
        self.summary.save()
    }

    /// Raw bytes of message `uid`, `From ` line included.
    pub fn get_message(&mut self, uid: &str) -> Result<Arc<[u8]>> {
        if let Some(raw) = self.cache.get(uid) {
            return Ok(Arc::clone(raw));
        }
        let info = self.record(uid)?;
        let (key, offset, size) = {
            let record = info.read();
            (Arc::clone(&record.uid), record.extra.from_offset, u64::from(record.size))
        };
        debug!(uid, offset, size, "Reading message from mbox");
        let raw = MboxParser::read_message_at(&self.mbox_path, offset, size)?;
        if !is_mbox_separator(&raw) {
            return Err(SummaryError::ParseError {
                offset,
                reason: "summary is out of date with the mbox".to_string(),
            });
        }
        let raw: Arc<[u8]> = Arc::from(raw);
        self.cache.put(key, Arc::clone(&raw));
        Ok(raw)
    }

    /// Change the flags of `uid`. Returns whether anything changed.
    pub fn set_flags(&self, uid: &str, mask: MessageFlags, set: MessageFlags) -> Result<bool> {
        Ok(self.record(uid)?.set_flags(mask, set))
    }

    fn record(&self, uid: &str) -> Result<InfoRef<MboxBackend>> {
        self.summary
            .uid(uid)
            .ok_or_else(|| SummaryError::UnknownUid(uid.to_string()))
    }

    /// Rewrite the mbox without the messages flagged DELETED and save the
    /// summary. With `refresh_status` the `Status`/`X-Status` headers of
    /// the kept messages are rewritten from their flags.
    ///
    /// The summary is synced first, so every byte of the file belongs to a
    /// record. Each kept message is copied up to the next `From ` line,
    /// whatever size its record holds.
    ///
    /// The removed records are parked as expunged in the summary until
    /// [`MboxSummary::clear_expunged`](crate::summary::FolderSummary::clear_expunged).
    pub fn expunge(&mut self, refresh_status: bool) -> Result<ExpungeReport> {
        self.sync(None)?;
        let file_size = stat(&self.mbox_path)?.folder_size;
        let records = self.summary.array();
        let spans = spans(&records, file_size);
        let (doomed, kept): (Vec<_>, Vec<_>) = records
            .into_iter()
            .zip(spans)
            .partition(|(info, _)| info.read().flags.contains(MessageFlags::DELETED));
        if doomed.is_empty() && !refresh_status {
            return Ok(ExpungeReport {
                kept: kept.len(),
                new_size: file_size,
                ..ExpungeReport::default()
            });
        }

        let mut tmp = self.mbox_path.as_os_str().to_owned();
        tmp.push("~");
        let tmp = PathBuf::from(tmp);
        let placed = match self.rewrite(&tmp, &kept, refresh_status) {
            Ok(placed) => placed,
            Err(e) => {
                if let Err(rm) = fs::remove_file(&tmp) {
                    if rm.kind() != io::ErrorKind::NotFound {
                        warn!(path = %tmp.display(), error = %rm, "Cannot remove temporary mbox");
                    }
                }
                return Err(e);
            }
        };
        fs::rename(&tmp, &self.mbox_path).map_err(|e| SummaryError::io(&self.mbox_path, e))?;

        for ((info, _), (offset, size)) in kept.iter().zip(placed) {
            locks::write(info.record()).size = u32::try_from(size).unwrap_or(u32::MAX);
            info.update_extra(|extra| extra.from_offset = offset);
        }
        for (info, _) in &doomed {
            info.set_flags(MessageFlags::EXPUNGED, MessageFlags::EXPUNGED);
            self.summary.remove(info);
        }
        let header = stat(&self.mbox_path)?;
        self.summary.set_backend_header(header);
        self.cache.clear();
        self.summary.save()?;

        let report = ExpungeReport {
            expunged: doomed.len(),
            kept: kept.len(),
            new_size: header.folder_size,
        };
        info!(
            mbox = %self.mbox_path.display(),
            expunged = report.expunged,
            kept = report.kept,
            "Expunged mbox"
        );
        Ok(report)
    }

    /// Copy the `(record, span)` pairs of `kept` into `tmp`. Returns the new
    /// offset and length of each.
    fn rewrite(
        &self,
        tmp: &Path,
        kept: &[(InfoRef<MboxBackend>, u64)],
        refresh_status: bool,
    ) -> Result<Vec<(u64, u64)>> {
        let mut source = File::open(&self.mbox_path).map_err(|e| SummaryError::io(&self.mbox_path, e))?;
        let out = File::create(tmp).map_err(|e| SummaryError::io(tmp, e))?;
        let mut out = BufWriter::with_capacity(self.read_buffer_size, out);

        let mut placed = Vec::with_capacity(kept.len());
        let mut position: u64 = 0;
        for (info, span) in kept {
            let (offset, flags) = {
                let record = info.read();
                (record.extra.from_offset, record.flags)
            };
            source
                .seek(SeekFrom::Start(offset))
                .map_err(|e| SummaryError::io(&self.mbox_path, e))?;
            let mut raw = Vec::new();
            (&mut source)
                .take(*span)
                .read_to_end(&mut raw)
                .map_err(|e| SummaryError::io(&self.mbox_path, e))?;
            if raw.len() as u64 != *span || !is_mbox_separator(&raw) {
                return Err(SummaryError::ParseError {
                    offset,
                    reason: "summary is out of date with the mbox".to_string(),
                });
            }
            if refresh_status {
                raw = with_status(&raw, flags);
            }
            if !raw.ends_with(b"\n") {
                raw.push(b'\n');
            }
            out.write_all(&raw).map_err(|e| SummaryError::io(tmp, e))?;
            placed.push((position, raw.len() as u64));
            position += raw.len() as u64;
        }

        let file = out
            .into_inner()
            .map_err(|e| SummaryError::io(tmp, e.into_error()))?;
        file.sync_all().map_err(|e| SummaryError::io(tmp, e))?;
        Ok(placed)
    }
}

/// Bytes each record occupies in an mbox of `file_size` bytes: from its
/// `From ` line to the next record's, or to the end of the file. Returned
/// in the order of `records`.
fn spans(records: &[InfoRef<MboxBackend>], file_size: u64) -> Vec<u64> {
    let offsets: Vec<u64> = records.iter().map(|info| info.read().extra.from_offset).collect();
    let mut sorted = offsets.clone();
    sorted.sort_unstable();
    offsets
        .iter()
        .map(|offset| {
            let next = sorted.partition_point(|o| o <= offset);
            sorted.get(next).copied().unwrap_or(file_size).saturating_sub(*offset)
        })
        .collect()
}

/// `raw` with its `Status` and `X-Status` headers replaced by ones for
/// `flags`.
fn with_status(raw: &[u8], flags: MessageFlags) -> Vec<u8> {
    let Some(end) = header_end(raw) else {
        return raw.to_vec();
    };
    let eol: &[u8] = if raw[end] == b'\r' { b"\r\n" } else { b"\n" };
    let head_len = end + eol.len();
    let (head, rest) = raw.split_at(head_len);

    let mut out = Vec::with_capacity(raw.len() + 32);
    let mut skipping = false;
    for line in head.split_inclusive(|&b| b == b'\n') {
        let continuation = line.first().is_some_and(|b| *b == b' ' || *b == b'\t');
        if continuation && skipping {
            continue;
        }
        skipping = is_status_line(line);
        if !skipping {
            out.extend_from_slice(line);
        }
    }

    let (status, x_status) = status_headers(flags);
    out.extend_from_slice(b"Status: ");
    out.extend_from_slice(status.as_bytes());
    out.extend_from_slice(eol);
    if !x_status.is_empty() {
        out.extend_from_slice(b"X-Status: ");
        out.extend_from_slice(x_status.as_bytes());
        out.extend_from_slice(eol);
    }
    out.extend_from_slice(rest);
    out
}

fn is_status_line(line: &[u8]) -> bool {
    let lower = line
        .iter()
        .take(9)
        .map(u8::to_ascii_lowercase)
        .collect::<Vec<_>>();
    lower.starts_with(b"status:") || lower.starts_with(b"x-status:")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MBOX: &str = "From alice@example.com Mon Jan 01 10:00:00 2024\n\
From: Alice <alice@example.com>\n\
Subject: first\n\
Message-ID: <one@example.com>\n\
\n\
hello one\n\
\n\
From bob@example.com Mon Jan 01 11:00:00 2024\n\
From: Bob <bob@example.com>\n\
Subject: second\n\
Message-ID: <two@example.com>\n\
Status: RO\n\
\n\
hello two\n\
\n\
From carol@example.com Mon Jan 01 12:00:00 2024\n\
From: Carol <carol@example.com>\n\
Subject: third\n\
Message-ID: <three@example.com>\n\
\n\
hello three\n";

    fn config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.general.cache_dir = Some(dir.join("cache"));
        config.summary.fsync = false;
        config
    }

    fn setup() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox.mbox");
        fs::write(&path, MBOX).unwrap();
        (dir, path)
    }

    #[test]
    fn test_summary_paths() {
        let p = summary_path_for(Path::new("/data/mail.mbox"));
        assert_eq!(p, PathBuf::from("/data/.mail.mbox.summary"));
        let c = cache_summary_path_for(Path::new("/nonexistent/mail.mbox"), Path::new("/cache"));
        assert!(c.starts_with("/cache"));
        assert_eq!(c.extension().unwrap(), "summary");
    }

    #[test]
    fn test_open_builds_and_persists_summary() {
        let (dir, path) = setup();
        let folder = MboxFolder::open(&path, &config(dir.path()), SummaryContext::shared()).unwrap();
        assert_eq!(folder.summary().count(), 3);
        assert_eq!(folder.summary().name(), "inbox.mbox");
        assert!(summary_path_for(&path).exists());
        let second = folder.summary().uid("2").unwrap();
        assert_eq!(&*second.read().subject, "second");
        assert!(second.read().flags.contains(MessageFlags::SEEN));
    }

    #[test]
    fn test_get_message_reads_by_offset() {
        let (dir, path) = setup();
        let mut folder = MboxFolder::open(&path, &config(dir.path()), SummaryContext::shared()).unwrap();
        let raw = folder.get_message("3").unwrap();
        assert!(raw.starts_with(b"From carol@"));
        assert!(raw.ends_with(b"hello three\n"));
        let again = folder.get_message("3").unwrap();
        assert!(Arc::ptr_eq(&raw, &again));
        assert!(matches!(
            folder.get_message("99"),
            Err(SummaryError::UnknownUid(_))
        ));
    }

    #[test]
    fn test_reopen_keeps_flags() {
        let (dir, path) = setup();
        let config = config(dir.path());
        {
            let folder = MboxFolder::open(&path, &config, SummaryContext::shared()).unwrap();
            assert!(folder
                .set_flags("1", MessageFlags::FLAGGED, MessageFlags::FLAGGED)
                .unwrap());
            folder.save().unwrap();
        }
        let folder = MboxFolder::open(&path, &config, SummaryContext::shared()).unwrap();
        let first = folder.summary().uid("1").unwrap();
        assert!(first.read().flags.contains(MessageFlags::FLAGGED));
    }

    #[test]
    fn test_appended_messages_are_picked_up() {
        let (dir, path) = setup();
        let mut folder = MboxFolder::open(&path, &config(dir.path()), SummaryContext::shared()).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"From dave@example.com Mon Jan 01 13:00:00 2024\nSubject: fourth\n\nhello four\n")
            .unwrap();
        drop(file);
        let report = folder.sync(None).unwrap();
        assert_eq!(report.added, 1);
        assert!(!report.full);
        assert_eq!(folder.summary().count(), 4);
        let raw = folder.get_message("4").unwrap();
        assert!(raw.starts_with(b"From dave@"));
    }

    #[test]
    fn test_expunge_rewrites_mbox() {
        let (dir, path) = setup();
        let config = config(dir.path());
        let mut folder = MboxFolder::open(&path, &config, SummaryContext::shared()).unwrap();
        folder
            .set_flags("2", MessageFlags::DELETED, MessageFlags::DELETED)
            .unwrap();
        let report = folder.expunge(false).unwrap();
        assert_eq!(report.expunged, 1);
        assert_eq!(report.kept, 2);

        let contents = fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("second"));
        assert_eq!(report.new_size, contents.len() as u64);
        assert_eq!(folder.summary().uids(), vec![Arc::<str>::from("1"), Arc::from("3")]);
        assert_eq!(folder.summary().expunged_count(), 1);
        assert!(folder.get_message("3").unwrap().starts_with(b"From carol@"));

        drop(folder);
        let folder = MboxFolder::open(&path, &config, SummaryContext::shared()).unwrap();
        assert_eq!(folder.summary().uids(), vec![Arc::<str>::from("1"), Arc::from("3")]);
    }

    #[test]
    fn test_expunge_keeps_whole_oversized_message() {
        let (dir, path) = setup();
        let mut body = String::new();
        for i in 0..200 {
            body.push_str(&format!("attachment line {i:03}\n"));
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(
            file,
            "\nFrom dave@example.com Mon Jan 01 13:00:00 2024\nSubject: big\nMessage-ID: <big@example.com>\n\n{body}"
        )
        .unwrap();
        drop(file);
        let original = fs::read_to_string(&path).unwrap();
        let big_start = original.find("From dave@").unwrap();

        let mut config = config(dir.path());
        config.store.max_message_size = 256;
        let mut folder = MboxFolder::open(&path, &config, SummaryContext::shared()).unwrap();
        let big = folder.summary().uid("4").unwrap();
        assert_eq!(&*big.read().subject, "big");
        assert_eq!(big.read().size as usize, original.len() - big_start);
        drop(big);

        folder
            .set_flags("2", MessageFlags::DELETED, MessageFlags::DELETED)
            .unwrap();
        folder.expunge(false).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.ends_with("attachment line 199\n"));
        assert!(contents.contains(&original[big_start..]));
        let raw = folder.get_message("4").unwrap();
        assert!(raw.ends_with(b"attachment line 199\n"));
        assert_eq!(raw.len(), original.len() - big_start);
    }

    #[test]
    fn test_expunge_refreshes_status_headers() {
        let (dir, path) = setup();
        let mut folder = MboxFolder::open(&path, &config(dir.path()), SummaryContext::shared()).unwrap();
        folder
            .set_flags("1", MessageFlags::SEEN | MessageFlags::ANSWERED, MessageFlags::SEEN | MessageFlags::ANSWERED)
            .unwrap();
        folder.set_flags("2", MessageFlags::SEEN, MessageFlags::empty()).unwrap();
        folder.expunge(true).unwrap();

        let first = folder.get_message("1").unwrap();
        let text = String::from_utf8_lossy(&first);
        assert!(text.contains("Status: RO\n"));
        assert!(text.contains("X-Status: A\n"));
        let second = folder.get_message("2").unwrap();
        let text = String::from_utf8_lossy(&second);
        assert!(text.contains("Status: O\n"));
        assert!(!text.contains("Status: RO"));
    }

    #[test]
    fn test_with_status_replaces_existing_headers() {
        let raw = b"From x Mon Jan 01 00:00:00 2024\nStatus: RO\nX-Status: F\nSubject: s\n\nbody\n";
        let out = with_status(raw, MessageFlags::DRAFT);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "From x Mon Jan 01 00:00:00 2024\nSubject: s\nStatus: O\nX-Status: T\n\nbody\n"
        );
    }

    #[test]
    fn test_missing_mbox() {
        let dir = tempfile::tempdir().unwrap();
        let err = MboxFolder::open(
            dir.path().join("nope.mbox"),
            &config(dir.path()),
            SummaryContext::shared(),
        )
        .unwrap_err();
        assert!(matches!(err, SummaryError::FileNotFound(_)));
    }
}
