//! The replicated log: an ordered sequence of applied-and-retained plus
//! unapplied entries, backed by one file per entry (spec.md §3, §4.3).
//!
//! All methods here are synchronous; the coordinator's IO worker
//! (`crate::io_worker`) is responsible for running the file-touching ones
//! (`append`, `discard_applied`) off the single-threaded dispatcher via
//! `tokio::task::spawn_blocking`, per spec.md §5.

pub mod entry;

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use raftkv_core::DirLock;

use crate::error::{RaftError, Result};
use crate::proto::{LogIndex, ServerId, Term};

pub use entry::LogEntry;

pub struct Log {
    dir: PathBuf,
    disable_sync: bool,
    /// Held for the lifetime of this `Log`, released on drop. Ensures two
    /// coordinators never scan/append into the same data directory at once.
    _lock: DirLock,

    last_applied_term: Term,
    last_applied_index: LogIndex,
    last_applied_config: HashMap<ServerId, String>,

    /// Applied entries still retained on disk, contiguous and ending at
    /// `last_applied_index` (possibly empty if none have been retained, or
    /// if the run on disk didn't reach all the way up to it).
    retained: VecDeque<LogEntry>,
    /// Unapplied entries, contiguous starting at `last_applied_index + 1`.
    unapplied: VecDeque<LogEntry>,
}

impl Log {
    /// Scans `dir`, reconstructing the log per spec.md §4.3's load
    /// procedure: parse `log-<index>-<term>.bin` names, sort by index,
    /// discard any non-contiguous or term-decreasing tail, verify the
    /// entry at `last_applied_index` (if retained) matches
    /// `last_applied_term`, purge everything on mismatch, and delete
    /// leftover `*.tmp` files.
    pub fn load_from_directory(
        dir: impl AsRef<Path>,
        last_applied_term: Term,
        last_applied_index: LogIndex,
        last_applied_config: HashMap<ServerId, String>,
        disable_sync: bool,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| RaftError::Io(e.to_string()))?;
        let lock = DirLock::acquire(&dir).map_err(|_| RaftError::DirectoryLocked(dir.display().to_string()))?;

        let mut files: Vec<(LogIndex, Term, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| RaftError::Io(e.to_string()))? {
            let entry = entry.map_err(|e| RaftError::Io(e.to_string()))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if name.ends_with(".tmp") {
                let _ = fs::remove_file(entry.path());
                continue;
            }

            if let Some((index, term)) = LogEntry::parse_file_name(&name) {
                files.push((index, term, entry.path()));
            }
        }
        files.sort_by_key(|(index, _, _)| *index);

        // Keep only the longest contiguous, term-nondecreasing prefix.
        let mut kept = Vec::new();
        let mut expected_next: Option<LogIndex> = None;
        let mut last_term = 0;
        for (index, term, path) in files.into_iter() {
            if let Some(expected) = expected_next {
                if index != expected || term < last_term {
                    let _ = fs::remove_file(&path);
                    continue;
                }
            }
            expected_next = Some(index + 1);
            last_term = term;
            kept.push((index, term, path));
        }
        // Anything after the first gap was already skipped above; also drop
        // any files whose index is now disconnected because an earlier one
        // in the run was removed by a prior corruption check. A second pass
        // re-validates strict contiguity over what remains.
        let mut run: Vec<(LogIndex, Term, PathBuf)> = Vec::new();
        for (index, term, path) in kept {
            match run.last() {
                Some((prev_index, _, _)) if index != prev_index + 1 => {
                    let _ = fs::remove_file(&path);
                }
                _ => run.push((index, term, path)),
            }
        }

        let mut entries: VecDeque<LogEntry> = VecDeque::new();
        for (index, term, path) in &run {
            let body = fs::read(path).map_err(|e| RaftError::Io(e.to_string()))?;
            entries.push_back(LogEntry::decode_body(*term, *index, &body)?);
        }

        let split = entries.iter().position(|e| e.index > last_applied_index).unwrap_or(entries.len());
        let mut retained: VecDeque<LogEntry> = entries.drain(..split).collect();
        let unapplied: VecDeque<LogEntry> = entries;

        let mismatch = retained
            .back()
            .filter(|e| e.index == last_applied_index)
            .map(|e| e.term != last_applied_term)
            .unwrap_or(false);

        if mismatch {
            for (_, _, path) in &run {
                let _ = fs::remove_file(path);
            }
            retained.clear();
            return Ok(Log {
                dir,
                disable_sync,
                _lock: lock,
                last_applied_term,
                last_applied_index,
                last_applied_config,
                retained: VecDeque::new(),
                unapplied: VecDeque::new(),
            });
        }

        Ok(Log {
            dir,
            disable_sync,
            _lock: lock,
            last_applied_term,
            last_applied_index,
            last_applied_config,
            retained,
            unapplied,
        })
    }

    pub fn first_index(&self) -> LogIndex {
        self.retained.front().map(|e| e.index).unwrap_or(self.last_applied_index + 1)
    }

    pub fn last_index(&self) -> LogIndex {
        self.unapplied.back().map(|e| e.index).unwrap_or(self.last_applied_index)
    }

    pub fn last_applied_index(&self) -> LogIndex {
        self.last_applied_index
    }

    pub fn last_applied_term(&self) -> Term {
        self.last_applied_term
    }

    /// Fails (returns `None`) if `index` is below `first_index()` and isn't
    /// the boundary index `last_applied_index` (always known from the
    /// persisted scalar regardless of retention).
    pub fn term_at_index(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.last_applied_index {
            return Some(self.last_applied_term);
        }
        self.entry_at_index(index).map(|e| e.term)
    }

    pub fn entry_at_index(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index() || index > self.last_index() {
            return None;
        }
        if index <= self.last_applied_index {
            let offset = index - self.first_index();
            self.retained.get(offset as usize)
        } else {
            let offset = index - self.last_applied_index - 1;
            self.unapplied.get(offset as usize)
        }
    }

    /// Writes a new entry to a temp file, fsyncs it, atomically renames it
    /// into place, then fsyncs the directory (spec.md §3, §4.3).
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        if entry.index != self.last_index() + 1 {
            return Err(RaftError::Io(format!(
                "non-contiguous append: expected index {}, got {}",
                self.last_index() + 1,
                entry.index
            )));
        }

        let body = entry.encode_body();
        let tmp_name = format!("temp-{}-{}.tmp", entry.index, entry.term);
        let tmp_path = self.dir.join(&tmp_name);
        let final_path = self.dir.join(LogEntry::file_name(entry.index, entry.term));

        fs::write(&tmp_path, &body).map_err(|e| RaftError::Io(e.to_string()))?;
        if !self.disable_sync {
            let f = fs::File::open(&tmp_path).map_err(|e| RaftError::Io(e.to_string()))?;
            f.sync_all().map_err(|e| RaftError::Io(e.to_string()))?;
        }
        fs::rename(&tmp_path, &final_path).map_err(|e| RaftError::Io(e.to_string()))?;
        if !self.disable_sync {
            sync_dir(&self.dir)?;
        }

        self.unapplied.push_back(entry);
        Ok(())
    }

    /// Truncates every entry with index >= `from`, deleting their backing
    /// files. Valid for indices in the unapplied region; committed
    /// (applied) entries are never truncated (spec.md §4.6.2 guards this by
    /// refusing to discard already-committed entries before calling here).
    pub fn discard_log_entries_from(&mut self, from: LogIndex) -> Result<()> {
        while let Some(back) = self.unapplied.back() {
            if back.index < from {
                break;
            }
            let e = self.unapplied.pop_back().unwrap();
            let path = self.dir.join(LogEntry::file_name(e.index, e.term));
            let _ = fs::remove_file(path);
        }
        Ok(())
    }

    /// Applies the next unapplied entry, advancing `last_applied_index`/
    /// `last_applied_term` and moving the entry into the retained set.
    /// Returns the entry so the caller can apply its mutations to the state
    /// machine and update `last_applied_config`.
    pub fn apply_next_log_entry(&mut self) -> Option<LogEntry> {
        let entry = self.unapplied.pop_front()?;
        self.last_applied_term = entry.term;
        self.last_applied_index = entry.index;
        if let Some(cc) = &entry.config_change {
            match &cc.address {
                Some(addr) => {
                    self.last_applied_config.insert(cc.identity.clone(), addr.clone());
                }
                None => {
                    self.last_applied_config.remove(&cc.identity);
                }
            }
        }
        self.retained.push_back(entry.clone());
        Some(entry)
    }

    /// Deletes retained applied entries with index < `up_to`.
    pub fn discard_applied_log_entries(&mut self, up_to: LogIndex) {
        while let Some(front) = self.retained.front() {
            if front.index >= up_to {
                break;
            }
            let e = self.retained.pop_front().unwrap();
            let path = self.dir.join(LogEntry::file_name(e.index, e.term));
            let _ = fs::remove_file(path);
        }
    }

    /// `lastAppliedConfig` overlaid by config changes from unapplied
    /// entries (spec.md §3 "Cluster configuration").
    pub fn build_current_config(&self) -> HashMap<ServerId, String> {
        let mut config = self.last_applied_config.clone();
        for entry in &self.unapplied {
            if let Some(cc) = &entry.config_change {
                match &cc.address {
                    Some(addr) => {
                        config.insert(cc.identity.clone(), addr.clone());
                    }
                    None => {
                        config.remove(&cc.identity);
                    }
                }
            }
        }
        config
    }

    pub fn last_applied_config(&self) -> &HashMap<ServerId, String> {
        &self.last_applied_config
    }

    pub fn set_last_applied_config(&mut self, config: HashMap<ServerId, String>) {
        self.last_applied_config = config;
    }

    /// Used by snapshot install: replaces the applied point wholesale
    /// without touching unapplied entries on disk in a way that breaks
    /// contiguity (callers are expected to have already discarded
    /// conflicting unapplied entries).
    pub fn reset_applied_point(&mut self, term: Term, index: LogIndex, config: HashMap<ServerId, String>) {
        self.last_applied_term = term;
        self.last_applied_index = index;
        self.last_applied_config = config;
        self.retained.clear();
        self.unapplied.retain(|e| e.index > index);
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    let f = fs::File::open(dir).map_err(|e| RaftError::Io(e.to_string()))?;
    f.sync_all().map_err(|e| RaftError::Io(e.to_string()))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::Mutation;

    fn temp_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("raftkv-log-test-{}", uuid_like()));
        dir
    }

    fn uuid_like() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64
            ^ (std::process::id() as u64) << 32
    }

    fn entry(index: LogIndex, term: Term) -> LogEntry {
        LogEntry {
            term,
            index,
            mutations: vec![Mutation::Put { key: vec![index as u8], value: vec![] }],
            config_change: None,
        }
    }

    #[test]
    fn append_and_read_back() {
        let dir = temp_dir();
        let mut log = Log::load_from_directory(&dir, 0, 0, HashMap::new(), true).unwrap();
        log.append(entry(1, 1)).unwrap();
        log.append(entry(2, 1)).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at_index(1), Some(1));
        assert_eq!(log.term_at_index(2), Some(1));
        assert_eq!(log.term_at_index(0), Some(0));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn reload_recovers_entries() {
        let dir = temp_dir();
        {
            let mut log = Log::load_from_directory(&dir, 0, 0, HashMap::new(), true).unwrap();
            log.append(entry(1, 1)).unwrap();
            log.append(entry(2, 2)).unwrap();
        }
        let log = Log::load_from_directory(&dir, 0, 0, HashMap::new(), true).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at_index(2), Some(2));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn reload_discards_non_contiguous_tail() {
        let dir = temp_dir();
        fs::create_dir_all(&dir).unwrap();
        for (index, term) in [(1, 1), (2, 1), (4, 1)] {
            let e = entry(index, term);
            fs::write(dir.join(LogEntry::file_name(index, term)), e.encode_body()).unwrap();
        }
        let log = Log::load_from_directory(&dir, 0, 0, HashMap::new(), true).unwrap();
        assert_eq!(log.last_index(), 2);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn reload_purges_on_applied_term_mismatch() {
        let dir = temp_dir();
        fs::create_dir_all(&dir).unwrap();
        let e = entry(1, 5);
        fs::write(dir.join(LogEntry::file_name(1, 5)), e.encode_body()).unwrap();
        // Claim last_applied_index=1 at term 9, but the file says term 5.
        let log = Log::load_from_directory(&dir, 9, 1, HashMap::new(), true).unwrap();
        assert_eq!(log.last_index(), 1); // nothing retained, unapplied empty
        assert_eq!(log.first_index(), 2);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn apply_moves_entry_into_retained() {
        let dir = temp_dir();
        let mut log = Log::load_from_directory(&dir, 0, 0, HashMap::new(), true).unwrap();
        log.append(entry(1, 1)).unwrap();
        let applied = log.apply_next_log_entry().unwrap();
        assert_eq!(applied.index, 1);
        assert_eq!(log.last_applied_index(), 1);
        assert_eq!(log.entry_at_index(1).unwrap().index, 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn discard_from_truncates_suffix() {
        let dir = temp_dir();
        let mut log = Log::load_from_directory(&dir, 0, 0, HashMap::new(), true).unwrap();
        log.append(entry(1, 1)).unwrap();
        log.append(entry(2, 1)).unwrap();
        log.append(entry(3, 1)).unwrap();
        log.discard_log_entries_from(2).unwrap();
        assert_eq!(log.last_index(), 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn build_current_config_overlays_unapplied_changes() {
        use crate::proto::ConfigChange;
        let dir = temp_dir();
        let mut log = Log::load_from_directory(&dir, 0, 0, HashMap::new(), true).unwrap();
        log.append(LogEntry {
            term: 1,
            index: 1,
            mutations: vec![],
            config_change: Some(ConfigChange { identity: ServerId::from("A"), address: Some("a:1".into()) }),
        })
        .unwrap();
        let config = log.build_current_config();
        assert_eq!(config.get(&ServerId::from("A")), Some(&"a:1".to_string()));
        let _ = fs::remove_dir_all(&dir);
    }
}
