//! Reference-counted deletion of index files.
//!
//! Every checkpoint of the in-memory catalog and every commit holds one
//! reference on each file it names. A file whose count drops to zero is
//! deleted. Only the newest commit is kept; older ones release their
//! references as soon as a new commit lands.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use log::{debug, warn};

use crate::error::Result;
use crate::index::catalog::SegmentCatalog;
use crate::index::file_names::{self, SEGMENTS_GEN, WRITE_LOCK_NAME};
use crate::storage::Storage;

#[derive(Debug, Clone)]
struct CommitPoint {
    segments_file: String,
    files: BTreeSet<String>,
}

/// Tracks which files the index still needs.
///
/// Owned by the writer and only used under its monitor.
#[derive(Debug)]
pub struct FileDeleter {
    storage: Arc<dyn Storage>,
    ref_counts: HashMap<String, usize>,
    /// Files of the last non-commit checkpoint.
    last_files: BTreeSet<String>,
    commits: Vec<CommitPoint>,
    /// Files whose deletion failed; retried on the next checkpoint.
    pending_deletes: BTreeSet<String>,
    lock_name: String,
}

impl FileDeleter {
    /// Start tracking `catalog`, with `commit` as the commit currently on
    /// disk (the same catalog when appending, `None` for a new index).
    ///
    /// Index files neither of them references are left over from crashed
    /// writers or aborted merges and are deleted.
    pub fn new(
        storage: Arc<dyn Storage>,
        commit: Option<&SegmentCatalog>,
        catalog: &SegmentCatalog,
        lock_name: &str,
    ) -> Result<Self> {
        let mut deleter = FileDeleter {
            storage,
            ref_counts: HashMap::new(),
            last_files: BTreeSet::new(),
            commits: Vec::new(),
            pending_deletes: BTreeSet::new(),
            lock_name: lock_name.to_string(),
        };

        if let Some(commit) = commit {
            if let Some(segments_file) = commit.segments_file_name() {
                let files = commit.files(true);
                deleter.inc_ref_files(&files);
                deleter.commits.push(CommitPoint {
                    segments_file,
                    files,
                });
            }
        }

        deleter.checkpoint(catalog, false)?;
        deleter.refresh(None)?;
        Ok(deleter)
    }

    /// Reference the files of `catalog`.
    ///
    /// For a commit the previous commit's references are released; otherwise
    /// the previous checkpoint's are.
    pub fn checkpoint(&mut self, catalog: &SegmentCatalog, is_commit: bool) -> Result<()> {
        self.delete_pending_files();

        let files = catalog.files(is_commit);
        self.inc_ref_files(&files);

        if is_commit {
            if let Some(segments_file) = catalog.segments_file_name() {
                self.commits.push(CommitPoint {
                    segments_file,
                    files,
                });
            }
            self.delete_old_commits();
        } else {
            let last = std::mem::replace(&mut self.last_files, files);
            self.dec_ref_files(&last);
        }
        Ok(())
    }

    fn delete_old_commits(&mut self) {
        let keep_from = self.commits.len().saturating_sub(1);
        let old: Vec<CommitPoint> = self.commits.drain(..keep_from).collect();
        for commit in old {
            debug!("delete commit point {}", commit.segments_file);
            self.dec_ref_files(&commit.files);
        }
    }

    pub fn inc_ref_files(&mut self, files: &BTreeSet<String>) {
        for file in files {
            self.inc_ref(file);
        }
    }

    pub fn inc_ref(&mut self, file: &str) {
        *self.ref_counts.entry(file.to_string()).or_insert(0) += 1;
    }

    pub fn dec_ref_files(&mut self, files: &BTreeSet<String>) {
        for file in files {
            self.dec_ref(file);
        }
    }

    /// Release one reference; the file is deleted when none remain.
    pub fn dec_ref(&mut self, file: &str) {
        let Some(count) = self.ref_counts.get_mut(file) else {
            debug_assert!(false, "dec_ref of untracked file {file}");
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.ref_counts.remove(file);
            self.delete_file(file);
        }
    }

    /// References held on `file`.
    pub fn ref_count(&self, file: &str) -> usize {
        self.ref_counts.get(file).copied().unwrap_or(0)
    }

    pub fn exists(&self, file: &str) -> bool {
        self.ref_counts.contains_key(file)
    }

    /// Delete each of `files` that nothing references, such as the output of
    /// a flush or merge that failed before being checkpointed.
    pub fn delete_new_files(&mut self, files: &BTreeSet<String>) {
        for file in files {
            if !self.ref_counts.contains_key(file) {
                debug!("delete new file {file}");
                self.delete_file(file);
            }
        }
    }

    /// Delete unreferenced index files, restricted to `segment` if given.
    pub fn refresh(&mut self, segment: Option<&str>) -> Result<()> {
        let prefixes = segment.map(|s| (format!("{s}."), format!("{s}_")));
        for file in self.storage.list_files()? {
            if file == SEGMENTS_GEN || file == WRITE_LOCK_NAME || file == self.lock_name {
                continue;
            }
            if !file_names::is_index_file(&file) || self.ref_counts.contains_key(&file) {
                continue;
            }
            let matches = match &prefixes {
                Some((dot, underscore)) => file.starts_with(dot) || file.starts_with(underscore),
                None => true,
            };
            if matches {
                debug!("refresh: delete unreferenced file {file}");
                self.delete_file(&file);
            }
        }
        Ok(())
    }

    fn delete_file(&mut self, file: &str) {
        match self.storage.delete_file(file) {
            Ok(()) => {
                self.pending_deletes.remove(file);
            }
            Err(e) => {
                if self.storage.file_exists(file) {
                    warn!("unable to delete {file}: {e}; will retry later");
                    self.pending_deletes.insert(file.to_string());
                }
            }
        }
    }

    fn delete_pending_files(&mut self) {
        let pending: Vec<String> = self.pending_deletes.iter().cloned().collect();
        for file in pending {
            if !self.ref_counts.contains_key(&file) {
                self.delete_file(&file);
            } else {
                self.pending_deletes.remove(&file);
            }
        }
    }

    /// Release the last checkpoint's references, as a closing writer does.
    pub fn close(&mut self) {
        let last = std::mem::take(&mut self.last_files);
        self.dec_ref_files(&last);
        self.delete_pending_files();
    }
}
