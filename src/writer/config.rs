//! Writer configuration.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{QuireError, Result};
use crate::index::codec::{Codec, CodecRegistry, SimpleCodec};
use crate::index::file_names::WRITE_LOCK_NAME;
use crate::index::pipeline::{BufferedPipeline, DocumentPipeline};
use crate::merge::policy::MergePolicy;
use crate::merge::scheduler::{ConcurrentMergeScheduler, MergeScheduler};
use crate::merge::tiered::TieredMergePolicy;

/// What to do with an existing index when opening a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    /// Start empty; an existing commit is replaced by the first new one.
    Create,
    /// Open the newest commit; fails when there is none.
    Append,
    /// Append when a commit exists, otherwise create.
    CreateOrAppend,
}

/// Plain tunables of an [`IndexWriter`](crate::writer::IndexWriter).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexWriterSettings {
    pub open_mode: OpenMode,

    /// Bundle flushed segments into compound files.
    pub use_compound_file: bool,

    /// Keep per-segment readers and live docs open between uses.
    pub reader_pooling: bool,

    /// Commit on [`close`](crate::writer::IndexWriter::close); otherwise
    /// closing discards uncommitted changes.
    pub commit_on_close: bool,

    /// Buffered delete terms that trigger applying deletes; 0 disables.
    pub max_buffered_delete_terms: usize,

    /// Buffered documents that trigger a flush; 0 disables.
    pub max_buffered_docs: usize,

    /// Generations probed past the newest one found when a listing looks
    /// stale.
    pub gen_lookahead_count: u32,

    /// Keep segments whose every document is deleted.
    pub keep_fully_deleted_segments: bool,

    /// Name of the advisory lock held while the writer is open.
    pub write_lock_name: String,

    /// Documents merged between two abort checks.
    pub check_abort_interval_docs: u64,
}

impl Default for IndexWriterSettings {
    fn default() -> Self {
        IndexWriterSettings {
            open_mode: OpenMode::CreateOrAppend,
            use_compound_file: true,
            reader_pooling: false,
            commit_on_close: true,
            max_buffered_delete_terms: 0,
            max_buffered_docs: 0,
            gen_lookahead_count: 10,
            keep_fully_deleted_segments: false,
            write_lock_name: WRITE_LOCK_NAME.to_string(),
            check_abort_interval_docs: 1000,
        }
    }
}

impl IndexWriterSettings {
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: IndexWriterSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.write_lock_name.is_empty() {
            return Err(QuireError::invalid_argument("write_lock_name must not be empty"));
        }
        if self.check_abort_interval_docs == 0 {
            return Err(QuireError::invalid_argument(
                "check_abort_interval_docs must be > 0",
            ));
        }
        Ok(())
    }
}

/// Settings plus the strategy objects a writer uses.
#[derive(Clone)]
pub struct IndexWriterConfig {
    pub settings: IndexWriterSettings,
    pub merge_policy: Arc<dyn MergePolicy>,
    pub merge_scheduler: Arc<dyn MergeScheduler>,
    /// Codec new segments are written with.
    pub codec: Arc<dyn Codec>,
    /// Extra codecs existing segments may have been written with.
    pub codecs: CodecRegistry,
    pub pipeline: Arc<dyn DocumentPipeline>,
}

impl fmt::Debug for IndexWriterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexWriterConfig")
            .field("settings", &self.settings)
            .field("merge_policy", &self.merge_policy)
            .field("merge_scheduler", &self.merge_scheduler)
            .field("codec", &self.codec.name())
            .finish()
    }
}

impl Default for IndexWriterConfig {
    fn default() -> Self {
        IndexWriterConfig {
            settings: IndexWriterSettings::default(),
            merge_policy: Arc::new(TieredMergePolicy::default()),
            merge_scheduler: Arc::new(ConcurrentMergeScheduler::default()),
            codec: Arc::new(SimpleCodec::new()),
            codecs: CodecRegistry::default(),
            pipeline: Arc::new(BufferedPipeline::default()),
        }
    }
}

impl IndexWriterConfig {
    pub fn new(settings: IndexWriterSettings) -> Self {
        IndexWriterConfig {
            settings,
            ..Default::default()
        }
    }

    pub fn with_open_mode(mut self, open_mode: OpenMode) -> Self {
        self.settings.open_mode = open_mode;
        self
    }

    pub fn with_compound_file(mut self, use_compound_file: bool) -> Self {
        self.settings.use_compound_file = use_compound_file;
        self
    }

    pub fn with_reader_pooling(mut self, reader_pooling: bool) -> Self {
        self.settings.reader_pooling = reader_pooling;
        self
    }

    pub fn with_commit_on_close(mut self, commit_on_close: bool) -> Self {
        self.settings.commit_on_close = commit_on_close;
        self
    }

    pub fn with_max_buffered_docs(mut self, max_buffered_docs: usize) -> Self {
        self.settings.max_buffered_docs = max_buffered_docs;
        self
    }

    pub fn with_max_buffered_delete_terms(mut self, max_buffered_delete_terms: usize) -> Self {
        self.settings.max_buffered_delete_terms = max_buffered_delete_terms;
        self
    }

    pub fn with_keep_fully_deleted_segments(mut self, keep: bool) -> Self {
        self.settings.keep_fully_deleted_segments = keep;
        self
    }

    pub fn with_check_abort_interval_docs(mut self, interval: u64) -> Self {
        self.settings.check_abort_interval_docs = interval;
        self
    }

    pub fn with_merge_policy(mut self, merge_policy: Arc<dyn MergePolicy>) -> Self {
        self.merge_policy = merge_policy;
        self
    }

    pub fn with_merge_scheduler(mut self, merge_scheduler: Arc<dyn MergeScheduler>) -> Self {
        self.merge_scheduler = merge_scheduler;
        self
    }

    /// Write new segments with `codec`; it is also registered for reading.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codecs.register(Arc::clone(&codec));
        self.codec = codec;
        self
    }

    pub fn with_pipeline(mut self, pipeline: Arc<dyn DocumentPipeline>) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Registry used for reading: the extra codecs plus the writing codec.
    pub(crate) fn codec_registry(&self) -> CodecRegistry {
        let mut codecs = self.codecs.clone();
        codecs.register(Arc::clone(&self.codec));
        codecs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = IndexWriterSettings::default();
        assert_eq!(settings.open_mode, OpenMode::CreateOrAppend);
        assert_eq!(settings.gen_lookahead_count, 10);
        assert_eq!(settings.write_lock_name, "write.lock");
        assert!(settings.commit_on_close);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_json() {
        let settings = IndexWriterSettings {
            open_mode: OpenMode::Create,
            max_buffered_docs: 100,
            ..Default::default()
        };
        let json = settings.to_json().unwrap();
        let back = IndexWriterSettings::from_json(&json).unwrap();
        assert_eq!(back.open_mode, OpenMode::Create);
        assert_eq!(back.max_buffered_docs, 100);

        let partial = IndexWriterSettings::from_json(r#"{"reader_pooling": true}"#).unwrap();
        assert!(partial.reader_pooling);
        assert_eq!(partial.gen_lookahead_count, 10);

        assert!(IndexWriterSettings::from_json(r#"{"check_abort_interval_docs": 0}"#).is_err());
    }

    #[test]
    fn test_builder() {
        let config = IndexWriterConfig::default()
            .with_open_mode(OpenMode::Append)
            .with_compound_file(false)
            .with_reader_pooling(true);
        assert_eq!(config.settings.open_mode, OpenMode::Append);
        assert!(!config.settings.use_compound_file);
        assert!(config.settings.reader_pooling);
        assert!(config.codec_registry().get("Simple").is_ok());
    }
}
