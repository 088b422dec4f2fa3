//! Merge coordination: registering merges, running them and committing
//! their result into the catalog.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use parking_lot::MutexGuard;

use crate::error::{QuireError, Result};
use crate::index::codec::{FieldUpdates, MergeSource};
use crate::index::segment::{SegmentCommitInfo, SegmentInfo};
use crate::merge::one_merge::{CheckAbort, MergeReader, OneMerge};
use crate::merge::policy::{MergeContext, MergeTrigger};
use crate::merge::scheduler::MergeProvider;
use crate::util::bits::LiveDocs;
use crate::writer::{CoreState, UNBOUNDED_MAX_MERGE_SEGMENTS, WriterInner};

impl WriterInner {
    /// Ask the policy for merges, then let the scheduler run whatever is
    /// pending.
    pub(crate) fn maybe_merge(
        self: &Arc<Self>,
        trigger: MergeTrigger,
        max_num_segments: i64,
    ) -> Result<()> {
        self.state.ensure_not_closed()?;
        let found = {
            let mut core = self.core.lock();
            self.update_pending_merges(&mut core, trigger, max_num_segments)?
        };
        let provider: Arc<dyn MergeProvider> = self.clone();
        self.config.merge_scheduler.merge(provider, trigger, found)
    }

    pub(crate) fn update_pending_merges(
        &self,
        core: &mut CoreState,
        trigger: MergeTrigger,
        max_num_segments: i64,
    ) -> Result<bool> {
        if core.stop_merges || self.state.is_quarantined() {
            return Ok(false);
        }

        let spec = {
            let ctx = MergeContext::new(
                self.storage.as_ref(),
                &self.reader_pool,
                &core.merging_segments,
            );
            if max_num_segments != UNBOUNDED_MAX_MERGE_SEGMENTS {
                let spec = self.config.merge_policy.find_forced_merges(
                    &core.catalog,
                    max_num_segments as usize,
                    &core.segments_to_merge,
                    &ctx,
                )?;
                if let Some(spec) = &spec {
                    for merge in &spec.merges {
                        merge.state().max_num_segments = max_num_segments;
                    }
                }
                spec
            } else {
                self.config
                    .merge_policy
                    .find_merges(trigger, &core.catalog, &ctx)?
            }
        };

        let Some(spec) = spec else {
            return Ok(false);
        };
        debug!("merge policy found {} merges ({trigger:?})", spec.len());
        for merge in &spec.merges {
            self.register_merge(core, merge)?;
        }
        Ok(!spec.is_empty())
    }

    /// Make `merge` pending, marking its segments as merging.
    pub(crate) fn register_merge(&self, core: &mut CoreState, merge: &Arc<OneMerge>) -> Result<bool> {
        if merge.is_registered() {
            return Ok(true);
        }
        if core.stop_merges {
            merge.abort();
            return Err(QuireError::merge_aborted(format!("merge is aborted: {merge}")));
        }

        let names = merge.segment_names();
        if names.is_empty() {
            return Ok(false);
        }
        let mut current = Vec::with_capacity(names.len());
        for name in &names {
            if core.merging_segments.contains(name) {
                debug!("reject merge {merge}: segment {name} is already merging");
                return Ok(false);
            }
            let Some(record) = core.catalog.get(name) else {
                debug!("reject merge {merge}: segment {name} is not in the catalog");
                return Ok(false);
            };
            current.push(record.clone());
        }

        let mut estimated = 0u64;
        let mut total = 0u64;
        for record in &current {
            if record.doc_count() == 0 {
                continue;
            }
            let bytes = record.size_in_bytes(self.storage.as_ref())?;
            let del_ratio = (self.reader_pool.num_deleted_docs(record) as f64
                / record.doc_count() as f64)
                .min(1.0);
            estimated += (bytes as f64 * (1.0 - del_ratio)) as u64;
            total += bytes;
        }
        let forced = current
            .iter()
            .any(|record| core.segments_to_merge.contains_key(record.name()));

        {
            let mut state = merge.state();
            state.segments = current;
            if forced {
                state.max_num_segments = core.merge_max_num_segments;
            }
            state.merge_gen = core.merge_gen;
            state.estimated_merge_bytes = estimated;
            state.total_merge_bytes = total;
            state.register_done = true;
        }
        core.merging_segments.extend(names);
        core.pending_merges.push_back(Arc::clone(merge));
        debug!("registered merge {merge} ({estimated} bytes estimated)");
        Ok(true)
    }

    pub(crate) fn next_pending_merge(&self) -> Option<Arc<OneMerge>> {
        let mut core = self.core.lock();
        let merge = core.pending_merges.pop_front()?;
        core.running_merges.push(Arc::clone(&merge));
        Some(merge)
    }

    pub(crate) fn abort_merge(&self, merge: &Arc<OneMerge>) {
        merge.abort();
        let mut core = self.core.lock();
        if let Some(pos) = core.pending_merges.iter().position(|m| Arc::ptr_eq(m, merge)) {
            core.pending_merges.remove(pos);
            self.merge_finish(&mut core, merge);
            debug!("dropped pending merge {merge}");
        }
    }

    /// Abort every merge and wait until running ones have noticed.
    pub(crate) fn abort_merges(&self, core: &mut MutexGuard<'_, CoreState>) {
        core.stop_merges = true;
        let pending: Vec<Arc<OneMerge>> = core.pending_merges.drain(..).collect();
        for merge in &pending {
            debug!("abort pending merge {merge}");
            merge.abort();
            self.merge_finish(core, merge);
        }
        for merge in &core.running_merges {
            debug!("abort running merge {merge}");
            merge.abort();
        }
        while !core.running_merges.is_empty() {
            debug!("wait for {} running merges to abort", core.running_merges.len());
            self.do_wait(core);
        }
        core.stop_merges = false;
        self.merge_cond.notify_all();
    }

    pub(crate) fn wait_for_merges(self: &Arc<Self>) -> Result<()> {
        self.state.ensure_not_closed()?;
        let provider: Arc<dyn MergeProvider> = self.clone();
        self.config
            .merge_scheduler
            .merge(provider, MergeTrigger::Closing, false)?;

        let mut core = self.core.lock();
        while !core.pending_merges.is_empty() || !core.running_merges.is_empty() {
            self.do_wait(&mut core);
        }
        debug!("wait_for_merges: done");
        Ok(())
    }

    pub(crate) fn force_merge(self: &Arc<Self>, max_num_segments: usize, do_wait: bool) -> Result<()> {
        self.state.ensure_open()?;
        if max_num_segments < 1 {
            return Err(QuireError::invalid_argument(format!(
                "max_num_segments must be >= 1; got {max_num_segments}"
            )));
        }
        info!("force_merge: max_num_segments={max_num_segments}");
        self.flush(true, true)?;

        let max = max_num_segments as i64;
        {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            core.merge_gen += 1;
            core.merge_exceptions.clear();
            core.segments_to_merge = core
                .catalog
                .segments()
                .iter()
                .map(|record| (record.name().to_string(), true))
                .collect();
            core.merge_max_num_segments = max;

            // Merges already underway count towards the target.
            for merge in core.pending_merges.iter().chain(core.running_merges.iter()) {
                merge.state().max_num_segments = max;
                if let Some(name) = merge.merged_name() {
                    core.segments_to_merge.insert(name, true);
                }
            }
        }

        self.maybe_merge(MergeTrigger::Explicit, max)?;

        if do_wait {
            let mut core = self.core.lock();
            loop {
                if self.state.is_quarantined() {
                    return Err(QuireError::quarantined(
                        "this writer hit an out-of-memory error; cannot complete force_merge",
                    ));
                }
                if let Some(e) = forced_merge_error(&core, |merge| {
                    merge.max_num_segments() != UNBOUNDED_MAX_MERGE_SEGMENTS
                }) {
                    return Err(e);
                }
                let waiting = core
                    .pending_merges
                    .iter()
                    .chain(core.running_merges.iter())
                    .any(|merge| merge.max_num_segments() != UNBOUNDED_MAX_MERGE_SEGMENTS);
                if !waiting {
                    break;
                }
                self.do_wait(&mut core);
            }
            drop(core);
            self.state.ensure_not_closed()?;
        }
        Ok(())
    }

    pub(crate) fn force_merge_deletes(self: &Arc<Self>, do_wait: bool) -> Result<()> {
        self.state.ensure_open()?;
        self.flush(true, true)?;
        info!("force_merge_deletes");

        let spec = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let spec = {
                let ctx = MergeContext::new(
                    self.storage.as_ref(),
                    &self.reader_pool,
                    &core.merging_segments,
                );
                self.config
                    .merge_policy
                    .find_forced_deletes_merges(&core.catalog, &ctx)?
            };
            if let Some(spec) = &spec {
                for merge in &spec.merges {
                    self.register_merge(core, merge)?;
                }
            }
            spec
        };

        let provider: Arc<dyn MergeProvider> = self.clone();
        self.config
            .merge_scheduler
            .merge(provider, MergeTrigger::Explicit, spec.is_some())?;

        let Some(spec) = spec else {
            return Ok(());
        };
        if !do_wait {
            return Ok(());
        }

        let mut core = self.core.lock();
        loop {
            if self.state.is_quarantined() {
                return Err(QuireError::quarantined(
                    "this writer hit an out-of-memory error; cannot complete force_merge_deletes",
                ));
            }
            if let Some(e) = forced_merge_error(&core, |merge| {
                spec.merges.iter().any(|m| std::ptr::eq(m.as_ref(), merge))
            }) {
                return Err(e);
            }
            let waiting = spec.merges.iter().any(|merge| {
                core.pending_merges
                    .iter()
                    .chain(core.running_merges.iter())
                    .any(|m| Arc::ptr_eq(m, merge))
            });
            if !waiting {
                break;
            }
            self.do_wait(&mut core);
        }
        Ok(())
    }

    /// Run `merge`, which must already be running, on this thread.
    pub(crate) fn merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
        let started = Instant::now();
        let outcome = self.merge_init(merge).and_then(|()| {
            debug!("now merge {merge}");
            self.merge_middle(merge)
        });

        let mut guard = self.core.lock();
        let core = &mut *guard;
        if let Err(e) = &outcome {
            // Recorded before the merge finishes so waiters see it.
            merge.set_exception(e);
            let merge_gen = merge.state().merge_gen;
            if merge_gen == core.merge_gen
                && !core.merge_exceptions.iter().any(|m| Arc::ptr_eq(m, merge))
            {
                core.merge_exceptions.push(Arc::clone(merge));
            }
            if let Some(name) = merge.merged_name() {
                if !core.catalog.contains(&name) {
                    if let Err(refresh_error) = core.deleter.refresh(Some(&name)) {
                        warn!("cleanup of failed merge segment {name} failed: {refresh_error}");
                    }
                }
            }
        }
        self.merge_finish(core, merge);

        let mut result = outcome;
        if result.is_ok()
            && !merge.is_aborted()
            && (merge.max_num_segments() != UNBOUNDED_MAX_MERGE_SEGMENTS || !core.closing)
        {
            result = self
                .update_pending_merges(core, MergeTrigger::MergeFinished, merge.max_num_segments())
                .map(|_| ());
        }
        drop(guard);

        match result {
            Ok(()) => {
                debug!("merge {merge} took {:?}", started.elapsed());
                Ok(())
            }
            Err(e) if e.is_merge_aborted() => {
                debug!("merge aborted: {merge}");
                Ok(())
            }
            Err(e) => self.handle_oom(Err(e), "merge"),
        }
    }

    /// Apply pending deletes to the sources and bind the merged segment's
    /// name.
    fn merge_init(&self, merge: &Arc<OneMerge>) -> Result<()> {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        if self.state.is_quarantined() {
            return Err(QuireError::quarantined(
                "this writer hit an out-of-memory error; cannot merge",
            ));
        }
        if merge.info().is_some() || merge.is_aborted() {
            return Ok(());
        }

        let names = merge.segment_names();
        let applied =
            self.updates_stream
                .apply_deletes_and_updates(&self.reader_pool, &mut core.catalog, &names)?;
        if applied.any_deletes || applied.files_changed {
            core.checkpoint()?;
        }

        if !self.config.settings.keep_fully_deleted_segments && !applied.all_deleted.is_empty() {
            {
                let mut state = merge.state();
                for name in &applied.all_deleted {
                    debug!("drop segment {name} before merging: every document is deleted");
                    core.catalog.remove(name);
                    core.merging_segments.remove(name);
                    state.segments.retain(|record| record.name() != name);
                    self.reader_pool.drop_segment(name);
                }
            }
            core.checkpoint()?;
        }

        let merge_factor = merge.segment_names().len();
        let merged_name = core.new_segment_name();
        let info = SegmentInfo::new(merged_name, 0, self.config.codec.name())
            .with_diagnostic("source", "merge")
            .with_diagnostic("merge_factor", merge_factor.to_string())
            .with_diagnostic("merge_max_num_segments", merge.max_num_segments().to_string());
        merge.state().info = Some(SegmentCommitInfo::fresh(info));

        self.updates_stream.prune(&core.catalog);
        debug!("merge init: {merge}");
        Ok(())
    }

    fn merge_middle(&self, merge: &Arc<OneMerge>) -> Result<()> {
        let result = self.merge_middle_inner(merge);
        if result.is_err() {
            // Deletes that arrived meanwhile stay with the sources.
            let mut core = self.core.lock();
            if self.close_merge_readers(&mut core, merge, false) {
                if let Err(e) = core.checkpoint_files() {
                    warn!("checkpoint after failed merge failed: {e}");
                }
            }
        }
        result
    }

    fn merge_middle_inner(&self, merge: &Arc<OneMerge>) -> Result<()> {
        merge.check_aborted()?;
        let Some(mut merged) = merge.info() else {
            return Err(QuireError::merge(format!("merge was not initialised: {merge}")));
        };
        let merged_name = merged.name().to_string();

        for name in merge.segment_names() {
            self.open_merge_reader(merge, &name)?;
        }
        merge.check_aborted()?;

        let sources: Vec<MergeSource> = merge
            .state()
            .readers
            .iter()
            .map(|reader| MergeSource {
                reader: Arc::clone(&reader.reader),
                live_docs: Some(reader.live_docs.clone()),
            })
            .collect();

        let codec = &self.config.codec;
        let written = {
            let mut check_abort =
                CheckAbort::new(merge, self.config.settings.check_abort_interval_docs);
            codec.merge(
                self.storage.as_ref(),
                &merged_name,
                &sources,
                &mut |units| check_abort.work(units),
            )
        };
        let written = match written {
            Ok(written) => written,
            Err(e) => {
                self.delete_merge_leftovers(&merged_name);
                return Err(e);
            }
        };
        debug!("merged {} docs into {merged_name}", written.doc_count);

        let mut info = (**merged.info())
            .clone()
            .with_doc_count(written.doc_count)
            .with_files(written.files);

        let use_compound_file = {
            let core = self.core.lock();
            let ctx = MergeContext::new(
                self.storage.as_ref(),
                &self.reader_pool,
                &core.merging_segments,
            );
            let candidate = SegmentCommitInfo::fresh(info.clone());
            self.config
                .merge_policy
                .use_compound_file(&core.catalog, &candidate, &ctx)?
        };

        if use_compound_file {
            let original = info.files.clone();
            let compound = codec.write_compound_file(self.storage.as_ref(), &merged_name, &original);
            let mut core = self.core.lock();
            match compound {
                Ok(files) => {
                    core.deleter.delete_new_files(&original);
                    if merge.is_aborted() {
                        core.deleter.delete_new_files(&files);
                        return Err(QuireError::merge_aborted(format!(
                            "merge is aborted: {merge}"
                        )));
                    }
                    info = info.with_files(files).with_compound_file(true);
                }
                Err(e) => {
                    if let Err(refresh_error) = core.deleter.refresh(Some(&merged_name)) {
                        warn!("cleanup of {merged_name} failed: {refresh_error}");
                    }
                    if merge.is_aborted() {
                        return Err(QuireError::merge_aborted(format!(
                            "merge is aborted: {merge}"
                        )));
                    }
                    return Err(e);
                }
            }
        }

        if let Err(e) = codec.write_segment_info(self.storage.as_ref(), &mut info) {
            let mut core = self.core.lock();
            core.deleter.delete_new_files(&info.files);
            drop(core);
            self.delete_merge_leftovers(&merged_name);
            return Err(e);
        }

        merged.set_info(Arc::new(info));
        merge.state().info = Some(merged);

        let mut core = self.core.lock();
        self.commit_merge(&mut core, merge)?;
        Ok(())
    }

    /// Pull reader and live-docs snapshot of source `name`, keeping a pool
    /// reference until the merge closes its readers.
    fn open_merge_reader(&self, merge: &Arc<OneMerge>, name: &str) -> Result<()> {
        let mut core = self.core.lock();
        let Some(record) = core.catalog.get(name).cloned() else {
            return Err(QuireError::merge(format!(
                "segment {name} left the catalog while merging"
            )));
        };
        self.reader_pool.get(&record, true)?;

        let opened = self.reader_pool.with(name, |rld| {
            let pending = rld.pending_delete_count();
            rld.reader_for_merge(&record)
                .map(|(reader, live_docs)| (reader, live_docs, pending))
        });
        let opened = match opened {
            Some(opened) => opened,
            None => Err(QuireError::other(format!("reader state for {name} vanished"))),
        };

        match opened {
            Ok((reader, live_docs, pending)) => {
                merge.state().readers.push(MergeReader {
                    segment: name.to_string(),
                    reader,
                    live_docs,
                    del_count: record.del_count() + pending,
                });
                Ok(())
            }
            Err(e) => {
                self.reader_pool.with(name, |rld| rld.drop_merging_updates());
                match self.reader_pool.release(name, core.catalog.get_mut(name)) {
                    Ok(true) => core.checkpoint_files()?,
                    Ok(false) => {}
                    Err(release_error) => warn!("release of {name} failed: {release_error}"),
                }
                Err(e)
            }
        }
    }

    fn delete_merge_leftovers(&self, merged_name: &str) {
        let mut core = self.core.lock();
        if let Err(e) = core.deleter.refresh(Some(merged_name)) {
            warn!("cleanup of {merged_name} failed: {e}");
        }
    }

    /// Swap the merged segment in for its sources.
    ///
    /// Returns false when the merge was aborted meanwhile and its output
    /// discarded.
    fn commit_merge(&self, core: &mut CoreState, merge: &Arc<OneMerge>) -> Result<bool> {
        if self.state.is_quarantined() {
            return Err(QuireError::quarantined(
                "this writer hit an out-of-memory error; cannot complete merge",
            ));
        }
        let Some(mut merged) = merge.info() else {
            return Err(QuireError::merge(format!("merge was not initialised: {merge}")));
        };
        let merged_name = merged.name().to_string();
        debug!("commit merge: {merge}");

        if merge.is_aborted() {
            debug!("commit merge: skip, merge was aborted");
            self.reader_pool.drop_segment(&merged_name);
            core.deleter.delete_new_files(&merged.files());
            return Ok(false);
        }

        let has_state = if merged.doc_count() == 0 {
            false
        } else {
            match self.commit_merged_deletes_and_updates(core, merge, &mut merged) {
                Ok(has_state) => has_state,
                Err(e) => {
                    self.reader_pool.drop_segment(&merged_name);
                    core.deleter.delete_new_files(&merged.files());
                    return Err(e);
                }
            }
        };

        let pending = if has_state {
            self.reader_pool
                .with(&merged_name, |rld| rld.pending_delete_count())
                .unwrap_or(0)
        } else {
            0
        };
        let sources: BTreeSet<String> = merge.segment_names().into_iter().collect();
        let all_deleted =
            sources.is_empty() || merged.doc_count() == 0 || pending >= merged.doc_count();
        let drop_segment = all_deleted && !self.config.settings.keep_fully_deleted_segments;

        if has_state {
            if drop_segment {
                self.reader_pool.with(&merged_name, |rld| rld.drop_changes());
            }
            if let Err(e) = self.reader_pool.release(&merged_name, Some(&mut merged)) {
                self.reader_pool.drop_segment(&merged_name);
                core.deleter.delete_new_files(&merged.files());
                return Err(e);
            }
        }

        if all_deleted {
            debug!(
                "merged segment {merged_name} is fully deleted{}",
                if drop_segment { "; not adding it" } else { "" }
            );
        }
        core.catalog
            .apply_merge_changes(&sources, merged.clone(), drop_segment);
        if drop_segment {
            self.reader_pool.drop_segment(&merged_name);
            core.deleter.delete_new_files(&merged.files());
        }

        self.close_merge_readers(core, merge, true);
        core.checkpoint()?;

        if merge.max_num_segments() != UNBOUNDED_MAX_MERGE_SEGMENTS && !drop_segment {
            // Cascading forced merges may pick it up again.
            core.segments_to_merge
                .entry(merged_name.clone())
                .or_insert(false);
        }

        info!(
            "merged {} segments into {merged_name} ({} docs)",
            sources.len(),
            merged.doc_count()
        );
        merge.state().info = Some(merged);
        Ok(true)
    }

    /// Carry deletes and doc-values updates that reached the sources while
    /// the merge ran over to the merged segment.
    ///
    /// Returns whether the merged segment now has pool state.
    fn commit_merged_deletes_and_updates(
        &self,
        core: &mut CoreState,
        merge: &Arc<OneMerge>,
        merged: &mut SegmentCommitInfo,
    ) -> Result<bool> {
        let readers: Vec<(String, LiveDocs)> = merge
            .state()
            .readers
            .iter()
            .map(|reader| (reader.segment.clone(), reader.live_docs.clone()))
            .collect();
        let merged_name = merged.name().to_string();

        let mut has_state = false;
        let mut carried_deletes = 0;
        let mut merged_updates = FieldUpdates::new();
        let mut min_gen = i64::MAX;
        let mut doc_upto = 0;

        for (segment, before) in &readers {
            if let Some(record) = core.catalog.get(segment) {
                min_gen = min_gen.min(record.buffered_deletes_gen());
            }
            let (current, updates) = self
                .reader_pool
                .with(segment, |rld| {
                    (rld.live_docs().cloned(), rld.merging_updates().clone())
                })
                .unwrap_or_else(|| (None, FieldUpdates::new()));

            for doc in 0..before.len() {
                if !before.is_live(doc) {
                    continue;
                }
                if current.as_ref().is_some_and(|live| !live.is_live(doc)) {
                    if !has_state {
                        self.reader_pool.get(merged, true)?;
                        has_state = true;
                        self.reader_pool
                            .with(&merged_name, |rld| rld.init_writable_live_docs(merged))
                            .transpose()?;
                    }
                    self.reader_pool
                        .with(&merged_name, |rld| rld.delete(merged, doc_upto))
                        .transpose()?;
                    carried_deletes += 1;
                } else if !updates.is_empty() {
                    for field in updates.fields() {
                        if let Some(value) = updates.get(field, doc) {
                            merged_updates.add(field, doc_upto, value.clone());
                        }
                    }
                }
                doc_upto += 1;
            }
        }
        debug_assert_eq!(doc_upto, merged.doc_count());

        if !merged_updates.is_empty() {
            if !has_state {
                self.reader_pool.get(merged, true)?;
                has_state = true;
            }
            self.reader_pool
                .with(&merged_name, |rld| rld.write_field_updates(merged, &merged_updates))
                .transpose()?;
        }
        if min_gen != i64::MAX {
            merged.set_buffered_deletes_gen(min_gen);
        }
        if has_state {
            debug!(
                "carried {carried_deletes} deletes and {} updates into {merged_name}",
                merged_updates.len()
            );
        }
        Ok(has_state)
    }

    /// Give back the pool references the merge took on its sources.
    ///
    /// With `drop_changes` the sources are gone and their pending changes
    /// are discarded. Returns true when a live-docs file was written.
    fn close_merge_readers(&self, core: &mut CoreState, merge: &Arc<OneMerge>, drop_changes: bool) -> bool {
        let readers = std::mem::take(&mut merge.state().readers);
        let mut written = false;
        for reader in readers {
            let name = reader.segment;
            self.reader_pool.with(&name, |rld| {
                if drop_changes {
                    rld.drop_changes();
                }
                rld.drop_merging_updates();
            });
            match self.reader_pool.release(&name, core.catalog.get_mut(&name)) {
                Ok(w) => written |= w,
                Err(e) => warn!("release of {name} after merge failed: {e}"),
            }
            if drop_changes {
                self.reader_pool.drop_segment(&name);
            }
        }
        written
    }

    /// Bookkeeping once a merge is done, whatever the outcome.
    pub(crate) fn merge_finish(&self, core: &mut CoreState, merge: &Arc<OneMerge>) {
        self.merge_cond.notify_all();
        {
            let mut state = merge.state();
            if state.register_done {
                for record in &state.segments {
                    core.merging_segments.remove(record.name());
                }
                state.register_done = false;
            }
        }
        core.running_merges.retain(|m| !Arc::ptr_eq(m, merge));
    }
}

/// First non-abort failure among the recorded merge failures `wanted`
/// selects.
fn forced_merge_error(core: &CoreState, wanted: impl Fn(&OneMerge) -> bool) -> Option<QuireError> {
    core.merge_exceptions
        .iter()
        .filter(|merge| wanted(merge))
        .find_map(|merge| {
            merge
                .exception()
                .filter(|e| !e.is_merge_aborted())
                .map(|e| QuireError::merge(format!("background merge hit exception: {merge}: {e}")))
        })
}

impl MergeProvider for WriterInner {
    fn next_merge(&self) -> Option<Arc<OneMerge>> {
        self.next_pending_merge()
    }

    fn has_pending_merges(&self) -> bool {
        !self.core.lock().pending_merges.is_empty()
    }

    fn merge_count(&self) -> usize {
        let core = self.core.lock();
        core.pending_merges.len() + core.running_merges.len()
    }

    fn run_merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
        self.merge(merge)
    }
}
