//! Ordered stream of frozen delete and update packets.
//!
//! Every packet gets a generation when it enters the stream, and every
//! segment remembers the generation of the newest packet already applied to
//! it (`buffered_deletes_gen`). Applying walks segments and packets from the
//! newest down: packets newer than a segment are coalesced and applied to it,
//! a segment-private packet only ever touches its own segment. Packets that
//! every segment has seen are pruned.

use std::fmt;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::error::Result;
use crate::index::buffered_updates::{FrozenBufferedUpdates, MAX_DOC_ID, QueryAndLimit};
use crate::index::catalog::SegmentCatalog;
use crate::index::codec::{FieldUpdates, SegmentReader};
use crate::index::reader_pool::ReaderPool;
use crate::index::readers::ReadersAndUpdates;
use crate::index::segment::SegmentCommitInfo;
use crate::index::term::{DocValuesUpdate, Term};

/// Outcome of [`BufferedUpdatesStream::apply_deletes_and_updates`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyDeletesResult {
    /// Whether any document was newly deleted.
    pub any_deletes: bool,
    /// Whether live-docs or updates files were written.
    pub files_changed: bool,
    /// Generation stamped on every segment that was visited.
    pub generation: i64,
    /// Segments whose every document is now deleted.
    pub all_deleted: Vec<String>,
}

struct StreamState {
    updates: Vec<FrozenBufferedUpdates>,
    next_gen: i64,
    num_terms: usize,
    bytes_used: usize,
}

/// Packets waiting to be applied, oldest first.
pub struct BufferedUpdatesStream {
    state: Mutex<StreamState>,
}

impl fmt::Debug for BufferedUpdatesStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BufferedUpdatesStream")
            .field("packets", &state.updates.len())
            .field("next_gen", &state.next_gen)
            .field("num_terms", &state.num_terms)
            .field("bytes_used", &state.bytes_used)
            .finish()
    }
}

impl Default for BufferedUpdatesStream {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferedUpdatesStream {
    pub fn new() -> Self {
        BufferedUpdatesStream {
            state: Mutex::new(StreamState {
                updates: Vec::new(),
                // Segments start at 0; the first packet must be newer.
                next_gen: 1,
                num_terms: 0,
                bytes_used: 0,
            }),
        }
    }

    /// Append `packet`, returning the generation it was given.
    pub fn push(&self, mut packet: FrozenBufferedUpdates) -> i64 {
        let mut state = self.state.lock();
        let generation = state.next_gen;
        state.next_gen += 1;
        packet.set_del_gen(generation);
        debug_assert!(
            state
                .updates
                .last()
                .is_none_or(|last| last.del_gen() < packet.del_gen()),
            "packets must arrive in generation order"
        );

        state.num_terms += packet.num_term_deletes();
        state.bytes_used += packet.bytes_used();
        debug!(
            "push deletes {packet} segmentPrivate={} packetCount={}",
            packet.is_segment_private(),
            state.updates.len() + 1
        );
        state.updates.push(packet);
        generation
    }

    /// Take a generation without pushing anything.
    ///
    /// A segment flushed without deletes of its own still needs one so that
    /// packets pushed before it are not applied to it.
    pub fn next_gen(&self) -> i64 {
        let mut state = self.state.lock();
        let generation = state.next_gen;
        state.next_gen += 1;
        generation
    }

    /// Drop every packet.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.updates.clear();
        state.num_terms = 0;
        state.bytes_used = 0;
    }

    pub fn any(&self) -> bool {
        self.state.lock().bytes_used != 0
    }

    pub fn num_terms(&self) -> usize {
        self.state.lock().num_terms
    }

    pub fn bytes_used(&self) -> usize {
        self.state.lock().bytes_used
    }

    pub fn packet_count(&self) -> usize {
        self.state.lock().updates.len()
    }

    /// Apply every pending packet to the catalog segments named in `segments`.
    pub fn apply_deletes_and_updates(
        &self,
        pool: &ReaderPool,
        catalog: &mut SegmentCatalog,
        segments: &[String],
    ) -> Result<ApplyDeletesResult> {
        let mut state = self.state.lock();

        if segments.is_empty() || state.bytes_used == 0 {
            let generation = state.next_gen;
            state.next_gen += 1;
            return Ok(ApplyDeletesResult {
                any_deletes: false,
                files_changed: false,
                generation,
                all_deleted: Vec::new(),
            });
        }

        debug!(
            "apply_deletes: {} packets, {} segments",
            state.updates.len(),
            segments.len()
        );

        let generation = state.next_gen;
        state.next_gen += 1;

        let mut infos: Vec<(String, i64)> = segments
            .iter()
            .filter_map(|name| {
                catalog
                    .get(name)
                    .map(|r| (name.clone(), r.buffered_deletes_gen()))
            })
            .collect();
        infos.sort_by_key(|(_, g)| *g);

        let mut coalesced: Option<CoalescedUpdates> = None;
        let mut any_deletes = false;
        let mut files_changed = false;
        let mut all_deleted = Vec::new();

        let mut infos_idx = infos.len();
        let mut del_idx = state.updates.len();

        while infos_idx > 0 {
            let (name, seg_gen) = &infos[infos_idx - 1];
            let packet = if del_idx > 0 {
                Some(&state.updates[del_idx - 1])
            } else {
                None
            };

            match packet {
                Some(packet) if *seg_gen < packet.del_gen() => {
                    if !packet.is_segment_private() && packet.any() {
                        coalesced.get_or_insert_with(CoalescedUpdates::default).update(packet);
                    }
                    del_idx -= 1;
                }
                Some(packet) if *seg_gen == packet.del_gen() => {
                    debug_assert!(packet.is_segment_private(), "shared packet at a segment's generation");
                    let Some(record) = catalog.get_mut(name) else {
                        del_idx -= 1;
                        infos_idx -= 1;
                        continue;
                    };
                    let (outcome, written) = pool.with_handle(record, |rld, record| {
                        let reader = rld.get_reader(record)?;
                        rld.init_writable_live_docs(record)?;
                        let mut field_updates = FieldUpdates::new();
                        let mut del_count =
                            apply_query_deletes(packet.queries().iter(), rld, record, reader.as_ref())?;
                        apply_doc_values_updates(
                            packet.numeric_updates().iter().chain(packet.binary_updates()),
                            rld,
                            reader.as_ref(),
                            &mut field_updates,
                        );
                        if let Some(coalesced) = &coalesced {
                            del_count += coalesced.apply(rld, record, reader.as_ref(), &mut field_updates)?;
                        }
                        finish_segment(rld, record, del_count, &field_updates)
                    })?;
                    any_deletes |= outcome.del_count > 0;
                    files_changed |= written || outcome.updates_written;
                    if outcome.all_deleted {
                        all_deleted.push(name.clone());
                    }
                    debug!(
                        "seg={} segGen={seg_gen} segDeletes=[{packet}]; coalesced deletes=[{}] newDelCount={}{}",
                        record,
                        coalesced.as_ref().map(|c| c.to_string()).unwrap_or_default(),
                        outcome.del_count,
                        if outcome.all_deleted { " 100% deleted" } else { "" }
                    );

                    // Private packets are never coalesced into older segments.
                    coalesced.get_or_insert_with(CoalescedUpdates::default);
                    record.set_buffered_deletes_gen(generation);
                    del_idx -= 1;
                    infos_idx -= 1;
                }
                _ => {
                    let Some(record) = catalog.get_mut(name) else {
                        infos_idx -= 1;
                        continue;
                    };
                    if let Some(coalesced) = &coalesced {
                        let (outcome, written) = pool.with_handle(record, |rld, record| {
                            let reader = rld.get_reader(record)?;
                            rld.init_writable_live_docs(record)?;
                            let mut field_updates = FieldUpdates::new();
                            let del_count =
                                coalesced.apply(rld, record, reader.as_ref(), &mut field_updates)?;
                            finish_segment(rld, record, del_count, &field_updates)
                        })?;
                        any_deletes |= outcome.del_count > 0;
                        files_changed |= written || outcome.updates_written;
                        if outcome.all_deleted {
                            all_deleted.push(name.clone());
                        }
                        debug!(
                            "seg={} segGen={seg_gen} coalesced deletes=[{coalesced}] newDelCount={}{}",
                            record,
                            outcome.del_count,
                            if outcome.all_deleted { " 100% deleted" } else { "" }
                        );
                    }
                    record.set_buffered_deletes_gen(generation);
                    infos_idx -= 1;
                }
            }
        }

        debug!("apply_deletes took gen={generation} any_deletes={any_deletes}");
        Ok(ApplyDeletesResult {
            any_deletes,
            files_changed,
            generation,
            all_deleted,
        })
    }

    /// Drop packets that every catalog segment has already seen.
    pub fn prune(&self, catalog: &SegmentCatalog) {
        let min_gen = catalog
            .segments()
            .iter()
            .map(SegmentCommitInfo::buffered_deletes_gen)
            .min()
            .unwrap_or(i64::MAX);

        let mut state = self.state.lock();
        let count = state
            .updates
            .iter()
            .position(|packet| packet.del_gen() >= min_gen)
            .unwrap_or(state.updates.len());
        if count == 0 {
            return;
        }

        debug!(
            "prune_deletes: prune {count} packets; {} packets remain",
            state.updates.len() - count
        );
        let pruned: Vec<FrozenBufferedUpdates> = state.updates.drain(..count).collect();
        for packet in pruned {
            state.num_terms -= packet.num_term_deletes();
            state.bytes_used -= packet.bytes_used();
        }
    }
}

struct SegmentOutcome {
    del_count: usize,
    updates_written: bool,
    all_deleted: bool,
}

fn finish_segment(
    rld: &mut ReadersAndUpdates,
    record: &mut SegmentCommitInfo,
    del_count: usize,
    field_updates: &FieldUpdates,
) -> Result<SegmentOutcome> {
    let updates_written = !field_updates.is_empty();
    if updates_written {
        rld.write_field_updates(record, field_updates)?;
    }
    let all_deleted = record.del_count() + rld.pending_delete_count() == record.doc_count();
    Ok(SegmentOutcome {
        del_count,
        updates_written,
        all_deleted,
    })
}

/// Packets newer than the segment being visited, merged together.
#[derive(Default)]
struct CoalescedUpdates {
    terms: Vec<Term>,
    queries: Vec<QueryAndLimit>,
    /// Oldest first, so later updates win.
    updates: Vec<DocValuesUpdate>,
}

impl fmt::Display for CoalescedUpdates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "terms={} queries={} updates={}",
            self.terms.len(),
            self.queries.len(),
            self.updates.len()
        )
    }
}

impl CoalescedUpdates {
    /// Add `packet`, which is older than every packet added so far.
    ///
    /// Everything in it applies to whole segments: those segments were
    /// flushed before the packet was pushed.
    fn update(&mut self, packet: &FrozenBufferedUpdates) {
        self.terms.extend(packet.terms().iter().cloned());
        self.queries.extend(packet.queries().iter().map(|q| QueryAndLimit {
            query: Arc::clone(&q.query),
            limit: MAX_DOC_ID,
        }));
        let mut older: Vec<DocValuesUpdate> = packet
            .numeric_updates()
            .iter()
            .chain(packet.binary_updates())
            .map(|u| u.with_limit(MAX_DOC_ID))
            .collect();
        older.append(&mut self.updates);
        self.updates = older;
    }

    fn apply(
        &self,
        rld: &mut ReadersAndUpdates,
        record: &SegmentCommitInfo,
        reader: &dyn SegmentReader,
        field_updates: &mut FieldUpdates,
    ) -> Result<usize> {
        let mut del_count = apply_term_deletes(self.terms.iter(), rld, record, reader)?;
        del_count += apply_query_deletes(self.queries.iter(), rld, record, reader)?;
        apply_doc_values_updates(self.updates.iter(), rld, reader, field_updates);
        Ok(del_count)
    }
}

fn apply_term_deletes<'a>(
    terms: impl Iterator<Item = &'a Term>,
    rld: &mut ReadersAndUpdates,
    record: &SegmentCommitInfo,
    reader: &dyn SegmentReader,
) -> Result<usize> {
    let mut del_count = 0;
    for term in terms {
        for doc in reader.docs_for_term(term) {
            if rld.delete(record, doc)? {
                del_count += 1;
            }
        }
    }
    Ok(del_count)
}

fn apply_query_deletes<'a>(
    queries: impl Iterator<Item = &'a QueryAndLimit>,
    rld: &mut ReadersAndUpdates,
    record: &SegmentCommitInfo,
    reader: &dyn SegmentReader,
) -> Result<usize> {
    let mut del_count = 0;
    for query in queries {
        for doc in query.query.matching_docs(reader)? {
            if doc >= query.limit {
                break;
            }
            if rld.delete(record, doc)? {
                del_count += 1;
            }
        }
    }
    Ok(del_count)
}

fn apply_doc_values_updates<'a>(
    updates: impl Iterator<Item = &'a DocValuesUpdate>,
    rld: &ReadersAndUpdates,
    reader: &dyn SegmentReader,
    field_updates: &mut FieldUpdates,
) {
    for update in updates {
        for doc in reader.docs_for_term(&update.term) {
            if doc >= update.doc_id_upto {
                break;
            }
            if rld.live_docs().is_some_and(|live| !live.is_live(doc)) {
                continue;
            }
            field_updates.add(&update.field, doc, update.value.clone());
        }
    }
}
