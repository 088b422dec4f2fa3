//! Accumulated deletes and doc-values updates.
//!
//! [`BufferedUpdates`] gathers operations between two flushes, each tagged
//! with the document id ceiling it applies below. Once handed to the
//! [`BufferedUpdatesStream`](crate::index::updates_stream::BufferedUpdatesStream)
//! it is frozen into an immutable [`FrozenBufferedUpdates`] packet.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::index::term::{DeleteQuery, DocValuesType, DocValuesUpdate, Term};

/// Ceiling meaning "every document of the segment".
pub const MAX_DOC_ID: usize = usize::MAX;

const QUERY_BYTES: usize = 64;

/// A delete query plus the document id ceiling it applies below.
#[derive(Debug, Clone)]
pub struct QueryAndLimit {
    pub query: Arc<dyn DeleteQuery>,
    pub limit: usize,
}

/// Mutable accumulator of deletes and updates.
#[derive(Default)]
pub struct BufferedUpdates {
    terms: BTreeMap<Term, usize>,
    queries: Vec<QueryAndLimit>,
    numeric_updates: BTreeMap<String, Vec<DocValuesUpdate>>,
    binary_updates: BTreeMap<String, Vec<DocValuesUpdate>>,
    num_term_deletes: usize,
    bytes_used: usize,
}

impl fmt::Debug for BufferedUpdates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedUpdates")
            .field("terms", &self.terms.len())
            .field("queries", &self.queries.len())
            .field("numeric_updates", &count(&self.numeric_updates))
            .field("binary_updates", &count(&self.binary_updates))
            .field("bytes_used", &self.bytes_used)
            .finish()
    }
}

fn count(updates: &BTreeMap<String, Vec<DocValuesUpdate>>) -> usize {
    updates.values().map(Vec::len).sum()
}

impl BufferedUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete documents containing `term` below `doc_id_upto`.
    ///
    /// A lower ceiling never replaces a higher one: two threads replacing
    /// the same document may report their ids out of order.
    pub fn add_term(&mut self, term: Term, doc_id_upto: usize) {
        match self.terms.get(&term) {
            Some(&current) if doc_id_upto < current => return,
            Some(_) => {}
            None => self.bytes_used += term.ram_bytes() + std::mem::size_of::<usize>(),
        }
        self.terms.insert(term, doc_id_upto);
        self.num_term_deletes += 1;
    }

    /// Delete documents matching `query` below `doc_id_upto`.
    pub fn add_query(&mut self, query: Arc<dyn DeleteQuery>, doc_id_upto: usize) {
        if let Some(existing) = self.queries.iter_mut().find(|q| Arc::ptr_eq(&q.query, &query)) {
            existing.limit = doc_id_upto;
            return;
        }
        self.queries.push(QueryAndLimit {
            query,
            limit: doc_id_upto,
        });
        self.bytes_used += QUERY_BYTES;
    }

    /// Record a doc-values update applying below `doc_id_upto`.
    ///
    /// A repeated `(field, term)` moves to the end so it wins over updates
    /// recorded in between.
    pub fn add_update(&mut self, update: &DocValuesUpdate, doc_id_upto: usize) {
        let map = match update.value.value_type() {
            DocValuesType::Numeric => &mut self.numeric_updates,
            DocValuesType::Binary => &mut self.binary_updates,
        };
        let field_updates = map.entry(update.field.clone()).or_default();
        if let Some(pos) = field_updates.iter().position(|u| u.term == update.term) {
            if doc_id_upto < field_updates[pos].doc_id_upto {
                return;
            }
            let old = field_updates.remove(pos);
            self.bytes_used = self.bytes_used.saturating_sub(old.ram_bytes());
        }
        let update = update.with_limit(doc_id_upto);
        self.bytes_used += update.ram_bytes();
        field_updates.push(update);
    }

    /// Ceiling recorded for `term`.
    pub fn term_limit(&self, term: &Term) -> Option<usize> {
        self.terms.get(term).copied()
    }

    pub fn terms(&self) -> &BTreeMap<Term, usize> {
        &self.terms
    }

    pub fn queries(&self) -> &[QueryAndLimit] {
        &self.queries
    }

    /// Numeric then binary updates, each in arrival order per field.
    pub fn updates(&self) -> impl Iterator<Item = &DocValuesUpdate> {
        self.numeric_updates
            .values()
            .chain(self.binary_updates.values())
            .flatten()
    }

    /// Forget the term deletes, after they were resolved against a flushed segment.
    pub fn clear_terms(&mut self) {
        for term in self.terms.keys() {
            self.bytes_used = self
                .bytes_used
                .saturating_sub(term.ram_bytes() + std::mem::size_of::<usize>());
        }
        self.terms.clear();
        self.num_term_deletes = 0;
    }

    pub fn clear(&mut self) {
        self.terms.clear();
        self.queries.clear();
        self.numeric_updates.clear();
        self.binary_updates.clear();
        self.num_term_deletes = 0;
        self.bytes_used = 0;
    }

    /// Number of term deletes recorded, repeats included.
    pub fn num_term_deletes(&self) -> usize {
        self.num_term_deletes
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn any(&self) -> bool {
        !self.terms.is_empty()
            || !self.queries.is_empty()
            || count(&self.numeric_updates) > 0
            || count(&self.binary_updates) > 0
    }
}

/// Immutable packet of deletes and updates, ordered by generation in the stream.
#[derive(Debug, Clone)]
pub struct FrozenBufferedUpdates {
    terms: Vec<Term>,
    queries: Vec<QueryAndLimit>,
    numeric_updates: Vec<DocValuesUpdate>,
    binary_updates: Vec<DocValuesUpdate>,
    num_term_deletes: usize,
    bytes_used: usize,
    del_gen: i64,
    is_segment_private: bool,
}

impl FrozenBufferedUpdates {
    /// Freeze `updates`.
    ///
    /// A segment-private packet belongs to one flushed segment, whose term
    /// deletes were already resolved at flush; only queries and updates remain.
    pub fn new(updates: &BufferedUpdates, is_segment_private: bool) -> Self {
        debug_assert!(
            !is_segment_private || updates.terms.is_empty(),
            "segment private packet should only have queries and updates"
        );

        FrozenBufferedUpdates {
            terms: updates.terms.keys().cloned().collect(),
            queries: updates.queries.clone(),
            numeric_updates: updates.numeric_updates.values().flatten().cloned().collect(),
            binary_updates: updates.binary_updates.values().flatten().cloned().collect(),
            num_term_deletes: updates.num_term_deletes,
            bytes_used: updates.bytes_used,
            del_gen: -1,
            is_segment_private,
        }
    }

    /// Term deletes, sorted.
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn queries(&self) -> &[QueryAndLimit] {
        &self.queries
    }

    pub fn numeric_updates(&self) -> &[DocValuesUpdate] {
        &self.numeric_updates
    }

    pub fn binary_updates(&self) -> &[DocValuesUpdate] {
        &self.binary_updates
    }

    pub fn num_term_deletes(&self) -> usize {
        self.num_term_deletes
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Generation assigned when the packet entered the stream, -1 before.
    pub fn del_gen(&self) -> i64 {
        self.del_gen
    }

    pub(crate) fn set_del_gen(&mut self, del_gen: i64) {
        debug_assert_eq!(self.del_gen, -1, "packet already has a generation");
        self.del_gen = del_gen;
    }

    pub fn is_segment_private(&self) -> bool {
        self.is_segment_private
    }

    pub fn any(&self) -> bool {
        !self.terms.is_empty()
            || !self.queries.is_empty()
            || !self.numeric_updates.is_empty()
            || !self.binary_updates.is_empty()
    }
}

impl fmt::Display for FrozenBufferedUpdates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gen={} terms={} queries={} numeric={} binary={} bytes={}{}",
            self.del_gen,
            self.terms.len(),
            self.queries.len(),
            self.numeric_updates.len(),
            self.binary_updates.len(),
            self.bytes_used,
            if self.is_segment_private { " private" } else { "" }
        )
    }
}
