//! Lock-free queue distributing deletes and updates to indexing threads.
//!
//! The queue is a singly linked list that only grows at its tail. Appends
//! use compare-and-swap on the tail node's `next` pointer and then try to
//! swing the shared tail forward; a thread that finds the tail lagging
//! helps advance it before retrying. Consumers never remove nodes: each one
//! owns a [`DeleteSlice`], a `(head, tail)` window into the list, and
//! applies the nodes in that window into its own [`BufferedUpdates`].
//!
//! Nodes are reference counted. Once no slice and no tail pointer refers to
//! the head of a stretch of the list, the whole stretch is freed.
//!
//! A slice advanced after a document was added sees every item enqueued
//! before that point, which makes "delete enqueued before the document
//! finished" visible to the document batch that owns the slice.

use std::fmt;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use log::trace;
use parking_lot::Mutex;

use crate::index::buffered_updates::{BufferedUpdates, FrozenBufferedUpdates, MAX_DOC_ID};
use crate::index::term::{DeleteQuery, DocValuesUpdate, Term};

/// Payload of a queue node.
#[derive(Clone)]
pub enum DeleteItem {
    /// Seeds every queue; never applied.
    Sentinel,
    /// A single term delete.
    Term(Term),
    /// Several term deletes enqueued together.
    Terms(Vec<Term>),
    /// Query deletes.
    Queries(Vec<Arc<dyn DeleteQuery>>),
    /// A doc-values update.
    Update(DocValuesUpdate),
}

impl fmt::Debug for DeleteItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeleteItem::Sentinel => write!(f, "Sentinel"),
            DeleteItem::Term(term) => write!(f, "Term({term})"),
            DeleteItem::Terms(terms) => write!(f, "Terms({})", terms.len()),
            DeleteItem::Queries(queries) => write!(f, "Queries({})", queries.len()),
            DeleteItem::Update(update) => write!(f, "Update({} -> {})", update.term, update.field),
        }
    }
}

/// A list node: an immutable item plus an atomically swappable successor.
pub struct Node {
    item: DeleteItem,
    next: ArcSwapOption<Node>,
}

impl Node {
    fn new(item: DeleteItem) -> Arc<Self> {
        Arc::new(Node {
            item,
            next: ArcSwapOption::empty(),
        })
    }

    pub fn item(&self) -> &DeleteItem {
        &self.item
    }

    /// Link `node` after this one if nothing is linked yet.
    fn cas_next(&self, node: &Arc<Node>) -> bool {
        let previous = self.next.compare_and_swap(&None::<Arc<Node>>, Some(Arc::clone(node)));
        previous.is_none()
    }

    fn apply(&self, updates: &mut BufferedUpdates, doc_id_upto: usize) {
        match &self.item {
            DeleteItem::Sentinel => unreachable!("sentinel item must never be applied"),
            DeleteItem::Term(term) => updates.add_term(term.clone(), doc_id_upto),
            DeleteItem::Terms(terms) => {
                for term in terms {
                    updates.add_term(term.clone(), doc_id_upto);
                }
            }
            DeleteItem::Queries(queries) => {
                for query in queries {
                    updates.add_query(Arc::clone(query), doc_id_upto);
                }
            }
            DeleteItem::Update(update) => updates.add_update(update, doc_id_upto),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node").field("item", &self.item).finish()
    }
}

impl Drop for Node {
    // Unlink iteratively; a long unreferenced chain would otherwise drop
    // recursively, one stack frame per node.
    fn drop(&mut self) {
        let mut next = self.next.swap(None);
        while let Some(node) = next {
            match Arc::into_inner(node) {
                Some(node) => next = node.next.swap(None),
                None => break,
            }
        }
    }
}

/// A window `(head, tail]` into the queue owned by one consumer.
#[derive(Debug, Clone)]
pub struct DeleteSlice {
    head: Arc<Node>,
    tail: Arc<Node>,
}

impl DeleteSlice {
    fn new(current_tail: Arc<Node>) -> Self {
        DeleteSlice {
            head: Arc::clone(&current_tail),
            tail: current_tail,
        }
    }

    /// Apply every item after the head up to and including the tail, then
    /// collapse the slice.
    pub fn apply(&mut self, updates: &mut BufferedUpdates, doc_id_upto: usize) {
        if self.is_empty() {
            return;
        }

        let mut current = Arc::clone(&self.head);
        loop {
            let Some(next) = current.next.load_full() else {
                debug_assert!(false, "slice tail is not reachable from its head");
                break;
            };
            next.apply(updates, doc_id_upto);
            if Arc::ptr_eq(&next, &self.tail) {
                break;
            }
            current = next;
        }
        self.reset();
    }

    /// Drop the window without applying it.
    pub fn reset(&mut self) {
        self.head = Arc::clone(&self.tail);
    }

    pub fn is_empty(&self) -> bool {
        Arc::ptr_eq(&self.head, &self.tail)
    }
}

#[derive(Debug)]
struct GlobalBuffer {
    slice: DeleteSlice,
    updates: BufferedUpdates,
}

/// The shared delete queue of one writer.
pub struct DeleteQueue {
    tail: ArcSwap<Node>,
    global: Mutex<GlobalBuffer>,
}

impl fmt::Debug for DeleteQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteQueue")
            .field("tail", &self.tail.load().item)
            .finish()
    }
}

impl Default for DeleteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeleteQueue {
    /// Create a queue holding only the sentinel.
    pub fn new() -> Self {
        let sentinel = Node::new(DeleteItem::Sentinel);
        DeleteQueue {
            tail: ArcSwap::new(Arc::clone(&sentinel)),
            global: Mutex::new(GlobalBuffer {
                slice: DeleteSlice::new(sentinel),
                updates: BufferedUpdates::new(),
            }),
        }
    }

    /// Append `item`. Never blocks.
    pub fn add(&self, item: DeleteItem) -> Arc<Node> {
        let node = Node::new(item);
        loop {
            let current_tail = self.tail.load_full();
            match current_tail.next.load_full() {
                Some(tail_next) => {
                    // Another append linked its node but has not swung the
                    // tail yet; help it and retry.
                    self.tail.compare_and_swap(&current_tail, tail_next);
                }
                None => {
                    if current_tail.cas_next(&node) {
                        // Losing this race is fine: whoever won advanced the
                        // tail to this node or past it.
                        self.tail.compare_and_swap(&current_tail, Arc::clone(&node));
                        return node;
                    }
                }
            }
        }
    }

    /// Enqueue term deletes and try to fold them into the global buffer.
    pub fn add_delete(&self, terms: Vec<Term>) {
        self.add(DeleteItem::Terms(terms));
        self.try_apply_global_slice();
    }

    /// Enqueue query deletes and try to fold them into the global buffer.
    pub fn add_delete_queries(&self, queries: Vec<Arc<dyn DeleteQuery>>) {
        self.add(DeleteItem::Queries(queries));
        self.try_apply_global_slice();
    }

    /// Enqueue a doc-values update and try to fold it into the global buffer.
    pub fn add_update(&self, update: DocValuesUpdate) {
        self.add(DeleteItem::Update(update));
        self.try_apply_global_slice();
    }

    /// Enqueue a term delete on behalf of `slice`'s owner and extend the
    /// slice to cover it.
    pub fn add_term_to_slice(&self, term: Term, slice: &mut DeleteSlice) {
        slice.tail = self.add(DeleteItem::Term(term));
    }

    /// A new empty slice starting at the current tail.
    pub fn new_slice(&self) -> DeleteSlice {
        DeleteSlice::new(self.tail.load_full())
    }

    /// Extend `slice` to the current tail; returns whether it moved.
    pub fn update_slice(&self, slice: &mut DeleteSlice) -> bool {
        let current_tail = self.tail.load_full();
        if Arc::ptr_eq(&slice.tail, &current_tail) {
            return false;
        }
        slice.tail = current_tail;
        true
    }

    /// Fold pending items into the global buffer unless another thread is
    /// already doing so.
    pub fn try_apply_global_slice(&self) {
        if let Some(mut global) = self.global.try_lock() {
            let GlobalBuffer { slice, updates } = &mut *global;
            if self.update_slice(slice) {
                slice.apply(updates, MAX_DOC_ID);
            }
        }
    }

    /// Snapshot and clear the global buffer.
    ///
    /// `caller_slice`, if given, is pinned to the same tail so its owner
    /// neither misses nor repeats an item relative to the packet.
    pub fn freeze_global_buffer(&self, caller_slice: Option<&mut DeleteSlice>) -> FrozenBufferedUpdates {
        let mut global = self.global.lock();
        let current_tail = self.tail.load_full();
        if let Some(caller) = caller_slice {
            caller.tail = Arc::clone(&current_tail);
        }

        let GlobalBuffer { slice, updates } = &mut *global;
        if !Arc::ptr_eq(&slice.tail, &current_tail) {
            slice.tail = current_tail;
            slice.apply(updates, MAX_DOC_ID);
        }

        let packet = FrozenBufferedUpdates::new(updates, false);
        updates.clear();
        trace!("froze global delete buffer: {packet}");
        packet
    }

    /// Whether anything was enqueued that no packet has captured yet.
    pub fn any_changes(&self) -> bool {
        let global = self.global.lock();
        let tail = self.tail.load();
        global.updates.any()
            || !global.slice.is_empty()
            || !Arc::ptr_eq(&global.slice.tail, &tail)
            || tail.next.load().is_some()
    }

    /// Discard the global buffer and everything enqueued so far.
    pub fn clear(&self) {
        let mut global = self.global.lock();
        let current_tail = self.tail.load_full();
        global.slice = DeleteSlice::new(current_tail);
        global.updates.clear();
    }

    /// Term deletes folded into the global buffer so far.
    pub fn num_global_term_deletes(&self) -> usize {
        self.global.lock().updates.num_term_deletes()
    }

    pub fn bytes_used(&self) -> usize {
        self.global.lock().updates.bytes_used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_slice_sees_term_with_limit() {
        let queue = DeleteQueue::new();
        let mut slice = queue.new_slice();
        assert!(slice.is_empty());

        queue.add(DeleteItem::Term(Term::new("id", "5")));
        assert!(queue.update_slice(&mut slice));
        assert!(!queue.update_slice(&mut slice));

        let mut updates = BufferedUpdates::new();
        slice.apply(&mut updates, 100);
        assert!(slice.is_empty());
        assert_eq!(updates.terms().len(), 1);
        assert_eq!(updates.term_limit(&Term::new("id", "5")), Some(100));

        // Applying the collapsed slice again is a no-op.
        slice.apply(&mut updates, 200);
        assert_eq!(updates.term_limit(&Term::new("id", "5")), Some(100));
    }

    #[test]
    fn test_slices_are_independent() {
        let queue = DeleteQueue::new();
        let mut early = queue.new_slice();
        queue.add(DeleteItem::Term(Term::new("id", "1")));
        let mut late = queue.new_slice();
        queue.add(DeleteItem::Term(Term::new("id", "2")));

        queue.update_slice(&mut early);
        queue.update_slice(&mut late);
        let mut a = BufferedUpdates::new();
        let mut b = BufferedUpdates::new();
        early.apply(&mut a, 10);
        late.apply(&mut b, 10);

        assert_eq!(a.terms().len(), 2);
        assert_eq!(b.terms().len(), 1);
        assert!(b.term_limit(&Term::new("id", "2")).is_some());
    }

    #[test]
    fn test_add_term_to_slice() {
        let queue = DeleteQueue::new();
        let mut slice = queue.new_slice();
        queue.add_delete(vec![Term::new("id", "0")]);
        queue.add_term_to_slice(Term::new("id", "1"), &mut slice);

        let mut updates = BufferedUpdates::new();
        slice.apply(&mut updates, 4);
        assert_eq!(updates.term_limit(&Term::new("id", "0")), Some(4));
        assert_eq!(updates.term_limit(&Term::new("id", "1")), Some(4));
    }

    #[test]
    fn test_freeze_global_buffer() {
        let queue = DeleteQueue::new();
        assert!(!queue.any_changes());

        queue.add_delete(vec![Term::new("id", "1"), Term::new("id", "2")]);
        assert!(queue.any_changes());
        assert_eq!(queue.num_global_term_deletes(), 2);

        let mut caller = queue.new_slice();
        queue.add(DeleteItem::Term(Term::new("id", "3")));
        let packet = queue.freeze_global_buffer(Some(&mut caller));
        assert_eq!(packet.terms().len(), 3);
        assert!(!packet.is_segment_private());

        // The caller slice now ends where the packet ends.
        assert!(!queue.update_slice(&mut caller));
        assert!(!queue.any_changes());
        assert_eq!(queue.num_global_term_deletes(), 0);

        let empty = queue.freeze_global_buffer(None);
        assert!(!empty.any());
    }

    #[test]
    fn test_clear_discards_pending() {
        let queue = DeleteQueue::new();
        queue.add(DeleteItem::Term(Term::new("id", "1")));
        queue.clear();
        assert!(!queue.any_changes());
        assert!(!queue.freeze_global_buffer(None).any());
    }

    #[test]
    fn test_concurrent_adds() {
        let queue = Arc::new(DeleteQueue::new());
        let mut slice = queue.new_slice();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..250 {
                        queue.add_delete(vec![Term::new("id", format!("{t}-{i}"))]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        queue.update_slice(&mut slice);
        let mut updates = BufferedUpdates::new();
        slice.apply(&mut updates, MAX_DOC_ID);
        assert_eq!(updates.terms().len(), 1000);

        let packet = queue.freeze_global_buffer(None);
        assert_eq!(packet.terms().len(), 1000);
    }

    #[test]
    fn test_long_chain_drops_without_recursion() {
        let queue = DeleteQueue::new();
        let slice = queue.new_slice();
        for i in 0..200_000 {
            queue.add(DeleteItem::Term(Term::new("id", i.to_string())));
        }
        queue.clear();
        drop(slice);
        drop(queue);
    }
}
