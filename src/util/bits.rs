//! Live-document bitsets.

use std::sync::Arc;

use bit_vec::BitVec;

/// Bitset of the non-deleted documents of one segment.
///
/// Cloning is cheap and shares the underlying bits; the first mutation of a
/// shared set copies it, so a snapshot handed to a merge or near-real-time
/// reader never changes under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveDocs {
    bits: Arc<BitVec>,
}

impl LiveDocs {
    /// All `max_doc` documents live.
    pub fn new(max_doc: usize) -> Self {
        LiveDocs {
            bits: Arc::new(BitVec::from_elem(max_doc, true)),
        }
    }

    /// Rebuild from the packed representation of [`LiveDocs::to_bytes`].
    pub fn from_bytes(bytes: &[u8], max_doc: usize) -> Option<Self> {
        let mut bits = BitVec::from_bytes(bytes);
        if bits.len() < max_doc {
            return None;
        }
        bits.truncate(max_doc);
        Some(LiveDocs {
            bits: Arc::new(bits),
        })
    }

    /// Packed representation, most significant bit first.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.to_bytes()
    }

    /// Number of documents covered, live or not.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Whether the set covers no documents at all.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Whether `doc` is live. Out-of-range documents are not.
    pub fn is_live(&self, doc: usize) -> bool {
        self.bits.get(doc).unwrap_or(false)
    }

    /// Mark `doc` deleted; returns true if it was live before.
    pub fn delete(&mut self, doc: usize) -> bool {
        if !self.is_live(doc) {
            return false;
        }
        Arc::make_mut(&mut self.bits).set(doc, false);
        true
    }

    /// Number of live documents.
    pub fn num_live(&self) -> usize {
        self.bits.iter().filter(|live| *live).count()
    }

    /// Number of deleted documents.
    pub fn num_deleted(&self) -> usize {
        self.len() - self.num_live()
    }

    /// Whether both handles point at the same bits.
    pub fn shares_bits_with(&self, other: &LiveDocs) -> bool {
        Arc::ptr_eq(&self.bits, &other.bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_all_live() {
        let docs = LiveDocs::new(10);
        assert_eq!(docs.len(), 10);
        assert_eq!(docs.num_live(), 10);
        assert!(docs.is_live(9));
        assert!(!docs.is_live(10));
    }

    #[test]
    fn test_delete_counts_once() {
        let mut docs = LiveDocs::new(4);
        assert!(docs.delete(2));
        assert!(!docs.delete(2));
        assert!(!docs.delete(7));
        assert_eq!(docs.num_deleted(), 1);
    }

    #[test]
    fn test_copy_on_write() {
        let mut docs = LiveDocs::new(8);
        let snapshot = docs.clone();
        assert!(docs.shares_bits_with(&snapshot));

        docs.delete(3);
        assert!(!docs.shares_bits_with(&snapshot));
        assert!(snapshot.is_live(3));
        assert!(!docs.is_live(3));
    }

    #[test]
    fn test_bytes_round_trip_truncates_padding() {
        let mut docs = LiveDocs::new(11);
        docs.delete(0);
        docs.delete(10);

        let restored = LiveDocs::from_bytes(&docs.to_bytes(), 11).unwrap();
        assert_eq!(restored, docs);
        assert_eq!(restored.num_live(), 9);
        assert!(LiveDocs::from_bytes(&[0xFF], 9).is_none());
    }
}
