//! Terms, delete queries and doc-values updates.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::index::codec::SegmentReader;

/// A field/text pair identifying documents to delete or update.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term {
    /// Field name.
    pub field: String,

    /// Exact term text.
    pub text: String,
}

impl Term {
    /// Create a new term.
    pub fn new<F: Into<String>, T: Into<String>>(field: F, text: T) -> Self {
        Term {
            field: field.into(),
            text: text.into(),
        }
    }

    /// Approximate heap footprint, used for buffered-updates accounting.
    pub fn ram_bytes(&self) -> usize {
        self.field.len() + self.text.len() + 2 * std::mem::size_of::<String>()
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.text)
    }
}

/// A query that can select documents to delete.
///
/// The writer only needs the matching document ids of one segment; scoring
/// and the rest of query execution happen elsewhere.
pub trait DeleteQuery: Send + Sync + fmt::Debug {
    /// Ids of the documents of `reader` matching this query, ascending.
    fn matching_docs(&self, reader: &dyn SegmentReader) -> Result<Vec<usize>>;
}

/// Matches documents whose numeric doc value for `field` lies in `min..=max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumericRangeQuery {
    field: String,
    min: i64,
    max: i64,
}

impl NumericRangeQuery {
    /// Create a new inclusive range query.
    pub fn new<S: Into<String>>(field: S, min: i64, max: i64) -> Self {
        NumericRangeQuery {
            field: field.into(),
            min,
            max,
        }
    }
}

impl DeleteQuery for NumericRangeQuery {
    fn matching_docs(&self, reader: &dyn SegmentReader) -> Result<Vec<usize>> {
        Ok((0..reader.max_doc())
            .filter(|&doc| {
                reader
                    .numeric_value(&self.field, doc)
                    .is_some_and(|v| v >= self.min && v <= self.max)
            })
            .collect())
    }
}

/// Kind of per-document value a field carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocValuesType {
    /// 64-bit signed integers.
    Numeric,
    /// Arbitrary byte strings.
    Binary,
}

/// A single per-document field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocValue {
    /// Numeric value.
    Numeric(i64),
    /// Binary value.
    Binary(Vec<u8>),
}

impl DocValue {
    /// The kind of this value.
    pub fn value_type(&self) -> DocValuesType {
        match self {
            DocValue::Numeric(_) => DocValuesType::Numeric,
            DocValue::Binary(_) => DocValuesType::Binary,
        }
    }
}

/// Replace `field`'s value on every document containing `term`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocValuesUpdate {
    /// Documents to update.
    pub term: Term,

    /// Field whose value is replaced.
    pub field: String,

    /// New value.
    pub value: DocValue,

    /// Only documents below this id are updated.
    pub doc_id_upto: usize,
}

impl DocValuesUpdate {
    /// Create an update that applies to all documents of a segment.
    pub fn new<S: Into<String>>(term: Term, field: S, value: DocValue) -> Self {
        DocValuesUpdate {
            term,
            field: field.into(),
            value,
            doc_id_upto: usize::MAX,
        }
    }

    /// Copy of this update limited to documents below `doc_id_upto`.
    pub fn with_limit(&self, doc_id_upto: usize) -> Self {
        DocValuesUpdate {
            doc_id_upto,
            ..self.clone()
        }
    }

    /// Approximate heap footprint.
    pub fn ram_bytes(&self) -> usize {
        let value = match &self.value {
            DocValue::Numeric(_) => 8,
            DocValue::Binary(bytes) => bytes.len(),
        };
        self.term.ram_bytes() + self.field.len() + value + 16
    }
}
