//! In-memory ordered tree index with snapshot-isolated iterators.
//!
//! A space's tuples live in one primary `TreeIndex` (always unique) plus
//! any number of secondaries; non-unique secondaries extend their key
//! definition with the primary's parts so ordering stays total.

pub mod key_def;
pub mod tree;
pub mod tuple;

pub use key_def::{FieldType, FieldValue, KeyDef, KeyPart};
pub use tree::{DupPolicy, IteratorType, TreeIndex, TreeIterator};
pub use tuple::Tuple;
