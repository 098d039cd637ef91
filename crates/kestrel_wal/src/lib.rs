//! Write-ahead log segment codec.
//!
//! A segment is a text metadata header followed by checksummed,
//! optionally zstd-compressed transaction blocks, terminated by a 4-byte
//! end-of-segment marker. Segments are named by the decimal signature sum
//! of their creation vclock; a directory index reconciles disk against
//! memory without re-reading unchanged files.

pub mod block;
pub mod cursor;
pub mod dir;
pub mod meta;
pub mod xlog;

pub use cursor::{CursorOptions, XlogCursor};
pub use dir::{DirKind, XlogDir};
pub use meta::SegmentMeta;
pub use xlog::{XlogWriter, XlogWriterOptions};
