//! Segment directory index.
//!
//! Files are named by the zero-padded decimal signature sum of their
//! creation vclock. The in-memory index maps that sum to the full vclock
//! read from the segment header; `scan` reconciles it against the disk
//! listing without re-reading files it already knows.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kestrel_common::error::WalError;
use kestrel_common::vclock::Vclock;

use crate::cursor::{CursorOptions, XlogCursor};
use crate::meta::SegmentMeta;
use crate::xlog::{XlogWriter, XlogWriterOptions, INPROGRESS_SUFFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirKind {
    Log,
    Snap,
}

impl DirKind {
    pub fn ext(&self) -> &'static str {
        match self {
            DirKind::Log => "xlog",
            DirKind::Snap => "snap",
        }
    }

    pub fn filetype(&self) -> &'static str {
        match self {
            DirKind::Log => "LOG",
            DirKind::Snap => "SNAP",
        }
    }
}

pub struct XlogDir {
    kind: DirKind,
    path: PathBuf,
    instance_uuid: String,
    index: BTreeMap<i64, Vclock>,
}

impl XlogDir {
    /// Open (creating if needed) a segment directory and scan it.
    pub fn open(path: &Path, kind: DirKind, instance_uuid: &str) -> Result<XlogDir, WalError> {
        std::fs::create_dir_all(path)?;
        let mut dir = XlogDir {
            kind,
            path: path.to_path_buf(),
            instance_uuid: instance_uuid.to_string(),
            index: BTreeMap::new(),
        };
        dir.scan()?;
        Ok(dir)
    }

    pub fn kind(&self) -> DirKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn segment_path(&self, sum: i64) -> PathBuf {
        self.path.join(format!("{:020}.{}", sum, self.kind.ext()))
    }

    pub fn segments(&self) -> impl Iterator<Item = (i64, &Vclock)> {
        self.index.iter().map(|(&sum, vclock)| (sum, vclock))
    }

    pub fn latest(&self) -> Option<(i64, &Vclock)> {
        self.index
            .iter()
            .next_back()
            .map(|(&sum, vclock)| (sum, vclock))
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Reconcile the index with the directory listing: newly appeared
    /// files are opened and their header vclock adopted, vanished entries
    /// are evicted. Unchanged files are not re-read, so rescans are cheap
    /// and idempotent. Files that fail validation are skipped with a
    /// warning; `.inprogress` leftovers are ignored entirely.
    pub fn scan(&mut self) -> Result<(), WalError> {
        let mut on_disk = std::collections::BTreeSet::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(INPROGRESS_SUFFIX) {
                continue;
            }
            let Some(stem) = name.strip_suffix(&format!(".{}", self.kind.ext())) else {
                continue;
            };
            let Ok(sum) = stem.parse::<i64>() else {
                tracing::warn!(file = %name, "unparsable segment name, skipping");
                continue;
            };
            on_disk.insert(sum);
        }

        self.index.retain(|sum, _| on_disk.contains(sum));

        for sum in on_disk {
            if self.index.contains_key(&sum) {
                continue;
            }
            let path = self.segment_path(sum);
            match XlogCursor::open(&path, CursorOptions::default()) {
                Ok(cursor) => {
                    let meta = cursor.meta();
                    if meta.filetype != self.kind.filetype() {
                        tracing::warn!(
                            file = %path.display(),
                            filetype = %meta.filetype,
                            "segment filetype mismatch, skipping"
                        );
                        continue;
                    }
                    self.index.insert(sum, meta.vclock.clone());
                }
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "unreadable segment, skipping");
                }
            }
        }

        self.check_order()
    }

    /// Successive segments must never regress componentwise: each vclock
    /// must be comparable with and not less than its predecessor.
    fn check_order(&self) -> Result<(), WalError> {
        let mut prev: Option<(&i64, &Vclock)> = None;
        for (sum, vclock) in &self.index {
            if let Some((_, prev_clock)) = prev {
                match prev_clock.partial_compare(vclock) {
                    Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal) => {}
                    _ => {
                        return Err(WalError::VclockOrder {
                            file: self.segment_path(*sum).display().to_string(),
                        });
                    }
                }
            }
            prev = Some((sum, vclock));
        }
        Ok(())
    }

    /// Create the next segment, identified by the vclock's signature sum.
    pub fn create_segment(
        &mut self,
        vclock: &Vclock,
        opts: XlogWriterOptions,
    ) -> Result<XlogWriter, WalError> {
        let sum = vclock.sum();
        let path = self.segment_path(sum);
        let meta = SegmentMeta::new(self.kind.filetype(), &self.instance_uuid, vclock.clone());
        let writer = XlogWriter::create(&path, meta, opts)?;
        self.index.insert(sum, vclock.clone());
        Ok(writer)
    }

    /// Start a segment that stays `.inprogress` until the writer is
    /// closed; the caller registers it with `note_segment` afterwards.
    /// Snapshots go through this path so an aborted or crashed checkpoint
    /// never leaves a file the scan would adopt.
    pub fn begin_segment(
        &self,
        vclock: &Vclock,
        opts: XlogWriterOptions,
    ) -> Result<XlogWriter, WalError> {
        let path = self.segment_path(vclock.sum());
        let meta = SegmentMeta::new(self.kind.filetype(), &self.instance_uuid, vclock.clone());
        XlogWriter::create_inprogress(&path, meta, opts)
    }

    /// Register a segment completed via `begin_segment` + `close`.
    pub fn note_segment(&mut self, vclock: &Vclock) {
        self.index.insert(vclock.sum(), vclock.clone());
    }

    pub fn open_cursor(&self, sum: i64, opts: CursorOptions) -> Result<XlogCursor, WalError> {
        XlogCursor::open(&self.segment_path(sum), opts)
    }

    /// The newest segment whose vclock is entirely at or below `target` —
    /// the starting point for replaying rows past `target`.
    pub fn segment_covering(&self, target: &Vclock) -> Option<i64> {
        let mut found = None;
        for (&sum, vclock) in &self.index {
            match vclock.partial_compare(target) {
                Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal) => {
                    found = Some(sum)
                }
                _ => break,
            }
        }
        found
    }

    /// Remove segments made obsolete by `watermark`: a segment can go once
    /// its successor's vclock is entirely at or below the watermark (all
    /// of its rows are then covered). The newest segment always survives.
    /// Returns the removed paths.
    pub fn collect_garbage(&mut self, watermark: &Vclock) -> Result<Vec<PathBuf>, WalError> {
        let sums: Vec<i64> = self.index.keys().copied().collect();
        let mut removed = Vec::new();
        for pair in sums.windows(2) {
            let (sum, next) = (pair[0], pair[1]);
            let next_clock = match self.index.get(&next) {
                Some(c) => c,
                None => continue,
            };
            let covered = matches!(
                next_clock.partial_compare(watermark),
                Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
            );
            if !covered {
                break;
            }
            let path = self.segment_path(sum);
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    self.index.remove(&sum);
                    removed.push(path);
                }
                Err(e) => {
                    // Skip this GC tick for the file; try again next sweep.
                    tracing::warn!(file = %path.display(), error = %e, "GC unlink failed");
                }
            }
        }
        Ok(removed)
    }

    /// Delete stale `.inprogress` leftovers from a crashed writer.
    pub fn remove_inprogress(&self) -> Result<usize, WalError> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(INPROGRESS_SUFFIX) {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
