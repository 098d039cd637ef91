//! Segment metadata: the plaintext header at the start of every segment.
//!
//! ```text
//! LOG
//! 1.0
//! Instance: <uuid>
//! VClock: {0: 5}
//!
//! ```
//! The first two lines (filetype, format version) are mandatory; the
//! remaining `Key: value` lines are parsed tolerantly so newer writers
//! can add keys.

use kestrel_common::error::WalError;
use kestrel_common::vclock::Vclock;

pub const META_VERSION: &str = "1.0";

/// Maximum bytes a metadata header may occupy.
pub const META_MAX_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentMeta {
    pub filetype: String,
    pub version: String,
    pub instance_uuid: String,
    pub vclock: Vclock,
}

impl SegmentMeta {
    pub fn new(filetype: &str, instance_uuid: &str, vclock: Vclock) -> SegmentMeta {
        SegmentMeta {
            filetype: filetype.to_string(),
            version: META_VERSION.to_string(),
            instance_uuid: instance_uuid.to_string(),
            vclock,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        format!(
            "{}\n{}\nInstance: {}\nVClock: {}\n\n",
            self.filetype, self.version, self.instance_uuid, self.vclock
        )
        .into_bytes()
    }

    /// Parse a header from the front of `buf`. Returns the meta and the
    /// number of bytes it occupies (including the blank-line terminator).
    /// `None` means the terminator is not in the buffer yet.
    pub fn parse(buf: &[u8]) -> Result<Option<(SegmentMeta, usize)>, WalError> {
        let end = match find_terminator(buf) {
            Some(end) => end,
            None => {
                if buf.len() >= META_MAX_SIZE {
                    return Err(WalError::BadMeta("header terminator not found".into()));
                }
                return Ok(None);
            }
        };
        let text = std::str::from_utf8(&buf[..end])
            .map_err(|_| WalError::BadMeta("header is not valid UTF-8".into()))?;
        let mut lines = text.lines();
        let filetype = lines
            .next()
            .ok_or_else(|| WalError::BadMeta("missing filetype line".into()))?
            .to_string();
        if filetype != "LOG" && filetype != "SNAP" {
            return Err(WalError::BadMeta(format!("unknown filetype '{filetype}'")));
        }
        let version = lines
            .next()
            .ok_or_else(|| WalError::BadMeta("missing version line".into()))?
            .to_string();

        let mut instance_uuid = String::new();
        let mut vclock = Vclock::new();
        for line in lines {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key.trim() {
                "Instance" => instance_uuid = value.trim().to_string(),
                "VClock" => {
                    vclock = Vclock::parse(value.trim())
                        .ok_or_else(|| WalError::BadMeta(format!("bad vclock '{value}'")))?;
                }
                _ => {}
            }
        }
        Ok(Some((
            SegmentMeta {
                filetype,
                version,
                instance_uuid,
                vclock,
            },
            end + 1,
        )))
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(2)
        .take(META_MAX_SIZE)
        .position(|w| w == b"\n\n")
        .map(|p| p + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::types::{Lsn, ReplicaId};

    #[test]
    fn encode_parse_roundtrip() {
        let mut vclock = Vclock::new();
        vclock.follow(ReplicaId(1), Lsn(42)).unwrap();
        let meta = SegmentMeta::new("LOG", "instance-7", vclock);
        let bytes = meta.encode();
        let (parsed, consumed) = SegmentMeta::parse(&bytes).unwrap().unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn partial_header_needs_more_bytes() {
        let meta = SegmentMeta::new("SNAP", "i", Vclock::new());
        let bytes = meta.encode();
        assert!(SegmentMeta::parse(&bytes[..bytes.len() - 2]).unwrap().is_none());
    }

    #[test]
    fn unknown_keys_tolerated() {
        let text = b"LOG\n1.0\nInstance: abc\nFuture-Key: whatever\nVClock: {}\n\n";
        let (meta, _) = SegmentMeta::parse(text).unwrap().unwrap();
        assert_eq!(meta.instance_uuid, "abc");
    }

    #[test]
    fn bad_filetype_rejected() {
        let text = b"BOGUS\n1.0\n\n";
        assert!(SegmentMeta::parse(text).is_err());
    }

    #[test]
    fn bad_vclock_rejected() {
        let text = b"LOG\n1.0\nVClock: nonsense\n\n";
        assert!(SegmentMeta::parse(text).is_err());
    }
}
