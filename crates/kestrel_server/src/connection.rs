//! Per-connection state and the double-buffered input pipeline.
//!
//! Two input buffers rotate: while one accumulates new reads, the other
//! may still be pinned by requests whose responses have not yet been
//! produced. The per-buffer pending-request count is the implicit
//! reference count from the data-flow contract: a buffer is recycled
//! only when every request decoded from it has completed, which bounds
//! what a fast client can pile up behind a slow consumer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Notify;

use kestrel_common::error::ProtocolError;
use kestrel_engine::SessionCtx;
use kestrel_protocol::codec::{self, Frame};
use kestrel_protocol::greeting::SALT_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Active,
    /// Input reading suspended by the backpressure governor.
    Stopped,
    /// The socket has given itself to a replication stream.
    Streaming,
    Draining,
    Closed,
}

/// State shared between the reader task, the response dispatcher and the
/// backpressure governor.
pub struct ConnShared {
    pub id: ConnId,
    pub salt: [u8; SALT_SIZE],
    state: Mutex<ConnState>,
    /// In-flight requests per input buffer.
    pending: [AtomicUsize; 2],
    /// Monotonic count of requests decoded on this connection.
    requests: AtomicUsize,
    /// Wakes the reader after a completion or a governor resume.
    pub wake: Notify,
    session: Mutex<SessionCtx>,
}

impl ConnShared {
    pub fn new(id: ConnId, salt: [u8; SALT_SIZE]) -> ConnShared {
        ConnShared {
            id,
            salt,
            state: Mutex::new(ConnState::Active),
            pending: [AtomicUsize::new(0), AtomicUsize::new(0)],
            requests: AtomicUsize::new(0),
            wake: Notify::new(),
            session: Mutex::new(SessionCtx::default()),
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ConnState) {
        *self.state.lock() = state;
    }

    pub fn charge(&self, src_buf: usize) {
        self.pending[src_buf].fetch_add(1, Ordering::AcqRel);
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// A request sourced from `src_buf` has produced its response.
    pub fn complete(&self, src_buf: usize) {
        self.pending[src_buf].fetch_sub(1, Ordering::AcqRel);
        self.wake.notify_one();
    }

    pub fn pending_count(&self, src_buf: usize) -> usize {
        self.pending[src_buf].load(Ordering::Acquire)
    }

    pub fn total_pending(&self) -> usize {
        self.pending_count(0) + self.pending_count(1)
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn session(&self) -> SessionCtx {
        self.session.lock().clone()
    }

    pub fn set_user(&self, user: &str) {
        self.session.lock().user = user.to_string();
    }
}

/// What one parse step produced.
pub enum Split {
    /// A complete frame, charged to the buffer it came from.
    Frame(Frame, usize),
    /// The tail holds only a partial frame.
    NeedMore,
    /// The frame was malformed; its bytes were consumed so the stream is
    /// resynchronized at the next frame boundary.
    Malformed(ProtocolError),
    /// The length prefix itself is unusable: no frame boundary exists to
    /// resync at, the connection must close.
    Fatal(ProtocolError),
}

/// The rotating input buffers. Owned by the reader task; completions
/// arrive through the shared pending counters.
pub struct InputBuffers {
    shared: Arc<ConnShared>,
    bufs: [BytesMut; 2],
    active: usize,
    parse_pos: usize,
    /// Rotation threshold: a buffer past this size stops growing.
    readahead: usize,
}

impl InputBuffers {
    pub fn new(shared: Arc<ConnShared>, readahead: usize) -> InputBuffers {
        InputBuffers {
            shared,
            bufs: [BytesMut::new(), BytesMut::new()],
            active: 0,
            parse_pos: 0,
            readahead: readahead.max(1),
        }
    }

    /// The buffer the socket should read into, with room reserved.
    pub fn read_target(&mut self) -> &mut BytesMut {
        let buf = &mut self.bufs[self.active];
        buf.reserve(self.readahead);
        buf
    }

    /// Split one frame off the parse cursor.
    pub fn split_frame(&mut self) -> Split {
        let pending = &self.bufs[self.active][self.parse_pos..];
        let total = match codec::frame_extent(pending) {
            Ok(Some(total)) => total,
            Ok(None) => return Split::NeedMore,
            Err(e) => return Split::Fatal(e),
        };
        if pending.len() < total {
            return Split::NeedMore;
        }
        match codec::decode_frame(&pending[..total]) {
            Ok(Some((frame, consumed))) => {
                debug_assert_eq!(consumed, total);
                self.parse_pos += total;
                self.shared.charge(self.active);
                Split::Frame(frame, self.active)
            }
            Ok(None) => Split::NeedMore,
            Err(e) => {
                // The frame boundary is known: skip the bad frame.
                self.parse_pos += total;
                Split::Malformed(e)
            }
        }
    }

    /// Whether more bytes may be read right now. Recycles or rotates
    /// buffers as a side effect; `false` means both buffers are pinned
    /// by in-flight requests and the reader must wait for a completion.
    pub fn can_read(&mut self) -> bool {
        let active_len = self.bufs[self.active].len();
        if self.parse_pos == active_len {
            if self.shared.pending_count(self.active) == 0 {
                self.bufs[self.active].clear();
                self.parse_pos = 0;
                return true;
            }
            if active_len < self.readahead {
                return true;
            }
            let other = 1 - self.active;
            if self.shared.pending_count(other) == 0 {
                self.bufs[other].clear();
                self.active = other;
                self.parse_pos = 0;
                return true;
            }
            return false;
        }
        // A partial frame sits at the tail; it must keep growing unless
        // the buffer is full and the other one is free to take the tail.
        if active_len < self.readahead {
            return true;
        }
        let other = 1 - self.active;
        if self.shared.pending_count(other) == 0 {
            let tail = self.bufs[self.active].split_off(self.parse_pos);
            self.bufs[other].clear();
            self.bufs[other].extend_from_slice(&tail);
            self.active = other;
            self.parse_pos = 0;
            return true;
        }
        false
    }

    pub fn shared(&self) -> &Arc<ConnShared> {
        &self.shared
    }
}
