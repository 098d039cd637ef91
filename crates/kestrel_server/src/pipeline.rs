//! The two-context pipeline: a backpressure governor on the network
//! side and a dedicated transaction-processing thread on the other end
//! of a bounded queue.
//!
//! The tx thread drains up to one timeslice of requests, accumulating
//! their responses, then flushes the whole batch back in one channel
//! message; the dispatcher on the network side fans the batch out to the
//! owning connections. Each completed request releases one governor slot
//! and resumes at most one suspended connection, FIFO.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use kestrel_common::types::{RequestSync, SchemaVersion};
use kestrel_engine::Database;
use kestrel_protocol::codec::{encode_error, encode_ok, Request};

use crate::connection::{ConnShared, ConnState};

/// Outcome of admitting one decoded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    Continue,
    /// Over budget: the request is still dispatched, but the connection
    /// must stop reading until a completion resumes it.
    Stop,
}

/// Global in-flight budget, scaled by the number of live connections.
pub struct Governor {
    budget_per_conn: usize,
    live: AtomicUsize,
    in_flight: AtomicUsize,
    stopped: Mutex<VecDeque<Arc<ConnShared>>>,
}

impl Governor {
    pub fn new(budget_per_conn: usize) -> Governor {
        Governor {
            budget_per_conn: budget_per_conn.max(1),
            live: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            stopped: Mutex::new(VecDeque::new()),
        }
    }

    pub fn connect(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    pub fn disconnect(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn budget(&self) -> usize {
        self.budget_per_conn * self.live.load(Ordering::Acquire).max(1)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn stopped_count(&self) -> usize {
        self.stopped.lock().len()
    }

    /// Take a slot for one decoded request. The request always proceeds;
    /// exceeding the budget suspends the connection's reading instead of
    /// erroring, so load degrades to throttling.
    pub fn acquire(&self, conn: &Arc<ConnShared>) -> Admit {
        let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        if in_flight > self.budget() {
            conn.set_state(ConnState::Stopped);
            self.stopped.lock().push_back(Arc::clone(conn));
            Admit::Stop
        } else {
            Admit::Continue
        }
    }

    /// Release one slot and resume exactly one suspended connection, in
    /// suspension order. No broadcast: one completion, one resume.
    pub fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        let resumed = self.stopped.lock().pop_front();
        if let Some(conn) = resumed {
            if conn.state() == ConnState::Stopped {
                conn.set_state(ConnState::Active);
            }
            conn.wake.notify_one();
        }
    }
}

/// One unit of work for the tx context.
pub struct TxRequest {
    pub conn: Arc<ConnShared>,
    pub src_buf: usize,
    pub sync: RequestSync,
    pub schema_version: SchemaVersion,
    pub request: Request,
}

pub enum TxMsg {
    Request(TxRequest),
}

/// One encoded response heading back to its connection.
pub struct Completion {
    pub conn_id: u64,
    pub src_buf: usize,
    pub payload: Vec<u8>,
}

/// Spawn the transaction-processing thread. It owns every mutating call
/// into the database; the network context only ever touches buffers.
pub fn spawn_tx_thread(
    db: Arc<Database>,
    mut rx: mpsc::Receiver<TxMsg>,
    batches: mpsc::UnboundedSender<Vec<Completion>>,
    timeslice: usize,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("kestrel-tx".into())
        .spawn(move || {
            tracing::debug!("tx context started");
            while let Some(msg) = rx.blocking_recv() {
                let mut batch = Vec::new();
                process(&db, msg, &mut batch);
                // Drain whatever else is already queued, up to one
                // timeslice, so the cross-thread handoff is amortized.
                while batch.len() < timeslice {
                    match rx.try_recv() {
                        Ok(msg) => process(&db, msg, &mut batch),
                        Err(_) => break,
                    }
                }
                if batches.send(batch).is_err() {
                    break;
                }
            }
            tracing::debug!("tx context stopped");
        })
        .expect("spawn tx thread")
}

fn process(db: &Database, msg: TxMsg, batch: &mut Vec<Completion>) {
    let TxMsg::Request(req) = msg;
    let payload = respond(db, &req);
    batch.push(Completion {
        conn_id: req.conn.id.0,
        src_buf: req.src_buf,
        payload,
    });
}

fn respond(db: &Database, req: &TxRequest) -> Vec<u8> {
    let version = db.schema_version();
    if let Request::Auth { user, scramble } = &req.request {
        return if db.authenticate(user, scramble, &req.conn.salt) {
            req.conn.set_user(user);
            tracing::debug!(conn = %req.conn.id, user, "authenticated");
            encode_ok(req.sync, version, &[])
        } else {
            encode_error(
                req.sync,
                version,
                kestrel_common::error::codes::ER_ACCESS_DENIED,
                &format!("access denied for user '{user}'"),
            )
        };
    }
    let ctx = req.conn.session();
    match db.execute(req.schema_version, &req.request, &ctx) {
        Ok(tuples) => {
            let data: Vec<Vec<u8>> = tuples.iter().map(|t| t.data().to_vec()).collect();
            encode_ok(req.sync, db.schema_version(), &data)
        }
        Err(e) => {
            e.log_if_internal();
            encode_error(req.sync, version, e.error_code(), &e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnId;
    use kestrel_protocol::greeting::SALT_SIZE;

    fn conn(id: u64) -> Arc<ConnShared> {
        Arc::new(ConnShared::new(ConnId(id), [0u8; SALT_SIZE]))
    }

    /// Capacity C with C+1 in-flight requests: the overflowing
    /// connection stops; one completion resumes exactly one.
    #[test]
    fn overflow_stops_reading_and_completion_resumes_one() {
        let governor = Governor::new(2);
        let a = conn(1);
        let b = conn(2);
        governor.connect();
        governor.connect();
        // Budget = 2 per conn × 2 live = 4.
        assert_eq!(governor.budget(), 4);

        for _ in 0..4 {
            assert_eq!(governor.acquire(&a), Admit::Continue);
        }
        // The fifth request crosses the budget: b must stop.
        assert_eq!(governor.acquire(&b), Admit::Stop);
        assert_eq!(b.state(), ConnState::Stopped);
        assert_eq!(governor.stopped_count(), 1);

        // One completion resumes exactly the one stopped connection.
        governor.release();
        assert_eq!(b.state(), ConnState::Active);
        assert_eq!(governor.stopped_count(), 0);
        assert_eq!(governor.in_flight(), 4);
    }

    #[test]
    fn resume_order_is_fifo() {
        let governor = Governor::new(1);
        let first = conn(1);
        let second = conn(2);
        governor.connect();
        // Budget 1: everything past the first request suspends.
        assert_eq!(governor.acquire(&first), Admit::Continue);
        assert_eq!(governor.acquire(&first), Admit::Stop);
        assert_eq!(governor.acquire(&second), Admit::Stop);
        assert_eq!(governor.stopped_count(), 2);

        governor.release();
        assert_eq!(first.state(), ConnState::Active);
        assert_eq!(second.state(), ConnState::Stopped);
        governor.release();
        assert_eq!(second.state(), ConnState::Active);
    }

    #[test]
    fn budget_scales_with_live_connections() {
        let governor = Governor::new(3);
        assert_eq!(governor.budget(), 3);
        governor.connect();
        governor.connect();
        assert_eq!(governor.budget(), 6);
        governor.disconnect();
        assert_eq!(governor.budget(), 3);
    }
}
