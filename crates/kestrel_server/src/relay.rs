//! Replication relay: the push half of JOIN and SUBSCRIBE.
//!
//! Once a connection issues either request it leaves the
//! request/response regime for good: this loop pushes rows at the peer
//! while the connection's reader only consumes vclock acknowledgements.
//! Runs on a blocking thread (file reads dominate); peer disconnect is
//! the only way out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use kestrel_common::error::{KestrelError, WalError};
use kestrel_common::types::RequestSync;
use kestrel_common::vclock::Vclock;
use kestrel_engine::Database;
use kestrel_protocol::codec::encode_vclock_ack;
use kestrel_wal::CursorOptions;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub enum RelayMode {
    /// Bulk-load a joining replica: snapshot rows first, then the logs.
    Join,
    /// Tail the logs from the peer's vclock.
    Subscribe { from: Vclock },
}

/// Stream rows to one peer until it disconnects. `writer` feeds the
/// connection's socket writer task; a closed channel or a raised `stop`
/// flag means the peer is gone and ends the relay cleanly.
pub fn run(
    db: Arc<Database>,
    relay_id: u64,
    mode: RelayMode,
    sync: RequestSync,
    writer: mpsc::Sender<Vec<u8>>,
    stop: Arc<AtomicBool>,
) -> Result<(), KestrelError> {
    let version = db.schema_version();
    let mut from = match mode {
        RelayMode::Join => {
            let mut from = Vclock::new();
            if let Some((sum, snap_clock)) = db.checkpoints().latest_snapshot() {
                tracing::info!(relay = relay_id, signature = sum, "join: streaming snapshot");
                let mut cursor = db.checkpoints().open_snapshot_cursor(sum)?;
                while let Some(row) = cursor.next_row()? {
                    if !send(&writer, &stop, row.encode_frame()) {
                        return Ok(());
                    }
                }
                from = snap_clock;
            }
            // Join-done marker: the clock the streamed state corresponds
            // to; tailing continues from here on the same socket.
            if !send(&writer, &stop, encode_vclock_ack(sync, version, &from)) {
                return Ok(());
            }
            from
        }
        RelayMode::Subscribe { from } => {
            // Answer with our clock so the peer knows where we stand.
            if !send(&writer, &stop, encode_vclock_ack(sync, version, &db.vclock())) {
                return Ok(());
            }
            from
        }
    };

    tracing::info!(relay = relay_id, from = %from, "relay tailing logs");
    loop {
        if writer.is_closed() || stop.load(Ordering::Acquire) {
            tracing::info!(relay = relay_id, "peer disconnected, relay done");
            return Ok(());
        }
        let mut progressed = false;
        let segments = db.journal().segments();
        let start = db.journal().segment_covering(&from);
        for (sum, _) in segments {
            if let Some(start) = start {
                if sum < start {
                    continue;
                }
            }
            let mut cursor = match db.journal().open_cursor(sum, CursorOptions::default()) {
                Ok(cursor) => cursor,
                Err(e) => {
                    // Collected between the scan and the open.
                    tracing::debug!(signature = sum, error = %e, "segment vanished mid-relay");
                    continue;
                }
            };
            loop {
                match cursor.next_row() {
                    Ok(Some(row)) => {
                        if row.lsn.0 <= from.get(row.replica_id).0 {
                            continue;
                        }
                        if !send(&writer, &stop, row.encode_frame()) {
                            return Ok(());
                        }
                        if let Err(e) = from.follow(row.replica_id, row.lsn) {
                            return Err(e.into());
                        }
                        progressed = true;
                    }
                    Ok(None) => break,
                    // The hot segment can end mid-block while the writer
                    // is appending; pick the rows up on the next poll.
                    Err(
                        WalError::TruncatedHeader { .. } | WalError::TruncatedBody { .. },
                    ) => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if !progressed {
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Push one buffer toward the socket. Spins on a full queue so the
/// stop flag stays responsive even when the peer reads slowly.
fn send(writer: &mpsc::Sender<Vec<u8>>, stop: &AtomicBool, buf: Vec<u8>) -> bool {
    let mut buf = buf;
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        match writer.try_send(buf) {
            Ok(()) => return true,
            Err(TrySendError::Full(back)) => {
                buf = back;
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(TrySendError::Closed(_)) => return false,
        }
    }
}
