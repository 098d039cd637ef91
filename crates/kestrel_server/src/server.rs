//! The TCP server: accept, greet, then feed the two-context pipeline.
//!
//! The network context owns sockets and buffers; every request crosses
//! to the tx thread and every response comes back as part of a batch.
//! JOIN/SUBSCRIBE flip the connection into streaming mode: the reader
//! only consumes vclock acks from then on and the relay owns the output.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use kestrel_common::config::KestrelConfig;
use kestrel_common::error::KestrelError;
use kestrel_common::types::RequestSync;
use kestrel_engine::Database;
use kestrel_protocol::codec::{self, encode_error, Request};
use kestrel_protocol::greeting::{encode_greeting, SALT_SIZE};

use crate::connection::{ConnId, ConnShared, ConnState, InputBuffers, Split};
use crate::pipeline::{self, Admit, Completion, Governor, TxMsg, TxRequest};
use crate::relay::{self, RelayMode};

/// Write-queue depth per connection; overflow drops the connection as a
/// hopelessly slow consumer.
const WRITE_QUEUE_DEPTH: usize = 1024;

struct ConnEntry {
    shared: Arc<ConnShared>,
    writer: mpsc::Sender<Vec<u8>>,
}

enum ReadOutcome {
    Closed,
    Takeover { mode: RelayMode, sync: RequestSync },
}

pub struct KestrelServer {
    config: KestrelConfig,
    db: Arc<Database>,
    governor: Arc<Governor>,
    conns: Arc<DashMap<u64, ConnEntry>>,
    to_tx: mpsc::Sender<TxMsg>,
    conn_seq: AtomicU64,
}

impl KestrelServer {
    /// Wire up the pipeline: the tx thread on one side, the batch
    /// dispatcher task on the other. Must run inside a tokio runtime.
    pub fn new(config: KestrelConfig, db: Arc<Database>) -> Arc<KestrelServer> {
        let (to_tx, tx_rx) = mpsc::channel(config.pipeline.queue_depth);
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        pipeline::spawn_tx_thread(
            Arc::clone(&db),
            tx_rx,
            batch_tx,
            config.pipeline.timeslice_requests,
        );

        let governor = Arc::new(Governor::new(config.pipeline.msg_budget_per_conn));
        let conns: Arc<DashMap<u64, ConnEntry>> = Arc::new(DashMap::new());
        tokio::spawn(dispatch_batches(
            Arc::clone(&conns),
            Arc::clone(&governor),
            batch_rx,
        ));

        Arc::new(KestrelServer {
            config,
            db,
            governor,
            conns,
            to_tx,
            conn_seq: AtomicU64::new(0),
        })
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Accept until `shutdown` resolves, then drain in-flight work.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> Result<(), KestrelError> {
        tokio::pin!(shutdown);
        tracing::info!(addr = ?listener.local_addr().ok(), "serving");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let max = self.config.server.max_connections;
                            if max > 0 && self.conns.len() >= max {
                                tracing::warn!(%peer, "connection limit reached, refusing");
                                drop(stream);
                                continue;
                            }
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_conn(stream).await {
                                    tracing::debug!(%peer, error = %e, "connection ended with error");
                                }
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    }
                }
                _ = &mut shutdown => break,
            }
        }
        self.drain().await;
        Ok(())
    }

    /// Wait for in-flight requests to complete, bounded.
    async fn drain(&self) {
        tracing::info!("draining connections");
        for entry in self.conns.iter() {
            entry.shared.set_state(ConnState::Draining);
            entry.shared.wake.notify_one();
        }
        for _ in 0..100 {
            let busy = self
                .conns
                .iter()
                .any(|entry| entry.shared.total_pending() > 0);
            if !busy {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn handle_conn(self: Arc<Self>, mut stream: TcpStream) -> Result<(), KestrelError> {
        let conn_id = ConnId(self.conn_seq.fetch_add(1, Ordering::Relaxed) + 1);
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let shared = Arc::new(ConnShared::new(conn_id, salt));

        // Handshake: the greeting goes out before anything else; a
        // failure here closes the connection outright.
        let greeting = encode_greeting(
            env!("CARGO_PKG_VERSION"),
            self.db.instance_uuid(),
            &salt,
        );
        if let Err(e) = stream.write_all(&greeting).await {
            tracing::debug!(conn = %conn_id, error = %e, "greeting failed");
            return Ok(());
        }

        let (mut read_half, mut write_half) = stream.into_split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);
        self.conns.insert(
            conn_id.0,
            ConnEntry {
                shared: Arc::clone(&shared),
                writer: writer_tx.clone(),
            },
        );
        self.governor.connect();
        tracing::debug!(conn = %conn_id, "connection established");

        let writer_task = tokio::spawn(async move {
            while let Some(buf) = writer_rx.recv().await {
                if write_half.write_all(&buf).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let outcome = self
            .read_loop(conn_id, &shared, &mut read_half, &writer_tx)
            .await;

        if let ReadOutcome::Takeover { mode, sync } = outcome {
            self.run_relay(conn_id, &shared, &mut read_half, &writer_tx, mode, sync)
                .await;
        }

        // Destruction is deferred until nothing references the input
        // buffers: every decoded request has completed.
        while shared.total_pending() > 0 {
            shared.wake.notified().await;
        }
        self.conns.remove(&conn_id.0);
        self.governor.disconnect();
        shared.set_state(ConnState::Closed);
        drop(writer_tx);
        let _ = writer_task.await;
        tracing::debug!(conn = %conn_id, requests = shared.request_count(), "connection closed");
        Ok(())
    }

    async fn read_loop(
        &self,
        conn_id: ConnId,
        shared: &Arc<ConnShared>,
        read_half: &mut OwnedReadHalf,
        writer_tx: &mpsc::Sender<Vec<u8>>,
    ) -> ReadOutcome {
        let mut input = InputBuffers::new(Arc::clone(shared), self.config.pipeline.readahead);
        loop {
            // Hold here while stopped by the governor or while both
            // input buffers are pinned by in-flight requests.
            loop {
                match shared.state() {
                    ConnState::Closed | ConnState::Draining => return ReadOutcome::Closed,
                    ConnState::Stopped => {
                        shared.wake.notified().await;
                        continue;
                    }
                    _ => {}
                }
                if input.can_read() {
                    break;
                }
                shared.wake.notified().await;
            }

            let n = tokio::select! {
                read = read_half.read_buf(input.read_target()) => match read {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!(conn = %conn_id, error = %e, "read error");
                        return ReadOutcome::Closed;
                    }
                },
                // A state change (drain, forced close) interrupts the read.
                _ = shared.wake.notified() => continue,
            };
            if n == 0 {
                return ReadOutcome::Closed;
            }

            loop {
                match input.split_frame() {
                    Split::NeedMore => break,
                    Split::Fatal(e) => {
                        tracing::warn!(conn = %conn_id, error = %e, "unrecoverable frame stream, closing");
                        return ReadOutcome::Closed;
                    }
                    Split::Malformed(e) => {
                        // One bad frame does not kill the connection: a
                        // best-effort error reply goes straight out and
                        // the stream already resynced past the frame.
                        tracing::debug!(conn = %conn_id, error = %e, "frame decode error");
                        let err: KestrelError = e.into();
                        let reply = encode_error(
                            RequestSync(0),
                            self.db.schema_version(),
                            err.error_code(),
                            &err.to_string(),
                        );
                        let _ = writer_tx.try_send(reply);
                    }
                    Split::Frame(frame, src_buf) => {
                        let sync = frame.header.sync;
                        match Request::from_frame(&frame) {
                            Err(e) => {
                                let err: KestrelError = e.into();
                                let reply = encode_error(
                                    sync,
                                    self.db.schema_version(),
                                    err.error_code(),
                                    &err.to_string(),
                                );
                                let _ = writer_tx.try_send(reply);
                                shared.complete(src_buf);
                            }
                            Ok(Request::Join { instance_uuid }) => {
                                tracing::info!(conn = %conn_id, peer = %instance_uuid, "join requested");
                                shared.complete(src_buf);
                                shared.set_state(ConnState::Streaming);
                                return ReadOutcome::Takeover {
                                    mode: RelayMode::Join,
                                    sync,
                                };
                            }
                            Ok(Request::Subscribe { vclock }) => {
                                tracing::info!(conn = %conn_id, from = %vclock, "subscribe requested");
                                shared.complete(src_buf);
                                shared.set_state(ConnState::Streaming);
                                return ReadOutcome::Takeover {
                                    mode: RelayMode::Subscribe { from: vclock },
                                    sync,
                                };
                            }
                            Ok(request) => {
                                let admit = self.governor.acquire(shared);
                                let msg = TxMsg::Request(TxRequest {
                                    conn: Arc::clone(shared),
                                    src_buf,
                                    sync,
                                    schema_version: frame.header.schema_version,
                                    request,
                                });
                                if let Err(rejected) = self.to_tx.send(msg).await {
                                    // The tx context is gone; undo the
                                    // accounting so teardown can finish.
                                    let TxMsg::Request(req) = rejected.0;
                                    shared.complete(req.src_buf);
                                    self.governor.release();
                                    return ReadOutcome::Closed;
                                }
                                if admit == Admit::Stop {
                                    // The outer loop parks on the wake
                                    // until a completion resumes us.
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// The streaming half-life of a connection: the relay pushes rows
    /// from a blocking thread while this loop consumes vclock acks.
    async fn run_relay(
        &self,
        conn_id: ConnId,
        shared: &Arc<ConnShared>,
        read_half: &mut OwnedReadHalf,
        writer_tx: &mpsc::Sender<Vec<u8>>,
        mode: RelayMode,
        sync: RequestSync,
    ) {
        let relay_id = self.db.relays().register();
        let db = Arc::clone(&self.db);
        let writer = writer_tx.clone();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let relay_stop = Arc::clone(&stop);
        let relay_task = tokio::task::spawn_blocking(move || {
            relay::run(db, relay_id, mode, sync, writer, relay_stop)
        });

        let mut buf = BytesMut::with_capacity(4096);
        'acks: loop {
            buf.reserve(1024);
            let n = match read_half.read_buf(&mut buf).await {
                Ok(n) => n,
                Err(_) => break,
            };
            if n == 0 {
                break;
            }
            loop {
                let total = match codec::frame_extent(&buf) {
                    Ok(Some(total)) if buf.len() >= total => total,
                    Ok(_) => break,
                    Err(_) => break 'acks,
                };
                if let Ok(Some((frame, _))) = codec::decode_frame(&buf[..total]) {
                    if let Some(vclock) = codec::frame_vclock(&frame) {
                        tracing::debug!(conn = %conn_id, ack = %vclock, "relay ack");
                        self.db.relays().ack(relay_id, vclock);
                        self.db.collect_garbage();
                    }
                }
                let _ = buf.split_to(total);
            }
        }

        stop.store(true, std::sync::atomic::Ordering::Release);
        self.db.relays().unregister(relay_id);
        match relay_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(conn = %conn_id, error = %e, "relay failed"),
            Err(e) => tracing::warn!(conn = %conn_id, error = %e, "relay task panicked"),
        }
    }
}

async fn dispatch_batches(
    conns: Arc<DashMap<u64, ConnEntry>>,
    governor: Arc<Governor>,
    mut batches: mpsc::UnboundedReceiver<Vec<Completion>>,
) {
    while let Some(batch) = batches.recv().await {
        for completion in batch {
            governor.release();
            if let Some(entry) = conns.get(&completion.conn_id) {
                // Account first: the reader's buffer lifecycle and the
                // connection teardown both wait on the pending counts.
                entry.shared.complete(completion.src_buf);
                if entry.writer.try_send(completion.payload).is_err()
                    && entry.shared.state() != ConnState::Closed
                {
                    // The peer is not draining its responses; cut it
                    // loose rather than buffer without bound. The reader
                    // task does the actual teardown.
                    tracing::warn!(conn = completion.conn_id, "write queue overflow, closing");
                    entry.shared.set_state(ConnState::Closed);
                    entry.shared.wake.notify_one();
                }
            }
        }
    }
}
