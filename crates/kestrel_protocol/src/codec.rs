//! Frame encode/decode.
//!
//! A frame is `<mp-uint length><header map><body map>`. Integer map keys
//! unknown to this version are skipped on decode.

use std::io::Cursor;

use rmpv::Value;

use kestrel_common::error::ProtocolError;
use kestrel_common::types::{IndexId, Lsn, ReplicaId, RequestSync, SchemaVersion, SpaceId};
use kestrel_common::vclock::Vclock;

use crate::types::*;

type Result<T> = std::result::Result<T, ProtocolError>;

/// Decoded frame header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    pub request_type: u32,
    pub sync: RequestSync,
    pub replica_id: ReplicaId,
    pub lsn: Lsn,
    pub timestamp: f64,
    pub schema_version: SchemaVersion,
}

/// A decoded frame: header plus the raw body map.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    pub body: Value,
}

/// A typed request, produced from a `Frame` by `Request::from_frame`.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Select {
        space_id: SpaceId,
        index_id: IndexId,
        iterator: u32,
        key: Vec<Value>,
        limit: u32,
        offset: u32,
    },
    Insert {
        space_id: SpaceId,
        tuple: Vec<Value>,
    },
    Replace {
        space_id: SpaceId,
        tuple: Vec<Value>,
    },
    Update {
        space_id: SpaceId,
        index_id: IndexId,
        key: Vec<Value>,
        ops: Vec<Value>,
    },
    Upsert {
        space_id: SpaceId,
        tuple: Vec<Value>,
        ops: Vec<Value>,
    },
    Delete {
        space_id: SpaceId,
        index_id: IndexId,
        key: Vec<Value>,
    },
    Call {
        function: String,
        args: Vec<Value>,
    },
    Eval {
        expr: String,
        args: Vec<Value>,
    },
    Auth {
        user: String,
        scramble: Vec<u8>,
    },
    Ping,
    Join {
        instance_uuid: String,
    },
    Subscribe {
        vclock: Vclock,
    },
    Vote,
}

impl Request {
    pub fn request_type(&self) -> u32 {
        match self {
            Request::Select { .. } => TYPE_SELECT,
            Request::Insert { .. } => TYPE_INSERT,
            Request::Replace { .. } => TYPE_REPLACE,
            Request::Update { .. } => TYPE_UPDATE,
            Request::Upsert { .. } => TYPE_UPSERT,
            Request::Delete { .. } => TYPE_DELETE,
            Request::Call { .. } => TYPE_CALL,
            Request::Eval { .. } => TYPE_EVAL,
            Request::Auth { .. } => TYPE_AUTH,
            Request::Ping => TYPE_PING,
            Request::Join { .. } => TYPE_JOIN,
            Request::Subscribe { .. } => TYPE_SUBSCRIBE,
            Request::Vote => TYPE_VOTE,
        }
    }
}

// ── msgpack primitives ───────────────────────────────────────────────────

fn mp_err(e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::InvalidMsgpack(e.to_string())
}

/// Decode the msgpack-uint frame length prefix. Returns `None` when the
/// buffer does not yet hold the whole prefix.
fn decode_len_prefix(buf: &[u8]) -> Result<Option<(u64, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let marker = buf[0];
    let (need, parse): (usize, fn(&[u8]) -> u64) = match marker {
        0x00..=0x7f => return Ok(Some((marker as u64, 1))),
        0xcc => (2, |b| b[1] as u64),
        0xcd => (3, |b| u16::from_be_bytes([b[1], b[2]]) as u64),
        0xce => (5, |b| u32::from_be_bytes([b[1], b[2], b[3], b[4]]) as u64),
        0xcf => (9, |b| {
            u64::from_be_bytes([b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8]])
        }),
        _ => {
            return Err(ProtocolError::InvalidMsgpack(
                "frame length must be an unsigned int".into(),
            ))
        }
    };
    if buf.len() < need {
        return Ok(None);
    }
    Ok(Some((parse(buf), need)))
}

fn write_uint(out: &mut Vec<u8>, v: u64) {
    rmp::encode::write_uint(out, v).expect("write to Vec");
}

fn write_map_len(out: &mut Vec<u8>, n: u32) {
    rmp::encode::write_map_len(out, n).expect("write to Vec");
}

fn write_array_len(out: &mut Vec<u8>, n: u32) {
    rmp::encode::write_array_len(out, n).expect("write to Vec");
}

fn write_value(out: &mut Vec<u8>, v: &Value) {
    rmpv::encode::write_value(out, v).expect("write to Vec");
}

/// Prepend the length prefix to a finished payload.
fn write_frame(payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 5);
    write_uint(&mut out, payload.len() as u64);
    out.extend_from_slice(&payload);
    out
}

// ── Header decode ────────────────────────────────────────────────────────

impl Header {
    pub fn from_value(v: &Value) -> Result<Header> {
        let entries = match v {
            Value::Map(entries) => entries,
            _ => return Err(mp_err("header is not a map")),
        };
        let mut header = Header::default();
        let mut have_type = false;
        for (key, value) in entries {
            let key = match key.as_u64() {
                Some(k) => k,
                // Non-integer keys are ignored for forward compatibility.
                None => continue,
            };
            match key as u8 {
                KEY_REQUEST_TYPE => {
                    header.request_type =
                        value.as_u64().ok_or(ProtocolError::BadField {
                            key: KEY_REQUEST_TYPE,
                        })? as u32;
                    have_type = true;
                }
                KEY_SYNC => {
                    header.sync = RequestSync(
                        value
                            .as_u64()
                            .ok_or(ProtocolError::BadField { key: KEY_SYNC })?,
                    );
                }
                KEY_REPLICA_ID => {
                    header.replica_id = ReplicaId(
                        value
                            .as_u64()
                            .ok_or(ProtocolError::BadField { key: KEY_REPLICA_ID })?
                            as u32,
                    );
                }
                KEY_LSN => {
                    header.lsn = Lsn(value
                        .as_i64()
                        .ok_or(ProtocolError::BadField { key: KEY_LSN })?);
                }
                KEY_TIMESTAMP => {
                    header.timestamp = value
                        .as_f64()
                        .ok_or(ProtocolError::BadField { key: KEY_TIMESTAMP })?;
                }
                KEY_SCHEMA_VERSION => {
                    header.schema_version = SchemaVersion(
                        value
                            .as_u64()
                            .ok_or(ProtocolError::BadField {
                                key: KEY_SCHEMA_VERSION,
                            })?,
                    );
                }
                _ => {}
            }
        }
        if !have_type {
            return Err(ProtocolError::MissingRequestType);
        }
        Ok(header)
    }
}

// ── Frame decode ─────────────────────────────────────────────────────────

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds only a partial frame; the
/// caller keeps the bytes and retries after the next read. On success the
/// second element is the number of bytes consumed.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
    let (len, prefix) = match decode_len_prefix(buf)? {
        Some(x) => x,
        None => return Ok(None),
    };
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    let total = prefix + len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let payload = &buf[prefix..total];
    let mut cur = Cursor::new(payload);
    let header_val = rmpv::decode::read_value(&mut cur).map_err(mp_err)?;
    let header = Header::from_value(&header_val)?;
    let body = if (cur.position() as usize) < payload.len() {
        rmpv::decode::read_value(&mut cur).map_err(mp_err)?
    } else {
        Value::Map(Vec::new())
    };
    Ok(Some((Frame { header, body }, total)))
}

/// Total byte extent (length prefix plus payload) of the frame at the
/// front of `buf`, once the prefix is complete. Lets a reader skip a
/// malformed frame by its declared length and resync at the next one.
pub fn frame_extent(buf: &[u8]) -> Result<Option<usize>> {
    match decode_len_prefix(buf)? {
        Some((len, prefix)) => {
            if len > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge {
                    size: len,
                    max: MAX_FRAME_SIZE,
                });
            }
            Ok(Some(prefix + len as usize))
        }
        None => Ok(None),
    }
}

// ── Body field access ────────────────────────────────────────────────────

fn body_field<'a>(body: &'a Value, key: u8) -> Option<&'a Value> {
    match body {
        Value::Map(entries) => entries
            .iter()
            .find(|(k, _)| k.as_u64() == Some(key as u64))
            .map(|(_, v)| v),
        _ => None,
    }
}

fn u32_field(body: &Value, key: u8) -> Result<Option<u32>> {
    match body_field(body, key) {
        None => Ok(None),
        Some(v) => Ok(Some(
            v.as_u64().ok_or(ProtocolError::BadField { key })? as u32
        )),
    }
}

fn str_field(body: &Value, key: u8) -> Result<Option<String>> {
    match body_field(body, key) {
        None => Ok(None),
        Some(v) => Ok(Some(
            v.as_str()
                .ok_or(ProtocolError::BadField { key })?
                .to_string(),
        )),
    }
}

fn array_field(body: &Value, key: u8) -> Result<Vec<Value>> {
    match body_field(body, key) {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(ProtocolError::BadField { key }),
    }
}

fn bin_field(body: &Value, key: u8) -> Result<Vec<u8>> {
    match body_field(body, key) {
        None => Ok(Vec::new()),
        Some(Value::Binary(b)) => Ok(b.clone()),
        Some(Value::String(s)) => Ok(s.as_bytes().to_vec()),
        Some(_) => Err(ProtocolError::BadField { key }),
    }
}

impl Request {
    /// Interpret a decoded frame as a typed request.
    pub fn from_frame(frame: &Frame) -> Result<Request> {
        let body = &frame.body;
        match frame.header.request_type {
            TYPE_SELECT => Ok(Request::Select {
                space_id: SpaceId(u32_field(body, KEY_SPACE_ID)?.unwrap_or(0)),
                index_id: IndexId(u32_field(body, KEY_INDEX_ID)?.unwrap_or(0)),
                iterator: u32_field(body, KEY_ITERATOR)?.unwrap_or(0),
                key: array_field(body, KEY_KEY)?,
                limit: u32_field(body, KEY_LIMIT)?.unwrap_or(u32::MAX),
                offset: u32_field(body, KEY_OFFSET)?.unwrap_or(0),
            }),
            TYPE_INSERT => Ok(Request::Insert {
                space_id: SpaceId(u32_field(body, KEY_SPACE_ID)?.unwrap_or(0)),
                tuple: array_field(body, KEY_TUPLE)?,
            }),
            TYPE_REPLACE => Ok(Request::Replace {
                space_id: SpaceId(u32_field(body, KEY_SPACE_ID)?.unwrap_or(0)),
                tuple: array_field(body, KEY_TUPLE)?,
            }),
            TYPE_UPDATE => Ok(Request::Update {
                space_id: SpaceId(u32_field(body, KEY_SPACE_ID)?.unwrap_or(0)),
                index_id: IndexId(u32_field(body, KEY_INDEX_ID)?.unwrap_or(0)),
                key: array_field(body, KEY_KEY)?,
                ops: array_field(body, KEY_OPS)?,
            }),
            TYPE_UPSERT => Ok(Request::Upsert {
                space_id: SpaceId(u32_field(body, KEY_SPACE_ID)?.unwrap_or(0)),
                tuple: array_field(body, KEY_TUPLE)?,
                ops: array_field(body, KEY_OPS)?,
            }),
            TYPE_DELETE => Ok(Request::Delete {
                space_id: SpaceId(u32_field(body, KEY_SPACE_ID)?.unwrap_or(0)),
                index_id: IndexId(u32_field(body, KEY_INDEX_ID)?.unwrap_or(0)),
                key: array_field(body, KEY_KEY)?,
            }),
            TYPE_CALL => Ok(Request::Call {
                function: str_field(body, KEY_FUNCTION_NAME)?
                    .ok_or(ProtocolError::BadField {
                        key: KEY_FUNCTION_NAME,
                    })?,
                args: array_field(body, KEY_TUPLE)?,
            }),
            TYPE_EVAL => Ok(Request::Eval {
                expr: str_field(body, KEY_EXPR)?.ok_or(ProtocolError::BadField {
                    key: KEY_EXPR,
                })?,
                args: array_field(body, KEY_TUPLE)?,
            }),
            TYPE_AUTH => Ok(Request::Auth {
                user: str_field(body, KEY_USER_NAME)?.unwrap_or_default(),
                scramble: bin_field(body, KEY_SCRAMBLE)?,
            }),
            TYPE_PING => Ok(Request::Ping),
            TYPE_JOIN => Ok(Request::Join {
                instance_uuid: str_field(body, KEY_INSTANCE_UUID)?.unwrap_or_default(),
            }),
            TYPE_SUBSCRIBE => {
                let vclock = match body_field(body, KEY_VCLOCK) {
                    Some(Value::Map(entries)) => {
                        let mut clock = Vclock::new();
                        for (k, v) in entries {
                            let replica = k
                                .as_u64()
                                .ok_or(ProtocolError::BadField { key: KEY_VCLOCK })?;
                            let lsn = v
                                .as_i64()
                                .ok_or(ProtocolError::BadField { key: KEY_VCLOCK })?;
                            clock.reset(ReplicaId(replica as u32), Lsn(lsn));
                        }
                        clock
                    }
                    Some(_) => return Err(ProtocolError::BadField { key: KEY_VCLOCK }),
                    None => Vclock::new(),
                };
                Ok(Request::Subscribe { vclock })
            }
            TYPE_VOTE => Ok(Request::Vote),
            other => Err(ProtocolError::UnknownRequestType(other)),
        }
    }

    pub(crate) fn body_value(&self) -> Value {
        let key_u = |k: u8| Value::from(k as u64);
        let entries: Vec<(Value, Value)> = match self {
            Request::Select {
                space_id,
                index_id,
                iterator,
                key,
                limit,
                offset,
            } => vec![
                (key_u(KEY_SPACE_ID), Value::from(space_id.0)),
                (key_u(KEY_INDEX_ID), Value::from(index_id.0)),
                (key_u(KEY_ITERATOR), Value::from(*iterator)),
                (key_u(KEY_KEY), Value::Array(key.clone())),
                (key_u(KEY_LIMIT), Value::from(*limit)),
                (key_u(KEY_OFFSET), Value::from(*offset)),
            ],
            Request::Insert { space_id, tuple } | Request::Replace { space_id, tuple } => vec![
                (key_u(KEY_SPACE_ID), Value::from(space_id.0)),
                (key_u(KEY_TUPLE), Value::Array(tuple.clone())),
            ],
            Request::Update {
                space_id,
                index_id,
                key,
                ops,
            } => vec![
                (key_u(KEY_SPACE_ID), Value::from(space_id.0)),
                (key_u(KEY_INDEX_ID), Value::from(index_id.0)),
                (key_u(KEY_KEY), Value::Array(key.clone())),
                (key_u(KEY_OPS), Value::Array(ops.clone())),
            ],
            Request::Upsert {
                space_id,
                tuple,
                ops,
            } => vec![
                (key_u(KEY_SPACE_ID), Value::from(space_id.0)),
                (key_u(KEY_TUPLE), Value::Array(tuple.clone())),
                (key_u(KEY_OPS), Value::Array(ops.clone())),
            ],
            Request::Delete {
                space_id,
                index_id,
                key,
            } => vec![
                (key_u(KEY_SPACE_ID), Value::from(space_id.0)),
                (key_u(KEY_INDEX_ID), Value::from(index_id.0)),
                (key_u(KEY_KEY), Value::Array(key.clone())),
            ],
            Request::Call { function, args } => vec![
                (key_u(KEY_FUNCTION_NAME), Value::from(function.as_str())),
                (key_u(KEY_TUPLE), Value::Array(args.clone())),
            ],
            Request::Eval { expr, args } => vec![
                (key_u(KEY_EXPR), Value::from(expr.as_str())),
                (key_u(KEY_TUPLE), Value::Array(args.clone())),
            ],
            Request::Auth { user, scramble } => vec![
                (key_u(KEY_USER_NAME), Value::from(user.as_str())),
                (key_u(KEY_SCRAMBLE), Value::Binary(scramble.clone())),
            ],
            Request::Ping | Request::Vote => Vec::new(),
            Request::Join { instance_uuid } => vec![(
                key_u(KEY_INSTANCE_UUID),
                Value::from(instance_uuid.as_str()),
            )],
            Request::Subscribe { vclock } => {
                let entries: Vec<(Value, Value)> = vclock
                    .iter()
                    .map(|(r, l)| (Value::from(r.0), Value::from(l.0)))
                    .collect();
                vec![(key_u(KEY_VCLOCK), Value::Map(entries))]
            }
        };
        Value::Map(entries)
    }
}

// ── Frame encode ─────────────────────────────────────────────────────────

/// Encode a request frame (client side and tests).
pub fn encode_request(
    sync: RequestSync,
    schema_version: SchemaVersion,
    request: &Request,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);
    write_map_len(&mut payload, 3);
    write_uint(&mut payload, KEY_REQUEST_TYPE as u64);
    write_uint(&mut payload, request.request_type() as u64);
    write_uint(&mut payload, KEY_SYNC as u64);
    write_uint(&mut payload, sync.0);
    write_uint(&mut payload, KEY_SCHEMA_VERSION as u64);
    write_uint(&mut payload, schema_version.0);
    write_value(&mut payload, &request.body_value());
    write_frame(payload)
}

/// Encode a success response. Each element of `data` is one tuple, already
/// msgpack-encoded; the bytes are spliced in without re-encoding.
pub fn encode_ok(sync: RequestSync, schema_version: SchemaVersion, data: &[Vec<u8>]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64 + data.iter().map(Vec::len).sum::<usize>());
    write_map_len(&mut payload, 3);
    write_uint(&mut payload, KEY_REQUEST_TYPE as u64);
    write_uint(&mut payload, TYPE_OK as u64);
    write_uint(&mut payload, KEY_SYNC as u64);
    write_uint(&mut payload, sync.0);
    write_uint(&mut payload, KEY_SCHEMA_VERSION as u64);
    write_uint(&mut payload, schema_version.0);
    write_map_len(&mut payload, 1);
    write_uint(&mut payload, KEY_DATA as u64);
    write_array_len(&mut payload, data.len() as u32);
    for tuple in data {
        payload.extend_from_slice(tuple);
    }
    write_frame(payload)
}

/// Encode an error response: type `TYPE_ERROR | code`, message in the body.
pub fn encode_error(
    sync: RequestSync,
    schema_version: SchemaVersion,
    code: u32,
    message: &str,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64 + message.len());
    write_map_len(&mut payload, 3);
    write_uint(&mut payload, KEY_REQUEST_TYPE as u64);
    write_uint(&mut payload, (TYPE_ERROR | code) as u64);
    write_uint(&mut payload, KEY_SYNC as u64);
    write_uint(&mut payload, sync.0);
    write_uint(&mut payload, KEY_SCHEMA_VERSION as u64);
    write_uint(&mut payload, schema_version.0);
    write_map_len(&mut payload, 2);
    write_uint(&mut payload, KEY_ERROR_CODE as u64);
    write_uint(&mut payload, code as u64);
    write_uint(&mut payload, KEY_ERROR_MESSAGE as u64);
    rmp::encode::write_str(&mut payload, message).expect("write to Vec");
    write_frame(payload)
}

/// Extract response tuples from an OK frame.
pub fn response_data(frame: &Frame) -> Option<&Vec<Value>> {
    match body_field(&frame.body, KEY_DATA) {
        Some(Value::Array(items)) => Some(items),
        _ => None,
    }
}

/// Encode a vclock acknowledgement: an OK frame whose body carries the
/// clock. Replication peers send these upstream to advance the garbage
/// collection watermark.
pub fn encode_vclock_ack(
    sync: RequestSync,
    schema_version: SchemaVersion,
    vclock: &Vclock,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);
    write_map_len(&mut payload, 3);
    write_uint(&mut payload, KEY_REQUEST_TYPE as u64);
    write_uint(&mut payload, TYPE_OK as u64);
    write_uint(&mut payload, KEY_SYNC as u64);
    write_uint(&mut payload, sync.0);
    write_uint(&mut payload, KEY_SCHEMA_VERSION as u64);
    write_uint(&mut payload, schema_version.0);
    write_map_len(&mut payload, 1);
    write_uint(&mut payload, KEY_VCLOCK as u64);
    let pairs: Vec<(Value, Value)> = vclock
        .iter()
        .map(|(r, l)| (Value::from(r.0), Value::from(l.0)))
        .collect();
    write_value(&mut payload, &Value::Map(pairs));
    write_frame(payload)
}

/// Extract the vclock from a frame body, if one is present.
pub fn frame_vclock(frame: &Frame) -> Option<Vclock> {
    match body_field(&frame.body, KEY_VCLOCK) {
        Some(Value::Map(entries)) => {
            let mut clock = Vclock::new();
            for (k, v) in entries {
                let replica = k.as_u64()?;
                let lsn = v.as_i64()?;
                clock.reset(ReplicaId(replica as u32), Lsn(lsn));
            }
            Some(clock)
        }
        _ => None,
    }
}

/// Extract `(code, message)` from an error frame.
pub fn response_error(frame: &Frame) -> Option<(u32, String)> {
    if frame.header.request_type & TYPE_ERROR == 0 {
        return None;
    }
    let code = frame.header.request_type & !TYPE_ERROR;
    let message = body_field(&frame.body, KEY_ERROR_MESSAGE)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Some((code, message))
}
