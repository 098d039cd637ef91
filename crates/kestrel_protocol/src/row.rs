//! Log/replication rows.
//!
//! A row is `<header map><body map>` with the same keys as a request
//! frame but no length prefix: rows are self-delimiting and concatenated
//! inside WAL blocks, and a recovered row replays through the ordinary
//! request dispatch path.

use std::io::Cursor;

use rmpv::Value;

use kestrel_common::error::ProtocolError;
use kestrel_common::types::{Lsn, ReplicaId};

use crate::codec::{Frame, Header, Request};
use crate::types::*;

type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub request_type: u32,
    pub replica_id: ReplicaId,
    pub lsn: Lsn,
    pub timestamp: f64,
    /// Raw msgpack body map, preserved byte-for-byte across a log
    /// round-trip.
    pub body: Vec<u8>,
}

impl Row {
    /// Build a row from a request about to be logged.
    pub fn from_request(
        replica_id: ReplicaId,
        lsn: Lsn,
        timestamp: f64,
        request: &Request,
    ) -> Row {
        let mut body = Vec::new();
        rmpv::encode::write_value(&mut body, &request.body_value()).expect("write to Vec");
        Row {
            request_type: request.request_type(),
            replica_id,
            lsn,
            timestamp,
            body,
        }
    }

    /// Re-interpret the row body as a typed request, for replay.
    pub fn to_request(&self) -> Result<Request> {
        let mut cur = Cursor::new(self.body.as_slice());
        let body = if self.body.is_empty() {
            Value::Map(Vec::new())
        } else {
            rmpv::decode::read_value(&mut cur)
                .map_err(|e| ProtocolError::InvalidMsgpack(e.to_string()))?
        };
        let frame = Frame {
            header: Header {
                request_type: self.request_type,
                replica_id: self.replica_id,
                lsn: self.lsn,
                timestamp: self.timestamp,
                ..Header::default()
            },
            body,
        };
        Request::from_frame(&frame)
    }

    /// Append the encoded row to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        rmp::encode::write_map_len(out, 4).expect("write to Vec");
        rmp::encode::write_uint(out, KEY_REQUEST_TYPE as u64).expect("write to Vec");
        rmp::encode::write_uint(out, self.request_type as u64).expect("write to Vec");
        rmp::encode::write_uint(out, KEY_REPLICA_ID as u64).expect("write to Vec");
        rmp::encode::write_uint(out, self.replica_id.0 as u64).expect("write to Vec");
        rmp::encode::write_uint(out, KEY_LSN as u64).expect("write to Vec");
        rmp::encode::write_sint(out, self.lsn.0).expect("write to Vec");
        rmp::encode::write_uint(out, KEY_TIMESTAMP as u64).expect("write to Vec");
        rmp::encode::write_f64(out, self.timestamp).expect("write to Vec");
        out.extend_from_slice(&self.body);
    }

    /// Encode the row as a complete length-prefixed frame, for pushing
    /// over a replication stream. The peer decodes it like any request.
    pub fn encode_frame(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(32 + self.body.len());
        self.encode(&mut payload);
        let mut out = Vec::with_capacity(payload.len() + 5);
        rmp::encode::write_uint(&mut out, payload.len() as u64).expect("write to Vec");
        out.extend_from_slice(&payload);
        out
    }

    /// Decode one row from the front of `buf`; returns the row and the
    /// number of bytes consumed. The body bytes are taken verbatim.
    pub fn decode(buf: &[u8]) -> Result<(Row, usize)> {
        let mut cur = Cursor::new(buf);
        let header_val = rmpv::decode::read_value(&mut cur)
            .map_err(|e| ProtocolError::InvalidMsgpack(e.to_string()))?;
        let header = Header::from_value(&header_val)?;
        let body_start = cur.position() as usize;
        rmpv::decode::read_value(&mut cur)
            .map_err(|e| ProtocolError::InvalidMsgpack(e.to_string()))?;
        let body_end = cur.position() as usize;
        Ok((
            Row {
                request_type: header.request_type,
                replica_id: header.replica_id,
                lsn: header.lsn,
                timestamp: header.timestamp,
                body: buf[body_start..body_end].to_vec(),
            },
            body_end,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::types::SpaceId;

    fn sample_row(lsn: i64) -> Row {
        Row::from_request(
            ReplicaId(1),
            Lsn(lsn),
            1_700_000_000.5,
            &Request::Replace {
                space_id: SpaceId(512),
                tuple: vec![Value::from(lsn as u64), Value::from("payload")],
            },
        )
    }

    #[test]
    fn encode_decode_roundtrip() {
        let row = sample_row(42);
        let mut buf = Vec::new();
        row.encode(&mut buf);
        let (decoded, consumed) = Row::decode(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, row);
    }

    #[test]
    fn concatenated_rows_decode_in_order() {
        let mut buf = Vec::new();
        for lsn in 1..=5 {
            sample_row(lsn).encode(&mut buf);
        }
        let mut offset = 0;
        for lsn in 1..=5 {
            let (row, consumed) = Row::decode(&buf[offset..]).unwrap();
            assert_eq!(row.lsn, Lsn(lsn));
            offset += consumed;
        }
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn row_replays_as_request() {
        let row = sample_row(7);
        let request = row.to_request().unwrap();
        match request {
            Request::Replace { space_id, tuple } => {
                assert_eq!(space_id, SpaceId(512));
                assert_eq!(tuple[0], Value::from(7u64));
            }
            other => panic!("expected Replace, got {other:?}"),
        }
    }

    #[test]
    fn frame_encoding_decodes_as_frame() {
        let row = sample_row(11);
        let bytes = row.encode_frame();
        let (frame, consumed) = crate::codec::decode_frame(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(frame.header.lsn, Lsn(11));
        assert_eq!(frame.header.replica_id, ReplicaId(1));
        assert!(Request::from_frame(&frame).is_ok());
    }

    #[test]
    fn body_bytes_preserved_verbatim() {
        let row = sample_row(3);
        let mut buf = Vec::new();
        row.encode(&mut buf);
        let (decoded, _) = Row::decode(&buf).unwrap();
        assert_eq!(decoded.body, row.body);
    }
}
