//! Binary wire protocol for KestrelDB.
//!
//! Every frame is `<mp-uint length><header: mp map><body: mp map>`; the
//! same row shape is reused by the write-ahead log and replication, so a
//! logged row can be replayed through the ordinary dispatch path.

pub mod codec;
pub mod greeting;
pub mod row;
pub mod types;

pub use codec::{decode_frame, encode_error, encode_ok, encode_request, Frame, Header, Request};
pub use row::Row;
