//! Protocol constants: request type codes, header and body map keys.

/// Maximum frame payload size (header + body): 64 MiB.
pub const MAX_FRAME_SIZE: u64 = 64 * 1024 * 1024;

/// Fixed size of the plaintext greeting sent on accept.
pub const GREETING_SIZE: usize = 128;

// ── Request type codes ───────────────────────────────────────────────────

pub const TYPE_OK: u32 = 0;
pub const TYPE_SELECT: u32 = 1;
pub const TYPE_INSERT: u32 = 2;
pub const TYPE_REPLACE: u32 = 3;
pub const TYPE_UPDATE: u32 = 4;
pub const TYPE_DELETE: u32 = 5;
pub const TYPE_UPSERT: u32 = 6;
pub const TYPE_CALL: u32 = 7;
pub const TYPE_EVAL: u32 = 8;
pub const TYPE_AUTH: u32 = 9;
pub const TYPE_PING: u32 = 10;
pub const TYPE_JOIN: u32 = 11;
pub const TYPE_SUBSCRIBE: u32 = 12;
pub const TYPE_VOTE: u32 = 13;

/// Error responses carry `TYPE_ERROR | error_code`.
pub const TYPE_ERROR: u32 = 0x8000;

// ── Header map keys ──────────────────────────────────────────────────────

pub const KEY_REQUEST_TYPE: u8 = 0x00;
pub const KEY_SYNC: u8 = 0x01;
pub const KEY_REPLICA_ID: u8 = 0x02;
pub const KEY_LSN: u8 = 0x03;
pub const KEY_TIMESTAMP: u8 = 0x04;
pub const KEY_SCHEMA_VERSION: u8 = 0x05;

// ── Body map keys ────────────────────────────────────────────────────────

pub const KEY_SPACE_ID: u8 = 0x10;
pub const KEY_INDEX_ID: u8 = 0x11;
pub const KEY_LIMIT: u8 = 0x12;
pub const KEY_OFFSET: u8 = 0x13;
pub const KEY_ITERATOR: u8 = 0x14;
pub const KEY_KEY: u8 = 0x20;
pub const KEY_TUPLE: u8 = 0x21;
pub const KEY_FUNCTION_NAME: u8 = 0x22;
pub const KEY_EXPR: u8 = 0x23;
pub const KEY_OPS: u8 = 0x24;
pub const KEY_USER_NAME: u8 = 0x25;
pub const KEY_VCLOCK: u8 = 0x26;
pub const KEY_INSTANCE_UUID: u8 = 0x27;
pub const KEY_SCRAMBLE: u8 = 0x28;
pub const KEY_DATA: u8 = 0x30;
pub const KEY_ERROR_MESSAGE: u8 = 0x31;
pub const KEY_ERROR_CODE: u8 = 0x32;

/// Human-readable name of a request type, for logs.
pub fn type_name(request_type: u32) -> &'static str {
    match request_type {
        TYPE_OK => "OK",
        TYPE_SELECT => "SELECT",
        TYPE_INSERT => "INSERT",
        TYPE_REPLACE => "REPLACE",
        TYPE_UPDATE => "UPDATE",
        TYPE_DELETE => "DELETE",
        TYPE_UPSERT => "UPSERT",
        TYPE_CALL => "CALL",
        TYPE_EVAL => "EVAL",
        TYPE_AUTH => "AUTH",
        TYPE_PING => "PING",
        TYPE_JOIN => "JOIN",
        TYPE_SUBSCRIBE => "SUBSCRIBE",
        TYPE_VOTE => "VOTE",
        t if t & TYPE_ERROR != 0 => "ERROR",
        _ => "UNKNOWN",
    }
}
