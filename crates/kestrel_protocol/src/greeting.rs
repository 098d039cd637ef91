//! The fixed-size plaintext greeting sent to every client on accept,
//! before any frame: two 64-byte lines, server banner then base64 salt.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::types::GREETING_SIZE;

pub const SALT_SIZE: usize = 20;

/// Render the 128-byte greeting block.
pub fn encode_greeting(version: &str, instance_uuid: &str, salt: &[u8; SALT_SIZE]) -> [u8; GREETING_SIZE] {
    let mut out = [b' '; GREETING_SIZE];
    let line1 = format!("Kestrel {version} (Binary) {instance_uuid}");
    let line2 = BASE64.encode(salt);
    copy_line(&mut out[..64], &line1);
    copy_line(&mut out[64..], &line2);
    out
}

/// Parse the salt back out of a greeting block (client side and tests).
pub fn decode_salt(greeting: &[u8]) -> Option<Vec<u8>> {
    if greeting.len() < GREETING_SIZE {
        return None;
    }
    let line2 = &greeting[64..GREETING_SIZE];
    let end = line2.iter().position(|&b| b == b'\n')?;
    BASE64.decode(&line2[..end]).ok()
}

fn copy_line(dest: &mut [u8], text: &str) {
    let bytes = text.as_bytes();
    let n = bytes.len().min(dest.len() - 1);
    dest[..n].copy_from_slice(&bytes[..n]);
    dest[n] = b'\n';
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_is_fixed_size_with_recoverable_salt() {
        let salt = [7u8; SALT_SIZE];
        let greeting = encode_greeting("0.1.0", "instance-a", &salt);
        assert_eq!(greeting.len(), GREETING_SIZE);
        assert_eq!(decode_salt(&greeting).unwrap(), salt.to_vec());
        assert!(greeting.starts_with(b"Kestrel 0.1.0"));
    }

    #[test]
    fn short_buffer_has_no_salt() {
        assert!(decode_salt(&[0u8; 10]).is_none());
    }
}
