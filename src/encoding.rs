//! Low-level binary writers for the WebAssembly module format.
//!
//! Everything here appends to a plain byte buffer; sizing and section
//! framing happen in [`crate::module`].

use crate::error::{Error, Result};

/// Guard a count or index against the u32 ceiling the format imposes.
pub(crate) fn ensure_u32(value: usize, message: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::codegen(message.to_string()))
}

pub(crate) fn write_u32(buf: &mut Vec<u8>, value: u32) {
    let mut val = value;
    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;
        if val != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if val == 0 {
            break;
        }
    }
}

pub(crate) fn write_i32(buf: &mut Vec<u8>, value: i32) {
    write_signed(buf, i64::from(value));
}

pub(crate) fn write_i64(buf: &mut Vec<u8>, value: i64) {
    write_signed(buf, value);
}

/// Signed 33-bit LEB used for block types carrying a type index.
pub(crate) fn write_s33(buf: &mut Vec<u8>, value: i64) {
    write_signed(buf, value);
}

fn write_signed(buf: &mut Vec<u8>, value: i64) {
    let mut val = value;
    loop {
        let byte = (val & 0x7F) as u8;
        let sign_bit = byte & 0x40;
        val >>= 7;
        let done = (val == 0 && sign_bit == 0) || (val == -1 && sign_bit != 0);
        buf.push(if done { byte } else { byte | 0x80 });
        if done {
            break;
        }
    }
}

pub(crate) fn write_f32(buf: &mut Vec<u8>, value: f32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_f64(buf: &mut Vec<u8>, value: f64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Length-prefixed UTF-8 name.
pub(crate) fn push_string(buf: &mut Vec<u8>, text: &str) -> Result<()> {
    let len = ensure_u32(text.len(), "name length exceeds WebAssembly limits")?;
    write_u32(buf, len);
    buf.extend_from_slice(text.as_bytes());
    Ok(())
}

/// Length-prefixed raw bytes (data segment payloads).
pub(crate) fn push_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let len = ensure_u32(bytes.len(), "byte payload exceeds WebAssembly limits")?;
    write_u32(buf, len);
    buf.extend_from_slice(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{write_i32, write_i64, write_s33, write_u32};

    #[test]
    fn write_u32_encodes_multi_byte_values() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 0x3FFF); // requires two bytes
        assert_eq!(buf, vec![0xFF, 0x7F]);

        buf.clear();
        write_u32(&mut buf, 624_485);
        assert_eq!(buf, vec![0xE5, 0x8E, 0x26]);
    }

    #[test]
    fn write_i32_handles_negative_values() {
        let mut buf = Vec::new();
        write_i32(&mut buf, -1);
        assert_eq!(buf, vec![0x7F]);

        buf.clear();
        write_i32(&mut buf, -123_456);
        assert_eq!(buf, vec![0xC0, 0xBB, 0x78]);
    }

    #[test]
    fn write_i64_round_trips_boundary_values() {
        let mut buf = Vec::new();
        write_i64(&mut buf, 64);
        // 64 sets the sign bit of the first chunk, forcing a second byte.
        assert_eq!(buf, vec![0xC0, 0x00]);
    }

    #[test]
    fn write_s33_matches_signed_encoding_for_indices() {
        let mut direct = Vec::new();
        write_s33(&mut direct, 7);
        let mut signed = Vec::new();
        super::write_signed(&mut signed, 7);
        assert_eq!(direct, signed);
    }
}
