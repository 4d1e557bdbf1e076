//! Hex text rendering of frames
//!
//! Frames are logged, configured and exchanged with callers as
//! space-separated uppercase hex (`"C7 12 01 ..."`).

use crate::types::ProtocolError;

/// Render bytes as uppercase hex pairs separated by single spaces
#[must_use]
pub fn encode_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse hex text into bytes
///
/// Whitespace anywhere in the input is ignored and digits may be in either
/// case, so `"c7 12"`, `"C712"` and `" C7\t12 "` are equivalent.
pub fn decode_hex(text: &str) -> Result<Vec<u8>, ProtocolError> {
    let cleaned: String = text.split_whitespace().collect();
    if let Some(bad) = cleaned.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(ProtocolError::Format(format!(
            "invalid hex character {bad:?}"
        )));
    }
    if cleaned.len() % 2 != 0 {
        return Err(ProtocolError::Format(format!(
            "odd number of hex digits ({})",
            cleaned.len()
        )));
    }
    Ok(::hex::decode(cleaned)?)
}
