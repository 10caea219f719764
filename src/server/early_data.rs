//! Early-data header codec
//!
//! Some tunneled protocols smuggle the first client payload inside the
//! `Sec-WebSocket-Protocol` header of the upgrade request so it reaches the
//! destination before the handshake round trip completes. The value is
//! URL-safe unpadded base64, but senders are allowed to use standard-alphabet
//! characters, so decoding first canonicalizes `+` to `-`, `/` to `_`, and
//! strips `=` padding. This encoding is an interoperability contract with an
//! external ecosystem convention and must not be altered.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Decode an early-data header value.
///
/// Returns `None` when the value does not decode; callers treat that as
/// "no early data" without surfacing an error.
#[must_use]
pub fn decode_early_data(value: &str) -> Option<Vec<u8>> {
    let canonical: String = value
        .chars()
        .filter_map(|c| match c {
            '+' => Some('-'),
            '/' => Some('_'),
            '=' => None,
            c => Some(c),
        })
        .collect();
    URL_SAFE_NO_PAD.decode(canonical).ok()
}

/// Encode bytes into an early-data header value.
#[must_use]
pub fn encode_early_data(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}
