//! Reserved-byte rewriting for tunneled UDP payloads
//!
//! Certain tunneled protocols embed a client marker in a reserved region at
//! payload offset 1. On the way out, that region is overwritten with the
//! configured template so the far end sees the marker it expects; on replies,
//! the same region is zeroed before delivery back to the original source.
//! The directionality is preserved exactly as observed in the wire protocol;
//! payloads not longer than the template pass through unmodified.

/// Overwrite bytes `[1, 1 + reserved.len())` with the template.
///
/// Applied to payloads heading from the inbound listener to the outbound
/// socket. No-op when the template is empty or the payload is not longer
/// than the template.
pub fn mask_outbound(payload: &mut [u8], reserved: &[u8]) {
    if !reserved.is_empty() && payload.len() > reserved.len() {
        payload[1..=reserved.len()].copy_from_slice(reserved);
    }
}

/// Zero bytes `[1, 1 + reserved.len())`.
///
/// Applied to replies heading back to the original source. Same length rule
/// as [`mask_outbound`].
pub fn clear_reply(payload: &mut [u8], reserved: &[u8]) {
    if !reserved.is_empty() && payload.len() > reserved.len() {
        payload[1..=reserved.len()].fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_outbound_overwrites_template_range() {
        let reserved = [0xaa, 0xbb, 0xcc];
        let mut payload = [1u8, 2, 3, 4, 5, 6];
        mask_outbound(&mut payload, &reserved);
        assert_eq!(payload, [1, 0xaa, 0xbb, 0xcc, 5, 6]);
    }

    #[test]
    fn test_clear_reply_zeroes_template_range() {
        let reserved = [0xaa, 0xbb, 0xcc];
        let mut payload = [9u8, 9, 9, 9, 9];
        clear_reply(&mut payload, &reserved);
        assert_eq!(payload, [9, 0, 0, 0, 9]);
    }

    #[test]
    fn test_short_payload_untouched() {
        let reserved = [0xaa, 0xbb, 0xcc];

        // Equal length: untouched.
        let mut payload = [1u8, 2, 3];
        mask_outbound(&mut payload, &reserved);
        assert_eq!(payload, [1, 2, 3]);

        clear_reply(&mut payload, &reserved);
        assert_eq!(payload, [1, 2, 3]);
    }

    #[test]
    fn test_empty_template_is_noop() {
        let mut payload = [1u8, 2, 3, 4];
        mask_outbound(&mut payload, &[]);
        clear_reply(&mut payload, &[]);
        assert_eq!(payload, [1, 2, 3, 4]);
    }

    #[test]
    fn test_byte_zero_is_never_touched() {
        let reserved = [0xff];
        let mut payload = [0x42u8, 0, 0];
        mask_outbound(&mut payload, &reserved);
        assert_eq!(payload[0], 0x42);
        clear_reply(&mut payload, &reserved);
        assert_eq!(payload[0], 0x42);
    }
}
