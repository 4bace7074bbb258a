use rand::rngs::OsRng;
use rand::RngCore;

/// High-entropy opaque token with no embedded claims. Validation is always by
/// store lookup, never by parsing.
pub fn opaque_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::opaque_token;

    #[test]
    fn tokens_are_unique_and_url_safe() {
        let a = opaque_token();
        let b = opaque_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
