//! Random secrets and constant-time comparison
//!
//! Tokens are 32 bytes of OS randomness, hex-encoded (64 chars). Comparisons
//! never short-circuit on the first differing byte.

use rand::RngCore;
use subtle::ConstantTimeEq;

/// Length of a generated token in bytes (before hex encoding)
pub const TOKEN_BYTES: usize = 32;

/// Generate a new random hex token
pub fn generate_token() -> String {
    hex::encode(random_bytes(TOKEN_BYTES))
}

/// Generate `len` random bytes, for nonces and seeds
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Constant-time equality for secrets
pub fn tokens_match(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_token_format() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(generate_token(), generate_token());
    }

    #[test]
    fn test_tokens_match() {
        let token = generate_token();
        assert!(tokens_match(&token, &token.clone()));
        assert!(!tokens_match(&token, &generate_token()));
        assert!(!tokens_match("short", "longer-value"));
        assert!(!tokens_match("", "x"));
    }
}
