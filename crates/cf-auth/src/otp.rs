//! Counter-based one-time passwords
//!
//! RFC 4226 dynamic truncation over HMAC-SHA256, six digits.

use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use cf_core::token::{random_bytes, tokens_match};

type HmacSha256 = Hmac<Sha256>;

pub const OTP_DIGITS: u32 = 6;

/// Seed length for new second factors
pub const OTP_SEED_BYTES: usize = 20;

pub fn generate_seed() -> Vec<u8> {
    random_bytes(OTP_SEED_BYTES)
}

/// The code for `counter`
pub fn hotp(seed: &[u8], counter: u64) -> Result<String, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(seed)?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let code = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    Ok(format!(
        "{:0width$}",
        code % 10u32.pow(OTP_DIGITS),
        width = OTP_DIGITS as usize
    ))
}

/// The next `count` codes starting at `counter`
pub fn next_codes(seed: &[u8], counter: u64, count: usize) -> Result<Vec<String>, InvalidLength> {
    (0..count as u64).map(|i| hotp(seed, counter + i)).collect()
}

/// Look for `code` in `counter..=counter + window`.
///
/// Returns the counter to store next (one past the match), or `None`.
pub fn verify(
    seed: &[u8],
    counter: u64,
    code: &str,
    window: u64,
) -> Result<Option<u64>, InvalidLength> {
    let code = code.trim();
    if code.len() != OTP_DIGITS as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(None);
    }
    for candidate in counter..=counter.saturating_add(window) {
        if tokens_match(&hotp(seed, candidate)?, code) {
            return Ok(Some(candidate + 1));
        }
    }
    Ok(None)
}

/// Provisioning URL shown to the user
pub fn otp_url(issuer: &str, account: &str, seed: &[u8], counter: u64) -> String {
    format!(
        "otpauth://hotp/{issuer}:{account}?secret={}&issuer={issuer}&counter={counter}&algorithm=SHA256&digits={OTP_DIGITS}",
        hex::encode(seed)
    )
}

/// Seed and counter from a provisioning URL
pub fn parse_otp_url(url: &str) -> Option<(Vec<u8>, u64)> {
    let (_, query) = url.strip_prefix("otpauth://hotp/")?.split_once('?')?;
    let mut seed = None;
    let mut counter = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("secret", value)) => seed = hex::decode(value).ok(),
            Some(("counter", value)) => counter = value.parse().ok(),
            _ => {}
        }
    }
    Some((seed?, counter?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &[u8] = b"12345678901234567890";

    #[test]
    fn test_codes_are_six_digits_and_deterministic() {
        let a = hotp(SEED, 0).unwrap();
        assert_eq!(a.len(), 6);
        assert!(a.bytes().all(|b| b.is_ascii_digit()));
        assert_eq!(a, hotp(SEED, 0).unwrap());
        assert_eq!(next_codes(SEED, 0, 3).unwrap()[0], a);
    }

    #[test]
    fn test_verify_advances_past_match() {
        let code = hotp(SEED, 2).unwrap();
        assert_eq!(verify(SEED, 0, &code, 5).unwrap(), Some(3));
        // Replaying the same code against the advanced counter fails
        assert_eq!(verify(SEED, 3, &code, 5).unwrap(), None);
    }

    #[test]
    fn test_verify_outside_window() {
        let code = hotp(SEED, 10).unwrap();
        assert_eq!(verify(SEED, 0, &code, 5).unwrap(), None);
    }

    #[test]
    fn test_verify_rejects_malformed() {
        assert_eq!(verify(SEED, 0, "", 5).unwrap(), None);
        assert_eq!(verify(SEED, 0, "12ab56", 5).unwrap(), None);
        assert_eq!(verify(SEED, 0, "1234567", 5).unwrap(), None);
    }

    #[test]
    fn test_url_roundtrip() {
        let url = otp_url("example.com", "bob", SEED, 4);
        assert!(url.starts_with("otpauth://hotp/example.com:bob?"));
        assert_eq!(parse_otp_url(&url), Some((SEED.to_vec(), 4)));
        assert_eq!(parse_otp_url("https://example.com"), None);
    }
}
