//! Time-based one-time codes bound to a browser-generated identifier.
//!
//! This is a custom HMAC construction, not RFC 6238: the code is the first
//! 16 hex characters of `HMAC-SHA256(secret, "<browserId>:<windowIndex>")`
//! over 1-hour windows. Validation accepts the current and previous window to
//! tolerate requests straddling a boundary.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Prefix marking a TOTP-style API key: `totp_<browserId>_<code>`.
pub const TOTP_PREFIX: &str = "totp_";

/// Hex characters taken from the HMAC output.
pub const CODE_LEN: usize = 16;

/// Code validity window.
const WINDOW_MS: i64 = 3_600_000;

/// Window offsets accepted during validation.
const ACCEPTED_OFFSETS: [i64; 2] = [0, -1];

/// Generate the code for a given window offset relative to `now_ms`.
pub fn generate_code(browser_id: &str, secret: &str, offset: i64, now_ms: i64) -> String {
    let window = now_ms.div_euclid(WINDOW_MS) + offset;
    // HMAC accepts keys of any length, so construction cannot fail.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(browser_id.as_bytes());
    mac.update(b":");
    mac.update(window.to_string().as_bytes());
    let digest = hex::encode(mac.finalize().into_bytes());
    digest[..CODE_LEN].to_string()
}

/// Validate a presented code against the current and previous window.
pub fn validate_code(browser_id: &str, secret: &str, code: &str, now_ms: i64) -> bool {
    ACCEPTED_OFFSETS.iter().any(|offset| {
        let expected = generate_code(browser_id, secret, *offset, now_ms);
        constant_time_eq(&expected, code)
    })
}

/// Constant-time string comparison. Length mismatch short-circuits to false;
/// equal-length inputs compare every byte without early exit.
fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Split `totp_<browserId>_<code>` into its parts. The code is the final
/// `_`-separated segment; the browser id is everything in between, so an id
/// containing underscores still parses.
pub fn parse_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(TOTP_PREFIX)?;
    let (browser_id, code) = rest.rsplit_once('_')?;
    if browser_id.is_empty() || code.is_empty() {
        return None;
    }
    Some((browser_id, code))
}

/// Assemble a wire-format TOTP key.
pub fn format_key(browser_id: &str, code: &str) -> String {
    format!("{TOTP_PREFIX}{browser_id}_{code}")
}

/// 256 random bits, hex-encoded, issued as a device shared secret.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
