//! Lenient base64 as found in subscription payloads
//!
//! Providers mix the standard and URL-safe alphabets, wrap lines and drop
//! padding. Everything is folded onto the standard alphabet and decoded
//! with padding optional.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;

const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

const URL_SAFE_NO_PAD: GeneralPurpose =
    GeneralPurpose::new(&alphabet::URL_SAFE, GeneralPurposeConfig::new().with_encode_padding(false));

/// Decode either alphabet, ignoring whitespace and missing padding
pub fn decode(input: &str) -> Option<Vec<u8>> {
    let folded: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            c => c,
        })
        .collect();

    if folded.is_empty() {
        return None;
    }
    LENIENT.decode(folded).ok()
}

/// Decode to text; `None` unless the result is valid UTF-8
pub fn decode_str(input: &str) -> Option<String> {
    decode(input).and_then(|bytes| String::from_utf8(bytes).ok())
}

/// URL-safe encoding without padding, as used inside SSR links
pub fn encode_url_safe(input: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(input)
}

/// Subscription body with an optional base64 wrapper removed
pub fn unwrap_body(body: &str) -> String {
    let body = body.trim();
    match decode_str(body) {
        Some(decoded) if !decoded.trim().is_empty() => decoded.trim().to_string(),
        _ => body.to_string(),
    }
}
