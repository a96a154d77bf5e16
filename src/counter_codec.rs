//! Counter Codec
//!
//! Decodes the raw counter value kept in the coordination store. The stored text is not
//! trusted to be clean: anything that is not an ASCII digit is discarded before parsing,
//! and content that still does not parse degrades to zero instead of failing the request.

/// Decode a stored counter value.
///
/// `None` means the key has never been written.
pub fn parse(raw: Option<&[u8]>) -> u64 {
    let Some(raw) = raw else {
        return 0;
    };

    let digits: String = raw
        .iter()
        .filter(|b| b.is_ascii_digit())
        .map(|b| *b as char)
        .collect();

    if digits.is_empty() {
        return 0;
    }

    // Overflowing digit runs are treated like any other garbage
    digits.parse::<u64>().unwrap_or(0)
}

/// Encode a counter value for storage
pub fn encode(value: u64) -> String {
    value.to_string()
}
