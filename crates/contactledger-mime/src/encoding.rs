//! Decoding of transfer-encoded header text.
//!
//! Supports Base64, Quoted-Printable and RFC 2047 encoded words as they
//! appear in display names.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};

use crate::error::{Error, Result};

/// Decodes Base64 data, tolerating embedded whitespace and missing padding.
///
/// # Errors
///
/// Returns an error if the input is not valid Base64.
pub fn decode_base64(data: &str) -> Result<Vec<u8>> {
    let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    match STANDARD.decode(&compact) {
        Ok(bytes) => Ok(bytes),
        Err(_) => STANDARD_NO_PAD
            .decode(compact.trim_end_matches('='))
            .map_err(Into::into),
    }
}

/// Decodes Quoted-Printable text (RFC 2045) into raw bytes.
///
/// The caller decides the character set of the result.
///
/// # Errors
///
/// Returns an error if the input contains an invalid escape sequence.
pub fn decode_quoted_printable(text: &str) -> Result<Vec<u8>> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'=' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }

        let rest = &bytes[i + 1..];
        // Soft line breaks
        if rest.starts_with(b"\r\n") {
            i += 3;
            continue;
        }
        if rest.starts_with(b"\n") {
            i += 2;
            continue;
        }

        match rest {
            [hi, lo, ..] if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {
                out.push((hex_value(*hi) << 4) | hex_value(*lo));
                i += 3;
            }
            _ => {
                return Err(Error::InvalidEncoding(format!(
                    "invalid quoted-printable escape at byte {i}"
                )));
            }
        }
    }

    Ok(out)
}

const fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

/// Converts bytes in the named charset to a `String`.
///
/// UTF-8 and US-ASCII decode lossily; ISO-8859-1 and Windows-1252 map each
/// byte to the code point of the same value (0x80-0x9F are treated as
/// Latin-1). Unknown charsets fall back to lossy UTF-8.
#[must_use]
pub fn decode_charset(bytes: &[u8], charset: &str) -> String {
    // RFC 2231 allows a language suffix: utf-8*en
    let charset = charset.split('*').next().unwrap_or(charset);
    match charset.to_ascii_lowercase().as_str() {
        "iso-8859-1" | "iso8859-1" | "latin1" | "latin-1" | "windows-1252" | "cp1252" => {
            bytes.iter().map(|&b| char::from(b)).collect()
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Decodes every RFC 2047 encoded word found in `text`.
///
/// Format of an encoded word: `=?charset?encoding?encoded-text?=`.
/// Whitespace between two adjacent encoded words is dropped, as the RFC
/// requires. Text that merely looks like an encoded word but fails to
/// decode is kept verbatim, so this never fails.
#[must_use]
pub fn decode_rfc2047(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut previous_was_word = false;

    while let Some(start) = rest.find("=?") {
        let (before, candidate) = rest.split_at(start);
        if let Some((decoded, consumed)) = decode_encoded_word(candidate) {
            if !(previous_was_word && before.chars().all(char::is_whitespace)) {
                out.push_str(before);
            }
            out.push_str(&decoded);
            rest = &candidate[consumed..];
            previous_was_word = true;
        } else {
            out.push_str(before);
            out.push_str("=?");
            rest = &candidate[2..];
            previous_was_word = false;
        }
    }

    out.push_str(rest);
    out
}

/// Decodes one encoded word at the start of `s`.
///
/// Returns the decoded text and the number of bytes consumed.
fn decode_encoded_word(s: &str) -> Option<(String, usize)> {
    let body = s.strip_prefix("=?")?;
    let (charset, after_charset) = body.split_once('?')?;
    let (encoding, after_encoding) = after_charset.split_once('?')?;
    let end = after_encoding.find("?=")?;
    let payload = &after_encoding[..end];

    if charset.is_empty()
        || charset.contains(char::is_whitespace)
        || payload.contains(char::is_whitespace)
    {
        return None;
    }

    let bytes = match encoding {
        "B" | "b" => decode_base64(payload).ok()?,
        "Q" | "q" => decode_quoted_printable(&payload.replace('_', " ")).ok()?,
        _ => return None,
    };

    let consumed = s.len() - after_encoding.len() + end + 2;
    Some((decode_charset(&bytes, charset), consumed))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_tolerates_missing_padding() {
        assert_eq!(decode_base64("SGk=").unwrap(), b"Hi");
        assert_eq!(decode_base64("SGk").unwrap(), b"Hi");
        assert!(decode_base64("***").is_err());
    }

    #[test]
    fn test_quoted_printable_multibyte() {
        let decoded = decode_quoted_printable("H=C3=A9llo").unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "Héllo");
    }

    #[test]
    fn test_quoted_printable_soft_line_break() {
        assert_eq!(decode_quoted_printable("Hello=\r\nWorld").unwrap(), b"HelloWorld");
        assert_eq!(decode_quoted_printable("Hello=\nWorld").unwrap(), b"HelloWorld");
    }

    #[test]
    fn test_quoted_printable_bad_escape() {
        assert!(decode_quoted_printable("50=ZZ").is_err());
        assert!(decode_quoted_printable("trailing=").is_err());
    }

    #[test]
    fn test_rfc2047_plain_text_passthrough() {
        assert_eq!(decode_rfc2047("Alice Smith"), "Alice Smith");
    }

    #[test]
    fn test_rfc2047_base64_word() {
        assert_eq!(decode_rfc2047("=?utf-8?B?SMOpbGxv?="), "Héllo");
    }

    #[test]
    fn test_rfc2047_q_word_with_underscores() {
        assert_eq!(decode_rfc2047("=?UTF-8?Q?J=C3=BCrgen_M=C3=BCller?="), "Jürgen Müller");
    }

    #[test]
    fn test_rfc2047_latin1() {
        assert_eq!(decode_rfc2047("=?ISO-8859-1?Q?Andr=E9?="), "André");
    }

    #[test]
    fn test_rfc2047_adjacent_words_join() {
        let text = "=?utf-8?Q?Jos=C3=A9?= =?utf-8?Q?_Garc=C3=ADa?=";
        assert_eq!(decode_rfc2047(text), "José García");
    }

    #[test]
    fn test_rfc2047_mixed_with_plain_text() {
        assert_eq!(decode_rfc2047("Dr. =?utf-8?Q?Bj=C3=B6rn?= Berg"), "Dr. Björn Berg");
    }

    #[test]
    fn test_rfc2047_malformed_kept_verbatim() {
        assert_eq!(decode_rfc2047("=?utf-8?X?abc?="), "=?utf-8?X?abc?=");
        assert_eq!(decode_rfc2047("price =? unknown"), "price =? unknown");
        assert_eq!(decode_rfc2047("=?utf-8?Q?unterminated"), "=?utf-8?Q?unterminated");
    }
}
