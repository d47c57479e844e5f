//! Address-list parsing for `From`, `To`, `Cc` and `Bcc` header values.
//!
//! The parser is deliberately forgiving: it splits a header value into
//! entries and extracts whatever display name and address it can find.
//! Validation is a separate step so callers can decide what to do with
//! entries that carry a usable name but no usable address.

use crate::encoding::decode_rfc2047;

/// Maximum length of an address (RFC 5321 path limit).
const MAX_ADDRESS_LENGTH: usize = 254;

/// One entry of an address list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    /// The entry as written in the header, trimmed.
    pub raw: String,
    /// Decoded, unquoted display name (if any).
    pub display_name: Option<String>,
    /// The addr-spec text (if any). Not validated.
    pub address: Option<String>,
}

/// Reasons an address fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// Address is empty.
    #[error("address is empty")]
    Empty,
    /// Address has no `@`.
    #[error("address has no @")]
    MissingAt,
    /// Nothing before the `@`.
    #[error("local part is empty")]
    EmptyLocalPart,
    /// Domain is empty or not a dotted host name.
    #[error("domain is invalid")]
    InvalidDomain,
    /// Address contains whitespace or control characters.
    #[error("address contains whitespace or control characters")]
    InvalidCharacter,
    /// Address exceeds the maximum path length.
    #[error("address is too long")]
    TooLong,
}

/// Splits an address-list header value into entries.
///
/// Handles quoted display names (with embedded commas), RFC 2047 encoded
/// names, `(comments)`, `<angle-addr>` forms, bare addr-specs, and group
/// syntax (`Team: a@x.org, b@x.org;`). Empty entries are dropped.
#[must_use]
pub fn parse_address_list(value: &str) -> Vec<AddressEntry> {
    split_entries(value)
        .iter()
        .map(|raw| parse_entry(raw))
        .collect()
}

/// Validates an addr-spec (basic structural checks only).
///
/// # Errors
///
/// Returns the first structural problem found.
pub fn validate_address(address: &str) -> Result<(), AddressError> {
    if address.is_empty() {
        return Err(AddressError::Empty);
    }
    if address.len() > MAX_ADDRESS_LENGTH {
        return Err(AddressError::TooLong);
    }
    if address.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(AddressError::InvalidCharacter);
    }

    let (local, domain) = address.rsplit_once('@').ok_or(AddressError::MissingAt)?;
    if local.is_empty() {
        return Err(AddressError::EmptyLocalPart);
    }
    if local.contains('@') && !local.starts_with('"') {
        return Err(AddressError::InvalidCharacter);
    }
    if !is_host_name(domain) {
        return Err(AddressError::InvalidDomain);
    }

    Ok(())
}

fn is_host_name(domain: &str) -> bool {
    !domain.is_empty()
        && domain.contains('.')
        && domain.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_alphanumeric() || c == '-')
        })
}

/// Splits on top-level commas and semicolons, dropping group names.
fn split_entries(value: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;
    let mut comment_depth = 0usize;
    let mut escaped = false;

    for ch in value.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }

        let top_level = !in_quotes && !in_angle && comment_depth == 0;
        match ch {
            '\\' if in_quotes || comment_depth > 0 => {
                current.push(ch);
                escaped = true;
            }
            '"' if comment_depth == 0 => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            '(' if !in_quotes => {
                comment_depth += 1;
                current.push(ch);
            }
            ')' if !in_quotes && comment_depth > 0 => {
                comment_depth -= 1;
                current.push(ch);
            }
            '<' if !in_quotes && comment_depth == 0 => {
                in_angle = true;
                current.push(ch);
            }
            '>' if !in_quotes && comment_depth == 0 => {
                in_angle = false;
                current.push(ch);
            }
            ',' | ';' if top_level => push_entry(&mut entries, &mut current),
            // Group display name: "Team: a@x.org, b@x.org;"
            ':' if top_level => current.clear(),
            _ => current.push(ch),
        }
    }

    push_entry(&mut entries, &mut current);
    entries
}

fn push_entry(entries: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        entries.push(trimmed.to_string());
    }
    current.clear();
}

fn parse_entry(raw: &str) -> AddressEntry {
    let (text, comment) = strip_comments(raw);

    let (name, address) = match find_unquoted(&text, '<') {
        Some(open) => {
            let inner = &text[open + 1..];
            let address = inner.split('>').next().unwrap_or_default();
            (clean_display_name(&text[..open]), clean_address(address))
        }
        None => {
            let trimmed = text.trim();
            if trimmed.contains('@') {
                (None, clean_address(trimmed))
            } else {
                (clean_display_name(trimmed), None)
            }
        }
    };

    AddressEntry {
        raw: raw.to_string(),
        display_name: name.or_else(|| comment.as_deref().and_then(clean_display_name)),
        address,
    }
}

/// Removes `(comments)` outside quotes, returning the first comment's text.
fn strip_comments(raw: &str) -> (String, Option<String>) {
    let mut text = String::with_capacity(raw.len());
    let mut first_comment: Option<String> = None;
    let mut comment = String::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;

    for ch in raw.chars() {
        if escaped {
            if depth > 0 {
                comment.push(ch);
            } else {
                text.push(ch);
            }
            escaped = false;
            continue;
        }

        match ch {
            '\\' if in_quotes || depth > 0 => {
                escaped = true;
                if depth == 0 {
                    text.push(ch);
                }
            }
            '"' if depth == 0 => {
                in_quotes = !in_quotes;
                text.push(ch);
            }
            '(' if !in_quotes => {
                if depth > 0 {
                    comment.push(ch);
                }
                depth += 1;
            }
            ')' if !in_quotes && depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if first_comment.is_none() {
                        first_comment = Some(std::mem::take(&mut comment));
                    }
                    comment.clear();
                } else {
                    comment.push(ch);
                }
            }
            _ if depth > 0 => comment.push(ch),
            _ => text.push(ch),
        }
    }

    (text, first_comment)
}

fn find_unquoted(text: &str, needle: char) -> Option<usize> {
    let mut in_quotes = false;
    let mut escaped = false;
    for (idx, ch) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            c if c == needle && !in_quotes => return Some(idx),
            _ => {}
        }
    }
    None
}

fn clean_display_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let unquoted = if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        unescape(&trimmed[1..trimmed.len() - 1])
    } else {
        trimmed.replace('"', "")
    };

    let decoded = decode_rfc2047(&unquoted);
    let collapsed = decoded.split_whitespace().collect::<Vec<_>>().join(" ");
    let name = collapsed.trim_matches('\'').trim();

    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut escaped = false;
    for ch in text.chars() {
        if escaped {
            out.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else {
            out.push(ch);
        }
    }
    out
}

fn clean_address(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let without_scheme = match trimmed.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("mailto:") => &trimmed[7..],
        _ => trimmed,
    };
    let address = without_scheme.trim().trim_matches('\'');

    if address.is_empty() {
        None
    } else {
        Some(address.to_string())
    }
}
