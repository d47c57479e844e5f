//! Header section handling.

use std::collections::HashMap;

/// Collection of message headers, keyed case-insensitively.
///
/// Values are stored raw (still RFC 2047 encoded); repeated headers keep
/// every occurrence in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    headers: HashMap<String, Vec<String>>,
}

impl Headers {
    /// Creates a new empty header collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header value.
    pub fn add(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        let name = name.as_ref().trim().to_ascii_lowercase();
        if name.is_empty() {
            return;
        }
        self.headers.entry(name).or_default().push(value.into());
    }

    /// Gets the first value for a header.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.first().map(String::as_str))
    }

    /// Gets all values for a header.
    #[must_use]
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Returns true if the header is present at least once.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.headers.contains_key(&name.to_ascii_lowercase())
    }

    /// Number of distinct header names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Returns true if no headers are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Parses a raw header section.
    ///
    /// Parsing stops at the first empty line. Folded continuation lines are
    /// unfolded, an mbox `From ` separator line is skipped, and lines without
    /// a colon are ignored rather than rejected.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut headers = Self::new();
        let mut current: Option<(String, String)> = None;

        for line in text.lines() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                break;
            }

            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some((_, value)) = current.as_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }

            if let Some((name, value)) = current.take() {
                headers.add(name, value.trim().to_string());
            }

            if line.starts_with("From ") {
                continue;
            }

            if let Some((name, value)) = line.split_once(':') {
                current = Some((name.to_string(), value.trim().to_string()));
            }
        }

        if let Some((name, value)) = current {
            headers.add(name, value.trim().to_string());
        }

        headers
    }
}

impl<N: AsRef<str>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.add(name, value);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.add("Reply-To", "a@example.com");
        assert_eq!(headers.get("reply-to"), Some("a@example.com"));
        assert!(headers.contains("REPLY-TO"));
    }

    #[test]
    fn test_repeated_headers_keep_order() {
        let headers: Headers = [("From", "first@example.com"), ("from", "second@example.com")]
            .into_iter()
            .collect();
        assert_eq!(headers.get("From"), Some("first@example.com"));
        assert_eq!(
            headers.get_all("From"),
            vec!["first@example.com", "second@example.com"]
        );
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_parse_unfolds_and_stops_at_body() {
        let text = concat!(
            "From: Alice <alice@example.com>\r\n",
            "To: bob@example.com,\r\n",
            "\tcarol@example.com\r\n",
            "Subject: Hi\r\n",
            "\r\n",
            "To: body@example.com\r\n"
        );

        let headers = Headers::parse(text);
        assert_eq!(headers.get("To"), Some("bob@example.com, carol@example.com"));
        assert_eq!(headers.get_all("To").len(), 1);
        assert_eq!(headers.get("Subject"), Some("Hi"));
    }

    #[test]
    fn test_parse_tolerates_garbage() {
        let text = "From sender Thu Jan  1 00:00:00 1970\nnot a header\n: empty name\nCc: x@y.org\n";
        let headers = Headers::parse(text);
        assert_eq!(headers.get("Cc"), Some("x@y.org"));
        assert!(!headers.contains("not a header"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_parse_empty_input() {
        assert!(Headers::parse("").is_empty());
    }
}
