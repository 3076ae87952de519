//! Address-list handling for the From/To/Cc summary strings (RFC 5322 §3.4).
//!
//! Summaries store each address header as one display string,
//! `"Name <addr>, other@host"`, so list views never re-parse headers.

/// One parsed mailbox.
///
/// # Examples
/// - `"Juan García <juan@ejemplo.com>"` -> `name = "Juan García"`, `address = "juan@ejemplo.com"`
/// - `"user@example.com"` -> `name = ""`, `address = "user@example.com"`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EmailAddress {
    /// Display name (may be empty).
    pub name: String,
    /// Bare `local@domain`, or whatever the header held if it did not parse.
    pub address: String,
}

impl EmailAddress {
    /// Parse a single mailbox. Unparseable input is kept as the address.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let (Some(open), Some(close)) = (trimmed.rfind('<'), trimmed.rfind('>')) {
            if close > open {
                return Self {
                    name: unquote(&trimmed[..open]),
                    address: trimmed[open + 1..close].trim().to_string(),
                };
            }
        }
        Self {
            name: String::new(),
            address: trimmed.to_string(),
        }
    }

    /// Parse a comma-separated list, honouring quoted names and angle
    /// brackets. Empty entries are dropped.
    pub fn parse_list(raw: &str) -> Vec<Self> {
        split_list(raw)
            .into_iter()
            .map(Self::parse)
            .filter(|a| !a.address.is_empty())
            .collect()
    }

    /// `"Name <address>"`, or just the address when there is no name.
    pub fn display(&self) -> String {
        if self.name.is_empty() {
            self.address.clone()
        } else {
            format!("{} <{}>", self.name, self.address)
        }
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display())
    }
}

/// Normalise an address header into the summary display form.
pub fn format_list(raw: &str) -> String {
    EmailAddress::parse_list(raw)
        .iter()
        .map(EmailAddress::display)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Split on commas that are outside quotes and angle brackets.
fn split_list(raw: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut in_angle = false;
    for (i, ch) in raw.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            ',' if !in_quotes && !in_angle => {
                parts.push(&raw[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&raw[start..]);
    parts
}

fn unquote(s: &str) -> String {
    let trimmed = s.trim();
    trimmed
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}
