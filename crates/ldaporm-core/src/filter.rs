//! Search filter expressions
//!
//! A typed filter tree that renders to RFC 4515 filter strings and parses
//! them back, plus the value escaping rules for filters (RFC 4515) and
//! distinguished names (RFC 4514).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DirectoryError, DirectoryResult};

/// Filter for search operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    /// Match objects where attribute equals value.
    Equals { attribute: String, value: String },

    /// Match objects where attribute contains value (substring).
    Contains { attribute: String, value: String },

    /// Match objects where attribute starts with value.
    StartsWith { attribute: String, value: String },

    /// Match objects where attribute ends with value.
    EndsWith { attribute: String, value: String },

    /// General substring match `initial*any*...*final`.
    Substring {
        attribute: String,
        initial: Option<String>,
        any: Vec<String>,
        #[serde(rename = "final")]
        final_: Option<String>,
    },

    /// Match objects where attribute is strictly greater than value.
    GreaterThan { attribute: String, value: String },

    /// Match objects where attribute is greater than or equal to value.
    GreaterThanOrEquals { attribute: String, value: String },

    /// Match objects where attribute is strictly less than value.
    LessThan { attribute: String, value: String },

    /// Match objects where attribute is less than or equal to value.
    LessThanOrEquals { attribute: String, value: String },

    /// Approximate match.
    Approx { attribute: String, value: String },

    /// Match objects where attribute exists (has any value).
    Present { attribute: String },

    /// Logical AND of multiple filters.
    And { filters: Vec<Filter> },

    /// Logical OR of multiple filters.
    Or { filters: Vec<Filter> },

    /// Logical NOT of a filter.
    Not { filter: Box<Filter> },
}

impl Filter {
    /// Create an equals filter.
    pub fn eq(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Equals {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a contains (substring) filter.
    pub fn contains(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Contains {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a starts-with filter.
    pub fn starts_with(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::StartsWith {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create an ends-with filter.
    pub fn ends_with(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::EndsWith {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a strict greater-than filter.
    pub fn gt(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::GreaterThan {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a greater-or-equal filter.
    pub fn gte(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::GreaterThanOrEquals {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a strict less-than filter.
    pub fn lt(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::LessThan {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a less-or-equal filter.
    pub fn lte(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::LessThanOrEquals {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a presence filter.
    pub fn present(attribute: impl Into<String>) -> Self {
        Filter::Present {
            attribute: attribute.into(),
        }
    }

    /// Create an AND filter.
    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And { filters }
    }

    /// Create an OR filter.
    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or { filters }
    }

    /// Create a NOT filter (negation).
    pub fn negate(filter: Filter) -> Self {
        Filter::Not {
            filter: Box::new(filter),
        }
    }

    /// Combine with another filter using AND.
    pub fn and_with(self, other: Filter) -> Self {
        match self {
            Filter::And { mut filters } => {
                filters.push(other);
                Filter::And { filters }
            }
            _ => Filter::And {
                filters: vec![self, other],
            },
        }
    }

    /// Combine with another filter using OR.
    pub fn or_with(self, other: Filter) -> Self {
        match self {
            Filter::Or { mut filters } => {
                filters.push(other);
                Filter::Or { filters }
            }
            _ => Filter::Or {
                filters: vec![self, other],
            },
        }
    }

    /// Flatten nested groups of the same kind and unwrap single-child groups.
    pub fn simplify(self) -> Self {
        match self {
            Filter::And { filters } => {
                let mut flat = Vec::with_capacity(filters.len());
                for f in filters.into_iter().map(Filter::simplify) {
                    match f {
                        Filter::And { filters: inner } => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                if flat.len() == 1 {
                    flat.remove(0)
                } else {
                    Filter::And { filters: flat }
                }
            }
            Filter::Or { filters } => {
                let mut flat = Vec::with_capacity(filters.len());
                for f in filters.into_iter().map(Filter::simplify) {
                    match f {
                        Filter::Or { filters: inner } => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                if flat.len() == 1 {
                    flat.remove(0)
                } else {
                    Filter::Or { filters: flat }
                }
            }
            Filter::Not { filter } => Filter::Not {
                filter: Box::new(filter.simplify()),
            },
            other => other,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And { filters } => {
                f.write_str("(&")?;
                for inner in filters {
                    write!(f, "{inner}")?;
                }
                f.write_str(")")
            }
            Filter::Or { filters } => {
                f.write_str("(|")?;
                for inner in filters {
                    write!(f, "{inner}")?;
                }
                f.write_str(")")
            }
            Filter::Not { filter } => write!(f, "(!{filter})"),
            Filter::Equals { attribute, value } => {
                write!(f, "({}={})", attribute, escape_filter_value(value))
            }
            Filter::Contains { attribute, value } => {
                write!(f, "({}=*{}*)", attribute, escape_filter_value(value))
            }
            Filter::StartsWith { attribute, value } => {
                write!(f, "({}={}*)", attribute, escape_filter_value(value))
            }
            Filter::EndsWith { attribute, value } => {
                write!(f, "({}=*{})", attribute, escape_filter_value(value))
            }
            Filter::Substring {
                attribute,
                initial,
                any,
                final_,
            } => {
                write!(f, "({attribute}=")?;
                if let Some(initial) = initial {
                    f.write_str(&escape_filter_value(initial))?;
                }
                f.write_str("*")?;
                for part in any {
                    write!(f, "{}*", escape_filter_value(part))?;
                }
                if let Some(final_) = final_ {
                    f.write_str(&escape_filter_value(final_))?;
                }
                f.write_str(")")
            }
            // No strict ordering match exists in the protocol.
            Filter::GreaterThan { attribute, value } => {
                let v = escape_filter_value(value);
                write!(f, "(&({attribute}>={v})(!({attribute}={v})))")
            }
            Filter::GreaterThanOrEquals { attribute, value } => {
                write!(f, "({}>={})", attribute, escape_filter_value(value))
            }
            Filter::LessThan { attribute, value } => {
                let v = escape_filter_value(value);
                write!(f, "(&({attribute}<={v})(!({attribute}={v})))")
            }
            Filter::LessThanOrEquals { attribute, value } => {
                write!(f, "({}<={})", attribute, escape_filter_value(value))
            }
            Filter::Approx { attribute, value } => {
                write!(f, "({}~={})", attribute, escape_filter_value(value))
            }
            Filter::Present { attribute } => write!(f, "({attribute}=*)"),
        }
    }
}

impl FromStr for Filter {
    type Err = DirectoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser {
            input: s.trim().as_bytes(),
            pos: 0,
        };
        let filter = parser.filter()?;
        if parser.pos != parser.input.len() {
            return Err(parser.error("trailing characters after filter"));
        }
        Ok(filter)
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> DirectoryError {
        DirectoryError::invalid_value(format!(
            "malformed filter at offset {}: {}",
            self.pos, message
        ))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> DirectoryResult<()> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", byte as char)))
        }
    }

    fn filter(&mut self) -> DirectoryResult<Filter> {
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And {
                    filters: self.filter_list()?,
                }
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or {
                    filters: self.filter_list()?,
                }
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::negate(self.filter()?)
            }
            Some(_) => self.item()?,
            None => return Err(self.error("unexpected end of input")),
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn filter_list(&mut self) -> DirectoryResult<Vec<Filter>> {
        let mut filters = Vec::new();
        while self.peek() == Some(b'(') {
            filters.push(self.filter()?);
        }
        Ok(filters)
    }

    fn item(&mut self) -> DirectoryResult<Filter> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(b, b'=' | b'~' | b'>' | b'<' | b'(' | b')') {
                break;
            }
            self.pos += 1;
        }
        let attribute = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| self.error("attribute name is not UTF-8"))?
            .trim()
            .to_string();
        if attribute.is_empty() {
            return Err(self.error("missing attribute name"));
        }

        let op = match self.peek() {
            Some(b'=') => {
                self.pos += 1;
                b'='
            }
            Some(op @ (b'~' | b'>' | b'<')) => {
                self.pos += 1;
                self.expect(b'=')?;
                op
            }
            _ => return Err(self.error("expected comparison operator")),
        };

        let value_start = self.pos;
        while let Some(b) = self.peek() {
            if b == b')' {
                break;
            }
            if b == b'(' {
                return Err(self.error("unescaped '(' in value"));
            }
            self.pos += 1;
        }
        let raw = std::str::from_utf8(&self.input[value_start..self.pos])
            .map_err(|_| self.error("value is not UTF-8"))?;

        match op {
            b'~' => Ok(Filter::Approx {
                attribute,
                value: unescape_filter_value(raw)?,
            }),
            b'>' => Ok(Filter::gte(attribute, unescape_filter_value(raw)?)),
            b'<' => Ok(Filter::lte(attribute, unescape_filter_value(raw)?)),
            _ if raw == "*" => Ok(Filter::present(attribute)),
            _ if raw.contains('*') => substring(attribute, raw),
            _ => Ok(Filter::eq(attribute, unescape_filter_value(raw)?)),
        }
    }
}

fn substring(attribute: String, raw: &str) -> DirectoryResult<Filter> {
    let parts: Vec<&str> = raw.split('*').collect();
    let initial = parts.first().filter(|p| !p.is_empty());
    let final_ = parts.last().filter(|p| !p.is_empty());
    let any: Vec<&str> = parts[1..parts.len() - 1]
        .iter()
        .copied()
        .filter(|p| !p.is_empty())
        .collect();

    let filter = match (initial, any.as_slice(), final_) {
        (Some(i), [], None) => Filter::starts_with(attribute, unescape_filter_value(i)?),
        (None, [], Some(f)) => Filter::ends_with(attribute, unescape_filter_value(f)?),
        (None, [a], None) => Filter::contains(attribute, unescape_filter_value(a)?),
        _ => Filter::Substring {
            attribute,
            initial: initial.map(|i| unescape_filter_value(i)).transpose()?,
            any: any
                .iter()
                .map(|a| unescape_filter_value(a))
                .collect::<DirectoryResult<_>>()?,
            final_: final_.map(|f| unescape_filter_value(f)).transpose()?,
        },
    };
    Ok(filter)
}

/// Escape special characters in LDAP filter values (RFC 4515).
pub fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\5c"),
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\0' => escaped.push_str("\\00"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Escape arbitrary bytes for a filter value, hex-escaping anything non-ASCII.
pub fn escape_filter_bytes(value: &[u8]) -> String {
    let mut escaped = String::with_capacity(value.len() * 3);
    for &b in value {
        match b {
            b'\\' | b'*' | b'(' | b')' | 0 => escaped.push_str(&format!("\\{b:02x}")),
            0x20..=0x7e => escaped.push(b as char),
            _ => escaped.push_str(&format!("\\{b:02x}")),
        }
    }
    escaped
}

/// Decode `\XX` escapes in a filter value.
pub fn unescape_filter_value(raw: &str) -> DirectoryResult<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| {
                    DirectoryError::invalid_value(format!("invalid escape sequence in '{raw}'"))
                })?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Escape special characters in DN attribute values per RFC 4514.
///
/// Characters that must be escaped:
/// - Leading or trailing SPACE (escaped as \20)
/// - Leading # (escaped as \23)
/// - Characters: , + " \ < > ; = (escaped with backslash prefix)
/// - NUL character (escaped as \00)
pub fn escape_dn_value(value: &str) -> String {
    let count = value.chars().count();
    let mut result = String::with_capacity(value.len() * 2);

    for (i, ch) in value.chars().enumerate() {
        let is_first = i == 0;
        let is_last = i + 1 == count;

        match ch {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                result.push('\\');
                result.push(ch);
            }
            '\0' => result.push_str("\\00"),
            ' ' if is_first || is_last => result.push_str("\\20"),
            '#' if is_first => result.push_str("\\23"),
            _ => result.push(ch),
        }
    }

    result
}

/// Split a DN into its first RDN and the parent DN, honouring escaped commas.
pub fn split_dn(dn: &str) -> (&str, &str) {
    let bytes = dn.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b',' => return (&dn[..i], dn[i + 1..].trim_start()),
            _ => i += 1,
        }
    }
    (dn, "")
}
