//! Minimal LDAP filter tree.
//!
//! Shards describe which entries they consume with a `Filter`. The same value
//! renders to RFC 4515 text for the change-notification subscriptions.

use std::fmt;

use super::Entry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `(attr=value)`, compared case-insensitively
    Equals(String, String),
    /// `(attr=*)`
    Present(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn object_class(class: &str) -> Self {
        Filter::Equals("objectClass".to_string(), class.to_string())
    }

    pub fn present(attr: &str) -> Self {
        Filter::Present(attr.to_string())
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Filter::Equals(attr, value) => entry.has_value(attr, value),
            Filter::Present(attr) => entry.has_attr(attr),
            Filter::And(parts) => parts.iter().all(|f| f.matches(entry)),
            Filter::Or(parts) => parts.iter().any(|f| f.matches(entry)),
            Filter::Not(inner) => !inner.matches(entry),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Equals(attr, value) => write!(f, "({}={})", attr, escape(value)),
            Filter::Present(attr) => write!(f, "({}=*)", attr),
            Filter::And(parts) => {
                write!(f, "(&")?;
                for part in parts {
                    write!(f, "{}", part)?;
                }
                write!(f, ")")
            }
            Filter::Or(parts) => {
                write!(f, "(|")?;
                for part in parts {
                    write!(f, "{}", part)?;
                }
                write!(f, ")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
        }
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            other => out.push(other),
        }
    }
    out
}
