//! Distinguished-name helpers.
//!
//! Only what the caches need: case normalization for keys and extraction of
//! the first RDN value ("short identifier"). Escaped separators (`\,`) are
//! respected when splitting.

/// Lowercases a DN and strips whitespace around RDN separators.
///
/// `"CN=Domain Users , cn=Groups,DC=Example"` becomes
/// `"cn=domain users,cn=groups,dc=example"`.
pub fn normalize(dn: &str) -> String {
    split_rdns(dn.trim())
        .into_iter()
        .map(|rdn| match rdn.split_once('=') {
            Some((attr, value)) => format!("{}={}", attr.trim(), value.trim()),
            None => rdn.trim().to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
        .to_lowercase()
}

/// Returns the value of the first RDN, e.g. `alice` for `uid=alice,cn=users`.
pub fn short_id(dn: &str) -> Option<&str> {
    let first = first_rdn(dn);
    let (_, value) = first.split_once('=')?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// True when a short identifier names a computer account.
pub fn is_computer_id(id: &str) -> bool {
    id.ends_with('$')
}

fn first_rdn(dn: &str) -> &str {
    let mut escaped = false;
    for (i, c) in dn.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            ',' if !escaped => return &dn[..i],
            _ => escaped = false,
        }
    }
    dn
}

fn split_rdns(dn: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = dn;
    while !rest.is_empty() {
        let rdn = first_rdn(rest);
        parts.push(rdn);
        rest = rest.get(rdn.len() + 1..).unwrap_or("");
    }
    parts
}
