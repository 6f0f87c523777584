//! An order-preserving header multimap with canonical name casing (spec §3
//! Response: "header multimap (canonical casing, insertion order preserved
//! within each name)").

use std::fmt;

/// Canonicalizes a header name the way `Content-Type`/`X-Forwarded-For` are
/// conventionally written: each `-`-separated word capitalized.
pub fn canonicalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, word) in name.split('-').enumerate() {
        if i > 0 {
            out.push('-');
        }
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            for c in chars {
                out.extend(c.to_lowercase());
            }
        }
    }
    out
}

/// Header storage: a flat, insertion-ordered list of `(canonical-name,
/// value)` pairs. Multiple values for the same name are distinct entries,
/// preserved in the order they were added.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value under `name`, canonicalizing the name. Does not
    /// replace existing values for the same name.
    pub fn push(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((canonicalize(name), value.into()));
    }

    /// The first value stored under `name` (case-insensitive lookup via
    /// canonicalization).
    pub fn get(&self, name: &str) -> Option<&str> {
        let canonical = canonicalize(name);
        self.entries
            .iter()
            .find(|(n, _)| *n == canonical)
            .map(|(_, v)| v.as_str())
    }

    /// All values stored under `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        let canonical = canonicalize(name);
        self.entries
            .iter()
            .filter(move |(n, _)| *n == canonical)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            writeln!(f, "{name}: {value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_mixed_case_names() {
        assert_eq!(canonicalize("content-type"), "Content-Type");
        assert_eq!(canonicalize("X-FORWARDED-FOR"), "X-Forwarded-For");
        assert_eq!(canonicalize("ETag"), "Etag");
    }

    #[test]
    fn preserves_insertion_order_for_repeated_names() {
        let mut h = HeaderMap::new();
        h.push("Set-Cookie", "a=1");
        h.push("set-cookie", "b=2");
        let values: Vec<_> = h.get_all("Set-Cookie").collect();
        assert_eq!(values, vec!["a=1", "b=2"]);
    }
}
