//! In-memory virtual source tree: the compiler's input.

use std::collections::BTreeMap;

/// Synthetic path → rule source text. Cloning is cheap enough to stage a full
/// copy before every rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceTree {
    entries: BTreeMap<String, String>,
}

impl SourceTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes an entry, returning the text it replaced.
    pub fn write(&mut self, path: impl Into<String>, source: impl Into<String>) -> Option<String> {
        self.entries.insert(path.into(), source.into())
    }

    pub fn delete(&mut self, path: &str) -> Option<String> {
        self.entries.remove(path)
    }

    pub fn read(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(p, s)| (p.as_str(), s.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Encodes a rule name into a path segment. Bytes outside `[A-Za-z0-9_.-]`
/// become `%XX`, and `%` itself is always encoded, so distinct names never
/// produce the same segment.
pub fn encode_path_segment(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' => out.push(byte as char),
            // A lone "." or ".." must not look like a directory reference.
            b'.' if name != "." && name != ".." => out.push('.'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_replace_delete() {
        let mut tree = SourceTree::new();
        assert_eq!(tree.write("rules/a.rule", "one"), None);
        assert_eq!(tree.write("rules/a.rule", "two"), Some("one".to_string()));
        assert_eq!(tree.read("rules/a.rule"), Some("two"));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.delete("rules/a.rule"), Some("two".to_string()));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_encoding_is_collision_free() {
        let names = ["a b", "a%20b", "a/b", "a_b", "订单", "..", "."];
        let encoded: std::collections::HashSet<_> =
            names.iter().map(|n| encode_path_segment(n)).collect();
        assert_eq!(encoded.len(), names.len());
        assert_eq!(encode_path_segment("a b"), "a%20b");
        assert_eq!(encode_path_segment("a%20b"), "a%2520b");
        assert!(!encode_path_segment("a/b").contains('/'));
    }
}
