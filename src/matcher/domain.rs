//! Label trie for domain rules.
//!
//! Patterns are stored label by label from the TLD inwards. `example.com`
//! goes into the exact root and only matches `example.com`; `*.example.com`
//! goes into the wildcard root and matches any name with at least one more
//! label in front of `example.com`.

use std::collections::HashMap;

use crate::types::Mark;

#[derive(Debug, Clone, Default)]
struct Node {
    terminal: bool,
    wildcard: bool,
    mark: Option<Mark>,
    children: HashMap<String, Node>,
}

/// Domain matcher with an exact root and a wildcard root.
#[derive(Debug, Clone, Default)]
pub struct DomainMatcher {
    root: Node,
    wildcard_root: Node,
    len: usize,
}

impl DomainMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pattern. Empty patterns are ignored.
    pub fn insert(&mut self, pattern: &str, mark: Mark) {
        let pattern = normalize(pattern);
        if pattern.is_empty() {
            return;
        }

        match pattern.strip_prefix('*') {
            Some(rest) => {
                let rest = rest.trim_start_matches('.');
                if rest.is_empty() {
                    return;
                }
                let mut node = &mut self.wildcard_root;
                for label in rest.rsplit('.') {
                    node = node.children.entry(label.to_string()).or_default();
                }
                node.wildcard = true;
                node.mark = Some(mark);
                node.children.clear();
            }
            None => {
                let mut node = &mut self.root;
                for label in pattern.rsplit('.') {
                    node = node.children.entry(label.to_string()).or_default();
                }
                node.terminal = true;
                node.mark = Some(mark);
            }
        }
        self.len += 1;
    }

    /// Search a domain, exact root first, then the wildcard root.
    pub fn search(&self, domain: &str) -> Option<Mark> {
        let domain = normalize(domain);
        if domain.is_empty() {
            return None;
        }
        let labels: Vec<&str> = domain.rsplit('.').collect();
        self.search_exact(&labels)
            .or_else(|| self.search_wildcard(&labels))
    }

    fn search_exact(&self, labels: &[&str]) -> Option<Mark> {
        let mut node = &self.root;
        for label in labels {
            node = node.children.get(*label)?;
        }
        if node.terminal {
            node.mark
        } else {
            None
        }
    }

    fn search_wildcard(&self, labels: &[&str]) -> Option<Mark> {
        let mut node = &self.wildcard_root;
        for (depth, label) in labels.iter().enumerate() {
            node = node.children.get(*label)?;
            // `*` must stand in for at least one label.
            if node.wildcard && depth + 1 < labels.len() {
                return node.mark;
            }
        }
        None
    }

    /// Number of inserted patterns.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn normalize(s: &str) -> String {
    let s = s.trim();
    s.strip_suffix('.').unwrap_or(s).to_ascii_lowercase()
}
