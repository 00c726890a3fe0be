//! Ordered string sets loaded from newline-delimited files.
//!
//! Used for the target exclusion list and the jump host list. Loading
//! applies the same rules as the target reader: blank lines and lines
//! starting with `#` are skipped.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

/// A sorted set of lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineSet(BTreeSet<String>);

impl LineSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a set from a file, one entry per line.
    ///
    /// Blank lines and `#` comments are skipped.
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut set = Self::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            set.insert(line);
        }
        Ok(set)
    }

    pub fn insert(&mut self, value: impl Into<String>) {
        self.0.insert(value.into());
    }

    pub fn contains(&self, value: &str) -> bool {
        self.0.contains(value)
    }

    /// Remove every element of `other` from this set.
    pub fn remove_all(&mut self, other: &LineSet) {
        for value in other.iter() {
            self.0.remove(value);
        }
    }

    /// Iterate in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<String> for LineSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for LineSet {
    type Item = String;
    type IntoIter = std::collections::btree_set::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn from_file_skips_blanks_and_comments() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "b\n#x\n\na\n").unwrap();

        let set = LineSet::from_file(f.path()).unwrap();
        let entries: Vec<_> = set.iter().cloned().collect();
        assert_eq!(entries, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn remove_all_subtracts_another_set() {
        let mut hosts: LineSet = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let exclude: LineSet = ["b"].iter().map(|s| s.to_string()).collect();

        hosts.remove_all(&exclude);
        assert!(hosts.contains("a"));
        assert!(!hosts.contains("b"));
        assert_eq!(hosts.len(), 2);
    }

    #[test]
    fn contains_checks_membership() {
        let mut set = LineSet::new();
        assert!(set.is_empty());
        set.insert("web-1");
        assert!(set.contains("web-1"));
        assert!(!set.contains("web-2"));
    }

    #[test]
    fn from_file_missing_path_is_an_error() {
        assert!(LineSet::from_file("/nonexistent/hosts.txt").is_err());
    }
}
