//! Capability tags advertised by workers and required by tasks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A single capability tag, normalised to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Capability(String);

impl Capability {
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(tag.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Capability {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<Capability> for String {
    fn from(c: Capability) -> Self {
        c.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An ordered set of capability tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cap: impl Into<Capability>) -> bool {
        self.0.insert(cap.into())
    }

    pub fn contains(&self, cap: &Capability) -> bool {
        self.0.contains(cap)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    /// Number of tags present in both sets.
    pub fn overlap(&self, other: &CapabilitySet) -> usize {
        self.0.intersection(&other.0).count()
    }

    /// Returns true if every tag in `self` is also in `other`.
    pub fn is_satisfied_by(&self, other: &CapabilitySet) -> bool {
        self.0.is_subset(&other.0)
    }
}

impl<T: Into<Capability>> FromIterator<T> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).filter(|c: &Capability| !c.0.is_empty()).collect())
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<&str> = self.0.iter().map(Capability::as_str).collect();
        f.write_str(&tags.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_normalised() {
        let caps: CapabilitySet = ["Rust", " python ", ""].into_iter().collect();
        assert_eq!(caps.len(), 2);
        assert!(caps.contains(&Capability::new("rust")));
        assert_eq!(caps.to_string(), "python,rust");
    }

    #[test]
    fn test_overlap_and_subset() {
        let worker: CapabilitySet = ["rust", "python", "docs"].into_iter().collect();
        let task: CapabilitySet = ["rust", "go"].into_iter().collect();

        assert_eq!(task.overlap(&worker), 1);
        assert!(!task.is_satisfied_by(&worker));
        assert!(CapabilitySet::new().is_satisfied_by(&worker));
    }
}
