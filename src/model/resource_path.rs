use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::error::{invalid_argument, EngineResult};

/// A slash-separated path into the document tree.
///
/// Ordering is lexicographic over segments with shorter paths sorting first,
/// which is the order every persisted collection and index relies on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    pub fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments = segments.into_iter().map(Into::into).collect();
        Self::new(segments)
    }

    pub fn from_string(path: &str) -> EngineResult<Self> {
        if path.trim().is_empty() {
            return Ok(Self::root());
        }
        if path.contains("//") {
            return Err(invalid_argument(format!(
                "resource path {path:?} contains an empty segment"
            )));
        }
        Ok(Self::from_segments(
            path.split('/').filter(|segment| !segment.is_empty()),
        ))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segment(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(|s| s.as_str())
    }

    pub fn child<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut extended = self.segments.clone();
        extended.extend(segments.into_iter().map(Into::into));
        Self::new(extended)
    }

    pub fn pop_last(&self) -> Option<Self> {
        let (_, parent) = self.segments.split_last()?;
        Some(Self::new(parent.to_vec()))
    }

    pub fn without_last(&self) -> Self {
        self.pop_last().unwrap_or_else(Self::root)
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// Successor in path order: the smallest path that is greater than every
    /// path prefixed by `self`. Used as the exclusive upper bound of range
    /// scans over path-keyed collections.
    pub fn range_end(&self) -> Self {
        let mut segments = self.segments.clone();
        if let Some(last) = segments.last_mut() {
            last.push('\u{0}');
        } else {
            segments.push("\u{0}".to_string());
        }
        Self::new(segments)
    }
}

impl PartialOrd for ResourcePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourcePath {
    fn cmp(&self, other: &Self) -> Ordering {
        // Slice ordering is segment-lexicographic with prefixes first,
        // which is exactly path order.
        self.segments.cmp(&other.segments)
    }
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

impl Deref for ResourcePath {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_render_path() {
        let path = ResourcePath::from_string("cities/sf/neighborhoods/downtown").unwrap();
        assert_eq!(path.len(), 4);
        assert_eq!(path.last_segment(), Some("downtown"));
        assert_eq!(path.canonical_string(), "cities/sf/neighborhoods/downtown");
    }

    #[test]
    fn rejects_empty_segments() {
        let err = ResourcePath::from_string("cities//sf").unwrap_err();
        assert_eq!(err.code_str(), "invalid-argument");
    }

    #[test]
    fn orders_prefix_first() {
        let shorter = ResourcePath::from_string("cities").unwrap();
        let longer = ResourcePath::from_string("cities/sf").unwrap();
        assert!(shorter < longer);
        assert!(shorter.is_prefix_of(&longer));
    }

    #[test]
    fn range_end_bounds_descendants() {
        let path = ResourcePath::from_string("cities").unwrap();
        let end = path.range_end();
        let child = ResourcePath::from_string("cities/zz").unwrap();
        assert!(child < end);
        let before = ResourcePath::from_string("citier").unwrap();
        assert!(before < path);
        let after = ResourcePath::from_string("citiez").unwrap();
        assert!(after > end);
    }
}
