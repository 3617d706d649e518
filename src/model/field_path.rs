use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{invalid_argument, EngineResult};

const DOCUMENT_KEY_NAME: &str = "__name__";

/// A dot-separated path to a field inside a document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn from_dot_separated(path: &str) -> EngineResult<Self> {
        if path.is_empty() {
            return Err(invalid_argument("Field path must not be empty"));
        }
        if path.starts_with('.') || path.ends_with('.') || path.contains("..") {
            return Err(invalid_argument(format!("Invalid field path: {path}")));
        }
        Ok(Self::new(path.split('.').map(|s| s.to_string()).collect()))
    }

    /// The sentinel path referring to the document's key.
    pub fn document_id() -> Self {
        Self::new(vec![DOCUMENT_KEY_NAME.to_string()])
    }

    pub fn is_document_id(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == DOCUMENT_KEY_NAME
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        if self.len() > other.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(l, r)| l == r)
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join(".")
    }
}

impl PartialOrd for FieldPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldPath {
    fn cmp(&self, other: &Self) -> Ordering {
        for (l, r) in self.segments.iter().zip(other.segments.iter()) {
            match l.cmp(r) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        self.len().cmp(&other.len())
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}
