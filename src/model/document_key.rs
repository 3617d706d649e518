use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{invalid_argument, EngineResult};
use crate::model::ResourcePath;

/// Path-based identity of a document. Always an even number of segments.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> EngineResult<Self> {
        if path.len() < 2 || path.len() % 2 != 0 {
            return Err(invalid_argument(format!(
                "document key {path} must have an even number of segments"
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> EngineResult<Self> {
        let resource = ResourcePath::from_string(path)?;
        Self::from_path(resource)
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.without_last()
    }

    /// The id of the collection containing this document, which doubles as
    /// the key's collection group.
    pub fn collection_group(&self) -> &str {
        self.path
            .segment(self.path.len() - 2)
            .unwrap_or_default()
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }

    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.collection_group() == collection_id
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}
