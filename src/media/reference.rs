//! Identifying tuple for a remote media asset and its resolved form.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// What kind of asset a reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Image,
    Document,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Image => write!(f, "image"),
            Self::Document => write!(f, "document"),
        }
    }
}

/// Points at one file attached to one record of the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaReference {
    pub collection_id: String,
    pub record_id: String,
    pub file_name: String,
    pub kind: MediaKind,
}

impl MediaReference {
    pub fn new(
        collection_id: impl Into<String>,
        record_id: impl Into<String>,
        file_name: impl Into<String>,
        kind: MediaKind,
    ) -> Self {
        Self {
            collection_id: collection_id.into(),
            record_id: record_id.into(),
            file_name: file_name.into(),
            kind,
        }
    }

    /// Lowercased file extension, used as a decoder probe hint.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }
}

/// Result of the one-time existence probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    Unknown,
    Reachable,
    Unreachable,
}

/// A reference turned into a fetchable URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedMedia {
    pub url: String,
    pub reachability: Reachability,
}

impl ResolvedMedia {
    pub fn unprobed(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reachability: Reachability::Unknown,
        }
    }

    /// Record the probe outcome. Only the first call has an effect.
    pub fn mark_probed(&mut self, reachable: bool) {
        if self.reachability == Reachability::Unknown {
            self.reachability = if reachable {
                Reachability::Reachable
            } else {
                Reachability::Unreachable
            };
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.reachability == Reachability::Reachable
    }
}
