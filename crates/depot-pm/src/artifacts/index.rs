//! Artifact index documents
//!
//! An index lists several archives of one binary target, each built for a set
//! of target triples. The manifest checksums the index itself; every listed
//! archive carries its own checksum.

use serde::{Deserialize, Serialize};

/// File extension marking an index URL
pub const INDEX_EXTENSION: &str = "artifactbundleindex";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveIndex {
    pub schema_version: String,
    pub archives: Vec<IndexedArchive>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedArchive {
    /// Relative to the index URL
    pub file_name: String,
    pub checksum: String,
    pub supported_triples: Vec<String>,
}

impl ArchiveIndex {
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// First archive built for `triple`
    pub fn select(&self, triple: &str) -> Option<&IndexedArchive> {
        self.archives
            .iter()
            .find(|archive| archive.supported_triples.iter().any(|t| t == triple))
    }
}

pub fn is_index_url(url: &str) -> bool {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .is_some_and(|name| name.ends_with(&format!(".{}", INDEX_EXTENSION)))
}

/// URL of an archive listed by the index at `index_url`
pub fn archive_url(index_url: &str, file_name: &str) -> Result<String, url::ParseError> {
    Ok(url::Url::parse(index_url)?.join(file_name)?.to_string())
}
