//! Application metadata (`metadata.json`).

use crate::error::PreconditionError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Parsed `metadata.json` of the application under test.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Metadata {
    pub name: String,
    pub eliona_min_version: String,
    pub display_name: BTreeMap<String, String>,
    pub description: BTreeMap<String, String>,
    pub dashboard_template_names: Vec<String>,
    pub api_url: String,
    pub api_specification_path: String,
    pub documentation_url: String,
    pub use_environment: Vec<String>,
}

/// Metadata together with the exact bytes it was decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedMetadata {
    pub metadata: Metadata,
    pub raw: Vec<u8>,
}

impl LoadedMetadata {
    pub fn load(path: &Path) -> Result<Self, PreconditionError> {
        let raw = std::fs::read(path).map_err(|source| PreconditionError::MetadataRead {
            path: path.to_path_buf(),
            source,
        })?;
        let metadata: Metadata =
            serde_json::from_slice(&raw).map_err(|source| PreconditionError::MetadataParse {
                path: path.to_path_buf(),
                source,
            })?;
        metadata.validate()?;
        Ok(Self { metadata, raw })
    }

    /// Raw bytes as text, as written to the app store.
    pub fn raw_text(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }
}

impl Metadata {
    pub fn validate(&self) -> Result<(), PreconditionError> {
        if self.name.trim().is_empty() {
            return Err(PreconditionError::MetadataInvalid(
                "'name' must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// `<base>/<apiUrl>/version`
    pub fn version_url(&self, base_url: &str) -> String {
        join_url(base_url, &[&self.api_url, "version"])
    }

    /// `<base>/<apiUrl>/<apiSpecificationPath>`
    pub fn api_spec_url(&self, base_url: &str) -> String {
        join_url(base_url, &[&self.api_url, &self.api_specification_path])
    }
}

/// Join URL path segments, ignoring empty segments and redundant slashes.
pub fn join_url(base_url: &str, segments: &[&str]) -> String {
    let mut url = base_url.trim_end_matches('/').to_string();
    for segment in segments {
        let segment = segment.trim_matches('/');
        if segment.is_empty() {
            continue;
        }
        url.push('/');
        url.push_str(segment);
    }
    url
}
