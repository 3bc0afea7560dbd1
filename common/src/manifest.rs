//! Manifest files
//!
//! A manifest is a JSON list of `{"source": ..., "target": ...}` pairs, either at the top level or
//! wrapped in an action envelope:
//!
//! ```json
//! {"action": "copy", "parameters": {"manifest": [{"source": "s3://a/x", "target": "s3://b/x"}]}}
//! ```
//!
//! Locations are URLs. Bare paths are accepted too and become `file:` URLs, relative paths are
//! resolved against a base directory (the current one when reading from disk).

use anyhow::{Context, anyhow};
use url::Url;

/// One source/target pair. Duplicates are allowed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ManifestEntry {
    pub source: Url,
    pub target: Url,
}

impl ManifestEntry {
    pub fn new(source: Url, target: Url) -> Self {
        Self { source, target }
    }
}

#[derive(Debug, serde::Deserialize)]
struct RawEntry {
    source: String,
    target: String,
}

#[derive(Debug, serde::Deserialize)]
struct Parameters {
    manifest: Vec<RawEntry>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
enum Document {
    Entries(Vec<RawEntry>),
    Envelope { action: String, parameters: Parameters },
}

const ACTIONS: [&str; 2] = ["copy", "delete"];

/// Turns a manifest location into a URL.
pub fn parse_location(location: &str, base_dir: &std::path::Path) -> anyhow::Result<Url> {
    // single letter schemes are windows drive letters, not URLs
    if let Some(url) = Url::parse(location)
        .ok()
        .filter(|url| url.scheme().len() > 1)
    {
        return Ok(url);
    }
    let path = std::path::Path::new(location);
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    };
    Url::from_file_path(&path).map_err(|()| anyhow!("cannot turn {:?} into a file url", &path))
}

/// Parses manifest JSON, resolving relative paths against `base_dir`.
pub fn parse(text: &str, base_dir: &std::path::Path) -> anyhow::Result<Vec<ManifestEntry>> {
    let document: Document = serde_json::from_str(text).context("invalid manifest")?;
    let entries = match document {
        Document::Entries(entries) => entries,
        Document::Envelope { action, parameters } => {
            if !ACTIONS.contains(&action.as_str()) {
                return Err(anyhow!("unsupported manifest action {:?}", action));
            }
            parameters.manifest
        }
    };
    entries
        .into_iter()
        .map(|entry| -> anyhow::Result<ManifestEntry> {
            Ok(ManifestEntry {
                source: parse_location(&entry.source, base_dir)
                    .with_context(|| format!("invalid source {:?}", entry.source))?,
                target: parse_location(&entry.target, base_dir)
                    .with_context(|| format!("invalid target {:?}", entry.target))?,
            })
        })
        .collect()
}

/// Reads and parses the manifest at `path`.
pub async fn read_manifest(path: &std::path::Path) -> anyhow::Result<Vec<ManifestEntry>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed reading manifest {:?}", &path))?;
    let base_dir = std::env::current_dir().context("cannot determine current directory")?;
    let entries =
        parse(&text, &base_dir).with_context(|| format!("failed parsing manifest {:?}", &path))?;
    tracing::info!("read {} entries from {:?}", entries.len(), path);
    Ok(entries)
}
