// version information for driver/worker compatibility checking

use serde::{Deserialize, Serialize};

/// Protocol version exchanged between a driver (`mcp`, `mrm`) and its `mcpd` workers.
///
/// The semantic version decides compatibility, git information is carried along for debugging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolVersion {
    /// Semantic version from Cargo.toml (e.g., "0.4.0")
    pub semantic: String,
    /// Git describe output (e.g., "v0.3.1-7-g644da27"), absent when built outside of git
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub git_describe: Option<String>,
    /// Full git commit hash
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub git_hash: Option<String>,
}

impl ProtocolVersion {
    /// Version of the running binary, as embedded by build.rs.
    pub fn current() -> Self {
        Self {
            semantic: env!("CARGO_PKG_VERSION").to_string(),
            git_describe: option_env!("MFT_GIT_DESCRIBE").map(String::from),
            git_hash: option_env!("MFT_GIT_HASH").map(String::from),
        }
    }

    /// Workers are only driven by a driver of the exact same semantic version.
    ///
    /// ```
    /// use common::version::ProtocolVersion;
    ///
    /// let driver = ProtocolVersion {
    ///     semantic: "0.4.0".to_string(),
    ///     git_describe: None,
    ///     git_hash: None,
    /// };
    /// let worker = ProtocolVersion {
    ///     semantic: "0.4.0".to_string(),
    ///     git_describe: Some("v0.3.1-7-g644da27".to_string()),
    ///     git_hash: None,
    /// };
    /// assert!(driver.is_compatible_with(&worker));
    /// ```
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.semantic == other.semantic
    }

    pub fn display(&self) -> String {
        match self.git_describe {
            Some(ref git_describe) => format!("{} ({})", self.semantic, git_describe),
            None => self.semantic.clone(),
        }
    }

    /// Serialize to JSON string, used by `--protocol-version`.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self)
            .map_err(|e| anyhow::anyhow!("failed to serialize version: {:#}", e))
    }

    /// # Errors
    ///
    /// Returns an error if the JSON is malformed.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| anyhow::anyhow!("failed to parse version JSON: {:#}", e))
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(semantic: &str, git_describe: Option<&str>) -> ProtocolVersion {
        ProtocolVersion {
            semantic: semantic.to_string(),
            git_describe: git_describe.map(String::from),
            git_hash: None,
        }
    }

    #[test]
    fn current_version_matches_package() {
        assert_eq!(ProtocolVersion::current().semantic, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn compatibility_is_exact_semantic_match() {
        let v1 = version("0.4.0", None);
        let v2 = version("0.4.0", Some("v0.3.1-7-g644da27"));
        let v3 = version("0.3.0", None);
        assert!(v1.is_compatible_with(&v2));
        assert!(v2.is_compatible_with(&v1));
        assert!(!v1.is_compatible_with(&v3));
        assert!(!v3.is_compatible_with(&v1));
    }

    #[test]
    fn display_includes_git_describe() {
        assert_eq!(version("0.4.0", None).display(), "0.4.0");
        assert_eq!(
            version("0.4.0", Some("v0.3.1-7-g644da27")).to_string(),
            "0.4.0 (v0.3.1-7-g644da27)"
        );
    }

    #[test]
    fn json_without_git_fields() {
        let v = ProtocolVersion::from_json(r#"{"semantic":"0.4.0"}"#).unwrap();
        assert_eq!(v, version("0.4.0", None));
        assert_eq!(v.to_json().unwrap(), r#"{"semantic":"0.4.0"}"#);
    }
}
