//! Build identity, availability and artifact naming.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable integer identity of a build, assigned at first ingest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(i64);

impl BuildId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Debug for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BuildId({})", self.0)
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for BuildId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Where a build can currently be downloaded from.
///
/// Computed once from the two optional storage-state columns. A remote
/// copy wins over a local one: once promoted, the remote URL is the
/// artifact of record even while the local copy is still retained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildAvailability {
    Remote(String),
    Local(String),
    Superseded,
}

impl BuildAvailability {
    pub fn from_parts(remote_url: Option<&str>, local_path: Option<&str>) -> Self {
        match (remote_url, local_path) {
            (Some(url), _) => Self::Remote(url.to_string()),
            (None, Some(path)) => Self::Local(path.to_string()),
            (None, None) => Self::Superseded,
        }
    }

    /// Only local-only builds may be promoted.
    pub fn is_promotable(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded)
    }

    /// Listing precedence: remote, then local, then superseded.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Remote(_) => 2,
            Self::Local(_) => 1,
            Self::Superseded => 0,
        }
    }
}

/// Parsed components of a signed artifact filename.
///
/// Names look like `lineage-20.0-20240101-nightly-oneplus3-signed.zip`.
/// The build type segment may itself contain dashes; the device is always
/// the last segment before `-signed.zip`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildName {
    pub version: String,
    pub date: String,
    pub build_type: String,
    pub device: String,
}

const NAME_PREFIX: &str = "lineage-";
const NAME_SUFFIX: &str = "-signed.zip";

impl BuildName {
    pub fn parse(filename: &str) -> crate::Result<Self> {
        let invalid = || crate::Error::InvalidFilename(filename.to_string());

        let body = filename
            .strip_prefix(NAME_PREFIX)
            .and_then(|s| s.strip_suffix(NAME_SUFFIX))
            .ok_or_else(invalid)?;

        let parts: Vec<&str> = body.split('-').collect();
        if parts.len() < 4 {
            return Err(invalid());
        }

        let version = parts[0];
        let date = parts[1];
        let device = parts[parts.len() - 1];
        let build_type = parts[2..parts.len() - 1].join("-");

        if version.is_empty() || !version.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return Err(invalid());
        }
        if date.is_empty() || !date.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        if device.is_empty() || build_type.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            version: version.to_string(),
            date: date.to_string(),
            build_type,
            device: device.to_string(),
        })
    }
}

/// Storage key for an artifact: `device/version/filename`.
///
/// Each component must be a single non-empty path segment.
pub fn artifact_key(device: &str, version: &str, filename: &str) -> crate::Result<String> {
    for component in [device, version, filename] {
        if component.is_empty()
            || component == "."
            || component == ".."
            || component.contains('/')
            || component.contains('\\')
            || component.contains('\0')
        {
            return Err(crate::Error::InvalidKey(component.to_string()));
        }
    }
    Ok(format!("{device}/{version}/{filename}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability_from_parts() {
        assert_eq!(
            BuildAvailability::from_parts(Some("https://x/a.zip"), Some("d/v/a.zip")),
            BuildAvailability::Remote("https://x/a.zip".to_string())
        );
        assert_eq!(
            BuildAvailability::from_parts(None, Some("d/v/a.zip")),
            BuildAvailability::Local("d/v/a.zip".to_string())
        );
        assert!(BuildAvailability::from_parts(None, None).is_superseded());
    }

    #[test]
    fn test_only_local_is_promotable() {
        assert!(BuildAvailability::Local("p".into()).is_promotable());
        assert!(!BuildAvailability::Remote("u".into()).is_promotable());
        assert!(!BuildAvailability::Superseded.is_promotable());
    }

    #[test]
    fn test_parse_build_name() {
        let name = BuildName::parse("lineage-20.0-20240101-nightly-oneplus3-signed.zip").unwrap();
        assert_eq!(name.version, "20.0");
        assert_eq!(name.date, "20240101");
        assert_eq!(name.build_type, "nightly");
        assert_eq!(name.device, "oneplus3");
    }

    #[test]
    fn test_parse_build_name_multi_segment_type() {
        let name =
            BuildName::parse("lineage-18.1-20230505-UNOFFICIAL-micro-G-bacon-signed.zip").unwrap();
        assert_eq!(name.build_type, "UNOFFICIAL-micro-G");
        assert_eq!(name.device, "bacon");
    }

    #[test]
    fn test_parse_build_name_rejects_garbage() {
        for bad in [
            "lineage-20.0-20240101-oneplus3-signed.zip",
            "lineage-20.0-20240101-nightly-oneplus3.zip",
            "other-20.0-20240101-nightly-oneplus3-signed.zip",
            "lineage-v20-20240101-nightly-oneplus3-signed.zip",
            "lineage-20.0-2024Jan-nightly-oneplus3-signed.zip",
        ] {
            assert!(BuildName::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_artifact_key() {
        assert_eq!(
            artifact_key("oneplus3", "20.0", "a.zip").unwrap(),
            "oneplus3/20.0/a.zip"
        );
        assert!(artifact_key("..", "20.0", "a.zip").is_err());
        assert!(artifact_key("oneplus3", "20.0", "x/a.zip").is_err());
        assert!(artifact_key("oneplus3", "", "a.zip").is_err());
    }
}
