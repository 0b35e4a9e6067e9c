//! Upstream manifest entries and device rosters.
//!
//! The updater serves, per device and channel, a JSON envelope
//! `{"response": [entry, ...]}`. Entries are decoded one at a time so a
//! single malformed entry never hides the rest of the manifest.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use time::OffsetDateTime;
use time::macros::format_description;

/// One published artifact as listed by the upstream updater.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub filename: String,
    pub size: u64,
    /// Publication time, unix seconds.
    pub datetime: i64,
    pub version: String,
    pub url: String,
    /// Upstream identifies builds by their sha256.
    #[serde(rename = "id")]
    pub sha256: String,
    #[serde(default)]
    pub romtype: Option<String>,
    /// Detached signature in `keyname:base64` form.
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default)]
    pub sha512: Option<String>,
}

impl ManifestEntry {
    /// Decode and validate a single entry.
    pub fn from_value(value: serde_json::Value) -> crate::Result<Self> {
        let mut entry: Self = serde_json::from_value(value)
            .map_err(|e| crate::Error::ManifestMalformed(e.to_string()))?;
        entry.validate()?;
        entry.sha256 = entry.sha256.to_ascii_lowercase();
        Ok(entry)
    }

    fn validate(&self) -> crate::Result<()> {
        let malformed = |what: &str| {
            crate::Error::ManifestMalformed(format!("{what} in entry {:?}", self.filename))
        };
        crate::build::artifact_key("device", &self.version, &self.filename)
            .map_err(|_| malformed("invalid filename or version"))?;
        crate::hash::normalize_hex(&self.sha256, 32).map_err(|_| malformed("invalid sha256"))?;
        if self.url.is_empty() {
            return Err(malformed("empty url"));
        }
        self.date().map_err(|_| malformed("datetime out of range"))?;
        Ok(())
    }

    /// Build date as `YYYYMMDD` in UTC.
    pub fn date(&self) -> crate::Result<String> {
        let ts = OffsetDateTime::from_unix_timestamp(self.datetime)
            .map_err(|e| crate::Error::ManifestMalformed(e.to_string()))?;
        ts.format(format_description!("[year][month][day]"))
            .map_err(|e| crate::Error::Serialization(e.to_string()))
    }

    /// The message covered by the entry's signature.
    pub fn fingerprint(&self) -> String {
        artifact_fingerprint(&self.filename, &self.sha256, self.size)
    }
}

/// Signed message for an artifact: `1;{filename};{sha256};{size}`.
pub fn artifact_fingerprint(filename: &str, sha256: &str, size: u64) -> String {
    format!("1;{filename};{};{size}", sha256.to_ascii_lowercase())
}

/// Result of decoding a manifest envelope.
#[derive(Debug, Default)]
pub struct ParsedManifest {
    pub entries: Vec<ManifestEntry>,
    /// One message per entry that was skipped.
    pub rejected: Vec<String>,
}

impl ParsedManifest {
    /// Decode a manifest body.
    ///
    /// Fails only if the envelope itself is unusable.
    pub fn parse(body: &[u8]) -> crate::Result<Self> {
        let envelope: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| crate::Error::ManifestMalformed(e.to_string()))?;
        let items = envelope
            .get("response")
            .and_then(|v| v.as_array())
            .ok_or_else(|| crate::Error::ManifestMalformed("missing response array".into()))?;

        let mut parsed = Self::default();
        for (idx, item) in items.iter().enumerate() {
            match ManifestEntry::from_value(item.clone()) {
                Ok(entry) => parsed.entries.push(entry),
                Err(e) => parsed.rejected.push(format!("entry {idx}: {e}")),
            }
        }
        Ok(parsed)
    }

    /// Filenames listed upstream, including entries later capped away.
    pub fn filenames(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.filename.clone()).collect()
    }

    /// Entries newest first by publication time.
    pub fn newest_first(&self) -> Vec<ManifestEntry> {
        let mut sorted = self.entries.clone();
        sorted.sort_by(|a, b| b.datetime.cmp(&a.datetime));
        sorted
    }
}

/// Parse a plain-text device roster.
///
/// Blank lines and `#` comments are ignored; the codename is the first
/// whitespace-separated token of each line. Duplicates are dropped.
pub fn parse_device_list(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_whitespace().next())
        .filter(|device| seen.insert(device.to_string()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SHA: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn entry_json(filename: &str, version: &str, datetime: i64) -> serde_json::Value {
        json!({
            "datetime": datetime,
            "filename": filename,
            "id": SHA,
            "romtype": "nightly",
            "size": 0,
            "url": format!("https://mirror.example/{filename}"),
            "version": version,
        })
    }

    #[test]
    fn test_parse_skips_malformed_entries() {
        let body = json!({
            "response": [
                entry_json("lineage-20.0-20240102-nightly-oneplus3-signed.zip", "20.0", 1704153600),
                {"filename": "missing-everything.zip"},
                entry_json("lineage-20.0-20240101-nightly-oneplus3-signed.zip", "20.0", 1704067200),
            ]
        });
        let parsed = ParsedManifest::parse(body.to_string().as_bytes()).unwrap();
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.rejected.len(), 1);
        assert!(parsed.rejected[0].starts_with("entry 1"));
    }

    #[test]
    fn test_parse_rejects_bad_envelope() {
        assert!(ParsedManifest::parse(b"not json").is_err());
        assert!(ParsedManifest::parse(br#"{"builds": []}"#).is_err());
    }

    #[test]
    fn test_entry_rejects_traversal_filename() {
        let err = ManifestEntry::from_value(entry_json("../evil.zip", "20.0", 0)).unwrap_err();
        assert!(matches!(err, crate::Error::ManifestMalformed(_)));
    }

    #[test]
    fn test_entry_date_is_utc() {
        let entry =
            ManifestEntry::from_value(entry_json("a.zip", "20.0", 1704153599)).unwrap();
        assert_eq!(entry.date().unwrap(), "20240101");
    }

    #[test]
    fn test_newest_first() {
        let body = json!({
            "response": [
                entry_json("a.zip", "20.0", 100),
                entry_json("b.zip", "20.0", 300),
                entry_json("c.zip", "20.0", 200),
                entry_json("d.zip", "21.0", 50),
            ]
        });
        let parsed = ParsedManifest::parse(body.to_string().as_bytes()).unwrap();

        let ordered: Vec<_> = parsed
            .newest_first()
            .into_iter()
            .map(|e| e.filename)
            .collect();
        assert_eq!(ordered, vec!["b.zip", "c.zip", "a.zip", "d.zip"]);
        assert_eq!(parsed.filenames().len(), 4);
    }

    #[test]
    fn test_fingerprint_lowercases_hash() {
        assert_eq!(
            artifact_fingerprint("a.zip", "ABCD", 7),
            "1;a.zip;abcd;7"
        );
    }

    #[test]
    fn test_parse_device_list() {
        let text = "# comment\n\noneplus3 lineage-20.0 N W\nbacon lineage-18.1 W\n  \noneplus3 again\n";
        assert_eq!(parse_device_list(text), vec!["oneplus3", "bacon"]);
        assert!(parse_device_list("# only comments\n").is_empty());
    }
}
