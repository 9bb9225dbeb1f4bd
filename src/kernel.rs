//! Kernel manifest (`meta/kernel.yaml`, §6.3): maps `$kernel:<asset>/`
//! references to the content directories a kernel snap publishes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct KernelAsset {
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub content: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct KernelManifest {
    #[serde(default)]
    pub assets: BTreeMap<String, KernelAsset>,
}

/// Decode a kernel manifest. Since this crate takes no dependency on a
/// YAML parser (§1 Non-goals), `text` is expected to already be
/// JSON-decoded YAML (the two are compatible for the mapping this type
/// describes); callers reading `meta/kernel.yaml` off disk are
/// responsible for that conversion before calling this.
pub fn parse_kernel_manifest(text: &str) -> Result<KernelManifest> {
    serde_json::from_str(text).map_err(|e| Error::Parse(format!("decoding kernel manifest: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_manifest_roundtrip() {
        let json = r#"{"assets":{"ref":{"update":true,"content":["ref"]}}}"#;
        let m: KernelManifest = serde_json::from_str(json).unwrap();
        assert!(m.assets["ref"].update);
        assert_eq!(m.assets["ref"].content, vec!["ref".to_string()]);
    }

    #[test]
    fn test_parse_kernel_manifest_rejects_malformed_input() {
        assert!(matches!(parse_kernel_manifest("not json"), Err(Error::Parse(_))));
    }

    #[test]
    fn test_parse_kernel_manifest_accepts_valid_input() {
        let json = r#"{"assets":{"dtbs":{"update":false,"content":["dtbs"]}}}"#;
        let m = parse_kernel_manifest(json).unwrap();
        assert!(!m.assets["dtbs"].update);
    }
}
