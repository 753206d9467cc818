//! The JSON document a go/packages driver prints on stdout.
//!
//! Field names follow Go's default encoding (exported field names, no tags)
//! so go/packages can decode the document directly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `packages.ErrorKind` value for errors reported by `go list`
pub const LIST_ERROR: i32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DriverResponse {
    /// The driver declined the request; go/packages falls back to `go list`
    pub not_handled: bool,

    pub compiler: String,
    pub arch: String,

    /// IDs of the packages matched by the patterns, as opposed to their deps
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub roots: Vec<String>,

    pub packages: Vec<Package>,

    pub go_version: i32,
}

/// One package, shaped like go/packages' serialized `Package`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Package {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub pkg_path: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<PackageError>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub go_files: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub compiled_go_files: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub other_files: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embed_files: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embed_patterns: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ignored_files: Vec<String>,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub export_file: String,

    /// Import path as written in source -> package ID
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub imports: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PackageError {
    pub pos: String,
    pub msg: String,
    pub kind: i32,
}
