//! Conversion of `go list -json` output into a go/packages driver response

use crate::error::DriverError;
use golist_types::{DriverResponse, Package, PackageError, Query, LIST_ERROR};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// The subset of `go list -json` fields the response is built from
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ListPackage {
    import_path: String,
    name: String,
    dir: String,
    export: String,
    dep_only: bool,
    error: Option<ListError>,

    go_files: Vec<String>,
    cgo_files: Vec<String>,
    compiled_go_files: Vec<String>,
    c_files: Vec<String>,
    #[serde(rename = "CXXFiles")]
    cxx_files: Vec<String>,
    m_files: Vec<String>,
    h_files: Vec<String>,
    f_files: Vec<String>,
    s_files: Vec<String>,
    swig_files: Vec<String>,
    #[serde(rename = "SwigCXXFiles")]
    swig_cxx_files: Vec<String>,
    syso_files: Vec<String>,
    ignored_go_files: Vec<String>,
    ignored_other_files: Vec<String>,
    embed_files: Vec<String>,
    embed_patterns: Vec<String>,

    imports: Vec<String>,
    import_map: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ListError {
    pos: String,
    err: String,
}

/// Build the driver response for `query` from the concatenated JSON
/// objects `go list -json` prints.
pub fn to_response(query: &Query, stdout: &[u8]) -> Result<DriverResponse, DriverError> {
    let mut roots = Vec::new();
    let mut packages = Vec::new();
    let mut seen = HashSet::new();

    for record in serde_json::Deserializer::from_slice(stdout).into_iter::<ListPackage>() {
        let record = record.map_err(DriverError::InvalidOutput)?;
        if record.import_path.is_empty() || !seen.insert(record.import_path.clone()) {
            continue;
        }
        if !record.dep_only {
            roots.push(record.import_path.clone());
        }
        packages.push(convert(record));
    }

    Ok(DriverResponse {
        not_handled: false,
        compiler: "gc".to_string(),
        arch: target_arch(&query.env),
        roots,
        packages,
        go_version: 0,
    })
}

fn convert(record: ListPackage) -> Package {
    let dir = Path::new(&record.dir);
    let absolute = |files: &[String]| -> Vec<String> {
        files
            .iter()
            .map(|file| {
                if record.dir.is_empty() || Path::new(file).is_absolute() {
                    file.clone()
                } else {
                    dir.join(file).to_string_lossy().into_owned()
                }
            })
            .collect()
    };

    let go_files = absolute(&[record.go_files.as_slice(), record.cgo_files.as_slice()].concat());
    let compiled_go_files = if record.compiled_go_files.is_empty() {
        go_files.clone()
    } else {
        absolute(&record.compiled_go_files)
    };
    let other_files = absolute(
        &[
            record.c_files.as_slice(),
            record.cxx_files.as_slice(),
            record.m_files.as_slice(),
            record.h_files.as_slice(),
            record.f_files.as_slice(),
            record.s_files.as_slice(),
            record.swig_files.as_slice(),
            record.swig_cxx_files.as_slice(),
            record.syso_files.as_slice(),
        ]
        .concat(),
    );
    let ignored_files = absolute(
        &[
            record.ignored_go_files.as_slice(),
            record.ignored_other_files.as_slice(),
        ]
        .concat(),
    );
    let embed_files = absolute(&record.embed_files);

    // ImportMap wins over the raw import list (vendoring, test variants).
    let mut imports = BTreeMap::new();
    for (path, id) in &record.import_map {
        imports.insert(path.clone(), id.clone());
    }
    for id in &record.imports {
        if id == "C" || imports.values().any(|mapped| mapped == id) {
            continue;
        }
        imports.entry(id.clone()).or_insert_with(|| id.clone());
    }

    let errors = record
        .error
        .into_iter()
        .map(|e| PackageError {
            pos: e.pos,
            msg: e.err.trim().to_string(),
            kind: LIST_ERROR,
        })
        .collect();

    // Test variants look like "pkg [pkg.test]"; the package path is the
    // part before the bracket.
    let pkg_path = record
        .import_path
        .split_once(' ')
        .map(|(path, _)| path.to_string())
        .unwrap_or_else(|| record.import_path.clone());

    Package {
        id: record.import_path,
        name: record.name,
        pkg_path,
        errors,
        go_files,
        compiled_go_files,
        other_files,
        embed_files,
        embed_patterns: record.embed_patterns,
        ignored_files,
        export_file: record.export,
        imports,
    }
}

/// GOARCH the query targets: its own env first, then ours, then the host.
fn target_arch(env: &[String]) -> String {
    env.iter()
        .rev()
        .find_map(|entry| entry.strip_prefix("GOARCH="))
        .map(str::to_string)
        .or_else(|| std::env::var("GOARCH").ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| host_arch().to_string())
}

fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64",
        other => other,
    }
}
