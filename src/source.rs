//! Candidate sources: JSON files of generated alphas.
//!
//! Two shapes are accepted, a bare list of records with an `alpha` field or
//! an object wrapping that list under `GeneratedAlphas`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::state_machine::Candidate;

const WRAPPER_KEY: &str = "GeneratedAlphas";
const EXPRESSION_KEY: &str = "alpha";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{0}: expected a list of alpha records or an object with `GeneratedAlphas`")]
    UnrecognizedShape(PathBuf),
}

#[derive(Debug, Deserialize)]
struct AlphaRecord {
    alpha: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AlphaDocument {
    Wrapped {
        #[serde(rename = "GeneratedAlphas")]
        generated: Vec<AlphaRecord>,
    },
    List(Vec<AlphaRecord>),
}

/// Parse candidates from a JSON document, preserving order.
pub fn parse_candidates(text: &str) -> Result<Vec<Candidate>, serde_json::Error> {
    let document: AlphaDocument = serde_json::from_str(text)?;
    let records = match document {
        AlphaDocument::Wrapped { generated } => generated,
        AlphaDocument::List(records) => records,
    };
    Ok(records.into_iter().map(|r| Candidate::new(r.alpha)).collect())
}

pub fn load_candidates(path: &Path) -> Result<Vec<Candidate>, SourceError> {
    let text = read(path)?;
    // Tell malformed JSON apart from well-formed JSON of the wrong shape.
    if let Err(source) = serde_json::from_str::<Value>(&text) {
        return Err(SourceError::Json {
            path: path.to_path_buf(),
            source,
        });
    }
    parse_candidates(&text).map_err(|_| SourceError::UnrecognizedShape(path.to_path_buf()))
}

/// Expand directories into their `*.json` files, sorted by name.
pub fn discover_sources(paths: &[PathBuf]) -> Result<Vec<PathBuf>, SourceError> {
    let mut sources = Vec::new();
    for path in paths {
        if path.is_dir() {
            let entries = fs::read_dir(path).map_err(|source| SourceError::Io {
                path: path.clone(),
                source,
            })?;
            let mut found: Vec<PathBuf> = entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            found.sort();
            sources.extend(found);
        } else {
            sources.push(path.clone());
        }
    }
    Ok(sources)
}

/// Rewrite the first record whose expression equals `old` to `new`.
///
/// Returns `Ok(false)` when `old` is not in the file. The file is replaced
/// through a temporary sibling so a crash never leaves it half-written.
pub fn replace_candidate(path: &Path, old: &Candidate, new: &Candidate) -> Result<bool, SourceError> {
    let text = read(path)?;
    let mut document: Value = serde_json::from_str(&text).map_err(|source| SourceError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let records = match &mut document {
        Value::Array(records) => records,
        Value::Object(map) => match map.get_mut(WRAPPER_KEY) {
            Some(Value::Array(records)) => records,
            _ => return Err(SourceError::UnrecognizedShape(path.to_path_buf())),
        },
        _ => return Err(SourceError::UnrecognizedShape(path.to_path_buf())),
    };

    let slot = records
        .iter_mut()
        .filter_map(|r| r.get_mut(EXPRESSION_KEY))
        .find(|v| v.as_str() == Some(old.as_str()));
    let Some(slot) = slot else {
        return Ok(false);
    };
    *slot = Value::String(new.as_str().to_string());

    let rendered = serde_json::to_string_pretty(&document).map_err(|source| SourceError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    let io_err = |source: std::io::Error| SourceError::Io {
        path: path.to_path_buf(),
        source,
    };
    fs::write(&tmp, rendered).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(true)
}

fn read(path: &Path) -> Result<String, SourceError> {
    fs::read_to_string(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })
}
