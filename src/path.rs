//! String-based path arithmetic.
//!
//! All the paths exchanged between the engine's components are plain strings:
//! either absolute, or "local" (relative to the project root, no leading
//! slash). Doing the arithmetic on strings rather than `PathBuf` keeps the
//! local-path invariant visible in the types that store them, and matches the
//! way paths are persisted in the update log.

use thiserror::Error;

/// A path resolved to somewhere outside of the project root directory, for
/// example `../foo` relative to the root itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("encountered a path out of the project root: {relative_path}")]
pub struct PathOutOfRootError {
    pub relative_path: String,
}

/// Split a path on runs of `/`, dropping `.` components and collapsing `..`
/// into the component that precedes it. An absolute path produces an empty
/// first component, which `join_path` turns back into the leading slash.
pub fn split_path(path: &str) -> Vec<&str> {
    let bytes = path.as_bytes();
    let mut parts: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let mut j = i;
        while j < bytes.len() && bytes[j] != b'/' {
            j += 1;
        }
        let part = &path[i..j];
        if part == ".." && !parts.is_empty() {
            parts.pop();
        } else if part != "." {
            parts.push(part);
        }
        while j < bytes.len() && bytes[j] == b'/' {
            j += 1;
        }
        i = j;
    }
    parts
}

pub fn join_path(parts: &[&str]) -> String {
    if parts.is_empty() {
        return ".".to_string();
    }
    let result = parts.join("/");
    if result.is_empty() {
        "/".to_string()
    } else {
        result
    }
}

/// Collapse `.` and `..` components and redundant separators. The empty path
/// normalizes to `.`, and a separators-only path to `/`.
pub fn normalize_path(path: &str) -> String {
    join_path(&split_path(path))
}

pub fn is_path_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Resolve `relative_path` against `working_path` unless it is already
/// absolute, then normalize.
pub fn get_absolute_path(relative_path: &str, working_path: &str) -> String {
    if is_path_absolute(relative_path) {
        return normalize_path(relative_path);
    }
    normalize_path(&format!("{}/{}", working_path, relative_path))
}

/// Express `relative_path`, resolved against `working_path`, as a local path
/// under `root_path`. The root path must be absolute and normalized.
pub fn get_local_path(
    root_path: &str,
    relative_path: &str,
    working_path: &str,
) -> Result<String, PathOutOfRootError> {
    let absolute_path = get_absolute_path(relative_path, working_path);
    let prefix = format!("{}/", root_path);
    if !absolute_path.starts_with(&prefix) {
        return Err(PathOutOfRootError { relative_path: relative_path.to_string() });
    }
    Ok(absolute_path[prefix.len()..].to_string())
}

/// Express `relative_path`, resolved against `working_path`, relatively to
/// `target_path`, using `..` components for the non-shared prefix. This is
/// the shortest relative spelling when all three paths are normalized.
pub fn get_relative_path(target_path: &str, relative_path: &str, working_path: &str) -> String {
    let absolute_path = get_absolute_path(relative_path, working_path);
    let target_parts = split_path(target_path);
    let source_parts = split_path(&absolute_path);
    let mut common = 0;
    while common < target_parts.len()
        && common < source_parts.len()
        && target_parts[common] == source_parts[common]
    {
        common += 1;
    }
    let mut result_parts: Vec<&str> = Vec::new();
    for _ in common..target_parts.len() {
        result_parts.push("..");
    }
    for part in &source_parts[common..] {
        result_parts.push(part);
    }
    join_path(&result_parts)
}

/// Textual POSIX `dirname` over `/`-separated strings.
pub fn dirname(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return if path.is_empty() { ".".to_string() } else { "/".to_string() };
    }
    match trimmed.rfind('/') {
        None => ".".to_string(),
        Some(0) => "/".to_string(),
        Some(ix) => trimmed[..ix].trim_end_matches('/').to_string(),
    }
}
