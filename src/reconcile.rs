//! The tree reconciler behind checksync. Given a manifest sent by a
//! client, walks the matching directory on disk and reports every path
//! that needs to be resent: anything the manifest lists but the disk is
//! missing or disagrees with (deleted so the retransmit lands clean), and
//! anything extra the disk has that the manifest didn't mention (deleted
//! outright, no report).
//!
//! Grounded on the original's `exploreDir`/`evaulateFiles`: the `exist`
//! flag threads down through recursion so that once a parent directory is
//! found missing, every descendant is reported missing too without being
//! individually stat'd.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::hash::hash_file;
use crate::types::ManifestDir;

fn safe_component(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\\')
}

/// Compare `node` against the on-disk tree rooted at `path`, deleting
/// anything that disagrees or doesn't belong, and appending the absolute
/// path of every manifest entry that must be resent to `missing`.
pub fn explore_dir(path: &Path, node: &ManifestDir, missing: &mut Vec<PathBuf>, exist: bool) {
    let status = exist && path.exists();
    if !status {
        if let Err(err) = std::fs::create_dir_all(path) {
            warn!("cannot create directory {}: {err}", path.display());
        } else {
            info!("directory {} created on server", path.display());
        }
    }

    let mut file_map: HashMap<String, PathBuf> = HashMap::new();
    let mut dir_map: HashMap<String, PathBuf> = HashMap::new();
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let entry_path = entry.path();
            let Some(name) = entry_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if entry_path.is_file() {
                file_map.insert(name.to_string(), entry_path);
            } else if entry_path.is_dir() {
                dir_map.insert(name.to_string(), entry_path);
            }
        }
    }

    for child in &node.directories {
        if !safe_component(&child.name) {
            warn!("refusing unsafe directory name in checksync manifest: {:?}", child.name);
            continue;
        }
        dir_map.remove(&child.name);
        let child_path = path.join(&child.name);
        explore_dir(&child_path, child, missing, status);
    }

    for file in &node.files {
        if !safe_component(&file.name) {
            warn!("refusing unsafe file name in checksync manifest: {:?}", file.name);
            continue;
        }
        let file_path = path.join(&file.name);
        if status && file_path.exists() {
            evaluate_file(&file_path, &file.hash, file.size, missing);
            file_map.remove(&file.name);
        } else {
            missing.push(file_path);
        }
    }

    for leftover in file_map.into_values() {
        if let Err(err) = std::fs::remove_file(&leftover) {
            warn!("cannot remove extra file {}: {err}", leftover.display());
        } else {
            info!("file {} removed from server", leftover.display());
        }
    }
    for leftover in dir_map.into_values() {
        if let Err(err) = std::fs::remove_dir_all(&leftover) {
            warn!("cannot remove extra directory {}: {err}", leftover.display());
        } else {
            info!("directory {} removed from server", leftover.display());
        }
    }
}

/// A file that exists on both sides: delete and report as missing unless
/// its content hash and size both match the manifest.
fn evaluate_file(path: &Path, hash: &str, size: u64, missing: &mut Vec<PathBuf>) {
    let size_matches = std::fs::metadata(path).map(|m| m.len() == size).unwrap_or(false);
    let hash_matches = hash_file(path).map(|h| h == hash).unwrap_or(false);
    if path.is_dir() || !size_matches || !hash_matches {
        missing.push(path.to_path_buf());
        if let Err(err) = std::fs::remove_dir_all(path).or_else(|_| std::fs::remove_file(path)) {
            warn!("cannot remove stale entry {}: {err}", path.display());
        } else {
            info!("file {} not synced with client version", path.display());
        }
    }
}
