//! Core data model: change events, the client-side manifest, and the
//! startup/credential value objects the core consumes from its CLI
//! collaborators.

use std::path::{Path, PathBuf};

/// The kind of change the watcher observed for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Erased,
}

/// A single filesystem change, as produced by the watcher and consumed by
/// the client's sync loop. Events are unique by identity, not by path:
/// duplicates are allowed and idempotent on the receiving side.
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub rel_path: PathBuf,
    pub kind: ChangeKind,
}

impl FileEvent {
    pub fn new(rel_path: PathBuf, kind: ChangeKind) -> Self {
        FileEvent { rel_path, kind }
    }
}

/// A file entry inside a [`ManifestDir`], carrying the size and content hash
/// needed for checksync comparison.
#[derive(Debug, Clone)]
pub struct ManifestFile {
    pub name: String,
    pub size: u64,
    /// base64-encoded SHA-512 of the file's contents.
    pub hash: String,
}

/// A recursive description of a directory tree, produced only by the client
/// for checksync.
#[derive(Debug, Clone)]
pub struct ManifestDir {
    pub name: String,
    pub directories: Vec<ManifestDir>,
    pub files: Vec<ManifestFile>,
}

impl ManifestDir {
    pub fn empty(name: impl Into<String>) -> Self {
        ManifestDir {
            name: name.into(),
            directories: Vec::new(),
            files: Vec::new(),
        }
    }
}

/// Credentials gathered by an interactive (or scripted) collaborator; the
/// core only ever sees this value object, never a terminal.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
    /// Whether this is a brand-new account (signup) or an existing login.
    pub is_new_user: bool,
}

/// What an existing (non-new) user's client does once connected and
/// authenticated, chosen from the startup menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupMode {
    /// Reconcile the local tree against the server's (checksync), then
    /// enter the sync loop.
    Monitor,
    /// Pull the server's tree down over the local one (restore), then
    /// exit without monitoring.
    Restore,
    /// Restore, then enter the sync loop.
    RestoreThenMonitor,
}

/// Normalize and validate a path received on the wire: relative, no `..`
/// component, no empty component. Returns `None` if the path is unsafe.
pub fn validate_rel_path(raw: &str) -> Option<PathBuf> {
    let p = Path::new(raw);
    if p.is_absolute() {
        return None;
    }
    let mut out = PathBuf::new();
    for comp in p.components() {
        use std::path::Component::*;
        match comp {
            Normal(s) if !s.is_empty() => out.push(s),
            CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_escape() {
        assert!(validate_rel_path("../etc/passwd").is_none());
        assert!(validate_rel_path("a/../../b").is_none());
    }

    #[test]
    fn rejects_absolute() {
        assert!(validate_rel_path("/etc/passwd").is_none());
    }

    #[test]
    fn accepts_unicode_and_spaces() {
        let p = validate_rel_path("a/héllo wörld.txt").unwrap();
        assert_eq!(p, Path::new("a/héllo wörld.txt"));
    }

    #[test]
    fn rejects_empty() {
        assert!(validate_rel_path("").is_none());
        assert!(validate_rel_path(".").is_none());
    }
}
