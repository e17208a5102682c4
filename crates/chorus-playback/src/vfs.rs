//! In-memory virtual filesystem for decoder sessions.
//!
//! Each session mounts its fetched media file under a session-scoped
//! directory and hands the codec a path. The mount is released when the
//! session's [`MountGuard`] drops, so no mount can outlive its session.

use std::collections::HashMap;

use bytes::Bytes;
use chorus_core::MediaFile;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{debug, warn};

static MOUNTS: Lazy<RwLock<HashMap<String, Bytes>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Mount a file under `dir`, returning a guard that unmounts on drop.
pub fn mount(dir: &str, file: &MediaFile) -> MountGuard {
    let path = format!("{dir}/{}", file.name);
    let previous = MOUNTS.write().insert(path.clone(), file.data.clone());
    if previous.is_some() {
        warn!("vfs: remounting over existing path {path}");
    }
    debug!("vfs: mounted {path} ({} bytes)", file.len());
    MountGuard { path }
}

/// Open a mounted file by path.
pub fn open(path: &str) -> Option<Bytes> {
    MOUNTS.read().get(path).cloned()
}

/// RAII handle for a mounted file.
#[derive(Debug)]
pub struct MountGuard {
    path: String,
}

impl MountGuard {
    /// Full path the codec should open.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        MOUNTS.write().remove(&self.path);
        debug!("vfs: unmounted {}", self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_open_unmount() {
        let file = MediaFile::new("track.wav", Bytes::from_static(b"RIFF"));
        let guard = mount("/session_test_1", &file);
        assert_eq!(guard.path(), "/session_test_1/track.wav");
        assert_eq!(open(guard.path()), Some(Bytes::from_static(b"RIFF")));

        let path = guard.path().to_string();
        drop(guard);
        assert_eq!(open(&path), None);
    }

    #[test]
    fn test_open_missing_path() {
        assert_eq!(open("/session_test_2/missing.mp3"), None);
    }
}
