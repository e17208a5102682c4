//! Shared playback types.

use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;

/// A playable resource handed to a playback backend.
#[derive(Debug, Clone)]
pub enum Resource {
    /// Remote resource fetched over HTTP.
    Url(String),
    /// Local file on disk.
    Path(PathBuf),
    /// Raw bytes already in memory, with a display name used for
    /// container-format hinting.
    Bytes { name: String, data: Bytes },
}

impl Resource {
    /// Human-readable source string, exposed as the backend's `src` property.
    pub fn describe(&self) -> String {
        match self {
            Self::Url(url) => url.clone(),
            Self::Path(path) => path.display().to_string(),
            Self::Bytes { name, .. } => format!("memory:{name}"),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// An in-memory media file ready to be mounted for a decoder session.
#[derive(Debug, Clone)]
pub struct MediaFile {
    /// File name including extension; the extension hints the container
    /// format to the codec.
    pub name: String,
    /// Full file contents.
    pub data: Bytes,
}

impl MediaFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Size of the file in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_describe() {
        let url = Resource::Url("https://example.com/a.flac".into());
        assert_eq!(url.describe(), "https://example.com/a.flac");

        let mem = Resource::Bytes {
            name: "track.mp3".into(),
            data: Bytes::from_static(b"abc"),
        };
        assert_eq!(mem.describe(), "memory:track.mp3");
    }

    #[test]
    fn test_media_file() {
        let file = MediaFile::new("a.wav", Bytes::from_static(&[0u8; 16]));
        assert_eq!(file.len(), 16);
        assert!(!file.is_empty());
    }
}
