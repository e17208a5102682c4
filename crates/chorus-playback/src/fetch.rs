//! Resource fetching.
//!
//! The whole resource is pulled into memory before decode starts; the
//! decoder session then mounts it as an in-memory file. Failures here are
//! [`Error::Fetch`] and occur strictly before any codec is opened.

use bytes::Bytes;
use chorus_core::{Error, MediaFile, Resource, Result};
use tracing::debug;

/// Materialize a resource as an in-memory media file.
pub fn fetch(resource: &Resource) -> Result<MediaFile> {
    match resource {
        Resource::Url(url) => fetch_url(url),
        Resource::Path(path) => {
            let data = std::fs::read(path)
                .map_err(|e| Error::Fetch(format!("failed to read {}: {e}", path.display())))?;
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("stream")
                .to_string();
            Ok(MediaFile::new(name, data))
        }
        Resource::Bytes { name, data } => Ok(MediaFile::new(name.clone(), data.clone())),
    }
}

fn fetch_url(url: &str) -> Result<MediaFile> {
    debug!("fetching {url}");

    let mut body = ureq::get(url)
        .header("Accept", "*/*")
        .call()
        .map_err(|e| Error::Fetch(format!("http request failed: {e}")))?
        .into_body();

    let mime_type = body.mime_type().map(String::from);
    let data: Vec<u8> = body
        .read_to_vec()
        .map_err(|e| Error::Fetch(format!("failed to read response: {e}")))?;

    debug!("fetched {} bytes, mime: {mime_type:?}", data.len());

    Ok(MediaFile::new(
        file_name_for(url, mime_type.as_deref()),
        Bytes::from(data),
    ))
}

/// Derive a mountable file name from the URL, using the MIME type to add a
/// container-hinting extension when the URL has none.
fn file_name_for(url: &str, mime: Option<&str>) -> String {
    let base = url.split(['?', '#']).next().unwrap_or(url);
    let name = base
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("stream")
        .to_string();

    if name.contains('.') {
        return name;
    }

    let ext = mime.and_then(|mime| {
        if mime.contains("webm") || mime.contains("opus") {
            Some("webm")
        } else if mime.contains("mp4") || mime.contains("m4a") || mime.contains("aac") {
            Some("m4a")
        } else if mime.contains("mp3") || mime.contains("mpeg") {
            Some("mp3")
        } else if mime.contains("ogg") || mime.contains("vorbis") {
            Some("ogg")
        } else if mime.contains("flac") {
            Some("flac")
        } else if mime.contains("wav") {
            Some("wav")
        } else {
            None
        }
    });

    ext.map_or(name.clone(), |e| format!("{name}.{e}"))
}
