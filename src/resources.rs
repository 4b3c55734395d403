//! Content-addressed resource store.
//!
//! Every media file a page points at is copied to `resources/<sha1>` next to a
//! `<sha1>.json` sidecar, and the page is rewritten to `../resources/<sha1>`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context as _;
use md5::Md5;
use sha1::{Digest as _, Sha1};

use crate::error::AssembleError;
use crate::formats::ResourceSidecar;

/// S3 multipart chunk size used for the ETag.
pub const CHUNK_SIZE: usize = 8 * 1024 * 1024;

pub const DOM_PREFIX: &str = "../resources/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHash {
    pub sha1: String,
    pub s3_md5: String,
}

/// Hashes `path`, or returns `None` when it does not exist.
pub fn hash(path: &Path) -> anyhow::Result<Option<ContentHash>> {
    hash_with_chunk_size(path, CHUNK_SIZE)
}

pub fn hash_with_chunk_size(path: &Path, chunk_size: usize) -> anyhow::Result<Option<ContentHash>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("open resource: {}", path.display()));
        }
    };

    let mut sha1 = Sha1::new();
    let mut chunk_digests: Vec<u8> = Vec::new();
    let mut chunks = 0usize;
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let filled = fill_chunk(&mut file, &mut buf)
            .with_context(|| format!("read resource: {}", path.display()))?;
        if filled == 0 {
            break;
        }
        sha1.update(&buf[..filled]);
        chunk_digests.extend_from_slice(&Md5::digest(&buf[..filled]));
        chunks += 1;
        if filled < buf.len() {
            break;
        }
    }

    let s3_md5 = match chunks {
        0 => format!("\"{}\"", hex::encode(Md5::digest(b""))),
        1 => format!("\"{}\"", hex::encode(&chunk_digests)),
        n => format!("\"{}-{n}\"", hex::encode(Md5::digest(&chunk_digests))),
    };

    Ok(Some(ContentHash {
        sha1: hex::encode(sha1.finalize()),
        s3_md5,
    }))
}

fn fill_chunk(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub mime_type: String,
    pub width: i64,
    pub height: i64,
}

/// Sniffs the MIME type from magic bytes, falling back to the file extension, and
/// reads image dimensions. Non-images and undecodable images report `-1 x -1`.
pub fn probe(path: &Path) -> anyhow::Result<Probe> {
    let mut head = [0u8; 512];
    let len = {
        let mut file =
            File::open(path).with_context(|| format!("open resource: {}", path.display()))?;
        fill_chunk(&mut file, &mut head)
            .with_context(|| format!("read resource: {}", path.display()))?
    };
    let head = &head[..len];

    let mime_type = sniff_mime(head)
        .or_else(|| mime_from_extension(path))
        .unwrap_or("application/octet-stream")
        .to_owned();

    let (width, height) = if mime_type.starts_with("image/") {
        match image::image_dimensions(path) {
            Ok((w, h)) => (i64::from(w), i64::from(h)),
            Err(err) => {
                tracing::debug!(path = %path.display(), %err, "no image dimensions");
                (-1, -1)
            }
        }
    } else {
        (-1, -1)
    };

    Ok(Probe {
        mime_type,
        width,
        height,
    })
}

fn sniff_mime(head: &[u8]) -> Option<&'static str> {
    if let Ok(format) = image::guess_format(head) {
        return Some(format.to_mime_type());
    }
    let text_start = String::from_utf8_lossy(&head[..head.len().min(256)]).to_ascii_lowercase();
    let text_start = text_start.trim_start_matches('\u{feff}').trim_start();
    let mime = if head.starts_with(b"%PDF-") {
        "application/pdf"
    } else if head.starts_with(b"ID3") || head.starts_with(&[0xff, 0xfb]) {
        "audio/mpeg"
    } else if head.starts_with(b"OggS") {
        "audio/ogg"
    } else if head.starts_with(b"RIFF") && head.get(8..12) == Some(&b"WAVE"[..]) {
        "audio/wav"
    } else if head.get(4..8) == Some(&b"ftyp"[..]) {
        "video/mp4"
    } else if head.starts_with(&[0x1a, 0x45, 0xdf, 0xa3]) {
        "video/webm"
    } else if head.starts_with(b"PK\x03\x04") {
        "application/zip"
    } else if text_start.contains("<svg") {
        "image/svg+xml"
    } else if text_start.starts_with("<!doctype html") || text_start.starts_with("<html") {
        "text/html"
    } else {
        return None;
    };
    Some(mime)
}

fn mime_from_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        "bmp" => "image/bmp",
        "pdf" => "application/pdf",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "zip" => "application/zip",
        "ggb" => "application/vnd.geogebra.file",
        _ => return None,
    };
    Some(mime)
}

/// Append-only store rooted at one `resources/` directory. Shared between the page
/// loop and embed workers; stores are serialized behind the cache lock.
#[derive(Debug)]
pub struct ResourceStore {
    resource_dir: PathBuf,
    cache: Mutex<HashMap<String, String>>,
}

impl ResourceStore {
    pub fn new(resource_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let resource_dir = resource_dir.into();
        std::fs::create_dir_all(&resource_dir)
            .with_context(|| format!("create resource dir: {}", resource_dir.display()))?;
        Ok(Self {
            resource_dir,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn resource_dir(&self) -> &Path {
        &self.resource_dir
    }

    /// Content-addresses `source` and returns its DOM path (`../resources/<sha1>`).
    /// Repeated calls with the same `cache_key` return the cached path.
    pub fn store(&self, cache_key: &str, source: &Path, is_image: bool) -> anyhow::Result<String> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow::anyhow!("resource cache lock poisoned"))?;
        if let Some(dom_path) = cache.get(cache_key) {
            return Ok(dom_path.clone());
        }

        let Some(content_hash) = hash(source)? else {
            return Err(AssembleError::ResourceIo {
                path: source.to_path_buf(),
            }
            .into());
        };

        let content_path = self.resource_dir.join(&content_hash.sha1);
        if !content_path.exists() {
            let mut tmp = tempfile::NamedTempFile::new_in(&self.resource_dir)
                .context("create resource temp file")?;
            let mut input = File::open(source)
                .with_context(|| format!("open resource: {}", source.display()))?;
            std::io::copy(&mut input, tmp.as_file_mut())
                .with_context(|| format!("copy resource: {}", source.display()))?;
            persist_first_writer_wins(tmp, &content_path)?;
        }

        let sidecar_path = self.resource_dir.join(format!("{}.json", content_hash.sha1));
        if !sidecar_path.exists() {
            let probed = if is_image {
                probe(source)?
            } else {
                Probe {
                    width: -1,
                    height: -1,
                    ..probe(source)?
                }
            };
            let sidecar = ResourceSidecar {
                sha1: content_hash.sha1.clone(),
                s3_md5: content_hash.s3_md5.clone(),
                mime_type: probed.mime_type,
                width: probed.width,
                height: probed.height,
                original_name: source
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            };
            let json = serde_json::to_vec_pretty(&sidecar).context("serialize sidecar")?;
            let mut tmp = tempfile::NamedTempFile::new_in(&self.resource_dir)
                .context("create sidecar temp file")?;
            tmp.write_all(&json).context("write sidecar")?;
            persist_first_writer_wins(tmp, &sidecar_path)?;
        }

        tracing::debug!(
            key = %cache_key,
            sha1 = %content_hash.sha1,
            source = %source.display(),
            "stored resource"
        );
        let dom_path = format!("{DOM_PREFIX}{}", content_hash.sha1);
        cache.insert(cache_key.to_owned(), dom_path.clone());
        Ok(dom_path)
    }
}

fn persist_first_writer_wins(tmp: tempfile::NamedTempFile, dest: &Path) -> anyhow::Result<()> {
    match tmp.persist_noclobber(dest) {
        Ok(_) => Ok(()),
        Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err.error).with_context(|| format!("persist {}", dest.display())),
    }
}

#[cfg(test)]
mod tests {
    use sha1::Digest as _;

    use super::*;

    #[test]
    fn single_chunk_etag_is_plain_md5() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello")?;

        let hashed = hash(&path)?.ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert_eq!(hashed.sha1, "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        assert_eq!(hashed.s3_md5, "\"5d41402abc4b2a76b9719d911017c592\"");
        Ok(())
    }

    #[test]
    fn multi_chunk_etag_hashes_concatenated_digests() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("big.bin");
        std::fs::write(&path, b"abcdefghij")?;

        let hashed = hash_with_chunk_size(&path, 4)?.ok_or_else(|| anyhow::anyhow!("missing"))?;

        let mut combined = Md5::new();
        for chunk in [&b"abcd"[..], b"efgh", b"ij"] {
            combined.update(Md5::digest(chunk));
        }
        let expected = format!("\"{}-3\"", hex::encode(combined.finalize()));
        assert_eq!(hashed.s3_md5, expected);
        assert_eq!(hashed.sha1, hex::encode(Sha1::digest(b"abcdefghij")));
        Ok(())
    }

    #[test]
    fn exact_chunk_multiple_does_not_add_an_empty_part() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("even.bin");
        std::fs::write(&path, b"abcdefgh")?;

        let hashed = hash_with_chunk_size(&path, 4)?.ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert!(hashed.s3_md5.ends_with("-2\""));
        Ok(())
    }

    #[test]
    fn missing_file_hashes_to_none() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(hash(&dir.path().join("nope.png"))?, None);
        Ok(())
    }

    #[test]
    fn probe_reads_png_dimensions_and_falls_back_to_extension() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let png = dir.path().join("dot.png");
        image::RgbImage::new(3, 2).save(&png)?;
        let probed = probe(&png)?;
        assert_eq!(probed.mime_type, "image/png");
        assert_eq!((probed.width, probed.height), (3, 2));

        let csv = dir.path().join("table.csv");
        std::fs::write(&csv, "a,b\n1,2\n")?;
        let probed = probe(&csv)?;
        assert_eq!(probed.mime_type, "text/csv");
        assert_eq!((probed.width, probed.height), (-1, -1));
        Ok(())
    }

    #[test]
    fn identical_bytes_share_one_file_and_sidecar() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let a = dir.path().join("a.png");
        let b = dir.path().join("b.png");
        image::RgbImage::new(1, 1).save(&a)?;
        std::fs::copy(&a, &b)?;

        let store = ResourceStore::new(dir.path().join("resources"))?;
        let first = store.store("a.png", &a, true)?;
        let second = store.store("b.png", &b, true)?;
        assert_eq!(first, second);

        let entries = std::fs::read_dir(store.resource_dir())?.count();
        assert_eq!(entries, 2);

        let sha1 = first.trim_start_matches(DOM_PREFIX);
        let sidecar: ResourceSidecar = serde_json::from_slice(&std::fs::read(
            store.resource_dir().join(format!("{sha1}.json")),
        )?)?;
        assert_eq!(sidecar.sha1, sha1);
        assert_eq!(sidecar.mime_type, "image/png");
        assert_eq!(sidecar.original_name, "a.png");
        assert!(a.exists(), "inputs stay in place");
        Ok(())
    }

    #[test]
    fn missing_source_is_a_resource_io_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ResourceStore::new(dir.path().join("resources"))?;
        let err = match store.store("k", &dir.path().join("gone.png"), true) {
            Ok(path) => anyhow::bail!("unexpected success: {path}"),
            Err(err) => err,
        };
        assert!(matches!(
            crate::error::find_assemble_error(&err),
            Some(AssembleError::ResourceIo { .. })
        ));
        Ok(())
    }
}
