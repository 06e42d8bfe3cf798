//! Container and compression handling for fetched payloads.
//!
//! A payload is either a tar container (possibly compressed), a single
//! compressed stream, or plain bytes. [`normalize`] flattens all three into a
//! list of named plain payloads ready for a parser.

use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, warn};
use xz2::read::XzDecoder;
use xz2::stream::Stream;

use crate::traits::{DownloadError, Payload};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC: &[u8] = b"ustar";

/// Single-stream compression recognized by magic bytes or file suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
    Lzma,
}

impl Compression {
    pub fn detect(name: &str, bytes: &[u8]) -> Self {
        if bytes.starts_with(XZ_MAGIC) {
            return Compression::Xz;
        }
        if bytes.starts_with(GZIP_MAGIC) {
            return Compression::Gzip;
        }
        match Path::new(name).extension().and_then(|e| e.to_str()) {
            Some("xz") => Compression::Xz,
            Some("lzma") => Compression::Lzma,
            Some("gz") => Compression::Gzip,
            _ => Compression::None,
        }
    }

    /// Decompresses `payload`, dropping the compression suffix from its name.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Decompress`] if the stream is corrupt.
    pub fn decompress(self, payload: Payload) -> Result<Payload, DownloadError> {
        let reader = Cursor::new(payload.bytes.as_slice());
        let mut output = Vec::new();
        let result = match self {
            Compression::None => return Ok(payload),
            Compression::Gzip => GzDecoder::new(reader).read_to_end(&mut output),
            Compression::Xz => XzDecoder::new(reader).read_to_end(&mut output),
            Compression::Lzma => {
                let stream = Stream::new_lzma_decoder(u64::MAX).map_err(|e| {
                    DownloadError::Decompress {
                        name: payload.name.clone(),
                        message: e.to_string(),
                    }
                })?;
                XzDecoder::new_stream(reader, stream).read_to_end(&mut output)
            }
        };
        result.map_err(|e| DownloadError::Decompress {
            name: payload.name.clone(),
            message: e.to_string(),
        })?;

        Ok(Payload {
            name: strip_compression_suffix(&payload.name).to_string(),
            bytes: output,
        })
    }
}

fn strip_compression_suffix(name: &str) -> &str {
    for suffix in [".gz", ".xz", ".lzma"] {
        if let Some(stem) = name.strip_suffix(suffix) {
            if !stem.is_empty() {
                return stem;
            }
        }
    }
    name
}

pub fn is_tar(bytes: &[u8]) -> bool {
    bytes
        .get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len())
        .is_some_and(|magic| magic == TAR_MAGIC)
}

/// Flattens a fetched payload into plain named payloads.
///
/// # Errors
///
/// Any extraction or decompression failure is a [`DownloadError`]: the
/// content cannot be interpreted, so the job must not be silently skipped.
pub fn normalize(payload: Payload) -> Result<Vec<Payload>, DownloadError> {
    let payload = Compression::detect(&payload.name, &payload.bytes).decompress(payload)?;

    if is_tar(&payload.bytes) {
        return unpack(&payload);
    }

    Ok(vec![payload])
}

/// Unpacks every regular file of a tar container into a scoped temporary
/// directory and reads the members back, decompressing single streams.
/// Where `unpack_in` places a member: only the normal components of its
/// path are kept, so a leading `/` or `.` stays under `root`.
fn extracted_path(root: &Path, member: &Path) -> PathBuf {
    member
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .fold(root.to_path_buf(), |path, part| path.join(part))
}

fn unpack(container: &Payload) -> Result<Vec<Payload>, DownloadError> {
    let archive_err = |message: String| DownloadError::Archive {
        name: container.name.clone(),
        message,
    };

    // Removed when it goes out of scope, on every exit path.
    let unpack_dir = tempfile::Builder::new()
        .prefix("harvest-unpack-")
        .tempdir()?;

    let mut archive = tar::Archive::new(Cursor::new(container.bytes.as_slice()));
    let mut members = Vec::new();

    for entry in archive.entries().map_err(|e| archive_err(e.to_string()))? {
        let mut entry = entry.map_err(|e| archive_err(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .map_err(|e| archive_err(e.to_string()))?
            .into_owned();

        let unpacked = entry
            .unpack_in(unpack_dir.path())
            .map_err(|e| archive_err(e.to_string()))?;
        if !unpacked {
            warn!(
                archive = %container.name,
                member = %relative.display(),
                "Skipping archive member outside the extraction root"
            );
            continue;
        }

        let name = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| relative.display().to_string());
        let bytes = std::fs::read(extracted_path(unpack_dir.path(), &relative))?;

        let member = Payload::new(name, bytes);
        let member = Compression::detect(&member.name, &member.bytes).decompress(member)?;
        debug!(archive = %container.name, member = %member.name, size = member.bytes.len(), "Unpacked member");
        members.push(member);
    }

    Ok(members)
}
