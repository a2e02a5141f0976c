//! Stream-decompress a package archive and yield its embedded metadata
//! members plus a listing of the payload.
//!
//! The compression codec is detected from magic bytes rather than assumed,
//! and the metadata harvest covers `.BUILDINFO`/`.MTREE` alongside
//! `.PKGINFO`.

use std::io::Read;
use std::path::Path;

use tar::Archive;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Compression codecs a sync-database or package archive may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

impl Compression {
    /// Sniff the codec from the leading magic bytes. Falls back to `None`
    /// for anything unrecognized — callers that require tar framing will
    /// then fail naturally when the bytes don't parse as one.
    pub fn detect(bytes: &[u8]) -> Compression {
        if bytes.starts_with(&[0x1f, 0x8b]) {
            Compression::Gzip
        } else if bytes.starts_with(b"BZh") {
            Compression::Bzip2
        } else if bytes.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Compression::Xz
        } else if bytes.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

/// The kind of filesystem entry a payload member represents, as recorded
/// by the tar header (not the `.MTREE` record — that is a separate, more
/// detailed source of truth parsed in `metadata::mtree`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// One payload entry harvested for `PackageDescriptor::files`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub kind: EntryKind,
}

/// The three metadata members extracted from a package archive, plus a
/// listing of everything else it contains.
#[derive(Debug, Clone, Default)]
pub struct ExtractedArchive {
    pub pkginfo: Vec<u8>,
    pub buildinfo: Option<Vec<u8>>,
    pub mtree: Option<Vec<u8>>,
    pub files: Vec<FileEntry>,
}

fn open_reader(path: &Path, data: &[u8]) -> Result<Box<dyn Read + '_>> {
    match Compression::detect(data) {
        Compression::None => Ok(Box::new(data)),
        Compression::Gzip => Ok(Box::new(flate2::read::GzDecoder::new(data))),
        Compression::Bzip2 => Ok(Box::new(bzip2::read::BzDecoder::new(data))),
        Compression::Xz => Ok(Box::new(xz2::read::XzDecoder::new(data))),
        Compression::Zstd => {
            Ok(Box::new(zstd::stream::read::Decoder::new(data).map_err(
                |e| Error::ArchiveFormat {
                    path: path.display().to_string(),
                    msg: e.to_string(),
                },
            )?))
        }
    }
}

/// Decompress and walk `data` as a tar stream, harvesting `.PKGINFO`,
/// `.BUILDINFO`, `.MTREE` by exact root-level name and listing everything
/// else. `path` is used only for error context.
pub fn inspect_bytes(path: &Path, data: &[u8]) -> Result<ExtractedArchive> {
    let reader = open_reader(path, data)?;
    let mut archive = Archive::new(reader);

    let mut out = ExtractedArchive::default();
    let mut pkginfo = None;

    let entries = archive.entries().map_err(|e| Error::ArchiveFormat {
        path: path.display().to_string(),
        msg: e.to_string(),
    })?;

    for entry in entries {
        let mut entry = entry.map_err(|e| Error::ArchiveFormat {
            path: path.display().to_string(),
            msg: e.to_string(),
        })?;

        let header = entry.header();
        let kind = if header.entry_type().is_dir() {
            EntryKind::Directory
        } else if header.entry_type().is_symlink() {
            EntryKind::Symlink
        } else {
            EntryKind::File
        };

        let entry_path = entry
            .path()
            .map_err(|e| Error::ArchiveFormat {
                path: path.display().to_string(),
                msg: e.to_string(),
            })?
            .to_string_lossy()
            .into_owned();

        match entry_path.as_str() {
            ".PKGINFO" => {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf).map_err(|e| Error::ArchiveFormat {
                    path: path.display().to_string(),
                    msg: e.to_string(),
                })?;
                pkginfo = Some(buf);
                continue;
            }
            ".BUILDINFO" => {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf).map_err(|e| Error::ArchiveFormat {
                    path: path.display().to_string(),
                    msg: e.to_string(),
                })?;
                out.buildinfo = Some(buf);
                continue;
            }
            ".MTREE" => {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf).map_err(|e| Error::ArchiveFormat {
                    path: path.display().to_string(),
                    msg: e.to_string(),
                })?;
                out.mtree = Some(buf);
                continue;
            }
            _ => {}
        }

        out.files.push(FileEntry {
            path: entry_path,
            kind,
        });
    }

    out.pkginfo = pkginfo.ok_or_else(|| Error::MissingMetadata {
        path: path.display().to_string(),
    })?;

    if out.buildinfo.is_none() {
        debug!(path = %path.display(), "archive carries no .BUILDINFO, schema tier downgraded");
    }
    if out.mtree.is_none() {
        warn!(path = %path.display(), "archive carries no .MTREE, file integrity data unavailable");
    }

    Ok(out)
}

/// Read `path` from disk and inspect it. Offloaded to a blocking thread by
/// callers that run inside an async runtime, since decompression and tar
/// walking are CPU-bound.
pub fn inspect_file(path: &Path) -> Result<ExtractedArchive> {
    let data = std::fs::read(path).map_err(|e| Error::Io {
        error: e,
        path: path.display().to_string(),
    })?;
    inspect_bytes(path, &data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn build_zstd_package(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut tar_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_bytes);
            for (name, content) in entries {
                let mut header = tar::Header::new_gnu();
                header.set_path(name).unwrap();
                header.set_size(content.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append(&header, *content).unwrap();
            }
            builder.finish().unwrap();
        }

        let mut encoder = zstd::stream::write::Encoder::new(Vec::new(), 0).unwrap();
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn detects_each_known_codec() {
        assert_eq!(Compression::detect(&[0x1f, 0x8b, 0x08]), Compression::Gzip);
        assert_eq!(Compression::detect(b"BZh91AY"), Compression::Bzip2);
        assert_eq!(
            Compression::detect(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]),
            Compression::Xz
        );
        assert_eq!(
            Compression::detect(&[0x28, 0xb5, 0x2f, 0xfd, 0x00]),
            Compression::Zstd
        );
        assert_eq!(Compression::detect(b"plain tar bytes"), Compression::None);
    }

    #[test]
    fn extracts_pkginfo_from_zstd_archive() {
        let data = build_zstd_package(&[(".PKGINFO", b"pkgname = foo\n")]);
        let extracted = inspect_bytes(Path::new("foo.pkg.tar.zst"), &data).unwrap();
        assert_eq!(extracted.pkginfo, b"pkgname = foo\n");
        assert!(extracted.buildinfo.is_none());
    }

    #[test]
    fn missing_pkginfo_is_an_error() {
        let data = build_zstd_package(&[("usr/bin/foo", b"")]);
        let err = inspect_bytes(Path::new("foo.pkg.tar.zst"), &data).unwrap_err();
        assert!(matches!(err, Error::MissingMetadata { .. }));
    }

    #[test]
    fn harvests_payload_listing_without_contents() {
        let data = build_zstd_package(&[
            (".PKGINFO", b"pkgname = foo\n"),
            ("usr/bin/foo", b"binary contents"),
        ]);
        let extracted = inspect_bytes(Path::new("foo.pkg.tar.zst"), &data).unwrap();
        assert_eq!(extracted.files.len(), 1);
        assert_eq!(extracted.files[0].path, "usr/bin/foo");
        assert_eq!(extracted.files[0].kind, EntryKind::File);
    }
}
