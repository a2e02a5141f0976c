//! Read and write the tar-compressed sync-database: the `desc`/`files`
//! text records a package manager consumes at install time.
//!
//! The writer wraps a `tar::Builder` in a compression encoder, one entry per
//! package, across every supported codec and the `DescV1`/`DescV2` schema
//! switch. The reader is the inverse: parse the same `%KEY%` block grammar
//! back into records, independent of where the bytes came from.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::arch::Architecture;
use crate::archive::Compression;
use crate::descriptor::{Checksums, FileRecord, PackageBaseDescriptor, PackageDescriptor};
use crate::error::{Error, Result};
use crate::version::Version;

/// Which optional fields a `desc` block carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescSchemaVersion {
    /// Includes `%PGPSIG%` when a signature is known.
    V1,
    /// Omits `%PGPSIG%` entirely.
    V2,
}

/// One package's flattened view across its descriptor and its pkgbase.
#[derive(Debug, Clone, PartialEq)]
pub struct DescRecord {
    pub name: String,
    pub base: String,
    pub version: Version,
    pub desc: String,
    pub groups: Vec<String>,
    pub csize: u64,
    pub isize: u64,
    pub md5sum: String,
    pub sha256sum: String,
    pub pgpsig: Option<String>,
    pub url: String,
    pub license: Vec<String>,
    pub arch: Architecture,
    pub builddate: i64,
    pub packager: String,
    pub depends: Vec<String>,
    pub optdepends: Vec<String>,
    pub provides: Vec<String>,
    pub conflicts: Vec<String>,
    pub replaces: Vec<String>,
    pub backup: Vec<String>,
    pub makedepends: Vec<String>,
    pub checkdepends: Vec<String>,
    pub filename: String,
    pub files: Vec<String>,
}

impl DescRecord {
    /// Flatten a pkgbase descriptor into one record per member package.
    pub fn flatten(base: &PackageBaseDescriptor) -> Vec<DescRecord> {
        base.packages
            .iter()
            .map(|pkg| DescRecord {
                name: pkg.name.clone(),
                base: base.pkgbase.clone(),
                version: pkg.version.clone(),
                desc: pkg.description.clone(),
                groups: pkg.groups.clone(),
                csize: pkg.csize,
                isize: pkg.isize,
                md5sum: pkg.checksums.md5.clone(),
                sha256sum: pkg.checksums.sha256.clone(),
                pgpsig: pkg.pgpsig.clone(),
                url: pkg.url.clone(),
                license: pkg.license.clone(),
                arch: pkg.arch,
                builddate: base.builddate,
                packager: base.packager.clone(),
                depends: pkg.depends.clone(),
                optdepends: pkg.optdepends.clone(),
                provides: pkg.provides.clone(),
                conflicts: pkg.conflicts.clone(),
                replaces: pkg.replaces.clone(),
                backup: pkg.backup.clone(),
                makedepends: base.makedepends.clone(),
                checkdepends: base.checkdepends.clone(),
                filename: pkg.filename.clone(),
                files: pkg.files.iter().map(|f| f.path.clone()).collect(),
            })
            .collect()
    }

    fn dir_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

fn push_block(out: &mut String, key: &str, values: &[&str]) {
    if values.is_empty() {
        return;
    }
    out.push('%');
    out.push_str(key);
    out.push_str("%\n");
    for v in values {
        out.push_str(v);
        out.push('\n');
    }
    out.push('\n');
}

/// Render one package's `desc` text block.
pub fn render_desc(record: &DescRecord, schema: DescSchemaVersion) -> String {
    let mut out = String::new();

    push_block(&mut out, "FILENAME", &[&record.filename]);
    push_block(&mut out, "NAME", &[&record.name]);
    push_block(&mut out, "BASE", &[&record.base]);
    push_block(&mut out, "VERSION", &[&record.version.to_string()]);
    push_block(&mut out, "DESC", &[&record.desc]);
    let groups: Vec<&str> = record.groups.iter().map(String::as_str).collect();
    push_block(&mut out, "GROUPS", &groups);
    push_block(&mut out, "CSIZE", &[&record.csize.to_string()]);
    push_block(&mut out, "ISIZE", &[&record.isize.to_string()]);
    push_block(&mut out, "MD5SUM", &[&record.md5sum]);
    push_block(&mut out, "SHA256SUM", &[&record.sha256sum]);
    if schema == DescSchemaVersion::V1 {
        if let Some(pgpsig) = &record.pgpsig {
            push_block(&mut out, "PGPSIG", &[pgpsig]);
        }
    }
    push_block(&mut out, "URL", &[&record.url]);
    let license: Vec<&str> = record.license.iter().map(String::as_str).collect();
    push_block(&mut out, "LICENSE", &license);
    push_block(&mut out, "ARCH", &[record.arch.as_str()]);
    push_block(&mut out, "BUILDDATE", &[&record.builddate.to_string()]);
    push_block(&mut out, "PACKAGER", &[&record.packager]);
    let depends: Vec<&str> = record.depends.iter().map(String::as_str).collect();
    push_block(&mut out, "DEPENDS", &depends);
    let optdepends: Vec<&str> = record.optdepends.iter().map(String::as_str).collect();
    push_block(&mut out, "OPTDEPENDS", &optdepends);
    let provides: Vec<&str> = record.provides.iter().map(String::as_str).collect();
    push_block(&mut out, "PROVIDES", &provides);
    let conflicts: Vec<&str> = record.conflicts.iter().map(String::as_str).collect();
    push_block(&mut out, "CONFLICTS", &conflicts);
    let replaces: Vec<&str> = record.replaces.iter().map(String::as_str).collect();
    push_block(&mut out, "REPLACES", &replaces);
    let backup: Vec<&str> = record.backup.iter().map(String::as_str).collect();
    push_block(&mut out, "BACKUP", &backup);
    let makedepends: Vec<&str> = record.makedepends.iter().map(String::as_str).collect();
    push_block(&mut out, "MAKEDEPENDS", &makedepends);
    let checkdepends: Vec<&str> = record.checkdepends.iter().map(String::as_str).collect();
    push_block(&mut out, "CHECKDEPENDS", &checkdepends);

    out
}

/// Render one package's `files` text block (the `%FILES%` list only).
pub fn render_files(record: &DescRecord) -> String {
    let mut out = String::new();
    let files: Vec<&str> = record.files.iter().map(String::as_str).collect();
    push_block(&mut out, "FILES", &files);
    out
}

fn wrap_encoder(
    compression: Compression,
    writer: Vec<u8>,
) -> Result<Box<dyn WriteFinish>> {
    match compression {
        Compression::None => Ok(Box::new(PlainWriter(writer))),
        Compression::Gzip => Ok(Box::new(flate2::write::GzEncoder::new(
            writer,
            flate2::Compression::default(),
        ))),
        Compression::Bzip2 => Ok(Box::new(bzip2::write::BzEncoder::new(
            writer,
            bzip2::Compression::default(),
        ))),
        Compression::Xz => Ok(Box::new(xz2::write::XzEncoder::new(writer, 6))),
        Compression::Zstd => Ok(Box::new(
            zstd::stream::write::Encoder::new(writer, 0)
                .map_err(|e| Error::ArchiveFormat {
                    path: "<sync-db>".to_string(),
                    msg: e.to_string(),
                })?
                .auto_finish_wrapper(),
        )),
    }
}

/// Adapter trait so every codec's encoder can be boxed behind one type and
/// finalized uniformly (zstd's encoder needs an explicit `.finish()` that
/// returns the inner writer, unlike the others which implement `Write`
/// directly over their lifetime).
trait WriteFinish: Write {
    fn finish_into(self: Box<Self>) -> std::io::Result<Vec<u8>>;
}

struct PlainWriter(Vec<u8>);

impl Write for PlainWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl WriteFinish for PlainWriter {
    fn finish_into(self: Box<Self>) -> std::io::Result<Vec<u8>> {
        Ok(self.0)
    }
}

impl WriteFinish for flate2::write::GzEncoder<Vec<u8>> {
    fn finish_into(self: Box<Self>) -> std::io::Result<Vec<u8>> {
        (*self).finish()
    }
}

impl WriteFinish for bzip2::write::BzEncoder<Vec<u8>> {
    fn finish_into(self: Box<Self>) -> std::io::Result<Vec<u8>> {
        (*self).finish()
    }
}

impl WriteFinish for xz2::write::XzEncoder<Vec<u8>> {
    fn finish_into(self: Box<Self>) -> std::io::Result<Vec<u8>> {
        (*self).finish()
    }
}

struct ZstdAutoFinish(Option<zstd::stream::write::Encoder<'static, Vec<u8>>>);

impl Write for ZstdAutoFinish {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.as_mut().unwrap().write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.as_mut().unwrap().flush()
    }
}

impl WriteFinish for ZstdAutoFinish {
    fn finish_into(mut self: Box<Self>) -> std::io::Result<Vec<u8>> {
        self.0.take().unwrap().finish()
    }
}

trait ZstdEncoderExt {
    fn auto_finish_wrapper(self) -> ZstdAutoFinish;
}

impl ZstdEncoderExt for zstd::stream::write::Encoder<'static, Vec<u8>> {
    fn auto_finish_wrapper(self) -> ZstdAutoFinish {
        ZstdAutoFinish(Some(self))
    }
}

/// Write a `desc`-only sync-database tar.
pub fn write_desc_tar(
    records: &[DescRecord],
    schema: DescSchemaVersion,
    compression: Compression,
) -> Result<Vec<u8>> {
    write_tar(records, schema, compression, false)
}

/// Write a `desc` + `files` sync-database tar.
pub fn write_files_tar(
    records: &[DescRecord],
    schema: DescSchemaVersion,
    compression: Compression,
) -> Result<Vec<u8>> {
    write_tar(records, schema, compression, true)
}

fn write_tar(
    records: &[DescRecord],
    schema: DescSchemaVersion,
    compression: Compression,
    include_files: bool,
) -> Result<Vec<u8>> {
    let mut sorted: Vec<&DescRecord> = records.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let encoder = wrap_encoder(compression, Vec::new())?;
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);

    for record in sorted {
        append_dir_entry(&mut builder, &format!("{}/", record.dir_name()))?;
        append_text_entry(&mut builder, &format!("{}/desc", record.dir_name()), &render_desc(record, schema))?;
        if include_files {
            append_text_entry(&mut builder, &format!("{}/files", record.dir_name()), &render_files(record))?;
        }
    }

    let encoder = builder.into_inner().map_err(|e| Error::ArchiveFormat {
        path: "<sync-db>".to_string(),
        msg: e.to_string(),
    })?;
    encoder.finish_into().map_err(|e| Error::ArchiveFormat {
        path: "<sync-db>".to_string(),
        msg: e.to_string(),
    })
}

/// Append the package directory entry itself, `path` already carrying the
/// trailing `/` that marks it as a directory header rather than a file.
fn append_dir_entry(builder: &mut tar::Builder<Box<dyn WriteFinish>>, path: &str) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_path(path).map_err(|e| Error::ArchiveFormat {
        path: path.to_string(),
        msg: e.to_string(),
    })?;
    header.set_size(0);
    header.set_mode(0o755);
    header.set_mtime(0);
    header.set_cksum();
    builder
        .append(&header, std::io::empty())
        .map_err(|e| Error::ArchiveFormat {
            path: path.to_string(),
            msg: e.to_string(),
        })
}

fn append_text_entry(
    builder: &mut tar::Builder<Box<dyn WriteFinish>>,
    path: &str,
    content: &str,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(path).map_err(|e| Error::ArchiveFormat {
        path: path.to_string(),
        msg: e.to_string(),
    })?;
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder
        .append(&header, content.as_bytes())
        .map_err(|e| Error::ArchiveFormat {
            path: path.to_string(),
            msg: e.to_string(),
        })
}

fn parse_blocks(content: &str) -> Result<Vec<(String, Vec<String>)>> {
    let mut blocks = Vec::new();
    let mut lines = content.lines().peekable();

    while let Some(line) = lines.next() {
        if line.is_empty() {
            continue;
        }
        if !(line.starts_with('%') && line.ends_with('%') && line.len() > 1) {
            return Err(Error::SyncDbMalformed {
                msg: format!("expected '%KEY%' line, got {line:?}"),
            });
        }
        let key = line[1..line.len() - 1].to_string();

        let mut values = Vec::new();
        while let Some(next) = lines.peek() {
            if next.is_empty() {
                lines.next();
                break;
            }
            values.push((*next).to_string());
            lines.next();
        }
        blocks.push((key, values));
    }

    Ok(blocks)
}

fn first(values: &BTreeMap<String, Vec<String>>, key: &str) -> Result<String> {
    values
        .get(key)
        .and_then(|v| v.first())
        .cloned()
        .ok_or_else(|| Error::SyncDbMalformed {
            msg: format!("missing required key '%{key}%'"),
        })
}

fn multi(values: &BTreeMap<String, Vec<String>>, key: &str) -> Vec<String> {
    values.get(key).cloned().unwrap_or_default()
}

/// Parse one package's `desc` text block (without a trailing `files`
/// block — callers join those in separately via [`read_files_tar`]).
pub fn parse_desc(content: &str) -> Result<DescRecord> {
    let blocks = parse_blocks(content)?;
    let mut values: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, vs) in blocks {
        values.entry(key).or_default().extend(vs);
    }

    let version = Version::parse(&first(&values, "VERSION")?).map_err(|_| Error::SyncDbMalformed {
        msg: "malformed %VERSION%".to_string(),
    })?;
    let arch = first(&values, "ARCH")?
        .parse::<Architecture>()
        .map_err(|_| Error::SyncDbMalformed {
            msg: "malformed %ARCH%".to_string(),
        })?;
    let csize = first(&values, "CSIZE")?
        .parse()
        .map_err(|_| Error::SyncDbMalformed {
            msg: "malformed %CSIZE%".to_string(),
        })?;
    let isize = first(&values, "ISIZE")?
        .parse()
        .map_err(|_| Error::SyncDbMalformed {
            msg: "malformed %ISIZE%".to_string(),
        })?;
    let builddate = first(&values, "BUILDDATE")?
        .parse()
        .map_err(|_| Error::SyncDbMalformed {
            msg: "malformed %BUILDDATE%".to_string(),
        })?;

    Ok(DescRecord {
        name: first(&values, "NAME")?,
        base: first(&values, "BASE")?,
        version,
        desc: values
            .get("DESC")
            .and_then(|v| v.first())
            .cloned()
            .unwrap_or_default(),
        groups: multi(&values, "GROUPS"),
        csize,
        isize,
        md5sum: first(&values, "MD5SUM")?,
        sha256sum: first(&values, "SHA256SUM")?,
        pgpsig: values.get("PGPSIG").and_then(|v| v.first()).cloned(),
        url: values.get("URL").and_then(|v| v.first()).cloned().unwrap_or_default(),
        license: multi(&values, "LICENSE"),
        arch,
        builddate,
        packager: first(&values, "PACKAGER")?,
        depends: multi(&values, "DEPENDS"),
        optdepends: multi(&values, "OPTDEPENDS"),
        provides: multi(&values, "PROVIDES"),
        conflicts: multi(&values, "CONFLICTS"),
        replaces: multi(&values, "REPLACES"),
        backup: multi(&values, "BACKUP"),
        makedepends: multi(&values, "MAKEDEPENDS"),
        checkdepends: multi(&values, "CHECKDEPENDS"),
        filename: first(&values, "FILENAME")?,
        files: Vec::new(),
    })
}

fn open_reader(data: &[u8]) -> Result<Box<dyn Read + '_>> {
    match Compression::detect(data) {
        Compression::None => Ok(Box::new(data)),
        Compression::Gzip => Ok(Box::new(flate2::read::GzDecoder::new(data))),
        Compression::Bzip2 => Ok(Box::new(bzip2::read::BzDecoder::new(data))),
        Compression::Xz => Ok(Box::new(xz2::read::XzDecoder::new(data))),
        Compression::Zstd => Ok(Box::new(
            zstd::stream::read::Decoder::new(data).map_err(|e| Error::ArchiveFormat {
                path: "<sync-db>".to_string(),
                msg: e.to_string(),
            })?,
        )),
    }
}

/// Read every `desc` (and, if present, `files`) member from a sync-database
/// tar, returning one fully joined record per package. A malformed block
/// fails the whole read.
pub fn read_tar(data: &[u8]) -> Result<Vec<DescRecord>> {
    let reader = open_reader(data)?;
    let mut archive = tar::Archive::new(reader);

    let mut descs: BTreeMap<String, DescRecord> = BTreeMap::new();
    let mut files: BTreeMap<String, Vec<String>> = BTreeMap::new();

    let entries = archive.entries().map_err(|e| Error::SyncDbMalformed {
        msg: e.to_string(),
    })?;

    for entry in entries {
        let mut entry = entry.map_err(|e| Error::SyncDbMalformed { msg: e.to_string() })?;
        let path = entry
            .path()
            .map_err(|e| Error::SyncDbMalformed { msg: e.to_string() })?
            .to_string_lossy()
            .into_owned();

        let mut content = String::new();
        entry
            .read_to_string(&mut content)
            .map_err(|e| Error::SyncDbMalformed { msg: e.to_string() })?;

        if let Some(dir) = path.strip_suffix("/desc") {
            let record = parse_desc(&content)?;
            descs.insert(dir.to_string(), record);
        } else if let Some(dir) = path.strip_suffix("/files") {
            let blocks = parse_blocks(&content)?;
            let file_list = blocks
                .into_iter()
                .find(|(k, _)| k == "FILES")
                .map(|(_, v)| v)
                .unwrap_or_default();
            files.insert(dir.to_string(), file_list);
        }
    }

    for (dir, file_list) in files {
        if let Some(record) = descs.get_mut(&dir) {
            record.files = file_list;
        }
    }

    Ok(descs.into_values().collect())
}

/// Reconstruct [`PackageDescriptor`]s from sync-database records, grouped
/// by pkgbase. Used when rebuilding the management repository from an
/// existing sync-database (schema migration, disaster recovery).
pub fn records_to_descriptors(records: &[DescRecord]) -> Vec<PackageDescriptor> {
    records
        .iter()
        .map(|r| PackageDescriptor {
            name: r.name.clone(),
            version: r.version.clone(),
            arch: r.arch,
            description: r.desc.clone(),
            url: r.url.clone(),
            license: r.license.clone(),
            groups: r.groups.clone(),
            depends: r.depends.clone(),
            optdepends: r.optdepends.clone(),
            provides: r.provides.clone(),
            conflicts: r.conflicts.clone(),
            replaces: r.replaces.clone(),
            backup: r.backup.clone(),
            checksums: Checksums {
                md5: r.md5sum.clone(),
                sha256: r.sha256sum.clone(),
            },
            pgpsig: r.pgpsig.clone(),
            filename: r.filename.clone(),
            csize: r.csize,
            isize: r.isize,
            files: r.files.iter().map(|f| FileRecord { path: f.clone() }).collect(),
        })
        .collect()
}
