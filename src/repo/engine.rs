//! Add/Remove/Move orchestration: the state machine described at the top of
//! this module's parent (`Absent -> Staged -> Validated -> Applied ->
//! Published`), implemented as a sequence of validate-then-apply passes with
//! an explicit undo stack standing in for the per-operation undo closures
//! `pool`/`Layout` don't themselves return.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::arch::Architecture;
use crate::archive::{self, Compression};
use crate::config::{Config, RepositoryConfig};
use crate::descriptor::{BuildInfoSummary, Checksums, FileRecord, PackageBaseDescriptor, PackageDescriptor};
use crate::error::{Error, Result, ResultIoExt};
use crate::metadata::{BuildInfo, PkgInfo};
use crate::pool::{Layout, Pool};
use crate::signature::Verifier;
use crate::syncdb::{self, DescRecord, DescSchemaVersion};
use crate::version::{Constraint, Version};

use super::Layer;
use super::lock::{LockTimeout, RepoLock, acquire_pair};

const ALL_LAYERS: [Layer; 6] = [
    Layer::Stable,
    Layer::Testing,
    Layer::Staging,
    Layer::Debug,
    Layer::TestingDebug,
    Layer::StagingDebug,
];

/// Resolves every path `RepositoryConfig` doesn't already resolve on its
/// own: `resolved_layer_paths` deliberately omits the architecture segment
/// (it exists only to check cross-repository uniqueness), so this adds it
/// back in for the full on-disk layout.
pub struct RepositoryContext<'a> {
    config: &'a Config,
}

impl<'a> RepositoryContext<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    fn repo_config(&self, repo: &str) -> Result<&RepositoryConfig> {
        self.config
            .repositories
            .iter()
            .find(|r| r.name == repo)
            .ok_or_else(|| Error::Config {
                msg: format!("unknown repository '{repo}'"),
            })
    }

    /// `management/<repo>/<arch>/<layer>/`
    pub fn management_dir(&self, repo: &str, arch: Architecture, layer: Layer) -> Result<PathBuf> {
        self.repo_config(repo)?;
        Ok(self
            .config
            .management_repo
            .directory
            .join(repo)
            .join(arch.to_string())
            .join(layer.config_key()))
    }

    pub fn descriptor_path(
        &self,
        repo: &str,
        arch: Architecture,
        layer: Layer,
        pkgbase: &str,
    ) -> Result<PathBuf> {
        Ok(self.management_dir(repo, arch, layer)?.join(format!("{pkgbase}.json")))
    }

    pub fn pool(&self, repo: &str) -> Result<Pool> {
        Ok(Pool::new(self.repo_config(repo)?.package_pool.clone()))
    }

    fn layer_dir_path(&self, repo: &str, arch: Architecture, layer: Layer) -> Result<PathBuf> {
        let cfg = self.repo_config(repo)?;
        let dir_name = cfg
            .layers()
            .into_iter()
            .find(|(key, _)| *key == layer.config_key())
            .map(|(_, dir_name)| dir_name)
            .expect("every Layer has a matching RepositoryConfig::layers entry");
        Ok(cfg.archiving.join(arch.to_string()).join(dir_name))
    }

    pub fn layout(&self, repo: &str, arch: Architecture, layer: Layer) -> Result<Layout> {
        Ok(Layout::new(self.layer_dir_path(repo, arch, layer)?))
    }

    fn sync_db_basename(&self, repo: &str, layer: Layer) -> Result<String> {
        let cfg = self.repo_config(repo)?;
        Ok(cfg
            .layers()
            .into_iter()
            .find(|(key, _)| *key == layer.config_key())
            .map(|(_, dir_name)| dir_name.to_string())
            .expect("every Layer has a matching RepositoryConfig::layers entry"))
    }

    fn compression(&self) -> Compression {
        self.config.database_compression.into()
    }

    fn desc_schema(&self) -> DescSchemaVersion {
        match self.config.syncdb_settings.desc_version {
            1 => DescSchemaVersion::V1,
            _ => DescSchemaVersion::V2,
        }
    }
}

/// One Add batch: every archive is parsed, grouped by pkgbase, validated and
/// applied together. Either every pkgbase in the batch is published, or none
/// is.
#[derive(Debug, Clone)]
pub struct AddRequest {
    pub repo: String,
    pub arch: Architecture,
    pub layer: Layer,
    pub archive_paths: Vec<PathBuf>,
    /// Bypass version-monotonicity/stability-order rejection. Never bypasses
    /// pkgbase coherence or name-conflict checks.
    pub force: bool,
    /// A directory of loose archives consulted when a build requirement
    /// isn't satisfied by the batch or the repository itself.
    pub build_requirement_archive_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AddOutcome {
    pub pkgbases: Vec<String>,
    pub descriptor_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RemoveRequest {
    pub repo: String,
    pub arch: Architecture,
    pub layer: Layer,
    pub pkgbases: Vec<String>,
    pub collect_garbage: bool,
}

#[derive(Debug, Clone)]
pub struct MoveRequest {
    pub repo: String,
    pub arch: Architecture,
    pub source: Layer,
    pub target: Layer,
    pub pkgbases: Vec<String>,
    pub force: bool,
}

/// An archive's metadata, parsed but not yet grouped by pkgbase.
struct ParsedPackage {
    archive_path: PathBuf,
    pkgbase: String,
    version: Version,
    packager: String,
    builddate: i64,
    makedepends: Vec<String>,
    checkdepends: Vec<String>,
    buildinfo: Option<BuildInfoSummary>,
    descriptor: PackageDescriptor,
}

/// A pkgbase's merged descriptor, with each member's originating archive
/// path kept at the same index as `base.packages`.
struct ResolvedBase {
    base: PackageBaseDescriptor,
    archive_paths: Vec<PathBuf>,
}

/// A reversible filesystem mutation, recorded as the engine applies a batch
/// and replayed in reverse if any later step fails.
enum Undo {
    Remove(PathBuf),
    Restore(PathBuf, Vec<u8>),
    RecreateSymlink { layer_dir: PathBuf, pool_path: PathBuf },
}

async fn rollback(actions: Vec<Undo>) {
    for action in actions.into_iter().rev() {
        match action {
            Undo::Remove(path) => {
                if let Err(e) = fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path.display(), error = %e, "rollback failed to remove file");
                    }
                }
            }
            Undo::Restore(path, bytes) => {
                if let Err(e) = fs::write(&path, &bytes).await {
                    warn!(path = %path.display(), error = %e, "rollback failed to restore file");
                }
            }
            Undo::RecreateSymlink { layer_dir, pool_path } => {
                if let Err(e) = Layout::new(layer_dir).link(&pool_path).await {
                    warn!(error = %e, "rollback failed to recreate symlink");
                }
            }
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// `provides = (foo bar=1.0-1)` entries, split into name and optional carried
/// version.
fn parse_provides(values: &[String]) -> Vec<(String, Option<Version>)> {
    values
        .iter()
        .map(|raw| match raw.split_once('=') {
            Some((name, version)) => (name.to_string(), Version::parse(version).ok()),
            None => (raw.clone(), None),
        })
        .collect()
}

async fn read_signature_hex(archive_path: &Path) -> Result<Option<String>> {
    let sig_path = Verifier::signature_path(archive_path);
    match fs::read(&sig_path).await {
        Ok(bytes) => Ok(Some(hex_encode(&bytes))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).map_io_err(&sig_path),
    }
}

async fn parse_archive(archive_path: &Path) -> Result<ParsedPackage> {
    let path = archive_path.to_path_buf();
    let extracted = {
        let path = path.clone();
        tokio::task::spawn_blocking(move || archive::inspect_file(&path))
            .await
            .map_err(|e| Error::Io {
                error: std::io::Error::other(e.to_string()),
                path: path.display().to_string(),
            })??
    };

    let pkginfo_text = std::str::from_utf8(&extracted.pkginfo).map_err(|_| Error::SchemaViolation {
        kind: "pkginfo".to_string(),
        field: "not valid utf-8".to_string(),
    })?;
    let pkginfo = PkgInfo::parse(pkginfo_text)?;
    let fields = pkginfo.fields();

    let buildinfo = match &extracted.buildinfo {
        Some(bytes) => {
            let text = std::str::from_utf8(bytes).map_err(|_| Error::SchemaViolation {
                kind: "buildinfo".to_string(),
                field: "not valid utf-8".to_string(),
            })?;
            let info = BuildInfo::parse(text)?;
            let (buildtool, buildtoolver) = match &info {
                BuildInfo::V1(_) => (None, None),
                BuildInfo::V2(v2) => (Some(v2.buildtool.clone()), Some(v2.buildtoolver.clone())),
            };
            Some(BuildInfoSummary {
                pkgbuild_sha256sum: info.fields().pkgbuild_sha256sum.clone(),
                buildtool,
                buildtoolver,
            })
        }
        None => None,
    };

    // .MTREE carries no fields this core persists onto the descriptor, but
    // it is still part of the "validated in-memory representation" the
    // inspector owes every archive: parse it so a corrupt or malformed tree
    // fails the batch here rather than silently shipping a broken package.
    if let Some(mtree_bytes) = &extracted.mtree {
        let entries = crate::metadata::mtree::parse(mtree_bytes)?;
        debug!(path = %path.display(), entries = entries.len(), "parsed .MTREE metadata");
    }

    let archive_bytes = fs::read(&path).await.map_io_err(&path)?;
    let mut sha256 = Sha256::new();
    sha256.update(&archive_bytes);
    let md5_digest = md5::compute(&archive_bytes);

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Io {
            error: std::io::Error::new(std::io::ErrorKind::InvalidInput, "archive path has no file name"),
            path: path.display().to_string(),
        })?
        .to_string();

    let pgpsig = read_signature_hex(&path).await?;

    let descriptor = PackageDescriptor {
        name: fields.pkgname.clone(),
        version: fields.pkgver.clone(),
        arch: fields.arch,
        description: fields.pkgdesc.clone(),
        url: fields.url.clone(),
        license: fields.license.clone(),
        groups: fields.group.clone(),
        depends: fields.depend.clone(),
        optdepends: fields.optdepend.clone(),
        provides: fields.provides.clone(),
        conflicts: fields.conflict.clone(),
        replaces: fields.replaces.clone(),
        backup: fields.backup.clone(),
        checksums: Checksums {
            md5: format!("{md5_digest:x}"),
            sha256: hex_encode(&sha256.finalize()),
        },
        pgpsig,
        filename,
        csize: archive_bytes.len() as u64,
        isize: fields.size,
        files: extracted.files.iter().map(|f| FileRecord { path: f.path.clone() }).collect(),
    };

    Ok(ParsedPackage {
        archive_path: path,
        pkgbase: fields.pkgbase.clone(),
        version: fields.pkgver.clone(),
        packager: fields.packager.clone(),
        builddate: fields.builddate,
        makedepends: fields.makedepend.clone(),
        checkdepends: fields.checkdepend.clone(),
        buildinfo,
        descriptor,
    })
}

/// `packager`/`builddate`/`makedepends`/`checkdepends`/`buildinfo` are
/// base-level fields duplicated onto every member's `.PKGINFO`; the first
/// member's copies are taken as authoritative. Version agreement across
/// members is enforced by `PackageBaseDescriptor::merge`.
fn build_base_descriptor(pkgbase: String, members: Vec<ParsedPackage>) -> Result<ResolvedBase> {
    let first = members.first().ok_or_else(|| Error::PkgbaseInconsistent {
        pkgbase: pkgbase.clone(),
        field: "packages".to_string(),
    })?;
    let version = first.version.clone();
    let packager = first.packager.clone();
    let builddate = first.builddate;
    let makedepends = first.makedepends.clone();
    let checkdepends = first.checkdepends.clone();
    let buildinfo = first.buildinfo.clone();

    let archive_paths = members.iter().map(|m| m.archive_path.clone()).collect();
    let packages = members.into_iter().map(|m| m.descriptor).collect();

    let base = PackageBaseDescriptor::merge(
        pkgbase,
        version,
        packager,
        builddate,
        makedepends,
        checkdepends,
        buildinfo,
        packages,
    )?;

    Ok(ResolvedBase { base, archive_paths })
}

async fn load_existing_base(
    ctx: &RepositoryContext<'_>,
    repo: &str,
    arch: Architecture,
    layer: Layer,
    pkgbase: &str,
) -> Result<Option<PackageBaseDescriptor>> {
    let path = ctx.descriptor_path(repo, arch, layer, pkgbase)?;
    match fs::read_to_string(&path).await {
        Ok(content) => Ok(Some(PackageBaseDescriptor::from_json(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).map_io_err(&path),
    }
}

async fn find_owning_pkgbase(
    ctx: &RepositoryContext<'_>,
    repo: &str,
    arch: Architecture,
    layer: Layer,
    name: &str,
) -> Result<Option<String>> {
    let dir = ctx.management_dir(repo, arch, layer)?;
    if !fs::try_exists(&dir).await.map_io_err(&dir)? {
        return Ok(None);
    }
    let mut entries = fs::read_dir(&dir).await.map_io_err(&dir)?;
    while let Some(entry) = entries.next_entry().await.map_io_err(&dir)? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let content = fs::read_to_string(&path).await.map_io_err(&path)?;
        let base = PackageBaseDescriptor::from_json(&content)?;
        if base.packages.iter().any(|p| p.name == name) {
            return Ok(Some(base.pkgbase));
        }
    }
    Ok(None)
}

/// Version monotonicity against the target layer (strict) and against every
/// sibling layer at least as stable (non-strict, enforcing
/// `stable >= testing >= staging`), plus cross-pkgbase name-uniqueness in
/// the target layer. `staging` is exempt against `testing` specifically,
/// the one stability-order exception this model carves out.
async fn check_add_preconditions(
    ctx: &RepositoryContext<'_>,
    request: &AddRequest,
    resolved: &ResolvedBase,
) -> Result<()> {
    let layer = request.layer;
    let (_, layer_rank) = layer.series_and_rank();

    for sibling in layer.series_members() {
        if layer == Layer::Staging && sibling == Layer::Testing {
            continue;
        }
        let (_, sibling_rank) = sibling.series_and_rank();
        if sibling_rank < layer_rank {
            continue;
        }

        let Some(existing) =
            load_existing_base(ctx, &request.repo, request.arch, sibling, &resolved.base.pkgbase).await?
        else {
            continue;
        };

        let strict = sibling == layer;
        for candidate in &resolved.base.packages {
            let Some(existing_pkg) = existing.packages.iter().find(|p| p.name == candidate.name) else {
                continue;
            };
            let ordering = Version::vercmp(&candidate.version, &existing_pkg.version);
            let ok = if strict { ordering > 0 } else { ordering >= 0 };
            if !ok && !request.force {
                return Err(Error::VersionRegression {
                    name: candidate.name.clone(),
                    layer: sibling.to_string(),
                    old: existing_pkg.version.to_string(),
                    new: candidate.version.to_string(),
                });
            }
        }
    }

    for candidate in &resolved.base.packages {
        if let Some(owner) =
            find_owning_pkgbase(ctx, &request.repo, request.arch, layer, &candidate.name).await?
        {
            if owner != resolved.base.pkgbase {
                return Err(Error::NameConflict {
                    name: candidate.name.clone(),
                    layer: layer.to_string(),
                });
            }
        }
    }

    Ok(())
}

fn satisfied_by_batch(constraint: &Constraint, index: &[(String, Version, Vec<(String, Option<Version>)>)]) -> bool {
    index
        .iter()
        .any(|(name, version, provides)| constraint.is_satisfied_by(name, version, provides))
}

async fn satisfied_in_repo(
    ctx: &RepositoryContext<'_>,
    repo: &str,
    arch: Architecture,
    constraint: &Constraint,
) -> Result<bool> {
    for layer in ALL_LAYERS {
        let dir = ctx.management_dir(repo, arch, layer)?;
        if !fs::try_exists(&dir).await.map_io_err(&dir)? {
            continue;
        }
        let mut entries = fs::read_dir(&dir).await.map_io_err(&dir)?;
        while let Some(entry) = entries.next_entry().await.map_io_err(&dir)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).await.map_io_err(&path)?;
            let base = PackageBaseDescriptor::from_json(&content)?;
            for pkg in &base.packages {
                let provides = parse_provides(&pkg.provides);
                if constraint.is_satisfied_by(&pkg.name, &pkg.version, &provides) {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

/// An absent archive directory fails closed: simply reports no match rather
/// than erroring, so the caller's overall `MissingBuildRequirement` still
/// fires.
async fn satisfied_in_archive_dir(dir: &Path, constraint: &Constraint) -> Result<bool> {
    if !fs::try_exists(dir).await.map_io_err(dir)? {
        return Ok(false);
    }
    let mut entries = fs::read_dir(dir).await.map_io_err(dir)?;
    while let Some(entry) = entries.next_entry().await.map_io_err(dir)? {
        let path = entry.path();
        let looks_like_package = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.contains(".pkg.tar"));
        if !looks_like_package {
            continue;
        }

        let blocking_path = path.clone();
        let extracted = tokio::task::spawn_blocking(move || archive::inspect_file(&blocking_path))
            .await
            .map_err(|e| Error::Io {
                error: std::io::Error::other(e.to_string()),
                path: path.display().to_string(),
            })??;
        let pkginfo_text = std::str::from_utf8(&extracted.pkginfo).map_err(|_| Error::SchemaViolation {
            kind: "pkginfo".to_string(),
            field: "not valid utf-8".to_string(),
        })?;
        let info = PkgInfo::parse(pkginfo_text)?;
        let fields = info.fields();
        let provides = parse_provides(&fields.provides);
        if constraint.is_satisfied_by(&fields.pkgname, &fields.pkgver, &provides) {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn check_build_requirements(
    ctx: &RepositoryContext<'_>,
    request: &AddRequest,
    bases: &[ResolvedBase],
) -> Result<()> {
    let mut batch_index = Vec::new();
    for resolved in bases {
        for pkg in &resolved.base.packages {
            batch_index.push((pkg.name.clone(), pkg.version.clone(), parse_provides(&pkg.provides)));
        }
    }

    for resolved in bases {
        let mut constraints: Vec<String> = Vec::new();
        constraints.extend(resolved.base.makedepends.iter().cloned());
        constraints.extend(resolved.base.checkdepends.iter().cloned());
        for pkg in &resolved.base.packages {
            constraints.extend(pkg.depends.iter().cloned());
        }

        for raw in constraints {
            let constraint = Constraint::parse(&raw)?;
            if satisfied_by_batch(&constraint, &batch_index) {
                continue;
            }
            if satisfied_in_repo(ctx, &request.repo, request.arch, &constraint).await? {
                continue;
            }
            if let Some(dir) = &request.build_requirement_archive_dir {
                if satisfied_in_archive_dir(dir, &constraint).await? {
                    continue;
                }
            }
            return Err(Error::MissingBuildRequirement {
                pkgbase: resolved.base.pkgbase.clone(),
                constraint: constraint.to_string(),
            });
        }
    }

    Ok(())
}

fn staged_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp-{}", std::process::id()))
}

async fn write_descriptor(path: &Path, base: &PackageBaseDescriptor) -> Result<()> {
    let json = base.to_canonical_json()?;
    let tmp_path = staged_path(path);
    fs::write(&tmp_path, json.as_bytes()).await.map_io_err(&tmp_path)?;
    fs::rename(&tmp_path, path).await.map_io_err(path)?;
    Ok(())
}

async fn apply_add(
    ctx: &RepositoryContext<'_>,
    request: &AddRequest,
    bases: &[ResolvedBase],
    undo: &mut Vec<Undo>,
) -> Result<Vec<PathBuf>> {
    let pool = ctx.pool(&request.repo)?;
    let layout = ctx.layout(&request.repo, request.arch, request.layer)?;
    let management_dir = ctx.management_dir(&request.repo, request.arch, request.layer)?;
    fs::create_dir_all(&management_dir).await.map_io_err(&management_dir)?;

    let mut descriptor_paths = Vec::new();

    for resolved in bases {
        for (pkg, archive_path) in resolved.base.packages.iter().zip(&resolved.archive_paths) {
            let pool_target = pool.dir().join(&pkg.filename);
            let pool_existed = fs::try_exists(&pool_target).await.map_io_err(&pool_target)?;
            let pool_path = pool.place(archive_path).await?;
            if !pool_existed {
                undo.push(Undo::Remove(pool_path.clone()));
            }

            let sig_path = Verifier::signature_path(archive_path);
            if fs::try_exists(&sig_path).await.map_io_err(&sig_path)? {
                let sig_target = pool.dir().join(format!("{}.sig", pkg.filename));
                let sig_existed = fs::try_exists(&sig_target).await.map_io_err(&sig_target)?;
                let placed_sig = pool.place(&sig_path).await?;
                if !sig_existed {
                    undo.push(Undo::Remove(placed_sig.clone()));
                }

                let sig_link_target = layout.dir().join(format!("{}.sig", pkg.filename));
                let sig_link_existed = fs::symlink_metadata(&sig_link_target).await.is_ok();
                let sig_link_path = layout.link(&placed_sig).await?;
                if !sig_link_existed {
                    undo.push(Undo::Remove(sig_link_path));
                }
            }

            let link_target = layout.dir().join(&pkg.filename);
            let link_existed = fs::symlink_metadata(&link_target).await.is_ok();
            let link_path = layout.link(&pool_path).await?;
            if !link_existed {
                undo.push(Undo::Remove(link_path));
            }
        }

        let descriptor_path =
            ctx.descriptor_path(&request.repo, request.arch, request.layer, &resolved.base.pkgbase)?;
        let previous = fs::read(&descriptor_path).await.ok();
        write_descriptor(&descriptor_path, &resolved.base).await?;
        match previous {
            Some(bytes) => undo.push(Undo::Restore(descriptor_path.clone(), bytes)),
            None => undo.push(Undo::Remove(descriptor_path.clone())),
        }
        descriptor_paths.push(descriptor_path);
    }

    Ok(descriptor_paths)
}

fn compression_extension(compression: Compression) -> &'static str {
    match compression {
        Compression::None => "tar",
        Compression::Gzip => "tar.gz",
        Compression::Bzip2 => "tar.bz2",
        Compression::Xz => "tar.xz",
        Compression::Zstd => "tar.zst",
    }
}

async fn write_sync_db_member(dir: &Path, symlink_name: &str, target_name: &str, bytes: &[u8]) -> Result<()> {
    let target_path = dir.join(target_name);
    let tmp_path = staged_path(&target_path);
    fs::write(&tmp_path, bytes).await.map_io_err(&tmp_path)?;
    fs::rename(&tmp_path, &target_path).await.map_io_err(&target_path)?;

    let symlink_path = dir.join(symlink_name);
    match fs::symlink_metadata(&symlink_path).await {
        Ok(_) => {
            fs::remove_file(&symlink_path).await.map_io_err(&symlink_path)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).map_io_err(&symlink_path),
    }

    #[cfg(unix)]
    fs::symlink(target_name, &symlink_path).await.map_io_err(&symlink_path)?;

    Ok(())
}

/// Regenerate `<layer>.db`/`<layer>.files` (and their compressed targets)
/// from every descriptor currently persisted for this layer. Safe to call
/// any time a layer's descriptor set may have changed.
async fn regenerate_sync_db(
    ctx: &RepositoryContext<'_>,
    repo: &str,
    arch: Architecture,
    layer: Layer,
) -> Result<()> {
    let management_dir = ctx.management_dir(repo, arch, layer)?;
    fs::create_dir_all(&management_dir).await.map_io_err(&management_dir)?;

    let mut records = Vec::new();
    let mut entries = fs::read_dir(&management_dir).await.map_io_err(&management_dir)?;
    while let Some(entry) = entries.next_entry().await.map_io_err(&management_dir)? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let content = fs::read_to_string(&path).await.map_io_err(&path)?;
        let base = PackageBaseDescriptor::from_json(&content)?;
        records.extend(DescRecord::flatten(&base));
    }

    let compression = ctx.compression();
    let schema = ctx.desc_schema();
    let desc_bytes = syncdb::write_desc_tar(&records, schema, compression)?;
    let files_bytes = syncdb::write_files_tar(&records, schema, compression)?;

    let layer_dir = ctx.layer_dir_path(repo, arch, layer)?;
    fs::create_dir_all(&layer_dir).await.map_io_err(&layer_dir)?;
    let basename = ctx.sync_db_basename(repo, layer)?;
    let ext = compression_extension(compression);

    write_sync_db_member(
        &layer_dir,
        &format!("{basename}.db"),
        &format!("{basename}.db.{ext}"),
        &desc_bytes,
    )
    .await?;
    write_sync_db_member(
        &layer_dir,
        &format!("{basename}.files"),
        &format!("{basename}.files.{ext}"),
        &files_bytes,
    )
    .await?;

    Ok(())
}

/// Add one batch of archives to a repository layer. All-or-nothing: if any
/// step from parsing through sync-db regeneration fails, every filesystem
/// change made so far by this call is undone before the error propagates.
pub async fn add(config: &Config, request: AddRequest, verifier: &Verifier) -> Result<AddOutcome> {
    let ctx = RepositoryContext::new(config);
    ctx.repo_config(&request.repo)?;

    let _lock = RepoLock::acquire(
        &config.management_repo.directory,
        &request.repo,
        request.arch,
        LockTimeout::default(),
    )
    .await?;

    let mut groups: BTreeMap<String, Vec<ParsedPackage>> = BTreeMap::new();
    for archive_path in &request.archive_paths {
        let parsed = parse_archive(archive_path).await?;
        groups.entry(parsed.pkgbase.clone()).or_default().push(parsed);
    }

    let mut bases = Vec::new();
    for (pkgbase, members) in groups {
        bases.push(build_base_descriptor(pkgbase, members)?);
    }

    for resolved in &bases {
        check_add_preconditions(&ctx, &request, resolved).await?;
    }

    if config.build_requirements_exist {
        check_build_requirements(&ctx, &request, &bases).await?;
    }

    for resolved in &bases {
        for archive_path in &resolved.archive_paths {
            verifier.verify(archive_path).await?;
        }
    }

    let mut undo = Vec::new();
    let descriptor_paths = match apply_add(&ctx, &request, &bases, &mut undo).await {
        Ok(paths) => paths,
        Err(e) => {
            rollback(undo).await;
            return Err(e);
        }
    };

    if let Err(e) = regenerate_sync_db(&ctx, &request.repo, request.arch, request.layer).await {
        rollback(undo).await;
        return Err(e);
    }

    info!(
        repo = %request.repo,
        arch = %request.arch,
        layer = %request.layer,
        pkgbases = bases.len(),
        "add published"
    );

    Ok(AddOutcome {
        pkgbases: bases.into_iter().map(|b| b.base.pkgbase).collect(),
        descriptor_paths,
    })
}

/// Drop descriptors and their layer symlinks. Already-absent pkgbases are a
/// no-op rather than an error.
pub async fn remove(config: &Config, request: RemoveRequest) -> Result<()> {
    let ctx = RepositoryContext::new(config);
    ctx.repo_config(&request.repo)?;

    let _lock = RepoLock::acquire(
        &config.management_repo.directory,
        &request.repo,
        request.arch,
        LockTimeout::default(),
    )
    .await?;

    let layout = ctx.layout(&request.repo, request.arch, request.layer)?;

    for pkgbase in &request.pkgbases {
        let descriptor_path = ctx.descriptor_path(&request.repo, request.arch, request.layer, pkgbase)?;
        let content = match fs::read_to_string(&descriptor_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).map_io_err(&descriptor_path),
        };
        let base = PackageBaseDescriptor::from_json(&content)?;

        for pkg in &base.packages {
            layout.unlink(&pkg.filename).await?;
            if pkg.pgpsig.is_some() {
                layout.unlink(&format!("{}.sig", pkg.filename)).await?;
            }
        }
        fs::remove_file(&descriptor_path).await.map_io_err(&descriptor_path)?;
    }

    regenerate_sync_db(&ctx, &request.repo, request.arch, request.layer).await?;

    if request.collect_garbage {
        collect_garbage(config, &request.repo, request.arch).await?;
    }

    info!(repo = %request.repo, arch = %request.arch, layer = %request.layer, "remove published");
    Ok(())
}

async fn apply_move(ctx: &RepositoryContext<'_>, request: &MoveRequest, undo: &mut Vec<Undo>) -> Result<()> {
    let source_layout = ctx.layout(&request.repo, request.arch, request.source)?;
    let target_layout = ctx.layout(&request.repo, request.arch, request.target)?;
    let pool = ctx.pool(&request.repo)?;

    for pkgbase in &request.pkgbases {
        let source_path = ctx.descriptor_path(&request.repo, request.arch, request.source, pkgbase)?;
        let target_path = ctx.descriptor_path(&request.repo, request.arch, request.target, pkgbase)?;

        let content = fs::read_to_string(&source_path).await.map_io_err(&source_path)?;
        let base = PackageBaseDescriptor::from_json(&content)?;

        for pkg in &base.packages {
            if let Some(owner) =
                find_owning_pkgbase(ctx, &request.repo, request.arch, request.target, &pkg.name).await?
            {
                if owner != base.pkgbase {
                    return Err(Error::NameConflict {
                        name: pkg.name.clone(),
                        layer: request.target.to_string(),
                    });
                }
            }
        }

        if let Some(existing_target) =
            load_existing_base(ctx, &request.repo, request.arch, request.target, pkgbase).await?
        {
            for candidate in &base.packages {
                if let Some(existing_pkg) = existing_target.packages.iter().find(|p| p.name == candidate.name) {
                    let ordering = Version::vercmp(&candidate.version, &existing_pkg.version);
                    if ordering <= 0 && !request.force {
                        return Err(Error::VersionRegression {
                            name: candidate.name.clone(),
                            layer: request.target.to_string(),
                            old: existing_pkg.version.to_string(),
                            new: candidate.version.to_string(),
                        });
                    }
                }
            }
        }

        let management_target_dir = ctx.management_dir(&request.repo, request.arch, request.target)?;
        fs::create_dir_all(&management_target_dir)
            .await
            .map_io_err(&management_target_dir)?;

        for pkg in &base.packages {
            let pool_path = pool.dir().join(&pkg.filename);
            let link_target = target_layout.dir().join(&pkg.filename);
            let link_existed = fs::symlink_metadata(&link_target).await.is_ok();
            let link_path = target_layout.link(&pool_path).await?;
            if !link_existed {
                undo.push(Undo::Remove(link_path));
            }

            if pkg.pgpsig.is_some() {
                let sig_pool_path = pool.dir().join(format!("{}.sig", pkg.filename));
                if fs::try_exists(&sig_pool_path).await.map_io_err(&sig_pool_path)? {
                    let sig_link_target = target_layout.dir().join(format!("{}.sig", pkg.filename));
                    let sig_link_existed = fs::symlink_metadata(&sig_link_target).await.is_ok();
                    let sig_link_path = target_layout.link(&sig_pool_path).await?;
                    if !sig_link_existed {
                        undo.push(Undo::Remove(sig_link_path));
                    }
                }
            }
        }

        let previous_target = fs::read(&target_path).await.ok();
        write_descriptor(&target_path, &base).await?;
        match previous_target {
            Some(bytes) => undo.push(Undo::Restore(target_path.clone(), bytes)),
            None => undo.push(Undo::Remove(target_path.clone())),
        }

        for pkg in &base.packages {
            let pool_path = pool.dir().join(&pkg.filename);
            source_layout.unlink(&pkg.filename).await?;
            undo.push(Undo::RecreateSymlink {
                layer_dir: source_layout.dir().to_path_buf(),
                pool_path,
            });

            if pkg.pgpsig.is_some() {
                let sig_pool_path = pool.dir().join(format!("{}.sig", pkg.filename));
                if fs::try_exists(&sig_pool_path).await.map_io_err(&sig_pool_path)? {
                    source_layout.unlink(&format!("{}.sig", pkg.filename)).await?;
                    undo.push(Undo::RecreateSymlink {
                        layer_dir: source_layout.dir().to_path_buf(),
                        pool_path: sig_pool_path,
                    });
                }
            }
        }
        fs::remove_file(&source_path).await.map_io_err(&source_path)?;
        undo.push(Undo::Restore(source_path.clone(), content.into_bytes()));
    }

    Ok(())
}

/// Move pkgbases from one layer to another of the same repository/arch,
/// under both layers' locks (collapsed to one when they coincide).
pub async fn move_pkg(config: &Config, request: MoveRequest) -> Result<()> {
    let ctx = RepositoryContext::new(config);
    ctx.repo_config(&request.repo)?;

    let (_first, _second) = acquire_pair(
        &config.management_repo.directory,
        (&request.repo, request.arch),
        (&request.repo, request.arch),
        LockTimeout::default(),
    )
    .await?;

    let mut undo = Vec::new();
    if let Err(e) = apply_move(&ctx, &request, &mut undo).await {
        rollback(undo).await;
        return Err(e);
    }

    if let Err(e) = regenerate_sync_db(&ctx, &request.repo, request.arch, request.source).await {
        rollback(undo).await;
        return Err(e);
    }
    if let Err(e) = regenerate_sync_db(&ctx, &request.repo, request.arch, request.target).await {
        rollback(undo).await;
        return Err(e);
    }

    info!(
        repo = %request.repo,
        arch = %request.arch,
        source = %request.source,
        target = %request.target,
        "move published"
    );
    Ok(())
}

/// Repair a single layer after a crash between Applied and Published:
/// re-create any symlink a persisted descriptor expects but the filesystem
/// lost, and remove any symlink no descriptor references any longer.
async fn reconcile_layer(ctx: &RepositoryContext<'_>, repo: &str, arch: Architecture, layer: Layer) -> Result<()> {
    let management_dir = ctx.management_dir(repo, arch, layer)?;
    let layout = ctx.layout(repo, arch, layer)?;
    let pool = ctx.pool(repo)?;

    let mut referenced = HashSet::new();

    if fs::try_exists(&management_dir).await.map_io_err(&management_dir)? {
        let mut entries = fs::read_dir(&management_dir).await.map_io_err(&management_dir)?;
        while let Some(entry) = entries.next_entry().await.map_io_err(&management_dir)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).await.map_io_err(&path)?;
            let base = PackageBaseDescriptor::from_json(&content)?;
            for pkg in &base.packages {
                referenced.insert(pkg.filename.clone());
                let pool_path = pool.dir().join(&pkg.filename);
                if fs::try_exists(&pool_path).await.map_io_err(&pool_path)? {
                    layout.link(&pool_path).await?;
                } else {
                    warn!(
                        pool_path = %pool_path.display(),
                        repo, %arch, %layer,
                        "descriptor references a pool entry that is missing on disk"
                    );
                }

                if pkg.pgpsig.is_some() {
                    let sig_basename = format!("{}.sig", pkg.filename);
                    referenced.insert(sig_basename.clone());
                    let sig_pool_path = pool.dir().join(&sig_basename);
                    if fs::try_exists(&sig_pool_path).await.map_io_err(&sig_pool_path)? {
                        layout.link(&sig_pool_path).await?;
                    } else {
                        warn!(
                            pool_path = %sig_pool_path.display(),
                            repo, %arch, %layer,
                            "descriptor references a signature pool entry that is missing on disk"
                        );
                    }
                }
            }
        }
    }

    for basename in layout.linked_basenames().await? {
        if !referenced.contains(&basename) {
            layout.unlink(&basename).await?;
            warn!(basename, repo, %arch, %layer, "removed orphan symlink during reconciliation");
        }
    }

    Ok(())
}

/// Reconcile every layer of a repository/arch against its descriptors.
/// Intended to run once at process startup before any Add/Remove/Move.
pub async fn reconcile(config: &Config, repo: &str, arch: Architecture) -> Result<()> {
    let ctx = RepositoryContext::new(config);
    ctx.repo_config(repo)?;

    for layer in ALL_LAYERS {
        reconcile_layer(&ctx, repo, arch, layer).await?;
    }
    Ok(())
}

/// Remove pool entries no layer of this repository/arch links to.
pub async fn collect_garbage(config: &Config, repo: &str, arch: Architecture) -> Result<Vec<String>> {
    let ctx = RepositoryContext::new(config);
    ctx.repo_config(repo)?;

    let mut referenced = HashSet::new();
    for layer in ALL_LAYERS {
        let layout = ctx.layout(repo, arch, layer)?;
        referenced.extend(layout.linked_basenames().await?);
    }

    let pool = ctx.pool(repo)?;
    let removed = pool.collect(&referenced).await?;
    if !removed.is_empty() {
        info!(repo, %arch, removed = removed.len(), "pool garbage collection removed unreferenced entries");
    }
    Ok(removed)
}
