//! Schema-versioned descriptor documents: the persisted unit of the
//! management repository. A [`PackageBaseDescriptor`] is merged from one or
//! more [`PackageDescriptor`]s sharing a `pkgbase`, serialized as canonical
//! JSON (sorted keys, no trailing newline, absent optional fields omitted).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::arch::Architecture;
use crate::error::{Error, Result};
use crate::version::Version;

/// Checksums recorded for a package archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksums {
    pub md5: String,
    pub sha256: String,
}

/// One installed file harvested from the archive's payload listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
}

/// Per-package fields of a descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: Version,
    pub arch: Architecture,
    pub description: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub license: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optdepends: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provides: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backup: Vec<String>,
    pub checksums: Checksums,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgpsig: Option<String>,
    pub filename: String,
    pub csize: u64,
    pub isize: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRecord>,
}

/// Fields common to every member of a pkgbase, plus the members themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageBaseDescriptor {
    pub schema_version: u32,
    pub pkgbase: String,
    pub version: Version,
    pub packager: String,
    pub builddate: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub makedepends: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkdepends: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buildinfo: Option<BuildInfoSummary>,
    pub packages: Vec<PackageDescriptor>,
}

/// The subset of `.BUILDINFO` worth persisting alongside a descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildInfoSummary {
    pub pkgbuild_sha256sum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buildtool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buildtoolver: Option<String>,
}

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

impl PackageBaseDescriptor {
    /// Merge per-package descriptors sharing a pkgbase into one document.
    /// `common` carries the fields that must agree across every member.
    pub fn merge(
        pkgbase: String,
        version: Version,
        packager: String,
        builddate: i64,
        makedepends: Vec<String>,
        checkdepends: Vec<String>,
        buildinfo: Option<BuildInfoSummary>,
        packages: Vec<PackageDescriptor>,
    ) -> Result<Self> {
        if packages.is_empty() {
            return Err(Error::PkgbaseInconsistent {
                pkgbase,
                field: "packages".to_string(),
            });
        }

        let mut seen_names = BTreeMap::new();
        for package in &packages {
            if seen_names.insert(package.name.clone(), ()).is_some() {
                return Err(Error::PkgbaseInconsistent {
                    pkgbase,
                    field: format!("duplicate member name '{}'", package.name),
                });
            }
            if package.version != version {
                return Err(Error::PkgbaseInconsistent {
                    pkgbase,
                    field: "version".to_string(),
                });
            }
        }

        Ok(PackageBaseDescriptor {
            schema_version: CURRENT_SCHEMA_VERSION,
            pkgbase,
            version,
            packager,
            builddate,
            makedepends,
            checkdepends,
            buildinfo,
            packages,
        })
    }

    /// Serialize as canonical JSON: sorted keys, no trailing newline,
    /// absent optional fields omitted. Achieved by round-tripping through
    /// `serde_json::Value`, whose map representation is `BTreeMap`-backed
    /// (and therefore key-sorted) as long as the `preserve_order` feature
    /// is not enabled.
    pub fn to_canonical_json(&self) -> Result<String> {
        let value = serde_json::to_value(self).map_err(|e| Error::SchemaViolation {
            kind: "descriptor".to_string(),
            field: e.to_string(),
        })?;
        serde_json::to_string(&value).map_err(|e| Error::SchemaViolation {
            kind: "descriptor".to_string(),
            field: e.to_string(),
        })
    }

    /// Deserialize a descriptor document. A document with no
    /// `schema_version` field is assumed to be legacy `V1`; a document
    /// tagged with a version newer than [`CURRENT_SCHEMA_VERSION`] is
    /// accepted but the caller should treat it as a downgrade and warn.
    pub fn from_json(input: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(input).map_err(|e| Error::SchemaViolation {
                kind: "descriptor".to_string(),
                field: e.to_string(),
            })?;

        let mut value = value;
        if let serde_json::Value::Object(map) = &mut value {
            map.entry("schema_version")
                .or_insert_with(|| serde_json::Value::from(1));
        }

        serde_json::from_value(value).map_err(|e| Error::SchemaViolation {
            kind: "descriptor".to_string(),
            field: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_package(name: &str, version: &str) -> PackageDescriptor {
        PackageDescriptor {
            name: name.to_string(),
            version: Version::parse(version).unwrap(),
            arch: Architecture::X86_64,
            description: "desc".to_string(),
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
            pgpsig: None,
            filename: format!("{name}-{version}-x86_64.pkg.tar.zst"),
            csize: 100,
            isize: 200,
            files: vec![],
        }
    }

    #[test]
    fn merges_coherent_members() {
        let base = PackageBaseDescriptor::merge(
            "foo".to_string(),
            Version::parse("1.0.0-1").unwrap(),
            "Jane Doe".to_string(),
            1700000000,
            vec![],
            vec![],
            None,
            vec![sample_package("foo", "1.0.0-1"), sample_package("foo-libs", "1.0.0-1")],
        )
        .unwrap();
        assert_eq!(base.packages.len(), 2);
    }

    #[test]
    fn rejects_disagreeing_versions() {
        let err = PackageBaseDescriptor::merge(
            "foo".to_string(),
            Version::parse("1.0.0-1").unwrap(),
            "Jane Doe".to_string(),
            1700000000,
            vec![],
            vec![],
            None,
            vec![sample_package("foo", "1.0.0-1"), sample_package("foo-libs", "1.1.0-1")],
        )
        .unwrap_err();
        assert!(matches!(err, Error::PkgbaseInconsistent { .. }));
    }

    #[test]
    fn rejects_duplicate_member_names() {
        let err = PackageBaseDescriptor::merge(
            "foo".to_string(),
            Version::parse("1.0.0-1").unwrap(),
            "Jane Doe".to_string(),
            1700000000,
            vec![],
            vec![],
            None,
            vec![sample_package("foo", "1.0.0-1"), sample_package("foo", "1.0.0-1")],
        )
        .unwrap_err();
        assert!(matches!(err, Error::PkgbaseInconsistent { .. }));
    }

    #[test]
    fn canonical_json_has_sorted_keys_and_no_trailing_newline() {
        let base = PackageBaseDescriptor::merge(
            "foo".to_string(),
            Version::parse("1.0.0-1").unwrap(),
            "Jane Doe".to_string(),
            1700000000,
            vec![],
            vec![],
            None,
            vec![sample_package("foo", "1.0.0-1")],
        )
        .unwrap();
        let json = base.to_canonical_json().unwrap();
        assert!(!json.ends_with('\n'));
        let builddate_pos = json.find("\"builddate\"").unwrap();
        let pkgbase_pos = json.find("\"pkgbase\"").unwrap();
        assert!(builddate_pos < pkgbase_pos);
    }

    #[test]
    fn untagged_legacy_document_is_assumed_v1() {
        let base = PackageBaseDescriptor::merge(
            "foo".to_string(),
            Version::parse("1.0.0-1").unwrap(),
            "Jane Doe".to_string(),
            1700000000,
            vec![],
            vec![],
            None,
            vec![sample_package("foo", "1.0.0-1")],
        )
        .unwrap();
        let mut value = serde_json::to_value(&base).unwrap();
        value.as_object_mut().unwrap().remove("schema_version");
        let legacy = serde_json::to_string(&value).unwrap();

        let parsed = PackageBaseDescriptor::from_json(&legacy).unwrap();
        assert_eq!(parsed.schema_version, 1);
    }
}
