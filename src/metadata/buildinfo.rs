//! `.BUILDINFO` — same lexical shape as `.PKGINFO`, schema-dispatched on
//! the `format` key instead of a file-name convention.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::parse_keyed_lines;
use crate::arch::Architecture;
use crate::error::{Error, Result};
use crate::version::Version;

const REQUIRED_KEYS: &[&str] = &[
    "format",
    "pkgname",
    "pkgbase",
    "pkgver",
    "pkgarch",
    "pkgbuild_sha256sum",
    "packager",
    "builddate",
    "builddir",
];

const MULTI_VALUED_KEYS: &[&str] = &["buildenv", "options", "installed"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInfoFields {
    pub pkgname: String,
    pub pkgbase: String,
    pub pkgver: Version,
    pub pkgarch: Architecture,
    pub pkgbuild_sha256sum: String,
    pub packager: String,
    pub builddate: i64,
    pub builddir: String,
    pub buildenv: Vec<String>,
    pub options: Vec<String>,
    pub installed: Vec<String>,
    pub unknown: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInfoV1 {
    #[serde(flatten)]
    pub fields: BuildInfoFields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInfoV2 {
    #[serde(flatten)]
    pub fields: BuildInfoFields,
    pub buildtool: String,
    pub buildtoolver: String,
}

/// Schema-versioned `.BUILDINFO`, dispatched on the `format` key's value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildInfo {
    V1(BuildInfoV1),
    V2(BuildInfoV2),
}

impl BuildInfo {
    pub fn fields(&self) -> &BuildInfoFields {
        match self {
            BuildInfo::V1(v1) => &v1.fields,
            BuildInfo::V2(v2) => &v2.fields,
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let pairs = parse_keyed_lines(input)?;

        let mut single: BTreeMap<String, String> = BTreeMap::new();
        let mut multi: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (key, value) in &pairs {
            if MULTI_VALUED_KEYS.contains(&key.as_str()) {
                multi.entry(key.clone()).or_default().push(value.clone());
            } else {
                single.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        for required in REQUIRED_KEYS {
            if !single.contains_key(*required) {
                return Err(Error::SchemaViolation {
                    kind: "buildinfo".to_string(),
                    field: format!("missing required key '{required}'"),
                });
            }
        }
        for required in MULTI_VALUED_KEYS {
            if !multi.contains_key(*required) {
                return Err(Error::SchemaViolation {
                    kind: "buildinfo".to_string(),
                    field: format!("missing required key '{required}'"),
                });
            }
        }

        let get = |key: &str| -> Result<String> {
            single.get(key).cloned().ok_or_else(|| Error::SchemaViolation {
                kind: "buildinfo".to_string(),
                field: format!("missing required key '{key}'"),
            })
        };
        let take_multi = |key: &str| multi.get(key).cloned().unwrap_or_default();

        let format = get("format")?;
        if format != "1" && format != "2" {
            return Err(Error::SchemaUnknown {
                kind: "buildinfo".to_string(),
                marker: format,
            });
        }

        let pkgver = Version::parse(&get("pkgver")?).map_err(|_| Error::SchemaViolation {
            kind: "buildinfo".to_string(),
            field: "pkgver".to_string(),
        })?;
        let pkgarch = get("pkgarch")?.parse::<Architecture>()?;
        let builddate = get("builddate")?
            .parse::<i64>()
            .map_err(|_| Error::SchemaViolation {
                kind: "buildinfo".to_string(),
                field: "builddate".to_string(),
            })?;

        let known_keys: Vec<&str> = REQUIRED_KEYS
            .iter()
            .chain(MULTI_VALUED_KEYS.iter())
            .chain(["buildtool", "buildtoolver"].iter())
            .copied()
            .collect();

        let mut unknown = BTreeMap::new();
        for (key, value) in &single {
            if key != "format" && !known_keys.contains(&key.as_str()) {
                unknown.insert(key.clone(), vec![value.clone()]);
            }
        }
        for (key, values) in &multi {
            if !known_keys.contains(&key.as_str()) {
                unknown.insert(key.clone(), values.clone());
            }
        }

        let fields = BuildInfoFields {
            pkgname: get("pkgname")?,
            pkgbase: get("pkgbase")?,
            pkgver,
            pkgarch,
            pkgbuild_sha256sum: get("pkgbuild_sha256sum")?,
            packager: get("packager")?,
            builddate,
            builddir: get("builddir")?,
            buildenv: take_multi("buildenv"),
            options: take_multi("options"),
            installed: take_multi("installed"),
            unknown,
        };

        if format == "1" {
            return Ok(BuildInfo::V1(BuildInfoV1 { fields }));
        }

        let buildtool = get("buildtool")?;
        let buildtoolver = get("buildtoolver")?;

        if buildtool == "devtools" {
            validate_devtools_buildtoolver(&buildtoolver)?;
        }

        Ok(BuildInfo::V2(BuildInfoV2 {
            fields,
            buildtool,
            buildtoolver,
        }))
    }
}

/// `buildtoolver` must look like `[epoch:]pkgver-pkgrel-arch` when
/// `buildtool == "devtools"`.
fn validate_devtools_buildtoolver(value: &str) -> Result<()> {
    let (version_part, arch_part) = value.rsplit_once('-').ok_or_else(|| Error::SchemaViolation {
        kind: "buildinfo".to_string(),
        field: "buildtoolver".to_string(),
    })?;

    arch_part
        .parse::<Architecture>()
        .map_err(|_| Error::SchemaViolation {
            kind: "buildinfo".to_string(),
            field: "buildtoolver".to_string(),
        })?;

    Version::parse(version_part).map_err(|_| Error::SchemaViolation {
        kind: "buildinfo".to_string(),
        field: "buildtoolver".to_string(),
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_v1() -> String {
        [
            "format = 1",
            "pkgname = foo",
            "pkgbase = foo",
            "pkgver = 1.0.0-1",
            "pkgarch = x86_64",
            "pkgbuild_sha256sum = abcd1234",
            "packager = Jane Doe <jane@example.invalid>",
            "builddate = 1700000000",
            "builddir = /build",
            "buildenv = !ccache",
            "options = strip",
            "installed = bash-5.1-1-x86_64",
        ]
        .join("\n")
    }

    #[test]
    fn rejects_missing_multi_valued_required_key() {
        let input = minimal_v1()
            .lines()
            .filter(|l| !l.starts_with("installed"))
            .collect::<Vec<_>>()
            .join("\n");
        assert!(matches!(
            BuildInfo::parse(&input),
            Err(Error::SchemaViolation { .. })
        ));
    }

    #[test]
    fn parses_minimal_v1() {
        let info = BuildInfo::parse(&minimal_v1()).unwrap();
        assert!(matches!(info, BuildInfo::V1(_)));
    }

    #[test]
    fn v2_requires_buildtool_and_buildtoolver() {
        let input = minimal_v1().replace("format = 1", "format = 2");
        assert!(BuildInfo::parse(&input).is_err());
    }

    #[test]
    fn devtools_buildtoolver_must_match_version_arch_pattern() {
        let input = format!(
            "{}\nbuildtool = devtools\nbuildtoolver = 1.0.0-1-x86_64\n",
            minimal_v1().replace("format = 1", "format = 2")
        );
        assert!(BuildInfo::parse(&input).is_ok());

        let bad = format!(
            "{}\nbuildtool = devtools\nbuildtoolver = not-a-version\n",
            minimal_v1().replace("format = 1", "format = 2")
        );
        assert!(BuildInfo::parse(&bad).is_err());
    }

    #[test]
    fn non_devtools_buildtool_skips_buildtoolver_validation() {
        let input = format!(
            "{}\nbuildtool = custom\nbuildtoolver = whatever\n",
            minimal_v1().replace("format = 1", "format = 2")
        );
        assert!(BuildInfo::parse(&input).is_ok());
    }

    #[test]
    fn rejects_unknown_format() {
        let input = minimal_v1().replace("format = 1", "format = 9");
        assert!(matches!(
            BuildInfo::parse(&input),
            Err(Error::SchemaUnknown { .. })
        ));
    }
}
