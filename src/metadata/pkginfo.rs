//! `.PKGINFO` — line-oriented `key = value` metadata embedded at the
//! archive root, schema-dispatched on the presence of a `pkgtype` key.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::parse_keyed_lines;
use crate::arch::Architecture;
use crate::error::{Error, Result};
use crate::version::Version;

const REQUIRED_KEYS: &[&str] = &[
    "pkgname",
    "pkgbase",
    "pkgver",
    "pkgdesc",
    "url",
    "builddate",
    "packager",
    "size",
    "arch",
    "license",
];

const MULTI_VALUED_KEYS: &[&str] = &[
    "group",
    "replaces",
    "conflict",
    "provides",
    "depend",
    "optdepend",
    "makedepend",
    "checkdepend",
    "backup",
    "license",
];

/// `pkgtype` as recognized by `PkgInfoV2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PkgType {
    Pkg,
    Split,
    Debug,
    Src,
}

impl FromStr for PkgType {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        match input {
            "pkg" => Ok(PkgType::Pkg),
            "split" => Ok(PkgType::Split),
            "debug" => Ok(PkgType::Debug),
            "src" => Ok(PkgType::Src),
            other => Err(Error::SchemaViolation {
                kind: "pkginfo".to_string(),
                field: format!("unrecognized pkgtype '{other}'"),
            }),
        }
    }
}

/// Fields shared by every `.PKGINFO` schema version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkgInfoFields {
    pub pkgname: String,
    pub pkgbase: String,
    pub pkgver: Version,
    pub pkgdesc: String,
    pub url: String,
    pub builddate: i64,
    pub packager: String,
    pub size: u64,
    pub arch: Architecture,
    pub license: Vec<String>,
    pub group: Vec<String>,
    pub replaces: Vec<String>,
    pub conflict: Vec<String>,
    pub provides: Vec<String>,
    pub depend: Vec<String>,
    pub optdepend: Vec<String>,
    pub makedepend: Vec<String>,
    pub checkdepend: Vec<String>,
    pub backup: Vec<String>,
    /// Keys this parser doesn't assign semantics to, preserved verbatim so
    /// a newer producer's extra fields survive a round-trip.
    pub unknown: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkgInfoV1 {
    #[serde(flatten)]
    pub fields: PkgInfoFields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkgInfoV2 {
    #[serde(flatten)]
    pub fields: PkgInfoFields,
    pub pkgtype: PkgType,
}

/// Schema-versioned `.PKGINFO`, dispatched on the presence of `pkgtype`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PkgInfo {
    V1(PkgInfoV1),
    V2(PkgInfoV2),
}

impl PkgInfo {
    pub fn fields(&self) -> &PkgInfoFields {
        match self {
            PkgInfo::V1(v1) => &v1.fields,
            PkgInfo::V2(v2) => &v2.fields,
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
            let present = single.contains_key(*required) || multi.contains_key(*required);
            if !present {
                return Err(Error::SchemaViolation {
                    kind: "pkginfo".to_string(),
                    field: format!("missing required key '{required}'"),
                });
            }
        }

        let get = |key: &str| -> Result<String> {
            single.get(key).cloned().ok_or_else(|| Error::SchemaViolation {
                kind: "pkginfo".to_string(),
                field: format!("missing required key '{key}'"),
            })
        };

        let take_multi = |key: &str| multi.get(key).cloned().unwrap_or_default();

        let pkgver = Version::parse(&get("pkgver")?).map_err(|_| Error::SchemaViolation {
            kind: "pkginfo".to_string(),
            field: "pkgver".to_string(),
        })?;
        let arch = get("arch")?.parse::<Architecture>()?;
        let builddate = get("builddate")?
            .parse::<i64>()
            .map_err(|_| Error::SchemaViolation {
                kind: "pkginfo".to_string(),
                field: "builddate".to_string(),
            })?;
        let size = get("size")?
            .parse::<u64>()
            .map_err(|_| Error::SchemaViolation {
                kind: "pkginfo".to_string(),
                field: "size".to_string(),
            })?;

        let known_keys: Vec<&str> = REQUIRED_KEYS
            .iter()
            .chain(MULTI_VALUED_KEYS.iter())
            .chain(["pkgtype"].iter())
            .copied()
            .collect();

        let mut unknown = BTreeMap::new();
        for (key, value) in &single {
            if !known_keys.contains(&key.as_str()) {
                unknown.insert(key.clone(), vec![value.clone()]);
            }
        }
        for (key, values) in &multi {
            if !known_keys.contains(&key.as_str()) {
                unknown.insert(key.clone(), values.clone());
            }
        }

        let fields = PkgInfoFields {
            pkgname: get("pkgname")?,
            pkgbase: get("pkgbase")?,
            pkgver,
            pkgdesc: get("pkgdesc")?,
            url: get("url")?,
            builddate,
            packager: get("packager")?,
            size,
            arch,
            license: take_multi("license"),
            group: take_multi("group"),
            replaces: take_multi("replaces"),
            conflict: take_multi("conflict"),
            provides: take_multi("provides"),
            depend: take_multi("depend"),
            optdepend: take_multi("optdepend"),
            makedepend: take_multi("makedepend"),
            checkdepend: take_multi("checkdepend"),
            backup: take_multi("backup"),
            unknown,
        };

        match single.get("pkgtype") {
            Some(pkgtype) => Ok(PkgInfo::V2(PkgInfoV2 {
                fields,
                pkgtype: pkgtype.parse()?,
            })),
            None => Ok(PkgInfo::V1(PkgInfoV1 { fields })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_pkginfo() -> String {
        [
            "pkgname = foo",
            "pkgbase = foo",
            "pkgver = 1.0.0-1",
            "pkgdesc = A test package",
            "url = https://example.invalid",
            "builddate = 1700000000",
            "packager = Jane Doe <jane@example.invalid>",
            "size = 1024",
            "arch = x86_64",
            "license = MIT",
        ]
        .join("\n")
    }

    #[test]
    fn parses_minimal_v1_pkginfo() {
        let info = PkgInfo::parse(&minimal_pkginfo()).unwrap();
        assert!(matches!(info, PkgInfo::V1(_)));
        assert_eq!(info.fields().pkgname, "foo");
        assert_eq!(info.fields().size, 1024);
    }

    #[test]
    fn dispatches_to_v2_on_pkgtype() {
        let input = format!("{}\npkgtype = split\n", minimal_pkginfo());
        let info = PkgInfo::parse(&input).unwrap();
        match info {
            PkgInfo::V2(v2) => assert_eq!(v2.pkgtype, PkgType::Split),
            PkgInfo::V1(_) => panic!("expected V2"),
        }
    }

    #[test]
    fn repeated_keys_accumulate_in_order() {
        let input = format!(
            "{}\ndepend = glibc\ndepend = zlib\n",
            minimal_pkginfo()
        );
        let info = PkgInfo::parse(&input).unwrap();
        assert_eq!(info.fields().depend, vec!["glibc", "zlib"]);
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let input = minimal_pkginfo().replace("pkgname = foo\n", "");
        assert!(PkgInfo::parse(&input).is_err());
    }

    #[test]
    fn unknown_keys_are_preserved() {
        let input = format!("{}\nxdata = future-field\n", minimal_pkginfo());
        let info = PkgInfo::parse(&input).unwrap();
        assert_eq!(
            info.fields().unknown.get("xdata"),
            Some(&vec!["future-field".to_string()])
        );
    }

    #[test]
    fn invalid_pkgtype_is_rejected() {
        let input = format!("{}\npkgtype = bogus\n", minimal_pkginfo());
        assert!(PkgInfo::parse(&input).is_err());
    }
}
