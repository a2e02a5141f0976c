//! Configuration loading: layered `config::File` sources (debug: cwd,
//! release: `/etc`) topped off by `config::Environment`, deserialized into a
//! typed struct.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::arch::Architecture;
use crate::archive::Compression;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionSetting {
    None,
    Gz,
    Bz2,
    Xz,
    Zst,
}

impl From<CompressionSetting> for Compression {
    fn from(value: CompressionSetting) -> Self {
        match value {
            CompressionSetting::None => Compression::None,
            CompressionSetting::Gz => Compression::Gzip,
            CompressionSetting::Bz2 => Compression::Bzip2,
            CompressionSetting::Xz => Compression::Xz,
            CompressionSetting::Zst => Compression::Zstd,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationStrategy {
    None,
    PacmanKey,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SyncDbSettings {
    pub desc_version: u8,
    pub files_version: u8,
}

impl SyncDbSettings {
    fn validate(&self) -> Result<()> {
        if self.desc_version != 1 && self.desc_version != 2 {
            return Err(Error::Config {
                msg: format!(
                    "syncdb_settings.desc_version must be 1 or 2, got {}",
                    self.desc_version
                ),
            });
        }
        if self.files_version != 1 {
            return Err(Error::Config {
                msg: format!(
                    "syncdb_settings.files_version must be 1, got {}",
                    self.files_version
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManagementRepoConfig {
    pub directory: PathBuf,
}

/// One repository's layer directory names and shared pool/archive paths.
/// `name` doubles as the `stable` layer's directory name; the other five
/// fields name the remaining layers.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryConfig {
    pub name: String,
    pub debug: String,
    pub staging: String,
    pub testing: String,
    pub staging_debug: String,
    pub testing_debug: String,
    pub package_pool: PathBuf,
    pub source_pool: PathBuf,
    pub archiving: PathBuf,
}

impl RepositoryConfig {
    /// The six `(layer, directory name)` pairs this repository declares.
    pub fn layers(&self) -> [(&'static str, &str); 6] {
        [
            ("stable", self.name.as_str()),
            ("debug", self.debug.as_str()),
            ("staging", self.staging.as_str()),
            ("testing", self.testing.as_str()),
            ("staging_debug", self.staging_debug.as_str()),
            ("testing_debug", self.testing_debug.as_str()),
        ]
    }

    /// Where this repository's layer symlink directories physically live,
    /// one per declared layer. Two repositories sharing `archiving` but
    /// naming a layer identically would resolve to the same directory —
    /// the cross-purposing the source tolerated and this core forbids.
    pub fn resolved_layer_paths(&self) -> Vec<(&'static str, PathBuf)> {
        self.layers()
            .into_iter()
            .map(|(layer, dir_name)| (layer, self.archiving.join(dir_name)))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub architecture: Architecture,
    pub database_compression: CompressionSetting,
    pub package_verification: VerificationStrategy,
    #[serde(default)]
    pub build_requirements_exist: bool,
    pub syncdb_settings: SyncDbSettings,
    pub management_repo: ManagementRepoConfig,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

impl Config {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if config_path.is_none() {
            #[cfg(not(debug_assertions))]
            {
                builder = builder
                    .add_source(config::File::with_name("/etc/pacrepo/config").required(false));
            }

            #[cfg(debug_assertions)]
            {
                builder = builder.add_source(config::File::with_name("config").required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(
                config::File::with_name(path)
                    .required(true)
                    .format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(config::Environment::with_prefix("PACREPO").separator("__"));

        let raw = builder.build().map_err(|e| Error::Config {
            msg: format!("failed to load configuration: {e}"),
        })?;

        let config: Config = raw.try_deserialize().map_err(|e| Error::Config {
            msg: format!("failed to deserialize configuration: {e}"),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Check the resolved-layer-path uniqueness constraint: every layer
    /// directory, across every repository, must resolve to a distinct
    /// path. Pool and archive directories themselves may be shared.
    fn validate(&self) -> Result<()> {
        self.syncdb_settings.validate()?;

        let mut seen: BTreeMap<PathBuf, (String, &'static str)> = BTreeMap::new();
        for repo in &self.repositories {
            for (layer, path) in repo.resolved_layer_paths() {
                if let Some((other_repo, other_layer)) = seen.get(&path) {
                    return Err(Error::Config {
                        msg: format!(
                            "layer path collision: repository '{}' layer '{layer}' and repository '{other_repo}' layer '{other_layer}' both resolve to {}",
                            repo.name,
                            path.display()
                        ),
                    });
                }
                seen.insert(path, (repo.name.clone(), layer));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn base_toml(repo_a_archiving: &str, repo_b_archiving: &str) -> String {
        format!(
            r#"
architecture = "x86_64"
database_compression = "zst"
package_verification = "none"
build_requirements_exist = false

[syncdb_settings]
desc_version = 2
files_version = 1

[management_repo]
directory = "management"

[[repositories]]
name = "core"
debug = "core_debug"
staging = "core-staging"
testing = "core-testing"
staging_debug = "core-staging-debug"
testing_debug = "core-testing-debug"
package_pool = "pool/package"
source_pool = "pool/source"
archiving = "{repo_a_archiving}"

[[repositories]]
name = "extra"
debug = "extra_debug"
staging = "extra-staging"
testing = "extra-testing"
staging_debug = "extra-staging-debug"
testing_debug = "extra-testing-debug"
package_pool = "pool/package"
source_pool = "pool/source"
archiving = "{repo_b_archiving}"
"#
        )
    }

    #[test]
    fn loads_and_validates_disjoint_archiving_dirs() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");
        fs::write(&config_path, base_toml("data/core", "data/extra")).unwrap();

        let config = Config::load(Some(config_path.to_str().unwrap())).unwrap();
        assert_eq!(config.repositories.len(), 2);
        assert_eq!(config.syncdb_settings.desc_version, 2);
    }

    #[test]
    fn rejects_colliding_layer_paths_across_repositories() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");
        // Both repos share 'archiving' and one's stable name collides with
        // the other's, forcing two layers to resolve to the same path.
        let toml =
            base_toml("data/shared", "data/shared").replace(r#"name = "extra""#, r#"name = "core""#);
        fs::write(&config_path, toml).unwrap();

        let err = Config::load(Some(config_path.to_str().unwrap())).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn rejects_unknown_desc_version() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");
        let toml =
            base_toml("data/core", "data/extra").replace("desc_version = 2", "desc_version = 9");
        fs::write(&config_path, toml).unwrap();

        let err = Config::load(Some(config_path.to_str().unwrap())).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
