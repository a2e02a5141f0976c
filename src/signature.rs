//! Locate and optionally verify a package archive's detached signature.
//!
//! Two built-in strategies, selected by `package_verification`: `none`
//! accepts unsigned archives outright; `pacman-key` requires a `.sig`
//! sibling and shells out to an external verifier under a wall-clock
//! budget, mirroring the bounded-external-process idiom the engine also
//! uses for build-requirement archive directories.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::VerificationStrategy;
use crate::error::{Error, Result};

/// Default wall-clock budget for an external verifier invocation.
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// A configured signature-verification strategy.
#[derive(Debug, Clone)]
pub enum Verifier {
    /// Accept unsigned packages; no `.sig` expected.
    None,
    /// Require `<archive>.sig`; invoke an external verifier with the given
    /// keyring, succeeding iff the process exits successfully.
    PacmanKey {
        keyring: PathBuf,
        verifier_binary: PathBuf,
        timeout: Duration,
    },
}

impl Verifier {
    pub fn from_strategy(strategy: VerificationStrategy, keyring: PathBuf) -> Self {
        match strategy {
            VerificationStrategy::None => Verifier::None,
            VerificationStrategy::PacmanKey => Verifier::PacmanKey {
                keyring,
                verifier_binary: PathBuf::from("pacman-key"),
                timeout: DEFAULT_VERIFY_TIMEOUT,
            },
        }
    }

    /// The conventional signature path for an archive: the archive path
    /// with `.sig` appended.
    pub fn signature_path(archive_path: &Path) -> PathBuf {
        let mut name = archive_path.as_os_str().to_owned();
        name.push(".sig");
        PathBuf::from(name)
    }

    /// Verify `archive_path`. `None` always succeeds; `PacmanKey` requires a
    /// sibling `.sig` and a successful external verifier exit.
    pub async fn verify(&self, archive_path: &Path) -> Result<()> {
        match self {
            Verifier::None => Ok(()),
            Verifier::PacmanKey {
                keyring,
                verifier_binary,
                timeout: budget,
            } => {
                let sig_path = Self::signature_path(archive_path);
                if !tokio::fs::try_exists(&sig_path).await.unwrap_or(false) {
                    return Err(Error::SignatureMissing {
                        path: archive_path.display().to_string(),
                    });
                }

                debug!(
                    archive = %archive_path.display(),
                    signature = %sig_path.display(),
                    "invoking external signature verifier"
                );

                let mut command = Command::new(verifier_binary);
                command
                    .arg("--verify")
                    .arg(&sig_path)
                    .arg(archive_path)
                    .arg("--config")
                    .arg(keyring)
                    .kill_on_drop(true);

                let status = timeout(*budget, command.status()).await;

                let status = match status {
                    Ok(Ok(status)) => status,
                    Ok(Err(e)) => {
                        return Err(Error::Io {
                            error: e,
                            path: verifier_binary.display().to_string(),
                        });
                    }
                    Err(_) => {
                        warn!(
                            archive = %archive_path.display(),
                            "signature verifier exceeded its wall-clock budget"
                        );
                        return Err(Error::SignatureInvalid {
                            path: archive_path.display().to_string(),
                        });
                    }
                };

                if status.success() {
                    Ok(())
                } else {
                    Err(Error::SignatureInvalid {
                        path: archive_path.display().to_string(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn none_strategy_accepts_anything() {
        let verifier = Verifier::None;
        verifier.verify(Path::new("/nonexistent/foo.pkg.tar.zst")).await.unwrap();
    }

    #[tokio::test]
    async fn pacman_key_rejects_missing_signature() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("foo.pkg.tar.zst");
        tokio::fs::write(&archive, b"data").await.unwrap();

        let verifier = Verifier::PacmanKey {
            keyring: dir.path().join("keyring.gpg"),
            verifier_binary: PathBuf::from("pacman-key"),
            timeout: Duration::from_secs(1),
        };

        let err = verifier.verify(&archive).await.unwrap_err();
        assert!(matches!(err, Error::SignatureMissing { .. }));
    }

    #[tokio::test]
    async fn signature_path_appends_sig_suffix() {
        let path = Verifier::signature_path(Path::new("/pool/foo-1.0-1-any.pkg.tar.zst"));
        assert_eq!(path, PathBuf::from("/pool/foo-1.0-1-any.pkg.tar.zst.sig"));
    }
}
