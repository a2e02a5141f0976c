use derive_more::Display;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error taxonomy, grouped per the Input / Semantics / Storage /
/// Security split the domain uses.
#[derive(Debug, Display)]
pub enum Error {
    // -- Input --
    #[display("failed to decompress or parse archive {path}: {msg}")]
    ArchiveFormat { path: String, msg: String },

    #[display(".PKGINFO missing from archive {path}")]
    MissingMetadata { path: String },

    #[display("unrecognized schema for {kind} (marker: {marker})")]
    SchemaUnknown { kind: String, marker: String },

    #[display("schema violation in {kind}: {field}")]
    SchemaViolation { kind: String, field: String },

    #[display("decode error at line {line}: {msg}")]
    DecodeError { line: usize, msg: String },

    #[display("invalid version string: {input}")]
    InvalidVersion { input: String },

    #[display("invalid dependency constraint: {input}")]
    InvalidConstraint { input: String },

    #[display("sync database malformed: {msg}")]
    SyncDbMalformed { msg: String },

    // -- Semantics --
    #[display("pkgbase {pkgbase} is internally inconsistent: {field} disagrees across members")]
    PkgbaseInconsistent { pkgbase: String, field: String },

    #[display(
        "version regression for {name}: {old} already published in {layer}, refusing {new}"
    )]
    VersionRegression {
        name: String,
        layer: String,
        old: String,
        new: String,
    },

    #[display("unsatisfied build requirement {constraint} for pkgbase {pkgbase}")]
    MissingBuildRequirement { pkgbase: String, constraint: String },

    #[display("name conflict for {name} in layer {layer}")]
    NameConflict { name: String, layer: String },

    // -- Storage --
    #[display("pool collision for {basename}: existing content differs")]
    PoolCollision { basename: String },

    #[display("symlink {path} already points elsewhere")]
    LinkConflict { path: String },

    #[display("timed out acquiring lock for {repo}/{arch}")]
    LockTimeout { repo: String, arch: String },

    #[display("I/O error at {path}: {error}")]
    Io { error: std::io::Error, path: String },

    // -- Security --
    #[display("signature verification failed for {path}")]
    SignatureInvalid { path: String },

    #[display("signature required but missing for {path}")]
    SignatureMissing { path: String },

    // -- Configuration --
    #[display("configuration error: {msg}")]
    Config { msg: String },
}

impl std::error::Error for Error {}

// Implement From<std::io::Error> for cases where path context is not available
impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io {
            error,
            path: "<unknown>".to_string(),
        }
    }
}

/// Extension trait for converting I/O errors to custom errors with path context
pub trait ResultIoExt<T> {
    /// Map I/O errors with path context
    fn map_io_err(self, path: &std::path::Path) -> Result<T>;
}

impl<T> ResultIoExt<T> for std::result::Result<T, std::io::Error> {
    fn map_io_err(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|error| Error::Io {
            error,
            path: path.display().to_string(),
        })
    }
}
