//! The closed set of architectures a package archive can be built for.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use crate::error::Error;

/// Architecture a package archive was built for.
///
/// `Any` marks architecture-independent packages; such a package is visible
/// in every per-architecture sync database of its repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Any,
    X86_64,
    Aarch64,
    Armv7h,
    I686,
    Riscv64,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Any => "any",
            Architecture::X86_64 => "x86_64",
            Architecture::Aarch64 => "aarch64",
            Architecture::Armv7h => "armv7h",
            Architecture::I686 => "i686",
            Architecture::Riscv64 => "riscv64",
        }
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "any" => Ok(Architecture::Any),
            "x86_64" => Ok(Architecture::X86_64),
            "aarch64" => Ok(Architecture::Aarch64),
            "armv7h" => Ok(Architecture::Armv7h),
            "i686" => Ok(Architecture::I686),
            "riscv64" => Ok(Architecture::Riscv64),
            other => Err(Error::SchemaViolation {
                kind: "architecture".to_string(),
                field: format!("unknown architecture '{other}'"),
            }),
        }
    }
}
