//! Dependency constraints of the form `name[cmp version]`, as used in
//! `depends`, `makedepends` and `buildtoolver` fields.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::Version;
use crate::error::Error;

/// A version comparator in a dependency constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl Comparator {
    fn as_str(&self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Eq => "=",
            Comparator::Ge => ">=",
            Comparator::Gt => ">",
        }
    }

    /// Whether `ordering` (the result of `vercmp(candidate, required)`)
    /// satisfies this comparator.
    fn holds(&self, ordering: i8) -> bool {
        match self {
            Comparator::Lt => ordering < 0,
            Comparator::Le => ordering <= 0,
            Comparator::Eq => ordering == 0,
            Comparator::Ge => ordering >= 0,
            Comparator::Gt => ordering > 0,
        }
    }
}

impl Display for Comparator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A parsed `name[cmp version]` dependency constraint.
///
/// A bare name with no comparator is satisfied by any version of a
/// matching name or provide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    name: String,
    version: Option<(Comparator, Version)>,
}

impl Constraint {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn comparator(&self) -> Option<Comparator> {
        self.version.as_ref().map(|(c, _)| *c)
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref().map(|(_, v)| v)
    }

    /// Parse `name`, `name=version`, `name>=version`, etc.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::InvalidConstraint {
                input: input.to_string(),
            });
        }

        // Longest operators first so `<=`/`>=` aren't split as `<`/`>`.
        const OPERATORS: &[(&str, Comparator)] = &[
            ("<=", Comparator::Le),
            (">=", Comparator::Ge),
            ("<", Comparator::Lt),
            (">", Comparator::Gt),
            ("=", Comparator::Eq),
        ];

        let split = OPERATORS
            .iter()
            .find_map(|(token, cmp)| input.find(token).map(|idx| (idx, token.len(), *cmp)));

        match split {
            None => Ok(Constraint {
                name: input.to_string(),
                version: None,
            }),
            Some((idx, token_len, cmp)) => {
                let name = &input[..idx];
                let version_str = &input[idx + token_len..];
                if name.is_empty() || version_str.is_empty() {
                    return Err(Error::InvalidConstraint {
                        input: input.to_string(),
                    });
                }
                let version = Version::parse(version_str).map_err(|_| Error::InvalidConstraint {
                    input: input.to_string(),
                })?;
                Ok(Constraint {
                    name: name.to_string(),
                    version: Some((cmp, version)),
                })
            }
        }
    }

    /// Whether a candidate package satisfies this constraint.
    ///
    /// `provides` lists the names (with an optional carried version) the
    /// candidate additionally offers under `provides = (...)`.
    pub fn is_satisfied_by(
        &self,
        candidate_name: &str,
        candidate_version: &Version,
        provides: &[(String, Option<Version>)],
    ) -> bool {
        let (matched_version, name_matches) = if candidate_name == self.name {
            (Some(candidate_version), true)
        } else if let Some((_, provide_version)) =
            provides.iter().find(|(name, _)| name == &self.name)
        {
            (provide_version.as_ref(), true)
        } else {
            (None, false)
        };

        if !name_matches {
            return false;
        }

        match (&self.version, matched_version) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some((cmp, required)), Some(found)) => cmp.holds(Version::vercmp(found, required)),
        }
    }
}

impl Display for Constraint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some((cmp, version)) = &self.version {
            write!(f, "{cmp}{version}")?;
        }
        Ok(())
    }
}

impl FromStr for Constraint {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Constraint::parse(input)
    }
}
