//! Package version arithmetic.
//!
//! A [`Version`] is an `(epoch, pkgver, pkgrel)` triple, serialized as
//! `[epoch:]pkgver-pkgrel`. Ordering follows pacman's `vercmp` algorithm:
//! compare epochs numerically, then compare `pkgver` segmentwise, falling
//! back to `pkgrel` only when `pkgver` ties and both sides carry one.

mod constraint;

pub use constraint::{Comparator, Constraint};

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A non-negative epoch, defaulting to 0 when absent from the string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Epoch(pub u64);

impl Display for Epoch {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The upstream version string: non-empty, alphanumerics/`.`/`_`/`+` only,
/// no hyphens (a hyphen introduces `pkgrel`).
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Pkgver(String);

impl Pkgver {
    pub fn new(input: impl Into<String>) -> Result<Self, Error> {
        let input = input.into();
        if input.is_empty() || input.contains('-') {
            return Err(Error::InvalidVersion { input });
        }
        if !input
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+'))
        {
            return Err(Error::InvalidVersion { input });
        }
        Ok(Pkgver(input))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Pkgver {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq for Pkgver {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl PartialOrd for Pkgver {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pkgver {
    /// Segmentwise comparison: strip non-alphanumeric separators, pull the
    /// next run of digits or letters (never mixed), compare digit-runs
    /// numerically (leading zeros insignificant) and letter-runs
    /// lexicographically, and let a longer remainder win unless it starts
    /// with a letter run.
    fn cmp(&self, other: &Self) -> Ordering {
        vercmp_segments(self.as_str(), other.as_str())
    }
}

/// Compare two segmentwise version strings using pacman's `vercmp` rules.
/// Shared by [`Pkgver`] ordering and [`Pkgrel`] ordering.
///
/// Walks both strings in lockstep: skip a run of separator bytes on each
/// side, then compare the alphanumeric run that follows. The length of the
/// separator run matters too — `"1.0."` sorts above `"1.0"` even though both
/// have an empty trailing segment, because the trailing separator itself
/// makes the left-hand side "longer". A run's type (digit vs letter) is
/// decided by the left-hand side; if the right-hand side doesn't have a run
/// of the same type at that position, the side with the digit run wins.
fn vercmp_segments(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    let a = a.as_bytes();
    let b = b.as_bytes();

    let (mut a_left, mut a_right) = (0usize, 0usize);
    let (mut b_left, mut b_right) = (0usize, 0usize);

    while a_left < a.len() && b_left < b.len() {
        while a_left < a.len() && !a[a_left].is_ascii_alphanumeric() {
            a_left += 1;
        }
        while b_left < b.len() && !b[b_left].is_ascii_alphanumeric() {
            b_left += 1;
        }

        if a_left >= a.len() || b_left >= b.len() {
            break;
        }

        if a_left - a_right != b_left - b_right {
            return if a_left - a_right < b_left - b_right {
                Ordering::Less
            } else {
                Ordering::Greater
            };
        }

        a_right = a_left;
        b_right = b_left;

        let a_is_digit = a[a_left].is_ascii_digit();

        while a_right < a.len()
            && a[a_right].is_ascii_alphanumeric()
            && a[a_right].is_ascii_digit() == a_is_digit
        {
            a_right += 1;
        }
        while b_right < b.len()
            && b[b_right].is_ascii_alphanumeric()
            && b[b_right].is_ascii_digit() == a_is_digit
        {
            b_right += 1;
        }

        if b_right == b_left {
            // the other side has no run of this type at this position
            return if a_is_digit {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }

        let a_run = &a[a_left..a_right];
        let b_run = &b[b_left..b_right];

        let run_cmp = if a_is_digit {
            let a_trimmed = trim_leading_zeros(a_run);
            let b_trimmed = trim_leading_zeros(b_run);
            a_trimmed
                .len()
                .cmp(&b_trimmed.len())
                .then_with(|| a_trimmed.cmp(b_trimmed))
        } else {
            a_run.cmp(b_run)
        };

        if run_cmp != Ordering::Equal {
            return run_cmp;
        }

        a_left = a_right;
        b_left = b_right;
    }

    let a_leftover = &a[a_left..];
    let b_leftover = &b[b_left..];

    if a_leftover.is_empty() && b_leftover.is_empty() {
        return Ordering::Equal;
    }

    let a_empty = a_leftover.is_empty();
    let a_starts_alpha = !a_empty && a_leftover[0].is_ascii_alphabetic();
    let b_starts_alpha = !b_leftover.is_empty() && b_leftover[0].is_ascii_alphabetic();

    if (a_empty && !b_starts_alpha) || (!a_empty && a_starts_alpha) {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

fn trim_leading_zeros(run: &[u8]) -> &[u8] {
    let start = run.iter().take_while(|&&b| b == b'0').count();
    &run[start..]
}

/// `\d+(\.\d+)?` — a build/release counter appended after a hyphen.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Pkgrel(String);

impl Pkgrel {
    pub fn new(input: impl Into<String>) -> Result<Self, Error> {
        let input = input.into();
        let valid = {
            let mut parts = input.splitn(2, '.');
            let first = parts.next().unwrap_or("");
            let rest = parts.next();
            !first.is_empty()
                && first.chars().all(|c| c.is_ascii_digit())
                && match rest {
                    None => true,
                    Some(r) => !r.is_empty() && r.chars().all(|c| c.is_ascii_digit()),
                }
        };
        if !valid {
            return Err(Error::InvalidVersion { input });
        }
        Ok(Pkgrel(input))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Pkgrel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq for Pkgrel {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl PartialOrd for Pkgrel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pkgrel {
    fn cmp(&self, other: &Self) -> Ordering {
        vercmp_segments(self.as_str(), other.as_str())
    }
}

/// The full `(epoch, pkgver, pkgrel)` triple, serialized as `[epoch:]pkgver-pkgrel`.
#[derive(Debug, Clone, Eq)]
pub struct Version {
    epoch: Epoch,
    pkgver: Pkgver,
    pkgrel: Option<Pkgrel>,
}

impl Version {
    pub fn new(epoch: Epoch, pkgver: Pkgver, pkgrel: Option<Pkgrel>) -> Self {
        Self {
            epoch,
            pkgver,
            pkgrel,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn pkgver(&self) -> &Pkgver {
        &self.pkgver
    }

    pub fn pkgrel(&self) -> Option<&Pkgrel> {
        self.pkgrel.as_ref()
    }

    /// Parse `[epoch:]pkgver[-pkgrel]`.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let (epoch_part, rest) = match input.split_once(':') {
            Some((e, rest)) => (Some(e), rest),
            None => (None, input),
        };

        let epoch = match epoch_part {
            Some(e) => Epoch(e.parse::<u64>().map_err(|_| Error::InvalidVersion {
                input: input.to_string(),
            })?),
            None => Epoch(0),
        };

        let (pkgver_part, pkgrel_part) = match rest.rsplit_once('-') {
            Some((v, r)) => (v, Some(r)),
            None => (rest, None),
        };

        let pkgver = Pkgver::new(pkgver_part).map_err(|_| Error::InvalidVersion {
            input: input.to_string(),
        })?;
        let pkgrel = pkgrel_part
            .map(Pkgrel::new)
            .transpose()
            .map_err(|_| Error::InvalidVersion {
                input: input.to_string(),
            })?;

        Ok(Version {
            epoch,
            pkgver,
            pkgrel,
        })
    }

    /// pacman-compatible three-way comparison.
    ///
    /// Returns `-1`, `0` or `1` rather than an [`Ordering`] because that is
    /// the contract `vercmp` consumers (upgrade gating, build-requirement
    /// checks) expect.
    pub fn vercmp(a: &Version, b: &Version) -> i8 {
        match a.cmp(b) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Version::parse(input)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.epoch.0 != 0 {
            write!(f, "{}:", self.epoch)?;
        }
        write!(f, "{}", self.pkgver)?;
        if let Some(pkgrel) = &self.pkgrel {
            write!(f, "-{}", pkgrel)?;
        }
        Ok(())
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| self.pkgver.cmp(&other.pkgver))
            .then_with(|| match (&self.pkgrel, &other.pkgrel) {
                (Some(a), Some(b)) => a.cmp(b),
                _ => Ordering::Equal,
            })
    }
}

// Serialized as its `[epoch:]pkgver-pkgrel` string form rather than the
// derived field-by-field object, so descriptor JSON and config files carry
// versions the way every other pacman-adjacent tool expects to read them.
impl Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}
