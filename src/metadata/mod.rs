//! Parsers for the three embedded metadata mini-formats: `.PKGINFO`,
//! `.BUILDINFO` and `.MTREE`. Each dispatches to a schema-versioned variant
//! from an explicit discriminant; the format modules are re-exported from
//! this thin `mod.rs`.

pub mod buildinfo;
pub mod mtree;
pub mod pkginfo;

pub use buildinfo::BuildInfo;
pub use mtree::MtreeEntry;
pub use pkginfo::PkgInfo;

use crate::error::{Error, Result};

/// Split `input` into an ordered sequence of `(key, value)` pairs using the
/// lexical rules shared by `.PKGINFO` and `.BUILDINFO`: `key = value` lines,
/// `#`-prefixed comment lines, blank lines ignored, repeated keys kept in
/// order so multi-valued fields can be reconstructed by the caller.
pub(crate) fn parse_keyed_lines(input: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();

    for (lineno, raw_line) in input.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| Error::DecodeError {
            line: lineno + 1,
            msg: format!("expected 'key = value', got {raw_line:?}"),
        })?;

        pairs.push((key.trim().to_string(), value.trim().to_string()));
    }

    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_pairs_and_skips_comments() {
        let input = "# a comment\npkgname = foo\n\npkgver = 1.0-1\n";
        let pairs = parse_keyed_lines(input).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("pkgname".to_string(), "foo".to_string()),
                ("pkgver".to_string(), "1.0-1".to_string()),
            ]
        );
    }

    #[test]
    fn value_may_contain_equals_sign() {
        let pairs = parse_keyed_lines("options = key=value\n").unwrap();
        assert_eq!(pairs[0].1, "key=value");
    }

    #[test]
    fn rejects_line_without_assignment() {
        assert!(parse_keyed_lines("not an assignment").is_err());
    }
}
