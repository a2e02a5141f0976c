//! `.MTREE` — gzip-compressed, newline-delimited filesystem-entry records.
//! Each record is a whitespace-separated sequence of `key=value` pairs; a
//! leading `/set` record supplies defaults inherited by following records
//! until cleared by `/unset`, mirroring real mtree semantics.

use std::collections::BTreeMap;
use std::io::Read;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Dir,
    File,
    Link,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MtreeEntry {
    pub path: String,
    pub entry_type: EntryType,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mode: Option<u32>,
    pub size: Option<u64>,
    pub time: Option<f64>,
    pub sha256digest: Option<String>,
    pub link: Option<String>,
}

/// Reverse the backslash-octal path escaping applied by mtree: every `\NNN`
/// triple is a literal byte value, not an escaped character. Decoding must
/// happen at the byte level so multi-byte UTF-8 sequences split across
/// several escapes (e.g. `\303\244` for `ä`) are reassembled before the
/// result is interpreted as UTF-8 — interpreting each escape independently
/// as a `char` would corrupt any non-ASCII path.
fn decode_octal_path(token: &str) -> Result<String> {
    let bytes = token.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).map_err(|e| Error::DecodeError {
        line: 0,
        msg: format!("mtree path is not valid UTF-8 after byte-level decode: {e}"),
    })
}

fn parse_keyword_pairs(tokens: &[&str]) -> BTreeMap<String, String> {
    tokens
        .iter()
        .filter_map(|token| token.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn entry_from_keywords(
    path: String,
    keywords: &BTreeMap<String, String>,
    lineno: usize,
) -> Result<MtreeEntry> {
    let entry_type = match keywords.get("type").map(String::as_str) {
        Some("dir") => EntryType::Dir,
        Some("file") => EntryType::File,
        Some("link") => EntryType::Link,
        Some(other) => {
            return Err(Error::SchemaViolation {
                kind: "mtree".to_string(),
                field: format!("unrecognized type '{other}' on line {lineno}"),
            });
        }
        None => {
            return Err(Error::SchemaViolation {
                kind: "mtree".to_string(),
                field: format!("entry on line {lineno} has no 'type' keyword"),
            });
        }
    };

    let uid = keywords
        .get("uid")
        .map(|v| v.parse().map_err(|_| decode_error(lineno, "uid")))
        .transpose()?;
    let gid = keywords
        .get("gid")
        .map(|v| v.parse().map_err(|_| decode_error(lineno, "gid")))
        .transpose()?;
    let mode = keywords
        .get("mode")
        .map(|v| u32::from_str_radix(v, 8).map_err(|_| decode_error(lineno, "mode")))
        .transpose()?;
    let size = keywords
        .get("size")
        .map(|v| v.parse().map_err(|_| decode_error(lineno, "size")))
        .transpose()?;
    let time = keywords
        .get("time")
        .map(|v| v.parse().map_err(|_| decode_error(lineno, "time")))
        .transpose()?;

    Ok(MtreeEntry {
        path,
        entry_type,
        uid,
        gid,
        mode,
        size,
        time,
        sha256digest: keywords.get("sha256digest").cloned(),
        link: keywords.get("link").cloned(),
    })
}

fn decode_error(lineno: usize, field: &str) -> Error {
    Error::DecodeError {
        line: lineno,
        msg: format!("malformed '{field}' value"),
    }
}

/// Decompress `gz_data` and parse every filesystem entry.
pub fn parse(gz_data: &[u8]) -> Result<Vec<MtreeEntry>> {
    let mut decoder = flate2::read::GzDecoder::new(gz_data);
    let mut content = String::new();
    decoder
        .read_to_string(&mut content)
        .map_err(|e| Error::ArchiveFormat {
            path: ".MTREE".to_string(),
            msg: e.to_string(),
        })?;
    parse_str(&content)
}

/// Parse already-decompressed mtree text.
pub fn parse_str(content: &str) -> Result<Vec<MtreeEntry>> {
    let mut defaults: BTreeMap<String, String> = BTreeMap::new();
    let mut entries = Vec::new();

    for (lineno, line) in content.lines().enumerate() {
        let lineno = lineno + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&first, rest)) = tokens.split_first() else {
            continue;
        };

        if first == "/set" {
            defaults.extend(parse_keyword_pairs(rest));
            continue;
        }
        if first == "/unset" {
            if rest.is_empty() {
                defaults.clear();
            } else {
                for key in rest {
                    defaults.remove(*key);
                }
            }
            continue;
        }

        let path = decode_octal_path(first)?;
        let mut keywords = defaults.clone();
        keywords.extend(parse_keyword_pairs(rest));

        entries.push(entry_from_keywords(path, &keywords, lineno)?);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entries_with_explicit_keywords() {
        let content = "#mtree\n./usr/bin/foo type=file mode=755 size=1024 time=1700000000.0 sha256digest=abcd\n";
        let entries = parse_str(content).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "./usr/bin/foo");
        assert_eq!(entries[0].entry_type, EntryType::File);
        assert_eq!(entries[0].mode, Some(0o755));
        assert_eq!(entries[0].size, Some(1024));
    }

    #[test]
    fn set_defaults_apply_until_unset() {
        let content = "\
/set type=file uid=0 gid=0 mode=644
./a size=1
./b size=2
/unset uid
./c size=3
";
        let entries = parse_str(content).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].uid, Some(0));
        assert_eq!(entries[1].uid, Some(0));
        assert_eq!(entries[2].uid, None);
        assert_eq!(entries[2].mode, Some(0o644));
    }

    #[test]
    fn decodes_multibyte_octal_escaped_path() {
        // "ä" is UTF-8 bytes 0xC3 0xA4, escaped byte-by-byte.
        let content = "./caf\\303\\244 type=file mode=644\n";
        let entries = parse_str(content).unwrap();
        assert_eq!(entries[0].path, "./café");
    }

    #[test]
    fn rejects_entry_missing_type() {
        let content = "./a size=1\n";
        assert!(parse_str(content).is_err());
    }

    #[test]
    fn rejects_unrecognized_type() {
        let content = "./a type=socket\n";
        assert!(parse_str(content).is_err());
    }
}
