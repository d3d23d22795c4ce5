//! Reversible identifier escaping
//!
//! Maps arbitrary user-chosen names (any sequence of UTF-16 code units,
//! including NUL and unpaired surrogates) onto identifiers the relational
//! backend accepts. The mapping is injective and `decode_identifier` is its
//! exact left inverse.
//!
//! Escapes, all introduced by the marker `^`:
//!
//! | Input                      | Output              |
//! |----------------------------|---------------------|
//! | `^`                        | `^^`                |
//! | NUL                        | `^0`                |
//! | `A`..`Z`                   | `^A`..`^Z`          |
//! | unpaired high surrogate H  | `^2` H U+DC00       |
//! | unpaired low surrogate L   | `^3` U+D800 L       |
//! | policy char ≤ U+00FF       | `^1` + 2 hex digits |
//! | policy char > U+00FF       | `^5` + 6 hex digits |
//!
//! Policy escapes only apply to database names. A run of `n` markers holds
//! `n / 2` literal markers; an odd run means the last marker starts an
//! escape.

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::error::CodecError;
use crate::CodecResult;

/// Identifiers at or beyond this many UTF-16 units are rejected by default.
pub const DEFAULT_LENGTH_LIMIT: usize = 254;

const MARKER: u16 = b'^' as u16;
const SEPARATOR: u16 = b'_' as u16;
const SYNTHETIC_LOW: u16 = 0xDC00;
const SYNTHETIC_HIGH: u16 = 0xD800;

/// Which namespace an identifier belongs to; selects the leading prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierKind {
    Database,
    Store,
    Index,
}

impl IdentifierKind {
    fn prefix(self) -> u16 {
        match self {
            IdentifierKind::Database => b'D' as u16,
            IdentifierKind::Store => b'S' as u16,
            IdentifierKind::Index => b'I' as u16,
        }
    }
}

/// Backend-specific characters escaped in database names (file-system
/// unsafe characters by default).
#[derive(Debug, Clone, Default)]
pub enum EscapePolicy {
    /// Control characters, DEL and `"*/:<>?\|`
    #[default]
    Default,
    /// Escape nothing beyond the structural rules
    None,
    /// Escape every character the pattern matches
    Pattern(Regex),
}

impl EscapePolicy {
    fn matches(&self, c: char) -> bool {
        if c == '^' {
            return false;
        }
        match self {
            EscapePolicy::Default => {
                matches!(c, '\u{0}'..='\u{1F}' | '\u{7F}' | '"' | '*' | '/' | ':' | '<' | '>' | '?' | '\\' | '|')
            }
            EscapePolicy::None => false,
            EscapePolicy::Pattern(re) => {
                let mut buf = [0u8; 4];
                re.is_match(c.encode_utf8(&mut buf))
            }
        }
    }
}

/// Custom escape/unescape overrides for database names.
///
/// The hooks see names with NUL and the marker already escaped (see
/// [`escape_nul`]), and must themselves be mutually inverse.
#[derive(Clone)]
pub struct NameHooks {
    pub escape: Arc<dyn Fn(&[u16]) -> String + Send + Sync>,
    pub unescape: Arc<dyn Fn(&str) -> Vec<u16> + Send + Sync>,
}

impl fmt::Debug for NameHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NameHooks { .. }")
    }
}

/// Configuration consulted by every encode/decode call.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    pub escape_policy: EscapePolicy,
    /// `None` disables the limit.
    pub length_limit: Option<usize>,
    pub database_hooks: Option<NameHooks>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            escape_policy: EscapePolicy::Default,
            length_limit: Some(DEFAULT_LENGTH_LIMIT),
            database_hooks: None,
        }
    }
}

/// Encode a raw name into a backend identifier starting with the kind's
/// prefix letter and `_`.
pub fn encode_identifier(
    raw: &[u16],
    kind: IdentifierKind,
    config: &CodecConfig,
) -> CodecResult<String> {
    if kind == IdentifierKind::Database {
        if let Some(hooks) = &config.database_hooks {
            return Ok((hooks.escape)(&escape_nul(raw)));
        }
    }

    let mut out = Vec::with_capacity(raw.len() + 2);
    out.push(kind.prefix());
    out.push(SEPARATOR);
    escape_body(raw, kind == IdentifierKind::Database, config, &mut out);

    if let Some(limit) = config.length_limit {
        if out.len() >= limit {
            return Err(CodecError::NameTooLong {
                length: out.len(),
                limit,
            });
        }
    }

    // Every surrogate in `out` is paired by construction.
    String::from_utf16(&out).map_err(|_| CodecError::InvalidUtf16)
}

/// Decode an identifier produced by [`encode_identifier`] back to the raw
/// code units.
pub fn decode_identifier(
    identifier: &str,
    kind: IdentifierKind,
    config: &CodecConfig,
) -> CodecResult<Vec<u16>> {
    if kind == IdentifierKind::Database {
        if let Some(hooks) = &config.database_hooks {
            return unescape_nul(&(hooks.unescape)(identifier));
        }
    }

    let units: Vec<u16> = identifier.encode_utf16().collect();
    if units.len() < 2 || units[0] != kind.prefix() || units[1] != SEPARATOR {
        return Err(malformed(0, "missing identifier prefix"));
    }
    unescape_body(&units, 2)
}

fn escape_body(raw: &[u16], policy_escapes: bool, config: &CodecConfig, out: &mut Vec<u16>) {
    let mut i = 0;
    while i < raw.len() {
        let unit = raw[i];
        match unit {
            MARKER => out.extend([MARKER, MARKER]),
            0 => out.extend([MARKER, b'0' as u16]),
            0x41..=0x5A => out.extend([MARKER, unit]),
            0xD800..=0xDBFF => match raw.get(i + 1) {
                Some(&low @ 0xDC00..=0xDFFF) => {
                    let c = combine_surrogates(unit, low);
                    if policy_escapes && config.escape_policy.matches(c) {
                        push_policy_escape(c, out);
                    } else {
                        out.extend([unit, low]);
                    }
                    i += 1;
                }
                _ => out.extend([MARKER, b'2' as u16, unit, SYNTHETIC_LOW]),
            },
            // A low surrogate that follows a high one was consumed above.
            0xDC00..=0xDFFF => out.extend([MARKER, b'3' as u16, SYNTHETIC_HIGH, unit]),
            _ => {
                let c = char::from_u32(u32::from(unit)).unwrap_or(char::REPLACEMENT_CHARACTER);
                if policy_escapes && config.escape_policy.matches(c) {
                    push_policy_escape(c, out);
                } else {
                    out.push(unit);
                }
            }
        }
        i += 1;
    }
}

fn push_policy_escape(c: char, out: &mut Vec<u16>) {
    let code = u32::from(c);
    let escaped = if code <= 0xFF {
        format!("^1{code:02x}")
    } else {
        format!("^5{code:06x}")
    };
    out.extend(escaped.encode_utf16());
}

fn unescape_body(units: &[u16], start: usize) -> CodecResult<Vec<u16>> {
    let mut out = Vec::with_capacity(units.len());
    let mut i = start;
    while i < units.len() {
        if units[i] != MARKER {
            out.push(units[i]);
            i += 1;
            continue;
        }

        let run_start = i;
        while i < units.len() && units[i] == MARKER {
            i += 1;
        }
        let run = i - run_start;
        out.extend(std::iter::repeat(MARKER).take(run / 2));
        if run % 2 == 0 {
            continue;
        }

        let tag = *units
            .get(i)
            .ok_or_else(|| malformed(i, "dangling escape marker"))?;
        match tag {
            0x30 => {
                out.push(0);
                i += 1;
            }
            0x41..=0x5A => {
                out.push(tag);
                i += 1;
            }
            0x31 => {
                let code = parse_hex(units, i + 1, 2)?;
                out.push(code as u16);
                i += 3;
            }
            0x35 => {
                let code = parse_hex(units, i + 1, 6)?;
                let c = char::from_u32(code)
                    .ok_or_else(|| malformed(i, "escaped code point out of range"))?;
                let mut buf = [0u16; 2];
                out.extend_from_slice(c.encode_utf16(&mut buf));
                i += 7;
            }
            0x32 => match (units.get(i + 1), units.get(i + 2)) {
                (Some(&high @ 0xD800..=0xDBFF), Some(&SYNTHETIC_LOW)) => {
                    out.push(high);
                    i += 3;
                }
                _ => return Err(malformed(i, "bad unpaired high surrogate escape")),
            },
            0x33 => match (units.get(i + 1), units.get(i + 2)) {
                (Some(&SYNTHETIC_HIGH), Some(&low @ 0xDC00..=0xDFFF)) => {
                    out.push(low);
                    i += 3;
                }
                _ => return Err(malformed(i, "bad unpaired low surrogate escape")),
            },
            _ => return Err(malformed(i, "unknown escape")),
        }
    }
    Ok(out)
}

fn parse_hex(units: &[u16], start: usize, digits: usize) -> CodecResult<u32> {
    let slice = units
        .get(start..start + digits)
        .ok_or_else(|| malformed(start, "truncated hex escape"))?;
    slice.iter().try_fold(0u32, |acc, &unit| {
        char::from_u32(u32::from(unit))
            .and_then(|c| c.to_digit(16))
            .map(|d| acc * 16 + d)
            .ok_or_else(|| malformed(start, "invalid hex digit"))
    })
}

fn combine_surrogates(high: u16, low: u16) -> char {
    let code = 0x10000 + ((u32::from(high) - 0xD800) << 10) + (u32::from(low) - 0xDC00);
    char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER)
}

fn malformed(position: usize, reason: &str) -> CodecError {
    CodecError::MalformedIdentifier {
        position,
        reason: reason.to_string(),
    }
}

/// Escape only the marker and NUL; the minimum applied around custom hooks.
pub fn escape_nul(raw: &[u16]) -> Vec<u16> {
    let mut out = Vec::with_capacity(raw.len());
    for &unit in raw {
        match unit {
            MARKER => out.extend([MARKER, MARKER]),
            0 => out.extend([MARKER, b'0' as u16]),
            _ => out.push(unit),
        }
    }
    out
}

/// Inverse of [`escape_nul`].
pub fn unescape_nul(escaped: &[u16]) -> CodecResult<Vec<u16>> {
    let mut out = Vec::with_capacity(escaped.len());
    let mut i = 0;
    while i < escaped.len() {
        if escaped[i] != MARKER {
            out.push(escaped[i]);
            i += 1;
            continue;
        }
        let run_start = i;
        while i < escaped.len() && escaped[i] == MARKER {
            i += 1;
        }
        let run = i - run_start;
        out.extend(std::iter::repeat(MARKER).take(run / 2));
        if run % 2 == 1 {
            match escaped.get(i) {
                Some(0x30) => {
                    out.push(0);
                    i += 1;
                }
                _ => return Err(malformed(i, "dangling escape marker")),
            }
        }
    }
    Ok(out)
}

/// Escape a database name (used as the backing file name).
pub fn escape_database_name(name: &str, config: &CodecConfig) -> CodecResult<String> {
    let raw: Vec<u16> = name.encode_utf16().collect();
    encode_identifier(&raw, IdentifierKind::Database, config)
}

/// Recover a database name from its escaped form.
pub fn unescape_database_name(escaped: &str, config: &CodecConfig) -> CodecResult<String> {
    let raw = decode_identifier(escaped, IdentifierKind::Database, config)?;
    String::from_utf16(&raw).map_err(|_| CodecError::InvalidUtf16)
}

/// Escape an object store name into its table identifier (unquoted).
pub fn escape_store_name(name: &str, config: &CodecConfig) -> CodecResult<String> {
    let raw: Vec<u16> = name.encode_utf16().collect();
    encode_identifier(&raw, IdentifierKind::Store, config)
}

/// Escape an index name into its column identifier (unquoted).
pub fn escape_index_name(name: &str, config: &CodecConfig) -> CodecResult<String> {
    let raw: Vec<u16> = name.encode_utf16().collect();
    encode_identifier(&raw, IdentifierKind::Index, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    #[test]
    fn test_prefix_prevents_empty_identifier() {
        let cfg = CodecConfig::default();
        assert_eq!(escape_store_name("", &cfg).unwrap(), "S_");
        assert_eq!(escape_index_name("", &cfg).unwrap(), "I_");
        assert_eq!(escape_database_name("", &cfg).unwrap(), "D_");
    }

    #[test]
    fn test_uppercase_and_marker_are_escaped() {
        let cfg = CodecConfig::default();
        assert_eq!(escape_store_name("People^", &cfg).unwrap(), "S_^People^^");
        assert_eq!(escape_index_name("byTag", &cfg).unwrap(), "I_by^Tag");
    }

    #[test]
    fn test_case_variants_do_not_collide() {
        let cfg = CodecConfig::default();
        let lower = escape_store_name("abc", &cfg).unwrap();
        let upper = escape_store_name("ABC", &cfg).unwrap();
        assert_ne!(lower.to_ascii_lowercase(), upper.to_ascii_lowercase());
    }

    #[test]
    fn test_nul_escape() {
        let cfg = CodecConfig::default();
        let id = encode_identifier(&[b'a' as u16, 0, b'b' as u16], IdentifierKind::Store, &cfg)
            .unwrap();
        assert_eq!(id, "S_a^0b");
    }

    #[test]
    fn test_database_policy_escapes_file_system_characters() {
        let cfg = CodecConfig::default();
        assert_eq!(escape_database_name("a/b:c", &cfg).unwrap(), "D_a^12fb^13ac");
        assert_eq!(escape_store_name("a/b", &cfg).unwrap(), "S_a/b");
        assert_eq!(unescape_database_name("D_a^12fb^13ac", &cfg).unwrap(), "a/b:c");
    }

    #[test]
    fn test_pattern_policy_wide_escape() {
        let cfg = CodecConfig {
            escape_policy: EscapePolicy::Pattern(Regex::new("[é😀]").unwrap()),
            ..CodecConfig::default()
        };
        let escaped = escape_database_name("é😀x", &cfg).unwrap();
        assert_eq!(escaped, "D_^1e9^501f600x");
        assert_eq!(unescape_database_name(&escaped, &cfg).unwrap(), "é😀x");
    }

    #[test]
    fn test_unpaired_surrogates_become_well_formed() {
        let cfg = CodecConfig::default();
        let raw = vec![0xD83D, b'x' as u16, 0xDE00];
        let id = encode_identifier(&raw, IdentifierKind::Index, &cfg).unwrap();
        assert_eq!(units(&id), vec![
            b'I' as u16, b'_' as u16,
            MARKER, b'2' as u16, 0xD83D, 0xDC00,
            b'x' as u16,
            MARKER, b'3' as u16, 0xD800, 0xDE00,
        ]);
        assert_eq!(decode_identifier(&id, IdentifierKind::Index, &cfg).unwrap(), raw);
    }

    #[test]
    fn test_consecutive_lone_low_surrogates_are_all_escaped() {
        let cfg = CodecConfig::default();
        let raw = vec![b'a' as u16, 0xDC01, 0xDC02];
        let id = encode_identifier(&raw, IdentifierKind::Store, &cfg).unwrap();
        assert_eq!(decode_identifier(&id, IdentifierKind::Store, &cfg).unwrap(), raw);
    }

    #[test]
    fn test_marker_run_parity() {
        let cfg = CodecConfig::default();
        // literal marker followed by an uppercase letter: three markers, odd run
        let id = escape_store_name("^A", &cfg).unwrap();
        assert_eq!(id, "S_^^^A");
        assert_eq!(decode_identifier(&id, IdentifierKind::Store, &cfg).unwrap(), units("^A"));

        // two literal markers then a literal zero: even run, no escape
        let id = escape_store_name("^^0", &cfg).unwrap();
        assert_eq!(id, "S_^^^^0");
        assert_eq!(decode_identifier(&id, IdentifierKind::Store, &cfg).unwrap(), units("^^0"));
    }

    #[test]
    fn test_length_limit_rejects_instead_of_truncating() {
        let cfg = CodecConfig::default();
        let name = "a".repeat(DEFAULT_LENGTH_LIMIT - 3);
        assert!(escape_database_name(&name, &cfg).is_ok());

        let name = "a".repeat(DEFAULT_LENGTH_LIMIT - 2);
        let err = escape_database_name(&name, &cfg).unwrap_err();
        assert_eq!(
            err,
            CodecError::NameTooLong {
                length: DEFAULT_LENGTH_LIMIT,
                limit: DEFAULT_LENGTH_LIMIT
            }
        );

        let unlimited = CodecConfig {
            length_limit: None,
            ..CodecConfig::default()
        };
        assert!(escape_database_name(&"a".repeat(1000), &unlimited).is_ok());
    }

    #[test]
    fn test_malformed_identifiers_are_rejected() {
        let cfg = CodecConfig::default();
        assert!(decode_identifier("X_abc", IdentifierKind::Store, &cfg).is_err());
        assert!(decode_identifier("S_abc^", IdentifierKind::Store, &cfg).is_err());
        assert!(decode_identifier("S_^9", IdentifierKind::Store, &cfg).is_err());
        assert!(decode_identifier("S_^1z0", IdentifierKind::Store, &cfg).is_err());
    }

    #[test]
    fn test_database_hooks_override_escaping() {
        let cfg = CodecConfig {
            database_hooks: Some(NameHooks {
                escape: Arc::new(|units: &[u16]| format!("db-{}", String::from_utf16_lossy(units))),
                unescape: Arc::new(|s: &str| s.trim_start_matches("db-").encode_utf16().collect()),
            }),
            ..CodecConfig::default()
        };
        let raw = vec![b'M' as u16, 0, b'^' as u16];
        let escaped = encode_identifier(&raw, IdentifierKind::Database, &cfg).unwrap();
        assert_eq!(escaped, "db-M^0^^");
        assert_eq!(
            decode_identifier(&escaped, IdentifierKind::Database, &cfg).unwrap(),
            raw
        );
    }
}
