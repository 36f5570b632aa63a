//! Pure value transforms applied before operator matching.
//!
//! Every transform is total: malformed input degrades to the closest
//! sensible output instead of erroring, so a hostile value can never abort
//! rule evaluation. `utf8_to_unicode` is identity here because values are
//! already `str`.

use super::model::Transform;
use std::borrow::Cow;

/// Apply a transform chain left-to-right.
pub fn apply_chain<'a>(transforms: &[Transform], value: &'a str) -> Cow<'a, str> {
    let mut current: Cow<'a, str> = Cow::Borrowed(value);
    for t in transforms {
        current = match current {
            Cow::Borrowed(s) => apply(*t, s),
            Cow::Owned(s) => {
                // A borrowed result here points into `s`; copy it out so
                // the owned buffer can be replaced.
                let replacement = match apply(*t, &s) {
                    Cow::Borrowed(b) if b.len() == s.len() => None,
                    Cow::Borrowed(b) => Some(b.to_string()),
                    Cow::Owned(o) => Some(o),
                };
                Cow::Owned(replacement.unwrap_or(s))
            }
        };
    }
    current
}

/// Apply a single transform.
pub fn apply<'a>(transform: Transform, value: &'a str) -> Cow<'a, str> {
    match transform {
        Transform::None | Transform::Utf8ToUnicode => Cow::Borrowed(value),
        Transform::UrlDecode => percent_decode(value, false),
        Transform::UrlDecodeUni => percent_decode(value, true),
        Transform::HexDecode => percent_decode(value, false),
        Transform::Lowercase => {
            if value.bytes().any(|b| b.is_ascii_uppercase()) {
                Cow::Owned(value.to_ascii_lowercase())
            } else {
                Cow::Borrowed(value)
            }
        }
        Transform::Uppercase => {
            if value.bytes().any(|b| b.is_ascii_lowercase()) {
                Cow::Owned(value.to_ascii_uppercase())
            } else {
                Cow::Borrowed(value)
            }
        }
        Transform::RemoveNulls => {
            if value.contains('\0') {
                Cow::Owned(value.replace('\0', ""))
            } else {
                Cow::Borrowed(value)
            }
        }
        Transform::ReplaceComments => replace_comments(value),
        Transform::CompressWhitespace => compress_whitespace(value),
        Transform::Trim => {
            let trimmed = value.trim();
            if trimmed.len() == value.len() {
                Cow::Borrowed(value)
            } else {
                Cow::Borrowed(trimmed)
            }
        }
    }
}

/// Percent-decode `%HH` sequences; `+` becomes a space. With `unicode`
/// tolerance, `%uXXXX` sequences decode to their code point as well.
/// Malformed escapes pass through literally.
fn percent_decode(value: &str, unicode: bool) -> Cow<'_, str> {
    if !value.contains('%') && !value.contains('+') {
        return Cow::Borrowed(value);
    }

    let bytes = value.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if unicode
                && i + 5 < bytes.len()
                && (bytes[i + 1] == b'u' || bytes[i + 1] == b'U') =>
            {
                match decode_hex4(&bytes[i + 2..i + 6]) {
                    Some(cp) => {
                        match char::from_u32(cp) {
                            Some(c) => {
                                let mut buf = [0u8; 4];
                                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                            }
                            None => out.extend_from_slice(&bytes[i..i + 6]),
                        }
                        i += 6;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'%' if i + 2 < bytes.len() => {
                match decode_hex2(bytes[i + 1], bytes[i + 2]) {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    // Decoded bytes may not be valid UTF-8; replace rather than fail.
    match String::from_utf8(out) {
        Ok(s) => Cow::Owned(s),
        Err(e) => Cow::Owned(String::from_utf8_lossy(e.as_bytes()).into_owned()),
    }
}

fn hex_val(b: u8) -> Option<u32> {
    match b {
        b'0'..=b'9' => Some((b - b'0') as u32),
        b'a'..=b'f' => Some((b - b'a' + 10) as u32),
        b'A'..=b'F' => Some((b - b'A' + 10) as u32),
        _ => None,
    }
}

fn decode_hex2(hi: u8, lo: u8) -> Option<u8> {
    Some((hex_val(hi)? * 16 + hex_val(lo)?) as u8)
}

fn decode_hex4(digits: &[u8]) -> Option<u32> {
    let mut v = 0u32;
    for &d in digits {
        v = v * 16 + hex_val(d)?;
    }
    Some(v)
}

/// Strip SQL `-- …` to end of line, `/* … */`, and HTML `<!-- … -->`.
/// Unterminated block comments strip through to the end of the value.
fn replace_comments(value: &str) -> Cow<'_, str> {
    if !value.contains("--") && !value.contains("/*") && !value.contains("<!--") {
        return Cow::Borrowed(value);
    }

    let bytes = value.as_bytes();
    let mut out = String::with_capacity(value.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i..].starts_with(b"<!--") {
            match value[i..].find("-->") {
                Some(end) => i += end + 3,
                None => break,
            }
        } else if bytes[i..].starts_with(b"/*") {
            match value[i..].find("*/") {
                Some(end) => i += end + 2,
                None => break,
            }
        } else if bytes[i..].starts_with(b"--") {
            match value[i..].find('\n') {
                Some(end) => i += end, // keep the newline itself
                None => break,
            }
        } else {
            // Advance one whole UTF-8 character.
            let ch_len = value[i..].chars().next().map(char::len_utf8).unwrap_or(1);
            out.push_str(&value[i..i + ch_len]);
            i += ch_len;
        }
    }
    Cow::Owned(out)
}

/// Collapse runs of whitespace to a single space.
fn compress_whitespace(value: &str) -> Cow<'_, str> {
    let needs_work = {
        let mut prev_ws = false;
        let mut found = false;
        for c in value.chars() {
            let ws = c.is_whitespace();
            if ws && (prev_ws || c != ' ') {
                found = true;
                break;
            }
            prev_ws = ws;
        }
        found
    };
    if !needs_work {
        return Cow::Borrowed(value);
    }

    let mut out = String::with_capacity(value.len());
    let mut prev_ws = false;
    for c in value.chars() {
        if c.is_whitespace() {
            if !prev_ws {
                out.push(' ');
            }
            prev_ws = true;
        } else {
            out.push(c);
            prev_ws = false;
        }
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transforms() {
        assert_eq!(apply(Transform::None, "a b"), "a b");
        assert_eq!(apply(Transform::Utf8ToUnicode, "héllo"), "héllo");
    }

    #[test]
    fn test_url_decode() {
        assert_eq!(apply(Transform::UrlDecode, "a%20b"), "a b");
        assert_eq!(apply(Transform::UrlDecode, "a+b"), "a b");
        assert_eq!(apply(Transform::UrlDecode, "%27%20OR%20%271"), "' OR '1");
        // Malformed escapes pass through
        assert_eq!(apply(Transform::UrlDecode, "100%"), "100%");
        assert_eq!(apply(Transform::UrlDecode, "%zz"), "%zz");
    }

    #[test]
    fn test_url_decode_uni() {
        assert_eq!(apply(Transform::UrlDecodeUni, "%u0041%u0042"), "AB");
        assert_eq!(apply(Transform::UrlDecodeUni, "%u003cscript"), "<script");
        // Plain %HH still decodes in uni mode
        assert_eq!(apply(Transform::UrlDecodeUni, "%3Cb%3E"), "<b>");
        // Truncated %u passes through as literal percent
        assert_eq!(apply(Transform::UrlDecodeUni, "%u00"), "%u00");
    }

    #[test]
    fn test_case_folds() {
        assert_eq!(apply(Transform::Lowercase, "SeLeCt"), "select");
        assert_eq!(apply(Transform::Uppercase, "select"), "SELECT");
        // ASCII-only fold leaves multibyte untouched
        assert_eq!(apply(Transform::Lowercase, "Ü"), "Ü");
    }

    #[test]
    fn test_remove_nulls() {
        assert_eq!(apply(Transform::RemoveNulls, "a\0b\0"), "ab");
        assert_eq!(apply(Transform::RemoveNulls, "clean"), "clean");
    }

    #[test]
    fn test_replace_comments() {
        assert_eq!(
            apply(Transform::ReplaceComments, "SELECT/*x*/1"),
            "SELECT1"
        );
        assert_eq!(apply(Transform::ReplaceComments, "a -- drop\nb"), "a \nb");
        assert_eq!(apply(Transform::ReplaceComments, "a -- tail"), "a ");
        assert_eq!(apply(Transform::ReplaceComments, "x<!-- hide -->y"), "xy");
        // Unterminated block comment strips to end
        assert_eq!(apply(Transform::ReplaceComments, "a/*b"), "a");
    }

    #[test]
    fn test_compress_whitespace() {
        assert_eq!(apply(Transform::CompressWhitespace, "a  \t\n b"), "a b");
        assert_eq!(apply(Transform::CompressWhitespace, "ab"), "ab");
        assert_eq!(apply(Transform::CompressWhitespace, " a"), " a");
    }

    #[test]
    fn test_hex_decode() {
        assert_eq!(apply(Transform::HexDecode, "%41%42"), "AB");
    }

    #[test]
    fn test_trim() {
        assert_eq!(apply(Transform::Trim, "  x  "), "x");
        assert_eq!(apply(Transform::Trim, "x"), "x");
    }

    #[test]
    fn test_idempotent_transforms() {
        for t in [
            Transform::Lowercase,
            Transform::Uppercase,
            Transform::Trim,
            Transform::RemoveNulls,
            Transform::CompressWhitespace,
        ] {
            let input = "  A\0b  C\t d  ";
            let once = apply(t, input).into_owned();
            let twice = apply(t, &once).into_owned();
            assert_eq!(once, twice, "{t:?} must be idempotent");
        }
    }

    #[test]
    fn test_chain_applies_left_to_right() {
        let chain = [Transform::UrlDecode, Transform::Lowercase];
        assert_eq!(apply_chain(&chain, "%55NION"), "union");
        // Reversed order decodes after lowering, so %55 still decodes but
        // the decoded 'U' stays uppercase.
        let chain = [Transform::Lowercase, Transform::UrlDecode];
        assert_eq!(apply_chain(&chain, "%55NION"), "Union");
    }

    #[test]
    fn test_chain_borrows_when_untouched() {
        let chain = [Transform::None, Transform::Trim];
        let out = apply_chain(&chain, "already-clean");
        assert!(matches!(out, Cow::Borrowed(_)));
    }

    #[test]
    fn test_invalid_utf8_decodes_lossily() {
        // %FF is not valid UTF-8 on its own; must not panic.
        let out = apply(Transform::UrlDecode, "a%FFb");
        assert!(out.contains('a') && out.contains('b'));
    }
}
