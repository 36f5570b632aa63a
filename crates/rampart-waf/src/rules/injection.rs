//! SQL-injection and XSS detection oracle.
//!
//! Exposes the two-predicate contract the operator layer depends on:
//! `is_sqli(value) -> bool` and `is_xss(value) -> bool`. The detector is a
//! lightweight token-fingerprint heuristic; callers treat it as opaque and
//! it can be swapped for a full libinjection port without touching the
//! dispatch layer.

/// True when the value fingerprints as a SQL injection attempt.
pub fn is_sqli(value: &str) -> bool {
    let folded = value.to_ascii_lowercase();

    // Quote-break followed by boolean logic: the classic `' OR '1'='1`.
    if has_quote_break_tautology(&folded) {
        return true;
    }

    // Stacked or commented-out query tails after a quote break.
    if (folded.contains('\'') || folded.contains('"'))
        && (folded.contains("--") || folded.contains("#") || folded.contains(";"))
        && contains_sql_keyword(&folded)
    {
        return true;
    }

    // UNION-based extraction.
    if folded.contains("union")
        && (folded.contains("select") || folded.contains("all select"))
    {
        return true;
    }

    // Time/stacked probes and schema functions rarely seen in benign input.
    const PROBES: &[&str] = &[
        "sleep(",
        "benchmark(",
        "waitfor delay",
        "pg_sleep(",
        "load_file(",
        "into outfile",
        "into dumpfile",
        "information_schema",
        "@@version",
        "xp_cmdshell",
        "extractvalue(",
        "updatexml(",
    ];
    if PROBES.iter().any(|p| folded.contains(p)) {
        return true;
    }

    // Inline comment obfuscation between keywords: sel/**/ect.
    if folded.contains("/*") && folded.contains("*/") {
        let stripped: String = strip_inline_comments(&folded);
        if contains_sql_keyword(&stripped) && stripped != folded {
            return true;
        }
    }

    // Semicolon-chained second statement.
    if let Some(pos) = folded.find(';') {
        let tail = folded[pos + 1..].trim_start();
        const STMT: &[&str] = &["select", "insert", "update", "delete", "drop", "create", "alter"];
        if STMT.iter().any(|k| tail.starts_with(k)) {
            return true;
        }
    }

    false
}

/// True when the value fingerprints as a cross-site-scripting attempt.
pub fn is_xss(value: &str) -> bool {
    let folded = value.to_ascii_lowercase();

    // Script/embedding tags.
    const TAGS: &[&str] = &[
        "<script",
        "</script",
        "<iframe",
        "<object",
        "<embed",
        "<svg",
        "<img",
        "<body",
        "<video",
        "<audio",
        "<math",
        "<base",
        "<form",
    ];
    let has_tag = TAGS.iter().any(|t| folded.contains(t));

    // javascript: and data: URL schemes (allow whitespace obfuscation).
    let compact: String = folded.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.contains("javascript:") || compact.contains("vbscript:") {
        return true;
    }
    if compact.contains("data:text/html") {
        return true;
    }

    if has_tag {
        // A bare `<img` is only interesting with an event handler or script
        // payload; `<script` alone is already decisive.
        if folded.contains("<script") || folded.contains("</script") {
            return true;
        }
        if has_event_handler(&folded) {
            return true;
        }
        if folded.contains("<iframe") || folded.contains("<embed") || folded.contains("<object") {
            return true;
        }
    }

    // Event handlers outside a detected tag still count when paired with
    // an attribute assignment, e.g. `" onmouseover=alert(1)`.
    if has_event_handler(&folded) && (folded.contains('=')) {
        return true;
    }

    // expression() CSS and eval-ish payloads inside attributes.
    if compact.contains("expression(") || compact.contains("document.cookie") {
        return true;
    }

    false
}

fn contains_sql_keyword(s: &str) -> bool {
    const KEYWORDS: &[&str] = &[
        "select", "insert", "update", "delete", "drop", "union", "alter", "create", "truncate",
        "exec", "grant",
    ];
    KEYWORDS.iter().any(|k| contains_word(s, k))
}

/// Word-boundary containment so `dropdown` does not count as `drop`.
fn contains_word(haystack: &str, needle: &str) -> bool {
    let bytes = haystack.as_bytes();
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let abs = start + pos;
        let before_ok = abs == 0 || !bytes[abs - 1].is_ascii_alphanumeric();
        let end = abs + needle.len();
        let after_ok = end >= bytes.len() || !bytes[end].is_ascii_alphanumeric();
        if before_ok && after_ok {
            return true;
        }
        start = abs + 1;
    }
    false
}

/// `' OR '1'='1`-shaped tautologies: a quote, a boolean connective, and a
/// comparison between two similarly quoted terms.
fn has_quote_break_tautology(s: &str) -> bool {
    for quote in ['\'', '"'] {
        if let Some(qpos) = s.find(quote) {
            let tail = &s[qpos..];
            let has_connective = contains_word(tail, "or") || contains_word(tail, "and");
            if has_connective && tail.matches('=').count() >= 1 && tail.matches(quote).count() >= 2
            {
                return true;
            }
            // Numeric tautology without closing quote: ' or 1=1
            if has_connective {
                let compact: String = tail.chars().filter(|c| !c.is_whitespace()).collect();
                if compact.contains("or1=1") || compact.contains("and1=1") {
                    return true;
                }
            }
        }
    }
    false
}

fn has_event_handler(s: &str) -> bool {
    const HANDLERS: &[&str] = &[
        "onerror", "onload", "onclick", "onmouseover", "onfocus", "onblur", "onsubmit",
        "onkeydown", "onkeyup", "onchange", "ontoggle", "onanimationstart", "onpointerover",
    ];
    HANDLERS.iter().any(|h| {
        s.find(h)
            .map(|pos| s[pos + h.len()..].trim_start().starts_with('='))
            .unwrap_or(false)
    })
}

fn strip_inline_comments(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start..].find("*/") {
            Some(end) => rest = &rest[start + end + 2..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}
