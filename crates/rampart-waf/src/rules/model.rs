//! Rule types and their YAML wire shape.
//!
//! Operators and transforms are resolved from strings to closed enums once
//! at parse time; match-time dispatch is a plain enum switch. A rule is
//! immutable after [`Rule::compile`]: the regex (when the operator needs
//! one) is built exactly once, case-insensitively, and never mutated.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// What a matching rule does in enforce mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Deny,
    Log,
}

/// Closed operator set. Unknown operator strings fall back to `Regex`
/// behavior at parse time (and with no compiled pattern such a rule never
/// matches).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Regex,
    Contains,
    StartsWith,
    EndsWith,
    Equals,
    LibinjectionSqli,
    LibinjectionXss,
}

impl Operator {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "regex" => Some(Operator::Regex),
            "contains" => Some(Operator::Contains),
            "starts_with" => Some(Operator::StartsWith),
            "ends_with" => Some(Operator::EndsWith),
            "equals" => Some(Operator::Equals),
            "libinjection_sqli" => Some(Operator::LibinjectionSqli),
            "libinjection_xss" => Some(Operator::LibinjectionXss),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Regex => "regex",
            Operator::Contains => "contains",
            Operator::StartsWith => "starts_with",
            Operator::EndsWith => "ends_with",
            Operator::Equals => "equals",
            Operator::LibinjectionSqli => "libinjection_sqli",
            Operator::LibinjectionXss => "libinjection_xss",
        }
    }

    /// The libinjection operators carry no pattern; all others require one.
    pub fn requires_pattern(&self) -> bool {
        !matches!(self, Operator::LibinjectionSqli | Operator::LibinjectionXss)
    }
}

/// Closed transform set, applied left-to-right before matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    None,
    UrlDecode,
    UrlDecodeUni,
    Lowercase,
    Uppercase,
    Utf8ToUnicode,
    RemoveNulls,
    ReplaceComments,
    CompressWhitespace,
    HexDecode,
    Trim,
}

impl Transform {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Transform::None),
            "url_decode" => Some(Transform::UrlDecode),
            "url_decode_uni" => Some(Transform::UrlDecodeUni),
            "lowercase" => Some(Transform::Lowercase),
            "uppercase" => Some(Transform::Uppercase),
            "utf8_to_unicode" => Some(Transform::Utf8ToUnicode),
            "remove_nulls" => Some(Transform::RemoveNulls),
            "replace_comments" => Some(Transform::ReplaceComments),
            "compress_whitespace" => Some(Transform::CompressWhitespace),
            "hex_decode" => Some(Transform::HexDecode),
            "trim" => Some(Transform::Trim),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transform::None => "none",
            Transform::UrlDecode => "url_decode",
            Transform::UrlDecodeUni => "url_decode_uni",
            Transform::Lowercase => "lowercase",
            Transform::Uppercase => "uppercase",
            Transform::Utf8ToUnicode => "utf8_to_unicode",
            Transform::RemoveNulls => "remove_nulls",
            Transform::ReplaceComments => "replace_comments",
            Transform::CompressWhitespace => "compress_whitespace",
            Transform::HexDecode => "hex_decode",
            Transform::Trim => "trim",
        }
    }
}

/// Which part of the request a variable spec inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableType {
    RequestLine,
    RequestFilename,
    RequestBasename,
    Args,
    ArgsNames,
    Headers,
    Cookie,
    CookieNames,
    Body,
}

impl VariableType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REQUEST_LINE" => Some(VariableType::RequestLine),
            "REQUEST_FILENAME" => Some(VariableType::RequestFilename),
            "REQUEST_BASENAME" => Some(VariableType::RequestBasename),
            "ARGS" => Some(VariableType::Args),
            "ARGS_NAMES" => Some(VariableType::ArgsNames),
            "HEADERS" => Some(VariableType::Headers),
            "COOKIE" => Some(VariableType::Cookie),
            "COOKIE_NAMES" => Some(VariableType::CookieNames),
            "BODY" => Some(VariableType::Body),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VariableType::RequestLine => "REQUEST_LINE",
            VariableType::RequestFilename => "REQUEST_FILENAME",
            VariableType::RequestBasename => "REQUEST_BASENAME",
            VariableType::Args => "ARGS",
            VariableType::ArgsNames => "ARGS_NAMES",
            VariableType::Headers => "HEADERS",
            VariableType::Cookie => "COOKIE",
            VariableType::CookieNames => "COOKIE_NAMES",
            VariableType::Body => "BODY",
        }
    }
}

/// A variable spec: the type plus an optional header-name whitelist (only
/// meaningful for `HEADERS`; ignored elsewhere).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSpec {
    pub var_type: VariableType,
    pub header_names: Option<Vec<String>>,
}

impl VariableSpec {
    pub fn new(var_type: VariableType) -> Self {
        Self {
            var_type,
            header_names: None,
        }
    }
}

// ===== YAML wire shape =====

/// `{rules: [ … ]}` root of every rule file.
#[derive(Debug, Deserialize, Serialize)]
pub struct RuleFile {
    #[serde(default)]
    pub rules: Vec<RawRule>,
}

/// A rule as written in YAML, before operator/transform resolution.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawRule {
    pub id: u32,
    pub msg: String,
    pub action: RuleAction,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub variables: Vec<RawVariable>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<i32>,
    #[serde(default = "default_score")]
    pub default_score: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paranoia_level: Option<u8>,
}

fn default_score() -> i32 {
    1
}

/// Variables accept either a bare string (`ARGS`) or a map with an optional
/// header-name whitelist (`{type: HEADERS, names: [user-agent]}`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RawVariable {
    Bare(String),
    Spec {
        #[serde(rename = "type")]
        var_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        names: Option<Vec<String>>,
    },
}

/// An immutable, compiled rule.
#[derive(Debug)]
pub struct Rule {
    pub id: u32,
    pub msg: String,
    pub action: RuleAction,
    pub operator: Operator,
    pub pattern: Option<String>,
    pub transforms: Vec<Transform>,
    pub variables: Vec<VariableSpec>,
    pub score: Option<i32>,
    pub default_score: i32,
    /// Carried through for reporting; the evaluator does not consult it.
    pub paranoia_level: Option<u8>,
    /// Populated only for the regex operator. A compile failure leaves this
    /// `None` and the rule then never matches.
    pub compiled_regex: Option<Regex>,
}

impl Rule {
    /// Resolve operator/transform strings and compile the regex once.
    ///
    /// Returns `Err` only for structural problems that make the rule
    /// unusable in any mode (a pattern-requiring operator with no pattern,
    /// or no parseable variables). Unknown operators fall back to regex
    /// semantics, unknown transforms to identity, and a regex compile
    /// failure retains the rule with `compiled_regex = None`.
    pub fn compile(raw: RawRule, source: &str) -> Result<Self, String> {
        let operator = match Operator::parse(&raw.operator) {
            Some(op) => op,
            None => {
                warn!(
                    rule_id = raw.id,
                    operator = %raw.operator,
                    source,
                    "unknown operator, falling back to regex semantics"
                );
                Operator::Regex
            }
        };

        if operator.requires_pattern() && raw.pattern.is_none() {
            return Err(format!(
                "rule {} uses operator '{}' but has no pattern",
                raw.id, raw.operator
            ));
        }

        let mut variables = Vec::with_capacity(raw.variables.len());
        for v in &raw.variables {
            let (type_str, names) = match v {
                RawVariable::Bare(s) => (s.as_str(), None),
                RawVariable::Spec { var_type, names } => (var_type.as_str(), names.clone()),
            };
            match VariableType::parse(type_str) {
                Some(vt) => variables.push(VariableSpec {
                    var_type: vt,
                    header_names: if vt == VariableType::Headers {
                        names
                    } else {
                        None
                    },
                }),
                None => {
                    warn!(
                        rule_id = raw.id,
                        variable = type_str,
                        source,
                        "unknown variable type, skipping"
                    );
                }
            }
        }
        if variables.is_empty() {
            return Err(format!("rule {} has no usable variables", raw.id));
        }

        let transforms = raw
            .transforms
            .iter()
            .map(|t| {
                Transform::parse(t).unwrap_or_else(|| {
                    warn!(
                        rule_id = raw.id,
                        transform = %t,
                        source,
                        "unknown transform, treating as identity"
                    );
                    Transform::None
                })
            })
            .collect();

        let compiled_regex = if operator == Operator::Regex {
            match raw.pattern.as_deref() {
                Some(p) => match RegexBuilder::new(p).case_insensitive(true).build() {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(
                            rule_id = raw.id,
                            source,
                            error = %e,
                            "regex failed to compile, rule will never match"
                        );
                        None
                    }
                },
                None => None,
            }
        } else {
            None
        };

        Ok(Rule {
            id: raw.id,
            msg: raw.msg,
            action: raw.action,
            operator,
            pattern: raw.pattern,
            transforms,
            variables,
            score: raw.score,
            default_score: raw.default_score,
            paranoia_level: raw.paranoia_level,
            compiled_regex,
        })
    }

    /// `score ?? default_score`.
    pub fn effective_score(&self) -> i32 {
        self.score.unwrap_or(self.default_score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(yaml: &str) -> RawRule {
        let file: RuleFile = serde_yaml::from_str(yaml).unwrap();
        file.rules.into_iter().next().unwrap()
    }

    #[test]
    fn test_parse_minimal_rule() {
        let raw = parse_one(
            r#"
rules:
  - id: 942100
    msg: "SQL Injection Attack Detected via libinjection"
    action: deny
    operator: libinjection_sqli
    variables: [ARGS, BODY]
"#,
        );
        assert_eq!(raw.id, 942100);
        assert_eq!(raw.action, RuleAction::Deny);
        assert_eq!(raw.default_score, 1);
        let rule = Rule::compile(raw, "test.yaml").unwrap();
        assert_eq!(rule.operator, Operator::LibinjectionSqli);
        assert_eq!(rule.variables.len(), 2);
        assert!(rule.compiled_regex.is_none());
        assert_eq!(rule.effective_score(), 1);
    }

    #[test]
    fn test_parse_header_whitelist_variable() {
        let raw = parse_one(
            r#"
rules:
  - id: 920280
    msg: "Missing Host header"
    action: log
    operator: regex
    pattern: "^$"
    variables:
      - type: HEADERS
        names: [host, user-agent]
"#,
        );
        let rule = Rule::compile(raw, "test.yaml").unwrap();
        assert_eq!(rule.variables[0].var_type, VariableType::Headers);
        assert_eq!(
            rule.variables[0].header_names.as_deref(),
            Some(&["host".to_string(), "user-agent".to_string()][..])
        );
    }

    #[test]
    fn test_header_names_ignored_for_other_types() {
        let raw = parse_one(
            r#"
rules:
  - id: 1
    msg: "names on ARGS is ignored"
    action: deny
    operator: contains
    pattern: "x"
    variables:
      - type: ARGS
        names: [ignored]
"#,
        );
        let rule = Rule::compile(raw, "test.yaml").unwrap();
        assert!(rule.variables[0].header_names.is_none());
    }

    #[test]
    fn test_unknown_operator_falls_back_to_regex() {
        let raw = parse_one(
            r#"
rules:
  - id: 2
    msg: "mystery"
    action: deny
    operator: frobnicate
    pattern: "attack"
    variables: [ARGS]
"#,
        );
        let rule = Rule::compile(raw, "test.yaml").unwrap();
        assert_eq!(rule.operator, Operator::Regex);
        assert!(rule.compiled_regex.is_some());
    }

    #[test]
    fn test_missing_pattern_is_an_error() {
        let raw = parse_one(
            r#"
rules:
  - id: 3
    msg: "no pattern"
    action: deny
    operator: contains
    variables: [ARGS]
"#,
        );
        assert!(Rule::compile(raw, "test.yaml").is_err());
    }

    #[test]
    fn test_bad_regex_keeps_rule_unusable() {
        let raw = parse_one(
            r#"
rules:
  - id: 4
    msg: "broken regex"
    action: deny
    operator: regex
    pattern: "([unclosed"
    variables: [ARGS]
"#,
        );
        let rule = Rule::compile(raw, "test.yaml").unwrap();
        assert!(rule.compiled_regex.is_none());
    }

    #[test]
    fn test_regex_is_case_insensitive() {
        let raw = parse_one(
            r#"
rules:
  - id: 5
    msg: "union select"
    action: deny
    operator: regex
    pattern: "union\\s+select"
    variables: [ARGS]
"#,
        );
        let rule = Rule::compile(raw, "test.yaml").unwrap();
        assert!(rule.compiled_regex.as_ref().unwrap().is_match("UNION SELECT"));
    }

    #[test]
    fn test_unknown_transform_becomes_identity() {
        let raw = parse_one(
            r#"
rules:
  - id: 6
    msg: "odd transform"
    action: deny
    operator: contains
    pattern: "x"
    transforms: [lowercase, sparkle]
    variables: [ARGS]
"#,
        );
        let rule = Rule::compile(raw, "test.yaml").unwrap();
        assert_eq!(rule.transforms, vec![Transform::Lowercase, Transform::None]);
    }

    #[test]
    fn test_effective_score_prefers_explicit() {
        let raw = parse_one(
            r#"
rules:
  - id: 7
    msg: "scored"
    action: deny
    operator: equals
    pattern: "x"
    score: 5
    default_score: 3
    variables: [ARGS]
"#,
        );
        let rule = Rule::compile(raw, "test.yaml").unwrap();
        assert_eq!(rule.effective_score(), 5);
    }

    #[test]
    fn test_rule_roundtrip_preserves_matching() {
        let yaml = r#"
rules:
  - id: 8
    msg: "roundtrip"
    action: deny
    operator: contains
    pattern: "etc/passwd"
    transforms: [url_decode, lowercase]
    variables: [ARGS, REQUEST_LINE]
"#;
        let file: RuleFile = serde_yaml::from_str(yaml).unwrap();
        let serialized = serde_yaml::to_string(&file).unwrap();
        let reparsed: RuleFile = serde_yaml::from_str(&serialized).unwrap();

        let a = Rule::compile(file.rules[0].clone(), "a").unwrap();
        let b = Rule::compile(reparsed.rules[0].clone(), "b").unwrap();
        assert_eq!(a.operator, b.operator);
        assert_eq!(a.pattern, b.pattern);
        assert_eq!(a.transforms, b.transforms);
        assert_eq!(a.variables, b.variables);
    }

    #[test]
    fn test_paranoia_level_carried() {
        let raw = parse_one(
            r#"
rules:
  - id: 9
    msg: "pl2"
    action: deny
    operator: equals
    pattern: "x"
    paranoia_level: 2
    variables: [ARGS]
"#,
        );
        let rule = Rule::compile(raw, "test.yaml").unwrap();
        assert_eq!(rule.paranoia_level, Some(2));
    }
}
