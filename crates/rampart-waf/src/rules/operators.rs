//! Operator dispatch.
//!
//! The operator is resolved to an enum at rule-compile time; matching is a
//! direct enum switch over transformed candidate values. Every match
//! function is total: a rule that lost its regex at compile time simply
//! never matches.

use super::injection;
use super::model::{Operator, Rule};
use super::transforms;

/// Apply the rule's transform chain to `value` and dispatch its operator.
pub fn rule_matches(rule: &Rule, value: &str) -> bool {
    let transformed = transforms::apply_chain(&rule.transforms, value);
    matches_operator(rule, &transformed)
}

fn matches_operator(rule: &Rule, value: &str) -> bool {
    match rule.operator {
        Operator::Regex => match &rule.compiled_regex {
            Some(re) => re.is_match(value),
            None => false,
        },
        Operator::Contains => rule
            .pattern
            .as_deref()
            .map(|p| value.contains(p))
            .unwrap_or(false),
        Operator::StartsWith => rule
            .pattern
            .as_deref()
            .map(|p| value.starts_with(p))
            .unwrap_or(false),
        Operator::EndsWith => rule
            .pattern
            .as_deref()
            .map(|p| value.ends_with(p))
            .unwrap_or(false),
        Operator::Equals => rule
            .pattern
            .as_deref()
            .map(|p| value == p)
            .unwrap_or(false),
        Operator::LibinjectionSqli => injection::is_sqli(value),
        Operator::LibinjectionXss => injection::is_xss(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::{RawRule, RuleFile};

    fn compile(yaml: &str) -> Rule {
        let file: RuleFile = serde_yaml::from_str(yaml).unwrap();
        let raw: RawRule = file.rules.into_iter().next().unwrap();
        Rule::compile(raw, "test.yaml").unwrap()
    }

    #[test]
    fn test_contains() {
        let rule = compile(
            r#"
rules:
  - id: 1
    msg: "path traversal"
    action: deny
    operator: contains
    pattern: "../"
    variables: [REQUEST_LINE]
"#,
        );
        assert!(rule_matches(&rule, "GET /../../etc/passwd HTTP/1.1"));
        assert!(!rule_matches(&rule, "GET /index.html HTTP/1.1"));
    }

    #[test]
    fn test_starts_and_ends_with() {
        let starts = compile(
            r#"
rules:
  - id: 2
    msg: "admin prefix"
    action: deny
    operator: starts_with
    pattern: "/admin"
    variables: [REQUEST_FILENAME]
"#,
        );
        assert!(rule_matches(&starts, "/admin/users"));
        assert!(!rule_matches(&starts, "/api/admin"));

        let ends = compile(
            r#"
rules:
  - id: 3
    msg: "php upload"
    action: deny
    operator: ends_with
    pattern: ".php"
    variables: [REQUEST_BASENAME]
"#,
        );
        assert!(rule_matches(&ends, "shell.php"));
        assert!(!rule_matches(&ends, "shell.php.txt"));
    }

    #[test]
    fn test_equals_is_exact() {
        let rule = compile(
            r#"
rules:
  - id: 4
    msg: "exact"
    action: deny
    operator: equals
    pattern: "true"
    variables: [ARGS]
"#,
        );
        assert!(rule_matches(&rule, "true"));
        assert!(!rule_matches(&rule, "true "));
        assert!(!rule_matches(&rule, "TRUE"));
    }

    #[test]
    fn test_regex_case_insensitive() {
        let rule = compile(
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
        assert!(rule_matches(&rule, "UNION   SELECT"));
        assert!(rule_matches(&rule, "union select"));
        assert!(!rule_matches(&rule, "onion select"));
    }

    #[test]
    fn test_transforms_run_before_match() {
        let rule = compile(
            r#"
rules:
  - id: 6
    msg: "decoded traversal"
    action: deny
    operator: contains
    pattern: "../"
    transforms: [url_decode]
    variables: [REQUEST_LINE]
"#,
        );
        assert!(rule_matches(&rule, "%2e%2e%2fetc"));
    }

    #[test]
    fn test_libinjection_operators() {
        let sqli = compile(
            r#"
rules:
  - id: 942100
    msg: "SQLi"
    action: deny
    operator: libinjection_sqli
    variables: [ARGS]
"#,
        );
        assert!(rule_matches(&sqli, "1' OR '1'='1"));
        assert!(!rule_matches(&sqli, "plain value"));

        let xss = compile(
            r#"
rules:
  - id: 941100
    msg: "XSS"
    action: deny
    operator: libinjection_xss
    variables: [ARGS]
"#,
        );
        assert!(rule_matches(&xss, "<script>alert(1)</script>"));
        assert!(!rule_matches(&xss, "plain value"));
    }

    #[test]
    fn test_dead_regex_never_matches() {
        let rule = compile(
            r#"
rules:
  - id: 7
    msg: "broken"
    action: deny
    operator: regex
    pattern: "([bad"
    variables: [ARGS]
"#,
        );
        assert!(!rule_matches(&rule, "anything"));
        assert!(!rule_matches(&rule, "([bad"));
    }
}
