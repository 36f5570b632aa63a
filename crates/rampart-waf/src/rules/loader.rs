//! Rule file loading and hot-reload detection.
//!
//! `load()` walks the rule directory recursively, parses every `*.yaml`
//! file, and publishes a new snapshot through the holder. A file that fails
//! to parse is logged and skipped; it never aborts the load.
//! `check_and_reload()` is bounded: a directory walk plus mtime reads, no
//! parsing unless something changed.

use super::model::{Rule, RuleFile};
use super::snapshot::{RuleSnapshot, SnapshotHolder};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Loads rule files and tracks their mtimes for change detection.
pub struct RuleLoader {
    dir: PathBuf,
    holder: Arc<SnapshotHolder>,
    /// mtime per file at the last successful load.
    known_files: Mutex<HashMap<PathBuf, SystemTime>>,
}

/// Outcome of a validation dry-run.
#[derive(Debug)]
pub struct ValidationReport {
    pub files_ok: usize,
    pub files_failed: usize,
    pub rules_loaded: usize,
    pub rules_skipped: usize,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.files_failed == 0 && self.rules_skipped == 0
    }
}

impl RuleLoader {
    pub fn new<P: Into<PathBuf>>(dir: P, holder: Arc<SnapshotHolder>) -> Self {
        Self {
            dir: dir.into(),
            holder,
            known_files: Mutex::new(HashMap::new()),
        }
    }

    pub fn holder(&self) -> &Arc<SnapshotHolder> {
        &self.holder
    }

    /// Load every rule file and publish a new snapshot. Returns the
    /// published snapshot.
    pub fn load(&self) -> Arc<RuleSnapshot> {
        let files = collect_rule_files(&self.dir);
        let mut rules: Vec<Arc<Rule>> = Vec::new();
        let mut checksums = HashMap::new();
        let mut mtimes = HashMap::new();
        let mut skipped = 0usize;

        for path in &files {
            let content = match std::fs::read_to_string(path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "failed to read rule file, skipping");
                    continue;
                }
            };

            if let Ok(meta) = std::fs::metadata(path) {
                if let Ok(mtime) = meta.modified() {
                    mtimes.insert(path.clone(), mtime);
                }
            }
            checksums.insert(path.clone(), fnv1a(content.as_bytes()));

            let file: RuleFile = match serde_yaml::from_str(&content) {
                Ok(f) => f,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "failed to parse rule file, skipping");
                    continue;
                }
            };

            let source = path.display().to_string();
            for raw in file.rules {
                let id = raw.id;
                match Rule::compile(raw, &source) {
                    Ok(rule) => rules.push(Arc::new(rule)),
                    Err(reason) => {
                        warn!(rule_id = id, file = %source, %reason, "skipping invalid rule");
                        skipped += 1;
                    }
                }
            }
        }

        let snapshot = self.holder.swap_with(|version| RuleSnapshot {
            rules,
            version,
            created_at: Utc::now(),
            file_checksums: checksums,
        });

        *self.known_files.lock() = mtimes;

        info!(
            version = snapshot.version,
            rules = snapshot.rule_count(),
            files = files.len(),
            skipped,
            "rule snapshot published"
        );
        snapshot
    }

    /// Reload when the directory changed since the last load. Bounded:
    /// walks the directory and stats files, nothing else on the no-change
    /// path. Returns true when a reload happened.
    pub fn check_and_reload(&self) -> bool {
        if !self.has_changes() {
            return false;
        }
        debug!(dir = %self.dir.display(), "rule directory changed, reloading");
        self.load();
        true
    }

    fn has_changes(&self) -> bool {
        let files = collect_rule_files(&self.dir);
        let known = self.known_files.lock();

        if files.len() != known.len() {
            return true;
        }
        for path in &files {
            match known.get(path) {
                None => return true, // new file
                Some(prev_mtime) => {
                    let current = std::fs::metadata(path).and_then(|m| m.modified()).ok();
                    if current.as_ref() != Some(prev_mtime) {
                        return true; // touched or unreadable
                    }
                }
            }
        }
        false
    }

    /// Parse the directory without publishing. Used to reject a broken rule
    /// set before swapping.
    pub fn validate<P: AsRef<Path>>(dir: P) -> ValidationReport {
        let files = collect_rule_files(dir.as_ref());
        let mut report = ValidationReport {
            files_ok: 0,
            files_failed: 0,
            rules_loaded: 0,
            rules_skipped: 0,
            errors: Vec::new(),
        };

        for path in &files {
            let content = match std::fs::read_to_string(path) {
                Ok(c) => c,
                Err(e) => {
                    report.files_failed += 1;
                    report.errors.push(format!("{}: {}", path.display(), e));
                    continue;
                }
            };
            let file: RuleFile = match serde_yaml::from_str(&content) {
                Ok(f) => f,
                Err(e) => {
                    report.files_failed += 1;
                    report.errors.push(format!("{}: {}", path.display(), e));
                    continue;
                }
            };
            report.files_ok += 1;
            let source = path.display().to_string();
            for raw in file.rules {
                match Rule::compile(raw, &source) {
                    Ok(_) => report.rules_loaded += 1,
                    Err(reason) => {
                        report.rules_skipped += 1;
                        report.errors.push(format!("{source}: {reason}"));
                    }
                }
            }
        }
        report
    }
}

/// Every `*.yaml`/`*.yml` under `dir`, recursively, sorted by path for a
/// stable evaluation order.
fn collect_rule_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    collect_into(dir, &mut files);
    files.sort();
    files
}

fn collect_into(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_into(&path, out);
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            out.push(path);
        }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_rules(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    const GOOD_RULES: &str = r#"
rules:
  - id: 942100
    msg: "SQLi"
    action: deny
    operator: libinjection_sqli
    variables: [ARGS, BODY]
  - id: 941100
    msg: "XSS"
    action: deny
    operator: libinjection_xss
    variables: [ARGS]
"#;

    #[test]
    fn test_load_publishes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(dir.path(), "core.yaml", GOOD_RULES);

        let holder = Arc::new(SnapshotHolder::new());
        let loader = RuleLoader::new(dir.path(), Arc::clone(&holder));
        let snap = loader.load();

        assert_eq!(snap.version, 1);
        assert_eq!(snap.rule_count(), 2);
        assert_eq!(snap.rules[0].id, 942100);
        assert_eq!(holder.current().version, 1);
        assert_eq!(snap.file_checksums.len(), 1);
    }

    #[test]
    fn test_broken_file_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(dir.path(), "a_good.yaml", GOOD_RULES);
        write_rules(dir.path(), "b_broken.yaml", "rules: [ {{{{ not yaml");

        let loader = RuleLoader::new(dir.path(), Arc::new(SnapshotHolder::new()));
        let snap = loader.load();
        assert_eq!(snap.rule_count(), 2);
    }

    #[test]
    fn test_invalid_rule_skipped_within_file() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(
            dir.path(),
            "mixed.yaml",
            r#"
rules:
  - id: 1
    msg: "no pattern for contains"
    action: deny
    operator: contains
    variables: [ARGS]
  - id: 2
    msg: "fine"
    action: deny
    operator: equals
    pattern: "x"
    variables: [ARGS]
"#,
        );

        let loader = RuleLoader::new(dir.path(), Arc::new(SnapshotHolder::new()));
        let snap = loader.load();
        assert_eq!(snap.rule_count(), 1);
        assert_eq!(snap.rules[0].id, 2);
    }

    #[test]
    fn test_recursive_walk_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        write_rules(
            dir.path(),
            "z.yaml",
            r#"{rules: [{id: 30, msg: z, action: deny, operator: equals, pattern: z, variables: [ARGS]}]}"#,
        );
        write_rules(
            &dir.path().join("sub"),
            "a.yaml",
            r#"{rules: [{id: 10, msg: a, action: deny, operator: equals, pattern: a, variables: [ARGS]}]}"#,
        );

        let loader = RuleLoader::new(dir.path(), Arc::new(SnapshotHolder::new()));
        let snap = loader.load();
        // "sub/a.yaml" sorts before "z.yaml"
        assert_eq!(snap.rules[0].id, 10);
        assert_eq!(snap.rules[1].id, 30);
    }

    #[test]
    fn test_no_change_means_no_reload() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(dir.path(), "core.yaml", GOOD_RULES);

        let holder = Arc::new(SnapshotHolder::new());
        let loader = RuleLoader::new(dir.path(), Arc::clone(&holder));
        loader.load();

        assert!(!loader.check_and_reload());
        assert!(!loader.check_and_reload());
        assert_eq!(holder.current().version, 1);
    }

    #[test]
    fn test_new_file_triggers_reload() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(dir.path(), "core.yaml", GOOD_RULES);

        let holder = Arc::new(SnapshotHolder::new());
        let loader = RuleLoader::new(dir.path(), Arc::clone(&holder));
        loader.load();

        write_rules(
            dir.path(),
            "extra.yaml",
            r#"{rules: [{id: 99, msg: extra, action: log, operator: equals, pattern: q, variables: [ARGS]}]}"#,
        );
        assert!(loader.check_and_reload());
        assert_eq!(holder.current().version, 2);
        assert_eq!(holder.current().rule_count(), 3);
    }

    #[test]
    fn test_removed_file_triggers_reload() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(dir.path(), "core.yaml", GOOD_RULES);
        let extra = write_rules(
            dir.path(),
            "extra.yaml",
            r#"{rules: [{id: 99, msg: extra, action: log, operator: equals, pattern: q, variables: [ARGS]}]}"#,
        );

        let holder = Arc::new(SnapshotHolder::new());
        let loader = RuleLoader::new(dir.path(), Arc::clone(&holder));
        loader.load();
        assert_eq!(holder.current().rule_count(), 3);

        std::fs::remove_file(extra).unwrap();
        assert!(loader.check_and_reload());
        assert_eq!(holder.current().rule_count(), 2);
    }

    #[test]
    fn test_validate_reports_without_publishing() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(dir.path(), "good.yaml", GOOD_RULES);
        write_rules(dir.path(), "bad.yaml", "not: [valid, rules");

        let report = RuleLoader::validate(dir.path());
        assert_eq!(report.files_ok, 1);
        assert_eq!(report.files_failed, 1);
        assert_eq!(report.rules_loaded, 2);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_missing_dir_loads_empty() {
        let holder = Arc::new(SnapshotHolder::new());
        let loader = RuleLoader::new("/nonexistent/rampart-rules", Arc::clone(&holder));
        let snap = loader.load();
        assert_eq!(snap.rule_count(), 0);
        assert_eq!(snap.version, 1);
    }
}
