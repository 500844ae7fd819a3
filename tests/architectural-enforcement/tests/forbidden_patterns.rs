//! Integration Test: Forbidden Patterns in Production Code
//!
//! **Policy**: the transport library and daemon must propagate errors
//! instead of panicking, must not block the async runtime with thread
//! sleeps, and must log through `tracing` rather than printing to stdout.
//!
//! Test code is exempt: scanning stops at the first `#[cfg(test)]`
//! marker in each file, and comment lines are skipped.

use std::path::{Path, PathBuf};

/// Patterns that must not appear in production code.
const FORBIDDEN: &[(&str, &str)] = &[
    (".unwrap()", "propagate errors with `?` instead of unwrapping"),
    (".expect(", "propagate errors with `?` instead of expecting"),
    ("std::thread::sleep", "use tokio::time::sleep in async code"),
    ("println!", "log through tracing, not stdout"),
    ("print!", "log through tracing, not stdout"),
];

/// Production source directories, relative to the workspace root.
const PRODUCTION_DIRS: &[&str] = &["courier/core/src", "courier/daemon/src"];

fn workspace_root() -> PathBuf {
    // tests/architectural-enforcement -> workspace root
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root resolves")
}

/// Scan one file for violations, ignoring comments and test modules.
fn check_file(path: &Path, violations: &mut Vec<String>) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };

    for (line_number, line) in content.lines().enumerate() {
        // Everything from the first test module down is exempt.
        if line.contains("#[cfg(test)]") {
            break;
        }
        let trimmed = line.trim_start();
        if trimmed.starts_with("//") {
            continue;
        }
        for (pattern, hint) in FORBIDDEN {
            if trimmed.contains(pattern) {
                violations.push(format!(
                    "{}:{}: `{}` ({})",
                    path.display(),
                    line_number + 1,
                    pattern,
                    hint
                ));
            }
        }
    }
}

fn find_violations() -> Vec<String> {
    let root = workspace_root();
    let mut violations = Vec::new();

    for dir in PRODUCTION_DIRS {
        let dir = root.join(dir);
        assert!(
            dir.exists(),
            "production directory {} is missing",
            dir.display()
        );
        for entry in walkdir::WalkDir::new(&dir)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
                check_file(entry.path(), &mut violations);
            }
        }
    }

    violations
}

#[test]
fn test_no_forbidden_patterns_in_production_code() {
    let violations = find_violations();

    if !violations.is_empty() {
        eprintln!("\nForbidden patterns found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        panic!(
            "\nFound {} forbidden pattern violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}
