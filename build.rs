use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Only the crate's own sources are policed.
const SOURCE_DIRS: [&str; 4] = ["recommend", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED", "CORRECTED", "FIX", "FIXES", "NEW", "CHANGED", "CHANGES", "CHANGE", "MODIFIED",
    "MODIFIES", "MODIFY", "UPDATED", "UPDATES", "UPDATE",
];

/// One policy rule: a line regex plus a filter deciding whether a matching line is a
/// real violation.
struct Rule {
    name: &'static str,
    pattern: &'static str,
    advice: &'static str,
    is_violation: fn(&str) -> bool,
}

// Collects every violating line of a single file.
struct ViolationCollector {
    violations: Vec<String>,
    is_violation: fn(&str) -> bool,
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        if (self.is_violation)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }

        // Keep searching the rest of the file.
        Ok(true)
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let rules = [
        Rule {
            name: "underscore-prefixed variables",
            pattern: r"\b(_[a-zA-Z0-9_]+)\b",
            advice: "Either use the variable (removing the underscore) or remove it completely.",
            is_violation: is_underscore_binding,
        },
        Rule {
            name: "forbidden comment patterns",
            pattern: r"(//|/\*).*",
            advice: "Comments must describe the code, not its edit history, must not be all caps, \
                     and may only use '**' inside doc comments.",
            is_violation: is_forbidden_comment,
        },
        Rule {
            name: "#[allow(dead_code)] attributes",
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
            advice: "Either use the code (removing the attribute) or remove it completely.",
            is_violation: |_| true,
        },
    ];

    let files = rust_sources();
    for rule in &rules {
        if let Err(e) = check_rule(rule, &files) {
            // The `eprintln!` is what shows the message in `cargo`'s output.
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

fn rust_sources() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.path().to_path_buf())
        .collect()
}

fn check_rule(rule: &Rule, files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
    let mut searcher = Searcher::new();

    for path in files {
        let mut collector = ViolationCollector {
            violations: Vec::new(),
            is_violation: rule.is_violation,
        };
        searcher.search_path(&matcher, path, &mut collector)?;

        if !collector.violations.is_empty() {
            return Err(format_violations(rule, path, &collector.violations).into());
        }
    }
    Ok(())
}

fn format_violations(rule: &Rule, path: &Path, violations: &[String]) -> String {
    let mut error_msg = format!(
        "\n❌ ERROR: Found {} {} in {}:\n",
        violations.len(),
        rule.name,
        path.display()
    );
    for violation in violations {
        error_msg.push_str(&format!("   {violation}\n"));
    }
    error_msg.push_str(&format!(
        "\n⚠️ {} are STRICTLY FORBIDDEN in this project.\n   {}\n",
        rule.name, rule.advice
    ));
    error_msg
}

fn is_underscore_binding(line: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.starts_with("//") || trimmed.starts_with("/*") {
        return false;
    }
    // Underscores inside string literals are text, not bindings.
    let outside_strings: String = line
        .split('"')
        .step_by(2)
        .collect::<Vec<_>>()
        .join(" ");
    outside_strings
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .any(|word| word.len() > 1 && word.starts_with('_'))
}

fn comment_text(line: &str) -> Option<(&str, bool)> {
    let trimmed = line.trim_start();
    if let Some(doc) = trimmed.strip_prefix("///").or_else(|| trimmed.strip_prefix("//!")) {
        return Some((doc.trim(), true));
    }
    if let Some(idx) = line.find("/*") {
        let rest = &line[idx + 2..];
        let end = rest.find("*/").unwrap_or(rest.len());
        return Some((rest[..end].trim(), false));
    }
    line.find("//").map(|idx| (line[idx + 2..].trim(), false))
}

fn is_forbidden_comment(line: &str) -> bool {
    let Some((text, is_doc)) = comment_text(line) else {
        return false;
    };

    let has_forbidden_word = FORBIDDEN_WORDS.iter().any(|word| text.contains(word));
    let has_stars = !is_doc && text.contains("**");
    let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
    let all_caps = letters.peek().is_some() && letters.all(char::is_uppercase);

    has_forbidden_word || has_stars || all_caps
}
