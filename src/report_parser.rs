//! Report Parser & Scoring (C6).
//!
//! Turns the assistant subprocess's free-text report for one batch into
//! structured [`Issue`] values. The expected shape is a sequence of
//! markdown-ish issue blocks:
//!
//! ```text
//! ## [CRITICAL] SQL injection via string-built query
//! File: src/db.rs:42
//! Description: user input is concatenated directly into the query string.
//! Suggestion: use a parameterized query.
//! Category: security
//! ```
//!
//! When a block omits an explicit `[SEVERITY]` tag, severity falls back to
//! keyword matching against the issue title - the same keyword ladder the
//! teacher's `code_review.rs::determine_severity` uses, generalized from a
//! fixed five-level enum to this crate's four-level [`Severity`].
//!
//! Assistants that reason before answering sometimes wrap scratch work in
//! `<think>...</think>` or `[think]...[/think]`; that's stripped before
//! parsing so it never leaks into a title or description.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{Issue, Severity};

static THINK_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<think>.*?</think>|\[think\].*?\[/think\]").unwrap()
});

static ISSUE_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^(?:##\s*(?:\[(CRITICAL|WARNING|SUGGESTION|INFO)\]\s*)?|(?:问题|Issue)\s*\d+[:：]\s*)(.+)$",
    )
    .unwrap()
});

static FILE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)^File:\s*(?P<path>[^\s:][^\n:]*?)(?::(?P<line>\d+))?\s*$").unwrap()
});

static DESCRIPTION_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?mi)^Description:\s*(.+)$").unwrap());

static SUGGESTION_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?mi)^Suggestion:\s*(.+)$").unwrap());

static CATEGORY_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?mi)^Category:\s*(.+)$").unwrap());

static VERDICT_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?mi)^Verdict:\s*(.+)$").unwrap());

fn strip_think_blocks(text: &str) -> String {
    THINK_BLOCK.replace_all(text, "").to_string()
}

/// Keyword-based severity fallback for issue blocks without an explicit
/// `[SEVERITY]` tag, ordered most to least severe.
fn severity_from_keywords(title: &str) -> Severity {
    let lower = title.to_lowercase();

    if lower.contains("sql injection")
        || lower.contains("xss")
        || lower.contains("csrf")
        || lower.contains("authentication bypass")
        || lower.contains("remote code execution")
    {
        return Severity::Critical;
    }

    if lower.contains("security")
        || lower.contains("vulnerability")
        || lower.contains("unsafe")
        || lower.contains("panic")
        || lower.contains("unwrap")
        || lower.contains("data loss")
    {
        return Severity::Warning;
    }

    if lower.contains("error handling")
        || lower.contains("complexity")
        || lower.contains("performance")
        || lower.contains("refactor")
        || lower.contains("naming")
    {
        return Severity::Suggestion;
    }

    Severity::Info
}

/// Parse one batch's raw assistant output into issues for `task_id`. Issue
/// IDs are freshly generated per parse; callers that need stable IDs across
/// re-parses should persist the returned issues rather than re-parsing.
pub fn parse_batch_report(task_id: &str, raw: &str) -> Vec<Issue> {
    let cleaned = strip_think_blocks(raw);
    let headers: Vec<_> = ISSUE_HEADER.captures_iter(&cleaned).collect();

    let mut issues = Vec::new();

    for (i, cap) in headers.iter().enumerate() {
        let start = cap.get(0).unwrap().end();
        let end = headers
            .get(i + 1)
            .map(|next| next.get(0).unwrap().start())
            .unwrap_or(cleaned.len());
        let block = &cleaned[start..end];

        let title = cap.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default();
        if title.is_empty() {
            continue;
        }

        let severity = match cap.get(1).map(|m| m.as_str()) {
            Some("CRITICAL") => Severity::Critical,
            Some("WARNING") => Severity::Warning,
            Some("SUGGESTION") => Severity::Suggestion,
            Some("INFO") => Severity::Info,
            _ => severity_from_keywords(&title),
        };

        let (file_path, line_number) = FILE_LINE
            .captures(block)
            .map(|c| {
                let path = c.name("path").map(|m| m.as_str().trim().to_string());
                let line = c
                    .name("line")
                    .and_then(|m| m.as_str().parse::<i64>().ok());
                (path, line)
            })
            .unwrap_or((None, None));

        let description = DESCRIPTION_LINE
            .captures(block)
            .map(|c| c.get(1).unwrap().as_str().trim().to_string())
            .unwrap_or_default();

        let suggestion = SUGGESTION_LINE
            .captures(block)
            .map(|c| c.get(1).unwrap().as_str().trim().to_string());

        let category = CATEGORY_LINE
            .captures(block)
            .map(|c| c.get(1).unwrap().as_str().trim().to_string());

        issues.push(Issue {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            severity,
            title,
            description,
            file_path,
            line_number,
            code_snippet: None,
            suggestion,
            category,
        });
    }

    issues
}

/// Extract an overall verdict line (`Verdict: ...`) from a batch report, if
/// the assistant emitted one. Later batches' verdicts overwrite earlier
/// ones when merged by [`merge_reports`].
pub fn parse_verdict(raw: &str) -> Option<String> {
    let cleaned = strip_think_blocks(raw);
    VERDICT_LINE
        .captures(&cleaned)
        .map(|c| c.get(1).unwrap().as_str().trim().to_string())
}

/// Merge issues from every batch of a task: dedup by `(file, line, title)`
/// so an assistant that re-flags the same line across overlapping batches
/// doesn't inflate the issue count. Order is preserved as appearance order
/// in the merged report - `retain` never reorders.
pub fn merge_issues(mut all: Vec<Issue>) -> Vec<Issue> {
    let mut seen = std::collections::HashSet::new();
    all.retain(|issue| {
        let key = (
            issue.file_path.clone(),
            issue.line_number,
            issue.title.to_lowercase(),
        );
        seen.insert(key)
    });
    all
}

/// Whether `raw` contains any recognizable issue-heading marker, regardless
/// of whether a block under it actually yielded an [`Issue`]. Used to tell
/// "genuinely clean review" apart from "report in a format we can't parse."
pub fn contains_issue_markers(raw: &str) -> bool {
    let cleaned = strip_think_blocks(raw);
    ISSUE_HEADER.is_match(&cleaned)
}

/// Concatenate per-batch raw reports into one report with batch separators,
/// for storage on the task's `report` field.
pub fn concat_reports(batch_reports: &[(usize, String)]) -> String {
    let mut sorted = batch_reports.to_vec();
    sorted.sort_by_key(|(index, _)| *index);

    sorted
        .into_iter()
        .map(|(index, text)| format!("--- batch {index} ---\n{}", strip_think_blocks(&text)))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
<think>
internal scratch work the user never sees
</think>

## [CRITICAL] SQL injection via string-built query
File: src/db.rs:42
Description: user input is concatenated directly into the query string.
Suggestion: use a parameterized query.
Category: security

## Unused import
File: src/lib.rs
Description: the `std::fmt` import is never used.
Category: style

Verdict: needs changes before merge
"#;

    #[test]
    fn parses_explicit_and_inferred_severities() {
        let issues = parse_batch_report("t1", SAMPLE);
        assert_eq!(issues.len(), 2);

        let sql = issues.iter().find(|i| i.title.contains("SQL injection")).unwrap();
        assert_eq!(sql.severity, Severity::Critical);
        assert_eq!(sql.file_path.as_deref(), Some("src/db.rs"));
        assert_eq!(sql.line_number, Some(42));
        assert_eq!(sql.suggestion.as_deref(), Some("use a parameterized query."));

        let unused = issues.iter().find(|i| i.title.contains("Unused import")).unwrap();
        assert_eq!(unused.severity, Severity::Info);
        assert_eq!(unused.file_path.as_deref(), Some("src/lib.rs"));
        assert_eq!(unused.line_number, None);
    }

    #[test]
    fn think_blocks_never_leak_into_issues() {
        let issues = parse_batch_report("t1", SAMPLE);
        for issue in &issues {
            assert!(!issue.description.contains("scratch work"));
            assert!(!issue.title.contains("scratch work"));
        }
    }

    #[test]
    fn extracts_verdict_line() {
        let verdict = parse_verdict(SAMPLE);
        assert_eq!(verdict.as_deref(), Some("needs changes before merge"));
    }

    #[test]
    fn merge_issues_dedups_by_file_line_title() {
        let base = Issue {
            id: "a".to_string(),
            task_id: "t1".to_string(),
            severity: Severity::Warning,
            title: "Possible panic".to_string(),
            description: "first batch".to_string(),
            file_path: Some("src/x.rs".to_string()),
            line_number: Some(10),
            code_snippet: None,
            suggestion: None,
            category: None,
        };
        let mut dup = base.clone();
        dup.id = "b".to_string();
        dup.description = "second batch, same finding".to_string();

        let merged = merge_issues(vec![base, dup]);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn merge_issues_preserves_appearance_order() {
        let low = Issue {
            id: "a".to_string(),
            task_id: "t1".to_string(),
            severity: Severity::Info,
            title: "style nit".to_string(),
            description: String::new(),
            file_path: None,
            line_number: None,
            code_snippet: None,
            suggestion: None,
            category: None,
        };
        let mut high = low.clone();
        high.id = "b".to_string();
        high.severity = Severity::Critical;
        high.title = "rce".to_string();

        let merged = merge_issues(vec![low.clone(), high.clone()]);
        assert_eq!(merged[0].title, low.title);
        assert_eq!(merged[1].title, high.title);
    }

    #[test]
    fn recognizes_issue_n_heading_convention() {
        let raw = "Issue 1: Missing input validation\nFile: src/api.rs:10\nDescription: unchecked body.\n";
        assert!(contains_issue_markers(raw));
        let issues = parse_batch_report("t1", raw);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].title, "Missing input validation");
    }

    #[test]
    fn concat_reports_orders_by_batch_index() {
        let reports = vec![
            (1, "second".to_string()),
            (0, "first".to_string()),
        ];
        let combined = concat_reports(&reports);
        let first_pos = combined.find("first").unwrap();
        let second_pos = combined.find("second").unwrap();
        assert!(first_pos < second_pos);
    }
}
