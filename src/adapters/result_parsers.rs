//! Pure result-format parsers, invoked as pure functions over a produced
//! artifact's bytes.
//!
//! Only `json` (a documented internal schema) and `tap` get real
//! implementations here; `junit`, `jest`, `playwright`, and `go_test` are
//! external collaborators and are stubbed with `ParseError::Unsupported` —
//! the calling convention is in scope, the parsers themselves are not.

use std::time::Duration;

use serde::Deserialize;

use crate::domain::models::{ResultFormat, TestOutcome, TestStatus};
use crate::domain::ports::ParseError;

/// Dispatches to the parser named by `format`.
pub fn parse(format: ResultFormat, bytes: &[u8]) -> Result<Vec<TestOutcome>, ParseError> {
    match format {
        ResultFormat::Json => parse_json(bytes),
        ResultFormat::Tap => parse_tap(bytes),
        ResultFormat::Junit | ResultFormat::Jest | ResultFormat::Playwright | ResultFormat::GoTest => {
            Err(ParseError::Unsupported)
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonReport {
    results: Vec<JsonTestResult>,
}

#[derive(Debug, Deserialize)]
struct JsonTestResult {
    test_id: String,
    status: String,
    duration_ms: u64,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    error: Option<String>,
}

/// This crate's internal `json` schema:
/// `{"results": [{"test_id", "status", "duration_ms", "stdout", "stderr", "error"}]}`.
fn parse_json(bytes: &[u8]) -> Result<Vec<TestOutcome>, ParseError> {
    let report: JsonReport =
        serde_json::from_slice(bytes).map_err(|e| ParseError::Malformed(e.to_string()))?;

    report
        .results
        .into_iter()
        .map(|r| {
            let status = match r.status.as_str() {
                "pass" => TestStatus::Pass,
                "fail" => TestStatus::Fail,
                "error" => TestStatus::Error,
                "skipped" => TestStatus::Skipped,
                "cancelled" => TestStatus::Cancelled,
                other => return Err(ParseError::Malformed(format!("unknown status {other}"))),
            };
            Ok(TestOutcome {
                test_id: r.test_id,
                status,
                duration: Duration::from_millis(r.duration_ms),
                stdout: r.stdout,
                stderr: r.stderr,
                retry_attempt: 0,
                error: r.error,
                stack: None,
            })
        })
        .collect()
}

/// Minimal TAP (Test Anything Protocol) parser: reads `ok`/`not ok` lines,
/// e.g. `ok 1 - it adds numbers` / `not ok 2 - it subtracts`.
fn parse_tap(bytes: &[u8]) -> Result<Vec<TestOutcome>, ParseError> {
    let text = std::str::from_utf8(bytes).map_err(|e| ParseError::Malformed(e.to_string()))?;
    let mut outcomes = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("1..") {
            continue;
        }
        let (status, rest) = if let Some(rest) = line.strip_prefix("not ok") {
            (TestStatus::Fail, rest)
        } else if let Some(rest) = line.strip_prefix("ok") {
            (TestStatus::Pass, rest)
        } else {
            continue;
        };

        let rest = rest.trim();
        let number_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let number = &rest[..number_end];
        let description = rest[number_end..].trim_start_matches('-').trim();

        outcomes.push(TestOutcome {
            test_id: if number.is_empty() {
                description.to_string()
            } else {
                number.to_string()
            },
            status,
            duration: Duration::default(),
            stdout: String::new(),
            stderr: String::new(),
            retry_attempt: 0,
            error: if status == TestStatus::Fail {
                Some(description.to_string())
            } else {
                None
            },
            stack: None,
        });
    }

    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_report() {
        let bytes = br#"{"results":[{"test_id":"t1","status":"pass","duration_ms":12}]}"#;
        let outcomes = parse(ResultFormat::Json, bytes).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, TestStatus::Pass);
    }

    #[test]
    fn parses_tap_report() {
        let bytes = b"1..2\nok 1 - adds\nnot ok 2 - subtracts\n";
        let outcomes = parse(ResultFormat::Tap, bytes).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].status, TestStatus::Pass);
        assert_eq!(outcomes[1].status, TestStatus::Fail);
    }

    #[test]
    fn junit_is_unsupported() {
        assert!(matches!(parse(ResultFormat::Junit, b""), Err(ParseError::Unsupported)));
    }
}
