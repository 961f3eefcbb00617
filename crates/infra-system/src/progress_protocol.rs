//! Worker stdout line protocol.
//!
//! Three kinds of progress line are recognised; anything else is plain
//! output that only matters for result extraction once the worker exits.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use vidforge_core::domain::ProgressUpdate;

static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*PROGRESS:\s*(\d{1,3})\s*$").expect("valid regex"));

static STEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(?:\[STEP\]|STEP:)\s*(.+?)\s*$").expect("valid regex"));

static TRANSFER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)%").expect("valid regex"));

static SPEED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bat\s+(\S+/s)").expect("valid regex"));

static ETA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bETA\s+(\S+)").expect("valid regex"));

/// Decode one stdout line. Bare markers win over step markers, which win
/// over transfer lines.
pub fn parse_line(line: &str) -> Option<ProgressUpdate> {
    if let Some(caps) = PERCENT_RE.captures(line) {
        let value: u32 = caps[1].parse().ok()?;
        return Some(ProgressUpdate::Percent(value.min(100) as u8));
    }

    if let Some(caps) = STEP_RE.captures(line) {
        return Some(ProgressUpdate::Step(caps[1].to_string()));
    }

    let caps = TRANSFER_RE.captures(line)?;
    let value: f64 = caps[1].parse().ok()?;
    // A transfer at 0% or 100% is not the end of the job
    let percent = value.floor().clamp(1.0, 99.0) as u8;
    let speed = SPEED_RE.captures(line).map(|c| c[1].to_string());
    let eta = ETA_RE.captures(line).map(|c| c[1].to_string());
    Some(ProgressUpdate::Transfer {
        percent,
        speed,
        eta,
    })
}

/// Result of a successful run: the first JSON object in stdout, or the
/// trimmed raw text when there is none. The flag is true for the former.
pub fn extract_result(stdout: &str) -> (Value, bool) {
    for (start, _) in stdout.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&stdout[start..]).into_iter::<Value>();
        if let Some(Ok(value @ Value::Object(_))) = stream.next() {
            return (value, true);
        }
    }
    (Value::String(stdout.trim().to_string()), false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bare_marker() {
        assert_eq!(parse_line("PROGRESS: 42"), Some(ProgressUpdate::Percent(42)));
        assert_eq!(parse_line("  PROGRESS:7  "), Some(ProgressUpdate::Percent(7)));
        assert_eq!(parse_line("PROGRESS: 250"), Some(ProgressUpdate::Percent(100)));
        assert_eq!(parse_line("PROGRESS: 0"), Some(ProgressUpdate::Percent(0)));
    }

    #[test]
    fn test_step_marker() {
        assert_eq!(
            parse_line("[STEP] Translating subtitles"),
            Some(ProgressUpdate::Step("Translating subtitles".to_string()))
        );
        assert_eq!(
            parse_line("step: tts"),
            Some(ProgressUpdate::Step("tts".to_string()))
        );
        // step names may contain a percent sign without becoming transfers
        assert_eq!(
            parse_line("[step] mixing 50% volume"),
            Some(ProgressUpdate::Step("mixing 50% volume".to_string()))
        );
    }

    #[test]
    fn test_transfer_line() {
        assert_eq!(
            parse_line("[download]  45.3% of 12.00MiB at 1.20MiB/s ETA 00:05"),
            Some(ProgressUpdate::Transfer {
                percent: 45,
                speed: Some("1.20MiB/s".to_string()),
                eta: Some("00:05".to_string()),
            })
        );
        assert_eq!(
            parse_line("[download] 100% of 12.00MiB"),
            Some(ProgressUpdate::Transfer {
                percent: 99,
                speed: None,
                eta: None,
            })
        );
        assert_eq!(
            parse_line("[download]   0.0% of ~3MiB"),
            Some(ProgressUpdate::Transfer {
                percent: 1,
                speed: None,
                eta: None,
            })
        );
    }

    #[test]
    fn test_plain_lines_are_ignored() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("Extracting URL"), None);
        assert_eq!(parse_line("{\"ok\": true}"), None);
    }

    #[test]
    fn test_extract_first_json_object() {
        let stdout = "PROGRESS: 10\nnoise {not json\n{\"file\": \"a.mp4\", \"size\": 3}\n{\"second\": 1}\n";
        assert_eq!(
            extract_result(stdout),
            (json!({"file": "a.mp4", "size": 3}), true)
        );
    }

    #[test]
    fn test_extract_falls_back_to_raw_output() {
        assert_eq!(
            extract_result("  done\n"),
            (Value::String("done".to_string()), false)
        );
        assert_eq!(extract_result(""), (Value::String(String::new()), false));
    }
}
