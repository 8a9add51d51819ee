//! The job-script result protocol.
//!
//! A trial script reports its final score by printing a single tagged line
//! to stdout:
//!
//! ```text
//! #hypersweep:0.8731
//! ```
//!
//! Multi-objective scripts may print a comma-separated list; the first value
//! is the primary score.  Intermediate scores (for early stopping and
//! progress curves) use a distinct tag so they can never be mistaken for the
//! final result:
//!
//! ```text
//! #hypersweep-interm:0.41
//! ```
//!
//! A run whose output contains no final marker, or that exits non-zero, is
//! treated as failed.

/// Tag for the final score line.
pub const RESULT_MARKER: &str = "#hypersweep:";

/// Tag for intermediate score lines.
pub const INTERM_MARKER: &str = "#hypersweep-interm:";

fn parse_scores(payload: &str) -> Option<Vec<f64>> {
    let scores: Result<Vec<f64>, _> = payload
        .trim()
        .split(',')
        .map(|tok| tok.trim().parse::<f64>())
        .collect();
    scores.ok().filter(|s| !s.is_empty())
}

/// Parse one line of script output as a final result.
pub fn parse_final_line(line: &str) -> Option<Vec<f64>> {
    line.find(RESULT_MARKER)
        .and_then(|pos| parse_scores(&line[pos + RESULT_MARKER.len()..]))
}

/// Parse one line of script output as an intermediate result.
pub fn parse_interm_line(line: &str) -> Option<f64> {
    line.find(INTERM_MARKER)
        .and_then(|pos| parse_scores(&line[pos + INTERM_MARKER.len()..]))
        .map(|scores| scores[0])
}

/// Scan a full captured output for the final result.  The first final
/// marker wins; anything after it belongs to script teardown chatter.
pub fn parse_result(output: &str) -> Option<Vec<f64>> {
    output.lines().find_map(parse_final_line)
}

/// Render a final-result line, the counterpart of [`parse_result`].
/// Trial scripts (and tests) use this to talk back to the scheduler.
pub fn format_result(scores: &[f64]) -> String {
    let rendered: Vec<String> = scores.iter().map(|s| s.to_string()).collect();
    format!("{}{}", RESULT_MARKER, rendered.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_score() {
        assert_eq!(parse_result("#hypersweep:0.25"), Some(vec![0.25]));
    }

    #[test]
    fn parses_score_list() {
        assert_eq!(
            parse_result("#hypersweep:0.25, 1.5,-3"),
            Some(vec![0.25, 1.5, -3.0])
        );
    }

    #[test]
    fn skips_unrelated_lines() {
        let output = "epoch 1 done\nsome noise\n#hypersweep:0.9\nbye";
        assert_eq!(parse_result(output), Some(vec![0.9]));
    }

    #[test]
    fn interm_marker_is_not_a_final_result() {
        let output = "#hypersweep-interm:0.1\n#hypersweep-interm:0.2";
        assert_eq!(parse_result(output), None);
        assert_eq!(parse_interm_line("#hypersweep-interm:0.2"), Some(0.2));
    }

    #[test]
    fn garbage_payload_is_rejected() {
        assert_eq!(parse_result("#hypersweep:not-a-number"), None);
        assert_eq!(parse_result("#hypersweep:"), None);
    }

    #[test]
    fn format_round_trips() {
        let line = format_result(&[0.125, 7.0]);
        assert_eq!(parse_final_line(&line), Some(vec![0.125, 7.0]));
    }
}
