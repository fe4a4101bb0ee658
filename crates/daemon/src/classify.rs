//! Classifier module for renderer output.
//!
//! 3ds Max reports progress as free text, so the outcome of a render is
//! inferred from marker phrases in that text. This is a heuristic layered
//! under the process exit code, not a protocol.

use serde::{Deserialize, Serialize};

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputChannel {
    Stdout,
    Stderr,
}

impl OutputChannel {
    pub fn is_error(self) -> bool {
        self == OutputChannel::Stderr
    }
}

/// What a single chunk of output means for its job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Informational text, shown verbatim.
    Progress(String),
    /// The renderer announced a finished render.
    Success,
    /// The renderer reported an error on stderr.
    Failure(String),
}

/// Marker that turns a stderr chunk into a failure (matched case-insensitively).
const ERROR_MARKER: &str = "error";

/// Phrases 3ds Max prints once a render has been written.
const COMPLETION_MARKERS: &[&str] = &["rendering completed", "successfully rendered"];

/// Classifies one chunk of renderer output.
///
/// Classification logic:
/// 1. stderr chunk containing the error marker -> Failure
/// 2. chunk on either stream containing a completion marker -> Success
/// 3. anything else -> Progress
pub fn classify(chunk: &str, channel: OutputChannel) -> Classification {
    let lower = chunk.to_lowercase();

    if channel.is_error() && lower.contains(ERROR_MARKER) {
        return Classification::Failure(chunk.to_string());
    }

    if contains_any_marker(&lower, COMPLETION_MARKERS) {
        return Classification::Success;
    }

    Classification::Progress(chunk.to_string())
}

fn contains_any_marker(text: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| text.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_error_on_stderr_is_failure() {
        assert_eq!(
            classify("ERROR: missing plugin", OutputChannel::Stderr),
            Classification::Failure("ERROR: missing plugin".to_string())
        );
        assert_eq!(
            classify("Error loading scene", OutputChannel::Stderr),
            Classification::Failure("Error loading scene".to_string())
        );
    }

    #[test]
    fn test_error_on_stdout_is_progress() {
        assert_eq!(
            classify("0 errors, 2 warnings", OutputChannel::Stdout),
            Classification::Progress("0 errors, 2 warnings".to_string())
        );
    }

    #[test]
    fn test_completion_markers_on_either_stream() {
        assert_eq!(
            classify("Rendering completed", OutputChannel::Stdout),
            Classification::Success
        );
        assert_eq!(
            classify("Job scene.max successfully rendered", OutputChannel::Stderr),
            Classification::Success
        );
    }

    #[test]
    fn test_failure_wins_over_completion_on_stderr() {
        assert!(matches!(
            classify("Rendering completed with error", OutputChannel::Stderr),
            Classification::Failure(_)
        ));
    }

    #[test]
    fn test_progress_is_verbatim() {
        let line = "Frame 12 of 240 (5%)";
        assert_eq!(
            classify(line, OutputChannel::Stdout),
            Classification::Progress(line.to_string())
        );
    }

    fn case_variant(marker: &'static str) -> impl Strategy<Value = String> {
        proptest::collection::vec(proptest::bool::ANY, marker.len()).prop_map(move |upper| {
            marker
                .chars()
                .zip(upper)
                .map(|(c, up)| if up { c.to_ascii_uppercase() } else { c })
                .collect()
        })
    }

    // Any stderr text carrying the error marker, in any letter case, is a failure.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_stderr_error_marker_is_failure(
            prefix in "[a-z0-9 :]{0,12}",
            marker in case_variant("error"),
            suffix in "[a-z0-9 :]{0,12}",
        ) {
            let chunk = format!("{}{}{}", prefix, marker, suffix);
            prop_assert_eq!(
                classify(&chunk, OutputChannel::Stderr),
                Classification::Failure(chunk.clone())
            );
        }

        #[test]
        fn prop_marker_free_text_is_progress(
            s in "[a-z0-9 ]{0,40}".prop_filter("no markers", |s| {
                !s.contains("error")
                    && !COMPLETION_MARKERS.iter().any(|m| s.contains(m))
            }),
            on_stderr in proptest::bool::ANY,
        ) {
            let channel = if on_stderr { OutputChannel::Stderr } else { OutputChannel::Stdout };
            prop_assert_eq!(classify(&s, channel), Classification::Progress(s.clone()));
        }
    }
}
