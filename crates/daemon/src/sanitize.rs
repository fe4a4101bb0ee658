//! Turns raw renderer output into text that is safe to display.

/// Substituted for undecodable bytes and control characters.
pub const PLACEHOLDER: char = '\u{FFFD}';

/// Decode one output chunk for display.
///
/// Invalid UTF-8 becomes [`PLACEHOLDER`]; trailing line terminators are
/// dropped; tabs survive; every other control character is replaced.
pub fn sanitize_chunk(bytes: &[u8]) -> String {
    let decoded = String::from_utf8_lossy(bytes);
    let trimmed = decoded.trim_end_matches(|c: char| c == '\r' || c == '\n');

    trimmed
        .chars()
        .map(|c| if is_displayable(c) { c } else { PLACEHOLDER })
        .collect()
}

fn is_displayable(c: char) -> bool {
    c == '\t' || !c.is_control()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_plain_line_passes_through() {
        assert_eq!(
            sanitize_chunk(b"Frame 3 of 10 rendered\r\n"),
            "Frame 3 of 10 rendered"
        );
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        assert_eq!(sanitize_chunk(b"bad \xff byte"), "bad \u{FFFD} byte");
    }

    #[test]
    fn test_control_characters_are_replaced() {
        assert_eq!(sanitize_chunk(b"\x1b[31mred\x07"), "\u{FFFD}[31mred\u{FFFD}");
        assert_eq!(sanitize_chunk(b"a\tb"), "a\tb");
        assert_eq!(sanitize_chunk(b"mid\rline\n"), "mid\u{FFFD}line");
    }

    #[test]
    fn test_non_ascii_text_is_kept() {
        assert_eq!(
            sanitize_chunk("Szene_Übersicht.max".as_bytes()),
            "Szene_Übersicht.max"
        );
    }

    // Whatever the renderer emits, the display never receives control
    // characters other than tab.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_output_has_no_control_chars(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let text = sanitize_chunk(&bytes);
            prop_assert!(text.chars().all(|c| c == '\t' || !c.is_control()));
        }

        #[test]
        fn prop_printable_ascii_is_unchanged(s in "[ -~]{0,80}") {
            prop_assert_eq!(sanitize_chunk(s.as_bytes()), s);
        }
    }
}
