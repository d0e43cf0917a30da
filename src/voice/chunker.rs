//! Sentence chunking for streaming synthesis
//!
//! Splits a response into sentence-scale segments so the first one can be
//! synthesized and played while the rest are still being prepared.

/// Sentence-ending delimiters; the earliest match wins regardless of order here
pub const DELIMITERS: [&str; 6] = [". ", "! ", "? ", ".\n", "!\n", "?\n"];

/// One speakable unit of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Position in the response, starting at 0
    pub index: u32,
    /// Trimmed, non-empty text
    pub text: String,
}

/// Split `text` into trimmed, non-empty sentence segments in original order.
///
/// Each segment runs from the cursor through the earliest delimiter found at
/// or after it. Text after the last delimiter becomes the final segment.
///
/// # Examples
///
/// ```
/// use talkback::voice::split;
///
/// assert_eq!(split("Hi! Ask me. OK?"), vec!["Hi!", "Ask me.", "OK?"]);
/// ```
#[must_use]
pub fn split(text: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut cursor = 0;

    while cursor < text.len() {
        let rest = &text[cursor..];
        let earliest = DELIMITERS
            .iter()
            .filter_map(|d| rest.find(d).map(|pos| pos + d.len()))
            .min();

        let end = earliest.map_or(text.len(), |e| cursor + e);
        push_trimmed(&mut segments, &text[cursor..end]);
        cursor = end;
    }

    segments
}

/// Split `text` and number the resulting segments
#[must_use]
pub fn segments(text: &str) -> Vec<Segment> {
    split(text)
        .into_iter()
        .zip(0u32..)
        .map(|(text, index)| Segment { index, text })
        .collect()
}

fn push_trimmed(segments: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        segments.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_mixed_delimiters_in_order() {
        assert_eq!(split("Hi! Ask me. OK?"), vec!["Hi!", "Ask me.", "OK?"]);
    }

    #[test]
    fn earliest_delimiter_wins_over_list_order() {
        // "? " appears before ". " even though ". " is listed first
        assert_eq!(
            split("Why not? Because. Fine"),
            vec!["Why not?", "Because.", "Fine"]
        );
    }

    #[test]
    fn newline_delimiters() {
        assert_eq!(
            split("First line.\nSecond!\nThird"),
            vec!["First line.", "Second!", "Third"]
        );
    }

    #[test]
    fn no_delimiter_is_single_segment() {
        assert_eq!(split("no punctuation here"), vec!["no punctuation here"]);
    }

    #[test]
    fn trailing_punctuation_without_space_stays_attached() {
        assert_eq!(split("One. Two."), vec!["One.", "Two."]);
    }

    #[test]
    fn drops_empty_and_whitespace_segments() {
        assert!(split("").is_empty());
        assert!(split("   \n ").is_empty());
        assert_eq!(split("Hello.  . World"), vec!["Hello.", ".", "World"]);
    }

    #[test]
    fn decimals_are_not_sentence_ends() {
        assert_eq!(split("Pi is 3.14 roughly. Yes"), vec!["Pi is 3.14 roughly.", "Yes"]);
    }

    #[test]
    fn rejoined_segments_preserve_text() {
        let text = "  Sure! Here is the plan. First, we wait? Then we go.\nDone";
        let rejoined = split(text).join(" ");
        let normalize = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(normalize(&rejoined), normalize(text));
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        assert_eq!(split("Café ouvert. Très bien! Oui"), vec!["Café ouvert.", "Très bien!", "Oui"]);
    }

    #[test]
    fn segments_are_numbered_from_zero() {
        let segs = segments("A. B. C");
        let indices: Vec<u32> = segs.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(segs[2].text, "C");
    }
}
