//! Flush triggers and text concatenation for the merge window.

use wagent_core::config::MERGE_IMMEDIATE_FLUSH_CHARS;

/// Sentence terminators that flush the window immediately.
const TERMINATORS: [char; 6] = ['。', '！', '？', '.', '!', '?'];

/// Punctuation that suppresses the space separator at a join boundary.
const JOIN_PUNCTUATION: [char; 11] = [
    '.', ',', '!', '?', ';', '、', '。', '！', '？', '，', '；',
];

/// Whether an inbound message ends the burst on its own: a trailing
/// sentence terminator, or sheer length.
pub fn flushes_immediately(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.chars().count() > MERGE_IMMEDIATE_FLUSH_CHARS {
        return true;
    }
    trimmed
        .chars()
        .last()
        .is_some_and(|c| TERMINATORS.contains(&c))
}

/// Concatenate trimmed message texts with a single-space separator,
/// suppressing the space when the boundary already carries punctuation
/// on either side.
pub fn merge_texts<'a, I>(texts: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut merged = String::new();
    for text in texts {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !merged.is_empty() {
            let prev_ends_punct = merged
                .chars()
                .last()
                .is_some_and(|c| JOIN_PUNCTUATION.contains(&c));
            let next_starts_punct = trimmed
                .chars()
                .next()
                .is_some_and(|c| JOIN_PUNCTUATION.contains(&c));
            if !prev_ends_punct && !next_starts_punct {
                merged.push(' ');
            }
        }
        merged.push_str(trimmed);
    }
    merged
}
