//! Outbound humanizer: segmentation and typing-rhythm planning.
//!
//! Long answers are cut into WhatsApp-sized segments at paragraph and
//! sentence boundaries, then each segment gets a thinking delay, a
//! typing duration derived from a per-segment WPM draw, and a short
//! post-send pause.

use std::time::Duration;

use rand::Rng;

/// Target segment length in characters.
pub const PREFERRED_LEN: usize = 500;
/// Hard per-segment ceiling.
pub const MAX_LEN: usize = 1000;
/// Segments shorter than this merge into a neighbour.
const MERGE_SHORT_LEN: usize = 100;
/// Break-point search radius around `PREFERRED_LEN` for oversized sentences.
const BREAK_RADIUS: usize = 100;

/// Maximum time actually slept while "typing" one segment.
pub const TYPING_SLEEP_CAP: Duration = Duration::from_secs(10);

/// Sentence terminators.
const SENTENCE_TERMINATORS: [char; 6] = ['.', '!', '?', '。', '！', '？'];

// ── Segmentation ──────────────────────────────────────────────────────────────

/// Split an assistant answer into ordered send segments.
pub fn segment(text: &str) -> Vec<String> {
    let mut segments: Vec<String> = Vec::new();

    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }

        if char_len(paragraph) <= MAX_LEN {
            // A whole paragraph may ride along with the previous
            // segment when the pair still fits.
            if let Some(last) = segments.last_mut() {
                if char_len(last) + 2 + char_len(paragraph) <= MAX_LEN {
                    last.push_str("\n\n");
                    last.push_str(paragraph);
                    continue;
                }
            }
            segments.push(paragraph.to_string());
        } else {
            segments.extend(split_long_paragraph(paragraph));
        }
    }

    merge_short_segments(segments)
}

/// Cut an oversized paragraph at sentence boundaries, force-splitting
/// any single sentence that alone exceeds the ceiling.
fn split_long_paragraph(paragraph: &str) -> Vec<String> {
    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();

    for sentence in split_sentences(paragraph) {
        if char_len(&sentence) > MAX_LEN {
            if !current.trim().is_empty() {
                pieces.push(std::mem::take(&mut current).trim().to_string());
            } else {
                current.clear();
            }
            pieces.extend(force_split(&sentence));
            continue;
        }
        if char_len(&current) + char_len(&sentence) <= MAX_LEN {
            current.push_str(&sentence);
        } else {
            pieces.push(std::mem::take(&mut current).trim().to_string());
            current = sentence;
        }
    }
    let current = current.trim();
    if !current.is_empty() {
        pieces.push(current.to_string());
    }
    pieces
}

/// Split on runs of sentence terminators, keeping each run attached to
/// the sentence it ends.
fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_terminator = false;

    for c in text.chars() {
        let is_term = SENTENCE_TERMINATORS.contains(&c);
        if in_terminator && !is_term {
            out.push(std::mem::take(&mut current));
        }
        current.push(c);
        in_terminator = is_term;
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Cut a single runaway sentence near [`PREFERRED_LEN`], preferring a
/// natural break inside ±[`BREAK_RADIUS`]; hard cut as a last resort.
fn force_split(sentence: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest: Vec<char> = sentence.trim().chars().collect();

    while rest.len() > MAX_LEN {
        let lo = PREFERRED_LEN.saturating_sub(BREAK_RADIUS);
        let hi = (PREFERRED_LEN + BREAK_RADIUS).min(rest.len() - 1);

        // The break closest to the target wins; scan outward from it.
        let mut cut = None;
        for offset in 0..=(hi - lo) {
            for candidate in [
                PREFERRED_LEN.checked_sub(offset),
                Some(PREFERRED_LEN + offset),
            ]
            .into_iter()
            .flatten()
            {
                if candidate < lo || candidate > hi {
                    continue;
                }
                if is_break_at(&rest, candidate) {
                    cut = Some(candidate);
                    break;
                }
            }
            if cut.is_some() {
                break;
            }
        }
        let cut = cut.unwrap_or(PREFERRED_LEN);

        let piece: String = rest[..=cut].iter().collect();
        pieces.push(piece.trim().to_string());
        rest.drain(..=cut);
        // Drop boundary whitespace the cut left behind.
        while rest.first().is_some_and(|c| c.is_whitespace()) {
            rest.remove(0);
        }
    }

    if !rest.is_empty() {
        pieces.push(rest.into_iter().collect::<String>().trim().to_string());
    }
    pieces.retain(|p| !p.is_empty());
    pieces
}

/// A break position: a full-width separator or plain space, or an
/// ASCII terminator/comma followed by a space. The space requirement
/// keeps cuts out of constructs like `1,000` or `3.14`.
fn is_break_at(chars: &[char], i: usize) -> bool {
    let c = chars[i];
    if matches!(c, '；' | '，' | '、' | ' ') {
        return true;
    }
    matches!(c, '.' | '!' | '?' | ',') && chars.get(i + 1).is_some_and(|n| *n == ' ')
}

/// Fold segments under [`MERGE_SHORT_LEN`] into a neighbour while the
/// pair stays within the ceiling.
fn merge_short_segments(segments: Vec<String>) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    for seg in segments {
        if let Some(last) = merged.last_mut() {
            let short = char_len(last) < MERGE_SHORT_LEN || char_len(&seg) < MERGE_SHORT_LEN;
            if short && char_len(last) + 2 + char_len(&seg) <= MAX_LEN {
                last.push_str("\n\n");
                last.push_str(&seg);
                continue;
            }
        }
        merged.push(seg);
    }
    merged
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

// ── Rhythm plan ───────────────────────────────────────────────────────────────

/// Sleep plan for one outbound segment.
#[derive(Debug, Clone)]
pub struct RhythmPlan {
    pub thinking_delay: Duration,
    /// Uncapped typing time; the sender caps the actual sleep at
    /// [`TYPING_SLEEP_CAP`].
    pub typing_duration: Duration,
    pub post_delay: Duration,
    pub wpm: f64,
}

/// Compute the rhythm for segment `index` of `total`.
///
/// `upcoming_chars` is the length of the segment this plan's thinking
/// pause precedes, i.e. the one about to be typed. The first pause
/// scales on a /100 divisor, every later pause on /200.
pub fn plan(index: usize, total: usize, upcoming_chars: usize) -> RhythmPlan {
    let mut rng = rand::thread_rng();

    // Thinking: the first segment reacts faster than follow-ups, both
    // scaled down when the upcoming text is short.
    let (lo, hi, scale_div) = if index == 0 {
        (500.0, 2000.0, 100.0)
    } else {
        (800.0, 2000.0, 200.0)
    };
    let scale = (upcoming_chars as f64 / scale_div).min(1.0);
    let thinking_ms = jitter(lo + (hi - lo) * scale, &mut rng);

    // Typing: words ≈ chars/5, typed at a per-segment WPM draw.
    let wpm: f64 = rng.gen_range(20.0..=60.0);
    let minutes = (upcoming_chars as f64 / 5.0) / wpm;
    let typing_ms = jitter(minutes * 60_000.0, &mut rng);

    let post_delay = if index + 1 == total {
        Duration::from_millis(200)
    } else {
        Duration::from_millis(400)
    };

    RhythmPlan {
        thinking_delay: Duration::from_millis(thinking_ms as u64),
        typing_duration: Duration::from_millis(typing_ms as u64),
        post_delay,
        wpm,
    }
}

/// ±10 % uniform jitter.
fn jitter(value: f64, rng: &mut impl Rng) -> f64 {
    let factor: f64 = rng.gen_range(0.9..=1.1);
    (value * factor).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Strip all whitespace; reconstruction equality is defined up to
    /// whitespace normalisation.
    fn squash(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    #[test]
    fn short_text_is_one_segment() {
        let segs = segment("Hello there!");
        assert_eq!(segs, vec!["Hello there!".to_string()]);
    }

    #[test]
    fn paragraphs_concatenate_when_they_fit() {
        let text = "First paragraph.\n\nSecond paragraph.";
        let segs = segment(text);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0], "First paragraph.\n\nSecond paragraph.");
    }

    #[test]
    fn blank_heavy_breaks_collapse() {
        let segs = segment("a\n\n\n\nb");
        assert_eq!(segs.len(), 1);
        assert_eq!(squash(&segs[0]), "ab");
    }

    #[test]
    fn big_paragraphs_split_at_sentences() {
        let sentence = "This sentence is about forty characters. ";
        let text = sentence.repeat(60); // ~2460 chars, one paragraph
        let segs = segment(&text);
        assert!(segs.len() >= 3);
        for seg in &segs {
            assert!(seg.chars().count() <= MAX_LEN, "segment too long: {}", seg.len());
        }
        assert_eq!(squash(&segs.concat()), squash(&text));
    }

    #[test]
    fn runaway_sentence_splits_near_preferred_len() {
        // One 1800-char "sentence" with commas as the only breaks.
        let text = "word, ".repeat(300).trim_end().to_string();
        let segs = segment(&text);
        assert!(segs.len() >= 2);
        for seg in &segs {
            assert!(seg.chars().count() <= MAX_LEN);
        }
        // First cut lands inside the preferred window.
        let first = segs[0].chars().count();
        assert!(
            (PREFERRED_LEN - BREAK_RADIUS..=PREFERRED_LEN + BREAK_RADIUS).contains(&first),
            "first cut at {first}"
        );
        assert_eq!(squash(&segs.concat()), squash(&text));
    }

    #[test]
    fn comma_without_space_is_not_a_break() {
        // Commas inside numbers must not become cut points; the only
        // breaks here are the spaces between tokens.
        let text = "1,000,000 ".repeat(200).trim_end().to_string();
        let segs = segment(&text);
        assert!(segs.len() >= 2);
        for seg in &segs {
            assert!(seg.chars().count() <= MAX_LEN);
            assert!(!seg.ends_with(','), "cut inside a number: {seg:?}");
        }
        assert_eq!(squash(&segs.concat()), squash(&text));
    }

    #[test]
    fn hard_cut_when_no_break_exists() {
        let text = "x".repeat(2500);
        let segs = segment(&text);
        for seg in &segs {
            assert!(seg.chars().count() <= MAX_LEN);
        }
        assert_eq!(squash(&segs.concat()), squash(&text));
    }

    #[test]
    fn cjk_text_counts_chars_not_bytes() {
        let text = "好".repeat(1200);
        let segs = segment(&text);
        for seg in &segs {
            assert!(seg.chars().count() <= MAX_LEN);
        }
        assert_eq!(squash(&segs.concat()), squash(&text));
    }

    #[test]
    fn short_tail_merges_into_neighbour() {
        let long_para = "This sentence is about forty characters. ".repeat(20); // ~820
        let text = format!("{}\n\nok", long_para.trim());
        let segs = segment(&text);
        // The 2-char tail does not ride alone.
        assert!(segs.iter().all(|s| s.chars().count() >= 3));
        assert_eq!(squash(&segs.concat()), squash(&text));
    }

    #[test]
    fn rhythm_bounds_hold() {
        for _ in 0..50 {
            let first = plan(0, 3, 400);
            // [500, 2000] scaled by min(400/100, 1) = 1, ±10 %.
            assert!(first.thinking_delay >= Duration::from_millis(450));
            assert!(first.thinking_delay <= Duration::from_millis(2200));
            assert!(first.post_delay == Duration::from_millis(400));
            assert!((20.0..=60.0).contains(&first.wpm));

            let last = plan(2, 3, 10);
            assert_eq!(last.post_delay, Duration::from_millis(200));
            // Short segment scales thinking toward the floor.
            assert!(last.thinking_delay <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn typing_duration_tracks_wpm() {
        for _ in 0..50 {
            let p = plan(0, 1, 500);
            // 100 words at 20–60 wpm: 100–300 s, ±10 % jitter.
            assert!(p.typing_duration >= Duration::from_secs(90));
            assert!(p.typing_duration <= Duration::from_secs(330));
            // The sender would cap the actual sleep.
            assert!(TYPING_SLEEP_CAP < p.typing_duration);
        }
    }
}
