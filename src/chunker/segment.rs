//! Semantic segmentation: paragraphs, sentences, and greedy packing.
//!
//! Text is split into paragraphs on blank lines; long paragraphs are split
//! further into sentences with a language-aware boundary detector. Adjacent
//! units are then packed greedily into chunks bounded by `max_chunk_size`
//! characters, with an overlap carried word-wise from the tail of the
//! previous chunk. A single unit larger than `max_chunk_size` falls back to
//! a sliding window.

use std::sync::LazyLock;

use regex::Regex;

/// Paragraphs above this length are split into sentences.
pub const SENTENCE_SPLIT_THRESHOLD: usize = 300;

/// Languages the sentence splitter knows abbreviations for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Language {
    French,
    English,
    /// Unknown language; the splitter falls back to the simple boundary
    /// rule with no abbreviation handling.
    Other,
}

/// French abbreviations that end with a period but not a sentence.
const FRENCH_ABBREVIATIONS: &[&str] = &[
    "m", "mme", "mlle", "dr", "st", "ste", "cf", "ex", "fig", "réf", "ref",
    "eq", "env", "etc", "p", "pp", "vol", "chap", "art",
];

/// English abbreviations that end with a period but not a sentence.
const ENGLISH_ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "st", "cf", "e.g", "i.e", "fig", "ref",
    "eq", "etc", "p", "pp", "vol", "chap", "art", "no", "vs",
];

static PARAGRAPH_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("static regex"));

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\w+\b").expect("static regex"));

/// A semantic unit (paragraph or sentence) with its offset in the source
/// document.
#[derive(Clone, Debug)]
pub struct Unit {
    pub text: String,
    pub offset: usize,
}

/// A packed chunk with the document offset of its first fresh unit. The
/// overlap prefix carried from the previous chunk does not move the offset.
#[derive(Clone, Debug)]
pub struct PackedChunk {
    pub text: String,
    pub offset: usize,
}

/// Guess the text's language by counting common stop words.
pub fn detect_language(text: &str) -> Language {
    const FRENCH_MARKERS: &[&str] =
        &["le", "la", "les", "des", "une", "est", "dans", "pour", "avec", "sur"];
    const ENGLISH_MARKERS: &[&str] =
        &["the", "of", "and", "is", "with", "for", "that", "this", "are", "from"];

    let mut cut = text.len().min(2000);
    while cut < text.len() && !text.is_char_boundary(cut) {
        cut += 1;
    }
    let sample: Vec<String> = WORD
        .find_iter(&text[..cut])
        .map(|m| m.as_str().to_lowercase())
        .collect();
    let french = sample
        .iter()
        .filter(|w| FRENCH_MARKERS.contains(&w.as_str()))
        .count();
    let english = sample
        .iter()
        .filter(|w| ENGLISH_MARKERS.contains(&w.as_str()))
        .count();

    if french == 0 && english == 0 {
        Language::Other
    } else if french >= english {
        Language::French
    } else {
        Language::English
    }
}

/// Extract semantic units: paragraphs, with long paragraphs split into
/// sentences.
pub fn extract_units(text: &str, language: Language) -> Vec<Unit> {
    let mut units = vec![];
    let mut cursor = 0;
    for piece in PARAGRAPH_SPLIT.split(text) {
        // `split` walks the text in order, so `find` from the cursor
        // recovers the paragraph's true offset.
        let start = text[cursor..]
            .find(piece)
            .map(|i| cursor + i)
            .unwrap_or(cursor);
        cursor = start + piece.len();

        let trimmed = piece.trim();
        if trimmed.is_empty() {
            continue;
        }
        let trim_offset = start + (piece.len() - piece.trim_start().len());

        if trimmed.len() < SENTENCE_SPLIT_THRESHOLD {
            units.push(Unit {
                text: trimmed.to_owned(),
                offset: trim_offset,
            });
        } else {
            for (sentence, rel_offset) in split_sentences(trimmed, language) {
                units.push(Unit {
                    text: sentence,
                    offset: trim_offset + rel_offset,
                });
            }
        }
    }
    units
}

/// Split a paragraph into sentences, returning each with its byte offset
/// within the paragraph.
///
/// The boundary rule: a `.`, `!`, or `?` followed by whitespace ends a
/// sentence, unless the word before the period is a known abbreviation for
/// the detected language or a single capital letter (an initial).
pub fn split_sentences(paragraph: &str, language: Language) -> Vec<(String, usize)> {
    let abbreviations: &[&str] = match language {
        Language::French => FRENCH_ABBREVIATIONS,
        Language::English => ENGLISH_ABBREVIATIONS,
        Language::Other => &[],
    };

    let bytes = paragraph.as_bytes();
    let mut sentences = vec![];
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if matches!(c, '.' | '!' | '?') {
            let next_is_space = bytes
                .get(i + 1)
                .map(|b| (*b as char).is_whitespace())
                .unwrap_or(true);
            if next_is_space && !(c == '.' && ends_with_abbreviation(&paragraph[start..=i], abbreviations)) {
                let sentence = paragraph[start..=i].trim();
                if !sentence.is_empty() {
                    let offset = start + (paragraph[start..=i].len()
                        - paragraph[start..=i].trim_start().len());
                    sentences.push((sentence.to_owned(), offset));
                }
                start = i + 1;
            }
        }
        i += 1;
    }
    let tail = paragraph[start..].trim();
    if !tail.is_empty() {
        let offset = start + (paragraph[start..].len() - paragraph[start..].trim_start().len());
        sentences.push((tail.to_owned(), offset));
    }
    sentences
}

/// Does the text end with a known abbreviation (plus the period) or a
/// single-letter initial?
fn ends_with_abbreviation(text_with_period: &str, abbreviations: &[&str]) -> bool {
    let before = &text_with_period[..text_with_period.len() - 1];
    let last_word = before
        .rsplit(|c: char| c.is_whitespace())
        .next()
        .unwrap_or("");
    if last_word.len() == 1 && last_word.chars().all(|c| c.is_uppercase()) {
        return true;
    }
    let lower = last_word.to_lowercase();
    abbreviations.iter().any(|a| *a == lower)
}

/// Greedily pack units into chunks of at most `max_size` characters, with
/// `overlap` characters carried word-wise from the previous chunk's tail.
pub fn pack_units(units: &[Unit], max_size: usize, overlap: usize) -> Vec<PackedChunk> {
    let mut chunks: Vec<PackedChunk> = vec![];
    let mut current = String::new();
    let mut current_offset = 0;
    let mut fresh_in_current = false;
    let mut overlap_buffer: Vec<String> = vec![];

    for unit in units {
        // An oversize unit gets its own sliding-window chunks.
        if unit.text.len() > max_size {
            if fresh_in_current {
                chunks.push(PackedChunk {
                    text: current.clone(),
                    offset: current_offset,
                });
            }
            current.clear();
            fresh_in_current = false;

            let windows = sliding_window(&unit.text, max_size, overlap);
            let last = windows.last().cloned();
            for (window, rel) in windows {
                chunks.push(PackedChunk {
                    text: window,
                    offset: unit.offset + rel,
                });
            }
            if let Some((last_text, _)) = last {
                overlap_buffer = tail_words(&last_text, overlap);
            }
            continue;
        }

        // Close the current chunk when the unit no longer fits.
        if fresh_in_current && current.len() + unit.text.len() + 1 > max_size {
            chunks.push(PackedChunk {
                text: current.clone(),
                offset: current_offset,
            });
            current = overlap_buffer.join(" ");
            fresh_in_current = false;
            overlap_buffer = vec![];
        }

        if current.is_empty() {
            current = unit.text.clone();
        } else {
            current.push_str(separator_for(&unit.text));
            current.push_str(&unit.text);
        }
        if !fresh_in_current {
            current_offset = unit.offset;
            fresh_in_current = true;
        }
        if overlap > 0 {
            overlap_buffer = tail_words(&current, overlap);
        }
    }

    if fresh_in_current {
        chunks.push(PackedChunk {
            text: current,
            offset: current_offset,
        });
    }
    chunks
}

/// Pick a separator for appending a unit to the current chunk: newline for
/// list items, blank line for paragraph-sized units, a space otherwise.
fn separator_for(unit: &str) -> &'static str {
    let trimmed = unit.trim_start();
    if trimmed.starts_with("- ")
        || trimmed.starts_with("* ")
        || trimmed.starts_with('•')
        || trimmed
            .split_once('.')
            .map(|(head, _)| head.chars().all(|c| c.is_ascii_digit()) && !head.is_empty())
            .unwrap_or(false)
    {
        "\n"
    } else if unit.len() > 100 || unit.matches('.').count() > 1 {
        "\n\n"
    } else {
        " "
    }
}

/// Split an oversize unit into overlapping windows, cutting on whitespace
/// where possible. Returns each window with its byte offset in the unit.
pub fn sliding_window(text: &str, max_size: usize, overlap: usize) -> Vec<(String, usize)> {
    let step = max_size.saturating_sub(overlap).max(1);
    let mut windows = vec![];
    let mut start = 0;
    while start < text.len() {
        let tentative_end = (start + max_size).min(text.len());
        // Don't cut inside a UTF-8 code point or, if avoidable, a word.
        let mut end = tentative_end;
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        if end < text.len() {
            if let Some(space) = text[start..end].rfind(char::is_whitespace) {
                if space > (end - start) / 2 {
                    end = start + space;
                }
            }
        }
        let window = text[start..end].trim();
        if !window.is_empty() {
            let offset = start + (text[start..end].len() - text[start..end].trim_start().len());
            windows.push((window.to_owned(), offset));
        }
        if end == text.len() {
            break;
        }
        start += step.min(end - start).max(1);
        while start < text.len() && !text.is_char_boundary(start) {
            start += 1;
        }
    }
    windows
}

/// The last words of `text`, totalling roughly `overlap` characters.
pub fn tail_words(text: &str, overlap: usize) -> Vec<String> {
    if overlap == 0 {
        return vec![];
    }
    let mut words: Vec<String> = vec![];
    let mut size = 0;
    for word in text.split_whitespace().rev() {
        size += word.len() + 1;
        words.push(word.to_owned());
        if size >= overlap {
            break;
        }
    }
    words.reverse();
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_french_and_english() {
        assert_eq!(
            detect_language("le moteur est dans la salle des machines pour une révision"),
            Language::French
        );
        assert_eq!(
            detect_language("the engine is in the machine room for an overhaul"),
            Language::English
        );
        assert_eq!(detect_language("zzz qqq www"), Language::Other);
    }

    #[test]
    fn paragraphs_keep_their_offsets() {
        let text = "First paragraph.\n\nSecond paragraph.";
        let units = extract_units(text, Language::English);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].offset, 0);
        assert_eq!(&text[units[1].offset..], "Second paragraph.");
    }

    #[test]
    fn long_paragraphs_split_into_sentences() {
        let sentence = "This sentence is repeated to cross the split threshold. ";
        let paragraph = sentence.repeat(8);
        let units = extract_units(&paragraph, Language::English);
        assert!(units.len() > 1);
        for unit in &units {
            assert!(unit.text.starts_with("This sentence"));
        }
    }

    #[test]
    fn abbreviations_do_not_end_sentences() {
        let sentences =
            split_sentences("Voir fig. 3 pour les détails. La suite arrive.", Language::French);
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0].0, "Voir fig. 3 pour les détails.");
    }

    #[test]
    fn initials_do_not_end_sentences() {
        let sentences =
            split_sentences("Report by J. Smith covers it. Next item.", Language::English);
        assert_eq!(sentences.len(), 2);
    }

    #[test]
    fn packing_respects_max_size() {
        let units: Vec<Unit> = (0..20)
            .map(|i| Unit {
                text: format!("unit number {i} with some padding text"),
                offset: i * 40,
            })
            .collect();
        let chunks = pack_units(&units, 120, 20);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.text.len() <= 160, "chunk too big: {}", chunk.text.len());
        }
    }

    #[test]
    fn packed_chunks_carry_overlap() {
        let units: Vec<Unit> = (0..6)
            .map(|i| Unit {
                text: format!("sentence number {i} is here"),
                offset: i * 30,
            })
            .collect();
        let chunks = pack_units(&units, 60, 25);
        assert!(chunks.len() >= 2);
        // The second chunk starts with words from the first chunk's tail.
        let first_tail = tail_words(&chunks[0].text, 25).join(" ");
        assert!(
            chunks[1].text.starts_with(&first_tail),
            "expected {:?} to start with {:?}",
            chunks[1].text,
            first_tail
        );
    }

    #[test]
    fn small_input_is_one_chunk_without_overlap_prefix() {
        let units = vec![Unit {
            text: "tiny".to_owned(),
            offset: 0,
        }];
        let chunks = pack_units(&units, 1000, 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "tiny");
    }

    #[test]
    fn oversize_units_use_a_sliding_window() {
        let huge = "word ".repeat(300);
        let units = vec![Unit {
            text: huge.trim().to_owned(),
            offset: 0,
        }];
        let chunks = pack_units(&units, 200, 40);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.text.len() <= 200);
        }
    }

    #[test]
    fn sliding_window_offsets_point_into_the_unit() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa";
        let windows = sliding_window(text, 20, 5);
        for (window, offset) in &windows {
            assert!(text[*offset..].starts_with(window.split(' ').next().unwrap()));
        }
    }
}
