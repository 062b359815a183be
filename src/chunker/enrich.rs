//! Chunk metadata enrichment: ids, statistics, key terms, entities, and
//! embeddings.
//!
//! Chunk ids are a pure function of chunk text (a truncated SHA-256), so the
//! same text yields the same ids across runs. Embeddings are deterministic
//! character-trigram vectors stored in a side cache keyed by chunk id; only
//! a `has_embedding` flag lands in the chunk metadata itself.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

use regex::Regex;
use schemars::JsonSchema;
use sha2::{Digest, Sha256};

use crate::prelude::*;

use std::sync::LazyLock;

/// Dimension of the trigram embedding vectors.
pub const EMBEDDING_DIM: usize = 64;

/// Stop words ignored by key-term extraction, French and English mixed
/// because OCR output frequently is too.
const STOP_WORDS: &[&str] = &[
    "alors", "avec", "cette", "dans", "elle", "entre", "être", "leur", "mais",
    "même", "nous", "pour", "quand", "sans", "sont", "sur", "tout", "vous",
    "also", "and", "are", "been", "for", "from", "have", "its", "that", "the",
    "their", "there", "this", "very", "were", "which", "will", "with",
];

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\w+\b").expect("static regex"));

static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+").expect("static regex"));

/// Proper-noun runs: two or more capitalized words in a row.
static PROPER_NOUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-ZÀ-Þ][\wà-þ]+(?:\s+[A-ZÀ-Þ][\wà-þ]+)+\b").expect("static regex")
});

/// Model-style identifiers like `X-2000` or `Alpha‑3`.
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][A-Za-z]*-\d+[a-z]?\b").expect("static regex"));

/// Generate a stable content-hash id for a chunk.
pub fn chunk_id(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("chunk_{}", &hex[..12])
}

/// Simple counts describing a chunk's text.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct TextStatistics {
    pub char_count: usize,
    pub word_count: usize,
    pub sentence_count: usize,
    pub avg_word_length: f64,
    pub unique_words: usize,
    pub lexical_diversity: f64,
}

/// Compute statistics over a chunk's text.
pub fn text_statistics(text: &str) -> TextStatistics {
    let words: Vec<&str> = WORD.find_iter(text).map(|m| m.as_str()).collect();
    let word_count = words.len();
    let sentence_count = SENTENCE_END
        .split(text)
        .filter(|s| !s.trim().is_empty())
        .count();
    let avg_word_length = if word_count == 0 {
        0.0
    } else {
        words.iter().map(|w| w.len()).sum::<usize>() as f64 / word_count as f64
    };
    let unique_words = words
        .iter()
        .map(|w| w.to_lowercase())
        .collect::<std::collections::HashSet<_>>()
        .len();
    let lexical_diversity = if word_count == 0 {
        0.0
    } else {
        unique_words as f64 / word_count as f64
    };
    TextStatistics {
        char_count: text.chars().count(),
        word_count,
        sentence_count,
        avg_word_length: (avg_word_length * 100.0).round() / 100.0,
        unique_words,
        lexical_diversity: (lexical_diversity * 100.0).round() / 100.0,
    }
}

/// Top key terms by frequency, stop words and short words removed.
pub fn key_terms(text: &str, limit: usize) -> Vec<String> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for m in WORD.find_iter(text) {
        let word = m.as_str().to_lowercase();
        if word.len() <= 3 || STOP_WORDS.contains(&word.as_str()) {
            continue;
        }
        *counts.entry(word).or_default() += 1;
    }
    let mut terms: Vec<(String, usize)> = counts.into_iter().collect();
    // Sort by frequency, ties alphabetically so the output is stable.
    terms.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    terms.into_iter().take(limit).map(|(w, _)| w).collect()
}

/// A named entity spotted in a chunk.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Entity {
    pub text: String,
    pub kind: String,
    pub start: usize,
    pub end: usize,
}

/// Regex-based entity extraction: proper-noun runs and model identifiers.
pub fn extract_entities(text: &str) -> Vec<Entity> {
    let mut entities = vec![];
    for m in PROPER_NOUN.find_iter(text) {
        entities.push(Entity {
            text: m.as_str().to_owned(),
            kind: "proper_noun".to_owned(),
            start: m.start(),
            end: m.end(),
        });
    }
    for m in IDENTIFIER.find_iter(text) {
        entities.push(Entity {
            text: m.as_str().to_owned(),
            kind: "identifier".to_owned(),
            start: m.start(),
            end: m.end(),
        });
    }
    entities.sort_by_key(|e| e.start);
    entities
}

/// Compute a deterministic trigram embedding, L2-normalized.
///
/// Not a learned model: character trigrams hashed into a fixed-dimension
/// vector. Identical text gives identical vectors, and lexically similar
/// text gives high cosine similarity, which is what the relation builder
/// needs.
pub fn embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; EMBEDDING_DIM];
    let normalized = text.to_lowercase();
    let chars: Vec<char> = normalized.chars().collect();
    for window in chars.windows(3) {
        let mut hasher = Sha256::new();
        let trigram: String = window.iter().collect();
        hasher.update(trigram.as_bytes());
        let digest = hasher.finalize();
        let bucket = u16::from_le_bytes([digest[0], digest[1]]) as usize % EMBEDDING_DIM;
        vector[bucket] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

/// Cosine similarity of two vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| (x * y) as f64).sum()
}

/// Read-mostly embedding cache keyed by chunk id. Writers use
/// last-writer-wins; two writers for the same id compute identical vectors
/// anyway.
#[derive(Default)]
pub struct EmbeddingCache {
    vectors: Mutex<HashMap<String, Vec<f32>>>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the embedding for a chunk, computing and caching it on a miss.
    pub fn get_or_compute(&self, id: &str, text: &str) -> Vec<f32> {
        if let Some(vector) = self.vectors.lock().expect("cache lock poisoned").get(id) {
            return vector.clone();
        }
        let vector = embed(text);
        self.vectors
            .lock()
            .expect("cache lock poisoned")
            .insert(id.to_owned(), vector.clone());
        vector
    }

    /// Look up a cached embedding without computing.
    pub fn get(&self, id: &str) -> Option<Vec<f32>> {
        self.vectors.lock().expect("cache lock poisoned").get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.vectors.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_functions_of_text() {
        let a = chunk_id("the same text");
        let b = chunk_id("the same text");
        let c = chunk_id("different text");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("chunk_"));
        assert_eq!(a.len(), "chunk_".len() + 12);
    }

    #[test]
    fn statistics_count_words_and_sentences() {
        let stats = text_statistics("One two three. Four five!");
        assert_eq!(stats.word_count, 5);
        assert_eq!(stats.sentence_count, 2);
        assert_eq!(stats.unique_words, 5);
        assert!(stats.avg_word_length > 3.0);
        assert_eq!(stats.lexical_diversity, 1.0);
    }

    #[test]
    fn statistics_of_empty_text_are_zero() {
        let stats = text_statistics("");
        assert_eq!(stats, TextStatistics::default());
    }

    #[test]
    fn key_terms_skip_stop_words_and_short_words() {
        let text = "moteur moteur moteur pompe pompe avec avec avec le la un";
        let terms = key_terms(text, 10);
        assert_eq!(terms[0], "moteur");
        assert_eq!(terms[1], "pompe");
        assert!(!terms.contains(&"avec".to_owned()));
        assert!(!terms.contains(&"le".to_owned()));
    }

    #[test]
    fn entities_spot_proper_nouns_and_identifiers() {
        let entities =
            extract_entities("Please contact Jean Dupont about the X-2000 controller.");
        let texts: Vec<&str> = entities.iter().map(|e| e.text.as_str()).collect();
        assert!(texts.contains(&"Jean Dupont"));
        assert!(texts.contains(&"X-2000"));
    }

    #[test]
    fn embeddings_are_deterministic_and_normalized() {
        let a = embed("pump maintenance schedule");
        let b = embed("pump maintenance schedule");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn similar_text_has_higher_cosine_than_unrelated_text() {
        let base = embed("hydraulic pump maintenance and inspection schedule");
        let near = embed("hydraulic pump maintenance and inspection manual");
        let far = embed("completely unrelated musical theory notes");
        assert!(cosine(&base, &near) > cosine(&base, &far));
        assert!(cosine(&base, &base) > 0.999);
    }

    #[test]
    fn cache_computes_once_and_reuses() {
        let cache = EmbeddingCache::new();
        let id = chunk_id("cached text");
        assert!(cache.get(&id).is_none());
        let v1 = cache.get_or_compute(&id, "cached text");
        let v2 = cache.get_or_compute(&id, "cached text");
        assert_eq!(v1, v2);
        assert_eq!(cache.len(), 1);
    }
}
