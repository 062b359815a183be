//! Structure-aware text segmentation with cross-chunk relations.
//!
//! The chunker scans the text for named structural elements (figures,
//! tables, equations, section references), segments the text semantically,
//! enriches every chunk with metadata, and links chunks with typed relation
//! edges: the linear `previous`/`next` chain, `semantic_similarity` edges
//! above a cosine threshold, and `shared_*` edges between chunks mentioning
//! the same structural element.
//!
//! Relations are an adjacency list keyed by chunk id, never pointers, so a
//! chunk graph serializes and reloads cleanly. Chunk ids are content hashes:
//! the same text yields the same ids on every run.

pub mod enrich;
pub mod segment;

use std::{collections::HashMap, sync::LazyLock, sync::Mutex};

use regex::Regex;
use schemars::JsonSchema;

use crate::prelude::*;

use enrich::{Entity, TextStatistics};

/// Default maximum chunk size, in characters.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 1000;

/// Default overlap carried between chunks, in characters.
pub const DEFAULT_OVERLAP: usize = 100;

/// Default cosine threshold for `semantic_similarity` edges.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.7;

/// Kinds of structural elements we detect.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Figure,
    Table,
    Equation,
    SectionRef,
}

impl ElementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ElementKind::Figure => "figure",
            ElementKind::Table => "table",
            ElementKind::Equation => "equation",
            ElementKind::SectionRef => "section_ref",
        }
    }
}

/// A structural element found in the source text.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct StructuralElement {
    pub kind: ElementKind,
    /// The element's number, e.g. `3` or `4.2`.
    pub id: String,
    /// The matched reference text, e.g. `figure 3`.
    pub reference: String,
    pub start: usize,
    pub end: usize,
    /// A small context window around the match.
    pub context: String,
}

impl StructuralElement {
    /// The key used for shared-element relations, e.g. `figure_3`.
    pub fn key(&self) -> String {
        format!("{}_{}", self.kind.as_str(), self.id)
    }
}

/// A structural element reference stored on a chunk.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ElementRef {
    pub kind: ElementKind,
    pub id: String,
    pub reference: String,
}

/// Relation edge types between chunks.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Previous,
    Next,
    SemanticSimilarity,
    SharedFigure,
    SharedTable,
    SharedEquation,
    SharedSectionRef,
}

impl RelationKind {
    fn shared(kind: ElementKind) -> RelationKind {
        match kind {
            ElementKind::Figure => RelationKind::SharedFigure,
            ElementKind::Table => RelationKind::SharedTable,
            ElementKind::Equation => RelationKind::SharedEquation,
            ElementKind::SectionRef => RelationKind::SharedSectionRef,
        }
    }
}

/// One relation edge in a chunk's adjacency list.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ChunkRelation {
    /// The related chunk's id.
    pub chunk_id: String,

    /// The relation type.
    pub kind: RelationKind,

    /// Edge strength in `[0, 1]`. Sequence edges are 1.0.
    pub strength: f64,

    /// The shared element key for `shared_*` edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
}

/// Metadata attached to each chunk.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ChunkMetadata {
    /// Content statistics.
    pub statistics: TextStatistics,

    /// Top key terms by frequency.
    pub key_terms: Vec<String>,

    /// Entities spotted in the chunk.
    pub entities: Vec<Entity>,

    /// Structural elements whose source offsets fall inside this chunk.
    pub structural_elements: Vec<ElementRef>,

    /// Whether an embedding is available in the side cache.
    pub has_embedding: bool,
}

/// A chunk of output text with metadata, relations, and a stable id.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct TextChunk {
    /// Content-hash id; a pure function of `text`.
    pub id: String,

    /// The chunk's text, including any overlap prefix.
    pub text: String,

    /// Byte offset of the chunk's first fresh content in the document.
    pub position: usize,

    /// The chunk's index in document order.
    pub sequence: usize,

    /// Enriched metadata.
    pub metadata: ChunkMetadata,

    /// Adjacency list of typed relation edges.
    pub relations: Vec<ChunkRelation>,
}

/// Aggregate facts about one chunking run.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ChunkingSummary {
    pub chunk_count: usize,
    pub element_count: usize,
    pub relation_count: usize,
    pub language: String,
}

/// The chunker's output.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ChunkingOutput {
    pub chunks: Vec<TextChunk>,
    pub elements: Vec<StructuralElement>,
    pub summary: ChunkingSummary,
}

/// Chunker configuration.
#[derive(Clone, Debug)]
pub struct ChunkerConfig {
    pub max_chunk_size: usize,
    pub overlap: usize,
    pub compute_embeddings: bool,
    pub similarity_threshold: f64,
    pub key_term_limit: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            overlap: DEFAULT_OVERLAP,
            compute_embeddings: true,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            key_term_limit: 10,
        }
    }
}

static FIGURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(figure|fig\.?|schéma|diagramme)\s+(\d+[a-z]?)").expect("static regex")
});
static TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(tableau|table)\s+(\d+[a-z]?)").expect("static regex")
});
static EQUATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(équation|equation|formule|eq\.?)\s+(\d+[a-z]?)").expect("static regex")
});
static SECTION_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(voir|cf\.?|see|référence|ref\.?)\s+(?:(section|chapitre|chapter|partie)\s+)?(\d+(?:\.\d+)*)")
        .expect("static regex")
});

/// Structure-aware chunker with metadata and relation enrichment.
pub struct RelationalChunker {
    config: ChunkerConfig,
    embeddings: enrich::EmbeddingCache,
    /// Metadata cache keyed by chunk id (content hash). Read-mostly;
    /// last-writer-wins.
    metadata_cache: Mutex<HashMap<String, ChunkMetadata>>,
}

impl RelationalChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self {
            config,
            embeddings: enrich::EmbeddingCache::new(),
            metadata_cache: Mutex::new(HashMap::new()),
        }
    }

    /// The embedding side cache, for downstream indexing.
    pub fn embeddings(&self) -> &enrich::EmbeddingCache {
        &self.embeddings
    }

    /// Chunk a document's text.
    #[instrument(level = "debug", skip_all, fields(len = text.len()))]
    pub fn chunk(&self, text: &str) -> ChunkingOutput {
        if text.trim().is_empty() {
            return ChunkingOutput {
                chunks: vec![],
                elements: vec![],
                summary: ChunkingSummary {
                    chunk_count: 0,
                    element_count: 0,
                    relation_count: 0,
                    language: "unknown".to_owned(),
                },
            };
        }

        let language = segment::detect_language(text);
        let elements = detect_structural_elements(text);

        // Semantic segmentation.
        let units = segment::extract_units(text, language);
        let packed =
            segment::pack_units(&units, self.config.max_chunk_size, self.config.overlap);

        // Build chunks with enriched metadata.
        let mut chunks: Vec<TextChunk> = packed
            .iter()
            .enumerate()
            .map(|(sequence, piece)| {
                let id = enrich::chunk_id(&piece.text);
                let span = piece.offset..piece.offset + piece.text.len();
                let structural: Vec<ElementRef> = elements
                    .iter()
                    .filter(|e| e.start < span.end && e.end > span.start)
                    .map(|e| ElementRef {
                        kind: e.kind,
                        id: e.id.clone(),
                        reference: e.reference.clone(),
                    })
                    .collect();
                let metadata = self.enrich_metadata(&id, &piece.text, structural);
                TextChunk {
                    id,
                    text: piece.text.clone(),
                    position: piece.offset,
                    sequence,
                    metadata,
                    relations: vec![],
                }
            })
            .collect();

        self.link_sequence(&mut chunks);
        if self.config.compute_embeddings {
            self.link_similar(&mut chunks);
        }
        let element_links = link_shared_elements(&mut chunks);

        let relation_count = chunks.iter().map(|c| c.relations.len()).sum();
        let summary = ChunkingSummary {
            chunk_count: chunks.len(),
            element_count: elements.len(),
            relation_count,
            language: match language {
                segment::Language::French => "fra".to_owned(),
                segment::Language::English => "eng".to_owned(),
                segment::Language::Other => "unknown".to_owned(),
            },
        };
        debug!(
            "chunked into {} chunks, {} elements, {} relations ({} shared-element links)",
            summary.chunk_count, summary.element_count, relation_count, element_links
        );

        ChunkingOutput {
            chunks,
            elements,
            summary,
        }
    }

    /// Compute (or reuse) a chunk's metadata.
    fn enrich_metadata(
        &self,
        id: &str,
        text: &str,
        structural: Vec<ElementRef>,
    ) -> ChunkMetadata {
        if let Some(cached) = self.metadata_cache.lock().expect("cache lock").get(id) {
            let mut metadata = cached.clone();
            // Structural references depend on document position, not just
            // content, so they are never cached.
            metadata.structural_elements = structural;
            return metadata;
        }

        let has_embedding = if self.config.compute_embeddings {
            self.embeddings.get_or_compute(id, text);
            true
        } else {
            false
        };
        let metadata = ChunkMetadata {
            statistics: enrich::text_statistics(text),
            key_terms: enrich::key_terms(text, self.config.key_term_limit),
            entities: enrich::extract_entities(text),
            structural_elements: structural,
            has_embedding,
        };
        self.metadata_cache
            .lock()
            .expect("cache lock")
            .insert(id.to_owned(), metadata.clone());
        metadata
    }

    /// Add the `previous`/`next` chain.
    fn link_sequence(&self, chunks: &mut [TextChunk]) {
        let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        for (i, chunk) in chunks.iter_mut().enumerate() {
            if i > 0 {
                push_relation(chunk, &ids[i - 1], RelationKind::Previous, 1.0, None);
            }
            if i + 1 < ids.len() {
                push_relation(chunk, &ids[i + 1], RelationKind::Next, 1.0, None);
            }
        }
    }

    /// Add `semantic_similarity` edges above the cosine threshold.
    fn link_similar(&self, chunks: &mut [TextChunk]) {
        let vectors: Vec<Vec<f32>> = chunks
            .iter()
            .map(|c| self.embeddings.get_or_compute(&c.id, &c.text))
            .collect();
        let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();

        for i in 0..chunks.len() {
            for j in 0..chunks.len() {
                if i == j {
                    continue;
                }
                let similarity = enrich::cosine(&vectors[i], &vectors[j]);
                if similarity >= self.config.similarity_threshold {
                    push_relation(
                        &mut chunks[i],
                        &ids[j],
                        RelationKind::SemanticSimilarity,
                        (similarity * 1000.0).round() / 1000.0,
                        None,
                    );
                }
            }
        }
    }
}

/// Scan the text for named structural elements.
pub fn detect_structural_elements(text: &str) -> Vec<StructuralElement> {
    let mut elements = vec![];
    let patterns: [(&Regex, ElementKind, usize); 4] = [
        (&FIGURE, ElementKind::Figure, 2),
        (&TABLE, ElementKind::Table, 2),
        (&EQUATION, ElementKind::Equation, 2),
        (&SECTION_REF, ElementKind::SectionRef, 3),
    ];
    for (pattern, kind, id_group) in patterns {
        for captures in pattern.captures_iter(text) {
            let whole = captures.get(0).expect("match group 0");
            let id = captures
                .get(id_group)
                .map(|m| m.as_str().to_owned())
                .unwrap_or_default();
            elements.push(StructuralElement {
                kind,
                id,
                reference: whole.as_str().to_owned(),
                start: whole.start(),
                end: whole.end(),
                context: context_window(text, whole.start(), whole.end()),
            });
        }
    }
    elements.sort_by_key(|e| e.start);
    elements
}

/// A ±50-character window around a match, clamped to char boundaries.
fn context_window(text: &str, start: usize, end: usize) -> String {
    let mut lo = start.saturating_sub(50);
    while lo > 0 && !text.is_char_boundary(lo) {
        lo -= 1;
    }
    let mut hi = (end + 50).min(text.len());
    while hi < text.len() && !text.is_char_boundary(hi) {
        hi += 1;
    }
    text[lo..hi].to_owned()
}

/// Link all chunks that mention the same structural element. Returns the
/// number of distinct shared elements.
fn link_shared_elements(chunks: &mut [TextChunk]) -> usize {
    // Index chunk positions by element key.
    let mut by_element: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, chunk) in chunks.iter().enumerate() {
        for element in &chunk.metadata.structural_elements {
            let key = format!("{}_{}", element.kind.as_str(), element.id);
            let entry = by_element.entry(key).or_default();
            if entry.last() != Some(&i) {
                entry.push(i);
            }
        }
    }

    let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
    let mut shared = 0;
    for (key, members) in &by_element {
        if members.len() <= 1 {
            continue;
        }
        shared += 1;
        let kind = chunks[members[0]]
            .metadata
            .structural_elements
            .iter()
            .find(|e| format!("{}_{}", e.kind.as_str(), e.id) == *key)
            .map(|e| e.kind)
            .expect("element present in member chunk");
        for &i in members {
            for &j in members {
                if i == j {
                    continue;
                }
                push_relation(
                    &mut chunks[i],
                    &ids[j],
                    RelationKind::shared(kind),
                    0.8,
                    Some(key.clone()),
                );
            }
        }
    }
    shared
}

/// Append a relation unless an identical (target, kind) edge exists.
fn push_relation(
    chunk: &mut TextChunk,
    target: &str,
    kind: RelationKind,
    strength: f64,
    element_id: Option<String>,
) {
    if chunk
        .relations
        .iter()
        .any(|r| r.chunk_id == target && r.kind == kind)
    {
        return;
    }
    chunk.relations.push(ChunkRelation {
        chunk_id: target.to_owned(),
        kind,
        strength,
        element_id,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> RelationalChunker {
        RelationalChunker::new(ChunkerConfig::default())
    }

    #[test]
    fn empty_input_yields_no_chunks_and_no_error() {
        let output = chunker().chunk("");
        assert!(output.chunks.is_empty());
        assert!(output.elements.is_empty());
        let output = chunker().chunk("   \n\n  ");
        assert!(output.chunks.is_empty());
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let output = chunker().chunk("A short maintenance note.");
        assert_eq!(output.chunks.len(), 1);
        let chunk = &output.chunks[0];
        assert!(chunk.relations.is_empty());
        assert_eq!(chunk.sequence, 0);
        assert_eq!(chunk.metadata.statistics.word_count, 4);
    }

    #[test]
    fn exactly_max_size_is_one_chunk() {
        let config = ChunkerConfig::default();
        let text = "a".repeat(config.max_chunk_size);
        let output = chunker().chunk(&text);
        assert_eq!(output.chunks.len(), 1);
    }

    #[test]
    fn one_over_max_size_is_two_chunks_with_overlap() {
        let config = ChunkerConfig::default();
        let text = "a".repeat(config.max_chunk_size + 1);
        let output = chunker().chunk(&text);
        assert!(output.chunks.len() >= 2);
        // The windows overlap: total text exceeds the input length.
        let total: usize = output.chunks.iter().map(|c| c.text.len()).sum();
        assert!(total > text.len());
    }

    #[test]
    fn ids_are_deterministic_across_runs() {
        let text = "Voir figure 3 pour le schéma.\n\nLe tableau 2 liste les pièces.";
        let first = chunker().chunk(text);
        let second = chunker().chunk(text);
        let ids_a: Vec<&str> = first.chunks.iter().map(|c| c.id.as_str()).collect();
        let ids_b: Vec<&str> = second.chunks.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn sequence_relations_form_a_chain() {
        let paragraphs: Vec<String> = (0..8)
            .map(|i| format!("Paragraph {i} talks about pump maintenance at length, with enough words that several paragraphs cannot share one chunk. It keeps going for a while to fill space."))
            .collect();
        let text = paragraphs.join("\n\n");
        let output = chunker().chunk(&text);
        let chunks = &output.chunks;
        assert!(chunks.len() >= 2);

        for (i, chunk) in chunks.iter().enumerate() {
            let previous: Vec<&ChunkRelation> = chunk
                .relations
                .iter()
                .filter(|r| r.kind == RelationKind::Previous)
                .collect();
            let next: Vec<&ChunkRelation> = chunk
                .relations
                .iter()
                .filter(|r| r.kind == RelationKind::Next)
                .collect();
            if i == 0 {
                assert!(previous.is_empty());
            } else {
                assert_eq!(previous.len(), 1);
                assert_eq!(previous[0].chunk_id, chunks[i - 1].id);
                assert_eq!(previous[0].strength, 1.0);
            }
            if i == chunks.len() - 1 {
                assert!(next.is_empty());
            } else {
                assert_eq!(next.len(), 1);
                assert_eq!(next[0].chunk_id, chunks[i + 1].id);
            }
        }
    }

    #[test]
    fn structural_elements_are_detected_in_french_and_english() {
        let text = "Voir figure 3 et tableau 2. L'équation 5 suit. See section 4.2 for details.";
        let elements = detect_structural_elements(text);
        let kinds: Vec<(ElementKind, &str)> =
            elements.iter().map(|e| (e.kind, e.id.as_str())).collect();
        assert!(kinds.contains(&(ElementKind::Figure, "3")));
        assert!(kinds.contains(&(ElementKind::Table, "2")));
        assert!(kinds.contains(&(ElementKind::Equation, "5")));
        assert!(kinds.contains(&(ElementKind::SectionRef, "4.2")));
    }

    #[test]
    fn element_context_includes_surrounding_text() {
        let text = format!("{} figure 7 {}", "x".repeat(100), "y".repeat(100));
        let elements = detect_structural_elements(&text);
        assert_eq!(elements.len(), 1);
        assert!(elements[0].context.contains("figure 7"));
        assert!(elements[0].context.len() <= "figure 7".len() + 100 + 2);
    }

    #[test]
    fn chunks_sharing_an_element_are_linked() {
        // Two far-apart paragraphs both mention figure 12.
        let filler = "Du texte de remplissage assez long pour forcer plusieurs chunks distincts dans le document analysé. ".repeat(8);
        let text = format!(
            "La figure 12 montre le montage.\n\n{filler}\n\nRevenons à la figure 12 pour conclure."
        );
        let output = chunker().chunk(&text);
        assert!(output.chunks.len() >= 2);

        let linked: Vec<&TextChunk> = output
            .chunks
            .iter()
            .filter(|c| {
                c.relations
                    .iter()
                    .any(|r| r.kind == RelationKind::SharedFigure)
            })
            .collect();
        assert!(linked.len() >= 2, "expected shared-figure links");
        for chunk in linked {
            let edge = chunk
                .relations
                .iter()
                .find(|r| r.kind == RelationKind::SharedFigure)
                .unwrap();
            assert_eq!(edge.element_id.as_deref(), Some("figure_12"));
            assert_eq!(edge.strength, 0.8);
            // Edges reference chunks from this run only.
            assert!(output.chunks.iter().any(|c| c.id == edge.chunk_id));
        }
    }

    #[test]
    fn embeddings_flag_follows_configuration() {
        let output = chunker().chunk("Some text with embeddings on.");
        assert!(output.chunks[0].metadata.has_embedding);

        let off = RelationalChunker::new(ChunkerConfig {
            compute_embeddings: false,
            ..ChunkerConfig::default()
        });
        let output = off.chunk("Some text with embeddings off.");
        assert!(!output.chunks[0].metadata.has_embedding);
    }

    #[test]
    fn near_duplicate_chunks_get_similarity_edges() {
        let a = "The hydraulic pump maintenance procedure requires draining the reservoir completely before inspection of the seals and gaskets begins in earnest.";
        let b = "The hydraulic pump maintenance procedure requires draining the reservoir completely before inspection of the seals and fittings begins in earnest.";
        let text = format!("{a}\n\n{}\n\n{b}", "Unrelated filler text about accounting spreadsheets and quarterly budget reviews. ".repeat(10));
        let output = RelationalChunker::new(ChunkerConfig {
            // Force one chunk per paragraph.
            max_chunk_size: 400,
            overlap: 0,
            ..ChunkerConfig::default()
        })
        .chunk(&text);

        let first = output
            .chunks
            .iter()
            .find(|c| c.text.contains("seals and gaskets"))
            .expect("first paragraph chunk");
        assert!(
            first
                .relations
                .iter()
                .any(|r| r.kind == RelationKind::SemanticSimilarity),
            "expected a similarity edge, got {:?}",
            first.relations
        );
    }
}
