//! Prompt templates and the context-budgeted renderer.
//!
//! Rendering is deterministic given identical inputs. The renderer
//! enforces a character budget on context: for retrieval cells the
//! lowest-similarity chunks are dropped first, for full-document cells
//! the document tail is truncated. The question itself is never dropped.

use crate::document::Document;
use crate::matrix::PromptVariant;
use crate::question::Question;
use crate::retriever::RetrievedChunk;

/// Collection of prompt templates used for answer generation.
pub struct Prompts;

impl Prompts {
    /// Plain question-plus-context prompt.
    pub fn naive_answer() -> &'static str {
        r#"Answer the question using the provided document content.

Document content:
{context}

Question: {question}

Answer:"#
    }

    /// Prompt with citation and abstention instructions.
    pub fn optimized_answer() -> &'static str {
        r#"You are analyzing deal documents. Answer the question using ONLY the provided document content. Do not use outside knowledge.

Document content:
{context}

Question: {question}

Instructions:
1. Answer concisely and factually.
2. Cite the supporting document and page where possible, and quote the exact supporting passage when you can.
3. If the provided content does not contain the answer, reply exactly: INSUFFICIENT EVIDENCE.
4. State your confidence as HIGH, MEDIUM, or LOW on the final line.

Answer:"#
    }

    /// Naive prompt with no document context (contamination baseline).
    pub fn naive_closed_book() -> &'static str {
        r#"Answer the following question.

Question: {question}

Answer:"#
    }

    /// Optimized prompt with no document context (contamination baseline).
    pub fn optimized_closed_book() -> &'static str {
        r#"Answer the following question from your own knowledge.

Question: {question}

Instructions:
1. Answer concisely and factually.
2. If you do not know the answer, reply exactly: INSUFFICIENT EVIDENCE.
3. State your confidence as HIGH, MEDIUM, or LOW on the final line.

Answer:"#
    }
}

/// The marker an abstaining response must contain.
pub const ABSTAIN_MARKER: &str = "INSUFFICIENT EVIDENCE";

/// Renders final model inputs under a context character budget.
#[derive(Debug, Clone, Copy)]
pub struct PromptRenderer {
    budget_chars: usize,
}

impl PromptRenderer {
    /// Create a renderer with the given total character budget.
    pub fn new(budget_chars: usize) -> Self {
        Self { budget_chars }
    }

    /// Render a prompt with no document context.
    pub fn render_closed_book(&self, variant: PromptVariant, question: &Question) -> String {
        let template = match variant {
            PromptVariant::Naive => Prompts::naive_closed_book(),
            PromptVariant::Optimized => Prompts::optimized_closed_book(),
        };
        template.replace("{question}", &question.text)
    }

    /// Render a prompt carrying the full document text.
    pub fn render_full_text(
        &self,
        variant: PromptVariant,
        question: &Question,
        document: &Document,
    ) -> String {
        let budget = self.context_budget(variant, question);
        let context = if document.text.chars().count() > budget {
            document.text.chars().take(budget).collect::<String>()
        } else {
            document.text.clone()
        };
        self.fill(variant, question, &context)
    }

    /// Render a prompt carrying retrieved chunks.
    ///
    /// Chunks must arrive in descending similarity order (as produced by
    /// the retriever); over-budget chunks are dropped from the tail so
    /// the lowest-priority context goes first.
    pub fn render_retrieval(
        &self,
        variant: PromptVariant,
        question: &Question,
        chunks: &[RetrievedChunk],
    ) -> String {
        let budget = self.context_budget(variant, question);

        let mut blocks = Vec::new();
        let mut used = 0usize;
        for retrieved in chunks {
            let block = format!("[Score: {:.3}]\n{}", retrieved.score, retrieved.chunk.text);
            let cost = block.chars().count() + if blocks.is_empty() { 0 } else { 7 };
            if used + cost > budget {
                break;
            }
            used += cost;
            blocks.push(block);
        }

        let context = blocks.join("\n\n---\n\n");
        self.fill(variant, question, &context)
    }

    /// Characters available for context after template and question.
    fn context_budget(&self, variant: PromptVariant, question: &Question) -> usize {
        let template = match variant {
            PromptVariant::Naive => Prompts::naive_answer(),
            PromptVariant::Optimized => Prompts::optimized_answer(),
        };
        let overhead = template.chars().count() + question.text.chars().count();
        self.budget_chars.saturating_sub(overhead)
    }

    fn fill(&self, variant: PromptVariant, question: &Question, context: &str) -> String {
        let template = match variant {
            PromptVariant::Naive => Prompts::naive_answer(),
            PromptVariant::Optimized => Prompts::optimized_answer(),
        };
        template
            .replace("{context}", context)
            .replace("{question}", &question.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Chunk;

    fn question() -> Question {
        Question {
            id: "q1".to_string(),
            text: "What is the exchange ratio?".to_string(),
            category: "extraction".to_string(),
            document_id: "merger-agreement".to_string(),
        }
    }

    fn retrieved(index: usize, score: f32, text: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk: Chunk {
                index,
                start: 0,
                end: text.len(),
                text: text.to_string(),
            },
            score,
        }
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let renderer = PromptRenderer::new(10_000);
        let doc = Document::from_text("merger-agreement", "The ratio is 0.25.");
        let a = renderer.render_full_text(PromptVariant::Optimized, &question(), &doc);
        let b = renderer.render_full_text(PromptVariant::Optimized, &question(), &doc);
        assert_eq!(a, b);
        assert!(a.contains("What is the exchange ratio?"));
        assert!(a.contains("The ratio is 0.25."));
    }

    #[test]
    fn test_variants_differ() {
        let renderer = PromptRenderer::new(10_000);
        let doc = Document::from_text("merger-agreement", "text");
        let naive = renderer.render_full_text(PromptVariant::Naive, &question(), &doc);
        let optimized = renderer.render_full_text(PromptVariant::Optimized, &question(), &doc);
        assert_ne!(naive, optimized);
        assert!(optimized.contains(ABSTAIN_MARKER));
    }

    #[test]
    fn test_lowest_similarity_chunks_dropped_first() {
        let chunks = vec![
            retrieved(0, 0.9, &"a".repeat(200)),
            retrieved(1, 0.5, &"b".repeat(200)),
            retrieved(2, 0.1, &"c".repeat(200)),
        ];
        // Budget fits the template, question, and roughly two blocks.
        let template_overhead = Prompts::naive_answer().chars().count()
            + question().text.chars().count();
        let renderer = PromptRenderer::new(template_overhead + 450);

        let prompt = renderer.render_retrieval(PromptVariant::Naive, &question(), &chunks);
        assert!(prompt.contains(&"a".repeat(200)));
        assert!(prompt.contains(&"b".repeat(200)));
        assert!(!prompt.contains(&"c".repeat(200)));
    }

    #[test]
    fn test_question_never_dropped() {
        // Budget far below any context; the question must survive.
        let renderer = PromptRenderer::new(10);
        let doc = Document::from_text("merger-agreement", &"x".repeat(5000));
        let prompt = renderer.render_full_text(PromptVariant::Naive, &question(), &doc);
        assert!(prompt.contains("What is the exchange ratio?"));
        assert!(!prompt.contains(&"x".repeat(100)));

        let chunks = vec![retrieved(0, 0.9, &"y".repeat(500))];
        let prompt = renderer.render_retrieval(PromptVariant::Naive, &question(), &chunks);
        assert!(prompt.contains("What is the exchange ratio?"));
    }

    #[test]
    fn test_full_text_truncated_at_tail() {
        let template_overhead = Prompts::naive_answer().chars().count()
            + question().text.chars().count();
        let renderer = PromptRenderer::new(template_overhead + 10);

        let doc = Document::from_text("merger-agreement", "0123456789ABCDEF");
        let prompt = renderer.render_full_text(PromptVariant::Naive, &question(), &doc);
        assert!(prompt.contains("0123456789"));
        assert!(!prompt.contains("ABCDEF"));
    }

    #[test]
    fn test_closed_book_has_no_context_slot() {
        let renderer = PromptRenderer::new(10_000);
        let prompt = renderer.render_closed_book(PromptVariant::Naive, &question());
        assert!(prompt.contains("What is the exchange ratio?"));
        assert!(!prompt.contains("{context}"));
    }
}
