//! Query/RAG engine.
//!
//! `ask` runs, in order: intent classification (falls back to
//! `fact_extraction`), query embedding, owner-scoped top-K vector
//! retrieval restricted to `indexed` documents, context assembly under a
//! character budget, grounded generation, and persistence of the query
//! row. The returned `sources` are exactly the chunks placed in the
//! context.

use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::embedding::embed_query;
use crate::error::{with_timeout, Error, Result};
use crate::index::collection_for;
use crate::models::{QueryRecord, Source};
use crate::services::Services;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    FactExtraction,
    Summary,
    Explanation,
    Comparison,
    Opinion,
}

impl Intent {
    pub const ALL: [Intent; 5] = [
        Intent::FactExtraction,
        Intent::Summary,
        Intent::Explanation,
        Intent::Comparison,
        Intent::Opinion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::FactExtraction => "fact_extraction",
            Intent::Summary => "summary",
            Intent::Explanation => "explanation",
            Intent::Comparison => "comparison",
            Intent::Opinion => "opinion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        Self::ALL.iter().copied().find(|i| i.as_str() == s)
    }

    fn instruction(&self) -> &'static str {
        match self {
            Intent::FactExtraction => "Answer with the specific facts asked for.",
            Intent::Summary => "Summarize the relevant content concisely.",
            Intent::Explanation => "Explain clearly, step by step where useful.",
            Intent::Comparison => "Compare the items point by point.",
            Intent::Opinion => {
                "Present the viewpoints found in the context; do not add your own."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub intent: Intent,
    pub entities: Vec<String>,
}

impl Default for Classification {
    fn default() -> Self {
        Self {
            intent: Intent::FactExtraction,
            entities: Vec::new(),
        }
    }
}

const CLASSIFY_SYSTEM: &str = "Classify the user's question. Reply with a JSON object \
{\"intent\": one of \"fact_extraction\", \"summary\", \"explanation\", \"comparison\", \
\"opinion\", \"entities\": [named entities mentioned in the question]}. Reply with JSON only.";

const ANSWER_SYSTEM: &str = "You answer questions using only the supplied context from the \
user's documents. Do not use outside knowledge. If the context does not contain the answer, \
say explicitly that the documents do not contain enough information.";

const NO_CONTEXT_SYSTEM: &str = "No documents were available to answer from. Say so first, \
then answer briefly from general knowledge, clearly marked as not coming from the user's \
documents.";

/// Parse a classifier reply. Tolerates prose or code fences around the
/// JSON object; `None` when no known intent is found.
pub fn parse_classification(raw: &str) -> Option<Classification> {
    #[derive(Deserialize)]
    struct Reply {
        intent: String,
        #[serde(default)]
        entities: Vec<serde_json::Value>,
    }

    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    let reply: Reply = serde_json::from_str(&raw[start..=end]).ok()?;
    let intent = Intent::parse(&reply.intent)?;
    let entities = reply
        .entities
        .into_iter()
        .filter_map(|v| v.as_str().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
        .collect();
    Some(Classification { intent, entities })
}

/// Concatenate sources into a numbered context block of at most
/// `max_chars` characters. Returns the context and the sources that made
/// it in (the last one possibly truncated in the context).
pub fn assemble_context(sources: Vec<Source>, max_chars: usize) -> (String, Vec<Source>) {
    let mut context = String::new();
    let mut used_chars = 0;
    let mut used = Vec::new();

    for (n, source) in sources.into_iter().enumerate() {
        let block = format!("[{}] {}\n{}\n\n", n + 1, source.title, source.content);
        let block_chars = block.chars().count();
        let remaining = max_chars.saturating_sub(used_chars);
        if remaining == 0 {
            break;
        }
        if block_chars <= remaining {
            context.push_str(&block);
            used_chars += block_chars;
        } else {
            context.extend(block.chars().take(remaining));
            used_chars = max_chars;
        }
        used.push(source);
    }
    (context, used)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<Source>,
    pub intent: Intent,
    pub entities: Vec<String>,
    /// False when no document context was retrieved.
    pub grounded: bool,
}

#[derive(Clone)]
pub struct QueryEngine {
    svc: Services,
}

impl QueryEngine {
    pub fn new(svc: Services) -> Self {
        Self { svc }
    }

    pub async fn ask(&self, user_id: &str, query: &str) -> Result<Answer> {
        let user_id = user_id.trim();
        let query = query.trim();
        if user_id.is_empty() {
            return Err(Error::Validation("userId is required".into()));
        }
        if query.is_empty() {
            return Err(Error::Validation("query is required".into()));
        }
        let svc = &self.svc;
        let limit = svc.config.pipeline.call_timeout();

        let classification = self.classify(query).await;

        let query_vec = with_timeout(limit, "query embedding", async {
            embed_query(svc.embedder.as_ref(), query)
                .await
                .map_err(Error::from)
        })
        .await
        .map_err(|e| Error::Retrieval(e.message()))?;

        let indexed = svc.metadata.indexed_documents(user_id).await?;
        let eligible: HashSet<String> = indexed.keys().cloned().collect();
        let collection = collection_for(user_id);
        let hits = if eligible.is_empty() {
            Vec::new()
        } else {
            match svc
                .indexer
                .vectors
                .query(&collection, &query_vec, svc.config.retrieval.top_k, Some(&eligible))
                .await
            {
                Ok(hits) => hits,
                Err(e) => {
                    tracing::warn!(collection = %collection, error = %e, "vector retrieval failed; answering without context");
                    Vec::new()
                }
            }
        };

        let retrieved: Vec<Source> = hits
            .into_iter()
            .filter_map(|hit| {
                let title = indexed.get(&hit.document_id)?.clone();
                Some(Source {
                    document_id: hit.document_id,
                    chunk_index: hit.chunk_index,
                    vector_id: hit.vector_id,
                    title,
                    content: hit.content,
                    score: hit.score,
                })
            })
            .collect();

        let (context, sources) = assemble_context(retrieved, svc.config.retrieval.max_context_chars);
        let grounded = !sources.is_empty();

        let (system, user) = if grounded {
            (
                format!("{}\n{}", ANSWER_SYSTEM, classification.intent.instruction()),
                format!("Context:\n{}\nQuestion: {}", context, query),
            )
        } else {
            (
                NO_CONTEXT_SYSTEM.to_string(),
                format!("Question: {}", query),
            )
        };
        let answer = with_timeout(limit, "generation", async {
            svc.generator
                .complete(&system, &user, false)
                .await
                .map_err(Error::from)
        })
        .await
        .map_err(|e| Error::Generation(e.message()))?;

        let record = QueryRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            query: query.to_string(),
            answer: answer.clone(),
            intent: classification.intent.as_str().to_string(),
            entities: classification.entities.clone(),
            sources: sources.clone(),
            grounded,
            created_at: Utc::now(),
        };
        svc.metadata.insert_query(&record).await?;

        tracing::info!(
            user_id,
            intent = classification.intent.as_str(),
            sources = sources.len(),
            grounded,
            "query answered"
        );
        Ok(Answer {
            answer,
            sources,
            intent: classification.intent,
            entities: classification.entities,
            grounded,
        })
    }

    async fn classify(&self, query: &str) -> Classification {
        let limit = self.svc.config.pipeline.call_timeout();
        let reply = with_timeout(limit, "intent classification", async {
            self.svc
                .generator
                .complete(CLASSIFY_SYSTEM, query, true)
                .await
                .map_err(Error::from)
        })
        .await;
        match reply {
            Ok(raw) => parse_classification(&raw).unwrap_or_else(|| {
                tracing::debug!(reply = %raw, "unrecognised classification; using fact_extraction");
                Classification::default()
            }),
            Err(e) => {
                tracing::debug!(error = %e, "intent classification failed; using fact_extraction");
                Classification::default()
            }
        }
    }

    pub async fn history(&self, user_id: &str, limit: i64) -> Result<Vec<QueryRecord>> {
        if user_id.trim().is_empty() {
            return Err(Error::Validation("userId is required".into()));
        }
        Ok(self
            .svc
            .metadata
            .query_history(user_id.trim(), limit.clamp(1, 100))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::FsBlobStore;
    use crate::config::Config;
    use crate::embedding::{EmbeddingProvider, HashProvider};
    use crate::generation::GenerationModel;
    use crate::index::VectorRecord;
    use crate::metadata::NewDocument;
    use crate::models::DocumentStatus;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Classifies everything as a comparison; answers by echoing the prompt.
    struct EchoModel {
        fail_answer: bool,
    }

    #[async_trait]
    impl GenerationModel for EchoModel {
        fn model_name(&self) -> &str {
            "echo"
        }
        async fn complete(&self, _system: &str, user: &str, json_mode: bool) -> anyhow::Result<String> {
            if json_mode {
                return Ok(r#"{"intent":"comparison","entities":["France"]}"#.to_string());
            }
            if self.fail_answer {
                anyhow::bail!("model overloaded");
            }
            Ok(format!("echo: {}", user))
        }
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl EmbeddingProvider for BrokenEmbedder {
        fn model_name(&self) -> &str {
            "broken"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            anyhow::bail!("embedding service unavailable")
        }
    }

    async fn engine(
        embedder: Arc<dyn EmbeddingProvider>,
        fail_answer: bool,
    ) -> (TempDir, Services, QueryEngine) {
        engine_with(embedder, fail_answer, |_| {}).await
    }

    async fn engine_with(
        embedder: Arc<dyn EmbeddingProvider>,
        fail_answer: bool,
        tweak: impl FnOnce(&mut Config),
    ) -> (TempDir, Services, QueryEngine) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::for_data_dir(tmp.path());
        tweak(&mut config);
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        let svc = Services::from_parts(
            config,
            pool,
            Arc::new(FsBlobStore::new(tmp.path().join("blobs"))),
            embedder,
            Arc::new(EchoModel { fail_answer }),
        );
        (tmp, svc.clone(), QueryEngine::new(svc))
    }

    async fn seed(svc: &Services, id: &str, owner: &str, text: &str, status: DocumentStatus) {
        svc.metadata
            .insert_document(&NewDocument {
                id: id.into(),
                owner_id: owner.into(),
                title: format!("{} title", id),
                filename: "a.txt".into(),
                mime_type: "text/plain".into(),
                storage_key: format!("k_{}", id),
            })
            .await
            .unwrap();
        svc.metadata.transition(id, status).await.unwrap();
        let embedding = svc.embedder.embed(&[text.to_string()]).await.unwrap().remove(0);
        svc.indexer
            .index_vectors(
                owner,
                &[VectorRecord {
                    vector_id: format!("{}:0", id),
                    document_id: id.into(),
                    owner_id: owner.into(),
                    chunk_index: 0,
                    content: text.into(),
                    embedding,
                }],
            )
            .await
            .unwrap();
    }

    #[test]
    fn classification_parsing() {
        let c = parse_classification("```json\n{\"intent\": \"Summary\", \"entities\": [\"Q3\", 4, \" \"]}\n```")
            .unwrap();
        assert_eq!(c.intent, Intent::Summary);
        assert_eq!(c.entities, vec!["Q3"]);
        assert!(parse_classification("{\"intent\": \"gossip\"}").is_none());
        assert!(parse_classification("not json").is_none());
    }

    #[test]
    fn context_respects_budget() {
        let source = |i: i64, content: &str| Source {
            document_id: "d".into(),
            chunk_index: i,
            vector_id: format!("d:{}", i),
            title: "T".into(),
            content: content.into(),
            score: 1.0,
        };
        let sources = vec![source(0, "aaaa"), source(1, "bbbb"), source(2, "cccc")];
        // "[1] T\naaaa\n\n" is 12 chars.
        let (context, used) = assemble_context(sources, 20);
        assert_eq!(context.chars().count(), 20);
        assert_eq!(used.len(), 2);
        assert_eq!(used[1].chunk_index, 1);
    }

    #[tokio::test]
    async fn grounded_answer_uses_only_owned_indexed_chunks() {
        let (_tmp, svc, engine) = engine(Arc::new(HashProvider::new(256)), false).await;
        seed(&svc, "paris", "1", "The capital of France is Paris.", DocumentStatus::Indexed).await;
        seed(&svc, "other", "2", "The capital of France is Paris.", DocumentStatus::Indexed).await;
        seed(&svc, "partial", "1", "The capital of France is Paris!", DocumentStatus::Embedding).await;

        let answer = engine.ask("1", "What is the capital of France?").await.unwrap();
        assert!(answer.grounded);
        assert!(answer.answer.contains("Paris"));
        assert_eq!(answer.intent, Intent::Comparison);
        assert_eq!(answer.entities, vec!["France"]);
        assert_eq!(answer.sources.len(), 1);
        assert_eq!(answer.sources[0].document_id, "paris");
        assert_eq!(answer.sources[0].vector_id, "paris:0");

        let history = engine.history("1", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sources, answer.sources);
    }

    #[tokio::test]
    async fn closer_chunks_of_unindexed_documents_do_not_crowd_out_top_k() {
        let (_tmp, svc, engine) = engine_with(Arc::new(HashProvider::new(256)), false, |c| {
            c.retrieval.top_k = 1;
        })
        .await;
        seed(&svc, "paris", "1", "The capital of France is Paris.", DocumentStatus::Indexed).await;
        seed(&svc, "broken", "1", "What is the capital of France?", DocumentStatus::Failed).await;

        let answer = engine.ask("1", "What is the capital of France?").await.unwrap();
        assert!(answer.grounded);
        assert_eq!(answer.sources.len(), 1);
        assert_eq!(answer.sources[0].document_id, "paris");
    }

    #[tokio::test]
    async fn no_documents_is_an_ungrounded_answer() {
        let (_tmp, _svc, engine) = engine(Arc::new(HashProvider::new(64)), false).await;
        let answer = engine.ask("9", "Anything there?").await.unwrap();
        assert!(!answer.grounded);
        assert!(answer.sources.is_empty());
    }

    #[tokio::test]
    async fn provider_failures_map_to_query_errors() {
        let (_tmp, _svc, engine_a) = engine(Arc::new(BrokenEmbedder), false).await;
        assert!(matches!(engine_a.ask("1", "q").await, Err(Error::Retrieval(_))));

        let (_tmp2, _svc2, engine_b) = engine(Arc::new(HashProvider::new(64)), true).await;
        assert!(matches!(engine_b.ask("1", "q").await, Err(Error::Generation(_))));
        assert!(engine_b.history("1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blank_input_is_rejected() {
        let (_tmp, _svc, engine) = engine(Arc::new(HashProvider::new(64)), false).await;
        assert!(matches!(engine.ask(" ", "q").await, Err(Error::Validation(_))));
        assert!(matches!(engine.ask("1", "").await, Err(Error::Validation(_))));
    }
}
