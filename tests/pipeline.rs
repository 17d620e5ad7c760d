//! End-to-end pipeline tests: upload → extraction → chunking & embedding →
//! search and question answering, driven by draining the stage runners.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use docusearch::blob::{BlobStore, FsBlobStore};
use docusearch::bus::{ConsumerGroup, EventBus};
use docusearch::config::Config;
use docusearch::embedding::{EmbeddingProvider, HashProvider};
use docusearch::error::Error;
use docusearch::generation::GenerationModel;
use docusearch::ingest::{Coordinator, Upload};
use docusearch::models::DocumentStatus;
use docusearch::query::QueryEngine;
use docusearch::search::SearchService;
use docusearch::services::Services;
use docusearch::stages::{EmbeddingStage, ExtractionStage};
use docusearch::worker::{drain_all, StageRunner};

/// Answers by echoing the prompt, so grounded context shows up in the answer.
struct EchoModel;

#[async_trait]
impl GenerationModel for EchoModel {
    fn model_name(&self) -> &str {
        "echo"
    }
    async fn complete(&self, _system: &str, user: &str, json_mode: bool) -> anyhow::Result<String> {
        if json_mode {
            return Ok(r#"{"intent":"fact_extraction","entities":["France"]}"#.to_string());
        }
        Ok(format!("Based on the documents: {}", user))
    }
}

/// Hash embeddings that can be told to fail every call after the first
/// `ok_calls` ones.
struct FlakyEmbedder {
    inner: HashProvider,
    calls: AtomicUsize,
    failing: AtomicBool,
    ok_calls: usize,
}

impl FlakyEmbedder {
    fn new(ok_calls: usize) -> Self {
        Self {
            inner: HashProvider::new(128),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            ok_calls,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for FlakyEmbedder {
    fn model_name(&self) -> &str {
        "flaky-hash"
    }
    fn dims(&self) -> usize {
        128
    }
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) && call >= self.ok_calls {
            anyhow::bail!("embedding service returned 503");
        }
        self.inner.embed(texts).await
    }
}

/// Filesystem blobs whose reads fail while `failures` is above zero.
/// `usize::MAX` never recovers.
struct FlakyBlobs {
    inner: FsBlobStore,
    failures: AtomicUsize,
}

#[async_trait]
impl BlobStore for FlakyBlobs {
    async fn put(&self, key: &str, content: &[u8], content_type: &str) -> anyhow::Result<()> {
        self.inner.put(key, content, content_type).await
    }
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            if left != usize::MAX {
                self.failures.store(left - 1, Ordering::SeqCst);
            }
            anyhow::bail!("blob store connection reset");
        }
        self.inner.get(key).await
    }
    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.inner.delete(key).await
    }
    fn presigned_read_url(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.inner.presigned_read_url(key)
    }
}

/// Hash embeddings that delete the document being embedded on the
/// `delete_on`-th call (0-based), as a concurrent user delete would.
struct DeletingEmbedder {
    inner: HashProvider,
    calls: AtomicUsize,
    delete_on: usize,
    target: OnceLock<(Coordinator, String)>,
}

#[async_trait]
impl EmbeddingProvider for DeletingEmbedder {
    fn model_name(&self) -> &str {
        "deleting-hash"
    }
    fn dims(&self) -> usize {
        128
    }
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == self.delete_on {
            if let Some((coordinator, id)) = self.target.get() {
                coordinator.delete(id).await?;
            }
        }
        self.inner.embed(texts).await
    }
}

struct Harness {
    _tmp: TempDir,
    svc: Services,
    runners: Vec<Arc<StageRunner>>,
    coordinator: Coordinator,
    search: SearchService,
    query: QueryEngine,
}

impl Harness {
    async fn new(embedder: Arc<dyn EmbeddingProvider>, tweak: impl FnOnce(&mut Config)) -> Self {
        Self::with_blobs(embedder, tweak, |root| Arc::new(FsBlobStore::new(root))).await
    }

    async fn with_blobs(
        embedder: Arc<dyn EmbeddingProvider>,
        tweak: impl FnOnce(&mut Config),
        blobs: impl FnOnce(std::path::PathBuf) -> Arc<dyn BlobStore>,
    ) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::for_data_dir(tmp.path());
        config.extraction.ocr = false;
        config.pipeline.retry_backoff_ms = 0;
        tweak(&mut config);

        let pool = docusearch::db::connect(&config).await.unwrap();
        docusearch::migrate::run_migrations(&pool).await.unwrap();
        let blobs = blobs(config.blob.root.clone());
        let svc = Services::from_parts(config, pool, blobs, embedder, Arc::new(EchoModel));

        let runners = vec![
            Arc::new(StageRunner::new(
                svc.bus.clone(),
                Arc::new(ExtractionStage::new(svc.clone())),
                svc.config.pipeline.clone(),
            )),
            Arc::new(StageRunner::new(
                svc.bus.clone(),
                Arc::new(EmbeddingStage::new(svc.clone())),
                svc.config.pipeline.clone(),
            )),
        ];
        Self {
            _tmp: tmp,
            coordinator: Coordinator::new(svc.clone()),
            search: SearchService::new(svc.clone()),
            query: QueryEngine::new(svc.clone()),
            svc,
            runners,
        }
    }

    async fn upload(&self, owner: &str, mime: &str, content: &str) -> String {
        self.coordinator
            .upload(Upload {
                owner_id: owner.into(),
                title: Some("Geography notes".into()),
                filename: "notes.txt".into(),
                mime_type: mime.into(),
                content: content.as_bytes().to_vec(),
            })
            .await
            .unwrap()
    }

    async fn drain(&self) {
        drain_all(&self.runners).await.unwrap();
    }

    async fn vector_count(&self, document_id: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE document_id = ?")
            .bind(document_id)
            .fetch_one(&self.svc.pool)
            .await
            .unwrap()
    }
}

async fn default_harness() -> Harness {
    Harness::new(Arc::new(HashProvider::new(256)), |_| {}).await
}

#[tokio::test]
async fn paris_document_is_indexed_searchable_and_answerable() {
    let h = default_harness().await;
    let id = h
        .upload("1", "text/plain", "The capital of France is Paris.")
        .await;
    h.drain().await;

    let status = h.coordinator.status(&id).await.unwrap();
    assert_eq!(status.stage, DocumentStatus::Indexed);
    assert_eq!(status.progress, 100);
    assert!(status.error.is_none());

    let doc = h.coordinator.document(&id).await.unwrap().document;
    assert_eq!(doc.text_content.as_deref(), Some("The capital of France is Paris."));
    assert_eq!(doc.external_search_id.as_deref(), Some(id.as_str()));
    assert_eq!(doc.external_vector_collection.as_deref(), Some("owner_1"));
    let meta = doc.metadata.unwrap();
    assert_eq!(meta.word_count, 6);
    assert_eq!(meta.title, "Geography notes");

    let chunks = h.svc.metadata.chunks(&id).await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].vector_id.as_deref(), Some(format!("{}:0", id).as_str()));

    let found = h.search.search("1", "Paris", None, None).await.unwrap();
    assert_eq!(found.total, 1);
    assert_eq!(found.results[0].document_id, id);

    let answer = h
        .query
        .ask("1", "What is the capital of France?")
        .await
        .unwrap();
    assert!(answer.grounded);
    assert!(answer.answer.contains("Paris"));
    assert_eq!(answer.sources.len(), 1);
    assert_eq!(answer.sources[0].document_id, id);
    assert_eq!(answer.entities, vec!["France"]);
}

#[tokio::test]
async fn unknown_mime_type_fails_without_retry_and_is_never_searchable() {
    let h = default_harness().await;
    let id = h
        .upload("1", "application/x-unknown", "The capital of France is Paris.")
        .await;
    h.drain().await;

    let status = h.coordinator.status(&id).await.unwrap();
    assert_eq!(status.stage, DocumentStatus::Failed);
    assert_eq!(status.failed_stage, Some(DocumentStatus::Extracting));
    let error = status.error.unwrap();
    assert!(
        error.starts_with("UnsupportedFormatError during extracting"),
        "{}",
        error
    );

    assert!(h.svc.bus.dead_letters(10).await.unwrap().is_empty());
    assert_eq!(h.search.search("1", "Paris", None, None).await.unwrap().total, 0);
    let answer = h.query.ask("1", "What is the capital of France?").await.unwrap();
    assert!(answer.sources.is_empty());
}

#[tokio::test]
async fn owners_never_see_each_others_documents() {
    let h = default_harness().await;
    let text = "Quarterly revenue grew in the northern region.";
    let a = h.upload("alice", "text/plain", text).await;
    let b = h.upload("bob", "text/plain", text).await;
    h.drain().await;

    let for_alice = h.search.search("alice", "revenue", None, None).await.unwrap();
    assert_eq!(for_alice.total, 1);
    assert_eq!(for_alice.results[0].document_id, a);

    let for_bob = h.query.ask("bob", "How did revenue change?").await.unwrap();
    assert!(!for_bob.sources.is_empty());
    assert!(for_bob.sources.iter().all(|s| s.document_id == b));

    let stranger = h.search.search("mallory", "revenue", None, None).await.unwrap();
    assert_eq!(stranger.total, 0);
}

#[tokio::test]
async fn delete_removes_document_from_every_store() {
    let h = default_harness().await;
    let id = h
        .upload("1", "text/plain", "The capital of France is Paris.")
        .await;
    h.drain().await;
    assert_eq!(h.vector_count(&id).await, 1);

    h.coordinator.delete(&id).await.unwrap();

    assert!(matches!(h.coordinator.document(&id).await, Err(Error::NotFound(_))));
    assert!(matches!(h.coordinator.status(&id).await, Err(Error::NotFound(_))));
    assert_eq!(h.search.search("1", "Paris", None, None).await.unwrap().total, 0);
    assert_eq!(h.vector_count(&id).await, 0);
    assert!(h.svc.metadata.chunks(&id).await.unwrap().is_empty());
    let answer = h.query.ask("1", "What is the capital of France?").await.unwrap();
    assert!(!answer.grounded);
}

#[tokio::test]
async fn reprocessing_is_an_idempotent_overwrite() {
    let h = Harness::new(Arc::new(HashProvider::new(64)), |c| {
        c.chunking.window_chars = 16;
    })
    .await;
    let text = "Rust ownership rules keep memory safe without a garbage collector.";
    let id = h.upload("1", "text/plain", text).await;
    h.drain().await;

    let before = h.svc.metadata.chunks(&id).await.unwrap();
    assert_eq!(before.len(), text.chars().count().div_ceil(16));
    let vectors_before = h.vector_count(&id).await;

    h.coordinator.reprocess(&id).await.unwrap();
    h.drain().await;

    let after = h.svc.metadata.chunks(&id).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(h.vector_count(&id).await, vectors_before);
    assert_eq!(
        h.coordinator.status(&id).await.unwrap().stage,
        DocumentStatus::Indexed
    );
}

#[tokio::test]
async fn partial_embedding_failure_is_degraded_then_resumable() {
    let embedder = Arc::new(FlakyEmbedder::new(1));
    embedder.failing.store(true, Ordering::SeqCst);
    let h = Harness::new(embedder.clone(), |c| {
        c.chunking.window_chars = 10;
        c.embedding.batch_size = 2;
        c.pipeline.max_attempts = 2;
    })
    .await;

    // Five 10-char windows → three batches; only the first succeeds.
    let text = "aaaaaaaaa bbbbbbbbb ccccccccc ddddddddd eeeeeeeee";
    let id = h.upload("1", "text/plain", text).await;
    h.drain().await;

    let status = h.coordinator.status(&id).await.unwrap();
    assert_eq!(status.stage, DocumentStatus::Failed);
    assert_eq!(status.failed_stage, Some(DocumentStatus::Embedding));
    assert!(status.error.unwrap().starts_with("DependencyError during embedding"));

    let chunks = h.svc.metadata.chunks(&id).await.unwrap();
    assert_eq!(chunks.len(), 5);
    let embedded: Vec<i64> = chunks
        .iter()
        .filter(|c| c.vector_id.is_some())
        .map(|c| c.chunk_index)
        .collect();
    assert_eq!(embedded, vec![0, 1]);

    // Discoverable by keyword, but never used to ground an answer.
    assert_eq!(h.search.search("1", "ccccccccc", None, None).await.unwrap().total, 1);
    let dead = h.svc.bus.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].consumer, "embedding");

    embedder.failing.store(false, Ordering::SeqCst);
    let calls_before = embedder.calls.load(Ordering::SeqCst);
    h.coordinator.reprocess(&id).await.unwrap();
    h.drain().await;

    assert_eq!(
        h.coordinator.status(&id).await.unwrap().stage,
        DocumentStatus::Indexed
    );
    // Only the three missing chunks were embedded: two batches.
    assert_eq!(embedder.calls.load(Ordering::SeqCst) - calls_before, 2);
    assert!(h
        .svc
        .metadata
        .chunks(&id)
        .await
        .unwrap()
        .iter()
        .all(|c| c.vector_id.is_some()));
    assert_eq!(h.vector_count(&id).await, 5);
}

/// Uploads, then leaves the document where a worker stopped part-way
/// through extraction: status moved to `reached`, delivery still leased.
async fn interrupted_extraction(h: &Harness, reached: DocumentStatus) -> String {
    let id = h
        .upload("1", "text/plain", "The capital of France is Paris.")
        .await;
    let delivery = h
        .svc
        .bus
        .claim(ConsumerGroup::Extraction, Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.decode().unwrap().document_id(), id);
    for step in [
        DocumentStatus::Downloading,
        DocumentStatus::Extracting,
        DocumentStatus::Analyzing,
    ] {
        assert!(h.svc.metadata.transition(&id, step).await.unwrap());
        if step == reached {
            break;
        }
    }
    id
}

#[tokio::test]
async fn extraction_restarts_after_a_lost_lease() {
    for reached in [DocumentStatus::Extracting, DocumentStatus::Analyzing] {
        let h = default_harness().await;
        let id = interrupted_extraction(&h, reached).await;

        // The expired lease is redelivered to the real extraction stage.
        h.drain().await;

        let status = h.coordinator.status(&id).await.unwrap();
        assert_eq!(status.stage, DocumentStatus::Indexed, "from {}", reached);
        assert!(h.svc.bus.dead_letters(10).await.unwrap().is_empty());
        assert_eq!(h.search.search("1", "Paris", None, None).await.unwrap().total, 1);
    }
}

#[tokio::test]
async fn extraction_restarts_after_a_retry_from_a_later_step() {
    for reached in [DocumentStatus::Extracting, DocumentStatus::Analyzing] {
        let h = default_harness().await;
        let id = interrupted_extraction(&h, reached).await;

        // What the runner does with a retryable error raised mid-extraction.
        let delivery = h
            .svc
            .bus
            .claim(ConsumerGroup::Extraction, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        h.svc
            .bus
            .retry(&delivery, Duration::ZERO, "text extraction timed out")
            .await
            .unwrap();
        h.drain().await;

        let status = h.coordinator.status(&id).await.unwrap();
        assert_eq!(status.stage, DocumentStatus::Indexed, "from {}", reached);
        assert_eq!(h.vector_count(&id).await, 1);
    }
}

#[tokio::test]
async fn transient_blob_errors_are_retried_to_completion() {
    let h = Harness::with_blobs(Arc::new(HashProvider::new(256)), |_| {}, |root| {
        Arc::new(FlakyBlobs {
            inner: FsBlobStore::new(root),
            failures: AtomicUsize::new(2),
        })
    })
    .await;
    let id = h
        .upload("1", "text/plain", "The capital of France is Paris.")
        .await;
    h.drain().await;

    let status = h.coordinator.status(&id).await.unwrap();
    assert_eq!(status.stage, DocumentStatus::Indexed);
    assert!(status.error.is_none());
    assert!(h.svc.bus.dead_letters(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn persistent_blob_errors_fail_and_dead_letter() {
    let h = Harness::with_blobs(Arc::new(HashProvider::new(256)), |_| {}, |root| {
        Arc::new(FlakyBlobs {
            inner: FsBlobStore::new(root),
            failures: AtomicUsize::new(usize::MAX),
        })
    })
    .await;
    let id = h
        .upload("1", "text/plain", "The capital of France is Paris.")
        .await;
    h.drain().await;

    let status = h.coordinator.status(&id).await.unwrap();
    assert_eq!(status.stage, DocumentStatus::Failed);
    assert_eq!(status.failed_stage, Some(DocumentStatus::Downloading));
    assert!(status.error.unwrap().starts_with("DependencyError during downloading"));

    let dead = h.svc.bus.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].consumer, "extraction");
    assert_eq!(dead[0].document_id, id);
}

#[tokio::test]
async fn delete_during_embedding_leaves_no_index_entries() {
    let embedder = Arc::new(DeletingEmbedder {
        inner: HashProvider::new(128),
        calls: AtomicUsize::new(0),
        delete_on: 1,
        target: OnceLock::new(),
    });
    let h = Harness::new(embedder.clone(), |c| {
        c.chunking.window_chars = 10;
        c.embedding.batch_size = 2;
    })
    .await;

    // Five windows, three batches; the delete lands during the second.
    let text = "aaaaaaaaa bbbbbbbbb ccccccccc ddddddddd eeeeeeeee";
    let id = h.upload("1", "text/plain", text).await;
    assert!(embedder
        .target
        .set((h.coordinator.clone(), id.clone()))
        .is_ok());
    h.drain().await;

    assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    assert!(matches!(h.coordinator.document(&id).await, Err(Error::NotFound(_))));
    assert_eq!(h.vector_count(&id).await, 0);
    assert_eq!(h.search.search("1", "aaaaaaaaa", None, None).await.unwrap().total, 0);
    assert_eq!(h.search.search("1", "ccccccccc", None, None).await.unwrap().total, 0);
    assert!(h.svc.bus.dead_letters(10).await.unwrap().is_empty());
}
