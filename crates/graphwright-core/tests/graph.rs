use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;

use graphwright_core::pipeline::{PipelineStatus, StageOutcome};
use graphwright_core::resolution::{Embedder, HashingEmbedder};
use graphwright_core::stages::{graph_targets, EXTRACTIONS_TABLE, INDEXED_DOCUMENTS_TABLE};
use graphwright_core::storage::TableQuery;
use graphwright_core::{
    register_graph_pipeline, Document, EntityType, Error, ExecutorConfig, ExtractedClaim, ExtractedEntity,
    ExtractedRelationship, Extraction, Extractor, GraphComponents, GraphwrightConfig, IncrementalMode, ModelRegistry,
    PipelineContext, PipelineExecutor, PipelineResult, PipelineRunner, Result, Section, Storage, GRAPH_PIPELINE,
};

/// Returns a fixed extraction per section text and counts calls.
#[derive(Default)]
struct ScriptedExtractor {
    script: HashMap<String, Extraction>,
    calls: AtomicUsize,
}

impl ScriptedExtractor {
    fn with(mut self, text: &str, extraction: Extraction) -> Self {
        self.script.insert(text.to_string(), extraction);
        self
    }
}

#[async_trait::async_trait]
impl Extractor for ScriptedExtractor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn extract(&self, section: &Section) -> Result<Extraction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.script.get(&section.text).cloned().unwrap_or_default())
    }
}

/// Puts every name mentioning python on one axis and hashes everything else
/// into the remaining dimensions, so only the python variants cluster.
struct PythonAwareEmbedder {
    inner: HashingEmbedder,
}

#[async_trait::async_trait]
impl Embedder for PythonAwareEmbedder {
    fn dimensions(&self) -> usize {
        self.inner.dimensions() + 1
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.0_f32; self.dimensions()];
                if text.to_lowercase().contains("python") {
                    vector[0] = 1.0;
                } else {
                    vector[1..].copy_from_slice(&self.inner.embed_one(text));
                }
                vector
            })
            .collect())
    }
}

/// Fails every call while `failing` is set.
struct FlakyEmbedder {
    inner: HashingEmbedder,
    failing: AtomicBool,
}

#[async_trait::async_trait]
impl Embedder for FlakyEmbedder {
    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Capability {
                capability: "embedder",
                message: "service unavailable".into(),
            });
        }
        self.inner.embed(texts).await
    }
}

const CREATED: &str = "Guido van Rossum created Python.";
const RELEASED: &str = "Python language was first released in 1994.";

fn python_script() -> ScriptedExtractor {
    ScriptedExtractor::default()
        .with(
            CREATED,
            Extraction::new()
                .with_entity(ExtractedEntity::new("Guido van Rossum", EntityType::Person))
                .with_entity(ExtractedEntity::new("Python", EntityType::Technology))
                .with_relationship(ExtractedRelationship::new("Guido van Rossum", "Python", "created"))
                .with_claim(
                    ExtractedClaim::new("Python was first released in 1991")
                        .about("Python")
                        .with_attribute("first release", "1991"),
                ),
        )
        .with(
            RELEASED,
            Extraction::new()
                .with_entity(ExtractedEntity::new("Python language", EntityType::Technology))
                .with_claim(
                    ExtractedClaim::new("Python language was first released in 1994")
                        .about("Python language")
                        .with_attribute("first release", "1994"),
                ),
        )
}

struct Harness {
    storage: Storage,
    runner: PipelineRunner,
    extractor: Arc<ScriptedExtractor>,
}

/// Builds the graph pipeline over an in-memory store with scripted capabilities.
async fn harness(extractor: ScriptedExtractor) -> Harness {
    let embedder = Arc::new(PythonAwareEmbedder {
        inner: HashingEmbedder::default(),
    });
    harness_with(extractor, embedder, ExecutorConfig::default()).await
}

/// Like [`harness`] with a chosen embedder and executor settings.
async fn harness_with(extractor: ScriptedExtractor, embedder: Arc<dyn Embedder>, config: ExecutorConfig) -> Harness {
    let storage = Storage::open_memory().await.unwrap();
    let extractor = Arc::new(extractor);
    let components = GraphComponents::offline(&GraphwrightConfig::default())
        .with_extractor(Arc::clone(&extractor) as Arc<dyn Extractor>)
        .with_embedder(embedder);
    let registry = register_graph_pipeline(ModelRegistry::builder(), &components)
        .build()
        .unwrap();
    let executor = PipelineExecutor::new(Arc::new(registry), storage.clone()).with_config(config);
    let runner = PipelineRunner::new(executor).with_pipeline(GRAPH_PIPELINE, graph_targets());

    Harness {
        storage,
        runner,
        extractor,
    }
}

impl Harness {
    async fn ingest(&self, documents: &[(&str, &str)]) {
        let documents: Vec<Document> = documents.iter().map(|(id, text)| Document::new(*id, *text)).collect();
        self.storage.upsert_documents(&documents).await.unwrap();
    }

    async fn run(&self, mode: IncrementalMode) -> PipelineResult {
        let result = self.runner.run_pipeline(GRAPH_PIPELINE, None, mode).await.unwrap();
        assert!(result.is_success(), "pipeline failed: {result:?}");
        result
    }

    fn extractor_calls(&self) -> usize {
        self.extractor.calls.load(Ordering::SeqCst)
    }

    async fn graph_counts(&self) -> [u64; 4] {
        [
            self.storage.count_entities().await.unwrap(),
            self.storage.count_relationships().await.unwrap(),
            self.storage.count_claims().await.unwrap(),
            self.storage.count_document_entities().await.unwrap(),
        ]
    }
}

fn metric(result: &PipelineResult, stage: &str, name: &str) -> serde_json::Value {
    result.stage(stage).unwrap().result.custom_metrics[name].clone()
}

// --- Entity resolution ---

#[tokio::test]
async fn surface_variants_resolve_to_one_entity() {
    let h = harness(python_script()).await;
    h.ingest(&[("d1", CREATED), ("d2", RELEASED)]).await;
    h.run(IncrementalMode::Full).await;

    let python = h.storage.find_entities_by_name("Python").await.unwrap();
    let language = h.storage.find_entities_by_name("Python language").await.unwrap();
    assert_eq!(python.len(), 1);
    assert_eq!(language.len(), 1);
    assert_eq!(python[0].id, language[0].id);
    assert_eq!(python[0].name, "Python");
    assert_eq!(python[0].entity_type, EntityType::Technology);

    // Guido and Python.
    assert_eq!(h.storage.count_entities().await.unwrap(), 2);

    let guido = &h.storage.find_entities_by_name("Guido van Rossum").await.unwrap()[0];
    let relationships = h.storage.get_entity_relationships(guido.id).await.unwrap();
    assert_eq!(relationships.len(), 1);
    assert_eq!(relationships[0].target_entity_id, python[0].id);

    for document_id in ["d1", "d2"] {
        let linked = h.storage.document_entities(document_id).await.unwrap();
        assert!(linked.iter().any(|link| link.entity_id == python[0].id));
    }
}

// --- Claim resolution ---

#[tokio::test]
async fn conflicting_claims_point_at_each_other() {
    let h = harness(python_script()).await;
    h.ingest(&[("d1", CREATED), ("d2", RELEASED)]).await;
    let result = h.run(IncrementalMode::Full).await;
    assert_eq!(metric(&result, "claim_links", "conflicts"), json!(1));

    let claims = h.storage.list_claims().await.unwrap();
    assert_eq!(claims.len(), 2);
    let (a, b) = (&claims[0], &claims[1]);
    assert_eq!(a.entity_ids, b.entity_ids);
    assert_eq!(a.conflicts_with, Some(b.id));
    assert_eq!(b.conflicts_with, Some(a.id));

    let links = h
        .storage
        .query_rows(&TableQuery::new("claim_links").filter_eq("workflow_id", result.workflow_id.as_str()))
        .await
        .unwrap();
    assert_eq!(links.len(), 2);
    assert!(links.iter().all(|link| !link["conflicts_with"].is_null()));
    assert!(links.iter().all(|link| link["conflicting_claims"].as_array().map(Vec::len) == Some(1)));
}

#[tokio::test]
async fn repeated_claim_gains_evidence_instead_of_duplicating() {
    let repeated = Extraction::new()
        .with_entity(ExtractedEntity::new("Python", EntityType::Technology))
        .with_claim(ExtractedClaim::new("Python is dynamically typed").about("Python"));
    let extractor = ScriptedExtractor::default()
        .with("Python is dynamically typed.", repeated.clone())
        .with("Python, they say, is dynamically typed.", repeated);
    let h = harness(extractor).await;
    h.ingest(&[
        ("d1", "Python is dynamically typed."),
        ("d2", "Python, they say, is dynamically typed."),
    ])
    .await;
    h.run(IncrementalMode::Full).await;

    let claims = h.storage.list_claims().await.unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].evidence.len(), 2);
    assert!(claims[0].conflicts_with.is_none());
}

// --- Reruns ---

#[tokio::test]
async fn full_rerun_adds_no_graph_rows() {
    let h = harness(python_script()).await;
    h.ingest(&[("d1", CREATED), ("d2", RELEASED)]).await;
    h.run(IncrementalMode::Full).await;
    let before = h.graph_counts().await;
    assert_eq!(before[..3], [2_u64, 1, 2]);

    let rerun = h.run(IncrementalMode::Full).await;
    assert_eq!(h.graph_counts().await, before);
    assert_eq!(metric(&rerun, "entity_mentions", "entities_created"), json!(0));
    assert_eq!(metric(&rerun, "claim_links", "claims_created"), json!(0));

    // Section texts are unchanged, so the extractor is not asked again.
    assert_eq!(h.extractor_calls(), 2);
    assert_eq!(metric(&rerun, EXTRACTIONS_TABLE, "sections_reused"), json!(2));
}

#[tokio::test]
async fn delta_run_skips_indexed_documents() {
    let h = harness(python_script()).await;
    h.ingest(&[("d1", CREATED), ("d2", RELEASED)]).await;

    let first = h.run(IncrementalMode::Delta).await;
    assert_eq!(metric(&first, EXTRACTIONS_TABLE, "documents_processed"), json!(2));
    assert_eq!(metric(&first, INDEXED_DOCUMENTS_TABLE, "documents_indexed"), json!(2));
    let doc = h.storage.get_document("d1").await.unwrap().unwrap();
    assert_eq!(doc.indexed_with_hash.as_deref(), Some(doc.content_hash.as_str()));

    let second = h.run(IncrementalMode::Delta).await;
    for stage in ["sections", EXTRACTIONS_TABLE, "entity_mentions", "claim_links", INDEXED_DOCUMENTS_TABLE] {
        assert_eq!(metric(&second, stage, "documents_processed"), json!(0), "{stage}");
        assert_eq!(metric(&second, stage, "documents_skipped"), json!(2), "{stage}");
    }
    assert_eq!(h.extractor_calls(), 2);
    assert_eq!(second.rows_written, 0);
}

#[tokio::test]
async fn edited_document_reprocesses_only_changed_sections() {
    const BEFORE: &str = "Alpha paragraph.\n\nBeta paragraph.";
    const AFTER: &str = "Alpha paragraph.\n\nBeta paragraph, revised.";

    let h = harness(ScriptedExtractor::default()).await;
    let ctx = || {
        PipelineContext::generate()
            .with_mode(IncrementalMode::Delta)
            .with_metadata(json!({"config": {"sections": {"max_chars": 20}}}))
    };

    h.ingest(&[("d1", BEFORE), ("d2", CREATED)]).await;
    let first = h.runner.run_with_context(GRAPH_PIPELINE, ctx()).await.unwrap();
    assert!(first.is_success());
    assert_eq!(h.extractor_calls(), 3);

    h.ingest(&[("d1", AFTER)]).await;
    let second = h.runner.run_with_context(GRAPH_PIPELINE, ctx()).await.unwrap();
    assert!(second.is_success());

    assert_eq!(metric(&second, EXTRACTIONS_TABLE, "documents_processed"), json!(1));
    assert_eq!(metric(&second, EXTRACTIONS_TABLE, "documents_skipped"), json!(1));
    assert_eq!(metric(&second, EXTRACTIONS_TABLE, "sections_reused"), json!(1));
    assert_eq!(metric(&second, EXTRACTIONS_TABLE, "sections_extracted"), json!(1));
    assert_eq!(h.extractor_calls(), 4);

    let doc = h.storage.get_document("d1").await.unwrap().unwrap();
    assert_eq!(doc.content, AFTER);
    assert_eq!(doc.indexed_with_hash.as_deref(), Some(doc.content_hash.as_str()));
}

// --- Failure handling ---

#[tokio::test]
async fn failed_resolution_leaves_document_unindexed() {
    let embedder = Arc::new(FlakyEmbedder {
        inner: HashingEmbedder::default(),
        failing: AtomicBool::new(true),
    });
    let config = ExecutorConfig {
        stop_on_error: false,
        ..ExecutorConfig::default()
    };
    let h = harness_with(python_script(), Arc::clone(&embedder) as Arc<dyn Embedder>, config).await;
    h.ingest(&[("d1", CREATED)]).await;

    let failed = h
        .runner
        .run_pipeline(GRAPH_PIPELINE, None, IncrementalMode::Delta)
        .await
        .unwrap();
    assert_eq!(failed.status, PipelineStatus::Failed);
    assert_eq!(failed.stage("entity_mentions").unwrap().outcome, StageOutcome::Failed);
    assert_eq!(
        failed.not_scheduled,
        vec!["claim_links".to_string(), INDEXED_DOCUMENTS_TABLE.to_string()]
    );
    let doc = h.storage.get_document("d1").await.unwrap().unwrap();
    assert!(doc.indexed_with_hash.is_none());

    embedder.failing.store(false, Ordering::SeqCst);
    let retried = h.run(IncrementalMode::Delta).await;
    assert_eq!(metric(&retried, "entity_mentions", "documents_processed"), json!(1));
    assert_eq!(metric(&retried, INDEXED_DOCUMENTS_TABLE, "documents_indexed"), json!(1));
    assert_eq!(metric(&retried, EXTRACTIONS_TABLE, "sections_reused"), json!(1));
    assert_eq!(h.extractor_calls(), 1);

    let doc = h.storage.get_document("d1").await.unwrap().unwrap();
    assert_eq!(doc.indexed_with_hash.as_deref(), Some(doc.content_hash.as_str()));
}
