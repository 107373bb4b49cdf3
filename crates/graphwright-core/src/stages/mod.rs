//! The standard document-to-graph pipeline.
//!
//! `sections -> extractions -> entity_mentions -> claim_links -> indexed_documents`,
//! every stage reading `documents` so each one makes the same delta decision.

mod claim_links;
mod entity_mentions;
mod extractions;
mod indexed_documents;
mod sections;

use std::sync::Arc;

use serde_json::json;

pub use claim_links::ClaimLinksModel;
pub use entity_mentions::EntityMentionsModel;
pub use extractions::{ExtractionsModel, EXTRACTIONS_TABLE};
pub use indexed_documents::{IndexedDocumentsModel, INDEXED_DOCUMENTS_TABLE};
pub use sections::{SectionsModel, SECTIONS_TABLE};

use crate::config::{ClaimConfig, GraphwrightConfig, ResolutionConfig};
use crate::document::{document_schema, Document, DOCUMENTS_TABLE};
use crate::extraction::{Extractor, RuleBasedExtractor};
use crate::pipeline::{CustomMetrics, IncrementalTracker, ModelRegistryBuilder, StageInput};
use crate::resolution::{
    ConflictDetector, Embedder, HashingEmbedder, HeuristicConflictDetector, HeuristicOracle, InMemoryVectorIndex,
    ResolutionOracle, VectorIndex,
};
use crate::Result;

/// Name under which the graph pipeline is usually registered with a runner.
pub const GRAPH_PIPELINE: &str = "graph";

/// Target stages of the graph pipeline; everything else is pulled in upstream.
#[must_use]
pub fn graph_targets() -> Vec<String> {
    vec![INDEXED_DOCUMENTS_TABLE.to_string()]
}

/// External capabilities and tuning the graph stages are built from.
#[derive(Clone)]
pub struct GraphComponents {
    pub extractor: Arc<dyn Extractor>,
    pub embedder: Arc<dyn Embedder>,
    pub vector_index: Arc<dyn VectorIndex>,
    pub oracle: Arc<dyn ResolutionOracle>,
    pub conflict_detector: Arc<dyn ConflictDetector>,
    pub resolution: ResolutionConfig,
    pub claims: ClaimConfig,
}

impl GraphComponents {
    /// Bundled components that need no network access.
    #[must_use]
    pub fn offline(config: &GraphwrightConfig) -> Self {
        Self {
            extractor: Arc::new(RuleBasedExtractor::with_default_patterns()),
            embedder: Arc::new(HashingEmbedder::default()),
            vector_index: Arc::new(InMemoryVectorIndex::new()),
            oracle: Arc::new(HeuristicOracle::default()),
            conflict_detector: Arc::new(HeuristicConflictDetector),
            resolution: config.resolution.clone(),
            claims: config.claims.clone(),
        }
    }

    #[must_use]
    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = extractor;
        self
    }

    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    #[must_use]
    pub fn with_vector_index(mut self, vector_index: Arc<dyn VectorIndex>) -> Self {
        self.vector_index = vector_index;
        self
    }

    #[must_use]
    pub fn with_oracle(mut self, oracle: Arc<dyn ResolutionOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    #[must_use]
    pub fn with_conflict_detector(mut self, detector: Arc<dyn ConflictDetector>) -> Self {
        self.conflict_detector = detector;
        self
    }
}

impl std::fmt::Debug for GraphComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphComponents")
            .field("extractor", &self.extractor.name())
            .field("embedder_dimensions", &self.embedder.dimensions())
            .field("resolution", &self.resolution)
            .field("claims", &self.claims)
            .finish_non_exhaustive()
    }
}

/// Adds the `documents` base table and every graph stage to a registry.
#[must_use]
pub fn register_graph_pipeline(builder: ModelRegistryBuilder, components: &GraphComponents) -> ModelRegistryBuilder {
    builder
        .base_table(DOCUMENTS_TABLE, document_schema())
        .model(SectionsModel::new())
        .model(ExtractionsModel::new(Arc::clone(&components.extractor)))
        .model(EntityMentionsModel::new(
            Arc::clone(&components.embedder),
            Arc::clone(&components.vector_index),
            Arc::clone(&components.oracle),
            components.resolution.clone(),
        ))
        .model(ClaimLinksModel::new(
            Arc::clone(&components.conflict_detector),
            components.claims.clone(),
        ))
        .model(IndexedDocumentsModel::new())
}

/// Documents the run has work for, with their fingerprints.
struct Scope {
    process: Vec<(Document, String)>,
    skipped: Vec<String>,
}

impl Scope {
    async fn load(input: &StageInput) -> Result<Self> {
        let documents: Vec<Document> = input.reference("documents")?.fetch_as().await?;
        let tracker = IncrementalTracker::new(input.context().incremental_mode);
        let (process, skipped) = tracker.partition(documents);
        Ok(Self { process, skipped })
    }

    fn document_ids(&self) -> impl Iterator<Item = &str> {
        self.process.iter().map(|(doc, _)| doc.document_id.as_str())
    }

    fn contains(&self, document_id: &str) -> bool {
        self.document_ids().any(|id| id == document_id)
    }

    fn metrics(&self) -> CustomMetrics {
        let mut metrics = CustomMetrics::new();
        metrics.insert("documents_processed".into(), json!(self.process.len()));
        metrics.insert("documents_skipped".into(), json!(self.skipped.len()));
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ExecutionPlan, ModelRegistry};

    #[test]
    fn test_graph_stages_run_in_order() {
        let components = GraphComponents::offline(&GraphwrightConfig::default());
        let registry = register_graph_pipeline(ModelRegistry::builder(), &components)
            .build()
            .unwrap();
        let plan = ExecutionPlan::build(&registry).unwrap();

        let expected: Vec<Vec<String>> = [
            SECTIONS_TABLE,
            EXTRACTIONS_TABLE,
            crate::resolution::ENTITY_MENTIONS_TABLE,
            crate::resolution::CLAIM_LINKS_TABLE,
            INDEXED_DOCUMENTS_TABLE,
        ]
        .iter()
        .map(|name| vec![(*name).to_string()])
        .collect();
        assert_eq!(plan.levels(), expected.as_slice());
        assert_eq!(
            plan.upstream_of(INDEXED_DOCUMENTS_TABLE).collect::<Vec<_>>(),
            vec!["claim_links", "entity_mentions", "extractions", "sections"]
        );
        assert_eq!(graph_targets(), vec![INDEXED_DOCUMENTS_TABLE.to_string()]);
    }
}
