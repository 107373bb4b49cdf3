use std::collections::BTreeMap;
use std::sync::Arc;

use super::model::Model;
use super::schema::TableSchema;
use crate::storage::validate_identifier;
use crate::{Error, Result};

/// Every stage and base table known to a process.
///
/// Built once at startup with [`ModelRegistry::builder`] and passed to the
/// executor; there is no global registry.
pub struct ModelRegistry {
    models: BTreeMap<String, Arc<dyn Model>>,
    base_tables: BTreeMap<String, TableSchema>,
}

impl ModelRegistry {
    #[must_use]
    pub fn builder() -> ModelRegistryBuilder {
        ModelRegistryBuilder::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Model>> {
        self.models.get(name)
    }

    pub fn model(&self, name: &str) -> Result<Arc<dyn Model>> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownStage(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn models(&self) -> impl Iterator<Item = &Arc<dyn Model>> {
        self.models.values()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    #[must_use]
    pub fn is_base_table(&self, name: &str) -> bool {
        self.base_tables.contains_key(name)
    }

    /// Schema of a stage's output table or of a base table.
    #[must_use]
    pub fn table_schema(&self, table: &str) -> Option<&TableSchema> {
        self.models
            .get(table)
            .map(|m| &m.spec().schema)
            .or_else(|| self.base_tables.get(table))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .field("base_tables", &self.base_tables.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Default)]
pub struct ModelRegistryBuilder {
    models: Vec<Arc<dyn Model>>,
    base_tables: Vec<(String, TableSchema)>,
}

impl ModelRegistryBuilder {
    #[must_use]
    pub fn model<M: Model + 'static>(self, model: M) -> Self {
        self.shared_model(Arc::new(model))
    }

    #[must_use]
    pub fn shared_model(mut self, model: Arc<dyn Model>) -> Self {
        self.models.push(model);
        self
    }

    /// A table produced outside the pipeline, such as ingested documents.
    #[must_use]
    pub fn base_table(mut self, name: impl Into<String>, schema: TableSchema) -> Self {
        self.base_tables.push((name.into(), schema));
        self
    }

    pub fn build(self) -> Result<ModelRegistry> {
        let mut base_tables = BTreeMap::new();
        for (name, schema) in self.base_tables {
            validate_identifier(&name)?;
            if base_tables.insert(name.clone(), schema).is_some() {
                return Err(Error::DuplicateModel(name));
            }
        }

        let mut models: BTreeMap<String, Arc<dyn Model>> = BTreeMap::new();
        for model in self.models {
            let name = model.spec().name.clone();
            validate_model(model.as_ref())?;
            if base_tables.contains_key(&name) || models.contains_key(&name) {
                return Err(Error::DuplicateModel(name));
            }
            models.insert(name, model);
        }

        Ok(ModelRegistry {
            models,
            base_tables,
        })
    }
}

fn validate_model(model: &dyn Model) -> Result<()> {
    let spec = model.spec();
    let invalid = |message: String| Error::InvalidModel {
        model: spec.name.clone(),
        message,
    };

    validate_identifier(&spec.name)?;
    for column in &spec.schema.columns {
        validate_identifier(&column.name)?;
    }

    if spec.primary_key.is_empty() {
        return Err(invalid("primary key is empty".to_string()));
    }
    if let Some(column) = spec.primary_key.iter().find(|c| !spec.schema.has_column(c)) {
        return Err(invalid(format!("primary key column {column} is not in the schema")));
    }

    for (alias, reference) in &spec.references {
        validate_identifier(alias)?;
        validate_identifier(&reference.table)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::model::{CustomMetrics, ModelSpec, StageInput};
    use crate::pipeline::schema::ColumnType;
    use crate::pipeline::writer::TableWriter;

    struct Noop(ModelSpec);

    #[async_trait::async_trait]
    impl Model for Noop {
        fn spec(&self) -> &ModelSpec {
            &self.0
        }

        async fn run(&self, _input: &StageInput, _output: &mut TableWriter) -> Result<CustomMetrics> {
            Ok(CustomMetrics::new())
        }
    }

    fn noop(name: &str) -> Noop {
        Noop(
            ModelSpec::new(name, TableSchema::new().column("id", ColumnType::Text))
                .with_primary_key(&["id"]),
        )
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = ModelRegistry::builder().model(noop("a")).model(noop("a")).build();
        assert!(matches!(result, Err(Error::DuplicateModel(name)) if name == "a"));

        let result = ModelRegistry::builder()
            .base_table("a", TableSchema::new())
            .model(noop("a"))
            .build();
        assert!(matches!(result, Err(Error::DuplicateModel(_))));
    }

    #[test]
    fn test_primary_key_must_be_declared() {
        let bad = Noop(
            ModelSpec::new("bad", TableSchema::new().column("id", ColumnType::Text))
                .with_primary_key(&["missing"]),
        );
        assert!(matches!(
            ModelRegistry::builder().model(bad).build(),
            Err(Error::InvalidModel { .. })
        ));
    }

    #[test]
    fn test_lookup() {
        let registry = ModelRegistry::builder()
            .base_table("documents", TableSchema::new().column("document_id", ColumnType::Text))
            .model(noop("a"))
            .build()
            .unwrap();
        assert!(registry.contains("a"));
        assert!(registry.is_base_table("documents"));
        assert!(registry.table_schema("documents").is_some());
        assert!(matches!(registry.model("zzz"), Err(Error::UnknownStage(_))));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["a"]);
    }
}
