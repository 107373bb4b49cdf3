use std::path::Path;

use anyhow::{bail, Context, Result};

use graphwright_core::{Document, GraphwrightConfig, Storage};

pub async fn run(config: &GraphwrightConfig, paths: &[String]) -> Result<()> {
    let storage = Storage::open(&config.database.path)
        .await
        .with_context(|| format!("opening database {}", config.database.path))?;

    let mut documents = Vec::with_capacity(paths.len());
    for path_str in paths {
        documents.push(read_document(Path::new(path_str)).await?);
    }

    let outcome = storage.upsert_documents(&documents).await?;
    for document in &documents {
        eprintln!("Ingested: {}", document.document_id);
    }
    eprintln!(
        "  {} stored, {} unchanged",
        outcome.rows_written, outcome.rows_deduplicated
    );

    Ok(())
}

async fn read_document(source: &Path) -> Result<Document> {
    if !source.is_file() {
        bail!("not a regular file: {}", source.display());
    }
    let Some(stem) = source.file_stem() else {
        bail!("cannot derive a document id from {}", source.display());
    };

    let content = tokio::fs::read_to_string(source)
        .await
        .with_context(|| format!("reading {}", source.display()))?;

    let mut document = Document::new(stem.to_string_lossy(), content);
    if let Some(name) = source.file_name() {
        document = document.with_title(name.to_string_lossy());
    }
    Ok(document)
}
