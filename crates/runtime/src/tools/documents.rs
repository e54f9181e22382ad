//! Document tools: repository search and summarisation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::categories;
use crate::catalog::{ParameterSpec, Tool, ToolCatalog, ToolDescriptor};
use crate::types::{CatalogError, Subject};

struct SearchDocuments;

#[async_trait]
impl Tool for SearchDocuments {
    async fn invoke(&self, args: &Value, subject: &Subject) -> Result<Value, CatalogError> {
        let query = args["query"].as_str().unwrap_or_default();
        let repository = args["repository"].as_str().unwrap_or("enterprise_docs");
        let limit = args["limit"].as_u64().unwrap_or(10);

        info!(subject_id = %subject.subject_id, repository, limit, "document search");
        Ok(json!({
            "query": query,
            "repository": repository,
            "limit": limit,
            "matches": [],
            "summary": format!("Document search completed for '{query}' in '{repository}'"),
        }))
    }
}

struct SummarizeDocument;

#[async_trait]
impl Tool for SummarizeDocument {
    async fn invoke(&self, args: &Value, _subject: &Subject) -> Result<Value, CatalogError> {
        let document_path = args["document_path"].as_str().unwrap_or_default();
        let length = args["summary_length"].as_str().unwrap_or("medium");

        Ok(json!({
            "document_path": document_path,
            "summary_length": length,
            "summary": format!("Summary ({length}) of '{document_path}'"),
        }))
    }
}

struct ExtractText;

#[async_trait]
impl Tool for ExtractText {
    async fn invoke(&self, args: &Value, _subject: &Subject) -> Result<Value, CatalogError> {
        let document_path = args["document_path"].as_str().unwrap_or_default();
        let format = args["format"].as_str().unwrap_or("auto");

        Ok(json!({
            "document_path": document_path,
            "format": format,
            "text": "",
            "summary": format!("Text extracted from '{document_path}'"),
        }))
    }
}

/// Register the document tool set.
pub fn register(catalog: &Arc<ToolCatalog>) {
    catalog.register(
        ToolDescriptor::new(
            "search_documents",
            "Search enterprise document repositories",
            categories::DOCUMENTS,
        )
        .with_parameter("query", ParameterSpec::required("string", "Search query"))
        .with_parameter(
            "repository",
            ParameterSpec::optional("string", "Repository name", json!("enterprise_docs")),
        )
        .with_parameter(
            "limit",
            ParameterSpec::optional("integer", "Maximum matches", json!(10)),
        ),
        Arc::new(SearchDocuments),
    );

    catalog.register(
        ToolDescriptor::new(
            "summarize_document",
            "Generate a document summary",
            categories::DOCUMENTS,
        )
        .with_parameter(
            "document_path",
            ParameterSpec::required("string", "Path of the document"),
        )
        .with_parameter(
            "summary_length",
            ParameterSpec::optional("string", "short, medium or long", json!("medium")),
        ),
        Arc::new(SummarizeDocument),
    );

    catalog.register(
        ToolDescriptor::new(
            "extract_text",
            "Extract plain text from a document",
            categories::DOCUMENTS,
        )
        .with_parameter(
            "document_path",
            ParameterSpec::required("string", "Path of the document"),
        )
        .with_parameter(
            "format",
            ParameterSpec::optional("string", "Source format hint", json!("auto")),
        ),
        Arc::new(ExtractText),
    );
}
