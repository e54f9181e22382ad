//! Analytics tools: report generation, model runs, data export.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

use super::categories;
use crate::catalog::{ParameterSpec, Tool, ToolCatalog, ToolDescriptor};
use crate::types::{CatalogError, Subject};

struct GenerateReport;

#[async_trait]
impl Tool for GenerateReport {
    async fn invoke(&self, args: &Value, subject: &Subject) -> Result<Value, CatalogError> {
        let report_type = args["report_type"].as_str().unwrap_or_default();
        let format = args["format"].as_str().unwrap_or("pdf");

        info!(subject_id = %subject.subject_id, report_type, format, "report generated");
        Ok(json!({
            "report_type": report_type,
            "format": format,
            "parameters": args["parameters"],
            "generated_at": Utc::now().to_rfc3339(),
            "summary": format!("Report '{report_type}' generated as {format}"),
        }))
    }
}

struct RunAnalytics;

#[async_trait]
impl Tool for RunAnalytics {
    async fn invoke(&self, args: &Value, _subject: &Subject) -> Result<Value, CatalogError> {
        let analysis_type = args["analysis_type"].as_str().unwrap_or("summary");
        let data_source = args["data_source"].as_str().unwrap_or_default();

        Ok(json!({
            "analysis_type": analysis_type,
            "data_source": data_source,
            "parameters": args["parameters"],
            "metrics": {"records_processed": 0, "anomalies": 0},
        }))
    }
}

struct ExportData;

#[async_trait]
impl Tool for ExportData {
    async fn invoke(&self, args: &Value, _subject: &Subject) -> Result<Value, CatalogError> {
        let data_source = args["data_source"].as_str().unwrap_or_default();
        let format = args["format"].as_str().unwrap_or("csv");

        Ok(json!({
            "data_source": data_source,
            "format": format,
            "filters": args["filters"],
            "summary": format!("Export of '{data_source}' prepared as {format}"),
        }))
    }
}

/// Register the analytics tool set.
pub fn register(catalog: &Arc<ToolCatalog>) {
    catalog.register(
        ToolDescriptor::new(
            "generate_report",
            "Generate business reports and analytics",
            categories::ANALYTICS,
        )
        .with_parameter(
            "report_type",
            ParameterSpec::required("string", "Kind of report to build"),
        )
        .with_parameter(
            "parameters",
            ParameterSpec::optional("object", "Report parameters", json!({})),
        )
        .with_parameter(
            "format",
            ParameterSpec::optional("string", "Output format", json!("pdf")),
        ),
        Arc::new(GenerateReport),
    );

    catalog.register(
        ToolDescriptor::new(
            "run_analytics",
            "Run an analytics model over a data source",
            categories::ANALYTICS,
        )
        .with_parameter(
            "analysis_type",
            ParameterSpec::optional("string", "Kind of analysis", json!("summary")),
        )
        .with_parameter(
            "data_source",
            ParameterSpec::required("string", "Source dataset"),
        )
        .with_parameter(
            "parameters",
            ParameterSpec::optional("object", "Model parameters", json!({})),
        ),
        Arc::new(RunAnalytics),
    );

    catalog.register(
        ToolDescriptor::new(
            "export_data",
            "Export a dataset for downstream analysis",
            categories::ANALYTICS,
        )
        .with_parameter(
            "data_source",
            ParameterSpec::required("string", "Source dataset"),
        )
        .with_parameter(
            "format",
            ParameterSpec::optional("string", "Export format", json!("csv")),
        )
        .with_parameter(
            "filters",
            ParameterSpec::optional("object", "Row filters", json!({})),
        ),
        Arc::new(ExportData),
    );
}
