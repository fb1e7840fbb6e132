//! Wire types for structured extraction output.
//!
//! Field names mirror the datasheet vocabulary the extraction prompt uses,
//! so the same types serve as the provider's JSON schema and as the parsed
//! payload. The artifact type is the aggregated JSON written per file.

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Result of the enumeration pass: every model number the document covers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct EnumeratedModels {
    pub models: Vec<String>,
}

/// Result of one extraction batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedModels {
    pub models: Vec<RawModelItem>,
}

/// A `{ value }` wrapper; the schema keeps single fields nested so the
/// prompt can attach per-field guidance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ValueField {
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VoltageRange {
    pub lower: Option<String>,
    pub upper: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutputVoltage {
    pub value: Option<String>,
    /// True when the converter provides a symmetric dual-rail output.
    pub dual_output: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TagList {
    pub values: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DimensionField {
    pub length: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
}

/// One model's specification exactly as extracted, before reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RawModelItem {
    #[serde(rename = "Model Number")]
    pub model_number: Option<String>,
    #[serde(rename = "Input Voltage", default)]
    pub input_voltage: Option<VoltageRange>,
    #[serde(rename = "Output Voltage", default)]
    pub output_voltage: Option<OutputVoltage>,
    #[serde(rename = "Output Power", default)]
    pub output_power: Option<ValueField>,
    #[serde(rename = "Package", default)]
    pub package: Option<ValueField>,
    #[serde(rename = "I/O Isolation", default)]
    pub isolation: Option<ValueField>,
    #[serde(rename = "Insulation System", default)]
    pub insulation: Option<ValueField>,
    #[serde(rename = "Application", default)]
    pub application: Option<TagList>,
    #[serde(rename = "Dimension", default)]
    pub dimension: Option<DimensionField>,
}

/// Aggregated extraction output written to `extractions/{file_hash}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionArtifact {
    pub models: Vec<RawModelItem>,
    pub file_hash: String,
    /// RFC 3339 UTC timestamp of when the artifact was produced.
    pub generated_at: String,
}

impl ExtractionArtifact {
    #[must_use]
    pub fn new(file_hash: impl Into<String>, models: Vec<RawModelItem>) -> Self {
        Self {
            models,
            file_hash: file_hash.into(),
            generated_at: Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_item_parses_datasheet_vocabulary() {
        let raw = serde_json::json!({
            "Model Number": "PX-100",
            "Input Voltage": { "lower": "9VDC", "upper": "18VDC" },
            "Output Voltage": { "value": "12VDC", "dual_output": true },
            "Output Power": { "value": "10W" },
            "Application": { "values": ["Railway", "Industrial"] },
            "Dimension": { "length": "25.4", "width": "25.4", "height": "10.2" },
        });
        let item: RawModelItem = serde_json::from_value(raw).expect("parses");
        assert_eq!(item.model_number.as_deref(), Some("PX-100"));
        assert_eq!(
            item.input_voltage.as_ref().and_then(|v| v.lower.as_deref()),
            Some("9VDC")
        );
        assert_eq!(
            item.output_voltage.as_ref().and_then(|v| v.dual_output),
            Some(true)
        );
        assert!(item.package.is_none());
    }

    #[test]
    fn artifact_serializes_with_original_keys() {
        let artifact = ExtractionArtifact::new(
            "aa11",
            vec![RawModelItem {
                model_number: Some("PX-100".to_string()),
                ..RawModelItem::default()
            }],
        );
        let value = serde_json::to_value(&artifact).expect("serialize");
        assert_eq!(value["file_hash"], "aa11");
        assert_eq!(value["models"][0]["Model Number"], "PX-100");
        assert!(value["generated_at"].as_str().is_some());
    }
}
