//! # Source Adapters
//!
//! The seam between the pipeline and a system of record. An adapter
//! answers two questions for a set of stem keywords: how far the source
//! has advanced, and which rows (plus side slices) belong to one id.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use strata_core::{ExtractedContext, StrataError};

/// Keyword naming the field the id value is matched against.
pub const ID_VALUE_FIELD_KEYWORD: &str = "id_value_field";
/// Keyword carrying the id value being extracted.
pub const ID_VALUE_KEYWORD: &str = "id_value";

/// Keywords that address a stem rather than a row column.
const STEM_KEYWORDS: [&str; 4] = [
    "graph_type",
    "object_type",
    ID_VALUE_FIELD_KEYWORD,
    ID_VALUE_KEYWORD,
];

/// Rows returned for one extraction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedData {
    /// Candidate source rows; a well-formed source yields exactly one.
    pub source: Vec<Map<String, Value>>,
    pub context: ExtractedContext,
}

pub trait SourceAdapter: Send + Sync {
    /// Highest id value the source has produced for the stem.
    fn remote_max(&self, keywords: &Map<String, Value>) -> Result<i64, StrataError>;

    fn extract(&self, keywords: &Map<String, Value>) -> Result<ExtractedData, StrataError>;
}

// =============================================================================
// FIXTURE ADAPTER
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
struct FixtureRecord {
    row: Map<String, Value>,
    #[serde(default)]
    slices: BTreeMap<String, Vec<Map<String, Value>>>,
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureDocument {
    watermark: i64,
    #[serde(default)]
    records: Vec<FixtureRecord>,
}

/// Serves rows from a JSON document:
///
/// ```json
/// { "watermark": 1005, "records": [ { "row": {...}, "slices": { "name": [...] } } ] }
/// ```
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    document: FixtureDocument,
}

impl FixtureAdapter {
    pub fn from_json_str(text: &str) -> Result<Self, StrataError> {
        let document = serde_json::from_str(text)
            .map_err(|e| StrataError::DeserializationError(format!("source fixture: {e}")))?;
        Ok(Self { document })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, StrataError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| StrataError::IoError(format!("{}: {e}", path.display())))?;
        let adapter = Self::from_json_str(&text)?;
        tracing::info!(
            path = %path.display(),
            records = adapter.document.records.len(),
            watermark = adapter.document.watermark,
            "source fixture loaded"
        );
        Ok(adapter)
    }

    fn matches(row: &Map<String, Value>, keywords: &Map<String, Value>) -> Result<bool, StrataError> {
        let field = keywords
            .get(ID_VALUE_FIELD_KEYWORD)
            .and_then(Value::as_str)
            .ok_or_else(|| StrataError::ConsistencyViolation("extraction without id_value_field".into()))?;
        let wanted = keywords
            .get(ID_VALUE_KEYWORD)
            .ok_or_else(|| StrataError::ConsistencyViolation("extraction without id_value".into()))?;
        if row.get(field).map(text) != Some(text(wanted)) {
            return Ok(false);
        }
        Ok(keywords
            .iter()
            .filter(|(name, _)| !STEM_KEYWORDS.contains(&name.as_str()))
            .all(|(name, value)| row.get(name).is_none_or(|have| text(have) == text(value))))
    }
}

/// Compare scalars by their text so `1002` and `"1002"` agree.
fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl SourceAdapter for FixtureAdapter {
    fn remote_max(&self, _keywords: &Map<String, Value>) -> Result<i64, StrataError> {
        Ok(self.document.watermark)
    }

    fn extract(&self, keywords: &Map<String, Value>) -> Result<ExtractedData, StrataError> {
        let mut data = ExtractedData::default();
        for record in &self.document.records {
            if !Self::matches(&record.row, keywords)? {
                continue;
            }
            data.source.push(record.row.clone());
            for (name, rows) in &record.slices {
                data.context
                    .slices
                    .entry(name.clone())
                    .or_default()
                    .extend(rows.iter().cloned());
            }
        }
        Ok(data)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    const FIXTURE: &str = include_str!("../../../demos/clinical_source.json");

    fn keywords(id: Value) -> Map<String, Value> {
        let Value::Object(map) = json!({
            "graph_type": "vertex",
            "object_type": "Patient",
            "id_source": "Algernon",
            "id_value_field": "patient_id",
            "id_value": id,
        }) else {
            panic!("object literal");
        };
        map
    }

    #[test]
    fn extracts_one_row_with_slices() {
        let adapter = FixtureAdapter::from_json_str(FIXTURE).expect("fixture");
        assert_eq!(adapter.remote_max(&keywords(json!(0))).expect("max"), 1005);

        let data = adapter.extract(&keywords(json!("1002"))).expect("extract");
        assert_eq!(data.source.len(), 1);
        assert_eq!(data.source[0]["first_name"], json!("Ada"));
        assert_eq!(data.context.rows("encounters").len(), 1);
        assert_eq!(data.context.rows("facility").len(), 1);
    }

    #[test]
    fn stem_properties_filter_rows() {
        let adapter = FixtureAdapter::from_json_str(FIXTURE).expect("fixture");
        let mut other_source = keywords(json!(1002));
        other_source.insert("id_source".into(), json!("Elsewhere"));
        assert!(adapter.extract(&other_source).expect("extract").source.is_empty());
        assert!(adapter.extract(&keywords(json!(4242))).expect("extract").source.is_empty());
    }

    #[test]
    fn duplicate_rows_are_all_returned() {
        let doc = json!({
            "watermark": 2,
            "records": [
                { "row": { "patient_id": 2 } },
                { "row": { "patient_id": 2 } },
            ]
        });
        let adapter = FixtureAdapter::from_json_str(&doc.to_string()).expect("fixture");
        assert_eq!(adapter.extract(&keywords(json!(2))).expect("extract").source.len(), 2);
    }
}
