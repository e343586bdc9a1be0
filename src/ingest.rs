//! CSV ingestion: turns an uploaded file into engine chunks and metadata.
//!
//! Every data row becomes one chunk. The chunk text is the configured text
//! columns joined by a single space, trimmed. Each column listed in
//! `metadata_types` is parsed as its declared dtype and stored as chunk
//! metadata, on top of any document-level metadata (a column value wins over
//! a document-level key of the same name).
//!
//! All failures are client errors (HTTP 422) and name the offending column
//! or value.

use std::collections::HashMap;

use ndb_core::{Dtype, Metadata, MetadataValue};

use crate::error::ApiError;

/// Largest accepted upload, in bytes.
pub const MAX_INSERT_FILE_SIZE: usize = 100 * 1024 * 1024;

/// Chunks and their metadata, index-aligned.
#[derive(Debug, Default, PartialEq)]
pub struct ParsedDocument {
    pub chunks: Vec<String>,
    pub metadata: Vec<Metadata>,
}

fn unprocessable(message: impl Into<String>) -> ApiError {
    ApiError::Unprocessable(message.into())
}

/// Parse one cell as `dtype`.
pub fn parse_value(dtype: Dtype, raw: &str) -> Result<MetadataValue, String> {
    match dtype {
        Dtype::Str => Ok(MetadataValue::Str(raw.to_string())),
        Dtype::Int => raw
            .trim()
            .parse::<i64>()
            .map(MetadataValue::Int)
            .map_err(|e| e.to_string()),
        Dtype::Float => match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(MetadataValue::Float(v)),
            Ok(v) => Err(format!("non-finite float {} is not supported", v)),
            Err(e) => Err(e.to_string()),
        },
        Dtype::Bool => match raw.trim().to_lowercase().as_str() {
            "true" | "1" => Ok(MetadataValue::Bool(true)),
            "false" | "0" => Ok(MetadataValue::Bool(false)),
            _ => Err(format!(
                "invalid boolean value: {}, expected true/1 or false/0",
                raw
            )),
        },
    }
}

pub fn parse_csv(
    data: &[u8],
    text_columns: &[String],
    metadata_types: &HashMap<String, String>,
    doc_metadata: &Metadata,
) -> Result<ParsedDocument, ApiError> {
    if text_columns.is_empty() {
        return Err(unprocessable("text_columns must name at least one column"));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(data);

    let header = reader
        .headers()
        .map_err(|e| unprocessable(format!("only CSV files are supported: unable to read CSV header: {}", e)))?
        .clone();
    if header.is_empty() {
        return Err(unprocessable("CSV file is empty"));
    }

    let col_to_idx: HashMap<&str, usize> = header.iter().enumerate().map(|(i, c)| (c, i)).collect();

    let mut text_idx = Vec::with_capacity(text_columns.len());
    for col in text_columns {
        let idx = col_to_idx.get(col.as_str()).ok_or_else(|| {
            unprocessable(format!(
                "column '{}' specified for indexing is not present in the CSV header",
                col
            ))
        })?;
        text_idx.push(*idx);
    }

    let mut metadata_cols: Vec<(&str, usize, Dtype)> = Vec::with_capacity(metadata_types.len());
    for (col, dtype) in metadata_types {
        let idx = col_to_idx.get(col.as_str()).ok_or_else(|| {
            unprocessable(format!("metadata column {} not found in CSV header", col))
        })?;
        let dtype = Dtype::parse(dtype)
            .map_err(|e| unprocessable(format!("metadata column {}: {}", col, e)))?;
        metadata_cols.push((col.as_str(), *idx, dtype));
    }

    let mut doc = ParsedDocument::default();
    for (row_num, record) in reader.records().enumerate() {
        let record = record.map_err(|e| {
            unprocessable(format!("unable to read CSV row {}: {}", row_num + 1, e))
        })?;

        let text = text_idx
            .iter()
            .map(|&i| record.get(i).unwrap_or(""))
            .collect::<Vec<_>>()
            .join(" ");
        doc.chunks.push(text.trim().to_string());

        let mut meta = doc_metadata.clone();
        for &(col, idx, dtype) in &metadata_cols {
            let raw = record.get(idx).unwrap_or("");
            let value = parse_value(dtype, raw).map_err(|e| {
                unprocessable(format!(
                    "error parsing metadata column {} value {}: {}",
                    col, raw, e
                ))
            })?;
            meta.insert(col.to_string(), value);
        }
        doc.metadata.push(meta);
    }

    if doc.chunks.is_empty() {
        return Err(unprocessable("CSV file has no data rows"));
    }

    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn types(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn message(err: ApiError) -> String {
        match err {
            ApiError::Unprocessable(m) => m,
            other => panic!("expected 422, got {:?}", other),
        }
    }

    const FRUIT: &str = "id,name,desc,price,ripe\n\
                         1,apple, red fruit ,5.2,true\n\
                         2,kiwi,green fruit,9.2,0\n";

    #[test]
    fn test_text_columns_joined_and_trimmed() {
        let doc = parse_csv(
            FRUIT.as_bytes(),
            &cols(&["name", "desc"]),
            &HashMap::new(),
            &Metadata::new(),
        )
        .unwrap();
        assert_eq!(doc.chunks, vec!["apple  red fruit", "kiwi green fruit"]);
        assert!(doc.metadata.iter().all(|m| m.is_empty()));
    }

    #[test]
    fn test_metadata_types_and_doc_metadata() {
        let mut doc_meta = Metadata::new();
        doc_meta.insert("origin".to_string(), MetadataValue::Str("farm".to_string()));
        doc_meta.insert("price".to_string(), MetadataValue::Int(0));

        let doc = parse_csv(
            FRUIT.as_bytes(),
            &cols(&["name"]),
            &types(&[("id", "integer"), ("price", "float"), ("ripe", "boolean"), ("name", "string")]),
            &doc_meta,
        )
        .unwrap();

        let first = &doc.metadata[0];
        assert_eq!(first["id"], MetadataValue::Int(1));
        assert_eq!(first["price"], MetadataValue::Float(5.2));
        assert_eq!(first["ripe"], MetadataValue::Bool(true));
        assert_eq!(first["name"], MetadataValue::Str("apple".to_string()));
        assert_eq!(first["origin"], MetadataValue::Str("farm".to_string()));
        assert_eq!(doc.metadata[1]["ripe"], MetadataValue::Bool(false));
    }

    #[test]
    fn test_parse_bool_is_lenient() {
        assert_eq!(parse_value(Dtype::Bool, " TRUE "), Ok(MetadataValue::Bool(true)));
        assert_eq!(parse_value(Dtype::Bool, "False"), Ok(MetadataValue::Bool(false)));
        assert!(parse_value(Dtype::Bool, "yes").is_err());
    }

    #[test]
    fn test_non_finite_floats_rejected() {
        for raw in ["NaN", "inf", "-infinity"] {
            assert!(parse_value(Dtype::Float, raw).is_err(), "{} accepted", raw);
        }

        let csv = "name,price\napple,NaN\n";
        let err = parse_csv(
            csv.as_bytes(),
            &cols(&["name"]),
            &types(&[("price", "float")]),
            &Metadata::new(),
        )
        .unwrap_err();
        assert!(message(err).contains("error parsing metadata column price value NaN"));

        let csv = "name,price\napple,inf\n";
        let err = parse_csv(
            csv.as_bytes(),
            &cols(&["name"]),
            &types(&[("price", "float")]),
            &Metadata::new(),
        )
        .unwrap_err();
        assert!(message(err).contains("non-finite"));
    }

    #[test]
    fn test_missing_columns() {
        let err = parse_csv(FRUIT.as_bytes(), &cols(&["title"]), &HashMap::new(), &Metadata::new())
            .unwrap_err();
        assert!(message(err).contains("column 'title' specified for indexing"));

        let err = parse_csv(
            FRUIT.as_bytes(),
            &cols(&["name"]),
            &types(&[("weight", "float")]),
            &Metadata::new(),
        )
        .unwrap_err();
        assert!(message(err).contains("metadata column weight not found"));
    }

    #[test]
    fn test_bad_values_and_dtypes() {
        let err = parse_csv(
            FRUIT.as_bytes(),
            &cols(&["name"]),
            &types(&[("name", "integer")]),
            &Metadata::new(),
        )
        .unwrap_err();
        assert!(message(err).contains("error parsing metadata column name value apple"));

        let err = parse_csv(
            FRUIT.as_bytes(),
            &cols(&["name"]),
            &types(&[("price", "decimal")]),
            &Metadata::new(),
        )
        .unwrap_err();
        assert!(message(err).contains("unknown dtype"));
    }

    #[test]
    fn test_empty_and_ragged_files() {
        let err = parse_csv(b"", &cols(&["name"]), &HashMap::new(), &Metadata::new()).unwrap_err();
        assert!(message(err).contains("empty"));

        let err =
            parse_csv(b"name\n", &cols(&["name"]), &HashMap::new(), &Metadata::new()).unwrap_err();
        assert!(message(err).contains("no data rows"));

        let err = parse_csv(
            b"name,desc\napple\n",
            &cols(&["name"]),
            &HashMap::new(),
            &Metadata::new(),
        )
        .unwrap_err();
        assert!(message(err).contains("row 1"));
    }
}
