//! FHIR JSON to screening domain converter: resources, search bundles and NDJSON streams.

use std::io::{BufRead, Write};

use serde::Serialize;
use serde_json::Value;
use screening_core::{Coding, Concept, LabResult, Procedure};
use tracing::debug;

pub const PROCEDURE_RESOURCE: &str = "ServiceRequest";
pub const LAB_RESULT_RESOURCE: &str = "Observation";

/// Errors raised while reading interchange documents.
#[derive(Debug, thiserror::Error)]
pub enum FhirError {
    #[error("document is missing required field `{0}`")]
    MissingData(&'static str),
    #[error("expected resourceType {expected}, received {found}")]
    UnexpectedResourceType { expected: &'static str, found: String },
    #[error("invalid JSON: {0}")]
    Parse(String),
    #[error("failed to serialize document: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse a `ServiceRequest` document into a [`Procedure`].
pub fn parse_procedure(resource: &Value) -> Result<Procedure, FhirError> {
    expect_resource_type(resource, PROCEDURE_RESOURCE)?;

    Ok(Procedure {
        id: resource_id(resource, "procedure"),
        subject_id: subject_id(resource),
        scheduled_at: extract_timestamp(resource, &["occurrenceDateTime", "occurrencePeriod"]),
    })
}

/// Parse an `Observation` document into a [`LabResult`].
pub fn parse_lab_result(resource: &Value) -> Result<LabResult, FhirError> {
    expect_resource_type(resource, LAB_RESULT_RESOURCE)?;

    Ok(LabResult {
        id: resource_id(resource, "observation"),
        subject_id: subject_id(resource),
        code: resource
            .get("code")
            .map(extract_concept)
            .unwrap_or_default(),
        category: resource
            .get("category")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().map(extract_concept).collect())
            .unwrap_or_default(),
        effective_at: extract_timestamp(resource, &["effectiveDateTime", "effectiveInstant"]),
    })
}

/// Resource type of a document, if present.
pub fn resource_type(resource: &Value) -> Option<&str> {
    resource.get("resourceType").and_then(Value::as_str)
}

fn expect_resource_type(resource: &Value, expected: &'static str) -> Result<(), FhirError> {
    let found = resource_type(resource).ok_or(FhirError::MissingData("resourceType"))?;
    if found != expected {
        return Err(FhirError::UnexpectedResourceType {
            expected,
            found: found.to_string(),
        });
    }
    Ok(())
}

fn resource_id(resource: &Value, fallback: &str) -> String {
    resource
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{fallback}-unknown"))
}

/// Patient id from `subject.reference`; only `Patient/<id>` references count.
pub fn subject_id(resource: &Value) -> Option<String> {
    let reference = resource
        .get("subject")
        .and_then(|subject| subject.get("reference"))
        .and_then(Value::as_str)?;
    patient_id_from_reference(reference)
}

/// `Patient/<id>`, optionally versioned (`Patient/<id>/_history/<v>`).
pub fn patient_id_from_reference(reference: &str) -> Option<String> {
    let rest = reference.trim().strip_prefix("Patient/")?;
    let id = rest.split('/').next().unwrap_or_default();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

fn extract_concept(value: &Value) -> Concept {
    let coding = value
        .get("coding")
        .and_then(Value::as_array)
        .map(|codings| {
            codings
                .iter()
                .filter(|coding| coding.is_object())
                .map(|coding| Coding {
                    system: string_field(coding, "system"),
                    code: string_field(coding, "code"),
                    display: string_field(coding, "display"),
                    text: string_field(coding, "text"),
                })
                .collect()
        })
        .unwrap_or_default();

    Concept {
        text: string_field(value, "text"),
        coding,
    }
}

fn string_field(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(str::to_string)
}

/// First timestamp found among `fields`; period objects contribute their `start`.
///
/// The raw string is returned untouched so the evaluator decides what is parseable.
fn extract_timestamp(resource: &Value, fields: &[&str]) -> Option<String> {
    for field in fields {
        let Some(value) = resource.get(*field) else {
            continue;
        };

        if let Some(text) = value.as_str() {
            if !text.trim().is_empty() {
                return Some(text.to_string());
            }
        }

        if let Some(start) = value.get("start").and_then(Value::as_str) {
            if !start.trim().is_empty() {
                return Some(start.to_string());
            }
        }
    }
    None
}

/// One page of a FHIR search response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchBundle {
    pub resources: Vec<Value>,
    /// URL of the next page (`link[relation=next]`).
    pub next: Option<String>,
}

/// Read a search bundle from a JSON string.
pub fn parse_bundle_str(bundle_json: &str) -> Result<SearchBundle, FhirError> {
    let value: Value =
        serde_json::from_str(bundle_json).map_err(|err| FhirError::Parse(err.to_string()))?;
    parse_bundle_value(&value)
}

/// Read a search bundle from a `serde_json::Value`.
pub fn parse_bundle_value(bundle: &Value) -> Result<SearchBundle, FhirError> {
    let bundle_type = resource_type(bundle).ok_or(FhirError::MissingData("resourceType"))?;
    if bundle_type != "Bundle" {
        return Err(FhirError::UnexpectedResourceType {
            expected: "Bundle",
            found: bundle_type.to_string(),
        });
    }

    // An empty search result may omit `entry` entirely.
    let resources = bundle
        .get("entry")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.get("resource"))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    let next = bundle
        .get("link")
        .and_then(Value::as_array)
        .and_then(|links| {
            links.iter().find(|link| {
                link.get("relation").and_then(Value::as_str) == Some("next")
            })
        })
        .and_then(|link| link.get("url"))
        .and_then(Value::as_str)
        .filter(|url| !url.trim().is_empty())
        .map(str::to_string);

    Ok(SearchBundle { resources, next })
}

/// A successfully decoded NDJSON line.
#[derive(Debug, Clone, PartialEq)]
pub struct NdjsonLine {
    pub line_number: usize,
    pub value: Value,
}

/// Lazy reader over newline-delimited JSON.
///
/// Blank lines and lines that are not valid JSON (including invalid UTF-8) are
/// skipped and counted; read failures from the underlying reader are yielded as errors.
pub struct NdjsonReader<R> {
    reader: R,
    buffer: Vec<u8>,
    line_number: usize,
    skipped: usize,
}

impl<R: BufRead> NdjsonReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
            line_number: 0,
            skipped: 0,
        }
    }

    /// Number of malformed lines skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl<R: BufRead> Iterator for NdjsonReader<R> {
    type Item = Result<NdjsonLine, FhirError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buffer.clear();
            match self.reader.read_until(b'\n', &mut self.buffer) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(FhirError::Io(err))),
            }
            self.line_number += 1;

            if self.buffer.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match serde_json::from_slice::<Value>(&self.buffer) {
                Ok(value) => {
                    return Some(Ok(NdjsonLine {
                        line_number: self.line_number,
                        value,
                    }))
                }
                Err(err) => {
                    self.skipped += 1;
                    debug!(line = self.line_number, error = %err, "skipping malformed NDJSON line");
                }
            }
        }
    }
}

/// Write one value as a single NDJSON line.
pub fn write_ndjson_line<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<(), FhirError> {
    serde_json::to_writer(&mut *writer, value)?;
    writer.write_all(b"\n")?;
    Ok(())
}
