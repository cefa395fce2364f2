//! NDJSON file source: one procedures file, one observations file.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use screening_core::{LabResult, Procedure};
use screening_fhir::{parse_lab_result, parse_procedure, FhirError, NdjsonReader};
use serde_json::Value;
use tracing::debug;

use crate::{RecordSource, RecordStream, SourceError};

#[derive(Debug, Clone)]
pub struct NdjsonSource {
    procedures: PathBuf,
    observations: PathBuf,
}

impl NdjsonSource {
    pub fn new(procedures: impl Into<PathBuf>, observations: impl Into<PathBuf>) -> Self {
        Self {
            procedures: procedures.into(),
            observations: observations.into(),
        }
    }
}

impl RecordSource for NdjsonSource {
    fn fetch_procedures(&self) -> RecordStream<'_, Procedure> {
        documents(&self.procedures, parse_procedure, |_| true)
    }

    /// Streams the whole observations file, keeping only the subject's results.
    fn fetch_lab_results(&self, subject_id: &str) -> RecordStream<'_, LabResult> {
        let subject_id = subject_id.to_string();
        documents(&self.observations, parse_lab_result, move |result| {
            result.subject_id.as_deref() == Some(subject_id.as_str())
        })
    }
}

fn documents<'a, T: 'a>(
    path: &Path,
    parse: fn(&Value) -> Result<T, FhirError>,
    keep: impl Fn(&T) -> bool + 'a,
) -> RecordStream<'a, T> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(source) => {
            return Box::new(std::iter::once(Err(SourceError::Io {
                path: path.to_path_buf(),
                source,
            })))
        }
    };

    let origin = path.display().to_string();
    let mut reader = NdjsonReader::new(BufReader::new(file));
    let mut failed = false;

    Box::new(std::iter::from_fn(move || {
        if failed {
            return None;
        }
        loop {
            match reader.next()? {
                Ok(line) => match parse(&line.value) {
                    Ok(item) if keep(&item) => return Some(Ok(item)),
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(origin = %origin, line = line.line_number, error = %err, "skipping document");
                        continue;
                    }
                },
                Err(source) => {
                    failed = true;
                    return Some(Err(SourceError::Decode {
                        origin: origin.clone(),
                        source,
                    }));
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        path
    }

    fn source(dir: &tempfile::TempDir) -> NdjsonSource {
        let procedures = write_file(
            dir,
            "service_requests.ndjson",
            &[
                r#"{"resourceType":"ServiceRequest","id":"sr-1","subject":{"reference":"Patient/p1"},"occurrenceDateTime":"2025-06-10T00:00:00Z"}"#,
                r#"{"resourceType":"Patient","id":"p1"}"#,
                "",
                "{oops",
                r#"{"resourceType":"ServiceRequest","id":"sr-2","subject":{"reference":"Patient/p2"},"occurrenceDateTime":"2025-06-11T00:00:00Z"}"#,
            ],
        );
        let observations = write_file(
            dir,
            "observations.ndjson",
            &[
                r#"{"resourceType":"Observation","id":"o1","subject":{"reference":"Patient/p1"},"effectiveDateTime":"2025-06-08T00:00:00Z"}"#,
                r#"{"resourceType":"Observation","id":"o2","subject":{"reference":"Patient/p2"},"effectiveDateTime":"2025-06-08T00:00:00Z"}"#,
                r#"{"resourceType":"Observation","id":"o3","subject":{"reference":"Patient/p1"}}"#,
            ],
        );
        NdjsonSource::new(procedures, observations)
    }

    #[test]
    fn procedures_skip_malformed_and_foreign_documents() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(&dir);

        let ids: Vec<String> = source
            .fetch_procedures()
            .map(|p| p.unwrap().id)
            .collect();

        assert_eq!(ids, vec!["sr-1", "sr-2"]);
    }

    #[test]
    fn lab_results_are_filtered_by_subject() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(&dir);

        let ids: Vec<String> = source
            .fetch_lab_results("p1")
            .map(|r| r.unwrap().id)
            .collect();
        assert_eq!(ids, vec!["o1", "o3"]);

        assert_eq!(source.fetch_lab_results("nobody").count(), 0);
    }

    #[test]
    fn streams_restart_on_each_call() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(&dir);

        assert_eq!(source.fetch_procedures().count(), 2);
        assert_eq!(source.fetch_procedures().count(), 2);
    }

    #[test]
    fn invalid_utf8_line_does_not_end_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let procedures = dir.path().join("service_requests.ndjson");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(br#"{"resourceType":"ServiceRequest","id":"sr-1","subject":{"reference":"Patient/p1"}}"#);
        bytes.extend_from_slice(b"\n\xff\xfe garbage\n");
        bytes.extend_from_slice(br#"{"resourceType":"ServiceRequest","id":"sr-2","subject":{"reference":"Patient/p2"}}"#);
        bytes.push(b'\n');
        std::fs::write(&procedures, bytes).unwrap();

        let source = NdjsonSource::new(procedures, dir.path().join("observations.ndjson"));
        let ids: Vec<String> = source
            .fetch_procedures()
            .map(|p| p.unwrap().id)
            .collect();

        assert_eq!(ids, vec!["sr-1", "sr-2"]);
    }

    #[test]
    fn missing_file_is_a_single_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = NdjsonSource::new(
            dir.path().join("absent.ndjson"),
            dir.path().join("absent-too.ndjson"),
        );

        let items: Vec<_> = source.fetch_procedures().collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(SourceError::Io { .. })));
    }
}
