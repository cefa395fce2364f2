//! Record sources for procedures and lab results, plus the screening pipeline
//! that streams them through the classifier and evaluator.

use std::path::PathBuf;

use screening_core::{LabResult, Procedure};
use screening_fhir::FhirError;

pub mod credentials;
pub mod ndjson;
pub mod pipeline;
pub mod server;

pub use credentials::{AzureCliToken, StaticToken, TokenProvider};
pub use ndjson::NdjsonSource;
pub use pipeline::{Screener, ScreeningOutcome, ScreeningStats};
pub use server::{BundleFetcher, FhirServerConfig, FhirServerSource, HttpFetcher, PagedResources};

/// Lazy, finite stream of records. A failed page or file ends the stream after one `Err`.
pub type RecordStream<'a, T> = Box<dyn Iterator<Item = Result<T, SourceError>> + 'a>;

/// Supplies procedures and per-patient lab results.
///
/// Each call starts a fresh sequence; malformed documents are skipped, never raised.
pub trait RecordSource {
    fn fetch_procedures(&self) -> RecordStream<'_, Procedure>;

    fn fetch_lab_results(&self, subject_id: &str) -> RecordStream<'_, LabResult>;
}

impl<S: RecordSource + ?Sized> RecordSource for &S {
    fn fetch_procedures(&self) -> RecordStream<'_, Procedure> {
        (**self).fetch_procedures()
    }

    fn fetch_lab_results(&self, subject_id: &str) -> RecordStream<'_, LabResult> {
        (**self).fetch_lab_results(subject_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to acquire access token: {0}")]
    Credential(String),
    #[error("invalid source configuration: {0}")]
    Config(String),
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("{url} returned HTTP {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("could not decode data from {origin}: {source}")]
    Decode {
        origin: String,
        #[source]
        source: FhirError,
    },
    #[error("could not open {path}: {source}", path = path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
