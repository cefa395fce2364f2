//! FHIR REST server source with `link[relation=next]` pagination.

use std::time::Duration;

use reqwest::header::ACCEPT;
use reqwest::Url;
use screening_core::{LabResult, MonitoredCode, Procedure};
use screening_fhir::{
    parse_bundle_str, parse_lab_result, parse_procedure, FhirError, SearchBundle,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{RecordSource, RecordStream, SourceError, TokenProvider};

/// Endpoint and paging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FhirServerConfig {
    base_url: String,
    pub procedure_page_size: u32,
    pub result_page_size: u32,
    pub timeout_secs: u64,
}

impl FhirServerConfig {
    pub fn new(base_url: &str) -> Result<Self, SourceError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
            return Err(SourceError::Config(format!(
                "base URL must be http(s), got {base_url:?}"
            )));
        }
        Url::parse(&base_url)
            .map_err(|err| SourceError::Config(format!("invalid base URL {base_url:?}: {err}")))?;

        Ok(Self {
            base_url,
            procedure_page_size: 200,
            result_page_size: 50,
            timeout_secs: 30,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Fetches one search page. Implemented over HTTP in production and in memory in tests.
pub trait BundleFetcher {
    fn fetch_page(&self, url: &str) -> Result<SearchBundle, SourceError>;
}

impl<F: BundleFetcher + ?Sized> BundleFetcher for &F {
    fn fetch_page(&self, url: &str) -> Result<SearchBundle, SourceError> {
        (**self).fetch_page(url)
    }
}

/// Blocking HTTP fetcher carrying a bearer token.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    token: String,
    timeout_secs: u64,
}

impl HttpFetcher {
    pub fn new(token: String, timeout_secs: u64) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|err| SourceError::Config(format!("failed to create HTTP client: {err}")))?;

        Ok(Self {
            client,
            token,
            timeout_secs,
        })
    }
}

impl BundleFetcher for HttpFetcher {
    fn fetch_page(&self, url: &str) -> Result<SearchBundle, SourceError> {
        debug!(url, "fetching search page");

        let transport_error = |err: reqwest::Error| SourceError::Transport {
            url: url.to_string(),
            message: if err.is_timeout() {
                format!("request timed out after {}s", self.timeout_secs)
            } else {
                err.to_string()
            },
        };

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/fhir+json")
            .send()
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(SourceError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().map_err(transport_error)?;
        parse_bundle_str(&body).map_err(|source| SourceError::Decode {
            origin: url.to_string(),
            source,
        })
    }
}

/// Lazy iterator over every resource of a paged search, one page buffered at a time.
pub struct PagedResources<'f, F: ?Sized, T> {
    fetcher: &'f F,
    next_url: Option<String>,
    buffered: std::vec::IntoIter<Value>,
    parse: fn(&Value) -> Result<T, FhirError>,
    pages: usize,
}

impl<'f, F: BundleFetcher + ?Sized, T> PagedResources<'f, F, T> {
    pub fn new(fetcher: &'f F, first_url: String, parse: fn(&Value) -> Result<T, FhirError>) -> Self {
        Self {
            fetcher,
            next_url: Some(first_url),
            buffered: Vec::new().into_iter(),
            parse,
            pages: 0,
        }
    }

    /// Number of pages fetched so far.
    pub fn pages(&self) -> usize {
        self.pages
    }
}

impl<F: BundleFetcher + ?Sized, T> Iterator for PagedResources<'_, F, T> {
    type Item = Result<T, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(resource) = self.buffered.next() {
                match (self.parse)(&resource) {
                    Ok(item) => return Some(Ok(item)),
                    Err(err) => {
                        debug!(error = %err, "skipping resource in search page");
                        continue;
                    }
                }
            }

            let url = self.next_url.take()?;
            // next_url stays empty on failure, so the stream ends after this error.
            let page = match self.fetcher.fetch_page(&url) {
                Ok(page) => page,
                Err(err) => return Some(Err(err)),
            };
            self.pages += 1;

            self.next_url = match page.next {
                Some(next) if next == url => {
                    warn!(url = %url, "search page links to itself; stopping pagination");
                    None
                }
                other => other,
            };
            self.buffered = page.resources.into_iter();
        }
    }
}

/// Record source backed by a FHIR server.
pub struct FhirServerSource<F> {
    config: FhirServerConfig,
    fetcher: F,
    code_filter: Option<String>,
}

impl FhirServerSource<HttpFetcher> {
    /// Acquire a token and build an HTTP-backed source. Credential failures are fatal.
    pub fn connect(
        config: FhirServerConfig,
        tokens: &dyn TokenProvider,
    ) -> Result<Self, SourceError> {
        let token = tokens.access_token()?;
        let fetcher = HttpFetcher::new(token, config.timeout_secs)?;
        Ok(Self::with_fetcher(config, fetcher))
    }
}

impl<F: BundleFetcher> FhirServerSource<F> {
    pub fn with_fetcher(config: FhirServerConfig, fetcher: F) -> Self {
        Self {
            config,
            fetcher,
            code_filter: None,
        }
    }

    /// Restrict lab-result searches server-side to the given codes.
    pub fn with_code_filter(mut self, codes: &[MonitoredCode]) -> Self {
        self.code_filter = if codes.is_empty() {
            None
        } else {
            Some(
                codes
                    .iter()
                    .map(|code| format!("{}|{}", code.system, code.code))
                    .collect::<Vec<_>>()
                    .join(","),
            )
        };
        self
    }

    pub fn procedures_url(&self) -> String {
        format!(
            "{}/ServiceRequest?_count={}",
            self.config.base_url, self.config.procedure_page_size
        )
    }

    /// Per-patient search; query values are percent-encoded.
    pub fn lab_results_url(&self, subject_id: &str) -> Result<String, SourceError> {
        let mut params = vec![("subject", format!("Patient/{subject_id}"))];
        if let Some(codes) = &self.code_filter {
            params.push(("code", codes.clone()));
        }
        params.push(("_sort", "-date".to_string()));
        params.push(("_count", self.config.result_page_size.to_string()));

        let url = Url::parse_with_params(&format!("{}/Observation", self.config.base_url), &params)
            .map_err(|err| SourceError::Config(format!("invalid search URL: {err}")))?;
        Ok(url.into())
    }
}

impl<F: BundleFetcher> RecordSource for FhirServerSource<F> {
    fn fetch_procedures(&self) -> RecordStream<'_, Procedure> {
        Box::new(PagedResources::new(
            &self.fetcher,
            self.procedures_url(),
            parse_procedure,
        ))
    }

    fn fetch_lab_results(&self, subject_id: &str) -> RecordStream<'_, LabResult> {
        match self.lab_results_url(subject_id) {
            Ok(url) => Box::new(PagedResources::new(&self.fetcher, url, parse_lab_result)),
            Err(err) => Box::new(std::iter::once(Err(err))),
        }
    }
}
