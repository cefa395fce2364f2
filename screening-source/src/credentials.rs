//! Bearer token acquisition for the FHIR server.

use std::path::PathBuf;
use std::process::Command;

use serde::Deserialize;
use tracing::debug;

use crate::SourceError;

pub trait TokenProvider {
    fn access_token(&self) -> Result<String, SourceError>;
}

/// A token supplied up front (flag or environment).
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(<redacted>)")
    }
}

impl TokenProvider for StaticToken {
    fn access_token(&self) -> Result<String, SourceError> {
        if self.0.trim().is_empty() {
            return Err(SourceError::Credential("token is empty".to_string()));
        }
        Ok(self.0.clone())
    }
}

/// Runs `az account get-access-token` for the server resource.
#[derive(Debug, Clone)]
pub struct AzureCliToken {
    az_path: PathBuf,
    resource: String,
}

impl AzureCliToken {
    pub fn new(az_path: impl Into<PathBuf>, resource: impl Into<String>) -> Self {
        Self {
            az_path: az_path.into(),
            resource: resource.into(),
        }
    }
}

impl TokenProvider for AzureCliToken {
    fn access_token(&self) -> Result<String, SourceError> {
        debug!(az = %self.az_path.display(), resource = %self.resource, "requesting access token");

        let output = Command::new(&self.az_path)
            .args([
                "account",
                "get-access-token",
                "--resource",
                &self.resource,
                "--output",
                "json",
            ])
            .output()
            .map_err(|err| {
                SourceError::Credential(format!(
                    "could not run {}: {err}",
                    self.az_path.display()
                ))
            })?;

        if !output.status.success() {
            return Err(SourceError::Credential(format!(
                "{} exited with {}: {}",
                self.az_path.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_token_response(&output.stdout)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzAccessToken {
    access_token: String,
}

/// Extract `accessToken` from the Azure CLI JSON output.
pub fn parse_token_response(stdout: &[u8]) -> Result<String, SourceError> {
    let parsed: AzAccessToken = serde_json::from_slice(stdout)
        .map_err(|err| SourceError::Credential(format!("unexpected az output: {err}")))?;
    if parsed.access_token.is_empty() {
        return Err(SourceError::Credential("az returned an empty token".to_string()));
    }
    Ok(parsed.access_token)
}
