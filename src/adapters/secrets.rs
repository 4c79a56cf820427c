//! `SecretResolver` adapters: a Vault KV-v2 client for
//! `SecretProviderConfig::Vault`, and a stub for `SecretProviderConfig::None`
//! that rejects any assignment naming secrets.
//!
//! Uses a reusable `reqwest::Client` with a base URL and credential baked
//! in at construction, one retry-free request per reference.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::domain::error::{AgentError, AgentResult};
use crate::domain::ports::SecretResolver;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves references of the form `path/to/secret#field` against a Vault
/// KV-v2 mount using a single token.
pub struct VaultSecretResolver {
    http: Client,
    address: String,
    token: String,
    mount: String,
}

impl VaultSecretResolver {
    pub fn new(address: String, token: String, mount: String) -> AgentResult<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AgentError::permanent(format!("failed to build vault http client: {e}")))?;
        Ok(Self { http, address, token, mount })
    }

    fn split_reference(reference: &str) -> AgentResult<(&str, &str)> {
        reference
            .split_once('#')
            .ok_or_else(|| AgentError::permanent(format!("secret reference {reference} missing '#field' suffix")))
    }

    async fn fetch_one(&self, reference: &str) -> AgentResult<(String, String)> {
        let (path, field) = Self::split_reference(reference)?;
        let url = format!("{}/v1/{}/data/{path}", self.address.trim_end_matches('/'), self.mount);

        let response = self
            .http
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| AgentError::transient(format!("vault request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(if status.is_server_error() {
                AgentError::transient(format!("vault returned {status} for {path}"))
            } else {
                AgentError::permanent(format!("vault returned {status} for {path}"))
            });
        }

        let body: VaultKvResponse = response
            .json()
            .await
            .map_err(|e| AgentError::transient(format!("vault response was not valid json: {e}")))?;

        let value = body
            .data
            .data
            .get(field)
            .ok_or_else(|| AgentError::permanent(format!("secret {path} has no field {field}")))?
            .clone();

        Ok((reference.to_string(), value))
    }
}

#[derive(Debug, Deserialize)]
struct VaultKvResponse {
    data: VaultKvData,
}

#[derive(Debug, Deserialize)]
struct VaultKvData {
    data: HashMap<String, String>,
}

#[async_trait]
impl SecretResolver for VaultSecretResolver {
    async fn resolve(&self, references: &[String]) -> AgentResult<HashMap<String, String>> {
        let mut resolved = HashMap::with_capacity(references.len());
        for reference in references {
            let (key, value) = self.fetch_one(reference).await?;
            resolved.insert(key, value);
        }
        Ok(resolved)
    }
}

/// Used when `SecretProviderConfig::None`: any assignment naming secrets is
/// rejected rather than silently run with missing credentials.
pub struct NoSecretResolver;

#[async_trait]
impl SecretResolver for NoSecretResolver {
    async fn resolve(&self, references: &[String]) -> AgentResult<HashMap<String, String>> {
        if references.is_empty() {
            return Ok(HashMap::new());
        }
        Err(AgentError::permanent(
            "run references secrets but no secret provider is configured",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_resolver_allows_empty_references() {
        let resolver = NoSecretResolver;
        let resolved = resolver.resolve(&[]).await.unwrap();
        assert!(resolved.is_empty());
    }

    #[tokio::test]
    async fn no_resolver_rejects_any_reference() {
        let resolver = NoSecretResolver;
        let err = resolver.resolve(&["db/creds#password".to_string()]).await.unwrap_err();
        assert!(matches!(err, AgentError::Permanent(_)));
    }

    #[test]
    fn splits_reference_on_hash() {
        let (path, field) = VaultSecretResolver::split_reference("ci/github#token").unwrap();
        assert_eq!(path, "ci/github");
        assert_eq!(field, "token");
    }

    #[test]
    fn rejects_reference_without_field() {
        assert!(VaultSecretResolver::split_reference("ci/github").is_err());
    }

    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetch_one_resolves_field_from_kv_v2_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/ci/github"))
            .and(header("X-Vault-Token", "test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "data": { "token": "s3cr3t" } }
            })))
            .mount(&server)
            .await;

        let resolver =
            VaultSecretResolver::new(server.uri(), "test-token".to_string(), "secret".to_string()).unwrap();
        let resolved = resolver.resolve(&["ci/github#token".to_string()]).await.unwrap();
        assert_eq!(resolved.get("ci/github#token").map(String::as_str), Some("s3cr3t"));
    }

    #[tokio::test]
    async fn fetch_one_maps_server_error_to_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/ci/github"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let resolver =
            VaultSecretResolver::new(server.uri(), "test-token".to_string(), "secret".to_string()).unwrap();
        let err = resolver.resolve(&["ci/github#token".to_string()]).await.unwrap_err();
        assert!(matches!(err, AgentError::Transient(_)));
    }

    #[tokio::test]
    async fn fetch_one_maps_client_error_to_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/ci/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let resolver =
            VaultSecretResolver::new(server.uri(), "test-token".to_string(), "secret".to_string()).unwrap();
        let err = resolver.resolve(&["ci/missing#token".to_string()]).await.unwrap_err();
        assert!(matches!(err, AgentError::Permanent(_)));
    }
}
