//! `BlobStore`: uploads a run's artifacts to the control plane's external
//! artifact object store over HTTP. The sha256 digest is computed while
//! the file is streamed so a large artifact is never buffered twice.

use std::path::Path;

use async_trait::async_trait;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::domain::error::{AgentError, AgentResult};
use crate::domain::models::ArtifactMetadata;
use crate::domain::ports::BlobStore;

const STREAM_CHUNK_BYTES: usize = 64 * 1024;

/// PUTs artifact bytes to `{base_url}/artifacts/{run_id}/{key}`, authenticated
/// with the same bearer token used for the control-plane session.
pub struct HttpBlobStore {
    http: Client,
    base_url: String,
    token: String,
    run_id: String,
}

impl HttpBlobStore {
    #[must_use]
    pub fn new(http: Client, base_url: String, token: String, run_id: String) -> Self {
        Self { http, base_url, token, run_id }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(&self, key: &str, path: &Path) -> AgentResult<ArtifactMetadata> {
        let (bytes, sha256) = read_and_hash(path).await?;
        let size_bytes = bytes.len() as u64;
        let content_type = guess_content_type(path);

        let url = format!(
            "{}/artifacts/{}/{key}",
            self.base_url.trim_end_matches('/'),
            self.run_id
        );

        let response = self
            .http
            .put(&url)
            .bearer_auth(&self.token)
            .header("content-type", &content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| AgentError::InternalWarning(format!("artifact upload failed for {key}: {e}")))?;

        if !response.status().is_success() {
            return Err(AgentError::InternalWarning(format!(
                "artifact upload for {key} returned {}",
                response.status()
            )));
        }

        Ok(ArtifactMetadata {
            name: key.to_string(),
            path: path.display().to_string(),
            size_bytes,
            content_type,
            sha256,
        })
    }
}

async fn read_and_hash(path: &Path) -> AgentResult<(Vec<u8>, String)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; STREAM_CHUNK_BYTES];
    let mut contents = Vec::new();

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        contents.extend_from_slice(&buffer[..read]);
    }

    Ok((contents, format!("{:x}", hasher.finalize())))
}

fn guess_content_type(path: &Path) -> String {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("txt" | "log") => "text/plain",
        Some("html") => "text/html",
        _ => "application/octet-stream",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn hashes_and_reads_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();

        let (bytes, sha256) = read_and_hash(file.path()).await.unwrap();
        assert_eq!(bytes, b"hello world");
        assert_eq!(sha256, "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
    }

    #[test]
    fn guesses_content_type_from_extension() {
        assert_eq!(guess_content_type(Path::new("report.json")), "application/json");
        assert_eq!(guess_content_type(Path::new("a.bin")), "application/octet-stream");
    }

    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn put_uploads_bytes_and_returns_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/artifacts/run-1/report.json"))
            .and(header("authorization", "Bearer test-token"))
            .and(body_bytes(b"{}".to_vec()))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(b"{}").unwrap();

        let store = HttpBlobStore::new(
            Client::new(),
            server.uri(),
            "test-token".to_string(),
            "run-1".to_string(),
        );
        let metadata = store.put("report.json", file.path()).await.unwrap();
        assert_eq!(metadata.name, "report.json");
        assert_eq!(metadata.content_type, "application/json");
        assert_eq!(metadata.size_bytes, 2);
    }

    #[tokio::test]
    async fn put_reports_internal_warning_on_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/artifacts/run-1/report.json"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"data").unwrap();

        let store = HttpBlobStore::new(
            Client::new(),
            server.uri(),
            "test-token".to_string(),
            "run-1".to_string(),
        );
        let err = store.put("report.json", file.path()).await.unwrap_err();
        assert!(matches!(err, AgentError::InternalWarning(_)));
    }
}
