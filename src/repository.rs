use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::marcxml::XmlSink;

const UPLOAD_PATH: &str = "batchuploader/robotupload/insertorreplace";
const MARCXML_CONTENT_TYPE: &str = "application/marcxml+xml";

/// HTTP client for the record repository's batch upload endpoint.
#[derive(Clone)]
pub struct RepositoryClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for RepositoryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl RepositoryClient {
    pub fn new(mut base_url: Url, token: String, timeout: Duration) -> Result<Self> {
        // `join` replaces the last segment unless the base path ends with a slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .user_agent(concat!("livesync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(cfg.repository.url.trim())
            .with_context(|| format!("invalid repository url {}", cfg.repository.url))?;
        Self::new(
            base_url,
            cfg.repository.token.clone(),
            cfg.repository_timeout(),
        )
    }

    pub fn build_request(&self, xml: &str) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(UPLOAD_PATH)
            .context("invalid repository base URL")?;
        let mut req = self
            .http
            .post(endpoint)
            .header("Content-Type", MARCXML_CONTENT_TYPE)
            .body(xml.to_string());
        if !self.token.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.token));
        }
        req.build().context("failed to build repository request")
    }

    pub async fn upload(&self, xml: &str) -> Result<()> {
        let request = self.build_request(xml)?;
        info!(url = %request.url(), bytes = xml.len(), "uploading MARCXML");

        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach record repository")?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!(%body, "rate limited by record repository");
            return Err(anyhow!("received 429 from repository: {}", body));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, %body, "repository upload failed");
            return Err(anyhow!("repository error {}: {}", status, body));
        }
        let body = res
            .text()
            .await
            .context("failed to read repository response")?;
        check_response_body(&body)?;
        info!(%status, "repository accepted upload");
        Ok(())
    }
}

/// The upload endpoint answers 200 with an `[ERROR]` line when it rejects a
/// document.
fn check_response_body(body: &str) -> Result<()> {
    let body = body.trim_start();
    if body.starts_with("[ERROR]") {
        return Err(anyhow!("repository rejected upload: {}", body.trim_end()));
    }
    Ok(())
}

#[async_trait]
impl XmlSink for RepositoryClient {
    async fn upload_xml(&self, xml: &str) -> Result<()> {
        self.upload(xml).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(token: &str) -> RepositoryClient {
        RepositoryClient::new(
            Url::parse("https://records.example.org/").unwrap(),
            token.to_string(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn request_targets_upload_endpoint() {
        let req = client("secret").build_request("<collection/>").unwrap();
        assert_eq!(req.method(), reqwest::Method::POST);
        assert_eq!(
            req.url().as_str(),
            "https://records.example.org/batchuploader/robotupload/insertorreplace"
        );
        assert_eq!(
            req.headers().get("Content-Type").unwrap(),
            "application/marcxml+xml"
        );
        assert_eq!(req.headers().get("Authorization").unwrap(), "Bearer secret");
        let body = req.body().and_then(|b| b.as_bytes()).unwrap();
        assert_eq!(body, b"<collection/>");
    }

    #[test]
    fn base_path_is_kept() {
        let client = RepositoryClient::new(
            Url::parse("https://records.example.org/invenio").unwrap(),
            String::new(),
            Duration::from_secs(5),
        )
        .unwrap();
        let req = client.build_request("<collection/>").unwrap();
        assert_eq!(
            req.url().as_str(),
            "https://records.example.org/invenio/batchuploader/robotupload/insertorreplace"
        );
    }

    #[test]
    fn no_auth_header_without_token() {
        let req = client("").build_request("<collection/>").unwrap();
        assert!(req.headers().get("Authorization").is_none());
    }

    #[test]
    fn error_body_is_rejected() {
        assert!(check_response_body("[INFO] ok").is_ok());
        assert!(check_response_body("").is_ok());
        let err = check_response_body("\n[ERROR] bad marc\n").unwrap_err();
        assert!(err.to_string().contains("bad marc"));
    }

    #[test]
    fn debug_hides_token() {
        let out = format!("{:?}", client("secret"));
        assert!(!out.contains("secret"));
    }

    /// Serve one canned HTTP response on a local port and return the base URL.
    fn serve_once(response: &'static str) -> Url {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            // Consume the whole request before answering.
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf);
                if let Some(end) = text.find("\r\n\r\n") {
                    let content_length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + content_length {
                        break;
                    }
                }
            }
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();
        });
        Url::parse(&format!("http://{}/", addr)).unwrap()
    }

    fn local_client(base: Url) -> RepositoryClient {
        RepositoryClient::new(base, "secret".into(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn upload_accepts_info_body() {
        let base = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 9\r\nConnection: close\r\n\r\n[INFO] ok");
        local_client(base).upload("<collection/>").await.unwrap();
    }

    #[tokio::test]
    async fn upload_fails_on_truncated_body() {
        let base = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 200\r\nConnection: close\r\n\r\n[ERR");
        let err = local_client(base).upload("<collection/>").await.unwrap_err();
        assert!(err.to_string().contains("failed to read repository response"));
    }

    #[tokio::test]
    async fn upload_fails_on_server_error() {
        let base = serve_once(
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\nConnection: close\r\n\r\noops",
        );
        let err = local_client(base).upload("<collection/>").await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("500"));
        assert!(msg.contains("oops"));
    }

    #[tokio::test]
    async fn upload_fails_on_rejected_document() {
        let base = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 17\r\nConnection: close\r\n\r\n[ERROR] bad marc\n",
        );
        let err = local_client(base).upload("<collection/>").await.unwrap_err();
        assert!(err.to_string().contains("bad marc"));
    }
}
