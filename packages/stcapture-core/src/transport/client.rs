use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use super::{is_presigned_url, BasicAuth, HttpResponse, Transport};
use crate::config::TransportSettings;
use crate::error::{TransportError, TransportErrorKind};

const MAX_REDIRECTS: usize = 10;

/// Settings for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Total timeout for `get`, `post_json` and `post_form`
    pub timeout: Duration,
    /// Total timeout for `download`
    pub download_timeout: Duration,
    pub user_agent: String,
    /// Accept any certificate. Off unless explicitly configured.
    pub insecure_skip_tls_verify: bool,
    pub presigned_markers: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportSettings::default().to_transport_config()
    }
}

/// [`Transport`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// Follows redirects; used for GET and downloads
    client: reqwest::Client,
    /// Never follows redirects; used for POSTs
    post_client: reqwest::Client,
    config: TransportConfig,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        if config.insecure_skip_tls_verify {
            tracing::warn!("TLS certificate verification is DISABLED for all requests");
        }

        let client = Self::builder(&config)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(classify)?;
        let post_client = Self::builder(&config)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(classify)?;

        Ok(Self {
            client,
            post_client,
            config,
        })
    }

    fn builder(config: &TransportConfig) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify)
    }

    /// Stream the response body into `partial`, returning the number of bytes written.
    async fn fetch_into(
        &self,
        request: reqwest::RequestBuilder,
        partial: &Path,
    ) -> Result<u64, TransportError> {
        let mut resp = request.send().await.map_err(classify)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::new(
                TransportErrorKind::Status(status.as_u16()),
                format!("download answered {}", status),
            ));
        }

        if let Some(parent) = partial.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        let mut file = tokio::fs::File::create(partial)
            .await
            .map_err(|e| io_error(partial, e))?;
        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await.map_err(classify)? {
            file.write_all(&chunk)
                .await
                .map_err(|e| io_error(partial, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| io_error(partial, e))?;
        file.sync_all().await.map_err(|e| io_error(partial, e))?;

        Ok(written)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str, bearer: &str) -> Result<HttpResponse, TransportError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(classify)?;
        read_response(resp).await
    }

    async fn post_json(
        &self,
        url: &str,
        bearer: &str,
        body: &serde_json::Value,
    ) -> Result<HttpResponse, TransportError> {
        let resp = self
            .post_client
            .post(url)
            .bearer_auth(bearer)
            .json(body)
            .send()
            .await
            .map_err(classify)?;
        read_response(resp).await
    }

    async fn post_form(
        &self,
        url: &str,
        basic: Option<&BasicAuth>,
        form: &[(&str, &str)],
    ) -> Result<HttpResponse, TransportError> {
        let mut request = self.post_client.post(url).form(form);
        if let Some(auth) = basic {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }
        let resp = request.send().await.map_err(classify)?;
        read_response(resp).await
    }

    async fn download(
        &self,
        url: &str,
        bearer: Option<&str>,
        dest: &Path,
    ) -> Result<(), TransportError> {
        let mut request = self.client.get(url).timeout(self.config.download_timeout);
        match bearer {
            Some(_) if self.is_presigned(url) => {
                tracing::debug!("Pre-signed media URL, sending no Authorization header");
            }
            Some(token) => request = request.bearer_auth(token),
            None => {}
        }

        let partial = partial_path(dest)?;
        let outcome = match self.fetch_into(request, &partial).await {
            Ok(written) => tokio::fs::rename(&partial, dest)
                .await
                .map(|_| written)
                .map_err(|e| io_error(dest, e)),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(written) => {
                tracing::debug!("Downloaded {} bytes to {:?}", written, dest);
                Ok(())
            }
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(&partial).await {
                    if remove_err.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(
                            "Failed to remove partial download {:?}: {}",
                            partial,
                            remove_err
                        );
                    }
                }
                Err(e)
            }
        }
    }

    fn is_presigned(&self, url: &str) -> bool {
        is_presigned_url(url, &self.config.presigned_markers)
    }
}

async fn read_response(resp: reqwest::Response) -> Result<HttpResponse, TransportError> {
    let status = resp.status().as_u16();
    let body = resp.text().await.map_err(classify)?;
    Ok(HttpResponse { status, body })
}

/// `<dest>.part` next to the final file.
fn partial_path(dest: &Path) -> Result<PathBuf, TransportError> {
    let name = dest.file_name().ok_or_else(|| {
        TransportError::new(
            TransportErrorKind::Io,
            format!("download destination {:?} has no file name", dest),
        )
    })?;
    let mut partial = name.to_os_string();
    partial.push(".part");
    Ok(dest.with_file_name(partial))
}

fn io_error(path: &Path, err: std::io::Error) -> TransportError {
    TransportError::new(TransportErrorKind::Io, format!("{}: {}", path.display(), err))
}

/// Map a reqwest error onto a [`TransportErrorKind`]. The URL is stripped
/// from the message since pre-signed URLs carry credentials.
fn classify(err: reqwest::Error) -> TransportError {
    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if is_tls_failure(&err) {
        TransportErrorKind::Tls
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else if let Some(status) = err.status() {
        TransportErrorKind::Status(status.as_u16())
    } else {
        TransportErrorKind::Request
    };
    TransportError::new(kind, err.without_url().to_string())
}

fn is_tls_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        let message = e.to_string().to_ascii_lowercase();
        if message.contains("certificate") || message.contains("tls") || message.contains("ssl") {
            return true;
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn transport() -> HttpTransport {
        HttpTransport::new(TransportConfig {
            timeout: Duration::from_secs(5),
            download_timeout: Duration::from_secs(5),
            user_agent: "stcapture-test/1.0".into(),
            insecure_skip_tls_verify: false,
            presigned_markers: vec!["x-amz-signature".into(), "token".into()],
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_returns_non_success_as_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/devices"))
            .and(header("authorization", "Bearer abc"))
            .and(header("user-agent", "stcapture-test/1.0"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .expect(1)
            .mount(&server)
            .await;

        let resp = transport()
            .get(&format!("{}/v1/devices", server.uri()), "abc")
            .await
            .unwrap();
        assert_eq!(resp.status, 401);
        assert_eq!(resp.body, "unauthorized");
    }

    #[tokio::test]
    async fn test_post_json_sends_body_and_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/devices/cam/commands"))
            .and(header("authorization", "Bearer tok"))
            .and(header("content-type", "application/json"))
            .and(body_string_contains("\"capability\":\"refresh\""))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let body = serde_json::json!({"commands": [{"capability": "refresh"}]});
        let resp = transport()
            .post_json(&format!("{}/v1/devices/cam/commands", server.uri()), "tok", &body)
            .await
            .unwrap();
        assert!(resp.is_success());
    }

    #[tokio::test]
    async fn test_post_form_with_basic_auth() {
        let server = MockServer::start().await;
        // base64("id:secret")
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(header("authorization", "Basic aWQ6c2VjcmV0"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=r%2B1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"access_token":"a"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let basic = BasicAuth {
            username: "id".into(),
            password: "secret".into(),
        };
        let resp = transport()
            .post_form(
                &format!("{}/oauth/token", server.uri()),
                Some(&basic),
                &[("grant_type", "refresh_token"), ("refresh_token", "r+1")],
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
    }

    #[tokio::test]
    async fn test_post_does_not_follow_redirects() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/elsewhere"))
            .mount(&server)
            .await;

        let resp = transport()
            .post_form(&format!("{}/oauth/token", server.uri()), None, &[])
            .await
            .unwrap();
        assert_eq!(resp.status, 302);
    }

    #[tokio::test]
    async fn test_download_sends_bearer_for_plain_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/a.jpg"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg-bytes".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("shots").join("a.jpg");
        transport()
            .download(&format!("{}/media/a.jpg", server.uri()), Some("tok"), &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"jpeg-bytes");
        assert!(!dir.path().join("shots").join("a.jpg.part").exists());
    }

    #[tokio::test]
    async fn test_download_presigned_omits_authorization() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bucket/a.jpg"))
            .and(|req: &Request| !req.headers.contains_key("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"signed".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.jpg");
        transport()
            .download(
                &format!("{}/bucket/a.jpg?X-Amz-Signature=abc", server.uri()),
                Some("tok"),
                &dest,
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"signed");
    }

    #[tokio::test]
    async fn test_download_follows_redirects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/moved.jpg"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", format!("{}/media/real.jpg", server.uri())),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/media/real.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"real".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("moved.jpg");
        transport()
            .download(&format!("{}/media/moved.jpg", server.uri()), None, &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"real");
    }

    #[tokio::test]
    async fn test_failed_download_leaves_destination_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/a.jpg"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.jpg");
        std::fs::write(&dest, b"previous").unwrap();

        let err = transport()
            .download(&format!("{}/media/a.jpg", server.uri()), Some("tok"), &dest)
            .await
            .unwrap_err();

        assert_eq!(err.kind, TransportErrorKind::Status(500));
        assert_eq!(std::fs::read(&dest).unwrap(), b"previous");
        assert!(!dir.path().join("a.jpg.part").exists());
    }

    #[tokio::test]
    async fn test_truncated_body_removes_partial_file() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\nContent-Type: image/jpeg\r\n\r\nonly-a-few-bytes",
                )
                .await
                .unwrap();
            socket.flush().await.unwrap();
            // closing here cuts the body short
        });

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.jpg");
        std::fs::write(&dest, b"previous").unwrap();

        let err = transport()
            .download(&format!("http://{}/media/a.jpg", addr), Some("tok"), &dest)
            .await
            .unwrap_err();

        assert_ne!(err.kind, TransportErrorKind::Io);
        assert_eq!(std::fs::read(&dest).unwrap(), b"previous");
        assert!(!dir.path().join("a.jpg.part").exists());
    }

    #[tokio::test]
    async fn test_connection_refused_is_connect_error() {
        // bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = transport()
            .get(&format!("http://127.0.0.1:{}/v1/devices", port), "tok")
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Connect);
    }

    #[tokio::test]
    async fn test_timeout_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(TransportConfig {
            timeout: Duration::from_millis(200),
            ..TransportConfig::default()
        })
        .unwrap();
        let err = transport
            .get(&format!("{}/slow", server.uri()), "tok")
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Timeout);
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/tmp/capture.jpg")).unwrap(),
            PathBuf::from("/tmp/capture.jpg.part")
        );
        assert!(partial_path(Path::new("/")).is_err());
    }
}
