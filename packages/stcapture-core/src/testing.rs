//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{TransportError, TransportErrorKind};
use crate::sink::LogSink;
use crate::transport::{BasicAuth, HttpResponse, Transport};

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Http(HttpResponse),
    Fail(TransportError),
}

pub(crate) fn ok(status: u16, body: &str) -> Reply {
    Reply::Http(HttpResponse::new(status, body))
}

pub(crate) fn fail(kind: TransportErrorKind) -> Reply {
    Reply::Fail(TransportError::new(kind, "scripted failure"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Call {
    pub method: &'static str,
    pub url: String,
    pub bearer: Option<String>,
    pub body: String,
}

struct Rule {
    method: &'static str,
    url_fragment: String,
    reply: Reply,
    delay: Duration,
}

/// Transport answering from a list of one-shot rules.
///
/// Each call consumes the first unused rule whose method matches and whose
/// URL fragment occurs in the request URL. A call with no matching rule fails
/// with a `Request` error. Successful downloads write `b"image-bytes"`.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Call>>,
    presigned_marker: Option<String>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// URLs containing `marker` are reported as pre-signed.
    pub fn with_presigned_marker(mut self, marker: &str) -> Self {
        self.presigned_marker = Some(marker.to_string());
        self
    }

    pub fn on(&self, method: &'static str, url_fragment: &str, reply: Reply) -> &Self {
        self.on_delayed(method, url_fragment, reply, Duration::ZERO)
    }

    /// Like [`on`](Self::on) but the reply arrives after `delay`.
    pub fn on_delayed(
        &self,
        method: &'static str,
        url_fragment: &str,
        reply: Reply,
        delay: Duration,
    ) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            method,
            url_fragment: url_fragment.to_string(),
            reply,
            delay,
        });
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str, url_fragment: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.method == method && c.url.contains(url_fragment))
            .count()
    }

    async fn answer(
        &self,
        method: &'static str,
        url: &str,
        bearer: Option<&str>,
        body: String,
    ) -> Result<HttpResponse, TransportError> {
        self.calls.lock().unwrap().push(Call {
            method,
            url: url.to_string(),
            bearer: bearer.map(str::to_string),
            body,
        });

        let rule = {
            let mut rules = self.rules.lock().unwrap();
            let index = rules
                .iter()
                .position(|r| r.method == method && url.contains(&r.url_fragment));
            index.map(|i| rules.remove(i))
        };
        let Some(rule) = rule else {
            return Err(TransportError::new(
                TransportErrorKind::Request,
                format!("unexpected {} {}", method, url),
            ));
        };

        if !rule.delay.is_zero() {
            tokio::time::sleep(rule.delay).await;
        }
        match rule.reply {
            Reply::Http(resp) => Ok(resp),
            Reply::Fail(err) => Err(err),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, url: &str, bearer: &str) -> Result<HttpResponse, TransportError> {
        self.answer("GET", url, Some(bearer), String::new()).await
    }

    async fn post_json(
        &self,
        url: &str,
        bearer: &str,
        body: &serde_json::Value,
    ) -> Result<HttpResponse, TransportError> {
        self.answer("POST", url, Some(bearer), body.to_string()).await
    }

    async fn post_form(
        &self,
        url: &str,
        basic: Option<&BasicAuth>,
        form: &[(&str, &str)],
    ) -> Result<HttpResponse, TransportError> {
        let body = form
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let auth = basic.map(|b| b.username.as_str());
        self.answer("FORM", url, auth, body).await
    }

    async fn download(
        &self,
        url: &str,
        bearer: Option<&str>,
        dest: &Path,
    ) -> Result<(), TransportError> {
        let bearer = if self.is_presigned(url) { None } else { bearer };
        let resp = self
            .answer("DOWNLOAD", url, bearer, String::new())
            .await?;
        if !resp.is_success() {
            return Err(TransportError::new(
                TransportErrorKind::Status(resp.status),
                resp.body,
            ));
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TransportError::new(TransportErrorKind::Io, e.to_string()))?;
        }
        std::fs::write(dest, b"image-bytes")
            .map_err(|e| TransportError::new(TransportErrorKind::Io, e.to_string()))
    }

    fn is_presigned(&self, url: &str) -> bool {
        self.presigned_marker
            .as_deref()
            .is_some_and(|m| url.contains(m))
    }
}

/// Sink that remembers every line.
#[derive(Default, Clone)]
pub(crate) struct RecordingSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl RecordingSink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

impl LogSink for RecordingSink {
    fn append_log(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}
