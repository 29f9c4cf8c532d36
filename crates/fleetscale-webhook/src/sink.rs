//! Transports for one request/response exchange.
//!
//! ```text
//! HttpSink      POST request JSON ─▶ response JSON (one round trip)
//! MailboxSink   write request ─▶ poll until a response with the same uid
//!                 ├─ FileMailbox      one JSON record on disk
//!                 └─ InMemoryMailbox  shared in-process record
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{WebhookError, WebhookResult};
use crate::types::{WebhookRequest, WebhookResponse};

#[async_trait]
pub trait DecisionSink: Send + Sync {
    fn name(&self) -> &str;

    async fn exchange(&self, request: &WebhookRequest) -> WebhookResult<WebhookResponse>;
}

// ── HTTP ──────────────────────────────────────────────────────────

pub struct HttpSink {
    uri: http::Uri,
    authority: String,
    timeout: Duration,
}

impl HttpSink {
    /// Create a sink posting to `url`. Only `http://` URLs are accepted.
    pub fn new(url: &str, timeout: Duration) -> WebhookResult<Self> {
        let uri: http::Uri = url
            .parse()
            .map_err(|e| WebhookError::Config(format!("invalid webhook url {url}: {e}")))?;
        if uri.scheme_str() != Some("http") {
            return Err(WebhookError::Config(format!("webhook url {url} must use http")));
        }
        let authority = match uri.authority() {
            Some(a) if a.port_u16().is_some() => a.to_string(),
            Some(a) => format!("{}:80", a.host()),
            None => return Err(WebhookError::Config(format!("webhook url {url} has no host"))),
        };
        Ok(Self {
            uri,
            authority,
            timeout,
        })
    }

    async fn round_trip(&self, body: Vec<u8>) -> WebhookResult<Bytes> {
        let stream = tokio::net::TcpStream::connect(&self.authority)
            .await
            .map_err(|e| WebhookError::Transport(format!("connect {}: {e}", self.authority)))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| WebhookError::Transport(format!("handshake: {e}")))?;

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let host = self.uri.host().unwrap_or_default().to_string();
        let req = http::Request::builder()
            .method("POST")
            .uri(self.uri.clone())
            .header("host", host)
            .header("content-type", "application/json")
            .header("user-agent", "fleetscale-webhook/0.1")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| WebhookError::Transport(format!("build request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| WebhookError::Transport(format!("send: {e}")))?;
        if !resp.status().is_success() {
            return Err(WebhookError::Status(resp.status().as_u16()));
        }
        let collected = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| WebhookError::Transport(format!("read body: {e}")))?;
        Ok(collected.to_bytes())
    }
}

#[async_trait]
impl DecisionSink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn exchange(&self, request: &WebhookRequest) -> WebhookResult<WebhookResponse> {
        let body = serde_json::to_vec(request).map_err(|e| WebhookError::Decode(e.to_string()))?;
        let bytes = tokio::time::timeout(self.timeout, self.round_trip(body))
            .await
            .map_err(|_| WebhookError::Timeout(self.timeout))??;
        debug!(uri = %self.uri, bytes = bytes.len(), "webhook responded");
        serde_json::from_slice(&bytes).map_err(|e| WebhookError::Decode(e.to_string()))
    }
}

// ── Mailbox ───────────────────────────────────────────────────────

/// The shared record both sides read and write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxRecord {
    #[serde(default)]
    pub request: Option<WebhookRequest>,
    #[serde(default)]
    pub response: Option<WebhookResponse>,
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Publish a request, leaving any response in place.
    async fn post_request(&self, request: &WebhookRequest) -> WebhookResult<()>;

    async fn read_response(&self) -> WebhookResult<Option<WebhookResponse>>;
}

pub struct MailboxSink {
    mailbox: Arc<dyn Mailbox>,
    timeout: Duration,
    poll_interval: Duration,
}

impl MailboxSink {
    /// Create a sink that waits up to `timeout` for a matching response.
    pub fn new(mailbox: Arc<dyn Mailbox>, timeout: Duration) -> Self {
        Self {
            mailbox,
            timeout,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// How often the mailbox is read while waiting.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl DecisionSink for MailboxSink {
    fn name(&self) -> &str {
        "mailbox"
    }

    async fn exchange(&self, request: &WebhookRequest) -> WebhookResult<WebhookResponse> {
        self.mailbox.post_request(request).await?;
        let deadline = Instant::now() + self.timeout;

        loop {
            match self.mailbox.read_response().await? {
                Some(resp) if resp.uid == request.uid => return Ok(resp),
                Some(stale) => debug!(uid = %stale.uid, "ignoring stale mailbox response"),
                None => {}
            }
            if Instant::now() + self.poll_interval > deadline {
                return Err(WebhookError::Timeout(self.timeout));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// A mailbox backed by one JSON file, replaced atomically on write.
pub struct FileMailbox {
    path: PathBuf,
}

impl FileMailbox {
    /// A mailbox stored as JSON at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Where the record is stored.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record; a missing file reads as empty.
    pub async fn read(&self) -> WebhookResult<MailboxRecord> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) if raw.is_empty() => Ok(MailboxRecord::default()),
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| WebhookError::Decode(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MailboxRecord::default()),
            Err(e) => Err(WebhookError::Mailbox(format!("read {}: {e}", self.path.display()))),
        }
    }

    /// Replace the record atomically.
    pub async fn write(&self, record: &MailboxRecord) -> WebhookResult<()> {
        let raw = serde_json::to_vec_pretty(record).map_err(|e| WebhookError::Decode(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(|e| WebhookError::Mailbox(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| WebhookError::Mailbox(format!("rename to {}: {e}", self.path.display())))
    }
}

#[async_trait]
impl Mailbox for FileMailbox {
    async fn post_request(&self, request: &WebhookRequest) -> WebhookResult<()> {
        let mut record = self.read().await?;
        record.request = Some(request.clone());
        self.write(&record).await
    }

    async fn read_response(&self) -> WebhookResult<Option<WebhookResponse>> {
        Ok(self.read().await?.response)
    }
}

/// In-process mailbox for tests and simulation.
#[derive(Debug, Default)]
pub struct InMemoryMailbox {
    record: Mutex<MailboxRecord>,
}

impl InMemoryMailbox {
    /// An empty mailbox.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self) -> MutexGuard<'_, MailboxRecord> {
        self.record.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The last posted request.
    pub fn request(&self) -> Option<WebhookRequest> {
        self.record().request.clone()
    }

    /// Store `response` for the next read.
    pub fn respond(&self, response: WebhookResponse) {
        self.record().response = Some(response);
    }
}

#[async_trait]
impl Mailbox for InMemoryMailbox {
    async fn post_request(&self, request: &WebhookRequest) -> WebhookResult<()> {
        self.record().request = Some(request.clone());
        Ok(())
    }

    async fn read_response(&self) -> WebhookResult<Option<WebhookResponse>> {
        Ok(self.record().response.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    use crate::types::ScaleUpPolicy;

    fn request() -> WebhookRequest {
        WebhookRequest::new(BTreeMap::new())
    }

    fn answer(uid: &str) -> WebhookResponse {
        WebhookResponse {
            uid: uid.to_string(),
            scale_ups: vec![ScaleUpPolicy {
                node_group_id: "ng1".into(),
                desired_size: 3,
            }],
            scale_downs: Vec::new(),
        }
    }

    /// Serve one connection, echoing the request uid back, or answering
    /// with `status` when it is not 200.
    async fn serve_once(status: u16) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let svc = service_fn(move |req: Request<Incoming>| async move {
                let body = req.into_body().collect().await.unwrap().to_bytes();
                let parsed: WebhookRequest = serde_json::from_slice(&body).unwrap();
                let out = serde_json::to_vec(&answer(&parsed.uid)).unwrap();
                Ok::<_, hyper::Error>(
                    Response::builder()
                        .status(status)
                        .body(Full::new(Bytes::from(out)))
                        .unwrap(),
                )
            });
            let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), svc).await;
        });
        format!("http://{addr}/decide")
    }

    #[tokio::test]
    async fn http_round_trip() {
        let url = serve_once(200).await;
        let sink = HttpSink::new(&url, Duration::from_secs(5)).unwrap();
        let req = request();
        let resp = sink.exchange(&req).await.unwrap();
        assert_eq!(resp.uid, req.uid);
        assert_eq!(resp.scale_ups[0].desired_size, 3);
    }

    #[tokio::test]
    async fn http_error_status_is_reported() {
        let url = serve_once(503).await;
        let sink = HttpSink::new(&url, Duration::from_secs(5)).unwrap();
        let err = sink.exchange(&request()).await.unwrap_err();
        assert!(matches!(err, WebhookError::Status(503)));
    }

    #[tokio::test]
    async fn http_connection_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let sink = HttpSink::new(&format!("http://{addr}/"), Duration::from_secs(5)).unwrap();
        assert!(matches!(
            sink.exchange(&request()).await.unwrap_err(),
            WebhookError::Transport(_)
        ));
    }

    #[test]
    fn https_urls_are_rejected() {
        assert!(matches!(
            HttpSink::new("https://example.com/", Duration::from_secs(1)),
            Err(WebhookError::Config(_))
        ));
    }

    #[tokio::test]
    async fn mailbox_waits_for_matching_uid() {
        let mailbox = Arc::new(InMemoryMailbox::new());
        mailbox.respond(answer("stale"));
        let sink = MailboxSink::new(mailbox.clone(), Duration::from_secs(2)).with_poll_interval(Duration::from_millis(5));

        let responder = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move {
                loop {
                    if let Some(req) = mailbox.request() {
                        mailbox.respond(answer(&req.uid));
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
        };

        let req = request();
        let resp = sink.exchange(&req).await.unwrap();
        assert_eq!(resp.uid, req.uid);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn mailbox_times_out_without_answer() {
        let mailbox = Arc::new(InMemoryMailbox::new());
        let sink = MailboxSink::new(mailbox, Duration::from_millis(30)).with_poll_interval(Duration::from_millis(5));
        assert!(matches!(
            sink.exchange(&request()).await.unwrap_err(),
            WebhookError::Timeout(_)
        ));
    }

    #[tokio::test]
    async fn file_mailbox_keeps_both_halves() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = FileMailbox::new(dir.path().join("mailbox.json"));
        assert_eq!(mailbox.read().await.unwrap(), MailboxRecord::default());

        mailbox
            .write(&MailboxRecord {
                request: None,
                response: Some(answer("old")),
            })
            .await
            .unwrap();
        let req = request();
        mailbox.post_request(&req).await.unwrap();

        let record = mailbox.read().await.unwrap();
        assert_eq!(record.request.unwrap().uid, req.uid);
        assert_eq!(mailbox.read_response().await.unwrap().unwrap().uid, "old");
    }
}
