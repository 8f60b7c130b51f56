//! Legacy HTTP+SSE transport.
//!
//! `connect` opens a GET subscription and waits for the server to announce
//! where requests should be posted. Every reply then arrives on the
//! subscription as a `message` event and is matched up by the correlator.

use super::event_stream::{is_event_stream_content_type, SseEvent, SseEventDecoder};
use super::{
    apply_json_post_headers, content_type_of, ensure_success, route_messages, McpTransport,
    ServerHeaders, MCP_EVENT_STREAM_ACCEPT,
};
use crate::mcp::correlator::ResponseCorrelator;
use crate::mcp::error::McpError;
use crate::mcp::jsonrpc::{parse_server_messages, reply_id};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Url;
use rust_mcp_schema::schema_utils::{ClientMessage, ServerMessage};
use rust_mcp_schema::RequestId;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ENDPOINT_EVENT: &str = "endpoint";
const MESSAGE_EVENT: &str = "message";

type EndpointSender = oneshot::Sender<Result<Url, McpError>>;

#[derive(Default)]
struct SseState {
    message_url: Option<Url>,
    reader: Option<JoinHandle<()>>,
}

pub struct SseTransport {
    server_id: String,
    base_url: Url,
    client: reqwest::Client,
    headers: ServerHeaders,
    handshake_timeout: Duration,
    correlator: ResponseCorrelator,
    cancel: CancellationToken,
    state: Mutex<SseState>,
}

impl SseTransport {
    pub fn new(
        server_id: String,
        base_url: Url,
        client: reqwest::Client,
        headers: ServerHeaders,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            server_id,
            base_url,
            client,
            headers,
            handshake_timeout,
            correlator: ResponseCorrelator::new(),
            cancel: CancellationToken::new(),
            state: Mutex::new(SseState::default()),
        }
    }

    /// The URL announced by the server's `endpoint` event.
    pub fn message_url(&self) -> Option<Url> {
        self.state().message_url.clone()
    }

    fn state(&self) -> MutexGuard<'_, SseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn open_subscription(&self) -> Result<Url, McpError> {
        let request = self.headers.apply(
            self.client
                .get(self.base_url.clone())
                .header(reqwest::header::ACCEPT, MCP_EVENT_STREAM_ACCEPT),
        );
        let response = request.send().await?;
        ensure_success(&response)?;
        if !is_event_stream_content_type(&content_type_of(&response)) {
            return Err(McpError::Decode(
                "subscription did not return an event stream".to_string(),
            ));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = SubscriptionReader {
            server_id: self.server_id.clone(),
            base_url: self.base_url.clone(),
            correlator: self.correlator.clone(),
            cancel: self.cancel.clone(),
            endpoint: Some(endpoint_tx),
        };
        self.state().reader = Some(tokio::spawn(reader.run(response)));

        endpoint_rx.await.map_err(|_| {
            McpError::EndpointNotAnnounced("subscription reader stopped".to_string())
        })?
    }

    fn stop_reader(&self) {
        if let Some(reader) = self.state().reader.take() {
            reader.abort();
        }
    }

    /// POSTs to the announced URL. Servers normally answer `202 Accepted`;
    /// a JSON body carrying the reply to `id` is returned directly.
    async fn post(
        &self,
        url: Url,
        payload: String,
        id: Option<&RequestId>,
    ) -> Result<Option<ServerMessage>, McpError> {
        let request = self
            .headers
            .apply(apply_json_post_headers(self.client.post(url)));
        let response = request.body(payload).send().await?;
        ensure_success(&response)?;

        let Some(id) = id else {
            return Ok(None);
        };
        if !content_type_of(&response).contains("json") {
            return Ok(None);
        }
        let body = response.text().await?;
        let inline = parse_server_messages(&body)
            .ok()
            .into_iter()
            .flatten()
            .find(|message| reply_id(message) == Some(id));
        Ok(inline)
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn connect(&self) -> Result<(), McpError> {
        if self.state().message_url.is_some() {
            return Ok(());
        }

        let message_url =
            match tokio::time::timeout(self.handshake_timeout, self.open_subscription()).await {
                Ok(Ok(url)) => url,
                Ok(Err(err)) => {
                    self.stop_reader();
                    return Err(err);
                }
                Err(_) => {
                    self.stop_reader();
                    return Err(McpError::EndpointNotAnnounced(format!(
                        "no endpoint event within {}ms",
                        self.handshake_timeout.as_millis()
                    )));
                }
            };

        info!(server_id = %self.server_id, url = %message_url, "MCP SSE endpoint discovered");
        self.state().message_url = Some(message_url);
        Ok(())
    }

    async fn send_request(
        &self,
        id: RequestId,
        message: ClientMessage,
        timeout: Duration,
    ) -> Result<ServerMessage, McpError> {
        let url = self.message_url().ok_or(McpError::NotInitialized)?;
        let payload = serde_json::to_string(&message)?;
        debug!(
            server_id = %self.server_id,
            request_id = ?id,
            "Posting MCP SSE request"
        );

        let started = Instant::now();
        let waiter = self.correlator.register(id.clone());
        let inline = tokio::time::timeout(timeout, self.post(url, payload, Some(&id)))
            .await
            .map_err(|_| McpError::Timeout(timeout))??;
        if let Some(reply) = inline {
            return Ok(reply);
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        waiter.wait(remaining).await.map_err(|err| match err {
            McpError::Timeout(_) => McpError::Timeout(timeout),
            other => other,
        })
    }

    async fn send_notification(&self, message: ClientMessage) -> Result<(), McpError> {
        let url = self.message_url().ok_or(McpError::NotInitialized)?;
        let payload = serde_json::to_string(&message)?;
        self.post(url, payload, None).await.map(|_| ())
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.correlator.close("transport closed");
        self.stop_reader();
        self.state().message_url = None;
    }
}

/// Owns the subscription body for the life of the session.
struct SubscriptionReader {
    server_id: String,
    base_url: Url,
    correlator: ResponseCorrelator,
    cancel: CancellationToken,
    endpoint: Option<EndpointSender>,
}

impl SubscriptionReader {
    async fn run(mut self, response: reqwest::Response) {
        let mut stream = response.bytes_stream();
        let mut decoder = SseEventDecoder::default();

        let reason = loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => break "subscription cancelled".to_string(),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(chunk)) => {
                    for event in decoder.push(&chunk) {
                        self.handle(event);
                    }
                }
                Some(Err(err)) => break format!("subscription failed: {err}"),
                None => {
                    for event in decoder.finish() {
                        self.handle(event);
                    }
                    break "subscription ended".to_string();
                }
            }
        };

        debug!(server_id = %self.server_id, reason = %reason, "MCP SSE reader stopped");
        if let Some(endpoint) = self.endpoint.take() {
            let _ = endpoint.send(Err(McpError::EndpointNotAnnounced(reason.clone())));
        }
        self.correlator.close(&reason);
    }

    fn handle(&mut self, event: SseEvent) {
        if event.is(ENDPOINT_EVENT) {
            self.announce(&event.data);
        } else if event.is(MESSAGE_EVENT) {
            route_messages(&self.server_id, &event.data, &self.correlator);
        } else {
            debug!(server_id = %self.server_id, event = %event.event, "Ignoring MCP SSE event");
        }
    }

    fn announce(&mut self, data: &str) {
        let Some(endpoint) = self.endpoint.take() else {
            debug!(server_id = %self.server_id, "Ignoring repeated MCP endpoint event");
            return;
        };
        match self.base_url.join(data.trim()) {
            Ok(url) => {
                let _ = endpoint.send(Ok(url));
            }
            Err(err) => {
                warn!(server_id = %self.server_id, data, error = %err, "Dropping malformed MCP endpoint event");
                self.endpoint = Some(endpoint);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::jsonrpc::request_message;
    use crate::utils::test_utils::{rpc_result, sse_event, MockReply, MockServer};
    use rust_mcp_schema::schema_utils::RequestFromClient;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    type Shared<T> = Arc<Mutex<Option<T>>>;

    struct Subscription {
        tx: Shared<mpsc::UnboundedSender<String>>,
        rx: Shared<mpsc::UnboundedReceiver<String>>,
    }

    impl Subscription {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
                rx: Arc::new(Mutex::new(Some(rx))),
            }
        }

        fn send(tx: &Shared<mpsc::UnboundedSender<String>>, event: String) {
            if let Some(tx) = tx.lock().ok().and_then(|tx| tx.clone()) {
                let _ = tx.send(event);
            }
        }

        fn reply(rx: &Shared<mpsc::UnboundedReceiver<String>>) -> MockReply {
            match rx.lock().ok().and_then(|mut rx| rx.take()) {
                Some(rx) => MockReply::EventStream(rx),
                None => MockReply::Status(409),
            }
        }
    }

    fn transport_for(server: &MockServer, handshake: Duration) -> SseTransport {
        SseTransport::new(
            "legacy".to_string(),
            Url::parse(&server.url("/sse")).expect("url"),
            reqwest::Client::new(),
            ServerHeaders::default(),
            handshake,
        )
    }

    async fn list_tools(
        transport: &SseTransport,
        id: i64,
        timeout: Duration,
    ) -> Result<ServerMessage, McpError> {
        let message = request_message(
            RequestId::Integer(id),
            RequestFromClient::ListToolsRequest(None),
        )
        .expect("message");
        transport
            .send_request(RequestId::Integer(id), message, timeout)
            .await
    }

    fn accepted() -> MockReply {
        MockReply::Json {
            status: 202,
            headers: Vec::new(),
            body: "\"Accepted\"".to_string(),
        }
    }

    #[tokio::test]
    async fn discovers_relative_endpoint_and_routes_replies() {
        let subscription = Subscription::new();
        Subscription::send(
            &subscription.tx,
            sse_event("endpoint", "/messages?sessionId=abc"),
        );
        let (tx, rx) = (subscription.tx.clone(), subscription.rx.clone());

        let server = MockServer::start(move |request| {
            if request.method == "GET" {
                return Subscription::reply(&rx);
            }
            let id = request.rpc_id().unwrap_or_default();
            Subscription::send(&tx, sse_event("message", "not json"));
            Subscription::send(
                &tx,
                sse_event(
                    "message",
                    &rpc_result(id, json!({"tools": []})).to_string(),
                ),
            );
            accepted()
        })
        .await;

        let transport = transport_for(&server, Duration::from_secs(5));
        transport.connect().await.expect("handshake");
        assert_eq!(
            transport.message_url().map(|url| url.to_string()),
            Some(server.url("/messages?sessionId=abc"))
        );

        for id in 1..=2 {
            let reply = list_tools(&transport, id, Duration::from_secs(5))
                .await
                .expect("reply after a malformed event");
            assert_eq!(reply_id(&reply), Some(&RequestId::Integer(id)));
        }

        let posts: Vec<_> = server
            .requests()
            .into_iter()
            .filter(|request| request.method == "POST")
            .collect();
        assert_eq!(posts.len(), 2);
        assert!(posts
            .iter()
            .all(|request| request.path == "/messages?sessionId=abc"));
        transport.close().await;
    }

    #[tokio::test]
    async fn absolute_endpoint_is_used_verbatim() {
        let subscription = Subscription::new();
        Subscription::send(
            &subscription.tx,
            sse_event("endpoint", "http://127.0.0.1:1/elsewhere"),
        );
        let rx = subscription.rx.clone();
        let server = MockServer::start(move |_| Subscription::reply(&rx)).await;

        let transport = transport_for(&server, Duration::from_secs(5));
        transport.connect().await.expect("handshake");
        assert_eq!(
            transport.message_url().map(|url| url.to_string()),
            Some("http://127.0.0.1:1/elsewhere".to_string())
        );
        transport.close().await;
    }

    #[tokio::test]
    async fn missing_endpoint_event_fails_handshake() {
        let subscription = Subscription::new();
        Subscription::send(&subscription.tx, ": keep-alive\n\n".to_string());
        let rx = subscription.rx.clone();
        let server = MockServer::start(move |_| Subscription::reply(&rx)).await;

        let transport = transport_for(&server, Duration::from_millis(200));
        let err = transport.connect().await.expect_err("should fail");
        assert!(matches!(err, McpError::EndpointNotAnnounced(_)));
        assert!(transport.message_url().is_none());
    }

    #[tokio::test]
    async fn stream_closing_before_endpoint_fails_fast() {
        let server = MockServer::start(|_| {
            let (tx, rx) = mpsc::unbounded_channel::<String>();
            drop(tx);
            MockReply::EventStream(rx)
        })
        .await;

        let transport = transport_for(&server, Duration::from_secs(30));
        let started = Instant::now();
        let err = transport.connect().await.expect_err("should fail");
        assert!(matches!(err, McpError::EndpointNotAnnounced(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn request_before_connect_is_not_initialized() {
        let server = MockServer::start(|_| MockReply::Status(404)).await;
        let transport = transport_for(&server, Duration::from_secs(1));
        let err = list_tools(&transport, 1, Duration::from_secs(1))
            .await
            .expect_err("should fail");
        assert!(matches!(err, McpError::NotInitialized));
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn subscription_end_releases_pending_requests() {
        let subscription = Subscription::new();
        Subscription::send(&subscription.tx, sse_event("endpoint", "/messages"));
        let (tx, rx) = (subscription.tx.clone(), subscription.rx.clone());

        let server = MockServer::start(move |request| {
            if request.method == "GET" {
                return Subscription::reply(&rx);
            }
            // Dropping the only sender ends the subscription body.
            if let Ok(mut tx) = tx.lock() {
                tx.take();
            }
            accepted()
        })
        .await;

        let transport = transport_for(&server, Duration::from_secs(5));
        transport.connect().await.expect("handshake");

        let started = Instant::now();
        let err = list_tools(&transport, 1, Duration::from_secs(30))
            .await
            .expect_err("should be released");
        assert!(matches!(err, McpError::SubscriptionClosed(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let subscription = Subscription::new();
        Subscription::send(&subscription.tx, sse_event("endpoint", "/messages"));
        let rx = subscription.rx.clone();

        let server = MockServer::start(move |request| {
            if request.method == "GET" {
                return Subscription::reply(&rx);
            }
            accepted()
        })
        .await;

        let transport = transport_for(&server, Duration::from_secs(5));
        transport.connect().await.expect("handshake");
        let err = list_tools(&transport, 1, Duration::from_millis(150))
            .await
            .expect_err("should time out");
        assert!(matches!(err, McpError::Timeout(timeout) if timeout == Duration::from_millis(150)));
        transport.close().await;
    }
}
