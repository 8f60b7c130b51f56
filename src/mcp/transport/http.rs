//! Streamable HTTP transport.
//!
//! Every request is a POST to the configured endpoint. The server either
//! answers in the POST body (JSON, or an event stream carrying the reply), or
//! accepts with `202` and delivers the reply later on the GET stream, which is
//! opened on demand and drained into the correlator.

use super::event_stream::{
    is_event_stream_content_type, SseEvent, SseEventDecoder, DEFAULT_EVENT_TYPE,
};
use super::{
    apply_json_post_headers, apply_protocol_version_header, content_type_of, ensure_success,
    route_messages, McpTransport, ServerHeaders, MCP_EVENT_STREAM_ACCEPT, MCP_SESSION_ID_HEADER,
};
use crate::mcp::correlator::ResponseCorrelator;
use crate::mcp::error::McpError;
use crate::mcp::jsonrpc::{is_reply, parse_server_messages, reply_id};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{StatusCode, Url};
use rust_mcp_schema::schema_utils::{ClientMessage, ServerMessage};
use rust_mcp_schema::RequestId;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Default)]
struct HttpSessionState {
    session_id: Option<String>,
    protocol_version: Option<String>,
    listener: Option<JoinHandle<()>>,
}

pub struct StreamableHttpTransport {
    server_id: String,
    endpoint: Url,
    client: reqwest::Client,
    headers: ServerHeaders,
    correlator: ResponseCorrelator,
    cancel: CancellationToken,
    state: Mutex<HttpSessionState>,
}

impl StreamableHttpTransport {
    pub fn new(
        server_id: String,
        endpoint: Url,
        client: reqwest::Client,
        headers: ServerHeaders,
    ) -> Self {
        Self {
            server_id,
            endpoint,
            client,
            headers,
            correlator: ResponseCorrelator::new(),
            cancel: CancellationToken::new(),
            state: Mutex::new(HttpSessionState::default()),
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.state().session_id.clone()
    }

    fn state(&self) -> MutexGuard<'_, HttpSessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn post(&self, payload: String) -> Result<reqwest::Response, McpError> {
        let (session_id, protocol_version) = {
            let state = self.state();
            (state.session_id.clone(), state.protocol_version.clone())
        };

        let mut request = apply_protocol_version_header(
            apply_json_post_headers(self.client.post(self.endpoint.clone())),
            protocol_version.as_deref(),
        );
        request = self.headers.apply(request);
        if let Some(session_id) = session_id {
            request = request.header(MCP_SESSION_ID_HEADER, session_id);
        }

        let response = request.body(payload).send().await?;
        ensure_success(&response)?;

        if let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            self.state().session_id = Some(session_id.to_string());
        }
        Ok(response)
    }

    /// Returns the reply if the POST carried it, or `None` when it was
    /// deferred to the GET stream.
    async fn exchange(
        &self,
        payload: String,
        id: &RequestId,
    ) -> Result<Option<ServerMessage>, McpError> {
        let response = self.post(payload).await?;
        if response.status() == StatusCode::ACCEPTED {
            return Ok(None);
        }

        if is_event_stream_content_type(&content_type_of(&response)) {
            return self.read_reply_stream(response, id).await.map(Some);
        }

        let body = response.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&body);
        let messages = parse_server_messages(&text)?;
        match self.claim_reply(messages, id) {
            Some(reply) => Ok(Some(reply)),
            None => Err(McpError::Decode(format!(
                "response body did not answer request {id:?}"
            ))),
        }
    }

    async fn read_reply_stream(
        &self,
        response: reqwest::Response,
        id: &RequestId,
    ) -> Result<ServerMessage, McpError> {
        let mut stream = response.bytes_stream();
        let mut decoder = SseEventDecoder::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for event in decoder.push(&chunk) {
                if let Some(reply) = self.claim_event(event, id) {
                    return Ok(reply);
                }
            }
        }
        for event in decoder.finish() {
            if let Some(reply) = self.claim_event(event, id) {
                return Ok(reply);
            }
        }

        Err(McpError::SubscriptionClosed(format!(
            "event stream ended before the reply to request {id:?}"
        )))
    }

    fn claim_event(&self, event: SseEvent, id: &RequestId) -> Option<ServerMessage> {
        if !event.is(DEFAULT_EVENT_TYPE) {
            debug!(server_id = %self.server_id, event = %event.event, "Ignoring MCP event");
            return None;
        }
        match parse_server_messages(&event.data) {
            Ok(messages) => self.claim_reply(messages, id),
            Err(err) => {
                warn!(server_id = %self.server_id, error = %err, "Dropping malformed MCP event");
                None
            }
        }
    }

    /// Picks the reply to `id` out of `messages`; other replies go to the
    /// correlator for whoever is waiting on them. An error without an id is
    /// taken as the answer to this request.
    fn claim_reply(&self, messages: Vec<ServerMessage>, id: &RequestId) -> Option<ServerMessage> {
        let mut reply = None;
        for message in messages {
            if !is_reply(&message) {
                debug!(server_id = %self.server_id, "Ignoring MCP server request or notification");
                continue;
            }
            match reply_id(&message).cloned() {
                Some(other) if reply.is_none() && &other == id => reply = Some(message),
                None if reply.is_none() => reply = Some(message),
                Some(other) => {
                    self.correlator.deliver(other, message);
                }
                None => debug!(server_id = %self.server_id, "Dropping extra MCP error without id"),
            }
        }
        reply
    }

    /// Starts the GET listener unless one is already running.
    fn ensure_listener(&self) {
        let mut state = self.state();
        if state
            .listener
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }

        let listener = EventStreamListener {
            server_id: self.server_id.clone(),
            endpoint: self.endpoint.clone(),
            client: self.client.clone(),
            headers: self.headers.clone(),
            session_id: state.session_id.clone(),
            protocol_version: state.protocol_version.clone(),
            correlator: self.correlator.clone(),
            cancel: self.cancel.child_token(),
        };
        state.listener = Some(tokio::spawn(listener.run()));
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn connect(&self) -> Result<(), McpError> {
        Ok(())
    }

    async fn send_request(
        &self,
        id: RequestId,
        message: ClientMessage,
        timeout: Duration,
    ) -> Result<ServerMessage, McpError> {
        let payload = serde_json::to_string(&message)?;
        debug!(
            server_id = %self.server_id,
            request_id = ?id,
            url = %self.endpoint,
            "Sending MCP HTTP request"
        );

        let started = Instant::now();
        let reply = tokio::time::timeout(timeout, self.exchange(payload, &id))
            .await
            .map_err(|_| McpError::Timeout(timeout))??;

        match reply {
            Some(reply) => Ok(reply),
            None => {
                debug!(server_id = %self.server_id, request_id = ?id, "MCP reply deferred to event stream");
                // Registered before the listener starts so a listener that
                // dies straight away still releases this request.
                let waiter = self.correlator.register(id);
                self.ensure_listener();
                match waiter.wait(timeout.saturating_sub(started.elapsed())).await {
                    Err(McpError::Timeout(_)) => Err(McpError::Timeout(timeout)),
                    outcome => outcome,
                }
            }
        }
    }

    async fn send_notification(&self, message: ClientMessage) -> Result<(), McpError> {
        let payload = serde_json::to_string(&message)?;
        self.post(payload).await.map(|_| ())
    }

    fn set_protocol_version(&self, protocol_version: &str) {
        self.state().protocol_version = Some(protocol_version.to_string());
    }

    async fn close(&self) {
        self.cancel.cancel();
        if let Some(listener) = self.state().listener.take() {
            listener.abort();
        }
        self.correlator.close("transport closed");
    }
}

/// Background reader for the GET stream of one streamable HTTP session.
struct EventStreamListener {
    server_id: String,
    endpoint: Url,
    client: reqwest::Client,
    headers: ServerHeaders,
    session_id: Option<String>,
    protocol_version: Option<String>,
    correlator: ResponseCorrelator,
    cancel: CancellationToken,
}

impl EventStreamListener {
    /// Drains the stream into the correlator. However it stops, short of
    /// cancellation, requests still waiting on it are released; the
    /// correlator stays open so a later request can start a new listener.
    async fn run(self) {
        if let Some(reason) = self.listen().await {
            self.correlator.fail_pending(&reason);
        }
    }

    /// Returns why the stream stopped, or `None` when it was cancelled.
    async fn listen(&self) -> Option<String> {
        let mut request = apply_protocol_version_header(
            self.client
                .get(self.endpoint.clone())
                .header(reqwest::header::ACCEPT, MCP_EVENT_STREAM_ACCEPT),
            self.protocol_version.as_deref(),
        );
        request = self.headers.apply(request);
        if let Some(session_id) = &self.session_id {
            request = request.header(MCP_SESSION_ID_HEADER, session_id);
        }

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            response = request.send() => response,
        };
        let response = match response
            .map_err(McpError::from)
            .and_then(|response| ensure_success(&response).map(|()| response))
        {
            Ok(response) => response,
            Err(err) => {
                warn!(server_id = %self.server_id, error = %err, "MCP event stream unavailable");
                return Some(format!("event stream unavailable: {err}"));
            }
        };
        if !is_event_stream_content_type(&content_type_of(&response)) {
            warn!(server_id = %self.server_id, "MCP GET did not return an event stream");
            return Some("GET did not return an event stream".to_string());
        }

        let mut stream = response.bytes_stream();
        let mut decoder = SseEventDecoder::default();
        let reason = loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(chunk)) => {
                    for event in decoder.push(&chunk) {
                        self.handle(event);
                    }
                }
                Some(Err(err)) => {
                    warn!(server_id = %self.server_id, error = %err, "MCP event stream failed");
                    break format!("event stream failed: {err}");
                }
                None => break "event stream ended".to_string(),
            }
        };
        for event in decoder.finish() {
            self.handle(event);
        }
        debug!(server_id = %self.server_id, reason = %reason, "MCP event stream stopped");
        Some(reason)
    }

    fn handle(&self, event: SseEvent) {
        if event.is(DEFAULT_EVENT_TYPE) {
            route_messages(&self.server_id, &event.data, &self.correlator);
        } else {
            debug!(server_id = %self.server_id, event = %event.event, "Ignoring MCP event");
        }
    }
}
