//! In-process HTTP servers for exercising the MCP transports and the model
//! client without touching the network.

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One request as seen by a mock server.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }

    /// JSON-RPC method of a POST body, if any.
    pub fn rpc_method(&self) -> Option<String> {
        self.json()
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn rpc_id(&self) -> Option<Value> {
        self.json().get("id").cloned().filter(|id| !id.is_null())
    }
}

/// What a mock server sends back.
pub enum MockReply {
    Json {
        status: u16,
        headers: Vec<(String, String)>,
        body: String,
    },
    Status(u16),
    /// `text/event-stream` body fed by the receiver; the response ends when
    /// every sender is dropped.
    EventStream(mpsc::UnboundedReceiver<String>),
    /// Event-stream body sent in one piece.
    EventStreamBody(String),
    Delayed(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn json(body: Value) -> Self {
        MockReply::Json {
            status: 200,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn json_with_header(body: Value, name: &str, value: &str) -> Self {
        MockReply::Json {
            status: 200,
            headers: vec![(name.to_string(), value.to_string())],
            body: body.to_string(),
        }
    }

    pub fn delayed(delay: Duration, reply: MockReply) -> Self {
        MockReply::Delayed(delay, Box::new(reply))
    }
}

pub type MockHandler = Arc<dyn Fn(CapturedRequest) -> MockReply + Send + Sync>;

/// HTTP/1.1 server bound to an ephemeral loopback port.
pub struct MockServer {
    pub base_url: String,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(handler: impl Fn(CapturedRequest) -> MockReply + Send + Sync + 'static) -> Self {
        disable_proxies();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("local addr should resolve");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: MockHandler = Arc::new(handler);

        let captured = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let handler = Arc::clone(&handler);
                let captured = Arc::clone(&captured);
                tokio::spawn(serve_connection(stream, handler, captured));
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            requests,
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    /// Number of POSTs carrying the given JSON-RPC method.
    pub fn rpc_count(&self, method: &str) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.rpc_method().as_deref() == Some(method))
            .count()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    handler: MockHandler,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
) {
    loop {
        let request = match read_http_request(&mut stream).await {
            Ok(Some(request)) => request,
            _ => return,
        };
        if let Ok(mut requests) = captured.lock() {
            requests.push(request.clone());
        }
        let reply = handler(request);
        if !write_reply(&mut stream, reply).await {
            return;
        }
    }
}

/// Writes `reply`; returns `false` when the connection must be closed.
async fn write_reply(stream: &mut TcpStream, mut reply: MockReply) -> bool {
    while let MockReply::Delayed(delay, inner) = reply {
        tokio::time::sleep(delay).await;
        reply = *inner;
    }

    match reply {
        MockReply::Json {
            status,
            headers,
            body,
        } => {
            let mut head = format!(
                "HTTP/1.1 {status} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n",
                reason(status),
                body.len()
            );
            for (name, value) in headers {
                head.push_str(&format!("{name}: {value}\r\n"));
            }
            head.push_str("\r\n");
            stream.write_all(head.as_bytes()).await.is_ok()
                && stream.write_all(body.as_bytes()).await.is_ok()
        }
        MockReply::Status(status) => {
            let head = format!(
                "HTTP/1.1 {status} {}\r\ncontent-length: 0\r\n\r\n",
                reason(status)
            );
            stream.write_all(head.as_bytes()).await.is_ok()
        }
        MockReply::EventStreamBody(body) => {
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncontent-length: {}\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).await.is_ok()
                && stream.write_all(body.as_bytes()).await.is_ok()
        }
        MockReply::EventStream(mut events) => {
            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\nconnection: close\r\n\r\n";
            if stream.write_all(head.as_bytes()).await.is_err() {
                return false;
            }
            while let Some(event) = events.recv().await {
                if stream.write_all(event.as_bytes()).await.is_err() {
                    return false;
                }
                let _ = stream.flush().await;
            }
            let _ = stream.shutdown().await;
            false
        }
        MockReply::Delayed(..) => false,
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "Status",
    }
}

/// Reads one request; `Ok(None)` means the peer closed the connection cleanly.
pub async fn read_http_request(stream: &mut TcpStream) -> Result<Option<CapturedRequest>, String> {
    let mut buffer = Vec::new();
    let mut header_end = None;
    while header_end.is_none() {
        let mut chunk = [0_u8; 1024];
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err("Unexpected EOF while reading HTTP headers".to_string());
        }
        buffer.extend_from_slice(&chunk[..read]);
        header_end = buffer
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .map(|index| index + 4);
    }

    let header_end = header_end.unwrap_or(buffer.len());
    let header_text =
        std::str::from_utf8(&buffer[..header_end]).map_err(|err| err.to_string())?;
    let mut lines = header_text.split("\r\n").filter(|line| !line.is_empty());
    let request_line = lines
        .next()
        .ok_or_else(|| "Missing HTTP request line".to_string())?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    let mut content_length = 0_usize;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse::<usize>().map_err(|err| err.to_string())?;
        }
        headers.push((name.to_string(), value));
    }

    let mut body = buffer[header_end..].to_vec();
    while body.len() < content_length {
        let mut chunk = vec![0_u8; content_length - body.len()];
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            return Err("Unexpected EOF while reading HTTP body".to_string());
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(Some(CapturedRequest {
        method,
        path,
        headers,
        body,
    }))
}

/// Loopback requests must not be routed through a proxy from the environment.
pub fn disable_proxies() {
    for name in [
        "HTTP_PROXY",
        "http_proxy",
        "HTTPS_PROXY",
        "https_proxy",
        "ALL_PROXY",
        "all_proxy",
    ] {
        std::env::remove_var(name);
    }
    std::env::set_var("NO_PROXY", "*");
    std::env::set_var("no_proxy", "*");
}

pub fn rpc_result(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

pub fn rpc_error(id: Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

pub fn sse_event(event: &str, data: &str) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

pub fn initialize_result(name: &str, protocol_version: &str) -> Value {
    json!({
        "protocolVersion": protocol_version,
        "capabilities": {"tools": {}},
        "serverInfo": {"name": name, "version": "1.0.0"}
    })
}

pub fn tool(name: &str, description: &str) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": {
            "type": "object",
            "properties": {"query": {"type": "string", "description": "Search text"}},
            "required": ["query"]
        }
    })
}

/// Streamable-HTTP tool server answering `initialize`, `tools/list` and
/// `tools/call`. Calls echo `<server>:<tool>` followed by their arguments.
/// Every reply is held back by `delay`.
pub async fn start_tool_server(name: &str, tools: Vec<Value>, delay: Duration) -> MockServer {
    let name = name.to_string();
    MockServer::start(move |request| {
        let id = request.rpc_id().unwrap_or(Value::Null);
        let reply = match request.rpc_method().as_deref() {
            Some("initialize") => MockReply::json_with_header(
                rpc_result(id, initialize_result(&name, "2025-03-26")),
                "mcp-session-id",
                &format!("{name}-session"),
            ),
            Some("notifications/initialized") => MockReply::Status(202),
            Some("tools/list") => MockReply::json(rpc_result(id, json!({"tools": tools.clone()}))),
            Some("tools/call") => {
                let params = request.json().get("params").cloned().unwrap_or(Value::Null);
                let tool = params.get("name").and_then(Value::as_str).unwrap_or_default();
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                MockReply::json(rpc_result(
                    id,
                    json!({"content": [{"type": "text", "text": format!("{name}:{tool} {arguments}")}]}),
                ))
            }
            _ => MockReply::Status(405),
        };
        if delay.is_zero() {
            reply
        } else {
            MockReply::delayed(delay, reply)
        }
    })
    .await
}
