use async_trait::async_trait;
use mcp_sdk_rs::client::Client;
use mcp_sdk_rs::session::Session;
use mcp_sdk_rs::transport::Message;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};

use super::{ConnectionError, McpToolDef, ProviderSpec, TransportError, TransportKind};

const PROTOCOL_VERSION: &str = "2024-11-05";

/// One live connection to a provider. Wire encoding is up to the implementor.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn discover(&self) -> Result<Vec<McpToolDef>, TransportError>;

    /// Calls a tool and returns the provider's raw result object.
    async fn invoke(&self, tool: &str, arguments: Value) -> Result<Value, TransportError>;

    async fn close(&self) {}
}

/// Opens transports for provider specs.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        spec: &ProviderSpec,
    ) -> Result<Arc<dyn ProviderTransport>, ConnectionError>;
}

/// Connects `stdio` providers as child processes and `http` providers over POST.
#[derive(Debug, Clone, Default)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(
        &self,
        spec: &ProviderSpec,
    ) -> Result<Arc<dyn ProviderTransport>, ConnectionError> {
        let unreachable = |e: TransportError| ConnectionError::Unreachable {
            provider: spec.name.clone(),
            message: e.to_string(),
        };
        match spec.transport {
            TransportKind::Stdio => {
                let command = spec
                    .command
                    .as_deref()
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| ConnectionError::InvalidSpec {
                        provider: spec.name.clone(),
                        field: "command",
                    })?;
                let transport = StdioTransport::spawn(command, &spec.args, &spec.env)
                    .await
                    .map_err(unreachable)?;
                Ok(Arc::new(transport))
            }
            TransportKind::Http => {
                let url = spec
                    .url
                    .as_deref()
                    .filter(|u| !u.trim().is_empty())
                    .ok_or_else(|| ConnectionError::InvalidSpec {
                        provider: spec.name.clone(),
                        field: "url",
                    })?;
                let transport = HttpTransport::connect(url).await.map_err(unreachable)?;
                Ok(Arc::new(transport))
            }
        }
    }
}

fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "ptc",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

fn parse_tool_list(response: &Value) -> Result<Vec<McpToolDef>, TransportError> {
    let tools = response
        .get("tools")
        .cloned()
        .ok_or_else(|| TransportError::Protocol("response has no `tools` field".into()))?;
    serde_json::from_value(tools).map_err(|e| TransportError::Protocol(e.to_string()))
}

/// Maps an MCP `tools/call` result to the raw value, or a remote fault when
/// the provider flagged it with `isError`.
fn call_result(response: Value) -> Result<Value, TransportError> {
    let is_error = response
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !is_error {
        return Ok(response);
    }
    // MCP content is often an array of objects like { type: "text", text: "..." }
    let message = match response.get("content").and_then(Value::as_array) {
        Some(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        None => response.to_string(),
    };
    Err(TransportError::Remote(message))
}

/// MCP over a child process's stdin/stdout.
pub struct StdioTransport {
    client: Client,
    _to_session_tx: mpsc::UnboundedSender<Message>,
}

impl StdioTransport {
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &std::collections::BTreeMap<String, String>,
    ) -> Result<Self, TransportError> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        cmd.envs(env);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::inherit());
        cmd.kill_on_drop(true);

        let (to_session_tx, to_session_rx) = mpsc::unbounded_channel::<Message>();
        let (from_session_tx, from_session_rx) = mpsc::unbounded_channel::<Message>();

        let session = Session::Local {
            handler: None,
            command: cmd,
            receiver: Arc::new(Mutex::new(to_session_rx)),
            sender: Arc::new(from_session_tx),
        };

        session
            .start()
            .await
            .map_err(|e| TransportError::SpawnFailed(e.to_string()))?;

        let client = Client::new(to_session_tx.clone(), from_session_rx);

        client
            .request("initialize", Some(initialize_params()))
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        client
            .notify("notifications/initialized", None)
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        Ok(Self {
            client,
            _to_session_tx: to_session_tx,
        })
    }
}

#[async_trait]
impl ProviderTransport for StdioTransport {
    async fn discover(&self) -> Result<Vec<McpToolDef>, TransportError> {
        let response = self
            .client
            .request("tools/list", None)
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        parse_tool_list(&response)
    }

    async fn invoke(&self, tool: &str, arguments: Value) -> Result<Value, TransportError> {
        let response = self
            .client
            .request(
                "tools/call",
                Some(json!({
                    "name": tool,
                    "arguments": arguments
                })),
            )
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        call_result(response)
    }
}

/// MCP JSON-RPC over plain HTTP POST.
pub struct HttpTransport {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let transport = Self {
            http: reqwest::Client::new(),
            url: url.to_string(),
            next_id: AtomicU64::new(1),
        };
        transport
            .request("initialize", Some(initialize_params()))
            .await?;
        transport.notify("notifications/initialized").await?;
        Ok(transport)
    }

    /// Sends a notification. Servers answer with an empty 2xx.
    async fn notify(&self, method: &str) -> Result<(), TransportError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Connection(format!(
                "{method} returned HTTP {status}"
            )));
        }
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
        });
        if let Some(params) = params {
            body["params"] = params;
        }

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Connection(format!(
                "{method} returned HTTP {status}"
            )));
        }

        let reply: Value = response
            .json()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        if let Some(error) = reply.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), ToString::to_string);
            return Err(TransportError::Remote(message));
        }
        reply
            .get("result")
            .cloned()
            .ok_or_else(|| TransportError::Protocol(format!("{method} reply has no result")))
    }
}

#[async_trait]
impl ProviderTransport for HttpTransport {
    async fn discover(&self) -> Result<Vec<McpToolDef>, TransportError> {
        let response = self.request("tools/list", None).await?;
        parse_tool_list(&response)
    }

    async fn invoke(&self, tool: &str, arguments: Value) -> Result<Value, TransportError> {
        let response = self
            .request(
                "tools/call",
                Some(json!({
                    "name": tool,
                    "arguments": arguments
                })),
            )
            .await?;
        call_result(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_result_passes_through_success() {
        let raw = json!({"content": [{"type": "text", "text": "42"}]});
        assert_eq!(call_result(raw.clone()).unwrap(), raw);
    }

    #[test]
    fn test_call_result_flags_remote_error() {
        let raw = json!({
            "content": [{"type": "text", "text": "quota exceeded"}],
            "isError": true
        });
        match call_result(raw) {
            Err(TransportError::Remote(message)) => assert_eq!(message, "quota exceeded"),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_tool_list_requires_tools_field() {
        assert!(parse_tool_list(&json!({})).is_err());
        let tools = parse_tool_list(&json!({"tools": [{"name": "a"}]})).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "a");
    }

    /// Minimal JSON-RPC server answering `count` requests and recording
    /// each method name.
    fn rpc_server(count: usize) -> (String, std::thread::JoinHandle<Vec<String>>) {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let url = format!("http://{}", server.server_addr().to_ip().unwrap());
        let handle = std::thread::spawn(move || {
            let mut methods = Vec::new();
            for _ in 0..count {
                let mut request = server.recv().unwrap();
                let mut body = String::new();
                request.as_reader().read_to_string(&mut body).unwrap();
                let message: Value = serde_json::from_str(&body).unwrap();
                methods.push(message["method"].as_str().unwrap().to_string());
                let response = match message.get("id") {
                    None => tiny_http::Response::from_string("").with_status_code(202),
                    Some(id) => {
                        let result = if message["method"] == "tools/list" {
                            json!({"tools": [{"name": "lookup"}]})
                        } else {
                            json!({})
                        };
                        tiny_http::Response::from_string(
                            json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string(),
                        )
                    }
                };
                request.respond(response).unwrap();
            }
            methods
        });
        (url, handle)
    }

    #[tokio::test]
    async fn test_http_connect_completes_handshake() {
        let (url, server) = rpc_server(3);
        let transport = HttpTransport::connect(&url).await.unwrap();
        let tools = transport.discover().await.unwrap();
        assert_eq!(tools[0].name, "lookup");
        assert_eq!(
            server.join().unwrap(),
            vec!["initialize", "notifications/initialized", "tools/list"]
        );
    }

    #[tokio::test]
    async fn test_connector_rejects_missing_command() {
        let spec = ProviderSpec {
            name: "broken".into(),
            ..ProviderSpec::default()
        };
        match DefaultConnector.connect(&spec).await {
            Err(ConnectionError::InvalidSpec { provider, field }) => {
                assert_eq!(provider, "broken");
                assert_eq!(field, "command");
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("connect should fail"),
        }
    }
}
