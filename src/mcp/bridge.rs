//! Loopback endpoint that generated stubs call from inside an execution
//! environment. Each request is forwarded to [`ToolRegistry::invoke`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::thread;
use tiny_http::{Header, Method, Request, Response, Server};

use super::ToolRegistry;

/// Request body sent by `tools/_bridge.py`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeCall {
    pub provider: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeFault {
    pub kind: String,
    pub provider: String,
    pub tool: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BridgeReply {
    Ok { result: Value },
    Err { error: BridgeFault },
}

pub struct InvocationBridge {
    url: String,
    server: Arc<Server>,
    worker: Option<thread::JoinHandle<()>>,
}

impl InvocationBridge {
    /// Binds an ephemeral loopback port and starts serving on a background
    /// thread. Must be called from within a tokio runtime.
    pub fn start(registry: Arc<ToolRegistry>) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(std::io::Error::other)?;
        let server = Server::http("127.0.0.1:0")
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let addr = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| std::io::Error::other("bridge is not listening on an IP address"))?;
        let url = format!("http://{addr}");
        let server = Arc::new(server);

        let worker = {
            let server = server.clone();
            thread::Builder::new()
                .name("ptc-bridge".into())
                .spawn(move || {
                    for request in server.incoming_requests() {
                        let registry = registry.clone();
                        runtime.spawn(handle_request(registry, request));
                    }
                })?
        };

        tracing::info!(url = %url, "Invocation bridge listening");
        Ok(Self {
            url,
            server,
            worker: Some(worker),
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.server.unblock();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for InvocationBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_request(registry: Arc<ToolRegistry>, request: Request) {
    // tiny_http readers block, so the body is read off the runtime.
    let read = tokio::task::spawn_blocking(move || {
        let mut request = request;
        let mut body = String::new();
        let read = request.as_reader().read_to_string(&mut body).map(|_| body);
        (request, read)
    })
    .await;
    let Ok((request, body)) = read else {
        tracing::warn!("Bridge request reader failed");
        return;
    };

    let (status, reply) = if *request.method() != Method::Post || request.url() != "/invoke" {
        (404, fault("not_found", "", "", "unknown bridge endpoint"))
    } else {
        match body {
            Ok(body) => match serde_json::from_str::<BridgeCall>(&body) {
                Ok(call) => (200, dispatch(&registry, call).await),
                Err(e) => (400, fault("bad_request", "", "", &e.to_string())),
            },
            Err(e) => (400, fault("bad_request", "", "", &e.to_string())),
        }
    };

    let body = serde_json::to_string(&reply).unwrap_or_else(|_| "{}".to_string());
    let _ = tokio::task::spawn_blocking(move || {
        let mut response = Response::from_string(body).with_status_code(status);
        if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
            response = response.with_header(header);
        }
        if let Err(e) = request.respond(response) {
            tracing::warn!("Failed to answer bridge request: {}", e);
        }
    })
    .await;
}

async fn dispatch(registry: &ToolRegistry, call: BridgeCall) -> BridgeReply {
    let arguments = if call.arguments.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        call.arguments
    };
    match registry.invoke(&call.provider, &call.tool, arguments).await {
        Ok(result) => BridgeReply::Ok { result },
        Err(e) => {
            tracing::debug!(provider = %call.provider, tool = %call.tool, "Bridge call failed: {}", e);
            fault(e.kind().as_str(), e.provider(), e.tool(), &e.to_string())
        }
    }
}

fn fault(kind: &str, provider: &str, tool: &str, message: &str) -> BridgeReply {
    BridgeReply::Err {
        error: BridgeFault {
            kind: kind.to_string(),
            provider: provider.to_string(),
            tool: tool.to_string(),
            message: message.to_string(),
        },
    }
}
