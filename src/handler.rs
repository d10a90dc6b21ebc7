//! WebSocket command server.
//!
//! Browser-side capture events and user commands arrive as tagged JSON
//! messages over a local WebSocket connection; each command gets at most
//! one JSON response back on the same connection.

use futures::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tungstenite::tokio::accept_async_with_config;
use tungstenite::tungstenite::protocol::WebSocketConfig;
use tungstenite::tungstenite::Message;

use crate::capture::{CapturedRequest, RequestPatch};
use crate::probe;
use crate::service::Services;
use crate::store::{
    HistoryRecord, HistoryStore, SettingsStore, URL_PATTERNS_KEY,
};

/// One capture phase event: the request id plus whatever fields this
/// phase observed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureEvent {
    pub request_id: String,
    #[serde(flatten)]
    pub patch: RequestPatch,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Command {
    /// Request headers were sent by the browser.
    RequestHeadersSent(CaptureEvent),
    /// A request body became available.
    RequestBodyAvailable(CaptureEvent),
    /// The response started arriving; the capture is complete enough to
    /// notarize.
    ResponseStarted(CaptureEvent),
    /// Explicitly queue a captured request for notarization.
    NotarizeRequest { request_id: String },
    /// Remove a still-queued request from the queue.
    CancelRequest { request_id: String },
    /// Fetch the full notarization history, oldest first.
    RequestProofHistory,
    /// Delete one history record by id.
    DeleteHistoryRecord { id: String },
    /// Verify a previously produced proof against the notary.
    VerifyProof { proof: String },
    /// Replace the active URL pattern set.
    SetUrlPatterns { patterns: Vec<String> },
    /// A browser tab closed; its pending captures are dropped.
    TabClosed { tab_id: i64 },
    /// Zap approval round trip, acknowledged as-is.
    ZapApprovalRequest,
    /// Mint attestation round trip, acknowledged as-is.
    MintAttestationRequest,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum CommandResponse {
    /// A freshly captured request matched the filter and was queued.
    PushNewRequest {
        tab_id: i64,
        request: CapturedRequest,
    },
    ProofHistory {
        records: Vec<HistoryRecord>,
    },
    VerifyResult {
        valid: bool,
    },
    ZapApprovalResponse,
    MintAttestationResponse,
    Ack,
    Error(String),
}

pub async fn accept_connection<S>(
    services: std::sync::Arc<Services<S>>,
    stream: TcpStream,
) -> crate::Result<()>
where
    S: SettingsStore + HistoryStore + 'static,
{
    let config = WebSocketConfig {
        max_send_queue: Some(5),
        max_message_size: Some(2 << 20), // 2MB
        ..Default::default()
    };
    let ws_stream = accept_async_with_config(stream, Some(config)).await?;
    let (mut tx, mut rx) = ws_stream.split();
    while let Some(msg) = rx.try_next().await? {
        match msg {
            Message::Text(v) => {
                handle_text(&services, v, &mut tx).await?
            }
            Message::Binary(_) => {
                // should we close the connection?
            }
            _ => continue,
        }
    }
    Ok(())
}

pub async fn handle_text<S, TX>(
    services: &Services<S>,
    v: String,
    tx: &mut TX,
) -> crate::Result<()>
where
    S: SettingsStore + HistoryStore + 'static,
    TX: Sink<Message> + Unpin,
{
    let response = match serde_json::from_str(&v) {
        Ok(cmd) => handle_command(services, cmd).await,
        Err(e) => Some(CommandResponse::Error(e.to_string())),
    };
    if let Some(response) = response {
        let value = serde_json::to_string(&response)?;
        tx.send(Message::Text(value))
            .await
            .map_err(|_| crate::error::Error::FailedToSendResponse)?;
    }
    Ok(())
}

pub async fn handle_command<S>(
    services: &Services<S>,
    cmd: Command,
) -> Option<CommandResponse>
where
    S: SettingsStore + HistoryStore + 'static,
{
    use CommandResponse::*;
    match cmd {
        Command::RequestHeadersSent(event) => {
            let url = event.patch.url.as_deref().unwrap_or_default();
            if !services.filter.matches(url) {
                return None;
            }
            tracing::trace!(
                target: probe::TARGET,
                kind = %probe::Kind::Capture,
                request_id = %event.request_id,
                %url,
                "captured request headers"
            );
            services.cache.put(&event.request_id, event.patch);
            None
        }
        Command::RequestBodyAvailable(event) => {
            // preflights carry no body worth notarizing.
            if event.patch.method.as_deref() == Some("OPTIONS") {
                return None;
            }
            services.cache.put(&event.request_id, event.patch);
            None
        }
        Command::ResponseStarted(event) => {
            if event.patch.method.as_deref() == Some("OPTIONS") {
                return None;
            }
            let url = event.patch.url.as_deref().unwrap_or_default();
            if !services.filter.matches(url) {
                return None;
            }
            services.cache.put(&event.request_id, event.patch);
            let request = services.cache.get(&event.request_id)?;
            services.queue.enqueue(&event.request_id);
            Some(PushNewRequest {
                tab_id: request.tab_id,
                request,
            })
        }
        Command::NotarizeRequest { request_id } => {
            if services.cache.get(&request_id).is_none() {
                return Some(Error(format!(
                    "request {request_id} is not in the capture cache"
                )));
            }
            services.queue.enqueue(&request_id);
            Some(Ack)
        }
        Command::CancelRequest { request_id } => {
            if services.queue.cancel(&request_id) {
                Some(Ack)
            } else {
                Some(Error(format!("request {request_id} is not queued")))
            }
        }
        Command::RequestProofHistory => {
            match services.store.list_records() {
                Ok(records) => Some(ProofHistory { records }),
                Err(e) => Some(Error(e.to_string())),
            }
        }
        Command::DeleteHistoryRecord { id } => {
            match services.store.remove_record(&id) {
                Ok(Some(_)) => Some(Ack),
                Ok(None) => {
                    Some(Error(format!("no history record with id {id}")))
                }
                Err(e) => Some(Error(e.to_string())),
            }
        }
        Command::VerifyProof { proof } => {
            match services.notarizer.verify(proof).await {
                Ok(valid) => Some(VerifyResult { valid }),
                Err(e) => Some(Error(e.to_string())),
            }
        }
        Command::SetUrlPatterns { patterns } => {
            if let Err(e) = services.filter.set_patterns(&patterns) {
                return Some(Error(e.to_string()));
            }
            match services.store.set_list(URL_PATTERNS_KEY, &patterns) {
                Ok(()) => Some(Ack),
                Err(e) => Some(Error(e.to_string())),
            }
        }
        Command::TabClosed { tab_id } => {
            services.cache.clear_for_tab(tab_id);
            None
        }
        Command::ZapApprovalRequest => Some(ZapApprovalResponse),
        Command::MintAttestationRequest => Some(MintAttestationResponse),
    }
}
