use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::SessionId,
    protocol::{ServerEvent, Table},
};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::transport::{
    dispatch, ChangeHandler, ConnectionStatus, EventTransport, SubscriptionHandle,
};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const LOG_TARGET: &str = "client_core::ws_transport";

#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    pub handshake_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl Default for WsTransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

/// Subscribes over the server's `/ws` endpoint, one socket per subscription.
#[derive(Debug, Clone)]
pub struct WsEventTransport {
    ws_base: Url,
    cfg: WsTransportConfig,
}

impl WsEventTransport {
    /// `server_url` is the HTTP base of the record store.
    pub fn new(server_url: &str, cfg: WsTransportConfig) -> Result<Self> {
        let ws_base = if let Some(rest) = server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        let ws_base = Url::parse(ws_base.trim_end_matches('/'))
            .with_context(|| format!("invalid server url: {server_url}"))?;
        Ok(Self { ws_base, cfg })
    }

    pub fn subscription_url(&self, session_id: SessionId, table: Table) -> Result<Url> {
        let mut url = self.ws_base.join("ws").context("failed to build websocket url")?;
        url.query_pairs_mut()
            .append_pair("session_id", &session_id.to_string())
            .append_pair("table", table.as_str());
        Ok(url)
    }
}

impl EventTransport for WsEventTransport {
    fn subscribe(
        &self,
        session_id: SessionId,
        table: Table,
        handler: Arc<dyn ChangeHandler>,
    ) -> SubscriptionHandle {
        let url = self.subscription_url(session_id, table);
        let cfg = self.cfg.clone();
        let task = tokio::spawn(async move {
            let url = match url {
                Ok(url) => url,
                Err(err) => {
                    warn!(target: LOG_TARGET, error = %err, "cannot subscribe");
                    handler.on_status(table, ConnectionStatus::Connecting);
                    return;
                }
            };
            run_subscription(url, cfg, session_id, table, handler).await;
        });
        SubscriptionHandle::new(session_id, table, task)
    }
}

async fn run_subscription(
    url: Url,
    cfg: WsTransportConfig,
    session_id: SessionId,
    table: Table,
    handler: Arc<dyn ChangeHandler>,
) {
    info!(target: LOG_TARGET, %url, "starting subscription");
    loop {
        handler.on_status(table, ConnectionStatus::Connecting);
        match connect(&url, cfg.handshake_timeout).await {
            Ok(stream) => {
                if let Err(err) = pump(stream, session_id, table, handler.as_ref()).await {
                    warn!(target: LOG_TARGET, error = %err, table = table.as_str(), "subscription stream ended with error");
                }
            }
            Err(err) => {
                warn!(target: LOG_TARGET, error = %err, table = table.as_str(), "failed to connect subscription");
            }
        }

        debug!(
            target: LOG_TARGET,
            delay_secs = cfg.reconnect_delay.as_secs_f32(),
            table = table.as_str(),
            "waiting before reconnect attempt"
        );
        sleep(cfg.reconnect_delay).await;
    }
}

async fn connect(url: &Url, handshake_timeout: Duration) -> Result<WsStream> {
    let (stream, _) = timeout(handshake_timeout, connect_async(url.as_str()))
        .await
        .context("subscription handshake timed out")?
        .context("subscription handshake failed")?;
    Ok(stream)
}

async fn pump(
    stream: WsStream,
    session_id: SessionId,
    table: Table,
    handler: &dyn ChangeHandler,
) -> Result<()> {
    let (mut sink, mut source) = stream.split();

    while let Some(msg) = source.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                Ok(ServerEvent::Subscribed { .. }) => {
                    handler.on_status(table, ConnectionStatus::Connected);
                }
                Ok(ServerEvent::Change(event)) => {
                    if event.session_id != session_id || event.table != table {
                        debug!(target: LOG_TARGET, seq = event.seq, "dropping event for another stream");
                        continue;
                    }
                    dispatch(handler, event);
                }
                Ok(ServerEvent::Error(err)) => {
                    warn!(target: LOG_TARGET, code = ?err.code, message = %err.message, "server reported subscription error");
                }
                Err(err) => {
                    warn!(target: LOG_TARGET, error = %err, "dropping malformed frame");
                }
            },
            Ok(Message::Ping(payload)) => {
                sink.send(Message::Pong(payload)).await.ok();
            }
            Ok(Message::Close(frame)) => {
                debug!(target: LOG_TARGET, ?frame, "socket closed by server");
                break;
            }
            Ok(_) => {}
            Err(err) => return Err(err).context("websocket error"),
        }
    }

    let _ = sink.close().await;
    Ok(())
}

#[cfg(test)]
#[path = "tests/ws_transport_tests.rs"]
mod tests;
