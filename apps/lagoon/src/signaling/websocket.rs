use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::protocol::{decode_relay_event, encode_client_event};
use super::{ClientEvent, Relay, RelayError, RelayEvent, SignalingProtocolError};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

enum Outgoing {
    Event(ClientEvent),
    Ping,
}

/// Relay client speaking JSON event frames over a websocket.
pub struct WebSocketRelay {
    send_tx: mpsc::UnboundedSender<Outgoing>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WebSocketRelay {
    /// Connects and returns the relay together with the stream of inbound
    /// events. The stream ends when the socket closes.
    pub async fn connect(
        relay_url: &str,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<RelayEvent>), RelayError> {
        let websocket_url = derive_websocket_url(relay_url)?;
        let (ws_stream, _) = connect_async(websocket_url.as_str())
            .await
            .map_err(|err| RelayError::Setup(format!("websocket connect failed: {err}")))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<RelayEvent>();

        let writer_handle = tokio::spawn(async move {
            while let Some(outgoing) = send_rx.recv().await {
                let message = match outgoing {
                    Outgoing::Event(event) => match encode_client_event(&event) {
                        Ok(text) => Message::Text(text),
                        Err(err) => {
                            tracing::warn!(
                                target = "lagoon::relay",
                                event = event.name(),
                                error = %err,
                                "dropping unencodable event"
                            );
                            continue;
                        }
                    },
                    Outgoing::Ping => Message::Ping(Vec::new()),
                };
                if ws_write.send(message).await.is_err() {
                    break;
                }
            }
        });

        let reader_handle = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::warn!(target = "lagoon::relay", "relay websocket error: {err}");
                        break;
                    }
                };
                match decode_relay_event(&text) {
                    Ok(event) => {
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(SignalingProtocolError::UnknownEvent(name)) => {
                        tracing::trace!(target = "lagoon::relay", event = %name, "skipping event");
                    }
                    Err(err) => {
                        tracing::warn!(target = "lagoon::relay", error = %err, "ignoring relay frame");
                    }
                }
            }
            tracing::info!(target = "lagoon::relay", "relay websocket closed");
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(Outgoing::Ping).is_err() {
                    break;
                }
            }
        });

        let relay = Arc::new(Self {
            send_tx,
            tasks: Mutex::new(vec![writer_handle, reader_handle, heartbeat_handle]),
        });
        tracing::info!(target = "lagoon::relay", url = %websocket_url, "relay connected");
        Ok((relay, event_rx))
    }
}

impl Relay for WebSocketRelay {
    fn emit(&self, event: ClientEvent) -> Result<(), RelayError> {
        self.send_tx
            .send(Outgoing::Event(event))
            .map_err(|_| RelayError::Closed)
    }
}

impl Drop for WebSocketRelay {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

/// Accepts `ws`/`wss` URLs as-is and maps `http`/`https` onto them.
pub fn derive_websocket_url(relay_url: &str) -> Result<Url, RelayError> {
    let mut url = Url::parse(relay_url)
        .map_err(|err| RelayError::Setup(format!("invalid relay url {relay_url}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(RelayError::Setup(format!(
                "unsupported relay url scheme: {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| RelayError::Setup("invalid websocket scheme".into()))?;
    url.set_fragment(None);
    Ok(url)
}
