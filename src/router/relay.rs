//! Outbound relay connection — dials the fabric's relay server and keeps a
//! single duplex JSON-envelope channel alive with exponential backoff.
//! Grounded on the teacher's `relay::relay_loop`; deliberately drops its
//! `relay::crypto` (X25519/HKDF/ChaCha20Poly1305 E2E) layer — spec.md's
//! Non-goals rule out any encryption/authorization beyond what the relay
//! transport itself already provides.

use super::envelope::Envelope;
use super::PylonRouter;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub async fn run(router: Arc<PylonRouter>, relay_url: String, pylon_id: u32, mut outbound_rx: mpsc::UnboundedReceiver<Envelope>) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        info!(url = %relay_url, "relay: connecting");
        match connect_async(&relay_url).await {
            Ok((ws_stream, _)) => {
                info!("relay: connected");
                backoff = INITIAL_BACKOFF;

                let (mut sink, mut stream) = ws_stream.split();
                let auth = Envelope::auth(pylon_id, None);
                if let Ok(text) = serde_json::to_string(&auth) {
                    if sink.send(Message::Text(text)).await.is_err() {
                        warn!("relay: failed to send auth envelope");
                        sleep_backoff(&mut backoff).await;
                        continue;
                    }
                }

                tokio::select! {
                    _ = handle_inbound(&mut stream, &router) => {
                        warn!("relay: inbound stream closed");
                    }
                    _ = handle_outbound(&mut outbound_rx, &mut sink) => {
                        warn!("relay: outbound sender closed");
                    }
                }
            }
            Err(e) => warn!("relay: connection failed: {e}"),
        }

        sleep_backoff(&mut backoff).await;
    }
}

async fn handle_inbound(
    stream: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
    router: &Arc<PylonRouter>,
) {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(e) => {
                warn!(err = %e, "relay: unparseable envelope, dropped");
                continue;
            }
        };

        debug!(kind = %envelope.kind, "relay: inbound envelope");
        // Dispatched on its own task so a slow handler for one conversation
        // (e.g. spawning an assistant subprocess) never blocks dispatch of
        // an unrelated envelope for another conversation; ordering within a
        // conversation is preserved by the locks inside WorkspaceStore and
        // ClaudeManager's per-conversation session state.
        let router = router.clone();
        tokio::spawn(async move { router.dispatch_inbound(envelope).await });
    }
}

async fn handle_outbound(
    rx: &mut mpsc::UnboundedReceiver<Envelope>,
    sink: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
) {
    while let Some(envelope) = rx.recv().await {
        let text = match serde_json::to_string(&envelope) {
            Ok(t) => t,
            Err(e) => {
                warn!(err = %e, "relay: failed to serialize outbound envelope");
                continue;
            }
        };
        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
}

async fn sleep_backoff(backoff: &mut Duration) {
    info!("relay: reconnecting in {}s", backoff.as_secs());
    tokio::time::sleep(*backoff).await;
    *backoff = (*backoff * 2).min(MAX_BACKOFF);
}
