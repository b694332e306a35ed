//! WebSocket channel for subscription notifications.
//!
//! Endpoint: `/fhir/Subscription/{id}/$events`. The session is attached before
//! the upgrade so that an inactive subscription is refused with an HTTP error.
//! A writer task drains the session's outbound channel into the socket; the
//! connection task reads client messages (`pong`, `refresh-token`).

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{FromRequestParts, Request};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use medrepo_subscriptions::{
    ChannelTransport, DispatchError, InboundMessage, OutboundMessage, SubscriptionDispatcher,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ApiError, ApiResult};
use crate::handlers::tenant_context;
use crate::server::AppState;

/// Outbound messages buffered per connection.
const OUTBOUND_BUFFER: usize = 64;

pub async fn subscription_events(
    state: AppState,
    subscription_id: String,
    request: Request,
) -> ApiResult<Response> {
    let (mut parts, _body) = request.into_parts();
    let ws = WebSocketUpgrade::from_request_parts(&mut parts, &state)
        .await
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let ctx = tenant_context(&parts.headers);

    let dispatcher = state.services.dispatcher.clone();
    let (transport, outbound) = ChannelTransport::channel(OUTBOUND_BUFFER);
    let attached = dispatcher.attach(&ctx, &subscription_id, Arc::new(transport))?;
    let session_id = attached.session_id;

    Ok(ws.on_upgrade(move |socket| serve(socket, dispatcher, session_id, outbound)))
}

async fn serve(
    socket: WebSocket,
    dispatcher: SubscriptionDispatcher,
    session_id: String,
    mut outbound: mpsc::Receiver<OutboundMessage>,
) {
    info!(session_id = %session_id, "WebSocket connection established");
    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let close = match &message {
                OutboundMessage::Close { reason } => Some(reason.clone()),
                _ => None,
            };
            let text = message.to_json().to_string();
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
            if let Some(reason) = close {
                let frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_inbound(&dispatcher, &session_id, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(session_id = %session_id, error = %e, "WebSocket read failed");
                    break;
                }
                // protocol-level ping/pong frames are answered by the socket
                Some(Ok(_)) => {}
            },
        }
    }

    dispatcher.detach(&session_id);
    writer.abort();
    info!(session_id = %session_id, "WebSocket connection closed");
}

async fn handle_inbound(dispatcher: &SubscriptionDispatcher, session_id: &str, text: &str) {
    let message = match serde_json::from_str::<InboundMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(session_id, error = %e, "Ignoring malformed client message");
            return;
        }
    };
    match message {
        InboundMessage::Pong => {
            if let Err(e) = dispatcher.acknowledge_ping(session_id) {
                debug!(session_id, error = %e, "Pong for a closed session");
            }
        }
        InboundMessage::RefreshToken { token } => match dispatcher.refresh_token(&token).await {
            Ok(_) => {}
            // the dispatcher closes the session itself
            Err(DispatchError::TokenExpired) => {
                debug!(session_id, "Refresh attempted with an expired token");
            }
            Err(e) => warn!(session_id, error = %e, "Token refresh rejected"),
        },
    }
}
