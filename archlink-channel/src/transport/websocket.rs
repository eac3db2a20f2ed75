//! WebSocket transport - connects to the environment host's WebSocket endpoint
//!
//! The credential is presented twice: as an `X-API-KEY` header on the upgrade
//! request here, and inside the handshake message sent by the supervisor.

use super::{Connector, Endpoint, Link};
use crate::error::{self, Error, Result};
use futures_util::{future, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Header carrying the credential on the upgrade request
pub const API_KEY_HEADER: &str = "X-API-KEY";

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WebSocketConnector {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Link> {
        let mut request = endpoint.uri.as_str().into_client_request().map_err(|e| {
            error::connection_failed(&endpoint.uri, format!("invalid endpoint: {}", e))
                .with_operation("websocket::connect")
                .permanent()
                .set_source(e)
        })?;

        if !endpoint.api_key.is_empty() {
            let value = HeaderValue::from_str(&endpoint.api_key).map_err(|e| {
                error::config_invalid("api key is not a valid header value")
                    .with_operation("websocket::connect")
                    .set_source(e)
            })?;
            request.headers_mut().insert(API_KEY_HEADER, value);
        }

        let (ws, _response) = tokio_tungstenite::connect_async(request).await.map_err(|e| {
            error::connection_failed(&endpoint.uri, e.to_string())
                .with_operation("websocket::connect")
                .set_source(e)
        })?;

        let (sink, stream) = ws.split();

        let send_uri = endpoint.uri.clone();
        let sink = sink
            .sink_map_err(move |e| {
                error::connection_failed(send_uri, e.to_string())
                    .with_operation("websocket::send")
                    .set_source(e)
            })
            .with(|frame: Vec<u8>| future::ready(Ok::<_, Error>(to_ws_message(frame))));

        let recv_uri = endpoint.uri.clone();
        let stream = stream.filter_map(move |item| {
            let frame = match item {
                Ok(msg) if msg.is_text() || msg.is_binary() => Some(Ok(msg.into_data())),
                // ping/pong are answered by tungstenite; close is followed by end of stream
                Ok(_) => None,
                Err(e) => Some(Err(error::connection_failed(recv_uri.clone(), e.to_string())
                    .with_operation("websocket::recv")
                    .set_source(e))),
            };
            future::ready(frame)
        });

        Ok(Link::new(sink, stream))
    }
}

/// JSON frames go out as text; anything that is not UTF-8 goes out as binary
fn to_ws_message(frame: Vec<u8>) -> WsMessage {
    match String::from_utf8(frame) {
        Ok(text) => WsMessage::text(text),
        Err(e) => WsMessage::binary(e.into_bytes()),
    }
}
