// WebSocket transport for the push channel (tokio-tungstenite).

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use super::transport::{ChannelConnection, ChannelConnector, TransportError};

/// Opens the channel with the access token as a bearer `Authorization`
/// header on the upgrade request.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl ChannelConnector for WsConnector {
    type Connection = WsConnection;

    async fn connect(&self, endpoint: &Url, token: &str) -> Result<WsConnection, TransportError> {
        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|error| TransportError::Connect(error.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|error| TransportError::Connect(format!("invalid token header: {error}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        match connect_async(request).await {
            Ok((stream, response)) => {
                debug!(endpoint = %endpoint, status = %response.status(), "websocket upgraded");
                Ok(WsConnection { stream })
            }
            Err(WsError::Http(response))
                if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) =>
            {
                Err(TransportError::Unauthorized)
            }
            Err(error) => Err(TransportError::Connect(error.to_string())),
        }
    }
}

impl ChannelConnection for WsConnection {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(frame.into()))
            .await
            .map_err(|error| TransportError::Send(error.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => return Ok(Some(text.as_str().to_owned())),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "server closed websocket");
                    return Ok(None);
                }
                // Ping/pong frames are answered by tungstenite itself.
                Ok(_) => continue,
                Err(WsError::ConnectionClosed) => return Ok(None),
                Err(error) => return Err(TransportError::Recv(error.to_string())),
            }
        }
        Ok(None)
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
