// Transport seam for the push channel.
//
// The manager only sees text frames. Production uses tokio-tungstenite
// (`ws.rs`); tests script connections through in-memory channels.

use std::future::Future;

use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The server refused the handshake because the credential was rejected.
    #[error("handshake rejected: unauthorized")]
    Unauthorized,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Recv(String),
}

/// Opens authenticated channel connections.
pub trait ChannelConnector: Send + Sync + 'static {
    type Connection: ChannelConnection;

    fn connect(
        &self,
        endpoint: &Url,
        token: &str,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// One open channel. `recv` must be cancel-safe: the manager polls it inside
/// `tokio::select!` alongside the heartbeat timer and outbound commands.
pub trait ChannelConnection: Send + 'static {
    fn send(&mut self, frame: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next text frame. `Ok(None)` means the server closed the channel.
    fn recv(&mut self) -> impl Future<Output = Result<Option<String>, TransportError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}
