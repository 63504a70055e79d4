//! VNC WebSocket relay
//!
//! Bridges the browser's noVNC websocket to Proxmox's `vncwebsocket`
//! endpoint. Frames are forwarded verbatim in both directions, preserving
//! order and the text/binary distinction. Ping/pong stay hop-by-hop.
//!
//! Either direction ending (peer close, error, or cancellation) cancels the
//! relay token; both sockets then get a close frame and are dropped.

use axum::extract::ws::{self, WebSocket};
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    http::{header, HeaderValue},
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message as TMessage,
};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use vmportal_common::ConsoleSession;

use crate::proxmox::ProxmoxEndpoint;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// The portal is shutting down.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// The upstream console could not be reached.
pub const CLOSE_UPSTREAM_UNAVAILABLE: u16 = 1011;

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("browser websocket: {0}")]
    Browser(#[from] axum::Error),

    #[error("upstream websocket: {0}")]
    Upstream(#[from] tungstenite::Error),

    #[error("upstream dial failed: {0}")]
    Dial(String),

    #[error("upstream dial timed out")]
    DialTimeout,

    #[error("tls setup: {0}")]
    Tls(String),
}

/// A websocket frame, independent of which library produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<(u16, String)>),
}

impl Frame {
    pub fn close(code: u16, reason: &str) -> Self {
        Frame::Close(Some((code, reason.to_string())))
    }

    fn len(&self) -> usize {
        match self {
            Frame::Text(t) => t.len(),
            Frame::Binary(b) | Frame::Ping(b) | Frame::Pong(b) => b.len(),
            Frame::Close(_) => 0,
        }
    }
}

/// Conversion between a library message type and [`Frame`].
pub trait WsMessage: Sized {
    /// `None` for library-internal frames that are never forwarded.
    fn into_frame(self) -> Option<Frame>;
    fn from_frame(frame: Frame) -> Self;
}

impl WsMessage for ws::Message {
    fn into_frame(self) -> Option<Frame> {
        Some(match self {
            ws::Message::Text(t) => Frame::Text(t),
            ws::Message::Binary(b) => Frame::Binary(b),
            ws::Message::Ping(b) => Frame::Ping(b),
            ws::Message::Pong(b) => Frame::Pong(b),
            ws::Message::Close(cf) => Frame::Close(cf.map(|cf| (cf.code, cf.reason.into_owned()))),
        })
    }

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(t) => ws::Message::Text(t),
            Frame::Binary(b) => ws::Message::Binary(b),
            Frame::Ping(b) => ws::Message::Ping(b),
            Frame::Pong(b) => ws::Message::Pong(b),
            Frame::Close(cf) => ws::Message::Close(cf.map(|(code, reason)| ws::CloseFrame {
                code,
                reason: reason.into(),
            })),
        }
    }
}

impl WsMessage for TMessage {
    fn into_frame(self) -> Option<Frame> {
        match self {
            TMessage::Text(t) => Some(Frame::Text(t)),
            TMessage::Binary(b) => Some(Frame::Binary(b)),
            TMessage::Ping(b) => Some(Frame::Ping(b)),
            TMessage::Pong(b) => Some(Frame::Pong(b)),
            TMessage::Close(cf) => Some(Frame::Close(
                cf.map(|cf| (u16::from(cf.code), cf.reason.into_owned())),
            )),
            TMessage::Frame(_) => None,
        }
    }

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(t) => TMessage::Text(t),
            Frame::Binary(b) => TMessage::Binary(b),
            Frame::Ping(b) => TMessage::Ping(b),
            Frame::Pong(b) => TMessage::Pong(b),
            Frame::Close(cf) => TMessage::Close(cf.map(|(code, reason)| CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })),
        }
    }
}

/// Split a websocket into a [`Frame`] sink and stream.
#[allow(clippy::type_complexity)]
pub fn frames<S, M, E>(
    socket: S,
) -> (
    impl Sink<Frame, Error = RelayError> + Unpin + Send,
    impl Stream<Item = Result<Frame, RelayError>> + Unpin + Send,
)
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Unpin + Send + 'static,
    M: WsMessage + Send + 'static,
    E: Send + 'static,
    RelayError: From<E>,
{
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(RelayError::from)
        .with(|frame: Frame| future::ready(Ok::<M, RelayError>(M::from_frame(frame))));
    let stream = stream.filter_map(|msg| {
        future::ready(match msg {
            Ok(msg) => msg.into_frame().map(Ok),
            Err(e) => Some(Err(RelayError::from(e))),
        })
    });
    (sink, stream)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToUpstream,
    ToBrowser,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::ToUpstream => "browser->proxmox",
            Direction::ToBrowser => "proxmox->browser",
        }
    }
}

/// Why one direction of the relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    PeerClosed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpStats {
    pub frames: u64,
    pub bytes: u64,
    pub end: PumpEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub to_upstream: PumpStats,
    pub to_browser: PumpStats,
}

/// Forward frames from `source` to `sink` until either side ends or the
/// token is cancelled. Cancels the token on exit and hands the sink back.
pub async fn pump<Src, Dst>(
    mut source: Src,
    mut sink: Dst,
    direction: Direction,
    token: &CancellationToken,
) -> (Dst, PumpStats)
where
    Src: Stream<Item = Result<Frame, RelayError>> + Unpin,
    Dst: Sink<Frame, Error = RelayError> + Unpin,
{
    let mut frames = 0u64;
    let mut bytes = 0u64;

    let end = loop {
        let next = tokio::select! {
            _ = token.cancelled() => None,
            next = source.next() => Some(next),
        };
        let frame = match next {
            None => break PumpEnd::Cancelled,
            Some(None) => {
                debug!(direction = direction.as_str(), "Source stream ended");
                break PumpEnd::PeerClosed;
            }
            Some(Some(Err(e))) => {
                warn!(direction = direction.as_str(), "Relay read failed: {}", e);
                break PumpEnd::Failed;
            }
            Some(Some(Ok(Frame::Close(cf)))) => {
                debug!(direction = direction.as_str(), close = ?cf, "Peer closed");
                break PumpEnd::PeerClosed;
            }
            Some(Some(Ok(Frame::Ping(_) | Frame::Pong(_)))) => continue,
            Some(Some(Ok(frame))) => frame,
        };

        let len = frame.len();
        let sent = tokio::select! {
            _ = token.cancelled() => None,
            res = sink.send(frame) => Some(res),
        };
        match sent {
            None => break PumpEnd::Cancelled,
            Some(Err(e)) => {
                warn!(direction = direction.as_str(), "Relay write failed: {}", e);
                break PumpEnd::Failed;
            }
            Some(Ok(())) => {
                frames += 1;
                bytes += len as u64;
                trace!(direction = direction.as_str(), len, "Frame forwarded");
            }
        }
    };

    token.cancel();
    (sink, PumpStats { frames, bytes, end })
}

/// Send a close frame and flush, bounded by `grace`. Errors are ignored; the
/// peer may already be gone.
async fn close_with<Dst>(sink: &mut Dst, code: u16, grace: Duration)
where
    Dst: Sink<Frame, Error = RelayError> + Unpin,
{
    let _ = tokio::time::timeout(grace, async {
        sink.send(Frame::close(code, "")).await?;
        sink.close().await
    })
    .await;
}

/// Bidirectional frame relay between a browser and an upstream socket.
#[derive(Debug, Clone)]
pub struct Relay {
    grace: Duration,
}

impl Relay {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Relay until either side ends or `token` is cancelled, then close both.
    pub async fn run<B, BM, BE, U, UM, UE>(
        &self,
        browser: B,
        upstream: U,
        token: CancellationToken,
    ) -> RelayStats
    where
        B: Stream<Item = Result<BM, BE>> + Sink<BM, Error = BE> + Unpin + Send + 'static,
        BM: WsMessage + Send + 'static,
        BE: Send + 'static,
        RelayError: From<BE>,
        U: Stream<Item = Result<UM, UE>> + Sink<UM, Error = UE> + Unpin + Send + 'static,
        UM: WsMessage + Send + 'static,
        UE: Send + 'static,
        RelayError: From<UE>,
    {
        let (browser_tx, browser_rx) = frames(browser);
        let (upstream_tx, upstream_rx) = frames(upstream);

        let ((mut upstream_tx, to_upstream), (mut browser_tx, to_browser)) = tokio::join!(
            pump(browser_rx, upstream_tx, Direction::ToUpstream, &token),
            pump(upstream_rx, browser_tx, Direction::ToBrowser, &token),
        );

        let code = if to_upstream.end == PumpEnd::Cancelled && to_browser.end == PumpEnd::Cancelled {
            CLOSE_GOING_AWAY
        } else {
            CLOSE_NORMAL
        };
        tokio::join!(
            close_with(&mut upstream_tx, code, self.grace),
            close_with(&mut browser_tx, code, self.grace),
        );

        RelayStats {
            to_upstream,
            to_browser,
        }
    }

    /// Close a browser socket that never got an upstream.
    pub async fn reject<B, BM, BE>(&self, browser: B, code: u16, reason: &str)
    where
        B: Sink<BM, Error = BE> + Unpin,
        BM: WsMessage,
    {
        let mut browser = browser;
        let _ = tokio::time::timeout(self.grace, async {
            browser.send(BM::from_frame(Frame::close(code, reason))).await?;
            browser.close().await
        })
        .await;
    }
}

/// Opens the upstream `vncwebsocket` for a console session.
#[derive(Clone)]
pub struct UpstreamDialer {
    endpoint: ProxmoxEndpoint,
    connector: Option<Connector>,
    timeout: Duration,
}

impl UpstreamDialer {
    pub fn new(endpoint: ProxmoxEndpoint, verify_tls: bool, timeout: Duration) -> Result<Self, RelayError> {
        let connector = if verify_tls {
            None
        } else {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| RelayError::Tls(e.to_string()))?;
            Some(Connector::NativeTls(tls))
        };

        Ok(Self {
            endpoint,
            connector,
            timeout,
        })
    }

    pub async fn dial(&self, session: &ConsoleSession) -> Result<UpstreamSocket, RelayError> {
        let url = self.endpoint.vnc_websocket_url(
            &session.node,
            session.vmid,
            session.proxmox_port,
            &session.ticket,
        );

        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        let cookie = HeaderValue::from_str(&format!("PVEAuthCookie={}", session.auth_cookie.expose()))
            .map_err(|_| RelayError::Dial("auth cookie is not a valid header value".into()))?;
        headers.insert(header::COOKIE, cookie);
        if let Some(csrf) = &session.csrf_token {
            let csrf = HeaderValue::from_str(csrf.expose())
                .map_err(|_| RelayError::Dial("csrf token is not a valid header value".into()))?;
            headers.insert("csrfpreventiontoken", csrf);
        }
        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("binary"));
        let origin = HeaderValue::from_str(&self.endpoint.origin())
            .map_err(|_| RelayError::Dial("invalid origin".into()))?;
        headers.insert(header::ORIGIN, origin);

        debug!(
            node = %session.node,
            vmid = %session.vmid,
            port = session.proxmox_port,
            "Dialing Proxmox vncwebsocket at {}",
            self.endpoint.host_port()
        );

        let connect = tokio_tungstenite::connect_async_tls_with_config(
            request,
            None,
            false,
            self.connector.clone(),
        );
        let (socket, _response) = tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| RelayError::DialTimeout)??;

        info!(node = %session.node, vmid = %session.vmid, "Proxmox vncwebsocket connected");
        Ok(socket)
    }
}

/// Serve one browser connection: dial upstream, relay, tear down.
pub async fn serve_browser(
    socket: WebSocket,
    session: ConsoleSession,
    dialer: UpstreamDialer,
    relay: Relay,
    token: CancellationToken,
) {
    let key = session.key();
    let upstream = tokio::select! {
        _ = token.cancelled() => {
            relay.reject(socket, CLOSE_GOING_AWAY, "shutting down").await;
            return;
        }
        dialed = dialer.dial(&session) => dialed,
    };
    // The ticket is single-use upstream and not needed past the dial.
    drop(session);

    let upstream = match upstream {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(console = %key, "Upstream console unreachable: {}", e);
            relay
                .reject(socket, CLOSE_UPSTREAM_UNAVAILABLE, "upstream unavailable")
                .await;
            return;
        }
    };

    info!(console = %key, "Console relay started");
    let stats = relay.run(socket, upstream, token).await;
    info!(
        console = %key,
        frames_up = stats.to_upstream.frames,
        frames_down = stats.to_browser.frames,
        bytes_up = stats.to_upstream.bytes,
        bytes_down = stats.to_browser.bytes,
        "Console relay ended"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    type Pipe = WebSocketStream<DuplexStream>;

    async fn pipe() -> (Pipe, Pipe) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (client, server)
    }

    /// Browser peer, upstream peer, and the running relay task.
    async fn relay_fixture(
        token: CancellationToken,
    ) -> (Pipe, Pipe, tokio::task::JoinHandle<RelayStats>) {
        let (browser_peer, browser_side) = pipe().await;
        let (upstream_side, upstream_peer) = pipe().await;
        let relay = Relay::new(Duration::from_millis(200));
        let handle = tokio::spawn(async move { relay.run(browser_side, upstream_side, token).await });
        (browser_peer, upstream_peer, handle)
    }

    async fn next_data(ws: &mut Pipe) -> Option<TMessage> {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(TMessage::Ping(_)) | Ok(TMessage::Pong(_)) => continue,
                Ok(msg) => return Some(msg),
                Err(_) => return None,
            }
        }
        None
    }

    #[test]
    fn test_frame_conversion_keeps_kind() {
        let text = TMessage::from_frame(Frame::Text("RFB 003.008\n".into()));
        assert!(matches!(text, TMessage::Text(_)));
        let bin = ws::Message::from_frame(Frame::Binary(vec![1, 2, 3]));
        assert_eq!(bin.into_frame(), Some(Frame::Binary(vec![1, 2, 3])));
        let close = TMessage::from_frame(Frame::close(1011, "upstream unavailable"));
        assert_eq!(close.into_frame(), Some(Frame::close(1011, "upstream unavailable")));
    }

    #[tokio::test]
    async fn test_frames_forwarded_both_ways() {
        let token = CancellationToken::new();
        let (mut browser, mut upstream, handle) = relay_fixture(token.clone()).await;

        browser.send(TMessage::Binary(vec![0x52, 0x46, 0x42])).await.unwrap();
        browser.send(TMessage::Text("hello".into())).await.unwrap();
        assert_eq!(next_data(&mut upstream).await, Some(TMessage::Binary(vec![0x52, 0x46, 0x42])));
        assert_eq!(next_data(&mut upstream).await, Some(TMessage::Text("hello".into())));

        upstream.send(TMessage::Binary(vec![9; 4096])).await.unwrap();
        assert_eq!(next_data(&mut browser).await, Some(TMessage::Binary(vec![9; 4096])));

        token.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(stats.to_upstream.frames, 2);
        assert_eq!(stats.to_browser.frames, 1);
    }

    #[tokio::test]
    async fn test_write_error_ends_pump_as_failed() {
        let token = CancellationToken::new();
        let source = futures::stream::iter(vec![
            Ok(Frame::Binary(vec![1, 2, 3])),
            Ok(Frame::Binary(vec![4, 5, 6])),
        ]);
        let sink = Box::pin(futures::sink::unfold((), |_, _frame: Frame| async {
            Err::<(), _>(RelayError::Upstream(tungstenite::Error::ConnectionClosed))
        }));

        let (_sink, stats) = pump(source, sink, Direction::ToUpstream, &token).await;
        assert_eq!(stats.end, PumpEnd::Failed);
        assert_eq!(stats.frames, 0);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_read_error_ends_pump_as_failed() {
        let token = CancellationToken::new();
        let source = futures::stream::iter(vec![
            Ok(Frame::Text("RFB".into())),
            Err(RelayError::Upstream(tungstenite::Error::ConnectionClosed)),
            Ok(Frame::Text("never".into())),
        ]);
        let sink = futures::sink::drain::<Frame>()
            .sink_map_err(|e: std::convert::Infallible| -> RelayError { match e {} });

        let (_sink, stats) = pump(source, sink, Direction::ToBrowser, &token).await;
        assert_eq!(stats.end, PumpEnd::Failed);
        assert_eq!(stats.frames, 1);
        assert_eq!(stats.bytes, 3);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_pings_are_not_forwarded() {
        let token = CancellationToken::new();
        let (mut browser, mut upstream, handle) = relay_fixture(token.clone()).await;

        browser.send(TMessage::Ping(vec![1])).await.unwrap();
        browser.send(TMessage::Binary(vec![2])).await.unwrap();
        // The first thing upstream sees is the data frame.
        assert_eq!(upstream.next().await.unwrap().unwrap(), TMessage::Binary(vec![2]));

        token.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(stats.to_upstream.frames, 1);
    }

    #[tokio::test]
    async fn test_browser_close_closes_upstream() {
        let token = CancellationToken::new();
        let (mut browser, mut upstream, handle) = relay_fixture(token.clone()).await;

        browser.close(None).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(1), next_data(&mut upstream))
            .await
            .unwrap();
        assert!(matches!(msg, Some(TMessage::Close(_)) | None));

        let stats = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(stats.to_upstream.end, PumpEnd::PeerClosed);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancellation_closes_both_sides() {
        let root = CancellationToken::new();
        let (mut browser, mut upstream, handle) = relay_fixture(root.child_token()).await;

        root.cancel();
        let down = tokio::time::timeout(Duration::from_secs(1), next_data(&mut browser))
            .await
            .unwrap();
        let up = tokio::time::timeout(Duration::from_secs(1), next_data(&mut upstream))
            .await
            .unwrap();
        assert!(matches!(down, Some(TMessage::Close(Some(ref cf))) if u16::from(cf.code) == CLOSE_GOING_AWAY));
        assert!(matches!(up, Some(TMessage::Close(_))));
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reject_sends_error_close() {
        let (mut browser, browser_side) = pipe().await;
        Relay::new(Duration::from_millis(200))
            .reject(browser_side, CLOSE_UPSTREAM_UNAVAILABLE, "upstream unavailable")
            .await;
        match next_data(&mut browser).await {
            Some(TMessage::Close(Some(cf))) => assert_eq!(u16::from(cf.code), CLOSE_UPSTREAM_UNAVAILABLE),
            other => panic!("expected close, got {:?}", other),
        }
    }
}
