//! Single-relay WebSocket link with automatic reconnection.
//!
//! Each link owns one connection to one relay endpoint and is driven by its
//! own tokio task: connect, pump inbound frames to the pool router, and on
//! any failure retry after a fixed interval. Tearing the link down aborts the
//! driver task, which also cancels any pending retry.

use std::{sync::Arc, time::Duration};

use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::{
    error::{Error, Result},
    event::Event,
};

/// Connection state of a link. A link starts connecting as soon as it is
/// created and never gives up; `attempts` counts consecutive failures since
/// the last successful connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected { attempts: u32 },
    Connecting,
    Connected,
}

/// Inbound traffic and status transitions, forwarded to the pool router.
#[derive(Debug)]
pub(crate) enum RouterMsg {
    Connected { url: String },
    Disconnected { url: String },
    Event { url: String, sub_id: String, event: Event },
    Eose { url: String, sub_id: String },
    Notice { url: String, message: String },
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

type WsStream = WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>;
type WsSink = SplitSink<WsStream, Message>;

/// One connection to one relay endpoint.
pub struct RelayLink {
    url: String,
    state: Arc<watch::Sender<LinkState>>,
    sink: Arc<Mutex<Option<WsSink>>>,
    router: mpsc::UnboundedSender<RouterMsg>,
    driver: JoinHandle<()>,
}

impl RelayLink {
    /// Create the link and immediately begin connecting in the background.
    pub(crate) fn open(
        url: String,
        retry: Duration,
        socks: Option<String>,
        router: mpsc::UnboundedSender<RouterMsg>,
    ) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Connecting);
        let state = Arc::new(state_tx);
        let sink: Arc<Mutex<Option<WsSink>>> = Arc::new(Mutex::new(None));
        let driver = tokio::spawn(drive(
            url.clone(),
            retry,
            socks,
            state.clone(),
            sink.clone(),
            router.clone(),
        ));
        Self {
            url,
            state,
            sink,
            router,
            driver,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Watch channel signalled on every state transition.
    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Wait until the current connection attempt has settled either way.
    /// Returns immediately when the link is not mid-attempt.
    pub async fn wait_settled(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s != LinkState::Connecting).await;
    }

    /// Send one frame. Fails with `NotConnected` when there is no live
    /// socket; callers treat that as "this relay did not receive the
    /// message", not as a fatal error.
    pub async fn send(&self, frame: &Value) -> Result<()> {
        let mut guard = self.sink.lock().await;
        match guard.as_mut() {
            Some(sink) => sink
                .send(Message::Text(frame.to_string()))
                .await
                .map_err(|e| Error::Connection(e.to_string())),
            None => Err(Error::NotConnected(self.url.clone())),
        }
    }

    /// Tear the link down: cancel the driver (and any pending retry), drop
    /// the socket, and report the final disconnect.
    pub async fn close(&self) {
        self.driver.abort();
        *self.sink.lock().await = None;
        let attempts = match *self.state.borrow() {
            LinkState::Disconnected { attempts } => attempts,
            _ => 0,
        };
        self.state.send_replace(LinkState::Disconnected { attempts });
        let _ = self.router.send(RouterMsg::Disconnected {
            url: self.url.clone(),
        });
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Per-link connection loop: connect, pump frames, reconnect after `retry`.
async fn drive(
    url: String,
    retry: Duration,
    socks: Option<String>,
    state: Arc<watch::Sender<LinkState>>,
    sink: Arc<Mutex<Option<WsSink>>>,
    router: mpsc::UnboundedSender<RouterMsg>,
) {
    let mut attempts: u32 = 0;
    loop {
        state.send_replace(LinkState::Connecting);
        match connect_ws(&url, socks.as_deref()).await {
            Ok(ws) => {
                let (tx, mut rx) = ws.split();
                *sink.lock().await = Some(tx);
                attempts = 0;
                state.send_replace(LinkState::Connected);
                let _ = router.send(RouterMsg::Connected { url: url.clone() });
                debug!(%url, "relay connected");
                while let Some(msg) = rx.next().await {
                    match msg {
                        Ok(Message::Text(txt)) => {
                            if let Some(routed) = parse_frame(&url, &txt) {
                                let _ = router.send(routed);
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(%url, %e, "relay stream error");
                            break;
                        }
                    }
                }
                *sink.lock().await = None;
                attempts += 1;
                state.send_replace(LinkState::Disconnected { attempts });
                let _ = router.send(RouterMsg::Disconnected { url: url.clone() });
                debug!(%url, "relay disconnected");
            }
            Err(e) => {
                attempts += 1;
                state.send_replace(LinkState::Disconnected { attempts });
                let _ = router.send(RouterMsg::Disconnected { url: url.clone() });
                warn!(%url, %e, attempts, "relay connect failed");
            }
        }
        sleep(retry).await;
    }
}

/// Parse one inbound text frame. Malformed frames are logged and dropped.
fn parse_frame(url: &str, txt: &str) -> Option<RouterMsg> {
    let val: Value = match serde_json::from_str(txt) {
        Ok(v) => v,
        Err(e) => {
            debug!(%url, %e, "dropping malformed frame");
            return None;
        }
    };
    let arr = val.as_array()?;
    match arr.first().and_then(|v| v.as_str()) {
        Some("EVENT") if arr.len() >= 3 => {
            let sub_id = arr[1].as_str()?.to_string();
            match serde_json::from_value::<Event>(arr[2].clone()) {
                Ok(event) => Some(RouterMsg::Event {
                    url: url.to_string(),
                    sub_id,
                    event,
                }),
                Err(e) => {
                    debug!(%url, %e, "dropping malformed event");
                    None
                }
            }
        }
        Some("EOSE") if arr.len() >= 2 => arr[1].as_str().map(|s| RouterMsg::Eose {
            url: url.to_string(),
            sub_id: s.to_string(),
        }),
        Some("NOTICE") => Some(RouterMsg::Notice {
            url: url.to_string(),
            message: arr
                .get(1)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        }),
        _ => {
            debug!(%url, "dropping unrecognized frame");
            None
        }
    }
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(relay: &str, socks: Option<&str>) -> Result<WsStream> {
    let url = Url::parse(relay).map_err(|e| Error::Connection(e.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::Connection("missing host".into()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::Connection("missing port".into()))?;
    let req = relay
        .into_client_request()
        .map_err(|e| Error::Connection(e.to_string()))?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = socks {
        Box::new(
            Socks5Stream::connect(proxy, (host, port))
                .await
                .map_err(|e| Error::Connection(e.to_string()))?,
        )
    } else {
        Box::new(
            TcpStream::connect((host, port))
                .await
                .map_err(|e| Error::Connection(e.to_string()))?,
        )
    };
    let (ws, _) = client_async(req, stream)
        .await
        .map_err(|e| Error::Connection(e.to_string()))?;
    Ok(ws)
}

/// Open and immediately close a connection to check an endpoint is
/// reachable. Used when adding a relay from the CLI.
pub async fn test_connection(url: &str, socks: Option<&str>) -> Result<()> {
    let mut ws = connect_ws(url, socks).await?;
    let _ = ws.close(None).await;
    Ok(())
}
