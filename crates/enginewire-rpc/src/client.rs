//! Blocking request/reply client.
//!
//! One reader thread per connection owns the read half and forwards replies
//! over a channel. Callers hold the call slot for the whole exchange, so
//! concurrent callers are serialized and each one sees exactly its own reply.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use enginewire_frame::{FrameKind, FrameReader, FrameWriter};
use enginewire_protocol::{
    EngineCall, HostNotification, KeyboardEvent, MouseClickEvent, MouseMoveEvent,
    MouseScrollEvent, PopupId, Reply, Resolution,
};
use enginewire_transport::{Endpoint, IpcStream};
use tracing::{debug, info, warn};

use crate::connector::{dial, Established, RpcConfig};
use crate::envelope::{self, CallIds};
use crate::error::{Result, RpcError};
use crate::handshake::Role;

/// Connection state as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connected = 0,
    /// The peer went away or a write failed.
    Disconnected = 1,
    /// Closed locally.
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connected,
            1 => ConnectionState::Disconnected,
            _ => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
        })
    }
}

enum Inbound {
    Reply { call_id: u32, body: Bytes },
    Fault { call_id: u32, message: String },
    Closed,
}

struct CallSlot {
    writer: FrameWriter<IpcStream>,
    replies: Receiver<Inbound>,
    ids: CallIds,
}

struct Inner {
    slot: Mutex<CallSlot>,
    state: AtomicU8,
    control: IpcStream,
    endpoint: Endpoint,
    session_id: String,
    call_timeout: Duration,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Connected -> Disconnected. A local close wins over a later failure.
    fn mark_disconnected(&self) {
        if self
            .state
            .compare_exchange(
                ConnectionState::Connected as u8,
                ConnectionState::Disconnected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            warn!(endpoint = %self.endpoint, "connection lost");
        }
    }
}

/// A connected RPC client.
pub struct RpcClient {
    inner: Arc<Inner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Dial `endpoint` as `role`.
    pub fn connect(endpoint: &Endpoint, role: Role, config: &RpcConfig) -> Result<Self> {
        let established = dial(endpoint, role, config)?;
        Self::from_established(endpoint.clone(), established, config.call_timeout)
    }

    fn from_established(
        endpoint: Endpoint,
        established: Established,
        call_timeout: Duration,
    ) -> Result<Self> {
        let Established {
            reader,
            writer,
            control,
            handshake,
        } = established;
        let (tx, rx) = mpsc::channel();

        let inner = Arc::new(Inner {
            slot: Mutex::new(CallSlot {
                writer,
                replies: rx,
                ids: CallIds::default(),
            }),
            state: AtomicU8::new(ConnectionState::Connected as u8),
            control,
            endpoint,
            session_id: handshake.session_id,
            call_timeout,
        });

        let thread_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("enginewire-rpc-reader".into())
            .spawn(move || read_replies(reader, tx, &thread_inner))
            .map_err(enginewire_transport::TransportError::Io)?;

        Ok(Self {
            inner,
            reader: Mutex::new(Some(handle)),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Identifier the server assigned during the handshake.
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn call_timeout(&self) -> Duration {
        self.inner.call_timeout
    }

    /// Send one call body and block for its reply body.
    ///
    /// `name` only labels errors and logs.
    pub fn call_raw(&self, name: &'static str, body: &[u8]) -> Result<Bytes> {
        self.call_raw_with_timeout(name, body, self.inner.call_timeout)
    }

    pub fn call_raw_with_timeout(
        &self,
        name: &'static str,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Bytes> {
        let mut slot = self.lock_slot()?;
        if self.state() != ConnectionState::Connected {
            return Err(RpcError::NotConnected);
        }

        let call_id = slot.ids.next_id();
        let prefix = envelope::prefix(call_id);
        if let Err(err) = slot.writer.send_parts(FrameKind::Call, &[&prefix[..], body]) {
            debug!(call = name, error = %err, "call write failed");
            self.inner.mark_disconnected();
            return Err(RpcError::NotConnected);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match slot.replies.recv_timeout(remaining) {
                Ok(Inbound::Reply { call_id: id, body }) if id == call_id => return Ok(body),
                Ok(Inbound::Fault { call_id: id, message }) if id == call_id => {
                    return Err(RpcError::Remote(message));
                }
                Ok(Inbound::Reply { call_id: id, .. }) | Ok(Inbound::Fault { call_id: id, .. }) => {
                    debug!(call = name, stale = id, current = call_id, "discarding stale reply");
                }
                Ok(Inbound::Closed) | Err(RecvTimeoutError::Disconnected) => {
                    self.inner.mark_disconnected();
                    return Err(RpcError::NotConnected);
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(call = name, ?timeout, "call timed out");
                    return Err(RpcError::CallTimedOut {
                        call: name,
                        timeout,
                    });
                }
            }
        }
    }

    /// Send a message nobody replies to.
    pub fn notify_raw(&self, body: &[u8]) -> Result<()> {
        let mut slot = self.lock_slot()?;
        if self.state() != ConnectionState::Connected {
            return Err(RpcError::NotConnected);
        }
        if let Err(err) = slot.writer.send(FrameKind::Notify, body) {
            debug!(error = %err, "notify write failed");
            self.inner.mark_disconnected();
            return Err(RpcError::NotConnected);
        }
        Ok(())
    }

    /// Close the connection and stop the reader thread. Idempotent.
    pub fn close(&self) {
        self.inner
            .state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        if let Err(err) = self.inner.control.shutdown() {
            debug!(error = %err, "shutdown of rpc stream failed");
        }
        let handle = match self.reader.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("rpc reader thread panicked");
            }
            info!(endpoint = %self.inner.endpoint, "rpc client closed");
        }
    }

    fn lock_slot(&self) -> Result<std::sync::MutexGuard<'_, CallSlot>> {
        self.inner.slot.lock().map_err(|_| RpcError::NotConnected)
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("endpoint", &self.inner.endpoint)
            .field("session_id", &self.inner.session_id)
            .field("state", &self.state())
            .finish()
    }
}

fn read_replies(mut reader: FrameReader<IpcStream>, tx: Sender<Inbound>, inner: &Inner) {
    loop {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(err) => {
                debug!(endpoint = %inner.endpoint, error = %err, "rpc reader stopping");
                break;
            }
        };

        let inbound = match frame.kind {
            FrameKind::Reply | FrameKind::Fault => match envelope::open(frame.payload) {
                Ok(env) if frame.kind == FrameKind::Reply => Inbound::Reply {
                    call_id: env.call_id,
                    body: env.body,
                },
                Ok(env) => Inbound::Fault {
                    call_id: env.call_id,
                    message: String::from_utf8_lossy(&env.body).into_owned(),
                },
                Err(err) => {
                    warn!(error = %err, "dropping reply without call id");
                    continue;
                }
            },
            other => {
                warn!(kind = %other, "ignoring unexpected frame on client connection");
                continue;
            }
        };

        if tx.send(inbound).is_err() {
            return;
        }
    }

    inner.mark_disconnected();
    let _ = tx.send(Inbound::Closed);
}

/// Host-side view of an engine: one method per engine call.
#[derive(Debug)]
pub struct EngineClient {
    rpc: RpcClient,
}

impl EngineClient {
    /// Connect to an engine's control endpoint.
    pub fn connect(endpoint: &Endpoint, config: &RpcConfig) -> Result<Self> {
        RpcClient::connect(endpoint, Role::Host, config).map(Self::from_rpc)
    }

    pub fn from_rpc(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub fn is_connected(&self) -> bool {
        self.rpc.is_connected()
    }

    /// Send any call and return the decoded reply.
    pub fn call(&self, call: &EngineCall) -> Result<Reply> {
        let body = call.to_bytes();
        let raw = self.rpc.call_raw(call.name(), &body)?;
        Ok(Reply::decode(raw)?)
    }

    fn ack(&self, call: EngineCall) -> Result<()> {
        match self.call(&call)? {
            Reply::Ack => Ok(()),
            other => Err(unexpected(&call, &other)),
        }
    }

    /// Current frame; empty while the engine has nothing painted.
    pub fn get_pixels(&self) -> Result<Bytes> {
        let call = EngineCall::GetPixels;
        match self.call(&call)? {
            Reply::Pixels(pixels) => Ok(pixels),
            other => Err(unexpected(&call, &other)),
        }
    }

    /// Ask the engine to exit. Returns once the engine acknowledged.
    pub fn shutdown(&self) -> Result<()> {
        self.ack(EngineCall::Shutdown)
    }

    pub fn keyboard(&self, event: KeyboardEvent) -> Result<()> {
        self.ack(EngineCall::Keyboard(event))
    }

    pub fn mouse_move(&self, event: MouseMoveEvent) -> Result<()> {
        self.ack(EngineCall::MouseMove(event))
    }

    pub fn mouse_click(&self, event: MouseClickEvent) -> Result<()> {
        self.ack(EngineCall::MouseClick(event))
    }

    pub fn mouse_scroll(&self, event: MouseScrollEvent) -> Result<()> {
        self.ack(EngineCall::MouseScroll(event))
    }

    pub fn go_forward(&self) -> Result<()> {
        self.ack(EngineCall::GoForward)
    }

    pub fn go_back(&self) -> Result<()> {
        self.ack(EngineCall::GoBack)
    }

    pub fn refresh(&self) -> Result<()> {
        self.ack(EngineCall::Refresh)
    }

    pub fn load_url(&self, url: &str) -> Result<()> {
        self.ack(EngineCall::LoadUrl(url.to_string()))
    }

    pub fn load_html(&self, html: &str) -> Result<()> {
        self.ack(EngineCall::LoadHtml(html.to_string()))
    }

    pub fn execute_js(&self, js: &str) -> Result<()> {
        self.ack(EngineCall::ExecuteJs(js.to_string()))
    }

    pub fn resize(&self, resolution: Resolution) -> Result<()> {
        self.ack(EngineCall::Resize(resolution))
    }

    pub fn scroll_position(&self) -> Result<(f32, f32)> {
        let call = EngineCall::GetScrollPosition;
        match self.call(&call)? {
            Reply::ScrollPosition { x, y } => Ok((x, y)),
            other => Err(unexpected(&call, &other)),
        }
    }

    pub fn set_zoom_level(&self, level: f64) -> Result<()> {
        self.ack(EngineCall::SetZoomLevel(level))
    }

    pub fn zoom_level(&self) -> Result<f64> {
        let call = EngineCall::GetZoomLevel;
        match self.call(&call)? {
            Reply::ZoomLevel(level) => Ok(level),
            other => Err(unexpected(&call, &other)),
        }
    }

    pub fn open_dev_tools(&self) -> Result<()> {
        self.ack(EngineCall::OpenDevTools)
    }

    pub fn set_audio_muted(&self, muted: bool) -> Result<()> {
        self.ack(EngineCall::AudioMute(muted))
    }

    pub fn popup_execute_js(&self, popup: PopupId, js: &str) -> Result<()> {
        self.ack(EngineCall::PopupExecuteJs {
            popup,
            js: js.to_string(),
        })
    }

    pub fn popup_close(&self, popup: PopupId) -> Result<()> {
        self.ack(EngineCall::PopupClose(popup))
    }

    pub fn close(&self) {
        self.rpc.close();
    }
}

fn unexpected(call: &EngineCall, reply: &Reply) -> RpcError {
    RpcError::UnexpectedReply {
        call: call.name(),
        reply: reply.name(),
    }
}

/// Engine-side sender of lifecycle events to the host.
///
/// A disabled notifier (no host endpoint) fails every send with
/// `NotConnected`, which callers are expected to log and ignore.
#[derive(Debug, Default)]
pub struct HostNotifier {
    rpc: Option<RpcClient>,
}

impl HostNotifier {
    /// Connect to the host's notification endpoint.
    pub fn connect(endpoint: &Endpoint, config: &RpcConfig) -> Result<Self> {
        let rpc = RpcClient::connect(endpoint, Role::Engine, config)?;
        Ok(Self { rpc: Some(rpc) })
    }

    pub fn disabled() -> Self {
        Self { rpc: None }
    }

    pub fn is_connected(&self) -> bool {
        self.rpc.as_ref().is_some_and(RpcClient::is_connected)
    }

    pub fn notify(&self, notification: &HostNotification) -> Result<()> {
        let rpc = self.rpc.as_ref().ok_or(RpcError::NotConnected)?;
        debug!(notification = notification.name(), "notify host");
        rpc.notify_raw(&notification.to_bytes())
    }

    pub fn ready(&self) -> Result<()> {
        self.notify(&HostNotification::Ready)
    }

    pub fn url_change(&self, url: &str) -> Result<()> {
        self.notify(&HostNotification::UrlChange(url.to_string()))
    }

    pub fn load_start(&self, url: &str) -> Result<()> {
        self.notify(&HostNotification::LoadStart(url.to_string()))
    }

    pub fn load_finish(&self, url: &str) -> Result<()> {
        self.notify(&HostNotification::LoadFinish(url.to_string()))
    }

    pub fn title_change(&self, title: &str) -> Result<()> {
        self.notify(&HostNotification::TitleChange(title.to_string()))
    }

    pub fn progress_change(&self, progress: f64) -> Result<()> {
        self.notify(&HostNotification::ProgressChange(progress))
    }

    pub fn fullscreen(&self, fullscreen: bool) -> Result<()> {
        self.notify(&HostNotification::Fullscreen(fullscreen))
    }

    pub fn input_focus_change(&self, focused: bool) -> Result<()> {
        self.notify(&HostNotification::InputFocusChange(focused))
    }

    pub fn popup(&self, popup: PopupId, url: &str) -> Result<()> {
        self.notify(&HostNotification::Popup {
            popup,
            url: url.to_string(),
        })
    }

    pub fn popup_destroyed(&self, popup: PopupId) -> Result<()> {
        self.notify(&HostNotification::PopupDestroyed(popup))
    }

    pub fn close(&self) {
        if let Some(rpc) = &self.rpc {
            rpc.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use enginewire_transport::listen;

    use super::*;
    use crate::connector::admit;

    /// Accepts one host connection and answers calls with `respond`.
    fn fake_engine<F>(respond: F) -> (Endpoint, JoinHandle<()>)
    where
        F: Fn(u32, EngineCall, &mut FrameWriter<IpcStream>) + Send + 'static,
    {
        let acceptor = listen(&Endpoint::tcp(0)).expect("listen");
        let endpoint = acceptor.endpoint().clone();
        let handle = thread::spawn(move || {
            let mut conn =
                admit(&acceptor, Role::Host, "fake-1", &RpcConfig::default()).expect("admit");
            while let Ok(frame) = conn.reader.read_frame() {
                let env = envelope::open(frame.payload).expect("envelope");
                let call = EngineCall::decode(env.body).expect("call");
                respond(env.call_id, call, &mut conn.writer);
            }
        });
        (endpoint, handle)
    }

    fn reply(writer: &mut FrameWriter<IpcStream>, call_id: u32, reply: &Reply) {
        writer
            .send_parts(FrameKind::Reply, &[&envelope::prefix(call_id)[..], &reply.to_bytes()[..]])
            .expect("reply");
    }

    #[test]
    fn calls_get_their_own_replies() {
        let (endpoint, server) = fake_engine(|id, call, writer| match call {
            EngineCall::GetPixels => reply(writer, id, &Reply::Pixels(Bytes::from_static(&[9; 8]))),
            _ => reply(writer, id, &Reply::Ack),
        });
        let client = EngineClient::connect(&endpoint, &RpcConfig::default()).expect("connect");
        assert_eq!(client.rpc().session_id(), "fake-1");

        client.load_url("https://example.com").expect("load_url");
        assert_eq!(client.get_pixels().expect("pixels").len(), 8);

        client.close();
        assert_eq!(client.rpc().state(), ConnectionState::Closed);
        server.join().expect("server");
    }

    #[test]
    fn slow_reply_times_out_and_is_discarded_later() {
        let (endpoint, server) = fake_engine(|id, call, writer| {
            if call == EngineCall::Refresh {
                thread::sleep(Duration::from_millis(300));
            }
            reply(writer, id, &Reply::Ack);
        });
        let config = RpcConfig::default().with_call_timeout(Duration::from_millis(100));
        let client = EngineClient::connect(&endpoint, &config).expect("connect");

        let err = client.refresh().expect_err("should time out");
        assert!(matches!(err, RpcError::CallTimedOut { call: "refresh", .. }));
        assert!(client.is_connected());

        thread::sleep(Duration::from_millis(300));
        // The late Ack for refresh is still queued; it must not answer this call.
        let config_timeout = client.rpc().call_timeout();
        assert_eq!(config_timeout, Duration::from_millis(100));
        client.go_back().expect("next call still works");

        drop(client);
        server.join().expect("server");
    }

    #[test]
    fn fault_becomes_remote_error() {
        let (endpoint, server) = fake_engine(|id, _, writer| {
            writer
                .send_parts(FrameKind::Fault, &[&envelope::prefix(id)[..], &b"no page"[..]])
                .expect("fault");
        });
        let client = EngineClient::connect(&endpoint, &RpcConfig::default()).expect("connect");
        match client.go_forward() {
            Err(RpcError::Remote(message)) => assert_eq!(message, "no page"),
            other => panic!("expected remote error, got {other:?}"),
        }
        drop(client);
        server.join().expect("server");
    }

    #[test]
    fn wrong_reply_kind_is_reported() {
        let (endpoint, server) =
            fake_engine(|id, _, writer| reply(writer, id, &Reply::ZoomLevel(1.0)));
        let client = EngineClient::connect(&endpoint, &RpcConfig::default()).expect("connect");
        assert!(matches!(
            client.get_pixels(),
            Err(RpcError::UnexpectedReply {
                call: "get_pixels",
                reply: "zoom_level"
            })
        ));
        drop(client);
        server.join().expect("server");
    }

    #[test]
    fn peer_exit_turns_into_not_connected() {
        let (endpoint, server) = fake_engine(|_, _, writer| {
            let _ = writer.get_ref().shutdown();
        });
        let client = EngineClient::connect(&endpoint, &RpcConfig::default()).expect("connect");
        assert!(matches!(client.refresh(), Err(RpcError::NotConnected)));
        assert_eq!(client.rpc().state(), ConnectionState::Disconnected);
        assert!(matches!(client.go_back(), Err(RpcError::NotConnected)));
        server.join().expect("server");
    }

    #[test]
    fn disabled_notifier_is_not_connected() {
        let notifier = HostNotifier::disabled();
        assert!(!notifier.is_connected());
        assert!(matches!(notifier.ready(), Err(RpcError::NotConnected)));
    }
}
