//! Ordered delivery of engine calls from threads that must not block.
//!
//! UI code enqueues input events; a single pump thread sends them one at a
//! time over a dedicated connection and hands each reply to its callback.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use enginewire_frame::{FrameKind, FrameReader, FrameWriter};
use enginewire_protocol::{EngineCall, Reply};
use enginewire_rpc::{dial, envelope, CallIds, Established, Role, RpcConfig, RpcError};
use enginewire_transport::{Endpoint, IpcStream};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{Result, SessionError};

/// How often an idle pump checks for cancellation.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// How long dispose waits for the engine to acknowledge `Shutdown`.
const SHUTDOWN_ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// Called on the pump thread with the outcome of one call.
pub type OnReply = Box<dyn FnOnce(std::result::Result<Reply, RpcError>) + Send + 'static>;

struct Item {
    call: EngineCall,
    on_reply: Option<OnReply>,
}

struct Wire {
    reader: FrameReader<IpcStream>,
    writer: FrameWriter<IpcStream>,
    ids: CallIds,
    call_timeout: Duration,
}

impl Wire {
    fn call(&mut self, call: &EngineCall) -> std::result::Result<Reply, RpcError> {
        self.call_with_timeout(call, self.call_timeout)
    }

    /// One exchange. Replies to earlier, abandoned calls are skipped.
    fn call_with_timeout(
        &mut self,
        call: &EngineCall,
        timeout: Duration,
    ) -> std::result::Result<Reply, RpcError> {
        let call_id = self.ids.next_id();
        let prefix = envelope::prefix(call_id);
        self.writer
            .send_parts(FrameKind::Call, &[&prefix[..], &call.to_bytes()[..]])
            .map_err(|err| {
                debug!(call = call.name(), error = %err, "queued call write failed");
                RpcError::NotConnected
            })?;

        self.reader.get_ref().set_read_timeout(Some(timeout))?;
        loop {
            let frame = match self.reader.read_frame() {
                Ok(frame) => frame,
                Err(err) if err.is_timeout() => {
                    return Err(RpcError::CallTimedOut {
                        call: call.name(),
                        timeout,
                    });
                }
                Err(err) => {
                    debug!(call = call.name(), error = %err, "queued call read failed");
                    return Err(RpcError::NotConnected);
                }
            };
            let kind = frame.kind;
            let env = envelope::open(frame.payload)?;
            if env.call_id != call_id {
                debug!(stale = env.call_id, current = call_id, "discarding stale reply");
                continue;
            }
            return match kind {
                FrameKind::Reply => Ok(Reply::decode(env.body)?),
                FrameKind::Fault => Err(RpcError::Remote(
                    String::from_utf8_lossy(&env.body).into_owned(),
                )),
                other => {
                    warn!(kind = %other, "ignoring unexpected frame on queue connection");
                    continue;
                }
            };
        }
    }
}

/// A single-consumer queue of engine calls with its own connection.
pub struct DispatchQueue {
    tx: Mutex<Option<Sender<Item>>>,
    cancel: CancelToken,
    broken: Arc<AtomicBool>,
    control: IpcStream,
    endpoint: Endpoint,
    pump: Option<JoinHandle<Option<Wire>>>,
}

impl DispatchQueue {
    /// Dial the engine as a host and start the pump.
    pub fn connect(endpoint: &Endpoint, config: &RpcConfig) -> Result<Self> {
        let established = dial(endpoint, Role::Host, config)?;
        Self::start(endpoint.clone(), established, config.call_timeout)
    }

    /// Start the pump over an established connection.
    pub fn start(endpoint: Endpoint, conn: Established, call_timeout: Duration) -> Result<Self> {
        let Established {
            reader,
            writer,
            control,
            ..
        } = conn;
        let wire = Wire {
            reader,
            writer,
            ids: CallIds::default(),
            call_timeout,
        };

        let (tx, rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let broken = Arc::new(AtomicBool::new(false));

        let pump_cancel = cancel.clone();
        let pump_broken = Arc::clone(&broken);
        let pump = thread::Builder::new()
            .name("enginewire-dispatch".into())
            .spawn(move || pump(wire, rx, &pump_cancel, &pump_broken))
            .map_err(enginewire_transport::TransportError::Io)?;

        info!(%endpoint, "dispatch queue started");
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            cancel,
            broken,
            control,
            endpoint,
            pump: Some(pump),
        })
    }

    /// Queue `call` for delivery after everything queued before it.
    ///
    /// Fails with `NotConnected` once the queue is disposed or its
    /// connection broke.
    pub fn enqueue(&self, call: EngineCall, on_reply: Option<OnReply>) -> Result<()> {
        if self.broken.load(Ordering::Acquire) || self.cancel.is_cancelled() {
            return Err(SessionError::NotConnected);
        }
        let guard = self.tx.lock().map_err(|_| SessionError::NotConnected)?;
        let tx = guard.as_ref().ok_or(SessionError::NotConnected)?;
        tx.send(Item { call, on_reply })
            .map_err(|_| SessionError::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        !self.broken.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    /// Stop the pump, send a final `Shutdown` and close the connection.
    ///
    /// Calls still queued are dropped; their callbacks see `NotConnected`.
    /// Returns whether the engine acknowledged the shutdown. Idempotent.
    pub fn dispose(&mut self) -> bool {
        self.cancel.cancel();
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
        let Some(pump) = self.pump.take() else {
            return false;
        };
        let wire = match pump.join() {
            Ok(wire) => wire,
            Err(_) => {
                warn!("dispatch pump panicked");
                None
            }
        };

        let acknowledged = match wire {
            Some(mut wire) => match wire
                .call_with_timeout(&EngineCall::Shutdown, SHUTDOWN_ACK_TIMEOUT)
            {
                Ok(_) => true,
                Err(err) => {
                    debug!(error = %err, "shutdown on dispose not acknowledged");
                    false
                }
            },
            None => false,
        };
        if let Err(err) = self.control.shutdown() {
            debug!(error = %err, "dispatch stream shutdown failed");
        }
        info!(endpoint = %self.endpoint, acknowledged, "dispatch queue disposed");
        acknowledged
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        if self.pump.is_some() {
            self.dispose();
        }
    }
}

impl fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Returns the connection if it is still usable.
fn pump(
    mut wire: Wire,
    rx: Receiver<Item>,
    cancel: &CancelToken,
    broken: &AtomicBool,
) -> Option<Wire> {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let item = match rx.recv_timeout(IDLE_POLL) {
            Ok(item) => item,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let outcome = wire.call(&item.call);
        if let Err(err) = &outcome {
            if err.is_disconnect() {
                warn!(call = item.call.name(), "dispatch connection lost");
                broken.store(true, Ordering::Release);
                if let Some(on_reply) = item.on_reply {
                    on_reply(Err(RpcError::NotConnected));
                }
                drain(&rx);
                return None;
            }
        }
        if let Some(on_reply) = item.on_reply {
            on_reply(outcome);
        }
    }
    drain(&rx);
    Some(wire)
}

fn drain(rx: &Receiver<Item>) {
    let mut dropped = 0usize;
    while let Ok(item) = rx.try_recv() {
        dropped += 1;
        if let Some(on_reply) = item.on_reply {
            on_reply(Err(RpcError::NotConnected));
        }
    }
    if dropped > 0 {
        debug!(dropped, "dropped queued calls");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use enginewire_protocol::{KeyboardEvent, Resolution};
    use enginewire_rpc::{EngineControls, Handler, HandlerResult, RpcServer};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        shutdowns: AtomicUsize,
    }

    impl EngineControls for Recorder {
        fn get_pixels(&self) -> HandlerResult<bytes::Bytes> {
            Ok(bytes::Bytes::new())
        }
        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        fn keyboard(&self, event: KeyboardEvent) -> HandlerResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("key:{}", event.chars));
            Ok(())
        }
        fn mouse_move(&self, _: enginewire_protocol::MouseMoveEvent) -> HandlerResult<()> {
            Ok(())
        }
        fn mouse_click(&self, _: enginewire_protocol::MouseClickEvent) -> HandlerResult<()> {
            Ok(())
        }
        fn mouse_scroll(&self, _: enginewire_protocol::MouseScrollEvent) -> HandlerResult<()> {
            Ok(())
        }
        fn go_forward(&self) -> HandlerResult<()> {
            Ok(())
        }
        fn go_back(&self) -> HandlerResult<()> {
            Ok(())
        }
        fn refresh(&self) -> HandlerResult<()> {
            Ok(())
        }
        fn load_url(&self, url: &str) -> HandlerResult<()> {
            self.calls.lock().unwrap().push(format!("url:{url}"));
            Ok(())
        }
        fn load_html(&self, _: &str) -> HandlerResult<()> {
            Ok(())
        }
        fn execute_js(&self, _: &str) -> HandlerResult<()> {
            Err("no script engine".into())
        }
        fn resize(&self, _: Resolution) -> HandlerResult<()> {
            Ok(())
        }
    }

    fn engine() -> (Arc<Recorder>, RpcServer) {
        let recorder = Arc::new(Recorder::default());
        let server = RpcServer::bind(
            &Endpoint::tcp(0),
            Handler::Engine(recorder.clone()),
            RpcConfig::default(),
        )
        .unwrap();
        (recorder, server)
    }

    fn key(chars: &str) -> EngineCall {
        EngineCall::Keyboard(KeyboardEvent {
            chars: chars.to_string(),
            ..KeyboardEvent::default()
        })
    }

    #[test]
    fn delivers_in_enqueue_order() {
        let (recorder, server) = engine();
        let mut queue = DispatchQueue::connect(server.endpoint(), &RpcConfig::default()).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        for i in 0..50 {
            let done = done_tx.clone();
            queue
                .enqueue(
                    key(&i.to_string()),
                    Some(Box::new(move |result| {
                        done.send(result.is_ok()).unwrap();
                    })),
                )
                .unwrap();
        }
        for _ in 0..50 {
            assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }

        let expected: Vec<String> = (0..50).map(|i| format!("key:{i}")).collect();
        assert_eq!(*recorder.calls.lock().unwrap(), expected);
        assert!(queue.dispose());
    }

    #[test]
    fn handler_errors_reach_the_callback() {
        let (_recorder, server) = engine();
        let mut queue = DispatchQueue::connect(server.endpoint(), &RpcConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel();
        queue
            .enqueue(
                EngineCall::ExecuteJs("1+1".into()),
                Some(Box::new(move |result| {
                    tx.send(result).unwrap();
                })),
            )
            .unwrap();
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, Err(RpcError::Remote(msg)) if msg.contains("no script engine")));
        queue.dispose();
    }

    #[test]
    fn dispose_sends_shutdown_last() {
        let (recorder, server) = engine();
        let mut queue = DispatchQueue::connect(server.endpoint(), &RpcConfig::default()).unwrap();
        queue.enqueue(EngineCall::LoadUrl("a".into()), None).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(queue.dispose());

        let deadline = Instant::now() + Duration::from_secs(5);
        while recorder.shutdowns.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "engine never saw shutdown");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(
            queue.enqueue(EngineCall::Refresh, None),
            Err(SessionError::NotConnected)
        ));
        // Second dispose is a no-op.
        assert!(!queue.dispose());
    }

    #[test]
    fn engine_gone_breaks_the_queue() {
        let (_recorder, mut server) = engine();
        let queue = DispatchQueue::connect(server.endpoint(), &RpcConfig::default()).unwrap();
        server.shutdown();

        let (tx, rx) = mpsc::channel();
        queue
            .enqueue(
                EngineCall::Refresh,
                Some(Box::new(move |result| {
                    tx.send(result).unwrap();
                })),
            )
            .unwrap();
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, Err(RpcError::NotConnected)));

        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.is_connected() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(
            queue.enqueue(EngineCall::Refresh, None),
            Err(SessionError::NotConnected)
        ));
    }
}
