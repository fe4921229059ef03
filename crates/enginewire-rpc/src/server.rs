//! Listening side of an RPC endpoint.
//!
//! The engine serves host calls; the host serves engine notifications. Both
//! run the same accept loop with a different [`Handler`].

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use enginewire_frame::{Frame, FrameKind, FrameWriter};
use enginewire_protocol::{EngineCall, HostNotification, Reply};
use enginewire_transport::{listen, Acceptor, Endpoint, IpcStream};
use tracing::{debug, info, warn};

use crate::connector::{admit_stream, Established, RpcConfig};
use crate::controls::{dispatch_call, dispatch_notification, EngineControls, HostEvents};
use crate::envelope;
use crate::error::Result;
use crate::handshake::Role;

/// What a server does with inbound frames.
#[derive(Clone)]
pub enum Handler {
    /// Answer host calls. Admits only hosts.
    Engine(Arc<dyn EngineControls>),
    /// Receive engine notifications. Admits only engines.
    Host(Arc<dyn HostEvents>),
}

impl Handler {
    fn peer_role(&self) -> Role {
        match self {
            Handler::Engine(_) => Role::Host,
            Handler::Host(_) => Role::Engine,
        }
    }
}

struct Connection {
    id: u64,
    control: IpcStream,
    thread: JoinHandle<()>,
}

struct Shared {
    acceptor: Acceptor,
    handler: Handler,
    config: RpcConfig,
    stopping: AtomicBool,
    next_session: AtomicU64,
    live: AtomicUsize,
    connections: Mutex<Vec<Connection>>,
}

/// A bound endpoint with its accept thread.
pub struct RpcServer {
    shared: Arc<Shared>,
    endpoint: Endpoint,
    accept_thread: Option<JoinHandle<()>>,
}

impl RpcServer {
    /// Bind `endpoint` and start accepting.
    ///
    /// For TCP port 0, [`RpcServer::endpoint`] reports the port actually bound.
    pub fn bind(endpoint: &Endpoint, handler: Handler, config: RpcConfig) -> Result<Self> {
        let acceptor = listen(endpoint)?;
        let bound = acceptor.endpoint().clone();
        info!(endpoint = %bound, admits = %handler.peer_role(), "rpc server listening");

        let shared = Arc::new(Shared {
            acceptor,
            handler,
            config,
            stopping: AtomicBool::new(false),
            next_session: AtomicU64::new(1),
            live: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_thread = thread::Builder::new()
            .name("enginewire-rpc-accept".into())
            .spawn(move || accept_loop(&accept_shared))
            .map_err(enginewire_transport::TransportError::Io)?;

        Ok(Self {
            shared,
            endpoint: bound,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Connections that completed the handshake and are still open.
    pub fn connection_count(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Stop accepting, drop every connection and join all threads.
    pub fn shutdown(&mut self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.acceptor.wake();
        if let Some(handle) = self.accept_thread.take() {
            if handle.join().is_err() {
                warn!("rpc accept thread panicked");
            }
        }

        let connections = match self.shared.connections.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for conn in &connections {
            let _ = conn.control.shutdown();
        }
        for conn in connections {
            if conn.thread.join().is_err() {
                warn!("rpc connection thread panicked");
            }
        }
        info!(endpoint = %self.endpoint, "rpc server stopped");
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(shared: &Arc<Shared>) {
    loop {
        let stream = match shared.acceptor.accept() {
            Ok(stream) => stream,
            Err(err) => {
                if shared.stopping.load(Ordering::Acquire) {
                    return;
                }
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        if shared.stopping.load(Ordering::Acquire) {
            let _ = stream.shutdown();
            return;
        }

        let n = shared.next_session.fetch_add(1, Ordering::Relaxed);
        let session_id = format!("{}-{n}", std::process::id());
        if let Err(err) = spawn_connection(shared, stream, n, session_id) {
            warn!(error = %err, "could not start connection thread");
        }
    }
}

/// Hand a raw stream to its own thread, which runs the handshake and then
/// serves it. A silent peer only ever stalls its own thread.
fn spawn_connection(
    shared: &Arc<Shared>,
    stream: IpcStream,
    id: u64,
    session_id: String,
) -> Result<()> {
    let control = stream.try_clone()?;
    let closer = control.try_clone()?;
    let conn_shared = Arc::clone(shared);

    let thread = thread::Builder::new()
        .name(format!("enginewire-rpc-{session_id}"))
        .spawn(move || {
            run_connection(&conn_shared, stream, &session_id);
            // Close exactly once, from this side, so the peer sees end-of-stream.
            let _ = closer.shutdown();
            forget_connection(&conn_shared, id);
        })
        .map_err(enginewire_transport::TransportError::Io)?;

    let mut connections = shared
        .connections
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    connections.retain(|c| !c.thread.is_finished());
    connections.push(Connection { id, control, thread });
    Ok(())
}

fn run_connection(shared: &Shared, stream: IpcStream, session_id: &str) {
    let peer = stream.peer();
    let conn = match admit_stream(stream, shared.handler.peer_role(), session_id, &shared.config) {
        Ok(conn) => conn,
        Err(err) => {
            warn!(%peer, error = %err, "rejected connection");
            return;
        }
    };
    info!(%peer, %session_id, "peer admitted");

    shared.live.fetch_add(1, Ordering::AcqRel);
    serve(conn, &shared.handler, session_id);
    shared.live.fetch_sub(1, Ordering::AcqRel);
}

fn forget_connection(shared: &Shared, id: u64) {
    let mut connections = shared
        .connections
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    // Dropping our own handle detaches this thread, which is about to return.
    connections.retain(|c| c.id != id);
}

fn serve(conn: Established, handler: &Handler, session_id: &str) {
    let Established {
        mut reader,
        mut writer,
        ..
    } = conn;
    loop {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%session_id, error = %err, "connection closed");
                return;
            }
        };
        let keep_going = match handler {
            Handler::Engine(controls) => answer_call(controls.as_ref(), frame, &mut writer),
            Handler::Host(events) => accept_notification(events.as_ref(), frame, &mut writer),
        };
        if !keep_going {
            info!(%session_id, "connection finished");
            return;
        }
    }
}

/// Returns whether the connection should stay open.
fn answer_call(
    controls: &dyn EngineControls,
    frame: Frame,
    writer: &mut FrameWriter<IpcStream>,
) -> bool {
    if frame.kind != FrameKind::Call {
        warn!(kind = %frame.kind, "engine ignores non-call frame");
        return true;
    }
    let env = match envelope::open(frame.payload) {
        Ok(env) => env,
        Err(err) => {
            warn!(error = %err, "call without call id");
            return true;
        }
    };

    let call = match EngineCall::decode(env.body) {
        Ok(call) => call,
        Err(err) => return send_fault(writer, env.call_id, &err.to_string()),
    };
    let name = call.name();
    debug!(call = name, call_id = env.call_id, "dispatching call");

    if call == EngineCall::Shutdown {
        // The host must have its Ack before the engine starts tearing down.
        let sent = send_reply(writer, env.call_id, &Reply::Ack);
        controls.shutdown();
        return sent;
    }

    match dispatch_call(controls, call) {
        Ok(reply) => send_reply(writer, env.call_id, &reply),
        Err(err) => {
            debug!(call = name, error = %err, "handler failed");
            send_fault(writer, env.call_id, &err.0)
        }
    }
}

fn accept_notification(
    events: &dyn HostEvents,
    frame: Frame,
    writer: &mut FrameWriter<IpcStream>,
) -> bool {
    match frame.kind {
        FrameKind::Notify => {
            match HostNotification::decode(frame.payload) {
                Ok(notification) => {
                    debug!(notification = notification.name(), "engine notification");
                    dispatch_notification(events, notification);
                }
                Err(err) => warn!(error = %err, "dropping notification"),
            }
            true
        }
        FrameKind::Call => match envelope::open(frame.payload) {
            Ok(env) => send_fault(writer, env.call_id, "host does not accept calls"),
            Err(_) => true,
        },
        other => {
            warn!(kind = %other, "host ignores frame");
            true
        }
    }
}

fn send_reply(writer: &mut FrameWriter<IpcStream>, call_id: u32, reply: &Reply) -> bool {
    let body = reply.to_bytes();
    send_enveloped(writer, FrameKind::Reply, call_id, &body)
}

fn send_fault(writer: &mut FrameWriter<IpcStream>, call_id: u32, message: &str) -> bool {
    send_enveloped(writer, FrameKind::Fault, call_id, message.as_bytes())
}

fn send_enveloped(
    writer: &mut FrameWriter<IpcStream>,
    kind: FrameKind,
    call_id: u32,
    body: &[u8],
) -> bool {
    let prefix = envelope::prefix(call_id);
    match writer.send_parts(kind, &[&prefix[..], body]) {
        Ok(()) => true,
        Err(err) => {
            debug!(error = %err, "write to peer failed");
            false
        }
    }
}
