//! The embedding application's handle on one engine.
//!
//! Start order: bind the notification listener, spawn the engine, wait for
//! `Ready`, connect the command client, then start the frame pipeline, the
//! input queue and the crash watchdog. Shutdown runs the reverse, ending in
//! a kill of the whole engine tree.

use std::fmt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use enginewire_process::{spawn, EngineProcess, EngineState};
use enginewire_protocol::{EngineCall, PopupId, Resolution};
use enginewire_rpc::{EngineClient, Handler, HostEvents, RpcServer};
use enginewire_transport::Endpoint;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::config::{
    check_resolution, resolve_engine_location, resolve_host_location, HostConfig,
};
use crate::dispatch::{DispatchQueue, OnReply};
use crate::error::{Result, SessionError};
use crate::pipeline::{Frame, FramePipeline, PipelineStats};
use crate::readiness::Readiness;

/// Slice of the readiness wait between liveness checks.
const READY_POLL: Duration = Duration::from_millis(50);

/// Flips readiness on `Ready`, then forwards everything to the application.
struct ReadinessEvents {
    readiness: Readiness,
    inner: Box<dyn HostEvents>,
}

impl HostEvents for ReadinessEvents {
    fn url_change(&self, url: &str) {
        self.inner.url_change(url);
    }
    fn load_start(&self, url: &str) {
        self.inner.load_start(url);
    }
    fn load_finish(&self, url: &str) {
        self.inner.load_finish(url);
    }
    fn title_change(&self, title: &str) {
        self.inner.title_change(title);
    }
    fn progress_change(&self, progress: f64) {
        self.inner.progress_change(progress);
    }
    fn fullscreen(&self, fullscreen: bool) {
        self.inner.fullscreen(fullscreen);
    }
    fn input_focus_change(&self, focused: bool) {
        self.inner.input_focus_change(focused);
    }
    fn popup(&self, popup: PopupId, url: &str) {
        self.inner.popup(popup, url);
    }
    fn popup_destroyed(&self, popup: PopupId) {
        self.inner.popup_destroyed(popup);
    }
    fn ready(&self) {
        // Duplicate Ready notifications are forwarded only once.
        if self.readiness.mark_ready() {
            self.inner.ready();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A running engine with its connections and worker threads.
pub struct HostSession {
    process: Arc<Mutex<EngineProcess>>,
    pid: u32,
    client: Arc<EngineClient>,
    pipeline: Mutex<Option<FramePipeline>>,
    queue: Mutex<Option<DispatchQueue>>,
    notifications: Mutex<Option<RpcServer>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    readiness: Readiness,
    cancel: CancelToken,
    crashed: Arc<AtomicBool>,
    closed: AtomicBool,
    engine_endpoint: Endpoint,
    host_endpoint: Endpoint,
    shutdown_grace: Duration,
    max_payload: usize,
}

impl HostSession {
    /// Launch an engine and block until it is ready.
    ///
    /// On Linux the engine is tied to the calling thread's lifetime, so call
    /// this from a thread that outlives the session. On `ReadinessTimeout`
    /// or any later startup failure the engine tree has already been killed.
    pub fn start(config: HostConfig, events: Box<dyn HostEvents>) -> Result<Self> {
        config.validate()?;
        let mut settings = config.settings.clone();

        let readiness = Readiness::new();
        let handler = Handler::Host(Arc::new(ReadinessEvents {
            readiness: readiness.clone(),
            inner: events,
        }));

        settings.out_location = resolve_host_location(settings.transport, &settings.out_location);
        let notifications =
            RpcServer::bind(&settings.host_endpoint()?, handler, config.rpc.clone())?;
        let host_endpoint = notifications.endpoint().clone();
        settings.out_location = host_endpoint.location();
        settings.in_location = resolve_engine_location(settings.transport, &settings.in_location)?;
        let engine_endpoint = settings.engine_endpoint()?;

        let mut args = config.leading_args.clone();
        args.extend(settings.to_args());
        args.extend(config.extra_args.iter().cloned());
        let mut process = spawn(
            &config.engine_path,
            &args,
            config.workdir.as_deref(),
            Arc::clone(&config.log_sink),
        )?;
        process.set_kill_grace(config.kill_grace);
        info!(
            pid = process.pid(),
            engine = %engine_endpoint,
            host = %host_endpoint,
            "engine launched"
        );

        if let Err(err) = wait_ready(&mut process, &readiness, config.readiness_timeout) {
            abort(&mut process);
            return Err(err);
        }

        let connected = connect(&mut process, &engine_endpoint, &config);
        let (client, queue) = match connected {
            Ok(parts) => parts,
            Err(err) => {
                abort(&mut process);
                return Err(err);
            }
        };

        let client = Arc::new(client);
        let cancel = CancelToken::new();
        let pipeline = match FramePipeline::start(
            client.clone(),
            settings.resolution,
            config.frame_interval(),
            readiness.clone(),
            cancel.clone(),
        ) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                abort(&mut process);
                return Err(err);
            }
        };

        let pid = process.pid();
        let process = Arc::new(Mutex::new(process));
        let crashed = Arc::new(AtomicBool::new(false));
        let watchdog = {
            let process = Arc::clone(&process);
            let client = Arc::clone(&client);
            let cancel = cancel.clone();
            let crashed = Arc::clone(&crashed);
            let interval = config.watchdog_interval;
            thread::Builder::new()
                .name("enginewire-watchdog".into())
                .spawn(move || watch(&process, &client, &cancel, &crashed, interval))
                .map_err(enginewire_transport::TransportError::Io)?
        };

        Ok(Self {
            process,
            pid,
            client,
            pipeline: Mutex::new(Some(pipeline)),
            queue: Mutex::new(queue),
            notifications: Mutex::new(Some(notifications)),
            watchdog: Mutex::new(Some(watchdog)),
            readiness,
            cancel,
            crashed,
            closed: AtomicBool::new(false),
            engine_endpoint,
            host_endpoint,
            shutdown_grace: config.shutdown_grace,
            max_payload: config.rpc.frame.max_payload_size,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn engine_endpoint(&self) -> &Endpoint {
        &self.engine_endpoint
    }

    pub fn host_endpoint(&self) -> &Endpoint {
        &self.host_endpoint
    }

    pub fn state(&self) -> EngineState {
        lock(&self.process).state()
    }

    pub fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    /// Whether the engine exited without being asked to.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::Acquire)
    }

    /// Whether commands can currently reach the engine.
    pub fn is_connected(&self) -> bool {
        self.readiness.is_ready()
            && !self.has_crashed()
            && !self.closed.load(Ordering::Acquire)
            && self.client.is_connected()
    }

    /// The command client, once the engine is ready and still connected.
    pub fn engine(&self) -> Result<&EngineClient> {
        if self.is_connected() {
            Ok(&self.client)
        } else {
            Err(SessionError::NotConnected)
        }
    }

    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        lock(&self.pipeline).as_ref().and_then(FramePipeline::latest_frame)
    }

    pub fn frame_stats(&self) -> PipelineStats {
        lock(&self.pipeline)
            .as_ref()
            .map(FramePipeline::stats)
            .unwrap_or_default()
    }

    pub fn resolution(&self) -> Option<Resolution> {
        lock(&self.pipeline).as_ref().map(FramePipeline::resolution)
    }

    /// Resize the surface. No frame of the old size is visible afterwards.
    ///
    /// Sizes whose frames could not be sent back are refused before the
    /// engine is asked.
    pub fn resize(&self, resolution: Resolution) -> Result<()> {
        check_resolution(resolution, self.max_payload)?;
        self.engine()?;
        let pipeline = lock(&self.pipeline);
        let pipeline = pipeline.as_ref().ok_or(SessionError::NotConnected)?;
        pipeline.resize(resolution)
    }

    pub fn load_url(&self, url: &str) -> Result<()> {
        Ok(self.engine()?.load_url(url)?)
    }

    pub fn load_html(&self, html: &str) -> Result<()> {
        Ok(self.engine()?.load_html(html)?)
    }

    pub fn execute_js(&self, js: &str) -> Result<()> {
        Ok(self.engine()?.execute_js(js)?)
    }

    /// Run script in a popup announced through [`HostEvents::popup`].
    pub fn popup_execute_js(&self, popup: PopupId, js: &str) -> Result<()> {
        Ok(self.engine()?.popup_execute_js(popup, js)?)
    }

    pub fn popup_close(&self, popup: PopupId) -> Result<()> {
        Ok(self.engine()?.popup_close(popup)?)
    }

    /// Queue an input event. Delivered in order on the input connection, or
    /// synchronously on the command connection when the queue is disabled.
    pub fn send_input(&self, call: EngineCall, on_reply: Option<OnReply>) -> Result<()> {
        let client = self.engine()?;
        let queue = lock(&self.queue);
        match queue.as_ref() {
            Some(queue) => queue.enqueue(call, on_reply),
            None => {
                let outcome = client.call(&call);
                if let Err(err) = &outcome {
                    debug!(call = call.name(), error = %err, "input call failed");
                }
                if let Some(on_reply) = on_reply {
                    on_reply(outcome);
                }
                Ok(())
            }
        }
    }

    /// Stop the engine and everything the session started. Idempotent.
    ///
    /// Order: stop polling, send `Shutdown`, close connections, give the
    /// engine `shutdown_grace` to exit, then kill the tree regardless.
    pub fn shutdown(&self) -> Result<Option<ExitStatus>> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(lock(&self.process).exit_status());
        }
        info!(pid = self.pid, "shutting down engine");
        self.cancel.cancel();
        if let Some(mut pipeline) = lock(&self.pipeline).take() {
            pipeline.stop();
        }
        if let Some(handle) = lock(&self.watchdog).take() {
            if handle.join().is_err() {
                warn!("watchdog thread panicked");
            }
        }

        {
            let mut process = lock(&self.process);
            if process.state().can_transition_to(EngineState::ShuttingDown) {
                process.transition(EngineState::ShuttingDown)?;
            }
        }

        let mut acknowledged = false;
        if let Some(mut queue) = lock(&self.queue).take() {
            acknowledged = queue.dispose();
        }
        if !acknowledged && self.client.is_connected() {
            if let Err(err) = self.client.shutdown() {
                debug!(error = %err, "shutdown call failed");
            }
        }
        self.client.close();
        if let Some(mut server) = lock(&self.notifications).take() {
            server.shutdown();
        }

        let status = lock(&self.process).shutdown(self.shutdown_grace)?;
        info!(pid = self.pid, ?status, "engine session closed");
        Ok(status)
    }
}

impl Drop for HostSession {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(pid = self.pid, error = %err, "engine shutdown on drop failed");
        }
    }
}

impl fmt::Debug for HostSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSession")
            .field("pid", &self.pid)
            .field("engine", &self.engine_endpoint)
            .field("host", &self.host_endpoint)
            .field("ready", &self.is_ready())
            .field("crashed", &self.has_crashed())
            .finish()
    }
}

fn wait_ready(process: &mut EngineProcess, readiness: &Readiness, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if readiness.wait_timeout(READY_POLL) {
            process.transition(EngineState::Ready)?;
            return Ok(());
        }
        if !process.is_alive() {
            let status = process
                .exit_status()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown status".to_string());
            error!(pid = process.pid(), %status, "engine exited before it was ready");
            return Err(SessionError::EngineExited { status });
        }
        if Instant::now() >= deadline {
            error!(pid = process.pid(), ?timeout, "engine never became ready");
            return Err(SessionError::ReadinessTimeout {
                timeout,
                pid: process.pid(),
            });
        }
    }
}

fn connect(
    process: &mut EngineProcess,
    endpoint: &Endpoint,
    config: &HostConfig,
) -> Result<(EngineClient, Option<DispatchQueue>)> {
    let client = EngineClient::connect(endpoint, &config.rpc)?;
    let queue = if config.input_queue {
        Some(DispatchQueue::connect(endpoint, &config.rpc)?)
    } else {
        None
    };
    process.transition(EngineState::Running)?;
    Ok((client, queue))
}

/// Startup failed: nothing of the engine may survive.
fn abort(process: &mut EngineProcess) {
    if let Err(err) = process.abort() {
        warn!(pid = process.pid(), error = %err, "kill after failed start failed");
    }
}

fn watch(
    process: &Mutex<EngineProcess>,
    client: &EngineClient,
    cancel: &CancelToken,
    crashed: &AtomicBool,
    interval: Duration,
) {
    while !cancel.wait_timeout(interval) {
        let mut process = lock(process);
        let state = process.state();
        if process.is_alive() {
            continue;
        }
        if state == EngineState::ShuttingDown {
            return;
        }
        let status = process.exit_status();
        error!(pid = process.pid(), ?status, "engine exited unexpectedly");
        crashed.store(true, Ordering::Release);
        client.close();
        if let Err(err) = process.kill_tree() {
            warn!(pid = process.pid(), error = %err, "cleanup after crash failed");
        }
        return;
    }
}
