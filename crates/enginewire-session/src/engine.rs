//! The engine side of a session.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use enginewire_protocol::{
    KeyboardEvent, MouseClickEvent, MouseMoveEvent, MouseScrollEvent, Resolution,
};
use enginewire_rpc::{EngineControls, Handler, HandlerResult, HostNotifier, RpcConfig, RpcServer};
use enginewire_transport::Endpoint;
use tracing::{error, info, warn};

use crate::cancel::Latch;
use crate::error::Result;

/// Forwards every call and trips the latch once the host asked to shut down.
struct ShutdownSignal {
    inner: Arc<dyn EngineControls>,
    requested: Arc<Latch>,
}

impl EngineControls for ShutdownSignal {
    fn get_pixels(&self) -> HandlerResult<Bytes> {
        self.inner.get_pixels()
    }
    fn shutdown(&self) {
        info!("host requested shutdown");
        self.inner.shutdown();
        self.requested.set();
    }
    fn keyboard(&self, event: KeyboardEvent) -> HandlerResult<()> {
        self.inner.keyboard(event)
    }
    fn mouse_move(&self, event: MouseMoveEvent) -> HandlerResult<()> {
        self.inner.mouse_move(event)
    }
    fn mouse_click(&self, event: MouseClickEvent) -> HandlerResult<()> {
        self.inner.mouse_click(event)
    }
    fn mouse_scroll(&self, event: MouseScrollEvent) -> HandlerResult<()> {
        self.inner.mouse_scroll(event)
    }
    fn go_forward(&self) -> HandlerResult<()> {
        self.inner.go_forward()
    }
    fn go_back(&self) -> HandlerResult<()> {
        self.inner.go_back()
    }
    fn refresh(&self) -> HandlerResult<()> {
        self.inner.refresh()
    }
    fn load_url(&self, url: &str) -> HandlerResult<()> {
        self.inner.load_url(url)
    }
    fn load_html(&self, html: &str) -> HandlerResult<()> {
        self.inner.load_html(html)
    }
    fn execute_js(&self, js: &str) -> HandlerResult<()> {
        self.inner.execute_js(js)
    }
    fn resize(&self, resolution: Resolution) -> HandlerResult<()> {
        self.inner.resize(resolution)
    }
    fn scroll_position(&self) -> HandlerResult<(f32, f32)> {
        self.inner.scroll_position()
    }
    fn set_zoom_level(&self, level: f64) -> HandlerResult<()> {
        self.inner.set_zoom_level(level)
    }
    fn zoom_level(&self) -> HandlerResult<f64> {
        self.inner.zoom_level()
    }
    fn open_dev_tools(&self) -> HandlerResult<()> {
        self.inner.open_dev_tools()
    }
    fn set_audio_muted(&self, muted: bool) -> HandlerResult<()> {
        self.inner.set_audio_muted(muted)
    }
}

/// An engine serving host calls and holding its notification channel.
pub struct EngineSession {
    server: RpcServer,
    notifier: HostNotifier,
    requested: Arc<Latch>,
}

impl EngineSession {
    /// Serve `controls` on `listen_on`, then connect back to the host.
    ///
    /// A host that cannot be reached is logged and leaves notifications
    /// disabled; the engine keeps serving calls.
    pub fn start(
        listen_on: &Endpoint,
        host: &Endpoint,
        controls: Arc<dyn EngineControls>,
        config: &RpcConfig,
    ) -> Result<Self> {
        let requested = Arc::new(Latch::default());
        let handler = Handler::Engine(Arc::new(ShutdownSignal {
            inner: controls,
            requested: Arc::clone(&requested),
        }));
        let server = RpcServer::bind(listen_on, handler, config.clone())?;

        let notifier = match HostNotifier::connect(host, config) {
            Ok(notifier) => notifier,
            Err(err) => {
                error!(%host, error = %err, "could not reach host; notifications disabled");
                HostNotifier::disabled()
            }
        };

        Ok(Self {
            server,
            notifier,
            requested,
        })
    }

    /// Where host calls are served. Reports the real port for TCP port 0.
    pub fn endpoint(&self) -> &Endpoint {
        self.server.endpoint()
    }

    pub fn notifier(&self) -> &HostNotifier {
        &self.notifier
    }

    /// Tell the host the surface exists. Call once, after painting is possible.
    pub fn ready(&self) {
        if let Err(err) = self.notifier.ready() {
            warn!(error = %err, "could not announce readiness");
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.requested.is_set()
    }

    /// Block until the host calls `Shutdown`.
    pub fn wait_for_shutdown(&self) {
        self.requested.wait();
    }

    /// Returns `true` if shutdown was requested within `timeout`.
    pub fn wait_for_shutdown_timeout(&self, timeout: Duration) -> bool {
        self.requested.wait_timeout(timeout)
    }

    /// Close the notification channel and stop serving.
    pub fn close(mut self) {
        self.close_inner();
    }

    fn close_inner(&mut self) {
        self.notifier.close();
        self.server.shutdown();
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        self.close_inner();
    }
}

impl fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSession")
            .field("endpoint", self.server.endpoint())
            .field("notifications", &self.notifier.is_connected())
            .field("shutdown_requested", &self.shutdown_requested())
            .finish()
    }
}
