use std::time::Duration;

use enginewire_frame::{FrameConfig, FrameReader, FrameWriter};
use enginewire_transport::{Acceptor, Endpoint, IpcStream};
use tracing::info;

use crate::error::Result;
use crate::handshake::{handshake_client, handshake_server, HandshakeConfig, HandshakeOutcome, Role};

/// Connection and call limits shared by clients and servers.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// How long a dialing side keeps retrying while the peer is not listening.
    pub connect_timeout: Duration,
    /// How long `call` waits for a reply.
    pub call_timeout: Duration,
    pub handshake: HandshakeConfig,
    /// Limits applied after the handshake. Its read timeout is ignored:
    /// reader threads block until data or shutdown.
    pub frame: FrameConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
            handshake: HandshakeConfig::default(),
            frame: FrameConfig::default().with_write_timeout(Some(Duration::from_secs(5))),
        }
    }
}

impl RpcConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// A connection that completed its handshake.
pub struct Established {
    pub reader: FrameReader<IpcStream>,
    pub writer: FrameWriter<IpcStream>,
    /// Extra handle used only to shut the connection down from another thread.
    pub control: IpcStream,
    pub handshake: HandshakeOutcome,
}

/// Dial `endpoint` as `role` and run the client handshake.
pub fn dial(endpoint: &Endpoint, role: Role, config: &RpcConfig) -> Result<Established> {
    let stream = enginewire_transport::connect(endpoint, config.connect_timeout)?;
    let established = establish(stream, config, |reader, writer| {
        handshake_client(reader, writer, role, &config.handshake)
    })?;
    info!(
        %endpoint,
        %role,
        session_id = %established.handshake.session_id,
        "connected"
    );
    Ok(established)
}

/// Accept the next connection on `acceptor`, admitting only `expected_role`.
pub fn admit(
    acceptor: &Acceptor,
    expected_role: Role,
    session_id: &str,
    config: &RpcConfig,
) -> Result<Established> {
    let stream = acceptor.accept()?;
    admit_stream(stream, expected_role, session_id, config)
}

/// Run the server handshake on an already-accepted stream.
pub fn admit_stream(
    stream: IpcStream,
    expected_role: Role,
    session_id: &str,
    config: &RpcConfig,
) -> Result<Established> {
    establish(stream, config, |reader, writer| {
        handshake_server(reader, writer, expected_role, session_id, &config.handshake)
    })
}

fn establish<F>(stream: IpcStream, config: &RpcConfig, handshake: F) -> Result<Established>
where
    F: FnOnce(&mut FrameReader<IpcStream>, &mut FrameWriter<IpcStream>) -> Result<HandshakeOutcome>,
{
    let control = stream.try_clone()?;
    let reader_stream = stream.try_clone()?;

    // Tight pre-handshake budget; the runtime limits apply once the peer is known.
    let handshake_frames = FrameConfig {
        max_payload_size: config.handshake.max_handshake_payload,
        read_timeout: Some(config.handshake.timeout),
        write_timeout: Some(config.handshake.timeout),
    };
    let mut reader = FrameReader::with_config_ipc(reader_stream, handshake_frames.clone())?;
    let mut writer = FrameWriter::with_config_ipc(stream, handshake_frames)?;

    let outcome = handshake(&mut reader, &mut writer)?;

    reader.get_ref().set_read_timeout(None)?;
    writer.get_ref().set_write_timeout(config.frame.write_timeout)?;
    reader.set_max_payload_size(config.frame.max_payload_size);
    writer.set_max_payload_size(config.frame.max_payload_size);

    Ok(Established {
        reader,
        writer,
        control,
        handshake: outcome,
    })
}

#[cfg(test)]
mod tests {
    use std::thread;

    use enginewire_frame::FrameKind;
    use enginewire_transport::listen;

    use super::*;
    use crate::error::RpcError;

    #[test]
    fn dial_and_admit_over_tcp() {
        let acceptor = listen(&Endpoint::tcp(0)).expect("listen");
        let endpoint = acceptor.endpoint().clone();
        let config = RpcConfig::default();

        let server_config = config.clone();
        let server = thread::spawn(move || {
            let mut conn = admit(&acceptor, Role::Host, "engine-7", &server_config).expect("admit");
            let frame = conn.reader.read_frame().expect("frame");
            assert_eq!(frame.kind, FrameKind::Notify);
            // Larger than the handshake cap: runtime limits must be restored.
            assert_eq!(frame.payload.len(), 64 * 1024);
        });

        let mut client = dial(&endpoint, Role::Host, &config).expect("dial");
        assert_eq!(client.handshake.session_id, "engine-7");
        client
            .writer
            .send(FrameKind::Notify, &vec![0u8; 64 * 1024])
            .expect("send");
        server.join().expect("server thread");
    }

    #[test]
    fn dial_nothing_listening_is_connection_failed() {
        let port = {
            let acceptor = listen(&Endpoint::tcp(0)).expect("listen");
            acceptor.endpoint().location().parse::<u16>().expect("port")
        };
        let config = RpcConfig::default().with_connect_timeout(Duration::from_millis(100));
        let result = dial(&Endpoint::tcp(port), Role::Host, &config);
        assert!(matches!(
            result,
            Err(RpcError::Transport(
                enginewire_transport::TransportError::ConnectionFailed { .. }
            ))
        ));
    }
}
