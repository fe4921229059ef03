use std::fmt;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use enginewire_frame::{FrameError, FrameKind, FrameReader, FrameWriter};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, RpcError};

const MAX_PROTOCOL_LEN: usize = 32;
const MAX_VERSION_LEN: usize = 16;
const MAX_SESSION_ID_LEN: usize = 128;

/// Which side of the pair a peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Engine,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Host => "host",
            Role::Engine => "engine",
        })
    }
}

/// First frame on every connection, sent by the dialing side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: String,
    /// Role of the dialing peer.
    pub role: Role,
}

/// The listening side's answer when it accepts the request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub protocol: String,
    pub version: String,
    /// Identifier the listener assigned to this connection, for logs.
    pub session_id: String,
}

/// What both sides know once a handshake succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub session_id: String,
    pub peer_version: String,
    pub peer_role: Role,
}

/// Handshake limits.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Bound on each side's wait for the other's handshake frame.
    pub timeout: Duration,
    pub protocol_name: String,
    /// `<major>.<minor>`; peers must share the major, and a client's minor
    /// must be at least the server's.
    pub protocol_version: String,
    /// Payload cap while the peer is not yet trusted.
    pub max_handshake_payload: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_name: "enginewire".to_string(),
            protocol_version: "1.0".to_string(),
            max_handshake_payload: 16 * 1024,
        }
    }
}

/// Run the dialing side: announce `role`, wait for acceptance.
pub fn handshake_client<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    role: Role,
    config: &HandshakeConfig,
) -> Result<HandshakeOutcome> {
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;

    let request = HandshakeRequest {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        role,
    };
    send_control_json(writer, &request)?;

    let payload = recv_control_payload(reader, config)?;
    let response: HandshakeResponse = serde_json::from_slice(&payload)?;

    validate_protocol_name(&response.protocol)?;
    validate_version(&response.version)?;
    validate_session_id(&response.session_id)?;

    if response.protocol != config.protocol_name {
        return Err(RpcError::HandshakeFailed(format!(
            "unknown protocol '{}' (expected '{}')",
            response.protocol, config.protocol_name
        )));
    }
    if !is_version_compatible(&config.protocol_version, &response.version)? {
        return Err(RpcError::HandshakeFailed(format!(
            "incompatible version '{}' (local '{}')",
            response.version, config.protocol_version
        )));
    }

    debug!(session_id = %response.session_id, %role, "handshake accepted");
    Ok(HandshakeOutcome {
        session_id: response.session_id,
        peer_version: response.version,
        peer_role: match role {
            Role::Host => Role::Engine,
            Role::Engine => Role::Host,
        },
    })
}

/// Run the listening side: only a client announcing `expected_role` is admitted.
///
/// A rejected client gets no response; the connection is simply dropped.
pub fn handshake_server<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    expected_role: Role,
    session_id: &str,
    config: &HandshakeConfig,
) -> Result<HandshakeOutcome> {
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;
    validate_session_id(session_id)?;

    let payload = recv_control_payload(reader, config)?;
    let request: HandshakeRequest = serde_json::from_slice(&payload)?;

    validate_protocol_name(&request.protocol)?;
    validate_version(&request.version)?;

    if request.protocol != config.protocol_name {
        return Err(RpcError::HandshakeFailed(format!(
            "unknown protocol '{}' (expected '{}')",
            request.protocol, config.protocol_name
        )));
    }
    if !is_version_compatible(&request.version, &config.protocol_version)? {
        return Err(RpcError::HandshakeFailed(format!(
            "incompatible version '{}' (server '{}')",
            request.version, config.protocol_version
        )));
    }
    if request.role != expected_role {
        return Err(RpcError::HandshakeFailed(format!(
            "peer announced role '{}' but this endpoint only admits '{}'",
            request.role, expected_role
        )));
    }

    let response = HandshakeResponse {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        session_id: session_id.to_string(),
    };
    send_control_json(writer, &response)?;

    Ok(HandshakeOutcome {
        session_id: session_id.to_string(),
        peer_version: request.version,
        peer_role: request.role,
    })
}

fn send_control_json<T: Serialize, W: Write>(writer: &mut FrameWriter<W>, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    writer.send(FrameKind::Control, &payload)?;
    Ok(())
}

fn recv_control_payload<R: Read>(
    reader: &mut FrameReader<R>,
    config: &HandshakeConfig,
) -> Result<Vec<u8>> {
    let deadline = Instant::now() + config.timeout;
    loop {
        if Instant::now() >= deadline {
            return Err(RpcError::HandshakeFailed(format!(
                "no handshake within {:?}",
                config.timeout
            )));
        }

        match reader.read_frame() {
            Ok(frame) if frame.kind != FrameKind::Control => {
                return Err(RpcError::HandshakeFailed(format!(
                    "expected control frame, got {}",
                    frame.kind
                )));
            }
            Ok(frame) if frame.payload.len() > config.max_handshake_payload => {
                return Err(RpcError::HandshakeFailed(format!(
                    "handshake payload too large: {} (max {})",
                    frame.payload.len(),
                    config.max_handshake_payload
                )));
            }
            Ok(frame) => return Ok(frame.payload.to_vec()),
            Err(err) if err.is_timeout() => continue,
            Err(FrameError::ConnectionClosed) => {
                return Err(RpcError::HandshakeFailed(
                    "connection closed during handshake".to_string(),
                ));
            }
            Err(FrameError::PayloadTooLarge { size, max }) => {
                return Err(RpcError::HandshakeFailed(format!(
                    "handshake payload too large: {size} (max {max})"
                )));
            }
            Err(err) => return Err(RpcError::Frame(err)),
        }
    }
}

fn validate_protocol_name(protocol: &str) -> Result<()> {
    if protocol.is_empty() || protocol.len() > MAX_PROTOCOL_LEN {
        return Err(RpcError::HandshakeFailed(format!(
            "invalid protocol name length: {}",
            protocol.len()
        )));
    }
    Ok(())
}

fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(RpcError::HandshakeFailed(format!(
            "invalid protocol version length: {}",
            version.len()
        )));
    }
    parse_version(version).map(|_| ())
}

fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
        return Err(RpcError::HandshakeFailed(format!(
            "invalid session id length: {}",
            session_id.len()
        )));
    }
    Ok(())
}

fn is_version_compatible(client_version: &str, server_version: &str) -> Result<bool> {
    let (client_major, client_minor) = parse_version(client_version)?;
    let (server_major, server_minor) = parse_version(server_version)?;
    Ok(client_major == server_major && client_minor >= server_minor)
}

fn parse_version(version: &str) -> Result<(u16, u16)> {
    let invalid =
        |why: &str| RpcError::HandshakeFailed(format!("invalid version '{version}': {why}"));
    let (major, minor) = version
        .split_once('.')
        .ok_or_else(|| invalid("expected '<major>.<minor>'"))?;
    if minor.contains('.') {
        return Err(invalid("expected '<major>.<minor>'"));
    }
    let major = major.parse::<u16>().map_err(|_| invalid("non-numeric major"))?;
    let minor = minor.parse::<u16>().map_err(|_| invalid("non-numeric minor"))?;
    Ok((major, minor))
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::thread;

    use super::*;

    fn pair() -> (
        (FrameReader<UnixStream>, FrameWriter<UnixStream>),
        (FrameReader<UnixStream>, FrameWriter<UnixStream>),
    ) {
        let (left, right) = UnixStream::pair().expect("socket pair");
        (
            (
                FrameReader::new(left.try_clone().expect("clone")),
                FrameWriter::new(left),
            ),
            (
                FrameReader::new(right.try_clone().expect("clone")),
                FrameWriter::new(right),
            ),
        )
    }

    #[test]
    fn host_dials_engine() {
        let ((mut sr, mut sw), (mut cr, mut cw)) = pair();
        let server = thread::spawn(move || {
            handshake_server(&mut sr, &mut sw, Role::Host, "engine-1", &HandshakeConfig::default())
        });

        let client = handshake_client(&mut cr, &mut cw, Role::Host, &HandshakeConfig::default())
            .expect("client handshake");
        let server = server.join().expect("server thread").expect("server handshake");

        assert_eq!(client.session_id, "engine-1");
        assert_eq!(client.peer_role, Role::Engine);
        assert_eq!(server.peer_role, Role::Host);
    }

    #[test]
    fn wrong_role_is_rejected() {
        let ((mut sr, mut sw), (mut cr, mut cw)) = pair();
        let server = thread::spawn(move || {
            let config = HandshakeConfig::default();
            let result = handshake_server(&mut sr, &mut sw, Role::Engine, "host-1", &config);
            drop((sr, sw));
            result
        });

        let client = handshake_client(&mut cr, &mut cw, Role::Host, &HandshakeConfig::default());
        assert!(matches!(client, Err(RpcError::HandshakeFailed(_))));
        assert!(matches!(
            server.join().expect("server thread"),
            Err(RpcError::HandshakeFailed(msg)) if msg.contains("role")
        ));
    }

    #[test]
    fn newer_server_minor_is_rejected() {
        let ((mut sr, mut sw), (mut cr, mut cw)) = pair();
        let server = thread::spawn(move || {
            let config = HandshakeConfig {
                protocol_version: "1.3".to_string(),
                ..HandshakeConfig::default()
            };
            let result = handshake_server(&mut sr, &mut sw, Role::Engine, "s", &config);
            drop((sr, sw));
            result
        });

        let client = handshake_client(&mut cr, &mut cw, Role::Engine, &HandshakeConfig::default());
        assert!(client.is_err());
        assert!(server.join().expect("server thread").is_err());
    }

    #[test]
    fn non_control_first_frame_is_rejected() {
        let ((mut sr, mut sw), (_cr, mut cw)) = pair();
        cw.send(FrameKind::Call, b"\x01\x00\x00\x00\x01").expect("send");
        let config = HandshakeConfig::default();
        let result = handshake_server(&mut sr, &mut sw, Role::Host, "s", &config);
        assert!(matches!(result, Err(RpcError::HandshakeFailed(msg)) if msg.contains("control")));
    }

    #[test]
    fn oversized_handshake_is_rejected() {
        let ((mut sr, mut sw), (_cr, mut cw)) = pair();
        cw.send(FrameKind::Control, &vec![b' '; 1024]).expect("send");
        let config = HandshakeConfig {
            max_handshake_payload: 64,
            ..HandshakeConfig::default()
        };
        let result = handshake_server(&mut sr, &mut sw, Role::Host, "s", &config);
        assert!(matches!(result, Err(RpcError::HandshakeFailed(_))));
    }

    #[test]
    fn version_rules() {
        assert!(is_version_compatible("1.2", "1.0").unwrap());
        assert!(!is_version_compatible("1.0", "1.2").unwrap());
        assert!(!is_version_compatible("2.0", "1.0").unwrap());
        assert!(parse_version("1").is_err());
        assert!(parse_version("1.2.3").is_err());
        assert!(parse_version("a.b").is_err());
    }

    #[test]
    fn request_json_shape() {
        let json = serde_json::to_value(HandshakeRequest {
            protocol: "enginewire".into(),
            version: "1.0".into(),
            role: Role::Engine,
        })
        .unwrap();
        assert_eq!(json["role"], "engine");
    }
}
