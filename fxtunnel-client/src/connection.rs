// One control connection: TLS dial, mux, auth handshake, tunnel opens,
// and the accepted-stream dispatch loop

use crate::client::ConnectionState;
use crate::handlers;
use crate::{ClientError, ClientResult};
use fxtunnel_config::{ClientConfig, TunnelSpec};
use fxtunnel_mux::{MuxConfig, MuxSession};
use fxtunnel_proto::{read_control, write_control, ControlMessage, PROTOCOL_VERSION};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, OwnedTrustAnchor, RootCertStore, ServerName};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::TcpStream;
use tokio::sync::{watch, RwLock};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Accepts any server certificate; only for explicitly disabled
/// verification in development setups
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

async fn tls_connect(
    config: &ClientConfig,
    tcp: TcpStream,
) -> ClientResult<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    if let Some(ca_file) = &config.tls.ca_file {
        let pem = std::fs::read(ca_file)
            .map_err(|e| ClientError::TlsError(format!("{}: {}", ca_file.display(), e)))?;
        let mut reader = std::io::Cursor::new(pem);
        let certs = rustls_pemfile::certs(&mut reader)
            .map_err(|e| ClientError::TlsError(format!("bad CA bundle: {}", e)))?;
        for der in certs {
            roots
                .add(&Certificate(der))
                .map_err(|e| ClientError::TlsError(format!("bad CA certificate: {}", e)))?;
        }
    }

    let mut tls_config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    if !config.tls.verify_server {
        warn!("server certificate verification is DISABLED");
        tls_config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    }

    let sni = config
        .tls
        .sni_hostname
        .clone()
        .unwrap_or_else(|| config.server_host.clone());
    let server_name = ServerName::try_from(sni.as_str())
        .map_err(|_| ClientError::TlsError(format!("'{}' is not a valid SNI name", sni)))?;

    let connector = TlsConnector::from(Arc::new(tls_config));
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ClientError::TlsError(e.to_string()))
}

/// Dial, authenticate, open tunnels, and serve streams until the
/// session ends. `Ok(())` means a clean disconnect worth retrying.
pub async fn connect_once(
    config: &ClientConfig,
    mux_config: MuxConfig,
    state_tx: &watch::Sender<ConnectionState>,
    shutdown: &CancellationToken,
) -> ClientResult<()> {
    let addr = format!("{}:{}", config.server_host, config.control_port);
    info!(%addr, "connecting to tunnel server");
    let tcp = TcpStream::connect(&addr)
        .await
        .map_err(|e| ClientError::ConnectionFailed(format!("{}: {}", addr, e)))?;
    let tls = tls_connect(config, tcp).await?;

    let mux = MuxSession::client(tls, mux_config);
    let control = mux
        .take_control_stream()
        .ok_or_else(|| ClientError::InternalError("control stream unavailable".to_string()))?;
    let (mut control_rd, mut control_wr) = tokio::io::split(control);

    write_control(
        &mut control_wr,
        &ControlMessage::Auth {
            token: config.token.clone(),
            client_version: PROTOCOL_VERSION.to_string(),
        },
    )
    .await?;

    match read_control(&mut control_rd).await? {
        Some(ControlMessage::AuthOk { session_id, plan_limits, .. }) => {
            info!(
                %session_id,
                max_tunnels = plan_limits.max_tunnels,
                inspector = plan_limits.inspector_enabled,
                "authenticated"
            );
        }
        Some(ControlMessage::AuthErr { code, message }) => {
            return Err(ClientError::AuthenticationFailed(format!("{}: {}", code, message)));
        }
        other => {
            return Err(ClientError::ProtocolError(format!(
                "expected auth reply, got {:?}",
                other
            )));
        }
    }
    let _ = state_tx.send(ConnectionState::Connected);

    // Request every configured tunnel; replies arrive in order
    for spec in &config.tunnels {
        write_control(
            &mut control_wr,
            &ControlMessage::OpenTunnel {
                kind: spec.kind,
                subdomain: spec.subdomain.clone(),
                port: spec.port,
                name: spec.name.clone(),
            },
        )
        .await?;
    }

    let specs: Arc<RwLock<HashMap<Uuid, TunnelSpec>>> = Arc::new(RwLock::new(HashMap::new()));

    // Control reader: matches open replies to requests and tracks closes
    let mut pending: VecDeque<TunnelSpec> = config.tunnels.iter().cloned().collect();
    let specs_for_control = specs.clone();
    let control_task = tokio::spawn(async move {
        loop {
            match read_control(&mut control_rd).await {
                Ok(Some(ControlMessage::TunnelOpened { tunnel_id, subdomain, port })) => {
                    match pending.pop_front() {
                        Some(spec) => {
                            info!(
                                %tunnel_id,
                                subdomain = subdomain.as_deref().unwrap_or("-"),
                                port = port.unwrap_or(0),
                                local = format!("{}:{}", spec.local_host, spec.local_port),
                                "tunnel established"
                            );
                            specs_for_control.write().await.insert(tunnel_id, spec);
                        }
                        None => warn!(%tunnel_id, "unsolicited tunnel_opened"),
                    }
                }
                Ok(Some(ControlMessage::TunnelErr { code, message })) => {
                    let spec = pending.pop_front();
                    warn!(
                        tunnel = spec.map(|s| s.display_name()).unwrap_or_default(),
                        code,
                        "tunnel request failed: {}",
                        message
                    );
                }
                Ok(Some(ControlMessage::TunnelClosed { tunnel_id })) => {
                    if specs_for_control.write().await.remove(&tunnel_id).is_some() {
                        info!(%tunnel_id, "tunnel closed by server");
                    }
                }
                Ok(Some(ControlMessage::HeartbeatAck { .. })) => {}
                Ok(Some(other)) => debug!("ignoring control message {:?}", other),
                Ok(None) => break,
                Err(e) => {
                    debug!("control stream ended: {}", e);
                    break;
                }
            }
        }
    });

    // Periodic application-level heartbeat on top of the mux PING
    let heartbeat_interval = Duration::from_secs(config.mux.keepalive_secs);
    let heartbeat_shutdown = shutdown.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = heartbeat_shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if write_control(&mut control_wr, &ControlMessage::Heartbeat {}).await.is_err() {
                return;
            }
        }
    });

    let http_client = handlers::build_http_client();

    // Serve server-opened streams until the session dies
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                mux.close("client shutting down").await;
                break;
            }
            _ = mux.closed() => break,
            accepted = mux.accept_stream() => match accepted {
                Ok(stream) => {
                    tokio::spawn(handlers::handle_stream(
                        stream,
                        specs.clone(),
                        http_client.clone(),
                    ));
                }
                Err(_) => break,
            },
        }
    }

    control_task.abort();
    heartbeat_task.abort();
    Ok(())
}
