//! Tonic-backed `Session`: owns the reconnect loop
//! (`disconnected -> connected -> streaming -> registered`) as a background
//! task, and exposes the port's `send`/`recv` as thin channel handles into
//! whichever stream is currently active.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::{Request, Streaming};
use tracing::{error, info, warn};

use crate::adapters::session::backoff;
use crate::adapters::session::codec::{decode_control_frame, encode_agent_message};
use crate::domain::error::{AgentError, AgentResult};
use crate::domain::models::{CapabilityConfig, TlsConfig};
use crate::domain::ports::{AgentMessage, ControlMessage, Session};
use crate::proto;
use crate::proto::agent_session_client::AgentSessionClient;

const MESSAGE_SIZE_LIMIT: usize = 16 * 1024 * 1024;
const OUTBOUND_FRAME_BUFFER: usize = 32;
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;
const INBOUND_CHANNEL_CAPACITY: usize = 256;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const HTTP2_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const HTTP2_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the connection loop needs to know, gathered once from the
/// loaded `Config` by `infrastructure::setup`.
#[derive(Clone)]
pub struct SessionConfig {
    pub control_plane_url: String,
    pub token: String,
    pub agent_id: String,
    pub agent_name: String,
    pub agent_version: String,
    pub tls: TlsConfig,
    pub capabilities: CapabilityConfig,
    pub max_parallel: u32,
    pub docker_available: bool,
    pub reconnect_min_interval: Duration,
    pub reconnect_max_interval: Duration,
}

pub struct GrpcSession {
    outbound_tx: mpsc::Sender<AgentMessage>,
    inbound_rx: Mutex<mpsc::Receiver<ControlMessage>>,
    fatal: Arc<AtomicBool>,
    fatal_message: Arc<Mutex<Option<String>>>,
    negotiated_heartbeat: Arc<RwLock<Option<Duration>>>,
    shutdown: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl GrpcSession {
    /// Spawns the background connection loop and returns a handle
    /// implementing `Session`. Never blocks: the first `Register` attempt
    /// happens on the background task.
    #[must_use]
    pub fn connect(config: SessionConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();
        let fatal = Arc::new(AtomicBool::new(false));
        let fatal_message = Arc::new(Mutex::new(None));
        let negotiated_heartbeat = Arc::new(RwLock::new(None));

        let task = tokio::spawn(connection_loop(
            config,
            outbound_rx,
            inbound_tx,
            shutdown.clone(),
            Arc::clone(&fatal),
            Arc::clone(&fatal_message),
            Arc::clone(&negotiated_heartbeat),
        ));

        Self {
            outbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            fatal,
            fatal_message,
            negotiated_heartbeat,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

#[async_trait]
impl Session for GrpcSession {
    async fn send(&self, message: AgentMessage) -> AgentResult<()> {
        self.outbound_tx
            .send(message)
            .await
            .map_err(|_| AgentError::transient("session is shutting down, cannot send"))
    }

    async fn recv(&self) -> AgentResult<Option<ControlMessage>> {
        if self.fatal.load(Ordering::SeqCst) {
            let mut slot = self.fatal_message.lock().await;
            return match slot.take() {
                Some(message) => Err(AgentError::Permanent(message)),
                None => Ok(None),
            };
        }
        let mut rx = self.inbound_rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn negotiated_heartbeat_interval(&self) -> Option<Duration> {
        *self.negotiated_heartbeat.read().await
    }
}

enum ConnectOutcome {
    /// Registration was rejected by the control plane; never retry.
    Fatal(String),
    /// Dial, handshake, or stream-open failure; retry with backoff.
    Transient(AgentError),
}

async fn connection_loop(
    config: SessionConfig,
    mut outbound_rx: mpsc::Receiver<AgentMessage>,
    inbound_tx: mpsc::Sender<ControlMessage>,
    shutdown: CancellationToken,
    fatal: Arc<AtomicBool>,
    fatal_message: Arc<Mutex<Option<String>>>,
    negotiated_heartbeat: Arc<RwLock<Option<Duration>>>,
) {
    let mut attempt: u32 = 0;
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        attempt += 1;

        match connect_and_register(&config).await {
            Ok((frame_tx, inbound, heartbeat_override)) => {
                info!(attempt, "session registered with control plane");
                *negotiated_heartbeat.write().await = heartbeat_override;
                attempt = 0;
                pump(frame_tx, inbound, &mut outbound_rx, &inbound_tx, &shutdown).await;
                info!("control plane stream ended, will reconnect");
            }
            Err(ConnectOutcome::Fatal(message)) => {
                error!(error = %message, "registration rejected by control plane, session is terminal");
                *fatal_message.lock().await = Some(message);
                fatal.store(true, Ordering::SeqCst);
                return;
            }
            Err(ConnectOutcome::Transient(err)) => {
                warn!(error = %err, attempt, "failed to connect to control plane");
            }
        }

        if shutdown.is_cancelled() {
            return;
        }
        let wait = backoff::next_interval(
            config.reconnect_min_interval,
            config.reconnect_min_interval,
            config.reconnect_max_interval,
            attempt.max(1),
        );
        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            () = shutdown.cancelled() => return,
        }
    }
}

type StreamHandles = (mpsc::Sender<proto::AgentFrame>, Streaming<proto::ControlFrame>, Option<Duration>);

async fn connect_and_register(config: &SessionConfig) -> Result<StreamHandles, ConnectOutcome> {
    let channel = build_channel(config).await.map_err(ConnectOutcome::Transient)?;
    let mut client = AgentSessionClient::new(channel)
        .max_decoding_message_size(MESSAGE_SIZE_LIMIT)
        .max_encoding_message_size(MESSAGE_SIZE_LIMIT);

    let (frame_tx, frame_rx) = mpsc::channel::<proto::AgentFrame>(OUTBOUND_FRAME_BUFFER);

    let register = encode_agent_message(AgentMessage::Register {
        agent_id: config.agent_id.clone(),
        name: config.agent_name.clone(),
        version: config.agent_version.clone(),
        capabilities: config.capabilities.clone(),
        max_parallel: config.max_parallel,
        docker_available: config.docker_available,
    });
    frame_tx
        .send(register)
        .await
        .map_err(|_| ConnectOutcome::Transient(AgentError::transient("failed to queue register frame")))?;

    let mut request = Request::new(ReceiverStream::new(frame_rx));
    request
        .metadata_mut()
        .insert("authorization", format!("Bearer {}", config.token).parse().map_err(|_| {
            ConnectOutcome::Transient(AgentError::permanent("token contains invalid header characters"))
        })?);

    let response = client
        .stream(request)
        .await
        .map_err(|status| ConnectOutcome::Transient(AgentError::transient(format!("stream open failed: {status}"))))?;
    let mut inbound = response.into_inner();

    let first = inbound
        .message()
        .await
        .map_err(|status| ConnectOutcome::Transient(AgentError::transient(format!("recv failed: {status}"))))?;

    match first.and_then(|frame| decode_control_frame(frame).ok().flatten()) {
        Some(ControlMessage::RegisterResponse { success: true, heartbeat_interval, .. }) => {
            Ok((frame_tx, inbound, heartbeat_interval))
        }
        Some(ControlMessage::RegisterResponse { success: false, error_message, .. }) => {
            Err(ConnectOutcome::Fatal(error_message.unwrap_or_else(|| "registration rejected".to_string())))
        }
        _ => Err(ConnectOutcome::Transient(AgentError::transient(
            "expected RegisterResponse as the first frame",
        ))),
    }
}

/// Relays frames between the shared outbound channel and this connection's
/// request stream, and between the response stream and the shared inbound
/// channel, until either side closes or `shutdown` fires.
async fn pump(
    frame_tx: mpsc::Sender<proto::AgentFrame>,
    mut inbound: Streaming<proto::ControlFrame>,
    outbound_rx: &mut mpsc::Receiver<AgentMessage>,
    inbound_tx: &mpsc::Sender<ControlMessage>,
    shutdown: &CancellationToken,
) {
    loop {
        tokio::select! {
            maybe_message = outbound_rx.recv() => {
                match maybe_message {
                    Some(message) => {
                        if frame_tx.send(encode_agent_message(message)).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
            maybe_frame = inbound.message() => {
                match maybe_frame {
                    Ok(Some(frame)) => match decode_control_frame(frame) {
                        Ok(Some(message)) => {
                            if inbound_tx.send(message).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => warn!(error = %err, "failed to decode control frame"),
                    },
                    Ok(None) => return,
                    Err(status) => {
                        warn!(error = %status, "control stream error");
                        return;
                    }
                }
            }
            () = shutdown.cancelled() => return,
        }
    }
}

async fn build_channel(config: &SessionConfig) -> AgentResult<Channel> {
    let scheme = if config.tls.enabled { "https" } else { "http" };
    let uri = format!("{scheme}://{}", config.control_plane_url);

    let endpoint = Endpoint::from_shared(uri)
        .map_err(|e| AgentError::permanent(format!("invalid control plane url: {e}")))?
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(Some(TCP_KEEPALIVE))
        .http2_keep_alive_interval(HTTP2_KEEPALIVE_INTERVAL)
        .keep_alive_timeout(HTTP2_KEEPALIVE_TIMEOUT)
        .keep_alive_while_idle(true);

    if !config.tls.enabled {
        return endpoint
            .connect()
            .await
            .map_err(|e| AgentError::transient(format!("connect failed: {e}")));
    }

    if config.tls.insecure_skip_verify {
        warn!("TLS_INSECURE_SKIP_VERIFY is enabled: certificate validation is disabled for the control-plane session");
        let connector = insecure_https_connector();
        return endpoint
            .connect_with_connector(connector)
            .await
            .map_err(|e| AgentError::transient(format!("connect failed: {e}")));
    }

    let mut tls = ClientTlsConfig::new().with_enabled_roots();
    if let Some(ca_file) = &config.tls.ca_file {
        let pem = tokio::fs::read(ca_file)
            .await
            .map_err(|e| AgentError::permanent(format!("failed to read TLS_CA_FILE {}: {e}", ca_file.display())))?;
        tls = tls.ca_certificate(Certificate::from_pem(pem));
    }
    if let (Some(cert_file), Some(key_file)) = (&config.tls.cert_file, &config.tls.key_file) {
        let cert_pem = tokio::fs::read(cert_file)
            .await
            .map_err(|e| AgentError::permanent(format!("failed to read TLS_CERT_FILE {}: {e}", cert_file.display())))?;
        let key_pem = tokio::fs::read(key_file)
            .await
            .map_err(|e| AgentError::permanent(format!("failed to read TLS_KEY_FILE {}: {e}", key_file.display())))?;
        tls = tls.identity(Identity::from_pem(cert_pem, key_pem));
    }

    let endpoint = endpoint
        .tls_config(tls)
        .map_err(|e| AgentError::permanent(format!("invalid tls configuration: {e}")))?;

    endpoint.connect().await.map_err(|e| AgentError::transient(format!("connect failed: {e}")))
}

/// Built only when `TLS_INSECURE_SKIP_VERIFY=true`; installs a no-op
/// certificate verifier. Debug/staging use only.
fn insecure_https_connector() -> hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector> {
    let tls_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
        .with_no_client_auth();

    hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http2()
        .build()
}

#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
