//! Persistent supervisor socket: connect, handshake, then pump frames both
//! ways until the transport dies, reconnecting with exponential backoff.

use crate::{commands::handshake_frame, dispatch::Dispatcher};
use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::{SinkExt, StreamExt};
use rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
use std::{fs, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
};
use tokio_rustls::TlsConnector;
use tokio_util::{
    codec::{Framed, LinesCodec},
    sync::CancellationToken,
};
use tracing::{info, warn};
use uabridge_error::{BridgeError, BridgeResult};
use uabridge_model::{DriverSettings, TlsSettings};

trait LinkStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> LinkStream for T {}
type BoxedStream = Box<dyn LinkStream>;

fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(30),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// TCP (optionally TLS) client toward the supervisor.
pub struct SupervisorLink {
    settings: DriverSettings,
    dispatcher: Arc<Dispatcher>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
}

impl SupervisorLink {
    pub fn new(
        settings: DriverSettings,
        dispatcher: Arc<Dispatcher>,
        outbound_rx: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            dispatcher,
            outbound_rx,
            cancel,
        }
    }

    pub async fn run(mut self) {
        let mut bo = reconnect_backoff();
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.connect().await {
                Ok(stream) => {
                    info!(
                        host = %self.settings.host,
                        port = self.settings.port,
                        tls = self.settings.tls.enabled,
                        "connected to supervisor"
                    );
                    let seen_active = self.drive(stream).await;
                    if seen_active {
                        bo.reset();
                    }
                    if self.cancel.is_cancelled() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(
                        host = %self.settings.host,
                        port = self.settings.port,
                        error = %e,
                        "supervisor connect failed"
                    );
                }
            }
            match bo.next_backoff() {
                Some(delay) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => bo.reset(),
            }
        }
    }

    async fn connect(&self) -> BridgeResult<BoxedStream> {
        let tcp = TcpStream::connect((self.settings.host.as_str(), self.settings.port)).await?;
        if !self.settings.tls.enabled {
            return Ok(Box::new(tcp));
        }
        let connector = tls_connector(&self.settings.tls)?;
        let name = self
            .settings
            .tls
            .server_name
            .clone()
            .unwrap_or_else(|| self.settings.host.clone());
        let server_name = ServerName::try_from(name)
            .map_err(|e| BridgeError::ConfigError(format!("bad TLS server name: {e}")))?;
        let stream = connector.connect(server_name, tcp).await?;
        Ok(Box::new(stream))
    }

    /// Pump one established connection. Returns true once any inbound frame
    /// was seen, which resets the reconnect backoff.
    async fn drive(&mut self, stream: BoxedStream) -> bool {
        let mut framed = Framed::new(stream, LinesCodec::new());
        if let Err(e) = framed.send(handshake_frame(&self.settings).to_string()).await {
            warn!(error = %e, "handshake send failed");
            return false;
        }
        let mut seen_active = false;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return seen_active,
                outbound = self.outbound_rx.recv() => match outbound {
                    Some(line) => {
                        if let Err(e) = framed.send(line).await {
                            warn!(error = %e, "supervisor socket write failed");
                            return seen_active;
                        }
                    }
                    None => return seen_active,
                },
                inbound = framed.next() => match inbound {
                    Some(Ok(line)) => {
                        seen_active = true;
                        let dispatcher = Arc::clone(&self.dispatcher);
                        tokio::spawn(async move {
                            dispatcher.handle_line(line).await;
                        });
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "supervisor socket read error");
                        return seen_active;
                    }
                    None => {
                        info!("supervisor closed the connection");
                        return seen_active;
                    }
                }
            }
        }
    }
}

fn tls_connector(tls: &TlsSettings) -> BridgeResult<TlsConnector> {
    let mut roots = RootCertStore::empty();
    if let Some(ca) = &tls.ca_file {
        let pem = fs::read(ca)?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert?;
            roots
                .add(cert)
                .map_err(|e| BridgeError::ConfigError(format!("bad CA certificate: {e}")))?;
        }
    }
    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match (&tls.cert_file, &tls.key_file) {
        (Some(cert_path), Some(key_path)) => {
            let certs = rustls_pemfile::certs(&mut fs::read(cert_path)?.as_slice())
                .collect::<Result<Vec<_>, _>>()?;
            let key = rustls_pemfile::private_key(&mut fs::read(key_path)?.as_slice())?
                .ok_or_else(|| BridgeError::ConfigError("no private key in key file".into()))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| BridgeError::ConfigError(format!("client certificate: {e}")))?
        }
        _ => builder.with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(config)))
}
