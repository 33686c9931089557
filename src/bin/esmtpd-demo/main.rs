#![warn(rust_2018_idioms)]

use std::net::SocketAddr;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::net::TcpListener;

use esmtpd::{
    AuthOutcome, AuthRequest, BodyStream, Config, DataOutcome, EnvelopeAddress, Handler,
    HandlerResult, Session, TlsMaterial,
};

/// A handler that accepts everything and logs the message to stdout. Stands
/// in for a host application's own queueing/delivery/user-database logic,
/// all of which are outside this crate's business.
struct DummyHandler {
    addr: SocketAddr,
}

#[async_trait]
impl Handler for DummyHandler {
    async fn on_connect(&mut self, session: &Session) -> HandlerResult {
        tracing::info!(peer = %self.addr, session_id = %session.id, "connection accepted");
        Ok(None)
    }

    async fn on_auth(&mut self, request: AuthRequest, _session: &Session) -> AuthOutcome {
        match (request.username.as_deref(), request.password.as_deref()) {
            (Some(user), Some("hunter2")) => AuthOutcome::accept(user),
            _ => AuthOutcome::reject(),
        }
    }

    async fn on_mail_from(&mut self, address: &EnvelopeAddress, _session: &Session) -> HandlerResult {
        tracing::info!(from = %address.address, "MAIL FROM");
        Ok(None)
    }

    async fn on_rcpt_to(&mut self, address: &EnvelopeAddress, _session: &Session) -> HandlerResult {
        tracing::info!(to = %address.address, "RCPT TO");
        Ok(None)
    }

    async fn on_data<S>(&mut self, body: &mut S, session: &Session) -> DataOutcome
    where
        S: BodyStream,
    {
        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => buf.extend_from_slice(&bytes),
                Err(e) => {
                    tracing::warn!(error = %e, "error reading message body");
                    return DataOutcome::Single(Err(None));
                }
            }
        }
        tracing::info!(session_id = %session.id, bytes = buf.len(), size_exceeded = body.size_exceeded(), "message received");
        DataOutcome::Single(Ok(None))
    }

    async fn on_secure(&mut self, session: &Session) {
        tracing::info!(session_id = %session.id, "TLS handshake complete");
    }

    async fn on_close(&mut self, session: &Session) {
        tracing::info!(session_id = %session.id, "connection closed");
    }

    async fn tls_request(&mut self, _session: &Session) -> bool {
        true
    }
}

/// Certificate and key provisioning is explicitly out of this crate's scope:
/// the demo reads PEM material from two paths given on the command line,
/// and simply hides STARTTLS if none are given rather than shipping a
/// baked-in snakeoil pair.
fn load_tls_material(mut args: impl Iterator<Item = String>) -> std::io::Result<Option<TlsMaterial>> {
    match (args.next(), args.next()) {
        (Some(cert_path), Some(key_path)) => {
            let cert_chain_pem = std::fs::read(cert_path)?;
            let private_key_pem = std::fs::read(key_path)?;
            Ok(Some(TlsMaterial::default_context(cert_chain_pem, private_key_pem)))
        }
        _ => Ok(None),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let tls_material = load_tls_material(std::env::args().skip(1))?;

    let mut config = Config::new("esmtpd-demo")
        .with_size(32 * 1024 * 1024)
        .with_auth_methods([esmtpd::SaslMechanism::Plain, esmtpd::SaslMechanism::Login]);
    if tls_material.is_none() {
        config.hide_starttls = true;
    }

    let server = esmtpd::Server::new(config, |session: &Session| DummyHandler {
        addr: SocketAddr::new(session.remote_address, session.remote_port),
    });

    if let Some(material) = tls_material {
        server.update_secure_context(&[material])?;
    }

    let listener = TcpListener::bind("127.0.0.1:2525").await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    let handle = server.listen(listener);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    handle.close().await;

    Ok(())
}
