use std::net::SocketAddr;
use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::debug;

use crate::handshake::Resolver;
use crate::hello::ClientHelloInfo;

/// Blocking rustls adapter around a [`Resolver`].
///
/// rustls calls `resolve` synchronously from a worker thread, so the async
/// resolution is driven to completion with a local executor; timers and
/// spawned background work still run on the surrounding Tokio runtime.
#[derive(Clone)]
pub struct HandshakeCertResolver {
  resolver: Resolver,
  local_addr: Option<SocketAddr>,
}

impl HandshakeCertResolver {
  pub fn new(resolver: Resolver) -> Self {
    Self {
      resolver,
      local_addr: None,
    }
  }

  /// Attaches the listener's local address, used as the lookup fallback
  /// for clients that send no SNI.
  pub fn with_local_addr(mut self, local_addr: SocketAddr) -> Self {
    self.local_addr = Some(local_addr);
    self
  }
}

impl std::fmt::Debug for HandshakeCertResolver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HandshakeCertResolver")
      .field("local_addr", &self.local_addr)
      .finish()
  }
}

impl ResolvesServerCert for HandshakeCertResolver {
  fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
    let hello = ClientHelloInfo::from_rustls(&client_hello, self.local_addr, None);
    // Tokio's own block_on would panic inside a worker thread; a local
    // executor does not.
    match futures_executor::block_on(self.resolver.get_certificate(&hello)) {
      Ok(certified_key) => Some(certified_key),
      Err(err) => {
        debug!(sni = %hello.server_name, error = %err, "no certificate for handshake");
        None
      }
    }
  }
}
