use std::net::SocketAddr;

use rustls::server::ClientHello;
use rustls::sign::CertifiedKey;
use rustls::SignatureScheme;
use serde::Serialize;

/// The ALPN protocol identifier reserved for the TLS-ALPN-01 ACME challenge (RFC 8737).
pub const ACME_TLS_ALPN_NAME: &str = "acme-tls/1";

/// A connection-free projection of a TLS client hello.
///
/// Carries only pure data, so it can be serialized into event payloads and
/// handed to policy callbacks without keeping a handle on the live
/// connection. Addresses are filled in by the acceptor when it knows them.
#[derive(Debug, Clone, Serialize)]
pub struct ClientHelloInfo {
  /// The raw SNI value, empty when the client sent none.
  pub server_name: String,
  /// Offered ALPN protocol identifiers, lossily decoded.
  pub alpn: Vec<String>,
  /// Offered cipher suites as raw IANA code points.
  pub cipher_suites: Vec<u16>,
  /// Offered signature schemes as raw IANA code points.
  pub signature_schemes: Vec<u16>,
  /// The peer's address, when the acceptor supplied it.
  pub remote_addr: Option<SocketAddr>,
  /// The local address the connection arrived on, when supplied.
  pub local_addr: Option<SocketAddr>,
}

impl ClientHelloInfo {
  /// Creates a projection carrying only a server name.
  pub fn new(server_name: impl Into<String>) -> Self {
    Self {
      server_name: server_name.into(),
      alpn: Vec::new(),
      cipher_suites: Vec::new(),
      signature_schemes: Vec::new(),
      remote_addr: None,
      local_addr: None,
    }
  }

  /// Projects a rustls client hello, attaching the addresses the acceptor knows.
  pub fn from_rustls(hello: &ClientHello<'_>, local_addr: Option<SocketAddr>, remote_addr: Option<SocketAddr>) -> Self {
    Self {
      server_name: hello.server_name().unwrap_or_default().to_string(),
      alpn: hello
        .alpn()
        .map(|protos| protos.map(|p| String::from_utf8_lossy(p).into_owned()).collect())
        .unwrap_or_default(),
      cipher_suites: hello.cipher_suites().iter().map(|c| u16::from(*c)).collect(),
      signature_schemes: hello.signature_schemes().iter().map(|s| u16::from(*s)).collect(),
      remote_addr,
      local_addr,
    }
  }

  /// Detects a TLS-ALPN-01 challenge handshake: a non-empty SNI with
  /// exactly one ALPN value equal to `"acme-tls/1"`.
  pub fn is_tls_alpn_challenge(&self) -> bool {
    !self.server_name.is_empty() && self.alpn.len() == 1 && self.alpn[0] == ACME_TLS_ALPN_NAME
  }

  /// Checks whether this client can use the given certified key.
  ///
  /// A hello that offered no signature schemes is treated as compatible
  /// with everything.
  pub fn supports_certificate(&self, key: &CertifiedKey) -> bool {
    if self.signature_schemes.is_empty() {
      return true;
    }
    let schemes: Vec<SignatureScheme> = self.signature_schemes.iter().map(|v| SignatureScheme::from(*v)).collect();
    key.key.choose_scheme(&schemes).is_some()
  }
}

/// An event emitted by the resolver, serialized for subscribers.
#[derive(Debug, Serialize)]
pub struct Event<'a> {
  /// The event name, e.g. `tls_get_certificate`.
  pub name: &'static str,
  /// The projected client hello that triggered the event.
  pub client_hello: &'a ClientHelloInfo,
}

impl Event<'_> {
  /// The payload shape handed to event pipelines.
  pub fn payload(&self) -> serde_json::Value {
    serde_json::json!({ "client_hello": self.client_hello })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_tls_alpn_challenge_predicate() {
    let mut hello = ClientHelloInfo::new("x.example.com");
    assert!(!hello.is_tls_alpn_challenge());

    hello.alpn = vec![ACME_TLS_ALPN_NAME.to_string()];
    assert!(hello.is_tls_alpn_challenge());

    hello.alpn = vec![ACME_TLS_ALPN_NAME.to_string(), "h2".to_string()];
    assert!(!hello.is_tls_alpn_challenge());

    let mut no_sni = ClientHelloInfo::new("");
    no_sni.alpn = vec![ACME_TLS_ALPN_NAME.to_string()];
    assert!(!no_sni.is_tls_alpn_challenge());
  }

  #[test]
  fn test_event_serializes_client_hello() {
    let hello = ClientHelloInfo::new("example.com");
    let event = Event {
      name: "tls_get_certificate",
      client_hello: &hello,
    };
    let payload = serde_json::to_value(&event).unwrap();
    assert_eq!(payload["name"], "tls_get_certificate");
    assert_eq!(payload["client_hello"]["server_name"], "example.com");
    assert_eq!(event.payload()["client_hello"]["server_name"], "example.com");
  }
}
