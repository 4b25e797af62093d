use std::sync::Arc;

use async_trait::async_trait;
use rustls::sign::CertifiedKey;

use crate::certificate::{Certificate, OcspStaple, RenewalInfo};
use crate::hello::{ClientHelloInfo, Event};

/// Challenge data registered for a name undergoing TLS-ALPN-01 validation.
#[derive(Clone)]
pub struct ChallengeInfo {
  /// The ACME key authorization for the pending challenge.
  pub key_authorization: String,
  /// A precomputed challenge certificate, preferred over local synthesis.
  pub cert: Option<Arc<CertifiedKey>>,
  /// Whether the challenge data came from a distributed registry.
  pub distributed: bool,
}

/// Persistent storage holding managed certificates and challenge state.
///
/// Implementations parse stored material into [`Certificate`] records; the
/// resolver owns all cache interaction.
#[async_trait]
pub trait CertificateStore: Send + Sync {
  /// Loads the certificate stored for exactly `name`, or `None` when the
  /// name has no stored resources.
  async fn load_certificate(&self, name: &str) -> anyhow::Result<Option<Certificate>>;

  /// Whether any issuer has certificate resources stored for `name`.
  async fn has_cert_resources_any_issuer(&self, name: &str) -> bool;

  /// Looks up pending TLS-ALPN-01 challenge data for an SNI value.
  async fn challenge_info(&self, sni: &str) -> anyhow::Result<Option<ChallengeInfo>>;
}

/// The certificate authority client.
///
/// Obtain and renew write their results through storage; the resolver
/// re-loads via [`CertificateStore`] so the cache is populated before any
/// waiter is unblocked.
#[async_trait]
pub trait Authority: Send + Sync {
  /// Obtains a brand-new certificate for `name`.
  async fn obtain_certificate(&self, name: &str) -> anyhow::Result<()>;

  /// Renews the certificate for `name`. With `force`, existing key
  /// material is invalidated regardless of time remaining.
  async fn renew_certificate(&self, name: &str, force: bool) -> anyhow::Result<()>;

  /// Fetches updated renewal info for a certificate, if the authority
  /// publishes any.
  async fn update_renewal_info(&self, cert: &Certificate) -> anyhow::Result<Option<RenewalInfo>>;
}

/// Fetches a fresh OCSP response for a certificate.
#[async_trait]
pub trait Stapler: Send + Sync {
  async fn staple(&self, cert: &Certificate) -> anyhow::Result<OcspStaple>;
}

/// An external certificate source consulted before dynamic issuance.
///
/// Managers are tried in configured order; the first that returns a
/// certificate wins, and errors fall through to the next manager.
#[async_trait]
pub trait ExternalCertManager: Send + Sync {
  async fn get_certificate(&self, hello: &ClientHelloInfo) -> anyhow::Result<Option<Arc<CertifiedKey>>>;
}

/// Per-request issuance decision for on-demand TLS.
///
/// Returning an error refuses issuance for this name; the error message is
/// surfaced as the denial reason.
#[async_trait]
pub trait OnDemandPolicy: Send + Sync {
  async fn allow(&self, hello: &ClientHelloInfo, name: &str) -> anyhow::Result<()>;
}

/// Receives resolver events; an error aborts the triggering handshake.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
  async fn on_event(&self, event: &Event<'_>) -> anyhow::Result<()>;
}

/// Custom certificate selection among cached candidates.
///
/// An error is treated as "no usable selection" and the default lookup
/// ordering moves on.
pub trait SelectsCertificate: Send + Sync {
  fn select(&self, hello: &ClientHelloInfo, choices: &[Certificate]) -> anyhow::Result<Certificate>;
}
