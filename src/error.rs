use std::fmt;

/// Errors surfaced by certificate resolution during a TLS handshake.
///
/// Every variant is fatal for the handshake that observed it; background
/// operations (OCSP refresh, detached renewals) log their failures instead
/// of returning them here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// An event subscriber aborted the handshake.
  #[error("handshake aborted by event handler: {0}")]
  EventAborted(anyhow::Error),

  /// The server name failed normalization or does not qualify for a certificate.
  #[error("invalid server name {0:?}")]
  InvalidName(String),

  /// The on-demand policy refused issuance for this name.
  #[error("certificate not allowed for {name:?}: {reason}")]
  PolicyDenied { name: String, reason: String },

  /// No matching certificate in cache or storage, and no path to obtain one.
  #[error("no certificate available for {0:?}")]
  NotFound(String),

  /// Waiting on another handshake's in-flight operation exceeded the safety timeout.
  #[error("timed out waiting for certificate for {0:?}")]
  WaitTimeout(String),

  /// The caller's context ended before resolution completed.
  #[error("certificate resolution cancelled")]
  Cancelled,

  /// An external collaborator (manager, storage, authority, stapler) failed.
  #[error("upstream error: {0}")]
  Upstream(anyhow::Error),

  /// A TLS-ALPN-01 challenge certificate could not be produced.
  #[error("solving TLS-ALPN challenge for {name:?}: {reason}")]
  ChallengeSolveFailed { name: String, reason: String },
}

impl Error {
  pub(crate) fn challenge_failed(name: &str, reason: impl fmt::Display) -> Self {
    Error::ChallengeSolveFailed {
      name: name.to_string(),
      reason: reason.to_string(),
    }
  }

  pub(crate) fn denied(name: &str, reason: impl fmt::Display) -> Self {
    Error::PolicyDenied {
      name: name.to_string(),
      reason: reason.to_string(),
    }
  }
}

impl From<anyhow::Error> for Error {
  fn from(err: anyhow::Error) -> Self {
    Error::Upstream(err)
  }
}
