use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rustls::crypto::CryptoProvider;
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};
use xxhash_rust::xxh3::xxh3_128;

/// Revocation status carried by a stapled OCSP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcspStatus {
  Good,
  Revoked,
  Unknown,
}

/// A stapled OCSP response with the fields resolution decisions depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcspStaple {
  pub status: OcspStatus,
  pub this_update: DateTime<Utc>,
  pub next_update: DateTime<Utc>,
  pub revoked_at: Option<DateTime<Utc>>,
  /// The raw DER response, attached to served certificates.
  pub der: Vec<u8>,
}

impl OcspStaple {
  /// Whether the staple is still usable: `now` inside
  /// `[this_update, next_update - margin]`.
  pub fn fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
    self.this_update <= now && now <= self.next_update - margin
  }
}

/// A renewal-info record supplied by the certificate authority (ARI).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalInfo {
  /// Start of the suggested renewal window.
  pub window_start: DateTime<Utc>,
  /// End of the suggested renewal window.
  pub window_end: DateTime<Utc>,
  /// A uniformly chosen instant inside the window at which to act.
  pub selected_time: DateTime<Utc>,
  /// When to ask the authority for updated renewal info again.
  pub retry_after: Option<DateTime<Utc>>,
}

impl RenewalInfo {
  /// Whether the record itself is due for a refresh from the authority.
  pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
    match self.retry_after {
      Some(retry_after) => retry_after <= now,
      None => true,
    }
  }
}

/// An immutable snapshot of a certificate chain plus derived metadata.
///
/// Records are replaced whole in the cache, never mutated in place; the
/// only field that changes over a record's life is the OCSP staple, and
/// that change produces a new record under the same lookup names.
#[derive(Debug, Clone)]
pub struct Certificate {
  /// DNS names and IP addresses the leaf certifies, lower-case punycode.
  pub names: Vec<String>,
  /// The chain and signing key handed to the TLS stack.
  pub certified_key: Arc<CertifiedKey>,
  pub not_before: DateTime<Utc>,
  pub not_after: DateTime<Utc>,
  /// Stable content hash over the public chain; the cache's primary key.
  pub hash: String,
  /// Identifier of the issuing authority, set for managed records.
  pub issuer_key: Option<String>,
  /// Whether this library owns the record's lifecycle.
  pub managed: bool,
  pub ocsp: Option<OcspStaple>,
  pub ari: Option<RenewalInfo>,
}

impl Certificate {
  /// Builds a record from a DER chain and its private key.
  ///
  /// The signing key is loaded through the process-default crypto provider.
  pub fn from_chain(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    managed: bool,
    issuer_key: Option<String>,
  ) -> anyhow::Result<Self> {
    let signing_key = CryptoProvider::get_default()
      .ok_or_else(|| anyhow::anyhow!("no default crypto provider installed"))?
      .key_provider
      .load_private_key(key)
      .map_err(|e| anyhow::anyhow!("invalid private key: {e}"))?;
    Self::from_certified_key(Arc::new(CertifiedKey::new(chain, signing_key)), managed, issuer_key)
  }

  /// Builds a record around an existing certified key.
  pub fn from_certified_key(
    certified_key: Arc<CertifiedKey>,
    managed: bool,
    issuer_key: Option<String>,
  ) -> anyhow::Result<Self> {
    if managed && issuer_key.is_none() {
      anyhow::bail!("managed certificate requires an issuer key");
    }
    let leaf = certified_key
      .cert
      .first()
      .ok_or_else(|| anyhow::anyhow!("certificate chain is empty"))?;
    let (_, x509) = X509Certificate::from_der(leaf.as_ref()).context("parsing leaf certificate")?;

    let mut names = Vec::new();
    if let Ok(Some(san)) = x509.subject_alternative_name() {
      for general_name in &san.value.general_names {
        match general_name {
          GeneralName::DNSName(dns) => names.push(dns.to_ascii_lowercase()),
          GeneralName::IPAddress(bytes) => {
            if let Some(ip) = ip_from_san_bytes(bytes) {
              names.push(ip.to_string());
            }
          }
          _ => {}
        }
      }
    }
    if names.is_empty() {
      if let Some(cn) = x509.subject().iter_common_name().next().and_then(|a| a.as_str().ok()) {
        names.push(cn.to_ascii_lowercase());
      }
    }
    if names.is_empty() {
      anyhow::bail!("certificate carries no identifiers");
    }

    let validity = x509.validity();
    let not_before = DateTime::<Utc>::from_timestamp(validity.not_before.timestamp(), 0)
      .ok_or_else(|| anyhow::anyhow!("leaf NotBefore out of range"))?;
    let not_after = DateTime::<Utc>::from_timestamp(validity.not_after.timestamp(), 0)
      .ok_or_else(|| anyhow::anyhow!("leaf NotAfter out of range"))?;

    let hash = hash_chain(&certified_key.cert);

    Ok(Self {
      names,
      certified_key,
      not_before,
      not_after,
      hash,
      issuer_key,
      managed,
      ocsp: None,
      ari: None,
    })
  }

  /// Produces a replacement record carrying a refreshed OCSP staple.
  ///
  /// The certified key is rebuilt so the staple rides along in handshakes.
  pub fn with_ocsp(&self, staple: OcspStaple) -> Self {
    let mut certified_key = (*self.certified_key).clone();
    certified_key.ocsp = Some(staple.der.clone());
    Self {
      certified_key: Arc::new(certified_key),
      ocsp: Some(staple),
      ..self.clone()
    }
  }

  /// Whether the record's revocation status is `Revoked`.
  pub fn revoked(&self) -> bool {
    self.ocsp.as_ref().is_some_and(|o| o.status == OcspStatus::Revoked)
  }

  /// Whether the certificate is currently inside its validity window.
  pub fn currently_valid(&self, now: DateTime<Utc>) -> bool {
    self.not_before <= now && now < self.not_after
  }

  /// Decides whether renewal is due.
  ///
  /// An ARI window that has opened takes priority when `include_ari` is
  /// set; otherwise renewal triggers once the remaining lifetime drops
  /// below half the total lifetime, capped at `renew_before`.
  pub fn needs_renewal(&self, now: DateTime<Utc>, include_ari: bool, renew_before: Duration) -> bool {
    if include_ari {
      if let Some(ari) = &self.ari {
        if ari.selected_time <= now || ari.window_start <= now {
          return true;
        }
      }
    }
    let lifetime = self.not_after - self.not_before;
    let window = std::cmp::min(lifetime / 2, renew_before);
    self.not_after - now <= window
  }
}

/// Stable content hash over a public chain: xxh3-128 of the concatenated
/// DER, base64 url-safe without padding.
pub fn hash_chain(chain: &[CertificateDer<'static>]) -> String {
  let mut data = Vec::new();
  for der in chain {
    data.extend_from_slice(der.as_ref());
  }
  base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(xxh3_128(&data).to_be_bytes())
}

fn ip_from_san_bytes(bytes: &[u8]) -> Option<IpAddr> {
  match bytes.len() {
    4 => {
      let octets: [u8; 4] = bytes.try_into().ok()?;
      Some(IpAddr::from(octets))
    }
    16 => {
      let octets: [u8; 16] = bytes.try_into().ok()?;
      Some(IpAddr::from(octets))
    }
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testutil::{install_provider, self_signed_chain};

  #[test]
  fn test_from_chain_parses_names_and_validity() {
    install_provider();
    let (chain, key) = self_signed_chain(&["Example.COM", "www.example.com"], -1, 30);
    let cert = Certificate::from_chain(chain, key, true, Some("acme-ca".to_string())).unwrap();

    assert_eq!(cert.names, vec!["example.com", "www.example.com"]);
    assert!(cert.managed);
    assert!(!cert.hash.is_empty());
    let now = Utc::now();
    assert!(cert.currently_valid(now));
  }

  #[test]
  fn test_hash_is_pure_function_of_chain() {
    install_provider();
    let (chain, key) = self_signed_chain(&["example.com"], -1, 30);
    let hash_direct = hash_chain(&chain);
    let cert = Certificate::from_chain(chain, key, false, None).unwrap();
    assert_eq!(cert.hash, hash_direct);
  }

  #[test]
  fn test_managed_requires_issuer_key() {
    install_provider();
    let (chain, key) = self_signed_chain(&["example.com"], -1, 30);
    assert!(Certificate::from_chain(chain, key, true, None).is_err());
  }

  #[test]
  fn test_needs_renewal_window() {
    install_provider();
    let now = Utc::now();

    let (chain, key) = self_signed_chain(&["fresh.example.com"], -1, 89);
    let fresh = Certificate::from_chain(chain, key, false, None).unwrap();
    assert!(!fresh.needs_renewal(now, true, Duration::days(30)));

    let (chain, key) = self_signed_chain(&["stale.example.com"], -80, 10);
    let stale = Certificate::from_chain(chain, key, false, None).unwrap();
    assert!(stale.needs_renewal(now, true, Duration::days(30)));
  }

  #[test]
  fn test_needs_renewal_ari_window_open() {
    install_provider();
    let now = Utc::now();
    let (chain, key) = self_signed_chain(&["example.com"], -1, 89);
    let mut cert = Certificate::from_chain(chain, key, false, None).unwrap();
    cert.ari = Some(RenewalInfo {
      window_start: now - Duration::hours(1),
      window_end: now + Duration::hours(1),
      selected_time: now - Duration::minutes(30),
      retry_after: Some(now + Duration::hours(6)),
    });
    assert!(cert.needs_renewal(now, true, Duration::days(30)));
    assert!(!cert.needs_renewal(now, false, Duration::days(30)));
  }

  #[test]
  fn test_with_ocsp_replaces_staple_and_key() {
    install_provider();
    let now = Utc::now();
    let (chain, key) = self_signed_chain(&["example.com"], -1, 30);
    let cert = Certificate::from_chain(chain, key, false, None).unwrap();
    let staple = OcspStaple {
      status: OcspStatus::Good,
      this_update: now - Duration::hours(1),
      next_update: now + Duration::days(3),
      revoked_at: None,
      der: vec![1, 2, 3],
    };

    let updated = cert.with_ocsp(staple.clone());
    assert_eq!(updated.hash, cert.hash);
    assert_eq!(updated.ocsp, Some(staple));
    assert_eq!(updated.certified_key.ocsp.as_deref(), Some(&[1u8, 2, 3][..]));
    assert!(cert.ocsp.is_none());
  }

  #[test]
  fn test_ocsp_freshness() {
    let now = Utc::now();
    let staple = OcspStaple {
      status: OcspStatus::Good,
      this_update: now - Duration::days(1),
      next_update: now + Duration::hours(2),
      revoked_at: None,
      der: Vec::new(),
    };
    assert!(staple.fresh(now, Duration::hours(1)));
    assert!(!staple.fresh(now, Duration::hours(3)));
  }
}
