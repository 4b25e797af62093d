use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rcgen::{CertificateParams, KeyPair};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::certificate::{Certificate, OcspStaple, RenewalInfo};
use crate::manager::{Authority, CertificateStore, ChallengeInfo, Stapler};

pub(crate) fn install_provider() {
  let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Generates a self-signed chain for tests. Validity runs from
/// `not_before_days` to `not_after_days` relative to now (negative =
/// in the past).
pub(crate) fn self_signed_chain(
  names: &[&str],
  not_before_days: i64,
  not_after_days: i64,
) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
  let mut params = CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>()).unwrap();
  let now = time::OffsetDateTime::now_utc();
  params.not_before = now + time::Duration::days(not_before_days);
  params.not_after = now + time::Duration::days(not_after_days);
  let key_pair = KeyPair::generate().unwrap();
  let certificate = params.self_signed(&key_pair).unwrap();
  let private_key = PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap();
  (vec![certificate.der().to_owned()], private_key)
}

pub(crate) fn test_certificate(names: &[&str], managed: bool) -> Certificate {
  test_certificate_with_validity_managed(names, -1, 60, managed)
}

pub(crate) fn test_certificate_with_validity(names: &[&str], not_before_days: i64, not_after_days: i64) -> Certificate {
  test_certificate_with_validity_managed(names, not_before_days, not_after_days, true)
}

pub(crate) fn test_certificate_with_validity_managed(
  names: &[&str],
  not_before_days: i64,
  not_after_days: i64,
  managed: bool,
) -> Certificate {
  let (chain, key) = self_signed_chain(names, not_before_days, not_after_days);
  let issuer_key = managed.then(|| "test-ca".to_string());
  Certificate::from_chain(chain, key, managed, issuer_key).unwrap()
}

/// In-memory store with call counters, standing in for persistent storage.
#[derive(Default)]
pub(crate) struct MemoryStore {
  certs: Mutex<HashMap<String, Certificate>>,
  challenges: Mutex<HashMap<String, ChallengeInfo>>,
  pub(crate) load_calls: AtomicUsize,
  /// When set, reports no stored resources for any name, simulating
  /// certificate resources vanishing out from under a cached record.
  pub(crate) report_no_resources: AtomicBool,
}

impl MemoryStore {
  pub(crate) fn put(&self, cert: Certificate) {
    let mut certs = self.certs.lock().unwrap();
    for name in &cert.names {
      certs.insert(name.clone(), cert.clone());
    }
  }

  pub(crate) fn put_challenge(&self, sni: &str, info: ChallengeInfo) {
    self.challenges.lock().unwrap().insert(sni.to_string(), info);
  }
}

#[async_trait]
impl CertificateStore for MemoryStore {
  async fn load_certificate(&self, name: &str) -> anyhow::Result<Option<Certificate>> {
    self.load_calls.fetch_add(1, Ordering::SeqCst);
    Ok(self.certs.lock().unwrap().get(name).cloned())
  }

  async fn has_cert_resources_any_issuer(&self, name: &str) -> bool {
    if self.report_no_resources.load(Ordering::SeqCst) {
      return false;
    }
    self.certs.lock().unwrap().contains_key(name)
  }

  async fn challenge_info(&self, sni: &str) -> anyhow::Result<Option<ChallengeInfo>> {
    Ok(self.challenges.lock().unwrap().get(sni).cloned())
  }
}

/// Mock certificate authority writing issued certificates into a
/// [`MemoryStore`], with call counters and an optional artificial delay.
pub(crate) struct MockAuthority {
  store: Arc<MemoryStore>,
  pub(crate) obtain_calls: AtomicUsize,
  pub(crate) renew_calls: AtomicUsize,
  pub(crate) force_renew_calls: AtomicUsize,
  pub(crate) obtain_delay: Option<std::time::Duration>,
  pub(crate) fail_obtain: bool,
}

impl MockAuthority {
  pub(crate) fn new(store: Arc<MemoryStore>) -> Self {
    Self {
      store,
      obtain_calls: AtomicUsize::new(0),
      renew_calls: AtomicUsize::new(0),
      force_renew_calls: AtomicUsize::new(0),
      obtain_delay: None,
      fail_obtain: false,
    }
  }
}

#[async_trait]
impl Authority for MockAuthority {
  async fn obtain_certificate(&self, name: &str) -> anyhow::Result<()> {
    self.obtain_calls.fetch_add(1, Ordering::SeqCst);
    if let Some(delay) = self.obtain_delay {
      tokio::time::sleep(delay).await;
    }
    if self.fail_obtain {
      anyhow::bail!("issuance refused by mock authority");
    }
    self.store.put(test_certificate(&[name], true));
    Ok(())
  }

  async fn renew_certificate(&self, name: &str, force: bool) -> anyhow::Result<()> {
    self.renew_calls.fetch_add(1, Ordering::SeqCst);
    if force {
      self.force_renew_calls.fetch_add(1, Ordering::SeqCst);
    }
    self.store.put(test_certificate(&[name], true));
    Ok(())
  }

  async fn update_renewal_info(&self, _cert: &Certificate) -> anyhow::Result<Option<RenewalInfo>> {
    let now = Utc::now();
    Ok(Some(RenewalInfo {
      window_start: now + Duration::days(30),
      window_end: now + Duration::days(31),
      selected_time: now + Duration::days(30),
      retry_after: Some(now + Duration::days(1)),
    }))
  }
}

/// Mock stapler returning a preconfigured staple.
pub(crate) struct MockStapler {
  pub(crate) staple: OcspStaple,
  pub(crate) staple_calls: AtomicUsize,
}

#[async_trait]
impl Stapler for MockStapler {
  async fn staple(&self, _cert: &Certificate) -> anyhow::Result<OcspStaple> {
    self.staple_calls.fetch_add(1, Ordering::SeqCst);
    Ok(self.staple.clone())
  }
}
