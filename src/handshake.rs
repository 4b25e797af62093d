use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rustls::sign::CertifiedKey;
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::certificate::Certificate;
use crate::config::Config;
use crate::error::Error;
use crate::hello::{ClientHelloInfo, Event};
use crate::manager::{Authority, CertificateStore, Stapler};
use crate::normalize::{normalize_server_name, subject_qualifies_for_cert};
use crate::selector::default_select;
use crate::singleflight::{wait_for_signal, Acquired};

/// Safety bound on waiting for another handshake's in-flight operation.
pub(crate) const WAITER_TIMEOUT: Duration = Duration::from_secs(120);
/// Bound on a foreground certificate obtain.
pub(crate) const OBTAIN_TIMEOUT: Duration = Duration::from_secs(180);
/// Bound on a renewal the handshake blocks on (expired or revoked).
pub(crate) const FOREGROUND_RENEW_TIMEOUT: Duration = Duration::from_secs(90);
/// Bound on a renewal detached from the handshake.
pub(crate) const BACKGROUND_RENEW_TIMEOUT: Duration = Duration::from_secs(300);
/// Bound on a detached renewal-info refresh.
pub(crate) const ARI_UPDATE_TIMEOUT: Duration = Duration::from_secs(480);

pub(crate) struct Inner {
  pub(crate) cache: Arc<Cache>,
  pub(crate) config: Config,
  pub(crate) store: Arc<dyn CertificateStore>,
  pub(crate) authority: Arc<dyn Authority>,
  pub(crate) stapler: Option<Arc<dyn Stapler>>,
}

/// Resolves certificates for TLS handshakes.
///
/// The resolver is invoked once per handshake, potentially thousands of
/// times concurrently. It serves from the cache where possible, collapses
/// concurrent loads and issuances per name, and never holds a handshake
/// longer than the per-operation timeouts allow.
#[derive(Clone)]
pub struct Resolver {
  pub(crate) inner: Arc<Inner>,
}

impl Resolver {
  pub fn new(
    cache: Arc<Cache>,
    config: Config,
    store: Arc<dyn CertificateStore>,
    authority: Arc<dyn Authority>,
    stapler: Option<Arc<dyn Stapler>>,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        cache,
        config,
        store,
        authority,
        stapler,
      }),
    }
  }

  /// The certificate cache this resolver serves from.
  pub fn cache(&self) -> &Arc<Cache> {
    &self.inner.cache
  }

  /// Seeds the cache with a certificate, e.g. one configured manually.
  pub async fn preload(&self, cert: Certificate) {
    self.inner.cache.insert(cert).await;
  }

  /// Produces a certificate for the given client hello.
  ///
  /// This is the handshake callback: it emits the `tls_get_certificate`
  /// event, short-circuits TLS-ALPN-01 challenge handshakes, and otherwise
  /// runs the full resolution ladder.
  pub async fn get_certificate(&self, hello: &ClientHelloInfo) -> Result<Arc<CertifiedKey>, Error> {
    self.emit_get_certificate_event(hello).await?;

    if hello.is_tls_alpn_challenge() {
      debug!(sni = %hello.server_name, "handshake is a TLS-ALPN challenge");
      return self.tls_alpn_challenge_cert(hello).await;
    }

    let cert = self.get_cert_during_handshake(hello, true).await?;
    Ok(cert.certified_key)
  }

  /// Resolves the full certificate record for a client hello, without the
  /// event emission and challenge shortcut of [`Self::get_certificate`].
  pub async fn resolve_certificate(&self, hello: &ClientHelloInfo) -> Result<Certificate, Error> {
    self.get_cert_during_handshake(hello, true).await
  }

  async fn emit_get_certificate_event(&self, hello: &ClientHelloInfo) -> Result<(), Error> {
    if let Some(events) = &self.inner.config.events {
      let event = Event {
        name: "tls_get_certificate",
        client_hello: hello,
      };
      events.on_event(&event).await.map_err(Error::EventAborted)?;
    }
    Ok(())
  }

  /// The main resolution ladder.
  ///
  /// With `load_or_obtain` unset (waiters re-entering after a signal) only
  /// the cache and the defaulted fallback are consulted; the cache is
  /// expected to hold the owner's result by then.
  pub(crate) async fn get_cert_during_handshake(
    &self,
    hello: &ClientHelloInfo,
    load_or_obtain: bool,
  ) -> Result<Certificate, Error> {
    let (cert, matched, defaulted) = self.cert_from_cache_for_hello(hello).await;

    if matched {
      let cert = cert.ok_or_else(|| Error::NotFound(hello.server_name.clone()))?;
      if load_or_obtain && cert.managed && self.inner.config.on_demand.is_some() {
        return self.optional_maintenance(hello, cert).await;
      }
      debug!(sni = %hello.server_name, hash = %cert.hash, "serving certificate from cache");
      return Ok(cert);
    }

    let name = self.name_from_hello(hello)?;

    if !load_or_obtain {
      if defaulted {
        if let Some(cert) = cert {
          return Ok(cert);
        }
      }
      return Err(Error::NotFound(name));
    }

    // No name resolved at all: nothing to load or obtain under.
    if name.is_empty() {
      if defaulted {
        if let Some(cert) = cert {
          return Ok(cert);
        }
      }
      return Err(Error::NotFound(name));
    }

    match self.inner.cache.loaders.acquire(&name) {
      Acquired::Waiter(rx) => {
        debug!(name = %name, "waiting for in-flight certificate load");
        wait_for_signal(rx, WAITER_TIMEOUT)
          .await
          .map_err(|_| Error::WaitTimeout(name.clone()))?;
        Box::pin(self.get_cert_during_handshake(hello, false)).await
      }
      Acquired::Owner(slot) => {
        let result = self.load_or_obtain_cert(hello, &name, cert, defaulted).await;
        // The slot releases only after the cache holds our result (or we
        // failed); waiters re-query the cache, never the channel.
        drop(slot);
        result
      }
    }
  }

  async fn load_or_obtain_cert(
    &self,
    hello: &ClientHelloInfo,
    name: &str,
    default_cert: Option<Certificate>,
    defaulted: bool,
  ) -> Result<Certificate, Error> {
    if let Some(on_demand) = &self.inner.config.on_demand {
      for (index, manager) in on_demand.managers.iter().enumerate() {
        match manager.get_certificate(hello).await {
          Ok(Some(key)) => {
            debug!(name = %name, manager = index, "external manager supplied certificate");
            return Certificate::from_certified_key(key, false, None).map_err(Error::Upstream);
          }
          Ok(None) => {}
          Err(err) => {
            warn!(name = %name, manager = index, error = %err, "external certificate manager failed");
          }
        }
      }
    }

    self.check_if_cert_should_be_obtained(hello, name, false).await?;

    let dynamic = self.inner.config.on_demand.is_some() || self.inner.cache.almost_full().await;
    if dynamic {
      match self.load_cert_from_storage(hello, name).await? {
        Some(cert) => return Ok(cert),
        None => {
          if self.inner.config.on_demand.is_some() {
            // The gate already ran above for this name.
            return self.obtain_on_demand_certificate(hello, name, false).await;
          }
        }
      }
    }

    if defaulted {
      if let Some(cert) = default_cert {
        debug!(name = %name, hash = %cert.hash, "serving fallback certificate");
        return Ok(cert);
      }
    }
    Err(Error::NotFound(name.to_string()))
  }

  /// Resolves the lookup name for a hello: normalized SNI, then the
  /// configured default server name, then the connection's local address.
  pub(crate) fn name_from_hello(&self, hello: &ClientHelloInfo) -> Result<String, Error> {
    let name = normalize_server_name(&hello.server_name)?;
    if !name.is_empty() {
      return Ok(name);
    }
    if let Some(default) = &self.inner.config.default_server_name {
      return normalize_server_name(default);
    }
    if let Some(local) = hello.local_addr {
      return Ok(local.ip().to_string());
    }
    Ok(String::new())
  }

  /// Looks a hello up in the cache.
  ///
  /// Returns `(certificate, matched, defaulted)`: `matched` means the name
  /// matched by exact or single-label-wildcard rule; `defaulted` means the
  /// certificate came from the configured default or fallback name.
  pub(crate) async fn cert_from_cache_for_hello(&self, hello: &ClientHelloInfo) -> (Option<Certificate>, bool, bool) {
    let now = Utc::now();
    let sni = normalize_server_name(&hello.server_name)
      .unwrap_or_else(|_| hello.server_name.trim().to_ascii_lowercase());

    if sni.is_empty() {
      if let Some(local) = hello.local_addr {
        if let Some(cert) = self.select_from_cache(hello, &local.ip().to_string(), now).await {
          return (Some(cert), true, false);
        }
      }
      if let Some(default) = &self.inner.config.default_server_name {
        if let Ok(default) = normalize_server_name(default) {
          if let Some(cert) = self.select_from_cache(hello, &default, now).await {
            return (Some(cert), false, true);
          }
        }
      }
    } else {
      if let Some(cert) = self.select_from_cache(hello, &sni, now).await {
        return (Some(cert), true, false);
      }

      // Single-label wildcard search: substitute `*` at one label position
      // at a time, in label-index order, stopping at the first match.
      let labels: Vec<&str> = sni.split('.').collect();
      if labels.len() > 1 {
        for i in 0..labels.len() {
          let mut candidate: Vec<&str> = labels.clone();
          candidate[i] = "*";
          let candidate = candidate.join(".");
          if let Some(cert) = self.select_from_cache(hello, &candidate, now).await {
            return (Some(cert), true, false);
          }
        }
      }
    }

    if let Some(fallback) = &self.inner.config.fallback_server_name {
      if let Ok(fallback) = normalize_server_name(fallback) {
        if let Some(cert) = self.select_from_cache(hello, &fallback, now).await {
          return (Some(cert), false, true);
        }
      }
    }

    (None, false, false)
  }

  /// Selects among the cached candidates for one concrete name.
  async fn select_from_cache(
    &self,
    hello: &ClientHelloInfo,
    name: &str,
    now: chrono::DateTime<Utc>,
  ) -> Option<Certificate> {
    let mut choices = self.inner.cache.certs_for_name(name).await;

    // A single candidate is returned unconditionally, custom selector or not.
    if choices.len() == 1 {
      return Some(choices.remove(0));
    }

    if let Some(selector) = &self.inner.config.selector {
      // With no candidates for the name, a custom selector sees the whole cache.
      let choices = if choices.is_empty() {
        self.inner.cache.all().await
      } else {
        choices
      };
      if choices.is_empty() {
        return None;
      }
      return match selector.select(hello, &choices) {
        Ok(cert) => Some(cert),
        Err(err) => {
          debug!(name = %name, error = %err, "custom certificate selector declined");
          None
        }
      };
    }

    default_select(hello, &choices, now)
  }

  /// Applies the on-demand policy gate.
  pub(crate) async fn check_if_cert_should_be_obtained(
    &self,
    hello: &ClientHelloInfo,
    name: &str,
    require_on_demand: bool,
  ) -> Result<(), Error> {
    let on_demand = self.inner.config.on_demand.as_ref();
    if require_on_demand && on_demand.is_none() {
      return Err(Error::denied(name, "not configured for on-demand issuance"));
    }
    if !subject_qualifies_for_cert(name) {
      return Err(Error::InvalidName(name.to_string()));
    }
    if let Some(on_demand) = on_demand {
      if let Some(policy) = &on_demand.policy {
        return policy.allow(hello, name).await.map_err(|err| Error::denied(name, err));
      }
      if !on_demand.allowed_names.is_empty() && !on_demand.allowed_names.contains(name) {
        return Err(Error::denied(name, "name is not on the allow-list"));
      }
    }
    Ok(())
  }

  /// Loads a certificate for `name` from storage into the cache, falling
  /// back to the covering single-label wildcard. The loaded record goes
  /// through handshake maintenance before it is returned.
  pub(crate) async fn load_cert_from_storage(
    &self,
    hello: &ClientHelloInfo,
    name: &str,
  ) -> Result<Option<Certificate>, Error> {
    let mut loaded = self.inner.store.load_certificate(name).await.map_err(Error::Upstream)?;

    if loaded.is_none() {
      if let Some((label, rest)) = name.split_once('.') {
        if label != "*" && !rest.is_empty() {
          let wildcard = format!("*.{rest}");
          loaded = self
            .inner
            .store
            .load_certificate(&wildcard)
            .await
            .map_err(Error::Upstream)?;
        }
      }
    }

    let Some(cert) = loaded else {
      return Ok(None);
    };
    debug!(name = %name, hash = %cert.hash, "loaded certificate from storage");
    self.inner.cache.insert(cert.clone()).await;
    let cert = self.handshake_maintenance(hello, cert).await?;
    Ok(Some(cert))
  }

  /// Obtains a certificate from the authority, collapsing concurrent
  /// requests for the same name to a single issuance.
  ///
  /// `require_on_demand` gates the policy re-check: callers whose path is
  /// only legal under on-demand issuance pass `true`; paths that obtain
  /// regardless of on-demand configuration (vanished storage resources,
  /// pre-checked callers) pass `false`.
  pub(crate) async fn obtain_on_demand_certificate(
    &self,
    hello: &ClientHelloInfo,
    name: &str,
    require_on_demand: bool,
  ) -> Result<Certificate, Error> {
    match self.inner.cache.issuers.acquire(name) {
      Acquired::Waiter(rx) => {
        debug!(name = %name, "waiting for in-flight issuance");
        wait_for_signal(rx, WAITER_TIMEOUT)
          .await
          .map_err(|_| Error::WaitTimeout(name.to_string()))?;
        Box::pin(self.get_cert_during_handshake(hello, false)).await
      }
      Acquired::Owner(slot) => {
        self
          .check_if_cert_should_be_obtained(hello, name, require_on_demand)
          .await?;

        info!(name = %name, "obtaining certificate on demand");
        match tokio::time::timeout(OBTAIN_TIMEOUT, self.inner.authority.obtain_certificate(name)).await {
          Ok(Ok(())) => {}
          Ok(Err(err)) => return Err(Error::Upstream(err.context(format!("obtaining certificate for {name}")))),
          Err(_) => {
            return Err(Error::Upstream(anyhow::anyhow!(
              "obtaining certificate for {name}: timed out"
            )))
          }
        }

        let cert = self
          .load_cert_from_storage(hello, name)
          .await?
          .ok_or_else(|| Error::Upstream(anyhow::anyhow!("certificate obtained for {name} but missing from storage")))?;
        drop(slot);
        Ok(cert)
      }
    }
  }

  /// Renews `current`, collapsing concurrent renewals per name.
  ///
  /// While time remains and the certificate is not revoked, the renewal
  /// runs on a detached task and `current` is served immediately; an
  /// expired or revoked certificate blocks the handshake on the renewal.
  pub(crate) async fn renew_dynamic_certificate(
    &self,
    hello: &ClientHelloInfo,
    current: Certificate,
  ) -> Result<Certificate, Error> {
    let name = self.name_from_hello(hello)?;
    let now = Utc::now();
    let usable = now < current.not_after;
    let revoked = current.revoked();

    match self.inner.cache.issuers.acquire(&name) {
      Acquired::Waiter(rx) => {
        if usable && !revoked {
          debug!(name = %name, "renewal already in flight, serving current certificate");
          return Ok(current);
        }
        debug!(name = %name, "waiting for in-flight renewal");
        wait_for_signal(rx, WAITER_TIMEOUT)
          .await
          .map_err(|_| Error::WaitTimeout(name.clone()))?;
        Box::pin(self.get_cert_during_handshake(hello, false)).await
      }
      Acquired::Owner(slot) => {
        if usable && !revoked {
          let this = self.clone();
          let background_hello = hello.clone();
          let background_name = name.clone();
          let background_current = current.clone();
          tokio::spawn(async move {
            let renewed = tokio::time::timeout(
              BACKGROUND_RENEW_TIMEOUT,
              this.renew_and_reload(&background_hello, &background_name, &background_current, false),
            )
            .await;
            match renewed {
              Ok(Ok(_)) => info!(name = %background_name, "background renewal finished"),
              Ok(Err(err)) => warn!(name = %background_name, error = %err, "background renewal failed"),
              Err(_) => warn!(name = %background_name, "background renewal timed out"),
            }
            drop(slot);
          });
          return Ok(current);
        }

        let result = tokio::time::timeout(
          FOREGROUND_RENEW_TIMEOUT,
          self.renew_and_reload(hello, &name, &current, revoked),
        )
        .await;
        drop(slot);
        match result {
          Ok(renewed) => renewed,
          Err(_) => Err(Error::Upstream(anyhow::anyhow!("renewing certificate for {name}: timed out"))),
        }
      }
    }
  }

  async fn renew_and_reload(
    &self,
    hello: &ClientHelloInfo,
    name: &str,
    current: &Certificate,
    force: bool,
  ) -> Result<Certificate, Error> {
    if let Err(err) = self.check_if_cert_should_be_obtained(hello, name, true).await {
      self.inner.cache.remove(&current.hash).await;
      return Err(err);
    }

    info!(name = %name, force, "renewing certificate");
    self
      .inner
      .authority
      .renew_certificate(name, force)
      .await
      .map_err(|err| Error::Upstream(err.context(format!("renewing certificate for {name}"))))?;

    let stored_name = current.names.first().map(String::as_str).unwrap_or(name);
    let renewed = self
      .inner
      .store
      .load_certificate(stored_name)
      .await
      .map_err(Error::Upstream)?
      .ok_or_else(|| Error::Upstream(anyhow::anyhow!("certificate renewed for {name} but missing from storage")))?;

    self.inner.cache.replace(&current.hash, renewed.clone()).await;
    Ok(renewed)
  }
}
