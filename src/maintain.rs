use chrono::Utc;
use tracing::{debug, info, warn};

use crate::certificate::Certificate;
use crate::error::Error;
use crate::handshake::{Resolver, ARI_UPDATE_TIMEOUT};
use crate::hello::ClientHelloInfo;

impl Resolver {
  /// Runs handshake maintenance, preferring to serve a usable certificate
  /// when maintenance itself fails.
  pub(crate) async fn optional_maintenance(
    &self,
    hello: &ClientHelloInfo,
    cert: Certificate,
  ) -> Result<Certificate, Error> {
    match self.handshake_maintenance(hello, cert.clone()).await {
      Ok(maintained) => Ok(maintained),
      Err(err) => {
        let now = Utc::now();
        if cert.currently_valid(now) && !cert.revoked() {
          warn!(hash = %cert.hash, error = %err, "maintenance failed, serving current certificate");
          Ok(cert)
        } else {
          Err(err)
        }
      }
    }
  }

  /// Checks a chosen certificate's health and repairs what it can.
  ///
  /// OCSP staleness is fixed synchronously (errors logged, not returned);
  /// ARI refresh runs detached; a revoked certificate forces a blocking
  /// renewal; and an approaching expiration routes to renew or, when the
  /// stored resources vanished, straight to a fresh obtain. The caller
  /// must substitute the returned record for the one it held.
  pub(crate) async fn handshake_maintenance(
    &self,
    hello: &ClientHelloInfo,
    cert: Certificate,
  ) -> Result<Certificate, Error> {
    let now = Utc::now();
    let mut cert = cert;

    // Refresh a stale staple before the certificate is served again.
    if let Some(ocsp) = &cert.ocsp {
      if !ocsp.fresh(now, self.inner.config.ocsp_refresh_margin()) {
        if let Some(stapler) = &self.inner.stapler {
          match stapler.staple(&cert).await {
            Ok(staple) => {
              debug!(hash = %cert.hash, "refreshed OCSP staple");
              let updated = cert.with_ocsp(staple);
              self.inner.cache.replace(&cert.hash, updated.clone()).await;
              cert = updated;
            }
            Err(err) => {
              warn!(hash = %cert.hash, error = %err, "OCSP staple refresh failed");
            }
          }
        }
      }
    }

    if self.inner.config.ari_enabled {
      let ari_due = cert.ari.as_ref().is_some_and(|ari| ari.needs_refresh(now));
      if ari_due && now < cert.not_after {
        self.spawn_ari_refresh(hello, &cert);
      }
    }

    if cert.revoked() {
      info!(hash = %cert.hash, "certificate is revoked, forcing renewal");
      return self.renew_dynamic_certificate(hello, cert).await;
    }

    if cert.needs_renewal(now, self.inner.config.ari_enabled, self.inner.config.renew_before()) {
      let first_name = cert.names.first().cloned().unwrap_or_default();
      if !self.inner.store.has_cert_resources_any_issuer(&first_name).await {
        info!(name = %first_name, "stored resources missing, obtaining fresh certificate");
        let name = self.name_from_hello(hello)?;
        // Obtaining here repairs a managed certificate that can no longer
        // be renewed; it is not gated on on-demand being configured.
        return Box::pin(self.obtain_on_demand_certificate(hello, &name, false)).await;
      }
      return self.renew_dynamic_certificate(hello, cert).await;
    }

    Ok(cert)
  }

  /// Fetches updated renewal info on a detached task, then renews if the
  /// refreshed info says the window has opened.
  fn spawn_ari_refresh(&self, hello: &ClientHelloInfo, cert: &Certificate) {
    let this = self.clone();
    let hello = hello.clone();
    let cert = cert.clone();
    tokio::spawn(async move {
      let refreshed = tokio::time::timeout(ARI_UPDATE_TIMEOUT, async {
        let ari = this.inner.authority.update_renewal_info(&cert).await?;
        let mut updated = cert.clone();
        updated.ari = ari;
        this.inner.cache.replace(&cert.hash, updated.clone()).await;

        let now = Utc::now();
        if updated.needs_renewal(now, true, this.inner.config.renew_before()) {
          this
            .renew_dynamic_certificate(&hello, updated)
            .await
            .map_err(|err| anyhow::anyhow!(err))?;
        }
        Ok::<_, anyhow::Error>(())
      })
      .await;
      match refreshed {
        Ok(Ok(())) => debug!(hash = %cert.hash, "renewal info refreshed"),
        Ok(Err(err)) => warn!(hash = %cert.hash, error = %err, "renewal info refresh failed"),
        Err(_) => warn!(hash = %cert.hash, "renewal info refresh timed out"),
      }
    });
  }
}
