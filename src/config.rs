use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;

use crate::manager::{EventSubscriber, ExternalCertManager, OnDemandPolicy, SelectsCertificate};

/// Tuning and policy options for a resolver.
#[derive(Clone, Default)]
pub struct Config {
  /// Name looked up when the client sent no SNI and the connection's
  /// local address is unknown or misses.
  pub default_server_name: Option<String>,
  /// Name tried as a last resort when nothing matched; certificates
  /// served this way are marked as defaulted, not matched.
  pub fallback_server_name: Option<String>,
  /// Enables dynamic issuance at handshake time.
  pub on_demand: Option<OnDemandConfig>,
  /// Custom certificate selection; `None` uses the default rule.
  pub selector: Option<Arc<dyn SelectsCertificate>>,
  /// Event subscriber; errors abort the triggering handshake.
  pub events: Option<Arc<dyn EventSubscriber>>,
  /// How far before expiration renewal becomes due. The effective window
  /// never exceeds half the certificate's lifetime.
  pub renew_before: Option<Duration>,
  /// How long before an OCSP response's NextUpdate it counts as stale.
  pub ocsp_refresh_margin: Option<Duration>,
  /// Whether ACME renewal info (ARI) drives refresh decisions.
  pub ari_enabled: bool,
}

impl Config {
  pub(crate) fn renew_before(&self) -> Duration {
    self.renew_before.unwrap_or_else(|| Duration::days(30))
  }

  pub(crate) fn ocsp_refresh_margin(&self) -> Duration {
    self.ocsp_refresh_margin.unwrap_or_else(|| Duration::hours(1))
  }
}

/// Configuration of on-demand issuance.
#[derive(Clone, Default)]
pub struct OnDemandConfig {
  /// Names allowed to trigger issuance. Empty means no allow-list; the
  /// decision policy (or, absent one, anything syntactically valid) rules.
  pub allowed_names: HashSet<String>,
  /// Per-request decision callback; takes precedence over the allow-list.
  pub policy: Option<Arc<dyn OnDemandPolicy>>,
  /// External certificate sources tried before dynamic issuance.
  pub managers: Vec<Arc<dyn ExternalCertManager>>,
}

/// Capacity settings for the certificate cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
  /// Maximum number of records; 0 disables the limit.
  pub capacity: usize,
  /// Occupancy percentage at which the cache reports almost-full and
  /// handshake misses start loading from storage even without on-demand.
  pub almost_full_percent: u8,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      capacity: 10_000,
      almost_full_percent: 90,
    }
  }
}
