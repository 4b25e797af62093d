use chrono::{DateTime, Utc};

use crate::certificate::Certificate;
use crate::hello::ClientHelloInfo;

/// Default certificate choice among candidates for one name.
///
/// A single candidate is returned unconditionally (compatibility and
/// expiration checks skipped). With several, client-incompatible
/// candidates are skipped and the first one currently inside its validity
/// window wins; failing that, the last compatible candidate seen.
pub(crate) fn default_select(
  hello: &ClientHelloInfo,
  candidates: &[Certificate],
  now: DateTime<Utc>,
) -> Option<Certificate> {
  if candidates.is_empty() {
    return None;
  }
  if candidates.len() == 1 {
    return Some(candidates[0].clone());
  }

  let mut best = &candidates[0];
  for candidate in candidates {
    if !hello.supports_certificate(&candidate.certified_key) {
      continue;
    }
    best = candidate;
    if candidate.currently_valid(now) {
      return Some(candidate.clone());
    }
  }
  Some(best.clone())
}
