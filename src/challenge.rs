use std::sync::Arc;

use rcgen::{CertificateParams, CustomExtension, KeyPair};
use rustls::crypto::CryptoProvider;
use rustls::sign::CertifiedKey;
use rustls_pki_types::PrivateKeyDer;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::Error;
use crate::handshake::Resolver;
use crate::hello::ClientHelloInfo;
use crate::normalize::normalize_server_name;

impl Resolver {
  /// Answers a TLS-ALPN-01 challenge handshake.
  ///
  /// The challenge registry is consulted for the SNI value; a precomputed
  /// certificate wins, otherwise one is synthesized from the registered
  /// key authorization. The normal certificate path is never touched.
  pub(crate) async fn tls_alpn_challenge_cert(&self, hello: &ClientHelloInfo) -> Result<Arc<CertifiedKey>, Error> {
    let sni = normalize_server_name(&hello.server_name)?;
    let info = self
      .inner
      .store
      .challenge_info(&sni)
      .await
      .map_err(|err| Error::challenge_failed(&sni, err))?
      .ok_or_else(|| Error::challenge_failed(&sni, "no active challenge for this name"))?;

    if info.distributed {
      debug!(sni = %sni, "challenge data came from the distributed registry");
    }
    if let Some(cert) = info.cert {
      debug!(sni = %sni, "serving precomputed challenge certificate");
      return Ok(cert);
    }

    synthesize_challenge_cert(&sni, &info.key_authorization).map_err(|err| Error::challenge_failed(&sni, err))
  }
}

/// Builds a self-signed challenge certificate for `sni` carrying the
/// SHA-256 digest of the key authorization in the ACME identifier
/// extension (RFC 8737).
fn synthesize_challenge_cert(sni: &str, key_authorization: &str) -> anyhow::Result<Arc<CertifiedKey>> {
  let mut params = CertificateParams::new(vec![sni.to_string()])?;
  let digest = Sha256::digest(key_authorization.as_bytes());
  params
    .custom_extensions
    .push(CustomExtension::new_acme_identifier(digest.as_slice()));

  let key_pair = KeyPair::generate()?;
  let certificate = params.self_signed(&key_pair)?;
  let private_key =
    PrivateKeyDer::try_from(key_pair.serialize_der()).map_err(|e| anyhow::anyhow!("invalid challenge key: {e}"))?;

  let signing_key = CryptoProvider::get_default()
    .ok_or_else(|| anyhow::anyhow!("no default crypto provider installed"))?
    .key_provider
    .load_private_key(private_key)
    .map_err(|e| anyhow::anyhow!("loading challenge key: {e}"))?;

  Ok(Arc::new(CertifiedKey::new(
    vec![certificate.der().to_owned()],
    signing_key,
  )))
}
