//! Handshake-time TLS certificate resolution.
//!
//! This crate is the piece of an automatic-TLS stack that runs inside the
//! TLS server's certificate callback. Given a client hello, and under
//! heavy concurrency, it decides whether to serve a cached certificate,
//! load one from persistent storage, obtain or renew one through a
//! certificate authority, refresh a stapled OCSP response, or answer a
//! TLS-ALPN-01 challenge.
//!
//! Concurrent handshakes for the same name collapse to a single load or
//! issuance: the first requester runs the operation and publishes its
//! result to the shared [`Cache`]; everyone else waits on a per-name
//! signal and re-reads the cache. Certificates that are still usable are
//! preferred over blocking a handshake: renewals of unexpired,
//! unrevoked certificates run on detached tasks while the current
//! certificate keeps being served.
//!
//! The ACME client, storage backend, OCSP stapler, and renewal-info
//! source are consumed through the traits in [`manager`]; this crate
//! implements none of them.

pub mod cache;
pub mod certificate;
pub mod config;
pub mod error;
pub mod handshake;
pub mod hello;
pub mod manager;
pub mod normalize;
pub mod resolver;

mod challenge;
mod maintain;
mod selector;
mod singleflight;

#[cfg(test)]
mod testutil;

pub use cache::Cache;
pub use certificate::{Certificate, OcspStaple, OcspStatus, RenewalInfo};
pub use config::{CacheOptions, Config, OnDemandConfig};
pub use error::Error;
pub use handshake::Resolver;
pub use hello::{ClientHelloInfo, Event, ACME_TLS_ALPN_NAME};
pub use manager::{
  Authority, CertificateStore, ChallengeInfo, EventSubscriber, ExternalCertManager, OnDemandPolicy,
  SelectsCertificate, Stapler,
};
pub use resolver::HandshakeCertResolver;
