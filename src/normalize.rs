use std::net::IpAddr;

use crate::error::Error;

/// Canonicalizes a raw server name for cache lookup and comparison.
///
/// Whitespace is trimmed, one trailing dot is stripped, IP literals pass
/// through in canonical form (IPv6 scope suffix removed), and everything
/// else goes through IDNA lookup conversion to lower-case punycode.
///
/// Returns an empty string for an empty input; the caller decides which
/// fallback (default server name, local address) applies.
pub fn normalize_server_name(raw: &str) -> Result<String, Error> {
  let name = raw.trim();
  let name = name.strip_suffix('.').unwrap_or(name);
  if name.is_empty() {
    return Ok(String::new());
  }

  if let Some(ip) = parse_ip_literal(name) {
    return Ok(ip.to_string());
  }

  // Wildcard labels are not valid in SNI and are rejected by the lookup profile
  if name.contains('*') {
    return Err(Error::InvalidName(raw.to_string()));
  }

  match idna::domain_to_ascii(name) {
    Ok(ascii) if !ascii.is_empty() => Ok(ascii.to_ascii_lowercase()),
    _ => Err(Error::InvalidName(raw.to_string())),
  }
}

/// Parses an IP literal, tolerating brackets and an IPv6 `%zone` suffix.
fn parse_ip_literal(name: &str) -> Option<IpAddr> {
  let name = name.strip_prefix('[').and_then(|n| n.strip_suffix(']')).unwrap_or(name);
  let name = name.split('%').next().unwrap_or(name);
  name.parse::<IpAddr>().ok()
}

/// Checks whether a name is syntactically eligible for dynamic issuance.
///
/// SNI values never legitimately contain wildcards, empty labels, or
/// reserved local forms, so such names are refused before any policy
/// callback or allow-list is consulted.
pub fn subject_qualifies_for_cert(name: &str) -> bool {
  if name.is_empty() || name.contains('*') {
    return false;
  }
  if name.starts_with('.') || name.ends_with('.') || name.contains("..") {
    return false;
  }
  if name.parse::<IpAddr>().is_ok() {
    // IP identifiers are issuable, but only as literal non-empty addresses
    return true;
  }
  if name == "localhost" {
    return false;
  }
  for reserved in [".localhost", ".local", ".internal", ".home.arpa"] {
    if name.ends_with(reserved) {
      return false;
    }
  }
  name
    .split('.')
    .all(|label| !label.is_empty() && label.len() <= 63 && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_normalize_case_and_whitespace() {
    assert_eq!(normalize_server_name("Example.COM").unwrap(), "example.com");
    assert_eq!(normalize_server_name(" example.com ").unwrap(), "example.com");
    assert_eq!(normalize_server_name("example.com.").unwrap(), "example.com");
  }

  #[test]
  fn test_normalize_idempotent() {
    let once = normalize_server_name("BÜcher.Example").unwrap();
    let twice = normalize_server_name(&once).unwrap();
    assert_eq!(once, twice);
  }

  #[test]
  fn test_normalize_punycode_matches_unicode_form() {
    let unicode = normalize_server_name("bücher.example").unwrap();
    let punycode = normalize_server_name("xn--bcher-kva.example").unwrap();
    assert_eq!(unicode, punycode);
    assert_eq!(unicode, "xn--bcher-kva.example");
  }

  #[test]
  fn test_normalize_empty() {
    assert_eq!(normalize_server_name("").unwrap(), "");
    assert_eq!(normalize_server_name("   ").unwrap(), "");
  }

  #[test]
  fn test_normalize_ip_literals() {
    assert_eq!(normalize_server_name("192.0.2.1").unwrap(), "192.0.2.1");
    assert_eq!(normalize_server_name("[2001:db8::1]").unwrap(), "2001:db8::1");
    assert_eq!(normalize_server_name("fe80::1%eth0").unwrap(), "fe80::1");
  }

  #[test]
  fn test_normalize_rejects_wildcards() {
    assert!(normalize_server_name("*.example.com").is_err());
  }

  #[test]
  fn test_subject_qualification() {
    assert!(subject_qualifies_for_cert("example.com"));
    assert!(subject_qualifies_for_cert("api.example.com"));
    assert!(subject_qualifies_for_cert("192.0.2.1"));
    assert!(!subject_qualifies_for_cert(""));
    assert!(!subject_qualifies_for_cert("*.example.com"));
    assert!(!subject_qualifies_for_cert("example..com"));
    assert!(!subject_qualifies_for_cert(".example.com"));
    assert!(!subject_qualifies_for_cert("localhost"));
    assert!(!subject_qualifies_for_cert("printer.local"));
    assert!(!subject_qualifies_for_cert("db.internal"));
    assert!(!subject_qualifies_for_cert("nas.home.arpa"));
    assert!(!subject_qualifies_for_cert("bad_label.example.com"));
  }
}
