/// Strips a trailing `:port` suffix from a `Host` header value. IPv6 literals (`[::1]:8080`)
/// keep their brackets; only the port after the closing bracket is stripped.
pub fn strip_port(host: &str) -> &str {
  if let Some(bracket_end) = host.rfind(']') {
    return &host[..=bracket_end];
  }
  match host.rfind(':') {
    Some(idx) => &host[..idx],
    None => host,
  }
}

/// The substring markers that make a hostname "local-like". Reproduced exactly as documented —
/// this also matches unintended strings such as `mylocal.com`, which is a known, deliberately
/// unfixed quirk of the heuristic (it has to agree with whatever is already on disk).
const LOCAL_LIKE_MARKERS: [&str; 4] = [".local", "local.", "localhost", ".console"];

/// Classifies a lowercased hostname as local-like per the substring heuristic above.
pub fn is_local_like(lower_hostname: &str) -> bool {
  LOCAL_LIKE_MARKERS.iter().any(|marker| lower_hostname.contains(marker))
}

/// Returns the two-label wildcard base for a hostname (`api.app.local.console` ->
/// `*.local.console`), or `None` if the hostname has fewer than two labels or is exactly
/// `localhost` (which has no useful two-label base).
pub fn wildcard_base(lower_hostname: &str) -> Option<String> {
  if lower_hostname == "localhost" {
    return None;
  }
  let labels: Vec<&str> = lower_hostname.split('.').collect();
  if labels.len() < 2 {
    return None;
  }
  let base = labels[labels.len() - 2..].join(".");
  Some(format!("*.{base}"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn strip_port_removes_suffix() {
    assert_eq!(strip_port("example.com:4443"), "example.com");
    assert_eq!(strip_port("example.com"), "example.com");
    assert_eq!(strip_port("[::1]:4443"), "[::1]");
  }

  #[test]
  fn local_like_matches_all_four_markers() {
    assert!(is_local_like("app.local.console"));
    assert!(is_local_like("local.host.example"));
    assert!(is_local_like("localhost"));
    assert!(is_local_like("admin.console"));
    // Known-unintended false positive, reproduced deliberately for on-disk compatibility.
    assert!(is_local_like("mylocal.com"));
    assert!(!is_local_like("example.com"));
  }

  #[test]
  fn wildcard_base_takes_last_two_labels() {
    assert_eq!(wildcard_base("api.app.local.console"), Some("*.local.console".to_string()));
    assert_eq!(wildcard_base("local.console"), Some("*.local.console".to_string()));
    assert_eq!(wildcard_base("localhost"), None);
    assert_eq!(wildcard_base("single"), None);
  }
}
