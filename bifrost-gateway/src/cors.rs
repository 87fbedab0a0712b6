//! CORS origin matching (spec §4.K).

const LOCALHOST_SCHEMES_HOSTS: [(&str, &str); 3] = [("http", "localhost"), ("https", "localhost"), ("http", "127.0.0.1")];

/// Whether `origin` is always allowed regardless of configuration: any port
/// on `localhost` (http or https), `127.0.0.1` (http), or `0.0.0.0` (http),
/// and `127.0.0.1` over https (spec §4.K).
fn is_localhost(origin: &str) -> bool {
    let Some((scheme, rest)) = origin.split_once("://") else { return false };
    let host = rest.split(['/', ':']).next().unwrap_or(rest);

    if LOCALHOST_SCHEMES_HOSTS.iter().any(|(s, h)| *s == scheme && *h == host) {
        return true;
    }
    if scheme == "https" && host == "127.0.0.1" {
        return true;
    }
    scheme == "http" && host == "0.0.0.0"
}

/// Whether a configured `https://*.example.com`-shaped pattern matches
/// `origin`. "No nesting" (spec §4.K, Open Question decision recorded in
/// `DESIGN.md`) means the wildcard stands for exactly one label: it matches
/// `sub.example.com` but not `a.b.example.com`.
fn matches_wildcard_pattern(pattern: &str, origin: &str) -> bool {
    let Some((pattern_scheme, pattern_rest)) = pattern.split_once("://") else { return false };
    let Some(suffix) = pattern_rest.strip_prefix("*.") else { return false };
    let Some((origin_scheme, origin_rest)) = origin.split_once("://") else { return false };

    if pattern_scheme != origin_scheme {
        return false;
    }
    let Some(subdomain_and_label) = origin_rest.strip_suffix(&format!(".{suffix}")) else { return false };
    !subdomain_and_label.is_empty() && !subdomain_and_label.contains('.')
}

/// `IsOriginAllowed` (spec §4.K): localhost is unconditional; otherwise an
/// exact match, the bare `*` wildcard, or a single-level `https://*.host`
/// pattern against the configured allowlist.
pub fn is_origin_allowed(origin: &str, allowed_origins: &[String]) -> bool {
    if is_localhost(origin) {
        return true;
    }
    allowed_origins.iter().any(|allowed| {
        allowed == "*" || allowed == origin || (allowed.contains("*.") && matches_wildcard_pattern(allowed, origin))
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn localhost_variants_are_always_allowed() {
        for origin in [
            "http://localhost:3000",
            "https://localhost:3000",
            "http://127.0.0.1:8080",
            "https://127.0.0.1:8080",
            "http://0.0.0.0:9000",
        ] {
            assert!(is_origin_allowed(origin, &[]), "{origin} should be allowed");
        }
    }

    #[test]
    fn exact_match_against_allowlist() {
        let allowed = vec!["https://app.example.com".to_string()];
        assert!(is_origin_allowed("https://app.example.com", &allowed));
        assert!(!is_origin_allowed("https://evil.example.com", &allowed));
    }

    #[test]
    fn bare_wildcard_allows_everything() {
        let allowed = vec!["*".to_string()];
        assert!(is_origin_allowed("https://anything.test", &allowed));
    }

    #[test]
    fn subdomain_wildcard_matches_exactly_one_label_deep() {
        let allowed = vec!["https://*.example.com".to_string()];
        assert!(is_origin_allowed("https://sub.example.com", &allowed));
        assert!(!is_origin_allowed("https://a.b.example.com", &allowed), "nested subdomains must not match");
        assert!(!is_origin_allowed("https://example.com", &allowed), "bare apex must not match the wildcard");
    }

    #[test]
    fn wildcard_scheme_must_still_match() {
        let allowed = vec!["https://*.example.com".to_string()];
        assert!(!is_origin_allowed("http://sub.example.com", &allowed));
    }

    #[test]
    fn unrelated_origin_is_rejected() {
        let allowed = vec!["https://app.example.com".to_string()];
        assert!(!is_origin_allowed("https://totally-different.test", &allowed));
    }
}
