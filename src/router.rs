//! Host resolution, rule lookup, and the header transformation pipeline
//! (spec §4.C). This is the core policy component.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

use http::{HeaderMap, HeaderName, HeaderValue};

use crate::config::{extract_placeholders, normalize_host, Config, DomainRule};
use crate::logging::mask;
use crate::secrets::SecretMap;

/// Headers stripped from the outgoing *request* before forwarding
/// upstream (spec §4.C.5).
const HOP_BY_HOP_REQUEST_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "x-forwarded-for",
];

// x-forwarded-host / x-forwarded-proto are additional proxy-forwarding
// headers named in spec §4.C.5; kept in a second slice so the first
// nine-header list above can stay a literal match of the spec's
// explicitly-enumerated set while this one carries the rest.
const PROXY_FORWARDING_HEADERS: [&str; 2] = ["x-forwarded-host", "x-forwarded-proto"];

/// Headers stripped from the *response* before returning to the client.
/// `transfer-encoding`/`content-length` are deliberately excluded — see
/// SPEC_FULL.md Open Question 2 (they govern body framing, which this
/// proxy passes through byte-for-byte to support streaming responses).
const HOP_BY_HOP_RESPONSE_HEADERS: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "upgrade",
];

/// Small, hard-coded provider quirks (spec §4.C step 4).
const PROVIDER_DEFAULTS: &[(&str, &str, &str)] =
    &[("api.anthropic.com", "anthropic-version", "2023-06-01")];

/// Determine the destination host for a flow (spec §4.C "Host resolution").
/// `connect_target` is the CONNECT target if this flow arrived inside a
/// tunnel; `host_header` is the request's `Host` header value, used as a
/// fallback (or as the sole source for absolute-form HTTP, where the
/// caller should already have resolved the host from the URL and can
/// pass it in as `connect_target`).
pub fn resolve_host(connect_target: Option<&str>, host_header: Option<&str>) -> Option<String> {
    connect_target
        .or(host_header)
        .map(normalize_host)
        .filter(|h| !h.is_empty())
}

/// Result of running the transformation pipeline on one request.
pub struct Transformed {
    pub headers: HeaderMap,
    /// True if the defense-in-depth scan found a leaked secret and the
    /// flow must be aborted rather than forwarded.
    pub blocked_secret_leak: bool,
}

/// Run the full ordered transformation pipeline (spec §4.C) against a
/// request's headers for the resolved destination host.
pub fn apply(
    config: &Config,
    secrets: &SecretMap,
    host: &str,
    mut headers: HeaderMap,
) -> Transformed {
    let rule = config.rule_for(host);

    // Steps 1-4 (spec §4.C "Transformation pipeline") only run for a host
    // with a matched rule. A host absent from `Config.domains` is a
    // whitelist miss: it must receive no injection and no auth stripping,
    // forwarded unchanged apart from hygiene (spec §4.C "Whitelisting").
    if let Some(rule) = rule {
        let replaced_headers = if !rule.replace_values.is_empty() {
            replace_values_scan(&mut headers, rule, secrets)
        } else {
            HashSet::new()
        };

        strip_auth_unless_replaced(&mut headers, &replaced_headers);
        inject_headers(&mut headers, rule, secrets, host);
        apply_provider_defaults(&mut headers, host);
    }

    strip_hygiene_headers(&mut headers, true);

    let blocked_secret_leak = scan_for_leaked_secrets(&headers, config, host, secrets);

    Transformed {
        headers,
        blocked_secret_leak,
    }
}

/// Step 1: replace-values scan. Returns the set of header names that had
/// at least one successful substitution (`H_replaced`).
fn replace_values_scan(
    headers: &mut HeaderMap,
    rule: &DomainRule,
    secrets: &SecretMap,
) -> HashSet<HeaderName> {
    let mut replaced = HashSet::new();
    let scan_names: Vec<HeaderName> = if rule.replace_in_headers.is_empty() {
        headers.keys().cloned().collect()
    } else {
        headers
            .keys()
            .filter(|name| {
                rule.replace_in_headers
                    .iter()
                    .any(|n| n.eq_ignore_ascii_case(name.as_str()))
            })
            .cloned()
            .collect()
    };

    for name in scan_names {
        let Some(value) = headers.get(&name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        let mut new_value = value.to_string();
        let mut did_replace = false;

        for placeholder in &rule.replace_values {
            let Some(secret) = secrets.get(placeholder) else {
                warn_once_missing_secret(host_rule_key(&name, placeholder), placeholder);
                continue;
            };
            if new_value == *placeholder {
                new_value = secret.clone();
                did_replace = true;
            } else if new_value.contains(placeholder.as_str()) {
                new_value = new_value.replace(placeholder.as_str(), secret);
                did_replace = true;
            }
        }

        if did_replace {
            if let Ok(header_value) = HeaderValue::from_str(&new_value) {
                headers.insert(name.clone(), header_value);
                replaced.insert(name);
            }
        }
    }

    replaced
}

fn host_rule_key(name: &HeaderName, placeholder: &str) -> String {
    format!("{name}:{placeholder}")
}

/// Step 2: strip Authorization/X-Api-Key unless they were just replaced.
fn strip_auth_unless_replaced(headers: &mut HeaderMap, replaced: &HashSet<HeaderName>) {
    for name in ["authorization", "x-api-key"] {
        if let Ok(header_name) = HeaderName::try_from(name) {
            if !replaced.contains(&header_name) {
                headers.remove(&header_name);
            }
        }
    }
}

/// Step 3: inject-headers phase, expanding `${VAR}` templates.
fn inject_headers(headers: &mut HeaderMap, rule: &DomainRule, secrets: &SecretMap, host: &str) {
    for (name, template) in &rule.inject_headers {
        let Ok(header_name) = HeaderName::try_from(name.as_str()) else {
            tracing::warn!(host, header = %name, "inject_headers: invalid header name, skipping");
            continue;
        };
        let expanded = expand_template(template, secrets, host, name);
        match HeaderValue::from_str(&expanded) {
            Ok(value) => {
                headers.insert(header_name, value);
            }
            Err(_) => {
                tracing::warn!(host, header = %name, "inject_headers: expanded value is not a valid header value, skipping");
            }
        }
    }
}

/// Expand `${VAR}` placeholders in a template. A missing variable
/// expands to the empty string and emits exactly one warning per
/// (host, header, template) combination per process lifetime (spec §7).
fn expand_template(template: &str, secrets: &SecretMap, host: &str, header_name: &str) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            result.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let var = &after[..end];
        match secrets.get(var) {
            Some(value) => result.push_str(value),
            None => warn_once_missing_var(host, header_name, var),
        }
        rest = &after[end + 1..];
    }
    result.push_str(rest);
    result
}

fn missing_var_warnings() -> &'static Mutex<HashSet<String>> {
    static SEEN: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    SEEN.get_or_init(|| Mutex::new(HashSet::new()))
}

fn warn_once_missing_var(host: &str, header_name: &str, var: &str) {
    let key = format!("{host}\0{header_name}\0{var}");
    let mut seen = missing_var_warnings().lock().unwrap();
    if seen.insert(key) {
        tracing::warn!(host, header = header_name, var, "inject_headers: variable missing from secret map, substituting empty string");
    }
}

fn missing_secret_warnings() -> &'static Mutex<HashSet<String>> {
    static SEEN: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    SEEN.get_or_init(|| Mutex::new(HashSet::new()))
}

fn warn_once_missing_secret(key: String, placeholder: &str) {
    let mut seen = missing_secret_warnings().lock().unwrap();
    if seen.insert(key) {
        tracing::warn!(placeholder, "replace_values: placeholder missing from secret map, skipping");
    }
}

/// Step 4: provider-specific auto-injection (spec §4.C step 4).
fn apply_provider_defaults(headers: &mut HeaderMap, host: &str) {
    for (provider_host, header, value) in PROVIDER_DEFAULTS {
        if host.eq_ignore_ascii_case(provider_host) {
            if let Ok(name) = HeaderName::try_from(*header) {
                if !headers.contains_key(&name) {
                    headers.insert(name, HeaderValue::from_static(value));
                }
            }
        }
    }
}

/// Step 5: hop-by-hop and proxy-forwarding hygiene.
fn strip_hygiene_headers(headers: &mut HeaderMap, is_request: bool) {
    let names: &[&str] = if is_request {
        &HOP_BY_HOP_REQUEST_HEADERS
    } else {
        &HOP_BY_HOP_RESPONSE_HEADERS
    };
    for name in names {
        if let Ok(header_name) = HeaderName::try_from(*name) {
            headers.remove(&header_name);
        }
    }
    if is_request {
        for name in PROXY_FORWARDING_HEADERS {
            if let Ok(header_name) = HeaderName::try_from(name) {
                headers.remove(&header_name);
            }
        }
    }
}

/// Scrub response headers before returning to the client (spec §4.C
/// "Upstream dispatch": "Hop-by-hop headers are also scrubbed from the
/// response"). See Open Question 2 for why transfer-encoding/content-length
/// are left untouched.
pub fn sanitize_response_headers(headers: &mut HeaderMap) {
    strip_hygiene_headers(headers, false);
}

/// Defense-in-depth belt (spec §4.C "Whitelisting", recommended): after
/// transformation, make sure no literal secret value ended up in an
/// outgoing header for a host that wasn't whitelisted to carry it.
fn scan_for_leaked_secrets(
    headers: &HeaderMap,
    config: &Config,
    host: &str,
    secrets: &SecretMap,
) -> bool {
    let allowed_names: HashSet<String> = config
        .rule_for(host)
        .map(|rule| rule.referenced_secret_names().into_iter().collect())
        .unwrap_or_default();

    for (name, value) in headers.iter() {
        let Ok(value_str) = value.to_str() else {
            continue;
        };
        for (secret_name, secret_value) in secrets.iter() {
            if secret_value.is_empty() {
                continue;
            }
            if value_str.contains(secret_value.as_str()) && !allowed_names.contains(secret_name) {
                tracing::error!(
                    host,
                    header = %name,
                    value = %mask(value_str),
                    "blocked flow: outgoing header carries a secret not whitelisted for this host"
                );
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaConfig;
    use std::collections::HashMap;

    fn config_with(domains: HashMap<String, DomainRule>) -> Config {
        Config {
            port: 8080,
            env_file: ".env.vault".into(),
            ca: CaConfig::default(),
            domains,
            unsafe_bind_all: false,
            connect_timeout_secs: 30,
        }
    }

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                HeaderName::try_from(*name).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    fn secrets_with(pairs: &[(&str, &str)]) -> SecretMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    // S1: inject_headers substitutes placeholder auth and adds a provider default.
    #[test]
    fn s1_anthropic_inject_headers() {
        let mut rule = DomainRule::default();
        rule.inject_headers.insert("Authorization".into(), "Bearer ${ANTHROPIC}".into());
        let config = config_with(HashMap::from([("api.anthropic.com".to_string(), rule)]));
        let secrets = secrets_with(&[("ANTHROPIC", "sk-real")]);
        let headers = header_map(&[("authorization", "Bearer DUMMY")]);

        let result = apply(&config, &secrets, "api.anthropic.com", headers);
        assert_eq!(
            result.headers.get("authorization").unwrap().to_str().unwrap(),
            "Bearer sk-real"
        );
        assert_eq!(
            result.headers.get("anthropic-version").unwrap().to_str().unwrap(),
            "2023-06-01"
        );
        assert!(!result.headers.iter().any(|(_, v)| v.to_str().unwrap().contains("DUMMY")));
    }

    // S2: non-configured host receives no injection, placeholder passes through unchanged.
    #[test]
    fn s2_unconfigured_host_passthrough() {
        let mut rule = DomainRule::default();
        rule.inject_headers.insert("Authorization".into(), "Bearer ${ANTHROPIC}".into());
        let config = config_with(HashMap::from([("api.anthropic.com".to_string(), rule)]));
        let secrets = secrets_with(&[("ANTHROPIC", "sk-real")]);
        let headers = header_map(&[("authorization", "Bearer DUMMY")]);

        let result = apply(&config, &secrets, "api.openai.com", headers);
        assert_eq!(
            result.headers.get("authorization").unwrap().to_str().unwrap(),
            "Bearer DUMMY"
        );
        assert!(!result.headers.iter().any(|(_, v)| v.to_str().unwrap().contains("sk-real")));
        assert!(!result.blocked_secret_leak);
    }

    // S3: replace_values restricted to a specific header.
    #[test]
    fn s3_replace_values_restricted_header() {
        let rule = DomainRule {
            inject_headers: HashMap::new(),
            replace_values: vec!["OPENAI_KEY".into()],
            replace_in_headers: HashSet::from(["Authorization".to_string()]),
        };
        let config = config_with(HashMap::from([("api.openai.com".to_string(), rule)]));
        let secrets = secrets_with(&[("OPENAI_KEY", "sk-xyz")]);
        let headers = header_map(&[
            ("authorization", "Bearer OPENAI_KEY"),
            ("x-custom", "OPENAI_KEY"),
        ]);

        let result = apply(&config, &secrets, "api.openai.com", headers);
        assert_eq!(
            result.headers.get("authorization").unwrap().to_str().unwrap(),
            "Bearer sk-xyz"
        );
        assert_eq!(result.headers.get("x-custom").unwrap().to_str().unwrap(), "OPENAI_KEY");
    }

    // S4: missing variable expands to empty, no literal placeholder survives.
    #[test]
    fn s4_missing_variable_expands_empty() {
        let mut rule = DomainRule::default();
        rule.inject_headers.insert("X-Tok".into(), "${ABSENT}".into());
        let config = config_with(HashMap::from([("example.com".to_string(), rule)]));
        let secrets = SecretMap::new();
        let headers = header_map(&[]);

        let result = apply(&config, &secrets, "example.com", headers);
        assert_eq!(result.headers.get("x-tok").unwrap().to_str().unwrap(), "");
        assert!(!result.headers.get("x-tok").unwrap().to_str().unwrap().contains("ABSENT"));
    }

    // P5: hygiene strips all nine + two proxy-forwarding headers.
    #[test]
    fn p5_hygiene_strips_hop_by_hop_headers() {
        let config = config_with(HashMap::new());
        let secrets = SecretMap::new();
        let headers = header_map(&[
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("proxy-authenticate", "Basic"),
            ("proxy-authorization", "Basic abc"),
            ("te", "trailers"),
            ("trailers", "X-Foo"),
            ("transfer-encoding", "chunked"),
            ("upgrade", "websocket"),
            ("x-forwarded-for", "1.2.3.4"),
            ("x-forwarded-host", "example.com"),
            ("x-forwarded-proto", "https"),
            ("x-keep-me", "yes"),
        ]);

        let result = apply(&config, &secrets, "example.com", headers);
        for name in [
            "connection",
            "keep-alive",
            "proxy-authenticate",
            "proxy-authorization",
            "te",
            "trailers",
            "transfer-encoding",
            "upgrade",
            "x-forwarded-for",
            "x-forwarded-host",
            "x-forwarded-proto",
        ] {
            assert!(!result.headers.contains_key(name), "{name} should have been stripped");
        }
        assert!(result.headers.contains_key("x-keep-me"));
    }

    // P3: applying replace-values twice is idempotent.
    #[test]
    fn p3_replace_values_idempotent() {
        let rule = DomainRule {
            inject_headers: HashMap::new(),
            replace_values: vec!["PLACEHOLDER".into()],
            replace_in_headers: HashSet::new(),
        };
        let config = config_with(HashMap::from([("example.com".to_string(), rule)]));
        let secrets = secrets_with(&[("PLACEHOLDER", "sk-real-value")]);
        let headers = header_map(&[("x-token", "PLACEHOLDER")]);

        let once = apply(&config, &secrets, "example.com", headers);
        let twice = apply(&config, &secrets, "example.com", once.headers.clone());
        assert_eq!(
            once.headers.get("x-token").unwrap(),
            twice.headers.get("x-token").unwrap()
        );
        assert_eq!(twice.headers.get("x-token").unwrap().to_str().unwrap(), "sk-real-value");
    }

    #[test]
    fn auth_header_stripped_when_not_replaced() {
        // example.com has a rule (so the pipeline runs) but this request's
        // auth headers aren't touched by any replace_values substitution.
        let rule = DomainRule {
            inject_headers: HashMap::new(),
            replace_values: vec!["TOKEN".into()],
            replace_in_headers: HashSet::new(),
        };
        let config = config_with(HashMap::from([("example.com".to_string(), rule)]));
        let secrets = secrets_with(&[("TOKEN", "sk-real")]);
        let headers = header_map(&[("authorization", "Bearer leftover"), ("x-api-key", "leftover")]);

        let result = apply(&config, &secrets, "example.com", headers);
        assert!(!result.headers.contains_key("authorization"));
        assert!(!result.headers.contains_key("x-api-key"));
    }

    // A host with no DomainRule at all is a whitelist miss: the pipeline
    // must not touch Authorization/X-Api-Key, matching spec §4.C
    // "Whitelisting" and scenario S2.
    #[test]
    fn auth_header_passed_through_for_unconfigured_host() {
        let config = config_with(HashMap::new());
        let secrets = SecretMap::new();
        let headers = header_map(&[("authorization", "Bearer leftover"), ("x-api-key", "leftover")]);

        let result = apply(&config, &secrets, "example.com", headers);
        assert_eq!(
            result.headers.get("authorization").unwrap().to_str().unwrap(),
            "Bearer leftover"
        );
        assert_eq!(result.headers.get("x-api-key").unwrap().to_str().unwrap(), "leftover");
    }

    #[test]
    fn auth_header_kept_when_it_was_replaced() {
        let rule = DomainRule {
            inject_headers: HashMap::new(),
            replace_values: vec!["TOKEN".into()],
            replace_in_headers: HashSet::new(),
        };
        let config = config_with(HashMap::from([("example.com".to_string(), rule)]));
        let secrets = secrets_with(&[("TOKEN", "sk-real")]);
        let headers = header_map(&[("authorization", "Bearer TOKEN")]);

        let result = apply(&config, &secrets, "example.com", headers);
        assert_eq!(
            result.headers.get("authorization").unwrap().to_str().unwrap(),
            "Bearer sk-real"
        );
    }

    #[test]
    fn defense_in_depth_blocks_unwhitelisted_secret_leak() {
        let mut rule = DomainRule::default();
        rule.inject_headers.insert("Authorization".into(), "Bearer ${ANTHROPIC}".into());
        let config = config_with(HashMap::from([("api.anthropic.com".to_string(), rule)]));
        let secrets = secrets_with(&[("ANTHROPIC", "sk-real-secret")]);
        // A client that somehow already knows the real secret and sends it
        // to an unconfigured host must be blocked, not forwarded.
        let headers = header_map(&[("x-leak", "sk-real-secret")]);

        let result = apply(&config, &secrets, "not-configured.example.com", headers);
        assert!(result.blocked_secret_leak);
    }

    #[test]
    fn sanitize_response_headers_strips_hop_by_hop_but_keeps_framing() {
        let mut headers = header_map(&[
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("proxy-authenticate", "Basic"),
            ("proxy-authorization", "Basic abc"),
            ("te", "trailers"),
            ("trailers", "X-Foo"),
            ("upgrade", "websocket"),
            ("transfer-encoding", "chunked"),
            ("content-length", "42"),
            ("content-type", "application/json"),
        ]);

        sanitize_response_headers(&mut headers);

        for name in [
            "connection",
            "keep-alive",
            "proxy-authenticate",
            "proxy-authorization",
            "te",
            "trailers",
            "upgrade",
        ] {
            assert!(!headers.contains_key(name), "{name} should have been stripped");
        }
        // framing headers survive so the client can decode a streamed body (Open Question 2).
        assert!(headers.contains_key("transfer-encoding"));
        assert!(headers.contains_key("content-length"));
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn resolve_host_prefers_connect_target_over_host_header() {
        assert_eq!(
            resolve_host(Some("api.anthropic.com:443"), Some("other.example.com")),
            Some("api.anthropic.com".to_string())
        );
        assert_eq!(
            resolve_host(None, Some("api.anthropic.com")),
            Some("api.anthropic.com".to_string())
        );
        assert_eq!(resolve_host(None, None), None);
    }
}
