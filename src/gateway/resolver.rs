//! Target resolution and whitelist enforcement.

use tracing::warn;

use crate::config::Config;
use crate::error::GatewayError;

/// Return the fixed upstream URL for a reserved alias.
fn alias_url(name: &str) -> Option<&'static str> {
    match name {
        "openai" => Some("https://api.openai.com/v1/chat/completions"),
        "deepseek" => Some("https://api.deepseek.com/chat/completions"),
        _ => None,
    }
}

/// Resolve the raw path target to a fully-qualified upstream URL and check
/// it against the whitelist.
///
/// An explicit `http://`/`https://` target is used verbatim; an optional
/// `url:` prefix is stripped; reserved aliases map to their fixed upstreams;
/// anything else is treated as a bare host and prefixed with `https://`.
/// The whitelist is a substring match and fails closed: an empty whitelist
/// forwards nothing.
pub fn resolve(raw_target: &str, config: &Config) -> Result<String, GatewayError> {
    let target = raw_target.strip_prefix("url:").unwrap_or(raw_target);

    let resolved = if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else if let Some(url) = alias_url(target) {
        url.to_string()
    } else {
        format!("https://{target}")
    };

    if config
        .whitelist
        .iter()
        .any(|entry| resolved.contains(entry.as_str()))
    {
        Ok(resolved)
    } else {
        warn!(target = %resolved, "target not whitelisted");
        Err(GatewayError::NotWhitelisted { target: resolved })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_whitelist(entries: &[&str]) -> Config {
        Config {
            whitelist: entries.iter().map(|s| s.to_string()).collect(),
            ..Config::default()
        }
    }

    #[test]
    fn explicit_scheme_passes_through_verbatim() {
        let config = config_with_whitelist(&["example.com"]);
        assert_eq!(
            resolve("http://example.com/v1/chat", &config).unwrap(),
            "http://example.com/v1/chat"
        );
    }

    #[test]
    fn url_prefix_is_stripped() {
        let config = config_with_whitelist(&["example.com"]);
        assert_eq!(
            resolve("url:https://example.com/v1", &config).unwrap(),
            "https://example.com/v1"
        );
    }

    #[test]
    fn reserved_aliases_map_to_fixed_upstreams() {
        let config = config_with_whitelist(&["api.openai.com", "api.deepseek.com"]);
        assert_eq!(
            resolve("openai", &config).unwrap(),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            resolve("deepseek", &config).unwrap(),
            "https://api.deepseek.com/chat/completions"
        );
    }

    #[test]
    fn bare_host_gets_https_prefix() {
        let config = config_with_whitelist(&["example.com"]);
        assert_eq!(
            resolve("example.com/v1/chat", &config).unwrap(),
            "https://example.com/v1/chat"
        );
    }

    #[test]
    fn unlisted_target_fails_closed() {
        let config = config_with_whitelist(&["api.openai.com"]);
        let err = resolve("https://attacker.example/v1", &config).unwrap_err();
        assert!(matches!(err, GatewayError::NotWhitelisted { .. }));
    }

    #[test]
    fn empty_whitelist_rejects_everything() {
        let config = config_with_whitelist(&[]);
        assert!(resolve("https://api.openai.com/v1", &config).is_err());
        assert!(resolve("openai", &config).is_err());
    }

    #[test]
    fn whitelist_match_is_substring_based() {
        let config = config_with_whitelist(&["openai"]);
        assert!(resolve("https://api.openai.com/v1", &config).is_ok());
    }
}
