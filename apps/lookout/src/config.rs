use std::env;

/// Server configuration, read from the environment the way the rest of the
/// deployment expects.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub reverse_dns_enabled: bool,
    pub reverse_dns_timeout_ms: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("LOOKOUT_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            reverse_dns_enabled: env::var("LOOKOUT_REVERSE_DNS")
                .map(|value| matches_truthy(&value))
                .unwrap_or(true),
            reverse_dns_timeout_ms: env::var("LOOKOUT_REVERSE_DNS_TIMEOUT_MS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(1_500),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            reverse_dns_enabled: true,
            reverse_dns_timeout_ms: 1_500,
        }
    }
}

fn matches_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert!(config.reverse_dns_enabled);
        assert_eq!(config.reverse_dns_timeout_ms, 1_500);
    }

    #[test]
    fn truthy_parsing_matches_deploy_conventions() {
        assert!(matches_truthy("1"));
        assert!(matches_truthy(" TRUE "));
        assert!(!matches_truthy("0"));
        assert!(!matches_truthy("off"));
    }
}
