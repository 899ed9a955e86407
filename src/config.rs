//! Process-wide configuration read from the environment.

use std::path::PathBuf;

/// Default hosts a `url:` pipeline reference may be loaded from.
pub const DEFAULT_URL_ALLOW: &[&str] = &[
    "raw.githubusercontent.com",
    "gist.githubusercontent.com",
];

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Identifying email sent to polite-pool APIs (user-agent and mailto).
    pub email: Option<String>,
    /// NCBI E-utilities API key. Raises the eutils rate limit from 3/s to 10/s.
    pub ncbi_api_key: Option<String>,
    pub s2_api_key: Option<String>,
    pub core_api_key: Option<String>,
    pub crossref_mailto: Option<String>,
    pub proxy: Option<String>,
    /// Root for the global pipeline scope.
    pub data_dir: PathBuf,
    /// Extra allow-listed hosts for `url:` pipeline loads.
    pub url_allow: Vec<String>,
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl AppConfig {
    pub fn from_env() -> Self {
        let email = env_nonempty("LITMCP_EMAIL");
        let crossref_mailto = env_nonempty("LITMCP_CROSSREF_MAILTO").or_else(|| email.clone());
        let data_dir = env_nonempty("LITMCP_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_data_dir);
        let url_allow = env_nonempty("LITMCP_URL_ALLOW")
            .map(|v| {
                v.split(',')
                    .map(|h| h.trim().to_ascii_lowercase())
                    .filter(|h| !h.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            email,
            ncbi_api_key: env_nonempty("LITMCP_NCBI_API_KEY"),
            s2_api_key: env_nonempty("LITMCP_S2_API_KEY"),
            core_api_key: env_nonempty("LITMCP_CORE_API_KEY"),
            crossref_mailto,
            proxy: env_nonempty("LITMCP_PROXY"),
            data_dir,
            url_allow,
        }
    }

    fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("litmcp")
    }

    /// The user-agent string sent with every outbound request.
    pub fn user_agent(&self) -> String {
        match self.email.as_deref() {
            Some(email) => format!(
                "litmcp/{} (mailto:{email})",
                env!("CARGO_PKG_VERSION")
            ),
            None => format!("litmcp/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Hosts allowed for `url:` pipeline loads: defaults plus extensions.
    pub fn allowed_url_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = DEFAULT_URL_ALLOW.iter().map(|h| h.to_string()).collect();
        for host in &self.url_allow {
            if !hosts.contains(host) {
                hosts.push(host.clone());
            }
        }
        hosts
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            email: None,
            ncbi_api_key: None,
            s2_api_key: None,
            core_api_key: None,
            crossref_mailto: None,
            proxy: None,
            data_dir: Self::default_data_dir(),
            url_allow: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_includes_mailto_when_configured() {
        let mut cfg = AppConfig::default();
        assert!(cfg.user_agent().starts_with("litmcp/"));
        cfg.email = Some("ops@example.org".into());
        assert!(cfg.user_agent().contains("mailto:ops@example.org"));
    }

    #[test]
    fn allow_list_extends_defaults_without_duplicates() {
        let mut cfg = AppConfig::default();
        cfg.url_allow = vec![
            "pipelines.example.org".into(),
            "raw.githubusercontent.com".into(),
        ];
        let hosts = cfg.allowed_url_hosts();
        assert_eq!(
            hosts
                .iter()
                .filter(|h| h.as_str() == "raw.githubusercontent.com")
                .count(),
            1
        );
        assert!(hosts.contains(&"pipelines.example.org".to_string()));
    }
}
