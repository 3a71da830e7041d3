//! REST backend configuration
//!
//! Everything the adapter needs to reach the CI server, fixed at
//! construction. Endpoint paths are templates where `{name}` is the job name
//! and `{id}` a queue item id.

use std::time::Duration;

/// Endpoint path templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub create_job: String,
    pub update_job: String,
    pub job_info: String,
    pub build: String,
    pub build_with_params: String,
    pub build_info: String,
    /// Console output with elapsed-time line prefixes
    pub build_log: String,
    pub stop_build: String,
    pub delete_build: String,
    pub cancel_queue_item: String,
    pub computers: String,
    pub script: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            create_job: "/createItem?name={name}".to_string(),
            update_job: "/job/{name}/config.xml".to_string(),
            job_info: "/job/{name}/api/json".to_string(),
            build: "/job/{name}/build".to_string(),
            build_with_params: "/job/{name}/buildWithParameters".to_string(),
            build_info: "/job/{name}/lastBuild/api/json".to_string(),
            build_log: "/job/{name}/lastBuild/timestamps/?elapsed=HH'h'mm'm'ss's'S'ms'&appendLog"
                .to_string(),
            stop_build: "/job/{name}/lastBuild/stop".to_string(),
            delete_build: "/job/{name}/lastBuild/doDelete".to_string(),
            cancel_queue_item: "/queue/cancelItem?id={id}".to_string(),
            computers: "/computer/api/json".to_string(),
            script: "/scriptText".to_string(),
        }
    }
}

/// Fills `{name}` in an endpoint template
pub(crate) fn expand(template: &str, name: &str) -> String {
    template.replace("{name}", name)
}

/// REST backend configuration
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Server base URL (e.g., "http://jenkins:8080")
    pub server_address: String,

    /// User for basic auth; no auth when empty
    pub user: String,

    /// API token for basic auth
    pub token: String,

    /// Bound on every request to the server
    pub request_timeout: Duration,

    /// Root of job workspaces on the workers
    pub workspace_root: String,

    pub endpoints: Endpoints,
}

impl BackendConfig {
    /// Creates a configuration with defaults for everything but the address
    pub fn new(server_address: impl Into<String>) -> Self {
        let server_address: String = server_address.into();
        Self {
            server_address: server_address.trim_end_matches('/').to_string(),
            user: String::new(),
            token: String::new(),
            request_timeout: Duration::from_secs(30),
            workspace_root: "${JENKINS_HOME}/workspace".to_string(),
            endpoints: Endpoints::default(),
        }
    }

    /// Sets basic auth credentials
    pub fn with_credentials(mut self, user: impl Into<String>, token: impl Into<String>) -> Self {
        self.user = user.into();
        self.token = token.into();
        self
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - BACKEND_ADDRESS (optional, default: http://jenkins:8080)
    /// - BACKEND_USER (optional)
    /// - BACKEND_TOKEN (optional)
    /// - BACKEND_TIMEOUT (optional, seconds, default: 30)
    /// - BACKEND_WORKSPACE_ROOT (optional)
    pub fn from_env() -> Self {
        let mut config = Self::new(
            std::env::var("BACKEND_ADDRESS").unwrap_or_else(|_| "http://jenkins:8080".to_string()),
        );
        config.user = std::env::var("BACKEND_USER").unwrap_or_default();
        config.token = std::env::var("BACKEND_TOKEN").unwrap_or_default();
        if let Some(timeout) = std::env::var("BACKEND_TIMEOUT")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.request_timeout = Duration::from_secs(timeout);
        }
        if let Ok(root) = std::env::var("BACKEND_WORKSPACE_ROOT") {
            config.workspace_root = root;
        }
        config
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.server_address.starts_with("http://") && !self.server_address.starts_with("https://")
        {
            anyhow::bail!("server_address must start with http:// or https://");
        }

        if self.user.is_empty() != self.token.is_empty() {
            anyhow::bail!("user and token must be set together");
        }

        if self.request_timeout.is_zero() {
            anyhow::bail!("request_timeout must be greater than 0");
        }

        Ok(())
    }

    /// Absolute URL for an endpoint path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.server_address, path)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::new("http://jenkins:8080")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BackendConfig::default();
        assert_eq!(config.server_address, "http://jenkins:8080");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = BackendConfig::new("jenkins:8080");
        assert!(config.validate().is_err());

        config = BackendConfig::new("https://ci.local/").with_credentials("admin", "");
        assert!(config.validate().is_err());

        config = config.with_credentials("admin", "t0k3n");
        assert!(config.validate().is_ok());
        assert_eq!(config.url("/scriptText"), "https://ci.local/scriptText");
    }

    #[test]
    fn test_expand_template() {
        let endpoints = Endpoints::default();
        assert_eq!(expand(&endpoints.build_info, "p_a_s_0"), "/job/p_a_s_0/lastBuild/api/json");
    }
}
