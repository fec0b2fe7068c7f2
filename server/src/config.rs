//! Server configuration

use serde::Deserialize;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server host
    #[serde(default = "default_http_host")]
    pub http_host: String,

    /// HTTP server port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Database URL (SQLite) backing remote storage
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Docker socket path
    #[serde(default)]
    pub docker_socket: Option<String>,

    /// Container backend: "docker" or "memory"
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Tracking mechanism: "git" or "memory"
    #[serde(default = "default_tracker")]
    pub tracker: String,

    /// Base image for new environments
    #[serde(default = "default_base_image")]
    pub base_image: String,

    /// Working directory inside new environments
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Shell used to wrap commands
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Docker network for background services and tunnels
    #[serde(default)]
    pub docker_network: Option<String>,

    /// Image used for host tunnel sidecars
    #[serde(default = "default_tunnel_image")]
    pub tunnel_image: String,

    /// First host port handed out for tunnels (inclusive)
    #[serde(default = "default_tunnel_port_start")]
    pub tunnel_port_start: u16,

    /// End of the host port range for tunnels (exclusive)
    #[serde(default = "default_tunnel_port_end")]
    pub tunnel_port_end: u16,

    /// MCP server mode: "disabled" or "stdio"
    #[serde(default = "default_mcp_mode")]
    pub mcp_mode: String,
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_database_url() -> String {
    "sqlite:data/environments.db?mode=rwc".to_string()
}

fn default_backend() -> String {
    "docker".to_string()
}

fn default_tracker() -> String {
    "git".to_string()
}

fn default_base_image() -> String {
    "ubuntu:24.04".to_string()
}

fn default_workdir() -> String {
    "/workdir".to_string()
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_tunnel_image() -> String {
    "alpine/socat:latest".to_string()
}

fn default_tunnel_port_start() -> u16 {
    5000
}

fn default_tunnel_port_end() -> u16 {
    6000
}

fn default_mcp_mode() -> String {
    "disabled".to_string()
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup (keys carry the `ENVIRONMENT_` prefix)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Config::default();

        if let Some(val) = lookup("ENVIRONMENT_HTTP_HOST") {
            config.http_host = val;
        }
        if let Some(val) = lookup("ENVIRONMENT_HTTP_PORT") {
            config.http_port = val
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid ENVIRONMENT_HTTP_PORT {val:?}: {e}"))?;
        }
        if let Some(val) = lookup("ENVIRONMENT_DATABASE_URL") {
            config.database_url = val;
        }
        if let Some(val) = lookup("ENVIRONMENT_DOCKER_SOCKET") {
            config.docker_socket = Some(val);
        }
        if let Some(val) = lookup("ENVIRONMENT_BACKEND") {
            config.backend = val;
        }
        if let Some(val) = lookup("ENVIRONMENT_TRACKER") {
            config.tracker = val;
        }
        if let Some(val) = lookup("ENVIRONMENT_BASE_IMAGE") {
            config.base_image = val;
        }
        if let Some(val) = lookup("ENVIRONMENT_WORKDIR") {
            config.workdir = val;
        }
        if let Some(val) = lookup("ENVIRONMENT_SHELL") {
            config.shell = val;
        }
        if let Some(val) = lookup("ENVIRONMENT_DOCKER_NETWORK") {
            config.docker_network = Some(val);
        }
        if let Some(val) = lookup("ENVIRONMENT_TUNNEL_IMAGE") {
            config.tunnel_image = val;
        }
        if let Some(val) = lookup("ENVIRONMENT_TUNNEL_PORT_START") {
            config.tunnel_port_start = val
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid ENVIRONMENT_TUNNEL_PORT_START {val:?}: {e}"))?;
        }
        if let Some(val) = lookup("ENVIRONMENT_TUNNEL_PORT_END") {
            config.tunnel_port_end = val
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid ENVIRONMENT_TUNNEL_PORT_END {val:?}: {e}"))?;
        }
        if let Some(val) = lookup("ENVIRONMENT_MCP_MODE") {
            config.mcp_mode = val;
        }

        if config.tunnel_port_start >= config.tunnel_port_end {
            anyhow::bail!(
                "empty tunnel port range {}-{}",
                config.tunnel_port_start,
                config.tunnel_port_end
            );
        }

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_host: default_http_host(),
            http_port: default_http_port(),
            database_url: default_database_url(),
            docker_socket: None,
            backend: default_backend(),
            tracker: default_tracker(),
            base_image: default_base_image(),
            workdir: default_workdir(),
            shell: default_shell(),
            docker_network: None,
            tunnel_image: default_tunnel_image(),
            tunnel_port_start: default_tunnel_port_start(),
            tunnel_port_end: default_tunnel_port_end(),
            mcp_mode: default_mcp_mode(),
        }
    }
}
