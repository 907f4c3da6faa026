use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request body size limit in bytes. Trigger bodies are ignored, so this
    /// only guards against oversized junk.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,

    /// Overall request timeout in seconds.
    ///
    /// Should exceed the reporter's query and write timeouts combined so the
    /// reporter, not the server, decides how a slow run fails.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
            timeout_secs: default_timeout(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

fn default_body_limit() -> usize {
    64 * 1024 // 64 KB
}

fn default_timeout() -> u64 {
    300
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.timeout_secs == 0 {
            return Err("server.timeout_secs must be greater than 0".into());
        }
        Ok(())
    }
}
