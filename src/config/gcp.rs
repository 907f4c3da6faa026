use serde::{Deserialize, Serialize};

/// GCP credential configuration shared by the ledger and sink clients.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum GcpCredentials {
    /// Use Application Default Credentials (metadata server on Cloud Run).
    #[default]
    Default,

    /// Use a service account key file.
    ServiceAccount { key_path: String },

    /// Use a service account key from JSON string (useful with env vars).
    ServiceAccountJson { json: String },

    /// Send a fixed bearer token. Intended for emulators and tests.
    Static { token: String },
}

impl std::fmt::Debug for GcpCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "Default"),
            Self::ServiceAccount { key_path } => f
                .debug_struct("ServiceAccount")
                .field("key_path", key_path)
                .finish(),
            Self::ServiceAccountJson { .. } => f
                .debug_struct("ServiceAccountJson")
                .field("json", &"****")
                .finish(),
            Self::Static { .. } => f.debug_struct("Static").field("token", &"****").finish(),
        }
    }
}

impl GcpCredentials {
    pub fn validate(&self, section: &str) -> Result<(), String> {
        match self {
            Self::Default => Ok(()),
            Self::ServiceAccount { key_path } if key_path.trim().is_empty() => {
                Err(format!("{section}.credentials.key_path must not be empty"))
            }
            Self::ServiceAccountJson { json } if json.trim().is_empty() => {
                Err(format!("{section}.credentials.json must not be empty"))
            }
            Self::Static { token } if token.trim().is_empty() => {
                Err(format!("{section}.credentials.token must not be empty"))
            }
            _ => Ok(()),
        }
    }
}
