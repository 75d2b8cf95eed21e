use serde::Deserialize;

/// Relay configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    /// IP address to bind on (default "0.0.0.0").
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port sessions connect to.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum concurrent users.
    #[serde(default = "default_max_users")]
    pub max_users: u32,

    /// Longest accepted group name, in characters.
    #[serde(default = "default_max_group_name_len")]
    pub max_group_name_len: usize,

    /// Messages and files a user may send back to back.
    #[serde(default = "default_message_burst")]
    pub message_burst: f64,

    /// Sustained messages per second per user.
    #[serde(default = "default_message_rate")]
    pub message_rate_per_sec: f64,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    7878
}

fn default_max_users() -> u32 {
    64
}

fn default_max_group_name_len() -> usize {
    32
}

fn default_message_burst() -> f64 {
    20.0
}

fn default_message_rate() -> f64 {
    5.0
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_users: default_max_users(),
            max_group_name_len: default_max_group_name_len(),
            message_burst: default_message_burst(),
            message_rate_per_sec: default_message_rate(),
        }
    }
}
