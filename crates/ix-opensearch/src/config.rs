use std::time::Duration;

use crate::naming::DEFAULT_INDEX_PREFIX;

/// Connection settings for the index backend
#[derive(Debug, Clone)]
pub struct OpenSearchConfig {
    /// e.g. `https://search.internal:9200`
    pub base_url: String,
    pub index_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for OpenSearchConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9200".to_string(),
            index_prefix: DEFAULT_INDEX_PREFIX.to_string(),
            username: None,
            password: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl OpenSearchConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_index_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.index_prefix = prefix.into();
        self
    }
}
