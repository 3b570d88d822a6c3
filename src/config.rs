//! Server configuration, loaded from environment variables.
//! Every knob has a default; secrets are never logged.

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address, e.g. ":8080" or "0.0.0.0:8080".
    pub http_addr: String,

    /// `sqlite://<path>`. A `postgres://` URL is recognized as a scheme but
    /// not served by this build.
    pub database_url: String,

    /// debug|info|warn|error — feeds the tracing EnvFilter.
    pub log_level: String,

    /// Directory uploaded files are persisted to and served from.
    pub upload_dir: String,

    pub wechat: WeChatConfig,
}

#[derive(Debug, Clone, Default)]
pub struct WeChatConfig {
    pub appid: Option<String>,
    pub appsecret: Option<String>,
    pub call_template_id: Option<String>,
    pub call_page: Option<String>,
    pub activity_template_id: Option<String>,
    pub activity_page: Option<String>,
}

impl WeChatConfig {
    pub fn configured(&self) -> bool {
        self.appid.is_some() && self.appsecret.is_some()
    }
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            http_addr: env::var("HTTP_ADDR").unwrap_or_else(|_| ":8080".to_string()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/campus-chat.db".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            upload_dir: env::var("UPLOAD_DIR").unwrap_or_else(|_| "data/uploads".to_string()),
            wechat: WeChatConfig {
                appid: env::var("WECHAT_APPID").ok(),
                appsecret: env::var("WECHAT_APPSECRET").ok(),
                call_template_id: env::var("WECHAT_CALL_SUBSCRIBE_TEMPLATE_ID").ok(),
                call_page: env::var("WECHAT_CALL_SUBSCRIBE_PAGE").ok(),
                activity_template_id: env::var("WECHAT_ACTIVITY_SUBSCRIBE_TEMPLATE_ID").ok(),
                activity_page: env::var("WECHAT_ACTIVITY_SUBSCRIBE_PAGE").ok(),
            },
        }
    }

    /// Filesystem path behind a `sqlite://` DATABASE_URL. Bare paths are
    /// accepted for convenience in tests and dev.
    pub fn sqlite_path(&self) -> Option<&str> {
        if let Some(rest) = self.database_url.strip_prefix("sqlite://") {
            Some(rest)
        } else if self.database_url.contains("://") {
            None
        } else {
            Some(&self.database_url)
        }
    }

    /// ":8080" → "0.0.0.0", 8080. Rocket wants address and port separately.
    pub fn bind(&self) -> (String, u16) {
        let (host, port) = match self.http_addr.rsplit_once(':') {
            Some((h, p)) => (h, p),
            None => ("", self.http_addr.as_str()),
        };
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        (host.to_string(), port.parse().unwrap_or(8080))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
