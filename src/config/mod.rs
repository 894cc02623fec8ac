use anyhow::{bail, Result};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database_url: String,
    /// Base URL used when composing links in SMS bodies and OAuth redirects.
    pub public_base_url: String,
    pub default_backend: String,
    pub twilio: Option<TwilioConfig>,
    pub zoom: Option<ZoomConfig>,
    pub bluejeans: Option<BluejeansConfig>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub messaging_service_sid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ZoomConfig {
    pub client_id: String,
    pub client_secret: String,
    pub docs_url: Option<String>,
    pub profile_url: Option<String>,
    pub telephone_num: Option<String>,
    pub intl_telephone_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BluejeansConfig {
    pub client_id: String,
    pub client_secret: String,
    pub docs_url: Option<String>,
    pub telephone_num: Option<String>,
    pub intl_telephone_url: Option<String>,
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let server = ServerConfig {
            host: env_str("SERVER_HOST", "0.0.0.0"),
            port: std::env::var("SERVER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8000),
        };

        let database_url = match env_opt("DATABASE_URL") {
            Some(url) => url,
            None => format!(
                "postgres://{}:{}@{}:{}/{}",
                env_str("DB_USERNAME", "officeq"),
                env_str("DB_PASSWORD", ""),
                env_str("DB_SERVER", "localhost"),
                env_str("DB_PORT", "5432"),
                env_str("DB_DATABASE", "officeq"),
            ),
        };

        let twilio = match (env_opt("TWILIO_ACCOUNT_SID"), env_opt("TWILIO_AUTH_TOKEN")) {
            (Some(account_sid), Some(auth_token)) => Some(TwilioConfig {
                account_sid,
                auth_token,
                from_number: env_str("TWILIO_PHONE_FROM", ""),
                messaging_service_sid: env_opt("TWILIO_MESSAGING_SERVICE_SID"),
            }),
            _ => None,
        };

        let zoom = match (env_opt("ZOOM_CLIENT_ID"), env_opt("ZOOM_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => Some(ZoomConfig {
                client_id,
                client_secret,
                docs_url: env_opt("ZOOM_DOCS_URL"),
                profile_url: env_opt("ZOOM_PROFILE_URL"),
                telephone_num: env_opt("ZOOM_TELE_NUM"),
                intl_telephone_url: env_opt("ZOOM_INTL_URL"),
            }),
            _ => None,
        };

        let bluejeans = match (
            env_opt("BLUEJEANS_CLIENT_ID"),
            env_opt("BLUEJEANS_CLIENT_SECRET"),
        ) {
            (Some(client_id), Some(client_secret)) => Some(BluejeansConfig {
                client_id,
                client_secret,
                docs_url: env_opt("BLUEJEANS_DOCS_URL"),
                telephone_num: env_opt("BLUEJEANS_TELE_NUM"),
                intl_telephone_url: env_opt("BLUEJEANS_INTL_URL"),
            }),
            _ => None,
        };

        let default_backend = env_str("DEFAULT_BACKEND", "inperson");
        if default_backend.is_empty() {
            bail!("DEFAULT_BACKEND must not be empty");
        }

        Ok(Self {
            server,
            database_url,
            public_base_url: env_str("PUBLIC_BASE_URL", "http://localhost:8000"),
            default_backend,
            twilio,
            zoom,
            bluejeans,
        })
    }
}
