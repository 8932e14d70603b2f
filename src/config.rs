use std::path::PathBuf;

/// Runtime configuration collected once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub http_host: String,
    pub http_port: u16,
    pub telegram_token: Option<String>,
    /// Organization that first-contact channel customers are created
    /// under. Explicit configuration, not a baked-in constant.
    pub default_org_id: i64,
    pub default_org_name: String,
    /// Optional bootstrap admin credentials, applied only when the user
    /// table is empty.
    pub admin_email: Option<String>,
    pub admin_password: Option<String>,
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub google_redirect_uri: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_path = env_or("DATABASE_PATH", "helpdesk.db").into();
        let http_host = env_or("HTTP_HOST", "0.0.0.0");
        let http_port = env_or("HTTP_PORT", "8080")
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid HTTP_PORT: {e}"))?;

        let telegram_token = std::env::var("TELOXIDE_TOKEN")
            .or_else(|_| std::env::var("TELEGRAM_BOT_TOKEN"))
            .ok();

        let default_org_id = env_or("DEFAULT_ORG_ID", "1")
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid DEFAULT_ORG_ID: {e}"))?;

        Ok(Self {
            database_path,
            http_host,
            http_port,
            telegram_token,
            default_org_id,
            default_org_name: env_or("DEFAULT_ORG_NAME", "Default Organization"),
            admin_email: std::env::var("ADMIN_EMAIL").ok(),
            admin_password: std::env::var("ADMIN_PASSWORD").ok(),
            google_client_id: std::env::var("GOOGLE_CLIENT_ID").ok(),
            google_client_secret: std::env::var("GOOGLE_CLIENT_SECRET").ok(),
            google_redirect_uri: std::env::var("GOOGLE_REDIRECT_URI").ok(),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
