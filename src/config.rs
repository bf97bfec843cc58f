use secrecy::Secret;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,

    // Shared token gating mutating routes; user auth proper lives upstream.
    pub service_token: Option<Secret<String>>,

    // Sync drain tuning
    pub sync_max_attempts: u32,
    pub sync_remote_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists (for local development)
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()?;

        Ok(Self {
            database_url: config.get("database_url")?,
            host: config.get("host").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: config.get("port").unwrap_or(8080),

            service_token: config
                .get::<String>("service_token")
                .ok()
                .map(Secret::new),

            sync_max_attempts: config.get("sync_max_attempts").unwrap_or(3),
            sync_remote_timeout_secs: config.get("sync_remote_timeout_secs").unwrap_or(10),
        })
    }
}
