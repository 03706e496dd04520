use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub jwt_secret: String,
    pub host: String,
    pub port: u16,
    pub app_base_url: String,
    pub currency: String,
    // SMTP (optional)
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_from: Option<String>,
    // Payment providers (optional, a processor without credentials is disabled)
    pub stripe_secret_key: Option<String>,
    pub stripe_api_base: String,
    pub stripe_webhook_secret: Option<String>,
    pub paypal_client_id: Option<String>,
    pub paypal_client_secret: Option<String>,
    pub paypal_api_base: String,
    pub payment_timeout_secs: u64,
    pub cron: CronConfig,
}

/// Cron expressions for the background jobs. Times are UTC.
#[derive(Debug, Clone)]
pub struct CronConfig {
    pub overdue_first_notice: String,
    pub overdue_final_notice: String,
    pub payment_reminder: String,
    pub payment_reminder_second: String,
    pub registration_purge: String,
    pub enabled: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            jwt_secret: required("JWT_SECRET")?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".into())
                .parse()?,
            app_base_url: env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".into()),
            currency: env::var("CURRENCY")
                .unwrap_or_else(|_| "usd".into())
                .to_lowercase(),
            smtp_host: optional("SMTP_HOST"),
            smtp_port: env::var("SMTP_PORT").ok().and_then(|v| v.parse().ok()),
            smtp_username: optional("SMTP_USERNAME"),
            smtp_password: optional("SMTP_PASSWORD"),
            smtp_from: optional("SMTP_FROM"),
            stripe_secret_key: optional("STRIPE_SECRET_KEY"),
            stripe_api_base: env::var("STRIPE_API_BASE")
                .unwrap_or_else(|_| "https://api.stripe.com".into()),
            stripe_webhook_secret: optional("STRIPE_WEBHOOK_SECRET"),
            paypal_client_id: optional("PAYPAL_CLIENT_ID"),
            paypal_client_secret: optional("PAYPAL_CLIENT_SECRET"),
            paypal_api_base: env::var("PAYPAL_API_BASE")
                .unwrap_or_else(|_| "https://api-m.sandbox.paypal.com".into()),
            payment_timeout_secs: env::var("PAYMENT_TIMEOUT_SECS")
                .unwrap_or_else(|_| "20".into())
                .parse()?,
            cron: CronConfig::from_env(),
        })
    }
}

impl CronConfig {
    pub fn from_env() -> Self {
        Self {
            overdue_first_notice: env::var("OVERDUE_FIRST_NOTICE_CRON")
                .unwrap_or_else(|_| "0 9 2 * *".into()),
            overdue_final_notice: env::var("OVERDUE_FINAL_NOTICE_CRON")
                .unwrap_or_else(|_| "0 9 10 * *".into()),
            payment_reminder: env::var("PAYMENT_REMINDER_CRON")
                .unwrap_or_else(|_| "0 9 25 * *".into()),
            payment_reminder_second: env::var("PAYMENT_REMINDER_SECOND_CRON")
                .unwrap_or_else(|_| "0 9 28 * *".into()),
            registration_purge: env::var("REGISTRATION_PURGE_CRON")
                .unwrap_or_else(|_| "0 3 * * *".into()),
            enabled: env::var("CRON_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
        }
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    env::var(key).map_err(|_| anyhow::anyhow!("Missing required env var: {}", key))
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}
