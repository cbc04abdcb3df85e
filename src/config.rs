// src/config.rs

use anyhow::Context;
use chrono_tz::Tz;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    /// Absent means in-memory stores
    pub database_url: Option<String>,
    pub public_base_url: String,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    /// Absent means outgoing mail is only logged
    pub smtp: Option<SmtpConfig>,
    pub email_from_name: String,
    pub email_from_address: String,
    pub provider_base_url: String,
    pub provider_api_key: String,
    pub provider_secret_key: String,
    pub provider_timeout_secs: u64,
    pub billing_interval_secs: u64,
    pub default_timezone: Tz,
    pub default_currency_decimals: u32,
    pub portal_page_size: u32,
    pub approval_deadline_days: i64,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parsed_or<T>(key: &str, default: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var_or(key, default)
        .parse()
        .with_context(|| format!("{} must be a valid value", key))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();

        let smtp = match env::var("SMTP_HOST") {
            Ok(host) => Some(SmtpConfig {
                host,
                port: parsed_or("SMTP_PORT", "587")?,
                username: env::var("SMTP_USERNAME").context("SMTP_USERNAME must be set")?,
                password: env::var("SMTP_PASSWORD").context("SMTP_PASSWORD must be set")?,
            }),
            Err(_) => None,
        };

        let timezone = var_or("DEFAULT_TIMEZONE", "UTC");

        Ok(Self {
            server_host: var_or("SERVER_HOST", "127.0.0.1"),
            server_port: parsed_or("SERVER_PORT", "3000")?,
            database_url: env::var("DATABASE_URL").ok(),
            public_base_url: var_or("PUBLIC_BASE_URL", "http://127.0.0.1:3000"),
            jwt_secret: env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            jwt_expiry_hours: parsed_or("JWT_EXPIRY_HOURS", "24")?,
            smtp,
            email_from_name: var_or("EMAIL_FROM_NAME", "Back Office"),
            email_from_address: var_or("EMAIL_FROM_ADDRESS", "billing@localhost"),
            provider_base_url: var_or("PAYMENT_PROVIDER_BASE_URL", "https://sandbox.payments.local"),
            provider_api_key: var_or("PAYMENT_PROVIDER_API_KEY", ""),
            provider_secret_key: var_or("PAYMENT_PROVIDER_SECRET_KEY", ""),
            provider_timeout_secs: parsed_or("PAYMENT_PROVIDER_TIMEOUT_SECS", "30")?,
            billing_interval_secs: parsed_or("BILLING_INTERVAL_SECS", "3600")?,
            default_timezone: timezone
                .parse()
                .map_err(|_| anyhow::anyhow!("DEFAULT_TIMEZONE '{}' is not a known timezone", timezone))?,
            default_currency_decimals: parsed_or("DEFAULT_CURRENCY_DECIMALS", "2")?,
            portal_page_size: parsed_or("PORTAL_PAGE_SIZE", "20")?,
            approval_deadline_days: parsed_or("APPROVAL_DEADLINE_DAYS", "3")?,
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    /// Settings projected into the subscription billing service.
    pub fn billing_settings(&self) -> BillingSettings {
        BillingSettings {
            default_currency_decimals: self.default_currency_decimals,
            portal_page_size: self.portal_page_size.max(1),
            public_base_url: self.public_base_url.clone(),
        }
    }

    pub fn approval_settings(&self) -> ApprovalSettings {
        ApprovalSettings {
            deadline_days: self.approval_deadline_days,
        }
    }

    /// Defaults for tests and tools that never read the environment.
    pub fn for_tests() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            database_url: None,
            public_base_url: "http://localhost".to_string(),
            jwt_secret: "test-secret".to_string(),
            jwt_expiry_hours: 1,
            smtp: None,
            email_from_name: "Back Office".to_string(),
            email_from_address: "billing@localhost".to_string(),
            provider_base_url: "http://localhost:9".to_string(),
            provider_api_key: String::new(),
            provider_secret_key: String::new(),
            provider_timeout_secs: 30,
            billing_interval_secs: 3600,
            default_timezone: Tz::UTC,
            default_currency_decimals: 2,
            portal_page_size: 20,
            approval_deadline_days: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BillingSettings {
    pub default_currency_decimals: u32,
    pub portal_page_size: u32,
    pub public_base_url: String,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Config::for_tests().billing_settings()
    }
}

#[derive(Debug, Clone)]
pub struct ApprovalSettings {
    /// Days until a freshly created approval activity is due
    pub deadline_days: i64,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self { deadline_days: 3 }
    }
}
