//! Configuration, loaded from the environment.

use crate::error::AppError;
use secrecy::Secret;
use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub service_name: String,
    pub port: u16,
    pub log_level: String,
    pub database: DatabaseConfig,
    pub payment_source: PaymentSourceConfig,
    pub tax_authority: TaxAuthorityConfig,
    /// Delay before the post-filing verification lookup runs.
    pub verify_delay_secs: u64,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct PaymentSourceConfig {
    pub base_url: String,
    pub shop_id: String,
    pub secret_key: Secret<String>,
}

#[derive(Debug, Clone)]
pub struct TaxAuthorityConfig {
    pub base_url: String,
    pub login: String,
    pub password: Secret<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        Ok(Self {
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "fiscal-recon".to_string()),
            port: env::var("PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8080),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            payment_source: PaymentSourceConfig {
                base_url: env::var("PAYMENT_SOURCE_URL")
                    .unwrap_or_else(|_| "https://api.yookassa.ru/v3".to_string()),
                shop_id: env::var("PAYMENT_SOURCE_SHOP_ID").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("PAYMENT_SOURCE_SHOP_ID is required"))
                })?,
                secret_key: Secret::new(env::var("PAYMENT_SOURCE_SECRET_KEY").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("PAYMENT_SOURCE_SECRET_KEY is required"))
                })?),
            },
            tax_authority: TaxAuthorityConfig {
                base_url: env::var("TAX_AUTHORITY_URL")
                    .unwrap_or_else(|_| "https://lknpd.nalog.ru/api/v1".to_string()),
                login: env::var("TAX_AUTHORITY_LOGIN").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("TAX_AUTHORITY_LOGIN is required"))
                })?,
                password: Secret::new(env::var("TAX_AUTHORITY_PASSWORD").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("TAX_AUTHORITY_PASSWORD is required"))
                })?),
            },
            verify_delay_secs: env::var("VERIFY_DELAY_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
        })
    }
}
