// src/services/payment_provider.rs

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    config::Config,
    errors::AppError,
    models::subscription::{PaymentProvider, PaymentToken, Transaction},
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    /// Timeouts, connection failures and 5xx answers; worth retrying later.
    #[error("provider unavailable: {0}")]
    Transient(String),

    /// The provider refused the operation for good.
    #[error("provider refused: {0}")]
    Rejected(String),
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Transient(msg) => AppError::ProviderTransient(msg),
            GatewayError::Rejected(msg) => AppError::Provider(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Checkout {
    pub checkout_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChargeStatus {
    Done,
    Pending,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens a hosted payment page for `tx`.
    async fn create_checkout(
        &self,
        provider: &PaymentProvider,
        tx: &Transaction,
        return_url: &str,
    ) -> Result<Checkout, GatewayError>;

    /// Charges a saved token off-session.
    async fn charge_token(
        &self,
        provider: &PaymentProvider,
        token: &PaymentToken,
        tx: &Transaction,
    ) -> Result<ChargeStatus, GatewayError>;
}

// ─── HTTP gateway ─────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: Client,
    base_url: String,
    api_key: String,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "requestSuccessful")]
    request_successful: bool,
    #[serde(rename = "responseMessage")]
    response_message: String,
    #[serde(rename = "responseBody")]
    response_body: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(rename = "accessToken")]
    access_token: String,
}

#[derive(Debug, Serialize)]
struct CheckoutRequest<'a> {
    #[serde(with = "rust_decimal::serde::str")]
    amount: Decimal,
    #[serde(rename = "currencyCode")]
    currency_code: &'a str,
    #[serde(rename = "paymentReference")]
    payment_reference: &'a str,
    #[serde(rename = "providerCode")]
    provider_code: &'a str,
    #[serde(rename = "redirectUrl")]
    redirect_url: &'a str,
    tokenize: bool,
}

#[derive(Debug, Deserialize)]
struct CheckoutBody {
    #[serde(rename = "checkoutUrl")]
    checkout_url: String,
}

#[derive(Debug, Serialize)]
struct ChargeRequest<'a> {
    #[serde(with = "rust_decimal::serde::str")]
    amount: Decimal,
    #[serde(rename = "currencyCode")]
    currency_code: &'a str,
    #[serde(rename = "paymentReference")]
    payment_reference: &'a str,
    #[serde(rename = "cardToken")]
    card_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChargeBody {
    status: String,
}

fn classify(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        GatewayError::Transient(err.to_string())
    } else {
        GatewayError::Rejected(err.to_string())
    }
}

impl HttpPaymentGateway {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(config.provider_timeout())
            .build()
            .map_err(|e| AppError::Internal(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.provider_base_url.trim_end_matches('/').to_string(),
            api_key: config.provider_api_key.clone(),
            secret_key: config.provider_secret_key.clone(),
        })
    }

    async fn read_envelope<T: for<'de> Deserialize<'de>>(
        resp: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = resp.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(GatewayError::Transient(format!("provider answered {}", status)));
        }

        let envelope: Envelope<T> = resp.json().await.map_err(classify)?;
        if !envelope.request_successful {
            return Err(GatewayError::Rejected(envelope.response_message));
        }
        envelope
            .response_body
            .ok_or_else(|| GatewayError::Rejected("empty response body".to_string()))
    }

    /// Exchanges the API credentials for a bearer token.
    async fn access_token(&self) -> Result<String, GatewayError> {
        let credentials = format!("{}:{}", self.api_key, self.secret_key);
        let encoded = general_purpose::STANDARD.encode(credentials);

        let resp = self
            .client
            .post(format!("{}/api/v1/auth/login", self.base_url))
            .header("Authorization", format!("Basic {}", encoded))
            .send()
            .await
            .map_err(classify)?;

        let body: TokenBody = Self::read_envelope(resp).await?;
        Ok(body.access_token)
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_checkout(
        &self,
        provider: &PaymentProvider,
        tx: &Transaction,
        return_url: &str,
    ) -> Result<Checkout, GatewayError> {
        let token = self.access_token().await?;
        let payload = CheckoutRequest {
            amount: tx.amount,
            currency_code: &tx.currency,
            payment_reference: &tx.reference,
            provider_code: &provider.code,
            redirect_url: return_url,
            tokenize: tx.tokenize,
        };

        let resp = self
            .client
            .post(format!("{}/api/v1/checkouts", self.base_url))
            .bearer_auth(&token)
            .json(&payload)
            .send()
            .await
            .map_err(classify)?;

        let body: CheckoutBody = Self::read_envelope(resp).await?;
        debug!("Checkout opened for transaction {}", tx.reference);
        Ok(Checkout {
            checkout_url: body.checkout_url,
        })
    }

    async fn charge_token(
        &self,
        provider: &PaymentProvider,
        token: &PaymentToken,
        tx: &Transaction,
    ) -> Result<ChargeStatus, GatewayError> {
        let bearer = self.access_token().await?;
        let payload = ChargeRequest {
            amount: tx.amount,
            currency_code: &tx.currency,
            payment_reference: &tx.reference,
            card_token: &token.provider_ref,
        };

        let resp = self
            .client
            .post(format!("{}/api/v1/charges", self.base_url))
            .bearer_auth(&bearer)
            .json(&payload)
            .send()
            .await
            .map_err(classify)?;

        let body: ChargeBody = Self::read_envelope(resp).await?;
        match body.status.to_ascii_uppercase().as_str() {
            "PAID" | "SUCCESS" | "DONE" => Ok(ChargeStatus::Done),
            "PENDING" | "PROCESSING" => Ok(ChargeStatus::Pending),
            other => {
                warn!(
                    "Provider {} refused token charge {}: {}",
                    provider.code, tx.reference, other
                );
                Err(GatewayError::Rejected(format!("charge status {}", other)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_errors_map_to_http_semantics() {
        let transient: AppError = GatewayError::Transient("timeout".to_string()).into();
        let rejected: AppError = GatewayError::Rejected("card declined".to_string()).into();
        assert!(matches!(transient, AppError::ProviderTransient(_)));
        assert!(matches!(rejected, AppError::Provider(_)));
    }

    #[test]
    fn payloads_use_provider_field_names() {
        let payload = ChargeRequest {
            amount: Decimal::new(1050, 2),
            currency_code: "USD",
            payment_reference: "SUB-1-abc",
            card_token: "tok_1",
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["amount"], "10.50");
        assert_eq!(json["cardToken"], "tok_1");
        assert_eq!(json["paymentReference"], "SUB-1-abc");
    }
}
