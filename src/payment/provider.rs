//! Payment receipt verification.
//!
//! `/redeem <payment_id>` looks the payment up at an external provider API
//! and normalizes the answer into a [`ProviderReceipt`]. Telegram Stars
//! purchases skip verification (Telegram already settled them) and build
//! their receipt directly from the successful_payment update.

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::core::config::{payment, quota};
use crate::core::error::{AppError, AppResult};

/// A verified payment, normalized across providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReceipt {
    /// Provider-unique payment identifier; redemption keys on this
    pub payment_id: String,
    pub provider: String,
    pub amount_cents: i64,
    /// Tokens this payment is worth
    pub tokens: i64,
}

impl ProviderReceipt {
    /// Receipt for a settled Telegram Stars purchase.
    pub fn stars(charge_id: &str, stars: u32, tokens: i64) -> Self {
        Self {
            payment_id: charge_id.to_string(),
            provider: "telegram-stars".to_string(),
            // Stars have no cent value; keep the raw amount for bookkeeping
            amount_cents: i64::from(stars),
            tokens,
        }
    }
}

/// Verifies payment identifiers against a provider's records.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Human-readable provider name (e.g. "http")
    fn name(&self) -> &str;

    /// Looks up a payment and returns its receipt, or an error when the
    /// payment does not exist, is unpaid, or is below the minimum.
    async fn verify(&self, payment_id: &str) -> AppResult<ProviderReceipt>;
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    amount_cents: i64,
    status: String,
}

/// Provider backed by a plain HTTP order-lookup API.
///
/// Expects `GET {base_url}/orders/{payment_id}` to answer
/// `{"amount_cents": 500, "status": "paid"}` for settled payments.
pub struct HttpPaymentProvider {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl HttpPaymentProvider {
    /// Builds the provider from PAYMENT_API_URL, or `None` when redemption
    /// is not configured.
    pub fn from_env() -> AppResult<Option<Self>> {
        match payment::API_URL.as_deref() {
            Some(base_url) => {
                Ok(Some(Self::new(base_url.to_string(), payment::API_TOKEN.clone())?))
            }
            None => Ok(None),
        }
    }

    pub fn new(base_url: String, api_token: String) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(payment::verify_timeout())
            .build()?;
        Ok(Self { client, base_url, api_token })
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn verify(&self, payment_id: &str) -> AppResult<ProviderReceipt> {
        // Reject anything that could change the request path
        if payment_id.is_empty() || !payment_id.chars().all(is_payment_id_char) {
            return Err(AppError::Payment(format!("malformed payment id: {:?}", payment_id)));
        }

        let url = Url::parse(&format!("{}/orders/{}", self.base_url, payment_id))?;

        let mut request = self.client.get(url);
        if !self.api_token.is_empty() {
            request = request.bearer_auth(&self.api_token);
        }

        let response = request.send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::Payment(format!("payment {} not found", payment_id)));
        }
        if !response.status().is_success() {
            return Err(AppError::HttpStatus(response.status()));
        }

        let order: OrderResponse = response.json().await?;
        receipt_from_order(payment_id, self.name(), &order)
    }
}

fn is_payment_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Maps a provider order onto a receipt, enforcing the payment rules.
fn receipt_from_order(
    payment_id: &str,
    provider: &str,
    order: &OrderResponse,
) -> AppResult<ProviderReceipt> {
    if order.status != "paid" {
        return Err(AppError::Payment(format!(
            "payment {} has status '{}', expected 'paid'",
            payment_id, order.status
        )));
    }

    if order.amount_cents < *quota::MIN_PAYMENT_CENTS {
        return Err(AppError::Payment(format!(
            "payment {} is below the minimum ({} < {} cents)",
            payment_id,
            order.amount_cents,
            *quota::MIN_PAYMENT_CENTS
        )));
    }

    let tokens = order.amount_cents / *quota::TOKEN_PRICE;
    if tokens < 1 {
        return Err(AppError::Payment(format!("payment {} buys no tokens", payment_id)));
    }

    Ok(ProviderReceipt {
        payment_id: payment_id.to_string(),
        provider: provider.to_string(),
        amount_cents: order.amount_cents,
        tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paid_order_maps_to_receipt() {
        let order = OrderResponse { amount_cents: 500, status: "paid".to_string() };
        let receipt = receipt_from_order("order-1", "http", &order).unwrap();
        assert_eq!(receipt.payment_id, "order-1");
        assert_eq!(receipt.tokens, 500 / *quota::TOKEN_PRICE);
    }

    #[test]
    fn test_unpaid_order_is_rejected() {
        let order = OrderResponse { amount_cents: 500, status: "pending".to_string() };
        assert!(receipt_from_order("order-2", "http", &order).is_err());
    }

    #[test]
    fn test_below_minimum_is_rejected() {
        let order = OrderResponse {
            amount_cents: *quota::MIN_PAYMENT_CENTS - 1,
            status: "paid".to_string(),
        };
        assert!(receipt_from_order("order-3", "http", &order).is_err());
    }

    #[test]
    fn test_zero_amount_is_rejected() {
        let order = OrderResponse { amount_cents: 0, status: "paid".to_string() };
        assert!(receipt_from_order("order-4", "http", &order).is_err());
    }

    #[test]
    fn test_payment_id_charset() {
        assert!(is_payment_id_char('a'));
        assert!(is_payment_id_char('Z'));
        assert!(is_payment_id_char('7'));
        assert!(is_payment_id_char('-'));
        assert!(is_payment_id_char('_'));
        assert!(!is_payment_id_char('/'));
        assert!(!is_payment_id_char('.'));
        assert!(!is_payment_id_char(' '));
    }

    #[test]
    fn test_stars_receipt() {
        let receipt = ProviderReceipt::stars("charge-abc", 50, 10);
        assert_eq!(receipt.provider, "telegram-stars");
        assert_eq!(receipt.payment_id, "charge-abc");
        assert_eq!(receipt.tokens, 10);
    }
}
