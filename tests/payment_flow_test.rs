//! End-to-end payment flow: provider verification over HTTP, redemption,
//! and spending the credited tokens.
//!
//! Run with: cargo test --test payment_flow_test

use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tubegrab::core::config::quota;
use tubegrab::payment::{
    HttpPaymentProvider, PaymentProvider, RedeemOutcome, SpendOutcome, TokenLedger,
};
use tubegrab::storage::create_pool;

fn test_ledger() -> (tempfile::TempDir, TokenLedger) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("payments.sqlite");
    let pool = create_pool(db_path.to_str().unwrap()).unwrap();
    (dir, TokenLedger::new(pool))
}

/// Smallest amount that passes both the minimum-payment rule and buys at
/// least one token, regardless of what the environment configured.
fn paid_amount() -> i64 {
    (*quota::MIN_PAYMENT_CENTS).max(*quota::TOKEN_PRICE)
}

async fn mock_order(server: &MockServer, id: &str, body: serde_json::Value, status: u16) {
    Mock::given(method("GET"))
        .and(path(format!("/orders/{}", id)))
        .respond_with(ResponseTemplate::new(status).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_paid_order_verifies_and_credits_once() {
    let server = MockServer::start().await;
    let amount = paid_amount();
    let expected_tokens = amount / *quota::TOKEN_PRICE;

    mock_order(&server, "ord-100", json!({ "amount_cents": amount, "status": "paid" }), 200)
        .await;

    let provider = HttpPaymentProvider::new(server.uri(), String::new()).unwrap();
    let receipt = provider.verify("ord-100").await.unwrap();
    assert_eq!(receipt.payment_id, "ord-100");
    assert_eq!(receipt.provider, "http");
    assert_eq!(receipt.tokens, expected_tokens);

    let (_dir, ledger) = test_ledger();
    let outcome = ledger.redeem(42, &receipt).unwrap();
    assert_eq!(
        outcome,
        RedeemOutcome::Credited { tokens: expected_tokens, paid_balance: expected_tokens }
    );

    // Verifying again succeeds (the provider is stateless), but a second
    // redemption of the same payment never credits twice.
    let replay = provider.verify("ord-100").await.unwrap();
    assert_eq!(ledger.redeem(42, &replay).unwrap(), RedeemOutcome::AlreadyRedeemed);
    assert_eq!(ledger.status(42).unwrap().paid_balance, expected_tokens);
}

#[tokio::test]
async fn test_unpaid_order_is_refused() {
    let server = MockServer::start().await;
    mock_order(
        &server,
        "ord-pending",
        json!({ "amount_cents": paid_amount(), "status": "pending" }),
        200,
    )
    .await;

    let provider = HttpPaymentProvider::new(server.uri(), String::new()).unwrap();
    let err = provider.verify("ord-pending").await.unwrap_err();
    assert!(err.to_string().contains("pending"), "unexpected error: {}", err);
}

#[tokio::test]
async fn test_missing_order_is_refused() {
    let server = MockServer::start().await;
    mock_order(&server, "ord-ghost", json!({ "error": "no such order" }), 404).await;

    let provider = HttpPaymentProvider::new(server.uri(), String::new()).unwrap();
    let err = provider.verify("ord-ghost").await.unwrap_err();
    assert!(err.to_string().contains("not found"), "unexpected error: {}", err);
}

#[tokio::test]
async fn test_below_minimum_order_is_refused() {
    let server = MockServer::start().await;
    mock_order(
        &server,
        "ord-small",
        json!({ "amount_cents": *quota::MIN_PAYMENT_CENTS - 1, "status": "paid" }),
        200,
    )
    .await;

    let provider = HttpPaymentProvider::new(server.uri(), String::new()).unwrap();
    assert!(provider.verify("ord-small").await.is_err());
}

#[tokio::test]
async fn test_provider_sends_bearer_token() {
    let server = MockServer::start().await;
    let amount = paid_amount();

    // The matcher requires the header, so a match proves it was sent
    Mock::given(method("GET"))
        .and(path("/orders/ord-auth"))
        .and(header("authorization", "Bearer sekrit"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "amount_cents": amount, "status": "paid" })),
        )
        .mount(&server)
        .await;

    let provider = HttpPaymentProvider::new(server.uri(), "sekrit".to_string()).unwrap();
    assert!(provider.verify("ord-auth").await.is_ok());
}

#[tokio::test]
async fn test_malformed_payment_id_never_reaches_the_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let provider = HttpPaymentProvider::new(server.uri(), String::new()).unwrap();
    for bad in ["../secrets", "id with spaces", "", "id/../../x", "id?x=1"] {
        assert!(provider.verify(bad).await.is_err(), "accepted {:?}", bad);
    }
}

#[tokio::test]
async fn test_full_journey_free_then_paid_then_exhausted() {
    let server = MockServer::start().await;
    let amount = paid_amount();
    let tokens = amount / *quota::TOKEN_PRICE;
    mock_order(&server, "ord-journey", json!({ "amount_cents": amount, "status": "paid" }), 200)
        .await;

    let (_dir, ledger) = test_ledger();
    let chat = 77;

    // Fresh user burns through the free window first
    for _ in 0..*quota::FREE_DOWNLOADS {
        assert!(matches!(ledger.consume(chat).unwrap(), SpendOutcome::Free { .. }));
    }
    assert!(matches!(ledger.consume(chat).unwrap(), SpendOutcome::Exhausted { .. }));

    // Redeeming a verified payment unblocks downloads
    let provider = HttpPaymentProvider::new(server.uri(), String::new()).unwrap();
    let receipt = provider.verify("ord-journey").await.unwrap();
    ledger.redeem(chat, &receipt).unwrap();

    for left in (0..tokens).rev() {
        assert_eq!(ledger.consume(chat).unwrap(), SpendOutcome::Paid { remaining: left });
    }

    // Paid balance drained, free window still spent: refused again
    assert!(matches!(ledger.consume(chat).unwrap(), SpendOutcome::Exhausted { .. }));
}
