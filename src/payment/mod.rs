//! Quota, token balances, and payment redemption

pub mod ledger;
pub mod provider;

pub use ledger::{QuotaStatus, RedeemOutcome, SpendOutcome, TokenLedger};
pub use provider::{HttpPaymentProvider, PaymentProvider, ProviderReceipt};
