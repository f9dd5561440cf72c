//! Telegram Stars checkout updates.
//!
//! Stars payments arrive as two updates: a pre-checkout query that must be
//! answered within ten seconds, then a service message with the settled
//! payment. Crediting goes through the ledger so a replayed update cannot
//! double-credit.

use teloxide::prelude::*;
use teloxide::types::{Message, PreCheckoutQuery};

use super::types::{fetch_user, HandlerDeps, HandlerError};
use crate::core::{config, metrics};
use crate::payment::ledger::RedeemOutcome;
use crate::payment::provider::ProviderReceipt;

pub(super) async fn handle_pre_checkout(
    bot: &Bot,
    query: &PreCheckoutQuery,
) -> Result<(), HandlerError> {
    let ok = query.invoice_payload.starts_with("tokens:");
    let answer = bot.answer_pre_checkout_query(query.id.clone(), ok);
    if ok {
        answer.await?;
    } else {
        log::warn!("Rejecting pre-checkout with unknown payload: {}", query.invoice_payload);
        answer
            .error_message("This invoice is no longer valid. Start over with /buy.")
            .await?;
    }
    Ok(())
}

pub(super) async fn handle_successful_payment(
    bot: &Bot,
    msg: &Message,
    deps: &HandlerDeps,
) -> Result<(), HandlerError> {
    let Some(payment) = msg.successful_payment() else {
        return Ok(());
    };
    let user = fetch_user(deps, msg)?;

    let tokens = payment
        .invoice_payload
        .strip_prefix("tokens:")
        .and_then(|t| t.parse::<i64>().ok())
        .unwrap_or(*config::payment::TOKEN_PACK_SIZE);

    let receipt =
        ProviderReceipt::stars(&payment.telegram_payment_charge_id.0, payment.total_amount, tokens);

    match deps.ledger.redeem(user.chat_id, &receipt) {
        Ok(RedeemOutcome::Credited { tokens, paid_balance }) => {
            metrics::record_payment_success("telegram-stars", u64::from(payment.total_amount));
            log::info!(
                "Chat {} bought {} tokens for {} stars (charge {})",
                user.chat_id,
                tokens,
                payment.total_amount,
                payment.telegram_payment_charge_id
            );
            bot.send_message(
                msg.chat.id,
                format!("⭐ Thank you! +{} tokens, you now have {} paid tokens.", tokens, paid_balance),
            )
            .await?;
        }
        Ok(RedeemOutcome::AlreadyRedeemed) => {
            // Telegram redelivered the update; the first delivery credited it
            log::warn!(
                "Duplicate successful_payment for charge {}",
                payment.telegram_payment_charge_id
            );
        }
        Err(e) => {
            metrics::record_payment_failure("ledger");
            log::error!(
                "Crediting charge {} for chat {} failed: {}",
                payment.telegram_payment_charge_id,
                user.chat_id,
                e
            );
            bot.send_message(
                msg.chat.id,
                format!(
                    "Your payment went through but crediting failed. Contact the admin and quote charge {}.",
                    payment.telegram_payment_charge_id
                ),
            )
            .await?;
        }
    }
    Ok(())
}
