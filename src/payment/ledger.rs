//! Quota accounting: time-boxed free downloads plus paid token balances.
//!
//! Every accepted request costs one token, charged up front — cache hits
//! included, and nothing is refunded if the download later fails. Free
//! tokens are spent before paid ones. The free counter is not stored until
//! first use: a missing or expired row simply means "full", and `consume`
//! materializes it with a fresh reset deadline.

use chrono::Utc;
use rusqlite::TransactionBehavior;

use crate::core::config::quota;
use crate::core::error::{AppError, AppResult};
use crate::storage::db::{get_connection, DbPool};

use super::provider::ProviderReceipt;

/// What one `consume` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpendOutcome {
    /// A free token was spent; `remaining` free tokens left in this window.
    Free { remaining: i64 },
    /// Free tokens were gone, a paid token was spent; `remaining` paid tokens left.
    Paid { remaining: i64 },
    /// Both balances empty. `resets_at` is when the free counter refills (unix seconds).
    Exhausted { resets_at: i64 },
}

/// Result of a redemption attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeemOutcome {
    /// The receipt was fresh; tokens were credited.
    Credited { tokens: i64, paid_balance: i64 },
    /// This payment_id has been redeemed before. Nothing was credited.
    AlreadyRedeemed,
}

/// A user's current balances, read without modifying anything.
#[derive(Debug, Clone)]
pub struct QuotaStatus {
    pub plan: String,
    pub free_remaining: i64,
    pub free_ceiling: i64,
    /// When the free counter refills (unix seconds)
    pub resets_at: i64,
    pub paid_balance: i64,
}

/// Handle to the quota tables, cheap to clone.
#[derive(Clone)]
pub struct TokenLedger {
    pool: DbPool,
}

impl TokenLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Charges one token to the chat, free balance first.
    pub fn consume(&self, chat_id: i64) -> AppResult<SpendOutcome> {
        self.consume_at(chat_id, Utc::now().timestamp())
    }

    fn consume_at(&self, chat_id: i64, now: i64) -> AppResult<SpendOutcome> {
        let mut conn = get_connection(&self.pool)?;
        // Immediate: take the write lock up front so concurrent spends for
        // the same chat serialize instead of failing halfway through.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ceiling = free_ceiling(&plan_of(&tx, chat_id)?);

        let counter = read_counter(&tx, chat_id)?;
        let (mut remaining, resets_at) = match counter {
            Some((remaining, resets_at)) if resets_at > now => (remaining, resets_at),
            // Missing or expired: a full window starts now
            _ => (ceiling, now + quota::RESET_WINDOW_SECS as i64),
        };

        if remaining > 0 {
            remaining -= 1;
            write_counter(&tx, chat_id, remaining, resets_at)?;
            tx.commit()?;
            return Ok(SpendOutcome::Free { remaining });
        }

        // Free tokens are gone; persist the zeroed window so resets_at
        // stays stable, then try the paid balance, oldest purchase first.
        write_counter(&tx, chat_id, 0, resets_at)?;

        let spent = tx.execute(
            "UPDATE payments SET tokens_left = tokens_left - 1
             WHERE id = (
                 SELECT id FROM payments
                 WHERE chat_id = ?1 AND tokens_left > 0
                 ORDER BY created_at ASC, id ASC LIMIT 1
             )",
            rusqlite::params![chat_id],
        )?;

        if spent == 0 {
            tx.commit()?;
            return Ok(SpendOutcome::Exhausted { resets_at });
        }

        let remaining = paid_balance_in(&tx, chat_id)?;
        tx.commit()?;
        Ok(SpendOutcome::Paid { remaining })
    }

    /// Credits a verified receipt, at most once per payment_id.
    ///
    /// The payments table has a UNIQUE constraint on payment_id; a second
    /// redemption attempt hits it and comes back as `AlreadyRedeemed`
    /// without touching any balance.
    pub fn redeem(&self, chat_id: i64, receipt: &ProviderReceipt) -> AppResult<RedeemOutcome> {
        if receipt.tokens < 1 {
            return Err(AppError::Payment(format!(
                "receipt {} carries no tokens",
                receipt.payment_id
            )));
        }

        let mut conn = get_connection(&self.pool)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            "INSERT INTO payments (payment_id, chat_id, provider, amount_cents, tokens_left)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                receipt.payment_id,
                chat_id,
                receipt.provider,
                receipt.amount_cents,
                receipt.tokens,
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Ok(RedeemOutcome::AlreadyRedeemed);
            }
            Err(e) => return Err(e.into()),
        }

        let paid_balance = paid_balance_in(&tx, chat_id)?;
        tx.commit()?;

        log::info!(
            "💳 Credited {} tokens to chat {} (payment {}, provider {})",
            receipt.tokens,
            chat_id,
            receipt.payment_id,
            receipt.provider
        );

        Ok(RedeemOutcome::Credited { tokens: receipt.tokens, paid_balance })
    }

    /// Reads both balances without spending anything.
    pub fn status(&self, chat_id: i64) -> AppResult<QuotaStatus> {
        self.status_at(chat_id, Utc::now().timestamp())
    }

    fn status_at(&self, chat_id: i64, now: i64) -> AppResult<QuotaStatus> {
        let conn = get_connection(&self.pool)?;

        let plan = plan_of(&conn, chat_id)?;
        let ceiling = free_ceiling(&plan);

        let (free_remaining, resets_at) = match read_counter(&conn, chat_id)? {
            Some((remaining, resets_at)) if resets_at > now => {
                // Stored counters predate plan upgrades; never report above
                // the current ceiling, and never below zero.
                (remaining.clamp(0, ceiling), resets_at)
            }
            _ => (ceiling, now + quota::RESET_WINDOW_SECS as i64),
        };

        let paid_balance = paid_balance_in(&conn, chat_id)?;

        Ok(QuotaStatus { plan, free_remaining, free_ceiling: ceiling, resets_at, paid_balance })
    }
}

fn free_ceiling(plan: &str) -> i64 {
    if plan == "vip" {
        *quota::FREE_DOWNLOADS * *quota::VIP_MULTIPLIER
    } else {
        *quota::FREE_DOWNLOADS
    }
}

fn plan_of(conn: &rusqlite::Connection, chat_id: i64) -> AppResult<String> {
    match conn.query_row(
        "SELECT plan FROM users WHERE chat_id = ?1",
        rusqlite::params![chat_id],
        |row| row.get::<_, String>(0),
    ) {
        Ok(plan) => Ok(plan),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok("free".to_string()),
        Err(e) => Err(e.into()),
    }
}

fn read_counter(conn: &rusqlite::Connection, chat_id: i64) -> AppResult<Option<(i64, i64)>> {
    match conn.query_row(
        "SELECT remaining, resets_at FROM free_quota WHERE chat_id = ?1",
        rusqlite::params![chat_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    ) {
        Ok(pair) => Ok(Some(pair)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_counter(
    conn: &rusqlite::Connection,
    chat_id: i64,
    remaining: i64,
    resets_at: i64,
) -> AppResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO free_quota (chat_id, remaining, resets_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![chat_id, remaining, resets_at],
    )?;
    Ok(())
}

fn paid_balance_in(conn: &rusqlite::Connection, chat_id: i64) -> AppResult<i64> {
    let sum: i64 = conn.query_row(
        "SELECT COALESCE(SUM(tokens_left), 0) FROM payments WHERE chat_id = ?1",
        rusqlite::params![chat_id],
        |row| row.get(0),
    )?;
    Ok(sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::create_pool;

    const NOW: i64 = 1_700_000_000;

    fn test_ledger() -> (tempfile::TempDir, TokenLedger) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger_test.sqlite");
        let pool = create_pool(path.to_str().unwrap()).unwrap();
        (dir, TokenLedger::new(pool))
    }

    fn receipt(id: &str, tokens: i64) -> ProviderReceipt {
        ProviderReceipt {
            payment_id: id.to_string(),
            provider: "test".to_string(),
            amount_cents: tokens * *quota::TOKEN_PRICE,
            tokens,
        }
    }

    #[test]
    fn test_free_counter_counts_down_to_refusal() {
        let (_dir, ledger) = test_ledger();

        for expected in (0..*quota::FREE_DOWNLOADS).rev() {
            let outcome = ledger.consume_at(1, NOW).unwrap();
            assert_eq!(outcome, SpendOutcome::Free { remaining: expected });
        }

        // Counter at zero, no paid tokens: every further attempt refuses
        // with the same reset deadline.
        let resets_at = NOW + quota::RESET_WINDOW_SECS as i64;
        assert_eq!(ledger.consume_at(1, NOW).unwrap(), SpendOutcome::Exhausted { resets_at });
        assert_eq!(ledger.consume_at(1, NOW + 10).unwrap(), SpendOutcome::Exhausted { resets_at });
    }

    #[test]
    fn test_free_counter_refills_after_window() {
        let (_dir, ledger) = test_ledger();

        for _ in 0..*quota::FREE_DOWNLOADS {
            ledger.consume_at(5, NOW).unwrap();
        }
        assert!(matches!(ledger.consume_at(5, NOW).unwrap(), SpendOutcome::Exhausted { .. }));

        // One second past the deadline the window restarts at the ceiling
        let later = NOW + quota::RESET_WINDOW_SECS as i64;
        assert_eq!(
            ledger.consume_at(5, later).unwrap(),
            SpendOutcome::Free { remaining: *quota::FREE_DOWNLOADS - 1 }
        );
    }

    #[test]
    fn test_free_spent_before_paid() {
        let (_dir, ledger) = test_ledger();

        ledger.redeem(2, &receipt("pay-1", 3)).unwrap();

        // All free tokens drain first even though paid tokens sit there
        for _ in 0..*quota::FREE_DOWNLOADS {
            assert!(matches!(ledger.consume_at(2, NOW).unwrap(), SpendOutcome::Free { .. }));
        }

        assert_eq!(ledger.consume_at(2, NOW).unwrap(), SpendOutcome::Paid { remaining: 2 });
        assert_eq!(ledger.consume_at(2, NOW).unwrap(), SpendOutcome::Paid { remaining: 1 });
        assert_eq!(ledger.consume_at(2, NOW).unwrap(), SpendOutcome::Paid { remaining: 0 });
        assert!(matches!(ledger.consume_at(2, NOW).unwrap(), SpendOutcome::Exhausted { .. }));
    }

    #[test]
    fn test_paid_tokens_survive_window_reset() {
        let (_dir, ledger) = test_ledger();

        ledger.redeem(3, &receipt("pay-2", 2)).unwrap();
        for _ in 0..*quota::FREE_DOWNLOADS {
            ledger.consume_at(3, NOW).unwrap();
        }
        assert!(matches!(ledger.consume_at(3, NOW).unwrap(), SpendOutcome::Paid { .. }));

        // After the reset the fresh free window is preferred again and the
        // last paid token stays untouched.
        let later = NOW + quota::RESET_WINDOW_SECS as i64 + 1;
        assert!(matches!(ledger.consume_at(3, later).unwrap(), SpendOutcome::Free { .. }));
        assert_eq!(ledger.status_at(3, later).unwrap().paid_balance, 1);
    }

    #[test]
    fn test_redeem_is_at_most_once() {
        let (_dir, ledger) = test_ledger();

        let outcome = ledger.redeem(4, &receipt("pay-3", 5)).unwrap();
        assert_eq!(outcome, RedeemOutcome::Credited { tokens: 5, paid_balance: 5 });

        // Same payment_id again: rejected, balance unchanged
        let outcome = ledger.redeem(4, &receipt("pay-3", 5)).unwrap();
        assert_eq!(outcome, RedeemOutcome::AlreadyRedeemed);
        assert_eq!(ledger.status_at(4, NOW).unwrap().paid_balance, 5);

        // Even from a different chat
        let outcome = ledger.redeem(99, &receipt("pay-3", 5)).unwrap();
        assert_eq!(outcome, RedeemOutcome::AlreadyRedeemed);
        assert_eq!(ledger.status_at(99, NOW).unwrap().paid_balance, 0);
    }

    #[test]
    fn test_redeem_rejects_zero_tokens() {
        let (_dir, ledger) = test_ledger();
        assert!(ledger.redeem(6, &receipt("pay-4", 0)).is_err());
        assert_eq!(ledger.status_at(6, NOW).unwrap().paid_balance, 0);
    }

    #[test]
    fn test_vip_ceiling_multiplier() {
        let (_dir, ledger) = test_ledger();
        let conn = get_connection(&ledger.pool).unwrap();
        crate::storage::db::ensure_user(&conn, 7, None).unwrap();
        crate::storage::db::set_user_plan(&conn, 7, "vip").unwrap();
        drop(conn);

        let status = ledger.status_at(7, NOW).unwrap();
        assert_eq!(status.free_ceiling, *quota::FREE_DOWNLOADS * *quota::VIP_MULTIPLIER);
        assert_eq!(status.free_remaining, status.free_ceiling);

        let outcome = ledger.consume_at(7, NOW).unwrap();
        assert_eq!(
            outcome,
            SpendOutcome::Free { remaining: *quota::FREE_DOWNLOADS * *quota::VIP_MULTIPLIER - 1 }
        );
    }

    #[test]
    fn test_status_is_read_only() {
        let (_dir, ledger) = test_ledger();

        let status = ledger.status_at(8, NOW).unwrap();
        assert_eq!(status.free_remaining, *quota::FREE_DOWNLOADS);

        // Reading repeatedly never burns tokens
        let status = ledger.status_at(8, NOW).unwrap();
        assert_eq!(status.free_remaining, *quota::FREE_DOWNLOADS);
        assert_eq!(status.paid_balance, 0);
        assert_eq!(status.plan, "free");
    }

    #[test]
    fn test_oldest_paid_tokens_spend_first() {
        let (_dir, ledger) = test_ledger();

        ledger.redeem(9, &receipt("first", 1)).unwrap();
        ledger.redeem(9, &receipt("second", 1)).unwrap();

        for _ in 0..*quota::FREE_DOWNLOADS {
            ledger.consume_at(9, NOW).unwrap();
        }
        ledger.consume_at(9, NOW).unwrap();

        // The older purchase is the one drained
        let conn = get_connection(&ledger.pool).unwrap();
        let first_left: i64 = conn
            .query_row(
                "SELECT tokens_left FROM payments WHERE payment_id = 'first'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        let second_left: i64 = conn
            .query_row(
                "SELECT tokens_left FROM payments WHERE payment_id = 'second'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(first_left, 0);
        assert_eq!(second_left, 1);
    }
}
