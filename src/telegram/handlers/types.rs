//! Shared state and helpers threaded through the handler tree.

use std::sync::Arc;
use std::time::Instant;

use teloxide::types::Message;

use crate::download::link::CanonicalResolver;
use crate::download::progress::EditDebouncer;
use crate::download::queue::DownloadQueue;
use crate::download::source::SourceRegistry;
use crate::payment::ledger::TokenLedger;
use crate::payment::provider::HttpPaymentProvider;
use crate::storage::cache::DeliveryCache;
use crate::storage::db::{self, DbPool, User};
use crate::storage::get_connection;
use crate::telegram::dispatch::UploadDispatcher;

/// Error type for handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Dependencies required by handlers
#[derive(Clone)]
pub struct HandlerDeps {
    pub db_pool: Arc<DbPool>,
    pub queue: Arc<DownloadQueue>,
    pub registry: Arc<SourceRegistry>,
    pub cache: DeliveryCache,
    pub ledger: TokenLedger,
    pub resolver: Arc<CanonicalResolver>,
    pub debouncer: Arc<EditDebouncer>,
    /// External payment provider for /redeem; None when unconfigured
    pub provider: Option<Arc<HttpPaymentProvider>>,
    pub dispatcher: UploadDispatcher,
    /// Process start, for /ping uptime
    pub started_at: Instant,
}

/// Loads the sender's user row, creating it on first contact.
///
/// The chat id doubles as the user id in private chats, which is the only
/// place this bot accepts work from.
pub fn fetch_user(deps: &HandlerDeps, msg: &Message) -> Result<User, HandlerError> {
    let conn = get_connection(&deps.db_pool)?;
    let chat_id = msg.chat.id.0;
    let username = msg.from.as_ref().and_then(|u| u.username.as_deref());
    db::ensure_user(&conn, chat_id, username)?;
    let user = db::get_user(&conn, chat_id)?.ok_or("user row missing right after ensure_user")?;
    Ok(user)
}
