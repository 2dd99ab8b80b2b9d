//! Balance ledger
//!
//! Every balance change is written in the same batch as the transaction that
//! explains it. Bets are reserved as `pending` BET entries, then either
//! confirmed alongside a PAYOUT or marked `failed` when the session is
//! cancelled. Callers must hold the user's lock from `user_lock` across the
//! read, the staging and the commit.

use crate::common::traits::KvStore;
use crate::common::types::{
    SessionId, Transaction, TransactionStatus, TransactionType, User, UserId,
};
use crate::errors::{EngineError, EngineResult};
use crate::game_store;
use crate::locks::{acquire, LockTable};
use crate::storage::{retry_on_conflict, WriteSet};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Result of staging a settlement
#[derive(Debug, Clone)]
pub enum SettleOutcome {
    /// New PAYOUT staged; the updated user is included
    Applied { payout: Transaction, user: User },
    /// A PAYOUT already exists for the session; nothing was staged
    AlreadySettled(Transaction),
}

impl SettleOutcome {
    pub fn payout(&self) -> &Transaction {
        match self {
            SettleOutcome::Applied { payout, .. } => payout,
            SettleOutcome::AlreadySettled(payout) => payout,
        }
    }
}

/// Per-user ledger consistency check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub user_id: UserId,
    pub balance: u64,
    pub initial_balance: u64,
    pub confirmed_sum: i128,
    pub pending_sum: i128,
    pub pending_count: usize,
    pub failed_count: usize,
    /// `sum(confirmed) == balance - initial`; only expected with nothing pending
    pub strict: bool,
    /// `sum(confirmed) + sum(pending) == balance - initial`; always expected
    pub inclusive: bool,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.inclusive && (self.pending_count > 0 || self.strict)
    }
}

pub struct Ledger {
    store: Arc<dyn KvStore>,
    user_locks: LockTable<UserId>,
    conflict_retries: u32,
}

impl Ledger {
    pub fn new(store: Arc<dyn KvStore>, conflict_retries: u32) -> Self {
        Self {
            store,
            user_locks: LockTable::new(),
            conflict_retries,
        }
    }

    pub fn user_lock(&self, user_id: &UserId) -> Arc<Mutex<()>> {
        self.user_locks.handle(user_id)
    }

    pub fn prune_locks(&self) -> usize {
        self.user_locks.prune()
    }

    /// Register a user with a starting balance
    pub fn create_user(&self, username: &str, auth_ref: &str, initial_balance: u64) -> EngineResult<User> {
        let username = username.trim();
        if username.is_empty() {
            return Err(EngineError::InvalidAction("username cannot be empty".to_string()));
        }
        if game_store::find_user_by_name(self.store.as_ref(), username)?.is_some() {
            return Err(EngineError::UserExists(username.to_string()));
        }

        let user = User::new(username, auth_ref, initial_balance);
        let mut ws = WriteSet::new();
        game_store::stage_new_user(&mut ws, &user)?;
        match ws.commit(self.store.as_ref()) {
            Err(EngineError::LedgerConflict(_)) => Err(EngineError::UserExists(username.to_string())),
            Err(e) => Err(e),
            Ok(()) => {
                tracing::info!(user_id = %user.id, username, initial_balance, "user created");
                Ok(user)
            }
        }
    }

    pub fn get_user(&self, user_id: &UserId) -> EngineResult<User> {
        game_store::load_user(self.store.as_ref(), user_id)?.ok_or(EngineError::UserNotFound(*user_id))
    }

    pub fn find_user(&self, username: &str) -> EngineResult<Option<User>> {
        game_store::find_user_by_name(self.store.as_ref(), username)
    }

    pub fn users(&self) -> EngineResult<Vec<User>> {
        game_store::load_all_users(self.store.as_ref())
    }

    pub fn balance(&self, user_id: &UserId) -> EngineResult<u64> {
        Ok(self.get_user(user_id)?.balance)
    }

    /// Confirmed ADJUSTMENT: deposits (positive) and corrections (negative)
    pub fn adjust(&self, user_id: &UserId, amount: i64, reason: &str) -> EngineResult<(User, Transaction)> {
        if amount == 0 {
            return Err(EngineError::InvalidBet("adjustment amount cannot be zero".to_string()));
        }

        let lock = self.user_lock(user_id);
        let _guard = acquire(&lock);

        retry_on_conflict(self.conflict_retries, "adjust", || {
            let user = self.get_user(user_id)?;
            let balance = apply_delta(&user, amount)?;

            let mut updated = user.clone();
            updated.balance = balance;
            updated.version += 1;

            let tx = Transaction::new(
                user.id,
                None,
                TransactionType::Adjustment,
                amount,
                TransactionStatus::Confirmed,
                serde_json::json!({ "reason": reason }),
            );

            let mut ws = WriteSet::new();
            game_store::stage_user(&mut ws, &updated, user.version)?;
            game_store::stage_new_transaction(&mut ws, &tx)?;
            ws.commit(self.store.as_ref())?;

            tracing::info!(user_id = %user.id, amount, balance, reason, "balance adjusted");
            Ok((updated, tx))
        })
    }

    /// Stage the bet reservation: debit and a `pending` BET of `-amount`
    pub fn stage_reserve(
        &self,
        ws: &mut WriteSet,
        user: &User,
        session_id: SessionId,
        amount: u64,
        metadata: serde_json::Value,
    ) -> EngineResult<(User, Transaction)> {
        if amount == 0 {
            return Err(EngineError::InvalidBet("bet amount must be positive".to_string()));
        }
        let signed = to_signed(amount)?;
        if user.balance < amount {
            return Err(EngineError::InsufficientBalance {
                requested: amount,
                available: user.balance,
            });
        }

        let mut updated = user.clone();
        updated.balance -= amount;
        updated.version += 1;

        let bet = Transaction::new(
            user.id,
            Some(session_id),
            TransactionType::Bet,
            -signed,
            TransactionStatus::Pending,
            metadata,
        );

        game_store::stage_user(ws, &updated, user.version)?;
        game_store::stage_new_transaction(ws, &bet)?;
        tracing::debug!(user_id = %user.id, %session_id, amount, "bet reservation staged");
        Ok((updated, bet))
    }

    /// Stage settlement: confirm the BET, credit `payout` and write a confirmed
    /// PAYOUT. If the session already has a PAYOUT nothing is staged.
    pub fn stage_settle(
        &self,
        ws: &mut WriteSet,
        user: &User,
        session_id: SessionId,
        payout: u64,
        metadata: serde_json::Value,
    ) -> EngineResult<SettleOutcome> {
        if let Some(existing) =
            game_store::load_session_transaction(self.store.as_ref(), &session_id, TransactionType::Payout)?
        {
            return Ok(SettleOutcome::AlreadySettled(existing));
        }

        let bet = self.pending_bet(&session_id)?;
        let credit = to_signed(payout)?;

        let mut confirmed_bet = bet;
        confirmed_bet.status = TransactionStatus::Confirmed;

        let mut updated = user.clone();
        updated.balance = user.balance.checked_add(payout).ok_or_else(|| {
            EngineError::InvalidAction(format!("payout {} overflows balance of user {}", payout, user.id))
        })?;
        updated.version += 1;

        let payout_tx = Transaction::new(
            user.id,
            Some(session_id),
            TransactionType::Payout,
            credit,
            TransactionStatus::Confirmed,
            metadata,
        );

        game_store::stage_transaction_update(ws, &confirmed_bet)?;
        game_store::stage_new_transaction(ws, &payout_tx)?;
        game_store::stage_user(ws, &updated, user.version)?;
        tracing::debug!(user_id = %user.id, %session_id, payout, "settlement staged");

        Ok(SettleOutcome::Applied {
            payout: payout_tx,
            user: updated,
        })
    }

    /// Stage the reversal of a reservation: credit the bet back and mark the
    /// BET `failed`. Returns `None` when it was already reversed.
    pub fn stage_reverse(
        &self,
        ws: &mut WriteSet,
        user: &User,
        session_id: SessionId,
    ) -> EngineResult<Option<(User, Transaction)>> {
        let bet = game_store::load_session_transaction(self.store.as_ref(), &session_id, TransactionType::Bet)?
            .ok_or_else(|| EngineError::PersistenceFailure(format!("session {} has no BET", session_id)))?;

        match bet.status {
            TransactionStatus::Failed => return Ok(None),
            TransactionStatus::Confirmed => {
                return Err(EngineError::InvalidAction(format!(
                    "bet for session {} is already settled",
                    session_id
                )))
            }
            TransactionStatus::Pending => {}
        }

        let refund = bet.amount.unsigned_abs();
        let mut failed_bet = bet;
        failed_bet.status = TransactionStatus::Failed;

        let mut updated = user.clone();
        updated.balance = user.balance.saturating_add(refund);
        updated.version += 1;

        game_store::stage_transaction_update(ws, &failed_bet)?;
        game_store::stage_user(ws, &updated, user.version)?;
        tracing::debug!(user_id = %user.id, %session_id, refund, "reversal staged");
        Ok(Some((updated, failed_bet)))
    }

    fn pending_bet(&self, session_id: &SessionId) -> EngineResult<Transaction> {
        let bet = game_store::load_session_transaction(self.store.as_ref(), session_id, TransactionType::Bet)?
            .ok_or_else(|| EngineError::PersistenceFailure(format!("session {} has no BET", session_id)))?;
        if bet.status != TransactionStatus::Pending {
            return Err(EngineError::InvalidAction(format!(
                "bet for session {} is {:?}, not pending",
                session_id, bet.status
            )));
        }
        Ok(bet)
    }

    /// A user's full history, oldest first
    pub fn transactions(&self, user_id: &UserId) -> EngineResult<Vec<Transaction>> {
        self.get_user(user_id)?;
        game_store::load_user_transactions(self.store.as_ref(), user_id)
    }

    pub fn transactions_page(
        &self,
        user_id: &UserId,
        cursor: Option<&str>,
        limit: usize,
    ) -> EngineResult<(Vec<Transaction>, Option<String>)> {
        self.get_user(user_id)?;
        game_store::load_user_transactions_page(self.store.as_ref(), user_id, cursor, limit)
    }

    /// BET and PAYOUT of one session
    pub fn session_transactions(&self, session_id: &SessionId) -> EngineResult<Vec<Transaction>> {
        let mut txs = Vec::with_capacity(2);
        for tx_type in [TransactionType::Bet, TransactionType::Payout] {
            if let Some(tx) = game_store::load_session_transaction(self.store.as_ref(), session_id, tx_type)? {
                txs.push(tx);
            }
        }
        Ok(txs)
    }

    pub fn reconcile(&self, user_id: &UserId) -> EngineResult<ReconciliationReport> {
        let lock = self.user_lock(user_id);
        let _guard = acquire(&lock);

        let user = self.get_user(user_id)?;
        let txs = game_store::load_user_transactions(self.store.as_ref(), user_id)?;

        let mut confirmed_sum: i128 = 0;
        let mut pending_sum: i128 = 0;
        let mut pending_count = 0;
        let mut failed_count = 0;
        for tx in &txs {
            match tx.status {
                TransactionStatus::Confirmed => confirmed_sum += tx.amount as i128,
                TransactionStatus::Pending => {
                    pending_sum += tx.amount as i128;
                    pending_count += 1;
                }
                TransactionStatus::Failed => failed_count += 1,
            }
        }

        let net = user.net_change();
        let report = ReconciliationReport {
            user_id: user.id,
            balance: user.balance,
            initial_balance: user.initial_balance,
            confirmed_sum,
            pending_sum,
            pending_count,
            failed_count,
            strict: confirmed_sum == net,
            inclusive: confirmed_sum + pending_sum == net,
        };
        if !report.is_consistent() {
            tracing::warn!(user_id = %user.id, ?report, "ledger does not reconcile");
        }
        Ok(report)
    }
}

fn to_signed(amount: u64) -> EngineResult<i64> {
    i64::try_from(amount).map_err(|_| EngineError::InvalidBet(format!("amount {} is too large", amount)))
}

fn apply_delta(user: &User, amount: i64) -> EngineResult<u64> {
    if amount >= 0 {
        user.balance
            .checked_add(amount as u64)
            .ok_or_else(|| EngineError::InvalidAction(format!("adjustment {} overflows balance", amount)))
    } else {
        let debit = amount.unsigned_abs();
        user.balance.checked_sub(debit).ok_or(EngineError::InsufficientBalance {
            requested: debit,
            available: user.balance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use uuid::Uuid;

    fn ledger() -> (Arc<MemoryStorage>, Ledger) {
        let store = Arc::new(MemoryStorage::new());
        (store.clone(), Ledger::new(store, 3))
    }

    fn reserve(ledger: &Ledger, store: &MemoryStorage, user: &User, session_id: SessionId, amount: u64) -> User {
        let mut ws = WriteSet::new();
        let (user, _) = ledger
            .stage_reserve(&mut ws, user, session_id, amount, serde_json::Value::Null)
            .unwrap();
        ws.commit(store).unwrap();
        user
    }

    #[test]
    fn test_create_user_unique_name() {
        let (_store, ledger) = ledger();
        let user = ledger.create_user("alice", "ext:1", 1_000).unwrap();
        assert_eq!(user.balance, 1_000);
        assert!(matches!(
            ledger.create_user("alice", "ext:2", 5),
            Err(EngineError::UserExists(_))
        ));
        assert_eq!(ledger.find_user("ALICE").unwrap().map(|u| u.id), Some(user.id));
        assert_eq!(ledger.users().unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_user() {
        let (_store, ledger) = ledger();
        assert!(matches!(
            ledger.get_user(&Uuid::new_v4()),
            Err(EngineError::UserNotFound(_))
        ));
    }

    #[test]
    fn test_adjust_never_goes_negative() {
        let (_store, ledger) = ledger();
        let user = ledger.create_user("bob", "ext:bob", 100).unwrap();

        let (user, tx) = ledger.adjust(&user.id, 50, "deposit").unwrap();
        assert_eq!(user.balance, 150);
        assert_eq!(tx.status, TransactionStatus::Confirmed);

        let err = ledger.adjust(&user.id, -151, "correction").unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance { requested: 151, available: 150 }));
        assert!(matches!(ledger.adjust(&user.id, 0, "noop"), Err(EngineError::InvalidBet(_))));

        let report = ledger.reconcile(&user.id).unwrap();
        assert!(report.strict && report.inclusive);
        assert_eq!(report.confirmed_sum, 50);
    }

    #[test]
    fn test_reserve_rejects_overdraw() {
        let (_store, ledger) = ledger();
        let user = ledger.create_user("carol", "ext:carol", 100).unwrap();
        let mut ws = WriteSet::new();
        let err = ledger
            .stage_reserve(&mut ws, &user, Uuid::new_v4(), 101, serde_json::Value::Null)
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance { requested: 101, available: 100 }));
        assert!(ws.is_empty());
    }

    #[test]
    fn test_reserve_then_settle_reconciles() {
        let (store, ledger) = ledger();
        let user = ledger.create_user("dave", "ext:dave", 1_000).unwrap();
        let session_id = Uuid::new_v4();
        let user = reserve(&ledger, &store, &user, session_id, 100);

        let pending = ledger.reconcile(&user.id).unwrap();
        assert!(pending.inclusive);
        assert!(!pending.strict);
        assert_eq!(pending.pending_count, 1);

        let mut ws = WriteSet::new();
        let outcome = ledger
            .stage_settle(&mut ws, &user, session_id, 198, serde_json::Value::Null)
            .unwrap();
        assert!(matches!(outcome, SettleOutcome::Applied { .. }));
        ws.commit(store.as_ref()).unwrap();

        assert_eq!(ledger.balance(&user.id).unwrap(), 1_098);
        let report = ledger.reconcile(&user.id).unwrap();
        assert!(report.strict && report.inclusive);
        assert_eq!(report.confirmed_sum, 98);

        // Settling again stages nothing and returns the same payout
        let user = ledger.get_user(&user.id).unwrap();
        let mut ws = WriteSet::new();
        let again = ledger
            .stage_settle(&mut ws, &user, session_id, 198, serde_json::Value::Null)
            .unwrap();
        assert!(ws.is_empty());
        assert_eq!(again.payout().id, outcome.payout().id);
    }

    #[test]
    fn test_reverse_is_idempotent() {
        let (store, ledger) = ledger();
        let user = ledger.create_user("erin", "ext:erin", 500).unwrap();
        let session_id = Uuid::new_v4();
        let user = reserve(&ledger, &store, &user, session_id, 200);
        assert_eq!(user.balance, 300);

        let mut ws = WriteSet::new();
        let reversed = ledger.stage_reverse(&mut ws, &user, session_id).unwrap();
        assert!(reversed.is_some());
        ws.commit(store.as_ref()).unwrap();
        assert_eq!(ledger.balance(&user.id).unwrap(), 500);

        let user = ledger.get_user(&user.id).unwrap();
        let mut ws = WriteSet::new();
        assert!(ledger.stage_reverse(&mut ws, &user, session_id).unwrap().is_none());

        let report = ledger.reconcile(&user.id).unwrap();
        assert!(report.strict && report.inclusive);
        assert_eq!(report.failed_count, 1);
        assert_eq!(ledger.session_transactions(&session_id).unwrap().len(), 1);
    }

    #[test]
    fn test_stale_user_version_conflicts() {
        let (store, ledger) = ledger();
        let user = ledger.create_user("frank", "ext:frank", 500).unwrap();
        ledger.adjust(&user.id, 10, "deposit").unwrap();

        // `user` is the pre-deposit snapshot
        let mut ws = WriteSet::new();
        ledger
            .stage_reserve(&mut ws, &user, Uuid::new_v4(), 100, serde_json::Value::Null)
            .unwrap();
        assert!(matches!(ws.commit(store.as_ref()), Err(EngineError::LedgerConflict(_))));
        assert_eq!(ledger.balance(&user.id).unwrap(), 510);
    }
}
