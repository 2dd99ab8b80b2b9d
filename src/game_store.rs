//! Persistent records and secondary indexes.
//!
//! Every record is JSON under a typed key. Loads return `Ok(None)` for a
//! missing key and `PersistenceFailure` for a record that fails to decode.
//! `stage_*` functions only add to a `WriteSet`; nothing is written until the
//! caller commits it.

use crate::common::traits::KvStore;
use crate::common::types::{
    GameEvent, GameSession, OutcomeRecord, SeedRecord, SessionId, Transaction, TransactionType, User,
    UserId,
};
use crate::errors::{EngineError, EngineResult};
use crate::storage::WriteSet;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use uuid::Uuid;

const USER_PREFIX: &str = "user:";
const USERNAME_INDEX_PREFIX: &str = "idx:username:";
const SESSION_PREFIX: &str = "session:";
const TX_PREFIX: &str = "tx:";
const EVENT_PREFIX: &str = "event:";
const OUTCOME_PREFIX: &str = "outcome:";
const SEED_PREFIX: &str = "seed:";
const USER_TX_INDEX_PREFIX: &str = "idx:user_tx:";
const SESSION_TX_INDEX_PREFIX: &str = "idx:session_tx:";
const USER_SESSION_INDEX_PREFIX: &str = "idx:user_session:";
const PLAYING_INDEX_PREFIX: &str = "idx:playing:";
const SEED_HASH_INDEX_PREFIX: &str = "idx:seed_hash:";
const CREATE_KEY_INDEX_PREFIX: &str = "idx:create:";

/// Upper bound on rows read by full per-owner scans
const SCAN_ALL: usize = usize::MAX;

pub fn user_key(id: &UserId) -> Vec<u8> {
    format!("{}{}", USER_PREFIX, id).into_bytes()
}

pub fn username_key(username: &str) -> Vec<u8> {
    format!("{}{}", USERNAME_INDEX_PREFIX, username.to_lowercase()).into_bytes()
}

pub fn session_key(id: &SessionId) -> Vec<u8> {
    format!("{}{}", SESSION_PREFIX, id).into_bytes()
}

pub fn tx_key(id: &Uuid) -> Vec<u8> {
    format!("{}{}", TX_PREFIX, id).into_bytes()
}

pub fn seed_key(session_id: &SessionId) -> Vec<u8> {
    format!("{}{}", SEED_PREFIX, session_id).into_bytes()
}

pub fn seed_hash_key(hash: &str) -> Vec<u8> {
    format!("{}{}", SEED_HASH_INDEX_PREFIX, hash).into_bytes()
}

/// Client idempotency keys are scoped to the user that sent them
pub fn create_key_key(user_id: &UserId, idempotency_key: &str) -> Vec<u8> {
    format!("{}{}:{}", CREATE_KEY_INDEX_PREFIX, user_id, idempotency_key).into_bytes()
}

fn event_prefix(session_id: &SessionId) -> Vec<u8> {
    format!("{}{}:", EVENT_PREFIX, session_id).into_bytes()
}

pub fn event_key(session_id: &SessionId, sequence: u64) -> Vec<u8> {
    format!("{}{}:{:010}", EVENT_PREFIX, session_id, sequence).into_bytes()
}

fn outcome_prefix(session_id: &SessionId) -> Vec<u8> {
    format!("{}{}:", OUTCOME_PREFIX, session_id).into_bytes()
}

/// Unique per `(session, nonce)`; a second write for the same pair is refused
pub fn outcome_key(session_id: &SessionId, nonce: u64) -> Vec<u8> {
    format!("{}{}:{:020}", OUTCOME_PREFIX, session_id, nonce).into_bytes()
}

fn user_tx_prefix(user_id: &UserId) -> Vec<u8> {
    format!("{}{}:", USER_TX_INDEX_PREFIX, user_id).into_bytes()
}

fn user_tx_key(tx: &Transaction) -> Vec<u8> {
    format!(
        "{}{}:{:020}:{}",
        USER_TX_INDEX_PREFIX,
        tx.user_id,
        sort_micros(&tx.created_at),
        tx.id
    )
    .into_bytes()
}

/// At most one BET and one PAYOUT per session
pub fn session_tx_key(session_id: &SessionId, tx_type: TransactionType) -> Vec<u8> {
    format!("{}{}:{}", SESSION_TX_INDEX_PREFIX, session_id, tx_type).into_bytes()
}

fn user_session_prefix(user_id: &UserId) -> Vec<u8> {
    format!("{}{}:", USER_SESSION_INDEX_PREFIX, user_id).into_bytes()
}

fn user_session_key(session: &GameSession) -> Vec<u8> {
    format!(
        "{}{}:{:020}:{}",
        USER_SESSION_INDEX_PREFIX,
        session.user_id,
        sort_micros(&session.created_at),
        session.id
    )
    .into_bytes()
}

pub fn playing_key(session_id: &SessionId) -> Vec<u8> {
    format!("{}{}", PLAYING_INDEX_PREFIX, session_id).into_bytes()
}

fn sort_micros(at: &DateTime<Utc>) -> u64 {
    at.timestamp_micros().max(0) as u64
}

fn decode<T: DeserializeOwned>(key: &[u8], bytes: &[u8]) -> EngineResult<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        EngineError::PersistenceFailure(format!(
            "Failed to decode {}: {}",
            String::from_utf8_lossy(key),
            e
        ))
    })
}

pub fn get_json<T: DeserializeOwned>(store: &dyn KvStore, key: &[u8]) -> EngineResult<Option<T>> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(decode(key, &bytes)?)),
        None => Ok(None),
    }
}

fn scan_json<T: DeserializeOwned>(store: &dyn KvStore, prefix: &[u8]) -> EngineResult<Vec<T>> {
    store
        .scan_prefix(prefix, None, SCAN_ALL)?
        .into_iter()
        .map(|(key, value)| decode(&key, &value))
        .collect()
}

/// Index rows store the id of the record they point at
fn parse_index_id(key: &[u8], value: &[u8]) -> EngineResult<Uuid> {
    decode(key, value)
}

fn decode_cursor(cursor_hex: Option<&str>) -> EngineResult<Option<Vec<u8>>> {
    cursor_hex
        .map(|c| {
            hex::decode(c).map_err(|e| EngineError::InvalidAction(format!("Invalid cursor hex: {}", e)))
        })
        .transpose()
}

// ============================================================================
// Users
// ============================================================================

pub fn load_user(store: &dyn KvStore, id: &UserId) -> EngineResult<Option<User>> {
    get_json(store, &user_key(id))
}

pub fn find_user_by_name(store: &dyn KvStore, username: &str) -> EngineResult<Option<User>> {
    let key = username_key(username);
    match store.get(&key)? {
        Some(value) => {
            let id = parse_index_id(&key, &value)?;
            load_user(store, &id)
        }
        None => Ok(None),
    }
}

/// Every user, in key order
pub fn load_all_users(store: &dyn KvStore) -> EngineResult<Vec<User>> {
    scan_json(store, USER_PREFIX.as_bytes())
}

/// Stage a brand-new user together with its unique username index
pub fn stage_new_user(ws: &mut WriteSet, user: &User) -> EngineResult<()> {
    ws.expect_absent(username_key(&user.username));
    ws.expect_absent(user_key(&user.id));
    ws.put_json(user_key(&user.id), user)?;
    ws.put_json(username_key(&user.username), &user.id)?;
    Ok(())
}

/// Stage an updated user, guarded on the version it was read at
pub fn stage_user(ws: &mut WriteSet, user: &User, read_version: u64) -> EngineResult<()> {
    ws.expect_version(user_key(&user.id), Some(read_version));
    ws.put_json(user_key(&user.id), user)
}

// ============================================================================
// Sessions
// ============================================================================

pub fn load_session(store: &dyn KvStore, id: &SessionId) -> EngineResult<Option<GameSession>> {
    get_json(store, &session_key(id))
}

/// Session already opened by `user_id` under `idempotency_key`
pub fn find_session_by_create_key(
    store: &dyn KvStore,
    user_id: &UserId,
    idempotency_key: &str,
) -> EngineResult<Option<GameSession>> {
    let key = create_key_key(user_id, idempotency_key);
    match store.get(&key)? {
        Some(value) => {
            let id = parse_index_id(&key, &value)?;
            load_session(store, &id)
        }
        None => Ok(None),
    }
}

/// Bind an idempotency key to a new session; fails the batch if already bound
pub fn stage_create_key(ws: &mut WriteSet, user_id: &UserId, idempotency_key: &str, session_id: &SessionId) -> EngineResult<()> {
    let key = create_key_key(user_id, idempotency_key);
    ws.expect_absent(key.clone());
    ws.put_json(key, session_id)
}

/// Stage a session write. `read_version` is `None` for a new session.
/// Keeps the playing index in step with the status.
pub fn stage_session(ws: &mut WriteSet, session: &GameSession, read_version: Option<u64>) -> EngineResult<()> {
    ws.expect_version(session_key(&session.id), read_version);
    ws.put_json(session_key(&session.id), session)?;

    if read_version.is_none() {
        ws.put_json(user_session_key(session), &session.id)?;
    }
    if session.is_playing() {
        ws.put_json(playing_key(&session.id), &session.user_id)?;
    } else {
        ws.delete(playing_key(&session.id));
    }
    Ok(())
}

/// Ids of every session currently `playing`
pub fn playing_session_ids(store: &dyn KvStore) -> EngineResult<Vec<SessionId>> {
    let prefix = PLAYING_INDEX_PREFIX.as_bytes();
    store
        .scan_prefix(prefix, None, SCAN_ALL)?
        .into_iter()
        .map(|(key, _)| {
            let tail = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            Uuid::parse_str(&tail).map_err(|e| {
                EngineError::PersistenceFailure(format!("Bad playing index key {}: {}", tail, e))
            })
        })
        .collect()
}

/// A user's sessions, oldest first, with a hex cursor for the next page
pub fn load_user_sessions(
    store: &dyn KvStore,
    user_id: &UserId,
    cursor_hex: Option<&str>,
    limit: usize,
) -> EngineResult<(Vec<GameSession>, Option<String>)> {
    let cursor = decode_cursor(cursor_hex)?;
    let rows = store.scan_prefix(&user_session_prefix(user_id), cursor.as_deref(), limit.max(1))?;
    let full_page = rows.len() >= limit.max(1);

    let mut sessions = Vec::with_capacity(rows.len());
    let mut next_cursor = None;
    for (key, value) in rows {
        let id = parse_index_id(&key, &value)?;
        if let Some(session) = load_session(store, &id)? {
            sessions.push(session);
        }
        next_cursor = Some(hex::encode(&key));
    }
    Ok((sessions, if full_page { next_cursor } else { None }))
}

// ============================================================================
// Transactions
// ============================================================================

pub fn load_transaction(store: &dyn KvStore, id: &Uuid) -> EngineResult<Option<Transaction>> {
    get_json(store, &tx_key(id))
}

/// The session's BET or PAYOUT, if one was written
pub fn load_session_transaction(
    store: &dyn KvStore,
    session_id: &SessionId,
    tx_type: TransactionType,
) -> EngineResult<Option<Transaction>> {
    let key = session_tx_key(session_id, tx_type);
    match store.get(&key)? {
        Some(value) => {
            let id = parse_index_id(&key, &value)?;
            load_transaction(store, &id)
        }
        None => Ok(None),
    }
}

/// Stage a new ledger entry plus its indexes. A second BET or PAYOUT for the
/// same session fails the whole batch.
pub fn stage_new_transaction(ws: &mut WriteSet, tx: &Transaction) -> EngineResult<()> {
    ws.expect_absent(tx_key(&tx.id));
    ws.put_json(tx_key(&tx.id), tx)?;
    ws.put_json(user_tx_key(tx), &tx.id)?;

    if let Some(session_id) = tx.game_session_id {
        let index = session_tx_key(&session_id, tx.tx_type);
        ws.expect_absent(index.clone());
        ws.put_json(index, &tx.id)?;
    }
    Ok(())
}

/// Stage a status change on an existing entry
pub fn stage_transaction_update(ws: &mut WriteSet, tx: &Transaction) -> EngineResult<()> {
    ws.put_json(tx_key(&tx.id), tx)
}

/// All of a user's transactions, oldest first
pub fn load_user_transactions(store: &dyn KvStore, user_id: &UserId) -> EngineResult<Vec<Transaction>> {
    let (txs, _) = load_user_transactions_page(store, user_id, None, SCAN_ALL)?;
    Ok(txs)
}

pub fn load_user_transactions_page(
    store: &dyn KvStore,
    user_id: &UserId,
    cursor_hex: Option<&str>,
    limit: usize,
) -> EngineResult<(Vec<Transaction>, Option<String>)> {
    let cursor = decode_cursor(cursor_hex)?;
    let limit = limit.max(1);
    let rows = store.scan_prefix(&user_tx_prefix(user_id), cursor.as_deref(), limit)?;
    let full_page = rows.len() >= limit;

    let mut txs = Vec::with_capacity(rows.len());
    let mut next_cursor = None;
    for (key, value) in rows {
        let id = parse_index_id(&key, &value)?;
        match load_transaction(store, &id)? {
            Some(tx) => txs.push(tx),
            None => tracing::warn!(tx_id = %id, "user index points at a missing transaction"),
        }
        next_cursor = Some(hex::encode(&key));
    }
    Ok((txs, if full_page { next_cursor } else { None }))
}

// ============================================================================
// Events and outcomes
// ============================================================================

pub fn load_events(store: &dyn KvStore, session_id: &SessionId) -> EngineResult<Vec<GameEvent>> {
    scan_json(store, &event_prefix(session_id))
}

pub fn count_events(store: &dyn KvStore, session_id: &SessionId) -> EngineResult<u64> {
    Ok(store.scan_prefix(&event_prefix(session_id), None, SCAN_ALL)?.len() as u64)
}

pub fn stage_event(ws: &mut WriteSet, event: &GameEvent) -> EngineResult<()> {
    let key = event_key(&event.game_session_id, event.sequence);
    ws.expect_absent(key.clone());
    ws.put_json(key, event)
}

pub fn load_outcomes(store: &dyn KvStore, session_id: &SessionId) -> EngineResult<Vec<OutcomeRecord>> {
    scan_json(store, &outcome_prefix(session_id))
}

pub fn load_outcome(store: &dyn KvStore, session_id: &SessionId, nonce: u64) -> EngineResult<Option<OutcomeRecord>> {
    get_json(store, &outcome_key(session_id, nonce))
}

/// The `(session, nonce)` key must not exist yet
pub fn stage_outcome(ws: &mut WriteSet, record: &OutcomeRecord) -> EngineResult<()> {
    let key = outcome_key(&record.session_id, record.nonce);
    ws.expect_absent(key.clone());
    ws.put_json(key, record)
}

// ============================================================================
// Seeds
// ============================================================================

pub fn load_seed(store: &dyn KvStore, session_id: &SessionId) -> EngineResult<Option<SeedRecord>> {
    get_json(store, &seed_key(session_id))
}

/// Session bound to a seed hash, if any
pub fn find_seed_hash(store: &dyn KvStore, hash: &str) -> EngineResult<Option<SessionId>> {
    let key = seed_hash_key(hash);
    match store.get(&key)? {
        Some(value) => Ok(Some(parse_index_id(&key, &value)?)),
        None => Ok(None),
    }
}

pub fn stage_seed(ws: &mut WriteSet, seed: &SeedRecord) -> EngineResult<()> {
    ws.expect_absent(seed_key(&seed.session_id));
    ws.expect_absent(seed_hash_key(&seed.server_seed_hash));
    ws.put_json(seed_key(&seed.session_id), seed)?;
    ws.put_json(seed_hash_key(&seed.server_seed_hash), &seed.session_id)
}

pub fn stage_seed_removal(ws: &mut WriteSet, seed: &SeedRecord) {
    ws.delete(seed_key(&seed.session_id));
    ws.delete(seed_hash_key(&seed.server_seed_hash));
}
