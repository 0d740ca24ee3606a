//! Request execution
//!
//! [`Vault`] owns the shared state (users, sharded store, recency index,
//! quotas and the persistence log) and turns one decoded [`Request`] into one
//! [`Response`]. Request-level failures come back as a [`Status`]; an `Err`
//! from [`Vault::execute`] means the log could not be written and the server
//! must stop.
//!
//! Lock order is auth table, then store shards, then the log. The recency
//! index and quota table are only ever locked innermost.

use crate::auth::{AuthTable, User};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::mru::MruIndex;
use crate::protocol::{listing, Command, Request, Response, Status};
use crate::quota::{Demand, QuotaDenied, QuotaEnforcer, QuotaLimits};
use crate::store::ShardedStore;
use crate::wal::{LogRecord, PersistenceLog};
use bytes::Bytes;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// What [`Vault::open`] found on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No log file existed; starting empty
    Fresh,
    /// The log was replayed
    Loaded { records: usize },
}

/// Shared server state
pub struct Vault {
    auth: AuthTable,
    store: ShardedStore,
    mru: MruIndex,
    quota: QuotaEnforcer,
    log: PersistenceLog,
    max_value_size: usize,
}

impl Vault {
    /// Build the state for `config`, replaying the data file if it exists
    pub fn open(config: &ServerConfig) -> Result<(Self, LoadOutcome)> {
        let replayed = PersistenceLog::replay(&config.data_file, config.max_value_size)?;
        let log = PersistenceLog::open(&config.data_file)?;

        let vault = Self {
            auth: AuthTable::new(),
            store: ShardedStore::new(config.shards),
            mru: MruIndex::new(config.mru_capacity),
            quota: QuotaEnforcer::new(QuotaLimits {
                interval: config.quota_interval(),
                requests: config.request_quota,
                upload: config.upload_quota,
                download: config.download_quota,
            }),
            log,
            max_value_size: config.max_value_size,
        };

        let outcome = match replayed {
            None => {
                info!("File not found: {}", config.data_file.display());
                LoadOutcome::Fresh
            }
            Some(records) => {
                let count = records.len();
                vault.restore(records);
                info!("Loaded: {}", config.data_file.display());
                LoadOutcome::Loaded { records: count }
            }
        };
        Ok((vault, outcome))
    }

    /// Rebuild in-memory state from log records, oldest first
    fn restore(&self, records: Vec<LogRecord>) {
        // Position of the last insert/update for each live key
        let mut last_write: HashMap<String, usize> = HashMap::new();

        for (seq, record) in records.into_iter().enumerate() {
            match record {
                LogRecord::Register {
                    name,
                    salt,
                    pass_hash,
                    content,
                } => self.auth.restore(User {
                    name,
                    salt,
                    pass_hash,
                    content,
                }),
                LogRecord::Content { name, content } => {
                    if !self.auth.restore_content(&name, content) {
                        warn!(user = %name, "Content record for unknown user ignored");
                    }
                }
                LogRecord::Insert { key, value } | LogRecord::Update { key, value } => {
                    last_write.insert(key.clone(), seq);
                    self.store.restore(key, value);
                }
                LogRecord::Delete { key } => {
                    last_write.remove(&key);
                    self.store.discard(&key);
                }
            }
        }

        let mut live: Vec<(String, usize)> = last_write.into_iter().collect();
        live.sort_by_key(|(_, seq)| *seq);

        let excess = live.len().saturating_sub(self.mru.capacity());
        if excess > 0 {
            warn!(
                dropped = excess,
                capacity = self.mru.capacity(),
                "More live keys than the MRU capacity, dropping the least recent"
            );
            for (key, _) in live.drain(..excess) {
                self.store.discard(&key);
            }
        }
        for (key, _) in &live {
            self.mru.touch(key);
        }
        debug!(
            users = self.auth.len(),
            keys = self.store.len(),
            "State restored"
        );
    }

    /// Execute one request
    pub fn execute(&self, request: &Request) -> Result<Response> {
        let user = request.user.as_str();

        if let Command::Register = request.command {
            return self.register(user, &request.password);
        }
        if !self.auth.authenticate(user, &request.password) {
            debug!(user, "Authentication failed");
            return Ok(Response::status(Status::ErrLogin));
        }

        match &request.command {
            Command::Register => self.register(user, &request.password),
            Command::Shutdown => {
                info!(user, "Shutdown requested");
                Ok(Response::status(Status::Ok))
            }
            Command::Persist => self.persist(user),
            Command::SetContent { content } => self.set_content(user, content),
            Command::GetContent { who } => self.get_content(user, who),
            Command::AllUsers => self.gated_listing(user, self.auth.names()),
            Command::Insert { key, value } => self.insert(user, key, value),
            Command::Get { key } => self.get(user, key),
            Command::Delete { key } => self.delete(user, key),
            Command::Upsert { key, value } => self.upsert(user, key, value),
            Command::AllKeys => self.gated_listing(user, self.store.keys()),
            Command::TopKeys => self.gated_listing(user, self.mru.ranking()),
        }
    }

    /// Quota check; `Some` carries the rejection to send back
    fn quota_denied(&self, user: &str, demand: Demand) -> Option<Response> {
        match self.quota.admit(user, demand) {
            Ok(()) => None,
            Err(denied) => {
                debug!(user, ?denied, "Quota exceeded");
                Some(Response::status(denied.into()))
            }
        }
    }

    fn oversized(&self, value: &[u8]) -> bool {
        value.len() > self.max_value_size
    }

    fn register(&self, user: &str, password: &str) -> Result<Response> {
        let created = self.auth.register_with(user, password, |new_user| {
            self.log.append(&LogRecord::from_user(new_user))
        })?;
        if created {
            info!(user, "Registered user");
            Ok(Response::status(Status::Ok))
        } else {
            Ok(Response::status(Status::ErrUserExists))
        }
    }

    fn persist(&self, user: &str) -> Result<Response> {
        if let Some(denied) = self.quota_denied(user, Demand::none()) {
            return Ok(denied);
        }
        self.auth.with_users(|users| {
            self.store.with_entries(|entries| {
                let records = users.map(LogRecord::from_user).chain(entries.map(|(key, value)| {
                    LogRecord::Insert {
                        key: key.clone(),
                        value: value.clone(),
                    }
                }));
                self.log.compact(records)
            })
        })?;
        Ok(Response::status(Status::Ok))
    }

    fn set_content(&self, user: &str, content: &Bytes) -> Result<Response> {
        if self.oversized(content) {
            return Ok(Response::status(Status::ErrReqFmt));
        }
        if let Some(denied) = self.quota_denied(user, Demand::upload(content.len())) {
            return Ok(denied);
        }
        self.auth
            .set_content_with(user, content.clone(), |name, content| {
                self.log.append(&LogRecord::Content {
                    name: name.to_string(),
                    content: Bytes::copy_from_slice(content),
                })
            })?;
        Ok(Response::status(Status::Ok))
    }

    fn get_content(&self, user: &str, who: &str) -> Result<Response> {
        let content = self.auth.content(who).filter(|c| !c.is_empty());
        let size = content.as_ref().map_or(0, |c| c.len());
        if let Some(denied) = self.quota_denied(user, Demand::download(size)) {
            return Ok(denied);
        }
        Ok(match content {
            Some(content) => Response::with_payload(Status::Ok, content),
            None => Response::status(Status::ErrNoData),
        })
    }

    fn gated_listing(&self, user: &str, entries: Vec<String>) -> Result<Response> {
        let payload = listing(&entries);
        if let Some(denied) = self.quota_denied(user, Demand::download(payload.len())) {
            return Ok(denied);
        }
        if entries.is_empty() {
            return Ok(Response::status(Status::ErrNoData));
        }
        Ok(Response::with_payload(Status::Ok, payload))
    }

    fn insert(&self, user: &str, key: &str, value: &Bytes) -> Result<Response> {
        if self.oversized(value) {
            return Ok(Response::status(Status::ErrReqFmt));
        }
        if let Some(denied) = self.quota_denied(user, Demand::upload(value.len())) {
            return Ok(denied);
        }
        let inserted = self.store.insert_with(key, value.clone(), |key, value| {
            self.log.append(&LogRecord::Insert {
                key: key.to_string(),
                value: value.clone(),
            })?;
            Ok(self.mru.touch(key))
        })?;
        match inserted {
            Some(evicted) => {
                self.evict(evicted)?;
                Ok(Response::status(Status::Ok))
            }
            None => Ok(Response::status(Status::ErrKey)),
        }
    }

    fn get(&self, user: &str, key: &str) -> Result<Response> {
        let outcome: std::result::Result<_, QuotaDenied> = self.store.read_with(key, |value| {
            let size = value.map_or(0, |v| v.len());
            self.quota.admit(user, Demand::download(size))?;
            Ok(value.map(|v| (v.clone(), self.mru.touch(key))))
        });
        match outcome {
            Err(denied) => {
                debug!(user, ?denied, "Quota exceeded");
                Ok(Response::status(denied.into()))
            }
            Ok(None) => Ok(Response::status(Status::ErrKey)),
            Ok(Some((value, evicted))) => {
                self.evict(evicted)?;
                Ok(Response::with_payload(Status::Ok, value))
            }
        }
    }

    fn delete(&self, user: &str, key: &str) -> Result<Response> {
        if let Some(denied) = self.quota_denied(user, Demand::none()) {
            return Ok(denied);
        }
        let removed = self.store.remove_with(key, |_| {
            self.log.append(&LogRecord::Delete {
                key: key.to_string(),
            })?;
            self.mru.remove(key);
            Ok(true)
        })?;
        Ok(Response::status(if removed {
            Status::Ok
        } else {
            Status::ErrKey
        }))
    }

    fn upsert(&self, user: &str, key: &str, value: &Bytes) -> Result<Response> {
        if self.oversized(value) {
            return Ok(Response::status(Status::ErrReqFmt));
        }
        if let Some(denied) = self.quota_denied(user, Demand::upload(value.len())) {
            return Ok(denied);
        }
        let (existed, evicted) = self.store.upsert_with(key, value.clone(), |key, value, existed| {
            let record = if existed {
                LogRecord::Update {
                    key: key.to_string(),
                    value: value.clone(),
                }
            } else {
                LogRecord::Insert {
                    key: key.to_string(),
                    value: value.clone(),
                }
            };
            self.log.append(&record)?;
            Ok((existed, self.mru.touch(key)))
        })?;
        self.evict(evicted)?;
        Ok(Response::status(if existed {
            Status::OkUpdate
        } else {
            Status::OkInsert
        }))
    }

    /// Drop a key pushed out of the recency index, unless something touched
    /// it again before we got its shard lock
    fn evict(&self, evicted: Option<String>) -> Result<()> {
        let Some(victim) = evicted else {
            return Ok(());
        };
        let removed = self.store.remove_with(&victim, |_| {
            if self.mru.contains(&victim) {
                return Ok(false);
            }
            self.log.append(&LogRecord::Delete {
                key: victim.clone(),
            })?;
            Ok(true)
        })?;
        if removed {
            debug!(key = %victim, "Evicted least recently used key");
        }
        Ok(())
    }

    /// Flush the log to disk
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    pub fn user_count(&self) -> usize {
        self.auth.len()
    }

    pub fn key_count(&self) -> usize {
        self.store.len()
    }

    pub fn shard_count(&self) -> usize {
        self.store.shard_count()
    }

    pub fn log_size(&self) -> Result<u64> {
        self.log.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_listing;
    use std::time::Duration;
    use tempfile::TempDir;

    const ALICE: (&str, &str) = ("alice", "alice_is_awesome");
    const BOB: (&str, &str) = ("bob", "bob_is_the_best");

    fn config(dir: &TempDir) -> ServerConfig {
        ServerConfig {
            data_file: dir.path().join("company.dir"),
            key_file: dir.path().join("rsa"),
            shards: 4,
            mru_capacity: 4,
            max_value_size: 64,
            ..ServerConfig::default()
        }
    }

    fn run(vault: &Vault, who: (&str, &str), command: Command) -> Response {
        vault
            .execute(&Request::new(who.0, who.1, command))
            .unwrap()
    }

    fn status(vault: &Vault, who: (&str, &str), command: Command) -> Status {
        run(vault, who, command).status
    }

    fn insert(key: &str, value: &[u8]) -> Command {
        Command::Insert {
            key: key.to_string(),
            value: Bytes::copy_from_slice(value),
        }
    }

    fn upsert(key: &str, value: &[u8]) -> Command {
        Command::Upsert {
            key: key.to_string(),
            value: Bytes::copy_from_slice(value),
        }
    }

    fn get(key: &str) -> Command {
        Command::Get {
            key: key.to_string(),
        }
    }

    fn top_keys(vault: &Vault) -> Vec<String> {
        match run(vault, ALICE, Command::TopKeys).payload {
            Some(payload) => parse_listing(&payload),
            None => Vec::new(),
        }
    }

    fn open(config: &ServerConfig) -> Vault {
        Vault::open(config).unwrap().0
    }

    #[test]
    fn test_register_and_login() {
        let dir = TempDir::new().unwrap();
        let (vault, outcome) = Vault::open(&config(&dir)).unwrap();
        assert_eq!(outcome, LoadOutcome::Fresh);

        assert_eq!(status(&vault, ALICE, Command::Register), Status::Ok);
        assert_eq!(status(&vault, ALICE, Command::Register), Status::ErrUserExists);
        assert_eq!(status(&vault, ALICE, Command::AllKeys), Status::ErrNoData);
        assert_eq!(status(&vault, BOB, Command::AllKeys), Status::ErrLogin);
        assert_eq!(
            status(&vault, ("alice", "wrong"), insert("k", b"v")),
            Status::ErrLogin
        );
        assert_eq!(vault.key_count(), 0);
    }

    #[test]
    fn test_key_operations() {
        let dir = TempDir::new().unwrap();
        let vault = open(&config(&dir));
        run(&vault, ALICE, Command::Register);

        assert_eq!(status(&vault, ALICE, insert("k1", b"v1")), Status::Ok);
        assert_eq!(status(&vault, ALICE, insert("k1", b"other")), Status::ErrKey);
        let response = run(&vault, ALICE, get("k1"));
        assert_eq!(response, Response::with_payload(Status::Ok, &b"v1"[..]));

        assert_eq!(status(&vault, ALICE, upsert("k1", b"v2")), Status::OkUpdate);
        assert_eq!(status(&vault, ALICE, upsert("k2", b"\x00\xff")), Status::OkInsert);
        assert_eq!(
            run(&vault, ALICE, get("k2")).payload,
            Some(Bytes::from_static(b"\x00\xff"))
        );

        let all = run(&vault, ALICE, Command::AllKeys);
        assert_eq!(parse_listing(&all.payload.unwrap()), vec!["k1", "k2"]);

        let delete = Command::Delete {
            key: "k1".to_string(),
        };
        assert_eq!(status(&vault, ALICE, delete.clone()), Status::Ok);
        assert_eq!(status(&vault, ALICE, delete), Status::ErrKey);
        assert_eq!(status(&vault, ALICE, get("k1")), Status::ErrKey);
    }

    #[test]
    fn test_value_size_boundary() {
        let dir = TempDir::new().unwrap();
        let vault = open(&config(&dir));
        run(&vault, ALICE, Command::Register);

        assert_eq!(status(&vault, ALICE, insert("max", &[7u8; 64])), Status::Ok);
        assert_eq!(status(&vault, ALICE, insert("big", &[7u8; 65])), Status::ErrReqFmt);
        assert_eq!(status(&vault, ALICE, upsert("max", &[1u8; 65])), Status::ErrReqFmt);
        assert_eq!(run(&vault, ALICE, get("max")).payload.unwrap().len(), 64);
        assert_eq!(status(&vault, ALICE, get("big")), Status::ErrKey);

        let content = Command::SetContent {
            content: Bytes::from(vec![0u8; 65]),
        };
        assert_eq!(status(&vault, ALICE, content), Status::ErrReqFmt);
    }

    #[test]
    fn test_content() {
        let dir = TempDir::new().unwrap();
        let vault = open(&config(&dir));
        run(&vault, ALICE, Command::Register);
        run(&vault, BOB, Command::Register);

        let get_alice = Command::GetContent {
            who: "alice".to_string(),
        };
        assert_eq!(status(&vault, BOB, get_alice.clone()), Status::ErrNoData);
        let set = Command::SetContent {
            content: Bytes::from_static(b"alice profile"),
        };
        assert_eq!(status(&vault, ALICE, set), Status::Ok);
        assert_eq!(
            run(&vault, BOB, get_alice).payload,
            Some(Bytes::from_static(b"alice profile"))
        );
        let nobody = Command::GetContent {
            who: "carol".to_string(),
        };
        assert_eq!(status(&vault, BOB, nobody), Status::ErrNoData);

        let users = run(&vault, BOB, Command::AllUsers);
        assert_eq!(parse_listing(&users.payload.unwrap()), vec!["alice", "bob"]);
    }

    #[test]
    fn test_mru_ranking_and_eviction() {
        let dir = TempDir::new().unwrap();
        let vault = open(&config(&dir));
        run(&vault, ALICE, Command::Register);
        assert_eq!(status(&vault, ALICE, Command::TopKeys), Status::ErrNoData);

        for key in ["a", "b", "c", "d"] {
            run(&vault, ALICE, insert(key, b"v"));
        }
        run(&vault, ALICE, get("a"));
        // Failures leave the ranking alone
        run(&vault, ALICE, insert("b", b"dup"));
        run(&vault, ALICE, get("missing"));
        assert_eq!(top_keys(&vault), vec!["a", "d", "c", "b"]);

        assert_eq!(status(&vault, ALICE, upsert("e", b"v")), Status::OkInsert);
        assert_eq!(top_keys(&vault), vec!["e", "a", "d", "c"]);
        assert_eq!(status(&vault, ALICE, get("b")), Status::ErrKey);
        assert_eq!(vault.key_count(), 4);

        run(&vault, ALICE, Command::Delete {
            key: "d".to_string(),
        });
        assert_eq!(top_keys(&vault), vec!["e", "a", "c"]);
    }

    #[test]
    fn test_quota_charging() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            upload_quota: 10,
            download_quota: 4,
            request_quota: 100,
            ..config(&dir)
        };
        let vault = open(&config);
        run(&vault, ALICE, Command::Register);

        assert_eq!(status(&vault, ALICE, insert("k", b"123456")), Status::Ok);
        // Duplicate insert fails on the key but still pays for the upload
        assert_eq!(status(&vault, ALICE, insert("k", b"1234")), Status::ErrKey);
        assert_eq!(status(&vault, ALICE, insert("j", b"1")), Status::ErrQuotaUp);
        // Oversized values are rejected before the quota gate
        assert_eq!(status(&vault, ALICE, insert("j", &[0u8; 65])), Status::ErrReqFmt);

        assert_eq!(status(&vault, ALICE, get("missing")), Status::ErrKey);
        assert_eq!(status(&vault, ALICE, get("k")), Status::ErrQuotaDown);

        // Bad logins cost nothing
        assert_eq!(status(&vault, ("alice", "nope"), get("k")), Status::ErrLogin);
        let usage = vault.quota.usage("alice").unwrap();
        assert_eq!(usage.uploaded, 10);
        assert_eq!(usage.downloaded, 0);
        assert_eq!(usage.requests, 3);
    }

    #[test]
    fn test_request_quota_resets() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            request_quota: 2,
            quota_interval_secs: 0.2,
            ..config(&dir)
        };
        let vault = open(&config);
        run(&vault, ALICE, Command::Register);

        let attempt = |vault: &Vault| {
            vec![
                status(vault, ALICE, get("k")),
                status(vault, ALICE, get("k")),
                status(vault, ALICE, get("k")),
            ]
        };
        let expected = vec![Status::ErrKey, Status::ErrKey, Status::ErrQuotaReq];
        assert_eq!(attempt(&vault), expected);
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(attempt(&vault), expected);
        // Shutdown is never gated
        assert_eq!(status(&vault, ALICE, Command::Shutdown), Status::Ok);
    }

    #[test]
    fn test_replay_restores_state() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        {
            let vault = open(&config);
            run(&vault, ALICE, Command::Register);
            run(&vault, ALICE, Command::SetContent {
                content: Bytes::from_static(b"hello"),
            });
            run(&vault, ALICE, insert("a", b"1"));
            run(&vault, ALICE, insert("b", b"2"));
            run(&vault, ALICE, upsert("a", b"3"));
            run(&vault, ALICE, Command::Delete {
                key: "b".to_string(),
            });
            run(&vault, ALICE, insert("c", b"4"));
        }

        let (vault, outcome) = Vault::open(&config).unwrap();
        assert!(matches!(outcome, LoadOutcome::Loaded { records: 7 }));
        assert_eq!(run(&vault, ALICE, get("a")).payload, Some(Bytes::from_static(b"3")));
        assert_eq!(status(&vault, ALICE, get("b")), Status::ErrKey);
        assert_eq!(
            run(&vault, ALICE, Command::GetContent {
                who: "alice".to_string()
            })
            .payload,
            Some(Bytes::from_static(b"hello"))
        );
        // Ranking is rebuilt from the order of the last writes, then the gets above
        assert_eq!(top_keys(&vault), vec!["a", "c"]);
    }

    #[test]
    fn test_replay_never_exceeds_capacity() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.mru_capacity = 10;
        {
            let vault = open(&config);
            run(&vault, ALICE, Command::Register);
            for i in 0..6 {
                run(&vault, ALICE, insert(&format!("k{}", i), b"v"));
            }
        }
        config.mru_capacity = 3;
        let vault = open(&config);
        assert_eq!(vault.key_count(), 3);
        assert_eq!(top_keys(&vault), vec!["k5", "k4", "k3"]);
    }

    #[test]
    fn test_persist_compacts_log() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let vault = open(&config);
        run(&vault, ALICE, Command::Register);
        for i in 0..20 {
            run(&vault, ALICE, upsert("k", format!("value {}", i).as_bytes()));
        }
        run(&vault, ALICE, insert("gone", b"x"));
        run(&vault, ALICE, Command::Delete {
            key: "gone".to_string(),
        });
        let before = vault.log_size().unwrap();

        assert_eq!(status(&vault, ALICE, Command::Persist), Status::Ok);
        let after = vault.log_size().unwrap();
        assert!(after < before);

        // Appends continue on the compacted file
        run(&vault, ALICE, insert("after", b"y"));
        drop(vault);

        let (vault, outcome) = Vault::open(&config).unwrap();
        assert_eq!(outcome, LoadOutcome::Loaded { records: 3 });
        assert_eq!(
            run(&vault, ALICE, get("k")).payload,
            Some(Bytes::from_static(b"value 19"))
        );
        assert_eq!(status(&vault, ALICE, get("after")), Status::Ok);
        assert_eq!(status(&vault, ALICE, get("gone")), Status::ErrKey);
    }

    #[test]
    fn test_concurrent_clients_with_few_shards() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            shards: 2,
            mru_capacity: 1000,
            request_quota: 10_000,
            ..config(&dir)
        };
        let vault = std::sync::Arc::new(open(&config));
        run(&vault, ALICE, Command::Register);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let vault = std::sync::Arc::clone(&vault);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let key = format!("t{}-{}", t, i);
                        assert_eq!(status(&vault, ALICE, insert(&key, b"v")), Status::Ok);
                        assert_eq!(status(&vault, ALICE, get(&key)), Status::Ok);
                        if i % 2 == 0 {
                            let delete = Command::Delete { key };
                            assert_eq!(status(&vault, ALICE, delete), Status::Ok);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(vault.key_count(), 200);
    }
}
