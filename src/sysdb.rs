//! Persistent-cache contract and its `sled`-backed implementation. The
//! storage format lives entirely behind the `Sysdb` trait, not a
//! replacement for any particular on-disk format: a different backend
//! could replace `SledSysdb` without the pipeline noticing.

use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ResponderError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PosixClass {
    User,
    Group,
}

/// A single group-membership entry. `posix` mirrors the directory's
/// `posix` attribute on the membership link: entries with `posix = false`
/// are real but must be skipped when building an initgroups reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub gid: u32,
    pub posix: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SysdbRecord {
    pub name: String,
    pub aliases: Vec<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub class: PosixClass,
    pub sid: Option<String>,
    pub gecos: Option<String>,
    pub homedir: Option<String>,
    pub shell: Option<String>,
    pub members: Vec<GroupMembership>,
    /// Distinct from `gid` only when the provider reassigned the user's
    /// primary group after the original membership was recorded.
    pub original_primary_gid: Option<u32>,
    pub cache_expire: i64,
    pub initgroups_expire: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub aliases: Vec<String>,
    pub port: u16,
    pub proto: String,
}

/// Persistent-cache contract. The responder never issues concurrent
/// writes against the same domain, so implementors need no locking
/// beyond what the backend already gives a single writer.
pub trait Sysdb: Send + Sync {
    fn getpwnam(&self, domain: &str, name: &str) -> Result<Vec<SysdbRecord>>;
    fn getpwuid(&self, domain: &str, uid: u32) -> Result<Vec<SysdbRecord>>;
    fn getgrnam(&self, domain: &str, name: &str) -> Result<Vec<SysdbRecord>>;
    fn getgrgid(&self, domain: &str, gid: u32) -> Result<Vec<SysdbRecord>>;
    fn search_object_by_sid(&self, domain: &str, sid: &str) -> Result<Vec<SysdbRecord>>;
    fn initgroups(&self, domain: &str, name: &str) -> Result<Vec<SysdbRecord>>;
    fn enumpwent(&self, domain: &str) -> Result<Vec<SysdbRecord>>;
    fn enumgrent(&self, domain: &str) -> Result<Vec<SysdbRecord>>;

    fn store_user(&self, domain: &str, record: &SysdbRecord) -> Result<()>;
    fn store_group(&self, domain: &str, record: &SysdbRecord) -> Result<()>;
    fn delete_user(&self, domain: &str, name: &str) -> Result<()>;
    fn delete_group(&self, domain: &str, name: &str) -> Result<()>;

    fn getservbyname(&self, domain: &str, name: &str, proto: &str) -> Result<Vec<ServiceRecord>>;
    fn getservbyport(&self, domain: &str, port: u16, proto: &str) -> Result<Vec<ServiceRecord>>;
    fn enumservent(&self, domain: &str) -> Result<Vec<ServiceRecord>>;
    fn store_service(&self, domain: &str, record: &ServiceRecord) -> Result<()>;

    /// Opens a transaction. All `store_*`/`delete_*` calls made before the
    /// matching `transaction_commit` are buffered and applied together;
    /// a second `transaction_start` before that commit/cancel is an error
    /// since the responder never runs concurrent transactions against its
    /// own persistent cache.
    fn transaction_start(&self) -> Result<()>;
    /// Applies every write buffered since `transaction_start`.
    fn transaction_commit(&self) -> Result<()>;
    /// Discards every write buffered since `transaction_start`.
    fn transaction_cancel(&self) -> Result<()>;

    /// Durably persists any buffered writes. A no-op for backends that have
    /// no write buffer of their own.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// One write buffered inside an open transaction, applied atomically
/// per-tree (via `sled::Tree::apply_batch`) at `transaction_commit`.
enum PendingWrite {
    Upsert { tree: String, key: Vec<u8>, value: Vec<u8> },
    Remove { tree: String, key: Vec<u8> },
}

/// `sled`-backed implementation: one tree per `(domain, kind)` pair,
/// `bincode`-serialized records keyed by primary name (with secondary
/// lookup by scanning, since the tables are small per domain).
///
/// Writes outside an explicit transaction are applied immediately
/// (an implicit single-operation transaction); `txn` holds the buffer for
/// an explicit one and also serves as the mutual-exclusion guard that
/// rejects a second concurrent `transaction_start`.
pub struct SledSysdb {
    db: sled::Db,
    txn: Mutex<Option<Vec<PendingWrite>>>,
}

impl SledSysdb {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db, txn: Mutex::new(None) })
    }

    fn tree_name(domain: &str, class: PosixClass) -> String {
        match class {
            PosixClass::User => format!("{domain}:users"),
            PosixClass::Group => format!("{domain}:groups"),
        }
    }

    fn tree(&self, domain: &str, class: PosixClass) -> Result<sled::Tree> {
        Ok(self.db.open_tree(Self::tree_name(domain, class))?)
    }

    /// Buffers the write if a transaction is open, otherwise applies it
    /// immediately as a single-operation transaction of its own.
    fn write_record(&self, tree: String, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let mut guard = self.txn.lock();
        match guard.as_mut() {
            Some(pending) => {
                pending.push(PendingWrite::Upsert { tree, key, value });
                Ok(())
            }
            None => {
                drop(guard);
                self.db.open_tree(tree)?.insert(key, value)?;
                Ok(())
            }
        }
    }

    fn remove_record(&self, tree: String, key: Vec<u8>) -> Result<()> {
        let mut guard = self.txn.lock();
        match guard.as_mut() {
            Some(pending) => {
                pending.push(PendingWrite::Remove { tree, key });
                Ok(())
            }
            None => {
                drop(guard);
                self.db.open_tree(tree)?.remove(key)?;
                Ok(())
            }
        }
    }

    fn encode(record: &SysdbRecord) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(record, bincode::config::standard())?)
    }

    fn decode(bytes: &[u8]) -> Result<SysdbRecord> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(record)
    }

    fn scan(&self, domain: &str, class: PosixClass) -> Result<Vec<SysdbRecord>> {
        let tree = self.tree(domain, class)?;
        tree.iter()
            .values()
            .map(|v| Self::decode(&v?))
            .collect::<Result<Vec<_>>>()
    }

    fn find(&self, domain: &str, class: PosixClass, pred: impl Fn(&SysdbRecord) -> bool) -> Result<Vec<SysdbRecord>> {
        Ok(self
            .scan(domain, class)?
            .into_iter()
            .filter(pred)
            .collect())
    }
}

impl Sysdb for SledSysdb {
    fn getpwnam(&self, domain: &str, name: &str) -> Result<Vec<SysdbRecord>> {
        self.find(domain, PosixClass::User, |r| {
            r.name == name || r.aliases.iter().any(|a| a == name)
        })
    }

    fn getpwuid(&self, domain: &str, uid: u32) -> Result<Vec<SysdbRecord>> {
        self.find(domain, PosixClass::User, |r| r.uid == Some(uid))
    }

    fn getgrnam(&self, domain: &str, name: &str) -> Result<Vec<SysdbRecord>> {
        self.find(domain, PosixClass::Group, |r| {
            r.name == name || r.aliases.iter().any(|a| a == name)
        })
    }

    fn getgrgid(&self, domain: &str, gid: u32) -> Result<Vec<SysdbRecord>> {
        self.find(domain, PosixClass::Group, |r| r.gid == Some(gid))
    }

    fn search_object_by_sid(&self, domain: &str, sid: &str) -> Result<Vec<SysdbRecord>> {
        let mut out = self.find(domain, PosixClass::User, |r| r.sid.as_deref() == Some(sid))?;
        out.extend(self.find(domain, PosixClass::Group, |r| r.sid.as_deref() == Some(sid))?);
        Ok(out)
    }

    fn initgroups(&self, domain: &str, name: &str) -> Result<Vec<SysdbRecord>> {
        self.getpwnam(domain, name)
    }

    fn enumpwent(&self, domain: &str) -> Result<Vec<SysdbRecord>> {
        self.scan(domain, PosixClass::User)
    }

    fn enumgrent(&self, domain: &str) -> Result<Vec<SysdbRecord>> {
        self.scan(domain, PosixClass::Group)
    }

    fn store_user(&self, domain: &str, record: &SysdbRecord) -> Result<()> {
        self.write_record(
            Self::tree_name(domain, PosixClass::User),
            record.name.clone().into_bytes(),
            Self::encode(record)?,
        )
    }

    fn store_group(&self, domain: &str, record: &SysdbRecord) -> Result<()> {
        self.write_record(
            Self::tree_name(domain, PosixClass::Group),
            record.name.clone().into_bytes(),
            Self::encode(record)?,
        )
    }

    fn delete_user(&self, domain: &str, name: &str) -> Result<()> {
        self.remove_record(Self::tree_name(domain, PosixClass::User), name.as_bytes().to_vec())
    }

    fn delete_group(&self, domain: &str, name: &str) -> Result<()> {
        self.remove_record(Self::tree_name(domain, PosixClass::Group), name.as_bytes().to_vec())
    }

    fn getservbyname(&self, domain: &str, name: &str, proto: &str) -> Result<Vec<ServiceRecord>> {
        Ok(self
            .scan_services(domain)?
            .into_iter()
            .filter(|s| (s.name == name || s.aliases.iter().any(|a| a == name)) && s.proto == proto)
            .collect())
    }

    fn getservbyport(&self, domain: &str, port: u16, proto: &str) -> Result<Vec<ServiceRecord>> {
        Ok(self
            .scan_services(domain)?
            .into_iter()
            .filter(|s| s.port == port && s.proto == proto)
            .collect())
    }

    fn enumservent(&self, domain: &str) -> Result<Vec<ServiceRecord>> {
        self.scan_services(domain)
    }

    fn store_service(&self, domain: &str, record: &ServiceRecord) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(record, bincode::config::standard())?;
        self.write_record(
            format!("{domain}:services"),
            format!("{}/{}", record.name, record.proto).into_bytes(),
            bytes,
        )
    }

    fn transaction_start(&self) -> Result<()> {
        let mut guard = self.txn.lock();
        if guard.is_some() {
            return Err(ResponderError::Backend("a transaction is already in progress".into()));
        }
        *guard = Some(Vec::new());
        Ok(())
    }

    fn transaction_commit(&self) -> Result<()> {
        let pending = self
            .txn
            .lock()
            .take()
            .ok_or_else(|| ResponderError::Backend("no transaction in progress".into()))?;

        let mut batches: std::collections::HashMap<String, sled::Batch> = std::collections::HashMap::new();
        for op in pending {
            match op {
                PendingWrite::Upsert { tree, key, value } => batches.entry(tree).or_default().insert(key, value),
                PendingWrite::Remove { tree, key } => batches.entry(tree).or_default().remove(key),
            }
        }
        for (tree_name, batch) in batches {
            self.db.open_tree(tree_name)?.apply_batch(batch)?;
        }
        self.db.flush()?;
        Ok(())
    }

    fn transaction_cancel(&self) -> Result<()> {
        self.txn
            .lock()
            .take()
            .ok_or_else(|| ResponderError::Backend("no transaction in progress".into()))?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl SledSysdb {
    fn scan_services(&self, domain: &str) -> Result<Vec<ServiceRecord>> {
        let tree = self.db.open_tree(format!("{domain}:services"))?;
        tree.iter()
            .values()
            .map(|v| {
                let v = v?;
                let (record, _) = bincode::serde::decode_from_slice(&v, bincode::config::standard())?;
                Ok(record)
            })
            .collect::<Result<Vec<_>>>()
    }
}

/// Distinguishes a "definitely not found" result from a corrupted
/// multi-row result for a keyed lookup that should be unique.
pub fn single_or_not_found(rows: Vec<SysdbRecord>) -> Result<Option<SysdbRecord>> {
    match rows.len() {
        0 => Ok(None),
        1 => Ok(rows.into_iter().next()),
        _ => {
            tracing::warn!(count = rows.len(), "sysdb returned more than one row for a keyed lookup");
            Err(ResponderError::NotFound)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user(name: &str, uid: u32) -> SysdbRecord {
        SysdbRecord {
            name: name.into(),
            aliases: vec![],
            uid: Some(uid),
            gid: Some(uid),
            class: PosixClass::User,
            sid: None,
            gecos: None,
            homedir: None,
            shell: None,
            members: vec![],
            original_primary_gid: None,
            cache_expire: 0,
            initgroups_expire: None,
        }
    }

    #[test]
    fn store_and_fetch_by_name_and_uid() {
        let dir = tempfile::tempdir().unwrap();
        let db = SledSysdb::open(dir.path()).unwrap();
        db.store_user("dom", &sample_user("alice", 1000)).unwrap();

        let by_name = db.getpwnam("dom", "alice").unwrap();
        assert_eq!(by_name.len(), 1);
        let by_uid = db.getpwuid("dom", 1000).unwrap();
        assert_eq!(by_uid.len(), 1);
        assert_eq!(by_uid[0].name, "alice");
    }

    #[test]
    fn missing_user_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db = SledSysdb::open(dir.path()).unwrap();
        assert!(db.getpwnam("dom", "nobody").unwrap().is_empty());
    }

    #[test]
    fn single_or_not_found_flags_corruption() {
        assert!(single_or_not_found(vec![]).unwrap().is_none());
        assert!(single_or_not_found(vec![sample_user("a", 1)]).unwrap().is_some());
        assert!(single_or_not_found(vec![sample_user("a", 1), sample_user("a", 2)]).is_err());
    }

    #[test]
    fn transaction_commit_applies_buffered_writes_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let db = SledSysdb::open(dir.path()).unwrap();
        db.transaction_start().unwrap();
        db.store_user("dom", &sample_user("alice", 1000)).unwrap();
        db.store_user("dom", &sample_user("bob", 1001)).unwrap();
        // not visible yet: buffered inside the open transaction.
        assert!(db.getpwnam("dom", "alice").unwrap().is_empty());
        db.transaction_commit().unwrap();
        assert_eq!(db.getpwnam("dom", "alice").unwrap().len(), 1);
        assert_eq!(db.getpwnam("dom", "bob").unwrap().len(), 1);
    }

    #[test]
    fn transaction_cancel_discards_buffered_writes() {
        let dir = tempfile::tempdir().unwrap();
        let db = SledSysdb::open(dir.path()).unwrap();
        db.transaction_start().unwrap();
        db.store_user("dom", &sample_user("alice", 1000)).unwrap();
        db.transaction_cancel().unwrap();
        assert!(db.getpwnam("dom", "alice").unwrap().is_empty());
    }

    #[test]
    fn concurrent_transaction_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = SledSysdb::open(dir.path()).unwrap();
        db.transaction_start().unwrap();
        assert!(db.transaction_start().is_err());
        db.transaction_cancel().unwrap();
        db.transaction_start().unwrap();
    }
}
