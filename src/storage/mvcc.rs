use std::{
    collections::{BTreeMap, HashSet},
    ops::Bound,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    error::{Error, Result},
    storage::{
        engine::{prefix_range, Engine},
        keycode::{encode_u64, escape_bytes, take_u64, unescape_bytes},
    },
};

/// Snapshot version number type
pub type Version = u64;

/// Versioned snapshot layer over a byte-level storage engine
///
/// Transactions here are the internal unit of atomicity: every relational
/// mutation (row plus directory plus index entries) runs inside one and
/// either commits whole or rolls back whole. Scans begun before a commit do
/// not observe it.
pub struct Mvcc<E: Engine> {
    engine: Arc<Mutex<E>>,
}

impl<E: Engine> Clone for Mvcc<E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<E: Engine> Mvcc<E> {
    pub fn new(eng: E) -> Self {
        Self {
            engine: Arc::new(Mutex::new(eng)),
        }
    }

    pub fn begin(&self) -> Result<MvccTransaction<E>> {
        MvccTransaction::begin(self.engine.clone())
    }
}

/// A single snapshot transaction
pub struct MvccTransaction<E: Engine> {
    engine: Arc<Mutex<E>>,
    state: TransactionState,
}

/// Visibility state captured at begin time
pub struct TransactionState {
    pub version: Version,
    pub active_versions: HashSet<Version>,
}

impl TransactionState {
    fn is_visible(&self, version: Version) -> bool {
        if self.active_versions.contains(&version) {
            return false;
        }
        version <= self.version
    }
}

// Keyspace tags for version-layer keys. Raw keys are escaped so the version
// suffix can always be recovered.
const VKEY_NEXT_VERSION: u8 = 0x00;
const VKEY_TXN_ACTIVE: u8 = 0x01;
const VKEY_TXN_WRITE: u8 = 0x02;
const VKEY_VERSION: u8 = 0x03;

/// Version-layer key types
#[derive(Debug, PartialEq)]
pub enum MvccKey {
    /// Next version counter
    NextVersion,
    /// Active transaction marker
    TxnActive(Version),
    /// Write set entry for rollback
    TxnWrite(Version, Vec<u8>),
    /// Versioned data key
    Version(Vec<u8>, Version),
}

impl MvccKey {
    /// Serializes the key to order-preserving bytes
    pub fn encode(&self) -> Vec<u8> {
        match self {
            MvccKey::NextVersion => vec![VKEY_NEXT_VERSION],
            MvccKey::TxnActive(version) => {
                let mut out = vec![VKEY_TXN_ACTIVE];
                out.extend_from_slice(&encode_u64(*version));
                out
            }
            MvccKey::TxnWrite(version, key) => {
                let mut out = vec![VKEY_TXN_WRITE];
                out.extend_from_slice(&encode_u64(*version));
                out.extend_from_slice(&escape_bytes(key));
                out
            }
            MvccKey::Version(key, version) => {
                let mut out = vec![VKEY_VERSION];
                out.extend_from_slice(&escape_bytes(key));
                out.extend_from_slice(&encode_u64(*version));
                out
            }
        }
    }

    /// Deserializes bytes back to a key
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (&tag, mut rest) = data
            .split_first()
            .ok_or_else(|| Error::Serialization("empty version key".into()))?;
        match tag {
            VKEY_NEXT_VERSION => Ok(MvccKey::NextVersion),
            VKEY_TXN_ACTIVE => Ok(MvccKey::TxnActive(take_u64(&mut rest)?)),
            VKEY_TXN_WRITE => {
                let version = take_u64(&mut rest)?;
                let key = unescape_bytes(&mut rest)?;
                Ok(MvccKey::TxnWrite(version, key))
            }
            VKEY_VERSION => {
                let key = unescape_bytes(&mut rest)?;
                let version = take_u64(&mut rest)?;
                Ok(MvccKey::Version(key, version))
            }
            other => Err(Error::Serialization(format!(
                "unknown version key tag {:#04x}",
                other
            ))),
        }
    }

    /// Prefix covering every version of raw keys starting with `prefix`
    fn version_prefix(prefix: &[u8]) -> Vec<u8> {
        let mut out = vec![VKEY_VERSION];
        let mut escaped = escape_bytes(prefix);
        // Drop the terminator so longer raw keys still match
        escaped.truncate(escaped.len() - 2);
        out.extend_from_slice(&escaped);
        out
    }

    /// Maps a raw-key bound to the corresponding version-key bound
    fn version_bound(bound: Bound<&Vec<u8>>, upper: bool) -> Bound<Vec<u8>> {
        let all_versions_of = |key: &Vec<u8>| {
            let mut out = vec![VKEY_VERSION];
            out.extend_from_slice(&escape_bytes(key));
            out
        };
        match (bound, upper) {
            // All versions of the bound key are inside the range
            (Bound::Included(key), false) => Bound::Included(all_versions_of(key)),
            (Bound::Included(key), true) => match prefix_range(&all_versions_of(key)).1 {
                Bound::Excluded(end) => Bound::Excluded(end),
                _ => Bound::Unbounded,
            },
            // All versions of the bound key are outside the range
            (Bound::Excluded(key), false) => match prefix_range(&all_versions_of(key)).1 {
                Bound::Excluded(end) => Bound::Included(end),
                _ => Bound::Unbounded,
            },
            (Bound::Excluded(key), true) => Bound::Excluded(all_versions_of(key)),
            (Bound::Unbounded, false) => Bound::Included(vec![VKEY_VERSION]),
            (Bound::Unbounded, true) => match prefix_range(&[VKEY_VERSION]).1 {
                Bound::Excluded(end) => Bound::Excluded(end),
                _ => Bound::Unbounded,
            },
        }
    }
}

/// Scan result containing a raw key-value pair
#[derive(Debug, PartialEq)]
pub struct ScanResult {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl<E: Engine> MvccTransaction<E> {
    /// Begins a new transaction: allocate a version, remember the versions
    /// still in flight, mark ourselves active
    pub fn begin(eng: Arc<Mutex<E>>) -> Result<Self> {
        let mut engine = eng.lock()?;

        let next_version = match engine.get(MvccKey::NextVersion.encode())? {
            Some(value) => bincode::deserialize(&value)?,
            None => 1,
        };

        engine.set(
            MvccKey::NextVersion.encode(),
            bincode::serialize(&(next_version + 1))?,
        )?;

        let active_versions = Self::scan_active(&mut engine)?;

        engine.set(MvccKey::TxnActive(next_version).encode(), vec![])?;

        drop(engine);
        Ok(Self {
            engine: eng,
            state: TransactionState {
                version: next_version,
                active_versions,
            },
        })
    }

    /// Commits the transaction (drops the write log and the active marker;
    /// the versioned data stays)
    pub fn commit(&self) -> Result<()> {
        let mut engine = self.engine.lock()?;

        let mut delete_keys = Vec::new();
        let mut iter =
            engine.scan_prefix(Self::txn_write_prefix(self.state.version));
        while let Some((key, _)) = iter.next().transpose()? {
            delete_keys.push(key);
        }
        drop(iter);

        for key in delete_keys {
            engine.delete(key)?;
        }

        engine.delete(MvccKey::TxnActive(self.state.version).encode())
    }

    /// Rolls back the transaction (deletes everything it wrote)
    pub fn rollback(&self) -> Result<()> {
        let mut engine = self.engine.lock()?;
        let mut delete_keys = Vec::new();

        let mut iter =
            engine.scan_prefix(Self::txn_write_prefix(self.state.version));
        while let Some((key, _)) = iter.next().transpose()? {
            match MvccKey::decode(&key)? {
                MvccKey::TxnWrite(_, raw_key) => {
                    delete_keys.push(MvccKey::Version(raw_key, self.state.version).encode());
                }
                _ => {
                    return Err(Error::Internal(format!(
                        "unexpected key: {:?}",
                        String::from_utf8(key)
                    )))
                }
            }
            delete_keys.push(key);
        }
        drop(iter);

        for key in delete_keys {
            engine.delete(key)?;
        }

        engine.delete(MvccKey::TxnActive(self.state.version).encode())
    }

    pub fn set(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.write_inner(key, Some(value))
    }

    pub fn delete(&self, key: Vec<u8>) -> Result<()> {
        self.write_inner(key, None)
    }

    /// Gets the value for a key respecting snapshot visibility
    pub fn get(&self, key: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let mut engine = self.engine.lock()?;

        let from = MvccKey::Version(key.clone(), 0).encode();
        let to = MvccKey::Version(key, self.state.version).encode();
        let mut iter = engine.scan(from..=to).rev();

        while let Some((key, value)) = iter.next().transpose()? {
            match MvccKey::decode(&key)? {
                MvccKey::Version(_, version) => {
                    if self.state.is_visible(version) {
                        return Ok(bincode::deserialize(&value)?);
                    }
                }
                _ => {
                    return Err(Error::Internal(format!(
                        "unexpected key: {:?}",
                        String::from_utf8(key)
                    )))
                }
            }
        }
        Ok(None)
    }

    /// Scans raw keys with the given prefix, returning the latest visible
    /// version of each live key
    pub fn scan_prefix(&self, prefix: Vec<u8>) -> Result<Vec<ScanResult>> {
        let range = prefix_range(&MvccKey::version_prefix(&prefix));
        self.scan_visible(range)
    }

    /// Scans a raw-key range, returning the latest visible version of each
    /// live key
    pub fn scan_range(
        &self,
        from: Bound<&Vec<u8>>,
        to: Bound<&Vec<u8>>,
    ) -> Result<Vec<ScanResult>> {
        let range = (
            MvccKey::version_bound(from, false),
            MvccKey::version_bound(to, true),
        );
        self.scan_visible(range)
    }

    fn scan_visible(&self, range: (Bound<Vec<u8>>, Bound<Vec<u8>>)) -> Result<Vec<ScanResult>> {
        let mut engine = self.engine.lock()?;
        let mut iter = engine.scan(range);

        // Later versions overwrite earlier ones; tombstones drop the key
        let mut results = BTreeMap::new();
        while let Some((key, value)) = iter.next().transpose()? {
            match MvccKey::decode(&key)? {
                MvccKey::Version(raw_key, version) => {
                    if self.state.is_visible(version) {
                        match bincode::deserialize(&value)? {
                            Some(raw_value) => results.insert(raw_key, raw_value),
                            None => results.remove(&raw_key),
                        };
                    }
                }
                _ => {
                    return Err(Error::Internal(format!(
                        "unexpected key {:?}",
                        String::from_utf8(key)
                    )))
                }
            }
        }

        Ok(results
            .into_iter()
            .map(|(key, value)| ScanResult { key, value })
            .collect())
    }

    fn write_inner(&self, key: Vec<u8>, value: Option<Vec<u8>>) -> Result<()> {
        let mut engine = self.engine.lock()?;

        // Conflict detection: a version we cannot see in [min_active, MAX]
        // means a concurrent writer touched this key first
        let from = MvccKey::Version(
            key.clone(),
            self.state
                .active_versions
                .iter()
                .min()
                .copied()
                .unwrap_or(self.state.version + 1),
        )
        .encode();
        let to = MvccKey::Version(key.clone(), u64::MAX).encode();

        if let Some((k, _)) = engine.scan(from..=to).last().transpose()? {
            match MvccKey::decode(&k)? {
                MvccKey::Version(_, version) => {
                    if !self.state.is_visible(version) {
                        return Err(Error::WriteConflict);
                    }
                }
                _ => {
                    return Err(Error::Internal(format!(
                        "unexpected key: {:?}",
                        String::from_utf8(k)
                    )))
                }
            }
        }

        engine.set(
            MvccKey::TxnWrite(self.state.version, key.clone()).encode(),
            vec![],
        )?;

        engine.set(
            MvccKey::Version(key, self.state.version).encode(),
            bincode::serialize(&value)?,
        )?;

        Ok(())
    }

    fn txn_write_prefix(version: Version) -> Vec<u8> {
        let mut out = vec![VKEY_TXN_WRITE];
        out.extend_from_slice(&encode_u64(version));
        out
    }

    fn scan_active(engine: &mut MutexGuard<E>) -> Result<HashSet<Version>> {
        let mut active_versions = HashSet::new();
        let mut iter = engine.scan_prefix(vec![VKEY_TXN_ACTIVE]);

        while let Some((key, _)) = iter.next().transpose()? {
            match MvccKey::decode(&key)? {
                MvccKey::TxnActive(version) => {
                    active_versions.insert(version);
                }
                _ => {
                    return Err(Error::Internal(format!(
                        "unexpected key: {:?}",
                        String::from_utf8(key)
                    )))
                }
            }
        }
        Ok(active_versions)
    }
}
