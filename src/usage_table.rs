//! Usage table header bookkeeping.
//!
//! Engines with per-entry usage support keep a signed table header outside
//! the TEE. One [`UsageTableHeader`] per security level tracks that header
//! and what each entry slot is used for; it is shared by every session of a
//! [`CryptoContext`](crate::context::CryptoContext) and persisted through a
//! [`UsageTableStore`].

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::crypto_session::CryptoSession;
use crate::error::{Error, Result};
use crate::oemcrypto::{CdmSecurityLevel, API_VERSION_BIG_USAGE_TABLES};

/// Number of times `add_entry` frees a slot and retries when the engine is
/// out of resources.
pub const MAX_ADD_ENTRY_RETRIES: usize = 3;

/// Usage bookkeeping model offered by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageSupportType {
    /// No secure usage reporting.
    NonSecure,
    /// One engine-resident table updated as a whole.
    Table,
    /// Per-entry records loaded into and out of the engine.
    Entry,
}

impl UsageSupportType {
    /// Support type for an engine that reports usage table support.
    #[must_use]
    pub fn for_api_version(supports_usage_table: bool, api_version: u32) -> Self {
        if !supports_usage_table {
            UsageSupportType::NonSecure
        } else if api_version >= API_VERSION_BIG_USAGE_TABLES {
            UsageSupportType::Entry
        } else {
            UsageSupportType::Table
        }
    }
}

/// What a usage entry slot holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsageEntryStorage {
    #[default]
    Unknown,
    License,
    UsageInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEntryInfo {
    pub storage_type: UsageEntryStorage,
    pub key_set_id: String,
    /// Only set for `UsageInfo` entries.
    pub usage_info_file_name: String,
}

/// Persisted form of a usage table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredUsageTable {
    pub header: Vec<u8>,
    pub entries: Vec<UsageEntryInfo>,
}

/// Persistence for usage table headers.
pub trait UsageTableStore: Send + Sync {
    fn retrieve(&self, level: CdmSecurityLevel) -> Option<StoredUsageTable>;

    fn store(&self, level: CdmSecurityLevel, table: &StoredUsageTable) -> Result<()>;

    fn remove(&self, level: CdmSecurityLevel);
}

/// Process-local store, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryUsageTableStore {
    tables: Mutex<HashMap<CdmSecurityLevel, StoredUsageTable>>,
}

impl UsageTableStore for MemoryUsageTableStore {
    fn retrieve(&self, level: CdmSecurityLevel) -> Option<StoredUsageTable> {
        self.tables.lock().get(&level).cloned()
    }

    fn store(&self, level: CdmSecurityLevel, table: &StoredUsageTable) -> Result<()> {
        self.tables.lock().insert(level, table.clone());
        Ok(())
    }

    fn remove(&self, level: CdmSecurityLevel) {
        self.tables.lock().remove(&level);
    }
}

/// Shared usage table header for one security level.
pub struct UsageTableHeader {
    security_level: CdmSecurityLevel,
    store: std::sync::Arc<dyn UsageTableStore>,
    table: Mutex<StoredUsageTable>,
}

impl std::fmt::Debug for UsageTableHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageTableHeader")
            .field("security_level", &self.security_level)
            .field("entries", &self.table.lock().entries.len())
            .finish()
    }
}

impl UsageTableHeader {
    /// Load the persisted header into the engine, or create a new one.
    ///
    /// Only engines with per-entry usage support have a header.
    pub fn init(
        security_level: CdmSecurityLevel,
        crypto_session: &CryptoSession,
        store: std::sync::Arc<dyn UsageTableStore>,
    ) -> Result<Self> {
        if crypto_session.get_usage_support_type()? != UsageSupportType::Entry {
            return Err(Error::UsageInformationSupportFailed);
        }

        let table = match store.retrieve(security_level) {
            Some(table) => match crypto_session.load_usage_table_header(&table.header) {
                Ok(()) => table,
                Err(err) => {
                    warn!(
                        "UsageTableHeader: failed to load stored header ({}), creating a new one",
                        err
                    );
                    store.remove(security_level);
                    Self::create(security_level, crypto_session, store.as_ref())?
                }
            },
            None => Self::create(security_level, crypto_session, store.as_ref())?,
        };

        debug!(
            "UsageTableHeader: level {:?} ready with {} entries",
            security_level,
            table.entries.len()
        );
        Ok(Self {
            security_level,
            store,
            table: Mutex::new(table),
        })
    }

    fn create(
        security_level: CdmSecurityLevel,
        crypto_session: &CryptoSession,
        store: &dyn UsageTableStore,
    ) -> Result<StoredUsageTable> {
        let table = StoredUsageTable {
            header: crypto_session.create_usage_table_header()?,
            entries: Vec::new(),
        };
        store.store(security_level, &table)?;
        Ok(table)
    }

    #[must_use]
    pub fn security_level(&self) -> CdmSecurityLevel {
        self.security_level
    }

    /// Number of entry slots in the table.
    #[must_use]
    pub fn size(&self) -> usize {
        self.table.lock().entries.len()
    }

    #[must_use]
    pub fn entry_info(&self, usage_entry_number: u32) -> Option<UsageEntryInfo> {
        self.table.lock().entries.get(usage_entry_number as usize).cloned()
    }

    /// Current serialized header.
    #[must_use]
    pub fn header(&self) -> Vec<u8> {
        self.table.lock().header.clone()
    }

    /// Create a usage entry for the session and record what it is for.
    ///
    /// When the engine is out of entry slots, a random in-use entry is
    /// deleted and creation retried, up to [`MAX_ADD_ENTRY_RETRIES`] times.
    pub fn add_entry(
        &self,
        crypto_session: &CryptoSession,
        persistent_license: bool,
        key_set_id: &str,
        usage_info_file_name: &str,
    ) -> Result<u32> {
        let mut table = self.table.lock();

        let mut retries = 0;
        let usage_entry_number = loop {
            match crypto_session.create_usage_entry() {
                Ok(number) => break number,
                Err(err) if err.is_resource_exhaustion() && retries < MAX_ADD_ENTRY_RETRIES => {
                    let in_use: Vec<u32> = table
                        .entries
                        .iter()
                        .enumerate()
                        .filter(|(_, entry)| entry.storage_type != UsageEntryStorage::Unknown)
                        .map(|(index, _)| index as u32)
                        .collect();
                    let Some(&victim) = in_use.choose(&mut rand::thread_rng()) else {
                        return Err(err);
                    };
                    retries += 1;
                    warn!(
                        "UsageTableHeader: out of entries, deleting entry {} (attempt {})",
                        victim, retries
                    );
                    self.delete_entry_locked(&mut table, victim, crypto_session)?;
                }
                Err(err) => return Err(err),
            }
        };

        let index = usage_entry_number as usize;
        if index >= table.entries.len() {
            table.entries.resize(index + 1, UsageEntryInfo::default());
        }
        table.entries[index] = if persistent_license {
            UsageEntryInfo {
                storage_type: UsageEntryStorage::License,
                key_set_id: key_set_id.to_string(),
                usage_info_file_name: String::new(),
            }
        } else {
            UsageEntryInfo {
                storage_type: UsageEntryStorage::UsageInfo,
                key_set_id: key_set_id.to_string(),
                usage_info_file_name: usage_info_file_name.to_string(),
            }
        };
        self.store.store(self.security_level, &table)?;
        Ok(usage_entry_number)
    }

    /// Load a previously saved entry into the session.
    pub fn load_entry(&self, crypto_session: &CryptoSession, usage_entry: &[u8], usage_entry_number: u32) -> Result<()> {
        let table = self.table.lock();
        if usage_entry_number as usize >= table.entries.len() {
            error!(
                "UsageTableHeader: entry {} beyond table size {}",
                usage_entry_number,
                table.entries.len()
            );
            return Err(Error::InvalidUsageEntry(usage_entry_number));
        }
        crypto_session.load_usage_entry(usage_entry_number, usage_entry)
    }

    /// Refresh the session's entry and the header; returns the new entry.
    pub fn update_entry(&self, crypto_session: &CryptoSession) -> Result<Vec<u8>> {
        let mut table = self.table.lock();
        let (header, entry) = crypto_session.update_usage_entry()?;
        table.header = header;
        self.store.store(self.security_level, &table)?;
        Ok(entry)
    }

    /// Release an entry slot and shrink the table past trailing free slots.
    pub fn delete_entry(&self, usage_entry_number: u32, crypto_session: &CryptoSession) -> Result<()> {
        let mut table = self.table.lock();
        self.delete_entry_locked(&mut table, usage_entry_number, crypto_session)
    }

    fn delete_entry_locked(
        &self,
        table: &mut StoredUsageTable,
        usage_entry_number: u32,
        crypto_session: &CryptoSession,
    ) -> Result<()> {
        let index = usage_entry_number as usize;
        let Some(entry) = table.entries.get_mut(index) else {
            return Err(Error::InvalidUsageEntry(usage_entry_number));
        };
        *entry = UsageEntryInfo::default();

        let in_use = table
            .entries
            .iter()
            .rposition(|entry| entry.storage_type != UsageEntryStorage::Unknown)
            .map_or(0, |last| last + 1);
        if in_use < table.entries.len() {
            table.header = crypto_session.shrink_usage_table_header(in_use as u32)?;
            table.entries.truncate(in_use);
        }
        self.store.store(self.security_level, table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn support_type_branches_on_version() {
        assert_eq!(UsageSupportType::for_api_version(false, 15), UsageSupportType::NonSecure);
        assert_eq!(UsageSupportType::for_api_version(true, 12), UsageSupportType::Table);
        assert_eq!(UsageSupportType::for_api_version(true, 13), UsageSupportType::Entry);
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryUsageTableStore::default();
        let table = StoredUsageTable {
            header: vec![1, 2, 3],
            entries: vec![UsageEntryInfo {
                storage_type: UsageEntryStorage::License,
                key_set_id: "ksid".to_string(),
                usage_info_file_name: String::new(),
            }],
        };
        store.store(CdmSecurityLevel::L3, &table).expect("store");

        assert_eq!(store.retrieve(CdmSecurityLevel::L3), Some(table));
        assert_eq!(store.retrieve(CdmSecurityLevel::L1), None);
        store.remove(CdmSecurityLevel::L3);
        assert_eq!(store.retrieve(CdmSecurityLevel::L3), None);
    }
}
