//! RocksDB-backed session store for offline and development use.
//!
//! Column families:
//! - `sessions`: session rows (bincode)
//! - `documents`: current document per session (bincode, LZ4 compressed)
//! - `metadata`: document save counters and sizes (bincode)
//! - `participants`: cold-start roster per session (bincode)
//! - `profiles`: participant profiles (bincode)
//!
//! Keys are the raw 16 bytes of the session or participant id.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType, IteratorMode,
    Options, WriteBatch, WriteOptions, DB,
};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{Profile, ProfileLookup, RosterEntry, SessionRow, SessionStore, StoredDocument};
use crate::error::StoreError;
use crate::protocol::{now_millis, ParticipantId, SessionId};

const CF_SESSIONS: &str = "sessions";
const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";
const CF_PARTICIPANTS: &str = "participants";
const CF_PROFILES: &str = "profiles";

const COLUMN_FAMILIES: &[&str] = &[CF_SESSIONS, CF_DOCUMENTS, CF_METADATA, CF_PARTICIPANTS, CF_PROFILES];

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pairline_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches, for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            max_open_files: 64,
            ..Self::default()
        }
    }
}

/// Bookkeeping stored next to each document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub session_id: SessionId,
    /// Number of saves so far.
    pub version: u64,
    pub size: u64,
    pub compressed_size: u64,
    /// ms since epoch
    pub updated_at: u64,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(value)
}

pub struct RocksSessionStore {
    db: DB,
    config: StoreConfig,
}

impl RocksSessionStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened session store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            // Bodies are LZ4-compressed before they reach RocksDB.
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &Uuid) -> Result<Option<T>, StoreError> {
        match self.db.get_cf(self.cf(cf)?, key.as_bytes())? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(&self, cf: &str, key: &Uuid, value: &T) -> Result<(), StoreError> {
        self.db
            .put_cf_opt(self.cf(cf)?, key.as_bytes(), encode(value)?, &self.write_options())?;
        Ok(())
    }

    pub fn put_session(&self, row: &SessionRow) -> Result<(), StoreError> {
        self.put(CF_SESSIONS, &row.id, row)
    }

    pub fn put_roster(&self, session_id: SessionId, roster: &[RosterEntry]) -> Result<(), StoreError> {
        self.put(CF_PARTICIPANTS, &session_id, &roster)
    }

    pub fn put_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        self.put(CF_PROFILES, &profile.participant_id, profile)
    }

    /// Save a document and bump its metadata in one batch.
    pub fn write_document(
        &self,
        session_id: SessionId,
        document: &StoredDocument,
    ) -> Result<DocumentMetadata, StoreError> {
        let raw = encode(document)?;
        let compressed = lz4_flex::compress_prepend_size(&raw);

        let version = self.metadata(session_id)?.map_or(0, |m| m.version) + 1;
        let meta = DocumentMetadata {
            session_id,
            version,
            size: raw.len() as u64,
            compressed_size: compressed.len() as u64,
            updated_at: now_millis(),
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DOCUMENTS)?, session_id.as_bytes(), &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, session_id.as_bytes(), encode(&meta)?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(meta)
    }

    pub fn read_document(&self, session_id: SessionId) -> Result<Option<StoredDocument>, StoreError> {
        match self.db.get_cf(self.cf(CF_DOCUMENTS)?, session_id.as_bytes())? {
            Some(compressed) => {
                let raw = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                decode(&raw).map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn metadata(&self, session_id: SessionId) -> Result<Option<DocumentMetadata>, StoreError> {
        self.get(CF_METADATA, &session_id)
    }

    /// Every session id with a stored row.
    pub fn list_sessions(&self) -> Result<Vec<SessionId>, StoreError> {
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_SESSIONS)?, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Serialization("invalid session key".into()))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }

    /// Remove a session with its document, metadata and roster.
    pub fn delete_session(&self, session_id: SessionId) -> Result<(), StoreError> {
        let key = session_id.as_bytes();
        let mut batch = WriteBatch::default();
        for cf in [CF_SESSIONS, CF_DOCUMENTS, CF_METADATA, CF_PARTICIPANTS] {
            batch.delete_cf(self.cf(cf)?, key);
        }
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

impl SessionStore for RocksSessionStore {
    fn fetch_session(&self, session_id: SessionId) -> BoxFuture<'_, Result<SessionRow, StoreError>> {
        Box::pin(async move {
            self.get(CF_SESSIONS, &session_id)?
                .ok_or(StoreError::NotFound(session_id))
        })
    }

    fn fetch_document(
        &self,
        session_id: SessionId,
    ) -> BoxFuture<'_, Result<Option<StoredDocument>, StoreError>> {
        Box::pin(async move { self.read_document(session_id) })
    }

    fn save_document(
        &self,
        session_id: SessionId,
        document: StoredDocument,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let meta = self.write_document(session_id, &document)?;
            log::debug!(
                "Stored document {session_id} v{} ({} → {} bytes)",
                meta.version,
                meta.size,
                meta.compressed_size
            );
            Ok(())
        })
    }

    fn fetch_roster(&self, session_id: SessionId) -> BoxFuture<'_, Result<Vec<RosterEntry>, StoreError>> {
        Box::pin(async move { Ok(self.get(CF_PARTICIPANTS, &session_id)?.unwrap_or_default()) })
    }
}

impl ProfileLookup for RocksSessionStore {
    fn lookup_profile(
        &self,
        participant_id: ParticipantId,
    ) -> BoxFuture<'_, Result<Option<Profile>, StoreError>> {
        Box::pin(async move { self.get(CF_PROFILES, &participant_id) })
    }
}
