// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Minimal catalog the caching layer borrows against.
//!
//! Foreign tables and foreign servers are owned here; everything else in the
//! crate looks entries up by id and holds `Arc` references bounded by the
//! catalog's lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

pub use self::column::*;
pub use self::foreign_server::*;
pub use self::foreign_table::*;
use crate::chunk::ChunkKey;
use crate::error::{StorageResult, TracedStorageError};

mod column;
mod foreign_server;
mod foreign_table;

pub type DatabaseId = i32;
pub type TableId = i32;
pub type ColumnId = i32;

/// Builds the `(db, table)` chunk-key prefix of a table.
pub fn table_key_of(db_id: DatabaseId, table_id: TableId) -> ChunkKey {
    ChunkKey::from_slice(&[db_id, table_id])
}

pub type CatalogRef = Arc<Catalog>;

#[derive(Default)]
pub struct Catalog {
    servers: RwLock<HashMap<String, Arc<ForeignServer>>>,
    tables: RwLock<HashMap<(DatabaseId, TableId), Arc<ForeignTable>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_foreign_server(&self, server: ForeignServer) -> StorageResult<Arc<ForeignServer>> {
        server.validate_options()?;
        let server = Arc::new(server);
        self.servers
            .write()
            .insert(server.name.clone(), server.clone());
        Ok(server)
    }

    pub fn get_foreign_server(&self, name: &str) -> StorageResult<Arc<ForeignServer>> {
        self.servers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| TracedStorageError::not_found("foreign server", name))
    }

    pub fn add_foreign_table(&self, table: ForeignTable) -> StorageResult<Arc<ForeignTable>> {
        table.validate_options()?;
        let table = Arc::new(table);
        self.tables
            .write()
            .insert((table.db_id, table.table_id), table.clone());
        Ok(table)
    }

    pub fn get_foreign_table(
        &self,
        db_id: DatabaseId,
        table_id: TableId,
    ) -> StorageResult<Arc<ForeignTable>> {
        self.tables
            .read()
            .get(&(db_id, table_id))
            .cloned()
            .ok_or_else(|| TracedStorageError::not_found("foreign table", table_id))
    }

    pub fn get_foreign_table_by_name(
        &self,
        db_id: DatabaseId,
        name: &str,
    ) -> StorageResult<Arc<ForeignTable>> {
        self.tables
            .read()
            .values()
            .find(|table| table.db_id == db_id && table.name == name)
            .cloned()
            .ok_or_else(|| TracedStorageError::not_found("foreign table", name))
    }

    pub fn drop_foreign_table(&self, db_id: DatabaseId, table_id: TableId) {
        self.tables.write().remove(&(db_id, table_id));
    }

    /// Tables whose next scheduled refresh time has arrived.
    pub fn get_all_foreign_tables_for_refresh(&self, now: i64) -> Vec<Arc<ForeignTable>> {
        self.tables
            .read()
            .values()
            .filter(|table| {
                let next = table.next_refresh_time();
                next != NULL_REFRESH_TIME && next <= now
            })
            .cloned()
            .collect()
    }
}
