use crate::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A reservation row: `spider_service(uuid, type, account_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRow {
    /// 32-hex reservation UUID
    pub uuid: String,
    /// Plugin path (the `type` column)
    pub function_name: String,
    pub account_id: i64,
}

/// The persistent reservation catalog plus the per-service account tables
/// (`content_<service>account`). The core reads these; row creation is an
/// external concern.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Stream the catalog in chunks, ordered by insertion.
    async fn reservation_chunk(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<CatalogRow>, StoreError>;

    async fn reservation(&self, uuid: &str) -> Result<Option<CatalogRow>, StoreError>;

    /// Full account row for a service.
    async fn account(
        &self,
        service: &str,
        account_id: i64,
    ) -> Result<Option<HashMap<String, String>>, StoreError>;

    async fn delete_reservation(&self, uuid: &str) -> Result<(), StoreError>;
}

/// In-memory catalog.
#[derive(Default)]
pub struct MemoryCatalog {
    rows: RwLock<Vec<CatalogRow>>,
    accounts: DashMap<(String, i64), HashMap<String, String>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a reservation row.
    pub async fn insert_reservation(&self, row: CatalogRow) {
        self.rows.write().await.push(row);
    }

    /// Seed an account row for a service.
    pub fn insert_account(&self, service: &str, account_id: i64, fields: HashMap<String, String>) {
        self.accounts.insert((service.to_string(), account_id), fields);
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn reservation_chunk(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<CatalogRow>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn reservation(&self, uuid: &str) -> Result<Option<CatalogRow>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows.iter().find(|r| r.uuid == uuid).cloned())
    }

    async fn account(
        &self,
        service: &str,
        account_id: i64,
    ) -> Result<Option<HashMap<String, String>>, StoreError> {
        Ok(self
            .accounts
            .get(&(service.to_string(), account_id))
            .map(|a| a.value().clone()))
    }

    async fn delete_reservation(&self, uuid: &str) -> Result<(), StoreError> {
        self.rows.write().await.retain(|r| r.uuid != uuid);
        Ok(())
    }
}
