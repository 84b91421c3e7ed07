use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::{
    cache::InMemoryCache,
    dto::production::ManufacturerSummary,
    entities::manufacturer::{self, Entity as ManufacturerEntity},
    errors::ServiceError,
};

const ACTIVE_MANUFACTURERS_KEY: &str = "manufacturers:active";

/// Active manufacturer list for display, fronted by a TTL cache.
///
/// Transactional code must use [`ManufacturerCatalog::require_active`], which
/// always reads the database.
#[derive(Clone)]
pub struct ManufacturerCatalog {
    db: Arc<DatabaseConnection>,
    cache: InMemoryCache,
}

impl ManufacturerCatalog {
    pub fn new(db: Arc<DatabaseConnection>, ttl: Duration) -> Result<Self, ServiceError> {
        Ok(Self {
            db,
            cache: InMemoryCache::new(ttl)?,
        })
    }

    #[instrument(skip(self))]
    pub async fn list_active(&self) -> Result<Vec<ManufacturerSummary>, ServiceError> {
        if let Some(cached) = self.cache.get_json(ACTIVE_MANUFACTURERS_KEY)? {
            debug!("Active manufacturers served from cache");
            return Ok(cached);
        }

        let active: Vec<ManufacturerSummary> = ManufacturerEntity::find()
            .filter(manufacturer::Column::Active.eq(true))
            .order_by_asc(manufacturer::Column::Name)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|m| ManufacturerSummary {
                id: m.id,
                name: m.name,
            })
            .collect();

        self.cache.set_json(ACTIVE_MANUFACTURERS_KEY, &active)?;
        Ok(active)
    }

    /// Drops the cached list; the next read goes to the database.
    pub fn invalidate(&self) -> Result<(), ServiceError> {
        self.cache.delete_entry(ACTIVE_MANUFACTURERS_KEY)?;
        Ok(())
    }

    /// Uncached check used inside transactions. Missing and inactive
    /// manufacturers are both rejected.
    pub async fn require_active<C: ConnectionTrait>(
        conn: &C,
        manufacturer_id: i32,
    ) -> Result<manufacturer::Model, ServiceError> {
        ManufacturerEntity::find_by_id(manufacturer_id)
            .lock_shared()
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .filter(|m| m.active)
            .ok_or(ServiceError::InactiveManufacturer(manufacturer_id))
    }
}
