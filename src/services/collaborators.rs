//! Upstream collaborators consumed by the advancement engine.

use async_trait::async_trait;
use futures::future::join_all;
use sea_orm::{DatabaseConnection, EntityTrait};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::{entities::product::Entity as ProductEntity, errors::ServiceError};

/// Stand-in used in audit snapshots when a product name cannot be resolved.
pub const UNKNOWN_PRODUCT_NAME: &str = "Unknown product";

/// Resolves product names for audit snapshots. Never consulted for decisions.
#[async_trait]
pub trait ProductNameLookup: Send + Sync {
    async fn product_name(&self, product_id: i32) -> Result<Option<String>, ServiceError>;
}

/// Reads names from the local `products` table.
#[derive(Clone)]
pub struct DbProductNameLookup {
    db: Arc<DatabaseConnection>,
}

impl DbProductNameLookup {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ProductNameLookup for DbProductNameLookup {
    async fn product_name(&self, product_id: i32) -> Result<Option<String>, ServiceError> {
        Ok(ProductEntity::find_by_id(product_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .map(|product| product.name))
    }
}

/// Looks up every id with a per-lookup timeout.
///
/// Failures, timeouts and unknown ids degrade to [`UNKNOWN_PRODUCT_NAME`].
pub async fn resolve_product_names(
    lookup: &dyn ProductNameLookup,
    product_ids: &[i32],
    timeout: Duration,
) -> HashMap<i32, String> {
    let mut unique: Vec<i32> = product_ids.to_vec();
    unique.sort_unstable();
    unique.dedup();

    let lookups = unique.iter().map(|&product_id| async move {
        let name = match tokio::time::timeout(timeout, lookup.product_name(product_id)).await {
            Ok(Ok(Some(name))) => name,
            Ok(Ok(None)) => UNKNOWN_PRODUCT_NAME.to_string(),
            Ok(Err(e)) => {
                warn!(product_id, error = %e, "Product name lookup failed");
                UNKNOWN_PRODUCT_NAME.to_string()
            }
            Err(_) => {
                warn!(product_id, ?timeout, "Product name lookup timed out");
                UNKNOWN_PRODUCT_NAME.to_string()
            }
        };
        (product_id, name)
    });

    join_all(lookups).await.into_iter().collect()
}

/// Turns a previously uploaded file reference into the URL stored on the invoice.
#[async_trait]
pub trait InvoiceDocumentStore: Send + Sync {
    async fn store(&self, reference: &str) -> Result<String, ServiceError>;
}

/// Resolves references against a configured base URL. Absolute URLs pass through.
#[derive(Debug, Clone, Default)]
pub struct UrlDocumentStore {
    base_url: Option<String>,
}

impl UrlDocumentStore {
    pub fn new(base_url: Option<String>) -> Self {
        Self { base_url }
    }
}

#[async_trait]
impl InvoiceDocumentStore for UrlDocumentStore {
    async fn store(&self, reference: &str) -> Result<String, ServiceError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ServiceError::InvoiceDataRequired(
                "proof-of-invoice document is missing".into(),
            ));
        }
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return Ok(reference.to_string());
        }
        Ok(match &self.base_url {
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                reference.trim_start_matches('/')
            ),
            None => reference.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyLookup;

    #[async_trait]
    impl ProductNameLookup for FlakyLookup {
        async fn product_name(&self, product_id: i32) -> Result<Option<String>, ServiceError> {
            match product_id {
                1 => Ok(Some("Polo shirt".into())),
                2 => Err(ServiceError::ExternalServiceError("catalog down".into())),
                3 => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Some("never".into()))
                }
                _ => Ok(None),
            }
        }
    }

    #[tokio::test]
    async fn failures_degrade_to_placeholder() {
        let names =
            resolve_product_names(&FlakyLookup, &[1, 2, 3, 4, 1], Duration::from_millis(50)).await;
        assert_eq!(names.len(), 4);
        assert_eq!(names[&1], "Polo shirt");
        assert_eq!(names[&2], UNKNOWN_PRODUCT_NAME);
        assert_eq!(names[&3], UNKNOWN_PRODUCT_NAME);
        assert_eq!(names[&4], UNKNOWN_PRODUCT_NAME);
    }

    #[tokio::test]
    async fn document_references_resolve_against_base_url() {
        let store = UrlDocumentStore::new(Some("https://files.example.com/invoices/".into()));
        assert_eq!(
            store.store("/2024/f-0001.pdf").await.unwrap(),
            "https://files.example.com/invoices/2024/f-0001.pdf"
        );
        assert_eq!(
            store.store("https://cdn.example.com/x.pdf").await.unwrap(),
            "https://cdn.example.com/x.pdf"
        );
        assert!(store.store("  ").await.is_err());

        let bare = UrlDocumentStore::default();
        assert_eq!(bare.store("f.pdf").await.unwrap(), "f.pdf");
    }
}
