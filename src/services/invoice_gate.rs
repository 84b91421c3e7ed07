use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ActiveValue::Set, ColumnTrait, ConnectionTrait,
    EntityTrait, QueryFilter, QuerySelect, SqlErr,
};
use tracing::debug;

use crate::{
    dto::production::InvoiceData,
    entities::{
        invoice::{self, Entity as InvoiceEntity},
        invoice_allocation::{self, Entity as InvoiceAllocationEntity},
    },
    errors::ServiceError,
};

/// Invoice issuance for the invoicing → delivery transition.
pub struct InvoiceGate;

impl InvoiceGate {
    /// Invoice data must carry a non-blank number and document reference.
    pub fn require_invoice_data(
        invoice: Option<&InvoiceData>,
    ) -> Result<&InvoiceData, ServiceError> {
        let invoice = invoice.ok_or_else(|| {
            ServiceError::InvoiceDataRequired("invoice number and document are required".into())
        })?;
        if invoice.number.trim().is_empty() {
            return Err(ServiceError::InvoiceDataRequired(
                "invoice number is blank".into(),
            ));
        }
        if invoice.document_url.trim().is_empty() {
            return Err(ServiceError::InvoiceDataRequired(
                "proof-of-invoice document is missing".into(),
            ));
        }
        Ok(invoice)
    }

    /// Creates the invoice inside the caller's transaction.
    ///
    /// The existence check locks, and a unique violation on insert covers the
    /// race with a concurrent issuer of the same number. Lock contention stays a
    /// retryable [`ServiceError::Conflict`].
    pub async fn issue_invoice<C: ConnectionTrait>(
        conn: &C,
        number: &str,
        document_url: &str,
        notes: Option<&str>,
    ) -> Result<invoice::Model, ServiceError> {
        let number = number.trim();
        let existing = InvoiceEntity::find()
            .filter(invoice::Column::Number.eq(number))
            .lock_exclusive()
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?;
        if existing.is_some() {
            return Err(ServiceError::DuplicateInvoiceNumber(number.to_string()));
        }

        invoice::ActiveModel {
            id: NotSet,
            number: Set(number.to_string()),
            document_url: Set(document_url.to_string()),
            notes: Set(notes.map(str::to_string)),
            created_at: Set(Utc::now()),
        }
        .insert(conn)
        .await
        .map_err(|e| match e.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => {
                ServiceError::DuplicateInvoiceNumber(number.to_string())
            }
            _ => ServiceError::db_error(e),
        })
    }

    /// Records that `invoice_id` covers `allocation_id`. Repeated calls are no-ops.
    pub async fn link_allocation<C: ConnectionTrait>(
        conn: &C,
        invoice_id: i32,
        allocation_id: i32,
    ) -> Result<(), ServiceError> {
        let existing = InvoiceAllocationEntity::find()
            .filter(invoice_allocation::Column::InvoiceId.eq(invoice_id))
            .filter(invoice_allocation::Column::AllocationId.eq(allocation_id))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?;
        if existing.is_some() {
            return Ok(());
        }

        invoice_allocation::ActiveModel {
            id: NotSet,
            invoice_id: Set(invoice_id),
            allocation_id: Set(allocation_id),
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)?;
        debug!(invoice_id, allocation_id, "Invoice linked to allocation");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn data(number: &str, document_url: &str) -> InvoiceData {
        InvoiceData {
            number: number.into(),
            document_url: document_url.into(),
            notes: None,
        }
    }

    #[test]
    fn missing_invoice_data_is_rejected() {
        assert_matches!(
            InvoiceGate::require_invoice_data(None),
            Err(ServiceError::InvoiceDataRequired(_))
        );
    }

    #[test]
    fn blank_fields_are_rejected() {
        let blank_number = data("  ", "uploads/f-1.pdf");
        assert_matches!(
            InvoiceGate::require_invoice_data(Some(&blank_number)),
            Err(ServiceError::InvoiceDataRequired(_))
        );
        let blank_document = data("F-0001", "");
        assert_matches!(
            InvoiceGate::require_invoice_data(Some(&blank_document)),
            Err(ServiceError::InvoiceDataRequired(_))
        );
    }

    #[test]
    fn complete_data_passes() {
        let complete = data("F-0001", "uploads/f-1.pdf");
        assert!(InvoiceGate::require_invoice_data(Some(&complete)).is_ok());
    }
}
