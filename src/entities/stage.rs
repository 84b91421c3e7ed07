use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;

/// Manufacturing stage, stored as its position in the production sequence.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "i32", db_type = "Integer")]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[sea_orm(num_value = 1)]
    #[strum(serialize = "Ingreso")]
    Intake,
    #[sea_orm(num_value = 2)]
    #[strum(serialize = "Trazado")]
    Tracing,
    #[sea_orm(num_value = 3)]
    #[strum(serialize = "Corte")]
    Cutting,
    #[sea_orm(num_value = 4)]
    #[strum(serialize = "Confección")]
    Confection,
    #[sea_orm(num_value = 5)]
    #[strum(serialize = "Bordado")]
    Embroidery,
    #[sea_orm(num_value = 6)]
    #[strum(serialize = "Facturación")]
    Invoicing,
    #[sea_orm(num_value = 7)]
    #[strum(serialize = "Entrega")]
    Delivery,
}

impl Stage {
    /// Position of the stage in the production sequence (1-based).
    pub fn number(self) -> i32 {
        match self {
            Stage::Intake => 1,
            Stage::Tracing => 2,
            Stage::Cutting => 3,
            Stage::Confection => 4,
            Stage::Embroidery => 5,
            Stage::Invoicing => 6,
            Stage::Delivery => 7,
        }
    }

    /// Shop-floor name used in audit snapshots and history views.
    pub fn display_name(self) -> String {
        self.to_string()
    }
}

impl TryFrom<i32> for Stage {
    type Error = ServiceError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Stage::Intake),
            2 => Ok(Stage::Tracing),
            3 => Ok(Stage::Cutting),
            4 => Ok(Stage::Confection),
            5 => Ok(Stage::Embroidery),
            6 => Ok(Stage::Invoicing),
            7 => Ok(Stage::Delivery),
            other => Err(ServiceError::InvalidTransition(format!(
                "unknown stage {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::Iterable;

    #[test]
    fn numbers_round_trip_through_try_from() {
        for stage in Stage::iter() {
            assert_eq!(Stage::try_from(stage.number()).unwrap(), stage);
        }
        assert!(Stage::try_from(0).is_err());
        assert!(Stage::try_from(8).is_err());
    }

    #[test]
    fn display_names_are_shop_floor_terms() {
        assert_eq!(Stage::Confection.display_name(), "Confección");
        assert_eq!(Stage::Invoicing.to_string(), "Facturación");
    }
}
