//! Fixed production sequence: which stage may follow which.

use crate::entities::Stage;
use crate::errors::ServiceError;

/// Legal successors of every stage. This is the only place transition rules live.
const TRANSITIONS: [(Stage, &[Stage]); 7] = [
    (Stage::Intake, &[Stage::Tracing]),
    (Stage::Tracing, &[Stage::Cutting]),
    (Stage::Cutting, &[Stage::Confection]),
    (Stage::Confection, &[Stage::Embroidery, Stage::Invoicing]),
    (Stage::Embroidery, &[Stage::Invoicing]),
    (Stage::Invoicing, &[Stage::Delivery]),
    (Stage::Delivery, &[]),
];

/// Stages whose output must be routed item by item.
const BIFURCATING: [Stage; 1] = [Stage::Confection];

pub fn successors(from: Stage) -> &'static [Stage] {
    TRANSITIONS
        .iter()
        .find(|(stage, _)| *stage == from)
        .map(|(_, next)| *next)
        .unwrap_or(&[])
}

pub fn is_valid_transition(from: Stage, to: Stage) -> bool {
    successors(from).contains(&to)
}

/// Allowed per-item targets when leaving `from`; empty for non-bifurcating stages.
pub fn bifurcation_targets(from: Stage) -> &'static [Stage] {
    if BIFURCATING.contains(&from) {
        successors(from)
    } else {
        &[]
    }
}

pub fn is_bifurcating(from: Stage) -> bool {
    !bifurcation_targets(from).is_empty()
}

/// Invoicing to delivery requires an invoice.
pub fn is_invoice_gated(from: Stage, to: Stage) -> bool {
    from == Stage::Invoicing && to == Stage::Delivery
}

/// Cutting to confection consumes the cut counter of the source rows.
pub fn consumes_cut_counter(from: Stage, to: Stage) -> bool {
    from == Stage::Cutting && to == Stage::Confection
}

/// Terminal stages have no successor; orders are completed from them.
pub fn is_terminal(stage: Stage) -> bool {
    successors(stage).is_empty()
}

/// Converts a raw stage number, surfacing unknown numbers as an invalid transition.
pub fn stage_from_number(number: i32) -> Result<Stage, ServiceError> {
    Stage::try_from(number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use sea_orm::Iterable;

    #[rstest]
    #[case(Stage::Intake, Stage::Tracing, true)]
    #[case(Stage::Cutting, Stage::Confection, true)]
    #[case(Stage::Confection, Stage::Embroidery, true)]
    #[case(Stage::Confection, Stage::Invoicing, true)]
    #[case(Stage::Embroidery, Stage::Invoicing, true)]
    #[case(Stage::Invoicing, Stage::Delivery, true)]
    #[case(Stage::Cutting, Stage::Embroidery, false)]
    #[case(Stage::Delivery, Stage::Intake, false)]
    #[case(Stage::Tracing, Stage::Tracing, false)]
    fn transition_table(#[case] from: Stage, #[case] to: Stage, #[case] expected: bool) {
        assert_eq!(is_valid_transition(from, to), expected);
    }

    #[test]
    fn only_confection_bifurcates() {
        for stage in Stage::iter() {
            let targets = bifurcation_targets(stage);
            if stage == Stage::Confection {
                assert_eq!(targets, &[Stage::Embroidery, Stage::Invoicing]);
            } else {
                assert!(targets.is_empty(), "{:?} should not bifurcate", stage);
            }
        }
    }

    #[test]
    fn delivery_is_the_only_terminal_stage() {
        let terminal: Vec<Stage> = Stage::iter().filter(|s| is_terminal(*s)).collect();
        assert_eq!(terminal, vec![Stage::Delivery]);
    }

    proptest! {
        #[test]
        fn transitions_only_move_forward(from in 1i32..=7, to in 1i32..=7) {
            let from = stage_from_number(from).unwrap();
            let to = stage_from_number(to).unwrap();
            if is_valid_transition(from, to) {
                prop_assert!(to.number() > from.number());
            }
        }

        #[test]
        fn unknown_stage_numbers_are_rejected(n in prop_oneof![i32::MIN..1i32, 8i32..i32::MAX]) {
            prop_assert!(matches!(
                stage_from_number(n),
                Err(ServiceError::InvalidTransition(_))
            ));
        }
    }
}
