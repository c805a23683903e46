//! Booking status transitions and the side effects attached to them.
//!
//! The CRM is the source of truth for status, so any target status is
//! accepted, including backward moves. Side effects fire only when the status
//! genuinely changes; re-applying the current status yields an empty diff.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::booking::{Booking, BookingStatus};
use crate::stages::DerivedFields;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingAction {
    CreateDeliveryTask,
    CreateReturnInspectionTask,
}

impl BookingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateDeliveryTask => "create_delivery_task",
            Self::CreateReturnInspectionTask => "create_return_inspection_task",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create_delivery_task" => Some(Self::CreateDeliveryTask),
            "create_return_inspection_task" => Some(Self::CreateReturnInspectionTask),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: BookingStatus,
    pub to: BookingStatus,
    pub changed: bool,
    pub backward: bool,
    pub fields_changed: bool,
    pub actions: Vec<BookingAction>,
}

impl TransitionOutcome {
    pub fn is_noop(&self) -> bool {
        !self.changed && !self.fields_changed
    }
}

#[derive(Clone, Debug, Default)]
pub struct BookingLifecycle;

impl BookingLifecycle {
    pub fn actions_on_enter(status: BookingStatus) -> Vec<BookingAction> {
        match status {
            BookingStatus::Delivery => vec![BookingAction::CreateDeliveryTask],
            BookingStatus::Settlement => vec![BookingAction::CreateReturnInspectionTask],
            BookingStatus::New | BookingStatus::Preparation | BookingStatus::InRent => Vec::new(),
        }
    }

    /// Applies `target` and the derived fields to `booking` in place and
    /// reports what changed.
    pub fn apply(
        &self,
        booking: &mut Booking,
        target: BookingStatus,
        derived: &DerivedFields,
        now: DateTime<Utc>,
    ) -> TransitionOutcome {
        let from = booking.status;
        let changed = from != target;

        let mut fields_changed = false;
        if let Some(advance) = derived.advance_payment {
            if booking.advance_payment != advance {
                booking.advance_payment = advance;
                fields_changed = true;
            }
        }

        let actions = if changed { Self::actions_on_enter(target) } else { Vec::new() };
        if changed {
            booking.status = target;
        }
        if changed || fields_changed {
            booking.updated_at = now;
        }

        TransitionOutcome {
            from,
            to: target,
            changed,
            backward: target.rank() < from.rank(),
            fields_changed,
            actions,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::{BookingAction, BookingLifecycle};
    use crate::domain::booking::{Booking, BookingId, BookingStatus};
    use crate::stages::DerivedFields;

    fn booking(status: BookingStatus) -> Booking {
        let mut booking = Booking::new(BookingId("B-1".to_string()), "BK-1", Utc::now());
        booking.status = status;
        booking
    }

    #[test]
    fn entering_delivery_spawns_delivery_task_once() {
        let lifecycle = BookingLifecycle;
        let mut booking = booking(BookingStatus::Preparation);

        let first = lifecycle.apply(
            &mut booking,
            BookingStatus::Delivery,
            &DerivedFields::default(),
            Utc::now(),
        );
        assert!(first.changed);
        assert_eq!(first.actions, vec![BookingAction::CreateDeliveryTask]);

        let second = lifecycle.apply(
            &mut booking,
            BookingStatus::Delivery,
            &DerivedFields::default(),
            Utc::now(),
        );
        assert!(second.is_noop());
        assert!(second.actions.is_empty());
    }

    #[test]
    fn backward_moves_are_applied_and_flagged() {
        let lifecycle = BookingLifecycle;
        let mut booking = booking(BookingStatus::InRent);

        let outcome =
            lifecycle.apply(&mut booking, BookingStatus::New, &DerivedFields::default(), Utc::now());

        assert!(outcome.changed);
        assert!(outcome.backward);
        assert_eq!(booking.status, BookingStatus::New);
    }

    #[test]
    fn advance_payment_is_derived_without_status_change() {
        let lifecycle = BookingLifecycle;
        let mut booking = booking(BookingStatus::Preparation);
        let derived = DerivedFields {
            advance_payment: Some(Decimal::new(500, 0)),
            requires_provisioning: true,
        };

        let outcome = lifecycle.apply(&mut booking, BookingStatus::Preparation, &derived, Utc::now());

        assert!(!outcome.changed);
        assert!(outcome.fields_changed);
        assert!(outcome.actions.is_empty());
        assert_eq!(booking.advance_payment, Decimal::new(500, 0));
    }
}
