//! Maps CRM pipeline stages onto booking statuses.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::booking::BookingStatus;
use crate::fields::{self, LeadFieldMap};

pub const STAGE_SALES_ORDER_REQUESTED: &str = "sales_order_requested";
pub const STAGE_PAYMENT_PENDING: &str = "payment_pending";
pub const STAGE_CONFIRMED: &str = "confirmed";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRule {
    pub stage_id: String,
    pub status: BookingStatus,
    #[serde(default)]
    pub requires_provisioning: bool,
}

impl StageRule {
    fn new(stage_id: &str, status: BookingStatus, requires_provisioning: bool) -> Self {
        Self { stage_id: stage_id.to_string(), status, requires_provisioning }
    }
}

/// Built-in pipeline layout. Deployments override ids through configuration.
pub fn default_stage_rules() -> Vec<StageRule> {
    vec![
        StageRule::new("incoming", BookingStatus::New, false),
        StageRule::new("qualified", BookingStatus::New, false),
        StageRule::new(STAGE_SALES_ORDER_REQUESTED, BookingStatus::Preparation, true),
        StageRule::new(STAGE_PAYMENT_PENDING, BookingStatus::Preparation, false),
        StageRule::new(STAGE_CONFIRMED, BookingStatus::Preparation, false),
        StageRule::new("vehicle_delivery", BookingStatus::Delivery, false),
        StageRule::new("in_rent", BookingStatus::InRent, false),
        StageRule::new("vehicle_returned", BookingStatus::Settlement, false),
        StageRule::new("closed_won", BookingStatus::Settlement, false),
    ]
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DerivedFields {
    pub advance_payment: Option<Decimal>,
    pub requires_provisioning: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageMapping {
    /// Recorded for audit, no state change.
    NoOp { reason: String },
    Transition { status: BookingStatus, derived: DerivedFields },
}

impl StageMapping {
    pub fn requires_provisioning(&self) -> bool {
        matches!(self, Self::Transition { derived, .. } if derived.requires_provisioning)
    }
}

#[derive(Clone, Debug)]
pub struct StageMapper {
    pipeline_id: Option<String>,
    rules: HashMap<String, StageRule>,
    fields: LeadFieldMap,
}

impl StageMapper {
    pub fn new(
        pipeline_id: Option<String>,
        rules: impl IntoIterator<Item = StageRule>,
        fields: LeadFieldMap,
    ) -> Self {
        let rules = rules.into_iter().map(|rule| (rule.stage_id.clone(), rule)).collect();
        Self { pipeline_id, rules, fields }
    }

    pub fn fields(&self) -> &LeadFieldMap {
        &self.fields
    }

    pub fn status_for(&self, stage_id: &str) -> Option<BookingStatus> {
        self.rules.get(stage_id.trim()).map(|rule| rule.status)
    }

    /// Pure mapping of a stage change. Stage ids outside the table, or events
    /// from a different pipeline, map to [`StageMapping::NoOp`].
    pub fn map_stage(
        &self,
        pipeline_id: Option<&str>,
        stage_id: &str,
        lead_fields: &Value,
    ) -> StageMapping {
        if let (Some(expected), Some(actual)) = (self.pipeline_id.as_deref(), pipeline_id) {
            if expected != actual.trim() {
                return StageMapping::NoOp {
                    reason: format!("pipeline `{actual}` is not synchronized"),
                };
            }
        }

        let Some(rule) = self.rules.get(stage_id.trim()) else {
            return StageMapping::NoOp { reason: format!("stage `{stage_id}` is not mapped") };
        };

        StageMapping::Transition {
            status: rule.status,
            derived: DerivedFields {
                advance_payment: fields::advance_payment(lead_fields, &self.fields),
                requires_provisioning: rule.requires_provisioning,
            },
        }
    }
}

impl Default for StageMapper {
    fn default() -> Self {
        Self::new(None, default_stage_rules(), LeadFieldMap::default())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::{StageMapper, StageMapping, STAGE_SALES_ORDER_REQUESTED};
    use crate::domain::booking::BookingStatus;
    use crate::fields::LeadFieldMap;

    #[test]
    fn sales_order_stage_requires_provisioning_and_reads_advance_payment() {
        let mapper = StageMapper::default();
        let lead_fields = json!([{ "field_id": "advance_payment", "values": [{ "value": 500 }] }]);

        let mapping = mapper.map_stage(None, STAGE_SALES_ORDER_REQUESTED, &lead_fields);

        let StageMapping::Transition { status, derived } = mapping else {
            panic!("expected a transition");
        };
        assert_eq!(status, BookingStatus::Preparation);
        assert!(derived.requires_provisioning);
        assert_eq!(derived.advance_payment, Some(Decimal::new(500, 0)));
    }

    #[test]
    fn unknown_stage_is_a_noop() {
        let mapping = StageMapper::default().map_stage(None, "archived_spam", &json!([]));
        assert!(matches!(mapping, StageMapping::NoOp { .. }));
        assert!(!mapping.requires_provisioning());
    }

    #[test]
    fn foreign_pipeline_is_a_noop() {
        let mapper = StageMapper::new(
            Some("P-RENT".to_string()),
            super::default_stage_rules(),
            LeadFieldMap::default(),
        );
        let mapping = mapper.map_stage(Some("P-SALES"), STAGE_SALES_ORDER_REQUESTED, &json!([]));
        assert!(matches!(mapping, StageMapping::NoOp { .. }));

        let mapping = mapper.map_stage(Some("P-RENT"), STAGE_SALES_ORDER_REQUESTED, &json!([]));
        assert!(mapping.requires_provisioning());
    }

    #[test]
    fn mapping_is_independent_of_call_history() {
        let mapper = StageMapper::default();
        let first = mapper.map_stage(None, "vehicle_returned", &json!([]));
        let backward = mapper.map_stage(None, "incoming", &json!([]));
        let again = mapper.map_stage(None, "vehicle_returned", &json!([]));

        assert_eq!(first, again);
        assert!(matches!(
            backward,
            StageMapping::Transition { status: BookingStatus::New, .. }
        ));
    }
}
