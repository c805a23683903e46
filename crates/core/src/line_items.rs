//! Deterministic construction of accounting order lines.
//!
//! Output depends only on the booking and its service rows, so the update
//! path can rebuild the lines of an existing order and get byte-identical
//! results for unchanged input.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::booking::{Booking, BookingService};
use crate::domain::order::{LineKind, OrderLineItem, OrderPayload};

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositTreatment {
    /// Held and returned; booked without tax.
    Refundable,
    /// Non-refundable insurance charge; taxed like rental revenue.
    Taxable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeeRules {
    deposit_labels: BTreeMap<String, DepositTreatment>,
    default_treatment: DepositTreatment,
}

impl FeeRules {
    pub fn new(
        labels: impl IntoIterator<Item = (String, DepositTreatment)>,
        default_treatment: DepositTreatment,
    ) -> Self {
        let deposit_labels =
            labels.into_iter().map(|(label, treatment)| (normalize(&label), treatment)).collect();
        Self { deposit_labels, default_treatment }
    }

    pub fn treatment_for(&self, label: Option<&str>) -> DepositTreatment {
        label
            .map(normalize)
            .and_then(|label| self.deposit_labels.get(&label).copied())
            .unwrap_or(self.default_treatment)
    }
}

impl Default for FeeRules {
    fn default() -> Self {
        Self::new(
            [
                ("deposit".to_string(), DepositTreatment::Refundable),
                ("security deposit".to_string(), DepositTreatment::Refundable),
                ("franchise".to_string(), DepositTreatment::Refundable),
                ("deposit waiver".to_string(), DepositTreatment::Taxable),
                ("insurance".to_string(), DepositTreatment::Taxable),
                ("full insurance".to_string(), DepositTreatment::Taxable),
            ],
            DepositTreatment::Refundable,
        )
    }
}

fn normalize(label: &str) -> String {
    label.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Whole rental days, rounded up, never less than one.
pub fn rental_days(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> i64 {
    match (start, end) {
        (Some(start), Some(end)) => {
            let seconds = (end - start).num_seconds();
            let days = (seconds + SECONDS_PER_DAY - 1).div_euclid(SECONDS_PER_DAY);
            days.max(1)
        }
        _ => 1,
    }
}

pub fn build_line_items(
    booking: &Booking,
    services: &[BookingService],
    rules: &FeeRules,
) -> Vec<OrderLineItem> {
    let mut lines = Vec::with_capacity(services.len() + 4);
    let days = rental_days(booking.start_at, booking.end_at);
    let vehicle = booking.vehicle_plate.as_deref().unwrap_or("vehicle");

    if booking.daily_rate > Decimal::ZERO {
        lines.push(OrderLineItem {
            kind: LineKind::Rental,
            description: format!("Rental {vehicle}, {days} day(s)"),
            quantity: Decimal::from(days),
            unit_price: booking.daily_rate,
            taxable: true,
        });
    } else if booking.total_amount > Decimal::ZERO {
        lines.push(OrderLineItem {
            kind: LineKind::Rental,
            description: format!("Rental {vehicle}, {days} day(s)"),
            quantity: Decimal::ONE,
            unit_price: booking.total_amount,
            taxable: true,
        });
    }

    for service in services {
        if service.quantity <= Decimal::ZERO {
            continue;
        }
        lines.push(OrderLineItem {
            kind: LineKind::Service,
            description: service.name.trim().to_string(),
            quantity: service.quantity,
            unit_price: service.unit_price,
            taxable: true,
        });
    }

    if let Some(fee) = booking.delivery_fee {
        let route = match (&booking.pickup_location, &booking.dropoff_location) {
            (Some(pickup), Some(dropoff)) => format!("Delivery {pickup} / {dropoff}"),
            (Some(location), None) | (None, Some(location)) => format!("Delivery {location}"),
            (None, None) => "Delivery".to_string(),
        };
        lines.push(OrderLineItem {
            kind: LineKind::DeliveryFee,
            description: route,
            quantity: Decimal::ONE,
            unit_price: fee,
            taxable: true,
        });
    }

    if let Some(amount) = booking.deposit_amount {
        let label = booking.deposit_label.as_deref();
        let line = match rules.treatment_for(label) {
            DepositTreatment::Refundable => OrderLineItem {
                kind: LineKind::RefundableDeposit,
                description: label.unwrap_or("Deposit").trim().to_string(),
                quantity: Decimal::ONE,
                unit_price: amount,
                taxable: false,
            },
            DepositTreatment::Taxable => OrderLineItem {
                kind: LineKind::InsuranceFee,
                description: label.unwrap_or("Insurance").trim().to_string(),
                quantity: Decimal::ONE,
                unit_price: amount,
                taxable: true,
            },
        };
        lines.push(line);
    }

    if let Some(fee) = booking.cdw_fee {
        lines.push(OrderLineItem {
            kind: LineKind::CdwInsurance,
            description: "CDW insurance".to_string(),
            quantity: Decimal::ONE,
            unit_price: fee,
            taxable: true,
        });
    }

    lines
}

pub fn build_order_payload(
    booking: &Booking,
    customer_id: &str,
    services: &[BookingService],
    rules: &FeeRules,
) -> OrderPayload {
    let mut custom_fields = BTreeMap::new();
    custom_fields.insert("booking_code".to_string(), booking.code.clone());
    let optional = [
        ("crm_lead_id", booking.external_ref.clone()),
        ("vehicle_plate", booking.vehicle_plate.clone()),
        ("pickup_location", booking.pickup_location.clone()),
        ("dropoff_location", booking.dropoff_location.clone()),
        ("rental_start", booking.start_at.map(|value| value.to_rfc3339())),
        ("rental_end", booking.end_at.map(|value| value.to_rfc3339())),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            custom_fields.insert(key.to_string(), value);
        }
    }

    OrderPayload {
        customer_id: customer_id.to_string(),
        reference: booking.code.clone(),
        currency: booking.currency.clone(),
        draft: true,
        lines: build_line_items(booking, services, rules),
        custom_fields,
    }
}
