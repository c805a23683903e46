use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Identity data sent when the accounting system has no matching customer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub tax_id: Option<String>,
    pub tax_id_type: Option<String>,
    pub address: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Rental,
    Service,
    DeliveryFee,
    RefundableDeposit,
    InsuranceFee,
    CdwInsurance,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLineItem {
    pub kind: LineKind,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub taxable: bool,
}

impl OrderLineItem {
    pub fn amount(&self) -> Decimal {
        self.quantity * self.unit_price
    }
}

/// Draft sales order as submitted to the accounting system.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPayload {
    pub customer_id: String,
    pub reference: String,
    pub currency: String,
    pub draft: bool,
    pub lines: Vec<OrderLineItem>,
    pub custom_fields: BTreeMap<String, String>,
}

impl OrderPayload {
    pub fn total(&self) -> Decimal {
        self.lines.iter().map(OrderLineItem::amount).sum()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedOrder {
    pub order_id: String,
    pub order_url: String,
}
