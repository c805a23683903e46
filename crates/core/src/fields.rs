//! Typed extraction of loosely structured CRM custom fields.
//!
//! Leads carry `custom_fields` as a list of `{ "field_id": .., "values": [{ "value": .. }] }`
//! objects. Every accessor tolerates a missing field, an empty value list, or a
//! value of the wrong JSON type and returns `None` instead of failing.

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// CRM custom-field ids the engine reads from and writes to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeadFieldMap {
    pub advance_payment: String,
    pub daily_rate: String,
    pub currency: String,
    pub start_at: String,
    pub end_at: String,
    pub pickup_location: String,
    pub dropoff_location: String,
    pub vehicle_plate: String,
    pub delivery_fee: String,
    pub deposit_amount: String,
    pub deposit_label: String,
    pub cdw_fee: String,
    pub order_url: String,
    pub booking_code: String,
}

impl Default for LeadFieldMap {
    fn default() -> Self {
        Self {
            advance_payment: "advance_payment".to_string(),
            daily_rate: "daily_rate".to_string(),
            currency: "currency".to_string(),
            start_at: "rental_start".to_string(),
            end_at: "rental_end".to_string(),
            pickup_location: "pickup_location".to_string(),
            dropoff_location: "dropoff_location".to_string(),
            vehicle_plate: "vehicle_plate".to_string(),
            delivery_fee: "delivery_fee".to_string(),
            deposit_amount: "deposit_amount".to_string(),
            deposit_label: "deposit_label".to_string(),
            cdw_fee: "cdw_fee".to_string(),
            order_url: "order_url".to_string(),
            booking_code: "booking_code".to_string(),
        }
    }
}

/// Everything the engine understands about a lead, pulled out of its custom fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeadSnapshot {
    pub advance_payment: Option<Decimal>,
    pub daily_rate: Option<Decimal>,
    pub currency: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub pickup_location: Option<String>,
    pub dropoff_location: Option<String>,
    pub vehicle_plate: Option<String>,
    pub delivery_fee: Option<Decimal>,
    pub deposit_amount: Option<Decimal>,
    pub deposit_label: Option<String>,
    pub cdw_fee: Option<Decimal>,
}

impl LeadSnapshot {
    pub fn extract(custom_fields: &Value, map: &LeadFieldMap) -> Self {
        Self {
            advance_payment: advance_payment(custom_fields, map),
            daily_rate: decimal_field(custom_fields, &map.daily_rate),
            currency: text_field(custom_fields, &map.currency).map(|value| value.to_uppercase()),
            start_at: timestamp_field(custom_fields, &map.start_at),
            end_at: timestamp_field(custom_fields, &map.end_at),
            pickup_location: text_field(custom_fields, &map.pickup_location),
            dropoff_location: text_field(custom_fields, &map.dropoff_location),
            vehicle_plate: vehicle_plate(custom_fields, map),
            delivery_fee: positive(decimal_field(custom_fields, &map.delivery_fee)),
            deposit_amount: positive(decimal_field(custom_fields, &map.deposit_amount)),
            deposit_label: text_field(custom_fields, &map.deposit_label),
            cdw_fee: positive(decimal_field(custom_fields, &map.cdw_fee)),
        }
    }
}

pub fn advance_payment(custom_fields: &Value, map: &LeadFieldMap) -> Option<Decimal> {
    decimal_field(custom_fields, &map.advance_payment).filter(|value| *value >= Decimal::ZERO)
}

pub fn vehicle_plate(custom_fields: &Value, map: &LeadFieldMap) -> Option<String> {
    text_field(custom_fields, &map.vehicle_plate)
        .map(|plate| plate.split_whitespace().collect::<String>().to_uppercase())
        .filter(|plate| !plate.is_empty())
}

/// First value of a custom field, if present.
pub fn field_value<'a>(custom_fields: &'a Value, field_id: &str) -> Option<&'a Value> {
    custom_fields.as_array()?.iter().find_map(|field| {
        let id = field.get("field_id")?;
        let matches = match id {
            Value::String(raw) => raw == field_id,
            Value::Number(number) => number.to_string() == field_id,
            _ => false,
        };
        if !matches {
            return None;
        }
        field.get("values")?.as_array()?.first()?.get("value")
    })
}

pub fn text_field(custom_fields: &Value, field_id: &str) -> Option<String> {
    match field_value(custom_fields, field_id)? {
        Value::String(raw) => Some(raw.trim().to_string()).filter(|value| !value.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

pub fn decimal_field(custom_fields: &Value, field_id: &str) -> Option<Decimal> {
    match field_value(custom_fields, field_id)? {
        Value::Number(number) => Decimal::from_str(&number.to_string()).ok(),
        Value::String(raw) => parse_money(raw),
        _ => None,
    }
}

/// Accepts unix seconds (number or numeric string) or RFC 3339 text.
pub fn timestamp_field(custom_fields: &Value, field_id: &str) -> Option<DateTime<Utc>> {
    match field_value(custom_fields, field_id)? {
        Value::Number(number) => number.as_i64().and_then(from_unix),
        Value::String(raw) => {
            let raw = raw.trim();
            if let Ok(seconds) = raw.parse::<i64>() {
                return from_unix(seconds);
            }
            DateTime::parse_from_rfc3339(raw).ok().map(|value| value.with_timezone(&Utc))
        }
        _ => None,
    }
}

fn from_unix(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}

fn positive(value: Option<Decimal>) -> Option<Decimal> {
    value.filter(|amount| *amount > Decimal::ZERO)
}

/// Parses "1 250,50", "1250.50 EUR", "€300" and similar operator-typed amounts.
fn parse_money(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|ch| ch.is_ascii_digit() || matches!(ch, '.' | ',' | '-'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) => cleaned.replace(',', "."),
        _ => cleaned,
    };
    Decimal::from_str(&normalized).ok()
}
