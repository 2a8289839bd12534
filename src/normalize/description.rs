//! Decomposition of purchase-commitment item descriptions.
//!
//! Material purchases are exported as one free-text cell laid out as
//! `<quantity> <unit>` padded to 78 characters, followed by
//! `<item>,<rest> MARCA: <brand> ITEM DO PROCESSO: <n> ITEM DE MATERIAL: <m>`.

use rust_decimal::Decimal;

use crate::schema::coerce::parse_brazilian_decimal;

const HEAD_WIDTH: usize = 78;
const BRAND: &str = "MARCA:";
const PROCESS_ITEM: &str = "ITEM DO PROCESSO:";
const MATERIAL_ITEM: &str = "ITEM DE MATERIAL:";

/// Structured parts of a description. All-empty when the text does not decompose.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemDescription {
    pub quantity: Option<Decimal>,
    pub unit: String,
    pub item: String,
    pub remaining: String,
    pub brand: String,
    pub process_item: String,
    pub material_item: String,
}

impl ItemDescription {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Text before `marker`, or all of it when the marker is absent.
fn until<'a>(text: &'a str, marker: &str) -> &'a str {
    text.find(marker).map_or(text, |i| &text[..i])
}

/// Text after `marker`, or nothing when the marker is absent.
fn after<'a>(text: &'a str, marker: &str) -> &'a str {
    text.find(marker).map_or("", |i| &text[i + marker.len()..])
}

pub fn parse_description(text: &str) -> ItemDescription {
    if text.chars().count() < HEAD_WIDTH || !text.contains(BRAND) {
        return ItemDescription::default();
    }
    let split = text
        .char_indices()
        .nth(HEAD_WIDTH)
        .map_or(text.len(), |(i, _)| i);
    let (head, tail) = (text[..split].trim(), &text[split..]);

    let Ok(quantity) = parse_brazilian_decimal(until(head, " ").trim()) else {
        return ItemDescription::default();
    };

    let mut item = until(tail, ",");
    if item.len() >= 2 && item.starts_with('\'') && item.ends_with('\'') {
        item = &item[1..item.len() - 1];
    }
    let rest = after(tail, ",");
    let remaining = until(rest, BRAND).trim();
    let rest = after(rest, BRAND);
    let brand = until(rest, PROCESS_ITEM).trim();
    let rest = after(rest, PROCESS_ITEM);
    let process_item = until(rest, MATERIAL_ITEM).trim();
    let material_item = after(rest, MATERIAL_ITEM).trim();

    ItemDescription {
        quantity: Some(quantity),
        unit: after(head, " ").trim().to_string(),
        item: item.to_string(),
        remaining: remaining.to_string(),
        brand: brand.to_string(),
        process_item: process_item.to_string(),
        material_item: material_item.to_string(),
    }
}
