use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::domain::cost::{AdditionalCost, CostLine, CostSheet, LaborCost, MaterialCost};

pub const MONEY_SCALE: u32 = 2;

pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

pub fn material_total(quantity: Decimal, unit_rate: Decimal) -> Decimal {
    round_money(quantity * unit_rate)
}

pub fn labor_total(hours: Decimal, hourly_rate: Decimal) -> Decimal {
    round_money(hours * hourly_rate)
}

/// Computed from the line's inputs, never from its cached total.
pub fn line_total(line: CostLine<'_>) -> Decimal {
    match line {
        CostLine::Material(line) => material_total(line.quantity(), line.unit_rate()),
        CostLine::Labor(line) => labor_total(line.hours(), line.hourly_rate()),
        CostLine::Additional(line) => round_money(line.amount()),
    }
}

pub fn category_subtotal<'a, I>(lines: I) -> Decimal
where
    I: IntoIterator<Item = CostLine<'a>>,
{
    lines.into_iter().map(line_total).sum()
}

pub fn material_subtotal(lines: &[MaterialCost]) -> Decimal {
    category_subtotal(lines.iter().map(CostLine::Material))
}

pub fn labor_subtotal(lines: &[LaborCost]) -> Decimal {
    category_subtotal(lines.iter().map(CostLine::Labor))
}

pub fn additional_subtotal(lines: &[AdditionalCost]) -> Decimal {
    category_subtotal(lines.iter().map(CostLine::Additional))
}

/// The authoritative price impact of a cost sheet.
pub fn grand_total(sheet: &CostSheet) -> Decimal {
    material_subtotal(&sheet.material_costs)
        + labor_subtotal(&sheet.labor_costs)
        + additional_subtotal(&sheet.additional_costs)
}

/// Display-only rendering; never parse this back into an amount.
pub fn format_amount(amount: Decimal, currency: &str) -> String {
    let rounded = round_money(amount);
    let sign = if rounded.is_sign_negative() && !rounded.is_zero() { "-" } else { "" };
    format!("{currency} {sign}{:.2}", rounded.abs())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostTraceStep {
    pub stage: String,
    pub detail: String,
    pub amount: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub currency: String,
    pub material_subtotal: Decimal,
    pub labor_subtotal: Decimal,
    pub additional_subtotal: Decimal,
    pub price_impact: Decimal,
    pub trace: Vec<CostTraceStep>,
}

pub trait CostingEngine: Send + Sync {
    fn breakdown(&self, sheet: &CostSheet, currency: &str) -> CostBreakdown;
}

#[derive(Clone, Debug, Default)]
pub struct DeterministicCostingEngine;

impl CostingEngine for DeterministicCostingEngine {
    fn breakdown(&self, sheet: &CostSheet, currency: &str) -> CostBreakdown {
        breakdown_with_trace(sheet, currency)
    }
}

pub fn breakdown_with_trace(sheet: &CostSheet, currency: &str) -> CostBreakdown {
    let material_subtotal = material_subtotal(&sheet.material_costs);
    let labor_subtotal = labor_subtotal(&sheet.labor_costs);
    let additional_subtotal = additional_subtotal(&sheet.additional_costs);
    let price_impact = material_subtotal + labor_subtotal + additional_subtotal;

    CostBreakdown {
        currency: currency.to_owned(),
        material_subtotal,
        labor_subtotal,
        additional_subtotal,
        price_impact,
        trace: vec![
            CostTraceStep {
                stage: "materials".to_owned(),
                detail: format!("sum(quantity * unit_rate) over {} lines", sheet.material_costs.len()),
                amount: material_subtotal,
            },
            CostTraceStep {
                stage: "labor".to_owned(),
                detail: format!("sum(hours * hourly_rate) over {} lines", sheet.labor_costs.len()),
                amount: labor_subtotal,
            },
            CostTraceStep {
                stage: "additional".to_owned(),
                detail: format!("sum(amount) over {} lines", sheet.additional_costs.len()),
                amount: additional_subtotal,
            },
            CostTraceStep {
                stage: "price_impact".to_owned(),
                detail: "materials + labor + additional".to_owned(),
                amount: price_impact,
            },
        ],
    }
}
