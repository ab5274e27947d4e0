use rust_decimal::Decimal;
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::costing;
use crate::errors::ValidationError;

/// Upper bound for any single numeric cost input.
pub const MAX_COST_INPUT: Decimal = Decimal::from_parts(1_000_000_000, 0, 0, false, 0);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MaterialCostInput")]
pub struct MaterialCost {
    description: String,
    quantity: Decimal,
    unit_rate: Decimal,
    total: Decimal,
}

impl MaterialCost {
    pub fn new(
        description: impl Into<String>,
        quantity: Decimal,
        unit_rate: Decimal,
    ) -> Result<Self, ValidationError> {
        ensure_cost_input("quantity", quantity)?;
        ensure_cost_input("unit_rate", unit_rate)?;
        Ok(Self {
            description: description.into(),
            quantity,
            unit_rate,
            total: costing::material_total(quantity, unit_rate),
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn unit_rate(&self) -> Decimal {
        self.unit_rate
    }

    pub fn total(&self) -> Decimal {
        self.total
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    pub fn set_quantity(&mut self, quantity: Decimal) -> Result<(), ValidationError> {
        ensure_cost_input("quantity", quantity)?;
        self.quantity = quantity;
        self.total = costing::material_total(self.quantity, self.unit_rate);
        Ok(())
    }

    pub fn set_unit_rate(&mut self, unit_rate: Decimal) -> Result<(), ValidationError> {
        ensure_cost_input("unit_rate", unit_rate)?;
        self.unit_rate = unit_rate;
        self.total = costing::material_total(self.quantity, self.unit_rate);
        Ok(())
    }
}

#[derive(Deserialize)]
struct MaterialCostInput {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    quantity: Option<Decimal>,
    #[serde(default, alias = "unitRate")]
    unit_rate: Option<Decimal>,
}

impl TryFrom<MaterialCostInput> for MaterialCost {
    type Error = ValidationError;

    fn try_from(input: MaterialCostInput) -> Result<Self, Self::Error> {
        Self::new(
            input.description.unwrap_or_default(),
            input.quantity.unwrap_or_default(),
            input.unit_rate.unwrap_or_default(),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LaborCostInput")]
pub struct LaborCost {
    description: String,
    hours: Decimal,
    hourly_rate: Decimal,
    total: Decimal,
}

impl LaborCost {
    pub fn new(
        description: impl Into<String>,
        hours: Decimal,
        hourly_rate: Decimal,
    ) -> Result<Self, ValidationError> {
        ensure_cost_input("hours", hours)?;
        ensure_cost_input("hourly_rate", hourly_rate)?;
        Ok(Self {
            description: description.into(),
            hours,
            hourly_rate,
            total: costing::labor_total(hours, hourly_rate),
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn hours(&self) -> Decimal {
        self.hours
    }

    pub fn hourly_rate(&self) -> Decimal {
        self.hourly_rate
    }

    pub fn total(&self) -> Decimal {
        self.total
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    pub fn set_hours(&mut self, hours: Decimal) -> Result<(), ValidationError> {
        ensure_cost_input("hours", hours)?;
        self.hours = hours;
        self.total = costing::labor_total(self.hours, self.hourly_rate);
        Ok(())
    }

    pub fn set_hourly_rate(&mut self, hourly_rate: Decimal) -> Result<(), ValidationError> {
        ensure_cost_input("hourly_rate", hourly_rate)?;
        self.hourly_rate = hourly_rate;
        self.total = costing::labor_total(self.hours, self.hourly_rate);
        Ok(())
    }
}

#[derive(Deserialize)]
struct LaborCostInput {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    hours: Option<Decimal>,
    #[serde(default, alias = "hourlyRate")]
    hourly_rate: Option<Decimal>,
}

impl TryFrom<LaborCostInput> for LaborCost {
    type Error = ValidationError;

    fn try_from(input: LaborCostInput) -> Result<Self, Self::Error> {
        Self::new(
            input.description.unwrap_or_default(),
            input.hours.unwrap_or_default(),
            input.hourly_rate.unwrap_or_default(),
        )
    }
}

/// Flat cost entry; the amount is its own total.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AdditionalCostInput")]
pub struct AdditionalCost {
    category: String,
    description: String,
    amount: Decimal,
}

impl AdditionalCost {
    pub fn new(
        category: impl Into<String>,
        description: impl Into<String>,
        amount: Decimal,
    ) -> Result<Self, ValidationError> {
        ensure_cost_input("amount", amount)?;
        Ok(Self { category: category.into(), description: description.into(), amount })
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn set_amount(&mut self, amount: Decimal) -> Result<(), ValidationError> {
        ensure_cost_input("amount", amount)?;
        self.amount = amount;
        Ok(())
    }
}

#[derive(Deserialize)]
struct AdditionalCostInput {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    amount: Option<Decimal>,
}

impl TryFrom<AdditionalCostInput> for AdditionalCost {
    type Error = ValidationError;

    fn try_from(input: AdditionalCostInput) -> Result<Self, Self::Error> {
        Self::new(
            input.category.unwrap_or_default(),
            input.description.unwrap_or_default(),
            input.amount.unwrap_or_default(),
        )
    }
}

/// Borrowed view over any of the three line kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CostLine<'a> {
    Material(&'a MaterialCost),
    Labor(&'a LaborCost),
    Additional(&'a AdditionalCost),
}

impl CostLine<'_> {
    pub fn description(&self) -> &str {
        match self {
            Self::Material(line) => line.description(),
            Self::Labor(line) => line.description(),
            Self::Additional(line) => line.description(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostSheet {
    #[serde(default, deserialize_with = "deserialize_cost_lines")]
    pub material_costs: Vec<MaterialCost>,
    #[serde(default, deserialize_with = "deserialize_cost_lines")]
    pub labor_costs: Vec<LaborCost>,
    #[serde(default, deserialize_with = "deserialize_cost_lines")]
    pub additional_costs: Vec<AdditionalCost>,
}

impl CostSheet {
    pub fn is_empty(&self) -> bool {
        self.material_costs.is_empty()
            && self.labor_costs.is_empty()
            && self.additional_costs.is_empty()
    }

    pub fn lines(&self) -> impl Iterator<Item = CostLine<'_>> {
        self.material_costs
            .iter()
            .map(CostLine::Material)
            .chain(self.labor_costs.iter().map(CostLine::Labor))
            .chain(self.additional_costs.iter().map(CostLine::Additional))
    }

    /// Re-checks every stored input; lines built through the constructors always pass.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for (index, line) in self.material_costs.iter().enumerate() {
            collect_error(&mut errors, "material_costs", index, "quantity", line.quantity());
            collect_error(&mut errors, "material_costs", index, "unit_rate", line.unit_rate());
        }
        for (index, line) in self.labor_costs.iter().enumerate() {
            collect_error(&mut errors, "labor_costs", index, "hours", line.hours());
            collect_error(&mut errors, "labor_costs", index, "hourly_rate", line.hourly_rate());
        }
        for (index, line) in self.additional_costs.iter().enumerate() {
            collect_error(&mut errors, "additional_costs", index, "amount", line.amount());
        }
        errors
    }
}

fn collect_error(
    errors: &mut Vec<String>,
    list: &str,
    index: usize,
    field: &str,
    value: Decimal,
) {
    if let Err(error) = ensure_cost_input(field, value) {
        errors.push(format!("{list}[{index}]: {error}"));
    }
}

pub fn ensure_cost_input(field: &str, value: Decimal) -> Result<(), ValidationError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(ValidationError::NegativeAmount { field: field.to_owned(), value });
    }
    if value > MAX_COST_INPUT {
        return Err(ValidationError::AmountTooLarge { field: field.to_owned(), value });
    }
    Ok(())
}

/// Cost arrays arrive either as JSON arrays or as JSON-encoded text; both decode to typed lines.
pub fn decode_cost_lines<T>(value: Option<Value>) -> Result<Vec<T>, ValidationError>
where
    T: DeserializeOwned,
{
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(text)) => {
            if text.trim().is_empty() {
                return Ok(Vec::new());
            }
            let parsed: Value = serde_json::from_str(&text)
                .map_err(|error| ValidationError::MalformedCostLines(error.to_string()))?;
            match parsed {
                Value::String(_) => Err(ValidationError::MalformedCostLines(
                    "cost lines are encoded more than once".to_owned(),
                )),
                other => decode_cost_lines(Some(other)),
            }
        }
        Some(array @ Value::Array(_)) => serde_json::from_value(array)
            .map_err(|error| ValidationError::MalformedCostLines(error.to_string())),
        Some(other) => Err(ValidationError::MalformedCostLines(format!(
            "expected an array of cost lines, found {}",
            json_kind(&other)
        ))),
    }
}

fn deserialize_cost_lines<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    decode_cost_lines(value).map_err(D::Error::custom)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
