use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::costing;
use crate::domain::attachment::FileId;
use crate::domain::cost::CostSheet;
use crate::errors::ValidationError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariationId(pub String);

impl fmt::Display for VariationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VariationNumber(pub u32);

impl fmt::Display for VariationNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub String);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WorkType {
    Civil,
    Hvac,
    Joinery,
    Electrical,
    Plumbing,
    General,
}

impl WorkType {
    pub const ALL: [WorkType; 6] = [
        Self::Civil,
        Self::Hvac,
        Self::Joinery,
        Self::Electrical,
        Self::Plumbing,
        Self::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Civil => "Civil",
            Self::Hvac => "HVAC",
            Self::Joinery => "Joinery",
            Self::Electrical => "Electrical",
            Self::Plumbing => "Plumbing",
            Self::General => "General",
        }
    }
}

impl FromStr for WorkType {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(raw.trim()))
            .ok_or_else(|| ValidationError::UnknownWorkType(raw.to_owned()))
    }
}

impl TryFrom<String> for WorkType {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WorkType> for String {
    fn from(value: WorkType) -> Self {
        value.as_str().to_owned()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChangeCategory {
    Schedule,
    Cost,
    Scope,
    Quality,
    Resources,
    Deliverables,
}

impl ChangeCategory {
    pub const ALL: [ChangeCategory; 6] = [
        Self::Schedule,
        Self::Cost,
        Self::Scope,
        Self::Quality,
        Self::Resources,
        Self::Deliverables,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schedule => "Schedule",
            Self::Cost => "Cost",
            Self::Scope => "Scope",
            Self::Quality => "Quality",
            Self::Resources => "Resources",
            Self::Deliverables => "Deliverables",
        }
    }
}

impl FromStr for ChangeCategory {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(raw.trim()))
            .ok_or_else(|| ValidationError::UnknownCategory(raw.to_owned()))
    }
}

impl TryFrom<String> for ChangeCategory {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChangeCategory> for String {
    fn from(value: ChangeCategory) -> Self {
        value.as_str().to_owned()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariationStatus {
    Draft,
    Submitted,
    UnderReview,
    Approved,
    Declined,
    Deferred,
}

impl VariationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::UnderReview => "under_review",
            Self::Approved => "approved",
            Self::Declined => "declined",
            Self::Deferred => "deferred",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "submitted" => Some(Self::Submitted),
            "under_review" | "underreview" => Some(Self::UnderReview),
            "approved" => Some(Self::Approved),
            "declined" => Some(Self::Declined),
            "deferred" => Some(Self::Deferred),
            _ => None,
        }
    }

    pub fn is_awaiting_decision(&self) -> bool {
        matches!(self, Self::Submitted | Self::UnderReview)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Declined | Self::Deferred)
    }
}

/// The submitting side's recommendation; never drives `status` on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Approve,
    Reject,
    Defer,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Defer => "defer",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            "defer" => Some(Self::Defer),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientDecision {
    Approve,
    Decline,
}

impl ClientDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Decline => "decline",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision: ClientDecision,
    pub comment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VariationDetails {
    pub title: String,
    pub change_description: String,
    pub reason_description: String,
    pub technical_changes: String,
    pub change_requestor: String,
    pub change_reference: String,
    pub change_area: String,
}

/// Manager-authored input for creating or revising a variation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftVariation {
    pub project_id: ProjectId,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub details: VariationDetails,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub work_types: BTreeSet<WorkType>,
    #[serde(default)]
    pub categories: BTreeSet<ChangeCategory>,
    #[serde(default)]
    pub costs: CostSheet,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub time_impact_days: i32,
}

impl DraftVariation {
    pub fn new(project_id: ProjectId, details: VariationDetails) -> Self {
        Self {
            project_id,
            client_id: None,
            details,
            date: None,
            work_types: BTreeSet::new(),
            categories: BTreeSet::new(),
            costs: CostSheet::default(),
            currency: None,
            time_impact_days: 0,
        }
    }

    pub fn missing_required_fields(&self) -> Vec<String> {
        let required = [
            ("project_id", self.project_id.0.as_str()),
            ("change_requestor", self.details.change_requestor.as_str()),
            ("change_description", self.details.change_description.as_str()),
            ("reason_description", self.details.reason_description.as_str()),
        ];
        required
            .into_iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(field, _)| field.to_owned())
            .collect()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let missing = self.missing_required_fields();
        if !missing.is_empty() {
            return Err(ValidationError::MissingRequiredFields(missing));
        }
        if let Some(currency) = &self.currency {
            normalize_currency(currency)?;
        }
        if let Some(first) = self.costs.validation_errors().into_iter().next() {
            return Err(ValidationError::MalformedCostLines(first));
        }
        Ok(())
    }

    pub fn resolved_currency(&self, default_currency: &str) -> Result<String, ValidationError> {
        normalize_currency(self.currency.as_deref().unwrap_or(default_currency))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub disposition: Option<Disposition>,
    #[serde(default)]
    pub disposition_reason: Option<String>,
}

impl SubmitRequest {
    pub fn deferred(reason: impl Into<String>) -> Self {
        Self { disposition: Some(Disposition::Defer), disposition_reason: Some(reason.into()) }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variation {
    pub id: VariationId,
    pub number: VariationNumber,
    pub project_id: ProjectId,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub details: VariationDetails,
    pub date: NaiveDate,
    #[serde(default)]
    pub work_types: BTreeSet<WorkType>,
    #[serde(default)]
    pub categories: BTreeSet<ChangeCategory>,
    #[serde(default)]
    pub costs: CostSheet,
    pub currency: String,
    #[serde(default)]
    pub time_impact_days: i32,
    pub status: VariationStatus,
    #[serde(default)]
    pub disposition: Option<Disposition>,
    #[serde(default)]
    pub disposition_reason: Option<String>,
    #[serde(default)]
    pub decision: Option<DecisionRecord>,
    #[serde(default)]
    pub file_ids: BTreeSet<FileId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Variation {
    /// Builds the record for a validated draft; status starts at `Draft`.
    pub fn from_draft(
        draft: DraftVariation,
        id: VariationId,
        number: VariationNumber,
        default_currency: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        draft.validate()?;
        let currency = draft.resolved_currency(default_currency)?;
        Ok(Self {
            id,
            number,
            project_id: draft.project_id,
            client_id: draft.client_id,
            details: draft.details,
            date: draft.date.unwrap_or_else(|| now.date_naive()),
            work_types: draft.work_types,
            categories: draft.categories,
            costs: draft.costs,
            currency,
            time_impact_days: draft.time_impact_days,
            status: VariationStatus::Draft,
            disposition: None,
            disposition_reason: None,
            decision: None,
            file_ids: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Replaces every manager-editable field. Identity, project, lifecycle and attachments are kept.
    pub fn revise(
        &mut self,
        draft: DraftVariation,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        draft.validate()?;
        let currency = draft.resolved_currency(&self.currency)?;
        self.client_id = draft.client_id;
        self.details = draft.details;
        if let Some(date) = draft.date {
            self.date = date;
        }
        self.work_types = draft.work_types;
        self.categories = draft.categories;
        self.costs = draft.costs;
        self.currency = currency;
        self.time_impact_days = draft.time_impact_days;
        self.updated_at = now;
        Ok(())
    }

    pub fn price_impact(&self) -> Decimal {
        costing::grand_total(&self.costs)
    }

    pub fn client_comment(&self) -> Option<&str> {
        self.decision.as_ref().map(|decision| decision.comment.as_str())
    }

    pub fn decided_at(&self) -> Option<DateTime<Utc>> {
        self.decision.as_ref().map(|decision| decision.decided_at)
    }

    pub fn is_decided(&self) -> bool {
        self.decision.is_some()
    }

    pub fn display_title(&self) -> String {
        let title = self.details.title.trim();
        if title.is_empty() {
            format!("Variation {}", self.number)
        } else {
            format!("Variation {}: {title}", self.number)
        }
    }
}

pub fn normalize_currency(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.len() == 3 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(trimmed.to_ascii_uppercase())
    } else {
        Err(ValidationError::InvalidCurrency(raw.to_owned()))
    }
}
