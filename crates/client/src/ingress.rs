//! Decoding of system-of-record responses into typed values.
//!
//! Cost arrays arrive either as JSON arrays or as JSON-encoded strings; `CostSheet` normalizes
//! both on deserialization, so everything past this module sees typed cost lines only.

use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::warn;

use fitout_core::domain::attachment::FileRef;
use fitout_core::domain::event::VariationEvent;
use fitout_core::domain::variation::Variation;
use fitout_core::errors::{ApplicationError, ErrorKind};

#[derive(Deserialize)]
struct VariationEnvelope {
    variation: Variation,
    #[serde(default)]
    price_impact: Option<Decimal>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VariationBody {
    Envelope(VariationEnvelope),
    Bare(Variation),
}

impl VariationBody {
    fn into_variation(self) -> Variation {
        match self {
            Self::Envelope(envelope) => {
                if let Some(reported) = envelope.price_impact {
                    check_price_impact(&envelope.variation, reported);
                }
                envelope.variation
            }
            Self::Bare(variation) => variation,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    kind: Option<String>,
}

/// The locally derived total wins; a disagreeing server figure is only reported.
fn check_price_impact(variation: &Variation, reported: Decimal) {
    let derived = variation.price_impact();
    if derived != reported {
        warn!(
            event_name = "variation.price_impact.mismatch",
            variation_id = %variation.id,
            reported = %reported,
            derived = %derived,
            "server price impact differs from cost lines"
        );
    }
}

fn malformed(what: &str, error: serde_json::Error) -> ApplicationError {
    ApplicationError::Unavailable(format!("malformed {what} response: {error}"))
}

pub fn decode_variation(body: &[u8]) -> Result<Variation, ApplicationError> {
    serde_json::from_slice::<VariationBody>(body)
        .map(VariationBody::into_variation)
        .map_err(|e| malformed("variation", e))
}

pub fn decode_variations(body: &[u8]) -> Result<Vec<Variation>, ApplicationError> {
    let bodies: Vec<VariationBody> =
        serde_json::from_slice(body).map_err(|e| malformed("variation list", e))?;
    Ok(bodies.into_iter().map(VariationBody::into_variation).collect())
}

pub fn decode_files(body: &[u8]) -> Result<Vec<FileRef>, ApplicationError> {
    serde_json::from_slice(body).map_err(|e| malformed("file list", e))
}

pub fn decode_events(body: &[u8]) -> Result<Vec<VariationEvent>, ApplicationError> {
    serde_json::from_slice(body).map_err(|e| malformed("event list", e))
}

/// Error kind implied by an HTTP status when the body does not name one.
pub fn kind_for_status(status: u16) -> ErrorKind {
    match status {
        400 => ErrorKind::Validation,
        422 => ErrorKind::InvalidTransition,
        409 => ErrorKind::Conflict,
        404 => ErrorKind::NotFound,
        401 | 403 => ErrorKind::Internal,
        _ => ErrorKind::Unavailable,
    }
}

/// Maps a failed response to a typed error: the body's `kind` first, the status as fallback.
pub fn decode_error(status: u16, body: &[u8]) -> ApplicationError {
    let parsed = serde_json::from_slice::<ErrorBody>(body).ok();
    let kind = parsed
        .as_ref()
        .and_then(|body| body.kind.as_deref())
        .and_then(ErrorKind::parse)
        .unwrap_or_else(|| kind_for_status(status));
    let message = parsed
        .map(|body| body.error)
        .unwrap_or_else(|| format!("request failed with status {status}"));

    ApplicationError::Remote { kind, message }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use serde_json::json;

    use fitout_core::domain::variation::VariationStatus;
    use fitout_core::errors::ErrorKind;

    use super::{decode_error, decode_variation, decode_variations};

    fn variation_json() -> serde_json::Value {
        json!({
            "id": "VAR-1",
            "number": 4,
            "project_id": "P-1",
            "details": {
                "title": "Ceiling bulkhead",
                "change_description": "Add bulkhead for ductwork",
                "reason_description": "HVAC clash",
                "change_requestor": "MEP consultant"
            },
            "date": "2026-02-11",
            "work_types": ["HVAC", "civil"],
            "categories": ["Scope"],
            "costs": {
                "material_costs": "[{\"description\":\"Gypsum\",\"quantity\":\"12\",\"unit_rate\":\"35\"}]",
                "labor_costs": [{"description": "Fixer", "hours": 6, "hourlyRate": 45}],
                "additional_costs": null
            },
            "currency": "AED",
            "time_impact_days": 2,
            "status": "submitted",
            "created_at": "2026-02-11T08:00:00Z",
            "updated_at": "2026-02-11T09:00:00Z"
        })
    }

    #[test]
    fn string_and_array_cost_lines_decode_to_the_same_types() {
        let body = serde_json::to_vec(&variation_json()).expect("encode");

        let variation = decode_variation(&body).expect("decode");

        assert_eq!(variation.status, VariationStatus::Submitted);
        assert_eq!(variation.costs.material_costs[0].total(), Decimal::from(420));
        assert_eq!(variation.costs.labor_costs[0].total(), Decimal::from(270));
        assert!(variation.costs.additional_costs.is_empty());
        assert_eq!(variation.price_impact(), Decimal::from(690));
    }

    #[test]
    fn envelope_with_stale_price_impact_keeps_the_derived_total() {
        let body = serde_json::to_vec(&json!({
            "variation": variation_json(),
            "price_impact": "999.00"
        }))
        .expect("encode");

        let variation = decode_variation(&body).expect("decode");

        assert_eq!(variation.price_impact(), Decimal::from(690));
    }

    #[test]
    fn list_accepts_envelopes_and_bare_variations() {
        let body = serde_json::to_vec(&json!([
            {"variation": variation_json(), "price_impact": "690.00"},
            variation_json()
        ]))
        .expect("encode");

        let variations = decode_variations(&body).expect("decode");

        assert_eq!(variations.len(), 2);
    }

    #[test]
    fn malformed_body_is_reported_as_unavailable() {
        let error = decode_variation(b"<html>bad gateway</html>").expect_err("not json");

        assert_eq!(error.kind(), ErrorKind::Unavailable);
    }

    #[test]
    fn error_body_kind_takes_precedence_over_status() {
        let error = decode_error(400, br#"{"error":"decision already recorded","kind":"conflict"}"#);

        assert_eq!(error.kind(), ErrorKind::Conflict);
        assert!(error.to_string().contains("decision already recorded"));
    }

    #[test]
    fn status_is_the_fallback_when_the_body_is_opaque() {
        assert_eq!(decode_error(404, b"").kind(), ErrorKind::NotFound);
        assert_eq!(decode_error(422, b"nope").kind(), ErrorKind::InvalidTransition);
        assert_eq!(decode_error(502, b"").kind(), ErrorKind::Unavailable);
    }
}
