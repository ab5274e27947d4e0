//! Variation documents.
//!
//! A variation is rendered through an HTML template together with its cost breakdown and
//! converted with `wkhtmltopdf` when that tool is on the PATH. Without it the rendered HTML is
//! served instead so the browser can print it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    http::header,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tera::{Context, Tera};
use tokio::process::Command;
use tracing::{error, info, warn};

use fitout_core::costing::{format_amount, CostingEngine, DeterministicCostingEngine};
use fitout_core::domain::variation::{Variation, VariationDetails, VariationId};
use fitout_core::errors::ApplicationError;
use fitout_core::repository::{DocumentGenerator, VariationRepository};

pub const TEMPLATE_NAME: &str = "variations/variation.html.tera";
const AUTOESCAPE_SUFFIXES: [&str; 2] = [".html.tera", ".html"];

#[derive(Debug, thiserror::Error)]
pub enum PdfError {
    #[error("template error: {0}")]
    Template(String),
    #[error("conversion error: {0}")]
    Conversion(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PdfError> for ApplicationError {
    fn from(value: PdfError) -> Self {
        match value {
            PdfError::Template(message) => {
                Self::Configuration(format!("document template: {message}"))
            }
            other => Self::Unavailable(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct DocumentLine {
    description: String,
    basis: String,
    total: String,
}

#[derive(Debug, Serialize)]
struct DocumentSection {
    label: &'static str,
    lines: Vec<DocumentLine>,
    subtotal: String,
}

#[derive(Debug, Serialize)]
struct DocumentDecision {
    outcome: &'static str,
    comment: String,
    decided_by: Option<String>,
    decided_at: String,
}

/// Display-ready projection of a variation; every amount is already formatted.
#[derive(Debug, Serialize)]
struct DocumentView {
    id: String,
    number: u32,
    title: String,
    project_id: String,
    date: String,
    status: &'static str,
    details: VariationDetails,
    work_types: Vec<&'static str>,
    categories: Vec<&'static str>,
    sections: Vec<DocumentSection>,
    price_impact: String,
    time_impact_days: i32,
    decision: Option<DocumentDecision>,
}

impl DocumentView {
    fn build(variation: &Variation, costing: &dyn CostingEngine) -> Self {
        let currency = variation.currency.as_str();
        let breakdown = costing.breakdown(&variation.costs, currency);
        let costs = &variation.costs;

        let sections = vec![
            DocumentSection {
                label: "Materials",
                lines: costs
                    .material_costs
                    .iter()
                    .map(|line| DocumentLine {
                        description: line.description().to_owned(),
                        basis: format!(
                            "{} x {}",
                            line.quantity().normalize(),
                            format_amount(line.unit_rate(), currency)
                        ),
                        total: format_amount(line.total(), currency),
                    })
                    .collect(),
                subtotal: format_amount(breakdown.material_subtotal, currency),
            },
            DocumentSection {
                label: "Labour",
                lines: costs
                    .labor_costs
                    .iter()
                    .map(|line| DocumentLine {
                        description: line.description().to_owned(),
                        basis: format!(
                            "{} h x {}",
                            line.hours().normalize(),
                            format_amount(line.hourly_rate(), currency)
                        ),
                        total: format_amount(line.total(), currency),
                    })
                    .collect(),
                subtotal: format_amount(breakdown.labor_subtotal, currency),
            },
            DocumentSection {
                label: "Additional costs",
                lines: costs
                    .additional_costs
                    .iter()
                    .map(|line| DocumentLine {
                        description: line.description().to_owned(),
                        basis: line.category().to_owned(),
                        total: format_amount(line.amount(), currency),
                    })
                    .collect(),
                subtotal: format_amount(breakdown.additional_subtotal, currency),
            },
        ];

        Self {
            id: variation.id.0.clone(),
            number: variation.number.0,
            title: variation.display_title(),
            project_id: variation.project_id.0.clone(),
            date: variation.date.to_string(),
            status: variation.status.as_str(),
            details: variation.details.clone(),
            work_types: variation.work_types.iter().map(|w| w.as_str()).collect(),
            categories: variation.categories.iter().map(|c| c.as_str()).collect(),
            sections,
            price_impact: format_amount(breakdown.price_impact, currency),
            time_impact_days: variation.time_impact_days,
            decision: variation.decision.as_ref().map(|record| DocumentDecision {
                outcome: record.decision.as_str(),
                comment: record.comment.clone(),
                decided_by: record.decided_by.clone(),
                decided_at: record.decided_at.to_rfc3339(),
            }),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PdfGenerator {
    tera: Tera,
    wkhtmltopdf_path: Option<PathBuf>,
    page_size: String,
}

impl PdfGenerator {
    /// Loads templates from `template_dir`, falling back to the embedded variation template
    /// when the directory does not provide one.
    pub fn new(template_dir: &Path, page_size: &str) -> Result<Self, PdfError> {
        let pattern = format!("{}/**/*.tera", template_dir.display());
        let mut tera = Tera::new(&pattern).map_err(|e| PdfError::Template(e.to_string()))?;
        tera.autoescape_on(AUTOESCAPE_SUFFIXES.to_vec());

        if !tera.get_template_names().any(|name| name == TEMPLATE_NAME) {
            warn!(
                event_name = "system.documents.embedded_template",
                template_dir = %template_dir.display(),
                "variation template not found on disk, using embedded copy"
            );
            add_embedded_template(&mut tera)?;
        }

        Ok(Self { tera, wkhtmltopdf_path: locate_wkhtmltopdf(), page_size: page_size.to_owned() })
    }

    pub fn with_embedded_templates() -> Result<Self, PdfError> {
        let mut tera = Tera::default();
        tera.autoescape_on(AUTOESCAPE_SUFFIXES.to_vec());
        add_embedded_template(&mut tera)?;

        Ok(Self { tera, wkhtmltopdf_path: locate_wkhtmltopdf(), page_size: "A4".to_owned() })
    }

    #[cfg(test)]
    pub(crate) fn html_only(mut self) -> Self {
        self.wkhtmltopdf_path = None;
        self
    }

    pub fn render_html(&self, variation: &Variation) -> Result<String, PdfError> {
        let view = DocumentView::build(variation, &DeterministicCostingEngine);
        let context =
            Context::from_serialize(&view).map_err(|e| PdfError::Template(e.to_string()))?;
        self.tera.render(TEMPLATE_NAME, &context).map_err(|e| PdfError::Template(e.to_string()))
    }

    /// PDF bytes when `wkhtmltopdf` is available and succeeds, the rendered HTML otherwise.
    pub async fn generate(&self, variation: &Variation) -> Result<PdfResult, PdfError> {
        let html = self.render_html(variation)?;

        let Some(wkhtmltopdf) = self.wkhtmltopdf_path.as_deref() else {
            return Ok(PdfResult::Html(html));
        };

        match self.convert_html_to_pdf(&html, wkhtmltopdf).await {
            Ok(pdf_bytes) => Ok(PdfResult::Pdf(pdf_bytes)),
            Err(e) => {
                warn!(
                    event_name = "variation.document.conversion_failed",
                    variation_id = %variation.id,
                    error = %e,
                    "PDF conversion failed, falling back to HTML"
                );
                Ok(PdfResult::Html(html))
            }
        }
    }

    async fn convert_html_to_pdf(
        &self,
        html: &str,
        wkhtmltopdf_path: &Path,
    ) -> Result<Vec<u8>, PdfError> {
        let temp_dir = std::env::temp_dir();
        let stem = uuid::Uuid::new_v4().simple().to_string();
        let html_path = temp_dir.join(format!("variation_{stem}.html"));
        let pdf_path = temp_dir.join(format!("variation_{stem}.pdf"));

        tokio::fs::write(&html_path, html).await?;
        let converted = self.run_converter(wkhtmltopdf_path, &html_path, &pdf_path).await;

        let _ = tokio::fs::remove_file(&html_path).await;
        let _ = tokio::fs::remove_file(&pdf_path).await;

        let pdf_bytes = converted?;
        info!(size = pdf_bytes.len(), "PDF generated successfully");
        Ok(pdf_bytes)
    }

    async fn run_converter(
        &self,
        wkhtmltopdf_path: &Path,
        html_path: &Path,
        pdf_path: &Path,
    ) -> Result<Vec<u8>, PdfError> {
        let output = Command::new(wkhtmltopdf_path)
            .arg("--page-size")
            .arg(&self.page_size)
            .arg("--margin-top")
            .arg("10mm")
            .arg("--margin-bottom")
            .arg("10mm")
            .arg("--margin-left")
            .arg("10mm")
            .arg("--margin-right")
            .arg("10mm")
            .arg("--encoding")
            .arg("utf-8")
            .arg(html_path)
            .arg(pdf_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, "wkhtmltopdf failed");
            return Err(PdfError::Conversion(stderr.to_string()));
        }

        Ok(tokio::fs::read(pdf_path).await?)
    }
}

fn add_embedded_template(tera: &mut Tera) -> Result<(), PdfError> {
    tera.add_raw_template(
        TEMPLATE_NAME,
        include_str!("../../../templates/variations/variation.html.tera"),
    )
    .map_err(|e| PdfError::Template(e.to_string()))
}

fn locate_wkhtmltopdf() -> Option<PathBuf> {
    match which::which("wkhtmltopdf") {
        Ok(path) => {
            info!(path = %path.display(), "wkhtmltopdf found");
            Some(path)
        }
        Err(_) => {
            warn!("wkhtmltopdf not found in PATH - variation documents will be served as HTML");
            None
        }
    }
}

pub enum PdfResult {
    Pdf(Vec<u8>),
    Html(String),
}

impl PdfResult {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Pdf(bytes) => bytes,
            Self::Html(html) => html.into_bytes(),
        }
    }

    pub fn into_response(self, filename: &str) -> Response {
        match self {
            Self::Pdf(bytes) => (
                [
                    (header::CONTENT_TYPE, "application/pdf".to_owned()),
                    (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
                ],
                bytes,
            )
                .into_response(),
            Self::Html(html) => {
                ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], html).into_response()
            }
        }
    }
}

pub struct RenderedDocument {
    pub filename: String,
    pub output: PdfResult,
}

/// Document generation for variations held by the system of record.
#[derive(Clone)]
pub struct VariationDocuments {
    generator: Arc<PdfGenerator>,
    variations: Arc<dyn VariationRepository>,
}

impl VariationDocuments {
    pub fn new(generator: PdfGenerator, variations: Arc<dyn VariationRepository>) -> Self {
        Self { generator: Arc::new(generator), variations }
    }

    pub async fn render(&self, id: &VariationId) -> Result<RenderedDocument, ApplicationError> {
        let variation = self.variations.find_by_id(id).await?;
        let output = self.generator.generate(&variation).await?;
        Ok(RenderedDocument { filename: document_filename(&variation), output })
    }
}

#[async_trait]
impl DocumentGenerator for VariationDocuments {
    async fn generate_document(&self, id: &VariationId) -> Result<Vec<u8>, ApplicationError> {
        Ok(self.render(id).await?.output.into_bytes())
    }
}

pub fn document_filename(variation: &Variation) -> String {
    format!("Variation_{}.pdf", variation.number)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal::Decimal;

    use fitout_core::decision::DecisionRequest;
    use fitout_core::domain::cost::{AdditionalCost, LaborCost, MaterialCost};
    use fitout_core::domain::variation::{
        DraftVariation, ProjectId, VariationDetails, VariationId,
    };
    use fitout_core::errors::ErrorKind;
    use fitout_core::repository::{DocumentGenerator, VariationRepository};
    use fitout_db::InMemoryVariationRepository;

    use super::*;

    fn draft() -> DraftVariation {
        let mut draft = DraftVariation::new(
            ProjectId("P-DOC".to_owned()),
            VariationDetails {
                title: "Reception joinery".to_owned(),
                change_description: "Extend reception counter by 1.2m".to_owned(),
                reason_description: "Additional workstation".to_owned(),
                change_requestor: "Tenant".to_owned(),
                ..VariationDetails::default()
            },
        );
        draft.costs.material_costs.push(
            MaterialCost::new("Oak veneer", Decimal::from(4), Decimal::new(12_550, 2))
                .expect("material"),
        );
        draft
            .costs
            .labor_costs
            .push(LaborCost::new("Joiner", Decimal::from(6), Decimal::from(55)).expect("labor"));
        draft.costs.additional_costs.push(
            AdditionalCost::new("Logistics", "After-hours delivery", Decimal::from(150))
                .expect("additional"),
        );
        draft
    }

    fn html_only() -> PdfGenerator {
        PdfGenerator::with_embedded_templates().expect("embedded template").html_only()
    }

    #[tokio::test]
    async fn document_shows_lines_subtotals_and_price_impact() {
        let repo = Arc::new(InMemoryVariationRepository::default());
        let variation = repo.create(draft()).await.expect("create");

        let html = html_only().render_html(&variation).expect("render");

        assert!(html.contains("Variation 1: Reception joinery"));
        assert!(html.contains("Oak veneer"));
        assert!(html.contains("AED 502.00"));
        assert!(html.contains("AED 330.00"));
        assert!(html.contains("After-hours delivery"));
        assert!(html.contains("AED 982.00"));
    }

    #[tokio::test]
    async fn decided_variation_shows_the_client_comment() {
        let repo = Arc::new(InMemoryVariationRepository::default());
        let variation = repo.create(draft()).await.expect("create");
        repo.submit(&variation.id).await.expect("submit");
        let declined = repo
            .decline(&variation.id, DecisionRequest::decline("too expensive"))
            .await
            .expect("decline");

        let html = html_only().render_html(&declined).expect("render");

        assert!(html.contains("Client decision"));
        assert!(html.contains("too expensive"));
    }

    #[tokio::test]
    async fn html_fallback_is_served_without_a_converter() {
        let repo = Arc::new(InMemoryVariationRepository::default());
        let variation = repo.create(draft()).await.expect("create");
        let documents = VariationDocuments::new(html_only(), repo.clone());

        let rendered = documents.render(&variation.id).await.expect("render");

        assert_eq!(rendered.filename, "Variation_1.pdf");
        assert!(matches!(rendered.output, PdfResult::Html(ref html) if html.contains("Oak veneer")));
    }

    #[tokio::test]
    async fn unknown_variation_is_not_found() {
        let repo = Arc::new(InMemoryVariationRepository::default());
        let documents = VariationDocuments::new(html_only(), repo);

        let error = documents
            .generate_document(&VariationId("VAR-missing".to_owned()))
            .await
            .expect_err("missing");

        assert_eq!(error.kind(), ErrorKind::NotFound);
    }
}
