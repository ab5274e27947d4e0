use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::warn;

use fitout_core::decision::DecisionRequest;
use fitout_core::domain::attachment::{FileId, FileRef};
use fitout_core::domain::cost::{decode_cost_lines, CostSheet};
use fitout_core::domain::event::VariationEvent;
use fitout_core::domain::variation::{
    ClientDecision, DecisionRecord, Disposition, DraftVariation, ProjectId, SubmitRequest,
    Variation, VariationDetails, VariationId, VariationNumber, VariationStatus,
};
use fitout_core::errors::{ApplicationError, DomainError};
use fitout_core::lifecycle::{LifecycleAction, TransitionError};
use fitout_core::repository::{AttachmentRepository, ChangeFeed, VariationRepository};
use fitout_core::workflow::VariationWorkflow;

use super::{next_variation_id, RepositoryError, MANAGER_ACTOR};
use crate::DbPool;

const VARIATION_COLUMNS: &str = "id, project_id, number, client_id, title, change_description,
    reason_description, technical_changes, change_requestor, change_reference, change_area,
    effective_date, work_types_json, categories_json, material_costs_json, labor_costs_json,
    additional_costs_json, currency, time_impact_days, status, disposition, disposition_reason,
    decision, client_comment, decided_by, decided_at, created_at, updated_at";

const MAX_NUMBER_ATTEMPTS: usize = 3;

#[derive(Clone, Copy)]
enum FileChange<'a> {
    Keep,
    Attach(&'a FileRef),
    Detach(&'a FileId),
}

/// SQLite-backed system of record.
///
/// Writes are optimistic: the variation is validated against the row it was read from, and the
/// update only lands while that row still has the status it was read with and no decision.
pub struct SqlVariationRepository {
    pool: DbPool,
    workflow: VariationWorkflow,
}

impl SqlVariationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self::with_workflow(pool, VariationWorkflow::default())
    }

    pub fn with_workflow(pool: DbPool, workflow: VariationWorkflow) -> Self {
        Self { pool, workflow }
    }

    async fn load(&self, id: &VariationId) -> Result<Option<Variation>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        fetch_variation(&mut conn, id).await
    }

    async fn load_required(&self, id: &VariationId) -> Result<Variation, RepositoryError> {
        self.load(id).await?.ok_or_else(|| ApplicationError::variation_not_found(&id.0).into())
    }

    async fn next_number(&self, project_id: &ProjectId) -> Result<VariationNumber, RepositoryError> {
        let next: i64 = sqlx::query(
            "SELECT COALESCE(MAX(number), 0) + 1 AS next_number FROM variation WHERE project_id = ?",
        )
        .bind(&project_id.0)
        .fetch_one(&self.pool)
        .await?
        .try_get("next_number")
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;

        u32::try_from(next)
            .map(VariationNumber)
            .map_err(|_| RepositoryError::Decode(format!("variation number {next} out of range")))
    }

    async fn create_variation(&self, draft: DraftVariation) -> Result<Variation, RepositoryError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let number = self.next_number(&draft.project_id).await?;
            let (variation, event) = self.workflow.create(
                draft.clone(),
                next_variation_id(),
                number,
                MANAGER_ACTOR,
                Utc::now(),
            )?;

            let mut tx = self.pool.begin().await?;
            match insert_variation(&mut tx, &variation).await {
                Ok(()) => {}
                Err(RepositoryError::Database(sqlx::Error::Database(error)))
                    if error.is_unique_violation() && attempt < MAX_NUMBER_ATTEMPTS =>
                {
                    tx.rollback().await?;
                    warn!(
                        event_name = "variation.number.retry",
                        project_id = %draft.project_id,
                        number = number.0,
                        attempt,
                        "variation number taken concurrently"
                    );
                    continue;
                }
                Err(error) => return Err(error),
            }
            append_event(&mut tx, &event).await?;
            tx.commit().await?;
            return Ok(variation);
        }
    }

    async fn mutate<F>(
        &self,
        id: &VariationId,
        action: LifecycleAction,
        files: FileChange<'_>,
        change: F,
    ) -> Result<Variation, RepositoryError>
    where
        F: FnOnce(
            &VariationWorkflow,
            &mut Variation,
            DateTime<Utc>,
        ) -> Result<VariationEvent, DomainError>,
    {
        let mut variation = self.load_required(id).await?;
        if let FileChange::Detach(file_id) = files {
            if !variation.file_ids.contains(file_id) {
                return Err(ApplicationError::file_not_found(&file_id.0).into());
            }
        }
        let expected = variation.status;
        let event = change(&self.workflow, &mut variation, Utc::now())?;

        let mut tx = self.pool.begin().await?;
        if update_variation(&mut tx, &variation, expected).await? == 0 {
            tx.rollback().await?;
            return Err(self.stale_write(id, action).await);
        }
        match files {
            FileChange::Keep => {}
            FileChange::Attach(file) => upsert_file(&mut tx, id, file, variation.updated_at).await?,
            FileChange::Detach(file_id) => delete_file(&mut tx, id, file_id).await?,
        }
        append_event(&mut tx, &event).await?;
        tx.commit().await?;
        Ok(variation)
    }

    /// Explains why a conditional write matched no row, from the row as it is now.
    async fn stale_write(&self, id: &VariationId, action: LifecycleAction) -> RepositoryError {
        let current = match self.load_required(id).await {
            Ok(current) => current,
            Err(error) => return error,
        };
        warn!(
            event_name = "variation.write.stale",
            variation_id = %id,
            status = current.status.as_str(),
            action = ?action,
            "variation changed before the write landed"
        );
        match current.decided_at() {
            Some(decided_at) => ApplicationError::decision_conflict(decided_at).into(),
            None => DomainError::from(TransitionError::InvalidTransition {
                from: Some(current.status),
                action,
            })
            .into(),
        }
    }

    async fn decide(
        &self,
        id: &VariationId,
        request: DecisionRequest,
    ) -> Result<Variation, RepositoryError> {
        let action = LifecycleAction::for_decision(request.decision);
        self.mutate(id, action, FileChange::Keep, |workflow, variation, now| {
            workflow.decide(variation, &request, now)
        })
        .await
    }

    async fn discard_variation(&self, id: &VariationId) -> Result<(), RepositoryError> {
        let variation = self.load_required(id).await?;
        let now = Utc::now();
        let event = self.workflow.discard(&variation, MANAGER_ACTOR, now)?;

        let mut tx = self.pool.begin().await?;
        let discarded = sqlx::query(
            "UPDATE variation SET discarded_at = ?, updated_at = ?
             WHERE id = ? AND status = 'draft' AND discarded_at IS NULL",
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(&id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if discarded == 0 {
            tx.rollback().await?;
            return Err(self.stale_write(id, LifecycleAction::Discard).await);
        }
        append_event(&mut tx, &event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn project_variations(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<Variation>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!(
            "SELECT {VARIATION_COLUMNS} FROM variation
             WHERE project_id = ? AND discarded_at IS NULL ORDER BY number"
        );
        let rows = sqlx::query(&sql).bind(&project_id.0).fetch_all(&mut *conn).await?;

        let file_rows = sqlx::query(
            "SELECT f.variation_id, f.file_id FROM variation_file f
             JOIN variation v ON v.id = f.variation_id
             WHERE v.project_id = ? AND v.discarded_at IS NULL",
        )
        .bind(&project_id.0)
        .fetch_all(&mut *conn)
        .await?;
        let mut files: HashMap<String, BTreeSet<FileId>> = HashMap::new();
        for row in &file_rows {
            let variation_id: String = column(row, "variation_id")?;
            let file_id: String = column(row, "file_id")?;
            files.entry(variation_id).or_default().insert(FileId(file_id));
        }

        rows.iter()
            .map(|row| {
                let id: String = column(row, "id")?;
                row_to_variation(row, files.remove(&id).unwrap_or_default())
            })
            .collect()
    }

    async fn attached_files(&self, id: &VariationId) -> Result<Vec<FileRef>, RepositoryError> {
        self.load_required(id).await?;
        let rows = sqlx::query(
            "SELECT file_id, name, size_bytes, content_type, preview_url
             FROM variation_file WHERE variation_id = ? ORDER BY attached_at, file_id",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_file).collect()
    }

    async fn events(&self, id: &VariationId) -> Result<Vec<VariationEvent>, RepositoryError> {
        self.load_required(id).await?;
        let rows = sqlx::query(
            "SELECT id, variation_id, event_type, from_status, to_status, actor, detail, occurred_at
             FROM variation_event WHERE variation_id = ? ORDER BY seq",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }
}

#[async_trait::async_trait]
impl VariationRepository for SqlVariationRepository {
    async fn create(&self, draft: DraftVariation) -> Result<Variation, ApplicationError> {
        Ok(self.create_variation(draft).await?)
    }

    async fn find_by_id(&self, id: &VariationId) -> Result<Variation, ApplicationError> {
        Ok(self.load_required(id).await?)
    }

    async fn list_by_project(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<Variation>, ApplicationError> {
        Ok(self.project_variations(project_id).await?)
    }

    async fn update_draft(
        &self,
        id: &VariationId,
        draft: DraftVariation,
    ) -> Result<Variation, ApplicationError> {
        let updated = self
            .mutate(id, LifecycleAction::Revise, FileChange::Keep, |workflow, variation, now| {
                workflow.revise(variation, draft, MANAGER_ACTOR, now)
            })
            .await?;
        Ok(updated)
    }

    async fn submit_with(
        &self,
        id: &VariationId,
        request: SubmitRequest,
    ) -> Result<Variation, ApplicationError> {
        let action = LifecycleAction::for_submission(&request);
        let submitted = self
            .mutate(id, action, FileChange::Keep, |workflow, variation, now| {
                workflow.submit(variation, &request, MANAGER_ACTOR, now)
            })
            .await?;
        Ok(submitted)
    }

    async fn begin_review(&self, id: &VariationId) -> Result<Variation, ApplicationError> {
        let reviewed = self
            .mutate(id, LifecycleAction::BeginReview, FileChange::Keep, |workflow, variation, now| {
                workflow.begin_review(variation, MANAGER_ACTOR, now)
            })
            .await?;
        Ok(reviewed)
    }

    async fn approve(
        &self,
        id: &VariationId,
        mut request: DecisionRequest,
    ) -> Result<Variation, ApplicationError> {
        request.decision = ClientDecision::Approve;
        Ok(self.decide(id, request).await?)
    }

    async fn decline(
        &self,
        id: &VariationId,
        mut request: DecisionRequest,
    ) -> Result<Variation, ApplicationError> {
        request.decision = ClientDecision::Decline;
        Ok(self.decide(id, request).await?)
    }

    async fn discard(&self, id: &VariationId) -> Result<(), ApplicationError> {
        Ok(self.discard_variation(id).await?)
    }
}

#[async_trait::async_trait]
impl AttachmentRepository for SqlVariationRepository {
    async fn list_attached_files(
        &self,
        id: &VariationId,
    ) -> Result<Vec<FileRef>, ApplicationError> {
        Ok(self.attached_files(id).await?)
    }

    async fn attach_file(
        &self,
        id: &VariationId,
        file: FileRef,
    ) -> Result<Variation, ApplicationError> {
        let attached = self
            .mutate(
                id,
                LifecycleAction::AttachFile,
                FileChange::Attach(&file),
                |workflow, variation, now| workflow.attach_file(variation, &file, MANAGER_ACTOR, now),
            )
            .await?;
        Ok(attached)
    }

    async fn delete_attached_file(
        &self,
        id: &VariationId,
        file_id: &FileId,
    ) -> Result<(), ApplicationError> {
        self.mutate(
            id,
            LifecycleAction::DetachFile,
            FileChange::Detach(file_id),
            |workflow, variation, now| workflow.detach_file(variation, file_id, MANAGER_ACTOR, now),
        )
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChangeFeed for SqlVariationRepository {
    async fn list_events(&self, id: &VariationId) -> Result<Vec<VariationEvent>, ApplicationError> {
        Ok(self.events(id).await?)
    }
}

async fn fetch_variation(
    conn: &mut SqliteConnection,
    id: &VariationId,
) -> Result<Option<Variation>, RepositoryError> {
    let sql =
        format!("SELECT {VARIATION_COLUMNS} FROM variation WHERE id = ? AND discarded_at IS NULL");
    let Some(row) = sqlx::query(&sql).bind(&id.0).fetch_optional(&mut *conn).await? else {
        return Ok(None);
    };

    let file_ids = sqlx::query("SELECT file_id FROM variation_file WHERE variation_id = ?")
        .bind(&id.0)
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(|row| column::<String>(row, "file_id").map(FileId))
        .collect::<Result<BTreeSet<_>, _>>()?;

    row_to_variation(&row, file_ids).map(Some)
}

async fn insert_variation(
    conn: &mut SqliteConnection,
    variation: &Variation,
) -> Result<(), RepositoryError> {
    let encoded = EncodedColumns::encode(variation)?;
    let decision = variation.decision.as_ref();

    sqlx::query(
        "INSERT INTO variation (
            id, project_id, number, client_id, title, change_description, reason_description,
            technical_changes, change_requestor, change_reference, change_area, effective_date,
            work_types_json, categories_json, material_costs_json, labor_costs_json,
            additional_costs_json, currency, time_impact_days, status, disposition,
            disposition_reason, decision, client_comment, decided_by, decided_at,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&variation.id.0)
    .bind(&variation.project_id.0)
    .bind(i64::from(variation.number.0))
    .bind(variation.client_id.as_deref())
    .bind(&variation.details.title)
    .bind(&variation.details.change_description)
    .bind(&variation.details.reason_description)
    .bind(&variation.details.technical_changes)
    .bind(&variation.details.change_requestor)
    .bind(&variation.details.change_reference)
    .bind(&variation.details.change_area)
    .bind(variation.date.to_string())
    .bind(&encoded.work_types)
    .bind(&encoded.categories)
    .bind(&encoded.material_costs)
    .bind(&encoded.labor_costs)
    .bind(&encoded.additional_costs)
    .bind(&variation.currency)
    .bind(variation.time_impact_days)
    .bind(variation.status.as_str())
    .bind(variation.disposition.map(|disposition| disposition.as_str()))
    .bind(variation.disposition_reason.as_deref())
    .bind(decision.map(|record| record.decision.as_str()))
    .bind(decision.map(|record| record.comment.as_str()))
    .bind(decision.and_then(|record| record.decided_by.as_deref()))
    .bind(decision.map(|record| record.decided_at.to_rfc3339()))
    .bind(variation.created_at.to_rfc3339())
    .bind(variation.updated_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Returns the number of rows written; zero means the stored row moved on.
async fn update_variation(
    conn: &mut SqliteConnection,
    variation: &Variation,
    expected: VariationStatus,
) -> Result<u64, RepositoryError> {
    let encoded = EncodedColumns::encode(variation)?;
    let decision = variation.decision.as_ref();

    let result = sqlx::query(
        "UPDATE variation SET
            client_id = ?, title = ?, change_description = ?, reason_description = ?,
            technical_changes = ?, change_requestor = ?, change_reference = ?, change_area = ?,
            effective_date = ?, work_types_json = ?, categories_json = ?,
            material_costs_json = ?, labor_costs_json = ?, additional_costs_json = ?,
            currency = ?, time_impact_days = ?, status = ?, disposition = ?,
            disposition_reason = ?, decision = ?, client_comment = ?, decided_by = ?,
            decided_at = ?, updated_at = ?
         WHERE id = ? AND status = ? AND decided_at IS NULL AND discarded_at IS NULL",
    )
    .bind(variation.client_id.as_deref())
    .bind(&variation.details.title)
    .bind(&variation.details.change_description)
    .bind(&variation.details.reason_description)
    .bind(&variation.details.technical_changes)
    .bind(&variation.details.change_requestor)
    .bind(&variation.details.change_reference)
    .bind(&variation.details.change_area)
    .bind(variation.date.to_string())
    .bind(&encoded.work_types)
    .bind(&encoded.categories)
    .bind(&encoded.material_costs)
    .bind(&encoded.labor_costs)
    .bind(&encoded.additional_costs)
    .bind(&variation.currency)
    .bind(variation.time_impact_days)
    .bind(variation.status.as_str())
    .bind(variation.disposition.map(|disposition| disposition.as_str()))
    .bind(variation.disposition_reason.as_deref())
    .bind(decision.map(|record| record.decision.as_str()))
    .bind(decision.map(|record| record.comment.as_str()))
    .bind(decision.and_then(|record| record.decided_by.as_deref()))
    .bind(decision.map(|record| record.decided_at.to_rfc3339()))
    .bind(variation.updated_at.to_rfc3339())
    .bind(&variation.id.0)
    .bind(expected.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

async fn upsert_file(
    conn: &mut SqliteConnection,
    id: &VariationId,
    file: &FileRef,
    attached_at: DateTime<Utc>,
) -> Result<(), RepositoryError> {
    let size = i64::try_from(file.size)
        .map_err(|_| RepositoryError::Encode(format!("file size {} out of range", file.size)))?;

    sqlx::query(
        "INSERT INTO variation_file (
            variation_id, file_id, name, size_bytes, content_type, preview_url, attached_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(variation_id, file_id) DO UPDATE SET
            name = excluded.name,
            size_bytes = excluded.size_bytes,
            content_type = excluded.content_type,
            preview_url = excluded.preview_url,
            attached_at = excluded.attached_at",
    )
    .bind(&id.0)
    .bind(&file.id.0)
    .bind(&file.name)
    .bind(size)
    .bind(&file.content_type)
    .bind(file.preview_url.as_deref())
    .bind(attached_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn delete_file(
    conn: &mut SqliteConnection,
    id: &VariationId,
    file_id: &FileId,
) -> Result<(), RepositoryError> {
    let removed = sqlx::query("DELETE FROM variation_file WHERE variation_id = ? AND file_id = ?")
        .bind(&id.0)
        .bind(&file_id.0)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if removed == 0 {
        return Err(ApplicationError::file_not_found(&file_id.0).into());
    }
    Ok(())
}

async fn append_event(
    conn: &mut SqliteConnection,
    event: &VariationEvent,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO variation_event (
            id, variation_id, event_type, from_status, to_status, actor, detail, occurred_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&event.id)
    .bind(&event.variation_id.0)
    .bind(&event.event_type)
    .bind(event.from_status.map(|status| status.as_str()))
    .bind(event.to_status.map(|status| status.as_str()))
    .bind(&event.actor)
    .bind(&event.detail)
    .bind(event.occurred_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

struct EncodedColumns {
    work_types: String,
    categories: String,
    material_costs: String,
    labor_costs: String,
    additional_costs: String,
}

impl EncodedColumns {
    fn encode(variation: &Variation) -> Result<Self, RepositoryError> {
        Ok(Self {
            work_types: to_json("work_types_json", &variation.work_types)?,
            categories: to_json("categories_json", &variation.categories)?,
            material_costs: to_json("material_costs_json", &variation.costs.material_costs)?,
            labor_costs: to_json("labor_costs_json", &variation.costs.labor_costs)?,
            additional_costs: to_json("additional_costs_json", &variation.costs.additional_costs)?,
        })
    }
}

fn to_json<T: Serialize + ?Sized>(column: &str, value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Encode(format!("{column}: {e}")))
}

fn from_json<T: DeserializeOwned>(column: &str, raw: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(raw).map_err(|e| RepositoryError::Decode(format!("{column}: {e}")))
}

fn cost_lines<T: DeserializeOwned>(row: &SqliteRow, name: &str) -> Result<Vec<T>, RepositoryError> {
    let raw: String = column(row, name)?;
    decode_cost_lines(Some(Value::String(raw)))
        .map_err(|e| RepositoryError::Decode(format!("{name}: {e}")))
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name).map_err(|e| RepositoryError::Decode(e.to_string()))
}

fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("{column}: {e}")))
}

fn parse_status(column: &str, raw: &str) -> Result<VariationStatus, RepositoryError> {
    VariationStatus::parse(raw)
        .ok_or_else(|| RepositoryError::Decode(format!("{column}: unknown status `{raw}`")))
}

fn parse_decision(raw: &str) -> Result<ClientDecision, RepositoryError> {
    match raw {
        "approve" => Ok(ClientDecision::Approve),
        "decline" => Ok(ClientDecision::Decline),
        other => Err(RepositoryError::Decode(format!("decision: unknown value `{other}`"))),
    }
}

fn row_to_variation(
    row: &SqliteRow,
    file_ids: BTreeSet<FileId>,
) -> Result<Variation, RepositoryError> {
    let number: i64 = column(row, "number")?;
    let number = u32::try_from(number)
        .map_err(|_| RepositoryError::Decode(format!("number: {number} out of range")))?;
    let date: String = column(row, "effective_date")?;
    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|e| RepositoryError::Decode(format!("effective_date: {e}")))?;
    let status: String = column(row, "status")?;
    let disposition: Option<String> = column(row, "disposition")?;
    let disposition = disposition
        .map(|raw| {
            Disposition::parse(&raw).ok_or_else(|| {
                RepositoryError::Decode(format!("disposition: unknown value `{raw}`"))
            })
        })
        .transpose()?;
    let work_types: String = column(row, "work_types_json")?;
    let categories: String = column(row, "categories_json")?;
    let created_at: String = column(row, "created_at")?;
    let updated_at: String = column(row, "updated_at")?;

    let decision: Option<String> = column(row, "decision")?;
    let decided_at: Option<String> = column(row, "decided_at")?;
    let decision = match (decision, decided_at) {
        (Some(decision), Some(decided_at)) => Some(DecisionRecord {
            decision: parse_decision(&decision)?,
            comment: column::<Option<String>>(row, "client_comment")?.unwrap_or_default(),
            decided_by: column(row, "decided_by")?,
            decided_at: parse_timestamp("decided_at", &decided_at)?,
        }),
        (None, None) => None,
        _ => {
            return Err(RepositoryError::Decode(
                "decision and decided_at must be set together".to_owned(),
            ))
        }
    };

    Ok(Variation {
        id: VariationId(column(row, "id")?),
        number: VariationNumber(number),
        project_id: ProjectId(column(row, "project_id")?),
        client_id: column(row, "client_id")?,
        details: VariationDetails {
            title: column(row, "title")?,
            change_description: column(row, "change_description")?,
            reason_description: column(row, "reason_description")?,
            technical_changes: column(row, "technical_changes")?,
            change_requestor: column(row, "change_requestor")?,
            change_reference: column(row, "change_reference")?,
            change_area: column(row, "change_area")?,
        },
        date,
        work_types: from_json("work_types_json", &work_types)?,
        categories: from_json("categories_json", &categories)?,
        costs: CostSheet {
            material_costs: cost_lines(row, "material_costs_json")?,
            labor_costs: cost_lines(row, "labor_costs_json")?,
            additional_costs: cost_lines(row, "additional_costs_json")?,
        },
        currency: column(row, "currency")?,
        time_impact_days: column(row, "time_impact_days")?,
        status: parse_status("status", &status)?,
        disposition,
        disposition_reason: column(row, "disposition_reason")?,
        decision,
        file_ids,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

fn row_to_file(row: &SqliteRow) -> Result<FileRef, RepositoryError> {
    let size: i64 = column(row, "size_bytes")?;
    Ok(FileRef {
        id: FileId(column(row, "file_id")?),
        name: column(row, "name")?,
        size: u64::try_from(size)
            .map_err(|_| RepositoryError::Decode(format!("size_bytes: {size} out of range")))?,
        content_type: column(row, "content_type")?,
        preview_url: column(row, "preview_url")?,
    })
}

fn row_to_event(row: &SqliteRow) -> Result<VariationEvent, RepositoryError> {
    let from_status: Option<String> = column(row, "from_status")?;
    let to_status: Option<String> = column(row, "to_status")?;
    let occurred_at: String = column(row, "occurred_at")?;

    Ok(VariationEvent {
        id: column(row, "id")?,
        variation_id: VariationId(column(row, "variation_id")?),
        event_type: column(row, "event_type")?,
        from_status: from_status.map(|raw| parse_status("from_status", &raw)).transpose()?,
        to_status: to_status.map(|raw| parse_status("to_status", &raw)).transpose()?,
        actor: column(row, "actor")?,
        detail: column(row, "detail")?,
        occurred_at: parse_timestamp("occurred_at", &occurred_at)?,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    use fitout_core::decision::DecisionRequest;
    use fitout_core::domain::attachment::{FileId, FileRef};
    use fitout_core::domain::cost::{AdditionalCost, LaborCost, MaterialCost};
    use fitout_core::domain::variation::{
        ChangeCategory, Disposition, DraftVariation, ProjectId, SubmitRequest, VariationDetails,
        VariationId, VariationNumber, VariationStatus, WorkType,
    };
    use fitout_core::errors::ErrorKind;
    use fitout_core::repository::{AttachmentRepository, ChangeFeed, VariationRepository};

    use super::SqlVariationRepository;
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup() -> (DbPool, SqlVariationRepository) {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        (pool.clone(), SqlVariationRepository::new(pool))
    }

    fn draft(project: &str) -> DraftVariation {
        let mut draft = DraftVariation::new(
            ProjectId(project.to_owned()),
            VariationDetails {
                title: "Pantry upgrade".to_owned(),
                change_description: "Replace pantry counter with quartz".to_owned(),
                reason_description: "Client finish upgrade".to_owned(),
                technical_changes: "20mm quartz, undermount sink".to_owned(),
                change_requestor: "Client facilities lead".to_owned(),
                change_reference: "RFI-014".to_owned(),
                change_area: "Level 3 pantry".to_owned(),
            },
        );
        draft.client_id = Some("client-7".to_owned());
        draft.date = NaiveDate::from_ymd_opt(2026, 3, 14);
        draft.work_types = BTreeSet::from([WorkType::Joinery, WorkType::Plumbing]);
        draft.categories = BTreeSet::from([ChangeCategory::Cost, ChangeCategory::Quality]);
        draft.time_impact_days = 3;
        draft.costs.material_costs.push(
            MaterialCost::new("Quartz slab", Decimal::new(25, 1), Decimal::from(300))
                .expect("material"),
        );
        draft.costs.labor_costs.push(
            LaborCost::new("Fabricator", Decimal::from(4), Decimal::new(4250, 2)).expect("labor"),
        );
        draft.costs.additional_costs.push(
            AdditionalCost::new("Disposal", "Skip hire", Decimal::from(50)).expect("additional"),
        );
        draft
    }

    fn file(id: &str) -> FileRef {
        FileRef {
            id: FileId(id.to_owned()),
            name: format!("{id}.jpg"),
            size: 48_000,
            content_type: "image/jpeg".to_owned(),
            preview_url: Some(format!("https://files.example.test/{id}/preview")),
        }
    }

    #[tokio::test]
    async fn create_and_reload_preserves_every_field() {
        let (_pool, repo) = setup().await;

        let created = repo.create(draft("P-9")).await.expect("create");
        let loaded = repo.find_by_id(&created.id).await.expect("reload");

        assert_eq!(loaded, created);
        assert_eq!(loaded.number, VariationNumber(1));
        assert_eq!(loaded.currency, "AED");
        assert_eq!(loaded.price_impact(), Decimal::from(970));
        assert!(loaded.id.0.starts_with("VAR-"));
    }

    #[tokio::test]
    async fn numbers_continue_after_discard() {
        let (_pool, repo) = setup().await;
        let first = repo.create(draft("P-9")).await.expect("first");

        repo.discard(&first.id).await.expect("discard");
        let second = repo.create(draft("P-9")).await.expect("second");
        let other = repo.create(draft("P-10")).await.expect("other project");

        assert_eq!(second.number, VariationNumber(2));
        assert_eq!(other.number, VariationNumber(1));
        let error = repo.find_by_id(&first.id).await.expect_err("discarded");
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn submit_with_disposition_persists_the_recommendation() {
        let (_pool, repo) = setup().await;
        let created = repo.create(draft("P-9")).await.expect("create");

        repo.submit_with(
            &created.id,
            SubmitRequest {
                disposition: Some(Disposition::Approve),
                disposition_reason: Some("  Within contingency ".to_owned()),
            },
        )
        .await
        .expect("submit");
        let loaded = repo.find_by_id(&created.id).await.expect("reload");

        assert_eq!(loaded.status, VariationStatus::Submitted);
        assert_eq!(loaded.disposition, Some(Disposition::Approve));
        assert_eq!(loaded.disposition_reason.as_deref(), Some("Within contingency"));
    }

    #[tokio::test]
    async fn decision_is_recorded_once() {
        let (_pool, repo) = setup().await;
        let created = repo.create(draft("P-9")).await.expect("create");
        repo.submit(&created.id).await.expect("submit");
        repo.begin_review(&created.id).await.expect("review");

        let approved = repo
            .approve(&created.id, DecisionRequest::approve("Proceed").by("client-7"))
            .await
            .expect("approve");
        let error = repo
            .decline(&created.id, DecisionRequest::decline("Too late").by("client-7"))
            .await
            .expect_err("second decision");

        assert_eq!(error.kind(), ErrorKind::Conflict);
        let loaded = repo.find_by_id(&created.id).await.expect("reload");
        assert_eq!(loaded.status, VariationStatus::Approved);
        assert_eq!(loaded.client_comment(), Some("Proceed"));
        assert_eq!(loaded.decided_at(), approved.decided_at());
    }

    #[tokio::test]
    async fn decline_without_comment_leaves_the_row_untouched() {
        let (_pool, repo) = setup().await;
        let created = repo.create(draft("P-9")).await.expect("create");
        repo.submit(&created.id).await.expect("submit");

        let error = repo
            .decline(&created.id, DecisionRequest::decline("   ").by("client-7"))
            .await
            .expect_err("comment required");

        assert_eq!(error.kind(), ErrorKind::Validation);
        let loaded = repo.find_by_id(&created.id).await.expect("reload");
        assert_eq!(loaded.status, VariationStatus::Submitted);
        assert!(loaded.decision.is_none());
    }

    #[tokio::test]
    async fn decision_from_another_client_is_rejected() {
        let (_pool, repo) = setup().await;
        let created = repo.create(draft("P-9")).await.expect("create");
        repo.submit(&created.id).await.expect("submit");

        let error = repo
            .approve(&created.id, DecisionRequest::approve("ok").by("client-8"))
            .await
            .expect_err("wrong client");

        assert_eq!(error.kind(), ErrorKind::InvalidTransition);
    }

    #[tokio::test]
    async fn anonymous_decision_is_rejected_when_a_client_is_recorded() {
        let (_pool, repo) = setup().await;
        let created = repo.create(draft("P-9")).await.expect("create");
        repo.submit(&created.id).await.expect("submit");

        let error = repo
            .approve(&created.id, DecisionRequest::approve("ok"))
            .await
            .expect_err("no decided_by");

        assert_eq!(error.kind(), ErrorKind::InvalidTransition);
        let loaded = repo.find_by_id(&created.id).await.expect("reload");
        assert_eq!(loaded.status, VariationStatus::Submitted);
        assert!(loaded.decision.is_none());
    }

    #[tokio::test]
    async fn revise_is_limited_to_drafts() {
        let (_pool, repo) = setup().await;
        let created = repo.create(draft("P-9")).await.expect("create");

        let mut revised = draft("P-9");
        revised.details.title = "Pantry upgrade rev B".to_owned();
        revised.costs.additional_costs.clear();
        let updated = repo.update_draft(&created.id, revised.clone()).await.expect("revise");
        assert_eq!(updated.price_impact(), Decimal::from(920));

        repo.submit(&created.id).await.expect("submit");
        let error = repo.update_draft(&created.id, revised).await.expect_err("frozen");
        assert_eq!(error.kind(), ErrorKind::InvalidTransition);
    }

    #[tokio::test]
    async fn attachments_follow_the_variation() {
        let (_pool, repo) = setup().await;
        let created = repo.create(draft("P-9")).await.expect("create");

        let attached = repo.attach_file(&created.id, file("F-1")).await.expect("attach");
        repo.attach_file(&created.id, file("F-2")).await.expect("attach");
        assert!(attached.file_ids.contains(&FileId("F-1".to_owned())));

        repo.delete_attached_file(&created.id, &FileId("F-1".to_owned()))
            .await
            .expect("detach");
        let files = repo.list_attached_files(&created.id).await.expect("files");
        assert_eq!(files, vec![file("F-2")]);

        let reloaded = repo.find_by_id(&created.id).await.expect("reload");
        assert_eq!(reloaded.file_ids, BTreeSet::from([FileId("F-2".to_owned())]));

        let missing = repo
            .delete_attached_file(&created.id, &FileId("F-1".to_owned()))
            .await
            .expect_err("already removed");
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn attachments_are_frozen_after_a_decision() {
        let (_pool, repo) = setup().await;
        let created = repo.create(draft("P-9")).await.expect("create");
        repo.submit(&created.id).await.expect("submit");
        repo.approve(&created.id, DecisionRequest::approve("").by("client-7"))
            .await
            .expect("approve");

        let error = repo.attach_file(&created.id, file("F-3")).await.expect_err("frozen");

        assert_eq!(error.kind(), ErrorKind::InvalidTransition);
        assert!(repo.list_attached_files(&created.id).await.expect("files").is_empty());
    }

    #[tokio::test]
    async fn change_feed_lists_transitions_in_order() {
        let (_pool, repo) = setup().await;
        let created = repo.create(draft("P-9")).await.expect("create");
        repo.attach_file(&created.id, file("F-1")).await.expect("attach");
        repo.submit(&created.id).await.expect("submit");
        repo.decline(&created.id, DecisionRequest::decline("Over budget").by("client-7"))
            .await
            .expect("decline");

        let events = repo.list_events(&created.id).await.expect("events");
        let types: Vec<&str> = events.iter().map(|event| event.event_type.as_str()).collect();

        assert_eq!(
            types,
            vec![
                "variation.created",
                "variation.file_attached",
                "variation.submitted",
                "variation.declined"
            ]
        );
        assert_eq!(events[3].from_status, Some(VariationStatus::Submitted));
        assert_eq!(events[3].to_status, Some(VariationStatus::Declined));
        assert_eq!(events[3].detail, "Over budget");
    }

    #[tokio::test]
    async fn list_by_project_skips_discarded_and_other_projects() {
        let (_pool, repo) = setup().await;
        let first = repo.create(draft("P-9")).await.expect("first");
        let second = repo.create(draft("P-9")).await.expect("second");
        repo.create(draft("P-10")).await.expect("other");
        repo.attach_file(&second.id, file("F-1")).await.expect("attach");
        repo.discard(&first.id).await.expect("discard");

        let listed = repo.list_by_project(&ProjectId("P-9".to_owned())).await.expect("list");

        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, second.id);
        assert!(listed[0].file_ids.contains(&FileId("F-1".to_owned())));
    }

    #[tokio::test]
    async fn unknown_variation_is_not_found() {
        let (_pool, repo) = setup().await;
        let id = VariationId("VAR-missing".to_owned());

        assert_eq!(repo.find_by_id(&id).await.expect_err("missing").kind(), ErrorKind::NotFound);
        assert_eq!(repo.submit(&id).await.expect_err("missing").kind(), ErrorKind::NotFound);
        assert_eq!(repo.list_events(&id).await.expect_err("missing").kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn malformed_cost_column_surfaces_as_unavailable() {
        let (pool, repo) = setup().await;
        let created = repo.create(draft("P-9")).await.expect("create");
        sqlx::query("UPDATE variation SET material_costs_json = '{\"oops\": true}' WHERE id = ?")
            .bind(&created.id.0)
            .execute(&pool)
            .await
            .expect("corrupt row");

        let error = repo.find_by_id(&created.id).await.expect_err("decode failure");

        assert_eq!(error.kind(), ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn decision_recorded_elsewhere_reports_a_conflict() {
        let (pool, repo) = setup().await;
        let created = repo.create(draft("P-9")).await.expect("create");
        repo.submit(&created.id).await.expect("submit");
        sqlx::query(
            "UPDATE variation SET status = 'approved', decision = 'approve', client_comment = '',
                decided_at = '2026-03-20T08:00:00+00:00' WHERE id = ?",
        )
        .bind(&created.id.0)
        .execute(&pool)
        .await
        .expect("decision recorded elsewhere");

        let error = repo
            .decline(&created.id, DecisionRequest::decline("No").by("client-7"))
            .await
            .expect_err("already decided");

        assert_eq!(error.kind(), ErrorKind::Conflict);
    }
}
