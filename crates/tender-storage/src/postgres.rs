use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, PgPool, Postgres, Row, Transaction};
use tender_core::{
    DedupPlan, Employee, EmployeeAssignment, FieldValue, Organisation, OrganisationLink,
    Pseudonym, PseudonymPolicy, RowMutation, Tender,
};
use tracing::warn;
use uuid::Uuid;

use crate::{EntityStore, MutationReceipt, StoreError, StoreSnapshot};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => StoreError::Unavailable(err.to_string()),
            sqlx::Error::Database(db) if db.constraint().is_some() => {
                StoreError::Constraint(db.message().to_string())
            }
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// PostgreSQL-backed entity store (schema in `migrations/`).
#[derive(Debug, Clone)]
pub struct PgEntityStore {
    pool: PgPool,
    pseudonyms: PseudonymPolicy,
}

impl PgEntityStore {
    pub async fn connect(database_url: &str, pseudonyms: PseudonymPolicy) -> Result<Self, StoreError> {
        let options = PgConnectOptions::from_str(database_url)?
            .log_slow_statements(log::LevelFilter::Warn, Duration::from_secs(5));
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;
        Ok(Self { pool, pseudonyms })
    }

    pub fn from_pool(pool: PgPool, pseudonyms: PseudonymPolicy) -> Self {
        Self { pool, pseudonyms }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn load_employees(&self) -> Result<HashMap<Uuid, Employee>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, pseudonym, display_name
              FROM employees
             ORDER BY pseudonym
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.try_get("id")?;
            let raw: String = row.try_get("pseudonym")?;
            match Pseudonym::parse(&raw, &self.pseudonyms) {
                Ok(pseudonym) => {
                    out.insert(
                        id,
                        Employee {
                            id,
                            pseudonym,
                            display_name: row.try_get("display_name")?,
                        },
                    );
                }
                Err(err) => warn!(employee_id = %id, %err, "skipping employee with invalid pseudonym"),
            }
        }
        Ok(out)
    }
}

async fn find_organisation_in(
    tx: &mut Transaction<'_, Postgres>,
    name: &str,
) -> Result<Option<Organisation>, StoreError> {
    let row = sqlx::query("SELECT id, name FROM organisations WHERE name = $1")
        .bind(name)
        .fetch_optional(&mut **tx)
        .await?;
    match row {
        Some(row) => Ok(Some(Organisation {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
        })),
        None => Ok(None),
    }
}

async fn write_field(
    tx: &mut Transaction<'_, Postgres>,
    tender_id: Uuid,
    column: &str,
    value: &FieldValue,
) -> Result<(), StoreError> {
    // column comes from TenderField::column, never from input
    let sql = format!("UPDATE tenders SET {column} = $1, updated_at = now() WHERE id = $2");
    let query = sqlx::query(&sql);
    let query = match value {
        FieldValue::Text(v) => query.bind(v.clone()),
        FieldValue::Number(v) => query.bind(*v),
        FieldValue::Date(v) => query.bind(*v),
    };
    let result = query.bind(tender_id).execute(&mut **tx).await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound {
            entity: "tender",
            id: tender_id,
        });
    }
    Ok(())
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn load_snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        let employees = self.load_employees().await?;

        let rows = sqlx::query(
            r#"
            SELECT id, title, short_description, notes, status, tender_type,
                   volume_euro, volume_hours, offer_deadline, question_deadline,
                   binding_deadline, project_start, project_end
              FROM tenders
             ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tenders = Vec::with_capacity(rows.len());
        let mut position = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.try_get("id")?;
            let mut tender = Tender::new(id, row.try_get::<String, _>("title")?);
            tender.short_description = row.try_get("short_description")?;
            tender.notes = row.try_get("notes")?;
            tender.status = row.try_get("status")?;
            tender.tender_type = row.try_get("tender_type")?;
            tender.volume_euro = row.try_get("volume_euro")?;
            tender.volume_hours = row.try_get("volume_hours")?;
            tender.offer_deadline = row.try_get::<Option<NaiveDate>, _>("offer_deadline")?;
            tender.question_deadline = row.try_get("question_deadline")?;
            tender.binding_deadline = row.try_get("binding_deadline")?;
            tender.project_start = row.try_get("project_start")?;
            tender.project_end = row.try_get("project_end")?;
            position.insert(id, tenders.len());
            tenders.push(tender);
        }

        let links = sqlx::query(
            r#"
            SELECT l.id, l.tender_id, l.organisation_id, o.name, l.role
              FROM tender_organisations l
              JOIN organisations o ON o.id = l.organisation_id
             ORDER BY l.seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        for row in links {
            let tender_id: Uuid = row.try_get("tender_id")?;
            if let Some(idx) = position.get(&tender_id) {
                tenders[*idx].organisations.push(OrganisationLink {
                    id: row.try_get("id")?,
                    organisation_id: row.try_get("organisation_id")?,
                    organisation_name: row.try_get("name")?,
                    role: row.try_get("role")?,
                });
            }
        }

        let assignments = sqlx::query(
            r#"
            SELECT id, tender_id, employee_id, role
              FROM tender_employees
             ORDER BY seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        for row in assignments {
            let tender_id: Uuid = row.try_get("tender_id")?;
            let employee_id: Uuid = row.try_get("employee_id")?;
            let (Some(idx), Some(employee)) = (position.get(&tender_id), employees.get(&employee_id)) else {
                continue;
            };
            tenders[*idx].employees.push(EmployeeAssignment {
                id: row.try_get("id")?,
                employee_id,
                pseudonym: employee.pseudonym.clone(),
                role: row.try_get("role")?,
            });
        }

        let mut employees = employees.into_values().collect::<Vec<_>>();
        employees.sort_by(|a, b| a.pseudonym.cmp(&b.pseudonym));
        Ok(StoreSnapshot { tenders, employees })
    }

    async fn find_organisation_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Organisation>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let found = find_organisation_in(&mut tx, name).await?;
        tx.commit().await?;
        Ok(found)
    }

    async fn apply_row_mutation(
        &self,
        mutation: &RowMutation,
    ) -> Result<MutationReceipt, StoreError> {
        if mutation.is_empty() {
            return Ok(MutationReceipt::default());
        }
        let mut receipt = MutationReceipt::default();
        let mut tx = self.pool.begin().await?;

        for change in mutation.update.iter() {
            write_field(&mut tx, mutation.tender_id, change.field.column(), &change.next).await?;
            receipt.fields_written += 1;
        }

        if let Some(link) = &mutation.new_organisation_link {
            let organisation_id = match find_organisation_in(&mut tx, &link.organisation_name).await? {
                Some(existing) => existing.id,
                None => {
                    let id = Uuid::new_v4();
                    sqlx::query("INSERT INTO organisations (id, name) VALUES ($1, $2)")
                        .bind(id)
                        .bind(&link.organisation_name)
                        .execute(&mut *tx)
                        .await?;
                    receipt.organisation_created = true;
                    id
                }
            };
            sqlx::query(
                "INSERT INTO tender_organisations (id, tender_id, organisation_id, role) VALUES ($1, $2, $3, $4)",
            )
            .bind(Uuid::new_v4())
            .bind(mutation.tender_id)
            .bind(organisation_id)
            .bind(&link.role)
            .execute(&mut *tx)
            .await?;
            receipt.organisation_link_created = true;
        }

        for assignment in &mutation.new_assignments {
            sqlx::query(
                "INSERT INTO tender_employees (id, tender_id, employee_id, role) VALUES ($1, $2, $3, $4)",
            )
            .bind(Uuid::new_v4())
            .bind(mutation.tender_id)
            .bind(assignment.employee_id)
            .bind(&assignment.role)
            .execute(&mut *tx)
            .await?;
            receipt.assignments_created += 1;
        }

        tx.commit().await?;
        Ok(receipt)
    }

    async fn apply_dedup_plan(&self, tender_id: Uuid, plan: &DedupPlan) -> Result<(), StoreError> {
        if plan.is_noop() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for id in &plan.delete {
            let result = sqlx::query("DELETE FROM tender_employees WHERE id = $1 AND tender_id = $2")
                .bind(id)
                .bind(tender_id)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound {
                    entity: "employee assignment",
                    id: *id,
                });
            }
        }
        for relabel in &plan.relabel {
            let result = sqlx::query("UPDATE tender_employees SET role = $1 WHERE id = $2 AND tender_id = $3")
                .bind(&relabel.role)
                .bind(relabel.assignment_id)
                .bind(tender_id)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound {
                    entity: "employee assignment",
                    id: relabel.assignment_id,
                });
            }
        }
        tx.commit().await?;
        Ok(())
    }
}
