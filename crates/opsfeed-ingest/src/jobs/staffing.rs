//! Staffing tracker sheets
//!
//! Both sheets are small snapshots read in full on every run. Employees go
//! through staging and the merge procedure; weekly goals are upserted on
//! (employee email, first day of week).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::sync::Arc;

use crate::framework::{
    ClaimPolicy, ColumnSpec, ColumnType, DeliveryMode, Derivation, IngestJob, RawRecord, SourceError, TableSchema,
    WorkUnit,
};
use crate::sources::SheetsSource;

pub const EMPLOYEES_JOB_NAME: &str = "staffing-employees";
pub const GOALS_JOB_NAME: &str = "staffing-goals";

const SHEET_DATE: &str = "%d/%m/%Y";

pub fn employee_schema() -> TableSchema {
    TableSchema::new("legal.employee_staging")
        .promoted_by("legal.update_employee")
        .columns_from([
            ColumnSpec::text("email", "Email").required(),
            ColumnSpec::text("name", "Employee name"),
            ColumnSpec::text("position", "Position"),
            ColumnSpec::text("tower", "Tower"),
            ColumnSpec::text("team", "Team"),
            ColumnSpec::text("supervisor", "Supervisor"),
            ColumnSpec::text("manager", "Manager"),
            ColumnSpec::date("hire", "Hiring date", SHEET_DATE),
            ColumnSpec::date("fire", "Last working day", SHEET_DATE),
            ColumnSpec::text("country", "Country"),
            ColumnSpec::date("birth", "Date of birth", SHEET_DATE),
            ColumnSpec::text("phone", "Personal Phone Number"),
            ColumnSpec::text("work_phone", "Company Phone Number"),
            ColumnSpec::text("schedule_daylight", "Schedule Daylight (EST)"),
            ColumnSpec::text("schedule_standard", "Schedule (EST)"),
            ColumnSpec::derived("lastmodifieddate", Derivation::IngestedAt),
        ])
}

pub fn goals_schema() -> TableSchema {
    TableSchema::new("legal.goals").columns_from([
        ColumnSpec::text("team", "Team"),
        ColumnSpec::text("week_first_day", "1st Day Week").required(),
        ColumnSpec::integer("week_number", "week number"),
        ColumnSpec::text("employee", "Name"),
        ColumnSpec::field("employee_email", "Email", ColumnType::LowerText).required(),
        ColumnSpec::float("goal", "Goal Productivity"),
    ])
}

/// One sheet range as a snapshot feed
pub struct SheetJob {
    name: &'static str,
    sheets: Arc<SheetsSource>,
    range: String,
    delivery: DeliveryMode,
    schema: TableSchema,
}

impl SheetJob {
    pub fn employees(sheets: Arc<SheetsSource>, range: impl Into<String>) -> Self {
        Self {
            name: EMPLOYEES_JOB_NAME,
            sheets,
            range: range.into(),
            delivery: DeliveryMode::Staged,
            schema: employee_schema(),
        }
    }

    pub fn goals(sheets: Arc<SheetsSource>, range: impl Into<String>) -> Self {
        Self {
            name: GOALS_JOB_NAME,
            sheets,
            range: range.into(),
            delivery: DeliveryMode::upsert_on(&["employee_email", "week_first_day"]),
            schema: goals_schema(),
        }
    }
}

#[async_trait]
impl IngestJob for SheetJob {
    fn name(&self) -> &str {
        self.name
    }

    fn claim_policy(&self) -> ClaimPolicy {
        ClaimPolicy::Untracked
    }

    fn delivery(&self) -> DeliveryMode {
        self.delivery.clone()
    }

    fn schema_for<'a>(&'a self, _records: &[RawRecord]) -> Cow<'a, TableSchema> {
        Cow::Borrowed(&self.schema)
    }

    async fn enumerate(&self, now: DateTime<Utc>) -> Result<Vec<WorkUnit>, SourceError> {
        let snapshot = now.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        Ok(vec![WorkUnit::new(snapshot, self.range.clone())])
    }

    async fn fetch(&self, unit: &WorkUnit) -> Result<Vec<RawRecord>, SourceError> {
        self.sheets.records(&unit.locator).await
    }
}
