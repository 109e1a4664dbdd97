//! CRM differential backup jobs
//!
//! Each `<date>_Differential/` folder under the backup prefix is one work
//! unit; the job reads every CSV in its object's sub-folder. Matter exports
//! carry whatever columns the CRM has, so their schema is built from the CSV
//! header. Task and user exports load a fixed column list.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::framework::{Classification, IngestJob, RawRecord, SourceError, TableSchema, WorkUnit};
use crate::sources::{folder_key, parse_csv, ObjectSource};

pub const MATTER_JOB_NAME: &str = "matter-backup";
pub const TASK_JOB_NAME: &str = "task-backup";
pub const USER_JOB_NAME: &str = "user-backup";

const MATTER_TIMESTAMPS: &[&str] = &[
    "createddate",
    "lastmodifieddate",
    "systemmodstamp",
    "lastactivitydate",
    "litify_pm__open_date__c",
    "litify_pm__last_called_at__c",
    "litify_pm__last_emailed_at__c",
    "litify_pm__closed_date__c",
    "litify_pm__filed_date__c",
    "rfe_deadline__c",
    "emergency_deadline_date__c",
    "approved_denied_date__c",
    "psych_eval_date__c",
    "submitted_to_uscis__c",
    "reviewed_with_cl__c",
    "ff_paid_on__c",
    "receipt_notices_received__c",
    "fingerprint_appointment__c",
    "psych_eval_completed__c",
    "psych_eval_submitted_to_uscis__c",
    "rfe_received__c",
    "rfe_submission__c",
    "received_prima_facie__c",
    "received_work_permit__c",
    "checkboxf__c",
    "foia_request__c",
    "fbi_submission__c",
    "appeal_deadline__c",
    "approval_received__c",
    "denial_received__c",
    "client_notified__c",
    "uscis_receipt_cl_notified__c",
    "fingerprint_cl_notified__c",
    "rfe_received_cl_notified__c",
    "work_permit_cl_notified__c",
    "approval_received_cl_notified__c",
    "denial_received_cl_notified__c",
    "received_work_permit2__c",
    "work_permit_cl_notified2__c",
    "docs_collected__c",
    "accurint_report_completed__c",
    "sign_up_day__c",
    "cl_interview__c",
    "delivered_on__c",
    "intreview_completed__c",
    "forms_completed__c",
    "rejection_received__c",
    "refiling_date__c",
    "prima_facie_cl_notified__c",
    "early_aos_requested__c",
    "early_aos_requested_cl_notified__c",
    "early_aos_approved_cl_notified__c",
    "aos_approval_received__c",
    "referred_out_for_pe__c",
    "latest_case_update__c",
    "rfe_delivery__c",
    "qc_completed__c",
    "follow_up_date__c",
    "date_ff_paid_on__c",
    "noid_received__c",
    "noid_responded__c",
    "pre_rfe_date__c",
    "latest_docs_fu__c",
    "i_485_interview_360__c",
    "i_485_interview_aos__c",
    "asc_appointment_date__c",
    "welcome_email_sent__c",
    "last_auto_txt_communication__c",
    "pif2__c",
    "bonafide_received__c",
    "status_changed_date_time__c",
    "concern_raised__c",
    "concern_resolved__c",
    "dec_forms_sent_for_review__c",
];

const MATTER_BOOLEANS: &[&str] = &[
    "isdeleted",
    "litify_pm__billable_matter__c",
    "litify_pm__ignore_default_plan__c",
    "litify_pm__limitations_date_satisfied__c",
    "litify_pm__matter_has_budget__c",
    "litify_pm__matter_team_modified__c",
    "litify_pm__manual_statute_of_limitations__c",
    "run_triggers__c",
    "litify_ext__isteammember__c",
    "litify_ext__private__c",
    "isdeceased__c",
    "serious_injury__c",
    "isminor__c",
    "conflict_check__c",
    "payment_overdue__c",
    "payments_criteria_2months__c",
    "is_synced__c",
    "urgent__c",
    "not_financial_user__c",
    "filling_fees_paid__c",
    "attorney_or_paralegal__c",
    "is_cl_specialist__c",
    "automatic_form_errors__c",
    "checkboxdate__c",
    "priority__c",
    "case_submitted__c",
    "pif__c",
    "foia_eoir__c",
    "filled_fee_is_filled_automation__c",
    "case_delivered__c",
    "attorney_approval__c",
    "consent_for_mts__c",
    "official_records__c",
    "early_aos_request__c",
    "mtt__c",
    "pro_bono__c",
    "marked_for_rfe_tagging__c",
    "ff_confirmed__c",
    "submission_qc__c",
    "removal__c",
    "original_docs_at_the_office__c",
    "i_765_filled__c",
    "cl_detained__c",
    "supervisor_call__c",
    "supervisor_call_resolved__c",
    "flagged_for_issues__c",
    "template_needed__c",
    "cases_sold_with__c",
    "money_back_guarantee__c",
    "archived__c",
    "unresponsive_client__c",
    "sensitive_case__c",
    "criminal_offense__c",
    "monitor_delivery__c",
    "post_dec_forms_review_edits__c",
    "attorney_call_needed__c",
    "case_monitoring__c",
    "open_warrant__c",
    "i_131__c",
    "claim_issue_found__c",
    "signature__c",
    "full_translation__c",
    "form_update__c",
];

const MATTER_INTEGERS: &[&str] = &[
    "live_saved__c",
    "lives_saved__c",
    "no_of_days__c",
    "turnaround_time__c",
    "count_role_records__c",
    "case_count__c",
    "live_associated__c",
    "litify_pm__matter__c",
    "litify_pm__total_calls__c",
    "successful_calls__c",
    "litify_pm__total_emails__c",
];

const MATTER_FLOATS: &[&str] = &[
    "litify_pm__total_damages__c",
    "scheduled_amount__c",
    "litify_pm__total_hours__c",
    "litify_pm__total_amount_billable__c",
    "litify_pm__total_amount_due__c",
    "litify_pm__total_matter_value__c",
    "litify_pm__total_matter_cost__c",
    "litify_pm__total_amount_paid__c",
    "litify_pm__total_amount_billed__c",
    "litify_pm__total_amount_expensed_due__c",
    "litify_pm__total_amount_expensed__c",
    "litify_pm__total_amount_retained__c",
    "litify_pm__total_amount_unbilled_expenses__c",
    "litify_pm__total_amount_time_entries__c",
    "litify_pm__total_amount_time_entries_billed__c",
    "litify_pm__total_amount_time_entries_due__c",
    "litify_pm__total_amount_time_entries_unpaid__c",
    "litify_pm__lit_lien_total_currency__c",
    "litify_pm__lit_total_client_payout__c",
    "litify_pm__lit_damage_total__c",
    "litify_pm__lit_expense_total__c",
    "litify_pm__lit_lien_total__c",
    "total_billable_expenses__c",
    "total_unbilled_expenses__c",
    "total_billable_te__c",
    "total_unbilled_time_entries__c",
    "total_invoiced_amount__c",
    "total_payments_received__c",
    "total_expenses__c",
    "total_billed_expenses__c",
    "total_time_entries__c",
    "total_billed_time_entries__c",
    "total_payments_due__c",
    "total_uninvoiced_amount__c",
    "payment__c",
    "total_filing_fee__c",
    "total_overdue_amount__c",
    "urgentoverdue__c",
];

const TASK_COLUMNS: &[&str] = &[
    "whatid",
    "subject",
    "activitydate",
    "status",
    "priority",
    "ishighpriority",
    "ownerid",
    "description",
    "isclosed",
    "createddate",
    "createdbyid",
    "lastmodifieddate",
    "lastmodifiedbyid",
    "systemmodstamp",
    "reminderdatetime",
    "isreminderset",
    "isrecurrence",
    "in_progress_date__c",
    "tasksubtype",
    "completeddatetime",
    "litify_ext__status__c",
    "litify_pm__default_matter_task__c",
    "litify_pm__matter_stage_activity__c",
    "litify_pm__associatedobjectname__c",
    "litify_pm__completed_date__c",
    "litify_pm__assigneename__c",
    "litify_pm__matterstage__c",
    "litify_pm__userrolerelatedjunction__c",
    "show_on_calendar__c",
    "completed_date__c",
    "id",
    "completed_by__c",
];

const TASK_TIMESTAMPS: &[&str] = &[
    "activitydate",
    "completed_date__c",
    "in_progress_date__c",
    "createddate",
    "lastmodifieddate",
    "completeddatetime",
    "litify_pm__completed_date__c",
    "systemmodstamp",
    "reminderdatetime",
];

const TASK_BOOLEANS: &[&str] = &[
    "ishighpriority",
    "isclosed",
    "isreminderset",
    "isrecurrence",
    "show_on_calendar__c",
];

const USER_COLUMNS: &[&str] = &[
    "id",
    "username",
    "alias",
    "communitynickname",
    "firstname",
    "lastname",
    "title",
    "cm_job_title__c",
    "cm_job_title_multi__c",
    "department__c",
    "isactive",
    "startday",
    "endday",
    "companyname",
    "timezonesidkey",
    "localesidkey",
    "usertype",
    "passwordexpirationdate",
    "systemmodstamp",
    "lastpasswordchangedate",
    "createddate",
    "createdbyid",
    "lastmodifieddate",
    "lastmodifiedbyid",
    "lastlogindate",
    "receivesinfoemails",
    "receivesadmininfoemails",
    "numberoffailedlogins",
    "dfsle__username__c",
    "dfsle__status__c",
    "dfsle__provisioned__c",
    "dfsle__canmanageaccount__c",
    "aboutme",
    "federationidentifier",
    "attorneys_per_page__c",
    "lastreferenceddate",
    "lastvieweddate",
    "defaultgroupnotificationfrequency",
    "digestfrequency",
    "profileid",
];

const USER_TIMESTAMPS: &[&str] = &[
    "lastvieweddate",
    "lastreferenceddate",
    "lastlogindate",
    "lastmodifieddate",
    "createddate",
    "lastpasswordchangedate",
    "systemmodstamp",
    "passwordexpirationdate",
    "dfsle__provisioned__c",
];

const USER_BOOLEANS: &[&str] = &[
    "isactive",
    "receivesinfoemails",
    "receivesadmininfoemails",
    "dfsle__canmanageaccount__c",
];

const USER_FLOATS: &[&str] = &["startday", "endday", "numberoffailedlogins"];

pub fn matter_classification() -> Classification {
    Classification::new()
        .timestamps(MATTER_TIMESTAMPS)
        .booleans(MATTER_BOOLEANS)
        .integers(MATTER_INTEGERS)
        .floats(MATTER_FLOATS)
}

pub fn task_schema() -> TableSchema {
    let classification = Classification::new().timestamps(TASK_TIMESTAMPS).booleans(TASK_BOOLEANS);
    TableSchema::new("litify.task_staging")
        .promoted_by("litify.update_litify_task")
        .columns_from(classification.specs(TASK_COLUMNS.iter().copied()))
}

pub fn user_schema() -> TableSchema {
    let classification = Classification::new()
        .timestamps(USER_TIMESTAMPS)
        .booleans(USER_BOOLEANS)
        .floats(USER_FLOATS);
    TableSchema::new("litify.dim_users_staging")
        .promoted_by("litify.update_litify_user")
        .columns_from(classification.specs(USER_COLUMNS.iter().copied()))
}

/// How a backup job turns CSV rows into staging columns
pub enum BackupColumns {
    /// One column per header field, typed by classification
    FromHeader {
        table: &'static str,
        procedure: &'static str,
        classification: Classification,
    },
    Fixed(TableSchema),
}

/// Union of the record keys in first-seen order
fn header_columns(records: &[RawRecord]) -> Vec<&str> {
    let mut seen = HashSet::new();
    records
        .iter()
        .flat_map(|r| r.keys())
        .map(String::as_str)
        .filter(|name| seen.insert(*name))
        .collect()
}

pub struct BackupJob {
    name: &'static str,
    object_folder: &'static str,
    store: Arc<dyn ObjectSource>,
    prefix: String,
    columns: BackupColumns,
}

impl BackupJob {
    pub fn new(
        name: &'static str,
        object_folder: &'static str,
        store: Arc<dyn ObjectSource>,
        prefix: impl Into<String>,
        columns: BackupColumns,
    ) -> Self {
        Self {
            name,
            object_folder,
            store,
            prefix: prefix.into(),
            columns,
        }
    }

    /// Columns follow the export header, so a field the staging table lacks
    /// fails the folder until the table is migrated
    pub fn matters(store: Arc<dyn ObjectSource>, prefix: impl Into<String>) -> Self {
        Self::new(
            MATTER_JOB_NAME,
            "litify_pm__Matter__c/",
            store,
            prefix,
            BackupColumns::FromHeader {
                table: "litify.matter_staging",
                procedure: "litify.update_litify_matter",
                classification: matter_classification(),
            },
        )
    }

    pub fn tasks(store: Arc<dyn ObjectSource>, prefix: impl Into<String>) -> Self {
        Self::new(TASK_JOB_NAME, "Task/", store, prefix, BackupColumns::Fixed(task_schema()))
    }

    pub fn users(store: Arc<dyn ObjectSource>, prefix: impl Into<String>) -> Self {
        Self::new(USER_JOB_NAME, "User/", store, prefix, BackupColumns::Fixed(user_schema()))
    }
}

#[async_trait]
impl IngestJob for BackupJob {
    fn name(&self) -> &str {
        self.name
    }

    fn prefilter_claimed(&self) -> bool {
        true
    }

    fn schema_for<'a>(&'a self, records: &[RawRecord]) -> Cow<'a, TableSchema> {
        match &self.columns {
            BackupColumns::Fixed(schema) => Cow::Borrowed(schema),
            BackupColumns::FromHeader {
                table,
                procedure,
                classification,
            } => Cow::Owned(
                TableSchema::new(*table)
                    .promoted_by(*procedure)
                    .columns_from(classification.specs(header_columns(records))),
            ),
        }
    }

    async fn enumerate(&self, _now: DateTime<Utc>) -> Result<Vec<WorkUnit>, SourceError> {
        let folders = self.store.list_folders(&self.prefix).await?;
        let units: Vec<WorkUnit> = folders
            .iter()
            .filter_map(|folder| match folder_key(folder) {
                Some(key) => Some(WorkUnit::new(key, folder.clone())),
                None => {
                    debug!(folder = %folder, "Not a differential folder, ignoring");
                    None
                },
            })
            .collect();
        info!(folders = folders.len(), units = units.len(), "Enumerated backup folders");
        Ok(units)
    }

    async fn fetch(&self, unit: &WorkUnit) -> Result<Vec<RawRecord>, SourceError> {
        let object_prefix = format!("{}{}", unit.locator, self.object_folder);
        let keys = self.store.list_keys(&object_prefix).await?;

        let mut records = Vec::new();
        let mut files = 0usize;
        for key in keys.iter().filter(|k| k.ends_with(".csv")) {
            let bytes = self.store.get_bytes(key).await?;
            let rows = parse_csv(&bytes).map_err(|e| match e {
                SourceError::Unit(message) => SourceError::Unit(format!("{key}: {message}")),
                other => other,
            })?;
            debug!(file = %key, rows = rows.len(), "Read backup CSV");
            records.extend(rows);
            files += 1;
        }

        if files == 0 {
            info!(unit = %unit.key, folder = %object_prefix, "No CSV files for this object");
        }
        Ok(records)
    }
}
