use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::pipeline::diagnostics::{ErrorCategory, ErrorLogEntry, ErrorSeverity, LogContext};

const SELECT_COLUMNS: &str = "id, parent_id, category, severity, message, details, stack,
    request_id, document_id, project_id, user_id, file_name, file_type, file_size, created_at";

/// Append one diagnostic entry to the error_log table.
pub fn insert_error_log(conn: &Connection, entry: &ErrorLogEntry) -> Result<(), DatabaseError> {
    let details = entry.details.as_ref().map(|d| d.to_string());
    conn.execute(
        "INSERT INTO error_log (id, parent_id, category, severity, message, details, stack,
         request_id, document_id, project_id, user_id, file_name, file_type, file_size, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            entry.id.to_string(),
            entry.parent_id.map(|p| p.to_string()),
            entry.category.as_str(),
            entry.severity.as_str(),
            entry.message,
            details,
            entry.stack,
            entry.context.request_id,
            entry.context.document_id,
            entry.context.project_id,
            entry.context.user_id,
            entry.context.file_name,
            entry.context.file_type,
            entry.context.file_size.map(|s| s as i64),
            entry.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        ],
    )?;
    Ok(())
}

/// Entries for one document, newest first.
pub fn error_logs_for_document(
    conn: &Connection,
    document_id: &str,
) -> Result<Vec<ErrorLogEntry>, DatabaseError> {
    query_entries(
        conn,
        &format!(
            "SELECT {SELECT_COLUMNS} FROM error_log WHERE document_id = ?1
             ORDER BY created_at DESC, rowid DESC"
        ),
        document_id,
    )
}

/// Entries for one project, newest first.
pub fn error_logs_for_project(
    conn: &Connection,
    project_id: &str,
) -> Result<Vec<ErrorLogEntry>, DatabaseError> {
    query_entries(
        conn,
        &format!(
            "SELECT {SELECT_COLUMNS} FROM error_log WHERE project_id = ?1
             ORDER BY created_at DESC, rowid DESC"
        ),
        project_id,
    )
}

fn query_entries(
    conn: &Connection,
    sql: &str,
    key: &str,
) -> Result<Vec<ErrorLogEntry>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params![key], row_to_stored)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(StoredRow::into_entry).collect()
}

/// Raw column values; enum and timestamp parsing happens outside the
/// rusqlite row callback so failures surface as `DatabaseError`.
struct StoredRow {
    id: String,
    parent_id: Option<String>,
    category: String,
    severity: String,
    message: String,
    details: Option<String>,
    stack: Option<String>,
    request_id: String,
    document_id: Option<String>,
    project_id: Option<String>,
    user_id: Option<String>,
    file_name: Option<String>,
    file_type: Option<String>,
    file_size: Option<i64>,
    created_at: String,
}

fn row_to_stored(row: &Row<'_>) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        category: row.get(2)?,
        severity: row.get(3)?,
        message: row.get(4)?,
        details: row.get(5)?,
        stack: row.get(6)?,
        request_id: row.get(7)?,
        document_id: row.get(8)?,
        project_id: row.get(9)?,
        user_id: row.get(10)?,
        file_name: row.get(11)?,
        file_type: row.get(12)?,
        file_size: row.get(13)?,
        created_at: row.get(14)?,
    })
}

impl StoredRow {
    fn into_entry(self) -> Result<ErrorLogEntry, DatabaseError> {
        let category = ErrorCategory::parse(&self.category).ok_or_else(|| {
            DatabaseError::InvalidEnum {
                field: "category".into(),
                value: self.category.clone(),
            }
        })?;
        let severity = ErrorSeverity::parse(&self.severity).ok_or_else(|| {
            DatabaseError::InvalidEnum {
                field: "severity".into(),
                value: self.severity.clone(),
            }
        })?;
        let details = self
            .details
            .map(|d| serde_json::from_str(&d))
            .transpose()
            .map_err(|e| invalid("details", e))?;
        let timestamp = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| invalid("created_at", e))?
            .with_timezone(&Utc);

        Ok(ErrorLogEntry {
            id: parse_uuid("id", &self.id)?,
            parent_id: self
                .parent_id
                .as_deref()
                .map(|p| parse_uuid("parent_id", p))
                .transpose()?,
            category,
            severity,
            message: self.message,
            details,
            stack: self.stack,
            context: LogContext {
                request_id: self.request_id,
                document_id: self.document_id,
                project_id: self.project_id,
                user_id: self.user_id,
                file_name: self.file_name,
                file_type: self.file_type,
                file_size: self.file_size.map(|s| s as u64),
            },
            timestamp,
        })
    }
}

fn parse_uuid(field: &str, value: &str) -> Result<Uuid, DatabaseError> {
    Uuid::from_str(value).map_err(|e| invalid(field, e))
}

fn invalid(field: &str, reason: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
