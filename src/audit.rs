//! Audit trail
//!
//! One JSON line per call, in `audit_YYYY-MM-DD.jsonl` segments named by the
//! UTC date the call started. Writing never fails a call: errors are logged.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::AuditConfig;
use crate::model::{AuditRecord, ToolCallRequest, ToolCallResult, ToolCallStatus};
use crate::{Error, Result};

const SEGMENT_PREFIX: &str = "audit_";
const SEGMENT_SUFFIX: &str = ".jsonl";

/// Filter for [`AuditLogger::query`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    /// Calls that started at or after this time
    pub start_time: Option<DateTime<Utc>>,
    /// Calls that started at or before this time
    pub end_time: Option<DateTime<Utc>>,
    /// Only this caller
    pub caller_agent: Option<String>,
    /// Only this logical tool
    pub logical_name: Option<String>,
    /// Only this session
    pub session_id: Option<String>,
    /// Maximum records returned; the logger default when unset
    pub limit: Option<usize>,
}

impl AuditQuery {
    fn matches(&self, record: &AuditRecord) -> bool {
        self.start_time.is_none_or(|t| record.start_time >= t)
            && self.end_time.is_none_or(|t| record.start_time <= t)
            && self
                .caller_agent
                .as_deref()
                .is_none_or(|c| record.caller_agent == c)
            && self
                .logical_name
                .as_deref()
                .is_none_or(|n| record.logical_name == n)
            && self
                .session_id
                .as_deref()
                .is_none_or(|s| record.session_id.as_deref() == Some(s))
    }

    fn covers_date(&self, date: NaiveDate) -> bool {
        self.start_time.is_none_or(|t| date >= t.date_naive())
            && self.end_time.is_none_or(|t| date <= t.date_naive())
    }
}

/// Append-only audit logger
pub struct AuditLogger {
    directory: PathBuf,
    max_result_length: usize,
    query_limit: usize,
    write_lock: Mutex<()>,
}

impl AuditLogger {
    /// Create the logger, creating the directory if needed
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(config: &AuditConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.directory).map_err(|e| {
            Error::Config(format!(
                "Failed to create audit directory {}: {e}",
                config.directory.display()
            ))
        })?;
        info!(directory = %config.directory.display(), "Audit logger initialized");

        Ok(Self {
            directory: config.directory.clone(),
            max_result_length: config.max_result_length,
            query_limit: config.query_limit,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the segments
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Segment file for calls started on `date`
    pub fn segment_path(&self, date: NaiveDate) -> PathBuf {
        self.directory.join(format!(
            "{SEGMENT_PREFIX}{}{SEGMENT_SUFFIX}",
            date.format("%Y-%m-%d")
        ))
    }

    /// Record a finished call
    pub async fn log_call(&self, request: &ToolCallRequest, result: &ToolCallResult) {
        let record = AuditRecord::from_call(request, result, self.max_result_length);

        info!(
            target: "audit",
            request_id = %record.request_id,
            caller_agent = %record.caller_agent,
            logical_name = %record.logical_name,
            physical_tool = %record.physical_tool,
            mcp_server = %record.mcp_server,
            status = %record.status,
            success = record.status == ToolCallStatus::Success,
            duration_ms = record.duration_ms,
            "Tool call"
        );

        if let Err(e) = self.write(&record).await {
            error!(request_id = %record.request_id, error = %e, "Failed to write audit record");
        }
    }

    async fn write(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let path = self.segment_path(record.start_time.date_naive());

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Matching records, most recent first
    ///
    /// # Errors
    ///
    /// Returns an error if the audit directory cannot be listed.
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        let limit = query.limit.unwrap_or(self.query_limit);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut segments = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(date) = segment_date(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            if query.covers_date(date) {
                segments.push((date, entry.path()));
            }
        }
        segments.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        let mut records = Vec::new();
        for (_, path) in segments {
            let text = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read audit segment");
                    continue;
                }
            };

            let mut matched: Vec<AuditRecord> = text
                .lines()
                .filter(|line| !line.trim().is_empty())
                .filter_map(|line| match serde_json::from_str::<AuditRecord>(line) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping malformed audit line");
                        None
                    }
                })
                .filter(|record| query.matches(record))
                .collect();
            matched.sort_by(|a, b| b.start_time.cmp(&a.start_time));
            records.extend(matched);

            if records.len() >= limit {
                break;
            }
        }

        records.truncate(limit);
        debug!(count = records.len(), "Audit query complete");
        Ok(records)
    }
}

fn segment_date(file_name: &str) -> Option<NaiveDate> {
    let date = file_name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}
