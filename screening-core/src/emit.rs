//! Định dạng kết luận thành bản ghi đầu ra.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{Verdict, VerdictStatus};

/// Bản ghi đầu ra cho một ca phẫu thuật, ghi thành một dòng JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertRecord {
    pub patient_id: String,
    pub procedure_id: String,
    pub scheduled_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_result_at: Option<String>,
    pub status: VerdictStatus,
    pub alert: bool,
    pub reason: String,
}

impl From<&Verdict> for AlertRecord {
    fn from(verdict: &Verdict) -> Self {
        Self {
            patient_id: verdict.patient_id.clone(),
            procedure_id: verdict.procedure_id.clone(),
            scheduled_at: format_instant(verdict.scheduled_at),
            latest_result_at: verdict.latest_result_at.map(format_instant),
            status: verdict.status,
            alert: verdict.alert(),
            reason: verdict.reason.clone(),
        }
    }
}

pub fn emit(verdict: &Verdict) -> AlertRecord {
    AlertRecord::from(verdict)
}

/// RFC 3339, độ chính xác giây, hậu tố `Z`.
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}
