//! Đánh giá hiệu lực theo thời gian cho từng ca phẫu thuật.

use std::borrow::Borrow;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::{
    parse_instant, LabResult, NotEvaluable, Procedure, ScreeningConfig, Verdict, VerdictStatus,
};

/// Bộ đánh giá không trạng thái; mỗi lần gọi `evaluate` độc lập với nhau.
#[derive(Debug, Clone)]
pub struct ValidityEvaluator {
    window: Duration,
    validity_hours: u32,
    panel_label: String,
}

impl ValidityEvaluator {
    pub fn new(config: &ScreeningConfig) -> Self {
        Self {
            window: config.window(),
            validity_hours: config.validity_hours,
            panel_label: config.panel_label.clone(),
        }
    }

    /// Tìm kết quả hợp lệ mới nhất không muộn hơn thời điểm phẫu thuật và phân loại ca.
    ///
    /// `qualifying` chỉ nên chứa kết quả đã qua bộ phân loại; kết quả của bệnh nhân khác
    /// bị bỏ qua. Iterator được duyệt một lần, không gom vào bộ nhớ.
    pub fn evaluate<I>(&self, procedure: &Procedure, qualifying: I) -> Result<Verdict, NotEvaluable>
    where
        I: IntoIterator,
        I::Item: Borrow<LabResult>,
    {
        let (patient_id, scheduled_at) = procedure.target()?;
        // None: cửa sổ vượt quá phạm vi thời gian biểu diễn được, coi như không giới hạn.
        let window_start = scheduled_at.checked_sub_signed(self.window);

        let latest_result_at = qualifying
            .into_iter()
            .filter_map(|result| {
                let result: &LabResult = result.borrow();
                if result.subject_id.as_deref() == Some(patient_id) {
                    result_instant(result)
                } else {
                    None
                }
            })
            // Kết quả sau giờ phẫu thuật không được tính.
            .filter(|at| *at <= scheduled_at)
            .max();

        let status = classify_latest(latest_result_at, window_start);

        Ok(Verdict {
            patient_id: patient_id.to_string(),
            procedure_id: procedure.id.clone(),
            scheduled_at,
            latest_result_at,
            status,
            reason: self.reason(status),
        })
    }

    fn reason(&self, status: VerdictStatus) -> String {
        match status {
            VerdictStatus::Missing => format!("No {} on file before surgery.", self.panel_label),
            VerdictStatus::Stale => format!(
                "Latest {} is older than {} hours.",
                self.panel_label, self.validity_hours
            ),
            VerdictStatus::Current => format!("{} is up to date.", self.panel_label),
        }
    }
}

impl Procedure {
    /// Bệnh nhân và thời điểm phẫu thuật, hoặc lý do ca không đánh giá được.
    pub fn target(&self) -> Result<(&str, DateTime<Utc>), NotEvaluable> {
        let patient_id = self
            .subject_id
            .as_deref()
            .ok_or_else(|| NotEvaluable::MissingSubject {
                procedure_id: self.id.clone(),
            })?;

        let raw_time = self
            .scheduled_at
            .as_deref()
            .ok_or_else(|| NotEvaluable::MissingEventTime {
                procedure_id: self.id.clone(),
            })?;

        let scheduled_at =
            parse_instant(raw_time).ok_or_else(|| NotEvaluable::UnparseableEventTime {
                procedure_id: self.id.clone(),
                value: raw_time.to_string(),
            })?;

        Ok((patient_id, scheduled_at))
    }
}

fn classify_latest(
    latest: Option<DateTime<Utc>>,
    window_start: Option<DateTime<Utc>>,
) -> VerdictStatus {
    match latest {
        None => VerdictStatus::Missing,
        Some(at) if window_start.is_some_and(|start| at < start) => VerdictStatus::Stale,
        Some(_) => VerdictStatus::Current,
    }
}

fn result_instant(result: &LabResult) -> Option<DateTime<Utc>> {
    let Some(raw) = result.effective_at.as_deref() else {
        debug!(result_id = %result.id, "bỏ qua kết quả không có thời điểm");
        return None;
    };
    let parsed = parse_instant(raw);
    if parsed.is_none() {
        debug!(result_id = %result.id, value = raw, "bỏ qua kết quả có thời điểm không đọc được");
    }
    parsed
}
