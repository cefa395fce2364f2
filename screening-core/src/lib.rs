//! Logic lõi đánh giá hiệu lực xét nghiệm Type & Screen trước phẫu thuật.

use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

mod classify;
mod emit;
mod evaluate;

pub use classify::CodeClassifier;
pub use emit::{emit, format_instant, AlertRecord};
pub use evaluate::ValidityEvaluator;

/// Hệ mã LOINC dùng cho bộ xét nghiệm mặc định.
pub const LOINC_SYSTEM: &str = "http://loinc.org";

/// Mã định danh (system, code) kèm nhãn hiển thị tùy chọn.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Coding {
    pub system: Option<String>,
    pub code: Option<String>,
    pub display: Option<String>,
    pub text: Option<String>,
}

/// Khái niệm được mã hóa: văn bản tự do cùng danh sách coding.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Concept {
    pub text: Option<String>,
    #[serde(default)]
    pub coding: Vec<Coding>,
}

/// Ca phẫu thuật đã lên lịch (chỉ đọc).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Procedure {
    pub id: String,
    pub subject_id: Option<String>,
    /// Thời điểm phẫu thuật dạng chuỗi gốc, chưa parse.
    pub scheduled_at: Option<String>,
}

/// Kết quả xét nghiệm của bệnh nhân (chỉ đọc).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabResult {
    pub id: String,
    pub subject_id: Option<String>,
    #[serde(default)]
    pub code: Concept,
    #[serde(default)]
    pub category: Vec<Concept>,
    pub effective_at: Option<String>,
}

/// Cặp (system, code) thuộc bộ xét nghiệm cần theo dõi.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitoredCode {
    pub system: String,
    pub code: String,
}

impl MonitoredCode {
    pub fn new(system: &str, code: &str) -> Self {
        Self {
            system: system.to_string(),
            code: code.to_string(),
        }
    }
}

/// Cách kết hợp hai quy tắc phân loại.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Chỉ khớp chính xác mã.
    #[default]
    Code,
    /// Chỉ khớp từ khóa trong văn bản.
    Keyword,
    /// Khớp nếu một trong hai quy tắc thỏa.
    Either,
}

impl MatchMode {
    pub fn uses_codes(self) -> bool {
        matches!(self, MatchMode::Code | MatchMode::Either)
    }

    pub fn uses_keywords(self) -> bool {
        matches!(self, MatchMode::Keyword | MatchMode::Either)
    }
}

impl FromStr for MatchMode {
    type Err = ScreeningError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "code" => Ok(MatchMode::Code),
            "keyword" => Ok(MatchMode::Keyword),
            "either" => Ok(MatchMode::Either),
            other => Err(ScreeningError::InvalidConfig(format!(
                "match mode không hợp lệ: {other} (code | keyword | either)"
            ))),
        }
    }
}

/// Cấu hình cho bộ phân loại và bộ đánh giá, cố định trong một lần chạy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreeningConfig {
    /// Số giờ trước phẫu thuật mà kết quả còn hiệu lực.
    pub validity_hours: u32,
    /// Tên bộ xét nghiệm dùng trong lý do cảnh báo.
    pub panel_label: String,
    pub monitored_codes: Vec<MonitoredCode>,
    pub keywords: Vec<String>,
    pub match_mode: MatchMode,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            validity_hours: 72,
            panel_label: "Type & Screen".to_string(),
            monitored_codes: vec![
                // ABO group
                MonitoredCode::new(LOINC_SYSTEM, "883-9"),
                // Rh type
                MonitoredCode::new(LOINC_SYSTEM, "10331-7"),
                // Antibody screen
                MonitoredCode::new(LOINC_SYSTEM, "890-4"),
            ],
            keywords: DEFAULT_KEYWORDS.iter().map(|kw| kw.to_string()).collect(),
            match_mode: MatchMode::Code,
        }
    }
}

const DEFAULT_KEYWORDS: [&str; 11] = [
    "TYPE AND SCREEN",
    "TYPE & SCREEN",
    "TYPE&SCREEN",
    "T&S",
    "T AND S",
    "ABO/RH",
    "ABO RH",
    "ABORH",
    "ANTIBODY SCREEN",
    "ABO GROUP",
    "RH TYPE",
];

impl ScreeningConfig {
    /// Kiểm tra cấu hình trước khi dựng bộ phân loại và bộ đánh giá.
    pub fn validate(&self) -> Result<(), ScreeningError> {
        if self.validity_hours == 0 {
            return Err(ScreeningError::InvalidConfig(
                "validity_hours phải lớn hơn 0".to_string(),
            ));
        }
        if self.match_mode.uses_codes() && self.monitored_codes.is_empty() {
            return Err(ScreeningError::InvalidConfig(
                "monitored_codes rỗng nhưng match mode cần khớp mã".to_string(),
            ));
        }
        if self.match_mode.uses_keywords()
            && self.keywords.iter().all(|kw| kw.trim().is_empty())
        {
            return Err(ScreeningError::InvalidConfig(
                "keywords rỗng nhưng match mode cần khớp từ khóa".to_string(),
            ));
        }
        Ok(())
    }

    /// Độ dài cửa sổ hiệu lực.
    pub fn window(&self) -> Duration {
        Duration::hours(i64::from(self.validity_hours))
    }
}

/// Ghi đè từng phần lên cấu hình mặc định (file JSON, JS).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ConfigOverrides {
    #[serde(default)]
    pub validity_hours: Option<u32>,
    #[serde(default)]
    pub panel_label: Option<String>,
    #[serde(default)]
    pub monitored_codes: Option<Vec<MonitoredCode>>,
    #[serde(default)]
    pub keywords: Option<Vec<String>>,
    #[serde(default)]
    pub match_mode: Option<MatchMode>,
}

impl ConfigOverrides {
    pub fn apply(self, mut base: ScreeningConfig) -> ScreeningConfig {
        if let Some(hours) = self.validity_hours {
            base.validity_hours = hours;
        }
        if let Some(label) = self.panel_label {
            base.panel_label = label;
        }
        if let Some(codes) = self.monitored_codes {
            base.monitored_codes = codes;
        }
        if let Some(keywords) = self.keywords {
            base.keywords = keywords;
        }
        if let Some(mode) = self.match_mode {
            base.match_mode = mode;
        }
        base
    }
}

impl From<ConfigOverrides> for ScreeningConfig {
    fn from(overrides: ConfigOverrides) -> Self {
        overrides.apply(ScreeningConfig::default())
    }
}

/// Trạng thái tuân thủ của một ca phẫu thuật.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    /// Có kết quả còn hiệu lực.
    Current,
    /// Kết quả gần nhất đã quá cửa sổ hiệu lực.
    Stale,
    /// Không có kết quả nào trước phẫu thuật.
    Missing,
}

impl VerdictStatus {
    pub fn is_alert(self) -> bool {
        !matches!(self, VerdictStatus::Current)
    }
}

/// Kết luận cho một ca phẫu thuật.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub patient_id: String,
    pub procedure_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub latest_result_at: Option<DateTime<Utc>>,
    pub status: VerdictStatus,
    pub reason: String,
}

impl Verdict {
    pub fn alert(&self) -> bool {
        self.status.is_alert()
    }
}

/// Lý do một ca phẫu thuật bị bỏ qua (lỗi chất lượng dữ liệu, không phải lỗi hệ thống).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotEvaluable {
    #[error("ca {procedure_id} thiếu tham chiếu bệnh nhân")]
    MissingSubject { procedure_id: String },
    #[error("ca {procedure_id} thiếu thời điểm phẫu thuật")]
    MissingEventTime { procedure_id: String },
    #[error("ca {procedure_id} có thời điểm phẫu thuật không đọc được: {value}")]
    UnparseableEventTime { procedure_id: String, value: String },
}

/// Lỗi chung của lõi.
#[derive(Debug, thiserror::Error)]
pub enum ScreeningError {
    #[error("Cấu hình không hợp lệ: {0}")]
    InvalidConfig(String),
}

/// Parse mốc thời gian ISO-8601; không có offset thì coi là UTC.
pub fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}
