//! Phân loại kết quả xét nghiệm thuộc bộ Type & Screen.

use crate::{Concept, LabResult, MatchMode, MonitoredCode, ScreeningConfig};

/// Bộ phân loại gồm hai quy tắc độc lập: khớp mã và khớp từ khóa.
#[derive(Debug, Clone)]
pub struct CodeClassifier {
    monitored: Vec<MonitoredCode>,
    /// Từ khóa đã chuyển sang chữ hoa.
    keywords: Vec<String>,
    mode: MatchMode,
}

impl CodeClassifier {
    pub fn new(config: &ScreeningConfig) -> Self {
        Self {
            monitored: config.monitored_codes.clone(),
            keywords: config
                .keywords
                .iter()
                .map(|kw| kw.trim().to_uppercase())
                .filter(|kw| !kw.is_empty())
                .collect(),
            mode: config.match_mode,
        }
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn monitored_codes(&self) -> &[MonitoredCode] {
        &self.monitored
    }

    /// Kết quả có thuộc bộ xét nghiệm theo dõi hay không, theo `MatchMode`.
    pub fn is_qualifying(&self, result: &LabResult) -> bool {
        match self.mode {
            MatchMode::Code => self.matches_code(result),
            MatchMode::Keyword => self.matches_keyword(result),
            MatchMode::Either => self.matches_code(result) || self.matches_keyword(result),
        }
    }

    /// Có coding nào trùng khớp chính xác (system, code) trong danh sách theo dõi.
    pub fn matches_code(&self, result: &LabResult) -> bool {
        result.code.coding.iter().any(|coding| {
            let (Some(system), Some(code)) = (coding.system.as_deref(), coding.code.as_deref())
            else {
                return false;
            };
            self.monitored
                .iter()
                .any(|monitored| monitored.system == system && monitored.code == code)
        })
    }

    /// Có từ khóa nào xuất hiện (không phân biệt hoa thường) trong văn bản của code hoặc category.
    pub fn matches_keyword(&self, result: &LabResult) -> bool {
        std::iter::once(&result.code)
            .chain(result.category.iter())
            .flat_map(concept_texts)
            .any(|text| {
                let haystack = text.to_uppercase();
                self.keywords.iter().any(|kw| haystack.contains(kw.as_str()))
            })
    }
}

fn concept_texts(concept: &Concept) -> impl Iterator<Item = &str> + '_ {
    concept.text.as_deref().into_iter().chain(
        concept.coding.iter().flat_map(|coding| {
            [
                coding.display.as_deref(),
                coding.code.as_deref(),
                coding.text.as_deref(),
            ]
            .into_iter()
            .flatten()
        }),
    )
}
