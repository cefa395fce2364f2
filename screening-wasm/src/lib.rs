//! Bridge WASM <-> JavaScript: đánh giá Type & Screen cho một ca phẫu thuật.

use serde_json::Value;
use serde_wasm_bindgen::{from_value, to_value};
use screening_core::{
    emit, AlertRecord, CodeClassifier, ConfigOverrides, LabResult, ScreeningConfig,
    ScreeningError, ValidityEvaluator,
};
use screening_fhir::{parse_lab_result, parse_procedure};
use wasm_bindgen::prelude::*;

/// `procedure`: một ServiceRequest; `observations`: mảng Observation của bệnh nhân.
/// Trả về `null` khi ca không đủ dữ liệu để đánh giá.
#[wasm_bindgen]
pub fn evaluate_procedure(
    procedure: JsValue,
    observations: JsValue,
    config: Option<JsValue>,
) -> Result<JsValue, JsValue> {
    #[cfg(target_arch = "wasm32")]
    console_error_panic_hook::set_once();

    let procedure = from_value::<Value>(procedure)
        .map_err(|err| JsValue::from_str(&format!("Không đọc được ServiceRequest: {err}")))?;
    let observations = from_value::<Vec<Value>>(observations)
        .map_err(|err| JsValue::from_str(&format!("Không đọc được danh sách Observation: {err}")))?;

    let overrides = match config {
        Some(js_cfg) if !js_cfg.is_undefined() && !js_cfg.is_null() => from_value(js_cfg)
            .map_err(|err| JsValue::from_str(&format!("Không đọc được config: {err}")))?,
        _ => ConfigOverrides::default(),
    };

    let record = evaluate_documents(&procedure, &observations, overrides)
        .map_err(|err| JsValue::from_str(&err))?;

    match record {
        Some(record) => to_value(&record)
            .map_err(|err| JsValue::from_str(&format!("Không serialize kết quả: {err}"))),
        None => Ok(JsValue::NULL),
    }
}

/// Phần thuần Rust của bridge, tách riêng để test được ngoài trình duyệt.
fn evaluate_documents(
    procedure: &Value,
    observations: &[Value],
    overrides: ConfigOverrides,
) -> Result<Option<AlertRecord>, String> {
    let config = ScreeningConfig::from(overrides);
    config.validate().map_err(format_screening_error)?;

    let procedure = parse_procedure(procedure).map_err(|err| format!("ServiceRequest lỗi: {err}"))?;

    let classifier = CodeClassifier::new(&config);
    let qualifying: Vec<LabResult> = observations
        .iter()
        .filter_map(|value| parse_lab_result(value).ok())
        .filter(|result| classifier.is_qualifying(result))
        .collect();

    let verdict = ValidityEvaluator::new(&config).evaluate(&procedure, &qualifying);
    Ok(verdict.ok().map(|verdict| emit(&verdict)))
}

fn format_screening_error(err: ScreeningError) -> String {
    format!("Screening error: {err}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use screening_core::{MatchMode, VerdictStatus};
    use serde_json::json;

    fn procedure() -> Value {
        json!({
            "resourceType": "ServiceRequest",
            "id": "sr-1",
            "subject": {"reference": "Patient/p1"},
            "occurrenceDateTime": "2025-06-10T08:00:00Z"
        })
    }

    fn observation(id: &str, code: &str, text: &str, at: &str) -> Value {
        json!({
            "resourceType": "Observation",
            "id": id,
            "subject": {"reference": "Patient/p1"},
            "code": {
                "text": text,
                "coding": [{"system": "http://loinc.org", "code": code}]
            },
            "effectiveDateTime": at
        })
    }

    #[test]
    fn current_result_gives_no_alert() {
        let observations = vec![observation("o1", "883-9", "ABO group", "2025-06-09T08:00:00Z")];

        let record = evaluate_documents(&procedure(), &observations, ConfigOverrides::default())
            .unwrap()
            .expect("ca phải đánh giá được");

        assert_eq!(record.status, VerdictStatus::Current);
        assert!(!record.alert);
        assert_eq!(record.latest_result_at.as_deref(), Some("2025-06-09T08:00:00Z"));
    }

    #[test]
    fn overrides_change_window_and_match_mode() {
        let observations = vec![observation(
            "o1",
            "999-9",
            "Type and Screen panel",
            "2025-06-06T08:00:00Z",
        )];

        let strict = evaluate_documents(&procedure(), &observations, ConfigOverrides::default())
            .unwrap()
            .unwrap();
        assert_eq!(strict.status, VerdictStatus::Missing);

        let overrides = ConfigOverrides {
            validity_hours: Some(96),
            match_mode: Some(MatchMode::Keyword),
            ..ConfigOverrides::default()
        };
        let relaxed = evaluate_documents(&procedure(), &observations, overrides)
            .unwrap()
            .unwrap();
        assert_eq!(relaxed.status, VerdictStatus::Current);
    }

    #[test]
    fn undated_procedure_is_not_evaluable() {
        let mut procedure = procedure();
        procedure
            .as_object_mut()
            .unwrap()
            .remove("occurrenceDateTime");

        let record =
            evaluate_documents(&procedure, &[], ConfigOverrides::default()).unwrap();
        assert!(record.is_none());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let overrides = ConfigOverrides {
            validity_hours: Some(0),
            ..ConfigOverrides::default()
        };

        let err = evaluate_documents(&procedure(), &[], overrides).unwrap_err();
        assert!(err.starts_with("Screening error"));
    }
}
