use std::fs;
use std::io::Cursor;

use serde_json::json;
use screening_fhir::{
    parse_bundle_str, parse_bundle_value, parse_lab_result, parse_procedure,
    patient_id_from_reference, write_ndjson_line, FhirError, NdjsonReader,
};

fn fixture_path(name: &str) -> String {
    format!("{}/tests/data/{name}", env!("CARGO_MANIFEST_DIR"))
}

#[test]
fn search_page_exposes_resources_and_next_link() {
    let bundle = fs::read_to_string(fixture_path("observation_search_page.json"))
        .expect("Failed to read search page fixture");

    let page = parse_bundle_str(&bundle).expect("Failed to parse bundle");

    assert_eq!(page.resources.len(), 2);
    assert_eq!(
        page.next.as_deref(),
        Some("https://fhir.example.org/Observation?subject=Patient/p-good&_count=2&_page=2")
    );

    let second = parse_lab_result(&page.resources[1]).expect("Failed to parse observation");
    assert_eq!(second.id, "obs-good-2");
    assert_eq!(second.effective_at.as_deref(), Some("2025-06-01T00:00:00.000Z"));
    assert_eq!(second.code.text.as_deref(), Some("Antibody screen"));
    assert_eq!(second.category.len(), 1);
    assert_eq!(
        second.category[0].coding[0].display.as_deref(),
        Some("Antibody Screen")
    );
}

#[test]
fn last_page_and_empty_search_have_no_next() {
    let page = parse_bundle_value(&json!({
        "resourceType": "Bundle",
        "type": "searchset",
        "total": 0,
        "link": [{ "relation": "self", "url": "https://fhir.example.org/ServiceRequest" }]
    }))
    .expect("Failed to parse empty bundle");

    assert!(page.resources.is_empty());
    assert_eq!(page.next, None);
}

#[test]
fn non_bundle_documents_are_rejected() {
    let err = parse_bundle_value(&json!({ "resourceType": "OperationOutcome" })).unwrap_err();
    assert!(matches!(err, FhirError::UnexpectedResourceType { .. }));

    let err = parse_bundle_str("<html>gateway timeout</html>").unwrap_err();
    assert!(matches!(err, FhirError::Parse(_)));
}

#[test]
fn procedure_fields_are_extracted() {
    let procedure = parse_procedure(&json!({
        "resourceType": "ServiceRequest",
        "id": "sr-1",
        "subject": { "reference": "Patient/123" },
        "occurrenceDateTime": "2025-06-10T00:00:00Z"
    }))
    .expect("Failed to parse ServiceRequest");

    assert_eq!(procedure.id, "sr-1");
    assert_eq!(procedure.subject_id.as_deref(), Some("123"));
    assert_eq!(procedure.scheduled_at.as_deref(), Some("2025-06-10T00:00:00Z"));
}

#[test]
fn documents_without_id_or_patient_subject_degrade_gracefully() {
    let procedure = parse_procedure(&json!({
        "resourceType": "ServiceRequest",
        "subject": { "reference": "Group/ward-7" }
    }))
    .expect("Failed to parse ServiceRequest");

    assert_eq!(procedure.id, "procedure-unknown");
    assert_eq!(procedure.subject_id, None);
    assert_eq!(procedure.scheduled_at, None);
}

#[test]
fn wrong_resource_type_is_an_error() {
    let err = parse_lab_result(&json!({ "resourceType": "ServiceRequest", "id": "x" })).unwrap_err();
    assert!(matches!(
        err,
        FhirError::UnexpectedResourceType { expected: "Observation", .. }
    ));

    let err = parse_procedure(&json!({ "id": "x" })).unwrap_err();
    assert!(matches!(err, FhirError::MissingData("resourceType")));
}

#[test]
fn patient_references_require_prefix_and_id() {
    assert_eq!(patient_id_from_reference("Patient/abc").as_deref(), Some("abc"));
    assert_eq!(patient_id_from_reference("Patient/"), None);
    assert_eq!(patient_id_from_reference("Practitioner/abc"), None);
}

#[test]
fn versioned_patient_reference_yields_bare_id() {
    assert_eq!(
        patient_id_from_reference("Patient/abc/_history/2").as_deref(),
        Some("abc")
    );
    assert_eq!(patient_id_from_reference("Patient//_history/2"), None);

    let observation = json!({
        "resourceType": "Observation",
        "id": "obs-1",
        "subject": { "reference": "Patient/abc/_history/2" }
    });
    let result = parse_lab_result(&observation).expect("Không đọc được Observation");
    assert_eq!(result.subject_id.as_deref(), Some("abc"));
}

#[test]
fn ndjson_round_trip_through_writer_and_reader() {
    let mut buffer = Vec::new();
    write_ndjson_line(&mut buffer, &json!({ "id": 1 })).unwrap();
    buffer.extend_from_slice(b"\n   \n{broken\n");
    write_ndjson_line(&mut buffer, &json!({ "id": 2 })).unwrap();

    let mut reader = NdjsonReader::new(Cursor::new(buffer));
    let lines: Vec<_> = reader.by_ref().map(Result::unwrap).collect();

    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].line_number, 1);
    assert_eq!(lines[1].value, json!({ "id": 2 }));
    assert_eq!(lines[1].line_number, 5);
    assert_eq!(reader.skipped(), 1);
}

#[test]
fn ndjson_line_with_invalid_utf8_is_skipped_not_fatal() {
    let data = b"{\"id\":1}\n\xff\xfe garbage\n{\"id\":2}\n".to_vec();

    let mut reader = NdjsonReader::new(Cursor::new(data));
    let lines: Vec<_> = reader
        .by_ref()
        .map(|line| line.expect("dòng hỏng không được làm dừng reader"))
        .collect();

    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].value, json!({ "id": 1 }));
    assert_eq!(lines[1].value, json!({ "id": 2 }));
    assert_eq!(lines[1].line_number, 3);
    assert_eq!(reader.skipped(), 1);
}
