//! Record source -> classifier -> evaluator -> alert record.

use screening_core::{
    emit, AlertRecord, CodeClassifier, NotEvaluable, Procedure, ScreeningConfig,
    ValidityEvaluator,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{RecordSource, SourceError};

/// What happened to one procedure.
#[derive(Debug)]
pub enum ScreeningOutcome {
    Verdict(AlertRecord),
    Skipped(NotEvaluable),
    /// Lab results for this procedure's patient could not be fetched; no verdict issued.
    SourceFailure {
        procedure_id: String,
        error: SourceError,
    },
}

/// Run counters for the summary log line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScreeningStats {
    pub evaluated: usize,
    pub alerts: usize,
    pub skipped: usize,
    pub source_failures: usize,
}

impl ScreeningStats {
    pub fn record(&mut self, outcome: &ScreeningOutcome) {
        match outcome {
            ScreeningOutcome::Verdict(record) => {
                self.evaluated += 1;
                if record.alert {
                    self.alerts += 1;
                }
            }
            ScreeningOutcome::Skipped(_) => self.skipped += 1,
            ScreeningOutcome::SourceFailure { .. } => self.source_failures += 1,
        }
    }
}

pub struct Screener<S> {
    source: S,
    classifier: CodeClassifier,
    evaluator: ValidityEvaluator,
}

impl<S: RecordSource> Screener<S> {
    pub fn new(source: S, config: &ScreeningConfig) -> Self {
        Self {
            source,
            classifier: CodeClassifier::new(config),
            evaluator: ValidityEvaluator::new(config),
        }
    }

    /// Lazily screen every procedure the source yields.
    ///
    /// An `Err` item means the procedure listing itself failed; the stream ends after it.
    pub fn outcomes(&self) -> impl Iterator<Item = Result<ScreeningOutcome, SourceError>> + '_ {
        self.source
            .fetch_procedures()
            .map(|procedure| procedure.map(|procedure| self.screen_procedure(&procedure)))
    }

    pub fn screen_procedure(&self, procedure: &Procedure) -> ScreeningOutcome {
        let (patient_id, _) = match procedure.target() {
            Ok(target) => target,
            Err(reason) => {
                debug!(%reason, "procedure not evaluable");
                return ScreeningOutcome::Skipped(reason);
            }
        };

        let mut failure = None;
        let qualifying = self
            .source
            .fetch_lab_results(patient_id)
            .map_while(|result| match result {
                Ok(result) => Some(result),
                Err(err) => {
                    failure = Some(err);
                    None
                }
            })
            .filter(|result| self.classifier.is_qualifying(result));

        let verdict = self.evaluator.evaluate(procedure, qualifying);

        if let Some(error) = failure {
            warn!(procedure_id = %procedure.id, patient_id, %error, "could not fetch lab results");
            return ScreeningOutcome::SourceFailure {
                procedure_id: procedure.id.clone(),
                error,
            };
        }

        match verdict {
            Ok(verdict) => ScreeningOutcome::Verdict(emit(&verdict)),
            Err(reason) => ScreeningOutcome::Skipped(reason),
        }
    }
}
