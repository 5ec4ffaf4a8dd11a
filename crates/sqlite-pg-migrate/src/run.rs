//! Run-scoped context.

use tracing::Span;
use uuid::Uuid;

/// Correlation data for one invocation.
///
/// Passed explicitly to every stage; stage futures are instrumented with
/// [`RunContext::span`] so every log line carries the run id.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: String,
    span: Span,
}

impl RunContext {
    /// Start a new run for `command`.
    pub fn new(command: &str) -> Self {
        let run_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("run", run_id = %run_id, command = command);
        Self { run_id, span }
    }

    /// Run correlation id.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Span that stage futures are instrumented with.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Child span for one stage.
    pub fn stage(&self, stage: &'static str) -> Span {
        tracing::info_span!(parent: &self.span, "stage", stage = stage)
    }
}
