use crate::config::TransformSettings;
use crate::engine::{Engine, GENERIC_FAILURE_STATUS, Outcome};
use crate::input::FixedBuffer;
use crate::transform::Normalizer;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Normalizes raw inputs and runs them on the linked engine.
///
/// The harness owns the transform buffer; callers own the input buffer and
/// lend its contents to [`Harness::run`].
pub struct Harness<E: Engine> {
    engine: E,
    normalizer: Normalizer,
    scratch: FixedBuffer,
    trace_normalized: bool,
}

impl<E: Engine> Harness<E> {
    pub fn new(engine: E, settings: &TransformSettings) -> Self {
        Self {
            engine,
            normalizer: Normalizer::new(settings),
            scratch: FixedBuffer::with_capacity(settings.output_capacity),
            trace_normalized: false,
        }
    }

    /// Logs every normalized program before it runs.
    pub fn with_trace(mut self, enabled: bool) -> Self {
        self.trace_normalized = enabled;
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Runs one input and returns its status: 0 on success, non-zero when
    /// the engine reported a failure.
    pub fn run(&mut self, input: &[u8]) -> i32 {
        let Self {
            engine,
            normalizer,
            scratch,
            trace_normalized,
        } = self;

        // Inputs that expand past the buffer run as the empty program.
        let text: &[u8] = match normalizer.normalize_into(input, scratch) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("could not normalize input of {} bytes: {e}", input.len());
                &[]
            }
        };

        if *trace_normalized {
            tracing::info!(
                target: "shuttle::normalized",
                "\n{}",
                String::from_utf8_lossy(text)
            );
        }

        let result = catch_unwind(AssertUnwindSafe(|| {
            engine.reset_global_state();
            engine.execute(text)
        }));

        match result {
            Ok(outcome) => outcome.status(),
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic type".to_string()
                };
                tracing::error!("engine panicked: {msg}");
                Outcome::Failure {
                    code: GENERIC_FAILURE_STATUS,
                }
                .status()
            }
        }
    }
}
