//! Reference driver: runs the zero-argument functions of a program file and
//! prints their results.

use crate::{
    allocator::create_allocator,
    config::{ConfigError, RunConfig, WorkQueueKind},
    coordinator::Coordinator,
    diagnostic::{Diagnostic, DiagnosticCollector, DiagnosticHandler},
    function::{ExecuteError, Function},
    interpreter::Program,
    kernels::register_builtin_kernels,
    registry::ExtensionError,
    types::TypeName,
    value::AsyncValue,
    work_queue::create_work_queue,
};
use std::{io, io::Write, path::PathBuf, sync::Arc};
use thiserror::Error;

/// Prefix the driver adds to every diagnostic the engine reports.
pub const RUNTIME_ERROR_PREFIX: &str = "runtime error: ";

/// Setup or output failure that stops the driver.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DriverError {
    #[error("couldn't read {}: {source}", path.display())]
    Input {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Extension(#[from] ExtensionError),
    #[error("couldn't find function {0}")]
    UnknownFunction(String),
    #[error(transparent)]
    Execute(#[from] ExecuteError),
    #[error("evaluation of function '{function}' leaked {leaked} async values (before: {before}, after: {after})")]
    Leak {
        function: String,
        leaked: usize,
        before: usize,
        after: usize,
    },
    #[error("couldn't write output: {0}")]
    Output(#[from] io::Error),
}

/// Diagnostics of a completed run checked against the expected ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    /// Emitted diagnostics that matched no expectation.
    pub unexpected: Vec<Diagnostic>,
    /// Expectations no diagnostic matched.
    pub unmatched: Vec<String>,
}

impl RunOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.unexpected.is_empty() && self.unmatched.is_empty()
    }

    /// Pair each diagnostic with the first unused expectation it contains.
    fn verify(diagnostics: Vec<Diagnostic>, expected: &[String]) -> Self {
        let mut used = vec![false; expected.len()];
        let mut unexpected = Vec::new();
        for diagnostic in diagnostics {
            let matched = expected
                .iter()
                .zip(&used)
                .position(|(text, &used)| !used && diagnostic.message.contains(text.as_str()));
            match matched {
                Some(idx) => used[idx] = true,
                None => unexpected.push(diagnostic),
            }
        }
        let unmatched = expected
            .iter()
            .zip(used)
            .filter(|(_, used)| !used)
            .map(|(text, _)| text.clone())
            .collect();
        Self {
            unexpected,
            unmatched,
        }
    }
}

fn prefixed(sink: DiagnosticHandler) -> DiagnosticHandler {
    Arc::new(move |diagnostic: &Diagnostic| {
        sink(&Diagnostic {
            message: format!("{RUNTIME_ERROR_PREFIX}{}", diagnostic.message),
            location: diagnostic.location.clone(),
        });
    })
}

/// Run `config` and print function results to `out`.
///
/// Each function is run to completion, the coordinator quiesced and
/// restarted, and its results dropped before the next one starts, so a
/// function that leaves future cells behind is reported as a leak.
///
/// # Errors
/// On setup failures (unreadable input, unknown work queue, unloadable
/// extension, missing function), on leaks, and when `out` fails.
pub fn run(config: &RunConfig, out: &mut dyn Write) -> Result<RunOutcome, DriverError> {
    let buffer = std::fs::read(&config.input).map_err(|source| DriverError::Input {
        path: config.input.clone(),
        source,
    })?;

    let allocator = create_allocator(config.allocator);
    writeln!(out, "Choosing {}.", config.allocator.description())?;
    let work_queue = create_work_queue(config.work_queue.parse::<WorkQueueKind>()?)?;
    writeln!(out, "Choosing {} work queue.", work_queue.name())?;
    out.flush()?;

    let collector = DiagnosticCollector::new();
    let handler = prefixed(collector.handler());
    let coordinator = Coordinator::new(Arc::clone(&handler), allocator, work_queue);
    register_builtin_kernels(coordinator.registry());
    for path in &config.shared_libs {
        coordinator.registry().load_extension(path)?;
    }

    let Ok(program) = Program::open(buffer, coordinator.registry(), &handler) else {
        return Ok(RunOutcome::verify(collector.take(), &config.expected_diagnostics));
    };

    let functions: Vec<&Arc<dyn Function>> = if config.functions.is_empty() {
        program.functions().iter().collect()
    } else {
        config
            .functions
            .iter()
            .map(|name| {
                program
                    .function(name)
                    .ok_or_else(|| DriverError::UnknownFunction(name.clone()))
            })
            .collect::<Result<_, _>>()?
    };

    for function in functions {
        run_function(&**function, &coordinator, out)?;
    }

    drop(program);
    Ok(RunOutcome::verify(collector.take(), &config.expected_diagnostics))
}

fn run_function(
    function: &dyn Function,
    coordinator: &Arc<Coordinator>,
    out: &mut dyn Write,
) -> Result<(), DriverError> {
    let name = function.name();
    if !function.argument_types().is_empty() {
        writeln!(out, "--- Not running '{name}' because it has arguments.")?;
        out.flush()?;
        return Ok(());
    }
    if name.is_empty() {
        return Ok(());
    }

    let before = coordinator.outstanding_values();
    writeln!(out, "--- Running '{name}':")?;
    out.flush()?;

    let results = function.execute(&[], coordinator)?;
    coordinator.await_values(&results);

    if !results.is_empty() {
        let printed: Vec<_> = results
            .iter()
            .zip(function.result_types())
            .map(|(value, ty)| format_result(value, ty))
            .collect();
        writeln!(out, "'{name}' returned {}", printed.join(","))?;
        out.flush()?;
    }

    coordinator.quiesce();
    coordinator.restart();
    drop(results);

    let after = coordinator.outstanding_values();
    if after != before {
        return Err(DriverError::Leak {
            function: name.to_owned(),
            leaked: after.abs_diff(before),
            before,
            after,
        });
    }
    Ok(())
}

/// Render a resolved result the way the driver prints it.
///
/// `i1` prints as `1`/`0`, integers use their `Display`, floats use
/// `format_float`; anything else prints as `<type> value`.
#[must_use]
pub fn format_result(value: &AsyncValue, ty: &TypeName) -> String {
    if let Some(error) = value.error_if_present() {
        return format!("<<error: {}>>", error.message());
    }
    let scalar = match ty.name() {
        "i1" => value.get::<bool>().map(|&v| u8::from(v).to_string()),
        "i32" => value.get::<i32>().map(ToString::to_string),
        "i64" => value.get::<i64>().map(ToString::to_string),
        "f32" => value.get::<f32>().map(|&v| format_float(f64::from(v))),
        "f64" => value.get::<f64>().map(|&v| format_float(v)),
        _ => None,
    };
    scalar.unwrap_or_else(|| format!("{ty} value"))
}

/// Exponent notation with six fractional digits and a signed exponent of at
/// least two digits, e.g. `5.000000e-01`. Non-finite values print as `nan`,
/// `INF` or `-INF`.
#[must_use]
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_owned();
    }
    if value.is_infinite() {
        return if value < 0.0 { "-INF" } else { "INF" }.to_owned();
    }
    let formatted = format!("{value:.6e}");
    let Some((mantissa, exponent)) = formatted.split_once('e') else {
        return formatted;
    };
    let (sign, digits) = match exponent.strip_prefix('-') {
        Some(digits) => ('-', digits),
        None => ('+', exponent),
    };
    format!("{mantissa}e{sign}{digits:0>2}")
}
