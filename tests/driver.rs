#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use cdr::{
    config::{AllocatorKind, ConfigError, RunConfig},
    driver::{self, DriverError},
    format::{AttributeValue, ProgramWriter},
};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_program(writer: ProgramWriter) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&writer.finish()).unwrap();
    file.flush().unwrap();
    file
}

fn run(config: &RunConfig) -> (Result<driver::RunOutcome, DriverError>, String) {
    let mut out = Vec::new();
    let result = driver::run(config, &mut out);
    (result, String::from_utf8(out).unwrap())
}

fn sample_program() -> ProgramWriter {
    let mut writer = ProgramWriter::new();

    let mut main = writer.function("main");
    let [a] = main.kernel("constant.i32", &[], &[AttributeValue::I32(1)]);
    let [b] = main.kernel("constant.i32", &[], &[AttributeValue::I32(2)]);
    let [sum] = main.kernel("add.i32", &[a, b], &[]);
    main.result("i32", sum);
    main.finish();

    let mut with_args = writer.function("with_args");
    let x = with_args.argument("i32");
    with_args.result("i32", x);
    with_args.finish();

    let mut anonymous = writer.function("");
    let [v] = anonymous.kernel("constant.i1", &[], &[AttributeValue::Bool(true)]);
    anonymous.result("i1", v);
    anonymous.finish();

    let mut mixed = writer.function("mixed");
    let [flag] = mixed.kernel("constant.i1", &[], &[AttributeValue::Bool(false)]);
    let [half] = mixed.kernel("constant.f64", &[], &[AttributeValue::F64(0.5)]);
    let [missing] = mixed.kernel("does.not.exist", &[], &[]);
    let [buffer] = mixed.kernel("host.alloc", &[], &[AttributeValue::I64(32)]);
    mixed.result("i1", flag);
    mixed.result("f64", half);
    mixed.result("i32", missing);
    mixed.result("!host.buffer", buffer);
    mixed.finish();

    let mut empty = writer.function("no_results");
    let _ = empty.kernel::<1>("constant.i32", &[], &[AttributeValue::I32(0)]);
    empty.finish();

    writer
}

#[test]
fn runs_every_zero_argument_function() {
    let file = write_program(sample_program());
    let (result, out) = run(&RunConfig::new(file.path()));
    assert!(result.unwrap().is_success());
    assert_eq!(
        out,
        "Choosing malloc.\n\
         Choosing single-threaded work queue.\n\
         --- Running 'main':\n\
         'main' returned 3\n\
         --- Not running 'with_args' because it has arguments.\n\
         --- Running 'mixed':\n\
         'mixed' returned 0,5.000000e-01,<<error: unknown kernel 'does.not.exist'>>,!host.buffer value\n\
         --- Running 'no_results':\n"
    );
}

#[test]
fn runs_selected_functions_under_every_setup() {
    let file = write_program(sample_program());
    for (allocator, queue, description) in [
        (AllocatorKind::TestFixedSize, "mstd:2", "fixed size malloc"),
        (AllocatorKind::Profiled, "rayon:2", "profiled allocator based on malloc"),
        (AllocatorKind::LeakCheck, "s", "memory leak check allocator"),
    ] {
        let mut config = RunConfig::new(file.path());
        config.allocator = allocator;
        config.work_queue = queue.to_owned();
        config.functions = vec!["mixed".to_owned(), "main".to_owned()];
        let (result, out) = run(&config);
        assert!(result.unwrap().is_success());
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines[0], format!("Choosing {description}."));
        assert!(lines[1].starts_with("Choosing ") && lines[1].ends_with(" work queue."));
        assert_eq!(lines[2], "--- Running 'mixed':");
        assert_eq!(lines[4], "--- Running 'main':");
        assert_eq!(lines[5], "'main' returned 3");
    }
}

#[test]
fn missing_function_fails_before_running_anything() {
    let file = write_program(sample_program());
    let mut config = RunConfig::new(file.path());
    config.functions = vec!["main".to_owned(), "nope".to_owned()];
    let (result, out) = run(&config);
    assert!(matches!(result, Err(DriverError::UnknownFunction(name)) if name == "nope"));
    assert!(!out.contains("--- Running"));
}

#[test]
fn setup_errors_are_reported() {
    let file = write_program(sample_program());
    let mut config = RunConfig::new(file.path());
    config.work_queue = "fifo".to_owned();
    let (result, _) = run(&config);
    assert!(matches!(
        result,
        Err(DriverError::Config(ConfigError::UnknownWorkQueue(name))) if name == "fifo"
    ));

    let dir = tempfile::tempdir().unwrap();
    let (result, out) = run(&RunConfig::new(dir.path().join("missing.bin")));
    assert!(matches!(result, Err(DriverError::Input { .. })));
    assert!(out.is_empty());
}

#[test]
fn runtime_diagnostics_are_verified() {
    let mut writer = ProgramWriter::new();
    let mut main = writer.function("main");
    let [failed] = main.kernel(
        "error.report",
        &[],
        &[AttributeValue::String("something broke".into())],
    );
    main.result("i32", failed);
    main.finish();
    let file = write_program(writer);

    let (result, out) = run(&RunConfig::new(file.path()));
    assert!(out.ends_with("'main' returned <<error: something broke>>\n"));
    let outcome = result.unwrap();
    assert!(!outcome.is_success());
    assert_eq!(outcome.unexpected.len(), 1);
    assert_eq!(
        outcome.unexpected[0].message,
        "runtime error: something broke"
    );

    let mut config = RunConfig::new(file.path());
    config.expected_diagnostics = vec!["runtime error: something".to_owned()];
    assert!(run(&config).0.unwrap().is_success());

    config.expected_diagnostics.push("never emitted".to_owned());
    let outcome = run(&config).0.unwrap();
    assert_eq!(outcome.unmatched, vec!["never emitted".to_owned()]);
}

#[test]
fn malformed_programs_only_produce_diagnostics() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"CDRB\x07\x00\x00\x00").unwrap();
    file.flush().unwrap();

    let mut config = RunConfig::new(file.path());
    let (result, out) = run(&config);
    let outcome = result.unwrap();
    assert_eq!(
        outcome.unexpected[0].message,
        "runtime error: unsupported format version 7"
    );
    assert!(!out.contains("--- Running"));

    config.expected_diagnostics = vec!["unsupported format version".to_owned()];
    assert!(run(&config).0.unwrap().is_success());
}
