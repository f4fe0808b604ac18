#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use cdr::{
    AsyncError, AsyncValue, Coordinator, Diagnostic, KernelFrame, Location, Program,
    allocator::create_allocator,
    config::AllocatorKind,
    diagnostic::DiagnosticCollector,
    error::AsyncErrorKind,
    format::{AttributeValue, ParseErrorKind, ProgramWriter},
    function::ExecuteError,
    kernels::register_builtin_kernels,
    work_queue::create_work_queue,
};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

const QUEUES: [&str; 3] = ["s", "mstd:3", "rayon:3"];

fn coordinator(queue: &str) -> (Arc<Coordinator>, DiagnosticCollector) {
    let collector = DiagnosticCollector::new();
    let coordinator = Coordinator::new(
        collector.handler(),
        create_allocator(AllocatorKind::LeakCheck),
        create_work_queue(queue.parse().unwrap()).unwrap(),
    );
    register_builtin_kernels(coordinator.registry());
    (coordinator, collector)
}

fn open(coordinator: &Coordinator, collector: &DiagnosticCollector, writer: ProgramWriter) -> Program {
    Program::open(writer.finish(), coordinator.registry(), &collector.handler()).unwrap()
}

fn i32_constant(value: i32) -> [AttributeValue; 1] {
    [AttributeValue::I32(value)]
}

#[test]
fn constants_feed_add() {
    for queue in QUEUES {
        let (coordinator, collector) = coordinator(queue);
        let mut writer = ProgramWriter::new();
        let mut main = writer.function("main");
        let [a] = main.kernel("constant.i32", &[], &i32_constant(1));
        let [b] = main.kernel("constant.i32", &[], &i32_constant(2));
        let [sum] = main.kernel("add.i32", &[a, b], &[]);
        main.result("i32", sum);
        main.finish();
        let program = open(&coordinator, &collector, writer);

        let results = program
            .function("main")
            .unwrap()
            .execute(&[], &coordinator)
            .unwrap();
        assert_eq!(results.len(), 1);
        coordinator.await_values(&results);
        assert_eq!(results[0].get::<i32>(), Some(&3), "queue {queue}");
        coordinator.quiesce();
        assert!(collector.is_empty());
    }
}

#[test]
fn unknown_kernel_resolves_to_error() {
    let (coordinator, collector) = coordinator("s");
    let mut writer = ProgramWriter::new();
    let mut main = writer.function("main");
    let [a, b] = main.kernel("does.not.exist", &[], &[]);
    let [c] = main.kernel("value.forward", &[a], &[]);
    main.result("i32", b);
    main.result("i32", c);
    main.finish();
    let program = open(&coordinator, &collector, writer);

    let results = program
        .function("main")
        .unwrap()
        .execute(&[], &coordinator)
        .unwrap();
    coordinator.await_values(&results);
    for result in &results {
        let error = result.error_if_present().unwrap();
        assert_eq!(error.message(), "unknown kernel 'does.not.exist'");
        assert_eq!(error.kind(), AsyncErrorKind::Kernel);
    }
    coordinator.quiesce();
}

#[test]
fn kernels_wait_for_delayed_arguments() {
    for queue in QUEUES {
        let (coordinator, collector) = coordinator(queue);
        let mut writer = ProgramWriter::new();
        let mut main = writer.function("delayed");
        let x = main.argument("i64");
        let [one] = main.kernel("constant.i64", &[], &[AttributeValue::I64(1)]);
        let [y] = main.kernel("add.i64", &[x, one], &[]);
        let [z] = main.kernel("add.i64", &[y, x], &[]);
        main.result("i64", z);
        main.finish();
        let program = open(&coordinator, &collector, writer);

        let argument = coordinator.make_unresolved();
        let results = program
            .function("delayed")
            .unwrap()
            .execute(&[Arc::clone(&argument)], &coordinator)
            .unwrap();
        // Let every runnable kernel finish; nothing downstream of `x` can.
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(!results[0].is_available(), "queue {queue}");

        let resolver = std::thread::spawn(move || argument.set_value(20_i64));
        coordinator.await_values(&results);
        resolver.join().unwrap();
        assert_eq!(results[0].get::<i64>(), Some(&41), "queue {queue}");
        coordinator.quiesce();
    }
}

#[test]
fn error_inputs_short_circuit() {
    for queue in QUEUES {
        let (coordinator, collector) = coordinator(queue);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        coordinator.registry().add_kernel("test.count", move |frame| {
            counter.fetch_add(1, Ordering::Relaxed);
            frame.emplace_result(0, ());
        });
        coordinator
            .registry()
            .add_kernel("test.panic", |_| panic!("must not run on error input"));

        let mut writer = ProgramWriter::new();
        let mut main = writer.function("main");
        let location = Location {
            filename: "short_circuit.mlir".into(),
            line: 4,
            column: 9,
        };
        let [failed] = main.kernel_with_location(
            "error.report",
            &[],
            &[AttributeValue::String("bad input".into())],
            &location,
        );
        let [after] = main.kernel("test.panic", &[failed], &[]);
        let [unrelated] = main.kernel("test.count", &[], &[]);
        main.result("!chain", after);
        main.result("!chain", unrelated);
        main.finish();
        let program = open(&coordinator, &collector, writer);

        let results = program
            .function("main")
            .unwrap()
            .execute(&[], &coordinator)
            .unwrap();
        coordinator.await_values(&results);
        coordinator.quiesce();

        let error = results[0].error_if_present().unwrap();
        assert_eq!(error.message(), "bad input");
        assert_eq!(error.location(), Some(&location));
        assert!(results[1].get::<()>().is_some());
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(
            collector.take(),
            vec![Diagnostic::new("bad input").with_location(Some(location))]
        );
    }
}

#[test]
fn cancel_then_restart() {
    let (coordinator, collector) = coordinator("s");
    let mut writer = ProgramWriter::new();
    let mut main = writer.function("cancelling");
    let [_] = main.kernel("coordinator.cancel", &[], &[]);
    let [value] = main.kernel("constant.i32", &[], &i32_constant(7));
    main.result("i32", value);
    main.finish();
    let mut other = writer.function("plain");
    let [value] = other.kernel("constant.i32", &[], &i32_constant(8));
    other.result("i32", value);
    other.finish();
    let program = open(&coordinator, &collector, writer);

    let results = program
        .function("cancelling")
        .unwrap()
        .execute(&[], &coordinator)
        .unwrap();
    coordinator.await_values(&results);
    // The synchronous queue runs roots in order, so the constant starts
    // after the cancellation.
    assert!(results[0].error_if_present().unwrap().is_cancelled());
    assert!(coordinator.is_cancelled());
    coordinator.quiesce();
    coordinator.restart();
    coordinator.restart();
    assert!(!coordinator.is_cancelled());

    let results = program
        .function("plain")
        .unwrap()
        .execute(&[], &coordinator)
        .unwrap();
    coordinator.await_values(&results);
    assert_eq!(results[0].get::<i32>(), Some(&8));
    coordinator.quiesce();
    coordinator.quiesce();
}

#[test]
fn cancelled_function_completes_after_restart() {
    for queue in QUEUES {
        let (coordinator, collector) = coordinator(queue);
        let mut writer = ProgramWriter::new();
        let mut main = writer.function("main");
        let [a] = main.kernel("constant.i32", &[], &i32_constant(20));
        let [b] = main.kernel("constant.i32", &[], &i32_constant(22));
        let [sum] = main.kernel("add.i32", &[a, b], &[]);
        main.result("i32", sum);
        main.finish();
        let program = open(&coordinator, &collector, writer);
        let function = program.function("main").unwrap();

        coordinator.cancel();
        let results = function.execute(&[], &coordinator).unwrap();
        coordinator.await_values(&results);
        let error = results[0].error_if_present().unwrap();
        assert!(error.is_cancelled(), "queue {queue}");
        coordinator.quiesce();
        drop(results);

        coordinator.restart();
        let results = function.execute(&[], &coordinator).unwrap();
        coordinator.await_values(&results);
        assert_eq!(results[0].get::<i32>(), Some(&42), "queue {queue}");
        coordinator.quiesce();
        assert!(collector.is_empty());
    }
}

#[test]
fn executions_leave_no_cells_behind() {
    for queue in QUEUES {
        let (coordinator, collector) = coordinator(queue);
        let mut writer = ProgramWriter::new();
        let mut main = writer.function("main");
        let mut last = main.kernel::<1>("constant.i64", &[], &[AttributeValue::I64(0)])[0];
        for _ in 0..16 {
            let [one] = main.kernel("constant.i64", &[], &[AttributeValue::I64(1)]);
            let [sum] = main.kernel("add.i64", &[last, one], &[]);
            last = sum;
        }
        let [missing] = main.kernel("does.not.exist", &[last], &[]);
        main.result("i64", last);
        main.result("i64", missing);
        main.finish();
        let program = open(&coordinator, &collector, writer);
        let function = program.function("main").unwrap();

        let before = coordinator.outstanding_values();
        for run in 0..3 {
            let results = function.execute(&[], &coordinator).unwrap();
            coordinator.await_values(&results);
            assert_eq!(results[0].get::<i64>(), Some(&16));
            assert!(results[1].is_error());
            coordinator.quiesce();
            drop(results);
            assert_eq!(
                coordinator.outstanding_values(),
                before,
                "queue {queue}, run {run}"
            );
            assert_eq!(coordinator.allocator().report().live_allocations, 0);
            coordinator.restart();
        }
    }
}

#[test]
fn arity_mismatch_fails_synchronously() {
    let (coordinator, collector) = coordinator("s");
    let mut writer = ProgramWriter::new();
    let mut main = writer.function("takes_one");
    let x = main.argument("i32");
    main.result("i32", x);
    main.finish();
    let program = open(&coordinator, &collector, writer);

    let function = program.function("takes_one").unwrap();
    let before = coordinator.outstanding_values();
    assert_eq!(
        function.execute(&[], &coordinator).unwrap_err(),
        ExecuteError::ArityMismatch {
            function: "takes_one".into(),
            expected: 1,
            actual: 0,
        }
    );
    assert_eq!(coordinator.outstanding_values(), before);

    // Functions with arguments are still directly invocable.
    let results = function
        .execute(&[AsyncValue::available(5_i32)], &coordinator)
        .unwrap();
    coordinator.await_values(&results);
    assert_eq!(results[0].get::<i32>(), Some(&5));
    coordinator.quiesce();
}

#[test]
fn async_kernels_resolve_later() {
    for queue in QUEUES {
        let (coordinator, collector) = coordinator(queue);
        coordinator.registry().add_kernel("test.async_double", |frame| {
            let input = *frame.argument_as::<i32>(0).unwrap();
            let result = frame.take_async_result(0);
            frame
                .coordinator()
                .enqueue_work(move || result.set_value(input * 2));
        });
        coordinator.registry().add_kernel("test.forward_later", |frame| {
            let source = frame.coordinator().make_unresolved();
            frame.forward_result(0, Arc::clone(&source));
            frame.coordinator().enqueue_work(move || source.set_value(99_i32));
        });

        let mut writer = ProgramWriter::new();
        let mut main = writer.function("main");
        let [a] = main.kernel("constant.i32", &[], &i32_constant(21));
        let [doubled] = main.kernel("test.async_double", &[a], &[]);
        let [late] = main.kernel("test.forward_later", &[], &[]);
        let [sum] = main.kernel("add.i32", &[doubled, late], &[]);
        main.result("i32", sum);
        main.result("i32", late);
        main.finish();
        let program = open(&coordinator, &collector, writer);

        let results = program
            .function("main")
            .unwrap()
            .execute(&[], &coordinator)
            .unwrap();
        coordinator.await_values(&results);
        assert_eq!(results[0].get::<i32>(), Some(&141), "queue {queue}");
        assert_eq!(results[1].get::<i32>(), Some(&99));
        coordinator.quiesce();
    }
}

/// Names the test whose body a re-executed test binary should run.
const ABORTING_CHILD: &str = "CDR_TEST_ABORTING_CHILD";

/// Run `body` in a child copy of this test binary and assert the child is
/// killed by an abort rather than exiting or hanging.
fn assert_aborts(test: &str, body: impl FnOnce()) {
    if std::env::var(ABORTING_CHILD).as_deref() == Ok(test) {
        body();
        return;
    }
    let mut child = std::process::Command::new(std::env::current_exe().unwrap())
        .args(["--exact", test, "--test-threads=1"])
        .env(ABORTING_CHILD, test)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .unwrap();
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(30);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if std::time::Instant::now() > deadline {
            child.kill().unwrap();
            panic!("{test}: child still running after its kernel panicked");
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    };
    assert!(!status.success(), "{test}: child exited with {status}");
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(status.signal(), Some(6), "{test}: expected SIGABRT, got {status}");
    }
}

fn run_single_kernel(
    queue: &str,
    kernel: impl Fn(&mut KernelFrame<'_>) + Send + Sync + 'static,
) {
    let (coordinator, collector) = coordinator(queue);
    coordinator.registry().add_kernel("test.kernel", kernel);
    let mut writer = ProgramWriter::new();
    let mut main = writer.function("main");
    let [value] = main.kernel("test.kernel", &[], &[]);
    main.result("i32", value);
    main.finish();
    let program = open(&coordinator, &collector, writer);
    let results = program
        .function("main")
        .unwrap()
        .execute(&[], &coordinator)
        .unwrap();
    coordinator.await_values(&results);
    coordinator.quiesce();
}

#[test]
fn unaccounted_results_abort() {
    assert_aborts("unaccounted_results_abort", || {
        run_single_kernel("s", |_| {});
    });
}

#[test]
fn double_resolution_on_a_worker_aborts() {
    assert_aborts("double_resolution_on_a_worker_aborts", || {
        run_single_kernel("mstd:2", |frame| {
            frame.emplace_result(0, 1_i32);
            frame.emplace_result(0, 2_i32);
        });
    });
}

#[test]
fn native_functions_run_registered_callables() {
    let (coordinator, collector) = coordinator("mstd:2");
    coordinator
        .registry()
        .add_native_function("native.negate", |arguments, results, coordinator| {
            let argument = Arc::clone(&arguments[0]);
            let result = Arc::clone(&results[0]);
            coordinator.enqueue_work(move || {
                let value = argument.get::<i64>().copied();
                match value {
                    Some(value) => result.set_value(-value),
                    None => result.set_error(AsyncError::new("expected i64")),
                }
            });
        });
    let mut writer = ProgramWriter::new();
    writer.native_function("native.negate", &["i64"], &["i64"]);
    let program = open(&coordinator, &collector, writer);

    let function = program.function("native.negate").unwrap();
    assert_eq!(function.result_types().len(), 1);
    let results = function
        .execute(&[AsyncValue::available(4_i64)], &coordinator)
        .unwrap();
    coordinator.await_values(&results);
    assert_eq!(results[0].get::<i64>(), Some(&-4));
    coordinator.quiesce();
}

#[test]
fn invalid_programs_are_rejected_with_diagnostics() {
    let (coordinator, collector) = coordinator("s");
    let handler = collector.handler();

    let err = Program::open(b"not a program".to_vec(), coordinator.registry(), &handler)
        .unwrap_err();
    assert_eq!(err.kind, ParseErrorKind::BadMagic);

    let mut writer = ProgramWriter::new();
    writer.native_function("native.missing", &[], &["i32"]);
    let err = Program::open(writer.finish(), coordinator.registry(), &handler).unwrap_err();
    assert_eq!(
        err.kind,
        ParseErrorKind::UnknownNativeFunction("native.missing".into())
    );

    let location = Location {
        filename: "cycle.mlir".into(),
        line: 12,
        column: 3,
    };
    let mut writer = ProgramWriter::new();
    let mut main = writer.function("cycle");
    let a = main.reserve_slot();
    let b = main.reserve_slot();
    main.raw_kernel("add.i32", &[a, a], &[b], &[], Some(&location));
    main.raw_kernel("value.forward", &[b], &[a], &[], None);
    main.finish();
    let err = Program::open(writer.finish(), coordinator.registry(), &handler).unwrap_err();
    assert!(matches!(err.kind, ParseErrorKind::SlotUndefined { slot, .. } if slot == a));
    assert_eq!(err.location.as_ref(), Some(&location));

    let mut writer = ProgramWriter::new();
    writer.function("huge").finish();
    let mut bytes = writer.finish();
    let slots_at = bytes.len() - 8;
    bytes[slots_at..slots_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
    let err = Program::open(bytes, coordinator.registry(), &handler).unwrap_err();
    assert!(matches!(
        err.kind,
        ParseErrorKind::UndefinedSlots { slots: u32::MAX, definitions: 0, .. }
    ));

    let diagnostics = collector.take();
    assert_eq!(diagnostics.len(), 4);
    assert_eq!(diagnostics[0].message, "invalid magic number");
    assert_eq!(diagnostics[2].location, Some(location));
    assert_eq!(
        diagnostics[3].message,
        "function 'huge' declares 4294967295 slots but defines only 0"
    );
}

#[test]
fn anonymous_functions_are_not_looked_up() {
    let (coordinator, collector) = coordinator("s");
    let mut writer = ProgramWriter::new();
    for name in ["", "", "named"] {
        let mut function = writer.function(name);
        let [value] = function.kernel("constant.i32", &[], &i32_constant(1));
        function.result("i32", value);
        function.finish();
    }
    let program = open(&coordinator, &collector, writer);
    assert_eq!(program.functions().len(), 3);
    assert!(program.function("").is_none());
    assert!(program.function("named").is_some());
}
