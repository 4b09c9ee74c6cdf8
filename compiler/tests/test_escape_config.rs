use compiler::config::{ConfigError, EscapeConfig};
use compiler::escape::{AllocationDecision, EscapeAnalysis, SummarySource};
use compiler::ir::{DeclId, ProgramBuilder};

#[test]
fn test_toml_override_drives_call_sites() {
    compiler::logging::init_test();
    let config = EscapeConfig::from_toml_str(
        r#"
        [[external]]
        name = "strlen"
        safe = true

        [[external]]
        name = "register"
        leaking_parameters = [{ index = 0 }]
        "#,
    )
    .unwrap();

    let mut program = ProgramBuilder::new();
    let strlen = program.external("strlen", &[("s", true)]);
    let register = program.external("register", &[("callback", true)]);
    let main = program.declare_function("main");
    let mut measured = DeclId::invalid();
    let mut registered = DeclId::invalid();
    program.define(main, |fb| {
        measured = fb.declare("measured", None);
        registered = fb.declare("registered", None);

        let value = fb.var(measured);
        let arg = fb.addr(value);
        let call = fb.call(strlen, vec![arg]);
        fb.declare("n", Some(call));

        let value = fb.var(registered);
        let arg = fb.addr(value);
        let call = fb.call(register, vec![arg]);
        fb.expr_stmt(call);
    });
    let program = program.build();

    let results = EscapeAnalysis::perform(&program, &config).unwrap();

    let strlen_summary = results.summaries.get(strlen).unwrap();
    assert_eq!(strlen_summary.source, SummarySource::Override);
    assert!(strlen_summary.is_safe);
    assert_eq!(strlen_summary.parameter_leak_level, vec![None]);
    assert_eq!(results.summaries.leak_level(register, 0), Ok(Some(0)));

    assert_eq!(
        results.variable_decision(measured),
        Some(AllocationDecision::StackEligible)
    );
    assert_eq!(
        results.variable_decision(registered),
        Some(AllocationDecision::HeapRequired)
    );
    assert_eq!(results.stats.external_functions, 2);
    assert_eq!(results.stats.functions_analyzed, 1);
}

#[test]
fn test_bare_override_keeps_arguments_escaping() {
    let config = EscapeConfig::from_toml_str(
        r#"
        [[external]]
        name = "stash"
        "#,
    )
    .unwrap();

    let mut program = ProgramBuilder::new();
    let stash = program.external("stash", &[("p", true)]);
    let main = program.declare_function("main");
    let mut x = DeclId::invalid();
    program.define(main, |fb| {
        x = fb.declare("x", None);
        let value = fb.var(x);
        let arg = fb.addr(value);
        let call = fb.call(stash, vec![arg]);
        fb.expr_stmt(call);
    });
    let program = program.build();

    let results = EscapeAnalysis::perform(&program, &config).unwrap();
    let summary = results.summaries.get(stash).unwrap();
    assert_eq!(summary.source, SummarySource::Override);
    assert!(!summary.is_safe);
    assert_eq!(results.summaries.leak_level(stash, 0), Ok(Some(0)));
    assert_eq!(
        results.variable_decision(x),
        Some(AllocationDecision::HeapRequired)
    );
}

#[test]
fn test_override_with_bad_parameter_index_fails_the_pass() {
    let config = EscapeConfig::from_toml_str(
        r#"
        [[external]]
        name = "free"
        leaking_parameters = [{ index = 3 }]
        "#,
    )
    .unwrap();

    let mut program = ProgramBuilder::new();
    program.external("free", &[("ptr", true)]);
    let program = program.build();

    let err = EscapeAnalysis::perform(&program, &config).unwrap_err();
    assert!(err.to_string().contains("Parameter index 3"));
}

#[test]
fn test_load_missing_file() {
    let path = std::env::temp_dir().join("escapist-no-such-config.toml");
    let err = EscapeConfig::load(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn test_load_from_file() {
    let path = std::env::temp_dir().join(format!("escapist-config-{}.toml", std::process::id()));
    std::fs::write(&path, "parallel = true\nmax_stack_allocation_size = 128\n").unwrap();
    let config = EscapeConfig::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert!(config.parallel);
    assert!(config.exceeds_stack_limit(129));
    assert!(!config.exceeds_stack_limit(128));
}

#[test]
fn test_demo_program() {
    let root = concat!(env!("CARGO_MANIFEST_DIR"), "/../demos");
    let source = std::fs::read_to_string(format!("{}/sample_program.json", root)).unwrap();
    let program: compiler::ir::Program = serde_json::from_str(&source).unwrap();
    let config = EscapeConfig::load(format!("{}/escape.toml", root)).unwrap();
    let results = EscapeAnalysis::perform(&program, &config).unwrap();

    let id = |name: &str| program.function_named(name).unwrap().id;
    assert_eq!(results.is_safe_function(id("f")), Ok(false));
    assert_eq!(results.is_safe_function(id("g")), Ok(true));
    assert_eq!(results.is_safe_function(id("consume_safe")), Ok(true));
    assert_eq!(results.is_safe_function(id("k")), Ok(true));
    assert_eq!(results.is_safe_function(id("memmove")), Ok(true));

    // `x` is declared inside main's loop and its address outlives the iteration
    assert_eq!(
        results.variable_decision(DeclId::from_raw(9)),
        Some(AllocationDecision::HeapRequired)
    );
    assert_eq!(results.stats.heap_allocations, 2);
}
