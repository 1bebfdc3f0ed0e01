use std::sync::Arc;
use std::time::{Duration, Instant};

use snipbox::{ExecutionResult, Executor};
use tokio::task::JoinSet;

use super::process_config;

fn executor() -> Executor {
    Executor::new(process_config(Duration::from_secs(10)))
}

#[tokio::test]
async fn test_returns_rendered_value() {
    let executor = executor();
    assert_eq!(executor.execute("return 1 + 1;").await, "2");
    assert_eq!(executor.live_contexts(), 0);
}

#[tokio::test]
async fn test_debug_rendering_for_collections() {
    let executor = executor();
    let text = executor
        .execute("let v: Vec<i32> = (1..=3).collect();\nreturn v;")
        .await;
    assert_eq!(text, "[1, 2, 3]");
}

#[tokio::test]
async fn test_allowed_namespace_resolves() {
    let executor = executor();
    let text = executor
        .execute("let mut m = HashMap::new();\nm.insert(\"a\", 1);\nreturn m.len();")
        .await;
    assert_eq!(text, "1");
}

#[tokio::test]
async fn test_unit_snippet_is_null() {
    let executor = executor();
    assert_eq!(executor.execute("let x = 1;").await, "null");
}

#[tokio::test]
async fn test_syntax_error_reports_compiler_message() {
    let executor = executor();
    let result = executor.evaluate("return 1 +;").await;

    let ExecutionResult::CompileError(diagnostics) = &result else {
        panic!("expected compile error, got {result:?}");
    };
    assert!(!diagnostics.is_empty());
    assert!(
        diagnostics
            .iter()
            .any(|d| d.message.contains("expected expression"))
    );

    let text = snipbox::normalize(&result);
    assert!(!text.contains("__snippet_body"));
    assert_eq!(executor.live_contexts(), 0);
}

#[tokio::test]
async fn test_unknown_name_is_compile_error() {
    let executor = executor();
    let text = executor.execute("return y;").await;
    assert!(text.contains("cannot find value `y` in this scope"), "{text}");
}

#[tokio::test]
async fn test_runtime_panic_is_fault() {
    let executor = executor();
    let text = executor
        .execute("let z: i32 = \"0\".parse().unwrap();\nreturn 1 / z;")
        .await;
    assert_eq!(text, "attempt to divide by zero");
    assert_eq!(executor.live_contexts(), 0);
}

#[tokio::test]
async fn test_disallowed_snippet_is_rejected() {
    let executor = executor();
    assert_eq!(
        executor.execute("std::process::exit(0);").await,
        "Not supported"
    );
    assert_eq!(executor.execute("unsafe { }").await, "Not supported");
}

#[tokio::test]
async fn test_timeout_then_recovery() {
    let executor = Executor::new(process_config(Duration::from_secs(1)));

    let started = Instant::now();
    let text = executor
        .execute("let mut n: u64 = 0;\nloop { n = n.wrapping_add(1); }")
        .await;
    assert_eq!(text, "[Execution timed out after 1 seconds]");
    // Compile time is included, so only bound the overrun loosely
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(executor.live_contexts(), 0);

    assert_eq!(executor.execute("return 40 + 2;").await, "42");
    assert_eq!(executor.live_contexts(), 0);
}

#[tokio::test]
async fn test_bare_infinite_loop_times_out() {
    let executor = Executor::new(process_config(Duration::from_secs(1)));
    assert_eq!(
        executor.execute("loop {}").await,
        "[Execution timed out after 1 seconds]"
    );
    assert_eq!(executor.live_contexts(), 0);
}

#[tokio::test]
async fn test_explicit_panic_reports_message() {
    let executor = executor();
    assert_eq!(executor.execute("panic!(\"boom\")").await, "boom");
    assert_eq!(executor.execute("panic!(\"boom\");").await, "boom");
    assert_eq!(executor.live_contexts(), 0);
}

#[tokio::test]
async fn test_options_render_their_contents() {
    let executor = executor();
    assert_eq!(
        executor
            .execute("let x: Option<i32> = None;\nreturn x;")
            .await,
        "null"
    );
    assert_eq!(executor.execute("return Some(5);").await, "5");
    assert_eq!(
        executor.execute("return Some(vec![1, 2]);").await,
        "[1, 2]"
    );
}

#[tokio::test]
async fn test_module_files_are_not_reachable() {
    let executor = executor();
    assert_eq!(
        executor
            .execute("#[path = \"/etc/hostname\"]\nmod m;\nreturn 1;")
            .await,
        "Not supported"
    );
    assert_eq!(executor.execute("mod m;\nreturn 1;").await, "Not supported");
    assert_eq!(
        executor
            .execute("mod m { pub fn f() -> i32 { 7 } }\nreturn m::f();")
            .await,
        "7"
    );
}

#[tokio::test]
async fn test_same_snippet_same_text() {
    let executor = executor();
    let snippet = "let s: String = \"abc\".chars().rev().collect();\nreturn s;";
    let first = executor.execute(snippet).await;
    let second = executor.execute(snippet).await;
    assert_eq!(first, "cba");
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_concurrent_requests_are_independent() {
    let executor = Arc::new(executor());
    let mut tasks = JoinSet::new();

    for i in 0..4 {
        let executor = Arc::clone(&executor);
        tasks.spawn(async move {
            let text = executor.execute(&format!("return {i} * 10;")).await;
            (i, text)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (i, text) = joined.unwrap();
        assert_eq!(text, (i * 10).to_string());
    }
    assert_eq!(executor.live_contexts(), 0);
}
