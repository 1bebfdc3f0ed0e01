use std::time::Duration;

use snipbox::Executor;
use snipbox::isolate::IsolateBox;

use super::isolate_config;

#[tokio::test]
#[ignore = "requires root"]
async fn test_box_init_and_cleanup() {
    let config = isolate_config(Duration::from_secs(5), 60);
    let sandbox = IsolateBox::init(60, config.isolate_binary(), config.sandbox.cgroup)
        .await
        .expect("Failed to create sandbox");

    assert!(sandbox.path().exists());
    assert!(sandbox.is_initialized());

    sandbox.cleanup().await.expect("Failed to cleanup sandbox");
    assert!(!sandbox.is_initialized());
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_snippet_runs_in_box() {
    let executor = Executor::new(isolate_config(Duration::from_secs(5), 64));
    assert_eq!(executor.execute("return 1 + 1;").await, "2");
    assert_eq!(executor.live_contexts(), 0);
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_runtime_panic_in_box() {
    let executor = Executor::new(isolate_config(Duration::from_secs(5), 68));
    let text = executor
        .execute("let v: Vec<i32> = Vec::new();\nreturn v[3];")
        .await;
    assert!(text.contains("index out of bounds"), "{text}");
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_box_timeout_frees_box() {
    let executor = Executor::new(isolate_config(Duration::from_secs(1), 72));

    let text = executor
        .execute("let mut n: u64 = 0;\nloop { n = n.wrapping_add(1); }")
        .await;
    assert_eq!(text, "[Execution timed out after 1 seconds]");
    assert_eq!(executor.live_contexts(), 0);

    assert_eq!(executor.execute("return 7;").await, "7");
}
