mod common;

use std::sync::Arc;

use polysandbox::config::{IsolationMode, ManagerConfig};
use polysandbox::error::SandboxError;
use polysandbox::sandbox::{ExecuteRequest, ExecutionStatus, Executor, SandboxExecutor};

use common::{eventually, executor_with, test_config, Behavior, FakeRuntime};

fn proxy_executor(root: &std::path::Path, cmd: &str) -> (SandboxExecutor, Arc<FakeRuntime>) {
    let runtime = FakeRuntime::new(Behavior::default());
    let config = ManagerConfig {
        firecracker_proxy_cmd: cmd.to_string(),
        ..test_config(root)
    };
    (executor_with(config, Arc::clone(&runtime)), runtime)
}

fn vm_request(language: &str, code: &str) -> ExecuteRequest {
    ExecuteRequest::new(language, code).with_isolation(IsolationMode::Firecracker)
}

#[tokio::test]
async fn proxy_result_is_parsed_and_normalized() {
    let root = tempfile::tempdir().unwrap();
    let (executor, runtime) = proxy_executor(
        root.path(),
        r#"cat >/dev/null; printf '{"status":"completed","output":"42\\n","exit_code":0}'"#,
    );

    let result = executor.execute(vm_request("py", "print(42)")).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.stdout, "42\n");
    assert_eq!(result.isolation, IsolationMode::Firecracker);
    assert!(result.completed_at >= result.started_at);

    // Nothing touched the container runtime
    assert_eq!(runtime.created_count(), 0);
    assert_eq!(executor.active_count(), 0);
    assert_eq!(executor.stats().success, 1);
}

#[tokio::test]
async fn proxy_receives_the_resolved_job() {
    let root = tempfile::tempdir().unwrap();
    let payload = root.path().join("payload.json");
    let cmd = format!("cat > '{}'; echo '{{}}'", payload.display());
    let (executor, _) = proxy_executor(root.path(), &cmd);

    executor
        .execute(
            vm_request("js", "console.log(1)")
                .with_id("vm-1")
                .with_project("acme")
                .with_stdin("in")
                .with_env("K", "V")
                .with_file("lib.js", "module.exports = 1"),
        )
        .await
        .unwrap();

    let sent: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&payload).unwrap()).unwrap();
    assert_eq!(sent["id"], "vm-1");
    assert_eq!(sent["project"], "acme");
    assert_eq!(sent["language"], "javascript");
    assert_eq!(sent["code"], "console.log(1)");
    assert_eq!(sent["stdin"], "in");
    assert_eq!(sent["env"]["K"], "V");
    assert_eq!(sent["files"]["lib.js"], "module.exports = 1");
    assert_eq!(sent["template"]["image"], "node:20-slim");
    assert_eq!(sent["quota"]["pids_limit"], 96);
}

#[tokio::test]
async fn proxy_failure_includes_its_stderr() {
    let root = tempfile::tempdir().unwrap();
    let (executor, _) = proxy_executor(root.path(), "echo 'no kvm' >&2; exit 3");

    let err = executor.execute(vm_request("python", "print(1)")).await.unwrap_err();
    assert!(matches!(err, SandboxError::Proxy(_)));
    assert!(err.to_string().contains("no kvm"), "{err}");
    assert_eq!(executor.stats().failed, 1);
    assert_eq!(executor.active_count(), 0);
}

#[tokio::test]
async fn proxy_invalid_json_is_an_error() {
    let root = tempfile::tempdir().unwrap();
    let (executor, _) = proxy_executor(root.path(), "cat >/dev/null; echo not-json");

    let err = executor.execute(vm_request("python", "print(1)")).await.unwrap_err();
    assert!(err.to_string().contains("invalid JSON"), "{err}");
}

#[tokio::test]
async fn missing_proxy_command_is_a_config_error() {
    let root = tempfile::tempdir().unwrap();
    let (executor, _) = proxy_executor(root.path(), "   ");

    let err = executor.execute(vm_request("python", "print(1)")).await.unwrap_err();
    assert!(matches!(err, SandboxError::ProxyNotConfigured { .. }));
    assert!(err.to_string().contains("SANDBOX_V2_FIRECRACKER_PROXY_CMD"));
}

#[tokio::test]
async fn proxy_run_can_be_killed() {
    let root = tempfile::tempdir().unwrap();
    let (executor, _) = proxy_executor(root.path(), "sleep 30");
    let executor = Arc::new(executor);

    let run = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move {
            executor
                .execute(vm_request("python", "print(1)").with_id("vm-kill"))
                .await
        })
    };

    assert!(eventually(|| executor.active_count() == 1).await);
    executor.kill("vm-kill").await.unwrap();

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), run)
        .await
        .expect("killed run returns promptly")
        .unwrap()
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Killed);
    assert!(result.killed);
    assert_eq!(executor.active_count(), 0);
}

#[tokio::test]
async fn default_isolation_routes_to_proxy() {
    let root = tempfile::tempdir().unwrap();
    let runtime = FakeRuntime::new(Behavior::default());
    let config = ManagerConfig {
        default_isolation: IsolationMode::Firecracker,
        firecracker_proxy_cmd: r#"cat >/dev/null; echo '{"status":"failed","exit_code":1}'"#.into(),
        ..test_config(root.path())
    };
    let executor = executor_with(config, Arc::clone(&runtime));

    let result = executor
        .execute(ExecuteRequest::new("go", "package main"))
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.exit_code, 1);
    assert_eq!(runtime.created_count(), 0);
}
