/*!
 * CLI 适配器进程测试（unix）
 *
 * 用假的 vendor 脚本验证子进程编排：参数构造、事件流消费、
 * 失败消息来源、跨模型 resume 的透明重试与协作式取消。
 */

#![cfg(unix)]

use ads_core::agent::adapter::{
    AgentAdapter, AgentInput, CliAdapterConfig, CliAgentAdapter, SendOptions, StreamingConfig,
};
use ads_core::agent::AgentVendor;
use ads_core::config::DEFAULT_TURN_TIMEOUT;
use ads_core::error::CoreError;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// 写一个可执行的假 vendor 脚本
fn write_fake_vendor(dir: &Path, name: &str, body: &str) -> PathBuf {
    let _ = tracing_subscriber::fmt::try_init();
    let path = dir.join(name);
    let script = format!("#!/bin/sh\n{}\n", body);
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn adapter_for(binary: &Path) -> CliAgentAdapter {
    CliAgentAdapter::new(CliAdapterConfig {
        vendor: AgentVendor::Droid,
        binary: binary.to_string_lossy().into_owned(),
        model: None,
        sandbox_read_only: false,
        allowlist: None,
        streaming: StreamingConfig::default(),
        turn_timeout: DEFAULT_TURN_TIMEOUT,
    })
}

#[tokio::test]
async fn test_send_happy_path_collects_response_and_usage() {
    let temp = TempDir::new().unwrap();
    let body = r#"
cat > /dev/null
printf '%s\n' '{"type":"system","subtype":"init","session_id":"sess-1"}'
printf '%s\n' '{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"hello from fake"}]}}'
printf '%s\n' 'this line is not json and must be ignored'
printf '%s\n' '{"type":"result","subtype":"success","result":"hello from fake","usage":{"input_tokens":3,"output_tokens":5}}'
"#;
    let binary = write_fake_vendor(temp.path(), "droid", body);
    let adapter = adapter_for(&binary);

    let result = adapter
        .send(AgentInput::Text("hi".into()), SendOptions::default())
        .await
        .unwrap();

    assert_eq!(result.response, "hello from fake");
    let usage = result.usage.unwrap();
    assert_eq!(usage.input_tokens, Some(3));
    assert_eq!(usage.output_tokens, Some(5));
    assert_eq!(adapter.thread_id().as_deref(), Some("sess-1"));
}

#[tokio::test]
async fn test_second_send_passes_resume() {
    let temp = TempDir::new().unwrap();
    let args_file = temp.path().join("args.log");
    let body = format!(
        r#"
echo "$@" >> "{args}"
cat > /dev/null
printf '%s\n' '{{"type":"system","subtype":"init","session_id":"sess-9"}}'
printf '%s\n' '{{"type":"result","subtype":"success","result":"ok"}}'
"#,
        args = args_file.display()
    );
    let binary = write_fake_vendor(temp.path(), "droid", &body);
    let adapter = adapter_for(&binary);

    adapter
        .send(AgentInput::Text("first".into()), SendOptions::default())
        .await
        .unwrap();
    adapter
        .send(AgentInput::Text("second".into()), SendOptions::default())
        .await
        .unwrap();

    let logged = std::fs::read_to_string(&args_file).unwrap();
    let lines: Vec<&str> = logged.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(!lines[0].contains("resume"));
    assert!(lines[1].contains("resume sess-9"));
    assert!(lines.iter().all(|l| l.contains("--json")));
    assert!(lines.iter().all(|l| l.contains("--skip-git-repo-check")));

    // reset 后不再携带 resume
    adapter.reset();
    assert!(adapter.thread_id().is_none());
}

#[tokio::test]
async fn test_failure_message_falls_back_to_stderr() {
    let temp = TempDir::new().unwrap();
    let body = r#"
cat > /dev/null
echo "credential store locked" >&2
exit 2
"#;
    let binary = write_fake_vendor(temp.path(), "droid", body);
    let adapter = adapter_for(&binary);

    let err = adapter
        .send(AgentInput::Text("hi".into()), SendOptions::default())
        .await
        .unwrap_err();
    match err {
        CoreError::AdapterFailure(message) => {
            assert!(message.contains("credential store locked"));
        }
        other => panic!("期望 AdapterFailure，得到 {:?}", other),
    }
}

#[tokio::test]
async fn test_failure_message_defaults_to_exit_code() {
    let temp = TempDir::new().unwrap();
    let body = r#"
cat > /dev/null
exit 3
"#;
    let binary = write_fake_vendor(temp.path(), "droid", body);
    let adapter = adapter_for(&binary);

    let err = adapter
        .send(AgentInput::Text("hi".into()), SendOptions::default())
        .await
        .unwrap_err();
    match err {
        CoreError::AdapterFailure(message) => assert!(message.contains('3')),
        other => panic!("期望 AdapterFailure，得到 {:?}", other),
    }
}

#[tokio::test]
async fn test_resume_mismatch_transparent_retry() {
    let temp = TempDir::new().unwrap();
    let count_file = temp.path().join("count.log");
    // 带 resume 的调用被拒绝；不带 resume 的成功并给出新线程
    let body = format!(
        r#"
echo run >> "{count}"
cat > /dev/null
case "$*" in
*resume*)
    printf '%s\n' '{{"type":"result","subtype":"error_during_execution","error":"Cannot resume thread with a different model"}}'
    ;;
*)
    printf '%s\n' '{{"type":"system","subtype":"init","session_id":"sess-new"}}'
    printf '%s\n' '{{"type":"result","subtype":"success","result":"resumed fresh"}}'
    ;;
esac
"#,
        count = count_file.display()
    );
    let binary = write_fake_vendor(temp.path(), "droid", &body);
    let adapter = adapter_for(&binary);

    // 第一次：无 resume，成功并存下线程
    adapter
        .send(AgentInput::Text("first".into()), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(adapter.thread_id().as_deref(), Some("sess-new"));

    // 第二次：resume 被拒 → 自动去掉 resume 重试成功
    let result = adapter
        .send(AgentInput::Text("second".into()), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(result.response, "resumed fresh");
    assert_eq!(adapter.thread_id().as_deref(), Some("sess-new"));

    // 共三次 spawn：1 + (拒绝 + 重试)
    let runs = std::fs::read_to_string(&count_file).unwrap();
    assert_eq!(runs.lines().count(), 3);
}

#[tokio::test]
async fn test_cancellation_terminates_child() {
    let temp = TempDir::new().unwrap();
    let body = r#"
cat > /dev/null
printf '%s\n' '{"type":"system","subtype":"init","session_id":"sess-1"}'
sleep 30
"#;
    let binary = write_fake_vendor(temp.path(), "droid", body);
    let adapter = adapter_for(&binary);

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel_clone.cancel();
    });

    let started = tokio::time::Instant::now();
    let err = adapter
        .send(
            AgentInput::Text("hi".into()),
            SendOptions {
                cancel: Some(cancel),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(10), "取消未及时生效");
}

#[tokio::test]
async fn test_turn_timeout_is_adapter_failure() {
    let temp = TempDir::new().unwrap();
    let body = r#"
cat > /dev/null
sleep 30
"#;
    let binary = write_fake_vendor(temp.path(), "droid", body);
    let adapter = adapter_for(&binary);

    let err = adapter
        .send(
            AgentInput::Text("hi".into()),
            SendOptions {
                timeout: Some(Duration::from_millis(300)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::AdapterFailure(_)));
}

#[tokio::test]
async fn test_allowlist_blocks_spawn() {
    let temp = TempDir::new().unwrap();
    let binary = write_fake_vendor(temp.path(), "droid", "exit 0");

    let adapter = CliAgentAdapter::new(CliAdapterConfig {
        vendor: AgentVendor::Droid,
        binary: binary.to_string_lossy().into_owned(),
        model: None,
        sandbox_read_only: false,
        // 白名单启用：带路径的二进制被拒
        allowlist: Some(vec!["droid".to_string()]),
        streaming: StreamingConfig::default(),
        turn_timeout: DEFAULT_TURN_TIMEOUT,
    });

    let err = adapter
        .send(AgentInput::Text("hi".into()), SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}
