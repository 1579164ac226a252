use assert_cmd::prelude::*;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::{fs, process::Command, sync::mpsc, time::Duration};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};

fn write_env(dir: &TempDir, relays: &str) -> String {
    let env_path = dir.path().join("env");
    let content = format!(
        concat!(
            "STORE_ROOT={}\n",
            "RELAYS={}\n",
            "SECRET_KEY={}\n",
            "RETRY_SECS=1\n",
            "CONNECT_WAIT_SECS=10\n",
            "FETCH_TIMEOUT_SECS=10\n"
        ),
        dir.path().display(),
        relays,
        "01".repeat(32),
    );
    fs::write(&env_path, content).unwrap();
    env_path.to_str().unwrap().to_string()
}

/// In-process relay: records published events, answers REQ with the given
/// stored events followed by EOSE. The returned runtime keeps it alive.
fn spawn_relay(
    stored: Vec<Value>,
) -> (String, mpsc::Receiver<Value>, tokio::runtime::Runtime) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (tx, rx) = mpsc::channel();
    let listener = rt
        .block_on(TcpListener::bind("127.0.0.1:0"))
        .unwrap();
    let addr = listener.local_addr().unwrap();
    rt.spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            let stored = stored.clone();
            tokio::spawn(async move {
                let mut ws = accept_async(stream).await.unwrap();
                while let Some(Ok(msg)) = ws.next().await {
                    let Ok(text) = msg.into_text() else { continue };
                    let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    if frame[0] == "EVENT" {
                        let _ = tx.send(frame[1].clone());
                    } else if frame[0] == "REQ" {
                        let sub = frame[1].as_str().unwrap().to_string();
                        for ev in &stored {
                            let out = json!(["EVENT", sub, ev]).to_string();
                            ws.send(Message::Text(out)).await.unwrap();
                        }
                        ws.send(Message::Text(json!(["EOSE", sub]).to_string()))
                            .await
                            .unwrap();
                    }
                }
            });
        }
    });
    (format!("ws://{addr}"), rx, rt)
}

#[test]
fn keygen_prints_identity() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, "");
    let output = Command::cargo_bin("postr")
        .unwrap()
        .args(["--env", &env_path, "keygen"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let secret = stdout
        .lines()
        .find_map(|l| l.strip_prefix("SECRET_KEY="))
        .unwrap();
    assert_eq!(secret.len(), 64);
    assert!(stdout.contains("npub:   npub1"));
}

#[test]
fn init_creates_store() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, "");
    Command::cargo_bin("postr")
        .unwrap()
        .args(["--env", &env_path, "init"])
        .assert()
        .success();
    assert!(dir.path().join("kv").is_dir());
}

#[test]
fn relay_list_shows_seed_endpoints() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, "");
    let output = Command::cargo_bin("postr")
        .unwrap()
        .args(["--env", &env_path, "relay", "list"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(stdout.lines().count(), 6);
    assert!(stdout.lines().all(|l| l.ends_with("disconnected")));
}

#[test]
fn user_lifecycle_caches_profile_name() {
    let dir = TempDir::new().unwrap();
    let hex = "cd".repeat(32);
    let profile = json!({
        "id": "22".repeat(32),
        "pubkey": hex.clone(),
        "created_at": 1,
        "kind": 0,
        "tags": [],
        "content": r#"{"display_name":"Alice"}"#,
        "sig": "00".repeat(64),
    });
    let (url, _received, _rt) = spawn_relay(vec![profile]);
    let env_path = write_env(&dir, &url);

    Command::cargo_bin("postr")
        .unwrap()
        .args(["--env", &env_path, "user", "add", &hex])
        .assert()
        .success();

    // The follow entry carries the name fetched at add time.
    let output = Command::cargo_bin("postr")
        .unwrap()
        .args(["--env", &env_path, "user", "list"])
        .output()
        .unwrap();
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(stdout.trim(), format!("{hex} Alice"));

    Command::cargo_bin("postr")
        .unwrap()
        .args(["--env", &env_path, "user", "remove", &hex])
        .assert()
        .success();
    Command::cargo_bin("postr")
        .unwrap()
        .args(["--env", &env_path, "user", "remove", &hex])
        .assert()
        .failure();
}

#[test]
fn publish_delivers_signed_note() {
    let dir = TempDir::new().unwrap();
    let (url, received, _rt) = spawn_relay(vec![]);
    let env_path = write_env(&dir, &url);

    let output = Command::cargo_bin("postr")
        .unwrap()
        .args(["--env", &env_path, "publish", "hello world"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains(&format!("delivered: {url}")));

    let event = received.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(event["kind"], 1);
    assert_eq!(event["content"], "hello world");
    assert_eq!(event["sig"].as_str().unwrap().len(), 128);
}

#[test]
fn fetch_prints_stored_notes() {
    let dir = TempDir::new().unwrap();
    let author = "ab".repeat(32);
    let stored = json!({
        "id": "11".repeat(32),
        "pubkey": author,
        "created_at": 7,
        "kind": 1,
        "tags": [],
        "content": "from the archive",
        "sig": "00".repeat(64),
    });
    let (url, _received, _rt) = spawn_relay(vec![stored]);
    let env_path = write_env(&dir, &url);

    let output = Command::cargo_bin("postr")
        .unwrap()
        .args(["--env", &env_path, "fetch", &author])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let line = stdout.lines().next().unwrap();
    let event: Value = serde_json::from_str(line).unwrap();
    assert_eq!(event["content"], "from the archive");
}

#[test]
fn publish_without_relays_fails() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, "ws://127.0.0.1:1");
    // Override the bounded wait so the failure is quick.
    let content = fs::read_to_string(&env_path)
        .unwrap()
        .replace("CONNECT_WAIT_SECS=10", "CONNECT_WAIT_SECS=1");
    fs::write(&env_path, content).unwrap();

    Command::cargo_bin("postr")
        .unwrap()
        .args(["--env", &env_path, "publish", "lost"])
        .assert()
        .failure();
}
