use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_campusd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn campusd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn exported_bundle_restores_into_a_fresh_workspace() {
    let workspace = temp_dir("campus-bundle-src");
    let restore = temp_dir("campus-bundle-dst");
    let bundle = workspace.join("export").join("campus-backup.zip");

    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Grade 3A" }),
    );
    let class_id = created
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "meals.generateBatch",
        json!({
            "classId": class_id,
            "month": "2025-01",
            "items": [
                { "day": "Monday", "mealType": "breakfast", "dish": "Porridge" }
            ]
        }),
    );

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "workspace.export",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        exported.get("bundleFormat").and_then(|v| v.as_str()),
        Some("campus-workspace-v1")
    );
    assert!(exported
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .map(|s| s.len() == 64)
        .unwrap_or(false));
    assert!(bundle.is_file());

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "workspace.import",
        json!({
            "bundlePath": bundle.to_string_lossy(),
            "path": restore.to_string_lossy()
        }),
    );
    assert_eq!(
        imported
            .get("bundleFormatDetected")
            .and_then(|v| v.as_str()),
        Some("campus-workspace-v1")
    );

    // The restored workspace is now active and carries the same data.
    let classes = request_ok(&mut stdin, &mut reader, "6", "classes.list", json!({}));
    let class_names: Vec<&str> = classes
        .get("classes")
        .and_then(|v| v.as_array())
        .expect("classes")
        .iter()
        .filter_map(|c| c.get("name").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(class_names, vec!["Grade 3A"]);

    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "meals.monthOpen",
        json!({ "classId": class_id, "month": "2025-01" }),
    );
    let monday = &opened.get("days").and_then(|v| v.as_array()).expect("days")[0];
    assert_eq!(
        monday
            .get("meals")
            .and_then(|m| m.get("breakfast"))
            .and_then(|m| m.get("dish"))
            .and_then(|v| v.as_str()),
        Some("Porridge")
    );
}

#[test]
fn import_rejects_a_non_bundle_file() {
    let workspace = temp_dir("campus-bundle-bad");
    let restore = temp_dir("campus-bundle-bad-dst");
    let not_a_bundle = workspace.join("not-a-bundle.zip");
    std::fs::write(&not_a_bundle, b"plainly not a zip archive").expect("write junk file");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let raw = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.import",
        json!({
            "bundlePath": not_a_bundle.to_string_lossy(),
            "path": restore.to_string_lossy()
        }),
    );
    assert_eq!(raw.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        raw.get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("import_failed")
    );
}
