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
    let exe = env!("CARGO_BIN_EXE_assessd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn assessd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn send_line(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    line: &str,
) -> serde_json::Value {
    writeln!(stdin, "{}", line).expect("write request");
    stdin.flush().expect("flush request");
    let mut out = String::new();
    reader.read_line(&mut out).expect("read response line");
    serde_json::from_str(out.trim()).expect("parse response json")
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
    let value = send_line(stdin, reader, &payload.to_string());
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn error_code(v: &serde_json::Value) -> &str {
    v.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
}

#[test]
fn requests_before_workspace_selection_are_rejected() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["ok"], json!(true));
    assert!(health["result"]["workspacePath"].is_null());

    let listed = request(&mut stdin, &mut reader, "2", "students.list", json!({}));
    assert_eq!(listed["ok"], json!(false));
    assert_eq!(error_code(&listed), "no_workspace");

    let unknown = send_line(
        &mut stdin,
        &mut reader,
        &json!({ "id": "3", "method": "nope.nothing", "params": {} }).to_string(),
    );
    assert_eq!(error_code(&unknown), "not_implemented");

    let garbage = send_line(&mut stdin, &mut reader, "{not json");
    assert_eq!(error_code(&garbage), "bad_json");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("assessd-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let selected = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(selected["ok"], json!(true));
    assert!(workspace.join("assessd.sqlite3").is_file());
    assert!(workspace
        .join("templates_excel")
        .join("student_template.xlsx")
        .is_file());

    let settings = request(&mut stdin, &mut reader, "2", "settings.get", json!({}));
    assert_eq!(settings["result"]["term"]["currentTerm"], json!("term1"));
    assert_eq!(settings["result"]["categories"].as_array().map(|a| a.len()), Some(9));

    let student = request(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "studentNumber": "S1", "firstName": "Ama", "lastName": "Mensah", "className": "2A" }),
    );
    let student_id = student["result"]["id"].as_str().expect("student id").to_string();
    assert!(student["result"]["referenceNumber"]
        .as_str()
        .expect("reference")
        .starts_with("STU"));

    let calls = [
        ("students.list", json!({})),
        ("students.search", json!({ "q": "ama" })),
        ("students.get", json!({ "id": student_id })),
        ("students.update", json!({ "id": student_id, "studyArea": "Science" })),
        ("assessments.list", json!({})),
        ("grades.student", json!({ "studentId": student_id })),
        ("grades.subjects", json!({ "studentId": student_id })),
        ("users.list", json!({})),
        ("questions.list", json!({})),
        ("quizzes.list", json!({})),
        ("quizzes.attempts", json!({})),
        ("template.importSheet", json!({ "kind": "students" })),
        ("export.assessmentsCsv", json!({})),
        ("export.studentCsv", json!({ "studentId": student_id })),
        ("export.assessmentsExcel", json!({})),
        ("export.studentTemplate", json!({ "studentId": student_id })),
        ("export.classTemplate", json!({ "className": "2A" })),
    ];
    for (i, (method, params)) in calls.into_iter().enumerate() {
        let id = format!("call-{i}");
        let resp = request(&mut stdin, &mut reader, &id, method, params);
        assert_eq!(resp["ok"], json!(true), "{method} failed: {resp}");
    }

    let found = request(&mut stdin, &mut reader, "4", "students.search", json!({ "q": "MENS" }));
    assert_eq!(found["result"]["students"].as_array().map(|a| a.len()), Some(1));

    let grade = request(
        &mut stdin,
        &mut reader,
        "5",
        "grades.student",
        json!({ "studentId": student_id }),
    );
    assert_eq!(grade["result"]["finalGrade"]["state"], json!("no_data"));

    drop(stdin);
    let _ = child.wait();
}
