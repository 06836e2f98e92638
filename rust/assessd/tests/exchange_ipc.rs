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

fn ok_result(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let resp = request(stdin, reader, id, method, params);
    assert_eq!(resp["ok"], json!(true), "{method} failed: {resp}");
    resp["result"].clone()
}

#[test]
fn class_template_export_stops_at_capacity_with_a_warning() {
    let workspace = temp_dir("assessd-capacity");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    ok_result(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    for i in 0..115 {
        ok_result(
            &mut stdin,
            &mut reader,
            &format!("s{i}"),
            "students.create",
            json!({
                "studentNumber": format!("N{i:03}"),
                "firstName": "Student",
                "lastName": format!("L{i:03}"),
                "className": "3B",
            }),
        );
    }

    let out = ok_result(
        &mut stdin,
        &mut reader,
        "2",
        "export.classTemplate",
        json!({ "className": "3B" }),
    );
    assert_eq!(out["rowsExported"].as_u64(), Some(111));
    assert_eq!(out["warning"]["code"], json!("capacity_exceeded"));
    assert_eq!(out["warning"]["dropped"].as_u64(), Some(4));
    assert_eq!(
        out["mimeType"],
        json!("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet")
    );
    let file_name = out["fileName"].as_str().expect("file name");
    assert!(file_name.starts_with("students_all_subjects_3B_"));
    let path = PathBuf::from(out["path"].as_str().expect("path"));
    assert!(path.is_file());
    assert!(path.starts_with(workspace.join("exports")));

    let read = ok_result(
        &mut stdin,
        &mut reader,
        "3",
        "template.readStudents",
        json!({ "path": path.to_string_lossy() }),
    );
    assert_eq!(read["count"].as_u64(), Some(111));
    assert_eq!(read["students"][0]["name"], json!("L000 Student"));
    assert_eq!(read["students"][0]["student_number"], json!("N000"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn import_sheets_round_trip_through_bulk_import() {
    let workspace = temp_dir("assessd-import");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    ok_result(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let sheet = ok_result(
        &mut stdin,
        &mut reader,
        "2",
        "template.importSheet",
        json!({ "kind": "students" }),
    );
    let students_path = sheet["path"].as_str().expect("path").to_string();
    let report = ok_result(
        &mut stdin,
        &mut reader,
        "3",
        "students.importExcel",
        json!({ "path": students_path }),
    );
    assert_eq!(report["successCount"].as_u64(), Some(3));
    assert_eq!(report["errorCount"].as_u64(), Some(0));

    let again = ok_result(
        &mut stdin,
        &mut reader,
        "4",
        "students.importExcel",
        json!({ "path": students_path }),
    );
    assert_eq!(again["successCount"].as_u64(), Some(0));
    assert_eq!(again["errorCount"].as_u64(), Some(3));
    assert_eq!(again["errors"][0], json!("Row 2: Student STU001 already exists"));

    let sheet = ok_result(
        &mut stdin,
        &mut reader,
        "5",
        "template.importSheet",
        json!({ "kind": "assessments" }),
    );
    let report = ok_result(
        &mut stdin,
        &mut reader,
        "6",
        "assessments.importExcel",
        json!({ "path": sheet["path"] }),
    );
    assert_eq!(report["successCount"].as_u64(), Some(2));

    let csv = ok_result(&mut stdin, &mut reader, "7", "export.assessmentsCsv", json!({}));
    assert_eq!(csv["rowsExported"].as_u64(), Some(2));
    let text = std::fs::read_to_string(csv["path"].as_str().expect("path")).expect("read csv");
    assert!(text.starts_with("student_number,name,category,subject,score,max_score,percentage,"));
    assert_eq!(text.lines().count(), 3);

    let wrong_kind = workspace.join("notes.txt");
    std::fs::write(&wrong_kind, "hello").expect("write");
    let rejected = request(
        &mut stdin,
        &mut reader,
        "8",
        "students.importExcel",
        json!({ "path": wrong_kind.to_string_lossy() }),
    );
    assert_eq!(error_code(&rejected), "bad_params");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn template_install_accepts_only_workbooks_from_admins() {
    let workspace = temp_dir("assessd-install");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    ok_result(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    ok_result(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "studentNumber": "S1", "firstName": "Ama", "lastName": "Mensah" }),
    );
    let exported = ok_result(
        &mut stdin,
        &mut reader,
        "3",
        "export.classTemplate",
        json!({}),
    );
    let source = exported["path"].as_str().expect("path").to_string();

    let teacher = ok_result(
        &mut stdin,
        &mut reader,
        "4",
        "users.create",
        json!({ "username": "esi", "role": "teacher" }),
    );
    let denied = request(
        &mut stdin,
        &mut reader,
        "5",
        "template.install",
        json!({ "path": source, "actor": { "userId": teacher["id"] } }),
    );
    assert_eq!(error_code(&denied), "forbidden");

    let installed = ok_result(
        &mut stdin,
        &mut reader,
        "6",
        "template.install",
        json!({ "path": source }),
    );
    assert!(installed["bytes"].as_u64().unwrap_or(0) > 0);

    let not_xlsx = workspace.join("template.xls");
    std::fs::write(&not_xlsx, "x").expect("write");
    let rejected = request(
        &mut stdin,
        &mut reader,
        "7",
        "template.install",
        json!({ "path": not_xlsx.to_string_lossy() }),
    );
    assert_eq!(error_code(&rejected), "bad_params");

    drop(stdin);
    let _ = child.wait();
}
