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
fn worked_example_grades_to_c6_and_archiving_clears_it() {
    let workspace = temp_dir("assessd-grades");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    ok_result(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student = ok_result(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "studentNumber": "S1", "firstName": "Ama", "lastName": "Mensah" }),
    );
    let sid = student["id"].as_str().expect("id").to_string();

    for (i, (category, score)) in [("ica1", 40.0), ("ica2", 10.0), ("mid_term", 50.0), ("end_term", 80.0)]
        .into_iter()
        .enumerate()
    {
        ok_result(
            &mut stdin,
            &mut reader,
            &format!("a{i}"),
            "assessments.create",
            json!({ "studentId": sid, "category": category, "subject": "Maths", "score": score }),
        );
    }

    let report = ok_result(
        &mut stdin,
        &mut reader,
        "3",
        "grades.student",
        json!({ "studentId": sid, "subject": "Maths" }),
    );
    let grade = &report["finalGrade"];
    assert_eq!(grade["state"], json!("computed"));
    assert_eq!(grade["finalPercent"].as_f64(), Some(50.0));
    assert_eq!(grade["gpa"].as_f64(), Some(1.5));
    assert_eq!(grade["letterGrade"], json!("C6"));
    assert_eq!(grade["remark"], json!("Credit"));

    let subjects = ok_result(
        &mut stdin,
        &mut reader,
        "4",
        "grades.subjects",
        json!({ "studentId": sid }),
    );
    assert_eq!(subjects["subjects"].as_array().map(|a| a.len()), Some(1));

    ok_result(
        &mut stdin,
        &mut reader,
        "5",
        "settings.update",
        json!({ "currentTerm": "term2" }),
    );
    let archived = ok_result(&mut stdin, &mut reader, "6", "settings.archiveTerm", json!({}));
    assert_eq!(archived["archived"].as_u64(), Some(4));

    let report = ok_result(
        &mut stdin,
        &mut reader,
        "7",
        "grades.student",
        json!({ "studentId": sid }),
    );
    assert_eq!(report["finalGrade"]["state"], json!("no_data"));

    let listed = ok_result(
        &mut stdin,
        &mut reader,
        "8",
        "assessments.list",
        json!({ "archived": true }),
    );
    assert_eq!(listed["total"].as_u64(), Some(4));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn scores_are_validated_against_category_maximum_and_duplicates() {
    let workspace = temp_dir("assessd-validation");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    ok_result(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student = ok_result(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "studentNumber": "S1", "firstName": "Ama", "lastName": "Mensah" }),
    );
    let sid = student["id"].as_str().expect("id").to_string();

    let too_high = request(
        &mut stdin,
        &mut reader,
        "3",
        "assessments.create",
        json!({ "studentId": sid, "category": "ica1", "subject": "Maths", "score": 51 }),
    );
    assert_eq!(error_code(&too_high), "bad_params");

    let created = ok_result(
        &mut stdin,
        &mut reader,
        "4",
        "assessments.create",
        json!({ "studentId": sid, "category": "ica1", "subject": "Maths", "score": 50 }),
    );
    assert_eq!(created["maxScore"].as_f64(), Some(50.0));
    assert_eq!(created["term"], json!("term1"));

    let dup = request(
        &mut stdin,
        &mut reader,
        "5",
        "assessments.create",
        json!({ "studentId": sid, "category": "ica1", "subject": "Maths", "score": 20 }),
    );
    assert_eq!(error_code(&dup), "bad_params");

    let dup_student = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.create",
        json!({ "studentNumber": "S1", "firstName": "Other", "lastName": "Person" }),
    );
    assert_eq!(error_code(&dup_student), "bad_params");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn teachers_are_scoped_to_their_own_records() {
    let workspace = temp_dir("assessd-roles");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    ok_result(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = ok_result(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        json!({ "username": "kwame", "role": "teacher", "subject": "Maths" }),
    );
    let tid = teacher["id"].as_str().expect("teacher id").to_string();
    let as_teacher = json!({ "userId": tid });

    let student = ok_result(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "studentNumber": "S1", "firstName": "Ama", "lastName": "Mensah", "actor": as_teacher }),
    );
    let sid = student["id"].as_str().expect("id").to_string();

    let admin_record = ok_result(
        &mut stdin,
        &mut reader,
        "4",
        "assessments.create",
        json!({ "studentId": sid, "category": "ica1", "subject": "Maths", "score": 30 }),
    );
    let own = ok_result(
        &mut stdin,
        &mut reader,
        "5",
        "assessments.create",
        json!({ "studentId": sid, "category": "ica2", "subject": "Maths", "score": 20, "actor": as_teacher }),
    );
    assert_eq!(own["teacherId"], json!(tid));
    assert_eq!(own["assessor"], json!("kwame"));

    let listed = ok_result(
        &mut stdin,
        &mut reader,
        "6",
        "assessments.list",
        json!({ "actor": as_teacher }),
    );
    assert_eq!(listed["total"].as_u64(), Some(1));

    let denied = request(
        &mut stdin,
        &mut reader,
        "7",
        "assessments.update",
        json!({ "id": admin_record["id"], "score": 10, "actor": as_teacher }),
    );
    assert_eq!(error_code(&denied), "forbidden");

    let denied = request(
        &mut stdin,
        &mut reader,
        "8",
        "students.delete",
        json!({ "id": sid, "actor": as_teacher }),
    );
    assert_eq!(error_code(&denied), "forbidden");

    let unknown_actor = request(
        &mut stdin,
        &mut reader,
        "9",
        "assessments.list",
        json!({ "actor": { "userId": "missing" } }),
    );
    assert_eq!(error_code(&unknown_actor), "forbidden");

    let nameless_teacher = request(
        &mut stdin,
        &mut reader,
        "9b",
        "grades.student",
        json!({ "studentId": sid, "actor": { "role": "teacher" } }),
    );
    assert_eq!(error_code(&nameless_teacher), "forbidden");

    ok_result(
        &mut stdin,
        &mut reader,
        "10",
        "students.delete",
        json!({ "id": sid }),
    );
    let gone = request(&mut stdin, &mut reader, "11", "students.get", json!({ "id": sid }));
    assert_eq!(error_code(&gone), "not_found");

    drop(stdin);
    let _ = child.wait();
}
