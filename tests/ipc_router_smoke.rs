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
    let exe = env!("CARGO_BIN_EXE_seid");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn seid");
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

fn result_str(resp: &serde_json::Value, key: &str) -> String {
    resp.get("result")
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing result.{}", key))
        .to_string()
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("seid-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let formation = request(
        &mut stdin,
        &mut reader,
        "3",
        "formations.create",
        json!({ "name": "Ensino Médio" }),
    );
    let formation_id = result_str(&formation, "id");
    let area = request(
        &mut stdin,
        &mut reader,
        "4",
        "areas.create",
        json!({ "formationId": formation_id, "name": "Ciências da Natureza" }),
    );
    let area_id = result_str(&area, "id");
    let sub_area = request(
        &mut stdin,
        &mut reader,
        "5",
        "subareas.create",
        json!({ "areaId": area_id, "name": "Química" }),
    );
    let sub_area_id = result_str(&sub_area, "id");
    let _ = request(&mut stdin, &mut reader, "6", "curriculum.tree", json!({}));

    let subject = request(
        &mut stdin,
        &mut reader,
        "7",
        "subjects.create",
        json!({
            "name": "Química Geral",
            "subAreaId": sub_area_id,
            "periodicity": "Anual",
            "year": "2026"
        }),
    );
    let subject_id = result_str(&subject, "subjectId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "subjects.list",
        json!({ "year": "2026" }),
    );

    let class = request(
        &mut stdin,
        &mut reader,
        "9",
        "classes.create",
        json!({
            "name": "3A",
            "year": "2026",
            "shift": "Manhã",
            "subjectIds": [subject_id]
        }),
    );
    let class_id = result_str(&class, "classId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "10",
        "classes.list",
        json!({ "year": "2026" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "classes.update",
        json!({ "classId": class_id, "shift": "Tarde" }),
    );

    let student = request(
        &mut stdin,
        &mut reader,
        "12",
        "students.create",
        json!({
            "classId": class_id,
            "name": "Ana Souza",
            "registrationNumber": "2026-001"
        }),
    );
    let student_id = result_str(&student, "studentId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "students.list",
        json!({ "classId": class_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "students.update",
        json!({ "studentId": student_id, "status": "Cursando" }),
    );

    let teacher = request(
        &mut stdin,
        &mut reader,
        "15",
        "teachers.create",
        json!({ "name": "Carlos Lima", "email": "carlos@escola.br" }),
    );
    let teacher_id = result_str(&teacher, "teacherId");
    let _ = request(&mut stdin, &mut reader, "16", "teachers.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "assignments.set",
        json!({
            "teacherId": teacher_id,
            "entries": [{ "subjectId": subject_id, "classId": class_id }]
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "18",
        "assignments.list",
        json!({ "teacherId": teacher_id }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "19",
        "settings.update",
        json!({ "schoolName": "Escola Estadual Central" }),
    );
    let _ = request(&mut stdin, &mut reader, "20", "settings.get", json!({}));

    let _ = request(
        &mut stdin,
        &mut reader,
        "21",
        "grades.bulkUpdate",
        json!({
            "subjectId": subject_id,
            "updates": [
                { "studentId": student_id, "term": 1, "value": 7.0 },
                { "studentId": student_id, "term": 2, "value": 8.0 }
            ]
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "22",
        "grades.grid",
        json!({ "classId": class_id, "subjectId": subject_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "23",
        "council.rows",
        json!({ "year": "2026", "classId": class_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "24",
        "council.deliberate",
        json!({
            "classId": class_id,
            "decisions": [{ "studentId": student_id, "promoted": true, "finalResult": "Aprovado" }]
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "25",
        "dashboard.summary",
        json!({ "year": "2026" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "26",
        "analytics.cohort",
        json!({ "year": "2026" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "27",
        "reports.bulletin",
        json!({ "studentId": student_id }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "28",
        "students.delete",
        json!({ "studentId": student_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "29",
        "classes.delete",
        json!({ "classId": class_id }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unknown_method_answers_not_implemented() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let payload = json!({ "id": "x", "method": "does.notExist", "params": {} });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_implemented")
    );

    drop(stdin);
    let _ = child.wait();
}
