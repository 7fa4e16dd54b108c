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
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
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
fn bulletin_model_carries_labels_and_ordered_subjects() {
    let workspace = temp_dir("seid-bulletin");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request(
        &mut stdin,
        &mut reader,
        "0",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "1",
        "settings.update",
        json!({ "schoolName": "Escola Estadual Central" }),
    );

    let formation = request(
        &mut stdin,
        &mut reader,
        "s1",
        "formations.create",
        json!({ "name": "Ensino Médio" }),
    );
    let area = request(
        &mut stdin,
        &mut reader,
        "s2",
        "areas.create",
        json!({ "formationId": result_str(&formation, "id"), "name": "Geral" }),
    );
    let sub_area = request(
        &mut stdin,
        &mut reader,
        "s3",
        "subareas.create",
        json!({ "areaId": result_str(&area, "id"), "name": "Núcleo" }),
    );
    let sub_area_id = result_str(&sub_area, "id");

    // A Semestral subject must sort after the Anual one regardless of name.
    let annual = request(
        &mut stdin,
        &mut reader,
        "s4",
        "subjects.create",
        json!({
            "name": "Zoologia",
            "subAreaId": sub_area_id,
            "periodicity": "Anual",
            "year": "2026"
        }),
    );
    let semestral = request(
        &mut stdin,
        &mut reader,
        "s5",
        "subjects.create",
        json!({
            "name": "Artes",
            "subAreaId": sub_area_id,
            "periodicity": "Semestral",
            "semester": "1",
            "year": "2026"
        }),
    );
    let annual_id = result_str(&annual, "subjectId");
    let semestral_id = result_str(&semestral, "subjectId");

    let class = request(
        &mut stdin,
        &mut reader,
        "s6",
        "classes.create",
        json!({
            "name": "2A",
            "year": "2026",
            "subjectIds": [annual_id, semestral_id]
        }),
    );
    let class_id = result_str(&class, "classId");
    let student = request(
        &mut stdin,
        &mut reader,
        "s7",
        "students.create",
        json!({
            "classId": class_id,
            "name": "Ana Souza",
            "registrationNumber": "2026-010"
        }),
    );
    let student_id = result_str(&student, "studentId");

    let resp = request(
        &mut stdin,
        &mut reader,
        "g1",
        "grades.bulkUpdate",
        json!({
            "subjectId": annual_id,
            "updates": [
                { "studentId": student_id, "term": 1, "value": 7.0 },
                { "studentId": student_id, "term": 2, "value": 7.0 },
                { "studentId": student_id, "term": 3, "value": 7.0 },
                { "studentId": student_id, "term": 4, "value": 7.0 }
            ]
        }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(true));

    let resp = request(
        &mut stdin,
        &mut reader,
        "b1",
        "reports.bulletin",
        json!({ "studentId": student_id }),
    );
    let result = resp.get("result").expect("result");

    assert_eq!(
        result.get("schoolName").and_then(|v| v.as_str()),
        Some("Escola Estadual Central")
    );
    assert_eq!(
        result
            .get("student")
            .and_then(|v| v.get("name"))
            .and_then(|v| v.as_str()),
        Some("Ana Souza")
    );
    assert_eq!(
        result
            .get("class")
            .and_then(|v| v.get("name"))
            .and_then(|v| v.as_str()),
        Some("2A")
    );
    assert!(result
        .get("generatedAt")
        .and_then(|v| v.as_str())
        .is_some());

    let subjects = result
        .get("subjects")
        .and_then(|v| v.as_array())
        .expect("subjects");
    assert_eq!(
        subjects
            .iter()
            .map(|s| s.get("subjectName").and_then(|v| v.as_str()).unwrap_or(""))
            .collect::<Vec<_>>(),
        vec!["Zoologia", "Artes"]
    );

    let zoologia = &subjects[0];
    assert_eq!(zoologia.get("mg").and_then(|v| v.as_f64()), Some(7.0));
    assert_eq!(zoologia.get("mf").and_then(|v| v.as_f64()), Some(7.0));
    assert_eq!(
        zoologia.get("situationLabel").and_then(|v| v.as_str()),
        Some("Aprovado")
    );
    assert_eq!(
        zoologia.get("performanceLabel").and_then(|v| v.as_str()),
        Some("Bom")
    );

    // No grades entered for the Semestral subject yet.
    let artes = &subjects[1];
    assert_eq!(
        artes.get("situationLabel").and_then(|v| v.as_str()),
        Some("Em Curso")
    );
    assert_eq!(
        artes.get("performanceLabel").and_then(|v| v.as_str()),
        Some("-")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
