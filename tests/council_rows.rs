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

struct School {
    class_id: String,
    math_id: String,
    portuguese_id: String,
}

fn seed_school(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> School {
    let formation = request(
        stdin,
        reader,
        "s1",
        "formations.create",
        json!({ "name": "Ensino Médio" }),
    );
    let area = request(
        stdin,
        reader,
        "s2",
        "areas.create",
        json!({ "formationId": result_str(&formation, "id"), "name": "Base Comum" }),
    );
    let sub_area = request(
        stdin,
        reader,
        "s3",
        "subareas.create",
        json!({ "areaId": result_str(&area, "id"), "name": "Núcleo" }),
    );
    let sub_area_id = result_str(&sub_area, "id");

    let math = request(
        stdin,
        reader,
        "s4",
        "subjects.create",
        json!({
            "name": "Matemática",
            "subAreaId": sub_area_id,
            "periodicity": "Anual",
            "year": "2026"
        }),
    );
    let portuguese = request(
        stdin,
        reader,
        "s5",
        "subjects.create",
        json!({
            "name": "Língua Portuguesa",
            "subAreaId": sub_area_id,
            "periodicity": "Anual",
            "year": "2026"
        }),
    );
    let math_id = result_str(&math, "subjectId");
    let portuguese_id = result_str(&portuguese, "subjectId");

    let class = request(
        stdin,
        reader,
        "s6",
        "classes.create",
        json!({
            "name": "1A",
            "year": "2026",
            "subjectIds": [math_id, portuguese_id]
        }),
    );
    School {
        class_id: result_str(&class, "classId"),
        math_id,
        portuguese_id,
    }
}

fn add_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    class_id: &str,
    name: &str,
) -> String {
    let resp = request(
        stdin,
        reader,
        id,
        "students.create",
        json!({
            "classId": class_id,
            "name": name,
            "registrationNumber": format!("reg-{}", id)
        }),
    );
    result_str(&resp, "studentId")
}

fn set_terms(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    subject_id: &str,
    student_id: &str,
    values: &[f64],
) {
    let updates: Vec<serde_json::Value> = values
        .iter()
        .enumerate()
        .map(|(i, v)| json!({ "studentId": student_id, "term": i + 1, "value": v }))
        .collect();
    let resp = request(
        stdin,
        reader,
        id,
        "grades.bulkUpdate",
        json!({ "subjectId": subject_id, "updates": updates }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(true));
}

fn row_for<'a>(rows: &'a [serde_json::Value], name: &str) -> &'a serde_json::Value {
    rows.iter()
        .find(|r| r.get("name").and_then(|v| v.as_str()) == Some(name))
        .unwrap_or_else(|| panic!("no council row for {}", name))
}

#[test]
fn council_counts_and_retention_names() {
    let workspace = temp_dir("seid-council");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request(
        &mut stdin,
        &mut reader,
        "0",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let school = seed_school(&mut stdin, &mut reader);
    let joao = add_student(&mut stdin, &mut reader, "a", &school.class_id, "João");
    let lia = add_student(&mut stdin, &mut reader, "b", &school.class_id, "Lia");

    // João: approved in math, pending recovery in Portuguese (mf 2.1 with
    // the recovery defaulted to zero).
    set_terms(
        &mut stdin,
        &mut reader,
        "g1",
        &school.math_id,
        &joao,
        &[8.0, 7.0, 6.0, 5.0],
    );
    set_terms(
        &mut stdin,
        &mut reader,
        "g2",
        &school.portuguese_id,
        &joao,
        &[4.0, 4.0, 3.0, 3.0],
    );
    // Lia: only one Portuguese grade, nothing in math.
    set_terms(
        &mut stdin,
        &mut reader,
        "g3",
        &school.portuguese_id,
        &lia,
        &[9.0],
    );

    let resp = request(
        &mut stdin,
        &mut reader,
        "rows",
        "council.rows",
        json!({ "year": "2026", "classId": school.class_id }),
    );
    let result = resp.get("result").expect("result");

    // Subject columns: both Anual, so plain name order.
    let subjects = result
        .get("subjects")
        .and_then(|v| v.as_array())
        .expect("subjects");
    assert_eq!(
        subjects
            .iter()
            .map(|s| s.get("name").and_then(|v| v.as_str()).unwrap_or(""))
            .collect::<Vec<_>>(),
        vec!["Língua Portuguesa", "Matemática"]
    );

    let rows = result.get("rows").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 2);

    let row = row_for(rows, "João");
    assert_eq!(row.get("highCount").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(row.get("lowCount").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(row.get("overall").and_then(|v| v.as_str()), Some("reproved"));
    assert_eq!(
        row.get("overallLabel").and_then(|v| v.as_str()),
        Some("Reprovado")
    );
    assert_eq!(
        row.get("retained")
            .and_then(|v| v.as_array())
            .map(|a| a
                .iter()
                .map(|v| v.as_str().unwrap_or(""))
                .collect::<Vec<_>>()),
        Some(vec!["Língua Portuguesa"])
    );

    let row = row_for(rows, "Lia");
    assert_eq!(row.get("overall").and_then(|v| v.as_str()), Some("pending"));
    let retained: Vec<&str> = row
        .get("retained")
        .and_then(|v| v.as_array())
        .expect("retained")
        .iter()
        .map(|v| v.as_str().unwrap_or(""))
        .collect();
    // Both subjects are incomplete for Lia, flagged with the pending suffix.
    assert_eq!(retained, vec!["Língua Portuguesa (P)", "Matemática (P)"]);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn deliberations_persist_without_touching_computed_rows() {
    let workspace = temp_dir("seid-council-delib");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request(
        &mut stdin,
        &mut reader,
        "0",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let school = seed_school(&mut stdin, &mut reader);
    let joao = add_student(&mut stdin, &mut reader, "a", &school.class_id, "João");
    set_terms(
        &mut stdin,
        &mut reader,
        "g1",
        &school.math_id,
        &joao,
        &[2.0, 2.0, 2.0, 2.0],
    );
    set_terms(
        &mut stdin,
        &mut reader,
        "g2",
        &school.portuguese_id,
        &joao,
        &[2.0, 2.0, 2.0, 2.0],
    );

    let resp = request(
        &mut stdin,
        &mut reader,
        "d1",
        "council.deliberate",
        json!({
            "classId": school.class_id,
            "decisions": [{
                "studentId": joao,
                "promoted": true,
                "finalResult": "Aprovado pelo conselho"
            }]
        }),
    );
    assert_eq!(
        resp.get("result")
            .and_then(|v| v.get("saved"))
            .and_then(|v| v.as_u64()),
        Some(1)
    );

    let resp = request(
        &mut stdin,
        &mut reader,
        "rows",
        "council.rows",
        json!({ "year": "2026", "classId": school.class_id }),
    );
    let rows = resp
        .get("result")
        .and_then(|v| v.get("rows"))
        .and_then(|v| v.as_array())
        .expect("rows");
    let row = row_for(rows, "João");

    // The computed verdict still says reproved; the override rides alongside.
    assert_eq!(row.get("overall").and_then(|v| v.as_str()), Some("reproved"));
    let deliberation = row.get("deliberation").expect("deliberation");
    assert_eq!(
        deliberation.get("promoted").and_then(|v| v.as_bool()),
        Some(true)
    );
    assert_eq!(
        deliberation.get("finalResult").and_then(|v| v.as_str()),
        Some("Aprovado pelo conselho")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
