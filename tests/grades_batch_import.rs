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

fn str_vec(result: &serde_json::Value, key: &str) -> Vec<String> {
    result
        .get(key)
        .and_then(|v| v.as_array())
        .unwrap_or_else(|| panic!("missing {}", key))
        .iter()
        .map(|v| v.as_str().unwrap_or("").to_string())
        .collect()
}

#[test]
fn batch_import_joins_by_normalized_name_and_reports_collisions() {
    let workspace = temp_dir("seid-batch-import");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request(
        &mut stdin,
        &mut reader,
        "0",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
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
    let subject = request(
        &mut stdin,
        &mut reader,
        "s4",
        "subjects.create",
        json!({
            "name": "Geografia",
            "subAreaId": result_str(&sub_area, "id"),
            "periodicity": "Anual",
            "year": "2026"
        }),
    );
    let subject_id = result_str(&subject, "subjectId");
    let class = request(
        &mut stdin,
        &mut reader,
        "s5",
        "classes.create",
        json!({ "name": "3B", "year": "2026", "subjectIds": [subject_id] }),
    );
    let class_id = result_str(&class, "classId");

    // Two roster entries normalize to the same key ("MARIA SILVA").
    for (i, name) in [("a", "Maria Silva"), ("b", "maria  silva"), ("c", "José Santos")] {
        let _ = request(
            &mut stdin,
            &mut reader,
            i,
            "students.create",
            json!({
                "classId": class_id,
                "name": name,
                "registrationNumber": format!("reg-{}", i)
            }),
        );
    }

    let resp = request(
        &mut stdin,
        &mut reader,
        "imp",
        "grades.batchImport",
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "targetTerms": [1, 2],
            "rows": [
                { "name": "MARIA   SILVA", "values": [7.0, 8.0] },
                { "name": "josé santos", "values": [6.0, null] },
                { "name": "Pedro Alves", "values": [5.0, 5.0] }
            ]
        }),
    );
    let result = resp.get("result").expect("result");

    assert_eq!(result.get("matched").and_then(|v| v.as_u64()), Some(1));
    // José got a term-1 value only; the null slot is skipped, not deleted.
    assert_eq!(result.get("applied").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(str_vec(result, "ambiguous"), vec!["MARIA   SILVA"]);
    assert_eq!(str_vec(result, "unmatched"), vec!["Pedro Alves"]);

    let grid = request(
        &mut stdin,
        &mut reader,
        "grid",
        "grades.grid",
        json!({ "classId": class_id, "subjectId": subject_id }),
    );
    let rows = grid
        .get("result")
        .and_then(|v| v.get("students"))
        .and_then(|v| v.as_array())
        .expect("students");
    let jose = rows
        .iter()
        .find(|r| r.get("name").and_then(|v| v.as_str()) == Some("José Santos"))
        .expect("José row");
    let terms = jose.get("terms").and_then(|v| v.as_array()).expect("terms");
    assert_eq!(terms[0].as_f64(), Some(6.0));
    assert_eq!(terms[1], serde_json::Value::Null);

    // Neither Maria got any grade written.
    for row in rows {
        let name = row.get("name").and_then(|v| v.as_str()).unwrap_or("");
        if name != "José Santos" {
            let terms = row.get("terms").and_then(|v| v.as_array()).expect("terms");
            assert!(terms.iter().all(|t| t.is_null()), "unexpected grade for {}", name);
        }
    }

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
