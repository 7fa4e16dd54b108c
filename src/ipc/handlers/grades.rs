use crate::calc::{self, TermScores};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, now_iso, opt_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

const BULK_UPDATE_MAX_EDITS: usize = 5000;
const BATCH_IMPORT_MAX_ROWS: usize = 2000;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn upsert_grade(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    term: i64,
    value: f64,
) -> Result<(), HandlerErr> {
    let grade_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grades(id, student_id, subject_id, term, value, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, subject_id, term) DO UPDATE SET
           value = excluded.value,
           updated_at = excluded.updated_at",
        (&grade_id, student_id, subject_id, term, value, now_iso()),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "grades" })),
    })?;
    Ok(())
}

fn delete_grade(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    term: i64,
) -> Result<(), HandlerErr> {
    conn.execute(
        "DELETE FROM grades WHERE student_id = ? AND subject_id = ? AND term = ?",
        (student_id, subject_id, term),
    )
    .map_err(|e| HandlerErr {
        code: "db_delete_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "grades" })),
    })?;
    Ok(())
}

fn load_term_scores(
    conn: &Connection,
    class_id: &str,
    subject_id: &str,
) -> Result<HashMap<String, TermScores>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT g.student_id, g.term, g.value
             FROM grades g
             JOIN students s ON s.id = g.student_id
             WHERE s.class_id = ? AND g.subject_id = ? AND g.term BETWEEN 1 AND 5",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map((class_id, subject_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, f64>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let mut out: HashMap<String, TermScores> = HashMap::new();
    for (student_id, term, value) in rows {
        let scores = out.entry(student_id).or_default();
        if term == 5 {
            scores.recovery = Some(value);
        } else {
            scores.bimesters[(term - 1) as usize] = Some(value);
        }
    }
    Ok(out)
}

fn handle_grades_grid(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let status = opt_str(req, "status");

    let mut stmt = match conn.prepare(
        "SELECT id, name, COALESCE(status, 'Cursando')
         FROM students
         WHERE class_id = ?1
           AND (?2 IS NULL OR COALESCE(NULLIF(TRIM(status), ''), 'Cursando') = ?2)
         ORDER BY name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students = match stmt
        .query_map((&class_id, &status), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let scores_by_student = match load_term_scores(conn, &class_id, &subject_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let rows: Vec<serde_json::Value> = students
        .iter()
        .map(|(student_id, name)| {
            let scores = scores_by_student
                .get(student_id)
                .copied()
                .unwrap_or_default();
            let outcome = calc::evaluate_subject(&scores);
            json!({
                "studentId": student_id,
                "name": name,
                "terms": scores.bimesters,
                "recovery": scores.recovery,
                "points": calc::round_off_1_decimal(outcome.points),
                "mg": calc::round_off_1_decimal(outcome.mg),
                "precisa": calc::recovery_needed(outcome.points).label(),
                "mf": outcome.mf,
                "situation": outcome.situation,
                "situationLabel": outcome.situation.label(),
                "performance": outcome.performance,
                "performanceLabel": outcome.performance.label(),
                "isRecovered": outcome.is_recovered,
            })
        })
        .collect();

    ok(&req.id, json!({ "students": rows }))
}

fn handle_grades_bulk_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(updates) = req.params.get("updates").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing updates[]", None);
    };

    if updates.len() > BULK_UPDATE_MAX_EDITS {
        let rejected = updates.len();
        return ok(
            &req.id,
            json!({
                "ok": true,
                "updated": 0,
                "rejected": rejected,
                "limitExceeded": true,
                "errors": [{
                    "index": -1,
                    "code": "too_many_edits",
                    "message": format!(
                        "bulk payload exceeds max edits: {} > {}",
                        rejected, BULK_UPDATE_MAX_EDITS
                    )
                }]
            }),
        );
    }

    let mut updated: usize = 0;
    let mut errors: Vec<serde_json::Value> = Vec::new();

    for (i, update) in updates.iter().enumerate() {
        let Some(obj) = update.as_object() else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": format!("update at index {} must be an object", i),
            }));
            continue;
        };
        let Some(student_id) = obj.get("studentId").and_then(|v| v.as_str()) else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": format!("update at index {} missing studentId", i),
            }));
            continue;
        };
        let term = match obj.get("term").and_then(|v| v.as_i64()) {
            Some(t) if (1..=5).contains(&t) => t,
            _ => {
                errors.push(json!({
                    "index": i,
                    "code": "bad_params",
                    "message": format!("update at index {} has term outside 1..5", i),
                }));
                continue;
            }
        };

        let value = obj.get("value");
        let result = match value {
            None | Some(serde_json::Value::Null) => {
                delete_grade(conn, student_id, &subject_id, term)
            }
            Some(v) => match v.as_f64() {
                // Input-layer clamp; the engine assumes [0,10].
                Some(raw) => {
                    let clamped = raw.clamp(0.0, 10.0);
                    upsert_grade(conn, student_id, &subject_id, term, clamped)
                }
                None => {
                    errors.push(json!({
                        "index": i,
                        "code": "bad_params",
                        "message": format!("update at index {} has non-numeric value", i),
                    }));
                    continue;
                }
            },
        };
        match result {
            Ok(()) => updated += 1,
            Err(e) => errors.push(json!({
                "index": i,
                "code": e.code,
                "message": e.message,
            })),
        }
    }

    let rejected = errors.len();
    let mut result = json!({ "ok": true, "updated": updated });
    if rejected > 0 {
        let obj = result.as_object_mut().expect("result should be object");
        obj.insert("rejected".into(), json!(rejected));
        obj.insert("errors".into(), json!(errors));
    }

    ok(&req.id, result)
}

/// Roster-join key: trim, collapse inner whitespace, uppercase.
fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

fn handle_grades_batch_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(target_terms_raw) = req.params.get("targetTerms").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing targetTerms[]", None);
    };
    let Some(rows) = req.params.get("rows").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing rows[]", None);
    };
    if rows.len() > BATCH_IMPORT_MAX_ROWS {
        return err(
            &req.id,
            "bad_params",
            format!(
                "import exceeds max rows: {} > {}",
                rows.len(),
                BATCH_IMPORT_MAX_ROWS
            ),
            None,
        );
    }

    let mut target_terms: Vec<i64> = Vec::with_capacity(target_terms_raw.len());
    for t in target_terms_raw {
        match t.as_i64() {
            Some(t) if (1..=4).contains(&t) => target_terms.push(t),
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    "targetTerms must contain terms 1..4",
                    None,
                )
            }
        }
    }
    if target_terms.is_empty() {
        return err(&req.id, "bad_params", "targetTerms must not be empty", None);
    }

    let mut stmt = match conn.prepare("SELECT id, name FROM students WHERE class_id = ?") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let roster = match stmt
        .query_map([&class_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut by_normalized: HashMap<String, Vec<&str>> = HashMap::new();
    for (id, name) in &roster {
        by_normalized
            .entry(normalize_name(name))
            .or_default()
            .push(id.as_str());
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut matched = 0_usize;
    let mut applied = 0_usize;
    let mut unmatched: Vec<String> = Vec::new();
    let mut ambiguous: Vec<String> = Vec::new();

    for row in rows {
        let Some(name) = row.get("name").and_then(|v| v.as_str()) else {
            continue;
        };
        let values = row
            .get("values")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let key = normalize_name(name);
        match by_normalized.get(key.as_str()).map(|ids| ids.as_slice()) {
            None | Some([]) => {
                unmatched.push(name.to_string());
                continue;
            }
            // Roster collisions are reported, never resolved to the first hit.
            Some([_, _, ..]) => {
                ambiguous.push(name.to_string());
                continue;
            }
            Some([student_id]) => {
                matched += 1;
                for (idx, term) in target_terms.iter().enumerate() {
                    let Some(value) = values.get(idx).and_then(|v| v.as_f64()) else {
                        continue;
                    };
                    let clamped = value.clamp(0.0, 10.0);
                    if let Err(e) = upsert_grade(&tx, student_id, &subject_id, *term, clamped) {
                        let _ = tx.rollback();
                        return e.response(&req.id);
                    }
                    applied += 1;
                }
            }
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "matched": matched,
            "applied": applied,
            "unmatched": unmatched,
            "ambiguous": ambiguous
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.grid" => Some(handle_grades_grid(state, req)),
        "grades.bulkUpdate" => Some(handle_grades_bulk_update(state, req)),
        "grades.batchImport" => Some(handle_grades_batch_import(state, req)),
        _ => None,
    }
}
