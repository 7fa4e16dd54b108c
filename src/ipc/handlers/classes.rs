use crate::calc::{self, RosterState};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_str, required_name, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

fn is_active_status(status: &str) -> bool {
    let s = status.trim();
    s.is_empty() || s == "Cursando"
}

/// Per-class card counts from the points-sum roster rule: every active
/// student lands in exactly one of pending/failing/passing.
fn roster_card(
    conn: &Connection,
    class_id: &str,
) -> Result<(i64, i64, i64), rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT subject_id FROM class_subjects WHERE class_id = ?")?;
    let subject_ids: Vec<String> = stmt
        .query_map([class_id], |r| r.get(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT id, COALESCE(status, 'Cursando') FROM students WHERE class_id = ?",
    )?;
    let students: Vec<(String, String)> = stmt
        .query_map([class_id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    // (student, subject) -> bimester slots; term 5 is irrelevant here.
    let mut cells: HashMap<(String, String), [Option<f64>; 4]> = HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT g.student_id, g.subject_id, g.term, g.value
         FROM grades g
         JOIN students s ON s.id = g.student_id
         WHERE s.class_id = ? AND g.term BETWEEN 1 AND 4",
    )?;
    let rows = stmt.query_map([class_id], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, i64>(2)?,
            r.get::<_, f64>(3)?,
        ))
    })?;
    for row in rows {
        let (student_id, subject_id, term, value) = row?;
        let cell = cells.entry((student_id, subject_id)).or_insert([None; 4]);
        cell[(term - 1) as usize] = Some(value);
    }

    let (mut pending, mut failing, mut passing) = (0_i64, 0_i64, 0_i64);
    for (student_id, status) in &students {
        if !is_active_status(status) {
            continue;
        }
        let states: Vec<RosterState> = subject_ids
            .iter()
            .map(|subject_id| {
                let empty = [None; 4];
                let cell = cells
                    .get(&(student_id.clone(), subject_id.clone()))
                    .unwrap_or(&empty);
                calc::roster_subject_state(cell)
            })
            .collect();
        match calc::roster_student_state(&states) {
            RosterState::Pending => pending += 1,
            RosterState::Failing => failing += 1,
            RosterState::Passing => passing += 1,
        }
    }
    Ok((pending, failing, passing))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };
    let year = opt_str(req, "year");

    // Counts via correlated subqueries to avoid double-counting from joins.
    let sql = "SELECT
                 c.id, c.name, c.year, c.shift, c.enrollment_type,
                 (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
                 (SELECT COUNT(*) FROM class_subjects cs WHERE cs.class_id = c.id) AS subject_count
               FROM classes c
               WHERE (?1 IS NULL OR c.year = ?1)";
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&year], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let mut rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    rows.sort_by(|a, b| calc::natural_cmp(&a.1, &b.1));

    let mut classes = Vec::with_capacity(rows.len());
    for (id, name, year, shift, enrollment_type, student_count, subject_count) in rows {
        let (pending, failing, passing) = match roster_card(conn, &id) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        classes.push(json!({
            "id": id,
            "name": name,
            "year": year,
            "shift": shift,
            "enrollmentType": enrollment_type,
            "studentCount": student_count,
            "subjectCount": subject_count,
            "situation": {
                "pending": pending,
                "failing": failing,
                "passing": passing
            }
        }));
    }

    ok(&req.id, json!({ "classes": classes }))
}

fn replace_class_subjects(
    conn: &Connection,
    class_id: &str,
    subject_ids: &[String],
) -> Result<(), rusqlite::Error> {
    conn.execute("DELETE FROM class_subjects WHERE class_id = ?", [class_id])?;
    for subject_id in subject_ids {
        conn.execute(
            "INSERT OR IGNORE INTO class_subjects(class_id, subject_id) VALUES(?, ?)",
            (class_id, subject_id),
        )?;
    }
    Ok(())
}

fn parse_subject_ids(req: &Request) -> Option<Vec<String>> {
    req.params.get("subjectIds").and_then(|v| v.as_array()).map(|arr| {
        arr.iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.to_string())
            .collect()
    })
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match required_name(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let year = match required_name(req, "year") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let shift = opt_str(req, "shift");
    let enrollment_type = opt_str(req, "enrollmentType");
    let subject_ids = parse_subject_ids(req).unwrap_or_default();

    let class_id = Uuid::new_v4().to_string();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO classes(id, name, year, shift, enrollment_type) VALUES(?, ?, ?, ?, ?)",
        (&class_id, &name, &year, &shift, &enrollment_type),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }
    if let Err(e) = replace_class_subjects(&tx, &class_id, &subject_ids) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "class_subjects" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "classId": class_id, "name": name }))
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (param, column) in [
        ("name", "name"),
        ("year", "year"),
        ("shift", "shift"),
        ("enrollmentType", "enrollment_type"),
    ] {
        let Some(value) = req.params.get(param).and_then(|v| v.as_str()) else {
            continue;
        };
        let sql = format!("UPDATE classes SET {} = ? WHERE id = ?", column);
        if let Err(e) = tx.execute(&sql, (value, &class_id)) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "classes" })),
            );
        }
    }
    if let Some(subject_ids) = parse_subject_ids(req) {
        if let Err(e) = replace_class_subjects(&tx, &class_id, &subject_ids) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "class_subjects" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    if let Err(e) = tx.execute(
        "DELETE FROM grades
         WHERE student_id IN (SELECT id FROM students WHERE class_id = ?)",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM council_deliberations WHERE class_id = ?",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "council_deliberations" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM assignments WHERE class_id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assignments" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM class_subjects WHERE class_id = ?",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "class_subjects" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE class_id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM classes WHERE id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.update" => Some(handle_classes_update(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
