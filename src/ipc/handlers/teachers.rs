use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_str, required_name, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_teachers_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "teachers": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT t.id, t.name, t.email,
                (SELECT COUNT(*) FROM assignments a WHERE a.teacher_id = t.id) AS assignment_count
         FROM teachers t
         ORDER BY t.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "email": row.get::<_, String>(2)?,
                "assignmentCount": row.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(teachers) => ok(&req.id, json!({ "teachers": teachers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_teachers_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match required_name(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let email = match required_name(req, "email") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let teacher_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO teachers(id, name, email) VALUES(?, ?, ?)",
        (&teacher_id, &name, &email),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "teachers" })),
        );
    }

    ok(&req.id, json!({ "teacherId": teacher_id, "name": name }))
}

fn handle_teachers_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [&teacher_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "teacher not found", None);
    }

    for (param, column) in [("name", "name"), ("email", "email")] {
        let Some(value) = req.params.get(param).and_then(|v| v.as_str()) else {
            continue;
        };
        let sql = format!("UPDATE teachers SET {} = ? WHERE id = ?", column);
        if let Err(e) = conn.execute(&sql, (value, &teacher_id)) {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "teachers" })),
            );
        }
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_teachers_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM assignments WHERE teacher_id = ?",
        [&teacher_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assignments" })),
        );
    }
    let deleted = match tx.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id]) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "teachers" })),
            );
        }
    };
    if deleted == 0 {
        let _ = tx.rollback();
        return err(&req.id, "not_found", "teacher not found", None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_assignments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "assignments": [] }));
    };
    let teacher_id = opt_str(req, "teacherId");
    let class_id = opt_str(req, "classId");

    let sql = "SELECT a.id, a.teacher_id, t.name, a.subject_id, sub.name, a.class_id, c.name
               FROM assignments a
               JOIN teachers t ON t.id = a.teacher_id
               JOIN subjects sub ON sub.id = a.subject_id
               JOIN classes c ON c.id = a.class_id
               WHERE (?1 IS NULL OR a.teacher_id = ?1)
                 AND (?2 IS NULL OR a.class_id = ?2)
               ORDER BY t.name, c.name, sub.name";
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&teacher_id, &class_id), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "teacherId": row.get::<_, String>(1)?,
                "teacherName": row.get::<_, String>(2)?,
                "subjectId": row.get::<_, String>(3)?,
                "subjectName": row.get::<_, String>(4)?,
                "classId": row.get::<_, String>(5)?,
                "className": row.get::<_, String>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(assignments) => ok(&req.id, json!({ "assignments": assignments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Replaces a teacher's assignment set in one transaction. The UI edits the
/// whole set at once, so partial diffs are not worth the bookkeeping.
fn handle_assignments_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(entries) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing entries[]", None);
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [&teacher_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "teacher not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM assignments WHERE teacher_id = ?",
        [&teacher_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assignments" })),
        );
    }
    let mut inserted = 0_usize;
    for (i, entry) in entries.iter().enumerate() {
        let subject_id = entry.get("subjectId").and_then(|v| v.as_str());
        let class_id = entry.get("classId").and_then(|v| v.as_str());
        let (Some(subject_id), Some(class_id)) = (subject_id, class_id) else {
            let _ = tx.rollback();
            return err(
                &req.id,
                "bad_params",
                format!("entry at index {} missing subjectId/classId", i),
                None,
            );
        };
        let assignment_id = Uuid::new_v4().to_string();
        match tx.execute(
            "INSERT OR IGNORE INTO assignments(id, teacher_id, subject_id, class_id)
             VALUES(?, ?, ?, ?)",
            (&assignment_id, &teacher_id, subject_id, class_id),
        ) {
            Ok(n) => inserted += n,
            Err(e) => {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "assignments" })),
                );
            }
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true, "inserted": inserted }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(handle_teachers_list(state, req)),
        "teachers.create" => Some(handle_teachers_create(state, req)),
        "teachers.update" => Some(handle_teachers_update(state, req)),
        "teachers.delete" => Some(handle_teachers_delete(state, req)),
        "assignments.list" => Some(handle_assignments_list(state, req)),
        "assignments.set" => Some(handle_assignments_set(state, req)),
        _ => None,
    }
}
