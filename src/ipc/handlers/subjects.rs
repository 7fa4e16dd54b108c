use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_str, required_name, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "subjects": [] }));
    };
    let year = opt_str(req, "year");
    let sub_area_id = opt_str(req, "subAreaId");

    let sql = "SELECT s.id, s.name, s.sub_area_id, sa.name, s.periodicity, s.semester,
                      s.year, s.code
               FROM subjects s
               JOIN sub_areas sa ON sa.id = s.sub_area_id
               WHERE (?1 IS NULL OR s.year = ?1)
                 AND (?2 IS NULL OR s.sub_area_id = ?2)
               ORDER BY s.name";
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&year, &sub_area_id), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "subAreaId": row.get::<_, String>(2)?,
                "subAreaName": row.get::<_, String>(3)?,
                "periodicity": row.get::<_, String>(4)?,
                "semester": row.get::<_, Option<String>>(5)?,
                "year": row.get::<_, String>(6)?,
                "code": row.get::<_, Option<String>>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match required_name(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let sub_area_id = match required_str(req, "subAreaId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let year = match required_name(req, "year") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let periodicity = opt_str(req, "periodicity").unwrap_or_else(|| "Anual".to_string());
    if periodicity != "Anual" && periodicity != "Semestral" {
        return err(
            &req.id,
            "bad_params",
            "periodicity must be Anual or Semestral",
            Some(json!({ "periodicity": periodicity })),
        );
    }
    let semester = opt_str(req, "semester");
    if periodicity == "Semestral" && semester.is_none() {
        return err(
            &req.id,
            "bad_params",
            "semester is required for Semestral subjects",
            None,
        );
    }
    let code = opt_str(req, "code");

    let parent: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM sub_areas WHERE id = ?",
            [&sub_area_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if parent.is_none() {
        return err(&req.id, "not_found", "sub-area not found", None);
    }

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, name, sub_area_id, periodicity, semester, year, code)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &subject_id,
            &name,
            &sub_area_id,
            &periodicity,
            &semester,
            &year,
            &code,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(&req.id, json!({ "subjectId": subject_id, "name": name }))
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    if let Some(p) = req.params.get("periodicity").and_then(|v| v.as_str()) {
        if p != "Anual" && p != "Semestral" {
            return err(
                &req.id,
                "bad_params",
                "periodicity must be Anual or Semestral",
                Some(json!({ "periodicity": p })),
            );
        }
    }

    for (param, column) in [
        ("name", "name"),
        ("subAreaId", "sub_area_id"),
        ("periodicity", "periodicity"),
        ("semester", "semester"),
        ("year", "year"),
        ("code", "code"),
    ] {
        let Some(value) = req.params.get(param).and_then(|v| v.as_str()) else {
            continue;
        };
        let sql = format!("UPDATE subjects SET {} = ? WHERE id = ?", column);
        if let Err(e) = conn.execute(&sql, (value, &subject_id)) {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "subjects" })),
            );
        }
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM grades WHERE subject_id = ?", [&subject_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM assignments WHERE subject_id = ?",
        [&subject_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assignments" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM class_subjects WHERE subject_id = ?",
        [&subject_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "class_subjects" })),
        );
    }
    let deleted = match tx.execute("DELETE FROM subjects WHERE id = ?", [&subject_id]) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "subjects" })),
            );
        }
    };
    if deleted == 0 {
        let _ = tx.rollback();
        return err(&req.id, "not_found", "subject not found", None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        _ => None,
    }
}
