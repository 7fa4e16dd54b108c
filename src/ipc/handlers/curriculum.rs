use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_name, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_curriculum_tree(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "formations": [] }));
    };

    let mut stmt = match conn.prepare("SELECT id, name FROM formation_types ORDER BY name") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let formations = match stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut tree = Vec::with_capacity(formations.len());
    for (formation_id, formation_name) in formations {
        let mut stmt = match conn.prepare(
            "SELECT id, name FROM knowledge_areas WHERE formation_type_id = ? ORDER BY name",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let areas = match stmt
            .query_map([&formation_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

        let mut area_nodes = Vec::with_capacity(areas.len());
        for (area_id, area_name) in areas {
            let mut stmt = match conn.prepare(
                "SELECT id, name FROM sub_areas WHERE knowledge_area_id = ? ORDER BY name",
            ) {
                Ok(s) => s,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            let sub_areas = match stmt
                .query_map([&area_id], |r| {
                    Ok(json!({
                        "id": r.get::<_, String>(0)?,
                        "name": r.get::<_, String>(1)?,
                    }))
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            area_nodes.push(json!({
                "id": area_id,
                "name": area_name,
                "subAreas": sub_areas
            }));
        }

        tree.push(json!({
            "id": formation_id,
            "name": formation_name,
            "areas": area_nodes
        }));
    }

    ok(&req.id, json!({ "formations": tree }))
}

fn insert_named(
    conn: &Connection,
    req: &Request,
    sql: &str,
    table: &str,
    extra: Option<&str>,
) -> serde_json::Value {
    let name = match required_name(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let id = Uuid::new_v4().to_string();
    let result = match extra {
        Some(parent_id) => conn.execute(sql, (&id, &name, parent_id)),
        None => conn.execute(sql, (&id, &name)),
    };
    if let Err(e) = result {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": table })),
        );
    }
    ok(&req.id, json!({ "id": id, "name": name }))
}

fn count_dependents(
    conn: &Connection,
    sql: &str,
    id: &str,
) -> Result<i64, rusqlite::Error> {
    conn.query_row(sql, [id], |r| r.get(0))
}

fn handle_formations_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    insert_named(
        conn,
        req,
        "INSERT INTO formation_types(id, name) VALUES(?, ?)",
        "formation_types",
        None,
    )
}

fn handle_formations_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let id = match required_str(req, "formationId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    // Children block deletion; the caller must empty the branch first.
    match count_dependents(
        conn,
        "SELECT COUNT(*) FROM knowledge_areas WHERE formation_type_id = ?",
        &id,
    ) {
        Ok(0) => {}
        Ok(n) => {
            return err(
                &req.id,
                "bad_params",
                "formation type still has knowledge areas",
                Some(json!({ "areaCount": n })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    match conn.execute("DELETE FROM formation_types WHERE id = ?", [&id]) {
        Ok(0) => err(&req.id, "not_found", "formation type not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "formation_types" })),
        ),
    }
}

fn handle_areas_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let formation_id = match required_str(req, "formationId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let parent: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM formation_types WHERE id = ?",
            [&formation_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if parent.is_none() {
        return err(&req.id, "not_found", "formation type not found", None);
    }
    insert_named(
        conn,
        req,
        "INSERT INTO knowledge_areas(id, name, formation_type_id) VALUES(?, ?, ?)",
        "knowledge_areas",
        Some(&formation_id),
    )
}

fn handle_areas_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let id = match required_str(req, "areaId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match count_dependents(
        conn,
        "SELECT COUNT(*) FROM sub_areas WHERE knowledge_area_id = ?",
        &id,
    ) {
        Ok(0) => {}
        Ok(n) => {
            return err(
                &req.id,
                "bad_params",
                "knowledge area still has sub-areas",
                Some(json!({ "subAreaCount": n })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    match conn.execute("DELETE FROM knowledge_areas WHERE id = ?", [&id]) {
        Ok(0) => err(&req.id, "not_found", "knowledge area not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "knowledge_areas" })),
        ),
    }
}

fn handle_subareas_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let area_id = match required_str(req, "areaId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let parent: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM knowledge_areas WHERE id = ?",
            [&area_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if parent.is_none() {
        return err(&req.id, "not_found", "knowledge area not found", None);
    }
    insert_named(
        conn,
        req,
        "INSERT INTO sub_areas(id, name, knowledge_area_id) VALUES(?, ?, ?)",
        "sub_areas",
        Some(&area_id),
    )
}

fn handle_subareas_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let id = match required_str(req, "subAreaId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match count_dependents(
        conn,
        "SELECT COUNT(*) FROM subjects WHERE sub_area_id = ?",
        &id,
    ) {
        Ok(0) => {}
        Ok(n) => {
            return err(
                &req.id,
                "bad_params",
                "sub-area still has subjects",
                Some(json!({ "subjectCount": n })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    match conn.execute("DELETE FROM sub_areas WHERE id = ?", [&id]) {
        Ok(0) => err(&req.id, "not_found", "sub-area not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "sub_areas" })),
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "curriculum.tree" => Some(handle_curriculum_tree(state, req)),
        "formations.create" => Some(handle_formations_create(state, req)),
        "formations.delete" => Some(handle_formations_delete(state, req)),
        "areas.create" => Some(handle_areas_create(state, req)),
        "areas.delete" => Some(handle_areas_delete(state, req)),
        "subareas.create" => Some(handle_subareas_create(state, req)),
        "subareas.delete" => Some(handle_subareas_delete(state, req)),
        _ => None,
    }
}
