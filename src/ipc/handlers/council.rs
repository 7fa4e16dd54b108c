use crate::calc::{self, SubjectOutcome, TermScores};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, now_iso, opt_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;

struct CouncilSubject {
    id: String,
    name: String,
}

/// Class subject columns, optionally narrowed to one formation branch.
/// Anual subjects sort before Semestral, then by name.
fn load_council_subjects(
    conn: &Connection,
    class_id: &str,
    formation_id: Option<&str>,
) -> Result<Vec<CouncilSubject>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.name
         FROM class_subjects cs
         JOIN subjects s ON s.id = cs.subject_id
         JOIN sub_areas sa ON sa.id = s.sub_area_id
         JOIN knowledge_areas ka ON ka.id = sa.knowledge_area_id
         WHERE cs.class_id = ?1
           AND (?2 IS NULL OR ka.formation_type_id = ?2)
         ORDER BY CASE s.periodicity WHEN 'Anual' THEN 0 ELSE 1 END, s.name",
    )?;
    stmt.query_map((class_id, formation_id), |r| {
        Ok(CouncilSubject {
            id: r.get(0)?,
            name: r.get(1)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
}

fn load_class_grades(
    conn: &Connection,
    class_id: &str,
) -> Result<HashMap<(String, String), TermScores>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT g.student_id, g.subject_id, g.term, g.value
         FROM grades g
         JOIN students s ON s.id = g.student_id
         WHERE s.class_id = ? AND g.term BETWEEN 1 AND 5",
    )?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, f64>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out: HashMap<(String, String), TermScores> = HashMap::new();
    for (student_id, subject_id, term, value) in rows {
        let scores = out.entry((student_id, subject_id)).or_default();
        if term == 5 {
            scores.recovery = Some(value);
        } else {
            scores.bimesters[(term - 1) as usize] = Some(value);
        }
    }
    Ok(out)
}

fn handle_council_rows(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let status = opt_str(req, "status");
    let formation_id = opt_str(req, "formationId");
    let min_high = req.params.get("minHigh").and_then(|v| v.as_i64());
    let min_low = req.params.get("minLow").and_then(|v| v.as_i64());

    let subjects = match load_council_subjects(conn, &class_id, formation_id.as_deref()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name
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

    let grades = match load_class_grades(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT student_id, promoted, final_result
         FROM council_deliberations
         WHERE class_id = ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let deliberations: HashMap<String, (bool, Option<String>)> = match stmt
        .query_map([&class_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                (r.get::<_, i64>(1)? != 0, r.get::<_, Option<String>>(2)?),
            ))
        })
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut rows: Vec<serde_json::Value> = Vec::with_capacity(students.len());
    for (student_id, student_name) in &students {
        let outcomes: Vec<(String, SubjectOutcome)> = subjects
            .iter()
            .map(|subject| {
                let scores = grades
                    .get(&(student_id.clone(), subject.id.clone()))
                    .copied()
                    .unwrap_or_default();
                (subject.name.clone(), calc::evaluate_subject(&scores))
            })
            .collect();

        let standing =
            calc::student_standing(outcomes.iter().map(|(name, o)| (name.as_str(), o)));
        if let Some(min) = min_high {
            if standing.high_count < min {
                continue;
            }
        }
        if let Some(min) = min_low {
            if standing.low_count < min {
                continue;
            }
        }

        let cells: Vec<serde_json::Value> = subjects
            .iter()
            .zip(outcomes.iter())
            .map(|(subject, (_, outcome))| {
                json!({
                    "subjectId": subject.id,
                    "mf": outcome.mf,
                    "situation": outcome.situation,
                    "situationLabel": outcome.situation.label(),
                    "isRecovered": outcome.is_recovered,
                    "complete": outcome.complete,
                })
            })
            .collect();

        let deliberation = deliberations.get(student_id).map(|(promoted, final_result)| {
            json!({ "promoted": promoted, "finalResult": final_result })
        });

        rows.push(json!({
            "studentId": student_id,
            "name": student_name,
            "cells": cells,
            "highCount": standing.high_count,
            "lowCount": standing.low_count,
            "overall": standing.overall,
            "overallLabel": standing.overall.label(),
            "retained": standing.retained,
            "deliberation": deliberation,
        }));
    }

    let subject_cols: Vec<serde_json::Value> = subjects
        .iter()
        .map(|s| json!({ "id": s.id, "name": s.name }))
        .collect();

    ok(&req.id, json!({ "subjects": subject_cols, "rows": rows }))
}

/// Persists the manual council decision; the computed row is never mutated.
fn handle_council_deliberate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(decisions) = req.params.get("decisions").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing decisions[]", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let mut saved = 0_usize;
    for (i, decision) in decisions.iter().enumerate() {
        let Some(student_id) = decision.get("studentId").and_then(|v| v.as_str()) else {
            let _ = tx.rollback();
            return err(
                &req.id,
                "bad_params",
                format!("decision at index {} missing studentId", i),
                None,
            );
        };
        let Some(promoted) = decision.get("promoted").and_then(|v| v.as_bool()) else {
            let _ = tx.rollback();
            return err(
                &req.id,
                "bad_params",
                format!("decision at index {} missing promoted", i),
                None,
            );
        };
        let final_result = decision.get("finalResult").and_then(|v| v.as_str());

        if let Err(e) = tx.execute(
            "INSERT INTO council_deliberations(class_id, student_id, promoted, final_result, updated_at)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(class_id, student_id) DO UPDATE SET
               promoted = excluded.promoted,
               final_result = excluded.final_result,
               updated_at = excluded.updated_at",
            (&class_id, student_id, promoted as i64, final_result, now_iso()),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "council_deliberations" })),
            );
        }
        saved += 1;
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true, "saved": saved }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "council.rows" => Some(handle_council_rows(state, req)),
        "council.deliberate" => Some(handle_council_deliberate(state, req)),
        _ => None,
    }
}
