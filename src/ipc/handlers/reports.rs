use crate::calc::{self, TermScores};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, now_iso, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use std::collections::HashMap;

/// Bulletin model for the report renderer. The daemon only assembles the
/// data; layout and PDF generation live elsewhere.
fn handle_reports_bulletin(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let student = match conn
        .query_row(
            "SELECT s.name, s.registration_number, s.class_id, c.name, c.year
             FROM students s
             JOIN classes c ON c.id = s.class_id
             WHERE s.id = ?",
            [&student_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                ))
            },
        )
        .optional()
    {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (student_name, registration_number, class_id, class_name, year) = student;

    let school_name = match crate::db::settings_get(conn, "school_name") {
        Ok(v) => v.unwrap_or_default(),
        Err(e) => return err(&req.id, "db_query_failed", format!("{e:?}"), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT s.id, s.name
         FROM class_subjects cs
         JOIN subjects s ON s.id = cs.subject_id
         WHERE cs.class_id = ?
         ORDER BY CASE s.periodicity WHEN 'Anual' THEN 0 ELSE 1 END, s.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let subjects: Vec<(String, String)> = match stmt
        .query_map([&class_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT subject_id, term, value FROM grades
         WHERE student_id = ? AND term BETWEEN 1 AND 5",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let grade_rows: Vec<(String, i64, f64)> = match stmt
        .query_map([&student_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut scores_by_subject: HashMap<String, TermScores> = HashMap::new();
    for (subject_id, term, value) in grade_rows {
        let scores = scores_by_subject.entry(subject_id).or_default();
        if term == 5 {
            scores.recovery = Some(value);
        } else {
            scores.bimesters[(term - 1) as usize] = Some(value);
        }
    }

    let rows: Vec<serde_json::Value> = subjects
        .iter()
        .map(|(subject_id, subject_name)| {
            let scores = scores_by_subject
                .get(subject_id)
                .copied()
                .unwrap_or_default();
            let outcome = calc::evaluate_subject(&scores);
            json!({
                "subjectId": subject_id,
                "subjectName": subject_name,
                "terms": scores.bimesters,
                "recovery": scores.recovery,
                "mg": calc::round_off_1_decimal(outcome.mg),
                "mf": outcome.mf,
                "situationLabel": outcome.situation.label(),
                "performanceLabel": outcome.performance.label(),
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "schoolName": school_name,
            "student": {
                "id": student_id,
                "name": student_name,
                "registrationNumber": registration_number
            },
            "class": {
                "id": class_id,
                "name": class_name,
                "year": year
            },
            "subjects": rows,
            "generatedAt": now_iso()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.bulletin" => Some(handle_reports_bulletin(state, req)),
        _ => None,
    }
}
