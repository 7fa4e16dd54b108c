use crate::calc::{self, RosterState};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::collections::HashMap;

fn normalized_status(status: &str) -> &str {
    let s = status.trim();
    if s.is_empty() {
        "Cursando"
    } else {
        s
    }
}

fn handle_dashboard_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let year = match required_str(req, "year") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut stmt = match conn.prepare("SELECT id FROM classes WHERE year = ?") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let class_ids: Vec<String> = match stmt
        .query_map([&year], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let subject_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM subjects WHERE year = ?",
        [&year],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT s.id, s.class_id, COALESCE(s.status, 'Cursando')
         FROM students s
         JOIN classes c ON c.id = s.class_id
         WHERE c.year = ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students: Vec<(String, String, String)> = match stmt
        .query_map([&year], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let (mut cursando, mut transferidos, mut evadidos, mut outros) = (0_i64, 0_i64, 0_i64, 0_i64);
    for (_, _, status) in &students {
        match normalized_status(status) {
            "Cursando" => cursando += 1,
            "Transferência" => transferidos += 1,
            "Evasão" => evadidos += 1,
            _ => outros += 1,
        }
    }

    // Subject membership and bimester grades for the quick-card.
    let mut class_subjects: HashMap<String, Vec<String>> = HashMap::new();
    let mut stmt = match conn.prepare(
        "SELECT cs.class_id, cs.subject_id
         FROM class_subjects cs
         JOIN classes c ON c.id = cs.class_id
         WHERE c.year = ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let memberships: Vec<(String, String)> = match stmt
        .query_map([&year], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    for (class_id, subject_id) in memberships {
        class_subjects.entry(class_id).or_default().push(subject_id);
    }

    let mut stmt = match conn.prepare(
        "SELECT g.student_id, g.subject_id, g.term, g.value
         FROM grades g
         JOIN students s ON s.id = g.student_id
         JOIN classes c ON c.id = s.class_id
         WHERE c.year = ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let grade_rows: Vec<(String, String, i64, f64)> = match stmt
        .query_map([&year], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut cells: HashMap<(&str, &str), [Option<f64>; 4]> = HashMap::new();
    let mut value_sum = 0.0_f64;
    let mut value_count = 0_usize;
    for (student_id, subject_id, term, value) in &grade_rows {
        if *value > 0.0 {
            value_sum += value;
            value_count += 1;
        }
        if (1..=4).contains(term) {
            let cell = cells
                .entry((student_id.as_str(), subject_id.as_str()))
                .or_insert([None; 4]);
            cell[(*term - 1) as usize] = Some(*value);
        }
    }
    let global_average = if value_count > 0 {
        calc::round_off_1_decimal(value_sum / value_count as f64)
    } else {
        0.0
    };

    let empty_subjects: Vec<String> = Vec::new();
    let (mut pending, mut failing, mut passing) = (0_i64, 0_i64, 0_i64);
    for (student_id, class_id, status) in &students {
        if normalized_status(status) != "Cursando" {
            continue;
        }
        let subject_ids = class_subjects.get(class_id).unwrap_or(&empty_subjects);
        let states: Vec<RosterState> = subject_ids
            .iter()
            .map(|subject_id| {
                let empty = [None; 4];
                let cell = cells
                    .get(&(student_id.as_str(), subject_id.as_str()))
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

    ok(
        &req.id,
        json!({
            "year": year,
            "totals": {
                "students": students.len(),
                "classes": class_ids.len(),
                "subjects": subject_count
            },
            "statusCounts": {
                "cursando": cursando,
                "transferidos": transferidos,
                "evadidos": evadidos,
                "outros": outros
            },
            "academic": {
                "pending": pending,
                "failing": failing,
                "passing": passing
            },
            "globalAverage": global_average
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.summary" => Some(handle_dashboard_summary(state, req)),
        _ => None,
    }
}
