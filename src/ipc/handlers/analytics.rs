use crate::calc::{self, CohortFilters, Snapshot, TermSelector};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_str, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn parse_term_selector(req: &Request) -> Result<TermSelector, serde_json::Value> {
    match req.params.get("term") {
        None | Some(serde_json::Value::Null) => Ok(TermSelector::All),
        Some(v) => {
            if let Some(s) = v.as_str() {
                if s == "all" {
                    return Ok(TermSelector::All);
                }
                if let Ok(t) = s.parse::<i64>() {
                    if (1..=4).contains(&t) {
                        return Ok(TermSelector::Term(t));
                    }
                }
            }
            if let Some(t) = v.as_i64() {
                if (1..=4).contains(&t) {
                    return Ok(TermSelector::Term(t));
                }
            }
            Err(err(
                &req.id,
                "bad_params",
                "term must be \"all\" or 1..4",
                Some(json!({ "term": v })),
            ))
        }
    }
}

fn handle_analytics_cohort(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let year = match required_str(req, "year") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let term = match parse_term_selector(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // Absent status defaults to active enrollments; an explicit empty string
    // means the same. "Todos" widens to every status.
    let status = match opt_str(req, "status") {
        None => Some("Cursando".to_string()),
        Some(s) if s.trim().is_empty() => Some("Cursando".to_string()),
        Some(s) if s == "Todos" => None,
        Some(s) => Some(s),
    };

    let filters = CohortFilters {
        year,
        status,
        term,
        class_id: opt_str(req, "classId"),
        formation_id: opt_str(req, "formationId"),
        area_id: opt_str(req, "areaId"),
        sub_area_id: opt_str(req, "subAreaId"),
        subject_id: opt_str(req, "subjectId"),
    };

    let snapshot = match Snapshot::load(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };
    let report = calc::compute_cohort_report(&snapshot, &filters);

    ok(
        &req.id,
        json!({
            "studentCount": report.student_count,
            "globalAverage": report.global_average,
            "passRate": report.pass_rate,
            "subjectStats": report.subject_stats,
            "subAreaStats": report.sub_area_stats,
            "areaStats": report.area_stats,
            "classEvolution": report.class_evolution
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "analytics.cohort" => Some(handle_analytics_cohort(state, req)),
        _ => None,
    }
}
