use rusqlite::Connection;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// 1-decimal rounding used everywhere a grade is displayed or classified:
/// `floor(10*x + 0.5) / 10` (half away from zero on the non-negative domain).
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

pub const PASSING_MEAN: f64 = 6.0;
pub const RECOVERY_PASSING_FINAL: f64 = 5.0;
pub const PASSING_POINTS_SUM: f64 = 24.0;

/// Direct approval: bimester mean already at the passing bar, no recovery exam.
pub fn approved_by_mean(mg: f64) -> bool {
    mg >= PASSING_MEAN
}

/// Council/report approval after the recovery blend has been applied.
pub fn approved_after_recovery(mf: f64) -> bool {
    mf >= RECOVERY_PASSING_FINAL
}

/// Dashboard quick-card rule: raw sum of the four bimesters, recovery ignored.
/// Kept separate from the two rules above on purpose; the views disagree.
pub fn approved_by_points(points: f64) -> bool {
    points >= PASSING_POINTS_SUM
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Situation {
    Approved,
    Reproved,
    InProgress,
    PendingRecovery,
}

impl Situation {
    pub fn label(self) -> &'static str {
        match self {
            Situation::Approved => "Aprovado",
            Situation::Reproved => "Reprovado",
            Situation::InProgress => "Em Curso",
            Situation::PendingRecovery => "Recuperação",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Performance {
    Insufficient,
    Regular,
    Good,
    Excellent,
    Undefined,
}

impl Performance {
    pub fn label(self) -> &'static str {
        match self {
            Performance::Insufficient => "Insuficiente",
            Performance::Regular => "Regular",
            Performance::Good => "Bom",
            Performance::Excellent => "Ótimo",
            Performance::Undefined => "-",
        }
    }
}

/// Raw per-subject scores: four bimesters plus the optional final recovery
/// exam (term 5). Absent is not the same as zero anywhere downstream.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TermScores {
    pub bimesters: [Option<f64>; 4],
    pub recovery: Option<f64>,
}

impl TermScores {
    pub fn valid_terms(&self) -> usize {
        self.bimesters.iter().filter(|v| v.is_some()).count()
    }

    pub fn points(&self) -> f64 {
        self.bimesters.iter().flatten().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectOutcome {
    pub valid_terms: usize,
    pub complete: bool,
    pub points: f64,
    pub mg: f64,
    /// Final grade, already rounded to one decimal; this rounded value is the
    /// figure of record for classification and display alike.
    pub mf: f64,
    pub situation: Situation,
    pub is_recovered: bool,
    pub performance: Performance,
}

/// Per-subject evaluation: bimester mean (divisor always 4, missing terms
/// contribute 0), the 60/40 recovery blend when the mean is below the bar,
/// and the resulting situation and performance tier.
pub fn evaluate_subject(scores: &TermScores) -> SubjectOutcome {
    let valid_terms = scores.valid_terms();
    let complete = valid_terms == 4;
    let points = scores.points();
    let mg = points / 4.0;

    let mut mf = mg;
    let mut is_recovered = false;
    if !approved_by_mean(mg) {
        let rec = scores.recovery.unwrap_or(0.0);
        mf = (mg * 6.0 + rec * 4.0) / 10.0;
        is_recovered = scores.recovery.is_some();
    }
    let mf = round_off_1_decimal(mf);

    let situation = if !complete {
        Situation::InProgress
    } else if approved_by_mean(mg) {
        Situation::Approved
    } else if scores.recovery.is_none() {
        Situation::PendingRecovery
    } else if approved_after_recovery(mf) {
        Situation::Approved
    } else {
        Situation::Reproved
    };

    let performance = if valid_terms == 0 {
        Performance::Undefined
    } else if mf < 5.0 {
        Performance::Insufficient
    } else if mf < 6.0 {
        Performance::Regular
    } else if mf < 8.0 {
        Performance::Good
    } else {
        Performance::Excellent
    };

    SubjectOutcome {
        valid_terms,
        complete,
        points,
        mg,
        mf,
        situation,
        is_recovered,
        performance,
    }
}

/// Reference table for the grade-entry screen: recovery score needed to pass,
/// indexed by the bimester points sum in tenths (100 ⇒ 10.0 .. 249 ⇒ 24.9).
/// This is domain-supplied literal data. The closed form
/// `(50 - 1.5*points) / 4` rounded to one decimal reproduces 148 of the 150
/// entries but diverges at 17.5 and 23.1, so the table stays authoritative.
const RECOVERY_NEEDED_TENTHS: [i64; 150] = [
    88, 87, 87, 86, 86, 86, 85, 85, 85, 84,
    84, 83, 83, 83, 82, 82, 82, 81, 81, 80,
    80, 80, 79, 79, 79, 78, 78, 77, 77, 77,
    76, 76, 76, 75, 75, 74, 74, 74, 73, 73,
    73, 72, 72, 71, 71, 71, 70, 70, 70, 69,
    69, 68, 68, 68, 67, 67, 67, 66, 66, 65,
    65, 65, 64, 64, 64, 63, 63, 62, 62, 62,
    61, 61, 61, 60, 60, 60, 59, 59, 58, 58,
    58, 57, 57, 56, 56, 56, 55, 55, 55, 54,
    54, 53, 53, 53, 52, 52, 52, 51, 51, 50,
    50, 50, 49, 49, 49, 48, 48, 47, 47, 47,
    46, 46, 46, 45, 45, 44, 44, 44, 43, 43,
    43, 42, 42, 41, 41, 41, 40, 40, 40, 39,
    39, 39, 38, 38, 37, 37, 37, 36, 36, 35,
    35, 35, 34, 34, 34, 33, 33, 32, 32, 32,
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecoveryNeed {
    /// Fewer than 10 points: the blend cannot reach a passing final grade.
    Inapt,
    Score(f64),
    /// 25 points or more: already passing, no lookup applies.
    NotNeeded,
}

impl RecoveryNeed {
    pub fn label(self) -> String {
        match self {
            RecoveryNeed::Inapt => "Inapto".to_string(),
            RecoveryNeed::Score(v) => format!("{:.1}", v),
            RecoveryNeed::NotNeeded => "----".to_string(),
        }
    }
}

/// Lookup of the recovery score needed to pass, given the one-decimal sum of
/// the four bimester grades.
pub fn recovery_needed(points: f64) -> RecoveryNeed {
    let tenths = ((points * 10.0) + 0.5).floor() as i64;
    if tenths < 100 {
        RecoveryNeed::Inapt
    } else if tenths >= 250 {
        RecoveryNeed::NotNeeded
    } else {
        let v = RECOVERY_NEEDED_TENTHS[(tenths - 100) as usize];
        RecoveryNeed::Score(v as f64 / 10.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OverallResult {
    Approved,
    Reproved,
    Pending,
}

impl OverallResult {
    pub fn label(self) -> &'static str {
        match self {
            OverallResult::Approved => "Aprovado",
            OverallResult::Reproved => "Reprovado",
            OverallResult::Pending => "Pendente",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentStanding {
    pub high_count: i64,
    pub low_count: i64,
    pub overall: OverallResult,
    /// Subject names responsible for retention; incomplete subjects are
    /// suffixed " (P)" to distinguish pending from failed.
    pub retained: Vec<String>,
}

/// Council roll-up across one student's subject outcomes (ordered by the
/// class subject list). Pure function of its inputs.
pub fn student_standing<'a, I>(results: I) -> StudentStanding
where
    I: IntoIterator<Item = (&'a str, &'a SubjectOutcome)>,
{
    let mut high_count = 0_i64;
    let mut low_count = 0_i64;
    let mut any_pending = false;
    let mut retained: Vec<String> = Vec::new();

    for (name, outcome) in results {
        if outcome.mf >= RECOVERY_PASSING_FINAL {
            high_count += 1;
        } else if outcome.complete {
            low_count += 1;
            retained.push(name.to_string());
        }
        if !outcome.complete {
            any_pending = true;
            retained.push(format!("{} (P)", name));
        }
    }

    let overall = if any_pending {
        OverallResult::Pending
    } else if low_count > 0 {
        OverallResult::Reproved
    } else {
        OverallResult::Approved
    };

    StudentStanding {
        high_count,
        low_count,
        overall,
        retained,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RosterState {
    Pending,
    Failing,
    Passing,
}

/// Summary-card classification: points-sum only, recovery deliberately
/// ignored. This is a coarser rule than the council's and the two may
/// disagree; both are displayed independently.
pub fn roster_subject_state(bimesters: &[Option<f64>; 4]) -> RosterState {
    let present: Vec<f64> = bimesters.iter().flatten().copied().collect();
    if present.len() < 4 {
        RosterState::Pending
    } else if !approved_by_points(present.iter().sum()) {
        RosterState::Failing
    } else {
        RosterState::Passing
    }
}

/// Student roll-up for the card: any pending subject wins, then any failing
/// one. A student with no subjects at all counts as pending.
pub fn roster_student_state(states: &[RosterState]) -> RosterState {
    if states.is_empty() || states.contains(&RosterState::Pending) {
        RosterState::Pending
    } else if states.contains(&RosterState::Failing) {
        RosterState::Failing
    } else {
        RosterState::Passing
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

/// Name comparison matching the registrar's convention: digit runs compare
/// numerically ("2B" < "10A"), everything else byte-wise.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let ab = a.as_bytes();
    let bb = b.as_bytes();
    let (mut i, mut j) = (0_usize, 0_usize);
    while i < ab.len() && j < bb.len() {
        if ab[i].is_ascii_digit() && bb[j].is_ascii_digit() {
            let si = i;
            while i < ab.len() && ab[i].is_ascii_digit() {
                i += 1;
            }
            let sj = j;
            while j < bb.len() && bb[j].is_ascii_digit() {
                j += 1;
            }
            let na: u64 = a[si..i].parse().unwrap_or(0);
            let nb: u64 = b[sj..j].parse().unwrap_or(0);
            match na.cmp(&nb) {
                Ordering::Equal => {}
                other => return other,
            }
        } else {
            match ab[i].cmp(&bb[j]) {
                Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
                other => return other,
            }
        }
    }
    (ab.len() - i).cmp(&(bb.len() - j))
}

// ---------------------------------------------------------------------------
// Cohort aggregation over an immutable snapshot of the workspace.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClassRef {
    pub id: String,
    pub name: String,
    pub year: String,
}

#[derive(Debug, Clone)]
pub struct StudentRef {
    pub id: String,
    pub name: String,
    pub class_id: String,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct SubjectRef {
    pub id: String,
    pub name: String,
    pub sub_area_id: String,
    pub year: String,
}

#[derive(Debug, Clone)]
pub struct SubAreaRef {
    pub id: String,
    pub name: String,
    pub knowledge_area_id: String,
}

#[derive(Debug, Clone)]
pub struct AreaRef {
    pub id: String,
    pub name: String,
    pub formation_type_id: String,
}

#[derive(Debug, Clone)]
pub struct GradeRef {
    pub student_id: String,
    pub subject_id: String,
    pub term: i64,
    pub value: f64,
}

/// Read-only snapshot of every collection the aggregations consume. The
/// engine never re-reads mid-computation; callers load once per request.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub classes: Vec<ClassRef>,
    pub students: Vec<StudentRef>,
    pub subjects: Vec<SubjectRef>,
    pub sub_areas: Vec<SubAreaRef>,
    pub areas: Vec<AreaRef>,
    pub grades: Vec<GradeRef>,
}

impl Snapshot {
    pub fn load(conn: &Connection) -> Result<Snapshot, CalcError> {
        let q = |e: rusqlite::Error| CalcError::new("db_query_failed", e.to_string());

        let mut stmt = conn
            .prepare("SELECT id, name, year FROM classes")
            .map_err(q)?;
        let classes = stmt
            .query_map([], |r| {
                Ok(ClassRef {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    year: r.get(2)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(q)?;

        let mut stmt = conn
            .prepare("SELECT id, name, class_id, COALESCE(status, 'Cursando') FROM students")
            .map_err(q)?;
        let students = stmt
            .query_map([], |r| {
                Ok(StudentRef {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    class_id: r.get(2)?,
                    status: r.get(3)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(q)?;

        let mut stmt = conn
            .prepare("SELECT id, name, sub_area_id, year FROM subjects")
            .map_err(q)?;
        let subjects = stmt
            .query_map([], |r| {
                Ok(SubjectRef {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    sub_area_id: r.get(2)?,
                    year: r.get(3)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(q)?;

        let mut stmt = conn
            .prepare("SELECT id, name, knowledge_area_id FROM sub_areas")
            .map_err(q)?;
        let sub_areas = stmt
            .query_map([], |r| {
                Ok(SubAreaRef {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    knowledge_area_id: r.get(2)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(q)?;

        let mut stmt = conn
            .prepare("SELECT id, name, formation_type_id FROM knowledge_areas")
            .map_err(q)?;
        let areas = stmt
            .query_map([], |r| {
                Ok(AreaRef {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    formation_type_id: r.get(2)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(q)?;

        let mut stmt = conn
            .prepare("SELECT student_id, subject_id, term, value FROM grades")
            .map_err(q)?;
        let grades = stmt
            .query_map([], |r| {
                Ok(GradeRef {
                    student_id: r.get(0)?,
                    subject_id: r.get(1)?,
                    term: r.get(2)?,
                    value: r.get(3)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(q)?;

        Ok(Snapshot {
            classes,
            students,
            subjects,
            sub_areas,
            areas,
            grades,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSelector {
    /// Annual mean over the four bimesters with the recovery blend applied.
    All,
    /// One raw bimester (1..=4), no blending.
    Term(i64),
}

#[derive(Debug, Clone)]
pub struct CohortFilters {
    pub year: String,
    /// None means every enrollment status; the default at the call sites is
    /// "Cursando". Empty stored statuses count as "Cursando".
    pub status: Option<String>,
    pub term: TermSelector,
    pub class_id: Option<String>,
    pub formation_id: Option<String>,
    pub area_id: Option<String>,
    pub sub_area_id: Option<String>,
    pub subject_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupAverage {
    pub name: String,
    pub average: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSeries {
    pub name: String,
    pub terms: [f64; 4],
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortReport {
    pub student_count: usize,
    pub global_average: f64,
    pub pass_rate: f64,
    pub subject_stats: Vec<GroupAverage>,
    pub sub_area_stats: Vec<GroupAverage>,
    pub area_stats: Vec<GroupAverage>,
    pub class_evolution: Vec<ClassSeries>,
}

pub fn student_status_matches(status: &str, wanted: Option<&str>) -> bool {
    let Some(wanted) = wanted else {
        return true;
    };
    let effective = if status.trim().is_empty() {
        "Cursando"
    } else {
        status
    };
    effective == wanted
}

const RANKED_GROUP_LIMIT: usize = 15;

fn ranked(totals: HashMap<String, (f64, usize)>, names: &HashMap<&str, &str>) -> Vec<GroupAverage> {
    // Only groups that actually accumulated values are ranked; empty groups
    // are excluded rather than shown as zero.
    let mut out: Vec<GroupAverage> = totals
        .into_iter()
        .filter(|(_, (_, count))| *count > 0)
        .map(|(id, (sum, count))| GroupAverage {
            name: names.get(id.as_str()).unwrap_or(&"?").to_string(),
            average: round_off_1_decimal(sum / count as f64),
        })
        .collect();
    out.sort_by(|a, b| {
        b.average
            .partial_cmp(&a.average)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    out
}

/// Cohort aggregation for dashboards and analytics. Pure over the snapshot;
/// any group without contributing values reports 0 and is left out of the
/// ranked outputs. Dangling references are skipped, never an error.
pub fn compute_cohort_report(snap: &Snapshot, filters: &CohortFilters) -> CohortReport {
    let mut active_classes: Vec<&ClassRef> = snap
        .classes
        .iter()
        .filter(|c| {
            c.year == filters.year
                && filters
                    .class_id
                    .as_ref()
                    .map(|id| c.id == *id)
                    .unwrap_or(true)
        })
        .collect();
    active_classes.sort_by(|a, b| natural_cmp(&a.name, &b.name));
    let active_class_ids: HashSet<&str> = active_classes.iter().map(|c| c.id.as_str()).collect();

    let active_students: Vec<&StudentRef> = snap
        .students
        .iter()
        .filter(|s| {
            active_class_ids.contains(s.class_id.as_str())
                && student_status_matches(&s.status, filters.status.as_deref())
        })
        .collect();
    let active_student_ids: HashSet<&str> = active_students.iter().map(|s| s.id.as_str()).collect();

    let sub_area_by_id: HashMap<&str, &SubAreaRef> =
        snap.sub_areas.iter().map(|sa| (sa.id.as_str(), sa)).collect();
    let area_by_id: HashMap<&str, &AreaRef> =
        snap.areas.iter().map(|a| (a.id.as_str(), a)).collect();

    // Hierarchy filter chain: formation -> area -> sub-area -> subject, each
    // level narrowing the previous, always constrained to the selected year.
    let target_subjects: Vec<&SubjectRef> = snap
        .subjects
        .iter()
        .filter(|s| {
            if s.year != filters.year {
                return false;
            }
            if let Some(id) = &filters.subject_id {
                if s.id != *id {
                    return false;
                }
            }
            let sa = sub_area_by_id.get(s.sub_area_id.as_str());
            if let Some(id) = &filters.sub_area_id {
                match sa {
                    Some(sa) if sa.id == *id => {}
                    _ => return false,
                }
            }
            let area = sa.and_then(|sa| area_by_id.get(sa.knowledge_area_id.as_str()));
            if let Some(id) = &filters.area_id {
                match area {
                    Some(a) if a.id == *id => {}
                    _ => return false,
                }
            }
            if let Some(id) = &filters.formation_id {
                match area {
                    Some(a) if a.formation_type_id == *id => {}
                    _ => return false,
                }
            }
            true
        })
        .collect();
    let target_subject_ids: HashSet<&str> = target_subjects.iter().map(|s| s.id.as_str()).collect();

    // (student, subject) -> [term 1..5], one value per cell at most.
    let mut grade_map: HashMap<(&str, &str), [Option<f64>; 5]> = HashMap::new();
    for g in &snap.grades {
        if !(1..=5).contains(&g.term) {
            continue;
        }
        if !active_student_ids.contains(g.student_id.as_str())
            || !target_subject_ids.contains(g.subject_id.as_str())
        {
            continue;
        }
        let cell = grade_map
            .entry((g.student_id.as_str(), g.subject_id.as_str()))
            .or_insert([None; 5]);
        cell[(g.term - 1) as usize] = Some(g.value);
    }

    let mut subject_totals: HashMap<String, (f64, usize)> = HashMap::new();
    let mut sub_area_totals: HashMap<String, (f64, usize)> = HashMap::new();
    let mut area_totals: HashMap<String, (f64, usize)> = HashMap::new();

    let mut student_averages: Vec<f64> = Vec::new();
    for student in &active_students {
        let mut sum = 0.0_f64;
        let mut count = 0_usize;
        for subject in &target_subjects {
            let Some(terms) = grade_map.get(&(student.id.as_str(), subject.id.as_str())) else {
                continue;
            };
            let val = match filters.term {
                TermSelector::All => {
                    let mg = (terms[0].unwrap_or(0.0)
                        + terms[1].unwrap_or(0.0)
                        + terms[2].unwrap_or(0.0)
                        + terms[3].unwrap_or(0.0))
                        / 4.0;
                    match terms[4] {
                        Some(rf) if mg < PASSING_MEAN => (mg * 6.0 + rf * 4.0) / 10.0,
                        _ => mg,
                    }
                }
                TermSelector::Term(t) => terms[(t - 1) as usize].unwrap_or(0.0),
            };
            // Zero and absent values never contribute to an average.
            if val <= 0.0 {
                continue;
            }
            sum += val;
            count += 1;

            let entry = subject_totals.entry(subject.id.clone()).or_insert((0.0, 0));
            entry.0 += val;
            entry.1 += 1;

            if let Some(sa) = sub_area_by_id.get(subject.sub_area_id.as_str()) {
                let entry = sub_area_totals.entry(sa.id.clone()).or_insert((0.0, 0));
                entry.0 += val;
                entry.1 += 1;
                if let Some(area) = area_by_id.get(sa.knowledge_area_id.as_str()) {
                    let entry = area_totals.entry(area.id.clone()).or_insert((0.0, 0));
                    entry.0 += val;
                    entry.1 += 1;
                }
            }
        }
        if count > 0 {
            student_averages.push(sum / count as f64);
        }
    }

    let global_average = if student_averages.is_empty() {
        0.0
    } else {
        student_averages.iter().sum::<f64>() / student_averages.len() as f64
    };
    let pass_rate = if student_averages.is_empty() {
        0.0
    } else {
        100.0
            * student_averages
                .iter()
                .filter(|avg| **avg >= PASSING_MEAN)
                .count() as f64
            / student_averages.len() as f64
    };

    let subject_names: HashMap<&str, &str> = snap
        .subjects
        .iter()
        .map(|s| (s.id.as_str(), s.name.as_str()))
        .collect();
    let sub_area_names: HashMap<&str, &str> = snap
        .sub_areas
        .iter()
        .map(|sa| (sa.id.as_str(), sa.name.as_str()))
        .collect();
    let area_names: HashMap<&str, &str> = snap
        .areas
        .iter()
        .map(|a| (a.id.as_str(), a.name.as_str()))
        .collect();

    let mut subject_stats = ranked(subject_totals, &subject_names);
    subject_stats.truncate(RANKED_GROUP_LIMIT);
    let mut sub_area_stats = ranked(sub_area_totals, &sub_area_names);
    sub_area_stats.truncate(RANKED_GROUP_LIMIT);
    let area_stats = ranked(area_totals, &area_names);

    // Trend series: raw bimester values only, never the recovery blend.
    let class_evolution: Vec<ClassSeries> = active_classes
        .iter()
        .map(|cls| {
            let mut terms = [0.0_f64; 4];
            for (idx, slot) in terms.iter_mut().enumerate() {
                let mut t_sum = 0.0_f64;
                let mut t_count = 0_usize;
                for student in &active_students {
                    if student.class_id != cls.id {
                        continue;
                    }
                    for subject in &target_subjects {
                        let Some(cell) = grade_map.get(&(student.id.as_str(), subject.id.as_str()))
                        else {
                            continue;
                        };
                        if let Some(v) = cell[idx] {
                            if v > 0.0 {
                                t_sum += v;
                                t_count += 1;
                            }
                        }
                    }
                }
                *slot = if t_count > 0 {
                    round_off_1_decimal(t_sum / t_count as f64)
                } else {
                    0.0
                };
            }
            ClassSeries {
                name: cls.name.clone(),
                terms,
            }
        })
        .collect();

    CohortReport {
        student_count: active_students.len(),
        global_average: round_off_1_decimal(global_average),
        pass_rate: round_off_1_decimal(pass_rate),
        subject_stats,
        sub_area_stats,
        area_stats,
        class_evolution,
    }
}
