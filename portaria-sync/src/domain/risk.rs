//! Dropout-risk scoring from attendance metrics

use super::attendance::{compute_attendance_metrics, AttendanceMetrics, AttendancePolicy};
use crate::model::{AccessRecord, SchoolClass, Student};
use chrono::{DateTime, Utc, Weekday};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Minimum score for a student to appear on the risk list
pub const RISK_LIST_THRESHOLD: u32 = 3;

const HIGH_RISK_SCORE: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RiskFactor {
    LowAttendance { percent: f64 },
    DecliningAttendance { drop_points: f64 },
    LatenessIncrease { recent_percent: f64, baseline_percent: f64 },
    WeekdayPattern { weekdays: Vec<Weekday> },
    NoRecentPresence,
}

impl RiskFactor {
    pub fn points(&self) -> u32 {
        match self {
            RiskFactor::LowAttendance { .. } => 3,
            RiskFactor::DecliningAttendance { .. } => 2,
            RiskFactor::LatenessIncrease { .. } => 2,
            RiskFactor::WeekdayPattern { .. } => 1,
            RiskFactor::NoRecentPresence => 4,
        }
    }
}

impl fmt::Display for RiskFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskFactor::LowAttendance { percent } => write!(f, "attendance {:.0}% in the last 7 days", percent),
            RiskFactor::DecliningAttendance { drop_points } => {
                write!(f, "attendance dropped {:.0} points against 30 days", drop_points)
            }
            RiskFactor::LatenessIncrease {
                recent_percent,
                baseline_percent,
            } => write!(f, "late arrivals {:.0}% (baseline {:.0}%)", recent_percent, baseline_percent),
            RiskFactor::WeekdayPattern { weekdays } => {
                let days: Vec<String> = weekdays.iter().map(|d| d.to_string()).collect();
                write!(f, "often absent on {}", days.join(", "))
            }
            RiskFactor::NoRecentPresence => f.write_str("no presence in the last 7 days"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAssessment {
    pub score: u32,
    pub level: RiskLevel,
    pub factors: Vec<RiskFactor>,
}

impl RiskAssessment {
    pub fn is_listed(&self) -> bool {
        self.score >= RISK_LIST_THRESHOLD
    }
}

pub fn score_risk(metrics: &AttendanceMetrics, policy: &AttendancePolicy) -> RiskAssessment {
    let recent = &metrics.last_7;
    let baseline = &metrics.last_30;
    let mut factors = Vec::new();

    if recent.business_days > 0 && recent.attendance_percent < policy.low_attendance_percent {
        factors.push(RiskFactor::LowAttendance {
            percent: recent.attendance_percent,
        });
    }

    let drop_points = baseline.attendance_percent - recent.attendance_percent;
    if drop_points >= policy.decline_points {
        factors.push(RiskFactor::DecliningAttendance { drop_points });
    }

    let lateness_up = if baseline.late_percent > 0.0 {
        recent.late_percent >= baseline.late_percent * (1.0 + policy.lateness_increase_ratio)
    } else {
        recent.late_percent >= policy.lateness_zero_baseline_percent
    };
    if lateness_up && recent.late_days > 0 {
        factors.push(RiskFactor::LatenessIncrease {
            recent_percent: recent.late_percent,
            baseline_percent: baseline.late_percent,
        });
    }

    if !metrics.weak_weekdays.is_empty() {
        factors.push(RiskFactor::WeekdayPattern {
            weekdays: metrics.weak_weekdays.clone(),
        });
    }

    if recent.business_days >= 1 && recent.attended_days == 0 {
        factors.push(RiskFactor::NoRecentPresence);
    }

    let score = factors.iter().map(RiskFactor::points).sum();
    let level = if score >= HIGH_RISK_SCORE {
        RiskLevel::High
    } else if score >= RISK_LIST_THRESHOLD {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    RiskAssessment { score, level, factors }
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskEntry {
    pub student_id: String,
    pub name: String,
    pub class_id: Option<String>,
    pub metrics: AttendanceMetrics,
    pub assessment: RiskAssessment,
}

/// Active students scoring at least [`RISK_LIST_THRESHOLD`], highest first
pub fn risk_list(
    students: &[Student],
    classes: &[SchoolClass],
    records: &[AccessRecord],
    now: DateTime<Utc>,
    policy: &AttendancePolicy,
) -> Vec<RiskEntry> {
    let shifts: HashMap<&str, _> = classes.iter().map(|c| (c.id.as_str(), c.shift)).collect();

    let mut by_student: HashMap<&str, Vec<AccessRecord>> = HashMap::new();
    for record in records {
        by_student
            .entry(record.student_id.as_str())
            .or_default()
            .push(record.clone());
    }

    let mut entries: Vec<RiskEntry> = students
        .iter()
        .filter(|student| student.is_active())
        .filter_map(|student| {
            let shift = student
                .class_id
                .as_deref()
                .and_then(|id| shifts.get(id).copied());
            let own = by_student.get(student.id.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            let metrics = compute_attendance_metrics(student, own, shift, now, policy);
            let assessment = score_risk(&metrics, policy);
            assessment.is_listed().then(|| RiskEntry {
                student_id: student.id.clone(),
                name: student.name.clone(),
                class_id: student.class_id.clone(),
                metrics,
                assessment,
            })
        })
        .collect();

    entries.sort_by(|a, b| {
        b.assessment
            .score
            .cmp(&a.assessment.score)
            .then_with(|| a.student_id.cmp(&b.student_id))
    });
    entries
}
