//! Attendance metrics over access records.
//!
//! All calendar reasoning happens in the school's local time zone, given as a
//! fixed UTC offset. A day counts as attended when it has at least one ENTRY.

use crate::model::{AccessRecord, Movement, Shift, Student};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftTimes {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ShiftTimes {
    fn hm(start: (u32, u32), end: (u32, u32)) -> Self {
        Self {
            start: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShiftSchedule {
    pub morning: ShiftTimes,
    pub afternoon: ShiftTimes,
    pub evening: ShiftTimes,
    pub full_day: ShiftTimes,
}

impl Default for ShiftSchedule {
    fn default() -> Self {
        Self {
            morning: ShiftTimes::hm((7, 30), (12, 0)),
            afternoon: ShiftTimes::hm((13, 0), (17, 30)),
            evening: ShiftTimes::hm((19, 0), (22, 30)),
            full_day: ShiftTimes::hm((7, 30), (17, 30)),
        }
    }
}

impl ShiftSchedule {
    pub fn times(&self, shift: Shift) -> ShiftTimes {
        match shift {
            Shift::Morning => self.morning,
            Shift::Afternoon => self.afternoon,
            Shift::Evening => self.evening,
            Shift::FullDay => self.full_day,
        }
    }
}

/// Thresholds for lateness and risk scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttendancePolicy {
    /// Offset of the school's local time from UTC, in minutes
    pub utc_offset_minutes: i32,
    pub tolerance_minutes: u32,
    /// Seven-day attendance below this percentage is a risk factor
    pub low_attendance_percent: f64,
    /// Drop of the seven-day rate below the thirty-day rate, in points
    pub decline_points: f64,
    /// Relative growth of the late-arrival rate that counts as a risk factor
    pub lateness_increase_ratio: f64,
    /// Late-arrival rate that counts as an increase when the baseline is zero
    pub lateness_zero_baseline_percent: f64,
    /// A weekday attended less often than this fraction is a pattern
    pub weekday_pattern_ratio: f64,
    pub shifts: ShiftSchedule,
}

impl Default for AttendancePolicy {
    fn default() -> Self {
        Self {
            utc_offset_minutes: -180,
            tolerance_minutes: 15,
            low_attendance_percent: 75.0,
            decline_points: 20.0,
            lateness_increase_ratio: 0.30,
            lateness_zero_baseline_percent: 30.0,
            weekday_pattern_ratio: 0.5,
            shifts: ShiftSchedule::default(),
        }
    }
}

impl AttendancePolicy {
    pub fn validate(&self) -> Result<(), String> {
        if FixedOffset::east_opt(self.utc_offset_minutes * 60).is_none() {
            return Err(format!("attendance.utc_offset_minutes {} is out of range", self.utc_offset_minutes));
        }
        for shift in [Shift::Morning, Shift::Afternoon, Shift::Evening, Shift::FullDay] {
            let times = self.shifts.times(shift);
            if times.end <= times.start {
                return Err(format!("attendance shift {} ends before it starts", shift.as_str()));
            }
            if i64::from(self.tolerance_minutes) >= (times.end - times.start).num_minutes() {
                return Err(format!(
                    "attendance.tolerance_minutes exceeds the {} shift",
                    shift.as_str()
                ));
            }
        }
        if !(0.0..=100.0).contains(&self.low_attendance_percent) {
            return Err("attendance.low_attendance_percent must be within 0..=100".to_string());
        }
        Ok(())
    }

    pub fn timezone(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    fn tolerance(&self) -> Duration {
        Duration::minutes(i64::from(self.tolerance_minutes))
    }

    /// Latest entry time that is not late: shift start minus tolerance
    pub fn entry_cutoff(&self, shift: Shift) -> NaiveTime {
        self.shifts.times(shift).start.overflowing_sub_signed(self.tolerance()).0
    }

    /// Earliest exit that is not an early departure: shift end minus tolerance
    pub fn exit_cutoff(&self, shift: Shift) -> NaiveTime {
        self.shifts.times(shift).end.overflowing_sub_signed(self.tolerance()).0
    }

    pub fn local_time(&self, at: DateTime<Utc>) -> NaiveTime {
        at.with_timezone(&self.timezone()).time()
    }

    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.timezone()).date_naive()
    }

    pub fn is_late(&self, shift: Shift, entry_at: DateTime<Utc>) -> bool {
        self.local_time(entry_at) > self.entry_cutoff(shift)
    }

    pub fn is_early_departure(&self, shift: Shift, exit_at: DateTime<Utc>) -> bool {
        self.local_time(exit_at) < self.exit_cutoff(shift)
    }

    /// UTC instant of local midnight on the day of `at`
    pub fn start_of_local_day(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = self.local_date(at).and_time(NaiveTime::MIN);
        (midnight - Duration::minutes(i64::from(self.utc_offset_minutes))).and_utc()
    }
}

pub fn is_business_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Attendance over a trailing window of days ending today
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowMetrics {
    pub days: u32,
    pub business_days: u32,
    pub attended_days: u32,
    pub attendance_percent: f64,
    pub late_days: u32,
    /// Share of attended days with a late first entry
    pub late_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceMetrics {
    pub student_id: String,
    pub reference_date: NaiveDate,
    pub last_7: WindowMetrics,
    pub last_30: WindowMetrics,
    /// Weekdays attended on less than the policy ratio of their occurrences
    /// in the thirty-day window
    pub weak_weekdays: Vec<Weekday>,
}

fn window_dates(end: NaiveDate, days: u32) -> impl Iterator<Item = NaiveDate> {
    (0..i64::from(days)).rev().map(move |back| end - Duration::days(back))
}

fn window_metrics(
    first_entries: &BTreeMap<NaiveDate, DateTime<Utc>>,
    end: NaiveDate,
    days: u32,
    shift: Option<Shift>,
    policy: &AttendancePolicy,
) -> WindowMetrics {
    let mut business_days = 0;
    let mut attended_days = 0;
    let mut late_days = 0;

    for date in window_dates(end, days) {
        if is_business_day(date) {
            business_days += 1;
        }
        if let Some(first_entry) = first_entries.get(&date) {
            attended_days += 1;
            if shift.map_or(false, |shift| policy.is_late(shift, *first_entry)) {
                late_days += 1;
            }
        }
    }

    let attendance_percent = if business_days == 0 {
        100.0
    } else {
        (f64::from(attended_days) / f64::from(business_days) * 100.0).min(100.0)
    };
    let late_percent = if attended_days == 0 {
        0.0
    } else {
        f64::from(late_days) / f64::from(attended_days) * 100.0
    };

    WindowMetrics {
        days,
        business_days,
        attended_days,
        attendance_percent,
        late_days,
        late_percent,
    }
}

/// Compute seven- and thirty-day metrics for one student.
///
/// The windows end on the local date of `now`, or on the inactivation date
/// for students who have left. Records of other students are ignored.
pub fn compute_attendance_metrics(
    student: &Student,
    records: &[AccessRecord],
    shift: Option<Shift>,
    now: DateTime<Utc>,
    policy: &AttendancePolicy,
) -> AttendanceMetrics {
    let until = student.inactivated_at.map_or(now, |left| left.min(now));
    let end = policy.local_date(until);

    let mut first_entries: BTreeMap<NaiveDate, DateTime<Utc>> = BTreeMap::new();
    for record in records
        .iter()
        .filter(|r| r.student_id == student.id && r.movement == Movement::Entry && r.timestamp <= until)
    {
        first_entries
            .entry(policy.local_date(record.timestamp))
            .and_modify(|first| *first = (*first).min(record.timestamp))
            .or_insert(record.timestamp);
    }

    let last_7 = window_metrics(&first_entries, end, 7, shift, policy);
    let last_30 = window_metrics(&first_entries, end, 30, shift, policy);

    let mut occurrences: BTreeMap<u32, (Weekday, u32, u32)> = BTreeMap::new();
    for date in window_dates(end, 30).filter(|d| is_business_day(*d)) {
        let weekday = date.weekday();
        let slot = occurrences
            .entry(weekday.num_days_from_monday())
            .or_insert((weekday, 0, 0));
        slot.1 += 1;
        if first_entries.contains_key(&date) {
            slot.2 += 1;
        }
    }
    let weak_weekdays = occurrences
        .into_values()
        .filter(|(_, seen, attended)| {
            *seen >= 2 && f64::from(*attended) / f64::from(*seen) < policy.weekday_pattern_ratio
        })
        .map(|(weekday, _, _)| weekday)
        .collect();

    AttendanceMetrics {
        student_id: student.id.clone(),
        reference_date: end,
        last_7,
        last_30,
        weak_weekdays,
    }
}

/// Movement of the student's latest record at or before `at`, optionally
/// ignoring anything before `since`
pub fn current_presence(
    records: &[AccessRecord],
    student_id: &str,
    at: DateTime<Utc>,
    since: Option<DateTime<Utc>>,
) -> Option<Movement> {
    records
        .iter()
        .filter(|r| r.student_id == student_id && r.timestamp <= at)
        .filter(|r| since.map_or(true, |since| r.timestamp >= since))
        .max_by_key(|r| r.timestamp)
        .map(|r| r.movement)
}
