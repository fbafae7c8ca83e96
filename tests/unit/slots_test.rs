//! Tests for weekly publishing slots

use prometheus_work_queue::core::{conflicts, WeeklySchedule};

// Thursday 2026-10-22T00:00:00Z
const THURSDAY: i64 = 1_792_627_200_000;
const HOUR: i64 = 3_600_000;
const DAY: i64 = 24 * HOUR;

#[test]
fn test_next_slot_wraps_around_the_week() {
    let schedule: WeeklySchedule = "0:07:00,3:06:00".parse().unwrap();
    // Thursday 06:00 is already past at 06:30, so the next slot is Monday 07:00.
    let now = THURSDAY + 6 * HOUR + 30 * 60_000;
    assert_eq!(schedule.next_free_slot(now, &[]), THURSDAY + 4 * DAY + 7 * HOUR);
}

#[test]
fn test_slot_at_now_is_not_offered() {
    let schedule: WeeklySchedule = "3:06:00".parse().unwrap();
    let now = THURSDAY + 6 * HOUR;
    assert_eq!(schedule.next_free_slot(now, &[]), now + 7 * DAY);
}

#[test]
fn test_schedule_serializes_as_slot_string() {
    let schedule = WeeklySchedule::default();
    let json = serde_json::to_string(&schedule).unwrap();
    assert_eq!(json, r#""0:07:00,2:11:00,4:17:00,5:09:00,6:18:00""#);
    let back: WeeklySchedule = serde_json::from_str(&json).unwrap();
    assert_eq!(back, schedule);
    assert!(serde_json::from_str::<WeeklySchedule>(r#""9:07:00""#).is_err());
}

#[test]
fn test_conflict_window_is_exclusive_at_one_minute() {
    let existing = [THURSDAY, THURSDAY + 59_999, THURSDAY + 60_000];
    assert_eq!(conflicts(&existing, THURSDAY), vec![THURSDAY, THURSDAY + 59_999]);
}
