//! Weekly publishing slots.
//!
//! A schedule is a set of `(weekday, time of day)` pairs in a fixed UTC offset,
//! written as `"0:07:00,2:11:00"` where weekday 0 is Monday.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::util::serde::Timestamp;

/// Two publish times closer than this collide.
pub const SLOT_CONFLICT_WINDOW_MS: i64 = 60_000;

const FALLBACK_DELAY_MS: i64 = 3_600_000;

/// One weekly slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WeeklySlot {
    /// 0 = Monday .. 6 = Sunday.
    pub weekday: u32,
    /// Local time of day.
    pub time: NaiveTime,
}

impl fmt::Display for WeeklySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.weekday, self.time.format("%H:%M"))
    }
}

/// Recurring weekly publish slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeeklySchedule {
    slots: Vec<WeeklySlot>,
    offset: FixedOffset,
}

impl Default for WeeklySchedule {
    fn default() -> Self {
        let slot = |weekday, h| WeeklySlot {
            weekday,
            time: NaiveTime::from_hms_opt(h, 0, 0).unwrap_or(NaiveTime::MIN),
        };
        Self {
            slots: vec![slot(0, 7), slot(2, 11), slot(4, 17), slot(5, 9), slot(6, 18)],
            offset: utc(),
        }
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

impl WeeklySchedule {
    /// Schedule from explicit slots, in UTC.
    #[must_use]
    pub fn new(mut slots: Vec<WeeklySlot>) -> Self {
        slots.sort_unstable();
        slots.dedup();
        Self {
            slots,
            offset: utc(),
        }
    }

    /// Parse `"D:HH:MM[,D:HH:MM...]"`; `HH:MM:SS` is accepted too.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first malformed entry.
    pub fn parse(input: &str) -> Result<Self, String> {
        let mut slots = Vec::new();
        for entry in input.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (day, time) = entry
                .split_once(':')
                .ok_or_else(|| format!("slot `{entry}` must look like D:HH:MM"))?;
            let weekday: u32 = day
                .trim()
                .parse()
                .map_err(|_| format!("slot `{entry}` has a non-numeric weekday"))?;
            if weekday > 6 {
                return Err(format!("slot `{entry}` weekday must be 0-6"));
            }
            let time = NaiveTime::parse_from_str(time, "%H:%M")
                .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M:%S"))
                .map_err(|e| format!("slot `{entry}` has an invalid time: {e}"))?;
            slots.push(WeeklySlot { weekday, time });
        }
        Ok(Self::new(slots))
    }

    /// Interpret slot times at `minutes` east of UTC.
    ///
    /// # Errors
    ///
    /// Returns a message if the offset is out of range.
    pub fn with_utc_offset_minutes(mut self, minutes: i32) -> Result<Self, String> {
        self.offset = minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| format!("utc offset {minutes} minutes is out of range"))?;
        Ok(self)
    }

    /// Slots in weekday/time order.
    #[must_use]
    pub fn slots(&self) -> &[WeeklySlot] {
        &self.slots
    }

    /// First slot after `now` within the coming week that does not collide
    /// with `taken`; else the first slot of the following week; else one hour
    /// from now when the schedule is empty.
    #[must_use]
    pub fn next_free_slot(&self, now: Timestamp, taken: &[Timestamp]) -> Timestamp {
        let Some(local_now) = DateTime::<Utc>::from_timestamp_millis(now) else {
            return now.saturating_add(FALLBACK_DELAY_MS);
        };
        let today = local_now.with_timezone(&self.offset).date_naive();

        for day_offset in 0..7 {
            for candidate in self.slots_on(today, day_offset) {
                if candidate > now && conflicts(taken, candidate).is_empty() {
                    return candidate;
                }
            }
        }
        (7..14)
            .find_map(|day_offset| self.slots_on(today, day_offset).into_iter().next())
            .unwrap_or_else(|| now.saturating_add(FALLBACK_DELAY_MS))
    }

    /// Every slot strictly after `from` on the `days` calendar days starting
    /// with `from`'s local date, in time order.
    #[must_use]
    pub fn expected_slots(&self, from: Timestamp, days: u32) -> Vec<Timestamp> {
        let Some(start) = DateTime::<Utc>::from_timestamp_millis(from) else {
            return Vec::new();
        };
        let today = start.with_timezone(&self.offset).date_naive();
        let mut slots: Vec<Timestamp> = (0..u64::from(days))
            .flat_map(|day_offset| self.slots_on(today, day_offset))
            .filter(|&t| t > from)
            .collect();
        slots.sort_unstable();
        slots
    }

    fn slots_on(&self, today: NaiveDate, day_offset: u64) -> Vec<Timestamp> {
        let Some(day) = today.checked_add_days(Days::new(day_offset)) else {
            return Vec::new();
        };
        let weekday = day.weekday().num_days_from_monday();
        self.slots
            .iter()
            .filter(|slot| slot.weekday == weekday)
            .filter_map(|slot| {
                self.offset
                    .from_local_datetime(&day.and_time(slot.time))
                    .single()
                    .map(|dt| dt.timestamp_millis())
            })
            .collect()
    }
}

impl FromStr for WeeklySchedule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for WeeklySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.slots.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(","))
    }
}

impl Serialize for WeeklySchedule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for WeeklySchedule {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Entries of `existing` closer than one minute to `candidate`.
#[must_use]
pub fn conflicts(existing: &[Timestamp], candidate: Timestamp) -> Vec<Timestamp> {
    existing
        .iter()
        .copied()
        .filter(|t| (t - candidate).abs() < SLOT_CONFLICT_WINDOW_MS)
        .collect()
}
