use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// First ISO weekday (Monday = 1) that selects the weekend command set.
///
/// Days strictly below this value run the weekday set, so Saturday already
/// belongs to the weekend.
pub const WEEKEND_FROM_ISO_DAY: u32 = 6;

/// Which of the two mutually exclusive command sets a run uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayVariant {
    Weekday,
    Weekend,
}

impl fmt::Display for DayVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DayVariant::Weekday => write!(f, "weekday"),
            DayVariant::Weekend => write!(f, "weekend"),
        }
    }
}

/// Select the variant for a date. The date is always injected, never read
/// from the clock here.
pub fn compute_day_variant(date: NaiveDate) -> DayVariant {
    variant_for_iso_day(date.weekday().number_from_monday())
}

/// Select the variant for an ISO weekday number (1 = Monday .. 7 = Sunday)
pub fn variant_for_iso_day(day: u32) -> DayVariant {
    if day < WEEKEND_FROM_ISO_DAY {
        DayVariant::Weekday
    } else {
        DayVariant::Weekend
    }
}
