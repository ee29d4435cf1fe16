//! Market-hours gate.
//!
//! A pure predicate over wall-clock time in the exchange timezone, with
//! weekday/window/holiday overrides and force switches for testing.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;

#[derive(Debug, Clone)]
pub struct MarketHours {
    pub tz: Tz,
    pub days: Vec<Weekday>,
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub holidays: HashSet<NaiveDate>,
    pub force_open: bool,
    pub force_closed: bool,
}

impl Default for MarketHours {
    fn default() -> Self {
        Self {
            tz: chrono_tz::Asia::Kolkata,
            days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            open: NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
            close: NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
            holidays: HashSet::new(),
            force_open: false,
            force_closed: false,
        }
    }
}

impl MarketHours {
    /// Open/close bounds are inclusive: 09:15:00 and 15:30:00 both trade.
    pub fn is_open(&self, at: DateTime<Utc>) -> bool {
        if self.force_closed {
            return false;
        }
        if self.force_open {
            return true;
        }
        let local = at.with_timezone(&self.tz);
        if !self.days.contains(&local.weekday()) {
            return false;
        }
        if self.holidays.contains(&local.date_naive()) {
            return false;
        }
        let t = local.time();
        t >= self.open && t <= self.close
    }
}
