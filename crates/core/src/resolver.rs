//! Turns the invocation mode into the date to ingest and the blob prefix for it.

use crate::domain::TargetDate;
use crate::error::{IngestError, IngestResult};
use crate::utils::parse_strict_date;
use chrono::{Local, NaiveDate, Utc};

/// Source of "today". Chosen once at startup so a run never straddles two clocks.
pub trait Clock {
    fn today(&self) -> NaiveDate;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock {
    local: bool,
}

impl SystemClock {
    pub fn utc() -> Self {
        Self { local: false }
    }

    pub fn local() -> Self {
        Self { local: true }
    }
}

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        if self.local {
            Local::now().date_naive()
        } else {
            Utc::now().date_naive()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Process the previous calendar day
    Auto,
    /// Process an operator supplied `YYYY-MM-DD` date
    Manual(String),
}

pub fn resolve_target_date(mode: &RunMode, clock: &dyn Clock) -> IngestResult<TargetDate> {
    match mode {
        RunMode::Auto => {
            let today = clock.today();
            today
                .pred_opt()
                .map(TargetDate::new)
                .ok_or_else(|| IngestError::InvalidDateFormat {
                    input: today.to_string(),
                })
        }
        RunMode::Manual(input) => parse_strict_date(input)
            .map(TargetDate::new)
            .ok_or_else(|| IngestError::InvalidDateFormat {
                input: input.clone(),
            }),
    }
}

/// Renders a prefix template such as `transactions_{date}_` for a date
pub fn blob_prefix(template: &str, date: &TargetDate) -> String {
    template.replace("{date}", &date.to_string())
}
