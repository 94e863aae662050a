use std::{str::FromStr, time::Duration as StdDuration};

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::{ProcflowError, Result, model::EventTrigger, utils};

/// What to do with a fire time that passed while the scheduler was not running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    #[default]
    FireNow,
    /// Skip to the next fire time. One-shot triggers have none and fire anyway.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    OneShot {
        name: String,
        start_at: DateTime<Utc>,
        #[serde(default)]
        misfire: MisfirePolicy,
    },
    /// Cron expression with a leading seconds field, e.g. `0 */5 * * * *`.
    Cron {
        name: String,
        expression: String,
        #[serde(default)]
        misfire: MisfirePolicy,
    },
}

impl Trigger {
    pub fn one_shot(
        name: &str,
        start_at: DateTime<Utc>,
    ) -> Self {
        Trigger::OneShot {
            name: name.to_string(),
            start_at,
            misfire: MisfirePolicy::default(),
        }
    }

    pub fn cron(
        name: &str,
        expression: &str,
    ) -> Result<Self> {
        Self::validate_cron(expression)?;
        Ok(Trigger::Cron {
            name: name.to_string(),
            expression: expression.to_string(),
            misfire: MisfirePolicy::default(),
        })
    }

    pub fn with_misfire(
        mut self,
        policy: MisfirePolicy,
    ) -> Self {
        match &mut self {
            Trigger::OneShot {
                misfire, ..
            }
            | Trigger::Cron {
                misfire, ..
            } => *misfire = policy,
        }
        self
    }

    /// Schedule of a timer event: a duration or a date gives a one-shot trigger, a cycle a
    /// cron trigger.
    pub fn from_timer(
        name: &str,
        timer: &EventTrigger,
    ) -> Result<Self> {
        match timer {
            EventTrigger::Timer {
                duration_ms: Some(ms),
                ..
            } => Ok(Self::one_shot(name, utils::time::after(StdDuration::from_millis(*ms)))),
            EventTrigger::Timer {
                date: Some(date),
                ..
            } => Ok(Self::one_shot(name, *date)),
            EventTrigger::Timer {
                cycle: Some(cycle),
                ..
            } => Self::cron(name, cycle),
            EventTrigger::Timer {
                ..
            } => Err(ProcflowError::Definition(format!("timer '{}' has no duration, date or cycle", name))),
            _ => Err(ProcflowError::Definition(format!("trigger of '{}' is not a timer", name))),
        }
    }

    pub fn validate_cron(expression: &str) -> Result<()> {
        Schedule::from_str(expression)?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        match self {
            Trigger::OneShot {
                name, ..
            }
            | Trigger::Cron {
                name, ..
            } => name,
        }
    }

    pub fn misfire(&self) -> MisfirePolicy {
        match self {
            Trigger::OneShot {
                misfire, ..
            }
            | Trigger::Cron {
                misfire, ..
            } => *misfire,
        }
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, Trigger::OneShot { .. })
    }

    pub fn first_fire_time(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        match self {
            Trigger::OneShot {
                start_at, ..
            } => Ok(Some(*start_at)),
            Trigger::Cron {
                expression, ..
            } => Ok(Schedule::from_str(expression)?.after(&now).next()),
        }
    }

    /// Fire time following `after`; one-shot triggers never fire again.
    pub fn next_fire_time(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        match self {
            Trigger::OneShot {
                ..
            } => Ok(None),
            Trigger::Cron {
                expression, ..
            } => Ok(Schedule::from_str(expression)?.after(&after).next()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    #[test]
    fn test_cron_fire_times() {
        let trigger = Trigger::cron("every-minute", "0 * * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 30).unwrap();
        let first = trigger.first_fire_time(now).unwrap().unwrap();
        assert_eq!(first, Utc.with_ymd_and_hms(2024, 1, 1, 10, 1, 0).unwrap());
        let next = trigger.next_fire_time(first).unwrap().unwrap();
        assert_eq!(next - first, Duration::minutes(1));
    }

    #[test]
    fn test_one_shot_fires_once() {
        let at = Utc::now();
        let trigger = Trigger::one_shot("t", at).with_misfire(MisfirePolicy::Skip);
        assert_eq!(trigger.first_fire_time(at).unwrap(), Some(at));
        assert_eq!(trigger.next_fire_time(at).unwrap(), None);
        assert_eq!(trigger.misfire(), MisfirePolicy::Skip);
        assert_eq!(trigger.name(), "t");
    }

    #[test]
    fn test_from_timer() {
        let timer = EventTrigger::Timer {
            duration_ms: Some(60_000),
            date: None,
            cycle: None,
        };
        let trigger = Trigger::from_timer("timer-1", &timer).unwrap();
        assert!(trigger.is_one_shot());
        assert_eq!(trigger.name(), "timer-1");

        let cycle = EventTrigger::Timer {
            duration_ms: None,
            date: None,
            cycle: Some("0 0 * * * *".to_string()),
        };
        assert!(!Trigger::from_timer("timer-2", &cycle).unwrap().is_one_shot());

        let empty = EventTrigger::Timer {
            duration_ms: None,
            date: None,
            cycle: None,
        };
        assert!(matches!(Trigger::from_timer("timer-3", &empty), Err(ProcflowError::Definition(_))));
        let signal = EventTrigger::Signal {
            name: "go".to_string(),
        };
        assert!(Trigger::from_timer("timer-4", &signal).is_err());
    }

    #[test]
    fn test_invalid_cron_is_rejected() {
        assert!(Trigger::cron("bad", "every day").is_err());
        assert!(Trigger::validate_cron("0 0 12 * * MON-FRI").is_ok());
    }
}
