//! Daily online-time accounting.
//!
//! [`PresenceState::fold`] folds one probe observation into the running
//! total for the current local calendar day.

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::probe::Observation;

/// Accumulator state for one tracked device. Persisted after every fold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceState {
    pub is_online: bool,
    pub last_checked_at: Option<NaiveDateTime>,
    pub online_minutes: u64,
    pub current_day: NaiveDate,
}

impl PresenceState {
    /// A state with nothing observed yet on `today`.
    pub fn new(today: NaiveDate) -> Self {
        Self {
            is_online: false,
            last_checked_at: None,
            online_minutes: 0,
            current_day: today,
        }
    }

    /// Decide what survives a restart.
    ///
    /// A record from an earlier day is dropped in favor of a fresh state. A
    /// same-day record keeps its minutes but comes back offline: nothing was
    /// observed while the process was down, so the first check after the
    /// restart must not credit that gap.
    pub fn restore(stored: Option<PresenceState>, today: NaiveDate) -> Self {
        match stored {
            Some(state) if state.current_day == today => Self {
                is_online: false,
                ..state
            },
            Some(state) => {
                tracing::info!(
                    "Discarding presence record from {} (today is {})",
                    state.current_day,
                    today
                );
                Self::new(today)
            }
            None => Self::new(today),
        }
    }

    /// Fold a new observation into the state.
    ///
    /// Time is credited only for intervals that start and end with an
    /// online reading. A day change resets the counter before anything else
    /// and opens a fresh window, so an interval spanning midnight is not
    /// credited to either day.
    pub fn fold(&mut self, is_online: bool, now: NaiveDateTime) {
        let today = now.date();
        let rolled_over = today != self.current_day;
        if rolled_over {
            self.online_minutes = 0;
            self.current_day = today;
        }

        if !rolled_over && self.is_online && is_online {
            if let Some(last) = self.last_checked_at {
                let elapsed_secs = (now - last).num_milliseconds().max(0) as f64 / 1000.0;
                let total = self.online_minutes as f64 + elapsed_secs / 60.0;
                self.online_minutes = total.round() as u64;
            }
        }

        self.is_online = is_online;
        self.last_checked_at = Some(now);
    }

    /// Fold a probe result.
    pub fn observe(&mut self, observation: Observation) {
        self.fold(observation.is_online, observation.checked_at);
    }

    /// The consumer-facing view of this state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            is_online: self.is_online,
            online_minutes: self.online_minutes,
            last_checked_at: self.last_checked_at,
        }
    }
}

/// What consumers get to see of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Snapshot {
    pub is_online: bool,
    pub online_minutes: u64,
    pub last_checked_at: Option<NaiveDateTime>,
}
