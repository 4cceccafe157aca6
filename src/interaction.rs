// Per-interaction state.
//
// An interaction is one legitimate device behavior modeled as a state
// machine: states are numbered 0..N-1 with 0 initial, and the generated
// verdict code dispatches on the current state under the interaction's
// mutex. This module owns the pieces that code manipulates: per-policy
// counters, the cached IP resolved from observed DNS, the request
// timeout, and the cron-like activity window.

use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{Datelike, Duration, Months, NaiveDateTime, Timelike};

use crate::nft::DurationInit;

/// Timeout applied when a profile specifies 0.
pub const DEFAULT_TIMEOUT_SECS: f64 = 3600.0;

/// Backstop for the activity-period backward walk.
const MAX_WALK_STEPS: u32 = 512;

/// Packet counter for one policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketCount {
    pub is_initialized: bool,
    pub value: u16,
}

/// Counters attached to one policy of an interaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub packet_count: PacketCount,
    pub duration: DurationInit,
}

// ---------------------------------------------------------------------------
// Activity period
// ---------------------------------------------------------------------------

/// One cron-like field spec: a concrete value or '*'.
type Field = Option<u32>;

/// The four fields of a period string, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PeriodFields {
    minute: Field,
    hour: Field,
    day: Field,
    weekday: Field, // 0 = Sunday
}

impl PeriodFields {
    /// Parse "30 8 * 1"-style strings. '*' is a wildcard; how a wildcard
    /// contributes depends on whether this is a start or a duration spec,
    /// which the callers decide.
    fn parse(spec: &str) -> Option<Self> {
        let mut fields = [None; 4];
        let mut count = 0;
        for (i, token) in spec.split_whitespace().enumerate() {
            if i >= 4 {
                break;
            }
            if token != "*" {
                fields[i] = Some(token.parse().ok()?);
            }
            count = i + 1;
        }
        if count < 4 {
            return None;
        }
        Some(Self {
            minute: fields[0],
            hour: fields[1],
            day: fields[2],
            weekday: fields[3],
        })
    }
}

/// A policy's activity window: the interval [start, start + duration),
/// where start is the most recent trigger of the cron-like start spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityPeriod {
    start: PeriodFields,
    duration: PeriodFields,
}

impl ActivityPeriod {
    /// Build from a start and a duration spec. Returns `None` (logged) if
    /// either string is not four space-separated integer-or-'*' fields.
    pub fn new(start: &str, duration: &str) -> Option<Self> {
        match (PeriodFields::parse(start), PeriodFields::parse(duration)) {
            (Some(s), Some(d)) => Some(Self {
                start: s,
                duration: d,
            }),
            _ => {
                log::warn!("invalid activity period: start={start:?} duration={duration:?}");
                None
            }
        }
    }

    /// The most recent instant at or before `now` matching the start spec.
    ///
    /// Walks backward from `now`: the most significant fixed field is
    /// decremented until the candidate is not in the future and matches
    /// the day-of-week constraint; wildcard fields less significant than a
    /// moved fixed field are then pulled to their maxima (59 minutes,
    /// 23 hours) so the trigger is the greatest lower bound.
    pub fn previous_trigger(&self, now: NaiveDateTime) -> NaiveDateTime {
        let spec = &self.start;
        let mut candidate = now.with_second(0).unwrap_or(now);
        if let Some(m) = spec.minute {
            candidate = candidate.with_minute(m.min(59)).unwrap_or(candidate);
        }
        if let Some(h) = spec.hour {
            candidate = candidate.with_hour(h.min(23)).unwrap_or(candidate);
        }
        if let Some(d) = spec.day {
            candidate = apply_day_of_month(candidate, d);
        }

        let mut steps = 0;
        while candidate > now || !matches_weekday(spec.weekday, candidate) {
            steps += 1;
            if steps > MAX_WALK_STEPS {
                log::warn!("activity-period walk did not converge for {spec:?}");
                break;
            }
            if let Some(d) = spec.day {
                // Step to the previous month, then re-seat the fixed day
                // (skipping months too short for it).
                candidate = match candidate
                    .with_day(1)
                    .and_then(|c| c.checked_sub_months(Months::new(1)))
                {
                    Some(c) => apply_day_of_month(c, d),
                    None => break,
                };
            } else if spec.weekday.is_some() || spec.hour.is_some() {
                candidate = candidate - Duration::days(1);
            } else if spec.minute.is_some() {
                candidate = candidate - Duration::hours(1);
            } else {
                // All wildcards: the truncated-to-minute now is the trigger.
                break;
            }
        }

        // Pull wildcard subfields to their maxima when a more significant
        // fixed field moved the candidate off the current period.
        let crossed_hour = spec.hour.is_some() && candidate.hour() != now.hour();
        let crossed_day = (spec.day.is_some() && candidate.day() != now.day())
            || (spec.weekday.is_some() && candidate.weekday() != now.weekday());
        if crossed_day {
            if spec.hour.is_none() {
                candidate = candidate.with_hour(23).unwrap_or(candidate);
            }
            if spec.minute.is_none() {
                candidate = candidate.with_minute(59).unwrap_or(candidate);
            }
        } else if crossed_hour && spec.minute.is_none() {
            candidate = candidate.with_minute(59).unwrap_or(candidate);
        }

        candidate
    }

    /// Length of the window in seconds. Wildcard duration fields count as
    /// zero; the day-of-week slot has no duration meaning and is ignored.
    fn duration_secs(&self) -> i64 {
        let d = &self.duration;
        i64::from(d.minute.unwrap_or(0)) * 60
            + i64::from(d.hour.unwrap_or(0)) * 3600
            + i64::from(d.day.unwrap_or(0)) * 86400
    }

    /// Whether `now` falls inside [start, start + duration).
    pub fn is_in_period(&self, now: NaiveDateTime) -> bool {
        let start = self.previous_trigger(now);
        let end = start + Duration::seconds(self.duration_secs());
        start <= now && now < end
    }
}

fn matches_weekday(field: Field, t: NaiveDateTime) -> bool {
    match field {
        Some(wd) => t.weekday().num_days_from_sunday() == wd,
        None => true,
    }
}

/// Set the day-of-month, stepping back a month while the day does not
/// exist there (e.g. day 31 in April).
fn apply_day_of_month(mut candidate: NaiveDateTime, day: u32) -> NaiveDateTime {
    for _ in 0..48 {
        if let Some(c) = candidate.with_day(day) {
            return c;
        }
        candidate = match candidate
            .with_day(1)
            .and_then(|c| c.checked_sub_months(Months::new(1)))
        {
            Some(c) => c,
            None => return candidate,
        };
    }
    candidate
}

// ---------------------------------------------------------------------------
// Timeout gate
// ---------------------------------------------------------------------------

/// Whether a request at `last_request` (unix seconds, 0 = none yet) has
/// timed out by `now` under `threshold` seconds.
///
/// A zero threshold means the 3600 s default; a negative threshold
/// disables the gate entirely.
pub fn is_timed_out_at(threshold: f64, last_request: i64, now: i64) -> bool {
    if last_request == 0 || threshold < 0.0 {
        return false;
    }
    let threshold = if threshold == 0.0 {
        DEFAULT_TIMEOUT_SECS
    } else {
        threshold
    };
    (now - last_request) as f64 > threshold
}

/// [`is_timed_out_at`] against the wall clock.
pub fn is_timed_out(threshold: f64, last_request: i64) -> bool {
    is_timed_out_at(threshold, last_request, unix_now())
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Interaction data
// ---------------------------------------------------------------------------

/// Mutable half of an interaction, guarded by the interaction mutex.
#[derive(Debug)]
pub struct InteractionState {
    /// Always within [0, num_states).
    pub current_state: u8,
    /// One per policy.
    pub counters: Vec<Counters>,
    /// The address the interaction's symbolic destination resolved to,
    /// written when a policy observes the DNS response.
    pub cached_ip: Option<IpAddr>,
    /// Unix seconds of the last request; 0 = none yet.
    pub last_request: i64,
    /// Unix seconds, refreshed by the callback on each packet.
    pub current_time: i64,
    /// True while the interaction sits in a looping state group.
    pub in_loop: bool,
}

/// Shared data for one queued interaction. The immutable shape lives on
/// the struct; everything the verdict code mutates is inside the mutex.
#[derive(Debug)]
pub struct InteractionData {
    pub queue_id_base: u16,
    pub num_policies: u8,
    pub num_states: u8,
    /// Seconds; 0 = default (3600), negative = disabled.
    pub timeout: f64,
    pub activity_period: Option<ActivityPeriod>,
    state: Mutex<InteractionState>,
}

impl InteractionData {
    pub fn new(
        queue_id_base: u16,
        num_policies: u8,
        num_states: u8,
        timeout: f64,
        activity_period: Option<ActivityPeriod>,
    ) -> Self {
        Self {
            queue_id_base,
            num_policies,
            num_states,
            timeout,
            activity_period,
            state: Mutex::new(InteractionState {
                current_state: 0,
                counters: vec![Counters::default(); num_policies as usize],
                cached_ip: None,
                last_request: 0,
                current_time: 0,
                in_loop: false,
            }),
        }
    }

    /// Lock the mutable state. A poisoned mutex yields the inner state:
    /// a panicking worker must not wedge every later packet into the
    /// default verdict.
    pub fn lock(&self) -> MutexGuard<'_, InteractionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Advance to the next state, wrapping back to 0 after the last.
    /// Returns the new state.
    pub fn advance_state(&self) -> u8 {
        let mut state = self.lock();
        state.current_state = (state.current_state + 1) % self.num_states.max(1);
        state.current_state
    }

    /// Record a packet matched by `policy`: bump its packet count and
    /// start its duration measurement on the first match.
    pub fn record_match(&self, policy: usize) {
        let mut state = self.lock();
        if let Some(c) = state.counters.get_mut(policy) {
            c.packet_count.is_initialized = true;
            c.packet_count.value = c.packet_count.value.wrapping_add(1);
            if !c.duration.is_initialized {
                c.duration = DurationInit::start_now();
            }
        }
    }

    /// Whether the time since the last recorded request exceeds this
    /// interaction's timeout. Refreshes `current_time`.
    pub fn request_timed_out(&self) -> bool {
        let mut state = self.lock();
        state.current_time = unix_now();
        is_timed_out_at(self.timeout, state.last_request, state.current_time)
    }

    /// Whether the wall clock is inside the activity period; true when no
    /// period is configured.
    pub fn in_activity_period(&self, now: NaiveDateTime) -> bool {
        match &self.activity_period {
            Some(period) => period.is_in_period(now),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::net::Ipv4Addr;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    // -----------------------------------------------------------------------
    // Activity period
    // -----------------------------------------------------------------------

    #[test]
    fn parse_rejects_bad_specs() {
        assert!(ActivityPeriod::new("0 9 * *", "0 1 * *").is_some());
        assert!(ActivityPeriod::new("0 9 *", "0 1 * *").is_none()); // 3 fields
        assert!(ActivityPeriod::new("a 9 * *", "0 1 * *").is_none());
        assert!(ActivityPeriod::new("", "0 1 * *").is_none());
    }

    #[test]
    fn daily_window_gate() {
        // 09:00 + one hour, any day.
        let period = ActivityPeriod::new("0 9 * *", "0 1 * *").unwrap();
        assert!(period.is_in_period(at(2024, 5, 15, 9, 30)));
        assert!(period.is_in_period(at(2024, 5, 15, 9, 0)));
        assert!(!period.is_in_period(at(2024, 5, 15, 10, 30)));
        assert!(!period.is_in_period(at(2024, 5, 15, 10, 0))); // end exclusive
        assert!(!period.is_in_period(at(2024, 5, 15, 8, 59)));
    }

    #[test]
    fn daily_trigger_before_start_is_yesterday() {
        let period = ActivityPeriod::new("0 9 * *", "0 1 * *").unwrap();
        let trigger = period.previous_trigger(at(2024, 5, 15, 8, 59));
        assert_eq!(trigger, at(2024, 5, 14, 9, 0));
    }

    #[test]
    fn weekday_constrained_window() {
        // Wednesdays 09:00-10:00. 2024-05-15 is a Wednesday.
        let period = ActivityPeriod::new("0 9 * 3", "0 1 * *").unwrap();
        assert!(period.is_in_period(at(2024, 5, 15, 9, 30)));
        // Thursday: last trigger was Wednesday, window long gone.
        assert!(!period.is_in_period(at(2024, 5, 16, 9, 30)));
        let trigger = period.previous_trigger(at(2024, 5, 16, 9, 30));
        assert_eq!(trigger, at(2024, 5, 15, 9, 0));
    }

    #[test]
    fn day_of_month_trigger() {
        // 08:30 on the 1st of the month, one-day window.
        let period = ActivityPeriod::new("30 8 1 *", "0 0 1 *").unwrap();
        let trigger = period.previous_trigger(at(2024, 5, 15, 12, 0));
        assert_eq!(trigger, at(2024, 5, 1, 8, 30));
        assert!(!period.is_in_period(at(2024, 5, 15, 12, 0)));
        assert!(period.is_in_period(at(2024, 5, 1, 12, 0)));
    }

    #[test]
    fn wildcard_minute_pulled_to_59_after_hour_step() {
        // Start: any minute of hour 9. At 10:15 the previous trigger is
        // the last matching minute of the nine-o'clock hour.
        let period = ActivityPeriod::new("* 9 * *", "30 0 * *").unwrap();
        let trigger = period.previous_trigger(at(2024, 5, 15, 10, 15));
        assert_eq!(trigger, at(2024, 5, 15, 9, 59));
        // Inside hour 9 the wildcard minute matches "now".
        let trigger = period.previous_trigger(at(2024, 5, 15, 9, 15));
        assert_eq!(trigger, at(2024, 5, 15, 9, 15));
    }

    #[test]
    fn all_wildcard_start_triggers_now() {
        let period = ActivityPeriod::new("* * * *", "1 0 * *").unwrap();
        let now = at(2024, 5, 15, 13, 37);
        assert_eq!(period.previous_trigger(now), now);
        assert!(period.is_in_period(now));
    }

    #[test]
    fn zero_duration_is_never_active() {
        let period = ActivityPeriod::new("0 9 * *", "* * * *").unwrap();
        assert!(!period.is_in_period(at(2024, 5, 15, 9, 0)));
    }

    #[test]
    fn day_31_steps_to_a_month_that_has_one() {
        let period = ActivityPeriod::new("0 12 31 *", "0 1 * *").unwrap();
        // May 1st: April has no 31st, so the trigger is March 31st.
        let trigger = period.previous_trigger(at(2024, 5, 1, 0, 0));
        assert_eq!(trigger, at(2024, 3, 31, 12, 0));
    }

    // -----------------------------------------------------------------------
    // Timeout gate
    // -----------------------------------------------------------------------

    #[test]
    fn timeout_gate_basic() {
        let now = 1_700_000_000;
        assert!(is_timed_out_at(30.0, now - 31, now));
        assert!(!is_timed_out_at(30.0, now - 30, now)); // boundary: not strictly greater
        assert!(!is_timed_out_at(30.0, now - 5, now));
    }

    #[test]
    fn timeout_zero_uses_default() {
        let now = 1_700_000_000;
        assert!(!is_timed_out_at(0.0, now - 3600, now));
        assert!(is_timed_out_at(0.0, now - 3601, now));
    }

    #[test]
    fn timeout_negative_disables() {
        let now = 1_700_000_000;
        assert!(!is_timed_out_at(-1.0, now - 1_000_000, now));
    }

    #[test]
    fn timeout_ignores_first_request() {
        assert!(!is_timed_out_at(30.0, 0, 1_700_000_000));
    }

    // -----------------------------------------------------------------------
    // Interaction data
    // -----------------------------------------------------------------------

    #[test]
    fn state_advances_and_wraps() {
        let data = InteractionData::new(100, 2, 3, 0.0, None);
        assert_eq!(data.lock().current_state, 0);
        assert_eq!(data.advance_state(), 1);
        assert_eq!(data.advance_state(), 2);
        assert_eq!(data.advance_state(), 0);
    }

    #[test]
    fn record_match_counts_and_starts_duration() {
        let data = InteractionData::new(100, 2, 2, 0.0, None);
        data.record_match(1);
        data.record_match(1);
        let state = data.lock();
        assert!(!state.counters[0].packet_count.is_initialized);
        assert_eq!(state.counters[1].packet_count.value, 2);
        assert!(state.counters[1].duration.is_initialized);
    }

    #[test]
    fn record_match_out_of_range_is_ignored() {
        let data = InteractionData::new(100, 1, 1, 0.0, None);
        data.record_match(7);
        assert_eq!(data.lock().counters[0].packet_count.value, 0);
    }

    #[test]
    fn cached_ip_updates_under_lock() {
        let data = InteractionData::new(100, 1, 2, 0.0, None);
        {
            let mut state = data.lock();
            state.cached_ip = Some(IpAddr::V4(Ipv4Addr::new(20, 47, 97, 231)));
        }
        assert_eq!(
            data.lock().cached_ip,
            Some(IpAddr::V4(Ipv4Addr::new(20, 47, 97, 231)))
        );
    }

    #[test]
    fn request_timeout_via_interaction() {
        let data = InteractionData::new(100, 1, 1, 10.0, None);
        assert!(!data.request_timed_out()); // no request yet
        data.lock().last_request = unix_now() - 60;
        assert!(data.request_timed_out());
        data.lock().last_request = unix_now();
        assert!(!data.request_timed_out());
    }
}
