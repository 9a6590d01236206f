use super::{Schedule, ScheduleError, ScheduleOptions};
use crate::scheduler::Scheduler;
use chrono::{DateTime, Duration, LocalResult, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

// Bounds the number of calendar candidates inspected while skipping a DST
// gap; a gap is at most a couple of hours, so even a once-a-second
// expression stays well under this.
const SCAN_LIMIT: usize = 10_000;

/// Fires on a cron expression, evaluated in the zone of `last`.
///
/// The `cron` crate supplies expression parsing and calendar iteration;
/// iteration runs on the naive local timeline (anchored through UTC, which
/// has no transitions) and each candidate is mapped back into the zone
/// here. A candidate falling into a DST gap is skipped. A candidate in a
/// repeated interval resolves to the earliest instant strictly after
/// `last`, and when the clock falls back between `last` and the candidate
/// the repeated interval is re-scanned, so an occurrence in the repeated
/// span fires on both passes.
pub struct Cron {
    name: String,
    options: ScheduleOptions,
    schedule: cron::Schedule,
}

impl Cron {
    /// Parses `expr`; a malformed expression fails here, never inside the
    /// engine.
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        Self::parse_with_options(expr, ScheduleOptions::empty())
    }

    pub fn parse_with_options(expr: &str, options: ScheduleOptions) -> Result<Self, ScheduleError> {
        let schedule = cron::Schedule::from_str(expr).map_err(ScheduleError::Cron)?;
        Ok(Self {
            name: "cron".to_owned(),
            options,
            schedule,
        })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The next occurrence on the local calendar after `last`, mapped into
    /// `zone`. Gap candidates are skipped; ambiguous candidates resolve to
    /// the earliest instant strictly after `last`.
    fn next_local(&self, zone: Tz, last: DateTime<Tz>) -> Option<DateTime<Tz>> {
        let anchor = Utc.from_utc_datetime(&last.naive_local());
        let mut candidates = self.schedule.after(&anchor);
        for _ in 0..SCAN_LIMIT {
            let naive = candidates.next()?.naive_utc();
            match zone.from_local_datetime(&naive) {
                LocalResult::Single(candidate) => {
                    if candidate > last {
                        return Some(candidate);
                    }
                }
                LocalResult::Ambiguous(a, b) => {
                    let (first, second) = if a < b { (a, b) } else { (b, a) };
                    if first > last {
                        return Some(first);
                    }
                    if second > last {
                        return Some(second);
                    }
                }
                LocalResult::None => {}
            }
        }
        None
    }

    /// An occurrence the naive scan cannot see: when the clock fell back
    /// between `last` and `candidate`, local times before `last`'s wall
    /// clock recur, and the earliest of them may precede `candidate` on
    /// the instant axis.
    fn repeated_interval_occurrence(
        &self,
        zone: Tz,
        last: DateTime<Tz>,
        candidate: DateTime<Tz>,
    ) -> Option<DateTime<Tz>> {
        let fold = find_backward_transition(zone, last.with_timezone(&Utc), candidate.with_timezone(&Utc))?;
        let reentry = fold.with_timezone(&zone).naive_local();
        let anchor = Utc.from_utc_datetime(&(reentry - Duration::nanoseconds(1)));
        let naive = self.schedule.after(&anchor).next()?.naive_utc();
        if let LocalResult::Ambiguous(a, b) = zone.from_local_datetime(&naive) {
            let second_pass = if a < b { b } else { a };
            if second_pass > last && second_pass < candidate {
                return Some(second_pass);
            }
        }
        None
    }
}

impl Schedule for Cron {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> ScheduleOptions {
        self.options
    }

    fn next(&self, _scheduler: &Scheduler, last: DateTime<Tz>) -> Option<DateTime<Tz>> {
        let zone = last.timezone();
        let candidate = self.next_local(zone, last)?;
        if offset_seconds(zone, candidate.with_timezone(&Utc))
            < offset_seconds(zone, last.with_timezone(&Utc))
        {
            if let Some(repeated) = self.repeated_interval_occurrence(zone, last, candidate) {
                return Some(repeated);
            }
        }
        Some(candidate)
    }
}

fn offset_seconds(zone: Tz, at: DateTime<Utc>) -> i32 {
    zone.offset_from_utc_datetime(&at.naive_utc())
        .fix()
        .local_minus_utc()
}

/// The first instant in `(lo, hi]` at which `zone`'s UTC offset differs
/// from its offset at `lo`, by bisection. Callers only invoke this when
/// the endpoint offsets differ, so the search always converges.
fn find_backward_transition(zone: Tz, lo: DateTime<Utc>, hi: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let lo_offset = offset_seconds(zone, lo);
    if offset_seconds(zone, hi) == lo_offset {
        return None;
    }
    let (mut lo, mut hi) = (lo, hi);
    while hi - lo > Duration::nanoseconds(1) {
        let mid = lo + (hi - lo) / 2;
        if offset_seconds(zone, mid) == lo_offset {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Some(hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Scheduler;
    use chrono::NaiveDate;

    const LORD_HOWE: Tz = Tz::Australia__Lord_Howe;

    fn local(
        zone: Tz,
        (y, mo, d): (i32, u32, u32),
        (h, mi, s): (u32, u32, u32),
    ) -> DateTime<Tz> {
        zone.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn local_earliest(
        zone: Tz,
        (y, mo, d): (i32, u32, u32),
        (h, mi, s): (u32, u32, u32),
    ) -> DateTime<Tz> {
        let naive = NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap();
        zone.from_local_datetime(&naive).earliest().unwrap()
    }

    #[tokio::test]
    async fn plain_advance_within_one_offset() {
        let scheduler = Scheduler::new();
        let cron = Cron::parse("0 */30 * * * *").unwrap();
        let last = local(Tz::UTC, (2023, 1, 1), (10, 5, 0));
        let next = cron.next(&scheduler, last).unwrap();
        assert_eq!(next, local(Tz::UTC, (2023, 1, 1), (10, 30, 0)));
        assert_eq!(next.timezone(), Tz::UTC);
    }

    #[tokio::test]
    async fn occurrence_at_last_is_excluded() {
        let scheduler = Scheduler::new();
        let cron = Cron::parse("0 */30 * * * *").unwrap();
        let last = local(Tz::UTC, (2023, 1, 1), (10, 30, 0));
        let next = cron.next(&scheduler, last).unwrap();
        assert_eq!(next, local(Tz::UTC, (2023, 1, 1), (11, 0, 0)));
    }

    #[tokio::test]
    async fn result_is_anchored_to_the_zone_of_last() {
        let scheduler = Scheduler::new();
        let cron = Cron::parse("0 0 12 * * *").unwrap();
        let last = local(Tz::America__Chicago, (2023, 6, 1), (13, 0, 0));
        let next = cron.next(&scheduler, last).unwrap();
        assert_eq!(next.timezone(), Tz::America__Chicago);
        assert_eq!(next, local(Tz::America__Chicago, (2023, 6, 2), (12, 0, 0)));
    }

    // Lord Howe Island springs forward 2017-10-01: at 02:00 +10:30 the
    // clock jumps to 02:30 +11:00, so local times in [02:00, 02:30) do
    // not exist that morning.
    #[tokio::test]
    async fn dst_forward_jump_skips_the_gap() {
        let scheduler = Scheduler::new();
        let cron = Cron::parse("0 */30 * * * *").unwrap();
        let last = local(LORD_HOWE, (2017, 10, 1), (1, 45, 0));
        let next = cron.next(&scheduler, last).unwrap();

        let expected = local(LORD_HOWE, (2017, 10, 1), (2, 30, 0));
        assert_eq!(next, expected);
        assert_eq!(next.offset().fix().local_minus_utc(), 11 * 3600);
    }

    // Lord Howe Island falls back 2017-04-02: at 02:00 +11:00 the clock
    // returns to 01:30 +10:30, so the half-hour [01:30, 02:00) occurs
    // twice.
    #[tokio::test]
    async fn dst_backward_jump_first_pass_resolves_to_the_earlier_offset() {
        let scheduler = Scheduler::new();
        let cron = Cron::parse("0 */30 * * * *").unwrap();
        let last = local(LORD_HOWE, (2017, 4, 2), (1, 29, 59));
        let next = cron.next(&scheduler, last).unwrap();

        let expected = local_earliest(LORD_HOWE, (2017, 4, 2), (1, 30, 0));
        assert_eq!(next, expected);
        assert_eq!(next.offset().fix().local_minus_utc(), 11 * 3600);
    }

    #[tokio::test]
    async fn dst_backward_jump_fires_the_repeated_half_hour_twice() {
        let scheduler = Scheduler::new();
        let cron = Cron::parse("0 */30 * * * *").unwrap();
        let last = local_earliest(LORD_HOWE, (2017, 4, 2), (1, 59, 0));
        let next = cron.next(&scheduler, last).unwrap();

        // 01:30 again, this time on standard time: 2017-04-01T15:00:00Z.
        assert_eq!(next.offset().fix().local_minus_utc(), 10 * 3600 + 1800);
        assert_eq!(
            next.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2017, 4, 1, 15, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn malformed_expression_fails_at_parse_time() {
        assert!(matches!(
            Cron::parse("not a cron"),
            Err(ScheduleError::Cron(_))
        ));
    }

    #[test]
    fn backward_transition_bisection_finds_the_fold() {
        // 2017-04-02 02:00 +11:00 == 2017-04-01T15:00:00Z.
        let lo = Utc.with_ymd_and_hms(2017, 4, 1, 12, 0, 0).unwrap();
        let hi = Utc.with_ymd_and_hms(2017, 4, 1, 18, 0, 0).unwrap();
        let fold = find_backward_transition(LORD_HOWE, lo, hi).unwrap();
        assert_eq!(fold, Utc.with_ymd_and_hms(2017, 4, 1, 15, 0, 0).unwrap());
    }

    #[test]
    fn no_transition_means_no_fold() {
        let lo = Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap();
        let hi = Utc.with_ymd_and_hms(2017, 1, 2, 0, 0, 0).unwrap();
        assert_eq!(find_backward_transition(LORD_HOWE, lo, hi), None);
    }
}
