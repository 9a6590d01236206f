use super::ScheduleOptions;
use chrono::{DateTime, LocalResult, TimeZone};
use chrono_tz::Tz;

const NANOS_PER_SECOND: i128 = 1_000_000_000;

/// Applies a schedule's alignment flags to a computed due time: the
/// timestamp is rounded up to the next boundary of the coarsest alignment
/// flag set, on the instant axis (nanoseconds since the Unix epoch), then
/// re-anchored to its original zone. A timestamp already on the boundary
/// is returned unchanged, which also makes the operation idempotent.
pub fn apply_options(ts: Option<DateTime<Tz>>, options: ScheduleOptions) -> Option<DateTime<Tz>> {
    let ts = ts?;
    match options.alignment_nanos() {
        Some(boundary) => Some(align_up(ts, boundary)),
        None => Some(ts),
    }
}

fn align_up(ts: DateTime<Tz>, boundary: i128) -> DateTime<Tz> {
    let nanos =
        i128::from(ts.timestamp()) * NANOS_PER_SECOND + i128::from(ts.timestamp_subsec_nanos());
    let rem = nanos.rem_euclid(boundary);
    if rem == 0 {
        return ts;
    }
    let rounded = nanos - rem + boundary;
    let secs = (rounded.div_euclid(NANOS_PER_SECOND)) as i64;
    let nsecs = (rounded.rem_euclid(NANOS_PER_SECOND)) as u32;
    match ts.timezone().timestamp_opt(secs, nsecs) {
        LocalResult::Single(aligned) => aligned,
        // Rounding pushed the instant out of the representable range.
        _ => ts,
    }
}
