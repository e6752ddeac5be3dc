use chrono::NaiveDate;
use chrono_tz::Tz;

use crate::calendar::{day_of_week, day_span, local_instant};
use crate::model::*;

// ── Availability Resolver ─────────────────────────────────────────

/// Working intervals of one schedule owner on `date`, sorted and disjoint.
///
/// Rules for the weekday are applied in definition order: available rules
/// union into the working set, unavailable rules cut it, so a later rule
/// wins where two conflict. Approved time off is subtracted last, clamped to
/// the day. No rule for the weekday means closed.
pub fn working_intervals(
    rules: &[AvailabilityRule],
    time_off: &[TimeOffRequest],
    date: NaiveDate,
    tz: Tz,
) -> Vec<Span> {
    let dow = day_of_week(date);
    let mut free: Vec<Span> = Vec::new();

    for rule in rules.iter().filter(|r| r.day_of_week == dow) {
        let start = local_instant(date, rule.start_time, tz);
        let end = local_instant(date, rule.end_time, tz);
        if start >= end {
            continue; // collapsed by a DST gap
        }
        let span = Span::new(start, end);
        if rule.available {
            free.push(span);
            free.sort_by_key(|s| s.start);
            free = merge_overlapping(&free);
        } else {
            free = subtract_intervals(&free, &[span]);
        }
    }

    if free.is_empty() {
        return free;
    }

    let day = day_span(date, tz);
    let mut blocked: Vec<Span> = time_off
        .iter()
        .filter(|t| t.status == TimeOffStatus::Approved)
        .filter_map(|t| t.span.intersect(&day))
        .collect();
    if !blocked.is_empty() {
        blocked.sort_by_key(|s| s.start);
        free = subtract_intervals(&free, &merge_overlapping(&blocked));
    }
    free
}

/// Candidate slot starts: step by `length` from each interval start,
/// keeping only slots that fit entirely inside the interval.
pub fn slot_spans(intervals: &[Span], length: Ms) -> Vec<Span> {
    let mut out = Vec::new();
    if length <= 0 {
        return out;
    }
    for iv in intervals {
        let mut start = iv.start;
        while start + length <= iv.end {
            out.push(Span::new(start, start + length));
            start += length;
        }
    }
    out
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Remove every part of `base` covered by `to_remove`. Both inputs sorted.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{parse_date, parse_instant};
    use ulid::Ulid;

    const H: Ms = HOUR_MS;
    const M: Ms = MINUTE_MS;

    fn tuesday() -> NaiveDate {
        parse_date("2025-06-10").unwrap()
    }

    fn midnight() -> Ms {
        parse_instant("2025-06-10T00:00:00Z").unwrap()
    }

    fn rule(coach: Ulid, dow: u8, from: &str, to: &str, available: bool) -> AvailabilityRule {
        AvailabilityRule {
            owner: ScheduleOwner::Coach(coach),
            day_of_week: dow,
            start_time: from.parse().unwrap(),
            end_time: to.parse().unwrap(),
            available,
        }
    }

    fn time_off(coach: Ulid, span: Span, status: TimeOffStatus) -> TimeOffRequest {
        TimeOffRequest {
            id: Ulid::new(),
            tenant_id: "t".into(),
            coach_id: coach,
            span,
            notes: None,
            status,
            requested_at: 0,
            reviewed_at: None,
        }
    }

    #[test]
    fn no_rules_means_closed() {
        assert!(working_intervals(&[], &[], tuesday(), Tz::UTC).is_empty());
    }

    #[test]
    fn rules_for_other_days_ignored() {
        let c = Ulid::new();
        let rules = vec![rule(c, 1, "09:00", "17:00", true)];
        assert!(working_intervals(&rules, &[], tuesday(), Tz::UTC).is_empty());
    }

    #[test]
    fn overlapping_rules_are_unioned() {
        let c = Ulid::new();
        let rules = vec![
            rule(c, 2, "09:00", "12:00", true),
            rule(c, 2, "11:00", "14:00", true),
            rule(c, 2, "16:00", "18:00", true),
        ];
        let got = working_intervals(&rules, &[], tuesday(), Tz::UTC);
        let d = midnight();
        assert_eq!(got, vec![Span::new(d + 9 * H, d + 14 * H), Span::new(d + 16 * H, d + 18 * H)]);
    }

    #[test]
    fn later_unavailable_rule_cuts_earlier_window() {
        let c = Ulid::new();
        let rules = vec![
            rule(c, 2, "09:00", "17:00", true),
            rule(c, 2, "12:00", "13:00", false),
        ];
        let got = working_intervals(&rules, &[], tuesday(), Tz::UTC);
        let d = midnight();
        assert_eq!(got, vec![Span::new(d + 9 * H, d + 12 * H), Span::new(d + 13 * H, d + 17 * H)]);
    }

    #[test]
    fn later_available_rule_reopens() {
        let c = Ulid::new();
        let rules = vec![
            rule(c, 2, "09:00", "17:00", true),
            rule(c, 2, "12:00", "13:00", false),
            rule(c, 2, "12:30", "13:00", true),
        ];
        let got = working_intervals(&rules, &[], tuesday(), Tz::UTC);
        let d = midnight();
        assert_eq!(
            got,
            vec![Span::new(d + 9 * H, d + 12 * H), Span::new(d + 12 * H + 30 * M, d + 17 * H)]
        );
    }

    #[test]
    fn multi_day_time_off_truncated_to_queried_day() {
        let c = Ulid::new();
        let rules = vec![rule(c, 2, "09:00", "17:00", true)];
        let d = midnight();
        // Monday 12:00 through Tuesday 11:00.
        let off = vec![time_off(c, Span::new(d - 12 * H, d + 11 * H), TimeOffStatus::Approved)];
        let got = working_intervals(&rules, &off, tuesday(), Tz::UTC);
        assert_eq!(got, vec![Span::new(d + 11 * H, d + 17 * H)]);
    }

    #[test]
    fn pending_and_rejected_time_off_have_no_effect() {
        let c = Ulid::new();
        let rules = vec![rule(c, 2, "09:00", "17:00", true)];
        let d = midnight();
        let off = vec![
            time_off(c, Span::new(d, d + 24 * H), TimeOffStatus::Pending),
            time_off(c, Span::new(d, d + 24 * H), TimeOffStatus::Rejected),
        ];
        let got = working_intervals(&rules, &off, tuesday(), Tz::UTC);
        assert_eq!(got, vec![Span::new(d + 9 * H, d + 17 * H)]);
    }

    #[test]
    fn rules_follow_tenant_timezone() {
        let c = Ulid::new();
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let rules = vec![rule(c, 2, "09:00", "10:00", true)];
        let got = working_intervals(&rules, &[], tuesday(), tz);
        let d = midnight();
        // CEST = UTC+2
        assert_eq!(got, vec![Span::new(d + 7 * H, d + 8 * H)]);
    }

    #[test]
    fn slot_spans_step_and_fit() {
        let iv = vec![Span::new(0, 70 * M), Span::new(100 * M, 140 * M)];
        let slots = slot_spans(&iv, 20 * M);
        let starts: Vec<Ms> = slots.iter().map(|s| s.start / M).collect();
        assert_eq!(starts, vec![0, 20, 40, 100, 120]);
        assert!(slots.iter().all(|s| s.duration_ms() == 20 * M));
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![Span::new(100, 300)];
        let remove = vec![Span::new(150, 200)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![Span::new(100, 150), Span::new(200, 300)]
        );
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Span::new(100, 200)];
        assert!(subtract_intervals(&base, &[Span::new(50, 250)]).is_empty());
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![Span::new(0, 1000)];
        let remove = vec![Span::new(100, 200), Span::new(400, 500), Span::new(800, 900)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300), Span::new(500, 600)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(100, 300), Span::new(500, 600)]);
    }
}
