use chrono::{Datelike, Days, NaiveDate};

pub fn next_day(date: NaiveDate) -> Option<NaiveDate> {
    date.checked_add_days(Days::new(1))
}

pub fn months_between(start: NaiveDate, end: NaiveDate) -> i32 {
    let year_diff = end.year() - start.year();
    let month_diff = end.month() as i32 - start.month() as i32;
    year_diff * 12 + month_diff
}

/// Roughly twelve months, allowing for 52/53-week fiscal calendars that end
/// on a weekday rather than a month end.
pub fn spans_full_year(start: NaiveDate, end: NaiveDate) -> bool {
    let days = (end - start).num_days();
    (350..=380).contains(&days)
}

/// First `segments` components of a dotted materialized path, e.g.
/// `path_prefix("001.002.003", 2) == "001.002"`.
pub fn path_prefix(path: &str, segments: usize) -> String {
    path.split('.')
        .filter(|s| !s.is_empty())
        .take(segments)
        .collect::<Vec<_>>()
        .join(".")
}

/// Whether two paths agree on their leading `segments` components. Paths that
/// are too short to have that many components never agree.
pub fn shares_path_prefix(a: &str, b: &str, segments: usize) -> bool {
    let depth_a = a.split('.').filter(|s| !s.is_empty()).count();
    let depth_b = b.split('.').filter(|s| !s.is_empty()).count();
    if depth_a < segments || depth_b < segments {
        return false;
    }
    path_prefix(a, segments) == path_prefix(b, segments)
}
