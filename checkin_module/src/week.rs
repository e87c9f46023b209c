use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};

/// The upcoming week boundary: the next Sunday strictly after `now`'s date.
/// A goal created on a Sunday is due the following Sunday, not the same day.
pub fn next_week_boundary(now: DateTime<Utc>) -> NaiveDate {
    let today = now.date_naive();
    let days_ahead = match today.weekday() {
        Weekday::Sun => 7,
        weekday => 7 - weekday.num_days_from_sunday() as i64,
    };
    today + Duration::days(days_ahead)
}
