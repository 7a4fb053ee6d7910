//! Query shape selection.
//!
//! Every manager takes the same sparse criteria (one foreign-key equality
//! filter, an inclusive date range, a sort flag) and picks one of four
//! fixed query shapes from them.

use chrono::{DateTime, NaiveDate, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::query::{Direction, Query};
use crate::error::{Result, StoreError};

/// Inclusive `[start, end]` window over a timestamp field.
///
/// Deserializing goes through [`DateRange::new`], so an inverted payload is
/// rejected the same way a constructed one is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRange")]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TryFrom<RawRange> for DateRange {
    type Error = StoreError;

    fn try_from(raw: RawRange) -> Result<Self> {
        DateRange::new(raw.start, raw.end)
    }
}

fn out_of_range(what: &str) -> StoreError {
    StoreError::InvalidQuery(format!("{} is outside the supported time range", what))
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(StoreError::InvalidRange {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(DateRange { start, end })
    }

    /// The whole UTC calendar day, down to the last millisecond.
    pub fn day(date: NaiveDate) -> Result<Self> {
        let start = Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN));
        let end = start
            .checked_add_signed(TimeDelta::milliseconds(86_400_000 - 1))
            .ok_or_else(|| out_of_range(&date.to_string()))?;
        Ok(DateRange { start, end })
    }

    /// First day through the end of the last day, both inclusive.
    pub fn days(first: NaiveDate, last: NaiveDate) -> Result<Self> {
        let start = Self::day(first)?.start;
        let end = Self::day(last)?.end;
        Self::new(start, end)
    }

    /// The `hours` leading up to `now`. Negative counts are treated as zero.
    pub fn last_hours(hours: i64, now: DateTime<Utc>) -> Result<Self> {
        let span = TimeDelta::try_hours(hours.max(0)).ok_or_else(|| out_of_range(&format!("{} hours", hours)))?;
        Self::ending_at(now, span, || format!("{} hours", hours))
    }

    pub fn last_days(days: i64, now: DateTime<Utc>) -> Result<Self> {
        let span = TimeDelta::try_days(days.max(0)).ok_or_else(|| out_of_range(&format!("{} days", days)))?;
        Self::ending_at(now, span, || format!("{} days", days))
    }

    fn ending_at(now: DateTime<Utc>, span: TimeDelta, what: impl Fn() -> String) -> Result<Self> {
        let start = now.checked_sub_signed(span).ok_or_else(|| out_of_range(&what()))?;
        Ok(DateRange { start, end: now })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }

    pub fn start_millis(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_millis(&self) -> i64 {
        self.end.timestamp_millis()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EqualityFilter {
    pub field: String,
    pub value: Value,
}

impl EqualityFilter {
    pub fn new(field: &str, value: impl Into<Value>) -> Self {
        EqualityFilter {
            field: field.to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryCriteria {
    pub equality: Option<EqualityFilter>,
    pub range: Option<DateRange>,
    /// `None` means the manager's default direction
    pub descending: Option<bool>,
}

impl QueryCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equal(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.equality = Some(EqualityFilter::new(field, value));
        self
    }

    pub fn maybe_equal(self, field: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.equal(field, v),
            None => self,
        }
    }

    pub fn within(mut self, range: Option<DateRange>) -> Self {
        self.range = range;
        self
    }

    pub fn descending(mut self, descending: Option<bool>) -> Self {
        self.descending = descending;
        self
    }

    pub fn shape(&self) -> QueryShape {
        QueryShape::select(self)
    }

    /// Build the query for the selected shape.
    ///
    /// `date_field` is both the range field and the sort key; results are
    /// always ordered by it, newest first unless told otherwise.
    pub fn compose(&self, collection: &str, date_field: &str, default_descending: bool) -> Query {
        let direction = Direction::from_descending(self.descending.unwrap_or(default_descending));
        let mut query = Query::collection(collection);

        match self.shape() {
            QueryShape::FullCollection => {}
            QueryShape::Equality => {
                if let Some(eq) = &self.equality {
                    query = query.where_eq(&eq.field, eq.value.clone());
                }
            }
            QueryShape::Range => {
                if let Some(range) = &self.range {
                    query = query
                        .where_ge(date_field, range.start_millis())
                        .where_le(date_field, range.end_millis());
                }
            }
            QueryShape::EqualityRange => {
                if let (Some(eq), Some(range)) = (&self.equality, &self.range) {
                    query = query
                        .where_eq(&eq.field, eq.value.clone())
                        .where_ge(date_field, range.start_millis())
                        .where_le(date_field, range.end_millis());
                }
            }
        }

        query.order_by(date_field, direction)
    }
}

/// The fixed set of query shapes managers issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryShape {
    FullCollection,
    Equality,
    Range,
    EqualityRange,
}

impl QueryShape {
    /// Most specific shape the supplied criteria allow.
    pub fn select(criteria: &QueryCriteria) -> Self {
        match (criteria.equality.is_some(), criteria.range.is_some()) {
            (true, true) => QueryShape::EqualityRange,
            (true, false) => QueryShape::Equality,
            (false, true) => QueryShape::Range,
            (false, false) => QueryShape::FullCollection,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryShape::FullCollection => "full_collection",
            QueryShape::Equality => "equality",
            QueryShape::Range => "range",
            QueryShape::EqualityRange => "equality_range",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::query::Op;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn test_shape_selection_table() {
        let range = DateRange::new(ts(0), ts(10)).unwrap();
        assert_eq!(QueryCriteria::new().shape(), QueryShape::FullCollection);
        assert_eq!(QueryCriteria::new().equal("siteId", "s").shape(), QueryShape::Equality);
        assert_eq!(QueryCriteria::new().within(Some(range)).shape(), QueryShape::Range);
        assert_eq!(
            QueryCriteria::new().equal("siteId", "s").within(Some(range)).shape(),
            QueryShape::EqualityRange
        );
        // The sort flag never changes the shape
        assert_eq!(
            QueryCriteria::new().descending(Some(false)).shape(),
            QueryShape::FullCollection
        );
    }

    #[test]
    fn test_compose_full_collection_uses_default_direction() {
        let q = QueryCriteria::new().compose("Issues", "timestamp", true);
        assert!(q.filters.is_empty());
        assert_eq!(q.order_by.len(), 1);
        assert_eq!(q.order_by[0].direction, Direction::Descending);

        let asc = QueryCriteria::new()
            .descending(Some(false))
            .compose("Issues", "timestamp", true);
        assert_eq!(asc.order_by[0].direction, Direction::Ascending);
    }

    #[test]
    fn test_compose_equality_range() {
        let range = DateRange::new(ts(1_000), ts(2_000)).unwrap();
        let q = QueryCriteria::new()
            .equal("siteId", "lab-1")
            .within(Some(range))
            .compose("HourlyCleanings", "timestamp", true);

        assert_eq!(q.collection, "HourlyCleanings");
        assert_eq!(q.filters.len(), 3);
        assert_eq!(q.filters[0].op, Op::Eq);
        assert_eq!(q.filters[1].value, serde_json::json!(1_000));
        assert_eq!(q.filters[2].value, serde_json::json!(2_000));
        assert!(q.validate().is_ok());
        assert!(q.required_index().is_some());
    }

    #[test]
    fn test_range_rejects_inverted_bounds() {
        assert!(matches!(
            DateRange::new(ts(10), ts(0)),
            Err(StoreError::InvalidRange { .. })
        ));
        assert!(DateRange::new(ts(5), ts(5)).is_ok());
    }

    #[test]
    fn test_day_range_is_inclusive_of_last_millisecond() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let range = DateRange::day(date).unwrap();
        assert_eq!(range.start.to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert_eq!(range.end_millis() - range.start_millis(), 86_400_000 - 1);
        assert!(range.contains(range.end));
        assert!(!range.contains(range.end + TimeDelta::milliseconds(1)));
    }

    #[test]
    fn test_days_spans_both_ends() {
        let first = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let last = NaiveDate::from_ymd_opt(2024, 3, 3).unwrap();
        let range = DateRange::days(first, last).unwrap();
        assert_eq!(range.end, DateRange::day(last).unwrap().end);
        assert!(DateRange::days(last, first).is_err());
    }

    #[test]
    fn test_day_at_calendar_limit() {
        assert!(DateRange::day(NaiveDate::MAX).is_ok());
        assert!(DateRange::day(NaiveDate::MIN).is_ok());
    }

    #[test]
    fn test_trailing_windows() {
        let now = ts(1_725_148_800_000);
        let hour = DateRange::last_hours(1, now).unwrap();
        assert_eq!(hour.end_millis() - hour.start_millis(), 3_600_000);
        assert_eq!(DateRange::last_days(-3, now).unwrap().start, now);
        assert_eq!(DateRange::last_days(7, now).unwrap().end, now);
    }

    #[test]
    fn test_trailing_windows_reject_huge_spans() {
        let now = ts(1_725_148_800_000);
        assert!(matches!(
            DateRange::last_hours(i64::MAX, now),
            Err(StoreError::InvalidQuery(_))
        ));
        assert!(matches!(
            DateRange::last_days(i64::MAX / 86_400, now),
            Err(StoreError::InvalidQuery(_))
        ));
        // Representable as a span but reaches before the earliest date
        assert!(DateRange::last_days(200_000_000, now).is_err());
    }

    #[test]
    fn test_deserialize_checks_order() {
        let ok: DateRange = serde_json::from_str(
            r#"{"start":"2024-09-01T00:00:00Z","end":"2024-09-05T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(ok.start, Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap());

        let inverted = serde_json::from_str::<DateRange>(
            r#"{"start":"2024-09-05T00:00:00Z","end":"2024-09-01T00:00:00Z"}"#,
        );
        let err = inverted.unwrap_err().to_string();
        assert!(err.contains("invalid date range"), "{}", err);
    }
}
