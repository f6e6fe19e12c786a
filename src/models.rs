use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::{Validate, ValidationError};

use crate::error::{AppError, AppResult, MAX_SEARCH_LENGTH};

pub const CURRENCY_UNIT: &str = "₽";
pub const PIECES_UNIT: &str = "шт.";
pub const PERCENT_UNIT: &str = "%";

static CITY_CODE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{2,5}$").expect("Invalid regex pattern"));

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub databases: Vec<CityHealthReport>,
    pub response_time_ms: u64,
    pub uptime_seconds: u64,
    pub version: String,
    pub timestamp: String,
}

#[derive(Serialize, ToSchema)]
pub struct CityHealthReport {
    pub city: String,
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone)]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

#[derive(Debug, Clone)]
pub struct SystemHealth {
    pub databases: Vec<(City, HealthStatus)>,
    pub overall: HealthStatus,
    pub response_time_ms: u64,
}

/// Dealership city code. Each code selects its own database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct City(String);

impl City {
    pub fn new(code: &str) -> AppResult<Self> {
        let code = code.trim().to_uppercase();
        if !CITY_CODE_REGEX.is_match(&code) {
            return Err(AppError::InvalidQuery(format!(
                "City code must be 2 to 5 latin letters, got '{}'",
                code
            )));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for City {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inclusive range of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateRange {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl DateRange {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            start_date,
            end_date,
        }
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.start_date.and_time(NaiveTime::MIN)
    }

    pub fn ends_at(&self) -> NaiveDateTime {
        self.end_date.and_time(NaiveTime::MIN) + TimeDelta::seconds(86_399)
    }

    pub fn shifted_back(&self, days: u64) -> Self {
        Self {
            start_date: self.start_date - Days::new(days),
            end_date: self.end_date - Days::new(days),
        }
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start_date, self.end_date)
    }
}

pub fn days_in_year(year: i32) -> u64 {
    if NaiveDate::from_ymd_opt(year, 2, 29).is_some() {
        366
    } else {
        365
    }
}

/// Range one "year" back, where the year length is taken from `reference`,
/// not from the shifted dates.
pub fn prior_year_range(range: &DateRange, reference: NaiveDate) -> DateRange {
    range.shifted_back(days_in_year(reference.year()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Finance,
    Orders,
    DiagnosticPackages,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Finance => "finance",
            Self::Orders => "orders",
            Self::DiagnosticPackages => "diagnostic_packages",
        }
    }
}

impl FromStr for BlockKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "finance" => Ok(Self::Finance),
            "orders" => Ok(Self::Orders),
            "diagnostic_packages" => Ok(Self::DiagnosticPackages),
            other => Err(AppError::InvalidBlock(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Full,
    /// Skips the comparative metrics; used for year-over-year baselines.
    Short,
}

impl OutputMode {
    pub fn from_short_flag(short_output: bool) -> Self {
        if short_output { Self::Short } else { Self::Full }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Text(String),
    Empty,
}

impl MetricValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Int(v) => *v as f64,
            Self::Float(v) => *v,
            Self::Text(_) | Self::Empty => 0.0,
        }
    }

}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct Submetric {
    pub title: String,
    #[schema(value_type = Object)]
    pub value: MetricValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Submetric {
    pub fn new(title: impl Into<String>, value: MetricValue) -> Self {
        Self {
            title: title.into(),
            value,
            unit: None,
        }
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct Metric {
    pub id: String,
    pub title: String,
    #[schema(value_type = Object)]
    pub value: MetricValue,
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submetrics: Option<Vec<Submetric>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submetrics_unit: Option<String>,
}

impl Metric {
    pub fn new(id: &str, title: &str, value: MetricValue, unit: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            value,
            unit: unit.to_string(),
            submetrics: None,
            submetrics_unit: None,
        }
    }

    pub fn with_submetrics(mut self, submetrics: Vec<Submetric>) -> Self {
        self.submetrics = Some(submetrics);
        self
    }

    pub fn with_submetrics_unit(mut self, unit: &str) -> Self {
        self.submetrics_unit = Some(unit.to_string());
        self
    }
}

impl From<Metric> for Submetric {
    fn from(metric: Metric) -> Self {
        Self {
            title: metric.title,
            value: metric.value,
            unit: Some(metric.unit),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct MetricBlock {
    pub block_id: BlockKind,
    pub metrics: Vec<Metric>,
}

impl MetricBlock {
    pub fn metric(&self, id: &str) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderTag {
    WithoutRecommendations,
    /// Spelled `without_milleage` on the wire.
    WithoutMileage,
    WithoutReasonsAppeal,
    WithDiscountLte10,
    WithDiscountGte11,
}

impl OrderTag {
    pub const ALL: [OrderTag; 5] = [
        Self::WithoutRecommendations,
        Self::WithoutMileage,
        Self::WithoutReasonsAppeal,
        Self::WithDiscountLte10,
        Self::WithDiscountGte11,
    ];

    /// Unknown names yield `None`; callers drop them silently.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.as_str() == name)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WithoutRecommendations => "without_recommendations",
            Self::WithoutMileage => "without_milleage",
            Self::WithoutReasonsAppeal => "without_reasons_appeal",
            Self::WithDiscountLte10 => "with_discount_lte_10",
            Self::WithDiscountGte11 => "with_discount_gte_11",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HavingCondition {
    /// Substring match on the order number. Its value is the next entry
    /// of `OrderFilter::params`.
    Search,
    /// Matches orders satisfying at least one of the tags.
    AnyTag(Vec<OrderTag>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderFilter {
    pub search: Option<String>,
    pub tags: Vec<OrderTag>,
}

impl OrderFilter {
    pub fn new<I, S>(search: Option<&str>, tags: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let search = match search.filter(|s| !s.is_empty()) {
            Some(text) => {
                let length = text.chars().count();
                if length > MAX_SEARCH_LENGTH {
                    return Err(AppError::SearchTermTooLong { length });
                }
                Some(text.to_uppercase())
            }
            None => None,
        };

        let mut selected = Vec::new();
        for tag in tags.into_iter().filter_map(|t| OrderTag::parse(t.as_ref())) {
            if !selected.contains(&tag) {
                selected.push(tag);
            }
        }

        Ok(Self {
            search,
            tags: selected,
        })
    }

    pub fn having_conditions(&self) -> Vec<HavingCondition> {
        let mut conditions = Vec::new();
        if self.search.is_some() {
            conditions.push(HavingCondition::Search);
        }
        if !self.tags.is_empty() {
            conditions.push(HavingCondition::AnyTag(self.tags.clone()));
        }
        conditions
    }

    /// Values bound for the having conditions, in placeholder order.
    pub fn params(&self) -> Vec<String> {
        self.search.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrderRow {
    pub fullnumber: String,
    pub date_create: NaiveDateTime,
    pub client_fullname: Option<String>,
    pub avg_discount_work: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct OrderSummary {
    pub fullnumber: String,
    pub date: NaiveDate,
    pub metrics: Vec<Submetric>,
}

impl From<OrderRow> for OrderSummary {
    fn from(row: OrderRow) -> Self {
        let client = row
            .client_fullname
            .map(MetricValue::Text)
            .unwrap_or(MetricValue::Empty);
        let discount = row
            .avg_discount_work
            .map(MetricValue::Int)
            .unwrap_or(MetricValue::Empty);

        Self {
            fullnumber: row.fullnumber,
            date: row.date_create.date(),
            metrics: vec![
                Submetric::new("Клиент", client),
                Submetric::new("Скидка", discount).with_unit(PERCENT_UNIT),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct OrdersPage {
    pub count: usize,
    pub orders: Vec<OrderSummary>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct OrdersBreakdown {
    pub total_orders: i64,
    pub orders_without_recommendations: i64,
    pub orders_without_mileage: i64,
    pub orders_without_reasons_appeal: i64,
    pub orders_with_discount_lte_10: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct DiscountBucket {
    pub discount_percentage: i32,
    pub discount_count: i64,
}

#[derive(Debug, Deserialize, Validate, IntoParams)]
#[into_params(parameter_in = Query)]
#[validate(schema(function = "validate_stats_query"))]
pub struct StatsQuery {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub short_output: bool,
}

impl StatsQuery {
    pub fn range(&self) -> DateRange {
        DateRange::new(self.start_date, self.end_date)
    }

    pub fn mode(&self) -> OutputMode {
        OutputMode::from_short_flag(self.short_output)
    }
}

fn validate_stats_query(query: &StatsQuery) -> Result<(), ValidationError> {
    validate_range(query.start_date, query.end_date)
}

#[derive(Debug, Deserialize, Validate, IntoParams)]
#[into_params(parameter_in = Query)]
#[validate(schema(function = "validate_orders_query"))]
pub struct OrdersQuery {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub search: Option<String>,
    /// Comma-separated tag names.
    pub tags: Option<String>,
    #[validate(range(min = 1, max = 500))]
    #[serde(default = "default_offset")]
    pub offset: u32,
    #[serde(default)]
    pub page: i64,
}

impl OrdersQuery {
    pub fn range(&self) -> DateRange {
        DateRange::new(self.start_date, self.end_date)
    }

    pub fn tag_names(&self) -> Vec<String> {
        self.tags
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect()
    }
}

fn validate_orders_query(query: &OrdersQuery) -> Result<(), ValidationError> {
    validate_range(query.start_date, query.end_date)
}

fn validate_range(start: NaiveDate, end: NaiveDate) -> Result<(), ValidationError> {
    if start > end {
        let mut err = ValidationError::new("date_range");
        err.message = Some("start_date must not be after end_date".into());
        return Err(err);
    }
    Ok(())
}

fn default_offset() -> u32 {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn empty_filter_has_no_conditions_or_params() {
        let filter = OrderFilter::new(Some(""), Vec::<String>::new()).unwrap();
        assert!(filter.having_conditions().is_empty());
        assert!(filter.params().is_empty());

        let filter = OrderFilter::new(None, Vec::<String>::new()).unwrap();
        assert_eq!(filter, OrderFilter::default());
    }

    #[test]
    fn search_length_limit_is_exact() {
        let ok = OrderFilter::new(Some(&"x".repeat(21)), Vec::<String>::new()).unwrap();
        assert_eq!(ok.search.as_deref(), Some("X".repeat(21).as_str()));
        assert_eq!(ok.params(), vec!["X".repeat(21)]);

        let err = OrderFilter::new(Some(&"X".repeat(22)), Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, AppError::SearchTermTooLong { length: 22 }));
    }

    #[test]
    fn search_length_counts_characters_not_bytes() {
        let cyrillic = "ж".repeat(21);
        assert!(OrderFilter::new(Some(&cyrillic), Vec::<String>::new()).is_ok());
    }

    #[test]
    fn unknown_tags_are_dropped() {
        let unknown = OrderFilter::new(None, ["nonexistent"]).unwrap();
        let none = OrderFilter::new(None, Vec::<String>::new()).unwrap();
        assert_eq!(unknown, none);
        assert!(unknown.having_conditions().is_empty());
    }

    #[test]
    fn known_tags_form_a_single_condition_in_input_order() {
        let filter = OrderFilter::new(
            Some("ab-12"),
            ["with_discount_gte_11", "bogus", "without_milleage", "with_discount_gte_11"],
        )
        .unwrap();

        assert_eq!(
            filter.having_conditions(),
            vec![
                HavingCondition::Search,
                HavingCondition::AnyTag(vec![OrderTag::WithDiscountGte11, OrderTag::WithoutMileage]),
            ]
        );
        assert_eq!(filter.params(), vec!["AB-12"]);
    }

    #[test]
    fn block_ids_parse_and_reject_unknown() {
        assert_eq!("finance".parse::<BlockKind>().unwrap(), BlockKind::Finance);
        assert_eq!(
            "diagnostic_packages".parse::<BlockKind>().unwrap(),
            BlockKind::DiagnosticPackages
        );
        assert!(matches!(
            "Finance".parse::<BlockKind>(),
            Err(AppError::InvalidBlock(id)) if id == "Finance"
        ));
    }

    #[test]
    fn range_bounds_cover_whole_days() {
        let range = DateRange::new(date(2024, 3, 1), date(2024, 3, 31));
        assert_eq!(range.starts_at().to_string(), "2024-03-01 00:00:00");
        assert_eq!(range.ends_at().to_string(), "2024-03-31 23:59:59");
    }

    #[test]
    fn prior_year_uses_reference_year_length() {
        let range = DateRange::new(date(2024, 3, 1), date(2024, 3, 31));

        // 2024 is a leap year: 366 days back lands on the same calendar day.
        let prior = prior_year_range(&range, date(2024, 6, 1));
        assert_eq!(prior, DateRange::new(date(2023, 3, 1), date(2023, 3, 31)));

        // Reference year 2025 has 365 days, regardless of the shifted dates.
        let range = DateRange::new(date(2025, 1, 1), date(2025, 1, 31));
        let prior = prior_year_range(&range, date(2025, 6, 1));
        assert_eq!(prior, DateRange::new(date(2024, 1, 2), date(2024, 2, 1)));
    }

    #[test]
    fn city_codes_are_normalised() {
        assert_eq!(City::new(" vlg ").unwrap().as_str(), "VLG");
        assert!(City::new("V1G").is_err());
    }

    #[test]
    fn order_row_maps_to_summary() {
        let row = OrderRow {
            fullnumber: "ЗН-000123".into(),
            date_create: date(2024, 5, 6).and_hms_opt(14, 30, 0).unwrap(),
            client_fullname: Some("Иванов И.И.".into()),
            avg_discount_work: None,
        };

        let summary = OrderSummary::from(row);
        assert_eq!(summary.date, date(2024, 5, 6));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["metrics"][0]["value"], "Иванов И.И.");
        assert!(json["metrics"][1]["value"].is_null());
        assert_eq!(json["metrics"][1]["unit"], "%");
    }

    #[test]
    fn tag_names_split_on_commas() {
        let query = OrdersQuery {
            start_date: date(2024, 1, 1),
            end_date: date(2024, 1, 31),
            search: None,
            tags: Some("without_reasons_appeal, with_discount_lte_10,,".into()),
            offset: 10,
            page: 1,
        };
        assert_eq!(
            query.tag_names(),
            vec!["without_reasons_appeal", "with_discount_lte_10"]
        );
        assert!(query.validate().is_ok());
    }

    #[test]
    fn inverted_range_fails_validation() {
        let query = StatsQuery {
            start_date: date(2024, 2, 1),
            end_date: date(2024, 1, 1),
            short_output: false,
        };
        assert!(query.validate().is_err());
    }
}
