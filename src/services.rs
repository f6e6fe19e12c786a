use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::time::timeout;
use tracing::instrument;

use crate::config::DatabaseConfig;
use crate::error::AppResult;
use crate::models::{
    BlockKind, City, CURRENCY_UNIT, DateRange, HealthStatus, Metric, MetricBlock, MetricValue,
    OrderFilter, OrderSummary, OrdersPage, OutputMode, PERCENT_UNIT, PIECES_UNIT, Submetric,
    SystemHealth, prior_year_range,
};
use crate::repositories::{CityPools, OrdersRepository, StatsRepository, StatsSession};

/// Computes metric blocks for one city and date range.
#[derive(Clone)]
pub struct MetricsEngine {
    repository: Arc<dyn StatsRepository>,
    city: City,
    range: DateRange,
    reference_date: NaiveDate,
}

impl MetricsEngine {
    pub fn new(repository: Arc<dyn StatsRepository>, city: City, range: DateRange) -> Self {
        Self {
            repository,
            city,
            range,
            reference_date: chrono::Local::now().date_naive(),
        }
    }

    /// Date whose calendar year sets the length of the year-over-year shift.
    pub fn with_reference_date(mut self, reference_date: NaiveDate) -> Self {
        self.reference_date = reference_date;
        self
    }

    #[instrument(skip(self), fields(city = %self.city, range = %self.range))]
    pub async fn get_metrics(&self, block: BlockKind, mode: OutputMode) -> AppResult<MetricBlock> {
        metrics::counter!("stats_block_requests_total", "block" => block.as_str()).increment(1);

        let mut metrics = {
            let mut session = self.repository.open(&self.city, self.range).await?;
            block_metrics(session.as_mut(), block, mode).await?
        };

        if block == BlockKind::Finance && mode == OutputMode::Full {
            let revenue = metrics.first().map(|m| m.value.as_f64()).unwrap_or(0.0);
            metrics.extend(self.year_over_year(revenue).await?);
        }

        tracing::info!(
            block = block.as_str(),
            metrics = metrics.len(),
            "Metric block computed"
        );

        Ok(MetricBlock {
            block_id: block,
            metrics,
        })
    }

    fn prior_year(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            city: self.city.clone(),
            range: prior_year_range(&self.range, self.reference_date),
            reference_date: self.reference_date,
        }
    }

    /// Short-mode block for this engine's range. Never reaches
    /// `year_over_year`, which bounds the nesting depth at one.
    async fn short_block(&self, block: BlockKind) -> AppResult<Vec<Metric>> {
        let mut session = self.repository.open(&self.city, self.range).await?;
        block_metrics(session.as_mut(), block, OutputMode::Short).await
    }

    async fn year_over_year(&self, revenue: f64) -> AppResult<Vec<Metric>> {
        let prior = self.prior_year();
        tracing::debug!(prior_range = %prior.range, "Computing year-over-year comparison");

        // The denominator is last year's order count, not the current one.
        let prior_orders = prior.short_block(BlockKind::Orders).await?;
        let orders_count = prior_orders
            .first()
            .map(|m| m.value.as_f64())
            .unwrap_or(0.0);

        let last_year = prior.short_block(BlockKind::Finance).await?;
        let last_year_revenue = last_year.first().map(|m| m.value.as_f64()).unwrap_or(0.0);

        Ok(vec![
            Metric::new(
                "average_check",
                "Средний чек",
                MetricValue::Float(average_check(revenue, orders_count)),
                CURRENCY_UNIT,
            ),
            Metric::new(
                "growth_trend",
                "Рост год к году",
                MetricValue::Float(growth_trend(revenue, last_year_revenue)),
                PERCENT_UNIT,
            )
            .with_submetrics(last_year.into_iter().map(Submetric::from).collect())
            .with_submetrics_unit(CURRENCY_UNIT),
        ])
    }
}

async fn block_metrics(
    session: &mut dyn StatsSession,
    block: BlockKind,
    mode: OutputMode,
) -> AppResult<Vec<Metric>> {
    match block {
        BlockKind::Finance => finance_metrics(session).await,
        BlockKind::Orders => orders_metrics(session, mode).await,
        BlockKind::DiagnosticPackages => diagnostic_packages_metrics(session).await,
    }
}

async fn finance_metrics(session: &mut dyn StatsSession) -> AppResult<Vec<Metric>> {
    let works_revenue = session.works_revenue().await?;
    let spare_parts_revenue = session.spare_parts_revenue().await?;
    let revenue = works_revenue + spare_parts_revenue;

    Ok(vec![
        Metric::new(
            "revenue",
            "Выручка",
            MetricValue::Float(revenue),
            CURRENCY_UNIT,
        ),
        Metric::new(
            "works_revenue",
            "Выручка с работ",
            MetricValue::Float(works_revenue),
            CURRENCY_UNIT,
        ),
        Metric::new(
            "spare_parts_revenue",
            "Выручка с з/ч",
            MetricValue::Float(spare_parts_revenue),
            CURRENCY_UNIT,
        ),
    ])
}

async fn orders_metrics(session: &mut dyn StatsSession, mode: OutputMode) -> AppResult<Vec<Metric>> {
    if mode == OutputMode::Short {
        let total = session.orders_total().await?;
        return Ok(vec![orders_count_metric(total)]);
    }

    let breakdown = session.orders_breakdown().await?;
    let orders_count = orders_count_metric(breakdown.total_orders).with_submetrics(vec![
        Submetric::new(
            "Без рекомендаций",
            MetricValue::Int(breakdown.orders_without_recommendations),
        ),
        Submetric::new(
            "Без пробега",
            MetricValue::Int(breakdown.orders_without_mileage),
        ),
        Submetric::new(
            "Без причин обращения",
            MetricValue::Int(breakdown.orders_without_reasons_appeal),
        ),
        Submetric::new(
            "Со скидкой до 11%",
            MetricValue::Int(breakdown.orders_with_discount_lte_10),
        ),
    ]);

    let buckets = session.discount_buckets().await?;
    let discounted_total: i64 = buckets.iter().map(|b| b.discount_count).sum();
    let mut discounted = Metric::new(
        "orders_with_discount_gte_11",
        "ЗН со скидкой от 11%",
        MetricValue::Int(discounted_total),
        PIECES_UNIT,
    );
    if !buckets.is_empty() {
        discounted = discounted.with_submetrics(
            buckets
                .iter()
                .map(|b| {
                    Submetric::new(
                        format!("{} %", b.discount_percentage),
                        MetricValue::Int(b.discount_count),
                    )
                })
                .collect(),
        );
    }

    Ok(vec![orders_count, discounted])
}

fn orders_count_metric(total: i64) -> Metric {
    Metric::new("orders_count", "Всего", MetricValue::Int(total), PIECES_UNIT)
}

async fn diagnostic_packages_metrics(session: &mut dyn StatsSession) -> AppResult<Vec<Metric>> {
    let sold = session.diagnostic_packages_sold().await?;
    Ok(vec![Metric::new(
        "packages_sold",
        "Продано",
        MetricValue::Int(sold),
        PIECES_UNIT,
    )])
}

pub fn average_check(revenue: f64, orders_count: f64) -> f64 {
    if orders_count == 0.0 {
        0.0
    } else {
        revenue / orders_count
    }
}

/// Percent change against last year, rounded to two decimals with ties to even.
pub fn growth_trend(revenue: f64, last_year_revenue: f64) -> f64 {
    if last_year_revenue == 0.0 {
        return if revenue > 0.0 { 0.0 } else { 100.0 };
    }
    let change = revenue / last_year_revenue * 100.0 - 100.0;
    (change * 100.0).round_ties_even() / 100.0
}

#[derive(Clone)]
pub struct StatsService {
    repository: Arc<dyn StatsRepository>,
}

impl StatsService {
    pub fn new(repository: Arc<dyn StatsRepository>) -> Self {
        Self { repository }
    }

    pub fn engine(&self, city: City, range: DateRange) -> MetricsEngine {
        MetricsEngine::new(Arc::clone(&self.repository), city, range)
    }

    pub async fn get_metrics(
        &self,
        city: City,
        range: DateRange,
        block: BlockKind,
        mode: OutputMode,
    ) -> AppResult<MetricBlock> {
        self.engine(city, range).get_metrics(block, mode).await
    }
}

/// Rows to return for a page. Pages start at 1; an out-of-range page falls
/// back to the first one, and `page <= 0` returns every row.
pub fn page_window(count: usize, offset: usize, page: i64) -> Range<usize> {
    if page <= 0 {
        return 0..count;
    }

    let pages_before = usize::try_from(page - 1).unwrap_or(usize::MAX);
    let mut row_start = offset.saturating_mul(pages_before);
    let mut row_end = row_start.saturating_add(offset);
    if count < row_start {
        row_start = 0;
        row_end = offset;
    }

    row_start.min(count)..row_end.min(count)
}

#[derive(Clone)]
pub struct OrdersService {
    repository: Arc<dyn OrdersRepository>,
}

impl OrdersService {
    pub fn new(repository: Arc<dyn OrdersRepository>) -> Self {
        Self { repository }
    }

    #[instrument(skip(self, tags), fields(city = %city, range = %range))]
    pub async fn get_orders_count_and_list(
        &self,
        city: &City,
        range: DateRange,
        search: Option<&str>,
        tags: &[String],
        offset: usize,
        page: i64,
    ) -> AppResult<OrdersPage> {
        let filter = OrderFilter::new(search, tags)?;

        let rows = self.repository.find_orders(city, &range, &filter).await?;
        let count = rows.len();
        let window = page_window(count, offset, page);

        let orders = rows
            .into_iter()
            .skip(window.start)
            .take(window.len())
            .map(OrderSummary::from)
            .collect();

        tracing::info!(count, page, offset, "Orders listed");

        Ok(OrdersPage { count, orders })
    }
}

#[async_trait]
pub trait HealthCheckService: Send + Sync {
    async fn check_db(&self, city: &City) -> HealthStatus;
    async fn check_full(&self) -> SystemHealth;
}

pub struct HealthCheckServiceImpl {
    pub pools: CityPools,
    pub config: DatabaseConfig,
}

impl HealthCheckServiceImpl {
    pub fn new(pools: CityPools, config: DatabaseConfig) -> Self {
        Self { pools, config }
    }

    async fn try_acquire_conn(
        &self,
        city: &City,
    ) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>, HealthStatus> {
        let pool = self
            .pools
            .get(city)
            .map_err(|e| HealthStatus::Unhealthy(e.to_string()))?;

        match timeout(self.config.health_check_acquire_timeout(), pool.acquire()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(HealthStatus::Unhealthy(format!(
                "Failed to acquire connection: {}",
                e
            ))),
            Err(_) => Err(HealthStatus::Degraded(
                "Connection pool exhausted, acquire timeout".to_string(),
            )),
        }
    }

    async fn execute_health_query(
        &self,
        mut conn: sqlx::pool::PoolConnection<sqlx::Postgres>,
    ) -> HealthStatus {
        match timeout(
            self.config.health_check_timeout(),
            sqlx::query("SELECT 1").fetch_one(&mut *conn),
        )
        .await
        {
            Ok(Ok(_)) => HealthStatus::Healthy,
            Ok(Err(e)) => HealthStatus::Unhealthy(format!("Query failed: {}", e)),
            Err(_) => HealthStatus::Degraded("Query timeout - database under load".to_string()),
        }
    }
}

#[async_trait]
impl HealthCheckService for HealthCheckServiceImpl {
    #[instrument(skip(self))]
    async fn check_db(&self, city: &City) -> HealthStatus {
        let start = std::time::Instant::now();

        let conn = match self.try_acquire_conn(city).await {
            Ok(conn) => conn,
            Err(status) => {
                tracing::warn!(
                    health_status = ?status,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Health check failed at connection acquisition"
                );
                return status;
            }
        };

        let status = self.execute_health_query(conn).await;
        let elapsed = start.elapsed().as_millis() as u64;

        match &status {
            HealthStatus::Healthy => {
                tracing::debug!(elapsed_ms = elapsed, "Database health check passed");
            }
            _ => {
                tracing::warn!(
                    health_status = ?status,
                    elapsed_ms = elapsed,
                    "Database health check degraded"
                );
            }
        }

        status
    }

    async fn check_full(&self) -> SystemHealth {
        let start = std::time::Instant::now();

        let mut databases = Vec::new();
        for city in self.pools.cities() {
            let status = self.check_db(&city).await;
            databases.push((city, status));
        }

        SystemHealth {
            overall: overall_health(databases.iter().map(|(_, status)| status)),
            databases,
            response_time_ms: start.elapsed().as_millis() as u64,
        }
    }
}

pub fn overall_health<'a>(statuses: impl IntoIterator<Item = &'a HealthStatus>) -> HealthStatus {
    let mut overall = HealthStatus::Healthy;
    for status in statuses {
        match status {
            HealthStatus::Unhealthy(_) => {
                return HealthStatus::Unhealthy("Database unavailable".to_string());
            }
            HealthStatus::Degraded(_) => {
                overall = HealthStatus::Degraded("Database experiencing issues".to_string());
            }
            HealthStatus::Healthy => {}
        }
    }
    overall
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sqlx::Result as SqlxResult;

    use super::*;
    use crate::error::AppError;
    use crate::models::{DiscountBucket, OrderRow, OrdersBreakdown};

    #[derive(Debug, Clone, Default)]
    struct Figures {
        works_revenue: f64,
        spare_parts_revenue: f64,
        orders: OrdersBreakdown,
        buckets: Vec<DiscountBucket>,
        packages_sold: i64,
    }

    #[derive(Default)]
    struct MockStatsRepository {
        figures: HashMap<DateRange, Figures>,
        opened: Mutex<Vec<DateRange>>,
        closed: Arc<AtomicUsize>,
        fail_spare_parts: bool,
    }

    impl MockStatsRepository {
        fn with(mut self, range: DateRange, figures: Figures) -> Self {
            self.figures.insert(range, figures);
            self
        }

        fn opened(&self) -> Vec<DateRange> {
            self.opened.lock().unwrap().clone()
        }
    }

    struct MockSession {
        figures: Figures,
        closed: Arc<AtomicUsize>,
        fail_spare_parts: bool,
    }

    impl Drop for MockSession {
        fn drop(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl StatsRepository for MockStatsRepository {
        async fn open(&self, _city: &City, range: DateRange) -> AppResult<Box<dyn StatsSession>> {
            self.opened.lock().unwrap().push(range);
            Ok(Box::new(MockSession {
                figures: self.figures.get(&range).cloned().unwrap_or_default(),
                closed: Arc::clone(&self.closed),
                fail_spare_parts: self.fail_spare_parts,
            }))
        }
    }

    #[async_trait]
    impl StatsSession for MockSession {
        async fn works_revenue(&mut self) -> SqlxResult<f64> {
            Ok(self.figures.works_revenue)
        }

        async fn spare_parts_revenue(&mut self) -> SqlxResult<f64> {
            if self.fail_spare_parts {
                return Err(sqlx::Error::PoolTimedOut);
            }
            Ok(self.figures.spare_parts_revenue)
        }

        async fn orders_total(&mut self) -> SqlxResult<i64> {
            Ok(self.figures.orders.total_orders)
        }

        async fn orders_breakdown(&mut self) -> SqlxResult<OrdersBreakdown> {
            Ok(self.figures.orders)
        }

        async fn discount_buckets(&mut self) -> SqlxResult<Vec<DiscountBucket>> {
            Ok(self.figures.buckets.clone())
        }

        async fn diagnostic_packages_sold(&mut self) -> SqlxResult<i64> {
            Ok(self.figures.packages_sold)
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn current() -> DateRange {
        DateRange::new(date(2025, 3, 1), date(2025, 3, 31))
    }

    // 2025 has 365 days.
    fn prior() -> DateRange {
        DateRange::new(date(2024, 3, 1), date(2024, 3, 31))
    }

    fn orders(total: i64) -> OrdersBreakdown {
        OrdersBreakdown {
            total_orders: total,
            ..OrdersBreakdown::default()
        }
    }

    fn engine(repo: Arc<MockStatsRepository>) -> MetricsEngine {
        MetricsEngine::new(repo, City::new("VLG").unwrap(), current())
            .with_reference_date(date(2025, 6, 15))
    }

    fn ids(block: &MetricBlock) -> Vec<&str> {
        block.metrics.iter().map(|m| m.id.as_str()).collect()
    }

    #[tokio::test]
    async fn short_finance_has_no_comparison_metrics() {
        let repo = Arc::new(MockStatsRepository::default().with(
            current(),
            Figures {
                works_revenue: 1500.5,
                spare_parts_revenue: 499.25,
                ..Figures::default()
            },
        ));

        let block = engine(repo.clone())
            .get_metrics(BlockKind::Finance, OutputMode::Short)
            .await
            .unwrap();

        assert_eq!(ids(&block), vec!["revenue", "works_revenue", "spare_parts_revenue"]);
        assert!(block.metric("average_check").is_none());
        assert!(block.metric("growth_trend").is_none());
        assert_eq!(block.metrics[0].value, MetricValue::Float(1500.5 + 499.25));
        assert_eq!(repo.opened(), vec![current()]);
    }

    #[tokio::test]
    async fn full_finance_compares_with_prior_year() {
        let repo = Arc::new(
            MockStatsRepository::default()
                .with(
                    current(),
                    Figures {
                        works_revenue: 8000.0,
                        spare_parts_revenue: 4000.0,
                        orders: orders(10),
                        ..Figures::default()
                    },
                )
                .with(
                    prior(),
                    Figures {
                        works_revenue: 6000.0,
                        spare_parts_revenue: 2000.0,
                        orders: orders(4),
                        ..Figures::default()
                    },
                ),
        );

        let block = engine(repo.clone())
            .get_metrics(BlockKind::Finance, OutputMode::Full)
            .await
            .unwrap();

        assert_eq!(
            ids(&block),
            vec![
                "revenue",
                "works_revenue",
                "spare_parts_revenue",
                "average_check",
                "growth_trend"
            ]
        );
        // Revenue of this period over last year's order count.
        assert_eq!(
            block.metric("average_check").unwrap().value,
            MetricValue::Float(3000.0)
        );

        let growth = block.metric("growth_trend").unwrap();
        assert_eq!(growth.value, MetricValue::Float(50.0));
        assert_eq!(growth.submetrics_unit.as_deref(), Some(CURRENCY_UNIT));
        let last_year: Vec<f64> = growth
            .submetrics
            .as_ref()
            .unwrap()
            .iter()
            .map(|s| s.value.as_f64())
            .collect();
        assert_eq!(last_year, vec![8000.0, 6000.0, 2000.0]);

        assert_eq!(repo.opened(), vec![current(), prior(), prior()]);
        assert_eq!(repo.closed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_baselines_fall_back_instead_of_failing() {
        let repo = Arc::new(MockStatsRepository::default().with(
            current(),
            Figures {
                works_revenue: 100.0,
                ..Figures::default()
            },
        ));

        let block = engine(repo)
            .get_metrics(BlockKind::Finance, OutputMode::Full)
            .await
            .unwrap();

        assert_eq!(
            block.metric("average_check").unwrap().value,
            MetricValue::Float(0.0)
        );
        assert_eq!(
            block.metric("growth_trend").unwrap().value,
            MetricValue::Float(0.0)
        );
    }

    #[tokio::test]
    async fn no_revenue_in_either_year_reports_full_growth() {
        let repo = Arc::new(MockStatsRepository::default());

        let block = engine(repo)
            .get_metrics(BlockKind::Finance, OutputMode::Full)
            .await
            .unwrap();

        assert_eq!(
            block.metric("growth_trend").unwrap().value,
            MetricValue::Float(100.0)
        );
    }

    #[test]
    fn growth_trend_rounds_to_two_decimals() {
        assert_eq!(growth_trend(200.0, 300.0), -33.33);
        assert_eq!(growth_trend(1.0, 3.0), -66.67);
        assert_eq!(growth_trend(0.0, 50.0), -100.0);
        assert_eq!(growth_trend(5.0, 0.0), 0.0);
        assert_eq!(growth_trend(0.0, 0.0), 100.0);
    }

    #[test]
    fn growth_trend_rounds_half_to_even() {
        assert_eq!(growth_trend(1001.25, 1000.0), 0.12);
        assert_eq!(growth_trend(8010.0, 8000.0), 0.12);
    }

    #[test]
    fn average_check_guards_zero_orders() {
        assert_eq!(average_check(900.0, 0.0), 0.0);
        assert_eq!(average_check(900.0, 3.0), 300.0);
    }

    #[tokio::test]
    async fn session_is_released_when_a_query_fails() {
        let repo = Arc::new(MockStatsRepository {
            fail_spare_parts: true,
            ..MockStatsRepository::default()
        });

        let err = engine(repo.clone())
            .get_metrics(BlockKind::Finance, OutputMode::Full)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::DatabaseError(_)));
        assert_eq!(repo.opened().len(), 1);
        assert_eq!(repo.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn full_orders_block_breaks_down_counts_and_discounts() {
        let repo = Arc::new(MockStatsRepository::default().with(
            current(),
            Figures {
                orders: OrdersBreakdown {
                    total_orders: 40,
                    orders_without_recommendations: 12,
                    orders_without_mileage: 7,
                    orders_without_reasons_appeal: 40,
                    orders_with_discount_lte_10: 3,
                },
                buckets: vec![
                    DiscountBucket {
                        discount_percentage: 12,
                        discount_count: 5,
                    },
                    DiscountBucket {
                        discount_percentage: 15,
                        discount_count: 2,
                    },
                    DiscountBucket {
                        discount_percentage: 30,
                        discount_count: 1,
                    },
                ],
                ..Figures::default()
            },
        ));

        let block = engine(repo)
            .get_metrics(BlockKind::Orders, OutputMode::Full)
            .await
            .unwrap();

        assert_eq!(ids(&block), vec!["orders_count", "orders_with_discount_gte_11"]);

        let count = &block.metrics[0];
        assert_eq!(count.value, MetricValue::Int(40));
        let subcounts = count.submetrics.as_ref().unwrap();
        assert_eq!(subcounts.len(), 4);
        assert!(
            subcounts
                .iter()
                .all(|s| matches!(s.value, MetricValue::Int(n) if n <= 40))
        );
        assert_eq!(subcounts[3].title, "Со скидкой до 11%");

        let discounted = &block.metrics[1];
        let buckets = discounted.submetrics.as_ref().unwrap();
        let titles: Vec<&str> = buckets.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["12 %", "15 %", "30 %"]);
        let sum: i64 = buckets
            .iter()
            .map(|s| match s.value {
                MetricValue::Int(n) => n,
                _ => panic!("bucket counts are integers"),
            })
            .sum();
        assert_eq!(discounted.value, MetricValue::Int(sum));
        assert_eq!(sum, 8);
    }

    #[tokio::test]
    async fn orders_without_discount_buckets_have_no_breakdown() {
        let repo = Arc::new(MockStatsRepository::default().with(
            current(),
            Figures {
                orders: orders(3),
                ..Figures::default()
            },
        ));

        let block = engine(repo)
            .get_metrics(BlockKind::Orders, OutputMode::Full)
            .await
            .unwrap();

        let discounted = block.metric("orders_with_discount_gte_11").unwrap();
        assert_eq!(discounted.value, MetricValue::Int(0));
        assert!(discounted.submetrics.is_none());
    }

    #[tokio::test]
    async fn short_orders_block_is_a_bare_count() {
        let repo = Arc::new(MockStatsRepository::default().with(
            current(),
            Figures {
                orders: orders(17),
                ..Figures::default()
            },
        ));

        let block = engine(repo)
            .get_metrics(BlockKind::Orders, OutputMode::Short)
            .await
            .unwrap();

        assert_eq!(block.metrics.len(), 1);
        assert_eq!(block.metrics[0].value, MetricValue::Int(17));
        assert!(block.metrics[0].submetrics.is_none());
    }

    #[tokio::test]
    async fn diagnostic_packages_block_counts_sales() {
        let repo = Arc::new(MockStatsRepository::default().with(
            current(),
            Figures {
                packages_sold: 6,
                ..Figures::default()
            },
        ));

        let block = engine(repo)
            .get_metrics(BlockKind::DiagnosticPackages, OutputMode::Full)
            .await
            .unwrap();

        assert_eq!(block.block_id, BlockKind::DiagnosticPackages);
        assert_eq!(ids(&block), vec!["packages_sold"]);
        assert_eq!(block.metrics[0].value, MetricValue::Int(6));
    }

    #[test]
    fn page_window_selects_requested_page() {
        assert_eq!(page_window(35, 10, 2), 10..20);
        assert_eq!(page_window(15, 10, 2), 10..15);
        assert_eq!(page_window(35, 10, 1), 0..10);
    }

    #[test]
    fn page_window_falls_back_to_first_page() {
        assert_eq!(page_window(25, 10, 4), 0..10);
        assert_eq!(page_window(5, 10, 3), 0..5);
        // Only a count strictly below the start triggers the fallback.
        assert_eq!(page_window(20, 10, 3), 20..20);
    }

    #[test]
    fn non_positive_page_returns_everything() {
        assert_eq!(page_window(42, 10, 0), 0..42);
        assert_eq!(page_window(42, 10, -3), 0..42);
    }

    #[derive(Default)]
    struct MockOrdersRepository {
        rows: Vec<OrderRow>,
        filters: Mutex<Vec<OrderFilter>>,
    }

    #[async_trait]
    impl OrdersRepository for MockOrdersRepository {
        async fn find_orders(
            &self,
            _city: &City,
            _range: &DateRange,
            filter: &OrderFilter,
        ) -> AppResult<Vec<OrderRow>> {
            self.filters.lock().unwrap().push(filter.clone());
            Ok(self.rows.clone())
        }
    }

    fn order_rows(n: usize) -> Vec<OrderRow> {
        (0..n)
            .map(|i| OrderRow {
                fullnumber: format!("ЗН-{:05}", i),
                date_create: date(2025, 3, 1).and_hms_opt(9, 0, i as u32 % 60).unwrap(),
                client_fullname: Some(format!("Client {}", i)),
                avg_discount_work: Some(5),
            })
            .collect()
    }

    #[tokio::test]
    async fn orders_page_keeps_total_count() {
        let repo = Arc::new(MockOrdersRepository {
            rows: order_rows(25),
            ..MockOrdersRepository::default()
        });
        let service = OrdersService::new(repo);
        let city = City::new("VLG").unwrap();

        let page = service
            .get_orders_count_and_list(&city, current(), None, &[], 10, 2)
            .await
            .unwrap();
        assert_eq!(page.count, 25);
        let numbers: Vec<&str> = page.orders.iter().map(|o| o.fullnumber.as_str()).collect();
        assert_eq!(numbers.first(), Some(&"ЗН-00010"));
        assert_eq!(numbers.len(), 10);

        let all = service
            .get_orders_count_and_list(&city, current(), None, &[], 10, 0)
            .await
            .unwrap();
        assert_eq!(all.count, 25);
        assert_eq!(all.orders.len(), 25);
    }

    #[tokio::test]
    async fn long_search_is_rejected_before_querying() {
        let repo = Arc::new(MockOrdersRepository::default());
        let service = OrdersService::new(repo.clone());
        let city = City::new("VLG").unwrap();

        let search = "7".repeat(22);
        let err = service
            .get_orders_count_and_list(&city, current(), Some(search.as_str()), &[], 10, 1)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::SearchTermTooLong { length: 22 }));
        assert!(repo.filters.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_tags_do_not_filter() {
        let repo = Arc::new(MockOrdersRepository::default());
        let service = OrdersService::new(repo.clone());
        let city = City::new("VLG").unwrap();

        service
            .get_orders_count_and_list(&city, current(), None, &["nonexistent".to_string()], 10, 1)
            .await
            .unwrap();
        service
            .get_orders_count_and_list(&city, current(), None, &[], 10, 1)
            .await
            .unwrap();

        let filters = repo.filters.lock().unwrap();
        assert_eq!(filters[0], filters[1]);
        assert!(filters[0].having_conditions().is_empty());
    }

    #[test]
    fn overall_health_takes_the_worst_status() {
        let healthy = HealthStatus::Healthy;
        let degraded = HealthStatus::Degraded("slow".into());
        let down = HealthStatus::Unhealthy("down".into());

        assert!(matches!(overall_health([&healthy]), HealthStatus::Healthy));
        assert!(matches!(
            overall_health([&healthy, &degraded]),
            HealthStatus::Degraded(_)
        ));
        assert!(matches!(
            overall_health([&degraded, &down, &healthy]),
            HealthStatus::Unhealthy(_)
        ));
    }
}
