use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgConnection, PgPool, Postgres, QueryBuilder, Result as SqlxResult};
use tracing::{Instrument, error};

use crate::config::{CityDatabaseConfig, DatabaseConfig};
use crate::error::{AppError, AppResult};
use crate::models::{
    City, DateRange, DiscountBucket, HavingCondition, OrderFilter, OrderRow, OrderTag,
    OrdersBreakdown,
};
use crate::observability::db_span;

/// One lazily connected pool per configured city database.
#[derive(Clone, Default)]
pub struct CityPools {
    pools: HashMap<City, PgPool>,
}

impl CityPools {
    pub fn connect_lazy(
        cities: &[CityDatabaseConfig],
        settings: &DatabaseConfig,
    ) -> AppResult<Self> {
        let mut pools = HashMap::with_capacity(cities.len());

        for city_config in cities {
            let city = city_config.city()?;
            let pool = PgPoolOptions::new()
                .max_connections(settings.max_connections)
                .min_connections(settings.min_connections)
                .acquire_timeout(settings.acquire_timeout())
                .max_lifetime(settings.max_lifetime())
                .idle_timeout(settings.idle_timeout())
                .connect_lazy(city_config.url.expose_secret())
                .map_err(|e| {
                    AppError::DatabaseError(e).with_context(format!("pool for city {}", city))
                })?;

            tracing::info!(city = %city, "Database pool configured");
            pools.insert(city, pool);
        }

        Ok(Self { pools })
    }

    pub fn get(&self, city: &City) -> AppResult<&PgPool> {
        self.pools
            .get(city)
            .ok_or_else(|| AppError::UnknownCity(city.to_string()))
    }

    pub async fn acquire(&self, city: &City) -> AppResult<PoolConnection<Postgres>> {
        let pool = self.get(city)?;
        pool.acquire().await.map_err(|e| {
            error!(city = %city, "Failed to acquire database session: {:?}", e);
            AppError::DatabaseError(e)
        })
    }

    pub fn cities(&self) -> Vec<City> {
        let mut cities: Vec<City> = self.pools.keys().cloned().collect();
        cities.sort();
        cities
    }

    pub async fn close(&self) {
        for pool in self.pools.values() {
            pool.close().await;
        }
    }
}

/// Runs queries whose `$1`/`$2` parameters are the bounds of a date range.
pub struct RangeQuery<'c> {
    conn: &'c mut PgConnection,
    range: DateRange,
}

impl<'c> RangeQuery<'c> {
    pub fn new(conn: &'c mut PgConnection, range: DateRange) -> Self {
        Self { conn, range }
    }

    pub async fn one<R>(&mut self, label: &'static str, sql: &'static str) -> SqlxResult<R>
    where
        R: for<'r> FromRow<'r, PgRow> + Send + Unpin + 'static,
    {
        let started = Instant::now();
        let result = sqlx::query_as::<_, R>(sql)
            .bind(self.range.starts_at())
            .bind(self.range.ends_at())
            .fetch_one(&mut *self.conn)
            .instrument(db_span(label, "DOCUMENT_OUT_HEADER"))
            .await;
        record_query(label, started, result.is_ok());
        result
    }

    pub async fn all<R>(&mut self, label: &'static str, sql: &'static str) -> SqlxResult<Vec<R>>
    where
        R: for<'r> FromRow<'r, PgRow> + Send + Unpin + 'static,
    {
        let started = Instant::now();
        let result = sqlx::query_as::<_, R>(sql)
            .bind(self.range.starts_at())
            .bind(self.range.ends_at())
            .fetch_all(&mut *self.conn)
            .instrument(db_span(label, "DOCUMENT_OUT_HEADER"))
            .await;
        record_query(label, started, result.is_ok());
        result
    }

    /// First column of the first row; `None` for no rows or a NULL value.
    pub async fn scalar<T>(&mut self, label: &'static str, sql: &'static str) -> SqlxResult<Option<T>>
    where
        T: for<'r> sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres> + Send + Unpin + 'static,
    {
        let started = Instant::now();
        let result = sqlx::query_scalar::<_, Option<T>>(sql)
            .bind(self.range.starts_at())
            .bind(self.range.ends_at())
            .fetch_optional(&mut *self.conn)
            .instrument(db_span(label, "DOCUMENT_OUT_HEADER"))
            .await;
        record_query(label, started, result.is_ok());
        result.map(Option::flatten)
    }

    pub async fn scalar_or_zero<T>(&mut self, label: &'static str, sql: &'static str) -> SqlxResult<T>
    where
        T: for<'r> sqlx::Decode<'r, Postgres>
            + sqlx::Type<Postgres>
            + Default
            + Send
            + Unpin
            + 'static,
    {
        Ok(self.scalar(label, sql).await?.unwrap_or_default())
    }
}

fn record_query(label: &'static str, started: Instant, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    metrics::histogram!("db_query_duration_seconds", "query" => label, "status" => status)
        .record(started.elapsed().as_secs_f64());
    if !ok {
        error!(query = label, "Database query failed");
    }
}

const WORKS_REVENUE_SQL: &str = r#"
    SELECT SUM(SUMMA_WORK)::float8
    FROM DOCUMENT_SERVICE_DETAIL ds
    JOIN DOCUMENT_OUT_HEADER doh
        ON ds.DOCUMENT_OUT_HEADER_ID = doh.DOCUMENT_OUT_HEADER_ID
    WHERE doh.DATE_CREATE BETWEEN $1 AND $2
        AND doh.DOCUMENT_TYPE_ID = 11
        AND doh.STATE = 4
"#;

const SPARE_PARTS_REVENUE_SQL: &str = r#"
    SELECT SUM(COST * GOODS_COUNT)::float8
    FROM GOODS_OUT go
    JOIN DOCUMENT_OUT do
        ON go.DOCUMENT_OUT_ID = do.DOCUMENT_OUT_ID
    JOIN DOCUMENT_OUT_HEADER doh
        ON do.DOCUMENT_OUT_ID = doh.DOCUMENT_OUT_ID
    WHERE doh.DATE_CREATE BETWEEN $1 AND $2
        AND doh.DOCUMENT_TYPE_ID IN (2, 3, 11)
        AND doh.STATE = 4
"#;

const ORDERS_TOTAL_SQL: &str = r#"
    SELECT COUNT(DISTINCT doh.DOCUMENT_OUT_HEADER_ID) AS total_orders
    FROM DOCUMENT_OUT_HEADER doh
    LEFT JOIN DOCUMENT_SERVICE_DETAIL ds
        ON doh.DOCUMENT_OUT_HEADER_ID = ds.DOCUMENT_OUT_HEADER_ID
    LEFT JOIN SERVICE_WORK sw
        ON doh.DOCUMENT_OUT_ID = sw.DOCUMENT_OUT_ID
    WHERE doh.DATE_CREATE BETWEEN $1 AND $2
        AND doh.DOCUMENT_TYPE_ID = 11
        AND doh.STATE = 4
"#;

const ORDERS_BREAKDOWN_SQL: &str = r#"
    SELECT
        COUNT(DISTINCT doh.DOCUMENT_OUT_HEADER_ID) AS total_orders,
        COUNT(DISTINCT CASE
            WHEN (ds.SPECIAL_NOTES IS NULL OR CHAR_LENGTH(ds.SPECIAL_NOTES) < 20)
            THEN doh.DOCUMENT_OUT_HEADER_ID
        END) AS orders_without_recommendations,
        COUNT(DISTINCT CASE
            WHEN (ds.RUN_DURING IS NULL OR ds.RUN_BEFORE IS NULL)
            THEN doh.DOCUMENT_OUT_HEADER_ID
        END) AS orders_without_mileage,
        COUNT(DISTINCT CASE
            WHEN ds.REASONS_APPEAL IS NULL
            THEN doh.DOCUMENT_OUT_HEADER_ID
        END) AS orders_without_reasons_appeal,
        COUNT(DISTINCT CASE
            WHEN sw.DISCOUNT_WORK > 0 AND sw.DISCOUNT_WORK <= 10
            THEN doh.DOCUMENT_OUT_HEADER_ID
        END) AS orders_with_discount_lte_10
    FROM DOCUMENT_OUT_HEADER doh
    LEFT JOIN DOCUMENT_SERVICE_DETAIL ds
        ON doh.DOCUMENT_OUT_HEADER_ID = ds.DOCUMENT_OUT_HEADER_ID
    LEFT JOIN SERVICE_WORK sw
        ON doh.DOCUMENT_OUT_ID = sw.DOCUMENT_OUT_ID
    WHERE doh.DATE_CREATE BETWEEN $1 AND $2
        AND doh.DOCUMENT_TYPE_ID = 11
        AND doh.STATE = 4
"#;

const DISCOUNT_BUCKETS_SQL: &str = r#"
    SELECT
        FLOOR(sw.DISCOUNT_WORK)::int4 AS discount_percentage,
        COUNT(*) AS discount_count
    FROM SERVICE_WORK sw
    JOIN DOCUMENT_OUT_HEADER doh
        ON sw.DOCUMENT_OUT_ID = doh.DOCUMENT_OUT_ID
    WHERE sw.DISCOUNT_WORK > 10
        AND doh.DATE_CREATE BETWEEN $1 AND $2
        AND doh.DOCUMENT_TYPE_ID = 11
        AND doh.STATE = 4
    GROUP BY FLOOR(sw.DISCOUNT_WORK)
    ORDER BY discount_percentage
"#;

const DIAGNOSTIC_PACKAGES_SQL: &str = r#"
    SELECT COUNT(ds.DOCUMENT_SERVICE_DETAIL_ID)
    FROM DOCUMENT_SERVICE_DETAIL ds
    JOIN DOCUMENT_OUT_HEADER doh
        ON ds.DOCUMENT_OUT_HEADER_ID = doh.DOCUMENT_OUT_HEADER_ID
    JOIN SERVICE_WORK sw
        ON doh.DOCUMENT_OUT_ID = sw.DOCUMENT_OUT_ID
    WHERE ds.DATE_START BETWEEN $1 AND $2
        AND doh.DOCUMENT_TYPE_ID = 11
        AND doh.STATE = 4
        AND sw.NAME = 'Пакет диагностик при ТО'
"#;

/// A database session bound to one city and one date range.
///
/// Dropping the session returns its connection to the pool, so it is
/// released on every exit path of the caller.
#[async_trait]
pub trait StatsSession: Send {
    async fn works_revenue(&mut self) -> SqlxResult<f64>;
    async fn spare_parts_revenue(&mut self) -> SqlxResult<f64>;
    async fn orders_total(&mut self) -> SqlxResult<i64>;
    async fn orders_breakdown(&mut self) -> SqlxResult<OrdersBreakdown>;
    /// Orders with a discount above 10%, grouped by whole percent, ascending.
    async fn discount_buckets(&mut self) -> SqlxResult<Vec<DiscountBucket>>;
    async fn diagnostic_packages_sold(&mut self) -> SqlxResult<i64>;
}

#[async_trait]
pub trait StatsRepository: Send + Sync {
    async fn open(&self, city: &City, range: DateRange) -> AppResult<Box<dyn StatsSession>>;
}

pub struct PgStatsRepository {
    pools: CityPools,
}

impl PgStatsRepository {
    pub fn new(pools: CityPools) -> Self {
        Self { pools }
    }
}

#[async_trait]
impl StatsRepository for PgStatsRepository {
    async fn open(&self, city: &City, range: DateRange) -> AppResult<Box<dyn StatsSession>> {
        let conn = self.pools.acquire(city).await?;
        tracing::debug!(city = %city, range = %range, "Stats session opened");
        Ok(Box::new(PgStatsSession { conn, range }))
    }
}

pub struct PgStatsSession {
    conn: PoolConnection<Postgres>,
    range: DateRange,
}

impl PgStatsSession {
    fn query(&mut self) -> RangeQuery<'_> {
        RangeQuery::new(&mut self.conn, self.range)
    }
}

#[async_trait]
impl StatsSession for PgStatsSession {
    async fn works_revenue(&mut self) -> SqlxResult<f64> {
        self.query()
            .scalar_or_zero("works_revenue", WORKS_REVENUE_SQL)
            .await
    }

    async fn spare_parts_revenue(&mut self) -> SqlxResult<f64> {
        self.query()
            .scalar_or_zero("spare_parts_revenue", SPARE_PARTS_REVENUE_SQL)
            .await
    }

    async fn orders_total(&mut self) -> SqlxResult<i64> {
        self.query()
            .scalar_or_zero("orders_total", ORDERS_TOTAL_SQL)
            .await
    }

    async fn orders_breakdown(&mut self) -> SqlxResult<OrdersBreakdown> {
        self.query()
            .one("orders_breakdown", ORDERS_BREAKDOWN_SQL)
            .await
    }

    async fn discount_buckets(&mut self) -> SqlxResult<Vec<DiscountBucket>> {
        self.query()
            .all("discount_buckets", DISCOUNT_BUCKETS_SQL)
            .await
    }

    async fn diagnostic_packages_sold(&mut self) -> SqlxResult<i64> {
        self.query()
            .scalar_or_zero("diagnostic_packages_sold", DIAGNOSTIC_PACKAGES_SQL)
            .await
    }
}

#[async_trait]
pub trait OrdersRepository: Send + Sync {
    /// Every matching order, ordered by creation time.
    async fn find_orders(
        &self,
        city: &City,
        range: &DateRange,
        filter: &OrderFilter,
    ) -> AppResult<Vec<OrderRow>>;
}

pub struct PgOrdersRepository {
    pools: CityPools,
}

impl PgOrdersRepository {
    pub fn new(pools: CityPools) -> Self {
        Self { pools }
    }
}

#[async_trait]
impl OrdersRepository for PgOrdersRepository {
    async fn find_orders(
        &self,
        city: &City,
        range: &DateRange,
        filter: &OrderFilter,
    ) -> AppResult<Vec<OrderRow>> {
        let mut conn = self.pools.acquire(city).await?;
        let mut query = orders_list_query(range, filter);

        let started = Instant::now();
        let result = query
            .build_query_as::<OrderRow>()
            .fetch_all(&mut *conn)
            .instrument(db_span("orders_list", "DOCUMENT_OUT_HEADER"))
            .await;
        record_query("orders_list", started, result.is_ok());

        result.map_err(|e| AppError::from(e).with_context(format!("orders list for {}", city)))
    }
}

const ORDERS_LIST_SELECT: &str = r#"
    SELECT doh.FULLNUMBER AS fullnumber,
        doh.DATE_CREATE AS date_create,
        c.FULLNAME AS client_fullname,
        sw.AVG_DISCOUNT_WORK AS avg_discount_work
    FROM DOCUMENT_OUT_HEADER doh
    JOIN DOCUMENT_OUT do
        ON doh.DOCUMENT_OUT_ID = do.DOCUMENT_OUT_ID
    JOIN CLIENT c
        ON do.CLIENT_ID = c.CLIENT_ID
    LEFT JOIN (
        SELECT DOCUMENT_OUT_ID, FLOOR(AVG(DISCOUNT_WORK))::int8 AS AVG_DISCOUNT_WORK
        FROM SERVICE_WORK
        GROUP BY DOCUMENT_OUT_ID
    ) sw ON doh.DOCUMENT_OUT_ID = sw.DOCUMENT_OUT_ID
    LEFT JOIN DOCUMENT_SERVICE_DETAIL ds
        ON doh.DOCUMENT_OUT_HEADER_ID = ds.DOCUMENT_OUT_HEADER_ID
    WHERE (doh.DATE_CREATE BETWEEN "#;

const ORDERS_LIST_GROUP_BY: &str = r#")
        AND doh.DOCUMENT_TYPE_ID = 11
        AND doh.STATE = 4
    GROUP BY doh.FULLNUMBER, doh.DATE_CREATE, c.FULLNAME, sw.AVG_DISCOUNT_WORK,
        ds.SPECIAL_NOTES, ds.RUN_DURING, ds.RUN_BEFORE, ds.REASONS_APPEAL"#;

/// Predicate over grouped order columns selected by a tag.
pub fn tag_predicate(tag: OrderTag) -> &'static str {
    match tag {
        OrderTag::WithoutRecommendations => {
            "(ds.SPECIAL_NOTES IS NULL OR CHAR_LENGTH(ds.SPECIAL_NOTES) < 20)"
        }
        OrderTag::WithoutMileage => "(ds.RUN_DURING IS NULL OR ds.RUN_BEFORE IS NULL)",
        OrderTag::WithoutReasonsAppeal => "(ds.REASONS_APPEAL IS NULL)",
        OrderTag::WithDiscountLte10 => "(sw.AVG_DISCOUNT_WORK > 0 AND sw.AVG_DISCOUNT_WORK <= 10)",
        OrderTag::WithDiscountGte11 => "(sw.AVG_DISCOUNT_WORK >= 11)",
    }
}

pub fn orders_list_query(range: &DateRange, filter: &OrderFilter) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(ORDERS_LIST_SELECT);
    qb.push_bind(range.starts_at());
    qb.push(" AND ");
    qb.push_bind(range.ends_at());
    qb.push(ORDERS_LIST_GROUP_BY);
    push_having_conditions(&mut qb, filter);
    qb.push("\n    ORDER BY doh.DATE_CREATE, doh.FULLNUMBER");
    qb
}

/// Appends the filter's conditions as one `HAVING` clause joined by `AND`,
/// binding `filter.params()` in order.
/// They reference grouped and joined columns, so they cannot go in `WHERE`.
pub fn push_having_conditions(qb: &mut QueryBuilder<'static, Postgres>, filter: &OrderFilter) {
    let mut params = filter.params().into_iter();

    for (i, condition) in filter.having_conditions().iter().enumerate() {
        qb.push(if i == 0 { "\n    HAVING " } else { " AND " });

        match condition {
            HavingCondition::Search => {
                qb.push("(doh.FULLNUMBER LIKE '%' || ");
                qb.push_bind(params.next().unwrap_or_default());
                qb.push(" || '%')");
            }
            HavingCondition::AnyTag(tags) => {
                qb.push("(");
                let mut predicates = qb.separated(" OR ");
                for tag in tags {
                    predicates.push(tag_predicate(*tag));
                }
                predicates.push_unseparated(")");
            }
        }
    }
}
