use crate::api_client::{GraphApi, RawAdBreakdown, RawAdInsight, RawMetricSeries, RawPost};
use crate::date_range::{parse_date, DateRange};
use crate::error::Error;
use crate::models::{
    Account, AccountMetrics, AdAccount, AdBreakdown, AdMetric, Breakdown, ConsolidatedMetrics,
    DataPoint, Demographics, InsightMetric, Platform, Post,
};
use chrono::NaiveDate;
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

pub const DEFAULT_TOP_POSTS: usize = 10;

/// Receives the accounts that were dropped from a run.
#[cfg_attr(test, mockall::automock)]
pub trait FetchObserver: Send + Sync {
    fn account_skipped(&self, account_id: &str, error: &Error);
}

/// Default observer, reports through the `log` facade.
pub struct LogObserver;

impl FetchObserver for LogObserver {
    fn account_skipped(&self, account_id: &str, error: &Error) {
        warn!("Skipping account {}: {}", account_id, error);
    }
}

/// Pulls accounts and their insights through a [`GraphApi`] and merges them
/// into one [`ConsolidatedMetrics`]. Accounts are fetched one after the other.
pub struct AnalyticsService {
    api: Arc<dyn GraphApi>,
    observer: Arc<dyn FetchObserver>,
}

impl AnalyticsService {
    pub fn new(api: Arc<dyn GraphApi>, observer: Arc<dyn FetchObserver>) -> Self {
        AnalyticsService { api, observer }
    }

    /// Pages and their linked Instagram Business accounts, in API order,
    /// without duplicates.
    pub async fn get_connected_accounts(&self) -> Result<Vec<Account>, Error> {
        info!("Fetching connected accounts");
        let pages = self.api.list_pages().await?;

        let mut seen = HashSet::new();
        let mut accounts = vec![];

        for page in pages {
            let linked = page.instagram_business_account.clone();

            if seen.insert(page.id.clone()) {
                debug!("Added Facebook Page: {} (ID: {})", page.name, page.id);
                accounts.push(Account {
                    id: page.id,
                    platform: Platform::FacebookPage,
                    name: page.name,
                    category: page.category,
                    connected: true,
                });
            }

            if let Some(ig) = linked {
                if seen.insert(ig.id.clone()) {
                    let name = ig
                        .username
                        .or(ig.name)
                        .unwrap_or_else(|| "Unknown".to_string());
                    debug!("Added Instagram account: {} (ID: {})", name, ig.id);
                    accounts.push(Account {
                        id: ig.id,
                        platform: Platform::InstagramBusiness,
                        name,
                        category: Some("Instagram Business Account".to_string()),
                        connected: true,
                    });
                }
            }
        }

        info!("Found {} connected accounts", accounts.len());
        Ok(accounts)
    }

    pub async fn get_ad_accounts(&self) -> Result<Vec<AdAccount>, Error> {
        let records = self.api.list_ad_accounts().await?;
        Ok(records
            .into_iter()
            .map(|record| AdAccount {
                name: record
                    .name
                    .unwrap_or_else(|| format!("Ad Account {}", record.id)),
                id: record.id,
                account_status: record.account_status,
            })
            .collect())
    }

    /// Fetches the insight metric set for every connected account (or only
    /// `account_filter`) plus ad performance, and merges the results.
    ///
    /// An account whose fetch fails is reported to the observer and left out.
    /// The call only fails when nothing at all could be fetched.
    pub async fn get_consolidated_metrics(
        &self,
        date_range: &DateRange,
        account_filter: Option<&str>,
        ad_account_filter: Option<&str>,
    ) -> Result<ConsolidatedMetrics, Error> {
        info!("Fetching consolidated metrics from {}", date_range);

        let mut accounts = self.get_connected_accounts().await?;
        if let Some(account_id) = account_filter {
            accounts.retain(|account| account.id == account_id);
            if accounts.is_empty() {
                return Err(Error::NoData {
                    message: format!("Account {} is not connected to this token", account_id),
                });
            }
        }

        let mut results = vec![];
        for account in accounts {
            match self.fetch_account_metrics(&account, date_range).await {
                Ok(metrics) => results.push(AccountMetrics { account, metrics }),
                Err(err) => self.observer.account_skipped(&account.id, &err),
            }
        }

        if let (Some(account_id), true) = (account_filter, results.is_empty()) {
            return Err(Error::NoData {
                message: format!("Metrics for account {} could not be fetched", account_id),
            });
        }

        let ad_metrics = self.fetch_ad_metrics(date_range, ad_account_filter).await;
        let has_ads = ad_metrics.as_ref().is_some_and(|ads| !ads.is_empty());

        if results.is_empty() && !has_ads {
            return Err(Error::NoData {
                message: format!("No metrics could be fetched for {}", date_range),
            });
        }

        info!("Consolidated metrics for {} accounts", results.len());
        Ok(ConsolidatedMetrics::new(*date_range, results, ad_metrics))
    }

    async fn fetch_account_metrics(
        &self,
        account: &Account,
        date_range: &DateRange,
    ) -> Result<Vec<InsightMetric>, Error> {
        info!(
            "Fetching {} insights for account {} from {}",
            account.platform, account.id, date_range
        );

        let metric_names: Vec<String> = account
            .platform
            .insight_metrics()
            .iter()
            .map(|name| name.to_string())
            .collect();

        let raw = self
            .api
            .fetch_insights(&account.id, &metric_names, date_range)
            .await?;

        Ok(raw
            .into_iter()
            .map(|series| to_insight_metric(&account.id, series, date_range))
            .collect())
    }

    /// Returns `None` when no ad account produced any data.
    async fn fetch_ad_metrics(
        &self,
        date_range: &DateRange,
        ad_account_filter: Option<&str>,
    ) -> Option<Vec<AdMetric>> {
        let ad_account_ids = match ad_account_filter {
            Some(id) => vec![id.to_string()],
            None => match self.get_ad_accounts().await {
                Ok(accounts) => accounts.into_iter().map(|a| a.id).collect(),
                Err(err) => {
                    self.observer.account_skipped("me/adaccounts", &err);
                    return None;
                }
            },
        };

        let mut ad_metrics = vec![];
        let mut fetched_any = false;

        for ad_account_id in ad_account_ids {
            info!("Processing ad account {}", ad_account_id);
            match self.api.fetch_ad_insights(&ad_account_id, date_range).await {
                Ok(rows) => {
                    fetched_any = true;
                    ad_metrics.extend(
                        rows.into_iter()
                            .filter_map(|row| to_ad_metric(&ad_account_id, row))
                            .filter(|metric| date_range.contains(metric.date)),
                    );
                }
                Err(err) => self.observer.account_skipped(&ad_account_id, &err),
            }
        }

        fetched_any.then_some(ad_metrics)
    }

    /// Posts (Pages) or media (Instagram) published in the window, most
    /// viewed first. Ties keep the API's order.
    pub async fn get_top_posts(
        &self,
        account: &Account,
        date_range: &DateRange,
        limit: usize,
    ) -> Result<Vec<Post>, Error> {
        info!("Fetching top posts for {} {}", account.platform, account.id);
        let raw = self
            .api
            .fetch_posts(&account.id, account.platform, date_range)
            .await?;

        let mut posts: Vec<Post> = raw
            .into_iter()
            .filter_map(|post| to_post(account, post))
            .filter(|post| date_range.contains(post.created))
            .collect();
        posts.sort_by(|a, b| b.views.cmp(&a.views));
        posts.truncate(limit);

        debug!("Kept {} top posts for account {}", posts.len(), account.id);
        Ok(posts)
    }

    /// Lifetime audience split by age and gender and by country. `None` when
    /// the API has no audience data for the account.
    pub async fn get_demographic_breakdown(
        &self,
        account: &Account,
    ) -> Result<Option<Demographics>, Error> {
        info!("Fetching demographics for {} {}", account.platform, account.id);
        let [age_gender_metric, country_metric] = account.platform.demographic_metrics();
        let metric_names = vec![age_gender_metric.to_string(), country_metric.to_string()];

        let series = self
            .api
            .fetch_lifetime_insights(&account.id, &metric_names)
            .await?;
        let segments = |name: &str| {
            series
                .iter()
                .find(|s| s.name == name)
                .map(latest_segments)
                .unwrap_or_default()
        };

        let demographics = Demographics {
            account_id: account.id.clone(),
            platform: account.platform,
            age_gender: segments(age_gender_metric),
            country: segments(country_metric),
        };
        Ok((!demographics.is_empty()).then_some(demographics))
    }

    /// Spend and delivery of each ad account split by every [`Breakdown`].
    /// A failing request is reported to the observer and left out.
    pub async fn get_ad_breakdowns(
        &self,
        ad_account_ids: &[String],
        date_range: &DateRange,
    ) -> Vec<AdBreakdown> {
        let mut rows = vec![];
        for ad_account_id in ad_account_ids {
            for breakdown in Breakdown::ALL {
                info!("Fetching {} breakdown for ad account {}", breakdown, ad_account_id);
                match self
                    .api
                    .fetch_ad_breakdown(ad_account_id, breakdown, date_range)
                    .await
                {
                    Ok(raw) => rows.extend(
                        raw.into_iter()
                            .map(|row| to_ad_breakdown(ad_account_id, breakdown, row)),
                    ),
                    Err(err) => self.observer.account_skipped(ad_account_id, &err),
                }
            }
        }
        rows
    }

    /// Adds top posts and demographics for every account in `metrics`, and
    /// breakdowns for every ad account that reported data. Failures are
    /// reported to the observer; the metrics themselves are kept as they are.
    pub async fn with_audience_details(
        &self,
        metrics: ConsolidatedMetrics,
        top_posts_limit: usize,
    ) -> ConsolidatedMetrics {
        let date_range = *metrics.date_range();
        let mut top_posts = vec![];
        let mut demographics = vec![];

        for account_metrics in metrics.accounts() {
            let account = &account_metrics.account;
            match self.get_top_posts(account, &date_range, top_posts_limit).await {
                Ok(posts) => top_posts.extend(posts),
                Err(err) => self.observer.account_skipped(&account.id, &err),
            }
            match self.get_demographic_breakdown(account).await {
                Ok(Some(found)) => demographics.push(found),
                Ok(None) => debug!("No demographics for account {}", account.id),
                Err(err) => self.observer.account_skipped(&account.id, &err),
            }
        }

        let mut ad_account_ids: Vec<String> = vec![];
        for ad in metrics.ad_metrics().unwrap_or_default() {
            if !ad_account_ids.contains(&ad.ad_account_id) {
                ad_account_ids.push(ad.ad_account_id.clone());
            }
        }
        let ad_breakdowns = self.get_ad_breakdowns(&ad_account_ids, &date_range).await;

        metrics
            .with_top_posts(top_posts)
            .with_demographics(demographics)
            .with_ad_breakdowns(ad_breakdowns)
    }
}

/// Turns a raw API series into a clean daily series: non-numeric values are
/// dropped, points outside the range are dropped, and when a date is reported
/// twice the last value wins.
pub fn to_insight_metric(
    account_id: &str,
    series: RawMetricSeries,
    date_range: &DateRange,
) -> InsightMetric {
    let mut by_date = BTreeMap::new();

    for raw in series.values {
        let Some(date) = raw.end_time.as_deref().and_then(end_time_date) else {
            continue;
        };
        let Some(value) = numeric(&raw.value) else {
            continue;
        };
        if date_range.contains(date) {
            by_date.insert(date, value);
        }
    }

    InsightMetric {
        account_id: account_id.to_string(),
        name: series.name,
        values: by_date
            .into_iter()
            .map(|(date, value)| DataPoint { date, value })
            .collect(),
    }
}

fn to_ad_metric(ad_account_id: &str, row: RawAdInsight) -> Option<AdMetric> {
    let date = parse_date(&row.date_start).ok()?;
    let campaign_id = row.campaign_id.unwrap_or_default();

    Some(AdMetric {
        ad_account_id: ad_account_id.to_string(),
        campaign_name: row
            .campaign_name
            .unwrap_or_else(|| format!("Campaign {}", campaign_id)),
        campaign_id,
        date,
        spend: parse_number(row.spend.as_deref()),
        clicks: parse_count("clicks", row.clicks.as_deref()),
        impressions: parse_count("impressions", row.impressions.as_deref()),
        reach: parse_count("reach", row.reach.as_deref()),
    })
}

fn to_ad_breakdown(ad_account_id: &str, breakdown: Breakdown, row: RawAdBreakdown) -> AdBreakdown {
    AdBreakdown {
        ad_account_id: ad_account_id.to_string(),
        breakdown,
        segment: row.segment(breakdown).unwrap_or("Unknown").to_string(),
        spend: parse_number(row.spend.as_deref()),
        clicks: parse_count("clicks", row.clicks.as_deref()),
        impressions: parse_count("impressions", row.impressions.as_deref()),
        reach: parse_count("reach", row.reach.as_deref()),
        cost_per_result: cost_per_result(&row.cost_per_result),
    }
}

/// The API reports cost per result as a list of result types, each with its
/// own values. The first value of the first type is used.
fn cost_per_result(value: &Value) -> Option<f64> {
    match value {
        Value::Array(results) => results
            .first()
            .and_then(|result| cost_per_result(&result["values"][0]["value"])),
        other => numeric(other),
    }
}

/// Posts without a parseable creation time are dropped.
fn to_post(account: &Account, raw: RawPost) -> Option<Post> {
    let created = raw.created_time.as_deref().and_then(end_time_date)?;
    let [views, reach, engagement] = account.platform.post_metrics();
    let lifetime = |name: &str| {
        raw.insights
            .data
            .iter()
            .find(|series| series.name == name)
            .and_then(|series| series.values.last())
            .map(|latest| count_value(&latest.value))
            .unwrap_or(0)
    };

    Some(Post {
        views: lifetime(views),
        reach: lifetime(reach),
        engagement: lifetime(engagement),
        id: raw.id,
        account_id: account.id.clone(),
        platform: account.platform,
        created,
        text: raw.message,
        media_type: raw.media_type,
        permalink: raw.permalink,
    })
}

/// A plain count, or a map of counts (reactions by type) summed.
fn count_value(value: &Value) -> u64 {
    match value {
        Value::Object(counts) => counts.values().filter_map(Value::as_u64).sum(),
        other => other.as_u64().unwrap_or(0),
    }
}

/// Segment counts from the most recent value of a lifetime audience metric.
fn latest_segments(series: &RawMetricSeries) -> BTreeMap<String, u64> {
    let Some(Value::Object(counts)) = series.values.last().map(|latest| &latest.value) else {
        return BTreeMap::new();
    };
    counts
        .iter()
        .filter_map(|(segment, count)| match count.as_u64() {
            Some(count) => Some((segment.clone(), count)),
            None => {
                debug!("Ignoring {} segment '{}': {}", series.name, segment, count);
                None
            }
        })
        .collect()
}

/// Date part of a Graph API timestamp such as `2024-01-02T08:00:00+0000`.
fn end_time_date(end_time: &str) -> Option<NaiveDate> {
    let date = end_time.split('T').next()?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn numeric(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn parse_number(raw: Option<&str>) -> f64 {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// Counts are whole and non-negative. Anything else is read as 0.
fn parse_count(field: &str, raw: Option<&str>) -> u64 {
    let Some(raw) = raw else {
        return 0;
    };
    match raw.trim().parse::<u64>() {
        Ok(count) => count,
        Err(err) => {
            debug!("Ignoring {} value '{}': {}", field, raw, err);
            0
        }
    }
}
