use crate::date_range::DateRange;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    FacebookPage,
    InstagramBusiness,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::FacebookPage, Platform::InstagramBusiness];

    /// Insight metrics requested for every account on this platform.
    pub fn insight_metrics(&self) -> &'static [&'static str] {
        match self {
            Platform::FacebookPage => &[
                "page_impressions",
                "page_impressions_unique",
                "page_engaged_users",
                "page_post_engagements",
                "page_fans",
            ],
            Platform::InstagramBusiness => {
                &["impressions", "reach", "profile_views", "follower_count"]
            }
        }
    }

    /// Metric that feeds the cross-platform "views" figure.
    pub fn views_metric(&self) -> &'static str {
        match self {
            Platform::FacebookPage => "page_impressions",
            Platform::InstagramBusiness => "impressions",
        }
    }

    pub fn reach_metric(&self) -> &'static str {
        match self {
            Platform::FacebookPage => "page_impressions_unique",
            Platform::InstagramBusiness => "reach",
        }
    }

    pub fn engagement_metric(&self) -> Option<&'static str> {
        match self {
            Platform::FacebookPage => Some("page_post_engagements"),
            Platform::InstagramBusiness => None,
        }
    }

    pub fn follows_metric(&self) -> &'static str {
        match self {
            Platform::FacebookPage => "page_fans",
            Platform::InstagramBusiness => "follower_count",
        }
    }

    /// Lifetime audience metrics: age and gender first, then country.
    pub fn demographic_metrics(&self) -> [&'static str; 2] {
        match self {
            Platform::FacebookPage => ["page_fans_gender_age", "page_fans_country"],
            Platform::InstagramBusiness => ["audience_gender_age", "audience_country"],
        }
    }

    /// Per-post metrics: views, reach and engagement, in that order.
    pub fn post_metrics(&self) -> [&'static str; 3] {
        match self {
            Platform::FacebookPage => [
                "post_impressions",
                "post_impressions_unique",
                "post_reactions_by_type_total",
            ],
            Platform::InstagramBusiness => ["impressions", "reach", "engagement"],
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::FacebookPage => write!(f, "Facebook Page"),
            Platform::InstagramBusiness => write!(f, "Instagram"),
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Facebook Page" => Ok(Platform::FacebookPage),
            "Instagram" => Ok(Platform::InstagramBusiness),
            other => Err(format!("unknown platform '{}'", other)),
        }
    }
}

/// A Facebook Page or Instagram Business account visible to the token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub platform: Platform,
    pub name: String,
    pub category: Option<String>,
    pub connected: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdAccount {
    pub id: String,
    pub name: String,
    pub account_status: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub date: NaiveDate,
    pub value: f64,
}

/// One named daily series for one account. Dates are strictly increasing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InsightMetric {
    pub account_id: String,
    pub name: String,
    pub values: Vec<DataPoint>,
}

impl InsightMetric {
    pub fn total(&self) -> f64 {
        self.values.iter().map(|p| p.value).sum()
    }

    pub fn average(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.total() / self.values.len() as f64
    }
}

/// Daily campaign performance for one ad account.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdMetric {
    pub ad_account_id: String,
    pub campaign_id: String,
    pub campaign_name: String,
    pub date: NaiveDate,
    pub spend: f64,
    pub clicks: u64,
    pub impressions: u64,
    pub reach: u64,
}

/// Dimension an ad account's delivery is split by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Breakdown {
    Age,
    Gender,
    DevicePlatform,
    Region,
}

impl Breakdown {
    pub const ALL: [Breakdown; 4] = [
        Breakdown::Age,
        Breakdown::Gender,
        Breakdown::DevicePlatform,
        Breakdown::Region,
    ];

    /// Value of the `breakdowns` parameter, also the field the segment comes
    /// back in.
    pub fn api_name(&self) -> &'static str {
        match self {
            Breakdown::Age => "age",
            Breakdown::Gender => "gender",
            Breakdown::DevicePlatform => "device_platform",
            Breakdown::Region => "region",
        }
    }
}

impl fmt::Display for Breakdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_name())
    }
}

impl FromStr for Breakdown {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Breakdown::ALL
            .into_iter()
            .find(|breakdown| breakdown.api_name() == s)
            .ok_or_else(|| format!("unknown breakdown '{}'", s))
    }
}

/// Ad delivery of one ad account over the whole window, for one segment of
/// a [`Breakdown`] (e.g. age `25-34`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdBreakdown {
    pub ad_account_id: String,
    pub breakdown: Breakdown,
    pub segment: String,
    pub spend: f64,
    pub clicks: u64,
    pub impressions: u64,
    pub reach: u64,
    pub cost_per_result: Option<f64>,
}

/// A published Page post or Instagram media item with its lifetime figures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub account_id: String,
    pub platform: Platform,
    pub created: NaiveDate,
    pub text: Option<String>,
    pub media_type: Option<String>,
    pub permalink: Option<String>,
    pub views: u64,
    pub reach: u64,
    pub engagement: u64,
}

/// Lifetime audience split of one account. Keys are the API's segment
/// labels: `F.25-34` style for age and gender, ISO country codes for country.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Demographics {
    pub account_id: String,
    pub platform: Platform,
    pub age_gender: BTreeMap<String, u64>,
    pub country: BTreeMap<String, u64>,
}

impl Demographics {
    pub fn is_empty(&self) -> bool {
        self.age_gender.is_empty() && self.country.is_empty()
    }

    /// Audience per gender code (`F`, `M`, `U`).
    pub fn by_gender(&self) -> BTreeMap<String, u64> {
        self.split_age_gender(|gender, _| gender)
    }

    /// Audience per age bracket, genders summed.
    pub fn by_age(&self) -> BTreeMap<String, u64> {
        self.split_age_gender(|_, age| age)
    }

    fn split_age_gender<'a>(&'a self, pick: impl Fn(&'a str, &'a str) -> &'a str) -> BTreeMap<String, u64> {
        let mut totals = BTreeMap::new();
        for (segment, count) in &self.age_gender {
            let (gender, age) = segment.split_once('.').unwrap_or(("U", segment.as_str()));
            *totals.entry(pick(gender, age).to_string()).or_insert(0) += count;
        }
        totals
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AccountMetrics {
    pub account: Account,
    pub metrics: Vec<InsightMetric>,
}

impl AccountMetrics {
    pub fn metric(&self, name: &str) -> Option<&InsightMetric> {
        self.metrics.iter().find(|m| m.name == name)
    }

    fn metric_total(&self, name: &str) -> f64 {
        self.metric(name).map(InsightMetric::total).unwrap_or(0.0)
    }
}

/// Per-platform sums over the reporting window.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PlatformSummary {
    pub views: f64,
    pub reach: f64,
    pub engagement: f64,
    pub follows: f64,
}

/// Everything fetched in one run. Built once, then only read.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsolidatedMetrics {
    date_range: DateRange,
    accounts: Vec<AccountMetrics>,
    ad_metrics: Option<Vec<AdMetric>>,
    top_posts: Vec<Post>,
    demographics: Vec<Demographics>,
    ad_breakdowns: Vec<AdBreakdown>,
}

impl ConsolidatedMetrics {
    pub fn new(
        date_range: DateRange,
        accounts: Vec<AccountMetrics>,
        ad_metrics: Option<Vec<AdMetric>>,
    ) -> Self {
        ConsolidatedMetrics {
            date_range,
            accounts,
            ad_metrics,
            top_posts: vec![],
            demographics: vec![],
            ad_breakdowns: vec![],
        }
    }

    pub fn with_top_posts(mut self, top_posts: Vec<Post>) -> Self {
        self.top_posts = top_posts;
        self
    }

    pub fn with_demographics(mut self, demographics: Vec<Demographics>) -> Self {
        self.demographics = demographics;
        self
    }

    pub fn with_ad_breakdowns(mut self, ad_breakdowns: Vec<AdBreakdown>) -> Self {
        self.ad_breakdowns = ad_breakdowns;
        self
    }

    pub fn date_range(&self) -> &DateRange {
        &self.date_range
    }

    pub fn accounts(&self) -> &[AccountMetrics] {
        &self.accounts
    }

    pub fn ad_metrics(&self) -> Option<&[AdMetric]> {
        self.ad_metrics.as_deref()
    }

    /// Best posts per account, each account's posts ordered by views.
    pub fn top_posts(&self) -> &[Post] {
        &self.top_posts
    }

    pub fn demographics(&self) -> &[Demographics] {
        &self.demographics
    }

    pub fn ad_breakdowns(&self) -> &[AdBreakdown] {
        &self.ad_breakdowns
    }

    /// Spend per segment of `breakdown`, summed over ad accounts, in first
    /// seen order.
    pub fn spend_by(&self, breakdown: Breakdown) -> Vec<(String, f64)> {
        let mut totals: Vec<(String, f64)> = vec![];
        for row in self.ad_breakdowns.iter().filter(|row| row.breakdown == breakdown) {
            match totals.iter_mut().find(|(segment, _)| *segment == row.segment) {
                Some((_, spend)) => *spend += row.spend,
                None => totals.push((row.segment.clone(), row.spend)),
            }
        }
        totals
    }

    pub fn account(&self, account_id: &str) -> Option<&AccountMetrics> {
        self.accounts.iter().find(|a| a.account.id == account_id)
    }

    pub fn platform_summary(&self, platform: Platform) -> PlatformSummary {
        self.accounts
            .iter()
            .filter(|a| a.account.platform == platform)
            .fold(PlatformSummary::default(), |mut summary, a| {
                summary.views += a.metric_total(platform.views_metric());
                summary.reach += a.metric_total(platform.reach_metric());
                if let Some(name) = platform.engagement_metric() {
                    summary.engagement += a.metric_total(name);
                }
                summary.follows += a.metric_total(platform.follows_metric());
                summary
            })
    }
}
