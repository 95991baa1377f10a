use crate::error::Error;
use crate::export::Exporter;
use crate::models::{AccountMetrics, AdBreakdown, AdMetric, ConsolidatedMetrics, Demographics, Post};
use chrono::{DateTime, NaiveDate, Utc};
use datafusion::arrow::array::{
    Date32Builder, Float64Builder, RecordBatch, StringBuilder, UInt64Builder,
};
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::dataframe::DataFrameWriteOptions;
use datafusion::prelude::{DataFrame, SessionContext};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const ADS_FILE: &str = "ads.parquet";
pub const AD_BREAKDOWNS_FILE: &str = "ad_breakdowns.parquet";
pub const POSTS_FILE: &str = "top_posts.parquet";
pub const DEMOGRAPHICS_FILE: &str = "demographics.parquet";

/// `dimension` values of the demographics file.
pub const AGE_GENDER: &str = "age_gender";
pub const COUNTRY: &str = "country";

pub fn insights_file(account_id: &str) -> String {
    format!("insights-{}.parquet", account_id)
}

/// Describes an export directory: the reporting window, the account files in
/// their original order, and how many ad rows were written.
/// `ad_rows` is `None` when no ad account could be fetched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub accounts: Vec<String>,
    pub ad_rows: Option<usize>,
}

/// Creates the schema for per-account insight files.
///
/// # Returns
/// An [`Arc<Schema>`] with one row per data point. `metric`, `date` and
/// `value` are null on the placeholder row of an account (or metric) that
/// has no data in the window.
pub fn insights_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("account_id", DataType::Utf8, false),
        Field::new("account_name", DataType::Utf8, false),
        Field::new("platform", DataType::Utf8, false),
        Field::new("metric", DataType::Utf8, true),
        Field::new("date", DataType::Date32, true),
        Field::new("value", DataType::Float64, true),
    ]))
}

/// Creates the schema for ad campaign data.
pub fn ads_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("ad_account_id", DataType::Utf8, false),
        Field::new("campaign_id", DataType::Utf8, false),
        Field::new("campaign_name", DataType::Utf8, false),
        Field::new("date", DataType::Date32, false),
        Field::new("spend", DataType::Float64, false),
        Field::new("clicks", DataType::UInt64, false),
        Field::new("impressions", DataType::UInt64, false),
        Field::new("reach", DataType::UInt64, false),
    ]))
}

pub fn ad_breakdowns_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("ad_account_id", DataType::Utf8, false),
        Field::new("breakdown", DataType::Utf8, false),
        Field::new("segment", DataType::Utf8, false),
        Field::new("spend", DataType::Float64, false),
        Field::new("clicks", DataType::UInt64, false),
        Field::new("impressions", DataType::UInt64, false),
        Field::new("reach", DataType::UInt64, false),
        Field::new("cost_per_result", DataType::Float64, true),
    ]))
}

pub fn posts_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("post_id", DataType::Utf8, false),
        Field::new("account_id", DataType::Utf8, false),
        Field::new("platform", DataType::Utf8, false),
        Field::new("created", DataType::Date32, false),
        Field::new("text", DataType::Utf8, true),
        Field::new("media_type", DataType::Utf8, true),
        Field::new("permalink", DataType::Utf8, true),
        Field::new("views", DataType::UInt64, false),
        Field::new("reach", DataType::UInt64, false),
        Field::new("engagement", DataType::UInt64, false),
    ]))
}

/// Long format: one row per account, dimension and segment.
pub fn demographics_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("account_id", DataType::Utf8, false),
        Field::new("platform", DataType::Utf8, false),
        Field::new("dimension", DataType::Utf8, false),
        Field::new("segment", DataType::Utf8, false),
        Field::new("count", DataType::UInt64, false),
    ]))
}

/// Converts one account's insight series to a DataFrame.
///
/// # Arguments
/// * `account_metrics` - The account and its metrics
/// * `ctx` - A reference to the [`SessionContext`] for DataFrame operations
/// * `schema` - Usually [`insights_schema`]
///
/// # Returns
/// A Result containing either a [`DataFrame`] or an [`Error`]
pub fn convert_insights_to_df(
    account_metrics: &AccountMetrics,
    ctx: &SessionContext,
    schema: Arc<Schema>,
) -> Result<DataFrame, Error> {
    let account = &account_metrics.account;
    let platform = account.platform.to_string();

    let mut account_id_builder = StringBuilder::new();
    let mut account_name_builder = StringBuilder::new();
    let mut platform_builder = StringBuilder::new();
    let mut metric_builder = StringBuilder::new();
    let mut date_builder = Date32Builder::new();
    let mut value_builder = Float64Builder::new();

    let mut append = |metric: Option<&str>, date: Option<NaiveDate>, value: Option<f64>| {
        account_id_builder.append_value(&account.id);
        account_name_builder.append_value(&account.name);
        platform_builder.append_value(&platform);
        metric_builder.append_option(metric);
        date_builder.append_option(date.map(date_as_unix_days));
        value_builder.append_option(value);
    };

    if account_metrics.metrics.is_empty() {
        append(None, None, None);
    }
    for metric in &account_metrics.metrics {
        if metric.values.is_empty() {
            append(Some(&metric.name), None, None);
        }
        for point in &metric.values {
            append(Some(&metric.name), Some(point.date), Some(point.value));
        }
    }

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(account_id_builder.finish()),
            Arc::new(account_name_builder.finish()),
            Arc::new(platform_builder.finish()),
            Arc::new(metric_builder.finish()),
            Arc::new(date_builder.finish()),
            Arc::new(value_builder.finish()),
        ],
    )?;

    Ok(ctx.read_batch(batch)?)
}

/// Converts ad campaign rows to a DataFrame.
pub fn convert_ads_to_df(
    ads: &[AdMetric],
    ctx: &SessionContext,
    schema: Arc<Schema>,
) -> Result<DataFrame, Error> {
    let num_entries = ads.len();

    let mut ad_account_id_builder = StringBuilder::new();
    let mut campaign_id_builder = StringBuilder::new();
    let mut campaign_name_builder = StringBuilder::new();
    let mut date_builder = Date32Builder::with_capacity(num_entries);
    let mut spend_builder = Float64Builder::with_capacity(num_entries);
    let mut clicks_builder = UInt64Builder::with_capacity(num_entries);
    let mut impressions_builder = UInt64Builder::with_capacity(num_entries);
    let mut reach_builder = UInt64Builder::with_capacity(num_entries);

    for ad in ads {
        ad_account_id_builder.append_value(&ad.ad_account_id);
        campaign_id_builder.append_value(&ad.campaign_id);
        campaign_name_builder.append_value(&ad.campaign_name);
        date_builder.append_value(date_as_unix_days(ad.date));
        spend_builder.append_value(ad.spend);
        clicks_builder.append_value(ad.clicks);
        impressions_builder.append_value(ad.impressions);
        reach_builder.append_value(ad.reach);
    }

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ad_account_id_builder.finish()),
            Arc::new(campaign_id_builder.finish()),
            Arc::new(campaign_name_builder.finish()),
            Arc::new(date_builder.finish()),
            Arc::new(spend_builder.finish()),
            Arc::new(clicks_builder.finish()),
            Arc::new(impressions_builder.finish()),
            Arc::new(reach_builder.finish()),
        ],
    )?;

    Ok(ctx.read_batch(batch)?)
}

pub fn convert_ad_breakdowns_to_df(
    rows: &[AdBreakdown],
    ctx: &SessionContext,
    schema: Arc<Schema>,
) -> Result<DataFrame, Error> {
    let num_entries = rows.len();

    let mut ad_account_id_builder = StringBuilder::new();
    let mut breakdown_builder = StringBuilder::new();
    let mut segment_builder = StringBuilder::new();
    let mut spend_builder = Float64Builder::with_capacity(num_entries);
    let mut clicks_builder = UInt64Builder::with_capacity(num_entries);
    let mut impressions_builder = UInt64Builder::with_capacity(num_entries);
    let mut reach_builder = UInt64Builder::with_capacity(num_entries);
    let mut cost_builder = Float64Builder::with_capacity(num_entries);

    for row in rows {
        ad_account_id_builder.append_value(&row.ad_account_id);
        breakdown_builder.append_value(row.breakdown.api_name());
        segment_builder.append_value(&row.segment);
        spend_builder.append_value(row.spend);
        clicks_builder.append_value(row.clicks);
        impressions_builder.append_value(row.impressions);
        reach_builder.append_value(row.reach);
        cost_builder.append_option(row.cost_per_result);
    }

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ad_account_id_builder.finish()),
            Arc::new(breakdown_builder.finish()),
            Arc::new(segment_builder.finish()),
            Arc::new(spend_builder.finish()),
            Arc::new(clicks_builder.finish()),
            Arc::new(impressions_builder.finish()),
            Arc::new(reach_builder.finish()),
            Arc::new(cost_builder.finish()),
        ],
    )?;

    Ok(ctx.read_batch(batch)?)
}

pub fn convert_posts_to_df(
    posts: &[Post],
    ctx: &SessionContext,
    schema: Arc<Schema>,
) -> Result<DataFrame, Error> {
    let num_entries = posts.len();

    let mut post_id_builder = StringBuilder::new();
    let mut account_id_builder = StringBuilder::new();
    let mut platform_builder = StringBuilder::new();
    let mut created_builder = Date32Builder::with_capacity(num_entries);
    let mut text_builder = StringBuilder::new();
    let mut media_type_builder = StringBuilder::new();
    let mut permalink_builder = StringBuilder::new();
    let mut views_builder = UInt64Builder::with_capacity(num_entries);
    let mut reach_builder = UInt64Builder::with_capacity(num_entries);
    let mut engagement_builder = UInt64Builder::with_capacity(num_entries);

    for post in posts {
        post_id_builder.append_value(&post.id);
        account_id_builder.append_value(&post.account_id);
        platform_builder.append_value(post.platform.to_string());
        created_builder.append_value(date_as_unix_days(post.created));
        text_builder.append_option(post.text.as_deref());
        media_type_builder.append_option(post.media_type.as_deref());
        permalink_builder.append_option(post.permalink.as_deref());
        views_builder.append_value(post.views);
        reach_builder.append_value(post.reach);
        engagement_builder.append_value(post.engagement);
    }

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(post_id_builder.finish()),
            Arc::new(account_id_builder.finish()),
            Arc::new(platform_builder.finish()),
            Arc::new(created_builder.finish()),
            Arc::new(text_builder.finish()),
            Arc::new(media_type_builder.finish()),
            Arc::new(permalink_builder.finish()),
            Arc::new(views_builder.finish()),
            Arc::new(reach_builder.finish()),
            Arc::new(engagement_builder.finish()),
        ],
    )?;

    Ok(ctx.read_batch(batch)?)
}

pub fn convert_demographics_to_df(
    demographics: &[Demographics],
    ctx: &SessionContext,
    schema: Arc<Schema>,
) -> Result<DataFrame, Error> {
    let mut account_id_builder = StringBuilder::new();
    let mut platform_builder = StringBuilder::new();
    let mut dimension_builder = StringBuilder::new();
    let mut segment_builder = StringBuilder::new();
    let mut count_builder = UInt64Builder::new();

    for audience in demographics {
        let platform = audience.platform.to_string();
        let segments = audience
            .age_gender
            .iter()
            .map(|segment| (AGE_GENDER, segment))
            .chain(audience.country.iter().map(|segment| (COUNTRY, segment)));

        for (dimension, (segment, count)) in segments {
            account_id_builder.append_value(&audience.account_id);
            platform_builder.append_value(&platform);
            dimension_builder.append_value(dimension);
            segment_builder.append_value(segment);
            count_builder.append_value(*count);
        }
    }

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(account_id_builder.finish()),
            Arc::new(platform_builder.finish()),
            Arc::new(dimension_builder.finish()),
            Arc::new(segment_builder.finish()),
            Arc::new(count_builder.finish()),
        ],
    )?;

    Ok(ctx.read_batch(batch)?)
}

async fn save_parquet(df: DataFrame, path: &Path) -> Result<(), Error> {
    debug!("Writing {}", path.display());
    df.write_parquet(
        &path.to_string_lossy(),
        DataFrameWriteOptions::new().with_single_file_output(true),
        None,
    )
    .await?;
    Ok(())
}

fn date_as_unix_days(date: NaiveDate) -> i32 {
    (date - DateTime::<Utc>::UNIX_EPOCH.date_naive()).num_days() as i32
}

/// Local sink: one Parquet file per account, one for ads, and a manifest.
/// Top posts, demographics and ad breakdowns get a file each when present.
pub struct ParquetExporter {
    ctx: SessionContext,
}

impl ParquetExporter {
    pub fn new() -> Self {
        ParquetExporter {
            ctx: SessionContext::new(),
        }
    }
}

impl Default for ParquetExporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Exporter for ParquetExporter {
    async fn export(&self, metrics: &ConsolidatedMetrics, target: &str) -> Result<String, Error> {
        let output_dir = Path::new(target);
        fs::create_dir_all(output_dir)?;

        for account_metrics in metrics.accounts() {
            let df = convert_insights_to_df(account_metrics, &self.ctx, insights_schema())?;
            let path = output_dir.join(insights_file(&account_metrics.account.id));
            save_parquet(df, &path).await?;
        }

        let ads = metrics.ad_metrics();
        if let Some(ads) = ads.filter(|ads| !ads.is_empty()) {
            let df = convert_ads_to_df(ads, &self.ctx, ads_schema())?;
            save_parquet(df, &output_dir.join(ADS_FILE)).await?;
        }

        if !metrics.ad_breakdowns().is_empty() {
            let df = convert_ad_breakdowns_to_df(metrics.ad_breakdowns(), &self.ctx, ad_breakdowns_schema())?;
            save_parquet(df, &output_dir.join(AD_BREAKDOWNS_FILE)).await?;
        }
        if !metrics.top_posts().is_empty() {
            let df = convert_posts_to_df(metrics.top_posts(), &self.ctx, posts_schema())?;
            save_parquet(df, &output_dir.join(POSTS_FILE)).await?;
        }
        if !metrics.demographics().is_empty() {
            let df = convert_demographics_to_df(metrics.demographics(), &self.ctx, demographics_schema())?;
            save_parquet(df, &output_dir.join(DEMOGRAPHICS_FILE)).await?;
        }

        let manifest = ExportManifest {
            start: metrics.date_range().start(),
            end: metrics.date_range().end(),
            accounts: metrics
                .accounts()
                .iter()
                .map(|a| a.account.id.clone())
                .collect(),
            ad_rows: ads.map(<[AdMetric]>::len),
        };
        fs::write(
            output_dir.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&manifest)?,
        )?;

        info!(
            "Saved {} account files to {}",
            manifest.accounts.len(),
            output_dir.display()
        );
        Ok(output_dir.display().to_string())
    }
}
