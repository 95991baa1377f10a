use crate::data::{
    insights_file, ExportManifest, ADS_FILE, AD_BREAKDOWNS_FILE, AGE_GENDER, COUNTRY,
    DEMOGRAPHICS_FILE, MANIFEST_FILE, POSTS_FILE,
};
use crate::date_range::DateRange;
use crate::error::Error;
use crate::models::{
    Account, AccountMetrics, AdBreakdown, AdMetric, ConsolidatedMetrics, DataPoint, Demographics,
    InsightMetric, Post,
};
use datafusion::arrow::array::{
    Array, Date32Array, Float64Array, RecordBatch, StringArray, UInt64Array,
};
use datafusion::arrow::compute::{cast_with_options, CastOptions};
use datafusion::arrow::datatypes::DataType;
use datafusion::arrow::error::ArrowError;
use datafusion::prelude::{ParquetReadOptions, SessionContext};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

#[async_trait::async_trait]
pub trait MetricsLoader: Send + Sync + 'static {
    /// Loads a previously exported run.
    ///
    /// # Arguments
    /// * `ctx` - The session context for the DataFrame operations.
    ///
    /// # Returns
    /// A Result containing either the consolidated metrics or an Error.
    async fn load(&self, ctx: &SessionContext) -> Result<ConsolidatedMetrics, Error>;
}

#[derive(Clone)]
pub struct ParquetMetricsLoader {
    input_dir: PathBuf,
}

impl ParquetMetricsLoader {
    pub fn new(input_dir: impl Into<PathBuf>) -> Self {
        ParquetMetricsLoader {
            input_dir: input_dir.into(),
        }
    }

    fn existing_file(&self, name: &str) -> Result<PathBuf, Error> {
        let path = self.input_dir.join(name);
        if fs::metadata(&path).is_err() {
            return Err(Error::ExportFileNotFound {
                path: path.display().to_string(),
            });
        }
        Ok(path)
    }

    /// Batches of an optional file, or nothing when it was not written.
    async fn read_optional(&self, ctx: &SessionContext, name: &str) -> Result<Vec<RecordBatch>, Error> {
        let path = self.input_dir.join(name);
        if !path.exists() {
            return Ok(vec![]);
        }
        Self::read_batches(ctx, &path).await
    }

    async fn read_batches(ctx: &SessionContext, path: &Path) -> Result<Vec<RecordBatch>, Error> {
        let df = ctx
            .read_parquet(&*path.to_string_lossy(), ParquetReadOptions::default())
            .await?;
        Ok(df.collect().await?)
    }
}

#[async_trait::async_trait]
impl MetricsLoader for ParquetMetricsLoader {
    async fn load(&self, ctx: &SessionContext) -> Result<ConsolidatedMetrics, Error> {
        let manifest_path = self.existing_file(MANIFEST_FILE)?;
        let manifest: ExportManifest = serde_json::from_str(&fs::read_to_string(manifest_path)?)?;
        let date_range = DateRange::new(manifest.start, manifest.end)?;

        let mut accounts = Vec::with_capacity(manifest.accounts.len());
        for account_id in &manifest.accounts {
            let path = self.existing_file(&insights_file(account_id))?;
            let batches = Self::read_batches(ctx, &path).await?;
            accounts.push(account_from_batches(account_id, &batches)?);
        }

        let ad_metrics = match manifest.ad_rows {
            None => None,
            Some(0) => Some(vec![]),
            Some(_) => {
                let path = self.existing_file(ADS_FILE)?;
                let batches = Self::read_batches(ctx, &path).await?;
                Some(ads_from_batches(&batches)?)
            }
        };

        let top_posts = posts_from_batches(&self.read_optional(ctx, POSTS_FILE).await?)?;
        let demographics =
            demographics_from_batches(&self.read_optional(ctx, DEMOGRAPHICS_FILE).await?)?;
        let ad_breakdowns =
            ad_breakdowns_from_batches(&self.read_optional(ctx, AD_BREAKDOWNS_FILE).await?)?;

        info!(
            "Loaded {} accounts for {} from {}",
            accounts.len(),
            date_range,
            self.input_dir.display()
        );
        Ok(ConsolidatedMetrics::new(date_range, accounts, ad_metrics)
            .with_top_posts(top_posts)
            .with_demographics(demographics)
            .with_ad_breakdowns(ad_breakdowns))
    }
}

/// Casts a column to `data_type` and downcasts it to the matching array.
/// String columns may come back as views, hence the cast.
fn typed_column<A: Array + Clone + 'static>(
    batch: &RecordBatch,
    name: &str,
    data_type: &DataType,
) -> Result<A, Error> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| ArrowError::SchemaError(format!("column {} is missing", name)))?;

    let column = if column.data_type() != data_type {
        cast_with_options(column.as_ref(), data_type, &CastOptions::default())?
    } else {
        column.clone()
    };

    column.as_any().downcast_ref::<A>().cloned().ok_or_else(|| {
        ArrowError::CastError(format!("column {} is not {}", name, data_type)).into()
    })
}

fn account_from_batches(account_id: &str, batches: &[RecordBatch]) -> Result<AccountMetrics, Error> {
    let mut account: Option<Account> = None;
    let mut metrics: Vec<InsightMetric> = vec![];
    let mut row = 0;

    for batch in batches {
        let names = typed_column::<StringArray>(batch, "account_name", &DataType::Utf8)?;
        let platforms = typed_column::<StringArray>(batch, "platform", &DataType::Utf8)?;
        let metric_names = typed_column::<StringArray>(batch, "metric", &DataType::Utf8)?;
        let dates = typed_column::<Date32Array>(batch, "date", &DataType::Date32)?;
        let values = typed_column::<Float64Array>(batch, "value", &DataType::Float64)?;

        for i in 0..batch.num_rows() {
            row += 1;
            if account.is_none() {
                account = Some(Account {
                    id: account_id.to_string(),
                    platform: platforms
                        .value(i)
                        .parse()
                        .map_err(|message| Error::MalformedRow { row, message })?,
                    name: names.value(i).to_string(),
                    category: None,
                    connected: true,
                });
            }

            if metric_names.is_null(i) {
                continue;
            }
            let name = metric_names.value(i);
            let position = match metrics.iter().position(|m| m.name == name) {
                Some(position) => position,
                None => {
                    metrics.push(InsightMetric {
                        account_id: account_id.to_string(),
                        name: name.to_string(),
                        values: vec![],
                    });
                    metrics.len() - 1
                }
            };

            if dates.is_null(i) {
                continue;
            }
            let date = dates.value_as_date(i).ok_or_else(|| Error::MalformedRow {
                row,
                message: "date out of range".to_string(),
            })?;
            metrics[position].values.push(DataPoint {
                date,
                value: values.value(i),
            });
        }
    }

    for metric in &mut metrics {
        metric.values.sort_by_key(|p| p.date);
    }

    let account = account.ok_or_else(|| Error::NoData {
        message: format!("Export for account {} is empty", account_id),
    })?;
    Ok(AccountMetrics { account, metrics })
}

fn ads_from_batches(batches: &[RecordBatch]) -> Result<Vec<AdMetric>, Error> {
    let mut ads = vec![];
    for batch in batches {
        let ad_account_ids = typed_column::<StringArray>(batch, "ad_account_id", &DataType::Utf8)?;
        let campaign_ids = typed_column::<StringArray>(batch, "campaign_id", &DataType::Utf8)?;
        let campaign_names = typed_column::<StringArray>(batch, "campaign_name", &DataType::Utf8)?;
        let dates = typed_column::<Date32Array>(batch, "date", &DataType::Date32)?;
        let spend = typed_column::<Float64Array>(batch, "spend", &DataType::Float64)?;
        let clicks = typed_column::<UInt64Array>(batch, "clicks", &DataType::UInt64)?;
        let impressions = typed_column::<UInt64Array>(batch, "impressions", &DataType::UInt64)?;
        let reach = typed_column::<UInt64Array>(batch, "reach", &DataType::UInt64)?;

        for i in 0..batch.num_rows() {
            let date = dates.value_as_date(i).ok_or_else(|| Error::MalformedRow {
                row: ads.len() + 1,
                message: "date out of range".to_string(),
            })?;
            ads.push(AdMetric {
                ad_account_id: ad_account_ids.value(i).to_string(),
                campaign_id: campaign_ids.value(i).to_string(),
                campaign_name: campaign_names.value(i).to_string(),
                date,
                spend: spend.value(i),
                clicks: clicks.value(i),
                impressions: impressions.value(i),
                reach: reach.value(i),
            });
        }
    }
    Ok(ads)
}

fn optional_string(column: &StringArray, i: usize) -> Option<String> {
    (!column.is_null(i)).then(|| column.value(i).to_string())
}

fn posts_from_batches(batches: &[RecordBatch]) -> Result<Vec<Post>, Error> {
    let mut posts = vec![];
    for batch in batches {
        let ids = typed_column::<StringArray>(batch, "post_id", &DataType::Utf8)?;
        let account_ids = typed_column::<StringArray>(batch, "account_id", &DataType::Utf8)?;
        let platforms = typed_column::<StringArray>(batch, "platform", &DataType::Utf8)?;
        let created = typed_column::<Date32Array>(batch, "created", &DataType::Date32)?;
        let texts = typed_column::<StringArray>(batch, "text", &DataType::Utf8)?;
        let media_types = typed_column::<StringArray>(batch, "media_type", &DataType::Utf8)?;
        let permalinks = typed_column::<StringArray>(batch, "permalink", &DataType::Utf8)?;
        let views = typed_column::<UInt64Array>(batch, "views", &DataType::UInt64)?;
        let reach = typed_column::<UInt64Array>(batch, "reach", &DataType::UInt64)?;
        let engagement = typed_column::<UInt64Array>(batch, "engagement", &DataType::UInt64)?;

        for i in 0..batch.num_rows() {
            let row = posts.len() + 1;
            posts.push(Post {
                id: ids.value(i).to_string(),
                account_id: account_ids.value(i).to_string(),
                platform: platforms
                    .value(i)
                    .parse()
                    .map_err(|message| Error::MalformedRow { row, message })?,
                created: created.value_as_date(i).ok_or_else(|| Error::MalformedRow {
                    row,
                    message: "date out of range".to_string(),
                })?,
                text: optional_string(&texts, i),
                media_type: optional_string(&media_types, i),
                permalink: optional_string(&permalinks, i),
                views: views.value(i),
                reach: reach.value(i),
                engagement: engagement.value(i),
            });
        }
    }
    Ok(posts)
}

fn demographics_from_batches(batches: &[RecordBatch]) -> Result<Vec<Demographics>, Error> {
    let mut demographics: Vec<Demographics> = vec![];
    let mut row = 0;

    for batch in batches {
        let account_ids = typed_column::<StringArray>(batch, "account_id", &DataType::Utf8)?;
        let platforms = typed_column::<StringArray>(batch, "platform", &DataType::Utf8)?;
        let dimensions = typed_column::<StringArray>(batch, "dimension", &DataType::Utf8)?;
        let segments = typed_column::<StringArray>(batch, "segment", &DataType::Utf8)?;
        let counts = typed_column::<UInt64Array>(batch, "count", &DataType::UInt64)?;

        for i in 0..batch.num_rows() {
            row += 1;
            let account_id = account_ids.value(i);
            let position = match demographics.iter().position(|d| d.account_id == account_id) {
                Some(position) => position,
                None => {
                    demographics.push(Demographics {
                        account_id: account_id.to_string(),
                        platform: platforms
                            .value(i)
                            .parse()
                            .map_err(|message| Error::MalformedRow { row, message })?,
                        age_gender: Default::default(),
                        country: Default::default(),
                    });
                    demographics.len() - 1
                }
            };

            let audience = &mut demographics[position];
            let split = match dimensions.value(i) {
                AGE_GENDER => &mut audience.age_gender,
                COUNTRY => &mut audience.country,
                other => {
                    return Err(Error::MalformedRow {
                        row,
                        message: format!("unknown dimension '{}'", other),
                    })
                }
            };
            split.insert(segments.value(i).to_string(), counts.value(i));
        }
    }
    Ok(demographics)
}

fn ad_breakdowns_from_batches(batches: &[RecordBatch]) -> Result<Vec<AdBreakdown>, Error> {
    let mut rows = vec![];
    for batch in batches {
        let ad_account_ids = typed_column::<StringArray>(batch, "ad_account_id", &DataType::Utf8)?;
        let breakdowns = typed_column::<StringArray>(batch, "breakdown", &DataType::Utf8)?;
        let segments = typed_column::<StringArray>(batch, "segment", &DataType::Utf8)?;
        let spend = typed_column::<Float64Array>(batch, "spend", &DataType::Float64)?;
        let clicks = typed_column::<UInt64Array>(batch, "clicks", &DataType::UInt64)?;
        let impressions = typed_column::<UInt64Array>(batch, "impressions", &DataType::UInt64)?;
        let reach = typed_column::<UInt64Array>(batch, "reach", &DataType::UInt64)?;
        let costs = typed_column::<Float64Array>(batch, "cost_per_result", &DataType::Float64)?;

        for i in 0..batch.num_rows() {
            let row = rows.len() + 1;
            rows.push(AdBreakdown {
                ad_account_id: ad_account_ids.value(i).to_string(),
                breakdown: breakdowns
                    .value(i)
                    .parse()
                    .map_err(|message| Error::MalformedRow { row, message })?,
                segment: segments.value(i).to_string(),
                spend: spend.value(i),
                clicks: clicks.value(i),
                impressions: impressions.value(i),
                reach: reach.value(i),
                cost_per_result: (!costs.is_null(i)).then(|| costs.value(i)),
            });
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ParquetExporter;
    use crate::export::tests::sample_metrics;
    use crate::export::Exporter;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_parquet_round_trip() -> Result<(), Error> {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_str().unwrap();
        let metrics = sample_metrics();

        ParquetExporter::new().export(&metrics, dir).await?;
        let loaded = ParquetMetricsLoader::new(dir)
            .load(&SessionContext::new())
            .await?;

        assert_eq!(loaded, metrics);
        assert_eq!(loaded.top_posts()[0].text, metrics.top_posts()[0].text);
        assert_eq!(loaded.demographics()[0].country.get("IE"), Some(&53));
        Ok(())
    }

    #[tokio::test]
    async fn test_round_trip_without_ads() -> Result<(), Error> {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_str().unwrap();
        let sample = sample_metrics();
        let metrics =
            ConsolidatedMetrics::new(*sample.date_range(), sample.accounts()[..1].to_vec(), None);

        ParquetExporter::new().export(&metrics, dir).await?;
        let loaded = ParquetMetricsLoader::new(dir)
            .load(&SessionContext::new())
            .await?;

        assert_eq!(loaded.ad_metrics(), None);
        assert_eq!(loaded.accounts(), metrics.accounts());
        assert!(loaded.top_posts().is_empty());
        assert!(loaded.demographics().is_empty());
        assert!(loaded.ad_breakdowns().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let loader = ParquetMetricsLoader::new(temp_dir.path());

        let result = loader.load(&SessionContext::new()).await;
        assert!(matches!(
            result.unwrap_err(),
            Error::ExportFileNotFound { path } if path.ends_with(MANIFEST_FILE)
        ));
    }

    #[tokio::test]
    async fn test_missing_account_file() -> Result<(), Error> {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_str().unwrap();
        ParquetExporter::new().export(&sample_metrics(), dir).await?;
        fs::remove_file(temp_dir.path().join("insights-17841.parquet"))?;

        let result = ParquetMetricsLoader::new(dir)
            .load(&SessionContext::new())
            .await;
        assert!(matches!(
            result.unwrap_err(),
            Error::ExportFileNotFound { path } if path.ends_with("insights-17841.parquet")
        ));
        Ok(())
    }
}
