use crate::analytics::{AnalyticsService, LogObserver, DEFAULT_TOP_POSTS};
use crate::api_client::GraphClient;
use crate::charts::VisualizationService;
use crate::config::Config;
use crate::data::ParquetExporter;
use crate::date_range::{resolve_today, DateRange};
use crate::error::Error;
use crate::export::{Exporter, SheetsExporter};
use crate::metrics_loader::{MetricsLoader, ParquetMetricsLoader};
use crate::models::{Account, AdAccount, ConsolidatedMetrics, Platform};
use datafusion::prelude::SessionContext;
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CHARTS_DIR: &str = "charts";

/// Options of a `fetch` run.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub account: Option<String>,
    pub ad_account: Option<String>,
    pub output_dir: String,
    pub spreadsheet_id: Option<String>,
    pub charts: bool,
    /// Also fetch top posts, demographics and ad breakdowns.
    pub details: bool,
    pub top_posts: usize,
}

impl Default for FetchRequest {
    fn default() -> Self {
        FetchRequest {
            start_date: None,
            end_date: None,
            account: None,
            ad_account: None,
            output_dir: "output".to_string(),
            spreadsheet_id: None,
            charts: true,
            details: true,
            top_posts: DEFAULT_TOP_POSTS,
        }
    }
}

/// What the token can see, and where the list was exported.
#[derive(Debug)]
pub struct AccountListing {
    pub accounts: Vec<Account>,
    pub ad_accounts: Vec<AdAccount>,
    pub sheet_url: Option<String>,
}

/// Where a run's results were written.
#[derive(Debug, PartialEq)]
pub struct RunSummary {
    pub export_dir: String,
    pub sheet_url: Option<String>,
    pub charts: Vec<PathBuf>,
}

/// Resolves the window, fetches everything and writes every sink.
/// The date range is validated before any request is sent.
pub async fn run_fetch(config: &Config, request: &FetchRequest) -> Result<RunSummary, Error> {
    let date_range = resolve_today(
        request.start_date.as_deref(),
        request.end_date.as_deref(),
        config.lookback_years,
        config.lookback_months,
    )?;

    let sheets = match request.spreadsheet_id {
        Some(_) => Some(SheetsExporter::new(config)?),
        None => None,
    };

    let service = AnalyticsService::new(Arc::new(GraphClient::new(config)?), Arc::new(LogObserver));
    let sheets = sheets.as_ref().map(|sheets| sheets as &dyn Exporter);

    fetch_and_export(&service, &date_range, request, sheets).await
}

pub async fn fetch_and_export(
    service: &AnalyticsService,
    date_range: &DateRange,
    request: &FetchRequest,
    sheets: Option<&dyn Exporter>,
) -> Result<RunSummary, Error> {
    let metrics = service
        .get_consolidated_metrics(
            date_range,
            request.account.as_deref(),
            request.ad_account.as_deref(),
        )
        .await?;
    let metrics = if request.details {
        service
            .with_audience_details(metrics, request.top_posts)
            .await
    } else {
        metrics
    };
    log_summary(&metrics);

    let export_dir = ParquetExporter::new()
        .export(&metrics, &request.output_dir)
        .await?;

    let sheet_url = match (sheets, request.spreadsheet_id.as_deref()) {
        (Some(exporter), Some(spreadsheet_id)) => {
            Some(exporter.export(&metrics, spreadsheet_id).await?)
        }
        _ => None,
    };

    let charts = if request.charts {
        render_charts(&metrics, &Path::new(&request.output_dir).join(CHARTS_DIR))?
    } else {
        vec![]
    };

    Ok(RunSummary {
        export_dir,
        sheet_url,
        charts,
    })
}

/// Lists everything the token can see, without fetching insights, and
/// optionally writes the Page and Instagram accounts to a worksheet.
pub async fn list_accounts(
    config: &Config,
    spreadsheet_id: Option<&str>,
) -> Result<AccountListing, Error> {
    let sheets = match spreadsheet_id {
        Some(_) => Some(SheetsExporter::new(config)?),
        None => None,
    };

    let service = AnalyticsService::new(Arc::new(GraphClient::new(config)?), Arc::new(LogObserver));
    let accounts = service.get_connected_accounts().await?;
    let ad_accounts = service.get_ad_accounts().await?;

    let sheet_url = match (sheets, spreadsheet_id) {
        (Some(sheets), Some(spreadsheet_id)) => {
            Some(sheets.export_accounts(&accounts, spreadsheet_id).await?)
        }
        _ => None,
    };

    Ok(AccountListing {
        accounts,
        ad_accounts,
        sheet_url,
    })
}

/// Re-renders the charts of an earlier Parquet export.
pub async fn render_from_export(input_dir: &str, output_dir: Option<&str>) -> Result<Vec<PathBuf>, Error> {
    let ctx = SessionContext::new();
    let metrics = ParquetMetricsLoader::new(input_dir).load(&ctx).await?;

    let output_dir = match output_dir {
        Some(dir) => PathBuf::from(dir),
        None => Path::new(input_dir).join(CHARTS_DIR),
    };
    render_charts(&metrics, &output_dir)
}

fn render_charts(metrics: &ConsolidatedMetrics, output_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let paths = VisualizationService::new(output_dir)?.render_all(metrics)?;
    info!("Rendered {} charts to {}", paths.len(), output_dir.display());
    Ok(paths)
}

fn log_summary(metrics: &ConsolidatedMetrics) {
    for platform in Platform::ALL {
        let summary = metrics.platform_summary(platform);
        info!(
            "{}: views {:.0}, reach {:.0}, engagement {:.0}, follows {:.0}",
            platform, summary.views, summary.reach, summary.engagement, summary.follows
        );
    }
    if let Some(ads) = metrics.ad_metrics() {
        let spend: f64 = ads.iter().map(|ad| ad.spend).sum();
        info!("Ads: {} rows, spend {:.2}", ads.len(), spend);
    }
    info!(
        "Details: {} top posts, {} audiences, {} ad breakdown rows",
        metrics.top_posts().len(),
        metrics.demographics().len(),
        metrics.ad_breakdowns().len()
    );
}
