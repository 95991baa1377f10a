use crate::error::Error;
use crate::models::{Breakdown, ConsolidatedMetrics, Platform};
use chrono::Duration;
use log::info;
use plotters::prelude::*;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
const LABEL_CHARS: usize = 18;
const TOP_COUNTRIES: usize = 10;

const PALETTE: [RGBColor; 6] = [
    RGBColor(66, 103, 178),
    RGBColor(225, 48, 108),
    RGBColor(44, 160, 44),
    RGBColor(255, 127, 14),
    RGBColor(148, 103, 189),
    RGBColor(127, 127, 127),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChartKind {
    /// Facebook vs Instagram totals side by side.
    PlatformComparison,
    /// Daily views, one line per account.
    DailyTrend,
    /// Total spend per campaign.
    AdSpend,
    /// Audience per age bracket, one bar per gender.
    Demographics,
    /// Audience of the largest countries.
    TopCountries,
    /// Total spend per segment of a breakdown.
    AdSpendBy(Breakdown),
}

impl ChartKind {
    pub const ALL: [ChartKind; 8] = [
        ChartKind::PlatformComparison,
        ChartKind::DailyTrend,
        ChartKind::AdSpend,
        ChartKind::Demographics,
        ChartKind::TopCountries,
        ChartKind::AdSpendBy(Breakdown::Age),
        ChartKind::AdSpendBy(Breakdown::Gender),
        ChartKind::AdSpendBy(Breakdown::DevicePlatform),
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            ChartKind::PlatformComparison => "platform_comparison.svg",
            ChartKind::DailyTrend => "daily_trend.svg",
            ChartKind::AdSpend => "ad_spend.svg",
            ChartKind::Demographics => "demographics.svg",
            ChartKind::TopCountries => "top_countries.svg",
            ChartKind::AdSpendBy(Breakdown::Age) => "ad_spend_by_age.svg",
            ChartKind::AdSpendBy(Breakdown::Gender) => "ad_spend_by_gender.svg",
            ChartKind::AdSpendBy(Breakdown::DevicePlatform) => "ad_spend_by_device.svg",
            ChartKind::AdSpendBy(Breakdown::Region) => "ad_spend_by_region.svg",
        }
    }
}

/// Renders charts of a finished [`ConsolidatedMetrics`] into a directory.
pub struct VisualizationService {
    output_dir: PathBuf,
}

impl VisualizationService {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let output_dir = output_dir.into();
        if !output_dir.exists() {
            fs::create_dir_all(&output_dir)?;
            info!("Created output directory: {}", output_dir.display());
        }
        Ok(VisualizationService { output_dir })
    }

    /// Renders every chart the data supports. Charts without data are
    /// skipped rather than failing the batch.
    pub fn render_all(&self, metrics: &ConsolidatedMetrics) -> Result<Vec<PathBuf>, Error> {
        let mut paths = vec![];
        for kind in ChartKind::ALL {
            let path = self.output_dir.join(kind.file_name());
            match render(metrics, kind, &path) {
                Ok(path) => paths.push(path),
                Err(Error::NoData { message }) => info!("Skipping {:?} chart: {}", kind, message),
                Err(err) => return Err(err),
            }
        }
        Ok(paths)
    }
}

/// Renders one chart as SVG to `output_path` and returns the path written.
pub fn render(
    metrics: &ConsolidatedMetrics,
    kind: ChartKind,
    output_path: &Path,
) -> Result<PathBuf, Error> {
    match kind {
        ChartKind::PlatformComparison => render_platform_comparison(metrics, output_path)?,
        ChartKind::DailyTrend => render_daily_trend(metrics, output_path)?,
        ChartKind::AdSpend => render_ad_spend(metrics, output_path)?,
        ChartKind::Demographics => render_demographics(metrics, output_path)?,
        ChartKind::TopCountries => render_top_countries(metrics, output_path)?,
        ChartKind::AdSpendBy(breakdown) => render_spend_by(metrics, breakdown, output_path)?,
    }

    info!("Saved {:?} chart to {}", kind, output_path.display());
    Ok(output_path.to_path_buf())
}

fn render_platform_comparison(metrics: &ConsolidatedMetrics, path: &Path) -> Result<(), Error> {
    if metrics.accounts().is_empty() {
        return Err(Error::NoData {
            message: "no account metrics to compare".to_string(),
        });
    }

    let categories = ["Views", "Reach", "Engagement", "Follows"].map(String::from);
    let series: Vec<(String, Vec<f64>)> = Platform::ALL
        .iter()
        .map(|platform| {
            let s = metrics.platform_summary(*platform);
            (platform.to_string(), vec![s.views, s.reach, s.engagement, s.follows])
        })
        .collect();

    grouped_bars(
        path,
        &format!("Facebook vs Instagram ({})", metrics.date_range()),
        &categories,
        &series,
        "Total over period",
    )
}

fn render_daily_trend(metrics: &ConsolidatedMetrics, path: &Path) -> Result<(), Error> {
    let range = metrics.date_range();
    let start = range.start();

    let lines: Vec<(String, Vec<(f64, f64)>)> = metrics
        .accounts()
        .iter()
        .filter_map(|account| {
            let metric = account.metric(account.account.platform.views_metric())?;
            let points: Vec<(f64, f64)> = metric
                .values
                .iter()
                .map(|p| ((p.date - start).num_days() as f64, p.value))
                .collect();
            (!points.is_empty()).then(|| (account.account.name.clone(), points))
        })
        .collect();

    if lines.is_empty() {
        return Err(Error::NoData {
            message: "no daily views to plot".to_string(),
        });
    }

    let y_max = lines
        .iter()
        .flat_map(|(_, points)| points.iter().map(|(_, y)| *y))
        .fold(1.0_f64, f64::max)
        * 1.1;
    let x_max = (range.num_days() - 1).max(1) as f64;

    let root = SVGBackend::new(path, (WIDTH, HEIGHT)).into_drawing_area();
    root.fill(&WHITE).map_err(chart_err)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(format!("Daily views ({})", range), ("sans-serif", 28))
        .margin(20)
        .x_label_area_size(40)
        .y_label_area_size(80)
        .build_cartesian_2d(0f64..x_max, 0f64..y_max)
        .map_err(chart_err)?;

    let date_label = |x: &f64| {
        (start + Duration::days(x.round() as i64))
            .format("%Y-%m-%d")
            .to_string()
    };
    chart
        .configure_mesh()
        .x_labels(8)
        .x_label_formatter(&date_label)
        .y_desc("Views")
        .draw()
        .map_err(chart_err)?;

    for (index, (name, points)) in lines.into_iter().enumerate() {
        let color = PALETTE[index % PALETTE.len()];
        chart
            .draw_series(LineSeries::new(points, color.stroke_width(2)))
            .map_err(chart_err)?
            .label(name)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
    }

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()
        .map_err(chart_err)?;

    root.present().map_err(chart_err)?;
    Ok(())
}

fn render_ad_spend(metrics: &ConsolidatedMetrics, path: &Path) -> Result<(), Error> {
    let mut campaigns: Vec<(String, f64)> = vec![];
    for ad in metrics.ad_metrics().unwrap_or_default() {
        match campaigns.iter_mut().find(|(name, _)| *name == ad.campaign_name) {
            Some((_, spend)) => *spend += ad.spend,
            None => campaigns.push((ad.campaign_name.clone(), ad.spend)),
        }
    }

    if campaigns.is_empty() {
        return Err(Error::NoData {
            message: "no ad campaigns to plot".to_string(),
        });
    }

    bars(
        path,
        &format!("Ad spend by campaign ({})", metrics.date_range()),
        &campaigns,
        "Amount spent",
    )
}

fn render_spend_by(
    metrics: &ConsolidatedMetrics,
    breakdown: Breakdown,
    path: &Path,
) -> Result<(), Error> {
    let segments = metrics.spend_by(breakdown);
    if segments.is_empty() {
        return Err(Error::NoData {
            message: format!("no ad spend by {}", breakdown),
        });
    }

    bars(
        path,
        &format!("Ad spend by {} ({})", breakdown, metrics.date_range()),
        &segments,
        "Amount spent",
    )
}

fn gender_label(code: &str) -> &str {
    match code {
        "F" => "Female",
        "M" => "Male",
        "U" => "Unknown",
        other => other,
    }
}

/// Age brackets on the x axis, one series per gender, summed over accounts.
fn render_demographics(metrics: &ConsolidatedMetrics, path: &Path) -> Result<(), Error> {
    let mut by_gender: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
    for audience in metrics.demographics() {
        for (segment, count) in &audience.age_gender {
            let (gender, age) = segment.split_once('.').unwrap_or(("U", segment.as_str()));
            *by_gender
                .entry(gender_label(gender).to_string())
                .or_default()
                .entry(age.to_string())
                .or_insert(0) += count;
        }
    }

    if by_gender.is_empty() {
        return Err(Error::NoData {
            message: "no age and gender data to plot".to_string(),
        });
    }

    let mut ages: Vec<String> = by_gender.values().flat_map(|ages| ages.keys().cloned()).collect();
    ages.sort();
    ages.dedup();

    let series: Vec<(String, Vec<f64>)> = by_gender
        .into_iter()
        .map(|(gender, counts)| {
            let values = ages
                .iter()
                .map(|age| counts.get(age).copied().unwrap_or(0) as f64)
                .collect();
            (gender, values)
        })
        .collect();

    grouped_bars(path, "Age and gender distribution", &ages, &series, "Audience")
}

fn render_top_countries(metrics: &ConsolidatedMetrics, path: &Path) -> Result<(), Error> {
    let mut totals: BTreeMap<&str, u64> = BTreeMap::new();
    for audience in metrics.demographics() {
        for (country, count) in &audience.country {
            *totals.entry(country.as_str()).or_insert(0) += count;
        }
    }

    if totals.is_empty() {
        return Err(Error::NoData {
            message: "no country data to plot".to_string(),
        });
    }

    let mut countries: Vec<(String, f64)> = totals
        .into_iter()
        .map(|(country, count)| (country.to_string(), count as f64))
        .collect();
    countries.sort_by(|a, b| b.1.total_cmp(&a.1));
    countries.truncate(TOP_COUNTRIES);

    bars(path, "Top countries", &countries, "Audience")
}

/// One bar per category, in the given order.
fn bars(path: &Path, title: &str, values: &[(String, f64)], y_desc: &str) -> Result<(), Error> {
    let labels: Vec<String> = values.iter().map(|(name, _)| shorten(name)).collect();
    let y_max = values.iter().map(|(_, v)| *v).fold(1.0_f64, f64::max) * 1.1;

    let root = SVGBackend::new(path, (WIDTH, HEIGHT)).into_drawing_area();
    root.fill(&WHITE).map_err(chart_err)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 28))
        .margin(20)
        .x_label_area_size(40)
        .y_label_area_size(80)
        .build_cartesian_2d(-0.5f64..(values.len() as f64 - 0.5), 0f64..y_max)
        .map_err(chart_err)?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(values.len())
        .x_label_formatter(&|x| category_label(&labels[..], *x))
        .y_desc(y_desc)
        .draw()
        .map_err(chart_err)?;

    let color = PALETTE[0];
    chart
        .draw_series(values.iter().enumerate().map(|(index, (_, value))| {
            let center = index as f64;
            Rectangle::new([(center - 0.35, 0.0), (center + 0.35, *value)], color.filled())
        }))
        .map_err(chart_err)?;

    root.present().map_err(chart_err)?;
    Ok(())
}

/// Categories on the x axis with one bar per series in each, plus a legend.
fn grouped_bars(
    path: &Path,
    title: &str,
    categories: &[String],
    series: &[(String, Vec<f64>)],
    y_desc: &str,
) -> Result<(), Error> {
    let labels: Vec<String> = categories.iter().map(|name| shorten(name)).collect();
    let y_max = series
        .iter()
        .flat_map(|(_, values)| values.iter().copied())
        .fold(1.0_f64, f64::max)
        * 1.1;

    let root = SVGBackend::new(path, (WIDTH, HEIGHT)).into_drawing_area();
    root.fill(&WHITE).map_err(chart_err)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 28))
        .margin(20)
        .x_label_area_size(40)
        .y_label_area_size(80)
        .build_cartesian_2d(-0.5f64..(categories.len() as f64 - 0.5), 0f64..y_max)
        .map_err(chart_err)?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(categories.len())
        .x_label_formatter(&|x| category_label(&labels[..], *x))
        .y_desc(y_desc)
        .draw()
        .map_err(chart_err)?;

    let bar_width = 0.8 / series.len().max(1) as f64;
    for (index, (name, values)) in series.iter().enumerate() {
        let color = PALETTE[index % PALETTE.len()];
        let offset = -0.4 + index as f64 * bar_width;

        chart
            .draw_series(values.iter().enumerate().map(|(category, value)| {
                let left = category as f64 + offset;
                Rectangle::new([(left, 0.0), (left + bar_width, *value)], color.filled())
            }))
            .map_err(chart_err)?
            .label(name.as_str())
            .legend(move |(x, y)| Rectangle::new([(x, y - 5), (x + 15, y + 5)], color.filled()));
    }

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()
        .map_err(chart_err)?;

    root.present().map_err(chart_err)?;
    Ok(())
}

/// Label for bars centred on whole numbers; other tick positions stay blank.
fn category_label<S: AsRef<str>>(labels: &[S], x: f64) -> String {
    let index = x.round();
    if (x - index).abs() > 1e-6 || index < 0.0 {
        return String::new();
    }
    labels
        .get(index as usize)
        .map(|label| label.as_ref().to_string())
        .unwrap_or_default()
}

fn shorten(name: &str) -> String {
    if name.chars().count() <= LABEL_CHARS {
        return name.to_string();
    }
    let mut short: String = name.chars().take(LABEL_CHARS - 1).collect();
    short.push('…');
    short
}

fn chart_err<E: Display>(err: E) -> Error {
    Error::Chart {
        message: err.to_string(),
    }
}
