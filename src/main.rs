mod analytics;
mod api_client;
mod charts;
mod config;
mod data;
mod date_range;
mod error;
mod export;
mod metrics_loader;
mod models;
mod runner;

use clap::{Parser, Subcommand};
use config::Config;
use error::Error;
use log::{error, info};
use runner::FetchRequest;
use std::fs::OpenOptions;

#[derive(Parser)]
#[command(about = "Facebook and Instagram metrics pipeline")]
struct Args {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch insights and ad performance, then export and chart them.
    Fetch {
        #[arg(long, help = "Date should be in the form YYYY-MM-DD")]
        start_date: Option<String>,

        #[arg(long, help = "Date should be in the form YYYY-MM-DD")]
        end_date: Option<String>,

        /// Only fetch this Page or Instagram account.
        #[arg(long)]
        account: Option<String>,

        /// Only fetch this ad account (e.g. act_123).
        #[arg(long)]
        ad_account: Option<String>,

        #[arg(long, default_value = "output")]
        output_dir: String,

        /// Also write the results to this Google spreadsheet.
        #[arg(long)]
        spreadsheet_id: Option<String>,

        #[arg(long)]
        no_charts: bool,

        /// Skip top posts, demographics and ad breakdowns.
        #[arg(long)]
        no_details: bool,

        /// How many top posts to keep per account.
        #[arg(long, default_value_t = analytics::DEFAULT_TOP_POSTS)]
        top_posts: usize,
    },

    /// List the Pages, Instagram accounts and ad accounts the token can see.
    Accounts {
        /// Also write the account list to this Google spreadsheet.
        #[arg(long)]
        spreadsheet_id: Option<String>,
    },

    /// Re-render charts from a previous export.
    Render {
        #[arg(long)]
        input_dir: String,

        #[arg(long)]
        output_dir: Option<String>,
    },
}

fn init_logging(config: &Config) -> Result<(), Error> {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(&config.log_level);

    if let Some(path) = &config.log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

async fn run(args: Args) -> Result<(), Error> {
    match args.command {
        Command::Fetch {
            start_date,
            end_date,
            account,
            ad_account,
            output_dir,
            spreadsheet_id,
            no_charts,
            no_details,
            top_posts,
        } => {
            let request = FetchRequest {
                start_date,
                end_date,
                account,
                ad_account,
                output_dir,
                spreadsheet_id,
                charts: !no_charts,
                details: !no_details,
                top_posts,
            };
            let summary = runner::run_fetch(&args.config, &request).await?;

            println!("Export written to {}", summary.export_dir);
            if let Some(url) = summary.sheet_url {
                println!("Spreadsheet: {}", url);
            }
            for chart in summary.charts {
                println!("Chart: {}", chart.display());
            }
        }
        Command::Accounts { spreadsheet_id } => {
            let listing = runner::list_accounts(&args.config, spreadsheet_id.as_deref()).await?;
            for account in listing.accounts {
                println!("{}\t{}\t{}", account.id, account.platform, account.name);
            }
            for ad_account in listing.ad_accounts {
                println!("{}\tAd Account\t{}", ad_account.id, ad_account.name);
            }
            if let Some(url) = listing.sheet_url {
                println!("Spreadsheet: {}", url);
            }
        }
        Command::Render {
            input_dir,
            output_dir,
        } => {
            let charts = runner::render_from_export(&input_dir, output_dir.as_deref()).await?;
            for chart in charts {
                println!("Chart: {}", chart.display());
            }
        }
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if let Err(err) = init_logging(&args.config) {
        eprintln!("failed to initialise logging: {}", err);
        std::process::exit(1);
    }
    info!("Starting {}", env!("CARGO_PKG_NAME"));

    if let Err(err) = run(args).await {
        error!("run failed: {}", err);
        eprintln!("error: {}", err);
        if err.is_invalid_range() {
            eprintln!("dates are given as YYYY-MM-DD and the start must not be after the end");
        }
        std::process::exit(1);
    }
}
