use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Dumps the catalog service content into per-task xml/json files", long_about = None)]
pub struct Cli {
    /// Host (or full root URL) of the catalog service
    #[arg(long)]
    pub server: String,

    /// API version path segment
    #[arg(long, default_value = "v1")]
    pub api_version: String,

    /// OAuth2 client id, requires a matching secret
    #[arg(short = 'i', long, default_value = "anonymous")]
    pub clientid: String,

    /// OAuth2 client secret
    #[arg(short, long)]
    pub secret: String,

    /// Existing directory where the dump is placed
    #[arg(short, long)]
    pub output: PathBuf,

    /// Connection budget; the effective ceiling is one below this
    #[arg(long, default_value = "10")]
    pub max_open: usize,

    /// Minimum milliseconds between two dispatches
    #[arg(long, default_value = "100")]
    pub time_between: u64,

    /// Split each JSON dump into paginated part files of this many entries
    #[arg(long)]
    pub json_pages: Option<usize>,

    /// Base name of the run report CSV
    #[arg(long, default_value = "dumpreport")]
    pub report_name: String,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}
