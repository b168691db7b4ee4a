use clap::Parser;

/// Sleep Exam Tracker CLI arguments
#[derive(Debug, Parser)]
#[command(
    name = "sleep-exam-tracker",
    version,
    about = "Syncs partner sleep exams, computes clinical metrics and raises alerts"
)]
pub struct Cli {
    /// Partner API base URL
    #[arg(long)]
    pub partner_url: Option<String>,

    /// Sync interval in seconds
    #[arg(long)]
    pub sync_interval: Option<u64>,

    /// HTTP port for the alert API
    #[arg(long)]
    pub port: Option<u16>,

    /// Schema level to migrate to (basic or extended)
    #[arg(long)]
    pub schema_level: Option<String>,

    /// Run one sync cycle and one retention sweep, print the reports and exit
    #[arg(long)]
    pub run_once: bool,
}
