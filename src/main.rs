use clap::{Parser, Subcommand};

mod binance;
mod classify;
mod cmd;
mod config;
mod ledger;
mod nbp;
mod report;
mod tax;

use cmd::price::PriceCommand;
use cmd::rate::RateCommand;
use cmd::report::ReportCommand;
use cmd::summary::SummaryCommand;

/// Polish PIT-38 tax calculator for crypto capital gains.
///
/// Classifies an exchange ledger export into tax categories, values every
/// relevant row in PLN through NBP daily rates and Binance hourly prices, and
/// aggregates the PIT-38 figures. A helper tool - always verify the result
/// with a tax advisor before filing.
#[derive(Parser, Debug)]
#[command(name = "pit38", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify a ledger export and write the full tax report
    Report(ReportCommand),
    /// Print only the aggregate PIT-38 figures
    Summary(SummaryCommand),
    /// Look up a single NBP daily rate
    Rate(RateCommand),
    /// Look up a single Binance hourly price
    Price(PriceCommand),
}

fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Report(cmd) => cmd.exec(),
        Command::Summary(cmd) => cmd.exec(),
        Command::Rate(cmd) => cmd.exec(),
        Command::Price(cmd) => cmd.exec(),
    }
}
