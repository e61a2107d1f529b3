//! Report command - the full pipeline: read, classify, aggregate, write.

use crate::binance::{BinanceApi, PriceResolver};
use crate::cmd::{load_config, read_input};
use crate::ledger::read_ledger;
use crate::nbp::{NbpApi, RateResolver};
use crate::report::Report;
use clap::Args;
use rust_decimal::Decimal;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct ReportCommand {
    /// Ledger CSV exported from the exchange
    #[arg(short, long)]
    file: PathBuf,

    /// Tax year to settle
    #[arg(short, long)]
    year: i32,

    /// JSON config overriding the default rule tables
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cost excess carried from the previous year (overrides the config value)
    #[arg(long)]
    carried_costs: Option<Decimal>,

    /// Directory the report sections are written to
    #[arg(short, long, default_value = "pit38-report")]
    output: PathBuf,

    /// Preferred CSV delimiter; detection falls back to the common ones
    #[arg(long, default_value = ";")]
    delimiter: char,
}

impl ReportCommand {
    pub fn exec(&self) -> anyhow::Result<()> {
        let mut config = load_config(self.config.as_deref())?;
        if let Some(carried) = self.carried_costs {
            config.carried_costs = carried;
        }

        let input = read_input(&self.file)?;
        let (rows, read_stats) = read_ledger(&input, self.delimiter as u8, self.year)?;

        let mut rates = RateResolver::new(NbpApi::new());
        let mut prices = PriceResolver::new(BinanceApi::new(), &config.rules);
        let report = Report::build(
            self.year,
            rows,
            &read_stats,
            &config,
            &mut rates,
            &mut prices,
        );

        report.write_csv_dir(&self.output)?;
        report.print_summary();
        println!("Report written to {}", self.output.display());
        Ok(())
    }
}
