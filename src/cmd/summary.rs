//! Summary command - aggregate figures only, no report files.

use crate::binance::{BinanceApi, PriceResolver};
use crate::cmd::{load_config, read_input};
use crate::ledger::read_ledger;
use crate::nbp::{NbpApi, RateResolver};
use crate::report::{Report, RunStats};
use crate::tax::TaxSummary;
use clap::Args;
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct SummaryCommand {
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

    /// Preferred CSV delimiter; detection falls back to the common ones
    #[arg(long, default_value = ";")]
    delimiter: char,

    /// Output as JSON instead of a formatted table
    #[arg(long)]
    json: bool,
}

/// Summary data for JSON output.
#[derive(Debug, Serialize)]
struct SummaryOutput<'a> {
    tax_year: i32,
    summary: &'a TaxSummary,
    stats: &'a RunStats,
}

impl SummaryCommand {
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

        if self.json {
            let output = SummaryOutput {
                tax_year: self.year,
                summary: &report.summary,
                stats: &report.stats,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            report.print_summary();
        }
        Ok(())
    }
}
