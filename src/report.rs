//! Report assembly: the classification run, its statistics, and the rendered
//! outputs (per-category CSV sections plus a summary).
//!
//! Output is written atomically: everything lands in a staging directory that
//! is renamed over the target only after the full fold has completed, so an
//! interrupted run leaves no partial report behind.

use crate::binance::{PriceResolver, PriceSource};
use crate::classify::{classify, Category, ClassifiedRecord, Valuation};
use crate::config::Config;
use crate::ledger::{LedgerRow, ReadStats};
use crate::nbp::{RateResolver, RateSource};
use crate::tax::{summarize, TaxSummary};
use anyhow::Context;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Run statistics reported in the summary section.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    /// Rows that entered classification.
    pub processed: usize,
    pub revenue_rows: usize,
    pub cost_rows: usize,
    pub income_rows: usize,
    pub ignored_rows: usize,
    pub warning_rows: usize,
    /// Rows demoted to warnings by a resolver failure.
    pub valuation_errors: usize,
    pub malformed_dropped: usize,
    pub non_spot_skipped: usize,
    pub outside_year_skipped: usize,
    pub nbp_requests: u64,
    pub binance_requests: u64,
}

/// The complete outcome of one run.
pub struct Report {
    pub year: i32,
    pub records: Vec<ClassifiedRecord>,
    pub summary: TaxSummary,
    pub stats: RunStats,
}

impl Report {
    /// Classify every row in chronological order and fold the results.
    pub fn build<R: RateSource, P: PriceSource>(
        year: i32,
        rows: Vec<LedgerRow>,
        read_stats: &ReadStats,
        config: &Config,
        rates: &mut RateResolver<R>,
        prices: &mut PriceResolver<P>,
    ) -> Report {
        let total = rows.len();
        log::info!("classifying {total} transactions for tax year {year}");

        let mut records = Vec::with_capacity(total);
        for (idx, row) in rows.into_iter().enumerate() {
            records.push(classify(row, &config.rules, rates, prices));
            let done = idx + 1;
            if done % 50 == 0 || done == total {
                log::info!("{done}/{total} transactions classified");
            }
        }

        let summary = summarize(&records, config.carried_costs, config.tax_rate);

        let count = |category: Category| {
            records
                .iter()
                .filter(|r| r.category == category)
                .count()
        };
        let stats = RunStats {
            processed: total,
            revenue_rows: count(Category::Revenue),
            cost_rows: count(Category::Cost),
            income_rows: count(Category::Income),
            ignored_rows: count(Category::Ignored),
            warning_rows: count(Category::Warning),
            valuation_errors: records.iter().filter(|r| r.error.is_some()).count(),
            malformed_dropped: read_stats.malformed_dropped,
            non_spot_skipped: read_stats.non_spot_skipped,
            outside_year_skipped: read_stats.outside_year_skipped,
            nbp_requests: rates.request_count(),
            binance_requests: prices.request_count(),
        };

        Report {
            year,
            records,
            summary,
            stats,
        }
    }

    pub fn section(&self, category: Category) -> impl Iterator<Item = &ClassifiedRecord> {
        self.records.iter().filter(move |r| r.category == category)
    }

    /// Write the report as one CSV per non-empty category section plus a
    /// summary CSV, atomically (staging directory renamed over the target).
    pub fn write_csv_dir(&self, dir: &Path) -> anyhow::Result<()> {
        let staging = dir.with_extension("tmp");
        if staging.exists() {
            fs::remove_dir_all(&staging)
                .with_context(|| format!("removing stale {}", staging.display()))?;
        }
        fs::create_dir_all(&staging)
            .with_context(|| format!("creating {}", staging.display()))?;

        for (category, name) in [
            (Category::Revenue, "revenue.csv"),
            (Category::Cost, "costs.csv"),
            (Category::Income, "income.csv"),
            (Category::Warning, "warnings.csv"),
            (Category::Ignored, "ignored.csv"),
        ] {
            let records: Vec<&ClassifiedRecord> = self.section(category).collect();
            if records.is_empty() {
                continue;
            }
            let path = staging.join(name);
            let mut writer = csv::Writer::from_path(&path)
                .with_context(|| format!("creating {}", path.display()))?;
            for record in records {
                writer.serialize(RecordCsv::from(record))?;
            }
            writer.flush()?;
        }

        let path = staging.join("summary.csv");
        let mut writer =
            csv::Writer::from_path(&path).with_context(|| format!("creating {}", path.display()))?;
        for row in self.summary_rows() {
            writer.serialize(row)?;
        }
        writer.flush()?;

        if dir.exists() {
            fs::remove_dir_all(dir).with_context(|| format!("removing old {}", dir.display()))?;
        }
        fs::rename(&staging, dir)
            .with_context(|| format!("renaming report into {}", dir.display()))?;
        Ok(())
    }

    fn summary_rows(&self) -> Vec<SummaryRow> {
        let s = &self.summary;
        let t = &self.stats;
        let money = |v: Decimal| format!("{:.2}", v.round_dp(2));
        let whole = |v: Decimal| format!("{v:.0}");
        let count = |v: usize| v.to_string();
        vec![
            SummaryRow::new(
                "Field 34 - revenues from crypto disposals",
                money(s.revenue_from_disposals),
            ),
            SummaryRow::new(
                "Field 34 - income from earn/staking/airdrops",
                money(s.income_from_rewards),
            ),
            SummaryRow::new("Field 34 - total receipts", money(s.total_receipts)),
            SummaryRow::new(
                format!("Field 35 - costs incurred in {}", self.year),
                money(s.costs_current_year),
            ),
            SummaryRow::new(
                "Field 35 - cost excess carried from prior years",
                money(s.carried_costs),
            ),
            SummaryRow::new("Field 35 - total costs", money(s.total_costs)),
            SummaryRow::new("Taxable income (34 − 35)", money(s.taxable_income)),
            SummaryRow::new("Taxable base [whole PLN]", whole(s.taxable_base)),
            SummaryRow::new("Tax due 19% [whole PLN]", whole(s.tax_due)),
            SummaryRow::new(
                "Cost excess to carry into next year",
                money(s.carry_forward),
            ),
            SummaryRow::new("Transactions processed", count(t.processed)),
            SummaryRow::new("Revenue rows", count(t.revenue_rows)),
            SummaryRow::new("Cost rows", count(t.cost_rows)),
            SummaryRow::new("Income rows", count(t.income_rows)),
            SummaryRow::new("Warnings for manual review", count(t.warning_rows)),
            SummaryRow::new("Ignored (tax-neutral) rows", count(t.ignored_rows)),
            SummaryRow::new("Valuation errors", count(t.valuation_errors)),
            SummaryRow::new("Malformed rows dropped", count(t.malformed_dropped)),
            SummaryRow::new("Non-Spot rows skipped", count(t.non_spot_skipped)),
            SummaryRow::new("NBP API requests", t.nbp_requests.to_string()),
            SummaryRow::new("Binance API requests", t.binance_requests.to_string()),
        ]
    }

    /// Render the summary section as a terminal table.
    pub fn print_summary(&self) {
        let table = Table::new(self.summary_rows())
            .with(Style::rounded())
            .with(Modify::new(Rows::new(1..)).with(Alignment::right()))
            .to_string();
        println!("{table}");

        if self.stats.warning_rows > 0 {
            println!(
                "{} transactions need manual review - see the warnings section.",
                self.stats.warning_rows
            );
        }
        if self.summary.carry_forward > Decimal::ZERO {
            println!(
                "Cost excess of {:.2} PLN carries forward: pass it as the carried \
                 costs of the {} return (art. 22 ust. 16 updof).",
                self.summary.carry_forward.round_dp(2),
                self.year + 1
            );
        }
    }
}

/// Summary line: a label and a value.
#[derive(Debug, Clone, Tabled, Serialize)]
struct SummaryRow {
    #[tabled(rename = "Item")]
    item: String,
    #[tabled(rename = "Value")]
    value: String,
}

impl SummaryRow {
    fn new(item: impl Into<String>, value: impl Into<String>) -> Self {
        SummaryRow {
            item: item.into(),
            value: value.into(),
        }
    }
}

/// CSV projection of one classified record.
#[derive(Debug, Serialize)]
struct RecordCsv {
    date: String,
    operation: String,
    asset: String,
    change: String,
    account: String,
    value_pln: String,
    valuation: String,
    basis: String,
    note: String,
}

impl From<&ClassifiedRecord> for RecordCsv {
    fn from(record: &ClassifiedRecord) -> Self {
        let valuation = match &record.valuation {
            Valuation::FiatRate { rate, rate_date } => {
                format!("NBP {rate} ({rate_date})")
            }
            Valuation::UsdChain {
                usd_price,
                usd_rate,
                rate_date,
            } => format!("{usd_price} USD × NBP {usd_rate} ({rate_date})"),
            Valuation::Unvalued => String::new(),
        };
        RecordCsv {
            date: record.row.datetime.format("%Y-%m-%d %H:%M:%S").to_string(),
            operation: record.row.operation.clone(),
            asset: record.row.asset.clone(),
            change: record.row.change.to_string(),
            account: record.row.account.clone(),
            value_pln: record
                .value_pln
                .map(|v| v.to_string())
                .unwrap_or_default(),
            valuation,
            basis: record.basis.map(|b| b.citation().to_string()).unwrap_or_default(),
            note: record.note.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::testing::FakePriceSource;
    use crate::ledger::read_ledger;
    use crate::nbp::testing::FakeRateSource;
    use chrono::{NaiveDate, NaiveDateTime};
    use rust_decimal_macros::dec;
    use std::time::Duration as StdDuration;

    fn hour(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn build_fixture_report() -> Report {
        let input = "\
UTC_Time,Account,Operation,Coin,Change,Remark
2025-06-10 09:00:00,Spot,Transaction Spend,PLN,-4000,
2025-06-10 09:00:00,Spot,Transaction Related,BTC,0.001,
2025-06-11 12:30:00,Spot,Staking Rewards,DOT,10,
2025-06-12 15:00:00,Spot,Transaction Fee,OBSCURE,-5,
2025-06-12 16:00:00,Spot,Savings purchase,BTC,-0.001,
2025-06-13 10:00:00,Spot,Mystery Operation,BTC,1,
2025-06-13 11:00:00,Futures,Buy,BTC,1,
bad-date,Spot,Buy,BTC,1,
";
        let (rows, read_stats) = read_ledger(input, b',', 2025).unwrap();

        let rates = FakeRateSource::new().with_rate("USD", NaiveDate::from_ymd_opt(2025, 6, 10).unwrap(), dec!(4.0));
        let mut rates = RateResolver::with_backoff(rates, StdDuration::ZERO, StdDuration::ZERO);
        let config = Config::default();
        let prices = FakePriceSource::new().with_close("DOTUSDT", hour(11, 12), dec!(2.5));
        let mut prices = PriceResolver::new(prices, &config.rules);

        Report::build(2025, rows, &read_stats, &config, &mut rates, &mut prices)
    }

    #[test]
    fn sections_and_stats_reflect_the_classification() {
        let report = build_fixture_report();
        assert_eq!(report.stats.processed, 6);
        assert_eq!(report.stats.cost_rows, 1);
        assert_eq!(report.stats.income_rows, 1);
        // unpriceable fee + unknown operation
        assert_eq!(report.stats.warning_rows, 2);
        // crypto leg of the trade + technical op
        assert_eq!(report.stats.ignored_rows, 2);
        assert_eq!(report.stats.malformed_dropped, 1);
        assert_eq!(report.stats.non_spot_skipped, 1);
        assert_eq!(report.section(Category::Cost).count(), 1);
        assert_eq!(report.section(Category::Warning).count(), 2);
    }

    #[test]
    fn summary_figures_follow_the_fold() {
        let report = build_fixture_report();
        // cost 4000 PLN; income 10 × 2.5 USD × 4.0 = 100 PLN
        assert_eq!(report.summary.costs_current_year, dec!(4000));
        assert_eq!(report.summary.income_from_rewards, dec!(100));
        assert_eq!(report.summary.taxable_base, dec!(0));
        assert_eq!(report.summary.carry_forward, dec!(3900));
    }

    #[test]
    fn csv_dir_is_written_atomically() {
        let report = build_fixture_report();
        let dir = std::env::temp_dir().join(format!("pit38-report-test-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);

        report.write_csv_dir(&dir).unwrap();
        assert!(dir.join("summary.csv").exists());
        assert!(dir.join("costs.csv").exists());
        assert!(dir.join("warnings.csv").exists());
        // no revenue rows in the fixture, so no revenue section file
        assert!(!dir.join("revenue.csv").exists());
        // staging directory is gone after the rename
        assert!(!dir.with_extension("tmp").exists());

        let summary = fs::read_to_string(dir.join("summary.csv")).unwrap();
        assert!(summary.contains("Field 34"));
        assert!(summary.contains("Tax due"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn rewriting_replaces_the_previous_report() {
        let report = build_fixture_report();
        let dir = std::env::temp_dir().join(format!("pit38-rewrite-test-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        report.write_csv_dir(&dir).unwrap();
        report.write_csv_dir(&dir).unwrap();
        assert!(dir.join("summary.csv").exists());
        fs::remove_dir_all(&dir).unwrap();
    }
}
