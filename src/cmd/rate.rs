use crate::nbp::{NbpApi, RateResolver};
use chrono::NaiveDate;
use clap::Args;

#[derive(Args, Debug)]
pub struct RateCommand {
    /// Currency code, e.g. EUR
    currency: String,

    /// Transaction date (YYYY-MM-DD); the preceding published rate applies
    date: NaiveDate,
}

impl RateCommand {
    pub fn exec(&self) -> anyhow::Result<()> {
        let mut resolver = RateResolver::new(NbpApi::new());
        let quote = resolver.resolve(&self.currency, self.date)?;
        println!(
            "1 {} = {} PLN (NBP table A, published {})",
            self.currency.to_uppercase(),
            quote.rate,
            quote.date
        );
        Ok(())
    }
}
