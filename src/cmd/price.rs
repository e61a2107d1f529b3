use crate::binance::{floor_to_hour, BinanceApi, PriceResolver};
use crate::config::{Config, PIVOT_FIAT};
use crate::ledger::parse_datetime;
use crate::nbp::{NbpApi, RateResolver};
use chrono::NaiveDateTime;
use clap::Args;

#[derive(Args, Debug)]
pub struct PriceCommand {
    /// Asset symbol, e.g. BTC
    symbol: String,

    /// Valuation instant ("YYYY-MM-DD HH:MM:SS"), floored to its hour
    #[arg(value_parser = parse_instant)]
    at: NaiveDateTime,

    /// Also convert to PLN using the NBP USD rate
    #[arg(long)]
    pln: bool,
}

fn parse_instant(s: &str) -> Result<NaiveDateTime, String> {
    parse_datetime(s).ok_or_else(|| format!("unrecognized date-time: {s}"))
}

impl PriceCommand {
    pub fn exec(&self) -> anyhow::Result<()> {
        let config = Config::default();
        let mut prices = PriceResolver::new(BinanceApi::new(), &config.rules);
        let symbol = self.symbol.to_uppercase();

        match prices.resolve(&symbol, self.at) {
            Some(price) => {
                println!(
                    "{symbol} = {price} {PIVOT_FIAT} (hourly close at {})",
                    floor_to_hour(self.at)
                );
                if self.pln {
                    let mut rates = RateResolver::new(NbpApi::new());
                    let quote = rates.resolve(PIVOT_FIAT, self.at.date())?;
                    println!(
                        "{symbol} = {} PLN (NBP {PIVOT_FIAT} rate {}, published {})",
                        price * quote.rate,
                        quote.rate,
                        quote.date
                    );
                }
            }
            None => {
                println!(
                    "{symbol} has no automatic {PIVOT_FIAT} valuation at {} \
                     (fiat symbol or no market pair)",
                    floor_to_hour(self.at)
                );
            }
        }
        Ok(())
    }
}
