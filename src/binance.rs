//! Historical crypto valuations from Binance 1-hour klines.
//!
//! Assets are priced in USD (fees and income are valued through the
//! asset→USD→PLN chain). The valuation instant is the hourly candle at the
//! start of the transaction's hour. When no direct USDT pair exists the
//! resolver triangulates through one of the large-cap bridge assets; bridges
//! themselves are only ever priced directly against USDT, so the indirection
//! is one level deep by construction.

use crate::nbp::TransportError;
use chrono::{NaiveDateTime, Timelike};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::thread;
use std::time::Duration as StdDuration;

pub const BINANCE_KLINES: &str = "https://api.binance.com/api/v3/klines";

/// Quote assets tried for a symbol, in fixed priority order. USDT stands in
/// for the USD pivot; the rest are bridge assets.
const QUOTE_ASSETS: [&str; 4] = ["USDT", "BTC", "ETH", "BNB"];

/// Fixed inter-call delay so the upstream API is not hammered.
const COURTESY_DELAY: StdDuration = StdDuration::from_millis(50);

/// Close price of one hourly candle.
pub trait PriceSource {
    /// The close of the 1h candle opening at `hour`, or `None` when the pair
    /// does not trade or has no data there.
    fn hourly_close(
        &self,
        pair: &str,
        hour: NaiveDateTime,
    ) -> Result<Option<Decimal>, TransportError>;
}

/// Caching USD price resolver over hourly candles.
///
/// Absence is a legitimate terminal state ("cannot price this asset
/// automatically"), not a failure; callers surface it for manual review.
pub struct PriceResolver<S> {
    source: S,
    stablecoins: BTreeSet<String>,
    fiat_currencies: BTreeSet<String>,
    cache: HashMap<(String, NaiveDateTime), Decimal>,
    requests: u64,
}

impl<S: PriceSource> PriceResolver<S> {
    pub fn new(source: S, rules: &crate::config::RuleSet) -> Self {
        PriceResolver {
            source,
            stablecoins: rules.stablecoins.clone(),
            fiat_currencies: rules.fiat_currencies.clone(),
            cache: HashMap::new(),
            requests: 0,
        }
    }

    /// Number of source lookups issued so far (for run statistics).
    pub fn request_count(&self) -> u64 {
        self.requests
    }

    /// Resolve the USD price of `symbol` at the transaction instant.
    pub fn resolve(&mut self, symbol: &str, at: NaiveDateTime) -> Option<Decimal> {
        let symbol = symbol.to_uppercase();
        if self.stablecoins.contains(&symbol) {
            return Some(Decimal::ONE);
        }
        // Fiat is valued through the NBP rate path, never through klines.
        if self.fiat_currencies.contains(&symbol) {
            return None;
        }

        let hour = floor_to_hour(at);
        if let Some(&price) = self.cache.get(&(symbol.clone(), hour)) {
            return Some(price);
        }

        for quote in QUOTE_ASSETS {
            if quote == symbol {
                continue;
            }
            let pair = format!("{symbol}{quote}");
            let Some(close) = self.fetch_close(&pair, hour) else {
                continue;
            };
            let usd = if quote == "USDT" {
                close
            } else {
                match self.bridge_usd(quote, hour) {
                    Some(bridge_usd) => close * bridge_usd,
                    None => continue,
                }
            };
            self.cache.insert((symbol, hour), usd);
            return Some(usd);
        }
        None
    }

    /// USD price of a bridge asset. Bridges resolve directly against USDT -
    /// no further bridging, which bounds the triangulation depth at one.
    fn bridge_usd(&mut self, bridge: &str, hour: NaiveDateTime) -> Option<Decimal> {
        if let Some(&price) = self.cache.get(&(bridge.to_string(), hour)) {
            return Some(price);
        }
        let close = self.fetch_close(&format!("{bridge}USDT"), hour)?;
        self.cache.insert((bridge.to_string(), hour), close);
        Some(close)
    }

    fn fetch_close(&mut self, pair: &str, hour: NaiveDateTime) -> Option<Decimal> {
        self.requests += 1;
        match self.source.hourly_close(pair, hour) {
            Ok(close) => close,
            Err(err) => {
                log::warn!("price lookup failed for {pair} at {hour}: {err}");
                None
            }
        }
    }
}

/// The valuation instant is the most recent hourly close at or before the
/// transaction time, so timestamps floor to the start of their hour.
pub fn floor_to_hour(at: NaiveDateTime) -> NaiveDateTime {
    at.date()
        .and_hms_opt(at.time().hour(), 0, 0)
        .expect("hour is in range")
}

/// Live Binance klines client.
pub struct BinanceApi {
    agent: ureq::Agent,
}

impl BinanceApi {
    pub fn new() -> Self {
        BinanceApi {
            agent: ureq::AgentBuilder::new()
                .timeout(StdDuration::from_secs(8))
                .build(),
        }
    }
}

impl Default for BinanceApi {
    fn default() -> Self {
        Self::new()
    }
}

/// One kline row: `[open_time, open, high, low, close, ...]`, prices as
/// strings.
#[derive(Debug, Deserialize)]
struct Kline(Vec<serde_json::Value>);

impl Kline {
    fn close(&self) -> Option<Decimal> {
        self.0
            .get(4)
            .and_then(|v| v.as_str())
            .and_then(|s| Decimal::from_str(s).ok())
    }
}

impl PriceSource for BinanceApi {
    fn hourly_close(
        &self,
        pair: &str,
        hour: NaiveDateTime,
    ) -> Result<Option<Decimal>, TransportError> {
        let start_ms = hour.and_utc().timestamp_millis();
        let result = self
            .agent
            .get(BINANCE_KLINES)
            .query("symbol", pair)
            .query("interval", "1h")
            .query("startTime", &start_ms.to_string())
            .query("limit", "1")
            .call();
        thread::sleep(COURTESY_DELAY);
        match result {
            Ok(response) => {
                let klines: Vec<Kline> = response
                    .into_json()
                    .map_err(|err| TransportError(format!("invalid klines response: {err}")))?;
                Ok(klines.first().and_then(Kline::close))
            }
            // unknown trading pair
            Err(ureq::Error::Status(400, _)) | Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(ureq::Error::Status(code, _)) => {
                Err(TransportError(format!("Binance returned HTTP {code}")))
            }
            Err(err) => Err(TransportError(err.to_string())),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;

    /// In-memory kline source with a call counter.
    #[derive(Default)]
    pub struct FakePriceSource {
        closes: HashMap<(String, NaiveDateTime), Decimal>,
        pub calls: RefCell<u64>,
    }

    impl FakePriceSource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_close(mut self, pair: &str, hour: NaiveDateTime, close: Decimal) -> Self {
            self.closes.insert((pair.to_string(), hour), close);
            self
        }

        pub fn call_count(&self) -> u64 {
            *self.calls.borrow()
        }
    }

    impl PriceSource for FakePriceSource {
        fn hourly_close(
            &self,
            pair: &str,
            hour: NaiveDateTime,
        ) -> Result<Option<Decimal>, TransportError> {
            *self.calls.borrow_mut() += 1;
            Ok(self.closes.get(&(pair.to_string(), hour)).copied())
        }
    }
}
