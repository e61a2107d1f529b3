//! Official daily fiat exchange rates from the NBP table-A API.
//!
//! Art. 22 ust. 1 updof: a foreign-currency amount is valued at the average
//! NBP rate of the last day preceding the transaction date on which a rate was
//! published. The resolver starts at the preceding day and walks backward over
//! weekends and holidays, up to [`MAX_LOOKBACK_DAYS`] calendar days.

use crate::config::LOCAL_FIAT;
use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::thread;
use std::time::Duration as StdDuration;

pub const NBP_API_BASE: &str = "https://api.nbp.pl/api/exchangerates/rates/a";

/// How far the backward walk may go before giving up.
pub const MAX_LOOKBACK_DAYS: i64 = 14;

/// Pause after a rate-limited response before retrying the same day.
const RATE_LIMIT_BACKOFF: StdDuration = StdDuration::from_secs(5);

/// Pause before the single retry of a transient transport failure.
const TRANSPORT_RETRY_DELAY: StdDuration = StdDuration::from_secs(1);

/// Fixed inter-call delay so the upstream API is not hammered.
const COURTESY_DELAY: StdDuration = StdDuration::from_millis(50);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RateError {
    #[error(
        "no NBP rate for {currency} within {MAX_LOOKBACK_DAYS} days before {as_of} \
         (is the currency quoted in NBP table A?)"
    )]
    Unavailable { currency: String, as_of: NaiveDate },
}

/// A transport-level failure talking to the source (timeout, connection loss).
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Outcome of asking the source for one (currency, date).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DailyRate {
    /// The average rate published for that day.
    Published(Decimal),
    /// No table published that day (weekend or holiday).
    NotPublished,
    /// The source asked us to slow down.
    RateLimited,
}

/// Lookup of the official daily rate for one currency and date.
pub trait RateSource {
    fn daily_rate(&self, currency: &str, date: NaiveDate) -> Result<DailyRate, TransportError>;
}

/// A successfully resolved rate, recording the publication date actually used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateQuote {
    pub rate: Decimal,
    pub date: NaiveDate,
}

/// Caching resolver implementing the preceding-day rule and the backward walk.
///
/// The cache is keyed by (currency, probed date) and lives for one run; the
/// distinct key space of a single tax year is small, so no eviction is needed.
pub struct RateResolver<S> {
    source: S,
    cache: HashMap<(String, NaiveDate), Decimal>,
    requests: u64,
    rate_limit_backoff: StdDuration,
    transport_retry_delay: StdDuration,
}

impl<S: RateSource> RateResolver<S> {
    pub fn new(source: S) -> Self {
        Self::with_backoff(source, RATE_LIMIT_BACKOFF, TRANSPORT_RETRY_DELAY)
    }

    /// Constructor with explicit backoff delays (tests use zero).
    pub fn with_backoff(
        source: S,
        rate_limit_backoff: StdDuration,
        transport_retry_delay: StdDuration,
    ) -> Self {
        RateResolver {
            source,
            cache: HashMap::new(),
            requests: 0,
            rate_limit_backoff,
            transport_retry_delay,
        }
    }

    /// Number of source lookups issued so far (for run statistics).
    pub fn request_count(&self) -> u64 {
        self.requests
    }

    /// Resolve the PLN rate for `currency` as of a transaction date.
    ///
    /// Starts at the day preceding `as_of` and walks backward one calendar day
    /// at a time; fails deterministically after [`MAX_LOOKBACK_DAYS`] misses.
    pub fn resolve(&mut self, currency: &str, as_of: NaiveDate) -> Result<RateQuote, RateError> {
        let currency = currency.to_uppercase();
        if currency == LOCAL_FIAT {
            return Ok(RateQuote {
                rate: Decimal::ONE,
                date: as_of,
            });
        }

        let preceding = as_of - Duration::days(1);
        for days_back in 0..MAX_LOOKBACK_DAYS {
            let date = preceding - Duration::days(days_back);
            let key = (currency.clone(), date);
            if let Some(&rate) = self.cache.get(&key) {
                return Ok(RateQuote { rate, date });
            }
            if let Some(rate) = self.probe_day(&currency, date) {
                self.cache.insert(key, rate);
                return Ok(RateQuote { rate, date });
            }
        }
        Err(RateError::Unavailable {
            currency,
            as_of,
        })
    }

    /// Probe the source for one day. `None` means "no rate for this day, keep
    /// walking" - whether because none was published or because the bounded
    /// retries were exhausted.
    fn probe_day(&mut self, currency: &str, date: NaiveDate) -> Option<Decimal> {
        let mut retried_rate_limit = false;
        let mut retried_transport = false;
        loop {
            self.requests += 1;
            match self.source.daily_rate(currency, date) {
                Ok(DailyRate::Published(rate)) => return Some(rate),
                Ok(DailyRate::NotPublished) => return None,
                Ok(DailyRate::RateLimited) => {
                    if retried_rate_limit {
                        log::warn!("NBP still rate-limited for {currency} {date}, skipping day");
                        return None;
                    }
                    retried_rate_limit = true;
                    log::warn!("NBP rate limit hit, backing off");
                    thread::sleep(self.rate_limit_backoff);
                }
                Err(err) => {
                    if retried_transport {
                        log::warn!("NBP lookup failed twice for {currency} {date}: {err}");
                        return None;
                    }
                    retried_transport = true;
                    log::debug!("NBP lookup failed for {currency} {date}, retrying: {err}");
                    thread::sleep(self.transport_retry_delay);
                }
            }
        }
    }
}

/// Live NBP table-A client.
pub struct NbpApi {
    agent: ureq::Agent,
}

impl NbpApi {
    pub fn new() -> Self {
        NbpApi {
            agent: ureq::AgentBuilder::new()
                .timeout(StdDuration::from_secs(8))
                .build(),
        }
    }
}

impl Default for NbpApi {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct RateTable {
    rates: Vec<RateEntry>,
}

#[derive(Debug, Deserialize)]
struct RateEntry {
    #[serde(with = "rust_decimal::serde::float")]
    mid: Decimal,
}

impl RateSource for NbpApi {
    fn daily_rate(&self, currency: &str, date: NaiveDate) -> Result<DailyRate, TransportError> {
        let url = format!(
            "{NBP_API_BASE}/{}/{}/",
            currency.to_lowercase(),
            date.format("%Y-%m-%d")
        );
        let result = self.agent.get(&url).query("format", "json").call();
        thread::sleep(COURTESY_DELAY);
        match result {
            Ok(response) => {
                let table: RateTable = response
                    .into_json()
                    .map_err(|err| TransportError(format!("invalid NBP response: {err}")))?;
                match table.rates.first() {
                    Some(entry) => Ok(DailyRate::Published(entry.mid)),
                    None => Ok(DailyRate::NotPublished),
                }
            }
            Err(ureq::Error::Status(404, _)) => Ok(DailyRate::NotPublished),
            Err(ureq::Error::Status(429, _)) => Ok(DailyRate::RateLimited),
            Err(ureq::Error::Status(code, _)) => {
                Err(TransportError(format!("NBP returned HTTP {code}")))
            }
            Err(err) => Err(TransportError(err.to_string())),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;

    /// In-memory rate source with scripted outcomes and a call counter.
    #[derive(Default)]
    pub struct FakeRateSource {
        rates: HashMap<(String, NaiveDate), Decimal>,
        rate_limited_once: RefCell<HashMap<(String, NaiveDate), bool>>,
        failing_once: RefCell<HashMap<(String, NaiveDate), bool>>,
        pub calls: RefCell<u64>,
    }

    impl FakeRateSource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_rate(mut self, currency: &str, date: NaiveDate, rate: Decimal) -> Self {
            self.rates.insert((currency.to_string(), date), rate);
            self
        }

        /// The first probe of this key reports a rate limit.
        pub fn rate_limited_once(self, currency: &str, date: NaiveDate) -> Self {
            self.rate_limited_once
                .borrow_mut()
                .insert((currency.to_string(), date), true);
            self
        }

        /// The first probe of this key fails at the transport level.
        pub fn failing_once(self, currency: &str, date: NaiveDate) -> Self {
            self.failing_once
                .borrow_mut()
                .insert((currency.to_string(), date), true);
            self
        }

        pub fn call_count(&self) -> u64 {
            *self.calls.borrow()
        }
    }

    impl RateSource for FakeRateSource {
        fn daily_rate(
            &self,
            currency: &str,
            date: NaiveDate,
        ) -> Result<DailyRate, TransportError> {
            *self.calls.borrow_mut() += 1;
            let key = (currency.to_string(), date);
            if self
                .rate_limited_once
                .borrow_mut()
                .remove(&key)
                .unwrap_or(false)
            {
                return Ok(DailyRate::RateLimited);
            }
            if self.failing_once.borrow_mut().remove(&key).unwrap_or(false) {
                return Err(TransportError("connection reset".to_string()));
            }
            match self.rates.get(&key) {
                Some(&rate) => Ok(DailyRate::Published(rate)),
                None => Ok(DailyRate::NotPublished),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeRateSource;
    use super::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn resolver(source: FakeRateSource) -> RateResolver<FakeRateSource> {
        RateResolver::with_backoff(source, StdDuration::ZERO, StdDuration::ZERO)
    }

    #[test]
    fn local_fiat_needs_no_lookup() {
        let mut resolver = resolver(FakeRateSource::new());
        let quote = resolver.resolve("PLN", date(2025, 3, 10)).unwrap();
        assert_eq!(quote.rate, Decimal::ONE);
        assert_eq!(resolver.request_count(), 0);
    }

    #[test]
    fn uses_the_day_preceding_the_transaction() {
        let source = FakeRateSource::new()
            .with_rate("EUR", date(2025, 3, 10), dec!(4.30))
            .with_rate("EUR", date(2025, 3, 9), dec!(4.20));
        let mut resolver = resolver(source);
        // transaction on the 10th must use the 9th, not the 10th
        let quote = resolver.resolve("EUR", date(2025, 3, 10)).unwrap();
        assert_eq!(quote.rate, dec!(4.20));
        assert_eq!(quote.date, date(2025, 3, 9));
    }

    #[test]
    fn walks_backward_over_a_weekend() {
        // Monday transaction: Sunday and Saturday unpublished, Friday has it.
        let source = FakeRateSource::new().with_rate("USD", date(2025, 3, 7), dec!(3.95));
        let mut resolver = resolver(source);
        let quote = resolver.resolve("USD", date(2025, 3, 10)).unwrap();
        assert_eq!(quote.rate, dec!(3.95));
        assert_eq!(quote.date, date(2025, 3, 7));
        // Sunday + Saturday misses, then the Friday hit
        assert_eq!(resolver.request_count(), 3);
    }

    #[test]
    fn caches_by_currency_and_date() {
        let source = FakeRateSource::new().with_rate("USD", date(2025, 3, 9), dec!(3.90));
        let mut resolver = resolver(source);
        let first = resolver.resolve("USD", date(2025, 3, 10)).unwrap();
        let second = resolver.resolve("USD", date(2025, 3, 10)).unwrap();
        assert_eq!(first, second);
        // second resolve answered from cache
        assert_eq!(resolver.request_count(), 1);
    }

    #[test]
    fn cache_serves_walks_starting_later() {
        // A hit cached for Friday also terminates a walk starting on Tuesday.
        let source = FakeRateSource::new().with_rate("USD", date(2025, 3, 7), dec!(3.95));
        let mut resolver = resolver(source);
        resolver.resolve("USD", date(2025, 3, 10)).unwrap();
        let calls_after_first = resolver.request_count();
        let quote = resolver.resolve("USD", date(2025, 3, 11)).unwrap();
        assert_eq!(quote.date, date(2025, 3, 7));
        // unpublished days are re-probed; the Friday rate itself is cached
        assert_eq!(resolver.request_count(), calls_after_first + 3);
    }

    #[test]
    fn fails_after_exactly_fourteen_misses() {
        let mut resolver = resolver(FakeRateSource::new());
        let err = resolver.resolve("CZK", date(2025, 3, 10)).unwrap_err();
        assert_eq!(
            err,
            RateError::Unavailable {
                currency: "CZK".to_string(),
                as_of: date(2025, 3, 10),
            }
        );
        assert_eq!(resolver.request_count(), MAX_LOOKBACK_DAYS as u64);
    }

    #[test]
    fn rate_limit_retries_the_same_day() {
        let source = FakeRateSource::new()
            .with_rate("USD", date(2025, 3, 9), dec!(3.90))
            .rate_limited_once("USD", date(2025, 3, 9));
        let mut resolver = resolver(source);
        let quote = resolver.resolve("USD", date(2025, 3, 10)).unwrap();
        // same day succeeded on the retry, not a later day
        assert_eq!(quote.date, date(2025, 3, 9));
        assert_eq!(resolver.request_count(), 2);
    }

    #[test]
    fn transient_failure_is_retried_once() {
        let source = FakeRateSource::new()
            .with_rate("USD", date(2025, 3, 9), dec!(3.90))
            .failing_once("USD", date(2025, 3, 9));
        let mut resolver = resolver(source);
        let quote = resolver.resolve("USD", date(2025, 3, 10)).unwrap();
        // retry of the same day succeeds
        assert_eq!(quote.date, date(2025, 3, 9));
        assert_eq!(resolver.request_count(), 2);
    }

    #[test]
    fn currency_is_case_insensitive() {
        let source = FakeRateSource::new().with_rate("USD", date(2025, 3, 9), dec!(3.90));
        let mut resolver = resolver(source);
        let quote = resolver.resolve("usd", date(2025, 3, 10)).unwrap();
        assert_eq!(quote.rate, dec!(3.90));
    }
}
