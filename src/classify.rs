//! Transaction classification: the ordered rule table mapping one ledger row
//! to a tax category and a PLN-valued record.
//!
//! The branch order is a contract. Operation labels can belong to more than
//! one vocabulary (a "Fiat Deposit" is both a trade label and a technical
//! label), and the first matching branch wins: trade, fee, income, dust
//! conversion, technical, fiat deposit/withdrawal, then the catch-all. The
//! catch-all guarantees totality - every row yields exactly one category.

use crate::binance::{PriceResolver, PriceSource};
use crate::config::{RuleSet, PIVOT_FIAT};
use crate::ledger::LedgerRow;
use crate::nbp::{RateError, RateResolver, RateSource};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;

/// Tax category assigned to one ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Category {
    /// Disposal proceeds (PIT-38 field 34).
    Revenue,
    /// Acquisition or transaction costs (PIT-38 field 35).
    Cost,
    /// Market-value income from a non-disposal receipt (part of field 34).
    Income,
    /// Tax-neutral.
    Ignored,
    /// Ambiguous or unvaluable; needs manual review.
    Warning,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Revenue,
        Category::Cost,
        Category::Income,
        Category::Ignored,
        Category::Warning,
    ];

    pub fn display(self) -> &'static str {
        match self {
            Category::Revenue => "Revenue",
            Category::Cost => "Cost",
            Category::Income => "Income",
            Category::Ignored => "Ignored",
            Category::Warning => "Warning",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display())
    }
}

/// Statute grounding a valued record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LegalBasis {
    /// Documented expenditure directly incurred to acquire virtual currency.
    AcquisitionCost,
    /// Proceeds from exchanging virtual currency for legal tender.
    DisposalProceeds,
    /// Market value of virtual currency on the day of receipt.
    MarketValueIncome,
}

impl LegalBasis {
    pub fn citation(self) -> &'static str {
        match self {
            LegalBasis::AcquisitionCost => "art. 22 ust. 14 updof",
            LegalBasis::DisposalProceeds => "art. 17 ust. 1f updof",
            LegalBasis::MarketValueIncome => {
                "art. 17 ust. 1f updof (market value on the day of receipt)"
            }
        }
    }
}

impl fmt::Display for LegalBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.citation())
    }
}

/// How a record's PLN value was derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Valuation {
    /// |Δ| × official daily rate.
    FiatRate { rate: Decimal, rate_date: NaiveDate },
    /// |Δ| × hourly USD price × official USD daily rate.
    UsdChain {
        usd_price: Decimal,
        usd_rate: Decimal,
        rate_date: NaiveDate,
    },
    /// No valuation required or none possible.
    Unvalued,
}

/// One classified, valued ledger row. A pure projection of the input - built
/// once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedRecord {
    pub category: Category,
    pub row: LedgerRow,
    /// Resolved value in PLN, to 6 decimal places. Absent for ignored rows
    /// and warnings.
    pub value_pln: Option<Decimal>,
    pub valuation: Valuation,
    pub basis: Option<LegalBasis>,
    /// Human-readable rationale for the classification.
    pub note: String,
    /// Set when a resolver failure demoted this row to a warning.
    pub error: Option<String>,
}

impl ClassifiedRecord {
    fn valued(
        category: Category,
        row: LedgerRow,
        value_pln: Decimal,
        valuation: Valuation,
        basis: LegalBasis,
        note: String,
    ) -> Self {
        ClassifiedRecord {
            category,
            row,
            value_pln: Some(value_pln),
            valuation,
            basis: Some(basis),
            note,
            error: None,
        }
    }

    fn ignored(row: LedgerRow, note: impl Into<String>) -> Self {
        ClassifiedRecord {
            category: Category::Ignored,
            row,
            value_pln: None,
            valuation: Valuation::Unvalued,
            basis: None,
            note: note.into(),
            error: None,
        }
    }

    fn warning(row: LedgerRow, note: impl Into<String>) -> Self {
        ClassifiedRecord {
            category: Category::Warning,
            row,
            value_pln: None,
            valuation: Valuation::Unvalued,
            basis: None,
            note: note.into(),
            error: None,
        }
    }

    fn demoted(row: LedgerRow, err: RateError) -> Self {
        let mut record = Self::warning(
            row,
            format!("valuation failed: {err}; value this row manually"),
        );
        record.error = Some(err.to_string());
        record
    }
}

/// Classify one ledger row, resolving rates and prices as needed.
///
/// Total over the input domain: every row produces exactly one record. A
/// rate-resolution failure is local to the row - it demotes the record to a
/// warning carrying the cause and never aborts the batch.
pub fn classify<R: RateSource, P: PriceSource>(
    row: LedgerRow,
    rules: &RuleSet,
    rates: &mut RateResolver<R>,
    prices: &mut PriceResolver<P>,
) -> ClassifiedRecord {
    let op = row.operation.clone();
    let asset = row.asset.clone();
    let quantity = row.quantity();
    let is_fiat = rules.is_fiat(&asset);
    let is_stable = rules.is_stablecoin(&asset);

    // 1. Trade operations: only the fiat leg is tax-relevant.
    if rules.is_trade_op(&op) {
        if is_fiat && row.is_outflow() {
            return match fiat_value(rates, &asset, row.date(), quantity) {
                Ok((value, valuation)) => ClassifiedRecord::valued(
                    Category::Cost,
                    row,
                    value,
                    valuation,
                    LegalBasis::AcquisitionCost,
                    format!("acquisition cost - {op}"),
                ),
                Err(err) => ClassifiedRecord::demoted(row, err),
            };
        } else if is_fiat && row.is_inflow() {
            return match fiat_value(rates, &asset, row.date(), quantity) {
                Ok((value, valuation)) => ClassifiedRecord::valued(
                    Category::Revenue,
                    row,
                    value,
                    valuation,
                    LegalBasis::DisposalProceeds,
                    format!("disposal proceeds - {op}"),
                ),
                Err(err) => ClassifiedRecord::demoted(row, err),
            };
        } else {
            let note = if is_stable {
                "crypto-to-stablecoin exchange, tax-neutral (KIS position 2024/2025)"
            } else {
                "crypto-to-crypto exchange, tax-neutral (art. 17 ust. 1f updof)"
            };
            return ClassifiedRecord::ignored(row, note);
        }
    }

    // 2. Transaction fees are deductible costs.
    if rules.is_fee_op(&op) {
        if is_fiat {
            return match fiat_value(rates, &asset, row.date(), quantity) {
                Ok((value, valuation)) => ClassifiedRecord::valued(
                    Category::Cost,
                    row,
                    value,
                    valuation,
                    LegalBasis::AcquisitionCost,
                    format!("transaction fee ({asset})"),
                ),
                Err(err) => ClassifiedRecord::demoted(row, err),
            };
        }
        return match usd_chain_value(rates, prices, &row, quantity) {
            Ok(Some((value, valuation))) => ClassifiedRecord::valued(
                Category::Cost,
                row,
                value,
                valuation,
                LegalBasis::AcquisitionCost,
                format!("crypto fee ({asset} → {PIVOT_FIAT} → PLN)"),
            ),
            Ok(None) => ClassifiedRecord::warning(
                row,
                format!(
                    "fee in {asset} could not be auto-priced (no market pair); \
                     value it manually and add it to costs"
                ),
            ),
            Err(err) => ClassifiedRecord::demoted(row, err),
        };
    }

    // 3. Earn/staking/airdrop receipts: market value on the receipt day is
    //    income, and simultaneously the user's future disposal cost basis.
    if rules.is_income_op(&op) && row.is_inflow() {
        return match usd_chain_value(rates, prices, &row, quantity) {
            Ok(Some((value, valuation))) => ClassifiedRecord::valued(
                Category::Income,
                row,
                value,
                valuation,
                LegalBasis::MarketValueIncome,
                format!(
                    "earn/staking income - {op}; this PLN value is the acquisition \
                     cost for a future disposal of {asset}"
                ),
            ),
            Ok(None) => ClassifiedRecord::warning(
                row,
                format!(
                    "income from {op} in {asset} could not be auto-priced; \
                     value it manually and add it to revenues"
                ),
            ),
            Err(err) => ClassifiedRecord::demoted(row, err),
        };
    }

    // 4. Dust conversion: crypto-to-crypto, neutral, but flagged for review.
    if rules.is_dust_conversion(&op) {
        return ClassifiedRecord::ignored(
            row,
            "dust conversion to BNB (crypto-to-crypto, tax-neutral); needs manual \
             correction if the dust was exchanged for fiat",
        );
    }

    // 5. Internal transfers and balance housekeeping.
    if rules.is_technical_op(&op) {
        return ClassifiedRecord::ignored(row, format!("technical operation ({op}), no tax effect"));
    }

    // 6. Own-funds fiat movement.
    if is_fiat && rules.is_fiat_deposit(&op) {
        return ClassifiedRecord::ignored(row, "deposit of own fiat funds");
    }
    if is_fiat && rules.is_fiat_withdrawal(&op) {
        return ClassifiedRecord::ignored(row, "withdrawal of fiat funds to a bank account");
    }

    // 7. Catch-all.
    ClassifiedRecord::warning(
        row,
        format!("unknown operation '{op}' for {asset}; requires manual tax classification"),
    )
}

/// |Δ| × NBP daily rate, to 6 decimal places.
fn fiat_value<R: RateSource>(
    rates: &mut RateResolver<R>,
    currency: &str,
    as_of: NaiveDate,
    quantity: Decimal,
) -> Result<(Decimal, Valuation), RateError> {
    let quote = rates.resolve(currency, as_of)?;
    let value = (quantity * quote.rate).round_dp(6);
    Ok((
        value,
        Valuation::FiatRate {
            rate: quote.rate,
            rate_date: quote.date,
        },
    ))
}

/// |Δ| × hourly USD price × NBP USD rate, to 6 decimal places.
///
/// `Ok(None)` means the asset has no automatic USD valuation; the
/// intermediate products stay unrounded so rounding never compounds.
fn usd_chain_value<R: RateSource, P: PriceSource>(
    rates: &mut RateResolver<R>,
    prices: &mut PriceResolver<P>,
    row: &LedgerRow,
    quantity: Decimal,
) -> Result<Option<(Decimal, Valuation)>, RateError> {
    let Some(usd_price) = prices.resolve(&row.asset, row.datetime) else {
        return Ok(None);
    };
    let quote = rates.resolve(PIVOT_FIAT, row.date())?;
    let value = (quantity * usd_price * quote.rate).round_dp(6);
    Ok(Some((
        value,
        Valuation::UsdChain {
            usd_price,
            usd_rate: quote.rate,
            rate_date: quote.date,
        },
    )))
}
