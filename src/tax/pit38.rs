//! PIT-38 aggregation: folding the classified records into the figures the
//! taxpayer declares.
//!
//! Art. 30b ust. 1a/1b updof: tax is 19% of the difference between the year's
//! disposal revenues and the costs determined under art. 22 ust. 14-16. The
//! taxable base and the tax are each rounded to whole złoty half-up, and the
//! tax is computed from the already-rounded base - that order is fixed by the
//! statute and must not be collapsed into one rounding.

use crate::classify::{Category, ClassifiedRecord};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

/// Whole-złoty rounding, half-up. Inputs here are never negative, so
/// midpoint-away-from-zero is exactly half-up.
pub fn round_to_whole_pln(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

/// The aggregate figures of one tax year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaxSummary {
    /// Proceeds from crypto→fiat disposals.
    pub revenue_from_disposals: Decimal,
    /// Market-value income from earn/staking/airdrop receipts.
    pub income_from_rewards: Decimal,
    /// PIT-38 field 34.
    pub total_receipts: Decimal,
    /// Costs incurred this year.
    pub costs_current_year: Decimal,
    /// Cost excess carried from prior years (art. 22 ust. 16 updof).
    pub carried_costs: Decimal,
    /// PIT-38 field 35.
    pub total_costs: Decimal,
    /// max(0, receipts − costs), unrounded.
    pub taxable_income: Decimal,
    /// Taxable base in whole złoty.
    pub taxable_base: Decimal,
    /// Tax due in whole złoty, rounded independently of the base.
    pub tax_due: Decimal,
    /// Cost excess to carry into next year's return, unrounded.
    pub carry_forward: Decimal,
}

/// Fold all classified records (chronological order assumed upstream) plus the
/// carried cost excess into the final figures.
pub fn summarize(
    records: &[ClassifiedRecord],
    carried_costs: Decimal,
    tax_rate: Decimal,
) -> TaxSummary {
    let mut revenue_from_disposals = Decimal::ZERO;
    let mut income_from_rewards = Decimal::ZERO;
    let mut costs_current_year = Decimal::ZERO;

    for record in records {
        let value = record.value_pln.unwrap_or(Decimal::ZERO);
        match record.category {
            Category::Revenue => revenue_from_disposals += value,
            Category::Income => income_from_rewards += value,
            Category::Cost => costs_current_year += value,
            Category::Ignored | Category::Warning => {}
        }
    }

    let total_receipts = revenue_from_disposals + income_from_rewards;
    let total_costs = costs_current_year + carried_costs;

    let taxable_income = (total_receipts - total_costs).max(Decimal::ZERO);
    let carry_forward = (total_costs - total_receipts).max(Decimal::ZERO);

    // Base first, then tax from the rounded base.
    let taxable_base = round_to_whole_pln(taxable_income);
    let tax_due = round_to_whole_pln(taxable_base * tax_rate);

    TaxSummary {
        revenue_from_disposals,
        income_from_rewards,
        total_receipts,
        costs_current_year,
        carried_costs,
        total_costs,
        taxable_income,
        taxable_base,
        tax_due,
        carry_forward,
    }
}
