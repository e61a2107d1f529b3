//! Rule tables and run parameters consumed by the classification engine.
//!
//! The compiled-in defaults match the Binance "Generate all statements" ledger
//! vocabulary. Any field can be overridden from a JSON config file; omitted
//! fields keep their defaults.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Local fiat currency: all valuations end in Polish złoty.
pub const LOCAL_FIAT: &str = "PLN";

/// Reference fiat unit crypto assets are priced in before conversion to PLN.
pub const PIVOT_FIAT: &str = "USD";

/// Run configuration: rule tables plus the scalar tax parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rules: RuleSet,
    /// Statutory rate for income from disposal of virtual currencies
    /// (art. 30b ust. 1a updof).
    pub tax_rate: Decimal,
    /// Cost excess carried forward from prior years (art. 22 ust. 16 updof).
    pub carried_costs: Decimal,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rules: RuleSet::default(),
            tax_rate: dec!(0.19),
            carried_costs: Decimal::ZERO,
        }
    }
}

impl Config {
    /// Load a config file, falling back to defaults for omitted fields.
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let file = File::open(path)?;
        let config = serde_json::from_reader(BufReader::new(file))?;
        Ok(config)
    }
}

/// The controlled operation-label vocabularies and symbol sets.
///
/// Labels can be members of more than one set (e.g. "Fiat Deposit" is both a
/// trade label and a technical label). The classifier's branch order decides
/// which membership wins; the sets themselves are plain lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    /// Operations that exchange one asset for another (buys, sells, converts).
    pub trade_ops: BTreeSet<String>,
    /// Transaction fee labels.
    pub fee_ops: BTreeSet<String>,
    /// Operations producing taxable income on receipt (staking, airdrops,
    /// interest, referral rewards).
    pub income_ops: BTreeSet<String>,
    /// Internal transfers and balance housekeeping with no tax effect.
    pub technical_ops: BTreeSet<String>,
    /// Fiat deposit labels (own-funds movement).
    pub fiat_deposit_ops: BTreeSet<String>,
    /// Fiat withdrawal labels (own-funds movement).
    pub fiat_withdrawal_ops: BTreeSet<String>,
    /// Case-insensitive substrings identifying dust-conversion operations.
    pub dust_patterns: Vec<String>,
    /// Fiat currency codes: a crypto-to-fiat exchange is the taxable event.
    pub fiat_currencies: BTreeSet<String>,
    /// Stablecoins treated as pegged 1:1 to USD for valuation, and as
    /// tax-neutral when exchanged with other crypto assets.
    pub stablecoins: BTreeSet<String>,
}

impl RuleSet {
    pub fn is_trade_op(&self, label: &str) -> bool {
        self.trade_ops.contains(label)
    }

    pub fn is_fee_op(&self, label: &str) -> bool {
        self.fee_ops.contains(label)
    }

    pub fn is_income_op(&self, label: &str) -> bool {
        self.income_ops.contains(label)
    }

    pub fn is_technical_op(&self, label: &str) -> bool {
        self.technical_ops.contains(label)
    }

    pub fn is_fiat_deposit(&self, label: &str) -> bool {
        self.fiat_deposit_ops.contains(label)
    }

    pub fn is_fiat_withdrawal(&self, label: &str) -> bool {
        self.fiat_withdrawal_ops.contains(label)
    }

    /// Dust conversions are matched by substring because the exchange varies
    /// the label casing across export vintages.
    pub fn is_dust_conversion(&self, label: &str) -> bool {
        let label = label.to_lowercase();
        self.dust_patterns
            .iter()
            .any(|p| label.contains(&p.to_lowercase()))
    }

    pub fn is_fiat(&self, symbol: &str) -> bool {
        self.fiat_currencies.contains(symbol)
    }

    pub fn is_stablecoin(&self, symbol: &str) -> bool {
        self.stablecoins.contains(symbol)
    }
}

fn string_set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for RuleSet {
    fn default() -> Self {
        RuleSet {
            trade_ops: string_set(&[
                "Transaction Spend",
                "Transaction Revenue",
                "Transaction Related",
                "Binance Convert",
                "Buy",
                "Sell",
                "Large OTC trading",
                "P2P Trading",
                "Fiat Deposit",
                "Fiat Withdraw",
            ]),
            fee_ops: string_set(&["Transaction Fee", "Fee", "Trading Fee"]),
            income_ops: string_set(&[
                "ETH 2.0 Staking Rewards",
                "Staking Rewards",
                "DOT Staking Rewards",
                "SOL Staking Rewards",
                "ADA Staking Rewards",
                "Simple Earn Flexible Interest",
                "Simple Earn Locked Rewards",
                "Simple Earn Flexible Airdrop",
                "Savings Interest",
                "Savings Distribution",
                "Launchpool Earnings",
                "Launchpool Earnings Distribution",
                "Launchpool Interest",
                "Referral Kickback",
                "Commission History",
                "Commission Rebate",
                "Cash Voucher distribution",
                "Distribution",
                "Mission Reward Distribution",
                "Crypto Box",
                "Token Swap Restitution",
                "Alpha 2.0 Tokens Distribution",
                "Binance Convert Bonus",
                "Auto-Invest Transaction",
            ]),
            technical_ops: string_set(&[
                "Freeze",
                "Unfreeze",
                "Savings purchase",
                "Savings Principal redemption",
                "POS savings purchase",
                "POS savings redemption",
                "Simple Earn Flexible Subscription",
                "Simple Earn Flexible Redemption",
                "Simple Earn Locked Subscription",
                "Simple Earn Locked Redemption",
                "Liquid Swap Add",
                "Liquid Swap Remove",
                "Liquid Swap Rewards",
                "transfer_in",
                "transfer_out",
                "Main and Funding Account Transfer",
                "Fiat Deposit",
                "Deposit",
                "Withdraw",
                "Card Cashback",
                "NFT Transaction",
                "NFT Gas Fee",
                "Super BNB Mining",
                "Pool Distribution",
                "Dual Investment Subscribe",
                "Dual Investment Settlement",
                "Dual Investment Auto Compound",
            ]),
            fiat_deposit_ops: string_set(&["Deposit", "Fiat Deposit"]),
            fiat_withdrawal_ops: string_set(&["Withdraw", "Fiat Withdraw"]),
            dust_patterns: vec!["Small assets exchange".to_string()],
            fiat_currencies: string_set(&[
                "PLN", "EUR", "USD", "GBP", "CHF", "BIDR", "BRL", "AUD", "TRY", "RUB", "UAH",
                "NGN", "ZAR",
            ]),
            stablecoins: string_set(&[
                "USDT", "USDC", "FDUSD", "BUSD", "DAI", "TUSD", "USDP", "GUSD", "PYUSD",
            ]),
        }
    }
}
