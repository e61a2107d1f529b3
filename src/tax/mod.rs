pub mod pit38;

pub use pit38::{round_to_whole_pln, summarize, TaxSummary};
