pub mod vig;

pub use vig::{calculate_vig_free_odds, get_sum_vig, no_vig_money_line, VigMarket};
