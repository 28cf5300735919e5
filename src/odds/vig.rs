//! Margin ("vig") removal for quoted decimal odds.
//!
//! All inputs are decimal odds (payout multiple, > 1). Anything the formulas
//! cannot handle comes back as a [`MathDomainError`] value; nothing here panics.

use rust_decimal::prelude::*;
use rust_decimal::MathematicalOps;
use thiserror::Error;

/// Newton iterations allowed before giving up on the multiway solve.
const MAX_NEWTON_ITERATIONS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MathDomainError {
    /// Degenerate input: odds ≤ 1, non-finite, empty, no margin in a two-way
    /// market, or a missing draw in a 3-way market.
    #[error("not applicable")]
    NotApplicable,
    #[error("did not converge")]
    NotConverged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VigMarket {
    /// home, draw, away
    MoneyLine,
    /// home, away
    Spread,
    /// over, under
    Total,
}

impl VigMarket {
    fn arity(self) -> usize {
        match self {
            VigMarket::MoneyLine => 3,
            VigMarket::Spread | VigMarket::Total => 2,
        }
    }
}

fn valid_odds(o: f64) -> bool {
    o.is_finite() && o > 1.0
}

fn round_to(v: f64, dp: i32) -> f64 {
    let scale = 10f64.powi(dp);
    (v * scale).round() / scale
}

/// Bookmaker margin `Σ(1/oᵢ) − 1`, rounded to 2 decimals. Diagnostic only.
pub fn get_sum_vig(market: VigMarket, odds: &[f64]) -> Result<f64, MathDomainError> {
    if odds.len() != market.arity() || !odds.iter().all(|o| valid_odds(*o)) {
        return Err(MathDomainError::NotApplicable);
    }
    let implied: f64 = odds.iter().map(|o| 1.0 / o).sum();
    Ok(round_to(implied - 1.0, 2))
}

/// Two-outcome fair odds. Output order matches input order.
pub fn calculate_vig_free_odds(odds_1: f64, odds_2: f64) -> Result<(f64, f64), MathDomainError> {
    if !valid_odds(odds_1) || !valid_odds(odds_2) {
        return Err(MathDomainError::NotApplicable);
    }

    let longshot = odds_1.max(odds_2);
    let favorite = odds_1.min(odds_2);
    let p = 1.0 / favorite;
    let q = 1.0 / longshot;

    // No margin to remove; the logs are zero or of opposite sign.
    if p + q <= 1.0 + 1e-12 {
        return Err(MathDomainError::NotApplicable);
    }

    let longshot_fair = ((1.0 - p) / q).ln() / ((1.0 - q) / p).ln() + 1.0;
    let favorite_fair = 1.0 / (1.0 - 1.0 / longshot_fair);
    if !valid_odds(longshot_fair) || !valid_odds(favorite_fair) {
        return Err(MathDomainError::NotApplicable);
    }

    let longshot_fair = round_to(longshot_fair, 3);
    let favorite_fair = round_to(favorite_fair, 3);
    if odds_1 > odds_2 {
        Ok((longshot_fair, favorite_fair))
    } else {
        Ok((favorite_fair, longshot_fair))
    }
}

/// N-outcome fair odds: solves `Σ(1/oᵢ)^c = 1` for `c` by Newton-Raphson and
/// returns `oᵢ^c` rounded to 3 decimals, in input order.
pub fn get_no_vig_odds_multiway(odds: &[f64]) -> Result<Vec<f64>, MathDomainError> {
    if odds.len() < 2 || !odds.iter().all(|o| valid_odds(*o)) {
        return Err(MathDomainError::NotApplicable);
    }

    let logs: Vec<Decimal> = odds
        .iter()
        .map(|o| Decimal::from_f64(*o).and_then(|d| d.checked_ln()))
        .collect::<Option<_>>()
        .ok_or(MathDomainError::NotApplicable)?;

    // 3-decimal accuracy target: |Σ − 1| < 0.5e-3
    let tolerance = Decimal::new(5, 4);
    let mut c = Decimal::ONE;

    for _ in 0..MAX_NEWTON_ITERATIONS {
        // (1/o)^c = e^(−c·ln o); f'(c) = Σ (1/o)^c · (−ln o)
        let mut sum = Decimal::ZERO;
        let mut slope = Decimal::ZERO;
        for &ln_o in &logs {
            let term = (-(c * ln_o))
                .checked_exp()
                .ok_or(MathDomainError::NotConverged)?;
            sum += term;
            slope -= term * ln_o;
        }

        let error = sum - Decimal::ONE;
        if error.abs() < tolerance {
            return logs
                .iter()
                .map(|&ln_o| {
                    (c * ln_o)
                        .checked_exp()
                        .map(|fair| fair.round_dp(3))
                        .and_then(|fair| fair.to_f64())
                        .ok_or(MathDomainError::NotConverged)
                })
                .collect();
        }
        if slope.is_zero() {
            return Err(MathDomainError::NotConverged);
        }
        c -= error / slope;
    }

    Err(MathDomainError::NotConverged)
}

/// Fair money line odds. With a draw slot the market is 3-way `[home, draw, away]`,
/// and an unpriced draw is `NotApplicable`; without one it is `[home, away]`.
pub fn no_vig_money_line(
    home: Option<f64>,
    draw: Option<f64>,
    away: Option<f64>,
    three_way: bool,
) -> Result<Vec<f64>, MathDomainError> {
    let (Some(home), Some(away)) = (home, away) else {
        return Err(MathDomainError::NotApplicable);
    };
    match (three_way, draw) {
        (true, Some(draw)) => get_no_vig_odds_multiway(&[home, draw, away]),
        (true, None) => Err(MathDomainError::NotApplicable),
        (false, _) => get_no_vig_odds_multiway(&[home, away]),
    }
}
