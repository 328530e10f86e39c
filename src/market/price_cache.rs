use crate::market::types::{Pair, PriceQuote};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum QuoteApplyOutcome {
    Inserted,
    Updated,
    Stale { current: i64, cached: i64 },
}

/// Last quote per pair plus the pivot/fiat routing needed for cross rates.
#[derive(Debug, Clone)]
pub struct PriceCache {
    pivot: String,
    fiat: String,
    quotes: HashMap<Pair, PriceQuote>,
}

impl PriceCache {
    pub fn new(pivot: &str, fiat: &str) -> Self {
        Self {
            pivot: pivot.to_ascii_uppercase(),
            fiat: fiat.to_ascii_uppercase(),
            quotes: HashMap::new(),
        }
    }

    pub fn pivot(&self) -> &str {
        &self.pivot
    }

    pub fn fiat(&self) -> &str {
        &self.fiat
    }

    pub fn pivot_pair(&self) -> Pair {
        Pair::new(&self.pivot, &self.fiat)
    }

    /// Re-points the cache at a new pivot. Existing quotes are routed through
    /// the old pivot and are dropped.
    pub fn set_pivot(&mut self, pivot: &str) {
        let pivot = pivot.to_ascii_uppercase();
        if pivot != self.pivot {
            self.pivot = pivot;
            self.quotes.clear();
        }
    }

    pub fn get(&self, pair: &Pair) -> Option<&PriceQuote> {
        self.quotes.get(pair)
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    pub fn apply(&mut self, quote: PriceQuote) -> QuoteApplyOutcome {
        match self.quotes.get_mut(&quote.pair) {
            Some(cached) if quote.received_at_ms < cached.received_at_ms => {
                debug!(
                    pair = %quote.pair,
                    received_at_ms = quote.received_at_ms,
                    cached_at_ms = cached.received_at_ms,
                    "discarding out-of-order quote"
                );
                QuoteApplyOutcome::Stale {
                    current: quote.received_at_ms,
                    cached: cached.received_at_ms,
                }
            }
            Some(cached) => {
                *cached = quote;
                QuoteApplyOutcome::Updated
            }
            None => {
                self.quotes.insert(quote.pair.clone(), quote);
                QuoteApplyOutcome::Inserted
            }
        }
    }

    pub fn retain_pairs<F>(&mut self, mut keep: F)
    where
        F: FnMut(&Pair) -> bool,
    {
        self.quotes.retain(|pair, _| keep(pair));
    }

    pub fn clear(&mut self) {
        self.quotes.clear();
    }

    /// Price of one unit of `symbol` expressed in the pivot.
    pub fn rate_to_pivot(&self, symbol: &str) -> Option<Decimal> {
        if symbol == self.pivot {
            return Some(Decimal::ONE);
        }
        if symbol == self.fiat {
            let pivot_rate = self.pivot_fiat_rate()?;
            return Decimal::ONE.checked_div(pivot_rate);
        }
        self.quotes
            .get(&Pair::new(symbol, &self.pivot))
            .map(|quote| quote.last_price)
    }

    /// Price of one pivot unit expressed in the display fiat.
    pub fn pivot_fiat_rate(&self) -> Option<Decimal> {
        self.quotes
            .get(&self.pivot_pair())
            .map(|quote| quote.last_price)
            .filter(|rate| !rate.is_zero())
    }

    /// Converts through the pivot and rounds toward zero so a displayed amount
    /// never exceeds the real one. `None` when a required quote is missing.
    pub fn convert(
        &self,
        amount: Decimal,
        from: &str,
        to: &str,
        target_precision: u32,
    ) -> Option<Decimal> {
        if from == to {
            return Some(round_down(amount, target_precision));
        }

        let amount_in_pivot = amount.checked_mul(self.rate_to_pivot(from)?)?;
        let result = if to == self.fiat {
            amount_in_pivot.checked_mul(self.pivot_fiat_rate()?)?
        } else if to == self.pivot {
            amount_in_pivot
        } else {
            let target_rate = self.rate_to_pivot(to).filter(|rate| !rate.is_zero())?;
            amount_in_pivot.checked_div(target_rate)?
        };

        Some(round_down(result, target_precision))
    }

    /// The pivot reports the pivot/fiat pair's change; everything else its own
    /// change against the pivot.
    pub fn percent_change(&self, symbol: &str) -> Option<Decimal> {
        let pair = if symbol == self.pivot {
            self.pivot_pair()
        } else {
            Pair::new(symbol, &self.pivot)
        };
        self.quotes
            .get(&pair)
            .map(|quote| quote.percent_change_24h)
    }
}

pub fn round_down(amount: Decimal, precision: u32) -> Decimal {
    amount.round_dp_with_strategy(precision, RoundingStrategy::ToZero)
}
