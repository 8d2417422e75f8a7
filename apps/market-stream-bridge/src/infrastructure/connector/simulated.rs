//! Simulated upstream for local development.
//!
//! Prices are derived from the wall-clock second and a hash of the key, so
//! every process sees the same book at the same time. Volumes are random.
//! Only built when `BRIDGE_CONNECTOR=simulated` is set.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use rust_decimal::Decimal;

use crate::application::ports::{ConnectorError, SnapshotConnector};
use crate::domain::streaming::{
    AccountId, BookLevel, Position, PositionType, Snapshot, Symbol,
};

/// Levels generated per book side.
const LEVELS_PER_SIDE: i64 = 10;

/// Positions generated per account.
const POSITIONS_PER_ACCOUNT: u64 = 3;

const POSITION_SYMBOLS: [&str; 3] = ["EURUSD", "GBPUSD", "USDJPY"];

/// Connector producing synthetic books and positions.
#[derive(Debug, Default)]
pub struct SimulatedConnector;

impl SimulatedConnector {
    /// Create the connector.
    #[must_use]
    pub fn new() -> Self {
        tracing::warn!("Using simulated upstream, all market data is synthetic");
        Self
    }
}

fn seed(key: &impl Hash) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Mid price in ticks of 0.0001, moving once per second.
fn mid_ticks(seed: u64, second: i64) -> i64 {
    let base = 10_000 + i64::try_from(seed % 5_000).unwrap_or(0);
    base + (second + i64::try_from(seed % 60).unwrap_or(0)).rem_euclid(60) - 30
}

fn tick_price(ticks: i64) -> Decimal {
    Decimal::new(ticks, 4)
}

fn simulated_book(symbol: &Symbol, depth: Option<usize>, now: DateTime<Utc>) -> Vec<BookLevel> {
    let mut rng = rand::rng();
    let mid = mid_ticks(seed(symbol), now.timestamp());
    let levels = depth
        .and_then(|d| i64::try_from(d).ok())
        .map_or(LEVELS_PER_SIDE, |d| d.min(LEVELS_PER_SIDE));

    (1..=levels)
        .flat_map(|i| {
            [
                BookLevel::bid(tick_price(mid - i), rng.random_range(1..=100)),
                BookLevel::ask(tick_price(mid + i), rng.random_range(1..=100)),
            ]
        })
        .collect()
}

fn simulated_positions(account: AccountId, now: DateTime<Utc>) -> Vec<Position> {
    let opened_at = Utc
        .timestamp_opt(now.timestamp() - now.timestamp().rem_euclid(86_400), 0)
        .single()
        .unwrap_or(now);

    (0..POSITIONS_PER_ACCOUNT)
        .map(|i| {
            let symbol = POSITION_SYMBOLS[usize::try_from(i).unwrap_or(0) % POSITION_SYMBOLS.len()];
            let key_seed = seed(&(account.get(), symbol));
            let open = mid_ticks(key_seed, opened_at.timestamp());
            let current = mid_ticks(key_seed, now.timestamp());
            let position_type = if i % 2 == 0 {
                PositionType::Buy
            } else {
                PositionType::Sell
            };
            let volume = Decimal::new(10, 2);
            let move_ticks = match position_type {
                PositionType::Buy => current - open,
                PositionType::Sell => open - current,
            };

            Position {
                position_id: account.get() * 100 + i + 1,
                symbol: symbol.to_string(),
                position_type,
                volume,
                price_open: tick_price(open),
                price_current: tick_price(current),
                profit: Decimal::new(move_ticks, 0),
                swap: Decimal::ZERO,
                stop_loss: Decimal::ZERO,
                take_profit: Decimal::ZERO,
                magic: 0,
                comment: "simulated".to_string(),
                opened_at,
            }
        })
        .collect()
}

#[async_trait]
impl SnapshotConnector<Symbol, BookLevel> for SimulatedConnector {
    async fn is_connected(&self) -> bool {
        true
    }

    async fn fetch_snapshot(
        &self,
        key: &Symbol,
        depth: Option<usize>,
    ) -> Result<Snapshot<Symbol, BookLevel>, ConnectorError> {
        let now = Utc::now();
        Ok(Snapshot::new(key.clone(), simulated_book(key, depth, now), now))
    }
}

#[async_trait]
impl SnapshotConnector<AccountId, Position> for SimulatedConnector {
    async fn is_connected(&self) -> bool {
        true
    }

    async fn fetch_snapshot(
        &self,
        key: &AccountId,
        _depth: Option<usize>,
    ) -> Result<Snapshot<AccountId, Position>, ConnectorError> {
        let now = Utc::now();
        Ok(Snapshot::new(*key, simulated_positions(*key, now), now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(second: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_767_600_000 + second, 0).unwrap()
    }

    #[test]
    fn book_prices_are_deterministic_per_second() {
        let symbol = Symbol::new("EURUSD");

        let first: Vec<_> = simulated_book(&symbol, None, at(0)).iter().map(|l| l.price).collect();
        let second: Vec<_> = simulated_book(&symbol, None, at(0)).iter().map(|l| l.price).collect();

        assert_eq!(first, second);
        assert_eq!(first.len(), 20);
    }

    #[test]
    fn book_is_not_crossed() {
        let snapshot = Snapshot::new(
            Symbol::new("GBPUSD"),
            simulated_book(&Symbol::new("GBPUSD"), Some(3), at(7)),
            at(7),
        );

        let best_bid = snapshot.bids().next().unwrap().price;
        let best_ask = snapshot.asks().next().unwrap().price;
        assert!(best_bid < best_ask);
        assert_eq!(snapshot.len(), 6);
    }

    #[test]
    fn positions_are_stable_per_account() {
        let account = AccountId::new(12345);

        let positions = simulated_positions(account, at(30));

        assert_eq!(positions.len(), 3);
        assert_eq!(positions[0].position_id, 1_234_501);
        assert!(positions.iter().all(|p| p.opened_at <= at(30)));
        assert_eq!(positions, simulated_positions(account, at(30)));
    }

    #[tokio::test]
    async fn connector_serves_both_key_spaces() {
        let connector = SimulatedConnector::new();

        let book = SnapshotConnector::<Symbol, BookLevel>::fetch_snapshot(
            &connector,
            &Symbol::new("EURUSD"),
            Some(2),
        )
        .await
        .unwrap();
        let positions = SnapshotConnector::<AccountId, Position>::fetch_snapshot(
            &connector,
            &AccountId::new(7),
            None,
        )
        .await
        .unwrap();

        assert_eq!(book.len(), 4);
        assert_eq!(positions.key, AccountId::new(7));
    }
}
