//! Streaming Domain Types
//!
//! Core domain types for the two streamed key spaces: depth books keyed by
//! symbol and open positions keyed by trading account. These types are
//! transport-agnostic and represent the canonical internal representation
//! of upstream snapshots and of the delta events derived from them.
//!
//! # Ordering
//!
//! Book snapshots are always held sorted: bids by price descending, then asks
//! by price ascending. Position snapshots are sorted by position id. Depth
//! capping is applied only when a snapshot is handed out, never to the data
//! the diff engine compares.

use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

// =============================================================================
// Keys
// =============================================================================

/// Identifier a subscription, poller, cache entry and topic are keyed on.
///
/// Each key space has its own registry, so keys of different kinds are never
/// compared with each other.
pub trait StreamKey:
    Clone + Eq + Hash + fmt::Debug + fmt::Display + Serialize + Send + Sync + 'static
{
    /// Parse a key from its textual form (e.g. a URL path segment).
    ///
    /// Returns `None` if the text cannot represent a key of this kind.
    fn parse_key(raw: &str) -> Option<Self>;

    /// Whether the key may be subscribed or queried.
    fn is_valid(&self) -> bool;
}

/// A trading symbol (book key space).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Create a symbol, trimming surrounding whitespace.
    #[must_use]
    pub fn new(symbol: impl Into<String>) -> Self {
        let symbol = symbol.into();
        Self(symbol.trim().to_string())
    }

    /// Get the symbol text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StreamKey for Symbol {
    fn parse_key(raw: &str) -> Option<Self> {
        Some(Self::new(raw))
    }

    fn is_valid(&self) -> bool {
        !self.0.is_empty()
    }
}

/// A trading account login (position key space).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AccountId(u64);

impl AccountId {
    /// Create an account id.
    #[must_use]
    pub const fn new(login: u64) -> Self {
        Self(login)
    }

    /// Get the numeric login.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl StreamKey for AccountId {
    fn parse_key(raw: &str) -> Option<Self> {
        raw.trim().parse().ok().map(Self)
    }

    fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

// =============================================================================
// Records
// =============================================================================

/// A single element of a snapshot that the diff engine can track.
pub trait StreamRecord:
    Clone + fmt::Debug + PartialEq + Serialize + Send + Sync + 'static
{
    /// Identity used to match records across two snapshots.
    type Identity: Clone + Eq + Hash + fmt::Debug + Send + Sync;

    /// Stream kind label used in logs and metrics.
    const KIND: &'static str;

    /// Identity of this record.
    fn identity(&self) -> Self::Identity;

    /// Whether any observable field differs from `other` (same identity).
    fn differs_from(&self, other: &Self) -> bool;

    /// Put records into canonical snapshot order.
    fn normalize(records: &mut [Self]);

    /// Records a caller sees when asking for at most `depth` entries.
    ///
    /// The default is uncapped.
    fn cap_depth(records: &[Self], depth: Option<usize>) -> Vec<Self> {
        let _ = depth;
        records.to_vec()
    }
}

/// Side of a depth book level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    /// Bid (buy) side.
    Bid,
    /// Ask (sell) side.
    Ask,
}

impl BookSide {
    /// Get the side name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bid => "bid",
            Self::Ask => "ask",
        }
    }
}

/// One price level of a depth book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    /// Book side.
    pub side: BookSide,
    /// Level price, compared by exact decimal value.
    pub price: Decimal,
    /// Aggregated volume at this level.
    pub volume: i64,
}

impl BookLevel {
    /// Create a bid level.
    #[must_use]
    pub const fn bid(price: Decimal, volume: i64) -> Self {
        Self {
            side: BookSide::Bid,
            price,
            volume,
        }
    }

    /// Create an ask level.
    #[must_use]
    pub const fn ask(price: Decimal, volume: i64) -> Self {
        Self {
            side: BookSide::Ask,
            price,
            volume,
        }
    }
}

impl StreamRecord for BookLevel {
    type Identity = (BookSide, Decimal);

    const KIND: &'static str = "book";

    fn identity(&self) -> Self::Identity {
        (self.side, self.price)
    }

    fn differs_from(&self, other: &Self) -> bool {
        self.volume != other.volume
    }

    fn normalize(records: &mut [Self]) {
        records.sort_by(|a, b| match (a.side, b.side) {
            (BookSide::Bid, BookSide::Bid) => b.price.cmp(&a.price),
            (BookSide::Ask, BookSide::Ask) => a.price.cmp(&b.price),
            (left, right) => left.cmp(&right),
        });
    }

    fn cap_depth(records: &[Self], depth: Option<usize>) -> Vec<Self> {
        let mut levels = records.to_vec();
        Self::normalize(&mut levels);

        let Some(depth) = depth else {
            return levels;
        };

        let (mut bids, mut asks) = (0usize, 0usize);
        levels.retain(|level| {
            let count = match level.side {
                BookSide::Bid => &mut bids,
                BookSide::Ask => &mut asks,
            };
            *count += 1;
            *count <= depth
        });
        levels
    }
}

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionType {
    /// Long position.
    Buy,
    /// Short position.
    Sell,
}

/// One open trading position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Position ticket.
    pub position_id: u64,
    /// Traded symbol.
    pub symbol: String,
    /// Long or short.
    pub position_type: PositionType,
    /// Volume in lots.
    pub volume: Decimal,
    /// Open price.
    pub price_open: Decimal,
    /// Current market price.
    pub price_current: Decimal,
    /// Floating profit.
    pub profit: Decimal,
    /// Accumulated swap.
    pub swap: Decimal,
    /// Stop loss level (zero when unset).
    pub stop_loss: Decimal,
    /// Take profit level (zero when unset).
    pub take_profit: Decimal,
    /// Expert advisor magic number.
    pub magic: i64,
    /// Free-form comment.
    pub comment: String,
    /// Time the position was opened.
    pub opened_at: DateTime<Utc>,
}

impl StreamRecord for Position {
    type Identity = u64;

    const KIND: &'static str = "positions";

    fn identity(&self) -> Self::Identity {
        self.position_id
    }

    fn differs_from(&self, other: &Self) -> bool {
        self.volume != other.volume
            || self.price_open != other.price_open
            || self.price_current != other.price_current
            || self.profit != other.profit
            || self.swap != other.swap
            || self.stop_loss != other.stop_loss
            || self.take_profit != other.take_profit
    }

    fn normalize(records: &mut [Self]) {
        records.sort_by_key(|position| position.position_id);
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Full state of one key at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<K, R> {
    /// Key this snapshot belongs to.
    pub key: K,
    /// Records in canonical order.
    pub records: Vec<R>,
    /// Time the upstream produced the snapshot.
    pub source_time: DateTime<Utc>,
}

impl<K: StreamKey, R: StreamRecord> Snapshot<K, R> {
    /// Create a snapshot, putting the records into canonical order.
    #[must_use]
    pub fn new(key: K, mut records: Vec<R>, source_time: DateTime<Utc>) -> Self {
        R::normalize(&mut records);
        Self {
            key,
            records,
            source_time,
        }
    }

    /// Copy of this snapshot capped to `depth` entries (per side for books).
    #[must_use]
    pub fn capped(&self, depth: Option<usize>) -> Self {
        Self {
            key: self.key.clone(),
            records: R::cap_depth(&self.records, depth),
            source_time: self.source_time,
        }
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the snapshot holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<K> Snapshot<K, BookLevel> {
    /// Bid levels, best first.
    pub fn bids(&self) -> impl Iterator<Item = &BookLevel> {
        self.records.iter().filter(|l| l.side == BookSide::Bid)
    }

    /// Ask levels, best first.
    pub fn asks(&self) -> impl Iterator<Item = &BookLevel> {
        self.records.iter().filter(|l| l.side == BookSide::Ask)
    }
}

/// Depth book snapshot.
pub type BookSnapshot = Snapshot<Symbol, BookLevel>;

/// Account positions snapshot.
pub type PositionSnapshot = Snapshot<AccountId, Position>;

// =============================================================================
// Delta Events
// =============================================================================

/// Kind of a delta event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaKind {
    /// Full state.
    Snapshot,
    /// New record.
    Add,
    /// Changed record.
    Update,
    /// Removed record.
    Delete,
    /// Upstream lost: discard local state.
    Clean,
    /// Upstream back: await a fresh snapshot.
    Sync,
}

impl DeltaKind {
    /// Get the kind name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Clean => "clean",
            Self::Sync => "sync",
        }
    }
}

/// Payload of a delta event.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaPayload<R> {
    /// Full (depth-capped) state.
    Snapshot(Vec<R>),
    /// Record present only in the new state.
    Add(R),
    /// Record whose observable fields changed; carries the new value.
    Update(R),
    /// Record present only in the old state; carries the last seen value.
    Delete(R),
    /// Discard local state.
    Clean,
    /// Await a fresh snapshot.
    Sync,
}

impl<R> DeltaPayload<R> {
    /// Kind of this payload.
    #[must_use]
    pub const fn kind(&self) -> DeltaKind {
        match self {
            Self::Snapshot(_) => DeltaKind::Snapshot,
            Self::Add(_) => DeltaKind::Add,
            Self::Update(_) => DeltaKind::Update,
            Self::Delete(_) => DeltaKind::Delete,
            Self::Clean => DeltaKind::Clean,
            Self::Sync => DeltaKind::Sync,
        }
    }
}

/// One typed change notification for a key.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaEvent<K, R> {
    /// Key the event belongs to.
    pub key: K,
    /// What changed.
    pub payload: DeltaPayload<R>,
    /// Server timestamp of the state the event describes.
    pub server_time: DateTime<Utc>,
}

impl<K, R> DeltaEvent<K, R> {
    /// Create an event.
    #[must_use]
    pub const fn new(key: K, payload: DeltaPayload<R>, server_time: DateTime<Utc>) -> Self {
        Self {
            key,
            payload,
            server_time,
        }
    }

    /// Resync signal: discard local state.
    #[must_use]
    pub fn clean(key: K) -> Self {
        Self::new(key, DeltaPayload::Clean, Utc::now())
    }

    /// Resync signal: await a fresh snapshot.
    #[must_use]
    pub fn sync(key: K) -> Self {
        Self::new(key, DeltaPayload::Sync, Utc::now())
    }

    /// Kind of this event.
    #[must_use]
    pub const fn kind(&self) -> DeltaKind {
        self.payload.kind()
    }
}

impl<K: Serialize, R: Serialize> Serialize for DeltaEvent<K, R> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("DeltaEvent", 4)?;
        state.serialize_field("type", &self.kind())?;
        state.serialize_field("key", &self.key)?;
        match &self.payload {
            DeltaPayload::Snapshot(records) => state.serialize_field("payload", records)?,
            DeltaPayload::Add(record)
            | DeltaPayload::Update(record)
            | DeltaPayload::Delete(record) => state.serialize_field("payload", record)?,
            DeltaPayload::Clean | DeltaPayload::Sync => {
                state.serialize_field("payload", &Option::<()>::None)?;
            }
        }
        state.serialize_field("server_time", &self.server_time)?;
        state.end()
    }
}

/// Book delta event.
pub type BookEvent = DeltaEvent<Symbol, BookLevel>;

/// Position delta event.
pub type PositionEvent = DeltaEvent<AccountId, Position>;

// =============================================================================
// Tests
// =============================================================================
