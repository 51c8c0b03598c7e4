//! redb table definitions for the SignalGrid state store.
//!
//! Every table uses `&str` keys (the intersection id) and `&[u8]` values
//! (JSON-serialized domain types).

use redb::TableDefinition;

pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Validated intersection configs keyed by `{intersection_id}`.
pub const INTERSECTIONS: JsonTable = TableDefinition::new("intersections");

/// Current signal state keyed by `{intersection_id}`.
pub const SIGNALS: JsonTable = TableDefinition::new("signals");

/// Evaluation leases keyed by `{intersection_id}`.
pub const LEASES: JsonTable = TableDefinition::new("leases");
