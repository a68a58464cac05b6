use std::fmt;

use serde::{Deserialize, Serialize};

/// A backend table a consumer watches, plus the column that scopes its rows
/// to an owner. Two specs with the same `table` share one change channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub table: String,
    pub owner_column: Option<String>,
}

impl CollectionSpec {
    pub fn new(table: impl Into<String>, owner_column: Option<&str>) -> Self {
        Self {
            table: table.into(),
            owner_column: owner_column.map(str::to_string),
        }
    }

    /// Every listed product, regardless of seller.
    pub fn products() -> Self {
        Self::new("products", None)
    }

    /// Products listed by one seller.
    pub fn seller_products() -> Self {
        Self::new("products", Some("seller_id"))
    }

    /// The owner's own profile row.
    pub fn profile() -> Self {
        Self::new("users", Some("id"))
    }

    pub fn favorites() -> Self {
        Self::new("favorites", Some("user_id"))
    }

    pub fn schedules() -> Self {
        Self::new("schedules", Some("user_id"))
    }

    pub fn balances() -> Self {
        Self::new("balances", Some("user_id"))
    }

    pub fn orders() -> Self {
        Self::new("orders", Some("buyer_id"))
    }
}

impl fmt::Display for CollectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.owner_column {
            Some(column) => write!(f, "{}[{}]", self.table, column),
            None => f.write_str(&self.table),
        }
    }
}
