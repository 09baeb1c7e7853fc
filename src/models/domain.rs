use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bounded business areas that synchronize independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusinessDomain {
    Customers,
    Catalog,
    Transactions,
    Inventory,
    Accounting,
    Analytics,
}

impl BusinessDomain {
    pub const ALL: [BusinessDomain; 6] = [
        BusinessDomain::Customers,
        BusinessDomain::Catalog,
        BusinessDomain::Transactions,
        BusinessDomain::Inventory,
        BusinessDomain::Accounting,
        BusinessDomain::Analytics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BusinessDomain::Customers => "customers",
            BusinessDomain::Catalog => "catalog",
            BusinessDomain::Transactions => "transactions",
            BusinessDomain::Inventory => "inventory",
            BusinessDomain::Accounting => "accounting",
            BusinessDomain::Analytics => "analytics",
        }
    }
}

impl fmt::Display for BusinessDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BusinessDomain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BusinessDomain::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == s.to_lowercase())
            .ok_or_else(|| {
                format!(
                    "Invalid domain '{}'. Valid options: customers, catalog, transactions, inventory, accounting, analytics",
                    s
                )
            })
    }
}

/// Named priority levels. Lower values synchronize first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPriority {
    Critical,
    High,
    Medium,
    Low,
    Background,
}

impl SyncPriority {
    pub fn value(&self) -> i32 {
        match self {
            SyncPriority::Critical => 1,
            SyncPriority::High => 2,
            SyncPriority::Medium => 3,
            SyncPriority::Low => 4,
            SyncPriority::Background => 5,
        }
    }
}

impl From<SyncPriority> for i32 {
    fn from(p: SyncPriority) -> Self {
        p.value()
    }
}

/// Static routing and display information for one domain sync service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainServiceDescriptor {
    pub domain: BusinessDomain,
    pub entities: Vec<String>,
    pub priority: i32,
    pub display_name: String,
    pub description: String,
}

impl DomainServiceDescriptor {
    pub fn new(
        domain: BusinessDomain,
        priority: impl Into<i32>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            domain,
            entities: Vec::new(),
            priority: priority.into(),
            display_name: display_name.into(),
            description: String::new(),
        }
    }

    pub fn with_entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities = entities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Stable key for checkpoints: `domain:entity+entity`.
    pub fn service_name(&self) -> String {
        format!("{}:{}", self.domain, self.entities.join("+"))
    }
}
