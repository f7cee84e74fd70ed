use async_trait::async_trait;
use routing_api::{Result, RoutingError};
use routing_db::Database;

/// One versioned, idempotent change to the stored data or schema
#[async_trait]
pub trait Migration: Send + Sync {
    fn version(&self) -> u32;

    fn name(&self) -> &'static str;

    /// Apply the change. Running it twice must leave the backend as running it once.
    async fn run(&self, db: &dyn Database) -> Result<()>;
}

/// Migration units ordered by ascending version
pub struct MigrationRegistry {
    units: Vec<Box<dyn Migration>>,
}

impl MigrationRegistry {
    /// Build a registry. Versions need not be contiguous but must be unique.
    pub fn new(mut units: Vec<Box<dyn Migration>>) -> Result<Self> {
        units.sort_by_key(|unit| unit.version());
        if let Some(pair) = units.windows(2).find(|pair| pair[0].version() == pair[1].version()) {
            return Err(RoutingError::Internal(format!(
                "duplicate migration version {} ({} and {})",
                pair[0].version(),
                pair[0].name(),
                pair[1].name()
            )));
        }
        Ok(Self { units })
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn versions(&self) -> Vec<u32> {
        self.units.iter().map(|unit| unit.version()).collect()
    }

    pub fn max_version(&self) -> Option<u32> {
        self.units.last().map(|unit| unit.version())
    }

    /// Whether a backend at `marker` has nothing left to apply
    pub fn is_satisfied_by(&self, marker: Option<u32>) -> bool {
        match (self.max_version(), marker) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(max), Some(marker)) => marker >= max,
        }
    }

    /// Units above `marker`, ascending. An absent marker sits below every version.
    pub fn pending(&self, marker: Option<u32>) -> impl Iterator<Item = &dyn Migration> {
        self.units
            .iter()
            .map(|unit| unit.as_ref())
            .filter(move |unit| marker.map_or(true, |marker| unit.version() > marker))
    }
}
