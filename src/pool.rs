use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::Deserialize;

use crate::grid::{GridLayout, SlotGrid};
use crate::limits::*;
use crate::model::{PoolId, ResourceId};

#[derive(Debug)]
pub enum ConfigError {
    UnknownResource(String),
    UnknownPool(String),
    DuplicateResource(String),
    DuplicatePool(String),
    ZeroCapacity(String),
    EmptyPool(String),
    InvalidId(String),
    LimitExceeded(&'static str),
    InvalidSlot(String),
    Json(String),
    Io(std::io::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::UnknownResource(id) => write!(f, "unknown resource: {id}"),
            ConfigError::UnknownPool(id) => write!(f, "unknown pool: {id}"),
            ConfigError::DuplicateResource(id) => {
                write!(f, "resource {id} is a member of more than one pool")
            }
            ConfigError::DuplicatePool(id) => write!(f, "pool {id} defined twice"),
            ConfigError::ZeroCapacity(id) => write!(f, "pool {id} has zero capacity"),
            ConfigError::EmptyPool(id) => write!(f, "pool {id} has no member resources"),
            ConfigError::InvalidId(id) => write!(f, "invalid id: {id:?}"),
            ConfigError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            ConfigError::InvalidSlot(msg) => write!(f, "invalid slot: {msg}"),
            ConfigError::Json(e) => write!(f, "pool config: {e}"),
            ConfigError::Io(e) => write!(f, "pool config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

/// A claimable unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub id: ResourceId,
    pub pool_id: PoolId,
    /// `None` when capacity is governed purely at the pool level.
    pub capacity: Option<u32>,
}

/// A shared capacity budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    pub id: PoolId,
    pub capacity: u32,
    pub members: BTreeSet<ResourceId>,
}

/// Immutable resource → pool topology. Built once at startup and shared by reference.
#[derive(Debug, Clone, Default)]
pub struct PoolModel {
    pools: BTreeMap<PoolId, Pool>,
    resources: HashMap<ResourceId, Resource>,
    grids: Vec<SlotGrid>,
}

impl PoolModel {
    pub fn builder() -> PoolModelBuilder {
        PoolModelBuilder::default()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: PoolConfig =
            serde_json::from_str(raw).map_err(|e| ConfigError::Json(e.to_string()))?;
        config.build()
    }

    pub fn pool_of(&self, resource_id: &str) -> Result<&PoolId, ConfigError> {
        self.resources
            .get(resource_id)
            .map(|r| &r.pool_id)
            .ok_or_else(|| ConfigError::UnknownResource(resource_id.to_string()))
    }

    pub fn resource(&self, resource_id: &str) -> Result<&Resource, ConfigError> {
        self.resources
            .get(resource_id)
            .ok_or_else(|| ConfigError::UnknownResource(resource_id.to_string()))
    }

    pub fn pool(&self, pool_id: &str) -> Result<&Pool, ConfigError> {
        self.pools
            .get(pool_id)
            .ok_or_else(|| ConfigError::UnknownPool(pool_id.to_string()))
    }

    pub fn capacity_of(&self, pool_id: &str) -> Result<u32, ConfigError> {
        self.pool(pool_id).map(|p| p.capacity)
    }

    pub fn members_of(&self, pool_id: &str) -> Result<&BTreeSet<ResourceId>, ConfigError> {
        self.pool(pool_id).map(|p| &p.members)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.values()
    }

    pub fn pool_ids(&self) -> impl Iterator<Item = &PoolId> {
        self.pools.keys()
    }

    pub fn grid(&self, name: &str) -> Option<&SlotGrid> {
        self.grids.iter().find(|g| g.name() == name)
    }

    pub fn grids(&self) -> &[SlotGrid] {
        &self.grids
    }
}

fn validate_id(id: &str) -> Result<(), ConfigError> {
    if id.is_empty() || id.len() > MAX_ID_LEN || id.chars().any(char::is_control) {
        return Err(ConfigError::InvalidId(id.to_string()));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct PoolModelBuilder {
    model: PoolModel,
    errors: Vec<ConfigError>,
}

impl PoolModelBuilder {
    /// Shared pool spanning `members`. Each member is `(resource_id, per_resource_capacity)`.
    pub fn pool<I, S>(mut self, id: &str, capacity: u32, members: I) -> Self
    where
        I: IntoIterator<Item = (S, Option<u32>)>,
        S: Into<ResourceId>,
    {
        if let Err(e) = self.add_pool(id, capacity, members) {
            self.errors.push(e);
        }
        self
    }

    /// Resource with its own capacity and no sharing; its pool id is its own id.
    pub fn independent(self, id: &str, capacity: u32) -> Self {
        self.pool(id, capacity, [(id, None)])
    }

    pub fn grid(mut self, grid: SlotGrid, layout: GridLayout, capacity: Option<u32>) -> Self {
        for (pool_id, pool_capacity, members) in grid.pool_layout(layout, capacity) {
            let members = members.into_iter().map(|id| (id, Some(1)));
            if let Err(e) = self.add_pool(&pool_id, pool_capacity, members) {
                self.errors.push(e);
            }
        }
        self.model.grids.push(grid);
        self
    }

    fn add_pool<I, S>(&mut self, id: &str, capacity: u32, members: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (S, Option<u32>)>,
        S: Into<ResourceId>,
    {
        validate_id(id)?;
        if self.model.pools.contains_key(id) {
            return Err(ConfigError::DuplicatePool(id.to_string()));
        }
        if self.model.pools.len() >= MAX_POOLS {
            return Err(ConfigError::LimitExceeded("too many pools"));
        }
        if capacity == 0 {
            return Err(ConfigError::ZeroCapacity(id.to_string()));
        }
        if capacity > MAX_POOL_CAPACITY {
            return Err(ConfigError::LimitExceeded("pool capacity too large"));
        }

        let mut pool = Pool {
            id: id.to_string(),
            capacity,
            members: BTreeSet::new(),
        };
        let mut resources = Vec::new();
        for (rid, per_resource) in members {
            let rid: ResourceId = rid.into();
            validate_id(&rid)?;
            if per_resource == Some(0) {
                return Err(ConfigError::ZeroCapacity(rid));
            }
            if self.model.resources.contains_key(&rid) || !pool.members.insert(rid.clone()) {
                return Err(ConfigError::DuplicateResource(rid));
            }
            resources.push(Resource {
                id: rid,
                pool_id: pool.id.clone(),
                capacity: per_resource,
            });
        }
        if pool.members.is_empty() {
            return Err(ConfigError::EmptyPool(pool.id));
        }
        if pool.members.len() > MAX_RESOURCES_PER_POOL {
            return Err(ConfigError::LimitExceeded("too many resources in pool"));
        }

        for r in resources {
            self.model.resources.insert(r.id.clone(), r);
        }
        self.model.pools.insert(pool.id.clone(), pool);
        Ok(())
    }

    /// Fails with the first error encountered while adding pools.
    pub fn build(mut self) -> Result<PoolModel, ConfigError> {
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }
        Ok(self.model)
    }
}

// ── JSON config ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub pools: Vec<PoolSpec>,
    #[serde(default)]
    pub independent: Vec<IndependentSpec>,
    #[serde(default)]
    pub grids: Vec<GridSpec>,
}

#[derive(Debug, Deserialize)]
pub struct PoolSpec {
    pub id: String,
    pub capacity: u32,
    pub resources: Vec<ResourceSpec>,
}

#[derive(Debug, Deserialize)]
pub struct ResourceSpec {
    pub id: String,
    #[serde(default)]
    pub capacity: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct IndependentSpec {
    pub id: String,
    pub capacity: u32,
}

#[derive(Debug, Deserialize)]
pub struct GridSpec {
    pub name: String,
    pub rooms: Vec<String>,
    pub times: Vec<String>,
    #[serde(default)]
    pub layout: GridLayout,
    #[serde(default)]
    pub capacity: Option<u32>,
}

impl PoolConfig {
    pub fn build(self) -> Result<PoolModel, ConfigError> {
        let mut builder = PoolModel::builder();
        for p in self.pools {
            let members = p.resources.into_iter().map(|r| (r.id, r.capacity));
            builder = builder.pool(&p.id, p.capacity, members);
        }
        for r in self.independent {
            builder = builder.independent(&r.id, r.capacity);
        }
        for g in self.grids {
            let grid = SlotGrid::new(g.name, g.rooms, g.times)?;
            builder = builder.grid(grid, g.layout, g.capacity);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debate_model() -> PoolModel {
        PoolModel::builder()
            .pool("case_1", 32, [("case1", None)])
            .pool("case_23", 41, [("case2", None), ("case3", None)])
            .pool("case_45", 42, [("case4", None), ("case5", None)])
            .build()
            .unwrap()
    }

    #[test]
    fn lookups() {
        let model = debate_model();
        assert_eq!(model.pool_of("case3").unwrap(), "case_23");
        assert_eq!(model.capacity_of("case_45").unwrap(), 42);
        let members: Vec<_> = model.members_of("case_23").unwrap().iter().cloned().collect();
        assert_eq!(members, vec!["case2".to_string(), "case3".to_string()]);
    }

    #[test]
    fn unknown_resource_is_config_error() {
        let model = debate_model();
        assert!(matches!(model.pool_of("case9"), Err(ConfigError::UnknownResource(_))));
        assert!(matches!(model.capacity_of("nope"), Err(ConfigError::UnknownPool(_))));
    }

    #[test]
    fn resource_in_two_pools_rejected() {
        let result = PoolModel::builder()
            .pool("a", 1, [("r", None)])
            .pool("b", 1, [("r", None)])
            .build();
        assert!(matches!(result, Err(ConfigError::DuplicateResource(_))));
    }

    #[test]
    fn zero_capacity_rejected() {
        let result = PoolModel::builder().independent("talk", 0).build();
        assert!(matches!(result, Err(ConfigError::ZeroCapacity(_))));
        let result = PoolModel::builder().pool("p", 3, [("r", Some(0))]).build();
        assert!(matches!(result, Err(ConfigError::ZeroCapacity(_))));
    }

    #[test]
    fn empty_pool_rejected() {
        let result = PoolModel::builder()
            .pool("p", 3, Vec::<(String, Option<u32>)>::new())
            .build();
        assert!(matches!(result, Err(ConfigError::EmptyPool(_))));
    }

    #[test]
    fn independent_pool_uses_resource_id() {
        let model = PoolModel::builder().independent("talk_a", 50).build().unwrap();
        assert_eq!(model.pool_of("talk_a").unwrap(), "talk_a");
        assert_eq!(model.capacity_of("talk_a").unwrap(), 50);
    }

    #[test]
    fn from_json_with_grid() {
        let raw = r#"{
            "pools": [{"id": "case_23", "capacity": 41, "resources": [{"id": "case2"}, {"id": "case3"}]}],
            "independent": [{"id": "case1", "capacity": 32}],
            "grids": [{"name": "vr_day1", "rooms": ["vr1", "vr2"], "times": ["10:00", "10:30", "11:00"]}]
        }"#;
        let model = PoolModel::from_json(raw).unwrap();
        assert_eq!(model.capacity_of("case1").unwrap(), 32);
        assert_eq!(model.capacity_of("vr_day1").unwrap(), 6);
        let grid = model.grid("vr_day1").unwrap();
        let slot = grid.slot_resource_id("vr2", "10:30").unwrap();
        assert_eq!(model.pool_of(&slot).unwrap(), "vr_day1");
        assert_eq!(model.resource(&slot).unwrap().capacity, Some(1));
    }

    #[test]
    fn from_json_per_room_grid() {
        let raw = r#"{
            "grids": [{"name": "vr_day2", "rooms": ["vr1", "vr2"], "times": ["10:00", "10:30"], "layout": "per_room"}]
        }"#;
        let model = PoolModel::from_json(raw).unwrap();
        assert_eq!(model.capacity_of("vr_day2/vr1").unwrap(), 2);
        assert_eq!(model.members_of("vr_day2/vr2").unwrap().len(), 2);
    }

    #[test]
    fn malformed_json() {
        assert!(matches!(PoolModel::from_json("{"), Err(ConfigError::Json(_))));
    }
}
