use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;

use crate::admission::{AdmissionController, AdmissionError};
use crate::cache::CounterStore;
use crate::ledger::LedgerStore;
use crate::limits::*;
use crate::model::{CountScope, Outcome, PoolId, ResourceId, UserId};
use crate::pool::ConfigError;

const SLOT_PREFIX: &str = "slot";

/// How a grid's slots are grouped into capacity pools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridLayout {
    /// One pool for the whole grid: a user holds at most one slot per grid.
    #[default]
    Shared,
    /// One pool per room: a user holds at most one slot per room.
    PerRoom,
}

/// A (room × time) grid of capacity-1 resources, e.g. one VR-lab day.
///
/// Slot ids are `slot:{grid}:{room}:{time}`. Grid and room names may not
/// contain `:`; times may, so `parse` splits on the first three separators only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotGrid {
    name: String,
    rooms: Vec<String>,
    times: Vec<String>,
}

impl SlotGrid {
    pub fn new(name: String, rooms: Vec<String>, times: Vec<String>) -> Result<Self, ConfigError> {
        check_segment("grid name", &name)?;
        if rooms.is_empty() || times.is_empty() {
            return Err(ConfigError::InvalidSlot(format!("grid {name} has no slots")));
        }
        if rooms.len() > MAX_GRID_ROOMS {
            return Err(ConfigError::LimitExceeded("too many rooms in grid"));
        }
        if times.len() > MAX_GRID_TIMES {
            return Err(ConfigError::LimitExceeded("too many times in grid"));
        }
        let mut seen = HashSet::new();
        for room in &rooms {
            check_segment("room", room)?;
            if !seen.insert(room.as_str()) {
                return Err(ConfigError::InvalidSlot(format!("duplicate room {room}")));
            }
        }
        let mut seen = HashSet::new();
        for time in &times {
            if time.is_empty() || time.chars().any(char::is_control) {
                return Err(ConfigError::InvalidSlot(format!("bad time {time:?}")));
            }
            if !seen.insert(time.as_str()) {
                return Err(ConfigError::InvalidSlot(format!("duplicate time {time}")));
            }
        }
        Ok(Self { name, rooms, times })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rooms(&self) -> &[String] {
        &self.rooms
    }

    pub fn times(&self) -> &[String] {
        &self.times
    }

    pub fn slot_resource_id(&self, room: &str, time: &str) -> Result<ResourceId, ConfigError> {
        if !self.rooms.iter().any(|r| r == room) {
            return Err(ConfigError::InvalidSlot(format!("unknown room {room} in {}", self.name)));
        }
        if !self.times.iter().any(|t| t == time) {
            return Err(ConfigError::InvalidSlot(format!("unknown time {time} in {}", self.name)));
        }
        Ok(encode(&self.name, room, time))
    }

    /// Inverse of `slot_resource_id`. Rejects ids belonging to another grid.
    pub fn parse(&self, resource_id: &str) -> Result<(String, String), ConfigError> {
        let (grid, room, time) = decode(resource_id)
            .ok_or_else(|| ConfigError::InvalidSlot(format!("not a slot id: {resource_id}")))?;
        if grid != self.name {
            return Err(ConfigError::InvalidSlot(format!(
                "{resource_id} belongs to grid {grid}, not {}",
                self.name
            )));
        }
        Ok((room.to_string(), time.to_string()))
    }

    /// Slot ids for `room` in time order.
    pub fn enumerate_slots(&self, room: &str) -> Result<Vec<ResourceId>, ConfigError> {
        if !self.rooms.iter().any(|r| r == room) {
            return Err(ConfigError::InvalidSlot(format!("unknown room {room} in {}", self.name)));
        }
        Ok(self.times.iter().map(|t| encode(&self.name, room, t)).collect())
    }

    pub fn pool_id(&self, layout: GridLayout, room: &str) -> PoolId {
        match layout {
            GridLayout::Shared => self.name.clone(),
            GridLayout::PerRoom => format!("{}/{room}", self.name),
        }
    }

    /// `(pool_id, capacity, members)` for each pool this grid contributes.
    /// `capacity` overrides the default of one claim per slot.
    pub(crate) fn pool_layout(
        &self,
        layout: GridLayout,
        capacity: Option<u32>,
    ) -> Vec<(PoolId, u32, Vec<ResourceId>)> {
        match layout {
            GridLayout::Shared => {
                let members: Vec<_> = self
                    .rooms
                    .iter()
                    .flat_map(|r| self.times.iter().map(move |t| encode(&self.name, r, t)))
                    .collect();
                let cap = capacity.unwrap_or(members.len() as u32);
                vec![(self.name.clone(), cap, members)]
            }
            GridLayout::PerRoom => self
                .rooms
                .iter()
                .map(|r| {
                    let members: Vec<_> =
                        self.times.iter().map(|t| encode(&self.name, r, t)).collect();
                    let cap = capacity.unwrap_or(members.len() as u32);
                    (self.pool_id(layout, r), cap, members)
                })
                .collect(),
        }
    }
}

fn check_segment(what: &str, s: &str) -> Result<(), ConfigError> {
    if s.is_empty() || s.contains(':') || s.chars().any(char::is_control) {
        return Err(ConfigError::InvalidSlot(format!("bad {what} {s:?}")));
    }
    Ok(())
}

fn encode(grid: &str, room: &str, time: &str) -> ResourceId {
    format!("{SLOT_PREFIX}:{grid}:{room}:{time}")
}

fn decode(resource_id: &str) -> Option<(&str, &str, &str)> {
    let mut parts = resource_id.splitn(4, ':');
    if parts.next()? != SLOT_PREFIX {
        return None;
    }
    let grid = parts.next()?;
    let room = parts.next()?;
    let time = parts.next()?;
    if grid.is_empty() || room.is_empty() || time.is_empty() {
        return None;
    }
    Some((grid, room, time))
}

/// One rendered grid cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotView {
    pub resource_id: ResourceId,
    pub room: String,
    pub time: String,
    pub taken: bool,
}

/// Fronts the admission controller with grid coordinates. Admission logic is unchanged.
pub struct GridAdapter<L, C> {
    controller: Arc<AdmissionController<L, C>>,
    grid: SlotGrid,
}

impl<L: LedgerStore, C: CounterStore> GridAdapter<L, C> {
    pub fn new(controller: Arc<AdmissionController<L, C>>, grid: SlotGrid) -> Self {
        Self { controller, grid }
    }

    pub fn grid(&self) -> &SlotGrid {
        &self.grid
    }

    pub async fn claim_slot(
        &self,
        user_id: UserId,
        room: &str,
        time: &str,
    ) -> Result<Outcome, AdmissionError> {
        let resource_id = self.grid.slot_resource_id(room, time)?;
        self.controller.request_claim(user_id, &resource_id).await
    }

    /// Release whatever slot the user holds in the pool that `room` draws from.
    pub async fn release_slot(&self, user_id: UserId, room: &str) -> Result<bool, AdmissionError> {
        let first = self
            .grid
            .enumerate_slots(room)?
            .into_iter()
            .next()
            .ok_or_else(|| ConfigError::InvalidSlot(format!("room {room} has no slots")))?;
        let pool_id = self.controller.model().pool_of(&first)?.clone();
        self.controller.release_claim(user_id, &pool_id).await
    }

    /// Authoritative per-slot occupancy for rendering.
    pub async fn availability(&self, room: &str) -> Result<Vec<SlotView>, AdmissionError> {
        let mut views = Vec::with_capacity(self.grid.times.len());
        for (resource_id, time) in self.grid.enumerate_slots(room)?.into_iter().zip(&self.grid.times) {
            let capacity = self.controller.model().resource(&resource_id)?.capacity.unwrap_or(1);
            let taken = self
                .controller
                .ledger()
                .count_active(CountScope::Resource(&resource_id))
                .await?
                >= capacity;
            views.push(SlotView {
                resource_id,
                room: room.to_string(),
                time: time.clone(),
                taken,
            });
        }
        Ok(views)
    }
}
