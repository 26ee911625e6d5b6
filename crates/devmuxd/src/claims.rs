//! Global claim table: which session holds which device.
//!
//! Shared by every session through an `Arc`. The table is the arbiter of
//! exclusive access; the registry only mirrors the claimed bit for queries.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use devmux_core::{DeviceId, SessionId};

use crate::resource::ClaimedResource;

/// Concurrent map of `DeviceId` to the resource holding it.
///
/// A device maps to at most one resource at any instant; `try_register` is
/// the only insertion path and checks and sets under the shard lock.
#[derive(Debug, Default)]
pub struct ClaimTable {
    entries: DashMap<DeviceId, Arc<ClaimedResource>>,
}

impl ClaimTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The resource currently holding `device_id`.
    pub fn get(&self, device_id: &DeviceId) -> Option<Arc<ClaimedResource>> {
        self.entries.get(device_id).map(|entry| Arc::clone(entry.value()))
    }

    /// The session currently holding `device_id`.
    pub fn owner_of(&self, device_id: &DeviceId) -> Option<SessionId> {
        self.entries.get(device_id).map(|entry| entry.owner().clone())
    }

    /// Inserts `resource` unless another resource holds its device.
    ///
    /// Registering the same session twice for one device is accepted and
    /// keeps the existing entry.
    ///
    /// # Errors
    ///
    /// Returns the current holder's session id on conflict.
    pub fn try_register(&self, resource: Arc<ClaimedResource>) -> Result<(), SessionId> {
        match self.entries.entry(resource.device_id().clone()) {
            Entry::Occupied(existing) => {
                if existing.get().is_owned_by(resource.owner()) {
                    Ok(())
                } else {
                    Err(existing.get().owner().clone())
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(resource);
                Ok(())
            }
        }
    }

    /// Removes the entry for `device_id` if `session` holds it.
    pub fn remove_owned(&self, device_id: &DeviceId, session: &SessionId) -> Option<Arc<ClaimedResource>> {
        self.entries
            .remove_if(device_id, |_, resource| resource.is_owned_by(session))
            .map(|(_, resource)| resource)
    }

    /// Number of devices `session` holds.
    pub fn count_owned(&self, session: &SessionId) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.is_owned_by(session))
            .count()
    }

    /// Every resource `session` holds, ordered by device id.
    pub fn owned_by(&self, session: &SessionId) -> Vec<Arc<ClaimedResource>> {
        let mut owned: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| entry.is_owned_by(session))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        owned.sort_by(|a, b| a.device_id().cmp(b.device_id()));
        owned
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmux_core::{DeviceDescriptor, DeviceType};

    fn resource(owner: &str, device: &str) -> Arc<ClaimedResource> {
        let desc = DeviceDescriptor::new(DeviceId::new(device), DeviceType::Keyboard, ["raw"]);
        Arc::new(ClaimedResource::new(SessionId::new(owner), &desc))
    }

    #[test]
    fn test_register_and_conflict() {
        let table = ClaimTable::new();
        assert!(table.try_register(resource("s1", "kbd-1")).is_ok());

        // Same owner again is accepted
        assert!(table.try_register(resource("s1", "kbd-1")).is_ok());
        assert_eq!(table.len(), 1);

        let err = table.try_register(resource("s2", "kbd-1")).unwrap_err();
        assert_eq!(err, SessionId::new("s1"));
        assert_eq!(table.owner_of(&DeviceId::new("kbd-1")), Some(SessionId::new("s1")));
    }

    #[test]
    fn test_remove_owned_checks_owner() {
        let table = ClaimTable::new();
        table.try_register(resource("s1", "kbd-1")).unwrap();

        assert!(table.remove_owned(&DeviceId::new("kbd-1"), &SessionId::new("s2")).is_none());
        assert_eq!(table.len(), 1);

        assert!(table.remove_owned(&DeviceId::new("kbd-1"), &SessionId::new("s1")).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_owned_by_is_sorted_and_scoped() {
        let table = ClaimTable::new();
        table.try_register(resource("s1", "mouse-1")).unwrap();
        table.try_register(resource("s1", "kbd-1")).unwrap();
        table.try_register(resource("s2", "pad-1")).unwrap();

        let owned: Vec<_> = table
            .owned_by(&SessionId::new("s1"))
            .iter()
            .map(|r| r.device_id().as_str().to_string())
            .collect();
        assert_eq!(owned, vec!["kbd-1", "mouse-1"]);
        assert_eq!(table.count_owned(&SessionId::new("s2")), 1);
        assert_eq!(table.count_owned(&SessionId::new("s3")), 0);
    }

    #[test]
    fn test_concurrent_register_has_single_winner() {
        let table = Arc::new(ClaimTable::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || table.try_register(resource(&format!("s{i}"), "kbd-1")).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(table.len(), 1);
    }
}
