// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Role registry: which printer serves which role.
//
// At most one mapping per role; a device may serve several roles. Every
// mutation writes the full table to the store before returning. If the
// write fails the in-memory table is rolled back and the error returned,
// so memory never runs ahead of disk.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};

use bonwerk_core::error::{BonwerkError, Result};
use bonwerk_core::types::{Capability, Device, DeviceId, Role, RoleMapping};
use bonwerk_store::KeyValueStore;

use crate::saved::SavedDeviceStore;

/// Store key of the role mapping table.
const ROLE_MAPPINGS_KEY: &str = "role_mappings";

pub struct RoleRegistry {
    mappings: Mutex<BTreeMap<Role, RoleMapping>>,
    store: Arc<dyn KeyValueStore>,
    saved: Arc<SavedDeviceStore>,
}

impl RoleRegistry {
    /// Load the persisted table. An unreadable table starts empty.
    pub fn load(store: Arc<dyn KeyValueStore>, saved: Arc<SavedDeviceStore>) -> Self {
        let mappings = match read_table(store.as_ref()) {
            Ok(table) => table,
            Err(e) => {
                warn!(error = %e, "role mappings unreadable, starting empty");
                BTreeMap::new()
            }
        };
        debug!(count = mappings.len(), "role mappings loaded");
        Self {
            mappings: Mutex::new(mappings),
            store,
            saved,
        }
    }

    /// Bind `role` to `device`, replacing any previous binding.
    pub fn set_mapping(&self, role: Role, device: &Device, enabled: bool) -> Result<RoleMapping> {
        let missing: Vec<Capability> = role
            .required_capabilities()
            .difference(&device.capabilities)
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(BonwerkError::InsufficientCapabilities {
                role,
                device: device.id.clone(),
                missing,
            });
        }

        let mapping = RoleMapping {
            role,
            device_id: device.id.clone(),
            display_name: device.display_name().to_owned(),
            enabled,
            last_used: None,
        };

        let previous = self.mutate(|table| Ok(table.insert(role, mapping.clone())))?;

        info!(role = %role, device = %device.id, enabled, "role mapped");
        self.sync_saved_roles(&device.id);
        if let Some(prev) = previous.filter(|p| p.device_id != device.id) {
            self.sync_saved_roles(&prev.device_id);
        }
        Ok(mapping)
    }

    /// Drop the binding for `role`. Returns the removed mapping.
    pub fn remove_mapping(&self, role: Role) -> Result<Option<RoleMapping>> {
        let removed = self.mutate(|table| Ok(table.remove(&role)))?;
        if let Some(mapping) = &removed {
            info!(role = %role, device = %mapping.device_id, "role unmapped");
            self.sync_saved_roles(&mapping.device_id);
        }
        Ok(removed)
    }

    pub fn set_enabled(&self, role: Role, enabled: bool) -> Result<()> {
        self.mutate(|table| {
            let mapping = table.get_mut(&role).ok_or(BonwerkError::NoMapping(role))?;
            mapping.enabled = enabled;
            Ok(())
        })?;
        info!(role = %role, enabled, "role toggled");
        Ok(())
    }

    pub fn get_mapping(&self, role: Role) -> Option<RoleMapping> {
        self.mappings
            .lock()
            .expect("registry lock poisoned")
            .get(&role)
            .cloned()
    }

    /// All mappings, in role order.
    pub fn mappings(&self) -> Vec<RoleMapping> {
        self.mappings
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Roles currently routed to `device_id` (enabled or not).
    pub fn roles_for(&self, device_id: &DeviceId) -> Vec<Role> {
        self.mappings
            .lock()
            .expect("registry lock poisoned")
            .values()
            .filter(|m| &m.device_id == device_id)
            .map(|m| m.role)
            .collect()
    }

    /// Distinct devices with at least one enabled mapping, with the name the
    /// mapping recorded for them.
    pub fn enabled_devices(&self) -> Vec<(DeviceId, String)> {
        let table = self.mappings.lock().expect("registry lock poisoned");
        let mut devices: Vec<(DeviceId, String)> = Vec::new();
        for mapping in table.values().filter(|m| m.enabled) {
            if !devices.iter().any(|(id, _)| id == &mapping.device_id) {
                devices.push((mapping.device_id.clone(), mapping.display_name.clone()));
            }
        }
        devices
    }

    /// Resolve a role for submission: there must be an enabled mapping.
    pub fn resolve(&self, role: Role) -> Result<RoleMapping> {
        match self.get_mapping(role) {
            None => Err(BonwerkError::NoMapping(role)),
            Some(mapping) if !mapping.enabled => Err(BonwerkError::MappingDisabled(role)),
            Some(mapping) => Ok(mapping),
        }
    }

    /// Stamp `last_used`. A failed write only costs the timestamp.
    pub fn touch(&self, role: Role) {
        let result = self.mutate(|table| {
            if let Some(mapping) = table.get_mut(&role) {
                mapping.last_used = Some(Utc::now());
            }
            Ok(())
        });
        if let Err(e) = result {
            warn!(role = %role, error = %e, "could not persist role usage");
        }
    }

    /// Apply `f` to the table and persist it; roll back on any failure.
    fn mutate<T>(&self, f: impl FnOnce(&mut BTreeMap<Role, RoleMapping>) -> Result<T>) -> Result<T> {
        let mut table = self.mappings.lock().expect("registry lock poisoned");
        let snapshot = table.clone();
        let out = match f(&mut table) {
            Ok(out) => out,
            Err(e) => {
                *table = snapshot;
                return Err(e);
            }
        };
        if let Err(e) = write_table(self.store.as_ref(), &table) {
            *table = snapshot;
            warn!(error = %e, "role mappings not persisted, change rolled back");
            return Err(e);
        }
        Ok(out)
    }

    fn sync_saved_roles(&self, device_id: &DeviceId) {
        let roles = self.roles_for(device_id);
        if let Err(e) = self.saved.update_roles(device_id, &roles) {
            warn!(device = %device_id, error = %e, "saved device roles not updated");
        }
    }
}

fn read_table(store: &dyn KeyValueStore) -> Result<BTreeMap<Role, RoleMapping>> {
    let Some(doc) = store.get(ROLE_MAPPINGS_KEY)? else {
        return Ok(BTreeMap::new());
    };
    let list: Vec<RoleMapping> = serde_json::from_value(doc)?;
    Ok(list.into_iter().map(|m| (m.role, m)).collect())
}

fn write_table(store: &dyn KeyValueStore, table: &BTreeMap<Role, RoleMapping>) -> Result<()> {
    let list: Vec<&RoleMapping> = table.values().collect();
    store.put(ROLE_MAPPINGS_KEY, &serde_json::to_value(list)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    use bonwerk_core::types::DeviceKind;
    use bonwerk_store::{MemoryStore, SqliteStore};
    use serde_json::Value;

    /// Store whose writes can be switched off.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        broken: AtomicBool,
    }

    impl KeyValueStore for FlakyStore {
        fn get(&self, key: &str) -> Result<Option<Value>> {
            self.inner.get(key)
        }
        fn put(&self, key: &str, value: &Value) -> Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(BonwerkError::Database("disk full".into()));
            }
            self.inner.put(key, value)
        }
        fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key)
        }
        fn update(
            &self,
            key: &str,
            f: &mut dyn FnMut(Option<Value>) -> Result<Value>,
        ) -> Result<Value> {
            self.inner.update(key, f)
        }
    }

    fn device(addr: &str, name: &str) -> Device {
        Device::new(DeviceId::from_parts(DeviceKind::Bluetooth, addr), name)
    }

    fn registry_on(store: Arc<dyn KeyValueStore>) -> (RoleRegistry, Arc<SavedDeviceStore>) {
        let saved = Arc::new(SavedDeviceStore::new(store.clone(), 3));
        (RoleRegistry::load(store, saved.clone()), saved)
    }

    #[test]
    fn set_get_remove() {
        let (registry, _) = registry_on(Arc::new(MemoryStore::new()));
        let printer = device("00:00:00:00:00:0A", "Kitchen");

        registry.set_mapping(Role::Receipt, &printer, true).unwrap();
        let mapping = registry.get_mapping(Role::Receipt).unwrap();
        assert_eq!(mapping.device_id, printer.id);
        assert!(mapping.enabled);
        assert_eq!(mapping.display_name, "Kitchen");

        registry.remove_mapping(Role::Receipt).unwrap();
        assert!(registry.get_mapping(Role::Receipt).is_none());
        assert!(registry.remove_mapping(Role::Receipt).unwrap().is_none());
    }

    #[test]
    fn capability_check() {
        let (registry, _) = registry_on(Arc::new(MemoryStore::new()));
        let mut cash_drawer = device("00:00:00:00:00:0C", "Drawer");
        cash_drawer.capabilities = BTreeSet::from([Capability::CashDrawer]);

        let err = registry
            .set_mapping(Role::Receipt, &cash_drawer, true)
            .unwrap_err();
        assert!(matches!(
            err,
            BonwerkError::InsufficientCapabilities { ref missing, .. }
                if missing == &vec![Capability::TextPrinting]
        ));
        assert!(registry.get_mapping(Role::Receipt).is_none());
    }

    #[test]
    fn resolve_distinguishes_missing_and_disabled() {
        let (registry, _) = registry_on(Arc::new(MemoryStore::new()));
        assert!(matches!(
            registry.resolve(Role::BarOrder),
            Err(BonwerkError::NoMapping(Role::BarOrder))
        ));

        let printer = device("00:00:00:00:00:0B", "Bar");
        registry.set_mapping(Role::BarOrder, &printer, false).unwrap();
        assert!(matches!(
            registry.resolve(Role::BarOrder),
            Err(BonwerkError::MappingDisabled(Role::BarOrder))
        ));

        registry.set_enabled(Role::BarOrder, true).unwrap();
        assert_eq!(registry.resolve(Role::BarOrder).unwrap().device_id, printer.id);
        assert!(registry.set_enabled(Role::Receipt, true).is_err());
    }

    #[test]
    fn one_device_many_roles() {
        let (registry, _) = registry_on(Arc::new(MemoryStore::new()));
        let a = device("00:00:00:00:00:0A", "A");
        let b = device("00:00:00:00:00:0B", "B");

        registry.set_mapping(Role::KitchenOrder, &a, true).unwrap();
        registry.set_mapping(Role::BarOrder, &a, true).unwrap();
        registry.set_mapping(Role::Receipt, &b, false).unwrap();

        assert_eq!(registry.roles_for(&a.id), vec![Role::KitchenOrder, Role::BarOrder]);
        assert_eq!(registry.enabled_devices(), vec![(a.id.clone(), "A".into())]);
        assert_eq!(registry.mappings().len(), 3);
    }

    #[test]
    fn table_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.db");
        let printer = device("00:00:00:00:00:0A", "Kitchen");
        {
            let (registry, _) = registry_on(Arc::new(SqliteStore::open(&path).unwrap()));
            registry.set_mapping(Role::KitchenOrder, &printer, true).unwrap();
            registry.set_enabled(Role::KitchenOrder, false).unwrap();
        }
        let (registry, _) = registry_on(Arc::new(SqliteStore::open(&path).unwrap()));
        let mapping = registry.get_mapping(Role::KitchenOrder).unwrap();
        assert_eq!(mapping.device_id, printer.id);
        assert!(!mapping.enabled);
    }

    #[test]
    fn failed_persist_rolls_back() {
        let store = Arc::new(FlakyStore::default());
        let (registry, _) = registry_on(store.clone());
        let a = device("00:00:00:00:00:0A", "A");
        let b = device("00:00:00:00:00:0B", "B");
        registry.set_mapping(Role::Receipt, &a, true).unwrap();

        store.broken.store(true, Ordering::SeqCst);
        assert!(matches!(
            registry.set_mapping(Role::Receipt, &b, true),
            Err(BonwerkError::Database(_))
        ));
        assert_eq!(registry.get_mapping(Role::Receipt).unwrap().device_id, a.id);
        assert!(registry.set_enabled(Role::Receipt, false).is_err());
        assert!(registry.get_mapping(Role::Receipt).unwrap().enabled);
    }

    #[test]
    fn saved_roles_follow_mapping_changes() {
        let (registry, saved) = registry_on(Arc::new(MemoryStore::new()));
        let a = device("00:00:00:00:00:0A", "A");
        let b = device("00:00:00:00:00:0B", "B");
        saved.save(&a.id, "A", &[]).unwrap();
        saved.save(&b.id, "B", &[]).unwrap();

        registry.set_mapping(Role::Receipt, &a, true).unwrap();
        assert_eq!(saved.get(&a.id).unwrap().unwrap().roles, vec![Role::Receipt]);

        // Moving the role updates both the new and the previous device.
        registry.set_mapping(Role::Receipt, &b, true).unwrap();
        assert!(saved.get(&a.id).unwrap().unwrap().roles.is_empty());
        assert_eq!(saved.get(&b.id).unwrap().unwrap().roles, vec![Role::Receipt]);

        registry.remove_mapping(Role::Receipt).unwrap();
        assert!(saved.get(&b.id).unwrap().unwrap().roles.is_empty());
    }
}
