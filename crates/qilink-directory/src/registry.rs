//! In-memory registry state. Pure bookkeeping; the wire side lives in
//! `lib.rs`.

use std::collections::HashMap;

use qilink_core::{service, Error, Result, ServiceInfo};

#[derive(Debug)]
struct Registered {
    info: ServiceInfo,
    owner: u64,
    ready: bool,
    order: u64,
}

/// Maps service ids to entries and names to ids. Entries are invisible
/// until marked ready.
#[derive(Debug)]
pub(crate) struct Registry {
    services: HashMap<u32, Registered>,
    by_name: HashMap<String, u32>,
    next_id: u32,
    next_order: u64,
}

impl Registry {
    /// A fresh registry already containing the directory itself as
    /// service 1.
    pub(crate) fn new(own_info: ServiceInfo) -> Registry {
        let mut registry = Registry {
            services: HashMap::new(),
            by_name: HashMap::new(),
            next_id: service::DIRECTORY + 1,
            next_order: 0,
        };
        let mut own_info = own_info;
        own_info.id = service::DIRECTORY;
        registry.by_name.insert(own_info.name.clone(), own_info.id);
        registry.services.insert(
            own_info.id,
            Registered {
                info: own_info,
                owner: 0,
                ready: true,
                order: 0,
            },
        );
        registry.next_order = 1;
        registry
    }

    /// Store a new entry (not yet visible) and assign its id.
    pub(crate) fn register(&mut self, mut info: ServiceInfo, owner: u64) -> Result<u32> {
        if self.by_name.contains_key(&info.name) {
            return Err(Error::AlreadyRegistered(info.name));
        }
        let id = self.next_id;
        self.next_id += 1;
        info.id = id;
        self.by_name.insert(info.name.clone(), id);
        self.services.insert(
            id,
            Registered {
                info,
                owner,
                ready: false,
                order: self.next_order,
            },
        );
        self.next_order += 1;
        Ok(id)
    }

    /// Promote an entry to visible.
    pub(crate) fn mark_ready(&mut self, id: u32) -> Result<ServiceInfo> {
        let entry = self
            .services
            .get_mut(&id)
            .ok_or_else(|| Error::ServiceNotFound(id.to_string()))?;
        entry.ready = true;
        Ok(entry.info.clone())
    }

    pub(crate) fn unregister(&mut self, id: u32) -> Result<ServiceInfo> {
        let entry = self
            .services
            .remove(&id)
            .ok_or_else(|| Error::ServiceNotFound(id.to_string()))?;
        self.by_name.remove(&entry.info.name);
        Ok(entry.info)
    }

    /// Rewrite an entry in place; id, owner, and visibility are preserved.
    pub(crate) fn update(&mut self, info: ServiceInfo) -> Result<()> {
        let entry = self
            .services
            .get_mut(&info.id)
            .ok_or_else(|| Error::ServiceNotFound(info.id.to_string()))?;
        if entry.info.name != info.name {
            self.by_name.remove(&entry.info.name);
            self.by_name.insert(info.name.clone(), info.id);
        }
        entry.info = info;
        Ok(())
    }

    /// Visible entry by name.
    pub(crate) fn lookup(&self, name: &str) -> Option<ServiceInfo> {
        let id = self.by_name.get(name)?;
        let entry = self.services.get(id)?;
        entry.ready.then(|| entry.info.clone())
    }

    /// Visible entries, ordered by id.
    pub(crate) fn list(&self) -> Vec<ServiceInfo> {
        let mut entries: Vec<ServiceInfo> = self
            .services
            .values()
            .filter(|e| e.ready)
            .map(|e| e.info.clone())
            .collect();
        entries.sort_by_key(|info| info.id);
        entries
    }

    /// Drop every entry owned by `owner`, in registration order. The
    /// returned flag says whether the entry was visible.
    pub(crate) fn remove_owner(&mut self, owner: u64) -> Vec<(ServiceInfo, bool)> {
        let mut owned: Vec<(u32, u64)> = self
            .services
            .iter()
            .filter(|(_, e)| e.owner == owner)
            .map(|(id, e)| (*id, e.order))
            .collect();
        owned.sort_by_key(|(_, order)| *order);
        owned
            .into_iter()
            .filter_map(|(id, _)| {
                let entry = self.services.remove(&id)?;
                self.by_name.remove(&entry.info.name);
                Some((entry.info, entry.ready))
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.services.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str) -> ServiceInfo {
        ServiceInfo {
            id: 0,
            name: name.to_owned(),
            endpoints: vec!["tcp://127.0.0.1:1".to_owned()],
            ..ServiceInfo::default()
        }
    }

    fn registry() -> Registry {
        Registry::new(ServiceInfo {
            name: "ServiceDirectory".to_owned(),
            ..ServiceInfo::default()
        })
    }

    #[test]
    fn directory_is_service_one() {
        let registry = registry();
        let list = registry.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, service::DIRECTORY);
    }

    #[test]
    fn register_assigns_increasing_ids_and_hides_until_ready() {
        let mut registry = registry();
        let a = registry.register(info("a"), 1).unwrap();
        let b = registry.register(info("b"), 1).unwrap();
        assert_eq!((a, b), (2, 3));
        assert!(registry.lookup("a").is_none());

        registry.mark_ready(a).unwrap();
        assert_eq!(registry.lookup("a").unwrap().id, a);
        assert!(registry.lookup("b").is_none());
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = registry();
        registry.register(info("echo"), 1).unwrap();
        assert!(matches!(
            registry.register(info("echo"), 2),
            Err(Error::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn unregister_frees_the_name() {
        let mut registry = registry();
        let id = registry.register(info("echo"), 1).unwrap();
        registry.mark_ready(id).unwrap();
        registry.unregister(id).unwrap();
        assert!(registry.lookup("echo").is_none());
        assert!(registry.register(info("echo"), 1).is_ok());
    }

    #[test]
    fn remove_owner_returns_registration_order() {
        let mut registry = registry();
        let a = registry.register(info("a"), 7).unwrap();
        let _other = registry.register(info("x"), 9).unwrap();
        let b = registry.register(info("b"), 7).unwrap();
        registry.mark_ready(a).unwrap();

        let removed = registry.remove_owner(7);
        let names: Vec<(&str, bool)> = removed
            .iter()
            .map(|(info, ready)| (info.name.as_str(), *ready))
            .collect();
        assert_eq!(names, vec![("a", true), ("b", false)]);
        assert!(registry.lookup("a").is_none());
        assert_eq!(registry.len(), 2);
        let _ = (a, b);
    }

    #[test]
    fn update_preserves_visibility() {
        let mut registry = registry();
        let id = registry.register(info("echo"), 1).unwrap();
        registry.mark_ready(id).unwrap();

        let mut updated = info("echo");
        updated.id = id;
        updated.endpoints = vec!["tcp://127.0.0.1:2".to_owned()];
        registry.update(updated).unwrap();
        assert_eq!(
            registry.lookup("echo").unwrap().endpoints,
            vec!["tcp://127.0.0.1:2".to_owned()]
        );
    }
}
