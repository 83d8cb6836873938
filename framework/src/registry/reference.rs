use super::*;
use std::cmp::Reverse;

/// Sort key for service references: `(−ranking, service id)`, so that a
/// higher ranking sorts earlier and ties go to the older registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SortKey(Reverse<i64>, u64);

impl SortKey {
    fn new(ranking: i64, service_id: u64) -> Self {
        Self(Reverse(ranking), service_id)
    }
}

struct Inner {
    service_id: u64,
    bundle_id: u64,
    properties: RwLock<Properties>,
    sort_key: RwLock<SortKey>,
    /// Consumer bundle ID -> usage count. The owning bundle is not
    /// tracked here.
    using: Mutex<BTreeMap<u64, usize>>,
}

/// A handle identifying one registered service.
///
/// References are cheap to clone, hash and compare by service ID only,
/// and order by their [`SortKey`].
#[derive(Clone)]
pub struct ServiceReference {
    inner: Arc<Inner>,
}

impl ServiceReference {
    pub(crate) fn new(bundle_id: u64, properties: Properties) -> Self {
        debug_assert!(properties.contains_key(keys::SERVICE_ID));
        debug_assert!(properties.contains_key(keys::OBJECTCLASS));

        let service_id = properties.get_int(keys::SERVICE_ID).unwrap_or(0) as u64;
        let sort_key = SortKey::new(
            properties.get_int(keys::SERVICE_RANKING).unwrap_or(0),
            service_id,
        );

        Self {
            inner: Arc::new(Inner {
                service_id,
                bundle_id,
                properties: RwLock::new(properties),
                sort_key: RwLock::new(sort_key),
                using: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn service_id(&self) -> u64 {
        self.inner.service_id
    }

    /// The bundle that registered this service.
    pub fn bundle_id(&self) -> u64 {
        self.inner.bundle_id
    }

    /// A copy of the current service properties.
    pub fn properties(&self) -> Properties {
        self.inner
            .properties
            .read()
            .trace_expect("Failed to lock properties")
            .clone()
    }

    pub fn property(&self, name: &str) -> Option<Value> {
        self.inner
            .properties
            .read()
            .trace_expect("Failed to lock properties")
            .get(name)
            .cloned()
    }

    pub fn property_keys(&self) -> Vec<String> {
        self.inner
            .properties
            .read()
            .trace_expect("Failed to lock properties")
            .keys()
            .map(str::to_string)
            .collect()
    }

    /// The specifications this service is registered under.
    pub fn specifications(&self) -> Vec<String> {
        match self.property(keys::OBJECTCLASS) {
            Some(Value::List(specs)) => specs.iter().map(ToString::to_string).collect(),
            Some(single) => vec![single.to_string()],
            None => Vec::new(),
        }
    }

    pub fn ranking(&self) -> i64 {
        self.property(keys::SERVICE_RANKING)
            .and_then(|v| v.as_int())
            .unwrap_or(0)
    }

    /// True if this reference points to a (bundle or prototype) factory.
    pub fn is_factory(&self) -> bool {
        let scope = self.property(keys::SERVICE_SCOPE);
        matches!(
            scope.as_ref().and_then(Value::as_str),
            Some(keys::SCOPE_BUNDLE) | Some(keys::SCOPE_PROTOTYPE)
        )
    }

    /// True if this reference points to a prototype factory.
    pub fn is_prototype(&self) -> bool {
        let scope = self.property(keys::SERVICE_SCOPE);
        scope.as_ref().and_then(Value::as_str) == Some(keys::SCOPE_PROTOTYPE)
    }

    /// The bundles currently using this service.
    pub fn using_bundles(&self) -> Vec<u64> {
        self.inner
            .using
            .lock()
            .trace_expect("Failed to lock usage map")
            .keys()
            .copied()
            .collect()
    }

    pub(crate) fn used_by(&self, bundle_id: u64) {
        if bundle_id == self.inner.bundle_id {
            return;
        }
        *self
            .inner
            .using
            .lock()
            .trace_expect("Failed to lock usage map")
            .entry(bundle_id)
            .or_insert(0) += 1;
    }

    pub(crate) fn unused_by(&self, bundle_id: u64) {
        if bundle_id == self.inner.bundle_id {
            return;
        }
        let mut using = self
            .inner
            .using
            .lock()
            .trace_expect("Failed to lock usage map");
        if let Some(count) = using.get_mut(&bundle_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                using.remove(&bundle_id);
            }
        }
    }

    pub(crate) fn sort_key(&self) -> SortKey {
        *self
            .inner
            .sort_key
            .read()
            .trace_expect("Failed to lock sort key")
    }

    fn compute_key(&self) -> SortKey {
        SortKey::new(self.ranking(), self.inner.service_id)
    }

    pub(crate) fn needs_sort_update(&self) -> bool {
        self.sort_key() != self.compute_key()
    }

    pub(crate) fn update_sort_key(&self) {
        let key = self.compute_key();
        *self
            .inner
            .sort_key
            .write()
            .trace_expect("Failed to lock sort key") = key;
    }

    /// Applies a property update, returning the previous snapshot.
    pub(crate) fn apply_update(&self, update: Properties) -> Properties {
        let mut properties = self
            .inner
            .properties
            .write()
            .trace_expect("Failed to lock properties");
        let previous = properties.clone();
        properties.merge(&update);
        previous
    }
}

impl PartialEq for ServiceReference {
    fn eq(&self, other: &Self) -> bool {
        self.inner.service_id == other.inner.service_id
    }
}

impl Eq for ServiceReference {}

impl PartialOrd for ServiceReference {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServiceReference {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl std::hash::Hash for ServiceReference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.service_id.hash(state);
    }
}

impl std::fmt::Debug for ServiceReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceReference")
            .field("id", &self.inner.service_id)
            .field("bundle", &self.inner.bundle_id)
            .field("specifications", &self.specifications())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(id: i64, ranking: i64) -> ServiceReference {
        ServiceReference::new(
            0,
            Properties::from([
                (keys::SERVICE_ID, Value::from(id)),
                (keys::OBJECTCLASS, Value::from(vec!["spec"])),
                (keys::SERVICE_RANKING, Value::from(ranking)),
            ]),
        )
    }

    #[test]
    fn total_order() {
        let low_old = reference(1, 0);
        let low_new = reference(2, 0);
        let high = reference(3, 10);

        // Higher ranking sorts earlier
        assert!(high < low_old);
        // Ties go to the smaller (older) ID
        assert!(low_old < low_new);

        let mut refs = vec![low_new.clone(), high.clone(), low_old.clone()];
        refs.sort();
        assert_eq!(refs, vec![high, low_old, low_new]);
    }

    #[test]
    fn equality_is_by_id_only() {
        let a = reference(1, 0);
        let b = reference(1, 99);
        assert_eq!(a, b);
    }

    #[test]
    fn usage_accounting() {
        let svc = reference(1, 0);
        svc.used_by(7);
        svc.used_by(7);
        svc.used_by(8);
        assert_eq!(svc.using_bundles(), vec![7, 8]);

        svc.unused_by(7);
        assert_eq!(svc.using_bundles(), vec![7, 8]);
        svc.unused_by(7);
        assert_eq!(svc.using_bundles(), vec![8]);

        // The owner is never tracked
        svc.used_by(0);
        assert_eq!(svc.using_bundles(), vec![8]);
    }
}
