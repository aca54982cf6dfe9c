//! Reference-counted store of decoded visuals, keyed by content id.
//!
//! Selectable and non-selectable visuals of the same content live in separate maps so
//! a lookup can prefer one kind and fall back to the other.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::contract::Visual;

struct Entry {
    visual: Arc<Visual>,
    ref_count: usize,
}

#[derive(Default)]
pub struct VisualCache {
    selectable: HashMap<String, Entry>,
    non_selectable: HashMap<String, Entry>,
}

impl VisualCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference on `visual` under `id`. The map is chosen by the visual's
    /// selectability.
    pub fn cache(&mut self, id: &str, visual: Arc<Visual>) -> Arc<Visual> {
        let map = if visual.selectable {
            &mut self.selectable
        } else {
            &mut self.non_selectable
        };

        if let Some(entry) = map.get_mut(id) {
            if Arc::ptr_eq(&entry.visual, &visual) {
                entry.ref_count += 1;
                debug!(id, ref_count = entry.ref_count, "visual ref");
                return entry.visual.clone();
            }
            // Two loads of the same content raced; the newer one wins.
            warn!(id, ref_count = entry.ref_count, "visual clobbered");
        }

        map.insert(
            id.to_owned(),
            Entry {
                visual: visual.clone(),
                ref_count: 1,
            },
        );
        visual
    }

    /// Drop one reference in whichever map holds `id`.
    pub fn uncache(&mut self, id: &str) {
        for map in [&mut self.selectable, &mut self.non_selectable] {
            if let Some(entry) = map.get_mut(id) {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                debug!(id, ref_count = entry.ref_count, "visual unref");
                if entry.ref_count == 0 {
                    map.remove(id);
                }
            }
        }
    }

    /// The preferred kind if cached, otherwise the other kind.
    pub fn get_visual(&self, id: &str, prefer_selectable: bool) -> Option<Arc<Visual>> {
        let (first, second) = if prefer_selectable {
            (&self.selectable, &self.non_selectable)
        } else {
            (&self.non_selectable, &self.selectable)
        };
        first
            .get(id)
            .or_else(|| second.get(id))
            .map(|entry| entry.visual.clone())
    }

    /// Total references held on `id` across both kinds.
    pub fn ref_count(&self, id: &str) -> usize {
        self.selectable.get(id).map_or(0, |e| e.ref_count)
            + self.non_selectable.get(id).map_or(0, |e| e.ref_count)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.selectable.contains_key(id) || self.non_selectable.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.selectable.len() + self.non_selectable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn visual(id: &str, selectable: bool) -> Arc<Visual> {
        Arc::new(Visual {
            content_id: id.to_owned(),
            selectable,
            color: 0xCCCC66,
            transform: None,
        })
    }

    #[test]
    fn same_object_bumps_count_and_evicts_at_zero() {
        let mut cache = VisualCache::new();
        let v = visual("bolt-1", false);
        cache.cache("bolt-1", v.clone());
        cache.cache("bolt-1", v.clone());
        assert_eq!(cache.ref_count("bolt-1"), 2);

        cache.uncache("bolt-1");
        assert!(cache.contains("bolt-1"));
        cache.uncache("bolt-1");
        assert!(!cache.contains("bolt-1"));
        assert_eq!(cache.ref_count("bolt-1"), 0);
    }

    #[test]
    fn different_object_replaces_entry_at_one() {
        let mut cache = VisualCache::new();
        let first = visual("bolt-1", false);
        let second = visual("bolt-1", false);
        cache.cache("bolt-1", first.clone());
        cache.cache("bolt-1", first);
        cache.cache("bolt-1", second.clone());

        assert_eq!(cache.ref_count("bolt-1"), 1);
        let got = cache.get_visual("bolt-1", false).expect("cached");
        assert!(Arc::ptr_eq(&got, &second));
    }

    #[test]
    fn lookup_falls_back_to_other_kind() {
        let mut cache = VisualCache::new();
        let plain = visual("bolt-2", false);
        cache.cache("bolt-2", plain.clone());

        let got = cache.get_visual("bolt-2", true).expect("fallback");
        assert!(Arc::ptr_eq(&got, &plain));

        let pickable = visual("bolt-2", true);
        cache.cache("bolt-2", pickable.clone());
        let got = cache.get_visual("bolt-2", true).expect("preferred");
        assert!(Arc::ptr_eq(&got, &pickable));
        let got = cache.get_visual("bolt-2", false).expect("preferred");
        assert!(Arc::ptr_eq(&got, &plain));
    }

    #[test]
    fn uncache_unknown_id_is_a_no_op() {
        let mut cache = VisualCache::new();
        cache.uncache("missing");
        assert!(cache.is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Cache { selectable: bool, fresh: bool },
        Uncache,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<bool>(), any::<bool>())
                .prop_map(|(selectable, fresh)| Op::Cache { selectable, fresh }),
            Just(Op::Uncache),
        ]
    }

    proptest! {
        #[test]
        fn entry_present_iff_count_positive(ops in proptest::collection::vec(op(), 0..64)) {
            let mut cache = VisualCache::new();
            let mut held = [visual("v", false), visual("v", true)];
            for op in ops {
                match op {
                    Op::Cache { selectable, fresh } => {
                        let slot = usize::from(selectable);
                        if fresh {
                            held[slot] = visual("v", selectable);
                        }
                        cache.cache("v", held[slot].clone());
                    }
                    Op::Uncache => cache.uncache("v"),
                }
                prop_assert_eq!(cache.contains("v"), cache.ref_count("v") > 0);
            }
        }
    }
}
