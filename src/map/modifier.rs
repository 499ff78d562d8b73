//! Staging buffer between the tracker-facing map and the optimizer.
//!
//! Producers (the tracker adding features, the optimizer staging refined
//! positions) append under the buffer's own lock; the map drains both queues
//! while holding its writer lock. Position updates carry only id and
//! position, so the optimizer can never touch descriptors or observation
//! lists.

use parking_lot::Mutex;

use crate::graph::LandmarkVertex;

use super::feature::MapFeature;

#[derive(Default)]
struct Buffer {
    features_to_add: Vec<MapFeature>,
    features_to_update: Vec<LandmarkVertex>,
}

/// Thread-safe staging area of pending feature additions and updates.
#[derive(Default)]
pub struct MapModifier {
    buffer: Mutex<Buffer>,
}

impl MapModifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a brand-new landmark for insertion into the live map.
    pub fn stage_addition(&self, feature: MapFeature) {
        self.buffer.lock().features_to_add.push(feature);
    }

    /// Queue optimized landmark positions.
    pub fn stage_updates(&self, updates: impl IntoIterator<Item = LandmarkVertex>) {
        self.buffer.lock().features_to_update.extend(updates);
    }

    /// Append an observing pose to a landmark that is still waiting in the
    /// addition queue. Returns whether the landmark was found there.
    pub fn append_pose_to_pending(&self, feature_id: u32, pose_id: u32) -> bool {
        let mut buffer = self.buffer.lock();
        match buffer
            .features_to_add
            .iter_mut()
            .find(|f| f.id == feature_id)
        {
            Some(feature) => {
                feature.poses_ids.push(pose_id);
                true
            }
            None => false,
        }
    }

    /// Whether either queue holds anything.
    pub fn has_pending(&self) -> bool {
        let buffer = self.buffer.lock();
        !buffer.features_to_add.is_empty() || !buffer.features_to_update.is_empty()
    }

    /// Number of queued additions.
    pub fn pending_additions(&self) -> usize {
        self.buffer.lock().features_to_add.len()
    }

    /// Take everything out of both queues, leaving them empty.
    pub fn take(&self) -> (Vec<MapFeature>, Vec<LandmarkVertex>) {
        let mut buffer = self.buffer.lock();
        (
            std::mem::take(&mut buffer.features_to_add),
            std::mem::take(&mut buffer.features_to_update),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::feature::FEATURE_START_ID;
    use nalgebra::Vector3;

    fn feature(id: u32) -> MapFeature {
        MapFeature {
            id,
            u: 10,
            v: 20,
            position: Vector3::new(0.0, 0.0, 1.0),
            poses_ids: vec![0],
            descriptors: vec![],
        }
    }

    #[test]
    fn test_take_empties_both_queues() {
        let modifier = MapModifier::new();
        modifier.stage_addition(feature(FEATURE_START_ID));
        modifier.stage_updates(vec![LandmarkVertex::new(
            FEATURE_START_ID,
            Vector3::new(1.0, 2.0, 3.0),
        )]);
        assert!(modifier.has_pending());

        let (adds, updates) = modifier.take();
        assert_eq!(adds.len(), 1);
        assert_eq!(updates.len(), 1);
        assert!(!modifier.has_pending());

        let (adds, updates) = modifier.take();
        assert!(adds.is_empty() && updates.is_empty());
    }

    #[test]
    fn test_append_pose_to_pending_addition() {
        let modifier = MapModifier::new();
        modifier.stage_addition(feature(FEATURE_START_ID));
        assert!(modifier.append_pose_to_pending(FEATURE_START_ID, 7));
        assert!(!modifier.append_pose_to_pending(FEATURE_START_ID + 1, 7));

        let (adds, _) = modifier.take();
        assert_eq!(adds[0].poses_ids, vec![0, 7]);
    }
}
