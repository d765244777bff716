//! Render seam.
//!
//! The map layer is external; the reconciler only needs to draw a zone,
//! get an opaque handle back, and erase it later.  Handles never carry zone
//! ids; the reconciler keeps both directions of that mapping itself.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use soundscape_core::{lock_unpoisoned, ZoneGeometry, ZoneId};

/// Opaque handle of a drawn zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderHandle(pub u64);

pub trait ZoneRenderer: Send {
    fn draw(&mut self, id: &ZoneId, geometry: &ZoneGeometry) -> RenderHandle;
    fn erase(&mut self, handle: RenderHandle);
    fn clear(&mut self);
}

#[derive(Debug, Default)]
struct RecordingLog {
    next_handle: u64,
    live: BTreeMap<RenderHandle, ZoneId>,
    draws: usize,
    erases: usize,
    clears: usize,
}

/// Renderer that records what is on screen.  Clones share the same log, so
/// one clone can be handed to the reconciler and another inspected.
#[derive(Debug, Clone, Default)]
pub struct RecordingRenderer {
    log: Arc<Mutex<RecordingLog>>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of zones currently drawn.
    pub fn live_count(&self) -> usize {
        lock_unpoisoned(&self.log).live.len()
    }

    /// How many drawn handles belong to `id`.
    pub fn handles_for(&self, id: &ZoneId) -> usize {
        lock_unpoisoned(&self.log).live.values().filter(|z| *z == id).count()
    }

    pub fn live_ids(&self) -> Vec<ZoneId> {
        lock_unpoisoned(&self.log).live.values().cloned().collect()
    }

    pub fn draw_count(&self) -> usize {
        lock_unpoisoned(&self.log).draws
    }

    pub fn erase_count(&self) -> usize {
        lock_unpoisoned(&self.log).erases
    }

    pub fn clear_count(&self) -> usize {
        lock_unpoisoned(&self.log).clears
    }
}

impl ZoneRenderer for RecordingRenderer {
    fn draw(&mut self, id: &ZoneId, _geometry: &ZoneGeometry) -> RenderHandle {
        let mut log = lock_unpoisoned(&self.log);
        log.next_handle += 1;
        let handle = RenderHandle(log.next_handle);
        log.live.insert(handle, id.clone());
        log.draws += 1;
        handle
    }

    fn erase(&mut self, handle: RenderHandle) {
        let mut log = lock_unpoisoned(&self.log);
        log.live.remove(&handle);
        log.erases += 1;
    }

    fn clear(&mut self) {
        let mut log = lock_unpoisoned(&self.log);
        log.live.clear();
        log.clears += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soundscape_core::GeoPoint;

    #[test]
    fn test_recording_renderer_tracks_live_handles() {
        let renderer = RecordingRenderer::new();
        let mut drawing = renderer.clone();
        let geometry = ZoneGeometry::Circle { center: GeoPoint::new(0.0, 0.0), radius_m: 5.0 };

        let a = drawing.draw(&ZoneId::from("a"), &geometry);
        let b = drawing.draw(&ZoneId::from("b"), &geometry);
        assert_ne!(a, b);
        assert_eq!(renderer.live_count(), 2);

        drawing.erase(a);
        assert_eq!(renderer.live_ids(), vec![ZoneId::from("b")]);

        drawing.clear();
        assert_eq!(renderer.live_count(), 0);
        assert_eq!(renderer.draw_count(), 2);
        assert_eq!(renderer.clear_count(), 1);
    }
}
