//! Caret presence: local broadcast throttling and the remote-cursor registry.
//!
//! ## Local side
//!
//! ```text
//! key-up / click / mouse-up / selection-change
//!       │
//!       ▼
//! CursorTracker::on_trigger()      arms one coalescing deadline (50ms)
//!       │
//!       ▼
//! CursorTracker::on_timer()        measure → suppress if offset unchanged
//!       │                          and |dx|,|dy| < 2px → CursorSnapshot
//!       ▼
//! cursor-position(roomId, snapshot)
//! ```
//!
//! ## Remote side
//!
//! [`RemoteCursors`] keeps one entry per [`ClientId`]. Entries are replaced on
//! every update and removed only by an explicit `user-left`; silence never
//! expires a cursor.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::layout::{CaretSource, Point};
use crate::protocol::{now_millis, ClientId, CursorSnapshot};

/// What caused a caret re-measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaretTrigger {
    KeyUp,
    Click,
    MouseUp,
    SelectionChange,
}

/// RGBA color for remote caret rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a client identity.
    pub fn from_client(id: ClientId) -> Self {
        Self::from_uuid(id.as_uuid())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// `#rrggbb` for text front-ends.
    pub fn to_hex(&self) -> String {
        let c = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", c(self.r), c(self.g), c(self.b))
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Measure the caret, falling back to the marker when the native rectangle
/// has no size.
pub fn measure(source: &dyn CaretSource) -> Option<(usize, Point)> {
    let probe = source.caret()?;
    let position = if probe.rect.is_degenerate() {
        source
            .measure_marker(probe.offset)
            .unwrap_or_else(|| probe.rect.origin())
    } else {
        probe.rect.origin()
    };
    Some((probe.offset, position))
}

/// Local caret broadcaster.
pub struct CursorTracker {
    client_id: ClientId,
    username: String,
    coalesce: Duration,
    min_delta: f32,
    deadline: Option<Instant>,
    last_sent: Option<(usize, Point)>,
}

impl CursorTracker {
    pub fn new(client_id: ClientId, username: impl Into<String>, config: &SyncConfig) -> Self {
        Self {
            client_id,
            username: username.into(),
            coalesce: config.cursor_coalesce(),
            min_delta: config.cursor_min_pixel_delta,
            deadline: None,
            last_sent: None,
        }
    }

    /// Register a trigger. Returns the deadline to arm when none is pending;
    /// triggers inside an open window collapse into it.
    pub fn on_trigger(&mut self, trigger: CaretTrigger, now: Instant) -> Option<Instant> {
        if self.deadline.is_some() {
            log::trace!("coalescing caret trigger {trigger:?}");
            return None;
        }
        let at = now + self.coalesce;
        self.deadline = Some(at);
        Some(at)
    }

    /// Coalescing window elapsed: measure and decide whether to broadcast.
    pub fn on_timer(&mut self, now: Instant, source: &dyn CaretSource) -> Option<CursorSnapshot> {
        match self.deadline {
            Some(at) if now >= at => self.deadline = None,
            _ => return None,
        }
        let (offset, position) = measure(source)?;
        if self.is_redundant(offset, &position) {
            return None;
        }
        Some(self.record(offset, position))
    }

    /// Measure immediately for a flush that carries the caret with it.
    pub fn snapshot_now(&mut self, source: &dyn CaretSource) -> Option<CursorSnapshot> {
        let (offset, position) = measure(source)?;
        Some(self.record(offset, position))
    }

    /// Forget the last broadcast so the next measurement always goes out.
    pub fn reset(&mut self) {
        self.last_sent = None;
    }

    /// Drop any pending window.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    fn is_redundant(&self, offset: usize, position: &Point) -> bool {
        match &self.last_sent {
            Some((last_offset, last_pos)) => {
                *last_offset == offset && last_pos.within(position, self.min_delta)
            }
            None => false,
        }
    }

    fn record(&mut self, offset: usize, position: Point) -> CursorSnapshot {
        self.last_sent = Some((offset, position));
        CursorSnapshot {
            client_id: self.client_id,
            username: self.username.clone(),
            offset: offset as u64,
            x: position.x,
            y: position.y,
            timestamp: now_millis(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn last_sent(&self) -> Option<(usize, Point)> {
        self.last_sent
    }
}

/// A peer's caret as last reported.
#[derive(Debug, Clone)]
pub struct RemoteCursor {
    pub snapshot: CursorSnapshot,
    pub color: CursorColor,
    /// Local receipt time of the latest update.
    pub received_at: Instant,
}

impl RemoteCursor {
    pub fn position(&self) -> Point {
        Point::new(self.snapshot.x, self.snapshot.y)
    }

    pub fn since_update(&self) -> Duration {
        self.received_at.elapsed()
    }
}

/// Registry of remote carets keyed by client identity.
pub struct RemoteCursors {
    local: ClientId,
    cursors: HashMap<ClientId, RemoteCursor>,
}

impl RemoteCursors {
    pub fn new(local: ClientId) -> Self {
        Self {
            local,
            cursors: HashMap::new(),
        }
    }

    /// Insert or replace a peer's cursor. Own snapshots and snapshots older
    /// than the stored one are ignored.
    pub fn upsert(&mut self, snapshot: CursorSnapshot, now: Instant) -> bool {
        if snapshot.client_id == self.local {
            return false;
        }
        if let Some(existing) = self.cursors.get(&snapshot.client_id) {
            if snapshot.timestamp < existing.snapshot.timestamp {
                return false;
            }
        }
        let color = CursorColor::from_client(snapshot.client_id);
        self.cursors.insert(
            snapshot.client_id,
            RemoteCursor {
                snapshot,
                color,
                received_at: now,
            },
        );
        true
    }

    /// Remove on `user-left`. The only removal path.
    pub fn remove(&mut self, client_id: &ClientId) -> Option<RemoteCursor> {
        self.cursors.remove(client_id)
    }

    pub fn clear(&mut self) {
        self.cursors.clear();
    }

    pub fn get(&self, client_id: &ClientId) -> Option<&RemoteCursor> {
        self.cursors.get(client_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteCursor> {
        self.cursors.values()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{CaretProbe, CaretRect, MonospaceLayout, TextModel};
    use std::cell::Cell;

    /// Caret source with a settable probe that counts marker measurements.
    struct FakeCaret {
        probe: Option<CaretProbe>,
        marker: Point,
        marker_calls: Cell<usize>,
    }

    impl FakeCaret {
        fn at(offset: usize, x: f32, y: f32) -> Self {
            Self {
                probe: Some(CaretProbe {
                    offset,
                    rect: CaretRect { x, y, width: 1.0, height: 18.0 },
                }),
                marker: Point::ZERO,
                marker_calls: Cell::new(0),
            }
        }
    }

    impl CaretSource for FakeCaret {
        fn caret(&self) -> Option<CaretProbe> {
            self.probe
        }

        fn measure_marker(&self, _offset: usize) -> Option<Point> {
            self.marker_calls.set(self.marker_calls.get() + 1);
            Some(self.marker)
        }
    }

    fn tracker() -> CursorTracker {
        CursorTracker::new(ClientId::generate(), "alice", &SyncConfig::default())
    }

    fn fire(t: &mut CursorTracker, now: Instant, source: &dyn CaretSource) -> Option<CursorSnapshot> {
        let at = t.on_trigger(CaretTrigger::KeyUp, now)?;
        t.on_timer(at, source)
    }

    #[test]
    fn test_triggers_coalesce_into_one_window() {
        let mut t = tracker();
        let now = Instant::now();
        let at = t.on_trigger(CaretTrigger::KeyUp, now).unwrap();
        assert_eq!(at, now + Duration::from_millis(50));
        assert!(t.on_trigger(CaretTrigger::Click, now + Duration::from_millis(10)).is_none());
        assert!(t.on_trigger(CaretTrigger::SelectionChange, now + Duration::from_millis(20)).is_none());

        let source = FakeCaret::at(3, 30.0, 4.0);
        assert!(t.on_timer(now + Duration::from_millis(49), &source).is_none());
        let snap = t.on_timer(at, &source).unwrap();
        assert_eq!(snap.offset, 3);
        assert_eq!((snap.x, snap.y), (30.0, 4.0));
        assert!(t.on_timer(at, &source).is_none());
    }

    #[test]
    fn test_suppressed_when_offset_same_and_small_move() {
        let mut t = tracker();
        let now = Instant::now();
        assert!(fire(&mut t, now, &FakeCaret::at(3, 30.0, 4.0)).is_some());
        assert!(fire(&mut t, now, &FakeCaret::at(3, 31.9, 5.5)).is_none());
    }

    #[test]
    fn test_broadcast_when_pixel_delta_reaches_threshold() {
        let mut t = tracker();
        let now = Instant::now();
        fire(&mut t, now, &FakeCaret::at(3, 30.0, 4.0));
        assert!(fire(&mut t, now, &FakeCaret::at(3, 32.0, 4.0)).is_some());
    }

    #[test]
    fn test_broadcast_when_offset_changes() {
        let mut t = tracker();
        let now = Instant::now();
        fire(&mut t, now, &FakeCaret::at(3, 30.0, 4.0));
        assert!(fire(&mut t, now, &FakeCaret::at(4, 30.0, 4.0)).is_some());
    }

    #[test]
    fn test_degenerate_rect_uses_marker() {
        let mut source = FakeCaret::at(5, 0.0, 0.0);
        source.probe = Some(CaretProbe { offset: 5, rect: CaretRect::default() });
        source.marker = Point::new(44.0, 22.0);

        let (offset, pos) = measure(&source).unwrap();
        assert_eq!(offset, 5);
        assert_eq!(pos, Point::new(44.0, 22.0));
        assert_eq!(source.marker_calls.get(), 1);

        let plain = FakeCaret::at(5, 10.0, 10.0);
        measure(&plain).unwrap();
        assert_eq!(plain.marker_calls.get(), 0);
    }

    #[test]
    fn test_measure_from_text_model_line_end() {
        let mut model = TextModel::new(MonospaceLayout::default());
        model.set_text("abc");
        model.caret_to_end();
        let (offset, pos) = measure(&model).unwrap();
        assert_eq!(offset, 3);
        assert_eq!(pos, Point::new(4.0 + 24.0, 4.0));
    }

    #[test]
    fn test_snapshot_now_updates_suppression_baseline() {
        let mut t = tracker();
        let now = Instant::now();
        let source = FakeCaret::at(7, 50.0, 4.0);
        assert!(t.snapshot_now(&source).is_some());
        assert!(fire(&mut t, now, &source).is_none());
        t.reset();
        assert!(fire(&mut t, now, &source).is_some());
    }

    #[test]
    fn test_registry_ignores_self_and_stale() {
        let me = ClientId::generate();
        let peer = ClientId::generate();
        let mut reg = RemoteCursors::new(me);
        let now = Instant::now();
        let snap = |id, offset, ts| CursorSnapshot {
            client_id: id,
            username: "p".into(),
            offset,
            x: 0.0,
            y: 0.0,
            timestamp: ts,
        };

        assert!(!reg.upsert(snap(me, 1, 1), now));
        assert!(reg.upsert(snap(peer, 1, 10), now));
        assert!(!reg.upsert(snap(peer, 2, 5), now));
        assert_eq!(reg.get(&peer).unwrap().snapshot.offset, 1);
        assert!(reg.upsert(snap(peer, 3, 11), now));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_registry_removes_only_on_leave() {
        let peer = ClientId::generate();
        let mut reg = RemoteCursors::new(ClientId::generate());
        let long_ago = Instant::now();
        reg.upsert(
            CursorSnapshot {
                client_id: peer,
                username: "bob".into(),
                offset: 0,
                x: 1.0,
                y: 2.0,
                timestamp: 1,
            },
            long_ago,
        );
        assert!(reg.get(&peer).is_some());
        assert!(reg.remove(&peer).is_some());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_color_stable() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let a = CursorColor::from_uuid(id);
        assert_eq!(a, CursorColor::from_uuid(id));
        assert_eq!(a.a, 1.0);
        assert_eq!(a.to_hex().len(), 7);
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }
}
