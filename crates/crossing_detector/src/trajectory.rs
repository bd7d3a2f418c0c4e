//! Fixed-capacity centroid history.
//!
//! - HeapRb keeps the last N points; when full the oldest is evicted

use ringbuf::{traits::*, HeapRb};

/// One tracked centroid observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackPoint {
    pub x: f32,
    pub timestamp_nanos: i64,
    /// Horizontal blob extent in pixels
    pub width: f32,
}

pub struct Trajectory {
    points: HeapRb<TrackPoint>,
}

impl Trajectory {
    pub fn new(capacity: usize) -> Self {
        Self {
            points: HeapRb::new(capacity.max(2)),
        }
    }

    /// Append a point, evicting the oldest when full.
    #[inline]
    pub fn push(&mut self, point: TrackPoint) {
        if self.points.is_full() {
            let _ = self.points.try_pop();
        }
        let _ = self.points.try_push(point);
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.occupied_len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn latest(&self) -> Option<TrackPoint> {
        self.points.iter().last().copied()
    }

    /// The two most recent points, oldest first.
    pub fn last_pair(&self) -> Option<(TrackPoint, TrackPoint)> {
        let n = self.len();
        if n < 2 {
            return None;
        }
        let mut iter = self.points.iter().skip(n - 2);
        let prev = *iter.next()?;
        let cur = *iter.next()?;
        Some((prev, cur))
    }

    /// Velocity between the oldest and newest retained points (px/s).
    pub fn velocity(&self) -> Option<f32> {
        let first = *self.points.iter().next()?;
        let last = self.latest()?;
        let dt = (last.timestamp_nanos - first.timestamp_nanos) as f64 / 1e9;
        if dt <= 0.0 {
            return None;
        }
        Some(((last.x - first.x) as f64 / dt) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(x: f32, ms: i64) -> TrackPoint {
        TrackPoint {
            x,
            timestamp_nanos: ms * 1_000_000,
            width: 60.0,
        }
    }

    #[test]
    fn test_evicts_oldest() {
        let mut t = Trajectory::new(3);
        for i in 0..5 {
            t.push(point(i as f32 * 10.0, i * 10));
        }
        assert_eq!(t.len(), 3);
        let (prev, cur) = t.last_pair().unwrap();
        assert_eq!(prev.x, 30.0);
        assert_eq!(cur.x, 40.0);
    }

    #[test]
    fn test_velocity_uses_endpoints() {
        let mut t = Trajectory::new(6);
        assert!(t.velocity().is_none());
        t.push(point(100.0, 0));
        assert!(t.velocity().is_none());
        t.push(point(130.0, 10));
        t.push(point(160.0, 20));
        let v = t.velocity().unwrap();
        assert!((v - 3000.0).abs() < 1e-2);
    }

    #[test]
    fn test_clear() {
        let mut t = Trajectory::new(4);
        t.push(point(1.0, 1));
        t.clear();
        assert!(t.is_empty());
        assert!(t.latest().is_none());
    }
}
