//! Input history.
//!
//! A bounded, time-indexed buffer of input component states, written by the
//! main thread (local inputs each tick, remote inputs on snapshot receipt)
//! and read by extrapolation jobs replaying the past. Guarded by a mutex
//! held only for the append or the range query.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use skerry_types::comp::BodyInput;
use skerry_types::Entity;

/// One recorded input frame: the inputs of some bodies at a point in time.
#[derive(Debug, Clone)]
pub struct InputFrame {
    /// Local time the inputs were captured or reconstructed at.
    pub timestamp: f64,
    /// `(body, input)` pairs in coordinator entity space.
    pub inputs: Vec<(Entity, BodyInput)>,
}

#[derive(Debug, Default)]
struct Inner {
    frames: VecDeque<InputFrame>,
}

/// Shared, bounded input history.
#[derive(Debug, Clone, Default)]
pub struct InputHistory {
    inner: Arc<Mutex<Inner>>,
    capacity: usize,
}

impl InputHistory {
    /// History keeping at most `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            capacity: capacity.max(1),
        }
    }

    /// Append a frame, keeping the buffer sorted by timestamp.
    pub fn emplace(&self, frame: InputFrame) {
        if frame.inputs.is_empty() {
            return;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        // Snapshot-fed frames can arrive out of order.
        let at = inner
            .frames
            .partition_point(|f| f.timestamp <= frame.timestamp);
        inner.frames.insert(at, frame);
        while inner.frames.len() > self.capacity {
            inner.frames.pop_front();
        }
    }

    /// Frames with `start < timestamp ≤ end`, oldest first.
    #[must_use]
    pub fn range(&self, start: f64, end: f64) -> Vec<InputFrame> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        inner
            .frames
            .iter()
            .filter(|f| f.timestamp > start && f.timestamp <= end)
            .cloned()
            .collect()
    }

    /// Number of buffered frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map_or(0, |inner| inner.frames.len())
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn frame(timestamp: f64, force_x: f64) -> InputFrame {
        InputFrame {
            timestamp,
            inputs: vec![(
                Entity::from_parts(1, 0),
                BodyInput {
                    force: Vector3::new(force_x, 0.0, 0.0),
                    torque: Vector3::zeros(),
                },
            )],
        }
    }

    #[test]
    fn test_range_query_bounds() {
        let history = InputHistory::new(16);
        for i in 0..5 {
            history.emplace(frame(f64::from(i), f64::from(i)));
        }

        let frames = history.range(1.0, 3.0);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].timestamp, 2.0);
        assert_eq!(frames[1].timestamp, 3.0);
    }

    #[test]
    fn test_out_of_order_insertion_sorts() {
        let history = InputHistory::new(16);
        history.emplace(frame(3.0, 3.0));
        history.emplace(frame(1.0, 1.0));
        history.emplace(frame(2.0, 2.0));

        let frames = history.range(0.0, 10.0);
        let times: Vec<f64> = frames.iter().map(|f| f.timestamp).collect();
        assert_eq!(times, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let history = InputHistory::new(3);
        for i in 0..6 {
            history.emplace(frame(f64::from(i), 0.0));
        }
        assert_eq!(history.len(), 3);
        let frames = history.range(0.0, 10.0);
        assert_eq!(frames[0].timestamp, 3.0);
    }

    #[test]
    fn test_empty_frames_ignored() {
        let history = InputHistory::new(4);
        history.emplace(InputFrame {
            timestamp: 1.0,
            inputs: Vec::new(),
        });
        assert!(history.is_empty());
    }
}
