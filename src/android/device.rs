//! Push/poll device adapters
//!
//! The accessibility service pushes screen frames into a `FrameSlot`, drains
//! gestures from a `GestureQueue` and confirms each one once dispatched. The
//! engine sees them as an ordinary `FrameSource` and `ActionPort`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ports::{ActionPort, CaptureError, FrameSource, Point};
use crate::vision::Frame;

/// Maximum gestures waiting for the service before new ones are refused
pub const GESTURE_QUEUE_CAPACITY: usize = 64;

#[derive(Default)]
struct Slot {
    frame: Option<Frame>,
    /// Bumped on every submit
    sequence: u64,
    /// Sequence of the last frame handed to the engine
    delivered: u64,
}

/// Latest frame pushed by the platform
pub struct FrameSlot {
    slot: Mutex<Slot>,
    fresh: Condvar,
    timeout: Duration,
}

impl FrameSlot {
    /// `timeout` bounds how long a capture waits for a new frame
    pub fn new(timeout: Duration) -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            fresh: Condvar::new(),
            timeout,
        }
    }

    /// Replace the latest frame and wake a waiting capture
    pub fn submit(&self, frame: Frame) {
        let mut slot = self.lock();
        slot.frame = Some(frame);
        slot.sequence += 1;
        drop(slot);
        self.fresh.notify_all();
    }

    /// Treat every frame submitted so far as stale
    pub fn expire(&self) {
        let mut slot = self.lock();
        slot.delivered = slot.sequence;
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl FrameSource for FrameSlot {
    /// Only frames submitted after the previous capture, and after the last
    /// confirmed gesture, count as fresh
    fn capture_frame(&self) -> Result<Frame, CaptureError> {
        let slot = self.lock();
        let (mut slot, wait) = match self.fresh.wait_timeout_while(slot, self.timeout, |s| {
            s.sequence <= s.delivered
        }) {
            Ok(result) => result,
            Err(poisoned) => poisoned.into_inner(),
        };

        if wait.timed_out() && slot.sequence <= slot.delivered {
            return Err(if slot.frame.is_none() {
                CaptureError::Unavailable
            } else {
                CaptureError::TimedOut
            });
        }

        slot.delivered = slot.sequence;
        slot.frame.clone().ok_or(CaptureError::Unavailable)
    }
}

/// Gesture for the platform to dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Gesture {
    Tap {
        x: i32,
        y: i32,
        duration_ms: u64,
    },
    Swipe {
        path: Vec<Point>,
        duration_ms: u64,
    },
}

impl Gesture {
    fn duration(&self) -> Duration {
        match self {
            Self::Tap { duration_ms, .. } | Self::Swipe { duration_ms, .. } => {
                Duration::from_millis(*duration_ms)
            }
        }
    }
}

/// A queued gesture and the id the platform acknowledges it with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispatch {
    pub id: u64,
    #[serde(flatten)]
    pub gesture: Gesture,
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<Dispatch>,
    /// Ids still waiting for a confirmation, with the outcome once it arrives
    awaiting: HashMap<u64, Option<bool>>,
    next_id: u64,
}

/// Bounded queue of gestures awaiting dispatch.
///
/// `tap` and `swipe` block until the platform confirms the gesture through
/// `complete`, or until the gesture's duration plus `ack_timeout` elapses.
/// A timeout counts as a failed injection.
pub struct GestureQueue {
    queue: Mutex<Queue>,
    acked: Condvar,
    capacity: usize,
    ack_timeout: Duration,
    frames: Option<Arc<FrameSlot>>,
}

impl GestureQueue {
    pub fn new(capacity: usize, ack_timeout: Duration) -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            acked: Condvar::new(),
            capacity,
            ack_timeout,
            frames: None,
        }
    }

    /// Expire frames in `frames` whenever a gesture is confirmed, so the next
    /// capture shows the screen after the gesture
    pub fn with_frames(mut self, frames: Arc<FrameSlot>) -> Self {
        self.frames = Some(frames);
        self
    }

    /// Oldest pending gesture
    pub fn poll(&self) -> Option<Dispatch> {
        self.lock().pending.pop_front()
    }

    /// Record the platform's outcome for gesture `id`.
    ///
    /// Returns `false` for an id nobody is waiting on, such as one that
    /// already timed out.
    pub fn complete(&self, id: u64, ok: bool) -> bool {
        let mut queue = self.lock();
        let Some(outcome) = queue.awaiting.get_mut(&id) else {
            log::debug!("Ignoring confirmation for unknown gesture {}", id);
            return false;
        };
        *outcome = Some(ok);

        if let Some(frames) = &self.frames {
            frames.expire();
        }
        drop(queue);
        self.acked.notify_all();
        true
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    fn dispatch(&self, gesture: Gesture) -> bool {
        let timeout = gesture.duration() + self.ack_timeout;

        let mut queue = self.lock();
        if queue.pending.len() >= self.capacity {
            log::warn!("Gesture queue full, dropping {:?}", gesture);
            return false;
        }
        queue.next_id += 1;
        let id = queue.next_id;
        queue.pending.push_back(Dispatch { id, gesture });
        queue.awaiting.insert(id, None);

        let (mut queue, _) = match self.acked.wait_timeout_while(queue, timeout, |q| {
            matches!(q.awaiting.get(&id), Some(None))
        }) {
            Ok(result) => result,
            Err(poisoned) => poisoned.into_inner(),
        };

        match queue.awaiting.remove(&id).flatten() {
            Some(ok) => {
                if !ok {
                    log::warn!("Platform rejected gesture {}", id);
                }
                ok
            }
            None => {
                queue.pending.retain(|d| d.id != id);
                log::warn!("Gesture {} not confirmed within {:?}", id, timeout);
                false
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ActionPort for GestureQueue {
    fn tap(&self, point: Point, duration: Duration) -> bool {
        self.dispatch(Gesture::Tap {
            x: point.x,
            y: point.y,
            duration_ms: duration.as_millis() as u64,
        })
    }

    fn swipe(&self, path: &[Point], duration: Duration) -> bool {
        if path.len() < 2 {
            return false;
        }
        self.dispatch(Gesture::Swipe {
            path: path.to_vec(),
            duration_ms: duration.as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{noise, scene};

    #[test]
    fn test_capture_without_frames_is_unavailable() {
        let slot = FrameSlot::new(Duration::from_millis(10));
        assert_eq!(slot.capture_frame().unwrap_err(), CaptureError::Unavailable);
    }

    #[test]
    fn test_stale_frame_times_out() {
        let slot = FrameSlot::new(Duration::from_millis(10));
        slot.submit(scene(16, 16, &[]));

        assert!(slot.capture_frame().is_ok());
        assert_eq!(slot.capture_frame().unwrap_err(), CaptureError::TimedOut);

        slot.submit(scene(16, 16, &[(&noise(4, 4, 1), 2, 2)]));
        assert!(slot.capture_frame().is_ok());
    }

    #[test]
    fn test_capture_wakes_on_submit() {
        let slot = Arc::new(FrameSlot::new(Duration::from_secs(5)));
        let pusher = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                slot.submit(scene(20, 10, &[]));
            })
        };

        let frame = slot.capture_frame().unwrap();
        assert_eq!(frame.dimensions(), (20, 10));
        pusher.join().unwrap();
    }

    /// Wait for the engine side to queue a gesture, as the service would
    fn next_dispatch(queue: &GestureQueue) -> Dispatch {
        for _ in 0..5000 {
            if let Some(dispatch) = queue.poll() {
                return dispatch;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("no gesture queued");
    }

    fn spawn_tap(queue: &Arc<GestureQueue>, point: Point) -> std::thread::JoinHandle<bool> {
        let queue = Arc::clone(queue);
        std::thread::spawn(move || queue.tap(point, Duration::from_millis(100)))
    }

    #[test]
    fn test_tap_waits_for_confirmation() {
        let queue = Arc::new(GestureQueue::new(4, Duration::from_secs(5)));
        let engine = spawn_tap(&queue, Point::new(1, 2));

        let dispatch = next_dispatch(&queue);
        assert_eq!(
            dispatch.gesture,
            Gesture::Tap {
                x: 1,
                y: 2,
                duration_ms: 100
            }
        );
        assert!(!engine.is_finished());

        assert!(queue.complete(dispatch.id, true));
        assert!(engine.join().unwrap());
    }

    #[test]
    fn test_rejected_gesture_fails_the_action() {
        let queue = Arc::new(GestureQueue::new(4, Duration::from_secs(5)));
        let engine = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                queue.swipe(
                    &[Point::new(0, 0), Point::new(0, 50)],
                    Duration::from_millis(300),
                )
            })
        };

        let dispatch = next_dispatch(&queue);
        assert!(matches!(dispatch.gesture, Gesture::Swipe { .. }));
        queue.complete(dispatch.id, false);

        assert!(!engine.join().unwrap());
    }

    #[test]
    fn test_unconfirmed_gesture_times_out() {
        let queue = GestureQueue::new(4, Duration::from_millis(20));

        let started = std::time::Instant::now();
        assert!(!queue.tap(Point::new(5, 5), Duration::from_millis(10)));
        assert!(started.elapsed() >= Duration::from_millis(30));

        // withdrawn from the queue, and a late confirmation is ignored
        assert!(queue.is_empty());
        assert!(!queue.complete(1, true));
    }

    #[test]
    fn test_full_queue_refuses_immediately() {
        let queue = Arc::new(GestureQueue::new(1, Duration::from_secs(5)));
        let engine = spawn_tap(&queue, Point::new(1, 1));
        while queue.is_empty() {
            std::thread::sleep(Duration::from_millis(1));
        }

        assert!(!queue.tap(Point::new(2, 2), Duration::from_millis(100)));
        assert_eq!(queue.len(), 1);

        let dispatch = next_dispatch(&queue);
        queue.complete(dispatch.id, true);
        assert!(engine.join().unwrap());
    }

    #[test]
    fn test_frame_from_before_confirmation_is_stale() {
        let slot = Arc::new(FrameSlot::new(Duration::from_millis(20)));
        let queue = Arc::new(
            GestureQueue::new(4, Duration::from_secs(5)).with_frames(Arc::clone(&slot)),
        );
        slot.submit(scene(16, 16, &[]));

        let engine = spawn_tap(&queue, Point::new(8, 8));
        let dispatch = next_dispatch(&queue);
        slot.submit(scene(20, 10, &[]));
        queue.complete(dispatch.id, true);
        assert!(engine.join().unwrap());

        assert_eq!(slot.capture_frame().unwrap_err(), CaptureError::TimedOut);

        slot.submit(scene(24, 12, &[]));
        assert_eq!(slot.capture_frame().unwrap().dimensions(), (24, 12));
    }

    #[test]
    fn test_dispatch_json() {
        let json = serde_json::to_value(Dispatch {
            id: 3,
            gesture: Gesture::Tap {
                x: 10,
                y: 20,
                duration_ms: 80,
            },
        })
        .unwrap();

        assert_eq!(json["id"], 3);
        assert_eq!(json["type"], "tap");
        assert_eq!(json["x"], 10);
        assert_eq!(json["duration_ms"], 80);
    }
}
