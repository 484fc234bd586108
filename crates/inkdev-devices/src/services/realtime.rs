/*!
 * Real-time ink service.
 *
 * While started, every pen sample the device reports is transformed into
 * caller space and delivered to subscribers in arrival order. Hover samples
 * are delivered only when hover reporting was requested at start.
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use inkdev_core::event::{EventHub, Subscription};

use super::{RunState, ServiceContext};
use crate::error::Result;
use crate::ink::InkSample;
use crate::link::Command;
use crate::transform::Matrix;

/// Something the real-time stream delivered
#[derive(Debug, Clone, PartialEq)]
pub enum RealTimeEvent {
    /// A sample with the pen on the surface, or the pen going up or down
    Point(InkSample),
    /// A sample with the pen in proximity
    Hover(InkSample),
    /// The user started a new page on the device
    NewPage,
}

#[derive(Debug)]
struct RealTimeInner {
    ctx: ServiceContext,
    state: RunState,
    hover: AtomicBool,
    transform: RwLock<Matrix>,
    events: EventHub<RealTimeEvent>,
}

/// Stream pen samples while the pen is in use
#[derive(Debug, Clone)]
pub struct RealTimeInkService {
    inner: Arc<RealTimeInner>,
}

impl RealTimeInkService {
    pub(crate) fn new(ctx: ServiceContext) -> Self {
        Self {
            inner: Arc::new(RealTimeInner {
                ctx,
                state: RunState::default(),
                hover: AtomicBool::new(false),
                transform: RwLock::new(Matrix::IDENTITY),
                events: EventHub::new("realtime-ink"),
            }),
        }
    }

    /// Whether the stream is running
    pub fn is_started(&self) -> bool {
        self.inner.state.is_started()
    }

    /// Whether hover samples are being delivered
    pub fn hover_enabled(&self) -> bool {
        self.inner.hover.load(Ordering::SeqCst)
    }

    /// Start streaming without hover samples
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        self.start_with_hover(false, cancel).await
    }

    /// Start streaming; fails with `InvalidState` if already started
    pub async fn start_with_hover(&self, hover: bool, cancel: &CancellationToken) -> Result<()> {
        let inner = &self.inner;
        inner
            .state
            .start("Real-time ink", || async {
                inner
                    .ctx
                    .execute(Command::StartRealTime { hover }, cancel)
                    .await?;
                inner.hover.store(hover, Ordering::SeqCst);
                Ok(())
            })
            .await?;
        info!("{}: real-time ink started (hover: {})", inner.ctx.device_id, hover);
        Ok(())
    }

    /// Stop streaming; fails with `InvalidState` if not started
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        let inner = &self.inner;
        inner
            .state
            .stop("Real-time ink", || async {
                inner.ctx.execute(Command::StopRealTime, cancel).await?;
                Ok(())
            })
            .await?;
        info!("{}: real-time ink stopped", inner.ctx.device_id);
        Ok(())
    }

    /// Receive samples and page events
    pub fn subscribe(&self) -> Subscription<RealTimeEvent> {
        self.inner.events.subscribe()
    }

    /// Transform applied to every sample position
    pub fn transform(&self) -> Matrix {
        self.inner
            .transform
            .read()
            .map(|m| *m)
            .unwrap_or(Matrix::IDENTITY)
    }

    /// Replace the transform; applies to samples delivered from now on
    pub fn set_transform(&self, matrix: Matrix) {
        match self.inner.transform.write() {
            Ok(mut m) => *m = matrix,
            Err(poisoned) => *poisoned.into_inner() = matrix,
        }
    }

    /// Route a sample from the device
    pub(crate) fn dispatch_sample(&self, sample: InkSample) {
        if !self.is_started() {
            trace!("Dropping sample while real-time ink is stopped");
            return;
        }
        let transformed = InkSample {
            phase: sample.phase,
            point: sample.point.transformed(&self.transform()),
        };
        let event = if transformed.is_hover() {
            if !self.hover_enabled() {
                return;
            }
            RealTimeEvent::Hover(transformed)
        } else {
            RealTimeEvent::Point(transformed)
        };
        self.inner.events.publish(event);
    }

    /// Route a new page notification from the device
    pub(crate) fn dispatch_new_page(&self) {
        if self.is_started() {
            self.inner.events.publish(RealTimeEvent::NewPage);
        }
    }

    pub(crate) async fn shutdown(&self) -> Result<()> {
        if self.inner.state.force_stopped() {
            debug!("{}: stopping real-time ink on close", self.inner.ctx.device_id);
            self.inner.ctx.execute_on_close(Command::StopRealTime).await?;
        }
        self.inner.events.close();
        Ok(())
    }
}

/// Counts samples lost between consecutive sequence numbers
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last: Option<u32>,
    dropped: u64,
}

impl SequenceTracker {
    /// Create a tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sequence number; returns how many were skipped before it
    pub fn observe(&mut self, sequence: u32) -> u32 {
        let gap = match self.last {
            Some(last) => sequence.wrapping_sub(last).wrapping_sub(1),
            None => 0,
        };
        // A repeat or out of order number is not a drop
        let gap = if gap >= u32::MAX / 2 { 0 } else { gap };
        self.last = Some(sequence);
        self.dropped += u64::from(gap);
        gap
    }

    /// Record a sample; samples without a sequence number are ignored
    pub fn observe_sample(&mut self, sample: &InkSample) -> u32 {
        sample.point.sequence.map_or(0, |s| self.observe(s))
    }

    /// Total skipped so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Forget history
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_gaps() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.observe(10), 0);
        assert_eq!(tracker.observe(11), 0);
        assert_eq!(tracker.observe(14), 2);
        assert_eq!(tracker.observe(14), 0);
        assert_eq!(tracker.observe(12), 0);
        assert_eq!(tracker.dropped(), 2);

        tracker.reset();
        assert_eq!(tracker.observe(u32::MAX), 0);
        assert_eq!(tracker.observe(1), 1);
    }
}
