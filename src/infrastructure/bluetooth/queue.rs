//! Command Queue
//!
//! Serializes configuration writes: at most one command is submitted to the
//! transport and awaiting acknowledgement at any time.

use crate::infrastructure::bluetooth::protocol::{hex_preview, Channel};
use crate::infrastructure::bluetooth::transport::Transport;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// One queued write, immutable once enqueued
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCommand {
    pub channel: Channel,
    pub payload: Vec<u8>,
}

/// Single-flight FIFO of [`WriteCommand`]s
#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: VecDeque<WriteCommand>,
    in_flight: Option<Channel>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail. Payload size is the caller's concern.
    pub fn enqueue(&mut self, channel: Channel, payload: impl Into<Vec<u8>>) {
        self.pending.push_back(WriteCommand {
            channel,
            payload: payload.into(),
        });
    }

    /// Drop everything pending and release the busy slot.
    ///
    /// A write already submitted stays outstanding at the transport. If
    /// [`start`](Self::start) follows before its completion arrives, two
    /// writes are in the air and that earlier completion is credited to the
    /// new head. There is no per-write timeout to tell them apart.
    pub fn clear(&mut self) {
        if !self.pending.is_empty() || self.in_flight.is_some() {
            debug!(
                "Clearing write queue ({} pending, in flight: {:?})",
                self.pending.len(),
                self.in_flight
            );
        }
        self.pending.clear();
        self.in_flight = None;
    }

    /// Submit the head command unless one is already in flight.
    ///
    /// Returns `true` if a command is awaiting acknowledgement afterwards.
    pub fn start<T: Transport + ?Sized>(&mut self, transport: &mut T) -> bool {
        if self.in_flight.is_some() {
            return true;
        }
        self.submit_next(transport)
    }

    /// Completion callback; call exactly once per transport write completion,
    /// whatever its status.
    ///
    /// Returns `true` when this completion drained the queue, which is the
    /// only point where a whole batch counts as applied.
    pub fn on_write_complete<T: Transport + ?Sized>(&mut self, transport: &mut T) -> bool {
        let Some(channel) = self.in_flight.take() else {
            debug!("Write completion with nothing in flight, ignoring");
            return false;
        };
        debug!("Write on {:?} acknowledged", channel);
        !self.submit_next(transport)
    }

    /// True while a command awaits acknowledgement or unsent commands remain
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some() || !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight(&self) -> Option<Channel> {
        self.in_flight
    }

    fn submit_next<T: Transport + ?Sized>(&mut self, transport: &mut T) -> bool {
        while let Some(cmd) = self.pending.pop_front() {
            let ok = transport.write(cmd.channel, &cmd.payload);
            debug!(
                "Write submitted channel={:?} len={} ok={} firstBytes={}",
                cmd.channel,
                cmd.payload.len(),
                ok,
                hex_preview(&cmd.payload)
            );
            if ok {
                self.in_flight = Some(cmd.channel);
                return true;
            }
            // No completion will ever arrive for a rejected submission
            warn!("Transport rejected write on {:?}, skipping", cmd.channel);
        }
        false
    }
}
