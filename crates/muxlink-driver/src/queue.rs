use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use muxlink_proto::{ChannelId, ControlFrame, PacketId};

/// One queued data send: destination channel, its process-unique id, and
/// the opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub channel: ChannelId,
    pub packet: PacketId,
    pub payload: Bytes,
}

/// The frame currently being written, or about to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Control(ControlFrame),
    Data(Packet),
}

/// Outbound FIFOs with control priority and a single in-flight frame.
///
/// The hot "is something being written" check is an atomic flag so a
/// completion never contends with a producer mid-push; the FIFOs
/// themselves sit behind one mutex. Enqueue from any thread; claiming and
/// completing frames is driven by the connection's event thread.
pub struct SendQueue {
    in_flight: AtomicBool,
    inner: Mutex<Inner>,
}

struct Inner {
    control: VecDeque<ControlFrame>,
    data: VecDeque<Packet>,
    current: Option<Outbound>,
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            in_flight: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                control: VecDeque::new(),
                data: VecDeque::new(),
                current: None,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("send queue poisoned")
    }

    pub fn push_control(&self, frame: ControlFrame) {
        self.inner().control.push_back(frame);
    }

    pub fn push_data(&self, packet: Packet) {
        self.inner().data.push_back(packet);
    }

    /// Claim the next frame to write, if no write is in flight.
    ///
    /// Control frames always drain ahead of data, but only one frame total
    /// is current at a time — a burst of queued data delays a control
    /// reply by at most the one write already in flight.
    pub fn begin(&self) -> Option<Outbound> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let mut inner = self.inner();
        let next = if let Some(frame) = inner.control.pop_front() {
            Some(Outbound::Control(frame))
        } else {
            inner.data.pop_front().map(Outbound::Data)
        };

        match next {
            Some(out) => {
                inner.current = Some(out.clone());
                Some(out)
            }
            None => {
                // Release the flag inside the lock so a concurrent push
                // cannot observe "in flight" with nothing current.
                self.in_flight.store(false, Ordering::Release);
                None
            }
        }
    }

    /// Mark the in-flight write finished and hand back what was written.
    pub fn complete(&self) -> Option<Outbound> {
        let mut inner = self.inner();
        let done = inner.current.take();
        self.in_flight.store(false, Ordering::Release);
        done
    }

    /// Discard queued data packets for one channel (handshake denied).
    pub fn drop_channel(&self, channel: ChannelId) -> Vec<Packet> {
        let mut inner = self.inner();
        let mut dropped = Vec::new();
        inner.data.retain(|p| {
            if p.channel == channel {
                dropped.push(p.clone());
                false
            } else {
                true
            }
        });
        dropped
    }

    /// Discard everything (connection teardown). Returns the failed
    /// packets so the driver can report them as a disconnect.
    pub fn clear(&self) -> Vec<Packet> {
        let mut inner = self.inner();
        inner.control.clear();
        let mut failed: Vec<Packet> = inner.data.drain(..).collect();
        if let Some(Outbound::Data(p)) = inner.current.take() {
            failed.insert(0, p);
        }
        self.in_flight.store(false, Ordering::Release);
        failed
    }

    /// True when nothing is queued or in flight.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner();
        inner.control.is_empty() && inner.data.is_empty() && inner.current.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(channel: ChannelId, packet: PacketId, payload: &'static [u8]) -> Packet {
        Packet {
            channel,
            packet,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn control_drains_ahead_of_data() {
        let queue = SendQueue::new();
        queue.push_data(packet(1, 1, b"data"));
        queue.push_control(ControlFrame::Allow { channel: 1 });

        assert_eq!(
            queue.begin(),
            Some(Outbound::Control(ControlFrame::Allow { channel: 1 }))
        );
        queue.complete();

        assert_eq!(queue.begin(), Some(Outbound::Data(packet(1, 1, b"data"))));
    }

    #[test]
    fn only_one_frame_in_flight() {
        let queue = SendQueue::new();
        queue.push_data(packet(1, 1, b"a"));
        queue.push_data(packet(1, 2, b"b"));

        assert!(queue.begin().is_some());
        // Second claim must fail until the first write completes.
        assert!(queue.begin().is_none());

        queue.complete();
        assert!(matches!(
            queue.begin(),
            Some(Outbound::Data(Packet { packet: 2, .. }))
        ));
    }

    #[test]
    fn control_waits_for_inflight_data_but_preempts_queued() {
        let queue = SendQueue::new();
        queue.push_data(packet(1, 1, b"first"));
        queue.push_data(packet(1, 2, b"second"));

        assert!(matches!(
            queue.begin(),
            Some(Outbound::Data(Packet { packet: 1, .. }))
        ));

        // Control arrives while packet 1 is on the wire.
        queue.push_control(ControlFrame::Ack {
            channel: 1,
            packet: 9,
        });

        queue.complete();
        // Exactly one in-flight write of delay, then control goes first.
        assert!(matches!(queue.begin(), Some(Outbound::Control(_))));
        queue.complete();
        assert!(matches!(
            queue.begin(),
            Some(Outbound::Data(Packet { packet: 2, .. }))
        ));
    }

    #[test]
    fn complete_returns_what_was_written() {
        let queue = SendQueue::new();
        queue.push_data(packet(3, 7, b"tracked"));

        queue.begin();
        assert_eq!(queue.complete(), Some(Outbound::Data(packet(3, 7, b"tracked"))));
        assert_eq!(queue.complete(), None);
    }

    #[test]
    fn drop_channel_removes_only_that_channel() {
        let queue = SendQueue::new();
        queue.push_data(packet(1, 1, b"keep"));
        queue.push_data(packet(2, 2, b"drop"));
        queue.push_data(packet(2, 3, b"drop"));
        queue.push_data(packet(1, 4, b"keep"));

        let dropped = queue.drop_channel(2);
        assert_eq!(dropped.len(), 2);

        assert!(matches!(
            queue.begin(),
            Some(Outbound::Data(Packet { packet: 1, .. }))
        ));
        queue.complete();
        assert!(matches!(
            queue.begin(),
            Some(Outbound::Data(Packet { packet: 4, .. }))
        ));
    }

    #[test]
    fn clear_fails_everything_including_current() {
        let queue = SendQueue::new();
        queue.push_data(packet(1, 1, b"inflight"));
        queue.push_data(packet(1, 2, b"queued"));
        queue.push_control(ControlFrame::Allow { channel: 1 });

        // A control frame goes first; claim it so packet 1 stays queued
        // and then claim packet 1 to put it in flight.
        assert!(matches!(queue.begin(), Some(Outbound::Control(_))));
        queue.complete();
        assert!(matches!(queue.begin(), Some(Outbound::Data(_))));

        let failed = queue.clear();
        let ids: Vec<PacketId> = failed.iter().map(|p| p.packet).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(queue.is_idle());
        assert!(queue.begin().is_none());
    }

    #[test]
    fn concurrent_producers_do_not_corrupt_the_queue() {
        use std::sync::Arc;

        let queue = Arc::new(SendQueue::new());
        let per_thread = 200u32;

        let producers: Vec<_> = [1u32, 2u32]
            .into_iter()
            .map(|channel| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..per_thread {
                        queue.push_data(Packet {
                            channel,
                            packet: channel * 1_000 + i,
                            payload: Bytes::from(vec![channel as u8; 8]),
                        });
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        // Drain like the event thread would: claim, complete, repeat.
        let mut per_channel: std::collections::HashMap<ChannelId, Vec<PacketId>> =
            Default::default();
        let mut total_bytes = 0usize;
        while let Some(out) = queue.begin() {
            if let Outbound::Data(p) = out {
                total_bytes += p.payload.len();
                per_channel.entry(p.channel).or_default().push(p.packet);
            }
            queue.complete();
        }

        assert_eq!(total_bytes, 2 * per_thread as usize * 8);
        for (channel, ids) in per_channel {
            assert_eq!(ids.len(), per_thread as usize);
            // Enqueue order per channel is preserved.
            let mut sorted = ids.clone();
            sorted.sort_unstable();
            assert_eq!(ids, sorted, "channel {channel} reordered");
        }
    }
}
