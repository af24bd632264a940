//! Fixed-cadence audio framing for the recognition uplink.

use crate::pool::ConnectionSender;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use voxrelay_types::AudioFrame;

/// Cuts `buf` into ordered frames of `frame_size` bytes; only the last frame
/// may be shorter.
pub fn split_frames(buf: &[u8], frame_size: usize) -> Vec<AudioFrame> {
    if frame_size == 0 {
        return Vec::new();
    }
    buf.chunks(frame_size)
        .enumerate()
        .map(|(index, chunk)| AudioFrame {
            index,
            payload: chunk.to_vec(),
        })
        .collect()
}

/// Sends `buf` as paced binary frames, sleeping `interval` between frames
/// but not after the last one.
///
/// Returns the number of frames delivered. Stops early, without error, if the
/// destination closes.
pub async fn send_paced(
    buf: &[u8],
    frame_size: usize,
    interval: Duration,
    sender: &ConnectionSender,
) -> usize {
    let frames = split_frames(buf, frame_size);
    let count = frames.len();
    for frame in frames {
        let index = frame.index;
        if let Err(e) = sender.send_binary(frame.payload).await {
            tracing::debug!(
                conn_id = sender.conn_id(),
                dropped = count - index,
                "destination closed mid-buffer; dropping remaining frames: {}",
                e
            );
            return index;
        }
        if index + 1 < count {
            tokio::time::sleep(interval).await;
        }
    }
    count
}

/// Per-session pacing task.
///
/// Buffers submitted with [`FrameScheduler::submit`] are framed and sent in
/// submission order; frames from different buffers never interleave. The
/// task stops when the scheduler is cancelled or dropped.
#[derive(Debug)]
pub struct FrameScheduler {
    queue: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
    stopped: bool,
}

impl FrameScheduler {
    pub fn spawn(sender: ConnectionSender, frame_size: usize, interval: Duration) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let task = tokio::spawn(async move {
            while let Some(buf) = rx.recv().await {
                let total = buf.len().div_ceil(frame_size.max(1));
                let sent = send_paced(&buf, frame_size, interval, &sender).await;
                tracing::trace!(conn_id = sender.conn_id(), bytes = buf.len(), sent, "paced audio buffer");
                if sent < total {
                    break;
                }
            }
        });
        Self {
            queue,
            task,
            stopped: false,
        }
    }

    /// Queues a buffer for pacing. Returns `false` if the scheduler has
    /// stopped.
    pub fn submit(&self, buf: Vec<u8>) -> bool {
        if buf.is_empty() {
            return !self.task.is_finished();
        }
        self.queue.send(buf).is_ok()
    }

    /// Stops pacing immediately; queued and in-flight frames are dropped.
    pub fn cancel(self) {
        self.task.abort();
    }

    /// Accepts no further buffers. Whatever is already queued still goes
    /// out; [`FrameScheduler::finished`] resolves after the last frame.
    pub fn close(&mut self) {
        let (closed, _) = mpsc::unbounded_channel();
        drop(std::mem::replace(&mut self.queue, closed));
    }

    /// Resolves once the pacing task has stopped, either after
    /// [`FrameScheduler::close`] and the last queued frame or because the
    /// destination went away. Safe to poll from `select!` and to call again.
    pub async fn finished(&mut self) {
        if self.stopped {
            return;
        }
        if let Err(e) = (&mut self.task).await {
            tracing::debug!("frame pacing task ended abnormally: {}", e);
        }
        self.stopped = true;
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{VendorChannel, VendorMessage};
    use tokio::time::Instant;
    use voxrelay_types::{FRAME_BYTES, FRAME_INTERVAL};

    #[test]
    fn split_frames_covers_buffer_exactly() {
        for len in [0usize, 1, 1279, 1280, 1281, 2560, 4000, 12_345] {
            let buf: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let frames = split_frames(&buf, FRAME_BYTES);

            assert_eq!(frames.len(), len.div_ceil(FRAME_BYTES), "len={}", len);
            for (i, frame) in frames.iter().enumerate() {
                assert_eq!(frame.index, i);
                if i + 1 < frames.len() {
                    assert_eq!(frame.payload.len(), FRAME_BYTES);
                } else {
                    assert!(frame.payload.len() <= FRAME_BYTES && !frame.payload.is_empty());
                }
            }
            let joined: Vec<u8> = frames.into_iter().flat_map(|f| f.payload).collect();
            assert_eq!(joined, buf);
        }
    }

    #[test]
    fn zero_frame_size_yields_nothing() {
        assert!(split_frames(&[1, 2, 3], 0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn paced_frames_are_spaced_by_interval() {
        let (channel, mut remote) = VendorChannel::in_memory();
        let sender = ConnectionSender::new(1, channel.outgoing);

        let start = Instant::now();
        let handle = tokio::spawn(async move {
            send_paced(&[0u8; 4000], FRAME_BYTES, FRAME_INTERVAL, &sender).await
        });

        let mut arrivals = Vec::new();
        for _ in 0..4 {
            match remote.sent.recv().await {
                Some(VendorMessage::Binary(bytes)) => arrivals.push((bytes.len(), start.elapsed())),
                other => panic!("Expected binary frame, got {:?}", other),
            }
        }
        assert_eq!(handle.await.unwrap(), 4);

        let sizes: Vec<usize> = arrivals.iter().map(|(len, _)| *len).collect();
        assert_eq!(sizes, vec![1280, 1280, 1280, 160]);
        for (i, (_, at)) in arrivals.iter().enumerate() {
            assert_eq!(*at, FRAME_INTERVAL * i as u32);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn closed_destination_stops_silently() {
        let (channel, remote) = VendorChannel::in_memory();
        let sender = ConnectionSender::new(7, channel.outgoing);
        drop(remote);

        assert_eq!(send_paced(&[0u8; 4000], FRAME_BYTES, FRAME_INTERVAL, &sender).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_keeps_buffers_in_submission_order() {
        let (channel, mut remote) = VendorChannel::in_memory();
        let scheduler = FrameScheduler::spawn(
            ConnectionSender::new(1, channel.outgoing),
            FRAME_BYTES,
            FRAME_INTERVAL,
        );

        assert!(scheduler.submit(vec![1u8; 2000]));
        assert!(scheduler.submit(vec![2u8; 100]));

        let mut frames = Vec::new();
        for _ in 0..3 {
            match remote.sent.recv().await {
                Some(VendorMessage::Binary(bytes)) => frames.push(bytes),
                other => panic!("Expected binary frame, got {:?}", other),
            }
        }
        assert_eq!(frames[0], vec![1u8; 1280]);
        assert_eq!(frames[1], vec![1u8; 720]);
        assert_eq!(frames[2], vec![2u8; 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_lets_queued_frames_finish() {
        let (channel, mut remote) = VendorChannel::in_memory();
        let mut scheduler = FrameScheduler::spawn(
            ConnectionSender::new(1, channel.outgoing),
            FRAME_BYTES,
            FRAME_INTERVAL,
        );
        scheduler.submit(vec![0u8; 4000]);

        let start = Instant::now();
        scheduler.close();
        assert!(!scheduler.submit(vec![1u8; 10]), "closed scheduler takes no audio");
        scheduler.finished().await;
        assert_eq!(start.elapsed(), FRAME_INTERVAL * 3);
        // Resolves again without touching the finished task.
        scheduler.finished().await;

        let mut sizes = Vec::new();
        while let Some(VendorMessage::Binary(bytes)) = remote.sent.recv().await {
            sizes.push(bytes.len());
        }
        assert_eq!(sizes, vec![1280, 1280, 1280, 160]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_within_one_interval() {
        let (channel, mut remote) = VendorChannel::in_memory();
        let scheduler = FrameScheduler::spawn(
            ConnectionSender::new(1, channel.outgoing),
            FRAME_BYTES,
            FRAME_INTERVAL,
        );
        scheduler.submit(vec![0u8; FRAME_BYTES * 10]);

        assert!(matches!(remote.sent.recv().await, Some(VendorMessage::Binary(_))));
        scheduler.cancel();
        tokio::time::sleep(FRAME_INTERVAL * 2).await;

        // The writer side is dropped with the aborted task, so the queue
        // drains to `None` without further frames.
        assert_eq!(remote.sent.recv().await, None);
    }
}
