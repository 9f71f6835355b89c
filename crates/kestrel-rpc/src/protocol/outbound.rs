//! Outbound side of a connection.
//!
//! Connection loops never await the socket. Frames are pushed onto an
//! [`Outbound`] backlog and handed one at a time to a writer future through a
//! short bounded queue. The loop polls the writer future as one more
//! `select!` branch, so a peer that stops reading stalls the writer but never
//! the loop's reads, deadlines or shutdown handling.

use std::collections::VecDeque;
use std::future::Future;

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio_util::codec::FramedWrite;

use super::frame::{Frame, FrameCodec};
use crate::error::{Result, RpcError};

/// Frames handed to the writer but not yet encoded.
const WRITE_QUEUE_DEPTH: usize = 32;

/// Frames waiting to be written.
pub(crate) struct Outbound {
    frames: mpsc::Sender<Frame>,
    backlog: VecDeque<Frame>,
    max_frame_size: usize,
}

impl Outbound {
    /// Queue `frame` behind everything not yet handed to the writer.
    ///
    /// Frames over the size limit are refused here and never reach the wire.
    pub fn push(&mut self, frame: Frame) -> Result<()> {
        let size = frame.body_len();
        if size > self.max_frame_size {
            return Err(RpcError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        self.backlog.push_back(frame);
        Ok(())
    }

    /// True when every queued frame was handed to the writer.
    pub fn is_idle(&self) -> bool {
        self.backlog.is_empty()
    }

    /// Wait for room in the writer queue.
    pub async fn ready(&self) -> Result<OwnedPermit<Frame>> {
        self.frames
            .clone()
            .reserve_owned()
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Hand the oldest frame `keep` accepts to the writer.
    ///
    /// Frames `keep` rejects on the way are discarded.
    pub fn forward(&mut self, permit: OwnedPermit<Frame>, mut keep: impl FnMut(&Frame) -> bool) {
        while let Some(frame) = self.backlog.pop_front() {
            if keep(&frame) {
                permit.send(frame);
                return;
            }
        }
    }
}

/// Split the write half of a connection into an [`Outbound`] queue and the
/// future that drains it.
///
/// The future ends with `Ok` once the `Outbound` is dropped and every frame
/// it forwarded was flushed, or with the first write error.
pub(crate) fn outbound<W>(write_half: W, max_frame_size: usize) -> (Outbound, impl Future<Output = Result<()>>)
where
    W: AsyncWrite + Unpin,
{
    let (frames, mut queue) = mpsc::channel::<Frame>(WRITE_QUEUE_DEPTH);
    let mut writer = FramedWrite::new(write_half, FrameCodec::new(max_frame_size));

    let drain = async move {
        while let Some(frame) = queue.recv().await {
            writer.feed(frame).await?;
            while let Ok(frame) = queue.try_recv() {
                writer.feed(frame).await?;
            }
            writer.flush().await?;
        }
        Ok::<(), RpcError>(())
    };

    (
        Outbound {
            frames,
            backlog: VecDeque::new(),
            max_frame_size,
        },
        drain,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TypeTag;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    #[tokio::test]
    async fn test_forwarded_frames_reach_the_wire_in_order() {
        let (write_io, read_io) = tokio::io::duplex(1024);
        let (mut outbound, writer) = outbound(write_io, 1024);
        let writer = tokio::spawn(writer);

        for id in 1..=3 {
            outbound.push(Frame::new(id, TypeTag(2), "x")).unwrap();
        }
        while !outbound.is_idle() {
            let permit = outbound.ready().await.unwrap();
            outbound.forward(permit, |frame| frame.correlation_id != 2);
        }
        drop(outbound);
        writer.await.unwrap().unwrap();

        let ids: Vec<u32> = FramedRead::new(read_io, FrameCodec::new(1024))
            .map(|frame| frame.unwrap().correlation_id)
            .collect()
            .await;
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_oversized_frame_refused_before_queueing() {
        let (write_io, _read_io) = tokio::io::duplex(64);
        let (mut outbound, _writer) = outbound(write_io, 16);
        let result = outbound.push(Frame::new(1, TypeTag(2), vec![0u8; 32]));
        assert!(matches!(result, Err(RpcError::FrameTooLarge { max: 16, .. })));
        assert!(outbound.is_idle());
    }
}
