//! ## RSPRO link plumbing
//!
//! The pieces both ends of a control channel share: the writer task that
//! owns the write half of a stream (everything else holds only a byte
//! channel into it, so a channel handle can always outlive the peer that
//! spawned it), the frame reassembly loop, and the keepalive supervisor.

pub mod keepalive;

use bytes::{Bytes, BytesMut};
use codec::frame::Frame;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc::{UnboundedSender, unbounded_channel},
};

/// Spawns the task owning the write half of a stream.
///
/// Senders are cheap clones; the task ends once every sender is gone or
/// the peer stops reading.
pub fn spawn_writer<W>(mut writer: W) -> UnboundedSender<Bytes>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (sender, mut receiver) = unbounded_channel::<Bytes>();

    tokio::spawn(async move {
        while let Some(bytes) = receiver.recv().await {
            if let Err(e) = writer.write_all(&bytes).await {
                log::debug!("link writer closed: err={}", e);
                break;
            }
        }
    });

    sender
}

/// Reads the next complete frame off the stream.
///
/// `Ok(None)` means the transport is gone (clean close or error, the
/// caller reacts the same way); `Err` is a framing violation that must
/// tear the channel down. Short reads are reassembled in `buf`.
pub async fn read_frame<R>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<Option<Frame>, codec::Error>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = Frame::parse(buf)? {
            return Ok(Some(frame));
        }

        match reader.read_buf(buf).await {
            Ok(0) => return Ok(None),
            Ok(_) => continue,
            Err(e) => {
                log::debug!("link read failed: err={}", e);
                return Ok(None);
            }
        }
    }
}
