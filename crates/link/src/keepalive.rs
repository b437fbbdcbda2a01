//! Periodic IPA ping/pong supervision of one channel.

use std::time::Duration;

use bytes::Bytes;
use codec::frame::{self, IpaMessage};
use tokio::{
    sync::mpsc::{UnboundedSender, unbounded_channel},
    task::JoinHandle,
    time::{sleep, timeout},
};

#[derive(Debug, Clone, Copy)]
pub struct KeepaliveParams {
    pub interval: Duration,
    pub wait_for_resp: Duration,
}

impl Default for KeepaliveParams {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            wait_for_resp: Duration::from_secs(10),
        }
    }
}

/// Supervises one channel: a PING every `interval`, and if no PONG shows
/// up within `wait_for_resp` a single timeout signal to the parent, after
/// which the supervisor is done. A received PONG arms the next cycle.
pub struct Keepalive {
    pong: UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl Keepalive {
    /// Binds a supervisor to an outbound byte channel. `expired` is the
    /// parent's timeout signal.
    pub fn start(
        params: KeepaliveParams,
        outbound: UnboundedSender<Bytes>,
        expired: UnboundedSender<()>,
    ) -> Self {
        let (pong, mut pong_rx) = unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                sleep(params.interval).await;

                // pongs from a previous cycle must not satisfy this one.
                while pong_rx.try_recv().is_ok() {}

                if outbound
                    .send(frame::encode_ipaccess(IpaMessage::Ping))
                    .is_err()
                {
                    // writer gone, the channel teardown path is already
                    // running.
                    return;
                }

                match timeout(params.wait_for_resp, pong_rx.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => {
                        log::debug!("keepalive expired after {:?}", params.wait_for_resp);
                        let _ = expired.send(());
                        return;
                    }
                }
            }
        });

        Self { pong, task }
    }

    /// Feeds a received PONG to the supervisor.
    pub fn pong(&self) {
        let _ = self.pong.send(());
    }

    /// Stops the supervisor. Idempotent.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.task.abort();
    }
}
