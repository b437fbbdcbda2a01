//! ## remsim-server client library
//!
//! The supervised control-channel connection used by SIM-client and
//! SIM-bank programs to reach the central server. A [`Connection`] owns
//! one background task that dials the server, runs the identity
//! handshake for the configured role, keeps the channel alive with IPA
//! ping/pong, and re-establishes with a staged backoff whenever the
//! channel is lost.
//!
//! ```no_run
//! use remsim_server_sdk::{Connection, ConnectionHandler, ConnectionOptions, PeerRole};
//! use codec::message::{ClientSlot, ComponentIdentity, ComponentType, RsproPdu};
//!
//! struct Handler;
//!
//! impl ConnectionHandler for Handler {
//!     fn on_connected(&self) {
//!         println!("control channel up");
//!     }
//!
//!     fn on_pdu(&self, pdu: RsproPdu) {
//!         println!("rx {}", pdu.name());
//!     }
//! }
//!
//! let connection = Connection::new(
//!     ConnectionOptions {
//!         server_host: "10.0.0.1".to_string(),
//!         server_port: 9998,
//!         identity: ComponentIdentity {
//!             kind: ComponentType::Client,
//!             name: "modem0".to_string(),
//!             sw_version: env!("CARGO_PKG_VERSION").to_string(),
//!             hw_version: "unknown".to_string(),
//!         },
//!         role: PeerRole::Client {
//!             slot: Some(ClientSlot { client_id: 7, slot_nr: 0 }),
//!         },
//!     },
//!     Handler,
//! );
//!
//! connection.establish();
//! ```

mod backoff;

pub use backoff::{T_HANDSHAKE, T_TCP_CONNECT};

use std::sync::Arc;

use bytes::BytesMut;
use codec::{
    frame::{self, Frame, IpaMessage},
    message::{ClientSlot, ComponentIdentity, ResultCode, RsproPdu},
};
use link::keepalive::{Keepalive, KeepaliveParams};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
        watch,
    },
    time::{Instant, sleep, sleep_until, timeout},
};

use crate::backoff::Backoff;

/// The role announced to the server during the handshake.
#[derive(Debug, Clone)]
pub enum PeerRole {
    Client { slot: Option<ClientSlot> },
    Bank { bank_id: u16, num_slots: u16 },
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub server_host: String,
    pub server_port: u16,
    pub identity: ComponentIdentity,
    pub role: PeerRole,
}

/// Callbacks driven by the connection task.
///
/// `on_connected`/`on_disconnected` frame the period in which
/// [`Connection::send`] is accepted; `on_pdu` delivers every RSPRO
/// message received while connected.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_connected(&self) {}

    fn on_disconnected(&self) {}

    fn on_pdu(&self, pdu: RsproPdu) {
        let _ = pdu;
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    /// The channel is not in the connected state; the PDU was dropped.
    NotConnected,
}

impl std::error::Error for SendError {}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

enum Control {
    Establish,
    Disconnect,
    Tx(RsproPdu),
}

/// Handle to one supervised control channel.
///
/// Dropping the handle tears the channel down.
pub struct Connection {
    control: UnboundedSender<Control>,
    connected: watch::Receiver<bool>,
}

impl Connection {
    pub fn new<H>(options: ConnectionOptions, handler: H) -> Self
    where
        H: ConnectionHandler,
    {
        let (control, control_rx) = unbounded_channel();
        let (connected_tx, connected) = watch::channel(false);

        tokio::spawn(run(options, Arc::new(handler), control_rx, connected_tx));

        Self { control, connected }
    }

    /// Starts dialling the server. The first attempt is immediate.
    pub fn establish(&self) {
        let _ = self.control.send(Control::Establish);
    }

    /// Tears the channel down and stops reconnecting until the next
    /// [`Connection::establish`].
    pub fn disconnect(&self) {
        let _ = self.control.send(Control::Disconnect);
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Queues a PDU for transmission, fire-and-forget. Rejected while
    /// the channel is not connected.
    pub fn send(&self, pdu: RsproPdu) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }

        self.control
            .send(Control::Tx(pdu))
            .map_err(|_| SendError::NotConnected)
    }
}

enum State {
    Init,
    Delay,
    Reestablish,
    Exit,
}

async fn run<H>(
    options: ConnectionOptions,
    handler: Arc<H>,
    mut control: UnboundedReceiver<Control>,
    connected: watch::Sender<bool>,
) where
    H: ConnectionHandler,
{
    let mut backoff = Backoff::default();
    let mut state = State::Init;

    loop {
        state = match state {
            State::Init => match control.recv().await {
                Some(Control::Establish) => {
                    backoff.reset();
                    State::Delay
                }
                Some(_) => State::Init,
                None => State::Exit,
            },
            State::Delay => {
                let delay = backoff.next_delay(Instant::now());
                log::debug!(
                    "reestablish delay: server={}:{}, delay={:?}",
                    options.server_host,
                    options.server_port,
                    delay
                );

                let wakeup = sleep(delay);
                tokio::pin!(wakeup);

                loop {
                    tokio::select! {
                        _ = &mut wakeup => break State::Reestablish,
                        ctl = control.recv() => match ctl {
                            Some(Control::Establish) => {
                                backoff.reset();
                                break State::Delay;
                            }
                            Some(Control::Disconnect) => break State::Init,
                            Some(Control::Tx(_)) => continue,
                            None => break State::Exit,
                        },
                    }
                }
            }
            State::Reestablish => {
                backoff.mark_attempt(Instant::now());
                log::info!(
                    "connecting to server: {}:{}",
                    options.server_host,
                    options.server_port
                );

                let connect = TcpStream::connect((options.server_host.as_str(), options.server_port));
                match timeout(T_TCP_CONNECT, connect).await {
                    Ok(Ok(stream)) => {
                        run_link(&options, &handler, &mut control, &connected, &mut backoff, stream)
                            .await
                    }
                    Ok(Err(e)) => {
                        log::info!(
                            "connect failed: server={}:{}, err={}",
                            options.server_host,
                            options.server_port,
                            e
                        );
                        State::Delay
                    }
                    Err(_) => State::Delay,
                }
            }
            State::Exit => break,
        }
    }
}

/// Runs the handshake and connected phases of one TCP connection;
/// returns the state to continue in once the channel is gone.
async fn run_link<H>(
    options: &ConnectionOptions,
    handler: &Arc<H>,
    control: &mut UnboundedReceiver<Control>,
    connected: &watch::Sender<bool>,
    backoff: &mut Backoff,
    stream: TcpStream,
) -> State
where
    H: ConnectionHandler,
{
    if let Err(e) = stream.set_nodelay(true) {
        log::warn!("set nodelay failed: err={}", e);
    }

    let (mut reader, writer) = stream.into_split();
    let outbound = link::spawn_writer(writer);
    let (expired_tx, mut expired) = unbounded_channel();
    let keepalive = Keepalive::start(KeepaliveParams::default(), outbound.clone(), expired_tx);

    let request = match &options.role {
        PeerRole::Client { slot } => RsproPdu::ConnectClientReq {
            identity: options.identity.clone(),
            client_slot: *slot,
        },
        PeerRole::Bank { bank_id, num_slots } => RsproPdu::ConnectBankReq {
            identity: options.identity.clone(),
            bank_id: *bank_id,
            num_slots: *num_slots,
        },
    };

    log::debug!("tx RSPRO {}", request.name());
    if outbound.send(frame::encode_rspro(&request)).is_err() {
        return State::Delay;
    }

    let mut buf = BytesMut::new();

    // ESTABLISHED: the handshake response has a deadline.
    let deadline = Instant::now() + T_HANDSHAKE;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => {
                log::warn!("no handshake response within {:?}", T_HANDSHAKE);
                return State::Delay;
            }
            _ = expired.recv() => return State::Delay,
            ctl = control.recv() => match ctl {
                Some(Control::Establish) => {
                    backoff.reset();
                    return State::Delay;
                }
                Some(Control::Disconnect) => return State::Init,
                Some(Control::Tx(_)) => continue,
                None => return State::Exit,
            },
            frame = link::read_frame(&mut reader, &mut buf) => match frame {
                Ok(None) | Err(_) => return State::Delay,
                Ok(Some(Frame::Ipaccess(IpaMessage::Ping))) => {
                    let _ = outbound.send(frame::encode_ipaccess(IpaMessage::Pong));
                }
                Ok(Some(Frame::Ipaccess(IpaMessage::Pong))) => keepalive.pong(),
                Ok(Some(Frame::Ipaccess(_))) => continue,
                Ok(Some(Frame::Rspro(bytes))) => match RsproPdu::decode(&bytes) {
                    Err(e) => {
                        log::error!("error decoding PDU: {}", e);
                        continue;
                    }
                    Ok(RsproPdu::ConnectClientRes { result, .. })
                    | Ok(RsproPdu::ConnectBankRes { result, .. }) => {
                        if result == ResultCode::Ok {
                            break;
                        }

                        log::error!("handshake refused: result={:?}", result);
                        return State::Delay;
                    }
                    Ok(pdu) => {
                        log::debug!("rx RSPRO {} before handshake completed", pdu.name());
                        continue;
                    }
                },
            },
        }
    }

    // CONNECTED.
    log::info!(
        "connected to server: {}:{}",
        options.server_host,
        options.server_port
    );
    let _ = connected.send(true);
    handler.on_connected();

    let next = loop {
        tokio::select! {
            _ = expired.recv() => {
                log::warn!("keepalive timeout, reconnecting");
                break State::Delay;
            }
            ctl = control.recv() => match ctl {
                Some(Control::Establish) => {
                    backoff.reset();
                    break State::Delay;
                }
                Some(Control::Disconnect) => break State::Init,
                Some(Control::Tx(pdu)) => {
                    log::debug!("tx RSPRO {}", pdu.name());
                    if outbound.send(frame::encode_rspro(&pdu)).is_err() {
                        break State::Delay;
                    }
                }
                None => break State::Exit,
            },
            frame = link::read_frame(&mut reader, &mut buf) => match frame {
                Ok(None) | Err(_) => break State::Delay,
                Ok(Some(Frame::Ipaccess(IpaMessage::Ping))) => {
                    let _ = outbound.send(frame::encode_ipaccess(IpaMessage::Pong));
                }
                Ok(Some(Frame::Ipaccess(IpaMessage::Pong))) => keepalive.pong(),
                Ok(Some(Frame::Ipaccess(_))) => {}
                Ok(Some(Frame::Rspro(bytes))) => match RsproPdu::decode(&bytes) {
                    Ok(pdu) => {
                        log::debug!("rx RSPRO {}", pdu.name());
                        handler.on_pdu(pdu);
                    }
                    Err(e) => log::error!("error decoding PDU: {}", e),
                },
            },
        }
    };

    let _ = connected.send(false);
    handler.on_disconnected();
    keepalive.stop();
    next
}
