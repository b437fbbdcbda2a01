use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use codec::{
    frame::{self, Frame, IpaMessage},
    message::{ClientSlot, ComponentType, ResultCode, RsproPdu},
};
use link::keepalive::{Keepalive, KeepaliveParams};
use tokio::{
    net::{TcpStream, tcp::OwnedReadHalf},
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    time::{Instant, sleep, sleep_until},
};

use crate::{
    server::{PeerEvent, PeerHandle, ServerContext, update_client_for_map},
    statistics::{Stats, StatisticsReporter},
};

/// How long a fresh connection may sit without sending its handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a refused peer is held so the refusal reply flushes before
/// the socket closes under it.
const REJECT_GRACE: Duration = Duration::from_secs(1);

/// The channel-facing half of one peer task.
struct Link {
    addr: SocketAddr,
    outbound: UnboundedSender<Bytes>,
    reader: OwnedReadHalf,
    buf: BytesMut,
    events: UnboundedReceiver<PeerEvent>,
    expired: UnboundedReceiver<()>,
    keepalive: Keepalive,
    reporter: StatisticsReporter,
}

impl Link {
    /// Queues a PDU for transmission; false once the writer is gone.
    fn send_pdu(&self, pdu: &RsproPdu) -> bool {
        log::debug!("tx RSPRO {}: addr={}", pdu.name(), self.addr);
        self.reporter.send(&self.addr, &[Stats::SendPdus(1)]);
        self.outbound.send(frame::encode_rspro(pdu)).is_ok()
    }
}

enum Inbound {
    /// Consumed below the RSPRO layer (control messages, decode errors).
    Handled,
    Pdu(RsproPdu),
}

fn handle_frame(link: &Link, inbound: Frame) -> Inbound {
    match inbound {
        Frame::Ipaccess(IpaMessage::Ping) => {
            let _ = link.outbound.send(frame::encode_ipaccess(IpaMessage::Pong));
            Inbound::Handled
        }
        Frame::Ipaccess(IpaMessage::Pong) => {
            link.keepalive.pong();
            Inbound::Handled
        }
        Frame::Ipaccess(IpaMessage::IdAck) => {
            let _ = link.outbound.send(frame::encode_ipaccess(IpaMessage::IdAck));
            Inbound::Handled
        }
        Frame::Ipaccess(IpaMessage::IdResp) => Inbound::Handled,
        Frame::Rspro(bytes) => match RsproPdu::decode(&bytes) {
            Ok(pdu) => {
                log::debug!("rx RSPRO {}: addr={}", pdu.name(), link.addr);
                link.reporter.send(&link.addr, &[Stats::ReceivedPdus(1)]);
                Inbound::Pdu(pdu)
            }
            Err(e) => {
                // a single malformed PDU is dropped, the channel lives.
                log::error!("error decoding PDU: addr={}, err={}", link.addr, e);
                link.reporter.send(&link.addr, &[Stats::ErrorPdus(1)]);
                Inbound::Handled
            }
        },
    }
}

enum Promoted {
    Client(ClientSlot),
    Bank(u16),
}

/// One task per accepted connection: handshake, then the per-role loop,
/// then cleanup.
pub(crate) async fn serve(ctx: Arc<ServerContext>, socket: TcpStream, addr: SocketAddr, id: u64) {
    let (reader, writer) = socket.into_split();
    let outbound = link::spawn_writer(writer);
    let (expired_tx, expired) = unbounded_channel();
    let keepalive = Keepalive::start(KeepaliveParams::default(), outbound.clone(), expired_tx);
    let (events_tx, events) = unbounded_channel();

    let peer = Arc::new(PeerHandle::new(id, addr, events_tx));
    ctx.registry.insert(peer.clone());
    ctx.statistics.register(addr);

    let mut link = Link {
        addr,
        outbound,
        reader,
        buf: BytesMut::new(),
        events,
        expired,
        keepalive,
        reporter: ctx.statistics.get_reporter(),
    };

    match handshake(&ctx, &peer, &mut link).await {
        Some(Promoted::Client(slot)) => connected_client(&ctx, &peer, &mut link, slot).await,
        Some(Promoted::Bank(bank_id)) => connected_bank(&ctx, &peer, &mut link, bank_id).await,
        None => {}
    }

    // teardown order matters: the peer leaves the registry first so
    // coordinate resolution no longer finds it, then its mappings are
    // returned or destroyed and the owning clients told.
    link.keepalive.stop();
    let bank_id = peer.bank_id();
    ctx.registry.remove(id);
    ctx.statistics.unregister(&addr);

    if let Some(bank_id) = bank_id {
        let teardown = ctx.slotmaps.bank_disconnected(bank_id);
        log::info!(
            "bank disconnected: id={}, bank-id={}, reverted={}, destroyed={}",
            id,
            bank_id,
            teardown.reverted.len(),
            teardown.destroyed.len()
        );

        for map in teardown.reverted.iter().chain(teardown.destroyed.iter()) {
            update_client_for_map(&ctx, map, None);
        }
    }

    log::info!("connection closed: id={}, addr={}", id, addr);
}

async fn handshake(
    ctx: &ServerContext,
    peer: &Arc<PeerHandle>,
    link: &mut Link,
) -> Option<Promoted> {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;

    loop {
        let pdu = tokio::select! {
            _ = sleep_until(deadline) => {
                log::warn!("no handshake received: id={}, addr={}", peer.id, link.addr);
                return None;
            }
            _ = link.expired.recv() => {
                log::warn!("keepalive timeout: id={}, addr={}", peer.id, link.addr);
                return None;
            }
            // mapping work cannot exist for an unclassified peer.
            _ = link.events.recv() => continue,
            inbound = link::read_frame(&mut link.reader, &mut link.buf) => match inbound {
                Ok(None) => return None,
                Err(e) => {
                    log::error!("framing error: id={}, err={}", peer.id, e);
                    return None;
                }
                Ok(Some(inbound)) => match handle_frame(link, inbound) {
                    Inbound::Handled => continue,
                    Inbound::Pdu(pdu) => pdu,
                },
            },
        };

        return match pdu {
            RsproPdu::ConnectClientReq {
                identity,
                client_slot,
            } => {
                if identity.kind != ComponentType::Client {
                    log::error!(
                        "connectClientReq from identity {:?}: id={}",
                        identity.kind,
                        peer.id
                    );
                    return None;
                }

                peer.set_identity(identity);

                // dynamic client-id assignment is not supported, a
                // client must bring its own slot.
                let Some(slot) = client_slot else {
                    log::error!("connectClientReq without a client slot: id={}", peer.id);
                    refuse(
                        link,
                        RsproPdu::ConnectClientRes {
                            identity: ctx.config.identity.to_component(),
                            result: ResultCode::IllegalClientId,
                        },
                    )
                    .await;
                    return None;
                };

                if !ctx.registry.promote_client(peer, slot) {
                    // the established connection wins; dropping it for a
                    // newcomer would hand strangers a denial of service.
                    log::error!(
                        "client slot already in use: id={}, slot={}, addr={}",
                        peer.id,
                        slot,
                        link.addr
                    );
                    refuse(
                        link,
                        RsproPdu::ConnectClientRes {
                            identity: ctx.config.identity.to_component(),
                            result: ResultCode::IdentityInUse,
                        },
                    )
                    .await;
                    return None;
                }

                link.send_pdu(&RsproPdu::ConnectClientRes {
                    identity: ctx.config.identity.to_component(),
                    result: ResultCode::Ok,
                });

                log::info!(
                    "client connected: id={}, slot={}, addr={}",
                    peer.id,
                    slot,
                    link.addr
                );
                Some(Promoted::Client(slot))
            }
            RsproPdu::ConnectBankReq {
                identity,
                bank_id,
                num_slots,
            } => {
                if identity.kind != ComponentType::Bank {
                    log::error!(
                        "connectBankReq from identity {:?}: id={}",
                        identity.kind,
                        peer.id
                    );
                    return None;
                }

                peer.set_identity(identity);

                if link.addr.ip().is_loopback() {
                    log::warn!(
                        "bank connected from localhost; this only works if the \
                         clients can reach the bank there as well: id={}",
                        peer.id
                    );
                }

                if !ctx.registry.promote_bank(peer, bank_id, num_slots) {
                    log::error!(
                        "bank id already in use: id={}, bank-id={}, addr={}",
                        peer.id,
                        bank_id,
                        link.addr
                    );
                    refuse(
                        link,
                        RsproPdu::ConnectBankRes {
                            identity: ctx.config.identity.to_component(),
                            result: ResultCode::IdentityInUse,
                        },
                    )
                    .await;
                    return None;
                }

                link.send_pdu(&RsproPdu::ConnectBankRes {
                    identity: ctx.config.identity.to_component(),
                    result: ResultCode::Ok,
                });

                log::info!(
                    "bank connected: id={}, bank-id={}, slots={}, addr={}",
                    peer.id,
                    bank_id,
                    num_slots,
                    link.addr
                );
                Some(Promoted::Bank(bank_id))
            }
            other => {
                log::error!(
                    "unexpected RSPRO {} during handshake: id={}",
                    other.name(),
                    peer.id
                );
                None
            }
        };
    }
}

/// Sends a refusal and keeps the socket up briefly so the reply makes it
/// out before the close.
async fn refuse(link: &Link, response: RsproPdu) {
    link.send_pdu(&response);
    sleep(REJECT_GRACE).await;
}

async fn connected_client(
    ctx: &ServerContext,
    peer: &Arc<PeerHandle>,
    link: &mut Link,
    slot: ClientSlot,
) {
    // a mapping may already exist for this slot; tell the client where
    // its bank lives.
    if let Some(map) = ctx.slotmaps.by_client(slot) {
        update_client_for_map(ctx, &map, None);
    }

    loop {
        tokio::select! {
            _ = link.expired.recv() => {
                log::warn!("keepalive timeout: id={}, addr={}", peer.id, link.addr);
                return;
            }
            event = link.events.recv() => match event {
                Some(PeerEvent::ConfigBankd) => {
                    let Some(bankd) = peer.bankd_coordinates() else {
                        continue;
                    };

                    if !link.send_pdu(&RsproPdu::ConfigClientBankReq {
                        bank: bankd.slot,
                        bankd_ip: bankd.ip,
                        bankd_port: bankd.port,
                    }) {
                        return;
                    }
                }
                Some(PeerEvent::Push) => continue,
                None => return,
            },
            inbound = link::read_frame(&mut link.reader, &mut link.buf) => match inbound {
                Ok(None) => {
                    log::info!("client connection lost: id={}, addr={}", peer.id, link.addr);
                    return;
                }
                Err(e) => {
                    log::error!("framing error: id={}, err={}", peer.id, e);
                    return;
                }
                Ok(Some(inbound)) => match handle_frame(link, inbound) {
                    Inbound::Handled => continue,
                    Inbound::Pdu(RsproPdu::ConfigClientBankRes { result }) => {
                        log::debug!(
                            "client acknowledged bank config: id={}, result={:?}",
                            peer.id,
                            result
                        );
                    }
                    Inbound::Pdu(pdu) => {
                        log::error!(
                            "unexpected RSPRO {} from client: id={}",
                            pdu.name(),
                            peer.id
                        );
                        return;
                    }
                },
            },
        }
    }
}

async fn connected_bank(
    ctx: &ServerContext,
    peer: &Arc<PeerHandle>,
    link: &mut Link,
    bank_id: u16,
) {
    // adopt every mapping waiting for this bank id, then realise the
    // backlog right away.
    ctx.slotmaps.bank_connected(bank_id);
    if !push_mappings(ctx, link, bank_id) {
        return;
    }

    loop {
        tokio::select! {
            _ = link.expired.recv() => {
                log::warn!("keepalive timeout: id={}, addr={}", peer.id, link.addr);
                return;
            }
            event = link.events.recv() => match event {
                Some(PeerEvent::Push) => {
                    if !push_mappings(ctx, link, bank_id) {
                        return;
                    }
                }
                Some(PeerEvent::ConfigBankd) => continue,
                None => return,
            },
            inbound = link::read_frame(&mut link.reader, &mut link.buf) => match inbound {
                Ok(None) => {
                    log::info!("bank connection lost: id={}, addr={}", peer.id, link.addr);
                    return;
                }
                Err(e) => {
                    log::error!("framing error: id={}, err={}", peer.id, e);
                    return;
                }
                Ok(Some(inbound)) => match handle_frame(link, inbound) {
                    Inbound::Handled => continue,
                    Inbound::Pdu(RsproPdu::CreateMappingRes { result }) => {
                        // responses carry no tag; the head of the
                        // unacknowledged queue is the one answered.
                        match ctx.slotmaps.ack_create(bank_id) {
                            Some(map) => {
                                log::info!(
                                    "mapping {} <-> {} active: result={:?}",
                                    map.bank,
                                    map.client,
                                    result
                                );
                                update_client_for_map(ctx, &map, Some(peer));
                            }
                            None => log::warn!(
                                "createMappingRes without an unacknowledged mapping: id={}",
                                peer.id
                            ),
                        }
                    }
                    Inbound::Pdu(RsproPdu::RemoveMappingRes { result }) => {
                        match ctx.slotmaps.ack_remove(bank_id) {
                            Some(map) => {
                                // the mapping is gone; the client learns
                                // the zero coordinates.
                                update_client_for_map(ctx, &map, Some(peer));
                                log::info!(
                                    "mapping {} <-> {} deleted: result={:?}",
                                    map.bank,
                                    map.client,
                                    result
                                );
                            }
                            None => log::warn!(
                                "removeMappingRes without a deleting mapping: id={}",
                                peer.id
                            ),
                        }
                    }
                    Inbound::Pdu(pdu) => {
                        log::error!(
                            "unexpected RSPRO {} from bank: id={}",
                            pdu.name(),
                            peer.id
                        );
                        return;
                    }
                },
            },
        }
    }
}

/// Drains the bank's pending queues onto the wire, create requests
/// first, then removals. False once the writer is gone.
fn push_mappings(ctx: &ServerContext, link: &Link, bank_id: u16) -> bool {
    let work = ctx.slotmaps.push_pending(bank_id);

    for map in work.create {
        log::info!("requesting mapping {} <-> {}", map.bank, map.client);
        if !link.send_pdu(&RsproPdu::CreateMappingReq {
            client: map.client,
            bank: map.bank,
        }) {
            return false;
        }
    }

    for map in work.remove {
        log::info!("requesting removal of mapping {} <-> {}", map.bank, map.client);
        if !link.send_pdu(&RsproPdu::RemoveMappingReq {
            client: map.client,
            bank: map.bank,
        }) {
            return false;
        }
    }

    true
}
