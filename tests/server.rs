use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bytes::BytesMut;
use codec::{
    frame::{self, Frame, IpaMessage},
    message::{
        BankSlot, ClientSlot, ComponentIdentity, ComponentType, ResultCode, RsproPdu,
    },
};
use remsim_server::{
    config::Config,
    notify::Notifier,
    server::{self, Registry, ServerContext},
    statistics::Statistics,
};
use sdk::{Connection, ConnectionHandler, ConnectionOptions, PeerRole};
use service::{MapState, SlotMaps};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::mpsc::{UnboundedSender, unbounded_channel},
    time::timeout,
};

const CLIENT: ClientSlot = ClientSlot {
    client_id: 7,
    slot_nr: 0,
};
const BANK: BankSlot = BankSlot {
    bank_id: 3,
    slot_nr: 5,
};

async fn start_server() -> Result<(Arc<ServerContext>, SocketAddr)> {
    let mut config = Config::default();
    config.server.listen = "127.0.0.1:0".parse()?;

    let ctx = Arc::new(ServerContext {
        config: Arc::new(config),
        registry: Registry::default(),
        slotmaps: SlotMaps::default(),
        notifier: Notifier::default(),
        statistics: Statistics::default(),
    });

    let addr = server::start(&ctx).await?;
    Ok((ctx, addr))
}

fn identity(kind: ComponentType, name: &str) -> ComponentIdentity {
    ComponentIdentity {
        kind,
        name: name.to_string(),
        sw_version: "1".to_string(),
        hw_version: "1".to_string(),
    }
}

/// A raw protocol peer driven directly by the test.
struct Peer {
    socket: TcpStream,
    buf: BytesMut,
}

impl Peer {
    async fn dial(addr: SocketAddr) -> Result<Self> {
        Ok(Self {
            socket: TcpStream::connect(addr).await?,
            buf: BytesMut::new(),
        })
    }

    async fn send(&mut self, pdu: &RsproPdu) -> Result<()> {
        self.socket.write_all(&frame::encode_rspro(pdu)).await?;
        Ok(())
    }

    /// Next RSPRO PDU, answering pings in passing. `None` once the
    /// server closed the connection.
    async fn recv(&mut self) -> Result<Option<RsproPdu>> {
        loop {
            let inbound = timeout(
                Duration::from_secs(5),
                link::read_frame(&mut self.socket, &mut self.buf),
            )
            .await
            .context("timed out waiting for a frame")??;

            match inbound {
                Some(Frame::Rspro(bytes)) => return Ok(Some(RsproPdu::decode(&bytes)?)),
                Some(Frame::Ipaccess(IpaMessage::Ping)) => {
                    self.socket
                        .write_all(&frame::encode_ipaccess(IpaMessage::Pong))
                        .await?;
                }
                Some(Frame::Ipaccess(_)) => continue,
                None => return Ok(None),
            }
        }
    }

    async fn expect_pdu(&mut self) -> Result<RsproPdu> {
        self.recv()
            .await?
            .context("server closed the connection early")
    }

    async fn connect_client(addr: SocketAddr, slot: ClientSlot) -> Result<Self> {
        let mut peer = Self::dial(addr).await?;
        peer.send(&RsproPdu::ConnectClientReq {
            identity: identity(ComponentType::Client, "c"),
            client_slot: Some(slot),
        })
        .await?;

        match peer.expect_pdu().await? {
            RsproPdu::ConnectClientRes { result, .. } => {
                anyhow::ensure!(result == ResultCode::Ok, "handshake refused: {:?}", result);
            }
            other => anyhow::bail!("expected connectClientRes, got {}", other.name()),
        }

        Ok(peer)
    }

    async fn connect_bank(addr: SocketAddr, bank_id: u16, num_slots: u16) -> Result<Self> {
        let mut peer = Self::dial(addr).await?;
        peer.send(&RsproPdu::ConnectBankReq {
            identity: identity(ComponentType::Bank, "bank"),
            bank_id,
            num_slots,
        })
        .await?;

        match peer.expect_pdu().await? {
            RsproPdu::ConnectBankRes { result, .. } => {
                anyhow::ensure!(result == ResultCode::Ok, "handshake refused: {:?}", result);
            }
            other => anyhow::bail!("expected connectBankRes, got {}", other.name()),
        }

        Ok(peer)
    }
}

/// Brings up a bank and a client and drives the mapping `BANK <-> CLIENT`
/// to ACTIVE, asserting every message on the way.
async fn establish_active_mapping(
    ctx: &Arc<ServerContext>,
    addr: SocketAddr,
) -> Result<(Peer, Peer)> {
    let mut bank = Peer::connect_bank(addr, BANK.bank_id, 8).await?;
    let mut client = Peer::connect_client(addr, CLIENT).await?;

    ctx.slotmaps.add(BANK, CLIENT).unwrap();
    ctx.notifier.signal();

    assert_eq!(
        bank.expect_pdu().await?,
        RsproPdu::CreateMappingReq {
            client: CLIENT,
            bank: BANK,
        }
    );
    assert_eq!(
        ctx.slotmaps.by_bank(BANK).unwrap().state,
        MapState::Unacknowledged
    );

    bank.send(&RsproPdu::CreateMappingRes {
        result: ResultCode::Ok,
    })
    .await?;

    match client.expect_pdu().await? {
        RsproPdu::ConfigClientBankReq {
            bank: slot,
            bankd_ip,
            bankd_port,
        } => {
            assert_eq!(slot, BANK);
            // the bank dialled from localhost.
            assert_eq!(bankd_ip, 0x7F00_0001);
            assert_eq!(bankd_port, 9999);
        }
        other => panic!("expected configClientBankReq, got {}", other.name()),
    }

    assert_eq!(ctx.slotmaps.by_bank(BANK).unwrap().state, MapState::Active);
    Ok((bank, client))
}

#[tokio::test]
async fn client_handshake() -> Result<()> {
    let (ctx, addr) = start_server().await?;

    let mut peer = Peer::dial(addr).await?;
    peer.send(&RsproPdu::ConnectClientReq {
        identity: identity(ComponentType::Client, "c"),
        client_slot: Some(CLIENT),
    })
    .await?;

    match peer.expect_pdu().await? {
        RsproPdu::ConnectClientRes { identity, result } => {
            assert_eq!(result, ResultCode::Ok);
            assert_eq!(identity.kind, ComponentType::Server);
        }
        other => panic!("expected connectClientRes, got {}", other.name()),
    }

    // the peer migrated from `connections` to `clients`.
    assert_eq!(ctx.registry.counts(), (0, 1, 0));
    assert!(ctx.registry.client_by_slot(CLIENT).is_some());
    Ok(())
}

#[tokio::test]
async fn client_without_slot_is_refused() -> Result<()> {
    let (_ctx, addr) = start_server().await?;

    let mut peer = Peer::dial(addr).await?;
    peer.send(&RsproPdu::ConnectClientReq {
        identity: identity(ComponentType::Client, "c"),
        client_slot: None,
    })
    .await?;

    match peer.expect_pdu().await? {
        RsproPdu::ConnectClientRes { result, .. } => {
            assert_eq!(result, ResultCode::IllegalClientId);
        }
        other => panic!("expected connectClientRes, got {}", other.name()),
    }

    // and the server hangs up after the grace period.
    assert_eq!(peer.recv().await?, None);
    Ok(())
}

#[tokio::test]
async fn wrong_identity_type_terminates() -> Result<()> {
    let (ctx, addr) = start_server().await?;

    let mut peer = Peer::dial(addr).await?;
    peer.send(&RsproPdu::ConnectBankReq {
        identity: identity(ComponentType::Client, "imposter"),
        bank_id: 1,
        num_slots: 2,
    })
    .await?;

    // no reply, the connection is simply terminated.
    assert_eq!(peer.recv().await?, None);
    assert_eq!(ctx.registry.counts(), (0, 0, 0));
    Ok(())
}

#[tokio::test]
async fn duplicate_bank_id_is_rejected() -> Result<()> {
    let (ctx, addr) = start_server().await?;

    let _bank_a = Peer::connect_bank(addr, 3, 8).await?;

    let mut bank_b = Peer::dial(addr).await?;
    bank_b
        .send(&RsproPdu::ConnectBankReq {
            identity: identity(ComponentType::Bank, "late"),
            bank_id: 3,
            num_slots: 8,
        })
        .await?;

    match bank_b.expect_pdu().await? {
        RsproPdu::ConnectBankRes { result, .. } => {
            assert_eq!(result, ResultCode::IdentityInUse);
        }
        other => panic!("expected connectBankRes, got {}", other.name()),
    }

    // the loser is closed after the grace period, the incumbent stays.
    assert_eq!(bank_b.recv().await?, None);
    assert_eq!(ctx.registry.counts().2, 1);
    assert!(ctx.registry.bank_by_id(3).is_some());
    Ok(())
}

#[tokio::test]
async fn create_mapping_push() -> Result<()> {
    let (ctx, addr) = start_server().await?;

    // a wakeup with nothing pending stays off the wire.
    let mut idle_bank = Peer::connect_bank(addr, 9, 4).await?;
    ctx.notifier.signal();
    ctx.notifier.signal();
    assert!(
        timeout(
            Duration::from_millis(300),
            link::read_frame(&mut idle_bank.socket, &mut idle_bank.buf)
        )
        .await
        .is_err()
    );

    let (_bank, _client) = establish_active_mapping(&ctx, addr).await?;
    Ok(())
}

#[tokio::test]
async fn mapping_survives_bank_reconnect() -> Result<()> {
    let (ctx, addr) = start_server().await?;
    let (bank, mut client) = establish_active_mapping(&ctx, addr).await?;

    // the bank goes away: the client is told the zero coordinates and
    // the mapping waits in NEW, off any per-bank queue.
    drop(bank);
    match client.expect_pdu().await? {
        RsproPdu::ConfigClientBankReq {
            bank: slot,
            bankd_ip,
            bankd_port,
        } => {
            assert_eq!(slot, BANK);
            assert_eq!(bankd_ip, 0);
            assert_eq!(bankd_port, 0);
        }
        other => panic!("expected configClientBankReq, got {}", other.name()),
    }

    assert_eq!(ctx.slotmaps.by_bank(BANK).unwrap().state, MapState::New);
    assert!(!ctx.slotmaps.has_pending(BANK.bank_id));

    // a new bank with the same id adopts the mapping on entry.
    let mut bank = Peer::connect_bank(addr, BANK.bank_id, 8).await?;
    assert_eq!(
        bank.expect_pdu().await?,
        RsproPdu::CreateMappingReq {
            client: CLIENT,
            bank: BANK,
        }
    );

    bank.send(&RsproPdu::CreateMappingRes {
        result: ResultCode::Ok,
    })
    .await?;

    match client.expect_pdu().await? {
        RsproPdu::ConfigClientBankReq {
            bankd_ip,
            bankd_port,
            ..
        } => {
            assert_eq!(bankd_ip, 0x7F00_0001);
            assert_eq!(bankd_port, 9999);
        }
        other => panic!("expected configClientBankReq, got {}", other.name()),
    }

    assert_eq!(ctx.slotmaps.by_bank(BANK).unwrap().state, MapState::Active);
    Ok(())
}

#[tokio::test]
async fn admin_removal() -> Result<()> {
    let (ctx, addr) = start_server().await?;
    let (mut bank, mut client) = establish_active_mapping(&ctx, addr).await?;

    assert_eq!(
        ctx.slotmaps.remove(BANK),
        service::RemoveOutcome::DeleteRequested
    );
    ctx.notifier.signal();

    assert_eq!(
        bank.expect_pdu().await?,
        RsproPdu::RemoveMappingReq {
            client: CLIENT,
            bank: BANK,
        }
    );

    bank.send(&RsproPdu::RemoveMappingRes {
        result: ResultCode::Ok,
    })
    .await?;

    match client.expect_pdu().await? {
        RsproPdu::ConfigClientBankReq {
            bankd_ip,
            bankd_port,
            ..
        } => {
            assert_eq!(bankd_ip, 0);
            assert_eq!(bankd_port, 0);
        }
        other => panic!("expected configClientBankReq, got {}", other.name()),
    }

    assert!(ctx.slotmaps.is_empty());
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum SdkEvent {
    Connected,
    Pdu(RsproPdu),
}

struct Recorder(UnboundedSender<SdkEvent>);

impl ConnectionHandler for Recorder {
    fn on_connected(&self) {
        let _ = self.0.send(SdkEvent::Connected);
    }

    fn on_pdu(&self, pdu: RsproPdu) {
        let _ = self.0.send(SdkEvent::Pdu(pdu));
    }
}

/// The shipped client library against the real server: handshake, then
/// the bank coordinates arriving through the handler.
#[tokio::test]
async fn sdk_client_receives_bank_config() -> Result<()> {
    let (ctx, addr) = start_server().await?;
    let mut bank = Peer::connect_bank(addr, BANK.bank_id, 8).await?;

    let (events_tx, mut events) = unbounded_channel();
    let connection = Connection::new(
        ConnectionOptions {
            server_host: "127.0.0.1".to_string(),
            server_port: addr.port(),
            identity: identity(ComponentType::Client, "c"),
            role: PeerRole::Client { slot: Some(CLIENT) },
        },
        Recorder(events_tx),
    );
    connection.establish();

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .context("timed out waiting for the sdk connection")?;
    assert_eq!(event, Some(SdkEvent::Connected));
    assert!(ctx.registry.client_by_slot(CLIENT).is_some());

    ctx.slotmaps.add(BANK, CLIENT)?;
    ctx.notifier.signal();

    assert_eq!(
        bank.expect_pdu().await?,
        RsproPdu::CreateMappingReq {
            client: CLIENT,
            bank: BANK,
        }
    );
    bank.send(&RsproPdu::CreateMappingRes {
        result: ResultCode::Ok,
    })
    .await?;

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .context("timed out waiting for the bank config")?;
    assert_eq!(
        event,
        Some(SdkEvent::Pdu(RsproPdu::ConfigClientBankReq {
            bank: BANK,
            bankd_ip: 0x7F00_0001,
            bankd_port: 9999,
        }))
    );

    Ok(())
}

#[tokio::test]
async fn late_client_learns_existing_mapping() -> Result<()> {
    let (ctx, addr) = start_server().await?;

    // mapping first, bank second, client last: the client must still be
    // told its coordinates on connect.
    ctx.slotmaps.add(BANK, CLIENT).unwrap();

    let mut bank = Peer::connect_bank(addr, BANK.bank_id, 8).await?;
    assert_eq!(
        bank.expect_pdu().await?,
        RsproPdu::CreateMappingReq {
            client: CLIENT,
            bank: BANK,
        }
    );
    bank.send(&RsproPdu::CreateMappingRes {
        result: ResultCode::Ok,
    })
    .await?;

    // no client yet; the update had nobody to tell. Now it connects.
    let mut client = Peer::connect_client(addr, CLIENT).await?;
    match client.expect_pdu().await? {
        RsproPdu::ConfigClientBankReq {
            bank: slot,
            bankd_ip,
            bankd_port,
        } => {
            assert_eq!(slot, BANK);
            assert_eq!(bankd_ip, 0x7F00_0001);
            assert_eq!(bankd_port, 9999);
        }
        other => panic!("expected configClientBankReq, got {}", other.name()),
    }

    Ok(())
}
