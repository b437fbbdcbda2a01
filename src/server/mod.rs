mod peer;
mod registry;

pub use registry::{BankCoordinates, PeerClass, PeerEvent, PeerHandle, PeerInfo, Registry};

use std::{net::IpAddr, net::SocketAddr, sync::Arc};

use service::{MapState, SlotMapping, SlotMaps};
use tokio::net::TcpListener;

use crate::{config::Config, notify::Notifier, statistics::Statistics};

/// Everything the peer tasks and the admin surface share.
pub struct ServerContext {
    pub config: Arc<Config>,
    pub registry: Registry,
    pub slotmaps: SlotMaps,
    pub notifier: Notifier,
    pub statistics: Statistics,
}

/// Binds the control socket and spawns the accept loop plus the wakeup
/// watcher. Returns the bound address (useful with an ephemeral port).
///
/// A bind failure is fatal: without a control socket the process has no
/// reason to live.
pub async fn start(ctx: &Arc<ServerContext>) -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind(ctx.config.server.listen).await?;
    let local_addr = listener.local_addr()?;

    tokio::spawn(accept_loop(ctx.clone(), listener));
    tokio::spawn(wakeup_watcher(ctx.clone()));

    log::info!("rspro server listening: addr={}", local_addr);
    Ok(local_addr)
}

async fn accept_loop(ctx: Arc<ServerContext>, listener: TcpListener) {
    let mut next_id = 0u64;

    while let Ok((socket, addr)) = listener.accept().await {
        next_id += 1;
        log::info!("connection accepted: id={}, addr={}", next_id, addr);

        // the control channel is all small PDUs, don't batch them.
        if let Err(e) = socket.set_nodelay(true) {
            log::error!("set nodelay failed: addr={}, err={}", addr, e);
        }

        tokio::spawn(peer::serve(ctx.clone(), socket, addr, next_id));
    }

    log::error!("rspro server closed: addr={}", ctx.config.server.listen);
}

/// Drains wakeup signals from the admin producers and dispatches `PUSH`
/// to every connected bank peer that has queued mapping work.
async fn wakeup_watcher(ctx: Arc<ServerContext>) {
    loop {
        ctx.notifier.notified().await;
        log::debug!("wakeup signal, checking for pending mapping work");

        for bank in ctx.registry.banks() {
            if let Some(bank_id) = bank.bank_id() {
                if ctx.slotmaps.has_pending(bank_id) {
                    bank.dispatch(PeerEvent::Push);
                }
            }
        }
    }
}

/// Finds the client serving one end of `map` (if connected) and brings
/// its bank coordinates up to date.
///
/// A mapping being deleted, or one whose bank peer is gone, maps to the
/// all-zero coordinates. Only actual changes are pushed to the client.
pub(crate) fn update_client_for_map(
    ctx: &ServerContext,
    map: &SlotMapping,
    bank_peer: Option<&Arc<PeerHandle>>,
) {
    let Some(client) = ctx.registry.client_by_slot(map.client) else {
        return;
    };

    // resolve the bank peer from the map if the caller didn't have it at
    // hand. The coordinates are computed before touching the client's
    // record so no two peer locks are ever held together.
    let resolved;
    let bank_peer = match bank_peer {
        Some(peer) => Some(peer),
        None => {
            resolved = ctx.registry.bank_by_id(map.bank.bank_id);
            resolved.as_ref()
        }
    };

    let (ip, port) = match bank_peer {
        None => (0, 0),
        Some(_) if map.state == MapState::Deleting => (0, 0),
        Some(peer) => match peer.addr.ip() {
            IpAddr::V4(v4) => (u32::from(v4), ctx.config.bankd.port),
            IpAddr::V6(_) => {
                log::error!("bank peer has no IPv4 address: addr={}", peer.addr);
                return;
            }
        },
    };

    let mut changed = false;
    {
        let mut info = client.info.write();
        let PeerClass::Client { bankd, .. } = &mut info.class else {
            return;
        };

        if bankd.slot != map.bank {
            log::info!(
                "bank slot for client {} changed {} -> {}",
                map.client,
                bankd.slot,
                map.bank
            );
            bankd.slot = map.bank;
            changed = true;
        }

        if bankd.ip != ip || bankd.port != port {
            log::info!(
                "bank address for client {} changed to {}.{}.{}.{}:{}",
                map.client,
                ip >> 24,
                (ip >> 16) & 0xFF,
                (ip >> 8) & 0xFF,
                ip & 0xFF,
                port
            );
            bankd.ip = ip;
            bankd.port = port;
            changed = true;
        }
    }

    if changed {
        client.dispatch(PeerEvent::ConfigBankd);
    }
}
