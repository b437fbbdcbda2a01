use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};

use codec::message::{BankSlot, ClientSlot};
use serde::Deserialize;
use serde_json::json;
use service::{RemoveOutcome, SlotmapError};
use tokio::net::TcpListener;

use crate::server::{PeerClass, ServerContext};

struct ApiState {
    ctx: Arc<ServerContext>,
    uptime: Instant,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct MappingBody {
    bank_id: u16,
    bank_slot: u16,
    client_id: u16,
    client_slot: u16,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct BankSlotParams {
    bank_id: u16,
    slot_nr: u16,
}

#[derive(Deserialize)]
struct AddrParams {
    addr: SocketAddr,
}

/// start http server
///
/// Create an http server and start it; slot mappings are created and
/// removed through this interface and the connected peers can be
/// inspected.
///
/// Warn: This http server does not contain any means of authentication,
/// and sensitive information and dangerous operations can be reached
/// through this service, please do not expose it directly to an unsafe
/// environment.
pub async fn start_server(ctx: Arc<ServerContext>) -> anyhow::Result<()> {
    let listen = ctx.config.api.listen;
    let state = Arc::new(ApiState {
        ctx,
        uptime: Instant::now(),
    });

    let app = Router::new()
        .route(
            "/info",
            get(|State(state): State<Arc<ApiState>>| async move {
                let (connections, clients, banks) = state.ctx.registry.counts();
                Json(json!({
                    "software": crate::SOFTWARE,
                    "uptime": state.uptime.elapsed().as_secs(),
                    "connections": connections,
                    "clients": clients,
                    "banks": banks,
                    "mappings": state.ctx.slotmaps.len(),
                }))
            }),
        )
        .route(
            "/mappings",
            get(|State(state): State<Arc<ApiState>>| async move {
                let mappings = state
                    .ctx
                    .slotmaps
                    .snapshot()
                    .into_iter()
                    .map(|map| {
                        json!({
                            "bank-id": map.bank.bank_id,
                            "bank-slot": map.bank.slot_nr,
                            "client-id": map.client.client_id,
                            "client-slot": map.client.slot_nr,
                            "state": map.state,
                        })
                    })
                    .collect::<Vec<_>>();

                Json(json!(mappings))
            })
            .post(
                |State(state): State<Arc<ApiState>>, Json(body): Json<MappingBody>| async move {
                    let bank = BankSlot {
                        bank_id: body.bank_id,
                        slot_nr: body.bank_slot,
                    };
                    let client = ClientSlot {
                        client_id: body.client_id,
                        slot_nr: body.client_slot,
                    };

                    match state.ctx.slotmaps.add(bank, client) {
                        Ok(()) => {
                            log::info!("slot map {} <-> {} added", bank, client);
                            state.ctx.notifier.signal();
                            StatusCode::CREATED.into_response()
                        }
                        Err(SlotmapError::Busy) => (
                            StatusCode::CONFLICT,
                            Json(json!({
                                "error": "bank or client slot already mapped"
                            })),
                        )
                            .into_response(),
                    }
                },
            )
            .delete(
                |State(state): State<Arc<ApiState>>,
                 Query(params): Query<BankSlotParams>| async move {
                    let bank = BankSlot {
                        bank_id: params.bank_id,
                        slot_nr: params.slot_nr,
                    };

                    match state.ctx.slotmaps.remove(bank) {
                        RemoveOutcome::Deleted(map) => {
                            log::info!("slot map {} <-> {} deleted", map.bank, map.client);
                            state.ctx.notifier.signal();
                            StatusCode::OK.into_response()
                        }
                        RemoveOutcome::DeleteRequested => {
                            log::info!("slot map {} marked for removal", bank);
                            state.ctx.notifier.signal();
                            StatusCode::ACCEPTED.into_response()
                        }
                        RemoveOutcome::AlreadyDeleting => StatusCode::ACCEPTED.into_response(),
                        RemoveOutcome::Busy => (
                            StatusCode::CONFLICT,
                            Json(json!({
                                "error": "mapping creation in flight, retry later"
                            })),
                        )
                            .into_response(),
                        RemoveOutcome::NotFound => StatusCode::NOT_FOUND.into_response(),
                    }
                },
            ),
        )
        .route(
            "/clients",
            get(|State(state): State<Arc<ApiState>>| async move {
                let clients = state
                    .ctx
                    .registry
                    .clients()
                    .iter()
                    .filter_map(|peer| {
                        let info = peer.info.read();
                        let name = info.identity.as_ref().map(|i| i.name.clone());
                        let PeerClass::Client { slot, bankd } = info.class else {
                            return None;
                        };

                        Some(json!({
                            "id": peer.id,
                            "addr": peer.addr.to_string(),
                            "name": name,
                            "client-id": slot.client_id,
                            "slot-nr": slot.slot_nr,
                            "bankd": {
                                "bank-id": bankd.slot.bank_id,
                                "slot-nr": bankd.slot.slot_nr,
                                "ip": bankd.ip,
                                "port": bankd.port,
                            },
                        }))
                    })
                    .collect::<Vec<_>>();

                Json(json!(clients))
            }),
        )
        .route(
            "/banks",
            get(|State(state): State<Arc<ApiState>>| async move {
                let banks = state
                    .ctx
                    .registry
                    .banks()
                    .iter()
                    .filter_map(|peer| {
                        let info = peer.info.read();
                        let name = info.identity.as_ref().map(|i| i.name.clone());
                        let PeerClass::Bank { bank_id, num_slots } = info.class else {
                            return None;
                        };

                        Some(json!({
                            "id": peer.id,
                            "addr": peer.addr.to_string(),
                            "name": name,
                            "bank-id": bank_id,
                            "num-slots": num_slots,
                        }))
                    })
                    .collect::<Vec<_>>();

                Json(json!(banks))
            }),
        )
        .route(
            "/peers/statistics",
            get(
                |State(state): State<Arc<ApiState>>, Query(params): Query<AddrParams>| async move {
                    if let Some(counts) = state.ctx.statistics.get(&params.addr) {
                        Json(json!({
                            "received-pdus": counts.received_pdus,
                            "send-pdus": counts.send_pdus,
                            "error-pdus": counts.error_pdus,
                        }))
                        .into_response()
                    } else {
                        StatusCode::NOT_FOUND.into_response()
                    }
                },
            ),
        )
        .with_state(state);

    log::info!("api server listening: addr={}", listen);
    let listener = TcpListener::bind(listen).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
