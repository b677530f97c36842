//! Gateway and networking command handlers
//!
//! Gateway reachability tests are TCP-based (ICMP needs raw sockets) and
//! rate-limited to one test per gateway per 3 seconds.

use crate::api::{
    ApiResponse, CreateGatewayRequest, GatewayUpdateRequest, ListResponse, NicInfo, PingResponse,
    TcpTestResponse,
};
use crate::commands::{guarded, AppState};
use crate::errors::AppError;
use crate::models::Gateway;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use sysinfo::Networks;

const DEFAULT_TCP_TIMEOUT_MS: u64 = 1000;

/// One TCP connect attempt, reported in the classic open/closed/timeout
/// shape
pub fn tcp_test(host: &str, port: u16, timeout_ms: u64) -> TcpTestResponse {
    let started = Instant::now();
    let timeout = Duration::from_millis(timeout_ms.max(1));
    let addr = (host, port).to_socket_addrs().ok().and_then(|mut a| a.next());
    let Some(addr) = addr else {
        return TcpTestResponse {
            ok: false,
            status: "closed".into(),
            time_ms: started.elapsed().as_millis() as i64,
        };
    };
    match TcpStream::connect_timeout(&addr, timeout) {
        Ok(_) => TcpTestResponse {
            ok: true,
            status: "open".into(),
            time_ms: started.elapsed().as_millis() as i64,
        },
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => TcpTestResponse {
            ok: false,
            status: "timeout".into(),
            time_ms: started.elapsed().as_millis() as i64,
        },
        Err(_) => TcpTestResponse {
            ok: false,
            status: "closed".into(),
            time_ms: started.elapsed().as_millis() as i64,
        },
    }
}

/// TCP-based reachability "ping": repeated connect attempts against one
/// port, aggregated like an ICMP ping report
fn tcp_ping(host: &str, port: u16, count: u32, timeout_ms: u64) -> PingResponse {
    let mut samples: Vec<i64> = Vec::new();
    let mut received = 0u32;
    for _ in 0..count.max(1) {
        let result = tcp_test(host, port, timeout_ms);
        if result.ok {
            received += 1;
            samples.push(result.time_ms);
        }
    }
    let sent = count.max(1);
    PingResponse {
        ok: received > 0,
        loss_pct: ((sent - received) * 100 / sent),
        min: samples.iter().copied().min().unwrap_or(0),
        avg: if samples.is_empty() {
            0
        } else {
            samples.iter().sum::<i64>() / samples.len() as i64
        },
        max: samples.iter().copied().max().unwrap_or(0),
        samples,
    }
}

pub fn list_gateways_command(
    state: &AppState,
    token: Option<&str>,
) -> ApiResponse<ListResponse<Gateway>> {
    guarded(state, token, "list_gateways", || {
        Ok(state.catalog.list_gateways().into())
    })
}

pub fn create_gateway_command(
    state: &AppState,
    token: Option<&str>,
    request: CreateGatewayRequest,
) -> ApiResponse<Gateway> {
    guarded(state, token, "create_gateway", || {
        state.catalog.add_gateway(
            request.id.clone(),
            &request.name,
            &request.host,
            request.adapter_id.clone(),
            request.nic_hint.clone(),
            &request.ports,
            request.protocol_hint.clone(),
            request.tags.clone(),
        )
    })
}

pub fn update_gateway_command(
    state: &AppState,
    token: Option<&str>,
    gateway_id: &str,
    request: GatewayUpdateRequest,
) -> ApiResponse<Gateway> {
    guarded(state, token, "update_gateway", || {
        state.catalog.update_gateway(
            gateway_id,
            request.name.clone(),
            request.host.clone(),
            request.nic_hint.clone(),
            request.ports.clone(),
            request.protocol_hint.clone(),
            request.tags.clone(),
        )
    })
}

pub fn delete_gateway_command(
    state: &AppState,
    token: Option<&str>,
    gateway_id: &str,
) -> ApiResponse<()> {
    guarded(state, token, "delete_gateway", || {
        state.catalog.delete_gateway(gateway_id)
    })
}

pub fn ping_gateway_command(
    state: &AppState,
    token: Option<&str>,
    gateway_id: &str,
    count: Option<u32>,
    timeout_ms: Option<u64>,
) -> ApiResponse<PingResponse> {
    guarded(state, token, "ping_gateway", || {
        state.catalog.rate_limit_gateway_test(gateway_id)?;
        let gateway = state
            .catalog
            .get_gateway(gateway_id)
            .ok_or_else(|| AppError::not_found("gateway", gateway_id, "GATEWAY_NOT_FOUND"))?;
        let port = gateway.ports.first().copied().unwrap_or(502);
        let result = tcp_ping(
            &gateway.host,
            port,
            count.unwrap_or(4),
            timeout_ms.unwrap_or(800),
        );
        state
            .catalog
            .set_gateway_health(gateway_id, Some(serde_json::to_value(&result)?), None)?;
        Ok(result)
    })
}

pub fn tcp_gateway_command(
    state: &AppState,
    token: Option<&str>,
    gateway_id: &str,
    ports: Option<Vec<u16>>,
    timeout_ms: Option<u64>,
) -> ApiResponse<ListResponse<serde_json::Value>> {
    guarded(state, token, "tcp_gateway", || {
        state.catalog.rate_limit_gateway_test(gateway_id)?;
        let gateway = state
            .catalog
            .get_gateway(gateway_id)
            .ok_or_else(|| AppError::not_found("gateway", gateway_id, "GATEWAY_NOT_FOUND"))?;
        let ports = ports.unwrap_or_else(|| gateway.ports.clone());
        let timeout = timeout_ms.unwrap_or(DEFAULT_TCP_TIMEOUT_MS);
        let mut results = Vec::new();
        for port in ports {
            let result = tcp_test(&gateway.host, port, timeout);
            let mut value = serde_json::to_value(&result)?;
            if let Some(obj) = value.as_object_mut() {
                obj.insert("port".into(), serde_json::json!(port));
            }
            results.push(value);
        }
        state.catalog.set_gateway_health(
            gateway_id,
            None,
            Some(serde_json::Value::Array(results.clone())),
        )?;
        Ok(results.into())
    })
}

pub fn tcp_test_command(
    state: &AppState,
    token: Option<&str>,
    host: &str,
    port: u16,
    timeout_ms: Option<u64>,
) -> ApiResponse<TcpTestResponse> {
    guarded(state, token, "tcp_test", || {
        Ok(tcp_test(host, port, timeout_ms.unwrap_or(DEFAULT_TCP_TIMEOUT_MS)))
    })
}

/// Active network interfaces of the host
pub fn list_nics_command(
    state: &AppState,
    token: Option<&str>,
) -> ApiResponse<ListResponse<NicInfo>> {
    guarded(state, token, "list_nics", || {
        let networks = Networks::new_with_refreshed_list();
        let items: Vec<NicInfo> = networks
            .iter()
            .map(|(name, data)| NicInfo {
                id: name.clone(),
                label: name.clone(),
                mac: data.mac_address().to_string(),
            })
            .collect();
        Ok(items.into())
    })
}
