//! TCP-level default session factory
//!
//! Probes connectivity by opening (and immediately dropping) a TCP
//! connection to the device endpoint. Tag reads require a protocol driver,
//! which this build does not bundle; the engine records those reads as
//! `PROTOCOL_DRIVER_MISSING` read errors.

use super::{ProbeOutcome, ProtocolSession, SessionFactory, Tag, Value};
use crate::errors::{AppError, AppResult};
use crate::models::{Device, Protocol};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Pull `host:port` out of device params for the given protocol
fn endpoint_addr(device: &Device) -> AppResult<(String, u16)> {
    let params = &device.params;
    match device.protocol {
        Protocol::Modbus => {
            let host = params
                .get("host")
                .or_else(|| params.get("ip"))
                .and_then(|v| v.as_str())
                .map(str::trim)
                .unwrap_or("");
            if host.is_empty() {
                return Err(AppError::required("host", "HOST_REQUIRED"));
            }
            let port = params
                .get("port")
                .and_then(|v| v.as_u64())
                .unwrap_or(502) as u16;
            Ok((host.to_string(), port))
        }
        Protocol::Opcua => {
            let endpoint = params
                .get("endpoint")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .unwrap_or("");
            if endpoint.is_empty() {
                return Err(AppError::required("endpoint", "ENDPOINT_REQUIRED"));
            }
            let endpoint = super::rewrite_wildcard_endpoint(endpoint);
            let rest = endpoint
                .strip_prefix("opc.tcp://")
                .unwrap_or(endpoint.as_str());
            let authority = rest.split('/').next().unwrap_or(rest);
            let (host, port) = match authority.rsplit_once(':') {
                Some((h, p)) => (h.to_string(), p.parse().unwrap_or(4840)),
                None => (authority.to_string(), 4840),
            };
            if host.is_empty() {
                return Err(AppError::required("endpoint", "ENDPOINT_REQUIRED"));
            }
            Ok((host, port))
        }
    }
}

/// Session that can probe reachability but not read tags
pub struct TcpProbeSession {
    host: String,
    port: u16,
    protocol: Protocol,
}

impl ProtocolSession for TcpProbeSession {
    fn probe(&mut self) -> ProbeOutcome {
        let started = Instant::now();
        let addrs = match (self.host.as_str(), self.port).to_socket_addrs() {
            Ok(addrs) => addrs.collect::<Vec<_>>(),
            Err(e) => {
                return ProbeOutcome {
                    ok: false,
                    latency_ms: started.elapsed().as_millis() as i64,
                    error: Some(format!("resolve failed: {}", e)),
                }
            }
        };
        let Some(addr) = addrs.first() else {
            return ProbeOutcome {
                ok: false,
                latency_ms: started.elapsed().as_millis() as i64,
                error: Some("no address".into()),
            };
        };
        match TcpStream::connect_timeout(addr, CONNECT_TIMEOUT) {
            Ok(_stream) => ProbeOutcome {
                ok: true,
                latency_ms: started.elapsed().as_millis() as i64,
                error: None,
            },
            Err(_) => ProbeOutcome {
                ok: false,
                latency_ms: started.elapsed().as_millis() as i64,
                error: Some("TCP_CONNECT_FAILED".into()),
            },
        }
    }

    fn read(&mut self, _tag: &Tag) -> AppResult<Value> {
        Err(AppError::ProtocolDriverMissing {
            protocol: self.protocol.to_string(),
        })
    }

    fn close(&mut self) {}
}

/// Factory used when no driver-backed factory is injected
pub struct TcpProbeFactory;

impl SessionFactory for TcpProbeFactory {
    fn open(&self, device: &Device) -> AppResult<Box<dyn ProtocolSession>> {
        let (host, port) = endpoint_addr(device)?;
        Ok(Box::new(TcpProbeSession {
            host,
            port,
            protocol: device.protocol,
        }))
    }
}
