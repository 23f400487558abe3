use std::net::TcpListener;

/// Management API port of the server runtime.
pub const MGMT_PORT: u16 = 4848;
/// Statistics/info port of the server runtime.
pub const INFO_PORT: u16 = 2609;
pub const DEFAULT_HTTP_PORT: u16 = 8080;

pub trait PortProbe {
    fn is_available(&self, port: u16) -> bool;
}

/// Checks availability by binding the loopback address.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalPortProbe;

impl PortProbe for LocalPortProbe {
    fn is_available(&self, port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }
}

/// Ports the sandbox server binds for a given HTTP port, without duplicates.
pub fn sandbox_ports(http_port: u16) -> Vec<u16> {
    let mut ports = Vec::with_capacity(3);
    for port in [http_port, MGMT_PORT, INFO_PORT] {
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    ports
}

pub fn unavailable_ports(probe: &dyn PortProbe, ports: &[u16]) -> Vec<u16> {
    ports
        .iter()
        .copied()
        .filter(|port| !probe.is_available(*port))
        .collect()
}
