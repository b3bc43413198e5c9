//! Host port allocation.

use std::net::{Ipv4Addr, TcpListener};

/// Ask the OS for `count` distinct free ports on loopback.
///
/// Each listener is held until all ports are chosen, then dropped. Nothing
/// stops another process from binding a port before the container does.
pub fn allocate_ports(count: usize) -> std::io::Result<Vec<u16>> {
    let mut listeners = Vec::with_capacity(count);
    for _ in 0..count {
        listeners.push(TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?);
    }
    listeners
        .iter()
        .map(|l| l.local_addr().map(|addr| addr.port()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_distinct_nonzero_ports() {
        let ports = allocate_ports(2).unwrap();
        assert_eq!(ports.len(), 2);
        assert_ne!(ports[0], ports[1]);
        assert!(ports.iter().all(|p| *p != 0));
    }

    #[test]
    fn test_ports_are_released() {
        let port = allocate_ports(1).unwrap()[0];
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
    }
}
