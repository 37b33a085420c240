//! Loopback port reservation for the proxy daemon
//!
//! Ports are picked by binding listeners on 127.0.0.1 and held until just
//! before the daemon is spawned, so two reservations in the same process can
//! never hand out the same port.

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

use crate::error::ProxyError;

/// A reserved SOCKS + control port pair
#[derive(Debug)]
pub struct PortReservation {
    pub socks_port: u16,
    pub control_port: u16,
    listeners: Vec<TcpListener>,
}

impl PortReservation {
    /// Reserve ports; zero means "pick a free one"
    ///
    /// Non-zero ports are bound too, which surfaces conflicts before launch.
    pub fn reserve(socks_port: u16, control_port: u16) -> Result<Self, ProxyError> {
        if socks_port != 0 && socks_port == control_port {
            return Err(ProxyError::Ports(format!(
                "SOCKS and control port must differ (both {})",
                socks_port
            )));
        }

        let socks = bind(socks_port)?;
        let control = bind(control_port)?;
        let socks_port = local_port(&socks)?;
        let control_port = local_port(&control)?;

        Ok(Self {
            socks_port,
            control_port,
            listeners: vec![socks, control],
        })
    }

    /// Release the listeners so the daemon can bind the ports
    pub fn release(mut self) -> (u16, u16) {
        self.listeners.clear();
        (self.socks_port, self.control_port)
    }
}

fn bind(port: u16) -> Result<TcpListener, ProxyError> {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
        .map_err(|e| ProxyError::Ports(format!("cannot bind 127.0.0.1:{}: {}", port, e)))
}

fn local_port(listener: &TcpListener) -> Result<u16, ProxyError> {
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| ProxyError::Ports(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_ports_are_distinct() {
        let reservation = PortReservation::reserve(0, 0).unwrap();
        assert_ne!(reservation.socks_port, 0);
        assert_ne!(reservation.control_port, 0);
        assert_ne!(reservation.socks_port, reservation.control_port);
    }

    #[test]
    fn test_reservation_holds_ports_until_release() {
        let reservation = PortReservation::reserve(0, 0).unwrap();
        let socks = reservation.socks_port;
        assert!(TcpListener::bind(("127.0.0.1", socks)).is_err());

        let (released, _) = reservation.release();
        assert_eq!(released, socks);
        assert!(TcpListener::bind(("127.0.0.1", socks)).is_ok());
    }

    #[test]
    fn test_explicit_ports_honored() {
        let scratch = PortReservation::reserve(0, 0).unwrap();
        let (socks, control) = scratch.release();
        let reservation = PortReservation::reserve(socks, control).unwrap();
        assert_eq!(reservation.socks_port, socks);
        assert_eq!(reservation.control_port, control);
    }

    #[test]
    fn test_equal_explicit_ports_rejected() {
        let err = PortReservation::reserve(9050, 9050).unwrap_err();
        assert!(matches!(err, ProxyError::Ports(_)));
    }

    #[test]
    fn test_port_in_use_rejected() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        assert!(PortReservation::reserve(port, 0).is_err());
    }
}
