use crate::addr::{EthAddr, Ipv4Addr};
use crate::buf::NetBuf;
use crate::eth::{ET_ARP, ET_IPV4};
use crate::intf::{IntfId, Interface, Link};
use crate::route::Route;
use crate::NetStack;
use alloc::string::String;

pub const LOOPBACK_NAME: &str = "loop";

impl NetStack {
    /// Register `loop` at 127.0.0.1 with a host route.
    pub(crate) fn loopback_init(&mut self) -> IntfId {
        let ip = Ipv4Addr::LOCALHOST;
        let id = self.push_interface(Interface::new(
            String::from(LOOPBACK_NAME),
            EthAddr::NULL,
            ip,
            Link::Loopback,
        ));
        self.routes.add(Route {
            dst: ip,
            mask: Ipv4Addr::BROADCAST,
            gateway: Ipv4Addr::UNSPECIFIED,
            intf: id,
        });
        id
    }

    /// Feed a packet sent on the loopback interface straight back into the
    /// receive path.
    pub(crate) fn loop_send(&mut self, intf: IntfId, ethertype: u16, buf: NetBuf) {
        match ethertype {
            ET_ARP => self.arp_recv(intf, buf),
            ET_IPV4 => self.ipv4_recv(intf, buf),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Recorder, stack_with_wire};
    use crate::{TcpError, TcpState};

    #[test]
    fn init_installs_host_route() {
        let (mut stack, _wire) = stack_with_wire([10, 0, 0, 1]);
        stack.init();
        let route = stack.routes().find(Ipv4Addr::LOCALHOST).unwrap();
        assert_eq!(stack.interface(route.intf).unwrap().name, "loop");
        assert!(stack.interface(route.intf).unwrap().is_loopback());
    }

    #[test]
    fn ping_to_localhost_loops_back() {
        let (mut stack, wire) = stack_with_wire([10, 0, 0, 1]);
        stack.init();
        assert!(stack.icmp_echo_request(Ipv4Addr::LOCALHOST, 1, 1, b"hi").is_ok());
        assert!(wire.sent().is_empty());
    }

    #[test]
    fn connect_to_closed_local_port_is_reset() {
        let (mut stack, _wire) = stack_with_wire([10, 0, 0, 1]);
        stack.init();
        let (recorder, events) = Recorder::new();
        let id = stack
            .tcp_connect(Ipv4Addr::LOCALHOST, 7, Some(recorder))
            .unwrap();

        assert!(stack.tcp_conn(id).is_none());
        let events = events.lock().unwrap();
        assert_eq!(events.errors, [TcpError::Refused]);
        assert_eq!(events.states.last(), Some(&(TcpState::SynSent, TcpState::Closed)));
    }
}
