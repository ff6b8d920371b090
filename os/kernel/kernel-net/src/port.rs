pub const PORT_DNS: u16 = 53;
pub const PORT_BOOTP_SERVER: u16 = 67;
pub const PORT_BOOTP_CLIENT: u16 = 68;
pub const PORT_NTP: u16 = 123;

/// First port of the dynamic range (RFC 6335).
pub const EPHEMERAL_PORT_START: u16 = 49152;

/// Hands out local ports for outgoing connections.
///
/// Collisions with ports still in use are not checked.
#[derive(Debug)]
pub struct PortAllocator {
    next: u16,
}

impl PortAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: EPHEMERAL_PORT_START,
        }
    }

    /// The next port, wrapping from 65535 back to the start of the range.
    pub const fn ephemeral(&mut self) -> u16 {
        let port = self.next;
        self.next = match self.next.checked_add(1) {
            Some(next) => next,
            None => EPHEMERAL_PORT_START,
        };
        port
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_up_and_wraps() {
        let mut ports = PortAllocator::new();
        assert_eq!(ports.ephemeral(), 49152);
        assert_eq!(ports.ephemeral(), 49153);

        let mut ports = PortAllocator { next: u16::MAX };
        assert_eq!(ports.ephemeral(), u16::MAX);
        assert_eq!(ports.ephemeral(), EPHEMERAL_PORT_START);
    }
}
