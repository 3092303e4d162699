//! Decoding of outbound HCI command packets that create LE connections
//!
//! The kernel keeps its LE link bookkeeping straight only when a connection oriented socket is
//! opened for the link, so the two commands that initiate an LE connection are picked out of
//! the outbound stream here and answered with a shadow socket instead of being written to the
//! controller. Everything else passes through untouched.
//!
//! An opcode is the OpCode Group Field (bits 15..10) combined with the OpCode Command Field
//! (bits 9..0); both commands below are in the LE controller group (OGF 0x08).

use crate::{AddressType, DeviceAddress};

/// HCI packet indicator for a command packet
pub(crate) const COMMAND_PACKET: u8 = 0x01;

/// Opcode of the LE Create Connection command (OGF 0x08, OCF 0x00D)
const LE_CREATE_CONNECTION: u16 = 0x200D;

/// Opcode of the LE Extended Create Connection command (OGF 0x08, OCF 0x043)
const LE_EXTENDED_CREATE_CONNECTION: u16 = 0x2043;

// LE Create Connection has a fixed parameter length. The extended variant grows with the
// number of initiating PHYs; the guard keeps every field read below inside the parameters.
const LE_CREATE_CONNECTION_PLEN: usize = 0x19;
const LE_EXTENDED_CREATE_CONNECTION_MIN_PLEN: usize = 0x2A;

/// The connection timing parameters of a create connection command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnTimings {
    /// Minimum connection interval, in 1.25 ms units
    pub interval_min: u16,
    /// Maximum connection interval, in 1.25 ms units
    pub interval_max: u16,
    /// Peripheral latency, in connection events
    pub latency: u16,
    /// Supervision timeout, in 10 ms units
    pub supervision_timeout: u16,
}

/// The parts of an intercepted create connection command that the link registry needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub address: DeviceAddress,
    pub address_type: AddressType,
    pub timings: ConnTimings,
}

fn read_u16(packet: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([packet[offset], packet[offset + 1]])
}

fn read_address(packet: &[u8], offset: usize) -> DeviceAddress {
    let mut address = [0u8; 6];
    address.copy_from_slice(&packet[offset..offset + 6]);
    DeviceAddress(address)
}

/// Decode an outbound packet into a connect request
///
/// Returns `None` for any packet that is not a well formed LE (extended) create connection
/// command, leaving the caller to forward it to the controller unmodified.
pub fn parse(packet: &[u8]) -> Option<ConnectRequest> {
    if packet.len() < 4 || packet[0] != COMMAND_PACKET {
        return None;
    }

    let opcode = read_u16(packet, 1);
    let parameter_len = usize::from(packet[3]);

    match opcode {
        LE_CREATE_CONNECTION
            if parameter_len == LE_CREATE_CONNECTION_PLEN && packet.len() >= 4 + LE_CREATE_CONNECTION_PLEN =>
        {
            Some(ConnectRequest {
                address: read_address(packet, 10),
                address_type: AddressType::from_event_code(packet[9]),
                timings: ConnTimings {
                    interval_min: read_u16(packet, 17),
                    interval_max: read_u16(packet, 19),
                    latency: read_u16(packet, 21),
                    supervision_timeout: read_u16(packet, 23),
                },
            })
        }

        LE_EXTENDED_CREATE_CONNECTION
            if parameter_len >= LE_EXTENDED_CREATE_CONNECTION_MIN_PLEN && packet.len() >= 4 + parameter_len =>
        {
            Some(ConnectRequest {
                address: read_address(packet, 7),
                address_type: AddressType::from_event_code(packet[6]),
                timings: ConnTimings {
                    interval_min: read_u16(packet, 18),
                    interval_max: read_u16(packet, 20),
                    latency: read_u16(packet, 22),
                    supervision_timeout: read_u16(packet, 24),
                },
            })
        }

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_connection_packet() -> Vec<u8> {
        let mut packet = vec![0x01, 0x0D, 0x20, 0x19];

        packet.extend_from_slice(&0x0060u16.to_le_bytes()); // scan interval
        packet.extend_from_slice(&0x0030u16.to_le_bytes()); // scan window
        packet.push(0x00); // initiator filter policy
        packet.push(0x01); // peer address type
        packet.extend_from_slice(&[0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5]);
        packet.push(0x00); // own address type
        packet.extend_from_slice(&0x0006u16.to_le_bytes()); // interval min
        packet.extend_from_slice(&0x000Cu16.to_le_bytes()); // interval max
        packet.extend_from_slice(&0x0000u16.to_le_bytes()); // latency
        packet.extend_from_slice(&0x00C8u16.to_le_bytes()); // supervision timeout
        packet.extend_from_slice(&0x0004u16.to_le_bytes()); // minimum CE length
        packet.extend_from_slice(&0x0006u16.to_le_bytes()); // maximum CE length

        packet
    }

    fn extended_create_connection_packet() -> Vec<u8> {
        let mut packet = vec![0x01, 0x43, 0x20, 0x2A];

        packet.push(0x00); // initiator filter policy
        packet.push(0x00); // own address type
        packet.push(0x00); // peer address type
        packet.extend_from_slice(&[0x10, 0x11, 0x12, 0x13, 0x14, 0x15]);
        packet.push(0x03); // initiating PHYs: LE 1M and LE 2M

        for _ in 0..2 {
            packet.extend_from_slice(&0x0060u16.to_le_bytes()); // scan interval
            packet.extend_from_slice(&0x0030u16.to_le_bytes()); // scan window
            packet.extend_from_slice(&0x0018u16.to_le_bytes()); // interval min
            packet.extend_from_slice(&0x0028u16.to_le_bytes()); // interval max
            packet.extend_from_slice(&0x0001u16.to_le_bytes()); // latency
            packet.extend_from_slice(&0x01F4u16.to_le_bytes()); // supervision timeout
            packet.extend_from_slice(&0x0000u16.to_le_bytes()); // minimum CE length
            packet.extend_from_slice(&0x0000u16.to_le_bytes()); // maximum CE length
        }

        packet
    }

    #[test]
    fn create_connection_is_decoded() {
        assert_eq!(
            parse(&create_connection_packet()),
            Some(ConnectRequest {
                address: DeviceAddress([0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5]),
                address_type: AddressType::Random,
                timings: ConnTimings {
                    interval_min: 0x0006,
                    interval_max: 0x000C,
                    latency: 0x0000,
                    supervision_timeout: 0x00C8,
                },
            })
        );
    }

    #[test]
    fn extended_create_connection_is_decoded() {
        assert_eq!(
            parse(&extended_create_connection_packet()),
            Some(ConnectRequest {
                address: DeviceAddress([0x10, 0x11, 0x12, 0x13, 0x14, 0x15]),
                address_type: AddressType::Public,
                timings: ConnTimings {
                    interval_min: 0x0018,
                    interval_max: 0x0028,
                    latency: 0x0001,
                    supervision_timeout: 0x01F4,
                },
            })
        );
    }

    #[test]
    fn unexpected_parameter_length_passes_through() {
        let mut packet = create_connection_packet();
        packet[3] = 0x18;

        assert_eq!(parse(&packet), None);

        let mut packet = extended_create_connection_packet();
        packet[3] = 0x29;

        assert_eq!(parse(&packet), None);
    }

    #[test]
    fn truncated_packets_pass_through() {
        let mut packet = create_connection_packet();
        packet.truncate(20);

        assert_eq!(parse(&packet), None);

        // an extended create connection whose buffer is shorter than its parameter length
        let mut packet = extended_create_connection_packet();
        packet.truncate(30);

        assert_eq!(parse(&packet), None);
    }

    #[test]
    fn other_traffic_passes_through() {
        // not a command packet
        assert_eq!(parse(&[0x04, 0x0D, 0x20, 0x00]), None);
        // LE create connection cancel
        assert_eq!(parse(&[0x01, 0x0E, 0x20, 0x00]), None);
        // empty
        assert_eq!(parse(&[]), None);
    }
}
