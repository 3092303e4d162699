//! Decoding of inbound HCI event packets into link lifecycle events
//!
//! Only the events that matter for kernel link bookkeeping are decoded: the LE connection
//! complete events (legacy and enhanced) and the disconnection complete event. Anything else,
//! including any truncated or otherwise malformed packet, decodes to `None`.
//!
//! Offsets below are into the full packet as read from the socket, so they include the HCI
//! packet indicator byte at offset zero.

use crate::{AddressType, DeviceAddress};

/// HCI packet indicator for an event packet
pub(crate) const EVENT_PACKET: u8 = 0x04;

const DISCONNECTION_COMPLETE: u8 = 0x05;
const LE_META_EVENT: u8 = 0x3E;

const LE_CONNECTION_COMPLETE: u8 = 0x01;
const LE_ENHANCED_CONNECTION_COMPLETE: u8 = 0x0A;

const STATUS_SUCCESS: u8 = 0x00;

// Parameter lengths of the two LE connection complete flavors. The enhanced event carries the
// local and peer resolvable addresses between the peer address and the connection interval,
// but the fields read here sit in front of those and share their offsets.
const LE_CONNECTION_COMPLETE_PLEN: usize = 19;
const LE_ENHANCED_CONNECTION_COMPLETE_PLEN: usize = 31;
const DISCONNECTION_COMPLETE_PLEN: usize = 4;

/// A decoded link lifecycle event
///
/// Every variant carries the connection handle assigned by the controller. The status is
/// always success (`0x00`) as failed completions are not link lifecycle changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectionComplete {
        handle: u16,
        address: DeviceAddress,
        address_type: AddressType,
        status: u8,
    },
    DisconnectionComplete {
        handle: u16,
        status: u8,
    },
}

fn read_u16(packet: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([packet[offset], packet[offset + 1]])
}

/// Decode an inbound packet into a link lifecycle event
///
/// Returns `None` for any packet that is not a successful LE connection complete or
/// disconnection complete event. A buffer shorter than the fields read for its claimed event
/// code is rejected rather than panicking on.
pub fn parse(packet: &[u8]) -> Option<LinkEvent> {
    if packet.len() < 4 || packet[0] != EVENT_PACKET {
        return None;
    }

    let event_code = packet[1];
    let parameter_len = usize::from(packet[2]);

    match event_code {
        LE_META_EVENT => {
            if parameter_len < 3 || packet.len() < 5 {
                return None;
            }

            let sub_event = packet[3];
            let status = packet[4];

            let claimed_plen = match sub_event {
                LE_CONNECTION_COMPLETE => LE_CONNECTION_COMPLETE_PLEN,
                LE_ENHANCED_CONNECTION_COMPLETE => LE_ENHANCED_CONNECTION_COMPLETE_PLEN,
                _ => return None,
            };

            // the decoded fields end with the peer address at offset 14
            if parameter_len < claimed_plen || packet.len() < 15 || status != STATUS_SUCCESS {
                return None;
            }

            let handle = read_u16(packet, 5);
            let address_type = AddressType::from_event_code(packet[8]);

            let mut address = [0u8; 6];
            address.copy_from_slice(&packet[9..15]);

            Some(LinkEvent::ConnectionComplete {
                handle,
                address: DeviceAddress(address),
                address_type,
                status,
            })
        }

        DISCONNECTION_COMPLETE => {
            if parameter_len < DISCONNECTION_COMPLETE_PLEN || packet.len() < 6 {
                return None;
            }

            let status = packet[3];

            if status != STATUS_SUCCESS {
                return None;
            }

            Some(LinkEvent::DisconnectionComplete {
                handle: read_u16(packet, 4),
                status,
            })
        }

        _ => None,
    }
}
