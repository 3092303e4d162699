//! Hand-written bindings for the Linux Bluetooth socket interface
//!
//! These are the kernel structures and constants used by this crate. They are written out by
//! hand instead of generated with `rust-bindgen` as the kernel headers for Bluetooth are not
//! part of the standard libc headers on every distribution.

#![allow(non_camel_case_types, dead_code)]

use nix::libc::{c_int, sa_family_t};

pub(crate) const BTPROTO_L2CAP: c_int = 0;
pub(crate) const BTPROTO_HCI: c_int = 1;

pub(crate) const SOL_HCI: c_int = 0;
pub(crate) const HCI_FILTER: c_int = 2;

pub(crate) const HCI_CHANNEL_RAW: u16 = 0;
pub(crate) const HCI_CHANNEL_USER: u16 = 1;
pub(crate) const HCI_CHANNEL_CONTROL: u16 = 3;

pub(crate) const HCI_DEV_NONE: u16 = 0xFFFF;
pub(crate) const HCI_MAX_DEV: usize = 16;

/// Bit position of the `HCI_UP` flag within `hci_dev_req::dev_opt` and `hci_dev_info::flags`
pub(crate) const HCI_UP: u32 = 0;

/// The fixed channel identifier for Attribute Protocol traffic
pub(crate) const ATT_CID: u16 = 4;

/// `l2_bdaddr_type` values for `sockaddr_l2`
pub(crate) const BDADDR_LE_PUBLIC: u8 = 1;
pub(crate) const BDADDR_LE_RANDOM: u8 = 2;

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(crate) struct bdaddr_t {
    pub b: [u8; 6],
}

#[repr(C)]
pub(crate) struct sockaddr_hci {
    pub hci_family: sa_family_t,
    pub hci_dev: u16,
    pub hci_channel: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct sockaddr_l2 {
    pub l2_family: sa_family_t,
    pub l2_psm: u16,
    pub l2_bdaddr: bdaddr_t,
    pub l2_cid: u16,
    pub l2_bdaddr_type: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(crate) struct hci_dev_req {
    pub dev_id: u16,
    pub dev_opt: u32,
}

/// The request structure for `HCIGETDEVLIST`
///
/// The kernel declares `dev_req` as a flexible array member; a fixed array of [`HCI_MAX_DEV`]
/// entries has the same layout and saves the manual allocation.
#[repr(C)]
pub(crate) struct hci_dev_list_req {
    pub dev_num: u16,
    pub dev_req: [hci_dev_req; HCI_MAX_DEV],
}

impl Default for hci_dev_list_req {
    fn default() -> Self {
        hci_dev_list_req {
            dev_num: HCI_MAX_DEV as u16,
            dev_req: [hci_dev_req::default(); HCI_MAX_DEV],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(crate) struct hci_filter {
    pub type_mask: u32,
    pub event_mask: [u32; 2],
    pub opcode: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct hci_dev_info {
    pub dev_id: u16,
    pub name: [u8; 8],
    pub bdaddr: bdaddr_t,
    pub flags: u32,
    pub type_: u8,
    pub features: [u8; 8],
    pub pkt_type: u32,
    pub link_policy: u32,
    pub link_mode: u32,
    pub acl_mtu: u16,
    pub acl_pkts: u16,
    pub sco_mtu: u16,
    pub sco_pkts: u16,
    pub stat: hci_dev_stats,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(crate) struct hci_dev_stats {
    pub err_rx: u32,
    pub err_tx: u32,
    pub cmd_tx: u32,
    pub evt_rx: u32,
    pub acl_tx: u32,
    pub acl_rx: u32,
    pub sco_tx: u32,
    pub sco_rx: u32,
    pub byte_rx: u32,
    pub byte_tx: u32,
}

impl Default for hci_dev_info {
    fn default() -> Self {
        hci_dev_info {
            dev_id: 0,
            name: Default::default(),
            bdaddr: bdaddr_t { b: Default::default() },
            flags: 0,
            type_: 0,
            features: Default::default(),
            pkt_type: 0,
            link_policy: 0,
            link_mode: 0,
            acl_mtu: 0,
            acl_pkts: 0,
            sco_mtu: 0,
            sco_pkts: 0,
            stat: hci_dev_stats::default(),
        }
    }
}
