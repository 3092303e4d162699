//! Linux Bluetooth device functionality
//!
//! These are the functions used to interface with the bluetooth devices on the system. This
//! isn't a complete implementation of the control operations the kernel offers, it is just the
//! functionality used by this library. These are linux specific and have no relation to the
//! bluetooth specification.

use nix::errno::Errno;
use nix::libc;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

pub(crate) mod bindings;

fn test_flag(bit: u32, field: u32) -> bool {
    field & (1 << bit) != 0
}

/// Create an unbound HCI socket
pub(crate) fn new_hci_socket() -> Result<OwnedFd, Errno> {
    let raw_fd = unsafe {
        libc::socket(
            libc::AF_BLUETOOTH,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            bindings::BTPROTO_HCI,
        )
    };

    if raw_fd < 0 {
        return Err(Errno::last());
    }

    Ok(unsafe { OwnedFd::from_raw_fd(raw_fd) })
}

/// Bind an HCI socket to a device and channel
///
/// `HCI_DEV_NONE` is a valid device for the control channel.
pub(crate) fn bind_channel(fd: RawFd, dev_id: u16, channel: u16) -> Result<(), Errno> {
    let sa_p = &bindings::sockaddr_hci {
        hci_family: libc::AF_BLUETOOTH as libc::sa_family_t,
        hci_dev: dev_id,
        hci_channel: channel,
    } as *const bindings::sockaddr_hci as *const libc::sockaddr;

    let sa_len = std::mem::size_of::<bindings::sockaddr_hci>() as libc::socklen_t;

    if unsafe { libc::bind(fd, sa_p, sa_len) } < 0 {
        return Err(Errno::last());
    }

    Ok(())
}

///////////
// ioctl structures
////

// ioctl magic for the IOCTL values
const HCI_IOC_MAGIC: u8 = b'H';

const HCI_IOC_HCIGETDEVLIST: u8 = 210;
const HCI_IOC_HCIGETDEVINFO: u8 = 211;

//////
// The following functions cannot use nix's handy ioctl_read! macros because the request code
// does not use the same type as the request structure

unsafe fn hci_get_dev_list(fd: RawFd, list: &mut bindings::hci_dev_list_req) -> nix::Result<libc::c_int> {
    use std::mem::size_of;

    let request_code = nix::request_code_read!(HCI_IOC_MAGIC, HCI_IOC_HCIGETDEVLIST, size_of::<libc::c_int>());

    let raw_errno = libc::ioctl(fd, request_code, list as *mut _ as *mut libc::c_void);

    Errno::result(raw_errno)
}

unsafe fn hci_get_dev_info(fd: RawFd, info: &mut bindings::hci_dev_info) -> nix::Result<libc::c_int> {
    use std::mem::size_of;

    let request_code = nix::request_code_read!(HCI_IOC_MAGIC, HCI_IOC_HCIGETDEVINFO, size_of::<libc::c_int>());

    let raw_errno = libc::ioctl(fd, request_code, info as *mut _ as *mut libc::c_void);

    Errno::result(raw_errno)
}

/// Enumerate the HCI devices on the system
///
/// Returns the device identifier and the up/down state of every registered controller.
pub(crate) fn get_dev_list(fd: RawFd) -> nix::Result<Vec<(u16, bool)>> {
    let mut list = bindings::hci_dev_list_req::default();

    unsafe { hci_get_dev_list(fd, &mut list)? };

    // the kernel rewrites dev_num with the number of entries it filled in
    let filled = usize::from(list.dev_num).min(bindings::HCI_MAX_DEV);

    Ok(list.dev_req[..filled]
        .iter()
        .map(|dev_req| (dev_req.dev_id, test_flag(bindings::HCI_UP, dev_req.dev_opt)))
        .collect())
}

/// Get the kernel's information record for a device
pub(crate) fn get_dev_info(fd: RawFd, dev_id: u16) -> nix::Result<bindings::hci_dev_info> {
    let mut dev_info = bindings::hci_dev_info::default();

    dev_info.dev_id = dev_id;

    unsafe { hci_get_dev_info(fd, &mut dev_info)? };

    Ok(dev_info)
}

/// Pick a device identifier for binding
///
/// When no identifier is requested the first device whose up/down state matches `want_up` is
/// chosen (a raw channel needs a device that is up, a user channel needs one that is down).
/// Device zero is the fallback when enumeration fails or nothing matches.
pub(crate) fn first_dev_id(fd: RawFd, want_up: bool) -> u16 {
    match get_dev_list(fd) {
        Ok(devices) => devices
            .iter()
            .find(|(_, up)| *up == want_up)
            .map(|(dev_id, _)| *dev_id)
            .unwrap_or(0),
        Err(errno) => {
            log::debug!("failed to enumerate hci devices: {}", errno);
            0
        }
    }
}

/// Check whether a device is up
pub(crate) fn is_dev_up(fd: RawFd, dev_id: u16) -> bool {
    get_dev_info(fd, dev_id)
        .map(|dev_info| test_flag(bindings::HCI_UP, dev_info.flags))
        .unwrap_or(false)
}
