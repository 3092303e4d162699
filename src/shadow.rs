//! Shadow L2CAP links
//!
//! A shadow link is a connection oriented L2CAP socket that is opened purely so the kernel
//! creates and maintains its bookkeeping for an LE link; no payload traffic ever crosses it.
//! Closing the socket is what later lets the kernel process a disconnection for the link.
//!
//! The [`Shadow`] and [`ShadowFactory`] traits are the seam between the link registry and the
//! kernel. The registry only ever asks a shadow to connect or disconnect and checks its
//! connectedness; it is the registry that decides when either happens.

use crate::device::bindings;
use crate::{AddressType, DeviceAddress};
use nix::errno::Errno;
use nix::libc;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// One kernel level dummy connection per tracked peer
///
/// `connect` and `disconnect` never fail; a connect that could not be completed leaves the
/// shadow disconnected and the caller checks [`is_connected`](Shadow::is_connected).
pub trait Shadow {
    fn connect(&mut self);

    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;
}

/// Maker of [`Shadow`] links, carrying whatever local identity they need
pub trait ShadowFactory {
    type Shadow: Shadow;

    fn open(&self, peer: DeviceAddress, peer_type: AddressType) -> Self::Shadow;
}

/// A shadow link backed by a real L2CAP socket
pub struct L2capShadow {
    src: bindings::sockaddr_l2,
    dst: bindings::sockaddr_l2,
    fd: Option<OwnedFd>,
}

impl Shadow for L2capShadow {
    fn connect(&mut self) {
        // drop any previous socket before opening a fresh one
        self.fd = None;

        let raw_fd = unsafe {
            libc::socket(
                libc::AF_BLUETOOTH,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                bindings::BTPROTO_L2CAP,
            )
        };

        if raw_fd < 0 {
            log::debug!("shadow socket creation failed: {}", Errno::last());
            return;
        }

        let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        let src_p = &self.src as *const bindings::sockaddr_l2 as *const libc::sockaddr;
        let dst_p = &self.dst as *const bindings::sockaddr_l2 as *const libc::sockaddr;
        let sa_len = std::mem::size_of::<bindings::sockaddr_l2>() as libc::socklen_t;

        if unsafe { libc::bind(fd.as_raw_fd(), src_p, sa_len) } < 0 {
            log::debug!("shadow socket bind failed: {}", Errno::last());
            return;
        }

        // the kernel may need to flush the socket before the connect goes through
        while unsafe { libc::connect(fd.as_raw_fd(), dst_p, sa_len) } < 0 {
            match Errno::last() {
                Errno::EINTR => continue,
                errno => {
                    log::debug!("shadow socket connect failed: {}", errno);
                    return;
                }
            }
        }

        self.fd = Some(fd);
    }

    fn disconnect(&mut self) {
        self.fd = None;
    }

    fn is_connected(&self) -> bool {
        self.fd.is_some()
    }
}

/// Factory for [`L2capShadow`] links bound to the local adapter
///
/// The local address and address type come from the kernel's device information record at the
/// time the raw channel is bound.
#[derive(Default)]
pub struct L2capShadowFactory {
    local: DeviceAddress,
    local_type: u8,
}

impl L2capShadowFactory {
    pub fn new(local: DeviceAddress, local_type: u8) -> Self {
        L2capShadowFactory { local, local_type }
    }
}

impl ShadowFactory for L2capShadowFactory {
    type Shadow = L2capShadow;

    fn open(&self, peer: DeviceAddress, peer_type: AddressType) -> L2capShadow {
        let family = libc::AF_BLUETOOTH as libc::sa_family_t;

        // the attribute protocol channel identifier, in bluetooth byte order
        let cid = bindings::ATT_CID.to_le();

        let src = bindings::sockaddr_l2 {
            l2_family: family,
            l2_psm: 0,
            l2_bdaddr: bindings::bdaddr_t { b: self.local.0 },
            l2_cid: cid,
            l2_bdaddr_type: self.local_type,
        };

        let dst = bindings::sockaddr_l2 {
            l2_family: family,
            l2_psm: 0,
            l2_bdaddr: bindings::bdaddr_t { b: peer.0 },
            l2_cid: cid,
            l2_bdaddr_type: peer_type.into_kernel_type(),
        };

        L2capShadow { src, dst, fd: None }
    }
}
