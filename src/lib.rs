//! A raw HCI socket with LE link bookkeeping workarounds
//!
//! Linux only maintains its Bluetooth LE link bookkeeping correctly when a connection oriented
//! L2CAP socket is open for the link. An application driving the controller over a raw channel
//! bypasses that, and later disconnects or connection parameter updates silently fail inside
//! the kernel. This crate relays HCI packets between the application and the kernel's raw (or
//! user) channel and, on the raw channel, keeps the kernel consistent by:
//!
//! * intercepting the LE create connection commands, writing their timing parameters to the
//!   kernel's debugfs overrides and opening a shadow L2CAP socket instead of forwarding the
//!   command (see [`commands`] and [`shadow`]),
//! * watching the inbound event stream for LE connection and disconnection completions and
//!   keeping a registry of shadow links in step with them (see [`events`] and [`tracker`]).
//!
//! Inbound packets are read by a dedicated background thread and handed to an [`EventSink`]
//! implemented by the application. The packets themselves are never altered in either
//! direction; the only visible effect of the workarounds is that an intercepted command is
//! answered locally (reported as [`WriteOutcome::Handled`]) rather than written out.
//!
//! ```no_run
//! use hci_shim::{Error, EventSink, HciSocket};
//!
//! struct Printer;
//!
//! impl EventSink for Printer {
//!     fn on_packet(&mut self, packet: &[u8]) {
//!         println!("< {:02x?}", packet);
//!     }
//!
//!     fn on_error(&mut self, error: Error) {
//!         eprintln!("reader: {}", error);
//!     }
//! }
//!
//! let mut socket = HciSocket::new();
//!
//! socket.bind_raw(None)?;
//! socket.start(Printer)?;
//! # Ok::<(), hci_shim::Error>(())
//! ```
//!
//! Abandoned connection attempts are reclaimed by [`HciSocket::cleanup`], which the embedding
//! application is expected to call on its own cadence (once a minute is plenty, the in flight
//! timeout is sixty seconds).

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use nix::errno::Errno;
use nix::libc;
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

pub mod commands;
mod debugfs;
mod device;
pub mod events;
pub mod shadow;
pub mod tracker;

pub use events::LinkEvent;

use device::bindings;
use shadow::L2capShadowFactory;
use tracker::LinkTracker;

/// How long the reader blocks per poll before it rechecks the stop flag
const READ_POLL_TIMEOUT_MS: libc::c_int = 1_000;

/// A bluetooth device address
///
/// The bytes are in transfer order (least significant first), as they appear in HCI packets.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceAddress(pub [u8; 6]);

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[5], self.0[4], self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

/// The one bit of a peer address's type that matters for link bookkeeping
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AddressType {
    Public,
    Random,
}

impl AddressType {
    /// Interpret the peer address type field of an HCI event or command
    ///
    /// 0x0 and 0x2 are the public and public identity types, everything else is some form of
    /// random address.
    pub(crate) fn from_event_code(raw: u8) -> AddressType {
        match raw {
            0x00 | 0x02 => AddressType::Public,
            _ => AddressType::Random,
        }
    }

    /// The `BDADDR_LE_*` value the kernel uses for this type in an L2CAP socket address
    pub(crate) fn into_kernel_type(self) -> u8 {
        match self {
            AddressType::Public => bindings::BDADDR_LE_PUBLIC,
            AddressType::Random => bindings::BDADDR_LE_RANDOM,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// Creating the HCI socket failed
    SocketCreate(Errno),
    /// Binding the HCI socket to a channel failed
    Bind(Errno),
    /// A device information or enumeration ioctl failed
    Ioctl(Errno),
    /// Installing the packet filter failed
    SetFilter(Errno),
    /// Reading from the HCI socket failed
    Read(Errno),
    /// Writing to the HCI socket failed
    Write(Errno),
    /// The provided filter is larger than the kernel's filter structure
    OversizedFilter,
    /// The operation needs the socket bound to a channel first
    NotBound,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::SocketCreate(errno) => write!(f, "failed to create hci socket: {}", errno),
            Error::Bind(errno) => write!(f, "failed to bind hci socket: {}", errno),
            Error::Ioctl(errno) => write!(f, "hci device ioctl failed: {}", errno),
            Error::SetFilter(errno) => write!(f, "failed to set hci filter: {}", errno),
            Error::Read(errno) => write!(f, "failed to read from hci socket: {}", errno),
            Error::Write(errno) => write!(f, "failed to write to hci socket: {}", errno),
            Error::OversizedFilter => write!(f, "filter data exceeds the kernel filter size"),
            Error::NotBound => write!(f, "the hci socket is not bound to a channel"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::SocketCreate(errno)
            | Error::Bind(errno)
            | Error::Ioctl(errno)
            | Error::SetFilter(errno)
            | Error::Read(errno)
            | Error::Write(errno) => Some(errno),
            Error::OversizedFilter | Error::NotBound => None,
        }
    }
}

/// The channel a [`HciSocket`] is bound to
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HciChannel {
    Raw,
    User,
    Control,
}

/// What happened to a submitted outbound packet
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WriteOutcome {
    /// The packet was answered locally and must not be written to the kernel again
    Handled,
    /// The packet was written to the kernel socket unmodified
    Forwarded,
}

/// An entry of [`HciSocket::device_list`]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeviceInfo {
    pub dev_id: u16,
    pub up: bool,
}

/// Receiver of everything the background reader produces
///
/// Implementations are driven from the reader thread, not from the thread that created the
/// socket.
pub trait EventSink: Send + 'static {
    /// An inbound packet, framed exactly as the kernel delivered it
    fn on_packet(&mut self, packet: &[u8]);

    /// A decoded link lifecycle event, delivered after the registry processed it
    fn on_link_event(&mut self, _event: &LinkEvent) {}

    /// A read failure that did not stop the reader
    fn on_error(&mut self, error: Error);
}

/// An HCI socket with LE link bookkeeping workarounds on the raw channel
///
/// See the [crate level documentation](crate) for the full picture.
pub struct HciSocket {
    fd: Option<Arc<OwnedFd>>,
    channel: Option<HciChannel>,
    dev_id: u16,
    tracker: Arc<Mutex<LinkTracker<L2capShadowFactory>>>,
    stop: Arc<AtomicBool>,
    reader: Option<thread::JoinHandle<()>>,
}

impl HciSocket {
    pub fn new() -> Self {
        HciSocket {
            fd: None,
            channel: None,
            dev_id: 0,
            tracker: Arc::new(Mutex::new(LinkTracker::new(L2capShadowFactory::default()))),
            stop: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    fn ensure_socket(&mut self) -> Result<Arc<OwnedFd>, Error> {
        if let Some(fd) = &self.fd {
            return Ok(fd.clone());
        }

        let fd = Arc::new(device::new_hci_socket().map_err(Error::SocketCreate)?);

        self.fd = Some(fd.clone());

        Ok(fd)
    }

    /// Bind to the raw channel of a device
    ///
    /// With no device identifier the first device that is up is used. The local address and
    /// address type are fetched from the kernel here; the shadow links for every later
    /// workaround are bound to them. Returns the identifier of the bound device.
    pub fn bind_raw(&mut self, dev_id: Option<u16>) -> Result<u16, Error> {
        let fd = self.ensure_socket()?;

        let dev_id = dev_id.unwrap_or_else(|| device::first_dev_id(fd.as_raw_fd(), true));

        device::bind_channel(fd.as_raw_fd(), dev_id, bindings::HCI_CHANNEL_RAW).map_err(Error::Bind)?;

        self.dev_id = dev_id;
        self.channel = Some(HciChannel::Raw);

        match device::get_dev_info(fd.as_raw_fd(), dev_id) {
            Ok(dev_info) => {
                // device type 3 is normalized to public, a quirk some adapters need
                let local_type = if dev_info.type_ == 3 { 1 } else { dev_info.type_ };
                let local = DeviceAddress(dev_info.bdaddr.b);

                log::debug!("bound raw channel on hci{} ({})", dev_id, local);

                self.tracker
                    .lock()
                    .unwrap()
                    .set_factory(L2capShadowFactory::new(local, local_type));
            }
            Err(errno) => {
                // shadow links will be bound to the any address
                log::debug!("no device information for hci{}: {}", dev_id, errno);
            }
        }

        Ok(dev_id)
    }

    /// Bind to the user channel of a device
    ///
    /// The user channel takes the device away from the kernel entirely, so no bookkeeping
    /// workarounds apply; packets are relayed as they are. With no device identifier the first
    /// device that is down is used (a device must be down to be handed over).
    pub fn bind_user(&mut self, dev_id: Option<u16>) -> Result<u16, Error> {
        let fd = self.ensure_socket()?;

        let dev_id = dev_id.unwrap_or_else(|| device::first_dev_id(fd.as_raw_fd(), false));

        device::bind_channel(fd.as_raw_fd(), dev_id, bindings::HCI_CHANNEL_USER).map_err(Error::Bind)?;

        self.dev_id = dev_id;
        self.channel = Some(HciChannel::User);

        Ok(dev_id)
    }

    /// Bind to the control channel
    pub fn bind_control(&mut self) -> Result<(), Error> {
        let fd = self.ensure_socket()?;

        device::bind_channel(fd.as_raw_fd(), bindings::HCI_DEV_NONE, bindings::HCI_CHANNEL_CONTROL)
            .map_err(Error::Bind)?;

        self.channel = Some(HciChannel::Control);

        Ok(())
    }

    /// Whether the bound device is powered up
    pub fn is_dev_up(&mut self) -> Result<bool, Error> {
        let fd = self.ensure_socket()?;

        Ok(device::is_dev_up(fd.as_raw_fd(), self.dev_id))
    }

    /// Enumerate the HCI devices registered with the kernel
    pub fn device_list(&mut self) -> Result<Vec<DeviceInfo>, Error> {
        let fd = self.ensure_socket()?;

        let devices = device::get_dev_list(fd.as_raw_fd()).map_err(Error::Ioctl)?;

        Ok(devices
            .into_iter()
            .map(|(dev_id, up)| DeviceInfo { dev_id, up })
            .collect())
    }

    /// Install a kernel packet filter on the socket
    ///
    /// The bytes are an `hci_filter` structure in kernel layout; shorter input leaves the
    /// remaining fields zeroed, longer input is rejected.
    pub fn set_filter(&mut self, filter: &[u8]) -> Result<(), Error> {
        if filter.len() > std::mem::size_of::<bindings::hci_filter>() {
            return Err(Error::OversizedFilter);
        }

        let fd = self.ensure_socket()?;

        let mut kernel_filter = bindings::hci_filter::default();

        unsafe {
            std::ptr::copy_nonoverlapping(
                filter.as_ptr(),
                &mut kernel_filter as *mut bindings::hci_filter as *mut u8,
                filter.len(),
            );
        }

        let result = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                bindings::SOL_HCI,
                bindings::HCI_FILTER,
                &kernel_filter as *const bindings::hci_filter as *const libc::c_void,
                std::mem::size_of::<bindings::hci_filter>() as libc::socklen_t,
            )
        };

        Errno::result(result).map_err(Error::SetFilter)?;

        Ok(())
    }

    /// Start the background reader
    ///
    /// Inbound packets are delivered to `sink` from a dedicated thread until [`stop`] is
    /// called. A reader that is already running is stopped first.
    ///
    /// [`stop`]: HciSocket::stop
    pub fn start<S: EventSink>(&mut self, sink: S) -> Result<(), Error> {
        let fd = match &self.fd {
            Some(fd) => fd.clone(),
            None => return Err(Error::NotBound),
        };

        self.stop();
        self.stop.store(false, Ordering::Relaxed);

        let reader = Reader {
            fd,
            raw_channel: self.channel == Some(HciChannel::Raw),
            tracker: self.tracker.clone(),
            stop: self.stop.clone(),
            sink,
        };

        self.reader = Some(thread::spawn(move || reader.run()));

        Ok(())
    }

    /// Stop the background reader
    ///
    /// The reader observes the stop request within one poll timeout, so this blocks for at
    /// most about a second.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);

        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                log::error!("hci reader thread panicked");
            }
        }
    }

    /// Submit an outbound packet
    ///
    /// On the raw channel an LE create connection command is answered locally when its shadow
    /// link can be established, and [`WriteOutcome::Handled`] is returned; the caller must not
    /// also write the packet itself. Everything else, including a create connection whose
    /// shadow link failed, is written to the kernel unmodified.
    pub fn write(&mut self, packet: &[u8]) -> Result<WriteOutcome, Error> {
        let fd = self.ensure_socket()?;

        if self.channel == Some(HciChannel::Raw) {
            if let Some(request) = commands::parse(packet) {
                debugfs::apply_conn_timings(self.dev_id, &request.timings);

                let shadowed = self.tracker.lock().unwrap().intercept_connect(
                    request.address,
                    request.address_type,
                    Instant::now(),
                );

                if shadowed {
                    return Ok(WriteOutcome::Handled);
                }
            }
        }

        loop {
            let written = unsafe { libc::write(fd.as_raw_fd(), packet.as_ptr() as *const libc::c_void, packet.len()) };

            match Errno::result(written) {
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
                Err(errno) => return Err(Error::Write(errno)),
                Ok(_) => return Ok(WriteOutcome::Forwarded),
            }
        }
    }

    /// Reclaim connection attempts whose completion never arrived
    ///
    /// Expected to be called periodically by the embedding application; attempts expire sixty
    /// seconds after the intercepted command.
    pub fn cleanup(&self) {
        self.tracker.lock().unwrap().cleanup(Instant::now());
    }

    /// The address the registry currently associates with a connection handle
    pub fn peer_of(&self, handle: u16) -> Option<DeviceAddress> {
        self.tracker.lock().unwrap().peer_of(handle)
    }

    /// The identifier of the bound device
    pub fn dev_id(&self) -> u16 {
        self.dev_id
    }

    /// The channel the socket is bound to, if any
    pub fn channel(&self) -> Option<HciChannel> {
        self.channel
    }
}

impl Default for HciSocket {
    fn default() -> Self {
        HciSocket::new()
    }
}

impl Drop for HciSocket {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The background packet reader
///
/// Owns its half of the shared socket; whichever of the reader and the [`HciSocket`] is
/// dropped last closes the descriptor.
struct Reader<S> {
    fd: Arc<OwnedFd>,
    raw_channel: bool,
    tracker: Arc<Mutex<LinkTracker<L2capShadowFactory>>>,
    stop: Arc<AtomicBool>,
    sink: S,
}

impl<S: EventSink> Reader<S> {
    fn run(mut self) {
        let mut buffer = [0u8; 1024];

        while !self.stop.load(Ordering::Relaxed) {
            match self.wait_readable() {
                Ok(true) => {}
                Ok(false) => continue,
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                Err(errno) => {
                    if self.stop.load(Ordering::Relaxed) {
                        break;
                    }

                    self.sink.on_error(Error::Read(errno));
                    continue;
                }
            }

            let len = {
                let read = unsafe {
                    libc::read(
                        self.fd.as_raw_fd(),
                        buffer.as_mut_ptr() as *mut libc::c_void,
                        buffer.len(),
                    )
                };

                match Errno::result(read) {
                    Ok(len) => len as usize,
                    Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                    Err(errno) => {
                        if self.stop.load(Ordering::Relaxed) {
                            break;
                        }

                        self.sink.on_error(Error::Read(errno));
                        continue;
                    }
                }
            };

            if len == 0 {
                continue;
            }

            let packet = &buffer[..len];

            // the kernel only needs its hand held on the raw channel
            if self.raw_channel {
                if let Some(event) = events::parse(packet) {
                    self.tracker.lock().unwrap().handle_event(&event);

                    self.sink.on_link_event(&event);
                }
            }

            self.sink.on_packet(packet);
        }

        log::debug!("hci reader stopped");
    }

    /// Poll the socket for readability, bounded so the stop flag stays observed
    ///
    /// Error conditions also report as ready; the following read surfaces them.
    fn wait_readable(&self) -> Result<bool, Errno> {
        let mut poll_fd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        let count = Errno::result(unsafe { libc::poll(&mut poll_fd, 1, READ_POLL_TIMEOUT_MS) })?;

        Ok(count > 0 && poll_fd.revents != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_display_most_significant_byte_first() {
        let address = DeviceAddress([0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5]);

        assert_eq!(address.to_string(), "A5:A4:A3:A2:A1:A0");
    }

    #[test]
    fn address_types_cover_the_identity_variants() {
        assert_eq!(AddressType::from_event_code(0x00), AddressType::Public);
        assert_eq!(AddressType::from_event_code(0x01), AddressType::Random);
        assert_eq!(AddressType::from_event_code(0x02), AddressType::Public);
        assert_eq!(AddressType::from_event_code(0x03), AddressType::Random);

        assert_eq!(AddressType::Public.into_kernel_type(), 1);
        assert_eq!(AddressType::Random.into_kernel_type(), 2);
    }

    #[test]
    fn oversized_filters_are_rejected_up_front() {
        let mut socket = HciSocket::new();

        // one byte past the kernel's padded hci_filter structure
        assert_eq!(socket.set_filter(&[0u8; 17]), Err(Error::OversizedFilter));
    }

    #[test]
    fn errors_carry_their_errno() {
        let error = Error::Bind(Errno::EADDRINUSE);

        assert!(error.to_string().contains("bind"));
        assert!(std::error::Error::source(&error).is_some());
        assert!(std::error::Error::source(&Error::OversizedFilter).is_none());
    }
}
