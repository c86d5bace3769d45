// Copyright © 2024 The vfio-pci Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Cooperative hot-remove.
//!
//! The host side owns the hardware and can reclaim it at any time. At
//! attach we register each function on an out-of-band control socket,
//! announcing that we handle remove requests. When one arrives the
//! guest is asked to release the device, and a hard deadline starts
//! ticking: a guest that sits on the hardware past it takes the whole
//! process down, since the host is already waiting on the function.

use std::fs::File;
use std::io;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use thiserror::Error;
use vm_memory::ByteValued;

use crate::{PciHostAddress, VmmServices};

const CONTROL_REGISTER: u32 = 1;
const CONTROL_REMOVE: u32 = 2;

const REMOVAL_DEADLINE_SECS: i64 = 30;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to connect to the control socket: {0}")]
    Connect(#[source] io::Error),
    #[error("Failed to send control message: {0}")]
    Send(#[source] io::Error),
    #[error("Failed to receive control message: {0}")]
    Receive(#[source] io::Error),
    #[error("Failed to arm removal deadline: {0}")]
    Timer(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct ControlMessage {
    kind: u32,
    capability_mask: u32,
    segment: u16,
    bus: u8,
    device: u8,
    function: u8,
    _pad: [u8; 3],
}

// SAFETY: plain bytes, no padding holes, any bit pattern is valid.
unsafe impl ByteValued for ControlMessage {}

impl ControlMessage {
    fn new(kind: u32, host: &PciHostAddress) -> Self {
        ControlMessage {
            kind,
            capability_mask: 1 << CONTROL_REMOVE,
            segment: host.segment,
            bus: host.bus,
            device: host.device,
            function: host.function,
            _pad: [0; 3],
        }
    }

    fn host(&self) -> PciHostAddress {
        PciHostAddress {
            segment: self.segment,
            bus: self.bus,
            device: self.device,
            function: self.function,
        }
    }
}

/// A remove request the guest has not answered yet.
pub struct PendingRemoval {
    pub host: PciHostAddress,
    timer: File,
}

impl PendingRemoval {
    pub fn timer_fd(&self) -> RawFd {
        self.timer.as_raw_fd()
    }
}

pub struct RemovalBroker {
    stream: UnixStream,
    registered: Vec<PciHostAddress>,
    pending: Vec<PendingRemoval>,
}

impl RemovalBroker {
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let stream = UnixStream::connect(path).map_err(ProtocolError::Connect)?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        RemovalBroker {
            stream,
            registered: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn socket_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn pending(&self) -> &[PendingRemoval] {
        &self.pending
    }

    /// Announce an attached function to the host side.
    pub fn register(&mut self, host: PciHostAddress) -> Result<()> {
        let msg = ControlMessage::new(CONTROL_REGISTER, &host);
        (&self.stream)
            .write_all(msg.as_slice())
            .map_err(ProtocolError::Send)?;
        self.registered.push(host);
        debug!("registered {} for hot-remove", host);
        Ok(())
    }

    /// Forget a function at detach. Any pending deadline for it is
    /// disarmed; the detach itself is the answer the host wanted.
    pub fn unregister(&mut self, host: &PciHostAddress) {
        self.registered.retain(|h| h != host);
        self.pending.retain(|p| p.host != *host);
    }

    /// The control socket became readable: take one message and act
    /// on it. A remove for a function we never registered, or a kind
    /// we do not handle, is logged and dropped.
    pub fn handle_control_event(&mut self, vmm: &dyn VmmServices) -> Result<()> {
        let mut msg = ControlMessage::default();
        (&self.stream)
            .read_exact(msg.as_mut_slice())
            .map_err(ProtocolError::Receive)?;

        match msg.kind {
            CONTROL_REMOVE => {
                let host = msg.host();
                if !self.registered.contains(&host) {
                    warn!("ignoring remove request for unknown device {}", host);
                    return Ok(());
                }
                if self.pending.iter().any(|p| p.host == host) {
                    return Ok(());
                }

                info!("host requested removal of {}", host);
                let timer = arm_deadline()?;
                self.pending.push(PendingRemoval { host, timer });
                vmm.request_unplug(&host);
                Ok(())
            }
            kind => {
                warn!("ignoring control message of unhandled kind {}", kind);
                Ok(())
            }
        }
    }

    /// A removal deadline fired. There is no way to give the hardware
    /// back gracefully any more.
    pub fn deadline_expired(&self, host: &PciHostAddress) -> ! {
        error!(
            "guest did not release {} within {}s, giving up",
            host, REMOVAL_DEADLINE_SECS
        );
        std::process::abort();
    }
}

fn arm_deadline() -> Result<File> {
    // SAFETY: creating a new descriptor, checked below.
    let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK) };
    if fd < 0 {
        return Err(ProtocolError::Timer(io::Error::last_os_error()));
    }
    // SAFETY: fd was just returned to us and is owned by nobody else.
    let timer = unsafe { File::from_raw_fd(fd) };

    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: REMOVAL_DEADLINE_SECS,
            tv_nsec: 0,
        },
    };
    // SAFETY: fd is a valid timerfd and spec outlives the call.
    let ret = unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) };
    if ret < 0 {
        return Err(ProtocolError::Timer(io::Error::last_os_error()));
    }

    Ok(timer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::tests_support::{FakeVmm, VmmCall};

    fn host() -> PciHostAddress {
        PciHostAddress {
            segment: 0,
            bus: 2,
            device: 3,
            function: 0,
        }
    }

    fn pair() -> (RemovalBroker, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        (RemovalBroker::from_stream(ours), theirs)
    }

    #[test]
    fn register_announces_the_remove_capability() {
        let (mut broker, mut peer) = pair();
        broker.register(host()).unwrap();

        let mut msg = ControlMessage::default();
        peer.read_exact(msg.as_mut_slice()).unwrap();
        assert_eq!(msg.kind, CONTROL_REGISTER);
        assert_eq!(msg.capability_mask, 1 << CONTROL_REMOVE);
        assert_eq!(msg.host(), host());
    }

    #[test]
    fn remove_request_arms_a_deadline() {
        let (mut broker, mut peer) = pair();
        broker.register(host()).unwrap();

        let msg = ControlMessage::new(CONTROL_REMOVE, &host());
        peer.write_all(msg.as_slice()).unwrap();

        let vmm = FakeVmm::default();
        broker.handle_control_event(&vmm).unwrap();

        assert_eq!(
            vmm.calls.borrow().as_slice(),
            &[VmmCall::RequestUnplug(host())]
        );
        assert_eq!(broker.pending().len(), 1);
        assert_eq!(broker.pending()[0].host, host());
        assert!(broker.pending()[0].timer_fd() >= 0);
    }

    #[test]
    fn remove_of_unknown_device_is_dropped() {
        let (mut broker, mut peer) = pair();

        let msg = ControlMessage::new(CONTROL_REMOVE, &host());
        peer.write_all(msg.as_slice()).unwrap();

        let vmm = FakeVmm::default();
        broker.handle_control_event(&vmm).unwrap();

        assert!(vmm.calls.borrow().is_empty());
        assert!(broker.pending().is_empty());
    }

    #[test]
    fn detach_disarms_the_deadline() {
        let (mut broker, mut peer) = pair();
        broker.register(host()).unwrap();

        let msg = ControlMessage::new(CONTROL_REMOVE, &host());
        peer.write_all(msg.as_slice()).unwrap();
        broker.handle_control_event(&FakeVmm::default()).unwrap();
        assert_eq!(broker.pending().len(), 1);

        broker.unregister(&host());
        assert!(broker.pending().is_empty());
    }

    #[test]
    fn unhandled_message_kind_is_dropped() {
        let (mut broker, mut peer) = pair();
        broker.register(host()).unwrap();

        let msg = ControlMessage::new(99, &host());
        peer.write_all(msg.as_slice()).unwrap();

        let vmm = FakeVmm::default();
        broker.handle_control_event(&vmm).unwrap();
        assert!(vmm.calls.borrow().is_empty());
        assert!(broker.pending().is_empty());
    }

    #[test]
    fn control_message_layout() {
        assert_eq!(std::mem::size_of::<ControlMessage>(), 16);
    }
}
