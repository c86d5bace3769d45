// Copyright © 2024 The vfio-pci Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Event dispatch.
//!
//! Everything the crate reacts to is a readable descriptor: the line
//! interrupt eventfd, one eventfd per message vector, the hot-remove
//! control socket and the removal deadline timers. They all hang off
//! one epoll descriptor and are told apart by token.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Failed to create epoll descriptor: {0}")]
    Create(#[source] io::Error),
    #[error("Failed to update epoll interest: {0}")]
    Ctl(#[source] io::Error),
    #[error("epoll_wait failed: {0}")]
    Wait(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, EventError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpollDispatch {
    /// The line interrupt fired.
    Intx,
    /// The hot-remove control socket is readable.
    Control,
    /// A message vector fired.
    Vector(usize),
    /// A removal deadline expired.
    RemovalDeadline(usize),
    Unknown,
}

const TOKEN_INTX: u64 = 0;
const TOKEN_CONTROL: u64 = 1;
const TOKEN_VECTOR_BASE: u64 = 0x100;
const TOKEN_DEADLINE_BASE: u64 = 0x1_0000;

impl EpollDispatch {
    fn token(self) -> u64 {
        match self {
            EpollDispatch::Intx => TOKEN_INTX,
            EpollDispatch::Control => TOKEN_CONTROL,
            EpollDispatch::Vector(i) => TOKEN_VECTOR_BASE + i as u64,
            EpollDispatch::RemovalDeadline(i) => TOKEN_DEADLINE_BASE + i as u64,
            EpollDispatch::Unknown => u64::MAX,
        }
    }
}

impl From<u64> for EpollDispatch {
    fn from(token: u64) -> Self {
        match token {
            TOKEN_INTX => EpollDispatch::Intx,
            TOKEN_CONTROL => EpollDispatch::Control,
            t if (TOKEN_VECTOR_BASE..TOKEN_DEADLINE_BASE).contains(&t) => {
                EpollDispatch::Vector((t - TOKEN_VECTOR_BASE) as usize)
            }
            t if t >= TOKEN_DEADLINE_BASE && t != u64::MAX => {
                EpollDispatch::RemovalDeadline((t - TOKEN_DEADLINE_BASE) as usize)
            }
            _ => EpollDispatch::Unknown,
        }
    }
}

pub struct EpollContext {
    epoll_fd: RawFd,
}

impl EpollContext {
    pub fn new() -> Result<Self> {
        let epoll_fd = epoll::create(true).map_err(EventError::Create)?;
        Ok(EpollContext { epoll_fd })
    }

    pub fn add(&self, fd: RawFd, dispatch: EpollDispatch) -> Result<()> {
        epoll::ctl(
            self.epoll_fd,
            epoll::ControlOptions::EPOLL_CTL_ADD,
            fd,
            epoll::Event::new(epoll::Events::EPOLLIN, dispatch.token()),
        )
        .map_err(EventError::Ctl)
    }

    pub fn remove(&self, fd: RawFd) -> Result<()> {
        epoll::ctl(
            self.epoll_fd,
            epoll::ControlOptions::EPOLL_CTL_DEL,
            fd,
            epoll::Event::new(epoll::Events::empty(), 0),
        )
        .map_err(EventError::Ctl)
    }

    /// Block for up to `timeout_ms` (-1 blocks indefinitely) and
    /// return the dispatch tokens of everything that became ready.
    pub fn wait(&self, timeout_ms: i32) -> Result<Vec<EpollDispatch>> {
        let mut events = vec![epoll::Event::new(epoll::Events::empty(), 0); 32];

        let count = match epoll::wait(self.epoll_fd, timeout_ms, &mut events) {
            Ok(count) => count,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => return Err(EventError::Wait(e)),
        };

        Ok(events[..count].iter().map(|e| e.data.into()).collect())
    }
}

impl Drop for EpollContext {
    fn drop(&mut self) {
        // SAFETY: the descriptor came from epoll::create and is ours.
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::io::AsRawFd;

    use super::*;
    use vmm_sys_util::eventfd::EventFd;

    #[test]
    fn token_round_trip() {
        for dispatch in [
            EpollDispatch::Intx,
            EpollDispatch::Control,
            EpollDispatch::Vector(0),
            EpollDispatch::Vector(17),
            EpollDispatch::RemovalDeadline(3),
        ] {
            assert_eq!(EpollDispatch::from(dispatch.token()), dispatch);
        }
    }

    #[test]
    fn ready_eventfd_is_dispatched() {
        let context = EpollContext::new().unwrap();
        let event = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        context
            .add(event.as_raw_fd(), EpollDispatch::Vector(2))
            .unwrap();

        assert_eq!(context.wait(0).unwrap(), vec![]);

        event.write(1).unwrap();
        assert_eq!(context.wait(0).unwrap(), vec![EpollDispatch::Vector(2)]);

        context.remove(event.as_raw_fd()).unwrap();
        event.write(1).unwrap();
        assert_eq!(context.wait(0).unwrap(), vec![]);
    }
}
