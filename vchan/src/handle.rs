// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The public channel handle produced by [`crate::server::server`] and [`crate::client::client`]
//! (§3 "Channel state"): the read/write API of §6, built on the ring ([`crate::ring`]) and
//! notification ([`crate::notify`]) machinery layered over a shared [`ControlView`].

use std::cell::Cell;
use std::sync::atomic::{AtomicU8, Ordering};

use events::Events;

use crate::notify;
use crate::page::{ControlView, Direction, Live, Side};
use crate::ring::Ring;
use crate::{Domid, Error, Port, ReadOutcome, WriteOutcome};

/// Which side of the channel a handle is, carrying the substrate resources that side alone owns
/// and must release on [`Vchan::close`] (§4.5.9).
pub enum Role {
    Server {
        /// The remote (client) domain id this channel was advertised to.
        domid: Domid,
        port: Port,
        grants: grants::Grants,
        registry: registry::Registry,
        control_share: grants::Share,
        left_share: Option<grants::Share>,
        right_share: Option<grants::Share>,
    },
    Client {
        grants: grants::Grants,
        control_mapping: grants::Mapping,
        left_mapping: Option<grants::Mapping>,
        right_mapping: Option<grants::Mapping>,
    },
}

/// The connection state a peer observes: always the *remote* side's liveness byte (§4.5.8) — a
/// server observes `cli_live`, a client observes `srv_live`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Exited,
    Connected,
    Waiting,
}

impl From<Live> for State {
    fn from(live: Live) -> Self {
        match live {
            Live::Exited => State::Exited,
            Live::Connected => State::Connected,
            Live::WaitingForConnection => State::Waiting,
        }
    }
}

/// A raw, wrap-unaware view of one ring's data bytes: `size` bytes starting at `ptr`, wherever
/// the buffer-location negotiation (§4.5.1) put them — in-page or on externally granted pages.
/// Owned by the `server`/`client` constructors, which alone know where each side's rings live.
pub(crate) struct RingBuf {
    pub(crate) ptr: *mut u8,
    pub(crate) size: usize,
}

/// The channel handle. Holds no lock across suspension: the only suspension points are inside
/// [`Vchan::read`]/[`Vchan::write`]'s calls into `events::Events::recv` (§5 "Scheduling model").
pub struct Vchan {
    role: Role,
    events: Events,
    channel: events::Channel,
    token: Cell<u64>,
    control: ControlView,
    read_side: Side,
    write_side: Side,
    read_buf: RingBuf,
    write_buf: RingBuf,
    /// Bytes the application has consumed from `read_buf` but not yet published to the remote
    /// via `cons` (§3, §4.5.5). Published at the start of the *next* `read` call.
    ack_up_to: Cell<u32>,
}

// SAFETY: `read_buf`/`write_buf` point at regions whose single-writer-per-side discipline is
// upheld by the ring protocol (`crate::ring::Ring`), and the control page's shared fields are
// only ever touched through the atomics in `crate::page::ControlView`. A `Vchan` is driven by one
// task at a time even if that task migrates between OS threads.
unsafe impl Send for Vchan {}

impl Vchan {
    pub(crate) fn new(
        role: Role,
        events: Events,
        channel: events::Channel,
        token: u64,
        control: ControlView,
        read_side: Side,
        write_side: Side,
        read_buf: RingBuf,
        write_buf: RingBuf,
    ) -> Self {
        Self {
            role,
            events,
            channel,
            token: Cell::new(token),
            control,
            read_side,
            write_side,
            read_buf,
            write_buf,
            ack_up_to: Cell::new(0),
        }
    }

    fn read_ring(&self) -> Ring<'_> {
        unsafe {
            Ring::new(
                self.read_buf.ptr,
                self.read_buf.size,
                self.control.cons(self.read_side),
                self.control.prod(self.read_side),
            )
        }
    }

    fn write_ring(&self) -> Ring<'_> {
        unsafe {
            Ring::new(
                self.write_buf.ptr,
                self.write_buf.size,
                self.control.cons(self.write_side),
                self.control.prod(self.write_side),
            )
        }
    }

    /// The notify byte this side clears (and, if set, sends an event) after making its own
    /// progress: `srv_notify` for a server, `cli_notify` for a client (§4.5.4).
    fn own_notify(&self) -> &AtomicU8 {
        match self.role {
            Role::Server { .. } => self.control.srv_notify(),
            Role::Client { .. } => self.control.cli_notify(),
        }
    }

    /// The notify byte this side ORs its request bit into before suspending: the byte the *peer*
    /// will clear after making progress.
    fn peer_notify(&self) -> &AtomicU8 {
        match self.role {
            Role::Server { .. } => self.control.cli_notify(),
            Role::Client { .. } => self.control.srv_notify(),
        }
    }

    /// The liveness byte of the *remote* side (§4.5.8).
    fn remote_live(&self) -> Result<State, Error> {
        let raw = match self.role {
            Role::Server { .. } => self.control.cli_live().load(Ordering::Acquire),
            Role::Client { .. } => self.control.srv_live().load(Ordering::Acquire),
        };
        Live::decode(raw).map(State::from).map_err(Error::BadLive)
    }

    pub fn state(&self) -> Result<State, Error> {
        self.remote_live()
    }

    /// Bytes currently available to read, without side effects (§4.5.7's "fast" inspection).
    pub fn data_ready(&self) -> u32 {
        self.read_ring().avail_to_read()
    }

    /// Bytes of free space currently available to write, without side effects.
    pub fn buffer_space(&self) -> u32 {
        self.write_ring().space_to_write()
    }

    /// Reads up to one contiguous chunk of available data, blocking until some is available or
    /// the remote has exited (§4.5.5).
    pub fn read(&self) -> Result<ReadOutcome, Error> {
        {
            let ring = self.read_ring();
            let new_cons = ring.cons_value().wrapping_add(self.ack_up_to.get());
            ring.publish_cons(new_cons);
        }
        self.ack_up_to.set(0);
        notify::clear_and_maybe_send(self.own_notify(), Direction::Read, &self.events, self.channel);

        loop {
            let ring = self.read_ring();
            let avail = ring.avail_to_read();
            if avail == 0 {
                if self.remote_live()? != State::Connected {
                    return Ok(ReadOutcome::Eof);
                }
                notify::request(self.peer_notify(), Direction::Write);
                let token = self.events.recv(self.channel, self.token.get());
                self.token.set(token);
                continue;
            }

            let size = ring.size();
            let cons = ring.cons_value() as usize;
            let contiguous = size - (cons & (size - 1));
            let len = (avail as usize).min(contiguous);

            let mut out = vec![0u8; len];
            let copied = ring.copy_out(&mut out);
            debug_assert_eq!(copied, len);
            self.ack_up_to.set(self.ack_up_to.get() + len as u32);
            return Ok(ReadOutcome::Data(out));
        }
    }

    /// Writes all of `buf`, blocking on backpressure until the remote exits (§4.5.6).
    pub fn write(&self, buf: &[u8]) -> Result<WriteOutcome, Error> {
        let mut offset = 0usize;
        while offset < buf.len() {
            if self.remote_live()? != State::Connected {
                return Ok(WriteOutcome::Eof);
            }

            let ring = self.write_ring();
            let avail = ring.space_to_write();
            if avail == 0 {
                notify::request(self.peer_notify(), Direction::Read);
                let token = self.events.recv(self.channel, self.token.get());
                self.token.set(token);
                continue;
            }

            let n = (buf.len() - offset).min(avail as usize);
            let prod = ring.prod_value();
            ring.copy_in_wrapping(&buf[offset..offset + n]);
            ring.publish_prod(prod.wrapping_add(n as u32));
            notify::clear_and_maybe_send(self.own_notify(), Direction::Write, &self.events, self.channel);
            offset += n;
        }
        Ok(WriteOutcome::Ok)
    }

    /// Applies [`Self::write`] to each buffer in order, short-circuiting on end-of-stream.
    pub fn writev(&self, bufs: &[&[u8]]) -> Result<WriteOutcome, Error> {
        for buf in bufs {
            if self.write(buf)? == WriteOutcome::Eof {
                return Ok(WriteOutcome::Eof);
            }
        }
        Ok(WriteOutcome::Ok)
    }

    /// Tears down this side (§4.5.9): marks this side exited, signals the remote, and releases
    /// every substrate resource this side owns. Takes `self` by value, so a second close on the
    /// same handle cannot happen — the substrate's double-release errors it would otherwise
    /// trigger never arise.
    pub fn close(self) -> Result<(), Error> {
        match &self.role {
            Role::Client { .. } => {
                self.control.cli_live().store(Live::Exited.encode(), Ordering::Release);
            }
            Role::Server { .. } => {
                self.control.srv_live().store(Live::Exited.encode(), Ordering::Release);
            }
        }
        self.events.send(self.channel);

        match self.role {
            Role::Client {
                grants,
                control_mapping,
                left_mapping,
                right_mapping,
            } => {
                if let Some(mapping) = left_mapping {
                    grants.unmap(mapping)?;
                }
                if let Some(mapping) = right_mapping {
                    grants.unmap(mapping)?;
                }
                grants.unmap(control_mapping)?;
                self.events.close(self.channel);
                log::debug!("client close: released control mapping and ring mappings");
            }
            Role::Server {
                domid,
                port,
                grants,
                registry,
                control_share,
                left_share,
                right_share,
            } => {
                registry.delete((domid, port));
                if let Some(share) = left_share {
                    grants.unshare(share)?;
                }
                if let Some(share) = right_share {
                    grants.unshare(share)?;
                }
                grants.unshare(control_share)?;
                self.events.close(self.channel);
                log::debug!("server close: deleted advertisement, released shares");
            }
        }
        Ok(())
    }
}
