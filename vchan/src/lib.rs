// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A vchan-style inter-domain bidirectional byte-stream transport.
//!
//! Two peers — a [`server`] (allocator) and a [`client`] (mapper) — negotiate a pair of
//! shared-memory rings over a control page, then exchange bytes through them with a notification
//! protocol layered on top of an inter-domain event-signal primitive. See [`page`] for the wire
//! format, [`ring`] for the producer/consumer discipline, [`notify`] for the wake-up protocol, and
//! [`handle`] for the public read/write API produced by [`server::server`] and [`client::client`].

pub mod client;
pub mod handle;
pub mod notify;
pub mod page;
pub mod ring;
pub mod server;

pub use client::client;
pub use handle::{Role, State, Vchan};
pub use server::server;

use std::fmt;

pub type Domid = u16;
pub type Port = u32;

#[derive(Debug)]
pub enum Error {
    /// A `left_order`/`right_order` byte decoded to a value outside `{10, 11, 12..=20}`.
    BadOrder(u16),
    /// A `cli_live`/`srv_live` byte decoded to a value outside `{0, 1, 2}`.
    BadLive(u8),
    /// The advertised `event_channel` field was not a valid decimal port number.
    PortParse,
    /// `assert_all_cleaned_up` found a leftover event port or registry entry.
    StaleResources,
    Grants(grants::Error),
    Events(events::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadOrder(n) => write!(f, "control page order field is invalid: {n}"),
            Error::BadLive(n) => write!(f, "control page live byte is invalid: {n}"),
            Error::PortParse => write!(f, "advertised event channel port is not numeric"),
            Error::StaleResources => write!(f, "substrate has leftover resources after close"),
            Error::Grants(e) => write!(f, "grants substrate error: {e}"),
            Error::Events(e) => write!(f, "events substrate error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<grants::Error> for Error {
    fn from(e: grants::Error) -> Self {
        Error::Grants(e)
    }
}

impl From<events::Error> for Error {
    fn from(e: events::Error) -> Self {
        Error::Events(e)
    }
}

/// The outcome of a [`handle::Vchan::read`] call.
#[derive(Debug)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    Eof,
}

/// The outcome of a [`handle::Vchan::write`]/[`handle::Vchan::writev`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Ok,
    Eof,
}

/// Asserts that all three substrates report no leftover resources. Intended for end-of-test use,
/// mirroring each substrate's own `assert_cleaned_up`.
pub fn assert_all_cleaned_up(
    grants: &grants::Grants,
    events: &events::Events,
    registry: &registry::Registry,
) -> Result<(), Error> {
    grants.assert_cleaned_up()?;
    if !events.assert_cleaned_up() {
        return Err(Error::StaleResources);
    }
    if !registry.assert_cleaned_up() {
        return Err(Error::StaleResources);
    }
    Ok(())
}
