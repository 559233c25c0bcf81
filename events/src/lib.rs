// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! In-memory reference implementation of an inter-domain event-channel substrate: small
//! integer ports, each carrying a lost-wakeup-proof counter.
//!
//! A real hypervisor backend would bind the two domains' event channels together in the
//! hypervisor itself; signalling one port causes an interrupt to be delivered to whichever
//! domain owns the bound peer port. This reference implementation plays both domains in one
//! process, so "signalling a port" just means bumping a shared counter and waking anyone
//! parked on a `Condvar`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

pub type Domid = u16;
pub type Port = u32;
/// In the reference implementation a channel handle and the port number it was allocated as
/// are the same value, matching the component description ("in the reference implementation
/// these are the same integer").
pub type Channel = Port;

/// The counter value returned by `listen`/`connect` before any event has been observed.
pub const INITIAL_TOKEN: u64 = 0;

#[derive(Debug)]
pub enum Error {
    /// The advertised event channel string could not be parsed as a port number.
    PortParse,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event channel port is not a valid decimal integer")
    }
}

impl std::error::Error for Error {}

struct EventTable {
    next_port: Port,
    /// Once two ports are bound to each other (via `connect`), signalling either one wakes the
    /// other; the binding is symmetric, so both directions are recorded.
    peer: HashMap<Port, Port>,
    counter: HashMap<Port, u64>,
}

impl EventTable {
    fn new() -> Self {
        Self {
            next_port: 1,
            peer: HashMap::new(),
            counter: HashMap::new(),
        }
    }
}

/// Handle to the events substrate, shared between both ends of a test (or, in a real
/// deployment, a thin wrapper around hypervisor event-channel calls).
#[derive(Clone)]
pub struct Events {
    inner: Arc<(Mutex<EventTable>, Condvar)>,
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

impl Events {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(EventTable::new()), Condvar::new())),
        }
    }

    /// Allocates a fresh, as yet unbound, port. Returns the port and the channel handle used to
    /// send/recv on it (the same value in this reference implementation).
    pub fn listen(&self, _remote_domid: Domid) -> (Port, Channel) {
        let (lock, _cv) = &*self.inner;
        let mut table = lock.lock().unwrap();
        let port = table.next_port;
        table.next_port += 1;
        table.counter.insert(port, INITIAL_TOKEN);
        log::trace!("listen: port={port}");
        (port, port)
    }

    /// Allocates a fresh local port bound to `remote_port` and returns its channel handle.
    /// Binding is established in both directions: signalling either port wakes the other.
    pub fn connect(&self, _remote_domid: Domid, remote_port: Port) -> Channel {
        let (lock, _cv) = &*self.inner;
        let mut table = lock.lock().unwrap();
        let local = table.next_port;
        table.next_port += 1;
        table.counter.insert(local, INITIAL_TOKEN);
        table.peer.insert(local, remote_port);
        table.peer.insert(remote_port, local);
        log::trace!("connect: local={local} remote_port={remote_port}");
        local
    }

    /// Wakes the peer bound to `channel`.
    pub fn send(&self, channel: Channel) {
        let (lock, cv) = &*self.inner;
        let mut table = lock.lock().unwrap();
        let Some(&target) = table.peer.get(&channel) else {
            log::warn!("send on unbound channel {channel}");
            return;
        };
        *table.counter.entry(target).or_insert(INITIAL_TOKEN) += 1;
        log::trace!("send: channel={channel} -> target={target}");
        cv.notify_all();
    }

    /// Blocks until `channel`'s counter has advanced past `last_seen_token`, then returns the
    /// new value.
    pub fn recv(&self, channel: Channel, last_seen_token: u64) -> u64 {
        let (lock, cv) = &*self.inner;
        let table = lock.lock().unwrap();
        let table = cv
            .wait_while(table, |table| {
                table.counter.get(&channel).copied().unwrap_or(INITIAL_TOKEN) <= last_seen_token
            })
            .unwrap();
        table.counter[&channel]
    }

    /// Clears the binding and counter for `port`.
    pub fn close(&self, port: Port) {
        let (lock, cv) = &*self.inner;
        let mut table = lock.lock().unwrap();
        table.peer.remove(&port);
        table.counter.remove(&port);
        log::trace!("close: port={port}");
        cv.notify_all();
    }

    /// Fails if any port is still bound. Intended for end-of-test assertions.
    pub fn assert_cleaned_up(&self) -> bool {
        let (lock, _cv) = &*self.inner;
        let table = lock.lock().unwrap();
        table.peer.is_empty()
    }
}

pub fn port_to_string(port: Port) -> String {
    port.to_string()
}

pub fn parse_port(s: &str) -> Result<Port, Error> {
    s.trim().parse().map_err(|_| Error::PortParse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn connect_binds_both_directions() {
        let e = Events::new();
        let (server_port, _server_chan) = e.listen(1);
        let client_chan = e.connect(2, server_port);

        e.send(client_chan);
        assert_eq!(e.recv(server_port, INITIAL_TOKEN), INITIAL_TOKEN + 1);

        e.send(server_port);
        assert_eq!(e.recv(client_chan, INITIAL_TOKEN), INITIAL_TOKEN + 1);
    }

    #[test]
    fn recv_wakes_on_later_send() {
        let e = Events::new();
        let (server_port, _) = e.listen(1);
        let client_chan = e.connect(2, server_port);

        let e2 = e.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            e2.send(client_chan);
        });

        let token = e.recv(server_port, INITIAL_TOKEN);
        assert_eq!(token, INITIAL_TOKEN + 1);
        handle.join().unwrap();
    }

    #[test]
    fn close_clears_binding() {
        let e = Events::new();
        let (server_port, _) = e.listen(1);
        let client_chan = e.connect(2, server_port);
        assert!(!e.assert_cleaned_up());

        e.close(client_chan);
        e.close(server_port);
        assert!(e.assert_cleaned_up());
    }

    #[test]
    fn port_string_round_trip() {
        assert_eq!(parse_port(&port_to_string(42)).unwrap(), 42);
        assert!(parse_port("not-a-port").is_err());
    }
}
