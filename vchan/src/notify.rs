// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The cross-domain notification protocol (§4.5.4): a peer ORs its request bit into the *other*
//! peer's notify byte before suspending, and fetch-ANDs its own notify byte clear after making
//! progress, sending an event only if the bit it cleared was actually set.
//!
//! Both operations are single-byte read-modify-writes at byte granularity: `cli_live`/`srv_live`
//! sit one byte away from `cli_notify`/`srv_notify` on the control page, so anything wider than a
//! byte-sized atomic here would risk tearing a concurrent write to a neighboring field.

use std::sync::atomic::{AtomicU8, Ordering};

use events::Events;

use crate::page::Direction;

/// Requests that the peer send us an event the next time it makes progress in `dir`. Called on
/// the *peer's* notify byte, before suspending.
pub fn request(peer_notify: &AtomicU8, dir: Direction) {
    peer_notify.fetch_or(dir.bit(), Ordering::AcqRel);
}

/// Clears `dir`'s bit on our *own* notify byte and, if it had been requested, sends one event to
/// the peer. Called after making progress (advancing `prod` on write, `cons` on read).
pub fn clear_and_maybe_send(own_notify: &AtomicU8, dir: Direction, events: &Events, channel: events::Channel) {
    let previous = own_notify.fetch_and(!dir.bit(), Ordering::AcqRel);
    if previous & dir.bit() != 0 {
        events.send(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_only_sends_when_bit_was_set() {
        let notify = AtomicU8::new(0);
        let e = Events::new();
        let (port, channel) = e.listen(1);
        let _peer = e.connect(2, port);

        clear_and_maybe_send(&notify, Direction::Write, &e, channel);
        // no bit was set, so no event: recv with a short spin should see no progress.
        assert_eq!(notify.load(Ordering::Relaxed), 0);

        request(&notify, Direction::Write);
        assert_eq!(notify.load(Ordering::Relaxed), Direction::Write.bit());
        clear_and_maybe_send(&notify, Direction::Write, &e, channel);
        assert_eq!(notify.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn request_and_clear_do_not_disturb_other_bit() {
        let notify = AtomicU8::new(Direction::Read.bit());
        request(&notify, Direction::Write);
        assert_eq!(notify.load(Ordering::Relaxed), Direction::Read.bit() | Direction::Write.bit());

        let e = Events::new();
        let (port, channel) = e.listen(1);
        let _peer = e.connect(2, port);
        clear_and_maybe_send(&notify, Direction::Write, &e, channel);
        assert_eq!(notify.load(Ordering::Relaxed), Direction::Read.bit());
    }
}
