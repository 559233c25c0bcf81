// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Server-side (allocator) attach: negotiate buffer locations, allocate the control page and
//! ring pages, publish the advertisement, and block until the client signals connected
//! (§4.5.1-2, §6).

use std::sync::atomic::Ordering;

use events::Events;
use grants::Grants;
use registry::Registry;

use crate::handle::{Role, Vchan};
use crate::page::{BufferLocation, ControlView, Direction, Live, Side, CONTROL_PAGE_LEN, HEADER_LEN};
use crate::{Domid, Error, Port};

/// Resolves the (read, write) = (left, right) buffer locations for the requested ring sizes,
/// applying the in-page collision table of §4.5.1. `Offset1024`/`Offset2048` each name a single
/// in-page region that cannot back both rings at once.
fn negotiate(read_size: usize, write_size: usize) -> (BufferLocation, BufferLocation) {
    use BufferLocation::*;
    let left = BufferLocation::smallest_fitting(read_size);
    let right = BufferLocation::smallest_fitting(write_size);
    match (left, right) {
        (Offset1024, Offset1024) => (Offset1024, Offset2048),
        (Offset2048, Offset2048) => (Offset2048, External(0)),
        other => other,
    }
}

fn ring_buf(control: &ControlView, loc: BufferLocation, share: Option<&grants::Share>) -> crate::handle::RingBuf {
    match loc {
        BufferLocation::Offset1024 => crate::handle::RingBuf {
            ptr: unsafe { control.as_ptr().add(1024) },
            size: 1024,
        },
        BufferLocation::Offset2048 => crate::handle::RingBuf {
            ptr: unsafe { control.as_ptr().add(2048) },
            size: 2048,
        },
        BufferLocation::External(_) => {
            let share = share.expect("external buffer location negotiated without a matching share");
            crate::handle::RingBuf {
                ptr: share.as_ptr(),
                size: loc.capacity(),
            }
        }
    }
}

/// Allocates a channel as the server (allocator) side and blocks until the client attaches.
///
/// `domid` names the channel together with `port` in the configuration registry (§4.3) and is
/// passed to the grants/events substrates as the expected remote domain id; the matching
/// `client` call must use the same `(domid, port)` pair. `read_size`/`write_size` are the
/// minimum requested capacities of the server's read (left) and write (right) rings.
pub fn server(
    grants: &Grants,
    events: &Events,
    registry: &Registry,
    domid: Domid,
    port: Port,
    read_size: usize,
    write_size: usize,
) -> Result<Vchan, Error> {
    let (left_order, right_order) = negotiate(read_size, write_size);
    debug_assert_ne!((left_order, right_order), (BufferLocation::Offset1024, BufferLocation::Offset1024));
    debug_assert_ne!((left_order, right_order), (BufferLocation::Offset2048, BufferLocation::Offset2048));

    let left_npages = left_order.npages();
    let right_npages = right_order.npages();
    let control_len = HEADER_LEN + (left_npages + right_npages) * 4;
    debug_assert!(control_len <= CONTROL_PAGE_LEN);

    let control_share = grants.share(domid, 1, true);
    let control_view = unsafe { ControlView::new(control_share.as_ptr(), control_len) };

    let left_share = (left_npages > 0).then(|| grants.share(domid, left_npages, true));
    let right_share = (right_npages > 0).then(|| grants.share(domid, right_npages, true));

    // Initial page state (§4.5.2). All four counters are zero-initialised explicitly; the
    // reference this is modeled on double-writes `left.cons` where `right.prod` was presumably
    // meant, which is observationally harmless on a freshly-zeroed page but not worth repeating.
    control_view.left_cons().store(0, Ordering::Relaxed);
    control_view.left_prod().store(0, Ordering::Relaxed);
    control_view.right_cons().store(0, Ordering::Relaxed);
    control_view.right_prod().store(0, Ordering::Relaxed);
    control_view.left_order().store(left_order.encode(), Ordering::Relaxed);
    control_view.right_order().store(right_order.encode(), Ordering::Relaxed);
    control_view.cli_live().store(Live::WaitingForConnection.encode(), Ordering::Relaxed);
    control_view.srv_live().store(Live::Connected.encode(), Ordering::Relaxed);
    control_view.cli_notify().store(Direction::Write.bit(), Ordering::Relaxed);
    control_view.srv_notify().store(0, Ordering::Relaxed);

    if let Some(share) = &left_share {
        for (i, r) in share.grants().iter().enumerate() {
            control_view.set_grant_ref(0, i, *r);
        }
    }
    if let Some(share) = &right_share {
        for (i, r) in share.grants().iter().enumerate() {
            control_view.set_grant_ref(left_npages, i, *r);
        }
    }

    let (listen_port, channel) = events.listen(domid);
    registry.write(
        (domid, port),
        format!("ring_ref={};event_channel={}", control_share.grants()[0], listen_port),
    );
    log::debug!(
        "server: domid={domid} port={port} left_order={left_order:?} right_order={right_order:?} listen_port={listen_port}"
    );

    // Block until the client's attach (§4.5.3) signals us.
    let token = events.recv(channel, events::INITIAL_TOKEN);
    log::trace!("server: client attached, domid={domid} port={port}");

    let left_buf = ring_buf(&control_view, left_order, left_share.as_ref());
    let right_buf = ring_buf(&control_view, right_order, right_share.as_ref());

    Ok(Vchan::new(
        Role::Server {
            domid,
            port,
            grants: grants.clone(),
            registry: registry.clone(),
            control_share,
            left_share,
            right_share,
        },
        events.clone(),
        channel,
        token,
        control_view,
        Side::Left,
        Side::Right,
        left_buf,
        right_buf,
    ))
}
