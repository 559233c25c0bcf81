// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Client-side (mapper) attach: look up the advertisement, map the control page, decode the
//! negotiated buffer locations, map (or locate in-page) the rings, connect the event channel,
//! and signal the server (§4.5.3, §6).

use std::sync::atomic::Ordering;

use events::Events;
use grants::Grants;
use registry::Registry;

use crate::handle::{Role, RingBuf, Vchan};
use crate::page::{BufferLocation, ControlView, Direction, Live, Side};
use crate::{Domid, Error, Port};

/// The advertised record (§6): `ring_ref` is the decimal grant ref of the control page's first
/// (only) page; `event_channel` is the decimal listening port of the server.
fn parse_advertisement(s: &str) -> Result<(grants::GrantRef, events::Port), Error> {
    let mut ring_ref = None;
    let mut event_channel = None;
    for field in s.split(';') {
        if let Some(v) = field.strip_prefix("ring_ref=") {
            ring_ref = Some(v);
        } else if let Some(v) = field.strip_prefix("event_channel=") {
            event_channel = Some(v);
        }
    }
    let ring_ref: grants::GrantRef = ring_ref.and_then(|v| v.parse().ok()).ok_or(Error::PortParse)?;
    let event_channel = event_channel.ok_or(Error::PortParse)?;
    let event_channel = events::parse_port(event_channel)?;
    Ok((ring_ref, event_channel))
}

fn ring_buf(control: &ControlView, loc: BufferLocation, mapping: Option<&grants::Mapping>) -> RingBuf {
    match loc {
        BufferLocation::Offset1024 => RingBuf {
            ptr: unsafe { control.as_ptr().add(1024) },
            size: 1024,
        },
        BufferLocation::Offset2048 => RingBuf {
            ptr: unsafe { control.as_ptr().add(2048) },
            size: 2048,
        },
        BufferLocation::External(_) => {
            let mapping = mapping.expect("external buffer location decoded without a matching mapping");
            RingBuf {
                ptr: mapping.as_ptr(),
                size: loc.capacity(),
            }
        }
    }
}

/// Maps the grant refs for one ring's worth of external pages, in order, starting at `base`
/// refs into the header's grant-ref array (§3, §4.5.1: left refs first, then right). A
/// single-page location maps directly; `mapv` is reserved for the multi-page shares it was
/// returned together with (see `grants::Grants::mapv`'s own doc comment).
fn map_external(
    grants: &Grants,
    control: &ControlView,
    domid: Domid,
    base: usize,
    loc: BufferLocation,
) -> Result<grants::Mapping, Error> {
    if loc.npages() == 1 {
        return Ok(grants.map(domid, control.grant_ref(base, 0), true)?);
    }
    let refs: Vec<(Domid, grants::GrantRef)> = (0..loc.npages())
        .map(|i| (domid, control.grant_ref(base, i)))
        .collect();
    Ok(grants.mapv(&refs, true)?)
}

/// Attaches as the client (mapper) side, blocking until the advertisement for `(domid, port)`
/// exists. `domid` must match the value the corresponding [`crate::server::server`] call used.
pub fn client(grants: &Grants, events: &Events, registry: &Registry, domid: Domid, port: Port) -> Result<Vchan, Error> {
    let advertisement = registry.read((domid, port));
    let (ring_ref, server_port) = parse_advertisement(&advertisement)?;

    let control_mapping = grants.map(domid, ring_ref, true)?;
    let control_view = unsafe { ControlView::new(control_mapping.as_ptr(), control_mapping.len()) };

    let left_order = BufferLocation::decode(control_view.left_order().load(Ordering::Acquire)).map_err(Error::BadOrder)?;
    let right_order = BufferLocation::decode(control_view.right_order().load(Ordering::Acquire)).map_err(Error::BadOrder)?;
    let left_npages = left_order.npages();

    control_view.cli_live().store(Live::Connected.encode(), Ordering::Release);
    control_view.srv_notify().fetch_or(Direction::Write.bit(), Ordering::AcqRel);

    let left_mapping = matches!(left_order, BufferLocation::External(_))
        .then(|| map_external(grants, &control_view, domid, 0, left_order))
        .transpose()?;
    let right_mapping = matches!(right_order, BufferLocation::External(_))
        .then(|| map_external(grants, &control_view, domid, left_npages, right_order))
        .transpose()?;

    let channel = events.connect(domid, server_port);
    log::debug!("client: domid={domid} port={port} left_order={left_order:?} right_order={right_order:?}");

    let left_buf = ring_buf(&control_view, left_order, left_mapping.as_ref());
    let right_buf = ring_buf(&control_view, right_order, right_mapping.as_ref());

    // Wake the server (§4.5.3): it is blocked in `events.recv` waiting for exactly this.
    events.send(channel);

    Ok(Vchan::new(
        Role::Client {
            grants: grants.clone(),
            control_mapping,
            left_mapping,
            right_mapping,
        },
        events.clone(),
        channel,
        events::INITIAL_TOKEN,
        control_view,
        Side::Right,
        Side::Left,
        right_buf,
        left_buf,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_advertisement_round_trips() {
        let (ring_ref, port) = parse_advertisement("ring_ref=42;event_channel=7").unwrap();
        assert_eq!(ring_ref, 42);
        assert_eq!(port, 7);
    }

    #[test]
    fn parse_advertisement_rejects_garbage() {
        assert!(parse_advertisement("not-a-valid-record").is_err());
        assert!(parse_advertisement("ring_ref=42").is_err());
    }
}
