// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Full server+client round trips against the in-memory reference substrates, entirely
//! in-process (§8 "Concrete scenarios").

use std::thread;

use vchan::{ReadOutcome, WriteOutcome};

struct Substrates {
    grants: grants::Grants,
    events: events::Events,
    registry: registry::Registry,
}

impl Substrates {
    fn new() -> Self {
        Self {
            grants: grants::Grants::new(),
            events: events::Events::new(),
            registry: registry::Registry::new(),
        }
    }

    fn assert_cleaned_up(&self) {
        vchan::assert_all_cleaned_up(&self.grants, &self.events, &self.registry).unwrap();
    }
}

fn read_all(vch: &vchan::Vchan, want: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(want);
    while out.len() < want {
        match vch.read().unwrap() {
            ReadOutcome::Data(chunk) => out.extend_from_slice(&chunk),
            ReadOutcome::Eof => break,
        }
    }
    out
}

#[test]
fn small_in_page_rings_hello() {
    let sub = Substrates::new();
    let (grants, events, registry) = (sub.grants.clone(), sub.events.clone(), sub.registry.clone());

    let server_handle = thread::spawn(move || vchan::server(&grants, &events, &registry, 1, 100, 1024, 1024).unwrap());

    let client = vchan::client(&sub.grants, &sub.events, &sub.registry, 1, 100).unwrap();
    assert_eq!(client.write(b"hello").unwrap(), WriteOutcome::Ok);

    let server = server_handle.join().unwrap();
    let got = read_all(&server, 5);
    assert_eq!(got, b"hello");

    server.close().unwrap();
    client.close().unwrap();
    sub.assert_cleaned_up();
}

#[test]
fn external_left_ring_negotiated() {
    let sub = Substrates::new();
    let (grants, events, registry) = (sub.grants.clone(), sub.events.clone(), sub.registry.clone());

    let server_handle = thread::spawn(move || vchan::server(&grants, &events, &registry, 2, 101, 9000, 500).unwrap());
    let client = vchan::client(&sub.grants, &sub.events, &sub.registry, 2, 101).unwrap();

    let payload = vec![7u8; 8000];
    assert_eq!(client.write(&payload).unwrap(), WriteOutcome::Ok);

    let server = server_handle.join().unwrap();
    let got = read_all(&server, payload.len());
    assert_eq!(got, payload);

    server.close().unwrap();
    client.close().unwrap();
    sub.assert_cleaned_up();
}

#[test]
fn wrap_around_write_then_read() {
    let sub = Substrates::new();
    let (grants, events, registry) = (sub.grants.clone(), sub.events.clone(), sub.registry.clone());

    // Both rings 1024 bytes: read_size=write_size=1024 negotiates (Offset1024, Offset2048).
    let server_handle = thread::spawn(move || vchan::server(&grants, &events, &registry, 3, 102, 1024, 1024).unwrap());
    let client = vchan::client(&sub.grants, &sub.events, &sub.registry, 3, 102).unwrap();
    let server = server_handle.join().unwrap();

    let first: Vec<u8> = (0..800u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(client.write(&first).unwrap(), WriteOutcome::Ok);
    assert_eq!(read_all(&server, 800), first);

    let second: Vec<u8> = (0..600u32).map(|i| ((i + 17) % 251) as u8).collect();
    assert_eq!(client.write(&second).unwrap(), WriteOutcome::Ok);
    assert_eq!(read_all(&server, 600), second);

    server.close().unwrap();
    client.close().unwrap();
    sub.assert_cleaned_up();
}

#[test]
fn flow_control_blocks_then_resumes() {
    let sub = Substrates::new();
    let (grants, events, registry) = (sub.grants.clone(), sub.events.clone(), sub.registry.clone());

    let server_handle = thread::spawn(move || vchan::server(&grants, &events, &registry, 4, 103, 1024, 1024).unwrap());
    let client = vchan::client(&sub.grants, &sub.events, &sub.registry, 4, 103).unwrap();
    let server = server_handle.join().unwrap();

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
    let payload_for_writer = payload.clone();
    let writer = thread::spawn(move || {
        client.write(&payload_for_writer).unwrap();
        client
    });

    let got = read_all(&server, payload.len());
    assert_eq!(got, payload);

    let client = writer.join().unwrap();
    server.close().unwrap();
    client.close().unwrap();
    sub.assert_cleaned_up();
}

#[test]
fn clean_shutdown_server_then_client() {
    let sub = Substrates::new();
    let (grants, events, registry) = (sub.grants.clone(), sub.events.clone(), sub.registry.clone());

    let server_handle = thread::spawn(move || vchan::server(&grants, &events, &registry, 5, 104, 1024, 1024).unwrap());
    let client = vchan::client(&sub.grants, &sub.events, &sub.registry, 5, 104).unwrap();
    let server = server_handle.join().unwrap();

    server.close().unwrap();

    // the client's read must now observe Eof since the remote (server) has exited.
    match client.read().unwrap() {
        ReadOutcome::Eof => {}
        ReadOutcome::Data(_) => panic!("expected eof after server close"),
    }
    assert_eq!(client.write(b"x").unwrap(), WriteOutcome::Eof);

    client.close().unwrap();
    sub.assert_cleaned_up();
}

#[test]
fn clean_shutdown_client_then_server() {
    let sub = Substrates::new();
    let (grants, events, registry) = (sub.grants.clone(), sub.events.clone(), sub.registry.clone());

    let server_handle = thread::spawn(move || vchan::server(&grants, &events, &registry, 6, 105, 1024, 1024).unwrap());
    let client = vchan::client(&sub.grants, &sub.events, &sub.registry, 6, 105).unwrap();
    let server = server_handle.join().unwrap();

    client.close().unwrap();

    match server.read().unwrap() {
        ReadOutcome::Eof => {}
        ReadOutcome::Data(_) => panic!("expected eof after client close"),
    }
    assert_eq!(server.write(b"x").unwrap(), WriteOutcome::Eof);

    server.close().unwrap();
    sub.assert_cleaned_up();
}

#[test]
fn writev_concatenates_in_order() {
    let sub = Substrates::new();
    let (grants, events, registry) = (sub.grants.clone(), sub.events.clone(), sub.registry.clone());

    let server_handle = thread::spawn(move || vchan::server(&grants, &events, &registry, 7, 106, 1024, 1024).unwrap());
    let client = vchan::client(&sub.grants, &sub.events, &sub.registry, 7, 106).unwrap();
    let server = server_handle.join().unwrap();

    assert_eq!(client.writev(&[b"abc", b"def"]).unwrap(), WriteOutcome::Ok);
    assert_eq!(read_all(&server, 6), b"abcdef");

    server.close().unwrap();
    client.close().unwrap();
    sub.assert_cleaned_up();
}
