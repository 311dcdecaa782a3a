//! corio UDP round-trip demo
//!
//! Bounces datagrams between two loopback sockets on one reactor and
//! reports the round-trip rate.
//!
//! Usage:
//!     cargo run --release -p corio-udp-ping [rounds]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use corio_net::{Endpoint, IpVersion, Socket, Transport};
use corio_runtime::Reactor;

fn pong_loop(sock: Arc<Socket>) {
    let replier = sock.clone();
    sock.receive_from(64, move |ec, data, peer| {
        if ec.is_err() {
            return;
        }
        let payload = data.to_vec();
        let peer = match peer {
            Some(peer) => peer,
            None => return,
        };
        let next = replier.clone();
        replier.send_to(&payload, &peer, move |ec, _n| {
            if ec.is_ok() {
                pong_loop(next);
            }
        });
    });
}

fn ping_loop(
    sock: Arc<Socket>,
    peer: Endpoint,
    remaining: u64,
    completed: Arc<AtomicU64>,
    reactor: Reactor,
) {
    if remaining == 0 {
        reactor.stop();
        return;
    }
    let receiver = sock.clone();
    sock.send_to(b"ping", &peer, move |ec, _n| {
        if ec.is_err() {
            corio_core::cio_error!("send_to failed: {}", ec);
            reactor.stop();
            return;
        }
        let next = receiver.clone();
        receiver.receive_from(64, move |ec, data, _from| {
            if ec.is_err() || data != b"ping" {
                corio_core::cio_error!("bad reply: {}", ec);
                reactor.stop();
                return;
            }
            completed.fetch_add(1, Ordering::Relaxed);
            ping_loop(next, peer, remaining - 1, completed, reactor);
        });
    });
}

fn main() {
    corio_core::log::init();
    let args: Vec<String> = std::env::args().collect();
    let rounds: u64 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(10_000);

    let reactor = Reactor::new().expect("reactor setup failed");
    let completed = Arc::new(AtomicU64::new(0));

    let r = reactor.clone();
    let completed2 = completed.clone();
    reactor.post(Box::new(move || {
        let loopback = Endpoint::parse("127.0.0.1:0").unwrap();

        let server = Socket::open(IpVersion::V4, Transport::Udp)
            .unwrap()
            .into_shared();
        server.bind(&loopback).unwrap();
        let server_ep = server.local_endpoint().unwrap();

        let client = Socket::open(IpVersion::V4, Transport::Udp)
            .unwrap()
            .into_shared();
        client.bind(&loopback).unwrap();

        eprintln!("corio-udp-ping: {} rounds via {}", rounds, server_ep);
        pong_loop(server);
        ping_loop(client, server_ep, rounds, completed2, r);
    }));

    let start = Instant::now();
    reactor.run().expect("reactor failed");
    let elapsed = start.elapsed();

    let done = completed.load(Ordering::Relaxed);
    eprintln!(
        "corio-udp-ping: {} round trips in {:.3}s ({:.0}/s)",
        done,
        elapsed.as_secs_f64(),
        done as f64 / elapsed.as_secs_f64().max(1e-9),
    );
}
