//! corio TCP echo server
//!
//! Accepts connections, echoes every byte back until the peer closes.
//!
//! Usage:
//!     cargo run --release -p corio-echo [port]
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9999

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use corio_net::{Acceptor, Endpoint, Socket};
use corio_runtime::{Reactor, RuntimeConfig};

#[derive(Default)]
struct Stats {
    accepts: AtomicU64,
    closes: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    errors: AtomicU64,
}

impl Stats {
    fn print(&self) {
        eprintln!(
            "corio-echo: accepts={} closes={} bytes_in={} bytes_out={} err={}",
            self.accepts.load(Ordering::Relaxed),
            self.closes.load(Ordering::Relaxed),
            self.bytes_in.load(Ordering::Relaxed),
            self.bytes_out.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        );
    }
}

fn accept_loop(acceptor: Arc<Acceptor>, stats: Arc<Stats>, buf_size: usize) {
    let next = acceptor.clone();
    let next_stats = stats.clone();
    acceptor.accept(move |ec, conn, peer| {
        match conn {
            Some(conn) if ec.is_ok() => {
                next_stats.accepts.fetch_add(1, Ordering::Relaxed);
                if let Some(peer) = peer {
                    corio_core::cio_debug!("accepted {}", peer);
                }
                echo(conn.into_shared(), next_stats.clone(), buf_size);
            }
            _ => {
                next_stats.errors.fetch_add(1, Ordering::Relaxed);
                corio_core::cio_warn!("accept failed: {}", ec);
            }
        }
        accept_loop(next, next_stats, buf_size);
    });
}

fn echo(conn: Arc<Socket>, stats: Arc<Stats>, buf_size: usize) {
    let writer = conn.clone();
    conn.receive(buf_size, move |ec, data| {
        if ec.is_err() || data.is_empty() {
            // Peer closed or errored; dropping the socket closes it.
            stats.closes.fetch_add(1, Ordering::Relaxed);
            return;
        }
        stats.bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
        let payload = data.to_vec();
        let reader = writer.clone();
        writer.send(&payload, move |ec, n| {
            if ec.is_err() {
                stats.closes.fetch_add(1, Ordering::Relaxed);
                return;
            }
            stats.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
            echo(reader, stats, buf_size);
        });
    });
}

fn stats_tick(reactor: Reactor, stats: Arc<Stats>) {
    let r = reactor.clone();
    reactor.set_timeout(
        Duration::from_secs(5),
        Box::new(move || {
            stats.print();
            stats_tick(r, stats);
        }),
    );
}

fn main() {
    corio_core::log::init();
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);

    let config = RuntimeConfig::from_env();
    let reactor = Reactor::with_config(&config).expect("reactor setup failed");
    let stats = Arc::new(Stats::default());

    let r = reactor.clone();
    let stats2 = stats.clone();
    reactor.post(Box::new(move || {
        let endpoint = Endpoint::parse(&format!("0.0.0.0:{}", port)).unwrap();
        let acceptor = Arc::new(Acceptor::bind_and_listen(&endpoint).expect("bind failed"));
        eprintln!(
            "corio-echo: listening on {} (ctrl-c to quit)",
            acceptor.local_endpoint().unwrap()
        );
        accept_loop(acceptor, stats2.clone(), config.default_buffer_size);
        stats_tick(r, stats2);
    }));

    reactor.run().expect("reactor failed");
}
