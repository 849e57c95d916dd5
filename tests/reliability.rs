//! End-to-end reliability tests: two real `Transport` instances talking
//! over loopback UDP through a lossy relay that randomly drops and
//! duplicates datagrams in both directions. Exercises the full stack
//! (handshake, blocking/chunking, ACKs, retransmits, duplicate/old-block
//! detection) rather than any single module in isolation.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;

use bitdust_udp_transport::{Consumer, Outcome, Producer, Transport, TransportConfig};

struct CollectingConsumer {
    total_size: u64,
    received: Vec<u8>,
    done: Option<oneshot::Sender<Vec<u8>>>,
}

impl Consumer for CollectingConsumer {
    fn on_received_raw_data(&mut self, data: Vec<u8>) -> bool {
        self.received.extend(data);
        self.received.len() as u64 >= self.total_size
    }

    fn on_receive_complete(&mut self, _outcome: Outcome) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(std::mem::take(&mut self.received));
        }
    }
}

struct VecProducer {
    total_size: u64,
    acked: u64,
}

impl Producer for VecProducer {
    fn on_sent_raw_data(&mut self, bytes_acked: usize) -> bool {
        self.acked += bytes_acked as u64;
        self.acked >= self.total_size
    }

    fn on_send_complete(&mut self, _outcome: Outcome) {}
}

/// Forwards datagrams between two fixed addresses through a single
/// socket, dropping and duplicating a fraction of them deterministically
/// (seeded RNG) so the test is reproducible.
async fn run_lossy_relay(
    relay: UdpSocket,
    client_addr: SocketAddr,
    server_addr: SocketAddr,
    seed: u64,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut buf = vec![0u8; 2048];
    loop {
        let (len, from) = match relay.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(_) => return,
        };
        if rng.gen_bool(0.1) {
            continue; // simulated drop
        }
        let to = if from == client_addr {
            server_addr
        } else {
            client_addr
        };
        let _ = relay.send_to(&buf[..len], to).await;
        if rng.gen_bool(0.05) {
            // simulated duplicate
            let _ = relay.send_to(&buf[..len], to).await;
        }
    }
}

#[tokio::test]
async fn file_survives_loss_and_duplication() {
    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let total_size = payload.len() as u32;

    let config = TransportConfig::default().with_tick_period(Duration::from_millis(10));

    let server_addr_bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (done_tx, done_rx) = oneshot::channel::<Vec<u8>>();
    let done_tx = Arc::new(Mutex::new(Some(done_tx)));
    let expected_total = total_size as u64;
    let factory = Box::new(move |_stream_id: u32, total_size: u32, _from: SocketAddr| {
        let tx = done_tx.lock().unwrap().take();
        Box::new(CollectingConsumer {
            total_size: if total_size > 0 {
                total_size as u64
            } else {
                expected_total
            },
            received: Vec::new(),
            done: tx,
        }) as Box<dyn Consumer>
    });
    let (server, _server_handle) = Transport::bind(
        server_addr_bind,
        config,
        "server",
        "local://server",
        factory,
    )
    .await
    .unwrap();
    let server_addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let client_addr_bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let client_factory =
        Box::new(|_: u32, _: u32, _: SocketAddr| Box::new(NoopConsumer) as Box<dyn Consumer>);
    let (client, client_handle) = Transport::bind(
        client_addr_bind,
        TransportConfig::default().with_tick_period(Duration::from_millis(10)),
        "client",
        "local://client",
        client_factory,
    )
    .await
    .unwrap();
    let client_addr = client.local_addr().unwrap();
    tokio::spawn(client.run());

    let relay_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay_socket.local_addr().unwrap();
    tokio::spawn(run_lossy_relay(relay_socket, client_addr, server_addr, 42));

    let producer = Box::new(VecProducer {
        total_size: total_size as u64,
        acked: 0,
    });
    let stream_id = client_handle
        .open_send(relay_addr, total_size, producer)
        .await
        .unwrap();

    for chunk in payload.chunks(2048) {
        loop {
            match client_handle.send_data(stream_id, chunk.to_vec()).await {
                Ok(()) => break,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    }

    let received = tokio::time::timeout(Duration::from_secs(20), done_rx)
        .await
        .expect("transfer did not complete within the timeout")
        .expect("consumer channel dropped without a result");

    assert_eq!(received, payload);
}

struct NoopConsumer;

impl Consumer for NoopConsumer {
    fn on_received_raw_data(&mut self, _data: Vec<u8>) -> bool {
        false
    }

    fn on_receive_complete(&mut self, _outcome: Outcome) {}
}
