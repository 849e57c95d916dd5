//! Thin demo CLI: send a file to a peer, or listen and write whatever
//! arrives to a directory. Exercises the library end to end; anything
//! resembling identity management, file cataloging, or a real transfer
//! protocol belongs above this crate, not in this binary.

use std::fs::File;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use bitdust_udp_transport::{Consumer, Outcome, Producer, Transport, TransportConfig};

#[derive(Parser)]
#[command(name = "bitdust-udp-transport", version, about)]
struct Cli {
    /// Local peer id advertised during the GREETING handshake.
    #[arg(long, default_value = "anonymous")]
    id: String,

    /// Local peer url advertised during the GREETING handshake.
    #[arg(long, default_value = "local://anonymous")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for inbound streams and write each one to `save_dir`.
    Listen {
        #[arg(long, default_value = "0.0.0.0:7771")]
        bind: SocketAddr,
        #[arg(long, default_value = ".")]
        save_dir: PathBuf,
    },
    /// Send a single file to a peer.
    Send {
        #[arg(long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,
        #[arg(long)]
        peer: SocketAddr,
        file: PathBuf,
    },
}

struct FileProducer {
    total_size: u64,
    acked: u64,
}

impl Producer for FileProducer {
    fn on_sent_raw_data(&mut self, bytes_acked: usize) -> bool {
        self.acked += bytes_acked as u64;
        self.acked >= self.total_size
    }

    fn on_send_complete(&mut self, outcome: Outcome) {
        info!(?outcome, "send stream finished");
    }
}

struct FileConsumer {
    file: Mutex<File>,
    total_size: u64,
    received: u64,
}

impl Consumer for FileConsumer {
    fn on_received_raw_data(&mut self, data: Vec<u8>) -> bool {
        self.received += data.len() as u64;
        if let Err(e) = self.file.lock().unwrap().write_all(&data) {
            tracing::error!(error = %e, "failed writing received data");
        }
        self.total_size > 0 && self.received >= self.total_size
    }

    fn on_receive_complete(&mut self, outcome: Outcome) {
        info!(?outcome, "receive stream finished");
    }
}

struct NullConsumer;

impl Consumer for NullConsumer {
    fn on_received_raw_data(&mut self, _data: Vec<u8>) -> bool {
        false
    }

    fn on_receive_complete(&mut self, _outcome: Outcome) {}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("bitdust_udp_transport=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Listen { bind, save_dir } => {
            std::fs::create_dir_all(&save_dir)?;
            let save_dir = Arc::new(save_dir);
            let factory = Box::new(move |stream_id: u32, total_size: u32, _from: SocketAddr| {
                let path = save_dir.join(format!("stream-{stream_id}.bin"));
                let file = File::create(&path).expect("create output file");
                Box::new(FileConsumer {
                    file: Mutex::new(file),
                    total_size: total_size as u64,
                    received: 0,
                }) as Box<dyn Consumer>
            });
            let (transport, _handle) =
                Transport::bind(bind, TransportConfig::default(), cli.id, cli.url, factory)
                    .await?;
            info!(%bind, "listening");
            transport.run().await?;
        }
        Commands::Send { bind, peer, file } => {
            let mut contents = Vec::new();
            File::open(&file)?.read_to_end(&mut contents)?;
            let total_size = contents.len() as u32;

            let factory =
                Box::new(|_: u32, _: u32, _: SocketAddr| Box::new(NullConsumer) as Box<dyn Consumer>);
            let (transport, handle) =
                Transport::bind(bind, TransportConfig::default(), cli.id, cli.url, factory)
                    .await?;
            tokio::spawn(transport.run());

            let producer = Box::new(FileProducer {
                total_size: total_size as u64,
                acked: 0,
            });
            let stream_id = handle.open_send(peer, total_size, producer).await?;
            info!(stream_id, %peer, bytes = total_size, "sending");

            for chunk in contents.chunks(4096) {
                loop {
                    match handle.send_data(stream_id, chunk.to_vec()).await {
                        Ok(()) => break,
                        Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
                    }
                }
            }
            // Best-effort wait for delivery; this demo has no completion
            // channel back from the event loop.
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
    Ok(())
}
