use clap::{Parser, Subcommand};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

use hoard::server::{FileServer, FileServerOpts};
use hoard::store::cas_path_transform;
use hoard::transport::{noop_handshake, TcpTransport, TcpTransportOpts};

#[derive(Parser)]
#[command(name = "hoard")]
#[command(about = "Peer-to-peer replicated blob store", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single node until interrupted
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:3000")]
        listen: String,

        /// Storage folder (default: "<port>_network")
        #[arg(short, long)]
        storage: Option<String>,

        /// Addresses of nodes to connect to at startup
        #[arg(short, long)]
        bootstrap: Vec<String>,
    },
    /// Run a three-node demo cluster that stores, deletes and re-fetches
    /// a batch of keys over the network
    Demo,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Serve {
            listen,
            storage,
            bootstrap,
        } => serve(listen, storage, bootstrap).await?,
        Commands::Demo => demo().await?,
    }

    Ok(())
}

fn make_server(listen: &str, storage: Option<String>, bootstrap: Vec<String>) -> Arc<FileServer> {
    let storage_folder = storage.unwrap_or_else(|| {
        let port = listen.rsplit(':').next().unwrap_or(listen);
        format!("{port}_network")
    });
    let transport = TcpTransport::new(TcpTransportOpts {
        listen_addr: listen.to_string(),
        handshake: noop_handshake,
    });
    FileServer::new(FileServerOpts {
        id: None,
        enc_key: None,
        storage_folder,
        bootstrap_nodes: bootstrap,
        path_transform: cas_path_transform,
        transport,
    })
}

async fn serve(
    listen: String,
    storage: Option<String>,
    bootstrap: Vec<String>,
) -> Result<(), Box<dyn Error>> {
    let server = make_server(&listen, storage, bootstrap);
    server.start().await?;
    tokio::signal::ctrl_c().await?;
    server.stop();
    Ok(())
}

async fn demo() -> Result<(), Box<dyn Error>> {
    let s1 = make_server("127.0.0.1:3000", None, vec![]);
    let s2 = make_server("127.0.0.1:4000", None, vec!["127.0.0.1:3000".into()]);
    let s3 = make_server(
        "127.0.0.1:8000",
        None,
        vec!["127.0.0.1:3000".into(), "127.0.0.1:4000".into()],
    );

    s1.start().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    s2.start().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    s3.start().await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    for (server, range) in [(&s2, 0..10), (&s1, 10..20)] {
        for i in range {
            let key = format!("verse{i}");
            let data = format!("{key}:\tI can do all things through Christ who strengthens me.");

            server.store(&key, data.as_bytes(), true).await?;
            // Drop the local copy, then fetch it back over the network
            server.store_ref().delete(server.id(), &key).await?;
            let mut r = server.get(&key).await?;
            let mut contents = String::new();
            r.read_to_string(&mut contents).await?;
            println!("file contents for ({key}): {contents}");
        }
    }

    s3.stop();
    s2.stop();
    s1.stop();
    Ok(())
}
