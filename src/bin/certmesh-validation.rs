#[macro_use]
extern crate log;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::{mpsc, watch};

use certmesh::certmesh_proto::validation_server::ValidationServer;
use certmesh::config::{self, ValidationConfig};
use certmesh::rpc::storage::StorageWrapper;
use certmesh::rpc::validation::ValidationService;
use certmesh::va::{self, ValidationWorker};

#[derive(Parser, Debug)]
#[command(name = "certmesh-validation", about = "ACME validation authority")]
struct Args {
    /// The config file (JSON)
    #[arg(long, default_value = "./run/default-config.json")]
    config: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let mut cfg: ValidationConfig = match config::load(&args.config) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("Failed to read config: {}", err);
            std::process::exit(1);
        }
    };
    cfg.verify();
    config::init_logging(cfg.json_logging);
    info!("Starting up");
    if cfg.process_tracing {
        warn!("process_tracing is set - disable if not testing");
    }

    let client_tls = match cfg.tls_config.client_tls() {
        Ok(tls) => tls,
        Err(err) => {
            error!("Failed to build TLS config: {}", err);
            std::process::exit(1);
        }
    };
    let server_tls = match cfg.tls_config.server_tls() {
        Ok(tls) => tls,
        Err(err) => {
            error!("Failed to build TLS config: {}", err);
            std::process::exit(1);
        }
    };

    let storage = match StorageWrapper::connect(&cfg.storage.address, client_tls) {
        Ok(storage) => storage,
        Err(err) => {
            error!("Failed to set up storage client: {}", err);
            std::process::exit(1);
        }
    };

    let (tx, rx) = mpsc::channel(va::VERIFICATION_QUEUE_DEPTH);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = ValidationWorker::new(
        tx.clone(),
        rx,
        Arc::new(storage),
        va::default_probes(),
        cfg.sleep,
    );
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    let service = ValidationService::new(tx);
    let addr: std::net::SocketAddr = match format!("0.0.0.0:{}", cfg.port).parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!("Bad listen address: {}", err);
            std::process::exit(1);
        }
    };

    let mut builder = tonic::transport::Server::builder();
    if let Some(tls) = server_tls {
        builder = match builder.tls_config(tls) {
            Ok(builder) => builder,
            Err(err) => {
                error!("Failed to apply server TLS: {}", err);
                std::process::exit(1);
            }
        };
    }

    info!("Starting validation server on 0.0.0.0:{}", cfg.port);
    let serve = builder
        .add_service(ValidationServer::new(service))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("SIGINT caught, shutting down validation authority");
        })
        .await;
    if let Err(err) = serve {
        error!("Validation server failed: {}", err);
    }

    // The server is gone; give the queue a bounded drain before exit.
    let _ = shutdown_tx.send(true);
    let _ = worker_handle.await;
}
