#[macro_use]
extern crate log;

use std::sync::Arc;

use clap::Parser;

use certmesh::config::{self, WebConfig};
use certmesh::external;
use certmesh::nonce::{KvNoncer, MemoryNoncer, NoneNoncer};
use certmesh::rpc::ca::CaWrapper;
use certmesh::rpc::storage::StorageWrapper;
use certmesh::rpc::validation::ValidationWrapper;
use certmesh::wfe::WebFrontEnd;

#[derive(Parser, Debug)]
#[command(name = "certmesh-web", about = "ACME (RFC 8555) web front-end")]
struct Args {
    /// The config file (JSON)
    #[arg(long, default_value = "./run/default-config.json")]
    config: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let mut cfg: WebConfig = match config::load(&args.config) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("Failed to read config: {}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = cfg.verify() {
        eprintln!("Bad config: {}", err);
        std::process::exit(1);
    }
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

    let ca = match CaWrapper::connect(&cfg.ca.address, client_tls.clone()) {
        Ok(ca) => ca,
        Err(err) => {
            error!("Failed to set up CA client: {}", err);
            std::process::exit(1);
        }
    };
    {
        let ca = ca.clone();
        tokio::spawn(async move {
            match ca.get_available_certificates().await {
                Ok(certs) => {
                    for cert in certs.iter().filter(|c| c.will_issue) {
                        info!("CA offers issuing certificate '{}'", cert.common_name);
                    }
                }
                Err(err) => warn!("Could not list CA certificates: {}", err),
            }
        });
    }
    let storage = match StorageWrapper::connect(&cfg.storage.address, client_tls.clone()) {
        Ok(storage) => storage,
        Err(err) => {
            error!("Failed to set up storage client: {}", err);
            std::process::exit(1);
        }
    };
    let validation = match ValidationWrapper::connect(&cfg.va.address, client_tls) {
        Ok(validation) => validation,
        Err(err) => {
            error!("Failed to set up VA client: {}", err);
            std::process::exit(1);
        }
    };

    let mut wfe = WebFrontEnd::new(Arc::new(ca), Arc::new(storage), Arc::new(validation));
    wfe.base_path = cfg.base_url.clone();
    wfe.prohibit_get = cfg.prohibit_get;
    wfe.wait_for_issuance = cfg.wait_for_issuance;
    wfe.debug_valid_authz = cfg.debug_valid_authz;

    match cfg.nonce.provider.as_str() {
        "shared-kv" => {
            info!("Using shared-kv nonce provider at {}", cfg.nonce.kv_address);
            match KvNoncer::connect(&cfg.nonce.kv_address).await {
                Ok(noncer) => wfe.noncer = Arc::new(noncer),
                Err(err) => {
                    error!(
                        "Could not connect to nonce store at {}: {}",
                        cfg.nonce.kv_address, err
                    );
                    std::process::exit(1);
                }
            }
        }
        "none" => {
            warn!("Using none nonce provider - local testing only");
            wfe.noncer = Arc::new(NoneNoncer);
        }
        _ => {
            wfe.noncer = Arc::new(MemoryNoncer::new());
        }
    }

    if cfg.account_creation.require_external {
        wfe.account_validator = external::get_validator(
            &cfg.account_creation.validator_name,
            &cfg.account_creation.validator_config,
        );
        wfe.require_external_account = true;
    }

    let app = Arc::new(wfe).router();
    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Failed to bind {}: {}", addr, err);
            std::process::exit(1);
        }
    };

    info!("Starting listening on {}", addr);
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        warn!("Exit: {}", err);
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("SIGINT caught, shutting down web front-end");
}
