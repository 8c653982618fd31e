#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;

pub mod acme;
pub mod config;
pub mod core;
pub mod errors;
pub mod external;
pub mod jose;
pub mod nonce;
pub mod policy;
pub mod problem;
pub mod rpc;
pub mod storage;
pub mod token;
pub mod trace;
pub mod va;
pub mod wfe;

pub mod certmesh_proto {
    tonic::include_proto!("certmesh");
}
