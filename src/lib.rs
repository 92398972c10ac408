//! Two-party threshold wallet backend
//!
//! Two services share this crate:
//!
//! 1. **TSS API** - holds the server half of every wallet key and runs the
//!    client/server protocols: keygen, Beaver triples, ECDSA signing over
//!    secp256k1 and FROST signing over ed25519.
//! 2. **Key-share node** - stores one Shamir share of the client's key
//!    fragment per user and curve, released only through commit-reveal
//!    gated calls. `KeyShareNodeClient` drives sign-up, sign-in and reshare
//!    across a node set.

pub mod client;
pub mod commit_reveal;
pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod ksn;
pub mod logging;
pub mod server;
pub mod share_cipher;
pub mod sss;
pub mod stage;
pub mod storage;
pub mod types;

// Re-exports: TSS API
pub use server::{create_router, AppState, SharedAppState};
pub use stage::StageMachine;

// Re-exports: key-share nodes
pub use client::{ClientError, KeyShareNodeClient, RecoveredKeys, UserCredentials};
pub use ksn::{KeyShareNodeService, KsnState};

// Re-exports: shared
pub use config::{ConfigError, Environment, KsnConfig, NodeSetFile, TssConfig};
pub use crypto::{CryptoEngine, SoftwareEngine};
pub use error::{Result, TssError};
pub use sss::SecretSharingEngine;
