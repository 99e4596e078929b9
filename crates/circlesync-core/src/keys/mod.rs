//! Key exchange and storage
//!
//! - [`exchange`]: wrap and unwrap circle keys between two nodes
//! - [`ring`]: sealed local store of owned circle keys and received peer keys

pub mod exchange;
pub mod ring;

pub use exchange::{
    unwrap_key_from_peer, wrap_key_for_peer, KeySource, UnwrappedKey, KEY_EXCHANGE_CONTEXT,
};
pub use ring::{KeyHandle, KeyRing, KeySubject};
