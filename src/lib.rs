// ============================================================================
// PQXDH Relay
// ============================================================================
//
// Store-and-forward relay for asynchronous X3DH/PQXDH key exchange:
// - Clients publish signed prekeys and pools of one-time prekeys
// - Peers fetch a prekey bundle to start an offline session
//   (each bundle consumes exactly one classical and one PQ one-time prekey)
// - Encrypted initial messages are held until the recipient grabs them,
//   then deleted (delivered at most once)
//
// The server never sees private key material; everything stored here is
// public keys, signatures and ciphertext.
//
// ============================================================================

pub mod bundle;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod rate_limit;
pub mod routes;
pub mod storage;
pub mod wire;
