//! Vaultbridge integration test harness.
//!
//! Runs a host and an enclave side in one process, joined over loopback
//! TCP in place of VSOCK. Inputs and results live in in-memory buckets.
//! Decryption is stood in for by `sh -c "tr a-z A-Z"`, so tests that
//! spawn it skip when no `/bin/sh` is available:
//!
//!   cargo test --test integration

mod failures;
mod infra;
mod pipeline;
