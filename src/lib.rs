//! # cattleguard
//!
//! Seals LUKS key material with the TPM by driving `tpm2-tools`, and turns
//! the tools' diagnostic output into typed records before anything is sealed.
//!
//! ## Get Started
//!
//! ```bash
//! sudo cattleguard --config /etc/cattleguard/cattleguard.json init-primary
//! sudo cattleguard handles
//! ```

pub mod cli;
pub mod config;
pub mod guard;
pub mod tpm;
