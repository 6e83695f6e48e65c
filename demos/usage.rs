//! # credvault walkthrough
//!
//! Stores, reads and deletes a few credentials, once through the engine and
//! once through the method-call boundary. TPM protection is requested for one
//! value; without a reachable TPM it silently falls back to OS protection.
//!
//! Run with `RUST_LOG=credvault=debug` to see which path each write took.

use credvault::{MethodCall, Persistence, Protection, VaultConfig, WriteOptions, handle};
use secrecy::ExposeSecret;
use serde_json::json;
use tracing_subscriber::EnvFilter;

const APP: &str = "com.example.demo";

pub fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let demo_path = "tmp/credvault_demo";
    if std::path::Path::new(demo_path).exists() {
        std::fs::remove_dir_all(demo_path)?;
    }
    let vault = VaultConfig::new(demo_path).open()?;

    println!("=== credvault demo ===\n");

    // Engine API
    let protection = vault.set("api_token", "s3cr3t-t0k3n", Some(APP), WriteOptions::default())?;
    println!("api_token stored with {protection:?} protection");

    let hw = WriteOptions::default()
        .prefer_tpm(true)
        .with_persistence(Persistence::Enterprise);
    match vault.set("refresh_token", "r3fr3sh", Some(APP), hw)? {
        Protection::Tpm => println!("refresh_token encrypted under the TPM key"),
        Protection::Os => println!("refresh_token stored with OS protection (no usable TPM)"),
    }

    for key in ["api_token", "refresh_token", "missing"] {
        match vault.get(key, Some(APP)) {
            Some(value) => println!("  {key} = {}", value.expose_secret()),
            None => println!("  {key} has no value"),
        }
    }

    // Method-call boundary
    println!("\nThrough the method-call boundary:");
    let calls = [
        MethodCall::new("existsKey", json!({"key": "api_token", "prefix": APP})),
        MethodCall::new("setValue", json!({"key": "pin", "value": "1234", "prefix": APP, "persist": "session"})),
        MethodCall::new("getValue", json!({"key": "pin", "prefix": APP})),
        MethodCall::new("getValue", json!("not a map")),
        MethodCall::new("getPlatformVersion", json!({})),
    ];
    for call in &calls {
        match handle(&vault, call) {
            Ok(reply) => println!("  {} -> {}", call.method, reply.to_json()),
            Err(e) => println!("  {} -> {}: {e}", call.method, e.kind().code()),
        }
    }

    let removed = vault.delete_all(Some(APP))?;
    println!("\nRemoved {removed} credentials under {APP}");
    assert!(!vault.exists("api_token", Some(APP)));

    Ok(())
}
