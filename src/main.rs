/*
 * netaudit-core - Security compliance audit core for network devices
 * Copyright (C) 2025 Dynamic Devices Ltd
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 *
 * Maintainer: Alex J Lennon <alex@dynamicdevices.co.uk>
 * Support: info@dynamicdevices.co.uk
 */

use std::fs::File;
use std::sync::Arc;

use anyhow::Result;
use base64::Engine;
use clap::Parser;
use tracing::{error, info};

use netaudit_core::cli::{Cli, Commands};
use netaudit_core::config::{Config, StoreConfig};
use netaudit_core::crypto::{self, SymmetricKey};
use netaudit_core::device::{DeviceManager, NewDevice};
use netaudit_core::engine::CheckEngine;
use netaudit_core::rules::RuleCatalogue;
use netaudit_core::ssh::SshLayer;
use netaudit_core::store::Store;

const KDF_SALT_KEY: &str = "kdf_salt";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::default();
    config.store = StoreConfig {
        path: cli.data_dir.to_string_lossy().into_owned(),
        ..config.store
    };

    info!("netaudit-core v{}", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(Store::open(&config.store)?);
    let key = derive_master_key(&store, &cli.passphrase, config.auth.key_derivation_iterations)?;
    let rules = Arc::new(RuleCatalogue::new(store.clone()));
    let ssh = Arc::new(SshLayer::new(config.ssh.clone()));
    let devices = DeviceManager::new(store.clone(), key.clone(), ssh.clone());
    let engine = Arc::new(CheckEngine::new(store.clone(), rules.clone(), ssh.clone(), key));
    engine.set_worker_count(config.engine.worker_count);
    engine.set_timeout(std::time::Duration::from_secs(config.engine.timeout_secs));

    match cli.command {
        Commands::AddDevice {
            name,
            ip,
            device_type,
            vendor,
            username,
            password,
            port,
            snmp_community,
            tags,
        } => {
            let device = devices.add(NewDevice {
                name,
                ip_address: ip,
                device_type,
                vendor,
                username,
                password,
                ssh_port: port,
                snmp_community,
                tags,
            })?;
            println!("added device {} ({})", device.id, device.ip_address);
        }
        Commands::ListDevices => {
            for device in devices.get_all()? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    device.id, device.name, device.ip_address, device.vendor, device.status.as_str()
                );
            }
        }
        Commands::ImportDevices { path } => {
            let file = File::open(&path)?;
            for outcome in devices.import_devices_csv(file) {
                match outcome {
                    Ok(device) => println!("imported {} ({})", device.name, device.ip_address),
                    Err(e) => error!("import row failed: {e}"),
                }
            }
        }
        Commands::LoadRules => {
            let inserted = rules.load_predefined()?;
            println!("inserted {inserted} new rules");
        }
        Commands::RunCheck { device_id } => {
            let device = devices.get(&device_id)?;
            let cb: netaudit_core::engine::ProgressCallback = Arc::new(|event| {
                println!(
                    "[{}] {:?} {}/{} {}",
                    event.device_name, event.status, event.progress, event.total, event.current_rule
                );
            });
            let outcome = engine.run_checks(&device, Some(cb)).await;
            for result in &outcome.results {
                println!("{}\t{:?}\t{}", result.check_name, result.status, result.message);
            }
            if let Some(e) = outcome.error {
                error!("run_checks reported: {e}");
            }
        }
        Commands::RunBulk { workers } => {
            engine.set_worker_count(workers);
            let all_devices = devices.get_all()?;
            let cb: netaudit_core::engine::ProgressCallback = Arc::new(|event| {
                println!(
                    "[{}] {:?} {}/{}",
                    event.device_name, event.status, event.progress, event.total
                );
            });
            let outcome = engine.run_bulk_checks(all_devices, Some(cb)).await;
            for (device_id, results) in &outcome.results {
                println!("device {device_id}: {} results", results.len());
            }
            for (device_id, err) in &outcome.errors {
                error!("device {device_id} failed: {err}");
            }
        }
        Commands::SshStats => {
            for (host, stats) in ssh.get_connection_stats() {
                println!(
                    "{host}\tactive={}\tavailable={}\ttotal={}",
                    stats.active_conns, stats.available_conns, stats.total_conns
                );
            }
        }
    }

    ssh.close().await;
    Ok(())
}

/// Derives the active master key from the operator-supplied passphrase,
/// generating and persisting a fresh salt on first run so subsequent
/// runs with the same passphrase re-derive the same key.
fn derive_master_key(store: &Store, passphrase: &str, iterations: u32) -> Result<SymmetricKey> {
    let salt = match store.get_setting(KDF_SALT_KEY)? {
        Some(encoded) => base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| netaudit_core::Error::Database(format!("corrupt kdf salt: {e}")))?,
        None => {
            let salt = crypto::generate_salt().to_vec();
            store.set_setting(
                KDF_SALT_KEY,
                &base64::engine::general_purpose::STANDARD.encode(&salt),
            )?;
            salt
        }
    };
    Ok(crypto::derive_key(passphrase, &salt, iterations)?)
}
