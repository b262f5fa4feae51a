/*
 * Created on Tue Mar 11 2025
 *
 * This file is a part of Vigil
 * Vigil is a free and open-source centralized audit log receiver that
 * records privileged command sessions into durable, relayable artifacts
 * without compromising on integrity or operability.
 *
 * Copyright (c) 2025, The Vigil Authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! # Vigil
//!
//! The `vigild` crate is Vigil's audit log receiver: it accepts streamed
//! privileged-session records from many clients and turns each session into
//! durable artifacts, either locally (event log + I/O log trees) or as
//! journals spooled for relaying to an upstream receiver. See the modules
//! for their respective documentation.

#[macro_use]
extern crate log;

#[macro_use]
mod macros;
mod config;
mod error;
mod net;
mod proto;
mod session;
mod util;

use {
    crate::session::evlog::EventLog,
    env_logger::Builder,
    std::{env, fs, sync::Arc},
    tokio::signal,
};

const PID_FILE: &str = ".vigil_pid";

#[cfg(all(not(target_env = "msvc"), not(miri)))]
use jemallocator::Jemalloc;

#[cfg(all(not(target_env = "msvc"), not(miri)))]
#[global_allocator]
/// Jemallocator - the default memory allocator for platforms other than msvc
static GLOBAL: Jemalloc = Jemalloc;

fn main() {
    Builder::new()
        .parse_filters(&env::var("VIGIL_LOG").unwrap_or_else(|_| "info".to_owned()))
        .init();
    let args: Vec<String> = env::args().skip(1).collect();
    let config = match config::load(&args) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{e}");
            util::exit_error()
        }
    };
    info!(
        "Vigil v{} | {} | binding to {}:{}",
        libvigil::VERSION,
        libvigil::URL,
        config.host(),
        config.port()
    );
    // make sure no other instance is sharing our working directory
    let pid_lock = run_pre_startup_tasks();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("server")
        .enable_all()
        .build()
        .unwrap();
    let result = runtime.block_on(run(config));
    drop(runtime);
    drop(pid_lock);
    let _ = fs::remove_file(PID_FILE);
    if let Err(e) = result {
        error!("{e}");
        util::exit_error()
    }
    info!("Goodbye :)");
}

async fn run(config: Arc<config::Config>) -> net::IoResult<()> {
    if let Some(parent) = config.event_log().parent() {
        fs::create_dir_all(parent)?;
    }
    let event_log = Arc::new(EventLog::new(config.event_log()));
    let (sig_shutdown, _) = tokio::sync::broadcast::channel(1);
    let tls = match config.tls() {
        Some(tls) => Some(net::tls_acceptor(tls)?),
        None => None,
    };
    let mut listener = net::Listener::new(config, event_log, tls, sig_shutdown.clone()).await?;
    tokio::select! {
        _ = listener.listen() => {}
        _ = signal::ctrl_c() => {
            info!("Stopped accepting incoming connections");
        }
    }
    let _ = sig_shutdown.send(());
    listener.terminate().await;
    Ok(())
}

/// Acquire the pid file, bailing out if another daemon holds it
fn run_pre_startup_tasks() -> fs::File {
    use std::io::Write;
    let file = match fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(PID_FILE)
    {
        Ok(f) => f,
        Err(e) => {
            error!("failed to open pid file: {e}");
            util::exit_error()
        }
    };
    if util::os::lock_exclusive(&file).is_err() {
        error!("another instance of vigild is running in this directory");
        util::exit_error()
    }
    let mut file = file;
    let _ = file.set_len(0);
    let _ = write!(file, "{}", std::process::id());
    file
}
