/*
 * main.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Phineas, a store-and-forward ebXML messaging node.
 *
 * Phineas is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Phineas is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Phineas.  If not, see <http://www.gnu.org/licenses/>.
 */

//! The Phineas daemon: load configuration, set up logging, run the node,
//! and run it again on a restart request. SIGINT/SIGTERM request a
//! graceful shutdown; SIGHUP requests a restart with a freshly loaded
//! configuration.
//!
//! Exit codes: 0 clean stop, 1 startup fatal, 3 argument error,
//! 4 configuration semantic error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use phineas_core::config::Config;
use phineas_core::runtime::{self, Phase, Runtime};

#[derive(Parser)]
#[command(name = "phineas", about = "Phineas store-and-forward ebXML messaging node")]
struct Args {
    /// Configuration file (Phineas.xml, possibly encrypted at rest)
    #[arg(default_value = "Phineas.xml")]
    config: PathBuf,

    /// Private key unwrapping an encrypted configuration
    #[arg(long)]
    key: Option<PathBuf>,

    /// Password for the configuration key file
    #[arg(long, default_value = "")]
    password: String,
}

const EXIT_STARTUP: u8 = 1;
const EXIT_ARGS: u8 = 3;
const EXIT_CONFIG: u8 = 4;

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EXIT_ARGS);
        }
    };

    let first = match load_config(&args) {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };
    init_logging(&first);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build();
    let rt = match rt {
        Ok(rt) => rt,
        Err(e) => {
            error!("can't start runtime: {}", e);
            return ExitCode::from(EXIT_STARTUP);
        }
    };
    rt.block_on(serve(args, first))
}

fn load_config(args: &Args) -> Result<Config, ExitCode> {
    let key = args
        .key
        .as_deref()
        .map(|path| (path, args.password.as_str()));
    Config::load(&args.config, key).map_err(|e| {
        eprintln!("FATAL ERROR: can't load configuration {}: {}", args.config.display(), e);
        ExitCode::from(EXIT_CONFIG)
    })
}

fn init_logging(config: &Config) {
    let level = match config.log_level().to_ascii_lowercase().as_str() {
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("phineas={l},phineas_core={l}", l = level)));
    let log_file = config.log_file();
    if log_file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return;
    }
    let path = config.resolve(log_file);
    let dir = path.parent().unwrap_or(std::path::Path::new(".")).to_path_buf();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Phineas.log".to_string());
    let appender = tracing_appender::rolling::never(dir, name);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(appender)
        .with_ansi(false)
        .init();
}

async fn serve(args: Args, first: Config) -> ExitCode {
    let mut config = Some(first);
    loop {
        let cfg = match config.take() {
            Some(cfg) => cfg,
            None => match load_config(&args) {
                Ok(cfg) => cfg,
                Err(code) => return code,
            },
        };
        let runtime = match Runtime::new(cfg) {
            Ok(rt) => rt,
            Err(e) => {
                error!("can't initialize queues: {}", e);
                return ExitCode::from(EXIT_STARTUP);
            }
        };
        install_signals(runtime.clone());
        match runtime::run(runtime).await {
            Phase::Restart => {
                info!("restarting with a fresh configuration");
                continue;
            }
            _ => return ExitCode::SUCCESS,
        }
    }
}

fn install_signals(runtime: Arc<Runtime>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let rt = runtime.clone();
        tokio::spawn(async move {
            let mut hup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(_) => return,
            };
            while hup.recv().await.is_some() {
                rt.request_restart();
            }
        });
        let rt = runtime.clone();
        tokio::spawn(async move {
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => return,
            };
            if term.recv().await.is_some() {
                rt.request_shutdown();
            }
        });
    }
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            runtime.request_shutdown();
        }
    });
}
