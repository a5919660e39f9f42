#![deny(warnings)]
#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unreachable)]
#![deny(clippy::await_holding_lock)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vigild_core::config::ServerConfig;
use vigild_core::https::{create_https_server, ServerState};
use vigild_lib::be::{LoggingEmailSender, MemoryAccountStore};
use vigild_lib::credential::CryptoPolicy;
use vigild_lib::idm::server::IdmServer;
use vigild_lib::prelude::*;
use vigild_lib::tenant::StaticTenantResolver;

include!("./opt.rs");

// Password hashing rounds are tuned at startup to take about this long
// on the local machine.
const PBKDF2_TIME_TARGET: Duration = Duration::from_millis(10);

async fn server_main(config: ServerConfig) -> ExitCode {
    let session_ttl = config.session_ttl();
    let accounts = Arc::new(MemoryAccountStore::new());
    let resolver = Arc::new(StaticTenantResolver::new(config.tenants));
    let email = Arc::new(LoggingEmailSender);

    let crypto_policy = CryptoPolicy::time_target(PBKDF2_TIME_TARGET);

    let (idms, mut delayed) = match IdmServer::new(
        accounts,
        resolver.clone(),
        email,
        config.rp_name.as_str(),
        config.rp_id.as_str(),
        &config.origin,
        session_ttl,
        crypto_policy,
    ) {
        Ok(t) => t,
        Err(e) => {
            admin_error!(?e, "unable to start idm server");
            return ExitCode::FAILURE;
        }
    };
    let idms = Arc::new(idms);

    // Drain delayed actions (password upgrades, security key counter
    // updates) off the authentication path.
    let delayed_idms = idms.clone();
    let mut delayed_handle = tokio::spawn(async move {
        while let Some(action) = delayed.next().await {
            delayed_idms.process_delayed_action(action);
        }
    });

    // Sweep expired session tokens and ceremony challenges.
    let purge_idms = idms.clone();
    let mut purge_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            purge_idms.purge_expired(duration_from_epoch_now());
        }
    });

    let state = ServerState {
        idms,
        resolver,
    };

    tokio::select! {
        res = create_https_server(config.bindaddress.as_str(), state) => {
            if let Err(e) = res {
                admin_error!(?e, "https server stopped");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            admin_info!("ctrl-c received, shutting down");
        }
        _ = &mut delayed_handle => {
            admin_error!("delayed action task stopped unexpectedly");
            return ExitCode::FAILURE;
        }
        _ = &mut purge_handle => {
            admin_error!("purge task stopped unexpectedly");
            return ExitCode::FAILURE;
        }
    }

    delayed_handle.abort();
    purge_handle.abort();
    ExitCode::SUCCESS
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let opt = VigildParser::parse();

    if matches!(opt.commands, VigildOpt::Version) {
        println!("vigild {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match opt.commands {
        VigildOpt::Server(copt) => {
            let Ok(config) = ServerConfig::new(&copt.config_path) else {
                return ExitCode::FAILURE;
            };
            admin_info!(?config, "config loaded");
            server_main(config).await
        }
        VigildOpt::ConfigTest(copt) => {
            let Ok(config) = ServerConfig::new(&copt.config_path) else {
                return ExitCode::FAILURE;
            };
            admin_info!(?config, "config test was successful");
            ExitCode::SUCCESS
        }
        VigildOpt::Version => ExitCode::SUCCESS,
    }
}
