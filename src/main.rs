mod catalog;
mod cli;
mod config;
mod diagnostics;
mod logging;
mod manager;
mod multiplexer;
mod orchestrator;
mod server;
mod sessions;
mod shutdown;
mod wire;

use std::process;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use serde_json::json;

use catalog::{CatalogReporter, UdpCatalogPublisher};
use cli::Cli;
use config::AppConfig;
use diagnostics::{build_catalog_document, ManagerIdentity};
use logging::{DebugSubsystems, FileSink, LogLevel, Logger, LoggerConfig};
use manager::{Manager, ManagerSettings};
use multiplexer::{Multiplexer, MultiplexerConfig};
use server::TcpServer;
use shutdown::ShutdownHooks;
use wire::codec::WireCodec;

fn main() {
    ensure_posix_or_exit();

    let cli = Cli::parse();
    if cli.version {
        println!("{}", cli::version_line());
        return;
    }

    let app_config = load_config_or_exit(&cli);
    let logger = Arc::new(build_logger_or_exit(&app_config));
    print_startup_banner(&logger);

    let codec = WireCodec::from_app_config(&app_config).unwrap_or_else(|error| {
        eprintln!("wire codec configuration error: {error}");
        process::exit(2);
    });
    let server = TcpServer::bind(&app_config.server).unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(1);
    });
    let multiplexer = Multiplexer::start(
        server,
        MultiplexerConfig {
            codec,
            stall_timeout: Duration::from_secs(app_config.manager.stall_timeout_seconds),
        },
        Arc::clone(&logger),
    )
    .unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(1);
    });

    let bound_addr = multiplexer.local_addr();
    let identity = ManagerIdentity::new(app_config.manager.project_name.clone(), bound_addr.port());
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} listening",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "project": identity.project,
            "manager_id": identity.manager_id.to_string(),
            "max_message_size_bytes": codec.max_message_size_bytes(),
            "file_quorum": app_config.manager.file_quorum
        })),
    );

    let mut catalog = start_catalog(&app_config, &identity, &logger);

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM/SIGHUP",
    );

    let mut manager = Manager::new(
        identity,
        ManagerSettings::from_app_config(&app_config, codec),
        Arc::clone(&logger),
    );
    let poll_interval = Duration::from_millis(app_config.manager.poll_interval_ms);
    let max_events = app_config.manager.max_events_per_cycle;

    while !shutdown_hooks.is_triggered() {
        for event in multiplexer.wait(poll_interval, max_events) {
            manager.handle_readiness(event);
        }
        manager.advance(Utc::now());
    }

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, closing sessions",
    );
    if let Some(reporter) = catalog.as_mut() {
        if let Err(error) = reporter.stop() {
            logger.warn(Some("main::shutdown"), &error.to_string());
        }
    }
    manager.shutdown();
    let mut multiplexer = multiplexer;
    if let Err(error) = multiplexer.stop() {
        logger.warn(Some("main::shutdown"), &error.to_string());
    }
    logger.log(
        LogLevel::Info,
        Some("main::shutdown"),
        "Manager stopped",
        Some(json!({
            "tasks": manager.tasks().count(),
            "files": manager.files().count()
        })),
    );
}

fn load_config_or_exit(cli: &Cli) -> AppConfig {
    let mut config = AppConfig::load(cli.config.as_deref(), cli.overrides.iter().cloned())
        .unwrap_or_else(|error| {
            eprintln!("configuration error: {error}");
            process::exit(2);
        });
    cli.apply_to(&mut config);
    if let Err(error) = config.validate() {
        eprintln!("configuration error: {error}");
        process::exit(2);
    }
    config
}

fn build_logger_or_exit(app_config: &AppConfig) -> Logger {
    let min_level = LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
        eprintln!(
            "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
            app_config.logging.level
        );
        process::exit(2);
    });
    let config = LoggerConfig {
        min_level,
        human_friendly: app_config.logging.human_friendly,
        debug_subsystems: DebugSubsystems::from_names(&app_config.logging.debug_subsystems),
    };

    if app_config.logging.file.is_empty() {
        return Logger::new(config);
    }
    match FileSink::open(&app_config.logging.file) {
        Ok(sink) => Logger::with_sink(config, Arc::new(sink)),
        Err(error) => {
            eprintln!(
                "cannot open debug file '{}': {error}",
                app_config.logging.file
            );
            process::exit(2);
        }
    }
}

fn start_catalog(
    app_config: &AppConfig,
    identity: &ManagerIdentity,
    logger: &Arc<Logger>,
) -> Option<CatalogReporter> {
    if !app_config.catalog.enabled || app_config.catalog.hosts.is_empty() {
        logger.info(Some("main::catalog"), "Catalog updates disabled");
        return None;
    }

    let started = UdpCatalogPublisher::new(&app_config.catalog.hosts).and_then(|publisher| {
        let mut reporter =
            CatalogReporter::from_config(&app_config.catalog, build_catalog_document(identity))?;
        reporter.start(Box::new(publisher), Arc::clone(logger))?;
        Ok(reporter)
    });
    match started {
        Ok(reporter) => {
            logger.log(
                LogLevel::Info,
                Some("main::catalog"),
                "Catalog reporter started",
                Some(json!({
                    "hosts": app_config.catalog.hosts,
                    "update_interval_seconds": app_config.catalog.update_interval_seconds
                })),
            );
            Some(reporter)
        }
        Err(error) => {
            logger.warn(
                Some("main::catalog"),
                &format!("catalog reporter not started: {error}"),
            );
            None
        }
    }
}

fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: the dataswarm manager is intended for POSIX systems");
        process::exit(2);
    }
}

fn print_startup_banner(logger: &Logger) {
    logger.log(
        LogLevel::Info,
        Some("main"),
        "Starting dataswarm manager",
        Some(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "build_date_utc": env!("DATASWARM_BUILD_DATE_UTC"),
            "git_revision": env!("DATASWARM_GIT_REVISION"),
            "pid": process::id(),
            "owner": diagnostics::login_user()
        })),
    );
}
