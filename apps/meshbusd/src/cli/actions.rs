use tokio::select;
use tokio::signal::unix;
use tokio::signal::unix::SignalKind;
use tracing::{info, level_filters::LevelFilter, warn, Event, Level, Subscriber};
use tracing_subscriber::{
    filter::Targets,
    fmt::format::{DefaultVisitor, Writer},
    layer::Layer,
    prelude::*,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::{
    cli::{arguments, daemon::Daemon},
    config::DaemonConfig,
};

pub async fn run(args: arguments::Run) -> eyre::Result<()> {
    let config = DaemonConfig::from_path(args.config)?;

    let level_filter = config.logger.level;

    let filter = Targets::new()
        .with_target("bus", level_filter)
        .with_target("net", level_filter)
        .with_default(level_filter);

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::DEBUG.into())
        .from_env()?;

    tracing_subscriber::registry()
        .with(BusTracer.with_filter(filter))
        .with(env_filter)
        .try_init()?;

    let daemon = Daemon::new(&config)?;
    let handle = daemon.handle();
    let cancellation = daemon.cancellation();

    let mut task = tokio::spawn(daemon.run());

    let mut sigterm =
        unix::signal(SignalKind::terminate()).expect("Failed to create SIGTERM signal handler");
    let mut sigint =
        unix::signal(SignalKind::interrupt()).expect("Failed to create SIGINT signal handler");

    let mut stopping = false;
    let restart = loop {
        select! {
            result = &mut task => {
                break result??;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM signal");
                stop(&handle, &cancellation, &mut stopping).await;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT signal");
                stop(&handle, &cancellation, &mut stopping).await;
            }
        }
    };

    if restart {
        // The supervisor restarts us on this exit code; that is the whole
        // point of RELOADCONFIG.
        info!("Restart requested, exiting with code 1");
        std::process::exit(1);
    }

    Ok(())
}

/// First signal: orderly STOP. Second signal: abort the reactor.
async fn stop(
    handle: &impl meshbus_bus::client::handle::Handle,
    cancellation: &tokio_util::sync::CancellationToken,
    stopping: &mut bool,
) {
    if *stopping {
        warn!("Still draining; aborting now");
        cancellation.cancel();
        return;
    }
    *stopping = true;

    if handle.stop().await.is_err() {
        cancellation.cancel();
    }
}

struct BusTracer;

impl<S> Layer<S> for BusTracer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let target = match event.metadata().level() {
            &Level::INFO | &Level::WARN | &Level::ERROR => event
                .metadata()
                .target()
                .split("::")
                .last()
                .unwrap_or_default(),
            _ => event.metadata().target(),
        };

        print!(
            "[{}] {} {}: ",
            chrono::offset::Local::now().format("%Y-%m-%d %H:%M:%S"),
            event.metadata().level(),
            target,
        );

        let mut message = String::new();

        event.record(&mut DefaultVisitor::new(Writer::new(&mut message), true));

        println!("{}", message);
    }
}
