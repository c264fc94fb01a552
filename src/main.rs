//! edgebus server binary.
//!
//! Wires the CoAP adapter, the LoRa bridge and the rules engine onto one
//! NATS connection and runs them until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use edgebus::auth::StaticAuthorizer;
use edgebus::bus::{MessageBus, NatsBus};
use edgebus::coap::CoapServer;
use edgebus::config::Config;
use edgebus::lora::{BusEventSource, EventHandler, LoraPublisher, RouteMaps, UplinkHandler};
use edgebus::rules::outputs::{Mailer, OutputContext};
use edgebus::rules::repo::PostgresRuleRepository;
use edgebus::rules::{RulesService, Scheduler};
use edgebus::time_provider::SystemClock;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

#[derive(Debug, Parser)]
#[command(name = "edgebus", about = "IoT messaging core: CoAP, LoRa and rules over a pub/sub bus")]
struct Args {
    /// Validate the environment configuration and exit.
    #[arg(long)]
    config_check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("edgebus=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_env().context("loading configuration")?;
    if args.config_check {
        info!("configuration valid");
        return Ok(());
    }

    info!(
        coap_port = config.coap.port,
        nats = %config.nats.url,
        "starting edgebus"
    );

    let shutdown = CancellationToken::new();
    let clock = Arc::new(SystemClock);

    // Bus.
    let bus = Arc::new(
        NatsBus::connect(&config.nats)
            .await
            .context("connecting to the bus")?,
    );
    let bus_dyn: Arc<dyn MessageBus> = bus.clone();

    // Rules repository.
    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .connect(&config.postgres.url)
        .await
        .context("connecting to postgres")?;
    MIGRATOR.run(&pool).await.context("running migrations")?;
    let repo = Arc::new(PostgresRuleRepository::new(pool));

    // Rules engine + scheduler.
    let mailer = config
        .smtp
        .as_ref()
        .map(Mailer::from_config)
        .transpose()
        .context("configuring the SMTP relay")?;
    let outputs = OutputContext::new(bus_dyn.clone(), mailer);
    let rules = Arc::new(
        RulesService::new(repo.clone(), outputs, &config.rules)
            .context("building the rules engine")?,
    );
    let engine_subscription = RulesService::start(rules.clone(), bus.as_ref())
        .await
        .context("subscribing the rules engine")?;

    let scheduler = Arc::new(Scheduler::new(
        repo.clone(),
        rules.clone(),
        clock.clone(),
        config.rules.tick_interval,
    ));
    let scheduler_task = {
        let scheduler = scheduler.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { scheduler.run(token).await })
    };

    // LoRa bridge.
    let routes = RouteMaps::in_memory();
    let lora = Arc::new(LoraPublisher::new(routes.clone(), bus_dyn.clone(), clock.clone()));
    let _uplink_subscription = bus
        .subscribe(
            &config.lora.uplink_subject,
            Arc::new(UplinkHandler::new(lora)),
        )
        .await
        .context("subscribing the LoRa uplink handler")?;

    let events_task = {
        let handler = EventHandler::new(routes, config.lora.strict_events);
        let bus = bus.clone();
        let subject = config.lora.events_subject.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                match BusEventSource::subscribe(bus.as_ref(), &subject).await {
                    Ok(mut source) => {
                        if let Err(e) = handler.run(&mut source).await {
                            error!(error = %e, "provisioning stream failed, restarting");
                        }
                    }
                    Err(e) => error!(error = %e, "provisioning subscribe failed"),
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        })
    };

    // CoAP adapter. The production authorizer is an external service; the
    // standalone binary grants keys from EDGEBUS_STATIC_GRANTS.
    let authorizer = Arc::new(static_grants_from_env());
    let coap = Arc::new(
        CoapServer::bind(config.coap.clone(), authorizer, bus_dyn.clone(), clock.clone())
            .await
            .context("binding the CoAP socket")?,
    );
    let coap_task = {
        let coap = coap.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { coap.run(token).await })
    };

    info!("edgebus running");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    info!("interrupt received, shutting down");

    shutdown.cancel();
    if let Err(e) = engine_subscription.unsubscribe().await {
        error!(error = %e, "engine unsubscribe failed");
    }
    let _ = scheduler_task.await;
    let _ = events_task.await;
    match coap_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "CoAP listener failed"),
        Err(e) => error!(error = %e, "CoAP task failed"),
    }

    info!("edgebus stopped");
    Ok(())
}

/// Parses `EDGEBUS_STATIC_GRANTS` as `key:client:channel` triples separated
/// by semicolons.
fn static_grants_from_env() -> StaticAuthorizer {
    let authorizer = StaticAuthorizer::new();
    if let Ok(grants) = std::env::var("EDGEBUS_STATIC_GRANTS") {
        for grant in grants.split(';').filter(|g| !g.is_empty()) {
            let mut parts = grant.splitn(3, ':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(key), Some(client), Some(channel)) => {
                    authorizer.grant(key, client, channel);
                }
                _ => error!(grant = %grant, "unusable static grant, expected key:client:channel"),
            }
        }
    }
    authorizer
}
