//! Demo 'main' - a requester thing calls a responder thing over one in-memory
//! transport

use anyhow::Result;
use config::{Config, Environment, File};
use thing_process::Thing;
use thing_sdk::config::get_sub_config;
use tracing::info;

// Roles in the same crate
mod requester;
mod responder;

/// Config for one role: its identity becomes `[thing]`, everything else is shared
fn role_config(config: &Config, role: &str) -> Result<Config> {
    let identity = get_sub_config(config, role);
    Ok(Config::builder()
        .add_source(config.clone())
        .set_override("thing.product-id", identity.get_string("product-id")?)?
        .set_override("thing.thing-id", identity.get_string("thing-id")?)?
        .build()?)
}

/// Standard main
#[tokio::main]
pub async fn main() -> Result<()> {

    // Initialise tracing
    tracing_subscriber::fmt::init();

    info!("Thing operations - request/response demo");

    // Read the config
    let config = Config::builder()
        .add_source(File::with_name("request"))
        .add_source(Environment::with_prefix("THING"))
        .build()?;

    // Both things share one transport
    let transport = Thing::create_transport("in-memory", &get_sub_config(&config, "transport"))?;
    let responder = Thing::with_transport(&role_config(&config, "responder")?, transport.clone())?;
    let requester = Thing::with_transport(&role_config(&config, "requester")?, transport)?;

    let bind = responder::bind(&responder).await?;
    requester::run(&requester, responder.path()).await?;

    bind.unbind().await?;
    requester.destroy();
    responder.destroy();

    // Bye!
    info!("Exiting");
    Ok(())
}
