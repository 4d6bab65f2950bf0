//! Relay server binary.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use color_eyre::Result;

use relay_server::{RelayServerAgent, RelayServerSettings};

async fn _main() -> Result<()> {
    color_eyre::install()?;
    let settings = RelayServerSettings::load()?;
    settings.tracing.start_tracing()?;

    let agent = RelayServerAgent::from_settings(settings).await?;
    agent.run().await
}

fn main() -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(_main())
}
