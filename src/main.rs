use anyhow::Result;
use orderbook_aggregator::run::run;

#[tokio::main]
async fn main() -> Result<()> {
    run().await?;
    Ok(())
}
