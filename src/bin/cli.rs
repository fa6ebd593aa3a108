use miette::Result;

#[tokio::main]
async fn main() -> Result<()> {
    peersync::cli::run().await?;
    Ok(())
}
