use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    dockjail::cli::run().await
}
