use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    warden::cli::run().await
}
