#[tokio::main]
async fn main() -> anyhow::Result<()> {
    lakeref::run_server().await
}
