use terraform_provider_mssql::{init_logging, serve, MssqlProvider};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    serve(MssqlProvider::new()).await
}
