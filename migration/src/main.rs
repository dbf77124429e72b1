use sea_orm_migration::prelude::*;

/// Apply or roll back the central store schema by hand, e.g.
/// `DATABASE_URL=postgres://... cargo run -p migration -- status`.
///
/// Dispatchers also apply pending migrations on their first cycle.
#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    cli::run_cli(migration::Migrator).await;
}
