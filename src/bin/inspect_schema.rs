//! Utility to inspect the CRM tables and print their columns.

use anyhow::Context;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use std::env;

use rust_crm_api::db::CRM_TABLES;

/// Lists the columns of every CRM table and flags the ones missing from the database.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&database_url)
        .await?;

    let mut missing = Vec::new();
    for table in CRM_TABLES {
        let columns: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT column_name, data_type, is_nullable FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1 ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(&pool)
        .await?;

        if columns.is_empty() {
            missing.push(*table);
            continue;
        }

        println!("{}", table);
        for (col, type_, nullable) in columns {
            let null = if nullable == "YES" { "" } else { " not null" };
            println!("  - {}: {}{}", col, type_, null);
        }
        println!();
    }

    if missing.is_empty() {
        println!("All {} CRM tables present", CRM_TABLES.len());
    } else {
        println!("Missing tables: {}", missing.join(", "));
    }

    Ok(())
}
