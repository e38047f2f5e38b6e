//! MultiWiki recipe server
//!
//! Serves the bags and recipes of one SQLite store over HTTP so that sync
//! clients can poll, load, save and delete tiddlers.
//!
//! Usage:
//!   multiwiki-server --port 8080 --database wiki.sqlite \
//!       --recipe default=system,user

use anyhow::{Context, Result};
use clap::Parser;
use multiwiki_server::{build_router, seed_store, RecipeDefinition};
use multiwiki_storage::BagStore;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const MEMORY_DATABASE: &str = ":memory:";

#[derive(Parser, Debug)]
#[command(name = "multiwiki-server")]
#[command(about = "MultiWiki bag and recipe server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// SQLite database file, or :memory:
    #[arg(short, long, default_value = MEMORY_DATABASE)]
    database: String,

    /// Bag to create if missing (repeatable)
    #[arg(long = "bag", value_name = "NAME")]
    bags: Vec<String>,

    /// Recipe to define, lowest bag first (repeatable)
    #[arg(long = "recipe", value_name = "NAME=BAG1,BAG2")]
    recipes: Vec<RecipeDefinition>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let store = if args.database == MEMORY_DATABASE {
        BagStore::open_in_memory()
    } else {
        BagStore::open(&args.database)
    }
    .with_context(|| format!("failed to open database {}", args.database))?;
    seed_store(&store, &args.bags, &args.recipes).context("failed to seed bags and recipes")?;

    for recipe in store.list_recipes()? {
        info!("Recipe {:?}: {}", recipe, store.get_recipe_bags(&recipe)?.join(", "));
    }

    let app = build_router(Arc::new(store));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port))
        .await
        .with_context(|| format!("failed to bind port {}", args.port))?;
    info!("MultiWiki server listening on port {}", args.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("HTTP server failed")?;
    Ok(())
}
