#[tokio::main]
async fn main() {
    if let Err(e) = planner_sync_lib::run().await {
        log::error!("Fatal: {}", e);
        eprintln!("FATAL: {}", e);
        std::process::exit(1);
    }
}
