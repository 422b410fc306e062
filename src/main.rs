//! `agent_0` — pilot agent entry point.
//!
//! Usage: `agent_0 <config.json>`.  Exit codes: 1 cancelled, 2 runtime
//! exceeded, 3 fatal error (heartbeat loss, component crash, external
//! signal, bad config).

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info};

use talipot_agent::agent::Agent0;
use talipot_agent::mailbox::FsMailbox;
use talipot_agent::{config, logger};

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    // Load .env if present — the file is optional.
    let _ = dotenvy::dotenv();

    let Some(cfg_path) = std::env::args().nth(1) else {
        eprintln!("usage: agent_0 <config.json>");
        return 3;
    };

    let cfg = match config::load(Path::new(&cfg_path)) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: {e}");
            return 3;
        }
    };

    if let Err(e) = logger::init(&cfg) {
        eprintln!("error: {e}");
        return 3;
    }

    let mailbox = match FsMailbox::open(&cfg.mailbox_path, &cfg.pilot_id) {
        Ok(mb) => Arc::new(mb),
        Err(e) => {
            error!(error = %e, "cannot open mailbox");
            return 3;
        }
    };

    match Agent0::new(cfg, mailbox).run().await {
        Ok(cause) => {
            info!(cause = ?cause, code = cause.exit_code(), "agent_0 done");
            cause.exit_code()
        }
        Err(e) => {
            error!(error = %e, "agent_0 failed at startup");
            3
        }
    }
}
