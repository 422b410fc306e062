//! Log sink setup for agent processes.
//!
//! An agent normally runs detached inside the allocation, far from any
//! terminal.  Its log therefore defaults into the pilot sandbox as
//! `agent_0.log`, the same file whose tail the terminate sequence flushes
//! into the pilot mailbox document; an interactive run keeps stderr, and an
//! explicit `log_file` in the config overrides both.

use std::io::IsTerminal;
use std::path::PathBuf;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::config::AgentConfig;
use crate::error::AgentError;

/// Log file name in the pilot sandbox; kept in sync with the tail flush in
/// the terminate sequence.
pub const AGENT_LOG: &str = "agent_0.log";

/// Resolve where this agent's log output goes.
///
/// `None` means stderr.  The caller passes whether stderr is a terminal so
/// the decision stays testable.
pub fn destination(cfg: &AgentConfig, stderr_is_terminal: bool) -> Option<PathBuf> {
    if let Some(path) = &cfg.log_file {
        return Some(path.clone());
    }
    if stderr_is_terminal {
        None
    } else {
        Some(cfg.pilot_sandbox.join(AGENT_LOG))
    }
}

/// Filter for the configured agent log level.
fn level_filter(level: &str) -> Result<EnvFilter, AgentError> {
    EnvFilter::try_new(level)
        .map_err(|e| AgentError::Logger(format!("bad log level '{level}': {e}")))
}

/// Install the global subscriber for this agent process.
///
/// `RUST_LOG` wins over the configured level so operators can raise
/// verbosity without editing the agent config.  The pilot sandbox may not
/// exist yet this early in boot; it is created here when the log lands in
/// it.
pub fn init(cfg: &AgentConfig) -> Result<(), AgentError> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| level_filter(&cfg.log_level))?;

    let destination = destination(cfg, std::io::stderr().is_terminal());
    let (writer, ansi) = match &destination {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AgentError::Logger(format!(
                        "cannot create log directory '{}': {e}",
                        parent.display()
                    ))
                })?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    AgentError::Logger(format!("cannot open log file '{}': {e}", path.display()))
                })?;
            (BoxMakeWriter::new(file), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .try_init()
        .map_err(|e| AgentError::Logger(format!("subscriber already installed: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cfg(sandbox: &TempDir) -> AgentConfig {
        AgentConfig::test_default(sandbox.path(), sandbox.path())
    }

    #[test]
    fn explicit_log_file_wins_over_everything() {
        let sandbox = TempDir::new().unwrap();
        let mut c = cfg(&sandbox);
        c.log_file = Some(PathBuf::from("/var/log/pilot.log"));

        assert_eq!(destination(&c, true), Some(PathBuf::from("/var/log/pilot.log")));
        assert_eq!(destination(&c, false), Some(PathBuf::from("/var/log/pilot.log")));
    }

    #[test]
    fn detached_agent_logs_into_the_pilot_sandbox() {
        let sandbox = TempDir::new().unwrap();
        let dest = destination(&cfg(&sandbox), false).unwrap();
        assert_eq!(dest, sandbox.path().join(AGENT_LOG));
    }

    #[test]
    fn interactive_run_stays_on_stderr() {
        let sandbox = TempDir::new().unwrap();
        assert_eq!(destination(&cfg(&sandbox), true), None);
    }

    #[test]
    fn level_filter_validates_config_values() {
        assert!(level_filter("debug").is_ok());
        assert!(level_filter("info,talipot_agent=trace").is_ok());
        let err = level_filter("extremely-loud").unwrap_err();
        assert!(err.to_string().contains("extremely-loud"));
    }

    #[test]
    fn init_creates_the_log_file_in_a_fresh_sandbox() {
        let root = TempDir::new().unwrap();
        // A sandbox path that does not exist yet, as at agent boot.
        let sandbox = root.path().join("pilot.0000");
        let mut c = AgentConfig::test_default(&sandbox, root.path());
        c.log_file = Some(sandbox.join(AGENT_LOG));

        // A subscriber may already be installed by a sibling test; the log
        // file must exist either way.
        match init(&c) {
            Ok(()) => {}
            Err(AgentError::Logger(msg)) if msg.contains("already installed") => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
        assert!(sandbox.join(AGENT_LOG).is_file());
    }
}
