//! Component manager — starts, supervises and tears down the components of
//! one agent process.
//!
//! Startup is staged: the bridge catalog exists before any component runs
//! (so subscribers exist before publishers), and a component counts as
//! ready only after its first heartbeat.  At runtime the manager tracks the
//! last beat per uid; a child missing beats for the configured timeout, or
//! any component exit, publishes `terminate` and fails the agent.

use std::collections::HashMap;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Duration, Instant, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::ControlBus;
use crate::error::AgentError;
use crate::messages::ControlMessage;

use super::Component;

pub struct ComponentManager {
    cancel: CancellationToken,
    monitor: Option<JoinHandle<Result<(), AgentError>>>,
}

impl ComponentManager {
    /// Spawn `components` and wait for each to beat once.
    ///
    /// `cancel` is the shared shutdown token: the manager cancels it on any
    /// supervision failure, and an external cancel winds the manager down
    /// cleanly.
    pub async fn start(
        components: Vec<Box<dyn Component>>,
        control: ControlBus,
        heartbeat_interval: Duration,
        heartbeat_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, AgentError> {
        // Subscribe before spawning so no startup beat can be missed.
        let mut control_rx = control.subscribe();

        let mut set: JoinSet<Result<(), AgentError>> = JoinSet::new();
        let mut pending: Vec<String> = Vec::new();
        for component in components {
            let uid = component.uid().to_string();
            debug!(component = %uid, "spawning component");
            pending.push(uid);
            set.spawn(component.run(cancel.clone()));
        }

        // Readiness: every child beats once within the failure timeout.
        let mut last_beat: HashMap<String, Instant> = HashMap::new();
        let ready = timeout(heartbeat_timeout, async {
            while last_beat.len() < pending.len() {
                match control_rx.recv().await {
                    Ok(ControlMessage::Heartbeat { uid, .. }) => {
                        if pending.contains(&uid) {
                            last_beat.insert(uid, Instant::now());
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "control bus lagged during startup");
                    }
                    Err(_) => break,
                }
            }
        })
        .await;

        if ready.is_err() {
            let missing: Vec<_> =
                pending.iter().filter(|uid| !last_beat.contains_key(*uid)).collect();
            cancel.cancel();
            while set.join_next().await.is_some() {}
            return Err(AgentError::HeartbeatLoss(format!(
                "components never became ready: {missing:?}"
            )));
        }
        info!(components = pending.len(), "all components ready");

        let monitor = tokio::spawn(Self::monitor(
            set,
            control,
            control_rx,
            last_beat,
            heartbeat_interval,
            heartbeat_timeout,
            cancel.clone(),
        ));

        Ok(Self { cancel, monitor: Some(monitor) })
    }

    async fn monitor(
        mut set: JoinSet<Result<(), AgentError>>,
        control: ControlBus,
        mut control_rx: tokio::sync::broadcast::Receiver<ControlMessage>,
        mut last_beat: HashMap<String, Instant>,
        heartbeat_interval: Duration,
        heartbeat_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<(), AgentError> {
        let mut check = interval(heartbeat_interval);

        let failure = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break None,

                joined = set.join_next() => {
                    if cancel.is_cancelled() {
                        break None;
                    }
                    // Any component exit outside shutdown is fatal.
                    break Some(match joined {
                        Some(Err(e)) => AgentError::HeartbeatLoss(format!("component panicked: {e}")),
                        Some(Ok(Err(e))) => e,
                        Some(Ok(Ok(()))) => AgentError::HeartbeatLoss("component exited unexpectedly".into()),
                        None => AgentError::HeartbeatLoss("all components gone".into()),
                    });
                }

                msg = control_rx.recv() => {
                    match msg {
                        Ok(ControlMessage::Heartbeat { uid, .. }) => {
                            // Replay-safe: only the latest instant matters.
                            if let Some(beat) = last_beat.get_mut(&uid) {
                                *beat = Instant::now();
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "control bus lagged in heartbeat monitor");
                        }
                        Err(_) => break Some(AgentError::Transport("control bus closed".into())),
                    }
                }

                _ = check.tick() => {
                    let now = Instant::now();
                    let stale: Vec<_> = last_beat
                        .iter()
                        .filter(|(_, beat)| now.duration_since(**beat) > heartbeat_timeout)
                        .map(|(uid, _)| uid.clone())
                        .collect();
                    if let Some(uid) = stale.first() {
                        break Some(AgentError::HeartbeatLoss(format!(
                            "component '{uid}' missed heartbeats for {heartbeat_timeout:?}"
                        )));
                    }
                }
            }
        };

        // Teardown mirrors startup: stop the children, then drain them.
        control.publish(ControlMessage::Terminate);
        cancel.cancel();
        while let Some(res) = set.join_next().await {
            if let Ok(Err(e)) = res {
                debug!(error = %e, "component error during drain");
            }
        }

        match failure {
            Some(e) => {
                error!(error = %e, "component supervision failed");
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Await supervision failure.  Resolves only when the manager stops; if
    /// the monitor was already reaped this pends forever, so it is safe as a
    /// `select!` arm.
    pub async fn failed(&mut self) -> AgentError {
        let Some(monitor) = &mut self.monitor else {
            return std::future::pending().await;
        };
        let result = monitor.await;
        self.monitor = None;
        match result {
            Ok(Err(e)) => e,
            Ok(Ok(())) => AgentError::HeartbeatLoss("component manager stopped".into()),
            Err(e) => AgentError::HeartbeatLoss(format!("component manager panicked: {e}")),
        }
    }

    /// Cascaded shutdown: cancel all components and wait for the monitor.
    pub async fn close(mut self) -> Result<(), AgentError> {
        self.cancel.cancel();
        match self.monitor.take() {
            Some(monitor) => match monitor.await {
                Ok(result) => result,
                Err(e) => Err(AgentError::HeartbeatLoss(format!("component manager panicked: {e}"))),
            },
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::ComponentFuture;

    /// Beats on schedule until shutdown; optionally goes silent after a
    /// number of beats, or exits outright.
    struct FakeComponent {
        uid: String,
        control: ControlBus,
        beat_every: Duration,
        silent_after: Option<u32>,
        exit_after: Option<u32>,
    }

    impl FakeComponent {
        fn well_behaved(uid: &str, control: &ControlBus) -> Box<Self> {
            Box::new(Self {
                uid: uid.into(),
                control: control.clone(),
                beat_every: Duration::from_millis(10),
                silent_after: None,
                exit_after: None,
            })
        }
    }

    impl Component for FakeComponent {
        fn uid(&self) -> &str {
            &self.uid
        }

        fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture {
            Box::pin(async move {
                let mut beats = 0u32;
                let mut tick = interval(self.beat_every);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tick.tick() => {
                            if let Some(n) = self.exit_after {
                                if beats >= n {
                                    return Ok(());
                                }
                            }
                            let silent = self.silent_after.is_some_and(|n| beats >= n);
                            if !silent {
                                self.control.publish(ControlMessage::heartbeat(&self.uid));
                            }
                            beats += 1;
                        }
                    }
                }
            })
        }
    }

    #[tokio::test]
    async fn healthy_components_start_and_close_cleanly() {
        let control = ControlBus::new();
        let cancel = CancellationToken::new();
        let cmgr = ComponentManager::start(
            vec![
                FakeComponent::well_behaved("a", &control),
                FakeComponent::well_behaved("b", &control),
            ],
            control,
            Duration::from_millis(10),
            Duration::from_millis(500),
            cancel,
        )
        .await
        .unwrap();

        cmgr.close().await.unwrap();
    }

    #[tokio::test]
    async fn silent_component_triggers_heartbeat_loss_and_terminate() {
        let control = ControlBus::new();
        let mut observer = control.subscribe();
        let cancel = CancellationToken::new();

        let quiet = Box::new(FakeComponent {
            uid: "quiet".into(),
            control: control.clone(),
            beat_every: Duration::from_millis(10),
            silent_after: Some(2),
            exit_after: None,
        });
        let mut cmgr = ComponentManager::start(
            vec![FakeComponent::well_behaved("ok", &control), quiet],
            control,
            Duration::from_millis(10),
            Duration::from_millis(100),
            cancel,
        )
        .await
        .unwrap();

        let err = timeout(Duration::from_secs(2), cmgr.failed()).await.unwrap();
        assert!(matches!(err, AgentError::HeartbeatLoss(_)));
        assert!(err.to_string().contains("quiet"));

        // Terminate went out on the control bus.
        let mut saw_terminate = false;
        while let Ok(msg) = observer.try_recv() {
            if matches!(msg, ControlMessage::Terminate) {
                saw_terminate = true;
            }
        }
        assert!(saw_terminate);
    }

    #[tokio::test]
    async fn component_exit_is_fatal() {
        let control = ControlBus::new();
        let cancel = CancellationToken::new();
        let short_lived = Box::new(FakeComponent {
            uid: "short".into(),
            control: control.clone(),
            beat_every: Duration::from_millis(10),
            silent_after: None,
            exit_after: Some(3),
        });
        let mut cmgr = ComponentManager::start(
            vec![short_lived],
            control,
            Duration::from_millis(10),
            Duration::from_millis(500),
            cancel,
        )
        .await
        .unwrap();

        let err = timeout(Duration::from_secs(2), cmgr.failed()).await.unwrap();
        assert!(err.to_string().contains("exited"));
    }

    #[tokio::test]
    async fn never_beating_component_fails_startup() {
        let control = ControlBus::new();
        let cancel = CancellationToken::new();
        let mute = Box::new(FakeComponent {
            uid: "mute".into(),
            control: control.clone(),
            beat_every: Duration::from_millis(10),
            silent_after: Some(0),
            exit_after: None,
        });
        let result = ComponentManager::start(
            vec![mute],
            control,
            Duration::from_millis(10),
            Duration::from_millis(100),
            cancel,
        )
        .await;

        match result {
            Err(AgentError::HeartbeatLoss(msg)) => assert!(msg.contains("mute")),
            other => panic!("expected startup failure, got {:?}", other.map(|_| ())),
        }
    }
}
