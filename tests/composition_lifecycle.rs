use std::io::Write;
use std::sync::{Arc, Mutex};

use tempfile::NamedTempFile;
use triad::composition::{Composition, LifecycleError, RoleBuilder};
use triad::config::{IoConfig, MasterConfig, UserEdgeConfig, VoiceEdgeConfig};
use triad::network::shared::{AcceptFactory, ConnectFactory, DatagramFactory};
use triad::servers::{RoleError, RoleKind, ServerRole};
use triad::stats::StatsSet;

use RoleKind::{Master, UserEdge, VoiceEdge};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Start(RoleKind),
    Stop(RoleKind),
}

/// Shared log of everything the doubles saw.
#[derive(Default, Clone)]
struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
    factories: Arc<Mutex<Vec<(RoleKind, usize)>>>,
    stats: Arc<Mutex<Vec<(RoleKind, StatsSet)>>>,
}

impl Recorder {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn factory(&self, role: RoleKind, ptr: usize) {
        self.factories.lock().unwrap().push((role, ptr));
    }
}

fn addr_of<T: ?Sized>(factory: &Arc<T>) -> usize {
    Arc::as_ptr(factory) as *const () as usize
}

struct RecordingRole {
    kind: RoleKind,
    recorder: Recorder,
    fail_start: bool,
    fail_stop: bool,
}

impl ServerRole for RecordingRole {
    fn kind(&self) -> RoleKind {
        self.kind
    }

    fn start(&mut self, stats: &StatsSet) -> Result<(), RoleError> {
        self.recorder.calls.lock().unwrap().push(Call::Start(self.kind));
        self.recorder
            .stats
            .lock()
            .unwrap()
            .push((self.kind, stats.clone()));
        if self.fail_start {
            return Err(RoleError::Other {
                role: self.kind,
                source: anyhow::anyhow!("injected start failure"),
            });
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RoleError> {
        self.recorder.calls.lock().unwrap().push(Call::Stop(self.kind));
        if self.fail_stop {
            return Err(RoleError::Other {
                role: self.kind,
                source: anyhow::anyhow!("injected stop failure"),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingBuilder {
    recorder: Recorder,
    fail_construct: Option<RoleKind>,
    fail_start: Option<RoleKind>,
    fail_stop: Option<RoleKind>,
}

impl RecordingBuilder {
    fn role(&self, kind: RoleKind) -> Result<RecordingRole, RoleError> {
        if self.fail_construct == Some(kind) {
            return Err(RoleError::Config {
                role: kind,
                reason: "injected construction failure".into(),
            });
        }
        Ok(RecordingRole {
            kind,
            recorder: self.recorder.clone(),
            fail_start: self.fail_start == Some(kind),
            fail_stop: self.fail_stop == Some(kind),
        })
    }
}

impl RoleBuilder for RecordingBuilder {
    type Master = RecordingRole;
    type UserEdge = RecordingRole;
    type VoiceEdge = RecordingRole;

    fn master(
        &self,
        _config: MasterConfig,
        accept: Arc<dyn AcceptFactory>,
    ) -> Result<RecordingRole, RoleError> {
        self.recorder.factory(Master, addr_of(&accept));
        self.role(Master)
    }

    fn user_edge(
        &self,
        _config: UserEdgeConfig,
        accept: Arc<dyn AcceptFactory>,
        connect: Arc<dyn ConnectFactory>,
    ) -> Result<RecordingRole, RoleError> {
        self.recorder.factory(UserEdge, addr_of(&accept));
        self.recorder.factory(UserEdge, addr_of(&connect));
        self.role(UserEdge)
    }

    fn voice_edge(
        &self,
        _config: VoiceEdgeConfig,
        accept: Arc<dyn AcceptFactory>,
        connect: Arc<dyn ConnectFactory>,
        datagram: Arc<dyn DatagramFactory>,
    ) -> Result<RecordingRole, RoleError> {
        self.recorder.factory(VoiceEdge, addr_of(&accept));
        self.recorder.factory(VoiceEdge, addr_of(&connect));
        self.recorder.factory(VoiceEdge, addr_of(&datagram));
        self.role(VoiceEdge)
    }
}

const VALID: &str = r#"
master:
  listen_addr: "127.0.0.1:7000"
  auth_token: "secret"
user_edge:
  listen_addr: "127.0.0.1:7100"
  master_addr: "127.0.0.1:7000"
  master_token: "secret"
voice_edge:
  signal_addr: "127.0.0.1:7200"
  media_addr: "127.0.0.1:7201"
  master_addr: "127.0.0.1:7000"
  master_token: "secret"
io:
  accept_threads: 1
  io_threads: 1
  shutdown_timeout_ms: 500
"#;

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_start_then_stop_call_order() {
    let file = config_file(VALID);
    let builder = RecordingBuilder::default();

    let composition = Composition::launch_with(file.path(), &builder).unwrap();
    assert_eq!(
        builder.recorder.calls(),
        vec![Call::Start(Master), Call::Start(VoiceEdge), Call::Start(UserEdge)]
    );
    assert_eq!(composition.running(), &[Master, VoiceEdge, UserEdge]);

    composition.stop().unwrap();
    let calls = builder.recorder.calls();
    assert_eq!(
        calls,
        vec![
            Call::Start(Master),
            Call::Start(VoiceEdge),
            Call::Start(UserEdge),
            Call::Stop(UserEdge),
            Call::Stop(VoiceEdge),
            Call::Stop(Master),
        ]
    );

    // Stop order is exactly the reverse of start order.
    let starts: Vec<RoleKind> = calls
        .iter()
        .filter_map(|c| match c {
            Call::Start(k) => Some(*k),
            _ => None,
        })
        .collect();
    let mut stops: Vec<RoleKind> = calls
        .iter()
        .filter_map(|c| match c {
            Call::Stop(k) => Some(*k),
            _ => None,
        })
        .collect();
    stops.reverse();
    assert_eq!(starts, stops);
}

#[test]
fn test_every_role_gets_the_same_shared_io() {
    let file = config_file(VALID);
    let builder = RecordingBuilder::default();
    let composition = Composition::launch_with(file.path(), &builder).unwrap();

    let shared = Arc::as_ptr(composition.io()) as *const () as usize;
    let seen = builder.recorder.factories.lock().unwrap().clone();
    assert_eq!(seen.len(), 6);
    for (role, ptr) in &seen {
        assert_eq!(*ptr, shared, "{} got a different I/O instance", role);
    }
    composition.stop().unwrap();
}

#[test]
fn test_every_role_gets_all_three_stats_handles() {
    let file = config_file(VALID);
    let builder = RecordingBuilder::default();
    let composition = Composition::launch_with(file.path(), &builder).unwrap();

    let expected = composition.stats();
    let seen = builder.recorder.stats.lock().unwrap().clone();
    let roles: Vec<RoleKind> = seen.iter().map(|(role, _)| *role).collect();
    assert_eq!(roles, vec![Master, VoiceEdge, UserEdge]);
    for (role, stats) in &seen {
        assert!(stats.same_handles(&expected), "{} got a different stats set", role);
        assert_eq!(stats.get(Master).kind(), Master);
        assert_eq!(stats.get(UserEdge).kind(), UserEdge);
        assert_eq!(stats.get(VoiceEdge).kind(), VoiceEdge);
    }
    composition.stop().unwrap();
}

#[test]
fn test_construction_failure_starts_nothing() {
    for failing in [Master, UserEdge, VoiceEdge] {
        let file = config_file(VALID);
        let builder = RecordingBuilder {
            fail_construct: Some(failing),
            ..Default::default()
        };
        let err = Composition::launch_with(file.path(), &builder)
            .err()
            .expect("construction failure must abort launch");
        assert!(matches!(err, LifecycleError::Construct { role, .. } if role == failing));
        assert!(builder.recorder.calls().is_empty());
    }
}

#[test]
fn test_invalid_master_section_is_config_error() {
    let broken = VALID.replace("auth_token: \"secret\"", "auth_token: \"\"");
    let file = config_file(&broken);
    let builder = RecordingBuilder::default();

    let err = Composition::launch_with(file.path(), &builder)
        .err()
        .expect("invalid master config must abort launch");
    match err {
        LifecycleError::Config(e) => {
            assert_eq!(e.section(), "master");
            assert_eq!(e.key(), Some("auth_token"));
        }
        other => panic!("expected config error, got {}", other),
    }
    assert!(builder.recorder.calls().is_empty());
    // Nothing was constructed either.
    assert!(builder.recorder.factories.lock().unwrap().is_empty());
}

#[test]
fn test_missing_config_file() {
    let builder = RecordingBuilder::default();
    let err = Composition::launch_with("/nonexistent/triad.yaml", &builder)
        .err()
        .expect("missing file must abort launch");
    assert!(matches!(err, LifecycleError::Config(_)));
    assert!(builder.recorder.calls().is_empty());
}

#[test]
fn test_user_edge_stop_failure_still_stops_the_rest() {
    let file = config_file(VALID);
    let builder = RecordingBuilder {
        fail_stop: Some(UserEdge),
        ..Default::default()
    };
    let composition = Composition::launch_with(file.path(), &builder).unwrap();

    let err = composition.stop().unwrap_err();
    assert_eq!(err.failures.len(), 1);
    assert!(err.to_string().contains("injected stop failure"));

    let calls = builder.recorder.calls();
    assert_eq!(
        &calls[3..],
        &[Call::Stop(UserEdge), Call::Stop(VoiceEdge), Call::Stop(Master)]
    );
}

#[test]
fn test_start_failure_rolls_back_started_roles() {
    let file = config_file(VALID);
    let builder = RecordingBuilder {
        fail_start: Some(VoiceEdge),
        ..Default::default()
    };
    let err = Composition::launch_with(file.path(), &builder)
        .err()
        .expect("start failure must abort launch");
    assert!(matches!(err, LifecycleError::Startup { role: VoiceEdge, .. }));
    assert_eq!(err.role(), Some(VoiceEdge));

    // UserEdge never starts; Master is stopped again.
    assert_eq!(
        builder.recorder.calls(),
        vec![Call::Start(Master), Call::Start(VoiceEdge), Call::Stop(Master)]
    );
}

#[test]
fn test_start_twice_is_rejected() {
    let configs = triad::config::ConfigAggregator::load_str(VALID).unwrap();
    let io = IoConfig::from_str(VALID).unwrap();
    let builder = RecordingBuilder::default();

    let mut composition = Composition::build(configs, &io, &builder).unwrap();
    assert!(builder.recorder.calls().is_empty());
    assert!(composition.running().is_empty());

    composition.start().unwrap();
    assert!(matches!(composition.start(), Err(LifecycleError::AlreadyStarted)));
    assert_eq!(builder.recorder.calls().len(), 3);

    assert_eq!(composition.master().kind(), Master);
    composition.stop().unwrap();
    assert_eq!(builder.recorder.calls().len(), 6);
}

#[test]
fn test_stop_without_start_calls_no_role() {
    let configs = triad::config::ConfigAggregator::load_str(VALID).unwrap();
    let io = IoConfig::from_str(VALID).unwrap();
    let builder = RecordingBuilder::default();

    let composition = Composition::build(configs, &io, &builder).unwrap();
    composition.stop().unwrap();
    assert!(builder.recorder.calls().is_empty());
}

#[test]
fn test_start_failure_with_failing_rollback_releases_once() {
    let file = config_file(VALID);
    let builder = RecordingBuilder {
        fail_start: Some(VoiceEdge),
        fail_stop: Some(Master),
        ..Default::default()
    };
    let err = Composition::launch_with(file.path(), &builder)
        .err()
        .expect("start failure must abort launch");
    assert!(matches!(err, LifecycleError::Startup { role: VoiceEdge, .. }));

    // The failed rollback is not retried when the pools are released.
    assert_eq!(
        builder.recorder.calls(),
        vec![Call::Start(Master), Call::Start(VoiceEdge), Call::Stop(Master)]
    );
}

#[test]
fn test_prepare_builds_without_starting() {
    let file = config_file(VALID);
    let builder = RecordingBuilder::default();

    let composition = Composition::prepare(file.path(), &builder).unwrap();
    assert_eq!(builder.recorder.factories.lock().unwrap().len(), 6);
    assert!(builder.recorder.calls().is_empty());
    assert!(composition.running().is_empty());

    let composition = composition.started().unwrap();
    assert_eq!(composition.running(), &[Master, VoiceEdge, UserEdge]);
    composition.stop().unwrap();
    assert_eq!(builder.recorder.calls().len(), 6);
}
