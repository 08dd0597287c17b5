use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use farmhand::config::{CasInsertionControl, CasInsertionPolicy, MemoryInstanceConfig, WorkerConfig};
use farmhand::digest::Digest;
use farmhand::instance::MemoryInstance;
use farmhand::messages::{Command, EnvironmentVariable};
use farmhand::worker::CommandExecutor;

fn command(argv: &[&str]) -> Command {
    Command {
        arguments: argv.iter().map(|arg| arg.to_string()).collect(),
        environment_variables: Vec::new(),
    }
}

struct ExecFixture {
    _temp: tempfile::TempDir,
    exec_dir: PathBuf,
    instance: Arc<MemoryInstance>,
}

impl ExecFixture {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let exec_dir = temp.path().join("exec");
        std::fs::create_dir_all(&exec_dir).unwrap();
        Self {
            _temp: temp,
            exec_dir,
            instance: Arc::new(MemoryInstance::new(
                "test".to_string(),
                MemoryInstanceConfig::default(),
            )),
        }
    }

    fn executor(&self, config: &WorkerConfig) -> CommandExecutor {
        let instance: Arc<dyn farmhand::instance::Instance> = Arc::clone(&self.instance) as Arc<dyn farmhand::instance::Instance>;
        CommandExecutor::new(instance, config)
    }
}

fn inline_config() -> WorkerConfig {
    WorkerConfig {
        stdout_cas_control: CasInsertionControl {
            limit: 1024,
            policy: CasInsertionPolicy::NeverInsert,
        },
        stderr_cas_control: CasInsertionControl {
            limit: 1024,
            policy: CasInsertionPolicy::NeverInsert,
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn captures_stdout_inline() {
    let fixture = ExecFixture::new();
    let executor = fixture.executor(&inline_config());

    let result = executor
        .execute(&fixture.exec_dir, &command(&["/bin/echo", "hello"]), None, "", "")
        .await
        .unwrap();

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout_raw.as_deref(), Some(b"hello\n".as_slice()));
    assert!(result.stdout_digest.is_none());
    assert!(result.stderr_raw.is_none());
}

#[tokio::test]
async fn empty_streams_are_omitted() {
    let fixture = ExecFixture::new();
    let executor = fixture.executor(&inline_config());

    let result = executor
        .execute(&fixture.exec_dir, &command(&["/bin/true"]), None, "", "")
        .await
        .unwrap();

    assert_eq!(result.exit_code, 0);
    assert!(result.stdout_raw.is_none());
    assert!(result.stdout_digest.is_none());
    assert!(result.stderr_raw.is_none());
    assert!(result.stderr_digest.is_none());
}

#[tokio::test]
async fn nonzero_exit_code_is_reported() {
    let fixture = ExecFixture::new();
    let executor = fixture.executor(&inline_config());

    let result = executor
        .execute(&fixture.exec_dir, &command(&["/bin/sh", "-c", "exit 3"]), None, "", "")
        .await
        .unwrap();

    assert_eq!(result.exit_code, 3);
}

#[tokio::test]
async fn environment_fully_replaces_the_inherited_one() {
    let fixture = ExecFixture::new();
    let executor = fixture.executor(&inline_config());

    let mut cmd = command(&["/bin/sh", "-c", "printf %s \"$FOO$HOME\""]);
    cmd.environment_variables = vec![EnvironmentVariable {
        name: "FOO".to_string(),
        value: "bar".to_string(),
    }];

    let result = executor
        .execute(&fixture.exec_dir, &cmd, None, "", "")
        .await
        .unwrap();

    // HOME was not inherited; only FOO survives.
    assert_eq!(result.stdout_raw.as_deref(), Some(b"bar".as_slice()));
}

#[tokio::test]
async fn stderr_is_captured_independently() {
    let fixture = ExecFixture::new();
    let executor = fixture.executor(&inline_config());

    let result = executor
        .execute(
            &fixture.exec_dir,
            &command(&["/bin/sh", "-c", "echo oops >&2; exit 1"]),
            None,
            "",
            "",
        )
        .await
        .unwrap();

    assert_eq!(result.exit_code, 1);
    assert!(result.stdout_raw.is_none());
    assert_eq!(result.stderr_raw.as_deref(), Some(b"oops\n".as_slice()));
}

#[tokio::test]
async fn stdin_is_closed() {
    let fixture = ExecFixture::new();
    let executor = fixture.executor(&inline_config());

    // cat with no arguments reads stdin; a closed stdin means immediate EOF.
    let started = Instant::now();
    let result = executor
        .execute(&fixture.exec_dir, &command(&["/bin/cat"]), None, "", "")
        .await
        .unwrap();

    assert_eq!(result.exit_code, 0);
    assert!(result.stdout_raw.is_none());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn spawn_failure_yields_minus_one() {
    let fixture = ExecFixture::new();
    let executor = fixture.executor(&inline_config());

    let result = executor
        .execute(
            &fixture.exec_dir,
            &command(&["/no/such/binary-xyz"]),
            None,
            "",
            "",
        )
        .await
        .unwrap();

    assert_eq!(result.exit_code, -1);
    assert!(result.stdout_raw.is_none());
    assert!(result.stderr_raw.is_none());
}

#[tokio::test]
async fn empty_argument_vector_yields_minus_one() {
    let fixture = ExecFixture::new();
    let executor = fixture.executor(&inline_config());

    let result = executor
        .execute(&fixture.exec_dir, &command(&[]), None, "", "")
        .await
        .unwrap();

    assert_eq!(result.exit_code, -1);
}

#[tokio::test]
async fn timeout_force_kills_the_process() {
    let fixture = ExecFixture::new();
    let executor = fixture.executor(&inline_config());

    let started = Instant::now();
    let result = executor
        .execute(
            &fixture.exec_dir,
            &command(&["/bin/sleep", "30"]),
            Some(Duration::from_millis(300)),
            "",
            "",
        )
        .await
        .unwrap();

    assert_eq!(result.exit_code, -1);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn stream_of_size_exactly_limit_stays_inline() {
    let fixture = ExecFixture::new();

    // limit == size, ALWAYS_INSERT: raw set and digest set.
    let mut config = WorkerConfig::default();
    config.stdout_cas_control = CasInsertionControl {
        limit: 4,
        policy: CasInsertionPolicy::AlwaysInsert,
    };
    let result = fixture
        .executor(&config)
        .execute(
            &fixture.exec_dir,
            &command(&["/bin/sh", "-c", "printf abcd"]),
            None,
            "",
            "",
        )
        .await
        .unwrap();
    assert_eq!(result.stdout_raw.as_deref(), Some(b"abcd".as_slice()));
    assert_eq!(result.stdout_digest, Some(Digest::of(b"abcd")));

    // limit == size, INSERT_ABOVE_LIMIT: raw set, no digest.
    config.stdout_cas_control.policy = CasInsertionPolicy::InsertAboveLimit;
    let result = fixture
        .executor(&config)
        .execute(
            &fixture.exec_dir,
            &command(&["/bin/sh", "-c", "printf abcd"]),
            None,
            "",
            "",
        )
        .await
        .unwrap();
    assert_eq!(result.stdout_raw.as_deref(), Some(b"abcd".as_slice()));
    assert!(result.stdout_digest.is_none());
}

#[tokio::test]
async fn stream_one_past_limit_inserts_without_inlining() {
    let fixture = ExecFixture::new();
    let mut config = WorkerConfig::default();
    config.stdout_cas_control = CasInsertionControl {
        limit: 3,
        policy: CasInsertionPolicy::InsertAboveLimit,
    };

    let result = fixture
        .executor(&config)
        .execute(
            &fixture.exec_dir,
            &command(&["/bin/sh", "-c", "printf abcd"]),
            None,
            "",
            "",
        )
        .await
        .unwrap();

    assert!(result.stdout_raw.is_none());
    assert_eq!(result.stdout_digest, Some(Digest::of(b"abcd")));
}

#[tokio::test]
async fn stdout_is_forwarded_to_the_named_stream() {
    let fixture = ExecFixture::new();
    let mut config = inline_config();
    config.stream_stdout = true;

    let result = fixture
        .executor(&config)
        .execute(
            &fixture.exec_dir,
            &command(&["/bin/echo", "live"]),
            None,
            "op/stdout",
            "",
        )
        .await
        .unwrap();

    assert_eq!(result.stdout_raw.as_deref(), Some(b"live\n".as_slice()));
    assert_eq!(fixture.instance.stream_output("op/stdout"), b"live\n");
}

#[tokio::test]
async fn forwarding_disabled_uses_a_null_sink() {
    let fixture = ExecFixture::new();
    // Stream name present but the enable flag is off.
    let config = inline_config();

    let result = fixture
        .executor(&config)
        .execute(
            &fixture.exec_dir,
            &command(&["/bin/echo", "quiet"]),
            None,
            "op/stdout",
            "",
        )
        .await
        .unwrap();

    assert_eq!(result.stdout_raw.as_deref(), Some(b"quiet\n".as_slice()));
    assert!(fixture.instance.stream_output("op/stdout").is_empty());
}
