//! End-to-end tests of the client against an in-process server speaking the
//! real wire protocol over TLS, running real `sh` children.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use drover_base::{
    compress, Job, JobState, Method, Request, Response, FAIL_REASON_CFOUND, FAIL_REASON_CWD,
    FAIL_REASON_EXIT, FAIL_REASON_KILLED, FAIL_REASON_RAM, FAIL_REASON_TIME, FAIL_REASON_UPLOAD,
    EXIT_CODE_UPLOAD_FAILED,
};
use drover_client::{
    Behaviours, Client, ClientConfig, Mounter, NoBehaviours, NoMounts, ERR_MUST_RESERVE,
};
use drover_util::net;
use serial_test::serial;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct ServerState {
    job: Mutex<Option<Job>>,
    kill_on_touch: bool,
    seen: Mutex<Vec<Request>>,
}

impl ServerState {
    fn respond(&self, req: &Request) -> Response {
        let mut resp = Response::default();
        match req.method {
            Method::Reserve => {
                if let Some(mut job) = self.job.lock().unwrap().take() {
                    job.reserved_by = Some(req.client_id);
                    job.state = JobState::Reserved;
                    resp.job = Some(job);
                }
            }
            Method::Touch => resp.kill_called = self.kill_on_touch,
            _ => {}
        }
        resp
    }

    fn methods_seen(&self) -> Vec<Method> {
        self.seen.lock().unwrap().iter().map(|req| req.method).collect()
    }
}

struct FakeServer {
    addr: String,
    ca_path: PathBuf,
    _ca_file: tempfile::NamedTempFile,
    state: Arc<ServerState>,
}

impl FakeServer {
    async fn start(job: Option<Job>, kill_on_touch: bool) -> FakeServer {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_der = certified.cert.der().clone();
        let key = rustls::pki_types::PrivateKeyDer::Pkcs8(
            certified.key_pair.serialize_der().into(),
        );
        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key)
            .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

        let mut ca_file = tempfile::NamedTempFile::new().unwrap();
        ca_file.write_all(certified.cert.pem().as_bytes()).unwrap();
        let ca_path = ca_file.path().to_owned();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let state = Arc::new(ServerState {
            job: Mutex::new(job),
            kill_on_touch,
            seen: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    return;
                };
                let acceptor = acceptor.clone();
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let Ok(mut stream) = acceptor.accept(tcp).await else {
                        return;
                    };
                    loop {
                        let req: Request = match net::read_message(&mut stream).await {
                            Ok(req) => req,
                            Err(_) => return,
                        };
                        let resp = state.respond(&req);
                        state.seen.lock().unwrap().push(req);
                        if net::write_message(&mut stream, &resp).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        FakeServer {
            addr,
            ca_path,
            _ca_file: ca_file,
            state,
        }
    }

    fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(&self.addr, "localhost", b"secret".to_vec());
        config.ca_file = Some(self.ca_path.clone());
        config.shell = "sh".to_string();
        config
    }
}

fn test_log() -> slog::Logger {
    use slog::Drain as _;
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

fn test_job(cmd: &str, cwd: &std::path::Path) -> Job {
    let mut job = Job::new(cmd, cwd.to_string_lossy());
    job.key = format!("key-{:x}", md5ish(cmd));
    job.requirements.ram = 500;
    job.requirements.time = Duration::from_secs(60);
    job
}

// just needs to differ per command for distinct hashed dirs
fn md5ish(s: &str) -> u64 {
    s.bytes().fold(0u64, |acc, b| {
        acc.wrapping_mul(31).wrapping_add(b as u64)
    })
}

async fn reserve_one(client: &Client) -> Job {
    client
        .reserve(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("the fake server had a job for us")
}

#[tokio::test]
#[serial]
async fn successful_job_is_archived() {
    let cwd = tempfile::tempdir().unwrap();
    let server = FakeServer::start(Some(test_job("echo hello", cwd.path())), false).await;
    let client = Client::connect(server.config(), test_log()).await.unwrap();
    let mut job = reserve_one(&client).await;

    client.execute(&mut job, &NoMounts, &NoBehaviours).await.unwrap();

    assert_eq!(job.state, JobState::Complete);
    assert!(job.exited);
    assert_eq!(job.exitcode, 0);
    assert!(job.peak_ram >= 1);
    assert_eq!(
        compress::decompress(&job.stdout_c).await.unwrap(),
        b"hello"
    );
    let methods = server.state.methods_seen();
    assert!(methods.contains(&Method::Started));
    assert_eq!(methods.last(), Some(&Method::Archive));

    // the job ran in a hashed directory under cwd, and its tmp dir is gone
    let actual_cwd = PathBuf::from(job.actual_cwd.unwrap());
    assert!(actual_cwd.starts_with(cwd.path()));
    assert!(actual_cwd.ends_with("cwd"));
    assert!(!actual_cwd.parent().unwrap().join("tmp").exists());
}

#[tokio::test]
#[serial]
async fn failing_job_is_released_and_burns_retry_budget() {
    let cwd = tempfile::tempdir().unwrap();
    let server = FakeServer::start(Some(test_job("exit 42", cwd.path())), false).await;
    let client = Client::connect(server.config(), test_log()).await.unwrap();
    let mut job = reserve_one(&client).await;
    let budget_before = job.until_buried;

    let err = client
        .execute(&mut job, &NoMounts, &NoBehaviours)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("exit code 42"));
    assert_eq!(job.exitcode, 42);
    assert_eq!(job.fail_reason, FAIL_REASON_EXIT);
    assert_eq!(job.until_buried, budget_before - 1);
    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(server.state.methods_seen().last(), Some(&Method::Release));
}

#[tokio::test]
#[serial]
async fn missing_command_is_buried() {
    let cwd = tempfile::tempdir().unwrap();
    let server = FakeServer::start(
        Some(test_job("exec nonexistent-binary-drover-test", cwd.path())),
        false,
    )
    .await;
    let client = Client::connect(server.config(), test_log()).await.unwrap();
    let mut job = reserve_one(&client).await;

    client
        .execute(&mut job, &NoMounts, &NoBehaviours)
        .await
        .unwrap_err();

    assert_eq!(job.exitcode, 127);
    assert_eq!(job.fail_reason, FAIL_REASON_CFOUND);
    assert_eq!(job.state, JobState::Buried);
    assert_eq!(server.state.methods_seen().last(), Some(&Method::Bury));
}

#[tokio::test]
#[serial]
async fn missing_cwd_is_buried_without_running() {
    let server = FakeServer::start(
        Some(test_job("true", std::path::Path::new("/nonexistent-drover-dir"))),
        false,
    )
    .await;
    let client = Client::connect(server.config(), test_log()).await.unwrap();
    let mut job = reserve_one(&client).await;

    let err = client
        .execute(&mut job, &NoMounts, &NoBehaviours)
        .await
        .unwrap_err();

    assert!(err.to_string().contains(FAIL_REASON_CWD));
    assert_eq!(job.state, JobState::Buried);
    let methods = server.state.methods_seen();
    assert!(!methods.contains(&Method::Started));
    assert_eq!(methods.last(), Some(&Method::Bury));
}

#[tokio::test]
#[serial]
async fn unreserved_job_is_rejected() {
    let cwd = tempfile::tempdir().unwrap();
    let server = FakeServer::start(None, false).await;
    let client = Client::connect(server.config(), test_log()).await.unwrap();
    let mut job = test_job("true", cwd.path());

    let err = client
        .execute(&mut job, &NoMounts, &NoBehaviours)
        .await
        .unwrap_err();
    assert!(err.to_string().contains(ERR_MUST_RESERVE));
}

#[tokio::test]
#[serial]
async fn server_requested_kill_buries_the_job() {
    let cwd = tempfile::tempdir().unwrap();
    let server = FakeServer::start(Some(test_job("sleep 30", cwd.path())), true).await;
    let mut config = server.config();
    config.touch_interval = Duration::from_millis(200);
    let client = Client::connect(config, test_log()).await.unwrap();
    let mut job = reserve_one(&client).await;

    client
        .execute(&mut job, &NoMounts, &NoBehaviours)
        .await
        .unwrap_err();

    assert_eq!(job.fail_reason, FAIL_REASON_KILLED);
    assert_eq!(job.state, JobState::Buried);
    assert_eq!(job.exitcode, 255);
    assert_eq!(server.state.methods_seen().last(), Some(&Method::Bury));
}

#[tokio::test]
#[serial]
async fn signal_after_time_overrun_is_a_time_failure() {
    let cwd = tempfile::tempdir().unwrap();
    let mut seed = test_job("sleep 30", cwd.path());
    seed.requirements.time = Duration::from_millis(100);
    let server = FakeServer::start(Some(seed), false).await;
    let mut config = server.config();
    config.touch_interval = Duration::from_millis(300);
    let client = Client::connect(config, test_log()).await.unwrap();
    let mut job = reserve_one(&client).await;

    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(1200)).await;
        unsafe {
            libc::kill(std::process::id() as libc::pid_t, libc::SIGUSR2);
        }
    });
    client
        .execute(&mut job, &NoMounts, &NoBehaviours)
        .await
        .unwrap_err();

    assert_eq!(job.fail_reason, FAIL_REASON_TIME);
    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(server.state.methods_seen().last(), Some(&Method::Release));
}

#[tokio::test]
#[serial]
async fn memory_overrun_kills_and_releases() {
    let cwd = tempfile::tempdir().unwrap();
    let mut seed = test_job("x=$(head -c 30000000 /dev/urandom); sleep 10", cwd.path());
    seed.requirements.ram = 3;
    let server = FakeServer::start(Some(seed), false).await;
    let client = Client::connect(server.config(), test_log()).await.unwrap();
    let mut job = reserve_one(&client).await;

    client
        .execute(&mut job, &NoMounts, &NoBehaviours)
        .await
        .unwrap_err();

    assert_eq!(job.fail_reason, FAIL_REASON_RAM);
    assert_eq!(job.state, JobState::Delayed);
    assert!(job.peak_ram > 3);
    // the next attempt will ask for more memory
    assert_eq!(job.requirements.ram, server.config().next_ram(3));
    assert_eq!(server.state.methods_seen().last(), Some(&Method::Release));
}

#[tokio::test]
#[serial]
async fn recorded_environment_and_tmpdir_reach_the_child() {
    let cwd = tempfile::tempdir().unwrap();
    let mut seed = test_job("echo \"$DROVER_EXEC_ENV $TMPDIR\"", cwd.path());
    seed.env_c = compress::compress_env(vec![
        "DROVER_EXEC_ENV=magicvalue".to_string(),
        "PATH=/usr/bin:/bin".to_string(),
    ])
    .await
    .unwrap();
    let server = FakeServer::start(Some(seed), false).await;
    let client = Client::connect(server.config(), test_log()).await.unwrap();
    let mut job = reserve_one(&client).await;

    client.execute(&mut job, &NoMounts, &NoBehaviours).await.unwrap();

    let stdout = compress::decompress(&job.stdout_c).await.unwrap();
    let stdout = String::from_utf8(stdout).unwrap();
    assert!(stdout.starts_with("magicvalue "));
    assert!(stdout.ends_with("/tmp"));
}

struct UploadFailsOnUnmount;

#[async_trait]
impl Mounter for UploadFailsOnUnmount {
    async fn mount(&self) -> Result<()> {
        Ok(())
    }

    async fn unmount(&self, _force: bool) -> (String, Result<()>) {
        (
            "3 files cached locally".to_string(),
            Err(anyhow!("failed to upload 3 files")),
        )
    }
}

#[tokio::test]
#[serial]
async fn upload_failure_downgrades_success_to_release() {
    let cwd = tempfile::tempdir().unwrap();
    let server = FakeServer::start(Some(test_job("true", cwd.path())), false).await;
    let client = Client::connect(server.config(), test_log()).await.unwrap();
    let mut job = reserve_one(&client).await;

    let err = client
        .execute(&mut job, &UploadFailsOnUnmount, &NoBehaviours)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("failed to upload"));
    assert_eq!(job.fail_reason, FAIL_REASON_UPLOAD);
    assert_eq!(job.exitcode, EXIT_CODE_UPLOAD_FAILED);
    assert_eq!(job.state, JobState::Delayed);
    let stderr = compress::decompress(&job.stderr_c).await.unwrap();
    assert!(String::from_utf8(stderr).unwrap().contains("Mount logs:"));
    assert_eq!(server.state.methods_seen().last(), Some(&Method::Release));
}

struct FailingBehaviours;

#[async_trait]
impl Behaviours for FailingBehaviours {
    async fn trigger(&self, _success: bool) -> Result<()> {
        Err(anyhow!("on_failure hook exploded"))
    }
}

#[tokio::test]
#[serial]
async fn behaviour_failure_is_composed_into_the_error() {
    let cwd = tempfile::tempdir().unwrap();
    let server = FakeServer::start(Some(test_job("exit 3", cwd.path())), false).await;
    let client = Client::connect(server.config(), test_log()).await.unwrap();
    let mut job = reserve_one(&client).await;

    let err = client
        .execute(&mut job, &NoMounts, &FailingBehaviours)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("exit code 3"));
    assert!(err.to_string().contains("on_failure hook exploded"));
    let stderr = compress::decompress(&job.stderr_c).await.unwrap();
    assert!(String::from_utf8(stderr)
        .unwrap()
        .contains("Behaviour problems:"));
}

#[tokio::test]
#[serial]
async fn first_reserve_is_flagged_exactly_once() {
    let cwd = tempfile::tempdir().unwrap();
    let server = FakeServer::start(Some(test_job("true", cwd.path())), false).await;
    let client = Client::connect(server.config(), test_log()).await.unwrap();

    client.reserve(Duration::from_secs(1)).await.unwrap();
    client.reserve(Duration::from_secs(1)).await.unwrap();

    let flags: Vec<bool> = server
        .state
        .seen
        .lock()
        .unwrap()
        .iter()
        .filter(|req| req.method == Method::Reserve)
        .map(|req| req.first_reserve)
        .collect();
    assert_eq!(flags, vec![true, false]);
}

#[tokio::test]
#[serial]
async fn touch_carries_the_kill_back_channel() {
    let cwd = tempfile::tempdir().unwrap();
    let server = FakeServer::start(Some(test_job("true", cwd.path())), true).await;
    let client = Client::connect(server.config(), test_log()).await.unwrap();
    let job = reserve_one(&client).await;
    assert!(client.touch(&job).await.unwrap());
}

#[tokio::test]
async fn connecting_to_nothing_names_the_problem() {
    let mut config = ClientConfig::new("127.0.0.1:1", "localhost", vec![]);
    config.timeout = Duration::from_secs(2);
    let err = Client::connect(config, test_log()).await.unwrap_err();
    assert!(err.to_string().contains("no server found"));
}
