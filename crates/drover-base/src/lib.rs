//! Core types for the drover job queue: the job record, the request/reply
//! envelopes that travel between a client and the server, and the compressed
//! blob formats used for environments, uploaded files, and captured output.

pub mod compress;
pub mod proto;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Fail reasons surfaced to the server and to users. One constant per
/// condition; the server stores these verbatim.
pub const FAIL_REASON_ENV: &str = "failed to get environment variables";
pub const FAIL_REASON_CWD: &str = "working directory does not exist";
pub const FAIL_REASON_START: &str = "command failed to start";
pub const FAIL_REASON_CPERM: &str = "command permission problem";
pub const FAIL_REASON_CFOUND: &str = "command not found";
pub const FAIL_REASON_CEXIT: &str = "command invalid exit code";
pub const FAIL_REASON_EXIT: &str = "command exited non-zero";
pub const FAIL_REASON_RAM: &str = "command used too much RAM";
pub const FAIL_REASON_TIME: &str = "command used too much time";
pub const FAIL_REASON_ABNORMAL: &str = "command failed to complete normally";
pub const FAIL_REASON_LOST: &str = "lost contact with the runner";
pub const FAIL_REASON_SIGNAL: &str = "runner received a signal to stop";
pub const FAIL_REASON_RESOURCE: &str = "resource requirements cannot be met";
pub const FAIL_REASON_MOUNT: &str = "mounting of remote file system(s) failed";
pub const FAIL_REASON_UPLOAD: &str = "failed to upload files to remote file system";
pub const FAIL_REASON_KILLED: &str = "killed by user request";

/// Reported in place of exit code 0 when the command succeeded but its
/// output could not be uploaded, so the failure survives in the job record.
/// The server treats any negative exit code as a non-runnable success.
pub const EXIT_CODE_UPLOAD_FAILED: i32 = -2;

/// Lifecycle states of a job as observed by clients.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    #[default]
    New,
    Delayed,
    Ready,
    Reserved,
    Running,
    Lost,
    Buried,
    Complete,
    Deleted,
}

/// Resources a job claims to need. RAM and disk are in MiB.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Requirements {
    pub ram: u64,
    pub time: Duration,
    pub cores: f64,
    pub disk: u64,
}

/// A unit of work. Submitters populate the command-side fields; the server
/// assigns `key` and owns `state`; the runner that reserves the job fills in
/// the host/attempt bookkeeping and the end-state fields.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Job {
    pub key: String,
    pub cmd: String,
    pub cwd: String,
    /// When false, the job runs in a unique directory created under `cwd`
    /// instead of `cwd` itself.
    pub cwd_matters: bool,
    pub change_home: bool,
    pub rep_group: String,
    pub sched_group: String,
    pub requirements: Requirements,
    pub retries: u8,
    /// Remaining releases before the server buries the job. Decremented by
    /// the reserving client after a ran-and-failed release.
    pub until_buried: u8,
    pub attempts: u32,
    pub reserved_by: Option<Uuid>,
    pub host: String,
    pub host_ip: String,
    pub pid: Option<u32>,
    pub start_time: Option<SystemTime>,
    pub actual_cwd: Option<String>,
    pub exited: bool,
    pub exitcode: i32,
    /// Peak proportional-set-size in MiB, inclusive of runner overhead.
    pub peak_ram: u64,
    pub cpu_time: Duration,
    pub stdout_c: Vec<u8>,
    pub stderr_c: Vec<u8>,
    pub env_c: Vec<u8>,
    pub fail_reason: String,
    pub state: JobState,
}

impl Job {
    pub fn new(cmd: impl Into<String>, cwd: impl Into<String>) -> Self {
        Job {
            cmd: cmd.into(),
            cwd: cwd.into(),
            requirements: Requirements {
                ram: 1024,
                time: Duration::from_secs(3600),
                cores: 1.0,
                disk: 0,
            },
            retries: 3,
            until_buried: 3,
            ..Default::default()
        }
    }

    /// The environment the job's command should run with: the one recorded at
    /// submission time, or this process's environment if none was recorded.
    pub async fn env(&self) -> anyhow::Result<Vec<String>> {
        if self.env_c.is_empty() {
            return Ok(std::env::vars().map(|(k, v)| format!("{k}={v}")).collect());
        }
        compress::decompress_env(&self.env_c).await
    }

    pub fn essence(&self) -> JobEssence {
        JobEssence {
            key: self.key.clone(),
            cmd: self.cmd.clone(),
            cwd: self.cwd.clone(),
        }
    }
}

/// Compact identity for bulk operations (kick, delete, kill, get).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct JobEssence {
    pub key: String,
    pub cmd: String,
    pub cwd: String,
}

/// Final disposition details sent alongside archive, release, and bury.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct JobEndState {
    pub cwd: Option<String>,
    pub exitcode: i32,
    pub peak_ram: u64,
    pub cpu_time: Duration,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exited: bool,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ServerInfo {
    pub addr: String,
    pub host: String,
    pub port: u16,
    pub pid: u32,
    pub deployment: String,
    pub mode: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ServerStats {
    pub delayed: u64,
    pub ready: u64,
    pub running: u64,
    pub buried: u64,
    pub complete: u64,
    pub uptime: Duration,
    /// Estimated time until running jobs complete; meaningful in drain
    /// responses.
    pub eta: Duration,
}

/// Every operation a client can ask of the server.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Method {
    Ping,
    Add,
    Reserve,
    Touch,
    Started,
    Archive,
    Release,
    Bury,
    Kick,
    Delete,
    Kill,
    GetByEssence,
    GetByRepGroup,
    GetIncomplete,
    UploadFile,
    BackupDb,
    DrainServer,
    ShutdownServer,
}

/// The uniform request envelope. The transport injects `client_id` and
/// `token` just before encoding; everything else is per-method.
#[derive(Debug, Deserialize, Serialize)]
pub struct Request {
    pub client_id: Uuid,
    pub token: Vec<u8>,
    pub method: Method,
    pub job: Option<Job>,
    pub jobs: Option<Vec<Job>>,
    pub essences: Option<Vec<JobEssence>>,
    pub end_state: Option<JobEndState>,
    pub env: Option<Vec<u8>>,
    pub file: Option<Vec<u8>>,
    pub path: Option<String>,
    pub timeout: Option<Duration>,
    pub delay: Option<Duration>,
    pub sched_group: Option<String>,
    pub rep_group: Option<String>,
    pub state: Option<JobState>,
    pub limit: Option<usize>,
    pub get_env: bool,
    pub get_std: bool,
    pub ignore_complete: bool,
    pub first_reserve: bool,
}

impl Request {
    pub fn new(method: Method) -> Self {
        Request {
            client_id: Uuid::nil(),
            token: Vec::new(),
            method,
            job: None,
            jobs: None,
            essences: None,
            end_state: None,
            env: None,
            file: None,
            path: None,
            timeout: None,
            delay: None,
            sched_group: None,
            rep_group: None,
            state: None,
            limit: None,
            get_env: false,
            get_std: false,
            ignore_complete: false,
            first_reserve: false,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.method)
    }
}

/// The uniform reply envelope. A non-empty `err` means the server rejected
/// the request; the other fields are then meaningless.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Response {
    pub job: Option<Job>,
    pub jobs: Vec<Job>,
    pub sinfo: Option<ServerInfo>,
    pub sstats: Option<ServerStats>,
    pub db: Option<Vec<u8>>,
    pub path: Option<String>,
    pub added: usize,
    pub existed: usize,
    pub kill_called: bool,
    pub err: String,
}
