//! The connection to the server and the operations it supports. One request
//! is ever outstanding per client; the socket assumes matched request/reply
//! pairs.

use crate::config::ClientConfig;
use anyhow::{anyhow, Context as _, Result};
use drover_base::{
    compress, Job, JobEndState, JobEssence, JobState, Method, Request, Response,
};
use drover_util::{host, net};
use slog::{debug, info, Logger};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt as _;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use uuid::Uuid;

/// Returned when an operation needs the job to be reserved by this client.
pub const ERR_MUST_RESERVE: &str = "this client has not reserved that job";

/// An error string the server sent back for a request.
#[derive(Debug)]
pub struct RpcError {
    pub method: Method,
    pub job_key: Option<String>,
    pub message: String,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.job_key {
            Some(key) => write!(f, "{}({}): {}", self.method, key, self.message),
            None => write!(f, "{}: {}", self.method, self.message),
        }
    }
}

impl std::error::Error for RpcError {}

struct Connection {
    stream: TlsStream<TcpStream>,
}

/// A connected client. Identity is a fresh UUID per connection; after
/// [`Client::disconnect`] the value is consumed and cannot be reused.
pub struct Client {
    conn: tokio::sync::Mutex<Connection>,
    /// Serializes touch against the archive/release/bury sequences that
    /// rewrite the job's end state.
    end_state: tokio::sync::Mutex<()>,
    id: Uuid,
    config: ClientConfig,
    has_reserved: AtomicBool,
    pub(crate) log: Logger,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("has_reserved", &self.has_reserved)
            .finish()
    }
}

impl Client {
    /// Dial the server, complete the TLS handshake, and verify reachability
    /// with a ping. A refused connection and a rejected ping produce
    /// distinguishable errors.
    pub async fn connect(config: ClientConfig, log: Logger) -> Result<Client> {
        let stream = tokio::time::timeout(
            config.timeout,
            net::connect_tls(
                &config.addr,
                &config.server_name,
                config.ca_file.as_deref(),
                &log,
            ),
        )
        .await
        .map_err(|_| anyhow!("timed out connecting to {}", config.addr))?
        .map_err(|err| {
            if is_io_error_kind(&err, &[std::io::ErrorKind::ConnectionRefused]) {
                anyhow!("no server found at {}", config.addr)
            } else {
                err.context(format!("could not connect to {}", config.addr))
            }
        })?;

        let client = Client {
            conn: tokio::sync::Mutex::new(Connection { stream }),
            end_state: tokio::sync::Mutex::new(()),
            id: Uuid::new_v4(),
            config,
            has_reserved: AtomicBool::new(false),
            log,
        };
        if let Err(err) = client.ping().await {
            return Err(if err.downcast_ref::<RpcError>().is_some() {
                err.context("server rejected us: permission denied")
            } else {
                err.context("server did not respond to ping")
            });
        }
        info!(client.log, "connected to server"; "addr" => %client.config.addr, "client" => %client.id);
        Ok(client)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Close the connection. Dropping without disconnecting leaves the
    /// socket to be cleaned up by the runtime.
    pub async fn disconnect(self) -> Result<()> {
        let mut conn = self.conn.into_inner();
        conn.stream.shutdown().await?;
        Ok(())
    }

    /// Send one request and await its reply, holding the request lock for
    /// the whole exchange. The receive deadline is the configured timeout,
    /// extended by the request's own server-side wait when it has one.
    async fn request(&self, mut req: Request) -> Result<Response> {
        let mut conn = self.conn.lock().await;
        req.client_id = self.id;
        req.token = self.config.token.clone();
        let method = req.method;
        let job_key = req
            .job
            .as_ref()
            .map(|job| job.key.clone())
            .or_else(|| {
                req.essences
                    .as_ref()
                    .and_then(|essences| essences.first().map(|e| e.key.clone()))
            });
        let deadline = match req.timeout {
            Some(wait) if wait.is_zero() => None,
            Some(wait) => Some(self.config.timeout + wait),
            None => Some(self.config.timeout),
        };
        net::write_message(&mut conn.stream, &req).await?;
        let read = net::read_message::<_, Response>(&mut conn.stream);
        let resp = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, read)
                .await
                .map_err(|_| anyhow!("timed out waiting for the server's {method} reply"))??,
            None => read.await?,
        };
        if resp.err.is_empty() {
            Ok(resp)
        } else {
            Err(RpcError {
                method,
                job_key,
                message: resp.err,
            }
            .into())
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.request(Request::new(Method::Ping)).await.map(|_| ())
    }

    /// Submit jobs along with the environment they should run in. Returns
    /// how many were newly added and how many already existed.
    pub async fn add(&self, jobs: Vec<Job>, environ: Vec<String>) -> Result<(usize, usize)> {
        let mut req = Request::new(Method::Add);
        req.env = Some(compress::compress_env(environ).await?);
        req.jobs = Some(jobs);
        let resp = self.request(req).await?;
        Ok((resp.added, resp.existed))
    }

    /// Claim the next ready job, waiting up to `timeout` for one to appear.
    /// A zero timeout waits indefinitely. `Ok(None)` means the wait timed
    /// out with nothing to run.
    pub async fn reserve(&self, timeout: Duration) -> Result<Option<Job>> {
        self.reserve_inner(timeout, None).await
    }

    /// As [`Client::reserve`], but only jobs in the given scheduler group.
    pub async fn reserve_scheduled(&self, timeout: Duration, group: &str) -> Result<Option<Job>> {
        self.reserve_inner(timeout, Some(group.to_string())).await
    }

    async fn reserve_inner(&self, timeout: Duration, group: Option<String>) -> Result<Option<Job>> {
        let mut req = Request::new(Method::Reserve);
        req.timeout = Some(timeout);
        req.sched_group = group;
        req.first_reserve = !self.has_reserved.load(Ordering::Relaxed);
        let resp = self.request(req).await?;
        self.has_reserved.store(true, Ordering::Relaxed);
        if let Some(job) = &resp.job {
            debug!(self.log, "reserved job"; "key" => %job.key, "cmd" => %job.cmd);
        }
        Ok(resp.job)
    }

    /// The keep-alive. Extends the server-side time-to-run and returns true
    /// if the server wants the job's process killed.
    pub async fn touch(&self, job: &Job) -> Result<bool> {
        self.touch_essence(&job.essence()).await
    }

    pub(crate) async fn touch_essence(&self, essence: &JobEssence) -> Result<bool> {
        let _guard = self.end_state.lock().await;
        let mut req = Request::new(Method::Touch);
        req.essences = Some(vec![essence.clone()]);
        let resp = self.request(req).await?;
        Ok(resp.kill_called)
    }

    /// Record that the job's process is running and notify the server.
    pub async fn started(&self, job: &mut Job, pid: u32) -> Result<()> {
        job.host = host::hostname();
        job.host_ip = host::current_ip("")
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "localhost".to_string());
        job.pid = Some(pid);
        job.attempts += 1;
        job.start_time = Some(SystemTime::now());
        let mut req = Request::new(Method::Started);
        req.job = Some(job.clone());
        self.request(req).await.map(|_| ())
    }

    /// Report success. The job moves to the permanent completed store.
    pub async fn archive(&self, job: &mut Job, jes: &JobEndState) -> Result<()> {
        let _guard = self.end_state.lock().await;
        apply_end_state(job, jes).await?;
        let mut req = Request::new(Method::Archive);
        req.end_state = Some(wire_end_state(jes));
        req.job = Some(job.clone());
        self.request(req).await?;
        job.state = JobState::Complete;
        Ok(())
    }

    /// Report a transient failure. The server re-queues the job after the
    /// configured delay, or buries it once its retry budget is spent.
    pub async fn release(
        &self,
        job: &mut Job,
        jes: Option<&JobEndState>,
        reason: &str,
    ) -> Result<()> {
        let _guard = self.end_state.lock().await;
        if let Some(jes) = jes {
            apply_end_state(job, jes).await?;
        }
        job.fail_reason = reason.to_string();
        let mut req = Request::new(Method::Release);
        req.end_state = jes.map(wire_end_state);
        req.delay = Some(self.config.release_delay);
        req.job = Some(job.clone());
        self.request(req).await?;
        apply_release_transition(job);
        Ok(())
    }

    /// Report a permanent failure. The job stays buried until kicked.
    /// `stderr_override` replaces the captured stderr with the given text.
    pub async fn bury(
        &self,
        job: &mut Job,
        jes: Option<&JobEndState>,
        reason: &str,
        stderr_override: Option<&str>,
    ) -> Result<()> {
        let _guard = self.end_state.lock().await;
        if let Some(jes) = jes {
            apply_end_state(job, jes).await?;
        }
        job.fail_reason = reason.to_string();
        if let Some(text) = stderr_override {
            job.stderr_c = compress::compress(text.as_bytes()).await?;
        }
        let mut req = Request::new(Method::Bury);
        req.end_state = jes.map(wire_end_state);
        req.job = Some(job.clone());
        self.request(req).await?;
        job.state = JobState::Buried;
        Ok(())
    }

    /// Make buried jobs ready again. Returns how many were affected.
    pub async fn kick(&self, essences: Vec<JobEssence>) -> Result<usize> {
        self.batch(Method::Kick, essences).await
    }

    /// Remove buried or incomplete jobs outright.
    pub async fn delete(&self, essences: Vec<JobEssence>) -> Result<usize> {
        self.batch(Method::Delete, essences).await
    }

    /// Ask the server to have the processes of running jobs killed.
    pub async fn kill(&self, essences: Vec<JobEssence>) -> Result<usize> {
        self.batch(Method::Kill, essences).await
    }

    async fn batch(&self, method: Method, essences: Vec<JobEssence>) -> Result<usize> {
        let mut req = Request::new(method);
        req.essences = Some(essences);
        let resp = self.request(req).await?;
        Ok(resp.existed)
    }

    pub async fn get_by_essence(
        &self,
        essence: JobEssence,
        get_std: bool,
        get_env: bool,
    ) -> Result<Option<Job>> {
        let mut req = Request::new(Method::GetByEssence);
        req.essences = Some(vec![essence]);
        req.get_std = get_std;
        req.get_env = get_env;
        let resp = self.request(req).await?;
        Ok(resp.job)
    }

    pub async fn get_by_rep_group(
        &self,
        rep_group: &str,
        limit: usize,
        state: Option<JobState>,
        get_std: bool,
        get_env: bool,
    ) -> Result<Vec<Job>> {
        let mut req = Request::new(Method::GetByRepGroup);
        req.rep_group = Some(rep_group.to_string());
        req.limit = Some(limit);
        req.state = state;
        req.get_std = get_std;
        req.get_env = get_env;
        let resp = self.request(req).await?;
        Ok(resp.jobs)
    }

    pub async fn get_incomplete(
        &self,
        limit: usize,
        get_std: bool,
        get_env: bool,
    ) -> Result<Vec<Job>> {
        let mut req = Request::new(Method::GetIncomplete);
        req.limit = Some(limit);
        req.get_std = get_std;
        req.get_env = get_env;
        req.ignore_complete = true;
        let resp = self.request(req).await?;
        Ok(resp.jobs)
    }

    /// Compress and ship a local file; returns the server-side storage path.
    pub async fn upload_file(&self, path: &Path) -> Result<String> {
        let mut req = Request::new(Method::UploadFile);
        req.file = Some(compress::compress_file(path).await?);
        req.path = Some(path.to_string_lossy().into_owned());
        let resp = self.request(req).await?;
        resp.path
            .ok_or_else(|| anyhow!("server did not return a storage path"))
    }

    /// Fetch a backup of the server's database and write it to `path`,
    /// via `path.tmp` and an atomic rename.
    pub async fn backup_db(&self, path: &Path) -> Result<()> {
        let resp = self.request(Request::new(Method::BackupDb)).await?;
        let db = resp
            .db
            .ok_or_else(|| anyhow!("server did not return a database backup"))?;
        let tmp = PathBuf::from(format!("{}.tmp", path.display()));
        tokio::fs::write(&tmp, &db)
            .await
            .with_context(|| format!("could not write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("could not rename {} into place", tmp.display()))?;
        Ok(())
    }

    /// Stop the server handing out new jobs. Returns the number of jobs
    /// still running and an estimate of how long they need.
    pub async fn drain_server(&self) -> Result<(u64, Duration)> {
        let resp = self.request(Request::new(Method::DrainServer)).await?;
        let stats = resp
            .sstats
            .ok_or_else(|| anyhow!("server did not return drain statistics"))?;
        Ok((stats.running, stats.eta))
    }

    /// Ask the server to exit. The connection dropping before a reply
    /// arrives counts as success.
    pub async fn shutdown_server(&self) -> Result<()> {
        match self.request(Request::new(Method::ShutdownServer)).await {
            Ok(_) => Ok(()),
            Err(err)
                if is_io_error_kind(
                    &err,
                    &[
                        std::io::ErrorKind::UnexpectedEof,
                        std::io::ErrorKind::ConnectionReset,
                        std::io::ErrorKind::BrokenPipe,
                    ],
                ) =>
            {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

fn is_io_error_kind(err: &anyhow::Error, kinds: &[std::io::ErrorKind]) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| kinds.contains(&io.kind()))
    })
}

/// Fold a finished run's details into the job record, compressing the
/// captured output into the blob fields the server stores.
pub(crate) async fn apply_end_state(job: &mut Job, jes: &JobEndState) -> Result<()> {
    job.exited = jes.exited;
    job.exitcode = jes.exitcode;
    job.peak_ram = jes.peak_ram;
    job.cpu_time = jes.cpu_time;
    if let Some(cwd) = &jes.cwd {
        job.actual_cwd = Some(cwd.clone());
    }
    if !jes.stdout.is_empty() {
        job.stdout_c = compress::compress(&jes.stdout).await?;
    }
    if !jes.stderr.is_empty() {
        job.stderr_c = compress::compress(&jes.stderr).await?;
    }
    Ok(())
}

/// The end state as sent on the wire: output rides compressed in the job
/// record, not raw in the envelope.
fn wire_end_state(jes: &JobEndState) -> JobEndState {
    let mut wire = jes.clone();
    wire.stdout.clear();
    wire.stderr.clear();
    wire
}

/// Local state change after a successful release: a ran-and-failed job
/// burns one unit of retry budget, and an exhausted budget means the server
/// buried it.
fn apply_release_transition(job: &mut Job) {
    if job.exited && job.exitcode != 0 {
        job.until_buried = job.until_buried.saturating_sub(1);
    }
    job.state = if job.until_buried == 0 {
        JobState::Buried
    } else {
        JobState::Delayed
    };
}
