//! The execution supervisor: takes a job this client reserved and drives it
//! through mount, start, supervision, behaviours, unmount, and the final
//! retry-safe report of its fate.

use crate::client::{Client, ERR_MUST_RESERVE};
use crate::mount::{Behaviours, Mounter};
use anyhow::{anyhow, bail, Result};
use drover_base::{
    Job, JobEndState, FAIL_REASON_ABNORMAL, FAIL_REASON_CEXIT, FAIL_REASON_CFOUND,
    FAIL_REASON_CPERM, FAIL_REASON_CWD, FAIL_REASON_ENV, FAIL_REASON_EXIT, FAIL_REASON_KILLED,
    FAIL_REASON_MOUNT, FAIL_REASON_RAM, FAIL_REASON_SIGNAL, FAIL_REASON_START, FAIL_REASON_TIME,
    FAIL_REASON_UPLOAD, EXIT_CODE_UPLOAD_FAILED,
};
use drover_util::fs::{mk_hashed_dir, RemoveOnDrop};
use drover_util::{host, stdio};
use slog::{debug, info, warn};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

const FINAL_REPORT_ATTEMPTS: u32 = 300;
const FINAL_REPORT_BACKOFF_STEP: Duration = Duration::from_millis(100);
const MEMORY_TICK: Duration = Duration::from_secs(1);
const MOUNT_RETRY_DELAY: Duration = Duration::from_secs(5);
/// fusermount is known to fail spuriously with this text; one delayed retry
/// is worthwhile.
const TRANSIENT_MOUNT_ERROR: &str = "fusermount exited with code 256";

/// Abnormal termination (no exit status from the child) is surfaced as this
/// exit code.
const EXIT_CODE_ABNORMAL: i32 = 255;

/// What happened to the child, beyond its exit status. Set by the
/// supervision loop, read once by the classifier.
#[derive(Clone, Copy, Debug, Default)]
struct Latches {
    kill_called: bool,
    ranout_mem: bool,
    ranout_time: bool,
    signalled: bool,
}

impl Latches {
    /// True once the supervisor has killed the child for any reason.
    fn killed(&self) -> bool {
        self.kill_called || self.ranout_mem || self.signalled
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Disposition {
    Archive,
    Release,
    Bury,
}

/// The outcome precedence table. First match wins.
fn classify(exited: bool, exitcode: i32, latches: Latches) -> (Disposition, Option<&'static str>) {
    if exited && exitcode == 126 {
        (Disposition::Bury, Some(FAIL_REASON_CPERM))
    } else if exited && exitcode == 127 {
        (Disposition::Bury, Some(FAIL_REASON_CFOUND))
    } else if exited && exitcode == 128 {
        (Disposition::Bury, Some(FAIL_REASON_CEXIT))
    } else if latches.ranout_mem {
        (Disposition::Release, Some(FAIL_REASON_RAM))
    } else if latches.signalled && latches.ranout_time {
        (Disposition::Release, Some(FAIL_REASON_TIME))
    } else if latches.signalled {
        (Disposition::Release, Some(FAIL_REASON_SIGNAL))
    } else if latches.kill_called {
        (Disposition::Bury, Some(FAIL_REASON_KILLED))
    } else if exited && exitcode != 0 {
        (Disposition::Release, Some(FAIL_REASON_EXIT))
    } else if !exited {
        (Disposition::Release, Some(FAIL_REASON_ABNORMAL))
    } else {
        (Disposition::Archive, None)
    }
}

/// Quote a command for the shell, forcing pipeline failures to surface when
/// the command is visibly a pipeline. The match is on a literal ` | `;
/// spaces matter.
fn shell_command(cmd: &str) -> String {
    if cmd.contains(" | ") {
        format!("set -o pipefail; {cmd}")
    } else {
        cmd.to_string()
    }
}

fn trim_trailing_whitespace(mut bytes: Vec<u8>) -> Vec<u8> {
    while bytes.last().is_some_and(u8::is_ascii_whitespace) {
        bytes.pop();
    }
    bytes
}

/// Append a cleanup failure to the primary error text without shadowing it.
fn also_failed(text: &mut String, what: &str, err: &anyhow::Error) {
    text.push_str(&format!(" (and {what} also failed: {err})"));
}

impl Client {
    /// Run a job this client has reserved, supervise it to completion, and
    /// report its fate to the server. Blocks until the report lands or is
    /// given up on.
    pub async fn execute<MounterT, BehavioursT>(
        &self,
        job: &mut Job,
        mounter: &MounterT,
        behaviours: &BehavioursT,
    ) -> Result<()>
    where
        MounterT: Mounter + ?Sized,
        BehavioursT: Behaviours + ?Sized,
    {
        if job.reserved_by != Some(self.id()) {
            bail!(ERR_MUST_RESERVE);
        }
        let essence = job.essence();
        info!(self.log, "executing job"; "key" => %job.key, "cmd" => %job.cmd);

        let cmd_line = shell_command(&job.cmd);

        match tokio::fs::metadata(&job.cwd).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(self
                    .bury_failed_setup(job, FAIL_REASON_CWD, None)
                    .await);
            }
        }

        // A unique working directory under cwd, unless the job needs to run
        // in cwd itself. The sibling tmp directory goes away on every exit
        // path, panics included.
        let mut tmp_guard: Option<RemoveOnDrop> = None;
        let actual_cwd = if job.cwd_matters {
            job.cwd.clone()
        } else {
            match mk_hashed_dir(&job.cwd, &job.key) {
                Ok((cwd, tmp)) => {
                    tmp_guard = Some(RemoveOnDrop(tmp));
                    let cwd = cwd.to_string_lossy().into_owned();
                    job.actual_cwd = Some(cwd.clone());
                    cwd
                }
                Err(_) => {
                    return Err(self
                        .bury_failed_setup(job, FAIL_REASON_CWD, None)
                        .await);
                }
            }
        };

        if let Err(err) = self.mount_with_retry(mounter).await {
            return Err(self
                .bury_failed_setup(job, FAIL_REASON_MOUNT, Some(&err))
                .await);
        }

        let environ = match job.env().await {
            Ok(environ) => {
                let mut overrides = Vec::new();
                if let Some(guard) = &tmp_guard {
                    overrides.push(format!("TMPDIR={}", guard.0.display()));
                }
                if job.change_home {
                    overrides.push(format!("HOME={actual_cwd}"));
                }
                host::env_override(&environ, &overrides)
            }
            Err(err) => {
                let mut text = format!("{FAIL_REASON_ENV}: {err}");
                if let Err(err) = self.bury(job, None, FAIL_REASON_ENV, None).await {
                    also_failed(&mut text, "burying the job", &err);
                }
                let (_, unmounted) = mounter.unmount(true).await;
                if let Err(err) = unmounted {
                    also_failed(&mut text, "force-unmounting", &err);
                }
                return Err(anyhow!(text));
            }
        };

        // Abort signals, subscribed for the duration of this call only. All
        // five mean the same thing: stop the child and give the job back.
        let mut sig_int = signal(SignalKind::interrupt())?;
        let mut sig_term = signal(SignalKind::terminate())?;
        let mut sig_quit = signal(SignalKind::quit())?;
        let mut sig_usr1 = signal(SignalKind::user_defined1())?;
        let mut sig_usr2 = signal(SignalKind::user_defined2())?;

        let start = Instant::now();
        let end_t = start + job.requirements.time;
        let cpu_before = host::children_cpu_time();

        let mut command = Command::new(&self.config().shell);
        command
            .arg("-c")
            .arg(&cmd_line)
            .current_dir(&actual_cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env_clear();
        for var in &environ {
            if let Some((name, value)) = var.split_once('=') {
                command.env(name, value);
            }
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let mut text = format!("{FAIL_REASON_START}: {err}");
                if let Err(err) = self.release(job, None, FAIL_REASON_START).await {
                    also_failed(&mut text, "releasing the job", &err);
                }
                let (_, unmounted) = mounter.unmount(false).await;
                if let Err(err) = unmounted {
                    also_failed(&mut text, "unmounting", &err);
                }
                return Err(anyhow!(text));
            }
        };
        let pid = child.id().expect("freshly spawned child has a pid");

        let (stdout_cap, stdout_task) = stdio::capture(child.stdout.take().expect("piped"));
        let (stderr_cap, stderr_task) = stdio::capture(child.stderr.take().expect("piped"));

        if let Err(err) = self.started(job, pid).await {
            // without a keep-alive the server will auto-release the job, so
            // don't run it
            host::kill_process(pid);
            let _ = child.wait().await;
            let mut text = format!("could not tell the server the job started: {err}");
            if let Err(err) = behaviours.trigger(false).await {
                also_failed(&mut text, "failure behaviours", &err);
            }
            let (_, unmounted) = mounter.unmount(false).await;
            if let Err(err) = unmounted {
                also_failed(&mut text, "unmounting", &err);
            }
            return Err(anyhow!(text));
        }

        let mut latches = Latches::default();
        let mut peak_mem: u64 = 0;
        let mut touch_tick = interval_at(start + self.config().touch_interval, self.config().touch_interval);
        touch_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut mem_tick = interval_at(start + MEMORY_TICK, MEMORY_TICK);
        mem_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let wait_result = loop {
            tokio::select! {
                res = child.wait() => break res,
                _ = touch_tick.tick(), if !latches.killed() => {
                    if Instant::now() > end_t {
                        // overrun alone never kills; it only colors a later
                        // abort
                        latches.ranout_time = true;
                    }
                    match self.touch_essence(&essence).await {
                        Ok(true) => {
                            info!(self.log, "server requested the job be killed"; "key" => %essence.key);
                            latches.kill_called = true;
                            host::kill_process(pid);
                        }
                        Ok(false) => {}
                        Err(err) => {
                            debug!(self.log, "touch failed during supervision"; "error" => %err);
                        }
                    }
                }
                _ = mem_tick.tick(), if !latches.killed() => {
                    if let Ok(mib) = host::current_memory(pid) {
                        if mib > peak_mem {
                            peak_mem = mib;
                        }
                    }
                    if peak_mem > job.requirements.ram {
                        info!(self.log, "job exceeded its memory reservation";
                              "key" => %essence.key, "peak_mib" => peak_mem, "limit_mib" => job.requirements.ram);
                        latches.ranout_mem = true;
                        host::kill_process(pid);
                    }
                }
                _ = sig_int.recv(), if !latches.killed() => {
                    latches.signalled = true;
                    host::kill_process(pid);
                }
                _ = sig_term.recv(), if !latches.killed() => {
                    latches.signalled = true;
                    host::kill_process(pid);
                }
                _ = sig_quit.recv(), if !latches.killed() => {
                    latches.signalled = true;
                    host::kill_process(pid);
                }
                _ = sig_usr1.recv(), if !latches.killed() => {
                    latches.signalled = true;
                    host::kill_process(pid);
                }
                _ = sig_usr2.recv(), if !latches.killed() => {
                    latches.signalled = true;
                    host::kill_process(pid);
                }
            }
        };

        // On a kill, grandchildren may still hold the pipes open; stop
        // reading rather than wait for them.
        if latches.killed() {
            stdout_task.abort();
            stderr_task.abort();
        }
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        let (exited, mut exitcode) = match &wait_result {
            Ok(status) => match status.code() {
                Some(code) => (true, code),
                None => (true, EXIT_CODE_ABNORMAL),
            },
            Err(err) => {
                warn!(self.log, "could not wait on the job's process"; "error" => %err);
                (false, EXIT_CODE_ABNORMAL)
            }
        };

        // The child may have exited before the first memory tick; fall back
        // to what the kernel accounted for it.
        if peak_mem == 0 {
            peak_mem = host::children_max_rss_mib();
        }
        // The outer scheduler places runners by combined footprint, so our
        // own memory counts too.
        peak_mem += host::self_memory();
        let cpu_time = host::children_cpu_time().saturating_sub(cpu_before);

        let (mut disposition, mut reason) = classify(exited, exitcode, latches);
        let mut myerr: Option<String> = reason.map(|reason| {
            if exited && exitcode != 0 {
                format!("command [{}] {} (exit code {})", job.cmd, reason, exitcode)
            } else {
                format!("command [{}] {}", job.cmd, reason)
            }
        });

        let mut stdout = trim_trailing_whitespace(stdout_cap.into_bytes());
        let mut stderr = trim_trailing_whitespace(stderr_cap.into_bytes());

        // Keep-alive through post-processing too, but once we have killed
        // the child a touch would wrongly re-assert a kill-able presence.
        let suppress_touch = latches.killed();
        let success = myerr.is_none();
        let post = async {
            let behaved = behaviours.trigger(success).await;
            let (unmount_logs, unmounted) = mounter.unmount(false).await;
            (behaved, unmount_logs, unmounted)
        };
        tokio::pin!(post);
        let mut post_tick = interval_at(
            Instant::now() + self.config().touch_interval,
            self.config().touch_interval,
        );
        post_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let (behaved, unmount_logs, unmounted) = loop {
            tokio::select! {
                out = &mut post => break out,
                _ = post_tick.tick(), if !suppress_touch => {
                    if let Err(err) = self.touch_essence(&essence).await {
                        debug!(self.log, "touch failed during post-processing"; "error" => %err);
                    }
                }
            }
        };

        if let Err(err) = behaved {
            if disposition != Disposition::Archive {
                stderr.extend_from_slice(format!("\n\nBehaviour problems:\n{err}").as_bytes());
            }
            match &mut myerr {
                Some(text) => also_failed(text, "post-run behaviours", &err),
                None => myerr = Some(format!("post-run behaviours failed: {err}")),
            }
        }

        if let Err(err) = unmounted {
            if err.to_string().contains("failed to upload") {
                if disposition == Disposition::Archive {
                    disposition = Disposition::Release;
                }
                if reason.is_none() {
                    reason = Some(FAIL_REASON_UPLOAD);
                }
                if exitcode == 0 {
                    exitcode = EXIT_CODE_UPLOAD_FAILED;
                }
            }
            match &mut myerr {
                Some(text) => also_failed(text, "unmounting", &err),
                None => myerr = Some(format!("unmounting failed: {err}")),
            }
        }
        if disposition != Disposition::Archive && !unmount_logs.is_empty() {
            stderr.extend_from_slice(format!("\n\nMount logs:\n{unmount_logs}").as_bytes());
        }

        if reason == Some(FAIL_REASON_RAM) {
            job.requirements.ram = self.config().next_ram(job.requirements.ram);
        }

        let jes = JobEndState {
            cwd: Some(actual_cwd),
            exitcode,
            peak_ram: peak_mem,
            cpu_time,
            stdout,
            stderr,
            exited,
        };
        let reason = reason.unwrap_or_default();

        let mut report_err = None;
        for attempt in 1..=FINAL_REPORT_ATTEMPTS {
            let result = match disposition {
                Disposition::Archive => self.archive(job, &jes).await,
                Disposition::Release => self.release(job, Some(&jes), reason).await,
                Disposition::Bury => self.bury(job, Some(&jes), reason, None).await,
            };
            match result {
                Ok(()) => {
                    report_err = None;
                    break;
                }
                Err(err) => {
                    report_err = Some(err);
                    sleep(FINAL_REPORT_BACKOFF_STEP * attempt).await;
                }
            }
        }
        if let Some(err) = report_err {
            let _ = behaviours.trigger(false).await;
            let text = format!(
                "failed to report the job's fate to the server after {FINAL_REPORT_ATTEMPTS} \
                 attempts ({err}); the job must be rerun"
            );
            match &mut myerr {
                Some(existing) => existing.push_str(&format!(" (and {text})")),
                None => myerr = Some(text),
            }
        }

        match myerr {
            Some(text) => Err(anyhow!(text)),
            None => Ok(()),
        }
    }

    async fn mount_with_retry<MounterT: Mounter + ?Sized>(
        &self,
        mounter: &MounterT,
    ) -> Result<()> {
        match mounter.mount().await {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains(TRANSIENT_MOUNT_ERROR) => {
                warn!(self.log, "mount failed with a known-transient error; retrying once";
                      "error" => %err, "delay_secs" => MOUNT_RETRY_DELAY.as_secs());
                sleep(MOUNT_RETRY_DELAY).await;
                let retried = mounter.mount().await;
                if let Err(err) = &retried {
                    warn!(self.log, "mount retry failed"; "error" => %err);
                }
                retried
            }
            Err(err) => Err(err),
        }
    }

    /// Bury a job that failed before its process could start, composing any
    /// bury failure into the returned error.
    async fn bury_failed_setup(
        &self,
        job: &mut Job,
        fail_reason: &str,
        cause: Option<&anyhow::Error>,
    ) -> anyhow::Error {
        let mut text = match cause {
            Some(cause) => format!("{fail_reason}: {cause}"),
            None => fail_reason.to_string(),
        };
        if let Err(err) = self.bury(job, None, fail_reason, None).await {
            also_failed(&mut text, "burying the job", &err);
        }
        anyhow!(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipefail_is_injected_for_visible_pipelines() {
        assert_eq!(
            shell_command("cat f | wc -l"),
            "set -o pipefail; cat f | wc -l"
        );
    }

    #[test]
    fn pipefail_needs_the_exact_spacing() {
        assert_eq!(shell_command("cat f |wc -l"), "cat f |wc -l");
        assert_eq!(shell_command("cat f|wc -l"), "cat f|wc -l");
        assert_eq!(shell_command("true"), "true");
    }

    #[test]
    fn trim_only_touches_the_tail() {
        assert_eq!(
            trim_trailing_whitespace(b"  out put \n\t ".to_vec()),
            b"  out put"
        );
        assert_eq!(trim_trailing_whitespace(b"\n\n".to_vec()), b"");
    }

    fn latched(f: impl FnOnce(&mut Latches)) -> Latches {
        let mut latches = Latches::default();
        f(&mut latches);
        latches
    }

    #[test]
    fn special_exit_codes_bury() {
        assert_eq!(
            classify(true, 126, Latches::default()),
            (Disposition::Bury, Some(FAIL_REASON_CPERM))
        );
        assert_eq!(
            classify(true, 127, Latches::default()),
            (Disposition::Bury, Some(FAIL_REASON_CFOUND))
        );
        assert_eq!(
            classify(true, 128, Latches::default()),
            (Disposition::Bury, Some(FAIL_REASON_CEXIT))
        );
    }

    #[test]
    fn clean_exit_archives() {
        assert_eq!(classify(true, 0, Latches::default()), (Disposition::Archive, None));
    }

    #[test]
    fn clean_exit_archives_even_after_time_overrun() {
        let latches = latched(|l| l.ranout_time = true);
        assert_eq!(classify(true, 0, latches), (Disposition::Archive, None));
    }

    #[test]
    fn memory_overrun_beats_signal() {
        let latches = latched(|l| {
            l.ranout_mem = true;
            l.signalled = true;
        });
        assert_eq!(
            classify(true, 255, latches),
            (Disposition::Release, Some(FAIL_REASON_RAM))
        );
    }

    #[test]
    fn signal_after_overrun_is_a_time_failure() {
        let latches = latched(|l| {
            l.signalled = true;
            l.ranout_time = true;
        });
        assert_eq!(
            classify(true, 255, latches),
            (Disposition::Release, Some(FAIL_REASON_TIME))
        );
    }

    #[test]
    fn signal_without_overrun_is_a_signal_failure() {
        let latches = latched(|l| l.signalled = true);
        assert_eq!(
            classify(true, 255, latches),
            (Disposition::Release, Some(FAIL_REASON_SIGNAL))
        );
    }

    #[test]
    fn server_requested_kill_buries() {
        let latches = latched(|l| l.kill_called = true);
        assert_eq!(
            classify(true, 255, latches),
            (Disposition::Bury, Some(FAIL_REASON_KILLED))
        );
    }

    #[test]
    fn plain_failure_releases() {
        assert_eq!(
            classify(true, 42, Latches::default()),
            (Disposition::Release, Some(FAIL_REASON_EXIT))
        );
    }

    #[test]
    fn no_exit_status_is_abnormal() {
        assert_eq!(
            classify(false, EXIT_CODE_ABNORMAL, Latches::default()),
            (Disposition::Release, Some(FAIL_REASON_ABNORMAL))
        );
    }

    #[test]
    fn command_not_found_beats_every_latch() {
        let latches = latched(|l| {
            l.ranout_mem = true;
            l.signalled = true;
            l.kill_called = true;
        });
        assert_eq!(
            classify(true, 127, latches),
            (Disposition::Bury, Some(FAIL_REASON_CFOUND))
        );
    }
}
