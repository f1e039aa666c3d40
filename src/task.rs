//! Task execution
//!
//! A task either runs locally (actions, checks, run-time conditionals) or
//! is rendered to one CAPI line, sent to its agent, and judged on the
//! response. Tasks inside an inactive conditional branch are skipped;
//! only `if`/`else`/`endif` still run there to keep the stack balanced.

use std::process::{Command, Stdio};
use std::time::Duration;

use crate::actions::{ActionCall, ActionEnv, ActionResult};
use crate::conditions::Condition;
use crate::engine::Session;
use crate::error::ScriptError;
use crate::processor::{self, Response};
use crate::scheduler::{Task, TaskKind, TaskStatus};
use crate::transport::MAX_RESPONSE;

const TRAFFIC_SEND: &str = "traffic_agent_send";
const TRAFFIC_RECEIVE_STOP: &str = "traffic_agent_receive_stop";
const ASSOCIATION_POLL: &str = "sta_is_connected";

/// Host part of `host:port`
fn host_of(address: &str) -> &str {
    address.rsplit_once(':').map(|(h, _)| h).unwrap_or(address)
}

/// One ICMP echo through the system `ping`. A missing binary counts as
/// reachable so hosts without it can still run.
fn reachable(host: &str) -> bool {
    let status = Command::new("ping")
        .args(["-c", "1", "-W", "2", host])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(s) => s.success(),
        Err(e) => {
            tracing::warn!(host, error = %e, "ping unavailable, probe skipped");
            true
        }
    }
}

impl<'e> Session<'e> {
    /// Execute one task to completion.
    pub fn execute(&self, task: &Task) -> TaskStatus {
        if task.is_control() {
            return self.control(task);
        }
        if !self.ctx.cond_active() {
            tracing::trace!(task = %task, "skipped (inactive branch)");
            return TaskStatus::Skip;
        }
        let status = match task.kind {
            TaskKind::Action => self.action(task),
            TaskKind::Check => processor::run_check(&self.ctx, self.correlator.table(), task),
            TaskKind::Command => self.command(task),
            TaskKind::Control => unreachable!("handled above"),
        };
        status.unwrap_or_else(|err| self.fail(task, err))
    }

    fn fail(&self, task: &Task, err: ScriptError) -> TaskStatus {
        let err = if err.line.is_none() {
            err.with_location(task.file.clone(), task.line)
        } else {
            err
        };
        tracing::error!(task = %task, error = %err.message, "task failed");
        self.ctx.logf(&format!("FAIL {}: {}", task, err.message));
        self.ctx.request_stop(err.to_string(), true);
        TaskStatus::Fail
    }

    fn control(&self, task: &Task) -> TaskStatus {
        let ctx = &self.ctx;
        let result = match task.name.as_str() {
            "if" => {
                if !ctx.cond_active() {
                    // Nested in a dead branch: balance the stack, evaluate nothing.
                    ctx.push_cond(false);
                    Ok(())
                } else {
                    Condition::parse_text(&task.params)
                        .and_then(|c| c.eval(&|name: &str| ctx.resolve(name)))
                        .map(|value| {
                            tracing::debug!(expr = %task.params, value, "if");
                            ctx.push_cond(value);
                        })
                }
            }
            "else" if ctx.flip_cond() => Ok(()),
            "endif" if ctx.pop_cond() => Ok(()),
            other => Err(ScriptError::syntax(format!("unbalanced {} at run time", other))),
        };
        match result {
            Ok(()) => TaskStatus::Done,
            Err(e) => self.fail(task, e),
        }
    }

    fn action(&self, task: &Task) -> Result<TaskStatus, ScriptError> {
        let action = self
            .engine
            .actions
            .get(&task.name)
            .ok_or_else(|| ScriptError::unknown_command(&task.name))?;
        let args = if task.params.is_empty() {
            Vec::new()
        } else {
            task.params.split('!').map(|a| self.ctx.substitute(a)).collect()
        };
        let call = ActionCall {
            name: task.name.clone(),
            dest: task.dest.clone(),
            args,
        };
        let env = ActionEnv {
            ctx: &self.ctx,
            streams: &self.correlator,
            externals: &self.engine.externals,
            interactive: self.settings.interactive,
        };
        match action.run(&env, &call)? {
            ActionResult::Ok => Ok(TaskStatus::Done),
            ActionResult::Stop(msg) => {
                self.ctx.request_stop(msg, false);
                Ok(TaskStatus::Done)
            }
        }
    }

    /// Receive timeout for the next exchange
    fn socket_timeout(&self) -> Duration {
        self.ctx
            .var("socktimeout")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.settings.socket_timeout)
    }

    fn command(&self, task: &Task) -> Result<TaskStatus, ScriptError> {
        let ctx = &self.ctx;
        let params = ctx.substitute(&task.params);
        if let Some(name) = ctx.first_unresolved(&params) {
            tracing::error!(command = %task.name, variable = %name, "uninitialized variable");
            ctx.logf(&format!("FAIL {}: uninitialized variable ${}", task.name, name));
            return Ok(TaskStatus::Fail);
        }
        let line = task.render(&params);

        if self.settings.probe && !task.parallel && !reachable(host_of(&task.address)) {
            ctx.logf(&format!("FAIL {}: {} unreachable", task.name, task.address));
            return Err(ScriptError::protocol(format!("{} ({}) is unreachable", task.device, task.address)));
        }

        let timeout = self.socket_timeout();
        let phase = ctx.phase();
        let name = task.name.to_ascii_lowercase();
        let table = self.correlator.table();

        if name == TRAFFIC_RECEIVE_STOP {
            self.correlator.ensure_running(phase);
            let ids = processor::task_stream_ids(&params);
            if !table.wait_for_pairs(&ids, phase, timeout) {
                tracing::warn!(streams = ?ids, "paired send streams still running at timeout");
            }
        } else if table.busy(&task.address) && !table.wait_idle(&task.address, timeout) {
            tracing::warn!(address = %task.address, "send stream still running at timeout");
        }

        let label = ctx.display_name(&task.device);
        ctx.logf(&format!("{} ({}) --> {}", label, task.address, line.trim_end()));

        if name == TRAFFIC_SEND {
            return self.traffic_send(task, &params, &line, timeout);
        }

        let mut response = self.exchange(task, &line, timeout)?;
        if name == ASSOCIATION_POLL {
            let mut attempt = 1;
            while attempt < self.settings.connect_retries
                && Response::parse(&response).value("connected") == Some("0")
            {
                tracing::debug!(attempt, "not associated yet, retrying");
                std::thread::sleep(self.settings.retry_backoff);
                response = self.exchange(task, &line, timeout)?;
                attempt += 1;
            }
        }
        ctx.logf(&format!("{} ({}) <-- {}", label, task.address, response.trim_end()));
        Ok(processor::process_response(ctx, table, task, &params, &response))
    }

    /// Send one line and read until a terminal status, folding a RUNNING
    /// line that shares the read with the terminal one.
    fn exchange(&self, task: &Task, line: &str, timeout: Duration) -> Result<String, ScriptError> {
        self.pool
            .exchange(&task.address, |conn| {
                conn.send(line.as_bytes())?;
                let mut raw = conn.recv(MAX_RESPONSE, timeout)?;
                if processor::awaiting_terminal(&raw) {
                    raw.push_str(&conn.recv(MAX_RESPONSE, timeout)?);
                }
                Ok(processor::strip_running(&raw))
            })
            .map_err(|e| ScriptError::from(e).with_command(task.name.clone()))
    }

    /// Start a stream. Its completion line is collected by the correlator
    /// unless it arrived together with the RUNNING line.
    fn traffic_send(&self, task: &Task, params: &str, line: &str, timeout: Duration) -> Result<TaskStatus, ScriptError> {
        let ctx = &self.ctx;
        let phase = ctx.phase();
        let table = self.correlator.table();
        let ids = processor::task_stream_ids(params);
        table.mark_running(&task.address, &ids, phase);

        let first = self
            .pool
            .exchange(&task.address, |conn| {
                conn.send(line.as_bytes())?;
                let raw = conn.recv(MAX_RESPONSE, timeout)?;
                let rest = processor::strip_running(&raw);
                if !rest.is_empty() && !raw.ends_with('\n') {
                    // Partial completion line: leave it for the correlator.
                    conn.unread(&rest);
                    return Ok(String::new());
                }
                Ok(rest)
            })
            .map_err(|e| ScriptError::from(e).with_command(task.name.clone()))?;

        let label = ctx.display_name(&task.device);
        if first.is_empty() {
            ctx.logf(&format!("{} ({}) <-- status,RUNNING", label, task.address));
            self.pool.watch(&task.address);
            self.correlator.ensure_running(phase);
            return Ok(TaskStatus::Done);
        }
        ctx.logf(&format!("{} ({}) <-- {}", label, task.address, first));
        Ok(processor::process_response(ctx, table, task, params, &first))
    }
}
