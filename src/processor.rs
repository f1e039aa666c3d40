//! Response processing and result checks
//!
//! Every device response passes through [`process_response`] before the
//! next task runs. ERROR and INVALID stop the run unless the script set
//! `donotblock` / `ignore_invalid`; FAIL from a control agent or sniffer
//! stops it too. Scoring commands (`result`, `checkthroughput`,
//! `conditional_pass`) are evaluated by [`run_check`].

use crate::conditions::CompareOp;
use crate::correlator::{StreamInfo, StreamTable, STREAM_ID};
use crate::devices::DeviceClass;
use crate::error::ScriptError;
use crate::scheduler::{Task, TaskStatus};
use crate::symbols::{ConditionalPass, DeviceInfo, RunContext};

/// Terminal status word of a response line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Running,
    Complete,
    Error,
    Invalid,
    Unknown,
}

impl ResponseStatus {
    /// COMPLETE, ERROR and INVALID end an exchange.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Invalid)
    }
}

/// A parsed `status,<word>[,key,value...]` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: ResponseStatus,
    pub fields: Vec<String>,
}

impl Response {
    pub fn parse(text: &str) -> Self {
        let line = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .unwrap_or("");
        let fields: Vec<String> = line.split(',').map(|f| f.trim().to_string()).collect();
        let status = match fields.get(1).map(|s| s.to_ascii_uppercase()).as_deref() {
            Some("RUNNING") => ResponseStatus::Running,
            Some("COMPLETE") => ResponseStatus::Complete,
            Some("ERROR") => ResponseStatus::Error,
            Some("INVALID") => ResponseStatus::Invalid,
            _ => ResponseStatus::Unknown,
        };
        Self { status, fields }
    }

    /// Value following `key` among the key/value pairs after the status.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.fields
            .get(2..)?
            .chunks(2)
            .find(|kv| kv[0].eq_ignore_ascii_case(key))
            .and_then(|kv| kv.get(1))
            .map(String::as_str)
    }

    /// First value after the status pair
    pub fn first_value(&self) -> Option<&str> {
        self.fields.get(3).map(String::as_str)
    }
}

/// Drop a `status,RUNNING` fragment that arrived in the same read as the
/// terminal line. What is left may be empty.
pub fn strip_running(text: &str) -> String {
    text.split(['\r', '\n'])
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| !is_running_line(l))
        .collect::<Vec<_>>()
        .join("\r\n")
}

fn is_running_line(line: &str) -> bool {
    line.trim().to_ascii_uppercase().starts_with("STATUS,RUNNING")
}

/// Whether a first read held a `status,RUNNING` fragment and nothing
/// terminal after it, so the agent still owes the final line.
pub fn awaiting_terminal(raw: &str) -> bool {
    raw.split(['\r', '\n']).any(is_running_line) && !Response::parse(&strip_running(raw)).status.is_terminal()
}

/// Bind a return spec (`key,$var[,key,$var...]` or a lone `$var`) from
/// a response. Returns the keys that were not present.
pub fn bind_returns(ctx: &RunContext, binding: &str, response: &Response) -> Vec<String> {
    let parts: Vec<&str> = binding.split(',').map(str::trim).filter(|p| !p.is_empty()).collect();
    let mut missing = Vec::new();
    if let [var] = parts.as_slice() {
        if var.starts_with('$') {
            match response.first_value() {
                Some(v) => ctx.bind_return(var, v),
                None => missing.push(var.to_string()),
            }
            return missing;
        }
    }
    for kv in parts.chunks(2) {
        let (key, var) = match kv {
            [k, v] if v.starts_with('$') => (*k, *v),
            _ => {
                missing.push(kv.join(","));
                continue;
            }
        };
        match response.value(key) {
            Some(value) => ctx.bind_return(var, value),
            None => missing.push(key.to_string()),
        }
    }
    missing
}

fn stream_ids(params: &str) -> Vec<String> {
    let fields: Vec<&str> = params.split(',').map(str::trim).collect();
    fields
        .chunks(2)
        .find(|kv| kv[0].eq_ignore_ascii_case("streamID"))
        .and_then(|kv| kv.get(1))
        .map(|ids| ids.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Stream ids named in a command's parameters
pub fn task_stream_ids(params: &str) -> Vec<String> {
    stream_ids(params)
}

/// Judge a device response and extract what later tasks need.
pub fn process_response(
    ctx: &RunContext,
    streams: &StreamTable,
    task: &Task,
    params: &str,
    text: &str,
) -> TaskStatus {
    let response = Response::parse(text);
    let upper = text.to_ascii_uppercase();
    let label = ctx.display_name(&task.device);

    if upper.contains("ERROR") || upper.contains("INVALID") {
        if ctx.flag("donotblock") || ctx.flag("ignore_invalid") {
            tracing::warn!(device = %label, command = %task.name, response = %text.trim(), "error response ignored");
            ctx.logf(&format!("{} {}: {} (ignored)", label, task.name, text.trim()));
        } else {
            ctx.request_stop(
                format!("{} {} returned {}", label, task.name, text.trim()),
                true,
            );
            return TaskStatus::Fail;
        }
    }

    if upper.contains("FAIL") && matches!(task.class, Some(DeviceClass::Agent | DeviceClass::Sniffer)) {
        if task.scored {
            ctx.request_stop(format!("{} {} reported FAIL", label, task.name), true);
            return TaskStatus::Fail;
        }
        ctx.logf(&format!("{} {}: FAIL before separator, not scored", label, task.name));
    }

    if let Some(binding) = task.ret.as_deref() {
        for key in bind_returns(ctx, binding, &response) {
            tracing::warn!(command = %task.name, key = %key, "return value missing from response");
        }
    } else if let Some(key) = response.fields.get(STREAM_ID - 1) {
        if key.eq_ignore_ascii_case("streamID") || key.eq_ignore_ascii_case("interfaceID") {
            if let Some(id) = response.first_value() {
                ctx.bind_return(key, id);
            }
        }
    }

    let phase = ctx.phase();
    match task.name.to_ascii_lowercase().as_str() {
        "ca_get_version" | "device_get_info" => {
            let info = DeviceInfo {
                device: label.clone(),
                vendor: response.value("vendor").unwrap_or("").to_string(),
                model: response.value("model").unwrap_or("").to_string(),
                version: response
                    .value("version")
                    .or_else(|| response.value("firmware"))
                    .unwrap_or("")
                    .to_string(),
            };
            tracing::info!(device = %info.device, version = %info.version, "device info");
            ctx.add_device_info(info);
        }
        "traffic_agent_config" => {
            if let Some(id) = response.value("streamID") {
                streams.register(StreamInfo::from_config(id, &task.address, params, phase));
            }
        }
        "traffic_agent_send" | "traffic_agent_receive_stop" => {
            for line in text.lines() {
                streams.absorb(&task.address, line, phase);
            }
        }
        "traffic_stop_ping" => {
            let count = |k: &str| response.value(k).and_then(|v| v.parse::<u64>().ok());
            match (count("sent"), count("replies")) {
                (Some(sent), Some(replies)) if replies > sent => {
                    tracing::warn!(sent, replies, "ping reports more replies than requests");
                    ctx.logf(&format!("ping: {} replies to {} requests", replies, sent));
                }
                (Some(sent), Some(replies)) => {
                    ctx.logf(&format!("ping: {}/{} replies", replies, sent));
                }
                _ => tracing::warn!(response = %text.trim(), "ping counters missing"),
            }
        }
        _ => {}
    }

    TaskStatus::Done
}

/// Throughput in Mbit/s
pub fn throughput_mbps(rx_bytes: u64, duration_secs: f64) -> f64 {
    (rx_bytes as f64 * 8.0) / (1e6 * duration_secs)
}

/// Compare a measured throughput using `>=`, `>` or `<=`.
pub fn evaluate_throughput(actual: f64, cmp: &str, expected: f64) -> Result<bool, ScriptError> {
    let op = match cmp.trim() {
        ">=" => CompareOp::Ge,
        ">" => CompareOp::Gt,
        "<=" => CompareOp::Le,
        other => {
            return Err(ScriptError::syntax(format!(
                "checkthroughput: unsupported comparator '{}'",
                other
            )))
        }
    };
    Ok(op.compare_f64(actual, expected))
}

/// Evaluate a RESULT-CHECK task. Operands are substituted here.
pub fn run_check(ctx: &RunContext, streams: &StreamTable, task: &Task) -> Result<TaskStatus, ScriptError> {
    let get = |key: &str| ctx.substitute(task.data.get(key).map(String::as_str).unwrap_or(""));

    match task.name.as_str() {
        "result" => {
            let value = get("value");
            let pass = value.trim().eq_ignore_ascii_case("PASS");
            let message = get("message");
            ctx.logf(&format!("result {} {}", value.trim().to_ascii_uppercase(), message).trim_end().to_string());
            if task.scored {
                ctx.record_result(pass);
            }
            Ok(TaskStatus::Done)
        }
        "throughput" => {
            let stream = get("stream");
            let duration: f64 = get("duration")
                .trim()
                .parse()
                .ok()
                .filter(|d: &f64| *d > 0.0)
                .ok_or_else(|| ScriptError::syntax("checkthroughput: duration must be a positive number"))?;
            let expected: f64 = get("expected")
                .trim()
                .parse()
                .map_err(|_| ScriptError::syntax("checkthroughput: expected rate is not a number"))?;
            let (pass_tok, fail_tok) = (get("pass"), get("fail"));

            let actual = match streams.received_for(stream.trim(), ctx.phase()) {
                Some(r) => throughput_mbps(r.rx_bytes, duration),
                None => {
                    tracing::warn!(stream = %stream, "no receive result for stream");
                    0.0
                }
            };
            let ok = evaluate_throughput(actual, &get("cmp"), expected)?;
            let token = if ok { pass_tok } else { fail_tok };
            ctx.logf(&format!(
                "throughput stream {}: {:.3} Mbps {} {} -> {}",
                stream.trim(),
                actual,
                get("cmp"),
                expected,
                token
            ));
            if task.scored {
                ctx.record_result(token.trim().eq_ignore_ascii_case("PASS"));
            }
            Ok(TaskStatus::Done)
        }
        "conditional_pass" => {
            let n = |key: &str| {
                get(key)
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| ScriptError::syntax("conditional_pass: operands must be integers"))
            };
            let rule = ConditionalPass {
                required: n("required")?,
                of: n("of")?,
            };
            ctx.set_conditional_pass(rule);
            ctx.logf(&format!("conditional pass: {} of {}", rule.required, rule.of));
            Ok(TaskStatus::Done)
        }
        other => Err(ScriptError::unknown_command(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_list::{CommandList, Tag};
    use crate::devices::Testbed;
    use crate::scheduler::Scheduler;
    use crate::symbols::Verdict;

    fn device_task(name: &str, device: &str, ret: Option<&str>) -> Task {
        let mut tb = Testbed::new();
        tb.insert(device, "127.0.0.1", "9000");
        let mut list = CommandList::new();
        list.push(Tag::DeviceRef, [("name", device)], "t.txt", 1);
        list.push(Tag::CapiCommand, [("name", name), ("params", "")], "t.txt", 1);
        if let Some(r) = ret {
            list.push(Tag::Return, [("binding", r)], "t.txt", 1);
        }
        list.end_group("t.txt", 1);
        let always = |_: &str| true;
        let queue = Scheduler::new(&tb, &always).build(&list).unwrap();
        queue.tasks()[0].clone()
    }

    #[test]
    fn test_strip_running() {
        assert_eq!(
            strip_running("status,RUNNING\r\nstatus,COMPLETE,mac,aa"),
            "status,COMPLETE,mac,aa"
        );
        assert_eq!(strip_running("status,COMPLETE\r\nstatus,RUNNING\r\n"), "status,COMPLETE");
        assert_eq!(strip_running("status,RUNNING \r\n"), "");
    }

    #[test]
    fn test_awaiting_terminal() {
        assert!(awaiting_terminal("status,RUNNING\r\n"));
        assert!(awaiting_terminal("status,RUNNING\r\nstatus,COMP"));
        assert!(!awaiting_terminal("status,RUNNING\r\nstatus,COMPLETE\r\n"));
        // Short terminal replies are complete on their own.
        assert!(!awaiting_terminal("status,ERROR\r\n"));
        assert!(!awaiting_terminal("status,INVALID\r\n"));
        assert!(!awaiting_terminal("status,COMPLETE\r\n"));
    }

    #[test]
    fn test_bind_returns() {
        let ctx = RunContext::new();
        let r = Response::parse("status,COMPLETE,mac,00:11:22:33:44:55,ip,10.0.0.5");
        assert!(bind_returns(&ctx, "mac,$MAC,ip,$IP", &r).is_empty());
        assert_eq!(ctx.resolve("$MAC").as_deref(), Some("00:11:22:33:44:55"));
        assert_eq!(ctx.resolve("IP").as_deref(), Some("10.0.0.5"));
        assert_eq!(bind_returns(&ctx, "rssi,$R", &r), vec!["rssi"]);
        assert!(bind_returns(&ctx, "$FIRST", &r).is_empty());
        assert_eq!(ctx.resolve("FIRST").as_deref(), Some("00:11:22:33:44:55"));
    }

    #[test]
    fn test_error_stops_unless_flagged() {
        let ctx = RunContext::new();
        let table = StreamTable::new();
        let task = device_task("sta_associate", "wfa_control_agent_dut", None);
        assert_eq!(process_response(&ctx, &table, &task, "", "status,ERROR,errorCode,x"), TaskStatus::Fail);
        assert!(ctx.stopped());
        assert_eq!(ctx.tally().verdict(), Verdict::Fail);

        let ctx = RunContext::new();
        ctx.set_var("donotblock", "1");
        assert_eq!(process_response(&ctx, &table, &task, "", "status,INVALID"), TaskStatus::Done);
        assert!(!ctx.stopped());
    }

    #[test]
    fn test_fail_only_stops_agents_and_sniffers() {
        let table = StreamTable::new();
        let ctx = RunContext::new();
        let radius = device_task("dev_send_frame", "wfa_radius", None);
        assert_eq!(process_response(&ctx, &table, &radius, "", "status,COMPLETE,result,FAIL"), TaskStatus::Done);
        assert!(!ctx.stopped());

        let sniffer = device_task("sniffer_check_frame", "wfa_sniffer", None);
        assert_eq!(process_response(&ctx, &table, &sniffer, "", "status,COMPLETE,result,FAIL"), TaskStatus::Fail);
        assert!(ctx.stopped());
    }

    #[test]
    fn test_version_info_captured() {
        let ctx = RunContext::new();
        let table = StreamTable::new();
        let task = device_task("device_get_info", "wfa_control_agent_dut", None);
        process_response(&ctx, &table, &task, "", "status,COMPLETE,vendor,Acme,model,X1,version,2.0");
        let infos = ctx.device_infos();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].vendor, "Acme");
        assert_eq!(infos[0].version, "2.0");
    }

    #[test]
    fn test_stream_config_registers_info() {
        let ctx = RunContext::new();
        let table = StreamTable::new();
        let task = device_task("traffic_agent_config", "wfa_control_agent_dut", None);
        process_response(&ctx, &table, &task, "profile,File,direction,send", "status,COMPLETE,streamID,5");
        let infos = table.infos();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].stream_id, "5");
        assert_eq!(ctx.resolve("streamID").as_deref(), Some("5"));
    }

    #[test]
    fn test_throughput_boundaries() {
        let actual = throughput_mbps(125000, 10.0);
        assert_eq!(actual, 0.1);
        assert!(evaluate_throughput(actual, ">=", 0.1).unwrap());
        assert!(!evaluate_throughput(actual, ">", 0.1).unwrap());
        assert!(evaluate_throughput(actual, "<=", 0.1).unwrap());
        assert!(evaluate_throughput(actual, "=", 0.1).is_err());
    }

    #[test]
    fn test_throughput_check_records_token() {
        let ctx = RunContext::new();
        let table = StreamTable::new();
        ctx.next_phase();
        table.absorb(
            "127.0.0.1:9001",
            "status,COMPLETE,streamID,5,txFrames,0,rxFrames,100,txBytes,0,rxBytes,125000",
            1,
        );
        ctx.set_var("rx", "5");
        let mut task = device_task("sta_x", "wfa_control_agent_dut", None);
        task.kind = crate::scheduler::TaskKind::Check;
        task.name = "throughput".into();
        for (k, v) in [("stream", "$rx"), ("duration", "10"), ("cmp", ">="), ("expected", "0.1"), ("pass", "PASS"), ("fail", "FAIL")] {
            task.data.insert(k, v.to_string());
        }
        run_check(&ctx, &table, &task).unwrap();
        assert_eq!(ctx.tally().passed, 1);

        task.data.insert("cmp", ">".to_string());
        run_check(&ctx, &table, &task).unwrap();
        assert_eq!(ctx.tally().failed, 1);
    }

    #[test]
    fn test_conditional_pass_check() {
        let ctx = RunContext::new();
        let table = StreamTable::new();
        ctx.record_result(false);
        let mut task = device_task("sta_x", "wfa_control_agent_dut", None);
        task.name = "conditional_pass".into();
        task.data.insert("required", "1".to_string());
        task.data.insert("of", "2".to_string());
        run_check(&ctx, &table, &task).unwrap();
        ctx.record_result(true);
        ctx.record_result(false);
        assert_eq!(ctx.tally().verdict(), Verdict::Pass);
    }
}
